//! Checkpointed fetch log.
//!
//! A nested fetch (pages of items, each item enriched by further requests,
//! some of them shared between items) is written into the archive as one
//! flat ordered log:
//!
//! ```text
//! record(page 1)
//!   record(enrichment a) record(enrichment b)   checkpoint(item 1)
//!   record(enrichment c)                        checkpoint(item 2)
//! checkpoint(page)
//! record(page 2)
//! ...
//! ```
//!
//! Enrichment targets already resolved in this run are not fetched again,
//! so their records appear only once. The [`CheckpointReader`] walks the
//! log with the same adapter hooks and the same per-run cache, and rebuilds
//! identical outputs without network access. It reads from the replaying
//! session's cursor, so plain requests replayed before it, and earlier
//! readers, have already moved past their own entries. Any structural
//! mismatch is [`FetchError::ArchiveExhausted`].

use std::collections::{HashMap, VecDeque};

use harvest_core::HttpResponse;
use tracing::{debug, trace};

use crate::archive::{ArchiveEntry, ArchivedOutcome, Checkpoint};
use crate::error::FetchError;
use crate::pagination::{PageRequest, Paginate};
use crate::session::Session;

// ============================================================================
// Adapter Hooks
// ============================================================================

/// How long a resolved enrichment target is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Until the end of the current page.
    Page,
    /// Until the end of the run.
    Run,
}

/// A sub-request that enriches an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    /// Identifier of the target; fetched at most once while cached.
    pub id: String,
    /// Cache lifetime.
    pub scope: Scope,
    /// Request fetching the target.
    pub request: PageRequest,
}

impl Enrichment {
    /// A target cached until the end of the page.
    pub fn page(id: impl Into<String>, request: PageRequest) -> Self {
        Self {
            id: id.into(),
            scope: Scope::Page,
            request,
        }
    }

    /// A target cached for the whole run (e.g. a user profile).
    pub fn run(id: impl Into<String>, request: PageRequest) -> Self {
        Self {
            id: id.into(),
            scope: Scope::Run,
            request,
        }
    }
}

/// Adapter hooks describing one nested fetch.
pub trait NestedFetch {
    /// Primary item parsed from a page.
    type Item;
    /// Resolved enrichment target.
    type Target;
    /// Fully built item.
    type Output;

    /// Parses the items of a page.
    fn items(&self, page: &HttpResponse) -> Result<Vec<Self::Item>, FetchError>;

    /// Identifier written into the item checkpoint.
    fn item_id(&self, item: &Self::Item) -> String;

    /// Sub-requests this item needs, in order.
    fn enrichments(&self, item: &Self::Item) -> Vec<Enrichment>;

    /// Turns an enrichment outcome into a target.
    ///
    /// Gets the transport error too, so adapters can treat e.g. a 404 as
    /// "absent" rather than fail the run.
    fn resolve(&self, id: &str, outcome: ArchivedOutcome) -> Result<Self::Target, FetchError>;

    /// Builds the output from an item and the resolved targets.
    fn build(
        &self,
        item: Self::Item,
        targets: &EnrichmentCache<Self::Target>,
    ) -> Result<Self::Output, FetchError>;

    /// Returns false to stop the run after this output.
    fn keep_going(&self, _output: &Self::Output) -> bool {
        true
    }
}

// ============================================================================
// Enrichment Cache
// ============================================================================

/// Resolved targets of one run.
#[derive(Debug)]
pub struct EnrichmentCache<T> {
    page: HashMap<String, T>,
    run: HashMap<String, T>,
}

impl<T> Default for EnrichmentCache<T> {
    fn default() -> Self {
        Self {
            page: HashMap::new(),
            run: HashMap::new(),
        }
    }
}

impl<T> EnrichmentCache<T> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a resolved target.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.page.get(id).or_else(|| self.run.get(id))
    }

    /// Returns a resolved target, or fails as an incomplete archive.
    pub fn require(&self, id: &str) -> Result<&T, FetchError> {
        self.get(id)
            .ok_or_else(|| FetchError::ArchiveExhausted(format!("enrichment {id:?} was never resolved")))
    }

    /// Returns true if `id` is resolved.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    fn insert(&mut self, scope: Scope, id: String, target: T) {
        match scope {
            Scope::Page => self.page.insert(id, target),
            Scope::Run => self.run.insert(id, target),
        };
    }

    fn clear_page(&mut self) {
        self.page.clear();
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Runs a nested fetch live, checkpointing it when the session records.
pub struct CheckpointWriter<'a, F: NestedFetch> {
    session: &'a mut Session,
    fetch: F,
    paginate: Box<dyn Paginate + 'a>,
    next_page: Option<PageRequest>,
    pending: VecDeque<F::Item>,
    cache: EnrichmentCache<F::Target>,
    done: bool,
}

impl<'a, F: NestedFetch> CheckpointWriter<'a, F> {
    /// Creates a writer. The session must not be replaying.
    pub fn new<P>(
        session: &'a mut Session,
        first: PageRequest,
        paginate: P,
        fetch: F,
    ) -> Result<Self, FetchError>
    where
        P: Paginate + 'a,
    {
        if session.is_replaying() {
            return Err(FetchError::InvalidConfig(
                "use a CheckpointReader to replay a fetch log".to_string(),
            ));
        }
        Ok(Self {
            session,
            fetch,
            paginate: Box::new(paginate),
            next_page: Some(first),
            pending: VecDeque::new(),
            cache: EnrichmentCache::new(),
            done: false,
        })
    }

    /// Returns the next output, `Ok(None)` at the end. Errors end the run.
    pub async fn next(&mut self) -> Result<Option<F::Output>, FetchError> {
        if self.done {
            return Ok(None);
        }
        let result = self.advance().await;
        if !matches!(result, Ok(Some(_))) {
            self.done = true;
        }
        result
    }

    /// Drains the run into a vector.
    pub async fn collect(mut self) -> Result<Vec<F::Output>, FetchError> {
        let mut outputs = Vec::new();
        while let Some(output) = self.next().await? {
            outputs.push(output);
        }
        Ok(outputs)
    }

    async fn advance(&mut self) -> Result<Option<F::Output>, FetchError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                let output = self.enrich(item).await?;

                if self.pending.is_empty() {
                    self.end_page()?;
                }
                if !self.fetch.keep_going(&output) {
                    debug!("Adapter stopped the run");
                    if !self.pending.is_empty() {
                        self.pending.clear();
                        self.end_page()?;
                    }
                    self.next_page = None;
                    self.done = true;
                }
                return Ok(Some(output));
            }

            let Some(request) = self.next_page.take() else {
                return Ok(None);
            };

            let page = self.session.send_page(&request).await?;
            self.next_page = self.paginate.next_request(&request, &page);

            let items = self.fetch.items(&page)?;
            trace!(items = items.len(), "Page fetched");
            if items.is_empty() {
                self.end_page()?;
                continue;
            }
            self.pending.extend(items);
        }
    }

    async fn enrich(&mut self, item: F::Item) -> Result<F::Output, FetchError> {
        for enrichment in self.fetch.enrichments(&item) {
            if self.cache.contains(&enrichment.id) {
                trace!(id = %enrichment.id, "Enrichment cached");
                continue;
            }
            let outcome = match self.session.send_page(&enrichment.request).await {
                Ok(response) => Ok(response),
                Err(FetchError::Transport(err)) => Err(err),
                Err(other) => return Err(other),
            };
            let target = self.fetch.resolve(&enrichment.id, outcome)?;
            self.cache.insert(enrichment.scope, enrichment.id, target);
        }

        self.session
            .checkpoint(Checkpoint::Item(self.fetch.item_id(&item)))?;
        self.fetch.build(item, &self.cache)
    }

    fn end_page(&mut self) -> Result<(), FetchError> {
        self.session.checkpoint(Checkpoint::Page)?;
        self.cache.clear_page();
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Rebuilds a recorded nested fetch from the archive alone.
pub struct CheckpointReader<'a, F: NestedFetch> {
    session: &'a mut Session,
    fetch: F,
    paginate: Box<dyn Paginate + 'a>,
    next_page: Option<PageRequest>,
    pending: VecDeque<F::Item>,
    cache: EnrichmentCache<F::Target>,
    done: bool,
}

impl<'a, F: NestedFetch> CheckpointReader<'a, F> {
    /// Creates a reader starting at the session's replay cursor.
    pub fn new<P>(
        session: &'a mut Session,
        first: PageRequest,
        paginate: P,
        fetch: F,
    ) -> Result<Self, FetchError>
    where
        P: Paginate + 'a,
    {
        if !session.is_replaying() {
            return Err(FetchError::InvalidConfig(
                "a CheckpointReader needs a replaying session".to_string(),
            ));
        }
        Ok(Self {
            session,
            fetch,
            paginate: Box::new(paginate),
            next_page: Some(first),
            pending: VecDeque::new(),
            cache: EnrichmentCache::new(),
            done: false,
        })
    }

    fn advance(&mut self) -> Result<Option<F::Output>, FetchError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                let output = self.rebuild(item)?;

                if self.pending.is_empty() {
                    self.expect_checkpoint(&Checkpoint::Page)?;
                    self.cache.clear_page();
                }
                if !self.fetch.keep_going(&output) {
                    if !self.pending.is_empty() {
                        self.pending.clear();
                        self.expect_checkpoint(&Checkpoint::Page)?;
                    }
                    self.next_page = None;
                    self.done = true;
                }
                return Ok(Some(output));
            }

            let Some(request) = self.next_page.take() else {
                debug!("Fetch log read to the end of the run");
                return Ok(None);
            };

            let page = self.expect_record(&request)?.map_err(FetchError::Transport)?;
            self.next_page = self.paginate.next_request(&request, &page);

            let items = self.fetch.items(&page)?;
            if items.is_empty() {
                self.expect_checkpoint(&Checkpoint::Page)?;
                self.cache.clear_page();
                continue;
            }
            self.pending.extend(items);
        }
    }

    fn rebuild(&mut self, item: F::Item) -> Result<F::Output, FetchError> {
        for enrichment in self.fetch.enrichments(&item) {
            if self.cache.contains(&enrichment.id) {
                continue;
            }
            let outcome = self.expect_record(&enrichment.request)?;
            let target = self.fetch.resolve(&enrichment.id, outcome)?;
            self.cache.insert(enrichment.scope, enrichment.id, target);
        }

        self.expect_checkpoint(&Checkpoint::Item(self.fetch.item_id(&item)))?;
        self.fetch.build(item, &self.cache)
    }

    fn expect_record(&mut self, request: &PageRequest) -> Result<ArchivedOutcome, FetchError> {
        let expected = self.session.fingerprint_for(request)?;
        match self.session.next_archived_entry()? {
            Some(ArchiveEntry::Record {
                fingerprint,
                outcome,
            }) => {
                if fingerprint.hashcode() == expected.hashcode() {
                    Ok(outcome)
                } else {
                    Err(FetchError::ArchiveExhausted(format!(
                        "expected record for {} {}, found {} {}",
                        expected.method, expected.url, fingerprint.method, fingerprint.url
                    )))
                }
            }
            Some(ArchiveEntry::Checkpoint(checkpoint)) => Err(FetchError::ArchiveExhausted(format!(
                "expected record for {} {}, found checkpoint {checkpoint:?}",
                expected.method, expected.url
            ))),
            None => Err(FetchError::ArchiveExhausted(format!(
                "archive ended before record for {} {}",
                expected.method, expected.url
            ))),
        }
    }

    fn expect_checkpoint(&mut self, expected: &Checkpoint) -> Result<(), FetchError> {
        match self.session.next_archived_entry()? {
            Some(ArchiveEntry::Checkpoint(found)) if found == *expected => Ok(()),
            Some(ArchiveEntry::Checkpoint(found)) => Err(FetchError::ArchiveExhausted(format!(
                "expected checkpoint {expected:?}, found {found:?}"
            ))),
            Some(ArchiveEntry::Record { fingerprint, .. }) => {
                Err(FetchError::ArchiveExhausted(format!(
                    "expected checkpoint {expected:?}, found record for {}",
                    fingerprint.url
                )))
            }
            None => Err(FetchError::ArchiveExhausted(format!(
                "archive ended before checkpoint {expected:?}"
            ))),
        }
    }
}

impl<F: NestedFetch> Iterator for CheckpointReader<'_, F> {
    type Item = Result<F::Output, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(output)) => Some(Ok(output)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

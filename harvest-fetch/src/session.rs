//! The fetch session.
//!
//! A [`Session`] binds one origin to a transport, a credential pool, a rate
//! limiter and, optionally, an archive. Adapters call [`Session::request`]
//! and never see the parts.
//!
//! Requests are fingerprinted as the adapter built them, after sanitization
//! and before the active credential is attached. Rotating credentials
//! therefore never changes a fingerprint. Outcomes pass through the same
//! sanitizer before they are archived, so secrets never reach the archive.
//!
//! A replaying session keeps one cursor over the archived log. Plain
//! requests step over their own records and a
//! [`CheckpointReader`](crate::fetch_log::CheckpointReader) consumes from
//! wherever the cursor stands.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, Stream};
use harvest_core::{Fingerprint, Headers, HttpRequest, HttpResponse, Method, QuotaState, Secret};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::archive::{Archive, ArchiveEntry, Checkpoint};
use crate::config::{AuthScheme, SessionConfig};
use crate::credentials::{
    AssertionMinter, Credential, CredentialPool, Installation, QuotaProber,
};
use crate::error::{FetchError, TransportError};
use crate::pagination::{PageRequest, Paginate};
use crate::ratelimit::RateLimiter;
use crate::sanitize::{IdentitySanitizer, Sanitizer};
use crate::transport::{HttpTransport, Transport};

// ============================================================================
// Mode
// ============================================================================

/// Whether the session records, replays, or does neither.
pub enum SessionMode {
    /// Live requests, nothing archived.
    Live,
    /// Live requests, every outcome archived.
    Record(Box<dyn Archive>),
    /// No network; every outcome served from the archive.
    Replay(Box<dyn Archive>),
}

impl SessionMode {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Record(_) => "record",
            Self::Replay(_) => "replay",
        }
    }
}

impl std::fmt::Debug for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Session
// ============================================================================

/// One fetch run against one origin.
pub struct Session {
    base_url: String,
    transport: Arc<dyn Transport>,
    pool: CredentialPool,
    limiter: RateLimiter,
    mode: SessionMode,
    sanitizer: Arc<dyn Sanitizer>,
    auth: AuthScheme,
    status_path: Option<String>,
    default_headers: Headers,
    pool_ready: bool,
    replay_log: Option<VecDeque<ArchiveEntry>>,
}

impl Session {
    /// Creates a builder for an origin.
    pub fn builder(base_url: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(base_url)
    }

    /// Builds a session from configuration.
    pub fn from_config(config: &SessionConfig, mode: SessionMode) -> Result<Self, FetchError> {
        config.validate()?;

        let transport = HttpTransport::builder()
            .policy(config.retry.clone())
            .timeout(config.timeout)
            .max_redirects(config.max_redirects)
            .ssl_verify(config.ssl_verify)
            .build()?;

        let mut credentials: Vec<Credential> = config
            .tokens
            .iter()
            .cloned()
            .map(Credential::static_token)
            .collect();

        if let Some(app) = &config.app {
            let installation = match (app.installation_id, &app.account) {
                (Some(id), _) => Installation::Id(id),
                (None, Some(account)) => Installation::Account(account.clone()),
                (None, None) => {
                    return Err(FetchError::InvalidConfig(
                        "app credentials need installation_id or account".to_string(),
                    ));
                }
            };
            let minter = AssertionMinter::from_pem_file(
                app.api_url.clone().unwrap_or_else(|| config.base_url.clone()),
                app.app_id.clone(),
                Path::new(&app.private_key_path),
                installation,
            )?;
            credentials.push(Credential::minted(Arc::new(minter)));
        }

        let limiter = RateLimiter::new(config.min_rate_to_sleep, config.sleep_for_quota)
            .with_profile(Arc::new(config.rate_limit.clone()));

        let mut builder = Session::builder(config.base_url.clone())
            .transport(Arc::new(transport))
            .pool(CredentialPool::new(credentials).with_usage_margin(config.usage_margin))
            .rate_limiter(limiter)
            .auth(config.auth.clone())
            .mode(mode);
        if let Some(path) = &config.status_path {
            builder = builder.status_path(path.clone());
        }
        builder.build()
    }

    /// Base URL of the origin.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The session mode.
    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    /// Returns true when serving from an archive.
    pub fn is_replaying(&self) -> bool {
        matches!(self.mode, SessionMode::Replay(_))
    }

    /// The rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The credential pool.
    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Ends the session, handing back the archive it used.
    pub fn into_archive(self) -> Option<Box<dyn Archive>> {
        match self.mode {
            SessionMode::Live => None,
            SessionMode::Record(archive) | SessionMode::Replay(archive) => Some(archive),
        }
    }

    /// Issues one logical request.
    ///
    /// In replay mode the outcome comes from the archive, including archived
    /// failures. Live failures are archived before they are returned, and
    /// quota headers on error statuses are observed like any other.
    #[instrument(skip(self, query, body), fields(mode = self.mode.name()))]
    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&str>,
    ) -> Result<HttpResponse, FetchError> {
        let request = self.build_request(method, path, query, body)?;
        let fingerprint = self.fingerprint(&request);

        if let SessionMode::Replay(archive) = &self.mode {
            debug!(url = %fingerprint.url, "Replaying from archive");
            let outcome = archive.replay(&fingerprint)?;
            self.step_over(&fingerprint)?;
            return outcome.map_err(FetchError::Transport);
        }

        self.ensure_pool_ready().await?;
        self.limiter.gate().await?;

        let wire = match self.pool.active_secret().await? {
            Some(secret) => authorize(request, &self.auth, &secret)?,
            None => request,
        };

        let outcome = self.transport.send(&wire).await;

        if let SessionMode::Record(archive) = &mut self.mode {
            archive.record(fingerprint, self.sanitizer.sanitize_outcome(outcome.clone()))?;
        }

        match outcome {
            Ok(response) => {
                self.after_response(&response.headers).await?;
                Ok(response)
            }
            Err(err) => {
                if let TransportError::HttpStatus { status, headers, .. } = &err {
                    if let Err(quota_err) = self.after_response(headers).await {
                        warn!(status, error = %quota_err, "Could not act on quota of failed request");
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Sends a GET request.
    pub async fn get(&mut self, path: &str, query: &[(&str, &str)]) -> Result<HttpResponse, FetchError> {
        self.request(Method::Get, path, query, None).await
    }

    /// Sends a page request.
    pub async fn send_page(&mut self, page: &PageRequest) -> Result<HttpResponse, FetchError> {
        let query: Vec<(&str, &str)> = page
            .query
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        self.request(page.method, &page.path, &query, page.body.as_deref())
            .await
    }

    /// Writes a checkpoint when recording.
    ///
    /// Live sessions ignore checkpoints; replaying sessions cannot write.
    pub fn checkpoint(&mut self, checkpoint: Checkpoint) -> Result<(), FetchError> {
        match &mut self.mode {
            SessionMode::Record(archive) => Ok(archive.checkpoint(checkpoint)?),
            SessionMode::Live => Ok(()),
            SessionMode::Replay(_) => Err(FetchError::InvalidConfig(
                "cannot write checkpoints while replaying".to_string(),
            )),
        }
    }

    /// Takes the entry under the replay cursor. `Ok(None)` past the end.
    pub(crate) fn next_archived_entry(&mut self) -> Result<Option<ArchiveEntry>, FetchError> {
        Ok(self.replay_log()?.pop_front())
    }

    /// Archived log from the replay cursor on, loaded on first use.
    fn replay_log(&mut self) -> Result<&mut VecDeque<ArchiveEntry>, FetchError> {
        let SessionMode::Replay(archive) = &self.mode else {
            return Err(FetchError::InvalidConfig(
                "archived entries are only readable while replaying".to_string(),
            ));
        };
        if self.replay_log.is_none() {
            self.replay_log = Some(archive.entries()?.into());
        }
        Ok(self.replay_log.get_or_insert_with(VecDeque::new))
    }

    /// Moves the replay cursor past `fingerprint` if it is the next record.
    ///
    /// Requests replayed out of order are still served by lookup and leave
    /// the cursor where it is.
    fn step_over(&mut self, fingerprint: &Fingerprint) -> Result<(), FetchError> {
        let log = self.replay_log()?;
        let is_next = matches!(
            log.front(),
            Some(ArchiveEntry::Record { fingerprint: next, .. }) if next.hashcode() == fingerprint.hashcode()
        );
        if is_next {
            log.pop_front();
        }
        Ok(())
    }

    /// Fingerprint the archive holds for a page request.
    pub fn fingerprint_for(&self, page: &PageRequest) -> Result<Fingerprint, FetchError> {
        let query: Vec<(&str, &str)> = page
            .query
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        let request = self.build_request(page.method, &page.path, &query, page.body.as_deref())?;
        Ok(self.fingerprint(&request))
    }

    /// Lazily fetches the pages of a list endpoint.
    pub fn record_page<'a, P>(&'a mut self, first: PageRequest, paginate: P) -> Pages<'a>
    where
        P: Paginate + 'a,
    {
        Pages {
            session: self,
            paginate: Box::new(paginate),
            next: Some(first),
            stop: None,
        }
    }

    /// Runs credential selection before the first live request.
    async fn ensure_pool_ready(&mut self) -> Result<(), FetchError> {
        if self.pool_ready {
            return Ok(());
        }
        if !self.pool.is_empty() {
            if let Some(quota) = self.select_best().await? {
                self.limiter.load(quota);
            }
        }
        self.pool_ready = true;
        Ok(())
    }

    async fn select_best(&mut self) -> Result<Option<QuotaState>, FetchError> {
        let status_url = self.status_url()?;
        let prober = StatusProber {
            transport: self.transport.as_ref(),
            url: status_url,
            auth: &self.auth,
            limiter: &self.limiter,
        };
        self.pool.select_best(&prober).await
    }

    async fn after_response(&mut self, headers: &Headers) -> Result<(), FetchError> {
        let quota = self.limiter.observe(headers);
        self.pool.record_quota(quota);

        let floor = self.limiter.floor();
        if self.pool.should_switch(quota.remaining, floor) {
            debug!(remaining = ?quota.remaining, "Re-evaluating credentials");
            if let Some(fresh) = self.select_best().await? {
                self.limiter.load(fresh);
            }
        } else if self.pool.needs_refresh(quota.remaining, floor) {
            info!("Only credential at quota floor, minting a new one");
            if let Some(secret) = self.pool.refresh_active().await? {
                let status_url = self.status_url()?;
                let prober = StatusProber {
                    transport: self.transport.as_ref(),
                    url: status_url,
                    auth: &self.auth,
                    limiter: &self.limiter,
                };
                let fresh = prober.probe(&secret).await.unwrap_or_else(|err| {
                    warn!(error = %err, "Quota probe failed after refresh");
                    QuotaState::unknown()
                });
                self.pool.record_quota(fresh);
                self.limiter.load(fresh);
            }
        }
        Ok(())
    }

    fn status_url(&self) -> Result<Option<String>, FetchError> {
        self.status_path
            .as_deref()
            .map(|path| self.resolve_url(path, &[]))
            .transpose()
    }

    fn resolve_url(&self, path: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let joined = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.is_empty() {
            self.base_url.clone()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };

        if query.is_empty() {
            return Ok(joined);
        }

        let mut url = Url::parse(&joined).map_err(|e| TransportError::InvalidRequest {
            message: format!("invalid URL {joined:?}: {e}"),
        })?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url.to_string())
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&str>,
    ) -> Result<HttpRequest, FetchError> {
        let mut headers = self.default_headers.clone();
        if body.is_some() && !headers.contains_key("content-type") {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        Ok(HttpRequest {
            method,
            url: self.resolve_url(path, query)?,
            headers,
            body: body.map(str::to_string),
        })
    }

    fn fingerprint(&self, request: &HttpRequest) -> Fingerprint {
        let (url, headers, body) = self.sanitizer.sanitize(
            request.url.clone(),
            request.headers.clone(),
            request.body.clone(),
        );
        Fingerprint::new(request.method, url, headers, body)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.base_url)
            .field("mode", &self.mode)
            .field("pool", &self.pool)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

/// Attaches a credential to a wire request.
fn authorize(
    mut request: HttpRequest,
    auth: &AuthScheme,
    secret: &Secret,
) -> Result<HttpRequest, FetchError> {
    match auth {
        AuthScheme::Header { name, prefix } => {
            Ok(request.with_header(name, format!("{prefix}{}", secret.expose())))
        }
        AuthScheme::QueryParam { name } => {
            let mut url = Url::parse(&request.url).map_err(|e| TransportError::InvalidRequest {
                message: format!("invalid URL: {e}"),
            })?;
            url.query_pairs_mut().append_pair(name, secret.expose());
            request.url = url.to_string();
            Ok(request)
        }
    }
}

// ============================================================================
// Status Probe
// ============================================================================

/// Reads quota from the origin's status endpoint, bypassing the archive.
struct StatusProber<'a> {
    transport: &'a dyn Transport,
    url: Option<String>,
    auth: &'a AuthScheme,
    limiter: &'a RateLimiter,
}

#[async_trait]
impl QuotaProber for StatusProber<'_> {
    async fn probe(&self, secret: &Secret) -> Result<QuotaState, FetchError> {
        let Some(url) = &self.url else {
            return Ok(QuotaState::unknown());
        };
        let request = authorize(HttpRequest::get(url.clone()), self.auth, secret)?;
        let response = self.transport.send(&request).await?;
        Ok(self.limiter.profile().read(&response.headers, Utc::now()))
    }
}

// ============================================================================
// Pages
// ============================================================================

/// A lazy, finite, non-restartable sequence of raw pages.
pub struct Pages<'a> {
    session: &'a mut Session,
    paginate: Box<dyn Paginate + 'a>,
    next: Option<PageRequest>,
    stop: Option<Box<dyn FnMut(&HttpResponse) -> bool + Send + 'a>>,
}

impl<'a> Pages<'a> {
    /// Ends the sequence after the first page for which `predicate` holds.
    ///
    /// That page is still returned.
    pub fn stop_after<F>(mut self, predicate: F) -> Self
    where
        F: FnMut(&HttpResponse) -> bool + Send + 'a,
    {
        self.stop = Some(Box::new(predicate));
        self
    }

    /// Fetches the next page. `Ok(None)` once the sequence is over.
    ///
    /// An error also ends the sequence.
    pub async fn next(&mut self) -> Result<Option<HttpResponse>, FetchError> {
        let Some(request) = self.next.take() else {
            return Ok(None);
        };

        let page = self.session.send_page(&request).await?;

        let stop = self.stop.as_mut().is_some_and(|predicate| predicate(&page));
        if stop {
            debug!("Stop predicate matched, ending pagination");
        } else {
            self.next = self.paginate.next_request(&request, &page);
        }
        Ok(Some(page))
    }

    /// Converts into a stream of pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<HttpResponse, FetchError>> + 'a {
        stream::unfold(self, |mut pages| async move {
            match pages.next().await {
                Ok(Some(page)) => Some((Ok(page), pages)),
                Ok(None) => None,
                Err(err) => Some((Err(err), pages)),
            }
        })
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Session`].
pub struct SessionBuilder {
    base_url: String,
    transport: Option<Arc<dyn Transport>>,
    pool: CredentialPool,
    limiter: RateLimiter,
    mode: SessionMode,
    sanitizer: Arc<dyn Sanitizer>,
    auth: AuthScheme,
    status_path: Option<String>,
    default_headers: Headers,
}

impl SessionBuilder {
    /// Creates a builder with an anonymous pool and no archive.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            transport: None,
            pool: CredentialPool::anonymous(),
            limiter: RateLimiter::default(),
            mode: SessionMode::Live,
            sanitizer: Arc::new(IdentitySanitizer),
            auth: AuthScheme::default(),
            status_path: None,
            default_headers: Headers::new(),
        }
    }

    /// Sets the transport. Defaults to [`HttpTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the credential pool.
    pub fn pool(mut self, pool: CredentialPool) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the rate limiter.
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Sets the mode.
    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Records every exchange into `archive`.
    pub fn record(self, archive: Box<dyn Archive>) -> Self {
        self.mode(SessionMode::Record(archive))
    }

    /// Serves every exchange from `archive`.
    pub fn replay(self, archive: Box<dyn Archive>) -> Self {
        self.mode(SessionMode::Replay(archive))
    }

    /// Sets the sanitizer.
    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Sets how credentials are attached.
    pub fn auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the quota status endpoint.
    pub fn status_path(mut self, path: impl Into<String>) -> Self {
        self.status_path = Some(path.into());
        self
    }

    /// Adds a header sent with every request. Part of the fingerprint.
    pub fn default_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.default_headers
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Builds the session.
    pub fn build(self) -> Result<Session, FetchError> {
        Url::parse(&self.base_url).map_err(|e| {
            FetchError::InvalidConfig(format!("invalid base_url {:?}: {e}", self.base_url))
        })?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };

        info!(base_url = %self.base_url, mode = self.mode.name(), credentials = self.pool.len(), "Session created");

        Ok(Session {
            base_url: self.base_url,
            transport,
            pool: self.pool,
            limiter: self.limiter,
            mode: self.mode,
            sanitizer: self.sanitizer,
            auth: self.auth,
            status_path: self.status_path,
            default_headers: self.default_headers,
            pool_ready: false,
            replay_log: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::builder("https://api.test/v3/")
            .transport(Arc::new(HttpTransport::new().unwrap()))
            .default_header("Accept", "application/json")
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolve_url() {
        let session = session();
        assert_eq!(session.resolve_url("/repos/a/b", &[]).unwrap(), "https://api.test/v3/repos/a/b");
        assert_eq!(
            session.resolve_url("issues", &[("state", "all"), ("page", "2")]).unwrap(),
            "https://api.test/v3/issues?state=all&page=2"
        );
        assert_eq!(
            session.resolve_url("https://other.test/x?page=3", &[]).unwrap(),
            "https://other.test/x?page=3"
        );
    }

    #[test]
    fn test_fingerprint_excludes_credentials() {
        let session = session();
        let request = session.build_request(Method::Get, "user", &[], None).unwrap();
        let before = session.fingerprint(&request);

        let wire = authorize(request.clone(), &AuthScheme::bearer(), &Secret::new("ghp_a")).unwrap();
        assert_eq!(wire.headers.get("authorization").map(String::as_str), Some("Bearer ghp_a"));
        assert_eq!(session.fingerprint(&request).hashcode(), before.hashcode());
        assert!(!serde_json::to_string(&before).unwrap().contains("ghp_a"));
    }

    #[test]
    fn test_query_param_auth() {
        let request = HttpRequest::get("https://api.test/items?page=1");
        let wire = authorize(
            request,
            &AuthScheme::QueryParam {
                name: "access_token".to_string(),
            },
            &Secret::new("tok"),
        )
        .unwrap();
        assert_eq!(wire.url, "https://api.test/items?page=1&access_token=tok");
    }

    #[test]
    fn test_checkpoint_rejected_while_replaying() {
        let mut session = Session::builder("https://api.test")
            .transport(Arc::new(HttpTransport::new().unwrap()))
            .replay(Box::new(crate::archive::MemoryArchive::new()))
            .build()
            .unwrap();
        assert!(session.checkpoint(Checkpoint::Page).is_err());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            Session::builder("not a url").build(),
            Err(FetchError::InvalidConfig(_))
        ));
    }
}

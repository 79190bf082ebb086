//! Checkpointed nested fetches: write live, rebuild from the archive alone.

mod common;

use std::sync::Arc;

use common::{FnTransport, json, not_found, path_of};
use harvest_core::{HttpRequest, HttpResponse};
use harvest_fetch::{
    Archive, ArchiveEntry, ArchivedOutcome, Checkpoint, CheckpointReader, CheckpointWriter,
    Enrichment, EnrichmentCache, ErrorKind, FetchError, LinkHeader, MemoryArchive, NestedFetch,
    PageRequest, Session, TransportError,
};
use serde_json::{Value, json};

const BASE: &str = "https://api.test";

fn origin(request: &HttpRequest) -> Result<HttpResponse, TransportError> {
    let path = path_of(&request.url).trim_start_matches(BASE);
    match path {
        "/issues" if request.url.contains("page=2") => Ok(json(200, json!([{"number": 3, "user": "alice"}]))),
        "/issues" => Ok(json(
            200,
            json!([{"number": 1, "user": "alice"}, {"number": 2, "user": "bob"}]),
        )
        .with_header("Link", "<https://api.test/issues?page=2>; rel=\"next\"")),
        "/issues/1/comments" => Ok(json(200, json!([{"body": "first"}, {"body": "+1"}]))),
        "/issues/2/comments" => Ok(json(200, json!([]))),
        "/issues/3/comments" => Ok(json(200, json!([{"body": "dup of #1"}]))),
        "/users/alice" => Ok(json(200, json!({"login": "alice", "name": "Alice"}))),
        "/users/bob" => Err(not_found()),
        "/repo" => Ok(json(200, json!({"full_name": "chaoss/grimoirelab", "open_issues": 3}))),
        _ => Err(not_found()),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Issue {
    number: u64,
    author: Option<String>,
    comments: Vec<String>,
}

struct Issues {
    stop_at: Option<u64>,
}

impl NestedFetch for Issues {
    type Item = Value;
    type Target = Option<Value>;
    type Output = Issue;

    fn items(&self, page: &HttpResponse) -> Result<Vec<Value>, FetchError> {
        Ok(page.json()?)
    }

    fn item_id(&self, item: &Value) -> String {
        item["number"].to_string()
    }

    fn enrichments(&self, item: &Value) -> Vec<Enrichment> {
        let number = &item["number"];
        let user = item["user"].as_str().unwrap_or_default();
        vec![
            Enrichment::page(
                format!("comments-{number}"),
                PageRequest::get(format!("issues/{number}/comments")),
            ),
            Enrichment::run(format!("user-{user}"), PageRequest::get(format!("users/{user}"))),
        ]
    }

    fn resolve(&self, _id: &str, outcome: ArchivedOutcome) -> Result<Option<Value>, FetchError> {
        match outcome {
            Ok(response) => Ok(Some(response.json()?)),
            Err(TransportError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn build(&self, item: Value, targets: &EnrichmentCache<Option<Value>>) -> Result<Issue, FetchError> {
        let number = item["number"].as_u64().unwrap_or_default();
        let user = item["user"].as_str().unwrap_or_default();

        let comments = targets
            .require(&format!("comments-{number}"))?
            .as_ref()
            .and_then(Value::as_array)
            .map(|comments| {
                comments
                    .iter()
                    .filter_map(|c| c["body"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let author = targets
            .require(&format!("user-{user}"))?
            .as_ref()
            .and_then(|u| u["name"].as_str().map(str::to_string));

        Ok(Issue {
            number,
            author,
            comments,
        })
    }

    fn keep_going(&self, output: &Issue) -> bool {
        self.stop_at != Some(output.number)
    }
}

async fn record(stop_at: Option<u64>) -> (Vec<Issue>, Vec<ArchiveEntry>, Arc<FnTransport>) {
    let transport = FnTransport::new(origin);
    let mut session = Session::builder(BASE)
        .transport(transport.clone())
        .record(Box::new(MemoryArchive::new()))
        .build()
        .unwrap();

    let issues = CheckpointWriter::new(
        &mut session,
        PageRequest::get("issues"),
        LinkHeader,
        Issues { stop_at },
    )
    .unwrap()
    .collect()
    .await
    .unwrap();

    let entries = session.into_archive().unwrap().entries().unwrap();
    (issues, entries, transport)
}

fn replay(entries: Vec<ArchiveEntry>, stop_at: Option<u64>) -> Result<Vec<Issue>, FetchError> {
    let mut session = Session::builder(BASE)
        .transport(FnTransport::offline())
        .replay(Box::new(MemoryArchive::from_entries(entries)))
        .build()
        .unwrap();

    CheckpointReader::new(&mut session, PageRequest::get("issues"), LinkHeader, Issues { stop_at })
        .unwrap()
        .collect()
}

fn checkpoints(entries: &[ArchiveEntry]) -> Vec<Checkpoint> {
    entries
        .iter()
        .filter_map(ArchiveEntry::as_checkpoint)
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_writer_builds_items_and_caches_shared_targets() {
    let (issues, entries, transport) = record(None).await;

    assert_eq!(
        issues,
        vec![
            Issue {
                number: 1,
                author: Some("Alice".to_string()),
                comments: vec!["first".to_string(), "+1".to_string()],
            },
            Issue {
                number: 2,
                author: None,
                comments: Vec::new(),
            },
            Issue {
                number: 3,
                author: Some("Alice".to_string()),
                comments: vec!["dup of #1".to_string()],
            },
        ]
    );

    // alice is fetched once for the whole run.
    assert_eq!(transport.sent_to("/users/alice").len(), 1);

    assert_eq!(
        checkpoints(&entries),
        vec![
            Checkpoint::Item("1".to_string()),
            Checkpoint::Item("2".to_string()),
            Checkpoint::Page,
            Checkpoint::Item("3".to_string()),
            Checkpoint::Page,
        ]
    );
    // 2 pages + 3 comment lists + 2 users, plus 5 checkpoints.
    assert_eq!(entries.len(), 12);
}

#[tokio::test]
async fn test_reader_reproduces_the_run() {
    let (issues, entries, _) = record(None).await;

    assert_eq!(replay(entries.clone(), None).unwrap(), issues);
    assert_eq!(replay(entries, None).unwrap(), issues);
}

#[tokio::test]
async fn test_missing_item_checkpoint_is_archive_exhausted() {
    let (_, mut entries, _) = record(None).await;
    let position = entries
        .iter()
        .position(|e| e.as_checkpoint() == Some(&Checkpoint::Item("2".to_string())))
        .unwrap();
    entries.remove(position);

    let err = replay(entries, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveExhausted);
}

#[tokio::test]
async fn test_truncated_archive_is_archive_exhausted() {
    let (_, mut entries, _) = record(None).await;
    entries.pop();

    let err = replay(entries, None).unwrap_err();
    assert!(matches!(err, FetchError::ArchiveExhausted(_)));
}

#[tokio::test]
async fn test_reader_yields_items_before_failing() {
    let (_, mut entries, _) = record(None).await;
    entries.truncate(5);

    let mut session = Session::builder(BASE)
        .transport(FnTransport::offline())
        .replay(Box::new(MemoryArchive::from_entries(entries)))
        .build()
        .unwrap();
    let mut reader =
        CheckpointReader::new(&mut session, PageRequest::get("issues"), LinkHeader, Issues { stop_at: None })
            .unwrap();

    assert_eq!(reader.next().unwrap().unwrap().number, 1);
    assert!(matches!(reader.next(), Some(Err(FetchError::ArchiveExhausted(_)))));
    assert!(reader.next().is_none());
}

#[tokio::test]
async fn test_keep_going_stops_both_sides() {
    let (issues, entries, transport) = record(Some(1)).await;

    assert_eq!(issues.len(), 1);
    assert!(transport.sent_to("/issues/2/comments").is_empty());
    assert_eq!(
        checkpoints(&entries),
        vec![Checkpoint::Item("1".to_string()), Checkpoint::Page]
    );
    assert_eq!(replay(entries, Some(1)).unwrap(), issues);
}

#[tokio::test]
async fn test_reader_requires_replaying_session() {
    let mut session = Session::builder(BASE)
        .transport(FnTransport::offline())
        .build()
        .unwrap();

    assert!(
        CheckpointReader::new(&mut session, PageRequest::get("issues"), LinkHeader, Issues { stop_at: None })
            .is_err()
    );
}

#[tokio::test]
async fn test_reader_starts_after_plain_requests() {
    let mut session = Session::builder(BASE)
        .transport(FnTransport::new(origin))
        .record(Box::new(MemoryArchive::new()))
        .build()
        .unwrap();

    let repo = session.get("repo", &[]).await.unwrap();
    let first = CheckpointWriter::new(&mut session, PageRequest::get("issues"), LinkHeader, Issues { stop_at: None })
        .unwrap()
        .collect()
        .await
        .unwrap();
    let second = CheckpointWriter::new(&mut session, PageRequest::get("issues"), LinkHeader, Issues { stop_at: Some(2) })
        .unwrap()
        .collect()
        .await
        .unwrap();
    let entries = session.into_archive().unwrap().entries().unwrap();

    let mut session = Session::builder(BASE)
        .transport(FnTransport::offline())
        .replay(Box::new(MemoryArchive::from_entries(entries)))
        .build()
        .unwrap();

    assert_eq!(session.get("repo", &[]).await.unwrap(), repo);
    let replayed_first: Vec<Issue> =
        CheckpointReader::new(&mut session, PageRequest::get("issues"), LinkHeader, Issues { stop_at: None })
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
    let replayed_second: Vec<Issue> =
        CheckpointReader::new(&mut session, PageRequest::get("issues"), LinkHeader, Issues { stop_at: Some(2) })
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

    assert_eq!(replayed_first, first);
    assert_eq!(replayed_second, second);
    assert_eq!(second.len(), 2);
}

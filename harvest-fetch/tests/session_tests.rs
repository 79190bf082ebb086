//! Session record/replay, sanitization, quota gating and rotation.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::{FnTransport, json, not_found, path_of};
use futures::StreamExt;
use harvest_core::{Headers, HttpResponse, Method, Secret};
use harvest_fetch::{
    Archive, ArchiveEntry, Credential, CredentialError, CredentialMinter, CredentialPool, ErrorKind, FetchError,
    LinkHeader, MemoryArchive, MintedToken, PageRequest, RateLimiter, Session, StripSecrets,
    TransportError,
};
use serde_json::json;

const BASE: &str = "https://api.test";

fn origin(request: &harvest_core::HttpRequest) -> Result<HttpResponse, TransportError> {
    match path_of(&request.url) {
        "https://api.test/issues" => {
            if request.url.contains("page=2") {
                Ok(json(200, json!([{"number": 3}])))
            } else {
                Ok(json(200, json!([{"number": 1}, {"number": 2}])).with_header(
                    "Link",
                    "<https://api.test/issues?page=2>; rel=\"next\"",
                ))
            }
        }
        "https://api.test/issues/2/comments" => Err(not_found()),
        path if path.starts_with("https://api.test/issues/") => Ok(json(200, json!([{"body": "lgtm"}]))),
        _ => Err(not_found()),
    }
}

/// Fetches all issue pages, then each issue's comments, recording outcomes.
async fn crawl(session: &mut Session) -> Vec<Result<String, ErrorKind>> {
    let mut outcomes = Vec::new();
    let mut numbers = Vec::new();

    let pages: Vec<_> = session
        .record_page(PageRequest::get("issues"), LinkHeader)
        .into_stream()
        .collect()
        .await;
    for page in pages {
        match page {
            Ok(page) => {
                let issues: Vec<serde_json::Value> = page.json().unwrap();
                numbers.extend(issues.iter().map(|i| i["number"].as_u64().unwrap()));
                outcomes.push(Ok(page.text()));
            }
            Err(err) => outcomes.push(Err(err.kind())),
        }
    }

    for number in numbers {
        let path = format!("issues/{number}/comments");
        match session.get(&path, &[]).await {
            Ok(response) => outcomes.push(Ok(response.text())),
            Err(err) => outcomes.push(Err(err.kind())),
        }
    }
    outcomes
}

fn replaying(archive: MemoryArchive, transport: Arc<FnTransport>) -> Session {
    Session::builder(BASE)
        .transport(transport)
        .replay(Box::new(archive))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_replay_is_idempotent_including_errors() {
    let live = FnTransport::new(origin);
    let mut recorder = Session::builder(BASE)
        .transport(live.clone())
        .record(Box::new(MemoryArchive::new()))
        .build()
        .unwrap();

    let recorded = crawl(&mut recorder).await;
    assert_eq!(recorded.len(), 5);
    assert_eq!(recorded[3], Err(ErrorKind::Transport));

    let entries = recorder.into_archive().unwrap().entries().unwrap();
    let offline = FnTransport::offline();

    let mut first = replaying(MemoryArchive::from_entries(entries.clone()), offline.clone());
    let mut second = replaying(MemoryArchive::from_entries(entries), offline.clone());

    assert_eq!(crawl(&mut first).await, recorded);
    assert_eq!(crawl(&mut second).await, recorded);
    assert_eq!(offline.count(), 0);
}

#[tokio::test]
async fn test_replay_miss_is_fatal() {
    let mut session = replaying(MemoryArchive::new(), FnTransport::offline());

    let err = session.get("issues", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchiveMiss);
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_archived_failure_replays_as_same_error() {
    let live = FnTransport::new(origin);
    let mut recorder = Session::builder(BASE)
        .transport(live)
        .record(Box::new(MemoryArchive::new()))
        .build()
        .unwrap();
    let live_err = recorder.get("issues/2/comments", &[]).await.unwrap_err();

    let entries = recorder.into_archive().unwrap().entries().unwrap();
    let mut replay = replaying(MemoryArchive::from_entries(entries), FnTransport::offline());
    let replay_err = replay.get("issues/2/comments", &[]).await.unwrap_err();

    match (live_err, replay_err) {
        (FetchError::Transport(a), FetchError::Transport(b)) => assert_eq!(a, b),
        other => panic!("unexpected errors: {other:?}"),
    }
}

#[tokio::test]
async fn test_secrets_never_reach_the_archive() {
    let transport = FnTransport::new(|_| {
        Ok(json(200, json!({"ok": true, "workspace": "ws-8842"})).with_header("X-Workspace", "ws-8842"))
    });
    let sanitizer = StripSecrets::new()
        .query_param("api_key")
        .header("X-Workspace")
        .value("ws-8842");

    let mut session = Session::builder(BASE)
        .transport(transport.clone())
        .pool(CredentialPool::new(vec![Credential::static_token("ghp_supersecret")]))
        .sanitizer(Arc::new(sanitizer.clone()))
        .default_header("X-Workspace", "ws-8842")
        .record(Box::new(MemoryArchive::new()))
        .build()
        .unwrap();

    session
        .request(Method::Post, "search", &[("api_key", "k3y-123"), ("q", "bug")], Some(r#"{"workspace":"ws-8842"}"#))
        .await
        .unwrap();

    // The wire request carried every secret.
    let sent = &transport.sent()[0];
    assert_eq!(
        sent.headers.get("authorization").map(String::as_str),
        Some("Bearer ghp_supersecret")
    );
    assert!(sent.url.contains("api_key=k3y-123"));

    let archive = session.into_archive().unwrap();
    let entries = archive.entries().unwrap();
    let persisted = serde_json::to_string(&entries).unwrap();
    for secret in ["ghp_supersecret", "k3y-123", "ws-8842"] {
        assert!(!persisted.contains(secret), "{secret} leaked into archive");
    }
    // Bodies are base64 in JSON, so look inside the archived response too.
    let Some(ArchiveEntry::Record { outcome: Ok(archived), .. }) = entries.first() else {
        panic!("expected an archived response, got {entries:?}");
    };
    assert_eq!(archived.json::<serde_json::Value>().unwrap(), json!({"ok": true, "workspace": "xxxxx"}));
    assert!(archived.header("x-workspace").is_none());

    // Replay with the same sanitizer finds the sanitized record.
    let mut replay = Session::builder(BASE)
        .transport(FnTransport::offline())
        .sanitizer(Arc::new(sanitizer))
        .default_header("X-Workspace", "ws-8842")
        .replay(archive)
        .build()
        .unwrap();
    let response = replay
        .request(Method::Post, "search", &[("api_key", "other"), ("q", "bug")], Some(r#"{"workspace":"ws-8842"}"#))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(!response.text().contains("ws-8842"));
}

#[tokio::test]
async fn test_quota_floor_blocks_next_request() {
    let reset = (Utc::now() + chrono::Duration::seconds(5)).timestamp().to_string();
    let transport = FnTransport::new(move |_| {
        Ok(json(200, json!([]))
            .with_header("X-RateLimit-Remaining", "0")
            .with_header("X-RateLimit-Reset", reset.clone()))
    });

    let mut session = Session::builder(BASE)
        .transport(transport.clone())
        .rate_limiter(RateLimiter::new(10, false))
        .build()
        .unwrap();

    session.get("issues", &[]).await.unwrap();
    let err = session.get("issues", &[]).await.unwrap_err();

    match err {
        FetchError::RateLimitExhausted { seconds_to_reset } => assert!(seconds_to_reset <= 5),
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn test_quota_on_error_status_blocks_next_request() {
    let reset = (Utc::now() + chrono::Duration::seconds(60)).timestamp().to_string();
    let calls = Arc::new(AtomicU32::new(0));
    let transport = FnTransport::new({
        let calls = calls.clone();
        move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(json(200, json!([])).with_header("X-RateLimit-Remaining", "50"));
            }
            let mut headers = Headers::new();
            headers.insert("x-ratelimit-remaining".to_string(), "0".to_string());
            headers.insert("x-ratelimit-reset".to_string(), reset.clone());
            Err(TransportError::HttpStatus {
                status: 403,
                body: "API rate limit exceeded".to_string(),
                headers,
            })
        }
    });

    let mut session = Session::builder(BASE)
        .transport(transport.clone())
        .rate_limiter(RateLimiter::new(10, false))
        .build()
        .unwrap();

    session.get("issues", &[]).await.unwrap();
    assert_eq!(session.rate_limiter().quota().remaining, Some(50));

    let err = session.get("issues", &[]).await.unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert_eq!(session.rate_limiter().quota().remaining, Some(0));

    match session.get("issues", &[]).await.unwrap_err() {
        FetchError::RateLimitExhausted { seconds_to_reset } => {
            assert!((55..=60).contains(&seconds_to_reset), "{seconds_to_reset}");
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn test_pool_rotates_before_exhaustion() {
    let quotas = Arc::new(HashMap::from([
        ("Bearer a", AtomicU64::new(5)),
        ("Bearer b", AtomicU64::new(50)),
        ("Bearer c", AtomicU64::new(20)),
    ]));

    let transport = FnTransport::new({
        let quotas = quotas.clone();
        move |request| {
            let auth = request.headers.get("authorization").cloned().unwrap_or_default();
            let quota = quotas.get(auth.as_str()).ok_or_else(not_found)?;
            if path_of(&request.url).ends_with("/issues") {
                // This request drains the credential down to 9.
                quota.store(9, Ordering::SeqCst);
            }
            Ok(json(200, json!({}))
                .with_header("X-RateLimit-Remaining", quota.load(Ordering::SeqCst).to_string()))
        }
    });

    let pool = CredentialPool::new(vec![
        Credential::static_token("a"),
        Credential::static_token("b"),
        Credential::static_token("c"),
    ]);
    let mut session = Session::builder(BASE)
        .transport(transport.clone())
        .pool(pool)
        .status_path("rate_limit")
        .build()
        .unwrap();

    session.get("issues", &[]).await.unwrap();
    assert_eq!(session.pool().active_index(), 2);
    assert_eq!(session.rate_limiter().quota().remaining, Some(20));

    session.get("issues", &[]).await.unwrap();

    let used: Vec<String> = transport
        .sent_to("/issues")
        .iter()
        .filter_map(|r| r.headers.get("authorization").cloned())
        .collect();
    assert_eq!(used, vec!["Bearer b", "Bearer c"]);
}

struct CountingMinter(AtomicU32);

#[async_trait]
impl CredentialMinter for CountingMinter {
    async fn mint(&self) -> Result<MintedToken, CredentialError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MintedToken {
            secret: Secret::new(format!("ghs_{n}")),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

#[tokio::test]
async fn test_single_minted_credential_refreshes_at_floor() {
    let transport = FnTransport::new(|_| {
        Ok(json(200, json!([])).with_header("X-RateLimit-Remaining", "10"))
    });
    let minter = Arc::new(CountingMinter(AtomicU32::new(0)));

    let mut session = Session::builder(BASE)
        .transport(transport.clone())
        .pool(CredentialPool::new(vec![Credential::minted(minter.clone())]))
        .rate_limiter(RateLimiter::new(10, false))
        .build()
        .unwrap();

    session.get("issues", &[]).await.unwrap();
    session.get("issues", &[]).await.unwrap();

    assert_eq!(minter.0.load(Ordering::SeqCst), 3);
    let used: Vec<String> = transport
        .sent()
        .iter()
        .filter_map(|r| r.headers.get("authorization").cloned())
        .collect();
    assert_eq!(used, vec!["Bearer ghs_1", "Bearer ghs_2"]);
}

struct RejectedMinter;

#[async_trait]
impl CredentialMinter for RejectedMinter {
    async fn mint(&self) -> Result<MintedToken, CredentialError> {
        Err(CredentialError::ExchangeRejected {
            status: 401,
            body: "Bad credentials".to_string(),
        })
    }
}

#[tokio::test]
async fn test_mint_failure_is_fatal_only_without_fallback() {
    let transport = FnTransport::new(|_| Ok(json(200, json!([]))));

    let mut pooled = Session::builder(BASE)
        .transport(transport.clone())
        .pool(CredentialPool::new(vec![
            Credential::minted(Arc::new(RejectedMinter)),
            Credential::static_token("ghp_fallback"),
        ]))
        .build()
        .unwrap();
    pooled.get("issues", &[]).await.unwrap();
    pooled.get("issues", &[]).await.unwrap();
    assert_eq!(
        transport.sent()[0].headers.get("authorization").map(String::as_str),
        Some("Bearer ghp_fallback")
    );

    let mut lone = Session::builder(BASE)
        .transport(transport.clone())
        .pool(CredentialPool::new(vec![Credential::minted(Arc::new(RejectedMinter))]))
        .build()
        .unwrap();
    let err = lone.get("issues", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credential);
    assert!(err.is_fatal());
    assert_eq!(transport.count(), 2);
}

#[tokio::test]
async fn test_stop_predicate_ends_pagination() {
    let transport = FnTransport::new(origin);
    let mut session = Session::builder(BASE).transport(transport.clone()).build().unwrap();

    let mut pages = session
        .record_page(PageRequest::get("issues"), LinkHeader)
        .stop_after(|page| page.text().contains("\"number\":1"));

    assert!(pages.next().await.unwrap().is_some());
    assert!(pages.next().await.unwrap().is_none());
    assert_eq!(transport.count(), 1);
}

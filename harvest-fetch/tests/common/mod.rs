//! Shared helpers for harvest-fetch integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use harvest_core::{HttpRequest, HttpResponse};
use harvest_fetch::{Transport, TransportError};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport answering from a closure and remembering what it was sent.
pub struct FnTransport {
    handler: Box<Handler>,
    sent: Mutex<Vec<HttpRequest>>,
}

impl FnTransport {
    pub fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// A transport that fails every request; replay must never reach it.
    pub fn offline() -> Arc<Self> {
        Self::new(|request| {
            Err(TransportError::InvalidRequest {
                message: format!("network disabled: {}", request.url),
            })
        })
    }

    pub fn sent(&self) -> Vec<HttpRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Requests whose URL path ends with `suffix`, ignoring the query.
    pub fn sent_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.sent()
            .into_iter()
            .filter(|r| path_of(&r.url).ends_with(suffix))
            .collect()
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

/// URL without its query string.
pub fn path_of(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

pub fn json(status: u16, body: serde_json::Value) -> HttpResponse {
    HttpResponse::new(status, body.to_string()).with_header("Content-Type", "application/json")
}

pub fn not_found() -> TransportError {
    TransportError::HttpStatus {
        status: 404,
        body: "Not Found".to_string(),
        headers: Default::default(),
    }
}

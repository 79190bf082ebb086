//! Sanitization applied before anything is archived.
//!
//! Whatever a sanitizer leaves in place becomes part of the archived
//! fingerprint or outcome, so it must remove anything secret or
//! run-specific from both.

use harvest_core::Headers;
use url::Url;

use crate::archive::ArchivedOutcome;
use crate::error::TransportError;

/// Placeholder written in place of masked values.
pub const MASK: &str = "xxxxx";

/// Rewrites the identity of a request before it is fingerprinted.
pub trait Sanitizer: Send + Sync {
    /// Returns the sanitized `(url, headers, body)`. Identity by default.
    fn sanitize(
        &self,
        url: String,
        headers: Headers,
        body: Option<String>,
    ) -> (String, Headers, Option<String>) {
        (url, headers, body)
    }

    /// Returns the outcome as it may be archived. Identity by default.
    fn sanitize_outcome(&self, outcome: ArchivedOutcome) -> ArchivedOutcome {
        outcome
    }
}

/// Leaves requests untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentitySanitizer;

impl Sanitizer for IdentitySanitizer {}

/// Drops secret headers and query parameters and masks secret values.
#[derive(Debug, Clone, Default)]
pub struct StripSecrets {
    headers: Vec<String>,
    query_params: Vec<String>,
    values: Vec<String>,
}

impl StripSecrets {
    /// Creates a sanitizer that strips nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a header (case-insensitive).
    pub fn header(mut self, name: &str) -> Self {
        self.headers.push(name.to_ascii_lowercase());
        self
    }

    /// Drops a query parameter.
    pub fn query_param(mut self, name: impl Into<String>) -> Self {
        self.query_params.push(name.into());
        self
    }

    /// Masks a literal value wherever it appears in the URL or body.
    pub fn value(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.values.push(value);
        }
        self
    }

    fn strip_headers(&self, mut headers: Headers) -> Headers {
        headers.retain(|name, _| !self.headers.iter().any(|h| h.eq_ignore_ascii_case(name)));
        for value in headers.values_mut() {
            *value = self.mask(value);
        }
        headers
    }

    fn strip_error(&self, error: TransportError) -> TransportError {
        match error {
            TransportError::HttpStatus { status, body, headers } => TransportError::HttpStatus {
                status,
                body: self.mask(&body),
                headers: self.strip_headers(headers),
            },
            TransportError::ConnectionRefused { message } => TransportError::ConnectionRefused {
                message: self.mask(&message),
            },
            TransportError::Connection { message } => TransportError::Connection {
                message: self.mask(&message),
            },
            TransportError::InvalidRequest { message } => TransportError::InvalidRequest {
                message: self.mask(&message),
            },
            TransportError::RetryLimit { attempts, last } => TransportError::RetryLimit {
                attempts,
                last: Box::new(self.strip_error(*last)),
            },
            other @ (TransportError::Timeout | TransportError::TooManyRedirects) => other,
        }
    }

    fn mask(&self, text: &str) -> String {
        self.values
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), MASK))
    }

    fn strip_query(&self, url: &str) -> String {
        if self.query_params.is_empty() {
            return url.to_string();
        }
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_string();
        };

        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(name, _)| !self.query_params.iter().any(|p| p == name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept);
        }
        parsed.to_string()
    }
}

impl Sanitizer for StripSecrets {
    fn sanitize(
        &self,
        url: String,
        headers: Headers,
        body: Option<String>,
    ) -> (String, Headers, Option<String>) {
        let headers = self.strip_headers(headers);
        let url = self.mask(&self.strip_query(&url));
        let body = body.map(|body| self.mask(&body));
        (url, headers, body)
    }

    /// Masks secret values in response bodies, headers and error messages.
    ///
    /// Bodies that are not UTF-8 are archived as received.
    fn sanitize_outcome(&self, outcome: ArchivedOutcome) -> ArchivedOutcome {
        match outcome {
            Ok(mut response) => {
                response.headers = self.strip_headers(response.headers);
                let masked = std::str::from_utf8(&response.body)
                    .ok()
                    .map(|text| self.mask(text));
                if let Some(masked) = masked {
                    response.body = masked.into_bytes();
                }
                Ok(response)
            }
            Err(error) => Err(self.strip_error(error)),
        }
    }
}

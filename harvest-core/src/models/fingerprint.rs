//! Request fingerprints used as archive keys.

use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};

use super::http::{Headers, HttpRequest, Method};

/// The sanitized, externally observable identity of a request.
///
/// Two requests with equal fingerprints are the same archive entry, even if
/// they went out on the wire with different credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Request method.
    pub method: Method,
    /// URL with path and query.
    pub url: String,
    /// Sanitized headers.
    pub headers: Headers,
    /// Sanitized body.
    pub body: Option<String>,
}

impl Fingerprint {
    /// Creates a fingerprint from already sanitized parts.
    pub fn new(method: Method, url: impl Into<String>, headers: Headers, body: Option<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers,
            body,
        }
    }

    /// Creates a fingerprint from a request as-is (no sanitization).
    pub fn of(request: &HttpRequest) -> Self {
        Self::new(
            request.method,
            request.url.clone(),
            request.headers.clone(),
            request.body.clone(),
        )
    }

    /// Stable SHA-256 hex digest of the fingerprint.
    ///
    /// Headers are ordered by name, so insertion order never changes the key.
    pub fn hashcode(&self) -> String {
        let mut content = String::with_capacity(self.url.len() + 64);
        content.push_str(self.method.as_str());
        content.push('\n');
        content.push_str(&self.url);
        content.push('\n');
        for (name, value) in &self.headers {
            content.push_str(name);
            content.push(':');
            content.push_str(value);
            content.push('\n');
        }
        content.push('\n');
        if let Some(body) = &self.body {
            content.push_str(body);
        }

        hex::encode(digest(&SHA256, content.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashcode_is_stable_across_header_order() {
        let mut a = Headers::new();
        a.insert("accept".to_string(), "json".to_string());
        a.insert("x-page".to_string(), "2".to_string());

        let mut b = Headers::new();
        b.insert("x-page".to_string(), "2".to_string());
        b.insert("accept".to_string(), "json".to_string());

        let fa = Fingerprint::new(Method::Get, "https://api.test/issues", a, None);
        let fb = Fingerprint::new(Method::Get, "https://api.test/issues", b, None);
        assert_eq!(fa.hashcode(), fb.hashcode());
        assert_eq!(fa.hashcode().len(), 64);
    }

    #[test]
    fn test_hashcode_distinguishes_method_and_body() {
        let get = Fingerprint::new(Method::Get, "https://api.test/q", Headers::new(), None);
        let post = Fingerprint::new(Method::Post, "https://api.test/q", Headers::new(), None);
        let post_body = Fingerprint::new(
            Method::Post,
            "https://api.test/q",
            Headers::new(),
            Some("{\"query\":1}".to_string()),
        );

        assert_ne!(get.hashcode(), post.hashcode());
        assert_ne!(post.hashcode(), post_body.hashcode());
    }
}

//! Pagination strategies for list endpoints.
//!
//! A [`Paginate`] looks at the request that produced a page and the page
//! itself, and decides what to ask for next. Returning `None` ends the
//! sequence.

use harvest_core::{HttpResponse, Method};

/// One page request, relative to the session's base URL.
///
/// `path` may also be an absolute URL, as handed out by `Link` headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Method.
    pub method: Method,
    /// Path or absolute URL.
    pub path: String,
    /// Query parameters appended to the URL.
    pub query: Vec<(String, String)>,
    /// Optional body (e.g. a GraphQL query).
    pub body: Option<String>,
}

impl PageRequest {
    /// A GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// A POST request with a body.
    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body.into()),
        }
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Returns the value of a query parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Sets a query parameter, replacing any previous value.
    pub fn set_query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.retain(|(key, _)| key != name);
        self.query.push((name.to_string(), value.into()));
        self
    }
}

/// Decides the request for the next page.
pub trait Paginate: Send {
    /// Returns the next request, or `None` after the last page.
    fn next_request(&mut self, previous: &PageRequest, page: &HttpResponse) -> Option<PageRequest>;
}

impl<F> Paginate for F
where
    F: FnMut(&PageRequest, &HttpResponse) -> Option<PageRequest> + Send,
{
    fn next_request(&mut self, previous: &PageRequest, page: &HttpResponse) -> Option<PageRequest> {
        self(previous, page)
    }
}

// ============================================================================
// Link Header
// ============================================================================

/// Follows `Link: <url>; rel="next"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkHeader;

impl Paginate for LinkHeader {
    fn next_request(&mut self, _previous: &PageRequest, page: &HttpResponse) -> Option<PageRequest> {
        page.header("link")
            .and_then(|value| parse_link(value, "next"))
            .map(PageRequest::get)
    }
}

/// Extracts the URL with relation `rel` from a `Link` header value.
pub fn parse_link(value: &str, rel: &str) -> Option<String> {
    value.split(',').find_map(|link| {
        let mut parts = link.split(';');
        let url = parts.next()?.trim();
        let url = url.strip_prefix('<')?.strip_suffix('>')?;
        parts
            .filter_map(|param| param.trim().strip_prefix("rel="))
            .map(|relations| relations.trim_matches('"'))
            .any(|relations| relations.split_whitespace().any(|r| r == rel))
            .then(|| url.to_string())
    })
}

// ============================================================================
// Offset
// ============================================================================

/// Advances an offset parameter while pages come back full.
pub struct OffsetPagination {
    param: String,
    limit: usize,
    count: Box<dyn Fn(&HttpResponse) -> usize + Send>,
}

impl OffsetPagination {
    /// Creates offset pagination; `count` returns the items on a page.
    pub fn new(
        param: impl Into<String>,
        limit: usize,
        count: impl Fn(&HttpResponse) -> usize + Send + 'static,
    ) -> Self {
        Self {
            param: param.into(),
            limit,
            count: Box::new(count),
        }
    }
}

impl Paginate for OffsetPagination {
    fn next_request(&mut self, previous: &PageRequest, page: &HttpResponse) -> Option<PageRequest> {
        if self.limit == 0 || (self.count)(page) < self.limit {
            return None;
        }
        let offset = previous
            .query_value(&self.param)
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(0);
        Some(
            previous
                .clone()
                .set_query(&self.param, (offset + self.limit).to_string()),
        )
    }
}

impl std::fmt::Debug for OffsetPagination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetPagination")
            .field("param", &self.param)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Passes an opaque cursor read from each page to the next request.
pub struct CursorPagination {
    param: String,
    cursor: Box<dyn Fn(&HttpResponse) -> Option<String> + Send>,
}

impl CursorPagination {
    /// Creates cursor pagination; `cursor` returns `None` on the last page.
    pub fn new(
        param: impl Into<String>,
        cursor: impl Fn(&HttpResponse) -> Option<String> + Send + 'static,
    ) -> Self {
        Self {
            param: param.into(),
            cursor: Box::new(cursor),
        }
    }
}

impl Paginate for CursorPagination {
    fn next_request(&mut self, previous: &PageRequest, page: &HttpResponse) -> Option<PageRequest> {
        let cursor = (self.cursor)(page).filter(|cursor| !cursor.is_empty())?;
        Some(previous.clone().set_query(&self.param, cursor))
    }
}

impl std::fmt::Debug for CursorPagination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorPagination")
            .field("param", &self.param)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_header() {
        let value = r#"<https://api.github.com/repos/a/b/issues?page=2>; rel="next", <https://api.github.com/repos/a/b/issues?page=5>; rel="last""#;
        assert_eq!(
            parse_link(value, "next").as_deref(),
            Some("https://api.github.com/repos/a/b/issues?page=2")
        );
        assert_eq!(
            parse_link(value, "last").as_deref(),
            Some("https://api.github.com/repos/a/b/issues?page=5")
        );
        assert_eq!(parse_link(value, "prev"), None);
    }

    #[test]
    fn test_link_header_pagination_ends_without_next() {
        let mut paginate = LinkHeader;
        let first = PageRequest::get("issues");

        let page = HttpResponse::new(200, "[]").with_header("Link", "<https://api.test/issues?page=2>; rel=\"next\"");
        let next = paginate.next_request(&first, &page).unwrap();
        assert_eq!(next.path, "https://api.test/issues?page=2");

        assert!(paginate.next_request(&next, &HttpResponse::new(200, "[]")).is_none());
    }

    #[test]
    fn test_offset_pagination() {
        let mut paginate = OffsetPagination::new("offset", 2, |page| {
            page.json::<Vec<u32>>().map(|items| items.len()).unwrap_or(0)
        });
        let first = PageRequest::get("changes").with_query("limit", "2");

        let next = paginate
            .next_request(&first, &HttpResponse::new(200, "[1,2]"))
            .unwrap();
        assert_eq!(next.query_value("offset"), Some("2"));
        assert_eq!(next.query_value("limit"), Some("2"));

        let next = paginate
            .next_request(&next, &HttpResponse::new(200, "[3,4]"))
            .unwrap();
        assert_eq!(next.query_value("offset"), Some("4"));

        assert!(paginate.next_request(&next, &HttpResponse::new(200, "[5]")).is_none());
    }

    #[test]
    fn test_cursor_pagination() {
        let mut paginate = CursorPagination::new("cursor", |page| {
            page.json::<serde_json::Value>()
                .ok()
                .and_then(|v| v["next_cursor"].as_str().map(str::to_string))
        });
        let first = PageRequest::get("conversations.history");

        let next = paginate
            .next_request(&first, &HttpResponse::new(200, r#"{"next_cursor":"abc"}"#))
            .unwrap();
        assert_eq!(next.query_value("cursor"), Some("abc"));

        assert!(paginate
            .next_request(&next, &HttpResponse::new(200, r#"{"next_cursor":""}"#))
            .is_none());
    }
}

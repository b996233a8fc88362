//! Ordered header list with case-insensitive lookup.

/// HTTP header fields in arrival order.
///
/// Names compare case-insensitively. Duplicates are kept; [`get`](Self::get)
/// returns the first.
///
/// ```
/// use sheetcache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("User-Agent", "curl/8.5.0");
/// assert_eq!(headers.get("user-agent"), Some("curl/8.5.0"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Returns the first value for `name`, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

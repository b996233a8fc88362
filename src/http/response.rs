//! HTTP/1.1 response builder.
//!
//! The body is a [`Bytes`] handle so a cached payload is written to the
//! socket without being copied out of the cache first.

use bytes::{BufMut, Bytes, BytesMut};

use super::{StatusCode, TEXT_PLAIN};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use sheetcache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::NotFound)
///     .content_type("text/plain")
///     .body("Error: File not found!");
///
/// assert_eq!(response.content_length(), 22);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
/// assert!(text.contains("Content-Type: text/plain\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Shorthand for a `text/plain` response carrying `message`.
    pub fn text(status: StatusCode, message: &'static str) -> Self {
        Self::new(status)
            .content_type(TEXT_PLAIN)
            .body(Bytes::from_static(message.as_bytes()))
    }

    /// Sets the `Content-Type` header.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the response body.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn payload(&self) -> &Bytes {
        &self.body
    }

    /// Returns the `Content-Type` that will be written, if any.
    pub fn media_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Writes the status line, `Content-Type` (when set),
    /// `Connection`, and finally `Content-Length`.
    pub fn into_bytes(self) -> BytesMut {
        let content_length = self.body.len();
        let estimated_size = 128 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        if let Some(content_type) = &self.content_type {
            buf.put(format!("Content-Type: {content_type}\r\n").as_bytes());
        }

        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        buf.put(format!("Connection: {connection}\r\n").as_bytes());

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        buf.put(&b"\r\n"[..]);
        buf.put(self.body);

        buf
    }
}

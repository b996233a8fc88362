//! HTTP/1.1 request parsing using the [`httparse`] crate.

use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length: {0:?}")]
    ContentLength(String),
}

/// A parsed request head.
///
/// The server never reads request bodies; a declared body is only counted so
/// it can be skipped. The query string is dropped, since files are addressed
/// by path alone.
///
/// ```
/// use sheetcache::http::request::Request;
///
/// let raw = b"GET /reports/q3.csv?fresh=1 HTTP/1.1\r\nHost: localhost\r\nUser-Agent: curl\r\n\r\n";
/// let (request, frame_len) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/reports/q3.csv");
/// assert_eq!(request.protocol(), "HTTP/1.1");
/// assert_eq!(request.host(), Some("localhost"));
/// assert_eq!(request.user_agent(), Some("curl"));
/// assert_eq!(frame_len, raw.len());
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    minor_version: u8,
    headers: Headers,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parses one request from the front of `buf`.
    ///
    /// Returns the request and the length of its whole frame: the head plus
    /// any body announced by `Content-Length`. The caller drops that many
    /// bytes before parsing the next pipelined request.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — the head or the declared body has not
    ///   fully arrived yet.
    /// - [`RequestError::Parse`] — the head is malformed.
    /// - [`RequestError::MissingField`] — method, path or version is absent.
    /// - [`RequestError::ContentLength`] — `Content-Length` is not a number,
    ///   or the frame it announces does not fit in memory.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut slots = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut head = httparse::Request::new(&mut slots);

        let head_len = match head.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = head
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let target = head
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let path = target.split_once('?').map_or(target, |(path, _)| path);

        let minor_version = head
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let headers = head
            .headers
            .iter()
            .filter_map(|h| Some((h.name, std::str::from_utf8(h.value).ok()?)))
            .fold(Headers::with_capacity(head.headers.len()), |mut map, (name, value)| {
                map.insert(name, value);
                map
            });

        let request = Self {
            method,
            path: path.to_owned(),
            minor_version,
            headers,
        };

        let declared = request.content_length()?;
        let frame_len = head_len
            .checked_add(declared)
            .ok_or_else(|| RequestError::ContentLength(declared.to_string()))?;
        if buf.len() < frame_len {
            return Err(RequestError::Incomplete);
        }
        Ok((request, frame_len))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the protocol as written on the request line.
    pub fn protocol(&self) -> &'static str {
        match self.minor_version {
            0 => "HTTP/1.0",
            _ => "HTTP/1.1",
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent")
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.minor_version == 1,
        }
    }

    /// Declared body length; zero when `Content-Length` is absent.
    fn content_length(&self) -> Result<usize, RequestError> {
        match self.headers.get("content-length") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| RequestError::ContentLength(raw.to_owned())),
            None => Ok(0),
        }
    }
}

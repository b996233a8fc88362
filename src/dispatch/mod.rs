//! Request dispatch — maps `GET /<file>` to a cached, converted spreadsheet.
//!
//! The request path, minus its leading `/`, is both the cache key and the
//! source file's path relative to the configured root. Everything that can go
//! wrong becomes a [`DispatchError`], which maps to a status code and a short
//! plain-text body. Internal detail only reaches the server log.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cache::{CacheError, ResultCache};
use crate::convert::{ConvertError, Converter, FileSystem};
use crate::http::{MS_EXCEL, Method, Request, Response, StatusCode};
use crate::logging::AccessRecord;

/// Why a request did not produce a spreadsheet.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("method {0} is not allowed")]
    MethodNotAllowed(Method),

    #[error("no source file for `{key}`")]
    NotFound { key: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl DispatchError {
    /// Returns the status code reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed(_) => StatusCode::MethodNotAllowed,
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::Cache(CacheError::ComputeFailed { .. } | CacheError::Abandoned { .. }) => {
                StatusCode::InternalServerError
            }
            Self::Cache(CacheError::Timeout { .. }) => StatusCode::GatewayTimeout,
            Self::Cache(CacheError::LockUnavailable { .. } | CacheError::CacheFull { .. }) => {
                StatusCode::ServiceUnavailable
            }
        }
    }

    /// Returns the body reported to the client.
    pub fn public_message(&self) -> &'static str {
        match self.status() {
            StatusCode::MethodNotAllowed => "Method not allowed!",
            StatusCode::NotFound => "Error: File not found!",
            StatusCode::GatewayTimeout => "Error: Conversion timed out!",
            StatusCode::ServiceUnavailable => "Error: Server busy!",
            _ => "Error: Conversion failed!",
        }
    }

    pub fn into_response(self) -> Response {
        Response::text(self.status(), self.public_message())
    }
}

/// Serves converted spreadsheets out of a [`ResultCache`].
///
/// The cache, filesystem and converter are injected, so one cache instance can
/// be shared with the sweep task in the binary and tests can count
/// conversions.
pub struct Dispatcher {
    root: PathBuf,
    cache: Arc<ResultCache>,
    fs: Arc<dyn FileSystem>,
    converter: Arc<dyn Converter>,
}

impl Dispatcher {
    pub fn new(
        root: impl Into<PathBuf>,
        cache: Arc<ResultCache>,
        fs: Arc<dyn FileSystem>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            root: root.into(),
            cache,
            fs,
            converter,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Handles a request and emits one access-log record for it.
    pub async fn serve(&self, request: Request) -> Response {
        let start = Instant::now();
        let response = self.handle(request.method(), request.path()).await;
        AccessRecord::new(&request, &response, start.elapsed()).emit();
        response
    }

    /// Produces the response for `method` on `path`.
    ///
    /// - Non-`GET` → `405 Method not allowed!`
    /// - No such source file → `404 Error: File not found!`
    /// - Otherwise the cached or freshly converted spreadsheet with
    ///   `200` and `application/vnd.ms-excel`, or a `5xx` if conversion
    ///   failed. Failures are not retried here; the next request is a new
    ///   attempt.
    pub async fn handle(&self, method: &Method, path: &str) -> Response {
        match self.resolve(method, path).await {
            Ok(payload) => Response::new(StatusCode::Ok)
                .content_type(MS_EXCEL)
                .body(payload),
            Err(err) => {
                match &err {
                    DispatchError::MethodNotAllowed(_) | DispatchError::NotFound { .. } => {
                        debug!(%method, path, error = %err, "request rejected");
                    }
                    DispatchError::Cache(CacheError::Timeout { .. }) => {
                        warn!(%method, path, error = %err, "request timed out");
                    }
                    DispatchError::Cache(cause) => {
                        error!(%method, path, error = %cause, "conversion failed");
                    }
                }
                err.into_response()
            }
        }
    }

    async fn resolve(&self, method: &Method, path: &str) -> Result<Bytes, DispatchError> {
        if *method != Method::Get {
            return Err(DispatchError::MethodNotAllowed(method.clone()));
        }

        let not_found = || DispatchError::NotFound {
            key: path.trim_start_matches('/').to_owned(),
        };

        let key = cache_key(path).ok_or_else(not_found)?;
        let source = self.root.join(key);
        if !self.fs.exists(&source) {
            return Err(not_found());
        }

        let converter = Arc::clone(&self.converter);
        let payload = self
            .cache
            .get_or_compute(key, || async move {
                let converted =
                    tokio::task::spawn_blocking(move || converter.convert(&source)).await;
                match converted {
                    Ok(result) => result,
                    Err(join_error) => Err(ConvertError::from(join_error)),
                }
            })
            .await?;

        Ok(payload)
    }
}

/// Derives the cache key from a request path.
///
/// The leading separators are trimmed. Keys that are empty, could leave the
/// source root (`..`, backslashes, drive prefixes) or alias another key
/// (`.`, empty segments) are rejected.
fn cache_key(path: &str) -> Option<&str> {
    let key = path.trim_start_matches('/');
    let valid = !key.is_empty()
        && !key.contains(['\\', ':'])
        && key
            .split('/')
            .all(|segment| !matches!(segment, "" | "." | ".."));
    valid.then_some(key)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheConfig;

    struct MemoryFs(HashMap<PathBuf, &'static str>);

    impl FileSystem for MemoryFs {
        fn exists(&self, path: &Path) -> bool {
            self.0.contains_key(path)
        }

        fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.0
                .get(path)
                .map(|body| body.as_bytes().to_vec())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    /// Echoes the file name back and counts invocations.
    #[derive(Default)]
    struct CountingConverter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Converter for CountingConverter {
        fn convert(&self, source: &Path) -> Result<Bytes, ConvertError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConvertError::Io {
                    path: source.to_owned(),
                    source: io::Error::other("disk on fire"),
                });
            }
            Ok(Bytes::from(format!("sheet:{}", source.display())))
        }
    }

    fn dispatcher(converter: Arc<CountingConverter>) -> Dispatcher {
        let fs = MemoryFs(HashMap::from([
            (PathBuf::from("/srv/data.csv"), "a,b\n"),
            (PathBuf::from("/srv/nested/q3.csv"), "1,2\n"),
        ]));
        let cache = ResultCache::new(CacheConfig {
            capacity: 8,
            ttl: Duration::from_secs(600),
            ..CacheConfig::default()
        });
        Dispatcher::new("/srv", Arc::new(cache), Arc::new(fs), converter)
    }

    #[tokio::test]
    async fn converts_once_then_serves_from_cache() {
        let converter = Arc::new(CountingConverter::default());
        let dispatcher = dispatcher(Arc::clone(&converter));

        let first = dispatcher.handle(&Method::Get, "/data.csv").await;
        assert_eq!(first.status(), StatusCode::Ok);
        assert_eq!(first.media_type(), Some(MS_EXCEL));
        assert_eq!(first.payload().as_ref(), b"sheet:/srv/data.csv");

        let second = dispatcher.handle(&Method::Get, "/data.csv").await;
        assert_eq!(second.payload(), first.payload());
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.cache().contains("data.csv"));
    }

    #[tokio::test]
    async fn nested_paths_resolve_under_root() {
        let converter = Arc::new(CountingConverter::default());
        let dispatcher = dispatcher(converter);

        let response = dispatcher.handle(&Method::Get, "/nested/q3.csv").await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert!(dispatcher.cache().contains("nested/q3.csv"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let converter = Arc::new(CountingConverter::default());
        let dispatcher = dispatcher(Arc::clone(&converter));

        let response = dispatcher.handle(&Method::Get, "/missing.csv").await;
        assert_eq!(response.status(), StatusCode::NotFound);
        assert_eq!(response.media_type(), Some("text/plain"));
        assert_eq!(response.payload().as_ref(), b"Error: File not found!");
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_get_is_rejected_before_lookup() {
        let converter = Arc::new(CountingConverter::default());
        let dispatcher = dispatcher(Arc::clone(&converter));

        for method in [Method::Post, Method::Head, Method::Custom("BREW".into())] {
            let response = dispatcher.handle(&method, "/data.csv").await;
            assert_eq!(response.status(), StatusCode::MethodNotAllowed);
            assert_eq!(response.payload().as_ref(), b"Method not allowed!");
        }
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conversion_failure_is_500_and_not_cached() {
        let converter = Arc::new(CountingConverter {
            fail: true,
            ..CountingConverter::default()
        });
        let dispatcher = dispatcher(Arc::clone(&converter));

        for _ in 0..2 {
            let response = dispatcher.handle(&Method::Get, "/data.csv").await;
            assert_eq!(response.status(), StatusCode::InternalServerError);
            assert_eq!(response.payload().as_ref(), b"Error: Conversion failed!");
        }
        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
        assert!(dispatcher.cache().is_empty());
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        assert_eq!(cache_key("/data.csv"), Some("data.csv"));
        assert_eq!(cache_key("//a/b.csv"), Some("a/b.csv"));
        assert_eq!(cache_key("/"), None);
        assert_eq!(cache_key("/../etc/passwd"), None);
        assert_eq!(cache_key("/a/./b.csv"), None);
        assert_eq!(cache_key("/a//b.csv"), None);
        assert_eq!(cache_key("/a\\..\\b.csv"), None);
        assert_eq!(cache_key("/C:/windows.csv"), None);
    }

    #[test]
    fn error_statuses() {
        let timeout = DispatchError::from(CacheError::Timeout {
            key: "k".into(),
            waited: Duration::from_secs(1),
        });
        assert_eq!(timeout.status(), StatusCode::GatewayTimeout);

        let busy = DispatchError::from(CacheError::CacheFull { capacity: 1 });
        assert_eq!(busy.status(), StatusCode::ServiceUnavailable);
        assert_eq!(busy.public_message(), "Error: Server busy!");
    }
}

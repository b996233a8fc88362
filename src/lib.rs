//! # sheetcache
//!
//! An async HTTP/1.1 server that turns CSV files into spreadsheets on demand.
//!
//! `GET /<file>` converts `<root>/<file>` and answers with the workbook as
//! `application/vnd.ms-excel`. Results live in a [`ResultCache`]: a bounded,
//! TTL-expiring map that runs each conversion once, however many requests
//! ask for the same file while it is running.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sheetcache::cache::{CacheConfig, ResultCache};
//! use sheetcache::convert::{CsvConverter, LocalFileSystem};
//! use sheetcache::dispatch::Dispatcher;
//! use sheetcache::http::Request;
//! use sheetcache::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fs = Arc::new(LocalFileSystem);
//!     let cache = Arc::new(ResultCache::new(CacheConfig::default()));
//!     let converter = Arc::new(CsvConverter::new(fs.clone()));
//!     let dispatcher = Arc::new(Dispatcher::new("./data", cache, fs, converter));
//!
//!     let server = Server::bind("127.0.0.1:5050").await?;
//!     server
//!         .run_until(
//!             move |req: Request| {
//!                 let dispatcher = Arc::clone(&dispatcher);
//!                 async move { dispatcher.serve(req).await }
//!             },
//!             async {
//!                 let _ = tokio::signal::ctrl_c().await;
//!             },
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod http;
pub mod logging;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, CacheError, ResultCache};
pub use config::{Config, ConfigError};
pub use dispatch::{DispatchError, Dispatcher};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};

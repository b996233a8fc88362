//! Collaborators that turn a source file into a spreadsheet.
//!
//! The dispatcher only sees the [`FileSystem`] and [`Converter`] traits, so
//! tests and alternative deployments can swap either one out. The defaults
//! are [`LocalFileSystem`] and [`CsvConverter`].

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

mod spreadsheet;

pub use spreadsheet::CsvConverter;

/// Errors produced while converting a source file.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("conversion worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Converts a source file into the bytes of a spreadsheet.
///
/// Implementations must be deterministic for an unchanged source file and
/// report failures as errors, never as empty output. They may block; the
/// dispatcher runs them on tokio's blocking pool.
pub trait Converter: Send + Sync {
    fn convert(&self, source: &Path) -> Result<Bytes, ConvertError>;
}

/// Read-only view of the files that can be served.
pub trait FileSystem: Send + Sync {
    /// Returns `true` if `path` names an existing regular file.
    fn exists(&self, path: &Path) -> bool;

    fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// [`FileSystem`] backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_bytes(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

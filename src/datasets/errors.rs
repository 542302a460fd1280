use std::path::PathBuf;

use thiserror::Error;

use super::pickle::PickleError;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {}: {source}", .path.display())]
    Pickle {
        path: PathBuf,
        #[source]
        source: PickleError,
    },
    #[error("{}: missing key `{key}`", .path.display())]
    MissingKey { path: PathBuf, key: &'static str },
    #[error("{}: `{key}` has unsupported type {found}", .path.display())]
    UnexpectedType {
        path: PathBuf,
        key: &'static str,
        found: String,
    },
    #[error("{}: expected a ({{rows}}, {row_len}) array, found shape {shape:?}", .path.display())]
    BadShape {
        path: PathBuf,
        row_len: usize,
        shape: Vec<usize>,
    },
    #[error("{}: {labels} labels for {rows} images", .path.display())]
    LabelCountMismatch {
        path: PathBuf,
        labels: usize,
        rows: usize,
    },
    #[error("{}: label {label} is not in 0..=255", .path.display())]
    InvalidLabel { path: PathBuf, label: i64 },
    #[cfg(feature = "download")]
    #[error("download failed: {0}")]
    Download(#[from] super::download::DownloadError),
}

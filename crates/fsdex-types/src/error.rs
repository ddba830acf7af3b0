use std::path::PathBuf;

use thiserror::Error;

/// The complete error taxonomy for the watch → load → index pipeline.
///
/// Only [`FsDexError::ConfigError`] is ever surfaced to a caller as a `Result::Err`. Every other
/// variant is constructed at the point of failure, logged via `tracing`, and discarded — the
/// event stream itself carries only successful observations (see the crate-level docs on
/// `fsdex-core` for the propagation policy).
#[derive(Error, Debug)]
pub enum FsDexError {
    /// The root path given to the Watcher does not exist or is not a directory.
    #[error("root path {path:?} does not exist or is not a directory")]
    ConfigError { path: PathBuf },

    /// A file vanished between notification and read, was unreadable due to permissions, or
    /// some other I/O failure occurred mid-read.
    #[error("transient filesystem error for {path:?}: {source}")]
    TransientFsError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file's bytes are not valid UTF-8.
    #[error("{path:?} is not valid UTF-8")]
    EncodingError { path: PathBuf },

    /// The OS watch key for a directory could not be reset, or the watch service itself
    /// terminated.
    #[error("watch service failure for {path:?}: {source}")]
    WatchServiceFailure {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The re-stat after a read produced an mtime strictly older than the mtime observed before
    /// the read. This should be impossible on any POSIX-like filesystem.
    #[error("mtime went backwards for {path:?}: before={before:?} after={after:?}")]
    InvariantViolation {
        path: PathBuf,
        before: std::time::SystemTime,
        after: std::time::SystemTime,
    },
}

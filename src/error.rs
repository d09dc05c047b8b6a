use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::fingerprint::Fingerprint;

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Failures raised by a `UnitResolver` or while collecting a closure.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("unit not found: {name}")]
    NotFound { name: String },

    #[error("invalid unit name: {name:?}")]
    InvalidName { name: String },

    #[error("failed to parse manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("I/O error in {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures while building or applying a fetch response.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The agent reported a request-level failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// A file references content that is neither in the response nor in the local cache.
    #[error("cache error: {path} references {fingerprint}, which is not cached locally")]
    CacheMiss {
        path: String,
        fingerprint: Fingerprint,
    },

    #[error("cache error: content sent as {expected} hashes to {actual}")]
    Corrupt {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("protocol error: content {0} is not referenced by any file")]
    Unreferenced(Fingerprint),

    /// A single file is larger than one response may carry inline.
    #[error("{path} is {size} bytes, over the {limit}-byte inline limit")]
    TooLarge { path: String, size: u64, limit: u64 },

    /// Files were resolved from a response that still had contents pending.
    #[error("protocol error: response is partial; {pending} contents still pending")]
    Incomplete { pending: usize },
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Register {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),

    #[error("watch event channel closed")]
    Closed,

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("refusing to write {path}: {reason}")]
    UnsafePath { path: String, reason: &'static str },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors surfaced by the tunnel and the consumer-side workspace.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("incompatible protocol version {remote} (supported {min}..={max})")]
    VersionMismatch { remote: u16, min: u16, max: u16 },

    /// The peer reported a fatal condition; the process must not keep retrying.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("request failed: {0}")]
    Remote(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

impl TunnelError {
    /// True for errors that a retry after reconnecting may fix.
    pub fn is_transport(&self) -> bool {
        matches!(self, TunnelError::Transport(_) | TunnelError::Closed)
    }
}

impl From<anyhow::Error> for TunnelError {
    fn from(err: anyhow::Error) -> Self {
        // Frame codec errors wrap the underlying I/O failure when there is one.
        match err.downcast::<io::Error>() {
            Ok(io_err) => TunnelError::Transport(io_err),
            Err(other) => TunnelError::Protocol(format!("{:#}", other)),
        }
    }
}

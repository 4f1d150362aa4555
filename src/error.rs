//! Error type shared by the layer engine
//!
//! Configuration-contract violations, unsupported feature combinations and
//! native resource exhaustion all surface as a [`NetError`]. Nothing in the
//! engine recovers from these locally; callers propagate them with `?`.

/// Errors produced by blobs, layers, nets and the native library.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("layer {layer} expects {expected} {what} blob(s), got {actual}")]
    BlobCount {
        layer: String,
        what: &'static str,
        expected: String,
        actual: usize,
    },
    #[error("unknown blob '{0}'")]
    UnknownBlob(String),
    #[error("unknown layer '{0}'")]
    UnknownLayer(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("reserve overwritten since forward: {0}")]
    ReserveOverwritten(String),
    #[error("native library error: {0}")]
    Native(String),
    #[error("layer used before setup")]
    NotSetUp,
    #[error("layer has been disposed")]
    Disposed,
    #[error("operation cancelled")]
    Cancelled,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, NetError>;

use thiserror::Error;

/// Error type used by the fallible operations of this crate.
///
/// The engines themselves never fail: insufficient data and numeric degeneracy are
/// expressed as values (`None`, a score of `0`). Errors only come from configuration,
/// ingress parsing, the snapshot store and the outer I/O surfaces.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("malformed input '{line}': {reason}")]
    Parse { line: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of the external snapshot store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn parse(line: &str, reason: impl ToString) -> Self {
        Error::Parse {
            line: line.to_string(),
            reason: reason.to_string(),
        }
    }
}

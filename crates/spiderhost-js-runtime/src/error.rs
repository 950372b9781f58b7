//! Error types for the spider runtime.

/// Errors that can occur in an engine host.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime has been destroyed")]
    Destroyed,

    #[error("Runtime is not ready: {0}")]
    NotReady(&'static str),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Script source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Invalid script content: {0}")]
    InvalidContent(#[from] ContentError),

    #[error("Spider object was not published under {0}")]
    NotPublished(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("JavaScript error: {0}")]
    JavaScript(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Reasons the content normalizer rejects a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("content is empty")]
    Empty,

    #[error("content exceeds {limit} bytes ({actual})")]
    TooLarge { limit: usize, actual: usize },

    #[error("content looks like an HTML page")]
    Html,

    #[error("compressed payload could not be decoded: {0}")]
    Decompress(String),

    #[error("bzip2 payloads are not supported")]
    Bzip2Unsupported,

    #[error("content has no recognizable script syntax")]
    NotScript,
}

/// Errors raised by the network object.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("Invalid URL {0}: {1}")]
    InvalidUrl(String, String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<rquickjs::Error> for RuntimeError {
    fn from(error: rquickjs::Error) -> Self {
        RuntimeError::JavaScript(error.to_string())
    }
}

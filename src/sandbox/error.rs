use std::io;

/// Errors from sandbox and transport operations.
///
/// Backends map their internal failures into these variants so callers
/// see the same taxonomy regardless of which backend is configured.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox creation failed: {0}")]
    CreateFailed(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("process exited with code {exit_code}")]
    Process { exit_code: i64 },

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("buffer exceeded: {size} bytes > {max} max")]
    BufferExceeded { size: usize, max: usize },

    #[error("input already closed")]
    InputClosed,

    #[error("transport not ready")]
    NotReady,

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Auth rejections must never be retried; everything else is fair
    /// game for the backoff wrapper.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SandboxError::Auth(_))
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Serde(err.to_string())
    }
}

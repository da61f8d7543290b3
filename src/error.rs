use thiserror::Error;

/// Result type for matrix operations
pub type Result<T> = std::result::Result<T, MatrixError>;

/// Errors that can occur when controlling a matrix amplifier
#[derive(Error, Debug)]
pub enum MatrixError {
    /// Transport to the amplifier is unavailable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Referenced input or output index is not currently known
    #[error("{kind} {index} not found")]
    NotFound {
        /// "input" or "output"
        kind: &'static str,
        /// The index that was looked up
        index: u16,
    },

    /// Caller supplied an out-of-domain value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested source does not exist or is disabled
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// Operation needs state that is not known yet
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Device did not acknowledge the command in time
    #[error("Command timeout")]
    CommandTimeout,

    /// Per-output command queue is full
    #[error("Output {0} is busy")]
    Busy(u16),

    /// Session was torn down while the command was pending
    #[error("Command cancelled")]
    Cancelled,

    /// Device returned an error response
    #[error("API error: {detail}")]
    ApiError {
        /// Error detail message from the device
        detail: String,
    },

    /// Invalid or unexpected response from the device
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MatrixError {
    pub(crate) fn output_not_found(index: u16) -> Self {
        MatrixError::NotFound { kind: "output", index }
    }

    pub(crate) fn input_not_found(index: u16) -> Self {
        MatrixError::NotFound { kind: "input", index }
    }

    /// Whether the failed operation may be retried as-is
    ///
    /// Validation failures never succeed on retry; transport, timeout and
    /// queueing failures may.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MatrixError::Connection(_)
                | MatrixError::CommandTimeout
                | MatrixError::Busy(_)
                | MatrixError::Cancelled
        )
    }
}

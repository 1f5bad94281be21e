use thiserror::Error;

/// Application-wide error types for Sift.
#[derive(Error, Debug)]
pub enum AppError {
    /// Store connectivity or query failure. Retried at the worker-loop
    /// level, never charged against a job.
    #[error("Store error: {0}")]
    StoreError(String),

    /// The store refused the data itself (constraint or data exception).
    /// Repeats on every retry, so it is charged against the job.
    #[error("Store rejected data: {0}")]
    DataRejected(String),

    /// HTTP request to the extraction service failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Extraction service returned an error response.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Structural or semantic validation failed.
    #[error("Validation failed: {}", .0.join("; "))]
    ValidationError(Vec<String>),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Missing or malformed configuration.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// A referenced row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied an argument the operation cannot accept.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::StoreError(_) => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::LlmError {
                status_code,
                retryable,
                ..
            } => {
                // Trip on rate limits (429) and server errors (5xx)
                *status_code == 429 || *status_code >= 500 || *retryable
            }
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("connection")
            }
            _ => false,
        }
    }

    /// Store-connectivity failures are handled by the worker loop.
    pub fn is_store_error(&self) -> bool {
        matches!(self, AppError::StoreError(_))
    }
}

use thiserror::Error;

/// The application's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] sonic_rs::Error),

    /// A Base64 decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// An encryption error.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// The ciphertext failed its integrity check (tampered, corrupt or wrong key).
    #[error("Authentication failed: ciphertext rejected")]
    AuthFailure,

    /// The session key is not derivable or has not been created yet.
    #[error("Session key unavailable")]
    KeyUnavailable,

    /// A read or write against the shared store failed.
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// The session has ended or its timer expired.
    #[error("Session has ended")]
    SessionEnded,

    /// A conditional write lost against an existing record.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An authorization error.
    #[error("Authorization failed")]
    Unauthorized,
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::RemoteUnavailable(_) | AppError::KeyUnavailable)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        tracing::error!("Redis error: {}", e);
        AppError::RemoteUnavailable(e.to_string())
    }
}

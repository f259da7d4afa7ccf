/*!
 * Error types for the Modlink store crate.
 */
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug)]
pub enum Error {
    /// The store could not be reached or a round-trip failed
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A subscription operation failed
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] modlink_core::error::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new unavailable error
    pub fn unavailable<S: AsRef<str>>(msg: S) -> Self {
        Error::Unavailable(msg.as_ref().to_string())
    }

    /// Create a new subscription error
    pub fn subscription<S: AsRef<str>>(msg: S) -> Self {
        Error::Subscription(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

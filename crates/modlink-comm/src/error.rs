/*!
 * Error types for the Modlink comm crate.
 */
use thiserror::Error;

/// Error type for transport and queue operations
#[derive(Error, Debug)]
pub enum Error {
    /// The socket is absent or closed; sends are no-ops
    #[error("Transport disconnected")]
    Disconnected,

    /// The transport has been terminated; it will not reconnect
    #[error("Transport terminated")]
    Terminated,

    /// An operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Non-retryable transport failure (TLS, invalid endpoint)
    #[error("Transport error: {0}")]
    Fatal(String),

    /// A framed message exceeded the configured ceiling
    #[error("Frame overflow: {0}")]
    FrameOverflow(String),

    /// The operation is not supported on this substrate
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The endpoint could not be parsed
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] modlink_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport and queue operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new fatal transport error
    pub fn fatal<S: AsRef<str>>(msg: S) -> Self {
        Error::Fatal(msg.as_ref().to_string())
    }

    /// Create a new frame overflow error
    pub fn frame_overflow<S: AsRef<str>>(msg: S) -> Self {
        Error::FrameOverflow(msg.as_ref().to_string())
    }

    /// Create a new unsupported operation error
    pub fn unsupported<S: AsRef<str>>(msg: S) -> Self {
        Error::Unsupported(msg.as_ref().to_string())
    }

    /// Create a new invalid endpoint error
    pub fn invalid_endpoint<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidEndpoint(msg.as_ref().to_string())
    }
}

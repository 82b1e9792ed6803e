//! Error types specific to card transport

/// Transport error type
///
/// Produced by the physical exchange only. The chained transport never retries on these;
/// retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection error
    #[error("Failed to connect to device")]
    Connection,

    /// Transmission error
    #[error("Failed to transmit data")]
    Transmission,

    /// Timeout error (includes touch / user presence timeouts)
    #[error("Operation timed out")]
    Timeout,

    /// The device went away mid-exchange
    #[error("Device disconnected")]
    Disconnected,

    /// Cancelled operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }

    /// Whether the link to the device is gone and a reconnect is needed
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Connection | Self::Disconnected)
    }
}

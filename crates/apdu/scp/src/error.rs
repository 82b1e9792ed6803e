//! Error types for the SCP03 and SCP11b secure channels

use keylink_apdu_core::{StatusWord, TlvError};

/// Result type for secure channel operations
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error type for secure channel operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Errors from the APDU layer (transport, chaining, parsing)
    #[error(transparent)]
    Apdu(#[from] keylink_apdu_core::Error),

    /// Key material has the wrong size for AES-128
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Decrypted data does not end in valid ISO/IEC 7816-4 padding
    #[error("Invalid padding")]
    InvalidPadding,

    /// Response MAC did not verify
    #[error("Response MAC mismatch")]
    MacMismatch,

    /// The channel was closed after an integrity failure or by the caller
    #[error("Secure channel closed")]
    SecureChannelClosed,

    /// No handshake has completed yet
    #[error("Secure channel not established")]
    NotEstablished,

    /// The encryption counter would wrap; a new session is required
    #[error("Encryption counter exhausted")]
    CounterExhausted,

    /// Card authentication failed
    #[error("Card authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// Command encryption was requested on a channel negotiated without it
    #[error("Command encryption not negotiated for this channel")]
    EncryptionNotNegotiated,

    /// The requested security level cannot be negotiated
    #[error("Unsupported security level {0:#04x}")]
    UnsupportedSecurityLevel(u8),

    /// A certificate does not carry a usable P-256 public key
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(&'static str),

    /// Invalid response
    #[error("Invalid response: {0}")]
    InvalidResponse(&'static str),

    /// The card answered a secure channel command with an error status
    #[error("Card returned status {0}")]
    Status(StatusWord),

    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error means the session state can no longer be trusted
    ///
    /// Integrity failures close the channel; everything else leaves it usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Self::InvalidPadding
                | Self::MacMismatch
                | Self::InvalidResponse(_)
                | Self::CounterExhausted
        )
    }
}

impl From<TlvError> for Error {
    fn from(error: TlvError) -> Self {
        Self::Apdu(error.into())
    }
}

/// Extension trait adding context to secure channel results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context<S: Into<String>>(self, context: S) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

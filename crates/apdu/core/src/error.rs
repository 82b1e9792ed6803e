//! Core error type for all APDU operations
//!
//! This module provides a centralized error type used throughout the keylink_apdu_core crate.
//! Errors from the codec, the APDU model and the transport are folded into [`Error`] so that
//! callers can bubble them up through the chained transport and the secure channel layers.

use crate::response::status::StatusWord;
use crate::tlv::TlvError;
use crate::transport::TransportError;

/// Result type for APDU operations
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error for APDU command construction and serialization
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Command data does not fit into the selected APDU format
    #[error("Data too long: {actual} bytes (max {max})")]
    DataTooLong {
        /// Length of the command data
        actual: usize,
        /// Largest length the format can carry
        max: usize,
    },

    /// The caller set the class bit reserved for command chaining
    #[error("CLA {0:#04X} has the command chaining bit (0x10) set")]
    ReservedChainingBit(u8),

    /// Raw command bytes could not be parsed
    #[error("Invalid command length: {0}")]
    InvalidLength(usize),
}

/// Error for APDU response parsing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    /// Response shorter than the two status word bytes
    #[error("Truncated response: {0} bytes, status word missing")]
    TruncatedResponse(usize),
}

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Physical exchange failed (disconnect, timeout, ...)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Response could not be parsed
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// Command could not be built or serialized
    #[error(transparent)]
    Command(#[from] CommandError),

    /// BER-TLV data could not be parsed
    #[error(transparent)]
    Tlv(#[from] TlvError),

    /// An intermediate segment of a chained command was rejected by the card
    #[error("Command chain aborted at segment {segment}: status {status}")]
    ChainAborted {
        /// Zero-based index of the rejected segment
        segment: usize,
        /// Status word returned for that segment
        status: StatusWord,
    },

    /// The card kept announcing more data beyond the configured limit
    #[error("Response chain limit of {0} exchanges exceeded")]
    ChainLimitExceeded(usize),

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

    /// Check whether the root cause is a transport failure
    pub fn is_transport(&self) -> bool {
        matches!(self.root(), Self::Transport(_))
    }
}

/// Extension trait for Result with APDU Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context<S: Into<String>>(self, context: S) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

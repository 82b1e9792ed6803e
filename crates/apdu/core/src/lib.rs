//! APDU plumbing for talking to smart-card tokens
//!
//! Everything between a logical ISO/IEC 7816-4 command and the bytes a card reader moves:
//!
//! - A BER-TLV codec for structured payloads ([`tlv`])
//! - Command and response APDUs with short and extended encodings
//! - The raw [`CardTransport`] boundary implemented by physical drivers
//! - [`ChainedTransport`], which turns one logical command into as many physical exchanges as
//!   command and response chaining require
//! - The [`CommandProcessor`] seam used by secure channels
//! - A [`CommandQueue`] serializing deferred operations behind the command in flight
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub use bytes::{Bytes, BytesMut};

pub mod chain;
pub mod command;
pub mod error;
pub mod executor;
pub mod processor;
pub mod queue;
pub mod response;
pub mod tlv;
pub mod transport;

pub use chain::{ChainedTransport, ChainingConfig, SendRemainingIns};
pub use command::{ApduFormat, Command, ExpectedLength};
pub use error::{CommandError, Error, ResponseError, Result, ResultExt};
pub use executor::Executor;
pub use processor::{CommandProcessor, IdentityProcessor, SecurityLevel};
pub use queue::{CommandQueue, Ticket};
pub use response::Response;
pub use response::status::StatusWord;
pub use tlv::{TlvError, TlvRecord, TlvValue};
pub use transport::{CardTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    // Core types
    pub use crate::{Bytes, BytesMut, Error, ResultExt};

    // Command and response
    pub use crate::{ApduFormat, Command, ExpectedLength, Response, StatusWord};

    // Transport and chaining
    pub use crate::{CardTransport, ChainedTransport, ChainingConfig, SendRemainingIns};

    // Executor and processor layer
    pub use crate::{CommandProcessor, Executor, IdentityProcessor, SecurityLevel};

    // Deferred operations
    pub use crate::CommandQueue;

    // Structured payloads
    pub use crate::tlv::{self, TlvRecord};
}

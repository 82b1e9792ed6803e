//! GlobalPlatform SCP03 and SCP11b secure channels
//!
//! This crate layers a GlobalPlatform Secure Channel Protocol 03 or 11b session over the chained
//! transport of `keylink-apdu-core`:
//!
//! - [`crypto`]: AES-CMAC, the SCP03 KDF, counter derived ICVs and CBC with ISO/IEC 7816-4
//!   padding, plus P-256 ECDH and the X9.63 KDF for SCP11b
//! - [`keys`]: static and session key material
//! - [`state`]: the per-session MAC chain and encryption counter
//! - [`handshake`]: INITIALIZE UPDATE / EXTERNAL AUTHENTICATE
//! - [`scp11`]: INTERNAL AUTHENTICATE key agreement and certificate handling
//! - [`processor`]: the secure channel state machine wrapping and unwrapping APDUs
//! - [`connection`]: a card connection with an optional secure channel
//!
//! ```no_run
//! # use keylink_apdu_core::CardTransport;
//! # fn demo<T: CardTransport>(transport: T) -> keylink_apdu_scp::Result<()> {
//! use keylink_apdu_scp::{Scp03KeyParams, SecureConnection};
//!
//! let mut connection = SecureConnection::new(transport);
//! connection.open_scp03(Scp03KeyParams::default())?;
//! let card_data = connection.get_data(0x0066, &[])?;
//! # let _ = card_data;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod connection;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod processor;
pub mod scp11;
pub mod state;

pub use connection::SecureConnection;
pub use error::{Error, Result, ResultExt};
pub use handshake::{Handshake, HandshakeOutcome, InitializeUpdateResponse, Scp03Handshake};
pub use keys::{KeyRef, Scp03KeyParams, SessionKeys, StaticKeys, derive_session_keys};
pub use processor::{ScpProcessor, ScpStatus};
pub use scp11::{Scp11KeyParams, Scp11bHandshake};
pub use state::ScpState;

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Error, Handshake, KeyRef, Result, ResultExt, Scp03Handshake, Scp03KeyParams,
        Scp11KeyParams, Scp11bHandshake, ScpProcessor, ScpStatus, SecureConnection, StaticKeys,
    };
}

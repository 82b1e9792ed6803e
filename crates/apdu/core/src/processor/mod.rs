//! Command processors for APDU transformations
//!
//! A processor sits between the caller and an [`Executor`]: it may rewrite the command on the
//! way out (secure messaging) and the response on the way back. The plain connection uses
//! [`IdentityProcessor`].

use std::fmt;

use tracing::{debug, trace};

use crate::command::Command;
use crate::executor::Executor;
use crate::response::Response;

/// Security level requested from / provided by a secure channel
///
/// Bit layout follows the GlobalPlatform security level byte sent in EXTERNAL AUTHENTICATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SecurityLevel(u8);

impl SecurityLevel {
    /// Command MAC
    pub const C_MAC: Self = Self(0x01);
    /// Command data encryption
    pub const C_DECRYPTION: Self = Self(0x02);
    /// Response MAC
    pub const R_MAC: Self = Self(0x10);
    /// Response data encryption
    pub const R_ENCRYPTION: Self = Self(0x20);

    /// No security (plain communication)
    pub const fn none() -> Self {
        Self(0)
    }

    /// MAC and encryption in both directions (`0x33`)
    pub const fn full() -> Self {
        Self(0x33)
    }

    /// Build from the raw security level byte
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw security level byte
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Union of two levels
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check whether every flag of `other` is present
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check if this level satisfies the required one
    pub const fn satisfies(&self, required: &Self) -> bool {
        self.contains(*required)
    }

    /// Check whether nothing is protected
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Trait for command processors which transform commands
/// before sending them through an executor
pub trait CommandProcessor: Send + fmt::Debug {
    /// Error type returned by the processor
    type Error: From<crate::Error> + fmt::Debug;

    /// Process a command through this processor
    ///
    /// This method takes a command, potentially transforms it, sends it through
    /// the executor, and potentially transforms the response.
    fn process_command(
        &mut self,
        command: &Command,
        executor: &mut dyn Executor,
    ) -> Result<Response, Self::Error> {
        trace!(
            cla = command.cla,
            ins = command.ins,
            processor = std::any::type_name::<Self>(),
            "Processing command"
        );

        let result = self.do_process_command(command, executor);

        match &result {
            Ok(response) => {
                trace!(status = %response.status, "Processed response");
            }
            Err(e) => {
                debug!(error = ?e, "Error during command processing");
            }
        }

        result
    }

    /// Internal implementation of process_command
    fn do_process_command(
        &mut self,
        command: &Command,
        executor: &mut dyn Executor,
    ) -> Result<Response, Self::Error>;

    /// Get the security level provided by this processor
    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::none()
    }

    /// Check if this processor is active/ready
    fn is_active(&self) -> bool {
        true
    }
}

/// Identity processor that doesn't modify commands
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProcessor;

impl CommandProcessor for IdentityProcessor {
    type Error = crate::Error;

    fn do_process_command(
        &mut self,
        command: &Command,
        executor: &mut dyn Executor,
    ) -> Result<Response, Self::Error> {
        executor.transmit(command)
    }
}

//! Secure connection to a card
//!
//! [`SecureConnection`] bundles the chained transport, the optional secure channel processor
//! and the queue of deferred operations for one card. It is the single-flight point for that
//! card: every exchange goes through `&mut self`.

use bytes::Bytes;
use keylink_apdu_core::prelude::*;
use tracing::{debug, info};

use crate::constants::{cla, data_object, ins};
use crate::handshake::{Handshake, Scp03Handshake};
use crate::keys::{KeyRef, Scp03KeyParams};
use crate::processor::{ScpProcessor, ScpStatus};
use crate::scp11::{Scp11KeyParams, Scp11bHandshake, certificate_store_request, split_certificates};
use crate::{Error, Result};

/// Connection to a card with an optional SCP03 or SCP11b secure channel
#[derive(Debug)]
pub struct SecureConnection<T: CardTransport> {
    /// Chained transport carrying every exchange
    transport: ChainedTransport<T>,
    /// Secure channel, once one was opened
    processor: Option<ScpProcessor>,
    /// Operations to run after the current commands
    queue: CommandQueue<Self>,
}

impl<T: CardTransport> SecureConnection<T> {
    /// Create a plain connection with the default chaining configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ChainingConfig::default())
    }

    /// Create a plain connection with a custom chaining configuration
    pub fn with_config(transport: T, config: ChainingConfig) -> Self {
        Self {
            transport: ChainedTransport::with_config(transport, config),
            processor: None,
            queue: CommandQueue::new(),
        }
    }

    /// Open an SCP03 secure channel with the given keys
    pub fn open_scp03(&mut self, params: Scp03KeyParams) -> Result<()> {
        info!(key_ref = %params.key_ref, "Opening SCP03 secure channel");
        self.open_with(&mut Scp03Handshake::new(params))
    }

    /// Open an SCP11b secure channel against the given Security Domain key
    pub fn open_scp11b(&mut self, params: Scp11KeyParams) -> Result<()> {
        info!(key_ref = %params.key_ref, "Opening SCP11b secure channel");
        self.open_with(&mut Scp11bHandshake::new(params))
    }

    /// Open a secure channel using `handshake`
    ///
    /// Replaces any channel opened before. On failure the connection is left without a secure
    /// channel.
    pub fn open_with(&mut self, handshake: &mut dyn Handshake) -> Result<()> {
        self.processor = None;

        let mut processor = ScpProcessor::new();
        processor.establish(handshake, &mut self.transport)?;
        self.processor = Some(processor);
        Ok(())
    }

    /// Send a command, through the secure channel when one was opened
    ///
    /// `encrypt` selects data encryption and needs a channel negotiated with C-DEC; MAC
    /// protection always applies once a channel exists. Without a channel only unencrypted
    /// commands are allowed and they go out in the clear.
    pub fn send(&mut self, command: &Command, encrypt: bool) -> Result<Response> {
        match self.processor.as_mut() {
            Some(processor) => processor.execute(command, encrypt, &mut self.transport),
            None if encrypt => Err(Error::NotEstablished),
            None => self.send_plain(command),
        }
    }

    /// Send a command in the clear, bypassing any secure channel
    pub fn send_plain(&mut self, command: &Command) -> Result<Response> {
        Ok(self.transport.transmit(command)?)
    }

    /// GET DATA for `tag` on the selected Security Domain
    ///
    /// Goes through the secure channel when one is open, encrypted if the channel was negotiated
    /// with C-DEC. Returns the response data or [`Error::Status`] for anything other than `9000`.
    pub fn get_data(&mut self, tag: u16, data: &[u8]) -> Result<Bytes> {
        let [p1, p2] = tag.to_be_bytes();
        let command = Command::new_with_data(
            cla::GP,
            ins::GET_DATA,
            p1,
            p2,
            Bytes::copy_from_slice(data),
        )
        .with_le(0);

        let encrypt = self.security_level().contains(SecurityLevel::C_DECRYPTION);
        let response = self.send(&command, encrypt)?;
        if !response.is_success() {
            debug!(tag, status = %response.status, "GET DATA failed");
            return Err(Error::Status(response.status));
        }
        Ok(response.data)
    }

    /// Read the certificate chain of a Security Domain key, leaf last
    ///
    /// A key without certificates, answered with `6A88`, yields an empty chain.
    pub fn get_certificate_bundle(&mut self, key_ref: KeyRef) -> Result<Vec<Bytes>> {
        let request = certificate_store_request(key_ref)?;
        match self.get_data(data_object::CERTIFICATE_STORE, &request) {
            Ok(data) => {
                let certificates = split_certificates(&data)?;
                debug!(%key_ref, count = certificates.len(), "Read certificate bundle");
                Ok(certificates)
            }
            Err(Error::Status(status)) if status == StatusWord::new(0x6A, 0x88) => {
                debug!(%key_ref, "No certificates stored for key");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Close the secure channel
    ///
    /// Further protected commands fail with [`Error::SecureChannelClosed`] until a new channel
    /// is opened.
    pub fn close(&mut self) {
        if let Some(processor) = self.processor.as_mut() {
            processor.close();
        }
    }

    /// Whether commands are currently protected
    pub fn is_secure(&self) -> bool {
        self.processor.as_ref().is_some_and(|p| p.is_active())
    }

    /// Lifecycle status of the secure channel
    pub fn channel_status(&self) -> ScpStatus {
        self.processor
            .as_ref()
            .map_or(ScpStatus::Unestablished, ScpProcessor::status)
    }

    /// Security level of the open channel
    pub fn security_level(&self) -> SecurityLevel {
        self.processor
            .as_ref()
            .map_or(SecurityLevel::none(), |p| p.security_level())
    }

    /// Get a reference to the underlying transport
    pub const fn transport(&self) -> &T {
        self.transport.transport()
    }

    /// Get a mutable reference to the underlying transport
    pub const fn transport_mut(&mut self) -> &mut T {
        self.transport.transport_mut()
    }

    /// Handle to the deferred operation queue
    ///
    /// Operations queued through it run, in order, on the next [`Self::run_queued`].
    pub fn queue(&self) -> CommandQueue<Self> {
        self.queue.clone()
    }

    /// Run every queued operation against this connection
    pub fn run_queued(&mut self) -> usize {
        let queue = self.queue.clone();
        queue.run_pending(self)
    }

    /// Consume the connection and return the underlying transport
    pub fn into_transport(self) -> T {
        self.transport.into_transport()
    }
}

//! Command and response chaining over a raw card transport
//!
//! [`ChainedTransport`] is the single point through which a connection talks to the card. It
//! splits command data that does not fit a single APDU (ISO/IEC 7816-4 command chaining) and
//! drains `61XX` responses with the configured "get remaining data" instruction.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::command::{ApduFormat, CHAINING_BIT, Command, MAX_EXTENDED_DATA, MAX_SHORT_DATA};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::response::Response;
use crate::transport::CardTransport;

/// Instruction used to fetch the remainder of a chained response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendRemainingIns {
    /// ISO/IEC 7816-4 GET RESPONSE (`C0`)
    #[default]
    Normal,
    /// SEND REMAINING (`A5`) as used by OATH applets
    Oath,
    /// Any other application specific instruction
    Custom(u8),
}

impl SendRemainingIns {
    /// Instruction byte to send
    pub const fn ins(self) -> u8 {
        match self {
            Self::Normal => 0xC0,
            Self::Oath => 0xA5,
            Self::Custom(ins) => ins,
        }
    }
}

/// Configuration for [`ChainedTransport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainingConfig {
    /// Largest data field sent in one short APDU
    pub max_segment_len: usize,
    /// Whether large commands are chained (`Short`) or sent as one extended APDU
    pub apdu_format: ApduFormat,
    /// Instruction used while draining `61XX` responses
    pub send_remaining: SendRemainingIns,
    /// Upper bound on "get remaining data" exchanges for one command
    pub max_response_chain: usize,
}

impl Default for ChainingConfig {
    fn default() -> Self {
        Self {
            max_segment_len: MAX_SHORT_DATA,
            apdu_format: ApduFormat::Short,
            send_remaining: SendRemainingIns::Normal,
            max_response_chain: 64,
        }
    }
}

impl ChainingConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the largest data field per short APDU, capped at 255
    pub const fn with_max_segment_len(mut self, len: usize) -> Self {
        self.max_segment_len = if len == 0 || len > MAX_SHORT_DATA {
            MAX_SHORT_DATA
        } else {
            len
        };
        self
    }

    /// Set the APDU format
    pub const fn with_apdu_format(mut self, format: ApduFormat) -> Self {
        self.apdu_format = format;
        self
    }

    /// Set the "get remaining data" instruction
    pub const fn with_send_remaining(mut self, ins: SendRemainingIns) -> Self {
        self.send_remaining = ins;
        self
    }

    /// Set the response chain limit
    pub const fn with_max_response_chain(mut self, max: usize) -> Self {
        self.max_response_chain = max;
        self
    }

    const fn segment_len(&self) -> usize {
        match self.apdu_format {
            ApduFormat::Short => self.max_segment_len,
            ApduFormat::Extended => MAX_EXTENDED_DATA,
        }
    }
}

/// Executor that performs command and response chaining over a [`CardTransport`]
///
/// Errors from the transport abort the whole logical exchange; partial response data is
/// dropped and nothing is retried.
#[derive(Debug)]
pub struct ChainedTransport<T: CardTransport> {
    transport: T,
    config: ChainingConfig,
}

impl<T: CardTransport> ChainedTransport<T> {
    /// Create a new chained transport with default configuration
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ChainingConfig::default())
    }

    /// Create a new chained transport with the given configuration
    pub const fn with_config(transport: T, config: ChainingConfig) -> Self {
        Self { transport, config }
    }

    /// Get a reference to the underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Take ownership of the transport and return it
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Current chaining configuration
    pub const fn config(&self) -> &ChainingConfig {
        &self.config
    }

    /// Check if the transport is connected to a physical card
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Reset the transport connection
    pub fn reset(&mut self) -> Result<()> {
        self.transport.reset().map_err(Into::into)
    }

    fn exchange(&mut self, command: &Command) -> Result<Response> {
        let format = match self.config.apdu_format {
            ApduFormat::Short => ApduFormat::Short,
            ApduFormat::Extended => command.format(),
        };
        let raw = command.to_bytes_with(format)?;
        let response = self
            .transport
            .transmit_raw(&raw)
            .map_err(Into::<Error>::into)?;
        Ok(Response::from_bytes(&response)?)
    }

    fn send_segments(&mut self, command: &Command) -> Result<Response> {
        let segment_len = self.config.segment_len();
        if command.data.len() <= segment_len {
            return self.exchange(command);
        }

        let segments = command.data.len().div_ceil(segment_len);
        trace!(
            total_len = command.data.len(),
            segments,
            segment_len,
            "Chaining command"
        );

        for index in 0..segments - 1 {
            let start = index * segment_len;
            let segment = Command {
                cla: command.cla | CHAINING_BIT,
                data: command.data.slice(start..start + segment_len),
                le: None,
                ..command.clone()
            };

            let response = self.exchange(&segment)?;
            if !response.is_success() {
                debug!(
                    segment = index,
                    status = %response.status,
                    "Card rejected chained segment"
                );
                return Err(Error::ChainAborted {
                    segment: index,
                    status: response.status,
                });
            }
        }

        let last = Command {
            data: command.data.slice((segments - 1) * segment_len..),
            ..command.clone()
        };
        self.exchange(&last)
    }

    fn drain_response(&mut self, first: Response) -> Result<Response> {
        if !first.status.is_more_data_available() {
            return Ok(first);
        }

        let mut buffer = BytesMut::from(first.data.as_ref());
        let mut status = first.status;
        let mut exchanges = 0;

        while let Some(remaining) = status.remaining_bytes() {
            if exchanges >= self.config.max_response_chain {
                debug!(limit = self.config.max_response_chain, "Response chain limit reached");
                return Err(Error::ChainLimitExceeded(self.config.max_response_chain));
            }

            trace!(remaining, chain_count = exchanges + 1, "Fetching remaining data");
            let get_response =
                Command::new(0x00, self.config.send_remaining.ins(), 0x00, 0x00).with_le(remaining);
            let response = self.exchange(&get_response)?;

            buffer.extend_from_slice(&response.data);
            status = response.status;
            exchanges += 1;
        }

        trace!(
            total_data_len = buffer.len(),
            final_sw = %status,
            "Completed response chaining"
        );

        Ok(Response::new(Bytes::from(buffer), status))
    }
}

impl<T: CardTransport> Executor for ChainedTransport<T> {
    fn do_transmit(&mut self, command: &Command) -> Result<Response> {
        command.validate()?;
        let response = self.send_segments(command)?;
        self.drain_response(response)
    }
}

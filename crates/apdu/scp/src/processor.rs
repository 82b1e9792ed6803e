//! Secure channel command processor
//!
//! [`ScpProcessor`] owns the session state of one secure channel and moves through
//! `Unestablished → Established → Closed`. Once established it wraps every command with
//! (optional) data encryption and a chained C-MAC, and verifies, strips and decrypts every
//! response as far as the negotiated security level asks for. Integrity failures close the
//! channel for good; other failures roll the state back so the next command continues the chain
//! as if the failed one was never sent.

use bytes::{BufMut, Bytes, BytesMut};
use derive_more::Display;
use keylink_apdu_core::prelude::*;
use keylink_apdu_core::{CommandError, command::MAX_EXTENDED_DATA};
use tracing::{debug, trace, warn};

use crate::constants::{MAC_SIZE, cla};
use crate::handshake::Handshake;
use crate::state::ScpState;
use crate::{Error, Result, ResultExt};

/// Externally visible lifecycle of a secure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ScpStatus {
    /// No handshake has completed
    Unestablished,
    /// Commands are protected
    Established,
    /// The channel failed or was closed and can no longer be used
    Closed,
}

#[derive(Debug)]
enum Phase {
    Unestablished,
    Established(ScpState),
    Closed,
}

/// Secure channel processor shared by SCP03 and SCP11b
#[derive(Debug)]
pub struct ScpProcessor {
    phase: Phase,
    security_level: SecurityLevel,
}

impl Default for ScpProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScpProcessor {
    /// Create a processor with no session
    pub const fn new() -> Self {
        Self {
            phase: Phase::Unestablished,
            security_level: SecurityLevel::none(),
        }
    }

    /// Create a processor for a session established elsewhere
    pub const fn from_state(state: ScpState, security_level: SecurityLevel) -> Self {
        Self {
            phase: Phase::Established(state),
            security_level,
        }
    }

    /// Current lifecycle status
    pub const fn status(&self) -> ScpStatus {
        match self.phase {
            Phase::Unestablished => ScpStatus::Unestablished,
            Phase::Established(_) => ScpStatus::Established,
            Phase::Closed => ScpStatus::Closed,
        }
    }

    /// Session state, while established
    pub const fn state(&self) -> Option<&ScpState> {
        match &self.phase {
            Phase::Established(state) => Some(state),
            _ => None,
        }
    }

    /// Run `handshake` and authenticate the new session
    ///
    /// Any previous session is discarded first. A command returned by the handshake is sent
    /// MAC-protected but not encrypted, already under the negotiated level; if the card rejects
    /// it the channel is closed.
    pub fn establish(
        &mut self,
        handshake: &mut dyn Handshake,
        executor: &mut dyn Executor,
    ) -> Result<()> {
        self.phase = Phase::Unestablished;
        self.security_level = SecurityLevel::none();

        let outcome = handshake.initialize(executor)?;
        self.phase = Phase::Established(ScpState::new(outcome.keys, outcome.mac_chain));
        self.security_level = outcome.security_level;

        if let Some(authenticate) = &outcome.authenticate {
            let response = match self.execute(authenticate, false, executor) {
                Ok(response) => response,
                Err(e) => {
                    self.close();
                    return Err(e.with_context("EXTERNAL AUTHENTICATE"));
                }
            };
            if !response.is_success() {
                warn!(status = %response.status, "EXTERNAL AUTHENTICATE rejected");
                self.close();
                return Err(Error::Status(response.status));
            }
        }

        debug!(level = self.security_level.bits(), "Secure channel established");
        Ok(())
    }

    /// Send `command` through the secure channel
    ///
    /// With `encrypt` set the command data is encrypted (empty data included) and, on an
    /// R-ENC channel, the response data is decrypted. Encryption needs a C-DEC channel;
    /// otherwise nothing is sent and [`Error::EncryptionNotNegotiated`] is returned. Status words
    /// are returned as is; only protocol failures are errors.
    pub fn execute(
        &mut self,
        command: &Command,
        encrypt: bool,
        executor: &mut dyn Executor,
    ) -> Result<Response> {
        let level = self.security_level;
        let state = match &mut self.phase {
            Phase::Established(state) => state,
            Phase::Unestablished => return Err(Error::NotEstablished),
            Phase::Closed => return Err(Error::SecureChannelClosed),
        };

        if encrypt && !level.contains(SecurityLevel::C_DECRYPTION) {
            return Err(Error::EncryptionNotNegotiated);
        }

        let checkpoint = state.checkpoint();
        match exchange(state, command, encrypt, level, executor) {
            Ok(response) => Ok(response),
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "Closing secure channel");
                self.phase = Phase::Closed;
                self.security_level = SecurityLevel::none();
                Err(e)
            }
            Err(e) => {
                debug!(error = %e, "Rolling back secure channel state");
                state.restore(checkpoint);
                Err(e)
            }
        }
    }

    /// Close the channel and drop the session keys
    pub fn close(&mut self) {
        if matches!(self.phase, Phase::Established(_)) {
            debug!("Secure channel closed");
        }
        self.phase = Phase::Closed;
        self.security_level = SecurityLevel::none();
    }
}

/// Protect `command` under `state`
///
/// Encrypts the data when asked, advances the counter for encrypted commands and appends the
/// C-MAC computed over the protected header, Lc and data.
pub fn wrap_command(state: &mut ScpState, command: &Command, encrypt: bool) -> Result<Command> {
    command.validate().map_err(keylink_apdu_core::Error::from)?;

    let data = if encrypt {
        let encrypted = state.encrypt(&command.data)?;
        state.advance_counter()?;
        encrypted
    } else {
        command.data.to_vec()
    };

    let lc = data.len() + MAC_SIZE;
    if lc > MAX_EXTENDED_DATA {
        return Err(keylink_apdu_core::Error::from(CommandError::DataTooLong {
            actual: lc,
            max: MAX_EXTENDED_DATA,
        })
        .into());
    }

    let cla = command.cla | cla::SECURE_MESSAGING;
    let mut mac_input = BytesMut::with_capacity(7 + data.len());
    mac_input.put_slice(&[cla, command.ins, command.p1, command.p2]);
    match u8::try_from(lc) {
        Ok(short) => mac_input.put_u8(short),
        Err(_) => {
            mac_input.put_u8(0x00);
            mac_input.put_u16(lc as u16);
        }
    }
    mac_input.put_slice(&data);

    let mac = state.mac(&mac_input)?;

    let mut protected = BytesMut::with_capacity(lc);
    protected.put_slice(&data);
    protected.put_slice(&mac);

    let mut wrapped = Command::new_with_data(cla, command.ins, command.p1, command.p2, protected);
    wrapped.le = command.le;
    Ok(wrapped)
}

/// Undo the response protection `level` calls for
///
/// The R-MAC is verified and stripped on R-MAC channels. The data is decrypted on R-ENC
/// channels when the command was encrypted.
pub fn unwrap_response(
    state: &ScpState,
    response: Response,
    level: SecurityLevel,
    encrypted: bool,
) -> Result<Response> {
    if response.data.is_empty() || !level.contains(SecurityLevel::R_MAC) {
        return Ok(response);
    }
    if response.data.len() < MAC_SIZE {
        return Err(Error::InvalidResponse("response shorter than R-MAC"));
    }

    let body = state.unmac(&response.data, response.status.to_bytes())?;
    let data = if encrypted && level.contains(SecurityLevel::R_ENCRYPTION) && !body.is_empty() {
        state.decrypt_response(&body).context("Decrypting response")?
    } else {
        body
    };
    Ok(Response::new(Bytes::from(data), response.status))
}

fn exchange(
    state: &mut ScpState,
    command: &Command,
    encrypt: bool,
    level: SecurityLevel,
    executor: &mut dyn Executor,
) -> Result<Response> {
    let wrapped = wrap_command(state, command, encrypt)?;
    trace!(
        cla = wrapped.cla,
        ins = wrapped.ins,
        counter = state.enc_counter(),
        "Sending protected command"
    );

    let response = executor.transmit(&wrapped)?;
    unwrap_response(state, response, level, encrypt)
}

impl CommandProcessor for ScpProcessor {
    type Error = Error;

    fn do_process_command(
        &mut self,
        command: &Command,
        executor: &mut dyn Executor,
    ) -> Result<Response> {
        let encrypt = self.security_level.contains(SecurityLevel::C_DECRYPTION);
        self.execute(command, encrypt, executor)
    }

    fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Established(_))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::crypto::{cbc_encrypt, cmac, counter_iv};
    use crate::handshake::HandshakeOutcome;
    use crate::keys::{SessionKeys, StaticKeys, derive_session_keys};
    use hex_literal::hex;
    use keylink_apdu_core::TransportError;

    #[derive(Debug, Default)]
    struct Scripted {
        responses: VecDeque<keylink_apdu_core::Result<Response>>,
        commands: Vec<Command>,
    }

    impl Executor for Scripted {
        fn do_transmit(&mut self, command: &Command) -> keylink_apdu_core::Result<Response> {
            self.commands.push(command.clone());
            self.responses
                .pop_front()
                .unwrap_or(Err(TransportError::Disconnected.into()))
        }
    }

    fn session_keys() -> SessionKeys {
        derive_session_keys(&StaticKeys::default_keys(), &[0x5A; 16]).unwrap()
    }

    fn pair() -> (ScpProcessor, ScpState) {
        pair_at(SecurityLevel::full())
    }

    fn pair_at(level: SecurityLevel) -> (ScpProcessor, ScpState) {
        let host = ScpProcessor::from_state(ScpState::new(session_keys(), [0u8; 16]), level);
        (host, ScpState::new(session_keys(), [0u8; 16]))
    }

    /// Mirror what the card does: follow the command chain and build a protected reply
    fn card_reply(
        card: &mut ScpState,
        command: &Command,
        encrypt: bool,
        body: &[u8],
        status: u16,
    ) -> Response {
        wrap_command(card, command, encrypt).unwrap();
        let sw = status.to_be_bytes();

        let data = if encrypt && !body.is_empty() {
            let iv = counter_iv(card.keys().senc(), card.enc_counter() - 1, true).unwrap();
            cbc_encrypt(card.keys().senc(), &iv, body).unwrap()
        } else {
            body.to_vec()
        };
        let rmac = cmac(card.keys().srmac(), &[card.mac_chain(), &data, &sw]).unwrap();
        Response::new([&data[..], &rmac[..MAC_SIZE]].concat(), status)
    }

    #[test]
    fn test_unestablished_and_closed_refuse_commands() {
        let mut executor = Scripted::default();
        let mut processor = ScpProcessor::new();
        let command = Command::new(0x80, 0xCA, 0x00, 0x66);

        assert_eq!(
            processor.execute(&command, true, &mut executor),
            Err(Error::NotEstablished)
        );
        processor.close();
        assert_eq!(processor.status(), ScpStatus::Closed);
        assert_eq!(
            processor.execute(&command, true, &mut executor),
            Err(Error::SecureChannelClosed)
        );
        assert!(executor.commands.is_empty());
    }

    #[test]
    fn test_encrypted_command_round_trip() {
        let (mut processor, mut card) = pair();
        let command = Command::new_with_data(0x80, 0xEE, 0x01, 0x02, &b"secret"[..]).with_le(0);

        let mut executor = Scripted::default();
        executor
            .responses
            .push_back(Ok(card_reply(&mut card, &command, true, b"reply", 0x9000)));

        let response = processor.execute(&command, true, &mut executor).unwrap();
        assert_eq!(response.data.as_ref(), b"reply");
        assert!(response.is_success());

        let sent = &executor.commands[0];
        assert_eq!(sent.header(), [0x84, 0xEE, 0x01, 0x02]);
        assert_eq!(sent.data.len(), 16 + MAC_SIZE);
        assert_eq!(sent.le, Some(0));

        let state = processor.state().unwrap();
        assert_eq!(state.enc_counter(), 2);
        assert_eq!(state.mac_chain(), card.mac_chain());
    }

    #[test]
    fn test_mac_only_command_keeps_counter() {
        let (mut processor, mut card) = pair();
        let command = Command::new_with_data(0x80, 0xEE, 0x00, 0x00, &b"plain"[..]);

        let mut executor = Scripted::default();
        executor
            .responses
            .push_back(Ok(card_reply(&mut card, &command, false, b"", 0x9000)));

        let response = processor.execute(&command, false, &mut executor).unwrap();
        assert!(response.data.is_empty());

        let sent = &executor.commands[0];
        assert_eq!(&sent.data[..5], b"plain");
        assert_eq!(processor.state().unwrap().enc_counter(), 1);
    }

    #[test]
    fn test_mac_input_layout() {
        let mut state = ScpState::new(session_keys(), [0u8; 16]);
        let command = Command::new_with_data(0x80, 0xEE, 0x00, 0x00, hex!("0102").to_vec());
        let wrapped = wrap_command(&mut state, &command, false).unwrap();

        let expected = cmac(
            session_keys().smac(),
            &[&[0u8; 16], &hex!("84EE0000 0A 0102")],
        )
        .unwrap();
        assert_eq!(&wrapped.data[2..], &expected[..MAC_SIZE]);
        assert_eq!(state.mac_chain(), &expected);
    }

    #[test]
    fn test_corrupted_mac_closes_channel() {
        let (mut processor, mut card) = pair();
        let command = Command::new(0x80, 0xCA, 0x00, 0x66).with_le(0);

        let mut reply = card_reply(&mut card, &command, true, b"data", 0x9000);
        let mut data = reply.data.to_vec();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        reply.data = data.into();

        let mut executor = Scripted::default();
        executor.responses.push_back(Ok(reply));

        assert_eq!(
            processor.execute(&command, true, &mut executor),
            Err(Error::MacMismatch)
        );
        assert_eq!(processor.status(), ScpStatus::Closed);
        assert!(!processor.is_active());

        assert_eq!(
            processor.execute(&command, true, &mut executor),
            Err(Error::SecureChannelClosed)
        );
        assert_eq!(executor.commands.len(), 1);
    }

    #[test]
    fn test_short_response_is_fatal() {
        let (mut processor, _) = pair();
        let mut executor = Scripted::default();
        executor
            .responses
            .push_back(Ok(Response::new(hex!("0102030405").to_vec(), 0x9000u16)));

        let result = processor.execute(&Command::new(0x80, 0xCA, 0x00, 0x66), true, &mut executor);
        assert!(matches!(result, Err(Error::InvalidResponse(_))));
        assert_eq!(processor.status(), ScpStatus::Closed);
    }

    #[test]
    fn test_transport_error_rolls_back() {
        let (mut processor, mut card) = pair();
        let command = Command::new_with_data(0x80, 0xEE, 0x00, 0x00, &b"retry"[..]);

        let mut executor = Scripted::default();
        executor
            .responses
            .push_back(Err(TransportError::Timeout.into()));

        let err = processor.execute(&command, true, &mut executor).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(processor.status(), ScpStatus::Established);
        assert_eq!(processor.state().unwrap().enc_counter(), 1);
        assert_eq!(processor.state().unwrap().mac_chain(), &[0u8; 16]);

        // The retry is protected exactly like the first attempt
        executor
            .responses
            .push_back(Ok(card_reply(&mut card, &command, true, b"ok", 0x9000)));
        let response = processor.execute(&command, true, &mut executor).unwrap();
        assert_eq!(response.data.as_ref(), b"ok");
        assert_eq!(executor.commands[0], executor.commands[1]);
    }

    #[test]
    fn test_error_status_without_data_passes_through() {
        let (mut processor, _) = pair();
        let mut executor = Scripted::default();
        executor
            .responses
            .push_back(Ok(Response::status_only(0x6982u16)));

        let response = processor
            .execute(&Command::new(0x80, 0xCA, 0x00, 0x66), true, &mut executor)
            .unwrap();
        assert_eq!(response.status, StatusWord::new(0x69, 0x82));
        assert_eq!(processor.status(), ScpStatus::Established);
    }

    #[derive(Debug)]
    struct FixedHandshake(Option<HandshakeOutcome>);

    impl Handshake for FixedHandshake {
        fn initialize(&mut self, _executor: &mut dyn Executor) -> Result<HandshakeOutcome> {
            self.0.take().ok_or(Error::NotEstablished)
        }
    }

    fn fixed_handshake() -> FixedHandshake {
        FixedHandshake(Some(HandshakeOutcome {
            keys: session_keys(),
            mac_chain: [0u8; 16],
            security_level: SecurityLevel::full(),
            authenticate: Some(Command::new_with_data(
                0x80,
                0x82,
                0x33,
                0x00,
                [0xAB; 8].to_vec(),
            )),
        }))
    }

    #[test]
    fn test_establish() {
        let mut processor = ScpProcessor::new();
        let mut executor = Scripted::default();
        executor.responses.push_back(Ok(Response::success(Bytes::new())));

        processor
            .establish(&mut fixed_handshake(), &mut executor)
            .unwrap();

        assert_eq!(processor.status(), ScpStatus::Established);
        assert_eq!(processor.security_level(), SecurityLevel::full());
        let sent = executor.commands[0].try_to_bytes().unwrap();
        assert_eq!(&sent[..5], &hex!("8482330010"));
        assert_eq!(&sent[5..13], &[0xABu8; 8]);
        assert_eq!(processor.state().unwrap().enc_counter(), 1);
    }

    #[test]
    fn test_rejected_authentication_closes() {
        let mut processor = ScpProcessor::new();
        let mut executor = Scripted::default();
        executor
            .responses
            .push_back(Ok(Response::status_only(0x6300u16)));

        assert_eq!(
            processor.establish(&mut fixed_handshake(), &mut executor),
            Err(Error::Status(StatusWord::new(0x63, 0x00)))
        );
        assert_eq!(processor.status(), ScpStatus::Closed);
        assert!(processor.security_level().is_none());
    }

    #[test]
    fn test_establish_without_authenticate_command() {
        let mut processor = ScpProcessor::new();
        let mut executor = Scripted::default();
        let mut handshake = fixed_handshake();
        if let Some(outcome) = handshake.0.as_mut() {
            outcome.authenticate = None;
        }

        processor.establish(&mut handshake, &mut executor).unwrap();
        assert!(executor.commands.is_empty());
        assert_eq!(processor.status(), ScpStatus::Established);
        assert_eq!(processor.security_level(), SecurityLevel::full());
    }

    #[test]
    fn test_mac_only_channel() {
        let (mut processor, mut card) = pair_at(SecurityLevel::C_MAC);
        let command = Command::new_with_data(0x80, 0xEE, 0x00, 0x00, &b"clear"[..]);
        let mut executor = Scripted::default();

        assert_eq!(
            processor.execute(&command, true, &mut executor),
            Err(Error::EncryptionNotNegotiated)
        );
        assert!(executor.commands.is_empty());
        assert_eq!(processor.status(), ScpStatus::Established);

        // Without R-MAC the reply is handed back untouched, even when shorter than a MAC
        wrap_command(&mut card, &command, false).unwrap();
        executor
            .responses
            .push_back(Ok(Response::new(hex!("0102030405").to_vec(), 0x9000u16)));
        let response = processor
            .process_command(&command, &mut executor)
            .unwrap();
        assert_eq!(response.data.as_ref(), &hex!("0102030405"));

        let sent = &executor.commands[0];
        assert_eq!(sent.header(), [0x84, 0xEE, 0x00, 0x00]);
        assert_eq!(&sent.data[..5], b"clear");
        let state = processor.state().unwrap();
        assert_eq!(state.enc_counter(), 1);
        assert_eq!(state.mac_chain(), card.mac_chain());
    }

    #[test]
    fn test_response_mac_without_response_encryption() {
        let level = SecurityLevel::C_MAC
            .with(SecurityLevel::C_DECRYPTION)
            .with(SecurityLevel::R_MAC);
        let (mut processor, mut card) = pair_at(level);
        let command = Command::new_with_data(0x80, 0xEE, 0x00, 0x00, &b"secret"[..]);

        // The card encrypts nothing on the way back but still MACs the reply
        wrap_command(&mut card, &command, true).unwrap();
        let rmac = cmac(card.keys().srmac(), &[card.mac_chain(), b"reply", &hex!("9000")]).unwrap();
        let reply = Response::new([&b"reply"[..], &rmac[..MAC_SIZE]].concat(), 0x9000u16);

        let mut executor = Scripted::default();
        executor.responses.push_back(Ok(reply));
        let response = processor
            .process_command(&command, &mut executor)
            .unwrap();

        assert_eq!(response.data.as_ref(), b"reply");
        assert_eq!(executor.commands[0].data.len(), 16 + MAC_SIZE);
        assert_eq!(processor.state().unwrap().enc_counter(), 2);
    }
}

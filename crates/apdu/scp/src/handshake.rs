//! Handshakes that establish a secure channel session
//!
//! A [`Handshake`] runs the unprotected part of the key agreement and hands the processor
//! everything it needs to take over: the session keys, the initial MAC chaining value and, for
//! SCP03, the command that completes mutual authentication. The processor sends that command
//! itself, so it is protected like any other.

use std::fmt;

use bytes::Bytes;
use keylink_apdu_core::prelude::*;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::constants::{CHALLENGE_SIZE, CRYPTOGRAM_SIZE, SCP03, cla, derivation, ins};
use crate::crypto::{CmacValue, derive_key};
use crate::keys::{Scp03KeyParams, SessionKeys, derive_session_keys};
use crate::{Error, Result, ResultExt};

/// Host or card challenge
pub type Challenge = [u8; CHALLENGE_SIZE];

/// Result of the unprotected part of a handshake
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Session keys for the new channel
    pub keys: SessionKeys,
    /// Initial MAC chaining value
    pub mac_chain: CmacValue,
    /// Security level the channel is opened with
    pub security_level: SecurityLevel,
    /// Command completing authentication, to be MAC'd and sent by the processor
    pub authenticate: Option<Command>,
}

/// Key agreement strategy for a secure channel
pub trait Handshake: Send + fmt::Debug {
    /// Run the handshake exchanges that precede channel protection
    fn initialize(&mut self, executor: &mut dyn Executor) -> Result<HandshakeOutcome>;
}

/// Parsed INITIALIZE UPDATE response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeUpdateResponse {
    /// Key diversification data
    pub diversification_data: [u8; 10],
    /// Key information: key version, SCP identifier and `i` parameter
    pub key_info: [u8; 3],
    /// Card challenge
    pub card_challenge: Challenge,
    /// Card cryptogram
    pub card_cryptogram: [u8; CRYPTOGRAM_SIZE],
    /// Sequence counter, present with pseudo-random card challenges
    pub sequence_counter: Option<[u8; 3]>,
}

impl InitializeUpdateResponse {
    const BASE_LEN: usize = 29;
    const WITH_COUNTER_LEN: usize = 32;

    /// Parse the response data of INITIALIZE UPDATE
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (base, sequence_counter) = match data.len() {
            Self::BASE_LEN => (data, None),
            Self::WITH_COUNTER_LEN => {
                let (base, counter) = data.split_at(Self::BASE_LEN);
                (base, Some(array(counter)?))
            }
            _ => return Err(Error::InvalidResponse("unexpected INITIALIZE UPDATE length")),
        };

        let response = Self {
            diversification_data: array(&base[..10])?,
            key_info: array(&base[10..13])?,
            card_challenge: array(&base[13..21])?,
            card_cryptogram: array(&base[21..29])?,
            sequence_counter,
        };

        if response.scp_identifier() != SCP03 {
            return Err(Error::InvalidResponse("card does not use SCP03"));
        }
        Ok(response)
    }

    /// Key version number the card used
    pub const fn key_version(&self) -> u8 {
        self.key_info[0]
    }

    /// Secure channel protocol identifier
    pub const fn scp_identifier(&self) -> u8 {
        self.key_info[1]
    }
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::InvalidResponse("unexpected field length"))
}

/// Compute the card or host cryptogram for a session
pub fn cryptogram(
    keys: &SessionKeys,
    constant: u8,
    context: &[u8],
) -> Result<[u8; CRYPTOGRAM_SIZE]> {
    let derived = derive_key(keys.smac(), constant, context, CRYPTOGRAM_SIZE)?;
    array(&derived)
}

/// Check that SCP03 can negotiate `level`
///
/// C-MAC is mandatory and R-ENC is only defined together with C-DEC and R-MAC.
pub const fn check_security_level(level: SecurityLevel) -> Result<()> {
    let valid = level.bits() & !SecurityLevel::full().bits() == 0
        && level.contains(SecurityLevel::C_MAC)
        && (!level.contains(SecurityLevel::R_ENCRYPTION)
            || level.contains(SecurityLevel::C_DECRYPTION.with(SecurityLevel::R_MAC)));

    if valid {
        Ok(())
    } else {
        Err(Error::UnsupportedSecurityLevel(level.bits()))
    }
}

/// GlobalPlatform SCP03 handshake
#[derive(Debug, Clone)]
pub struct Scp03Handshake {
    params: Scp03KeyParams,
    security_level: SecurityLevel,
    host_challenge: Option<Challenge>,
}

impl Scp03Handshake {
    /// Create a handshake for the given key set, requesting full security
    pub const fn new(params: Scp03KeyParams) -> Self {
        Self {
            params,
            security_level: SecurityLevel::full(),
            host_challenge: None,
        }
    }

    /// Request a different security level in EXTERNAL AUTHENTICATE
    pub const fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    /// Use a fixed host challenge instead of a random one
    pub const fn with_host_challenge(mut self, challenge: Challenge) -> Self {
        self.host_challenge = Some(challenge);
        self
    }

    /// Key parameters used by this handshake
    pub const fn params(&self) -> &Scp03KeyParams {
        &self.params
    }

    fn host_challenge(&self) -> Challenge {
        self.host_challenge.unwrap_or_else(|| {
            let mut challenge = [0u8; CHALLENGE_SIZE];
            rand::rng().fill_bytes(&mut challenge);
            challenge
        })
    }

    /// Build the INITIALIZE UPDATE command
    pub fn initialize_update(&self, host_challenge: &Challenge) -> Command {
        Command::new_with_data(
            cla::GP,
            ins::INITIALIZE_UPDATE,
            self.params.key_ref.kvn,
            0x00,
            Bytes::copy_from_slice(host_challenge),
        )
        .with_le(0)
    }
}

impl Handshake for Scp03Handshake {
    fn initialize(&mut self, executor: &mut dyn Executor) -> Result<HandshakeOutcome> {
        check_security_level(self.security_level)?;
        let host_challenge = self.host_challenge();
        let response = executor
            .transmit(&self.initialize_update(&host_challenge))
            .context("INITIALIZE UPDATE")?;

        if !response.is_success() {
            warn!(status = %response.status, "INITIALIZE UPDATE rejected");
            return Err(Error::Status(response.status));
        }

        let init = InitializeUpdateResponse::parse(&response.data)?;
        debug!(
            kvn = init.key_version(),
            sequence_counter = ?init.sequence_counter.map(hex::encode),
            "INITIALIZE UPDATE accepted"
        );

        let context = [host_challenge, init.card_challenge].concat();
        let keys = derive_session_keys(&self.params.keys, &context)?;

        let expected = cryptogram(&keys, derivation::CARD_CRYPTOGRAM, &context)?;
        if !bool::from(expected[..].ct_eq(&init.card_cryptogram[..])) {
            warn!("Card cryptogram mismatch");
            return Err(Error::AuthenticationFailed("Invalid card cryptogram"));
        }

        let host_cryptogram = cryptogram(&keys, derivation::HOST_CRYPTOGRAM, &context)?;
        let authenticate = Command::new_with_data(
            cla::GP,
            ins::EXTERNAL_AUTHENTICATE,
            self.security_level.bits(),
            0x00,
            Bytes::copy_from_slice(&host_cryptogram),
        );

        Ok(HandshakeOutcome {
            keys,
            mac_chain: [0u8; 16],
            security_level: self.security_level,
            authenticate: Some(authenticate),
        })
    }
}

//! Simulated card for end-to-end tests
//!
//! The card speaks short APDUs, accepts command chaining, answers long responses with `61XX`
//! and GET RESPONSE, and runs the card side of SCP03 and SCP11b with the crate's own
//! primitives. Protected responses follow the security level the session was opened with.

#![allow(dead_code, unreachable_pub)]

use bytes::{BufMut, Bytes, BytesMut};
use keylink_apdu_core::tlv::{self, TlvRecord};
use keylink_apdu_core::{CardTransport, Command, TransportError};
use keylink_apdu_scp::constants::MAC_SIZE;
use keylink_apdu_scp::crypto::{cbc_encrypt, cmac, counter_iv, ecdh_shared_secret};
use keylink_apdu_scp::handshake::cryptogram;
use keylink_apdu_scp::scp11::{derive_scp11_keys, receipt};
use keylink_apdu_scp::{KeyRef, ScpState, StaticKeys, derive_session_keys};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};

/// Echo the command data, encrypted channel
pub const INS_ECHO: u8 = 0xEE;
/// Echo the command data, MAC-only channel
pub const INS_ECHO_MAC_ONLY: u8 = 0xED;

const SW_OK: [u8; 2] = [0x90, 0x00];
const SW_SECURITY: [u8; 2] = [0x69, 0x82];
const SW_KEY_NOT_FOUND: [u8; 2] = [0x6A, 0x88];
const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];
const SW_WRONG_DATA: [u8; 2] = [0x6A, 0x80];

/// Key version of the SCP11b key
pub const SCP11_KVN: u8 = 0x01;

const C_DECRYPTION: u8 = 0x02;
const R_MAC: u8 = 0x10;
const R_ENCRYPTION: u8 = 0x20;

#[derive(Debug)]
struct CardSession {
    state: ScpState,
    context: Vec<u8>,
    authenticated: bool,
    level: u8,
}

/// In-memory card implementing [`CardTransport`]
#[derive(Debug)]
pub struct SimulatedCard {
    keys: StaticKeys,
    kvn: u8,
    sd_key: SecretKey,
    certificates: Vec<Bytes>,
    sessions_opened: u8,
    session: Option<CardSession>,
    chained: Vec<u8>,
    outgoing: Bytes,
    corrupt_next_mac: bool,
    fail_next: Option<TransportError>,
    /// Length of the GET DATA answer
    pub get_data_len: usize,
    /// Every raw command the card received
    pub received: Vec<Bytes>,
}

impl SimulatedCard {
    pub fn new(keys: StaticKeys) -> Self {
        let mut rng = rand_v8::thread_rng();
        let sd_key = SecretKey::random(&mut rng);
        let ca_key = SecretKey::random(&mut rng);
        let certificates = vec![
            certificate(&ca_key.public_key()),
            certificate(&sd_key.public_key()),
        ];

        Self {
            keys,
            kvn: 0x30,
            sd_key,
            certificates,
            sessions_opened: 0,
            session: None,
            chained: Vec::new(),
            outgoing: Bytes::new(),
            corrupt_next_mac: false,
            fail_next: None,
            get_data_len: 600,
            received: Vec::new(),
        }
    }

    /// Flip a bit in the R-MAC of the next protected response
    pub fn corrupt_next_response_mac(&mut self) {
        self.corrupt_next_mac = true;
    }

    /// Fail the next exchange before the card sees the command
    pub fn fail_next_exchange(&mut self, error: TransportError) {
        self.fail_next = Some(error);
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.authenticated)
    }

    /// Static public key of the SCP11b key
    pub fn sd_public_key(&self) -> PublicKey {
        self.sd_key.public_key()
    }

    /// Certificates stored for the SCP11b key, leaf last
    pub fn certificates(&self) -> &[Bytes] {
        &self.certificates
    }

    fn respond(&mut self, data: &[u8], sw: [u8; 2]) -> Bytes {
        if data.len() <= 256 {
            return [data, &sw[..]].concat().into();
        }
        self.outgoing = Bytes::copy_from_slice(&data[256..]);
        let mut out = BytesMut::from(&data[..256]);
        out.put_slice(&[0x61, remaining_byte(self.outgoing.len())]);
        out.freeze()
    }

    fn get_response(&mut self, le: Option<u16>) -> Bytes {
        let wanted = match le {
            Some(0) | None => 256,
            Some(n) => usize::from(n),
        };
        let take = wanted.min(self.outgoing.len());
        let chunk = self.outgoing.split_to(take);

        let mut out = BytesMut::from(chunk.as_ref());
        if self.outgoing.is_empty() {
            out.put_slice(&SW_OK);
        } else {
            out.put_slice(&[0x61, remaining_byte(self.outgoing.len())]);
        }
        out.freeze()
    }

    fn initialize_update(&mut self, command: &Command) -> (Vec<u8>, [u8; 2]) {
        if command.p1 != self.kvn && command.p1 != 0 {
            return (Vec::new(), SW_KEY_NOT_FOUND);
        }
        if command.data.len() != 8 {
            return (Vec::new(), SW_WRONG_DATA);
        }

        self.sessions_opened += 1;
        let card_challenge = [self.sessions_opened; 8];
        let context = [&command.data[..], &card_challenge].concat();
        let keys = derive_session_keys(&self.keys, &context).unwrap();
        let card_cryptogram = cryptogram(&keys, 0x00, &context).unwrap();

        self.session = Some(CardSession {
            state: ScpState::new(keys, [0u8; 16]),
            context,
            authenticated: false,
            level: 0,
        });

        let data = [
            &[0xA5; 10][..],
            &[self.kvn, 0x03, 0x00],
            &card_challenge,
            &card_cryptogram,
        ]
        .concat();
        (data, SW_OK)
    }

    fn internal_authenticate(&mut self, command: &Command) -> (Vec<u8>, [u8; 2]) {
        if command.p1 != SCP11_KVN || command.p2 != KeyRef::SCP11B_KID {
            return (Vec::new(), SW_KEY_NOT_FOUND);
        }
        let Ok(records) = tlv::parse_sequence(&command.data) else {
            return (Vec::new(), SW_WRONG_DATA);
        };
        let scp_parameters = tlv::find(&records, 0xA6)
            .and_then(|crt| tlv::find(crt.children(), 0x90))
            .map(TlvRecord::value);
        let host_key = tlv::find(&records, 0x5F49)
            .and_then(|record| PublicKey::from_sec1_bytes(&record.value()).ok());
        let (Some(host_key), Some([0x11, 0x00])) = (host_key, scp_parameters.as_deref()) else {
            return (Vec::new(), SW_WRONG_DATA);
        };

        let ephemeral = SecretKey::random(&mut rand_v8::thread_rng());
        let (receipt_key, keys) = derive_scp11_keys(
            &ecdh_shared_secret(&ephemeral, &host_key),
            &ecdh_shared_secret(&self.sd_key, &host_key),
        )
        .unwrap();

        let point = ephemeral.public_key().to_encoded_point(false);
        let key_record = TlvRecord::new(0x5F49, point.as_bytes().to_vec()).unwrap().to_bytes();
        let card_receipt = receipt(&receipt_key, &command.data, &key_record).unwrap();

        self.session = Some(CardSession {
            state: ScpState::new(keys, card_receipt),
            context: Vec::new(),
            authenticated: true,
            level: 0x33,
        });

        let receipt_record = TlvRecord::new(0x86, card_receipt.to_vec()).unwrap().to_bytes();
        ([&key_record[..], &receipt_record[..]].concat(), SW_OK)
    }

    /// Verify the C-MAC and return the command data without it
    fn check_mac(session: &mut CardSession, command: &Command) -> Option<Vec<u8>> {
        let total = command.data.len();
        let body_len = total.checked_sub(MAC_SIZE)?;
        let (body, mac) = command.data.split_at(body_len);

        let mut input = command.header().to_vec();
        match u8::try_from(total) {
            Ok(lc) => input.push(lc),
            Err(_) => {
                input.push(0x00);
                input.extend_from_slice(&(total as u16).to_be_bytes());
            }
        }
        input.extend_from_slice(body);

        (session.state.mac(&input).ok()? == mac).then(|| body.to_vec())
    }

    fn protected(&mut self, command: &Command) -> (Vec<u8>, [u8; 2]) {
        let Some(mut session) = self.session.take() else {
            return (Vec::new(), SW_SECURITY);
        };
        let Some(body) = Self::check_mac(&mut session, command) else {
            return (Vec::new(), SW_SECURITY);
        };

        if command.ins == 0x82 {
            let expected = cryptogram(session.state.keys(), 0x01, &session.context).unwrap();
            if session.authenticated || body != expected {
                return (Vec::new(), SW_SECURITY);
            }
            session.authenticated = true;
            session.level = command.p1;
            self.session = Some(session);
            return (Vec::new(), SW_OK);
        }
        if !session.authenticated {
            return (Vec::new(), SW_SECURITY);
        }

        let encrypted = session.level & C_DECRYPTION != 0 && command.ins != INS_ECHO_MAC_ONLY;
        let plaintext = if encrypted {
            let Ok(plaintext) = session.state.decrypt(&body) else {
                return (Vec::new(), SW_SECURITY);
            };
            session.state.advance_counter().unwrap();
            plaintext
        } else {
            body
        };

        let (reply, sw) = match command.ins {
            INS_ECHO | INS_ECHO_MAC_ONLY => (plaintext, SW_OK),
            0xCA => self.get_data(command, &plaintext),
            _ => (Vec::new(), SW_INS_NOT_SUPPORTED),
        };

        if sw != SW_OK {
            self.session = Some(session);
            return (reply, sw);
        }

        let keys = session.state.keys();
        let mut data = if encrypted && session.level & R_ENCRYPTION != 0 && !reply.is_empty() {
            let iv = counter_iv(keys.senc(), session.state.enc_counter() - 1, true).unwrap();
            cbc_encrypt(keys.senc(), &iv, &reply).unwrap()
        } else {
            reply
        };
        if session.level & R_MAC != 0 {
            let rmac = cmac(keys.srmac(), &[session.state.mac_chain(), &data, &sw]).unwrap();
            data.extend_from_slice(&rmac[..MAC_SIZE]);

            if std::mem::take(&mut self.corrupt_next_mac) {
                let last = data.len() - 1;
                data[last] ^= 0x01;
            }
        }

        self.session = Some(session);
        (data, sw)
    }

    fn card_data(&self) -> Vec<u8> {
        (0..self.get_data_len).map(|i| i as u8).collect()
    }

    fn get_data(&self, command: &Command, request: &[u8]) -> (Vec<u8>, [u8; 2]) {
        if [command.p1, command.p2] != [0xBF, 0x21] {
            return (self.card_data(), SW_OK);
        }
        let key_id = tlv::parse(request)
            .ok()
            .and_then(|crt| tlv::find(crt.children(), 0x83).map(TlvRecord::value));
        if key_id.as_deref() != Some(&[KeyRef::SCP11B_KID, SCP11_KVN][..]) {
            return (Vec::new(), SW_KEY_NOT_FOUND);
        }
        (self.certificates.concat(), SW_OK)
    }

    fn process(&mut self, command: &Command) -> (Vec<u8>, [u8; 2]) {
        match (command.cla, command.ins) {
            (0x80, 0x50) => self.initialize_update(command),
            (0x80, 0x88) => self.internal_authenticate(command),
            (cla, _) if cla & 0x04 != 0 => self.protected(command),
            (_, INS_ECHO) => (command.data.to_vec(), SW_OK),
            (_, 0xCA) => self.get_data(command, &command.data),
            _ => (Vec::new(), SW_INS_NOT_SUPPORTED),
        }
    }
}

/// Minimal DER certificate carrying `key` as an EC `SubjectPublicKeyInfo`
fn certificate(key: &PublicKey) -> Bytes {
    let record = |tag, value: &[u8]| TlvRecord::new(tag, value.to_vec()).unwrap();
    let sequence = |children| TlvRecord::constructed(0x30, children).unwrap();

    let point = key.to_encoded_point(false);
    let spki = sequence(vec![
        sequence(vec![
            record(0x06, &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01]),
            record(0x06, &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07]),
        ]),
        record(0x03, &[&[0x00][..], point.as_bytes()].concat()),
    ]);
    let signature_algorithm =
        sequence(vec![record(0x06, &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02])]);
    let name = sequence(vec![
        TlvRecord::constructed(
            0x31,
            vec![sequence(vec![
                record(0x06, &[0x55, 0x04, 0x03]),
                record(0x0C, b"Simulated SD"),
            ])],
        )
        .unwrap(),
    ]);
    let tbs = sequence(vec![
        TlvRecord::constructed(0xA0, vec![record(0x02, &[0x02])]).unwrap(),
        record(0x02, &[0x01]),
        signature_algorithm.clone(),
        name.clone(),
        sequence(vec![]),
        name,
        spki,
    ]);
    sequence(vec![tbs, signature_algorithm, record(0x03, &[0x00; 9])]).to_bytes()
}

fn remaining_byte(remaining: usize) -> u8 {
    if remaining >= 256 { 0x00 } else { remaining as u8 }
}

impl CardTransport for SimulatedCard {
    type Error = TransportError;

    fn do_transmit_raw(&mut self, raw: &[u8]) -> Result<Bytes, Self::Error> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }
        self.received.push(Bytes::copy_from_slice(raw));

        let mut command =
            Command::from_bytes(raw).map_err(|e| TransportError::other(e.to_string()))?;

        if command.ins == 0xC0 && command.cla == 0x00 {
            return Ok(self.get_response(command.le));
        }
        if command.cla & 0x10 != 0 {
            self.chained.extend_from_slice(&command.data);
            return Ok(Bytes::from_static(&SW_OK));
        }
        if !self.chained.is_empty() {
            let mut data = std::mem::take(&mut self.chained);
            data.extend_from_slice(&command.data);
            command.data = data.into();
        }

        let (data, sw) = self.process(&command);
        Ok(self.respond(&data, sw))
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.session = None;
        self.chained.clear();
        self.outgoing.clear();
        Ok(())
    }
}

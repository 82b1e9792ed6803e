//! SCP11b key agreement
//!
//! SCP11b authenticates the card to the host; the host holds no static key of its own. An
//! ephemeral host key is agreed with both the Security Domain's static key, taken from its
//! certificate, and a fresh card key. The session keys come out of the X9.63 KDF over both
//! shared secrets, and the receipt returned by the card proves it holds the static key. The
//! receipt also seeds the MAC chain, so no EXTERNAL AUTHENTICATE follows.

use bytes::Bytes;
use keylink_apdu_core::prelude::*;
use p256::ecdh::SharedSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::constants::{KEY_SIZE, cla, ins, scp11, tag};
use crate::crypto::{CmacValue, cmac, ecdh_shared_secret, x963_kdf};
use crate::handshake::{Handshake, HandshakeOutcome};
use crate::keys::{AesKey, KeyRef, SessionKeys, to_key};
use crate::{Error, Result, ResultExt};

/// `id-ecPublicKey` (1.2.840.10045.2.1)
const EC_PUBLIC_KEY_OID: [u8; 7] = [0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];

const DER_SEQUENCE: u64 = 0x30;
const DER_BIT_STRING: u64 = 0x03;
const DER_OID: u64 = 0x06;

/// Everything needed to open an SCP11b channel
#[derive(Debug, Clone)]
pub struct Scp11KeyParams {
    /// Security Domain key to agree with
    pub key_ref: KeyRef,
    /// Static ECKA public key of that key (`PK.SD.ECKA`)
    pub pk_sd_ecka: PublicKey,
}

impl Scp11KeyParams {
    /// Create new key parameters
    pub const fn new(key_ref: KeyRef, pk_sd_ecka: PublicKey) -> Self {
        Self {
            key_ref,
            pk_sd_ecka,
        }
    }

    /// Take the public key from the last certificate of a bundle
    ///
    /// Certificate stores list the chain with the Security Domain's own certificate last.
    pub fn from_certificates(key_ref: KeyRef, certificates: &[Bytes]) -> Result<Self> {
        let leaf = certificates
            .last()
            .ok_or(Error::InvalidCertificate("empty certificate bundle"))?;
        Ok(Self::new(key_ref, certificate_public_key(leaf)?))
    }
}

/// INTERNAL AUTHENTICATE data for an ephemeral host key
///
/// A control reference template announcing SCP11b with AES-128 session keys, followed by the
/// uncompressed ephemeral public key.
pub fn key_agreement_data(ephemeral: &PublicKey) -> Result<Bytes> {
    let record = |tag, value: &[u8]| TlvRecord::new(tag, Bytes::copy_from_slice(value));

    let control = TlvRecord::constructed(
        tag::CONTROL_REFERENCE,
        vec![
            record(tag::SCP_PARAMETERS, &[scp11::IDENTIFIER, scp11::VARIANT_B])?,
            record(tag::KEY_USAGE, &[scp11::KEY_USAGE])?,
            record(tag::KEY_TYPE, &[scp11::KEY_TYPE_AES])?,
            record(tag::KEY_LENGTH, &[KEY_SIZE as u8])?,
        ],
    )?;
    let key = record(
        tag::EPHEMERAL_KEY,
        ephemeral.to_encoded_point(false).as_bytes(),
    )?;
    Ok(tlv::encode_sequence(&[control, key]))
}

/// Derive the receipt key and the session keys from both ECDH secrets
///
/// The KDF runs over the ephemeral-ephemeral secret followed by the ephemeral-static one. Its
/// output is split into the receipt key, S-ENC, S-MAC, S-RMAC and DEK.
pub fn derive_scp11_keys(
    ephemeral: &SharedSecret,
    static_key: &SharedSecret,
) -> Result<(Zeroizing<AesKey>, SessionKeys)> {
    let mut shared = Zeroizing::new(Vec::with_capacity(64));
    shared.extend_from_slice(ephemeral.raw_secret_bytes());
    shared.extend_from_slice(static_key.raw_secret_bytes());

    let shared_info = [scp11::KEY_USAGE, scp11::KEY_TYPE_AES, KEY_SIZE as u8];
    let material = x963_kdf(&shared, &shared_info, 5 * KEY_SIZE);
    let key = |index: usize| to_key(&material[index * KEY_SIZE..(index + 1) * KEY_SIZE]);

    let receipt_key = Zeroizing::new(key(0)?);
    let keys = SessionKeys::new(key(1)?, key(2)?, key(3)?, Some(key(4)?));
    Ok((receipt_key, keys))
}

/// Receipt over the key agreement data and the encoded card ephemeral key record
pub fn receipt(receipt_key: &AesKey, request: &[u8], card_key_record: &[u8]) -> Result<CmacValue> {
    cmac(receipt_key, &[request, card_key_record])
}

/// GlobalPlatform SCP11b handshake
#[derive(Debug, Clone)]
pub struct Scp11bHandshake {
    params: Scp11KeyParams,
}

impl Scp11bHandshake {
    /// Create a handshake against the given Security Domain key
    pub const fn new(params: Scp11KeyParams) -> Self {
        Self { params }
    }

    /// Key parameters used by this handshake
    pub const fn params(&self) -> &Scp11KeyParams {
        &self.params
    }

    /// Build the INTERNAL AUTHENTICATE command carrying `data`
    pub fn internal_authenticate(&self, data: Bytes) -> Command {
        Command::new_with_data(
            cla::GP,
            ins::INTERNAL_AUTHENTICATE,
            self.params.key_ref.kvn,
            self.params.key_ref.kid,
            data,
        )
        .with_le(0)
    }
}

impl Handshake for Scp11bHandshake {
    fn initialize(&mut self, executor: &mut dyn Executor) -> Result<HandshakeOutcome> {
        let ephemeral = SecretKey::random(&mut rand_v8::thread_rng());
        let request = key_agreement_data(&ephemeral.public_key())?;

        let response = executor
            .transmit(&self.internal_authenticate(request.clone()))
            .context("INTERNAL AUTHENTICATE")?;
        if !response.is_success() {
            warn!(status = %response.status, "INTERNAL AUTHENTICATE rejected");
            return Err(Error::Status(response.status));
        }

        let records = tlv::parse_sequence(&response.data)
            .map_err(|_| Error::InvalidResponse("malformed INTERNAL AUTHENTICATE response"))?;
        let (Some(card_key), Some(card_receipt)) = (
            tlv::find(&records, tag::EPHEMERAL_KEY),
            tlv::find(&records, tag::RECEIPT),
        ) else {
            return Err(Error::InvalidResponse("missing ephemeral key or receipt"));
        };
        let card_ephemeral = PublicKey::from_sec1_bytes(&card_key.value())
            .map_err(|_| Error::InvalidResponse("invalid card ephemeral key"))?;

        let (receipt_key, keys) = derive_scp11_keys(
            &ecdh_shared_secret(&ephemeral, &card_ephemeral),
            &ecdh_shared_secret(&ephemeral, &self.params.pk_sd_ecka),
        )?;
        let expected = receipt(&receipt_key, &request, &card_key.to_bytes())?;
        if !bool::from(expected[..].ct_eq(&card_receipt.value()[..])) {
            warn!("Receipt mismatch");
            return Err(Error::AuthenticationFailed("Invalid receipt"));
        }

        debug!(key_ref = %self.params.key_ref, "SCP11b key agreement complete");
        Ok(HandshakeOutcome {
            keys,
            mac_chain: expected,
            security_level: SecurityLevel::full(),
            authenticate: None,
        })
    }
}

/// GET DATA request selecting the certificate store of `key_ref`
pub fn certificate_store_request(key_ref: KeyRef) -> Result<Bytes> {
    let key_id = TlvRecord::new(tag::KEY_ID, vec![key_ref.kid, key_ref.kvn])?;
    Ok(TlvRecord::constructed(tag::CONTROL_REFERENCE, vec![key_id])?.to_bytes())
}

/// Split a certificate store into its DER certificates, in card order
pub fn split_certificates(data: &Bytes) -> Result<Vec<Bytes>> {
    let mut certificates = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (_, rest) = tlv::parse_prefix(&data[offset..])
            .map_err(|_| Error::InvalidResponse("malformed certificate bundle"))?;
        let end = data.len() - rest.len();
        certificates.push(data.slice(offset..end));
        offset = end;
    }
    Ok(certificates)
}

/// Extract the P-256 public key of a DER X.509 certificate
///
/// Only the structure leading to the `SubjectPublicKeyInfo` is checked; the signature is not
/// verified.
pub fn certificate_public_key(certificate: &[u8]) -> Result<PublicKey> {
    let certificate = tlv::parse(certificate)
        .map_err(|_| Error::InvalidCertificate("not a DER structure"))?;
    let tbs = certificate
        .children()
        .first()
        .filter(|tbs| tbs.tag() == DER_SEQUENCE)
        .ok_or(Error::InvalidCertificate("missing TBSCertificate"))?;
    let point = tbs
        .children()
        .iter()
        .find_map(ec_public_key)
        .ok_or(Error::InvalidCertificate("no EC public key"))?;
    PublicKey::from_sec1_bytes(&point).map_err(|_| Error::InvalidCertificate("not a P-256 point"))
}

/// SEC1 point of an EC `SubjectPublicKeyInfo`
fn ec_public_key(record: &TlvRecord) -> Option<Bytes> {
    let [algorithm, key] = record.children() else {
        return None;
    };
    let is_ec = algorithm
        .children()
        .first()
        .is_some_and(|oid| oid.tag() == DER_OID && oid.value()[..] == EC_PUBLIC_KEY_OID);
    if record.tag() != DER_SEQUENCE || key.tag() != DER_BIT_STRING || !is_ec {
        return None;
    }

    // Leading byte counts unused bits
    let bits = key.value();
    match bits.first() {
        Some(0) => Some(bits.slice(1..)),
        _ => None,
    }
}

//! Static and session key material
//!
//! Keys are zeroized on drop and never printed: their `Debug` output is redacted.

use std::fmt;

use derive_more::Display;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{KEY_SIZE, derivation};
use crate::crypto::derive_key;
use crate::{Error, Result};

/// Raw AES-128 key
pub type AesKey = [u8; KEY_SIZE];

/// GlobalPlatform default test key `40 41 .. 4F`
pub const DEFAULT_KEY: AesKey = [
    0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F,
];

pub(crate) fn to_key(key: &[u8]) -> Result<AesKey> {
    key.try_into().map_err(|_| Error::InvalidKeyLength {
        expected: KEY_SIZE,
        actual: key.len(),
    })
}

/// Long-term key set shared with the card
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticKeys {
    /// Channel encryption key
    enc: AesKey,
    /// Channel MAC key
    mac: AesKey,
    /// Data encryption key (optional)
    dek: Option<AesKey>,
}

impl StaticKeys {
    /// Create a new key set
    pub const fn new(enc: AesKey, mac: AesKey, dek: Option<AesKey>) -> Self {
        Self { enc, mac, dek }
    }

    /// Create a key set from slices, checking every key is 16 bytes
    pub fn from_slices(enc: &[u8], mac: &[u8], dek: Option<&[u8]>) -> Result<Self> {
        Ok(Self {
            enc: to_key(enc)?,
            mac: to_key(mac)?,
            dek: dek.map(to_key).transpose()?,
        })
    }

    /// Create a new key set where all keys are the same
    pub const fn from_single_key(key: AesKey) -> Self {
        Self::new(key, key, Some(key))
    }

    /// The well-known default key set shipped on unpersonalized cards
    pub const fn default_keys() -> Self {
        Self::from_single_key(DEFAULT_KEY)
    }

    /// Get the encryption key
    pub const fn enc(&self) -> &AesKey {
        &self.enc
    }

    /// Get the MAC key
    pub const fn mac(&self) -> &AesKey {
        &self.mac
    }

    /// Get the data encryption key
    pub const fn dek(&self) -> Option<&AesKey> {
        self.dek.as_ref()
    }
}

impl fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeys")
            .field("enc", &"<redacted>")
            .field("mac", &"<redacted>")
            .field("dek", &self.dek.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Per-session keys derived during the handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    senc: AesKey,
    smac: AesKey,
    srmac: AesKey,
    dek: Option<AesKey>,
}

impl SessionKeys {
    /// Assemble session keys from already derived values
    pub const fn new(senc: AesKey, smac: AesKey, srmac: AesKey, dek: Option<AesKey>) -> Self {
        Self {
            senc,
            smac,
            srmac,
            dek,
        }
    }

    /// Secure channel encryption key
    pub const fn senc(&self) -> &AesKey {
        &self.senc
    }

    /// Secure channel command MAC key
    pub const fn smac(&self) -> &AesKey {
        &self.smac
    }

    /// Secure channel response MAC key
    pub const fn srmac(&self) -> &AesKey {
        &self.srmac
    }

    /// Static data encryption key, carried over unchanged
    pub const fn dek(&self) -> Option<&AesKey> {
        self.dek.as_ref()
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("senc", &"<redacted>")
            .field("smac", &"<redacted>")
            .field("srmac", &"<redacted>")
            .field("dek", &self.dek.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Reference to a key set on the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("KeyRef(kid={kid:#04x}, kvn={kvn:#04x})")]
pub struct KeyRef {
    /// Key identifier
    pub kid: u8,
    /// Key version number, sent as P1 of INITIALIZE UPDATE and INTERNAL AUTHENTICATE
    pub kvn: u8,
}

impl KeyRef {
    /// SCP03 key identifier
    pub const SCP03_KID: u8 = 0x01;
    /// SCP11b key identifier
    pub const SCP11B_KID: u8 = 0x13;

    /// Create a new key reference
    pub const fn new(kid: u8, kvn: u8) -> Self {
        Self { kid, kvn }
    }
}

impl Default for KeyRef {
    /// Default SCP03 key set (`kid = 0x01`, `kvn = 0xFF`)
    fn default() -> Self {
        Self::new(Self::SCP03_KID, 0xFF)
    }
}

/// Everything needed to open an SCP03 channel
#[derive(Debug, Clone)]
pub struct Scp03KeyParams {
    /// Key set to authenticate with
    pub key_ref: KeyRef,
    /// Static keys for that key set
    pub keys: StaticKeys,
}

impl Scp03KeyParams {
    /// Create new key parameters
    pub const fn new(key_ref: KeyRef, keys: StaticKeys) -> Self {
        Self { key_ref, keys }
    }
}

impl Default for Scp03KeyParams {
    fn default() -> Self {
        Self::new(KeyRef::default(), StaticKeys::default_keys())
    }
}

fn derive_session_key(key: &AesKey, constant: u8, context: &[u8]) -> Result<AesKey> {
    let derived = derive_key(key, constant, context, KEY_SIZE)?;
    to_key(&derived)
}

/// Derive S-ENC, S-MAC and S-RMAC for the given context
///
/// The context is the host challenge followed by the card challenge. The DEK is a static key
/// and is carried over as is.
pub fn derive_session_keys(keys: &StaticKeys, context: &[u8]) -> Result<SessionKeys> {
    Ok(SessionKeys {
        senc: derive_session_key(&keys.enc, derivation::S_ENC, context)?,
        smac: derive_session_key(&keys.mac, derivation::S_MAC, context)?,
        srmac: derive_session_key(&keys.mac, derivation::S_RMAC, context)?,
        dek: keys.dek,
    })
}

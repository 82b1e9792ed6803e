//! Constants used by the secure channels
//!
//! SCP03 values follow GlobalPlatform Card Specification 2.3 Amendment D, SCP11 values
//! Amendment F.

/// Command classes
pub mod cla {
    /// GlobalPlatform proprietary class
    pub const GP: u8 = 0x80;
    /// Secure messaging indicator OR-ed into the class byte
    pub const SECURE_MESSAGING: u8 = 0x04;
    /// GlobalPlatform class with secure messaging
    pub const MAC: u8 = GP | SECURE_MESSAGING;
}

/// Instruction codes
pub mod ins {
    /// INITIALIZE UPDATE
    pub const INITIALIZE_UPDATE: u8 = 0x50;
    /// EXTERNAL AUTHENTICATE
    pub const EXTERNAL_AUTHENTICATE: u8 = 0x82;
    /// INTERNAL AUTHENTICATE (SCP11b key agreement)
    pub const INTERNAL_AUTHENTICATE: u8 = 0x88;
    /// GET DATA
    pub const GET_DATA: u8 = 0xCA;
}

/// GET DATA object tags (P1-P2)
pub mod data_object {
    /// Certificate store of a Security Domain key
    pub const CERTIFICATE_STORE: u16 = 0xBF21;
}

/// TLV tags exchanged during SCP11 key agreement
pub mod tag {
    /// Control reference template
    pub const CONTROL_REFERENCE: u64 = 0xA6;
    /// SCP identifier and parameters
    pub const SCP_PARAMETERS: u64 = 0x90;
    /// Key usage qualifier
    pub const KEY_USAGE: u64 = 0x95;
    /// Key type
    pub const KEY_TYPE: u64 = 0x80;
    /// Session key length
    pub const KEY_LENGTH: u64 = 0x81;
    /// Key identifier and version
    pub const KEY_ID: u64 = 0x83;
    /// Ephemeral public key
    pub const EPHEMERAL_KEY: u64 = 0x5F49;
    /// Receipt
    pub const RECEIPT: u64 = 0x86;
}

/// SCP11 key agreement parameters
pub mod scp11 {
    /// SCP identifier for SCP11
    pub const IDENTIFIER: u8 = 0x11;
    /// `i` parameter for the b variant
    pub const VARIANT_B: u8 = 0x00;
    /// Key usage: secure messaging with C-MAC, R-MAC, C-DEC and R-ENC
    pub const KEY_USAGE: u8 = 0x3C;
    /// Key type: AES
    pub const KEY_TYPE_AES: u8 = 0x88;
}

/// Derivation constants for the SCP03 KDF
pub mod derivation {
    /// Card cryptogram
    pub const CARD_CRYPTOGRAM: u8 = 0x00;
    /// Host cryptogram
    pub const HOST_CRYPTOGRAM: u8 = 0x01;
    /// S-ENC
    pub const S_ENC: u8 = 0x04;
    /// S-MAC
    pub const S_MAC: u8 = 0x06;
    /// S-RMAC
    pub const S_RMAC: u8 = 0x07;
}

/// AES-128 key length
pub const KEY_SIZE: usize = 16;

/// AES block length
pub const BLOCK_SIZE: usize = 16;

/// Length of the truncated C-MAC / R-MAC carried on the wire
pub const MAC_SIZE: usize = 8;

/// Length of host and card challenges
pub const CHALLENGE_SIZE: usize = 8;

/// Length of host and card cryptograms
pub const CRYPTOGRAM_SIZE: usize = 8;

/// SCP identifier reported in the INITIALIZE UPDATE key information
pub const SCP03: u8 = 0x03;

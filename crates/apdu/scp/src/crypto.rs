//! Cryptographic operations for the GlobalPlatform secure channels
//!
//! This module provides the AES based primitives SCP03 is built from: the NIST SP 800-108
//! counter mode KDF over AES-CMAC, the counter derived ICV, and CBC encryption with
//! ISO/IEC 7816-4 padding. SCP11b adds P-256 ECDH and the ANSI X9.63 KDF over SHA-256.

use aes::Aes128;
use cipher::{
    BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit, block_padding::Iso7816,
    generic_array::GenericArray,
};
use cmac::{Cmac, Mac};
use p256::{PublicKey, SecretKey, ecdh::SharedSecret};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::constants::{BLOCK_SIZE, KEY_SIZE};
use crate::{Error, Result};

/// Full 16 byte AES-CMAC value
pub type CmacValue = [u8; BLOCK_SIZE];

const fn key_length_error(actual: usize) -> Error {
    Error::InvalidKeyLength {
        expected: KEY_SIZE,
        actual,
    }
}

fn new_cmac(key: &[u8]) -> Result<Cmac<Aes128>> {
    <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|_| key_length_error(key.len()))
}

/// AES-CMAC over the concatenation of `parts`
pub fn cmac(key: &[u8], parts: &[&[u8]]) -> Result<CmacValue> {
    let mut mac = new_cmac(key)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Verify the leftmost bytes of an AES-CMAC in constant time
pub fn verify_cmac_truncated(key: &[u8], parts: &[&[u8]], expected: &[u8]) -> Result<bool> {
    let mut mac = new_cmac(key)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.verify_truncated_left(expected).is_ok())
}

/// Derive `len` bytes from `key` using the SCP03 KDF
///
/// Each CMAC block is computed over
/// `label (11 zero bytes) ‖ constant ‖ 0x00 ‖ L (bits, 2 bytes BE) ‖ i ‖ context`, with the
/// counter `i` starting at 1. Blocks are concatenated and truncated to `len`.
pub fn derive_key(
    key: &[u8],
    constant: u8,
    context: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    const LABEL: [u8; 11] = [0; 11];

    let bits = u16::try_from(len * 8).map_err(|_| Error::InvalidResponse("KDF output too long"))?;
    let blocks = len.div_ceil(BLOCK_SIZE);
    let mut output = Zeroizing::new(Vec::with_capacity(blocks * BLOCK_SIZE));

    for counter in 1..=blocks {
        let block = cmac(
            key,
            &[
                &LABEL,
                &[constant, 0x00],
                &bits.to_be_bytes(),
                &[counter as u8],
                context,
            ],
        )?;
        output.extend_from_slice(&block);
    }

    output.truncate(len);
    Ok(output)
}

/// ECDH over P-256
pub fn ecdh_shared_secret(private: &SecretKey, public: &PublicKey) -> SharedSecret {
    p256::elliptic_curve::ecdh::diffie_hellman(private.to_nonzero_scalar(), public.as_affine())
}

/// ANSI X9.63 KDF with SHA-256
///
/// Blocks are `SHA-256(z ‖ counter ‖ shared_info)` with a four byte big endian counter starting
/// at 1, concatenated and truncated to `len`.
pub fn x963_kdf(z: &[u8], shared_info: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let blocks = len.div_ceil(32);
    let mut output = Zeroizing::new(Vec::with_capacity(blocks * 32));

    for counter in 1..=blocks as u32 {
        let mut hasher = Sha256::new();
        hasher.update(z);
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_info);
        output.extend_from_slice(&hasher.finalize());
    }

    output.truncate(len);
    output
}

/// ICV for encrypting command data or decrypting response data
///
/// The counter occupies the low four bytes of a zero block; response ICVs also set the most
/// significant byte to `0x80`. The block is encrypted under S-ENC.
pub fn counter_iv(key: &[u8], counter: u32, response: bool) -> Result<[u8; BLOCK_SIZE]> {
    let cipher = Aes128::new_from_slice(key).map_err(|_| key_length_error(key.len()))?;

    let mut block = GenericArray::from([0u8; BLOCK_SIZE]);
    if response {
        block[0] = 0x80;
    }
    block[BLOCK_SIZE - 4..].copy_from_slice(&counter.to_be_bytes());
    cipher.encrypt_block(&mut block);

    Ok(block.into())
}

/// Pad with ISO/IEC 7816-4 padding and encrypt with AES-CBC
///
/// Empty input still produces one full padding block.
pub fn cbc_encrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let encryptor = cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|_| key_length_error(key.len()))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Iso7816>(plaintext))
}

/// Decrypt with AES-CBC and strip ISO/IEC 7816-4 padding
pub fn cbc_decrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::InvalidPadding);
    }
    let decryptor = cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
        .map_err(|_| key_length_error(key.len()))?;
    decryptor
        .decrypt_padded_vec_mut::<Iso7816>(ciphertext)
        .map_err(|_| Error::InvalidPadding)
}

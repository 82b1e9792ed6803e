//! Per-session SCP03 state
//!
//! [`ScpState`] owns the session keys, the MAC chaining value and the encryption counter. It
//! knows nothing about APDU framing; the processor feeds it the exact bytes to protect.

use std::fmt;

use tracing::trace;

use crate::constants::MAC_SIZE;
use crate::crypto::{CmacValue, cbc_decrypt, cbc_encrypt, cmac, counter_iv, verify_cmac_truncated};
use crate::keys::SessionKeys;
use crate::{Error, Result};

/// Truncated MAC as carried on the wire
pub type Mac = [u8; MAC_SIZE];

/// Snapshot of the mutable parts of [`ScpState`]
///
/// Taken before an exchange and restored when the exchange fails without compromising the
/// session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    mac_chain: CmacValue,
    enc_counter: u32,
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("enc_counter", &self.enc_counter)
            .finish_non_exhaustive()
    }
}

/// Secure channel session state
pub struct ScpState {
    keys: SessionKeys,
    mac_chain: CmacValue,
    enc_counter: u32,
}

impl ScpState {
    /// Create the state for a freshly authenticated session
    ///
    /// `mac_chain` is the value left by the handshake; the encryption counter starts at 1.
    pub const fn new(keys: SessionKeys, mac_chain: CmacValue) -> Self {
        Self {
            keys,
            mac_chain,
            enc_counter: 1,
        }
    }

    /// Session keys
    pub const fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Current MAC chaining value
    pub const fn mac_chain(&self) -> &CmacValue {
        &self.mac_chain
    }

    /// Counter used for the next encrypted command
    pub const fn enc_counter(&self) -> u32 {
        self.enc_counter
    }

    /// Encrypt command data under the current counter
    ///
    /// The counter is not advanced; see [`Self::advance_counter`].
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let iv = counter_iv(self.keys.senc(), self.enc_counter, false)?;
        cbc_encrypt(self.keys.senc(), &iv, data)
    }

    /// Decrypt data encrypted with [`Self::encrypt`] under the current counter
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        let iv = counter_iv(self.keys.senc(), self.enc_counter, false)?;
        cbc_decrypt(self.keys.senc(), &iv, data)
    }

    /// Decrypt response data for the last encrypted command
    ///
    /// Must be called after [`Self::advance_counter`], so the counter of the command is the
    /// current one minus one.
    pub fn decrypt_response(&self, data: &[u8]) -> Result<Vec<u8>> {
        let counter = self
            .enc_counter
            .checked_sub(1)
            .filter(|counter| *counter > 0)
            .ok_or(Error::InvalidResponse("no encrypted command to answer"))?;
        let iv = counter_iv(self.keys.senc(), counter, true)?;
        cbc_decrypt(self.keys.senc(), &iv, data)
    }

    /// Move on to the next encryption counter
    pub fn advance_counter(&mut self) -> Result<()> {
        self.enc_counter = self
            .enc_counter
            .checked_add(1)
            .ok_or(Error::CounterExhausted)?;
        Ok(())
    }

    /// Compute the C-MAC over `data` and chain it
    ///
    /// The full CMAC becomes the new chaining value; the leftmost eight bytes are returned.
    pub fn mac(&mut self, data: &[u8]) -> Result<Mac> {
        let full = cmac(self.keys.smac(), &[&self.mac_chain, data])?;
        self.mac_chain = full;
        trace!(chain = %hex::encode(full), "Updated MAC chaining value");

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&full[..MAC_SIZE]);
        Ok(mac)
    }

    /// Verify the R-MAC of a response and strip it
    ///
    /// `data` is the response body with the trailing eight byte R-MAC; `status` is the status
    /// word it was returned with. The R-MAC is computed over the current chaining value, which
    /// is left unchanged.
    pub fn unmac(&self, data: &[u8], status: [u8; 2]) -> Result<Vec<u8>> {
        let Some(body_len) = data.len().checked_sub(MAC_SIZE) else {
            return Err(Error::InvalidResponse("response shorter than R-MAC"));
        };
        let (body, rmac) = data.split_at(body_len);

        if !verify_cmac_truncated(self.keys.srmac(), &[&self.mac_chain, body, &status], rmac)? {
            return Err(Error::MacMismatch);
        }
        Ok(body.to_vec())
    }

    /// Snapshot the MAC chain and counter
    pub const fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            mac_chain: self.mac_chain,
            enc_counter: self.enc_counter,
        }
    }

    /// Roll back to a snapshot taken with [`Self::checkpoint`]
    pub const fn restore(&mut self, checkpoint: Checkpoint) {
        self.mac_chain = checkpoint.mac_chain;
        self.enc_counter = checkpoint.enc_counter;
    }
}

impl fmt::Debug for ScpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScpState")
            .field("keys", &self.keys)
            .field("enc_counter", &self.enc_counter)
            .finish_non_exhaustive()
    }
}

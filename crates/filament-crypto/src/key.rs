//! 256-bit symmetric key: CSPRNG construction, base32-multibase round-trip

use anyhow::{bail, Result};
use rand::RngCore;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 32-byte symmetric key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    bytes: [u8; KEY_SIZE],
}

impl Key {
    /// Fresh key from the OS CSPRNG.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Parse the base32-multibase form produced by `to_string`.
    pub fn from_string(s: &str) -> Result<Self> {
        let (_base, raw) = multibase::decode(s)?;
        if raw.len() != KEY_SIZE {
            bail!("key has wrong size: {} bytes (expected {KEY_SIZE})", raw.len());
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&multibase::encode(multibase::Base::Base32Lower, self.bytes))
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("bytes", &"[REDACTED]").finish()
    }
}

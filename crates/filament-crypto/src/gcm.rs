//! AES-256-GCM buffered encrypt/decrypt
//!
//! Payload format: `[12-byte nonce][ciphertext + 16-byte tag]`. Both sides
//! buffer the whole stream; the decrypted reader is an in-memory cursor, so
//! it is trivially seekable.

use std::io::{Cursor, Read};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Result};
use rand::RngCore;

use crate::key::Key;
use crate::{ReadSeek, SymmetricCodec, GCM_NONCE_SIZE};

pub struct Gcm {
    key: Key,
}

impl Gcm {
    pub fn new(key: Key) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(self.key.as_bytes().into())
    }
}

impl SymmetricCodec for Gcm {
    fn encrypt_reader(&self, mut plain: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>> {
        let mut data = Vec::new();
        plain.read_to_end(&mut data)?;

        let mut nonce_bytes = [0u8; GCM_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, data.as_slice())
            .map_err(|e| anyhow!("gcm encrypt: {e}"))?;

        let mut out = Vec::with_capacity(GCM_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(Box::new(Cursor::new(out)))
    }

    fn decrypt_reader(
        &self,
        mut cipher: Box<dyn ReadSeek + Send>,
    ) -> Result<Box<dyn ReadSeek + Send>> {
        let mut data = Vec::new();
        cipher.read_to_end(&mut data)?;
        if data.len() < GCM_NONCE_SIZE {
            bail!(
                "gcm payload too short: {} bytes (minimum {GCM_NONCE_SIZE})",
                data.len()
            );
        }

        let (nonce_bytes, ciphertext) = data.split_at(GCM_NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow!("gcm decrypt: invalid key or corrupted data"))?;

        Ok(Box::new(Cursor::new(plaintext)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn encrypt_all(key: &Key, plain: &[u8]) -> Vec<u8> {
        let gcm = Gcm::new(key.clone());
        let mut enc = gcm
            .encrypt_reader(Box::new(Cursor::new(plain.to_vec())))
            .unwrap();
        let mut out = Vec::new();
        enc.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn roundtrip() {
        let key = Key::new_random();
        let ct = encrypt_all(&key, b"authenticated payload");
        // nonce (12) + plaintext + tag (16)
        assert_eq!(ct.len(), 12 + 21 + 16);

        let gcm = Gcm::new(key);
        let mut dec = gcm.decrypt_reader(Box::new(Cursor::new(ct))).unwrap();
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"authenticated payload");
    }

    #[test]
    fn wrong_key_fails_auth() {
        let ct = encrypt_all(&Key::new_random(), b"secret");
        let gcm = Gcm::new(Key::new_random());
        assert!(gcm.decrypt_reader(Box::new(Cursor::new(ct))).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = Key::new_random();
        let mut ct = encrypt_all(&key, b"secret");
        let idx = ct.len() - 1;
        ct[idx] ^= 0xFF;
        let gcm = Gcm::new(key);
        assert!(gcm.decrypt_reader(Box::new(Cursor::new(ct))).is_err());
    }

    #[test]
    fn decrypted_reader_is_seekable() {
        let key = Key::new_random();
        let ct = encrypt_all(&key, b"0123456789");
        let gcm = Gcm::new(key);
        let mut dec = gcm.decrypt_reader(Box::new(Cursor::new(ct))).unwrap();
        dec.seek(SeekFrom::Start(5)).unwrap();
        let mut out = Vec::new();
        dec.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"56789");
    }

    #[test]
    fn truncated_payload_is_error() {
        let gcm = Gcm::new(Key::new_random());
        assert!(gcm
            .decrypt_reader(Box::new(Cursor::new(vec![0u8; 5])))
            .is_err());
    }
}

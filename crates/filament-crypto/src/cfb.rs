//! AES-256-CFB encrypt/decrypt readers with random-access decryption
//!
//! CFB is self-synchronizing: the keystream for block `i` is `E(C[i-1])`,
//! with `C[-1]` being the IV. Seeking therefore only needs the previous
//! ciphertext block: re-enter the stream at a 16-byte boundary with that
//! block as the IV and discard up to 15 bytes of plaintext.
//!
//! The IV is all zeroes: every key is generated fresh for exactly one
//! variant, so IV reuse cannot occur. This mode carries no authentication;
//! the content address of the ciphertext is what commits to the bytes.

use std::io::{self, Read, Seek, SeekFrom};

use aes::cipher::KeyIvInit;
use aes::Aes256;
use anyhow::Result;
use cfb_mode::{BufDecryptor, BufEncryptor};

use crate::key::Key;
use crate::{ReadSeek, SymmetricCodec, BLOCK_SIZE};

/// CFB codec over one single-use key.
pub struct Cfb {
    key: Key,
}

impl Cfb {
    pub fn new(key: Key) -> Self {
        Self { key }
    }
}

impl SymmetricCodec for Cfb {
    fn encrypt_reader(&self, plain: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(EncryptReader::new(&self.key, plain)))
    }

    fn decrypt_reader(
        &self,
        cipher: Box<dyn ReadSeek + Send>,
    ) -> Result<Box<dyn ReadSeek + Send>> {
        Ok(Box::new(DecryptReader::new(self.key.clone(), cipher)?))
    }
}

/// Streams ciphertext while reading plaintext from the wrapped reader.
pub struct EncryptReader<R> {
    inner: R,
    enc: BufEncryptor<Aes256>,
}

impl<R: Read> EncryptReader<R> {
    pub fn new(key: &Key, inner: R) -> Self {
        let iv = [0u8; BLOCK_SIZE];
        let enc = BufEncryptor::new_from_slices(key.as_bytes(), &iv)
            .expect("aes-256-cfb: fixed-size key and iv");
        Self { inner, enc }
    }
}

impl<R: Read> Read for EncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.enc.encrypt(&mut buf[..n]);
        Ok(n)
    }
}

/// Decrypts a seekable ciphertext stream; `Seek(n)` followed by `Read`
/// yields the plaintext at `[n, n+len)`.
pub struct DecryptReader<R> {
    inner: R,
    key: Key,
    dec: BufDecryptor<Aes256>,
    pos: u64,
    len: u64,
}

impl<R: Read + Seek> DecryptReader<R> {
    pub fn new(key: Key, mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        let dec = decryptor_at(&key, &[0u8; BLOCK_SIZE]);
        Ok(Self {
            inner,
            key,
            dec,
            pos: 0,
            len,
        })
    }

    /// Ciphertext length; CFB is length-preserving, so also the plaintext
    /// length.
    pub fn size(&self) -> u64 {
        self.len
    }

    fn resolve_target(&self, seek: SeekFrom) -> io::Result<u64> {
        let target = match seek {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        if target > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek past end: {target} > {}", self.len),
            ));
        }
        Ok(target)
    }
}

fn decryptor_at(key: &Key, iv: &[u8; BLOCK_SIZE]) -> BufDecryptor<Aes256> {
    BufDecryptor::new_from_slices(key.as_bytes(), iv).expect("aes-256-cfb: fixed-size key and iv")
}

impl<R: Read + Seek> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.dec.decrypt(&mut buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for DecryptReader<R> {
    fn seek(&mut self, seek: SeekFrom) -> io::Result<u64> {
        let target = self.resolve_target(seek)?;
        let aligned = target - (target % BLOCK_SIZE as u64);

        // The previous ciphertext block is the IV for the realigned stream.
        let mut iv = [0u8; BLOCK_SIZE];
        if aligned >= BLOCK_SIZE as u64 {
            self.inner.seek(SeekFrom::Start(aligned - BLOCK_SIZE as u64))?;
            self.inner.read_exact(&mut iv)?;
        } else {
            self.inner.seek(SeekFrom::Start(aligned))?;
        }
        self.dec = decryptor_at(&self.key, &iv);
        if aligned >= BLOCK_SIZE as u64 {
            self.inner.seek(SeekFrom::Start(aligned))?;
        }

        // Discard the sub-block remainder.
        let skip = (target - aligned) as usize;
        if skip > 0 {
            let mut scratch = [0u8; BLOCK_SIZE];
            self.inner.read_exact(&mut scratch[..skip])?;
            self.dec.decrypt(&mut scratch[..skip]);
        }

        self.pos = target;
        Ok(target)
    }
}

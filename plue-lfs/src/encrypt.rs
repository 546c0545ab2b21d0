//! Encryption at rest.
//!
//! Objects are encrypted with AES-256-GCM under a random per-object data
//! key, chunk by chunk so uploads stream without buffering whole objects.
//! The data key is wrapped by the key-encryption key and stored in
//! metadata by id. Key material lives in [`zeroize::Zeroizing`] buffers,
//! whose documented contract is that the wipe on drop is not optimized
//! away.
//!
//! On-disk layout: a 12-byte base nonce, then chunks of
//! `u32-be ciphertext length ‖ ciphertext`. Chunk nonces are the base
//! nonce with the counter folded into the last four bytes, so no nonce
//! repeats under one data key.
use std::io::{self, Read, Write};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::Zeroizing;

use crate::store::Error;

/// Plaintext bytes sealed per chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// A per-object data key.
pub type DataKey = Zeroizing<[u8; KEY_LEN]>;

/// Wraps and unwraps data keys, and builds the streaming transforms.
pub struct Encryptor {
    kek: Zeroizing<[u8; KEY_LEN]>,
}

impl Encryptor {
    pub fn new(kek: [u8; KEY_LEN]) -> Self {
        Self {
            kek: Zeroizing::new(kek),
        }
    }

    /// A fresh random data key.
    pub fn generate_data_key(&self) -> DataKey {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(key.as_mut());
        key
    }

    /// Wrap a data key under the KEK: `nonce ‖ ciphertext`.
    pub fn wrap_key(&self, key: &DataKey) -> Result<Vec<u8>, Error> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.kek.as_ref()));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), key.as_ref())
            .map_err(|_| Error::BackendUnavailable("key wrap failed".to_owned()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<DataKey, Error> {
        if wrapped.len() <= NONCE_LEN {
            return Err(Error::BackendUnavailable("wrapped key too short".to_owned()));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.kek.as_ref()));
        let plain = cipher
            .decrypt(Nonce::from_slice(&wrapped[..NONCE_LEN]), &wrapped[NONCE_LEN..])
            .map_err(|_| Error::BackendUnavailable("key unwrap failed".to_owned()))?;
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        if plain.len() != KEY_LEN {
            return Err(Error::BackendUnavailable("wrapped key has wrong size".to_owned()));
        }
        key.copy_from_slice(&plain);
        Ok(key)
    }

    /// Encrypting writer over `sink`. Call [`EncryptingWriter::finish`] to
    /// flush the final chunk.
    pub fn writer<W: Write>(&self, key: &DataKey, sink: W) -> io::Result<EncryptingWriter<W>> {
        let mut base_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut base_nonce);
        let mut writer = EncryptingWriter {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref())),
            base_nonce,
            counter: 0,
            buf: Vec::with_capacity(CHUNK_SIZE),
            sink,
        };
        writer.sink.write_all(&base_nonce)?;
        Ok(writer)
    }

    /// Decrypting reader over `source`; reads the base nonce immediately.
    pub fn reader<R: Read>(&self, key: &DataKey, mut source: R) -> io::Result<DecryptingReader<R>> {
        let mut base_nonce = [0u8; NONCE_LEN];
        source.read_exact(&mut base_nonce)?;
        Ok(DecryptingReader {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref())),
            base_nonce,
            counter: 0,
            source,
            buf: Vec::new(),
            pos: 0,
        })
    }

    /// Total stored size for a given plaintext size: header plus per-chunk
    /// framing and tags.
    pub fn encoded_size(plain: u64) -> u64 {
        let chunks = plain.div_ceil(CHUNK_SIZE as u64).max(1);
        NONCE_LEN as u64 + plain + chunks * (4 + 16)
    }
}

fn chunk_nonce(base: &[u8; NONCE_LEN], counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    let ctr = counter.to_be_bytes();
    for (n, c) in nonce[NONCE_LEN - 4..].iter_mut().zip(ctr) {
        *n ^= c;
    }
    nonce
}

pub struct EncryptingWriter<W> {
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    counter: u32,
    buf: Vec<u8>,
    sink: W,
}

impl<W: Write> EncryptingWriter<W> {
    fn seal_chunk(&mut self) -> io::Result<()> {
        let nonce = chunk_nonce(&self.base_nonce, self.counter);
        self.counter = self.counter.wrapping_add(1);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), self.buf.as_slice())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "chunk encryption failed"))?;
        self.buf.clear();
        self.sink.write_all(&(sealed.len() as u32).to_be_bytes())?;
        self.sink.write_all(&sealed)
    }

    /// Seal the trailing partial chunk and hand the sink back.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.buf.is_empty() || self.counter == 0 {
            self.seal_chunk()?;
        }
        self.sink.flush()?;
        Ok(self.sink)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let room = CHUNK_SIZE - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == CHUNK_SIZE {
                self.seal_chunk()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Chunks only seal when full or at finish; nothing to do here.
        Ok(())
    }
}

pub struct DecryptingReader<R> {
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    counter: u32,
    source: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R: Read> DecryptingReader<R> {
    fn fill(&mut self) -> io::Result<bool> {
        let mut len = [0u8; 4];
        match self.source.read_exact(&mut len) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(err),
        }
        let len = u32::from_be_bytes(len) as usize;
        let mut sealed = vec![0u8; len];
        self.source.read_exact(&mut sealed)?;

        let nonce = chunk_nonce(&self.base_nonce, self.counter);
        self.counter = self.counter.wrapping_add(1);
        self.buf = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "corrupt or tampered chunk")
            })?;
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            if !self.fill()? {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

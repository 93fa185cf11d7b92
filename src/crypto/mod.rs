//! AES-256-GCM encryption codec and Argon2id key derivation.
//!
//! Key derivation: Argon2id(password as UTF-16LE, salt) → 32-byte key.
//! The salt and cost parameters travel in the coder options, so every block
//! records how to re-derive its key.  Readers derive each distinct key once
//! per decode session ([`KeySession`]) instead of caching it in the codec.
//!
//! Encrypted stream layout: a sequence of frames, each
//! `ciphertext (≤ 64 KiB) || GCM tag (16 B)`.  Frame *n* uses the nonce
//! `prefix (7 B) || final flag (1 B) || n (4 B, BE)`; only the last frame has
//! the final flag set, so truncating the stream at a frame boundary is
//! detected.
//!
//! Options blob layout (29 bytes):
//! `version (1) | m_cost KiB (u32 LE) | t_cost (1) | salt (16) | nonce prefix (7)`

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::{BoxSink, BoxSource, Codec, CodecError, DecodeContext, Sink, ID_AES_GCM};

pub const KEY_LEN:          usize = 32;
pub const SALT_LEN:         usize = 16;
pub const NONCE_PREFIX_LEN: usize = 7;
pub const TAG_LEN:          usize = 16;
/// Plaintext bytes per frame.
pub const FRAME_LEN:        usize = 64 * 1024;

const OPTIONS_VERSION: u8    = 1;
const OPTIONS_LEN:     usize = 1 + 4 + 1 + SALT_LEN + NONCE_PREFIX_LEN;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong password or corrupted data")]
    DecryptionFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encrypted stream truncated")]
    TooShort,
    #[error("Block is encrypted but no decryption key was provided")]
    MissingKey,
    #[error("Too many frames in one encrypted stream")]
    FrameCounterOverflow,
}

// ── Password ─────────────────────────────────────────────────────────────────

/// Password bytes as UTF-16LE.  Zeroed when dropped.
pub struct Password(Vec<u8>);

impl Password {
    pub fn new(text: &str) -> Self {
        Password(text.encode_utf16().flat_map(u16::to_le_bytes).collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.fill(0);
        compiler_fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(..)")
    }
}

// ── Key derivation ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost:     u8,
    pub salt:       [u8; SALT_LEN],
}

impl KdfParams {
    /// Conservative defaults with a fresh random salt.
    pub fn generate() -> Self {
        Self::with_cost(64 * 1024, 3)
    }

    pub fn with_cost(m_cost_kib: u32, t_cost: u8) -> Self {
        Self { m_cost_kib, t_cost, salt: Uuid::new_v4().into_bytes() }
    }
}

/// Derive a 256-bit key from `password` using Argon2id.
pub fn derive_key(password: &Password, params: &KdfParams) -> Result<[u8; KEY_LEN], CryptoError> {
    let argon_params = Params::new(params.m_cost_kib, u32::from(params.t_cost), 1, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), &params.salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Keys derived during one decode session, keyed by their parameters.
#[derive(Default)]
pub struct KeySession {
    keys: HashMap<KdfParams, [u8; KEY_LEN]>,
}

impl KeySession {
    pub fn key_for(&mut self, password: &Password, params: &KdfParams) -> Result<[u8; KEY_LEN], CryptoError> {
        if let Some(key) = self.keys.get(params) {
            return Ok(*key);
        }
        let key = derive_key(password, params)?;
        self.keys.insert(*params, key);
        Ok(key)
    }

    pub fn derived_count(&self) -> usize {
        self.keys.len()
    }
}

impl Drop for KeySession {
    fn drop(&mut self) {
        for key in self.keys.values_mut() {
            key.fill(0);
        }
        compiler_fence(Ordering::SeqCst);
    }
}

// ── Framing ──────────────────────────────────────────────────────────────────

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN] = u8::from(last);
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn to_io(e: CryptoError) -> io::Error {
    CodecError::from(e).into_io()
}

struct AesSink {
    cipher:  Aes256Gcm,
    prefix:  [u8; NONCE_PREFIX_LEN],
    counter: u32,
    buf:     Vec<u8>,
    inner:   BoxSink,
}

impl AesSink {
    fn seal(&mut self, end: usize, last: bool) -> io::Result<()> {
        let nonce = frame_nonce(&self.prefix, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), &self.buf[..end])
            .map_err(|_| to_io(CryptoError::EncryptionFailed))?;
        self.inner.write_all(&sealed)?;
        self.buf.drain(..end);
        self.counter = self.counter.checked_add(1).ok_or_else(|| to_io(CryptoError::FrameCounterOverflow))?;
        Ok(())
    }
}

impl Write for AesSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        // a frame is sealed as non-final only once more data follows it
        while self.buf.len() > FRAME_LEN {
            self.seal(FRAME_LEN, false)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl Sink for AesSink {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let end = self.buf.len();
        self.seal(end, true)?;
        let this = *self;
        this.inner.finish()
    }
}

struct AesSource {
    cipher:    Aes256Gcm,
    prefix:    [u8; NONCE_PREFIX_LEN],
    counter:   u32,
    inner:     BoxSource,
    lookahead: Option<u8>,
    plain:     Vec<u8>,
    offset:    usize,
    done:      bool,
}

impl AesSource {
    fn fill(&mut self, frame: &mut Vec<u8>) -> io::Result<()> {
        let want = FRAME_LEN + TAG_LEN;
        frame.clear();
        frame.extend(self.lookahead.take());
        let mut chunk = [0u8; 8192];
        while frame.len() < want {
            let n = self.inner.read(&mut chunk[..(want - frame.len()).min(8192)])?;
            if n == 0 {
                break;
            }
            frame.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut frame = Vec::with_capacity(FRAME_LEN + TAG_LEN);
        self.fill(&mut frame)?;
        let last = if frame.len() == FRAME_LEN + TAG_LEN {
            let mut probe = [0u8; 1];
            let n = self.inner.read(&mut probe)?;
            self.lookahead = (n == 1).then_some(probe[0]);
            n == 0
        } else {
            true
        };
        if frame.len() < TAG_LEN {
            return Err(to_io(CryptoError::TooShort));
        }
        let nonce = frame_nonce(&self.prefix, self.counter, last);
        self.plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), frame.as_slice())
            .map_err(|_| to_io(CryptoError::DecryptionFailed))?;
        self.offset = 0;
        self.done = last;
        self.counter = self.counter.checked_add(1).ok_or_else(|| to_io(CryptoError::FrameCounterOverflow))?;
        Ok(())
    }
}

impl Read for AesSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.plain.len() {
            if self.done {
                return Ok(0);
            }
            self.next_frame()?;
        }
        let n = buf.len().min(self.plain.len() - self.offset);
        buf[..n].copy_from_slice(&self.plain[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// Encryption codec.  Encoder instances hold the derived key; decoder
/// instances only hold the parameters and derive through the session.
#[derive(Clone)]
pub struct AesCodec {
    params: KdfParams,
    prefix: [u8; NONCE_PREFIX_LEN],
    key:    Option<[u8; KEY_LEN]>,
}

fn random_prefix() -> [u8; NONCE_PREFIX_LEN] {
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    prefix.copy_from_slice(&nonce[..NONCE_PREFIX_LEN]);
    prefix
}

impl AesCodec {
    /// Encoder with default Argon2id cost and a fresh salt.
    pub fn new(password: &Password) -> Result<Self, CryptoError> {
        Self::with_params(password, KdfParams::generate())
    }

    pub fn with_params(password: &Password, params: KdfParams) -> Result<Self, CryptoError> {
        let key = derive_key(password, &params)?;
        Ok(Self { params, prefix: random_prefix(), key: Some(key) })
    }

    pub fn for_decoding() -> Self {
        Self { params: KdfParams { m_cost_kib: 0, t_cost: 0, salt: [0; SALT_LEN] }, prefix: [0; NONCE_PREFIX_LEN], key: None }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }
}

impl Drop for AesCodec {
    fn drop(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.fill(0);
        }
        compiler_fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for AesCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesCodec")
            .field("params", &self.params)
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

impl Codec for AesCodec {
    fn method_id(&self) -> &[u8] { ID_AES_GCM }
    fn name(&self) -> &str { "aes" }
    fn memory_usage_kb(&self) -> u64 { u64::from(self.params.m_cost_kib) + 256 }

    fn write_options(&self) -> Vec<u8> {
        let mut out = vec![0u8; OPTIONS_LEN];
        out[0] = OPTIONS_VERSION;
        LittleEndian::write_u32(&mut out[1..5], self.params.m_cost_kib);
        out[5] = self.params.t_cost;
        out[6..6 + SALT_LEN].copy_from_slice(&self.params.salt);
        out[6 + SALT_LEN..].copy_from_slice(&self.prefix);
        out
    }

    fn read_options(&mut self, options: &[u8]) -> Result<(), CodecError> {
        if options.len() != OPTIONS_LEN || options[0] != OPTIONS_VERSION {
            return Err(CodecError::InvalidOptions {
                codec:  "aes",
                reason: format!("expected {OPTIONS_LEN}-byte v{OPTIONS_VERSION} blob"),
            });
        }
        self.params.m_cost_kib = LittleEndian::read_u32(&options[1..5]);
        self.params.t_cost = options[5];
        self.params.salt.copy_from_slice(&options[6..6 + SALT_LEN]);
        self.prefix.copy_from_slice(&options[6 + SALT_LEN..]);
        Ok(())
    }

    fn instantiate(&self) -> Arc<dyn Codec> {
        let mut fresh = self.clone();
        if fresh.key.is_some() {
            fresh.prefix = random_prefix();
        }
        Arc::new(fresh)
    }

    fn encode(&self, sink: BoxSink) -> Result<BoxSink, CodecError> {
        let key = self.key.ok_or(CodecError::MissingPassword)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(Box::new(AesSink { cipher, prefix: self.prefix, counter: 0, buf: Vec::new(), inner: sink }))
    }

    fn decode(&self, source: BoxSource, _: u64, ctx: &mut DecodeContext) -> Result<BoxSource, CodecError> {
        let key = ctx.session_key(&self.params)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(Box::new(AesSource {
            cipher,
            prefix:    self.prefix,
            counter:   0,
            inner:     source,
            lookahead: None,
            plain:     Vec::new(),
            offset:    0,
            done:      false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MemoryBudget;
    use std::sync::Mutex;

    struct Collect(Arc<Mutex<Vec<u8>>>);

    impl Write for Collect {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    impl Sink for Collect {
        fn finish(self: Box<Self>) -> io::Result<()> { Ok(()) }
    }

    fn cheap() -> KdfParams {
        KdfParams::with_cost(64, 1)
    }

    fn seal(codec: &AesCodec, data: &[u8]) -> Vec<u8> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut sink = codec.encode(Box::new(Collect(out.clone()))).unwrap();
        sink.write_all(data).unwrap();
        sink.finish().unwrap();
        let sealed = out.lock().unwrap().clone();
        sealed
    }

    fn open(codec: &AesCodec, password: Option<&str>, sealed: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut decoder = AesCodec::for_decoding();
        decoder.read_options(&codec.write_options()).unwrap();
        let mut ctx = DecodeContext::new(MemoryBudget::unlimited(), password.map(|p| Arc::new(Password::new(p))));
        let mut src = decoder
            .decode(Box::new(io::Cursor::new(sealed)), 0, &mut ctx)
            .map_err(CodecError::into_io)?;
        let mut out = Vec::new();
        src.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn password_is_utf16le() {
        assert_eq!(Password::new("Ab").as_bytes(), [0x41, 0x00, 0x62, 0x00]);
    }

    #[test]
    fn multi_frame_round_trip() {
        let codec = AesCodec::with_params(&Password::new("pw"), cheap()).unwrap();
        for len in [0, 1, FRAME_LEN, FRAME_LEN + 1, 2 * FRAME_LEN] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = seal(&codec, &data);
            assert_eq!(sealed.len(), len + TAG_LEN * len.div_ceil(FRAME_LEN).max(1));
            assert_eq!(open(&codec, Some("pw"), sealed).unwrap(), data);
        }
    }

    #[test]
    fn wrong_password_fails_authentication() {
        let codec = AesCodec::with_params(&Password::new("right"), cheap()).unwrap();
        let sealed = seal(&codec, b"secret");
        assert!(open(&codec, Some("wrong"), sealed).is_err());
    }

    #[test]
    fn dropped_final_frame_is_detected() {
        let codec = AesCodec::with_params(&Password::new("pw"), cheap()).unwrap();
        let data = vec![7u8; FRAME_LEN + 10];
        let mut sealed = seal(&codec, &data);
        sealed.truncate(FRAME_LEN + TAG_LEN);
        assert!(open(&codec, Some("pw"), sealed).is_err());
    }

    #[test]
    fn session_derives_each_key_once() {
        let params = cheap();
        let password = Password::new("pw");
        let mut session = KeySession::default();
        let a = session.key_for(&password, &params).unwrap();
        let b = session.key_for(&password, &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(session.derived_count(), 1);
    }

    #[test]
    fn fresh_instances_get_fresh_nonces() {
        let codec = AesCodec::with_params(&Password::new("pw"), cheap()).unwrap();
        let a = codec.instantiate().write_options();
        let b = codec.instantiate().write_options();
        assert_eq!(a[..6 + SALT_LEN], b[..6 + SALT_LEN]);
        assert_ne!(a[6 + SALT_LEN..], b[6 + SALT_LEN..]);
    }
}

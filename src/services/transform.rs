//! Streaming compression + encryption.
//!
//! Write path: `plaintext -> gzip -> AES-OFB -> IV || ciphertext`.
//! Read path is the mirror image. Each call owns its cipher and
//! (de)compressor for the lifetime of one transfer and runs them on a
//! blocking task, feeding a bounded pipe so the caller can drain output
//! while input is still being read.

use crate::services::pipe::{self, DEFAULT_PIPE_FRAMES, PipeReader};
use aes::{Aes128, Aes192, Aes256};
use flate2::{Compression, bufread::GzDecoder, write::GzEncoder};
use ofb::{
    Ofb,
    cipher::{KeyIvInit, StreamCipher},
};
use rand::RngCore;
use std::{
    fmt,
    io::{self, BufReader, Read, Write},
};
use thiserror::Error;
use tokio::{io::AsyncRead, task::JoinHandle};
use tokio_util::io::SyncIoBridge;
use tracing::debug;
use zeroize::Zeroizing;

/// AES block width; also the length of the IV prefix of every frame.
pub const IV_LEN: usize = 16;

const COPY_BUF_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("encryption key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encrypted frame is shorter than its 16-byte IV")]
    TruncatedFrame,
    #[error("corrupt compressed stream: {0}")]
    Decompress(#[source] io::Error),
    #[error("{0} unexpected bytes after the end of the compressed stream")]
    TrailingData(u64),
    #[error("transform task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransformError {
    /// Failure caused only by the other end of a pipe closing.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            TransformError::Io(err) | TransformError::Decompress(err) => {
                pipe::is_broken_pipe(err)
            }
            _ => false,
        }
    }
}

pub type TransformResult<T> = Result<T, TransformError>;

/// Raw symmetric key bytes, wiped on drop.
#[derive(Clone)]
pub struct SecretKey(Zeroizing<Vec<u8>>);

impl SecretKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> TransformResult<Self> {
        let key = Self(Zeroizing::new(bytes.into()));
        check_key_len(key.as_bytes())?;
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED; {}])", self.0.len())
    }
}

/// Chooses the key used for an object.
///
/// Only the pre-shared [`StaticKey`] exists today; per-object derivation or
/// rotation can be added as another implementation without touching the
/// pipeline.
pub trait KeyPolicy: Send + Sync {
    fn key_for(&self, object_key: &str) -> TransformResult<SecretKey>;
}

/// One pre-shared key for every object.
#[derive(Clone, Debug)]
pub struct StaticKey {
    key: SecretKey,
}

impl StaticKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> TransformResult<Self> {
        Ok(Self {
            key: SecretKey::new(bytes)?,
        })
    }
}

impl From<SecretKey> for StaticKey {
    fn from(key: SecretKey) -> Self {
        Self { key }
    }
}

impl KeyPolicy for StaticKey {
    fn key_for(&self, _object_key: &str) -> TransformResult<SecretKey> {
        Ok(self.key.clone())
    }
}

fn check_key_len(key: &[u8]) -> TransformResult<()> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(TransformError::InvalidKeyLength(other)),
    }
}

/// AES in output feedback mode; key size picks the variant.
enum AesOfb {
    Aes128(Ofb<Aes128>),
    Aes192(Ofb<Aes192>),
    Aes256(Ofb<Aes256>),
}

impl AesOfb {
    fn new(key: &[u8], iv: &[u8; IV_LEN]) -> TransformResult<Self> {
        let invalid = |_| TransformError::InvalidKeyLength(key.len());
        match key.len() {
            16 => Ofb::<Aes128>::new_from_slices(key, iv)
                .map(Self::Aes128)
                .map_err(invalid),
            24 => Ofb::<Aes192>::new_from_slices(key, iv)
                .map(Self::Aes192)
                .map_err(invalid),
            32 => Ofb::<Aes256>::new_from_slices(key, iv)
                .map(Self::Aes256)
                .map_err(invalid),
            other => Err(TransformError::InvalidKeyLength(other)),
        }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            AesOfb::Aes128(cipher) => cipher.apply_keystream(buf),
            AesOfb::Aes192(cipher) => cipher.apply_keystream(buf),
            AesOfb::Aes256(cipher) => cipher.apply_keystream(buf),
        }
    }
}

/// Encrypts everything written through it.
struct CipherWriter<W> {
    inner: W,
    cipher: AesOfb,
    scratch: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    fn new(inner: W, cipher: AesOfb) -> Self {
        Self {
            inner,
            cipher,
            scratch: Vec::with_capacity(COPY_BUF_LEN),
        }
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // The keystream advances as soon as it is applied, so the whole
        // buffer has to reach the inner writer.
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply(&mut self.scratch);
        self.inner.write_all(&self.scratch)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts everything read through it.
struct CipherReader<R> {
    inner: R,
    cipher: AesOfb,
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply(&mut buf[..n]);
        Ok(n)
    }
}

/// Background half of an encode or decode; resolves to the plaintext byte
/// count once the output stream has been fully produced.
pub struct TransformTask {
    handle: JoinHandle<TransformResult<u64>>,
}

impl TransformTask {
    pub async fn wait(self) -> TransformResult<u64> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(TransformError::Task(err.to_string())),
        }
    }
}

/// Compress and encrypt `source`.
///
/// Returns a stream yielding `IV || ciphertext` and a task resolving to
/// the number of plaintext bytes read from `source`. Must be called from
/// within a Tokio runtime.
pub fn encode<R>(source: R, key: &SecretKey) -> TransformResult<(PipeReader, TransformTask)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let cipher = AesOfb::new(key.as_bytes(), &iv)?;

    let (writer, reader) = pipe::pipe(DEFAULT_PIPE_FRAMES);
    let mut source = SyncIoBridge::new(source);
    let mut output = SyncIoBridge::new(writer);

    let handle = tokio::task::spawn_blocking(move || -> TransformResult<u64> {
        output.write_all(&iv)?;
        let mut compressor = GzEncoder::new(
            CipherWriter::new(&mut output, cipher),
            Compression::default(),
        );
        let copied = io::copy(&mut source, &mut compressor)?;
        compressor.finish()?.flush()?;
        output.shutdown()?;
        debug!(plaintext_bytes = copied, "encode finished");
        Ok(copied)
    });

    Ok((reader, TransformTask { handle }))
}

/// Decrypt and decompress a frame produced by [`encode`].
///
/// Returns the plaintext stream and a task resolving to the number of
/// plaintext bytes produced. Must be called from within a Tokio runtime.
pub fn decode<R>(frame: R, key: &SecretKey) -> TransformResult<(PipeReader, TransformTask)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    check_key_len(key.as_bytes())?;
    let key = key.clone();

    let (writer, reader) = pipe::pipe(DEFAULT_PIPE_FRAMES);
    let mut input = SyncIoBridge::new(frame);
    let mut output = SyncIoBridge::new(writer);

    let handle = tokio::task::spawn_blocking(move || -> TransformResult<u64> {
        let mut iv = [0u8; IV_LEN];
        input.read_exact(&mut iv).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => TransformError::TruncatedFrame,
            _ => TransformError::Io(err),
        })?;
        let cipher = AesOfb::new(key.as_bytes(), &iv)?;
        let mut decompressor = GzDecoder::new(BufReader::with_capacity(
            COPY_BUF_LEN,
            CipherReader {
                inner: input,
                cipher,
            },
        ));

        let mut buf = vec![0u8; COPY_BUF_LEN];
        let mut produced = 0u64;
        loop {
            let n = match decompressor.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransformError::Decompress(err)),
            };
            output.write_all(&buf[..n])?;
            produced += n as u64;
        }

        // Consume the frame to its end so the fetch stage can finish, and
        // refuse anything past the gzip trailer.
        let mut rest = decompressor.into_inner();
        let trailing = io::copy(&mut rest, &mut io::sink())?;
        if trailing > 0 {
            return Err(TransformError::TrailingData(trailing));
        }
        output.shutdown()?;
        debug!(plaintext_bytes = produced, "decode finished");
        Ok(produced)
    });

    Ok((reader, TransformTask { handle }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIST_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];
    const NIST_IV: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];

    #[test]
    fn ofb_matches_sp800_38a_vector() {
        let mut block = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let mut cipher = AesOfb::new(&NIST_KEY, &NIST_IV).unwrap();
        cipher.apply(&mut block);
        assert_eq!(
            block,
            [
                0x3b, 0x3f, 0xd9, 0x2e, 0xb7, 0x2d, 0xad, 0x20, 0x33, 0x34, 0x49, 0xf8, 0xe8, 0x3c,
                0xfb, 0x4a,
            ]
        );
    }

    #[test]
    fn cipher_writer_and_reader_are_inverse() {
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();

        let mut sealed = Vec::new();
        {
            let mut writer =
                CipherWriter::new(&mut sealed, AesOfb::new(&NIST_KEY, &NIST_IV).unwrap());
            for chunk in plaintext.chunks(333) {
                writer.write_all(chunk).unwrap();
            }
        }
        assert_ne!(sealed, plaintext);

        let mut reader = CipherReader {
            inner: sealed.as_slice(),
            cipher: AesOfb::new(&NIST_KEY, &NIST_IV).unwrap(),
        };
        let mut opened = Vec::new();
        reader.read_to_end(&mut opened).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn rejects_bad_key_lengths() {
        assert!(matches!(
            SecretKey::new(b"short".to_vec()),
            Err(TransformError::InvalidKeyLength(5))
        ));
        assert!(SecretKey::new(vec![0u8; 24]).is_ok());
        assert!(SecretKey::new(vec![0u8; 32]).is_ok());
    }

    #[test]
    fn debug_output_hides_key() {
        let key = SecretKey::new(b"0123456789abcdef".to_vec()).unwrap();
        assert_eq!(format!("{key:?}"), "SecretKey([REDACTED; 16])");
    }
}

//! The signed, optionally encrypted bundle envelope.
//!
//! Artifact layout:
//!
//! ```text
//! magic || version || u32 header-len || header JSON
//!   || payload frames (u32 len || bytes, zero-length terminator)
//!   || u32 metadata-len || metadata JSON
//!   || 64-byte Ed25519 signature
//! ```
//!
//! The signature covers every byte before it, so the header, payload and
//! metadata are all authenticated.  When the payload is encrypted each frame
//! is a ChaCha20-Poly1305 chunk; the content key is wrapped per recipient
//! with X25519 ECDH.  [`BlobReader::open`] verifies the signature before any
//! payload byte is exposed, and the plaintext digests in the metadata are
//! re-checked as the payload streams out.

pub mod keys;
pub mod metadata;

use std::io::{self, Read, Seek, SeekFrom, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Sha3_512;
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};

use self::keys::{Keyring, PrivateKey, PublicKey};
use self::metadata::{Hashes, Metadata};

const MAGIC: &[u8; 4] = b"BNDL";
const VERSION: u8 = 1;
const CHUNK_SIZE: usize = 64 * 1024;
const NONCE_PREFIX_SIZE: usize = 4;
const SIGNATURE_SIZE: usize = 64;
const CONTENT_KEY_SIZE: usize = 32;
// Upper bound on the JSON blocks; anything larger is a malformed artifact.
const MAX_JSON_LEN: u32 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("malformed envelope: {0}")]
    Format(String),
    #[error("signature verification failed: no authorized key signed this artifact")]
    Signature,
    #[error("artifact is encrypted but was expected to be plaintext")]
    UnexpectedlyEncrypted,
    #[error("artifact is plaintext but was expected to be encrypted")]
    UnexpectedlyPlaintext,
    #[error("the configured private key is not a recipient of this artifact")]
    NotARecipient,
    #[error("payload authentication failed")]
    Payload,
    #[error("payload digest does not match the signed metadata")]
    Digest,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_err(msg: impl Into<String>) -> BlobError {
    BlobError::Format(msg.into())
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Unsigned-at-parse-time framing data.  Everything here is covered by the
/// trailing signature; the reader parses it first and trusts it only after
/// the signature check passes.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    encrypted: bool,
    /// Hex X25519 ephemeral public key (encrypted envelopes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ephemeral: Option<String>,
    /// Hex 4-byte chunk nonce prefix (encrypted envelopes only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    recipients: Vec<Recipient>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Recipient {
    /// Fingerprint of the recipient's Ed25519 public key.
    key: String,
    /// Hex nonce for the key wrap.
    nonce: String,
    /// Hex wrapped content key.
    wrapped: String,
}

/// KEK = SHA-256(shared-secret || ephemeral-pub || recipient-pub).
fn derive_kek(
    shared: &SharedSecret,
    ephemeral: &X25519PublicKey,
    recipient: &X25519PublicKey,
) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    let digest = hasher.finalize();
    *Key::from_slice(digest.as_slice())
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    bytes[NONCE_PREFIX_SIZE..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

fn random_bytes<const N: usize>() -> Result<[u8; N], BlobError> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| BlobError::Other(anyhow::anyhow!("system RNG failure: {e}")))?;
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Plaintext digest state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PlainDigests {
    sha256: Sha256,
    sha3_512: Sha3_512,
    blake2b_512: blake2::Blake2b512,
    size: u64,
}

impl PlainDigests {
    fn new() -> Self {
        PlainDigests {
            sha256: Sha256::new(),
            sha3_512: Sha3_512::new(),
            blake2b_512: blake2::Blake2b512::new(),
            size: 0,
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.sha3_512.update(data);
        self.blake2b_512.update(data);
        self.size += data.len() as u64;
    }

    fn finalize(self) -> (Hashes, u64) {
        let hashes = Hashes {
            sha256: hex::encode(self.sha256.finalize()),
            sha3_512: hex::encode(self.sha3_512.finalize()),
            blake2b_512: hex::encode(self.blake2b_512.finalize()),
        };
        (hashes, self.size)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Streaming envelope writer.  Accepts plaintext via [`Write`]; nothing is
/// final until [`BlobWriter::sign`] has appended the metadata and signature.
pub struct BlobWriter<W: Write> {
    inner: W,
    signed: Sha3_512,
    digests: PlainDigests,
    pending: Vec<u8>,
    cipher: Option<ChunkCipher>,
    recipients: Vec<String>,
    encrypted: bool,
    signer: PrivateKey,
}

struct ChunkCipher {
    aead: ChaCha20Poly1305,
    prefix: [u8; NONCE_PREFIX_SIZE],
    counter: u64,
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("prefix", &self.prefix)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl<W: Write> BlobWriter<W> {
    /// Start a new envelope on `inner`.  When `encrypted` is true the
    /// payload is encrypted to every public key in the keyring.
    pub fn create(inner: W, keyring: &Keyring, encrypted: bool) -> Result<Self, BlobError> {
        let mut writer = BlobWriter {
            inner,
            signed: Sha3_512::new(),
            digests: PlainDigests::new(),
            pending: Vec::with_capacity(CHUNK_SIZE),
            cipher: None,
            recipients: Vec::new(),
            encrypted,
            signer: keyring.private.clone(),
        };

        let header = if encrypted {
            writer.encrypted_header(keyring)?
        } else {
            Header {
                encrypted: false,
                ephemeral: None,
                nonce_prefix: None,
                recipients: Vec::new(),
            }
        };

        writer.emit(MAGIC)?;
        writer.emit(&[VERSION])?;
        writer.emit_json(&header)?;
        Ok(writer)
    }

    fn encrypted_header(&mut self, keyring: &Keyring) -> Result<Header, BlobError> {
        let content_key = random_bytes::<CONTENT_KEY_SIZE>()?;
        let prefix = random_bytes::<NONCE_PREFIX_SIZE>()?;
        let ephemeral_secret = StaticSecret::from(random_bytes::<32>()?);
        let ephemeral_pub = X25519PublicKey::from(&ephemeral_secret);

        let mut recipients = Vec::new();
        for public in &keyring.public {
            let fingerprint = public.fingerprint();
            if self.recipients.contains(&fingerprint) {
                continue;
            }

            let recipient_x = public.to_x25519()?;
            let shared = ephemeral_secret.diffie_hellman(&recipient_x);
            let kek = derive_kek(&shared, &ephemeral_pub, &recipient_x);
            let nonce = random_bytes::<12>()?;
            let wrapped = ChaCha20Poly1305::new(&kek)
                .encrypt(Nonce::from_slice(&nonce), content_key.as_slice())
                .map_err(|_| BlobError::Payload)?;

            recipients.push(Recipient {
                key: fingerprint.clone(),
                nonce: hex::encode(nonce),
                wrapped: hex::encode(wrapped),
            });
            self.recipients.push(fingerprint);
        }

        self.cipher = Some(ChunkCipher {
            aead: ChaCha20Poly1305::new(Key::from_slice(&content_key)),
            prefix,
            counter: 0,
        });

        Ok(Header {
            encrypted: true,
            ephemeral: Some(hex::encode(ephemeral_pub.as_bytes())),
            nonce_prefix: Some(hex::encode(prefix)),
            recipients,
        })
    }

    /// Write raw bytes into the signed region.
    fn emit(&mut self, data: &[u8]) -> Result<(), BlobError> {
        self.inner.write_all(data)?;
        self.signed.update(data);
        Ok(())
    }

    fn emit_json<T: Serialize>(&mut self, value: &T) -> Result<(), BlobError> {
        let json = serde_json::to_vec(value)
            .map_err(|e| BlobError::Other(anyhow::anyhow!("serialize envelope block: {e}")))?;
        self.emit(&(json.len() as u32).to_be_bytes())?;
        self.emit(&json)
    }

    fn emit_chunk(&mut self, chunk: &[u8]) -> Result<(), BlobError> {
        debug_assert!(!chunk.is_empty() && chunk.len() <= CHUNK_SIZE);

        let framed = match &mut self.cipher {
            Some(cipher) => {
                let nonce = chunk_nonce(&cipher.prefix, cipher.counter);
                cipher.counter += 1;
                cipher
                    .aead
                    .encrypt(&nonce, chunk)
                    .map_err(|_| BlobError::Payload)?
            }
            None => chunk.to_vec(),
        };

        self.emit(&(framed.len() as u32).to_be_bytes())?;
        self.emit(&framed)
    }

    fn flush_pending(&mut self) -> Result<(), BlobError> {
        while self.pending.len() >= CHUNK_SIZE {
            let chunk: Vec<u8> = self.pending.drain(..CHUNK_SIZE).collect();
            self.emit_chunk(&chunk)?;
        }
        Ok(())
    }

    /// Finalize the envelope: flush the last chunk, append the metadata and
    /// the signature, and hand back the underlying writer.
    pub fn sign(mut self) -> Result<W, BlobError> {
        self.flush_pending()?;
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.emit_chunk(&chunk)?;
        }
        // Zero-length terminator frame.
        self.emit(&0u32.to_be_bytes())?;

        let (hashes, size) = std::mem::replace(&mut self.digests, PlainDigests::new()).finalize();
        let meta = Metadata {
            version: VERSION,
            encrypted: self.encrypted,
            size,
            hashes,
            keys: std::mem::take(&mut self.recipients),
        };
        self.emit_json(&meta)?;

        let digest = self.signed.clone().finalize();
        let signature = self.signer.sign(digest.as_slice());
        self.inner.write_all(&signature.to_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BlobWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.digests.update(buf);
        self.pending.extend_from_slice(buf);
        self.flush_pending()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Verified envelope reader.
///
/// [`BlobReader::open`] makes a full pass over the artifact to check the
/// signature against the authorized signer set before constructing the
/// reader; the [`Read`] impl then streams the plaintext payload, re-checking
/// the signed digests at end of stream.
#[derive(Debug)]
pub struct BlobReader<R: Read + Seek> {
    inner: R,
    /// Fingerprint of the key that signed this artifact.
    pub signer: String,
    pub metadata: Metadata,
    cipher: Option<ChunkCipher>,
    digests: Option<PlainDigests>,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read + Seek> BlobReader<R> {
    /// Open and verify an envelope.  `encrypted` states what the caller
    /// expects; a mismatch with the artifact fails in either direction.
    pub fn open(mut inner: R, keyring: &Keyring, encrypted: bool) -> Result<Self, BlobError> {
        inner.seek(SeekFrom::Start(0))?;
        let parsed = parse_and_verify(&mut inner, keyring)?;

        if parsed.metadata.encrypted && !encrypted {
            return Err(BlobError::UnexpectedlyEncrypted);
        }
        if !parsed.metadata.encrypted && encrypted {
            return Err(BlobError::UnexpectedlyPlaintext);
        }

        let cipher = if parsed.metadata.encrypted {
            Some(unwrap_content_key(&parsed.header, keyring)?)
        } else {
            None
        };

        inner.seek(SeekFrom::Start(parsed.payload_start))?;
        Ok(BlobReader {
            inner,
            signer: parsed.signer,
            metadata: parsed.metadata,
            cipher,
            digests: Some(PlainDigests::new()),
            current: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    /// Pull the next payload frame into `current`.  Returns false at the
    /// terminator, after the digest check has passed.
    fn next_chunk(&mut self) -> Result<bool, BlobError> {
        let len = read_u32(&mut self.inner)?;
        if len == 0 {
            let digests = self
                .digests
                .take()
                .ok_or_else(|| format_err("payload already fully read"))?;
            let (hashes, size) = digests.finalize();
            if hashes != self.metadata.hashes || size != self.metadata.size {
                return Err(BlobError::Digest);
            }
            self.done = true;
            return Ok(false);
        }

        let mut frame = vec![0u8; len as usize];
        self.inner.read_exact(&mut frame)?;

        let plain = match &mut self.cipher {
            Some(cipher) => {
                let nonce = chunk_nonce(&cipher.prefix, cipher.counter);
                cipher.counter += 1;
                cipher
                    .aead
                    .decrypt(&nonce, frame.as_slice())
                    .map_err(|_| BlobError::Payload)?
            }
            None => frame,
        };

        if let Some(digests) = &mut self.digests {
            digests.update(&plain);
        }
        self.current = plain;
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read + Seek> Read for BlobReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.next_chunk()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }
}

// ---------------------------------------------------------------------------
// Parse + verify pass
// ---------------------------------------------------------------------------

struct Parsed {
    header: Header,
    metadata: Metadata,
    payload_start: u64,
    signer: String,
}

/// Sequentially parse the artifact, hashing everything up to the signature,
/// then check the signature against the authorized signer set.
fn parse_and_verify<R: Read + Seek>(inner: &mut R, keyring: &Keyring) -> Result<Parsed, BlobError> {
    let mut signed = Sha3_512::new();

    let mut magic = [0u8; 4];
    read_hashed(inner, &mut signed, &mut magic)?;
    if &magic != MAGIC {
        return Err(format_err("bad magic"));
    }

    let mut version = [0u8; 1];
    read_hashed(inner, &mut signed, &mut version)?;
    if version[0] != VERSION {
        return Err(format_err(format!("unsupported version {}", version[0])));
    }

    let header: Header = read_json_hashed(inner, &mut signed)?;
    let payload_start = inner.stream_position()?;

    // Skip over the payload frames, feeding them into the signed digest.
    loop {
        let mut len_bytes = [0u8; 4];
        read_hashed(inner, &mut signed, &mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes);
        if len == 0 {
            break;
        }
        let mut frame = vec![0u8; len as usize];
        read_hashed(inner, &mut signed, &mut frame)?;
    }

    let metadata: Metadata = read_json_hashed(inner, &mut signed)?;

    let mut sig_bytes = [0u8; SIGNATURE_SIZE];
    inner.read_exact(&mut sig_bytes)?;
    let mut trailing = [0u8; 1];
    if inner.read(&mut trailing)? != 0 {
        return Err(format_err("trailing bytes after signature"));
    }

    if header.encrypted != metadata.encrypted {
        return Err(format_err("header/metadata encrypted flags disagree"));
    }

    let signature = Signature::from_bytes(&sig_bytes);
    let digest = signed.finalize();
    let signer = keyring
        .public
        .iter()
        .find(|key| key.verify(digest.as_slice(), &signature))
        .map(PublicKey::fingerprint)
        .ok_or(BlobError::Signature)?;

    Ok(Parsed {
        header,
        metadata,
        payload_start,
        signer,
    })
}

/// Recover the content key wrapped for this keyring's private key.
fn unwrap_content_key(header: &Header, keyring: &Keyring) -> Result<ChunkCipher, BlobError> {
    let ephemeral_hex = header
        .ephemeral
        .as_deref()
        .ok_or_else(|| format_err("encrypted envelope without ephemeral key"))?;
    let prefix_hex = header
        .nonce_prefix
        .as_deref()
        .ok_or_else(|| format_err("encrypted envelope without nonce prefix"))?;

    let ephemeral_pub = X25519PublicKey::from(decode_hex::<32>(ephemeral_hex)?);
    let prefix = decode_hex::<NONCE_PREFIX_SIZE>(prefix_hex)?;

    let our_fingerprint = keyring.private.public().fingerprint();
    let recipient = header
        .recipients
        .iter()
        .find(|r| r.key == our_fingerprint)
        .ok_or(BlobError::NotARecipient)?;

    let our_x = keyring.private.public().to_x25519()?;
    let shared = keyring.private.to_x25519().diffie_hellman(&ephemeral_pub);
    let kek = derive_kek(&shared, &ephemeral_pub, &our_x);

    let nonce = decode_hex::<12>(&recipient.nonce)?;
    let wrapped =
        hex::decode(&recipient.wrapped).map_err(|_| format_err("invalid wrapped key hex"))?;
    let content_key = ChaCha20Poly1305::new(&kek)
        .decrypt(Nonce::from_slice(&nonce), wrapped.as_slice())
        .map_err(|_| BlobError::Payload)?;
    if content_key.len() != CONTENT_KEY_SIZE {
        return Err(format_err("invalid content key size"));
    }

    Ok(ChunkCipher {
        aead: ChaCha20Poly1305::new(Key::from_slice(&content_key)),
        prefix,
        counter: 0,
    })
}

fn decode_hex<const N: usize>(hex_str: &str) -> Result<[u8; N], BlobError> {
    let bytes = hex::decode(hex_str).map_err(|_| format_err("invalid hex in envelope"))?;
    bytes
        .try_into()
        .map_err(|_| format_err("invalid field size in envelope"))
}

fn read_hashed<R: Read>(inner: &mut R, hasher: &mut Sha3_512, buf: &mut [u8]) -> Result<(), BlobError> {
    inner.read_exact(buf)?;
    hasher.update(&buf[..]);
    Ok(())
}

fn read_u32<R: Read>(inner: &mut R) -> Result<u32, BlobError> {
    let mut bytes = [0u8; 4];
    inner.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_json_hashed<R: Read, T: for<'de> Deserialize<'de>>(
    inner: &mut R,
    hasher: &mut Sha3_512,
) -> Result<T, BlobError> {
    let mut len_bytes = [0u8; 4];
    read_hashed(inner, hasher, &mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_JSON_LEN {
        return Err(format_err("oversized envelope block"));
    }
    let mut json = vec![0u8; len as usize];
    read_hashed(inner, hasher, &mut json)?;
    serde_json::from_slice(&json).map_err(|e| format_err(format!("invalid envelope JSON: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn keyring_pair() -> (Keyring, Keyring) {
        let a = PrivateKey::generate().unwrap();
        let b = PrivateKey::generate().unwrap();
        let publics = vec![a.public(), b.public()];
        let ring_a = Keyring {
            public: publics.clone(),
            private: a,
        };
        let ring_b = Keyring {
            public: publics,
            private: b,
        };
        (ring_a, ring_b)
    }

    fn seal(keyring: &Keyring, payload: &[u8], encrypted: bool) -> Vec<u8> {
        let mut writer = BlobWriter::create(Cursor::new(Vec::new()), keyring, encrypted).unwrap();
        writer.write_all(payload).unwrap();
        writer.sign().unwrap().into_inner()
    }

    fn unseal(keyring: &Keyring, artifact: &[u8], encrypted: bool) -> Result<Vec<u8>, BlobError> {
        let mut reader = BlobReader::open(Cursor::new(artifact.to_vec()), keyring, encrypted)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn signed_round_trip() {
        let (ring_a, ring_b) = keyring_pair();
        let payload = b"git bundle payload".repeat(1000);

        let artifact = seal(&ring_a, &payload, false);
        let reader = BlobReader::open(Cursor::new(artifact.clone()), &ring_b, false).unwrap();
        assert_eq!(reader.signer, ring_a.private.public().fingerprint());
        assert!(!reader.metadata.encrypted);
        assert!(reader.metadata.keys.is_empty());

        assert_eq!(unseal(&ring_b, &artifact, false).unwrap(), payload);
    }

    #[test]
    fn encrypted_round_trip_for_second_recipient() {
        let (ring_a, ring_b) = keyring_pair();
        // Spans several chunks.
        let payload = vec![0xa5u8; 3 * CHUNK_SIZE + 17];

        let artifact = seal(&ring_a, &payload, true);
        let reader = BlobReader::open(Cursor::new(artifact.clone()), &ring_b, true).unwrap();
        assert!(reader.metadata.encrypted);
        assert_eq!(reader.metadata.keys.len(), 2);
        assert_eq!(reader.metadata.size, payload.len() as u64);

        assert_eq!(unseal(&ring_b, &artifact, true).unwrap(), payload);
    }

    #[test]
    fn metadata_hashes_match_independent_digests() {
        let (ring_a, _) = keyring_pair();
        let payload = b"known payload";

        let artifact = seal(&ring_a, payload, false);
        let reader = BlobReader::open(Cursor::new(artifact), &ring_a, false).unwrap();

        assert_eq!(
            reader.metadata.hashes.sha256,
            hex::encode(Sha256::digest(payload))
        );
        assert_eq!(
            reader.metadata.hashes.sha3_512,
            hex::encode(Sha3_512::digest(payload))
        );
        assert_eq!(
            reader.metadata.hashes.blake2b_512,
            hex::encode(<blake2::Blake2b512 as Digest>::digest(payload))
        );
    }

    #[test]
    fn empty_payload_round_trips() {
        let (ring_a, _) = keyring_pair();
        let artifact = seal(&ring_a, b"", false);
        assert_eq!(unseal(&ring_a, &artifact, false).unwrap(), b"");
    }

    #[test]
    fn corrupt_signature_is_rejected() {
        let (ring_a, _) = keyring_pair();
        let mut artifact = seal(&ring_a, b"payload bytes", true);

        *artifact.last_mut().unwrap() ^= 0xff;
        let err = BlobReader::open(Cursor::new(artifact), &ring_a, true).unwrap_err();
        assert!(matches!(err, BlobError::Signature));
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let (ring_a, _) = keyring_pair();
        let payload = vec![0x42u8; CHUNK_SIZE];
        let mut artifact = seal(&ring_a, &payload, true);

        // Flip a byte well inside the first payload frame: past the header,
        // far from the trailing metadata and signature.
        artifact[2048] ^= 0xff;
        let err = BlobReader::open(Cursor::new(artifact), &ring_a, true).unwrap_err();
        assert!(matches!(err, BlobError::Signature));
    }

    #[test]
    fn unknown_signer_is_rejected() {
        let (ring_a, _) = keyring_pair();
        let artifact = seal(&ring_a, b"payload", false);

        let stranger = PrivateKey::generate().unwrap();
        let ring = Keyring {
            public: vec![stranger.public()],
            private: stranger,
        };
        let err = BlobReader::open(Cursor::new(artifact), &ring, false).unwrap_err();
        assert!(matches!(err, BlobError::Signature));
    }

    #[test]
    fn encrypted_flag_mismatch_fails_both_directions() {
        let (ring_a, _) = keyring_pair();

        let plain = seal(&ring_a, b"payload", false);
        let err = BlobReader::open(Cursor::new(plain), &ring_a, true).unwrap_err();
        assert!(matches!(err, BlobError::UnexpectedlyPlaintext));

        let sealed = seal(&ring_a, b"payload", true);
        let err = BlobReader::open(Cursor::new(sealed), &ring_a, false).unwrap_err();
        assert!(matches!(err, BlobError::UnexpectedlyEncrypted));
    }

    #[test]
    fn non_recipient_cannot_decrypt() {
        let (ring_a, _) = keyring_pair();
        let artifact = seal(&ring_a, b"payload", true);

        // Recognizes the signer, but holds a private key that is not among
        // the recipients.
        let outsider = PrivateKey::generate().unwrap();
        let ring = Keyring {
            public: ring_a.public.clone(),
            private: outsider,
        };
        let err = BlobReader::open(Cursor::new(artifact), &ring, true).unwrap_err();
        assert!(matches!(err, BlobError::NotARecipient));
    }

    #[test]
    fn truncated_artifact_is_malformed() {
        let (ring_a, _) = keyring_pair();
        let artifact = seal(&ring_a, b"payload", false);
        let truncated = &artifact[..artifact.len() - 10];
        assert!(BlobReader::open(Cursor::new(truncated.to_vec()), &ring_a, false).is_err());
    }
}

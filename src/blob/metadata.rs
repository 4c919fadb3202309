//! Signed envelope metadata.
//!
//! The metadata block travels inside the signed region of the artifact, so
//! every field here is authenticated by the envelope signature.

use serde::{Deserialize, Serialize};

/// Plaintext digests carried in the envelope.
///
/// All three are computed over the plaintext payload, not the ciphertext,
/// and are re-checked when the payload is streamed out of a verified
/// envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    pub sha256: String,
    pub sha3_512: String,
    pub blake2b_512: String,
}

/// Envelope metadata: what the artifact contains and who may read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Envelope format version.
    pub version: u8,
    /// Whether the payload is encrypted.
    pub encrypted: bool,
    /// Plaintext payload size in bytes.
    pub size: u64,
    /// Plaintext digests.
    pub hashes: Hashes,
    /// Fingerprints of the recipient keys (empty when unencrypted).
    pub keys: Vec<String>,
}

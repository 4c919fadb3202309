//! Ed25519 key material for the bundle envelope.
//!
//! Keys are stored as PEM files whose paths are named in git config
//! (`bundle.pubKeys`, `bundle.privKey`).  The same Ed25519 keypair is used
//! for signing and, after conversion to X25519, for the recipient key wrap
//! of encrypted envelopes.

use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::config;

/// Size of an Ed25519 key (public or private) in bytes.
pub const KEY_SIZE: usize = 32;

const PUBLIC_TAG: &str = "PUBLIC KEY";
const PRIVATE_TAG: &str = "PRIVATE KEY";

// ---------------------------------------------------------------------------
// Public key
// ---------------------------------------------------------------------------

/// An authorized signer (and encryption recipient) public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Result<Self> {
        let key = VerifyingKey::from_bytes(bytes).context("invalid Ed25519 public key")?;
        Ok(PublicKey(key))
    }

    /// Read a PEM-encoded public key from `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read public key: {}", path.display()))?;
        let pem = pem::parse(&contents)
            .with_context(|| format!("malformed PEM in {}", path.display()))?;
        anyhow::ensure!(
            pem.tag() == PUBLIC_TAG,
            "{}: expected {} PEM tag, got {}",
            path.display(),
            PUBLIC_TAG,
            pem.tag(),
        );
        let bytes: &[u8; KEY_SIZE] = pem
            .contents()
            .try_into()
            .map_err(|_| anyhow::anyhow!("{}: invalid public key size", path.display()))?;
        Self::from_bytes(bytes)
    }

    /// Write the key as PEM to `path`.  The file must not already exist.
    pub fn write(&self, path: &Path) -> Result<()> {
        let pem = pem::Pem::new(PUBLIC_TAG, self.to_bytes().to_vec());
        write_new(path, pem::encode(&pem).as_bytes(), 0o644)
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Hex fingerprint used as the key identity in metadata and log output.
    pub fn fingerprint(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Verify an Ed25519 signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(msg, signature).is_ok()
    }

    /// Convert to an X25519 public key for the ECDH key wrap.
    ///
    /// Ed25519 points live on the Edwards curve; the wrap uses the Montgomery
    /// form, so the point is decompressed and mapped over.
    pub(crate) fn to_x25519(&self) -> Result<X25519PublicKey> {
        let edwards = CompressedEdwardsY::from_slice(&self.to_bytes())
            .map_err(|_| anyhow::anyhow!("invalid edwards point"))?
            .decompress()
            .context("failed to decompress edwards point")?;
        Ok(X25519PublicKey::from(edwards.to_montgomery().to_bytes()))
    }
}

// ---------------------------------------------------------------------------
// Private key
// ---------------------------------------------------------------------------

/// The local user's private key, used for signing and decryption.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Generate a new keypair from the system RNG.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| anyhow::anyhow!("system RNG failure: {e}"))?;
        Ok(PrivateKey(SigningKey::from_bytes(&bytes)))
    }

    /// Read a PEM-encoded private key from `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read private key: {}", path.display()))?;
        let pem = pem::parse(&contents)
            .with_context(|| format!("malformed PEM in {}", path.display()))?;
        anyhow::ensure!(
            pem.tag() == PRIVATE_TAG,
            "{}: expected {} PEM tag, got {}",
            path.display(),
            PRIVATE_TAG,
            pem.tag(),
        );
        let bytes: &[u8; KEY_SIZE] = pem
            .contents()
            .try_into()
            .map_err(|_| anyhow::anyhow!("{}: invalid private key size", path.display()))?;
        Ok(PrivateKey(SigningKey::from_bytes(bytes)))
    }

    /// Write the key as PEM to `path` with mode 0600.  The file must not
    /// already exist.
    pub fn write(&self, path: &Path) -> Result<()> {
        let pem = pem::Pem::new(PRIVATE_TAG, self.0.to_bytes().to_vec());
        write_new(path, pem::encode(&pem).as_bytes(), 0o600)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        self.0.sign(msg)
    }

    /// Convert to an X25519 static secret for the ECDH key wrap.
    ///
    /// Ed25519 derives its signing scalar from the seed per RFC 8032: the
    /// low 32 bytes of SHA-512(seed), clamped.  Using that scalar as the
    /// X25519 secret makes it agree with the Edwards-to-Montgomery mapping
    /// in [`PublicKey::to_x25519`].
    pub(crate) fn to_x25519(&self) -> StaticSecret {
        let digest = Sha512::digest(self.0.to_bytes());
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&digest[..32]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;
        StaticSecret::from(scalar)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "PrivateKey({})", self.public().fingerprint())
    }
}

fn write_new(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    use std::io::Write;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(data)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

/// The set of authorized signer public keys plus this user's private key.
///
/// Loaded once at process start and held immutably for the lifetime of the
/// transaction; no key material crosses the dialogue loop.
#[derive(Debug, Clone)]
pub struct Keyring {
    pub public: Vec<PublicKey>,
    pub private: PrivateKey,
}

impl Keyring {
    /// Load the keyring from the `bundle.pubKeys` / `bundle.privKey` git
    /// config paths.
    pub async fn load() -> Result<Self> {
        let pub_paths = config::pub_key_paths().await?;
        anyhow::ensure!(
            !pub_paths.is_empty(),
            "no public keys configured (bundle.pubKeys)"
        );

        let mut public = Vec::with_capacity(pub_paths.len());
        for path in &pub_paths {
            public.push(PublicKey::read(path)?);
        }

        let priv_path = config::priv_key_path()
            .await?
            .context("no private key configured (bundle.privKey)")?;
        let private = PrivateKey::read(&priv_path)?;

        Ok(Keyring { public, private })
    }

    /// Look up an authorized public key by fingerprint.
    pub fn public_by_fingerprint(&self, fingerprint: &str) -> Option<&PublicKey> {
        self.public.iter().find(|k| k.fingerprint() == fingerprint)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let key = PrivateKey::generate().unwrap();

        let priv_path = tmp.path().join("id.priv");
        let pub_path = tmp.path().join("id.pub");
        key.write(&priv_path).unwrap();
        key.public().write(&pub_path).unwrap();

        let recovered = PrivateKey::read(&priv_path).unwrap();
        assert_eq!(recovered.0.to_bytes(), key.0.to_bytes());

        let recovered_pub = PublicKey::read(&pub_path).unwrap();
        assert_eq!(recovered_pub, key.public());
    }

    #[test]
    fn private_key_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("id.priv");
        PrivateKey::generate().unwrap().write(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn write_refuses_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("id.priv");
        std::fs::write(&path, "occupied").unwrap();

        let key = PrivateKey::generate().unwrap();
        assert!(key.write(&path).is_err());
    }

    #[test]
    fn sign_and_verify() {
        let key = PrivateKey::generate().unwrap();
        let public = key.public();
        let msg = b"some artifact digest";

        let sig = key.sign(msg);
        assert!(public.verify(msg, &sig));
        assert!(!public.verify(b"other digest", &sig));

        let other = PrivateKey::generate().unwrap().public();
        assert!(!other.verify(msg, &sig));
    }

    #[test]
    fn x25519_agreement() {
        // The Edwards->Montgomery conversion must land both sides on the
        // same shared secret.
        let a = PrivateKey::generate().unwrap();
        let b = PrivateKey::generate().unwrap();

        let ab = a.to_x25519().diffie_hellman(&b.public().to_x25519().unwrap());
        let ba = b.to_x25519().diffie_hellman(&a.public().to_x25519().unwrap());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn fingerprint_is_hex_of_key() {
        let key = PrivateKey::generate().unwrap().public();
        let fpr = key.fingerprint();
        assert_eq!(fpr.len(), KEY_SIZE * 2);
        assert_eq!(hex::decode(&fpr).unwrap(), key.to_bytes().to_vec());
    }
}

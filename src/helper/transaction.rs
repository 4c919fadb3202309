//! The pull/push transaction against the remote artifact.
//!
//! Both services share the same front half: download the artifact into the
//! local cache, verify the envelope, materialize a bare mirror clone in a
//! transaction-scoped temp directory, and only then ack the parent git with
//! a blank line and hand the repo to the pack server.  The push service adds
//! the tail: diff the ref snapshots, rebundle, seal and upload.
//!
//! The [`tempfile::TempDir`] guard owns every temporary path, so the scratch
//! state is removed on all exit paths.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::blob::keys::Keyring;
use crate::blob::{BlobReader, BlobWriter};
use crate::cache;
use crate::config;
use crate::git::clone::clone_bundle;
use crate::git::commands;
use crate::transport::{self, Transport, TransportError};

/// The materialized working state for one `connect` service.
struct Working {
    /// Owns the scratch directory; dropped (and removed) when the
    /// transaction ends, successfully or not.
    tmp: tempfile::TempDir,
    repo: PathBuf,
    cache_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// `connect git-upload-pack`: the remote must exist.
pub async fn fetch(uri: &Url, keyring: &Keyring, cache_root: &Path) -> Result<()> {
    let transport = transport::connect(uri)?;
    let working = materialize(uri, keyring, cache_root, transport.as_ref(), false).await?;

    ack().await?;
    commands::serve_pack("upload-pack", &working.repo).await
}

/// `connect git-receive-pack`: a missing remote becomes an empty repo, and
/// the accepted push is rebundled, sealed and uploaded -- unless it changed
/// nothing.
pub async fn push(uri: &Url, keyring: &Keyring, cache_root: &Path) -> Result<()> {
    let transport = transport::connect(uri)?;
    let working = materialize(uri, keyring, cache_root, transport.as_ref(), true).await?;

    ack().await?;

    // A repo with no refs makes show-ref exit non-zero; that is the empty
    // snapshot, not an error.
    let old_refs = match commands::show_ref(&working.repo).await {
        Ok(raw) => commands::sorted_refs(&raw),
        Err(_) => Vec::new(),
    };

    commands::serve_pack("receive-pack", &working.repo).await?;

    let new_refs = commands::sorted_refs(&commands::show_ref(&working.repo).await?);
    if old_refs == new_refs {
        info!("nothing new to upload");
        return Ok(());
    }

    let plaintext = working.tmp.path().join("plaintext");
    commands::bundle_create(&working.repo, &plaintext).await?;

    let encrypted = config::encrypt().await;
    seal_into_cache(&working.cache_path, &plaintext, keyring, encrypted).await?;

    info!(%uri, "uploading bundle");
    transport.upload(&working.cache_path).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared front half
// ---------------------------------------------------------------------------

/// Download, verify and clone the remote artifact, or (for push only)
/// initialize an empty bare repo when the remote does not exist.
async fn materialize(
    uri: &Url,
    keyring: &Keyring,
    cache_root: &Path,
    transport: &dyn Transport,
    allow_missing: bool,
) -> Result<Working> {
    let (cache_path, mut cache_file) = cache::open_entry(cache_root, uri).await?;
    let tmp = tempfile::tempdir().context("failed to create transaction directory")?;
    let repo = tmp.path().join("repo");

    let missing = if transport.exists().await? {
        match transport.download(&mut cache_file).await {
            Ok(()) => false,
            // The artifact vanished between the probe and the download.
            Err(TransportError::NotFound) => true,
            Err(err) => return Err(err.into()),
        }
    } else {
        true
    };

    if missing {
        if !allow_missing {
            bail!("remote artifact does not exist: {uri}");
        }
        debug!(repo = %repo.display(), "initializing empty bare repo");
        commands::init_bare(&repo).await?;
        return Ok(Working {
            tmp,
            repo,
            cache_path,
        });
    }

    cache_file.sync_all().await?;
    drop(cache_file);

    let encrypted = config::encrypt().await;
    let bundle_path = tmp.path().join("bundle");
    let (signer, metadata) =
        verify_into(&cache_path, &bundle_path, keyring, encrypted).await?;

    info!("{}: signed by: {}", cache_path.display(), signer);
    info!("{}: sha2-256: {}", cache_path.display(), metadata.hashes.sha256);
    info!("{}: sha3-512: {}", cache_path.display(), metadata.hashes.sha3_512);
    info!(
        "{}: blake2b-512: {}",
        cache_path.display(),
        metadata.hashes.blake2b_512
    );

    let verify_signatures = config::verify_merge_signatures().await?;
    clone_bundle(&bundle_path, &repo, verify_signatures).await?;

    Ok(Working {
        tmp,
        repo,
        cache_path,
    })
}

/// Verify the envelope in the cache file and stream the verified plaintext
/// to `bundle_path`.  The plaintext copy is written only from an
/// already-verified reader, so a verification failure never touches it.
async fn verify_into(
    cache_path: &Path,
    bundle_path: &Path,
    keyring: &Keyring,
    encrypted: bool,
) -> Result<(String, crate::blob::metadata::Metadata)> {
    let cache_path = cache_path.to_path_buf();
    let bundle_path = bundle_path.to_path_buf();
    let keyring = keyring.clone();

    tokio::task::spawn_blocking(move || -> Result<(String, crate::blob::metadata::Metadata)> {
        let artifact = std::fs::File::open(&cache_path)
            .with_context(|| format!("failed to open {}", cache_path.display()))?;
        let mut reader = BlobReader::open(artifact, &keyring, encrypted)?;

        let mut bundle = std::fs::File::create(&bundle_path)
            .with_context(|| format!("failed to create {}", bundle_path.display()))?;
        std::io::copy(&mut reader, &mut bundle).context("failed to extract bundle")?;
        bundle.sync_all()?;

        Ok((reader.signer.clone(), reader.metadata.clone()))
    })
    .await
    .context("verification task panicked")?
}

/// Seal the plaintext bundle into the cache file (truncating it) and sync.
async fn seal_into_cache(
    cache_path: &Path,
    plaintext: &Path,
    keyring: &Keyring,
    encrypted: bool,
) -> Result<()> {
    let cache_path = cache_path.to_path_buf();
    let plaintext = plaintext.to_path_buf();
    let keyring = keyring.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&cache_path)
            .with_context(|| format!("failed to open {}", cache_path.display()))?;
        file.set_len(0)?;

        let mut writer = BlobWriter::create(file, &keyring, encrypted)?;
        let mut src = std::fs::File::open(&plaintext)
            .with_context(|| format!("failed to open {}", plaintext.display()))?;
        std::io::copy(&mut src, &mut writer).context("failed to seal bundle")?;

        let file = writer.sign()?;
        file.sync_all()?;
        Ok(())
    })
    .await
    .context("seal task panicked")?
}

/// The blank-line ack: emitted only after verification and materialization
/// succeed, and before the pack server takes over the byte stream.
async fn ack() -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::keys::PrivateKey;

    fn test_keyring() -> Keyring {
        let key = PrivateKey::generate().unwrap();
        Keyring {
            public: vec![key.public()],
            private: key,
        }
    }

    #[tokio::test]
    async fn seal_then_verify_round_trips_through_cache_file() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = test_keyring();

        let plaintext = tmp.path().join("plaintext");
        tokio::fs::write(&plaintext, b"fake bundle bytes").await.unwrap();

        let cache = tmp.path().join("repo.bundle");
        tokio::fs::write(&cache, b"stale previous artifact that is longer")
            .await
            .unwrap();

        seal_into_cache(&cache, &plaintext, &keyring, true).await.unwrap();

        let extracted = tmp.path().join("extracted");
        let (signer, metadata) = verify_into(&cache, &extracted, &keyring, true).await.unwrap();

        assert_eq!(signer, keyring.private.public().fingerprint());
        assert!(metadata.encrypted);
        assert_eq!(
            tokio::fs::read(&extracted).await.unwrap(),
            b"fake bundle bytes"
        );
    }

    #[tokio::test]
    async fn failed_verification_leaves_no_plaintext_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = test_keyring();

        let cache = tmp.path().join("repo.bundle");
        tokio::fs::write(&cache, b"garbage that is not an envelope").await.unwrap();

        let extracted = tmp.path().join("extracted");
        let err = verify_into(&cache, &extracted, &keyring, true).await;
        assert!(err.is_err());
        assert!(!extracted.exists());
    }

    #[tokio::test]
    async fn encrypt_flag_mismatch_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = test_keyring();

        let plaintext = tmp.path().join("plaintext");
        tokio::fs::write(&plaintext, b"bundle").await.unwrap();
        let cache = tmp.path().join("repo.bundle");
        tokio::fs::write(&cache, b"").await.unwrap();

        seal_into_cache(&cache, &plaintext, &keyring, false).await.unwrap();

        let extracted = tmp.path().join("extracted");
        assert!(verify_into(&cache, &extracted, &keyring, true).await.is_err());
    }
}

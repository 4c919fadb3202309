//! Ancillary subcommands.
//!
//! Thin wrappers over the blob envelope: none of these touch the remote
//! helper state machine.  Each verb that reads or writes user files runs
//! inside the sandbox with its input mounted read-only and its output
//! pre-created and writable.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use tracing::{info, warn};

use crate::blob::keys::{Keyring, PrivateKey};
use crate::blob::metadata::Metadata;
use crate::blob::{BlobError, BlobReader, BlobWriter};
use crate::sandbox::{self, RwTarget};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a keypair
    Genkey {
        /// Write the generated keypair to <output>.pub and <output>.priv
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Sign a bundle
    Sign {
        /// Input file to sign
        #[arg(short, long)]
        input: PathBuf,
        /// Output file for the signed blob
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Verify a bundle
    Verify {
        /// File to verify
        #[arg(short, long)]
        input: PathBuf,
        /// Output file for the verified blob
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Encrypt and sign a bundle
    Encrypt {
        /// Input file to encrypt
        #[arg(short, long)]
        input: PathBuf,
        /// Output file for the encrypted blob
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Verify and decrypt a bundle
    Decrypt {
        /// File to decrypt
        #[arg(short, long)]
        input: PathBuf,
        /// Output file for the decrypted blob
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Encrypt and sign a bundle
    Seal {
        /// Input file to seal
        #[arg(short, long)]
        input: PathBuf,
        /// Output file for the sealed blob
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Verify and decrypt a bundle
    Unseal {
        /// File to unseal
        #[arg(short, long)]
        input: PathBuf,
        /// Output file for the unsealed blob
        #[arg(short, long)]
        output: PathBuf,
        /// Required if the archive is signed but not encrypted
        #[arg(short, long)]
        signed_only: bool,
    },
    /// Show the metadata for a signed and optionally encrypted bundle
    #[command(hide = true)]
    Metadata {
        /// File to inspect
        #[arg(short, long)]
        input: PathBuf,
        /// Output file for the metadata
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Required if the archive is signed but not encrypted
        #[arg(short, long)]
        signed_only: bool,
    },
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn run(command: Command) -> Result<()> {
    match command {
        Command::Genkey { output } => genkey(&output).await,
        Command::Sign { input, output } => {
            enter_sandbox(&input, Some(output.as_path())).await?;
            let keyring = Keyring::load().await?;
            seal_file(&input, &output, &keyring, false).await?;
            info!("successfully wrote signed blob to {}", output.display());
            Ok(())
        }
        Command::Encrypt { input, output } => {
            enter_sandbox(&input, Some(output.as_path())).await?;
            let keyring = Keyring::load().await?;
            seal_file(&input, &output, &keyring, true).await?;
            info!(
                "successfully wrote signed and encrypted blob to {}",
                output.display()
            );
            Ok(())
        }
        Command::Seal { input, output } => {
            enter_sandbox(&input, Some(output.as_path())).await?;
            let keyring = Keyring::load().await?;
            seal_file(&input, &output, &keyring, true).await?;
            info!("successfully wrote sealed blob to {}", output.display());
            Ok(())
        }
        Command::Decrypt { input, output } => {
            enter_sandbox(&input, Some(output.as_path())).await?;
            let keyring = Keyring::load().await?;
            unseal_file(&input, Some(output.as_path()), &keyring, true).await?;
            info!(
                "successfully verified and decrypted {} to {}",
                input.display(),
                output.display()
            );
            Ok(())
        }
        Command::Unseal {
            input,
            output,
            signed_only,
        } => {
            enter_sandbox(&input, Some(output.as_path())).await?;
            let keyring = Keyring::load().await?;
            let (signer, meta) =
                unseal_file(&input, Some(output.as_path()), &keyring, !signed_only).await?;
            info!("signed by: {signer}");
            info!("sha2-256: {}", meta.hashes.sha256);
            info!("sha3-512: {}", meta.hashes.sha3_512);
            info!("blake2b-512: {}", meta.hashes.blake2b_512);
            info!("successfully wrote unsealed blob to {}", output.display());
            Ok(())
        }
        Command::Verify { input, output } => verify(&input, output.as_deref()).await,
        Command::Metadata {
            input,
            output,
            signed_only,
        } => metadata(&input, output.as_deref(), signed_only).await,
    }
}

// ---------------------------------------------------------------------------
// Verbs
// ---------------------------------------------------------------------------

async fn genkey(output: &Path) -> Result<()> {
    let pub_path = with_suffix(output, ".pub");
    let priv_path = with_suffix(output, ".priv");

    let key = PrivateKey::generate()?;
    key.public().write(&pub_path)?;
    key.write(&priv_path)?;

    info!(
        "successfully wrote {} to {} and {}",
        key.public().fingerprint(),
        pub_path.display(),
        priv_path.display()
    );
    Ok(())
}

async fn verify(input: &Path, output: Option<&Path>) -> Result<()> {
    enter_sandbox(input, output).await?;
    let keyring = Keyring::load().await?;

    // The artifact may be either encrypted or merely signed; accept both,
    // but nag about the latter.
    let result = unseal_file(input, output, &keyring, true).await;
    let encrypted = match result {
        Ok(_) => true,
        Err(err) if is_unexpectedly_plaintext(&err) => {
            unseal_file(input, output, &keyring, false).await?;
            false
        }
        Err(err) => return Err(err),
    };

    if !encrypted {
        warn!("be aware that {} is unencrypted", input.display());
    }
    match output {
        Some(out) => info!(
            "successfully verified {} and wrote the verified data to {}",
            input.display(),
            out.display()
        ),
        None => info!("successfully verified {}", input.display()),
    }
    Ok(())
}

async fn metadata(input: &Path, output: Option<&Path>, signed_only: bool) -> Result<()> {
    enter_sandbox(input, output).await?;
    let keyring = Keyring::load().await?;

    let (_, meta) = unseal_file(input, None, &keyring, !signed_only).await?;
    let mut json = serde_json::to_string_pretty(&meta)?;
    json.push('\n');

    info!("{json}");
    if let Some(out) = output {
        std::fs::write(out, &json)
            .with_context(|| format!("failed to write {}", out.display()))?;
        info!("successfully wrote metadata to {}", out.display());
    }
    Ok(())
}

fn is_unexpectedly_plaintext(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BlobError>(),
        Some(BlobError::UnexpectedlyPlaintext)
    )
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// Flag validation plus sandbox entry.  Inputs must exist; outputs must not
/// pre-exist (checked in the outer process only, since the sandbox planner
/// pre-creates them as bind-mount targets).
async fn enter_sandbox(input: &Path, output: Option<&Path>) -> Result<()> {
    anyhow::ensure!(input.exists(), "input does not exist: {}", input.display());

    let mut outputs = Vec::new();
    if let Some(out) = output {
        if std::env::var_os(sandbox::SANDBOX_ENV).is_none() && out.exists() {
            bail!("output already exists: {}", out.display());
        }
        outputs.push(RwTarget {
            path: out.to_path_buf(),
            dir: false,
        });
    }

    sandbox::confine_cli(&[input.to_path_buf()], &outputs).await
}

/// Seal `input` into a fresh envelope at `output`.
async fn seal_file(
    input: &Path,
    output: &Path,
    keyring: &Keyring,
    encrypted: bool,
) -> Result<()> {
    let input = input.to_path_buf();
    let output = output.to_path_buf();
    let keyring = keyring.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut src = std::fs::File::open(&input)
            .with_context(|| format!("failed to open {}", input.display()))?;
        let out = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&output)
            .with_context(|| format!("failed to create {}", output.display()))?;

        let mut writer = BlobWriter::create(out, &keyring, encrypted)?;
        std::io::copy(&mut src, &mut writer)?;
        writer.sign()?.sync_all()?;
        Ok(())
    })
    .await
    .context("seal task panicked")?
}

/// Verify `input` and optionally stream the plaintext to `output`.  With no
/// output the payload is still fully read so the digest checks run.
async fn unseal_file(
    input: &Path,
    output: Option<&Path>,
    keyring: &Keyring,
    encrypted: bool,
) -> Result<(String, Metadata)> {
    let input = input.to_path_buf();
    let output = output.map(Path::to_path_buf);
    let keyring = keyring.clone();

    tokio::task::spawn_blocking(move || -> Result<(String, Metadata)> {
        let artifact = std::fs::File::open(&input)
            .with_context(|| format!("failed to open {}", input.display()))?;
        let mut reader = BlobReader::open(artifact, &keyring, encrypted)?;

        match &output {
            Some(out) => {
                let mut dest = std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(out)
                    .with_context(|| format!("failed to create {}", out.display()))?;
                std::io::copy(&mut reader, &mut dest)?;
                dest.sync_all()?;
            }
            None => {
                let mut sink = std::io::sink();
                std::io::copy(&mut reader, &mut sink)?;
            }
        }

        Ok((reader.signer.clone(), reader.metadata.clone()))
    })
    .await
    .context("unseal task panicked")?
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyring() -> Keyring {
        let key = PrivateKey::generate().unwrap();
        Keyring {
            public: vec![key.public()],
            private: key,
        }
    }

    #[test]
    fn with_suffix_appends_to_basename() {
        assert_eq!(
            with_suffix(Path::new("/keys/id"), ".pub"),
            PathBuf::from("/keys/id.pub")
        );
        assert_eq!(
            with_suffix(Path::new("id.key"), ".priv"),
            PathBuf::from("id.key.priv")
        );
    }

    #[tokio::test]
    async fn seal_and_unseal_files_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = test_keyring();

        let input = tmp.path().join("bundle");
        std::fs::write(&input, b"bundle contents").unwrap();

        let sealed = tmp.path().join("bundle.sealed");
        seal_file(&input, &sealed, &keyring, true).await.unwrap();

        let out = tmp.path().join("bundle.out");
        let (signer, meta) = unseal_file(&sealed, Some(out.as_path()), &keyring, true)
            .await
            .unwrap();
        assert_eq!(signer, keyring.private.public().fingerprint());
        assert!(meta.encrypted);
        assert_eq!(std::fs::read(&out).unwrap(), b"bundle contents");
    }

    #[tokio::test]
    async fn unseal_without_output_still_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = test_keyring();

        let input = tmp.path().join("bundle");
        std::fs::write(&input, b"payload").unwrap();
        let sealed = tmp.path().join("sealed");
        seal_file(&input, &sealed, &keyring, false).await.unwrap();

        let (_, meta) = unseal_file(&sealed, None, &keyring, false).await.unwrap();
        assert!(!meta.encrypted);
        assert_eq!(meta.size, 7);
    }
}

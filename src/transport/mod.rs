//! Remote storage backends.
//!
//! A [`Transport`] moves the opaque artifact between the remote location and
//! a local file.  Three schemes are supported: `file`, `ssh` and `http(s)`.
//! Callers must be able to tell "the artifact does not exist" apart from
//! every other failure, so that a push against a fresh remote can fall back
//! to an empty repository.

pub mod file;
pub mod http;
pub mod ssh;

use std::path::Path;

use anyhow::Result;
use url::Url;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("remote artifact not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Other(err.into())
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the remote artifact location.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Probe whether the remote artifact exists.
    async fn exists(&self) -> Result<bool, TransportError>;

    /// Replace the contents of `dest` with the remote artifact.
    /// Fails with [`TransportError::NotFound`] when the artifact is absent.
    async fn download(&self, dest: &mut tokio::fs::File) -> Result<(), TransportError>;

    /// Upload the local file at `src`, replacing the remote artifact
    /// atomically where the backend allows it.
    async fn upload(&self, src: &Path) -> Result<(), TransportError>;
}

/// Pick the backend for `uri` by scheme.
pub fn connect(uri: &Url) -> Result<Box<dyn Transport>> {
    match uri.scheme() {
        "file" => Ok(Box::new(file::FileTransport::new(uri)?)),
        "ssh" => Ok(Box::new(ssh::SshTransport::new(uri)?)),
        "http" | "https" => Ok(Box::new(http::HttpTransport::new(uri)?)),
        other => anyhow::bail!("unsupported URL scheme: {other}"),
    }
}

/// Rewind and truncate `dest` before a download writes into it.
pub(crate) async fn truncate(dest: &mut tokio::fs::File) -> Result<(), TransportError> {
    use tokio::io::AsyncSeekExt;

    dest.seek(std::io::SeekFrom::Start(0)).await?;
    dest.set_len(0).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_dispatches_on_scheme() {
        assert!(connect(&Url::parse("file:///tmp/x.bundle").unwrap()).is_ok());
        assert!(connect(&Url::parse("ssh://host/srv/x.bundle").unwrap()).is_ok());
        assert!(connect(&Url::parse("https://host/x.bundle").unwrap()).is_ok());
        assert!(connect(&Url::parse("ftp://host/x.bundle").unwrap()).is_err());
    }
}

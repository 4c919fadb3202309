//! Local filesystem backend for `file://` remotes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};
use url::Url;

use super::{Transport, TransportError};

pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    pub fn new(uri: &Url) -> Result<Self> {
        let path = uri
            .to_file_path()
            .map_err(|()| anyhow::anyhow!("invalid file URL: {uri}"))?;
        Ok(FileTransport { path })
    }
}

#[async_trait::async_trait]
impl Transport for FileTransport {
    async fn exists(&self) -> Result<bool, TransportError> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    #[instrument(skip(self, dest), fields(path = %self.path.display()))]
    async fn download(&self, dest: &mut tokio::fs::File) -> Result<(), TransportError> {
        let mut src = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransportError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };

        super::truncate(dest).await?;
        let bytes = tokio::io::copy(&mut src, dest).await?;
        debug!(bytes, "artifact downloaded");
        Ok(())
    }

    /// Copy to a sibling temp file and rename into place; on the same
    /// filesystem the rename is atomic.
    #[instrument(skip(self, src), fields(path = %self.path.display()))]
    async fn upload(&self, src: &Path) -> Result<(), TransportError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))
                .map_err(TransportError::Other)?;
        }

        let staging = staging_path(&self.path);
        tokio::fs::copy(src, &staging)
            .await
            .with_context(|| format!("failed to stage upload at {}", staging.display()))
            .map_err(TransportError::Other)?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))
            .map_err(TransportError::Other)?;

        debug!("artifact uploaded");
        Ok(())
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    target.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn transport_for(path: &Path) -> FileTransport {
        let uri = Url::from_file_path(path).unwrap();
        FileTransport::new(&uri).unwrap()
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = transport_for(&tmp.path().join("missing.bundle"));

        assert!(!transport.exists().await.unwrap());

        let mut dest = tokio::fs::File::create(tmp.path().join("dest")).await.unwrap();
        let err = transport.download(&mut dest).await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound));
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("repo.bundle");
        let transport = transport_for(&remote);

        let src = tmp.path().join("src");
        tokio::fs::write(&src, b"artifact bytes").await.unwrap();
        transport.upload(&src).await.unwrap();
        assert!(transport.exists().await.unwrap());

        let dest_path = tmp.path().join("dest");
        // Pre-populate with longer junk to check the download truncates.
        tokio::fs::write(&dest_path, b"previous much longer contents").await.unwrap();
        let mut dest = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&dest_path)
            .await
            .unwrap();
        transport.download(&mut dest).await.unwrap();

        let mut out = Vec::new();
        let mut reopened = tokio::fs::File::open(&dest_path).await.unwrap();
        reopened.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"artifact bytes");
    }

    #[tokio::test]
    async fn upload_replaces_existing_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = tmp.path().join("repo.bundle");
        tokio::fs::write(&remote, b"old").await.unwrap();
        let transport = transport_for(&remote);

        let src = tmp.path().join("src");
        tokio::fs::write(&src, b"new contents").await.unwrap();
        transport.upload(&src).await.unwrap();

        assert_eq!(tokio::fs::read(&remote).await.unwrap(), b"new contents");
        // No staging residue left behind.
        assert!(!staging_path(&remote).exists());
    }
}

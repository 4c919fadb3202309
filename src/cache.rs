//! Local bundle cache.
//!
//! One file per remote under the cache root, named after the basename of the
//! remote path.  The file doubles as the download scratch space and as the
//! source for re-upload, so a completed push leaves the exact uploaded
//! ciphertext behind.  There is no eviction.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use url::Url;

/// Deterministic cache file path for `uri` under `cache_root`.
pub fn entry_path(cache_root: &Path, uri: &Url) -> Result<PathBuf> {
    let name = Path::new(uri.path())
        .file_name()
        .with_context(|| format!("remote URL has no path component: {uri}"))?;
    Ok(cache_root.join(name))
}

/// Ensure the cache root exists (mode 0700) and open the entry for `uri`
/// read-write, creating it with mode 0600 if missing.  Returns the path and
/// the open handle.
pub async fn open_entry(cache_root: &Path, uri: &Url) -> Result<(PathBuf, tokio::fs::File)> {
    use std::os::unix::fs::DirBuilderExt;
    use std::os::unix::fs::OpenOptionsExt;

    let path = entry_path(cache_root, uri)?;

    if !cache_root.exists() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(cache_root)
            .with_context(|| format!("failed to create cache dir: {}", cache_root.display()))?;
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("failed to open cache file: {}", path.display()))?;

    Ok((path, tokio::fs::File::from_std(file)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_path_uses_basename_of_remote_path() {
        let root = Path::new("/cache");
        let uri = Url::parse("ssh://host.example.com/srv/bundles/repo.bundle").unwrap();
        assert_eq!(
            entry_path(root, &uri).unwrap(),
            PathBuf::from("/cache/repo.bundle")
        );

        let uri = Url::parse("file:///tmp/other.bundle").unwrap();
        assert_eq!(
            entry_path(root, &uri).unwrap(),
            PathBuf::from("/cache/other.bundle")
        );
    }

    #[tokio::test]
    async fn open_entry_creates_root_and_file_with_restrictive_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("cache");
        let uri = Url::parse("file:///tmp/repo.bundle").unwrap();

        let (path, _file) = open_entry(&root, &uri).await.unwrap();
        assert_eq!(path, root.join("repo.bundle"));

        let dir_mode = std::fs::metadata(&root).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}

//! SSH backend.
//!
//! Shells out to the system `ssh` binary rather than embedding an SSH
//! client, so the user's existing config, agent and known-hosts handling
//! all apply.  `BatchMode=yes` keeps the helper non-interactive.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};
use url::Url;

use super::{Transport, TransportError};

pub struct SshTransport {
    destination: String,
    port: Option<u16>,
    path: String,
}

impl SshTransport {
    pub fn new(uri: &Url) -> Result<Self> {
        let host = uri
            .host_str()
            .with_context(|| format!("ssh URL has no host: {uri}"))?;
        let destination = if uri.username().is_empty() {
            host.to_string()
        } else {
            format!("{}@{}", uri.username(), host)
        };

        anyhow::ensure!(!uri.path().is_empty(), "ssh URL has no path: {uri}");

        Ok(SshTransport {
            destination,
            port: uri.port(),
            path: uri.path().to_string(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes");
        if let Some(port) = self.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(&self.destination);
        cmd
    }
}

#[async_trait::async_trait]
impl Transport for SshTransport {
    #[instrument(skip(self), fields(host = %self.destination, path = %self.path))]
    async fn exists(&self) -> Result<bool, TransportError> {
        let output = self
            .command()
            .arg(format!("test -e {}", quote(&self.path)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn ssh")?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(TransportError::Other(anyhow::anyhow!(
                    "ssh probe failed (status {}): {}",
                    output.status,
                    stderr.trim(),
                )))
            }
        }
    }

    #[instrument(skip(self, dest), fields(host = %self.destination, path = %self.path))]
    async fn download(&self, dest: &mut tokio::fs::File) -> Result<(), TransportError> {
        if !self.exists().await? {
            return Err(TransportError::NotFound);
        }

        let mut child = self
            .command()
            .arg(format!("cat {}", quote(&self.path)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn ssh")?;

        super::truncate(dest).await?;
        let mut stdout = child
            .stdout
            .take()
            .context("ssh stdout not captured")?;
        let bytes = tokio::io::copy(&mut stdout, dest).await?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Other(anyhow::anyhow!(
                "ssh download failed (status {}): {}",
                output.status,
                stderr.trim(),
            )));
        }

        debug!(bytes, "artifact downloaded");
        Ok(())
    }

    /// Stream the file to a remote staging path, then `mv -f` into place so
    /// readers never observe a partial artifact.
    #[instrument(skip(self, src), fields(host = %self.destination, path = %self.path))]
    async fn upload(&self, src: &Path) -> Result<(), TransportError> {
        let staging = format!("{}.tmp", self.path);
        let remote_cmd = format!(
            "cat > {staging} && mv -f {staging} {target}",
            staging = quote(&staging),
            target = quote(&self.path),
        );

        let input = std::fs::File::open(src)
            .with_context(|| format!("failed to open {}", src.display()))?;

        let output = self
            .command()
            .arg(remote_cmd)
            .stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn ssh")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Other(anyhow::anyhow!(
                "ssh upload failed (status {}): {}",
                output.status,
                stderr.trim(),
            )));
        }

        debug!("artifact uploaded");
        Ok(())
    }
}

/// Single-quote `s` for the remote shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_host_port_and_path() {
        let uri = Url::parse("ssh://deploy@bundles.example.com:2222/srv/repo.bundle").unwrap();
        let transport = SshTransport::new(&uri).unwrap();
        assert_eq!(transport.destination, "deploy@bundles.example.com");
        assert_eq!(transport.port, Some(2222));
        assert_eq!(transport.path, "/srv/repo.bundle");
    }

    #[test]
    fn parses_bare_host() {
        let uri = Url::parse("ssh://bundles.example.com/srv/repo.bundle").unwrap();
        let transport = SshTransport::new(&uri).unwrap();
        assert_eq!(transport.destination, "bundles.example.com");
        assert_eq!(transport.port, None);
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("/plain/path"), "'/plain/path'");
        assert_eq!(quote("a'b"), r"'a'\''b'");
    }
}

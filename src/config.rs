//! Configuration via `git config`.
//!
//! Every read shells out to `git config --type <t> --get[-all] <name>` and
//! interprets the standard exit-code scheme: 0 means the value is on stdout,
//! 1 means the key is absent (not an error), anything else is an error.
//! `path`-typed values additionally go through environment-variable
//! interpolation and tilde expansion.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::warn;

/// Program name: the binary git resolves for `bundle::` URLs, and the
/// default cache subdirectory.
pub const PROGRAM: &str = "git-remote-bundle";

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Read a single-valued config key.  Returns `None` when the key is absent.
/// An empty `vtype` reads the raw value without a `--type` coercion.
pub async fn single(name: &str, vtype: &str) -> Result<Option<String>> {
    let output = run_git_config(&typed_args(vtype, "--get", name)).await?;
    Ok(output.map(|s| normalize(&s)))
}

/// Read a multi-valued config key.  Returns an empty vector when absent.
pub async fn multi(name: &str, vtype: &str) -> Result<Vec<String>> {
    let output = run_git_config(&typed_args(vtype, "--get-all", name)).await?;
    Ok(match output {
        Some(s) => normalize(&s)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    })
}

fn typed_args<'a>(vtype: &'a str, getter: &'a str, name: &'a str) -> Vec<&'a str> {
    if vtype.is_empty() {
        vec![getter, name]
    } else {
        vec!["--type", vtype, getter, name]
    }
}

async fn run_git_config(args: &[&str]) -> Result<Option<String>> {
    let output = Command::new("git")
        .arg("config")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git config")?;

    if output.status.success() {
        return Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()));
    }
    // Exit code 1 is git's "key not set".
    if output.status.code() == Some(1) {
        return Ok(None);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    bail!(
        "git config {} failed (status {}): {}",
        args.join(" "),
        output.status,
        stderr.trim(),
    );
}

/// Normalize CRLF line endings and trim the trailing newline.
fn normalize(s: &str) -> String {
    let s = s.replace("\r\n", "\n");
    s.trim_end_matches('\n').to_string()
}

/// Interpolate `$VAR` references and expand a leading tilde.
pub fn expand(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .map_err(|e| anyhow::anyhow!("failed to expand {path}: {e}"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

async fn single_path(name: &str) -> Result<Option<PathBuf>> {
    match single(name, "path").await? {
        Some(value) if !value.is_empty() => Ok(Some(expand(&value)?)),
        _ => Ok(None),
    }
}

async fn multi_paths(name: &str) -> Result<Vec<PathBuf>> {
    multi(name, "path")
        .await?
        .iter()
        .map(|p| expand(p))
        .collect()
}

// ---------------------------------------------------------------------------
// Recognized keys
// ---------------------------------------------------------------------------

/// Paths of the authorized signer public keys (`bundle.pubKeys`).
pub async fn pub_key_paths() -> Result<Vec<PathBuf>> {
    multi_paths("bundle.pubKeys").await
}

/// Path of this user's private key (`bundle.privKey`).
pub async fn priv_key_path() -> Result<Option<PathBuf>> {
    let mut paths = multi_paths("bundle.privKey").await?;
    match paths.len() {
        0 => Ok(None),
        1 => Ok(Some(paths.remove(0))),
        _ => bail!("bundle.privKey: at most one key can be configured"),
    }
}

/// Cache root: `bundle.cacheDir`, then `bundle.baseDir`, then the OS user
/// cache directory under the program name.
pub async fn cache_dir() -> Result<PathBuf> {
    if let Some(dir) = single_path("bundle.cacheDir").await? {
        return Ok(dir);
    }
    if let Some(dir) = single_path("bundle.baseDir").await? {
        return Ok(dir);
    }
    let cache = dirs::cache_dir().context("cannot determine the user cache directory")?;
    Ok(cache.join(PROGRAM))
}

/// Default log level (`bundle.verbosity`), `info` when unset.
pub async fn verbosity() -> String {
    match single("bundle.verbosity", "").await {
        Ok(Some(level)) if !level.is_empty() => level,
        Ok(_) => "info".to_string(),
        Err(err) => {
            warn!(error = %err, "bundle.verbosity: falling back to info");
            "info".to_string()
        }
    }
}

/// Whether artifacts are encrypted (`bundle.encrypt`).  Unset, unparseable
/// or unreadable all fail safe to `true`.
pub async fn encrypt() -> bool {
    match single("bundle.encrypt", "bool").await {
        Ok(Some(value)) => value.parse::<bool>().unwrap_or(true),
        Ok(None) => true,
        Err(err) => {
            warn!(error = %err, "bundle.encrypt: falling back to encrypted");
            true
        }
    }
}

/// `merge.verifySignatures` enables git's own per-ref signature checks after
/// cloning a bundle, as defense in depth on top of the envelope signature.
/// Defaults to false, matching git.
pub async fn verify_merge_signatures() -> Result<bool> {
    match single("merge.verifySignatures", "bool").await? {
        Some(value) if !value.is_empty() => value
            .parse::<bool>()
            .with_context(|| format!("merge.verifySignatures: invalid bool: {value}")),
        _ => Ok(false),
    }
}

// ---------------------------------------------------------------------------
// Sandbox path discovery
// ---------------------------------------------------------------------------

/// Enumerate the read-only paths the jailed process needs: every git config
/// file, any configured include, the gpg-ssh signing material, and the
/// envelope keys.
pub async fn sandbox_ro_paths() -> Result<Vec<PathBuf>> {
    let mut ro = vec![PathBuf::from("/etc/gitconfig")];

    if let Some(home) = dirs::home_dir() {
        ro.push(home.join(".gitconfig"));
    }
    if let Some(config) = dirs::config_dir() {
        ro.push(config.join("git").join("config"));
    }

    if let Some(include) = single_path("include.path").await? {
        ro.push(include);
    }

    if single("gpg.format", "path").await?.as_deref() == Some("ssh") {
        if let Some(signing_key) = single_path("user.signingKey").await? {
            ro.push(signing_key);
        }
        if let Some(allowed) = single_path("gpg.ssh.allowedSignersFile").await? {
            ro.push(allowed);
        }
    }

    ro.extend(pub_key_paths().await?);
    if let Some(priv_key) = priv_key_path().await? {
        ro.push(priv_key);
    }

    Ok(ro)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_crlf_and_trailing_newline() {
        assert_eq!(normalize("a\r\nb\n"), "a\nb");
        assert_eq!(normalize("plain"), "plain");
        assert_eq!(normalize("trailing\n\n"), "trailing");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn expand_interpolates_env_vars() {
        std::env::set_var("GIT_REMOTE_BUNDLE_TEST_DIR", "/somewhere");
        let path = expand("$GIT_REMOTE_BUNDLE_TEST_DIR/key.pub").unwrap();
        assert_eq!(path, PathBuf::from("/somewhere/key.pub"));
    }

    #[test]
    fn expand_tilde() {
        let home = dirs::home_dir().unwrap();
        let path = expand("~/key.pub").unwrap();
        assert_eq!(path, home.join("key.pub"));
    }

    #[tokio::test]
    async fn absent_key_is_none_not_error() {
        // Exit code 1 from git config must map to "absent".
        let value = single("bundle.zzzDoesNotExist", "").await.unwrap();
        assert_eq!(value, None);

        let values = multi("bundle.zzzDoesNotExist", "").await.unwrap();
        assert!(values.is_empty());
    }
}

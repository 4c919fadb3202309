//! Git command wrappers using [`tokio::process::Command`].

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Clone / init
// ---------------------------------------------------------------------------

/// Run `git clone --bare --mirror <bundle> <dest>`.
#[instrument(fields(bundle = %bundle.display(), dest = %dest.display()))]
pub async fn clone_bare_mirror(bundle: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("git")
        .arg("clone")
        .arg("--bare")
        .arg("--mirror")
        .arg(bundle)
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git clone --bare --mirror")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git clone --bare --mirror failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bundle cloned");
    Ok(())
}

/// Run `git init --bare <dest>`.
#[instrument(fields(dest = %dest.display()))]
pub async fn init_bare(dest: &Path) -> Result<()> {
    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Run `git --git-dir <git_dir> show-ref` and return its raw stdout.
///
/// Fails on non-zero exit; note that git exits 1 on a repository with no
/// refs at all, which some callers treat as an empty set.
#[instrument(fields(git_dir = %git_dir.display()))]
pub async fn show_ref(git_dir: &Path) -> Result<Vec<u8>> {
    let output = Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .arg("show-ref")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git show-ref")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git show-ref failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    Ok(output.stdout)
}

/// Sort show-ref output lines so snapshots compare independently of git's
/// output order.
pub fn sorted_refs(raw: &[u8]) -> Vec<Vec<u8>> {
    let mut lines: Vec<Vec<u8>> = raw
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    lines.sort();
    lines
}

// ---------------------------------------------------------------------------
// Bundle creation
// ---------------------------------------------------------------------------

/// Run `git --git-dir <git_dir> bundle create <output> --branches --tags`.
#[instrument(fields(git_dir = %git_dir.display(), output = %output.display()))]
pub async fn bundle_create(git_dir: &Path, output: &Path) -> Result<()> {
    let result = Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .arg("bundle")
        .arg("create")
        .arg(output)
        .arg("--branches")
        .arg("--tags")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git bundle create")?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        bail!(
            "git bundle create failed (status {}): {}",
            result.status,
            stderr.trim(),
        );
    }

    debug!("bundle created");
    Ok(())
}

// ---------------------------------------------------------------------------
// Ref signature verification
// ---------------------------------------------------------------------------

/// Run `git --git-dir <git_dir> verify-tag <oid>` or `verify-commit <oid>`.
///
/// On failure the error carries the child's combined stdout and stderr,
/// which is where git reports the offending signature.
#[instrument(fields(git_dir = %git_dir.display(), %oid, tag))]
pub async fn verify_ref(git_dir: &Path, oid: &str, tag: bool) -> Result<String> {
    let verb = if tag { "verify-tag" } else { "verify-commit" };

    let output = Command::new("git")
        .arg("--git-dir")
        .arg(git_dir)
        .arg(verb)
        .arg(oid)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn git {verb}"))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim_end_matches(['\r', '\n']).to_string();

    if !output.status.success() {
        bail!("{}: git {} exited with {}", combined, verb, output.status);
    }

    Ok(combined)
}

// ---------------------------------------------------------------------------
// Pack servers
// ---------------------------------------------------------------------------

/// Exec `git upload-pack <repo>` or `git receive-pack <repo>` with the
/// parent's stdio wired straight through.
///
/// This is the one place the helper hands its stdin/stdout to a child: the
/// pack protocol bytes must flow between the parent git and the pack server
/// untouched.
#[instrument(fields(%service, repo = %repo.display()))]
pub async fn serve_pack(service: &str, repo: &Path) -> Result<()> {
    debug_assert!(service == "upload-pack" || service == "receive-pack");

    let status = Command::new("git")
        .arg(service)
        .arg(repo)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to spawn git {service}"))?;

    if !status.success() {
        bail!("git {service} exited with {status}");
    }

    debug!("pack server finished");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_refs_is_order_insensitive() {
        let a = b"bbb refs/heads/main\naaa refs/tags/v1\n";
        let b = b"aaa refs/tags/v1\nbbb refs/heads/main\n";
        assert_eq!(sorted_refs(a), sorted_refs(b));
    }

    #[test]
    fn sorted_refs_ignores_blank_lines() {
        let raw = b"\naaa refs/tags/v1\n\n";
        assert_eq!(sorted_refs(raw), vec![b"aaa refs/tags/v1".to_vec()]);
    }

    #[test]
    fn sorted_refs_distinguishes_content() {
        let a = b"aaa refs/heads/main\n";
        let b = b"bbb refs/heads/main\n";
        assert_ne!(sorted_refs(a), sorted_refs(b));
    }

    #[tokio::test]
    async fn init_bare_creates_a_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        init_bare(&repo).await.unwrap();
        assert!(repo.join("HEAD").is_file());
    }
}

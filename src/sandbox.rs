//! Mount-namespace confinement via bubblewrap.
//!
//! The planner computes the full set of paths an invocation needs, then
//! re-executes the same argv inside a `bwrap` jail that exposes only those
//! paths.  The jailed child is detected through an inherited environment
//! variable rather than by probing the mount table, and the outer process
//! exits with the child's status.  On hosts without bubblewrap the whole
//! module is a no-op.
//!
//! All of this happens before any user data or network I/O is touched:
//! the path sets are frozen first, then the jail starts, then work begins.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::config;

/// Set in the jailed child's environment; its presence means "already
/// confined, do not re-exec".
pub const SANDBOX_ENV: &str = "GIT_REMOTE_BUNDLE_SANDBOXED";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A read-write mount target that must exist before the jail starts, since
/// bind mounts need something to attach to.
#[derive(Debug, Clone)]
pub struct RwTarget {
    pub path: PathBuf,
    /// Create as a directory (true) or a regular file (false) when missing.
    pub dir: bool,
}

struct Plan {
    ro: Vec<PathBuf>,
    rw: Vec<RwTarget>,
    share_net: bool,
    helper: bool,
}

/// Confine the remote-helper invocation: network shared, stdin inherited,
/// the cache directory and any `file://` target writable.
pub async fn confine_helper(uri: &Url, cache_dir: &Path) -> Result<()> {
    let mut rw = vec![RwTarget {
        path: cache_dir.to_path_buf(),
        dir: true,
    }];
    if uri.scheme() == "file" {
        if let Ok(path) = uri.to_file_path() {
            // The upload path renames a staged sibling into place, so the
            // whole parent directory has to be writable, not just the file.
            let dir = path.parent().map(Path::to_path_buf).unwrap_or(path);
            rw.push(RwTarget { path: dir, dir: true });
        }
    }

    confine(Plan {
        ro: config::sandbox_ro_paths().await?,
        rw,
        share_net: true,
        helper: true,
    })
    .await
}

/// Confine an ancillary subcommand: no network, stdin closed, the given
/// inputs read-only and the outputs pre-created and writable.
pub async fn confine_cli(inputs: &[PathBuf], outputs: &[RwTarget]) -> Result<()> {
    let mut ro = config::sandbox_ro_paths().await?;
    ro.extend(inputs.iter().cloned());

    confine(Plan {
        ro,
        rw: outputs.to_vec(),
        share_net: false,
        helper: false,
    })
    .await
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Returns `Ok(())` without side effects when the process is already jailed
/// or the host has no bubblewrap; otherwise re-execs inside the jail and
/// never returns (the outer process exits with the child's status).
async fn confine(plan: Plan) -> Result<()> {
    if std::env::var_os(SANDBOX_ENV).is_some() {
        debug!("already confined");
        return Ok(());
    }
    if !bubblewrap_available().await {
        debug!("bubblewrap unavailable; running unconfined");
        return Ok(());
    }

    let created = ensure_rw_targets(&plan.rw)?;

    let mut cmd = Command::new("bwrap");
    cmd.arg("--die-with-parent");
    cmd.arg("--unshare-all");
    if plan.share_net {
        cmd.arg("--share-net");
    }
    cmd.arg("--dev").arg("/dev");
    cmd.arg("--proc").arg("/proc");
    cmd.arg("--tmpfs").arg("/tmp");
    cmd.arg("--setenv").arg(SANDBOX_ENV).arg("1");

    // Base system paths so git, ssh and the dynamic loader keep working.
    for base in ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc"] {
        if Path::new(base).exists() {
            cmd.arg("--ro-bind").arg(base).arg(base);
        }
    }

    let exe = std::env::current_exe().context("cannot determine own executable path")?;
    let mut ro = plan.ro;
    ro.push(exe.clone());

    for path in &ro {
        // Missing config files are fine; the jail simply omits them.
        if path.exists() {
            cmd.arg("--ro-bind").arg(path).arg(path);
        }
    }
    for target in &plan.rw {
        cmd.arg("--bind").arg(&target.path).arg(&target.path);
    }

    cmd.arg("--");
    cmd.arg(&exe);
    cmd.args(std::env::args_os().skip(1));

    if plan.helper {
        // The helper's stdin/stdout carry the git wire protocol; hand them
        // to the child untouched.
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
    } else {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
    }
    cmd.stderr(Stdio::inherit());

    debug!("re-executing inside bubblewrap");
    let mut child = cmd.spawn().context("failed to spawn bwrap")?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.unwrap_or(None) {
            info!("{line}");
        }
    }

    let status = child.wait().await.context("failed to wait for bwrap")?;
    if !status.success() {
        for path in &created {
            debug!(path = %path.display(), "removing pre-created target");
            if let Err(err) = remove_target(path) {
                warn!(path = %path.display(), error = %err, "cleanup failed");
            }
        }
    }

    std::process::exit(status.code().unwrap_or(1));
}

async fn bubblewrap_available() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    Command::new("bwrap")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Pre-create missing read-write targets.  Returns the paths that were
/// actually created (for directories, the topmost missing ancestor) so a
/// failed jailed run can undo them.
fn ensure_rw_targets(targets: &[RwTarget]) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();

    for target in targets {
        if target.path.exists() {
            continue;
        }

        if target.dir {
            use std::os::unix::fs::DirBuilderExt;

            let top = topmost_missing(&target.path);
            debug!(path = %target.path.display(), "creating directory target");
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&target.path)
                .with_context(|| format!("failed to create {}", target.path.display()))?;
            created.push(top);
        } else {
            debug!(path = %target.path.display(), "creating file target");
            std::fs::File::create(&target.path)
                .with_context(|| format!("failed to create {}", target.path.display()))?;
            created.push(target.path.clone());
        }
    }

    Ok(created)
}

/// Walk up from `path` to the highest ancestor that does not exist yet.
fn topmost_missing(path: &Path) -> PathBuf {
    let mut top = path.to_path_buf();
    let mut current = path.to_path_buf();
    while let Some(parent) = current.parent() {
        if parent.as_os_str().is_empty() || parent.exists() {
            break;
        }
        top = parent.to_path_buf();
        current = parent.to_path_buf();
    }
    top
}

fn remove_target(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topmost_missing_finds_first_absent_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("a").join("b").join("c");
        assert_eq!(topmost_missing(&deep), tmp.path().join("a"));
    }

    #[test]
    fn ensure_rw_targets_creates_and_reports() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("cache");
        let file = tmp.path().join("out.bundle");

        let created = ensure_rw_targets(&[
            RwTarget {
                path: dir.clone(),
                dir: true,
            },
            RwTarget {
                path: file.clone(),
                dir: false,
            },
        ])
        .unwrap();

        assert!(dir.is_dir());
        assert!(file.is_file());
        // The directory is reported as its topmost created ancestor.
        assert_eq!(created, vec![tmp.path().join("nested"), file]);
    }

    #[test]
    fn ensure_rw_targets_skips_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("present");
        std::fs::write(&existing, b"x").unwrap();

        let created = ensure_rw_targets(&[RwTarget {
            path: existing,
            dir: false,
        }])
        .unwrap();
        assert!(created.is_empty());
    }
}

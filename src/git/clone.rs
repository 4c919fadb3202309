//! Clone-bundle driver.
//!
//! Materializes a bare mirror repo from a verified plaintext bundle file.
//! When `merge.verifySignatures` is set, every ref in the clone is also run
//! through git's own `verify-tag` / `verify-commit` as defense in depth on
//! top of the envelope signature.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use tracing::{debug, info, instrument};

use super::commands;

/// Clone `bundle` into `dest` via a scratch directory and an atomic rename.
///
/// `bundle` must be absolute: git resolves relative paths against its own
/// `--git-dir`, not our working directory.
#[instrument(fields(bundle = %bundle.display(), dest = %dest.display()))]
pub async fn clone_bundle(bundle: &Path, dest: &Path, verify_signatures: bool) -> Result<()> {
    ensure!(
        bundle.is_absolute(),
        "bundle path must be absolute: {}",
        bundle.display(),
    );

    let tmp = tempfile::tempdir().context("failed to create scratch directory")?;
    let tmp_repo = tmp.path().join("repo");

    commands::clone_bare_mirror(bundle, &tmp_repo).await?;

    if verify_signatures {
        verify_cloned_refs(&tmp_repo, bundle).await?;
    }

    tokio::fs::rename(&tmp_repo, dest)
        .await
        .with_context(|| format!("failed to move clone into place: {}", dest.display()))?;
    debug!("clone materialized");
    Ok(())
}

async fn verify_cloned_refs(repo: &Path, bundle: &Path) -> Result<()> {
    let raw = commands::show_ref(repo).await?;
    let text = String::from_utf8(raw).context("show-ref output is not UTF-8")?;

    let lines: Vec<&str> = text.lines().filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        bail!("{} has no refs", bundle.display());
    }

    for line in lines {
        let (oid, refname) = parse_show_ref_line(line)?;
        let tag = refname.starts_with("refs/tags/");
        debug!(%oid, %refname, tag, "verifying ref signature");
        let report = commands::verify_ref(repo, oid, tag).await?;
        if !report.is_empty() {
            info!("{report}");
        }
    }

    Ok(())
}

/// Validate one `show-ref` line: exactly two space-separated fields, a
/// 40-hex object id and a `refs/`-prefixed name.
fn parse_show_ref_line(line: &str) -> Result<(&str, &str)> {
    let fields: Vec<&str> = line.split(' ').collect();
    let valid = fields.len() == 2
        && fields[0].len() == 40
        && fields[0].chars().all(|c| c.is_ascii_hexdigit())
        && fields[1].starts_with("refs/");
    ensure!(valid, "invalid show-ref line: {line}");
    Ok((fields[0], fields[1]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const OID: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn show_ref_line_accepts_well_formed_input() {
        let line = format!("{OID} refs/heads/main");
        let (oid, refname) = parse_show_ref_line(&line).unwrap();
        assert_eq!(oid, OID);
        assert_eq!(refname, "refs/heads/main");
    }

    #[test]
    fn show_ref_line_rejects_bad_field_count() {
        assert!(parse_show_ref_line(OID).is_err());
        assert!(parse_show_ref_line(&format!("{OID} refs/heads/main extra")).is_err());
    }

    #[test]
    fn show_ref_line_rejects_bad_oid() {
        assert!(parse_show_ref_line("deadbeef refs/heads/main").is_err());
        let non_hex = format!("{}g refs/heads/main", &OID[..39]);
        assert!(parse_show_ref_line(&non_hex).is_err());
    }

    #[test]
    fn show_ref_line_rejects_non_ref_name() {
        assert!(parse_show_ref_line(&format!("{OID} HEAD")).is_err());
    }

    #[tokio::test]
    async fn clone_rejects_relative_bundle_path() {
        let tmp = tempfile::tempdir().unwrap();
        let err = clone_bundle(Path::new("relative.bundle"), &tmp.path().join("repo"), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }
}

//! Remote-helper dialogue with the parent git process.
//!
//! Git drives the helper with line-delimited commands on stdin.  Only the
//! `connect` capability is advertised, so the full command set is
//! `capabilities` plus the two `connect` services.  EOF ends the dialogue
//! normally; anything unrecognized is fatal.

pub mod transaction;

use std::path::Path;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;
use url::Url;

use crate::blob::keys::Keyring;

/// Reply to `capabilities`: the capability list, then a blank terminator.
const CAPABILITIES_REPLY: &[u8] = b"connect\n\n";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Capabilities,
    UploadPack,
    ReceivePack,
}

fn parse_command(line: &str) -> Result<Command> {
    match line {
        "capabilities" => Ok(Command::Capabilities),
        "connect git-upload-pack" => Ok(Command::UploadPack),
        "connect git-receive-pack" => Ok(Command::ReceivePack),
        other => bail!("invalid command: {other}"),
    }
}

/// Run the dialogue loop until EOF on stdin.
///
/// The keyring is loaded once, up front; no key material is re-read inside
/// the loop.
pub async fn run(uri: &Url, cache_root: &Path) -> Result<()> {
    let keyring = Keyring::load().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        debug!(command = %line, "helper command");

        match parse_command(&line)? {
            Command::Capabilities => {
                stdout.write_all(CAPABILITIES_REPLY).await?;
                stdout.flush().await?;
            }
            Command::UploadPack => {
                transaction::fetch(uri, &keyring, cache_root).await?;
            }
            Command::ReceivePack => {
                transaction::push(uri, &keyring, cache_root).await?;
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_reply_is_connect_only() {
        assert_eq!(CAPABILITIES_REPLY, b"connect\n\n");
    }

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse_command("capabilities").unwrap(), Command::Capabilities);
        assert_eq!(
            parse_command("connect git-upload-pack").unwrap(),
            Command::UploadPack
        );
        assert_eq!(
            parse_command("connect git-receive-pack").unwrap(),
            Command::ReceivePack
        );
    }

    #[test]
    fn unknown_commands_are_fatal() {
        let err = parse_command("list").unwrap_err();
        assert!(err.to_string().contains("invalid command: list"));
        assert!(parse_command("").is_err());
        assert!(parse_command("connect git-upload-pack ").is_err());
    }
}

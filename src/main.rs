//! git-remote-bundle: a git remote helper that stores a repository as a
//! single signed (and optionally encrypted) bundle artifact on a `file`,
//! `ssh` or `http(s)` remote.
//!
//! Git invokes the helper as `git-remote-bundle <remote> <url>` with
//! `GIT_DIR` and `GIT_EXEC_PATH` set; without those variables the binary is
//! a small CLI around the envelope format (genkey, seal, unseal, ...).

mod blob;
mod cache;
mod cli;
mod config;
mod git;
mod helper;
mod sandbox;
mod transport;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = config::PROGRAM,
    version,
    about = "Git remote helper for signed and encrypted bundles",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Remote name (supplied by git)
    remote: Option<String>,

    /// Remote URL (supplied by git)
    url: Option<String>,

    /// Verbosity (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    verbosity: Option<String>,

    /// Cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// URL
    #[arg(long = "url", hide = true)]
    url_override: Option<String>,

    #[command(subcommand)]
    command: Option<cli::Command>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    // Logging goes to stderr: stdout belongs to the git wire protocol.
    let level = match &args.verbosity {
        Some(level) => level.clone(),
        None => config::verbosity().await,
    };
    let filter = match level.parse::<tracing::Level>() {
        Ok(level) => EnvFilter::new(level.to_string()),
        Err(_) => {
            eprintln!("invalid log level: {level} (error, warn, info, debug, trace)");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(err) = run(args).await {
        tracing::debug!("{err:?}");
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    match args.command {
        Some(command) => cli::run(command).await,
        None => remote_helper(args).await,
    }
}

// ---------------------------------------------------------------------------
// Remote-helper mode
// ---------------------------------------------------------------------------

/// Reached when invoked through git, or when the user runs the binary
/// without a subcommand.
async fn remote_helper(args: Cli) -> Result<()> {
    // Git sets both of these when it executes a remote helper; refuse to
    // speak the protocol otherwise.
    if std::env::var_os("GIT_DIR").is_none() || std::env::var_os("GIT_EXEC_PATH").is_none() {
        anyhow::bail!("not invoked as a remote helper by git");
    }

    args.remote
        .as_deref()
        .context("missing arguments: <remote> <url>")?;
    let raw_url = args
        .url_override
        .or(args.url)
        .context("missing arguments: <remote> <url>")?;
    let uri = Url::parse(&raw_url).with_context(|| format!("invalid remote URL: {raw_url}"))?;

    // Fail on unsupported schemes before any I/O.
    transport::connect(&uri)?;

    let cache_root = match args.cache_dir {
        Some(dir) => dir,
        None => config::cache_dir().await?,
    };

    // Freeze the path set and enter the jail before touching user data.
    sandbox::confine_helper(&uri, &cache_root).await?;

    helper::run(&uri, &cache_root).await
}

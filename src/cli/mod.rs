//! Command-line interface definitions for the `hangar` binary.
//!
//! Kept free of crate dependencies so the build script can include this
//! module to render the manual page.

use clap::Parser;

/// Default backend used by the client subcommands.
pub(crate) const DEFAULT_BACKEND: &str = "http://127.0.0.1:8787";

/// Top-level CLI for the `hangar` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hangar",
    about = "Deploy self-hosted apps to a fresh cloud VM",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the HTTP backend.
    #[command(name = "serve", about = "Run the deployment backend")]
    Serve,
    /// Follow a deployment's log or terminal output.
    #[command(name = "tail", about = "Follow a deployment's log or terminal output")]
    Tail(TailCommand),
    /// Cancel a running deployment.
    #[command(name = "cancel", about = "Cancel a running deployment before its next stage")]
    Cancel(CancelCommand),
}

/// Arguments for `hangar tail`.
#[derive(Debug, Parser)]
pub(crate) struct TailCommand {
    /// Session identifier returned when the deployment was submitted.
    #[arg(value_name = "SESSION")]
    pub(crate) session: String,
    /// Backend base URL.
    #[arg(long, env = "HANGAR_BACKEND_URL", default_value = DEFAULT_BACKEND)]
    pub(crate) backend: String,
    /// Follow the interactive terminal instead of the deployment log.
    #[arg(long)]
    pub(crate) pty: bool,
    /// Start from this line (or terminal chunk) index.
    #[arg(long, default_value_t = 0)]
    pub(crate) offset: usize,
}

/// Arguments for `hangar cancel`.
#[derive(Debug, Parser)]
pub(crate) struct CancelCommand {
    /// Session identifier.
    #[arg(value_name = "SESSION")]
    pub(crate) session: String,
    /// Backend base URL.
    #[arg(long, env = "HANGAR_BACKEND_URL", default_value = DEFAULT_BACKEND)]
    pub(crate) backend: String,
}

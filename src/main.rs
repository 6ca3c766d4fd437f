//! Binary entry point for the hangar CLI.

mod cli;

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hangar::api::{self, ServeError};
use hangar::client::{self, BackendUrl, ClientError, HangarClient};
use hangar::config::{ConfigError, HangarConfig};

use cli::{CancelCommand, Cli, TailCommand};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_LOG_FILTER: &str = "hangar=info,tower_http=info";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("'{0}' is not a session identifier")]
    InvalidSession(String),
    #[error("deployment failed ({kind}): {message}")]
    DeploymentFailed { kind: String, message: String },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Serve => {
            let config = HangarConfig::load_without_cli_args()?;
            api::serve(&config).await?;
            Ok(0)
        }
        Cli::Tail(args) => tail(&args).await,
        Cli::Cancel(args) => cancel(&args).await,
    }
}

async fn tail(args: &TailCommand) -> Result<i32, CliError> {
    let session = parse_session(&args.session)?;
    let client = HangarClient::new(BackendUrl::parse(&args.backend)?);
    let mut stdout = io::stdout();

    if args.pty {
        let follow = client::follow_pty(&client, session, args.offset, POLL_INTERVAL, &mut stdout);
        tokio::select! {
            result = follow => result?,
            _ = tokio::signal::ctrl_c() => {}
        }
        return Ok(0);
    }

    let status =
        client::follow_logs(&client, session, args.offset, POLL_INTERVAL, &mut stdout).await?;
    match status.failure {
        Some(failure) => Err(CliError::DeploymentFailed {
            kind: failure.kind,
            message: failure.message,
        }),
        None => Ok(0),
    }
}

async fn cancel(args: &CancelCommand) -> Result<i32, CliError> {
    let session = parse_session(&args.session)?;
    let client = HangarClient::new(BackendUrl::parse(&args.backend)?);
    client.cancel(session).await?;
    writeln!(io::stdout(), "cancellation requested for {session}").ok();
    Ok(0)
}

fn parse_session(raw: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(raw.trim()).map_err(|_| CliError::InvalidSession(raw.to_owned()))
}

fn report_error(err: &CliError) {
    writeln!(io::stderr(), "hangar: {err}").ok();
}

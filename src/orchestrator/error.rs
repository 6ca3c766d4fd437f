//! Deployment failures, one variant per reported failure kind.

use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderError;
use crate::selector::Specs;
use crate::session::FailureKind;
use crate::ssh::SshError;

use super::plan::PlanError;

/// Why a deployment stopped.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// The provider rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(#[source] ProviderError),
    /// Listing sizes failed.
    #[error("could not list sizes: {0}")]
    Upstream(#[source] ProviderError),
    /// The requested provider is not registered.
    #[error("provider '{0}' is not available")]
    UnknownProvider(String),
    /// No offered size meets the minimums.
    #[error("no {provider} size in {region} offers {specs}")]
    NoMatchingSize {
        /// Provider name.
        provider: String,
        /// Requested region.
        region: String,
        /// Minimums that nothing satisfied.
        specs: Specs,
    },
    /// Instance creation failed.
    #[error("{0}")]
    Provision(#[source] ProviderError),
    /// The instance did not become reachable in time.
    #[error("{0}")]
    ProvisionTimeout(#[source] ProviderError),
    /// SSH kept refusing the session key until the wait window closed.
    #[error("ssh to {host} failed after {attempts} attempts over {} seconds: {source}", .waited.as_secs())]
    SshUnreachable {
        /// Instance address.
        host: String,
        /// Connection attempts made.
        attempts: u32,
        /// Time spent retrying.
        waited: Duration,
        /// The last connection error.
        #[source]
        source: SshError,
    },
    /// An install template could not be rendered.
    #[error("install plan is invalid: {0}")]
    Plan(#[from] PlanError),
    /// An install command failed.
    #[error(
        "install command {} failed: `{command}` exited with status {}: {output}",
        .index + 1,
        .exit_code.map_or_else(|| String::from("unknown"), |code| code.to_string())
    )]
    Command {
        /// Zero-based position in the install sequence.
        index: usize,
        /// Command text with secret answers masked.
        command: String,
        /// Remote exit code, when known.
        exit_code: Option<i32>,
        /// Tail of the command output.
        output: String,
    },
    /// The DNS record could not be created.
    #[error("DNS configuration failed: {0}")]
    Dns(#[source] ProviderError),
    /// No certificate was issued.
    #[error("TLS issuance failed: {0}")]
    Tls(String),
    /// Cancellation was requested before `stage`.
    #[error("cancelled before {stage}")]
    Cancelled {
        /// Stage that did not start.
        stage: &'static str,
    },
}

impl DeployError {
    /// Classifies an error raised while listing sizes.
    #[must_use]
    pub fn from_listing(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth { .. } => Self::Auth(err),
            _ => Self::Upstream(err),
        }
    }

    /// Classifies an error raised by `create_instance`.
    #[must_use]
    pub fn from_create(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth { .. } => Self::Auth(err),
            _ => Self::Provision(err),
        }
    }

    /// Classifies an error raised by `wait_reachable`.
    #[must_use]
    pub fn from_wait(err: ProviderError) -> Self {
        match err {
            ProviderError::ProvisionTimeout { .. } => Self::ProvisionTimeout(err),
            ProviderError::Auth { .. } => Self::Auth(err),
            _ => Self::Provision(err),
        }
    }

    /// Maps a failed remote command at `index` of the install sequence.
    #[must_use]
    pub fn from_command(index: usize, display: &str, err: SshError) -> Self {
        match err {
            SshError::Command {
                exit_code, output, ..
            } => Self::Command {
                index,
                command: display.to_owned(),
                exit_code,
                output,
            },
            other => Self::Command {
                index,
                command: display.to_owned(),
                exit_code: None,
                output: other.to_string(),
            },
        }
    }

    /// Failure category reported on the session.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Auth(_) => FailureKind::Auth,
            Self::Upstream(_) => FailureKind::Upstream,
            Self::NoMatchingSize { .. } => FailureKind::NoMatchingSize,
            Self::UnknownProvider(_) | Self::Provision(_) => FailureKind::ProvisionError,
            Self::ProvisionTimeout(_) => FailureKind::ProvisionTimeout,
            Self::SshUnreachable { .. } => FailureKind::SshUnreachable,
            Self::Plan(_) | Self::Command { .. } => FailureKind::Command,
            Self::Dns(_) | Self::Tls(_) => FailureKind::NoOp,
            Self::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failures_keep_command_and_status() {
        let err = DeployError::from_command(
            2,
            "docker run app",
            SshError::Command {
                command: String::from("docker run app"),
                exit_code: Some(125),
                output: String::from("port is already allocated"),
            },
        );
        assert_eq!(err.kind(), FailureKind::Command);
        assert_eq!(
            err.to_string(),
            "install command 3 failed: `docker run app` exited with status 125: port is already allocated"
        );
    }

    #[test]
    fn wait_timeouts_are_not_provision_errors() {
        let err = DeployError::from_wait(ProviderError::ProvisionTimeout {
            instance_id: String::from("i-1"),
            waited: Duration::from_secs(600),
        });
        assert_eq!(err.kind(), FailureKind::ProvisionTimeout);
        assert!(err.to_string().contains("600 seconds"));
    }

    #[test]
    fn no_matching_size_mentions_disk_only_when_requested() {
        let err = DeployError::NoMatchingSize {
            provider: String::from("vultr"),
            region: String::from("fra"),
            specs: Specs {
                cpus: 2,
                memory_mb: 4096,
                disk_gb: 0,
            },
        };
        assert_eq!(err.to_string(), "no vultr size in fra offers 2 vCPU, 4096 MB memory");
    }
}

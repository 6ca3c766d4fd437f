//! Remote execution over one multiplexed OpenSSH connection.
//!
//! [`SshChannel::connect`] authenticates once and leaves an OpenSSH control
//! master running; every later command, and the interactive PTY, reuses that
//! connection through its control socket. Commands run strictly one after
//! another and stream their output to an [`OutputSink`] as it arrives.

use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::time::timeout;

use crate::runner::{CommandOutput, CommandRunner, OutputSink, RunnerError};

pub mod keys;

pub use keys::{KeyPair, generate_keypair};

/// Characters of captured output kept in command errors.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Local SSH client settings shared by every channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Directory holding control sockets.
    pub control_dir: Utf8PathBuf,
    /// Per-attempt TCP and authentication timeout.
    pub connect_timeout: Duration,
    /// How long an idle control master survives.
    pub control_persist: Duration,
}

/// Where and as whom to connect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Public address of the instance.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key generated for this deployment.
    pub identity_file: Utf8PathBuf,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Errors raised by the remote execution channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// The connection could not be established.
    #[error("could not connect to {host}: {message}")]
    Connect {
        /// Address that was dialled.
        host: String,
        /// What went wrong.
        message: String,
    },
    /// A remote command exited unsuccessfully.
    #[error("`{command}` exited with status {status}: {output}", status = exit_label(.exit_code.as_ref()))]
    Command {
        /// Command text as sent.
        command: String,
        /// Remote exit code, if reported.
        exit_code: Option<i32>,
        /// Tail of the captured output.
        output: String,
    },
    /// A command of a sequence failed; later commands were not run.
    #[error("command {} of the sequence failed: {source}", .index + 1)]
    Sequence {
        /// Zero-based index of the failing command.
        index: usize,
        /// The failure.
        #[source]
        source: Box<SshError>,
    },
    /// Key material could not be created or read.
    #[error("ssh key generation failed: {0}")]
    KeyGeneration(String),
    /// The local `ssh` process could not be run.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// An authenticated connection to one instance.
pub struct SshChannel {
    runner: Arc<dyn CommandRunner>,
    settings: SshSettings,
    target: SshTarget,
}

impl std::fmt::Debug for SshChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshChannel")
            .field("settings", &self.settings)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl SshChannel {
    /// Opens the control master for `target`.
    ///
    /// Fails fast: the attempt is bounded by the configured connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Connect`] when authentication fails, the host is
    /// unreachable, or the attempt times out, and [`SshError::Runner`] when
    /// `ssh` cannot be started.
    pub async fn connect(
        runner: Arc<dyn CommandRunner>,
        settings: SshSettings,
        target: SshTarget,
    ) -> Result<Self, SshError> {
        let channel = Self {
            runner,
            settings,
            target,
        };
        let args = channel.master_args();
        let budget = channel.settings.connect_timeout + Duration::from_secs(1);
        let host = channel.target.host.to_string();

        let output = timeout(
            budget,
            channel.runner.capture(&channel.settings.ssh_bin, &args),
        )
        .await
        .map_err(|_| SshError::Connect {
            host: host.clone(),
            message: format!("timed out after {} seconds", budget.as_secs()),
        })??;

        if !output.is_success() {
            let message = tail(output.stderr.trim());
            return Err(SshError::Connect {
                host,
                message: if message.is_empty() {
                    format!("ssh exited with status {}", output.status_text())
                } else {
                    message
                },
            });
        }

        tracing::debug!(host = %channel.target.host, "ssh control master established");
        Ok(channel)
    }

    /// Returns the connection target.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Runs `command`, streaming its output to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Command`] for a non-zero exit, carrying the
    /// command text, exit status, and captured output.
    pub async fn run(
        &self,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<CommandOutput, SshError> {
        let args = self.command_args(command);
        let output = self.runner.run(&self.settings.ssh_bin, &args, sink).await?;
        if output.is_success() {
            return Ok(output);
        }

        let combined = format!("{}{}", output.stdout, output.stderr);
        Err(SshError::Command {
            command: command.to_owned(),
            exit_code: output.code,
            output: tail(combined.trim()),
        })
    }

    /// Runs `commands` in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Sequence`] naming the failing command's index.
    pub async fn run_all<S>(&self, commands: &[S], sink: &dyn OutputSink) -> Result<(), SshError>
    where
        S: AsRef<str> + Sync,
    {
        for (index, command) in commands.iter().enumerate() {
            self.run(command.as_ref(), sink)
                .await
                .map_err(|source| SshError::Sequence {
                    index,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    /// Runs `command` and returns its standard output.
    ///
    /// # Errors
    ///
    /// As for [`SshChannel::run`].
    pub async fn run_capture(
        &self,
        command: &str,
        sink: &dyn OutputSink,
    ) -> Result<String, SshError> {
        self.run(command, sink).await.map(|output| output.stdout)
    }

    /// Stops the control master.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Runner`] when `ssh` cannot be started. A master
    /// that already exited is not an error.
    pub async fn close(&self) -> Result<(), SshError> {
        let mut args = vec![OsString::from("-O"), OsString::from("exit")];
        args.extend(self.control_args(false));
        args.push(OsString::from(self.target.destination()));
        let output = self.runner.capture(&self.settings.ssh_bin, &args).await?;
        if !output.is_success() {
            tracing::debug!(stderr = %output.stderr.trim(), "control master already gone");
        }
        Ok(())
    }

    /// Arguments for an interactive shell with a forced remote PTY that
    /// reuses this connection.
    #[must_use]
    pub fn pty_args(&self) -> Vec<OsString> {
        let mut args = vec![OsString::from("-tt")];
        args.extend(self.common_options());
        args.extend(self.control_args(false));
        args.push(OsString::from(self.target.destination()));
        args
    }

    /// Path to the `ssh` binary.
    #[must_use]
    pub fn ssh_bin(&self) -> &str {
        &self.settings.ssh_bin
    }

    fn master_args(&self) -> Vec<OsString> {
        let mut args = self.common_options();
        args.extend(self.control_args(true));
        args.push(OsString::from(self.target.destination()));
        args.push(OsString::from("true"));
        args
    }

    fn command_args(&self, command: &str) -> Vec<OsString> {
        let mut args = self.common_options();
        args.extend(self.control_args(false));
        args.push(OsString::from(self.target.destination()));
        args.push(OsString::from(command));
        args
    }

    fn control_args(&self, master: bool) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", control_path(&self.settings.control_dir))),
            OsString::from("-o"),
            OsString::from(if master {
                "ControlMaster=yes"
            } else {
                "ControlMaster=no"
            }),
        ];
        if master {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "ControlPersist={}",
                self.settings.control_persist.as_secs()
            )));
        }
        args
    }

    fn common_options(&self) -> Vec<OsString> {
        let options = [
            String::from("BatchMode=yes"),
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("LogLevel=ERROR"),
            String::from("ServerAliveInterval=15"),
            format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs().max(1)),
        ];
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.target.port.to_string()),
            OsString::from("-i"),
            OsString::from(self.target.identity_file.as_str()),
        ];
        for option in options {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args
    }
}

fn exit_label(code: Option<&i32>) -> String {
    code.map_or_else(|| String::from("unknown"), ToString::to_string)
}

fn control_path(dir: &Utf8Path) -> String {
    format!("{dir}/%C")
}

fn tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return text.to_owned();
    }
    text.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
}

#[cfg(test)]
mod tests;

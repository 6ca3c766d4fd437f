//! Asynchronous external command execution with live output forwarding.
//!
//! Every program hangar shells out to (`ssh`, `ssh-keygen`, `terraform`,
//! provider CLIs) runs through a [`CommandRunner`], so tests can substitute a
//! scripted runner for real processes.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

mod decode;

pub use decode::{LineAssembler, Utf8StreamDecoder};

const READ_CHUNK: usize = 4096;

/// Which output stream a chunk came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Receives output chunks as a command produces them.
pub trait OutputSink: Send + Sync {
    /// Called once per chunk read from `stream`, in arrival order.
    fn chunk(&self, stream: OutputStream, bytes: &[u8]);
}

/// Sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn chunk(&self, _stream: OutputStream, _bytes: &[u8]) {}
}

static NULL_SINK: NullSink = NullSink;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised when a command cannot be run at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// The process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Reading output or waiting for exit failed.
    #[error("i/o error while running {program}: {message}")]
    Io {
        /// Program being run.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, RunnerError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, forwarding output chunks to `sink` as they
    /// arrive and capturing both streams.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        sink: &'a dyn OutputSink,
    ) -> RunnerFuture<'a>;

    /// Runs `program` and only captures its output.
    fn capture<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> RunnerFuture<'a> {
        self.run(program, args, &NULL_SINK)
    }
}

/// Runner that spawns real processes through tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        sink: &'a dyn OutputSink,
    ) -> RunnerFuture<'a> {
        Box::pin(async move {
            let io_error = |err: std::io::Error| RunnerError::Io {
                program: program.to_owned(),
                message: err.to_string(),
            };

            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| RunnerError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            let stdout = child.stdout.take().ok_or_else(|| RunnerError::Io {
                program: program.to_owned(),
                message: String::from("stdout was not captured"),
            })?;
            let stderr = child.stderr.take().ok_or_else(|| RunnerError::Io {
                program: program.to_owned(),
                message: String::from("stderr was not captured"),
            })?;

            let (out, err, status) = tokio::try_join!(
                pump(stdout, OutputStream::Stdout, sink),
                pump(stderr, OutputStream::Stderr, sink),
                child.wait(),
            )
            .map_err(io_error)?;

            Ok(CommandOutput {
                code: status.code(),
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            })
        })
    }
}

async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    sink: &dyn OutputSink,
) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut buffer = [0_u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            return Ok(captured);
        }
        let chunk = buffer.get(..read).unwrap_or_default();
        sink.chunk(stream, chunk);
        captured.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<(OutputStream, Vec<u8>)>>,
    }

    impl OutputSink for RecordingSink {
        fn chunk(&self, stream: OutputStream, bytes: &[u8]) {
            self.chunks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((stream, bytes.to_vec()));
        }
    }

    impl RecordingSink {
        fn collected(&self, wanted: OutputStream) -> String {
            let chunks = self
                .chunks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let bytes: Vec<u8> = chunks
                .iter()
                .filter(|(stream, _)| *stream == wanted)
                .flat_map(|(_, bytes)| bytes.iter().copied())
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    fn sh(script: &str) -> Vec<OsString> {
        vec![OsString::from("-c"), OsString::from(script)]
    }

    #[tokio::test]
    async fn captures_and_forwards_both_streams() {
        let sink = RecordingSink::default();
        let args = sh("printf out && printf err 1>&2; exit 42");
        let output = ProcessCommandRunner
            .run("sh", &args, &sink)
            .await
            .unwrap_or_else(|err| panic!("run: {err}"));

        assert_eq!(output.code, Some(42));
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert_eq!(sink.collected(OutputStream::Stdout), "out");
        assert_eq!(sink.collected(OutputStream::Stderr), "err");
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        let args =
            sh("i=0; while [ $i -lt 2000 ]; do echo line-$i; echo err-$i 1>&2; i=$((i+1)); done");
        let output = ProcessCommandRunner
            .capture("sh", &args)
            .await
            .unwrap_or_else(|err| panic!("run: {err}"));

        assert!(output.is_success());
        assert_eq!(output.stdout.lines().count(), 2000);
        assert_eq!(output.stderr.lines().count(), 2000);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = ProcessCommandRunner
            .capture("hangar-definitely-missing-binary", &[])
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, RunnerError::Spawn { .. }), "{err:?}");
    }
}

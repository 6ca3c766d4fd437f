//! Interactive terminal bridged over the session's SSH connection.
//!
//! Input is serialised through one channel into the terminal's stdin; output
//! from both streams is appended to a shared chunk buffer that clients poll
//! by offset.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;

use super::TerminalError;

const INPUT_QUEUE: usize = 64;
const READ_CHUNK: usize = 4096;

/// Program and arguments that open the terminal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerminalLaunch {
    /// Executable, normally `ssh`.
    pub program: String,
    /// Arguments, including the forced-tty flag and destination.
    pub args: Vec<OsString>,
}

/// Append-only terminal output.
#[derive(Debug, Default)]
pub struct PtyBuffer {
    chunks: RwLock<Vec<Vec<u8>>>,
}

impl PtyBuffer {
    /// Appends a chunk.
    pub fn push(&self, chunk: Vec<u8>) {
        self.chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chunk);
    }

    /// Chunks at or after `offset`, and the offset to ask for next.
    #[must_use]
    pub fn since(&self, offset: usize) -> (Vec<Vec<u8>>, usize) {
        let chunks = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        let tail = chunks.get(offset..).map(<[Vec<u8>]>::to_vec).unwrap_or_default();
        (tail, chunks.len().max(offset))
    }

    /// Number of chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no output arrived yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a running terminal process.
#[derive(Debug)]
pub struct PtyChannel {
    input: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl PtyChannel {
    /// Starts the terminal process and its pump tasks.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the process cannot be spawned.
    pub fn spawn(launch: &TerminalLaunch, output: Arc<PtyBuffer>) -> std::io::Result<Self> {
        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let missing =
            |name: &str| std::io::Error::other(format!("terminal {name} was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (input, receiver) = mpsc::channel(INPUT_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_input(stdin, receiver));
        tokio::spawn(read_output(stdout, Arc::clone(&output)));
        tokio::spawn(read_output(stderr, output));
        let exited = Arc::clone(&closed);
        tokio::spawn(async move {
            let status = child.wait().await;
            tracing::debug!(?status, "terminal process exited");
            exited.store(true, Ordering::SeqCst);
        });

        Ok(Self { input, closed })
    }

    /// Whether the terminal process has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues `bytes` for the terminal's stdin, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Closed`] once the process has exited.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), TerminalError> {
        if self.is_closed() {
            return Err(TerminalError::Closed);
        }
        self.input
            .send(bytes)
            .await
            .map_err(|_| TerminalError::Closed)
    }
}

async fn write_input(mut stdin: ChildStdin, mut receiver: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = receiver.recv().await {
        let written = match stdin.write_all(&bytes).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::debug!(error = %err, "terminal input closed");
            return;
        }
    }
}

async fn read_output<R>(mut reader: R, output: Arc<PtyBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0_u8; READ_CHUNK];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => return,
            Ok(read) => output.push(buffer.get(..read).unwrap_or_default().to_vec()),
            Err(err) => {
                tracing::debug!(error = %err, "terminal output closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_output(buffer: &PtyBuffer, needle: &str) -> String {
        for _ in 0..100 {
            let (chunks, _) = buffer.since(0);
            let text = String::from_utf8_lossy(&chunks.concat()).into_owned();
            if text.contains(needle) {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("terminal output never contained {needle:?}");
    }

    #[tokio::test]
    async fn input_is_echoed_in_order() {
        let buffer = Arc::new(PtyBuffer::default());
        let launch = TerminalLaunch {
            program: String::from("cat"),
            args: Vec::new(),
        };
        let channel = PtyChannel::spawn(&launch, Arc::clone(&buffer))
            .unwrap_or_else(|err| panic!("spawn cat: {err}"));

        for part in ["one ", "two ", "three\n"] {
            channel
                .send(part.as_bytes().to_vec())
                .await
                .unwrap_or_else(|err| panic!("send: {err}"));
        }

        let text = wait_for_output(&buffer, "three").await;
        assert_eq!(text, "one two three\n");
    }

    #[test]
    fn offsets_past_the_end_return_nothing() {
        let buffer = PtyBuffer::default();
        buffer.push(b"a".to_vec());
        buffer.push(b"b".to_vec());

        assert_eq!(buffer.since(1), (vec![b"b".to_vec()], 2));
        assert_eq!(buffer.since(5), (Vec::new(), 5));
    }
}

//! Turns streamed command output into session log lines.

use std::sync::{Mutex, PoisonError};

use crate::runner::{LineAssembler, OutputSink, OutputStream, Utf8StreamDecoder};

use super::{DeploymentSession, LogStream};

#[derive(Debug, Default)]
struct StreamState {
    decoder: Utf8StreamDecoder,
    lines: LineAssembler,
}

/// Output sink that appends each completed line to a session's log.
///
/// Partial lines are held until their newline arrives or [`flush`] is
/// called.
///
/// [`flush`]: SessionLogSink::flush
#[derive(Debug)]
pub struct SessionLogSink<'a> {
    session: &'a DeploymentSession,
    stdout: Mutex<StreamState>,
    stderr: Mutex<StreamState>,
}

impl<'a> SessionLogSink<'a> {
    /// Creates a sink writing into `session`.
    #[must_use]
    pub fn new(session: &'a DeploymentSession) -> Self {
        Self {
            session,
            stdout: Mutex::new(StreamState::default()),
            stderr: Mutex::new(StreamState::default()),
        }
    }

    fn state(&self, stream: OutputStream) -> (&Mutex<StreamState>, LogStream) {
        match stream {
            OutputStream::Stdout => (&self.stdout, LogStream::Stdout),
            OutputStream::Stderr => (&self.stderr, LogStream::Stderr),
        }
    }

    /// Writes out any unterminated trailing text.
    pub fn flush(&self) {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let (slot, log_stream) = self.state(stream);
            let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let rest = state.decoder.finish();
            let mut lines = state.lines.push(&rest);
            lines.extend(state.lines.finish());
            drop(state);
            for line in lines {
                self.session.log(log_stream, line);
            }
        }
    }
}

impl OutputSink for SessionLogSink<'_> {
    fn chunk(&self, stream: OutputStream, bytes: &[u8]) {
        let (slot, log_stream) = self.state(stream);
        let lines = {
            let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let text = state.decoder.push(bytes);
            state.lines.push(&text)
        };
        for line in lines {
            self.session.log(log_stream, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionInfo;
    use uuid::Uuid;

    fn session() -> DeploymentSession {
        DeploymentSession::new(
            Uuid::nil(),
            SessionInfo {
                app: String::from("gitea"),
                provider: String::from("fake"),
                region: String::from("test-1"),
                hostname: String::from("git"),
                domain: None,
            },
        )
    }

    #[test]
    fn lines_split_across_chunks_are_joined() {
        let session = session();
        let sink = SessionLogSink::new(&session);

        sink.chunk(OutputStream::Stdout, b"Pulling fr");
        sink.chunk(OutputStream::Stderr, b"warn: slow\n");
        sink.chunk(OutputStream::Stdout, b"om \xE2\x86");
        sink.chunk(OutputStream::Stdout, b"\x92 hub\ndone");
        sink.flush();

        let (lines, next) = session.lines_since(0);
        let texts: Vec<(LogStream, &str)> =
            lines.iter().map(|line| (line.stream, line.text.as_str())).collect();
        assert_eq!(
            texts,
            vec![
                (LogStream::Stderr, "warn: slow"),
                (LogStream::Stdout, "Pulling from → hub"),
                (LogStream::Stdout, "done"),
            ]
        );
        assert_eq!(next, 3);
    }
}

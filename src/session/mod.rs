//! Per-deployment session state shared between the orchestrator and readers.
//!
//! A session holds the current [`DeploymentState`], an append-only log, and
//! an append-only buffer of terminal output. The orchestrator is the only
//! writer of state and log; any number of HTTP readers poll by offset or wait
//! on the revision counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::provider::{Instance, Size};

mod pty;
mod sink;

pub use pty::{PtyBuffer, PtyChannel, TerminalLaunch};
pub use sink::SessionLogSink;

/// Lines of log kept in failure reports.
pub const FAILURE_LOG_TAIL: usize = 20;

/// Origin of a log line.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogStream {
    /// Progress written by the orchestrator.
    Status,
    /// Remote standard output.
    Stdout,
    /// Remote standard error.
    Stderr,
}

/// One entry of the append-only session log.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// Position in the log; never reused.
    pub index: usize,
    /// Where the text came from.
    pub stream: LogStream,
    /// The line without its terminator.
    pub text: String,
    /// Milliseconds since the session started.
    pub elapsed_ms: u64,
}

/// Why a deployment failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Credentials were rejected.
    Auth,
    /// The provider API failed.
    Upstream,
    /// No size satisfies the app's minimums.
    NoMatchingSize,
    /// Instance creation failed.
    ProvisionError,
    /// The instance never became reachable.
    ProvisionTimeout,
    /// SSH never accepted the session key.
    SshUnreachable,
    /// An install command failed.
    Command,
    /// DNS or TLS configuration failed.
    NoOp,
    /// The user cancelled the deployment.
    Cancelled,
}

/// Terminal failure details.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    /// Failure category.
    pub kind: FailureKind,
    /// Human readable cause.
    pub message: String,
    /// Instance left running, if one was created.
    pub leftover_instance: Option<Instance>,
    /// Last log lines before the failure.
    pub log_tail: Vec<String>,
}

/// Orchestration state of a deployment.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(tag = "state", content = "failure", rename_all = "camelCase")]
pub enum DeploymentState {
    /// Accepted, not yet started.
    #[default]
    Pending,
    /// Listing sizes and choosing one.
    SelectingSize,
    /// Creating the instance.
    Provisioning,
    /// Waiting for SSH to answer.
    AwaitingSsh,
    /// Running install commands.
    Installing,
    /// Creating the DNS record.
    ConfiguringDns,
    /// Obtaining a certificate.
    IssuingTls,
    /// The app is reachable.
    Completed,
    /// The deployment stopped; absorbing.
    Failed(FailureReport),
}

impl DeploymentState {
    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Short stage name used in log lines.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::SelectingSize => "selecting size",
            Self::Provisioning => "provisioning",
            Self::AwaitingSsh => "awaiting ssh",
            Self::Installing => "installing",
            Self::ConfiguringDns => "configuring dns",
            Self::IssuingTls => "issuing tls",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Errors raised when feeding the interactive terminal.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TerminalError {
    /// SSH is not connected yet.
    #[error("the terminal is not available until the instance accepts ssh")]
    NotReady,
    /// The terminal process exited.
    #[error("the terminal has closed")]
    Closed,
    /// The terminal process could not be started.
    #[error("failed to start the terminal: {0}")]
    Spawn(String),
}

#[derive(Debug, Default)]
struct Record {
    state: DeploymentState,
    lines: Vec<LogLine>,
    size: Option<Size>,
    instance: Option<Instance>,
    terminal: Option<TerminalLaunch>,
}

/// Identity of a deployment shown to clients.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// App being deployed.
    pub app: String,
    /// Provider name.
    pub provider: String,
    /// Region slug.
    pub region: String,
    /// Sanitised hostname.
    pub hostname: String,
    /// Sanitised domain, if any.
    pub domain: Option<String>,
}

/// Point-in-time view of a session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: Uuid,
    /// Deployment identity.
    #[serde(flatten)]
    pub info: SessionInfo,
    /// Current state.
    #[serde(flatten)]
    pub state: DeploymentState,
    /// Chosen size, once selected.
    pub size: Option<Size>,
    /// Created instance, once known.
    pub instance: Option<Instance>,
    /// Number of log lines so far.
    pub log_lines: usize,
    /// Number of terminal output chunks so far.
    pub pty_chunks: usize,
    /// Whether cancellation was requested.
    pub cancel_requested: bool,
}

/// Live state of one deployment.
pub struct DeploymentSession {
    id: Uuid,
    info: SessionInfo,
    started: Instant,
    record: RwLock<Record>,
    revision: watch::Sender<u64>,
    cancelled: AtomicBool,
    pty_output: Arc<PtyBuffer>,
    pty: Mutex<Option<PtyChannel>>,
}

impl std::fmt::Debug for DeploymentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentSession")
            .field("id", &self.id)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl DeploymentSession {
    /// Creates a pending session.
    #[must_use]
    pub fn new(id: Uuid, info: SessionInfo) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            id,
            info,
            started: Instant::now(),
            record: RwLock::new(Record::default()),
            revision,
            cancelled: AtomicBool::new(false),
            pty_output: Arc::new(PtyBuffer::default()),
            pty: Mutex::new(None),
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Deployment identity.
    #[must_use]
    pub const fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Record> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Record> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    /// Appends a line and wakes streaming readers.
    pub fn log(&self, stream: LogStream, text: impl Into<String>) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        {
            let mut record = self.write();
            let index = record.lines.len();
            record.lines.push(LogLine {
                index,
                stream,
                text: text.into(),
                elapsed_ms,
            });
        }
        self.bump();
    }

    /// Appends an orchestrator progress line.
    pub fn status(&self, text: impl Into<String>) {
        self.log(LogStream::Status, text);
    }

    /// Moves to `state` unless the session is already terminal. Returns
    /// whether the state changed.
    pub fn set_state(&self, state: DeploymentState) -> bool {
        let changed = {
            let mut record = self.write();
            if record.state.is_terminal() {
                false
            } else {
                record.state = state;
                true
            }
        };
        if changed {
            self.bump();
        }
        changed
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DeploymentState {
        self.read().state.clone()
    }

    /// Records the selected size.
    pub fn set_size(&self, size: Size) {
        self.write().size = Some(size);
        self.bump();
    }

    /// Records the created instance.
    pub fn set_instance(&self, instance: Instance) {
        self.write().instance = Some(instance);
        self.bump();
    }

    /// The created instance, if any.
    #[must_use]
    pub fn instance(&self) -> Option<Instance> {
        self.read().instance.clone()
    }

    /// Makes the interactive terminal available.
    pub fn set_terminal(&self, launch: TerminalLaunch) {
        self.write().terminal = Some(launch);
    }

    /// Lines at or after `offset`, and the offset to ask for next.
    #[must_use]
    pub fn lines_since(&self, offset: usize) -> (Vec<LogLine>, usize) {
        let record = self.read();
        let next = record.lines.len();
        let lines = record.lines.get(offset..).map(<[LogLine]>::to_vec).unwrap_or_default();
        (lines, next.max(offset))
    }

    /// Text of the last `count` log lines.
    #[must_use]
    pub fn log_tail(&self, count: usize) -> Vec<String> {
        let record = self.read();
        let skip = record.lines.len().saturating_sub(count);
        record
            .lines
            .iter()
            .skip(skip)
            .map(|line| line.text.clone())
            .collect()
    }

    /// Terminal output chunks at or after `offset`, and the next offset.
    #[must_use]
    pub fn pty_chunks_since(&self, offset: usize) -> (Vec<Vec<u8>>, usize) {
        self.pty_output.since(offset)
    }

    /// Shared terminal output buffer.
    #[must_use]
    pub fn pty_output(&self) -> Arc<PtyBuffer> {
        Arc::clone(&self.pty_output)
    }

    /// Subscribes to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Requests cancellation. Takes effect before the next stage starts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.bump();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Forwards `bytes` to the terminal, starting it on first use and again
    /// after the previous shell exited.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::NotReady`] before SSH is connected,
    /// [`TerminalError::Spawn`] when the terminal cannot start, and
    /// [`TerminalError::Closed`] when it exits while input is queued.
    pub async fn send_terminal_input(&self, bytes: Vec<u8>) -> Result<(), TerminalError> {
        let mut slot = self.pty.lock().await;
        if slot.as_ref().is_some_and(PtyChannel::is_closed) {
            tracing::debug!(session = %self.id, "terminal exited; reopening");
            *slot = None;
        }
        if slot.is_none() {
            let launch = self.read().terminal.clone().ok_or(TerminalError::NotReady)?;
            let channel = PtyChannel::spawn(&launch, self.pty_output())
                .map_err(|err| TerminalError::Spawn(err.to_string()))?;
            *slot = Some(channel);
        }
        match slot.as_ref() {
            Some(channel) => channel.send(bytes).await,
            None => Err(TerminalError::NotReady),
        }
    }

    /// Point-in-time view for clients.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let record = self.read();
        SessionSnapshot {
            session_id: self.id,
            info: self.info.clone(),
            state: record.state.clone(),
            size: record.size.clone(),
            instance: record.instance.clone(),
            log_lines: record.lines.len(),
            pty_chunks: self.pty_output.len(),
            cancel_requested: self.is_cancelled(),
        }
    }
}

/// All sessions of this process.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<DeploymentSession>>>,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session.
    pub fn insert(&self, session: Arc<DeploymentSession>) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id(), session);
    }

    /// Looks a session up.
    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<Arc<DeploymentSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

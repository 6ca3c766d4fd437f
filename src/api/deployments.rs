//! Deployment submission, status, log and cancellation endpoints.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use crate::request::DeploymentSubmission;
use crate::session::{DeploymentSession, LogLine, LogStream, SessionSnapshot};
use crate::ssh::generate_keypair;

use super::{ApiError, AppState};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Body returned for an accepted deployment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Identifier of the new session.
    pub session_id: Uuid,
}

/// Offset query shared by the polling endpoints.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct OffsetQuery {
    /// First index the caller has not seen yet.
    #[serde(default)]
    pub offset: usize,
}

/// A page of log lines.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogPage {
    /// Lines at or after the requested offset.
    pub lines: Vec<LogLine>,
    /// Offset to request next.
    pub next: usize,
}

pub(super) async fn submit(
    State(state): State<AppState>,
    Json(submission): Json<DeploymentSubmission>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let session_id = Uuid::new_v4();
    let prepared = submission.prepare(&state.catalog, session_id)?;
    let provider = state.registry.get(&prepared.provider).ok_or_else(|| {
        ApiError::BadRequest(format!("provider '{}' is not configured", prepared.provider))
    })?;

    let credentials = timeout(AUTH_TIMEOUT, provider.resolve_auth())
        .await
        .map_err(|_| {
            ApiError::Upstream(format!(
                "resolving {} credentials timed out after {} seconds",
                prepared.provider,
                AUTH_TIMEOUT.as_secs()
            ))
        })??;

    let key_dir = state.keys.key_dir.join(session_id.to_string());
    let key_pair = generate_keypair(
        state.runner.as_ref(),
        &state.keys.ssh_keygen_bin,
        &key_dir,
        &format!("hangar-{session_id}"),
    )
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?;

    let session = Arc::new(DeploymentSession::new(session_id, prepared.session_info()));
    session.status(format!(
        "accepted {} on {} in {} using {} credentials",
        prepared.app.name, prepared.provider, prepared.region, credentials.source
    ));
    state.sessions.insert(Arc::clone(&session));
    tracing::info!(
        session = %session_id,
        app = %prepared.app.name,
        provider = %prepared.provider,
        "deployment accepted"
    );

    let request = prepared.finish(credentials, key_pair);
    drop(state.orchestrator.spawn(session, request));
    Ok(Json(SubmitResponse { session_id }))
}

pub(super) async fn snapshot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.session(&id)?.snapshot()))
}

pub(super) async fn logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<OffsetQuery>,
) -> Result<Json<LogPage>, ApiError> {
    let (lines, next) = state.session(&id)?.lines_since(query.offset);
    Ok(Json(LogPage { lines, next }))
}

pub(super) async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let session = state.session(&id)?;
    if session.state().is_terminal() {
        return Err(ApiError::Conflict(format!("session {id} has already finished")));
    }
    if !session.is_cancelled() {
        session.status("cancellation requested; stopping before the next stage");
        session.cancel();
    }
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<OffsetQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state.session(&id)?;
    let cursor = EventCursor {
        changes: session.subscribe(),
        session,
        offset: query.offset,
        pending: VecDeque::new(),
        finished: false,
    };
    Ok(Sse::new(stream::unfold(cursor, EventCursor::next)).keep_alive(KeepAlive::default()))
}

/// Walks a session's log, then emits its terminal state once.
struct EventCursor {
    session: Arc<DeploymentSession>,
    changes: watch::Receiver<u64>,
    offset: usize,
    pending: VecDeque<Event>,
    finished: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEvent {
    index: usize,
    stream: LogStream,
    text: String,
    elapsed_ms: u64,
}

impl EventCursor {
    async fn next(mut self) -> Option<(Result<Event, Infallible>, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((Ok(event), self));
            }
            if self.finished {
                return None;
            }

            drop(self.changes.borrow_and_update());
            // State first: lines logged before a terminal transition are
            // then already visible.
            let state = self.session.state();
            let (lines, next) = self.session.lines_since(self.offset);
            self.offset = next;
            self.pending.extend(lines.iter().map(log_event));

            if !self.pending.is_empty() {
                continue;
            }
            if state.is_terminal() {
                self.pending.push_back(json_event("state", &self.session.snapshot()));
                self.finished = true;
                continue;
            }
            if self.changes.changed().await.is_err() {
                self.finished = true;
            }
        }
    }
}

fn log_event(line: &LogLine) -> Event {
    let payload = LogEvent {
        index: line.index,
        stream: line.stream,
        text: terminal_line(&line.text),
        elapsed_ms: line.elapsed_ms,
    };
    json_event("log", &payload).id(line.index.to_string())
}

/// Renders a log line with CRLF endings for terminal clients.
fn terminal_line(text: &str) -> String {
    format!("{}\r\n", text.replace("\r\n", "\n").replace('\n', "\r\n"))
}

fn json_event(name: &str, payload: &impl Serialize) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| String::from("{}"));
    Event::default().event(name).data(data)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::terminal_line;

    #[rstest]
    #[case::plain("ready", "ready\r\n")]
    #[case::bare_newline("one\ntwo", "one\r\ntwo\r\n")]
    #[case::already_crlf("one\r\ntwo", "one\r\ntwo\r\n")]
    #[case::mixed("a\r\nb\nc", "a\r\nb\r\nc\r\n")]
    fn line_endings_become_single_crlf(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(terminal_line(text), expected);
    }
}

//! HTTP client for a running hangar backend.
//!
//! The backend location is an explicit [`BackendUrl`] handed to
//! [`HangarClient::new`]; nothing is read from the environment here.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

use crate::api::{LogPage, PtyInput, PtyOutputPage};
use crate::runner::Utf8StreamDecoder;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors raised by [`HangarClient`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClientError {
    /// The backend URL is malformed.
    #[error("invalid backend URL '{url}': {message}")]
    InvalidUrl {
        /// Rejected input.
        url: String,
        /// Parser message.
        message: String,
    },
    /// The request could not be sent or the body could not be read.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Underlying error.
        message: String,
    },
    /// The backend answered with an error status.
    #[error("backend returned {status} for {url}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
        /// Error message from the body, if any.
        message: String,
    },
    /// Writing to the local output failed.
    #[error("failed to write output: {0}")]
    Output(String),
}

/// Validated base URL of a hangar backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackendUrl(Url);

impl BackendUrl {
    /// Parses an `http` or `https` URL.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] for unparsable input or another
    /// scheme.
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let invalid = |message: String| ClientError::InvalidUrl {
            url: raw.to_owned(),
            message,
        };
        let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid(String::from("missing host")));
        }
        Ok(Self(url))
    }

    fn join(&self, path: &str) -> Result<Url, ClientError> {
        let base = self.0.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}")).map_err(|err| ClientError::InvalidUrl {
            url: format!("{base}{path}"),
            message: err.to_string(),
        })
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Subset of the session snapshot the client acts on.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// State tag, for example `installing` or `failed`.
    pub state: String,
    /// Failure report when `state` is `failed`.
    #[serde(default)]
    pub failure: Option<FailureSummary>,
}

/// Failure fields shown by the client.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    /// Failure category.
    pub kind: String,
    /// Human readable cause.
    pub message: String,
}

impl SessionStatus {
    /// Whether the deployment has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "completed" | "failed")
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Thin JSON client for the backend API.
#[derive(Clone, Debug)]
pub struct HangarClient {
    http: reqwest::Client,
    base: BackendUrl,
}

impl HangarClient {
    /// Creates a client for `base`.
    #[must_use]
    pub fn new(base: BackendUrl) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, base }
    }

    /// The backend this client talks to.
    #[must_use]
    pub const fn base(&self) -> &BackendUrl {
        &self.base
    }

    /// Fetches the session state.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] when the request fails or the session is
    /// unknown.
    pub async fn status(&self, session: Uuid) -> Result<SessionStatus, ClientError> {
        self.get(&format!("/api/deployments/{session}"), &[]).await
    }

    /// Fetches log lines at or after `offset`.
    ///
    /// # Errors
    ///
    /// As for [`HangarClient::status`].
    pub async fn logs(&self, session: Uuid, offset: usize) -> Result<LogPage, ClientError> {
        self.get(
            &format!("/api/deployments/{session}/logs"),
            &[("offset", offset.to_string())],
        )
        .await
    }

    /// Fetches terminal output chunks at or after `offset`.
    ///
    /// # Errors
    ///
    /// As for [`HangarClient::status`].
    pub async fn pty_output(
        &self,
        session: Uuid,
        offset: usize,
    ) -> Result<PtyOutputPage, ClientError> {
        self.get(
            "/api/pty/output",
            &[("sessionId", session.to_string()), ("offset", offset.to_string())],
        )
        .await
    }

    /// Sends keystrokes to the session's terminal.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] with 409 before SSH is connected.
    pub async fn send_pty_input(&self, session: Uuid, bytes: &[u8]) -> Result<(), ClientError> {
        let url = self.base.join("/api/pty/input")?;
        let body = PtyInput {
            session_id: session,
            data_b64: STANDARD.encode(bytes),
        };
        let response = self
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| transport(&url, &err))?;
        check(&url, response).await.map(drop)
    }

    /// Requests cancellation of a running deployment.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] with 409 when the session already
    /// finished.
    pub async fn cancel(&self, session: Uuid) -> Result<(), ClientError> {
        let url = self.base.join(&format!("/api/deployments/{session}/cancel"))?;
        let response = self
            .http
            .post(url.clone())
            .send()
            .await
            .map_err(|err| transport(&url, &err))?;
        check(&url, response).await.map(drop)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = self.base.join(path)?;
        let response = self
            .http
            .get(url.clone())
            .query(query)
            .send()
            .await
            .map_err(|err| transport(&url, &err))?;
        check(&url, response)
            .await?
            .json::<T>()
            .await
            .map_err(|err| transport(&url, &err))
    }
}

fn transport(url: &Url, err: &reqwest::Error) -> ClientError {
    ClientError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    }
}

async fn check(url: &Url, response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<ErrorBody>()
        .await
        .map(|body| body.message)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_owned()
        });
    Err(ClientError::Status {
        status: status.as_u16(),
        url: url.to_string(),
        message,
    })
}

/// Prints log lines from `offset` until the deployment finishes, then
/// returns its final status.
///
/// # Errors
///
/// Returns a [`ClientError`] when polling fails or `out` cannot be written.
pub async fn follow_logs(
    client: &HangarClient,
    session: Uuid,
    mut offset: usize,
    poll_interval: Duration,
    out: &mut impl Write,
) -> Result<SessionStatus, ClientError> {
    loop {
        let status = client.status(session).await?;
        let page = client.logs(session, offset).await?;
        for line in &page.lines {
            writeln!(out, "{}", line.text).map_err(|err| ClientError::Output(err.to_string()))?;
        }
        offset = page.next;
        if status.is_terminal() && page.lines.is_empty() {
            return Ok(status);
        }
        if page.lines.is_empty() {
            sleep(poll_interval).await;
        }
    }
}

/// Copies terminal output from `offset` to `out` until interrupted.
///
/// # Errors
///
/// Returns a [`ClientError`] when polling fails or `out` cannot be written.
pub async fn follow_pty(
    client: &HangarClient,
    session: Uuid,
    mut offset: usize,
    poll_interval: Duration,
    out: &mut impl Write,
) -> Result<(), ClientError> {
    let mut decoder = Utf8StreamDecoder::default();
    loop {
        let page = client.pty_output(session, offset).await?;
        for chunk in &page.chunks {
            let bytes = STANDARD
                .decode(chunk.as_bytes())
                .map_err(|err| ClientError::Output(format!("invalid terminal chunk: {err}")))?;
            let text = decoder.push(&bytes);
            out.write_all(text.as_bytes())
                .and_then(|()| out.flush())
                .map_err(|err| ClientError::Output(err.to_string()))?;
        }
        if page.chunks.is_empty() {
            sleep(poll_interval).await;
        }
        offset = page.next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://127.0.0.1:8787")]
    #[case("https://hangar.example.com/")]
    fn accepts_http_urls(#[case] raw: &str) {
        assert!(BackendUrl::parse(raw).is_ok());
    }

    #[rstest]
    #[case("ftp://example.com")]
    #[case("not a url")]
    #[case("")]
    fn rejects_other_input(#[case] raw: &str) {
        assert!(matches!(
            BackendUrl::parse(raw),
            Err(ClientError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn joins_paths_without_double_slashes() {
        let base =
            BackendUrl::parse("http://localhost:8787/").unwrap_or_else(|err| panic!("{err}"));
        let url = base
            .join("/api/apps")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(url.as_str(), "http://localhost:8787/api/apps");
    }

    #[test]
    fn terminal_states_are_recognised() {
        let parsed: SessionStatus = serde_json::from_str(
            r#"{"state": "failed", "failure": {"kind": "command", "message": "boom",
                "leftoverInstance": null, "logTail": []}, "app": "gitea"}"#,
        )
        .unwrap_or_else(|err| panic!("{err}"));
        assert!(parsed.is_terminal());
        assert_eq!(parsed.failure.map(|failure| failure.kind).as_deref(), Some("command"));
    }
}

//! Shared JSON-over-HTTPS plumbing for REST provider variants.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Credentials, ProviderError, Secret};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// How credentials are attached to a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum AuthStyle {
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// HTTP basic authentication.
    Basic,
    /// A custom header carrying the token.
    Header(&'static str),
}

/// Minimal REST client bound to one provider's API root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct RestClient {
    provider: &'static str,
    base_url: String,
    style: AuthStyle,
}

impl RestClient {
    pub(super) fn new(
        provider: &'static str,
        base_url: impl Into<String>,
        style: AuthStyle,
    ) -> Self {
        Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            style,
        }
    }

    pub(super) fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn auth_error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Auth {
            provider: self.provider.to_owned(),
            message: message.into(),
        }
    }

    fn upstream(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Upstream {
            provider: self.provider.to_owned(),
            message: message.into(),
        }
    }

    fn authorise(
        &self,
        builder: RequestBuilder,
        credentials: &Credentials,
    ) -> Result<RequestBuilder, ProviderError> {
        match (self.style, &credentials.secret) {
            (AuthStyle::Bearer, Secret::Token(token)) => Ok(builder.bearer_auth(token.expose())),
            (AuthStyle::Header(name), Secret::Token(token)) => {
                Ok(builder.header(name, token.expose()))
            }
            (AuthStyle::Basic, Secret::Basic { username, password }) => {
                Ok(builder.basic_auth(username, Some(password.expose())))
            }
            (AuthStyle::Basic, _) => Err(self.auth_error("a username and password are required")),
            (_, _) => Err(self.auth_error("an API token is required")),
        }
    }

    pub(super) async fn get<T>(
        &self,
        credentials: &Credentials,
        path: &str,
    ) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
    {
        self.send::<(), T>(Method::GET, credentials, path, None).await
    }

    pub(super) async fn send<B, T>(
        &self,
        method: Method,
        credentials: &Credentials,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ProviderError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.authorise(HTTP_CLIENT.request(method.clone(), &url), credentials)?;
        if let Some(payload) = body {
            builder = builder.json(payload);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| self.upstream(format!("{method} {path}: {err}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| self.upstream(format!("{method} {path}: {err}")))?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(self.auth_error(format!("{method} {path} returned {status}")));
        }
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(self.upstream(format!(
                "{method} {path} returned {status}: {}",
                text.trim()
            )));
        }

        let document: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        serde_json::from_slice(document)
            .map_err(|err| self.upstream(format!("{method} {path}: unexpected response: {err}")))
    }
}

/// Re-labels an upstream failure of a mutating call as a provisioning
/// failure. Authentication errors keep their kind.
pub(super) fn as_provision_error(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::Upstream { provider, message } => {
            ProviderError::Provision { provider, message }
        }
        other => other,
    }
}

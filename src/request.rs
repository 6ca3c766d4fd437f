//! Turns a wizard submission into an immutable deployment request.
//!
//! Validation happens in two steps. [`DeploymentSubmission::prepare`] checks
//! the submission against the catalog without touching the network;
//! [`PreparedRequest::finish`] attaches the resolved credentials and the
//! generated key pair once those exist.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{App, Catalog};
use crate::hostname::{hostname_or_default, sanitize_domain};
use crate::provider::Credentials;
use crate::selector::Specs;
use crate::session::SessionInfo;
use crate::ssh::keys::KeyPair;

/// Raw deployment form as posted by the wizard.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSubmission {
    /// Catalog app name.
    pub app: String,
    /// Provider registry name.
    pub provider: String,
    /// Region or zone slug.
    pub region: String,
    /// Display hostname; sanitised, with a generated fallback.
    #[serde(default)]
    pub hostname: String,
    /// Optional public domain for DNS and TLS.
    #[serde(default)]
    pub domain: Option<String>,
    /// Answers keyed by question id.
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    /// Optional hardware overrides; they only raise the app minimums.
    #[serde(default)]
    pub specs: Option<Specs>,
}

/// Reasons a submission is rejected before anything is provisioned.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// The app is not in the catalog.
    #[error("unknown app '{0}'")]
    UnknownApp(String),
    /// The provider is not in the catalog.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    /// No region was chosen.
    #[error("a region is required")]
    MissingRegion,
    /// An answer failed validation.
    #[error("{0}")]
    InvalidAnswer(String),
    /// The domain does not sanitise to at least two labels.
    #[error("'{0}' is not a usable domain name")]
    InvalidDomain(String),
}

/// A catalog-validated submission awaiting credentials and keys.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PreparedRequest {
    /// Session identifier allocated for the deployment.
    pub session_id: Uuid,
    /// Catalog entry of the chosen app.
    pub app: App,
    /// Provider registry name.
    pub provider: String,
    /// Region or zone slug.
    pub region: String,
    /// Sanitised hostname.
    pub hostname: String,
    /// Sanitised domain.
    pub domain: Option<String>,
    /// Answers with defaults applied.
    pub answers: BTreeMap<String, String>,
    /// Hardware minimums for size selection.
    pub specs: Specs,
}

impl DeploymentSubmission {
    /// Validates the submission against `catalog`.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] naming the first invalid field.
    pub fn prepare(
        &self,
        catalog: &Catalog,
        session_id: Uuid,
    ) -> Result<PreparedRequest, RequestError> {
        let app = catalog
            .app(self.app.trim())
            .ok_or_else(|| RequestError::UnknownApp(self.app.clone()))?;
        let provider = self.provider.trim();
        if catalog.provider(provider).is_none() {
            return Err(RequestError::UnknownProvider(self.provider.clone()));
        }
        let region = self.region.trim();
        if region.is_empty() {
            return Err(RequestError::MissingRegion);
        }
        let answers = app
            .resolve_answers(&self.answers)
            .map_err(RequestError::InvalidAnswer)?;
        let domain = match self.domain.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                sanitize_domain(raw).ok_or_else(|| RequestError::InvalidDomain(raw.to_owned()))?,
            ),
        };

        Ok(PreparedRequest {
            session_id,
            app: app.clone(),
            provider: provider.to_owned(),
            region: region.to_owned(),
            hostname: hostname_or_default(&self.hostname, &session_id),
            domain,
            answers,
            specs: Specs::for_app(app, self.specs.as_ref()),
        })
    }
}

impl PreparedRequest {
    /// Session metadata shown to clients.
    #[must_use]
    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            app: self.app.name.clone(),
            provider: self.provider.clone(),
            region: self.region.clone(),
            hostname: self.hostname.clone(),
            domain: self.domain.clone(),
        }
    }

    /// Completes the request with credentials and the deployment key pair.
    #[must_use]
    pub fn finish(self, credentials: Credentials, key_pair: KeyPair) -> DeploymentRequest {
        DeploymentRequest {
            session_id: self.session_id,
            app: self.app,
            provider: self.provider,
            region: self.region,
            hostname: self.hostname,
            domain: self.domain,
            answers: self.answers,
            specs: self.specs,
            credentials,
            key_pair,
        }
    }
}

/// Everything the orchestrator needs for one deployment.
///
/// The concrete size is resolved by the orchestrator's selection stage and
/// recorded on the session, not here. `Debug` output never contains the
/// credential secret.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentRequest {
    /// Session identifier.
    pub session_id: Uuid,
    /// Catalog entry of the chosen app.
    pub app: App,
    /// Provider registry name.
    pub provider: String,
    /// Region or zone slug.
    pub region: String,
    /// Sanitised hostname.
    pub hostname: String,
    /// Sanitised domain.
    pub domain: Option<String>,
    /// Answers with defaults applied.
    pub answers: BTreeMap<String, String>,
    /// Hardware minimums.
    pub specs: Specs,
    /// Resolved provider credentials.
    pub credentials: Credentials,
    /// Per-deployment SSH key pair.
    pub key_pair: KeyPair,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn catalog() -> Catalog {
        Catalog::builtin().unwrap_or_else(|err| panic!("catalog: {err}"))
    }

    fn submission() -> DeploymentSubmission {
        DeploymentSubmission {
            app: String::from("gitea"),
            provider: String::from("digitalocean"),
            region: String::from("ams3"),
            hostname: String::from("My Git Server"),
            domain: Some(String::from("Git.Example.com")),
            answers: BTreeMap::new(),
            specs: None,
        }
    }

    #[rstest]
    fn valid_submission_is_normalised(catalog: Catalog) {
        let prepared = submission()
            .prepare(&catalog, Uuid::nil())
            .unwrap_or_else(|err| panic!("prepare: {err}"));

        assert_eq!(prepared.hostname, "my-git-server");
        assert_eq!(prepared.domain.as_deref(), Some("git.example.com"));
        assert_eq!(prepared.answers.get("ssh_port").map(String::as_str), Some("2222"));
        assert_eq!(prepared.specs.cpus, 1);
    }

    #[rstest]
    fn empty_hostname_gets_generated_label(catalog: Catalog) {
        let prepared = DeploymentSubmission {
            hostname: String::from("!!!"),
            ..submission()
        }
        .prepare(&catalog, Uuid::nil())
        .unwrap_or_else(|err| panic!("prepare: {err}"));
        assert_eq!(prepared.hostname, "hangar-00000000");
    }

    #[rstest]
    #[case::unknown_app(
        DeploymentSubmission { app: String::from("nope"), ..submission() },
        RequestError::UnknownApp(String::from("nope"))
    )]
    #[case::unknown_provider(
        DeploymentSubmission { provider: String::from("nope"), ..submission() },
        RequestError::UnknownProvider(String::from("nope"))
    )]
    #[case::missing_region(
        DeploymentSubmission { region: String::from("  "), ..submission() },
        RequestError::MissingRegion
    )]
    #[case::bad_domain(
        DeploymentSubmission { domain: Some(String::from("localhost")), ..submission() },
        RequestError::InvalidDomain(String::from("localhost"))
    )]
    fn invalid_submissions_are_rejected(
        catalog: Catalog,
        #[case] input: DeploymentSubmission,
        #[case] expected: RequestError,
    ) {
        assert_eq!(input.prepare(&catalog, Uuid::nil()), Err(expected));
    }

    #[rstest]
    fn answer_errors_are_reported(catalog: Catalog) {
        let mut answers = BTreeMap::new();
        answers.insert(String::from("ssh_port"), String::from("twenty-two"));
        let err = DeploymentSubmission {
            answers,
            ..submission()
        }
        .prepare(&catalog, Uuid::nil())
        .expect_err("not a number");
        assert!(matches!(err, RequestError::InvalidAnswer(_)), "{err}");
    }

    #[test]
    fn submission_parses_camel_case_json() {
        let raw = r#"{"app": "uptime-kuma", "provider": "vultr", "region": "fra",
                      "specs": {"memoryMb": 4096}}"#;
        let parsed: DeploymentSubmission =
            serde_json::from_str(raw).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(parsed.specs.map(|specs| specs.memory_mb), Some(4096));
        assert!(parsed.domain.is_none());
    }
}

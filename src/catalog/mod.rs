//! Built-in catalog of deployable apps and supported providers.
//!
//! The catalog is parsed once at start-up, either from the embedded document
//! or from an override file, and is read-only afterwards.

use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files;

const BUILTIN_CATALOG: &str = include_str!("catalog.json");

/// Input type of a wizard question.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionKind {
    /// `true` or `false`.
    Boolean,
    /// Free text.
    Text,
    /// Free text that must never be echoed back.
    Password,
    /// One of a fixed set of options.
    Choice,
    /// A non-negative integer.
    Number,
}

/// A selectable option of a [`QuestionKind::Choice`] question.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChoiceOption {
    /// Label shown to the user.
    pub name: String,
    /// Value substituted into install commands.
    pub value: String,
    /// Whether the option is preselected.
    #[serde(default)]
    pub default: bool,
}

/// An app-specific question asked by the wizard.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WizardQuestion {
    /// Identifier used in `{{answer.<id>}}` placeholders.
    pub id: String,
    /// Prompt shown to the user.
    pub name: String,
    /// Input type.
    pub kind: QuestionKind,
    /// Whether an answer (or default) must be present.
    #[serde(default)]
    pub required: bool,
    /// Value used when no answer is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Options for choice questions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ChoiceOption>,
}

impl WizardQuestion {
    /// Returns the value used when the user gives no answer.
    #[must_use]
    pub fn default_value(&self) -> Option<&str> {
        if let Some(value) = self.default.as_deref() {
            return Some(value);
        }
        self.options
            .iter()
            .find(|option| option.default)
            .map(|option| option.value.as_str())
    }

    /// Validates an answer, falling back to the default, and returns the
    /// effective value.
    ///
    /// Optional questions with no answer and no default resolve to an empty
    /// string.
    ///
    /// # Errors
    ///
    /// Returns a message naming the question when a required answer is
    /// missing or the answer does not match the question's kind.
    pub fn resolve_answer(&self, answer: Option<&str>) -> Result<String, String> {
        let given = answer.map(str::trim).filter(|value| !value.is_empty());
        let Some(value) = given.or_else(|| self.default_value()) else {
            if self.required {
                return Err(format!("question '{}' requires an answer", self.id));
            }
            return Ok(String::new());
        };

        match self.kind {
            QuestionKind::Boolean => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(String::from("true")),
                "false" | "no" | "0" => Ok(String::from("false")),
                _ => Err(format!("question '{}' expects true or false", self.id)),
            },
            QuestionKind::Number => value
                .parse::<u64>()
                .map(|number| number.to_string())
                .map_err(|_| format!("question '{}' expects a whole number", self.id)),
            QuestionKind::Choice => self
                .options
                .iter()
                .find(|option| option.value == value)
                .map(|option| option.value.clone())
                .ok_or_else(|| format!("question '{}' has no option '{value}'", self.id)),
            QuestionKind::Text | QuestionKind::Password => Ok(value.to_owned()),
        }
    }
}

/// A deployable self-hosted application.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Unique app name.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Minimum vCPU count.
    pub min_cpus: u32,
    /// Minimum memory in megabytes.
    pub min_memory_mb: u64,
    /// Minimum disk in gigabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_disk_gb: Option<u32>,
    /// Suggested subdomain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_hint: Option<String>,
    /// Port the app listens on locally, behind the TLS proxy.
    pub http_port: u16,
    /// App-specific wizard questions.
    #[serde(default)]
    pub questions: Vec<WizardQuestion>,
    /// Install command templates run in order over SSH.
    #[serde(default, skip_serializing)]
    pub install: Vec<String>,
}

impl App {
    /// Resolves every question against the submitted answers.
    ///
    /// # Errors
    ///
    /// Returns the first answer error, or an error naming answers that match
    /// no question.
    pub fn resolve_answers(
        &self,
        answers: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, String> {
        if let Some(unknown) = answers
            .keys()
            .find(|id| !self.questions.iter().any(|question| &question.id == *id))
        {
            return Err(format!("app '{}' has no question '{unknown}'", self.name));
        }

        self.questions
            .iter()
            .map(|question| {
                question
                    .resolve_answer(answers.get(&question.id).map(String::as_str))
                    .map(|value| (question.id.clone(), value))
            })
            .collect()
    }
}

/// A supported cloud provider.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    /// Registry key.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Whether the provider needs configuration beyond a credential.
    #[serde(default)]
    pub needs_configuration: bool,
}

/// Errors raised while loading the catalog.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CatalogError {
    /// The override file could not be read.
    #[error("failed to read catalog {path}: {message}")]
    Read {
        /// File that failed.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// The document is not valid catalog JSON.
    #[error("catalog is not valid JSON: {0}")]
    Parse(String),
    /// The document parsed but is inconsistent.
    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// The app and provider catalog.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Catalog {
    /// Deployable apps.
    pub apps: Vec<App>,
    /// Supported providers.
    pub providers: Vec<ProviderInfo>,
}

impl Catalog {
    /// Parses the embedded catalog.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the embedded document is inconsistent.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Loads the catalog from `path`, or the embedded one when `path` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the file is unreadable or invalid.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, CatalogError> {
        let Some(file) = path else {
            return Self::builtin();
        };
        let raw = files::read_to_string(file).map_err(|message| CatalogError::Read {
            path: file.to_string(),
            message,
        })?;
        Self::from_json(&raw)
    }

    /// Parses and validates a catalog document.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Parse`] for malformed JSON and
    /// [`CatalogError::Invalid`] for duplicate names or question ids, choice
    /// questions without options, and apps without install commands.
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let catalog: Self =
            serde_json::from_str(raw).map_err(|err| CatalogError::Parse(err.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Looks up an app by name.
    #[must_use]
    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.name == name)
    }

    /// Looks up a provider by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderInfo> {
        self.providers.iter().find(|provider| provider.name == name)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        let mut app_names = BTreeSet::new();
        for app in &self.apps {
            if !app_names.insert(app.name.as_str()) {
                return Err(CatalogError::Invalid(format!("duplicate app '{}'", app.name)));
            }
            if app.install.is_empty() {
                return Err(CatalogError::Invalid(format!(
                    "app '{}' has no install commands",
                    app.name
                )));
            }
            Self::validate_questions(app)?;
        }

        let mut provider_names = BTreeSet::new();
        for provider in &self.providers {
            if !provider_names.insert(provider.name.as_str()) {
                return Err(CatalogError::Invalid(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    fn validate_questions(app: &App) -> Result<(), CatalogError> {
        let mut ids = BTreeSet::new();
        for question in &app.questions {
            if !ids.insert(question.id.as_str()) {
                return Err(CatalogError::Invalid(format!(
                    "app '{}' repeats question '{}'",
                    app.name, question.id
                )));
            }
            if question.kind == QuestionKind::Choice && question.options.is_empty() {
                return Err(CatalogError::Invalid(format!(
                    "choice question '{}' of app '{}' has no options",
                    question.id, app.name
                )));
            }
        }
        Ok(())
    }
}

//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `hangar.toml` (found through the standard discovery
//! search or `HANGAR_CONFIG_PATH`), and `HANGAR_*` environment variables.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::files;
use crate::provider::TerraformSettings;
use crate::ssh::SshSettings;

/// Process-wide settings for the hangar backend.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HANGAR",
    discovery(
        app_name = "hangar",
        env_var = "HANGAR_CONFIG_PATH",
        config_file_name = "hangar.toml",
        dotfile_name = ".hangar.toml",
        project_file_name = "hangar.toml"
    )
)]
pub struct HangarConfig {
    /// Address the HTTP API binds to.
    #[ortho_config(default = "127.0.0.1:8787".to_owned())]
    pub listen_addr: String,
    /// Root for per-deployment working files (Terraform state, SSH control
    /// sockets). Supports `~/`.
    #[ortho_config(default = "~/.local/state/hangar".to_owned())]
    pub state_dir: String,
    /// Directory receiving one generated key pair per deployment.
    #[ortho_config(default = "~/.local/state/hangar/keys".to_owned())]
    pub key_dir: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keygen` executable.
    #[ortho_config(default = "ssh-keygen".to_owned())]
    pub ssh_keygen_bin: String,
    /// Login user on provisioned instances.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Path to the `terraform` executable.
    #[ortho_config(default = "terraform".to_owned())]
    pub terraform_bin: String,
    /// Directory holding one Terraform module per Terraform-backed provider.
    #[ortho_config(default = "terraform".to_owned())]
    pub terraform_modules_dir: String,
    /// Catalog file replacing the built-in catalog.
    pub catalog_path: Option<String>,
    /// Upper bound on waiting for a new instance to answer on SSH.
    #[ortho_config(default = 600)]
    pub provision_timeout_secs: u64,
    /// Timeout of each individual SSH connection attempt.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u64,
    /// Upper bound on waiting for certificate issuance.
    #[ortho_config(default = 300)]
    pub tls_timeout_secs: u64,
    /// DigitalOcean API token.
    pub digitalocean_token: Option<String>,
    /// Vultr API key.
    pub vultr_api_key: Option<String>,
    /// UpCloud API user name.
    pub upcloud_username: Option<String>,
    /// UpCloud API password.
    pub upcloud_password: Option<String>,
    /// Scaleway secret key.
    pub scaleway_secret_key: Option<String>,
    /// Scaleway project identifier.
    pub scaleway_project_id: Option<String>,
    /// Google Cloud service-account key file.
    pub gcp_credentials_file: Option<String>,
    /// Google Cloud project identifier.
    pub gcp_project: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to hangar.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: impl std::fmt::Display) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {} ({}): {reason}",
            self.description, self.env_var
        ))
    }
}

impl HangarConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hangar")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(metadata.invalid("must be greater than zero"));
        }
        Ok(())
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty required values and
    /// [`ConfigError::Invalid`] for malformed ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let listen = FieldMetadata::new("listen address", "HANGAR_LISTEN_ADDR", "listen_addr");
        Self::require(&self.listen_addr, &listen)?;
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|err| listen.invalid(err))?;

        Self::require(
            &self.state_dir,
            &FieldMetadata::new("state directory", "HANGAR_STATE_DIR", "state_dir"),
        )?;
        Self::require(
            &self.key_dir,
            &FieldMetadata::new("key directory", "HANGAR_KEY_DIR", "key_dir"),
        )?;
        Self::require(
            &self.ssh_bin,
            &FieldMetadata::new("ssh executable", "HANGAR_SSH_BIN", "ssh_bin"),
        )?;
        Self::require(
            &self.ssh_keygen_bin,
            &FieldMetadata::new("ssh-keygen executable", "HANGAR_SSH_KEYGEN_BIN", "ssh_keygen_bin"),
        )?;
        Self::require(
            &self.ssh_user,
            &FieldMetadata::new("SSH login user", "HANGAR_SSH_USER", "ssh_user"),
        )?;
        Self::require_positive(
            self.provision_timeout_secs,
            &FieldMetadata::new(
                "provision timeout",
                "HANGAR_PROVISION_TIMEOUT_SECS",
                "provision_timeout_secs",
            ),
        )?;
        Self::require_positive(
            self.ssh_connect_timeout_secs,
            &FieldMetadata::new(
                "SSH connect timeout",
                "HANGAR_SSH_CONNECT_TIMEOUT_SECS",
                "ssh_connect_timeout_secs",
            ),
        )?;
        Self::require_positive(
            self.tls_timeout_secs,
            &FieldMetadata::new("TLS timeout", "HANGAR_TLS_TIMEOUT_SECS", "tls_timeout_secs"),
        )?;
        if let Some(path) = &self.catalog_path {
            Self::require(
                path,
                &FieldMetadata::new("catalog path", "HANGAR_CATALOG_PATH", "catalog_path"),
            )?;
        }
        if self.upcloud_username.is_some() != self.upcloud_password.is_some() {
            return Err(ConfigError::Invalid(String::from(
                "UpCloud credentials need both HANGAR_UPCLOUD_USERNAME and HANGAR_UPCLOUD_PASSWORD",
            )));
        }
        Ok(())
    }

    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the address does not parse.
    pub fn listen_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr.parse().map_err(|err| {
            FieldMetadata::new("listen address", "HANGAR_LISTEN_ADDR", "listen_addr").invalid(err)
        })
    }

    /// State directory with `~/` expanded.
    #[must_use]
    pub fn state_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(files::expand_tilde(&self.state_dir))
    }

    /// Key directory with `~/` expanded.
    #[must_use]
    pub fn key_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(files::expand_tilde(&self.key_dir))
    }

    /// Catalog override with `~/` expanded.
    #[must_use]
    pub fn catalog_path(&self) -> Option<Utf8PathBuf> {
        self.catalog_path
            .as_deref()
            .map(|path| Utf8PathBuf::from(files::expand_tilde(path)))
    }

    /// Reachability wait bound.
    #[must_use]
    pub const fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    /// Certificate issuance wait bound.
    #[must_use]
    pub const fn tls_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_timeout_secs)
    }

    /// SSH client settings; control sockets live under the state directory.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            control_dir: self.state_dir().join("ssh"),
            connect_timeout: Duration::from_secs(self.ssh_connect_timeout_secs),
            control_persist: self.provision_timeout(),
        }
    }

    /// Terraform locations for Terraform-backed providers.
    #[must_use]
    pub fn terraform_settings(&self) -> TerraformSettings {
        TerraformSettings {
            terraform_bin: self.terraform_bin.clone(),
            modules_dir: Utf8PathBuf::from(files::expand_tilde(&self.terraform_modules_dir)),
            state_dir: self.state_dir(),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

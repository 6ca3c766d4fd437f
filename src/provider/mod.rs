//! Provider abstraction for provisioning compute instances.
//!
//! Each cloud is one variant implementing [`Provider`]. Variants are looked up
//! by name through the [`ProviderRegistry`]; the orchestrator never depends on
//! a concrete cloud type.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod auth;
pub mod digitalocean;
mod http;
pub mod reachability;
pub mod registry;
pub mod scaleway;
pub mod terraform;
pub mod upcloud;
pub mod vultr;

pub use auth::{AuthChain, AuthSource};
pub use digitalocean::DigitalOcean;
pub use registry::ProviderRegistry;
pub use scaleway::Scaleway;
pub use terraform::{Terraform, TerraformCatalog, TerraformSettings};
pub use upcloud::UpCloud;
pub use vultr::Vultr;

/// TCP port probed for SSH reachability.
pub const SSH_PORT: u16 = 22;

/// A provider region or zone.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Region {
    /// Human readable name.
    pub name: String,
    /// Identifier passed back to the provider.
    pub slug: String,
    /// Whether new instances can be created there.
    pub available: bool,
}

/// An instance size offered by a provider.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Size {
    /// Identifier passed back to the provider.
    pub slug: String,
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Virtual CPU count.
    pub vcpus: u32,
    /// Root disk in gigabytes.
    pub disk_gb: u32,
    /// Monthly network transfer allowance in terabytes, when published.
    pub transfer_tb: Option<f64>,
    /// Monthly price in USD or EUR, when published.
    pub price_monthly: Option<f64>,
    /// Hourly price, when published.
    pub price_hourly: Option<f64>,
    /// Regions offering the size; empty means "not reported".
    pub regions: Vec<String>,
}

impl Size {
    /// Returns the monthly price when it is known and nonzero.
    #[must_use]
    pub fn known_monthly_price(&self) -> Option<f64> {
        self.price_monthly
            .filter(|price| price.is_finite() && *price > 0.0)
    }

    /// Returns `true` when the provider reports the size in `region`, or does
    /// not report region availability at all.
    #[must_use]
    pub fn offered_in(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|slug| slug == region)
    }
}

/// Lifecycle of a provisioned instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceStatus {
    /// Created but not yet reachable.
    Provisioning,
    /// Running and accepting SSH connections.
    Ready,
    /// Running according to the provider but not answering on SSH.
    Unreachable,
    /// Stopped, deleted, or failed.
    Terminated,
}

/// A provisioned instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Provider identifier.
    pub id: String,
    /// Public address once assigned.
    pub public_ip: Option<IpAddr>,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Region or zone the instance lives in.
    pub region: String,
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.public_ip {
            Some(ip) => write!(f, "{} ({ip}) in {}", self.id, self.region),
            None => write!(f, "{} in {}", self.id, self.region),
        }
    }
}

/// Parameters for the single mutating provider call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Sanitised hostname, also used as the instance label.
    pub name: String,
    /// Target region or zone.
    pub region: String,
    /// Size slug chosen by the selector.
    pub size: String,
    /// OpenSSH public key authorised for the login user.
    pub ssh_public_key: String,
    /// Tags applied to the instance.
    pub tags: Vec<String>,
}

/// DNS A record requested after installation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DnsRecord {
    /// Zone managed by the provider (for example `example.com`).
    pub zone: String,
    /// Record name relative to the zone; `@` for the apex.
    pub name: String,
    /// Address the record points at.
    pub address: IpAddr,
    /// Record TTL in seconds.
    pub ttl: u32,
}

impl DnsRecord {
    /// Splits a fully qualified domain into zone and relative name.
    ///
    /// `app.example.com` yields zone `example.com` and name `app`; a bare
    /// `example.com` yields the apex record `@`.
    #[must_use]
    pub fn for_domain(domain: &str, address: IpAddr) -> Self {
        let labels: Vec<&str> = domain.split('.').collect();
        let split_at = labels.len().saturating_sub(2);
        let (name_labels, zone_labels) = labels.split_at(split_at);
        let name = if name_labels.is_empty() {
            String::from("@")
        } else {
            name_labels.join(".")
        };
        Self {
            zone: zone_labels.join("."),
            name,
            address,
            ttl: 300,
        }
    }
}

/// A secret value whose `Debug` and `Display` output is redacted.
#[derive(Clone, Eq, PartialEq)]
pub struct SecretString(String);

impl SecretString {
    /// Wraps a secret.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret for use in an outgoing request.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(<redacted>)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Credential material understood by the provider variants.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Secret {
    /// Bearer token or API key.
    Token(SecretString),
    /// Username and password pair.
    Basic {
        /// Account user name.
        username: String,
        /// Account password.
        password: SecretString,
    },
    /// Path to a service-account key file.
    ServiceAccountFile(Utf8PathBuf),
}

/// Where a credential was found.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialSource {
    /// Configured explicitly for hangar.
    Explicit,
    /// Found in the process environment or a well-known default file.
    Ambient,
    /// Printed by a locally configured provider CLI.
    CliToken,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Explicit => "explicit configuration",
            Self::Ambient => "ambient credentials",
            Self::CliToken => "provider CLI",
        })
    }
}

/// Resolved credentials for one provider. Never logged in plaintext.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    /// The secret material.
    pub secret: Secret,
    /// Where the secret came from.
    pub source: CredentialSource,
}

impl Credentials {
    /// Returns the bearer token, or an auth error when the credential is of
    /// another kind.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Auth`] for non-token credentials.
    pub fn token(&self, provider: &str) -> Result<&str, ProviderError> {
        match &self.secret {
            Secret::Token(token) => Ok(token.expose()),
            _ => Err(ProviderError::Auth {
                provider: provider.to_owned(),
                message: String::from("an API token is required"),
            }),
        }
    }
}

/// Errors raised by provider variants.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// No credential source resolved.
    #[error("{provider}: credentials not found ({message})")]
    Auth {
        /// Provider name.
        provider: String,
        /// Which sources were tried.
        message: String,
    },
    /// The provider API or network failed.
    #[error("{provider} API unavailable: {message}")]
    Upstream {
        /// Provider name.
        provider: String,
        /// Underlying failure.
        message: String,
    },
    /// The provider rejected or failed the create call.
    #[error("{provider} could not create the instance: {message}")]
    Provision {
        /// Provider name.
        provider: String,
        /// Underlying failure.
        message: String,
    },
    /// The instance did not become reachable in time.
    #[error("instance {instance_id} was not reachable within {} seconds", .waited.as_secs())]
    ProvisionTimeout {
        /// Provider identifier of the instance.
        instance_id: String,
        /// How long the wait lasted.
        waited: Duration,
    },
    /// The provider reports the instance in a terminal state.
    #[error("instance {instance_id} entered terminal state {state}")]
    InstanceFailed {
        /// Provider identifier of the instance.
        instance_id: String,
        /// State reported by the provider.
        state: String,
    },
    /// The variant does not implement the capability.
    #[error("{provider} does not support {capability}")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Missing capability.
        capability: String,
    },
    /// A request field is missing or malformed.
    #[error("invalid provider request: {0}")]
    Validation(String),
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Uniform capability interface over each cloud.
///
/// `create_instance` is the only mutating call. Implementations never retry it;
/// retry policy belongs to the caller.
pub trait Provider: Send + Sync {
    /// Registry key, matching the catalog provider name.
    fn name(&self) -> &str;

    /// Resolves credentials from explicit configuration, then ambient
    /// credentials, then a locally configured CLI.
    fn resolve_auth(&self) -> ProviderFuture<'_, Credentials>;

    /// Lists regions where instances may be created.
    fn list_regions<'a>(&'a self, credentials: &'a Credentials) -> ProviderFuture<'a, Vec<Region>>;

    /// Lists sizes, optionally scoped to one region.
    fn list_sizes<'a>(
        &'a self,
        credentials: &'a Credentials,
        region: Option<&'a str>,
    ) -> ProviderFuture<'a, Vec<Size>>;

    /// Creates an instance, returning it in the `Provisioning` state.
    fn create_instance<'a>(
        &'a self,
        credentials: &'a Credentials,
        spec: &'a InstanceSpec,
    ) -> ProviderFuture<'a, Instance>;

    /// Polls until the instance accepts TCP connections on port 22, the
    /// timeout expires, or the provider reports a terminal error.
    fn wait_reachable<'a>(
        &'a self,
        credentials: &'a Credentials,
        instance: &'a Instance,
        timeout: Duration,
    ) -> ProviderFuture<'a, Instance>;

    /// Whether [`Provider::create_dns_record`] is implemented.
    fn supports_dns(&self) -> bool {
        false
    }

    /// Creates an A record in a zone hosted by the provider.
    fn create_dns_record<'a>(
        &'a self,
        credentials: &'a Credentials,
        record: &'a DnsRecord,
    ) -> ProviderFuture<'a, ()> {
        let _ = (credentials, record);
        Box::pin(async move {
            Err(ProviderError::Unsupported {
                provider: self.name().to_owned(),
                capability: String::from("DNS records"),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn dns_record_splits_subdomain() {
        let record = DnsRecord::for_domain("cloud.example.com", IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(record.zone, "example.com");
        assert_eq!(record.name, "cloud");
    }

    #[test]
    fn dns_record_uses_apex_for_bare_zone() {
        let record = DnsRecord::for_domain("example.com", IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(record.zone, "example.com");
        assert_eq!(record.name, "@");
    }

    #[test]
    fn secret_debug_is_redacted() {
        let creds = Credentials {
            secret: Secret::Token(SecretString::new("dop_v1_topsecret")),
            source: CredentialSource::Explicit,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("topsecret"), "leaked: {rendered}");
    }

    #[test]
    fn zero_price_is_unknown() {
        let size = Size {
            slug: String::from("s"),
            memory_mb: 1024,
            vcpus: 1,
            disk_gb: 25,
            transfer_tb: None,
            price_monthly: Some(0.0),
            price_hourly: None,
            regions: Vec::new(),
        };
        assert_eq!(size.known_monthly_price(), None);
        assert!(size.offered_in("anywhere"));
    }
}

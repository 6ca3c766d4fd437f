//! Scaleway instances through `scaleway-rs` and the Instances REST API.
//!
//! Instances are created stopped so the cloud-init user-data carrying the
//! deployment key is in place before first boot, then powered on. Scaleway has
//! no per-project DNS API hangar can rely on, so DNS is unsupported.

use std::collections::BTreeMap;
use std::env;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::Method;
use scaleway_rs::{ScalewayApi, ScalewayImage, ScalewayListInstanceImagesBuilder};
use serde::{Deserialize, Serialize};

use super::http::{AuthStyle, HTTP_CLIENT, RestClient, as_provision_error};
use super::reachability::{ReachabilityPolicy, wait_until_reachable};
use super::{
    AuthChain, AuthSource, Credentials, Instance, InstanceSpec, InstanceStatus, Provider,
    ProviderError, ProviderFuture, Region, Secret, SecretString, Size,
};
use crate::files;
use crate::runner::CommandRunner;

const NAME: &str = "scaleway";
const API_BASE: &str = "https://api.scaleway.com/instance/v1";
const CLI_CONFIG: &str = "~/.config/scw/config.yaml";
const IMAGE_LABEL: &str = "ubuntu_noble";
const ARCHITECTURE: &str = "x86_64";
const USER_DATA_KEY: &str = "cloud-init";

const ZONES: [(&str, &str); 8] = [
    ("fr-par-1", "Paris 1"),
    ("fr-par-2", "Paris 2"),
    ("fr-par-3", "Paris 3"),
    ("nl-ams-1", "Amsterdam 1"),
    ("nl-ams-2", "Amsterdam 2"),
    ("nl-ams-3", "Amsterdam 3"),
    ("pl-waw-1", "Warsaw 1"),
    ("pl-waw-2", "Warsaw 2"),
];

#[derive(Deserialize)]
struct ProductsPage {
    servers: BTreeMap<String, ApiProduct>,
}

#[derive(Deserialize)]
struct ApiProduct {
    ncpus: u32,
    /// Bytes.
    ram: u64,
    #[serde(default)]
    monthly_price: Option<f64>,
    #[serde(default)]
    hourly_price: Option<f64>,
    #[serde(default)]
    arch: Option<String>,
    #[serde(default)]
    volumes_constraint: Option<VolumeConstraint>,
}

#[derive(Deserialize)]
struct VolumeConstraint {
    /// Bytes.
    #[serde(default)]
    max_size: u64,
}

#[derive(Serialize)]
struct NewServer<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: &'a [String],
    stopped: bool,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: scaleway_rs::ScalewayInstance,
}

const fn bytes_to_mebibytes(bytes: u64) -> u64 {
    bytes >> 20
}

fn bytes_to_gibibytes(bytes: u64) -> u32 {
    u32::try_from(bytes >> 30).unwrap_or(u32::MAX)
}

fn cloud_config(public_key: &str) -> String {
    format!("#cloud-config\nssh_authorized_keys:\n  - {}\n", public_key.trim())
}

fn to_instance(server: scaleway_rs::ScalewayInstance, zone: &str) -> Instance {
    let status = match server.state.as_str() {
        "running" => InstanceStatus::Unreachable,
        "stopped in place" | "locked" => InstanceStatus::Terminated,
        _ => InstanceStatus::Provisioning,
    };
    let public_ip = server
        .public_ip
        .as_ref()
        .and_then(|ip| ip.address.parse::<IpAddr>().ok());
    Instance {
        id: server.id,
        public_ip,
        status,
        region: zone.to_owned(),
    }
}

fn upstream(message: impl std::fmt::Display) -> ProviderError {
    ProviderError::Upstream {
        provider: NAME.to_owned(),
        message: message.to_string(),
    }
}

fn newest_available(images: Vec<ScalewayImage>) -> Option<String> {
    images
        .into_iter()
        .filter(|image| image.arch == ARCHITECTURE && image.state == "available")
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
}

/// Scaleway provider.
pub struct Scaleway {
    api: RestClient,
    base_url: String,
    auth: AuthChain,
    project_id: Option<String>,
    runner: Arc<dyn CommandRunner>,
    policy: ReachabilityPolicy,
}

impl Scaleway {
    /// Creates the provider from optionally configured secret key and project.
    #[must_use]
    pub fn new(
        secret_key: Option<String>,
        project_id: Option<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let explicit = secret_key.map(|value| Secret::Token(SecretString::new(value)));
        Self {
            api: RestClient::new(NAME, API_BASE, AuthStyle::Header("X-Auth-Token")),
            base_url: API_BASE.to_owned(),
            auth: AuthChain::new(
                NAME,
                vec![
                    AuthSource::Explicit(explicit),
                    AuthSource::EnvToken("SCW_SECRET_KEY"),
                    AuthSource::ConfigFileKey {
                        path: String::from(CLI_CONFIG),
                        key: "secret_key",
                    },
                ],
            ),
            project_id,
            runner,
            policy: ReachabilityPolicy::default(),
        }
    }

    /// Overrides the reachability polling policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ReachabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn project(&self) -> Result<String, ProviderError> {
        if let Some(project) = self.project_id.as_ref().filter(|id| !id.trim().is_empty()) {
            return Ok(project.trim().to_owned());
        }
        if let Ok(project) = env::var("SCW_DEFAULT_PROJECT_ID")
            && !project.trim().is_empty()
        {
            return Ok(project.trim().to_owned());
        }
        let path = Utf8PathBuf::from(files::expand_tilde(CLI_CONFIG));
        files::read_to_string(&path)
            .ok()
            .and_then(|raw| {
                raw.lines().find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    (key.trim() == "default_project_id")
                        .then(|| value.trim().trim_matches('"').to_owned())
                })
            })
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ProviderError::Validation(String::from(
                    "a Scaleway project id is required (scaleway_project_id or SCW_DEFAULT_PROJECT_ID)",
                ))
            })
    }

    async fn resolve_image(&self, api: &ScalewayApi, zone: &str) -> Result<String, ProviderError> {
        let images = ScalewayListInstanceImagesBuilder::new(api.clone(), zone)
            .public(true)
            .name(IMAGE_LABEL)
            .arch(ARCHITECTURE)
            .run_async()
            .await
            .map_err(upstream)?;
        newest_available(images).ok_or_else(|| ProviderError::Provision {
            provider: NAME.to_owned(),
            message: format!("no {IMAGE_LABEL} image for {ARCHITECTURE} in {zone}"),
        })
    }

    async fn set_user_data(
        &self,
        token: &str,
        zone: &str,
        server_id: &str,
        body: String,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/zones/{zone}/servers/{server_id}/user_data/{USER_DATA_KEY}",
            self.base_url
        );
        let response = HTTP_CLIENT
            .patch(&url)
            .header("X-Auth-Token", token)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(upstream)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(upstream(format!("setting cloud-init user data returned {status}")))
    }

    async fn fetch_server(
        &self,
        credentials: &Credentials,
        instance: &Instance,
    ) -> Result<Instance, ProviderError> {
        let api = ScalewayApi::new(credentials.token(NAME)?);
        let mut servers = api
            .list_instances(&instance.region)
            .servers(&instance.id)
            .per_page(1)
            .run_async()
            .await
            .map_err(upstream)?;
        servers.pop().map_or_else(
            || {
                Err(ProviderError::InstanceFailed {
                    instance_id: instance.id.clone(),
                    state: String::from("deleted"),
                })
            },
            |server| Ok(to_instance(server, &instance.region)),
        )
    }
}

impl Provider for Scaleway {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve_auth(&self) -> ProviderFuture<'_, Credentials> {
        Box::pin(async move { self.auth.resolve(self.runner.as_ref()).await })
    }

    fn list_regions<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> ProviderFuture<'a, Vec<Region>> {
        Box::pin(async move {
            Ok(ZONES
                .iter()
                .map(|(slug, name)| Region {
                    name: (*name).to_owned(),
                    slug: (*slug).to_owned(),
                    available: true,
                })
                .collect())
        })
    }

    fn list_sizes<'a>(
        &'a self,
        credentials: &'a Credentials,
        region: Option<&'a str>,
    ) -> ProviderFuture<'a, Vec<Size>> {
        Box::pin(async move {
            let zone = region.unwrap_or("fr-par-1");
            let page: ProductsPage = self
                .api
                .get(credentials, &format!("/zones/{zone}/products/servers?per_page=100"))
                .await?;
            Ok(page
                .servers
                .into_iter()
                .filter(|(_, product)| {
                    product
                        .arch
                        .as_deref()
                        .is_none_or(|arch| arch == ARCHITECTURE)
                })
                .map(|(slug, product)| Size {
                    slug,
                    memory_mb: bytes_to_mebibytes(product.ram),
                    vcpus: product.ncpus,
                    disk_gb: product
                        .volumes_constraint
                        .map_or(0, |constraint| bytes_to_gibibytes(constraint.max_size)),
                    transfer_tb: None,
                    price_monthly: product.monthly_price,
                    price_hourly: product.hourly_price,
                    regions: vec![zone.to_owned()],
                })
                .collect())
        })
    }

    fn create_instance<'a>(
        &'a self,
        credentials: &'a Credentials,
        spec: &'a InstanceSpec,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            let token = credentials.token(NAME)?;
            let project = self.project()?;
            let api = ScalewayApi::new(token);
            let image = self
                .resolve_image(&api, &spec.region)
                .await
                .map_err(as_provision_error)?;

            let created: ServerEnvelope = self
                .api
                .send(
                    Method::POST,
                    credentials,
                    &format!("/zones/{}/servers", spec.region),
                    Some(&NewServer {
                        name: &spec.name,
                        commercial_type: &spec.size,
                        image: &image,
                        project: &project,
                        routed_ip_enabled: true,
                        dynamic_ip_required: true,
                        tags: &spec.tags,
                        stopped: true,
                    }),
                )
                .await
                .map_err(as_provision_error)?;
            let server_id = created.server.id.clone();

            self.set_user_data(token, &spec.region, &server_id, cloud_config(&spec.ssh_public_key))
                .await
                .map_err(as_provision_error)?;
            api.perform_instance_action_async(&spec.region, &server_id, "poweron")
                .await
                .map_err(|err| as_provision_error(upstream(err)))?;

            let mut instance = to_instance(created.server, &spec.region);
            instance.status = InstanceStatus::Provisioning;
            Ok(instance)
        })
    }

    fn wait_reachable<'a>(
        &'a self,
        credentials: &'a Credentials,
        instance: &'a Instance,
        timeout: Duration,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            wait_until_reachable(&instance.id, timeout, self.policy, || {
                self.fetch_server(credentials, instance)
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_sizes_are_converted_from_bytes() {
        assert_eq!(bytes_to_mebibytes(2 * 1024 * 1024 * 1024), 2048);
        assert_eq!(bytes_to_gibibytes(20 * 1024 * 1024 * 1024), 20);
    }

    #[test]
    fn cloud_config_authorises_the_key() {
        let rendered = cloud_config("ssh-ed25519 AAAA hangar\n");
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("  - ssh-ed25519 AAAA hangar\n"));
    }

    #[test]
    fn products_page_parses() {
        let raw = r#"{"servers": {
            "DEV1-S": {"ncpus": 2, "ram": 2147483648, "monthly_price": 6.42,
                       "hourly_price": 0.0088, "arch": "x86_64",
                       "volumes_constraint": {"min_size": 0, "max_size": 21474836480}}
        }}"#;
        let page: ProductsPage = serde_json::from_str(raw).unwrap_or_else(|err| panic!("{err}"));
        let product = page.servers.get("DEV1-S").unwrap_or_else(|| panic!("missing"));
        assert_eq!(product.ncpus, 2);
        assert_eq!(bytes_to_mebibytes(product.ram), 2048);
    }
}

//! DigitalOcean droplets over the v2 REST API, with DigitalOcean DNS.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::http::{AuthStyle, RestClient, as_provision_error};
use super::reachability::{ReachabilityPolicy, wait_until_reachable};
use super::{
    AuthChain, AuthSource, Credentials, DnsRecord, Instance, InstanceSpec, InstanceStatus,
    Provider, ProviderError, ProviderFuture, Region, Secret, SecretString, Size,
};
use crate::runner::CommandRunner;

const NAME: &str = "digitalocean";
const API_BASE: &str = "https://api.digitalocean.com/v2";
const IMAGE: &str = "ubuntu-24-04-x64";

#[derive(Deserialize)]
struct RegionsPage {
    regions: Vec<ApiRegion>,
}

#[derive(Deserialize)]
struct ApiRegion {
    name: String,
    slug: String,
    available: bool,
}

#[derive(Deserialize)]
struct SizesPage {
    sizes: Vec<ApiSize>,
}

#[derive(Deserialize)]
struct ApiSize {
    slug: String,
    memory: u64,
    vcpus: u32,
    disk: u32,
    #[serde(default)]
    transfer: Option<f64>,
    #[serde(default)]
    price_monthly: Option<f64>,
    #[serde(default)]
    price_hourly: Option<f64>,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default = "available_by_default")]
    available: bool,
}

const fn available_by_default() -> bool {
    true
}

#[derive(Serialize)]
struct NewKey<'a> {
    name: &'a str,
    public_key: &'a str,
}

#[derive(Deserialize)]
struct KeyEnvelope {
    ssh_key: ApiKey,
}

#[derive(Deserialize)]
struct ApiKey {
    id: u64,
}

#[derive(Serialize)]
struct NewDroplet<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    ssh_keys: Vec<u64>,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: ApiDroplet,
}

#[derive(Deserialize)]
struct ApiDroplet {
    id: u64,
    status: String,
    #[serde(default)]
    networks: Networks,
    #[serde(default)]
    region: Option<ApiRegion>,
}

#[derive(Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<Network>,
}

#[derive(Deserialize)]
struct Network {
    ip_address: IpAddr,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct NewRecord<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    data: String,
    ttl: u32,
}

impl ApiDroplet {
    fn into_instance(self, fallback_region: &str) -> Instance {
        let status = match self.status.as_str() {
            "active" => InstanceStatus::Unreachable,
            "off" | "archive" => InstanceStatus::Terminated,
            _ => InstanceStatus::Provisioning,
        };
        let public_ip = self
            .networks
            .v4
            .iter()
            .find(|network| network.kind == "public")
            .map(|network| network.ip_address);
        Instance {
            id: self.id.to_string(),
            public_ip,
            status,
            region: self
                .region
                .map_or_else(|| fallback_region.to_owned(), |region| region.slug),
        }
    }
}

/// DigitalOcean provider.
pub struct DigitalOcean {
    api: RestClient,
    auth: AuthChain,
    runner: Arc<dyn CommandRunner>,
    policy: ReachabilityPolicy,
}

impl DigitalOcean {
    /// Creates the provider. `token` is the explicitly configured API token.
    #[must_use]
    pub fn new(token: Option<String>, runner: Arc<dyn CommandRunner>) -> Self {
        let explicit = token.map(|value| Secret::Token(SecretString::new(value)));
        Self {
            api: RestClient::new(NAME, API_BASE, AuthStyle::Bearer),
            auth: AuthChain::new(
                NAME,
                vec![
                    AuthSource::Explicit(explicit),
                    AuthSource::EnvToken("DIGITALOCEAN_TOKEN"),
                    AuthSource::EnvToken("DIGITALOCEAN_ACCESS_TOKEN"),
                    AuthSource::Cli {
                        program: String::from("doctl"),
                        args: vec![String::from("auth"), String::from("token")],
                    },
                ],
            ),
            runner,
            policy: ReachabilityPolicy::default(),
        }
    }

    /// Points the provider at another API root.
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.api = self.api.with_base_url(base_url);
        self
    }

    /// Overrides the reachability polling policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ReachabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn fetch_droplet(
        &self,
        credentials: &Credentials,
        instance: &Instance,
    ) -> Result<Instance, ProviderError> {
        let envelope: DropletEnvelope = self
            .api
            .get(credentials, &format!("/droplets/{}", instance.id))
            .await?;
        Ok(envelope.droplet.into_instance(&instance.region))
    }
}

impl Provider for DigitalOcean {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve_auth(&self) -> ProviderFuture<'_, Credentials> {
        Box::pin(async move { self.auth.resolve(self.runner.as_ref()).await })
    }

    fn list_regions<'a>(&'a self, credentials: &'a Credentials) -> ProviderFuture<'a, Vec<Region>> {
        Box::pin(async move {
            let page: RegionsPage = self.api.get(credentials, "/regions?per_page=200").await?;
            Ok(page
                .regions
                .into_iter()
                .map(|region| Region {
                    name: region.name,
                    slug: region.slug,
                    available: region.available,
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
            let page: SizesPage = self.api.get(credentials, "/sizes?per_page=200").await?;
            Ok(page
                .sizes
                .into_iter()
                .filter(|size| size.available)
                .filter(|size| region.is_none_or(|slug| size.regions.iter().any(|r| r == slug)))
                .map(|size| Size {
                    slug: size.slug,
                    memory_mb: size.memory,
                    vcpus: size.vcpus,
                    disk_gb: size.disk,
                    transfer_tb: size.transfer,
                    price_monthly: size.price_monthly,
                    price_hourly: size.price_hourly,
                    regions: size.regions,
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
            let key: KeyEnvelope = self
                .api
                .send(
                    Method::POST,
                    credentials,
                    "/account/keys",
                    Some(&NewKey {
                        name: &spec.name,
                        public_key: &spec.ssh_public_key,
                    }),
                )
                .await
                .map_err(as_provision_error)?;

            let created: DropletEnvelope = self
                .api
                .send(
                    Method::POST,
                    credentials,
                    "/droplets",
                    Some(&NewDroplet {
                        name: &spec.name,
                        region: &spec.region,
                        size: &spec.size,
                        image: IMAGE,
                        ssh_keys: vec![key.ssh_key.id],
                        tags: &spec.tags,
                    }),
                )
                .await
                .map_err(as_provision_error)?;

            let mut instance = created.droplet.into_instance(&spec.region);
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
                self.fetch_droplet(credentials, instance)
            })
            .await
        })
    }

    fn supports_dns(&self) -> bool {
        true
    }

    fn create_dns_record<'a>(
        &'a self,
        credentials: &'a Credentials,
        record: &'a DnsRecord,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let _created: serde_json::Value = self
                .api
                .send(
                    Method::POST,
                    credentials,
                    &format!("/domains/{}/records", record.zone),
                    Some(&NewRecord {
                        kind: "A",
                        name: &record.name,
                        data: record.address.to_string(),
                        ttl: record.ttl,
                    }),
                )
                .await?;
            Ok(())
        })
    }
}

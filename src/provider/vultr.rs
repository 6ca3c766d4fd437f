//! Vultr cloud compute over the v2 REST API, with Vultr DNS.

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

const NAME: &str = "vultr";
const API_BASE: &str = "https://api.vultr.com/v2";
/// Ubuntu 24.04 LTS x64.
const UBUNTU_OS_ID: u32 = 2284;

#[derive(Deserialize)]
struct RegionsPage {
    regions: Vec<ApiRegion>,
}

#[derive(Deserialize)]
struct ApiRegion {
    id: String,
    city: String,
    country: String,
}

#[derive(Deserialize)]
struct PlansPage {
    plans: Vec<ApiPlan>,
}

#[derive(Deserialize)]
struct ApiPlan {
    id: String,
    vcpu_count: u32,
    ram: u64,
    disk: u32,
    #[serde(default)]
    monthly_cost: Option<f64>,
    #[serde(default)]
    locations: Vec<String>,
}

#[derive(Serialize)]
struct NewKey<'a> {
    name: &'a str,
    ssh_key: &'a str,
}

#[derive(Deserialize)]
struct KeyEnvelope {
    ssh_key: ApiKey,
}

#[derive(Deserialize)]
struct ApiKey {
    id: String,
}

#[derive(Serialize)]
struct NewInstance<'a> {
    region: &'a str,
    plan: &'a str,
    os_id: u32,
    label: &'a str,
    hostname: &'a str,
    sshkey_id: Vec<String>,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct InstanceEnvelope {
    instance: ApiInstance,
}

#[derive(Deserialize)]
struct ApiInstance {
    id: String,
    #[serde(default)]
    main_ip: Option<String>,
    status: String,
    #[serde(default)]
    power_status: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Serialize)]
struct NewRecord<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    data: String,
    ttl: u32,
}

impl ApiInstance {
    fn into_instance(self, fallback_region: &str) -> Instance {
        let running = self.power_status.as_deref() == Some("running");
        let status = match self.status.as_str() {
            "active" if running => InstanceStatus::Unreachable,
            "suspended" | "closed" => InstanceStatus::Terminated,
            _ => InstanceStatus::Provisioning,
        };
        // Vultr reports 0.0.0.0 until an address is assigned.
        let public_ip = self
            .main_ip
            .as_deref()
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .filter(|ip| !ip.is_unspecified());
        Instance {
            id: self.id,
            public_ip,
            status,
            region: self.region.unwrap_or_else(|| fallback_region.to_owned()),
        }
    }
}

/// Vultr provider.
pub struct Vultr {
    api: RestClient,
    auth: AuthChain,
    runner: Arc<dyn CommandRunner>,
    policy: ReachabilityPolicy,
}

impl Vultr {
    /// Creates the provider. `api_key` is the explicitly configured key.
    #[must_use]
    pub fn new(api_key: Option<String>, runner: Arc<dyn CommandRunner>) -> Self {
        let explicit = api_key.map(|value| Secret::Token(SecretString::new(value)));
        Self {
            api: RestClient::new(NAME, API_BASE, AuthStyle::Bearer),
            auth: AuthChain::new(
                NAME,
                vec![
                    AuthSource::Explicit(explicit),
                    AuthSource::EnvToken("VULTR_API_KEY"),
                    AuthSource::ConfigFileKey {
                        path: String::from("~/.vultr-cli.yaml"),
                        key: "api-key",
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

    async fn fetch_instance(
        &self,
        credentials: &Credentials,
        instance: &Instance,
    ) -> Result<Instance, ProviderError> {
        let envelope: InstanceEnvelope = self
            .api
            .get(credentials, &format!("/instances/{}", instance.id))
            .await?;
        Ok(envelope.instance.into_instance(&instance.region))
    }
}

impl Provider for Vultr {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve_auth(&self) -> ProviderFuture<'_, Credentials> {
        Box::pin(async move { self.auth.resolve(self.runner.as_ref()).await })
    }

    fn list_regions<'a>(&'a self, credentials: &'a Credentials) -> ProviderFuture<'a, Vec<Region>> {
        Box::pin(async move {
            let page: RegionsPage = self.api.get(credentials, "/regions?per_page=500").await?;
            Ok(page
                .regions
                .into_iter()
                .map(|region| Region {
                    name: format!("{}, {}", region.city, region.country),
                    slug: region.id,
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
            let page: PlansPage = self.api.get(credentials, "/plans?per_page=500").await?;
            Ok(page
                .plans
                .into_iter()
                .filter(|plan| region.is_none_or(|slug| plan.locations.iter().any(|l| l == slug)))
                .map(|plan| Size {
                    slug: plan.id,
                    memory_mb: plan.ram,
                    vcpus: plan.vcpu_count,
                    disk_gb: plan.disk,
                    transfer_tb: None,
                    price_monthly: plan.monthly_cost,
                    price_hourly: None,
                    regions: plan.locations,
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
                    "/ssh-keys",
                    Some(&NewKey {
                        name: &spec.name,
                        ssh_key: &spec.ssh_public_key,
                    }),
                )
                .await
                .map_err(as_provision_error)?;

            let created: InstanceEnvelope = self
                .api
                .send(
                    Method::POST,
                    credentials,
                    "/instances",
                    Some(&NewInstance {
                        region: &spec.region,
                        plan: &spec.size,
                        os_id: UBUNTU_OS_ID,
                        label: &spec.name,
                        hostname: &spec.name,
                        sshkey_id: vec![key.ssh_key.id],
                        tags: &spec.tags,
                    }),
                )
                .await
                .map_err(as_provision_error)?;

            let mut instance = created.instance.into_instance(&spec.region);
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
                self.fetch_instance(credentials, instance)
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
            let name = if record.name == "@" { "" } else { record.name.as_str() };
            let _created: serde_json::Value = self
                .api
                .send(
                    Method::POST,
                    credentials,
                    &format!("/domains/{}/records", record.zone),
                    Some(&NewRecord {
                        name,
                        kind: "A",
                        data: record.address.to_string(),
                        ttl: record.ttl,
                    }),
                )
                .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_address_is_ignored() {
        let instance = ApiInstance {
            id: String::from("abc"),
            main_ip: Some(String::from("0.0.0.0")),
            status: String::from("pending"),
            power_status: Some(String::from("stopped")),
            region: None,
        }
        .into_instance("ams");

        assert_eq!(instance.public_ip, None);
        assert_eq!(instance.status, InstanceStatus::Provisioning);
        assert_eq!(instance.region, "ams");
    }

    #[test]
    fn active_and_running_awaits_probe() {
        let instance = ApiInstance {
            id: String::from("abc"),
            main_ip: Some(String::from("198.51.100.7")),
            status: String::from("active"),
            power_status: Some(String::from("running")),
            region: Some(String::from("fra")),
        }
        .into_instance("ams");

        assert_eq!(instance.status, InstanceStatus::Unreachable);
        assert_eq!(instance.region, "fra");
        assert!(instance.public_ip.is_some());
    }
}

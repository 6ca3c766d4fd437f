//! UpCloud servers over the 1.3 REST API.
//!
//! UpCloud wraps every list in a singular-named object (`{"zones": {"zone":
//! [...]}}`), so the response types here mirror that nesting. Prices are not
//! published per plan, which leaves size selection to the footprint rule.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::http::{AuthStyle, RestClient, as_provision_error};
use super::reachability::{ReachabilityPolicy, wait_until_reachable};
use super::{
    AuthChain, AuthSource, Credentials, Instance, InstanceSpec, InstanceStatus, Provider,
    ProviderError, ProviderFuture, Region, Secret, SecretString, Size,
};
use crate::runner::CommandRunner;

const NAME: &str = "upcloud";
const API_BASE: &str = "https://api.upcloud.com/1.3";
/// Public Ubuntu Server 24.04 LTS template.
const UBUNTU_TEMPLATE: &str = "01000000-0000-4000-8000-000030240200";
const DEFAULT_STORAGE_GB: u32 = 25;

#[derive(Deserialize)]
struct ZonesPage {
    zones: ZoneList,
}

#[derive(Deserialize)]
struct ZoneList {
    zone: Vec<ApiZone>,
}

#[derive(Deserialize)]
struct ApiZone {
    id: String,
    description: String,
    #[serde(default)]
    public: Option<String>,
}

#[derive(Deserialize)]
struct PlansPage {
    plans: PlanList,
}

#[derive(Deserialize)]
struct PlanList {
    plan: Vec<ApiPlan>,
}

#[derive(Deserialize)]
struct ApiPlan {
    name: String,
    core_number: u32,
    memory_amount: u64,
    storage_size: u32,
}

#[derive(Serialize)]
struct NewServerEnvelope<'a> {
    server: NewServer<'a>,
}

#[derive(Serialize)]
struct NewServer<'a> {
    zone: &'a str,
    title: &'a str,
    hostname: &'a str,
    plan: &'a str,
    metadata: &'a str,
    storage_devices: StorageDevices<'a>,
    login_user: LoginUser<'a>,
}

#[derive(Serialize)]
struct StorageDevices<'a> {
    storage_device: Vec<StorageDevice<'a>>,
}

#[derive(Serialize)]
struct StorageDevice<'a> {
    action: &'a str,
    storage: &'a str,
    title: String,
    size: u32,
}

#[derive(Serialize)]
struct LoginUser<'a> {
    username: &'a str,
    create_password: &'a str,
    ssh_keys: SshKeys<'a>,
}

#[derive(Serialize)]
struct SshKeys<'a> {
    ssh_key: Vec<&'a str>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ApiServer,
}

#[derive(Deserialize)]
struct ApiServer {
    uuid: String,
    state: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    ip_addresses: Option<AddressList>,
}

#[derive(Deserialize)]
struct AddressList {
    ip_address: Vec<ApiAddress>,
}

#[derive(Deserialize)]
struct ApiAddress {
    access: String,
    family: String,
    address: IpAddr,
}

impl ApiServer {
    fn into_instance(self, fallback_region: &str) -> Instance {
        let status = match self.state.as_str() {
            "started" => InstanceStatus::Unreachable,
            "error" => InstanceStatus::Terminated,
            _ => InstanceStatus::Provisioning,
        };
        let public_ip = self.ip_addresses.and_then(|list| {
            list.ip_address
                .into_iter()
                .find(|entry| entry.access == "public" && entry.family == "IPv4")
                .map(|entry| entry.address)
        });
        Instance {
            id: self.uuid,
            public_ip,
            status,
            region: self.zone.unwrap_or_else(|| fallback_region.to_owned()),
        }
    }
}

/// UpCloud provider.
pub struct UpCloud {
    api: RestClient,
    auth: AuthChain,
    runner: Arc<dyn CommandRunner>,
    policy: ReachabilityPolicy,
}

impl UpCloud {
    /// Creates the provider from optionally configured API credentials.
    #[must_use]
    pub fn new(
        username: Option<String>,
        password: Option<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let explicit = username.zip(password).map(|(user, pass)| Secret::Basic {
            username: user,
            password: SecretString::new(pass),
        });
        Self {
            api: RestClient::new(NAME, API_BASE, AuthStyle::Basic),
            auth: AuthChain::new(
                NAME,
                vec![
                    AuthSource::Explicit(explicit),
                    AuthSource::EnvBasic {
                        username: "UPCLOUD_USERNAME",
                        password: "UPCLOUD_PASSWORD",
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

    async fn plans(&self, credentials: &Credentials) -> Result<Vec<ApiPlan>, ProviderError> {
        let page: PlansPage = self.api.get(credentials, "/plan").await?;
        Ok(page.plans.plan)
    }

    async fn fetch_server(
        &self,
        credentials: &Credentials,
        instance: &Instance,
    ) -> Result<Instance, ProviderError> {
        let envelope: ServerEnvelope = self
            .api
            .get(credentials, &format!("/server/{}", instance.id))
            .await?;
        Ok(envelope.server.into_instance(&instance.region))
    }
}

impl Provider for UpCloud {
    fn name(&self) -> &str {
        NAME
    }

    fn resolve_auth(&self) -> ProviderFuture<'_, Credentials> {
        Box::pin(async move { self.auth.resolve(self.runner.as_ref()).await })
    }

    fn list_regions<'a>(&'a self, credentials: &'a Credentials) -> ProviderFuture<'a, Vec<Region>> {
        Box::pin(async move {
            let page: ZonesPage = self.api.get(credentials, "/zone").await?;
            Ok(page
                .zones
                .zone
                .into_iter()
                .map(|zone| Region {
                    available: zone.public.as_deref() != Some("no"),
                    name: zone.description,
                    slug: zone.id,
                })
                .collect())
        })
    }

    fn list_sizes<'a>(
        &'a self,
        credentials: &'a Credentials,
        _region: Option<&'a str>,
    ) -> ProviderFuture<'a, Vec<Size>> {
        Box::pin(async move {
            Ok(self
                .plans(credentials)
                .await?
                .into_iter()
                .map(|plan| Size {
                    slug: plan.name,
                    memory_mb: plan.memory_amount,
                    vcpus: plan.core_number,
                    disk_gb: plan.storage_size,
                    transfer_tb: None,
                    price_monthly: None,
                    price_hourly: None,
                    regions: Vec::new(),
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
            let storage_gb = self
                .plans(credentials)
                .await
                .map_err(as_provision_error)?
                .into_iter()
                .find(|plan| plan.name == spec.size)
                .map_or(DEFAULT_STORAGE_GB, |plan| plan.storage_size);

            let body = NewServerEnvelope {
                server: NewServer {
                    zone: &spec.region,
                    title: &spec.name,
                    hostname: &spec.name,
                    plan: &spec.size,
                    metadata: "yes",
                    storage_devices: StorageDevices {
                        storage_device: vec![StorageDevice {
                            action: "clone",
                            storage: UBUNTU_TEMPLATE,
                            title: format!("{}-root", spec.name),
                            size: storage_gb,
                        }],
                    },
                    login_user: LoginUser {
                        username: "root",
                        create_password: "no",
                        ssh_keys: SshKeys {
                            ssh_key: vec![spec.ssh_public_key.as_str()],
                        },
                    },
                },
            };

            let created: ServerEnvelope = self
                .api
                .send(Method::POST, credentials, "/server", Some(&body))
                .await
                .map_err(as_provision_error)?;

            let mut instance = created.server.into_instance(&spec.region);
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
    fn nested_address_list_yields_public_ipv4() {
        let raw = r#"{
            "server": {
                "uuid": "00a1",
                "state": "started",
                "zone": "de-fra1",
                "ip_addresses": {"ip_address": [
                    {"access": "utility", "family": "IPv4", "address": "10.1.2.3"},
                    {"access": "public", "family": "IPv6", "address": "2001:db8::1"},
                    {"access": "public", "family": "IPv4", "address": "198.51.100.20"}
                ]}
            }
        }"#;
        let envelope: ServerEnvelope =
            serde_json::from_str(raw).unwrap_or_else(|err| panic!("parse: {err}"));
        let instance = envelope.server.into_instance("fi-hel1");

        assert_eq!(instance.id, "00a1");
        assert_eq!(instance.region, "de-fra1");
        assert_eq!(instance.status, InstanceStatus::Unreachable);
        assert_eq!(
            instance.public_ip.map(|ip| ip.to_string()).as_deref(),
            Some("198.51.100.20")
        );
    }

    #[test]
    fn maintenance_is_still_provisioning() {
        let raw = r#"{"server": {"uuid": "00a1", "state": "maintenance"}}"#;
        let envelope: ServerEnvelope =
            serde_json::from_str(raw).unwrap_or_else(|err| panic!("parse: {err}"));
        let instance = envelope.server.into_instance("fi-hel1");
        assert_eq!(instance.status, InstanceStatus::Provisioning);
        assert_eq!(instance.public_ip, None);
    }
}

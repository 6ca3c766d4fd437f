//! Terraform-backed provider variants.
//!
//! A variant owns a module directory (`<modules_dir>/<name>`) declaring the
//! variables `name`, `region`, `size`, `ssh_public_key`, `tags`, plus any
//! provider-specific extras, and the outputs `instance_id` and `public_ip`.
//! Each deployment keeps its own state file and generated variable file under
//! `<state_dir>/terraform/<instance name>/`, so concurrent deployments share
//! the initialised module without sharing state.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde_json::{Value, json};

use super::reachability::{ReachabilityPolicy, wait_until_reachable};
use super::{
    AuthChain, AuthSource, Credentials, Instance, InstanceSpec, InstanceStatus, Provider,
    ProviderError, ProviderFuture, Region, Secret, Size,
};
use crate::files;
use crate::runner::{CommandOutput, CommandRunner};

const VAR_FILE: &str = "hangar.auto.tfvars.json";
const STATE_FILE: &str = "terraform.tfstate";
const STDERR_TAIL: usize = 800;

/// Where Terraform runs and keeps its state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerraformSettings {
    /// Terraform executable.
    pub terraform_bin: String,
    /// Directory holding one module directory per variant.
    pub modules_dir: Utf8PathBuf,
    /// Directory for per-deployment state and variable files.
    pub state_dir: Utf8PathBuf,
}

/// Static regions and sizes for a Terraform-backed cloud.
#[derive(Clone, Debug, PartialEq)]
pub struct TerraformCatalog {
    /// Regions offered.
    pub regions: Vec<Region>,
    /// Sizes offered in every region.
    pub sizes: Vec<Size>,
}

fn machine(slug: &str, vcpus: u32, memory_mb: u64, price_monthly: f64) -> Size {
    Size {
        slug: slug.to_owned(),
        memory_mb,
        vcpus,
        disk_gb: GCP_BOOT_DISK_GB,
        transfer_tb: None,
        price_monthly: Some(price_monthly),
        price_hourly: None,
        regions: Vec::new(),
    }
}

/// Boot disk size set by the bundled GCP module.
const GCP_BOOT_DISK_GB: u32 = 30;

impl TerraformCatalog {
    /// Google Compute Engine zones and E2 machine types with list prices in USD.
    #[must_use]
    pub fn gcp() -> Self {
        let zones = [
            ("us-central1-a", "Iowa"),
            ("us-east1-b", "South Carolina"),
            ("us-west1-a", "Oregon"),
            ("europe-west1-b", "Belgium"),
            ("europe-west2-a", "London"),
            ("europe-west3-a", "Frankfurt"),
            ("asia-southeast1-a", "Singapore"),
            ("asia-northeast1-a", "Tokyo"),
        ];
        Self {
            regions: zones
                .iter()
                .map(|(slug, name)| Region {
                    name: (*name).to_owned(),
                    slug: (*slug).to_owned(),
                    available: true,
                })
                .collect(),
            sizes: vec![
                machine("e2-micro", 2, 1024, 6.11),
                machine("e2-small", 2, 2048, 12.23),
                machine("e2-medium", 2, 4096, 24.46),
                machine("e2-standard-2", 2, 8192, 48.92),
                machine("e2-standard-4", 4, 16384, 97.83),
                machine("e2-standard-8", 8, 32768, 195.67),
            ],
        }
    }
}

#[derive(Deserialize)]
struct OutputValue<T> {
    value: T,
}

#[derive(Deserialize)]
struct ModuleOutputs {
    instance_id: OutputValue<String>,
    public_ip: Option<OutputValue<String>>,
}

/// A provider whose instances are created by `terraform apply`.
pub struct Terraform {
    name: String,
    settings: TerraformSettings,
    auth: AuthChain,
    catalog: TerraformCatalog,
    variables: BTreeMap<String, Value>,
    runner: Arc<dyn CommandRunner>,
    policy: ReachabilityPolicy,
}

impl Terraform {
    /// Creates a Terraform-backed variant named `name`.
    #[must_use]
    pub fn new(
        name: &str,
        settings: TerraformSettings,
        auth: AuthChain,
        catalog: TerraformCatalog,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            settings,
            auth,
            catalog,
            variables: BTreeMap::new(),
            runner,
            policy: ReachabilityPolicy::default(),
        }
    }

    /// The Google Cloud variant (`gcp`).
    ///
    /// Credentials resolve from the configured service-account file, then
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then the application-default
    /// credentials file, then `gcloud auth print-access-token`.
    #[must_use]
    pub fn gcp(
        settings: TerraformSettings,
        credentials_file: Option<Utf8PathBuf>,
        project: Option<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let auth = AuthChain::new(
            "gcp",
            vec![
                AuthSource::Explicit(credentials_file.map(Secret::ServiceAccountFile)),
                AuthSource::EnvFile("GOOGLE_APPLICATION_CREDENTIALS"),
                AuthSource::DefaultFile(String::from(
                    "~/.config/gcloud/application_default_credentials.json",
                )),
                AuthSource::Cli {
                    program: String::from("gcloud"),
                    args: vec![
                        String::from("auth"),
                        String::from("print-access-token"),
                    ],
                },
            ],
        );
        let mut variant = Self::new("gcp", settings, auth, TerraformCatalog::gcp(), runner);
        if let Some(id) = project {
            variant = variant.with_variable("project", Value::String(id));
        }
        variant
    }

    /// Adds a module variable written to every generated variable file.
    #[must_use]
    pub fn with_variable(mut self, key: &str, value: Value) -> Self {
        self.variables.insert(key.to_owned(), value);
        self
    }

    /// Overrides the reachability polling policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ReachabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn module_dir(&self) -> Utf8PathBuf {
        self.settings.modules_dir.join(&self.name)
    }

    fn work_dir(&self, instance_name: &str) -> Utf8PathBuf {
        self.settings
            .state_dir
            .join("terraform")
            .join(instance_name)
    }

    fn provision_error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Provision {
            provider: self.name.clone(),
            message: message.into(),
        }
    }

    fn variable_file(
        &self,
        spec: &InstanceSpec,
        credentials: &Credentials,
    ) -> Result<Value, ProviderError> {
        let mut vars = serde_json::Map::new();
        for (key, value) in &self.variables {
            vars.insert(key.clone(), value.clone());
        }
        vars.insert(String::from("name"), json!(spec.name));
        vars.insert(String::from("region"), json!(spec.region));
        vars.insert(String::from("size"), json!(spec.size));
        vars.insert(String::from("ssh_public_key"), json!(spec.ssh_public_key.trim()));
        vars.insert(String::from("tags"), json!(spec.tags));

        match &credentials.secret {
            Secret::ServiceAccountFile(path) => {
                vars.insert(String::from("credentials_file"), json!(path.as_str()));
                if !vars.contains_key("project")
                    && let Some(project) = project_from_key_file(path)
                {
                    vars.insert(String::from("project"), json!(project));
                }
            }
            Secret::Token(token) => {
                vars.insert(String::from("access_token"), json!(token.expose()));
            }
            Secret::Basic { .. } => {
                return Err(ProviderError::Auth {
                    provider: self.name.clone(),
                    message: String::from("a service-account file or access token is required"),
                });
            }
        }
        if !vars.contains_key("project") {
            return Err(ProviderError::Validation(format!(
                "{}: no project configured and none found in the credentials",
                self.name
            )));
        }
        Ok(Value::Object(vars))
    }

    async fn terraform(&self, args: Vec<String>) -> Result<CommandOutput, ProviderError> {
        let mut argv = vec![OsString::from(format!("-chdir={}", self.module_dir()))];
        argv.extend(args.into_iter().map(OsString::from));
        let output = self
            .runner
            .capture(&self.settings.terraform_bin, &argv)
            .await
            .map_err(|err| self.provision_error(err.to_string()))?;
        if output.is_success() {
            return Ok(output);
        }
        Err(self.provision_error(format!(
            "terraform exited with status {}: {}",
            output.status_text(),
            tail(&output.stderr, STDERR_TAIL)
        )))
    }

    async fn apply(
        &self,
        spec: &InstanceSpec,
        vars: &Value,
    ) -> Result<ModuleOutputs, ProviderError> {
        let work = self.work_dir(&spec.name);
        let var_file = work.join(VAR_FILE);
        let state_file = work.join(STATE_FILE);
        let rendered = serde_json::to_string_pretty(vars)
            .map_err(|err| self.provision_error(err.to_string()))?;
        files::write(&var_file, rendered).map_err(|err| self.provision_error(err))?;

        self.terraform(vec![String::from("init"), String::from("-input=false")])
            .await?;
        self.terraform(vec![
            String::from("apply"),
            String::from("-auto-approve"),
            String::from("-input=false"),
            format!("-state={state_file}"),
            format!("-var-file={var_file}"),
        ])
        .await?;
        let outputs = self
            .terraform(vec![
                String::from("output"),
                String::from("-json"),
                format!("-state={state_file}"),
            ])
            .await?;
        serde_json::from_str(&outputs.stdout)
            .map_err(|err| self.provision_error(format!("unexpected terraform output: {err}")))
    }
}

fn project_from_key_file(path: &Utf8Path) -> Option<String> {
    let raw = files::read_to_string(path).ok()?;
    let document: Value = serde_json::from_str(&raw).ok()?;
    document
        .get("project_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let skip = trimmed.chars().count().saturating_sub(max_chars);
    trimmed.chars().skip(skip).collect()
}

impl Provider for Terraform {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_auth(&self) -> ProviderFuture<'_, Credentials> {
        Box::pin(async move { self.auth.resolve(self.runner.as_ref()).await })
    }

    fn list_regions<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> ProviderFuture<'a, Vec<Region>> {
        Box::pin(async move { Ok(self.catalog.regions.clone()) })
    }

    fn list_sizes<'a>(
        &'a self,
        _credentials: &'a Credentials,
        region: Option<&'a str>,
    ) -> ProviderFuture<'a, Vec<Size>> {
        Box::pin(async move {
            Ok(self
                .catalog
                .sizes
                .iter()
                .filter(|size| region.is_none_or(|slug| size.offered_in(slug)))
                .cloned()
                .collect())
        })
    }

    fn create_instance<'a>(
        &'a self,
        credentials: &'a Credentials,
        spec: &'a InstanceSpec,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            let vars = self.variable_file(spec, credentials)?;
            let outputs = self.apply(spec, &vars).await?;
            let public_ip = match outputs.public_ip {
                Some(output) => Some(output.value.parse::<IpAddr>().map_err(|err| {
                    self.provision_error(format!("public_ip output {:?}: {err}", output.value))
                })?),
                None => None,
            };
            Ok(Instance {
                id: outputs.instance_id.value,
                public_ip,
                status: InstanceStatus::Provisioning,
                region: spec.region.clone(),
            })
        })
    }

    fn wait_reachable<'a>(
        &'a self,
        _credentials: &'a Credentials,
        instance: &'a Instance,
        timeout: Duration,
    ) -> ProviderFuture<'a, Instance> {
        Box::pin(async move {
            // `terraform apply` returns once the instance is running, so only
            // the SSH port remains to be probed.
            wait_until_reachable(&instance.id, timeout, self.policy, || async {
                Ok(Instance {
                    status: InstanceStatus::Unreachable,
                    ..instance.clone()
                })
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CredentialSource, SecretString};
    use crate::test_support::{ScriptedRunner, utf8_tempdir};

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: String::from("gitea-1"),
            region: String::from("europe-west1-b"),
            size: String::from("e2-medium"),
            ssh_public_key: String::from("ssh-ed25519 AAAA hangar\n"),
            tags: vec![String::from("hangar")],
        }
    }

    fn token() -> Credentials {
        Credentials {
            secret: Secret::Token(SecretString::new("ya29.token")),
            source: CredentialSource::CliToken,
        }
    }

    fn variant(root: &Utf8Path, runner: &ScriptedRunner) -> Terraform {
        Terraform::gcp(
            TerraformSettings {
                terraform_bin: String::from("terraform"),
                modules_dir: root.join("modules"),
                state_dir: root.join("state"),
            },
            None,
            Some(String::from("demo-project")),
            Arc::new(runner.clone()),
        )
    }

    #[tokio::test]
    async fn apply_runs_init_apply_output_in_order() {
        let (_tmp, root) = utf8_tempdir();
        let runner = ScriptedRunner::new();
        runner.respond_when(
            " output -json",
            Some(0),
            r#"{"instance_id": {"value": "gitea-1-vm"}, "public_ip": {"value": "198.51.100.4"}}"#,
            "",
        );
        runner.push_success();
        runner.push_success();

        let instance = variant(&root, &runner)
            .create_instance(&token(), &spec())
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));

        assert_eq!(instance.id, "gitea-1-vm");
        assert_eq!(instance.status, InstanceStatus::Provisioning);
        assert_eq!(
            instance.public_ip.map(|ip| ip.to_string()).as_deref(),
            Some("198.51.100.4")
        );

        let commands: Vec<String> = runner
            .invocations()
            .iter()
            .map(|call| call.command_string())
            .collect();
        assert_eq!(commands.len(), 3);
        assert!(commands.first().is_some_and(|line| line.contains(" init ")));
        assert!(commands.get(1).is_some_and(|line| line.contains(" apply -auto-approve")));
        assert!(
            commands
                .iter()
                .all(|line| line.contains("-chdir=") && line.contains("/modules/gcp"))
        );

        let written = files::read_to_string(&root.join("state/terraform/gitea-1").join(VAR_FILE))
            .unwrap_or_else(|err| panic!("var file: {err}"));
        let vars: Value = serde_json::from_str(&written).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(vars["project"], "demo-project");
        assert_eq!(vars["size"], "e2-medium");
        assert_eq!(vars["ssh_public_key"], "ssh-ed25519 AAAA hangar");
    }

    #[tokio::test]
    async fn failed_apply_is_a_provision_error() {
        let (_tmp, root) = utf8_tempdir();
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_output(Some(1), "", "Error: quota exceeded");

        let err = variant(&root, &runner)
            .create_instance(&token(), &spec())
            .await
            .expect_err("apply fails");

        let ProviderError::Provision { provider, message } = err else {
            panic!("expected a provision error, got {err:?}");
        };
        assert_eq!(provider, "gcp");
        assert!(message.contains("quota exceeded"), "{message}");
        assert!(runner.commands_containing(" output ").is_empty());
    }

    #[tokio::test]
    async fn project_is_required() {
        let (_tmp, root) = utf8_tempdir();
        let runner = ScriptedRunner::succeeding();
        let gcp = Terraform::gcp(
            TerraformSettings {
                terraform_bin: String::from("terraform"),
                modules_dir: root.join("modules"),
                state_dir: root.join("state"),
            },
            None,
            None,
            Arc::new(runner.clone()),
        );

        let err = gcp
            .create_instance(&token(), &spec())
            .await
            .expect_err("no project");
        assert!(matches!(err, ProviderError::Validation(_)), "{err:?}");
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn gcp_catalog_has_priced_sizes() {
        let catalog = TerraformCatalog::gcp();
        assert!(!catalog.regions.is_empty());
        assert!(catalog.sizes.iter().all(|size| size.known_monthly_price().is_some()));
    }
}

//! Provider lookup by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;

use super::{DigitalOcean, Provider, Scaleway, Terraform, UpCloud, Vultr};
use crate::config::HangarConfig;
use crate::files;
use crate::runner::CommandRunner;

/// Provider variants keyed by the name used in the catalog and in requests.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own name, replacing any earlier entry.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_owned(), provider);
    }

    /// Builder-style [`ProviderRegistry::register`].
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Looks up a provider. Unknown names yield `None`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Builds every built-in variant from configuration.
    #[must_use]
    pub fn from_config(config: &HangarConfig, runner: &Arc<dyn CommandRunner>) -> Self {
        let gcp_file = config
            .gcp_credentials_file
            .as_deref()
            .map(|path| Utf8PathBuf::from(files::expand_tilde(path)));
        Self::new()
            .with(Arc::new(DigitalOcean::new(
                config.digitalocean_token.clone(),
                Arc::clone(runner),
            )))
            .with(Arc::new(Vultr::new(
                config.vultr_api_key.clone(),
                Arc::clone(runner),
            )))
            .with(Arc::new(UpCloud::new(
                config.upcloud_username.clone(),
                config.upcloud_password.clone(),
                Arc::clone(runner),
            )))
            .with(Arc::new(Scaleway::new(
                config.scaleway_secret_key.clone(),
                config.scaleway_project_id.clone(),
                Arc::clone(runner),
            )))
            .with(Arc::new(Terraform::gcp(
                config.terraform_settings(),
                gcp_file,
                config.gcp_project.clone(),
                Arc::clone(runner),
            )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProvider;

    #[test]
    fn lookup_is_by_name() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(FakeProvider::new("alpha")))
            .with(Arc::new(FakeProvider::new("beta")));

        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert_eq!(registry.get("beta").map(|p| p.name().to_owned()).as_deref(), Some("beta"));
        assert!(registry.get("gamma").is_none());
    }
}

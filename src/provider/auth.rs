//! Credential resolution in fixed priority order.
//!
//! Every provider builds an [`AuthChain`] from its sources: explicit
//! configuration first, then ambient environment credentials and well-known
//! files, then a locally configured provider CLI. The first source that yields
//! a value wins.

use std::env;
use std::ffi::OsString;

use camino::Utf8PathBuf;

use crate::files;
use crate::runner::CommandRunner;

use super::{CredentialSource, Credentials, ProviderError, Secret, SecretString};

/// One place a credential may come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthSource {
    /// Material from hangar's own configuration.
    Explicit(Option<Secret>),
    /// An environment variable holding a token.
    EnvToken(&'static str),
    /// Environment variables holding a user name and password.
    EnvBasic {
        /// Variable holding the user name.
        username: &'static str,
        /// Variable holding the password.
        password: &'static str,
    },
    /// An environment variable naming a service-account file.
    EnvFile(&'static str),
    /// A well-known service-account file; `~/` is expanded.
    DefaultFile(String),
    /// A `key: value` line in a provider CLI's config file.
    ConfigFileKey {
        /// Config file path; `~/` is expanded.
        path: String,
        /// Key whose value is the token.
        key: &'static str,
    },
    /// A CLI command printing a token on stdout.
    Cli {
        /// Executable.
        program: String,
        /// Arguments.
        args: Vec<String>,
    },
}

impl AuthSource {
    fn describe(&self) -> String {
        match self {
            Self::Explicit(_) => String::from("hangar configuration"),
            Self::EnvToken(var) | Self::EnvFile(var) => format!("${var}"),
            Self::EnvBasic { username, password } => format!("${username}/${password}"),
            Self::DefaultFile(path) | Self::ConfigFileKey { path, .. } => path.clone(),
            Self::Cli { program, args } => format!("`{program} {}`", args.join(" ")),
        }
    }

    async fn resolve(&self, runner: &dyn CommandRunner) -> Option<Credentials> {
        match self {
            Self::Explicit(secret) => secret.clone().map(|found| Credentials {
                secret: found,
                source: CredentialSource::Explicit,
            }),
            Self::EnvToken(var) => env_value(var).map(|token| Credentials {
                secret: Secret::Token(SecretString::new(token)),
                source: CredentialSource::Ambient,
            }),
            Self::EnvBasic { username, password } => {
                let user = env_value(username)?;
                let pass = env_value(password)?;
                Some(Credentials {
                    secret: Secret::Basic {
                        username: user,
                        password: SecretString::new(pass),
                    },
                    source: CredentialSource::Ambient,
                })
            }
            Self::EnvFile(var) => env_value(var).map(|path| Credentials {
                secret: Secret::ServiceAccountFile(Utf8PathBuf::from(path)),
                source: CredentialSource::Ambient,
            }),
            Self::DefaultFile(path) => {
                let expanded = Utf8PathBuf::from(files::expand_tilde(path));
                files::read_to_string(&expanded).ok()?;
                Some(Credentials {
                    secret: Secret::ServiceAccountFile(expanded),
                    source: CredentialSource::Ambient,
                })
            }
            Self::ConfigFileKey { path, key } => {
                let expanded = Utf8PathBuf::from(files::expand_tilde(path));
                let raw = files::read_to_string(&expanded).ok()?;
                yaml_value(&raw, key).map(|token| Credentials {
                    secret: Secret::Token(SecretString::new(token)),
                    source: CredentialSource::CliToken,
                })
            }
            Self::Cli { program, args } => {
                let argv: Vec<OsString> = args.iter().map(OsString::from).collect();
                let output = runner.capture(program, &argv).await.ok()?;
                let token = output.stdout.trim();
                (output.is_success() && !token.is_empty()).then(|| Credentials {
                    secret: Secret::Token(SecretString::new(token)),
                    source: CredentialSource::CliToken,
                })
            }
        }
    }
}

fn env_value(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Reads a top-level `key: value` line from a flat YAML document.
fn yaml_value(raw: &str, key: &str) -> Option<String> {
    raw.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        let trimmed = value.trim().trim_matches(|ch| ch == '"' || ch == '\'');
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    })
}

/// Ordered credential sources for one provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthChain {
    provider: String,
    sources: Vec<AuthSource>,
}

impl AuthChain {
    /// Creates a chain tried in the given order.
    #[must_use]
    pub fn new(provider: &str, sources: Vec<AuthSource>) -> Self {
        Self {
            provider: provider.to_owned(),
            sources,
        }
    }

    /// Returns the first credential found.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Auth`] listing every source tried when none
    /// yields a credential.
    pub async fn resolve(&self, runner: &dyn CommandRunner) -> Result<Credentials, ProviderError> {
        for source in &self.sources {
            if let Some(credentials) = source.resolve(runner).await {
                tracing::debug!(
                    provider = %self.provider,
                    source = %credentials.source,
                    "resolved credentials"
                );
                return Ok(credentials);
            }
        }

        let tried: Vec<String> = self.sources.iter().map(AuthSource::describe).collect();
        Err(ProviderError::Auth {
            provider: self.provider.clone(),
            message: format!("tried {}", tried.join(", ")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EnvGuard, ScriptedRunner, utf8_tempdir};

    const TOKEN_VAR: &str = "HANGAR_TEST_AUTH_TOKEN";

    fn cli() -> AuthSource {
        AuthSource::Cli {
            program: String::from("doctl"),
            args: vec![String::from("auth"), String::from("token")],
        }
    }

    fn token_of(credentials: &Credentials) -> &str {
        match &credentials.secret {
            Secret::Token(token) => token.expose(),
            other => panic!("expected a token, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_configuration_wins() {
        let _env = EnvGuard::set_vars(&[(TOKEN_VAR, "from-env")]).await;
        let chain = AuthChain::new(
            "test",
            vec![
                AuthSource::Explicit(Some(Secret::Token(SecretString::new("from-config")))),
                AuthSource::EnvToken(TOKEN_VAR),
                cli(),
            ],
        );

        let creds = chain
            .resolve(&ScriptedRunner::new())
            .await
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(token_of(&creds), "from-config");
        assert_eq!(creds.source, CredentialSource::Explicit);
    }

    #[tokio::test]
    async fn environment_beats_cli() {
        let _env = EnvGuard::set_vars(&[(TOKEN_VAR, "from-env")]).await;
        let runner = ScriptedRunner::new();
        let chain = AuthChain::new(
            "test",
            vec![AuthSource::Explicit(None), AuthSource::EnvToken(TOKEN_VAR), cli()],
        );

        let creds = chain
            .resolve(&runner)
            .await
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(token_of(&creds), "from-env");
        assert!(runner.invocations().is_empty(), "cli should not run");
    }

    #[tokio::test]
    async fn cli_token_is_last_resort() {
        let _env = EnvGuard::apply(&[(TOKEN_VAR, None)]).await;
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "dop_v1_cli\n", "");
        let chain = AuthChain::new("test", vec![AuthSource::EnvToken(TOKEN_VAR), cli()]);

        let creds = chain
            .resolve(&runner)
            .await
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(token_of(&creds), "dop_v1_cli");
        assert_eq!(creds.source, CredentialSource::CliToken);
    }

    #[tokio::test]
    async fn exhausted_chain_names_every_source() {
        let _env = EnvGuard::apply(&[(TOKEN_VAR, None)]).await;
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "not logged in");
        let chain = AuthChain::new("digitalocean", vec![AuthSource::EnvToken(TOKEN_VAR), cli()]);

        let err = chain.resolve(&runner).await.expect_err("no credentials");
        let ProviderError::Auth { provider, message } = err else {
            panic!("expected auth error");
        };
        assert_eq!(provider, "digitalocean");
        assert!(message.contains(TOKEN_VAR), "{message}");
        assert!(message.contains("doctl auth token"), "{message}");
    }

    #[tokio::test]
    async fn config_file_key_is_read() {
        let (_tmp, root) = utf8_tempdir();
        let path = root.join("config.yaml");
        files::write(&path, "access_key: SCWXXX\nsecret_key: \"abc-123\"\n")
            .unwrap_or_else(|err| panic!("write: {err}"));
        let chain = AuthChain::new(
            "scaleway",
            vec![AuthSource::ConfigFileKey {
                path: path.to_string(),
                key: "secret_key",
            }],
        );

        let creds = chain
            .resolve(&ScriptedRunner::new())
            .await
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert_eq!(token_of(&creds), "abc-123");
    }
}

//! HTTP surface used by the wizard and the `hangar tail` client.
//!
//! Routes:
//!
//! - `GET /api/apps`, `GET /api/providers`
//! - `GET /api/regions?provider=`, `GET /api/sizes?provider=&region=`
//! - `POST /api/deployments`, `GET /api/deployments/:id`
//! - `GET /api/deployments/:id/logs?offset=`, `GET /api/deployments/:id/events?offset=`
//! - `POST /api/deployments/:id/cancel`
//! - `POST /api/pty/input`, `GET /api/pty/output?sessionId=&offset=`

mod catalog;
mod deployments;
mod error;
mod pty;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogError};
use crate::config::{ConfigError, HangarConfig};
use crate::orchestrator::Orchestrator;
use crate::provider::ProviderRegistry;
use crate::runner::{CommandRunner, ProcessCommandRunner};
use crate::session::{DeploymentSession, SessionStore};

pub use catalog::SizeQuery;
pub use deployments::{LogPage, OffsetQuery, SubmitResponse};
pub use error::ApiError;
pub use pty::{PtyInput, PtyOutputPage, PtyOutputQuery};

/// Where per-deployment key pairs are generated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeySettings {
    /// `ssh-keygen` executable.
    pub ssh_keygen_bin: String,
    /// Parent directory; each session gets a subdirectory.
    pub key_dir: Utf8PathBuf,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Read-only app and provider catalog.
    pub catalog: Arc<Catalog>,
    /// Provider variants by name.
    pub registry: ProviderRegistry,
    /// Live deployment sessions.
    pub sessions: Arc<SessionStore>,
    /// Runs accepted deployments.
    pub orchestrator: Orchestrator,
    /// Runner used for key generation.
    pub runner: Arc<dyn CommandRunner>,
    /// Key generation settings.
    pub keys: KeySettings,
}

impl AppState {
    /// Builds the production state from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError::Catalog`] when the catalog override cannot be
    /// loaded.
    pub fn from_config(config: &HangarConfig) -> Result<Self, ServeError> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessCommandRunner);
        let catalog = Catalog::load(config.catalog_path().as_deref())?;
        let registry = ProviderRegistry::from_config(config, &runner);
        let orchestrator = Orchestrator::from_config(config, registry.clone(), Arc::clone(&runner));
        Ok(Self {
            catalog: Arc::new(catalog),
            registry,
            sessions: Arc::new(SessionStore::new()),
            orchestrator,
            runner,
            keys: KeySettings {
                ssh_keygen_bin: config.ssh_keygen_bin.clone(),
                key_dir: config.key_dir(),
            },
        })
    }

    fn session(&self, id: &Uuid) -> Result<Arc<DeploymentSession>, ApiError> {
        self.sessions
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
    }
}

/// Failures starting the server.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The catalog could not be loaded.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// Binding or serving failed.
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the router with request tracing and permissive CORS for the
/// browser wizard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/apps", get(catalog::apps))
        .route("/api/providers", get(catalog::providers))
        .route("/api/regions", get(catalog::regions))
        .route("/api/sizes", get(catalog::sizes))
        .route("/api/deployments", post(deployments::submit))
        .route("/api/deployments/:id", get(deployments::snapshot))
        .route("/api/deployments/:id/logs", get(deployments::logs))
        .route("/api/deployments/:id/events", get(deployments::events))
        .route("/api/deployments/:id/cancel", post(deployments::cancel))
        .route("/api/pty/input", post(pty::input))
        .route("/api/pty/output", get(pty::output))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the API until interrupted.
///
/// # Errors
///
/// Returns a [`ServeError`] when the configuration is invalid, the catalog
/// cannot be loaded, or the listener cannot be bound.
pub async fn serve(config: &HangarConfig) -> Result<(), ServeError> {
    config.validate()?;
    let addr = config.listen_socket()?;
    let state = AppState::from_config(config)?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        providers = ?state.registry.names(),
        apps = state.catalog.apps.len(),
        "hangar listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("hangar stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

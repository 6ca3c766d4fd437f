//! Core library for the hangar deployment tool.
//!
//! Hangar provisions a virtual machine on one of several cloud providers,
//! installs a catalog app over SSH, optionally points DNS at it and obtains
//! a TLS certificate. Progress, logs and an interactive terminal are exposed
//! over HTTP while the deployment runs.

pub mod api;
pub mod catalog;
pub mod client;
pub mod config;
pub mod files;
pub mod hostname;
pub mod orchestrator;
pub mod provider;
pub mod request;
pub mod runner;
pub mod selector;
pub mod session;
pub mod ssh;
pub mod test_support;

pub use api::{AppState, router, serve};
pub use catalog::Catalog;
pub use client::{BackendUrl, HangarClient};
pub use config::HangarConfig;
pub use orchestrator::{DeployError, Orchestrator};
pub use provider::{Provider, ProviderError, ProviderRegistry};
pub use request::{DeploymentRequest, DeploymentSubmission};
pub use session::{DeploymentSession, DeploymentState, FailureKind, SessionStore};

//! Catalog and provider listing endpoints.

use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use tokio::time::timeout;

use crate::catalog::{App, ProviderInfo};
use crate::provider::{Provider, ProviderError, Region, Size};

use super::{ApiError, AppState};

const LISTING_TIMEOUT: Duration = Duration::from_secs(60);

/// Query of the region and size listings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SizeQuery {
    /// Provider name; unknown or empty names list nothing.
    #[serde(default)]
    pub provider: String,
    /// Region slug; empty lists sizes across regions.
    #[serde(default)]
    pub region: String,
}

pub(super) async fn apps(State(state): State<AppState>) -> Json<Vec<App>> {
    Json(state.catalog.apps.clone())
}

pub(super) async fn providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    Json(state.catalog.providers.clone())
}

pub(super) async fn regions(
    State(state): State<AppState>,
    Query(query): Query<SizeQuery>,
) -> Result<Json<Vec<Region>>, ApiError> {
    let Some(provider) = state.registry.get(query.provider.trim()) else {
        return Ok(Json(Vec::new()));
    };
    let credentials = bounded(provider.name(), provider.resolve_auth()).await?;
    let regions = bounded(provider.name(), provider.list_regions(&credentials)).await?;
    Ok(Json(regions))
}

pub(super) async fn sizes(
    State(state): State<AppState>,
    Query(query): Query<SizeQuery>,
) -> Result<Json<Vec<Size>>, ApiError> {
    let Some(provider) = state.registry.get(query.provider.trim()) else {
        return Ok(Json(Vec::new()));
    };
    let region = Some(query.region.trim()).filter(|slug| !slug.is_empty());
    let sizes = list_sizes(provider.as_ref(), region).await?;
    Ok(Json(sizes))
}

async fn list_sizes(provider: &dyn Provider, region: Option<&str>) -> Result<Vec<Size>, ApiError> {
    let credentials = bounded(provider.name(), provider.resolve_auth()).await?;
    let sizes = bounded(provider.name(), provider.list_sizes(&credentials, region)).await?;
    Ok(match region {
        Some(slug) => sizes.into_iter().filter(|size| size.offered_in(slug)).collect(),
        None => sizes,
    })
}

async fn bounded<T>(
    provider: &str,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ApiError> {
    timeout(LISTING_TIMEOUT, call)
        .await
        .map_err(|_| {
            ApiError::Upstream(format!(
                "{provider} did not answer within {} seconds",
                LISTING_TIMEOUT.as_secs()
            ))
        })?
        .map_err(ApiError::from)
}

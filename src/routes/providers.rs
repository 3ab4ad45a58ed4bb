//! Identity provider configuration endpoints.
//!
//! Responses never contain secrets; see [`ProviderConfigResponse`].

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;

use crate::{
    AppState,
    auth::{ProviderPreset, SsoError},
    models::{CreateProviderConfig, ProviderConfigResponse, Role, UpdateProviderConfig},
};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub enabled_only: bool,
}

#[tracing::instrument(name = "providers.list", skip(state))]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ProviderConfigResponse>>, SsoError> {
    let providers = state
        .services
        .provider_configs
        .list(query.enabled_only)
        .await?;
    Ok(Json(providers.into_iter().map(Into::into).collect()))
}

#[tracing::instrument(name = "providers.get", skip(state), fields(%name))]
pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProviderConfigResponse>, SsoError> {
    let config = state.services.provider_configs.get(&name).await?;
    Ok(Json(config.into()))
}

#[tracing::instrument(name = "providers.create", skip(state, input), fields(name = %input.name))]
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateProviderConfig>,
) -> Result<(StatusCode, Json<ProviderConfigResponse>), SsoError> {
    let config = state.services.provider_configs.create(input).await?;
    Ok((StatusCode::CREATED, Json(config.into())))
}

/// Request body for creating a provider from a vendor preset. The
/// vendor-specific field (`tenant_id` or `domain`) sits alongside the
/// credentials.
#[derive(Debug, Deserialize)]
pub struct PresetRequest {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub default_role: Option<Role>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub auto_provision: Option<bool>,
}

fn preset_for(vendor: &str, input: &PresetRequest) -> Result<ProviderPreset, SsoError> {
    let required = |value: &Option<String>, field: &str| {
        value
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| SsoError::missing_field(field))
    };

    match vendor {
        "azure_ad" => Ok(ProviderPreset::AzureAd {
            tenant_id: required(&input.tenant_id, "tenant_id")?,
        }),
        "okta" => Ok(ProviderPreset::Okta {
            domain: required(&input.domain, "domain")?,
        }),
        "google" => Ok(ProviderPreset::Google),
        other => Err(SsoError::Configuration(format!(
            "unknown preset vendor: {other}"
        ))),
    }
}

#[tracing::instrument(name = "providers.create_from_preset", skip(state, input), fields(%vendor, name = %input.name))]
pub async fn create_from_preset(
    State(state): State<AppState>,
    Path(vendor): Path<String>,
    Json(input): Json<PresetRequest>,
) -> Result<(StatusCode, Json<ProviderConfigResponse>), SsoError> {
    let preset = preset_for(&vendor, &input)?;

    let mut config: CreateProviderConfig = preset.build(
        input.name.clone(),
        input.client_id.clone(),
        input.client_secret.clone(),
    );
    config.default_role = input.default_role;
    if let Some(enabled) = input.enabled {
        config.enabled = enabled;
    }
    if let Some(auto_provision) = input.auto_provision {
        config.auto_provision = auto_provision;
    }

    let config = state.services.provider_configs.create(config).await?;
    Ok((StatusCode::CREATED, Json(config.into())))
}

#[tracing::instrument(name = "providers.update", skip(state, input), fields(%name))]
pub async fn update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(input): Json<UpdateProviderConfig>,
) -> Result<Json<ProviderConfigResponse>, SsoError> {
    let config = state.services.provider_configs.update(&name, input).await?;
    Ok(Json(config.into()))
}

#[tracing::instrument(name = "providers.delete", skip(state), fields(%name))]
pub async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, SsoError> {
    state.services.provider_configs.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

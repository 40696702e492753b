//! Pool query handlers

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::api::server::AppState;
use crate::error::PoolError;
use crate::models::{FilterSpec, ProxyKey, Schema};

/// Body of a schema update
#[derive(Debug, Deserialize)]
pub struct SchemaUpdate {
    pub schema: String,
}

fn key_from_path(ip: &str, port: &str) -> Result<ProxyKey, PoolError> {
    ProxyKey::from_parts(ip, port)
}

/// List records, optionally filtered by `schema`, `country`, `source` and `score`
pub async fn list_proxies(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, PoolError> {
    let filter = FilterSpec::from_options(query)?;
    let records = state.store.query(&filter).await?;
    Ok(Json(records))
}

/// One uniformly random record
pub async fn random_proxy(State(state): State<AppState>) -> Result<impl IntoResponse, PoolError> {
    Ok(Json(state.store.random().await?))
}

pub async fn count_proxies(State(state): State<AppState>) -> Result<impl IntoResponse, PoolError> {
    let count = state.store.len().await?;
    Ok(Json(json!({ "count": count })))
}

pub async fn get_proxy(
    State(state): State<AppState>,
    Path((ip, port)): Path<(String, String)>,
) -> Result<impl IntoResponse, PoolError> {
    let key = key_from_path(&ip, &port)?;
    match state.store.get(key).await? {
        Some(record) => Ok(Json(record)),
        None => Err(PoolError::ProxyNotFound {
            key: key.to_string(),
        }),
    }
}

/// Remove a record from the pool
pub async fn delete_proxy(
    State(state): State<AppState>,
    Path((ip, port)): Path<(String, String)>,
) -> Result<impl IntoResponse, PoolError> {
    let key = key_from_path(&ip, &port)?;

    if !state.store.remove(key).await? {
        return Err(PoolError::ProxyNotFound {
            key: key.to_string(),
        });
    }

    info!(proxy = %key, "Removed proxy");
    Ok(StatusCode::NO_CONTENT)
}

/// Change the transport kind of a record
pub async fn update_schema(
    State(state): State<AppState>,
    Path((ip, port)): Path<(String, String)>,
    Json(body): Json<SchemaUpdate>,
) -> Result<impl IntoResponse, PoolError> {
    let key = key_from_path(&ip, &port)?;
    let schema = Schema::from_str(&body.schema)
        .ok_or_else(|| PoolError::UnsupportedSchema(body.schema.clone()))?;

    state.store.update_schema(key, schema).await?;
    info!(proxy = %key, schema = %schema, "Updated proxy schema");

    let record = state
        .store
        .get(key)
        .await?
        .ok_or_else(|| PoolError::ProxyNotFound {
            key: key.to_string(),
        })?;
    Ok(Json(record))
}

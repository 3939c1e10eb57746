//! REST API endpoints for network servers. Global admins only.

use crate::api::{CreatedId, IdPath};
use crate::authentication::BearerToken;
use crate::error::ApiError;
use crate::storage::{NetworkServer, NetworkServerStore};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, trace};

/// Creates a network server.
///
/// # Errors
///
/// Returns an error if the user is no global admin or the network server is invalid.
pub async fn create_network_server(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Json(mut network_server): Json<NetworkServer>,
) -> Result<Json<CreatedId>, ApiError> {
    trace!("Create network server request");
    state
        .authenticator
        .credentials(&token, 0)
        .await?
        .is_global_admin()?;

    let mut tx = state.store.begin().await?;
    tx.create_network_server(&mut network_server).await?;
    tx.commit().await?;
    info!(id = network_server.id, name = %network_server.name, "Network server created");
    Ok(Json(CreatedId {
        id: network_server.id,
    }))
}

/// Returns a network server without its TLS key.
///
/// # Errors
///
/// Returns an error if the user is no global admin or the network server does not exist.
pub async fn get_network_server(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(IdPath { id }): Path<IdPath>,
) -> Result<Json<NetworkServer>, ApiError> {
    trace!(id, "Get network server request");
    state
        .authenticator
        .credentials(&token, 0)
        .await?
        .is_global_admin()?;

    let mut tx = state.store.begin().await?;
    let mut network_server = tx.get_network_server(id).await?;
    tx.rollback().await?;
    network_server.tls_key.clear();
    Ok(Json(network_server))
}

/// Updates a network server. The ID of the path takes precedence over the body.
///
/// # Errors
///
/// Returns an error if the user is no global admin or the network server does not exist or is
/// invalid.
pub async fn update_network_server(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(IdPath { id }): Path<IdPath>,
    Json(mut network_server): Json<NetworkServer>,
) -> Result<StatusCode, ApiError> {
    trace!(id, "Update network server request");
    state
        .authenticator
        .credentials(&token, 0)
        .await?
        .is_global_admin()?;

    let mut tx = state.store.begin().await?;
    let current = tx.get_network_server(id).await?;
    network_server.id = id;
    network_server.created_at = current.created_at;
    network_server.updated_at = Utc::now();
    tx.update_network_server(&mut network_server).await?;
    tx.commit().await?;
    info!(id, "Network server updated");
    Ok(StatusCode::OK)
}

/// Deletes a network server.
///
/// # Errors
///
/// Returns an error if the user is no global admin or the network server does not exist.
pub async fn delete_network_server(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(IdPath { id }): Path<IdPath>,
) -> Result<StatusCode, ApiError> {
    trace!(id, "Delete network server request");
    state
        .authenticator
        .credentials(&token, 0)
        .await?
        .is_global_admin()?;

    let mut tx = state.store.begin().await?;
    tx.delete_network_server(id).await?;
    tx.commit().await?;
    info!(id, "Network server deleted");
    Ok(StatusCode::OK)
}

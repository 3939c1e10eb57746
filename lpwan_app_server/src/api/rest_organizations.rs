//! REST API endpoints for organizations.

use crate::api::{CreatedId, IdPath};
use crate::authentication::BearerToken;
use crate::error::ApiError;
use crate::storage::{Organization, OrganizationStore};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use tracing::{info, trace};

/// Creates an organization. Global admins only.
///
/// # Errors
///
/// Returns an error if the user is no global admin or the name is invalid or taken.
pub async fn create_organization(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Json(mut organization): Json<Organization>,
) -> Result<Json<CreatedId>, ApiError> {
    trace!("Create organization request");
    state
        .authenticator
        .credentials(&token, 0)
        .await?
        .is_global_admin()?;

    let mut tx = state.store.begin().await?;
    tx.create_organization(&mut organization).await?;
    tx.commit().await?;
    info!(id = organization.id, name = %organization.name, "Organization created");
    Ok(Json(CreatedId {
        id: organization.id,
    }))
}

/// Returns an organization to its members.
///
/// # Errors
///
/// Returns an error if the user is no member or the organization does not exist.
pub async fn get_organization(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(IdPath { id }): Path<IdPath>,
) -> Result<Json<Organization>, ApiError> {
    trace!(id, "Get organization request");
    state
        .authenticator
        .credentials(&token, id)
        .await?
        .is_org_user()?;

    let mut tx = state.store.begin().await?;
    let organization = tx.get_organization(id).await?;
    tx.rollback().await?;
    Ok(Json(organization))
}

/// Deletes an organization. Global admins only.
///
/// # Errors
///
/// Returns an error if the user is no global admin or the organization does not exist.
pub async fn delete_organization(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(IdPath { id }): Path<IdPath>,
) -> Result<StatusCode, ApiError> {
    trace!(id, "Delete organization request");
    state
        .authenticator
        .credentials(&token, id)
        .await?
        .is_global_admin()?;

    let mut tx = state.store.begin().await?;
    tx.delete_organization(id).await?;
    tx.commit().await?;
    info!(id, "Organization deleted");
    Ok(StatusCode::OK)
}

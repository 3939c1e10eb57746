//! REST API endpoint for the wallet balance of an organization, forwarded to the m2m server.

use crate::api::IdPath;
use crate::authentication::BearerToken;
use crate::error::ApiError;
use crate::AppState;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::Json;
use lpwan_grpc_clients::m2m::M2mClient;
use schemars::JsonSchema;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Reads wallet balances from the billing service.
#[async_trait]
pub trait WalletClient: Send + Sync + fmt::Debug {
    /// Returns the balance of the organization's wallet as seen by the user.
    async fn get_wallet_balance(
        &self,
        user_id: i64,
        org_id: i64,
    ) -> Result<f64, lpwan_grpc_clients::error::Error>;
}

#[async_trait]
impl WalletClient for M2mClient {
    async fn get_wallet_balance(
        &self,
        user_id: i64,
        org_id: i64,
    ) -> Result<f64, lpwan_grpc_clients::error::Error> {
        M2mClient::get_wallet_balance(self, user_id, org_id).await
    }
}

/// Wallet balance of an organization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, JsonSchema)]
pub struct WalletBalanceResponse {
    /// Balance.
    pub balance: f64,
}

/// Returns the wallet balance of an organization to its members.
///
/// # Errors
///
/// Returns an error if the user is no member or the m2m server failed.
pub async fn get_wallet_balance(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(IdPath { id }): Path<IdPath>,
) -> Result<Json<WalletBalanceResponse>, ApiError> {
    trace!(org_id = id, "Wallet balance request");
    let credentials = state.authenticator.credentials(&token, id).await?;
    credentials.is_org_user()?;

    let balance = state
        .wallet
        .get_wallet_balance(credentials.user_id, id)
        .await?;
    Ok(Json(WalletBalanceResponse { balance }))
}

//! REST API endpoints for gateways and their pings.

use crate::api::MacPath;
use crate::authentication::{BearerToken, Credentials};
use crate::error::ApiError;
use crate::storage::{
    Gateway, GatewayPing, GatewayPingRx, GatewayPingStore, GatewayStore, OrganizationStore,
};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use schemars::JsonSchema;
use serde::Serialize;
use std::sync::Arc;
use tonic::Code;
use tracing::{info, trace};

/// The last ping of a gateway with the receptions by other gateways.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct LastPingResponse {
    /// The sent ping.
    pub ping: GatewayPing,
    /// Receptions of the ping.
    pub rx: Vec<GatewayPingRx>,
}

/// Creates a gateway in an organization which may have gateways.
///
/// # Errors
///
/// Returns an error if the user is no gateway admin of the organization, the organization can
/// not have gateways or the gateway is invalid.
pub async fn create_gateway(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Json(mut gateway): Json<Gateway>,
) -> Result<StatusCode, ApiError> {
    trace!(mac = %gateway.mac, "Create gateway request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    Credentials::load(tx.as_mut(), &claims.username, gateway.organization_id)
        .await?
        .is_gateway_admin()?;
    let organization = tx.get_organization(gateway.organization_id).await?;
    if !organization.can_have_gateways {
        return Err(ApiError::new(
            Code::FailedPrecondition,
            "organization can not have gateways",
        ));
    }
    gateway.last_ping_id = None;
    gateway.last_ping_sent_at = None;
    tx.create_gateway(&mut gateway).await?;
    tx.commit().await?;
    info!(mac = %gateway.mac, organization_id = gateway.organization_id, "Gateway created");
    Ok(StatusCode::OK)
}

/// Returns a gateway to the members of its organization.
///
/// # Errors
///
/// Returns an error if the gateway does not exist or the user is no member.
pub async fn get_gateway(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(MacPath { mac }): Path<MacPath>,
) -> Result<Json<Gateway>, ApiError> {
    trace!(%mac, "Get gateway request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    let gateway = tx.get_gateway(mac, false).await?;
    Credentials::load(tx.as_mut(), &claims.username, gateway.organization_id)
        .await?
        .is_org_user()?;
    tx.rollback().await?;
    Ok(Json(gateway))
}

/// Deletes a gateway.
///
/// # Errors
///
/// Returns an error if the gateway does not exist or the user is no gateway admin of its
/// organization.
pub async fn delete_gateway(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(MacPath { mac }): Path<MacPath>,
) -> Result<StatusCode, ApiError> {
    trace!(%mac, "Delete gateway request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    let gateway = tx.get_gateway(mac, true).await?;
    Credentials::load(tx.as_mut(), &claims.username, gateway.organization_id)
        .await?
        .is_gateway_admin()?;
    tx.delete_gateway(mac).await?;
    tx.commit().await?;
    info!(%mac, "Gateway deleted");
    Ok(StatusCode::OK)
}

/// Returns the last ping sent by a gateway and its receptions.
///
/// # Errors
///
/// Returns an error if the gateway or its last ping does not exist or the user is no member of
/// its organization.
pub async fn get_last_ping(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(MacPath { mac }): Path<MacPath>,
) -> Result<Json<LastPingResponse>, ApiError> {
    trace!(%mac, "Get last ping request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    let gateway = tx.get_gateway(mac, false).await?;
    Credentials::load(tx.as_mut(), &claims.username, gateway.organization_id)
        .await?
        .is_org_user()?;
    let (ping, rx) = tx.get_last_gateway_ping_and_rx(mac).await?;
    tx.rollback().await?;
    Ok(Json(LastPingResponse { ping, rx }))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_app;
    use crate::authentication::tests::token;
    use crate::storage::memory::fixtures::gateway;
    use crate::lorawan::Eui64;
    use chrono::Utc;

    const AUD: &str = "lora-app-server";
    const MAC: Eui64 = Eui64([1, 1, 1, 1, 1, 1, 1, 1]);
    const OTHER_MAC: Eui64 = Eui64([2, 2, 2, 2, 2, 2, 2, 2]);

    #[tokio::test]
    async fn gateway_admin_creates_and_deletes() {
        let app = test_app().await;

        let err = create_gateway(
            State(app.state.clone()),
            token("member", AUD),
            Json(gateway(MAC, 1, 1)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);

        create_gateway(
            State(app.state.clone()),
            token("gateway-admin", AUD),
            Json(gateway(MAC, 1, 1)),
        )
        .await
        .unwrap();

        let Json(fetched) = get_gateway(
            State(app.state.clone()),
            token("member", AUD),
            Path(MacPath { mac: MAC }),
        )
        .await
        .unwrap();
        assert_eq!(fetched.organization_id, 1);

        let err = delete_gateway(
            State(app.state.clone()),
            token("member", AUD),
            Path(MacPath { mac: MAC }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
        delete_gateway(
            State(app.state.clone()),
            token("gateway-admin", AUD),
            Path(MacPath { mac: MAC }),
        )
        .await
        .unwrap();

        let err = get_gateway(State(app.state), token("member", AUD), Path(MacPath { mac: MAC }))
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn organization_without_gateways_is_rejected() {
        let app = test_app().await;
        app.store
            .with_data(|d| {
                d.organizations.get_mut(&1).unwrap().can_have_gateways = false;
            })
            .await;
        let err = create_gateway(
            State(app.state),
            token("admin", AUD),
            Json(gateway(MAC, 1, 1)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn last_ping_with_receptions() {
        let app = test_app().await;
        app.store
            .with_data(|d| {
                let mut gw = gateway(MAC, 1, 1);
                gw.last_ping_id = Some(5);
                d.gateways.insert(MAC, gw);
                d.gateways.insert(OTHER_MAC, gateway(OTHER_MAC, 1, 1));
                d.gateway_pings.insert(
                    5,
                    GatewayPing {
                        id: 5,
                        created_at: Utc::now(),
                        gateway_mac: MAC,
                        frequency: 868_100_000,
                        dr: 5,
                    },
                );
                d.gateway_ping_rx.push(GatewayPingRx {
                    id: 6,
                    created_at: Utc::now(),
                    ping_id: 5,
                    gateway_mac: OTHER_MAC,
                    received_at: Some(Utc::now()),
                    rssi: -80,
                    lora_snr: 7.5,
                    latitude: 1.0,
                    longitude: 2.0,
                    altitude: 3.0,
                });
            })
            .await;

        let Json(last) = get_last_ping(
            State(app.state.clone()),
            token("member", AUD),
            Path(MacPath { mac: MAC }),
        )
        .await
        .unwrap();
        assert_eq!(last.ping.id, 5);
        assert_eq!(last.rx.len(), 1);
        assert_eq!(last.rx[0].gateway_mac, OTHER_MAC);

        // never pinged
        let err = get_last_ping(
            State(app.state),
            token("member", AUD),
            Path(MacPath { mac: OTHER_MAC }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }
}

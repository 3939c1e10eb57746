//! REST API of the application server.
//!
//! Every handler authenticates the bearer token and checks the permissions of the user in the
//! organization owning the requested object. Errors are returned as [`crate::error::ApiError`].

use crate::lorawan::Eui64;
use crate::AppState;
use aide::axum::routing::{delete, get, post};
use aide::axum::{ApiRouter, IntoApiResponse};
use aide::openapi::{Info, OpenApi};
use axum::{Extension, Json, Router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod rest_fuota;
pub mod rest_gateways;
pub mod rest_network_servers;
pub mod rest_organizations;
pub mod rest_remote_sessions;
pub mod rest_server_info;
pub mod rest_wallet;

/// Response to a create request of an object with a serial ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
pub struct CreatedId {
    /// ID of the new object.
    pub id: i64,
}

/// Path of an object with a serial ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct IdPath {
    /// ID of the object.
    pub id: i64,
}

/// Path of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct MacPath {
    /// Gateway MAC.
    pub mac: Eui64,
}

/// Path of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct DevEuiPath {
    /// DevEUI of the device.
    pub dev_eui: Eui64,
}

/// Serves the generated OpenAPI spec.
pub async fn serve_api(Extension(api): Extension<OpenApi>) -> impl IntoApiResponse {
    Json(api)
}

/// Creates the router of all endpoints.
pub fn create_api(state: Arc<AppState>) -> Router {
    let mut api = OpenApi {
        info: Info {
            title: "LPWAN application server".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            ..Info::default()
        },
        ..OpenApi::default()
    };

    ApiRouter::new()
        .api_route("/api/server-info", get(rest_server_info::get_server_info))
        .api_route(
            "/api/network-servers",
            post(rest_network_servers::create_network_server),
        )
        .api_route(
            "/api/network-servers/:id",
            get(rest_network_servers::get_network_server)
                .put(rest_network_servers::update_network_server)
                .delete(rest_network_servers::delete_network_server),
        )
        .api_route(
            "/api/organizations",
            post(rest_organizations::create_organization),
        )
        .api_route(
            "/api/organizations/:id",
            get(rest_organizations::get_organization)
                .delete(rest_organizations::delete_organization),
        )
        .api_route(
            "/api/organizations/:id/wallet/balance",
            get(rest_wallet::get_wallet_balance),
        )
        .api_route("/api/gateways", post(rest_gateways::create_gateway))
        .api_route(
            "/api/gateways/:mac",
            get(rest_gateways::get_gateway).delete(rest_gateways::delete_gateway),
        )
        .api_route(
            "/api/gateways/:mac/ping",
            get(rest_gateways::get_last_ping),
        )
        .api_route(
            "/api/devices/:dev_eui/multicast-setups",
            post(rest_remote_sessions::create_multicast_setup),
        )
        .api_route(
            "/api/devices/:dev_eui/multicast-setups/:multicast_group_id",
            delete(rest_remote_sessions::delete_multicast_setup),
        )
        .api_route(
            "/api/devices/:dev_eui/multicast-class-c-sessions",
            post(rest_remote_sessions::create_multicast_class_c_session),
        )
        .api_route(
            "/api/devices/:dev_eui/fragmentation-sessions",
            post(rest_remote_sessions::create_fragmentation_session),
        )
        .api_route(
            "/api/devices/:dev_eui/fragmentation-sessions/:frag_index",
            delete(rest_remote_sessions::delete_fragmentation_session),
        )
        .api_route(
            "/api/devices/:dev_eui/fragmentation-sessions/:frag_index/status-request",
            post(rest_remote_sessions::request_fragmentation_session_status),
        )
        .api_route(
            "/api/fuota-deployments/:id/devices/:dev_eui",
            get(rest_fuota::get_deployment_device),
        )
        .route("/api/openapi.json", axum::routing::get(serve_api))
        .finish_api(&mut api)
        .layer(Extension(api))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

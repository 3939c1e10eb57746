//! REST API endpoint for the server info.

use crate::AppState;
use aide::axum::IntoApiResponse;
use axum::extract::State;
use axum::Json;
use schemars::JsonSchema;
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

/// Static information about this server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ServerInfo {
    /// Version of the application server.
    pub version: String,
    /// Address of the supernode.
    pub supernode_address: String,
    /// Region the MQTT integration serves.
    pub region: String,
}

/// Returns the server info. No authentication required.
pub async fn get_server_info(State(state): State<Arc<AppState>>) -> impl IntoApiResponse {
    trace!("Server info request");
    Json(state.server_info.clone())
}

//! REST API endpoint for the state of a device in a FUOTA deployment.

use crate::authentication::{BearerToken, Credentials};
use crate::error::ApiError;
use crate::lorawan::Eui64;
use crate::storage::{DeviceStore, FuotaDeploymentDevice, FuotaDeploymentStore};
use crate::AppState;
use axum::extract::{Path, State};
use axum::Json;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Path of a device in a FUOTA deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct DeploymentDevicePath {
    /// FUOTA deployment.
    pub id: Uuid,
    /// DevEUI of the device.
    pub dev_eui: Eui64,
}

/// Returns the state of a device in a FUOTA deployment to the device admins.
///
/// # Errors
///
/// Returns an error if the user is no device admin of the device's organization or the device
/// is not part of the deployment.
pub async fn get_deployment_device(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(DeploymentDevicePath { id, dev_eui }): Path<DeploymentDevicePath>,
) -> Result<Json<FuotaDeploymentDevice>, ApiError> {
    trace!(%id, %dev_eui, "Get FUOTA deployment device request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    let device = tx.get_device(dev_eui).await?;
    Credentials::load(tx.as_mut(), &claims.username, device.organization_id)
        .await?
        .is_device_admin()?;
    let deployment_device = tx.get_fuota_deployment_device(id, dev_eui).await?;
    tx.rollback().await?;
    Ok(Json(deployment_device))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_app;
    use crate::authentication::tests::token;
    use crate::storage::memory::fixtures::{device, fuota_deployment_device};
    use crate::storage::FuotaDeploymentDeviceState;
    use tonic::Code;

    const AUD: &str = "lora-app-server";
    const DEV_EUI: Eui64 = Eui64([8, 7, 6, 5, 4, 3, 2, 1]);

    #[tokio::test]
    async fn device_admin_reads_deployment_state() {
        let app = test_app().await;
        let deployment = Uuid::new_v4();
        app.store
            .with_data(|d| {
                d.devices.insert(DEV_EUI, device(DEV_EUI, 1));
                let mut entry = fuota_deployment_device(deployment, DEV_EUI);
                entry.state = FuotaDeploymentDeviceState::Error;
                entry.error_message = "Fragmentation session setup failed".to_owned();
                d.fuota_deployment_devices
                    .insert((deployment, DEV_EUI), entry);
            })
            .await;

        let Json(entry) = get_deployment_device(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(DeploymentDevicePath {
                id: deployment,
                dev_eui: DEV_EUI,
            }),
        )
        .await
        .unwrap();
        assert_eq!(entry.state, FuotaDeploymentDeviceState::Error);
        assert_eq!(entry.error_message, "Fragmentation session setup failed");

        let err = get_deployment_device(
            State(app.state.clone()),
            token("member", AUD),
            Path(DeploymentDevicePath {
                id: deployment,
                dev_eui: DEV_EUI,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);

        let err = get_deployment_device(
            State(app.state),
            token("device-admin", AUD),
            Path(DeploymentDevicePath {
                id: Uuid::new_v4(),
                dev_eui: DEV_EUI,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }
}

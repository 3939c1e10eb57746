//! REST API endpoints for the remote multicast setups, class C sessions and fragmentation
//! sessions of a device.
//!
//! The endpoints only record the desired state. The synchronisation loops of the application
//! layer send the requests to the device.

use crate::api::DevEuiPath;
use crate::applayer::fragmentation;
use crate::authentication::{BearerToken, Claims, Credentials};
use crate::error::ApiError;
use crate::lorawan::{Aes128Key, Eui64, FragDescriptor};
use crate::storage::{
    Device, DeviceStore, MulticastGroupStore, RemoteFragmentationSession,
    RemoteFragmentationSessionStore, RemoteMulticastClassCSession,
    RemoteMulticastClassCSessionStore, RemoteMulticastSetup, RemoteMulticastSetupStore,
    RemoteSessionState, Transaction,
};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tonic::Code;
use tracing::{info, trace};
use uuid::Uuid;

/// Path of a multicast setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct MulticastSetupPath {
    /// DevEUI of the device.
    pub dev_eui: Eui64,
    /// Multicast group.
    pub multicast_group_id: Uuid,
}

/// Path of a fragmentation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct FragmentationSessionPath {
    /// DevEUI of the device.
    pub dev_eui: Eui64,
    /// FragIndex slot.
    pub frag_index: i32,
}

/// Request to set up a multicast group on a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct CreateMulticastSetupRequest {
    /// Multicast group to set up.
    pub multicast_group_id: Uuid,
    /// McGroupID slot on the device, 0-3.
    pub mc_group_id: i32,
    /// McKey encrypted with the McKEKey of the device.
    pub mc_key_encrypted: Aes128Key,
    /// Lowest accepted frame counter.
    pub min_mc_f_cnt: i64,
    /// Highest accepted frame counter.
    pub max_mc_f_cnt: i64,
    /// Seconds between two attempts.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: i64,
}

/// Request to start a class C session of a multicast group set up on a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct CreateMulticastClassCSessionRequest {
    /// Multicast group of the session.
    pub multicast_group_id: Uuid,
    /// Start of the session.
    pub session_time: DateTime<Utc>,
    /// Session length as exponent, the session lasts 2^TimeOut seconds. 0-15.
    pub session_time_out: i32,
    /// Seconds between two attempts.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: i64,
}

/// Request to set up a fragmentation session on a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct CreateFragmentationSessionRequest {
    /// FragIndex slot on the device, 0-3.
    pub frag_index: i32,
    /// McGroupIDs the fragments are sent to, empty for unicast.
    #[serde(default)]
    pub mc_group_ids: Vec<i32>,
    /// Number of fragments.
    pub nb_frag: i32,
    /// Size of a fragment in bytes.
    pub frag_size: i32,
    /// Fragmentation matrix.
    #[serde(default)]
    pub fragmentation_matrix: i32,
    /// BlockAckDelay exponent.
    #[serde(default)]
    pub block_ack_delay: i32,
    /// Padding bytes of the last fragment.
    #[serde(default)]
    pub padding: i32,
    /// Descriptor of the transported file.
    #[serde(default)]
    pub descriptor: FragDescriptor,
    /// Seconds between two attempts.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: i64,
}

/// Default for the retry intervals of the requests.
fn default_retry_interval_secs() -> i64 {
    60
}

/// Loads the device and requires device admin rights in its organization.
async fn device_for_admin(
    tx: &mut dyn Transaction,
    claims: &Claims,
    dev_eui: Eui64,
) -> Result<Device, ApiError> {
    let device = tx.get_device(dev_eui).await?;
    Credentials::load(tx, &claims.username, device.organization_id)
        .await?
        .is_device_admin()?;
    Ok(device)
}

/// Creates a multicast setup which is sent to the device by the synchronisation loop.
///
/// # Errors
///
/// Returns an error if the user is no device admin, the device or multicast group does not
/// exist, the slot is invalid or the group is set up on the device already.
pub async fn create_multicast_setup(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(DevEuiPath { dev_eui }): Path<DevEuiPath>,
    Json(request): Json<CreateMulticastSetupRequest>,
) -> Result<StatusCode, ApiError> {
    trace!(
        %dev_eui,
        multicast_group_id = %request.multicast_group_id,
        "Create multicast setup request"
    );
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    device_for_admin(tx.as_mut(), &claims, dev_eui).await?;
    let group = tx.get_multicast_group(request.multicast_group_id).await?;
    let now = Utc::now();
    let mut setup = RemoteMulticastSetup {
        dev_eui,
        multicast_group_id: group.id,
        created_at: now,
        updated_at: now,
        mc_group_id: request.mc_group_id,
        mc_addr: group.mc_addr,
        mc_key_encrypted: request.mc_key_encrypted,
        min_mc_f_cnt: request.min_mc_f_cnt,
        max_mc_f_cnt: request.max_mc_f_cnt,
        state: RemoteSessionState::Setup,
        state_provisioned: false,
        retry_after: now,
        retry_count: 0,
        retry_interval_secs: request.retry_interval_secs,
    };
    tx.create_remote_multicast_setup(&mut setup).await?;
    tx.commit().await?;
    info!(
        %dev_eui,
        multicast_group_id = %group.id,
        mc_group_id = setup.mc_group_id,
        "Multicast setup created"
    );
    Ok(StatusCode::OK)
}

/// Marks a multicast setup for deletion on the device.
///
/// The device leaves the multicast group once it confirmed the deletion.
///
/// # Errors
///
/// Returns an error if the user is no device admin or the setup does not exist.
pub async fn delete_multicast_setup(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(MulticastSetupPath {
        dev_eui,
        multicast_group_id,
    }): Path<MulticastSetupPath>,
) -> Result<StatusCode, ApiError> {
    trace!(%dev_eui, %multicast_group_id, "Delete multicast setup request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    device_for_admin(tx.as_mut(), &claims, dev_eui).await?;
    let mut setup = tx
        .get_remote_multicast_setup(dev_eui, multicast_group_id, true)
        .await?;
    setup.state = RemoteSessionState::Delete;
    setup.state_provisioned = false;
    setup.retry_count = 0;
    setup.retry_after = Utc::now();
    tx.update_remote_multicast_setup(&mut setup).await?;
    tx.commit().await?;
    info!(%dev_eui, %multicast_group_id, "Multicast setup marked for deletion");
    Ok(StatusCode::OK)
}

/// Creates a class C session for a multicast group provisioned on the device.
///
/// # Errors
///
/// Returns an error if the user is no device admin, the session time out is out of range or
/// the multicast group is not provisioned on the device.
pub async fn create_multicast_class_c_session(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(DevEuiPath { dev_eui }): Path<DevEuiPath>,
    Json(request): Json<CreateMulticastClassCSessionRequest>,
) -> Result<StatusCode, ApiError> {
    trace!(
        %dev_eui,
        multicast_group_id = %request.multicast_group_id,
        "Create class C session request"
    );
    let claims = state.authenticator.claims(&token)?;
    if !(0..=15).contains(&request.session_time_out) {
        return Err(ApiError::new(
            Code::InvalidArgument,
            "session time out must be between 0 and 15",
        ));
    }

    let mut tx = state.store.begin().await?;
    device_for_admin(tx.as_mut(), &claims, dev_eui).await?;
    let setup = tx
        .get_remote_multicast_setup(dev_eui, request.multicast_group_id, false)
        .await?;
    if setup.state != RemoteSessionState::Setup || !setup.state_provisioned {
        return Err(ApiError::new(
            Code::FailedPrecondition,
            "multicast group is not provisioned on the device",
        ));
    }
    let group = tx.get_multicast_group(request.multicast_group_id).await?;
    let now = Utc::now();
    let mut session = RemoteMulticastClassCSession {
        dev_eui,
        multicast_group_id: group.id,
        created_at: now,
        updated_at: now,
        mc_group_id: setup.mc_group_id,
        session_time: request.session_time,
        session_time_out: request.session_time_out,
        dl_frequency: group.frequency,
        dr: group.dr,
        state_provisioned: false,
        retry_after: now,
        retry_count: 0,
        retry_interval_secs: request.retry_interval_secs,
    };
    tx.create_remote_multicast_class_c_session(&mut session)
        .await?;
    tx.commit().await?;
    info!(%dev_eui, multicast_group_id = %group.id, "Class C session created");
    Ok(StatusCode::OK)
}

/// Creates a fragmentation session which is sent to the device by the synchronisation loop.
///
/// # Errors
///
/// Returns an error if the user is no device admin, a slot or parameter is invalid or the
/// FragIndex is in use already.
pub async fn create_fragmentation_session(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(DevEuiPath { dev_eui }): Path<DevEuiPath>,
    Json(request): Json<CreateFragmentationSessionRequest>,
) -> Result<StatusCode, ApiError> {
    trace!(%dev_eui, frag_index = request.frag_index, "Create fragmentation session request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    device_for_admin(tx.as_mut(), &claims, dev_eui).await?;
    let now = Utc::now();
    let mut session = RemoteFragmentationSession {
        dev_eui,
        frag_index: request.frag_index,
        created_at: now,
        updated_at: now,
        mc_group_ids: request.mc_group_ids,
        nb_frag: request.nb_frag,
        frag_size: request.frag_size,
        fragmentation_matrix: request.fragmentation_matrix,
        block_ack_delay: request.block_ack_delay,
        padding: request.padding,
        descriptor: request.descriptor,
        state: RemoteSessionState::Setup,
        state_provisioned: false,
        retry_after: now,
        retry_count: 0,
        retry_interval_secs: request.retry_interval_secs,
    };
    tx.create_remote_fragmentation_session(&mut session)
        .await?;
    tx.commit().await?;
    info!(%dev_eui, frag_index = session.frag_index, "Fragmentation session created");
    Ok(StatusCode::OK)
}

/// Marks a fragmentation session for deletion on the device.
///
/// # Errors
///
/// Returns an error if the user is no device admin or the session does not exist.
pub async fn delete_fragmentation_session(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(FragmentationSessionPath {
        dev_eui,
        frag_index,
    }): Path<FragmentationSessionPath>,
) -> Result<StatusCode, ApiError> {
    trace!(%dev_eui, frag_index, "Delete fragmentation session request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    device_for_admin(tx.as_mut(), &claims, dev_eui).await?;
    let mut session = tx
        .get_remote_fragmentation_session(dev_eui, frag_index, true)
        .await?;
    session.state = RemoteSessionState::Delete;
    session.state_provisioned = false;
    session.retry_count = 0;
    session.retry_after = Utc::now();
    tx.update_remote_fragmentation_session(&mut session)
        .await?;
    tx.commit().await?;
    info!(%dev_eui, frag_index, "Fragmentation session marked for deletion");
    Ok(StatusCode::OK)
}

/// Asks the device for the status of a fragmentation session.
///
/// The answer is handled by the uplink router.
///
/// # Errors
///
/// Returns an error if the user is no device admin, the session does not exist or the request
/// could not be enqueued.
pub async fn request_fragmentation_session_status(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(FragmentationSessionPath {
        dev_eui,
        frag_index,
    }): Path<FragmentationSessionPath>,
) -> Result<StatusCode, ApiError> {
    trace!(%dev_eui, frag_index, "Fragmentation session status request");
    let claims = state.authenticator.claims(&token)?;

    let mut tx = state.store.begin().await?;
    device_for_admin(tx.as_mut(), &claims, dev_eui).await?;
    tx.get_remote_fragmentation_session(dev_eui, frag_index, false)
        .await?;
    tx.rollback().await?;

    fragmentation::request_fragmentation_session_status(
        state.enqueuer.as_ref(),
        dev_eui,
        frag_index,
    )
    .await?;
    Ok(StatusCode::OK)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_app;
    use crate::authentication::tests::token;
    use crate::storage::memory::fixtures::{
        device, fragmentation_session, multicast_group, multicast_setup,
    };
    use crate::storage::memory::MemoryStore;

    const AUD: &str = "lora-app-server";
    const DEV_EUI: Eui64 = Eui64([1, 2, 3, 4, 5, 6, 7, 8]);

    async fn seed(store: &MemoryStore) -> Uuid {
        let group = Uuid::new_v4();
        store
            .with_data(|d| {
                d.devices.insert(DEV_EUI, device(DEV_EUI, 1));
                d.multicast_groups.insert(group, multicast_group(group));
            })
            .await;
        group
    }

    fn setup_request(group: Uuid, mc_group_id: i32) -> CreateMulticastSetupRequest {
        CreateMulticastSetupRequest {
            multicast_group_id: group,
            mc_group_id,
            mc_key_encrypted: Aes128Key([7; 16]),
            min_mc_f_cnt: 0,
            max_mc_f_cnt: 100,
            retry_interval_secs: 30,
        }
    }

    #[tokio::test]
    async fn multicast_setup_lifecycle() {
        let app = test_app().await;
        let group = seed(&app.store).await;

        let err = create_multicast_setup(
            State(app.state.clone()),
            token("member", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(setup_request(group, 1)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);

        create_multicast_setup(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(setup_request(group, 1)),
        )
        .await
        .unwrap();
        app.store
            .with_data(|d| {
                let setup = &d.multicast_setups[&(DEV_EUI, group)];
                assert_eq!(setup.mc_addr, d.multicast_groups[&group].mc_addr);
                assert_eq!(setup.state, RemoteSessionState::Setup);
                assert!(!setup.state_provisioned);
                assert_eq!(setup.retry_interval_secs, 30);
            })
            .await;

        let err = create_multicast_setup(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(setup_request(group, 1)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::AlreadyExists);

        delete_multicast_setup(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(MulticastSetupPath {
                dev_eui: DEV_EUI,
                multicast_group_id: group,
            }),
        )
        .await
        .unwrap();
        app.store
            .with_data(|d| {
                let setup = &d.multicast_setups[&(DEV_EUI, group)];
                assert_eq!(setup.state, RemoteSessionState::Delete);
                assert!(!setup.state_provisioned);
            })
            .await;
    }

    #[tokio::test]
    async fn invalid_mc_group_id_is_rejected() {
        let app = test_app().await;
        let group = seed(&app.store).await;
        let err = create_multicast_setup(
            State(app.state),
            token("device-admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(setup_request(group, 4)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn class_c_session_requires_provisioned_setup() {
        let app = test_app().await;
        let group = seed(&app.store).await;
        app.store
            .with_data(|d| {
                d.multicast_setups
                    .insert((DEV_EUI, group), multicast_setup(DEV_EUI, group, 2));
            })
            .await;
        let request = CreateMulticastClassCSessionRequest {
            multicast_group_id: group,
            session_time: Utc::now(),
            session_time_out: 8,
            retry_interval_secs: 30,
        };

        let err = create_multicast_class_c_session(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(request.clone()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::FailedPrecondition);

        app.store
            .with_data(|d| {
                d.multicast_setups
                    .get_mut(&(DEV_EUI, group))
                    .unwrap()
                    .state_provisioned = true;
            })
            .await;
        create_multicast_class_c_session(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(request.clone()),
        )
        .await
        .unwrap();
        app.store
            .with_data(|d| {
                let session = &d.class_c_sessions[&(DEV_EUI, group)];
                assert_eq!(session.mc_group_id, 2);
                assert_eq!(session.dl_frequency, d.multicast_groups[&group].frequency);
                assert_eq!(session.dr, d.multicast_groups[&group].dr);
            })
            .await;

        let err = create_multicast_class_c_session(
            State(app.state),
            token("device-admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(CreateMulticastClassCSessionRequest {
                session_time_out: 16,
                ..request
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn fragmentation_session_lifecycle() {
        let app = test_app().await;
        seed(&app.store).await;
        let request = CreateFragmentationSessionRequest {
            frag_index: 0,
            mc_group_ids: vec![1],
            nb_frag: 10,
            frag_size: 50,
            fragmentation_matrix: 0,
            block_ack_delay: 1,
            padding: 3,
            descriptor: FragDescriptor([1, 2, 3, 4]),
            retry_interval_secs: 30,
        };

        create_fragmentation_session(
            State(app.state.clone()),
            token("admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(request),
        )
        .await
        .unwrap();
        app.store
            .with_data(|d| {
                let session = &d.fragmentation_sessions[&(DEV_EUI, 0)];
                assert_eq!(session.mc_group_ids, vec![1]);
                assert_eq!(session.state, RemoteSessionState::Setup);
            })
            .await;

        delete_fragmentation_session(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(FragmentationSessionPath {
                dev_eui: DEV_EUI,
                frag_index: 0,
            }),
        )
        .await
        .unwrap();
        app.store
            .with_data(|d| {
                assert_eq!(
                    d.fragmentation_sessions[&(DEV_EUI, 0)].state,
                    RemoteSessionState::Delete
                );
            })
            .await;

        let err = delete_fragmentation_session(
            State(app.state),
            token("device-admin", AUD),
            Path(FragmentationSessionPath {
                dev_eui: DEV_EUI,
                frag_index: 3,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn fragmentation_parameters_out_of_range() {
        let app = test_app().await;
        seed(&app.store).await;
        let err = create_fragmentation_session(
            State(app.state.clone()),
            token("admin", AUD),
            Path(DevEuiPath { dev_eui: DEV_EUI }),
            Json(CreateFragmentationSessionRequest {
                frag_index: 0,
                mc_group_ids: Vec::new(),
                nb_frag: 10,
                frag_size: 300,
                fragmentation_matrix: 0,
                block_ack_delay: 1,
                padding: 3,
                descriptor: FragDescriptor([1, 2, 3, 4]),
                retry_interval_secs: 30,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert!(
            app.store
                .with_data(|d| d.fragmentation_sessions.is_empty())
                .await
        );
    }

    #[tokio::test]
    async fn status_request_is_enqueued() {
        let app = test_app().await;
        seed(&app.store).await;
        app.store
            .with_data(|d| {
                d.fragmentation_sessions
                    .insert((DEV_EUI, 2), fragmentation_session(DEV_EUI, 2));
            })
            .await;

        request_fragmentation_session_status(
            State(app.state.clone()),
            token("device-admin", AUD),
            Path(FragmentationSessionPath {
                dev_eui: DEV_EUI,
                frag_index: 2,
            }),
        )
        .await
        .unwrap();
        let enqueued = app.enqueuer.enqueued.lock().unwrap().clone();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].dev_eui, DEV_EUI);
        assert_eq!(enqueued[0].f_port, fragmentation::commands::FPORT);

        let err = request_fragmentation_session_status(
            State(app.state),
            token("device-admin", AUD),
            Path(FragmentationSessionPath {
                dev_eui: DEV_EUI,
                frag_index: 1,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let app = test_app().await;
        let err = delete_fragmentation_session(
            State(app.state),
            token("device-admin", AUD),
            Path(FragmentationSessionPath {
                dev_eui: DEV_EUI,
                frag_index: 0,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }
}

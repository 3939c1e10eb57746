//! Multicast setup and class C session synchronisation and answer handling (FPort 200).

pub mod commands;

use crate::applayer::multicastsetup::commands::{
    gps_epoch_seconds, MulticastSetupAnswer, MulticastSetupRequest, FPORT,
};
use crate::applayer::{field, in_transaction, next_retry_after, DownlinkEnqueuer};
use crate::configuration::SyncConfig;
use crate::error::{ApplayerError, StorageError};
use crate::graceful_shutdown::ShutdownAgent;
use crate::lorawan::Eui64;
use crate::storage::{
    RemoteMulticastClassCSession, RemoteMulticastSetup, RemoteSessionState, Store, Transaction,
};
use std::sync::Arc;
use tracing::{error, info, trace, warn};

/// Periodically sends the requests of all pending multicast setups until shut down.
#[tracing::instrument(skip_all)]
pub async fn sync_remote_multicast_setup_loop(
    store: Arc<dyn Store>,
    enqueuer: Arc<dyn DownlinkEnqueuer>,
    config: SyncConfig,
    mut shutdown_agent: ShutdownAgent,
) {
    loop {
        if let Err(err) =
            sync_remote_multicast_setups(store.as_ref(), enqueuer.as_ref(), config).await
        {
            error!(%err, "sync remote multicast-setup error");
        }

        tokio::select! {
            _ = tokio::time::sleep(config.sync_interval()) => {}
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down multicast setup sync");
                return;
            }
        }
    }
}

/// Periodically sends the requests of all pending class C sessions until shut down.
#[tracing::instrument(skip_all)]
pub async fn sync_remote_multicast_class_c_loop(
    store: Arc<dyn Store>,
    enqueuer: Arc<dyn DownlinkEnqueuer>,
    config: SyncConfig,
    mut shutdown_agent: ShutdownAgent,
) {
    loop {
        if let Err(err) =
            sync_remote_multicast_class_c_sessions(store.as_ref(), enqueuer.as_ref(), config)
                .await
        {
            error!(%err, "sync remote multicast class-c session error");
        }

        tokio::select! {
            _ = tokio::time::sleep(config.sync_interval()) => {}
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down class C session sync");
                return;
            }
        }
    }
}

/// Sends the requests of up to `sync_batch_size` pending setups in one transaction.
///
/// # Errors
///
/// Returns an error and rolls back if a request can not be enqueued or stored.
pub async fn sync_remote_multicast_setups(
    store: &dyn Store,
    enqueuer: &dyn DownlinkEnqueuer,
    config: SyncConfig,
) -> Result<(), ApplayerError> {
    in_transaction(store, |mut tx| async move {
        let result = sync_pending_setups(tx.as_mut(), enqueuer, config).await;
        (tx, result)
    })
    .await
}

/// Synchronises the pending setups within `tx`.
async fn sync_pending_setups(
    tx: &mut dyn Transaction,
    enqueuer: &dyn DownlinkEnqueuer,
    config: SyncConfig,
) -> Result<(), ApplayerError> {
    let items = tx
        .get_pending_remote_multicast_setup_items(config.sync_batch_size, config.sync_retries)
        .await?;
    for item in items {
        sync_remote_multicast_setup(tx, enqueuer, item).await?;
    }
    Ok(())
}

/// Sends the requests of up to `sync_batch_size` pending class C sessions in one transaction.
///
/// # Errors
///
/// Returns an error and rolls back if a request can not be enqueued or stored.
pub async fn sync_remote_multicast_class_c_sessions(
    store: &dyn Store,
    enqueuer: &dyn DownlinkEnqueuer,
    config: SyncConfig,
) -> Result<(), ApplayerError> {
    in_transaction(store, |mut tx| async move {
        let result = sync_pending_class_c_sessions(tx.as_mut(), enqueuer, config).await;
        (tx, result)
    })
    .await
}

/// Synchronises the pending class C sessions within `tx`.
async fn sync_pending_class_c_sessions(
    tx: &mut dyn Transaction,
    enqueuer: &dyn DownlinkEnqueuer,
    config: SyncConfig,
) -> Result<(), ApplayerError> {
    let items = tx
        .get_pending_remote_multicast_class_c_sessions(config.sync_batch_size, config.sync_retries)
        .await?;
    for item in items {
        sync_remote_multicast_class_c_session(tx, enqueuer, item).await?;
    }
    Ok(())
}

/// Builds the request for the requested state of the setup.
fn setup_request_for(setup: &RemoteMulticastSetup) -> Result<MulticastSetupRequest, ApplayerError> {
    let mc_group_id = field("McGroupID", i64::from(setup.mc_group_id))?;
    Ok(match setup.state {
        RemoteSessionState::Setup => MulticastSetupRequest::McGroupSetupReq {
            mc_group_id,
            mc_addr: setup.mc_addr,
            mc_key_encrypted: setup.mc_key_encrypted,
            min_mc_f_cnt: field("minMcFCnt", setup.min_mc_f_cnt)?,
            max_mc_f_cnt: field("maxMcFCnt", setup.max_mc_f_cnt)?,
        },
        RemoteSessionState::Delete => MulticastSetupRequest::McGroupDeleteReq { mc_group_id },
    })
}

/// Enqueues the request of one setup and schedules the next attempt.
///
/// A setup whose request can not be encoded is not sent but still counts as an attempt.
async fn sync_remote_multicast_setup(
    tx: &mut dyn Transaction,
    enqueuer: &dyn DownlinkEnqueuer,
    mut setup: RemoteMulticastSetup,
) -> Result<(), ApplayerError> {
    match setup_request_for(&setup) {
        Ok(request) => {
            enqueuer
                .enqueue(setup.dev_eui, FPORT, false, request.to_bytes())
                .await?;
            info!(
                dev_eui = %setup.dev_eui,
                mc_group_id = setup.mc_group_id,
                "{} enqueued",
                request.name()
            );
        }
        Err(err) => error!(
            %err,
            dev_eui = %setup.dev_eui,
            mc_group_id = setup.mc_group_id,
            "multicast setup request can not be encoded"
        ),
    }

    setup.retry_count += 1;
    setup.retry_after = next_retry_after(setup.retry_interval_secs);
    tx.update_remote_multicast_setup(&mut setup).await?;
    Ok(())
}

/// Builds the McClassCSessionReq of the session.
fn class_c_request_for(
    session: &RemoteMulticastClassCSession,
) -> Result<MulticastSetupRequest, ApplayerError> {
    Ok(MulticastSetupRequest::McClassCSessionReq {
        mc_group_id: field("McGroupID", i64::from(session.mc_group_id))?,
        session_time: gps_epoch_seconds(session.session_time),
        session_time_out: field("SessionTimeOut", i64::from(session.session_time_out))?,
        dl_frequency: field("DLFrequency", i64::from(session.dl_frequency))?,
        dr: field("DR", i64::from(session.dr))?,
    })
}

/// Enqueues the McClassCSessionReq of one session and schedules the next attempt.
///
/// A session whose request can not be encoded is not sent but still counts as an attempt.
async fn sync_remote_multicast_class_c_session(
    tx: &mut dyn Transaction,
    enqueuer: &dyn DownlinkEnqueuer,
    mut session: RemoteMulticastClassCSession,
) -> Result<(), ApplayerError> {
    match class_c_request_for(&session) {
        Ok(request) => {
            enqueuer
                .enqueue(session.dev_eui, FPORT, false, request.to_bytes())
                .await?;
            info!(
                dev_eui = %session.dev_eui,
                mc_group_id = session.mc_group_id,
                "{} enqueued",
                request.name()
            );
        }
        Err(err) => error!(
            %err,
            dev_eui = %session.dev_eui,
            mc_group_id = session.mc_group_id,
            "multicast class C session request can not be encoded"
        ),
    }

    session.retry_count += 1;
    session.retry_after = next_retry_after(session.retry_interval_secs);
    tx.update_remote_multicast_class_c_session(&mut session)
        .await?;
    Ok(())
}

/// Handles a multicast setup answer sent by `dev_eui`.
///
/// # Errors
///
/// Returns an error if the payload can not be parsed, the answer reports an error or the
/// referenced setup or session does not exist.
pub async fn handle_uplink(
    tx: &mut dyn Transaction,
    dev_eui: Eui64,
    payload: &[u8],
) -> Result<(), ApplayerError> {
    match commands::parse_answer(payload)? {
        MulticastSetupAnswer::McGroupSetupAns {
            mc_group_id,
            id_error,
        } => {
            info!(%dev_eui, mc_group_id, id_error, "McGroupSetupAns received");
            if id_error {
                return Err(ApplayerError::AnswerFlags {
                    command: "McGroupSetupAns",
                    flags: format!("IDError for McGroupID: {mc_group_id}"),
                });
            }
            let mut setup = tx
                .get_remote_multicast_setup_by_group_id(dev_eui, i32::from(mc_group_id), true)
                .await?;
            setup.state_provisioned = true;
            tx.update_remote_multicast_setup(&mut setup).await?;
            Ok(())
        }
        MulticastSetupAnswer::McGroupDeleteAns {
            mc_group_id,
            mc_group_undefined,
        } => {
            info!(
                %dev_eui,
                mc_group_id,
                mc_group_undefined,
                "McGroupDeleteAns received"
            );
            if mc_group_undefined {
                return Err(ApplayerError::AnswerFlags {
                    command: "McGroupDeleteAns",
                    flags: format!("McGroupUndefined for McGroupID: {mc_group_id}"),
                });
            }
            let mut setup = tx
                .get_remote_multicast_setup_by_group_id(dev_eui, i32::from(mc_group_id), true)
                .await?;
            setup.state_provisioned = true;
            tx.update_remote_multicast_setup(&mut setup).await?;

            match tx
                .remove_device_from_multicast_group(setup.multicast_group_id, dev_eui)
                .await
            {
                Ok(()) => Ok(()),
                Err(StorageError::DoesNotExist) => {
                    info!(
                        %dev_eui,
                        multicast_group_id = %setup.multicast_group_id,
                        "removing device from multicast group, but device does not exist"
                    );
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        }
        MulticastSetupAnswer::McClassCSessionAns {
            mc_group_id,
            dr_error,
            freq_error,
            mc_group_undefined,
            time_to_start,
        } => {
            info!(
                %dev_eui,
                mc_group_id,
                dr_error,
                freq_error,
                mc_group_undefined,
                ?time_to_start,
                "McClassCSessionAns received"
            );
            if dr_error || freq_error || mc_group_undefined {
                return Err(ApplayerError::AnswerFlags {
                    command: "McClassCSessionAns",
                    flags: format!(
                        "DRError: {dr_error}, FreqError: {freq_error}, McGroupUndefined: {mc_group_undefined} for McGroupID: {mc_group_id}"
                    ),
                });
            }
            let mut session = tx
                .get_remote_multicast_class_c_session_by_group_id(
                    dev_eui,
                    i32::from(mc_group_id),
                    true,
                )
                .await?;
            session.state_provisioned = true;
            tx.update_remote_multicast_class_c_session(&mut session)
                .await?;

            match tx
                .add_device_to_multicast_group(session.multicast_group_id, dev_eui)
                .await
            {
                Ok(()) => Ok(()),
                Err(StorageError::AlreadyExists) => {
                    warn!(
                        %dev_eui,
                        multicast_group_id = %session.multicast_group_id,
                        "adding device to multicast group, but device was already added"
                    );
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

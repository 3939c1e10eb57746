//! Fragmentation session synchronisation and answer handling (FPort 201).

pub mod commands;

use crate::applayer::fragmentation::commands::{
    FragSessionSetupReq, FragmentationAnswer, FragmentationRequest, FPORT,
};
use crate::applayer::{field, in_transaction, next_retry_after, DownlinkEnqueuer};
use crate::configuration::SyncConfig;
use crate::error::ApplayerError;
use crate::graceful_shutdown::ShutdownAgent;
use crate::lorawan::Eui64;
use crate::storage::{
    FuotaDeploymentDeviceState, RemoteFragmentationSession, RemoteSessionState, Store,
    Transaction,
};
use std::sync::Arc;
use tracing::{error, info, trace};

/// Periodically sends the requests of all pending fragmentation sessions until shut down.
#[tracing::instrument(skip_all)]
pub async fn sync_remote_fragmentation_sessions_loop(
    store: Arc<dyn Store>,
    enqueuer: Arc<dyn DownlinkEnqueuer>,
    config: SyncConfig,
    mut shutdown_agent: ShutdownAgent,
) {
    loop {
        if let Err(err) =
            sync_remote_fragmentation_sessions(store.as_ref(), enqueuer.as_ref(), config).await
        {
            error!(%err, "sync remote fragmentation sessions error");
        }

        tokio::select! {
            _ = tokio::time::sleep(config.sync_interval()) => {}
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down fragmentation session sync");
                return;
            }
        }
    }
}

/// Sends the requests of up to `sync_batch_size` pending sessions in one transaction.
///
/// # Errors
///
/// Returns an error and rolls back if a request can not be enqueued or stored.
pub async fn sync_remote_fragmentation_sessions(
    store: &dyn Store,
    enqueuer: &dyn DownlinkEnqueuer,
    config: SyncConfig,
) -> Result<(), ApplayerError> {
    in_transaction(store, |mut tx| async move {
        let result = sync_pending(tx.as_mut(), enqueuer, config).await;
        (tx, result)
    })
    .await
}

/// Fetches the pending sessions and syncs each of them.
async fn sync_pending(
    tx: &mut dyn Transaction,
    enqueuer: &dyn DownlinkEnqueuer,
    config: SyncConfig,
) -> Result<(), ApplayerError> {
    let items = tx
        .get_pending_remote_fragmentation_sessions(config.sync_batch_size, config.sync_retries)
        .await?;
    for item in items {
        sync_remote_fragmentation_session(tx, enqueuer, item).await?;
    }
    Ok(())
}

/// Builds the request for the requested state of the session.
fn request_for(session: &RemoteFragmentationSession) -> Result<FragmentationRequest, ApplayerError> {
    let frag_index = field("FragIndex", i64::from(session.frag_index))?;
    match session.state {
        RemoteSessionState::Setup => {
            let mut mc_group_bit_mask = [false; 4];
            for id in &session.mc_group_ids {
                if let Ok(id) = usize::try_from(*id) {
                    if id <= 3 {
                        mc_group_bit_mask[id] = true;
                    }
                }
            }
            Ok(FragmentationRequest::FragSessionSetupReq(
                FragSessionSetupReq {
                    frag_index,
                    mc_group_bit_mask,
                    nb_frag: field("NbFrag", i64::from(session.nb_frag))?,
                    frag_size: field("FragSize", i64::from(session.frag_size))?,
                    fragmentation_matrix: field(
                        "FragmentationMatrix",
                        i64::from(session.fragmentation_matrix),
                    )?,
                    block_ack_delay: field("BlockAckDelay", i64::from(session.block_ack_delay))?,
                    padding: field("Padding", i64::from(session.padding))?,
                    descriptor: session.descriptor,
                },
            ))
        }
        RemoteSessionState::Delete => Ok(FragmentationRequest::FragSessionDeleteReq { frag_index }),
    }
}

/// Enqueues the request of one session and schedules the next attempt.
///
/// A session whose request can not be encoded is not sent but still counts as an attempt.
async fn sync_remote_fragmentation_session(
    tx: &mut dyn Transaction,
    enqueuer: &dyn DownlinkEnqueuer,
    mut session: RemoteFragmentationSession,
) -> Result<(), ApplayerError> {
    match request_for(&session) {
        Ok(request) => {
            enqueuer
                .enqueue(session.dev_eui, FPORT, false, request.to_bytes())
                .await?;
            info!(
                dev_eui = %session.dev_eui,
                frag_index = session.frag_index,
                "{} enqueued",
                request.name()
            );
        }
        Err(err) => error!(
            %err,
            dev_eui = %session.dev_eui,
            frag_index = session.frag_index,
            "fragmentation session request can not be encoded"
        ),
    }

    session.retry_count += 1;
    session.retry_after = next_retry_after(session.retry_interval_secs);
    tx.update_remote_fragmentation_session(&mut session).await?;
    Ok(())
}

/// Enqueues a FragSessionStatusReq which is answered by `dev_eui` only.
///
/// # Errors
///
/// Returns an error if the FragIndex is out of range or the enqueue failed.
pub async fn request_fragmentation_session_status(
    enqueuer: &dyn DownlinkEnqueuer,
    dev_eui: Eui64,
    frag_index: i32,
) -> Result<(), ApplayerError> {
    let request = FragmentationRequest::FragSessionStatusReq {
        participants: true,
        frag_index: field("FragIndex", i64::from(frag_index))?,
    };
    enqueuer
        .enqueue(dev_eui, FPORT, false, request.to_bytes())
        .await?;
    info!(%dev_eui, frag_index, "{} enqueued", request.name());
    Ok(())
}

/// Handles a fragmentation answer sent by `dev_eui`.
///
/// # Errors
///
/// Returns an error if the payload can not be parsed, the answer reports an error or the
/// referenced session does not exist.
pub async fn handle_uplink(
    tx: &mut dyn Transaction,
    dev_eui: Eui64,
    payload: &[u8],
) -> Result<(), ApplayerError> {
    match commands::parse_answer(payload)? {
        FragmentationAnswer::FragSessionSetupAns {
            frag_index,
            wrong_descriptor,
            frag_session_index_not_supported,
            not_enough_memory,
            encoding_unsupported,
        } => {
            info!(
                %dev_eui,
                frag_index,
                wrong_descriptor,
                frag_session_index_not_supported,
                not_enough_memory,
                encoding_unsupported,
                "FragSessionSetupAns received"
            );
            if wrong_descriptor
                || frag_session_index_not_supported
                || not_enough_memory
                || encoding_unsupported
            {
                return Err(ApplayerError::AnswerFlags {
                    command: "FragSessionSetupAns",
                    flags: format!(
                        "WrongDescriptor: {wrong_descriptor}, FragSessionIndexNotSupported: {frag_session_index_not_supported}, NotEnoughMemory: {not_enough_memory}, EncodingUnsupported: {encoding_unsupported}"
                    ),
                });
            }
            mark_provisioned(tx, dev_eui, frag_index).await
        }
        FragmentationAnswer::FragSessionDeleteAns {
            frag_index,
            session_does_not_exist,
        } => {
            info!(
                %dev_eui,
                frag_index,
                session_does_not_exist,
                "FragSessionDeleteAns received"
            );
            if session_does_not_exist {
                return Err(ApplayerError::AnswerFlags {
                    command: "FragSessionDeleteAns",
                    flags: format!("FragIndex {frag_index} does not exist"),
                });
            }
            mark_provisioned(tx, dev_eui, frag_index).await
        }
        FragmentationAnswer::FragSessionStatusAns {
            frag_index,
            nb_frag_received,
            missing_frag,
            not_enough_matrix_memory,
        } => {
            info!(
                %dev_eui,
                frag_index,
                nb_frag_received,
                missing_frag,
                not_enough_matrix_memory,
                "FragSessionStatusAns received"
            );
            let mut device = tx.get_pending_fuota_deployment_device(dev_eui).await?;
            device.state = FuotaDeploymentDeviceState::Success;
            if missing_frag > 0 {
                device.state = FuotaDeploymentDeviceState::Error;
                device.error_message =
                    format!("{missing_frag} fragments missed ({nb_frag_received} received).");
            }
            if not_enough_matrix_memory {
                device.state = FuotaDeploymentDeviceState::Error;
                device.error_message = "Not enough matrix memory.".to_owned();
            }
            tx.update_fuota_deployment_device(&mut device).await?;
            Ok(())
        }
    }
}

/// Marks the session in the FragIndex slot as provisioned.
async fn mark_provisioned(
    tx: &mut dyn Transaction,
    dev_eui: Eui64,
    frag_index: u8,
) -> Result<(), ApplayerError> {
    let mut session = tx
        .get_remote_fragmentation_session(dev_eui, i32::from(frag_index), true)
        .await?;
    session.state_provisioned = true;
    tx.update_remote_fragmentation_session(&mut session).await?;
    Ok(())
}

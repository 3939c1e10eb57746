//! Routing of application uplinks to the application layer packages.

use crate::applayer::{fragmentation, multicastsetup};
use crate::error::ApplayerError;
use crate::graceful_shutdown::ShutdownAgent;
use crate::lorawan::Eui64;
use crate::storage::Store;
use async_trait::async_trait;
use chirpstack_mqtt_integration::runtime::callbacks::ApplicationUpCallback;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// An application uplink reduced to what the packages need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationUplink {
    /// Sending device.
    pub dev_eui: Eui64,
    /// FPort of the frame.
    pub f_port: u32,
    /// Decrypted payload.
    pub data: Vec<u8>,
}

impl TryFrom<chirpstack_api::integration::UplinkEvent> for ApplicationUplink {
    type Error = crate::error::LoRaWanTypeError;

    fn try_from(event: chirpstack_api::integration::UplinkEvent) -> Result<Self, Self::Error> {
        let dev_eui = event
            .device_info
            .map(|info| info.dev_eui)
            .unwrap_or_default()
            .parse()?;
        Ok(ApplicationUplink {
            dev_eui,
            f_port: event.f_port,
            data: event.data,
        })
    }
}

/// Application uplink callback handing uplinks to the router task.
#[derive(Debug)]
pub struct ApplicationUplinkCallback {
    /// Channel to the router task.
    pub sender: tokio::sync::mpsc::Sender<ApplicationUplink>,
}

#[async_trait]
impl ApplicationUpCallback for ApplicationUplinkCallback {
    async fn dispatch_application_up(&self, up_event: chirpstack_api::integration::UplinkEvent) {
        trace!("Dispatch application up called");
        match ApplicationUplink::try_from(up_event) {
            Ok(uplink) => {
                if let Err(err) = self.sender.try_send(uplink) {
                    error!(%err);
                }
            }
            Err(err) => warn!(%err, "Dropping application uplink with invalid DevEUI"),
        }
    }
}

/// Task routing received application uplinks until shut down.
#[tracing::instrument(skip_all)]
pub async fn uplink_router_task(
    mut uplink_receiver: tokio::sync::mpsc::Receiver<ApplicationUplink>,
    store: Arc<dyn Store>,
    mut shutdown_agent: ShutdownAgent,
) {
    trace!("Started uplink router");
    loop {
        tokio::select! {
            uplink = uplink_receiver.recv() => {
                let Some(uplink) = uplink else {
                    trace!("Uplink channel closed");
                    return;
                };
                if let Err(err) = route_uplink(store.as_ref(), &uplink).await {
                    error!(%err, dev_eui = %uplink.dev_eui, f_port = uplink.f_port, "handling uplink error");
                }
            }
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down uplink router");
                return;
            }
        }
    }
}

/// Handles one uplink in its own transaction, ignoring FPorts of other applications.
///
/// # Errors
///
/// Returns the error of the package handling the uplink.
pub async fn route_uplink(store: &dyn Store, uplink: &ApplicationUplink) -> Result<(), ApplayerError> {
    let f_port = uplink.f_port;
    let dev_eui = uplink.dev_eui;
    if f_port != u32::from(multicastsetup::commands::FPORT)
        && f_port != u32::from(fragmentation::commands::FPORT)
    {
        trace!(f_port, "Ignoring uplink");
        return Ok(());
    }

    crate::applayer::in_transaction(store, |mut tx| async move {
        let result = if f_port == u32::from(multicastsetup::commands::FPORT) {
            multicastsetup::handle_uplink(tx.as_mut(), dev_eui, &uplink.data).await
        } else {
            fragmentation::handle_uplink(tx.as_mut(), dev_eui, &uplink.data).await
        };
        (tx, result)
    })
    .await
}

//! LPWAN application server.
//!
//! Manages organizations, network servers and gateways, pings gateways over MQTT and drives
//! the LoRaWAN remote multicast setup and fragmentation sessions of the devices.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

mod api;
mod app_start;
mod applayer;
mod authentication;
mod bonus;
mod configuration;
mod error;
mod graceful_shutdown;
mod gwping;
mod lorawan;
mod storage;
mod uplink_router;

use crate::api::rest_server_info::ServerInfo;
use crate::api::rest_wallet::WalletClient;
use crate::app_start::start_app;
use crate::applayer::DownlinkEnqueuer;
use crate::authentication::Authenticator;
use crate::graceful_shutdown::{ShutdownConditions, ShutdownGenerator, ShutdownInitiator};
use crate::storage::Store;
use std::panic::PanicInfo;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// State shared by the REST handlers.
pub struct AppState {
    /// Persistent storage.
    pub store: Arc<dyn Store>,
    /// Validates bearer tokens and loads the user's rights.
    pub authenticator: Authenticator,
    /// Network server queue of device downlinks.
    pub enqueuer: Arc<dyn DownlinkEnqueuer>,
    /// Wallet balances of the billing server.
    pub wallet: Arc<dyn WalletClient>,
    /// Returned by the server info endpoint.
    pub server_info: ServerInfo,
}

#[tokio::main]
async fn main() {
    #[cfg(debug_assertions)]
    let filter_directives = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "lpwan_app_server=trace,tower_http=trace".into());

    #[cfg(not(debug_assertions))]
    let filter_directives =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "lpwan_app_server=info".into());

    tracing_subscriber::registry()
        // RUST_LOG=lpwan_app_server::applayer
        .with(
            tracing_subscriber::fmt::layer()
                .with_filter(tracing_subscriber::EnvFilter::new(filter_directives)),
        )
        .init();

    let graceful_shutdown_generator = ShutdownGenerator::new();
    let shutdown_agent = graceful_shutdown_generator.generate_agent();
    let panic_shutdown_initiator = graceful_shutdown_generator.generate_initiator();
    let default_panic = std::panic::take_hook();
    set_panic_hook(default_panic, panic_shutdown_initiator);

    if let Err(err) = start_app(shutdown_agent).await {
        error!("Failed to start: {err}");
        return;
    }
    info!("Application server started");

    let mut shutdown_control = graceful_shutdown_generator.generate_control();

    tokio::select! {
        ctrl_c_result = signal::ctrl_c() => {
            if let Err(err) = ctrl_c_result {
                error!("Failed to listen for shutdown event: {}", err);
                return;
            }
            trace!("Graceful shutdown initiated");
        },
        shutdown_initiation = shutdown_control.await_shutdown_initiation() => {
            match shutdown_initiation {
                Some(ShutdownConditions::Panic) => {
                    trace!("Some task panicked, shutting down");
                }
                Some(ShutdownConditions::MqttError) => {
                    trace!("MQTT connection error, shutting down");
                }
                Some(ShutdownConditions::AxumStartFailed) => {
                    trace!("Failed to start axum server, shutting down");
                }
                None => {
                    trace!("No more shutdown agents, shutting down");
                    return;
                }
            }
        }
    }
    shutdown_control.start_shutdown();
    shutdown_control.await_complete_shutdown(15).await;
    info!("Application server stopped");
}

/// Sets the panic hook.
///
/// Integrates the graceful shutdown mechanism into panics.
fn set_panic_hook(
    default_panic: Box<dyn Fn(&PanicInfo) + Send + Sync>,
    shutdown_initiator: ShutdownInitiator,
) {
    std::panic::set_hook(Box::new(move |panic_info| {
        default_panic(panic_info);
        shutdown_initiator.initiate_shutdown(ShutdownConditions::Panic);
    }));
}

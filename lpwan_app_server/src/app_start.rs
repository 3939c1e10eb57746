//! Methods used when starting the application server.

use crate::api::create_api;
use crate::api::rest_server_info::ServerInfo;
use crate::applayer::{fragmentation, multicastsetup, DownlinkEnqueuer};
use crate::authentication::Authenticator;
use crate::bonus::{bonus_distributor_task, BonusClient, BonusDistributor};
use crate::configuration::{CliParameters, Configuration};
use crate::error::StartupError;
use crate::graceful_shutdown::{ShutdownAgent, ShutdownConditions};
use crate::gwping::{ping_lookup_cleanup_task, send_ping_loop, PingLookup, PingReceptionCallback};
use crate::storage::postgres::PgStore;
use crate::storage::Store;
use crate::uplink_router::{uplink_router_task, ApplicationUplinkCallback};
use crate::AppState;
use axum::Router;
use chirpstack_mqtt_integration::runtime::{Runtime, RuntimeOptions};
use clap::Parser;
use config::Config;
use lpwan_grpc_clients::m2m::M2mClient;
use lpwan_grpc_clients::network_server::NetworkServerClient;
use lpwan_grpc_clients::pool::ChannelPool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, instrument, trace, warn};

/// Reads the configuration file named by the CLI parameters.
///
/// # Errors
///
/// Returns an error if the file can not be read or deserialized.
pub fn load_configuration(cli_parameters: &CliParameters) -> Result<Configuration, StartupError> {
    trace!("Building configuration");
    let configuration = Config::builder()
        .add_source(config::File::with_name(&cli_parameters.config_file_path))
        .build()?;

    trace!("Deserializing configuration from file");
    Ok(configuration.try_deserialize::<Configuration>()?)
}

/// Starts all parts of the application.
///
/// # Errors
///
/// Returns an error if the configuration, the database or the MQTT runtime could not be set
/// up. No task has been spawned in that case.
#[allow(clippy::too_many_lines)]
pub async fn start_app(shutdown_agent: ShutdownAgent) -> Result<Arc<AppState>, StartupError> {
    trace!("Parsing cli parameters");
    let cli_parameters = CliParameters::parse();
    let configuration = load_configuration(&cli_parameters)?;

    trace!("Connecting to the database");
    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&configuration.postgresql).await?);

    trace!("Creating gRPC clients");
    let pool = ChannelPool::default();
    let network_server_client = Arc::new(NetworkServerClient::new(
        pool.clone(),
        configuration.network_server.server.clone(),
        configuration.network_server.api_token.clone(),
        configuration.network_server.tls(),
    ));
    let m2m_client = Arc::new(M2mClient::new(
        pool,
        configuration.m2m_server.server.clone(),
        configuration.m2m_server.tls(),
    ));

    trace!("Creating channels");
    let (uplink_tx, uplink_rx) = mpsc::channel(100);
    let (mqtt_connection_error_tx, mqtt_connection_error_rx) = broadcast::channel(10);

    trace!("Creating runtime");
    let runtime = Runtime::new(
        RuntimeOptions {
            client_id: configuration.mqtt.client_id.clone(),
            host: configuration.mqtt.host.clone(),
            port: configuration.mqtt.port,
            region: configuration.mqtt.region,
            application_topic: Some(configuration.mqtt.application_topic.clone()),
        },
        Some(mqtt_connection_error_tx),
    )
    .await?;

    trace!("Adding application uplink callback to runtime");
    runtime
        .add_application_up_callback(Box::new(ApplicationUplinkCallback { sender: uplink_tx }))
        .await?;

    trace!("Adding ping reception callback to runtime");
    let ping_lookup = Arc::new(PingLookup::new(configuration.gateway_ping.lookup_ttl_secs));
    runtime
        .add_event_up_callback(Box::new(PingReceptionCallback {
            store: store.clone(),
            lookup: ping_lookup.clone(),
        }))
        .await?;

    if configuration
        .application_server
        .external_api
        .jwt_secret
        .is_empty()
    {
        warn!("No JWT secret configured, every API request will be rejected");
    }

    trace!("Creating state");
    let enqueuer: Arc<dyn DownlinkEnqueuer> = network_server_client;
    let state = Arc::new(AppState {
        store: store.clone(),
        authenticator: Authenticator::new(
            &configuration.application_server.external_api,
            store.clone(),
        ),
        enqueuer: enqueuer.clone(),
        wallet: m2m_client.clone(),
        server_info: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            supernode_address: configuration.general.supernode_address.clone(),
            region: configuration.mqtt.region.as_str().to_owned(),
        },
    });

    trace!("Spawning MQTT connection error listener");
    tokio::spawn(mqtt_connection_error_task(
        mqtt_connection_error_rx,
        shutdown_agent.clone(),
    ));

    trace!("Spawning runtime shutdown task");
    tokio::spawn(runtime_shutdown_task(runtime.clone(), shutdown_agent.clone()));

    trace!("Spawning uplink router task");
    tokio::spawn(uplink_router_task(
        uplink_rx,
        store.clone(),
        shutdown_agent.clone(),
    ));

    trace!("Spawning remote multicast setup sync task");
    tokio::spawn(multicastsetup::sync_remote_multicast_setup_loop(
        store.clone(),
        enqueuer.clone(),
        configuration.application_server.remote_multicast_setup,
        shutdown_agent.clone(),
    ));

    trace!("Spawning remote multicast class C session sync task");
    tokio::spawn(multicastsetup::sync_remote_multicast_class_c_loop(
        store.clone(),
        enqueuer.clone(),
        configuration.application_server.remote_multicast_setup,
        shutdown_agent.clone(),
    ));

    trace!("Spawning remote fragmentation session sync task");
    tokio::spawn(fragmentation::sync_remote_fragmentation_sessions_loop(
        store.clone(),
        enqueuer,
        configuration.application_server.fragmentation_session,
        shutdown_agent.clone(),
    ));

    trace!("Spawning gateway ping task");
    tokio::spawn(send_ping_loop(
        store.clone(),
        Arc::new(runtime),
        ping_lookup.clone(),
        configuration.gateway_ping,
        shutdown_agent.clone(),
    ));

    trace!("Spawning ping lookup cleanup task");
    tokio::spawn(ping_lookup_cleanup_task(
        ping_lookup,
        configuration.gateway_ping.lookup_ttl_secs,
        shutdown_agent.clone(),
    ));

    if configuration.bonus.url.is_empty() {
        info!("No bonus url configured, bonus distribution disabled");
    } else {
        trace!("Spawning bonus distributor task");
        let bonus_client: Arc<dyn BonusClient> = m2m_client;
        let distributor = BonusDistributor::new(configuration.bonus.clone(), store, bonus_client);
        tokio::spawn(bonus_distributor_task(distributor, shutdown_agent.clone()));
    }

    let addr = SocketAddr::from((
        configuration.general.bind_addr,
        configuration.general.bind_port,
    ));
    trace!("Spawning Axum server on {}", addr);
    trace!("OpenAPI spec at /api/openapi.json");
    tokio::spawn(axum_task(create_api(state.clone()), addr, shutdown_agent));
    Ok(state)
}

/// Async task to receive MQTT connection errors.
#[instrument(skip_all)]
async fn mqtt_connection_error_task(
    mut mqtt_connection_error_rx: broadcast::Receiver<String>,
    mut shutdown_agent: ShutdownAgent,
) {
    trace!("Starting up");
    let mut mqtt_shutdown_agent_clone = shutdown_agent.clone();
    loop {
        tokio::select! {
            mqtt_connection_error = mqtt_connection_error_rx.recv() => {
                match mqtt_connection_error {
                    Ok(err_msg) => {
                        error!(
                            "More than 3 MQTT connection errors within 30 seconds. Last error was: {err_msg}"
                        );
                        mqtt_shutdown_agent_clone.initiate_shutdown(ShutdownConditions::MqttError);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        trace!("MQTT runtime dropped, shutting down");
                        return
                    }
                }
            },
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down");
                return
            }
        }
    }
}

/// Task to stop the MQTT event loop on shutdown.
#[instrument(skip_all)]
async fn runtime_shutdown_task(mut runtime: Runtime, mut shutdown_agent: ShutdownAgent) {
    trace!("Starting up");
    shutdown_agent.await_shutdown().await;
    runtime.stop_event_loop();
    trace!("Shutting down");
}

/// Async task to run axum server.
#[instrument(skip_all)]
async fn axum_task(axum_router: Router, addr: SocketAddr, mut shutdown_agent: ShutdownAgent) {
    trace!("Starting up");
    let mut server_shutdown_agent = shutdown_agent.clone();
    let server = match axum::Server::try_bind(&addr) {
        Ok(builder) => builder,
        Err(e) => {
            error!("Failed to bind axum to {addr}: {e}");
            shutdown_agent.initiate_shutdown(ShutdownConditions::AxumStartFailed);
            return;
        }
    };
    if let Err(e) = server
        .serve(axum_router.into_make_service())
        .with_graceful_shutdown(async move {
            server_shutdown_agent.await_shutdown().await;
            trace!("Shutting down");
        })
        .await
    {
        error!("Failed to start axum: {e}");
        shutdown_agent.initiate_shutdown(ShutdownConditions::AxumStartFailed);
    };
}

//! Runtime running the event loop and providing an interface to modify callbacks.

pub mod callbacks;
pub mod event_loop;

use crate::downlinks::Downlink;
use crate::error::RuntimeError;
use crate::runtime::callbacks::{
    ApplicationUpCallback, CallbackDrawers, CallbackStorage, EventAckCallback, EventUpCallback,
    StateConnCallback,
};
use crate::topics::LoRaWanRegion;
use prost::Message;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, trace};
use uuid::Uuid;

/// Default ChirpStack application integration uplink topic.
pub const DEFAULT_APPLICATION_UP_TOPIC: &str = "application/+/device/+/event/up";

/// Connection and subscription parameters of a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// MQTT client ID.
    pub client_id: String,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Region prefix of the gateway bridge topics.
    pub region: LoRaWanRegion,
    /// Application integration topic to subscribe to, `None` to skip.
    pub application_topic: Option<String>,
}

/// Type to interact with the event loop of the MQTT client.
///
/// Add and remove callbacks or send downlinks.
/// Don't drop the runtime as it stops the event loop.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// Registered callbacks.
    callbacks: CallbackStorage,
    /// MQTT client.
    mqtt_client: AsyncClient,
    /// Region of the gateway bridge topics.
    region: LoRaWanRegion,
    /// Stop signal channel transceiver end. Used to signal the event loop to stop.
    stop_signal_tx: tokio::sync::mpsc::Sender<()>,
    /// Keeps track of whether the stop method of the runtime has been called.
    received_stop: bool,
}

impl Runtime {
    /// Connects to the broker, spawns the event loop and subscribes to the gateway and
    /// application topics.
    ///
    /// # Errors
    ///
    /// Returns an error if a subscription request could not be queued.
    #[tracing::instrument]
    pub async fn new(
        options: RuntimeOptions,
        connection_error_sender: Option<tokio::sync::broadcast::Sender<String>>,
    ) -> Result<Self, RuntimeError> {
        let mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
        info!("Connecting to {:?}", mqtt_options);
        let (mqtt_client, event_loop) = AsyncClient::new(mqtt_options, 10);
        let callbacks = Arc::new(RwLock::new(CallbackDrawers::new()));
        let callbacks_clone = callbacks.clone();
        let (stop_signal_tx, stop_signal_rx) = tokio::sync::mpsc::channel(1);

        info!("Spawning event loop");
        tokio::task::spawn(async move {
            event_loop::run_event_loop(
                event_loop,
                callbacks_clone,
                connection_error_sender,
                stop_signal_rx,
            )
            .await;
        });

        let event_topic = format!("{}/gateway/+/event/+", options.region.as_str());
        trace!("subscribing to {}", event_topic);
        mqtt_client
            .subscribe(event_topic, QoS::AtLeastOnce)
            .await?;
        let state_topic = format!("{}/gateway/+/state/+", options.region.as_str());
        trace!("subscribing to {}", state_topic);
        mqtt_client
            .subscribe(state_topic, QoS::AtLeastOnce)
            .await?;
        if let Some(application_topic) = options.application_topic {
            trace!("subscribing to {}", application_topic);
            mqtt_client
                .subscribe(application_topic, QoS::AtLeastOnce)
                .await?;
        }

        Ok(Runtime {
            callbacks,
            mqtt_client,
            region: options.region,
            stop_signal_tx,
            received_stop: false,
        })
    }

    /// Add a callback for gateway uplink frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime was stopped or the generated ID collided.
    pub async fn add_event_up_callback(
        &self,
        callback: Box<dyn EventUpCallback>,
    ) -> Result<Uuid, RuntimeError> {
        self.register(|drawers, uuid| drawers.up.insert(uuid, Arc::new(callback)).is_some())
            .await
    }

    /// Add a callback for downlink tx acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime was stopped or the generated ID collided.
    pub async fn add_event_ack_callback(
        &self,
        callback: Box<dyn EventAckCallback>,
    ) -> Result<Uuid, RuntimeError> {
        self.register(|drawers, uuid| drawers.ack.insert(uuid, Arc::new(callback)).is_some())
            .await
    }

    /// Add a callback for gateway connection states.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime was stopped or the generated ID collided.
    pub async fn add_state_conn_callback(
        &self,
        callback: Box<dyn StateConnCallback>,
    ) -> Result<Uuid, RuntimeError> {
        self.register(|drawers, uuid| drawers.conn.insert(uuid, Arc::new(callback)).is_some())
            .await
    }

    /// Add a callback for application integration uplinks.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime was stopped or the generated ID collided.
    pub async fn add_application_up_callback(
        &self,
        callback: Box<dyn ApplicationUpCallback>,
    ) -> Result<Uuid, RuntimeError> {
        self.register(|drawers, uuid| {
            drawers
                .application_up
                .insert(uuid, Arc::new(callback))
                .is_some()
        })
        .await
    }

    /// Stores a callback under a new ID. `insert` returns whether the ID was already taken.
    async fn register<F>(&self, insert: F) -> Result<Uuid, RuntimeError>
    where
        F: FnOnce(&mut CallbackDrawers, Uuid) -> bool,
    {
        if self.received_stop {
            return Err(RuntimeError::Stopped);
        }
        let uuid = Uuid::new_v4();
        let mut callbacks_lock = self.callbacks.write().await;
        if insert(&mut callbacks_lock, uuid) {
            Err(RuntimeError::UuidCollision)
        } else {
            Ok(uuid)
        }
    }

    /// Remove the callback with the supplied ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime was stopped or no callback has the ID.
    #[tracing::instrument(skip(self))]
    pub async fn remove_callback(&self, uuid: Uuid) -> Result<(), RuntimeError> {
        if self.received_stop {
            return Err(RuntimeError::Stopped);
        }
        let mut callbacks = self.callbacks.write().await;
        callbacks.remove(&uuid).map_err(|err| {
            trace!("No callback was found.");
            RuntimeError::from(err)
        })
    }

    /// Enqueues a downlink to be sent from the gateway set in the downlink.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime was stopped or the publish request could not be queued.
    #[tracing::instrument(skip_all)]
    pub async fn enqueue(&self, downlink: Downlink) -> Result<(), RuntimeError> {
        if self.received_stop {
            return Err(RuntimeError::Stopped);
        }
        let gateway_downlink_command_topic = self.region.downlink_topic(downlink.gateway_id());
        let downlink_frame: chirpstack_api::gw::DownlinkFrame = downlink.into();
        let message = downlink_frame.encode_to_vec();

        trace!(
            "Sending {:?} to: {}",
            downlink_frame,
            gateway_downlink_command_topic
        );

        Ok(self
            .mqtt_client
            .publish(
                gateway_downlink_command_topic,
                QoS::AtMostOnce,
                false,
                message,
            )
            .await?)
    }

    /// Stop the runtime.
    ///
    /// Sends a MQTT disconnect via the event loop and stops the event loop task afterwards.
    pub fn stop_event_loop(&mut self) {
        if let Err(err) = self.mqtt_client.try_disconnect() {
            error!(%err);
        };
        if let Err(err) = self.stop_signal_tx.try_send(()) {
            error!(%err);
        }
        self.received_stop = true;
    }
}

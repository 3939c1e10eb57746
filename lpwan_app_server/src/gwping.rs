//! Gateway pings.
//!
//! Gateways of network servers with gateway discovery enabled periodically send a proprietary
//! frame. Its random MIC is kept in a lookup with a TTL, so that receptions of the frame by other
//! gateways can be attributed to the ping.

use crate::configuration::GatewayPingConfig;
use crate::error::GatewayPingError;
use crate::graceful_shutdown::ShutdownAgent;
use crate::lorawan::Eui64;
use crate::storage::{GatewayPing, GatewayPingRx, Store, Transaction};
use async_trait::async_trait;
use chirpstack_mqtt_integration::downlinks::data_rate::DataRate;
use chirpstack_mqtt_integration::downlinks::{Downlink, DownlinkItemBuilder};
use chirpstack_mqtt_integration::error::RuntimeError;
use chirpstack_mqtt_integration::runtime::callbacks::EventUpCallback;
use chirpstack_mqtt_integration::runtime::Runtime;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, trace};

/// MHDR of a proprietary frame.
const PROPRIETARY_MHDR: u8 = 0xe0;
/// MType bits of a proprietary frame.
const PROPRIETARY_MTYPE: u8 = 0b111;

/// Sends downlinks through the gateway bridge.
#[async_trait]
pub trait GatewayDownlinkSender: Send + Sync + fmt::Debug {
    /// Sends `downlink` from the gateway set in it.
    async fn send_downlink(&self, downlink: Downlink) -> Result<(), RuntimeError>;
}

#[async_trait]
impl GatewayDownlinkSender for Runtime {
    async fn send_downlink(&self, downlink: Downlink) -> Result<(), RuntimeError> {
        self.enqueue(downlink).await
    }
}

/// MIC to ping ID lookup with per entry expiry.
#[derive(Debug)]
pub struct PingLookup {
    /// Ping ID and insertion time by key.
    entries: Mutex<HashMap<String, (i64, DateTime<Utc>)>>,
    /// Lifetime of an entry.
    ttl: Duration,
}

impl PingLookup {
    /// Creates an empty lookup whose entries live for `ttl_secs` seconds.
    #[must_use]
    pub fn new(ttl_secs: u64) -> Self {
        PingLookup {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1000)),
        }
    }

    /// Key of a MIC.
    fn key(mic: [u8; 4]) -> String {
        format!("lora:as:gwping:{}", hex::encode(mic))
    }

    /// Stores the ping ID for the MIC.
    pub fn insert(&self, mic: [u8; 4], ping_id: i64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(mic), (ping_id, Utc::now()));
    }

    /// Returns the ping ID of the MIC unless it expired.
    pub fn get(&self, mic: [u8; 4]) -> Option<i64> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&Self::key(mic))
            .filter(|(_, inserted)| Utc::now() - *inserted < self.ttl)
            .map(|(ping_id, _)| *ping_id)
    }

    /// Removes all expired entries.
    pub fn remove_expired(&self) {
        trace!("Removing expired entries from ping lookup");
        let now = Utc::now();
        let ttl = self.ttl;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, (_, inserted)| now - *inserted < ttl);
    }
}

/// Task to execute [`PingLookup::remove_expired`] every TTL until shut down.
#[tracing::instrument(skip_all)]
pub async fn ping_lookup_cleanup_task(
    lookup: Arc<PingLookup>,
    ttl_secs: u64,
    mut shutdown_agent: ShutdownAgent,
) {
    loop {
        lookup.remove_expired();
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(ttl_secs.max(1))) => {}
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down ping lookup cleanup");
                return;
            }
        }
    }
}

/// Sends a ping to the next due gateway every `interval_secs` until shut down.
#[tracing::instrument(skip_all)]
pub async fn send_ping_loop(
    store: Arc<dyn Store>,
    sender: Arc<dyn GatewayDownlinkSender>,
    lookup: Arc<PingLookup>,
    config: GatewayPingConfig,
    mut shutdown_agent: ShutdownAgent,
) {
    loop {
        if let Err(err) =
            send_gateway_ping(store.as_ref(), sender.as_ref(), &lookup, config.power).await
        {
            error!(%err, "send gateway ping error");
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(config.interval_secs)) => {}
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down gateway ping");
                return;
            }
        }
    }
}

/// Pings the next due gateway, if any, in one transaction.
///
/// The MIC is added to the lookup once the ping is committed.
///
/// # Errors
///
/// Returns an error and rolls back if the ping could not be stored or sent.
pub async fn send_gateway_ping(
    store: &dyn Store,
    sender: &dyn GatewayDownlinkSender,
    lookup: &PingLookup,
    power: i32,
) -> Result<(), GatewayPingError> {
    let mut tx = store.begin().await?;
    match ping_next_gateway(tx.as_mut(), sender, power).await {
        Ok(sent) => {
            tx.commit().await?;
            if let Some((mic, ping_id)) = sent {
                lookup.insert(mic, ping_id);
            }
            Ok(())
        }
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}

/// Creates the ping of the next due gateway and sends it.
///
/// Returns the MIC and ID of the sent ping.
async fn ping_next_gateway(
    tx: &mut dyn Transaction,
    sender: &dyn GatewayDownlinkSender,
    power: i32,
) -> Result<Option<([u8; 4], i64)>, GatewayPingError> {
    let Some(gateway) = tx.get_gateway_for_ping().await? else {
        return Ok(None);
    };
    let network_server = tx.get_network_server(gateway.network_server_id).await?;

    let mut ping = GatewayPing {
        id: 0,
        created_at: Utc::now(),
        gateway_mac: gateway.mac,
        frequency: network_server.gateway_discovery_tx_frequency,
        dr: network_server.gateway_discovery_dr,
    };
    tx.create_gateway_ping(&mut ping).await?;

    let mic: [u8; 4] = rand::random();
    sender.send_downlink(ping_downlink(&ping, mic, power)?).await?;
    info!(gateway_mac = %ping.gateway_mac, id = ping.id, "gateway ping sent");

    tx.update_gateway_ping(gateway.mac, ping.id, ping.created_at)
        .await?;
    Ok(Some((mic, ping.id)))
}

/// Builds the proprietary ping frame sent immediately without polarization inversion.
fn ping_downlink(ping: &GatewayPing, mic: [u8; 4], power: i32) -> Result<Downlink, GatewayPingError> {
    let mut phy_payload = Vec::with_capacity(5);
    phy_payload.push(PROPRIETARY_MHDR);
    phy_payload.extend_from_slice(&mic);

    let frequency =
        u32::try_from(ping.frequency).map_err(|_| GatewayPingError::Frequency(ping.frequency))?;
    let item = DownlinkItemBuilder::new()
        .phy_payload(phy_payload)
        .frequency(frequency)
        .power(power)
        .data_rate(DataRate::try_from(i64::from(ping.dr))?)
        .polarization_inversion(false)
        .build()?;
    Ok(Downlink::new(
        ping.gateway_mac.to_string(),
        rand::random(),
        vec![item],
    )?)
}

/// Gateway uplink callback recording receptions of pings.
#[derive(Debug)]
pub struct PingReceptionCallback {
    /// Store of the pings.
    pub store: Arc<dyn Store>,
    /// Lookup of the sent pings.
    pub lookup: Arc<PingLookup>,
}

#[async_trait]
impl EventUpCallback for PingReceptionCallback {
    async fn dispatch_up_event(
        &self,
        gateway_id: String,
        up_event: chirpstack_api::gw::UplinkFrame,
    ) {
        if let Err(err) =
            handle_received_ping(self.store.as_ref(), &self.lookup, &gateway_id, up_event).await
        {
            error!(%err, "handle received ping error");
        }
    }
}

/// Records the reception of a ping by `gateway_id`.
///
/// Frames which are not proprietary, unknown or expired MICs and receptions by the sending
/// gateway are ignored.
///
/// # Errors
///
/// Returns an error if the gateway ID is invalid or the reception could not be stored.
pub async fn handle_received_ping(
    store: &dyn Store,
    lookup: &PingLookup,
    gateway_id: &str,
    frame: chirpstack_api::gw::UplinkFrame,
) -> Result<(), GatewayPingError> {
    let payload = &frame.phy_payload;
    let Some(mhdr) = payload.first() else {
        return Ok(());
    };
    if *mhdr >> 5 != PROPRIETARY_MTYPE || payload.len() < 5 {
        return Ok(());
    }
    let mut mic = [0; 4];
    mic.copy_from_slice(&payload[payload.len() - 4..]);

    let Some(ping_id) = lookup.get(mic) else {
        trace!(mic = %hex::encode(mic), "Ping lookup key does not exist");
        return Ok(());
    };
    let gateway_mac: Eui64 = gateway_id.parse()?;

    let mut tx = store.begin().await?;
    let result = store_reception(tx.as_mut(), ping_id, gateway_mac, frame.rx_info).await;
    match result {
        Ok(()) => tx.commit().await?,
        Err(err) => {
            tx.rollback().await?;
            return Err(err);
        }
    }
    Ok(())
}

/// Creates the reception row unless the sending gateway received its own ping.
async fn store_reception(
    tx: &mut dyn Transaction,
    ping_id: i64,
    gateway_mac: Eui64,
    rx_info: Option<chirpstack_api::gw::UplinkRxInfo>,
) -> Result<(), GatewayPingError> {
    let ping = tx.get_gateway_ping(ping_id).await?;
    if ping.gateway_mac == gateway_mac {
        trace!(%gateway_mac, "Ignoring ping received by the sending gateway");
        return Ok(());
    }

    let rx_info = rx_info.unwrap_or_default();
    let received_at = rx_info.time.as_ref().and_then(gateway_time);
    let location = rx_info.location.unwrap_or_default();
    let mut rx = GatewayPingRx {
        id: 0,
        created_at: Utc::now(),
        ping_id,
        gateway_mac,
        received_at,
        rssi: rx_info.rssi,
        lora_snr: f64::from(rx_info.snr),
        latitude: location.latitude,
        longitude: location.longitude,
        altitude: location.altitude,
    };
    tx.create_gateway_ping_rx(&mut rx).await?;
    info!(%gateway_mac, ping_id, "gateway ping received");
    Ok(())
}

/// Converts the RX time of a gateway with a GPS module.
fn gateway_time(time: &pbjson_types::Timestamp) -> Option<DateTime<Utc>> {
    let nanos = u32::try_from(time.nanos).ok()?;
    Utc.timestamp_opt(time.seconds, nanos).single()
}

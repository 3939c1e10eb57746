//! Configuration file and CLI parameters.

use chirpstack_mqtt_integration::runtime::DEFAULT_APPLICATION_UP_TOPIC;
use chirpstack_mqtt_integration::topics::LoRaWanRegion;
use clap::Parser;
use lpwan_grpc_clients::pool::TlsMaterial;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Configuration of the application server.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// General settings.
    pub general: GeneralConfig,
    /// Database connection.
    pub postgresql: PostgresqlConfig,
    /// MQTT connection.
    pub mqtt: MqttConfig,
    /// Network server API.
    pub network_server: NetworkServerConfig,
    /// Billing server API.
    pub m2m_server: M2mServerConfig,
    /// Application layer and external API settings.
    #[serde(default)]
    pub application_server: ApplicationServerConfig,
    /// Gateway ping settings.
    #[serde(default)]
    pub gateway_ping: GatewayPingConfig,
    /// Bonus distribution, disabled without url.
    #[serde(default)]
    pub bonus: BonusConfig,
}

/// General settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Address the REST API binds to.
    pub bind_addr: IpAddr,
    /// Port the REST API binds to.
    pub bind_port: u16,
    /// Address of this supernode, shown in the server info.
    #[serde(default)]
    pub supernode_address: String,
}

/// Database connection.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresqlConfig {
    /// Connection string.
    pub dsn: String,
    /// Max open connections of the pool.
    #[serde(default = "default_max_open_connections")]
    pub max_open_connections: u32,
    /// Whether migrations are applied on startup.
    #[serde(default = "default_true")]
    pub automigrate: bool,
}

/// MQTT connection.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client ID.
    pub client_id: String,
    /// Region prefix of the gateway bridge topics, e.g. `eu868`.
    pub region: LoRaWanRegion,
    /// Application integration uplink topic.
    #[serde(default = "default_application_topic")]
    pub application_topic: String,
}

/// Network server API.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkServerConfig {
    /// gRPC server address.
    pub server: String,
    /// API token.
    pub api_token: String,
    /// CA certificate (PEM), empty for none.
    #[serde(default)]
    pub ca_cert: String,
    /// Client certificate (PEM), empty for none.
    #[serde(default)]
    pub tls_cert: String,
    /// Client key (PEM), empty for none.
    #[serde(default)]
    pub tls_key: String,
}

impl NetworkServerConfig {
    /// Certificates of the channel.
    #[must_use]
    pub fn tls(&self) -> TlsMaterial {
        TlsMaterial {
            ca_cert: self.ca_cert.clone(),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
        }
    }
}

/// Billing server API.
#[derive(Debug, Clone, Deserialize)]
pub struct M2mServerConfig {
    /// gRPC server address.
    pub server: String,
    /// CA certificate (PEM), empty for none.
    #[serde(default)]
    pub ca_cert: String,
    /// Client certificate (PEM), empty for none.
    #[serde(default)]
    pub tls_cert: String,
    /// Client key (PEM), empty for none.
    #[serde(default)]
    pub tls_key: String,
}

impl M2mServerConfig {
    /// Certificates of the channel.
    #[must_use]
    pub fn tls(&self) -> TlsMaterial {
        TlsMaterial {
            ca_cert: self.ca_cert.clone(),
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
        }
    }
}

/// Application layer and external API settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationServerConfig {
    /// Multicast setup and class C session synchronisation.
    #[serde(default)]
    pub remote_multicast_setup: SyncConfig,
    /// Fragmentation session synchronisation.
    #[serde(default)]
    pub fragmentation_session: SyncConfig,
    /// External API.
    #[serde(default)]
    pub external_api: ExternalApiConfig,
}

/// Synchronisation of remote sessions with the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SyncConfig {
    /// Seconds between two synchronisation runs.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Attempts per session before giving up.
    #[serde(default = "default_sync_retries")]
    pub sync_retries: i32,
    /// Sessions per run.
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: i64,
}

impl SyncConfig {
    /// Time between two synchronisation runs.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            sync_retries: default_sync_retries(),
            sync_batch_size: default_sync_batch_size(),
        }
    }
}

/// External API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalApiConfig {
    /// Secret the JWTs are signed with.
    #[serde(default)]
    pub jwt_secret: String,
    /// Expected audience of the JWTs.
    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,
}

impl Default for ExternalApiConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_audience: default_jwt_audience(),
        }
    }
}

/// Gateway ping settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GatewayPingConfig {
    /// Seconds a sent ping can be correlated with receptions.
    #[serde(default = "default_ping_lookup_ttl_secs")]
    pub lookup_ttl_secs: u64,
    /// Seconds between two checks for gateways to ping.
    #[serde(default = "default_ping_interval_secs")]
    pub interval_secs: u64,
    /// Transmit power of pings in dBm.
    #[serde(default = "default_ping_power")]
    pub power: i32,
}

impl Default for GatewayPingConfig {
    fn default() -> Self {
        Self {
            lookup_ttl_secs: default_ping_lookup_ttl_secs(),
            interval_secs: default_ping_interval_secs(),
            power: default_ping_power(),
        }
    }
}

/// Bonus distribution settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BonusConfig {
    /// Base URL of the airdrop backend, empty disables the distributor.
    #[serde(default)]
    pub url: String,
    /// Login name.
    #[serde(default)]
    pub user: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
    /// Seconds between two checks for airdrops.
    #[serde(default = "default_bonus_check_interval_sec")]
    pub check_interval_sec: u64,
    /// Supernode ID the airdrops are listed for.
    #[serde(default)]
    pub supernode_id: String,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: String::new(),
            password: String::new(),
            check_interval_sec: default_bonus_check_interval_sec(),
            supernode_id: String::new(),
        }
    }
}

/// Default for [`PostgresqlConfig::max_open_connections`].
fn default_max_open_connections() -> u32 {
    10
}

/// `true`
fn default_true() -> bool {
    true
}

/// Default for [`MqttConfig::application_topic`].
fn default_application_topic() -> String {
    DEFAULT_APPLICATION_UP_TOPIC.to_owned()
}

/// Default for [`SyncConfig::sync_interval_secs`].
fn default_sync_interval_secs() -> u64 {
    1
}

/// Default for [`SyncConfig::sync_retries`].
fn default_sync_retries() -> i32 {
    3
}

/// Default for [`SyncConfig::sync_batch_size`].
fn default_sync_batch_size() -> i64 {
    100
}

/// Default for [`ExternalApiConfig::jwt_audience`].
fn default_jwt_audience() -> String {
    "lora-app-server".to_owned()
}

/// Default for [`GatewayPingConfig::lookup_ttl_secs`].
fn default_ping_lookup_ttl_secs() -> u64 {
    60
}

/// Default for [`GatewayPingConfig::interval_secs`].
fn default_ping_interval_secs() -> u64 {
    1
}

/// Default for [`GatewayPingConfig::power`].
fn default_ping_power() -> i32 {
    14
}

/// Default for [`BonusConfig::check_interval_sec`].
fn default_bonus_check_interval_sec() -> u64 {
    60
}

/// CLI parameters.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliParameters {
    /// Path to config file
    #[clap(long, value_parser)]
    pub config_file_path: String,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config: Configuration = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [general]
                bind_addr = "127.0.0.1"
                bind_port = 8080

                [postgresql]
                dsn = "postgres://localhost/lpwan"

                [mqtt]
                host = "localhost"
                port = 1883
                client_id = "lpwan-app-server"
                region = "eu868"

                [network_server]
                server = "http://localhost:8000"
                api_token = "token"

                [m2m_server]
                server = "http://localhost:4000"

                [application_server.fragmentation_session]
                sync_retries = 5
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.mqtt.region, LoRaWanRegion::Eu868);
        assert_eq!(config.mqtt.application_topic, DEFAULT_APPLICATION_UP_TOPIC);
        assert!(config.postgresql.automigrate);
        assert_eq!(config.application_server.fragmentation_session.sync_retries, 5);
        assert_eq!(
            config.application_server.fragmentation_session.sync_batch_size,
            100
        );
        assert_eq!(
            config.application_server.external_api.jwt_audience,
            "lora-app-server"
        );
        assert_eq!(config.gateway_ping.lookup_ttl_secs, 60);
        assert!(config.bonus.url.is_empty());
        assert!(config.network_server.tls().is_insecure());
    }
}

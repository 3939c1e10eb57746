//! Storage models and the transactional store interface.
//!
//! A [`Store`] hands out [`Transaction`]s. Every entity trait is implemented by the transaction
//! types so that a unit of work either commits completely or not at all. Row locks taken with
//! `for_update` are held until the transaction ends.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use crate::error::StorageError;
use crate::lorawan::{Aes128Key, DevAddr, Eui64, FragDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use std::fmt;
use uuid::Uuid;

/// Valid organization and gateway names.
#[allow(clippy::unwrap_used)]
static NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w-]+$").unwrap());

/// Checks a name against [`NAME_REGEX`].
fn validate_name(name: &str) -> Result<(), StorageError> {
    if NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(StorageError::InvalidName)
    }
}

/// Defines a state enum which is stored as text.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$variant_meta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($(#[$variant_meta])* $variant),+
        }

        impl $name {
            /// The stored text representation.
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: {other}", stringify!($name))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Type<Postgres> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <&str as Type<Postgres>>::compatible(ty)
            }
        }

        impl<'r> Decode<'r, Postgres> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let text = <&str as Decode<Postgres>>::decode(value)?;
                Ok(text.parse()?)
            }
        }

        impl Encode<'_, Postgres> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
                <&str as Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

text_enum!(
    /// Requested state of a remote multicast setup or fragmentation session.
    RemoteSessionState {
        /// The session must be set up on the device.
        Setup => "setup",
        /// The session must be deleted on the device.
        Delete => "delete",
    }
);

text_enum!(
    /// State of a device within a FUOTA deployment.
    FuotaDeploymentDeviceState {
        /// Waiting for the device.
        Pending => "pending",
        /// The device received the firmware.
        Success => "success",
        /// The device failed.
        Error => "error",
    }
);

/// Network server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
pub struct NetworkServer {
    /// ID, set on create.
    #[serde(default)]
    pub id: i64,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last update time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Name.
    pub name: String,
    /// gRPC address of the network server.
    pub server: String,
    /// CA certificate (PEM).
    #[serde(default)]
    pub ca_cert: String,
    /// TLS certificate (PEM).
    #[serde(default)]
    pub tls_cert: String,
    /// TLS key (PEM).
    #[serde(default)]
    pub tls_key: String,
    /// Whether gateways of this network server are pinged.
    #[serde(default)]
    pub gateway_discovery_enabled: bool,
    /// Pings per day.
    #[serde(default)]
    pub gateway_discovery_interval: i32,
    /// Ping frequency in Hz.
    #[serde(default)]
    pub gateway_discovery_tx_frequency: i32,
    /// Ping data rate.
    #[serde(default)]
    pub gateway_discovery_dr: i32,
    /// Region of the network server.
    #[serde(default)]
    pub region: String,
    /// Version of the network server.
    #[serde(default)]
    pub version: String,
}

impl NetworkServer {
    /// Validates the network server.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidGatewayDiscoveryInterval`] if discovery is enabled with an
    /// interval below 1.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.gateway_discovery_enabled && self.gateway_discovery_interval <= 0 {
            return Err(StorageError::InvalidGatewayDiscoveryInterval);
        }
        Ok(())
    }
}

/// Organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
pub struct Organization {
    /// ID, set on create.
    #[serde(default)]
    pub id: i64,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last update time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Name, only letters, numbers, underscores and dashes.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Whether gateways may be added.
    #[serde(default)]
    pub can_have_gateways: bool,
    /// Max amount of gateways, 0 is unlimited.
    #[serde(default)]
    pub max_gateway_count: i32,
    /// Max amount of devices, 0 is unlimited.
    #[serde(default)]
    pub max_device_count: i32,
}

impl Organization {
    /// Validates the organization.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidName`] if the name contains invalid characters.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_name(&self.name)
    }
}

/// User.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    /// ID.
    pub id: i64,
    /// Username.
    pub username: String,
    /// Email address.
    pub email: String,
    /// Global admin flag.
    pub is_admin: bool,
    /// Whether the user may log in.
    pub is_active: bool,
}

/// Membership of a user in an organization.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrganizationUser {
    /// Organization ID.
    pub organization_id: i64,
    /// User ID.
    pub user_id: i64,
    /// Organization admin.
    pub is_admin: bool,
    /// Device admin.
    pub is_device_admin: bool,
    /// Gateway admin.
    pub is_gateway_admin: bool,
}

/// Gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, sqlx::FromRow)]
pub struct Gateway {
    /// Gateway MAC.
    pub mac: Eui64,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last update time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Name, only letters, numbers, underscores and dashes.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Owning organization.
    pub organization_id: i64,
    /// Network server the gateway is connected to.
    pub network_server_id: i64,
    /// Whether the gateway takes part in gateway discovery.
    #[serde(default)]
    pub ping: bool,
    /// Last sent ping.
    #[serde(default)]
    pub last_ping_id: Option<i64>,
    /// Time of the last sent ping.
    #[serde(default)]
    pub last_ping_sent_at: Option<DateTime<Utc>>,
    /// Latitude.
    #[serde(default)]
    pub latitude: f64,
    /// Longitude.
    #[serde(default)]
    pub longitude: f64,
    /// Altitude.
    #[serde(default)]
    pub altitude: f64,
}

impl Gateway {
    /// Validates the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidName`] if the name contains invalid characters.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_name(&self.name)
    }
}

/// Ping sent by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct GatewayPing {
    /// ID, set on create.
    pub id: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Sending gateway.
    pub gateway_mac: Eui64,
    /// Frequency in Hz.
    pub frequency: i32,
    /// Data rate.
    pub dr: i32,
}

/// Reception of a ping by another gateway.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct GatewayPingRx {
    /// ID, set on create.
    pub id: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Received ping.
    pub ping_id: i64,
    /// Receiving gateway.
    pub gateway_mac: Eui64,
    /// Reception time.
    pub received_at: Option<DateTime<Utc>>,
    /// RSSI.
    pub rssi: i32,
    /// SNR.
    pub lora_snr: f64,
    /// Latitude of the receiving gateway.
    pub latitude: f64,
    /// Longitude of the receiving gateway.
    pub longitude: f64,
    /// Altitude of the receiving gateway.
    pub altitude: f64,
}

/// Device with the organization owning its application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct Device {
    /// DevEUI.
    pub dev_eui: Eui64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Application.
    pub application_id: i64,
    /// Organization of the application.
    pub organization_id: i64,
    /// Name.
    pub name: String,
    /// Description.
    pub description: String,
}

/// Multicast group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct MulticastGroup {
    /// ID.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Name.
    pub name: String,
    /// Application.
    pub application_id: i64,
    /// Multicast address.
    pub mc_addr: DevAddr,
    /// Multicast network session key.
    #[serde(skip)]
    pub mc_nwk_s_key: Aes128Key,
    /// Frame counter.
    pub f_cnt: i64,
    /// Data rate.
    pub dr: i32,
    /// Frequency in Hz.
    pub frequency: i32,
}

/// Multicast group setup on a device (TS005 McGroupSetupReq / McGroupDeleteReq).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct RemoteMulticastSetup {
    /// DevEUI.
    pub dev_eui: Eui64,
    /// Multicast group.
    pub multicast_group_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// McGroupID slot on the device (0-3).
    pub mc_group_id: i32,
    /// Multicast address.
    pub mc_addr: DevAddr,
    /// Multicast key encrypted with the McKEKey.
    pub mc_key_encrypted: Aes128Key,
    /// Lowest accepted multicast frame counter.
    pub min_mc_f_cnt: i64,
    /// Highest accepted multicast frame counter.
    pub max_mc_f_cnt: i64,
    /// Requested state.
    pub state: RemoteSessionState,
    /// Whether the device acknowledged the state.
    pub state_provisioned: bool,
    /// Earliest time of the next attempt.
    pub retry_after: DateTime<Utc>,
    /// Attempts so far.
    pub retry_count: i32,
    /// Seconds between attempts.
    pub retry_interval_secs: i64,
}

/// Class C session of a multicast group on a device (TS005 McClassCSessionReq).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct RemoteMulticastClassCSession {
    /// DevEUI.
    pub dev_eui: Eui64,
    /// Multicast group.
    pub multicast_group_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// McGroupID slot on the device (0-3).
    pub mc_group_id: i32,
    /// Session start.
    pub session_time: DateTime<Utc>,
    /// Session timeout, the session lasts 2^timeout seconds.
    pub session_time_out: i32,
    /// Downlink frequency in Hz.
    pub dl_frequency: i32,
    /// Data rate.
    pub dr: i32,
    /// Whether the device acknowledged the session.
    pub state_provisioned: bool,
    /// Earliest time of the next attempt.
    pub retry_after: DateTime<Utc>,
    /// Attempts so far.
    pub retry_count: i32,
    /// Seconds between attempts.
    pub retry_interval_secs: i64,
}

/// Fragmentation session on a device (TS004 FragSessionSetupReq / FragSessionDeleteReq).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct RemoteFragmentationSession {
    /// DevEUI.
    pub dev_eui: Eui64,
    /// FragIndex slot on the device (0-3).
    pub frag_index: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// McGroupIDs the session is bound to, empty for unicast.
    pub mc_group_ids: Vec<i32>,
    /// Amount of fragments.
    pub nb_frag: i32,
    /// Fragment size in bytes.
    pub frag_size: i32,
    /// Fragmentation matrix.
    pub fragmentation_matrix: i32,
    /// Block ack delay exponent.
    pub block_ack_delay: i32,
    /// Padding bytes of the last fragment.
    pub padding: i32,
    /// Descriptor of the fragmented data.
    pub descriptor: FragDescriptor,
    /// Requested state.
    pub state: RemoteSessionState,
    /// Whether the device acknowledged the state.
    pub state_provisioned: bool,
    /// Earliest time of the next attempt.
    pub retry_after: DateTime<Utc>,
    /// Attempts so far.
    pub retry_count: i32,
    /// Seconds between attempts.
    pub retry_interval_secs: i64,
}

/// Device within a FUOTA deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema, sqlx::FromRow)]
pub struct FuotaDeploymentDevice {
    /// Deployment.
    pub fuota_deployment_id: Uuid,
    /// DevEUI.
    pub dev_eui: Eui64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// State.
    pub state: FuotaDeploymentDeviceState,
    /// Error message, empty unless `state` is error.
    pub error_message: String,
}

/// Checks that a McGroupID or FragIndex is within 0-3.
fn validate_slot(slot: i32, err: StorageError) -> Result<(), StorageError> {
    if (0..=3).contains(&slot) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Checks that `value` fits into the command field `field`.
fn validate_range(
    field: &'static str,
    value: impl Into<i64>,
    min: i64,
    max: i64,
) -> Result<(), StorageError> {
    if (min..=max).contains(&value.into()) {
        Ok(())
    } else {
        Err(StorageError::OutOfRange { field, min, max })
    }
}

impl RemoteMulticastSetup {
    /// Validates the McGroupID and the frame counter range.
    ///
    /// # Errors
    ///
    /// Returns an error if a value does not fit into the McGroupSetupReq.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_slot(self.mc_group_id, StorageError::InvalidMcGroupId)?;
        validate_range("minMcFCnt", self.min_mc_f_cnt, 0, u32::MAX.into())?;
        validate_range("maxMcFCnt", self.max_mc_f_cnt, 0, u32::MAX.into())
    }
}

impl RemoteMulticastClassCSession {
    /// Validates the McGroupID, timeout, frequency and data rate.
    ///
    /// # Errors
    ///
    /// Returns an error if a value does not fit into the McClassCSessionReq.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_slot(self.mc_group_id, StorageError::InvalidMcGroupId)?;
        validate_range("SessionTimeOut", self.session_time_out, 0, 15)?;
        // DLFrequency is sent in steps of 100 Hz in 3 bytes
        validate_range("DLFrequency", self.dl_frequency, 0, 0xff_ffff * 100)?;
        validate_range("DR", self.dr, 0, u8::MAX.into())
    }
}

impl RemoteFragmentationSession {
    /// Validates the slots and the FragSessionSetupReq parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if a value does not fit into the FragSessionSetupReq.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_slot(self.frag_index, StorageError::InvalidFragIndex)?;
        for mc_group_id in &self.mc_group_ids {
            validate_slot(*mc_group_id, StorageError::InvalidMcGroupId)?;
        }
        validate_range("NbFrag", self.nb_frag, 0, u16::MAX.into())?;
        validate_range("FragSize", self.frag_size, 0, u8::MAX.into())?;
        validate_range("FragmentationMatrix", self.fragmentation_matrix, 0, 7)?;
        validate_range("BlockAckDelay", self.block_ack_delay, 0, 7)?;
        validate_range("Padding", self.padding, 0, u8::MAX.into())
    }
}

/// Network server storage.
#[async_trait]
pub trait NetworkServerStore {
    /// Creates a network server and sets its ID.
    async fn create_network_server(&mut self, ns: &mut NetworkServer) -> Result<(), StorageError>;
    /// Returns the network server.
    async fn get_network_server(&mut self, id: i64) -> Result<NetworkServer, StorageError>;
    /// Updates the network server.
    async fn update_network_server(&mut self, ns: &mut NetworkServer) -> Result<(), StorageError>;
    /// Deletes the network server.
    async fn delete_network_server(&mut self, id: i64) -> Result<(), StorageError>;
}

/// Organization storage.
#[async_trait]
pub trait OrganizationStore {
    /// Creates an organization and sets its ID.
    async fn create_organization(&mut self, org: &mut Organization) -> Result<(), StorageError>;
    /// Returns the organization.
    async fn get_organization(&mut self, id: i64) -> Result<Organization, StorageError>;
    /// Deletes the organization.
    async fn delete_organization(&mut self, id: i64) -> Result<(), StorageError>;
}

/// User storage.
#[async_trait]
pub trait UserStore {
    /// Returns the user with the username.
    async fn get_user_by_username(&mut self, username: &str) -> Result<User, StorageError>;
    /// Returns the membership of the user in the organization.
    async fn get_organization_user(
        &mut self,
        organization_id: i64,
        user_id: i64,
    ) -> Result<OrganizationUser, StorageError>;
    /// Returns the first organization administered by the user with the email, `0` if there is
    /// none.
    async fn get_user_bonus_org_id(&mut self, email: &str) -> Result<i64, StorageError>;
}

/// Gateway storage.
#[async_trait]
pub trait GatewayStore {
    /// Creates a gateway.
    async fn create_gateway(&mut self, gw: &mut Gateway) -> Result<(), StorageError>;
    /// Returns the gateway.
    async fn get_gateway(&mut self, mac: Eui64, for_update: bool) -> Result<Gateway, StorageError>;
    /// Deletes the gateway.
    async fn delete_gateway(&mut self, mac: Eui64) -> Result<(), StorageError>;
    /// Returns the next gateway to ping and locks it, `None` if no ping is due.
    async fn get_gateway_for_ping(&mut self) -> Result<Option<Gateway>, StorageError>;
    /// Records the last sent ping of a gateway.
    async fn update_gateway_ping(
        &mut self,
        mac: Eui64,
        ping_id: i64,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

/// Gateway ping storage.
#[async_trait]
pub trait GatewayPingStore {
    /// Creates a ping and sets its ID.
    async fn create_gateway_ping(&mut self, ping: &mut GatewayPing) -> Result<(), StorageError>;
    /// Returns the ping.
    async fn get_gateway_ping(&mut self, id: i64) -> Result<GatewayPing, StorageError>;
    /// Creates a ping reception and sets its ID.
    async fn create_gateway_ping_rx(&mut self, rx: &mut GatewayPingRx) -> Result<(), StorageError>;
    /// Returns the last ping sent by the gateway with its receptions.
    async fn get_last_gateway_ping_and_rx(
        &mut self,
        mac: Eui64,
    ) -> Result<(GatewayPing, Vec<GatewayPingRx>), StorageError>;
}

/// Device storage.
#[async_trait]
pub trait DeviceStore {
    /// Returns the device.
    async fn get_device(&mut self, dev_eui: Eui64) -> Result<Device, StorageError>;
}

/// Multicast group storage.
#[async_trait]
pub trait MulticastGroupStore {
    /// Returns the multicast group.
    async fn get_multicast_group(&mut self, id: Uuid) -> Result<MulticastGroup, StorageError>;
    /// Adds a device to the multicast group.
    ///
    /// Returns [`StorageError::AlreadyExists`] if it is a member already.
    async fn add_device_to_multicast_group(
        &mut self,
        multicast_group_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<(), StorageError>;
    /// Removes a device from the multicast group.
    ///
    /// Returns [`StorageError::DoesNotExist`] if it is no member.
    async fn remove_device_from_multicast_group(
        &mut self,
        multicast_group_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<(), StorageError>;
}

/// Remote multicast setup storage.
#[async_trait]
pub trait RemoteMulticastSetupStore {
    /// Creates a remote multicast setup.
    async fn create_remote_multicast_setup(
        &mut self,
        setup: &mut RemoteMulticastSetup,
    ) -> Result<(), StorageError>;
    /// Returns the setup of the multicast group on the device.
    async fn get_remote_multicast_setup(
        &mut self,
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        for_update: bool,
    ) -> Result<RemoteMulticastSetup, StorageError>;
    /// Returns the setup of the McGroupID slot on the device.
    async fn get_remote_multicast_setup_by_group_id(
        &mut self,
        dev_eui: Eui64,
        mc_group_id: i32,
        for_update: bool,
    ) -> Result<RemoteMulticastSetup, StorageError>;
    /// Updates the setup.
    async fn update_remote_multicast_setup(
        &mut self,
        setup: &mut RemoteMulticastSetup,
    ) -> Result<(), StorageError>;
    /// Returns and locks setups which are due.
    async fn get_pending_remote_multicast_setup_items(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteMulticastSetup>, StorageError>;
}

/// Remote multicast class C session storage.
#[async_trait]
pub trait RemoteMulticastClassCSessionStore {
    /// Creates a class C session.
    async fn create_remote_multicast_class_c_session(
        &mut self,
        session: &mut RemoteMulticastClassCSession,
    ) -> Result<(), StorageError>;
    /// Returns the class C session of the multicast group on the device.
    async fn get_remote_multicast_class_c_session(
        &mut self,
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        for_update: bool,
    ) -> Result<RemoteMulticastClassCSession, StorageError>;
    /// Returns the class C session of the McGroupID slot on the device.
    async fn get_remote_multicast_class_c_session_by_group_id(
        &mut self,
        dev_eui: Eui64,
        mc_group_id: i32,
        for_update: bool,
    ) -> Result<RemoteMulticastClassCSession, StorageError>;
    /// Updates the class C session.
    async fn update_remote_multicast_class_c_session(
        &mut self,
        session: &mut RemoteMulticastClassCSession,
    ) -> Result<(), StorageError>;
    /// Returns and locks class C sessions which are due.
    async fn get_pending_remote_multicast_class_c_sessions(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteMulticastClassCSession>, StorageError>;
}

/// Remote fragmentation session storage.
#[async_trait]
pub trait RemoteFragmentationSessionStore {
    /// Creates a fragmentation session.
    async fn create_remote_fragmentation_session(
        &mut self,
        session: &mut RemoteFragmentationSession,
    ) -> Result<(), StorageError>;
    /// Returns the fragmentation session of the FragIndex slot on the device.
    async fn get_remote_fragmentation_session(
        &mut self,
        dev_eui: Eui64,
        frag_index: i32,
        for_update: bool,
    ) -> Result<RemoteFragmentationSession, StorageError>;
    /// Updates the fragmentation session.
    async fn update_remote_fragmentation_session(
        &mut self,
        session: &mut RemoteFragmentationSession,
    ) -> Result<(), StorageError>;
    /// Returns and locks fragmentation sessions which are due.
    ///
    /// Sessions bound to multicast groups are only due once one of the groups is provisioned on
    /// the device.
    async fn get_pending_remote_fragmentation_sessions(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteFragmentationSession>, StorageError>;
}

/// FUOTA deployment device storage.
#[async_trait]
pub trait FuotaDeploymentStore {
    /// Returns and locks the pending deployment entry of the device.
    async fn get_pending_fuota_deployment_device(
        &mut self,
        dev_eui: Eui64,
    ) -> Result<FuotaDeploymentDevice, StorageError>;
    /// Returns the deployment entry of the device.
    async fn get_fuota_deployment_device(
        &mut self,
        fuota_deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<FuotaDeploymentDevice, StorageError>;
    /// Updates the deployment entry.
    async fn update_fuota_deployment_device(
        &mut self,
        device: &mut FuotaDeploymentDevice,
    ) -> Result<(), StorageError>;
}

/// A unit of work over all entity stores.
#[async_trait]
pub trait Transaction:
    NetworkServerStore
    + OrganizationStore
    + UserStore
    + GatewayStore
    + GatewayPingStore
    + DeviceStore
    + MulticastGroupStore
    + RemoteMulticastSetupStore
    + RemoteMulticastClassCSessionStore
    + RemoteFragmentationSessionStore
    + FuotaDeploymentStore
    + Send
{
    /// Commits all changes.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
    /// Discards all changes.
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Hands out transactions.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    /// Starts a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("my-org_1").is_ok());
        assert!(matches!(
            validate_name("my org"),
            Err(StorageError::InvalidName)
        ));
        assert!(matches!(validate_name(""), Err(StorageError::InvalidName)));
    }

    #[test]
    fn network_server_discovery_interval() {
        let mut ns = NetworkServer {
            id: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: "ns".to_owned(),
            server: "http://localhost:8080".to_owned(),
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            gateway_discovery_enabled: true,
            gateway_discovery_interval: 0,
            gateway_discovery_tx_frequency: 868_100_000,
            gateway_discovery_dr: 5,
            region: "EU868".to_owned(),
            version: String::new(),
        };
        assert!(matches!(
            ns.validate(),
            Err(StorageError::InvalidGatewayDiscoveryInterval)
        ));
        ns.gateway_discovery_interval = 24;
        assert!(ns.validate().is_ok());
        ns.gateway_discovery_enabled = false;
        ns.gateway_discovery_interval = 0;
        assert!(ns.validate().is_ok());
    }

    #[test]
    fn remote_session_ranges() {
        use crate::storage::memory::fixtures::{
            class_c_session, fragmentation_session, multicast_setup,
        };
        let dev_eui = Eui64([1, 2, 3, 4, 5, 6, 7, 8]);

        let mut session = fragmentation_session(dev_eui, 0);
        assert!(session.validate().is_ok());
        session.frag_size = 300;
        assert!(matches!(
            session.validate(),
            Err(StorageError::OutOfRange {
                field: "FragSize",
                ..
            })
        ));
        session.frag_size = 50;
        session.mc_group_ids = vec![4];
        assert!(matches!(
            session.validate(),
            Err(StorageError::InvalidMcGroupId)
        ));

        let mut setup = multicast_setup(dev_eui, Uuid::new_v4(), 1);
        assert!(setup.validate().is_ok());
        setup.max_mc_f_cnt = i64::from(u32::MAX) + 1;
        assert!(matches!(
            setup.validate(),
            Err(StorageError::OutOfRange {
                field: "maxMcFCnt",
                ..
            })
        ));

        let mut class_c = class_c_session(dev_eui, Uuid::new_v4(), 1);
        assert!(class_c.validate().is_ok());
        class_c.dr = 256;
        assert!(matches!(
            class_c.validate(),
            Err(StorageError::OutOfRange { field: "DR", .. })
        ));
        class_c.dr = 5;
        class_c.session_time_out = 16;
        assert!(class_c.validate().is_err());
    }

    #[test]
    fn state_text() {
        assert_eq!(RemoteSessionState::Delete.as_str(), "delete");
        assert_eq!(
            "success".parse::<FuotaDeploymentDeviceState>(),
            Ok(FuotaDeploymentDeviceState::Success)
        );
        assert!("done".parse::<RemoteSessionState>().is_err());
        assert_eq!(
            serde_json::to_string(&RemoteSessionState::Setup).unwrap(),
            "\"setup\""
        );
    }
}

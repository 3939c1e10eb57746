//! In-memory store used by the tests.
//!
//! A transaction locks the whole data set and works on a copy which replaces the data on commit.

use crate::error::StorageError;
use crate::lorawan::Eui64;
use crate::storage::{
    Device, DeviceStore, FuotaDeploymentDevice, FuotaDeploymentDeviceState,
    FuotaDeploymentStore, Gateway, GatewayPing, GatewayPingRx, GatewayPingStore, GatewayStore,
    MulticastGroup, MulticastGroupStore, NetworkServer, NetworkServerStore, Organization,
    OrganizationStore, OrganizationUser, RemoteFragmentationSession,
    RemoteFragmentationSessionStore, RemoteMulticastClassCSession,
    RemoteMulticastClassCSessionStore, RemoteMulticastSetup, RemoteMulticastSetupStore, Store,
    Transaction, User, UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// All stored rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryData {
    /// Last handed out serial ID.
    pub last_id: i64,
    /// Network servers by ID.
    pub network_servers: BTreeMap<i64, NetworkServer>,
    /// Organizations by ID.
    pub organizations: BTreeMap<i64, Organization>,
    /// Users.
    pub users: Vec<User>,
    /// Organization memberships.
    pub organization_users: Vec<OrganizationUser>,
    /// Gateways by MAC.
    pub gateways: BTreeMap<Eui64, Gateway>,
    /// Gateway pings by ID.
    pub gateway_pings: BTreeMap<i64, GatewayPing>,
    /// Gateway ping receptions.
    pub gateway_ping_rx: Vec<GatewayPingRx>,
    /// Devices by DevEUI.
    pub devices: BTreeMap<Eui64, Device>,
    /// Multicast groups by ID.
    pub multicast_groups: BTreeMap<Uuid, MulticastGroup>,
    /// Multicast group memberships.
    pub device_multicast_groups: BTreeSet<(Uuid, Eui64)>,
    /// Remote multicast setups.
    pub multicast_setups: BTreeMap<(Eui64, Uuid), RemoteMulticastSetup>,
    /// Remote class C sessions.
    pub class_c_sessions: BTreeMap<(Eui64, Uuid), RemoteMulticastClassCSession>,
    /// Remote fragmentation sessions.
    pub fragmentation_sessions: BTreeMap<(Eui64, i32), RemoteFragmentationSession>,
    /// FUOTA deployment devices.
    pub fuota_deployment_devices: BTreeMap<(Uuid, Eui64), FuotaDeploymentDevice>,
}

impl MemoryData {
    /// Hands out the next serial ID.
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// Store keeping all rows in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    /// The committed data.
    data: Arc<Mutex<MemoryData>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on the committed data, for seeding and assertions.
    pub async fn with_data<R>(&self, f: impl FnOnce(&mut MemoryData) -> R) -> R {
        f(&mut *self.data.lock().await)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let guard = self.data.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

/// Transaction of a [`MemoryStore`].
pub struct MemoryTransaction {
    /// Lock on the committed data.
    guard: OwnedMutexGuard<MemoryData>,
    /// Uncommitted copy.
    working: MemoryData,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Whether a retryable item is due.
fn is_due(
    state_provisioned: bool,
    retry_count: i32,
    retry_after: DateTime<Utc>,
    max_retry_count: i32,
) -> bool {
    !state_provisioned && retry_count < max_retry_count && retry_after < Utc::now()
}

/// Sorts by `retry_after` and applies the limit.
fn take_due<T: Clone>(
    mut items: Vec<T>,
    retry_after: impl Fn(&T) -> DateTime<Utc>,
    limit: i64,
) -> Vec<T> {
    items.sort_by_key(|item| retry_after(item));
    items.truncate(usize::try_from(limit).unwrap_or(0));
    items
}

#[async_trait]
impl NetworkServerStore for MemoryTransaction {
    async fn create_network_server(&mut self, ns: &mut NetworkServer) -> Result<(), StorageError> {
        ns.validate()?;
        ns.id = self.working.next_id();
        self.working.network_servers.insert(ns.id, ns.clone());
        Ok(())
    }

    async fn get_network_server(&mut self, id: i64) -> Result<NetworkServer, StorageError> {
        self.working
            .network_servers
            .get(&id)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn update_network_server(&mut self, ns: &mut NetworkServer) -> Result<(), StorageError> {
        ns.validate()?;
        let stored = self
            .working
            .network_servers
            .get_mut(&ns.id)
            .ok_or(StorageError::DoesNotExist)?;
        ns.updated_at = Utc::now();
        *stored = ns.clone();
        Ok(())
    }

    async fn delete_network_server(&mut self, id: i64) -> Result<(), StorageError> {
        self.working
            .network_servers
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::DoesNotExist)
    }
}

#[async_trait]
impl OrganizationStore for MemoryTransaction {
    async fn create_organization(&mut self, org: &mut Organization) -> Result<(), StorageError> {
        org.validate()?;
        if self
            .working
            .organizations
            .values()
            .any(|stored| stored.name == org.name)
        {
            return Err(StorageError::AlreadyExists);
        }
        org.id = self.working.next_id();
        self.working.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn get_organization(&mut self, id: i64) -> Result<Organization, StorageError> {
        self.working
            .organizations
            .get(&id)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn delete_organization(&mut self, id: i64) -> Result<(), StorageError> {
        self.working
            .organizations
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::DoesNotExist)
    }
}

#[async_trait]
impl UserStore for MemoryTransaction {
    async fn get_user_by_username(&mut self, username: &str) -> Result<User, StorageError> {
        self.working
            .users
            .iter()
            .find(|user| user.username == username)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn get_organization_user(
        &mut self,
        organization_id: i64,
        user_id: i64,
    ) -> Result<OrganizationUser, StorageError> {
        self.working
            .organization_users
            .iter()
            .find(|ou| ou.organization_id == organization_id && ou.user_id == user_id)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn get_user_bonus_org_id(&mut self, email: &str) -> Result<i64, StorageError> {
        let user_ids: Vec<i64> = self
            .working
            .users
            .iter()
            .filter(|user| user.email == email)
            .map(|user| user.id)
            .collect();
        Ok(self
            .working
            .organization_users
            .iter()
            .filter(|ou| ou.is_admin && user_ids.contains(&ou.user_id))
            .map(|ou| ou.organization_id)
            .min()
            .unwrap_or(0))
    }
}

#[async_trait]
impl GatewayStore for MemoryTransaction {
    async fn create_gateway(&mut self, gw: &mut Gateway) -> Result<(), StorageError> {
        gw.validate()?;
        if self.working.gateways.contains_key(&gw.mac) {
            return Err(StorageError::AlreadyExists);
        }
        if !self.working.organizations.contains_key(&gw.organization_id)
            || !self
                .working
                .network_servers
                .contains_key(&gw.network_server_id)
        {
            return Err(StorageError::InvalidForeignKey);
        }
        self.working.gateways.insert(gw.mac, gw.clone());
        Ok(())
    }

    async fn get_gateway(&mut self, mac: Eui64, _for_update: bool) -> Result<Gateway, StorageError> {
        self.working
            .gateways
            .get(&mac)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn delete_gateway(&mut self, mac: Eui64) -> Result<(), StorageError> {
        self.working
            .gateways
            .remove(&mac)
            .map(|_| ())
            .ok_or(StorageError::DoesNotExist)
    }

    async fn get_gateway_for_ping(&mut self) -> Result<Option<Gateway>, StorageError> {
        let now = Utc::now();
        let mut due: Vec<Gateway> = self
            .working
            .gateways
            .values()
            .filter(|gw| gw.ping)
            .filter(|gw| {
                let Some(ns) = self.working.network_servers.get(&gw.network_server_id) else {
                    return false;
                };
                if !ns.gateway_discovery_enabled || ns.gateway_discovery_interval <= 0 {
                    return false;
                }
                let interval = Duration::hours(24) / ns.gateway_discovery_interval;
                gw.last_ping_sent_at
                    .map_or(true, |sent_at| sent_at <= now - interval)
            })
            .cloned()
            .collect();
        // None sorts before Some, matching "nulls first".
        due.sort_by_key(|gw| gw.last_ping_sent_at);
        Ok(due.into_iter().next())
    }

    async fn update_gateway_ping(
        &mut self,
        mac: Eui64,
        ping_id: i64,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let gw = self
            .working
            .gateways
            .get_mut(&mac)
            .ok_or(StorageError::DoesNotExist)?;
        gw.last_ping_id = Some(ping_id);
        gw.last_ping_sent_at = Some(sent_at);
        Ok(())
    }
}

#[async_trait]
impl GatewayPingStore for MemoryTransaction {
    async fn create_gateway_ping(&mut self, ping: &mut GatewayPing) -> Result<(), StorageError> {
        ping.id = self.working.next_id();
        ping.created_at = Utc::now();
        self.working.gateway_pings.insert(ping.id, ping.clone());
        Ok(())
    }

    async fn get_gateway_ping(&mut self, id: i64) -> Result<GatewayPing, StorageError> {
        self.working
            .gateway_pings
            .get(&id)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn create_gateway_ping_rx(&mut self, rx: &mut GatewayPingRx) -> Result<(), StorageError> {
        if !self.working.gateway_pings.contains_key(&rx.ping_id) {
            return Err(StorageError::InvalidForeignKey);
        }
        rx.id = self.working.next_id();
        rx.created_at = Utc::now();
        self.working.gateway_ping_rx.push(rx.clone());
        Ok(())
    }

    async fn get_last_gateway_ping_and_rx(
        &mut self,
        mac: Eui64,
    ) -> Result<(GatewayPing, Vec<GatewayPingRx>), StorageError> {
        let gateway = self.get_gateway(mac, false).await?;
        let ping_id = gateway.last_ping_id.ok_or(StorageError::DoesNotExist)?;
        let ping = self.get_gateway_ping(ping_id).await?;
        let rx = self
            .working
            .gateway_ping_rx
            .iter()
            .filter(|rx| rx.ping_id == ping_id)
            .cloned()
            .collect();
        Ok((ping, rx))
    }
}

#[async_trait]
impl DeviceStore for MemoryTransaction {
    async fn get_device(&mut self, dev_eui: Eui64) -> Result<Device, StorageError> {
        self.working
            .devices
            .get(&dev_eui)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }
}

#[async_trait]
impl MulticastGroupStore for MemoryTransaction {
    async fn get_multicast_group(&mut self, id: Uuid) -> Result<MulticastGroup, StorageError> {
        self.working
            .multicast_groups
            .get(&id)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn add_device_to_multicast_group(
        &mut self,
        multicast_group_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<(), StorageError> {
        if self
            .working
            .device_multicast_groups
            .insert((multicast_group_id, dev_eui))
        {
            Ok(())
        } else {
            Err(StorageError::AlreadyExists)
        }
    }

    async fn remove_device_from_multicast_group(
        &mut self,
        multicast_group_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<(), StorageError> {
        if self
            .working
            .device_multicast_groups
            .remove(&(multicast_group_id, dev_eui))
        {
            Ok(())
        } else {
            Err(StorageError::DoesNotExist)
        }
    }
}

#[async_trait]
impl RemoteMulticastSetupStore for MemoryTransaction {
    async fn create_remote_multicast_setup(
        &mut self,
        setup: &mut RemoteMulticastSetup,
    ) -> Result<(), StorageError> {
        setup.validate()?;
        let key = (setup.dev_eui, setup.multicast_group_id);
        if self.working.multicast_setups.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        self.working.multicast_setups.insert(key, setup.clone());
        Ok(())
    }

    async fn get_remote_multicast_setup(
        &mut self,
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        _for_update: bool,
    ) -> Result<RemoteMulticastSetup, StorageError> {
        self.working
            .multicast_setups
            .get(&(dev_eui, multicast_group_id))
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn get_remote_multicast_setup_by_group_id(
        &mut self,
        dev_eui: Eui64,
        mc_group_id: i32,
        _for_update: bool,
    ) -> Result<RemoteMulticastSetup, StorageError> {
        self.working
            .multicast_setups
            .values()
            .find(|setup| setup.dev_eui == dev_eui && setup.mc_group_id == mc_group_id)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn update_remote_multicast_setup(
        &mut self,
        setup: &mut RemoteMulticastSetup,
    ) -> Result<(), StorageError> {
        let stored = self
            .working
            .multicast_setups
            .get_mut(&(setup.dev_eui, setup.multicast_group_id))
            .ok_or(StorageError::DoesNotExist)?;
        setup.updated_at = Utc::now();
        *stored = setup.clone();
        Ok(())
    }

    async fn get_pending_remote_multicast_setup_items(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteMulticastSetup>, StorageError> {
        let due = self
            .working
            .multicast_setups
            .values()
            .filter(|s| is_due(s.state_provisioned, s.retry_count, s.retry_after, max_retry_count))
            .cloned()
            .collect();
        Ok(take_due(due, |s| s.retry_after, limit))
    }
}

#[async_trait]
impl RemoteMulticastClassCSessionStore for MemoryTransaction {
    async fn create_remote_multicast_class_c_session(
        &mut self,
        session: &mut RemoteMulticastClassCSession,
    ) -> Result<(), StorageError> {
        session.validate()?;
        let key = (session.dev_eui, session.multicast_group_id);
        if self.working.class_c_sessions.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        self.working.class_c_sessions.insert(key, session.clone());
        Ok(())
    }

    async fn get_remote_multicast_class_c_session(
        &mut self,
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        _for_update: bool,
    ) -> Result<RemoteMulticastClassCSession, StorageError> {
        self.working
            .class_c_sessions
            .get(&(dev_eui, multicast_group_id))
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn get_remote_multicast_class_c_session_by_group_id(
        &mut self,
        dev_eui: Eui64,
        mc_group_id: i32,
        _for_update: bool,
    ) -> Result<RemoteMulticastClassCSession, StorageError> {
        self.working
            .class_c_sessions
            .values()
            .find(|s| s.dev_eui == dev_eui && s.mc_group_id == mc_group_id)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn update_remote_multicast_class_c_session(
        &mut self,
        session: &mut RemoteMulticastClassCSession,
    ) -> Result<(), StorageError> {
        let stored = self
            .working
            .class_c_sessions
            .get_mut(&(session.dev_eui, session.multicast_group_id))
            .ok_or(StorageError::DoesNotExist)?;
        session.updated_at = Utc::now();
        *stored = session.clone();
        Ok(())
    }

    async fn get_pending_remote_multicast_class_c_sessions(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteMulticastClassCSession>, StorageError> {
        let due = self
            .working
            .class_c_sessions
            .values()
            .filter(|s| is_due(s.state_provisioned, s.retry_count, s.retry_after, max_retry_count))
            .cloned()
            .collect();
        Ok(take_due(due, |s| s.retry_after, limit))
    }
}

#[async_trait]
impl RemoteFragmentationSessionStore for MemoryTransaction {
    async fn create_remote_fragmentation_session(
        &mut self,
        session: &mut RemoteFragmentationSession,
    ) -> Result<(), StorageError> {
        session.validate()?;
        let key = (session.dev_eui, session.frag_index);
        if self.working.fragmentation_sessions.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        self.working
            .fragmentation_sessions
            .insert(key, session.clone());
        Ok(())
    }

    async fn get_remote_fragmentation_session(
        &mut self,
        dev_eui: Eui64,
        frag_index: i32,
        _for_update: bool,
    ) -> Result<RemoteFragmentationSession, StorageError> {
        self.working
            .fragmentation_sessions
            .get(&(dev_eui, frag_index))
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn update_remote_fragmentation_session(
        &mut self,
        session: &mut RemoteFragmentationSession,
    ) -> Result<(), StorageError> {
        let stored = self
            .working
            .fragmentation_sessions
            .get_mut(&(session.dev_eui, session.frag_index))
            .ok_or(StorageError::DoesNotExist)?;
        session.updated_at = Utc::now();
        *stored = session.clone();
        Ok(())
    }

    async fn get_pending_remote_fragmentation_sessions(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteFragmentationSession>, StorageError> {
        let setups = &self.working.multicast_setups;
        let due = self
            .working
            .fragmentation_sessions
            .values()
            .filter(|s| is_due(s.state_provisioned, s.retry_count, s.retry_after, max_retry_count))
            .filter(|s| {
                s.mc_group_ids.is_empty()
                    || setups.values().any(|setup| {
                        setup.dev_eui == s.dev_eui
                            && setup.state_provisioned
                            && s.mc_group_ids.contains(&setup.mc_group_id)
                    })
            })
            .cloned()
            .collect();
        Ok(take_due(due, |s| s.retry_after, limit))
    }
}

#[async_trait]
impl FuotaDeploymentStore for MemoryTransaction {
    async fn get_pending_fuota_deployment_device(
        &mut self,
        dev_eui: Eui64,
    ) -> Result<FuotaDeploymentDevice, StorageError> {
        self.working
            .fuota_deployment_devices
            .values()
            .filter(|d| d.dev_eui == dev_eui && d.state == FuotaDeploymentDeviceState::Pending)
            .max_by_key(|d| d.created_at)
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn get_fuota_deployment_device(
        &mut self,
        fuota_deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<FuotaDeploymentDevice, StorageError> {
        self.working
            .fuota_deployment_devices
            .get(&(fuota_deployment_id, dev_eui))
            .cloned()
            .ok_or(StorageError::DoesNotExist)
    }

    async fn update_fuota_deployment_device(
        &mut self,
        device: &mut FuotaDeploymentDevice,
    ) -> Result<(), StorageError> {
        let stored = self
            .working
            .fuota_deployment_devices
            .get_mut(&(device.fuota_deployment_id, device.dev_eui))
            .ok_or(StorageError::DoesNotExist)?;
        device.updated_at = Utc::now();
        *stored = device.clone();
        Ok(())
    }
}

/// Builders for test rows.
pub mod fixtures {
    use super::*;
    use crate::lorawan::{Aes128Key, DevAddr, FragDescriptor};
    use crate::storage::RemoteSessionState;

    /// A network server with gateway discovery enabled.
    pub fn network_server(id: i64) -> NetworkServer {
        NetworkServer {
            id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: format!("ns-{id}"),
            server: "http://localhost:8000".to_owned(),
            ca_cert: String::new(),
            tls_cert: String::new(),
            tls_key: String::new(),
            gateway_discovery_enabled: true,
            gateway_discovery_interval: 24,
            gateway_discovery_tx_frequency: 868_100_000,
            gateway_discovery_dr: 5,
            region: "EU868".to_owned(),
            version: String::new(),
        }
    }

    /// An organization.
    pub fn organization(id: i64) -> Organization {
        Organization {
            id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: format!("org-{id}"),
            display_name: format!("Organization {id}"),
            can_have_gateways: true,
            max_gateway_count: 0,
            max_device_count: 0,
        }
    }

    /// An active user without global admin rights.
    pub fn user(id: i64, username: &str) -> User {
        User {
            id,
            username: username.to_owned(),
            email: format!("{username}@example.com"),
            is_admin: false,
            is_active: true,
        }
    }

    /// A membership without any admin flag.
    pub fn organization_user(organization_id: i64, user_id: i64) -> OrganizationUser {
        OrganizationUser {
            organization_id,
            user_id,
            is_admin: false,
            is_device_admin: false,
            is_gateway_admin: false,
        }
    }

    /// A gateway with pinging enabled.
    pub fn gateway(mac: Eui64, organization_id: i64, network_server_id: i64) -> Gateway {
        Gateway {
            mac,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: format!("gw-{mac}"),
            description: String::new(),
            organization_id,
            network_server_id,
            ping: true,
            last_ping_id: None,
            last_ping_sent_at: None,
            latitude: 1.0,
            longitude: 2.0,
            altitude: 3.0,
        }
    }

    /// A device.
    pub fn device(dev_eui: Eui64, organization_id: i64) -> Device {
        Device {
            dev_eui,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            application_id: 1,
            organization_id,
            name: format!("device-{dev_eui}"),
            description: String::new(),
        }
    }

    /// A multicast group.
    pub fn multicast_group(id: Uuid) -> MulticastGroup {
        MulticastGroup {
            id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            name: "group".to_owned(),
            application_id: 1,
            mc_addr: DevAddr([1, 2, 3, 4]),
            mc_nwk_s_key: Aes128Key([1; 16]),
            f_cnt: 0,
            dr: 5,
            frequency: 868_100_000,
        }
    }

    /// A due multicast setup.
    pub fn multicast_setup(
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        mc_group_id: i32,
    ) -> RemoteMulticastSetup {
        RemoteMulticastSetup {
            dev_eui,
            multicast_group_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            mc_group_id,
            mc_addr: DevAddr([1, 2, 3, 4]),
            mc_key_encrypted: Aes128Key([
                1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16,
            ]),
            min_mc_f_cnt: 10,
            max_mc_f_cnt: 20,
            state: RemoteSessionState::Setup,
            state_provisioned: false,
            retry_after: Utc::now() - Duration::seconds(1),
            retry_count: 0,
            retry_interval_secs: 60,
        }
    }

    /// A due class C session.
    pub fn class_c_session(
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        mc_group_id: i32,
    ) -> RemoteMulticastClassCSession {
        RemoteMulticastClassCSession {
            dev_eui,
            multicast_group_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            mc_group_id,
            session_time: Utc::now(),
            session_time_out: 8,
            dl_frequency: 868_100_000,
            dr: 5,
            state_provisioned: false,
            retry_after: Utc::now() - Duration::seconds(1),
            retry_count: 0,
            retry_interval_secs: 60,
        }
    }

    /// A due unicast fragmentation session.
    pub fn fragmentation_session(dev_eui: Eui64, frag_index: i32) -> RemoteFragmentationSession {
        RemoteFragmentationSession {
            dev_eui,
            frag_index,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            mc_group_ids: Vec::new(),
            nb_frag: 10,
            frag_size: 50,
            fragmentation_matrix: 0,
            block_ack_delay: 1,
            padding: 5,
            descriptor: FragDescriptor([1, 2, 3, 4]),
            state: RemoteSessionState::Setup,
            state_provisioned: false,
            retry_after: Utc::now() - Duration::seconds(1),
            retry_count: 0,
            retry_interval_secs: 60,
        }
    }

    /// A pending FUOTA deployment device.
    pub fn fuota_deployment_device(
        fuota_deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> FuotaDeploymentDevice {
        FuotaDeploymentDevice {
            fuota_deployment_id,
            dev_eui,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            state: FuotaDeploymentDeviceState::Pending,
            error_message: String::new(),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn rollback_discards_changes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create_organization(&mut organization(0)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.with_data(|d| d.organizations.is_empty()).await);

        let mut tx = store.begin().await.unwrap();
        tx.create_organization(&mut organization(0)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.with_data(|d| d.organizations.len()).await, 1);
    }

    #[tokio::test]
    async fn pending_fragmentation_sessions_wait_for_multicast_setup() {
        let store = MemoryStore::new();
        let dev_eui = Eui64([1; 8]);
        let group = Uuid::new_v4();
        let mut session = fragmentation_session(dev_eui, 0);
        session.mc_group_ids = vec![1];
        store
            .with_data(|d| {
                d.fragmentation_sessions.insert((dev_eui, 0), session);
                d.multicast_setups
                    .insert((dev_eui, group), multicast_setup(dev_eui, group, 1));
            })
            .await;

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .get_pending_remote_fragmentation_sessions(10, 3)
            .await
            .unwrap()
            .is_empty());
        tx.rollback().await.unwrap();

        store
            .with_data(|d| {
                if let Some(setup) = d.multicast_setups.get_mut(&(dev_eui, group)) {
                    setup.state_provisioned = true;
                }
            })
            .await;
        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.get_pending_remote_fragmentation_sessions(10, 3)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn gateway_for_ping_respects_interval() {
        let store = MemoryStore::new();
        let mac = Eui64([2; 8]);
        let mut gw = gateway(mac, 1, 1);
        gw.last_ping_sent_at = Some(Utc::now() - Duration::minutes(30));
        store
            .with_data(|d| {
                d.network_servers.insert(1, network_server(1));
                d.gateways.insert(mac, gw);
            })
            .await;

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_gateway_for_ping().await.unwrap().is_none());
        tx.update_gateway_ping(mac, 1, Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(tx.get_gateway_for_ping().await.unwrap().unwrap().mac, mac);
    }
}

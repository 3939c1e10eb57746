//! PostgreSQL implementation of the store traits.

use crate::configuration::PostgresqlConfig;
use crate::error::StorageError;
use crate::lorawan::Eui64;
use crate::storage::{
    Device, DeviceStore, FuotaDeploymentDevice, FuotaDeploymentStore, Gateway,
    GatewayPing, GatewayPingRx, GatewayPingStore, GatewayStore, MulticastGroup,
    MulticastGroupStore, NetworkServer, NetworkServerStore, Organization, OrganizationStore,
    OrganizationUser, RemoteFragmentationSession, RemoteFragmentationSessionStore,
    RemoteMulticastClassCSession, RemoteMulticastClassCSessionStore, RemoteMulticastSetup,
    RemoteMulticastSetupStore, Store, Transaction, User, UserStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgQueryResult};
use sqlx::{PgPool, Postgres};
use tracing::{info, trace};
use uuid::Uuid;

/// Store backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    /// Connection pool.
    pool: PgPool,
}

impl PgStore {
    /// Connects to the database and runs the migrations if `automigrate` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(config: &PostgresqlConfig) -> Result<Self, StorageError> {
        trace!("Connecting to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_connections)
            .connect(&config.dsn)
            .await?;

        if config.automigrate {
            info!("Applying PostgreSQL migrations");
            sqlx::migrate!().run(&pool).await?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// A running PostgreSQL transaction.
#[derive(Debug)]
pub struct PgTransaction {
    /// The sqlx transaction.
    tx: sqlx::Transaction<'static, Postgres>,
}

/// Appends the row lock clause if requested.
fn lock_clause(query: &str, for_update: bool) -> String {
    if for_update {
        format!("{query} for update")
    } else {
        query.to_owned()
    }
}

/// Adds a multicast group membership.
///
/// Conflicts are skipped since a unique violation aborts the whole Postgres transaction.
const INSERT_DEVICE_MULTICAST_GROUP: &str =
    "insert into device_multicast_group (dev_eui, multicast_group_id, created_at)
    values ($1, $2, $3)
    on conflict (dev_eui, multicast_group_id) do nothing";

/// Maps an update or delete without affected rows to [`StorageError::DoesNotExist`].
fn expect_affected(result: &PgQueryResult) -> Result<(), StorageError> {
    if result.rows_affected() == 0 {
        Err(StorageError::DoesNotExist)
    } else {
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        Ok(self.tx.commit().await?)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(self.tx.rollback().await?)
    }
}

#[async_trait]
impl NetworkServerStore for PgTransaction {
    async fn create_network_server(&mut self, ns: &mut NetworkServer) -> Result<(), StorageError> {
        ns.validate()?;
        let now = Utc::now();
        ns.created_at = now;
        ns.updated_at = now;
        ns.id = sqlx::query_scalar(
            "insert into network_server (
                created_at, updated_at, name, server, ca_cert, tls_cert, tls_key,
                gateway_discovery_enabled, gateway_discovery_interval,
                gateway_discovery_tx_frequency, gateway_discovery_dr, region, version
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            returning id",
        )
        .bind(ns.created_at)
        .bind(ns.updated_at)
        .bind(&ns.name)
        .bind(&ns.server)
        .bind(&ns.ca_cert)
        .bind(&ns.tls_cert)
        .bind(&ns.tls_key)
        .bind(ns.gateway_discovery_enabled)
        .bind(ns.gateway_discovery_interval)
        .bind(ns.gateway_discovery_tx_frequency)
        .bind(ns.gateway_discovery_dr)
        .bind(&ns.region)
        .bind(&ns.version)
        .fetch_one(&mut self.tx)
        .await?;
        info!(id = ns.id, name = %ns.name, "network-server created");
        Ok(())
    }

    async fn get_network_server(&mut self, id: i64) -> Result<NetworkServer, StorageError> {
        Ok(
            sqlx::query_as("select * from network_server where id = $1")
                .bind(id)
                .fetch_one(&mut self.tx)
                .await?,
        )
    }

    async fn update_network_server(&mut self, ns: &mut NetworkServer) -> Result<(), StorageError> {
        ns.validate()?;
        ns.updated_at = Utc::now();
        let result = sqlx::query(
            "update network_server set
                updated_at = $2, name = $3, server = $4, ca_cert = $5, tls_cert = $6,
                tls_key = $7, gateway_discovery_enabled = $8, gateway_discovery_interval = $9,
                gateway_discovery_tx_frequency = $10, gateway_discovery_dr = $11, region = $12,
                version = $13
            where id = $1",
        )
        .bind(ns.id)
        .bind(ns.updated_at)
        .bind(&ns.name)
        .bind(&ns.server)
        .bind(&ns.ca_cert)
        .bind(&ns.tls_cert)
        .bind(&ns.tls_key)
        .bind(ns.gateway_discovery_enabled)
        .bind(ns.gateway_discovery_interval)
        .bind(ns.gateway_discovery_tx_frequency)
        .bind(ns.gateway_discovery_dr)
        .bind(&ns.region)
        .bind(&ns.version)
        .execute(&mut self.tx)
        .await?;
        expect_affected(&result)?;
        info!(id = ns.id, "network-server updated");
        Ok(())
    }

    async fn delete_network_server(&mut self, id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("delete from network_server where id = $1")
            .bind(id)
            .execute(&mut self.tx)
            .await?;
        expect_affected(&result)?;
        info!(id, "network-server deleted");
        Ok(())
    }
}

#[async_trait]
impl OrganizationStore for PgTransaction {
    async fn create_organization(&mut self, org: &mut Organization) -> Result<(), StorageError> {
        org.validate()?;
        let now = Utc::now();
        org.created_at = now;
        org.updated_at = now;
        org.id = sqlx::query_scalar(
            "insert into organization (
                created_at, updated_at, name, display_name, can_have_gateways,
                max_gateway_count, max_device_count
            ) values ($1, $2, $3, $4, $5, $6, $7)
            returning id",
        )
        .bind(org.created_at)
        .bind(org.updated_at)
        .bind(&org.name)
        .bind(&org.display_name)
        .bind(org.can_have_gateways)
        .bind(org.max_gateway_count)
        .bind(org.max_device_count)
        .fetch_one(&mut self.tx)
        .await?;
        info!(id = org.id, name = %org.name, "organization created");
        Ok(())
    }

    async fn get_organization(&mut self, id: i64) -> Result<Organization, StorageError> {
        Ok(sqlx::query_as("select * from organization where id = $1")
            .bind(id)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn delete_organization(&mut self, id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("delete from organization where id = $1")
            .bind(id)
            .execute(&mut self.tx)
            .await?;
        expect_affected(&result)?;
        info!(id, "organization deleted");
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgTransaction {
    async fn get_user_by_username(&mut self, username: &str) -> Result<User, StorageError> {
        Ok(sqlx::query_as(
            r#"select id, username, email, is_admin, is_active from "user" where username = $1"#,
        )
        .bind(username)
        .fetch_one(&mut self.tx)
        .await?)
    }

    async fn get_organization_user(
        &mut self,
        organization_id: i64,
        user_id: i64,
    ) -> Result<OrganizationUser, StorageError> {
        Ok(sqlx::query_as(
            "select organization_id, user_id, is_admin, is_device_admin, is_gateway_admin
            from organization_user
            where organization_id = $1 and user_id = $2",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_one(&mut self.tx)
        .await?)
    }

    async fn get_user_bonus_org_id(&mut self, email: &str) -> Result<i64, StorageError> {
        let org_id: Option<i64> = sqlx::query_scalar(
            r#"select ou.organization_id
            from organization_user ou
            inner join "user" u
                on u.id = ou.user_id
            where
                u.email = $1
                and ou.is_admin = true
            order by ou.organization_id
            limit 1"#,
        )
        .bind(email)
        .fetch_optional(&mut self.tx)
        .await?;
        Ok(org_id.unwrap_or(0))
    }
}

#[async_trait]
impl GatewayStore for PgTransaction {
    async fn create_gateway(&mut self, gw: &mut Gateway) -> Result<(), StorageError> {
        gw.validate()?;
        let now = Utc::now();
        gw.created_at = now;
        gw.updated_at = now;
        sqlx::query(
            "insert into gateway (
                mac, created_at, updated_at, name, description, organization_id,
                network_server_id, ping, last_ping_id, last_ping_sent_at, latitude, longitude,
                altitude
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(gw.mac)
        .bind(gw.created_at)
        .bind(gw.updated_at)
        .bind(&gw.name)
        .bind(&gw.description)
        .bind(gw.organization_id)
        .bind(gw.network_server_id)
        .bind(gw.ping)
        .bind(gw.last_ping_id)
        .bind(gw.last_ping_sent_at)
        .bind(gw.latitude)
        .bind(gw.longitude)
        .bind(gw.altitude)
        .execute(&mut self.tx)
        .await?;
        info!(mac = %gw.mac, name = %gw.name, "gateway created");
        Ok(())
    }

    async fn get_gateway(&mut self, mac: Eui64, for_update: bool) -> Result<Gateway, StorageError> {
        let query = lock_clause("select * from gateway where mac = $1", for_update);
        Ok(sqlx::query_as(&query)
            .bind(mac)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn delete_gateway(&mut self, mac: Eui64) -> Result<(), StorageError> {
        let result = sqlx::query("delete from gateway where mac = $1")
            .bind(mac)
            .execute(&mut self.tx)
            .await?;
        expect_affected(&result)?;
        info!(%mac, "gateway deleted");
        Ok(())
    }

    async fn get_gateway_for_ping(&mut self) -> Result<Option<Gateway>, StorageError> {
        Ok(sqlx::query_as(
            "select g.*
            from gateway g
            inner join network_server ns
                on ns.id = g.network_server_id
            where
                ns.gateway_discovery_enabled = true
                and g.ping = true
                and (
                    g.last_ping_sent_at is null
                    or g.last_ping_sent_at <= (now() - (interval '24 hours' / ns.gateway_discovery_interval))
                )
            order by g.last_ping_sent_at nulls first
            limit 1
            for update of g skip locked",
        )
        .fetch_optional(&mut self.tx)
        .await?)
    }

    async fn update_gateway_ping(
        &mut self,
        mac: Eui64,
        ping_id: i64,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "update gateway set last_ping_id = $2, last_ping_sent_at = $3 where mac = $1",
        )
        .bind(mac)
        .bind(ping_id)
        .bind(sent_at)
        .execute(&mut self.tx)
        .await?;
        expect_affected(&result)
    }
}

#[async_trait]
impl GatewayPingStore for PgTransaction {
    async fn create_gateway_ping(&mut self, ping: &mut GatewayPing) -> Result<(), StorageError> {
        ping.created_at = Utc::now();
        ping.id = sqlx::query_scalar(
            "insert into gateway_ping (created_at, gateway_mac, frequency, dr)
            values ($1, $2, $3, $4)
            returning id",
        )
        .bind(ping.created_at)
        .bind(ping.gateway_mac)
        .bind(ping.frequency)
        .bind(ping.dr)
        .fetch_one(&mut self.tx)
        .await?;
        info!(id = ping.id, gateway_mac = %ping.gateway_mac, "gateway ping created");
        Ok(())
    }

    async fn get_gateway_ping(&mut self, id: i64) -> Result<GatewayPing, StorageError> {
        Ok(sqlx::query_as("select * from gateway_ping where id = $1")
            .bind(id)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn create_gateway_ping_rx(&mut self, rx: &mut GatewayPingRx) -> Result<(), StorageError> {
        rx.created_at = Utc::now();
        rx.id = sqlx::query_scalar(
            "insert into gateway_ping_rx (
                created_at, ping_id, gateway_mac, received_at, rssi, lora_snr, latitude,
                longitude, altitude
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            returning id",
        )
        .bind(rx.created_at)
        .bind(rx.ping_id)
        .bind(rx.gateway_mac)
        .bind(rx.received_at)
        .bind(rx.rssi)
        .bind(rx.lora_snr)
        .bind(rx.latitude)
        .bind(rx.longitude)
        .bind(rx.altitude)
        .fetch_one(&mut self.tx)
        .await?;
        info!(id = rx.id, ping_id = rx.ping_id, gateway_mac = %rx.gateway_mac, "gateway ping rx created");
        Ok(())
    }

    async fn get_last_gateway_ping_and_rx(
        &mut self,
        mac: Eui64,
    ) -> Result<(GatewayPing, Vec<GatewayPingRx>), StorageError> {
        let gateway = self.get_gateway(mac, false).await?;
        let ping_id = gateway.last_ping_id.ok_or(StorageError::DoesNotExist)?;
        let ping = self.get_gateway_ping(ping_id).await?;
        let rx = sqlx::query_as("select * from gateway_ping_rx where ping_id = $1 order by id")
            .bind(ping_id)
            .fetch_all(&mut self.tx)
            .await?;
        Ok((ping, rx))
    }
}

#[async_trait]
impl DeviceStore for PgTransaction {
    async fn get_device(&mut self, dev_eui: Eui64) -> Result<Device, StorageError> {
        Ok(sqlx::query_as(
            "select
                d.dev_eui, d.created_at, d.updated_at, d.application_id, a.organization_id,
                d.name, d.description
            from device d
            inner join application a
                on a.id = d.application_id
            where d.dev_eui = $1",
        )
        .bind(dev_eui)
        .fetch_one(&mut self.tx)
        .await?)
    }
}

#[async_trait]
impl MulticastGroupStore for PgTransaction {
    async fn get_multicast_group(&mut self, id: Uuid) -> Result<MulticastGroup, StorageError> {
        Ok(sqlx::query_as("select * from multicast_group where id = $1")
            .bind(id)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn add_device_to_multicast_group(
        &mut self,
        multicast_group_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(INSERT_DEVICE_MULTICAST_GROUP)
            .bind(dev_eui)
            .bind(multicast_group_id)
            .bind(Utc::now())
            .execute(&mut self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists);
        }
        info!(%dev_eui, %multicast_group_id, "device added to multicast-group");
        Ok(())
    }

    async fn remove_device_from_multicast_group(
        &mut self,
        multicast_group_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "delete from device_multicast_group where dev_eui = $1 and multicast_group_id = $2",
        )
        .bind(dev_eui)
        .bind(multicast_group_id)
        .execute(&mut self.tx)
        .await?;
        expect_affected(&result)?;
        info!(%dev_eui, %multicast_group_id, "device removed from multicast-group");
        Ok(())
    }
}

#[async_trait]
impl RemoteMulticastSetupStore for PgTransaction {
    async fn create_remote_multicast_setup(
        &mut self,
        setup: &mut RemoteMulticastSetup,
    ) -> Result<(), StorageError> {
        setup.validate()?;
        let now = Utc::now();
        setup.created_at = now;
        setup.updated_at = now;
        sqlx::query(
            "insert into remote_multicast_setup (
                dev_eui, multicast_group_id, created_at, updated_at, mc_group_id, mc_addr,
                mc_key_encrypted, min_mc_f_cnt, max_mc_f_cnt, state, state_provisioned,
                retry_after, retry_count, retry_interval_secs
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(setup.dev_eui)
        .bind(setup.multicast_group_id)
        .bind(setup.created_at)
        .bind(setup.updated_at)
        .bind(setup.mc_group_id)
        .bind(setup.mc_addr)
        .bind(setup.mc_key_encrypted)
        .bind(setup.min_mc_f_cnt)
        .bind(setup.max_mc_f_cnt)
        .bind(setup.state)
        .bind(setup.state_provisioned)
        .bind(setup.retry_after)
        .bind(setup.retry_count)
        .bind(setup.retry_interval_secs)
        .execute(&mut self.tx)
        .await?;
        info!(dev_eui = %setup.dev_eui, multicast_group_id = %setup.multicast_group_id, "remote multicast-setup created");
        Ok(())
    }

    async fn get_remote_multicast_setup(
        &mut self,
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        for_update: bool,
    ) -> Result<RemoteMulticastSetup, StorageError> {
        let query = lock_clause(
            "select * from remote_multicast_setup where dev_eui = $1 and multicast_group_id = $2",
            for_update,
        );
        Ok(sqlx::query_as(&query)
            .bind(dev_eui)
            .bind(multicast_group_id)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn get_remote_multicast_setup_by_group_id(
        &mut self,
        dev_eui: Eui64,
        mc_group_id: i32,
        for_update: bool,
    ) -> Result<RemoteMulticastSetup, StorageError> {
        let query = lock_clause(
            "select * from remote_multicast_setup where dev_eui = $1 and mc_group_id = $2",
            for_update,
        );
        Ok(sqlx::query_as(&query)
            .bind(dev_eui)
            .bind(mc_group_id)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn update_remote_multicast_setup(
        &mut self,
        setup: &mut RemoteMulticastSetup,
    ) -> Result<(), StorageError> {
        setup.updated_at = Utc::now();
        let result = sqlx::query(
            "update remote_multicast_setup set
                updated_at = $3, mc_group_id = $4, mc_addr = $5, mc_key_encrypted = $6,
                min_mc_f_cnt = $7, max_mc_f_cnt = $8, state = $9, state_provisioned = $10,
                retry_after = $11, retry_count = $12, retry_interval_secs = $13
            where dev_eui = $1 and multicast_group_id = $2",
        )
        .bind(setup.dev_eui)
        .bind(setup.multicast_group_id)
        .bind(setup.updated_at)
        .bind(setup.mc_group_id)
        .bind(setup.mc_addr)
        .bind(setup.mc_key_encrypted)
        .bind(setup.min_mc_f_cnt)
        .bind(setup.max_mc_f_cnt)
        .bind(setup.state)
        .bind(setup.state_provisioned)
        .bind(setup.retry_after)
        .bind(setup.retry_count)
        .bind(setup.retry_interval_secs)
        .execute(&mut self.tx)
        .await?;
        expect_affected(&result)
    }

    async fn get_pending_remote_multicast_setup_items(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteMulticastSetup>, StorageError> {
        Ok(sqlx::query_as(
            "select *
            from remote_multicast_setup
            where
                state_provisioned = false
                and retry_count < $1
                and retry_after < $2
            order by retry_after
            limit $3
            for update skip locked",
        )
        .bind(max_retry_count)
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&mut self.tx)
        .await?)
    }
}

#[async_trait]
impl RemoteMulticastClassCSessionStore for PgTransaction {
    async fn create_remote_multicast_class_c_session(
        &mut self,
        session: &mut RemoteMulticastClassCSession,
    ) -> Result<(), StorageError> {
        session.validate()?;
        let now = Utc::now();
        session.created_at = now;
        session.updated_at = now;
        sqlx::query(
            "insert into remote_multicast_class_c_session (
                dev_eui, multicast_group_id, created_at, updated_at, mc_group_id, session_time,
                session_time_out, dl_frequency, dr, state_provisioned, retry_after, retry_count,
                retry_interval_secs
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(session.dev_eui)
        .bind(session.multicast_group_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.mc_group_id)
        .bind(session.session_time)
        .bind(session.session_time_out)
        .bind(session.dl_frequency)
        .bind(session.dr)
        .bind(session.state_provisioned)
        .bind(session.retry_after)
        .bind(session.retry_count)
        .bind(session.retry_interval_secs)
        .execute(&mut self.tx)
        .await?;
        info!(dev_eui = %session.dev_eui, multicast_group_id = %session.multicast_group_id, "remote multicast class-c session created");
        Ok(())
    }

    async fn get_remote_multicast_class_c_session(
        &mut self,
        dev_eui: Eui64,
        multicast_group_id: Uuid,
        for_update: bool,
    ) -> Result<RemoteMulticastClassCSession, StorageError> {
        let query = lock_clause(
            "select * from remote_multicast_class_c_session where dev_eui = $1 and multicast_group_id = $2",
            for_update,
        );
        Ok(sqlx::query_as(&query)
            .bind(dev_eui)
            .bind(multicast_group_id)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn get_remote_multicast_class_c_session_by_group_id(
        &mut self,
        dev_eui: Eui64,
        mc_group_id: i32,
        for_update: bool,
    ) -> Result<RemoteMulticastClassCSession, StorageError> {
        let query = lock_clause(
            "select * from remote_multicast_class_c_session where dev_eui = $1 and mc_group_id = $2",
            for_update,
        );
        Ok(sqlx::query_as(&query)
            .bind(dev_eui)
            .bind(mc_group_id)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn update_remote_multicast_class_c_session(
        &mut self,
        session: &mut RemoteMulticastClassCSession,
    ) -> Result<(), StorageError> {
        session.updated_at = Utc::now();
        let result = sqlx::query(
            "update remote_multicast_class_c_session set
                updated_at = $3, mc_group_id = $4, session_time = $5, session_time_out = $6,
                dl_frequency = $7, dr = $8, state_provisioned = $9, retry_after = $10,
                retry_count = $11, retry_interval_secs = $12
            where dev_eui = $1 and multicast_group_id = $2",
        )
        .bind(session.dev_eui)
        .bind(session.multicast_group_id)
        .bind(session.updated_at)
        .bind(session.mc_group_id)
        .bind(session.session_time)
        .bind(session.session_time_out)
        .bind(session.dl_frequency)
        .bind(session.dr)
        .bind(session.state_provisioned)
        .bind(session.retry_after)
        .bind(session.retry_count)
        .bind(session.retry_interval_secs)
        .execute(&mut self.tx)
        .await?;
        expect_affected(&result)
    }

    async fn get_pending_remote_multicast_class_c_sessions(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteMulticastClassCSession>, StorageError> {
        Ok(sqlx::query_as(
            "select *
            from remote_multicast_class_c_session
            where
                state_provisioned = false
                and retry_count < $1
                and retry_after < $2
            order by retry_after
            limit $3
            for update skip locked",
        )
        .bind(max_retry_count)
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&mut self.tx)
        .await?)
    }
}

#[async_trait]
impl RemoteFragmentationSessionStore for PgTransaction {
    async fn create_remote_fragmentation_session(
        &mut self,
        session: &mut RemoteFragmentationSession,
    ) -> Result<(), StorageError> {
        session.validate()?;
        let now = Utc::now();
        session.created_at = now;
        session.updated_at = now;
        sqlx::query(
            "insert into remote_fragmentation_session (
                dev_eui, frag_index, created_at, updated_at, mc_group_ids, nb_frag, frag_size,
                fragmentation_matrix, block_ack_delay, padding, descriptor, state,
                state_provisioned, retry_after, retry_count, retry_interval_secs
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(session.dev_eui)
        .bind(session.frag_index)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(&session.mc_group_ids)
        .bind(session.nb_frag)
        .bind(session.frag_size)
        .bind(session.fragmentation_matrix)
        .bind(session.block_ack_delay)
        .bind(session.padding)
        .bind(session.descriptor)
        .bind(session.state)
        .bind(session.state_provisioned)
        .bind(session.retry_after)
        .bind(session.retry_count)
        .bind(session.retry_interval_secs)
        .execute(&mut self.tx)
        .await?;
        info!(dev_eui = %session.dev_eui, frag_index = session.frag_index, "remote fragmentation session created");
        Ok(())
    }

    async fn get_remote_fragmentation_session(
        &mut self,
        dev_eui: Eui64,
        frag_index: i32,
        for_update: bool,
    ) -> Result<RemoteFragmentationSession, StorageError> {
        let query = lock_clause(
            "select * from remote_fragmentation_session where dev_eui = $1 and frag_index = $2",
            for_update,
        );
        Ok(sqlx::query_as(&query)
            .bind(dev_eui)
            .bind(frag_index)
            .fetch_one(&mut self.tx)
            .await?)
    }

    async fn update_remote_fragmentation_session(
        &mut self,
        session: &mut RemoteFragmentationSession,
    ) -> Result<(), StorageError> {
        session.updated_at = Utc::now();
        let result = sqlx::query(
            "update remote_fragmentation_session set
                updated_at = $3, mc_group_ids = $4, nb_frag = $5, frag_size = $6,
                fragmentation_matrix = $7, block_ack_delay = $8, padding = $9, descriptor = $10,
                state = $11, state_provisioned = $12, retry_after = $13, retry_count = $14,
                retry_interval_secs = $15
            where dev_eui = $1 and frag_index = $2",
        )
        .bind(session.dev_eui)
        .bind(session.frag_index)
        .bind(session.updated_at)
        .bind(&session.mc_group_ids)
        .bind(session.nb_frag)
        .bind(session.frag_size)
        .bind(session.fragmentation_matrix)
        .bind(session.block_ack_delay)
        .bind(session.padding)
        .bind(session.descriptor)
        .bind(session.state)
        .bind(session.state_provisioned)
        .bind(session.retry_after)
        .bind(session.retry_count)
        .bind(session.retry_interval_secs)
        .execute(&mut self.tx)
        .await?;
        expect_affected(&result)
    }

    async fn get_pending_remote_fragmentation_sessions(
        &mut self,
        limit: i64,
        max_retry_count: i32,
    ) -> Result<Vec<RemoteFragmentationSession>, StorageError> {
        Ok(sqlx::query_as(
            "select fs.*
            from remote_fragmentation_session fs
            where
                fs.state_provisioned = false
                and fs.retry_count < $1
                and fs.retry_after < $2
                and (
                    array_length(fs.mc_group_ids, 1) is null
                    or exists (
                        select 1
                        from remote_multicast_setup ms
                        where
                            ms.dev_eui = fs.dev_eui
                            and ms.state_provisioned = true
                            and ms.mc_group_id = any(fs.mc_group_ids)
                    )
                )
            order by fs.retry_after
            limit $3
            for update of fs skip locked",
        )
        .bind(max_retry_count)
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&mut self.tx)
        .await?)
    }
}

#[async_trait]
impl FuotaDeploymentStore for PgTransaction {
    async fn get_pending_fuota_deployment_device(
        &mut self,
        dev_eui: Eui64,
    ) -> Result<FuotaDeploymentDevice, StorageError> {
        Ok(sqlx::query_as(
            "select *
            from fuota_deployment_device
            where dev_eui = $1 and state = 'pending'
            order by created_at desc
            limit 1
            for update",
        )
        .bind(dev_eui)
        .fetch_one(&mut self.tx)
        .await?)
    }

    async fn get_fuota_deployment_device(
        &mut self,
        fuota_deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<FuotaDeploymentDevice, StorageError> {
        Ok(sqlx::query_as(
            "select * from fuota_deployment_device where fuota_deployment_id = $1 and dev_eui = $2",
        )
        .bind(fuota_deployment_id)
        .bind(dev_eui)
        .fetch_one(&mut self.tx)
        .await?)
    }

    async fn update_fuota_deployment_device(
        &mut self,
        device: &mut FuotaDeploymentDevice,
    ) -> Result<(), StorageError> {
        device.updated_at = Utc::now();
        let result = sqlx::query(
            "update fuota_deployment_device set
                updated_at = $3, state = $4, error_message = $5
            where fuota_deployment_id = $1 and dev_eui = $2",
        )
        .bind(device.fuota_deployment_id)
        .bind(device.dev_eui)
        .bind(device.updated_at)
        .bind(device.state)
        .bind(&device.error_message)
        .execute(&mut self.tx)
        .await?;
        expect_affected(&result)?;
        info!(
            dev_eui = %device.dev_eui,
            fuota_deployment_id = %device.fuota_deployment_id,
            state = %device.state,
            "fuota deployment device updated"
        );
        Ok(())
    }
}

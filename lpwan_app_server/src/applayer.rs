//! LoRaWAN application layer packages: remote multicast setup (TS005) and fragmented data
//! block transport (TS004).
//!
//! Both packages keep the desired device state in the store and synchronise it with periodic
//! loops. Every request is retried until the device answers or the retries are exhausted.

pub mod fragmentation;
pub mod multicastsetup;

use crate::error::ApplayerError;
use crate::lorawan::Eui64;
use crate::storage::{Store, Transaction};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lpwan_grpc_clients::network_server::NetworkServerClient;
use std::fmt;

/// Enqueues application payloads for a device at the network server.
#[async_trait]
pub trait DownlinkEnqueuer: Send + Sync + fmt::Debug {
    /// Enqueues `data` on `f_port`.
    async fn enqueue(
        &self,
        dev_eui: Eui64,
        f_port: u8,
        confirmed: bool,
        data: Vec<u8>,
    ) -> Result<(), lpwan_grpc_clients::error::Error>;
}

#[async_trait]
impl DownlinkEnqueuer for NetworkServerClient {
    async fn enqueue(
        &self,
        dev_eui: Eui64,
        f_port: u8,
        confirmed: bool,
        data: Vec<u8>,
    ) -> Result<(), lpwan_grpc_clients::error::Error> {
        NetworkServerClient::enqueue(self, &dev_eui.to_string(), u32::from(f_port), confirmed, data)
            .await
            .map(|_| ())
    }
}

/// Earliest time of the next attempt of a request sent now.
pub(crate) fn next_retry_after(retry_interval_secs: i64) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(retry_interval_secs)
}

/// Converts a stored slot or counter into a command field.
pub(crate) fn field<T: TryFrom<i64>>(field: &'static str, value: i64) -> Result<T, ApplayerError> {
    T::try_from(value).map_err(|_| ApplayerError::OutOfRange { field, value })
}

/// Runs `work` in a transaction which is committed on success and rolled back on error.
///
/// The closure gets the transaction and returns it with its result, so that no borrow crosses
/// the await points of the caller.
pub(crate) async fn in_transaction<F, Fut, T>(
    store: &dyn Store,
    work: F,
) -> Result<T, ApplayerError>
where
    F: FnOnce(Box<dyn Transaction>) -> Fut,
    Fut: std::future::Future<Output = (Box<dyn Transaction>, Result<T, ApplayerError>)>,
{
    let tx = store.begin().await?;
    let (tx, result) = work(tx).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tx.rollback().await?;
            Err(err)
        }
    }
}

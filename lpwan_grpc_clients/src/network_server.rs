//! Client for the ChirpStack network server API.

use crate::error::Error;
use crate::pool::{ChannelPool, TlsMaterial};
use tonic::metadata::MetadataValue;
use tonic::Request;
use tracing::trace;

/// Connection parameters of the network server API and the pool the channels come from.
#[derive(Debug, Clone)]
pub struct NetworkServerClient {
    /// Channel pool shared with other clients.
    pool: ChannelPool,
    /// Server address, `host:port` or a full URI.
    server: String,
    /// API token sent as bearer token.
    api_token: String,
    /// Certificates for the channel.
    tls: TlsMaterial,
}

impl NetworkServerClient {
    /// Creates a new client. No connection is made until the first request.
    #[must_use]
    pub fn new(pool: ChannelPool, server: String, api_token: String, tls: TlsMaterial) -> Self {
        Self {
            pool,
            server,
            api_token,
            tls,
        }
    }

    /// Enqueues a downlink payload for the device with `dev_eui` (hex encoded) on `f_port`.
    ///
    /// Returns the ID of the queue item.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no channel to the server could be created.
    /// - the bearer token could not be parsed as [`MetadataValue`].
    /// - the enqueue request failed.
    pub async fn enqueue(
        &self,
        dev_eui: &str,
        f_port: u32,
        confirmed: bool,
        data: Vec<u8>,
    ) -> Result<String, Error> {
        trace!("Getting channel");
        let channel = self.pool.get(&self.server, &self.tls).await?;

        trace!("Parsing token");
        let token: MetadataValue<_> = format!("Bearer {}", self.api_token).parse()?;

        trace!("Creating client");
        let mut client =
            chirpstack_api::api::device_service_client::DeviceServiceClient::with_interceptor(
                channel,
                move |mut req: Request<()>| {
                    req.metadata_mut().insert("authorization", token.clone());
                    Ok(req)
                },
            );

        trace!("Creating request");
        let request = chirpstack_api::api::EnqueueDeviceQueueItemRequest {
            queue_item: Some(chirpstack_api::api::DeviceQueueItem {
                dev_eui: dev_eui.to_owned(),
                confirmed,
                f_port,
                data,
                ..Default::default()
            }),
        };

        trace!("Sending request");
        Ok(client.enqueue(request).await?.into_inner().id)
    }
}

//! A pool of gRPC channels keyed by hostname.
//!
//! Channels are created once per server and shared by every client talking to it. A cached
//! channel is only reused while the certificates it was created with are unchanged, otherwise it
//! is dropped and a new channel is created.

use crate::error::Error;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{info, trace, warn};

/// Default timeout for establishing a connection.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// PEM encoded certificates used to secure a channel. All fields empty means an insecure channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    /// CA certificate used to verify the server.
    pub ca_cert: String,
    /// Client certificate.
    pub tls_cert: String,
    /// Client key.
    pub tls_key: String,
}

impl TlsMaterial {
    /// Returns `true` if no certificate or key is set.
    #[must_use]
    pub fn is_insecure(&self) -> bool {
        self.ca_cert.is_empty() && self.tls_cert.is_empty() && self.tls_key.is_empty()
    }
}

/// A channel together with the TLS material it was created with.
#[derive(Debug)]
struct CachedChannel {
    /// The shared channel.
    channel: Channel,
    /// Certificates used when creating the channel.
    tls: TlsMaterial,
}

/// Thread safe cache of gRPC channels. Cloning the pool shares the cache.
#[derive(Debug, Clone)]
pub struct ChannelPool {
    /// Cached channels by hostname.
    channels: Arc<RwLock<HashMap<String, CachedChannel>>>,
    /// Timeout applied when the channel connects.
    connect_timeout: Duration,
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ChannelPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
        }
    }

    /// Returns the channel for `hostname`, creating it if needed.
    ///
    /// A cached channel created with different certificates is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the hostname can not be parsed as URI.
    /// - the TLS material is incomplete or invalid.
    pub async fn get(&self, hostname: &str, tls: &TlsMaterial) -> Result<Channel, Error> {
        if hostname.is_empty() {
            return Err(Error::NoServerConfigured);
        }

        if let Some(cached) = self.channels.read().await.get(hostname) {
            if &cached.tls == tls {
                trace!("Reusing channel to {hostname}");
                return Ok(cached.channel.clone());
            }
        }

        let mut channels = self.channels.write().await;
        // Another task may have connected while waiting for the write lock.
        match channels.get(hostname) {
            Some(cached) if &cached.tls == tls => return Ok(cached.channel.clone()),
            Some(_) => {
                trace!("Certificates for {hostname} changed, dropping cached channel");
                channels.remove(hostname);
            }
            None => {}
        }

        let channel = self.create_channel(hostname, tls)?;
        channels.insert(
            hostname.to_owned(),
            CachedChannel {
                channel: channel.clone(),
                tls: tls.clone(),
            },
        );
        Ok(channel)
    }

    /// Number of cached channels.
    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Returns `true` if no channel is cached.
    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    /// Builds the endpoint and a lazily connecting channel.
    fn create_channel(&self, hostname: &str, tls: &TlsMaterial) -> Result<Channel, Error> {
        let uri = if hostname.contains("://") {
            hostname.to_owned()
        } else if tls.is_insecure() {
            format!("http://{hostname}")
        } else {
            format!("https://{hostname}")
        };

        trace!("Creating endpoint {uri}");
        let mut endpoint = Endpoint::from_shared(uri)?.connect_timeout(self.connect_timeout);

        if tls.is_insecure() {
            warn!(server = hostname, "Creating insecure gRPC channel");
        } else {
            info!(server = hostname, "Creating TLS secured gRPC channel");
            endpoint = endpoint.tls_config(client_tls_config(tls)?)?;
        }

        Ok(endpoint.connect_lazy())
    }
}

/// Builds the client TLS config from PEM material.
fn client_tls_config(tls: &TlsMaterial) -> Result<ClientTlsConfig, Error> {
    let mut config = ClientTlsConfig::new();
    if !tls.ca_cert.is_empty() {
        config = config.ca_certificate(Certificate::from_pem(&tls.ca_cert));
    }
    match (tls.tls_cert.is_empty(), tls.tls_key.is_empty()) {
        (false, false) => {
            config = config.identity(Identity::from_pem(&tls.tls_cert, &tls.tls_key));
        }
        (true, false) => return Err(Error::IncompleteTls { missing: "tls_cert" }),
        (false, true) => return Err(Error::IncompleteTls { missing: "tls_key" }),
        (true, true) => {}
    }
    Ok(config)
}

//! Client for the m2m billing server.
//!
//! The m2m server exposes its services over gRPC. Only the calls the application server makes are
//! modelled here: distributing bonuses and reading wallet balances.

use crate::error::Error;
use crate::pool::{ChannelPool, TlsMaterial};
use http::uri::PathAndQuery;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;
use tracing::trace;

/// Path of the `AddBonus` call.
const ADD_BONUS_PATH: &str = "/m2m_serves_appserver.DistributeBonusService/AddBonus";
/// Path of the `GetWalletBalance` call.
const GET_WALLET_BALANCE_PATH: &str = "/m2m_ui.WalletService/GetWalletBalance";

/// Request to credit a bonus to an organization's wallet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddBonusRequest {
    /// Organization receiving the bonus.
    #[prost(int64, tag = "1")]
    pub org_id: i64,
    /// Currency of the bonus, e.g. `ETH_MXC`.
    #[prost(string, tag = "2")]
    pub currency: ::prost::alloc::string::String,
    /// Value of the bonus in USD, decimal string.
    #[prost(string, tag = "3")]
    pub amount_usd: ::prost::alloc::string::String,
    /// Shown to the user.
    #[prost(string, tag = "4")]
    pub description: ::prost::alloc::string::String,
    /// Reference used by the billing server to deduplicate requests.
    #[prost(string, tag = "5")]
    pub external_ref: ::prost::alloc::string::String,
}

/// Response to [`AddBonusRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddBonusResponse {
    /// ID of the created bonus.
    #[prost(int64, tag = "1")]
    pub bonus_id: i64,
}

/// Request for a wallet balance.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWalletBalanceRequest {
    /// User asking for the balance.
    #[prost(int64, tag = "1")]
    pub user_id: i64,
    /// Organization owning the wallet.
    #[prost(int64, tag = "2")]
    pub org_id: i64,
}

/// Response to [`GetWalletBalanceRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetWalletBalanceResponse {
    /// Balance of the wallet.
    #[prost(double, tag = "1")]
    pub balance: f64,
}

/// Client for the m2m server services.
#[derive(Debug, Clone)]
pub struct M2mClient {
    /// Channel pool shared with other clients.
    pool: ChannelPool,
    /// Server address, `host:port` or a full URI.
    server: String,
    /// Certificates for the channel.
    tls: TlsMaterial,
}

impl M2mClient {
    /// Creates a new client. No connection is made until the first request.
    #[must_use]
    pub fn new(pool: ChannelPool, server: String, tls: TlsMaterial) -> Self {
        Self { pool, server, tls }
    }

    /// Credits a bonus to an organization.
    ///
    /// # Errors
    ///
    /// Returns an error if no channel could be created or the call failed.
    pub async fn add_bonus(&self, request: AddBonusRequest) -> Result<AddBonusResponse, Error> {
        trace!("Sending AddBonus for org {}", request.org_id);
        self.unary(request, ADD_BONUS_PATH).await
    }

    /// Reads the wallet balance of an organization.
    ///
    /// # Errors
    ///
    /// Returns an error if no channel could be created or the call failed.
    pub async fn get_wallet_balance(&self, user_id: i64, org_id: i64) -> Result<f64, Error> {
        trace!("Sending GetWalletBalance for org {org_id}");
        let response: GetWalletBalanceResponse = self
            .unary(
                GetWalletBalanceRequest { user_id, org_id },
                GET_WALLET_BALANCE_PATH,
            )
            .await?;
        Ok(response.balance)
    }

    /// Performs a unary call with prost encoded messages.
    async fn unary<Req, Resp>(&self, request: Req, path: &'static str) -> Result<Resp, Error>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let channel = self.pool.get(&self.server, &self.tls).await?;
        let mut grpc = tonic::client::Grpc::<Channel>::new(channel);
        grpc.ready().await.map_err(|err| {
            tonic::Status::unavailable(format!("Service was not ready: {err}"))
        })?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await?;
        Ok(response.into_inner())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn add_bonus_request_wire_format() {
        let request = AddBonusRequest {
            org_id: 7,
            currency: "DHX".to_owned(),
            amount_usd: "1.5".to_owned(),
            description: "welcome".to_owned(),
            external_ref: "airdrop-3".to_owned(),
        };
        let encoded = request.encode_to_vec();
        // field 1, varint
        assert_eq!(&encoded[..2], &[0x08, 0x07]);
        // field 2, length delimited
        assert_eq!(&encoded[2..4], &[0x12, 0x03]);
        assert_eq!(AddBonusRequest::decode(encoded.as_slice()).unwrap(), request);
    }
}

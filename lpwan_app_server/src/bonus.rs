//! Airdrop bonus distribution.
//!
//! Airdrops are listed by an external backend. Each airdrop is paid out as a bonus through the
//! m2m server and its outcome is reported back to the backend.

use crate::configuration::BonusConfig;
use crate::error::BonusError;
use crate::graceful_shutdown::ShutdownAgent;
use crate::storage::Store;
use async_trait::async_trait;
use chrono::Utc;
use lpwan_grpc_clients::m2m::{AddBonusRequest, M2mClient};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, trace};

/// Books bonuses on organization wallets.
#[async_trait]
pub trait BonusClient: Send + Sync + fmt::Debug {
    /// Books the bonus described by `request`.
    async fn add_bonus(&self, request: AddBonusRequest)
        -> Result<(), lpwan_grpc_clients::error::Error>;
}

#[async_trait]
impl BonusClient for M2mClient {
    async fn add_bonus(
        &self,
        request: AddBonusRequest,
    ) -> Result<(), lpwan_grpc_clients::error::Error> {
        M2mClient::add_bonus(self, request).await.map(|_| ())
    }
}

/// Login request of the backend.
#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    /// User name.
    identifier: &'a str,
    /// Password.
    password: &'a str,
}

/// Login response of the backend.
#[derive(Debug, Deserialize)]
struct AuthResponse {
    /// Session token.
    #[serde(default)]
    jwt: String,
}

/// An airdrop listed by the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Airdrop {
    /// ID.
    pub id: i64,
    /// Email of the receiving user.
    #[serde(default)]
    pub email: String,
    /// Supernode the airdrop is paid on.
    #[serde(default)]
    pub supernode: String,
    /// Token name, e.g. `mxc`.
    #[serde(default)]
    pub token: String,
    /// Amount in USD.
    #[serde(default)]
    pub amount: f64,
    /// Description of the bonus.
    #[serde(default)]
    pub purpose: String,
    /// Whether it was paid already.
    #[serde(default)]
    pub distributed: bool,
    /// Error of a previous attempt.
    #[serde(default)]
    pub error: String,
}

/// Outcome reported to the backend.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AirdropUpdate {
    /// The bonus could not be paid.
    Error {
        /// Reason.
        error: String,
    },
    /// The bonus was paid.
    Distributed {
        /// Always `true`.
        distributed: bool,
    },
}

/// Maps an airdrop token to the wallet currency.
fn map_token(token: &str) -> Result<&'static str, BonusError> {
    match token {
        "mxc" => Ok("ETH_MXC"),
        "btc" => Ok("BTC"),
        "dhx" => Ok("DHX"),
        token => Err(BonusError::UnknownToken {
            token: token.to_owned(),
        }),
    }
}

/// Formats an amount with the shortest representation, switching to the exponent form with a
/// signed exponent of at least two digits below 1e-4 and from 1e6 on.
fn format_amount(amount: f64) -> String {
    if amount.is_nan() {
        return "NaN".to_owned();
    }
    if amount.is_infinite() {
        return if amount > 0.0 { "+Inf" } else { "-Inf" }.to_owned();
    }
    let scientific = format!("{amount:e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return amount.to_string();
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return amount.to_string();
    };
    if (-4..6).contains(&exponent) {
        amount.to_string()
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

/// Pays airdrops listed by the backend.
#[derive(Debug)]
pub struct BonusDistributor {
    /// HTTP client of the backend.
    http: reqwest::Client,
    /// Backend access.
    config: BonusConfig,
    /// Store used to resolve organizations.
    store: Arc<dyn Store>,
    /// Client booking the bonuses.
    bonus_client: Arc<dyn BonusClient>,
}

impl BonusDistributor {
    /// Creates a new [`BonusDistributor`].
    #[must_use]
    pub fn new(config: BonusConfig, store: Arc<dyn Store>, bonus_client: Arc<dyn BonusClient>) -> Self {
        BonusDistributor {
            http: reqwest::Client::new(),
            config,
            store,
            bonus_client,
        }
    }

    /// Logs in and returns the session token.
    async fn authenticate(&self) -> Result<String, BonusError> {
        trace!("Authenticating at bonus backend");
        let response: AuthResponse = self
            .http
            .post(format!("{}/auth/local", self.config.url))
            .json(&AuthRequest {
                identifier: &self.config.user,
                password: &self.config.password,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.jwt.is_empty() {
            return Err(BonusError::EmptyJwt);
        }
        Ok(response.jwt)
    }

    /// Lists the undistributed airdrops of the supernode.
    async fn list_airdrops(&self, jwt: &str) -> Result<Vec<Airdrop>, BonusError> {
        Ok(self
            .http
            .get(format!("{}/airdrops", self.config.url))
            .query(&[
                ("supernode", self.config.supernode_id.as_str()),
                ("distributed", "false"),
                ("error", ""),
            ])
            .bearer_auth(jwt)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Reports the outcome of an airdrop.
    async fn update_airdrop(
        &self,
        jwt: &str,
        airdrop_id: i64,
        update: &AirdropUpdate,
    ) -> Result<(), BonusError> {
        self.http
            .put(format!("{}/airdrops/{airdrop_id}", self.config.url))
            .bearer_auth(jwt)
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Resolves the organization of the airdrop's user.
    async fn bonus_org_id(&self, email: &str) -> Result<i64, BonusError> {
        let mut tx = self.store.begin().await?;
        let org_id = tx.get_user_bonus_org_id(email).await;
        tx.rollback().await?;
        Ok(org_id?)
    }

    /// Books the bonus of one airdrop.
    async fn pay(&self, org_id: i64, airdrop: &Airdrop) -> Result<(), BonusError> {
        let currency = map_token(&airdrop.token)?;
        self.bonus_client
            .add_bonus(AddBonusRequest {
                org_id,
                currency: currency.to_owned(),
                amount_usd: format_amount(airdrop.amount),
                description: airdrop.purpose.clone(),
                external_ref: format!("airdrop-{}", airdrop.id),
            })
            .await?;
        Ok(())
    }

    /// Pays all listed airdrops and reports the outcome of each of them.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend can not be reached or the store fails. Errors of single
    /// airdrops are reported to the backend instead.
    pub async fn process_airdrops(&self) -> Result<(), BonusError> {
        let jwt = self.authenticate().await?;
        let airdrops = self.list_airdrops(&jwt).await?;
        for airdrop in airdrops {
            let org_id = self.bonus_org_id(&airdrop.email).await?;
            let result = if org_id == 0 {
                Err(BonusError::NoOrganization)
            } else {
                self.pay(org_id, &airdrop).await
            };

            let update = match result {
                Ok(()) => {
                    info!(id = airdrop.id, "successfully distributed airdrop");
                    AirdropUpdate::Distributed { distributed: true }
                }
                Err(err) => {
                    info!(id = airdrop.id, %err, "failed to pay airdrop");
                    AirdropUpdate::Error {
                        error: err.to_string(),
                    }
                }
            };
            if let Err(err) = self.update_airdrop(&jwt, airdrop.id, &update).await {
                error!(%err, "failed to update airdrop status upstream");
            }
        }
        Ok(())
    }
}

/// Time until the next multiple of `interval_secs` since the epoch.
fn until_next_boundary(interval_secs: u64) -> std::time::Duration {
    let interval_ms = interval_secs.max(1).saturating_mul(1000);
    let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    std::time::Duration::from_millis(interval_ms - now_ms % interval_ms)
}

/// Processes the airdrops on every `check_interval_sec` boundary until shut down.
#[tracing::instrument(skip_all)]
pub async fn bonus_distributor_task(distributor: BonusDistributor, mut shutdown_agent: ShutdownAgent) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(until_next_boundary(distributor.config.check_interval_sec)) => {
                if let Err(err) = distributor.process_airdrops().await {
                    error!(%err, "failed to process airdrops");
                }
            }
            _ = shutdown_agent.await_shutdown() => {
                trace!("Shutting down bonus distributor");
                return;
            }
        }
    }
}

//! Solana
//!
//! Reads the prices currently stored on Solana by the Pyth push oracle. Every
//! feed lives in a `PriceUpdateV2` account at an address derived from the shard
//! id and the feed id, so no lookup is needed to find it.

use {
    super::{
        cache::PriceCache,
        listener::{
            self,
            PriceSource,
        },
        price::{
            PriceId,
            PriceInfo,
            UnixTimestamp,
        },
        utils::rpc_multi_client::RpcMultiClient,
    },
    anyhow::{
        Context,
        Result,
    },
    borsh::BorshDeserialize,
    futures::{
        StreamExt,
        stream::select_all,
    },
    serde::{
        Deserialize,
        Deserializer,
        Serialize,
        Serializer,
    },
    solana_account_decoder::UiAccountEncoding,
    solana_client::{
        nonblocking::pubsub_client::PubsubClient,
        rpc_config::RpcAccountInfoConfig,
    },
    solana_sdk::{
        account::Account,
        commitment_config::{
            CommitmentConfig,
            CommitmentLevel,
        },
        pubkey::Pubkey,
    },
    std::{
        collections::HashMap,
        str::FromStr,
        sync::Arc,
        time::Duration,
    },
    thiserror::Error,
    tokio::task::JoinHandle,
    tracing::instrument,
    url::Url,
};

/// Program that owns the sponsored price feed accounts on mainnet and devnet.
pub const DEFAULT_PUSH_ORACLE_PROGRAM: &str = "pythWSnswVUd12oZpeFP8e9CVaEqJg25g1Vtc2biRsT";

/// A finalized block older than this means the RPC node is falling behind.
const HEALTH_CHECK_MAX_LAG: Duration = Duration::from_secs(60);

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    /// RPC endpoints, tried in order.
    pub rpc_urls:                       Vec<Url>,
    /// Websocket endpoint used for account subscriptions.
    pub wss_url:                        Url,
    /// Timeout for the requests to the RPC.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout:                    Duration,
    /// Commitment level used to read account data.
    pub commitment:                     CommitmentLevel,
    /// Shard of the price feed accounts to read.
    pub shard_id:                       u16,
    #[serde(
        serialize_with = "serialize_pubkey",
        deserialize_with = "deserialize_pubkey"
    )]
    pub push_oracle_program_key:        Pubkey,
    #[serde(with = "humantime_serde")]
    pub health_check_interval_duration: Duration,
    /// Polling and subscription settings of the target listener.
    pub listener:                       listener::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_urls:                       vec![
                Url::parse("http://localhost:8899")
                    .expect("INTERNAL: Could not build default RPC URL"),
            ],
            wss_url:                        Url::parse("ws://localhost:8900")
                .expect("INTERNAL: Could not build default websocket URL"),
            rpc_timeout:                    Duration::from_secs(10),
            commitment:                     CommitmentLevel::Confirmed,
            shard_id:                       0,
            push_oracle_program_key:        Pubkey::from_str(DEFAULT_PUSH_ORACLE_PROGRAM)
                .expect("INTERNAL: Could not parse default push oracle program"),
            health_check_interval_duration: Duration::from_secs(5),
            listener:                       listener::Config::default(),
        }
    }
}

fn serialize_pubkey<S: Serializer>(pubkey: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(pubkey)
}

fn deserialize_pubkey<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
    let s = <String as Deserialize>::deserialize(deserializer)?;
    Pubkey::from_str(&s).map_err(serde::de::Error::custom)
}

/// Address of the account holding `price_id` in `shard_id`.
pub fn price_feed_address(program: &Pubkey, shard_id: u16, price_id: &PriceId) -> Pubkey {
    Pubkey::find_program_address(&[&shard_id.to_le_bytes(), price_id.as_bytes()], program).0
}

/// Anchor discriminator of `PriceUpdateV2`, the first 8 bytes of
/// `sha256("account:PriceUpdateV2")`.
pub const PRICE_UPDATE_V2_DISCRIMINATOR: [u8; 8] = [34, 241, 35, 99, 157, 126, 244, 205];

#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize)]
pub enum VerificationLevel {
    Partial { num_signatures: u8 },
    Full,
}

/// The subset of the on-chain price account the pusher needs.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize)]
pub struct PriceUpdateAccount {
    pub write_authority:    Pubkey,
    pub verification_level: VerificationLevel,
    pub feed_id:            PriceId,
    pub price:              i64,
    pub conf:               u64,
    pub exponent:           i32,
    pub publish_time:       UnixTimestamp,
    pub prev_publish_time:  UnixTimestamp,
    pub ema_price:          i64,
    pub ema_conf:           u64,
    pub posted_slot:        u64,
}

impl From<&PriceUpdateAccount> for PriceInfo {
    fn from(account: &PriceUpdateAccount) -> Self {
        PriceInfo {
            price:        account.price,
            conf:         account.conf,
            publish_time: account.publish_time,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountDecodeError {
    #[error("account is not a price update account")]
    Discriminator,
    #[error("malformed price update account: {0}")]
    Layout(String),
}

impl PriceUpdateAccount {
    /// Decodes a `PriceUpdateV2` account. Trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, AccountDecodeError> {
        let Some((discriminator, mut rest)) = data.split_first_chunk::<8>() else {
            return Err(AccountDecodeError::Discriminator);
        };
        if *discriminator != PRICE_UPDATE_V2_DISCRIMINATOR {
            return Err(AccountDecodeError::Discriminator);
        }
        BorshDeserialize::deserialize(&mut rest)
            .map_err(|err| AccountDecodeError::Layout(err.to_string()))
    }
}

/// Decodes the account expected to hold `price_id`, logging why it cannot be used.
fn price_info_from_account(price_id: &PriceId, data: &[u8]) -> Option<PriceInfo> {
    match PriceUpdateAccount::decode(data) {
        Ok(account) if account.feed_id == *price_id => Some(PriceInfo::from(&account)),
        Ok(account) => {
            tracing::warn!(
                price_id = %price_id,
                feed_id = %account.feed_id,
                "Price account holds a different feed than expected.",
            );
            None
        }
        Err(err) => {
            tracing::warn!(price_id = %price_id, err = %err, "Could not decode price account.");
            None
        }
    }
}

/// The on-chain side of the comparison on Solana.
pub struct SolanaSource {
    rpc:        Arc<RpcMultiClient>,
    wss_url:    Url,
    commitment: CommitmentLevel,
    shard_id:   u16,
    program:    Pubkey,
}

impl SolanaSource {
    pub fn new(config: &Config) -> Self {
        SolanaSource {
            rpc:        Arc::new(RpcMultiClient::new_with_timeout_and_commitment(
                config.rpc_urls.clone(),
                config.rpc_timeout,
                CommitmentConfig {
                    commitment: config.commitment,
                },
            )),
            wss_url:    config.wss_url.clone(),
            commitment: config.commitment,
            shard_id:   config.shard_id,
            program:    config.push_oracle_program_key,
        }
    }

    pub fn price_feed_address(&self, price_id: &PriceId) -> Pubkey {
        price_feed_address(&self.program, self.shard_id, price_id)
    }

    /// Spawns a task that periodically checks that the RPC follows the chain.
    pub fn health_checker(&self, interval: Duration) -> JoinHandle<()> {
        let rpc = self.rpc.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            let mut exit = crate::pusher::EXIT.subscribe();
            loop {
                tokio::select! {
                    _ = exit.changed() => {
                        tracing::info!("Shutdown signal received.");
                        return;
                    }
                    _ = tick.tick() => {
                        if let Err(err) = check_health(&rpc).await {
                            tracing::error!(err = ?err, "Solana health check failed.");
                        }
                    }
                }
            }
        })
    }
}

#[instrument(skip(rpc))]
async fn check_health(rpc: &RpcMultiClient) -> Result<()> {
    let slot = rpc
        .get_slot_with_commitment(CommitmentConfig::finalized())
        .await?;
    let block_time = rpc.get_block_time(slot).await?;
    let lag = chrono::Utc::now().timestamp().saturating_sub(block_time);
    if lag > i64::try_from(HEALTH_CHECK_MAX_LAG.as_secs()).unwrap_or(i64::MAX) {
        tracing::warn!(slot, lag_seconds = lag, "Solana connection is behind.");
    }
    Ok(())
}

#[async_trait::async_trait]
impl PriceSource for SolanaSource {
    async fn read_prices(&self, price_ids: &[PriceId]) -> Result<HashMap<PriceId, PriceInfo>> {
        let addresses: Vec<Pubkey> = price_ids
            .iter()
            .map(|price_id| self.price_feed_address(price_id))
            .collect();
        let accounts = self.rpc.get_multiple_accounts(&addresses).await?;

        Ok(price_ids
            .iter()
            .zip(accounts)
            .filter_map(|(price_id, account)| {
                let account = account?;
                price_info_from_account(price_id, &account.data).map(|info| (*price_id, info))
            })
            .collect())
    }

    #[instrument(skip(self, price_ids, cache), fields(price_ids = price_ids.len()))]
    async fn subscribe(&self, price_ids: &[PriceId], cache: &PriceCache) -> Result<()> {
        let client = PubsubClient::new(self.wss_url.as_str())
            .await
            .with_context(|| format!("could not connect to {}", self.wss_url))?;

        let mut streams = Vec::with_capacity(price_ids.len());
        let mut _unsubscribes = Vec::with_capacity(price_ids.len());
        for price_id in price_ids {
            let price_id = *price_id;
            let (stream, unsubscribe) = client
                .account_subscribe(
                    &self.price_feed_address(&price_id),
                    Some(RpcAccountInfoConfig {
                        commitment: Some(CommitmentConfig {
                            commitment: self.commitment,
                        }),
                        encoding: Some(UiAccountEncoding::Base64),
                        ..Default::default()
                    }),
                )
                .await?;
            streams.push(stream.map(move |update| (price_id, update)));
            _unsubscribes.push(unsubscribe);
        }
        tracing::info!(wss_url = %self.wss_url, "Subscribed to price accounts.");

        let mut notifier = select_all(streams);
        while let Some((price_id, update)) = notifier.next().await {
            match update.value.decode::<Account>() {
                Some(account) => {
                    if let Some(price_info) = price_info_from_account(&price_id, &account.data) {
                        cache.update(price_id, price_info).await;
                    }
                }
                None => {
                    tracing::error!(
                        price_id = %price_id,
                        "Failed to decode account from update.",
                    );
                }
            }
        }

        tracing::debug!("Subscriber closed connection.");
        Ok(())
    }
}

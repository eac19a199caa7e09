//! Hermes
//!
//! Client for the Hermes price service, the trusted source of prices and of the
//! signed update payloads that are submitted to target chains. Also provides the
//! [`PriceSource`] the source listener is built on: REST polling of the latest
//! prices plus a websocket subscription to price updates.

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
        },
        price_config::PriceConfig,
    },
    anyhow::{
        Context,
        Result,
        anyhow,
        bail,
    },
    backoff::{
        ExponentialBackoff,
        future::retry,
    },
    base64::Engine,
    futures_util::{
        SinkExt,
        StreamExt,
    },
    serde::{
        Deserialize,
        Serialize,
        de::DeserializeOwned,
    },
    serde_this_or_that::{
        as_i64,
        as_u64,
    },
    std::{
        collections::{
            HashMap,
            HashSet,
        },
        time::Duration,
    },
    tokio_tungstenite::{
        connect_async,
        tungstenite::Message,
    },
    tracing::instrument,
    url::Url,
};

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    /// Base URL of the Hermes REST API.
    pub endpoint:                      Url,
    /// Websocket endpoint. Defaults to `<endpoint>/ws` with a ws(s) scheme.
    pub ws_endpoint:                   Option<Url>,
    /// Timeout of a single REST request.
    #[serde(with = "humantime_serde")]
    pub request_timeout:               Duration,
    /// Total time spent retrying a failing REST request before giving up.
    #[serde(with = "humantime_serde")]
    pub total_retry_timeout:           Duration,
    /// The subscription is considered dead if no message arrives for this long.
    #[serde(with = "humantime_serde")]
    pub subscription_progress_timeout: Duration,
    /// Polling and subscription settings of the source listener.
    pub listener:                      listener::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint:                      Url::parse("https://hermes.pyth.network/")
                .expect("INTERNAL: Could not build default Hermes endpoint"),
            ws_endpoint:                   None,
            request_timeout:               Duration::from_secs(10),
            total_retry_timeout:           Duration::from_secs(30),
            subscription_progress_timeout: Duration::from_secs(60),
            listener:                      listener::Config::default(),
        }
    }
}

/// Prices and update payload returned by a single latest price updates request.
#[derive(Debug, Default)]
pub struct PriceUpdates {
    /// Signed payloads to be submitted on-chain, decoded from base64.
    pub update_data: Vec<Vec<u8>>,
    pub prices:      HashMap<PriceId, PriceInfo>,
}

#[derive(Debug, Deserialize)]
struct LatestPriceUpdatesResponse {
    binary: BinaryUpdate,
    #[serde(default)]
    parsed: Vec<ParsedPriceUpdate>,
}

#[derive(Debug, Deserialize)]
struct BinaryUpdate {
    encoding: String,
    data:     Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ParsedPriceUpdate {
    id:    PriceId,
    price: RpcPrice,
}

#[derive(Debug, Deserialize)]
struct RpcPrice {
    #[serde(deserialize_with = "as_i64")]
    price:        i64,
    #[serde(deserialize_with = "as_u64")]
    conf:         u64,
    publish_time: i64,
}

impl From<RpcPrice> for PriceInfo {
    fn from(price: RpcPrice) -> Self {
        PriceInfo {
            price:        price.price,
            conf:         price.conf,
            publish_time: price.publish_time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PriceFeedMetadata {
    id: String,
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    ids:  &'a [PriceId],
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Response {
        status: String,
        #[serde(default)]
        error:  Option<String>,
    },
    PriceUpdate {
        price_feed: ParsedPriceUpdate,
    },
}

pub struct HermesClient {
    endpoint:            Url,
    ws_endpoint:         Url,
    client:              reqwest::Client,
    total_retry_timeout: Duration,
    progress_timeout:    Duration,
}

impl HermesClient {
    pub fn new(config: &Config) -> Result<Self> {
        let ws_endpoint = match &config.ws_endpoint {
            Some(ws_endpoint) => ws_endpoint.clone(),
            None => default_ws_endpoint(&config.endpoint)?,
        };

        Ok(HermesClient {
            endpoint: config.endpoint.clone(),
            ws_endpoint,
            client: reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()?,
            total_retry_timeout: config.total_retry_timeout,
            progress_timeout: config.subscription_progress_timeout,
        })
    }

    /// Fetches the latest prices of `price_ids` along with the signed update
    /// payload for exactly those feeds. Ids Hermes does not know are ignored.
    #[instrument(skip(self, price_ids), fields(price_ids = price_ids.len()))]
    pub async fn get_latest_price_updates(&self, price_ids: &[PriceId]) -> Result<PriceUpdates> {
        if price_ids.is_empty() {
            return Ok(PriceUpdates::default());
        }

        let mut url = self.endpoint.join("v2/updates/price/latest")?;
        {
            let mut query = url.query_pairs_mut();
            for price_id in price_ids {
                query.append_pair("ids[]", &price_id.to_string());
            }
            query
                .append_pair("encoding", "base64")
                .append_pair("parsed", "true")
                .append_pair("ignore_invalid_price_ids", "true");
        }

        let response: LatestPriceUpdatesResponse = self.get_json(url).await?;
        response.try_into()
    }

    /// Returns the ids of every feed Hermes serves.
    #[instrument(skip(self))]
    pub async fn get_price_feed_ids(&self) -> Result<HashSet<PriceId>> {
        let url = self.endpoint.join("v2/price_feeds")?;
        let feeds: Vec<PriceFeedMetadata> = self.get_json(url).await?;
        Ok(feeds
            .into_iter()
            .filter_map(|feed| match feed.id.parse() {
                Ok(price_id) => Some(price_id),
                Err(err) => {
                    tracing::debug!(err = %err, "Skipping unparsable feed id.");
                    None
                }
            })
            .collect())
    }

    /// Drops the configured feeds Hermes does not serve. If Hermes cannot be
    /// reached the configs are returned untouched.
    pub async fn retain_known_feeds(&self, price_configs: Vec<PriceConfig>) -> Vec<PriceConfig> {
        let known = match self.get_price_feed_ids().await {
            Ok(known) => known,
            Err(err) => {
                tracing::warn!(err = ?err, "Could not fetch the Hermes feed list, skipping feed validation.");
                return price_configs;
            }
        };

        let (existing, invalid): (Vec<_>, Vec<_>) = price_configs
            .into_iter()
            .partition(|price_config| known.contains(&price_config.id));

        if !invalid.is_empty() {
            tracing::error!(
                aliases = ?invalid.iter().map(|c| c.alias.as_str()).collect::<Vec<_>>(),
                "Invalid price id submitted, these feeds will not be pushed.",
            );
        }

        existing
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let client = &self.client;
        let request_url = &url;
        let response = retry(
            ExponentialBackoff {
                max_elapsed_time: Some(self.total_retry_timeout),
                ..ExponentialBackoff::default()
            },
            || async move {
                client
                    .get(request_url.clone())
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())
                    .map_err(|err| {
                        // A client error will not go away by retrying.
                        if err.status().is_some_and(|status| status.is_client_error()) {
                            backoff::Error::permanent(err)
                        } else {
                            tracing::warn!(err = ?err, "Request to Hermes failed, retrying.");
                            backoff::Error::transient(err)
                        }
                    })
            },
        )
        .await
        .with_context(|| format!("request to {} failed", url.path()))?;

        Ok(response.json::<T>().await?)
    }
}

impl TryFrom<LatestPriceUpdatesResponse> for PriceUpdates {
    type Error = anyhow::Error;

    fn try_from(response: LatestPriceUpdatesResponse) -> Result<Self> {
        if response.binary.encoding != "base64" {
            bail!("unexpected update data encoding {:?}", response.binary.encoding);
        }

        let update_data = response
            .binary
            .data
            .iter()
            .map(|data| base64::engine::general_purpose::STANDARD.decode(data))
            .collect::<Result<Vec<_>, _>>()
            .context("update data is not valid base64")?;

        Ok(PriceUpdates {
            update_data,
            prices: response
                .parsed
                .into_iter()
                .map(|update| (update.id, update.price.into()))
                .collect(),
        })
    }
}

fn default_ws_endpoint(endpoint: &Url) -> Result<Url> {
    let mut url = endpoint.join("ws")?;
    let scheme = if endpoint.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot derive a websocket endpoint from {endpoint}"))?;
    Ok(url)
}

/// The off-chain side of the comparison.
pub struct HermesSource {
    client: std::sync::Arc<HermesClient>,
}

impl HermesSource {
    pub fn new(client: std::sync::Arc<HermesClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PriceSource for HermesSource {
    async fn read_prices(&self, price_ids: &[PriceId]) -> Result<HashMap<PriceId, PriceInfo>> {
        Ok(self.client.get_latest_price_updates(price_ids).await?.prices)
    }

    #[instrument(skip(self, price_ids, cache), fields(price_ids = price_ids.len()))]
    async fn subscribe(&self, price_ids: &[PriceId], cache: &PriceCache) -> Result<()> {
        let (mut ws_stream, _) = connect_async(self.client.ws_endpoint.as_str())
            .await
            .with_context(|| format!("could not connect to {}", self.client.ws_endpoint))?;

        let request = serde_json::to_string(&SubscribeRequest {
            kind: "subscribe",
            ids:  price_ids,
        })?;
        ws_stream.send(Message::text(request)).await?;
        tracing::info!(endpoint = %self.client.ws_endpoint, "Subscribed to Hermes price updates.");

        loop {
            let message = tokio::time::timeout(self.client.progress_timeout, ws_stream.next())
                .await
                .map_err(|_| anyhow!("no message received for {:?}", self.client.progress_timeout))?;

            let text = match message {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Message::Text(text))) => text,
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
            };

            match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(ServerMessage::PriceUpdate { price_feed }) => {
                    cache.update(price_feed.id, price_feed.price.into()).await;
                }
                Ok(ServerMessage::Response { status, error }) => {
                    if status != "success" {
                        bail!("subscription rejected: {}", error.unwrap_or(status));
                    }
                }
                Err(err) => {
                    tracing::warn!(err = %err, payload = %text.as_str(), "Could not parse Hermes message.");
                }
            }
        }
    }
}

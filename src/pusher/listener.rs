//! Listener
//!
//! A listener keeps the latest observation of every tracked feed from one place,
//! either the off-chain source or a target chain. Each listener runs a poller that
//! reads all feeds on a fixed interval and, where the place supports it, a
//! subscriber that receives new values as they happen. Both write through the
//! same [`PriceCache`], so whichever delivers the freshest value wins.

use {
    super::{
        cache::PriceCache,
        price::{
            PriceId,
            PriceInfo,
        },
    },
    anyhow::Result,
    serde::{
        Deserialize,
        Serialize,
    },
    std::{
        collections::HashMap,
        sync::Arc,
        time::{
            Duration,
            Instant,
        },
    },
    tokio::task::JoinHandle,
    tracing::instrument,
};

/// Read access to the latest known price of each feed.
#[async_trait::async_trait]
pub trait PriceListener: Send + Sync {
    /// Returns `None` only if no observation was ever recorded for `price_id`.
    async fn get_latest_price_info(&self, price_id: &PriceId) -> Option<PriceInfo>;
}

/// A place prices can be read from.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync + 'static {
    /// Reads the current value of `price_ids`. Feeds that have no value are
    /// left out of the result. Implementations should skip individual feeds
    /// that fail rather than failing the whole read.
    async fn read_prices(&self, price_ids: &[PriceId]) -> Result<HashMap<PriceId, PriceInfo>>;

    /// Streams new values of `price_ids` into `cache` until the subscription
    /// ends. Returning `Ok(())` means the remote side closed the stream.
    async fn subscribe(&self, price_ids: &[PriceId], cache: &PriceCache) -> Result<()>;
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    /// Duration of the interval at which all feeds are polled.
    #[serde(with = "humantime_serde")]
    pub poll_interval_duration: Duration,
    /// Whether to run a subscription alongside polling.
    pub subscriber_enabled:     bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_duration: Duration::from_secs(5),
            subscriber_enabled:     true,
        }
    }
}

pub struct Listener<S> {
    config:  Config,
    source:  S,
    cache:   PriceCache,
    /// Aliases of the tracked feeds, for logging.
    aliases: HashMap<PriceId, String>,
}

impl<S> Listener<S>
where
    S: PriceSource,
{
    pub fn new(
        config: Config,
        source: S,
        cache: PriceCache,
        feeds: impl IntoIterator<Item = (PriceId, String)>,
    ) -> Self {
        Listener {
            config,
            source,
            cache,
            aliases: feeds.into_iter().collect(),
        }
    }

    pub fn price_ids(&self) -> Vec<PriceId> {
        self.aliases.keys().copied().collect()
    }

    /// Reads every tracked feed once and records the results. A failed read is
    /// logged and leaves the cache untouched.
    #[instrument(skip(self), fields(side = ?self.cache.side()))]
    pub async fn poll(&self) {
        let price_ids = self.price_ids();
        match self.source.read_prices(&price_ids).await {
            Ok(prices) => {
                tracing::debug!(
                    tracked = price_ids.len(),
                    observed = prices.len(),
                    "Polled prices.",
                );
                for (price_id, price_info) in prices {
                    if !self.aliases.contains_key(&price_id) {
                        tracing::warn!(price_id = %price_id, "Ignoring price for an untracked feed.");
                        continue;
                    }
                    self.cache.update(price_id, price_info).await;
                }
            }
            Err(err) => {
                tracing::error!(err = ?err, "Polling prices failed.");
            }
        }
    }
}

#[async_trait::async_trait]
impl<S> PriceListener for Listener<S>
where
    S: PriceSource,
{
    async fn get_latest_price_info(&self, price_id: &PriceId) -> Option<PriceInfo> {
        self.cache.get(price_id).await
    }
}

/// Spawns the poller and, if enabled, the subscriber of `listener`.
#[instrument(skip(listener), fields(side = ?listener.cache.side()))]
pub fn listener<S>(listener: Arc<Listener<S>>) -> Vec<JoinHandle<()>>
where
    S: PriceSource,
{
    let mut handles = Vec::new();

    handles.push(tokio::spawn(poller(listener.clone())));

    if listener.config.subscriber_enabled {
        handles.push(tokio::spawn(subscriber(listener)));
    } else {
        tracing::info!("Subscription disabled, listening for updates only via polling.");
    }

    handles
}

async fn poller<S>(listener: Arc<Listener<S>>)
where
    S: PriceSource,
{
    let mut tick = tokio::time::interval(listener.config.poll_interval_duration);
    let mut exit = crate::pusher::EXIT.subscribe();
    loop {
        tokio::select! {
            _ = exit.changed() => {
                tracing::info!("Shutdown signal received.");
                return;
            }
            _ = tick.tick() => {
                listener.poll().await;
            }
        }
    }
}

/// Keeps the subscription alive, restarting it whenever it ends.
async fn subscriber<S>(listener: Arc<Listener<S>>)
where
    S: PriceSource,
{
    let price_ids = listener.price_ids();
    let mut exit = crate::pusher::EXIT.subscribe();
    loop {
        let current_time = Instant::now();
        tokio::select! {
            _ = exit.changed() => {
                tracing::info!("Shutdown signal received.");
                return;
            }
            result = listener.source.subscribe(&price_ids, &listener.cache) => {
                match result {
                    Ok(()) => tracing::warn!("Subscription closed by remote, restarting."),
                    Err(err) => tracing::error!(err = ?err, "Subscriber exited unexpectedly."),
                }
                if current_time.elapsed() < Duration::from_secs(30) {
                    tracing::warn!("Subscriber restarting too quickly. Sleeping for 1 second.");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

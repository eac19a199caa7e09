use {
    super::{
        controller::Trigger,
        price::{
            PriceId,
            PriceInfo,
        },
    },
    lazy_static::lazy_static,
    prometheus_client::{
        encoding::{
            EncodeLabelSet,
            EncodeLabelValue,
        },
        metrics::{
            counter::Counter,
            family::Family,
            gauge::Gauge,
        },
        registry::Registry,
    },
    serde::Deserialize,
    std::net::SocketAddr,
    tokio::sync::{
        Mutex,
        watch,
    },
    warp::{
        Filter,
        Rejection,
        Reply,
        hyper::StatusCode,
        reply,
    },
};

pub fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled:      bool,
    pub bind_address: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled:      false,
            bind_address: default_bind_address(),
        }
    }
}

lazy_static! {
    pub static ref PROMETHEUS_REGISTRY: Mutex<Registry> =
        Mutex::new(Registry::with_prefix("price_pusher"));
}

/// Serves the global registry in the Prometheus text format at `/metrics` until
/// `exit` turns `true`.
pub async fn spawn_server(config: Config, exit: watch::Receiver<bool>) {
    let metrics_route = warp::path("metrics")
        .and(warp::path::end())
        .and_then(move || async move {
            let mut buf = String::new();
            let response = match prometheus_client::encoding::text::encode(
                &mut buf,
                &*PROMETHEUS_REGISTRY.lock().await,
            ) {
                Ok(()) => reply::with_status(buf, StatusCode::OK),
                Err(err) => {
                    tracing::error!(err = ?err, "Metrics: could not encode registry.");
                    reply::with_status(
                        "Could not encode metrics".to_string(),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    )
                }
            };
            Result::<Box<dyn Reply>, Rejection>::Ok(Box::new(response))
        });

    let (_, serve) = warp::serve(metrics_route)
        .bind_with_graceful_shutdown(config.bind_address, wait_for_exit(exit));

    tracing::info!(bind_address = %config.bind_address, "Starting metrics server.");
    serve.await
}

/// Resolves once `exit` is `true`, including when it already was.
async fn wait_for_exit(mut exit: watch::Receiver<bool>) {
    let _ = exit.wait_for(|exit| *exit).await;
}

/// Which side of the comparison an observation was made on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Side {
    Source,
    Target,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ObservationLabels {
    price_id: String,
    side:     Side,
}

/// Latest observations recorded by the listeners' caches.
#[derive(Clone, Default)]
pub struct ObservationMetrics {
    last_published_time: Family<ObservationLabels, Gauge>,
    price:               Family<ObservationLabels, Gauge>,
    conf:                Family<ObservationLabels, Gauge>,
    /// Observations dropped because the cache already held a fresher one
    stale_observations:  Family<ObservationLabels, Counter>,
}

impl ObservationMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "last_published_time",
            "Publish time of the latest observation of a price feed",
            metrics.last_published_time.clone(),
        );
        registry.register(
            "price",
            "Price of the latest observation of a price feed",
            metrics.price.clone(),
        );
        registry.register(
            "conf",
            "Confidence interval of the latest observation of a price feed",
            metrics.conf.clone(),
        );
        registry.register(
            "stale_observations",
            "Observations dropped because a fresher one was already cached",
            metrics.stale_observations.clone(),
        );

        metrics
    }

    pub fn update(&self, side: Side, price_id: &PriceId, price_info: &PriceInfo) {
        let labels = ObservationLabels {
            price_id: price_id.to_string(),
            side,
        };
        self.last_published_time
            .get_or_create(&labels)
            .set(price_info.publish_time);
        self.price.get_or_create(&labels).set(price_info.price);
        self.conf
            .get_or_create(&labels)
            .set(i64::try_from(price_info.conf).unwrap_or(i64::MAX));
    }

    pub fn stale(&self, side: Side, price_id: &PriceId) {
        self.stale_observations
            .get_or_create(&ObservationLabels {
                price_id: price_id.to_string(),
                side,
            })
            .inc();
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TriggerLabels {
    alias:   String,
    trigger: Trigger,
}

/// Decisions taken by the controller.
#[derive(Clone, Default)]
pub struct ControllerMetrics {
    update_decisions: Family<TriggerLabels, Counter>,
    last_cycle_time:  Gauge,
}

impl ControllerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "update_decisions",
            "Number of times a feed was selected for an update, by the trigger that selected it",
            metrics.update_decisions.clone(),
        );
        registry.register(
            "last_cycle_time",
            "Unix time at which the controller last evaluated all feeds",
            metrics.last_cycle_time.clone(),
        );

        metrics
    }

    pub fn decided(&self, alias: &str, trigger: Trigger) {
        self.update_decisions
            .get_or_create(&TriggerLabels {
                alias: alias.to_string(),
                trigger,
            })
            .inc();
    }

    pub fn cycle_completed(&self) {
        self.last_cycle_time.set(chrono::Utc::now().timestamp());
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PushOutcome {
    Submitted,
    Benign,
    Unknown,
    Fatal,
    FetchFailed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PushLabels {
    outcome: PushOutcome,
}

/// Results of push attempts, counted per submitted batch.
#[derive(Clone, Default)]
pub struct PushMetrics {
    batches:      Family<PushLabels, Counter>,
    feeds_pushed: Counter,
}

impl PushMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "push_batches",
            "Number of push batches, by outcome",
            metrics.batches.clone(),
        );
        registry.register(
            "feeds_pushed",
            "Number of feed updates submitted successfully",
            metrics.feeds_pushed.clone(),
        );

        metrics
    }

    pub fn record(&self, outcome: PushOutcome, feeds: usize) {
        self.batches.get_or_create(&PushLabels { outcome }).inc();
        if outcome == PushOutcome::Submitted {
            self.feeds_pushed
                .inc_by(u64::try_from(feeds).unwrap_or(u64::MAX));
        }
    }
}

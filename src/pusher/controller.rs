//! Controller
//!
//! Every cooldown the controller compares the source and target observation of
//! each configured feed and pushes the feeds whose on-chain value is too old or
//! too far off. Pushes run in their own tasks so a slow chain never delays the
//! next comparison.

use {
    super::{
        chain::{
            ChainPricePusher,
            PushError,
        },
        listener::PriceListener,
        metrics::ControllerMetrics,
        price::{
            PriceInfo,
            UnixTimestamp,
        },
        price_config::PriceConfig,
    },
    anyhow::{
        Result,
        anyhow,
    },
    futures_util::future::join_all,
    prometheus_client::encoding::EncodeLabelValue,
    serde::{
        Deserialize,
        Serialize,
    },
    std::{
        sync::Arc,
        time::Duration,
    },
    tokio::sync::mpsc,
    tracing::instrument,
};

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    /// Time between two evaluations of all feeds.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(10),
        }
    }
}

/// Why a feed was selected for an update.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Trigger {
    NoTarget,
    TimeDifference,
    PriceDeviation,
    ConfidenceRatio,
}

/// `|numerator|` relative to `|base|`, in percent. Infinite when `base` is zero.
fn percentage(numerator: i128, base: i128) -> f64 {
    if base == 0 {
        return f64::INFINITY;
    }
    numerator.abs() as f64 / base.abs() as f64 * 100.0
}

/// Decides whether the target needs the source observation, and why.
pub fn evaluate(
    config: &PriceConfig,
    source: Option<&PriceInfo>,
    target: Option<&PriceInfo>,
) -> Option<Trigger> {
    let source = source?;
    let Some(target) = target else {
        tracing::info!(alias = %config.alias, "Target has no price, pushing the source price.");
        return Some(Trigger::NoTarget);
    };

    if source.publish_time < target.publish_time {
        tracing::debug!(
            alias = %config.alias,
            source_publish_time = source.publish_time,
            target_publish_time = target.publish_time,
            "Source is older than the target, not pushing.",
        );
        return None;
    }

    let time_difference = i128::from(source.publish_time) - i128::from(target.publish_time);
    let price_deviation = percentage(
        i128::from(source.price) - i128::from(target.price),
        i128::from(target.price),
    );
    let confidence_ratio = percentage(i128::from(source.conf), i128::from(source.price));

    tracing::debug!(
        alias = %config.alias,
        time_difference,
        price_deviation,
        confidence_ratio,
        "Evaluated feed.",
    );

    let trigger = if time_difference as f64 >= config.time_difference {
        Some(Trigger::TimeDifference)
    } else if price_deviation >= config.price_deviation {
        Some(Trigger::PriceDeviation)
    } else if confidence_ratio >= config.confidence_ratio {
        Some(Trigger::ConfidenceRatio)
    } else {
        None
    };

    if let Some(trigger) = trigger {
        tracing::info!(
            alias = %config.alias,
            trigger = ?trigger,
            time_difference,
            price_deviation,
            confidence_ratio,
            "Feed needs an update.",
        );
    }
    trigger
}

pub fn should_update(
    config: &PriceConfig,
    source: Option<&PriceInfo>,
    target: Option<&PriceInfo>,
) -> bool {
    evaluate(config, source, target).is_some()
}

/// Publish time the chain should require of the pushed update: anything newer
/// than what it already holds.
pub fn publish_time_hint(target: Option<&PriceInfo>) -> UnixTimestamp {
    target.map_or(1, |target| target.publish_time.saturating_add(1))
}

pub struct Controller<S, T, P> {
    price_configs: Vec<PriceConfig>,
    source:        Arc<S>,
    target:        Arc<T>,
    pusher:        Arc<P>,
    cooldown:      Duration,
    metrics:       ControllerMetrics,
}

impl<S, T, P> Controller<S, T, P>
where
    S: PriceListener + 'static,
    T: PriceListener + 'static,
    P: ChainPricePusher + 'static,
{
    pub fn new(
        price_configs: Vec<PriceConfig>,
        source: Arc<S>,
        target: Arc<T>,
        pusher: Arc<P>,
        cooldown: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Controller {
            price_configs,
            source,
            target,
            pusher,
            cooldown,
            metrics,
        }
    }

    /// Runs cycles until the exit signal is received, returning `Ok(())`, or
    /// until a push fails fatally, returning the failure.
    pub async fn run(&self) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<PushError>(1);
        let mut exit = crate::pusher::EXIT.subscribe();

        loop {
            self.cycle(&fatal_tx).await;

            tokio::select! {
                _ = exit.changed() => {
                    tracing::info!("Shutdown signal received.");
                    return Ok(());
                }
                Some(err) = fatal_rx.recv() => {
                    return Err(anyhow!(err).context("price push failed fatally"));
                }
                _ = tokio::time::sleep(self.cooldown) => {}
            }
        }
    }

    /// Evaluates every feed and spawns the push of the selected ones.
    #[instrument(skip_all)]
    async fn cycle(&self, fatal_tx: &mpsc::Sender<PushError>) {
        let decisions = join_all(self.price_configs.iter().map(|price_config| async move {
            let source = self.source.get_latest_price_info(&price_config.id).await;
            let target = self.target.get_latest_price_info(&price_config.id).await;
            evaluate(price_config, source.as_ref(), target.as_ref())
                .map(|trigger| (price_config, trigger, publish_time_hint(target.as_ref())))
        }))
        .await;

        let mut price_ids = Vec::new();
        let mut publish_time_hints = Vec::new();
        for (price_config, trigger, hint) in decisions.into_iter().flatten() {
            self.metrics.decided(&price_config.alias, trigger);
            price_ids.push(price_config.id);
            publish_time_hints.push(hint);
        }
        self.metrics.cycle_completed();
        tracing::debug!(feeds = price_ids.len(), "Controller cycle completed.");

        let pusher = self.pusher.clone();
        let fatal_tx = fatal_tx.clone();
        tokio::spawn(async move {
            match pusher
                .update_price_feed(&price_ids, &publish_time_hints)
                .await
            {
                Ok(()) => {}
                Err(err @ PushError::Fatal(_)) => {
                    let _ = fatal_tx.send(err).await;
                }
                Err(err) => {
                    tracing::error!(err = ?err, "Push rejected.");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::pusher::price::PriceId,
        prometheus_client::registry::Registry,
        proptest::prelude::*,
        std::{
            collections::HashMap,
            sync::atomic::{
                AtomicUsize,
                Ordering,
            },
        },
        tokio::sync::{
            Mutex,
            RwLock,
        },
    };

    fn config(time_difference: f64, price_deviation: f64, confidence_ratio: f64) -> PriceConfig {
        PriceConfig {
            alias: "BTC/USD".to_string(),
            id: PriceId::new([1; 32]),
            time_difference,
            price_deviation,
            confidence_ratio,
        }
    }

    fn info(price: i64, conf: u64, publish_time: i64) -> PriceInfo {
        PriceInfo {
            price,
            conf,
            publish_time,
        }
    }

    #[test]
    fn test_recent_target_within_all_thresholds() {
        let cfg = config(60.0, 1.0, 2.0);
        let source = info(100, 1, 1000);
        assert!(!should_update(&cfg, Some(&source), Some(&info(100, 0, 960))));
    }

    #[test]
    fn test_stale_target_is_updated() {
        let cfg = config(60.0, 1.0, 2.0);
        let source = info(100, 1, 1000);
        assert_eq!(
            evaluate(&cfg, Some(&source), Some(&info(100, 0, 930))),
            Some(Trigger::TimeDifference)
        );
    }

    #[test]
    fn test_deviating_target_is_updated() {
        // |100 - 98| / 98 is about 2.04%.
        let cfg = config(60.0, 1.0, 2.0);
        let source = info(100, 1, 1000);
        assert_eq!(
            evaluate(&cfg, Some(&source), Some(&info(98, 0, 999))),
            Some(Trigger::PriceDeviation)
        );
    }

    #[test]
    fn test_time_difference_triggers() {
        // Price unchanged, but the target is a minute behind.
        let cfg = config(60.0, 1.0, 1.0);
        let source = info(100, 0, 1060);
        let target = info(100, 0, 1000);
        assert_eq!(
            evaluate(&cfg, Some(&source), Some(&target)),
            Some(Trigger::TimeDifference)
        );
        assert_eq!(publish_time_hint(Some(&target)), 1001);
    }

    #[test]
    fn test_price_deviation_triggers() {
        let cfg = config(60.0, 1.0, 1.0);
        let source = info(102, 0, 1010);
        let target = info(100, 0, 1000);
        assert_eq!(
            evaluate(&cfg, Some(&source), Some(&target)),
            Some(Trigger::PriceDeviation)
        );
    }

    #[test]
    fn test_small_changes_do_not_trigger() {
        let cfg = config(60.0, 1.0, 1.0);
        let source = info(1005, 5, 1010);
        let target = info(1000, 0, 1000);
        assert_eq!(evaluate(&cfg, Some(&source), Some(&target)), None);
    }

    #[test]
    fn test_confidence_ratio_triggers() {
        let cfg = config(60.0, 1.0, 1.0);
        let source = info(100, 2, 1010);
        let target = info(100, 0, 1000);
        assert_eq!(
            evaluate(&cfg, Some(&source), Some(&target)),
            Some(Trigger::ConfidenceRatio)
        );
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let cfg = config(60.0, 2.0, 50.0);
        let target = info(100, 0, 1000);

        assert!(should_update(&cfg, Some(&info(100, 0, 1060)), Some(&target)));
        assert!(!should_update(&cfg, Some(&info(100, 0, 1059)), Some(&target)));
        assert!(should_update(&cfg, Some(&info(102, 0, 1001)), Some(&target)));
        assert!(should_update(&cfg, Some(&info(100, 50, 1001)), Some(&target)));
    }

    #[test]
    fn test_fractional_time_difference() {
        let cfg = config(30.5, 1.0, 1.0);
        let target = info(100, 0, 1000);
        assert!(!should_update(&cfg, Some(&info(100, 0, 1030)), Some(&target)));
        assert_eq!(
            evaluate(&cfg, Some(&info(100, 0, 1031)), Some(&target)),
            Some(Trigger::TimeDifference)
        );
    }

    #[test]
    fn test_missing_observations() {
        let cfg = config(60.0, 1.0, 1.0);
        let observed = info(100, 0, 1000);

        assert!(!should_update(&cfg, None, Some(&observed)));
        assert!(!should_update(&cfg, None, None));
        assert_eq!(
            evaluate(&cfg, Some(&observed), None),
            Some(Trigger::NoTarget)
        );
        assert_eq!(publish_time_hint(None), 1);
    }

    #[test]
    fn test_zero_prices_always_trigger() {
        let cfg = config(f64::MAX, 1e9, 1e9);
        // Deviation from a zero target is infinite.
        assert_eq!(
            evaluate(&cfg, Some(&info(1, 0, 1001)), Some(&info(0, 0, 1000))),
            Some(Trigger::PriceDeviation)
        );
        // Confidence relative to a zero source price is infinite.
        assert_eq!(
            evaluate(&cfg, Some(&info(0, 1, 1001)), Some(&info(1, 0, 1000))),
            Some(Trigger::ConfidenceRatio)
        );
    }

    #[test]
    fn test_extreme_values_do_not_overflow() {
        let cfg = config(f64::MAX, 1e300, 1e300);
        let source = info(i64::MAX, u64::MAX, i64::MAX);
        let target = info(i64::MIN, 0, i64::MIN + 1);
        assert!(!should_update(&cfg, Some(&source), Some(&target)));
        assert_eq!(publish_time_hint(Some(&source)), i64::MAX);
    }

    proptest! {
        #[test]
        fn prop_source_absent_never_updates(
            price in any::<i64>(),
            conf in any::<u64>(),
            publish_time in any::<i64>(),
        ) {
            let cfg = config(0.0, 0.0, 0.0);
            prop_assert!(!should_update(&cfg, None, Some(&info(price, conf, publish_time))));
        }

        #[test]
        fn prop_target_absent_always_updates(
            price in any::<i64>(),
            conf in any::<u64>(),
            publish_time in any::<i64>(),
        ) {
            let cfg = config(f64::MAX, f64::MAX, f64::MAX);
            prop_assert!(should_update(&cfg, Some(&info(price, conf, publish_time)), None));
        }

        #[test]
        fn prop_older_source_never_updates(
            source_price in any::<i64>(),
            target_price in any::<i64>(),
            conf in any::<u64>(),
            target_time in (i64::MIN + 1)..=i64::MAX,
            lag in 1i64..=i64::MAX,
        ) {
            let source_time = target_time.saturating_sub(lag);
            prop_assume!(source_time < target_time);
            let cfg = config(0.0, 0.0, 0.0);
            prop_assert!(!should_update(
                &cfg,
                Some(&info(source_price, conf, source_time)),
                Some(&info(target_price, 0, target_time)),
            ));
        }
    }

    /// A listener whose observations are set by the test.
    #[derive(Default)]
    struct FixedListener {
        prices: RwLock<HashMap<PriceId, PriceInfo>>,
    }

    #[async_trait::async_trait]
    impl PriceListener for FixedListener {
        async fn get_latest_price_info(&self, price_id: &PriceId) -> Option<PriceInfo> {
            self.prices.read().await.get(price_id).copied()
        }
    }

    #[derive(Default)]
    struct RecordingPusher {
        fail_fatally: bool,
        calls:        Mutex<Vec<(Vec<PriceId>, Vec<UnixTimestamp>)>>,
    }

    #[async_trait::async_trait]
    impl ChainPricePusher for RecordingPusher {
        async fn update_price_feed(
            &self,
            price_ids: &[PriceId],
            publish_time_hints: &[UnixTimestamp],
        ) -> Result<(), PushError> {
            self.calls
                .lock()
                .await
                .push((price_ids.to_vec(), publish_time_hints.to_vec()));
            if self.fail_fatally && !price_ids.is_empty() {
                return Err(PushError::Fatal(anyhow!("insufficient funds")));
            }
            Ok(())
        }
    }

    fn controller(
        price_configs: Vec<PriceConfig>,
        source: Arc<FixedListener>,
        target: Arc<FixedListener>,
        pusher: Arc<RecordingPusher>,
    ) -> Controller<FixedListener, FixedListener, RecordingPusher> {
        Controller::new(
            price_configs,
            source,
            target,
            pusher,
            Duration::from_millis(20),
            ControllerMetrics::new(&mut Registry::default()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cycle_pushes_selected_feeds_with_hints() {
        let btc = PriceId::new([1; 32]);
        let eth = PriceId::new([2; 32]);
        let sol = PriceId::new([3; 32]);
        let configs = vec![
            PriceConfig {
                id: btc,
                ..config(60.0, 1.0, 1.0)
            },
            PriceConfig {
                alias: "ETH/USD".to_string(),
                id: eth,
                ..config(60.0, 1.0, 1.0)
            },
            PriceConfig {
                alias: "SOL/USD".to_string(),
                id: sol,
                ..config(60.0, 1.0, 1.0)
            },
        ];

        let source = Arc::new(FixedListener::default());
        let target = Arc::new(FixedListener::default());
        // BTC is stale on-chain, ETH is fresh enough, SOL was never pushed.
        *source.prices.write().await = HashMap::from([
            (btc, info(100, 0, 1060)),
            (eth, info(100, 0, 1010)),
            (sol, info(20, 0, 1000)),
        ]);
        *target.prices.write().await =
            HashMap::from([(btc, info(100, 0, 1000)), (eth, info(100, 0, 1000))]);

        let pusher = Arc::new(RecordingPusher::default());
        let controller = controller(configs, source, target, pusher.clone());
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        controller.cycle(&fatal_tx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = pusher.calls.lock().await;
        assert_eq!(calls.len(), 1);
        let (ids, hints) = &calls[0];
        assert_eq!(ids, &vec![btc, sol]);
        assert_eq!(hints, &vec![1001, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_cycle_still_calls_pusher() {
        let pusher = Arc::new(RecordingPusher::default());
        let controller = controller(
            vec![config(60.0, 1.0, 1.0)],
            Arc::new(FixedListener::default()),
            Arc::new(FixedListener::default()),
            pusher.clone(),
        );
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        controller.cycle(&fatal_tx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = pusher.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fatal_push_ends_run() {
        let cfg = config(60.0, 1.0, 1.0);
        let source = Arc::new(FixedListener::default());
        source
            .prices
            .write()
            .await
            .insert(cfg.id, info(100, 0, 1000));

        let pusher = Arc::new(RecordingPusher {
            fail_fatally: true,
            ..RecordingPusher::default()
        });
        let controller = controller(
            vec![cfg],
            source,
            Arc::new(FixedListener::default()),
            pusher,
        );

        let result = tokio::time::timeout(Duration::from_secs(5), controller.run())
            .await
            .unwrap();
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("insufficient funds"));
    }

    /// A pusher whose pushes never complete.
    #[derive(Default)]
    struct HangingPusher {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChainPricePusher for HangingPusher {
        async fn update_price_feed(
            &self,
            _price_ids: &[PriceId],
            _publish_time_hints: &[UnixTimestamp],
        ) -> Result<(), PushError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hanging_push_does_not_block_cycles() {
        let pusher = Arc::new(HangingPusher::default());
        let controller = Controller::new(
            vec![config(60.0, 1.0, 1.0)],
            Arc::new(FixedListener::default()),
            Arc::new(FixedListener::default()),
            pusher.clone(),
            Duration::from_millis(20),
            ControllerMetrics::new(&mut Registry::default()),
        );

        // The run only ends on shutdown or a fatal push, so it outlives the timeout.
        let result = tokio::time::timeout(Duration::from_millis(300), controller.run()).await;
        assert!(result.is_err());
        assert!(pusher.calls.load(Ordering::SeqCst) >= 5);
    }
}

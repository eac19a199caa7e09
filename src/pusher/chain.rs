//! Chain
//!
//! Pushing fresh prices to a target chain: fetch the signed payload for the
//! selected feeds from Hermes, hand it to the chain's [`Submitter`], and sort the
//! outcome into the failures that can be ignored and the ones that cannot.

use {
    super::{
        hermes::HermesClient,
        metrics::{
            PushMetrics,
            PushOutcome,
        },
        price::{
            PriceId,
            UnixTimestamp,
        },
        submitter::{
            self,
            Submitter,
            UpdateBatch,
        },
    },
    serde::{
        Deserialize,
        Serialize,
    },
    std::sync::Arc,
    thiserror::Error,
    tracing::instrument,
};

#[async_trait::async_trait]
pub trait ChainPricePusher: Send + Sync {
    /// Pushes the latest update of every feed in `price_ids`. `publish_time_hints`
    /// is aligned with `price_ids`. Only fatal failures are returned; everything
    /// else is logged and left for the next cycle.
    async fn update_price_feed(
        &self,
        price_ids: &[PriceId],
        publish_time_hints: &[UnixTimestamp],
    ) -> Result<(), PushError>;
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("got {ids} price ids but {hints} publish time hints")]
    InvalidArguments { ids: usize, hints: usize },
    #[error("fatal push failure")]
    Fatal(#[source] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The chain is already up to date or a concurrent submission won a race.
    Benign,
    /// Retrying cannot succeed without operator action.
    Fatal,
    Unknown,
}

const FATAL_PATTERNS: &[&str] = &[
    "insufficient funds",
    "sender doesn't have enough funds to send tx",
];

const BENIGN_PATTERNS: &[&str] = &[
    "nofreshupdate",
    "vm exception while processing transaction: revert",
    "nonce too low",
    "the tx doesn't have the correct nonce",
    "invalid nonce",
    "nonce provided for the transaction",
    "replacement transaction underpriced",
    "could not replace existing tx",
    "max fee per gas less than block base fee",
];

/// Classifies a submission error by the messages along its cause chain.
pub fn classify(err: &anyhow::Error) -> Failure {
    let messages: Vec<String> = err
        .chain()
        .map(|cause| cause.to_string().to_lowercase())
        .collect();
    let matches = |patterns: &[&str]| {
        messages
            .iter()
            .any(|message| patterns.iter().any(|pattern| message.contains(pattern)))
    };

    if matches(FATAL_PATTERNS) {
        Failure::Fatal
    } else if matches(BENIGN_PATTERNS) {
        Failure::Benign
    } else {
        Failure::Unknown
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    /// Larger batches are split into independent submissions of at most this many feeds.
    pub max_batch_size: usize,
    pub submitter:      submitter::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            submitter:      submitter::Config::default(),
        }
    }
}

/// Pusher that sources update payloads from Hermes.
pub struct HermesPricePusher {
    hermes:         Arc<HermesClient>,
    submitter:      Arc<dyn Submitter>,
    max_batch_size: usize,
    metrics:        PushMetrics,
}

impl HermesPricePusher {
    pub fn new(
        hermes: Arc<HermesClient>,
        submitter: Arc<dyn Submitter>,
        max_batch_size: usize,
        metrics: PushMetrics,
    ) -> Self {
        HermesPricePusher {
            hermes,
            submitter,
            max_batch_size: max_batch_size.max(1),
            metrics,
        }
    }

    #[instrument(skip_all, fields(price_ids = price_ids.len()))]
    async fn push_batch(
        &self,
        price_ids: &[PriceId],
        publish_time_hints: &[UnixTimestamp],
    ) -> Result<(), PushError> {
        let updates = match self.hermes.get_latest_price_updates(price_ids).await {
            Ok(updates) => updates,
            Err(err) => {
                tracing::error!(err = ?err, "Fetching price update data failed, skipping this push.");
                self.metrics.record(PushOutcome::FetchFailed, price_ids.len());
                return Ok(());
            }
        };

        let batch = UpdateBatch {
            price_ids:          price_ids.to_vec(),
            publish_time_hints: publish_time_hints.to_vec(),
            update_data:        updates.update_data,
        };

        let Err(err) = self.submitter.submit(&batch).await else {
            tracing::info!("Price update submitted.");
            self.metrics
                .record(PushOutcome::Submitted, batch.price_ids.len());
            return Ok(());
        };

        match classify(&err) {
            Failure::Benign => {
                tracing::info!(err = %err, "Push not needed or lost a race, skipping.");
                self.metrics.record(PushOutcome::Benign, batch.price_ids.len());
                Ok(())
            }
            Failure::Unknown => {
                tracing::error!(err = ?err, "Push failed, will retry next cycle.");
                self.metrics
                    .record(PushOutcome::Unknown, batch.price_ids.len());
                Ok(())
            }
            Failure::Fatal => {
                tracing::error!(err = ?err, "Push failed and cannot recover.");
                self.metrics.record(PushOutcome::Fatal, batch.price_ids.len());
                Err(PushError::Fatal(err))
            }
        }
    }
}

#[async_trait::async_trait]
impl ChainPricePusher for HermesPricePusher {
    async fn update_price_feed(
        &self,
        price_ids: &[PriceId],
        publish_time_hints: &[UnixTimestamp],
    ) -> Result<(), PushError> {
        if price_ids.is_empty() {
            return Ok(());
        }
        if price_ids.len() != publish_time_hints.len() {
            return Err(PushError::InvalidArguments {
                ids:   price_ids.len(),
                hints: publish_time_hints.len(),
            });
        }

        for (ids, hints) in price_ids
            .chunks(self.max_batch_size)
            .zip(publish_time_hints.chunks(self.max_batch_size))
        {
            self.push_batch(ids, hints).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::pusher::hermes,
        anyhow::anyhow,
        prometheus_client::registry::Registry,
        std::sync::atomic::{
            AtomicUsize,
            Ordering,
        },
        tokio::sync::Mutex,
        url::Url,
        warp::Filter,
    };

    /// Records batches and fails every submission with a fixed message, if set.
    #[derive(Default)]
    struct RecordingSubmitter {
        error:   Option<&'static str>,
        batches: Mutex<Vec<UpdateBatch>>,
    }

    #[async_trait::async_trait]
    impl Submitter for RecordingSubmitter {
        async fn submit(&self, batch: &UpdateBatch) -> anyhow::Result<()> {
            self.batches.lock().await.push(batch.clone());
            match self.error {
                Some(message) => Err(anyhow!(message).context("submitting price update")),
                None => Ok(()),
            }
        }
    }

    /// Serves a fixed payload for every request and counts the requests.
    async fn hermes_mock() -> (Arc<HermesClient>, Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let route = warp::path!("v2" / "updates" / "price" / "latest").map(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            warp::reply::json(&serde_json::json!({
                "binary": { "encoding": "base64", "data": ["UE5BVQ=="] },
                "parsed": []
            }))
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let client = HermesClient::new(&hermes::Config {
            endpoint: Url::parse(&format!("http://{addr}/")).unwrap(),
            ..hermes::Config::default()
        })
        .unwrap();
        (Arc::new(client), requests, tokio::spawn(server))
    }

    fn pusher(
        hermes: Arc<HermesClient>,
        submitter: Arc<RecordingSubmitter>,
        max_batch_size: usize,
    ) -> HermesPricePusher {
        HermesPricePusher::new(
            hermes,
            submitter,
            max_batch_size,
            PushMetrics::new(&mut Registry::default()),
        )
    }

    fn ids(n: u8) -> Vec<PriceId> {
        (0..n).map(|i| PriceId::new([i; 32])).collect()
    }

    #[test]
    fn test_classify() {
        let classify_message = |message: &'static str| classify(&anyhow!(message));

        assert_eq!(
            classify_message("execution reverted: NoFreshUpdate"),
            Failure::Benign
        );
        assert_eq!(
            classify_message("VM Exception while processing transaction: revert"),
            Failure::Benign
        );
        assert_eq!(classify_message("nonce too low: next nonce 5"), Failure::Benign);
        assert_eq!(
            classify_message("replacement transaction underpriced"),
            Failure::Benign
        );
        assert_eq!(
            classify_message("insufficient funds for gas * price + value"),
            Failure::Fatal
        );
        assert_eq!(
            classify_message("sender doesn't have enough funds to send tx."),
            Failure::Fatal
        );
        assert_eq!(classify_message("connection reset by peer"), Failure::Unknown);

        // The cause chain is searched, not just the outermost context.
        let wrapped = anyhow!("insufficient funds").context("relay error");
        assert_eq!(classify(&wrapped), Failure::Fatal);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_batch_is_a_no_op() {
        let (hermes, requests, server) = hermes_mock().await;
        let submitter = Arc::new(RecordingSubmitter::default());
        let pusher = pusher(hermes, submitter.clone(), 10);

        pusher.update_price_feed(&[], &[]).await.unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 0);
        assert!(submitter.batches.lock().await.is_empty());
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mismatched_hints_are_rejected_without_io() {
        let (hermes, requests, server) = hermes_mock().await;
        let submitter = Arc::new(RecordingSubmitter::default());
        let pusher = pusher(hermes, submitter.clone(), 10);

        let result = pusher.update_price_feed(&ids(2), &[1]).await;

        assert!(matches!(
            result,
            Err(PushError::InvalidArguments { ids: 2, hints: 1 })
        ));
        assert_eq!(requests.load(Ordering::SeqCst), 0);
        assert!(submitter.batches.lock().await.is_empty());
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batches_are_split_and_hints_stay_aligned() {
        let (hermes, requests, server) = hermes_mock().await;
        let submitter = Arc::new(RecordingSubmitter::default());
        let pusher = pusher(hermes, submitter.clone(), 2);

        let ids = ids(5);
        let hints: Vec<UnixTimestamp> = (1..=5).collect();
        pusher.update_price_feed(&ids, &hints).await.unwrap();

        let batches = submitter.batches.lock().await;
        assert_eq!(requests.load(Ordering::SeqCst), 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].price_ids, ids[..2]);
        assert_eq!(batches[0].publish_time_hints, vec![1, 2]);
        assert_eq!(batches[2].price_ids, ids[4..]);
        assert_eq!(batches[2].publish_time_hints, vec![5]);
        assert_eq!(batches[0].update_data, vec![b"PNAU".to_vec()]);
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_benign_and_unknown_failures_are_swallowed() {
        for message in ["execution reverted: NoFreshUpdate", "gateway timeout"] {
            let (hermes, _, server) = hermes_mock().await;
            let submitter = Arc::new(RecordingSubmitter {
                error: Some(message),
                ..RecordingSubmitter::default()
            });
            let pusher = pusher(hermes, submitter.clone(), 10);

            pusher.update_price_feed(&ids(1), &[1]).await.unwrap();
            assert_eq!(submitter.batches.lock().await.len(), 1);
            server.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fatal_failure_is_returned() {
        let (hermes, _, server) = hermes_mock().await;
        let submitter = Arc::new(RecordingSubmitter {
            error: Some("insufficient funds for gas"),
            ..RecordingSubmitter::default()
        });
        let pusher = pusher(hermes, submitter, 10);

        let result = pusher.update_price_feed(&ids(1), &[1]).await;
        assert!(matches!(result, Err(PushError::Fatal(_))));
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetch_failure_skips_the_batch() {
        // Nothing listens on this port.
        let hermes = HermesClient::new(&hermes::Config {
            endpoint: Url::parse("http://127.0.0.1:9/").unwrap(),
            total_retry_timeout: std::time::Duration::from_millis(100),
            ..hermes::Config::default()
        })
        .unwrap();
        let submitter = Arc::new(RecordingSubmitter::default());
        let pusher = pusher(Arc::new(hermes), submitter.clone(), 10);

        pusher.update_price_feed(&ids(1), &[1]).await.unwrap();
        assert!(submitter.batches.lock().await.is_empty());
    }
}

/* ###################################################### System Architecture #######################################################

                 +--------------------+                                         +--------------------+
                 |       Hermes       |                                         |    Solana RPC      |
                 +--------------------+                                         +--------------------+
                   |  REST + WS     ^                                              |  RPC + WS
                   v                |  update data                                 v
        +-----------------+         |                                    +-----------------+
        | Source Listener |         |                                    | Target Listener |
        |  (Price Cache)  |         |                                    |  (Price Cache)  |
        +-----------------+         |                                    +-----------------+
                   |                |                                              |
                   |       +-----------------+       +-------------+               |
                   +------>|   Controller    |------>|   Pusher    |<--------------+
                           +-----------------+       +-------------+      reads
                                                            |
                                                            v
                                                     +-------------+
                                                     |  Submitter  |-----> target chain
                                                     +-------------+

The arrows on the diagram above represent the direction of data flow.

- Each listener keeps the freshest observation of every tracked feed, fed by a poller and
  a subscription racing into the same cache. A cache never moves backwards in publish time.
- Every cooldown the Controller compares the two observations of each feed and selects the
  feeds whose on-chain value is too old or too far from the source.
- The Pusher fetches the signed update payload for the selected feeds from Hermes and hands
  it to the Submitter. Failures that cannot be fixed by retrying stop the process.

################################################################################################################################## */

use {
    self::{
        cache::PriceCache,
        chain::HermesPricePusher,
        config::Config,
        controller::Controller,
        hermes::{
            HermesClient,
            HermesSource,
        },
        listener::Listener,
        metrics::{
            ControllerMetrics,
            ObservationMetrics,
            PROMETHEUS_REGISTRY,
            PushMetrics,
            Side,
        },
        price_config::read_price_config_file,
        solana::SolanaSource,
    },
    anyhow::{
        Result,
        bail,
    },
    futures_util::future::join_all,
    lazy_static::lazy_static,
    std::sync::Arc,
    tokio::{
        signal::unix::{
            SignalKind,
            signal,
        },
        sync::watch,
    },
};

pub mod cache;
pub mod chain;
pub mod config;
pub mod controller;
pub mod hermes;
pub mod listener;
pub mod metrics;
pub mod price;
pub mod price_config;
pub mod solana;
pub mod submitter;
pub mod utils;

lazy_static! {
    /// Flipped to `true` once the process starts shutting down. Long running tasks
    /// subscribe to it and return when it changes.
    pub static ref EXIT: watch::Sender<bool> = watch::channel(false).0;
}

pub struct Pusher {
    config: Config,
}

impl Pusher {
    pub fn new(config: Config) -> Self {
        Pusher { config }
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!(config = ?&self.config, "Starting Price Pusher.");

        let price_configs = read_price_config_file(&self.config.price_config_file)?;
        let hermes = Arc::new(HermesClient::new(&self.config.hermes)?);
        let price_configs = hermes.retain_known_feeds(price_configs).await;
        if price_configs.is_empty() {
            bail!("none of the configured feeds is served by Hermes");
        }
        tracing::info!(feeds = price_configs.len(), "Loaded price configs.");

        let (observation_metrics, controller_metrics, push_metrics) = {
            let mut registry = PROMETHEUS_REGISTRY.lock().await;
            (
                ObservationMetrics::new(&mut registry),
                ControllerMetrics::new(&mut registry),
                PushMetrics::new(&mut registry),
            )
        };

        let feeds: Vec<_> = price_configs
            .iter()
            .map(|price_config| (price_config.id, price_config.alias.clone()))
            .collect();

        let source = Arc::new(Listener::new(
            self.config.hermes.listener.clone(),
            HermesSource::new(hermes.clone()),
            PriceCache::new(Side::Source, observation_metrics.clone()),
            feeds.clone(),
        ));

        let solana = SolanaSource::new(&self.config.solana);
        let mut handles =
            vec![solana.health_checker(self.config.solana.health_check_interval_duration)];
        let target = Arc::new(Listener::new(
            self.config.solana.listener.clone(),
            solana,
            PriceCache::new(Side::Target, observation_metrics),
            feeds,
        ));

        // Seed both caches so the first cycle does not push every feed.
        tokio::join!(source.poll(), target.poll());

        handles.extend(listener::listener(source.clone()));
        handles.extend(listener::listener(target.clone()));

        if self.config.metrics_server.enabled {
            handles.push(tokio::spawn(metrics::spawn_server(
                self.config.metrics_server.clone(),
                EXIT.subscribe(),
            )));
        }

        let pusher = Arc::new(HermesPricePusher::new(
            hermes,
            submitter::build(&self.config.pusher.submitter)?,
            self.config.pusher.max_batch_size,
            push_metrics,
        ));

        // Wait for SIGINT or SIGTERM and notify all components.
        let signal_handler = tokio::spawn(async {
            if let Err(err) = shutdown_signal().await {
                tracing::error!(err = ?err, "Could not wait for the shutdown signal.");
                return;
            }
            tracing::info!("Shut-down signal received, waiting for tasks...");
            let _ = EXIT.send(true);
        });

        let controller = Controller::new(
            price_configs,
            source,
            target,
            pusher,
            self.config.controller.cooldown,
            controller_metrics,
        );
        let result = controller.run().await;

        // A fatal push failure ends the controller without a signal.
        let _ = EXIT.send(true);
        signal_handler.abort();
        join_all(handles).await;

        result
    }
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

use {
    super::{
        chain,
        controller,
        hermes,
        metrics,
        solana,
    },
    anyhow::Result,
    config as config_rs,
    config_rs::{
        Environment,
        File,
    },
    serde::Deserialize,
    std::{
        path::{
            Path,
            PathBuf,
        },
        time::Duration,
    },
};

/// Configuration for all components of the pusher
#[derive(Deserialize, Debug)]
pub struct Config {
    /// YAML file listing the tracked feeds and their update thresholds.
    pub price_config_file: PathBuf,
    #[serde(default)]
    pub controller:        controller::Config,
    #[serde(default)]
    pub hermes:            hermes::Config,
    #[serde(default)]
    pub solana:            solana::Config,
    #[serde(default)]
    pub pusher:            chain::Config,
    #[serde(default)]
    pub metrics_server:    metrics::Config,
    pub opentelemetry:     Option<OpenTelemetryConfig>,
}

impl Config {
    pub fn new(config_file: impl AsRef<Path>) -> Result<Self> {
        Self::from_sources(config_file, environment())
    }

    fn from_sources(config_file: impl AsRef<Path>, environment: Environment) -> Result<Self> {
        // Build a new configuration object, allowing the default values to be
        // overridden by those in the config_file or "PUSHER_"-prefixed environment
        // variables.
        config_rs::Config::builder()
            .add_source(File::from(config_file.as_ref()))
            .add_source(environment)
            .build()?
            .try_deserialize()
            .map_err(|e| e.into())
    }
}

/// `PUSHER_CONTROLLER__COOLDOWN=5s` overrides `controller.cooldown`.
fn environment() -> Environment {
    Environment::with_prefix("pusher")
        .prefix_separator("_")
        .separator("__")
}

#[derive(Deserialize, Debug)]
pub struct OpenTelemetryConfig {
    #[serde(with = "humantime_serde")]
    pub exporter_timeout_duration: Duration,
    pub exporter_endpoint:         String,
}

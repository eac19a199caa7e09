//! Submitter
//!
//! The last hop of a push: hands a batch of signed update payloads to a target
//! chain. Signing and the chain's transaction format live behind this seam.

use {
    super::price::{
        PriceId,
        UnixTimestamp,
    },
    anyhow::Result,
    serde::{
        Deserialize,
        Serialize,
    },
    std::sync::Arc,
};

pub mod dry_run;
pub mod relay;

/// One submission to a target chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateBatch {
    pub price_ids:          Vec<PriceId>,
    /// Aligned with `price_ids`. The chain only accepts an update for a feed if
    /// it was published at or after its hint.
    pub publish_time_hints: Vec<UnixTimestamp>,
    /// Payloads as fetched from Hermes, covering every feed in `price_ids`.
    pub update_data:        Vec<Vec<u8>>,
}

#[async_trait::async_trait]
pub trait Submitter: Send + Sync {
    /// Submits `batch`. Errors are classified by their message, so
    /// implementations should keep the chain's error text intact.
    async fn submit(&self, batch: &UpdateBatch) -> Result<()>;
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Config {
    /// Forward batches to a signing relay.
    Relay(relay::Config),
    /// Log batches instead of submitting them.
    DryRun,
}

impl Default for Config {
    fn default() -> Self {
        Config::DryRun
    }
}

pub fn build(config: &Config) -> Result<Arc<dyn Submitter>> {
    Ok(match config {
        Config::Relay(config) => Arc::new(relay::RelaySubmitter::new(config)?),
        Config::DryRun => Arc::new(dry_run::DryRunSubmitter),
    })
}

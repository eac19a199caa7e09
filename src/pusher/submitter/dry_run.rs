use {
    super::{
        Submitter,
        UpdateBatch,
    },
    anyhow::Result,
};

/// Accepts every batch without sending anything.
pub struct DryRunSubmitter;

#[async_trait::async_trait]
impl Submitter for DryRunSubmitter {
    async fn submit(&self, batch: &UpdateBatch) -> Result<()> {
        tracing::info!(
            price_ids = ?batch.price_ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
            publish_time_hints = ?batch.publish_time_hints,
            update_data_bytes = batch.update_data.iter().map(Vec::len).sum::<usize>(),
            "Dry run: skipping submission.",
        );
        Ok(())
    }
}

// The Price Cache holds the most recent observation of each price feed made by a
// single listener. Pollers and subscribers race to write into it; the publish time
// check below keeps the cache from ever moving backwards.
use {
    super::{
        metrics::{
            ObservationMetrics,
            Side,
        },
        price::{
            PriceId,
            PriceInfo,
        },
    },
    std::collections::HashMap,
    tokio::sync::RwLock,
};

pub struct PriceCache {
    side:    Side,
    prices:  RwLock<HashMap<PriceId, PriceInfo>>,
    metrics: ObservationMetrics,
}

impl PriceCache {
    pub fn new(side: Side, metrics: ObservationMetrics) -> Self {
        PriceCache {
            side,
            prices: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Stores `price_info` unless the cache already holds an observation for
    /// `price_id` with the same or a later publish time. Returns whether the
    /// observation was stored.
    pub async fn update(&self, price_id: PriceId, price_info: PriceInfo) -> bool {
        // The check and the insert must happen under the same write guard.
        let mut prices = self.prices.write().await;
        if let Some(current) = prices.get(&price_id) {
            if current.publish_time >= price_info.publish_time {
                tracing::trace!(
                    price_id = %price_id,
                    side = ?self.side,
                    cached_publish_time = current.publish_time,
                    observed_publish_time = price_info.publish_time,
                    "Dropping observation that is not fresher than the cached one.",
                );
                self.metrics.stale(self.side, &price_id);
                return false;
            }
        }

        tracing::debug!(
            price_id = %price_id,
            side = ?self.side,
            price_info = ?price_info,
            "Price cache received a fresher observation.",
        );
        self.metrics.update(self.side, &price_id, &price_info);
        prices.insert(price_id, price_info);
        true
    }

    pub async fn get(&self, price_id: &PriceId) -> Option<PriceInfo> {
        self.prices.read().await.get(price_id).copied()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.prices.read().await.len()
    }
}

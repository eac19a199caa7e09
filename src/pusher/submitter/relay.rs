//! Relay
//!
//! Sends batches to an external signing relay over JSON-RPC 2.0. The relay owns
//! the payer key and builds the chain transaction; it answers with the
//! transaction hash or with the chain's error message.

use {
    super::{
        Submitter,
        UpdateBatch,
    },
    anyhow::{
        Result,
        anyhow,
    },
    base64::Engine,
    serde::{
        Deserialize,
        Serialize,
    },
    std::{
        sync::atomic::{
            AtomicU64,
            Ordering,
        },
        time::Duration,
    },
    url::Url,
};

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Config {
    /// JSON-RPC endpoint of the relay.
    pub url:     Url,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id:      u64,
    method:  &'static str,
    params:  UpdatePriceFeedsParams<'a>,
}

#[derive(Debug, Serialize)]
struct UpdatePriceFeedsParams<'a> {
    ids:           Vec<String>,
    publish_times: &'a [i64],
    /// Base64 encoded.
    update_data:   Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<UpdatePriceFeedsResult>,
    #[serde(default)]
    error:  Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct UpdatePriceFeedsResult {
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code:    i64,
    message: String,
}

pub struct RelaySubmitter {
    url:     Url,
    client:  reqwest::Client,
    next_id: AtomicU64,
}

impl RelaySubmitter {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(RelaySubmitter {
            url:     config.url.clone(),
            client:  reqwest::Client::builder().timeout(config.timeout).build()?,
            next_id: AtomicU64::new(1),
        })
    }

    fn request<'a>(&self, batch: &'a UpdateBatch) -> Request<'a> {
        Request {
            jsonrpc: "2.0",
            id:      self.next_id.fetch_add(1, Ordering::Relaxed),
            method:  "update_price_feeds",
            params:  UpdatePriceFeedsParams {
                ids:           batch.price_ids.iter().map(|id| id.to_prefixed_hex()).collect(),
                publish_times: &batch.publish_time_hints,
                update_data:   batch
                    .update_data
                    .iter()
                    .map(|data| base64::engine::general_purpose::STANDARD.encode(data))
                    .collect(),
            },
        }
    }
}

#[async_trait::async_trait]
impl Submitter for RelaySubmitter {
    async fn submit(&self, batch: &UpdateBatch) -> Result<()> {
        let response: Response = self
            .client
            .post(self.url.clone())
            .json(&self.request(batch))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response {
            Response {
                error: Some(error), ..
            } => Err(anyhow!("relay error {}: {}", error.code, error.message)),
            Response {
                result: Some(result),
                ..
            } => {
                tracing::info!(tx_hash = ?result.tx_hash, "Price update sent.");
                Ok(())
            }
            Response { .. } => Err(anyhow!("relay returned neither a result nor an error")),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::pusher::price::PriceId,
        warp::Filter,
    };

    fn batch() -> UpdateBatch {
        UpdateBatch {
            price_ids:          vec![PriceId::new([0xab; 32])],
            publish_time_hints: vec![101],
            update_data:        vec![b"PNAU".to_vec()],
        }
    }

    #[test]
    fn test_request_encoding() {
        let submitter = RelaySubmitter::new(&Config {
            url:     Url::parse("http://127.0.0.1:1/").unwrap(),
            timeout: default_timeout(),
        })
        .unwrap();

        let batch = batch();
        let request = serde_json::to_value(submitter.request(&batch)).unwrap();
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "update_price_feeds");
        assert_eq!(request["params"]["ids"][0], format!("0x{}", "ab".repeat(32)));
        assert_eq!(request["params"]["publish_times"][0], 101);
        assert_eq!(request["params"]["update_data"][0], "UE5BVQ==");
    }

    async fn submit_against(reply: serde_json::Value) -> Result<()> {
        let route = warp::post().map(move || warp::reply::json(&reply));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        let server = tokio::spawn(server);

        let submitter = RelaySubmitter::new(&Config {
            url:     Url::parse(&format!("http://{addr}/")).unwrap(),
            timeout: default_timeout(),
        })
        .unwrap();
        let result = submitter.submit(&batch()).await;

        server.abort();
        result
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_result_and_error() {
        submit_against(serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "result": { "tx_hash": "0x01" }
        }))
        .await
        .unwrap();

        let err = submit_against(serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32000, "message": "nonce too low" }
        }))
        .await
        .unwrap_err();
        assert!(err.to_string().contains("nonce too low"));
    }
}

use {
    anyhow::bail,
    solana_client::nonblocking::rpc_client::RpcClient,
    solana_sdk::{
        account::Account,
        clock::UnixTimestamp,
        commitment_config::CommitmentConfig,
        pubkey::Pubkey,
    },
    std::time::Duration,
    url::Url,
};

/// Maximum number of accounts a single getMultipleAccounts request may ask for.
pub const MAX_MULTIPLE_ACCOUNTS: usize = 100;

/// A set of RPC clients tried in order until one of them answers.
pub struct RpcMultiClient {
    rpc_clients: Vec<RpcClient>,
}

impl RpcMultiClient {
    pub fn new_with_timeout_and_commitment(
        rpc_urls: Vec<Url>,
        timeout: Duration,
        commitment_config: CommitmentConfig,
    ) -> Self {
        let clients = rpc_urls
            .iter()
            .map(|rpc_url| {
                RpcClient::new_with_timeout_and_commitment(
                    rpc_url.to_string(),
                    timeout,
                    commitment_config,
                )
            })
            .collect();
        Self {
            rpc_clients: clients,
        }
    }

    /// Fetches `pubkeys` in chunks of [`MAX_MULTIPLE_ACCOUNTS`]. The result is
    /// aligned with `pubkeys`, with `None` for accounts that do not exist.
    pub async fn get_multiple_accounts(
        &self,
        pubkeys: &[Pubkey],
    ) -> anyhow::Result<Vec<Option<Account>>> {
        let mut accounts = Vec::with_capacity(pubkeys.len());
        for chunk in pubkeys.chunks(MAX_MULTIPLE_ACCOUNTS) {
            accounts.extend(self.get_multiple_accounts_chunk(chunk).await?);
        }
        Ok(accounts)
    }

    async fn get_multiple_accounts_chunk(
        &self,
        pubkeys: &[Pubkey],
    ) -> anyhow::Result<Vec<Option<Account>>> {
        for rpc_client in self.rpc_clients.iter() {
            match rpc_client.get_multiple_accounts(pubkeys).await {
                Ok(accounts) => return Ok(accounts),
                Err(e) => tracing::warn!(
                    "getMultipleAccounts failed for rpc endpoint {}: {:?}",
                    rpc_client.url(),
                    e
                ),
            }
        }
        bail!("getMultipleAccounts failed for all rpc endpoints")
    }

    pub async fn get_slot_with_commitment(
        &self,
        commitment_config: CommitmentConfig,
    ) -> anyhow::Result<u64> {
        for rpc_client in self.rpc_clients.iter() {
            match rpc_client.get_slot_with_commitment(commitment_config).await {
                Ok(slot) => return Ok(slot),
                Err(e) => tracing::warn!(
                    "getSlotWithCommitment failed for rpc endpoint {}: {:?}",
                    rpc_client.url(),
                    e
                ),
            }
        }
        bail!("getSlotWithCommitment failed for all rpc endpoints")
    }

    pub async fn get_block_time(&self, slot: u64) -> anyhow::Result<UnixTimestamp> {
        for rpc_client in self.rpc_clients.iter() {
            match rpc_client.get_block_time(slot).await {
                Ok(block_time) => return Ok(block_time),
                Err(e) => tracing::warn!(
                    "getBlockTime failed for rpc endpoint {}: {:?}",
                    rpc_client.url(),
                    e
                ),
            }
        }
        bail!("getBlockTime failed for all rpc endpoints")
    }
}

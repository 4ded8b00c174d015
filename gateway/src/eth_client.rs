// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{Address as EthAddress, BlockId, BlockNumber, H256, U256};
use tap::TapFallible;

use crate::error::{GatewayError, GatewayResult};
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider};
use crate::metrics::GatewayMetrics;
use crate::ttl_cache::TtlCache;
use crate::types::{BlockRef, ChainBlock, ChainTransfer, SignedTransfer, TxReceipt};

/// How long a suggested gas price is reused across payment tasks.
const GAS_PRICE_CACHE_SECS: u64 = 5;
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The chain operations the payment engine depends on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> GatewayResult<u64>;

    async fn latest_block_number(&self) -> GatewayResult<u64>;

    async fn block_by_number(&self, number: u64) -> GatewayResult<Option<ChainBlock>>;

    async fn block_by_hash(&self, hash: H256) -> GatewayResult<Option<BlockRef>>;

    async fn balance_at(&self, address: EthAddress) -> GatewayResult<U256>;

    async fn transaction_receipt(&self, hash: H256) -> GatewayResult<Option<TxReceipt>>;

    async fn pending_nonce_at(&self, address: EthAddress) -> GatewayResult<u64>;

    async fn suggest_gas_price(&self) -> GatewayResult<U256>;

    async fn suggest_gas_tip_cap(&self) -> GatewayResult<U256>;

    async fn send_raw_transaction(&self, tx: &SignedTransfer) -> GatewayResult<()>;

    /// Polls for the receipt of `hash`, `None` if it is not mined in time.
    async fn wait_for_mined(&self, hash: H256, timeout: Duration)
        -> GatewayResult<Option<TxReceipt>>;
}

pub struct EthClient<P> {
    provider: Provider<P>,
    chain_name: String,
    /// Expected chain ID for validation
    expected_chain_id: Option<u64>,
    gas_price_cache: TtlCache<U256>,
}

impl EthClient<MeteredEthHttpProvider> {
    pub async fn new(
        provider_url: &str,
        chain_name: impl Into<String>,
        expected_chain_id: Option<u64>,
        metrics: Arc<GatewayMetrics>,
    ) -> anyhow::Result<Self> {
        let provider = new_metered_eth_provider(provider_url, metrics)?;
        let self_ = Self::from_provider(provider, chain_name, expected_chain_id);
        self_.describe().await?;
        Ok(self_)
    }
}

impl<P> EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn from_provider(
        provider: Provider<P>,
        chain_name: impl Into<String>,
        expected_chain_id: Option<u64>,
    ) -> Self {
        Self {
            provider,
            chain_name: chain_name.into(),
            expected_chain_id,
            gas_price_cache: TtlCache::new(Duration::from_secs(GAS_PRICE_CACHE_SECS)),
        }
    }

    // Validate chain identifier and log connection info
    async fn describe(&self) -> anyhow::Result<()> {
        let chain_id = self.provider.get_chainid().await?.as_u64();
        let block_number = self.provider.get_block_number().await?;

        if let Some(expected) = self.expected_chain_id {
            if chain_id != expected {
                return Err(anyhow::anyhow!(
                    "[{}] Chain ID mismatch: expected {}, got {}. This could indicate connecting to the wrong network!",
                    self.chain_name,
                    expected,
                    chain_id
                ));
            }
            tracing::info!(
                "[{}] EthClient connected to chain {} (verified), current block: {}",
                self.chain_name,
                chain_id,
                block_number
            );
        } else {
            tracing::warn!(
                "[{}] EthClient connected to chain {} (NOT VERIFIED - no expected chain ID set), current block: {}",
                self.chain_name,
                chain_id,
                block_number
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<P> ChainClient for EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn chain_id(&self) -> GatewayResult<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }

    async fn latest_block_number(&self) -> GatewayResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn block_by_number(&self, number: u64) -> GatewayResult<Option<ChainBlock>> {
        let Some(block) = self.provider.get_block_with_txs(number).await? else {
            return Ok(None);
        };
        // Pending blocks carry neither hash nor number.
        let (Some(hash), Some(block_number)) = (block.hash, block.number) else {
            return Ok(None);
        };
        let transfers = block
            .transactions
            .into_iter()
            .filter_map(|tx| {
                tx.to.map(|to| ChainTransfer {
                    hash: tx.hash,
                    to,
                    value: tx.value,
                })
            })
            .collect();
        Ok(Some(ChainBlock {
            number: block_number.as_u64(),
            hash,
            transfers,
        }))
    }

    async fn block_by_hash(&self, hash: H256) -> GatewayResult<Option<BlockRef>> {
        let block = self.provider.get_block(BlockId::Hash(hash)).await?;
        Ok(block.and_then(|b| {
            Some(BlockRef {
                number: b.number?.as_u64(),
                hash: b.hash?,
            })
        }))
    }

    async fn balance_at(&self, address: EthAddress) -> GatewayResult<U256> {
        Ok(self.provider.get_balance(address, None).await?)
    }

    async fn transaction_receipt(&self, hash: H256) -> GatewayResult<Option<TxReceipt>> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;
        Ok(receipt.and_then(|r| {
            Some(TxReceipt {
                block_number: r.block_number?.as_u64(),
                success: r.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            })
        }))
    }

    async fn pending_nonce_at(&self, address: EthAddress) -> GatewayResult<u64> {
        let nonce = self
            .provider
            .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Pending)))
            .await?;
        Ok(nonce.as_u64())
    }

    async fn suggest_gas_price(&self) -> GatewayResult<U256> {
        self.gas_price_cache
            .get_or_fetch(|| async {
                self.provider
                    .get_gas_price()
                    .await
                    .map_err(GatewayError::from)
            })
            .await
    }

    async fn suggest_gas_tip_cap(&self) -> GatewayResult<U256> {
        let tip: U256 = self
            .provider
            .request("eth_maxPriorityFeePerGas", ())
            .await?;
        Ok(tip)
    }

    async fn send_raw_transaction(&self, tx: &SignedTransfer) -> GatewayResult<()> {
        self.provider
            .send_raw_transaction(tx.raw.clone())
            .await
            .tap_err(|e| {
                tracing::warn!(
                    "[{}] Failed to submit tx {:?} from {:?} (nonce {}): {}",
                    self.chain_name,
                    tx.hash,
                    tx.from,
                    tx.nonce,
                    e
                )
            })?;
        tracing::info!(
            "[{}] Submitted tx {:?} from {:?} to {:?} value={} nonce={}",
            self.chain_name,
            tx.hash,
            tx.from,
            tx.to,
            tx.value,
            tx.nonce
        );
        Ok(())
    }

    async fn wait_for_mined(
        &self,
        hash: H256,
        timeout: Duration,
    ) -> GatewayResult<Option<TxReceipt>> {
        let poll = async {
            loop {
                if let Some(receipt) = self.transaction_receipt(hash).await? {
                    return Ok::<_, GatewayError>(receipt);
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(receipt) => receipt.map(Some),
            Err(_) => {
                tracing::warn!(
                    "[{}] Tx {:?} not mined within {:?}",
                    self.chain_name,
                    hash,
                    timeout
                );
                Ok(None)
            }
        }
    }
}

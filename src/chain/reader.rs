//! Polled access to HTLC logs and block tips

use super::finality::{BlockRef, FinalityPolicy};
use super::ChainProvider;
use crate::config::FinalityMode;
use crate::error::SwapResult;
use crate::events::{EventParser, LogEntry};

use async_trait::async_trait;
use ethers::types::{Address, Filter};
use std::sync::Arc;
use tracing::{debug, warn};

/// Read-only view of one chain, as needed for swap monitoring
#[async_trait]
pub trait ChainReader: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Latest block and the highest block considered irreversible
    async fn get_tip(&self) -> SwapResult<BlockRef>;

    /// HTLC events emitted by `contract` in `[from_block, to_block]`, in chain order
    async fn get_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> SwapResult<Vec<LogEntry>>;

    /// Liveness probe. An unhealthy reader means "unknown", never "no event".
    async fn is_healthy(&self) -> bool;
}

/// JSON-RPC backed reader for EVM chains
pub struct EvmChainReader {
    provider: Arc<ChainProvider>,
    parser: EventParser,
    policy: FinalityPolicy,
}

impl EvmChainReader {
    pub fn new(provider: Arc<ChainProvider>, contract: Address, policy: FinalityPolicy) -> Self {
        let parser = EventParser::new(provider.chain_id(), contract);
        Self {
            provider,
            parser,
            policy,
        }
    }
}

#[async_trait]
impl ChainReader for EvmChainReader {
    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    async fn get_tip(&self) -> SwapResult<BlockRef> {
        let latest = self.provider.get_block_number().await?;
        let finalized = match self.policy.mode {
            FinalityMode::Finalized => self.provider.get_finalized_block_number().await?,
            FinalityMode::Confirmations => None,
        };

        let tip = self.policy.block_ref(latest, finalized);
        crate::metrics::record_chain_tip(self.chain_id(), tip.latest, tip.safe);
        Ok(tip)
    }

    async fn get_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> SwapResult<Vec<LogEntry>> {
        let filter = Filter::new()
            .address(contract)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.provider.get_logs(&filter).await?;
        debug!(
            "Chain {}: {} logs in blocks {} to {}",
            self.chain_id(),
            logs.len(),
            from_block,
            to_block
        );

        let mut entries = Vec::with_capacity(logs.len());
        for log in &logs {
            match self.parser.parse_log(log) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!("Failed to parse log on chain {}: {}", self.chain_id(), e),
            }
        }
        entries.sort_by_key(|e| (e.block_number, e.log_index));

        Ok(entries)
    }

    async fn is_healthy(&self) -> bool {
        self.provider.health_check().await
    }
}

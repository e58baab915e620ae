//! Chain finality policy for different L1/L2 networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min), or the
//!   `finalized` tag once the beacon chain has finalized an epoch
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: soft finality from the sequencer, L1 for full
//! - Avalanche: Instant finality (1 block)
//!
//! "Latest" is never treated as final: a policy always needs at least one
//! confirmation or an explicit finalized tag.

use crate::config::{ChainConfig, FinalityMode};

/// Latest and safe block markers for a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    /// Highest block the node knows about
    pub latest: u64,
    /// Highest block treated as irreversible
    pub safe: u64,
}

/// Decides which blocks count as irreversible on one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalityPolicy {
    pub mode: FinalityMode,
    pub confirmation_blocks: u64,
}

impl FinalityPolicy {
    pub fn confirmations(confirmation_blocks: u64) -> Self {
        Self {
            mode: FinalityMode::Confirmations,
            confirmation_blocks: confirmation_blocks.max(1),
        }
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        let confirmation_blocks = config
            .confirmation_blocks
            .unwrap_or_else(|| recommended_confirmations(config.chain_id))
            .max(1);
        Self {
            mode: config.finality,
            confirmation_blocks,
        }
    }

    /// Safe tip for a latest block when finality is depth based
    pub fn safe_tip(&self, latest: u64) -> u64 {
        latest.saturating_sub(self.confirmation_blocks)
    }

    /// Build a block reference. `finalized` is the node's finalized tag, used
    /// only in `Finalized` mode and never allowed above `latest`.
    pub fn block_ref(&self, latest: u64, finalized: Option<u64>) -> BlockRef {
        let safe = match (self.mode, finalized) {
            (FinalityMode::Finalized, Some(finalized)) => finalized.min(latest),
            _ => self.safe_tip(latest),
        };
        BlockRef { latest, safe }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}

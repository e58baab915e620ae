//! Transaction intents handed to the external signer

use super::record::SwapId;
use crate::error::SwapResult;
use crate::hashlock::{Hashlock, Secret};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    Lock,
    Reveal,
    Refund,
}

impl fmt::Display for IntentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentAction::Lock => write!(f, "lock"),
            IntentAction::Reveal => write!(f, "reveal"),
            IntentAction::Refund => write!(f, "refund"),
        }
    }
}

/// A contract call the coordinator wants made on one chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapIntent {
    /// Lock `amount` under `hashlock` until `timelock`, redeemable by `recipient`
    Lock {
        swap_id: SwapId,
        chain_id: u64,
        contract: Address,
        hashlock: Hashlock,
        recipient: Address,
        amount: U256,
        timelock: DateTime<Utc>,
    },
    /// Redeem a lock by presenting the preimage
    Reveal {
        swap_id: SwapId,
        chain_id: u64,
        contract: Address,
        secret: Secret,
    },
    /// Reclaim an expired lock
    Refund {
        swap_id: SwapId,
        chain_id: u64,
        contract: Address,
    },
}

impl SwapIntent {
    pub fn action(&self) -> IntentAction {
        match self {
            SwapIntent::Lock { .. } => IntentAction::Lock,
            SwapIntent::Reveal { .. } => IntentAction::Reveal,
            SwapIntent::Refund { .. } => IntentAction::Refund,
        }
    }

    pub fn swap_id(&self) -> SwapId {
        match self {
            SwapIntent::Lock { swap_id, .. }
            | SwapIntent::Reveal { swap_id, .. }
            | SwapIntent::Refund { swap_id, .. } => *swap_id,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            SwapIntent::Lock { chain_id, .. }
            | SwapIntent::Reveal { chain_id, .. }
            | SwapIntent::Refund { chain_id, .. } => *chain_id,
        }
    }

    pub fn contract(&self) -> Address {
        match self {
            SwapIntent::Lock { contract, .. }
            | SwapIntent::Reveal { contract, .. }
            | SwapIntent::Refund { contract, .. } => *contract,
        }
    }
}

/// Signs and broadcasts swap transactions. Returns the transaction hash.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapSigner: Send + Sync {
    async fn submit(&self, intent: SwapIntent) -> SwapResult<H256>;
}

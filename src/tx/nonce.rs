//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent swaps never reuse a nonce
//! - Releasing a nonce whose transaction was never accepted
//! - Resyncing with the chain after "nonce too low"

use crate::chain::ChainProvider;
use crate::error::{SwapError, SwapResult};

use dashmap::DashMap;
use ethers::prelude::*;
use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
struct ChainNonceState {
    /// Next nonce to hand out
    current: u64,
}

/// Manages nonces across multiple chains
pub struct NonceManager {
    wallet_address: Address,
    chain_state: DashMap<u64, Mutex<ChainNonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    /// Initialize nonce for a chain from its pending transaction count
    pub async fn init_chain(&self, provider: &ChainProvider) -> SwapResult<()> {
        let on_chain_nonce = self.fetch_nonce(provider).await?;
        self.set(provider.chain_id(), on_chain_nonce);
        debug!(
            "Initialized nonce for chain {}: {}",
            provider.chain_id(),
            on_chain_nonce
        );
        Ok(())
    }

    fn set(&self, chain_id: u64, nonce: u64) {
        self.chain_state
            .insert(chain_id, Mutex::new(ChainNonceState { current: nonce }));
    }

    pub fn is_initialized(&self, chain_id: u64) -> bool {
        self.chain_state.contains_key(&chain_id)
    }

    /// Allocate the next nonce for a chain
    pub async fn get_nonce(&self, chain_id: u64) -> SwapResult<u64> {
        let state = self.state(chain_id)?;
        let mut state = state.lock().await;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Release a nonce whose transaction was never accepted
    pub async fn release_nonce(&self, chain_id: u64, nonce: u64) -> SwapResult<()> {
        let state = self.state(chain_id)?;
        let mut state = state.lock().await;

        // Only the most recent allocation can be handed out again
        if state.current == nonce + 1 {
            state.current = nonce;
        }
        Ok(())
    }

    /// Sync with the on-chain pending nonce
    pub async fn sync(&self, provider: &ChainProvider) -> SwapResult<()> {
        let chain_id = provider.chain_id();
        let on_chain_nonce = self.fetch_nonce(provider).await?;

        let state = self.state(chain_id)?;
        let mut state = state.lock().await;
        if state.current < on_chain_nonce {
            warn!(
                "Nonce behind on chain {}: local {}, chain {}",
                chain_id, state.current, on_chain_nonce
            );
            state.current = on_chain_nonce;
        }

        Ok(())
    }

    fn state(
        &self,
        chain_id: u64,
    ) -> SwapResult<dashmap::mapref::one::Ref<'_, u64, Mutex<ChainNonceState>>> {
        self.chain_state
            .get(&chain_id)
            .ok_or_else(|| SwapError::Signer(format!("nonce not initialized for chain {}", chain_id)))
    }

    async fn fetch_nonce(&self, provider: &ChainProvider) -> SwapResult<u64> {
        let nonce = provider
            .http()
            .get_transaction_count(self.wallet_address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| SwapError::ChainConnection {
                chain_id: provider.chain_id(),
                message: format!("nonce: {}", e),
            })?;

        Ok(nonce.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nonces_are_sequential_per_chain() {
        let manager = NonceManager::new(Address::zero());
        manager.set(1, 7);
        manager.set(2, 0);

        assert_eq!(manager.get_nonce(1).await.unwrap(), 7);
        assert_eq!(manager.get_nonce(1).await.unwrap(), 8);
        assert_eq!(manager.get_nonce(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_only_reuses_latest() {
        let manager = NonceManager::new(Address::zero());
        manager.set(1, 0);

        let first = manager.get_nonce(1).await.unwrap();
        let second = manager.get_nonce(1).await.unwrap();

        manager.release_nonce(1, first).await.unwrap();
        assert_eq!(manager.get_nonce(1).await.unwrap(), 2);

        manager.release_nonce(1, 2).await.unwrap();
        assert_eq!(manager.get_nonce(1).await.unwrap(), 2);
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn test_uninitialized_chain() {
        let manager = NonceManager::new(Address::zero());
        assert!(!manager.is_initialized(5));
        assert!(matches!(
            manager.get_nonce(5).await,
            Err(SwapError::Signer(_))
        ));
    }
}

//! Chain module - per-chain readers for swap monitoring
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - The `ChainReader` polling interface and its JSON-RPC implementation
//! - Chain-specific finality policies
//! - A registry of configured chains and their HTLC parameters

pub mod finality;
pub mod provider;
pub mod reader;

pub use finality::{BlockRef, FinalityPolicy};
pub use provider::{ChainProvider, GasPrice};
pub use reader::{ChainReader, EvmChainReader};

use crate::config::Settings;
use crate::error::{SwapError, SwapResult};
use crate::hashlock::HashFunction;

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tracing::info;

/// Everything the coordinator needs to know about one chain
#[derive(Clone)]
pub struct ChainHandle {
    pub name: String,
    pub reader: Arc<dyn ChainReader>,
    /// Deployed HTLC contract
    pub contract: Address,
    /// Hash construction the HTLC contract uses
    pub hash_function: HashFunction,
}

/// Registry of all configured chains, indexed by chain ID
pub struct ChainRegistry {
    chains: DashMap<u64, ChainHandle>,
    /// Providers kept for transaction submission
    providers: DashMap<u64, Arc<ChainProvider>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            providers: DashMap::new(),
        }
    }

    /// Build readers for every enabled chain in the settings
    pub fn from_settings(settings: &Settings) -> SwapResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let contract = chain_config
                .contract()
                .map_err(|e| SwapError::Config(e.to_string()))?;
            let policy = FinalityPolicy::from_config(chain_config);
            let provider = Arc::new(ChainProvider::new(chain_config.clone())?);
            let reader = EvmChainReader::new(provider.clone(), contract, policy);

            registry.providers.insert(chain_config.chain_id, provider);
            registry.register(ChainHandle {
                name: name.clone(),
                reader: Arc::new(reader),
                contract,
                hash_function: chain_config.hash_function,
            });

            info!(
                "Chain {} initialized ({} confirmations, {})",
                chain_config.name, policy.confirmation_blocks, chain_config.hash_function
            );
        }

        Ok(registry)
    }

    /// Register a chain; replaces any existing entry for the same chain ID
    pub fn register(&self, handle: ChainHandle) {
        self.chains.insert(handle.reader.chain_id(), handle);
    }

    /// Get the handle for a chain
    pub fn get(&self, chain_id: u64) -> SwapResult<ChainHandle> {
        self.chains
            .get(&chain_id)
            .map(|h| h.clone())
            .ok_or(SwapError::ChainNotFound { chain_id })
    }

    /// Get the reader for a chain
    pub fn reader(&self, chain_id: u64) -> SwapResult<Arc<dyn ChainReader>> {
        self.get(chain_id).map(|h| h.reader)
    }

    /// Get the JSON-RPC provider for a chain
    pub fn provider(&self, chain_id: u64) -> SwapResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(SwapError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let readers: Vec<(u64, Arc<dyn ChainReader>)> = self
            .chains
            .iter()
            .map(|e| (*e.key(), e.value().reader.clone()))
            .collect();

        let mut results = Vec::new();
        for (chain_id, reader) in readers {
            let healthy = reader.is_healthy().await;
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }

    /// Get all registered chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.chains.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! EVM signer: turns swap intents into signed HTLC contract calls

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainProvider, ChainRegistry, GasPrice};
use crate::config::WalletConfig;
use crate::coordination::{IntentAction, SwapIntent, SwapSigner};
use crate::error::{SwapError, SwapResult};
use crate::hashlock;

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::id;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Contract call for an intent: (to, calldata, value)
pub fn encode_call(intent: &SwapIntent) -> (Address, Bytes, U256) {
    match intent {
        SwapIntent::Lock {
            swap_id,
            contract,
            hashlock,
            recipient,
            amount,
            timelock,
            ..
        } => {
            let mut data = id("lock(bytes32,bytes32,address,uint256)").to_vec();
            data.extend(encode(&[
                Token::FixedBytes(swap_id.0.to_vec()),
                Token::FixedBytes(hashlock.0.to_vec()),
                Token::Address(*recipient),
                Token::Uint(hashlock::timelock_to_word(*timelock)),
            ]));
            (*contract, data.into(), *amount)
        }
        SwapIntent::Reveal {
            swap_id,
            contract,
            secret,
            ..
        } => {
            let mut data = id("redeem(bytes32,bytes32)").to_vec();
            data.extend(encode(&[
                Token::FixedBytes(swap_id.0.to_vec()),
                Token::FixedBytes(secret.as_bytes().to_vec()),
            ]));
            (*contract, data.into(), U256::zero())
        }
        SwapIntent::Refund {
            swap_id, contract, ..
        } => {
            let mut data = id("refund(bytes32)").to_vec();
            data.extend(encode(&[Token::FixedBytes(swap_id.0.to_vec())]));
            (*contract, data.into(), U256::zero())
        }
    }
}

/// Signs and broadcasts HTLC calls with a local key
pub struct EvmSigner {
    chains: Arc<ChainRegistry>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    wallet: LocalWallet,
    config: WalletConfig,
}

impl EvmSigner {
    pub async fn new(chains: Arc<ChainRegistry>, config: WalletConfig) -> SwapResult<Self> {
        let wallet = Self::load_wallet(&config)?;
        let nonce_manager = NonceManager::new(wallet.address());

        info!("Signer initialized with wallet: {:?}", wallet.address());

        for chain_id in chains.connected_chains() {
            if let Ok(provider) = chains.provider(chain_id) {
                if let Err(e) = nonce_manager.init_chain(&provider).await {
                    warn!("Failed to init nonce for chain {}: {}", chain_id, e);
                }
            }
        }

        Ok(Self {
            chains,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            config,
        })
    }

    fn load_wallet(config: &WalletConfig) -> SwapResult<LocalWallet> {
        let key = std::env::var(&config.private_key_env).map_err(|_| {
            SwapError::Config(format!(
                "No wallet configured. Set {}",
                config.private_key_env
            ))
        })?;

        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| SwapError::Config(format!("Invalid private key: {}", e)))
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    fn build_tx(
        &self,
        intent: &SwapIntent,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let (to, data, value) = encode_call(intent);
        let gas_limit = self.gas_estimator.gas_limit(intent.action());

        match gas_price {
            GasPrice::Legacy(price) => TypedTransaction::Legacy(
                TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(to)
                    .data(data)
                    .value(value)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .gas_price(*price)
                    .chain_id(intent.chain_id()),
            ),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(self.wallet.address())
                    .to(to)
                    .data(data)
                    .value(value)
                    .nonce(nonce)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(intent.chain_id()),
            ),
        }
    }

    /// Sign and send with retry. The nonce is released if nothing was accepted.
    async fn send_with_retry(
        &self,
        provider: &ChainProvider,
        intent: &SwapIntent,
    ) -> SwapResult<H256> {
        let chain_id = provider.chain_id();
        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let max_attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let nonce = self.nonce_manager.get_nonce(chain_id).await?;
            let gas_price = self.gas_estimator.get_gas_price(provider).await?;
            let tx = self.build_tx(intent, nonce, &gas_price);

            let signed_tx = match wallet.sign_transaction(&tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    self.nonce_manager.release_nonce(chain_id, nonce).await?;
                    return Err(SwapError::Signer(format!("signing failed: {}", e)));
                }
            };

            let send_timeout = Duration::from_secs(self.config.send_timeout_secs);
            let result = timeout(
                send_timeout,
                provider.http().send_raw_transaction(signed_tx),
            )
            .await;

            match result {
                Ok(Ok(pending_tx)) => {
                    let tx_hash = pending_tx.tx_hash();
                    info!(
                        "{} sent on chain {}: {:?} (attempt {}/{})",
                        intent.action(),
                        chain_id,
                        tx_hash,
                        attempt,
                        max_attempts
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();
                    self.nonce_manager.release_nonce(chain_id, nonce).await?;

                    if error_msg.contains("nonce too low") {
                        warn!("Nonce too low on chain {}, syncing", chain_id);
                        self.nonce_manager.sync(provider).await?;
                    } else if error_msg.contains("insufficient funds") {
                        return Err(SwapError::Signer(format!(
                            "insufficient funds for {} on chain {}",
                            intent.action(),
                            chain_id
                        )));
                    } else {
                        warn!(
                            "{} send failed on chain {} (attempt {}): {}",
                            intent.action(),
                            chain_id,
                            attempt,
                            error_msg
                        );
                    }

                    last_error = Some(SwapError::Signer(error_msg));
                }
                Err(_) => {
                    // The node may still have accepted it; keep the nonce and resync
                    warn!("Transaction send timeout on chain {} (attempt {})", chain_id, attempt);
                    self.nonce_manager.sync(provider).await?;
                    last_error = Some(SwapError::Timeout {
                        operation: format!("{} on chain {}", intent.action(), chain_id),
                    });
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        let err = last_error
            .unwrap_or_else(|| SwapError::Signer("transaction was not sent".to_string()));
        error!("Giving up on {} for swap {}: {}", intent.action(), intent.swap_id(), err);
        Err(err)
    }
}

#[async_trait]
impl SwapSigner for EvmSigner {
    async fn submit(&self, intent: SwapIntent) -> SwapResult<H256> {
        let chain_id = intent.chain_id();
        let provider = self.chains.provider(chain_id)?;

        if !self.nonce_manager.is_initialized(chain_id) {
            self.nonce_manager.init_chain(&provider).await?;
        }

        if intent.action() == IntentAction::Lock {
            let balance = provider
                .http()
                .get_balance(self.wallet.address(), None)
                .await
                .map_err(|e| SwapError::ChainConnection {
                    chain_id,
                    message: e.to_string(),
                })?;
            let (_, _, value) = encode_call(&intent);
            if balance < value {
                return Err(SwapError::Signer(format!(
                    "balance {} on chain {} below lock amount {}",
                    balance, chain_id, value
                )));
            }
        }

        self.send_with_retry(&provider, &intent).await
    }
}

//! Gas limits and buffered gas prices for HTLC calls

use crate::chain::{ChainProvider, GasPrice};
use crate::coordination::IntentAction;
use crate::error::SwapResult;

use ethers::types::U256;
use tracing::debug;

/// Gas estimator for HTLC transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Gas limit for one HTLC call, with buffer
    pub fn gas_limit(&self, action: IntentAction) -> U256 {
        // lock writes a new slot; redeem and refund clear one
        let base_gas = match action {
            IntentAction::Lock => U256::from(150_000),
            IntentAction::Reveal => U256::from(90_000),
            IntentAction::Refund => U256::from(70_000),
        };
        let buffer = base_gas * self.gas_limit_buffer_percent / 100;
        base_gas + buffer
    }

    /// Current gas price for a chain, with buffer
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> SwapResult<GasPrice> {
        let gas_price = self.buffered(provider.get_gas_price().await?);
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), gas_price);
        Ok(gas_price)
    }

    fn buffered(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

//! Transaction submission with nonce management and gas pricing

mod gas;
mod nonce;
mod sender;

pub use gas::GasEstimator;
pub use nonce::NonceManager;
pub use sender::{encode_call, EvmSigner};

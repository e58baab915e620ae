//! Swap coordination
//!
//! The coordinator:
//! 1. Creates swap records and persists every state change
//! 2. Watches both legs of each swap for lock, redeem and refund events
//! 3. Validates the counterparty's lock before anything is revealed
//! 4. Hands lock, reveal and refund intents to the signer

pub mod engine;
pub mod record;
pub mod signer;
pub mod validation;

pub use engine::{SwapCoordinator, SwapParams};
pub use record::{
    ChainEndpoint, Leg, Observation, StateTransition, Submission, SwapId, SwapRecord, SwapRole,
    SwapState,
};
pub use signer::{IntentAction, SwapIntent, SwapSigner};

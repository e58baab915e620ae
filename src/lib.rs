//! Tesseract HTLC - cross-chain atomic swap coordination
//!
//! Drives hash-time-locked swaps between two EVM chains: locks funds,
//! watches the counterparty's lock until it is final, reveals or learns
//! the secret, and refunds once a timelock has passed.

pub mod api;
pub mod chain;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod hashlock;
pub mod metrics;
pub mod state;
pub mod tx;
pub mod watcher;

#[cfg(test)]
mod testing;

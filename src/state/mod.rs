//! Swap record persistence
//!
//! Handles:
//! - The `SwapStore` seam used by the coordinator
//! - PostgreSQL storage with a transition audit table
//! - An in-memory store for tests and single-process runs

mod manager;
mod store;

pub use manager::PgSwapStore;
pub use store::{MemorySwapStore, SwapStore};

//! Persistence seam for swap records

use crate::coordination::{SwapId, SwapRecord};
use crate::error::SwapResult;

use async_trait::async_trait;
use dashmap::DashMap;

/// Durable storage for swap records. `save` must be durable before it returns;
/// when it fails the coordinator rolls its in-memory copy back.
#[async_trait]
pub trait SwapStore: Send + Sync {
    async fn save(&self, record: &SwapRecord) -> SwapResult<()>;

    async fn load(&self, id: &SwapId) -> SwapResult<Option<SwapRecord>>;

    /// Records that still have work to do
    async fn list_active(&self) -> SwapResult<Vec<SwapRecord>>;

    async fn health_check(&self) -> SwapResult<()> {
        Ok(())
    }
}

/// Store keeping serialized records in memory
#[derive(Default)]
pub struct MemorySwapStore {
    records: DashMap<SwapId, String>,
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SwapStore for MemorySwapStore {
    async fn save(&self, record: &SwapRecord) -> SwapResult<()> {
        let json = serde_json::to_string(record)?;
        self.records.insert(record.id, json);
        Ok(())
    }

    async fn load(&self, id: &SwapId) -> SwapResult<Option<SwapRecord>> {
        let Some(json) = self.records.get(id).map(|r| r.value().clone()) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn list_active(&self) -> SwapResult<Vec<SwapRecord>> {
        let serialized: Vec<String> = self.records.iter().map(|r| r.value().clone()).collect();

        let mut active = Vec::new();
        for json in serialized {
            let record: SwapRecord = serde_json::from_str(&json)?;
            if !record.is_terminal() {
                active.push(record);
            }
        }
        active.sort_by_key(|r| r.created_at);
        Ok(active)
    }
}

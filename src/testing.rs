//! In-memory chains, clock and signer for tests

use crate::chain::{BlockRef, ChainReader};
use crate::clock::Clock;
use crate::coordination::{IntentAction, SwapIntent, SwapSigner};
use crate::error::{SwapError, SwapResult};
use crate::events::{HtlcEvent, LogEntry};
use crate::hashlock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ChainState {
    latest: u64,
    logs: Vec<LogEntry>,
    fail_next: u32,
    unreachable: bool,
    auto_mine: bool,
    max_range: u64,
    tx_counter: u64,
}

/// Scriptable chain: blocks are mined by hand (or on every tip query with
/// `auto_mine`), logs can be added and removed to simulate reorgs.
pub struct MockChain {
    chain_id: u64,
    confirmations: u64,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(chain_id: u64, confirmations: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            confirmations,
            state: Mutex::new(ChainState::default()),
        })
    }

    /// Mine one block per `get_tip` call
    pub fn auto_mining(chain_id: u64, confirmations: u64) -> Arc<Self> {
        let chain = Self::new(chain_id, confirmations);
        chain.state.lock().unwrap().auto_mine = true;
        chain
    }

    pub fn mine(&self, blocks: u64) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.latest += blocks;
        state.latest
    }

    /// Include `event` in a newly mined block
    pub fn push_log(&self, contract: Address, event: HtlcEvent) -> LogEntry {
        let mut state = self.state.lock().unwrap();
        state.latest += 1;
        state.tx_counter += 1;
        let entry = LogEntry {
            chain_id: self.chain_id,
            contract,
            block_number: state.latest,
            tx_hash: H256::from_low_u64_be(self.chain_id << 32 | state.tx_counter),
            log_index: 0,
            event,
        };
        state.logs.push(entry.clone());
        entry
    }

    pub fn remove_logs(&self, pred: impl Fn(&LogEntry) -> bool) {
        self.state.lock().unwrap().logs.retain(|log| !pred(log));
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.state.lock().unwrap().logs.clone()
    }

    /// Fail the next `n` RPC calls
    pub fn fail_next(&self, n: u32) {
        self.state.lock().unwrap().fail_next = n;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Widest `get_logs` range requested so far
    pub fn max_requested_range(&self) -> u64 {
        self.state.lock().unwrap().max_range
    }

    fn check_reachable(&self, state: &mut ChainState) -> SwapResult<()> {
        if state.unreachable || state.fail_next > 0 {
            state.fail_next = state.fail_next.saturating_sub(1);
            return Err(SwapError::ChainConnection {
                chain_id: self.chain_id,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_tip(&self) -> SwapResult<BlockRef> {
        let mut state = self.state.lock().unwrap();
        self.check_reachable(&mut state)?;
        if state.auto_mine {
            state.latest += 1;
        }
        Ok(BlockRef {
            latest: state.latest,
            safe: state.latest.saturating_sub(self.confirmations),
        })
    }

    async fn get_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> SwapResult<Vec<LogEntry>> {
        let mut state = self.state.lock().unwrap();
        self.check_reachable(&mut state)?;
        state.max_range = state.max_range.max(to_block - from_block + 1);
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.contract == contract
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn is_healthy(&self) -> bool {
        !self.state.lock().unwrap().unreachable
    }
}

/// Clock moved by hand
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(at),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Signer that lands every intent as a log on the matching mock chain
pub struct ChainSigner {
    address: Address,
    chains: HashMap<u64, Arc<MockChain>>,
    submitted: Mutex<Vec<SwapIntent>>,
    dropping: Mutex<Vec<IntentAction>>,
}

impl ChainSigner {
    pub fn new(address: Address, chains: &[Arc<MockChain>]) -> Arc<Self> {
        Arc::new(Self {
            address,
            chains: chains.iter().map(|c| (c.chain_id, c.clone())).collect(),
            submitted: Mutex::new(Vec::new()),
            dropping: Mutex::new(Vec::new()),
        })
    }

    /// Accept the next intent of this kind but never land it on chain
    pub fn drop_next(&self, action: IntentAction) {
        self.dropping.lock().unwrap().push(action);
    }

    pub fn submitted(&self) -> Vec<SwapIntent> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn count(&self, action: IntentAction) -> usize {
        self.submitted()
            .iter()
            .filter(|intent| intent.action() == action)
            .count()
    }
}

#[async_trait]
impl SwapSigner for ChainSigner {
    async fn submit(&self, intent: SwapIntent) -> SwapResult<H256> {
        let chain = self
            .chains
            .get(&intent.chain_id())
            .ok_or(SwapError::ChainNotFound {
                chain_id: intent.chain_id(),
            })?;

        {
            let mut dropping = self.dropping.lock().unwrap();
            if let Some(pos) = dropping.iter().position(|a| *a == intent.action()) {
                dropping.remove(pos);
                let mut submitted = self.submitted.lock().unwrap();
                submitted.push(intent);
                return Ok(H256::from_low_u64_be(0xdead_0000 + submitted.len() as u64));
            }
        }

        let event = match &intent {
            SwapIntent::Lock {
                swap_id,
                hashlock,
                recipient,
                amount,
                timelock,
                ..
            } => HtlcEvent::Locked {
                swap_id: *swap_id,
                hashlock: *hashlock,
                sender: self.address,
                recipient: *recipient,
                amount: *amount,
                timelock: hashlock::timelock_to_word(*timelock).as_u64(),
            },
            SwapIntent::Reveal {
                swap_id, secret, ..
            } => HtlcEvent::Redeemed {
                swap_id: *swap_id,
                secret: secret.clone(),
            },
            SwapIntent::Refund { swap_id, .. } => HtlcEvent::Refunded { swap_id: *swap_id },
        };

        let entry = chain.push_log(intent.contract(), event);
        self.submitted.lock().unwrap().push(intent);
        Ok(entry.tx_hash)
    }
}

//! HTLC contract event types and parsing
//!
//! Defines the events emitted by the deployed HTLC contracts:
//!
//! ```text
//! Locked(bytes32 indexed swapId, bytes32 indexed hashlock, address indexed sender,
//!        address recipient, uint256 amount, uint256 timelock)
//! Redeemed(bytes32 indexed swapId, bytes32 secret)
//! Refunded(bytes32 indexed swapId)
//! ```

use crate::coordination::SwapId;
use crate::error::{SwapError, SwapResult};
use crate::hashlock::{Hashlock, Secret};

use ethers::types::{Address, Log, H256, U256};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kind of HTLC event, used by watchers to select logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Locked,
    Redeemed,
    Refunded,
}

/// Events emitted by an HTLC contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HtlcEvent {
    /// Funds locked under a hashlock until a timelock
    Locked {
        swap_id: SwapId,
        hashlock: Hashlock,
        sender: Address,
        recipient: Address,
        amount: U256,
        /// Unix seconds
        timelock: u64,
    },

    /// Lock redeemed by presenting the preimage
    Redeemed { swap_id: SwapId, secret: Secret },

    /// Lock reclaimed by its creator after the timelock
    Refunded { swap_id: SwapId },
}

impl HtlcEvent {
    pub fn swap_id(&self) -> SwapId {
        match self {
            HtlcEvent::Locked { swap_id, .. } => *swap_id,
            HtlcEvent::Redeemed { swap_id, .. } => *swap_id,
            HtlcEvent::Refunded { swap_id } => *swap_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            HtlcEvent::Locked { .. } => EventKind::Locked,
            HtlcEvent::Redeemed { .. } => EventKind::Redeemed,
            HtlcEvent::Refunded { .. } => EventKind::Refunded,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            HtlcEvent::Locked { .. } => "locked",
            HtlcEvent::Redeemed { .. } => "redeemed",
            HtlcEvent::Refunded { .. } => "refunded",
        }
    }
}

/// A decoded HTLC log with its chain position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub chain_id: u64,
    pub contract: Address,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub event: HtlcEvent,
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref LOCKED: H256 = H256::from(keccak256(
            "Locked(bytes32,bytes32,address,address,uint256,uint256)"
        ));
        pub static ref REDEEMED: H256 = H256::from(keccak256("Redeemed(bytes32,bytes32)"));
        pub static ref REFUNDED: H256 = H256::from(keccak256("Refunded(bytes32)"));
    }
}

/// Event parser for a single HTLC contract
pub struct EventParser {
    chain_id: u64,
    contract_address: Address,
}

impl EventParser {
    /// Create a new event parser
    pub fn new(chain_id: u64, contract_address: Address) -> Self {
        Self {
            chain_id,
            contract_address,
        }
    }

    /// Parse a log entry. Returns `None` for logs from other contracts,
    /// logs the node marked as removed, pending logs, and unknown topics.
    pub fn parse_log(&self, log: &Log) -> SwapResult<Option<LogEntry>> {
        if log.address != self.contract_address || log.removed == Some(true) {
            return Ok(None);
        }

        let (Some(block_number), Some(tx_hash)) = (log.block_number, log.transaction_hash)
        else {
            return Ok(None);
        };

        let Some(topic) = log.topics.first().copied() else {
            return Ok(None);
        };

        let event = if topic == *topics::LOCKED {
            self.parse_locked(log)?
        } else if topic == *topics::REDEEMED {
            HtlcEvent::Redeemed {
                swap_id: SwapId::from_h256(indexed(log, 1)?),
                secret: Secret::from_bytes(word(&log.data, 0)?),
            }
        } else if topic == *topics::REFUNDED {
            HtlcEvent::Refunded {
                swap_id: SwapId::from_h256(indexed(log, 1)?),
            }
        } else {
            debug!("Chain {}: skipping unknown topic {:?}", self.chain_id, topic);
            return Ok(None);
        };

        Ok(Some(LogEntry {
            chain_id: self.chain_id,
            contract: log.address,
            block_number: block_number.as_u64(),
            tx_hash,
            log_index: log.log_index.map(|i| i.low_u64()).unwrap_or(0),
            event,
        }))
    }

    /// Parse Locked event data
    fn parse_locked(&self, log: &Log) -> SwapResult<HtlcEvent> {
        let swap_id = SwapId::from_h256(indexed(log, 1)?);
        let hashlock = Hashlock::from_h256(indexed(log, 2)?);
        let sender = Address::from_slice(&indexed(log, 3)?.0[12..32]);

        let recipient = Address::from_slice(&word(&log.data, 0)?[12..32]);
        let amount = U256::from_big_endian(&word(&log.data, 1)?);
        let timelock = U256::from_big_endian(&word(&log.data, 2)?);
        if timelock > U256::from(u64::MAX) {
            return Err(SwapError::EventParsing(format!(
                "timelock {} does not fit in u64",
                timelock
            )));
        }

        Ok(HtlcEvent::Locked {
            swap_id,
            hashlock,
            sender,
            recipient,
            amount,
            timelock: timelock.as_u64(),
        })
    }
}

fn indexed(log: &Log, position: usize) -> SwapResult<H256> {
    log.topics.get(position).copied().ok_or_else(|| {
        SwapError::EventParsing(format!("missing indexed topic {}", position))
    })
}

fn word(data: &[u8], index: usize) -> SwapResult<[u8; 32]> {
    let start = index * 32;
    let slice = data.get(start..start + 32).ok_or_else(|| {
        SwapError::EventParsing(format!("log data too short for word {}", index))
    })?;
    let mut out = [0u8; 32];
    out.copy_from_slice(slice);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    fn contract() -> Address {
        Address::from_low_u64_be(0xaa)
    }

    fn base_log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            address: contract(),
            topics,
            data: Bytes::from(data),
            block_number: Some(U64::from(42u64)),
            transaction_hash: Some(H256::repeat_byte(0x11)),
            log_index: Some(U256::from(3u64)),
            ..Default::default()
        }
    }

    fn u256_word(value: U256) -> [u8; 32] {
        let mut out = [0u8; 32];
        value.to_big_endian(&mut out);
        out
    }

    #[test]
    fn test_parse_locked() {
        let swap_id = SwapId([7u8; 32]);
        let hashlock = Hashlock([9u8; 32]);
        let sender = Address::from_low_u64_be(0x51);
        let recipient = Address::from_low_u64_be(0x52);

        let mut data = Vec::new();
        data.extend_from_slice(H256::from(recipient).as_bytes());
        data.extend_from_slice(&u256_word(U256::from(100u64)));
        data.extend_from_slice(&u256_word(U256::from(1_700_003_600u64)));

        let log = base_log(
            vec![
                *topics::LOCKED,
                swap_id.to_h256(),
                hashlock.to_h256(),
                H256::from(sender),
            ],
            data,
        );

        let entry = EventParser::new(5, contract()).parse_log(&log).unwrap().unwrap();
        assert_eq!(entry.chain_id, 5);
        assert_eq!(entry.block_number, 42);
        assert_eq!(entry.log_index, 3);
        assert_eq!(
            entry.event,
            HtlcEvent::Locked {
                swap_id,
                hashlock,
                sender,
                recipient,
                amount: U256::from(100u64),
                timelock: 1_700_003_600,
            }
        );
    }

    #[test]
    fn test_parse_redeemed_carries_secret() {
        let swap_id = SwapId([1u8; 32]);
        let log = base_log(vec![*topics::REDEEMED, swap_id.to_h256()], vec![0x5a; 32]);

        let entry = EventParser::new(1, contract()).parse_log(&log).unwrap().unwrap();
        match entry.event {
            HtlcEvent::Redeemed { swap_id: id, secret } => {
                assert_eq!(id, swap_id);
                assert_eq!(secret.as_bytes(), &[0x5a; 32]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_removed_and_foreign_logs_are_skipped() {
        let parser = EventParser::new(1, contract());
        let swap_id = SwapId([1u8; 32]);

        let mut removed = base_log(vec![*topics::REFUNDED, swap_id.to_h256()], vec![]);
        removed.removed = Some(true);
        assert!(parser.parse_log(&removed).unwrap().is_none());

        let mut foreign = base_log(vec![*topics::REFUNDED, swap_id.to_h256()], vec![]);
        foreign.address = Address::from_low_u64_be(0xbb);
        assert!(parser.parse_log(&foreign).unwrap().is_none());

        let unknown = base_log(vec![H256::repeat_byte(0xee)], vec![]);
        assert!(parser.parse_log(&unknown).unwrap().is_none());
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let swap_id = SwapId([1u8; 32]);
        let log = base_log(vec![*topics::REDEEMED, swap_id.to_h256()], vec![0u8; 16]);
        assert!(EventParser::new(1, contract()).parse_log(&log).is_err());
    }
}

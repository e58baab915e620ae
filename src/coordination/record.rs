//! Durable state of one swap attempt

use super::signer::IntentAction;
use crate::error::{SwapError, SwapResult};
use crate::events::LogEntry;
use crate::hashlock::{self, bytes32_codec, HashFunction, Hashlock, Secret};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Swap correlation key, passed as `bytes32 swapId` to both HTLC contracts
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapId(pub [u8; 32]);

bytes32_codec!(SwapId);

impl SwapId {
    /// Fresh random identifier from the OS CSPRNG
    pub fn random() -> SwapResult<Self> {
        let mut bytes = [0u8; 32];
        hashlock::fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Which side of the swap this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapRole {
    /// Locks on the source chain first and owns the secret
    Initiator,
    /// Solver providing liquidity on the destination chain
    Counterparty,
}

impl SwapRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapRole::Initiator => "initiator",
            SwapRole::Counterparty => "counterparty",
        }
    }
}

/// One of the two chains of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Source,
    Dest,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Source => write!(f, "source"),
            Leg::Dest => write!(f, "dest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    SourceLocked,
    DestLocked,
    SecretRevealed,
    Redeemed,
    TimedOut,
    Refunded,
    Failed,
}

impl SwapState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapState::Created => "created",
            SwapState::SourceLocked => "source_locked",
            SwapState::DestLocked => "dest_locked",
            SwapState::SecretRevealed => "secret_revealed",
            SwapState::Redeemed => "redeemed",
            SwapState::TimedOut => "timed_out",
            SwapState::Refunded => "refunded",
            SwapState::Failed => "failed",
        }
    }

    /// Allowed edges of the swap state machine
    pub fn can_transition_to(&self, next: SwapState) -> bool {
        use SwapState::*;
        matches!(
            (self, next),
            (Created, SourceLocked | TimedOut | Failed)
                | (SourceLocked, DestLocked | TimedOut | Failed)
                | (DestLocked, SourceLocked | SecretRevealed | TimedOut | Failed)
                | (SecretRevealed, Redeemed | Failed)
                | (TimedOut, Refunded | Failed)
                | (Failed, Refunded)
        )
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapState {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "created" => SwapState::Created,
            "source_locked" => SwapState::SourceLocked,
            "dest_locked" => SwapState::DestLocked,
            "secret_revealed" => SwapState::SecretRevealed,
            "redeemed" => SwapState::Redeemed,
            "timed_out" => SwapState::TimedOut,
            "refunded" => SwapState::Refunded,
            "failed" => SwapState::Failed,
            other => return Err(SwapError::Internal(format!("unknown swap state {}", other))),
        };
        Ok(state)
    }
}

/// Chain identifier plus the HTLC contract deployed on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: u64,
    pub contract: Address,
}

/// An HTLC event seen on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub entry: LogEntry,
    /// At or below the chain's safe tip when last seen
    pub confirmed: bool,
    pub observed_at: DateTime<Utc>,
}

/// Signer receipt for an intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub action: IntentAction,
    pub leg: Leg,
    pub chain_id: u64,
    pub tx_hash: H256,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SwapState,
    pub to: SwapState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// The unit of work. Mutated only through the coordinator's transition functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub id: SwapId,
    pub role: SwapRole,
    /// Write-once; see `set_secret`
    pub secret: Option<Secret>,
    pub hashlock: Hashlock,
    pub hash_function: HashFunction,
    pub source: ChainEndpoint,
    pub dest: ChainEndpoint,
    /// Quantity locked on the source chain, smallest unit
    pub amount: U256,
    /// Minimum quantity the destination lock must carry
    pub dest_amount: U256,
    pub source_timelock: DateTime<Utc>,
    pub dest_timelock: DateTime<Utc>,
    pub source_recipient: Address,
    pub dest_recipient: Address,
    pub state: SwapState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StateTransition>,
    /// Scans start here; at or behind the safe tip when the swap was created
    pub source_start_block: u64,
    pub dest_start_block: u64,
    pub source_lock: Option<Observation>,
    pub dest_lock: Option<Observation>,
    pub source_redeem: Option<Observation>,
    pub dest_redeem: Option<Observation>,
    pub refund: Option<Observation>,
    pub submissions: Vec<Submission>,
    pub failure: Option<String>,
    pub last_error: Option<String>,
}

impl SwapRecord {
    /// The leg this process locks funds on
    pub fn own_leg(&self) -> Leg {
        match self.role {
            SwapRole::Initiator => Leg::Source,
            SwapRole::Counterparty => Leg::Dest,
        }
    }

    /// The leg the other party locks funds on
    pub fn counter_leg(&self) -> Leg {
        match self.own_leg() {
            Leg::Source => Leg::Dest,
            Leg::Dest => Leg::Source,
        }
    }

    pub fn endpoint(&self, leg: Leg) -> ChainEndpoint {
        match leg {
            Leg::Source => self.source,
            Leg::Dest => self.dest,
        }
    }

    pub fn timelock(&self, leg: Leg) -> DateTime<Utc> {
        match leg {
            Leg::Source => self.source_timelock,
            Leg::Dest => self.dest_timelock,
        }
    }

    pub fn start_block(&self, leg: Leg) -> u64 {
        match leg {
            Leg::Source => self.source_start_block,
            Leg::Dest => self.dest_start_block,
        }
    }

    /// Amount locked on a leg
    pub fn leg_amount(&self, leg: Leg) -> U256 {
        match leg {
            Leg::Source => self.amount,
            Leg::Dest => self.dest_amount,
        }
    }

    /// Who may redeem the lock on a leg
    pub fn recipient(&self, leg: Leg) -> Address {
        match leg {
            Leg::Source => self.source_recipient,
            Leg::Dest => self.dest_recipient,
        }
    }

    pub fn lock(&self, leg: Leg) -> Option<&Observation> {
        match leg {
            Leg::Source => self.source_lock.as_ref(),
            Leg::Dest => self.dest_lock.as_ref(),
        }
    }

    pub fn set_lock(&mut self, leg: Leg, observation: Option<Observation>) {
        match leg {
            Leg::Source => self.source_lock = observation,
            Leg::Dest => self.dest_lock = observation,
        }
    }

    pub fn redeem(&self, leg: Leg) -> Option<&Observation> {
        match leg {
            Leg::Source => self.source_redeem.as_ref(),
            Leg::Dest => self.dest_redeem.as_ref(),
        }
    }

    pub fn set_redeem(&mut self, leg: Leg, observation: Observation) {
        match leg {
            Leg::Source => self.source_redeem = Some(observation),
            Leg::Dest => self.dest_redeem = Some(observation),
        }
    }

    pub fn submission(&self, action: IntentAction, leg: Leg) -> Option<&Submission> {
        self.submissions
            .iter()
            .rev()
            .find(|s| s.action == action && s.leg == leg)
    }

    pub fn clear_submission(&mut self, action: IntentAction, leg: Leg) {
        self.submissions
            .retain(|s| !(s.action == action && s.leg == leg));
    }

    /// Our own lock is on chain and has been neither redeemed nor refunded
    pub fn refund_required(&self) -> bool {
        let leg = self.own_leg();
        self.lock(leg).is_some() && self.redeem(leg).is_none() && self.refund.is_none()
    }

    /// No further work: swap completed, refunded, or failed with nothing locked
    pub fn is_terminal(&self) -> bool {
        match self.state {
            SwapState::Redeemed | SwapState::Refunded => true,
            SwapState::Failed => !self.refund_required(),
            _ => false,
        }
    }

    /// The secret may be shown outside the process once it is public on chain
    pub fn secret_is_public(&self) -> bool {
        matches!(self.state, SwapState::SecretRevealed | SwapState::Redeemed)
    }

    /// Store the secret. Write-once: a different second value, or one that
    /// does not open the hashlock, is rejected.
    pub fn set_secret(&mut self, secret: Secret) -> SwapResult<()> {
        if !hashlock::verify(&secret, &self.hashlock, self.hash_function) {
            return Err(SwapError::Validation(format!(
                "secret does not open hashlock {} for swap {}",
                self.hashlock, self.id
            )));
        }
        match &self.secret {
            Some(existing) if *existing != secret => Err(SwapError::Validation(format!(
                "secret already set for swap {}",
                self.id
            ))),
            _ => {
                self.secret = Some(secret);
                Ok(())
            }
        }
    }

    /// Append an audit entry and move to `to`. Callers check the edge first.
    pub fn record_transition(&mut self, to: SwapState, at: DateTime<Utc>, reason: Option<String>) {
        self.history.push(StateTransition {
            from: self.state,
            to,
            at,
            reason,
        });
        self.state = to;
        self.updated_at = at;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::HtlcEvent;
    use chrono::Duration;

    pub(crate) fn sample_record(role: SwapRole) -> SwapRecord {
        let now = Utc::now();
        let secret = Secret::from_bytes([0x42; 32]);
        let hashlock = hashlock::commit(&secret, HashFunction::Sha256);
        SwapRecord {
            id: SwapId([1u8; 32]),
            role,
            secret: match role {
                SwapRole::Initiator => Some(secret),
                SwapRole::Counterparty => None,
            },
            hashlock,
            hash_function: HashFunction::Sha256,
            source: ChainEndpoint {
                chain_id: 1,
                contract: Address::from_low_u64_be(0xaa),
            },
            dest: ChainEndpoint {
                chain_id: 2,
                contract: Address::from_low_u64_be(0xbb),
            },
            amount: U256::from(100u64),
            dest_amount: U256::from(100u64),
            source_timelock: now + Duration::seconds(7200),
            dest_timelock: now + Duration::seconds(3600),
            source_recipient: Address::from_low_u64_be(0x51),
            dest_recipient: Address::from_low_u64_be(0x52),
            state: SwapState::Created,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            source_start_block: 10,
            dest_start_block: 20,
            source_lock: None,
            dest_lock: None,
            source_redeem: None,
            dest_redeem: None,
            refund: None,
            submissions: Vec::new(),
            failure: None,
            last_error: None,
        }
    }

    fn observation(record: &SwapRecord, event: HtlcEvent) -> Observation {
        Observation {
            entry: LogEntry {
                chain_id: record.source.chain_id,
                contract: record.source.contract,
                block_number: 11,
                tx_hash: H256::repeat_byte(1),
                log_index: 0,
                event,
            },
            confirmed: true,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_states_are_never_left() {
        let all = [
            SwapState::Created,
            SwapState::SourceLocked,
            SwapState::DestLocked,
            SwapState::SecretRevealed,
            SwapState::Redeemed,
            SwapState::TimedOut,
            SwapState::Refunded,
            SwapState::Failed,
        ];
        for next in all {
            assert!(!SwapState::Redeemed.can_transition_to(next));
            assert!(!SwapState::Refunded.can_transition_to(next));
        }
        assert!(SwapState::Failed.can_transition_to(SwapState::Refunded));
        assert!(!SwapState::Failed.can_transition_to(SwapState::Created));
        assert!(SwapState::DestLocked.can_transition_to(SwapState::SourceLocked));
        assert!(!SwapState::SecretRevealed.can_transition_to(SwapState::DestLocked));
    }

    #[test]
    fn test_state_string_codec() {
        for state in [SwapState::TimedOut, SwapState::SecretRevealed, SwapState::Failed] {
            assert_eq!(state.as_str().parse::<SwapState>().unwrap(), state);
        }
        assert!("unknown".parse::<SwapState>().is_err());
    }

    #[test]
    fn test_secret_is_write_once() {
        let mut record = sample_record(SwapRole::Counterparty);
        let good = Secret::from_bytes([0x42; 32]);

        let err = record.set_secret(Secret::from_bytes([0x43; 32])).unwrap_err();
        assert!(matches!(err, SwapError::Validation(_)));
        assert!(record.secret.is_none());

        record.set_secret(good.clone()).unwrap();
        // Same value again is a no-op
        record.set_secret(good.clone()).unwrap();
        assert_eq!(record.secret, Some(good));
    }

    #[test]
    fn test_failed_with_locked_funds_is_not_terminal() {
        let mut record = sample_record(SwapRole::Initiator);
        record.record_transition(SwapState::Failed, Utc::now(), Some("hashlock mismatch".into()));
        assert!(record.is_terminal());

        let lock = observation(
            &record,
            HtlcEvent::Locked {
                swap_id: record.id,
                hashlock: record.hashlock,
                sender: record.dest_recipient,
                recipient: record.source_recipient,
                amount: record.amount,
                timelock: record.source_timelock.timestamp() as u64,
            },
        );
        record.set_lock(Leg::Source, Some(lock));
        assert!(record.refund_required());
        assert!(!record.is_terminal());

        let refund = observation(&record, HtlcEvent::Refunded { swap_id: record.id });
        record.refund = Some(refund);
        assert!(record.is_terminal());
    }

    #[test]
    fn test_record_transition_keeps_history() {
        let mut record = sample_record(SwapRole::Initiator);
        let at = Utc::now();
        record.record_transition(SwapState::SourceLocked, at, None);
        record.record_transition(SwapState::DestLocked, at, None);

        assert_eq!(record.state, SwapState::DestLocked);
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[0].from, SwapState::Created);
        assert_eq!(record.history[1].to, SwapState::DestLocked);
        assert_eq!(record.updated_at, at);
    }
}

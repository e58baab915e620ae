//! Parameter checks applied to observed lock events before any secret is exposed

use super::record::{Leg, SwapRecord, SwapRole};
use crate::error::{SwapError, SwapResult};
use crate::events::{HtlcEvent, LogEntry};
use crate::hashlock::{self, Hashlock};

use chrono::{DateTime, Duration, Utc};
use ethers::types::{Address, U256};

/// Terms of a `Locked` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTerms {
    pub hashlock: Hashlock,
    pub recipient: Address,
    pub amount: U256,
    pub timelock: DateTime<Utc>,
}

impl LockTerms {
    pub fn from_entry(entry: &LogEntry) -> SwapResult<Self> {
        match &entry.event {
            HtlcEvent::Locked {
                hashlock,
                recipient,
                amount,
                timelock,
                ..
            } => Ok(Self {
                hashlock: *hashlock,
                recipient: *recipient,
                amount: *amount,
                timelock: hashlock::timelock_from_secs(*timelock)?,
            }),
            other => Err(SwapError::Validation(format!(
                "expected a locked event, got {}",
                other.name()
            ))),
        }
    }
}

/// Common checks for a lock on `leg`: hashlock, minimum amount, recipient
fn check_common(record: &SwapRecord, leg: Leg, terms: &LockTerms) -> SwapResult<()> {
    if terms.hashlock != record.hashlock {
        return Err(SwapError::Validation(format!(
            "hashlock mismatch on {} lock: expected {}, observed {}",
            leg, record.hashlock, terms.hashlock
        )));
    }

    let minimum = record.leg_amount(leg);
    if terms.amount < minimum {
        return Err(SwapError::Validation(format!(
            "amount below minimum on {} lock: expected at least {}, observed {}",
            leg, minimum, terms.amount
        )));
    }

    let recipient = record.recipient(leg);
    if terms.recipient != recipient {
        return Err(SwapError::Validation(format!(
            "recipient mismatch on {} lock: expected {:?}, observed {:?}",
            leg, recipient, terms.recipient
        )));
    }

    Ok(())
}

/// Validate the other party's lock.
///
/// The initiator accepts a destination lock that expires at least `margin`
/// before its own source lock and leaves `min_reveal_window` to act. The
/// counterparty accepts a source lock that outlives its destination lock by
/// `margin`.
pub fn validate_counter_lock(
    record: &SwapRecord,
    entry: &LogEntry,
    now: DateTime<Utc>,
    margin: Duration,
    min_reveal_window: Duration,
) -> SwapResult<LockTerms> {
    let leg = record.counter_leg();
    let terms = LockTerms::from_entry(entry)?;
    check_common(record, leg, &terms)?;

    match record.role {
        SwapRole::Initiator => {
            if terms.timelock + margin > record.source_timelock {
                return Err(SwapError::Validation(format!(
                    "dest timelock {} leaves less than {}s before source timelock {}",
                    terms.timelock,
                    margin.num_seconds(),
                    record.source_timelock
                )));
            }
            if terms.timelock < now + min_reveal_window {
                return Err(SwapError::Validation(format!(
                    "dest timelock {} leaves less than {}s to reveal",
                    terms.timelock,
                    min_reveal_window.num_seconds()
                )));
            }
        }
        SwapRole::Counterparty => {
            if terms.timelock < record.dest_timelock + margin {
                return Err(SwapError::Validation(format!(
                    "source timelock {} is less than {}s after dest timelock {}",
                    terms.timelock,
                    margin.num_seconds(),
                    record.dest_timelock
                )));
            }
        }
    }

    Ok(terms)
}

/// Sanity check on our own lock once it is seen on chain
pub fn validate_own_lock(record: &SwapRecord, entry: &LogEntry) -> SwapResult<LockTerms> {
    let leg = record.own_leg();
    let terms = LockTerms::from_entry(entry)?;
    if terms.hashlock != record.hashlock {
        return Err(SwapError::Validation(format!(
            "own {} lock carries hashlock {}, expected {}",
            leg, terms.hashlock, record.hashlock
        )));
    }
    if terms.amount < record.leg_amount(leg) {
        return Err(SwapError::Validation(format!(
            "own {} lock carries {}, expected {}",
            leg,
            terms.amount,
            record.leg_amount(leg)
        )));
    }
    Ok(terms)
}

/// Whether revealing now still leaves `min_reveal_window` before the
/// destination lock expires
pub fn reveal_window_open(
    dest_timelock: DateTime<Utc>,
    now: DateTime<Utc>,
    min_reveal_window: Duration,
) -> bool {
    now + min_reveal_window <= dest_timelock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::record::tests::sample_record;
    use crate::hashlock::Hashlock;
    use ethers::types::H256;

    fn lock_entry(record: &SwapRecord, leg: Leg, edit: impl FnOnce(&mut LockTerms)) -> LogEntry {
        let mut terms = LockTerms {
            hashlock: record.hashlock,
            recipient: record.recipient(leg),
            amount: record.leg_amount(leg),
            timelock: record.timelock(leg),
        };
        edit(&mut terms);
        let endpoint = record.endpoint(leg);
        LogEntry {
            chain_id: endpoint.chain_id,
            contract: endpoint.contract,
            block_number: 30,
            tx_hash: H256::repeat_byte(3),
            log_index: 0,
            event: HtlcEvent::Locked {
                swap_id: record.id,
                hashlock: terms.hashlock,
                sender: Address::from_low_u64_be(0x99),
                recipient: terms.recipient,
                amount: terms.amount,
                timelock: terms.timelock.timestamp() as u64,
            },
        }
    }

    fn margin() -> Duration {
        Duration::seconds(1800)
    }

    fn window() -> Duration {
        Duration::seconds(600)
    }

    #[test]
    fn test_initiator_accepts_matching_dest_lock() {
        let record = sample_record(SwapRole::Initiator);
        let entry = lock_entry(&record, Leg::Dest, |_| {});
        let terms =
            validate_counter_lock(&record, &entry, Utc::now(), margin(), window()).unwrap();
        assert_eq!(terms.amount, record.dest_amount);
    }

    #[test]
    fn test_rejects_hashlock_mismatch() {
        let record = sample_record(SwapRole::Initiator);
        let entry = lock_entry(&record, Leg::Dest, |t| t.hashlock = Hashlock([0xee; 32]));
        let err =
            validate_counter_lock(&record, &entry, Utc::now(), margin(), window()).unwrap_err();
        assert!(err.to_string().contains("hashlock mismatch"));
    }

    #[test]
    fn test_rejects_short_amount_exactly() {
        let record = sample_record(SwapRole::Initiator);
        let entry = lock_entry(&record, Leg::Dest, |t| t.amount = t.amount - U256::one());
        assert!(validate_counter_lock(&record, &entry, Utc::now(), margin(), window()).is_err());

        let entry = lock_entry(&record, Leg::Dest, |t| t.amount = t.amount + U256::one());
        assert!(validate_counter_lock(&record, &entry, Utc::now(), margin(), window()).is_ok());
    }

    #[test]
    fn test_rejects_wrong_recipient() {
        let record = sample_record(SwapRole::Initiator);
        let entry = lock_entry(&record, Leg::Dest, |t| {
            t.recipient = Address::from_low_u64_be(0xdead)
        });
        assert!(validate_counter_lock(&record, &entry, Utc::now(), margin(), window()).is_err());
    }

    #[test]
    fn test_initiator_rejects_dest_timelock_inside_margin() {
        let record = sample_record(SwapRole::Initiator);
        let entry = lock_entry(&record, Leg::Dest, |t| {
            t.timelock = record.source_timelock - Duration::seconds(60)
        });
        assert!(validate_counter_lock(&record, &entry, Utc::now(), margin(), window()).is_err());
    }

    #[test]
    fn test_initiator_rejects_nearly_expired_dest_lock() {
        let record = sample_record(SwapRole::Initiator);
        let now = Utc::now();
        let entry = lock_entry(&record, Leg::Dest, |t| t.timelock = now + Duration::seconds(60));
        assert!(validate_counter_lock(&record, &entry, now, margin(), window()).is_err());
    }

    #[test]
    fn test_counterparty_checks_source_timelock() {
        let record = sample_record(SwapRole::Counterparty);
        let good = lock_entry(&record, Leg::Source, |_| {});
        assert!(validate_counter_lock(&record, &good, Utc::now(), margin(), window()).is_ok());

        let short = lock_entry(&record, Leg::Source, |t| {
            t.timelock = record.dest_timelock + Duration::seconds(10)
        });
        assert!(validate_counter_lock(&record, &short, Utc::now(), margin(), window()).is_err());
    }

    #[test]
    fn test_non_lock_event_is_rejected() {
        let record = sample_record(SwapRole::Initiator);
        let mut entry = lock_entry(&record, Leg::Source, |_| {});
        entry.event = HtlcEvent::Refunded { swap_id: record.id };
        assert!(validate_own_lock(&record, &entry).is_err());
    }

    #[test]
    fn test_reveal_window() {
        let now = Utc::now();
        assert!(reveal_window_open(now + Duration::seconds(600), now, window()));
        assert!(!reveal_window_open(now + Duration::seconds(599), now, window()));
    }
}

//! Swap coordinator: owns swap records and drives each one through the HTLC protocol

use super::record::{
    ChainEndpoint, Leg, Observation, Submission, SwapId, SwapRecord, SwapRole, SwapState,
};
use super::signer::{IntentAction, SwapIntent, SwapSigner};
use super::validation::{self, LockTerms};
use crate::chain::ChainRegistry;
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::error::{SwapError, SwapResult};
use crate::events::{EventKind, HtlcEvent, LogEntry};
use crate::hashlock::{self, Hashlock};
use crate::state::SwapStore;
use crate::watcher::{event_matcher, LockWatcher, WatchEvent, WatchRequest};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Parameters of a new swap
#[derive(Debug, Clone)]
pub struct SwapParams {
    pub role: SwapRole,
    /// Generated for initiators when absent; required for counterparties
    pub swap_id: Option<SwapId>,
    /// Required for counterparties; initiators derive it from a fresh secret
    pub hashlock: Option<Hashlock>,
    pub source_chain: u64,
    pub dest_chain: u64,
    pub amount: U256,
    pub dest_amount: U256,
    pub source_timelock: DateTime<Utc>,
    pub dest_timelock: DateTime<Utc>,
    pub source_recipient: Address,
    pub dest_recipient: Address,
    /// First source block to scan. A counterparty joining after the initiator
    /// locked passes the lock's block; otherwise a lookback is applied.
    pub source_from_block: Option<u64>,
}

/// What a driver is waiting for, derived from role and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Submit our lock and wait for it to confirm
    AwaitOwnLock,
    /// Wait for the other party's lock and validate it
    AwaitCounterLock,
    /// Initiator: wait for our dest redeem to confirm, resubmitting if it drops
    ConfirmReveal,
    /// Initiator: dest redeem confirmed, wait for the solver to claim the source lock
    AwaitCounterRedeem,
    /// Counterparty: wait for the initiator to reveal the secret on dest
    AwaitSecret,
    /// Counterparty: claim the source lock with the learned secret
    Claim,
    /// Reclaim our own lock after its timelock
    Refund,
}

impl Phase {
    fn of(record: &SwapRecord) -> Option<Phase> {
        if record.is_terminal() {
            return None;
        }

        let phase = match (record.role, record.state) {
            (SwapRole::Initiator, SwapState::Created) => Phase::AwaitOwnLock,
            (SwapRole::Initiator, SwapState::SourceLocked | SwapState::DestLocked) => {
                Phase::AwaitCounterLock
            }
            (SwapRole::Initiator, SwapState::SecretRevealed) => {
                match record.redeem(Leg::Dest) {
                    Some(_) => Phase::AwaitCounterRedeem,
                    None => Phase::ConfirmReveal,
                }
            }
            (SwapRole::Counterparty, SwapState::Created) => Phase::AwaitCounterLock,
            (SwapRole::Counterparty, SwapState::SourceLocked) => Phase::AwaitOwnLock,
            (SwapRole::Counterparty, SwapState::DestLocked) => Phase::AwaitSecret,
            (SwapRole::Counterparty, SwapState::SecretRevealed) => Phase::Claim,
            (_, SwapState::TimedOut | SwapState::Failed) => Phase::Refund,
            (_, SwapState::Redeemed | SwapState::Refunded) => return None,
        };
        Some(phase)
    }
}

/// Per-swap runtime state: the authoritative record plus its watchers and driver
struct SwapSlot {
    id: SwapId,
    record: Mutex<SwapRecord>,
    source_watcher: LockWatcher,
    dest_watcher: LockWatcher,
    cancel: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SwapSlot {
    fn watcher(&self, leg: Leg) -> &LockWatcher {
        match leg {
            Leg::Source => &self.source_watcher,
            Leg::Dest => &self.dest_watcher,
        }
    }

    async fn stop_watchers(&self) {
        self.source_watcher.stop().await;
        self.dest_watcher.stop().await;
    }

    /// Next watcher result, or `Stopped` once the driver is cancelled.
    /// Drivers only stop at these waits, never inside a save.
    async fn next_event(&self, rx: &mut mpsc::Receiver<WatchEvent>) -> SwapResult<WatchEvent> {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow_and_update() {
            return Err(SwapError::Stopped);
        }
        tokio::select! {
            event = rx.recv() => event
                .ok_or_else(|| SwapError::Internal("watcher closed without a result".to_string())),
            _ = cancel.changed() => Err(SwapError::Stopped),
        }
    }

    async fn pause(&self, period: std::time::Duration) -> SwapResult<()> {
        let mut cancel = self.cancel.subscribe();
        if *cancel.borrow_and_update() {
            return Err(SwapError::Stopped);
        }
        tokio::select! {
            _ = sleep(period) => Ok(()),
            _ = cancel.changed() => Err(SwapError::Stopped),
        }
    }
}

/// Coordinates HTLC swaps across chains
pub struct SwapCoordinator {
    chains: Arc<ChainRegistry>,
    store: Arc<dyn SwapStore>,
    signer: Arc<dyn SwapSigner>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    swaps: DashMap<SwapId, Arc<SwapSlot>>,
}

impl SwapCoordinator {
    pub fn new(
        chains: Arc<ChainRegistry>,
        store: Arc<dyn SwapStore>,
        signer: Arc<dyn SwapSigner>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            chains,
            store,
            signer,
            clock,
            config,
            swaps: DashMap::new(),
        }
    }

    /// Validate parameters, create and persist the record, and start its driver.
    /// Nothing is submitted to the signer before this returns successfully.
    pub async fn initiate(self: &Arc<Self>, params: SwapParams) -> SwapResult<SwapRecord> {
        let now = self.clock.now();

        if params.source_chain == params.dest_chain {
            return Err(SwapError::Config(
                "source and destination chains must differ".to_string(),
            ));
        }
        let source = self.chains.get(params.source_chain).map_err(|_| {
            SwapError::Config(format!("unknown source chain {}", params.source_chain))
        })?;
        let dest = self.chains.get(params.dest_chain).map_err(|_| {
            SwapError::Config(format!("unknown destination chain {}", params.dest_chain))
        })?;

        if source.hash_function != dest.hash_function {
            return Err(SwapError::Config(format!(
                "hash function mismatch: chain {} uses {}, chain {} uses {}",
                params.source_chain, source.hash_function, params.dest_chain, dest.hash_function
            )));
        }

        if params.amount.is_zero() || params.dest_amount.is_zero() {
            return Err(SwapError::Validation("swap amounts must be non-zero".to_string()));
        }

        let source_timelock = whole_seconds(params.source_timelock)?;
        let dest_timelock = whole_seconds(params.dest_timelock)?;
        let margin = self.config.safety_margin();
        if dest_timelock + margin > source_timelock {
            return Err(SwapError::Config(format!(
                "dest timelock {} must be at least {}s before source timelock {}",
                dest_timelock,
                margin.num_seconds(),
                source_timelock
            )));
        }
        if dest_timelock <= now + self.config.min_reveal_window() {
            return Err(SwapError::Config(format!(
                "dest timelock {} leaves no time to reveal",
                dest_timelock
            )));
        }

        let (id, secret, hashlock) = match params.role {
            SwapRole::Initiator => {
                if params.hashlock.is_some() {
                    return Err(SwapError::Config(
                        "an initiator derives its own hashlock".to_string(),
                    ));
                }
                let secret = hashlock::generate_secret()?;
                let hashlock = hashlock::commit(&secret, source.hash_function);
                let id = match params.swap_id {
                    Some(id) => id,
                    None => SwapId::random()?,
                };
                (id, Some(secret), hashlock)
            }
            SwapRole::Counterparty => {
                let id = params.swap_id.ok_or_else(|| {
                    SwapError::Config("a counterparty swap needs the initiator's swap id".to_string())
                })?;
                let hashlock = params.hashlock.ok_or_else(|| {
                    SwapError::Config("a counterparty swap needs the initiator's hashlock".to_string())
                })?;
                (id, None, hashlock)
            }
        };

        if self.swaps.contains_key(&id) || self.store.load(&id).await?.is_some() {
            return Err(SwapError::Config(format!("swap {} already exists", id)));
        }

        let source_tip = source.reader.get_tip().await?;
        let dest_tip = dest.reader.get_tip().await?;
        let source_start_block = match (params.source_from_block, params.role) {
            (Some(block), _) => block,
            (None, SwapRole::Initiator) => source_tip.safe,
            (None, SwapRole::Counterparty) => source_tip
                .safe
                .saturating_sub(self.config.counterparty_lookback_blocks),
        };

        let record = SwapRecord {
            id,
            role: params.role,
            secret,
            hashlock,
            hash_function: source.hash_function,
            source: ChainEndpoint {
                chain_id: params.source_chain,
                contract: source.contract,
            },
            dest: ChainEndpoint {
                chain_id: params.dest_chain,
                contract: dest.contract,
            },
            amount: params.amount,
            dest_amount: params.dest_amount,
            source_timelock,
            dest_timelock,
            source_recipient: params.source_recipient,
            dest_recipient: params.dest_recipient,
            state: SwapState::Created,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            source_start_block,
            dest_start_block: dest_tip.safe,
            source_lock: None,
            dest_lock: None,
            source_redeem: None,
            dest_redeem: None,
            refund: None,
            submissions: Vec::new(),
            failure: None,
            last_error: None,
        };

        self.store.save(&record).await?;
        crate::metrics::record_swap_initiated(record.role);
        info!(
            "Swap {} initiated as {} (chain {} -> chain {}, amount {}, hashlock {})",
            record.id,
            record.role.as_str(),
            record.source.chain_id,
            record.dest.chain_id,
            record.amount,
            record.hashlock
        );

        self.spawn(record.clone()).await?;
        Ok(record)
    }

    /// Current record, from the running driver or the store
    pub async fn get(&self, id: &SwapId) -> SwapResult<SwapRecord> {
        let slot = self.swaps.get(id).map(|s| s.value().clone());
        if let Some(slot) = slot {
            return Ok(slot.record.lock().await.clone());
        }

        self.store
            .load(id)
            .await?
            .ok_or_else(|| SwapError::SwapNotFound {
                swap_id: id.to_string(),
            })
    }

    /// Records with work remaining, whether or not a driver is running
    pub async fn list_active(&self) -> SwapResult<Vec<SwapRecord>> {
        self.store.list_active().await
    }

    /// Number of swaps with a running driver
    pub fn running(&self) -> usize {
        self.swaps.len()
    }

    /// Start a driver for every active record in the store
    pub async fn resume_all(self: &Arc<Self>) -> SwapResult<usize> {
        let records = self.store.list_active().await?;
        let mut resumed = 0;

        for record in records {
            if self.swaps.contains_key(&record.id) {
                continue;
            }
            let id = record.id;
            let state = record.state;
            match self.spawn(record).await {
                Ok(()) => {
                    info!("Resumed swap {} in state {}", id, state);
                    resumed += 1;
                }
                Err(e) => error!("Failed to resume swap {}: {}", id, e),
            }
        }

        Ok(resumed)
    }

    /// Stop a swap's driver and watchers. The record stays persisted as is.
    pub async fn cancel(&self, id: &SwapId) -> SwapResult<SwapRecord> {
        let (_, slot) = self
            .swaps
            .remove(id)
            .ok_or_else(|| SwapError::SwapNotFound {
                swap_id: id.to_string(),
            })?;

        self.stop_slot(&slot).await;
        let record = slot.record.lock().await.clone();
        info!("Swap {} cancelled in state {}", id, record.state);
        Ok(record)
    }

    /// Stop every driver and persist any in-memory state the store is missing.
    /// A stored record newer than the in-memory one is left alone.
    pub async fn shutdown(&self) -> SwapResult<()> {
        let ids: Vec<SwapId> = self.swaps.iter().map(|e| *e.key()).collect();
        let slots: Vec<Arc<SwapSlot>> = ids
            .iter()
            .filter_map(|id| self.swaps.remove(id).map(|(_, slot)| slot))
            .collect();

        info!("Stopping {} swap drivers", slots.len());
        join_all(slots.iter().map(|slot| self.stop_slot(slot))).await;

        for slot in slots {
            let record = slot.record.lock().await.clone();
            let stale = match self.store.load(&record.id).await? {
                Some(stored) => stored != record && stored.updated_at <= record.updated_at,
                None => true,
            };
            if stale {
                debug!("Persisting swap {} in state {} on shutdown", record.id, record.state);
                self.store.save(&record).await?;
            }
        }

        Ok(())
    }

    async fn spawn(self: &Arc<Self>, record: SwapRecord) -> SwapResult<()> {
        let source_reader = self.chains.reader(record.source.chain_id)?;
        let dest_reader = self.chains.reader(record.dest.chain_id)?;
        let (cancel, cancel_rx) = watch::channel(false);

        let slot = Arc::new(SwapSlot {
            id: record.id,
            record: Mutex::new(record),
            source_watcher: LockWatcher::new(
                source_reader,
                self.clock.clone(),
                self.config.clone(),
            ),
            dest_watcher: LockWatcher::new(dest_reader, self.clock.clone(), self.config.clone()),
            cancel,
            driver: Mutex::new(None),
        });

        self.swaps.insert(slot.id, slot.clone());
        let handle = tokio::spawn(self.clone().drive(slot.clone(), cancel_rx));
        *slot.driver.lock().await = Some(handle);

        Ok(())
    }

    async fn stop_slot(&self, slot: &SwapSlot) {
        let _ = slot.cancel.send(true);

        let handle = slot.driver.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(self.config.stop_grace(), &mut handle).await.is_err() {
                warn!("Driver for swap {} did not stop in time, aborting", slot.id);
                handle.abort();
            }
        }

        slot.stop_watchers().await;
    }

    /// Per-swap driver loop. Each phase returns after at most one transition;
    /// the loop then derives the next phase from the persisted record.
    /// Cancellation is observed at watcher waits and between phases, so a
    /// transition in flight always completes.
    async fn drive(self: Arc<Self>, slot: Arc<SwapSlot>, mut cancel: watch::Receiver<bool>) {
        let id = slot.id;

        loop {
            if *cancel.borrow() {
                break;
            }

            let record = slot.record.lock().await.clone();
            let Some(phase) = Phase::of(&record) else {
                info!("Swap {} finished in state {}", id, record.state);
                self.swaps.remove(&id);
                break;
            };
            debug!("Swap {} in state {}: {:?}", id, record.state, phase);

            let result = self.run_phase(&slot, phase, &record).await;
            if *cancel.borrow() {
                break;
            }

            if let Err(e) = result {
                if e.should_alert() {
                    error!("Swap {} {:?} interrupted: {}", id, phase, e);
                } else if e.is_retryable() {
                    debug!("Swap {} {:?} interrupted: {}", id, phase, e);
                } else {
                    warn!("Swap {} {:?} interrupted: {}", id, phase, e);
                }
                let message = e.to_string();
                if let Err(save_err) = self
                    .update(&slot, move |r| {
                        r.last_error = Some(message);
                        Ok(())
                    })
                    .await
                {
                    error!("Failed to record error for swap {}: {}", id, save_err);
                }

                tokio::select! {
                    _ = sleep(self.config.watcher_restart_delay()) => {}
                    _ = cancel.changed() => break,
                }
            }
        }

        slot.stop_watchers().await;
    }

    async fn run_phase(&self, slot: &SwapSlot, phase: Phase, record: &SwapRecord) -> SwapResult<()> {
        match phase {
            Phase::AwaitOwnLock => self.await_own_lock(slot, record).await,
            Phase::AwaitCounterLock => self.await_counter_lock(slot, record).await,
            Phase::ConfirmReveal => self.confirm_reveal(slot, record).await,
            Phase::AwaitCounterRedeem => self.await_counter_redeem(slot, record).await,
            Phase::AwaitSecret => self.await_secret(slot, record).await,
            Phase::Claim => self.claim(slot, record).await,
            Phase::Refund => self.refund(slot, record).await,
        }
    }

    async fn await_own_lock(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = record.own_leg();
        let timelock = record.timelock(leg);

        let mut submitted = record.submission(IntentAction::Lock, leg).map(|s| s.tx_hash);
        if submitted.is_none() && self.clock.now() >= timelock {
            self.transition(
                slot,
                record.state,
                SwapState::TimedOut,
                Some(format!("{} timelock passed before our lock was submitted", leg)),
                |_| Ok(()),
            )
            .await?;
            return Ok(());
        }

        let request = self.request(record, leg, &[EventKind::Locked], timelock);
        let mut rx = self.start_watch(slot, leg, request).await?;

        if submitted.is_none() {
            let endpoint = record.endpoint(leg);
            let intent = SwapIntent::Lock {
                swap_id: record.id,
                chain_id: endpoint.chain_id,
                contract: endpoint.contract,
                hashlock: record.hashlock,
                recipient: record.recipient(leg),
                amount: record.leg_amount(leg),
                timelock,
            };
            let submission = self.sign(record.id, leg, intent).await?;
            submitted = Some(submission.tx_hash);
            self.update(slot, move |r| {
                r.submissions.push(submission);
                Ok(())
            })
            .await?;
        }

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed {
                    entry,
                    confirmed: true,
                } => {
                    correlate(record.id, submitted, &entry);
                    let observation = self.observe(entry.clone(), true);
                    let (to, reason) = match validation::validate_own_lock(record, &entry) {
                        Ok(_) => {
                            let to = match leg {
                                Leg::Source => SwapState::SourceLocked,
                                Leg::Dest => SwapState::DestLocked,
                            };
                            (to, None)
                        }
                        Err(e) => (SwapState::Failed, Some(e.to_string())),
                    };
                    self.transition(slot, record.state, to, reason, move |r| {
                        r.set_lock(leg, Some(observation));
                        Ok(())
                    })
                    .await?;
                    return Ok(());
                }
                WatchEvent::Observed { entry, .. } => {
                    debug!(
                        "Swap {}: own {} lock at block {} awaiting confirmations",
                        record.id, leg, entry.block_number
                    );
                }
                WatchEvent::Reverted { entry } => {
                    warn!(
                        "Swap {}: own {} lock at block {} was reorged out",
                        record.id, leg, entry.block_number
                    );
                }
                WatchEvent::TimedOut => {
                    self.transition(
                        slot,
                        record.state,
                        SwapState::TimedOut,
                        Some(format!("own {} lock not confirmed before its timelock", leg)),
                        |_| Ok(()),
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    async fn await_counter_lock(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = record.counter_leg();
        let deadline = match record.role {
            SwapRole::Initiator => record.source_timelock,
            SwapRole::Counterparty => record.dest_timelock,
        };

        let mut request = self.request(record, leg, &[EventKind::Locked], deadline);
        request.expected = record
            .lock(leg)
            .filter(|o| !o.confirmed)
            .map(|o| o.entry.clone());
        let mut rx = self.start_watch(slot, leg, request).await?;

        let margin = self.config.safety_margin();
        let window = self.config.min_reveal_window();

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed { entry, confirmed } => {
                    let now = self.clock.now();
                    let checked = validation::validate_counter_lock(record, &entry, now, margin, window);

                    if !confirmed {
                        match (record.role, checked) {
                            (SwapRole::Initiator, Ok(_)) => {
                                let observation = self.observe(entry, false);
                                if record.state == SwapState::SourceLocked {
                                    self.transition(
                                        slot,
                                        SwapState::SourceLocked,
                                        SwapState::DestLocked,
                                        Some("dest lock seen, awaiting confirmations".to_string()),
                                        move |r| {
                                            r.set_lock(leg, Some(observation));
                                            Ok(())
                                        },
                                    )
                                    .await?;
                                    return Ok(());
                                }
                                self.update(slot, move |r| {
                                    r.set_lock(leg, Some(observation));
                                    Ok(())
                                })
                                .await?;
                            }
                            (_, Err(e)) => warn!(
                                "Swap {}: unconfirmed {} lock at block {} fails checks: {}",
                                record.id, leg, entry.block_number, e
                            ),
                            (SwapRole::Counterparty, Ok(_)) => debug!(
                                "Swap {}: {} lock at block {} awaiting confirmations",
                                record.id, leg, entry.block_number
                            ),
                        }
                        continue;
                    }

                    let observation = self.observe(entry.clone(), true);

                    if record.role == SwapRole::Initiator {
                        if let Ok(terms) = LockTerms::from_entry(&entry) {
                            if !validation::reveal_window_open(terms.timelock, now, window) {
                                self.transition(
                                    slot,
                                    record.state,
                                    SwapState::TimedOut,
                                    Some(format!(
                                        "dest lock expires at {}, too late to reveal",
                                        terms.timelock
                                    )),
                                    move |r| {
                                        r.set_lock(leg, Some(observation));
                                        Ok(())
                                    },
                                )
                                .await?;
                                return Ok(());
                            }
                        }
                    }

                    match checked {
                        Err(e) => {
                            warn!("Swap {}: rejecting {} lock: {}", record.id, leg, e);
                            self.transition(
                                slot,
                                record.state,
                                SwapState::Failed,
                                Some(e.to_string()),
                                move |r| {
                                    r.set_lock(leg, Some(observation));
                                    Ok(())
                                },
                            )
                            .await?;
                        }
                        Ok(_) => match record.role {
                            SwapRole::Counterparty => {
                                self.transition(
                                    slot,
                                    SwapState::Created,
                                    SwapState::SourceLocked,
                                    Some("initiator lock confirmed".to_string()),
                                    move |r| {
                                        r.set_lock(leg, Some(observation));
                                        Ok(())
                                    },
                                )
                                .await?;
                            }
                            SwapRole::Initiator => self.reveal(slot, record, observation).await?,
                        },
                    }
                    return Ok(());
                }
                WatchEvent::Reverted { entry } => {
                    if record.role == SwapRole::Initiator && record.state == SwapState::DestLocked {
                        self.transition(
                            slot,
                            SwapState::DestLocked,
                            SwapState::SourceLocked,
                            Some(format!(
                                "dest lock at block {} was reorged out",
                                entry.block_number
                            )),
                            move |r| {
                                r.set_lock(leg, None);
                                Ok(())
                            },
                        )
                        .await?;
                        return Ok(());
                    }
                    debug!(
                        "Swap {}: unconfirmed {} lock at block {} disappeared",
                        record.id, leg, entry.block_number
                    );
                }
                WatchEvent::TimedOut => {
                    self.transition(
                        slot,
                        record.state,
                        SwapState::TimedOut,
                        Some(format!("{} lock not observed before {}", leg, deadline)),
                        |_| Ok(()),
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    /// Initiator: the destination lock is confirmed and valid, release the secret
    async fn reveal(
        &self,
        slot: &SwapSlot,
        record: &SwapRecord,
        observation: Observation,
    ) -> SwapResult<()> {
        if record.state == SwapState::SourceLocked {
            let confirmed = observation.clone();
            self.transition(
                slot,
                SwapState::SourceLocked,
                SwapState::DestLocked,
                Some("dest lock confirmed".to_string()),
                move |r| {
                    r.set_lock(Leg::Dest, Some(confirmed));
                    Ok(())
                },
            )
            .await?;
        }

        let secret = record.secret.clone().ok_or_else(|| {
            SwapError::Internal(format!("initiator swap {} has no secret", record.id))
        })?;
        let intent = SwapIntent::Reveal {
            swap_id: record.id,
            chain_id: record.dest.chain_id,
            contract: record.dest.contract,
            secret,
        };
        let submission = self.sign(record.id, Leg::Dest, intent).await?;

        self.transition(
            slot,
            SwapState::DestLocked,
            SwapState::SecretRevealed,
            Some("dest lock confirmed, secret revealed".to_string()),
            move |r| {
                r.set_lock(Leg::Dest, Some(observation));
                r.submissions.push(submission);
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    async fn confirm_reveal(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = Leg::Dest;

        let submission = match record.submission(IntentAction::Reveal, leg) {
            Some(existing) => existing.clone(),
            None => {
                if self.clock.now() >= record.dest_timelock {
                    self.transition(
                        slot,
                        SwapState::SecretRevealed,
                        SwapState::Failed,
                        Some("dest timelock passed before our redeem was resubmitted".to_string()),
                        |_| Ok(()),
                    )
                    .await?;
                    return Ok(());
                }
                let secret = record.secret.clone().ok_or_else(|| {
                    SwapError::Internal(format!("initiator swap {} has no secret", record.id))
                })?;
                let intent = SwapIntent::Reveal {
                    swap_id: record.id,
                    chain_id: record.dest.chain_id,
                    contract: record.dest.contract,
                    secret,
                };
                let submission = self.sign(record.id, leg, intent).await?;
                let persisted = submission.clone();
                self.update(slot, move |r| {
                    r.submissions.push(persisted);
                    Ok(())
                })
                .await?;
                submission
            }
        };

        let deadline =
            (submission.submitted_at + self.config.refund_watch()).min(record.dest_timelock);
        let request = self.request(record, leg, &[EventKind::Redeemed], deadline);
        let mut rx = self.start_watch(slot, leg, request).await?;

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed {
                    entry,
                    confirmed: true,
                } => {
                    correlate(record.id, Some(submission.tx_hash), &entry);
                    let block = entry.block_number;
                    let observation = self.observe(entry, true);
                    self.update(slot, move |r| {
                        r.set_redeem(leg, observation);
                        Ok(())
                    })
                    .await?;
                    info!("Swap {}: dest redeem confirmed at block {}", record.id, block);
                    return Ok(());
                }
                WatchEvent::Observed { .. } | WatchEvent::Reverted { .. } => {}
                WatchEvent::TimedOut => {
                    if self.clock.now() >= record.dest_timelock {
                        self.transition(
                            slot,
                            SwapState::SecretRevealed,
                            SwapState::Failed,
                            Some("dest redeem not confirmed before dest timelock".to_string()),
                            |_| Ok(()),
                        )
                        .await?;
                        return Ok(());
                    }
                    warn!(
                        "Swap {}: dest redeem {:?} not confirmed by {}, resubmitting",
                        record.id, submission.tx_hash, deadline
                    );
                    self.update(slot, move |r| {
                        r.clear_submission(IntentAction::Reveal, leg);
                        Ok(())
                    })
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    async fn await_counter_redeem(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = Leg::Source;
        let request = self.request(record, leg, &[EventKind::Redeemed], record.source_timelock);
        let mut rx = self.start_watch(slot, leg, request).await?;

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed {
                    entry,
                    confirmed: true,
                } => {
                    let observation = self.observe(entry, true);
                    self.transition(
                        slot,
                        SwapState::SecretRevealed,
                        SwapState::Redeemed,
                        Some("solver claimed the source lock".to_string()),
                        move |r| {
                            r.set_redeem(leg, observation);
                            Ok(())
                        },
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Observed { .. } | WatchEvent::Reverted { .. } => {}
                WatchEvent::TimedOut => {
                    self.transition(
                        slot,
                        SwapState::SecretRevealed,
                        SwapState::Redeemed,
                        Some(
                            "dest redeemed; solver claim not observed before source timelock"
                                .to_string(),
                        ),
                        |_| Ok(()),
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    /// Counterparty: any redeem of our dest lock carries the secret, confirmed or not
    async fn await_secret(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = Leg::Dest;
        let mut request = self.request(record, leg, &[EventKind::Redeemed], record.dest_timelock);
        request.settle_unconfirmed = true;
        let mut rx = self.start_watch(slot, leg, request).await?;

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed { entry, confirmed } => {
                    let HtlcEvent::Redeemed { secret, .. } = &entry.event else {
                        continue;
                    };
                    let secret = secret.clone();
                    let observation = self.observe(entry, confirmed);

                    let mut candidate = record.clone();
                    if let Err(e) = candidate.set_secret(secret.clone()) {
                        warn!("Swap {}: dest redeem carried an unusable secret", record.id);
                        self.transition(
                            slot,
                            SwapState::DestLocked,
                            SwapState::Failed,
                            Some(e.to_string()),
                            move |r| {
                                r.set_redeem(leg, observation);
                                Ok(())
                            },
                        )
                        .await?;
                        return Ok(());
                    }

                    self.transition(
                        slot,
                        SwapState::DestLocked,
                        SwapState::SecretRevealed,
                        Some("initiator revealed the secret on dest".to_string()),
                        move |r| {
                            r.set_secret(secret)?;
                            r.set_redeem(leg, observation);
                            Ok(())
                        },
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Reverted { .. } => {}
                WatchEvent::TimedOut => {
                    self.transition(
                        slot,
                        SwapState::DestLocked,
                        SwapState::TimedOut,
                        Some("secret not revealed before dest timelock".to_string()),
                        |_| Ok(()),
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    /// Counterparty: redeem the source lock with the learned secret
    async fn claim(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = Leg::Source;
        let request = self.request(record, leg, &[EventKind::Redeemed], record.source_timelock);
        let mut rx = self.start_watch(slot, leg, request).await?;

        let mut submitted = record.submission(IntentAction::Reveal, leg).map(|s| s.tx_hash);
        if submitted.is_none() {
            let secret = record.secret.clone().ok_or_else(|| {
                SwapError::Internal(format!("swap {} revealed without a secret", record.id))
            })?;
            let intent = SwapIntent::Reveal {
                swap_id: record.id,
                chain_id: record.source.chain_id,
                contract: record.source.contract,
                secret,
            };
            let submission = self.sign(record.id, leg, intent).await?;
            submitted = Some(submission.tx_hash);
            self.update(slot, move |r| {
                r.submissions.push(submission);
                Ok(())
            })
            .await?;
        }

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed {
                    entry,
                    confirmed: true,
                } => {
                    correlate(record.id, submitted, &entry);
                    let observation = self.observe(entry, true);
                    self.transition(
                        slot,
                        SwapState::SecretRevealed,
                        SwapState::Redeemed,
                        Some("source lock claimed".to_string()),
                        move |r| {
                            r.set_redeem(leg, observation);
                            Ok(())
                        },
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Observed { .. } | WatchEvent::Reverted { .. } => {}
                WatchEvent::TimedOut => {
                    self.transition(
                        slot,
                        SwapState::SecretRevealed,
                        SwapState::Failed,
                        Some("source claim not confirmed before source timelock".to_string()),
                        |_| Ok(()),
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    async fn refund(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = record.own_leg();
        let from = record.state;

        if record.lock(leg).is_none() {
            if record.submission(IntentAction::Lock, leg).is_none() {
                self.transition(
                    slot,
                    from,
                    SwapState::Failed,
                    Some("no funds locked".to_string()),
                    |_| Ok(()),
                )
                .await?;
                return Ok(());
            }
            return self.probe_own_lock(slot, record).await;
        }

        let timelock = record.timelock(leg);
        while self.clock.now() < timelock {
            slot.pause(self.config.poll_interval()).await?;
        }

        let submission = match record.submission(IntentAction::Refund, leg) {
            Some(existing) => existing.clone(),
            None => {
                let endpoint = record.endpoint(leg);
                let intent = SwapIntent::Refund {
                    swap_id: record.id,
                    chain_id: endpoint.chain_id,
                    contract: endpoint.contract,
                };
                let submission = self.sign(record.id, leg, intent).await?;
                let persisted = submission.clone();
                self.update(slot, move |r| {
                    r.submissions.push(persisted);
                    Ok(())
                })
                .await?;
                submission
            }
        };

        let deadline = submission.submitted_at + self.config.refund_watch();
        let request = self.request(
            record,
            leg,
            &[EventKind::Refunded, EventKind::Redeemed],
            deadline,
        );
        let mut rx = self.start_watch(slot, leg, request).await?;

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed {
                    entry,
                    confirmed: true,
                } => {
                    let observation = self.observe(entry.clone(), true);
                    match &entry.event {
                        HtlcEvent::Redeemed { secret, .. } => {
                            let secret = secret.clone();
                            warn!(
                                "Swap {}: own {} lock was redeemed before the refund landed",
                                record.id, leg
                            );
                            let mutate = move |r: &mut SwapRecord| {
                                if r.secret.is_none() && r.set_secret(secret).is_ok() {
                                    info!("Swap {}: secret learned from own {} lock", r.id, leg);
                                }
                                r.set_redeem(leg, observation);
                                Ok(())
                            };
                            if from == SwapState::Failed {
                                self.update(slot, mutate).await?;
                            } else {
                                self.transition(
                                    slot,
                                    from,
                                    SwapState::Failed,
                                    Some(format!("own {} lock redeemed before refund", leg)),
                                    mutate,
                                )
                                .await?;
                            }
                        }
                        _ => {
                            correlate(record.id, Some(submission.tx_hash), &entry);
                            self.transition(
                                slot,
                                from,
                                SwapState::Refunded,
                                Some(format!("own {} lock refunded", leg)),
                                move |r| {
                                    r.refund = Some(observation);
                                    Ok(())
                                },
                            )
                            .await?;
                        }
                    }
                    return Ok(());
                }
                WatchEvent::Observed { .. } | WatchEvent::Reverted { .. } => {}
                WatchEvent::TimedOut => {
                    warn!(
                        "Swap {}: refund {:?} not confirmed by {}, resubmitting",
                        record.id, submission.tx_hash, deadline
                    );
                    self.update(slot, move |r| {
                        r.clear_submission(IntentAction::Refund, leg);
                        Ok(())
                    })
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    /// Our lock was submitted but never seen. Only reached once its timelock
    /// has passed, so the watch polls once before deciding nothing is locked.
    async fn probe_own_lock(&self, slot: &SwapSlot, record: &SwapRecord) -> SwapResult<()> {
        let leg = record.own_leg();
        let request = self.request(record, leg, &[EventKind::Locked], record.timelock(leg));
        let mut rx = self.start_watch(slot, leg, request).await?;
        let mut pending = false;

        loop {
            match slot.next_event(&mut rx).await? {
                WatchEvent::Observed {
                    entry,
                    confirmed: true,
                } => {
                    info!(
                        "Swap {}: found own {} lock at block {}",
                        record.id, leg, entry.block_number
                    );
                    let observation = self.observe(entry, true);
                    self.update(slot, move |r| {
                        r.set_lock(leg, Some(observation));
                        Ok(())
                    })
                    .await?;
                    return Ok(());
                }
                WatchEvent::Observed { .. } => pending = true,
                WatchEvent::Reverted { .. } => pending = false,
                WatchEvent::TimedOut => {
                    if pending {
                        return slot.pause(self.config.poll_interval()).await;
                    }
                    self.transition(
                        slot,
                        record.state,
                        SwapState::Failed,
                        Some(format!("own {} lock never landed; no funds locked", leg)),
                        |_| Ok(()),
                    )
                    .await?;
                    return Ok(());
                }
                WatchEvent::Errored { reason } => return Err(watch_error(record, leg, reason)),
            }
        }
    }

    fn request(
        &self,
        record: &SwapRecord,
        leg: Leg,
        kinds: &[EventKind],
        deadline: DateTime<Utc>,
    ) -> WatchRequest {
        WatchRequest {
            swap_id: record.id,
            contract: record.endpoint(leg).contract,
            matcher: event_matcher(record.id, kinds),
            from_block: record.start_block(leg),
            deadline,
            expected: None,
            settle_unconfirmed: false,
        }
    }

    async fn start_watch(
        &self,
        slot: &SwapSlot,
        leg: Leg,
        request: WatchRequest,
    ) -> SwapResult<mpsc::Receiver<WatchEvent>> {
        let watcher = slot.watcher(leg);
        watcher.stop().await;
        watcher.start(request).await
    }

    fn observe(&self, entry: LogEntry, confirmed: bool) -> Observation {
        Observation {
            entry,
            confirmed,
            observed_at: self.clock.now(),
        }
    }

    /// Hand an intent to the signer and build its receipt. The caller persists it.
    async fn sign(&self, id: SwapId, leg: Leg, intent: SwapIntent) -> SwapResult<Submission> {
        let action = intent.action();
        let chain_id = intent.chain_id();

        match self.signer.submit(intent).await {
            Ok(tx_hash) => {
                crate::metrics::record_submission(chain_id, action, true);
                info!(
                    "Swap {}: {} submitted on chain {}: {:?}",
                    id, action, chain_id, tx_hash
                );
                Ok(Submission {
                    action,
                    leg,
                    chain_id,
                    tx_hash,
                    submitted_at: self.clock.now(),
                })
            }
            Err(e) => {
                crate::metrics::record_submission(chain_id, action, false);
                Err(e)
            }
        }
    }

    /// Move the record from `from` to `to`. The in-memory copy is replaced
    /// before the save and restored if the save fails, so it is never older
    /// than the stored record.
    async fn transition<F>(
        &self,
        slot: &SwapSlot,
        from: SwapState,
        to: SwapState,
        reason: Option<String>,
        mutate: F,
    ) -> SwapResult<SwapRecord>
    where
        F: FnOnce(&mut SwapRecord) -> SwapResult<()> + Send,
    {
        let mut current = slot.record.lock().await;
        if current.state != from || !from.can_transition_to(to) {
            return Err(SwapError::InvalidStateTransition {
                from: current.state.to_string(),
                to: to.to_string(),
            });
        }

        let mut next = current.clone();
        mutate(&mut next)?;
        if matches!(to, SwapState::Failed | SwapState::TimedOut) {
            next.failure = reason.clone();
        }
        next.record_transition(to, self.clock.now(), reason.clone());

        let previous = std::mem::replace(&mut *current, next.clone());
        if let Err(e) = self.store.save(&next).await {
            *current = previous;
            return Err(e);
        }
        drop(current);

        crate::metrics::record_transition(from, to);
        match &reason {
            Some(reason) => info!("Swap {}: {} -> {} ({})", next.id, from, to, reason),
            None => info!("Swap {}: {} -> {}", next.id, from, to),
        }
        Ok(next)
    }

    /// Persist a change that does not move the state
    async fn update<F>(&self, slot: &SwapSlot, mutate: F) -> SwapResult<SwapRecord>
    where
        F: FnOnce(&mut SwapRecord) -> SwapResult<()> + Send,
    {
        let mut current = slot.record.lock().await;
        let mut next = current.clone();
        mutate(&mut next)?;
        next.updated_at = self.clock.now();

        let previous = std::mem::replace(&mut *current, next.clone());
        if let Err(e) = self.store.save(&next).await {
            *current = previous;
            return Err(e);
        }
        Ok(next)
    }
}

fn watch_error(record: &SwapRecord, leg: Leg, reason: String) -> SwapError {
    SwapError::ChainConnection {
        chain_id: record.endpoint(leg).chain_id,
        message: reason,
    }
}

/// Log when an observed event came from a different transaction than ours
fn correlate(id: SwapId, submitted: Option<H256>, entry: &LogEntry) {
    if let Some(tx_hash) = submitted {
        if tx_hash != entry.tx_hash {
            warn!(
                "Swap {}: {} observed in tx {:?}, submitted {:?}",
                id,
                entry.event.name(),
                entry.tx_hash,
                tx_hash
            );
        }
    }
}

/// Timelocks are whole unix seconds on chain
fn whole_seconds(at: DateTime<Utc>) -> SwapResult<DateTime<Utc>> {
    let secs = u64::try_from(at.timestamp())
        .map_err(|_| SwapError::Config(format!("timelock {} is before the epoch", at)))?;
    hashlock::timelock_from_secs(secs)
}

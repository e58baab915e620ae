//! Bounded polling watcher for HTLC events on one chain
//!
//! A `LockWatcher` scans a contract's logs from a start block, reports the
//! first event accepted by its matcher, and keeps rescanning the unconfirmed
//! window until that event is at or below the chain's safe tip. It gives up
//! at a wall-clock deadline, but only after a poll that actually reached the
//! chain: an unreachable RPC is never taken to mean "no event".

use crate::chain::{BlockRef, ChainReader};
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::coordination::SwapId;
use crate::error::{SwapError, SwapResult};
use crate::events::{EventKind, LogEntry};

use chrono::{DateTime, Utc};
use ethers::types::Address;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Predicate selecting the log a watcher is waiting for
pub type LogMatcher = Arc<dyn Fn(&LogEntry) -> bool + Send + Sync>;

/// Match events of `kinds` for one swap
pub fn event_matcher(swap_id: SwapId, kinds: &[EventKind]) -> LogMatcher {
    let kinds = kinds.to_vec();
    Arc::new(move |entry: &LogEntry| {
        entry.event.swap_id() == swap_id && kinds.contains(&entry.event.kind())
    })
}

/// What to watch for
#[derive(Clone)]
pub struct WatchRequest {
    pub swap_id: SwapId,
    pub contract: Address,
    pub matcher: LogMatcher,
    pub from_block: u64,
    pub deadline: DateTime<Utc>,
    /// An unconfirmed entry seen before (e.g. prior to a restart). If it is
    /// gone when its block is rescanned, `Reverted` is emitted.
    pub expected: Option<LogEntry>,
    /// Finish on the first unconfirmed observation instead of waiting for depth
    pub settle_unconfirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Observed { entry: LogEntry, confirmed: bool },
    /// A previously observed unconfirmed entry is no longer on chain
    Reverted { entry: LogEntry },
    TimedOut,
    Errored { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherStatus {
    Idle,
    Polling,
    Found,
    TimedOut,
    Errored,
    Stopped,
}

struct RunningTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls one chain for one swap at a time
pub struct LockWatcher {
    reader: Arc<dyn ChainReader>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    status: Arc<watch::Sender<WatcherStatus>>,
    task: Mutex<Option<RunningTask>>,
}

impl LockWatcher {
    pub fn new(
        reader: Arc<dyn ChainReader>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        let (status, _) = watch::channel(WatcherStatus::Idle);
        Self {
            reader,
            clock,
            config,
            status: Arc::new(status),
            task: Mutex::new(None),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.reader.chain_id()
    }

    pub fn status(&self) -> WatcherStatus {
        *self.status.borrow()
    }

    /// Spawn the polling task. Fails with `WatcherBusy` while a previous
    /// request is still polling.
    pub async fn start(&self, request: WatchRequest) -> SwapResult<mpsc::Receiver<WatchEvent>> {
        let mut task = self.task.lock().await;

        if self.status() == WatcherStatus::Polling {
            return Err(SwapError::WatcherBusy {
                chain_id: self.chain_id(),
            });
        }

        let (events_tx, events_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);

        self.status.send_replace(WatcherStatus::Polling);
        debug!(
            "Watcher on chain {} started for swap {} from block {}",
            self.chain_id(),
            request.swap_id,
            request.from_block
        );

        let poller = Poller {
            reader: self.reader.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            status: self.status.clone(),
            events: events_tx,
            stop: stop_rx,
            cursor: request.from_block,
            pending: request.expected.clone(),
            request,
        };
        let handle = tokio::spawn(poller.run());

        *task = Some(RunningTask {
            stop: stop_tx,
            handle,
        });

        Ok(events_rx)
    }

    /// Signal the task, wait up to `stop_grace`, then abort it. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.task.lock().await.take() else {
            return;
        };

        let _ = running.stop.send(true);
        let mut handle = running.handle;
        if timeout(self.config.stop_grace(), &mut handle).await.is_err() {
            warn!(
                "Watcher on chain {} did not stop within grace period, aborting",
                self.chain_id()
            );
            handle.abort();
        }

        self.status.send_if_modified(|status| {
            if *status == WatcherStatus::Polling {
                *status = WatcherStatus::Stopped;
                true
            } else {
                false
            }
        });
    }
}

/// Result of one scan
enum Scan {
    /// Keep polling; `caught_up` when the scan reached the latest block
    Continue { caught_up: bool },
    /// Final event emitted
    Done,
    /// Stop requested or receiver dropped
    Stopped,
}

struct Poller {
    reader: Arc<dyn ChainReader>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    status: Arc<watch::Sender<WatcherStatus>>,
    events: mpsc::Sender<WatchEvent>,
    stop: watch::Receiver<bool>,
    request: WatchRequest,
    cursor: u64,
    pending: Option<LogEntry>,
}

impl Poller {
    async fn run(mut self) {
        let chain_id = self.reader.chain_id();
        let mut failures: u32 = 0;

        loop {
            if *self.stop.borrow() {
                return;
            }

            let delay = match self.scan().await {
                Ok(Scan::Done) | Ok(Scan::Stopped) => return,
                Ok(Scan::Continue { caught_up }) => {
                    failures = 0;
                    crate::metrics::record_watcher_poll(chain_id);

                    if caught_up && self.clock.now() >= self.request.deadline {
                        info!(
                            "Watcher on chain {} reached deadline for swap {}",
                            chain_id, self.request.swap_id
                        );
                        self.finish(WatcherStatus::TimedOut, WatchEvent::TimedOut)
                            .await;
                        return;
                    }

                    if caught_up {
                        self.config.poll_interval()
                    } else {
                        std::time::Duration::ZERO
                    }
                }
                Err(e) => {
                    failures += 1;
                    crate::metrics::record_watcher_error(chain_id);
                    warn!(
                        "Watcher poll failed on chain {} ({} in a row): {}",
                        chain_id, failures, e
                    );

                    if failures > self.config.max_consecutive_failures {
                        let healthy = match timeout(
                            self.config.rpc_timeout(),
                            self.reader.is_healthy(),
                        )
                        .await
                        {
                            Ok(healthy) => healthy,
                            Err(_) => false,
                        };
                        let reason = format!(
                            "{} consecutive failed polls on chain {} (healthy: {}): {}",
                            failures, chain_id, healthy, e
                        );
                        self.finish(WatcherStatus::Errored, WatchEvent::Errored { reason })
                            .await;
                        return;
                    }

                    self.config.backoff(failures)
                }
            };

            if !delay.is_zero() && !self.pause(delay).await {
                return;
            }
        }
    }

    async fn scan(&mut self) -> SwapResult<Scan> {
        let chain_id = self.reader.chain_id();

        let reader = self.reader.clone();
        let Some(tip) = self.call("get_tip", reader.get_tip()).await? else {
            return Ok(Scan::Stopped);
        };
        let BlockRef { latest, safe } = tip;

        if self.cursor > latest {
            return Ok(Scan::Continue { caught_up: true });
        }

        let range = self.config.max_block_range.max(1);
        let to = latest.min(self.cursor.saturating_add(range - 1));
        let Some(logs) = self
            .call(
                "get_logs",
                reader.get_logs(self.request.contract, self.cursor, to),
            )
            .await?
        else {
            return Ok(Scan::Stopped);
        };

        let found = logs.into_iter().find(|entry| (self.request.matcher)(entry));
        match found {
            Some(entry) if entry.block_number <= safe => {
                info!(
                    "Chain {}: confirmed {} for swap {} at block {}",
                    chain_id,
                    entry.event.name(),
                    self.request.swap_id,
                    entry.block_number
                );
                self.finish(
                    WatcherStatus::Found,
                    WatchEvent::Observed {
                        entry,
                        confirmed: true,
                    },
                )
                .await;
                return Ok(Scan::Done);
            }
            Some(entry) => {
                if self.pending.as_ref() != Some(&entry) {
                    debug!(
                        "Chain {}: unconfirmed {} for swap {} at block {} (safe {})",
                        chain_id,
                        entry.event.name(),
                        self.request.swap_id,
                        entry.block_number,
                        safe
                    );
                    self.pending = Some(entry.clone());
                    let event = WatchEvent::Observed {
                        entry,
                        confirmed: false,
                    };

                    if self.request.settle_unconfirmed {
                        self.finish(WatcherStatus::Found, event).await;
                        return Ok(Scan::Done);
                    }
                    if !self.emit(event).await {
                        return Ok(Scan::Stopped);
                    }
                }
            }
            None => {
                let reverted = self
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.block_number >= self.cursor && p.block_number <= to);
                if reverted {
                    if let Some(entry) = self.pending.take() {
                        warn!(
                            "Chain {}: {} for swap {} at block {} disappeared",
                            chain_id,
                            entry.event.name(),
                            self.request.swap_id,
                            entry.block_number
                        );
                        crate::metrics::record_reorg(chain_id);
                        if !self.emit(WatchEvent::Reverted { entry }).await {
                            return Ok(Scan::Stopped);
                        }
                    }
                }
            }
        }

        // Only the confirmed part of the range is never rescanned
        let settled = to.min(safe);
        if settled >= self.cursor {
            self.cursor = settled + 1;
        }

        Ok(Scan::Continue {
            caught_up: to == latest,
        })
    }

    /// Run an RPC call bounded by `rpc_timeout`. `Ok(None)` means stop was requested.
    async fn call<T>(
        &mut self,
        operation: &str,
        fut: impl Future<Output = SwapResult<T>>,
    ) -> SwapResult<Option<T>> {
        let rpc_timeout = self.config.rpc_timeout();
        let chain_id = self.reader.chain_id();
        tokio::select! {
            result = timeout(rpc_timeout, fut) => match result {
                Ok(value) => value.map(Some),
                Err(_) => Err(SwapError::Timeout {
                    operation: format!("{} on chain {}", operation, chain_id),
                }),
            },
            _ = self.stop.changed() => Ok(None),
        }
    }

    /// Sleep unless stopped first. Returns false when stopped.
    async fn pause(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => true,
            _ = self.stop.changed() => false,
        }
    }

    async fn emit(&self, event: WatchEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn finish(&self, status: WatcherStatus, event: WatchEvent) {
        self.status.send_replace(status);
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HtlcEvent;
    use crate::hashlock::Hashlock;
    use crate::testing::{ManualClock, MockChain};
    use chrono::Duration as ChronoDuration;
    use ethers::types::U256;
    use std::time::Duration;

    fn contract() -> Address {
        Address::from_low_u64_be(0xaa)
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            poll_interval_ms: 5,
            max_block_range: 50,
            max_consecutive_failures: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            rpc_timeout_ms: 200,
            stop_grace_ms: 100,
            ..CoordinatorConfig::default()
        }
    }

    fn locked(swap_id: SwapId) -> HtlcEvent {
        HtlcEvent::Locked {
            swap_id,
            hashlock: Hashlock([2u8; 32]),
            sender: Address::from_low_u64_be(1),
            recipient: Address::from_low_u64_be(2),
            amount: U256::from(100u64),
            timelock: 2_000_000_000,
        }
    }

    fn request(swap_id: SwapId, deadline: DateTime<Utc>, kinds: &[EventKind]) -> WatchRequest {
        WatchRequest {
            swap_id,
            contract: contract(),
            matcher: event_matcher(swap_id, kinds),
            from_block: 0,
            deadline,
            expected: None,
            settle_unconfirmed: false,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher event")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_reports_unconfirmed_then_confirmed() {
        let chain = MockChain::new(1, 3);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.mine(10);
        let entry = chain.push_log(contract(), locked(swap_id));

        let mut rx = watcher
            .start(request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]))
            .await
            .unwrap();

        assert_eq!(
            next(&mut rx).await,
            WatchEvent::Observed {
                entry: entry.clone(),
                confirmed: false
            }
        );

        chain.mine(3);
        assert_eq!(
            next(&mut rx).await,
            WatchEvent::Observed {
                entry,
                confirmed: true
            }
        );
        assert_eq!(watcher.status(), WatcherStatus::Found);
    }

    #[tokio::test]
    async fn test_ignores_other_swaps() {
        let chain = MockChain::new(1, 1);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.push_log(contract(), locked(SwapId([9u8; 32])));
        let ours = chain.push_log(contract(), locked(swap_id));
        chain.mine(2);

        let mut rx = watcher
            .start(request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]))
            .await
            .unwrap();
        match next(&mut rx).await {
            WatchEvent::Observed { entry, confirmed } => {
                assert!(confirmed);
                assert_eq!(entry, ours);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_times_out_after_deadline() {
        let chain = MockChain::new(1, 2);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        let mut rx = watcher
            .start(request(swap_id, clock.now() + ChronoDuration::seconds(30), &[EventKind::Locked]))
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(31));
        assert_eq!(next(&mut rx).await, WatchEvent::TimedOut);
        assert_eq!(watcher.status(), WatcherStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_redeem_beats_deadline_in_same_cycle() {
        let chain = MockChain::new(1, 1);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.push_log(
            contract(),
            HtlcEvent::Redeemed {
                swap_id,
                secret: crate::hashlock::Secret::from_bytes([7u8; 32]),
            },
        );
        chain.mine(1);
        clock.advance(ChronoDuration::hours(2));

        let mut rx = watcher
            .start(request(swap_id, clock.now() - ChronoDuration::hours(1), &[EventKind::Redeemed]))
            .await
            .unwrap();
        assert!(matches!(
            next(&mut rx).await,
            WatchEvent::Observed { confirmed: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_chain_errors_instead_of_timing_out() {
        let chain = MockChain::new(1, 1);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.set_unreachable(true);
        clock.advance(ChronoDuration::hours(1));

        let mut rx = watcher
            .start(request(swap_id, clock.now() - ChronoDuration::seconds(1), &[EventKind::Locked]))
            .await
            .unwrap();

        match next(&mut rx).await {
            WatchEvent::Errored { reason } => assert!(reason.contains("healthy: false")),
            other => panic!("expected Errored, got {:?}", other),
        }
        assert_eq!(watcher.status(), WatcherStatus::Errored);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let chain = MockChain::new(1, 1);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.push_log(contract(), locked(swap_id));
        chain.mine(1);
        chain.fail_next(3);

        let mut rx = watcher
            .start(request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]))
            .await
            .unwrap();
        assert!(matches!(
            next(&mut rx).await,
            WatchEvent::Observed { confirmed: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_reorged_observation_is_reverted() {
        let chain = MockChain::new(1, 5);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.mine(10);
        let entry = chain.push_log(contract(), locked(swap_id));

        let mut rx = watcher
            .start(request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]))
            .await
            .unwrap();
        assert!(matches!(
            next(&mut rx).await,
            WatchEvent::Observed { confirmed: false, .. }
        ));

        chain.remove_logs(|log| log.event.swap_id() == swap_id);
        assert_eq!(next(&mut rx).await, WatchEvent::Reverted { entry });
        assert_eq!(watcher.status(), WatcherStatus::Polling);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_expected_entry_reverts_after_restart() {
        let chain = MockChain::new(1, 5);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.mine(10);
        let entry = chain.push_log(contract(), locked(swap_id));
        chain.remove_logs(|_| true);

        let mut req = request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]);
        req.expected = Some(entry.clone());
        let mut rx = watcher.start(req).await.unwrap();

        assert_eq!(next(&mut rx).await, WatchEvent::Reverted { entry });
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_settle_unconfirmed_finishes_early() {
        let chain = MockChain::new(1, 10);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.mine(3);
        chain.push_log(contract(), locked(swap_id));

        let mut req = request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]);
        req.settle_unconfirmed = true;
        let mut rx = watcher.start(req).await.unwrap();

        assert!(matches!(
            next(&mut rx).await,
            WatchEvent::Observed { confirmed: false, .. }
        ));
        assert_eq!(watcher.status(), WatcherStatus::Found);
    }

    #[tokio::test]
    async fn test_scans_large_ranges_in_chunks() {
        let chain = MockChain::new(1, 1);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        chain.mine(400);
        chain.push_log(contract(), locked(swap_id));
        chain.mine(1);
        // Deadline already passed: the backlog must still be scanned first
        let mut rx = watcher
            .start(request(swap_id, clock.now() - ChronoDuration::seconds(1), &[EventKind::Locked]))
            .await
            .unwrap();

        assert!(matches!(
            next(&mut rx).await,
            WatchEvent::Observed { confirmed: true, .. }
        ));
        assert!(chain.max_requested_range() <= 50);
    }

    #[tokio::test]
    async fn test_second_start_while_polling_is_busy() {
        let chain = MockChain::new(1, 1);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());
        let req = request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]);

        let _rx = watcher.start(req.clone()).await.unwrap();
        let err = watcher.start(req.clone()).await.unwrap_err();
        assert!(matches!(err, SwapError::WatcherBusy { chain_id: 1 }));

        watcher.stop().await;
        assert!(watcher.start(req).await.is_ok());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let chain = MockChain::new(1, 1);
        let clock = ManualClock::new(Utc::now());
        let swap_id = SwapId([1u8; 32]);
        let watcher = LockWatcher::new(chain.clone(), clock.clone(), test_config());

        watcher.stop().await;
        assert_eq!(watcher.status(), WatcherStatus::Idle);

        let _rx = watcher
            .start(request(swap_id, clock.now() + ChronoDuration::hours(1), &[EventKind::Locked]))
            .await
            .unwrap();
        watcher.stop().await;
        assert_eq!(watcher.status(), WatcherStatus::Stopped);
        watcher.stop().await;
        assert_eq!(watcher.status(), WatcherStatus::Stopped);
    }
}

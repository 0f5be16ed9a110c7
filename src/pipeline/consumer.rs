//! Consumer workers: execute closure requests and turn each outcome into
//! completion, a follow-up request, or a terminal failure.
//!
//! Per request:
//! 1. Set the in-flight marker for the pair.
//! 2. Unless forced, abandon the request if its observed block is too old.
//! 3. Estimate, budget and submit the closing transaction, then wait for
//!    confirmation.
//! 4. On success with a specific amount, enqueue a forced full close if
//!    anything is still outstanding.
//! 5. On resource exhaustion, enqueue a forced retry for half the amount
//!    (rounded up), down to `min_close_amount`.
//! 6. Clear the marker, whatever happened after it was set.
//!
//! A reaper task returns deliveries that stay unacknowledged past the
//! visibility timeout (a worker that died mid-request) to the queue.
//!
//! Follow-ups are enqueued before the marker clears, so a fast redelivery
//! can briefly overlap the finishing attempt for the same pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::request::ClosureRequest;
use crate::config::PipelineConfig;
use crate::coordination::DedupLock;
use crate::journal::ClosureJournal;
use crate::ledger::{GasPolicy, Ledger, LedgerError};

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosureOutcome {
    /// Observed block too old; nothing submitted
    Stale,
    /// Full-close attempt confirmed
    Completed,
    /// Partial closure confirmed, forced full close enqueued
    PartialFollowUp { outstanding: u128 },
    /// Partial closure confirmed and nothing left outstanding
    PartialComplete,
    /// Resource exhaustion, forced retry enqueued with a smaller amount
    Requeued { from: u128, to: u128 },
    /// Resource exhaustion at or below the smallest amount worth retrying
    BelowFloor { baseline: u128 },
    Failed { reason: String },
}

impl ClosureOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            ClosureOutcome::Stale => "stale",
            ClosureOutcome::Completed => "completed",
            ClosureOutcome::PartialFollowUp { .. } => "partial_follow_up",
            ClosureOutcome::PartialComplete => "partial_complete",
            ClosureOutcome::Requeued { .. } => "requeued",
            ClosureOutcome::BelowFloor { .. } => "below_floor",
            ClosureOutcome::Failed { .. } => "failed",
        }
    }

    /// Amount carried by the follow-up request, if one was enqueued.
    pub fn follow_up_amount(&self) -> Option<u128> {
        match self {
            ClosureOutcome::PartialFollowUp { .. } => Some(0),
            ClosureOutcome::Requeued { to, .. } => Some(*to),
            _ => None,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            ClosureOutcome::PartialFollowUp { outstanding } => {
                Some(format!("outstanding {}", outstanding))
            }
            ClosureOutcome::Requeued { from, .. } => Some(format!("baseline {}", from)),
            ClosureOutcome::BelowFloor { baseline } => Some(format!("baseline {}", baseline)),
            ClosureOutcome::Failed { reason } => Some(reason.clone()),
            _ => None,
        }
    }
}

/// Half of `amount`, rounded up.
pub fn halve_ceil(amount: u128) -> u128 {
    amount / 2 + amount % 2
}

/// Next amount to try after resource exhaustion, or `None` when the baseline
/// is already at or below `floor`.
pub fn next_close_amount(baseline: u128, floor: u128) -> Option<u128> {
    if baseline <= floor {
        None
    } else {
        Some(halve_ceil(baseline).max(floor))
    }
}

pub struct Consumer {
    ledger: Arc<dyn Ledger>,
    dedup: DedupLock,
    gas: GasPolicy,
    config: PipelineConfig,
    journal: Option<Arc<ClosureJournal>>,
}

impl Consumer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dedup: DedupLock,
        gas: GasPolicy,
        config: PipelineConfig,
    ) -> Self {
        Self {
            ledger,
            dedup,
            gas,
            config,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<ClosureJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Dequeue and process requests until shutdown.
    pub async fn run_worker(&self, worker: usize, shutdown: Arc<AtomicBool>) {
        let wait = Duration::from_millis(self.config.dequeue_wait_ms);
        info!(worker, "Consumer worker started");

        while !shutdown.load(Ordering::SeqCst) {
            let delivery = match self.dedup.queue().dequeue(wait).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker, error = %e, "Dequeue failed");
                    tokio::time::sleep(Duration::from_millis(self.config.error_backoff_ms)).await;
                    continue;
                }
            };

            debug!(worker, request = %delivery.request, "Request dequeued");
            self.process(&delivery.request).await;

            if let Err(e) = self.dedup.queue().ack(&delivery).await {
                warn!(worker, request = %delivery.request, error = %e, "Failed to acknowledge delivery");
            }
        }

        info!(worker, "Consumer worker stopped");
    }

    /// Periodically requeue deliveries left unacknowledged past the
    /// visibility timeout, until shutdown.
    pub async fn run_reaper(&self, shutdown: Arc<AtomicBool>) {
        let timeout = Duration::from_secs(self.config.visibility_timeout_secs);
        let interval = Duration::from_millis(self.config.reap_interval_ms);
        info!(visibility_timeout_secs = self.config.visibility_timeout_secs, "Delivery reaper started");

        while !shutdown.load(Ordering::SeqCst) {
            match self.dedup.queue().requeue_expired(timeout).await {
                Ok(0) => {}
                Ok(count) => warn!(count, "Requeued unacknowledged deliveries"),
                Err(e) => error!(error = %e, "Delivery reaper pass failed"),
            }
            tokio::time::sleep(interval).await;
        }

        info!("Delivery reaper stopped");
    }

    /// Process one request end to end. Never fails. Clears the pair's marker
    /// whenever this call managed to set it.
    pub async fn process(&self, request: &ClosureRequest) -> ClosureOutcome {
        info!(
            seq = request.sequence_index,
            request = %request,
            amount = request.close_amount,
            forced = request.is_forced,
            "Preparing closure"
        );

        let (outcome, tx_hash) = match self.dedup.mark_in_flight(request).await {
            Ok(()) => {
                let result = self.execute(request).await;
                if let Err(e) = self.dedup.clear_in_flight(request).await {
                    warn!(request = %request, error = %e, "Failed to clear in-flight marker, it will expire");
                }
                result
            }
            Err(e) => {
                // The marker may belong to another worker; leave it alone
                error!(request = %request, error = %e, "Could not mark closure in flight, dropping request");
                (
                    ClosureOutcome::Failed {
                        reason: format!("marker unavailable: {}", e),
                    },
                    None,
                )
            }
        };

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(request, &outcome, tx_hash.as_deref()) {
                warn!(request = %request, error = %e, "Failed to journal closure outcome");
            }
        }

        info!(
            seq = request.sequence_index,
            request = %request,
            outcome = outcome.kind(),
            "Closure finished"
        );
        outcome
    }

    async fn execute(&self, request: &ClosureRequest) -> (ClosureOutcome, Option<String>) {
        if !request.is_forced && self.is_stale(request).await {
            return (ClosureOutcome::Stale, None);
        }

        let call = request.closure_call();
        info!(request = %request, amount = call.amount, "Closure started");

        let estimate = match self.ledger.estimate_closure(&call).await {
            Ok(gas) => Some(gas),
            Err(e) if e.is_resource_exhaustion() => {
                return (self.handle_failure(request, e).await, None);
            }
            Err(e) => {
                warn!(request = %request, error = %e, "Gas estimation failed, using fallback limit");
                None
            }
        };

        let budget = match self.gas.budget(estimate).await {
            Ok(budget) => budget,
            Err(e) => {
                error!(request = %request, error = %e, "Could not compute gas budget");
                return (
                    ClosureOutcome::Failed {
                        reason: format!("{:#}", e),
                    },
                    None,
                );
            }
        };

        let pending = match self.ledger.submit_closure(&call, budget).await {
            Ok(pending) => pending,
            Err(e) => return (self.handle_failure(request, e).await, None),
        };

        let tx_hash = pending.tx_hash.clone();
        info!(
            request = %request,
            %tx_hash,
            gas_limit = budget.gas_limit,
            gas_price = budget.gas_price,
            "Closure submitted"
        );

        let outcome = match pending.confirmation.await {
            Ok(receipt) => {
                info!(
                    request = %request,
                    %tx_hash,
                    block = ?receipt.block_number,
                    gas_used = ?receipt.gas_used,
                    "Closure complete"
                );
                self.after_success(request).await
            }
            Err(e) => self.handle_failure(request, e).await,
        };

        (outcome, Some(tx_hash))
    }

    /// A failed block read does not block the closure.
    async fn is_stale(&self, request: &ClosureRequest) -> bool {
        match self.ledger.block_number().await {
            Ok(current) => {
                let threshold = current.saturating_sub(self.config.max_blocks_delay);
                if request.observed_block < threshold {
                    info!(
                        request = %request,
                        observed_block = request.observed_block,
                        current_block = current,
                        max_blocks_delay = self.config.max_blocks_delay,
                        "Stale request, abandoning"
                    );
                    return true;
                }
                false
            }
            Err(e) => {
                warn!(request = %request, error = %e, "Block read failed, skipping freshness check");
                false
            }
        }
    }

    async fn after_success(&self, request: &ClosureRequest) -> ClosureOutcome {
        if request.close_amount == 0 {
            return ClosureOutcome::Completed;
        }

        match self
            .ledger
            .outstanding_amount(&request.position_id, &request.counterparty)
            .await
        {
            Ok(0) => ClosureOutcome::PartialComplete,
            Ok(outstanding) => {
                let follow_up = request.follow_up(0);
                match self.dedup.enqueue_with_dedup(&follow_up).await {
                    Ok(_) => {
                        info!(
                            request = %request,
                            closed = request.close_amount,
                            outstanding,
                            "Partial closure, remaining amount requeued"
                        );
                        ClosureOutcome::PartialFollowUp { outstanding }
                    }
                    Err(e) => {
                        error!(request = %request, error = %e, "Failed to enqueue remaining-amount follow-up");
                        ClosureOutcome::Failed {
                            reason: format!("follow-up enqueue failed: {}", e),
                        }
                    }
                }
            }
            Err(e) => {
                error!(request = %request, error = %e, "Outstanding amount read failed after partial closure");
                ClosureOutcome::Failed {
                    reason: format!("outstanding read failed: {}", e),
                }
            }
        }
    }

    async fn handle_failure(&self, request: &ClosureRequest, err: LedgerError) -> ClosureOutcome {
        if !err.is_resource_exhaustion() {
            error!(request = %request, error = %err, "Closure failed, not retrying");
            return ClosureOutcome::Failed {
                reason: err.to_string(),
            };
        }

        let baseline = if request.close_amount == 0 {
            match self
                .ledger
                .outstanding_amount(&request.position_id, &request.counterparty)
                .await
            {
                Ok(amount) => amount,
                Err(e) => {
                    error!(request = %request, error = %e, "Outstanding amount read failed after resource exhaustion");
                    return ClosureOutcome::Failed {
                        reason: format!("outstanding read failed: {}", e),
                    };
                }
            }
        } else {
            request.close_amount
        };

        let Some(next) = next_close_amount(baseline, self.config.min_close_amount) else {
            error!(
                request = %request,
                baseline,
                floor = self.config.min_close_amount,
                "Out of gas at minimum closure amount, giving up"
            );
            return ClosureOutcome::BelowFloor { baseline };
        };

        let retry = request.follow_up(next);
        match self.dedup.enqueue_with_dedup(&retry).await {
            Ok(_) => {
                warn!(
                    request = %request,
                    from = baseline,
                    to = next,
                    "Out of gas, requeued with smaller amount"
                );
                ClosureOutcome::Requeued { from: baseline, to: next }
            }
            Err(e) => {
                error!(request = %request, error = %e, "Failed to enqueue reduced-amount retry");
                ClosureOutcome::Failed {
                    reason: format!("retry enqueue failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GasConfig;
    use crate::coordination::{
        DedupSettings, LockService, MarkerStore, MemoryLockService, MemoryMarkerStore,
        MemoryRequestQueue, RequestQueue, PROCESSING_LOCK,
    };
    use crate::ledger::{Address, FixedGasPrice, MarginSnapshot, PaperLedger, PaperPosition, PositionId};

    struct Fixture {
        consumer: Consumer,
        ledger: Arc<PaperLedger>,
        queue: Arc<MemoryRequestQueue>,
        markers: Arc<MemoryMarkerStore>,
        locks: Arc<MemoryLockService>,
    }

    async fn build(ledger: PaperLedger, outstanding: u128, config: PipelineConfig) -> Fixture {
        let ledger = Arc::new(ledger);
        let queue = Arc::new(MemoryRequestQueue::new());
        let markers = Arc::new(MemoryMarkerStore::new());
        let locks = Arc::new(MemoryLockService::new());
        let dedup = DedupLock::new(
            locks.clone(),
            markers.clone(),
            queue.clone(),
            DedupSettings::from(&config),
        );
        let gas = GasPolicy::new(GasConfig::default(), Arc::new(FixedGasPrice::new(20_000_000_000)));
        let consumer = Consumer::new(ledger.clone(), dedup, gas, config);

        ledger
            .add_position(PaperPosition {
                position_id: PositionId([1; 32]),
                counterparty: Address([2; 20]),
                expiry_timestamp: u64::MAX,
                margin: MarginSnapshot::new(300, 150, 100),
                outstanding,
            })
            .await;
        ledger.set_block_number(100).await;

        Fixture {
            consumer,
            ledger,
            queue,
            markers,
            locks,
        }
    }

    async fn fixture(outstanding: u128) -> Fixture {
        build(PaperLedger::new(), outstanding, PipelineConfig::default()).await
    }

    fn request(observed_block: u64, amount: u128, forced: bool) -> ClosureRequest {
        ClosureRequest {
            position_id: PositionId([1; 32]),
            counterparty: Address([2; 20]),
            submitter: Address([9; 20]),
            observed_block,
            close_amount: amount,
            is_forced: forced,
            sequence_index: 0,
        }
    }

    #[test]
    fn test_halve_ceil() {
        assert_eq!(halve_ceil(1_000), 500);
        assert_eq!(halve_ceil(1_001), 501);
        assert_eq!(halve_ceil(1), 1);
        assert_eq!(halve_ceil(u128::MAX), u128::MAX / 2 + 1);
    }

    #[test]
    fn test_next_close_amount_respects_floor() {
        assert_eq!(next_close_amount(1_000, 1), Some(500));
        assert_eq!(next_close_amount(2, 1), Some(1));
        assert_eq!(next_close_amount(1, 1), None);
        assert_eq!(next_close_amount(0, 1), None);
        assert_eq!(next_close_amount(150, 100), Some(100));
        assert_eq!(next_close_amount(100, 100), None);
    }

    // =========================================================================
    // Success paths
    // =========================================================================

    #[tokio::test]
    async fn test_full_close_completes_without_follow_up() {
        let f = fixture(1_000).await;
        let outcome = f.consumer.process(&request(100, 0, false)).await;

        assert_eq!(outcome, ClosureOutcome::Completed);
        assert!(f.queue.pending().await.is_empty());
        assert!(f.markers.active_keys().await.is_empty());
        assert_eq!(f.ledger.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_success_enqueues_forced_full_close() {
        let f = fixture(800).await;
        let outcome = f.consumer.process(&request(100, 500, true)).await;

        assert_eq!(outcome, ClosureOutcome::PartialFollowUp { outstanding: 300 });
        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].close_amount, 0);
        assert!(pending[0].is_forced);
        assert!(f.markers.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_success_with_nothing_left_is_done() {
        let f = fixture(500).await;
        let outcome = f.consumer.process(&request(100, 500, true)).await;

        assert_eq!(outcome, ClosureOutcome::PartialComplete);
        assert!(f.queue.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_submission_carries_gas_budget() {
        let f = fixture(1_000).await;
        f.consumer.process(&request(100, 0, false)).await;

        let submission = &f.ledger.submissions().await[0];
        assert_eq!(submission.budget.gas_price, 20_000_000_000);
        // 50_000 + 1_000 * 10, plus 20%
        assert_eq!(submission.budget.gas_limit, 72_000);
        assert_eq!(submission.call.sender, Address([9; 20]));
    }

    // =========================================================================
    // Freshness
    // =========================================================================

    #[tokio::test]
    async fn test_stale_request_abandoned_without_submission() {
        let f = fixture(1_000).await;
        let outcome = f.consumer.process(&request(94, 0, false)).await;

        assert_eq!(outcome, ClosureOutcome::Stale);
        assert!(f.ledger.submissions().await.is_empty());
        assert!(f.markers.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_at_delay_boundary_is_fresh() {
        let f = fixture(1_000).await;
        let outcome = f.consumer.process(&request(95, 0, false)).await;
        assert_eq!(outcome, ClosureOutcome::Completed);
    }

    #[tokio::test]
    async fn test_forced_request_skips_freshness_check() {
        let f = fixture(1_000).await;
        let outcome = f.consumer.process(&request(1, 0, true)).await;

        assert_eq!(outcome, ClosureOutcome::Completed);
        assert_eq!(f.ledger.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_block_read_failure_proceeds() {
        let f = fixture(1_000).await;
        f.ledger.fail_block_reads(true).await;

        let outcome = f.consumer.process(&request(1, 0, false)).await;
        assert_eq!(outcome, ClosureOutcome::Completed);
    }

    // =========================================================================
    // Resource exhaustion
    // =========================================================================

    #[tokio::test]
    async fn test_out_of_gas_full_close_halves_outstanding() {
        let f = fixture(1_000).await;
        f.ledger
            .fail_next_submission(LedgerError::ResourceExhaustion("out of gas".to_string()))
            .await;

        let outcome = f.consumer.process(&request(100, 0, false)).await;

        assert_eq!(outcome, ClosureOutcome::Requeued { from: 1_000, to: 500 });
        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].close_amount, 500);
        assert!(pending[0].is_forced);
        assert!(f.markers.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_gas_with_amount_rounds_up() {
        let f = fixture(5_000).await;
        f.ledger
            .fail_next_submission(LedgerError::ResourceExhaustion("out of gas".to_string()))
            .await;

        let outcome = f.consumer.process(&request(100, 1_001, true)).await;
        assert_eq!(outcome, ClosureOutcome::Requeued { from: 1_001, to: 501 });
    }

    #[tokio::test]
    async fn test_out_of_gas_on_confirmation_halves() {
        let f = build(
            PaperLedger::new().with_max_close_per_tx(100),
            1_000,
            PipelineConfig::default(),
        )
        .await;

        let outcome = f.consumer.process(&request(100, 0, false)).await;
        assert_eq!(outcome, ClosureOutcome::Requeued { from: 1_000, to: 500 });
        assert!(f.ledger.submissions().await[0].tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_out_of_gas_during_estimate_halves_without_submitting() {
        let f = fixture(1_000).await;
        f.ledger
            .fail_next_estimate(LedgerError::ResourceExhaustion("out of gas".to_string()))
            .await;

        let outcome = f.consumer.process(&request(100, 0, false)).await;
        assert_eq!(outcome, ClosureOutcome::Requeued { from: 1_000, to: 500 });
        assert!(f.ledger.submissions().await.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_gas_at_floor_is_terminal() {
        let f = fixture(1_000).await;
        f.ledger
            .fail_next_submission(LedgerError::ResourceExhaustion("out of gas".to_string()))
            .await;

        let outcome = f.consumer.process(&request(100, 1, true)).await;
        assert_eq!(outcome, ClosureOutcome::BelowFloor { baseline: 1 });
        assert!(f.queue.pending().await.is_empty());
        assert!(f.markers.active_keys().await.is_empty());
    }

    // =========================================================================
    // Other failures
    // =========================================================================

    #[tokio::test]
    async fn test_other_submission_error_is_terminal() {
        let f = fixture(1_000).await;
        f.ledger
            .fail_next_submission(LedgerError::Rejected("revert: loan healthy".to_string()))
            .await;

        let outcome = f.consumer.process(&request(100, 0, false)).await;
        assert!(matches!(outcome, ClosureOutcome::Failed { .. }));
        assert!(f.queue.pending().await.is_empty());
        assert!(f.markers.active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_exhaustion_estimate_error_uses_fallback_limit() {
        let f = fixture(1_000).await;
        f.ledger
            .fail_next_estimate(LedgerError::Transport("reset".to_string()))
            .await;

        let outcome = f.consumer.process(&request(100, 0, false)).await;
        assert_eq!(outcome, ClosureOutcome::Completed);
        assert_eq!(
            f.ledger.submissions().await[0].budget.gas_limit,
            GasConfig::default().max_gas_limit
        );
    }

    #[tokio::test]
    async fn test_marker_failure_leaves_existing_marker() {
        let config = PipelineConfig {
            lock_retry_count: 2,
            lock_retry_delay_ms: 1,
            ..PipelineConfig::default()
        };
        let f = build(PaperLedger::new(), 1_000, config).await;
        let req = request(100, 0, false);

        // Another worker owns the pair and currently holds the processing lock
        f.markers.set(&req.marker_key(), Duration::from_secs(60)).await.unwrap();
        let _held = f
            .locks
            .try_acquire(PROCESSING_LOCK, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let outcome = f.consumer.process(&req).await;
        assert!(matches!(outcome, ClosureOutcome::Failed { .. }));
        assert!(f.ledger.submissions().await.is_empty());
        assert_eq!(f.markers.active_keys().await, vec![req.marker_key()]);
    }

    // =========================================================================
    // Convergence, journal and worker loop
    // =========================================================================

    #[tokio::test]
    async fn test_halving_and_follow_ups_converge_to_full_close() {
        let f = build(
            PaperLedger::new().with_max_close_per_tx(400),
            1_000,
            PipelineConfig::default(),
        )
        .await;
        f.queue.enqueue(&request(100, 0, false)).await.unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..20 {
            let Some(delivery) = f.queue.dequeue(Duration::from_millis(1)).await.unwrap() else {
                break;
            };
            outcomes.push(f.consumer.process(&delivery.request).await);
            f.queue.ack(&delivery).await.unwrap();
        }

        assert_eq!(outcomes.last(), Some(&ClosureOutcome::Completed));
        assert_eq!(
            f.ledger
                .position(&PositionId([1; 32]), &Address([2; 20]))
                .await
                .unwrap()
                .outstanding,
            0
        );
        assert!(f.markers.active_keys().await.is_empty());
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, ClosureOutcome::PartialFollowUp { .. })));
    }

    #[tokio::test]
    async fn test_outcome_is_journaled() {
        let mut f = fixture(1_000).await;
        let journal = Arc::new(ClosureJournal::in_memory().unwrap());
        f.consumer = f.consumer.with_journal(journal.clone());

        f.consumer.process(&request(100, 0, false)).await;

        let entries = journal.recent(5).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "completed");
        assert!(entries[0].tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_worker_processes_and_acks() {
        let config = PipelineConfig {
            dequeue_wait_ms: 10,
            ..PipelineConfig::default()
        };
        let f = build(PaperLedger::new(), 1_000, config).await;
        f.queue.enqueue(&request(100, 0, false)).await.unwrap();

        let consumer = Arc::new(f.consumer);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run_worker(0, shutdown).await })
        };

        for _ in 0..200 {
            if f.ledger.submissions().await.len() == 1 && f.queue.in_flight_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.store(true, Ordering::SeqCst);
        worker.await.unwrap();

        assert_eq!(f.ledger.submissions().await.len(), 1);
        assert!(f.queue.pending().await.is_empty());
        assert_eq!(f.queue.in_flight_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_requeues_abandoned_delivery() {
        let config = PipelineConfig {
            visibility_timeout_secs: 5,
            reap_interval_ms: 1_000,
            ..PipelineConfig::default()
        };
        let f = build(PaperLedger::new(), 1_000, config).await;
        f.queue.enqueue(&request(100, 0, false)).await.unwrap();
        let _abandoned = f.queue.dequeue(Duration::from_millis(1)).await.unwrap().unwrap();

        let consumer = Arc::new(f.consumer);
        let shutdown = Arc::new(AtomicBool::new(false));
        let reaper = {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run_reaper(shutdown).await })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(f.queue.pending().await.is_empty());

        tokio::time::sleep(Duration::from_secs(4)).await;
        shutdown.store(true, Ordering::SeqCst);
        reaper.await.unwrap();

        assert_eq!(f.queue.pending().await, vec![request(100, 0, false)]);
        assert_eq!(f.queue.in_flight_count().await, 0);
    }
}

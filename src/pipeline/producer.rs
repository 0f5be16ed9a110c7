//! Sweep loop: page through active positions and enqueue closures for the
//! unsafe ones.

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::evaluator::{SafetyEvaluator, Verdict};
use super::request::ClosureRequest;
use crate::config::PipelineConfig;
use crate::coordination::{DedupLock, EnqueueOutcome};
use crate::ledger::{codec, Address, Ledger, LedgerError, Position};

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub observed_block: u64,
    pub pages: u64,
    pub positions: u64,
    pub unsafe_positions: u64,
    pub in_progress: u64,
    pub enqueued: u64,
    pub skipped: u64,
    pub enqueue_errors: u64,
}

enum PositionOutcome {
    Safe,
    InProgress,
    Enqueued,
    Skipped,
    EnqueueFailed,
}

/// Drives sweeps over the position list.
pub struct Producer {
    ledger: Arc<dyn Ledger>,
    evaluator: SafetyEvaluator,
    dedup: DedupLock,
    sender: Address,
    config: PipelineConfig,
}

impl Producer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dedup: DedupLock,
        sender: Address,
        config: PipelineConfig,
    ) -> Self {
        let evaluator = SafetyEvaluator::new(ledger.clone(), dedup.clone());
        Self {
            ledger,
            evaluator,
            dedup,
            sender,
            config,
        }
    }

    /// Sweep forever until shutdown. A failed sweep is logged and the next
    /// one starts again from the first position.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(sender = %self.sender, page_size = self.config.page_size, "Producer started");

        while !shutdown.load(Ordering::SeqCst) {
            match self.sweep().await {
                Ok(stats) => {
                    info!(
                        block = stats.observed_block,
                        pages = stats.pages,
                        positions = stats.positions,
                        unsafe_positions = stats.unsafe_positions,
                        enqueued = stats.enqueued,
                        skipped = stats.skipped,
                        in_progress = stats.in_progress,
                        "Sweep complete"
                    );
                    if self.config.sweep_interval_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.config.sweep_interval_ms)).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Sweep failed, restarting from the first position");
                    tokio::time::sleep(Duration::from_millis(self.config.error_backoff_ms)).await;
                }
            }
        }

        info!("Producer stopped");
    }

    /// One full pass over every page of active positions.
    pub async fn sweep(&self) -> Result<SweepStats, LedgerError> {
        let observed_block = self.ledger.block_number().await?;
        info!(block = observed_block, sender = %self.sender, "Starting sweep");

        let mut stats = SweepStats {
            observed_block,
            ..SweepStats::default()
        };
        let page_size = self.config.page_size;
        let mut start = 0u64;

        loop {
            let raw = self.ledger.list_active_positions(start, page_size).await?;
            let positions = codec::decode_positions(&raw)?;
            stats.pages += 1;
            stats.positions += positions.len() as u64;

            info!(start, count = positions.len(), "Fetched position page");

            self.process_page(&positions, start, observed_block, &mut stats)
                .await;

            if (positions.len() as u64) < page_size {
                break;
            }
            start += page_size;
        }

        Ok(stats)
    }

    async fn process_page(
        &self,
        positions: &[Position],
        start: u64,
        observed_block: u64,
        stats: &mut SweepStats,
    ) {
        let now = Utc::now().timestamp().max(0) as u64;

        let outcomes = join_all(positions.iter().enumerate().map(|(offset, position)| {
            let seq = start + offset as u64;
            self.process_position(position, seq, observed_block, now)
        }))
        .await;

        for outcome in outcomes {
            match outcome {
                PositionOutcome::Safe => {}
                PositionOutcome::InProgress => stats.in_progress += 1,
                PositionOutcome::Enqueued => {
                    stats.unsafe_positions += 1;
                    stats.enqueued += 1;
                }
                PositionOutcome::Skipped => {
                    stats.unsafe_positions += 1;
                    stats.skipped += 1;
                }
                PositionOutcome::EnqueueFailed => {
                    stats.unsafe_positions += 1;
                    stats.enqueue_errors += 1;
                }
            }
        }
    }

    async fn process_position(
        &self,
        position: &Position,
        seq: u64,
        observed_block: u64,
        now: u64,
    ) -> PositionOutcome {
        let reason = match self.evaluator.evaluate(position, seq, now).await {
            Verdict::InProgress => return PositionOutcome::InProgress,
            Verdict::Safe(_) => {
                info!(seq, position = %position.position_id, "Position is safe");
                return PositionOutcome::Safe;
            }
            Verdict::Unsafe { reason, .. } => reason,
        };

        info!(
            seq,
            position = %position.position_id,
            counterparty = %position.counterparty,
            ?reason,
            block = observed_block,
            "Position is not safe, requesting closure"
        );

        let request = ClosureRequest::for_unsafe_position(position, self.sender, observed_block, seq);
        match self.dedup.enqueue_with_dedup(&request).await {
            Ok(EnqueueOutcome::Enqueued) => PositionOutcome::Enqueued,
            Ok(EnqueueOutcome::SkippedInFlight) => PositionOutcome::Skipped,
            Err(e) => {
                warn!(seq, position = %position.position_id, error = %e, "Failed to enqueue closure request");
                PositionOutcome::EnqueueFailed
            }
        }
    }
}

//! At-most-one-in-flight protocol on top of the lock, marker and queue
//! services.
//!
//! The producer checks the marker before enqueueing so the queue does not
//! pile up duplicates; the consumer sets the marker for the duration of
//! processing so a pair is never executed twice concurrently. Every
//! check-then-act runs inside the global processing lock, which is never
//! held across a ledger call.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::config::PipelineConfig;
use crate::ledger::{Address, PositionId};
use crate::pipeline::{marker_key, ClosureRequest};

pub const PROCESSING_LOCK: &str = "processing:lock";

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A closure for the pair is already in flight
    SkippedInFlight,
}

#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub producer_lock_ttl: Duration,
    pub consumer_lock_ttl: Duration,
    pub marker_ttl: Duration,
    pub lock_retry_count: u32,
    pub lock_retry_delay: Duration,
}

impl From<&PipelineConfig> for DedupSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            producer_lock_ttl: Duration::from_millis(config.producer_lock_ttl_ms),
            consumer_lock_ttl: Duration::from_millis(config.consumer_lock_ttl_ms),
            marker_ttl: Duration::from_secs(config.marker_ttl_secs),
            lock_retry_count: config.lock_retry_count,
            lock_retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
        }
    }
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Shared handle to the coordination services.
#[derive(Clone)]
pub struct DedupLock {
    locks: Arc<dyn LockService>,
    markers: Arc<dyn MarkerStore>,
    queue: Arc<dyn RequestQueue>,
    settings: DedupSettings,
}

impl DedupLock {
    pub fn new(
        locks: Arc<dyn LockService>,
        markers: Arc<dyn MarkerStore>,
        queue: Arc<dyn RequestQueue>,
        settings: DedupSettings,
    ) -> Self {
        Self {
            locks,
            markers,
            queue,
            settings,
        }
    }

    pub fn queue(&self) -> &Arc<dyn RequestQueue> {
        &self.queue
    }

    /// Whether a closure for the pair is currently in flight. Lock-free read.
    pub async fn is_in_flight(
        &self,
        position_id: &PositionId,
        counterparty: &Address,
    ) -> Result<bool, CoordinationError> {
        self.markers.exists(&marker_key(position_id, counterparty)).await
    }

    /// Enqueue unless a closure for the pair is already in flight. Forced
    /// requests are always enqueued.
    pub async fn enqueue_with_dedup(
        &self,
        request: &ClosureRequest,
    ) -> Result<EnqueueOutcome, CoordinationError> {
        let handle = self.acquire(self.settings.producer_lock_ttl).await?;

        let result: Result<EnqueueOutcome, CoordinationError> = async {
            if !request.is_forced && self.markers.exists(&request.marker_key()).await? {
                return Ok(EnqueueOutcome::SkippedInFlight);
            }
            self.queue.enqueue(request).await?;
            Ok(EnqueueOutcome::Enqueued)
        }
        .await;

        self.release(&handle).await;

        match &result {
            Ok(EnqueueOutcome::SkippedInFlight) => {
                info!(
                    seq = request.sequence_index,
                    request = %request,
                    "Submit skipped, closure already in flight"
                );
            }
            Ok(EnqueueOutcome::Enqueued) => {
                debug!(
                    seq = request.sequence_index,
                    request = %request,
                    amount = request.close_amount,
                    forced = request.is_forced,
                    "Closure request enqueued"
                );
            }
            Err(_) => {}
        }
        result
    }

    /// Mark the pair as being processed.
    pub async fn mark_in_flight(&self, request: &ClosureRequest) -> Result<(), CoordinationError> {
        let handle = self.acquire(self.settings.consumer_lock_ttl).await?;
        let result = self
            .markers
            .set(&request.marker_key(), self.settings.marker_ttl)
            .await;
        self.release(&handle).await;
        result
    }

    /// Clear the pair's marker so future sweeps can evaluate it again.
    pub async fn clear_in_flight(&self, request: &ClosureRequest) -> Result<(), CoordinationError> {
        let handle = self.acquire(self.settings.consumer_lock_ttl).await?;
        let result = self.markers.delete(&request.marker_key()).await;
        self.release(&handle).await;
        result
    }

    async fn acquire(&self, ttl: Duration) -> Result<LockHandle, CoordinationError> {
        let attempts = self.settings.lock_retry_count.max(1);
        for attempt in 1..=attempts {
            if let Some(handle) = self.locks.try_acquire(PROCESSING_LOCK, ttl).await? {
                return Ok(handle);
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.lock_retry_delay).await;
            }
        }
        Err(CoordinationError::LockUnavailable(PROCESSING_LOCK.to_string()))
    }

    /// Release failures are only logged: the lock expires on its own.
    async fn release(&self, handle: &LockHandle) {
        if let Err(e) = self.locks.release(handle).await {
            warn!(lock = %handle.name, error = %e, "Failed to release processing lock");
        }
    }
}

//! Position safety classification.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::coordination::DedupLock;
use crate::ledger::{Ledger, MarginSnapshot, Position};

/// Why a position is eligible for closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnsafeReason {
    Undercollateralized,
    Expired,
    UndercollateralizedAndExpired,
}

/// Outcome of evaluating one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// A closure for the pair is already in flight; not evaluated
    InProgress,
    Safe(MarginSnapshot),
    Unsafe {
        snapshot: MarginSnapshot,
        reason: UnsafeReason,
    },
}

impl Verdict {
    pub fn is_unsafe(&self) -> bool {
        matches!(self, Verdict::Unsafe { .. })
    }
}

/// Unsafe iff `current <= maintenance` or `now >= expiry`.
pub fn classify(snapshot: &MarginSnapshot, expiry_timestamp: u64, now: u64) -> Option<UnsafeReason> {
    let undercollateralized = snapshot.is_undercollateralized();
    let expired = now >= expiry_timestamp;

    match (undercollateralized, expired) {
        (true, true) => Some(UnsafeReason::UndercollateralizedAndExpired),
        (true, false) => Some(UnsafeReason::Undercollateralized),
        (false, true) => Some(UnsafeReason::Expired),
        (false, false) => None,
    }
}

/// Reads margin figures and classifies positions.
pub struct SafetyEvaluator {
    ledger: Arc<dyn Ledger>,
    dedup: DedupLock,
}

impl SafetyEvaluator {
    pub fn new(ledger: Arc<dyn Ledger>, dedup: DedupLock) -> Self {
        Self { ledger, dedup }
    }

    /// Evaluate a position at unix time `now`. Never fails: a failed margin
    /// read is replaced by the zero snapshot, which is unsafe.
    pub async fn evaluate(&self, position: &Position, seq: u64, now: u64) -> Verdict {
        match self
            .dedup
            .is_in_flight(&position.position_id, &position.counterparty)
            .await
        {
            Ok(true) => {
                debug!(seq, position = %position.position_id, "Closure in progress, skipping evaluation");
                return Verdict::InProgress;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(seq, position = %position.position_id, error = %e, "Marker check failed, evaluating anyway");
            }
        }

        let snapshot = match self
            .ledger
            .margin_levels(&position.position_id, &position.counterparty)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    seq,
                    position = %position.position_id,
                    counterparty = %position.counterparty,
                    expiry = position.expiry_timestamp,
                    error = %e,
                    "Margin read failed, assuming zero margin"
                );
                MarginSnapshot::zero()
            }
        };

        debug!(
            seq,
            position = %position.position_id,
            counterparty = %position.counterparty,
            expiry = position.expiry_timestamp,
            initial = snapshot.initial,
            maintenance = snapshot.maintenance,
            current = snapshot.current,
            "Margin levels"
        );

        match classify(&snapshot, position.expiry_timestamp, now) {
            Some(reason) => Verdict::Unsafe { snapshot, reason },
            None => Verdict::Safe(snapshot),
        }
    }
}

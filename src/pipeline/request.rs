//! Closure requests carried from producer to consumer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ledger::{Address, ClosureCall, Position, PositionId};

/// A request to close (part of) one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureRequest {
    pub position_id: PositionId,
    pub counterparty: Address,
    /// Account the closing transaction is sent from
    pub submitter: Address,
    /// Block at which the position was judged unsafe
    pub observed_block: u64,
    /// 0 closes the maximum available
    #[serde(default)]
    pub close_amount: u128,
    /// Bypasses the freshness and dedup checks
    #[serde(default)]
    pub is_forced: bool,
    /// Diagnostic ordering tag (position index within the sweep)
    #[serde(default)]
    pub sequence_index: u64,
}

impl ClosureRequest {
    /// Full-close request for a position found unsafe by a sweep.
    pub fn for_unsafe_position(
        position: &Position,
        submitter: Address,
        observed_block: u64,
        sequence_index: u64,
    ) -> Self {
        Self {
            position_id: position.position_id,
            counterparty: position.counterparty,
            submitter,
            observed_block,
            close_amount: 0,
            is_forced: false,
            sequence_index,
        }
    }

    /// Forced follow-up for the same pair with a new amount.
    pub fn follow_up(&self, close_amount: u128) -> Self {
        Self {
            close_amount,
            is_forced: true,
            ..self.clone()
        }
    }

    pub fn closure_call(&self) -> ClosureCall {
        ClosureCall {
            position_id: self.position_id,
            counterparty: self.counterparty,
            sender: self.submitter,
            amount: self.close_amount,
        }
    }

    /// Marker key for the `(position, counterparty)` pair.
    pub fn marker_key(&self) -> String {
        marker_key(&self.position_id, &self.counterparty)
    }
}

pub fn marker_key(position_id: &PositionId, counterparty: &Address) -> String {
    format!("liquidate:{}:{}", position_id, counterparty)
}

impl fmt::Display for ClosureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.observed_block, self.position_id)
    }
}

//! In-memory paper ledger for dry runs and tests.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::codec::encode_positions;
use super::error::LedgerError;
use super::traits::Ledger;
use super::types::*;

/// Simulated position state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaperPosition {
    pub position_id: PositionId,
    pub counterparty: Address,
    pub expiry_timestamp: u64,
    pub margin: MarginSnapshot,
    /// Amount still closable
    pub outstanding: u128,
}

/// A closure the paper ledger accepted or refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub call: ClosureCall,
    pub budget: GasBudget,
    pub tx_hash: Option<String>,
    pub result: Result<u128, LedgerError>,
}

#[derive(Debug, Default)]
struct PaperState {
    block_number: u64,
    /// Insertion order is the ledger's stable index
    positions: Vec<PaperPosition>,
    failing_margin_reads: HashMap<(PositionId, Address), LedgerError>,
    scripted_submissions: VecDeque<LedgerError>,
    scripted_estimates: VecDeque<LedgerError>,
    failing_list: Option<LedgerError>,
    failing_block_reads: bool,
    submissions: Vec<RecordedSubmission>,
    list_calls: Vec<(u64, u64)>,
}

/// Paper ledger that simulates listing, margin reads and closures.
pub struct PaperLedger {
    state: Arc<RwLock<PaperState>>,
    tx_counter: AtomicU64,
    /// Largest amount a single transaction can close before running out of gas
    max_close_per_tx: Option<u128>,
}

impl Default for PaperLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperLedger {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState::default())),
            tx_counter: AtomicU64::new(1),
            max_close_per_tx: None,
        }
    }

    /// Simulate a per-transaction closable cap: any attempt to close more
    /// fails with resource exhaustion.
    pub fn with_max_close_per_tx(mut self, cap: u128) -> Self {
        self.max_close_per_tx = Some(cap);
        self
    }

    /// Load positions from a JSON fixture (array of `PaperPosition`).
    pub async fn seed_from_json(&self, json: &str) -> anyhow::Result<usize> {
        let positions: Vec<PaperPosition> = serde_json::from_str(json)?;
        let count = positions.len();
        for position in positions {
            self.add_position(position).await;
        }
        info!(positions = count, "Paper ledger seeded");
        Ok(count)
    }

    pub async fn add_position(&self, position: PaperPosition) {
        self.state.write().await.positions.push(position);
    }

    pub async fn set_block_number(&self, block: u64) {
        self.state.write().await.block_number = block;
    }

    pub async fn advance_blocks(&self, blocks: u64) {
        self.state.write().await.block_number += blocks;
    }

    pub async fn set_margin(&self, id: &PositionId, counterparty: &Address, margin: MarginSnapshot) {
        let mut state = self.state.write().await;
        if let Some(p) = find_mut(&mut state.positions, id, counterparty) {
            p.margin = margin;
        }
    }

    pub async fn set_outstanding(&self, id: &PositionId, counterparty: &Address, amount: u128) {
        let mut state = self.state.write().await;
        if let Some(p) = find_mut(&mut state.positions, id, counterparty) {
            p.outstanding = amount;
        }
    }

    /// Make margin reads for one position fail.
    pub async fn fail_margin_reads(&self, id: PositionId, counterparty: Address, error: LedgerError) {
        self.state
            .write()
            .await
            .failing_margin_reads
            .insert((id, counterparty), error);
    }

    /// Queue an error for the next submission, ahead of the simulated outcome.
    pub async fn fail_next_submission(&self, error: LedgerError) {
        self.state.write().await.scripted_submissions.push_back(error);
    }

    /// Queue an error for the next gas estimate.
    pub async fn fail_next_estimate(&self, error: LedgerError) {
        self.state.write().await.scripted_estimates.push_back(error);
    }

    pub async fn fail_listing(&self, error: Option<LedgerError>) {
        self.state.write().await.failing_list = error;
    }

    pub async fn fail_block_reads(&self, failing: bool) {
        self.state.write().await.failing_block_reads = failing;
    }

    pub async fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state.read().await.submissions.clone()
    }

    pub async fn list_calls(&self) -> Vec<(u64, u64)> {
        self.state.read().await.list_calls.clone()
    }

    pub async fn position(&self, id: &PositionId, counterparty: &Address) -> Option<PaperPosition> {
        self.state
            .read()
            .await
            .positions
            .iter()
            .find(|p| p.position_id == *id && p.counterparty == *counterparty)
            .cloned()
    }

    fn next_tx_hash(&self) -> String {
        let n = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        format!("0x{:064x}", n)
    }
}

fn find_mut<'a>(
    positions: &'a mut [PaperPosition],
    id: &PositionId,
    counterparty: &Address,
) -> Option<&'a mut PaperPosition> {
    positions
        .iter_mut()
        .find(|p| p.position_id == *id && p.counterparty == *counterparty)
}

#[async_trait]
impl Ledger for PaperLedger {
    async fn block_number(&self) -> Result<u64, LedgerError> {
        let state = self.state.read().await;
        if state.failing_block_reads {
            return Err(LedgerError::Transport("block read unavailable".to_string()));
        }
        Ok(state.block_number)
    }

    async fn list_active_positions(&self, start: u64, count: u64) -> Result<Vec<u8>, LedgerError> {
        let mut state = self.state.write().await;
        state.list_calls.push((start, count));
        if let Some(err) = state.failing_list.clone() {
            return Err(err);
        }

        let page: Vec<Position> = state
            .positions
            .iter()
            .filter(|p| p.outstanding > 0)
            .skip(start as usize)
            .take(count as usize)
            .map(|p| Position {
                position_id: p.position_id,
                counterparty: p.counterparty,
                expiry_timestamp: p.expiry_timestamp,
            })
            .collect();

        debug!(start, count, returned = page.len(), "Paper position page");
        Ok(encode_positions(&page))
    }

    async fn margin_levels(
        &self,
        position_id: &PositionId,
        counterparty: &Address,
    ) -> Result<MarginSnapshot, LedgerError> {
        let state = self.state.read().await;
        if let Some(err) = state.failing_margin_reads.get(&(*position_id, *counterparty)) {
            return Err(err.clone());
        }
        state
            .positions
            .iter()
            .find(|p| p.position_id == *position_id && p.counterparty == *counterparty)
            .map(|p| p.margin)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown position {}", position_id)))
    }

    async fn outstanding_amount(
        &self,
        position_id: &PositionId,
        counterparty: &Address,
    ) -> Result<u128, LedgerError> {
        Ok(self
            .position(position_id, counterparty)
            .await
            .map(|p| p.outstanding)
            .unwrap_or(0))
    }

    async fn estimate_closure(&self, call: &ClosureCall) -> Result<u64, LedgerError> {
        if let Some(err) = self.state.write().await.scripted_estimates.pop_front() {
            return Err(err);
        }
        let outstanding = self.outstanding_amount(&call.position_id, &call.counterparty).await?;
        let effective = if call.amount == 0 {
            outstanding
        } else {
            call.amount.min(outstanding)
        };
        // Flat base cost plus a per-unit component, enough to exercise budgeting
        Ok(50_000 + (effective.min(1_000_000) as u64) * 10)
    }

    async fn submit_closure(
        &self,
        call: &ClosureCall,
        budget: GasBudget,
    ) -> Result<PendingSubmission, LedgerError> {
        let mut state = self.state.write().await;

        if let Some(err) = state.scripted_submissions.pop_front() {
            state.submissions.push(RecordedSubmission {
                call: call.clone(),
                budget,
                tx_hash: None,
                result: Err(err.clone()),
            });
            return Err(err);
        }

        let cap = self.max_close_per_tx;
        let position = find_mut(&mut state.positions, &call.position_id, &call.counterparty)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown position {}", call.position_id)))?;

        let requested = if call.amount == 0 {
            position.outstanding
        } else {
            call.amount.min(position.outstanding)
        };

        let result = match cap {
            Some(cap) if requested > cap => Err(LedgerError::ResourceExhaustion(format!(
                "out of gas closing {} (cap {})",
                requested, cap
            ))),
            _ => {
                position.outstanding -= requested;
                Ok(requested)
            }
        };

        let tx_hash = self.next_tx_hash();
        let block_number = state.block_number;
        state.submissions.push(RecordedSubmission {
            call: call.clone(),
            budget,
            tx_hash: Some(tx_hash.clone()),
            result: result.clone(),
        });

        match result {
            Ok(closed) => {
                info!(
                    position = %call.position_id,
                    closed,
                    %tx_hash,
                    "Paper closure executed"
                );
                let receipt = ClosureReceipt {
                    tx_hash: tx_hash.clone(),
                    block_number: Some(block_number),
                    gas_used: Some(budget.gas_limit),
                };
                Ok(PendingSubmission::settled(tx_hash, Ok(receipt)))
            }
            // Runs out of gas after being mined, like the real ledger
            Err(err) => Ok(PendingSubmission::settled(tx_hash, Err(err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::codec::decode_positions;

    fn paper_position(id: u8, outstanding: u128) -> PaperPosition {
        PaperPosition {
            position_id: PositionId([id; 32]),
            counterparty: Address([id; 20]),
            expiry_timestamp: u64::MAX,
            margin: MarginSnapshot::new(300, 150, 200),
            outstanding,
        }
    }

    fn call(id: u8, amount: u128) -> ClosureCall {
        ClosureCall {
            position_id: PositionId([id; 32]),
            counterparty: Address([id; 20]),
            sender: Address::default(),
            amount,
        }
    }

    const BUDGET: GasBudget = GasBudget {
        gas_limit: 100_000,
        gas_price: 1,
    };

    #[tokio::test]
    async fn test_listing_pages_in_stable_order() {
        let ledger = PaperLedger::new();
        for id in 1..=3 {
            ledger.add_position(paper_position(id, 100)).await;
        }

        let page = decode_positions(&ledger.list_active_positions(2, 2).await.unwrap()).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].position_id, PositionId([3; 32]));
        assert_eq!(ledger.list_calls().await, vec![(2, 2)]);
    }

    #[tokio::test]
    async fn test_partial_close_reduces_outstanding() {
        let ledger = PaperLedger::new();
        ledger.add_position(paper_position(1, 800)).await;

        let pending = ledger.submit_closure(&call(1, 500), BUDGET).await.unwrap();
        pending.confirmation.await.unwrap();

        assert_eq!(
            ledger
                .outstanding_amount(&PositionId([1; 32]), &Address([1; 20]))
                .await
                .unwrap(),
            300
        );
    }

    #[tokio::test]
    async fn test_cap_produces_resource_exhaustion_on_confirmation() {
        let ledger = PaperLedger::new().with_max_close_per_tx(400);
        ledger.add_position(paper_position(1, 1000)).await;

        let pending = ledger.submit_closure(&call(1, 0), BUDGET).await.unwrap();
        let err = pending.confirmation.await.unwrap_err();
        assert!(err.is_resource_exhaustion());

        let position = ledger.position(&PositionId([1; 32]), &Address([1; 20])).await.unwrap();
        assert_eq!(position.outstanding, 1000);
    }

    #[tokio::test]
    async fn test_seed_from_json_fixture() {
        let ledger = PaperLedger::new();
        let json = r#"[{
            "position_id": "0xb77ef4d44921f346d48c33902de3bce4a89087aad60c7373394a51092c9824f0",
            "counterparty": "0xdf2db45ed0df076e5d6d302b416a5971ff5ad61f",
            "expiry_timestamp": 1700000000,
            "margin": {"initial": 300, "maintenance": 150, "current": 100},
            "outstanding": 1000
        }]"#;

        assert_eq!(ledger.seed_from_json(json).await.unwrap(), 1);
        let page = decode_positions(&ledger.list_active_positions(0, 10).await.unwrap()).unwrap();
        assert_eq!(page[0].expiry_timestamp, 1_700_000_000);
    }
}

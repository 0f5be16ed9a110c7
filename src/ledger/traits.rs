//! Collaborator interfaces for the ledger binding and gas pricing.
//!
//! The pipeline only talks to the ledger through these traits, so the HTTP
//! gateway client and the in-memory paper ledger are interchangeable.

use async_trait::async_trait;

use super::error::LedgerError;
use super::types::{Address, ClosureCall, GasBudget, MarginSnapshot, PendingSubmission, PositionId};

/// Read/write access to the margin-lending ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current block height.
    async fn block_number(&self) -> Result<u64, LedgerError>;

    /// Raw page of active positions in the fixed-width record layout.
    async fn list_active_positions(&self, start: u64, count: u64) -> Result<Vec<u8>, LedgerError>;

    async fn margin_levels(
        &self,
        position_id: &PositionId,
        counterparty: &Address,
    ) -> Result<MarginSnapshot, LedgerError>;

    /// Amount still closable on the position.
    async fn outstanding_amount(
        &self,
        position_id: &PositionId,
        counterparty: &Address,
    ) -> Result<u128, LedgerError>;

    /// Gas the closing call is expected to consume.
    async fn estimate_closure(&self, call: &ClosureCall) -> Result<u64, LedgerError>;

    /// Submit a closing transaction. Returns once the ledger has accepted it;
    /// the confirmation resolves separately.
    async fn submit_closure(
        &self,
        call: &ClosureCall,
        budget: GasBudget,
    ) -> Result<PendingSubmission, LedgerError>;
}

/// Source of the gas price for closure submissions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasPriceOracle: Send + Sync {
    /// Gas price in the ledger's smallest fee unit.
    async fn gas_price(&self) -> anyhow::Result<u128>;
}

//! Ledger bindings for the liquidation pipeline.
//!
//! ## Reads
//! - Active position pages (fixed-width records, see `codec`)
//! - Margin levels and outstanding closable amount per position
//! - Current block height
//!
//! ## Writes
//! - Closure gas estimation and two-stage submission (hash, then receipt)
//!
//! `HttpLedgerClient` talks to the ledger gateway; `PaperLedger` simulates a
//! ledger in memory for dry runs and tests.

mod client;
pub mod codec;
mod error;
mod gas;
pub mod paper;
mod traits;
mod types;

pub use client::HttpLedgerClient;
pub use error::{classify_revert, LedgerError};
pub use gas::{FixedGasPrice, GasPolicy};
pub use paper::{PaperLedger, PaperPosition};
pub use traits::{GasPriceOracle, Ledger};
pub use types::*;

#[cfg(test)]
pub use traits::MockGasPriceOracle;

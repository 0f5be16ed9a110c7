//! # Margin Liquidator
//!
//! Watches open margin loans on a lending ledger and force-closes the ones
//! that fall below maintenance margin or reach expiry.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `ledger`: Ledger gateway client, position codec, gas budgeting, paper ledger
//! - `coordination`: Processing lock, in-flight markers and request queue
//! - `pipeline`: Sweep producer, safety evaluation and consumer workers
//! - `journal`: SQLite audit trail of closure outcomes

pub mod config;
pub mod coordination;
pub mod journal;
pub mod ledger;
pub mod pipeline;

pub use config::Config;

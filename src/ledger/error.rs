//! Typed ledger failures.

use thiserror::Error;

/// Failure of a ledger read or write.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The call ran out of its execution budget. Recoverable by retrying
    /// with a smaller closure amount.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Payload did not match the expected record layout.
    #[error("schema mismatch: {0}")]
    Schema(String),

    /// Network or gateway failure on a read or write.
    #[error("transport error: {0}")]
    Transport(String),

    /// The ledger rejected the call for any other reason.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Submitted but not confirmed in time.
    #[error("confirmation timed out for {0}")]
    ConfirmationTimeout(String),
}

impl LedgerError {
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, LedgerError::ResourceExhaustion(_))
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Transport(err.to_string())
    }
}

/// Map a ledger-side revert message onto the error taxonomy.
///
/// Estimation failures surface as "execution failed due to an exception",
/// which the ledger also reports for gas starvation, so both count as
/// resource exhaustion.
pub fn classify_revert(message: &str) -> LedgerError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("out of gas") || lower.contains("execution failed due to an exception") {
        LedgerError::ResourceExhaustion(message.to_string())
    } else {
        LedgerError::Rejected(message.to_string())
    }
}

//! Client side of the ledger service: the remote system that holds the
//! invoice inventory and records which invoices have been paid.
//!
//! The notification endpoint is called at least once per paid invoice. A
//! POST can succeed remotely and still be retried here when the response is
//! lost, so the ledger service must treat repeated notifications of the same
//! preimage as idempotent.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("ledger service request timed out")]
    Timeout,

    #[error("ledger service unreachable: {0}")]
    Transport(String),

    #[error("invalid invoice count {0:?}")]
    InvalidCount(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LedgerError::Timeout
        } else {
            LedgerError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Number of unused invoices the ledger service still holds.
    async fn invoice_count(&self) -> Result<u64, LedgerError>;
    async fn upload_invoice(&self, bolt11: &str) -> Result<(), LedgerError>;
    /// Reports `preimage` as paid.
    async fn notify_paid(&self, preimage: &str) -> Result<(), LedgerError>;
}

pub mod http;
pub mod mock;

pub use http::{BasicAuth, HttpLedgerClient};

//! Lightning node collaborators: invoice creation and the feed of settled
//! invoices.

use async_trait::async_trait;
use ln_bridge_core::{InvoiceDraft, PaymentEvent};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("cannot reach node rpc: {0}")]
    Connect(String),

    #[error("node rpc call timed out")]
    Timeout,

    #[error("node rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected node response: {0}")]
    Protocol(String),

    /// No invoice was paid within the wait window.
    #[error("no payment within the wait window")]
    WaitTimedOut,
}

/// Identity of the node, as reported by `getinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub blockheight: u64,
}

#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Creates an invoice on the node and returns its BOLT11 encoding.
    async fn create_invoice(&self, draft: &InvoiceDraft) -> Result<String, NodeError>;

    async fn get_info(&self) -> Result<NodeInfo, NodeError>;
}

/// At-least-once source of settled invoices, resumable by pay index.
#[async_trait]
pub trait PaymentEventSource: Send + Sync {
    /// Waits for the first payment whose pay index is greater than `after`.
    /// Returns [`NodeError::WaitTimedOut`] when nothing arrives in time;
    /// callers simply ask again.
    async fn next_payment(&self, after: u64) -> Result<PaymentEvent, NodeError>;
}

#[cfg(unix)]
pub mod cln;
pub mod mock;

#[cfg(unix)]
pub use cln::ClnRpcClient;

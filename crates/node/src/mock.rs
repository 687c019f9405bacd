use super::{NodeError, NodeInfo, NodeRpc, PaymentEventSource};
use async_trait::async_trait;
use ln_bridge_core::{InvoiceDraft, PaymentEvent};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Node that mints fake BOLT11 strings and remembers every draft.
#[derive(Default)]
pub struct MockNode {
    drafts: Mutex<Vec<InvoiceDraft>>,
    fail_at: Mutex<Option<usize>>,
}

impl MockNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the invoice creation with zero based index `n` fail.
    pub fn fail_at(&self, n: usize) {
        *self.fail_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(n);
    }

    pub fn drafts(&self) -> Vec<InvoiceDraft> {
        self.drafts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn create_invoice(&self, draft: &InvoiceDraft) -> Result<String, NodeError> {
        let mut drafts = self.drafts.lock().unwrap_or_else(|e| e.into_inner());
        let mut fail_at = self.fail_at.lock().unwrap_or_else(|e| e.into_inner());
        if *fail_at == Some(drafts.len()) {
            *fail_at = None;
            return Err(NodeError::Connect("mock node offline".to_string()));
        }
        drafts.push(draft.clone());
        Ok(format!("lnbcmock{}", draft.label))
    }

    async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        Ok(NodeInfo {
            id: "02mock".to_string(),
            alias: Some("mock".to_string()),
            blockheight: 800_000,
        })
    }
}

/// Payment feed driven by the test through a channel. Events at or below
/// the requested pay index are skipped, like a real resumed feed.
pub struct ScriptedFeed {
    rx: AsyncMutex<mpsc::UnboundedReceiver<PaymentEvent>>,
}

impl ScriptedFeed {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<PaymentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                rx: AsyncMutex::new(rx),
            }),
            tx,
        )
    }
}

#[async_trait]
impl PaymentEventSource for ScriptedFeed {
    async fn next_payment(&self, after: u64) -> Result<PaymentEvent, NodeError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Some(event) if event.pay_index > after => return Ok(event),
                Some(_) => continue,
                None => return Err(NodeError::Connect("feed closed".to_string())),
            }
        }
    }
}

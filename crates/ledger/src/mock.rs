use super::{LedgerClient, LedgerError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// In-memory ledger service. Notifications answer with scripted status codes
/// (200 once the script runs out) and every call is recorded.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    count: u64,
    notify_script: VecDeque<u16>,
    fail_upload_at: Option<usize>,
    uploads: Vec<String>,
    notifications: Vec<String>,
    count_calls: usize,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_count(count: u64) -> Arc<Self> {
        let mock = Self::default();
        mock.lock().count = count;
        Arc::new(mock)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_count(&self, count: u64) {
        self.lock().count = count;
    }

    /// Status codes returned by the next notifications, in order.
    pub fn script_notify(&self, statuses: impl IntoIterator<Item = u16>) {
        self.lock().notify_script.extend(statuses);
    }

    /// Makes the upload with zero based index `n` fail with a 503.
    pub fn fail_upload_at(&self, n: usize) {
        self.lock().fail_upload_at = Some(n);
    }

    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.lock().notifications.clone()
    }

    pub fn count_calls(&self) -> usize {
        self.lock().count_calls
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn invoice_count(&self) -> Result<u64, LedgerError> {
        let mut state = self.lock();
        state.count_calls += 1;
        Ok(state.count)
    }

    async fn upload_invoice(&self, bolt11: &str) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.fail_upload_at == Some(state.uploads.len()) {
            state.fail_upload_at = None;
            return Err(LedgerError::Status {
                status: 503,
                body: "mock upload failure".to_string(),
            });
        }
        state.uploads.push(bolt11.to_string());
        state.count += 1;
        Ok(())
    }

    async fn notify_paid(&self, preimage: &str) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.notifications.push(preimage.to_string());
        let status = state.notify_script.pop_front().unwrap_or(200);
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(LedgerError::Status {
                status,
                body: "mock".to_string(),
            })
        }
    }
}

//! Keeps the ledger service's stock of unused invoices at a target level.
//!
//! A run reads the remote count once and then creates and uploads invoices
//! one at a time. It does not re-read the count while uploading, so only one
//! replenisher may be active per ledger account; a second one would
//! over-provision.

use ledger::{LedgerClient, LedgerError};
use ln_bridge_core::{ExpiryUnit, InvoiceDraft};
use node_rpc::{NodeError, NodeRpc};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReplenishConfig {
    /// Standing count of unused invoices to keep on the ledger service.
    pub target: u64,
    pub amount_sat: u64,
    pub description: String,
    /// Expiry is drawn uniformly from `expiry_min..=expiry_max` so a batch
    /// does not expire all at once.
    pub expiry_min: u64,
    pub expiry_max: u64,
    pub expiry_unit: ExpiryUnit,
    pub interval: Duration,
    /// Failed runs in a row before failures are logged as errors.
    pub escalate_after: u32,
    pub request_timeout: Duration,
}

impl Default for ReplenishConfig {
    fn default() -> Self {
        Self {
            target: 60,
            amount_sat: 20,
            description: "pay2.email".to_string(),
            expiry_min: 7,
            expiry_max: 28,
            expiry_unit: ExpiryUnit::Days,
            interval: Duration::from_secs(10 * 60),
            escalate_after: 3,
            request_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplenishOutcome {
    /// Remote stock was already at or above target.
    Satisfied { count: u64 },
    Replenished { count_before: u64, uploaded: u64 },
}

#[derive(Debug, Error)]
pub enum ReplenishError {
    #[error("reading invoice count failed: {0}")]
    Count(#[source] LedgerError),

    #[error("creating invoice #{index} failed after {uploaded} uploads: {source}")]
    Generate {
        index: u64,
        uploaded: u64,
        #[source]
        source: NodeError,
    },

    #[error("uploading invoice #{index} failed after {uploaded} uploads: {source}")]
    Upload {
        index: u64,
        uploaded: u64,
        #[source]
        source: LedgerError,
    },
}

pub struct Replenisher {
    ledger: Arc<dyn LedgerClient + 'static>,
    node: Arc<dyn NodeRpc + 'static>,
    config: ReplenishConfig,
    consecutive_failures: AtomicU32,
    trigger: Notify,
}

impl Replenisher {
    pub fn new(
        ledger: Arc<dyn LedgerClient + 'static>,
        node: Arc<dyn NodeRpc + 'static>,
        config: ReplenishConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            node,
            config,
            consecutive_failures: AtomicU32::new(0),
            trigger: Notify::new(),
        })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Requests a run outside the regular schedule.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// A fresh draft: new UUID label, expiry drawn from the configured range.
    pub fn draft<R: Rng + ?Sized>(&self, rng: &mut R) -> InvoiceDraft {
        let lo = self.config.expiry_min.min(self.config.expiry_max);
        let hi = self.config.expiry_min.max(self.config.expiry_max);
        InvoiceDraft {
            amount_sat: self.config.amount_sat,
            label: uuid::Uuid::new_v4().to_string(),
            description: self.config.description.clone(),
            expiry: rng.gen_range(lo..=hi),
            expiry_unit: self.config.expiry_unit,
        }
    }

    pub async fn check_and_replenish(&self) -> Result<ReplenishOutcome, ReplenishError> {
        let count = bounded(self.config.request_timeout, self.ledger.invoice_count())
            .await
            .unwrap_or(Err(LedgerError::Timeout))
            .map_err(ReplenishError::Count)?;

        let target = self.config.target;
        if count >= target {
            debug!(count, stock_target = target, "Invoice stock at target, nothing to do");
            return Ok(ReplenishOutcome::Satisfied { count });
        }

        info!(count, stock_target = target, "Invoice stock below target, replenishing");
        let mut uploaded = 0;
        for index in count..target {
            let draft = self.draft(&mut rand::thread_rng());

            let bolt11 = bounded(self.config.request_timeout, self.node.create_invoice(&draft))
                .await
                .unwrap_or(Err(NodeError::Timeout))
                .map_err(|source| ReplenishError::Generate {
                    index,
                    uploaded,
                    source,
                })?;

            bounded(self.config.request_timeout, self.ledger.upload_invoice(&bolt11))
                .await
                .unwrap_or(Err(LedgerError::Timeout))
                .map_err(|source| ReplenishError::Upload {
                    index,
                    uploaded,
                    source,
                })?;

            uploaded += 1;
            debug!(
                label = %draft.label,
                expiry_secs = draft.expiry_seconds(),
                stock = index + 1,
                "Invoice uploaded"
            );
        }

        info!(uploaded, stock_target = target, "Invoice stock replenished");
        Ok(ReplenishOutcome::Replenished {
            count_before: count,
            uploaded,
        })
    }

    /// One scheduled run with failure accounting. Returns true on success.
    pub async fn run_once(&self) -> bool {
        match self.check_and_replenish().await {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.escalate_after {
                    error!(failures, error = %e, "Invoice replenishment keeps failing");
                } else {
                    warn!(failures, error = %e, "Invoice replenishment failed, will retry next run");
                }
                false
            }
        }
    }

    /// Runs immediately, then every `interval` and whenever triggered, until
    /// shutdown. A run in progress is allowed to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            stock_target = self.config.target,
            interval = ?self.config.interval,
            "Replenisher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            self.run_once().await;
        }
        info!("Replenisher stopped");
    }
}

async fn bounded<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(timeout, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::mock::MockLedger;
    use node_rpc::mock::MockNode;
    use std::collections::HashSet;

    fn replenisher(ledger: Arc<MockLedger>, node: Arc<MockNode>) -> Arc<Replenisher> {
        Replenisher::new(ledger, node, ReplenishConfig::default())
    }

    #[tokio::test]
    async fn tops_up_from_55_to_60() {
        let ledger = MockLedger::with_count(55);
        let node = MockNode::new();
        let r = replenisher(ledger.clone(), node.clone());

        let outcome = r.check_and_replenish().await.unwrap();
        assert_eq!(
            outcome,
            ReplenishOutcome::Replenished {
                count_before: 55,
                uploaded: 5
            }
        );

        let drafts = node.drafts();
        assert_eq!(drafts.len(), 5);
        assert_eq!(ledger.uploads().len(), 5);

        let labels: HashSet<_> = drafts.iter().map(|d| d.label.clone()).collect();
        assert_eq!(labels.len(), 5);
        for draft in &drafts {
            assert_eq!(draft.amount_sat, 20);
            assert_eq!(draft.expiry_unit, ExpiryUnit::Days);
            assert!((7..=28).contains(&draft.expiry));
        }
        let expected: Vec<_> = drafts.iter().map(|d| format!("lnbcmock{}", d.label)).collect();
        assert_eq!(ledger.uploads(), expected);
    }

    #[tokio::test]
    async fn stock_at_or_above_target_is_left_alone() {
        for count in [60, 75] {
            let ledger = MockLedger::with_count(count);
            let node = MockNode::new();
            let r = replenisher(ledger.clone(), node.clone());

            assert_eq!(
                r.check_and_replenish().await.unwrap(),
                ReplenishOutcome::Satisfied { count }
            );
            assert!(node.drafts().is_empty());
            assert!(ledger.uploads().is_empty());
        }
    }

    #[tokio::test]
    async fn node_failure_aborts_the_run() {
        let ledger = MockLedger::with_count(55);
        let node = MockNode::new();
        node.fail_at(2);
        let r = replenisher(ledger.clone(), node.clone());

        let err = r.check_and_replenish().await.unwrap_err();
        assert!(matches!(
            err,
            ReplenishError::Generate {
                index: 57,
                uploaded: 2,
                ..
            }
        ));
        assert_eq!(ledger.uploads().len(), 2);

        // Next run picks up from the new remote count.
        let outcome = r.check_and_replenish().await.unwrap();
        assert_eq!(
            outcome,
            ReplenishOutcome::Replenished {
                count_before: 57,
                uploaded: 3
            }
        );
        assert_eq!(ledger.uploads().len(), 5);
    }

    #[tokio::test]
    async fn upload_failure_aborts_the_run() {
        let ledger = MockLedger::with_count(58);
        ledger.fail_upload_at(1);
        let node = MockNode::new();
        let r = replenisher(ledger.clone(), node.clone());

        let err = r.check_and_replenish().await.unwrap_err();
        assert!(matches!(
            err,
            ReplenishError::Upload {
                index: 59,
                uploaded: 1,
                ..
            }
        ));
        assert_eq!(node.drafts().len(), 2);
        assert_eq!(ledger.uploads().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_counted_until_a_run_succeeds() {
        let ledger = MockLedger::with_count(59);
        let node = MockNode::new();
        let r = replenisher(ledger.clone(), node.clone());

        node.fail_at(0);
        assert!(!r.run_once().await);
        assert_eq!(r.consecutive_failures(), 1);

        assert!(r.run_once().await);
        assert_eq!(r.consecutive_failures(), 0);
    }

    #[test]
    fn drafts_get_unique_labels_and_bounded_expiry() {
        let config = ReplenishConfig {
            expiry_min: 3600,
            expiry_max: 7200,
            expiry_unit: ExpiryUnit::Seconds,
            ..ReplenishConfig::default()
        };
        let r = Replenisher::new(MockLedger::new(), MockNode::new(), config);
        let mut rng = rand::thread_rng();

        let drafts: Vec<_> = (0..100).map(|_| r.draft(&mut rng)).collect();
        let labels: HashSet<_> = drafts.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels.len(), 100);
        assert!(drafts.iter().all(|d| (3600..=7200).contains(&d.expiry)));
    }

    #[tokio::test]
    async fn trigger_runs_between_scheduled_ticks() {
        let ledger = MockLedger::with_count(58);
        let node = MockNode::new();
        let config = ReplenishConfig {
            interval: Duration::from_secs(3600),
            ..ReplenishConfig::default()
        };
        let r = Replenisher::new(ledger.clone(), node.clone(), config);
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&r).run(shutdown));

        wait_for(|| ledger.uploads().len() == 2).await;

        ledger.set_count(59);
        r.trigger();
        wait_for(|| ledger.uploads().len() == 3).await;

        stop.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(ledger.count_calls(), 2);
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }
}

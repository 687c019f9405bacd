//! Turns node payment events into durable notification jobs and drives each
//! job to a successful POST against the ledger service.
//!
//! Delivery is at-least-once. A notification that reached the ledger service
//! but whose response was lost, or whose job was InFlight during a crash, is
//! sent again. The ledger service is expected to treat a repeated preimage
//! for an already paid invoice as a no-op.

use chrono::{DateTime, Utc};
use ledger::{LedgerClient, LedgerError};
use ln_bridge_core::parsing::{normalize_preimage, PreimageError};
use ln_bridge_core::PaymentEvent;
use node_rpc::{NodeError, PaymentEventSource};
use queue::{Enqueued, FailureOutcome, JobQueue, JobRecord, QueueError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Delivery workers sharing the queue.
    pub workers: usize,
    /// Longest a worker sleeps before looking for due jobs again.
    pub poll_interval: Duration,
    /// Upper bound on a single notification POST.
    pub request_timeout: Duration,
    /// Pause before retrying after a feed or storage error.
    pub error_backoff: Duration,
    /// Delivered jobs older than this are pruned.
    pub retention: Duration,
    pub prune_interval: Duration,
    /// Feed position used when no cursor has been persisted yet.
    pub initial_pay_index: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(20),
            error_backoff: Duration::from_secs(5),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            prune_interval: Duration::from_secs(60 * 60),
            initial_pay_index: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("payment {label} carries an invalid preimage: {source}")]
    InvalidPreimage {
        label: String,
        #[source]
        source: PreimageError,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub retrying: usize,
    pub abandoned: usize,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.retrying + self.abandoned
    }
}

pub struct PaymentNotifier {
    queue: Arc<JobQueue>,
    ledger: Arc<dyn LedgerClient + 'static>,
    config: NotifierConfig,
    wake: Notify,
}

impl PaymentNotifier {
    pub fn new(
        queue: Arc<JobQueue>,
        ledger: Arc<dyn LedgerClient + 'static>,
        config: NotifierConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            ledger,
            config,
            wake: Notify::new(),
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Persists a notification job for `event` and advances the feed cursor.
    /// Redelivered events resolve to the job already stored.
    pub async fn ingest(&self, event: &PaymentEvent) -> Result<Enqueued, IngestError> {
        let preimage = match normalize_preimage(&event.preimage) {
            Ok(preimage) => preimage,
            Err(source) => {
                // Nothing can make this event deliverable; move the feed past it.
                self.queue.set_event_cursor(event.pay_index).await?;
                return Err(IngestError::InvalidPreimage {
                    label: event.label.clone(),
                    source,
                });
            }
        };
        let event = PaymentEvent {
            preimage,
            ..event.clone()
        };

        let enqueued = self.queue.enqueue(&event, Utc::now()).await?;
        self.queue.set_event_cursor(event.pay_index).await?;

        if enqueued.created {
            info!(
                job_id = %enqueued.job_id,
                label = %event.label,
                amount_msat = event.amount_msat,
                pay_index = event.pay_index,
                "Payment received, notification queued"
            );
            self.wake.notify_one();
        }
        Ok(enqueued)
    }

    /// Delivers every job due at `now`, one after another, until none is left.
    /// Each outcome is recorded at the time its attempt finished, so retry
    /// delays count from the failure, not from the start of the pass.
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> Result<DeliveryReport, QueueError> {
        let mut report = DeliveryReport::default();
        while let Some(job) = self.queue.next_due(now).await? {
            match self.deliver(&job, now).await? {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Retrying => report.retrying += 1,
                Delivery::Abandoned => report.abandoned += 1,
            }
        }
        Ok(report)
    }

    async fn deliver(&self, job: &JobRecord, now: DateTime<Utc>) -> Result<Delivery, QueueError> {
        let attempt = job.attempts + 1;
        let sent = tokio::time::timeout(
            self.config.request_timeout,
            self.ledger.notify_paid(&job.preimage),
        )
        .await
        .unwrap_or(Err(LedgerError::Timeout));
        let finished = now.max(Utc::now());

        match sent {
            Ok(()) => {
                self.queue.mark_delivered(&job.job_id, finished).await?;
                info!(job_id = %job.job_id, label = %job.label, attempt, "Payment notification delivered");
                Ok(Delivery::Delivered)
            }
            Err(err) => {
                let reason = err.to_string();
                match self.queue.mark_failed(&job.job_id, &reason, finished).await? {
                    FailureOutcome::Retrying {
                        attempts,
                        next_attempt_at,
                    } => {
                        warn!(
                            job_id = %job.job_id,
                            label = %job.label,
                            attempts,
                            next_attempt_at = %next_attempt_at,
                            error = %reason,
                            "Payment notification failed, retry scheduled"
                        );
                        Ok(Delivery::Retrying)
                    }
                    FailureOutcome::Abandoned { attempts } => {
                        error!(
                            job_id = %job.job_id,
                            label = %job.label,
                            preimage = %job.preimage,
                            attempts,
                            error = %reason,
                            "Payment notification abandoned, ledger service never confirmed this payment"
                        );
                        Ok(Delivery::Abandoned)
                    }
                }
            }
        }
    }

    /// Spawns the listener, the delivery workers and the pruner. All of them
    /// stop once `shutdown` flips to true.
    pub fn spawn(
        self: &Arc<Self>,
        source: Arc<dyn PaymentEventSource + 'static>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            Arc::clone(self).run_listener(source, shutdown.clone()),
        ));
        for worker in 0..self.config.workers.max(1) {
            handles.push(tokio::spawn(
                Arc::clone(self).run_delivery(worker, shutdown.clone()),
            ));
        }
        handles.push(tokio::spawn(Arc::clone(self).run_pruner(shutdown)));
        handles
    }

    pub async fn run_listener(
        self: Arc<Self>,
        source: Arc<dyn PaymentEventSource + 'static>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut cursor = match self.queue.event_cursor() {
            Ok(Some(cursor)) => cursor,
            Ok(None) => self.config.initial_pay_index,
            Err(e) => {
                error!(error = %e, "Cannot read payment feed cursor, listener not started");
                return;
            }
        };
        info!(cursor, "Payment listener started");

        while !*shutdown.borrow() {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = source.next_payment(cursor) => next,
            };

            match next {
                Ok(event) => {
                    if !self.ingest_until_stored(&event, &mut shutdown).await {
                        break;
                    }
                    cursor = cursor.max(event.pay_index);
                }
                Err(NodeError::WaitTimedOut) => continue,
                Err(e) => {
                    warn!(error = %e, "Payment feed unavailable");
                    if !pause(self.config.error_backoff, &mut shutdown).await {
                        break;
                    }
                }
            }
        }
        info!("Payment listener stopped");
    }

    /// Keeps retrying a storage failure rather than moving past the event.
    /// Returns false when shutdown interrupted the retries.
    async fn ingest_until_stored(
        &self,
        event: &PaymentEvent,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            match self.ingest(event).await {
                Ok(_) => return true,
                Err(IngestError::InvalidPreimage { label, source }) => {
                    error!(
                        label = %label,
                        pay_index = event.pay_index,
                        error = %source,
                        "Payment event rejected, cannot be notified"
                    );
                    return true;
                }
                Err(IngestError::Queue(e)) => {
                    error!(
                        label = %event.label,
                        pay_index = event.pay_index,
                        error = %e,
                        "Failed to persist payment notification, retrying"
                    );
                    if !pause(self.config.error_backoff, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    pub async fn run_delivery(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Delivery worker started");
        while !*shutdown.borrow() {
            match self.deliver_due(Utc::now()).await {
                Ok(report) if report.attempted() > 0 => {
                    debug!(worker, ?report, "Delivery pass finished");
                }
                Ok(_) => {}
                Err(e) => error!(worker, error = %e, "Delivery pass failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.wake.notified() => {}
                _ = sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker, "Delivery worker stopped");
    }

    pub async fn run_pruner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        while pause(self.config.prune_interval, &mut shutdown).await {
            match self.queue.prune_delivered(Utc::now() - retention).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Pruned delivered notification jobs"),
                Err(e) => warn!(error = %e, "Pruning delivered jobs failed"),
            }
        }
    }
}

enum Delivery {
    Delivered,
    Retrying,
    Abandoned,
}

/// Sleeps for `duration`. Returns false if shutdown was requested first.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = sleep(duration) => true,
    }
}

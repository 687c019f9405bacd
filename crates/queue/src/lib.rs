//! Durable notification jobs backed by sled.
//!
//! Layout:
//! - `jobs`: job id -> JSON [`JobRecord`]
//! - `schedule`: big-endian `next_attempt_at` millis ++ job id -> empty.
//!   Holds exactly one entry per Pending job, ordered by due time.
//! - `meta`: payment feed cursor.
//!
//! Every state change touching more than one key runs in a single sled
//! transaction and is flushed before the call returns.

mod audit;
pub mod backoff;

pub use audit::{AuditEvent, AuditLog};
pub use backoff::RetryPolicy;

use chrono::{DateTime, Utc};
use ln_bridge_core::parsing::dedupe_key;
use ln_bridge_core::{JobState, PaymentEvent};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;
use thiserror::Error;

const CURSOR_KEY: &[u8] = b"event_cursor";

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("corrupt job record: {0}")]
    Codec(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {job_id} is {state}, cannot {action}")]
    InvalidTransition {
        job_id: String,
        state: JobState,
        action: &'static str,
    },
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Codec(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub label: String,
    pub preimage: String,
    pub amount_msat: u64,
    pub state: JobState,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub job_id: String,
    /// False when a job for the same invoice already existed.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Abandoned {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub delivered: usize,
    pub abandoned: usize,
}

#[derive(Debug)]
enum TxAbort {
    NotFound,
    InvalidTransition(JobState),
    Codec(String),
}

enum Claim {
    Claimed(JobRecord),
    /// Another worker removed the schedule entry first.
    Lost,
    /// Schedule entry without a matching Pending job.
    Stale,
}

pub struct JobQueue {
    db: Db,
    jobs: Tree,
    schedule: Tree,
    meta: Tree,
    policy: RetryPolicy,
    audit: AuditLog,
}

impl JobQueue {
    /// Opens (or creates) the queue at `path` and returns every job left
    /// InFlight by an unclean shutdown to Pending.
    pub async fn open(path: impl AsRef<Path>, policy: RetryPolicy, audit: AuditLog) -> Result<Self> {
        let db = sled::open(path)?;
        let queue = Self {
            jobs: db.open_tree("jobs")?,
            schedule: db.open_tree("schedule")?,
            meta: db.open_tree("meta")?,
            db,
            policy,
            audit,
        };

        let recovered = queue.recover_in_flight(Utc::now()).await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered in-flight jobs from previous run");
        }
        Ok(queue)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Creates a Pending job for `event`, due at `now`, unless a job for the
    /// same invoice label already exists, in which case that job's id is
    /// returned untouched.
    pub async fn enqueue(&self, event: &PaymentEvent, now: DateTime<Utc>) -> Result<Enqueued> {
        let job_id = dedupe_key(&event.label);
        let rec = JobRecord {
            job_id: job_id.clone(),
            label: event.label.clone(),
            preimage: event.preimage.clone(),
            amount_msat: event.amount_msat,
            state: JobState::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let bytes = serde_json::to_vec(&rec)?;

        let created = (&self.jobs, &self.schedule)
            .transaction(|(jobs, schedule)| -> ConflictableTransactionResult<bool, TxAbort> {
                if jobs.get(job_id.as_bytes())?.is_some() {
                    return Ok(false);
                }
                jobs.insert(job_id.as_bytes(), bytes.clone())?;
                schedule.insert(schedule_key(now, &job_id), Vec::<u8>::new())?;
                Ok(true)
            })
            .map_err(|e| tx_error(e, &job_id, "enqueue"))?;

        if created {
            self.flush().await?;
            self.audit.record(
                &AuditEvent::new("job_enqueued", &job_id, JobState::Pending).with_label(&event.label),
            );
        } else {
            tracing::debug!(job_id = %job_id, label = %event.label, "Duplicate payment event absorbed");
        }

        Ok(Enqueued { job_id, created })
    }

    /// Claims the earliest Pending job due at or before `now` and marks it
    /// InFlight. Concurrent callers never receive the same job.
    pub async fn next_due(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let upper = due_bound(now);
        loop {
            let Some(entry) = self.schedule.range(..upper.clone()).next() else {
                return Ok(None);
            };
            let (key, _) = entry?;
            let job_id = job_id_from_key(&key)?;

            let claim = (&self.jobs, &self.schedule)
                .transaction(|(jobs, schedule)| -> ConflictableTransactionResult<Claim, TxAbort> {
                    if schedule.remove(key.clone())?.is_none() {
                        return Ok(Claim::Lost);
                    }
                    let Some(raw) = jobs.get(job_id.as_bytes())? else {
                        return Ok(Claim::Stale);
                    };
                    let mut rec = decode(&raw)?;
                    if rec.state != JobState::Pending {
                        return Ok(Claim::Stale);
                    }
                    rec.state = JobState::InFlight;
                    rec.updated_at = now;
                    jobs.insert(job_id.as_bytes(), encode(&rec)?)?;
                    Ok(Claim::Claimed(rec))
                })
                .map_err(|e| tx_error(e, &job_id, "dispatch"))?;

            match claim {
                Claim::Claimed(rec) => {
                    self.flush().await?;
                    self.audit.record(
                        &AuditEvent::new("job_dispatched", &rec.job_id, rec.state)
                            .with_attempts(rec.attempts),
                    );
                    return Ok(Some(rec));
                }
                Claim::Lost => continue,
                Claim::Stale => {
                    self.flush().await?;
                    tracing::warn!(job_id = %job_id, "Dropped stale schedule entry");
                }
            }
        }
    }

    pub async fn mark_delivered(&self, job_id: &str, now: DateTime<Utc>) -> Result<JobRecord> {
        let rec = self.transition(job_id, "mark delivered", JobState::InFlight, |rec| {
            rec.attempts += 1;
            rec.state = JobState::Delivered;
            rec.last_error = None;
            rec.updated_at = now;
        })?;
        self.flush().await?;
        self.audit.record(
            &AuditEvent::new("job_delivered", job_id, rec.state).with_attempts(rec.attempts),
        );
        Ok(rec)
    }

    /// Records a failed attempt. The job goes back to Pending after a backoff
    /// delay, or to Abandoned once the retry policy is exhausted.
    pub async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let policy = &self.policy;
        let rec = self.transition(job_id, "mark failed", JobState::InFlight, |rec| {
            rec.attempts += 1;
            rec.last_error = Some(error.to_string());
            rec.updated_at = now;
            if policy.exhausted(rec.attempts) {
                rec.state = JobState::Abandoned;
            } else {
                let delay = policy.delay(rec.attempts, &mut rand::thread_rng());
                rec.state = JobState::Pending;
                rec.next_attempt_at = now + to_chrono(delay);
            }
        })?;
        self.flush().await?;

        let outcome = if rec.state == JobState::Abandoned {
            self.audit.record(
                &AuditEvent::new("job_abandoned", job_id, rec.state)
                    .with_attempts(rec.attempts)
                    .with_error(error),
            );
            FailureOutcome::Abandoned {
                attempts: rec.attempts,
            }
        } else {
            self.audit.record(
                &AuditEvent::new("job_retry_scheduled", job_id, rec.state)
                    .with_attempts(rec.attempts)
                    .with_next_attempt(rec.next_attempt_at)
                    .with_error(error),
            );
            FailureOutcome::Retrying {
                attempts: rec.attempts,
                next_attempt_at: rec.next_attempt_at,
            }
        };
        Ok(outcome)
    }

    /// Returns every InFlight job to Pending, due at `now`. A job found
    /// InFlight was interrupted mid-delivery; retrying it is safe because the
    /// ledger service accepts repeated notifications.
    pub async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut stuck = Vec::new();
        for item in self.jobs.iter() {
            let (_, raw) = item?;
            let rec: JobRecord = serde_json::from_slice(&raw)?;
            if rec.state == JobState::InFlight {
                stuck.push(rec.job_id);
            }
        }

        for job_id in &stuck {
            self.transition(job_id, "recover", JobState::InFlight, |rec| {
                rec.state = JobState::Pending;
                rec.next_attempt_at = now;
                rec.updated_at = now;
            })?;
            self.audit
                .record(&AuditEvent::new("job_recovered", job_id, JobState::Pending));
        }
        if !stuck.is_empty() {
            self.flush().await?;
        }
        Ok(stuck)
    }

    /// Deletes Delivered jobs last touched before `cutoff`.
    pub async fn prune_delivered(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for item in self.jobs.iter() {
            let (key, raw) = item?;
            let rec: JobRecord = serde_json::from_slice(&raw)?;
            if rec.state != JobState::Delivered || rec.updated_at >= cutoff {
                continue;
            }
            if self
                .jobs
                .compare_and_swap(&key, Some(&raw), None::<Vec<u8>>)?
                .is_ok()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            self.flush().await?;
        }
        Ok(removed)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        match self.jobs.get(job_id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Result<Vec<JobRecord>> {
        let mut out = Vec::new();
        for item in self.jobs.iter() {
            let (_k, v) = item?;
            let rec: JobRecord = serde_json::from_slice(&v)?;
            out.push(rec);
        }
        out.sort_by_key(|r| r.created_at);
        out.reverse();
        Ok(out)
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for rec in self.list()? {
            match rec.state {
                JobState::Pending => counts.pending += 1,
                JobState::InFlight => counts.in_flight += 1,
                JobState::Delivered => counts.delivered += 1,
                JobState::Abandoned => counts.abandoned += 1,
            }
        }
        Ok(counts)
    }

    /// Highest node pay index whose event has been durably enqueued.
    pub fn event_cursor(&self) -> Result<Option<u64>> {
        Ok(self.meta.get(CURSOR_KEY)?.map(|v| decode_u64(&v)))
    }

    /// Advances the feed cursor. It never moves backwards.
    pub async fn set_event_cursor(&self, pay_index: u64) -> Result<()> {
        self.meta.fetch_and_update(CURSOR_KEY, |old| {
            let current = old.map(decode_u64).unwrap_or(0);
            Some(current.max(pay_index).to_be_bytes().to_vec())
        })?;
        self.flush().await
    }

    fn transition<F>(
        &self,
        job_id: &str,
        action: &'static str,
        from: JobState,
        apply: F,
    ) -> Result<JobRecord>
    where
        F: Fn(&mut JobRecord),
    {
        (&self.jobs, &self.schedule)
            .transaction(|(jobs, schedule)| -> ConflictableTransactionResult<JobRecord, TxAbort> {
                let Some(raw) = jobs.get(job_id.as_bytes())? else {
                    return abort(TxAbort::NotFound);
                };
                let mut rec = decode(&raw)?;
                if rec.state != from {
                    return abort(TxAbort::InvalidTransition(rec.state));
                }
                apply(&mut rec);
                if rec.state == JobState::Pending {
                    schedule.insert(schedule_key(rec.next_attempt_at, &rec.job_id), Vec::<u8>::new())?;
                }
                jobs.insert(job_id.as_bytes(), encode(&rec)?)?;
                Ok(rec)
            })
            .map_err(|e| tx_error(e, job_id, action))
    }
}

fn tx_error(err: TransactionError<TxAbort>, job_id: &str, action: &'static str) -> QueueError {
    match err {
        TransactionError::Storage(e) => QueueError::Storage(e),
        TransactionError::Abort(TxAbort::NotFound) => QueueError::NotFound(job_id.to_string()),
        TransactionError::Abort(TxAbort::InvalidTransition(state)) => QueueError::InvalidTransition {
            job_id: job_id.to_string(),
            state,
            action,
        },
        TransactionError::Abort(TxAbort::Codec(msg)) => QueueError::Codec(msg),
    }
}

fn decode(raw: &[u8]) -> ConflictableTransactionResult<JobRecord, TxAbort> {
    serde_json::from_slice(raw)
        .map_err(|e| ConflictableTransactionError::Abort(TxAbort::Codec(e.to_string())))
}

fn encode(rec: &JobRecord) -> ConflictableTransactionResult<Vec<u8>, TxAbort> {
    serde_json::to_vec(rec)
        .map_err(|e| ConflictableTransactionError::Abort(TxAbort::Codec(e.to_string())))
}

fn millis_key(at: DateTime<Utc>) -> [u8; 8] {
    (at.timestamp_millis().max(0) as u64).to_be_bytes()
}

fn schedule_key(at: DateTime<Utc>, job_id: &str) -> Vec<u8> {
    let mut key = millis_key(at).to_vec();
    key.extend_from_slice(job_id.as_bytes());
    key
}

/// Exclusive upper bound covering every schedule entry due at or before `now`.
fn due_bound(now: DateTime<Utc>) -> Vec<u8> {
    let millis = now.timestamp_millis().max(0) as u64;
    millis.saturating_add(1).to_be_bytes().to_vec()
}

fn job_id_from_key(key: &IVec) -> Result<String> {
    let suffix = key
        .get(8..)
        .ok_or_else(|| QueueError::Codec("schedule key too short".to_string()))?;
    String::from_utf8(suffix.to_vec()).map_err(|e| QueueError::Codec(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> u64 {
    <[u8; 8]>::try_from(bytes)
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

fn to_chrono(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
}

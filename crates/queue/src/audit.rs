use chrono::{DateTime, Utc};
use ln_bridge_core::JobState;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub job_id: String,
    pub state: JobState,
    pub label: Option<String>,
    pub attempts: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, job_id: &str, state: JobState) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            job_id: job_id.to_string(),
            state,
            label: None,
            attempts: None,
            next_attempt_at: None,
            error: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_next_attempt(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Append-only JSON lines record of job transitions.
pub struct AuditLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn disabled() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// Writes `event`. The audit trail is secondary to the queue itself, so a
    /// failed write is logged and otherwise ignored.
    pub fn record(&self, event: &AuditEvent) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = append_line(path, event) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write audit event");
        } else {
            tracing::debug!(event_type = %event.event_type, job_id = %event.job_id, "Audit event written");
        }
    }
}

fn append_line(path: &PathBuf, event: &AuditEvent) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let json = serde_json::to_string(event)?;
    writeln!(file, "{}", json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::to_file(&path);

        log.record(&AuditEvent::new("job_enqueued", "a", JobState::Pending).with_label("inv-1"));
        log.record(
            &AuditEvent::new("job_retry_scheduled", "a", JobState::Pending)
                .with_attempts(1)
                .with_error("500"),
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEvent> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].label.as_deref(), Some("inv-1"));
        assert_eq!(lines[1].attempts, Some(1));
    }
}

//! Append-only JSONL audit trail of call status transitions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use ward_call_types::StatusChange;
use ward_core::current_unix_timestamp_ms;

use crate::CallStatusObserver;

pub const CALL_AUDIT_LOG_FILE: &str = "call-audit.jsonl";
const CALL_AUDIT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct CallAuditRecord<'a> {
    schema_version: u32,
    recorded_unix_ms: u64,
    #[serde(flatten)]
    change: &'a StatusChange,
}

/// Writes one JSON line per status change to `<state_dir>/call-audit.jsonl`.
#[derive(Debug)]
pub struct JsonlAuditObserver {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditObserver {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(CALL_AUDIT_LOG_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, change: &StatusChange) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let record = CallAuditRecord {
            schema_version: CALL_AUDIT_SCHEMA_VERSION,
            recorded_unix_ms: current_unix_timestamp_ms(),
            change,
        };
        let line = serde_json::to_string(&record).context("serialize call audit record")?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("call audit writer lock poisoned"))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CallStatusObserver for JsonlAuditObserver {
    fn observer_name(&self) -> &'static str {
        "jsonl_audit"
    }

    async fn on_status_change(&self, change: &StatusChange) -> Result<()> {
        self.append(change)
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonlAuditObserver, CALL_AUDIT_LOG_FILE};
    use crate::CallStatusObserver;
    use chrono::Utc;
    use serde_json::Value;
    use tempfile::tempdir;
    use ward_call_types::{ResolutionCause, StatusChange};

    fn change(to: &str, cause: ResolutionCause) -> StatusChange {
        StatusChange {
            call_id: "c-1".to_string(),
            from_identifier: "ICU".to_string(),
            to_identifier: to.to_string(),
            status: cause.status(),
            cause,
            organization_scope: Some("org-1".to_string()),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn functional_appends_one_line_per_change() {
        let temp = tempdir().expect("tempdir");
        let state_dir = temp.path().join("state");
        let observer = JsonlAuditObserver::new(&state_dir);

        observer
            .on_status_change(&change("FloorA", ResolutionCause::Accepted))
            .await
            .expect("append accepted");
        observer
            .on_status_change(&change("FloorB", ResolutionCause::ClaimedByOther))
            .await
            .expect("append claimed");

        let raw = std::fs::read_to_string(state_dir.join(CALL_AUDIT_LOG_FILE)).expect("read log");
        let records = raw
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).expect("json line"))
            .collect::<Vec<_>>();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["schema_version"], 1);
        assert_eq!(records[0]["status"], "accepted");
        assert_eq!(records[1]["to_identifier"], "FloorB");
        assert_eq!(records[1]["cause"], "claimed_by_other");
        assert_eq!(records[1]["status"], "cancelled");
    }
}

//! Append-only audit log (`audit.jsonl`): one JSON object per line.

use chrono::{DateTime, Utc};
use playbook_core::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub status: AuditStatus,
    pub actor: String,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &str, status: AuditStatus, actor: &str, data: serde_json::Value) -> Result<()> {
        let entry = AuditEvent {
            ts: Utc::now(),
            event: event.to_string(),
            status,
            actor: actor.to_string(),
            data: match data {
                serde_json::Value::Object(_) => data,
                serde_json::Value::Null => serde_json::json!({}),
                other => serde_json::json!({ "detail": other }),
            },
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Every parseable event in file order. Torn trailing lines are skipped.
    pub fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!("Skipping malformed audit line: {}", e),
            }
        }
        Ok(events)
    }

    pub fn events_named(&self, event: &str) -> Result<Vec<AuditEvent>> {
        Ok(self.read_all()?.into_iter().filter(|e| e.event == event).collect())
    }
}

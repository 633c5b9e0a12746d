//! Append-only JSONL audit trail of the assessment loop.
//!
//! Separate from `tracing`: this is a product artifact written into the active
//! session's `logs/` directory and unaffected by `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::core::types::{
    ApprovalDecision, Elevation, ExecStatus, IterationRecord, Phase, RiskVerdict,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    ObjectiveSet {
        objective: String,
        max_iterations: u32,
        approval_enabled: bool,
    },
    PlannerError {
        attempt: u32,
        kind: String,
        message: String,
    },
    CommandProposed {
        seq: u32,
        command: String,
        rationale: String,
        phase: Option<Phase>,
        elevation: Elevation,
    },
    CommandClassified {
        seq: u32,
        verdict: RiskVerdict,
    },
    ApprovalDecided {
        seq: u32,
        decision: ApprovalDecision,
    },
    CommandExecuted {
        seq: u32,
        status: ExecStatus,
        duration_ms: u64,
        stdout_bytes: usize,
        stderr_bytes: usize,
        output_files: Vec<PathBuf>,
    },
    /// The full record as the planner history holds it, output truncated.
    IterationRecorded {
        record: Box<IterationRecord>,
    },
    LoopFinished {
        state: String,
        iterations: u32,
        detail: Option<String>,
    },
}

#[derive(Serialize)]
struct Line<'a> {
    timestamp: String,
    session: &'a str,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Destination for audit events.
pub trait AuditSink {
    fn append(&self, session_id: &str, event: &AuditEvent) -> Result<()>;
}

/// Writes one JSON object per line, opening the file in append mode per event.
#[derive(Debug, Clone)]
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_at(&self, session_id: &str, event: &AuditEvent, now: DateTime<Utc>) -> Result<()> {
        let line = Line {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            session: session_id,
            event,
        };
        let mut buf = serde_json::to_string(&line).context("serialize audit event")?;
        buf.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create audit dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append audit log {}", self.path.display()))?;
        Ok(())
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, session_id: &str, event: &AuditEvent) -> Result<()> {
        self.append_at(session_id, event, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RiskTier;
    use chrono::TimeZone;

    #[test]
    fn events_append_as_tagged_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = JsonlAuditLog::new(temp.path().join("logs/audit.jsonl"));
        let now = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        log.append_at(
            "s1",
            &AuditEvent::CommandClassified {
                seq: 1,
                verdict: RiskVerdict {
                    tier: RiskTier::Blocked,
                    matched_rules: vec!["fs.recursive_delete_root".to_string()],
                    rationale: "recursive delete".to_string(),
                },
            },
            now,
        )
        .expect("append");
        log.append_at(
            "s1",
            &AuditEvent::LoopFinished {
                state: "completed".to_string(),
                iterations: 1,
                detail: None,
            },
            now,
        )
        .expect("append");

        let contents = fs::read_to_string(log.path()).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "command_classified");
        assert_eq!(lines[0]["timestamp"], "2026-02-03T04:05:06.000Z");
        assert_eq!(lines[0]["session"], "s1");
        assert_eq!(lines[0]["verdict"]["tier"], "blocked");
        assert_eq!(lines[1]["event"], "loop_finished");
    }
}

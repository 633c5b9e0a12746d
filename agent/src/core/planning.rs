//! Planner request/response types and bounded context construction.

use serde::{Deserialize, Serialize};

use crate::core::types::{ApprovalOutcome, Elevation, IterationRecord, Phase};

/// Prefix marking a planner command as a batch of independent commands.
pub const BATCH_PREFIX: &str = "parallel:";
pub const BATCH_SEPARATOR: &str = ";;";

/// Everything the planner sees for one planning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannerRequest {
    pub objective: String,
    /// Most recent records, oldest first, with outputs truncated.
    pub history: Vec<IterationRecord>,
    /// Records dropped from the front of the window.
    pub omitted: usize,
    /// 1-based number of the iteration being planned.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Operator or gate feedback about the previous proposal.
    pub feedback: Option<String>,
    /// Why the previous response could not be parsed (protocol retries only).
    pub protocol_feedback: Option<String>,
}

impl PlannerRequest {
    pub fn build(
        objective: &str,
        records: &[IterationRecord],
        window: &ContextWindow,
        iteration: u32,
        max_iterations: u32,
    ) -> Self {
        let (history, omitted) = window.apply(records);
        Self {
            objective: objective.to_string(),
            history,
            omitted,
            iteration,
            max_iterations,
            feedback: records.last().and_then(feedback_for),
            protocol_feedback: None,
        }
    }
}

/// Bounds on how much history reaches the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    pub max_records: usize,
    pub output_limit_bytes: usize,
}

impl ContextWindow {
    pub fn apply(&self, records: &[IterationRecord]) -> (Vec<IterationRecord>, usize) {
        let start = records.len().saturating_sub(self.max_records);
        let history = records[start..]
            .iter()
            .map(|record| truncate_record(record, self.output_limit_bytes))
            .collect();
        (history, start)
    }
}

/// Copy of `record` with captured stdout and stderr cut to `limit` bytes each.
pub fn truncate_record(record: &IterationRecord, limit: usize) -> IterationRecord {
    let mut record = record.clone();
    if let Some(result) = record.result.as_mut() {
        result.stdout = truncate_text(&result.stdout, limit);
        result.stderr = truncate_text(&result.stderr, limit);
    }
    record
}

/// Keep the head and tail of `text` within roughly `limit` bytes.
pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let head_end = floor_char_boundary(text, limit / 2);
    let tail_start = ceil_char_boundary(text, text.len() - (limit - limit / 2));
    let omitted = tail_start - head_end;
    format!(
        "{}\n[... {omitted} bytes omitted ...]\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Feedback the planner must see about a proposal that did not run.
pub fn feedback_for(record: &IterationRecord) -> Option<String> {
    match record.approval.outcome {
        ApprovalOutcome::AutoBlocked => Some(format!(
            "The command `{}` was blocked by the risk classifier [{}]: {}. Propose a different approach.",
            record.command,
            record.verdict.matched_rules.join(", "),
            record.verdict.rationale
        )),
        ApprovalOutcome::UserRejected => Some(format!(
            "The operator rejected the command `{}`. Propose a different approach.",
            record.command
        )),
        ApprovalOutcome::UserRejectedWithRedirect => record.approval.redirect.clone(),
        ApprovalOutcome::AutoApproved | ApprovalOutcome::UserApproved => None,
    }
}

/// A command the planner wants to run, with its declared intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedCommand {
    pub rationale: String,
    pub command: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub tool_category: Option<String>,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub elevation: Elevation,
}

impl ProposedCommand {
    pub fn new(rationale: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            rationale: rationale.into(),
            command: command.into(),
            phase: None,
            tool_category: None,
            expected_outcome: None,
            elevation: Elevation::None,
        }
    }

    /// Member commands when this is a `parallel:` batch.
    pub fn batch(&self) -> Option<Vec<String>> {
        split_batch(&self.command)
    }
}

/// Typed planner response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerStep {
    Run(ProposedCommand),
    Complete { rationale: String, summary: String },
    CannotProceed { rationale: String },
}

/// Split `parallel: a ;; b` into its members. `None` when not a batch.
pub fn split_batch(command: &str) -> Option<Vec<String>> {
    let trimmed = command.trim_start();
    let prefix = trimmed.get(..BATCH_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BATCH_PREFIX) {
        return None;
    }
    Some(
        trimmed[BATCH_PREFIX.len()..]
            .split(BATCH_SEPARATOR)
            .map(str::trim)
            .filter(|member| !member.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        ApprovalDecision, ExecStatus, ExecutionResult, RiskTier, RiskVerdict,
    };
    use chrono::Utc;

    fn record(seq: u32, approval: ApprovalDecision, stdout: Option<&str>) -> IterationRecord {
        IterationRecord {
            seq,
            rationale: format!("step {seq}"),
            command: format!("echo {seq}"),
            phase: None,
            verdict: RiskVerdict {
                tier: RiskTier::Safe,
                matched_rules: vec!["rule.a".to_string()],
                rationale: "looks fine".to_string(),
            },
            approval,
            result: stdout.map(|out| ExecutionResult {
                command: format!("echo {seq}"),
                status: ExecStatus::Exited { code: 0 },
                stdout: out.to_string(),
                stderr: String::new(),
                stdout_truncated: 0,
                stderr_truncated: 0,
                duration_ms: 1,
                output_files: Vec::new(),
            }),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn window_keeps_most_recent_records_and_counts_omitted() {
        let records: Vec<_> = (1..=5)
            .map(|seq| record(seq, ApprovalDecision::auto_approved(), Some("ok")))
            .collect();
        let window = ContextWindow {
            max_records: 2,
            output_limit_bytes: 100,
        };
        let (history, omitted) = window.apply(&records);
        assert_eq!(omitted, 3);
        assert_eq!(
            history.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[test]
    fn window_truncates_long_output() {
        let long = "x".repeat(1000);
        let records = vec![record(1, ApprovalDecision::auto_approved(), Some(&long))];
        let window = ContextWindow {
            max_records: 8,
            output_limit_bytes: 100,
        };
        let (history, _) = window.apply(&records);
        let stdout = &history[0].result.as_ref().expect("result").stdout;
        assert!(stdout.len() < 200);
        assert!(stdout.contains("900 bytes omitted"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(100);
        let out = truncate_text(&text, 11);
        assert!(out.contains("bytes omitted"));
        assert_eq!(truncate_text("short", 10), "short");
    }

    #[test]
    fn feedback_reflects_last_decision() {
        let blocked = record(1, ApprovalDecision::auto_blocked(), None);
        let feedback = feedback_for(&blocked).expect("feedback");
        assert!(feedback.contains("rule.a"));
        assert!(feedback.contains("looks fine"));

        let redirected = record(2, ApprovalDecision::redirected("scan port 80 only"), None);
        assert_eq!(
            feedback_for(&redirected).as_deref(),
            Some("scan port 80 only")
        );

        let ran = record(3, ApprovalDecision::user_approved(), Some("ok"));
        assert_eq!(feedback_for(&ran), None);
    }

    #[test]
    fn request_carries_feedback_from_last_record() {
        let records = vec![
            record(1, ApprovalDecision::auto_approved(), Some("ok")),
            record(2, ApprovalDecision::user_rejected(), None),
        ];
        let window = ContextWindow {
            max_records: 8,
            output_limit_bytes: 100,
        };
        let request = PlannerRequest::build("objective", &records, &window, 2, 15);
        assert_eq!(request.history.len(), 2);
        assert!(
            request
                .feedback
                .as_deref()
                .is_some_and(|f| f.contains("rejected"))
        );
    }

    #[test]
    fn batch_prefix_splits_members() {
        assert_eq!(
            split_batch("Parallel: nmap -sV 127.0.0.1 ;; whatweb http://localhost ;; "),
            Some(vec![
                "nmap -sV 127.0.0.1".to_string(),
                "whatweb http://localhost".to_string()
            ])
        );
        assert_eq!(split_batch("nmap 127.0.0.1"), None);
        assert_eq!(split_batch("par"), None);
    }
}

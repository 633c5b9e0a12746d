//! Shared deterministic types for the assessment loop.
//!
//! These records flow between the classifier, the approval gate, the execution
//! engine and the orchestrator. They are serialized into the audit log and the
//! planner context, so field names are part of the on-disk contract.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Risk classification level assigned to a candidate command.
///
/// Ordered from least to most severe so the classifier can escalate with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Safe,
    Caution,
    Dangerous,
    Blocked,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Safe => "safe",
            RiskTier::Caution => "caution",
            RiskTier::Dangerous => "dangerous",
            RiskTier::Blocked => "blocked",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output for a single command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub tier: RiskTier,
    /// Identifiers of the rules that matched, in evaluation order.
    pub matched_rules: Vec<String>,
    pub rationale: String,
}

impl RiskVerdict {
    pub fn is_blocked(&self) -> bool {
        self.tier == RiskTier::Blocked
    }
}

/// How a candidate command was (or was not) cleared for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    AutoApproved,
    UserApproved,
    UserRejected,
    UserRejectedWithRedirect,
    AutoBlocked,
}

impl ApprovalOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalOutcome::AutoApproved => "auto-approved",
            ApprovalOutcome::UserApproved => "user-approved",
            ApprovalOutcome::UserRejected => "user-rejected",
            ApprovalOutcome::UserRejectedWithRedirect => "user-rejected-with-redirect",
            ApprovalOutcome::AutoBlocked => "auto-blocked",
        }
    }
}

impl fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub outcome: ApprovalOutcome,
    /// Operator guidance forwarded verbatim to the planner on rejection.
    pub redirect: Option<String>,
}

impl ApprovalDecision {
    pub fn auto_approved() -> Self {
        Self::plain(ApprovalOutcome::AutoApproved)
    }

    pub fn user_approved() -> Self {
        Self::plain(ApprovalOutcome::UserApproved)
    }

    pub fn user_rejected() -> Self {
        Self::plain(ApprovalOutcome::UserRejected)
    }

    pub fn auto_blocked() -> Self {
        Self::plain(ApprovalOutcome::AutoBlocked)
    }

    pub fn redirected(message: impl Into<String>) -> Self {
        Self {
            outcome: ApprovalOutcome::UserRejectedWithRedirect,
            redirect: Some(message.into()),
        }
    }

    fn plain(outcome: ApprovalOutcome) -> Self {
        Self {
            outcome,
            redirect: None,
        }
    }

    pub fn permits_execution(&self) -> bool {
        matches!(
            self.outcome,
            ApprovalOutcome::AutoApproved | ApprovalOutcome::UserApproved
        )
    }
}

/// Privilege mode for a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    #[default]
    None,
    Sudo,
}

/// Terminal status of an executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecStatus {
    Exited { code: i32 },
    TimedOut,
    Killed { signal: Option<i32> },
    ElevationFailed { reason: String },
    SpawnFailed { reason: String },
}

impl ExecStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, ExecStatus::Exited { code: 0 })
    }

    pub fn describe(&self) -> String {
        match self {
            ExecStatus::Exited { code } => format!("exit code {code}"),
            ExecStatus::TimedOut => "timed out".to_string(),
            ExecStatus::Killed { signal: Some(sig) } => format!("killed by signal {sig}"),
            ExecStatus::Killed { signal: None } => "killed".to_string(),
            ExecStatus::ElevationFailed { reason } => format!("elevation failed: {reason}"),
            ExecStatus::SpawnFailed { reason } => format!("failed to start: {reason}"),
        }
    }
}

/// Captured outcome of one executed command. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command: String,
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped from stdout beyond the capture limit.
    #[serde(default)]
    pub stdout_truncated: usize,
    #[serde(default)]
    pub stderr_truncated: usize,
    pub duration_ms: u64,
    /// Files under the session's results directory attributed to this command.
    #[serde(default)]
    pub output_files: Vec<PathBuf>,
}

/// Assessment phase reported by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Recon,
    Scanning,
    VulnAssessment,
    Exploitation,
    PostExploitation,
    Reporting,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Recon,
        Phase::Scanning,
        Phase::VulnAssessment,
        Phase::Exploitation,
        Phase::PostExploitation,
        Phase::Reporting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Recon => "recon",
            Phase::Scanning => "scanning",
            Phase::VulnAssessment => "vuln_assessment",
            Phase::Exploitation => "exploitation",
            Phase::PostExploitation => "post_exploitation",
            Phase::Reporting => "reporting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the audit trail.
///
/// Records with a non-executing approval carry no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub seq: u32,
    pub rationale: String,
    pub command: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    pub verdict: RiskVerdict,
    pub approval: ApprovalDecision,
    pub result: Option<ExecutionResult>,
    pub timestamp: DateTime<Utc>,
}

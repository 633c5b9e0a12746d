//! Scripted collaborators for driving the loop in tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::gate::HumanResponse;
use crate::core::planning::{PlannerRequest, PlannerStep, ProposedCommand};
use crate::core::types::{ExecStatus, ExecutionResult, RiskVerdict};
use crate::errors::AgentError;
use crate::io::approval::ApprovalPrompt;
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::engine::{CommandRunner, ExecRequest};
use crate::io::planner::{Planner, parse_response};
use crate::io::session::{Session, SessionManager};

/// Planner that replays a fixed script and records every request it sees.
///
/// An exhausted script answers with a transport error.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    replies: Mutex<VecDeque<Result<PlannerStep, AgentError>>>,
    requests: Mutex<Vec<PlannerRequest>>,
}

impl ScriptedPlanner {
    pub fn new(replies: Vec<Result<PlannerStep, AgentError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script raw planner output; each entry goes through the response parser.
    pub fn from_raw(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|raw| parse_response(raw)).collect())
    }

    pub fn requests(&self) -> Vec<PlannerRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Planner for ScriptedPlanner {
    fn request_next_step(&self, request: &PlannerRequest) -> Result<PlannerStep, AgentError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or_else(|| Err(AgentError::PlannerTransport("script exhausted".to_string())))
    }
}

/// Convenience constructor for a scripted `command` step.
pub fn run_step(rationale: &str, command: &str) -> Result<PlannerStep, AgentError> {
    Ok(PlannerStep::Run(ProposedCommand::new(rationale, command)))
}

pub fn complete_step(summary: &str) -> Result<PlannerStep, AgentError> {
    Ok(PlannerStep::Complete {
        rationale: "objective met".to_string(),
        summary: summary.to_string(),
    })
}

/// Operator prompt replaying fixed answers; quits when the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<HumanResponse>,
    pub asked: Vec<(String, RiskVerdict)>,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<HumanResponse>) -> Self {
        Self {
            answers: answers.into(),
            asked: Vec::new(),
        }
    }
}

impl ApprovalPrompt for ScriptedPrompt {
    fn ask(&mut self, proposed: &ProposedCommand, verdict: &RiskVerdict) -> Result<HumanResponse> {
        self.asked.push((proposed.command.clone(), verdict.clone()));
        Ok(self.answers.pop_front().unwrap_or(HumanResponse::Quit))
    }
}

/// Canned outcome for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedExec {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptedExec {
    pub fn ok(stdout: &str) -> Self {
        Self {
            status: ExecStatus::Exited { code: 0 },
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn status(status: ExecStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Command runner returning canned results keyed by command string.
///
/// Unknown commands exit 0 with empty output. Stdout is written to the
/// request's output file the way the shell runner streams it.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    outcomes: BTreeMap<String, ScriptedExec>,
    requests: Mutex<Vec<ExecRequest>>,
}

impl ScriptedRunner {
    pub fn new(outcomes: Vec<(&str, ScriptedExec)>) -> Self {
        Self {
            outcomes: outcomes
                .into_iter()
                .map(|(command, exec)| (command.to_string(), exec))
                .collect(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let exec = self
            .outcomes
            .get(&request.command)
            .cloned()
            .unwrap_or_else(|| ScriptedExec::ok(""));
        fs::write(&request.output_path, &exec.stdout)
            .with_context(|| format!("write {}", request.output_path.display()))?;
        Ok(ExecutionResult {
            command: request.command.clone(),
            status: exec.status,
            stdout: exec.stdout,
            stderr: exec.stderr,
            stdout_truncated: 0,
            stderr_truncated: 0,
            duration_ms: 1,
            output_files: Vec::new(),
        })
    }
}

/// Audit sink keeping events in memory.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<(String, AuditEvent)>>,
}

impl MemoryAudit {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(_, event)| event.clone()).collect())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAudit {
    fn append(&self, session_id: &str, event: &AuditEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push((session_id.to_string(), event.clone()));
        }
        Ok(())
    }
}

/// Temporary workspace with an opened session manager.
pub struct TestWorkspace {
    dir: TempDir,
    manager: SessionManager,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp workspace")?;
        let manager = SessionManager::open(dir.path())?;
        Ok(Self { dir, manager })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn start(&self, name: Option<&str>) -> Result<Session> {
        self.manager.start_session(name)
    }

    /// Write `contents` to `relative` under the workspace root.
    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }
}

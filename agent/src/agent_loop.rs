//! The assessment loop: plan, classify, gate, execute, reflect.
//!
//! One record is in flight at a time. Recoverable failures (blocked or
//! rejected proposals, non-zero exits, timeouts, elevation failures) are folded
//! into the history the planner sees next; only planner exhaustion, operator
//! quit and session I/O failures end the run early.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{RuleTable, classify, classify_batch};
use crate::core::gate::{GateResult, decide};
use crate::core::planning::{
    ContextWindow, PlannerRequest, PlannerStep, ProposedCommand, truncate_record,
};
use crate::core::types::{
    ApprovalDecision, Elevation, ExecutionResult, IterationRecord, RiskVerdict,
};
use crate::errors::AgentError;
use crate::io::approval::ApprovalPrompt;
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::config::AgentConfig;
use crate::io::engine::{CommandRunner, ExecutionEngine, fold_batch};
use crate::io::lock::LockGuard;
use crate::io::planner::Planner;
use crate::io::session::{Session, SessionManager};

/// Loop knobs, usually derived from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub approval_enabled: bool,
    pub max_iterations: u32,
    pub max_consecutive_rejections: u32,
    pub command_timeout: Duration,
    pub max_parallel: usize,
    pub window: ContextWindow,
    pub protocol_retries: u32,
    pub transport_retries: u32,
    pub backoff: Duration,
}

impl LoopConfig {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            approval_enabled: cfg.approval_enabled,
            max_iterations: cfg.max_iterations,
            max_consecutive_rejections: cfg.max_consecutive_rejections,
            command_timeout: cfg.command_timeout(),
            max_parallel: cfg.max_parallel,
            window: cfg.context_window(),
            protocol_retries: cfg.planner.protocol_retries,
            transport_retries: cfg.planner.transport_retries,
            backoff: Duration::from_millis(cfg.planner.backoff_ms),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// Position of the loop's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Planning,
    AwaitingApproval,
    Executing,
    Reflecting,
    Completed,
    Exhausted,
    UserQuit,
    PlannerUnavailable,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Planning => "planning",
            LoopState::AwaitingApproval => "awaiting_approval",
            LoopState::Executing => "executing",
            LoopState::Reflecting => "reflecting",
            LoopState::Completed => "completed",
            LoopState::Exhausted => "exhausted",
            LoopState::UserQuit => "user_quit",
            LoopState::PlannerUnavailable => "planner_unavailable",
        }
    }
}

/// Why the loop ran out of road without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExhaustReason {
    IterationLimit,
    ConsecutiveRejections(u32),
    /// The planner answered `cannot_proceed`.
    PlannerGaveUp(String),
}

/// Reason why `run_objective` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Completed { summary: String },
    Exhausted { reason: ExhaustReason },
    UserQuit,
    PlannerUnavailable { error: AgentError },
}

impl LoopStop {
    pub fn state(&self) -> LoopState {
        match self {
            LoopStop::Completed { .. } => LoopState::Completed,
            LoopStop::Exhausted { .. } => LoopState::Exhausted,
            LoopStop::UserQuit => LoopState::UserQuit,
            LoopStop::PlannerUnavailable { .. } => LoopState::PlannerUnavailable,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            LoopStop::Completed { summary } => Some(summary.clone()),
            LoopStop::Exhausted { reason } => Some(match reason {
                ExhaustReason::IterationLimit => "iteration limit reached".to_string(),
                ExhaustReason::ConsecutiveRejections(n) => {
                    format!("{n} consecutive proposals were blocked or rejected")
                }
                ExhaustReason::PlannerGaveUp(rationale) => {
                    format!("planner cannot proceed: {rationale}")
                }
            }),
            LoopStop::UserQuit => None,
            LoopStop::PlannerUnavailable { error } => Some(error.to_string()),
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub session_id: String,
    /// Executed iterations.
    pub iterations: u32,
    pub records: Vec<IterationRecord>,
    pub stop: LoopStop,
}

/// Progress notifications for the caller (the CLI prints these).
#[derive(Debug, Clone, Copy)]
pub enum LoopEvent<'a> {
    State(LoopState),
    PlannerRetry { attempt: u32, error: &'a AgentError },
    Classified {
        command: &'a str,
        verdict: &'a RiskVerdict,
        elevation: Elevation,
    },
    Recorded(&'a IterationRecord),
}

/// Collaborators the loop drives.
pub struct Orchestrator<'a, P, R, A, S>
where
    P: Planner,
    R: CommandRunner,
    A: ApprovalPrompt,
    S: AuditSink,
{
    pub manager: &'a SessionManager,
    pub planner: &'a P,
    pub engine: &'a ExecutionEngine<R>,
    pub prompt: &'a mut A,
    pub audit: &'a S,
    pub rules: &'a RuleTable,
    pub config: &'a LoopConfig,
}

impl<P, R, A, S> Orchestrator<'_, P, R, A, S>
where
    P: Planner,
    R: CommandRunner,
    A: ApprovalPrompt,
    S: AuditSink,
{
    /// Drive `objective` to a terminal state inside `session`.
    #[instrument(skip_all, fields(session = %session.id(), max_iterations = self.config.max_iterations))]
    pub fn run_objective<F: FnMut(LoopEvent<'_>)>(
        &mut self,
        session: &mut Session,
        objective: &str,
        mut on_event: F,
    ) -> Result<LoopOutcome> {
        let session_id = session.id().to_string();
        session.metadata.objective = Some(objective.trim().to_string());
        session.metadata.touch(Utc::now());
        self.manager
            .save_metadata(session)
            .context("record objective in session metadata")?;
        self.audit.append(
            &session_id,
            &AuditEvent::ObjectiveSet {
                objective: objective.trim().to_string(),
                max_iterations: self.config.max_iterations,
                approval_enabled: self.config.approval_enabled,
            },
        )?;

        let mut records: Vec<IterationRecord> = Vec::new();
        let mut executed = 0u32;
        let mut rejected_in_a_row = 0u32;

        let stop = loop {
            on_event(LoopEvent::State(LoopState::Planning));
            let request = PlannerRequest::build(
                objective,
                &records,
                &self.config.window,
                executed + 1,
                self.config.max_iterations,
            );
            let proposed = match self.plan(&session_id, request, &mut on_event)? {
                Ok(PlannerStep::Run(proposed)) => proposed,
                Ok(PlannerStep::Complete { summary, .. }) => break LoopStop::Completed { summary },
                Ok(PlannerStep::CannotProceed { rationale }) => {
                    break LoopStop::Exhausted {
                        reason: ExhaustReason::PlannerGaveUp(rationale),
                    };
                }
                Err(error) => break LoopStop::PlannerUnavailable { error },
            };
            let seq = records.len() as u32 + 1;
            self.audit.append(
                &session_id,
                &AuditEvent::CommandProposed {
                    seq,
                    command: proposed.command.clone(),
                    rationale: proposed.rationale.clone(),
                    phase: proposed.phase,
                    elevation: proposed.elevation,
                },
            )?;

            on_event(LoopEvent::State(LoopState::AwaitingApproval));
            let batch = proposed.batch();
            let verdict = match &batch {
                Some(members) => classify_batch(members.as_slice(), self.rules),
                None => classify(&proposed.command, self.rules),
            };
            on_event(LoopEvent::Classified {
                command: &proposed.command,
                verdict: &verdict,
                elevation: proposed.elevation,
            });
            self.audit.append(
                &session_id,
                &AuditEvent::CommandClassified {
                    seq,
                    verdict: verdict.clone(),
                },
            )?;
            let Some(decision) = self.approve(&proposed, &verdict)? else {
                break LoopStop::UserQuit;
            };
            self.audit.append(
                &session_id,
                &AuditEvent::ApprovalDecided {
                    seq,
                    decision: decision.clone(),
                },
            )?;

            if !decision.permits_execution() {
                if verdict.is_blocked() {
                    let err = AgentError::CommandBlocked(verdict.rationale.clone());
                    warn!(%err, rules = ?verdict.matched_rules, "proposal blocked");
                } else {
                    info!(outcome = %decision.outcome, "proposal rejected by operator");
                }
                let record = new_record(seq, &proposed, verdict, decision, None);
                self.record_iteration(&session_id, &record)?;
                on_event(LoopEvent::Recorded(&record));
                records.push(record);
                session.metadata.touch(Utc::now());
                self.manager
                    .save_metadata(session)
                    .context("save session metadata")?;
                rejected_in_a_row += 1;
                if rejected_in_a_row >= self.config.max_consecutive_rejections {
                    break LoopStop::Exhausted {
                        reason: ExhaustReason::ConsecutiveRejections(rejected_in_a_row),
                    };
                }
                continue;
            }
            rejected_in_a_row = 0;

            on_event(LoopEvent::State(LoopState::Executing));
            let result = {
                let _lock = LockGuard::acquire(
                    &session.iteration_lock_path(),
                    &[session.session_lock_path()],
                )?;
                self.execute(session, &proposed, batch.as_deref())
            };
            if let Some(err) = AgentError::from_status(&result.status, self.config.command_timeout)
            {
                warn!(%err, "command did not succeed");
            }
            self.audit.append(
                &session_id,
                &AuditEvent::CommandExecuted {
                    seq,
                    status: result.status.clone(),
                    duration_ms: result.duration_ms,
                    stdout_bytes: result.stdout.len(),
                    stderr_bytes: result.stderr.len(),
                    output_files: result.output_files.clone(),
                },
            )?;

            on_event(LoopEvent::State(LoopState::Reflecting));
            session.metadata.record_execution(
                &proposed.command,
                proposed.phase,
                result.status.succeeded(),
                Utc::now(),
            );
            self.manager
                .save_metadata(session)
                .context("save session metadata")?;
            let record = new_record(seq, &proposed, verdict, decision, Some(result));
            self.record_iteration(&session_id, &record)?;
            on_event(LoopEvent::Recorded(&record));
            records.push(record);
            executed += 1;
            if executed >= self.config.max_iterations {
                break LoopStop::Exhausted {
                    reason: ExhaustReason::IterationLimit,
                };
            }
        };

        if let LoopStop::Completed { summary } = &stop {
            session.metadata.final_summary = Some(summary.clone());
        }
        session.metadata.touch(Utc::now());
        self.manager
            .save_metadata(session)
            .context("save final session metadata")?;
        self.audit.append(
            &session_id,
            &AuditEvent::LoopFinished {
                state: stop.state().as_str().to_string(),
                iterations: executed,
                detail: stop.detail(),
            },
        )?;
        on_event(LoopEvent::State(stop.state()));
        info!(state = stop.state().as_str(), iterations = executed, "loop finished");

        Ok(LoopOutcome {
            session_id,
            iterations: executed,
            records,
            stop,
        })
    }

    /// Ask the planner for a step, retrying protocol failures with feedback
    /// and transport failures with exponential backoff.
    ///
    /// The outer `Result` carries audit I/O failures; the inner one the
    /// planner error that exhausted its retries.
    fn plan<F: FnMut(LoopEvent<'_>)>(
        &self,
        session_id: &str,
        mut request: PlannerRequest,
        on_event: &mut F,
    ) -> Result<Result<PlannerStep, AgentError>> {
        let mut protocol_failures = 0u32;
        let mut transport_failures = 0u32;
        let mut delay = self.config.backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match self.planner.request_next_step(&request) {
                Ok(step) => return Ok(Ok(step)),
                Err(error) => error,
            };
            let kind = match &error {
                AgentError::PlannerProtocol(_) => "protocol",
                _ => "transport",
            };
            warn!(attempt, kind, err = %error, "planner request failed");
            self.audit.append(
                session_id,
                &AuditEvent::PlannerError {
                    attempt,
                    kind: kind.to_string(),
                    message: error.to_string(),
                },
            )?;
            match &error {
                AgentError::PlannerProtocol(reason) => {
                    protocol_failures += 1;
                    if protocol_failures > self.config.protocol_retries {
                        return Ok(Err(error));
                    }
                    request.protocol_feedback = Some(reason.clone());
                }
                _ => {
                    transport_failures += 1;
                    if transport_failures > self.config.transport_retries {
                        return Ok(Err(error));
                    }
                    debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
            }
            on_event(LoopEvent::PlannerRetry {
                attempt,
                error: &error,
            });
        }
    }

    /// `None` means the operator quit.
    fn approve(
        &mut self,
        proposed: &ProposedCommand,
        verdict: &RiskVerdict,
    ) -> Result<Option<ApprovalDecision>> {
        let mut answer = None;
        loop {
            match decide(verdict, self.config.approval_enabled, answer.as_ref()) {
                GateResult::Decided(decision) => return Ok(Some(decision)),
                GateResult::Quit => return Ok(None),
                GateResult::AskHuman if answer.is_none() => {
                    answer = Some(
                        self.prompt
                            .ask(proposed, verdict)
                            .context("ask operator for approval")?,
                    );
                }
                GateResult::AskHuman => return Ok(Some(ApprovalDecision::user_rejected())),
            }
        }
    }

    fn record_iteration(&self, session_id: &str, record: &IterationRecord) -> Result<()> {
        let record = truncate_record(record, self.config.window.output_limit_bytes);
        self.audit.append(
            session_id,
            &AuditEvent::IterationRecorded {
                record: Box::new(record),
            },
        )
    }

    fn execute(
        &self,
        session: &Session,
        proposed: &ProposedCommand,
        batch: Option<&[String]>,
    ) -> ExecutionResult {
        match batch {
            Some(members) => {
                let results = self.engine.execute_parallel(
                    session,
                    members,
                    self.config.command_timeout,
                    self.config.max_parallel,
                );
                fold_batch(&proposed.command, members, &results)
            }
            None => self.engine.execute(
                session,
                &proposed.command,
                self.config.command_timeout,
                proposed.elevation,
            ),
        }
    }
}

fn new_record(
    seq: u32,
    proposed: &ProposedCommand,
    verdict: RiskVerdict,
    approval: ApprovalDecision,
    result: Option<ExecutionResult>,
) -> IterationRecord {
    IterationRecord {
        seq,
        rationale: proposed.rationale.clone(),
        command: proposed.command.clone(),
        phase: proposed.phase,
        verdict,
        approval,
        result,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::HumanResponse;
    use crate::core::types::{ApprovalOutcome, ExecStatus, RiskTier};
    use crate::io::audit::JsonlAuditLog;
    use crate::io::session::{AUDIT_FILE, LOGS_DIR};
    use std::fs;
    use crate::test_support::{
        MemoryAudit, ScriptedExec, ScriptedPlanner, ScriptedPrompt, ScriptedRunner, TestWorkspace,
        complete_step, run_step,
    };

    fn quiet_config() -> LoopConfig {
        LoopConfig {
            approval_enabled: false,
            backoff: Duration::ZERO,
            ..LoopConfig::default()
        }
    }

    struct Harness {
        workspace: TestWorkspace,
        rules: RuleTable,
        audit: MemoryAudit,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                workspace: TestWorkspace::new().expect("workspace"),
                rules: RuleTable::builtin().expect("rules"),
                audit: MemoryAudit::default(),
            }
        }

        fn run(
            &self,
            planner: &ScriptedPlanner,
            runner: ScriptedRunner,
            prompt: &mut ScriptedPrompt,
            config: &LoopConfig,
        ) -> (LoopOutcome, Session) {
            self.run_observed(planner, runner, prompt, config, |_| {})
        }

        fn run_observed<F: FnMut(LoopEvent<'_>)>(
            &self,
            planner: &ScriptedPlanner,
            runner: ScriptedRunner,
            prompt: &mut ScriptedPrompt,
            config: &LoopConfig,
            on_event: F,
        ) -> (LoopOutcome, Session) {
            let mut session = self.workspace.start(Some("test")).expect("session");
            let engine = ExecutionEngine::new(runner);
            let mut orchestrator = Orchestrator {
                manager: self.workspace.manager(),
                planner,
                engine: &engine,
                prompt,
                audit: &self.audit,
                rules: &self.rules,
                config,
            };
            let outcome = orchestrator
                .run_objective(&mut session, "scan 127.0.0.1 for open ports", on_event)
                .expect("run");
            (outcome, session)
        }
    }

    #[test]
    fn executed_result_reaches_next_planning_context() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![
            run_step("find open ports", "nmap -p 1-1000 127.0.0.1"),
            complete_step("22/tcp is open"),
        ]);
        let runner = ScriptedRunner::new(vec![(
            "nmap -p 1-1000 127.0.0.1",
            ScriptedExec::ok("22/tcp open ssh\n80/tcp open http\n"),
        )]);
        let (outcome, session) = harness.run(
            &planner,
            runner,
            &mut ScriptedPrompt::default(),
            &quiet_config(),
        );

        assert_eq!(
            outcome.stop,
            LoopStop::Completed {
                summary: "22/tcp is open".to_string()
            }
        );
        assert_eq!(outcome.iterations, 1);
        let record = &outcome.records[0];
        assert_eq!(record.verdict.tier, RiskTier::Safe);
        assert_eq!(record.approval.outcome, ApprovalOutcome::AutoApproved);

        let requests = planner.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].iteration, 2);
        let seen = requests[1].history[0].result.as_ref().expect("result");
        assert_eq!(seen.stdout, "22/tcp open ssh\n80/tcp open http\n");

        let saved = harness
            .workspace
            .manager()
            .active_session()
            .expect("load")
            .expect("active");
        assert_eq!(saved.metadata.tool_usage.get("nmap"), Some(&1));
        assert_eq!(saved.metadata.final_summary.as_deref(), Some("22/tcp is open"));
        assert_eq!(saved.metadata, session.metadata);
    }

    #[test]
    fn blocked_command_is_recorded_without_result_and_fed_back() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![
            run_step("clean up", "rm -rf /"),
            complete_step("stopped"),
        ]);
        let runner = ScriptedRunner::default();
        let (outcome, _) = harness.run(
            &planner,
            runner,
            &mut ScriptedPrompt::default(),
            &quiet_config(),
        );

        assert_eq!(outcome.iterations, 0);
        let record = &outcome.records[0];
        assert_eq!(record.verdict.tier, RiskTier::Blocked);
        assert_eq!(record.approval.outcome, ApprovalOutcome::AutoBlocked);
        assert!(record.result.is_none());

        let feedback = planner.requests()[1].feedback.clone().expect("feedback");
        assert!(feedback.contains("fs.recursive_delete_root"));
        assert!(
            !harness
                .audit
                .events()
                .iter()
                .any(|e| matches!(e, AuditEvent::CommandExecuted { .. }))
        );
    }

    #[test]
    fn dangerous_command_asks_even_with_approval_disabled() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![run_step("escalate", "sudo id")]);
        let mut prompt = ScriptedPrompt::new(vec![HumanResponse::Quit]);
        let (outcome, _) = harness.run(
            &planner,
            ScriptedRunner::default(),
            &mut prompt,
            &quiet_config(),
        );
        assert_eq!(outcome.stop, LoopStop::UserQuit);
        assert_eq!(prompt.asked.len(), 1);
        assert_eq!(prompt.asked[0].1.tier, RiskTier::Dangerous);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn redirect_message_is_forwarded_verbatim() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![
            run_step("scan", "nmap -sU 127.0.0.1"),
            complete_step("done"),
        ]);
        let mut prompt = ScriptedPrompt::new(vec![HumanResponse::RejectWithMessage(
            "  only scan TCP ports  ".to_string(),
        )]);
        let config = LoopConfig {
            approval_enabled: true,
            ..quiet_config()
        };
        let (outcome, _) = harness.run(&planner, ScriptedRunner::default(), &mut prompt, &config);
        assert_eq!(
            outcome.records[0].approval.outcome,
            ApprovalOutcome::UserRejectedWithRedirect
        );
        assert_eq!(
            planner.requests()[1].feedback.as_deref(),
            Some("only scan TCP ports")
        );
    }

    #[test]
    fn failures_are_folded_into_context_not_fatal() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![
            run_step("slow scan", "nmap -p- 127.0.0.1"),
            run_step("quick scan", "nmap -F 127.0.0.1"),
            complete_step("done"),
        ]);
        let runner = ScriptedRunner::new(vec![
            ("nmap -p- 127.0.0.1", ScriptedExec::status(ExecStatus::TimedOut)),
            ("nmap -F 127.0.0.1", ScriptedExec::status(ExecStatus::Exited { code: 1 })),
        ]);
        let (outcome, _) = harness.run(
            &planner,
            runner,
            &mut ScriptedPrompt::default(),
            &quiet_config(),
        );
        assert!(matches!(outcome.stop, LoopStop::Completed { .. }));
        assert_eq!(outcome.iterations, 2);
        let last_request = planner.requests().pop().expect("request");
        assert_eq!(
            last_request.history[0].result.as_ref().map(|r| &r.status),
            Some(&ExecStatus::TimedOut)
        );
    }

    #[test]
    fn stops_at_iteration_limit() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![
            run_step("a", "whoami"),
            run_step("b", "id"),
            run_step("c", "uname -a"),
        ]);
        let config = LoopConfig {
            max_iterations: 2,
            ..quiet_config()
        };
        let (outcome, session) = harness.run(
            &planner,
            ScriptedRunner::default(),
            &mut ScriptedPrompt::default(),
            &config,
        );
        assert_eq!(
            outcome.stop,
            LoopStop::Exhausted {
                reason: ExhaustReason::IterationLimit
            }
        );
        assert_eq!(outcome.iterations, 2);
        assert_eq!(session.metadata.commands_executed, 2);
        assert_eq!(planner.requests().len(), 2);
    }

    #[test]
    fn repeated_blocks_exhaust_the_loop() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(
            (0..3).map(|_| run_step("wipe", "mkfs.ext4 /dev/sda1")).collect(),
        );
        let config = LoopConfig {
            max_consecutive_rejections: 3,
            ..quiet_config()
        };
        let (outcome, _) = harness.run(
            &planner,
            ScriptedRunner::default(),
            &mut ScriptedPrompt::default(),
            &config,
        );
        assert_eq!(
            outcome.stop,
            LoopStop::Exhausted {
                reason: ExhaustReason::ConsecutiveRejections(3)
            }
        );
        assert_eq!(outcome.records.len(), 3);
    }

    #[test]
    fn protocol_errors_retry_with_feedback_then_give_up() {
        let harness = Harness::new();
        let bad = || Err(AgentError::PlannerProtocol("missing field `action`".to_string()));
        let planner = ScriptedPlanner::new(vec![bad(), bad(), bad()]);
        let (outcome, _) = harness.run(
            &planner,
            ScriptedRunner::default(),
            &mut ScriptedPrompt::default(),
            &quiet_config(),
        );
        assert!(matches!(
            outcome.stop,
            LoopStop::PlannerUnavailable {
                error: AgentError::PlannerProtocol(_)
            }
        ));
        let requests = planner.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].protocol_feedback, None);
        assert_eq!(
            requests[1].protocol_feedback.as_deref(),
            Some("missing field `action`")
        );
    }

    #[test]
    fn transport_errors_are_retried() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![
            Err(AgentError::PlannerTransport("connection reset".to_string())),
            complete_step("done"),
        ]);
        let (outcome, _) = harness.run(
            &planner,
            ScriptedRunner::default(),
            &mut ScriptedPrompt::default(),
            &quiet_config(),
        );
        assert!(matches!(outcome.stop, LoopStop::Completed { .. }));
        let errors = harness
            .audit
            .events()
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::PlannerError { .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn parallel_batch_runs_members_and_folds_one_record() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![
            run_step(
                "enumerate",
                "parallel: nmap -sV 127.0.0.1 ;; whatweb http://localhost",
            ),
            complete_step("done"),
        ]);
        let runner = ScriptedRunner::new(vec![
            ("nmap -sV 127.0.0.1", ScriptedExec::ok("22/tcp open ssh")),
            (
                "whatweb http://localhost",
                ScriptedExec::status(ExecStatus::Exited { code: 2 }),
            ),
        ]);
        let (outcome, session) = harness.run(
            &planner,
            runner,
            &mut ScriptedPrompt::default(),
            &quiet_config(),
        );
        let result = outcome.records[0].result.as_ref().expect("result");
        assert_eq!(result.status, ExecStatus::Exited { code: 2 });
        assert!(result.stdout.contains("### nmap -sV 127.0.0.1"));
        assert_eq!(result.output_files.len(), 2);
        assert_eq!(session.metadata.tool_usage.get("whatweb"), Some(&1));
        assert_eq!(session.metadata.tool_usage.get("nmap"), Some(&1));
    }

    #[test]
    fn audit_trail_is_in_loop_order() {
        let harness = Harness::new();
        let planner = ScriptedPlanner::new(vec![run_step("who", "whoami"), complete_step("done")]);
        harness.run(
            &planner,
            ScriptedRunner::default(),
            &mut ScriptedPrompt::default(),
            &quiet_config(),
        );
        let kinds: Vec<&str> = harness
            .audit
            .events()
            .iter()
            .map(|event| match event {
                AuditEvent::ObjectiveSet { .. } => "objective",
                AuditEvent::PlannerError { .. } => "planner_error",
                AuditEvent::CommandProposed { .. } => "proposed",
                AuditEvent::CommandClassified { .. } => "classified",
                AuditEvent::ApprovalDecided { .. } => "decided",
                AuditEvent::CommandExecuted { .. } => "executed",
                AuditEvent::IterationRecorded { .. } => "recorded",
                AuditEvent::LoopFinished { .. } => "finished",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "objective",
                "proposed",
                "classified",
                "decided",
                "executed",
                "recorded",
                "finished"
            ]
        );
    }

    #[test]
    fn classified_event_reports_elevation() {
        let harness = Harness::new();
        let mut elevated = ProposedCommand::new("check uid", "id -u");
        elevated.elevation = Elevation::Sudo;
        let planner = ScriptedPlanner::new(vec![
            run_step("who", "whoami"),
            Ok(PlannerStep::Run(elevated)),
            complete_step("done"),
        ]);
        let mut seen = Vec::new();
        harness.run_observed(
            &planner,
            ScriptedRunner::default(),
            &mut ScriptedPrompt::default(),
            &quiet_config(),
            |event| {
                if let LoopEvent::Classified {
                    command, elevation, ..
                } = event
                {
                    seen.push((command.to_string(), elevation));
                }
            },
        );
        assert_eq!(
            seen,
            vec![
                ("whoami".to_string(), Elevation::None),
                ("id -u".to_string(), Elevation::Sudo),
            ]
        );
    }

    #[test]
    fn iteration_records_are_kept_in_the_archived_audit_log() {
        let workspace = TestWorkspace::new().expect("workspace");
        let rules = RuleTable::builtin().expect("rules");
        let mut session = workspace.start(Some("audit")).expect("session");
        let audit = JsonlAuditLog::new(session.audit_path());
        let planner = ScriptedPlanner::new(vec![
            run_step("find open ports", "nmap -p 1-1000 127.0.0.1"),
            run_step("clean up", "rm -rf /"),
            complete_step("done"),
        ]);
        let stdout = format!("22/tcp open ssh\n{}", "x".repeat(4096));
        let engine = ExecutionEngine::new(ScriptedRunner::new(vec![(
            "nmap -p 1-1000 127.0.0.1",
            ScriptedExec {
                stderr: "warning: slow host".to_string(),
                ..ScriptedExec::ok(&stdout)
            },
        )]));
        let config = LoopConfig {
            window: ContextWindow {
                max_records: 10,
                output_limit_bytes: 256,
            },
            ..quiet_config()
        };
        let mut prompt = ScriptedPrompt::default();
        let mut orchestrator = Orchestrator {
            manager: workspace.manager(),
            planner: &planner,
            engine: &engine,
            prompt: &mut prompt,
            audit: &audit,
            rules: &rules,
            config: &config,
        };
        orchestrator
            .run_objective(&mut session, "scan 127.0.0.1", |_| {})
            .expect("run");

        let archived = workspace
            .manager()
            .archive_current()
            .expect("archive")
            .expect("archived");
        let contents = fs::read_to_string(archived.path.join(LOGS_DIR).join(AUDIT_FILE))
            .expect("read archived audit log");
        let records: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json"))
            .filter(|line| line["event"] == "iteration_recorded")
            .collect();
        assert_eq!(records.len(), 2);

        let executed = &records[0]["record"];
        assert_eq!(executed["seq"], 1);
        assert_eq!(executed["command"], "nmap -p 1-1000 127.0.0.1");
        assert_eq!(executed["rationale"], "find open ports");
        assert_eq!(executed["result"]["stderr"], "warning: slow host");
        let kept = executed["result"]["stdout"].as_str().expect("stdout");
        assert!(kept.starts_with("22/tcp open ssh"));
        assert!(kept.contains("bytes omitted"));
        assert!(kept.len() < stdout.len());

        let blocked = &records[1]["record"];
        assert_eq!(blocked["command"], "rm -rf /");
        assert_eq!(blocked["approval"]["outcome"], "auto_blocked");
        assert!(blocked["result"].is_null());
    }
}

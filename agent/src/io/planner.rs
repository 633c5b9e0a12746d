//! Planner seam: the external reasoning service that proposes commands.
//!
//! The loop depends only on the [`Planner`] trait. [`CommandPlanner`] drives
//! any CLI that reads a prompt on stdin and answers with a JSON object on
//! stdout; tests use scripted planners.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::planning::{PlannerRequest, PlannerStep, ProposedCommand, split_batch};
use crate::core::types::{Elevation, Phase};
use crate::errors::AgentError;
use crate::io::process::{RunOptions, run_command};
use crate::io::prompt::render_planner_prompt;

const RESPONSE_SCHEMA: &str = include_str!("../../schemas/planner_response.schema.json");

/// Abstraction over planning backends.
pub trait Planner {
    /// Ask for the next step. Only [`AgentError::PlannerProtocol`] and
    /// [`AgentError::PlannerTransport`] are expected as errors.
    fn request_next_step(&self, request: &PlannerRequest) -> Result<PlannerStep, AgentError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Command,
    Complete,
    CannotProceed,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    rationale: String,
    action: Action,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    phase: Option<Phase>,
    #[serde(default)]
    tool_category: Option<String>,
    #[serde(default)]
    expected_outcome: Option<String>,
    #[serde(default)]
    elevation: Option<Elevation>,
}

/// Parse a planner reply into a typed step.
///
/// The reply must be one JSON object, optionally wrapped in a single fenced
/// code block, that validates against the embedded response schema.
pub fn parse_response(raw: &str) -> Result<PlannerStep, AgentError> {
    let body = strip_fence(raw)?;
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AgentError::PlannerProtocol(format!("response is not valid JSON: {e}")))?;
    validate_response(&value)?;
    let response: RawResponse = serde_json::from_value(value)
        .map_err(|e| AgentError::PlannerProtocol(format!("unexpected response shape: {e}")))?;

    let rationale = response.rationale.trim().to_string();
    match response.action {
        Action::Command => {
            let command = response
                .command
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .ok_or_else(|| AgentError::PlannerProtocol("command is empty".to_string()))?;
            let elevation = response.elevation.unwrap_or_default();
            if let Some(members) = split_batch(&command) {
                if members.is_empty() {
                    return Err(AgentError::PlannerProtocol(
                        "parallel batch has no commands".to_string(),
                    ));
                }
                if elevation == Elevation::Sudo {
                    return Err(AgentError::PlannerProtocol(
                        "parallel batches cannot request elevation".to_string(),
                    ));
                }
            }
            Ok(PlannerStep::Run(ProposedCommand {
                rationale,
                command,
                phase: response.phase,
                tool_category: non_blank(response.tool_category),
                expected_outcome: non_blank(response.expected_outcome),
                elevation,
            }))
        }
        Action::Complete => Ok(PlannerStep::Complete {
            rationale,
            summary: response.summary.unwrap_or_default().trim().to_string(),
        }),
        Action::CannotProceed => Ok(PlannerStep::CannotProceed { rationale }),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn strip_fence(raw: &str) -> Result<&str, AgentError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AgentError::PlannerProtocol("empty response".to_string()));
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        let (info, body) = rest.split_once('\n').ok_or_else(|| {
            AgentError::PlannerProtocol("unterminated code fence".to_string())
        })?;
        let info = info.trim();
        if !info.is_empty() && !info.eq_ignore_ascii_case("json") {
            return Err(AgentError::PlannerProtocol(format!(
                "unexpected code fence language '{info}'"
            )));
        }
        let body = body.trim_end().strip_suffix("```").ok_or_else(|| {
            AgentError::PlannerProtocol("unterminated code fence".to_string())
        })?;
        return Ok(body.trim());
    }
    if !trimmed.starts_with('{') {
        return Err(AgentError::PlannerProtocol(
            "response must be a single JSON object".to_string(),
        ));
    }
    Ok(trimmed)
}

fn validate_response(instance: &Value) -> Result<(), AgentError> {
    let schema: Value = serde_json::from_str(RESPONSE_SCHEMA)
        .map_err(|e| AgentError::PlannerProtocol(format!("embedded schema is invalid: {e}")))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| AgentError::PlannerProtocol(format!("compile response schema: {e}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(AgentError::PlannerProtocol(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )))
    }
}

/// Planner backed by an external CLI (prompt on stdin, JSON on stdout).
#[derive(Debug, Clone)]
pub struct CommandPlanner {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    kill_grace: Duration,
    scrub_env: Vec<String>,
}

impl CommandPlanner {
    pub fn new(argv: Vec<String>, workdir: PathBuf, timeout: Duration) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("planner command must be a non-empty array"));
        }
        Ok(Self {
            argv,
            workdir,
            timeout,
            output_limit_bytes: 1_000_000,
            kill_grace: Duration::from_secs(2),
            scrub_env: Vec::new(),
        })
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Variables removed from the planner's environment.
    pub fn with_scrubbed_env(mut self, vars: Vec<String>) -> Self {
        self.scrub_env = vars;
        self
    }

    fn invoke(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]).current_dir(&self.workdir);
        for var in &self.scrub_env {
            cmd.env_remove(var);
        }
        let opts = RunOptions {
            stdin: Some(prompt.as_bytes()),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
            stream_path: None,
            kill_grace: self.kill_grace,
        };
        let output = run_command(cmd, &opts)
            .with_context(|| format!("run planner {}", self.argv[0]))?;
        if output.timed_out {
            return Err(anyhow!(
                "planner timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(anyhow!(
                "planner exited with {}: {}",
                output
                    .exit_code()
                    .map_or_else(|| "a signal".to_string(), |code| format!("code {code}")),
                tail.join(" | ")
            ));
        }
        Ok(output.stdout_lossy())
    }
}

impl Planner for CommandPlanner {
    #[instrument(skip_all, fields(iteration = request.iteration, history = request.history.len()))]
    fn request_next_step(&self, request: &PlannerRequest) -> Result<PlannerStep, AgentError> {
        let prompt = render_planner_prompt(request)
            .map_err(|e| AgentError::PlannerTransport(format!("render prompt: {e:#}")))?;
        debug!(prompt_bytes = prompt.len(), "invoking planner");
        let stdout = self.invoke(&prompt).map_err(|e| {
            warn!(err = %format!("{e:#}"), "planner invocation failed");
            AgentError::PlannerTransport(format!("{e:#}"))
        })?;
        let step = parse_response(&stdout)?;
        info!(step = step_kind(&step), "planner responded");
        Ok(step)
    }
}

fn step_kind(step: &PlannerStep) -> &'static str {
    match step {
        PlannerStep::Run(_) => "command",
        PlannerStep::Complete { .. } => "complete",
        PlannerStep::CannotProceed { .. } => "cannot_proceed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planning::ContextWindow;

    #[test]
    fn parses_command_response() {
        let step = parse_response(
            r#"{"rationale":"find ports","action":"command","command":"nmap -p 1-1000 127.0.0.1","phase":"scanning","tool_category":"port_scan"}"#,
        )
        .expect("parse");
        let PlannerStep::Run(proposed) = step else {
            panic!("expected command");
        };
        assert_eq!(proposed.command, "nmap -p 1-1000 127.0.0.1");
        assert_eq!(proposed.phase, Some(Phase::Scanning));
        assert_eq!(proposed.elevation, Elevation::None);
        assert_eq!(proposed.tool_category.as_deref(), Some("port_scan"));
    }

    #[test]
    fn accepts_json_code_fence_and_nulls() {
        let raw = "```json\n{\"rationale\":\"done\",\"action\":\"complete\",\"summary\":\"ssh open\",\"command\":null}\n```\n";
        assert_eq!(
            parse_response(raw).expect("parse"),
            PlannerStep::Complete {
                rationale: "done".to_string(),
                summary: "ssh open".to_string()
            }
        );
    }

    #[test]
    fn rejects_malformed_responses() {
        for raw in [
            "",
            "Sure! Here is the next command: nmap",
            "{not json",
            r#"{"action":"command","command":"ls"}"#,
            r#"{"rationale":"r","action":"command"}"#,
            r#"{"rationale":"r","action":"command","command":"   "}"#,
            r#"{"rationale":"r","action":"complete"}"#,
            r#"{"rationale":"r","action":"explode"}"#,
            r#"{"rationale":"r","action":"command","command":"parallel: ;;"}"#,
            r#"{"rationale":"r","action":"command","command":"parallel: a ;; b","elevation":"sudo"}"#,
            "```python\n{}\n```",
        ] {
            assert!(
                matches!(parse_response(raw), Err(AgentError::PlannerProtocol(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn cannot_proceed_carries_rationale() {
        assert_eq!(
            parse_response(r#"{"rationale":"target unreachable","action":"cannot_proceed"}"#)
                .expect("parse"),
            PlannerStep::CannotProceed {
                rationale: "target unreachable".to_string()
            }
        );
    }

    fn request() -> PlannerRequest {
        let window = ContextWindow {
            max_records: 8,
            output_limit_bytes: 4000,
        };
        PlannerRequest::build("scan 127.0.0.1", &[], &window, 1, 15)
    }

    #[test]
    fn command_planner_reads_prompt_and_parses_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"grep -q "scan 127.0.0.1" && printf '{"rationale":"r","action":"command","command":"whoami"}'"#;
        let planner = CommandPlanner::new(
            vec!["sh".into(), "-c".into(), script.into()],
            temp.path().to_path_buf(),
            Duration::from_secs(10),
        )
        .expect("planner");
        let step = planner.request_next_step(&request()).expect("step");
        assert_eq!(
            step,
            PlannerStep::Run(ProposedCommand::new("r", "whoami"))
        );
    }

    #[test]
    fn command_planner_failures_are_transport_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let failing = CommandPlanner::new(
            vec!["sh".into(), "-c".into(), "echo boom >&2; exit 7".into()],
            temp.path().to_path_buf(),
            Duration::from_secs(10),
        )
        .expect("planner");
        let err = failing.request_next_step(&request()).expect_err("fail");
        assert!(matches!(&err, AgentError::PlannerTransport(msg) if msg.contains("code 7") && msg.contains("boom")));

        let missing = CommandPlanner::new(
            vec!["/nonexistent/planner".into()],
            temp.path().to_path_buf(),
            Duration::from_secs(10),
        )
        .expect("planner");
        assert!(matches!(
            missing.request_next_step(&request()),
            Err(AgentError::PlannerTransport(_))
        ));

        assert!(CommandPlanner::new(Vec::new(), temp.path().to_path_buf(), Duration::from_secs(1)).is_err());
    }
}

//! Template rendering for planner prompts and archive READMEs.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::planning::PlannerRequest;
use crate::core::types::{ExecStatus, IterationRecord};
use crate::io::session::SessionSummary;

const PLANNER_TEMPLATE: &str = include_str!("templates/planner.md");
const ARCHIVE_README_TEMPLATE: &str = include_str!("templates/archive_readme.md");

/// Flattened history step for template rendering.
#[derive(Debug, Clone, Serialize)]
struct HistoryStep {
    seq: u32,
    phase: Option<String>,
    rationale: String,
    command: String,
    tier: String,
    rules: Vec<String>,
    outcome: String,
    redirect: Option<String>,
    status: Option<String>,
    stdout: String,
    stderr: String,
    output_files: Vec<String>,
}

impl HistoryStep {
    fn from_record(record: &IterationRecord) -> Self {
        let result = record.result.as_ref();
        Self {
            seq: record.seq,
            phase: record.phase.map(|phase| phase.to_string()),
            rationale: record.rationale.clone(),
            command: record.command.clone(),
            tier: record.verdict.tier.to_string(),
            rules: record.verdict.matched_rules.clone(),
            outcome: record.approval.outcome.to_string(),
            redirect: record.approval.redirect.clone(),
            status: result.map(|r| describe_status(&r.status, r.stdout_truncated)),
            stdout: result.map(|r| r.stdout.trim_end().to_string()).unwrap_or_default(),
            stderr: result.map(|r| r.stderr.trim_end().to_string()).unwrap_or_default(),
            output_files: result
                .map(|r| {
                    r.output_files
                        .iter()
                        .map(|path| path.display().to_string())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn describe_status(status: &ExecStatus, truncated: usize) -> String {
    if truncated > 0 {
        format!("{} (stdout truncated by {truncated} bytes)", status.describe())
    } else {
        status.describe()
    }
}

/// Template engine wrapper around minijinja.
struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("archive_readme", ARCHIVE_README_TEMPLATE)
            .expect("archive readme template should be valid");
        Self { env }
    }
}

/// Render the prompt sent to a subprocess planner.
pub fn render_planner_prompt(request: &PlannerRequest) -> Result<String> {
    let engine = TemplateEngine::new();
    let history: Vec<HistoryStep> = request.history.iter().map(HistoryStep::from_record).collect();
    let template = engine.env.get_template("planner")?;
    let rendered = template
        .render(context! {
            objective => request.objective.trim(),
            iteration => request.iteration,
            max_iterations => request.max_iterations,
            omitted => request.omitted,
            history => history,
            feedback => request.feedback.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            protocol_feedback => request.protocol_feedback.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })
        .context("render planner prompt")?;
    Ok(rendered)
}

/// Render the README placed at the top of an archived session.
pub fn render_archive_readme(summary: &SessionSummary) -> Result<String> {
    let engine = TemplateEngine::new();
    let template = engine.env.get_template("archive_readme")?;
    let rendered = template
        .render(context! { summary => summary })
        .context("render archive readme")?;
    Ok(rendered)
}

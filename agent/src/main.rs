//! Operator-gated autonomous assessment loop.
//!
//! Every command proposed by the planner is risk-classified and gated before
//! it runs inside the active session's workspace (`results/`, `logs/`,
//! `session_data/`). Finished sessions are archived under `sessions/`.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use autopentest::agent_loop::{LoopConfig, LoopEvent, LoopStop, Orchestrator};
use autopentest::core::classifier::{RuleTable, classify, classify_batch};
use autopentest::core::planning::split_batch;
use autopentest::core::types::Elevation;
use autopentest::errors::AgentError;
use autopentest::exit_codes;
use autopentest::io::approval::{ApprovalPrompt, DenyPrompt, TerminalPrompt};
use autopentest::io::audit::JsonlAuditLog;
use autopentest::io::config::{AgentConfig, config_path, load_config};
use autopentest::io::credentials::EnvCredentialProvider;
use autopentest::io::engine::{ExecutionEngine, ShellRunner};
use autopentest::io::planner::CommandPlanner;
use autopentest::io::session::SessionManager;
use autopentest::logging;

#[derive(Parser)]
#[command(
    name = "autopentest",
    version,
    about = "Operator-gated autonomous assessment loop"
)]
struct Cli {
    /// Workspace root holding `autopentest.toml`, the active session and `sessions/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Archive the active session (if any) and start a fresh one.
    NewSession {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Archive the active session without starting a new one.
    Archive,
    /// List archived sessions, most recent first.
    Sessions,
    /// Archive the active session and copy an archived one back into the workspace.
    Restore {
        /// Archive directory name or session id.
        reference: String,
    },
    /// Delete old archives, always keeping a minimum number.
    Clean {
        #[arg(long)]
        older_than_days: Option<u32>,
        #[arg(long)]
        keep_minimum: Option<usize>,
    },
    /// Run the assessment loop for an objective in a new session.
    Run {
        objective: String,
        #[arg(short, long)]
        name: Option<String>,
        /// Auto-approve safe and caution commands (dangerous ones still ask).
        #[arg(long)]
        no_approval: bool,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Allowed targets (IP, CIDR, hostname, `*.domain`); replaces the rule table's scope.
        #[arg(long = "scope")]
        scope: Vec<String>,
        /// Archive the session once the loop stops.
        #[arg(long)]
        archive: bool,
    },
    /// Print the risk verdict for a command without running it.
    Classify {
        command: String,
        #[arg(long = "scope")]
        scope: Vec<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = match err.downcast_ref::<AgentError>() {
                Some(AgentError::PlannerProtocol(_) | AgentError::PlannerTransport(_)) => {
                    exit_codes::PLANNER_UNAVAILABLE
                }
                _ => exit_codes::INVALID,
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::NewSession { name } => cmd_new_session(root, name.as_deref()),
        Command::Archive => cmd_archive(root),
        Command::Sessions => cmd_sessions(root),
        Command::Restore { reference } => cmd_restore(root, &reference),
        Command::Clean {
            older_than_days,
            keep_minimum,
        } => cmd_clean(root, older_than_days, keep_minimum),
        Command::Run {
            objective,
            name,
            no_approval,
            max_iterations,
            scope,
            archive,
        } => cmd_run(
            root,
            &RunArgs {
                objective,
                name,
                no_approval,
                max_iterations,
                scope,
                archive,
            },
        ),
        Command::Classify { command, scope } => cmd_classify(root, &command, &scope),
    }
}

fn load_agent_config(root: &Path) -> Result<AgentConfig> {
    let mut cfg = load_config(&config_path(root))?;
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    Ok(cfg)
}

fn load_rules(root: &Path, cfg: &AgentConfig, scope: &[String]) -> Result<RuleTable> {
    let path = cfg.rules_path.as_ref().map(|p| root.join(p));
    let mut rules = RuleTable::load(path.as_deref())?;
    if !scope.is_empty() {
        rules.set_scope(scope).context("parse --scope targets")?;
    }
    Ok(rules)
}

fn cmd_new_session(root: &Path, name: Option<&str>) -> Result<i32> {
    let manager = SessionManager::open(root)?;
    let session = manager.start_session(name)?;
    println!("{}", session.id());
    Ok(exit_codes::OK)
}

fn cmd_archive(root: &Path) -> Result<i32> {
    let manager = SessionManager::open(root)?;
    match manager.archive_current()? {
        Some(archived) => println!("{}", archived.path.display()),
        None => eprintln!("nothing to archive"),
    }
    Ok(exit_codes::OK)
}

fn cmd_sessions(root: &Path) -> Result<i32> {
    let manager = SessionManager::open(root)?;
    for listing in manager.list_sessions()? {
        let summary = &listing.summary;
        let tools: Vec<String> = summary
            .tool_usage
            .iter()
            .map(|(tool, count)| format!("{tool}={count}"))
            .collect();
        println!(
            "{}\t{}\t{}s\t{}",
            listing.reference.name,
            summary.start_time.format("%Y-%m-%d %H:%M:%S"),
            summary.duration_seconds,
            tools.join(",")
        );
    }
    let stats = manager.stats()?;
    eprintln!(
        "{} archived sessions ({} files, {} bytes); {} files in the active workspace",
        stats.archived_sessions, stats.archived_files, stats.archive_bytes, stats.active_files
    );
    Ok(exit_codes::OK)
}

fn cmd_restore(root: &Path, reference: &str) -> Result<i32> {
    let manager = SessionManager::open(root)?;
    let session = manager.restore_session(reference)?;
    println!("{}", session.id());
    Ok(exit_codes::OK)
}

fn cmd_clean(root: &Path, older_than_days: Option<u32>, keep_minimum: Option<usize>) -> Result<i32> {
    let cfg = load_agent_config(root)?;
    let manager = SessionManager::open(root)?;
    let removed = manager.clean_older_than(
        older_than_days.unwrap_or(cfg.retention.older_than_days),
        keep_minimum.unwrap_or(cfg.retention.keep_minimum),
    )?;
    for reference in &removed {
        println!("{}", reference.name);
    }
    eprintln!("removed {} archived sessions", removed.len());
    Ok(exit_codes::OK)
}

struct RunArgs {
    objective: String,
    name: Option<String>,
    no_approval: bool,
    max_iterations: Option<u32>,
    scope: Vec<String>,
    archive: bool,
}

fn cmd_run(root: &Path, args: &RunArgs) -> Result<i32> {
    let mut cfg = load_agent_config(root)?;
    if args.no_approval {
        cfg.approval_enabled = false;
    }
    if let Some(max_iterations) = args.max_iterations {
        cfg.max_iterations = max_iterations;
    }
    cfg.validate()?;
    let rules = load_rules(root, &cfg, &args.scope)?;

    let manager = SessionManager::open(root)?;
    let mut session = manager.start_session(args.name.as_deref())?;
    eprintln!("session {}", session.id());

    let planner = CommandPlanner::new(
        cfg.planner.command.clone(),
        root.to_path_buf(),
        Duration::from_secs(cfg.planner.timeout_secs),
    )?
    .with_output_limit(cfg.output_limit_bytes)
    .with_kill_grace(cfg.kill_grace())
    .with_scrubbed_env(cfg.scrubbed_env());
    let runner = ShellRunner::new(
        Arc::new(EnvCredentialProvider::new(cfg.elevation.credential_env.clone())),
        cfg.output_limit_bytes,
        cfg.kill_grace(),
        cfg.scrubbed_env(),
    );
    let engine = ExecutionEngine::new(runner);
    let audit = JsonlAuditLog::new(session.audit_path());
    let loop_config = LoopConfig::from_config(&cfg);

    let stdin = io::stdin();
    let mut prompt: Box<dyn ApprovalPrompt> = if stdin.is_terminal() {
        Box::new(TerminalPrompt::new(stdin.lock(), io::stderr()))
    } else {
        Box::new(DenyPrompt)
    };
    let mut orchestrator = Orchestrator {
        manager: &manager,
        planner: &planner,
        engine: &engine,
        prompt: &mut prompt,
        audit: &audit,
        rules: &rules,
        config: &loop_config,
    };
    let outcome = orchestrator.run_objective(&mut session, &args.objective, print_event)?;

    if args.archive
        && let Some(archived) = manager.archive_current()?
    {
        eprintln!("archived {}", archived.path.display());
    }

    Ok(match &outcome.stop {
        LoopStop::Completed { summary } => {
            println!("{summary}");
            exit_codes::OK
        }
        LoopStop::Exhausted { .. } => exit_codes::EXHAUSTED,
        LoopStop::UserQuit => exit_codes::USER_QUIT,
        LoopStop::PlannerUnavailable { error } => {
            eprintln!("{error}");
            exit_codes::PLANNER_UNAVAILABLE
        }
    })
}

fn print_event(event: LoopEvent<'_>) {
    match event {
        LoopEvent::State(_) => {}
        LoopEvent::PlannerRetry { attempt, error } => {
            eprintln!("planner attempt {attempt} failed: {error}");
        }
        LoopEvent::Classified {
            command,
            verdict,
            elevation,
        } => match elevation {
            Elevation::None => eprintln!("[{}] {command}", verdict.tier),
            Elevation::Sudo => eprintln!("[{}] (sudo) {command}", verdict.tier),
        },
        LoopEvent::Recorded(record) => match &record.result {
            Some(result) => eprintln!(
                "  #{} {} in {}ms",
                record.seq,
                result.status.describe(),
                result.duration_ms
            ),
            None => eprintln!(
                "  #{} not run ({}): {}",
                record.seq, record.approval.outcome, record.verdict.rationale
            ),
        },
    }
}

fn cmd_classify(root: &Path, command: &str, scope: &[String]) -> Result<i32> {
    let cfg = load_agent_config(root)?;
    let rules = load_rules(root, &cfg, scope)?;
    let verdict = match split_batch(command) {
        Some(members) => classify_batch(members.as_slice(), &rules),
        None => classify(command, &rules),
    };
    let mut payload = serde_json::to_string_pretty(&verdict).context("serialize verdict")?;
    payload.push('\n');
    print!("{payload}");
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "autopentest",
            "--root",
            "/tmp/ws",
            "run",
            "scan 127.0.0.1",
            "--no-approval",
            "--max-iterations",
            "3",
            "--scope",
            "10.0.0.0/24",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/ws"));
        let Command::Run {
            objective,
            no_approval,
            max_iterations,
            scope,
            archive,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(objective, "scan 127.0.0.1");
        assert!(no_approval);
        assert_eq!(max_iterations, Some(3));
        assert_eq!(scope, vec!["10.0.0.0/24".to_string()]);
        assert!(!archive);
    }

    #[test]
    fn parse_clean_defaults_to_config() {
        let cli = Cli::parse_from(["autopentest", "clean"]);
        assert!(matches!(
            cli.command,
            Command::Clean {
                older_than_days: None,
                keep_minimum: None
            }
        ));
        assert_eq!(cli.root, PathBuf::from("."));
    }

    #[test]
    fn parse_new_session_name() {
        let cli = Cli::parse_from(["autopentest", "new-session", "--name", "lab"]);
        assert!(matches!(cli.command, Command::NewSession { name: Some(ref n) } if n == "lab"));
    }
}

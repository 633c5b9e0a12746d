//! Execution engine: runs approved commands inside the active session.
//!
//! The [`CommandRunner`] trait decouples the engine from process spawning.
//! [`ShellRunner`] runs commands through `sh -c` (or `sudo` for elevated
//! requests); tests use scripted runners that return predetermined results.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::scope::primary_binary;
use crate::core::types::{Elevation, ExecStatus, ExecutionResult};
use crate::io::credentials::{CredentialProvider, Secret};
use crate::io::process::{CommandOutput, RunOptions, run_command};
use crate::io::session::Session;

pub const RESULTS_DIR_ENV: &str = "RESULTS_DIR";
pub const OUTPUT_FILE_ENV: &str = "OUTPUT_FILE";

const REDACTED: &str = "<redacted>";

/// Stderr fragments sudo prints when authentication fails.
const SUDO_AUTH_FAILURES: &[&str] = &[
    "incorrect password",
    "sorry, try again",
    "a password is required",
    "no password was provided",
    "is not in the sudoers file",
    "is not allowed to run sudo",
    "authentication failure",
];

/// Parameters for one command execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub timeout: Duration,
    pub elevation: Elevation,
    /// Session results directory, exported to the child as `RESULTS_DIR`.
    pub results_dir: PathBuf,
    /// Pre-assigned file receiving stdout, exported as `OUTPUT_FILE`.
    pub output_path: PathBuf,
}

/// Abstraction over process execution backends.
pub trait CommandRunner: Sync {
    /// Run `request.command`. Recoverable failures (non-zero exit, timeout,
    /// elevation failure) are reported in the returned status, not as `Err`.
    fn run(&self, request: &ExecRequest) -> Result<ExecutionResult>;
}

/// Runs commands through `sh -c`, elevating with `sudo -S` on request.
pub struct ShellRunner {
    credentials: Arc<dyn CredentialProvider>,
    output_limit_bytes: usize,
    kill_grace: Duration,
    /// Removed from every child environment (the credential variable included).
    scrub_env: Vec<String>,
}

impl ShellRunner {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        output_limit_bytes: usize,
        kill_grace: Duration,
        scrub_env: Vec<String>,
    ) -> Self {
        Self {
            credentials,
            output_limit_bytes,
            kill_grace,
            scrub_env,
        }
    }

    fn build_command(&self, request: &ExecRequest) -> Command {
        let mut cmd = match request.elevation {
            Elevation::None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&request.command);
                cmd
            }
            Elevation::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.args(["-S", "-k", "-p", ""])
                    .arg(format!("--preserve-env={RESULTS_DIR_ENV},{OUTPUT_FILE_ENV}"))
                    .args(["--", "sh", "-c"])
                    .arg(&request.command);
                cmd
            }
        };
        for var in &self.scrub_env {
            cmd.env_remove(var);
        }
        cmd.env(RESULTS_DIR_ENV, &request.results_dir)
            .env(OUTPUT_FILE_ENV, &request.output_path)
            .current_dir(&request.results_dir);
        cmd
    }
}

impl CommandRunner for ShellRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), command_len = request.command.len(), elevated = request.elevation == Elevation::Sudo))]
    fn run(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        let secret = match request.elevation {
            Elevation::None => None,
            Elevation::Sudo => match self.credentials.sudo_password()? {
                Some(secret) => Some(secret),
                None => {
                    warn!("elevation requested without a configured credential");
                    return Ok(failed_result(
                        request,
                        ExecStatus::ElevationFailed {
                            reason: "no elevation credential configured".to_string(),
                        },
                    ));
                }
            },
        };

        let stdin = secret.as_ref().map(|s| format!("{}\n", s.expose()).into_bytes());
        let opts = RunOptions {
            stdin: stdin.as_deref(),
            timeout: request.timeout,
            output_limit_bytes: self.output_limit_bytes,
            stream_path: Some(&request.output_path),
            kill_grace: self.kill_grace,
        };
        let output = match run_command(self.build_command(request), &opts) {
            Ok(output) => output,
            Err(e) if secret.is_some() => {
                return Ok(failed_result(
                    request,
                    ExecStatus::ElevationFailed {
                        reason: format!("cannot start sudo: {e:#}"),
                    },
                ));
            }
            Err(e) => return Err(e),
        };
        drop(stdin);

        let mut result = to_result(request, &output);
        if let Some(secret) = &secret {
            redact(&mut result, secret, &request.output_path);
            if let Some(reason) = sudo_auth_failure(&result) {
                result.status = ExecStatus::ElevationFailed { reason };
            }
        }
        Ok(result)
    }
}

fn to_result(request: &ExecRequest, output: &CommandOutput) -> ExecutionResult {
    let status = if output.timed_out {
        ExecStatus::TimedOut
    } else if let Some(code) = output.exit_code() {
        ExecStatus::Exited { code }
    } else {
        ExecStatus::Killed {
            signal: output.signal(),
        }
    };
    ExecutionResult {
        command: request.command.clone(),
        status,
        stdout: output.stdout_lossy(),
        stderr: output.stderr_lossy(),
        stdout_truncated: output.stdout_truncated,
        stderr_truncated: output.stderr_truncated,
        duration_ms: u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX),
        output_files: Vec::new(),
    }
}

fn failed_result(request: &ExecRequest, status: ExecStatus) -> ExecutionResult {
    ExecutionResult {
        command: request.command.clone(),
        status,
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration_ms: 0,
        output_files: Vec::new(),
    }
}

/// Scrub any echo of the credential from captured and streamed output.
fn redact(result: &mut ExecutionResult, secret: &Secret, output_path: &Path) {
    if secret.is_empty() {
        return;
    }
    let needle = secret.expose();
    if result.stdout.contains(needle) {
        result.stdout = result.stdout.replace(needle, REDACTED);
        if let Ok(streamed) = fs::read_to_string(output_path)
            && let Err(e) = fs::write(output_path, streamed.replace(needle, REDACTED))
        {
            warn!(err = %e, "failed to redact output file");
        }
    }
    if result.stderr.contains(needle) {
        result.stderr = result.stderr.replace(needle, REDACTED);
    }
}

/// Reason sudo refused to run the command, taken from sudo's own stderr lines.
/// Output of the elevated command itself is never consulted.
fn sudo_auth_failure(result: &ExecutionResult) -> Option<String> {
    if result.status.succeeded() {
        return None;
    }
    let failures: Vec<&str> = result
        .stderr
        .lines()
        .map(str::trim)
        .filter(|line| {
            let line = line.to_ascii_lowercase();
            let from_sudo = line.starts_with("sudo:")
                || line.starts_with("sorry, ")
                || line.contains("is not in the sudoers file");
            from_sudo && SUDO_AUTH_FAILURES.iter().any(|needle| line.contains(needle))
        })
        .collect();
    let reason = failures
        .iter()
        .find(|line| line.starts_with("sudo:"))
        .or_else(|| failures.first())?;
    Some((*reason).to_string())
}

/// Runs commands against a session's results directory.
pub struct ExecutionEngine<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> ExecutionEngine<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute one command. Files created or modified under `results/` during
    /// the run are attributed to it.
    #[instrument(skip_all, fields(session = %session.id(), timeout_secs = timeout.as_secs()))]
    pub fn execute(
        &self,
        session: &Session,
        command: &str,
        timeout: Duration,
        elevation: Elevation,
    ) -> ExecutionResult {
        let results_dir = session.results_dir();
        let before = snapshot(&results_dir);
        let mut result = self.run_job(session, command, timeout, elevation);
        let after = snapshot(&results_dir);
        for (path, stamp) in after {
            if before.get(&path) != Some(&stamp) {
                let relative = relative_to(&session.root, &path);
                if !result.output_files.contains(&relative) {
                    result.output_files.push(relative);
                }
            }
        }
        result
    }

    /// Execute independent commands with at most `max_concurrency` running at
    /// once. A failure or timeout in one never affects the others.
    #[instrument(skip_all, fields(session = %session.id(), jobs = commands.len(), max_concurrency))]
    pub fn execute_parallel(
        &self,
        session: &Session,
        commands: &[String],
        timeout: Duration,
        max_concurrency: usize,
    ) -> BTreeMap<String, ExecutionResult> {
        let mut seen = BTreeSet::new();
        let jobs: VecDeque<String> = commands
            .iter()
            .filter(|command| seen.insert(command.as_str()))
            .cloned()
            .collect();
        let workers = max_concurrency.max(1).min(jobs.len());
        info!(jobs = jobs.len(), workers, "starting parallel execution");

        let queue = Mutex::new(jobs);
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut queue) => queue.pop_front(),
                            Err(_) => None,
                        };
                        let Some(command) = next else {
                            break;
                        };
                        let result = self.run_job(session, &command, timeout, Elevation::None);
                        if tx.send((command, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut results: BTreeMap<String, ExecutionResult> = rx.into_iter().collect();
        for command in seen {
            if !results.contains_key(command) {
                results.insert(
                    command.to_string(),
                    ExecutionResult {
                        command: command.to_string(),
                        status: ExecStatus::SpawnFailed {
                            reason: "worker exited before running the command".to_string(),
                        },
                        stdout: String::new(),
                        stderr: String::new(),
                        stdout_truncated: 0,
                        stderr_truncated: 0,
                        duration_ms: 0,
                        output_files: Vec::new(),
                    },
                );
            }
        }
        results
    }

    fn run_job(
        &self,
        session: &Session,
        command: &str,
        timeout: Duration,
        elevation: Elevation,
    ) -> ExecutionResult {
        let results_dir = session.results_dir();
        let output_path = match reserve_output_path(&results_dir, command) {
            Ok(path) => path,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "failed to reserve output file");
                return spawn_failed(command, &e);
            }
        };
        let request = ExecRequest {
            command: command.to_string(),
            timeout,
            elevation,
            results_dir,
            output_path: output_path.clone(),
        };
        let mut result = match self.runner.run(&request) {
            Ok(result) => result,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "command could not be run");
                spawn_failed(command, &e)
            }
        };
        if output_path.exists() {
            result
                .output_files
                .insert(0, relative_to(&session.root, &output_path));
        }
        debug!(status = %result.status.describe(), "job finished");
        result
    }
}

fn spawn_failed(command: &str, err: &anyhow::Error) -> ExecutionResult {
    ExecutionResult {
        command: command.to_string(),
        status: ExecStatus::SpawnFailed {
            reason: format!("{err:#}"),
        },
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration_ms: 0,
        output_files: Vec::new(),
    }
}

/// Claim a fresh `results/<binary>-<NNNN>.out` file. Creation is exclusive, so
/// concurrent jobs never share an output file.
pub fn reserve_output_path(results_dir: &Path, command: &str) -> Result<PathBuf> {
    fs::create_dir_all(results_dir)
        .with_context(|| format!("create results dir {}", results_dir.display()))?;
    let stem: String = primary_binary(command)
        .unwrap_or("command")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let stem = if stem.is_empty() { "command".to_string() } else { stem };
    for n in 1..=9999u32 {
        let path = results_dir.join(format!("{stem}-{n:04}.out"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("create output file {}", path.display()));
            }
        }
    }
    anyhow::bail!("no free output file name for {stem} in {}", results_dir.display())
}

/// Fold the members of a `parallel:` batch into one result, in member order.
/// The batch succeeds only if every member did; otherwise it takes the first
/// failing member's status.
pub fn fold_batch(
    batch_command: &str,
    members: &[String],
    results: &BTreeMap<String, ExecutionResult>,
) -> ExecutionResult {
    let mut folded = ExecutionResult {
        command: batch_command.to_string(),
        status: ExecStatus::Exited { code: 0 },
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration_ms: 0,
        output_files: Vec::new(),
    };
    let mut seen = BTreeSet::new();
    for member in members {
        if !seen.insert(member.as_str()) {
            continue;
        }
        let Some(result) = results.get(member) else {
            continue;
        };
        if folded.status.succeeded() && !result.status.succeeded() {
            folded.status = result.status.clone();
        }
        folded.stdout.push_str(&format!(
            "### {member} ({})\n{}\n",
            result.status.describe(),
            result.stdout.trim_end()
        ));
        if !result.stderr.trim().is_empty() {
            folded
                .stderr
                .push_str(&format!("### {member}\n{}\n", result.stderr.trim_end()));
        }
        folded.stdout_truncated += result.stdout_truncated;
        folded.stderr_truncated += result.stderr_truncated;
        folded.duration_ms = folded.duration_ms.max(result.duration_ms);
        folded.output_files.extend(result.output_files.iter().cloned());
    }
    folded
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

/// Regular files under `dir` with their size and modification time.
fn snapshot(dir: &Path) -> BTreeMap<PathBuf, (u64, Option<SystemTime>)> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(listing) = fs::read_dir(&current) else {
            continue;
        };
        for entry in listing.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file()
                && let Ok(meta) = entry.metadata()
            {
                files.insert(entry.path(), (meta.len(), meta.modified().ok()));
            }
        }
    }
    files
}

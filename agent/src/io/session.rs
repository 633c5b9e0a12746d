//! Session lifecycle: rotation, archival, restore and retention.
//!
//! The active workspace is `{results,logs,session_data}/` under the workspace
//! root. Archives live under `sessions/<id>/` and contain the same directories
//! plus `session_summary.json` and `README.md`.
//!
//! Archival is rename-based. The active directories are moved into
//! `sessions/.staging-<id>/`, the summary is written last as the commit marker,
//! and the staging directory is renamed into place. [`SessionManager::open`]
//! finishes or rolls back any staging directory left by a crash, so at every
//! point either the prior workspace or the new archive is intact.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::planning::split_batch;
use crate::core::scope::{command_hosts, primary_binary};
use crate::core::types::Phase;
use crate::errors::AgentError;
use crate::io::lock::{ITERATION_LOCK, LockGuard, SESSION_LOCK};
use crate::io::prompt::render_archive_readme;

pub const RESULTS_DIR: &str = "results";
pub const LOGS_DIR: &str = "logs";
pub const SESSION_DATA_DIR: &str = "session_data";
pub const WORKSPACE_DIRS: [&str; 3] = [SESSION_DATA_DIR, RESULTS_DIR, LOGS_DIR];
pub const ARCHIVE_DIR: &str = "sessions";
pub const METADATA_FILE: &str = "session_metadata.json";
pub const SUMMARY_FILE: &str = "session_summary.json";
pub const README_FILE: &str = "README.md";
pub const AUDIT_FILE: &str = "audit.jsonl";
pub const SUMMARY_FORMAT_VERSION: u32 = 1;

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";
const RESTORE_STAGING: &str = ".restore-staging";
const RESTORE_READY: &str = ".ready";
const ID_PREFIX: &str = "session_";
const ID_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_NAME_LEN: usize = 64;

/// Mutable per-session bookkeeping persisted in `session_data/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub targets: BTreeSet<String>,
    #[serde(default)]
    pub tool_usage: BTreeMap<String, u32>,
    #[serde(default)]
    pub phases_completed: BTreeSet<Phase>,
    #[serde(default)]
    pub current_phase: Option<Phase>,
    #[serde(default)]
    pub commands_executed: u32,
    #[serde(default)]
    pub final_summary: Option<String>,
}

impl SessionMetadata {
    pub fn new(id: String, name: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            start_time: now,
            end_time: None,
            last_activity: now,
            objective: None,
            targets: BTreeSet::new(),
            tool_usage: BTreeMap::new(),
            phases_completed: BTreeSet::new(),
            current_phase: None,
            commands_executed: 0,
            final_summary: None,
        }
    }

    /// Fold one executed command into the target/tool/phase counters.
    ///
    /// `parallel:` batches count every member. A phase is marked completed
    /// once a command in that phase succeeds.
    pub fn record_execution(
        &mut self,
        command: &str,
        phase: Option<Phase>,
        succeeded: bool,
        now: DateTime<Utc>,
    ) {
        let members = split_batch(command).unwrap_or_else(|| vec![command.to_string()]);
        for member in &members {
            if let Some(binary) = primary_binary(member) {
                *self
                    .tool_usage
                    .entry(binary.to_ascii_lowercase())
                    .or_insert(0) += 1;
            }
            self.targets.extend(command_hosts(member));
        }
        if let Some(phase) = phase {
            self.current_phase = Some(phase);
            if succeeded {
                self.phases_completed.insert(phase);
            }
        }
        self.commands_executed += 1;
        self.last_activity = now;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }
}

/// The active session. Passed explicitly to everything that writes into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub root: PathBuf,
    pub metadata: SessionMetadata,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(SESSION_DATA_DIR)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.logs_dir().join(AUDIT_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir().join(METADATA_FILE)
    }

    pub fn iteration_lock_path(&self) -> PathBuf {
        self.root.join(ITERATION_LOCK)
    }

    pub fn session_lock_path(&self) -> PathBuf {
        self.root.join(SESSION_LOCK)
    }
}

/// Machine-readable archive record (`session_summary.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub format_version: u32,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub file_counts: BTreeMap<String, u64>,
    pub tool_usage: BTreeMap<String, u32>,
    pub targets: BTreeSet<String>,
    pub phases: BTreeMap<Phase, bool>,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub final_summary: Option<String>,
}

/// Handle to one archive directory under `sessions/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedSessionRef {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionListing {
    pub reference: ArchivedSessionRef,
    pub summary: SessionSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub archived_sessions: usize,
    pub active_files: u64,
    pub archived_files: u64,
    pub archive_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    root: PathBuf,
    archive_root: PathBuf,
}

impl SessionManager {
    /// Open the workspace at `root`, creating missing directories and
    /// recovering from any interrupted transaction.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn open(root: &Path) -> Result<Self> {
        let manager = Self {
            root: root.to_path_buf(),
            archive_root: root.join(ARCHIVE_DIR),
        };
        fs::create_dir_all(&manager.archive_root).with_context(|| {
            format!("create archive dir {}", manager.archive_root.display())
        })?;
        manager.recover()?;
        manager.ensure_workspace_dirs()?;
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    fn session_lock(&self) -> Result<LockGuard> {
        LockGuard::acquire(
            &self.root.join(SESSION_LOCK),
            &[self.root.join(ITERATION_LOCK)],
        )
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join(SESSION_DATA_DIR).join(METADATA_FILE)
    }

    /// The active session, if the workspace holds one.
    pub fn active_session(&self) -> Result<Option<Session>> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(None);
        }
        let metadata = read_metadata(&path)?;
        Ok(Some(Session {
            root: self.root.clone(),
            metadata,
        }))
    }

    /// Persist the session's metadata atomically.
    pub fn save_metadata(&self, session: &Session) -> Result<()> {
        write_json_atomic(&session.metadata_path(), &session.metadata)
    }

    /// Archive any active session, then start a fresh one in empty directories.
    #[instrument(skip_all)]
    pub fn start_session(&self, name: Option<&str>) -> Result<Session> {
        self.start_session_at(name, Utc::now())
    }

    pub fn start_session_at(&self, name: Option<&str>, now: DateTime<Utc>) -> Result<Session> {
        let _lock = self.session_lock()?;
        if let Some(archived) = self
            .archive_locked(now)
            .map_err(|e| AgentError::session("archive", &e))?
        {
            info!(archive = %archived.name, "archived previous session");
        }
        self.ensure_workspace_dirs()
            .map_err(|e| AgentError::session("recreate workspace", &e))?;

        let name = name.and_then(sanitize_name);
        let id = session_id(now, name.as_deref());
        let session = Session {
            root: self.root.clone(),
            metadata: SessionMetadata::new(id, name, now),
        };
        self.save_metadata(&session)
            .map_err(|e| AgentError::session("initialize", &e))?;
        info!(session = %session.id(), "started session");
        Ok(session)
    }

    /// Move the active session into a new archive entry.
    ///
    /// Returns `None` when the workspace holds nothing to archive.
    #[instrument(skip_all)]
    pub fn archive_current(&self) -> Result<Option<ArchivedSessionRef>> {
        self.archive_current_at(Utc::now())
    }

    pub fn archive_current_at(&self, now: DateTime<Utc>) -> Result<Option<ArchivedSessionRef>> {
        let _lock = self.session_lock()?;
        let archived = self
            .archive_locked(now)
            .map_err(|e| AgentError::session("archive", &e))?;
        self.ensure_workspace_dirs()
            .map_err(|e| AgentError::session("recreate workspace", &e))?;
        Ok(archived)
    }

    /// Archive whatever is active, then copy `reference` back into the workspace.
    /// The archive itself is left untouched.
    #[instrument(skip_all, fields(reference))]
    pub fn restore_session(&self, reference: &str) -> Result<Session> {
        self.restore_session_at(reference, Utc::now())
    }

    pub fn restore_session_at(&self, reference: &str, now: DateTime<Utc>) -> Result<Session> {
        let _lock = self.session_lock()?;
        let source = self.resolve(reference)?;

        let staging = self.root.join(RESTORE_STAGING);
        remove_dir_if_exists(&staging)?;
        for dir in WORKSPACE_DIRS {
            let from = source.path.join(dir);
            let to = staging.join(dir);
            if from.is_dir() {
                copy_dir_recursive(&from, &to)
                    .map_err(|e| AgentError::session("copy archive", &e))?;
            } else {
                fs::create_dir_all(&to)
                    .with_context(|| format!("create {}", to.display()))?;
            }
        }
        fs::write(staging.join(RESTORE_READY), source.name.as_bytes())
            .with_context(|| format!("mark restore staging {}", staging.display()))?;

        self.archive_locked(now)
            .map_err(|e| AgentError::session("archive", &e))?;
        self.finish_restore(&staging)
            .map_err(|e| AgentError::session("swap restored workspace", &e))?;

        let session = self.active_session()?.ok_or_else(|| {
            anyhow!(
                "restored archive {} has no {SESSION_DATA_DIR}/{METADATA_FILE}",
                source.name
            )
        })?;
        info!(archive = %source.name, session = %session.id(), "restored session");
        Ok(session)
    }

    /// Delete archives older than `days`, oldest first, never leaving fewer
    /// than `keep_minimum`. The active workspace is not touched.
    #[instrument(skip_all, fields(days, keep_minimum))]
    pub fn clean_older_than(
        &self,
        days: u32,
        keep_minimum: usize,
    ) -> Result<Vec<ArchivedSessionRef>> {
        self.clean_older_than_at(days, keep_minimum, Utc::now())
    }

    pub fn clean_older_than_at(
        &self,
        days: u32,
        keep_minimum: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ArchivedSessionRef>> {
        let _lock = self.session_lock()?;
        let mut entries: Vec<(DateTime<Utc>, ArchivedSessionRef)> = Vec::new();
        for reference in self.archive_entries()? {
            let started = match read_summary(&reference.path) {
                Ok(summary) => Some(summary.start_time),
                Err(_) => time_from_name(&reference.name),
            };
            match started {
                Some(started) => entries.push((started, reference)),
                None => warn!(archive = %reference.name, "cannot date archive, keeping it"),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));

        let removable = entries.len().saturating_sub(keep_minimum);
        let cutoff = now - chrono::Duration::days(i64::from(days));
        let mut removed = Vec::new();
        for (started, reference) in entries {
            if removed.len() >= removable || started >= cutoff {
                break;
            }
            self.delete_archive(&reference)
                .map_err(|e| AgentError::session("clean", &e))?;
            debug!(archive = %reference.name, "removed archive");
            removed.push(reference);
        }
        Ok(removed)
    }

    /// Archived sessions with readable summaries, most recent first.
    pub fn list_sessions(&self) -> Result<Vec<SessionListing>> {
        let mut listings = Vec::new();
        for reference in self.archive_entries()? {
            match read_summary(&reference.path) {
                Ok(summary) => listings.push(SessionListing { reference, summary }),
                Err(e) => warn!(archive = %reference.name, err = %format!("{e:#}"), "skipping unreadable archive"),
            }
        }
        listings.sort_by(|a, b| {
            b.summary
                .start_time
                .cmp(&a.summary.start_time)
                .then_with(|| b.reference.name.cmp(&a.reference.name))
        });
        Ok(listings)
    }

    pub fn stats(&self) -> Result<SessionStats> {
        let mut active_files = 0;
        for dir in WORKSPACE_DIRS {
            active_files += dir_usage(&self.root.join(dir))?.0;
        }
        let archives = self.archive_entries()?;
        let mut archived_files = 0;
        let mut archive_bytes = 0;
        for reference in &archives {
            let (files, bytes) = dir_usage(&reference.path)?;
            archived_files += files;
            archive_bytes += bytes;
        }
        Ok(SessionStats {
            archived_sessions: archives.len(),
            active_files,
            archived_files,
            archive_bytes,
        })
    }

    fn resolve(&self, reference: &str) -> Result<ArchivedSessionRef> {
        let reference = reference.trim().trim_end_matches('/');
        let name = Path::new(reference)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(reference);
        let entries = self.archive_entries()?;
        if let Some(exact) = entries.iter().find(|entry| entry.name == name) {
            return Ok(exact.clone());
        }
        let matches: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.name.starts_with(name) || entry.name.ends_with(name))
            .collect();
        match matches.as_slice() {
            [single] => Ok(single.clone()),
            [] => Err(anyhow!("no archived session matches '{reference}'")),
            _ => Err(anyhow!(
                "'{reference}' is ambiguous: {}",
                matches
                    .iter()
                    .map(|entry| entry.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }

    fn archive_entries(&self) -> Result<Vec<ArchivedSessionRef>> {
        let mut entries = Vec::new();
        let listing = fs::read_dir(&self.archive_root)
            .with_context(|| format!("read archive dir {}", self.archive_root.display()))?;
        for entry in listing {
            let entry = entry.context("read archive entry")?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            entries.push(ArchivedSessionRef {
                name,
                path: entry.path(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn workspace_has_content(&self) -> Result<bool> {
        for dir in WORKSPACE_DIRS {
            if dir_usage(&self.root.join(dir))?.0 > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Move the active directories into a new archive. Leaves the workspace
    /// directories absent; callers recreate or replace them.
    fn archive_locked(&self, now: DateTime<Utc>) -> Result<Option<ArchivedSessionRef>> {
        let metadata = match self.active_session()? {
            Some(session) => session.metadata,
            None if self.workspace_has_content()? => {
                warn!("archiving workspace content that has no session metadata");
                let start = earliest_mtime(&self.root).unwrap_or(now);
                SessionMetadata::new(session_id(start, None), None, start)
            }
            None => return Ok(None),
        };

        let final_name = self.unique_archive_name(&metadata.id);
        let staging = self
            .archive_root
            .join(format!("{STAGING_PREFIX}{final_name}"));
        fs::create_dir(&staging)
            .with_context(|| format!("create staging dir {}", staging.display()))?;

        let final_path = self.archive_root.join(&final_name);
        if let Err(err) = self.fill_staging(&staging, &final_path, metadata, now) {
            if let Err(rollback) = self.roll_back_staging(&staging) {
                warn!(err = %rollback, staging = %staging.display(), "failed to roll back archive");
            }
            return Err(err);
        }
        Ok(Some(ArchivedSessionRef {
            name: final_name,
            path: final_path,
        }))
    }

    /// Move the workspace into `staging`, write the summary files and rename
    /// it to `final_path`.
    fn fill_staging(
        &self,
        staging: &Path,
        final_path: &Path,
        mut metadata: SessionMetadata,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for dir in WORKSPACE_DIRS {
            let from = self.root.join(dir);
            if from.exists() {
                fs::rename(&from, staging.join(dir))
                    .with_context(|| format!("move {} into staging", from.display()))?;
            } else {
                fs::create_dir(staging.join(dir))
                    .with_context(|| format!("create staged {dir}"))?;
            }
        }

        let end_time = match metadata.end_time {
            Some(end) if metadata.last_activity <= end => end,
            _ => now,
        };
        metadata.end_time = Some(end_time);
        write_json_atomic(
            &staging.join(SESSION_DATA_DIR).join(METADATA_FILE),
            &metadata,
        )?;

        let summary = build_summary(&metadata, staging, end_time)?;
        let readme = render_archive_readme(&summary)?;
        fs::write(staging.join(README_FILE), readme)
            .with_context(|| format!("write {README_FILE} in {}", staging.display()))?;
        write_json_atomic(&staging.join(SUMMARY_FILE), &summary)?;

        fs::rename(staging, final_path)
            .with_context(|| format!("finalize archive {}", final_path.display()))
    }

    fn unique_archive_name(&self, id: &str) -> String {
        let taken = |name: &str| {
            self.archive_root.join(name).exists()
                || self
                    .archive_root
                    .join(format!("{STAGING_PREFIX}{name}"))
                    .exists()
        };
        if !taken(id) {
            return id.to_string();
        }
        (2..)
            .map(|n| format!("{id}-{n}"))
            .find(|candidate| !taken(candidate))
            .unwrap_or_else(|| id.to_string())
    }

    fn finish_restore(&self, staging: &Path) -> Result<()> {
        for dir in WORKSPACE_DIRS {
            let from = staging.join(dir);
            let to = self.root.join(dir);
            if !from.exists() {
                continue;
            }
            if to.exists() {
                fs::remove_dir(&to).with_context(|| {
                    format!("replace {} (workspace directory not empty)", to.display())
                })?;
            }
            fs::rename(&from, &to)
                .with_context(|| format!("move restored {dir} into workspace"))?;
        }
        remove_dir_if_exists(staging)?;
        self.ensure_workspace_dirs()
    }

    fn delete_archive(&self, reference: &ArchivedSessionRef) -> Result<()> {
        let trash = self
            .archive_root
            .join(format!("{TRASH_PREFIX}{}", reference.name));
        remove_dir_if_exists(&trash)?;
        fs::rename(&reference.path, &trash)
            .with_context(|| format!("move {} to trash", reference.path.display()))?;
        if let Err(e) = fs::remove_dir_all(&trash) {
            warn!(err = %e, path = %trash.display(), "failed to purge trash; retrying on next open");
        }
        Ok(())
    }

    fn ensure_workspace_dirs(&self) -> Result<()> {
        for dir in WORKSPACE_DIRS {
            let path = self.root.join(dir);
            fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
        }
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let listing = fs::read_dir(&self.archive_root)
            .with_context(|| format!("read archive dir {}", self.archive_root.display()))?;
        for entry in listing {
            let entry = entry.context("read archive entry")?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let path = entry.path();
            if let Some(final_name) = name.strip_prefix(STAGING_PREFIX) {
                if path.join(SUMMARY_FILE).exists() {
                    let target = if self.archive_root.join(final_name).exists() {
                        self.archive_root.join(self.unique_archive_name(final_name))
                    } else {
                        self.archive_root.join(final_name)
                    };
                    warn!(archive = %final_name, "finishing interrupted archive");
                    fs::rename(&path, &target)
                        .with_context(|| format!("finalize archive {}", target.display()))?;
                } else {
                    warn!(archive = %final_name, "rolling back interrupted archive");
                    self.roll_back_staging(&path)?;
                }
            } else if name.starts_with(TRASH_PREFIX) {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("purge trash {}", path.display()))?;
            }
        }

        let restore = self.root.join(RESTORE_STAGING);
        if restore.exists() {
            if restore.join(RESTORE_READY).exists() && !self.workspace_has_content()? {
                warn!("finishing interrupted restore");
                self.finish_restore(&restore)?;
            } else {
                warn!("discarding interrupted restore staging");
                remove_dir_if_exists(&restore)?;
            }
        }
        Ok(())
    }

    fn roll_back_staging(&self, staging: &Path) -> Result<()> {
        for dir in WORKSPACE_DIRS {
            let from = staging.join(dir);
            if !from.exists() {
                continue;
            }
            let to = self.root.join(dir);
            if to.exists() {
                if dir_usage(&to)?.0 > 0 {
                    return Err(anyhow!(
                        "cannot roll back {}: {} is not empty",
                        staging.display(),
                        to.display()
                    ));
                }
                remove_dir_if_exists(&to)?;
            }
            fs::rename(&from, &to)
                .with_context(|| format!("roll back {} into workspace", from.display()))?;
        }
        remove_dir_if_exists(staging)
    }
}

fn build_summary(
    metadata: &SessionMetadata,
    archive: &Path,
    end_time: DateTime<Utc>,
) -> Result<SessionSummary> {
    let mut file_counts = BTreeMap::new();
    for dir in WORKSPACE_DIRS {
        file_counts.insert(dir.to_string(), dir_usage(&archive.join(dir))?.0);
    }
    let phases = Phase::ALL
        .into_iter()
        .map(|phase| (phase, metadata.phases_completed.contains(&phase)))
        .collect();
    Ok(SessionSummary {
        format_version: SUMMARY_FORMAT_VERSION,
        id: metadata.id.clone(),
        name: metadata.name.clone(),
        start_time: metadata.start_time,
        end_time,
        duration_seconds: (end_time - metadata.start_time).num_seconds().max(0),
        file_counts,
        tool_usage: metadata.tool_usage.clone(),
        targets: metadata.targets.clone(),
        phases,
        objective: metadata.objective.clone(),
        final_summary: metadata.final_summary.clone(),
    })
}

/// `session_<YYYYmmdd_HHMMSS>[_<name>]`.
pub fn session_id(now: DateTime<Utc>, name: Option<&str>) -> String {
    let stamp = now.format(ID_TIME_FORMAT);
    match name {
        Some(name) => format!("{ID_PREFIX}{stamp}_{name}"),
        None => format!("{ID_PREFIX}{stamp}"),
    }
}

/// Restrict a user-supplied session name to `[A-Za-z0-9_-]`.
pub fn sanitize_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Start time encoded in an archive name, if any.
fn time_from_name(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(ID_PREFIX)?.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, ID_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn read_metadata(path: &Path) -> Result<SessionMetadata> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session metadata {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parse session metadata {}", path.display()))
}

pub fn read_summary(archive: &Path) -> Result<SessionSummary> {
    let path = archive.join(SUMMARY_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read session summary {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parse session summary {}", path.display()))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to).with_context(|| format!("create {}", to.display()))?;
    for entry in fs::read_dir(from).with_context(|| format!("read {}", from.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", from.display()))?;
        let file_type = entry.file_type().context("read file type")?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(())
}

/// Regular file count and total bytes under `dir` (0 when missing).
fn dir_usage(dir: &Path) -> Result<(u64, u64)> {
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e).with_context(|| format!("read {}", dir.display())),
    };
    let mut files = 0;
    let mut bytes = 0;
    for entry in listing {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let file_type = entry.file_type().context("read file type")?;
        if file_type.is_dir() {
            let (f, b) = dir_usage(&entry.path())?;
            files += f;
            bytes += b;
        } else if file_type.is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((files, bytes))
}

fn earliest_mtime(root: &Path) -> Option<DateTime<Utc>> {
    WORKSPACE_DIRS
        .iter()
        .filter_map(|dir| fs::metadata(root.join(dir)).ok()?.modified().ok())
        .min()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn open_creates_workspace_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        for dir in WORKSPACE_DIRS {
            assert!(temp.path().join(dir).is_dir());
        }
        assert!(manager.archive_root().is_dir());
        assert!(manager.active_session().expect("active").is_none());
    }

    #[test]
    fn session_ids_embed_timestamp_and_sanitized_name() {
        assert_eq!(session_id(at(5, 14), None), "session_20260305_140000");
        assert_eq!(
            sanitize_name(" web app/../x ").as_deref(),
            Some("web_app____x")
        );
        assert_eq!(sanitize_name("///"), None);
        assert_eq!(
            time_from_name("session_20260305_140000_lab"),
            Some(at(5, 14))
        );
        assert_eq!(time_from_name("manual-copy"), None);
    }

    #[test]
    fn start_session_archives_previous_and_empties_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let first = manager
            .start_session_at(Some("lab"), at(1, 10))
            .expect("first");
        fs::write(first.results_dir().join("scan.txt"), "22/tcp open").expect("write");

        let second = manager.start_session_at(None, at(1, 11)).expect("second");
        assert_ne!(first.id(), second.id());
        assert_eq!(dir_usage(&second.results_dir()).expect("usage").0, 0);

        let listings = manager.list_sessions().expect("list");
        assert_eq!(listings.len(), 1);
        let archived = &listings[0];
        assert_eq!(archived.reference.name, "session_20260301_100000_lab");
        assert_eq!(archived.summary.file_counts["results"], 1);
        assert_eq!(archived.summary.duration_seconds, 3600);
        assert!(archived.reference.path.join(README_FILE).is_file());
        assert!(
            archived
                .reference
                .path
                .join(RESULTS_DIR)
                .join("scan.txt")
                .is_file()
        );
    }

    #[test]
    fn archive_without_content_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        assert_eq!(manager.archive_current().expect("archive"), None);
        assert!(manager.list_sessions().expect("list").is_empty());
    }

    #[test]
    fn record_execution_counts_tools_targets_and_phases() {
        let mut metadata = SessionMetadata::new("s".into(), None, at(1, 0));
        metadata.record_execution(
            "nmap -p 1-1000 127.0.0.1 | grep open",
            Some(Phase::Scanning),
            true,
            at(1, 1),
        );
        metadata.record_execution(
            "parallel: whatweb http://localhost ;; nikto -h 127.0.0.1",
            Some(Phase::VulnAssessment),
            false,
            at(1, 2),
        );
        assert_eq!(metadata.tool_usage.get("nmap"), Some(&1));
        assert_eq!(metadata.tool_usage.get("grep"), None);
        assert_eq!(metadata.tool_usage.get("whatweb"), Some(&1));
        assert_eq!(metadata.tool_usage.get("nikto"), Some(&1));
        assert!(metadata.targets.contains("127.0.0.1"));
        assert!(metadata.targets.contains("localhost"));
        assert!(metadata.phases_completed.contains(&Phase::Scanning));
        assert!(!metadata.phases_completed.contains(&Phase::VulnAssessment));
        assert_eq!(metadata.current_phase, Some(Phase::VulnAssessment));
        assert_eq!(metadata.commands_executed, 2);
        assert_eq!(metadata.last_activity, at(1, 2));
    }

    #[test]
    fn interrupted_archive_without_summary_rolls_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let session = manager.start_session_at(None, at(2, 9)).expect("start");
        fs::write(session.results_dir().join("a.txt"), "a").expect("write");

        // Simulate a crash right after the directories moved into staging.
        let staging = manager
            .archive_root()
            .join(format!("{STAGING_PREFIX}{}", session.id()));
        fs::create_dir(&staging).expect("staging");
        for dir in WORKSPACE_DIRS {
            fs::rename(temp.path().join(dir), staging.join(dir)).expect("move");
        }

        let manager = SessionManager::open(temp.path()).expect("reopen");
        assert!(!staging.exists());
        assert!(temp.path().join(RESULTS_DIR).join("a.txt").is_file());
        let active = manager.active_session().expect("active").expect("session");
        assert_eq!(active.id(), session.id());
    }

    #[test]
    fn failed_archive_puts_workspace_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let session = manager.start_session_at(None, at(2, 9)).expect("start");
        fs::write(session.results_dir().join("a.txt"), "a").expect("write");
        // A directory where the metadata temp file goes makes the staged write fail.
        fs::create_dir(session.data_dir().join(format!("{METADATA_FILE}.tmp"))).expect("block");

        assert!(manager.archive_current_at(at(2, 10)).is_err());
        assert!(temp.path().join(RESULTS_DIR).join("a.txt").is_file());
        assert!(temp.path().join(LOGS_DIR).is_dir());
        let leftovers: Vec<_> = fs::read_dir(manager.archive_root())
            .expect("read archive root")
            .collect();
        assert!(leftovers.is_empty());
        let active = manager.active_session().expect("active").expect("session");
        assert_eq!(active.id(), session.id());
    }

    #[test]
    fn interrupted_archive_with_summary_is_finalized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let archived = {
            let session = manager.start_session_at(None, at(3, 9)).expect("start");
            fs::write(session.logs_dir().join("l.txt"), "l").expect("write");
            manager
                .archive_current_at(at(3, 10))
                .expect("archive")
                .expect("archived")
        };
        let staging = manager
            .archive_root()
            .join(format!("{STAGING_PREFIX}{}", archived.name));
        fs::rename(&archived.path, &staging).expect("unfinalize");

        let manager = SessionManager::open(temp.path()).expect("reopen");
        assert!(!staging.exists());
        assert!(archived.path.join(SUMMARY_FILE).is_file());
        assert_eq!(manager.list_sessions().expect("list").len(), 1);
    }

    #[test]
    fn restore_copies_archive_and_archives_current() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let first = manager.start_session_at(Some("a"), at(4, 8)).expect("a");
        fs::write(first.results_dir().join("a.txt"), "alpha").expect("write");
        let second = manager.start_session_at(Some("b"), at(4, 9)).expect("b");
        fs::write(second.results_dir().join("b.txt"), "beta").expect("write");

        let restored = manager
            .restore_session_at("session_20260304_080000_a", at(4, 10))
            .expect("restore");
        assert_eq!(restored.id(), first.id());
        assert_eq!(
            fs::read_to_string(restored.results_dir().join("a.txt")).expect("read"),
            "alpha"
        );
        assert!(!restored.results_dir().join("b.txt").exists());

        let names: Vec<_> = manager
            .list_sessions()
            .expect("list")
            .into_iter()
            .map(|listing| listing.reference.name)
            .collect();
        assert_eq!(
            names,
            vec!["session_20260304_090000_b", "session_20260304_080000_a"]
        );
        assert!(!temp.path().join(RESTORE_STAGING).exists());
    }

    #[test]
    fn restore_of_unknown_reference_fails_without_side_effects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let session = manager.start_session_at(None, at(6, 8)).expect("start");
        assert!(manager.restore_session("session_1999").is_err());
        let active = manager.active_session().expect("active").expect("session");
        assert_eq!(active.id(), session.id());
    }

    #[test]
    fn busy_iteration_lock_blocks_rotation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let session = manager.start_session_at(None, at(7, 8)).expect("start");
        let _executing = LockGuard::acquire(&session.iteration_lock_path(), &[]).expect("lock");
        let err = manager.start_session_at(None, at(7, 9)).expect_err("busy");
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::WorkspaceBusy(_))
        ));
        assert!(manager.list_sessions().expect("list").is_empty());
    }

    #[test]
    fn stats_count_active_and_archived_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::open(temp.path()).expect("open");
        let session = manager.start_session_at(None, at(8, 8)).expect("start");
        fs::write(session.results_dir().join("x.txt"), "12345").expect("write");
        manager.start_session_at(None, at(8, 9)).expect("rotate");
        let stats = manager.stats().expect("stats");
        assert_eq!(stats.archived_sessions, 1);
        // Only the new session's metadata file is active.
        assert_eq!(stats.active_files, 1);
        // results/x.txt, session_data/metadata, summary, README.
        assert_eq!(stats.archived_files, 4);
        assert!(stats.archive_bytes >= 5);
    }
}

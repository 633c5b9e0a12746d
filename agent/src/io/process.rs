//! Child processes with timeouts, bounded output and process-group cleanup.
//!
//! Every child is started as the leader of its own process group so that a
//! timeout can take down the whole tree (SIGTERM, grace period, SIGKILL) and
//! stragglers that outlive the leader are reaped before output is collected.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Minimum time allowed for output pipes to drain after the child exits.
const MIN_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    pub output_limit_bytes: usize,
    /// Tee stdout into this file as it arrives.
    pub stream_path: Option<&'a Path>,
    /// Time between SIGTERM and SIGKILL when a timeout fires.
    pub kill_grace: Duration,
}

impl RunOptions<'_> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            stream_path: None,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn signal(&self) -> Option<i32> {
        self.status.signal()
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Capture>>;
type StreamFile = Arc<Mutex<BufWriter<File>>>;

/// Run a command to completion or timeout, capturing stdout/stderr without
/// risking pipe deadlocks.
#[instrument(skip_all, fields(timeout_secs = opts.timeout.as_secs(), output_limit_bytes = opts.output_limit_bytes, streaming = opts.stream_path.is_some()))]
pub fn run_command(mut cmd: Command, opts: &RunOptions<'_>) -> Result<CommandOutput> {
    if opts.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.process_group(0);

    let stream_file = match opts.stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        }
        None => None,
    };

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pgid = child.id();

    let stdin_handle = match opts.stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || -> Result<()> {
                match child_stdin.write_all(&input) {
                    Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e).context("write stdin"),
                    _ => Ok(()),
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (stdout_capture, stdout_handle) =
        spawn_reader(stdout, opts.output_limit_bytes, stream_file);
    let (stderr_capture, stderr_handle) = spawn_reader(stderr, opts.output_limit_bytes, None);

    let mut timed_out = false;
    let status = match child.wait_timeout(opts.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = opts.timeout.as_secs(),
                "command timed out, terminating process group"
            );
            timed_out = true;
            terminate_group(&mut child, pgid, opts.kill_grace)?
        }
    };
    // Descendants may still hold the output pipes open.
    signal_group(pgid, libc::SIGKILL);
    let duration = started.elapsed();

    let deadline = Instant::now() + opts.kill_grace.max(MIN_DRAIN);
    let mut handles = vec![("stdout", stdout_handle), ("stderr", stderr_handle)];
    if let Some(handle) = stdin_handle {
        handles.push(("stdin", handle));
    }
    for (label, handle) in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            match handle.join() {
                Ok(result) => result.with_context(|| format!("child {label} pipe"))?,
                Err(_) => return Err(anyhow!("{label} thread panicked")),
            }
        } else {
            warn!(stream = label, "child pipe still open after exit, abandoning reader");
        }
    }

    let (stdout, stdout_truncated) = take_capture(&stdout_capture)?;
    let (stderr, stderr_truncated) = take_capture(&stderr_capture)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        duration,
    })
}

fn terminate_group(child: &mut Child, pgid: u32, grace: Duration) -> Result<ExitStatus> {
    signal_group(pgid, libc::SIGTERM);
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for command after SIGTERM")?
    {
        return Ok(status);
    }
    warn!(grace_ms = grace.as_millis() as u64, "process group ignored SIGTERM, killing");
    signal_group(pgid, libc::SIGKILL);
    child.wait().context("wait command after kill")
}

/// Send `signal` to every process in group `pgid`. A missing group is fine.
#[allow(unsafe_code)]
fn signal_group(pgid: u32, signal: i32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid targets the group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            debug!(err = %err, signal, "failed to signal process group");
        }
    }
}

/// Whether a process with `pid` currently exists.
#[allow(unsafe_code)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    tee: Option<StreamFile>,
) -> (SharedCapture, thread::JoinHandle<Result<()>>) {
    let capture = SharedCapture::default();
    let sink = Arc::clone(&capture);
    let handle = thread::spawn(move || read_stream_limited(reader, limit, &sink, tee.as_ref()));
    (capture, handle)
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    capture: &SharedCapture,
    tee: Option<&StreamFile>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read output"),
        };

        if let Some(file) = tee
            && let Ok(mut writer) = file.lock()
        {
            if let Err(e) = writer.write_all(&chunk[..n]) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let mut capture = capture
            .lock()
            .map_err(|_| anyhow!("output capture lock poisoned"))?;
        let remaining = limit.saturating_sub(capture.bytes.len());
        let keep = n.min(remaining);
        capture.bytes.extend_from_slice(&chunk[..keep]);
        capture.truncated += n - keep;
    }
    Ok(())
}

fn take_capture(capture: &SharedCapture) -> Result<(Vec<u8>, usize)> {
    let mut capture = capture
        .lock()
        .map_err(|_| anyhow!("output capture lock poisoned"))?;
    let taken = std::mem::take(&mut *capture);
    Ok((taken.bytes, taken.truncated))
}

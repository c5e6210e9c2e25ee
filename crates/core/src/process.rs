//! Blocking subprocess execution with a hard deadline.
//!
//! Every worker invocation goes through [`run_external`]. Output pipes are
//! drained on background threads while the child runs so a chatty worker can
//! never stall on a full pipe. On Unix the child is placed in its own process
//! group and the whole group is killed when the deadline passes, or when
//! helpers keep the output pipes open after the worker itself has exited.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const READER_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.returncode == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exceeded timeout of {}s and was terminated", .timeout.as_secs_f64())]
    TimedOut {
        timeout: Duration,
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

struct PipeReader {
    buffer: SharedBuffer,
    handle: Option<JoinHandle<()>>,
}

impl PipeReader {
    fn spawn_stdout<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let handle = pipe.map(|mut pipe| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => lock_buffer(&buffer).extend_from_slice(&chunk[..n]),
                        Err(e) => {
                            debug!(error = %e, "stdout read error");
                            break;
                        }
                    }
                }
            })
        });
        Self { buffer, handle }
    }

    fn spawn_stderr<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let handle = pipe.map(|pipe| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut reader = BufReader::new(pipe);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let text = String::from_utf8_lossy(&line);
                            let trimmed = text.trim_end();
                            if !trimmed.is_empty() {
                                debug!(target: "worker_stderr", "{}", trimmed);
                            }
                            lock_buffer(&buffer).extend_from_slice(&line);
                        }
                        Err(e) => {
                            debug!(target: "worker_stderr", "read error: {}", e);
                            break;
                        }
                    }
                }
            })
        });
        Self { buffer, handle }
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Joins the reader if it already reached EOF; otherwise leaves it
    /// detached and returns whatever has been captured so far.
    fn snapshot(mut self) -> String {
        if self.is_finished() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
        let bytes = lock_buffer(&self.buffer);
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

fn lock_buffer(buffer: &SharedBuffer) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs `cmd` to completion or until `timeout` elapses.
///
/// A non-zero exit is returned as a normal [`ProcessOutput`]; the caller
/// decides what it means. Only spawn failures, wait failures and deadline
/// expiry are errors.
pub fn run_external(
    cmd: &[OsString],
    timeout: Duration,
    env: &[(String, String)],
) -> Result<ProcessOutput, RunError> {
    let (program, args) = cmd.split_first().ok_or(RunError::EmptyCommand)?;
    let program_display = program.to_string_lossy().into_owned();

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut command);

    debug!(
        program = %program_display,
        args = ?args,
        timeout_secs = timeout.as_secs_f64(),
        "spawning external process"
    );

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        program: program_display.clone(),
        source,
    })?;

    let pid = child.id();
    let stdout_reader = PipeReader::spawn_stdout(child.stdout.take());
    let stderr_reader = PipeReader::spawn_stderr(child.stderr.take());
    let deadline = start + timeout;

    let status: ExitStatus = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                terminate(&mut child);
                return Err(RunError::Wait {
                    program: program_display,
                    source,
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            terminate(&mut child);
            let elapsed_ms = elapsed_millis(start);
            warn!(
                program = %program_display,
                timeout_secs = timeout.as_secs_f64(),
                elapsed_ms,
                "external process timed out; terminated"
            );
            wait_for_readers(&stdout_reader, &stderr_reader, Instant::now() + READER_DRAIN_GRACE);
            return Err(RunError::TimedOut {
                timeout,
                elapsed_ms,
                stdout: stdout_reader.snapshot(),
                stderr: stderr_reader.snapshot(),
            });
        }

        thread::sleep(POLL_INTERVAL.min(deadline - now));
    };

    // Helpers spawned by the worker may still hold the pipes open.
    wait_for_readers(&stdout_reader, &stderr_reader, Instant::now() + READER_DRAIN_GRACE);
    if !(stdout_reader.is_finished() && stderr_reader.is_finished()) {
        debug!(
            program = %program_display,
            "output pipes still open after exit; killing leftover process group"
        );
        kill_process_group(pid);
        wait_for_readers(&stdout_reader, &stderr_reader, Instant::now() + READER_DRAIN_GRACE);
    }

    let output = ProcessOutput {
        returncode: status.code(),
        stdout: stdout_reader.snapshot(),
        stderr: stderr_reader.snapshot(),
        elapsed_ms: elapsed_millis(start),
    };

    debug!(
        program = %program_display,
        returncode = ?output.returncode,
        elapsed_ms = output.elapsed_ms,
        "external process exited"
    );

    Ok(output)
}

fn wait_for_readers(stdout: &PipeReader, stderr: &PipeReader, until: Instant) {
    while !(stdout.is_finished() && stderr.is_finished()) {
        let now = Instant::now();
        if now >= until {
            break;
        }
        thread::sleep(POLL_INTERVAL.min(until - now));
    }
}

fn elapsed_millis(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_command: &mut Command) {}

/// The child leads its own group, so its pid is also the group id.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    if let Ok(pid) = i32::try_from(pid) {
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn terminate(child: &mut std::process::Child) {
    kill_process_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Shell sessions.
//!
//! Each session owns a map of shell sessions keyed by a caller-chosen shell
//! id. A shell session holds at most one live process: `exec` on an id with
//! a still-running process terminates the old process before spawning the
//! new one, so no two processes for the same id ever interleave output.
//!
//! Output streams into a per-exec buffer from background reader tasks;
//! `view` renders the buffer without blocking, `wait` blocks the calling
//! task (bounded by an optional timeout) until the process exits.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, ResourceKind, Result};

/// Grace window between the polite terminate signal and the forceful one.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default cap applied by `view` when the caller gives no explicit limit.
pub const DEFAULT_VIEW_LIMIT: usize = 10_000;

/// Marker appended to output truncated by `view`.
const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Snapshot returned by [`ShellManager::view`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellView {
    /// Buffered output, possibly truncated.
    pub output: String,
    /// Whether a process is currently running.
    pub running: bool,
    /// Working directory of the most recent exec.
    pub working_dir: String,
}

/// Outcome of [`ShellManager::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Process exited; full output and the exit code (None when killed by
    /// signal).
    Completed {
        /// Complete buffered output.
        output: String,
        /// Exit code if the process exited normally.
        exit_code: Option<i32>,
    },
    /// The timeout fired first; partial output so far.
    TimedOut {
        /// Output buffered up to the timeout.
        partial_output: String,
    },
}

/// Outcome of [`ShellManager::kill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// The process was terminated (gracefully or forcefully).
    Terminated,
    /// There was nothing to kill: the process had already exited.
    AlreadyCompleted {
        /// Exit code recorded at completion.
        exit_code: Option<i32>,
    },
}

/// Mutable state of one shell session.
struct ShellState {
    /// True while a process is live.
    running: bool,
    /// Exit code of the last completed process.
    exit_code: Option<i32>,
    /// Working directory of the most recent exec.
    working_dir: String,
    /// OS pid of the live process.
    pid: Option<u32>,
    /// Whether any process was ever spawned on this id.
    started: bool,
    /// Output buffer; replaced wholesale on each exec so stale reader
    /// tasks keep writing into the superseded buffer harmlessly.
    output: Arc<Mutex<String>>,
    /// Completion signal for the current process.
    done_rx: Option<watch::Receiver<bool>>,
    /// Kill request channel to the current supervisor task.
    kill_tx: Option<mpsc::Sender<()>>,
    /// Stdin handle of the live process.
    stdin: Option<ChildStdin>,
}

impl ShellState {
    fn new() -> Self {
        Self {
            running: false,
            exit_code: None,
            working_dir: String::new(),
            pid: None,
            started: false,
            output: Arc::new(Mutex::new(String::new())),
            done_rx: None,
            kill_tx: None,
            stdin: None,
        }
    }
}

/// One shell session (one id within one thread's session).
///
/// State lives behind an `Arc` so the supervisor task can record completion
/// after the spawning call has returned.
struct ShellSession {
    state: Arc<Mutex<ShellState>>,
}

impl ShellSession {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ShellState::new())),
        }
    }
}

/// Send a POSIX signal to a pid, ignoring delivery failures (the process
/// may already be gone).
#[cfg(unix)]
#[allow(unsafe_code)]
fn send_signal(pid: u32, signal: i32) {
    // SAFETY: kill(2) with a pid we spawned; ESRCH and friends are ignored.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Supervise one spawned process: wait for natural exit, or escalate
/// SIGTERM -> grace window -> SIGKILL when a kill request arrives.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    state: Arc<Mutex<ShellState>>,
    output: Arc<Mutex<String>>,
    done_tx: watch::Sender<bool>,
    mut kill_rx: mpsc::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx.recv() => {
            #[cfg(unix)]
            if let Some(pid) = pid {
                send_signal(pid, libc::SIGTERM);
            }
            #[cfg(not(unix))]
            {
                let _ = pid;
                let _ = child.start_kill();
            }
            match tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    // Still alive after the grace window: force it.
                    let _ = child.kill().await;
                    child.wait().await
                }
            }
        }
    };

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("failed to reap shell process: {e}");
            None
        }
    };

    {
        let mut state = state.lock();
        // Only record completion if this supervisor still owns the session
        // (a newer exec may have replaced the buffer and process already).
        if Arc::ptr_eq(&state.output, &output) {
            state.running = false;
            state.exit_code = exit_code;
            state.stdin = None;
        }
    }
    let _ = done_tx.send(true);
}

/// Copy a process output stream into the shared buffer as chunks arrive.
async fn pump_output<R: tokio::io::AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<String>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                buffer.lock().push_str(&text);
            }
        }
    }
}

/// Shell sessions for one thread, keyed by shell id.
///
/// Created lazily by the owning [`super::Session`]; `kill_all` is invoked
/// on session cleanup and tolerates already-dead processes.
pub struct ShellManager {
    thread_id: String,
    shells: DashMap<String, Arc<ShellSession>>,
}

impl ShellManager {
    /// Create an empty manager for the given thread.
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            shells: DashMap::new(),
        }
    }

    fn get(&self, shell_id: &str) -> Result<Arc<ShellSession>> {
        self.shells
            .get(shell_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::not_found(ResourceKind::Shell, shell_id))
    }

    /// Execute a command in the given shell session, creating the session
    /// on first use.
    ///
    /// Any process still running under this shell id is terminated first
    /// (errors ignored), the output buffer is reset, and the new command is
    /// spawned with the given working directory. Returns the OS pid of the
    /// spawned process immediately; it does not wait for completion.
    pub async fn exec(&self, shell_id: &str, dir: &str, command: &str) -> Result<Option<u32>> {
        let session = Arc::clone(
            self.shells
                .entry(shell_id.to_string())
                .or_insert_with(|| Arc::new(ShellSession::new()))
                .value(),
        );

        // Supersede a still-running predecessor before spawning.
        let prior = {
            let state = session.state.lock();
            if state.running {
                state.kill_tx.clone().zip(state.done_rx.clone())
            } else {
                None
            }
        };
        if let Some((kill_tx, mut done_rx)) = prior {
            let _ = kill_tx.send(()).await;
            // Bounded wait: the supervisor escalates to SIGKILL itself.
            let _ = tokio::time::timeout(
                KILL_GRACE_PERIOD + Duration::from_secs(2),
                done_rx.wait_for(|done| *done),
            )
            .await;
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::tool_failure(format!("failed to spawn command: {e}")))?;

        let pid = child.id();
        let output = Arc::new(Mutex::new(String::new()));
        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, Arc::clone(&output)));
        }

        let (done_tx, done_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = mpsc::channel(1);

        {
            let mut state = session.state.lock();
            state.running = true;
            state.started = true;
            state.exit_code = None;
            state.working_dir = dir.to_string();
            state.pid = pid;
            state.output = Arc::clone(&output);
            state.done_rx = Some(done_rx);
            state.kill_tx = Some(kill_tx);
            state.stdin = stdin;
        }

        debug!(
            thread_id = %self.thread_id,
            shell_id,
            pid = pid.unwrap_or(0),
            "spawned shell process"
        );

        tokio::spawn(supervise(
            child,
            pid,
            Arc::clone(&session.state),
            output,
            done_tx,
            kill_rx,
        ));

        Ok(pid)
    }

    /// Current buffered output and running state.
    ///
    /// `max_len: None` applies [`DEFAULT_VIEW_LIMIT`]; truncated output is
    /// suffixed with a marker.
    pub fn view(&self, shell_id: &str, max_len: Option<usize>) -> Result<ShellView> {
        let session = self.get(shell_id)?;
        let state = session.state.lock();
        let full = state.output.lock().clone();
        let limit = max_len.unwrap_or(DEFAULT_VIEW_LIMIT);
        let output = if full.len() > limit {
            let mut boundary = limit;
            while boundary > 0 && !full.is_char_boundary(boundary) {
                boundary -= 1;
            }
            let mut cut = full[..boundary].to_string();
            cut.push_str(TRUNCATION_MARKER);
            cut
        } else {
            full
        };
        Ok(ShellView {
            output,
            running: state.running,
            working_dir: state.working_dir.clone(),
        })
    }

    /// Block until the shell's process exits or `timeout_secs` elapses.
    ///
    /// An already-completed process returns immediately with the stored
    /// exit code; there is no re-wait.
    pub async fn wait(&self, shell_id: &str, timeout_secs: Option<u64>) -> Result<WaitOutcome> {
        let session = self.get(shell_id)?;
        let (done_rx, output) = {
            let state = session.state.lock();
            if !state.started {
                return Err(Error::NotRunning {
                    shell_id: shell_id.to_string(),
                });
            }
            if !state.running {
                return Ok(WaitOutcome::Completed {
                    output: state.output.lock().clone(),
                    exit_code: state.exit_code,
                });
            }
            (state.done_rx.clone(), Arc::clone(&state.output))
        };

        let Some(mut done_rx) = done_rx else {
            return Err(Error::NotRunning {
                shell_id: shell_id.to_string(),
            });
        };

        let wait_future = done_rx.wait_for(|done| *done);
        let completed = match timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait_future)
                .await
                .is_ok(),
            None => {
                let _ = wait_future.await;
                true
            }
        };

        if completed {
            let state = session.state.lock();
            let output = state.output.lock().clone();
            let exit_code = state.exit_code;
            Ok(WaitOutcome::Completed { output, exit_code })
        } else {
            Ok(WaitOutcome::TimedOut {
                partial_output: output.lock().clone(),
            })
        }
    }

    /// Write to the live process's stdin, optionally pressing Enter.
    pub async fn write_stdin(&self, shell_id: &str, text: &str, press_enter: bool) -> Result<()> {
        let session = self.get(shell_id)?;
        // Take the stdin handle out so the lock is not held across writes.
        let mut stdin = {
            let mut state = session.state.lock();
            if !state.running {
                return Err(Error::NotRunning {
                    shell_id: shell_id.to_string(),
                });
            }
            state.stdin.take().ok_or_else(|| Error::NotRunning {
                shell_id: shell_id.to_string(),
            })?
        };

        let payload = if press_enter {
            format!("{text}\n")
        } else {
            text.to_string()
        };
        let write_result = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        // Put the handle back for subsequent writes.
        session.state.lock().stdin = Some(stdin);

        write_result.map_err(|e| Error::tool_failure(format!("failed to write to process: {e}")))
    }

    /// Terminate the shell's live process: graceful signal, bounded grace
    /// window, then forceful kill. Marks the session not-running on return.
    pub async fn kill(&self, shell_id: &str) -> Result<KillOutcome> {
        let session = self.get(shell_id)?;
        let handles = {
            let state = session.state.lock();
            if !state.started {
                return Err(Error::NotRunning {
                    shell_id: shell_id.to_string(),
                });
            }
            if !state.running {
                return Ok(KillOutcome::AlreadyCompleted {
                    exit_code: state.exit_code,
                });
            }
            state.kill_tx.clone().zip(state.done_rx.clone())
        };

        if let Some((kill_tx, mut done_rx)) = handles {
            let _ = kill_tx.send(()).await;
            let _ = tokio::time::timeout(
                KILL_GRACE_PERIOD + Duration::from_secs(2),
                done_rx.wait_for(|done| *done),
            )
            .await;
        }

        let mut state = session.state.lock();
        state.running = false;
        Ok(KillOutcome::Terminated)
    }

    /// Best-effort termination of every running process in this manager.
    ///
    /// Used by session cleanup; errors (including already-dead processes)
    /// are swallowed per shell so one failure does not block the rest.
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.shells.iter().map(|e| e.key().clone()).collect();
        for shell_id in ids {
            match self.kill(&shell_id).await {
                Ok(_) | Err(Error::NotRunning { .. }) | Err(Error::NotFound { .. }) => {}
                Err(e) => warn!(shell_id, "error killing shell during cleanup: {e}"),
            }
        }
    }

    /// Shell ids with a currently running process (diagnostics).
    pub fn running_ids(&self) -> Vec<String> {
        self.shells
            .iter()
            .filter(|entry| entry.value().state.lock().running)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_and_wait_captures_output() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "echo hello").await.unwrap();
        match shells.wait("main", Some(10)).await.unwrap() {
            WaitOutcome::Completed { output, exit_code } => {
                assert!(output.contains("hello"));
                assert_eq!(exit_code, Some(0));
            }
            WaitOutcome::TimedOut { .. } => panic!("echo should finish"),
        }
    }

    #[tokio::test]
    async fn test_exec_supersedes_running_process() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "sleep 30").await.unwrap();
        assert!(shells.view("main", None).unwrap().running);

        // Re-exec on the same id kills the sleeper and runs the new command.
        shells.exec("main", "/tmp", "echo superseded").await.unwrap();
        match shells.wait("main", Some(10)).await.unwrap() {
            WaitOutcome::Completed { output, exit_code } => {
                assert!(output.contains("superseded"));
                assert_eq!(exit_code, Some(0));
            }
            WaitOutcome::TimedOut { .. } => panic!("second command should finish"),
        }
        // Exactly one (now finished) process: nothing is still running.
        assert!(shells.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_exec_resets_output_buffer() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "echo first").await.unwrap();
        shells.wait("main", Some(10)).await.unwrap();
        shells.exec("main", "/tmp", "echo second").await.unwrap();
        match shells.wait("main", Some(10)).await.unwrap() {
            WaitOutcome::Completed { output, .. } => {
                assert!(output.contains("second"));
                assert!(!output.contains("first"), "buffer must reset on exec");
            }
            WaitOutcome::TimedOut { .. } => panic!("echo should finish"),
        }
    }

    #[tokio::test]
    async fn test_wait_on_completed_returns_immediately() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "exit 3").await.unwrap();
        shells.wait("main", Some(10)).await.unwrap();

        // Second wait must not block; timeout 0 still succeeds because the
        // stored result is returned without re-waiting.
        match shells.wait("main", Some(0)).await.unwrap() {
            WaitOutcome::Completed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            WaitOutcome::TimedOut { .. } => panic!("completed wait must not time out"),
        }
    }

    #[tokio::test]
    async fn test_wait_timeout_returns_partial_output() {
        let shells = ShellManager::new("t1");
        shells
            .exec("main", "/tmp", "echo partial; sleep 30")
            .await
            .unwrap();
        match shells.wait("main", Some(1)).await.unwrap() {
            WaitOutcome::TimedOut { partial_output } => {
                assert!(partial_output.contains("partial"));
            }
            WaitOutcome::Completed { .. } => panic!("sleep should outlive the timeout"),
        }
        shells.kill("main").await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_running_process() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "sleep 30").await.unwrap();
        assert_eq!(
            shells.kill("main").await.unwrap(),
            KillOutcome::Terminated
        );
        assert!(!shells.view("main", None).unwrap().running);
    }

    #[tokio::test]
    async fn test_kill_completed_is_not_an_error() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "exit 7").await.unwrap();
        shells.wait("main", Some(10)).await.unwrap();
        match shells.kill("main").await.unwrap() {
            KillOutcome::AlreadyCompleted { exit_code } => assert_eq!(exit_code, Some(7)),
            KillOutcome::Terminated => panic!("nothing should have been live"),
        }
    }

    #[tokio::test]
    async fn test_unknown_shell_id_is_not_found() {
        let shells = ShellManager::new("t1");
        assert!(matches!(
            shells.view("ghost", None).unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            shells.wait("ghost", Some(1)).await.unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            shells.kill("ghost").await.unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_write_stdin_to_interactive_process() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "cat").await.unwrap();
        shells.write_stdin("main", "ping", true).await.unwrap();

        // Give the pipe a moment to round-trip.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(shells.view("main", None).unwrap().output.contains("ping"));
        shells.kill("main").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_stdin_without_process_is_not_running() {
        let shells = ShellManager::new("t1");
        shells.exec("main", "/tmp", "true").await.unwrap();
        shells.wait("main", Some(10)).await.unwrap();
        assert!(matches!(
            shells.write_stdin("main", "x", true).await.unwrap_err(),
            Error::NotRunning { .. }
        ));
    }

    #[tokio::test]
    async fn test_view_truncates_long_output() {
        let shells = ShellManager::new("t1");
        shells
            .exec("main", "/tmp", "printf 'x%.0s' $(seq 1 500)")
            .await
            .unwrap();
        shells.wait("main", Some(10)).await.unwrap();
        let view = shells.view("main", Some(100)).unwrap();
        assert!(view.output.contains("...[output truncated]"));
        assert!(view.output.len() < 500);
    }

    #[tokio::test]
    async fn test_stderr_is_merged_into_output() {
        let shells = ShellManager::new("t1");
        shells
            .exec("main", "/tmp", "echo oops 1>&2")
            .await
            .unwrap();
        match shells.wait("main", Some(10)).await.unwrap() {
            WaitOutcome::Completed { output, .. } => assert!(output.contains("oops")),
            WaitOutcome::TimedOut { .. } => panic!("echo should finish"),
        }
    }

    #[tokio::test]
    async fn test_managers_are_isolated_per_thread() {
        let a = ShellManager::new("thread-a");
        let b = ShellManager::new("thread-b");
        a.exec("main", "/tmp", "echo from-a").await.unwrap();
        b.exec("main", "/tmp", "echo from-b").await.unwrap();

        let (a_out, b_out) = match (
            a.wait("main", Some(10)).await.unwrap(),
            b.wait("main", Some(10)).await.unwrap(),
        ) {
            (
                WaitOutcome::Completed { output: a_out, .. },
                WaitOutcome::Completed { output: b_out, .. },
            ) => (a_out, b_out),
            _ => panic!("both should finish"),
        };
        assert!(a_out.contains("from-a") && !a_out.contains("from-b"));
        assert!(b_out.contains("from-b") && !b_out.contains("from-a"));
    }

    #[tokio::test]
    async fn test_kill_all_tolerates_dead_processes() {
        let shells = ShellManager::new("t1");
        shells.exec("done", "/tmp", "true").await.unwrap();
        shells.wait("done", Some(10)).await.unwrap();
        shells.exec("live", "/tmp", "sleep 30").await.unwrap();

        shells.kill_all().await;
        assert!(shells.running_ids().is_empty());
    }
}

//! A single backend process and its request/response channel.
//!
//! Calls are serialized: the write-one-line / read-one-line exchange holds
//! the connection lock for its whole duration, so two concurrent callers are
//! queued rather than interleaved on the pipe. [`ProcessConnection::terminate`]
//! does not wait behind a hung exchange; it preempts it first.

use crate::catalog::ProcessSpec;
use crate::error::{AppError, Result};
use crate::process::protocol::{Outcome, ResponseEnvelope, ToolCallRequest};
use serde::Serialize;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unstarted,
    Running,
    Stopped,
}

/// Handles to a live child.
struct RunningProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

struct Inner {
    state: ConnectionState,
    process: Option<RunningProcess>,
    /// Set while a request is on the wire. Still set on entry to `call`
    /// means the previous caller was cancelled mid-exchange and the stream
    /// position is unknown.
    dirty: bool,
}

/// Why an exchange failed, and whether the stream can still be trusted.
enum ExchangeError {
    /// Stream broken or out of step. The process must go.
    Fatal(AppError),
    /// Bad line, but framing is intact.
    Recoverable(AppError),
}

/// Counts a pending `terminate` for as long as it is alive, including when
/// the terminate future is dropped before it gets the lock.
struct PendingTermination<'a>(&'a AtomicUsize);

impl<'a> PendingTermination<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingTermination<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ProcessConnection {
    process_name: String,
    command: String,
    args: Vec<String>,
    terminate_grace: Duration,
    next_id: AtomicU64,
    /// Terminations waiting for the lock. Calls refuse to start while
    /// non-zero.
    pending_terminations: AtomicUsize,
    /// Wakes an in-flight exchange so a terminate can take the lock.
    preempt: Notify,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ProcessConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConnection")
            .field("process_name", &self.process_name)
            .field("command", &self.command)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl ProcessConnection {
    pub fn new(
        process_name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        terminate_grace: Duration,
    ) -> Self {
        Self {
            process_name: process_name.into(),
            command: command.into(),
            args,
            terminate_grace,
            next_id: AtomicU64::new(1),
            pending_terminations: AtomicUsize::new(0),
            preempt: Notify::new(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Unstarted,
                process: None,
                dirty: false,
            }),
        }
    }

    pub fn from_spec(spec: &ProcessSpec, terminate_grace: Duration) -> Self {
        Self::new(&spec.name, &spec.command, spec.args.clone(), terminate_grace)
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Current lifecycle state. Waits for any in-flight call to finish.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Start the process if it is not already running.
    pub async fn spawn(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.spawn_locked(&mut inner)
    }

    fn spawn_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.state == ConnectionState::Running {
            return Ok(());
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| AppError::SpawnError {
            process: self.process_name.clone(),
            reason: format!("{} ({})", e, self.command),
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(AppError::SpawnError {
                    process: self.process_name.clone(),
                    reason: "failed to capture stdio".to_string(),
                });
            }
        };

        if let Some(stderr) = child.stderr.take() {
            drain_stderr(self.process_name.clone(), stderr);
        }

        tracing::info!(
            process = %self.process_name,
            command = %self.command,
            pid = ?child.id(),
            "Backend process started"
        );

        inner.process = Some(RunningProcess {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        });
        inner.state = ConnectionState::Running;
        inner.dirty = false;

        Ok(())
    }

    /// Invoke `tool_name` on the backend and return its `result`.
    ///
    /// Spawns the process first if it is not running. Transport failures and
    /// out-of-step responses leave the connection stopped; the next call
    /// starts a fresh process.
    pub async fn call(&self, tool_name: &str, arguments: &Value) -> Result<Value> {
        self.call_inner(tool_name, arguments, None).await
    }

    /// [`ProcessConnection::call`] with a deadline on the exchange itself.
    /// Time spent queued behind other callers does not count. On expiry the
    /// process is stopped, since a half-read response cannot be resumed.
    pub async fn call_with_timeout(
        &self,
        tool_name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.call_inner(tool_name, arguments, Some(timeout)).await
    }

    async fn call_inner(
        &self,
        tool_name: &str,
        arguments: &Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let mut inner = self.inner.lock().await;

        // Registered before the check below so a terminate racing with it
        // is either seen here or wakes the exchange.
        let preempted = self.preempt.notified();
        tokio::pin!(preempted);
        preempted.as_mut().enable();

        if self.pending_terminations.load(Ordering::SeqCst) > 0 {
            return Err(self.transport_error("connection is being terminated"));
        }

        if inner.dirty && inner.state == ConnectionState::Running {
            tracing::warn!(
                process = %self.process_name,
                "Previous call was abandoned mid-exchange, restarting process"
            );
            if let Err(stop_err) = self.stop_locked(&mut inner).await {
                tracing::warn!(process = %self.process_name, error = %stop_err, "Cleanup of abandoned call");
            }
        }

        self.spawn_locked(&mut inner)?;

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = ToolCallRequest::new(request_id, tool_name, arguments)
            .to_line()
            .map_err(|e| AppError::ProtocolError {
                process: self.process_name.clone(),
                reason: format!("failed to serialize request: {e}"),
            })?;

        let start = Instant::now();
        inner.dirty = true;

        let exchanged = match inner.process.as_mut() {
            Some(process) => {
                tokio::select! {
                    result = self.bounded_exchange(process, &line, request_id, deadline) => result,
                    _ = preempted.as_mut() => Err(ExchangeError::Fatal(
                        self.transport_error("terminated while a call was in flight"),
                    )),
                }
            }
            None => Err(ExchangeError::Fatal(self.transport_error("process handle missing"))),
        };

        match exchanged {
            Ok(outcome) => {
                inner.dirty = false;
                tracing::debug!(
                    process = %self.process_name,
                    tool = tool_name,
                    request_id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Backend call completed"
                );
                match outcome {
                    Outcome::Success(value) => Ok(value),
                    Outcome::Failure(message) => Err(AppError::ToolError(message)),
                }
            }
            Err(ExchangeError::Recoverable(err)) => {
                inner.dirty = false;
                Err(err)
            }
            Err(ExchangeError::Fatal(err)) => {
                tracing::warn!(
                    process = %self.process_name,
                    tool = tool_name,
                    request_id,
                    error = %err,
                    "Backend call failed, stopping process"
                );
                if let Err(stop_err) = self.stop_locked(&mut inner).await {
                    tracing::warn!(process = %self.process_name, error = %stop_err, "Cleanup after failed call");
                }
                Err(err)
            }
        }
    }

    async fn bounded_exchange(
        &self,
        process: &mut RunningProcess,
        line: &str,
        request_id: u64,
        deadline: Option<Duration>,
    ) -> std::result::Result<Outcome, ExchangeError> {
        let exchange = self.exchange(process, line, request_id);
        match deadline {
            Some(limit) => tokio::time::timeout(limit, exchange).await.unwrap_or_else(|_| {
                Err(ExchangeError::Fatal(AppError::Timeout {
                    process: self.process_name.clone(),
                    timeout_ms: limit.as_millis() as u64,
                }))
            }),
            None => exchange.await,
        }
    }

    async fn exchange(
        &self,
        process: &mut RunningProcess,
        line: &str,
        request_id: u64,
    ) -> std::result::Result<Outcome, ExchangeError> {
        let stdin = process
            .stdin
            .as_mut()
            .ok_or_else(|| ExchangeError::Fatal(self.transport_error("stdin already closed")))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ExchangeError::Fatal(self.transport_error(format!("failed to write to stdin: {e}"))))?;
        stdin
            .flush()
            .await
            .map_err(|e| ExchangeError::Fatal(self.transport_error(format!("failed to flush stdin: {e}"))))?;

        let mut raw = Vec::new();
        let bytes_read = process
            .stdout
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|e| ExchangeError::Fatal(self.transport_error(format!("failed to read from stdout: {e}"))))?;

        if bytes_read == 0 {
            return Err(ExchangeError::Fatal(
                self.transport_error("stdout closed (process may have exited)"),
            ));
        }
        if raw.last() != Some(&b'\n') {
            return Err(ExchangeError::Fatal(
                self.transport_error("stdout closed mid-line (process may have exited)"),
            ));
        }

        // A complete line that is not text is still a complete line
        let response = String::from_utf8(raw).map_err(|e| {
            ExchangeError::Recoverable(self.protocol_error(format!("response is not valid UTF-8: {e}")))
        })?;

        let envelope = ResponseEnvelope::parse(&response)
            .map_err(|reason| ExchangeError::Recoverable(self.protocol_error(reason)))?;

        if !envelope.id_matches(request_id) {
            return Err(ExchangeError::Fatal(self.protocol_error(format!(
                "response id {} does not match request id {}",
                envelope.id, request_id
            ))));
        }

        Ok(envelope.into_outcome())
    }

    /// Stop the process if running: close stdin, send SIGTERM, wait out the
    /// grace period, then kill. No-op when unstarted or already stopped.
    ///
    /// An in-flight call is interrupted and fails with `TransportError`.
    pub async fn terminate(&self) -> Result<()> {
        let _pending = PendingTermination::new(&self.pending_terminations);
        self.preempt.notify_waiters();

        let mut inner = self.inner.lock().await;
        if inner.process.is_none() {
            return Ok(());
        }
        self.stop_locked(&mut inner).await
    }

    async fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.state = ConnectionState::Stopped;
        inner.dirty = false;

        let Some(mut process) = inner.process.take() else {
            return Ok(());
        };

        // EOF on stdin is the polite way to ask a stdio server to leave
        drop(process.stdin.take());
        send_sigterm(&process.child);

        match tokio::time::timeout(self.terminate_grace, process.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(process = %self.process_name, %status, "Backend process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(self.transport_error(format!("failed to wait for exit: {e}"))),
            Err(_) => {
                tracing::warn!(
                    process = %self.process_name,
                    grace_ms = self.terminate_grace.as_millis() as u64,
                    "Backend process ignored SIGTERM, killing"
                );
                process
                    .child
                    .kill()
                    .await
                    .map_err(|e| self.transport_error(format!("failed to kill: {e}")))
            }
        }
    }

    fn transport_error(&self, reason: impl Into<String>) -> AppError {
        AppError::TransportError {
            process: self.process_name.clone(),
            reason: reason.into(),
        }
    }

    fn protocol_error(&self, reason: impl Into<String>) -> AppError {
        AppError::ProtocolError {
            process: self.process_name.clone(),
            reason: reason.into(),
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

/// Forward child stderr to the log until EOF. Stderr is arbitrary bytes;
/// lines are logged lossily and reading never stops early, since a closed
/// read end would kill the child on its next write.
fn drain_stderr(process_name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::debug!(process = %process_name, stderr = %line.trim_end(), "Backend stderr");
                }
                Err(e) => {
                    tracing::warn!(process = %process_name, error = %e, "Reading backend stderr failed");
                    break;
                }
            }
        }
    });
}

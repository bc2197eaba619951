//! Interactive code-execution kernels.
//!
//! # Components
//!
//! - [`KernelManager`]: registry of live interpreter sessions, cheap to
//!   clone and share.
//! - `KernelHandle`: one interpreter subprocess with its stdin writer
//!   and stdout reader. The reader mutex doubles as the per-kernel
//!   execution lock, so concurrent calls against one kernel queue
//!   instead of interleaving marker streams.
//! - `protocol`: the marker framing and the python wrapper scripts.
//!
//! # Execution Flow
//!
//! 1. `create_kernel` spawns `python3 -u -i`, writes the init script,
//!    and waits for the ready sentinel before registering the session.
//! 2. `execute_code` wraps the code with per-call markers, writes it to
//!    stdin, and streams stdout lines through the parser until the end
//!    marker, emitting a `KernelEvent::Output` per captured line.
//! 3. A monitor task reaps the subprocess and clears the registration
//!    whenever the interpreter dies on its own.

mod protocol;
mod session;

pub use protocol::KernelError;
pub use session::{KernelSession, KernelStatus};

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::{AgentError, Result};
use crate::events::{EventBus, KernelEvent};
use crate::process;
use crate::store::Store;

use protocol::MarkerSet;

/// One code-execution request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    /// Target kernel; a fresh python kernel is created when `None`.
    pub kernel_id: Option<Uuid>,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Ok,
    Error,
}

/// Outcome of one execution round trip.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult {
    pub kernel_id: Uuid,
    pub status: ExecuteStatus,
    pub outputs: Vec<String>,
    pub error: Option<KernelError>,
    pub duration_ms: u64,
    pub execution_count: u64,
}

/// Live interpreter subprocess plus its bookkeeping.
#[derive(Debug)]
struct KernelHandle {
    id: Uuid,
    pid: u32,
    session: Mutex<KernelSession>,
    stdin: Mutex<ChildStdin>,
    /// Held for a whole execution round trip; this is what serializes
    /// concurrent `execute_code` calls against one kernel.
    reader: Mutex<Lines<BufReader<ChildStdout>>>,
}

impl KernelHandle {
    async fn snapshot(&self) -> KernelSession {
        self.session.lock().await.clone()
    }

    /// Status update that never resurrects a terminated session.
    async fn set_status(&self, status: KernelStatus) {
        let mut session = self.session.lock().await;
        if session.status == KernelStatus::Terminated {
            return;
        }
        session.status = status;
        session.last_activity = Utc::now();
    }

    async fn mark_terminated(&self) {
        let mut session = self.session.lock().await;
        session.status = KernelStatus::Terminated;
        session.last_activity = Utc::now();
    }
}

#[derive(Debug)]
struct ManagerInner {
    config: KernelConfig,
    events: EventBus,
    kernels: Mutex<Store<Arc<KernelHandle>>>,
}

/// Registry and lifecycle owner for interpreter sessions.
#[derive(Debug, Clone)]
pub struct KernelManager {
    inner: Arc<ManagerInner>,
}

impl KernelManager {
    pub fn new(config: KernelConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                events,
                kernels: Mutex::new(Store::new()),
            }),
        }
    }

    /// Spawns a persistent interpreter and waits for its ready sentinel.
    /// Nothing is registered until the sentinel arrives.
    pub async fn create_kernel(&self, language: &str) -> Result<KernelSession> {
        if !matches!(language, "python" | "python3") {
            return Err(AgentError::Validation(format!(
                "Unsupported kernel language: {language}"
            )));
        }
        let config = &self.inner.config;
        tracing::debug!(python_bin = %config.python_bin, "Starting kernel interpreter");
        let mut child = Command::new(&config.python_bin)
            .arg("-u")
            .arg("-i")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AgentError::ProcessSpawn(format!("{}: {err}", config.python_bin)))?;

        let pid = child.id().unwrap_or(0);
        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(AgentError::ProcessSpawn(
                "Interpreter pipes missing".to_string(),
            ));
        };

        let mut session = KernelSession::new("python", pid);
        let kernel_id = session.id;

        // The monitor task owns the child from here: it reaps the exit
        // and clears the registration if the interpreter dies.
        let manager = self.clone();
        tokio::spawn(async move { manager.monitor(kernel_id, child).await });

        // Interpreter banners and prompts arrive on stderr; keep it
        // drained so the pipe never fills.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(kernel_id = %kernel_id, line = %line, "Kernel stderr");
            }
        });

        let sentinel = protocol::ready_sentinel();
        let init = protocol::python_init(&sentinel);
        if let Err(err) = stdin.write_all(init.as_bytes()).await {
            process::deliver(pid, Signal::SIGKILL);
            return Err(AgentError::ProcessSpawn(format!(
                "Interpreter rejected init script: {err}"
            )));
        }

        let mut reader = BufReader::new(stdout).lines();
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(config.ready_timeout_ms);
        loop {
            let line = match tokio::time::timeout_at(deadline, reader.next_line()).await {
                Err(_) => {
                    process::deliver(pid, Signal::SIGKILL);
                    return Err(AgentError::Timeout(format!(
                        "Kernel did not become ready within {}ms",
                        config.ready_timeout_ms
                    )));
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) | Ok(Err(_)) => {
                    process::deliver(pid, Signal::SIGKILL);
                    return Err(AgentError::ProcessSpawn(
                        "Interpreter exited during startup".to_string(),
                    ));
                }
            };
            if line.contains(&sentinel) {
                break;
            }
            tracing::trace!(kernel_id = %kernel_id, line = %line, "Kernel startup output");
        }

        session.status = KernelStatus::Idle;
        session.last_activity = Utc::now();
        let snapshot = session.clone();
        let handle = Arc::new(KernelHandle {
            id: kernel_id,
            pid,
            session: Mutex::new(session),
            stdin: Mutex::new(stdin),
            reader: Mutex::new(reader),
        });
        self.inner.kernels.lock().await.insert(kernel_id, handle);

        tracing::info!(kernel_id = %kernel_id, pid, "Kernel ready");
        self.inner.events.emit_kernel(KernelEvent::Created {
            kernel_id,
            language: "python".to_string(),
        });
        Ok(snapshot)
    }

    /// Runs `code` in the target kernel, streaming output events as
    /// lines arrive. Creates a kernel when the request names none.
    pub async fn execute_code(&self, request: ExecuteRequest) -> Result<ExecuteResult> {
        if request.code.trim().is_empty() {
            return Err(AgentError::Validation("Code must not be empty".to_string()));
        }
        let kernel_id = match request.kernel_id {
            Some(id) => id,
            None => self.create_kernel("python").await?.id,
        };
        let handle = self
            .handle_for(&kernel_id)
            .await
            .ok_or_else(|| AgentError::NotFound(format!("Kernel {kernel_id} not found")))?;
        self.execute_on(&handle, &request.code).await
    }

    async fn execute_on(&self, handle: &Arc<KernelHandle>, code: &str) -> Result<ExecuteResult> {
        let kernel_id = handle.id;
        let mut reader = handle.reader.lock().await;

        {
            let mut session = handle.session.lock().await;
            if session.status == KernelStatus::Terminated {
                return Err(AgentError::Execution(format!(
                    "Kernel {kernel_id} has terminated"
                )));
            }
            session.status = KernelStatus::Busy;
            session.last_activity = Utc::now();
        }

        let markers = MarkerSet::generate();
        let wrapper = protocol::wrap_code(code, &markers);
        let started = Instant::now();
        {
            let mut stdin = handle.stdin.lock().await;
            if let Err(err) = stdin.write_all(wrapper.as_bytes()).await {
                handle.set_status(KernelStatus::Idle).await;
                return Err(AgentError::Execution(format!(
                    "Failed to reach kernel {kernel_id}: {err}"
                )));
            }
        }

        let mut parser = protocol::ExecutionParser::new(markers);
        let mut outputs = Vec::new();
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.inner.config.execute_timeout_ms);

        while !parser.is_finished() {
            let line = match tokio::time::timeout_at(deadline, reader.next_line()).await {
                Err(_) => {
                    // The stream stays owned by the next call's parser,
                    // which discards everything before its own markers.
                    handle.set_status(KernelStatus::Idle).await;
                    tracing::warn!(kernel_id = %kernel_id, "Execution timed out");
                    return Err(AgentError::Timeout(format!(
                        "Execution exceeded {}ms",
                        self.inner.config.execute_timeout_ms
                    )));
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) | Ok(Err(_)) => {
                    drop(reader);
                    if let Some(handle) = self.remove_handle(&kernel_id).await {
                        handle.mark_terminated().await;
                        self.inner
                            .events
                            .emit_kernel(KernelEvent::Terminated { kernel_id });
                    }
                    return Err(AgentError::Execution(format!(
                        "Kernel {kernel_id} died mid-execution"
                    )));
                }
            };
            if let Some(chunk) = parser.feed(&line) {
                outputs.push(chunk.clone());
                self.inner
                    .events
                    .emit_kernel(KernelEvent::Output { kernel_id, chunk });
            }
        }
        drop(reader);

        let error = parser.into_error();
        let duration_ms = started.elapsed().as_millis() as u64;
        let execution_count = {
            let mut session = handle.session.lock().await;
            session.execution_count += 1;
            session.last_activity = Utc::now();
            if session.status != KernelStatus::Terminated {
                session.status = KernelStatus::Idle;
            }
            session.execution_count
        };

        let status = match &error {
            Some(err) => {
                tracing::info!(kernel_id = %kernel_id, error = %err.name, duration_ms, "Execution raised");
                self.inner.events.emit_kernel(KernelEvent::ExecutionFailed {
                    kernel_id,
                    error: err.name.clone(),
                });
                ExecuteStatus::Error
            }
            None => {
                tracing::info!(kernel_id = %kernel_id, duration_ms, "Execution finished");
                self.inner.events.emit_kernel(KernelEvent::Executed {
                    kernel_id,
                    execution_count,
                });
                ExecuteStatus::Ok
            }
        };

        Ok(ExecuteResult {
            kernel_id,
            status,
            outputs,
            error,
            duration_ms,
            execution_count,
        })
    }

    /// Sends SIGINT to the interpreter. The process survives; whatever
    /// was running surfaces as a KeyboardInterrupt on its own round
    /// trip.
    pub async fn interrupt_kernel(&self, kernel_id: &Uuid) -> Result<()> {
        let handle = self
            .handle_for(kernel_id)
            .await
            .ok_or_else(|| AgentError::NotFound(format!("Kernel {kernel_id} not found")))?;
        tracing::info!(kernel_id = %kernel_id, pid = handle.pid, "Interrupting kernel");
        process::deliver(handle.pid, Signal::SIGINT);
        handle.set_status(KernelStatus::Idle).await;
        Ok(())
    }

    /// Asks the interpreter to quit, escalating to SIGKILL after the
    /// grace period. The registration is removed on every path.
    pub async fn shutdown_kernel(&self, kernel_id: &Uuid) -> Result<()> {
        let handle = self
            .remove_handle(kernel_id)
            .await
            .ok_or_else(|| AgentError::NotFound(format!("Kernel {kernel_id} not found")))?;
        handle.mark_terminated().await;

        {
            let mut stdin = handle.stdin.lock().await;
            let _ = stdin.write_all(protocol::QUIT_COMMAND.as_bytes()).await;
        }
        let grace = Duration::from_millis(self.inner.config.shutdown_grace_ms);
        if !process::wait_for_exit(handle.pid, grace, Duration::from_millis(100)).await {
            tracing::warn!(kernel_id = %kernel_id, pid = handle.pid, "Kernel ignored quit, sending SIGKILL");
            process::deliver(handle.pid, Signal::SIGKILL);
        }
        tracing::info!(kernel_id = %kernel_id, "Kernel shut down");
        self.inner.events.emit_kernel(KernelEvent::Terminated {
            kernel_id: *kernel_id,
        });
        Ok(())
    }

    /// Shuts down every kernel; used on agent stop.
    pub async fn shutdown_all(&self) {
        let ids: Vec<Uuid> = {
            let kernels = self.inner.kernels.lock().await;
            kernels.iter().map(|(id, _)| id).collect()
        };
        for id in ids {
            if let Err(err) = self.shutdown_kernel(&id).await {
                tracing::warn!(kernel_id = %id, error = %err, "Kernel shutdown failed");
            }
        }
    }

    pub async fn get_kernel(&self, kernel_id: &Uuid) -> Option<KernelSession> {
        let handle = self.handle_for(kernel_id).await?;
        Some(handle.snapshot().await)
    }

    /// Session snapshots, oldest first.
    pub async fn list_kernels(&self) -> Vec<KernelSession> {
        let handles: Vec<Arc<KernelHandle>> = {
            let kernels = self.inner.kernels.lock().await;
            kernels.values().cloned().collect()
        };
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.snapshot().await);
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn kernel_count(&self) -> usize {
        self.inner.kernels.lock().await.len()
    }

    async fn handle_for(&self, kernel_id: &Uuid) -> Option<Arc<KernelHandle>> {
        self.inner.kernels.lock().await.get_by_id(kernel_id).cloned()
    }

    async fn remove_handle(&self, kernel_id: &Uuid) -> Option<Arc<KernelHandle>> {
        self.inner.kernels.lock().await.remove_by_id(kernel_id)
    }

    async fn monitor(&self, kernel_id: Uuid, mut child: Child) {
        let status = child.wait().await;
        match &status {
            Ok(status) => {
                tracing::info!(kernel_id = %kernel_id, ?status, "Kernel process exited")
            }
            Err(err) => {
                tracing::warn!(kernel_id = %kernel_id, error = %err, "Failed to reap kernel process")
            }
        }
        if let Some(handle) = self.remove_handle(&kernel_id).await {
            handle.mark_terminated().await;
            self.inner
                .events
                .emit_kernel(KernelEvent::Terminated { kernel_id });
        }
    }
}

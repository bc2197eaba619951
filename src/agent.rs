//! Agent composition root.
//!
//! [`AgentCore`] wires the executor, the kernel manager, and the
//! gateway link together and owns the process-level concerns: the
//! locked PID file singleton, the idle-timeout watchdog, and the
//! ordered stop path.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventBus};
use crate::executor::{JobExecutor, RunningJob};
use crate::gateway::{
    local_hostname, AgentConfigPayload, Capabilities, GatewayConnector, GatewayState,
    RegisterRequest,
};
use crate::kernel::KernelManager;

/// Advisory-locked PID file enforcing the per-host singleton.
///
/// Acquiring the lock and writing the PID is one step, not
/// check-then-act: a lock held elsewhere means another live agent, and
/// a stale file whose lock is free is silently reclaimed.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl PidFile {
    /// Locks `path` and writes our PID into it. Fails with
    /// `AlreadyRunning` when another live process holds the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, _)) => {
                return Err(AgentError::AlreadyRunning(format!(
                    "PID file {} is locked by another agent",
                    path.display()
                )));
            }
        };
        lock.set_len(0)?;
        let mut writer: &File = &lock;
        writeln!(writer, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: Some(lock),
        })
    }

    /// Removes the file and drops the lock. Idempotent.
    pub fn release(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        // Unlink before unlocking; a rival acquire then only ever locks
        // a freshly created file, never one about to disappear.
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "Failed to remove PID file");
            }
        }
        drop(lock);
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// PID of the agent holding `path`, when one is alive. Probes the lock
/// instead of trusting the file contents.
pub fn running_agent_pid(path: &Path) -> Option<u32> {
    let file = OpenOptions::new().read(true).open(path).ok()?;
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        // Lock free: whatever wrote the file is gone.
        Ok(_) => None,
        Err((file, _)) => {
            let mut contents = String::new();
            let mut reader = &file;
            reader.read_to_string(&mut contents).ok()?;
            contents.trim().parse().ok()
        }
    }
}

/// Snapshot returned by [`AgentCore::status`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub pid: u32,
    pub uptime_ms: u64,
    pub gateway: GatewayState,
    pub agent_id: Option<String>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub total_compute_ms: u64,
    pub queued_jobs: usize,
    pub running: Option<RunningJob>,
    pub kernels: usize,
}

#[derive(Debug)]
struct AgentInner {
    config: AgentConfig,
    events: EventBus,
    executor: JobExecutor,
    kernels: KernelManager,
    gateway: GatewayConnector,
    shutdown: CancellationToken,
    started: Instant,
    stopped: AtomicBool,
    pid_file: Mutex<Option<PidFile>>,
    idle_task: Mutex<Option<JoinHandle<()>>>,
}

/// The running agent. Cheap to clone; all clones share one agent.
#[derive(Debug, Clone)]
pub struct AgentCore {
    inner: Arc<AgentInner>,
}

impl AgentCore {
    /// Brings the agent up: singleton lock, subsystems, gateway link,
    /// idle watchdog. Gateway failures are tolerated; the agent then
    /// runs standalone.
    pub async fn start(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let pid_file = PidFile::acquire(&config.pid_file)?;

        let events = EventBus::new();
        let executor = JobExecutor::spawn(config.executor.clone(), events.clone());
        let kernels = KernelManager::new(config.kernel.clone(), events.clone());

        let capabilities = Capabilities::detect();
        tracing::info!(
            cpu_cores = capabilities.cpu_cores,
            ram_total = capabilities.ram_total,
            "Probed local capabilities"
        );
        let register_request = RegisterRequest {
            agent_type: "compute".to_string(),
            name: config.name.clone(),
            hostname: local_hostname(),
            capabilities,
            config: AgentConfigPayload {
                max_memory_percent: config.max_memory_percent,
                allow_remote_jobs: config.allow_remote_jobs,
                idle_timeout_minutes: config.idle_timeout_ms / 60_000,
            },
        };
        let gateway = GatewayConnector::new(
            config.gateway.clone(),
            register_request,
            executor.clone(),
            events.clone(),
        )?;

        let core = Self {
            inner: Arc::new(AgentInner {
                events,
                executor,
                kernels,
                gateway,
                shutdown: CancellationToken::new(),
                started: Instant::now(),
                stopped: AtomicBool::new(false),
                pid_file: Mutex::new(Some(pid_file)),
                idle_task: Mutex::new(None),
                config,
            }),
        };

        if core.inner.config.gateway.enabled {
            if let Err(err) = core.inner.gateway.connect().await {
                tracing::warn!(error = %err, "Gateway unavailable, running standalone");
            }
        } else {
            tracing::info!("Gateway link disabled, running standalone");
        }

        core.arm_idle_timer().await;
        tracing::info!(name = %core.inner.config.name, pid = std::process::id(), "Agent started");
        Ok(core)
    }

    /// Starts the idle watchdog. Zero timeout disables it. Job activity
    /// pushes the deadline out; expiring with nothing queued or running
    /// stops the agent through the regular stop path.
    async fn arm_idle_timer(&self) {
        let timeout_ms = self.inner.config.idle_timeout_ms;
        if timeout_ms == 0 {
            return;
        }
        let timeout = Duration::from_millis(timeout_ms);
        let core = self.clone();
        let mut events = self.inner.events.subscribe();
        let task = tokio::spawn(async move {
            let mut deadline = tokio::time::Instant::now() + timeout;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let stats = core.inner.executor.stats().await;
                        if stats.queued == 0 && stats.running.is_none() {
                            tracing::info!(idle_ms = timeout_ms, "Idle timeout reached, stopping agent");
                            // stop() aborts this task, so it runs on its
                            // own task.
                            let stopper = core.clone();
                            tokio::spawn(async move { stopper.stop().await });
                            break;
                        }
                        deadline = tokio::time::Instant::now() + timeout;
                    }
                    event = events.recv() => match event {
                        Ok(AgentEvent::Job(_)) | Err(RecvError::Lagged(_)) => {
                            deadline = tokio::time::Instant::now() + timeout;
                        }
                        Ok(_) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        *self.inner.idle_task.lock().await = Some(task);
    }

    /// Stops everything in order: the queued backlog, the in-flight
    /// job, the kernels, the gateway link, the PID file. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping agent");

        if let Some(task) = self.inner.idle_task.lock().await.take() {
            task.abort();
        }

        // The backlog goes first; nothing may take the run slot once
        // the in-flight job settles.
        self.inner.executor.drain().await;
        let stats = self.inner.executor.stats().await;
        if let Some(running) = stats.running {
            tracing::info!(job_id = %running.id, "Cancelling in-flight job");
            if self.inner.executor.cancel_job(running.id).await {
                self.wait_for_job_exit(running.id).await;
            }
        }

        self.inner.kernels.shutdown_all().await;
        self.inner.gateway.disconnect().await;

        if let Some(mut pid_file) = self.inner.pid_file.lock().await.take() {
            pid_file.release();
        }

        self.inner.shutdown.cancel();
        tracing::info!("Agent stopped");
    }

    /// Polls until the cancelled job settles, bounded by the cancel
    /// grace plus a margin.
    async fn wait_for_job_exit(&self, job_id: Uuid) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.inner.config.executor.cancel_grace_ms + 1_000);
        while tokio::time::Instant::now() < deadline {
            match self.inner.executor.get_job(job_id).await {
                Some(job) if job.status.is_terminal() => return,
                None => return,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        tracing::warn!(job_id = %job_id, "Job did not settle before shutdown");
    }

    pub async fn status(&self) -> AgentStatus {
        let stats = self.inner.executor.stats().await;
        AgentStatus {
            name: self.inner.config.name.clone(),
            pid: std::process::id(),
            uptime_ms: self.inner.started.elapsed().as_millis() as u64,
            gateway: self.inner.gateway.state().await,
            agent_id: self.inner.gateway.agent_id().await,
            jobs_completed: stats.jobs_completed,
            jobs_failed: stats.jobs_failed,
            total_compute_ms: stats.total_compute_ms,
            queued_jobs: stats.queued,
            running: stats.running,
            kernels: self.inner.kernels.kernel_count().await,
        }
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.inner.executor
    }

    pub fn kernels(&self) -> &KernelManager {
        &self.inner.kernels
    }

    pub fn gateway(&self) -> &GatewayConnector {
        &self.inner.gateway
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    /// Cancelled once `stop()` has run to completion.
    pub fn stopped(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        let mut pid_file = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        // Our own exclusive lock reads as a live agent from a second
        // file description.
        assert_eq!(running_agent_pid(&path), Some(std::process::id()));

        pid_file.release();
        assert!(!path.exists());
        assert_eq!(running_agent_pid(&path), None);
    }

    #[test]
    fn second_acquire_fails_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        let _held = PidFile::acquire(&path).unwrap();
        assert!(matches!(
            PidFile::acquire(&path),
            Err(AgentError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn stale_unlocked_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");
        std::fs::write(&path, "99999\n").unwrap();

        assert_eq!(running_agent_pid(&path), None);
        let _reclaimed = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    /// A release racing a fresh acquire must never unlink the winner's
    /// file: the unlink has to happen while the lock is still held.
    #[test]
    fn release_unlinks_before_unlocking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        for _ in 0..50 {
            let mut first = PidFile::acquire(&path).unwrap();
            let contender = std::thread::spawn({
                let path = path.clone();
                move || loop {
                    match PidFile::acquire(&path) {
                        Ok(lock) => return lock,
                        Err(_) => std::thread::yield_now(),
                    }
                }
            });
            first.release();

            let second = contender.join().unwrap();
            assert!(path.exists());
            drop(second);
        }
    }
}

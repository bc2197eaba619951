//! Job execution.
//!
//! # Components
//!
//! - [`JobExecutor`]: cloneable handle that forwards operations to the
//!   worker over an mpsc command channel.
//! - `ExecutorWorker`: single task owning all job state. It selects
//!   between commands and runner updates, so at most one job runs and
//!   no lock is held across a spawn.
//! - `runner`: builds and supervises the child process for one job.
//! - `queue`: priority order for whatever is waiting.
//!
//! # Execution Flow
//!
//! 1. `submit` validates the spec, stores the job as `queued`, and
//!    pushes it onto the queue.
//! 2. When nothing is running, the worker pops the best entry, spawns
//!    its process, and marks the job `running`. Spawn failures mark the
//!    job `failed` and the next entry is tried.
//! 3. A supervisor task streams output lines back as they appear; each
//!    becomes a log entry and a `JobEvent::Log`.
//! 4. On exit the job settles to `completed`, `failed`, or `cancelled`,
//!    the aggregate counters update, and the queue resumes.
//! 5. `drain` cancels the backlog and retires the queue for shutdown;
//!    settling the in-flight job stays with the caller's cancel.

mod job;
mod queue;
mod runner;

pub use job::{Job, JobSpec, JobStatus};

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::{AgentError, Result};
use crate::events::{EventBus, JobEvent};
use crate::process;
use crate::store::{SlotId, Store};

use queue::PendingQueue;
use runner::RunnerUpdate;

/// Aggregate executor counters, reported to the gateway and the CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Wall-clock milliseconds accumulated by jobs that started and
    /// reached a terminal state.
    pub total_compute_ms: u64,
    pub queued: usize,
    pub running: Option<RunningJob>,
}

/// Identity of the job currently holding the run slot.
#[derive(Debug, Clone, Serialize)]
pub struct RunningJob {
    pub id: Uuid,
    pub name: String,
}

enum ExecutorCommand {
    Submit {
        spec: JobSpec,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    Cancel {
        job_id: Uuid,
        response_tx: oneshot::Sender<bool>,
    },
    Get {
        job_id: Uuid,
        response_tx: oneshot::Sender<Option<Job>>,
    },
    List {
        status: Option<JobStatus>,
        limit: Option<usize>,
        response_tx: oneshot::Sender<Vec<Job>>,
    },
    Logs {
        job_id: Uuid,
        tail: Option<usize>,
        response_tx: oneshot::Sender<Option<Vec<String>>>,
    },
    Stats {
        response_tx: oneshot::Sender<ExecutorStats>,
    },
    Drain {
        response_tx: oneshot::Sender<()>,
    },
}

/// Handle to the executor worker task. Cloneable; every clone talks to
/// the same worker.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    command_tx: mpsc::Sender<ExecutorCommand>,
}

impl JobExecutor {
    /// Starts the worker task and returns a handle to it.
    pub fn spawn(config: ExecutorConfig, events: EventBus) -> Self {
        let (command_tx, command_rx) = mpsc::channel(100);
        let worker = ExecutorWorker::new(config, events);
        tokio::spawn(worker.run(command_rx));
        Self { command_tx }
    }

    /// Queues a job. The returned snapshot is the job as submitted,
    /// `queued` and unstarted.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ExecutorCommand::Submit { spec, response_tx })
            .await
            .map_err(|_| AgentError::Execution("Executor is not running".to_string()))?;
        response_rx
            .await
            .map_err(|_| AgentError::Execution("Executor dropped the request".to_string()))?
    }

    /// Cancels a queued or running job. `false` when the id is unknown
    /// or the job is already terminal. Never errors.
    pub async fn cancel_job(&self, job_id: Uuid) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ExecutorCommand::Cancel {
                job_id,
                response_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Option<Job> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ExecutorCommand::Get {
                job_id,
                response_tx,
            })
            .await
            .ok()?;
        response_rx.await.ok().flatten()
    }

    /// Jobs newest-submitted-first, optionally filtered and limited.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ExecutorCommand::List {
                status,
                limit,
                response_tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response_rx.await.unwrap_or_default()
    }

    /// Captured log lines, or the last `tail` of them. `None` for an
    /// unknown job.
    pub async fn get_job_logs(&self, job_id: Uuid, tail: Option<usize>) -> Option<Vec<String>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(ExecutorCommand::Logs {
                job_id,
                tail,
                response_tx,
            })
            .await
            .ok()?;
        response_rx.await.ok().flatten()
    }

    pub async fn stats(&self) -> ExecutorStats {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ExecutorCommand::Stats { response_tx })
            .await
            .is_err()
        {
            return ExecutorStats::default();
        }
        response_rx.await.unwrap_or_default()
    }

    /// Cancels every queued job and refuses further submissions. The
    /// in-flight job, if any, keeps its slot until cancelled or done;
    /// nothing replaces it afterwards. Returns once the queue is empty.
    pub async fn drain(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ExecutorCommand::Drain { response_tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = response_rx.await;
    }
}

/// The job currently holding the run slot.
struct CurrentJob {
    job_id: Uuid,
    name: String,
    pid: u32,
    started: Instant,
    cancel_requested: bool,
    slot: SlotId,
}

struct ExecutorWorker {
    config: ExecutorConfig,
    events: EventBus,
    jobs: Store<Job>,
    queue: PendingQueue,
    current: Option<CurrentJob>,
    /// Set once by `drain`; the queue never starts another job after.
    draining: bool,
    jobs_completed: u64,
    jobs_failed: u64,
    total_compute_ms: u64,
}

impl ExecutorWorker {
    fn new(config: ExecutorConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            jobs: Store::new(),
            queue: PendingQueue::new(),
            current: None,
            draining: false,
            jobs_completed: 0,
            jobs_failed: 0,
            total_compute_ms: 0,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<ExecutorCommand>) {
        // Supervisor tasks report lines and exits back over this channel.
        let (updates_tx, mut updates_rx) = mpsc::channel(256);
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command, &updates_tx),
                    None => break,
                },
                Some(update) = updates_rx.recv() => self.handle_update(update, &updates_tx),
            }
        }
        tracing::debug!("Executor worker stopped");
    }

    fn handle_command(
        &mut self,
        command: ExecutorCommand,
        updates_tx: &mpsc::Sender<RunnerUpdate>,
    ) {
        match command {
            ExecutorCommand::Submit { spec, response_tx } => {
                let _ = response_tx.send(self.submit(spec, updates_tx));
            }
            ExecutorCommand::Cancel {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.cancel(job_id));
            }
            ExecutorCommand::Get {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.jobs.get_by_id(&job_id).cloned());
            }
            ExecutorCommand::List {
                status,
                limit,
                response_tx,
            } => {
                let _ = response_tx.send(self.list(status, limit));
            }
            ExecutorCommand::Logs {
                job_id,
                tail,
                response_tx,
            } => {
                let _ =
                    response_tx.send(self.jobs.get_by_id(&job_id).map(|job| job.tail_logs(tail)));
            }
            ExecutorCommand::Stats { response_tx } => {
                let _ = response_tx.send(self.stats());
            }
            ExecutorCommand::Drain { response_tx } => {
                self.drain();
                let _ = response_tx.send(());
            }
        }
    }

    fn handle_update(&mut self, update: RunnerUpdate, updates_tx: &mpsc::Sender<RunnerUpdate>) {
        match update {
            RunnerUpdate::Line { job_id, line } => {
                if let Some(job) = self.jobs.get_by_id_mut(&job_id) {
                    job.logs.push(line.clone());
                }
                self.events.emit_job(JobEvent::Log { job_id, line });
            }
            RunnerUpdate::Exited { job_id, exit_code } => {
                self.finish_job(job_id, exit_code);
                self.process_queue(updates_tx);
            }
        }
    }

    fn submit(
        &mut self,
        spec: JobSpec,
        updates_tx: &mpsc::Sender<RunnerUpdate>,
    ) -> Result<Job> {
        spec.validate()?;
        if self.draining {
            return Err(AgentError::Execution(
                "Executor is shutting down".to_string(),
            ));
        }
        if self.jobs.len() >= self.config.max_jobs {
            return Err(AgentError::Validation(format!(
                "Job table is full ({} jobs)",
                self.config.max_jobs
            )));
        }
        let job = Job::new(spec);
        let job_id = job.id;
        let priority = job.priority;
        tracing::info!(job_id = %job_id, name = %job.name, priority, "Job submitted");
        let snapshot = job.clone();
        self.jobs.insert(job_id, job);
        self.queue.push(job_id, priority);
        self.process_queue(updates_tx);
        Ok(snapshot)
    }

    /// Starts queued jobs until one spawns or the queue drains.
    fn process_queue(&mut self, updates_tx: &mpsc::Sender<RunnerUpdate>) {
        if self.draining {
            return;
        }
        while self.current.is_none() {
            let Some(job_id) = self.queue.pop() else {
                return;
            };
            let Some(handle) = self.jobs.handle(&job_id) else {
                continue;
            };
            let (mut cmd, name) = {
                let Some(job) = self.jobs.get(handle) else {
                    continue;
                };
                match runner::build_command(job) {
                    Ok(cmd) => (cmd, job.name.clone()),
                    Err(err) => {
                        self.fail_unspawned(handle, job_id, err.to_string());
                        continue;
                    }
                }
            };
            match cmd.spawn() {
                Ok(child) => {
                    let pid = child.id().unwrap_or(0);
                    if let Some(job) = self.jobs.get_mut(handle) {
                        job.status = JobStatus::Running;
                        job.started_at = Some(Utc::now());
                    }
                    self.current = Some(CurrentJob {
                        job_id,
                        name,
                        pid,
                        started: Instant::now(),
                        cancel_requested: false,
                        slot: handle,
                    });
                    tracing::info!(job_id = %job_id, pid, "Job started");
                    self.events.emit_job(JobEvent::Started { job_id });
                    tokio::spawn(runner::supervise(job_id, child, updates_tx.clone()));
                }
                Err(err) => {
                    self.fail_unspawned(
                        handle,
                        job_id,
                        format!("Failed to spawn process: {err}"),
                    );
                }
            }
        }
    }

    /// Marks a job failed before any process existed.
    fn fail_unspawned(&mut self, handle: SlotId, job_id: Uuid, message: String) {
        if let Some(job) = self.jobs.get_mut(handle) {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(message.clone());
        }
        self.jobs_failed += 1;
        tracing::warn!(job_id = %job_id, error = %message, "Job failed to start");
        self.events.emit_job(JobEvent::Failed {
            job_id,
            error: message,
        });
    }

    fn cancel(&mut self, job_id: Uuid) -> bool {
        if let Some(current) = &mut self.current {
            if current.job_id == job_id {
                if !current.cancel_requested {
                    current.cancel_requested = true;
                    // The job leads its own process group (pgid == pid);
                    // signalling the group takes down shell children too.
                    let pgid = current.pid;
                    let grace = Duration::from_millis(self.config.cancel_grace_ms);
                    let poll = Duration::from_millis(self.config.cancel_poll_ms);
                    tracing::info!(job_id = %job_id, pid = pgid, "Cancelling running job");
                    tokio::spawn(async move {
                        process::terminate_group_with_grace(pgid, grace, poll).await;
                    });
                }
                return true;
            }
        }
        // Queued jobs are cancelled by removal; no process ever existed.
        if self.queue.remove(&job_id) {
            self.cancel_unstarted(job_id);
            tracing::info!(job_id = %job_id, "Cancelled queued job");
            return true;
        }
        false
    }

    /// Marks a job cancelled before any process existed.
    fn cancel_unstarted(&mut self, job_id: Uuid) {
        if let Some(job) = self.jobs.get_by_id_mut(&job_id) {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.error = Some("Job cancelled".to_string());
        }
        self.events.emit_job(JobEvent::Cancelled { job_id });
    }

    fn drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        let mut cancelled = 0usize;
        while let Some(job_id) = self.queue.pop() {
            self.cancel_unstarted(job_id);
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled queued jobs for shutdown");
        }
    }

    fn finish_job(&mut self, job_id: Uuid, exit_code: i32) {
        let Some(current) = self.current.take_if(|current| current.job_id == job_id) else {
            tracing::warn!(job_id = %job_id, "Exit report for a job that is not current");
            return;
        };
        let elapsed_ms = current.started.elapsed().as_millis() as u64;
        self.total_compute_ms += elapsed_ms;

        let status = if current.cancel_requested {
            JobStatus::Cancelled
        } else if exit_code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        let error = match status {
            JobStatus::Cancelled => Some("Job cancelled".to_string()),
            JobStatus::Failed if exit_code == runner::SIGNAL_EXIT_CODE => {
                Some("Process terminated by signal".to_string())
            }
            JobStatus::Failed => Some(format!("Process exited with code {exit_code}")),
            _ => None,
        };

        if let Some(job) = self.jobs.get_mut(current.slot) {
            job.status = status;
            job.completed_at = Some(Utc::now());
            job.exit_code = Some(exit_code);
            job.duration_ms = Some(elapsed_ms);
            job.error = error.clone();
        }

        match status {
            JobStatus::Completed => {
                self.jobs_completed += 1;
                tracing::info!(job_id = %job_id, exit_code, duration_ms = elapsed_ms, "Job completed");
                self.events.emit_job(JobEvent::Completed { job_id, exit_code });
            }
            JobStatus::Cancelled => {
                tracing::info!(job_id = %job_id, duration_ms = elapsed_ms, "Job cancelled");
                self.events.emit_job(JobEvent::Cancelled { job_id });
            }
            _ => {
                self.jobs_failed += 1;
                let message =
                    error.unwrap_or_else(|| format!("Process exited with code {exit_code}"));
                tracing::warn!(job_id = %job_id, exit_code, "Job failed");
                self.events.emit_job(JobEvent::Failed {
                    job_id,
                    error: message,
                });
            }
        }
    }

    fn list(&self, status: Option<JobStatus>, limit: Option<usize>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| status.map_or(true, |status| job.status == status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }
        jobs
    }

    fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
            total_compute_ms: self.total_compute_ms,
            queued: self.queue.len(),
            running: self.current.as_ref().map(|current| RunningJob {
                id: current.job_id,
                name: current.name.clone(),
            }),
        }
    }
}

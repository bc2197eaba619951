use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What to run, as handed to `JobExecutor::submit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Display name; an empty name gets a generated one.
    #[serde(default)]
    pub name: String,
    /// Inline script text, executed through `sh -c`.
    #[serde(default)]
    pub script: Option<String>,
    /// Script file; the interpreter is chosen by extension.
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    /// Environment overrides. A `None` value unsets the variable in
    /// the child instead of letting it inherit.
    #[serde(default)]
    pub env: HashMap<String, Option<String>>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Higher runs earlier; equal priorities run in submission order.
    #[serde(default)]
    pub priority: i32,
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        match (&self.script, &self.script_path) {
            (Some(script), None) if !script.trim().is_empty() => Ok(()),
            (None, Some(path)) if !path.as_os_str().is_empty() => Ok(()),
            (Some(_), Some(_)) => Err(AgentError::Validation(
                "Provide either script or script_path, not both".to_string(),
            )),
            _ => Err(AgentError::Validation(
                "Job needs a non-empty script or script_path".to_string(),
            )),
        }
    }
}

/// A tracked job, from submission to its terminal state.
///
/// Owned and mutated only by the executor worker; everyone else sees
/// clones taken at lookup time.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub script: Option<String>,
    pub script_path: Option<PathBuf>,
    pub env: HashMap<String, Option<String>>,
    pub cwd: Option<PathBuf>,
    pub priority: i32,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Set when the job failed or was cancelled.
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    /// Reserved for resource sampling; the runner does not populate them.
    pub peak_cpu_percent: Option<f64>,
    pub peak_memory_bytes: Option<u64>,
    /// Captured output lines, stdout and stderr interleaved.
    #[serde(skip)]
    pub logs: Vec<String>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let id = Uuid::new_v4();
        let name = if spec.name.trim().is_empty() {
            format!("job-{}", &id.simple().to_string()[..8])
        } else {
            spec.name
        };
        Self {
            id,
            name,
            script: spec.script,
            script_path: spec.script_path,
            env: spec.env,
            cwd: spec.cwd,
            priority: spec.priority,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error: None,
            duration_ms: None,
            peak_cpu_percent: None,
            peak_memory_bytes: None,
            logs: Vec::new(),
        }
    }

    /// Last `tail` log lines, or all of them when `tail` is `None`.
    pub fn tail_logs(&self, tail: Option<usize>) -> Vec<String> {
        match tail {
            Some(n) if n < self.logs.len() => self.logs[self.logs.len() - n..].to_vec(),
            _ => self.logs.clone(),
        }
    }
}

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::executor::job::Job;

/// Exit code recorded when a process dies without a normal exit status.
pub const SIGNAL_EXIT_CODE: i32 = 128;

/// Messages from a job's supervisor task back to the executor worker.
#[derive(Debug)]
pub enum RunnerUpdate {
    Line { job_id: Uuid, line: String },
    Exited { job_id: Uuid, exit_code: i32 },
}

/// Interpreter for a script file, chosen by extension.
fn interpreter_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => "python3",
        Some("js") => "node",
        Some("sh") => "sh",
        _ => "sh",
    }
}

/// Builds the child command for a job without spawning it.
///
/// Inline scripts run through `sh -c`; script files run under the
/// interpreter their extension names. Environment overrides with a
/// `None` value are removed from the inherited environment. The child
/// leads its own process group, so cancellation can signal the shell
/// and everything it forked in one call.
pub fn build_command(job: &Job) -> Result<Command> {
    let mut cmd = match (&job.script_path, &job.script) {
        (Some(path), _) => {
            let mut cmd = Command::new(interpreter_for(path));
            cmd.arg(path);
            cmd
        }
        (None, Some(script)) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        }
        (None, None) => {
            return Err(AgentError::Validation(
                "Job has nothing to run".to_string(),
            ))
        }
    };
    if let Some(cwd) = &job.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &job.env {
        match value {
            Some(value) => {
                cmd.env(key, value);
            }
            None => {
                cmd.env_remove(key);
            }
        }
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    Ok(cmd)
}

/// Owns a running child: streams its output lines to the worker and
/// reports the exit code once both pipes are drained.
pub async fn supervise(job_id: Uuid, mut child: Child, updates: mpsc::Sender<RunnerUpdate>) {
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        // Pipes absent; nothing to stream.
        report_exit(job_id, child, &updates).await;
        return;
    };
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout_lines.next_line(), if stdout_open => match line {
                Ok(Some(line)) => forward_line(job_id, line, &updates).await,
                _ => stdout_open = false,
            },
            line = stderr_lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => forward_line(job_id, line, &updates).await,
                _ => stderr_open = false,
            },
        }
    }
    report_exit(job_id, child, &updates).await;
}

async fn forward_line(job_id: Uuid, line: String, updates: &mpsc::Sender<RunnerUpdate>) {
    let _ = updates.send(RunnerUpdate::Line { job_id, line }).await;
}

async fn report_exit(job_id: Uuid, mut child: Child, updates: &mpsc::Sender<RunnerUpdate>) {
    let exit_code = match child.wait().await {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            tracing::warn!(job_id = %job_id, error = %err, "Failed to reap job process");
            SIGNAL_EXIT_CODE
        }
    };
    let _ = updates.send(RunnerUpdate::Exited { job_id, exit_code }).await;
}

/// Normal exits report their code; signal deaths report 128.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNAL_EXIT_CODE)
}

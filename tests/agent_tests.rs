use std::time::Duration;

use nimbus_agent::agent::{running_agent_pid, AgentCore};
use nimbus_agent::config::AgentConfig;
use nimbus_agent::error::AgentError;
use nimbus_agent::executor::{JobSpec, JobStatus};
use nimbus_agent::gateway::GatewayState;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Standalone agent config rooted in a temp dir
fn test_config(dir: &tempfile::TempDir) -> AgentConfig {
    let mut config = AgentConfig::default()
        .with_name("test-agent")
        .with_pid_file(dir.path().join("agent.pid"));
    config.gateway.enabled = false;
    config.executor.cancel_grace_ms = 1_000;
    config.executor.cancel_poll_ms = 50;
    config
}

fn script(script: &str) -> JobSpec {
    JobSpec {
        script: Some(script.to_string()),
        ..JobSpec::default()
    }
}

async fn wait_until_terminal(core: &AgentCore, job_id: Uuid) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if let Some(job) = core.executor().get_job(job_id).await {
            if job.status.is_terminal() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not settle", job_id);
}

async fn wait_until_running(core: &AgentCore, job_id: Uuid) {
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if let Some(job) = core.executor().get_job(job_id).await {
            if job.status == JobStatus::Running {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} never started", job_id);
}

#[tokio::test]
async fn test_start_records_pid_and_stop_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let pid_path = config.pid_file.clone();

    let core = AgentCore::start(config).await.unwrap();

    let contents = std::fs::read_to_string(&pid_path).unwrap();
    assert_eq!(contents.trim(), std::process::id().to_string());
    assert_eq!(running_agent_pid(&pid_path), Some(std::process::id()));

    core.stop().await;
    assert!(!pid_path.exists());
    assert_eq!(running_agent_pid(&pid_path), None);
    assert!(core.stopped().is_cancelled());
}

#[tokio::test]
async fn test_second_instance_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let core = AgentCore::start(config.clone()).await.unwrap();
    let err = AgentCore::start(config.clone()).await.unwrap_err();
    assert!(matches!(err, AgentError::AlreadyRunning(_)));

    // A clean stop frees the lock for the next instance.
    core.stop().await;
    let core = AgentCore::start(config).await.unwrap();
    core.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let core = AgentCore::start(test_config(&dir)).await.unwrap();

    core.stop().await;
    core.stop().await;
    assert!(core.stopped().is_cancelled());
}

#[tokio::test]
async fn test_status_snapshot_tracks_work() {
    let dir = tempfile::tempdir().unwrap();
    let core = AgentCore::start(test_config(&dir)).await.unwrap();

    let status = core.status().await;
    assert_eq!(status.name, "test-agent");
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.gateway, GatewayState::Disconnected);
    assert!(status.agent_id.is_none());
    assert_eq!(status.jobs_completed, 0);
    assert_eq!(status.queued_jobs, 0);
    assert!(status.running.is_none());
    assert_eq!(status.kernels, 0);

    let job = core.executor().submit(script("echo hi")).await.unwrap();
    wait_until_terminal(&core, job.id).await;

    let status = core.status().await;
    assert_eq!(status.jobs_completed, 1);
    assert_eq!(status.jobs_failed, 0);

    core.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_the_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let core = AgentCore::start(test_config(&dir)).await.unwrap();

    let job = core.executor().submit(script("sleep 30")).await.unwrap();
    wait_until_running(&core, job.id).await;

    core.stop().await;

    let job = core.executor().get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_stop_drains_queued_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let core = AgentCore::start(test_config(&dir)).await.unwrap();

    let running = core.executor().submit(script("sleep 30")).await.unwrap();
    let queued = core.executor().submit(script("echo never")).await.unwrap();
    wait_until_running(&core, running.id).await;

    core.stop().await;

    // Nothing may spawn under a stopped agent: the backlog is cancelled
    // before the in-flight job settles and frees the run slot.
    let queued = core.executor().get_job(queued.id).await.unwrap();
    assert_eq!(queued.status, JobStatus::Cancelled);
    assert!(queued.started_at.is_none());

    let running = core.executor().get_job(running.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Cancelled);
    assert!(core.executor().stats().await.running.is_none());
}

#[tokio::test]
async fn test_shutdown_token_race_stops_the_agent_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let pid_path = config.pid_file.clone();
    let core = AgentCore::start(config).await.unwrap();

    // Same supervision shape as the binary: an external shutdown token
    // raced against the agent's own stop token, held across the select.
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let agent = core.clone();
    let supervisor = tokio::spawn(async move {
        let stopped = agent.stopped();
        tokio::select! {
            _ = signal.cancelled() => {
                agent.stop().await;
            }
            _ = stopped.cancelled() => {}
        }
    });

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("supervisor never settled")
        .unwrap();
    assert!(!pid_path.exists());
    assert!(core.stopped().is_cancelled());
}

#[tokio::test]
async fn test_idle_timeout_stops_the_agent() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir).with_idle_timeout_ms(400);
    let pid_path = config.pid_file.clone();

    let core = AgentCore::start(config).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), core.stopped().cancelled())
        .await
        .expect("idle timeout never stopped the agent");
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_running_job_defers_the_idle_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir).with_idle_timeout_ms(600);

    let core = AgentCore::start(config).await.unwrap();
    core.executor().submit(script("sleep 1.2")).await.unwrap();

    // The first expiry lands mid-job and must re-arm instead of stopping.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(
        !core.stopped().is_cancelled(),
        "agent stopped while a job was running"
    );

    tokio::time::timeout(Duration::from_secs(5), core.stopped().cancelled())
        .await
        .expect("agent never stopped after the work drained");
}

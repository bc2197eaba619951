use std::time::Duration;

use nimbus_agent::config::KernelConfig;
use nimbus_agent::error::AgentError;
use nimbus_agent::events::{AgentEvent, EventBus, KernelEvent};
use nimbus_agent::kernel::{
    ExecuteRequest, ExecuteResult, ExecuteStatus, KernelManager, KernelStatus,
};
use nimbus_agent::process;
use uuid::Uuid;

/// Kernel config with test-sized timeouts
fn test_config() -> KernelConfig {
    KernelConfig {
        python_bin: "python3".to_string(),
        ready_timeout_ms: 15_000,
        execute_timeout_ms: 20_000,
        shutdown_grace_ms: 2_000,
    }
}

fn test_manager() -> (KernelManager, EventBus) {
    let events = EventBus::new();
    let manager = KernelManager::new(test_config(), events.clone());
    (manager, events)
}

async fn exec_on(manager: &KernelManager, kernel_id: Uuid, code: &str) -> ExecuteResult {
    manager
        .execute_code(ExecuteRequest {
            kernel_id: Some(kernel_id),
            code: code.to_string(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_create_and_execute() {
    let (manager, _events) = test_manager();

    let session = manager.create_kernel("python").await.unwrap();
    assert_eq!(session.status, KernelStatus::Idle);
    assert_eq!(session.execution_count, 0);
    assert!(session.pid > 0);

    let result = exec_on(&manager, session.id, "print(1 + 1)").await;
    assert_eq!(result.kernel_id, session.id);
    assert_eq!(result.status, ExecuteStatus::Ok);
    assert_eq!(result.outputs, vec!["2".to_string()]);
    assert_eq!(result.execution_count, 1);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_state_persists_across_executions() {
    let (manager, _events) = test_manager();
    let session = manager.create_kernel("python").await.unwrap();

    let first = exec_on(&manager, session.id, "x = 41").await;
    assert_eq!(first.status, ExecuteStatus::Ok);
    assert!(first.outputs.is_empty());
    assert_eq!(first.execution_count, 1);

    let second = exec_on(&manager, session.id, "print(x + 1)").await;
    assert_eq!(second.outputs, vec!["42".to_string()]);
    assert_eq!(second.execution_count, 2);
}

#[tokio::test]
async fn test_multiline_code_runs_as_one_block() {
    let (manager, _events) = test_manager();
    let session = manager.create_kernel("python").await.unwrap();

    let code = "total = 0\nfor i in range(5):\n    total += i\nprint(total)";
    let result = exec_on(&manager, session.id, code).await;

    assert_eq!(result.status, ExecuteStatus::Ok);
    assert_eq!(result.outputs, vec!["10".to_string()]);
}

#[tokio::test]
async fn test_exceptions_are_structured_and_nonfatal() {
    let (manager, _events) = test_manager();
    let session = manager.create_kernel("python").await.unwrap();

    let result = exec_on(&manager, session.id, "raise ValueError('boom')").await;
    assert_eq!(result.status, ExecuteStatus::Error);

    let error = result.error.unwrap();
    assert_eq!(error.name, "ValueError");
    assert!(error.message.contains("boom"));
    assert!(error.traceback.unwrap().contains("ValueError"));

    // A failed execution still counts and the kernel keeps serving.
    assert_eq!(result.execution_count, 1);
    let after = exec_on(&manager, session.id, "print('ok')").await;
    assert_eq!(after.status, ExecuteStatus::Ok);
    assert_eq!(after.outputs, vec!["ok".to_string()]);
    assert_eq!(after.execution_count, 2);
}

#[tokio::test]
async fn test_execute_without_kernel_creates_one() {
    let (manager, _events) = test_manager();

    let result = manager
        .execute_code(ExecuteRequest {
            kernel_id: None,
            code: "print('fresh')".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(result.status, ExecuteStatus::Ok);
    assert_eq!(result.outputs, vec!["fresh".to_string()]);

    let kernels = manager.list_kernels().await;
    assert_eq!(kernels.len(), 1);
    assert_eq!(kernels[0].id, result.kernel_id);
    assert_eq!(kernels[0].execution_count, 1);
}

#[tokio::test]
async fn test_startup_timeout_kills_the_interpreter() {
    use std::os::unix::fs::PermissionsExt;

    // A fake interpreter that never prints the ready sentinel.
    let dir = tempfile::tempdir().unwrap();
    let fake = dir.path().join("stuck-python");
    std::fs::write(&fake, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = KernelConfig {
        python_bin: fake.to_string_lossy().into_owned(),
        ready_timeout_ms: 500,
        ..test_config()
    };
    let manager = KernelManager::new(config, EventBus::new());

    let start = tokio::time::Instant::now();
    let err = manager.create_kernel("python").await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(400));
    assert!(matches!(err, AgentError::Timeout(_)));
    assert!(manager.list_kernels().await.is_empty());
}

#[tokio::test]
async fn test_interrupt_breaks_a_stuck_execution() {
    let (manager, _events) = test_manager();
    let session = manager.create_kernel("python").await.unwrap();

    exec_on(&manager, session.id, "import time").await;

    let worker = {
        let manager = manager.clone();
        let kernel_id = session.id;
        tokio::spawn(async move {
            manager
                .execute_code(ExecuteRequest {
                    kernel_id: Some(kernel_id),
                    code: "time.sleep(30)".to_string(),
                })
                .await
                .unwrap()
        })
    };

    // Wait until the sleep has actually started before interrupting.
    let start = tokio::time::Instant::now();
    loop {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "kernel never went busy"
        );
        let current = manager.get_kernel(&session.id).await.unwrap();
        if current.status == KernelStatus::Busy {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    manager.interrupt_kernel(&session.id).await.unwrap();

    let result = worker.await.unwrap();
    assert_eq!(result.status, ExecuteStatus::Error);
    assert_eq!(result.error.unwrap().name, "KeyboardInterrupt");

    // The kernel survives and keeps serving.
    let after = exec_on(&manager, session.id, "print('alive')").await;
    assert_eq!(after.status, ExecuteStatus::Ok);
    assert_eq!(after.outputs, vec!["alive".to_string()]);
}

#[tokio::test]
async fn test_execution_timeout_reports_and_releases() {
    let config = KernelConfig {
        execute_timeout_ms: 800,
        ..test_config()
    };
    let manager = KernelManager::new(config, EventBus::new());
    let session = manager.create_kernel("python").await.unwrap();

    let err = manager
        .execute_code(ExecuteRequest {
            kernel_id: Some(session.id),
            code: "import time\ntime.sleep(5)".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Timeout(_)));

    // The kernel is not torn down, only marked idle again.
    let current = manager.get_kernel(&session.id).await.unwrap();
    assert_eq!(current.status, KernelStatus::Idle);
}

#[tokio::test]
async fn test_shutdown_terminates_the_process() {
    let (manager, _events) = test_manager();
    let session = manager.create_kernel("python").await.unwrap();
    let pid = session.pid;

    manager.shutdown_kernel(&session.id).await.unwrap();

    assert!(manager.get_kernel(&session.id).await.is_none());
    assert!(manager.list_kernels().await.is_empty());

    // The monitor task reaps the child shortly after it exits.
    let start = tokio::time::Instant::now();
    while process::alive(pid) {
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "interpreter still alive after shutdown"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_shutdown_all_clears_every_kernel() {
    let (manager, _events) = test_manager();
    manager.create_kernel("python").await.unwrap();
    manager.create_kernel("python").await.unwrap();
    assert_eq!(manager.kernel_count().await, 2);

    manager.shutdown_all().await;
    assert_eq!(manager.kernel_count().await, 0);
}

#[tokio::test]
async fn test_unknown_kernel_operations_fail() {
    let (manager, _events) = test_manager();
    let missing = Uuid::new_v4();

    assert!(matches!(
        manager.shutdown_kernel(&missing).await.unwrap_err(),
        AgentError::NotFound(_)
    ));
    assert!(matches!(
        manager.interrupt_kernel(&missing).await.unwrap_err(),
        AgentError::NotFound(_)
    ));
    assert!(manager.get_kernel(&missing).await.is_none());
}

#[tokio::test]
async fn test_kernel_events_are_broadcast() {
    let (manager, events) = test_manager();
    let mut rx = events.subscribe();

    let session = manager.create_kernel("python").await.unwrap();
    let result = exec_on(&manager, session.id, "print('seen')").await;
    assert_eq!(result.status, ExecuteStatus::Ok);

    let mut saw_created = false;
    let mut saw_output = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let AgentEvent::Kernel(event) = event else {
            continue;
        };
        match event {
            KernelEvent::Created {
                kernel_id,
                language,
            } if kernel_id == session.id => {
                assert_eq!(language, "python");
                saw_created = true;
            }
            KernelEvent::Output { kernel_id, chunk } if kernel_id == session.id => {
                assert_eq!(chunk, "seen");
                saw_output = true;
            }
            KernelEvent::Executed {
                kernel_id,
                execution_count,
            } if kernel_id == session.id => {
                assert_eq!(execution_count, 1);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_created);
    assert!(saw_output);
}

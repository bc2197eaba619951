use std::path::PathBuf;

use crate::error::{AgentError, Result};

/// Agent-wide settings.
///
/// Everything has a workable default so `AgentConfig::default()` starts a
/// standalone agent; the CLI and tests override individual fields.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name announced to the gateway.
    pub name: String,
    /// File guarding the single-instance lock.
    pub pid_file: PathBuf,
    /// Self-stop after this long without job activity. Zero disables.
    pub idle_timeout_ms: u64,
    /// Soft memory ceiling advertised to the gateway, in percent.
    pub max_memory_percent: u8,
    /// Whether the gateway may route jobs from other users here.
    pub allow_remote_jobs: bool,
    pub gateway: GatewayConfig,
    pub executor: ExecutorConfig,
    pub kernel: KernelConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "nimbus-agent".to_string(),
            pid_file: std::env::temp_dir().join("nimbus-agent.pid"),
            idle_timeout_ms: 0,
            max_memory_percent: 80,
            allow_remote_jobs: true,
            gateway: GatewayConfig::default(),
            executor: ExecutorConfig::default(),
            kernel: KernelConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = path.into();
        self
    }

    pub fn with_idle_timeout_ms(mut self, idle_timeout_ms: u64) -> Self {
        self.idle_timeout_ms = idle_timeout_ms;
        self
    }

    pub fn with_gateway_url(mut self, url: &str) -> Self {
        self.gateway.base_url = url.to_string();
        self.gateway.enabled = true;
        self
    }

    /// Rejects configurations the agent cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AgentError::Validation(
                "Agent name must not be empty".to_string(),
            ));
        }
        if self.max_memory_percent == 0 || self.max_memory_percent > 100 {
            return Err(AgentError::Validation(format!(
                "max_memory_percent must be within 1..=100, got {}",
                self.max_memory_percent
            )));
        }
        if self.gateway.heartbeat_interval_ms == 0 {
            return Err(AgentError::Validation(
                "Heartbeat interval must be positive".to_string(),
            ));
        }
        if self.executor.max_jobs == 0 {
            return Err(AgentError::Validation(
                "Executor must allow at least one job".to_string(),
            ));
        }
        if self.kernel.ready_timeout_ms == 0 || self.kernel.execute_timeout_ms == 0 {
            return Err(AgentError::Validation(
                "Kernel timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Gateway link settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// When false the agent never dials the gateway.
    pub enabled: bool,
    /// Base URL for the agent endpoints, e.g. `http://gateway:7070/api/agents`.
    pub base_url: String,
    /// Bearer token attached to every gateway request when present.
    pub auth_token: Option<String>,
    /// Forwarded in the `X-User-Id` header when present.
    pub user_id: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_ms: u64,
    /// Ceiling for the reconnect delay.
    pub reconnect_cap_ms: u64,
    /// Reconnect attempts before the link gives up.
    pub reconnect_max_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:7070/api/agents".to_string(),
            auth_token: None,
            user_id: None,
            heartbeat_interval_ms: 15_000,
            request_timeout_ms: 10_000,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 60_000,
            reconnect_max_attempts: 10,
        }
    }
}

/// Job execution settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on tracked jobs (queued, running, and finished).
    pub max_jobs: usize,
    /// How long a cancelled process gets to exit after SIGTERM.
    pub cancel_grace_ms: u64,
    /// Poll interval while waiting for a cancelled process to die.
    pub cancel_poll_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            cancel_grace_ms: 5_000,
            cancel_poll_ms: 100,
        }
    }
}

/// Kernel session settings.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Interpreter binary for python kernels. Point into a venv when needed.
    pub python_bin: String,
    /// How long a fresh interpreter gets to print its ready sentinel.
    pub ready_timeout_ms: u64,
    /// Hard ceiling for a single execution.
    pub execute_timeout_ms: u64,
    /// How long a kernel gets to honor the quit request before SIGKILL.
    pub shutdown_grace_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            ready_timeout_ms: 30_000,
            execute_timeout_ms: 300_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

//! Gateway link.
//!
//! # Components
//!
//! - [`GatewayConnector`]: the connection state machine. Owns the
//!   registration, the heartbeat task, and the reconnect task.
//! - [`GatewayClient`]: the HTTP calls themselves.
//! - [`ConnectionState`]: bookkeeping and transitions, guarded by one
//!   mutex inside the connector.
//!
//! # Execution Flow
//!
//! 1. `connect` claims the attempt and registers; concurrent callers
//!    await the same attempt instead of racing a second registration.
//! 2. While `Connected`, the heartbeat task posts the agent's status
//!    every interval. A 404 means the gateway forgot this agent: the
//!    registration is dropped and the reconnect task takes over.
//! 3. Reconnect delays double from the base up to the cap; exhausting
//!    the attempt budget emits one terminal event and parks the link
//!    in `Error`.

mod client;
mod state;

pub use client::{
    local_hostname, AgentActivity, AgentConfigPayload, Capabilities, CurrentJobInfo,
    DisconnectRequest, GatewayClient, HeartbeatOutcome, HeartbeatRequest, RegisterRequest,
    RegisterResponse,
};
pub use state::{ConnectionState, GatewayState};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::error::{AgentError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::executor::JobExecutor;

/// Backoff delay for `attempt` (0-based): base doubled per attempt,
/// saturating at `cap_ms`.
fn reconnect_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    base_ms
        .checked_shl(attempt)
        .map_or(cap_ms, |delay| delay.min(cap_ms))
}

#[derive(Debug, Default)]
struct ConnectorTasks {
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct ConnectorInner {
    config: GatewayConfig,
    client: GatewayClient,
    register_request: RegisterRequest,
    executor: JobExecutor,
    events: EventBus,
    state: Mutex<ConnectionState>,
    /// Notified whenever a connect attempt or disconnect resolves.
    attempt_done: Notify,
    heartbeat_interval_ms: AtomicU64,
    reconnecting: AtomicBool,
    /// Locked only from synchronous code, never across an await.
    tasks: std::sync::Mutex<ConnectorTasks>,
}

/// Maintains the agent's registration with the orchestration gateway.
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    inner: Arc<ConnectorInner>,
}

impl GatewayConnector {
    pub fn new(
        config: GatewayConfig,
        register_request: RegisterRequest,
        executor: JobExecutor,
        events: EventBus,
    ) -> Result<Self> {
        let client = GatewayClient::new(&config)?;
        let heartbeat_interval_ms = AtomicU64::new(config.heartbeat_interval_ms);
        Ok(Self {
            inner: Arc::new(ConnectorInner {
                client,
                register_request,
                executor,
                events,
                state: Mutex::new(ConnectionState::new()),
                attempt_done: Notify::new(),
                heartbeat_interval_ms,
                reconnecting: AtomicBool::new(false),
                tasks: std::sync::Mutex::new(ConnectorTasks::default()),
                config,
            }),
        })
    }

    pub async fn state(&self) -> GatewayState {
        self.inner.state.lock().await.state()
    }

    pub async fn agent_id(&self) -> Option<String> {
        self.inner.state.lock().await.agent_id().map(str::to_string)
    }

    /// Registers with the gateway. Concurrent callers share one
    /// attempt: whoever arrives while one is in flight awaits its
    /// outcome instead of sending a second registration.
    pub async fn connect(&self) -> Result<()> {
        if !self.inner.config.enabled {
            return Err(AgentError::Connection(
                "Gateway link is disabled".to_string(),
            ));
        }
        let mut waited = false;
        loop {
            let mut notified = std::pin::pin!(self.inner.attempt_done.notified());
            // Armed before the state check so a resolution landing in
            // between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                match state.state() {
                    GatewayState::Connected => return Ok(()),
                    GatewayState::Connecting | GatewayState::Disconnecting => {}
                    GatewayState::Disconnected | GatewayState::Error => {
                        if waited {
                            return Err(AgentError::Connection(
                                "Gateway connection attempt failed".to_string(),
                            ));
                        }
                        state.begin_connecting();
                        drop(state);
                        return self.register_attempt().await;
                    }
                }
            }
            waited = true;
            notified.await;
        }
    }

    async fn register_attempt(&self) -> Result<()> {
        tracing::info!(url = %self.inner.config.base_url, "Connecting to gateway");
        match self
            .inner
            .client
            .register(&self.inner.register_request)
            .await
        {
            Ok(response) => {
                self.complete_registration(response).await;
                Ok(())
            }
            Err(err) => {
                {
                    let mut state = self.inner.state.lock().await;
                    state.become_error();
                }
                self.inner.attempt_done.notify_waiters();
                Err(err)
            }
        }
    }

    async fn complete_registration(&self, response: RegisterResponse) {
        if let Some(interval_ms) = response.heartbeat_interval {
            if interval_ms > 0 {
                self.inner
                    .heartbeat_interval_ms
                    .store(interval_ms, Ordering::Relaxed);
            }
        }
        {
            let mut state = self.inner.state.lock().await;
            state.become_connected(response.agent_id.clone());
        }
        tracing::info!(agent_id = %response.agent_id, "Registered with gateway");
        self.inner.events.emit_gateway(GatewayEvent::Registered {
            agent_id: response.agent_id,
        });
        self.start_heartbeat();
        self.inner.attempt_done.notify_waiters();
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, ConnectorTasks> {
        match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // The start fns stay synchronous: each spawned loop re-enters
    // registration, which lands back here, and that call cycle must
    // not run through the futures themselves.
    fn start_heartbeat(&self) {
        let mut tasks = self.lock_tasks();
        if let Some(handle) = tasks.heartbeat.take() {
            handle.abort();
        }
        let connector = self.clone();
        tasks.heartbeat = Some(tokio::spawn(connector.heartbeat_loop()));
    }

    async fn heartbeat_loop(self) {
        loop {
            let interval_ms = self.inner.heartbeat_interval_ms.load(Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;

            let agent_id = {
                let state = self.inner.state.lock().await;
                if state.state() != GatewayState::Connected {
                    break;
                }
                state.agent_id().map(str::to_string)
            };
            let Some(agent_id) = agent_id else {
                break;
            };

            let request = self.heartbeat_request(agent_id).await;
            match self.inner.client.heartbeat(&request).await {
                Ok(HeartbeatOutcome::Acknowledged) => {
                    tracing::trace!("Heartbeat acknowledged");
                }
                Ok(HeartbeatOutcome::Unregistered) => {
                    tracing::warn!("Gateway no longer knows this agent, re-registering");
                    {
                        let mut state = self.inner.state.lock().await;
                        state.lose_registration();
                    }
                    self.start_reconnect();
                    break;
                }
                Err(err) => {
                    // Logged and retried next tick; heartbeats get no
                    // backoff.
                    tracing::warn!(error = %err, "Heartbeat failed");
                    self.inner.events.emit_gateway(GatewayEvent::HeartbeatFailed {
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    async fn heartbeat_request(&self, agent_id: String) -> HeartbeatRequest {
        let stats = self.inner.executor.stats().await;
        let (status, current_job) = match stats.running {
            Some(job) => (
                AgentActivity::Busy,
                Some(CurrentJobInfo {
                    id: job.id,
                    name: job.name,
                }),
            ),
            None => (AgentActivity::Idle, None),
        };
        HeartbeatRequest {
            agent_id,
            status,
            current_job,
        }
    }

    fn start_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let connector = self.clone();
        let mut tasks = self.lock_tasks();
        tasks.reconnect = Some(tokio::spawn(async move {
            connector.reconnect_loop().await;
            connector.inner.reconnecting.store(false, Ordering::SeqCst);
        }));
    }

    async fn reconnect_loop(&self) {
        loop {
            let attempt = {
                let mut state = self.inner.state.lock().await;
                if state.state() != GatewayState::Connecting {
                    // Disconnected under us; stop quietly.
                    return;
                }
                state.record_reconnect_attempt()
            };
            if attempt > self.inner.config.reconnect_max_attempts {
                {
                    let mut state = self.inner.state.lock().await;
                    state.become_error();
                }
                tracing::warn!(
                    attempts = self.inner.config.reconnect_max_attempts,
                    "Reconnect attempts exhausted, giving up"
                );
                self.inner
                    .events
                    .emit_gateway(GatewayEvent::ReconnectExhausted {
                        attempts: self.inner.config.reconnect_max_attempts,
                    });
                self.inner.attempt_done.notify_waiters();
                return;
            }
            let delay_ms = reconnect_delay_ms(
                attempt - 1,
                self.inner.config.reconnect_base_ms,
                self.inner.config.reconnect_cap_ms,
            );
            tracing::info!(attempt, delay_ms, "Scheduling gateway reconnect");
            self.inner
                .events
                .emit_gateway(GatewayEvent::ReconnectScheduled { attempt, delay_ms });
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            match self
                .inner
                .client
                .register(&self.inner.register_request)
                .await
            {
                Ok(response) => {
                    self.complete_registration(response).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "Reconnect attempt failed");
                }
            }
        }
    }

    /// Stops the heartbeat, tells the gateway we are leaving, and
    /// resets to `Disconnected`. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let agent_id = {
            let mut state = self.inner.state.lock().await;
            if !state.begin_disconnecting() {
                return;
            }
            state.agent_id().map(str::to_string)
        };

        {
            let mut tasks = self.lock_tasks();
            if let Some(handle) = tasks.heartbeat.take() {
                handle.abort();
            }
            if let Some(handle) = tasks.reconnect.take() {
                handle.abort();
            }
        }
        // An aborted reconnect task cannot clear its own flag.
        self.inner.reconnecting.store(false, Ordering::SeqCst);

        if let Some(agent_id) = &agent_id {
            if let Err(err) = self.inner.client.disconnect(agent_id).await {
                tracing::warn!(error = %err, "Gateway disconnect notification failed");
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.become_disconnected();
        }
        tracing::info!("Disconnected from gateway");
        self.inner.events.emit_gateway(GatewayEvent::Disconnected);
        self.inner.attempt_done.notify_waiters();
    }
}

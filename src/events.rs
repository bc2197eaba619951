//! Agent event bus.
//!
//! Every subsystem publishes lifecycle events onto a single broadcast
//! channel. Subscribers (the CLI, the idle timer, tests) each get their
//! own receiver; slow subscribers lose the oldest events rather than
//! blocking publishers.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;

/// Job lifecycle events.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started { job_id: Uuid },
    /// One line of process output, emitted as it is read.
    Log { job_id: Uuid, line: String },
    Completed { job_id: Uuid, exit_code: i32 },
    Failed { job_id: Uuid, error: String },
    Cancelled { job_id: Uuid },
}

/// Kernel lifecycle events.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    Created { kernel_id: Uuid, language: String },
    /// A chunk of interpreter output from a running execution.
    Output { kernel_id: Uuid, chunk: String },
    Executed { kernel_id: Uuid, execution_count: u64 },
    ExecutionFailed { kernel_id: Uuid, error: String },
    Terminated { kernel_id: Uuid },
}

/// Gateway link events.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Registered { agent_id: String },
    HeartbeatFailed { error: String },
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    /// Emitted exactly once when the reconnect budget is spent.
    ReconnectExhausted { attempts: u32 },
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Job(JobEvent),
    Kernel(KernelEvent),
    Gateway(GatewayEvent),
}

/// Shared broadcast channel for [`AgentEvent`]s.
///
/// Cloning is cheap; all clones feed the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. A send error only means nobody is listening.
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_job(&self, event: JobEvent) {
        self.emit(AgentEvent::Job(event));
    }

    pub fn emit_kernel(&self, event: KernelEvent) {
        self.emit(AgentEvent::Kernel(event));
    }

    pub fn emit_gateway(&self, event: GatewayEvent) {
        self.emit(AgentEvent::Gateway(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a kernel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    Starting,
    Idle,
    Busy,
    Terminated,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one interpreter session.
#[derive(Debug, Clone, Serialize)]
pub struct KernelSession {
    pub id: Uuid,
    pub language: String,
    pub pid: u32,
    pub status: KernelStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub execution_count: u64,
}

impl KernelSession {
    pub fn new(language: &str, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            language: language.to_string(),
            pid,
            status: KernelStatus::Starting,
            created_at: now,
            last_activity: now,
            execution_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_displays_lowercase() {
        assert_eq!(KernelStatus::Starting.to_string(), "starting");
        assert_eq!(KernelStatus::Idle.to_string(), "idle");
        assert_eq!(KernelStatus::Busy.to_string(), "busy");
        assert_eq!(KernelStatus::Terminated.to_string(), "terminated");
    }

    #[test]
    fn new_session_starts_unused() {
        let session = KernelSession::new("python", 4242);
        assert_eq!(session.language, "python");
        assert_eq!(session.pid, 4242);
        assert_eq!(session.status, KernelStatus::Starting);
        assert_eq!(session.execution_count, 0);
        assert_eq!(session.created_at, session.last_activity);
    }
}

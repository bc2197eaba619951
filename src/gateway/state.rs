use serde::{Deserialize, Serialize};

/// Gateway link states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatewayState::Disconnected => "disconnected",
            GatewayState::Connecting => "connecting",
            GatewayState::Connected => "connected",
            GatewayState::Disconnecting => "disconnecting",
            GatewayState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Connection bookkeeping, guarded by the connector's mutex.
#[derive(Debug)]
pub struct ConnectionState {
    state: GatewayState,
    agent_id: Option<String>,
    reconnect_attempts: u32,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            state: GatewayState::Disconnected,
            agent_id: None,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Claims the connect attempt. Returns false when one is already in
    /// flight or the link is established.
    pub fn begin_connecting(&mut self) -> bool {
        match self.state {
            GatewayState::Disconnected | GatewayState::Error => {
                self.state = GatewayState::Connecting;
                true
            }
            _ => false,
        }
    }

    pub fn become_connected(&mut self, agent_id: String) {
        self.state = GatewayState::Connected;
        self.agent_id = Some(agent_id);
        self.reconnect_attempts = 0;
    }

    pub fn become_error(&mut self) {
        self.state = GatewayState::Error;
    }

    /// Claims the disconnect. Returns false when already down or going
    /// down, which is what makes `disconnect()` idempotent.
    pub fn begin_disconnecting(&mut self) -> bool {
        match self.state {
            GatewayState::Disconnected | GatewayState::Disconnecting => false,
            _ => {
                self.state = GatewayState::Disconnecting;
                true
            }
        }
    }

    pub fn become_disconnected(&mut self) {
        self.state = GatewayState::Disconnected;
        self.agent_id = None;
        self.reconnect_attempts = 0;
    }

    /// The gateway forgot this agent; drop the id and keep trying.
    pub fn lose_registration(&mut self) {
        self.agent_id = None;
        self.state = GatewayState::Connecting;
    }

    pub fn record_reconnect_attempt(&mut self) -> u32 {
        self.reconnect_attempts += 1;
        self.reconnect_attempts
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let state = ConnectionState::new();
        assert_eq!(state.state(), GatewayState::Disconnected);
        assert!(state.agent_id().is_none());
        assert_eq!(state.reconnect_attempts(), 0);
    }

    #[test]
    fn connect_claim_is_exclusive() {
        let mut state = ConnectionState::new();
        assert!(state.begin_connecting());
        assert_eq!(state.state(), GatewayState::Connecting);
        assert!(!state.begin_connecting());

        state.become_connected("agent-1".to_string());
        assert!(!state.begin_connecting());
    }

    #[test]
    fn connected_stores_id_and_resets_attempts() {
        let mut state = ConnectionState::new();
        state.begin_connecting();
        state.record_reconnect_attempt();
        state.record_reconnect_attempt();
        state.become_connected("agent-1".to_string());

        assert_eq!(state.state(), GatewayState::Connected);
        assert_eq!(state.agent_id(), Some("agent-1"));
        assert_eq!(state.reconnect_attempts(), 0);
    }

    #[test]
    fn error_is_reconnectable() {
        let mut state = ConnectionState::new();
        state.begin_connecting();
        state.become_error();
        assert_eq!(state.state(), GatewayState::Error);
        assert!(state.begin_connecting());
    }

    #[test]
    fn disconnect_claim_is_idempotent() {
        let mut state = ConnectionState::new();
        state.begin_connecting();
        state.become_connected("agent-1".to_string());

        assert!(state.begin_disconnecting());
        assert!(!state.begin_disconnecting());
        state.become_disconnected();
        assert!(!state.begin_disconnecting());
        assert!(state.agent_id().is_none());
    }

    #[test]
    fn losing_registration_keeps_the_link_trying() {
        let mut state = ConnectionState::new();
        state.begin_connecting();
        state.become_connected("agent-1".to_string());
        state.lose_registration();

        assert_eq!(state.state(), GatewayState::Connecting);
        assert!(state.agent_id().is_none());
        assert_eq!(state.record_reconnect_attempt(), 1);
        assert_eq!(state.record_reconnect_attempt(), 2);
    }
}

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{AgentError, Result};

/// Hardware summary reported at registration.
///
/// GPU fields stay at their empty defaults here; a richer prober can
/// fill them in before registration when one is wired up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub gpu_type: String,
    pub gpu_memory: u64,
    pub cpu_cores: u32,
    pub ram_total: u64,
    pub frameworks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metal_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neural_engine: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neural_engine_tops: Option<f64>,
}

impl Capabilities {
    /// Cheap local probe: CPU count and total memory.
    pub fn detect() -> Self {
        let sys = System::new_all();
        Self {
            gpu_type: "none".to_string(),
            gpu_memory: 0,
            cpu_cores: sys.cpus().len() as u32,
            ram_total: sys.total_memory(),
            frameworks: Vec::new(),
            metal_version: None,
            compute_capability: None,
            neural_engine: None,
            neural_engine_tops: None,
        }
    }
}

/// Local hostname as reported to the gateway.
pub fn local_hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Agent-level settings shared with the gateway at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigPayload {
    pub max_memory_percent: u8,
    pub allow_remote_jobs: bool,
    pub idle_timeout_minutes: u64,
}

/// Body of `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub name: String,
    pub hostname: String,
    pub capabilities: Capabilities,
    pub config: AgentConfigPayload,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub agent_id: String,
    /// Server-suggested heartbeat interval in milliseconds.
    #[serde(default)]
    pub heartbeat_interval: Option<u64>,
}

/// What the agent is doing, as the gateway sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentActivity {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentJobInfo {
    pub id: Uuid,
    pub name: String,
}

/// Body of `POST /heartbeat`. `current_job` serializes as `null` while
/// nothing is running.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub status: AgentActivity,
    pub current_job: Option<CurrentJobInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub agent_id: String,
}

/// Heartbeat outcomes the connector reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Acknowledged,
    /// HTTP 404: the gateway forgot this agent.
    Unregistered,
}

/// HTTP client for the gateway's agent endpoints.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    user_id: Option<String>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            user_id: config.user_id.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.post(format!("{}/{path}", self.base_url));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(user_id) = &self.user_id {
            request = request.header("X-User-Id", user_id);
        }
        request
    }

    pub async fn register(&self, body: &RegisterRequest) -> Result<RegisterResponse> {
        let response = self
            .post("register")
            .json(body)
            .send()
            .await
            .map_err(|err| AgentError::Connection(format!("Registration failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Connection(format!(
                "Registration rejected with HTTP {}",
                response.status()
            )));
        }
        response.json().await.map_err(|err| {
            AgentError::Connection(format!("Malformed registration response: {err}"))
        })
    }

    pub async fn heartbeat(&self, body: &HeartbeatRequest) -> Result<HeartbeatOutcome> {
        let response = self
            .post("heartbeat")
            .json(body)
            .send()
            .await
            .map_err(|err| AgentError::Connection(format!("Heartbeat failed: {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(HeartbeatOutcome::Unregistered);
        }
        if !response.status().is_success() {
            return Err(AgentError::Connection(format!(
                "Heartbeat rejected with HTTP {}",
                response.status()
            )));
        }
        Ok(HeartbeatOutcome::Acknowledged)
    }

    pub async fn disconnect(&self, agent_id: &str) -> Result<()> {
        let response = self
            .post("disconnect")
            .json(&DisconnectRequest {
                agent_id: agent_id.to_string(),
            })
            .send()
            .await
            .map_err(|err| AgentError::Connection(format!("Disconnect failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AgentError::Connection(format!(
                "Disconnect rejected with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

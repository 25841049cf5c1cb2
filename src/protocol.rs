//! Wire protocol between the control plane and platform agents.
//!
//! Frames are JSON envelopes `{type, payload}` over a persistent full-duplex
//! channel, one per agent. The transport (WebSocket framing, TLS) is the
//! boundary's concern; this module owns only the envelope grammar.
//!
//! Inbound frames that fail to deserialize are discarded by the reader with
//! a warning and a counter bump, never an error to the agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::{AgentCapacity, AgentId, CommandAction, SessionName};

/// Frames an agent sends to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Connection handshake: identifies the agent and declares capacity.
    Register(RegisterPayload),
    /// Periodic liveness signal (default cadence 10 s).
    Heartbeat(HeartbeatPayload),
    /// The agent received a command and will act on it.
    Ack(AckPayload),
    /// The command finished; `result` carries action-specific fields.
    Complete(CompletePayload),
    /// The command failed terminally on the agent.
    Failed(FailedPayload),
    /// Unsolicited session state report, used to repair stale caches.
    Status(StatusPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub agent_id: AgentId,
    pub platform: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub capacity: AgentCapacity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub command_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub command_id: Uuid,
    #[serde(default)]
    pub result: CompletionResult,
}

/// Action-specific completion fields. `start_session`/`wake_session`
/// completions carry the session URL and pod name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPayload {
    pub command_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub session_id: SessionName,
    /// Free-form phase string from the runtime (`Running`, `Pending`, ...).
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Frames the control plane sends to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake acknowledgment carrying the expected heartbeat cadence.
    Registered(RegisteredPayload),
    /// A durable command to execute. Agents must be idempotent on
    /// `command_id`: a replay of an already-completed command is answered
    /// with the prior outcome, not re-executed.
    Command(CommandPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_id: Uuid,
    pub action: CommandAction,
    /// Open key/value map; contents vary by action (`sessionId`, `image`,
    /// env map, ...). Typed accessors live with the reconciler that builds
    /// them.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl ServerFrame {
    /// Serializes the frame to its wire form.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl AgentFrame {
    /// Parses one inbound text frame. Unknown `type` values and missing
    /// required fields are errors; callers discard and count them.
    pub fn from_wire(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

//! Domain types for the stagehand control plane.
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase: validated
//! identifiers, the session/command state machines, and the resource
//! quantity grammar used by requests, capacities, and quotas.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable string identity of a remote platform agent.
///
/// Agents choose their own identifier at registration; an empty identifier
/// is rejected at the boundary.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 253),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct AgentId(String);

/// User identity as carried by the API layer.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 253),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct UserId(String);

/// Name of an installed template.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 253),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct TemplateName(String);

fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Session identifier in the `{user}-{template}-{8hex}` form.
///
/// Lowercase, hyphenated, at most 253 characters. Generated by
/// [`generate_session_name`]; arbitrary values arriving over the API are
/// validated against the same grammar.
#[nutype(
    validate(predicate = is_valid_session_name),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct SessionName(String);

fn sanitize_name_segment(raw: &str) -> String {
    let cleaned: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches('-').to_string()
}

/// Generates a session name `{user}-{template}-{8hex}`.
///
/// User and template segments are lowered and non-alphanumerics collapsed to
/// hyphens; the random suffix makes collisions vanishingly rare (and the
/// store's UNIQUE constraint rejects the rest).
pub fn generate_session_name(user: &UserId, template: &TemplateName) -> SessionName {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = format!(
        "{}-{}-{}",
        sanitize_name_segment(user.as_str()),
        sanitize_name_segment(template.as_str()),
        &suffix[..8]
    );
    let name = if name.len() > 253 {
        let keep = 253 - 9;
        format!("{}-{}", name[..keep].trim_end_matches('-'), &suffix[..8])
    } else {
        name
    };
    SessionName::try_new(name).unwrap_or_else(|_| {
        SessionName::try_new(format!("session-{}", &suffix[..8]))
            .expect("fallback session name is always valid")
    })
}

/// Agent connection status as persisted in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    /// Parses the persisted string form.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(DomainError::UnknownEnumValue {
                kind: "agent status",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a session.
///
/// State is mutated only by the reconciler in response to API intent and
/// agent status messages; `terminated` and `failed` rows are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Running,
    Hibernated,
    Terminated,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Hibernated => "hibernated",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "hibernated" => Ok(Self::Hibernated),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::UnknownEnumValue {
                kind: "session state",
                value: other.to_string(),
            }),
        }
    }

    /// A terminal session no longer consumes quota or agent capacity.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

/// Delivery status of a durable command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
}

impl CommandStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "acknowledged" => Ok(Self::Acknowledged),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::UnknownEnumValue {
                kind: "command status",
                value: other.to_string(),
            }),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Acknowledged => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }

    /// Whether a status update from `self` to `target` moves strictly
    /// forward along `pending -> sent -> acknowledged -> completed`, with
    /// `failed` reachable from any non-terminal status. Anything else is
    /// rejected; callers treat it as a logged no-op.
    #[must_use]
    pub fn can_advance_to(self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if target == Self::Failed {
            return true;
        }
        target.rank() > self.rank()
    }
}

/// Action verbs an agent understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    StartSession,
    StopSession,
    HibernateSession,
    WakeSession,
    UpdateTemplate,
    DeleteTemplate,
}

impl CommandAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::StopSession => "stop_session",
            Self::HibernateSession => "hibernate_session",
            Self::WakeSession => "wake_session",
            Self::UpdateTemplate => "update_template",
            Self::DeleteTemplate => "delete_template",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "start_session" => Ok(Self::StartSession),
            "stop_session" => Ok(Self::StopSession),
            "hibernate_session" => Ok(Self::HibernateSession),
            "wake_session" => Ok(Self::WakeSession),
            "update_template" => Ok(Self::UpdateTemplate),
            "delete_template" => Ok(Self::DeleteTemplate),
            other => Err(DomainError::UnknownEnumValue {
                kind: "command action",
                value: other.to_string(),
            }),
        }
    }
}

/// Domain-level validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown {kind}: {value}")]
    UnknownEnumValue { kind: &'static str, value: String },

    #[error("invalid cpu quantity {value:?}: {reason}")]
    InvalidCpu { value: String, reason: String },

    #[error("invalid memory quantity {value:?}: {reason}")]
    InvalidMemory { value: String, reason: String },
}

/// Parses a CPU quantity into milli-cores.
///
/// Accepts milli-core form (`"500m"`) and whole cores (`"2"`). A rejected
/// parse is a client error, never a session failure.
pub fn parse_cpu_millis(value: &str) -> Result<u64, DomainError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DomainError::InvalidCpu {
            value: value.to_string(),
            reason: "empty quantity".to_string(),
        });
    }
    if let Some(millis) = value.strip_suffix('m') {
        return millis.parse::<u64>().map_err(|e| DomainError::InvalidCpu {
            value: value.to_string(),
            reason: e.to_string(),
        });
    }
    value
        .parse::<u64>()
        .map(|cores| cores * 1000)
        .map_err(|e| DomainError::InvalidCpu {
            value: value.to_string(),
            reason: format!("expected whole cores or milli-cores: {e}"),
        })
}

/// Parses a memory quantity into bytes.
///
/// Accepts binary-unit suffixes `Ki`, `Mi`, `Gi` and plain byte counts.
pub fn parse_memory_bytes(value: &str) -> Result<u64, DomainError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DomainError::InvalidMemory {
            value: value.to_string(),
            reason: "empty quantity".to_string(),
        });
    }
    let (digits, multiplier) = if let Some(d) = value.strip_suffix("Ki") {
        (d, 1024_u64)
    } else if let Some(d) = value.strip_suffix("Mi") {
        (d, 1024 * 1024)
    } else if let Some(d) = value.strip_suffix("Gi") {
        (d, 1024 * 1024 * 1024)
    } else {
        (value, 1)
    };
    let count = digits
        .parse::<u64>()
        .map_err(|e| DomainError::InvalidMemory {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    count
        .checked_mul(multiplier)
        .ok_or_else(|| DomainError::InvalidMemory {
            value: value.to_string(),
            reason: "quantity overflows u64 bytes".to_string(),
        })
}

/// Resources requested for one session, in canonical units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl ResourceSpec {
    /// Parses the API's string quantities (`cpu: "500m"`, `memory: "2Gi"`).
    pub fn parse(cpu: &str, memory: &str) -> Result<Self, DomainError> {
        Ok(Self {
            cpu_millis: parse_cpu_millis(cpu)?,
            memory_bytes: parse_memory_bytes(memory)?,
        })
    }
}

/// Declared capacity of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapacity {
    #[serde(default = "default_max_cpu_millis")]
    pub max_cpu_millis: u64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u64,
}

fn default_max_cpu_millis() -> u64 {
    16_000
}

fn default_max_memory_bytes() -> u64 {
    32 * 1024 * 1024 * 1024
}

fn default_max_sessions() -> u64 {
    50
}

impl Default for AgentCapacity {
    fn default() -> Self {
        Self {
            max_cpu_millis: default_max_cpu_millis(),
            max_memory_bytes: default_max_memory_bytes(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl AgentCapacity {
    /// Whether this capacity admits `request` on top of `used`.
    #[must_use]
    pub fn admits(&self, used: &ResourceUsage, request: &ResourceSpec) -> bool {
        used.sessions < self.max_sessions
            && used.cpu_millis + request.cpu_millis <= self.max_cpu_millis
            && used.memory_bytes + request.memory_bytes <= self.max_memory_bytes
    }
}

/// Aggregated resource consumption (per user or per agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUsage {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub sessions: u64,
}

impl ResourceUsage {
    pub fn add(&mut self, spec: &ResourceSpec) {
        self.cpu_millis += spec.cpu_millis;
        self.memory_bytes += spec.memory_bytes;
        self.sessions += 1;
    }
}

/// Per-user admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub max_cpu_millis: u64,
    pub max_memory_bytes: u64,
    pub max_sessions: u64,
}

impl Default for UserQuota {
    fn default() -> Self {
        Self {
            max_cpu_millis: 8_000,
            max_memory_bytes: 16 * 1024 * 1024 * 1024,
            max_sessions: 10,
        }
    }
}

/// The quota dimension a rejected request exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDimension {
    Cpu,
    Memory,
    Sessions,
}

impl QuotaDimension {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Sessions => "sessions",
        }
    }
}

impl UserQuota {
    /// Checks `used + requested` against every dimension, returning the
    /// first exceeded dimension.
    pub fn admit(&self, used: &ResourceUsage, request: &ResourceSpec) -> Result<(), QuotaDimension> {
        if used.sessions + 1 > self.max_sessions {
            return Err(QuotaDimension::Sessions);
        }
        if used.memory_bytes + request.memory_bytes > self.max_memory_bytes {
            return Err(QuotaDimension::Memory);
        }
        if used.cpu_millis + request.cpu_millis > self.max_cpu_millis {
            return Err(QuotaDimension::Cpu);
        }
        Ok(())
    }
}

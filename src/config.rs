//! Server configuration.
//!
//! One validated struct wires every subsystem. Defaults match the design
//! parameters: 10 s heartbeats with a 3x miss deadline, 10 dispatch
//! workers, a 5-minute repository sync interval.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::DispatcherConfig;
use crate::domain::UserQuota;
use crate::reposync::SyncConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// A configured API user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
    pub admin: bool,
}

/// Authentication settings for the REST surface.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HS256 signing secret for bearer tokens.
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub users: Vec<UserCredential>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl: Duration::from_secs(8 * 3600),
            users: Vec::new(),
        }
    }
}

/// Complete control-plane configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,

    /// Expected agent heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Missed-heartbeat deadline as a multiple of the interval.
    pub heartbeat_timeout_factor: u32,
    /// Per-agent outbound buffer (frames).
    pub channel_buffer: usize,
    /// Bounded wait for one channel write before it counts as a transport
    /// error.
    pub write_timeout: Duration,

    pub dispatcher: DispatcherConfig,
    pub sync: SyncConfig,

    /// Client connections older than this without a heartbeat are swept.
    pub connection_ttl: Duration,
    pub connection_sweep_interval: Duration,

    pub default_namespace: String,
    pub default_quota: UserQuota,
    pub quota_overrides: HashMap<String, UserQuota>,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().expect("static addr parses"),
            database_path: PathBuf::from("./data/stagehand.db"),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout_factor: 3,
            channel_buffer: 64,
            write_timeout: Duration::from_secs(5),
            dispatcher: DispatcherConfig::default(),
            sync: SyncConfig::default(),
            connection_ttl: Duration::from_secs(90),
            connection_sweep_interval: Duration::from_secs(30),
            default_namespace: "default".to_string(),
            default_quota: UserQuota::default(),
            quota_overrides: HashMap::new(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Deadline after which a silent agent is marked suspected.
    #[must_use]
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_timeout_factor.max(1)
    }

    /// Rejects configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth.jwt_secret",
                reason: "must not be empty".to_string(),
            });
        }
        if self.auth.users.is_empty() {
            return Err(ConfigError::Invalid {
                field: "auth.users",
                reason: "at least one user is required".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval",
                reason: "must be positive".to_string(),
            });
        }
        if self.channel_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_buffer",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

//! Connection tracker: transient session-to-client attachments.
//!
//! Each record binds a connection id to exactly one session; a heartbeat
//! claiming a different session is rejected. This is the boundary that
//! stops cross-session keep-alive spoofing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{SessionName, UserId};

/// One client attached to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub session: SessionName,
    pub user: UserId,
    pub client_addr: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Heartbeat rejection reasons.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("connection {0} not found")]
    UnknownConnection(Uuid),

    /// The connection exists but belongs to a different session.
    #[error("connection is bound to another session")]
    SessionMismatch,
}

/// In-memory registry of live client connections.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: DashMap<Uuid, ConnectionRecord>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection record and returns its identifier.
    pub fn add(&self, session: SessionName, user: UserId, client_addr: String) -> ConnectionRecord {
        let record = ConnectionRecord {
            id: Uuid::new_v4(),
            session,
            user,
            client_addr,
            last_heartbeat: Utc::now(),
        };
        self.connections.insert(record.id, record.clone());
        debug!(connection_id = %record.id, session = %record.session, "connection opened");
        record
    }

    /// Removes a connection. Idempotent.
    pub fn remove(&self, connection_id: Uuid) -> bool {
        self.connections.remove(&connection_id).is_some()
    }

    #[must_use]
    pub fn get(&self, connection_id: Uuid) -> Option<ConnectionRecord> {
        self.connections.get(&connection_id).map(|r| r.clone())
    }

    /// Number of live connections attached to `session`.
    #[must_use]
    pub fn count(&self, session: &SessionName) -> usize {
        self.connections
            .iter()
            .filter(|r| r.session == *session)
            .count()
    }

    /// Refreshes the heartbeat for `connection_id`, but only when the
    /// recorded session matches the claimed one.
    pub fn update_heartbeat(
        &self,
        connection_id: Uuid,
        claimed_session: &SessionName,
    ) -> Result<DateTime<Utc>, TrackerError> {
        let mut record = self
            .connections
            .get_mut(&connection_id)
            .ok_or(TrackerError::UnknownConnection(connection_id))?;
        if record.session != *claimed_session {
            return Err(TrackerError::SessionMismatch);
        }
        let now = Utc::now();
        record.last_heartbeat = now;
        Ok(now)
    }

    /// Drops connections whose heartbeat is older than `ttl`. Returns the
    /// removed records so callers can fold them into activity accounting.
    pub fn sweep_stale(&self, ttl: Duration) -> Vec<ConnectionRecord> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let stale: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|r| r.last_heartbeat < cutoff)
            .map(|r| r.id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.connections.remove(&id).map(|(_, record)| record))
            .collect()
    }
}

/// Spawns the periodic stale-connection sweep.
pub fn spawn_connection_sweeper(
    tracker: std::sync::Arc<ConnectionTracker>,
    interval: Duration,
    ttl: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = tracker.sweep_stale(ttl);
            if !removed.is_empty() {
                info!(count = removed.len(), "removed stale client connections");
            }
        }
    })
}

//! Heartbeat liveness monitor.
//!
//! Marks agents suspected when they miss the heartbeat deadline
//! (recommended 3x the heartbeat interval). Suspected is a best-effort
//! mark: the agent stays routable until a send fails or its read loop
//! unregisters it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::AgentHub;

/// Spawns the background sweep. The task runs on a background context and
/// is not tied to any request lifetime; abort the handle on shutdown.
pub fn spawn_heartbeat_monitor(
    hub: Arc<AgentHub>,
    heartbeat_interval: Duration,
    deadline: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let suspected = hub.sweep_stale(deadline);
            if !suspected.is_empty() {
                debug!(count = suspected.len(), "heartbeat sweep marked agents suspected");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;
    use crate::domain::{AgentCapacity, AgentId};
    use crate::hub::channel::fake::FakeChannel;
    use crate::storage::{AgentStore, SqliteAgentStore};

    #[tokio::test]
    async fn monitor_marks_silent_agents_suspected() {
        let db = DatabaseConnection::initialize_in_memory().await.unwrap();
        let store = Arc::new(SqliteAgentStore::new(db));
        let hub = Arc::new(AgentHub::new(store.clone()));

        let id = AgentId::try_new("k8s-1").unwrap();
        store
            .upsert_registration(&id, "kubernetes", None, &AgentCapacity::default())
            .await
            .unwrap();
        hub.register(id.clone(), Arc::new(FakeChannel::new()))
            .await
            .unwrap();

        let handle = spawn_heartbeat_monitor(
            Arc::clone(&hub),
            Duration::from_millis(10),
            Duration::from_millis(0),
        );

        // Give the sweep a couple of ticks to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        // Suspected, but still registered and routable.
        assert!(hub.is_connected(&id));
        assert!(hub.sweep_stale(Duration::from_millis(0)).is_empty());
    }
}

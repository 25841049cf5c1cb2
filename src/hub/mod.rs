//! Agent hub: the live registry of connected agents.
//!
//! One channel per agent identity. A second registration with the same
//! identifier supersedes and closes the first. The hub brokers send and
//! broadcast for the rest of the control plane, stamps liveness, and emits
//! connect/disconnect events the dispatcher uses for replay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::{AgentId, AgentStatus};
use crate::protocol::ServerFrame;
use crate::storage::{AgentStore, StoreResult};

pub mod channel;
pub mod heartbeat;

pub use channel::{AgentChannel, BufferedChannel, ChannelError, Outbound};

/// Registry change notifications, broadcast to interested subsystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    AgentConnected(AgentId),
    AgentDisconnected(AgentId),
}

/// Outcome of a single-agent send.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// No channel registered for the agent; the caller decides whether to
    /// persist and retry later.
    NotConnected,
    /// The write failed; the channel has been unregistered and a
    /// disconnect event emitted.
    TransportError,
}

struct AgentEntry {
    channel: Arc<dyn AgentChannel>,
    generation: u64,
    last_heartbeat: Instant,
    suspected: bool,
}

/// Connection registry and message broker.
pub struct AgentHub {
    agents: DashMap<AgentId, AgentEntry>,
    store: Arc<dyn AgentStore>,
    events: broadcast::Sender<HubEvent>,
    generation: AtomicU64,
    malformed_frames: AtomicU64,
}

impl AgentHub {
    #[must_use]
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            agents: DashMap::new(),
            store,
            events,
            generation: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
        }
    }

    /// Subscribes to connect/disconnect events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Installs `channel` for the agent and marks it online.
    ///
    /// An existing channel for the same identifier is closed first: the new
    /// connection supersedes the old one. Returns a generation token the
    /// owning socket uses in [`Self::unregister_if_current`], so a
    /// superseded socket's teardown cannot remove its successor.
    pub async fn register(
        &self,
        agent_id: AgentId,
        channel: Arc<dyn AgentChannel>,
    ) -> StoreResult<u64> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.agents.insert(
            agent_id.clone(),
            AgentEntry {
                channel,
                generation,
                last_heartbeat: Instant::now(),
                suspected: false,
            },
        );

        if let Some(previous) = previous {
            info!(agent_id = %agent_id, "superseding existing agent connection");
            previous.channel.close().await;
        }

        self.store.set_status(&agent_id, AgentStatus::Online).await?;
        self.store.set_heartbeat(&agent_id, Utc::now()).await?;

        info!(agent_id = %agent_id, generation, "agent connected");
        let _ = self.events.send(HubEvent::AgentConnected(agent_id));
        Ok(generation)
    }

    /// Removes and closes the agent's channel and marks it offline.
    /// Idempotent: unregistering an unknown agent only re-asserts the
    /// offline status.
    pub async fn unregister(&self, agent_id: &AgentId) -> StoreResult<()> {
        if let Some((_, entry)) = self.agents.remove(agent_id) {
            entry.channel.close().await;
            info!(agent_id = %agent_id, "agent disconnected");
            let _ = self.events.send(HubEvent::AgentDisconnected(agent_id.clone()));
        }
        self.store.set_status(agent_id, AgentStatus::Offline).await
    }

    /// Unregisters only if the registered channel still belongs to
    /// `generation`. Socket read loops call this on teardown.
    pub async fn unregister_if_current(
        &self,
        agent_id: &AgentId,
        generation: u64,
    ) -> StoreResult<()> {
        let is_current = self
            .agents
            .get(agent_id)
            .is_some_and(|entry| entry.generation == generation);
        if is_current {
            self.unregister(agent_id).await?;
        } else {
            debug!(agent_id = %agent_id, generation, "stale teardown ignored");
        }
        Ok(())
    }

    /// Writes one frame to the agent's channel.
    ///
    /// A write failure unregisters the agent and emits a disconnect event
    /// so in-flight commands are treated as undelivered.
    pub async fn send(&self, agent_id: &AgentId, frame: &ServerFrame) -> SendOutcome {
        // Clone the handle out of the map; never hold a map ref across an
        // await.
        let Some((channel, generation)) = self
            .agents
            .get(agent_id)
            .map(|entry| (Arc::clone(&entry.channel), entry.generation))
        else {
            return SendOutcome::NotConnected;
        };

        match channel.send_frame(frame).await {
            Ok(()) => SendOutcome::Delivered,
            Err(err) => {
                warn!(agent_id = %agent_id, error = %err, "agent write failed; unregistering");
                if let Err(store_err) = self.unregister_if_current(agent_id, generation).await {
                    warn!(agent_id = %agent_id, error = %store_err, "offline mark failed");
                }
                SendOutcome::TransportError
            }
        }
    }

    /// Sends to every registered agent except `exclude`. Per-recipient
    /// failures are counted, not fatal. Returns (delivered, failed).
    pub async fn broadcast(
        &self,
        frame: &ServerFrame,
        exclude: Option<&AgentId>,
    ) -> (usize, usize) {
        let targets: Vec<AgentId> = self
            .agents
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| Some(id) != exclude)
            .collect();

        let mut delivered = 0;
        let mut failed = 0;
        for agent_id in targets {
            match self.send(&agent_id, frame).await {
                SendOutcome::Delivered => delivered += 1,
                SendOutcome::NotConnected | SendOutcome::TransportError => failed += 1,
            }
        }
        if failed > 0 {
            warn!(delivered, failed, "broadcast finished with failures");
        }
        (delivered, failed)
    }

    /// Stamps the agent's heartbeat and clears any suspected mark.
    pub async fn heartbeat(
        &self,
        agent_id: &AgentId,
        at: chrono::DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            entry.last_heartbeat = Instant::now();
            if entry.suspected {
                info!(agent_id = %agent_id, "suspected agent recovered");
                entry.suspected = false;
            }
        }
        self.store.set_heartbeat(agent_id, at).await
    }

    /// Consistent snapshot of connected agent identifiers. Never blocks on
    /// I/O.
    #[must_use]
    pub fn connected_agents(&self) -> Vec<AgentId> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Marks agents whose heartbeat is older than `timeout` as suspected.
    ///
    /// Best-effort: a suspected agent stays routable until a send fails or
    /// its read loop unregisters it. Returns the newly suspected agents.
    #[must_use]
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<AgentId> {
        let now = Instant::now();
        let mut newly_suspected = Vec::new();
        for mut entry in self.agents.iter_mut() {
            if !entry.suspected && now.duration_since(entry.last_heartbeat) > timeout {
                entry.suspected = true;
                newly_suspected.push(entry.key().clone());
            }
        }
        for agent_id in &newly_suspected {
            warn!(agent_id = %agent_id, timeout_secs = timeout.as_secs(), "agent missed heartbeat deadline");
        }
        newly_suspected
    }

    /// Counts a discarded inbound frame.
    pub fn count_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::channel::fake::FakeChannel;
    use super::*;
    use crate::database::DatabaseConnection;
    use crate::domain::AgentCapacity;
    use crate::protocol::RegisteredPayload;
    use crate::storage::SqliteAgentStore;

    async fn hub() -> (Arc<AgentHub>, Arc<SqliteAgentStore>) {
        let db = DatabaseConnection::initialize_in_memory().await.unwrap();
        let store = Arc::new(SqliteAgentStore::new(db));
        (Arc::new(AgentHub::new(store.clone())), store)
    }

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id).unwrap()
    }

    async fn seed(store: &SqliteAgentStore, id: &AgentId) {
        store
            .upsert_registration(id, "kubernetes", None, &AgentCapacity::default())
            .await
            .unwrap();
    }

    fn test_frame() -> ServerFrame {
        ServerFrame::Registered(RegisteredPayload {
            heartbeat_interval_secs: 10,
        })
    }

    #[tokio::test]
    async fn register_send_unregister_lifecycle() {
        let (hub, store) = hub().await;
        let id = agent("k8s-1");
        seed(&store, &id).await;

        let channel = Arc::new(FakeChannel::new());
        hub.register(id.clone(), channel.clone()).await.unwrap();
        assert!(hub.is_connected(&id));

        assert_eq!(hub.send(&id, &test_frame()).await, SendOutcome::Delivered);
        assert_eq!(channel.sent_frames().len(), 1);

        hub.unregister(&id).await.unwrap();
        assert!(!hub.is_connected(&id));
        assert!(channel.is_closed());
        assert_eq!(hub.send(&id, &test_frame()).await, SendOutcome::NotConnected);
        // Idempotent.
        hub.unregister(&id).await.unwrap();
    }

    #[tokio::test]
    async fn second_registration_supersedes_and_closes_the_first() {
        let (hub, store) = hub().await;
        let id = agent("k8s-1");
        seed(&store, &id).await;

        let first = Arc::new(FakeChannel::new());
        let second = Arc::new(FakeChannel::new());
        let first_generation = hub.register(id.clone(), first.clone()).await.unwrap();
        hub.register(id.clone(), second.clone()).await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());

        // Message reaches the new channel.
        assert_eq!(hub.send(&id, &test_frame()).await, SendOutcome::Delivered);
        assert!(first.sent_frames().is_empty());
        assert_eq!(second.sent_frames().len(), 1);

        // The superseded socket's teardown must not remove its successor.
        hub.unregister_if_current(&id, first_generation).await.unwrap();
        assert!(hub.is_connected(&id));
    }

    #[tokio::test]
    async fn write_failure_unregisters_and_emits_disconnect() {
        let (hub, store) = hub().await;
        let id = agent("k8s-1");
        seed(&store, &id).await;
        let mut events = hub.subscribe();

        let channel = Arc::new(FakeChannel::new());
        channel.fail_sends.store(true, Ordering::Release);
        hub.register(id.clone(), channel).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), HubEvent::AgentConnected(id.clone()));

        assert_eq!(hub.send(&id, &test_frame()).await, SendOutcome::TransportError);
        assert!(!hub.is_connected(&id));
        assert_eq!(
            events.recv().await.unwrap(),
            HubEvent::AgentDisconnected(id.clone())
        );
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_and_counts_failures() {
        let (hub, store) = hub().await;
        let healthy = agent("a-healthy");
        let broken = agent("a-broken");
        let excluded = agent("a-excluded");
        for id in [&healthy, &broken, &excluded] {
            seed(&store, id).await;
        }

        let healthy_channel = Arc::new(FakeChannel::new());
        let broken_channel = Arc::new(FakeChannel::new());
        broken_channel.fail_sends.store(true, Ordering::Release);
        let excluded_channel = Arc::new(FakeChannel::new());

        hub.register(healthy.clone(), healthy_channel.clone()).await.unwrap();
        hub.register(broken.clone(), broken_channel).await.unwrap();
        hub.register(excluded.clone(), excluded_channel.clone()).await.unwrap();

        let (delivered, failed) = hub.broadcast(&test_frame(), Some(&excluded)).await;
        assert_eq!(delivered, 1);
        assert_eq!(failed, 1);
        assert_eq!(healthy_channel.sent_frames().len(), 1);
        assert!(excluded_channel.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_clears_suspected_mark() {
        let (hub, store) = hub().await;
        let id = agent("k8s-1");
        seed(&store, &id).await;
        hub.register(id.clone(), Arc::new(FakeChannel::new())).await.unwrap();

        // Zero timeout: everything is instantly stale.
        let suspected = hub.sweep_stale(Duration::from_secs(0));
        assert_eq!(suspected, vec![id.clone()]);
        // Already suspected agents are not re-reported.
        assert!(hub.sweep_stale(Duration::from_secs(0)).is_empty());

        hub.heartbeat(&id, Utc::now()).await.unwrap();
        // Mark cleared; the agent is suspect-able again.
        assert_eq!(hub.sweep_stale(Duration::from_secs(0)), vec![id.clone()]);

        // Still routable while suspected.
        assert_eq!(hub.send(&id, &test_frame()).await, SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn connected_agents_snapshots_the_registry() {
        let (hub, store) = hub().await;
        for name in ["a-1", "a-2"] {
            let id = agent(name);
            seed(&store, &id).await;
            hub.register(id, Arc::new(FakeChannel::new())).await.unwrap();
        }
        let mut connected = hub.connected_agents();
        connected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(connected.len(), 2);
        assert_eq!(connected[0].as_str(), "a-1");
    }
}

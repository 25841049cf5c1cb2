//! Durable command dispatcher.
//!
//! At-least-once delivery with the store as the source of truth: a command
//! is persisted `pending` before anything else, workers mark it `sent` only
//! after a confirmed channel write, and reconnection replays whatever is
//! still `pending` for the returning agent. Workers are stateless; losing
//! one mid-delivery leaves the row `pending` for the next replay pass.
//!
//! The in-memory queue is bounded. Overflow fails `dispatch` before the
//! command is persisted, pushing back on the API instead of silently
//! dropping work.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{AgentId, CommandStatus};
use crate::hub::{AgentHub, HubEvent, SendOutcome};
use crate::protocol::{CommandPayload, ServerFrame};
use crate::storage::{CommandRecord, CommandStore, NewCommand, StatusAdvance, StoreError};

/// Dispatcher tuning. Worker pool defaults to 10; the queue bound is the
/// API's back-pressure point.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            worker_count: 10,
        }
    }
}

impl DispatcherConfig {
    /// Clamp to at least one worker and a non-zero queue.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.worker_count = self.worker_count.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}

/// Failures surfaced by [`CommandDispatcher::dispatch`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The bounded queue is full. Nothing was persisted; the caller should
    /// retry later.
    #[error("dispatch queue at capacity ({capacity})")]
    QueueFull { capacity: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shared dispatcher state, cloneable into worker tasks.
struct Inner {
    store: Arc<dyn CommandStore>,
    hub: Arc<AgentHub>,
    queue_tx: mpsc::Sender<CommandRecord>,
    queue_rx: Mutex<mpsc::Receiver<CommandRecord>>,
    config: DispatcherConfig,
}

/// Durable work queue in front of the hub.
pub struct CommandDispatcher {
    inner: Arc<Inner>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
    spawned: std::sync::atomic::AtomicUsize,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn CommandStore>,
        hub: Arc<AgentHub>,
        config: DispatcherConfig,
    ) -> Self {
        let config = config.normalized();
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                hub,
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                config,
            }),
            workers: std::sync::Mutex::new(Vec::new()),
            listener: std::sync::Mutex::new(None),
            spawned: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Spawns the worker pool and the reconnect-replay listener, then
    /// replays anything already pending for connected agents (startup
    /// recovery).
    pub async fn start(&self) {
        if self.workers.lock().unwrap().is_empty() {
            self.set_workers(self.inner.config.worker_count);
        }
        {
            let mut listener = self.listener.lock().unwrap();
            if listener.is_none() {
                let inner = Arc::clone(&self.inner);
                *listener = Some(tokio::spawn(async move {
                    inner.reconnect_listener().await;
                }));
            }
        }

        info!(workers = self.worker_count(), "dispatcher started");
        self.dispatch_pending().await;
    }

    /// Resizes the worker pool; clamped to at least one worker.
    ///
    /// Shrinking aborts excess workers. Safe because the store is
    /// authoritative: an aborted delivery leaves its row `pending` for the
    /// next replay pass.
    pub fn set_workers(&self, count: usize) {
        let count = count.max(1);
        let mut workers = self.workers.lock().unwrap();
        while workers.len() > count {
            if let Some(worker) = workers.pop() {
                worker.abort();
            }
        }
        while workers.len() < count {
            let worker_id = self
                .spawned
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker_id).await;
            }));
        }
        info!(workers = workers.len(), "dispatch worker pool sized");
    }

    /// Current worker pool size.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Aborts workers and the replay listener. Safe because the store is
    /// authoritative: an aborted delivery leaves the row `pending`.
    pub fn stop(&self) {
        {
            let mut workers = self.workers.lock().unwrap();
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.abort();
        }
        info!("dispatcher stopped");
    }

    /// Persists the command and queues it for asynchronous delivery.
    ///
    /// Queue admission happens before the insert so an overflowed call
    /// persists nothing.
    #[instrument(skip(self, command), fields(command_id = %command.command_id, agent_id = %command.agent_id, action = command.action.as_str()))]
    pub async fn dispatch(&self, command: NewCommand) -> Result<CommandRecord, DispatchError> {
        let permit = self.inner.queue_tx.try_reserve().map_err(|_| {
            warn!("dispatch queue full; rejecting command");
            DispatchError::QueueFull {
                capacity: self.inner.config.queue_capacity,
            }
        })?;

        let record = self.inner.store.insert(command).await?;
        permit.send(record.clone());
        Ok(record)
    }

    /// Scans the store for pending commands addressed to currently
    /// connected agents and enqueues them. Called on startup and by the
    /// reconnect listener.
    pub async fn dispatch_pending(&self) {
        self.inner.dispatch_pending().await;
    }

    /// Enqueues the agent's pending commands in FIFO creation order.
    pub async fn dispatch_pending_for(&self, agent_id: &AgentId) {
        self.inner.dispatch_pending_for(agent_id).await;
    }

    /// Monotonic status update driven by hub-routed inbound frames.
    ///
    /// Returns the updated record when the status advanced; a non-advancing
    /// update is a logged no-op.
    #[instrument(skip(self), fields(command_id = %command_id, target = target.as_str()))]
    pub async fn update_status(
        &self,
        command_id: Uuid,
        target: CommandStatus,
        error_message: Option<&str>,
    ) -> Result<Option<CommandRecord>, StoreError> {
        match self
            .inner
            .store
            .advance_status(command_id, target, error_message)
            .await?
        {
            StatusAdvance::Advanced(record) => Ok(Some(record)),
            StatusAdvance::Rejected { current } => {
                warn!(current = current.as_str(), "ignoring non-advancing status update");
                Ok(None)
            }
            StatusAdvance::NotFound => {
                warn!("status update for unknown command");
                Ok(None)
            }
        }
    }

    /// Queue introspection: (queued, capacity).
    #[must_use]
    pub fn queue_depth(&self) -> (usize, usize) {
        let capacity = self.inner.config.queue_capacity;
        (capacity - self.inner.queue_tx.capacity(), capacity)
    }
}

impl Inner {
    async fn dispatch_pending(&self) {
        for agent_id in self.hub.connected_agents() {
            self.dispatch_pending_for(&agent_id).await;
        }
    }

    /// Commands that do not fit the queue stay `pending`; the next replay
    /// pass (another reconnect, or startup) picks them up.
    async fn dispatch_pending_for(&self, agent_id: &AgentId) {
        let pending = match self.store.pending_for_agent(agent_id).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(agent_id = %agent_id, error = %err, "pending scan failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let total = pending.len();
        let mut enqueued = 0_usize;
        for record in pending {
            match self.queue_tx.try_reserve() {
                Ok(permit) => {
                    permit.send(record);
                    enqueued += 1;
                }
                Err(_) => {
                    warn!(
                        agent_id = %agent_id,
                        enqueued,
                        total,
                        "queue filled during replay; rest stays pending"
                    );
                    break;
                }
            }
        }
        info!(agent_id = %agent_id, enqueued, total, "replayed pending commands");
    }

    async fn reconnect_listener(self: Arc<Self>) {
        let mut events = self.hub.subscribe();
        loop {
            match events.recv().await {
                Ok(HubEvent::AgentConnected(agent_id)) => {
                    debug!(agent_id = %agent_id, "agent reconnected; replaying pending");
                    self.dispatch_pending_for(&agent_id).await;
                }
                Ok(HubEvent::AgentDisconnected(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed events can only mean missed reconnects; a full
                    // scan covers them.
                    warn!(skipped, "hub event stream lagged; running full replay");
                    self.dispatch_pending().await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "dispatch worker started");
        loop {
            let command = {
                let mut rx = self.queue_rx.lock().await;
                rx.recv().await
            };
            let Some(command) = command else {
                break;
            };
            self.deliver(command).await;
        }
        debug!(worker_id, "dispatch worker stopped");
    }

    /// One delivery attempt. Failure leaves the row `pending`.
    async fn deliver(&self, command: CommandRecord) {
        // Re-read the row: the command may have been delivered already by a
        // previous replay pass, or failed by an operator.
        match self.store.get(command.command_id).await {
            Ok(Some(current)) if current.status == CommandStatus::Pending => {}
            Ok(_) => {
                debug!(command_id = %command.command_id, "skipping non-pending command");
                return;
            }
            Err(err) => {
                warn!(command_id = %command.command_id, error = %err, "pre-delivery read failed");
                return;
            }
        }

        let frame = ServerFrame::Command(CommandPayload {
            command_id: command.command_id,
            action: command.action,
            payload: command.payload.clone(),
        });

        match self.hub.send(&command.agent_id, &frame).await {
            SendOutcome::Delivered => {
                match self
                    .store
                    .advance_status(command.command_id, CommandStatus::Sent, None)
                    .await
                {
                    Ok(StatusAdvance::Advanced(_)) => {
                        debug!(command_id = %command.command_id, "command sent");
                    }
                    Ok(_) => {
                        // A duplicate delivery raced us; agents tolerate
                        // replays by command id.
                        debug!(command_id = %command.command_id, "sent mark superseded");
                    }
                    Err(err) => {
                        warn!(command_id = %command.command_id, error = %err, "sent mark failed");
                    }
                }
            }
            SendOutcome::NotConnected => {
                debug!(
                    command_id = %command.command_id,
                    agent_id = %command.agent_id,
                    "agent not connected; command stays pending"
                );
            }
            SendOutcome::TransportError => {
                warn!(
                    command_id = %command.command_id,
                    agent_id = %command.agent_id,
                    "transport error; command stays pending"
                );
            }
        }
    }
}

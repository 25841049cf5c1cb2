//! In-memory store fakes for unit tests.
//!
//! The dispatcher is polymorphic over its command store; this fake keeps
//! rows in a mutex-guarded map so queue/replay tests run without SQLite.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{AgentId, CommandStatus};

use super::{CommandRecord, CommandStore, NewCommand, StatusAdvance, StoreResult};

/// Mutex-guarded in-memory command store.
#[derive(Default)]
pub struct InMemoryCommandStore {
    rows: Mutex<HashMap<Uuid, CommandRecord>>,
    insert_order: Mutex<Vec<Uuid>>,
}

impl InMemoryCommandStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record, in insertion order.
    pub fn all(&self) -> Vec<CommandRecord> {
        let rows = self.rows.lock().unwrap();
        self.insert_order
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| rows.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl CommandStore for InMemoryCommandStore {
    async fn insert(&self, command: NewCommand) -> StoreResult<CommandRecord> {
        let record = CommandRecord {
            command_id: command.command_id,
            agent_id: command.agent_id,
            session_id: command.session_id,
            action: command.action,
            payload: command.payload,
            status: CommandStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            sent_at: None,
            acknowledged_at: None,
            completed_at: None,
        };
        self.rows
            .lock()
            .unwrap()
            .insert(record.command_id, record.clone());
        self.insert_order.lock().unwrap().push(record.command_id);
        Ok(record)
    }

    async fn get(&self, command_id: Uuid) -> StoreResult<Option<CommandRecord>> {
        Ok(self.rows.lock().unwrap().get(&command_id).cloned())
    }

    async fn pending_for_agent(&self, agent_id: &AgentId) -> StoreResult<Vec<CommandRecord>> {
        let rows = self.rows.lock().unwrap();
        let mut pending: Vec<CommandRecord> = self
            .insert_order
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| rows.get(id))
            .filter(|r| r.agent_id == *agent_id && r.status == CommandStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn agents_with_pending(&self) -> StoreResult<Vec<AgentId>> {
        let rows = self.rows.lock().unwrap();
        let mut agents: Vec<AgentId> = rows
            .values()
            .filter(|r| r.status == CommandStatus::Pending)
            .map(|r| r.agent_id.clone())
            .collect();
        agents.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        agents.dedup();
        Ok(agents)
    }

    async fn advance_status(
        &self,
        command_id: Uuid,
        target: CommandStatus,
        error_message: Option<&str>,
    ) -> StoreResult<StatusAdvance> {
        let mut rows = self.rows.lock().unwrap();
        let Some(record) = rows.get_mut(&command_id) else {
            return Ok(StatusAdvance::NotFound);
        };
        if !record.status.can_advance_to(target) {
            return Ok(StatusAdvance::Rejected {
                current: record.status,
            });
        }
        record.status = target;
        if let Some(message) = error_message {
            record.error_message = Some(message.to_string());
        }
        let now = Utc::now();
        match target {
            CommandStatus::Sent => record.sent_at = Some(now),
            CommandStatus::Acknowledged => record.acknowledged_at = Some(now),
            CommandStatus::Completed | CommandStatus::Failed => {
                record.completed_at = Some(now);
            }
            CommandStatus::Pending => {}
        }
        Ok(StatusAdvance::Advanced(record.clone()))
    }
}

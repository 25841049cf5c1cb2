//! SQLite implementation of the durable command store.
//!
//! The store is the source of truth for delivery: rows stay `pending` until
//! a worker confirms the write to the agent channel, and the monotonic
//! advance never lets an out-of-order frame move a status backwards.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::Row;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::database::DatabaseConnection;
use crate::domain::{AgentId, CommandAction, CommandStatus, SessionName};

use super::{
    CommandRecord, CommandStore, NewCommand, StatusAdvance, StoreResult, corrupt, text_to_ts,
    ts_to_text,
};

const INSERT_COMMAND: &str = r"
INSERT INTO agent_commands (command_id, agent_id, session_id, action, payload_json, status, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6);
";

const SELECT_COMMAND: &str = r"
SELECT command_id, agent_id, session_id, action, payload_json, status, error_message,
       created_at, sent_at, acknowledged_at, completed_at
FROM agent_commands WHERE command_id = ?1;
";

const SELECT_PENDING_FOR_AGENT: &str = r"
SELECT command_id, agent_id, session_id, action, payload_json, status, error_message,
       created_at, sent_at, acknowledged_at, completed_at
FROM agent_commands
WHERE agent_id = ?1 AND status = 'pending'
ORDER BY created_at ASC, id ASC;
";

const SELECT_AGENTS_WITH_PENDING: &str =
    "SELECT DISTINCT agent_id FROM agent_commands WHERE status = 'pending';";

/// Optimistic concurrency: the update applies only if the status is still
/// the one the advance decision was made against.
const ADVANCE_STATUS: &str = r"
UPDATE agent_commands SET
    status = ?3,
    error_message = COALESCE(?4, error_message),
    sent_at = COALESCE(?5, sent_at),
    acknowledged_at = COALESCE(?6, acknowledged_at),
    completed_at = COALESCE(?7, completed_at)
WHERE command_id = ?1 AND status = ?2;
";

/// Command rows backed by the `agent_commands` table.
pub struct SqliteCommandStore {
    connection: DatabaseConnection,
}

impl SqliteCommandStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<CommandRecord> {
        let command_id: String = row.get("command_id");
        let command_id = Uuid::parse_str(&command_id)
            .map_err(|e| corrupt("agent_commands", format!("command_id: {e}")))?;
        let agent_id: String = row.get("agent_id");
        let agent_id = AgentId::try_new(agent_id)
            .map_err(|e| corrupt("agent_commands", format!("agent_id: {e}")))?;
        let session_id: Option<String> = row.get("session_id");
        let session_id = session_id
            .map(|raw| {
                SessionName::try_new(raw)
                    .map_err(|e| corrupt("agent_commands", format!("session_id: {e}")))
            })
            .transpose()?;
        let action: String = row.get("action");
        let action = CommandAction::parse(&action).map_err(|e| corrupt("agent_commands", e))?;
        let status: String = row.get("status");
        let status = CommandStatus::parse(&status).map_err(|e| corrupt("agent_commands", e))?;
        let payload_json: String = row.get("payload_json");
        let payload: Map<String, Value> = serde_json::from_str(&payload_json)
            .map_err(|e| corrupt("agent_commands", format!("payload: {e}")))?;
        let created_at: String = row.get("created_at");

        let optional_ts = |column: &str| -> StoreResult<Option<chrono::DateTime<Utc>>> {
            let raw: Option<String> = row.get(column);
            raw.map(|raw| text_to_ts("agent_commands", &raw)).transpose()
        };

        Ok(CommandRecord {
            command_id,
            agent_id,
            session_id,
            action,
            payload,
            status,
            error_message: row.get("error_message"),
            created_at: text_to_ts("agent_commands", &created_at)?,
            sent_at: optional_ts("sent_at")?,
            acknowledged_at: optional_ts("acknowledged_at")?,
            completed_at: optional_ts("completed_at")?,
        })
    }
}

#[async_trait]
impl CommandStore for SqliteCommandStore {
    #[instrument(skip(self, command), fields(command_id = %command.command_id, agent_id = %command.agent_id))]
    async fn insert(&self, command: NewCommand) -> StoreResult<CommandRecord> {
        let payload_json = serde_json::to_string(&command.payload)
            .map_err(|e| corrupt("agent_commands", format!("payload encode: {e}")))?;
        let created_at = Utc::now();
        sqlx::query(INSERT_COMMAND)
            .bind(command.command_id.to_string())
            .bind(command.agent_id.as_str())
            .bind(command.session_id.as_ref().map(|s| s.as_str()))
            .bind(command.action.as_str())
            .bind(payload_json)
            .bind(ts_to_text(created_at))
            .execute(self.connection.pool())
            .await?;

        Ok(CommandRecord {
            command_id: command.command_id,
            agent_id: command.agent_id,
            session_id: command.session_id,
            action: command.action,
            payload: command.payload,
            status: CommandStatus::Pending,
            error_message: None,
            created_at,
            sent_at: None,
            acknowledged_at: None,
            completed_at: None,
        })
    }

    async fn get(&self, command_id: Uuid) -> StoreResult<Option<CommandRecord>> {
        let row = sqlx::query(SELECT_COMMAND)
            .bind(command_id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn pending_for_agent(&self, agent_id: &AgentId) -> StoreResult<Vec<CommandRecord>> {
        let rows = sqlx::query(SELECT_PENDING_FOR_AGENT)
            .bind(agent_id.as_str())
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn agents_with_pending(&self) -> StoreResult<Vec<AgentId>> {
        let ids: Vec<String> = sqlx::query_scalar(SELECT_AGENTS_WITH_PENDING)
            .fetch_all(self.connection.pool())
            .await?;
        ids.into_iter()
            .map(|raw| {
                AgentId::try_new(raw)
                    .map_err(|e| corrupt("agent_commands", format!("agent_id: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), fields(command_id = %command_id, target = target.as_str()))]
    async fn advance_status(
        &self,
        command_id: Uuid,
        target: CommandStatus,
        error_message: Option<&str>,
    ) -> StoreResult<StatusAdvance> {
        // Retry the optimistic update a couple of times: a concurrent frame
        // may advance the row between our read and write.
        for _ in 0..3 {
            let Some(current) = self.get(command_id).await? else {
                return Ok(StatusAdvance::NotFound);
            };

            if !current.status.can_advance_to(target) {
                return Ok(StatusAdvance::Rejected {
                    current: current.status,
                });
            }

            let now = ts_to_text(Utc::now());
            let sent_at = (target == CommandStatus::Sent).then(|| now.clone());
            let acknowledged_at = (target == CommandStatus::Acknowledged).then(|| now.clone());
            let completed_at = target.is_terminal().then(|| now.clone());

            let result = sqlx::query(ADVANCE_STATUS)
                .bind(command_id.to_string())
                .bind(current.status.as_str())
                .bind(target.as_str())
                .bind(error_message)
                .bind(sent_at)
                .bind(acknowledged_at)
                .bind(completed_at)
                .execute(self.connection.pool())
                .await?;

            if result.rows_affected() > 0 {
                let Some(updated) = self.get(command_id).await? else {
                    return Ok(StatusAdvance::NotFound);
                };
                return Ok(StatusAdvance::Advanced(updated));
            }
            // Lost the race; re-read and re-decide.
        }
        warn!(%command_id, "status advance retry budget exhausted");
        let current = self
            .get(command_id)
            .await?
            .map_or(CommandStatus::Pending, |c| c.status);
        Ok(StatusAdvance::Rejected { current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;

    async fn store() -> SqliteCommandStore {
        let db = DatabaseConnection::initialize_in_memory().await.unwrap();
        SqliteCommandStore::new(db)
    }

    fn new_command(agent: &str) -> NewCommand {
        let mut payload = Map::new();
        payload.insert("sessionId".into(), Value::String("u1-firefox-aa".into()));
        NewCommand {
            command_id: Uuid::new_v4(),
            agent_id: AgentId::try_new(agent).unwrap(),
            session_id: None,
            action: CommandAction::StartSession,
            payload,
        }
    }

    #[tokio::test]
    async fn insert_persists_pending_with_payload() {
        let store = store().await;
        let record = store.insert(new_command("k8s-1")).await.unwrap();
        assert_eq!(record.status, CommandStatus::Pending);

        let loaded = store.get(record.command_id).await.unwrap().unwrap();
        assert_eq!(loaded.action, CommandAction::StartSession);
        assert_eq!(
            loaded.payload.get("sessionId"),
            Some(&Value::String("u1-firefox-aa".into()))
        );
        assert!(loaded.sent_at.is_none());
    }

    #[tokio::test]
    async fn pending_listing_is_fifo_by_creation() {
        let store = store().await;
        let first = store.insert(new_command("k8s-1")).await.unwrap();
        let second = store.insert(new_command("k8s-1")).await.unwrap();
        store.insert(new_command("k8s-2")).await.unwrap();

        let agent = AgentId::try_new("k8s-1").unwrap();
        let pending = store.pending_for_agent(&agent).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].command_id, first.command_id);
        assert_eq!(pending[1].command_id, second.command_id);

        let agents = store.agents_with_pending().await.unwrap();
        assert_eq!(agents.len(), 2);
    }

    #[tokio::test]
    async fn advance_walks_the_lattice_and_stamps_timestamps() {
        let store = store().await;
        let record = store.insert(new_command("k8s-1")).await.unwrap();
        let id = record.command_id;

        let StatusAdvance::Advanced(sent) = store
            .advance_status(id, CommandStatus::Sent, None)
            .await
            .unwrap()
        else {
            panic!("expected advance to sent");
        };
        assert!(sent.sent_at.is_some());

        let StatusAdvance::Advanced(done) = store
            .advance_status(id, CommandStatus::Completed, None)
            .await
            .unwrap()
        else {
            panic!("expected advance to completed");
        };
        assert!(done.completed_at.is_some());

        // Terminal rows reject every further update.
        let outcome = store
            .advance_status(id, CommandStatus::Failed, Some("late"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StatusAdvance::Rejected {
                current: CommandStatus::Completed
            }
        );
        // The command is done; no pending work remains for the agent.
        let agent = AgentId::try_new("k8s-1").unwrap();
        assert!(store.pending_for_agent(&agent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backward_updates_are_no_ops() {
        let store = store().await;
        let record = store.insert(new_command("k8s-1")).await.unwrap();
        store
            .advance_status(record.command_id, CommandStatus::Acknowledged, None)
            .await
            .unwrap();

        let outcome = store
            .advance_status(record.command_id, CommandStatus::Sent, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StatusAdvance::Rejected {
                current: CommandStatus::Acknowledged
            }
        );
    }

    #[tokio::test]
    async fn failure_records_the_error_message() {
        let store = store().await;
        let record = store.insert(new_command("k8s-1")).await.unwrap();
        let StatusAdvance::Advanced(failed) = store
            .advance_status(record.command_id, CommandStatus::Failed, Some("image pull failed"))
            .await
            .unwrap()
        else {
            panic!("expected advance to failed");
        };
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("image pull failed"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let store = store().await;
        let outcome = store
            .advance_status(Uuid::new_v4(), CommandStatus::Sent, None)
            .await
            .unwrap();
        assert_eq!(outcome, StatusAdvance::NotFound);
    }
}

//! SQLite implementation of the agent registry store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use crate::database::DatabaseConnection;
use crate::domain::{AgentCapacity, AgentId, AgentStatus};

use super::{AgentRecord, AgentStore, StoreResult, corrupt, text_to_ts, ts_to_text};

const UPSERT_REGISTRATION: &str = r"
INSERT INTO agents (agent_id, platform, region, status, last_heartbeat, capacity_json, active_sessions)
VALUES (?1, ?2, ?3, 'online', ?4, ?5, 0)
ON CONFLICT (agent_id) DO UPDATE SET
    platform = excluded.platform,
    region = excluded.region,
    status = 'online',
    last_heartbeat = excluded.last_heartbeat,
    capacity_json = excluded.capacity_json;
";

const SET_STATUS: &str = "UPDATE agents SET status = ?2 WHERE agent_id = ?1;";

const SET_HEARTBEAT: &str = "UPDATE agents SET last_heartbeat = ?2 WHERE agent_id = ?1;";

const SELECT_AGENT: &str = r"
SELECT agent_id, platform, region, status, last_heartbeat, capacity_json, active_sessions
FROM agents WHERE agent_id = ?1;
";

const SELECT_ALL: &str = r"
SELECT agent_id, platform, region, status, last_heartbeat, capacity_json, active_sessions
FROM agents ORDER BY agent_id;
";

const SELECT_ONLINE: &str = r"
SELECT agent_id, platform, region, status, last_heartbeat, capacity_json, active_sessions
FROM agents WHERE status = 'online' ORDER BY agent_id;
";

const RECOUNT_ACTIVE: &str = r"
UPDATE agents SET active_sessions = (
    SELECT COUNT(*) FROM sessions
    WHERE sessions.agent_id = agents.agent_id
      AND sessions.state NOT IN ('terminated', 'failed')
)
WHERE agent_id = ?1;
";

const SELECT_ACTIVE_COUNT: &str = "SELECT active_sessions FROM agents WHERE agent_id = ?1;";

/// Agent registry rows backed by the `agents` table.
pub struct SqliteAgentStore {
    connection: DatabaseConnection,
}

impl SqliteAgentStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<AgentRecord> {
        let agent_id: String = row.get("agent_id");
        let agent_id =
            AgentId::try_new(agent_id).map_err(|e| corrupt("agents", format!("agent_id: {e}")))?;
        let status: String = row.get("status");
        let status = AgentStatus::parse(&status).map_err(|e| corrupt("agents", e))?;
        let last_heartbeat: Option<String> = row.get("last_heartbeat");
        let last_heartbeat = last_heartbeat
            .map(|raw| text_to_ts("agents", &raw))
            .transpose()?;
        let capacity_json: String = row.get("capacity_json");
        let capacity: AgentCapacity = serde_json::from_str(&capacity_json)
            .map_err(|e| corrupt("agents", format!("capacity_json: {e}")))?;
        let active_sessions: i64 = row.get("active_sessions");

        Ok(AgentRecord {
            agent_id,
            platform: row.get("platform"),
            region: row.get("region"),
            status,
            last_heartbeat,
            capacity,
            active_sessions: u64::try_from(active_sessions).unwrap_or(0),
        })
    }
}

#[async_trait]
impl AgentStore for SqliteAgentStore {
    #[instrument(skip(self, capacity), fields(agent_id = %agent_id))]
    async fn upsert_registration(
        &self,
        agent_id: &AgentId,
        platform: &str,
        region: Option<&str>,
        capacity: &AgentCapacity,
    ) -> StoreResult<()> {
        let capacity_json = serde_json::to_string(capacity)
            .map_err(|e| corrupt("agents", format!("capacity encode: {e}")))?;
        sqlx::query(UPSERT_REGISTRATION)
            .bind(agent_id.as_str())
            .bind(platform)
            .bind(region)
            .bind(ts_to_text(Utc::now()))
            .bind(capacity_json)
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn set_status(&self, agent_id: &AgentId, status: AgentStatus) -> StoreResult<()> {
        sqlx::query(SET_STATUS)
            .bind(agent_id.as_str())
            .bind(status.as_str())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn set_heartbeat(&self, agent_id: &AgentId, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(SET_HEARTBEAT)
            .bind(agent_id.as_str())
            .bind(ts_to_text(at))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn get(&self, agent_id: &AgentId) -> StoreResult<Option<AgentRecord>> {
        let row = sqlx::query(SELECT_AGENT)
            .bind(agent_id.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(&self) -> StoreResult<Vec<AgentRecord>> {
        let rows = sqlx::query(SELECT_ALL)
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn list_online(&self) -> StoreResult<Vec<AgentRecord>> {
        let rows = sqlx::query(SELECT_ONLINE)
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    #[instrument(skip(self), fields(agent_id = %agent_id))]
    async fn recount_active_sessions(&self, agent_id: &AgentId) -> StoreResult<u64> {
        sqlx::query(RECOUNT_ACTIVE)
            .bind(agent_id.as_str())
            .execute(self.connection.pool())
            .await?;
        let count: Option<i64> = sqlx::query_scalar(SELECT_ACTIVE_COUNT)
            .bind(agent_id.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        Ok(count.map_or(0, |c| u64::try_from(c).unwrap_or(0)))
    }
}

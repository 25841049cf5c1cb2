//! SQLite implementation of the repository store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use crate::database::DatabaseConnection;

use super::{
    RepoAuthType, RepositoryRecord, RepositoryStatus, RepositoryStore, StoreError, StoreResult,
    corrupt, text_to_ts, ts_to_text,
};

const INSERT_REPOSITORY: &str = r"
INSERT INTO repositories (id, name, url, branch, repo_type, auth_type, auth_secret,
                          status, error_message, last_sync, template_count, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, 0, ?9);
";

const SELECT_REPOSITORY: &str = "SELECT * FROM repositories WHERE id = ?1;";

const SELECT_ALL: &str = "SELECT * FROM repositories ORDER BY name;";

const DELETE_REPOSITORY: &str = "DELETE FROM repositories WHERE id = ?1;";

/// The `status != 'syncing'` guard serializes syncs per repository.
const BEGIN_SYNC: &str = r"
UPDATE repositories SET status = 'syncing', error_message = NULL
WHERE id = ?1 AND status != 'syncing';
";

const FINISH_SYNC: &str = r"
UPDATE repositories SET status = ?2, error_message = ?3, last_sync = ?4, template_count = ?5
WHERE id = ?1;
";

/// Repository rows backed by the `repositories` table.
pub struct SqliteRepositoryStore {
    connection: DatabaseConnection,
}

impl SqliteRepositoryStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RepositoryRecord> {
        let id: String = row.get("id");
        let id =
            Uuid::parse_str(&id).map_err(|e| corrupt("repositories", format!("id: {e}")))?;
        let status: String = row.get("status");
        let status = RepositoryStatus::parse(&status).map_err(|e| corrupt("repositories", e))?;
        let auth_type: String = row.get("auth_type");
        let auth_type = RepoAuthType::parse(&auth_type).map_err(|e| corrupt("repositories", e))?;
        let last_sync: Option<String> = row.get("last_sync");
        let last_sync = last_sync
            .map(|raw| text_to_ts("repositories", &raw))
            .transpose()?;
        let created_at: String = row.get("created_at");
        let template_count: i64 = row.get("template_count");

        Ok(RepositoryRecord {
            id,
            name: row.get("name"),
            url: row.get("url"),
            branch: row.get("branch"),
            repo_type: row.get("repo_type"),
            auth_type,
            auth_secret: row.get("auth_secret"),
            status,
            error_message: row.get("error_message"),
            last_sync,
            template_count: u64::try_from(template_count).unwrap_or(0),
            created_at: text_to_ts("repositories", &created_at)?,
        })
    }
}

#[async_trait]
impl RepositoryStore for SqliteRepositoryStore {
    #[instrument(skip(self, repo), fields(repo = %repo.name))]
    async fn insert(&self, repo: &RepositoryRecord) -> StoreResult<()> {
        let result = sqlx::query(INSERT_REPOSITORY)
            .bind(repo.id.to_string())
            .bind(&repo.name)
            .bind(&repo.url)
            .bind(&repo.branch)
            .bind(&repo.repo_type)
            .bind(repo.auth_type.as_str())
            .bind(repo.auth_secret.as_deref())
            .bind(repo.status.as_str())
            .bind(ts_to_text(repo.created_at))
            .execute(self.connection.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                StoreError::Conflict(format!("repository {} already exists", repo.name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<RepositoryRecord>> {
        let row = sqlx::query(SELECT_REPOSITORY)
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list(&self) -> StoreResult<Vec<RepositoryRecord>> {
        let rows = sqlx::query(SELECT_ALL)
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(DELETE_REPOSITORY)
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_begin_sync(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(BEGIN_SYNC)
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(repo_id = %id, status = status.as_str()))]
    async fn finish_sync(
        &self,
        id: Uuid,
        status: RepositoryStatus,
        error_message: Option<&str>,
        template_count: u64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(FINISH_SYNC)
            .bind(id.to_string())
            .bind(status.as_str())
            .bind(error_message)
            .bind(ts_to_text(at))
            .bind(i64::try_from(template_count).unwrap_or(i64::MAX))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}

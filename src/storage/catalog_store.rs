//! SQLite implementation of the catalog, installed templates, and favorites.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use crate::database::DatabaseConnection;
use crate::domain::{TemplateName, UserId};

use super::{
    CatalogEntry, CatalogFilter, CatalogStore, InstallStatus, StoreResult, TemplateRecord, corrupt,
    text_to_ts, ts_to_text,
};

const DELETE_FOR_REPOSITORY: &str = "DELETE FROM catalog_templates WHERE repository_id = ?1;";

const INSERT_ENTRY: &str = r"
INSERT INTO catalog_templates (id, repository_id, name, display_name, description, category,
                               app_type, icon_url, manifest, tags, install_count, install_status)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);
";

const SELECT_ENTRY: &str = "SELECT * FROM catalog_templates WHERE id = ?1;";

const SET_INSTALL_STATUS: &str =
    "UPDATE catalog_templates SET install_status = ?2 WHERE id = ?1;";

const INCREMENT_INSTALLS: &str =
    "UPDATE catalog_templates SET install_count = install_count + 1 WHERE id = ?1;";

const UPSERT_TEMPLATE: &str = r"
INSERT INTO templates (name, display_name, image, platform, app_type, manifest, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT (name) DO UPDATE SET
    display_name = excluded.display_name,
    image = excluded.image,
    platform = excluded.platform,
    app_type = excluded.app_type,
    manifest = excluded.manifest;
";

const SELECT_TEMPLATE: &str = "SELECT * FROM templates WHERE name = ?1;";

const SELECT_TEMPLATES: &str = "SELECT * FROM templates ORDER BY name;";

const DELETE_TEMPLATE: &str = "DELETE FROM templates WHERE name = ?1;";

const ADD_FAVORITE: &str = r"
INSERT OR IGNORE INTO user_template_favorites (user_id, template_name, favorited_at)
VALUES (?1, ?2, ?3);
";

const REMOVE_FAVORITE: &str =
    "DELETE FROM user_template_favorites WHERE user_id = ?1 AND template_name = ?2;";

const SELECT_FAVORITES: &str = r"
SELECT template_name FROM user_template_favorites
WHERE user_id = ?1 ORDER BY favorited_at DESC;
";

/// Catalog rows backed by `catalog_templates`, `templates`, and
/// `user_template_favorites`.
pub struct SqliteCatalogStore {
    connection: DatabaseConnection,
}

impl SqliteCatalogStore {
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_entry(row: &sqlx::sqlite::SqliteRow) -> StoreResult<CatalogEntry> {
        let id: String = row.get("id");
        let id = Uuid::parse_str(&id)
            .map_err(|e| corrupt("catalog_templates", format!("id: {e}")))?;
        let repository_id: String = row.get("repository_id");
        let repository_id = Uuid::parse_str(&repository_id)
            .map_err(|e| corrupt("catalog_templates", format!("repository_id: {e}")))?;
        let manifest: String = row.get("manifest");
        let manifest = serde_json::from_str(&manifest)
            .map_err(|e| corrupt("catalog_templates", format!("manifest: {e}")))?;
        let tags: String = row.get("tags");
        let tags: Vec<String> = serde_json::from_str(&tags)
            .map_err(|e| corrupt("catalog_templates", format!("tags: {e}")))?;
        let install_status: String = row.get("install_status");
        let install_status =
            InstallStatus::parse(&install_status).map_err(|e| corrupt("catalog_templates", e))?;
        let install_count: i64 = row.get("install_count");

        Ok(CatalogEntry {
            id,
            repository_id,
            name: row.get("name"),
            display_name: row.get("display_name"),
            description: row.get("description"),
            category: row.get("category"),
            app_type: row.get("app_type"),
            icon_url: row.get("icon_url"),
            manifest,
            tags,
            install_count: u64::try_from(install_count).unwrap_or(0),
            install_status,
        })
    }

    fn parse_template(row: &sqlx::sqlite::SqliteRow) -> StoreResult<TemplateRecord> {
        let name: String = row.get("name");
        let name = TemplateName::try_new(name)
            .map_err(|e| corrupt("templates", format!("name: {e}")))?;
        let manifest: String = row.get("manifest");
        let manifest = serde_json::from_str(&manifest)
            .map_err(|e| corrupt("templates", format!("manifest: {e}")))?;
        let created_at: String = row.get("created_at");

        Ok(TemplateRecord {
            name,
            display_name: row.get("display_name"),
            image: row.get("image"),
            platform: row.get("platform"),
            app_type: row.get("app_type"),
            manifest,
            created_at: text_to_ts("templates", &created_at)?,
        })
    }

    /// Entry matches every requested tag (AND semantics).
    fn matches_tags(entry: &CatalogEntry, wanted: &[String]) -> bool {
        wanted
            .iter()
            .all(|tag| entry.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
    }

    fn matches_search(entry: &CatalogEntry, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        entry.name.to_ascii_lowercase().contains(&needle)
            || entry.display_name.to_ascii_lowercase().contains(&needle)
            || entry.description.to_ascii_lowercase().contains(&needle)
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    #[instrument(skip(self, entries), fields(repo_id = %repository_id, count = entries.len()))]
    async fn replace_for_repository(
        &self,
        repository_id: Uuid,
        entries: &[CatalogEntry],
    ) -> StoreResult<()> {
        let mut tx = self.connection.pool().begin().await?;

        sqlx::query(DELETE_FOR_REPOSITORY)
            .bind(repository_id.to_string())
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            let manifest = serde_json::to_string(&entry.manifest)
                .map_err(|e| corrupt("catalog_templates", format!("manifest encode: {e}")))?;
            let tags = serde_json::to_string(&entry.tags)
                .map_err(|e| corrupt("catalog_templates", format!("tags encode: {e}")))?;
            sqlx::query(INSERT_ENTRY)
                .bind(entry.id.to_string())
                .bind(repository_id.to_string())
                .bind(&entry.name)
                .bind(&entry.display_name)
                .bind(&entry.description)
                .bind(&entry.category)
                .bind(&entry.app_type)
                .bind(entry.icon_url.as_deref())
                .bind(manifest)
                .bind(tags)
                .bind(i64::try_from(entry.install_count).unwrap_or(0))
                .bind(entry.install_status.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_entry(&self, id: Uuid) -> StoreResult<Option<CatalogEntry>> {
        let row = sqlx::query(SELECT_ENTRY)
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_entry).transpose()
    }

    async fn list_entries(&self, filter: &CatalogFilter) -> StoreResult<Vec<CatalogEntry>> {
        // Filters compose in memory; the catalog is small and the tag/search
        // predicates don't map cleanly onto SQL against JSON columns.
        let rows = sqlx::query("SELECT * FROM catalog_templates;")
            .fetch_all(self.connection.pool())
            .await?;
        let mut entries: Vec<CatalogEntry> = rows
            .iter()
            .map(Self::parse_entry)
            .collect::<StoreResult<_>>()?;

        if let Some(category) = &filter.category {
            entries.retain(|e| e.category.eq_ignore_ascii_case(category));
        }
        if let Some(search) = &filter.search {
            entries.retain(|e| Self::matches_search(e, search));
        }
        if !filter.tags.is_empty() {
            entries.retain(|e| Self::matches_tags(e, &filter.tags));
        }

        match filter.sort.as_deref() {
            Some("installs") => {
                entries.sort_by(|a, b| b.install_count.cmp(&a.install_count));
            }
            _ => entries.sort_by(|a, b| a.name.cmp(&b.name)),
        }

        Ok(entries)
    }

    async fn set_install_status(&self, id: Uuid, status: InstallStatus) -> StoreResult<()> {
        sqlx::query(SET_INSTALL_STATUS)
            .bind(id.to_string())
            .bind(status.as_str())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn increment_install_count(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(INCREMENT_INSTALLS)
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, template), fields(template = %template.name))]
    async fn put_template(&self, template: &TemplateRecord) -> StoreResult<()> {
        let manifest = serde_json::to_string(&template.manifest)
            .map_err(|e| corrupt("templates", format!("manifest encode: {e}")))?;
        sqlx::query(UPSERT_TEMPLATE)
            .bind(template.name.as_str())
            .bind(&template.display_name)
            .bind(&template.image)
            .bind(&template.platform)
            .bind(&template.app_type)
            .bind(manifest)
            .bind(ts_to_text(template.created_at))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn get_template(&self, name: &TemplateName) -> StoreResult<Option<TemplateRecord>> {
        let row = sqlx::query(SELECT_TEMPLATE)
            .bind(name.as_str())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_template).transpose()
    }

    async fn list_templates(&self) -> StoreResult<Vec<TemplateRecord>> {
        let rows = sqlx::query(SELECT_TEMPLATES)
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::parse_template).collect()
    }

    async fn delete_template(&self, name: &TemplateName) -> StoreResult<bool> {
        let result = sqlx::query(DELETE_TEMPLATE)
            .bind(name.as_str())
            .execute(self.connection.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_favorite(&self, user: &UserId, template: &TemplateName) -> StoreResult<()> {
        sqlx::query(ADD_FAVORITE)
            .bind(user.as_str())
            .bind(template.as_str())
            .bind(ts_to_text(Utc::now()))
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn remove_favorite(&self, user: &UserId, template: &TemplateName) -> StoreResult<bool> {
        let result = sqlx::query(REMOVE_FAVORITE)
            .bind(user.as_str())
            .bind(template.as_str())
            .execute(self.connection.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_favorites(&self, user: &UserId) -> StoreResult<Vec<TemplateName>> {
        let names: Vec<String> = sqlx::query_scalar(SELECT_FAVORITES)
            .bind(user.as_str())
            .fetch_all(self.connection.pool())
            .await?;
        names
            .into_iter()
            .map(|raw| {
                TemplateName::try_new(raw)
                    .map_err(|e| corrupt("user_template_favorites", format!("name: {e}")))
            })
            .collect()
    }
}

//! Repository synchronizer: keeps the catalog in sync with external Git
//! repositories.
//!
//! One sync: mark `syncing`, bring the clone up to date, walk the tree for
//! manifests, replace the repository's catalog entries in a single
//! transaction, then record `synced` (or `failed` with a message). A timer
//! syncs everything on an interval; API-triggered syncs run detached so a
//! closed request cannot cancel them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::storage::{
    CatalogEntry, CatalogStore, RepositoryRecord, RepositoryStatus, RepositoryStore, StoreError,
};

pub mod git;
pub mod manifest;

use manifest::{PluginManifest, TemplateManifest};

/// Synchronizer tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Where clones live, one subdirectory per repository id.
    pub cache_dir: PathBuf,
    /// Interval for the sync-all timer.
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./data/repos"),
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("repository not found")]
    NotFound,

    /// Another sync is already in flight for this repository.
    #[error("repository sync already in progress")]
    AlreadySyncing,

    #[error(transparent)]
    Git(#[from] git::GitError),

    #[error("manifest walk failed: {0}")]
    Walk(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SyncError> for crate::error::ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound => Self::NotFound("repository not found".to_string()),
            SyncError::AlreadySyncing => Self::Conflict(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

/// Result of one completed sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub entries: usize,
    pub skipped: usize,
}

/// Drives repository syncs against the repo and catalog stores.
///
/// Cheap to clone: stores sit behind `Arc`s, so detached sync tasks carry
/// their own handle.
#[derive(Clone)]
pub struct RepositorySynchronizer {
    repositories: Arc<dyn RepositoryStore>,
    catalog: Arc<dyn CatalogStore>,
    config: SyncConfig,
}

impl RepositorySynchronizer {
    #[must_use]
    pub fn new(
        repositories: Arc<dyn RepositoryStore>,
        catalog: Arc<dyn CatalogStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            repositories,
            catalog,
            config,
        }
    }

    /// Syncs one repository end to end. Serialized per repository via the
    /// `syncing` status transition.
    #[instrument(skip(self), fields(repo_id = %repo_id))]
    pub async fn sync_repository(&self, repo_id: Uuid) -> Result<SyncReport, SyncError> {
        let Some(repo) = self.repositories.get(repo_id).await? else {
            return Err(SyncError::NotFound);
        };
        if !self.repositories.try_begin_sync(repo_id).await? {
            return Err(SyncError::AlreadySyncing);
        }

        let outcome = self.fetch_and_import(&repo).await;
        match outcome {
            Ok(report) => {
                self.repositories
                    .finish_sync(
                        repo_id,
                        RepositoryStatus::Synced,
                        None,
                        report.entries as u64,
                        Utc::now(),
                    )
                    .await?;
                info!(repo = %repo.name, entries = report.entries, skipped = report.skipped, "repository synced");
                Ok(report)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(repo = %repo.name, error = %message, "repository sync failed");
                self.repositories
                    .finish_sync(
                        repo_id,
                        RepositoryStatus::Failed,
                        Some(&message),
                        repo.template_count,
                        Utc::now(),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// Syncs every repository; per-repository failures are recorded on the
    /// repository row and do not stop the pass.
    pub async fn sync_all(&self) {
        let repositories = match self.repositories.list().await {
            Ok(repositories) => repositories,
            Err(err) => {
                warn!(error = %err, "sync pass skipped: repository listing failed");
                return;
            }
        };
        for repo in repositories {
            match self.sync_repository(repo.id).await {
                Ok(_) | Err(SyncError::AlreadySyncing) => {}
                Err(err) => debug!(repo = %repo.name, error = %err, "sync failed"),
            }
        }
    }

    /// Spawns a detached sync for one repository. Used by the API trigger:
    /// the request returns 202 and the work survives the request context.
    pub fn trigger_detached(&self, repo_id: Uuid) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.sync_repository(repo_id).await {
                debug!(repo_id = %repo_id, error = %err, "detached sync failed");
            }
        });
    }

    /// Spawns the periodic sync-all timer.
    pub fn spawn_scheduler(&self) -> JoinHandle<()> {
        let this = self.clone();
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first tick; startup already has enough to
            // do.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.sync_all().await;
            }
        })
    }

    async fn fetch_and_import(&self, repo: &RepositoryRecord) -> Result<SyncReport, SyncError> {
        let worktree = git::sync_worktree(repo, &self.config.cache_dir).await?;
        self.import_tree(repo, &worktree).await
    }

    /// Parses the working tree and transactionally replaces the
    /// repository's catalog entries. Exposed separately so the import path
    /// is testable without a Git remote.
    pub async fn import_tree(
        &self,
        repo: &RepositoryRecord,
        worktree: &Path,
    ) -> Result<SyncReport, SyncError> {
        let repo_for_walk = repo.clone();
        let root = worktree.to_path_buf();
        // Tree walking and YAML parsing are blocking work.
        let (entries, skipped) =
            tokio::task::spawn_blocking(move || collect_manifests(&root, &repo_for_walk))
                .await
                .map_err(|e| SyncError::Walk(std::io::Error::other(e)))??;

        self.catalog
            .replace_for_repository(repo.id, &entries)
            .await?;
        Ok(SyncReport {
            entries: entries.len(),
            skipped,
        })
    }
}

/// Walks the tree collecting manifests. Unparseable or non-template files
/// are skipped (counted); an I/O error aborts the sync.
fn collect_manifests(
    root: &Path,
    repo: &RepositoryRecord,
) -> Result<(Vec<CatalogEntry>, usize), std::io::Error> {
    let mut entries = Vec::new();
    let mut skipped = 0_usize;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for item in std::fs::read_dir(&dir)? {
            let item = item?;
            let path = item.path();
            if path.is_dir() {
                if item.file_name() == ".git" {
                    continue;
                }
                stack.push(path);
                continue;
            }

            if repo.repo_type == "plugin" {
                if item.file_name() == "manifest.json" {
                    let src = std::fs::read_to_string(&path)?;
                    match PluginManifest::parse_json(&src) {
                        Ok(plugin) => entries.push(plugin.to_catalog_entry(repo.id)),
                        Err(reason) => {
                            skipped += 1;
                            debug!(path = %path.display(), %reason, "skipping plugin manifest");
                        }
                    }
                }
                continue;
            }

            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                continue;
            }
            let src = std::fs::read_to_string(&path)?;
            match TemplateManifest::parse_yaml(&src) {
                Ok(template) => entries.push(template.to_catalog_entry(repo.id)),
                Err(reason) => {
                    skipped += 1;
                    debug!(path = %path.display(), %reason, "skipping manifest");
                }
            }
        }
    }

    Ok((entries, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConnection;
    use crate::storage::{
        CatalogFilter, RepoAuthType, SqliteCatalogStore, SqliteRepositoryStore,
    };
    use tempfile::TempDir;

    const TEMPLATE: &str = r"
apiVersion: streaming.dev/v1
kind: Template
metadata:
  name: {name}
  category: apps
spec:
  image: ghcr.io/example/{name}:latest
";

    fn write_template(dir: &Path, name: &str) {
        let body = TEMPLATE.replace("{name}", name);
        std::fs::write(dir.join(format!("{name}.yaml")), body).unwrap();
    }

    async fn fixture() -> (Arc<RepositorySynchronizer>, Arc<SqliteCatalogStore>, RepositoryRecord, TempDir) {
        let db = DatabaseConnection::initialize_in_memory().await.unwrap();
        let repositories = Arc::new(SqliteRepositoryStore::new(db.clone()));
        let catalog = Arc::new(SqliteCatalogStore::new(db));

        let repo = RepositoryRecord {
            id: Uuid::new_v4(),
            name: "base".into(),
            url: "https://git.example/base.git".into(),
            branch: "main".into(),
            repo_type: "template".into(),
            auth_type: RepoAuthType::None,
            auth_secret: None,
            status: RepositoryStatus::Pending,
            error_message: None,
            last_sync: None,
            template_count: 0,
            created_at: Utc::now(),
        };
        repositories.insert(&repo).await.unwrap();

        let tree = TempDir::new().unwrap();
        let synchronizer = Arc::new(RepositorySynchronizer::new(
            repositories,
            catalog.clone(),
            SyncConfig {
                cache_dir: tree.path().join("cache"),
                interval: Duration::from_secs(3600),
            },
        ));
        (synchronizer, catalog, repo, tree)
    }

    #[tokio::test]
    async fn import_collects_valid_templates_and_skips_invalid() {
        let (synchronizer, catalog, repo, tree) = fixture().await;

        for name in ["firefox", "chromium", "blender", "krita", "gimp"] {
            write_template(tree.path(), name);
        }
        std::fs::write(tree.path().join("broken.yaml"), "kind: Deployment\n").unwrap();
        std::fs::write(tree.path().join("README.md"), "# not a manifest").unwrap();

        // Nested directories are walked; .git is not.
        let nested = tree.path().join("extra");
        std::fs::create_dir_all(&nested).unwrap();
        write_template(&nested, "inkscape");
        let git_dir = tree.path().join(".git");
        std::fs::create_dir_all(&git_dir).unwrap();
        std::fs::write(git_dir.join("config.yaml"), "kind: Template\n").unwrap();

        let report = synchronizer.import_tree(&repo, tree.path()).await.unwrap();
        assert_eq!(report.entries, 6);
        assert_eq!(report.skipped, 1);

        let listed = catalog.list_entries(&CatalogFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 6);
        assert!(listed.iter().all(|e| e.repository_id == repo.id));
    }

    #[tokio::test]
    async fn reimport_replaces_rather_than_merges() {
        let (synchronizer, catalog, repo, tree) = fixture().await;
        write_template(tree.path(), "firefox");
        write_template(tree.path(), "blender");
        synchronizer.import_tree(&repo, tree.path()).await.unwrap();

        std::fs::remove_file(tree.path().join("blender.yaml")).unwrap();
        let report = synchronizer.import_tree(&repo, tree.path()).await.unwrap();
        assert_eq!(report.entries, 1);

        let listed = catalog.list_entries(&CatalogFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "firefox");

        // Idempotent under no change.
        let again = synchronizer.import_tree(&repo, tree.path()).await.unwrap();
        assert_eq!(again.entries, 1);
        assert_eq!(
            catalog.list_entries(&CatalogFilter::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn plugin_repositories_accept_manifest_json_only() {
        let (synchronizer, catalog, mut repo, tree) = fixture().await;
        repo.repo_type = "plugin".into();

        let plugin_dir = tree.path().join("pdf-viewer");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("manifest.json"),
            r#"{"name": "pdf-viewer", "version": "1.0.0"}"#,
        )
        .unwrap();
        // Template YAML in a plugin repo is ignored.
        write_template(tree.path(), "firefox");

        let report = synchronizer.import_tree(&repo, tree.path()).await.unwrap();
        assert_eq!(report.entries, 1);
        let listed = catalog.list_entries(&CatalogFilter::default()).await.unwrap();
        assert_eq!(listed[0].name, "pdf-viewer");
        assert_eq!(listed[0].app_type, "webapp");
    }

    #[tokio::test]
    async fn missing_repository_is_not_found() {
        let (synchronizer, _catalog, _repo, _tree) = fixture().await;
        assert!(matches!(
            synchronizer.sync_repository(Uuid::new_v4()).await,
            Err(SyncError::NotFound)
        ));
    }
}

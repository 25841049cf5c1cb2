//! Server bootstrap: construct every subsystem, spawn background tasks,
//! and serve the API.
//!
//! The hub and dispatcher are process-wide singletons by construction, but
//! they are explicit objects threaded through handler state, never
//! ambient globals; tests wire the same shape with fakes or tempdir
//! databases.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, AppState, auth::AuthService};
use crate::config::ServerConfig;
use crate::database::{DatabaseConfig, DatabaseConnection};
use crate::dispatcher::CommandDispatcher;
use crate::hub::{AgentHub, heartbeat::spawn_heartbeat_monitor};
use crate::reconciler::{QuotaPolicy, SessionReconciler};
use crate::reposync::RepositorySynchronizer;
use crate::storage::{
    SqliteAgentStore, SqliteCatalogStore, SqliteCommandStore, SqliteRepositoryStore,
    SqliteSessionStore,
};
use crate::tracker::{ConnectionTracker, spawn_connection_sweeper};

/// A running control plane: handler state plus its background tasks.
pub struct AppContext {
    pub state: AppState,
    tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Stops background tasks and the dispatcher worker pool.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state.dispatcher.stop();
    }
}

/// Builds and starts every subsystem against the configured database.
pub async fn bootstrap(config: ServerConfig) -> anyhow::Result<AppContext> {
    config.validate().context("configuration invalid")?;

    let db = DatabaseConnection::initialize(DatabaseConfig::new(&config.database_path))
        .await
        .context("database initialization failed")?;

    let agents = Arc::new(SqliteAgentStore::new(db.clone()));
    let sessions = Arc::new(SqliteSessionStore::new(db.clone()));
    let commands = Arc::new(SqliteCommandStore::new(db.clone()));
    let repositories = Arc::new(SqliteRepositoryStore::new(db.clone()));
    let catalog = Arc::new(SqliteCatalogStore::new(db));

    let hub = Arc::new(AgentHub::new(agents.clone()));
    let dispatcher = Arc::new(CommandDispatcher::new(
        commands,
        Arc::clone(&hub),
        config.dispatcher.clone(),
    ));
    let reconciler = Arc::new(SessionReconciler::new(
        sessions.clone(),
        agents.clone(),
        catalog.clone(),
        Arc::clone(&dispatcher),
        Arc::clone(&hub),
        QuotaPolicy::new(config.default_quota, config.quota_overrides.clone()),
        config.default_namespace.clone(),
    ));
    let tracker = Arc::new(ConnectionTracker::new());
    let synchronizer = Arc::new(RepositorySynchronizer::new(
        repositories.clone(),
        catalog.clone(),
        config.sync.clone(),
    ));
    let auth = Arc::new(AuthService::new(&config.auth));

    // Subscribers must exist before the first agent connects; start the
    // dispatcher (and its reconnect listener) ahead of serving.
    dispatcher.start().await;

    let tasks = vec![
        spawn_heartbeat_monitor(
            Arc::clone(&hub),
            config.heartbeat_interval,
            config.heartbeat_deadline(),
        ),
        spawn_connection_sweeper(
            Arc::clone(&tracker),
            config.connection_sweep_interval,
            config.connection_ttl,
        ),
        synchronizer.spawn_scheduler(),
    ];

    let state = AppState {
        hub,
        dispatcher,
        reconciler,
        tracker,
        sessions,
        agents,
        catalog,
        repositories,
        synchronizer,
        auth,
        config: Arc::new(config),
    };

    Ok(AppContext { state, tasks })
}

/// Resolves when the process receives ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

/// Bootstraps and serves until a shutdown signal arrives, then stops
/// accepting, aborts background tasks, and drains the dispatcher pool.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let listen_addr = config.listen_addr;
    let mut context = bootstrap(config).await?;
    let app = api::router(context.state.clone());

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(%listen_addr, "control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // In-flight requests have finished; tear down the background work.
    context.shutdown();
    info!("control plane stopped");
    Ok(())
}

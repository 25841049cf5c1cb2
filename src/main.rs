//! Stagehand server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use stagehand::config::{AuthConfig, ServerConfig, UserCredential};
use stagehand::dispatcher::DispatcherConfig;
use stagehand::reposync::SyncConfig;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "stagehand", version, about = "Control-plane dispatch fabric for container streaming sessions")]
struct Cli {
    /// Address for the REST/WebSocket listener.
    #[arg(long, default_value = "127.0.0.1:8080", env = "STAGEHAND_LISTEN")]
    listen: SocketAddr,

    /// SQLite database path.
    #[arg(long, default_value = "./data/stagehand.db", env = "STAGEHAND_DATABASE")]
    database: PathBuf,

    /// Directory for repository clones.
    #[arg(long, default_value = "./data/repos", env = "STAGEHAND_REPO_CACHE")]
    repo_cache: PathBuf,

    /// Dispatch worker pool size.
    #[arg(long, default_value_t = 10)]
    dispatch_workers: usize,

    /// Bounded dispatch queue capacity.
    #[arg(long, default_value_t = 256)]
    dispatch_queue: usize,

    /// Expected agent heartbeat interval, seconds.
    #[arg(long, default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Repository sync interval, seconds.
    #[arg(long, default_value_t = 300)]
    sync_interval_secs: u64,

    /// HS256 signing secret for bearer tokens.
    #[arg(long, env = "STAGEHAND_JWT_SECRET")]
    jwt_secret: String,

    /// Bootstrap admin username.
    #[arg(long, default_value = "admin", env = "STAGEHAND_ADMIN_USER")]
    admin_user: String,

    /// Bootstrap admin password.
    #[arg(long, env = "STAGEHAND_ADMIN_PASSWORD")]
    admin_password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stagehand=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    info!(listen = %cli.listen, database = %cli.database.display(), "starting stagehand control plane");

    let config = ServerConfig {
        listen_addr: cli.listen,
        database_path: cli.database,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
        dispatcher: DispatcherConfig {
            queue_capacity: cli.dispatch_queue,
            worker_count: cli.dispatch_workers,
        },
        sync: SyncConfig {
            cache_dir: cli.repo_cache,
            interval: Duration::from_secs(cli.sync_interval_secs),
        },
        auth: AuthConfig {
            jwt_secret: cli.jwt_secret,
            users: vec![UserCredential {
                username: cli.admin_user,
                password: cli.admin_password,
                admin: true,
            }],
            ..AuthConfig::default()
        },
        ..ServerConfig::default()
    };

    stagehand::server::run(config).await
}

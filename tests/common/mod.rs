//! Shared fixtures for integration tests: a bootstrapped control plane on
//! a tempdir database, a recording agent channel, and JSON request
//! helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

use stagehand::api::router;
use stagehand::config::{AuthConfig, ServerConfig, UserCredential};
use stagehand::reposync::SyncConfig;
use stagehand::domain::{AgentCapacity, AgentId, TemplateName};
use stagehand::hub::{AgentChannel, ChannelError};
use stagehand::protocol::ServerFrame;
use stagehand::server::{AppContext, bootstrap};
use stagehand::storage::TemplateRecord;

/// Records frames the control plane writes to an "agent".
#[derive(Default)]
pub struct RecordingChannel {
    pub sent: Mutex<Vec<ServerFrame>>,
    pub fail_sends: AtomicBool,
    pub closed: AtomicBool,
}

impl RecordingChannel {
    pub fn sent_frames(&self) -> Vec<ServerFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn command_ids(&self) -> Vec<uuid::Uuid> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| match frame {
                ServerFrame::Command(command) => Some(command.command_id),
                ServerFrame::Registered(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl AgentChannel for RecordingChannel {
    async fn send_frame(&self, frame: &ServerFrame) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(ChannelError::Timeout(Duration::from_millis(1)));
        }
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A bootstrapped control plane plus its router and auth tokens.
pub struct TestApp {
    pub context: AppContext,
    pub router: Router,
    pub admin_token: String,
    pub user_token: String,
    _dir: TempDir,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = ServerConfig {
            database_path: dir.path().join("control.db"),
            sync: SyncConfig {
                cache_dir: dir.path().join("repos"),
                interval: Duration::from_secs(3600),
            },
            auth: AuthConfig {
                jwt_secret: "integration-test-secret".into(),
                token_ttl: Duration::from_secs(3600),
                users: vec![
                    UserCredential {
                        username: "admin".into(),
                        password: "admin-pw".into(),
                        admin: true,
                    },
                    UserCredential {
                        username: "u1".into(),
                        password: "u1-pw".into(),
                        admin: false,
                    },
                ],
            },
            ..ServerConfig::default()
        };

        let context = bootstrap(config).await.expect("bootstrap");
        let router = router(context.state.clone());

        let admin_token = login(&router, "admin", "admin-pw").await;
        let user_token = login(&router, "u1", "u1-pw").await;

        Self {
            context,
            router,
            admin_token,
            user_token,
            _dir: dir,
        }
    }

    /// Registers an online agent backed by a recording channel.
    pub async fn connect_agent(&self, id: &str) -> (AgentId, Arc<RecordingChannel>) {
        let agent_id = AgentId::try_new(id).unwrap();
        self.context
            .state
            .agents
            .upsert_registration(&agent_id, "kubernetes", None, &AgentCapacity::default())
            .await
            .unwrap();
        let channel = Arc::new(RecordingChannel::default());
        self.context
            .state
            .hub
            .register(agent_id.clone(), channel.clone())
            .await
            .unwrap();
        (agent_id, channel)
    }

    /// Installs a template usable for session creation.
    pub async fn seed_template(&self, name: &str) {
        self.context
            .state
            .catalog
            .put_template(&TemplateRecord {
                name: TemplateName::try_new(name).unwrap(),
                display_name: name.to_string(),
                image: format!("ghcr.io/example/{name}:latest"),
                platform: "kubernetes".into(),
                app_type: "desktop".into(),
                manifest: serde_json::json!({"kind": "Template"}),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    /// Creates a session over REST and drives it to `running` by
    /// completing the start command recorded on `channel`.
    pub async fn create_running_session(
        &self,
        token: &str,
        agent_id: &AgentId,
        channel: &Arc<RecordingChannel>,
    ) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/sessions",
                Some(token),
                Some(serde_json::json!({
                    "template": "firefox",
                    "resources": {"memory": "1Gi", "cpu": "500m"}
                })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED, "create failed: {body}");
        let name = body["name"].as_str().unwrap().to_string();

        let command_id = self.wait_for_command(channel, &name).await;
        self.context
            .state
            .reconciler
            .handle_agent_frame(
                agent_id,
                stagehand::protocol::AgentFrame::Complete(stagehand::protocol::CompletePayload {
                    command_id,
                    result: stagehand::protocol::CompletionResult {
                        session_url: Some(format!("http://stream.example/{name}")),
                        pod_name: None,
                        extra: serde_json::Map::new(),
                    },
                }),
            )
            .await
            .unwrap();
        name
    }

    /// Waits for the start command addressed at `session` to reach the
    /// channel and returns its id.
    pub async fn wait_for_command(
        &self,
        channel: &Arc<RecordingChannel>,
        session: &str,
    ) -> uuid::Uuid {
        for _ in 0..200 {
            let found = channel.sent_frames().iter().find_map(|frame| match frame {
                ServerFrame::Command(c)
                    if c.payload.get("sessionId").and_then(Value::as_str) == Some(session) =>
                {
                    Some(c.command_id)
                }
                _ => None,
            });
            if let Some(id) = found {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("command for session {session} never delivered");
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        read_json(response).await
    }
}

async fn login(router: &Router, username: &str, password: &str) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "username": username, "password": password }).to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["token"].as_str().unwrap().to_string()
}

async fn read_json(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Polls until `predicate` holds or the budget runs out.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

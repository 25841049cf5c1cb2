//! Agent WebSocket endpoint.
//!
//! One socket per agent. The first inbound frame must be `register`; after
//! that the socket splits into a write task draining the agent's buffered
//! outbound channel and a read loop routing inbound frames. A read deadline
//! of the heartbeat timeout unregisters silent agents.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::AgentId;
use crate::hub::{AgentChannel, BufferedChannel, Outbound};
use crate::protocol::{AgentFrame, RegisteredPayload, ServerFrame};

use super::AppState;

/// Upgrade handler for `GET /agents/ws`.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // All writes funnel through one task, which also serializes concurrent
    // hub senders.
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.channel_buffer);
    let write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Handshake: the agent must introduce itself before anything routes.
    let handshake_deadline = state.config.heartbeat_deadline();
    let registration = tokio::time::timeout(handshake_deadline, ws_receiver.next()).await;
    let register = match registration {
        Ok(Some(Ok(Message::Text(text)))) => match AgentFrame::from_wire(text.as_str()) {
            Ok(AgentFrame::Register(register)) => register,
            Ok(_) | Err(_) => {
                warn!("agent socket sent a non-register first frame; closing");
                write_task.abort();
                return;
            }
        },
        _ => {
            debug!("agent socket closed before registration");
            write_task.abort();
            return;
        }
    };
    let agent_id = register.agent_id.clone();

    if let Err(err) = state
        .agents
        .upsert_registration(
            &agent_id,
            &register.platform,
            register.region.as_deref(),
            &register.capacity,
        )
        .await
    {
        warn!(agent_id = %agent_id, error = %err, "agent registration persist failed");
        write_task.abort();
        return;
    }

    let channel = Arc::new(BufferedChannel::new(tx, state.config.write_timeout));
    let generation = match state.hub.register(agent_id.clone(), channel.clone()).await {
        Ok(generation) => generation,
        Err(err) => {
            warn!(agent_id = %agent_id, error = %err, "hub registration failed");
            write_task.abort();
            return;
        }
    };

    // Handshake ack carries the expected cadence.
    let ack = ServerFrame::Registered(RegisteredPayload {
        heartbeat_interval_secs: state.config.heartbeat_interval.as_secs(),
    });
    if channel.send_frame(&ack).await.is_err() {
        let _ = state.hub.unregister_if_current(&agent_id, generation).await;
        return;
    }

    info!(agent_id = %agent_id, platform = %register.platform, "agent socket established");
    read_loop(&state, &agent_id, &mut ws_receiver).await;

    if let Err(err) = state.hub.unregister_if_current(&agent_id, generation).await {
        warn!(agent_id = %agent_id, error = %err, "agent teardown failed");
    }
    // Superseded sockets keep their write task until the hub closes the
    // channel; dropping the receiver ends it either way.
}

/// Reads frames until the socket closes or the read deadline passes.
async fn read_loop(
    state: &AppState,
    agent_id: &AgentId,
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) {
    let read_deadline = state.config.heartbeat_deadline();
    loop {
        let next = match tokio::time::timeout(read_deadline, receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!(agent_id = %agent_id, "read deadline missed; dropping agent connection");
                return;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => match AgentFrame::from_wire(text.as_str()) {
                Ok(frame) => {
                    if let Err(err) = state.reconciler.handle_agent_frame(agent_id, frame).await {
                        warn!(agent_id = %agent_id, error = %err, "inbound frame handling failed");
                    }
                }
                Err(err) => {
                    // Malformed frames are discarded and counted, never
                    // fatal to the connection.
                    state.hub.count_malformed_frame();
                    warn!(agent_id = %agent_id, error = %err, "discarding malformed frame");
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                state.hub.count_malformed_frame();
                warn!(agent_id = %agent_id, "discarding unexpected binary frame");
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!(agent_id = %agent_id, "agent socket closed");
                return;
            }
            Some(Err(err)) => {
                debug!(agent_id = %agent_id, error = %err, "agent socket read error");
                return;
            }
        }
    }
}

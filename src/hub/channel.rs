//! Per-agent outbound channel abstraction.
//!
//! The hub is polymorphic over the transport: it only needs a framed
//! write-and-close pair per agent. The production implementation buffers
//! frames into an mpsc queue drained by the socket's write task, which also
//! serializes concurrent senders so frames never interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ServerFrame;

/// Transport-level write failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("frame serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One agent's write side. Implementations must be safe to share across
/// tasks; the hub clones the handle for concurrent senders.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Writes one frame. A full buffer is given a short bounded wait; an
    /// expired wait or a gone peer is an error the hub treats as a
    /// transport failure.
    async fn send_frame(&self, frame: &ServerFrame) -> Result<(), ChannelError>;

    /// Closes the channel. Idempotent; used when a new registration
    /// supersedes this one.
    async fn close(&self);
}

/// Message handed to the socket write task.
#[derive(Debug)]
pub enum Outbound {
    /// Serialized frame to write as one text message.
    Frame(String),
    /// Close the socket and end the write task.
    Close,
}

/// Production channel: bounded queue into the socket write task.
pub struct BufferedChannel {
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    write_timeout: Duration,
}

impl BufferedChannel {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>, write_timeout: Duration) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
            write_timeout,
        }
    }
}

#[async_trait]
impl AgentChannel for BufferedChannel {
    async fn send_frame(&self, frame: &ServerFrame) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let wire = frame.to_wire()?;

        // Fast path first; fall back to a bounded wait when the buffer is
        // full so a stalled agent cannot wedge a dispatch worker.
        match self.tx.try_send(Outbound::Frame(wire)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
            Err(mpsc::error::TrySendError::Full(message)) => {
                match self.tx.send_timeout(message, self.write_timeout).await {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                        Err(ChannelError::Timeout(self.write_timeout))
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(ChannelError::Closed),
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Best effort: if the buffer is full the write task dies with the
        // sender anyway.
        let _ = self.tx.try_send(Outbound::Close);
    }
}

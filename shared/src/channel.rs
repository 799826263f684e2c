//! Serialized sender for one control channel.
//!
//! Many workers (accept loops, read pumps, request handlers) write to the
//! same control connection. They never touch the socket directly: every
//! message goes through a bounded queue drained by a single writer task,
//! so frames cannot interleave and a slow control connection pushes back
//! on the pumps feeding it.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::frame;
use crate::protocol::ControlMessage;
use crate::{Error, Result};

/// Default queue depth between workers and the writer task
pub const DEFAULT_CAPACITY: usize = 256;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A frame waiting for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// JSON control message, sent as a text frame
    Text(String),
    /// Binary streaming frame
    Binary(Bytes),
    /// Close the control connection after flushing what is queued
    Close,
}

#[derive(Debug, Clone)]
pub struct ControlSender {
    id: u64,
    tx: mpsc::Sender<Outbound>,
}

impl ControlSender {
    /// Create a sender and the receiving end its writer task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    /// Process-unique id of this control connection
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn same_channel(&self, other: &ControlSender) -> bool {
        self.id == other.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn send(&self, out: Outbound) -> Result<()> {
        self.tx.send(out).await.map_err(|_| Error::ChannelClosed)
    }

    pub async fn send_message(&self, msg: &ControlMessage) -> Result<()> {
        self.send(Outbound::Text(msg.to_json()?)).await
    }

    pub async fn send_frame(&self, connection_id: &str, payload: &[u8]) -> Result<()> {
        self.send(Outbound::Binary(frame::encode(connection_id, payload)?))
            .await
    }

    /// Ask the writer task to close the connection
    pub async fn close(&self) {
        let _ = self.tx.send(Outbound::Close).await;
    }
}

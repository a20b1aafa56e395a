//! The outbound half of a connection.
//!
//! Every producer (the actor, the heartbeat) writes through an `Outbox`; a
//! single writer task owns the socket sink. Once the connection is closed the
//! outbox silently drops further sends.

use super::protocol::ServerMessage;
use crate::error::CloseReason;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    Close(CloseReason),
}

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Queues `message`; returns false once the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        !self.closed.is_cancelled() && self.tx.send(Outbound::Message(message)).is_ok()
    }

    pub fn ping(&self) -> bool {
        !self.closed.is_cancelled() && self.tx.send(Outbound::Ping).is_ok()
    }

    /// Sends a close frame and stops accepting messages.
    pub fn close(&self, reason: CloseReason) {
        if !self.closed.is_cancelled() {
            let _ = self.tx.send(Outbound::Close(reason));
            self.closed.cancel();
        }
    }

    /// Marks the connection closed without a close frame (the peer went away).
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// A token cancelled together with the connection.
    pub fn child_token(&self) -> CancellationToken {
        self.closed.child_token()
    }
}

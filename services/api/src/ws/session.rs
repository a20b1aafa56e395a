//! Manages the WebSocket connection lifecycle for a companion session.
//!
//! The handshake credential is checked right after the upgrade. A failed check
//! closes the socket with a dedicated code and no session is ever created.
//! Otherwise the connection is split: a writer task owns the sink, the reader
//! loop feeds the actor's mailbox, and the actor runs in its own task.

use super::actor::{SessionActor, SessionEvent};
use super::outbox::{Outbound, Outbox};
use super::protocol::{ClientMessage, ServerMessage};
use crate::error::CloseReason;
use crate::registry::{Liveness, SessionHandle};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header},
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

const BUSY: &str = "Still working on your earlier messages, please resend that one in a moment";

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
///
/// The session token comes from the `token` query parameter or a bearer
/// `Authorization` header.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = params
        .token
        .or_else(|| bearer_token(&headers))
        .unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, token))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: String) {
    let (sink, stream) = socket.split();
    serve_connection(sink, stream, state, token).await;
}

/// Runs one connection from handshake to teardown over any frame sink and stream.
#[instrument(name = "ws_session", skip_all, fields(session_id, user_id))]
async fn serve_connection<W, R>(mut sink: W, stream: R, state: Arc<AppState>, token: String)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: std::error::Error + Send + Sync + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let claims = match state.verifier.verify(&token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(error = %e, "Handshake authentication failed");
            let _ = sink
                .send(close_message(CloseReason::AuthenticationFailed))
                .await;
            return;
        }
    };
    let expires_at = match claims.expires_at() {
        Ok(at) => at,
        Err(e) => {
            warn!(error = %e, "Handshake credential has no usable expiry");
            let _ = sink
                .send(close_message(CloseReason::AuthenticationFailed))
                .await;
            return;
        }
    };

    let session_id = Uuid::new_v4();
    let span = tracing::Span::current();
    span.record("session_id", session_id.to_string());
    span.record("user_id", claims.sub.as_str());
    info!(%expires_at, "WebSocket connection authenticated");

    let (outbox, outbound_rx) = Outbox::new();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, outbox.child_token()).in_current_span());

    let (mailbox_tx, mailbox_rx) = mpsc::channel(state.engine.mailbox_capacity);
    let liveness = Arc::new(Liveness::new());
    let actor = SessionActor::new(
        session_id,
        claims.sub.clone(),
        state.clone(),
        outbox.clone(),
        liveness.clone(),
        mailbox_tx.clone(),
        expires_at,
    );
    let handle = Arc::new(SessionHandle::new(
        session_id,
        claims.sub,
        liveness.clone(),
        actor.observe_state(),
        mailbox_tx.clone(),
        outbox.clone(),
    ));
    state.registry.register(handle);

    let actor_task = tokio::spawn(actor.run(mailbox_rx).in_current_span());

    read_loop(stream, &mailbox_tx, &outbox, &liveness).await;

    outbox.mark_closed();
    drop(mailbox_tx);
    if let Err(e) = actor_task.await {
        error!(error = ?e, "Session actor task failed");
    }
    state.registry.deregister(session_id);
    drop(outbox);
    if let Err(e) = writer.await {
        error!(error = ?e, "Writer task failed");
    }
    info!("WebSocket connection closed");
}

/// Feeds inbound frames into the mailbox until the peer leaves or the session closes.
///
/// The reader never waits on the mailbox. Pongs and close frames are handled
/// here, so a busy actor cannot make a live peer look dead. A frame that finds
/// the mailbox full is answered with an `error` envelope and dropped.
async fn read_loop<R>(
    mut stream: R,
    mailbox: &mpsc::Sender<SessionEvent>,
    outbox: &Outbox,
    liveness: &Liveness,
) where
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut backlogged = false;
    loop {
        let frame = tokio::select! {
            _ = outbox.closed() => break,
            frame = stream.next() => frame,
        };
        let event = match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => SessionEvent::Client(message),
                Err(e) => SessionEvent::Malformed(e.to_string()),
            },
            Some(Ok(Message::Binary(data))) => SessionEvent::BinaryAudio(data.to_vec()),
            Some(Ok(Message::Pong(_))) => {
                liveness.record_pong();
                continue;
            }
            Some(Ok(Message::Ping(_))) => continue,
            Some(Ok(Message::Close(_))) => {
                info!("Client sent close frame");
                break;
            }
            Some(Err(e)) => {
                warn!(error = ?e, "Error receiving from client WebSocket");
                break;
            }
            None => break,
        };
        match mailbox.try_send(event) {
            Ok(()) => backlogged = false,
            Err(TrySendError::Full(_)) => {
                if !backlogged {
                    warn!("Session mailbox full, dropping client frames");
                }
                backlogged = true;
                outbox.send(ServerMessage::error(BUSY));
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Actor has stopped, ending reader");
                break;
            }
        }
    }
}

/// Owns the sink. Ends after a close frame, once the connection is marked
/// closed and the queue is flushed, or once every outbox is dropped.
async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closed: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    loop {
        let item = tokio::select! {
            biased;
            item = outbound.recv() => item,
            _ = closed.cancelled() => outbound.try_recv().ok(),
        };
        let Some(item) = item else { break };
        let result = match item {
            Outbound::Message(message) => send_json(&mut sink, &message).await,
            Outbound::Ping => sink.send(Message::Ping(Default::default())).await.map_err(Into::into),
            Outbound::Close(reason) => {
                debug!(code = reason.code(), "Sending close frame");
                let _ = sink.send(close_message(reason)).await;
                break;
            }
        };
        if let Err(e) = result {
            warn!(error = ?e, "Failed to write to client WebSocket");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn send_json<W, T>(sink: &mut W, message: &T) -> Result<()>
where
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
    T: serde::Serialize,
{
    let serialized = serde_json::to_string(message)?;
    sink.send(Message::Text(serialized.into())).await?;
    Ok(())
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.description().into(),
    }))
}

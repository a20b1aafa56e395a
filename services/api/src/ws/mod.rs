//! WebSocket Session Engine
//!
//! - `protocol`: the JSON envelopes exchanged with the client.
//! - `session`: connection lifecycle, from handshake to teardown.
//! - `actor`: the per-session actor and message router.
//! - `audio`: utterance buffering and the commit procedure.
//! - `turn`: the conversation turn orchestrator.
//! - `proactive`: per-session timers for autonomous messages.
//! - `reaper`: engine-wide heartbeat and idle sweep.

pub mod actor;
pub mod audio;
pub mod outbox;
pub mod proactive;
pub mod protocol;
pub mod reaper;
pub mod session;
mod turn;

#[cfg(test)]
mod testing;

pub use session::ws_handler;

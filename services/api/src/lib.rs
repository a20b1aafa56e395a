//! Companion API Library Crate
//!
//! Everything behind the companion web service: configuration, persistence,
//! authentication, the connection registry, the WebSocket session engine and
//! the HTTP routes. The binaries are thin wrappers around this library.

pub mod audio_utils;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod integrations;
pub mod models;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;

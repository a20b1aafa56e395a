//! Transport-agnostic building blocks of the companion session engine.

pub mod filters;
pub mod llm_client;
pub mod patterns;
pub mod retry;
pub mod speech;
pub mod state_machine;
pub mod tools;

pub use state_machine::{BotState, StateMachine, Transition, TransitionError};

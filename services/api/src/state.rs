//! Shared Application State
//!
//! `AppState` holds the engine-wide collaborators every session draws on. It
//! is created once at startup and shared behind an `Arc`.

use crate::auth::CredentialVerifier;
use crate::config::EngineConfig;
use crate::db::ConversationStore;
use crate::registry::ConnectionRegistry;
use companion_core::filters::NoiseFilter;
use companion_core::llm_client::LLMClient;
use companion_core::speech::{Synthesizer, Transcriber};
use companion_core::tools::ToolServiceFactory;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EngineConfig>,
    pub llm_client: Arc<dyn LLMClient>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub conversations: Arc<dyn ConversationStore>,
    pub tool_factory: Arc<dyn ToolServiceFactory>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub noise: Arc<NoiseFilter>,
    pub system_prompt: Arc<String>,
    pub registry: Arc<ConnectionRegistry>,
}

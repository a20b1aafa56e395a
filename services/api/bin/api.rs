//! Main Entrypoint for the Companion API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Initializing shared services (LLM, speech, credentials, integrations).
//! 4. Starting the heartbeat and idle reaper.
//! 5. Constructing the Axum router and serving it until shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use companion_api::{
    auth::JwtVerifier,
    config::Config,
    db::Db,
    integrations::CredentialBackedFactory,
    registry::ConnectionRegistry,
    router::create_router,
    state::AppState,
    ws,
};
use companion_core::{
    filters::NoiseFilter,
    llm_client::OpenAICompatibleClient,
    speech::{OpenAISynthesizer, OpenAITranscriber},
    tools::http::HttpGateway,
};
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal(reaper: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
    reaper.cancel();
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize Shared Services ---
    let prompts = load_prompts(&config.prompts_path)?;
    let system_prompt = Arc::new(
        prompts
            .get("system_prompt")
            .context("system_prompt.md not found in prompts directory")?
            .clone(),
    );

    let api_key = config
        .provider_api_key()
        .context("No API key configured for the selected provider")?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(config.provider.api_base());
    info!(provider = ?config.provider, "LLM provider selected.");

    let engine = Arc::new(config.engine.clone());
    let registry = Arc::new(ConnectionRegistry::new());

    let app_state = Arc::new(AppState {
        engine: engine.clone(),
        llm_client: Arc::new(OpenAICompatibleClient::new(
            openai_config.clone(),
            config.chat_model.clone(),
        )),
        transcriber: Arc::new(OpenAITranscriber::new(
            openai_config.clone(),
            config.transcription_model.clone(),
        )),
        synthesizer: Arc::new(OpenAISynthesizer::new(openai_config, &config.tts_voice)),
        conversations: db.clone(),
        tool_factory: Arc::new(CredentialBackedFactory::new(
            db,
            HttpGateway::new(config.integrations_base_url.clone()),
        )),
        verifier: Arc::new(JwtVerifier::new(config.session_token_secret.as_bytes())),
        noise: Arc::new(NoiseFilter::with_defaults()),
        system_prompt,
        registry: registry.clone(),
    });

    // --- 5. Start the Reaper ---
    let reaper_shutdown = CancellationToken::new();
    let reaper = ws::reaper::spawn(registry, engine, reaper_shutdown.clone());

    // --- 6. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 7. Start Server ---
    info!(
        model = %config.chat_model,
        voice = %config.tts_voice,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(reaper_shutdown))
    .await?;

    reaper.await.context("Reaper task panicked")?;
    info!("Server has shut down.");
    Ok(())
}

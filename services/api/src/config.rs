use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported backend providers for the language model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    pub fn api_base(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1/",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

/// Timers and thresholds of the proactive scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct ProactiveConfig {
    pub greeting_delay: Duration,
    pub task_check_interval: Duration,
    pub event_check_interval: Duration,
    /// How long before an event starts its reminder fires.
    pub event_reminder_lead: Duration,
    pub idle_animation_interval: Duration,
    /// Micro-animations only play after this much quiet.
    pub idle_animation_after: Duration,
    pub break_reminder_interval: Duration,
    pub suggestion_interval: Duration,
    pub suggestion_min_uses: u32,
    /// Local hours `[start, end)` during which break reminders are allowed.
    pub work_hours: (u32, u32),
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            greeting_delay: Duration::from_secs(2),
            task_check_interval: Duration::from_secs(30 * 60),
            event_check_interval: Duration::from_secs(5 * 60),
            event_reminder_lead: Duration::from_secs(10 * 60),
            idle_animation_interval: Duration::from_secs(45),
            idle_animation_after: Duration::from_secs(60),
            break_reminder_interval: Duration::from_secs(50 * 60),
            suggestion_interval: Duration::from_secs(15 * 60),
            suggestion_min_uses: 3,
            work_hours: (9, 18),
        }
    }
}

/// Tunables of the session engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub greeting_cooldown: Duration,
    pub duplicate_window: Duration,
    pub min_audio_bytes: usize,
    pub max_audio_bytes: usize,
    /// Sample rate assumed for raw PCM16 input.
    pub input_sample_rate: u32,
    /// PCM16 utterances quieter than this RMS level are treated as silence.
    pub silence_threshold: f32,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_pongs: u32,
    pub sweep_interval: Duration,
    pub external_call_timeout: Duration,
    pub external_call_attempts: u32,
    /// Messages kept in memory per session.
    pub history_capacity: usize,
    /// Most recent messages sent to the model each turn.
    pub context_window: usize,
    pub dedup_capacity: usize,
    pub state_history_limit: usize,
    pub mailbox_capacity: usize,
    pub speaking_ms_per_char: u64,
    pub speaking_min: Duration,
    pub speaking_max: Duration,
    pub proactive: ProactiveConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            greeting_cooldown: Duration::from_secs(10),
            duplicate_window: Duration::from_secs(8),
            min_audio_bytes: 8192,
            max_audio_bytes: 10 * 1024 * 1024,
            input_sample_rate: 24_000,
            silence_threshold: 0.003,
            idle_timeout: Duration::from_secs(900),
            heartbeat_interval: Duration::from_secs(30),
            max_missed_pongs: 2,
            sweep_interval: Duration::from_secs(60),
            external_call_timeout: Duration::from_secs(20),
            external_call_attempts: 2,
            history_capacity: 100,
            context_window: 20,
            dedup_capacity: 256,
            state_history_limit: 64,
            mailbox_capacity: 64,
            speaking_ms_per_char: 60,
            speaking_min: Duration::from_secs(1),
            speaking_max: Duration::from_secs(20),
            proactive: ProactiveConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Applies the tunable overrides present in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut engine = Self::default();
        engine.greeting_cooldown = secs_var("GREETING_COOLDOWN_SECS", engine.greeting_cooldown)?;
        engine.duplicate_window = secs_var("DUPLICATE_WINDOW_SECS", engine.duplicate_window)?;
        engine.min_audio_bytes = parsed_var("MIN_AUDIO_BYTES", engine.min_audio_bytes)?;
        engine.idle_timeout = secs_var("IDLE_TIMEOUT_SECS", engine.idle_timeout)?;
        engine.heartbeat_interval = secs_var("HEARTBEAT_INTERVAL_SECS", engine.heartbeat_interval)?;
        engine.external_call_timeout =
            secs_var("EXTERNAL_CALL_TIMEOUT_SECS", engine.external_call_timeout)?;
        if let Ok(hours) = std::env::var("WORK_HOURS") {
            engine.proactive.work_hours = parse_work_hours(&hours)
                .ok_or_else(|| ConfigError::InvalidValue("WORK_HOURS".to_string(), hours))?;
        }
        if engine.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "HEARTBEAT_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        Ok(engine)
    }

    /// How long the bot stays in `speaking` for a reply of `chars` characters.
    pub fn speaking_duration(&self, chars: usize) -> Duration {
        let proportional = Duration::from_millis(self.speaking_ms_per_char.saturating_mul(chars as u64));
        proportional.clamp(self.speaking_min, self.speaking_max.max(self.speaking_min))
    }
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parsed_var(name, default.as_secs()).map(Duration::from_secs)
}

/// Parses `"9-18"` into `(9, 18)`.
fn parse_work_hours(raw: &str) -> Option<(u32, u32)> {
    let (start, end) = raw.split_once('-')?;
    let start: u32 = start.trim().parse().ok()?;
    let end: u32 = end.trim().parse().ok()?;
    (start < end && end <= 24).then_some((start, end))
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub transcription_model: String,
    pub tts_voice: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub session_token_secret: String,
    pub integrations_base_url: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let provider_str = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "gemini" => Provider::Gemini,
            _ => Provider::OpenAI,
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let transcription_model =
            std::env::var("TRANSCRIPTION_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        let tts_voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "alloy".to_string());
        if companion_core::speech::parse_voice(&tts_voice).is_none() {
            return Err(ConfigError::InvalidValue(
                "TTS_VOICE".to_string(),
                format!("'{}' is not a known voice", tts_voice),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let session_token_secret = std::env::var("SESSION_TOKEN_SECRET")
            .map_err(|_| ConfigError::MissingVar("SESSION_TOKEN_SECRET".to_string()))?;
        let integrations_base_url = std::env::var("INTEGRATIONS_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8081".to_string());

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        let engine = EngineConfig::from_env()?;

        Ok(Self {
            bind_address,
            database_url,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            transcription_model,
            tts_voice,
            log_level,
            prompts_path,
            session_token_secret,
            integrations_base_url,
            engine,
        })
    }

    /// The API key of the configured provider.
    pub fn provider_api_key(&self) -> Option<&str> {
        match self.provider {
            Provider::OpenAI => self.openai_api_key.as_deref(),
            Provider::Gemini => self.gemini_api_key.as_deref(),
        }
    }
}

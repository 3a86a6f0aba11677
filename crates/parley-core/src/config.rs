//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;

/// Top-level Parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- LLM ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Providers in failover order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Maximum LLM rounds per reply; the last one is requested without tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_depth: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

// --- Voice pipeline ---

/// Turn-taking, VAD and latency policy for voice sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub format: AudioFormat,
    /// Duration of outbound frames produced by the synthesizer.
    pub frame_ms: u32,
    /// Audio kept ahead of a speech start and prepended to the segment.
    pub pre_roll_ms: u32,
    pub vad: VadConfig,
    pub turn: TurnConfig,
    pub timeouts: TimeoutConfig,
    pub chunker: ChunkerConfig,
    /// Spoken once after the session starts. `None` disables it.
    pub greeting: Option<String>,
    pub greeting_delay_ms: u64,
    /// Spoken when generation or synthesis fails.
    pub fallback_generation: String,
    /// Spoken when a segment could not be transcribed.
    pub fallback_repeat: String,
    /// Conversational messages kept in the chat context (system excluded).
    pub max_context_messages: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            frame_ms: 20,
            pre_roll_ms: 200,
            vad: VadConfig::default(),
            turn: TurnConfig::default(),
            timeouts: TimeoutConfig::default(),
            chunker: ChunkerConfig::default(),
            greeting: Some("How can I help you today?".into()),
            greeting_delay_ms: 1000,
            fallback_generation: "I'm having trouble responding right now.".into(),
            fallback_repeat: "Sorry, I didn't catch that. Could you say it again?".into(),
            max_context_messages: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Smoothed probability at or above which a frame counts as speech.
    pub enter_threshold: f32,
    /// Smoothed probability below which a frame counts as silence.
    pub exit_threshold: f32,
    /// Speech must persist this long before `SpeechStart`.
    pub min_speech_ms: u64,
    /// Silence must persist this long before `SpeechEnd`.
    pub min_silence_ms: u64,
    /// Weight of the newest frame in the moving average (0, 1].
    pub smoothing: f32,
    /// RMS mapped to probability 1.0.
    pub reference_rms: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enter_threshold: 0.6,
            exit_threshold: 0.35,
            min_speech_ms: 100,
            min_silence_ms: 500,
            smoothing: 0.5,
            reference_rms: 1500.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Assistant audio that must have played before speech may interrupt it.
    pub barge_in_grace_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            barge_in_grace_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Wait for the final transcript after the segment is sealed.
    pub stt_final_timeout_ms: u64,
    pub stt_retry_backoff_ms: u64,
    pub llm_first_token_timeout_ms: u64,
    pub tts_first_chunk_timeout_ms: u64,
    pub tool_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stt_final_timeout_ms: 3000,
            stt_retry_backoff_ms: 250,
            llm_first_token_timeout_ms: 8000,
            tts_first_chunk_timeout_ms: 5000,
            tool_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Clause punctuation only splits once the chunk is at least this long.
    pub min_clause_chars: usize,
    /// Chunks longer than this are split at the last whitespace.
    pub max_chunk_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_clause_chars: 40,
            max_chunk_chars: 250,
        }
    }
}

// --- Speech backends ---

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "groq" or "openai" (default: "groq").
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Override the provider's endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// ISO-639-1 hint passed to the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
            base_url: None,
            language: None,
        }
    }
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider (default: "elevenlabs").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    /// Model ID (e.g. "eleven_turbo_v2_5").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".into()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            voice_id: None,
            model_id: None,
            base_url: None,
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Tools ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Weather service endpoint (default: "https://wttr.in").
    #[serde(default = "default_weather_url")]
    pub base_url: String,

    /// "metric" (default) or "imperial".
    #[serde(default = "default_weather_units")]
    pub units: String,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            base_url: default_weather_url(),
            units: default_weather_units(),
        }
    }
}

fn default_weather_url() -> String {
    "https://wttr.in".into()
}

fn default_weather_units() -> String {
    "metric".into()
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    /// Maximum concurrent voice sessions (default: 16).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_port() -> u16 {
    18790
}

fn default_max_sessions() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none" or "token". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the auth token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    /// Get the effective auth mode.
    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

// --- Logging ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct.as_ref().filter(|v| !v.is_empty()) {
        return Some(val.clone());
    }
    env_var
        .as_ref()
        .and_then(|env| std::env::var(env).ok())
        .filter(|v| !v.is_empty())
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse JSON5 text, substituting `${ENV_VAR}` references.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| crate::error::ParleyError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".into())
    }

    /// Model name: `agent.model`, then the first provider's default.
    pub fn model(&self) -> String {
        self.agent
            .as_ref()
            .and_then(|a| a.model.clone())
            .or_else(|| self.first_provider().and_then(|p| p.default_model.clone()))
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.agent.as_ref().and_then(|a| a.max_tokens).unwrap_or(1024)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.agent.as_ref().and_then(|a| a.temperature)
    }

    pub fn max_tool_depth(&self) -> u32 {
        self.agent.as_ref().and_then(|a| a.max_tool_depth).unwrap_or(4)
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.agent.as_ref().and_then(|a| a.system_prompt.as_deref())
    }

    /// Voice settings with defaults filled in.
    pub fn voice(&self) -> VoiceConfig {
        self.voice.clone().unwrap_or_default()
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers().iter().find(|pc| pc.id == id)
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_deref())
            .unwrap_or_default()
    }

    pub fn first_provider(&self) -> Option<&ProviderConfig> {
        self.providers().first()
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "voice.vad.enter_threshold").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.providers().is_empty() {
            warnings.push("No LLM provider configured".to_string());
        }
        for p in self.providers() {
            if p.id != "ollama" && p.resolve_api_key().is_none() {
                warnings.push(format!("Provider '{}' has no API key configured", p.id));
            }
        }

        match &self.transcription {
            Some(t) if t.resolve_api_key().is_none() => {
                warnings.push(format!("Transcription provider '{}' has no API key configured", t.provider))
            }
            None => warnings.push("No transcription backend configured".to_string()),
            _ => {}
        }
        match &self.tts {
            Some(t) if t.resolve_api_key().is_none() => {
                warnings.push(format!("TTS provider '{}' has no API key configured", t.provider))
            }
            None => warnings.push("No TTS backend configured".to_string()),
            _ => {}
        }

        let voice = self.voice();
        if voice.format.sample_rate == 0 || voice.format.channels == 0 {
            errors.push("voice.format needs a non-zero sample_rate and channels".to_string());
        }
        if voice.frame_ms == 0 {
            errors.push("voice.frame_ms cannot be 0".to_string());
        }
        let vad = &voice.vad;
        for (name, value) in [
            ("enter_threshold", vad.enter_threshold),
            ("exit_threshold", vad.exit_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("voice.vad.{name} must be within [0, 1], got {value}"));
            }
        }
        if vad.exit_threshold > vad.enter_threshold {
            errors.push(format!(
                "voice.vad.exit_threshold ({}) must not exceed enter_threshold ({})",
                vad.exit_threshold, vad.enter_threshold
            ));
        }
        if !(vad.smoothing > 0.0 && vad.smoothing <= 1.0) {
            errors.push(format!("voice.vad.smoothing must be within (0, 1], got {}", vad.smoothing));
        }
        if vad.reference_rms <= 0.0 {
            errors.push("voice.vad.reference_rms must be positive".to_string());
        }
        if voice.chunker.max_chunk_chars == 0 {
            errors.push("voice.chunker.max_chunk_chars cannot be 0".to_string());
        }
        if self.max_tool_depth() == 0 {
            errors.push("agent.max_tool_depth cannot be 0".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if let Some(auth) = &gw.auth {
                if auth.effective_mode() == "token" && auth.resolve_token().is_none() {
                    errors.push("Gateway auth mode is 'token' but no token is configured".to_string());
                }
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

/// Expand a user-supplied path such as `~/parley.json`.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_PARLEY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_PARLEY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PARLEY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PARLEY_TEST}"}"#;
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, r#"{"key": ""}"#);
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 18790);
        assert_eq!(config.max_tool_depth(), 4);
        let voice = config.voice();
        assert_eq!(voice.format, AudioFormat::default());
        assert_eq!(voice.turn.barge_in_grace_ms, 300);
        assert_eq!(voice.greeting.as_deref(), Some("How can I help you today?"));
    }

    #[test]
    fn test_partial_voice_section_keeps_defaults() {
        let config = Config::parse(
            r#"{
                // only override what differs
                voice: { vad: { min_silence_ms: 800 }, turn: { barge_in_grace_ms: 150 } },
            }"#,
        )
        .unwrap();
        let voice = config.voice();
        assert_eq!(voice.vad.min_silence_ms, 800);
        assert_eq!(voice.vad.enter_threshold, 0.6);
        assert_eq!(voice.turn.barge_in_grace_ms, 150);
        assert_eq!(voice.timeouts.stt_retry_backoff_ms, 250);
    }

    #[test]
    fn test_provider_resolve_api_key() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_PARLEY_API_KEY", "from-env") };
        let provider = ProviderConfig {
            id: "openai".into(),
            api_key_env: Some("TEST_PARLEY_API_KEY".into()),
            api_key: None,
            base_url: None,
            default_model: None,
        };
        assert_eq!(provider.resolve_api_key(), Some("from-env".into()));

        let provider2 = ProviderConfig {
            api_key: Some("direct-key".into()),
            ..provider
        };
        // Direct key takes priority
        assert_eq!(provider2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_PARLEY_API_KEY") };
    }

    #[test]
    fn test_get_path() {
        let config = Config::parse(r#"{ gateway: { port: 9000 } }"#).unwrap();
        assert_eq!(config.get_path("gateway.port"), Some(serde_json::json!(9000)));
        assert!(config.get_path("gateway.nope").is_none());
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config {
            models: Some(ModelsConfig {
                providers: Some(vec![ProviderConfig {
                    id: "openai".into(),
                    api_key: None,
                    api_key_env: None,
                    base_url: None,
                    default_model: None,
                }]),
            }),
            ..Config::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(
            warnings.iter().any(|w| w.contains("openai") && w.to_lowercase().contains("key")),
            "Expected a warning about missing API key for openai, got: {warnings:?}"
        );
    }

    #[test]
    fn test_validate_inverted_thresholds_errors() {
        let config = Config::parse(
            r#"{ voice: { vad: { enter_threshold: 0.2, exit_threshold: 0.5 } } }"#,
        )
        .unwrap();
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("exit_threshold")),
            "Expected a threshold error, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_token_mode_without_token() {
        let config = Config::parse(r#"{ gateway: { auth: { mode: "token" } } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("token")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ agent: { max_tool_depth: 2, system_prompt: "Be brief." } }"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_tool_depth(), 2);
        assert_eq!(config.system_prompt(), Some("Be brief."));

        let missing = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(missing.agent.is_none());
    }
}

//! Configuration management for the voice relay
//!
//! Every value resolves with the same precedence: environment variable,
//! then the TOML file, then the built-in default.

pub mod file;

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::pipeline::{PipelineConfig, RetryPolicy};
use crate::protocol::{AudioFormat, AudioMerge, ResponseFormat, SessionSettings};
use crate::session::SessionConfig;
use crate::voice::{SttProvider, TtsProvider};
use crate::{Error, Result};

use file::RelayConfigFile;

/// Default socket port
pub const DEFAULT_PORT: u16 = 7860;

/// Default HTTP API port
pub const DEFAULT_API_PORT: u16 = 7861;

/// Voice relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub session: SessionConfig,
    pub api_server: ApiServerConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub api_keys: ApiKeys,
}

/// Socket listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl ListenerConfig {
    /// Address to bind
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address {}:{}: {e}", self.host, self.port)))
    }
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Speech recognition configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub model: String,
    /// Override of the provider endpoint (self-hosted Whisper servers)
    pub base_url: Option<String>,
}

/// Reply generation configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub model: String,
    /// Voice name (`OpenAI`) or voice id (`ElevenLabs`)
    pub voice: String,
    /// Speed multiplier (0.25 to 4.0, `OpenAI` only)
    pub speed: f32,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, TTS and the default reply endpoint)
    pub openai: Option<SecretString>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<SecretString>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<SecretString>,

    /// Key for a non-OpenAI reply endpoint; falls back to `openai`
    pub llm: Option<SecretString>,
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded or a value
    /// is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider name or numeric value is invalid
    pub fn from_sources(fc: RelayConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Borrows the whole file config, so it resolves before any field moves
        let session = session_config(&fc, &env)?;

        let listener = ListenerConfig {
            host: env("VOICE_RELAY_HOST")
                .or(fc.listener.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_env(&env, "VOICE_RELAY_PORT")?
                .or(fc.listener.port)
                .unwrap_or(DEFAULT_PORT),
        };

        let api_server = ApiServerConfig {
            enabled: parse_env(&env, "VOICE_RELAY_API_ENABLED")?
                .or(fc.api.enabled)
                .unwrap_or(true),
            port: parse_env(&env, "VOICE_RELAY_API_PORT")?
                .or(fc.api.port)
                .unwrap_or(DEFAULT_API_PORT),
        };

        // Provider names (env > toml > default)
        let stt_provider = env("VOICE_RELAY_STT_PROVIDER")
            .or(fc.stt.provider)
            .map_or(Ok(SttProvider::Whisper), |s| s.parse())?;
        let stt = SttConfig {
            model: env("VOICE_RELAY_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or_else(|| match stt_provider {
                    SttProvider::Whisper => "whisper-1".to_string(),
                    SttProvider::Deepgram => "nova-2".to_string(),
                }),
            base_url: env("VOICE_RELAY_STT_URL").or(fc.stt.base_url),
            provider: stt_provider,
        };

        let llm = LlmConfig {
            base_url: env("VOICE_RELAY_LLM_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: env("VOICE_RELAY_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            system_prompt: env("VOICE_RELAY_SYSTEM_PROMPT").or(fc.llm.system_prompt),
            max_tokens: parse_env(&env, "VOICE_RELAY_LLM_MAX_TOKENS")?.or(fc.llm.max_tokens),
            temperature: parse_env(&env, "VOICE_RELAY_LLM_TEMPERATURE")?.or(fc.llm.temperature),
        };

        let tts_provider = env("VOICE_RELAY_TTS_PROVIDER")
            .or(fc.tts.provider)
            .map_or(Ok(TtsProvider::OpenAI), |s| s.parse())?;
        let tts = TtsConfig {
            model: env("VOICE_RELAY_TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or_else(|| match tts_provider {
                    TtsProvider::OpenAI => "tts-1".to_string(),
                    TtsProvider::ElevenLabs => "eleven_turbo_v2_5".to_string(),
                }),
            voice: env("VOICE_RELAY_TTS_VOICE")
                .or(fc.tts.voice)
                .unwrap_or_else(|| match tts_provider {
                    TtsProvider::OpenAI => "alloy".to_string(),
                    TtsProvider::ElevenLabs => "21m00Tcm4TlvDq8ikWAM".to_string(),
                }),
            speed: parse_env(&env, "VOICE_RELAY_TTS_SPEED")?
                .or(fc.tts.speed)
                .unwrap_or(1.0),
            provider: tts_provider,
        };

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai).map(SecretString::from),
            elevenlabs: env("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .map(SecretString::from),
            deepgram: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .map(SecretString::from),
            llm: env("VOICE_RELAY_LLM_API_KEY")
                .or(fc.api_keys.llm)
                .map(SecretString::from),
        };

        Ok(Self {
            listener,
            session,
            api_server,
            stt,
            llm,
            tts,
            api_keys,
        })
    }
}

/// Session and pipeline tuning (env > toml > default)
fn session_config(fc: &RelayConfigFile, env: &impl Fn(&str) -> Option<String>) -> Result<SessionConfig> {
    let default = SessionConfig::default();
    let pipeline_default = PipelineConfig::default();
    let toml = &fc.session;

    let idle_secs = parse_env::<u64>(env, "VOICE_RELAY_IDLE_TIMEOUT")?.or(fc.listener.idle_timeout_secs);

    let pipeline = PipelineConfig {
        preempt_wait: toml
            .preempt_wait_ms
            .map_or(pipeline_default.preempt_wait, Duration::from_millis),
        first_sentence_deadline: toml
            .first_sentence_deadline_ms
            .map_or(pipeline_default.first_sentence_deadline, Duration::from_millis),
        tts_drain_timeout: toml
            .tts_drain_timeout_ms
            .map_or(pipeline_default.tts_drain_timeout, Duration::from_millis),
        retry: RetryPolicy {
            max_attempts: toml
                .retry_attempts
                .unwrap_or(pipeline_default.retry.max_attempts),
            backoff: toml
                .retry_backoff_ms
                .map_or(pipeline_default.retry.backoff, Duration::from_millis),
        },
    };

    let defaults = SessionSettings {
        response_format: toml.response_format.unwrap_or(ResponseFormat::default()),
        audio_format: parse_choice::<AudioFormat>(env, "VOICE_RELAY_AUDIO_FORMAT")?
            .or(toml.audio_format)
            .unwrap_or_default(),
        audio_merge: parse_choice::<AudioMerge>(env, "VOICE_RELAY_AUDIO_MERGE")?
            .or(toml.audio_merge)
            .unwrap_or_default(),
    };

    Ok(SessionConfig {
        admission_capacity: parse_env(env, "VOICE_RELAY_ADMISSION_CAPACITY")?
            .or(toml.admission_capacity)
            .unwrap_or(default.admission_capacity),
        max_pending: toml.max_pending.unwrap_or(default.max_pending),
        idle_timeout: idle_secs.map_or(default.idle_timeout, Duration::from_secs),
        max_utterance_bytes: toml.max_utterance_bytes.unwrap_or(default.max_utterance_bytes),
        history_turns: toml.history_turns.unwrap_or(default.history_turns),
        defaults,
        pipeline,
        ..default
    })
}

/// Parse an optional environment value, rejecting malformed ones
fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}

/// Parse an optional environment value naming one of a fixed set of choices
fn parse_choice<T: clap::ValueEnum>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            T::from_str(raw.trim(), true).map_err(|e| Error::Config(format!("invalid {key}={raw}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_any_source() {
        let config = Config::from_sources(RelayConfigFile::default(), env(&[])).unwrap();
        assert_eq!(config.listener.port, DEFAULT_PORT);
        assert_eq!(config.session.admission_capacity, 2);
        assert_eq!(config.session.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.session.pipeline.preempt_wait, Duration::from_millis(200));
        assert_eq!(config.session.defaults, SessionSettings::default());
        assert_eq!(config.stt.provider, SttProvider::Whisper);
        assert_eq!(config.tts.voice, "alloy");
        assert!(config.api_server.enabled);
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn env_wins_over_file() {
        let fc: RelayConfigFile = toml::from_str(
            r#"
            [listener]
            port = 9000
            [session]
            audio_format = "mp3"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(
            fc,
            env(&[
                ("VOICE_RELAY_PORT", "9100"),
                ("VOICE_RELAY_AUDIO_FORMAT", "pcm"),
                ("OPENAI_API_KEY", "sk-test"),
            ]),
        )
        .unwrap();

        assert_eq!(config.listener.port, 9100);
        assert_eq!(config.session.defaults.audio_format, AudioFormat::Pcm);
        assert_eq!(config.api_keys.openai.unwrap().expose_secret(), "sk-test");
    }

    #[test]
    fn file_wins_over_default() {
        let fc: RelayConfigFile = toml::from_str(
            r#"
            [listener]
            idle_timeout_secs = 30
            [session]
            retry_attempts = 5
            preempt_wait_ms = 50
            [tts]
            provider = "elevenlabs"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(fc, env(&[])).unwrap();

        assert_eq!(config.session.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.session.pipeline.retry.max_attempts, 5);
        assert_eq!(config.session.pipeline.preempt_wait, Duration::from_millis(50));
        assert_eq!(config.tts.provider, TtsProvider::ElevenLabs);
        assert_eq!(config.tts.model, "eleven_turbo_v2_5");
    }

    #[test]
    fn malformed_env_value_is_rejected() {
        let result = Config::from_sources(
            RelayConfigFile::default(),
            env(&[("VOICE_RELAY_PORT", "seventy")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let result = Config::from_sources(
            RelayConfigFile::default(),
            env(&[("VOICE_RELAY_STT_PROVIDER", "carrier-pigeon")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn listen_address_parses() {
        let listener = ListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 7860,
        };
        assert_eq!(listener.addr().unwrap().port(), 7860);
    }
}

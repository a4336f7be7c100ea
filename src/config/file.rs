//! TOML configuration file loading
//!
//! Supports `~/.config/voice-relay/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;
use crate::protocol::{AudioFormat, AudioMerge, ResponseFormat};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfigFile {
    /// Socket listener
    #[serde(default)]
    pub listener: ListenerFileConfig,

    /// Per-session limits and pipeline timing
    #[serde(default)]
    pub session: SessionFileConfig,

    /// HTTP upload API
    #[serde(default)]
    pub api: ApiFileConfig,

    /// Speech recognition
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Reply generation
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListenerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Seconds without an inbound frame before a connection is closed
    pub idle_timeout_secs: Option<u64>,
}

/// Session tuning; durations are in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub admission_capacity: Option<usize>,
    pub max_pending: Option<usize>,
    pub max_utterance_bytes: Option<usize>,
    pub history_turns: Option<usize>,
    pub preempt_wait_ms: Option<u64>,
    pub first_sentence_deadline_ms: Option<u64>,
    pub tts_drain_timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub response_format: Option<ResponseFormat>,
    pub audio_format: Option<AudioFormat>,
    pub audio_merge: Option<AudioMerge>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// "whisper" or "deepgram"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible endpoint, e.g. `https://api.openai.com/v1`
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "openai" or "elevenlabs"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
    /// Key for the reply endpoint when it is not `OpenAI` itself
    pub llm: Option<String>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path
/// is tried and any problem with it falls back to defaults with a warning.
///
/// # Errors
///
/// Returns error if an explicitly requested file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<RelayConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(RelayConfigFile::default());
    };

    if !path.exists() {
        return Ok(RelayConfigFile::default());
    }

    let config = match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                RelayConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            RelayConfigFile::default()
        }
    };
    Ok(config)
}

/// Return the config file path: `~/.config/voice-relay/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-relay").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: RelayConfigFile = toml::from_str("").unwrap();
        assert!(config.listener.port.is_none());
        assert!(config.session.audio_format.is_none());
    }

    #[test]
    fn parses_sections() {
        let config: RelayConfigFile = toml::from_str(
            r#"
            [listener]
            port = 9000

            [session]
            admission_capacity = 3
            audio_format = "pcm"
            audio_merge = "enabled"

            [tts]
            provider = "elevenlabs"
            voice = "rachel"
            "#,
        )
        .unwrap();

        assert_eq!(config.listener.port, Some(9000));
        assert_eq!(config.session.admission_capacity, Some(3));
        assert_eq!(config.session.audio_format, Some(AudioFormat::Pcm));
        assert_eq!(config.session.audio_merge, Some(AudioMerge::Enabled));
        assert_eq!(config.tts.provider.as_deref(), Some("elevenlabs"));
    }

    #[test]
    fn rejects_unknown_sections() {
        assert!(toml::from_str::<RelayConfigFile>("[channels]\ndiscord = true").is_err());
    }

    #[test]
    fn explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[api]\nenabled = false\nport = 8123").unwrap();

        let config = load_config_file(Some(file.path())).unwrap();
        assert_eq!(config.api.enabled, Some(false));
        assert_eq!(config.api.port, Some(8123));
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_file(Some(&dir.path().join("missing.toml"))).is_err());
    }
}

//! Per-session wire settings negotiated through `CONFIG` frames

use serde::{Deserialize, Serialize};

/// How a recognized utterance is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// One `JSON_RESPONSE` frame per turn, no audio
    Json,
    /// Interleaved text and audio frames with barge-in
    #[default]
    Stream,
}

/// Audio encoding delivered in `AUDIO_DATA` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Synthesizer output forwarded unchanged
    #[default]
    Mp3,
    /// 16 kHz mono signed 16-bit little-endian PCM
    Pcm,
}

/// Whether a sentence's audio chunks are merged before sending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioMerge {
    Enabled,
    #[default]
    Disabled,
}

impl AudioMerge {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// Effective settings of one session
///
/// Changes apply to turns dispatched afterwards. A generation pipeline
/// captures a copy when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub response_format: ResponseFormat,
    pub audio_format: AudioFormat,
    pub audio_merge: AudioMerge,
}

impl SessionSettings {
    /// Overlay the keys present in `update`
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(format) = update.response_format {
            self.response_format = format;
        }
        if let Some(format) = update.audio_format {
            self.audio_format = format;
        }
        if let Some(merge) = update.audio_merge {
            self.audio_merge = merge;
        }
    }
}

/// Body of a `CONFIG` frame. Every key is optional; unknown keys and
/// unknown values are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    pub response_format: Option<ResponseFormat>,
    pub audio_format: Option<AudioFormat>,
    pub audio_merge: Option<AudioMerge>,
}

impl ConfigUpdate {
    /// Parse a `CONFIG` payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid JSON for this schema
    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

//! Speech-to-text collaborators

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::convert::{SAMPLE_RATE, pcm16_to_wav};
use crate::{Error, Result};

/// Recognizes speech in 16 kHz mono 16-bit PCM
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance
    ///
    /// An empty string means nothing was recognized.
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer could not be reached or failed
    async fn transcribe(&self, pcm: &[u8]) -> Result<String>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttProvider {
    Whisper,
    Deepgram,
}

impl std::str::FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// HTTP speech recognizer (Whisper or Deepgram)
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: SttProvider,
    base_url: String,
}

impl SpeechToText {
    /// Create a recognizer for `provider`
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(provider: SttProvider, api_key: SecretString, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(format!(
                "API key required for {provider:?} transcription"
            )));
        }

        let base_url = match provider {
            SttProvider::Whisper => "https://api.openai.com/v1",
            SttProvider::Deepgram => "https://api.deepgram.com/v1",
        };

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            provider,
            base_url: base_url.to_string(),
        })
    }

    /// Override the API base URL (self-hosted Whisper servers)
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Recognition(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Recognition(format!(
                "Whisper API error {status}: {body}"
            )));
        }

        let result: WhisperResponse = response.json().await?;
        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, wav: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting Deepgram transcription");

        let url = format!(
            "{}/listen?model={}&punctuate=true",
            self.base_url, self.model
        );

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Recognition(format!(
                "Deepgram API error {status}: {body}"
            )));
        }

        let result: DeepgramResponse = response.json().await?;
        Ok(result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, pcm: &[u8]) -> Result<String> {
        let wav = pcm16_to_wav(pcm, SAMPLE_RATE)?;
        let text = match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await?,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await?,
        };
        tracing::info!(transcript = %text, provider = ?self.provider, "transcription complete");
        Ok(text)
    }
}

/// Recognized text worth answering
///
/// Blank results and results the recognizer flagged with an `ERROR:`
/// prefix are rejected.
#[must_use]
pub fn accept_transcript(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() || text.starts_with("ERROR:") {
        None
    } else {
        Some(trimmed)
    }
}

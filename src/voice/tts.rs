//! Text-to-speech collaborators

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};

/// Lazy, finite stream of audio chunks for one sentence
pub type AudioStream = BoxStream<'static, Result<Bytes>>;

/// Synthesizes one sentence into a stream of MP3 chunks
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `sentence`
    ///
    /// # Errors
    ///
    /// Returns error if the request could not be started. Failures while
    /// streaming surface as stream items.
    async fn synthesize_stream(&self, sentence: &str) -> Result<AudioStream>;
}

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAI,
    ElevenLabs,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Streaming HTTP synthesizer (`OpenAI` or `ElevenLabs`)
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a synthesizer using `OpenAI`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai(
        api_key: SecretString,
        voice: String,
        speed: f32,
        model: String,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            model,
            provider: TtsProvider::OpenAI,
        })
    }

    /// Create a synthesizer using `ElevenLabs`
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs(api_key: SecretString, voice_id: String, model: String) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: voice_id,
            speed: 1.0,
            model,
            provider: TtsProvider::ElevenLabs,
        })
    }

    async fn request_openai(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "mp3",
        };

        Ok(self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?)
    }

    async fn request_elevenlabs(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream",
            self.voice
        );

        Ok(self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&ElevenLabsRequest {
                text,
                model_id: &self.model,
            })
            .send()
            .await?)
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize_stream(&self, sentence: &str) -> Result<AudioStream> {
        tracing::debug!(provider = ?self.provider, chars = sentence.chars().count(), "synthesizing");

        let response = match self.provider {
            TtsProvider::OpenAI => self.request_openai(sentence).await?,
            TtsProvider::ElevenLabs => self.request_elevenlabs(sentence).await?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "TTS API error");
            if status.is_client_error() && status.as_u16() != 429 {
                return Err(Error::Config(format!("TTS rejected request {status}: {body}")));
            }
            return Err(Error::Synthesis(format!("TTS API error {status}: {body}")));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .filter(|chunk| futures::future::ready(!matches!(chunk, Ok(b) if b.is_empty())))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key() {
        let result = TextToSpeech::new_openai(
            SecretString::from(String::new()),
            "alloy".to_string(),
            1.0,
            "tts-1".to_string(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn parses_provider_names() {
        assert_eq!("openai".parse::<TtsProvider>().unwrap(), TtsProvider::OpenAI);
        assert_eq!("ElevenLabs".parse::<TtsProvider>().unwrap(), TtsProvider::ElevenLabs);
        assert!("festival".parse::<TtsProvider>().is_err());
    }
}

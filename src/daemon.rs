//! Daemon - the relay service
//!
//! Builds the collaborators from configuration, then runs the voice socket
//! and the HTTP API until ctrl-c.

use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::agent::OpenAiChat;
use crate::api::{ApiServer, ApiState};
use crate::listener::Listener;
use crate::pipeline::Services;
use crate::voice::{Mp3ToPcm, SpeechToText, SttProvider, TextToSpeech, TtsProvider};
use crate::{Config, Error, Result};

/// The relay daemon - owns configuration and the shutdown token
pub struct Daemon {
    config: Config,
    cancel: CancellationToken,
}

impl Daemon {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the daemon when cancelled
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the daemon
    ///
    /// # Errors
    ///
    /// Returns error if collaborators cannot be built or a socket cannot be
    /// bound
    pub async fn run(self) -> Result<()> {
        let services = build_services(&self.config)?;
        tracing::info!(
            stt = ?self.config.stt.provider,
            tts = ?self.config.tts.provider,
            llm_model = %self.config.llm.model,
            audio_format = ?self.config.session.defaults.audio_format,
            audio_merge = ?self.config.session.defaults.audio_merge,
            "collaborators ready"
        );

        // Set up shutdown signal
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        });

        let api_handle = if self.config.api_server.enabled {
            let state = ApiState {
                services: services.clone(),
                first_sentence_deadline: self.config.session.pipeline.first_sentence_deadline,
            };
            Some(ApiServer::new(state, self.config.api_server.port).spawn(self.cancel.child_token()))
        } else {
            tracing::info!("HTTP API disabled");
            None
        };

        let listener = Listener::bind(
            self.config.listener.addr()?,
            services,
            self.config.session.clone(),
        )
        .await?;
        let result = listener.run(self.cancel.clone()).await;

        // The listener only returns on shutdown or failure; take the API down too
        self.cancel.cancel();
        if let Some(handle) = api_handle {
            match handle.await {
                Ok(Err(e)) => tracing::error!(error = %e, "API server failed"),
                Err(e) => tracing::error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
        }

        tracing::info!("daemon stopped");
        result
    }
}

/// Build the external collaborators named by the configuration
///
/// # Errors
///
/// Returns error if a provider's API key is missing
pub fn build_services(config: &Config) -> Result<Services> {
    let keys = &config.api_keys;

    let stt_key = match config.stt.provider {
        SttProvider::Whisper => keys.openai.clone(),
        SttProvider::Deepgram => keys.deepgram.clone(),
    };
    let mut transcriber = SpeechToText::new(
        config.stt.provider,
        require_key(stt_key, "speech recognition")?,
        config.stt.model.clone(),
    )?;
    if let Some(url) = &config.stt.base_url {
        transcriber = transcriber.with_base_url(url.clone());
    }

    let synthesizer = match config.tts.provider {
        TtsProvider::OpenAI => TextToSpeech::new_openai(
            require_key(keys.openai.clone(), "OpenAI speech synthesis")?,
            config.tts.voice.clone(),
            config.tts.speed,
            config.tts.model.clone(),
        )?,
        TtsProvider::ElevenLabs => TextToSpeech::new_elevenlabs(
            require_key(keys.elevenlabs.clone(), "ElevenLabs speech synthesis")?,
            config.tts.voice.clone(),
            config.tts.model.clone(),
        )?,
    };

    let llm_key = keys.llm.clone().or_else(|| keys.openai.clone());
    let generator = OpenAiChat::new(
        config.llm.base_url.clone(),
        require_key(llm_key, "reply generation")?,
        config.llm.model.clone(),
    )
    .with_system_prompt(config.llm.system_prompt.clone())
    .with_max_tokens(config.llm.max_tokens)
    .with_temperature(config.llm.temperature);

    Ok(Services {
        transcriber: Arc::new(transcriber),
        generator: Arc::new(generator),
        synthesizer: Arc::new(synthesizer),
        converter: Arc::new(Mp3ToPcm),
    })
}

fn require_key(key: Option<SecretString>, purpose: &str) -> Result<SecretString> {
    key.ok_or_else(|| Error::Config(format!("no API key configured for {purpose}")))
}

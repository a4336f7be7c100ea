//! Per-sentence audio assembly

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::protocol::{
    AudioFormat, AudioMerge, Frame, MAX_PAYLOAD_LEN, MessageType, SENTENCE_END, SYNTHESIS_ERROR,
};
use crate::session::ScopedOutbox;
use crate::voice::{AudioConverter, AudioStream};
use crate::Error;

/// A sentence that could not be delivered
#[derive(Debug)]
pub struct SentenceFailure {
    pub error: Error,
    /// Some of the sentence's audio already reached the client
    pub audio_forwarded: bool,
}

impl SentenceFailure {
    const fn before_audio(error: Error) -> Self {
        Self {
            error,
            audio_forwarded: false,
        }
    }
}

/// Turns synthesizer chunk streams into `AUDIO_DATA` frames
///
/// In streaming mode every chunk is converted and forwarded as it arrives.
/// In merged mode the sentence is buffered and sent as one frame, or as
/// several when it exceeds [`MAX_PAYLOAD_LEN`]. Both end a delivered
/// sentence with the [`SENTENCE_END`] sentinel.
pub struct AudioAssembler {
    out: ScopedOutbox,
    converter: Arc<dyn AudioConverter>,
    format: AudioFormat,
    merge: AudioMerge,
    turn_id: u64,
    turn_started: Instant,
    first_audio_sent: bool,
}

impl AudioAssembler {
    #[must_use]
    pub fn new(
        out: ScopedOutbox,
        converter: Arc<dyn AudioConverter>,
        format: AudioFormat,
        merge: AudioMerge,
        turn_id: u64,
        turn_started: Instant,
    ) -> Self {
        Self {
            out,
            converter,
            format,
            merge,
            turn_id,
            turn_started,
            first_audio_sent: false,
        }
    }

    /// Deliver one sentence's audio followed by the sentence-end sentinel
    ///
    /// Returns the number of audio frames sent.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoAudio`] if the stream yielded no audio, or with
    /// the stream's error, noting whether audio was already forwarded.
    pub async fn forward_sentence(&mut self, chunks: AudioStream) -> Result<usize, SentenceFailure> {
        let sent = if self.merge.is_enabled() {
            self.forward_merged(chunks).await?
        } else {
            self.forward_streaming(chunks).await?
        };

        self.send(Frame::new(MessageType::AudioData, SENTENCE_END.to_vec()))
            .await
            .map_err(|error| SentenceFailure {
                error,
                audio_forwarded: true,
            })?;
        Ok(sent)
    }

    async fn forward_streaming(&mut self, mut chunks: AudioStream) -> Result<usize, SentenceFailure> {
        let mut sent = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|error| SentenceFailure {
                error,
                audio_forwarded: sent > 0,
            })?;
            let audio = self.convert(chunk).await;
            sent += self.send_audio(audio, sent > 0).await?;
        }

        if sent == 0 {
            return Err(SentenceFailure::before_audio(Error::NoAudio));
        }
        Ok(sent)
    }

    async fn forward_merged(&mut self, mut chunks: AudioStream) -> Result<usize, SentenceFailure> {
        let mut merged = BytesMut::new();
        let mut count = 0_usize;
        while let Some(chunk) = chunks.next().await {
            merged.extend_from_slice(&chunk.map_err(SentenceFailure::before_audio)?);
            count += 1;
        }

        if merged.is_empty() {
            return Err(SentenceFailure::before_audio(Error::NoAudio));
        }

        tracing::debug!(turn_id = self.turn_id, chunks = count, bytes = merged.len(), "merged sentence audio");
        let audio = self.convert(merged.freeze()).await;
        self.send_audio(audio, false).await
    }

    /// Mark a sentence whose synthesis was given up
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    pub async fn send_error_marker(&self) -> crate::Result<()> {
        self.send(Frame::new(MessageType::AudioData, SYNTHESIS_ERROR.to_vec()))
            .await
    }

    /// Close the reply's audio channel
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone
    pub async fn end_audio(&self) -> crate::Result<()> {
        self.send(Frame::signal(MessageType::AudioEnd)).await
    }

    /// Send audio as one or more frames, none above the payload limit
    async fn send_audio(&mut self, audio: Bytes, forwarded: bool) -> Result<usize, SentenceFailure> {
        if audio.is_empty() {
            return Ok(0);
        }
        if !self.first_audio_sent {
            self.first_audio_sent = true;
            tracing::info!(
                turn_id = self.turn_id,
                elapsed_ms = self.turn_started.elapsed().as_millis(),
                "first audio chunk sent"
            );
        }

        let mut sent = 0;
        for start in (0..audio.len()).step_by(MAX_PAYLOAD_LEN) {
            let end = (start + MAX_PAYLOAD_LEN).min(audio.len());
            self.send(Frame::new(MessageType::AudioData, audio.slice(start..end)))
                .await
                .map_err(|error| SentenceFailure {
                    error,
                    audio_forwarded: forwarded || sent > 0,
                })?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn send(&self, frame: Frame) -> crate::Result<()> {
        self.out.send(frame).await
    }

    /// Convert to the session's format, forwarding the original on failure
    async fn convert(&self, audio: Bytes) -> Bytes {
        if self.format == AudioFormat::Mp3 {
            return audio;
        }

        let converter = Arc::clone(&self.converter);
        let format = self.format;
        let input = audio.clone();
        match tokio::task::spawn_blocking(move || converter.convert(&input, format)).await {
            Ok(Ok(converted)) => converted,
            Ok(Err(e)) => {
                tracing::warn!(turn_id = self.turn_id, error = %e, "audio conversion failed, forwarding original");
                audio
            }
            Err(e) => {
                tracing::warn!(turn_id = self.turn_id, error = %e, "conversion task failed, forwarding original");
                audio
            }
        }
    }
}

//! Per-connection session state machine
//!
//! ```text
//! IDLE ──VOICE_START──► RECEIVING_VOICE ──VOICE_END──► ASR_PENDING ──► IDLE
//! ```
//!
//! The reader loop owns the phase. Recognized text in streaming mode goes to
//! the pending-query queue, where the [`Dispatcher`] picks it up and starts
//! a generation pipeline once an admission permit is free. Pipelines are
//! tracked but never gate the reader loop.

mod outbox;
mod tasks;
mod turn;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

pub use outbox::{Outbound, Outbox, ScopedOutbox, run_writer};
pub use tasks::{Dispatcher, PendingQuery, SessionShared};
pub use turn::Turn;

use crate::agent::collect_reply;
use crate::pipeline::{Admission, DEFAULT_CAPACITY, PipelineConfig, Services, strip_marker};
use crate::protocol::{ConfigUpdate, Frame, FrameCodec, MessageType, ResponseFormat, SessionSettings};
use crate::voice::accept_transcript;
use crate::{Error, Result};

/// Limits and timeouts of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Concurrently generating replies
    pub admission_capacity: usize,
    /// Pending-query queue bound; the oldest entry is dropped when full
    pub max_pending: usize,
    /// Close the connection after this long without an inbound frame
    #[serde(with = "crate::pipeline::millis")]
    pub idle_timeout: Duration,
    /// Largest utterance accepted between `VOICE_START` and `VOICE_END`
    pub max_utterance_bytes: usize,
    /// Completed exchanges kept as reply context
    pub history_turns: usize,
    /// Outbound frames buffered ahead of the socket writer
    pub outbox_capacity: usize,
    /// Time pipelines get to unwind before they are aborted at teardown
    #[serde(with = "crate::pipeline::millis")]
    pub shutdown_grace: Duration,
    /// Settings in effect until the client sends `CONFIG`
    pub defaults: SessionSettings,
    pub pipeline: PipelineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            admission_capacity: DEFAULT_CAPACITY,
            max_pending: 8,
            idle_timeout: Duration::from_secs(300),
            max_utterance_bytes: 16 * 1024 * 1024,
            history_turns: 10,
            outbox_capacity: 64,
            shutdown_grace: Duration::from_secs(2),
            defaults: SessionSettings::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Where the reader loop is in the utterance cycle
#[derive(Debug)]
enum Phase {
    Idle,
    ReceivingVoice(Turn),
    AsrPending,
}

impl Phase {
    const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ReceivingVoice(_) => "receiving_voice",
            Self::AsrPending => "asr_pending",
        }
    }
}

/// Why the reader loop stopped
#[derive(Debug)]
enum Exit {
    Disconnected,
    IdleTimeout,
    Shutdown,
    WriterClosed,
}

#[derive(Serialize)]
struct JsonReply<'a> {
    code: u16,
    msg: &'a str,
    session_id: String,
    user_text: &'a str,
    ai_text: &'a str,
}

/// One client connection
pub struct Session {
    id: Uuid,
    services: Services,
    config: SessionConfig,
    cancel: CancellationToken,
    shared: Arc<SessionShared>,
    turn_counter: u64,
}

impl Session {
    /// Create a session; cancelling `cancel` tears it down
    #[must_use]
    pub fn new(services: Services, config: SessionConfig, cancel: CancellationToken) -> Self {
        let shared = Arc::new(SessionShared::new(
            config.defaults,
            config.max_pending,
            config.history_turns,
        ));
        Self {
            id: Uuid::new_v4(),
            services,
            config,
            cancel,
            shared,
            turn_counter: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Serve the connection until disconnect, idle timeout, protocol error
    /// or shutdown. Every pipeline is cancelled and joined before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns the protocol or transport error that ended the session
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = self.id;
        tracing::info!(%session_id, "session started");

        let (outbox, rx) = Outbox::channel(self.config.outbox_capacity);
        let mut writer_task = AbortOnDropHandle::new(tokio::spawn(run_writer(rx, writer)));

        let admission = Admission::new(self.config.admission_capacity);
        let dispatcher = Dispatcher {
            shared: Arc::clone(&self.shared),
            admission: admission.clone(),
            services: self.services.clone(),
            pipeline: self.config.pipeline,
            outbox: outbox.clone(),
            cancel: self.cancel.clone(),
            shutdown_grace: self.config.shutdown_grace,
        };
        let dispatcher = AbortOnDropHandle::new(tokio::spawn(dispatcher.run()));

        let mut frames = FramedRead::new(reader, FrameCodec);
        let mut phase = Phase::Idle;
        let mut writer_finished = false;

        let result = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Ok(Exit::Shutdown),
                joined = &mut writer_task => {
                    writer_finished = true;
                    match joined {
                        Ok(Ok(())) => break Ok(Exit::WriterClosed),
                        Ok(Err(e)) => break Err(e),
                        Err(e) => break Err(Error::Io(std::io::Error::other(e))),
                    }
                }
                next = tokio::time::timeout(self.config.idle_timeout, frames.next()) => next,
            };

            let frame = match next {
                Err(_) => break Ok(Exit::IdleTimeout),
                Ok(None) => break Ok(Exit::Disconnected),
                Ok(Some(Err(e))) => {
                    tracing::warn!(%session_id, error = %e, "protocol error, closing connection");
                    if let Err(send_err) = outbox.send_error(&format!("protocol error: {e}")).await {
                        tracing::debug!(%session_id, error = %send_err, "could not report protocol error");
                    }
                    break Err(e.into());
                }
                Ok(Some(Ok(frame))) => frame,
            };

            if let Err(e) = self.handle_frame(frame, &mut phase, &outbox).await {
                break Err(e);
            }
        };

        match &result {
            Ok(exit) => tracing::info!(%session_id, reason = ?exit, phase = phase.name(), "session ending"),
            Err(e) => tracing::warn!(%session_id, error = %e, "session ending on error"),
        }

        // Teardown: stop dispatching, unwind every pipeline, flush the writer
        self.cancel.cancel();
        admission.close();
        if let Err(e) = dispatcher.await {
            tracing::error!(%session_id, error = %e, "dispatcher panicked");
        }
        drop(outbox);
        drop(self.shared);

        if !writer_finished {
            match tokio::time::timeout(self.config.shutdown_grace, &mut writer_task).await {
                Ok(Ok(Err(e))) => tracing::debug!(%session_id, error = %e, "writer failed during teardown"),
                Ok(_) => {}
                Err(_) => tracing::warn!(%session_id, "writer did not flush in time"),
            }
        }

        let stats = admission.stats();
        tracing::info!(
            %session_id,
            turns = self.turn_counter,
            replies = stats.acquired,
            peak_concurrency = stats.peak,
            "session closed"
        );

        result.map(|_| ())
    }

    async fn handle_frame(&mut self, frame: Frame, phase: &mut Phase, outbox: &Outbox) -> Result<()> {
        let Some(kind) = frame.message_type() else {
            tracing::warn!(
                session_id = %self.id,
                type_byte = frame.type_byte(),
                len = frame.payload().len(),
                "ignoring frame of unknown type"
            );
            return Ok(());
        };

        match kind {
            MessageType::VoiceStart => {
                if let Phase::ReceivingVoice(old) = phase {
                    tracing::warn!(session_id = %self.id, turn_id = old.id(), "voice start during utterance, discarding it");
                    self.shared.clear_timer(old.id());
                }
                self.turn_counter += 1;
                let turn = Turn::new(self.turn_counter);
                self.shared.start_timer(turn.id(), turn.started());
                tracing::debug!(session_id = %self.id, turn_id = turn.id(), "voice start");
                *phase = Phase::ReceivingVoice(turn);
            }
            MessageType::VoiceData => match phase {
                Phase::ReceivingVoice(turn) => {
                    if turn.len() + frame.payload().len() > self.config.max_utterance_bytes {
                        tracing::warn!(session_id = %self.id, turn_id = turn.id(), "utterance too long, discarding");
                        self.shared.clear_timer(turn.id());
                        *phase = Phase::Idle;
                        outbox.send_error("utterance too long").await?;
                    } else {
                        turn.append(frame.payload());
                    }
                }
                _ => {
                    tracing::warn!(session_id = %self.id, phase = phase.name(), "voice data without voice start, ignoring");
                }
            },
            MessageType::VoiceEnd => {
                let Phase::ReceivingVoice(turn) = std::mem::replace(phase, Phase::AsrPending) else {
                    *phase = Phase::Idle;
                    tracing::warn!(session_id = %self.id, "voice end without voice start, ignoring");
                    return Ok(());
                };
                let result = self.finish_turn(turn, outbox).await;
                *phase = Phase::Idle;
                result?;
            }
            MessageType::Config => self.apply_config(frame.payload(), outbox).await?,
            other => {
                tracing::debug!(session_id = %self.id, kind = ?other, "ignoring server-bound frame type");
            }
        }
        Ok(())
    }

    async fn apply_config(&self, payload: &[u8], outbox: &Outbox) -> Result<()> {
        match ConfigUpdate::parse(payload) {
            Ok(update) => {
                let settings = self.shared.update_settings(|s| s.apply(update));
                tracing::info!(
                    session_id = %self.id,
                    response_format = ?settings.response_format,
                    audio_format = ?settings.audio_format,
                    audio_merge = ?settings.audio_merge,
                    "session settings updated"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "rejected config frame");
                outbox.send_error(&format!("invalid config: {e}")).await
            }
        }
    }

    /// Recognize the utterance and route the text by response mode
    async fn finish_turn(&self, turn: Turn, outbox: &Outbox) -> Result<()> {
        let turn_id = turn.id();
        let started = turn.started();
        tracing::info!(
            session_id = %self.id,
            turn_id,
            audio_bytes = turn.len(),
            elapsed_ms = turn.elapsed().as_millis(),
            "voice end"
        );

        let audio = turn.into_audio();
        let transcribed = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(()),
            transcribed = self.services.transcriber.transcribe(&audio) => transcribed,
        };
        tracing::info!(
            session_id = %self.id,
            turn_id,
            elapsed_ms = started.elapsed().as_millis(),
            "recognition finished"
        );

        let raw = match transcribed {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(session_id = %self.id, turn_id, error = %e, "recognition failed");
                self.shared.clear_timer(turn_id);
                return outbox.send_error(&Error::Recognition(e.to_string()).to_string()).await;
            }
        };

        let Some(text) = accept_transcript(&raw) else {
            tracing::info!(session_id = %self.id, turn_id, transcript = %raw, "nothing usable recognized");
            self.shared.clear_timer(turn_id);
            return outbox.send_error(&Error::Recognition(raw.clone()).to_string()).await;
        };

        match self.shared.settings().response_format {
            ResponseFormat::Stream => {
                outbox
                    .send(Frame::text(MessageType::TextData, &format!("USER:{text}")))
                    .await?;
                let query = PendingQuery {
                    turn_id,
                    text: text.to_string(),
                };
                if let Some(dropped) = self.shared.enqueue(query) {
                    tracing::warn!(
                        session_id = %self.id,
                        turn_id = dropped.turn_id,
                        "pending queue full, dropped oldest query"
                    );
                }
                Ok(())
            }
            ResponseFormat::Json => {
                let result = self.reply_json(text, outbox).await;
                self.shared.clear_timer(turn_id);
                result
            }
        }
    }

    /// Structured mode: one synchronous recognition-to-text round trip
    async fn reply_json(&self, text: &str, outbox: &Outbox) -> Result<()> {
        let history = self.shared.history();
        let reply = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Ok(()),
            reply = async {
                let stream = self.services.generator.generate_stream(&history, text).await?;
                collect_reply(stream).await
            } => reply,
        };

        let reply = match reply {
            Ok(reply) => strip_marker(&reply),
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "generation failed");
                return outbox.send_error(&e.to_string()).await;
            }
        };

        self.shared.record_exchange(text, &reply);
        let body = JsonReply {
            code: 0,
            msg: "success",
            session_id: self.id.to_string(),
            user_text: text,
            ai_text: &reply,
        };
        outbox
            .send(Frame::json(MessageType::JsonResponse, &body)?)
            .await
    }
}


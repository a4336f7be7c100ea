//! Generation pipeline: one reply from recognized text to finished audio
//!
//! ```text
//! STARTED ──► STREAMING_TEXT ──► DRAINING_TTS ──► DONE
//!    │              │                  │
//!    └──────────────┴──────────────────┴──► ABORTED
//! ```
//!
//! The first forwarded fragment preempts every older pipeline still running
//! in the session (barge-in). Synthesis runs in a sub-task fed through a
//! sentence queue so text keeps streaming while audio is produced.

use std::fmt;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use super::Services;
use super::assembler::AudioAssembler;
use super::segmenter::Segmenter;
use super::tts::{RetryPolicy, TtsCommand, TtsReport, TtsWorker};
use crate::agent::ChatMessage;
use crate::protocol::{Frame, MessageType, SessionSettings};
use crate::session::{Outbox, ScopedOutbox};
use crate::{Error, Result};

/// Marker some models leak into their output; never spoken or shown
pub const MALFORMED_MARKER: &str = "[NNNN]";

/// Timing knobs shared by every pipeline of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long to wait for each preempted pipeline to stop
    #[serde(with = "crate::pipeline::millis")]
    pub preempt_wait: Duration,
    /// Force out a first sentence if none is complete by then
    #[serde(with = "crate::pipeline::millis")]
    pub first_sentence_deadline: Duration,
    /// Upper bound on waiting for synthesis after the text stream ends
    #[serde(with = "crate::pipeline::millis")]
    pub tts_drain_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preempt_wait: Duration::from_millis(200),
            first_sentence_deadline: Duration::from_secs(1),
            tts_drain_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Pipeline lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Started,
    StreamingText,
    DrainingTts,
    Done,
    Aborted,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::StreamingText => "streaming_text",
            Self::DrainingTts => "draining_tts",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Handle to a running pipeline, used by newer pipelines to preempt it
#[derive(Debug, Clone)]
pub struct TaskHandle {
    turn_id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl TaskHandle {
    #[must_use]
    pub const fn new(turn_id: u64, cancel: CancellationToken, done: watch::Receiver<bool>) -> Self {
        Self {
            turn_id,
            cancel,
            done,
        }
    }

    #[must_use]
    pub const fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// The pipeline has released its permit and left the active set
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Request cancellation; a no-op for finished pipelines
    pub fn cancel(&self) {
        if !self.is_finished() {
            self.cancel.cancel();
        }
    }

    /// Wait until the pipeline has fully unwound
    pub async fn finished(&mut self) {
        // A dropped sender also means the task is gone
        let _ = self.done.wait_for(|done| *done).await;
    }
}

/// Input of one pipeline run
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub turn_id: u64,
    pub text: String,
    pub history: Vec<ChatMessage>,
    pub settings: SessionSettings,
    /// Pipelines that were active when this one was dispatched
    pub older: Vec<TaskHandle>,
    pub turn_started: Instant,
}

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub state: GenerationState,
    /// Reply text accumulated before the run ended
    pub reply: String,
}

enum Unwind {
    Cancelled,
    Failed(Error),
}

impl From<Error> for Unwind {
    fn from(error: Error) -> Self {
        Self::Failed(error)
    }
}

/// Drives one reply through the state machine
pub struct GenerationPipeline {
    services: Services,
    config: PipelineConfig,
    outbox: Outbox,
    out: ScopedOutbox,
    cancel: CancellationToken,
    request: GenerationRequest,
    state: GenerationState,
    reply: String,
}

impl GenerationPipeline {
    #[must_use]
    pub fn new(
        services: Services,
        config: PipelineConfig,
        outbox: Outbox,
        cancel: CancellationToken,
        request: GenerationRequest,
    ) -> Self {
        let out = outbox.scoped(cancel.clone());
        Self {
            services,
            config,
            outbox,
            out,
            cancel,
            request,
            state: GenerationState::Started,
            reply: String::new(),
        }
    }

    fn transition(&mut self, next: GenerationState) {
        tracing::debug!(
            turn_id = self.request.turn_id,
            from = %self.state,
            to = %next,
            "generation state"
        );
        self.state = next;
    }

    /// Run to `DONE` or `ABORTED`
    ///
    /// The synthesis sub-task is always stopped and awaited before this
    /// returns, whatever the exit path.
    pub async fn run(mut self) -> GenerationOutcome {
        let turn_id = self.request.turn_id;
        tracing::info!(turn_id, older = self.request.older.len(), "generation started");

        let (tts_tx, tts_rx) = mpsc::unbounded_channel();
        let tts_cancel = self.cancel.child_token();
        let mut tts = self.spawn_tts(tts_rx, tts_cancel.clone());

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Unwind::Cancelled),
            result = self.drive(&tts_tx, &mut tts) => result,
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.out.send(Frame::signal(MessageType::AiEnd)).await {
                    tracing::debug!(turn_id, error = %e, "could not send reply end");
                }
                self.transition(GenerationState::Done);
            }
            Err(unwind) => {
                if let Unwind::Failed(e) = &unwind {
                    tracing::error!(turn_id, state = %self.state, error = %e, "generation failed");
                    if let Err(e) = self.outbox.send_error(&e.to_string()).await {
                        tracing::debug!(turn_id, error = %e, "could not report failure");
                    }
                } else {
                    tracing::info!(turn_id, state = %self.state, "generation cancelled");
                }
                tts_cancel.cancel();
                drop(tts_tx);
                if !tts.is_finished() {
                    let _ = tts.await;
                }
                self.transition(GenerationState::Aborted);
            }
        }

        tracing::info!(
            turn_id,
            state = %self.state,
            chars = self.reply.chars().count(),
            elapsed_ms = self.request.turn_started.elapsed().as_millis(),
            "generation finished"
        );
        GenerationOutcome {
            state: self.state,
            reply: self.reply,
        }
    }

    fn spawn_tts(
        &self,
        commands: mpsc::UnboundedReceiver<TtsCommand>,
        cancel: CancellationToken,
    ) -> AbortOnDropHandle<Result<TtsReport>> {
        let settings = self.request.settings;
        let assembler = AudioAssembler::new(
            self.outbox.scoped(cancel.clone()),
            self.services.converter.clone(),
            settings.audio_format,
            settings.audio_merge,
            self.request.turn_id,
            self.request.turn_started,
        );
        let worker = TtsWorker::new(
            self.services.synthesizer.clone(),
            assembler,
            self.config.retry,
            commands,
            cancel,
            self.request.turn_id,
        );
        AbortOnDropHandle::new(tokio::spawn(worker.run()))
    }

    async fn drive(
        &mut self,
        tts: &mpsc::UnboundedSender<TtsCommand>,
        tts_task: &mut AbortOnDropHandle<Result<TtsReport>>,
    ) -> std::result::Result<(), Unwind> {
        let turn_id = self.request.turn_id;

        self.out.send(Frame::signal(MessageType::AiStart)).await?;
        self.out.send(Frame::signal(MessageType::AudioStart)).await?;

        let mut fragments = self
            .services
            .generator
            .generate_stream(&self.request.history, &self.request.text)
            .await?;
        self.transition(GenerationState::StreamingText);

        let mut progress = Progress {
            segmenter: Segmenter::new(self.config.first_sentence_deadline),
            filter: MarkerFilter::default(),
            preempted: false,
            sentences: 0,
        };

        while let Some(fragment) = fragments.next().await {
            let text = progress.filter.push(&fragment?);
            self.forward(&text, &mut progress, tts).await?;

            // let the synthesis task pick up queued sentences
            tokio::task::yield_now().await;
        }
        let tail = progress.filter.finish();
        self.forward(&tail, &mut progress, tts).await?;

        if !progress.preempted {
            self.preempt_older().await?;
        }

        self.transition(GenerationState::DrainingTts);
        for sentence in progress.segmenter.finish() {
            queue(tts, TtsCommand::Sentence(sentence))?;
        }
        queue(tts, TtsCommand::End)?;

        match tokio::time::timeout(self.config.tts_drain_timeout, &mut *tts_task).await {
            Ok(Ok(Ok(report))) => {
                tracing::debug!(turn_id, spoken = report.spoken, skipped = report.skipped, "synthesis drained");
            }
            Ok(Ok(Err(e))) => return Err(Unwind::Failed(e)),
            Ok(Err(e)) => {
                tracing::warn!(turn_id, error = %e, "synthesis task panicked");
                self.close_audio().await;
            }
            Err(_) => {
                tracing::warn!(
                    turn_id,
                    timeout_ms = self.config.tts_drain_timeout.as_millis(),
                    "synthesis did not finish in time"
                );
                tts_task.abort();
                self.close_audio().await;
            }
        }

        Ok(())
    }

    /// Forward filtered reply text and queue its complete sentences
    async fn forward(
        &mut self,
        text: &str,
        progress: &mut Progress,
        tts: &mpsc::UnboundedSender<TtsCommand>,
    ) -> std::result::Result<(), Unwind> {
        if text.is_empty() {
            return Ok(());
        }
        let turn_id = self.request.turn_id;

        if !progress.preempted {
            progress.preempted = true;
            tracing::info!(
                turn_id,
                elapsed_ms = self.request.turn_started.elapsed().as_millis(),
                "first reply fragment"
            );
            self.preempt_older().await?;
        }

        self.out.send(Frame::text(MessageType::TextData, text)).await?;
        progress.segmenter.push(text);
        self.reply.push_str(text);

        while let Some(sentence) = progress.segmenter.next_sentence() {
            if progress.sentences == 0 {
                tracing::info!(
                    turn_id,
                    elapsed_ms = self.request.turn_started.elapsed().as_millis(),
                    "first sentence queued for synthesis"
                );
            }
            progress.sentences += 1;
            queue(tts, TtsCommand::Sentence(sentence))?;
        }
        Ok(())
    }

    /// Close the audio channel for a synthesis task that never reached its end
    async fn close_audio(&self) {
        if let Err(e) = self.out.send(Frame::signal(MessageType::AudioEnd)).await {
            tracing::debug!(turn_id = self.request.turn_id, error = %e, "could not send audio end");
        }
    }

    /// Cancel older pipelines, notify the client, wait briefly for each
    async fn preempt_older(&mut self) -> Result<()> {
        let mut live: Vec<TaskHandle> = self
            .request
            .older
            .drain(..)
            .filter(|handle| !handle.is_finished())
            .collect();
        if live.is_empty() {
            return Ok(());
        }

        let turn_id = self.request.turn_id;
        let preempted: Vec<u64> = live.iter().map(TaskHandle::turn_id).collect();
        tracing::info!(turn_id, ?preempted, "barge-in, cancelling older replies");

        for handle in &live {
            handle.cancel();
        }
        self.outbox
            .send(Frame::signal(MessageType::AiCancelled))
            .await?;

        for handle in &mut live {
            if tokio::time::timeout(self.config.preempt_wait, handle.finished())
                .await
                .is_err()
            {
                tracing::warn!(
                    turn_id,
                    older = handle.turn_id(),
                    wait_ms = self.config.preempt_wait.as_millis(),
                    "older reply did not stop in time"
                );
            }
        }
        Ok(())
    }
}

/// Text-side state of a reply while its fragments stream in
struct Progress {
    segmenter: Segmenter,
    filter: MarkerFilter,
    preempted: bool,
    sentences: usize,
}

fn queue(
    tts: &mpsc::UnboundedSender<TtsCommand>,
    command: TtsCommand,
) -> std::result::Result<(), Unwind> {
    // The worker only drops its queue when cancelled
    tts.send(command).map_err(|_| Unwind::Cancelled)
}

/// Remove the malformed-output marker from a fragment
#[must_use]
pub fn strip_marker(fragment: &str) -> String {
    let mut text = fragment.to_string();
    // removing one marker can join the halves of another
    while text.contains(MALFORMED_MARKER) {
        text = text.replace(MALFORMED_MARKER, "");
    }
    text
}

/// Strips [`MALFORMED_MARKER`] from a fragment stream
///
/// A fragment tail that could be the start of a marker is held back until
/// the next fragment shows whether the marker completes.
#[derive(Debug, Default)]
pub struct MarkerFilter {
    held: String,
}

impl MarkerFilter {
    /// Filter the next fragment, returning the text safe to forward
    pub fn push(&mut self, fragment: &str) -> String {
        let mut text = std::mem::take(&mut self.held);
        text.push_str(fragment);
        let mut text = strip_marker(&text);

        let partial = (1..MALFORMED_MARKER.len())
            .rev()
            .find(|&n| text.ends_with(&MALFORMED_MARKER[..n]))
            .unwrap_or(0);
        self.held = text.split_off(text.len() - partial);
        text
    }

    /// Release held text at the end of the stream
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_marker_anywhere() {
        assert_eq!(strip_marker("Hi[NNNN] there"), "Hi there");
        assert_eq!(strip_marker("[NNNN][NNNN]"), "");
        assert_eq!(strip_marker("plain"), "plain");
    }

    #[test]
    fn strips_marker_rejoined_by_removal() {
        assert_eq!(strip_marker("a[NN[NNNN]NN]b"), "ab");
    }

    #[test]
    fn filter_catches_marker_split_across_fragments() {
        let mut filter = MarkerFilter::default();
        assert_eq!(filter.push("Hello [NN"), "Hello ");
        assert_eq!(filter.push("NN] friend."), " friend.");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn filter_releases_a_prefix_that_never_completes() {
        let mut filter = MarkerFilter::default();
        assert_eq!(filter.push("array[N"), "array");
        assert_eq!(filter.push("] ok"), "[N] ok");

        assert_eq!(filter.push("tail ["), "tail ");
        assert_eq!(filter.finish(), "[");
    }

    #[test]
    fn filter_passes_plain_text_through() {
        let mut filter = MarkerFilter::default();
        assert_eq!(filter.push("Hi, there."), "Hi, there.");
        assert_eq!(filter.push("[NNNN]"), "");
        assert_eq!(filter.finish(), "");
    }

    #[test]
    fn states_display_snake_case() {
        assert_eq!(GenerationState::StreamingText.to_string(), "streaming_text");
        assert_eq!(GenerationState::Aborted.to_string(), "aborted");
    }

    #[tokio::test]
    async fn cancelling_a_finished_handle_is_a_no_op() {
        let (done_tx, done_rx) = watch::channel(false);
        let token = CancellationToken::new();
        let mut handle = TaskHandle::new(1, token.clone(), done_rx);

        done_tx.send_replace(true);
        handle.cancel();
        assert!(!token.is_cancelled());
        handle.finished().await;
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_finished() {
        let (done_tx, done_rx) = watch::channel(false);
        let mut handle = TaskHandle::new(2, CancellationToken::new(), done_rx);
        drop(done_tx);
        tokio::time::timeout(Duration::from_millis(50), handle.finished())
            .await
            .unwrap();
    }

    #[test]
    fn pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.preempt_wait, Duration::from_millis(200));
        assert_eq!(config.first_sentence_deadline, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, 3);
    }
}

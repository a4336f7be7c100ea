//! Synthesis sub-task of a generation pipeline

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::assembler::{AudioAssembler, SentenceFailure};
use crate::voice::Synthesizer;
use crate::{Error, Result};

/// Retry schedule for one sentence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per sentence, including the first
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff` before the next try
    #[serde(with = "crate::pipeline::millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Work item for the synthesis sub-task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsCommand {
    /// Synthesize and deliver one sentence
    Sentence(String),
    /// No more text; close the audio channel
    End,
}

/// What the sub-task did before it stopped
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TtsReport {
    pub spoken: usize,
    pub skipped: usize,
    /// Reached `End` and sent `AUDIO_END`
    pub completed: bool,
}

/// Consumes the sentence queue of one reply
pub struct TtsWorker {
    synthesizer: Arc<dyn Synthesizer>,
    assembler: AudioAssembler,
    retry: RetryPolicy,
    commands: mpsc::UnboundedReceiver<TtsCommand>,
    cancel: CancellationToken,
    turn_id: u64,
}

impl TtsWorker {
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        assembler: AudioAssembler,
        retry: RetryPolicy,
        commands: mpsc::UnboundedReceiver<TtsCommand>,
        cancel: CancellationToken,
        turn_id: u64,
    ) -> Self {
        Self {
            synthesizer,
            assembler,
            retry,
            commands,
            cancel,
            turn_id,
        }
    }

    /// Run until `End`, cancellation, or the queue closing
    ///
    /// # Errors
    ///
    /// Returns error only if the connection went away
    pub async fn run(mut self) -> Result<TtsReport> {
        let cancel = self.cancel.clone();
        let mut report = TtsReport::default();

        loop {
            let command = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = self.commands.recv() => command,
            };

            match command {
                Some(TtsCommand::Sentence(sentence)) => {
                    let spoken = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        spoken = self.speak(&sentence) => spoken?,
                    };
                    if spoken {
                        report.spoken += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Some(TtsCommand::End) => {
                    self.assembler.end_audio().await?;
                    report.completed = true;
                    break;
                }
                None => break,
            }
        }

        tracing::debug!(
            turn_id = self.turn_id,
            spoken = report.spoken,
            skipped = report.skipped,
            completed = report.completed,
            "synthesis task finished"
        );
        Ok(report)
    }

    /// Deliver one sentence, retrying transient failures
    ///
    /// Returns `false` if the sentence was given up and the error marker
    /// sent in its place.
    async fn speak(&mut self, sentence: &str) -> Result<bool> {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let outcome = match self.synthesizer.synthesize_stream(sentence).await {
                Ok(chunks) => self.assembler.forward_sentence(chunks).await,
                Err(error) => Err(SentenceFailure {
                    error,
                    audio_forwarded: false,
                }),
            };

            let failure = match outcome {
                Ok(frames) => {
                    tracing::debug!(turn_id = self.turn_id, frames, attempt, "sentence delivered");
                    return Ok(true);
                }
                Err(failure) => failure,
            };

            if matches!(failure.error, Error::ConnectionClosed) {
                return Err(failure.error);
            }

            let retryable =
                failure.error.is_transient() && !failure.audio_forwarded && attempt < max_attempts;
            tracing::warn!(
                turn_id = self.turn_id,
                attempt,
                max_attempts,
                retryable,
                audio_forwarded = failure.audio_forwarded,
                error = %failure.error,
                "sentence synthesis failed"
            );
            if !retryable {
                break;
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }

        self.assembler.send_error_marker().await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;

    use super::*;
    use crate::protocol::{AudioFormat, AudioMerge, Frame, MessageType};
    use crate::session::{Outbound, Outbox};
    use crate::voice::{AudioConverter, AudioStream};

    struct Identity;

    impl AudioConverter for Identity {
        fn convert(&self, audio: &[u8], _target: AudioFormat) -> crate::Result<Bytes> {
            Ok(Bytes::copy_from_slice(audio))
        }
    }

    /// Fails the first `failures` calls with the error from `make_error`
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        make_error: fn() -> Error,
        sentences: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: u32, make_error: fn() -> Error) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                make_error,
                sentences: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Synthesizer for Flaky {
        async fn synthesize_stream(&self, sentence: &str) -> crate::Result<AudioStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.sentences.lock().unwrap().push(sentence.to_string());
            if call < self.failures {
                return Err((self.make_error)());
            }
            let audio = Bytes::copy_from_slice(sentence.as_bytes());
            Ok(futures::stream::iter(vec![Ok(audio)]).boxed())
        }
    }

    const FAST: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        backoff: Duration::from_millis(1),
    };

    fn worker(
        synth: Arc<dyn Synthesizer>,
        retry: RetryPolicy,
    ) -> (
        TtsWorker,
        mpsc::UnboundedSender<TtsCommand>,
        mpsc::Receiver<Outbound>,
        CancellationToken,
    ) {
        let (outbox, rx) = Outbox::channel(64);
        let cancel = CancellationToken::new();
        let assembler = AudioAssembler::new(
            outbox.scoped(cancel.clone()),
            Arc::new(Identity),
            AudioFormat::Mp3,
            AudioMerge::Disabled,
            7,
            Instant::now(),
        );
        let (tx, commands) = mpsc::unbounded_channel();
        let worker = TtsWorker::new(synth, assembler, retry, commands, cancel.clone(), 7);
        (worker, tx, rx, cancel)
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            out.push(outbound.into_frame());
        }
        out
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn speaks_sentences_in_order_then_ends_audio() {
        let synth = Flaky::new(0, || Error::NoAudio);
        let (worker, tx, mut rx, _cancel) = worker(synth, FAST);
        tx.send(TtsCommand::Sentence("Hello,".to_string())).unwrap();
        tx.send(TtsCommand::Sentence("friend.".to_string())).unwrap();
        tx.send(TtsCommand::End).unwrap();

        let report = worker.run().await.unwrap();
        assert_eq!(report.spoken, 2);
        assert!(report.completed);

        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 5);
        assert_eq!(&frames[0].payload()[..], b"Hello,");
        assert!(frames[1].is_sentence_end());
        assert_eq!(&frames[2].payload()[..], b"friend.");
        assert!(frames[3].is_sentence_end());
        assert_eq!(frames[4].message_type(), Some(MessageType::AudioEnd));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let synth = Flaky::new(2, || Error::Synthesis("503".to_string()));
        let (worker, tx, mut rx, _cancel) = worker(synth.clone(), FAST);
        tx.send(TtsCommand::Sentence("Hi.".to_string())).unwrap();
        tx.send(TtsCommand::End).unwrap();

        let report = worker.run().await.unwrap();
        assert_eq!(report.spoken, 1);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);
        assert!(frames(&mut rx)[1].is_sentence_end());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_with_error_marker() {
        let synth = Flaky::new(10, || Error::Synthesis("503".to_string()));
        let (worker, tx, mut rx, _cancel) = worker(synth.clone(), FAST);
        tx.send(TtsCommand::Sentence("Lost.".to_string())).unwrap();
        tx.send(TtsCommand::Sentence("Also lost.".to_string())).unwrap();
        tx.send(TtsCommand::End).unwrap();

        let report = worker.run().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 6);

        let frames = frames(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_synthesis_error());
        assert!(frames[1].is_synthesis_error());
        assert_eq!(frames[2].message_type(), Some(MessageType::AudioEnd));
    }

    #[tokio::test]
    async fn no_audio_is_not_retried() {
        let synth = Flaky::new(1, || Error::NoAudio);
        let (worker, tx, mut rx, _cancel) = worker(synth.clone(), FAST);
        tx.send(TtsCommand::Sentence("Quiet.".to_string())).unwrap();
        tx.send(TtsCommand::End).unwrap();

        worker.run().await.unwrap();
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert!(frames(&mut rx)[0].is_synthesis_error());
    }

    #[tokio::test]
    async fn cancellation_stops_without_audio_end() {
        let synth = Flaky::new(0, || Error::NoAudio);
        let (worker, tx, mut rx, cancel) = worker(synth, FAST);
        let handle = tokio::spawn(worker.run());

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert!(!report.completed);
        drop(tx);
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn closed_queue_stops_worker() {
        let synth = Flaky::new(0, || Error::NoAudio);
        let (worker, tx, _rx, _cancel) = worker(synth, FAST);
        drop(tx);
        let report = worker.run().await.unwrap();
        assert!(!report.completed);
    }
}

//! Shared test utilities: scripted collaborators and a framed test client

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use voice_relay::agent::{ChatMessage, ReplyGenerator, ReplyStream};
use voice_relay::protocol::{AudioFormat, Frame, MessageType, read_frame};
use voice_relay::voice::{AudioConverter, AudioStream, Synthesizer, Transcriber};
use voice_relay::{Error, Result, Services, Session, SessionConfig};

/// Returns queued transcripts in order, then repeats the last one
pub struct ScriptedTranscriber {
    transcripts: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    pub calls: Mutex<Vec<usize>>,
}

impl ScriptedTranscriber {
    pub fn new(transcripts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            transcripts: Mutex::new(transcripts.iter().map(|t| (*t).to_string()).collect()),
            last: Mutex::new(String::new()),
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, pcm: &[u8]) -> Result<String> {
        self.calls.lock().unwrap().push(pcm.len());
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.transcripts.lock().unwrap().pop_front() {
            last.clone_from(&next);
        }
        Ok(last.clone())
    }
}

/// One scripted reply: fragments and the pause before each
#[derive(Clone, Default)]
pub struct Script {
    pub fragments: Vec<String>,
    pub delay: Duration,
    pub fail_after: Option<usize>,
}

impl Script {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| (*f).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the stream after `n` fragments
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

/// Replies with a script chosen by the user text
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: HashMap<String, Script>,
    fallback: Script,
    pub histories: Mutex<Vec<usize>>,
}

impl ScriptedGenerator {
    pub fn new(fallback: Script) -> Self {
        Self {
            fallback,
            ..Self::default()
        }
    }

    pub fn on(mut self, text: &str, script: Script) -> Self {
        self.scripts.insert(text.to_string(), script);
        self
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    async fn generate_stream(&self, history: &[ChatMessage], text: &str) -> Result<ReplyStream> {
        self.histories.lock().unwrap().push(history.len());
        let script = self.scripts.get(text).unwrap_or(&self.fallback).clone();

        let items = script.fragments.into_iter().enumerate().map(Some);
        let tail = std::iter::once(None);
        let delay = script.delay;
        let fail_after = script.fail_after;

        let stream = futures::stream::iter(items.chain(tail))
            .then(move |item| async move {
                tokio::time::sleep(delay).await;
                match item {
                    Some((i, _)) if fail_after == Some(i) => Some(Err(Error::Generation("model overloaded".to_string()))),
                    Some((_, fragment)) => Some(Ok(fragment)),
                    None if fail_after.is_some() => Some(Err(Error::Generation("model overloaded".to_string()))),
                    None => None,
                }
            })
            .take_while(|item| futures::future::ready(item.is_some()))
            .filter_map(futures::future::ready);

        Ok(stream.boxed())
    }
}

/// Synthesizes `audio:<sentence>` split into `chunks` pieces
pub struct EchoSynthesizer {
    pub chunks: usize,
    pub delay: Duration,
    pub sentences: Mutex<Vec<String>>,
}

impl EchoSynthesizer {
    pub fn new() -> Arc<Self> {
        Self::with(1, Duration::ZERO)
    }

    pub fn with(chunks: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.max(1),
            delay,
            sentences: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize_stream(&self, sentence: &str) -> Result<AudioStream> {
        self.sentences.lock().unwrap().push(sentence.to_string());
        let audio = format!("audio:{sentence}").into_bytes();
        let size = audio.len().div_ceil(self.chunks);
        let chunks: Vec<Bytes> = audio.chunks(size).map(Bytes::copy_from_slice).collect();
        let delay = self.delay;

        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            tokio::time::sleep(delay).await;
            Ok(chunk)
        });
        Ok(stream.boxed())
    }
}

/// Tags converted audio with `pcm:` instead of decoding it
pub struct TaggingConverter;

impl AudioConverter for TaggingConverter {
    fn convert(&self, audio: &[u8], target: AudioFormat) -> Result<Bytes> {
        match target {
            AudioFormat::Mp3 => Ok(Bytes::copy_from_slice(audio)),
            AudioFormat::Pcm => {
                let mut out = b"pcm:".to_vec();
                out.extend_from_slice(audio);
                Ok(Bytes::from(out))
            }
        }
    }
}

pub fn services(
    transcriber: Arc<dyn Transcriber>,
    generator: impl ReplyGenerator + 'static,
    synthesizer: Arc<dyn Synthesizer>,
) -> Services {
    Services {
        transcriber,
        generator: Arc::new(generator),
        synthesizer,
        converter: Arc::new(TaggingConverter),
    }
}

/// Session settings tuned for fast tests
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig {
        idle_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(500),
        ..SessionConfig::default()
    };
    config.pipeline.retry.backoff = Duration::from_millis(5);
    config
}

/// Client side of an in-memory session
pub struct TestClient {
    pub reader: ReadHalf<DuplexStream>,
    pub writer: WriteHalf<DuplexStream>,
    pub session: JoinHandle<Result<()>>,
    pub cancel: CancellationToken,
}

impl TestClient {
    pub fn start(services: Services, config: SessionConfig) -> Self {
        let (client, server) = tokio::io::duplex(1 << 20);
        let cancel = CancellationToken::new();
        let session = Session::new(services, config, cancel.clone());
        let (server_read, server_write) = tokio::io::split(server);
        let session = tokio::spawn(session.run(server_read, server_write));
        let (reader, writer) = tokio::io::split(client);
        Self {
            reader,
            writer,
            session,
            cancel,
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.writer.write_all(&frame.to_bytes()).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// One complete utterance of silence
    pub async fn speak(&mut self, bytes: usize) {
        self.send(Frame::signal(MessageType::VoiceStart)).await;
        let half = bytes / 2;
        self.send(Frame::new(MessageType::VoiceData, vec![0_u8; half])).await;
        self.send(Frame::new(MessageType::VoiceData, vec![0_u8; bytes - half])).await;
        self.send(Frame::signal(MessageType::VoiceEnd)).await;
    }

    pub async fn configure(&mut self, json: &str) {
        self.send(Frame::new(MessageType::Config, json.as_bytes().to_vec())).await;
    }

    /// Next frame, or `None` at end of stream; panics after 5 s
    pub async fn next(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), read_frame(&mut self.reader))
            .await
            .expect("timed out waiting for a frame")
            .expect("malformed frame from server")
    }

    /// Read frames up to and including the first of `kind`
    pub async fn until(&mut self, kind: MessageType) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next().await {
            let done = frame.message_type() == Some(kind);
            frames.push(frame);
            if done {
                return frames;
            }
        }
        panic!("stream ended before {kind:?}; got {}", describe(&frames));
    }

    /// Close the write side and collect everything until the server hangs up
    pub async fn finish(mut self) -> (Vec<Frame>, Result<()>) {
        self.writer.shutdown().await.unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = self.next().await {
            frames.push(frame);
        }
        let result = tokio::time::timeout(Duration::from_secs(5), self.session)
            .await
            .expect("session did not stop")
            .expect("session panicked");
        (frames, result)
    }
}

/// Message types of `frames`, for order assertions
pub fn kinds(frames: &[Frame]) -> Vec<MessageType> {
    frames.iter().filter_map(Frame::message_type).collect()
}

/// Text payloads of `TEXT_DATA` frames
pub fn texts(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f.message_type() == Some(MessageType::TextData))
        .map(Frame::text_lossy)
        .collect()
}

/// `AUDIO_DATA` payloads, with sentinels shown as `<end>` and `<error>`
pub fn audio(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter(|f| f.message_type() == Some(MessageType::AudioData))
        .map(|f| {
            if f.is_sentence_end() {
                "<end>".to_string()
            } else if f.is_synthesis_error() {
                "<error>".to_string()
            } else {
                f.text_lossy()
            }
        })
        .collect()
}

pub fn describe(frames: &[Frame]) -> String {
    frames
        .iter()
        .map(|f| match f.message_type() {
            Some(MessageType::TextData | MessageType::Error) => format!("{:?}({})", f.message_type(), f.text_lossy()),
            Some(kind) => format!("{kind:?}"),
            None => format!("0x{:02X}", f.type_byte()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

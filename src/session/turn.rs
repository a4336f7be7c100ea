//! One user utterance being received

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

/// Audio accumulated between `VOICE_START` and `VOICE_END`
#[derive(Debug)]
pub struct Turn {
    id: u64,
    audio: BytesMut,
    started: Instant,
}

impl Turn {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            audio: BytesMut::new(),
            started: Instant::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Buffered audio size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.audio.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.audio.extend_from_slice(data);
    }

    /// Finalize the utterance, handing over its audio
    #[must_use]
    pub fn into_audio(self) -> Bytes {
        self.audio.freeze()
    }
}

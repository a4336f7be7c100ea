//! Reply pipeline: segmentation, synthesis and admission
//!
//! A [`GenerationPipeline`] turns recognized text into a streamed reply.
//! It feeds text through the [`Segmenter`] into a [`TtsWorker`], which
//! synthesizes each sentence and hands the audio to an [`AudioAssembler`].

mod admission;
mod assembler;
mod generation;
mod segmenter;
mod tts;

use std::sync::Arc;

pub use admission::{Admission, AdmissionStats, DEFAULT_CAPACITY, Permit};
pub use assembler::{AudioAssembler, SentenceFailure};
pub use generation::{
    GenerationOutcome, GenerationPipeline, GenerationRequest, GenerationState, MALFORMED_MARKER,
    PipelineConfig, TaskHandle, strip_marker,
};
pub use segmenter::{Segmenter, TERMINATORS};
pub use tts::{RetryPolicy, TtsCommand, TtsReport, TtsWorker};

use crate::agent::ReplyGenerator;
use crate::voice::{AudioConverter, Synthesizer, Transcriber};

/// External collaborators shared by every session and the HTTP API
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub converter: Arc<dyn AudioConverter>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Durations stored as integer milliseconds in configuration
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

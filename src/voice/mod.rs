//! Speech collaborators
//!
//! Recognition and synthesis are external services reached through the
//! [`Transcriber`] and [`Synthesizer`] traits. Format conversion is a pure
//! function behind [`AudioConverter`].

mod convert;
mod stt;
mod tts;

pub use convert::{AudioConverter, Mp3ToPcm, SAMPLE_RATE, is_wav, pcm16_to_wav, wav_to_pcm16};
pub use stt::{SpeechToText, SttProvider, Transcriber, accept_transcript};
pub use tts::{AudioStream, Synthesizer, TextToSpeech, TtsProvider};

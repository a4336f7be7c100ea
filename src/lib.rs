//! Voice Relay - real-time voice assistant server
//!
//! Clients stream recorded speech over a framed TCP connection. The relay
//! recognizes it, generates a reply with a language model and streams the
//! reply back as interleaved text and audio. A new utterance interrupts a
//! reply that is still playing (barge-in).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Listener ── one Session per connection               │
//! │     Session: frames ─► Turn ─► ASR ─► pending queue   │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ dispatcher (admission permits)
//! ┌────────────────────▼─────────────────────────────────┐
//! │  GenerationPipeline                                   │
//! │   reply stream ─► Segmenter ─► TtsWorker ─► Assembler │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ Outbox (cancellation-scoped frames)
//! ┌────────────────────▼─────────────────────────────────┐
//! │  writer task ─► FrameCodec ─► socket                  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod listener;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use listener::Listener;
pub use pipeline::Services;
pub use protocol::{Frame, FrameCodec, MessageType, ProtocolError};
pub use session::{Session, SessionConfig};

//! Error types for the voice relay

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed, oversized or truncated frame (fatal to the connection)
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Speech recognition produced no usable text
    #[error("recognition failed: {0}")]
    Recognition(String),

    /// Reply generation stream failed
    #[error("generation failed: {0}")]
    Generation(String),

    /// Speech synthesis failed
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// Synthesis returned a stream with no audio (not retried)
    #[error("no audio was produced for sentence")]
    NoAudio,

    /// Audio conversion error
    #[error("audio error: {0}")]
    Audio(String),

    /// Peer went away while a frame was being queued
    #[error("connection closed")]
    ConnectionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether a failed collaborator call is worth retrying
    ///
    /// Network-class failures are transient. Parameter-class failures
    /// (`NoAudio`, bad configuration, undecodable payloads) are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Io(_) | Self::Synthesis(_) | Self::Generation(_)
        )
    }
}

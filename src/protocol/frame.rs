//! Frame codec for the relay wire protocol
//!
//! Every frame is a fixed 5-byte header followed by the payload:
//!
//! ```text
//! +------+----------------------+-----------------+
//! | type | payload length (BE)  | payload         |
//! | u8   | u32                  | `length` bytes  |
//! +------+----------------------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

/// Header size: 1 byte type + 4 bytes big-endian length
pub const HEADER_LEN: usize = 5;

/// Largest payload accepted on the wire (1 MiB)
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// `AUDIO_DATA` payload marking the end of one sentence's audio
pub const SENTENCE_END: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];

/// `AUDIO_DATA` payload marking a sentence whose synthesis was given up
pub const SYNTHESIS_ERROR: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00];

/// Wire-level framing failures. All of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared payload length exceeds [`MAX_PAYLOAD_LEN`]
    #[error("frame payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    Oversized { len: usize },

    /// Stream ended before the declared frame was complete
    #[error("truncated frame: expected {expected} bytes, stream ended after {received}")]
    Truncated { expected: usize, received: usize },

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message types carried in the header's first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    VoiceStart = 0x01,
    VoiceData = 0x02,
    VoiceEnd = 0x03,
    TextData = 0x04,
    AudioData = 0x05,
    AiStart = 0x06,
    AiEnd = 0x07,
    AudioStart = 0x08,
    AudioEnd = 0x09,
    Error = 0x0A,
    AiCancelled = 0x0B,
    JsonResponse = 0x0C,
    Config = 0x0D,
    AiNewChat = 0x0E,
}

impl MessageType {
    /// Map a header byte to a known message type
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::VoiceStart,
            0x02 => Self::VoiceData,
            0x03 => Self::VoiceEnd,
            0x04 => Self::TextData,
            0x05 => Self::AudioData,
            0x06 => Self::AiStart,
            0x07 => Self::AiEnd,
            0x08 => Self::AudioStart,
            0x09 => Self::AudioEnd,
            0x0A => Self::Error,
            0x0B => Self::AiCancelled,
            0x0C => Self::JsonResponse,
            0x0D => Self::Config,
            0x0E => Self::AiNewChat,
            _ => return None,
        })
    }

    /// Header byte for this message type
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One decoded frame
///
/// The raw type byte is kept so that frames of unknown type can be skipped
/// without losing sync with the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    type_byte: u8,
    payload: Bytes,
}

impl Frame {
    /// Build a frame with the given payload
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            type_byte: kind.as_byte(),
            payload: payload.into(),
        }
    }

    /// Build a frame with an empty payload (start/end signals)
    #[must_use]
    pub const fn signal(kind: MessageType) -> Self {
        Self {
            type_byte: kind.as_byte(),
            payload: Bytes::new(),
        }
    }

    /// Build a frame carrying UTF-8 text
    #[must_use]
    pub fn text(kind: MessageType, text: &str) -> Self {
        Self::new(kind, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Build a frame carrying a JSON document
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    pub fn json<T: Serialize>(kind: MessageType, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(kind, serde_json::to_vec(value)?))
    }

    /// Build a frame from a raw type byte (used for forwarding unknown types)
    pub fn from_raw(type_byte: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            type_byte,
            payload: payload.into(),
        }
    }

    /// Raw header type byte
    #[must_use]
    pub const fn type_byte(&self) -> u8 {
        self.type_byte
    }

    /// Decoded message type, `None` for unknown bytes
    #[must_use]
    pub const fn message_type(&self) -> Option<MessageType> {
        MessageType::from_byte(self.type_byte)
    }

    /// Payload bytes
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload interpreted as UTF-8 text, lossily
    #[must_use]
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether this is the sentence-boundary sentinel on the audio channel
    #[must_use]
    pub fn is_sentence_end(&self) -> bool {
        self.message_type() == Some(MessageType::AudioData) && self.payload[..] == SENTENCE_END
    }

    /// Whether this is the synthesis-error marker on the audio channel
    #[must_use]
    pub fn is_synthesis_error(&self) -> bool {
        self.message_type() == Some(MessageType::AudioData) && self.payload[..] == SYNTHESIS_ERROR
    }

    /// Serialize header + payload into a fresh buffer
    ///
    /// Callers never build frames above [`MAX_PAYLOAD_LEN`]; the encoder
    /// rejects them.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.write_to(&mut dst);
        dst.freeze()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u8(self.type_byte);
        dst.put_u32(self.payload.len() as u32);
        dst.extend_from_slice(&self.payload);
    }
}

/// `tokio_util` codec for [`Frame`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    fn declared_len(src: &[u8]) -> usize {
        u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = Self::declared_len(src);
        if len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Oversized { len });
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let type_byte = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame { type_byte, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let expected = if src.len() < HEADER_LEN {
            HEADER_LEN
        } else {
            HEADER_LEN + Self::declared_len(src)
        };
        Err(ProtocolError::Truncated {
            expected,
            received: src.len(),
        })
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::Oversized {
                len: frame.payload.len(),
            });
        }
        frame.write_to(dst);
        Ok(())
    }
}

/// Read exactly one frame from `reader`
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
///
/// # Errors
///
/// Returns [`ProtocolError::Oversized`] for a declared length above the
/// limit and [`ProtocolError::Truncated`] if the stream ends mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0_u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            received: got,
        });
    }

    let len = FrameCodec::declared_len(&header);
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::Oversized { len });
    }

    let mut payload = vec![0_u8; len];
    let got = read_full(reader, &mut payload).await?;
    if got < len {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN + len,
            received: HEADER_LEN + got,
        });
    }

    Ok(Some(Frame {
        type_byte: header[0],
        payload: payload.into(),
    }))
}

/// Fill `buf` as far as the stream allows, returning the byte count read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

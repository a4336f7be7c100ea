//! Wire protocol shared by the relay and its clients

mod frame;
mod settings;

pub use frame::{
    Frame, FrameCodec, HEADER_LEN, MAX_PAYLOAD_LEN, MessageType, ProtocolError, SENTENCE_END,
    SYNTHESIS_ERROR, read_frame,
};
pub use settings::{AudioFormat, AudioMerge, ConfigUpdate, ResponseFormat, SessionSettings};

//! Protocol module containing the frame codec, the message abstraction, and
//! the paybox schema.

pub mod frame;
pub mod message;
pub mod paybox;

pub use frame::{
    decode_frame, encode_frame, Frame, FrameDecoder, FrameError, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use message::{decode_payload, Message, MessageType, PayloadError};

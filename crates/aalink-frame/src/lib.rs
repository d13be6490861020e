//! Wire framing for the Android Auto link: 16 logical channels
//! multiplexed over one byte stream.
//!
//! Every frame starts with a 4-byte header:
//!
//! ```text
//! ┌─────────────┬────────────┬─────────────────────┐
//! │ Channel (1B)│ Flags (1B) │ Payload length (2B) │
//! │ 0..15       │ see below  │ big-endian          │
//! └─────────────┴────────────┴─────────────────────┘
//! ```
//!
//! Flags: bit 0 more-frames-follow, bit 1 first-frame, bit 2 control
//! (vs channel-specific), bit 3 encrypted. FIRST frames additionally
//! carry a 4-byte big-endian total assembled message size between the
//! header and the payload.

pub mod channel;
pub mod frame;
pub mod message;

pub use channel::{channel_name, ChannelId, MAX_CHANNELS};
pub use frame::{
    split_payload, FrameHeader, FrameType, FRAME_HEADER_SIZE, TOTAL_SIZE_FIELD_SIZE,
};
pub use message::{EncryptionType, Message, MessageType, MESSAGE_ID_SIZE};

//! Frame header encoding and decoding, and the payload split plan.

use std::ops::Range;

use aalink_io::{Error, Result};
use bytes::{BufMut, BytesMut};

use crate::channel::ChannelId;
use crate::message::{EncryptionType, MessageType};

/// Header size on the wire: channel, flags, 2-byte payload length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of the total-message-size field a FIRST frame inserts between
/// the header and the payload.
pub const TOTAL_SIZE_FIELD_SIZE: usize = 4;

const FLAG_MORE_FRAMES: u8 = 1 << 0;
const FLAG_FIRST_FRAME: u8 = 1 << 1;
const FLAG_CONTROL: u8 = 1 << 2;
const FLAG_ENCRYPTED: u8 = 1 << 3;

/// Position of a frame within its message, derived from the
/// more-frames-follow and first-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Standalone frame carrying a whole message.
    Bulk,
    /// Opens a multi-frame message; carries the total assembled size.
    First,
    /// Continuation of a multi-frame message.
    Middle,
    /// Closes a multi-frame message.
    Last,
}

impl FrameType {
    fn from_flags(flags: u8) -> Self {
        let first = flags & FLAG_FIRST_FRAME != 0;
        let more = flags & FLAG_MORE_FRAMES != 0;
        match (first, more) {
            (true, true) => FrameType::First,
            (true, false) => FrameType::Bulk,
            (false, true) => FrameType::Middle,
            (false, false) => FrameType::Last,
        }
    }

    fn flag_bits(self) -> u8 {
        match self {
            FrameType::First => FLAG_FIRST_FRAME | FLAG_MORE_FRAMES,
            FrameType::Bulk => FLAG_FIRST_FRAME,
            FrameType::Middle => FLAG_MORE_FRAMES,
            FrameType::Last => 0,
        }
    }

    /// Whether this frame opens a message and therefore carries the
    /// 4-byte total size field.
    pub fn is_first(self) -> bool {
        matches!(self, FrameType::First)
    }

    /// Whether the message is complete after this frame.
    pub fn is_final(self) -> bool {
        matches!(self, FrameType::Bulk | FrameType::Last)
    }

    /// Whether this frame may start a new message.
    pub fn starts_message(self) -> bool {
        matches!(self, FrameType::First | FrameType::Bulk)
    }
}

/// Decoded 4-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel_id: ChannelId,
    pub frame_type: FrameType,
    pub encryption: EncryptionType,
    pub message_type: MessageType,
}

impl FrameHeader {
    /// Append the 4-byte header for a frame carrying `payload_len`
    /// payload bytes.
    pub fn encode(&self, payload_len: u16, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_SIZE);
        dst.put_u8(self.channel_id.raw());
        dst.put_u8(self.flags());
        dst.put_u16(payload_len);
    }

    /// Decode a header from the first [`FRAME_HEADER_SIZE`] bytes of
    /// `bytes`. Returns the header and this frame's payload length.
    pub fn decode(bytes: &[u8]) -> Result<(FrameHeader, u16)> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(Error::ParsePayload(format!(
                "frame header truncated: {} bytes",
                bytes.len()
            )));
        }
        let channel_id = ChannelId::new(bytes[0])
            .ok_or_else(|| Error::ParsePayload(format!("invalid channel id {}", bytes[0])))?;
        let flags = bytes[1];
        let payload_len = u16::from_be_bytes([bytes[2], bytes[3]]);
        Ok((
            FrameHeader {
                channel_id,
                frame_type: FrameType::from_flags(flags),
                encryption: if flags & FLAG_ENCRYPTED != 0 {
                    EncryptionType::Encrypted
                } else {
                    EncryptionType::Plain
                },
                message_type: if flags & FLAG_CONTROL != 0 {
                    MessageType::Control
                } else {
                    MessageType::Specific
                },
            },
            payload_len,
        ))
    }

    fn flags(&self) -> u8 {
        let mut flags = self.frame_type.flag_bits();
        if self.encryption == EncryptionType::Encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.message_type == MessageType::Control {
            flags |= FLAG_CONTROL;
        }
        flags
    }
}

/// Split a payload of `payload_len` bytes into the frame sequence for a
/// per-frame limit of `limit` bytes: one BULK frame when it fits,
/// otherwise FIRST, zero or more MIDDLE, and a LAST frame.
///
/// A zero-length payload still produces one (empty) BULK frame.
pub fn split_payload(payload_len: usize, limit: usize) -> Vec<(FrameType, Range<usize>)> {
    assert!(limit > 0, "frame payload limit must be positive");
    if payload_len <= limit {
        return vec![(FrameType::Bulk, 0..payload_len)];
    }

    let mut plan = Vec::with_capacity(payload_len.div_ceil(limit));
    let mut offset = 0;
    while offset < payload_len {
        let end = usize::min(offset + limit, payload_len);
        let frame_type = if offset == 0 {
            FrameType::First
        } else if end == payload_len {
            FrameType::Last
        } else {
            FrameType::Middle
        };
        plan.push((frame_type, offset..end));
        offset = end;
    }
    plan
}

#[cfg(test)]
mod tests {
    use crate::channel;

    use super::*;

    fn header(
        channel_id: ChannelId,
        frame_type: FrameType,
        encryption: EncryptionType,
        message_type: MessageType,
    ) -> FrameHeader {
        FrameHeader {
            channel_id,
            frame_type,
            encryption,
            message_type,
        }
    }

    #[test]
    fn encrypted_bulk_specific_is_bit_exact() {
        let mut wire = BytesMut::new();
        header(
            channel::MEDIA_AUDIO,
            FrameType::Bulk,
            EncryptionType::Encrypted,
            MessageType::Specific,
        )
        .encode(0x2A, &mut wire);

        assert_eq!(wire.as_ref(), &[0x04, 0b0000_1010, 0x00, 0x2A]);
    }

    #[test]
    fn plain_first_control_is_bit_exact() {
        let mut wire = BytesMut::new();
        header(
            channel::CONTROL,
            FrameType::First,
            EncryptionType::Plain,
            MessageType::Control,
        )
        .encode(4096, &mut wire);

        assert_eq!(wire.as_ref(), &[0x00, 0b0000_0111, 0x10, 0x00]);
    }

    #[test]
    fn last_frame_has_no_flag_bits() {
        let mut wire = BytesMut::new();
        header(
            channel::VIDEO,
            FrameType::Last,
            EncryptionType::Plain,
            MessageType::Specific,
        )
        .encode(1, &mut wire);

        assert_eq!(wire.as_ref(), &[0x03, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn decode_roundtrips_every_frame_type() {
        for frame_type in [
            FrameType::Bulk,
            FrameType::First,
            FrameType::Middle,
            FrameType::Last,
        ] {
            for encryption in [EncryptionType::Plain, EncryptionType::Encrypted] {
                for message_type in [MessageType::Control, MessageType::Specific] {
                    let original =
                        header(channel::BLUETOOTH, frame_type, encryption, message_type);
                    let mut wire = BytesMut::new();
                    original.encode(513, &mut wire);

                    let (decoded, payload_len) = FrameHeader::decode(&wire).unwrap();
                    assert_eq!(decoded, original);
                    assert_eq!(payload_len, 513);
                }
            }
        }
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = FrameHeader::decode(&[0x00, 0x02]).unwrap_err();
        assert!(matches!(err, Error::ParsePayload(_)));
    }

    #[test]
    fn decode_rejects_invalid_channel() {
        let err = FrameHeader::decode(&[0xFF, 0x02, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, Error::ParsePayload(_)));
    }

    #[test]
    fn payload_at_limit_is_one_bulk_frame() {
        let plan = split_payload(4096, 4096);
        assert_eq!(plan, vec![(FrameType::Bulk, 0..4096)]);
    }

    #[test]
    fn payload_one_over_limit_is_first_plus_last() {
        let plan = split_payload(4097, 4096);
        assert_eq!(
            plan,
            vec![(FrameType::First, 0..4096), (FrameType::Last, 4096..4097)]
        );
    }

    #[test]
    fn long_payload_has_middle_frames() {
        let plan = split_payload(10_000, 4096);
        assert_eq!(
            plan,
            vec![
                (FrameType::First, 0..4096),
                (FrameType::Middle, 4096..8192),
                (FrameType::Last, 8192..10_000),
            ]
        );
    }

    #[test]
    fn empty_payload_is_one_empty_bulk_frame() {
        let plan = split_payload(0, 4096);
        assert_eq!(plan, vec![(FrameType::Bulk, 0..0)]);
    }
}

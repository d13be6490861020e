//! Complete application-level messages carried by one or more frames.

use aalink_io::Data;

use crate::channel::ChannelId;

/// Whether a message travels as TLS ciphertext on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    Plain,
    Encrypted,
}

/// Control-channel plumbing versus channel-specific service traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Control,
    Specific,
}

/// A complete datum on one channel.
///
/// The payload begins with a 2-byte big-endian message id; what follows
/// is opaque to the link layer. A sender appends payload bytes until it
/// hands the message to the outbound stream; receivers get the message
/// fully assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    channel_id: ChannelId,
    encryption: EncryptionType,
    message_type: MessageType,
    payload: Data,
}

/// Size of the message-id prefix every payload starts with.
pub const MESSAGE_ID_SIZE: usize = 2;

impl Message {
    /// Create an empty message; the payload is filled by the sender or
    /// by frame reassembly.
    pub fn new(
        channel_id: ChannelId,
        encryption: EncryptionType,
        message_type: MessageType,
    ) -> Self {
        Self {
            channel_id,
            encryption,
            message_type,
            payload: Data::new(),
        }
    }

    /// Create a message with an id prefix and payload body in place.
    pub fn with_id(
        channel_id: ChannelId,
        encryption: EncryptionType,
        message_type: MessageType,
        message_id: u16,
        body: &[u8],
    ) -> Self {
        let mut message = Self::new(channel_id, encryption, message_type);
        let mut payload = Data::with_capacity(MESSAGE_ID_SIZE + body.len());
        payload.extend_from_slice(&message_id.to_be_bytes());
        payload.extend_from_slice(body);
        message.payload = payload;
        message
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn encryption(&self) -> EncryptionType {
        self.encryption
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The full payload, message id included.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The big-endian message id, if the payload carries one yet.
    pub fn message_id(&self) -> Option<u16> {
        if self.payload.len() < MESSAGE_ID_SIZE {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// The payload bytes after the message id.
    pub fn body(&self) -> &[u8] {
        aalink_io::view(&self.payload, MESSAGE_ID_SIZE)
    }

    /// Append bytes to the payload.
    pub fn insert_payload(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    /// Consume the message, keeping the payload allocation.
    pub fn into_payload(self) -> Data {
        self.payload
    }
}

//! Message layer: reassembly, fragmentation and channel demultiplexing
//! on top of a [`aalink_transport::Transport`].
//!
//! [`MessageInStream`] pulls frames off the transport, decrypts
//! encrypted payloads and reassembles multi-frame messages even when
//! frames of different channels interleave on the wire.
//! [`MessageOutStream`] does the reverse. [`StreamMessenger`] sits on
//! both and gives each service channel its own receive queue plus a
//! fair, link-wide FIFO send queue.
//!
//! The TLS handshake itself is driven by the embedding application as
//! PLAIN control-channel messages carrying [`Cryptor`] handshake blobs;
//! once the cryptor reports [`HandshakeState::Done`], encrypted frames
//! flow through [`Cryptor::encrypt`]/[`Cryptor::decrypt`] on their way
//! past the streams.

pub mod cryptor;
pub mod in_stream;
pub mod messenger;
pub mod out_stream;

#[cfg(test)]
pub(crate) mod tests_support;

pub use cryptor::{Cryptor, HandshakeState, TlsConfig, TlsCryptor};
pub use in_stream::MessageInStream;
pub use messenger::{Messenger, MessengerConfig, StreamMessenger};
pub use out_stream::{FrameConfig, MessageOutStream};

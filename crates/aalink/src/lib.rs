//! Host-side implementation of the Android Auto head-unit link layer.
//!
//! aalink connects to an Android device over USB (through the Android
//! Open Accessory Protocol) or TCP, runs a framed multi-channel
//! transport over the link, layers TLS on top, and exposes per-channel
//! message exchange to the embedding application. Service-level
//! protocol logic (video decoding, media browsing, input mapping) is
//! out of scope: this crate moves complete messages, each tagged with a
//! channel id and beginning with a 2-byte message id.
//!
//! # Layers
//!
//! ```text
//! application channels
//!         │  enqueue_receive / enqueue_send
//! ┌───────▼───────────┐
//! │ StreamMessenger   │ per-channel queues, FIFO send queue
//! ├───────────────────┤
//! │ MessageInStream / │ frame (re)assembly, per-frame TLS via Cryptor
//! │ MessageOutStream  │
//! ├───────────────────┤
//! │ Transport         │ exact-size reads, ordered writes
//! ├───────────────────┤
//! │ UsbTransport over │ AOAP bulk endpoints (UsbHub discovery) or a
//! │ TcpTransport      │ connected TCP socket
//! └───────────────────┘
//! ```
//!
//! # Concurrency
//!
//! Everything asynchronous is a [`Promise`] bound to an executor: the
//! shared [`WorkQueue`] or a serialized [`Strand`] of it. The embedding
//! application owns the worker threads:
//!
//! ```no_run
//! use aalink::WorkQueue;
//!
//! let queue = WorkQueue::new();
//! let workers: Vec<_> = (0..2)
//!     .map(|_| {
//!         let queue = queue.clone();
//!         std::thread::spawn(move || queue.run())
//!     })
//!     .collect();
//!
//! // ... build a hub / transport / messenger on `queue` ...
//!
//! queue.stop();
//! for worker in workers {
//!     worker.join().unwrap();
//! }
//! ```
//!
//! # Connecting over USB
//!
//! [`UsbHub::start`] resolves with a device handle once a phone is in
//! accessory mode (running the AOAP query chain first when needed);
//! [`AoapDevice::create`] claims its interface, and [`UsbTransport`]
//! plus the message streams complete the stack. The TLS handshake is
//! then driven as PLAIN control-channel messages carrying
//! [`Cryptor`] handshake blobs until the cryptor reports
//! [`HandshakeState::Done`], after which channels switch to ENCRYPTED
//! messages.

pub use aalink_frame::{
    channel, channel_name, ChannelId, EncryptionType, Message, MessageType, MAX_CHANNELS,
};
pub use aalink_io::{Data, Error, Executor, Promise, Result, Strand, WorkQueue};
pub use aalink_messenger::{
    Cryptor, FrameConfig, HandshakeState, MessageInStream, MessageOutStream, Messenger,
    MessengerConfig, StreamMessenger, TlsConfig, TlsCryptor,
};
pub use aalink_transport::{TcpEndpoint, TcpTransport, Transport, TransportConfig, UsbTransport};
pub use aalink_usb::{
    AccessoryModeQueryChain, AccessoryStrings, AoapDevice, DeviceHandle, DeviceRef,
    LibusbWrapper, UsbHub, UsbWrapper,
};

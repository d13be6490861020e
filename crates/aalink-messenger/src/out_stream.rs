//! Message-to-frame fragmentation.

use std::sync::Arc;

use std::ops::Range;

use aalink_frame::{
    split_payload, ChannelId, EncryptionType, FrameHeader, FrameType, Message, MessageType,
    FRAME_HEADER_SIZE, TOTAL_SIZE_FIELD_SIZE,
};
use aalink_io::{Data, Error, Promise, Strand, WorkQueue};
use aalink_transport::Transport;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::trace;

use crate::cryptor::Cryptor;

/// Per-frame payload sizing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Plaintext bytes carried by one frame. Must leave headroom below
    /// the wire's 16-bit length field once TLS record overhead is
    /// added.
    pub payload_limit: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { payload_limit: 4096 }
    }
}

/// Fragments one message at a time into frames, encrypting each
/// fragment for ENCRYPTED messages, and writes the frames sequentially
/// through the transport.
pub struct MessageOutStream {
    inner: Arc<OutStreamInner>,
}

struct OutStreamInner {
    strand: Strand,
    transport: Arc<dyn Transport>,
    cryptor: Arc<Mutex<dyn Cryptor>>,
    config: FrameConfig,
    state: Mutex<OutStreamState>,
}

#[derive(Default)]
struct OutStreamState {
    stopped: bool,
    current: Option<OutMessage>,
}

struct OutMessage {
    channel_id: ChannelId,
    encryption: EncryptionType,
    message_type: MessageType,
    payload: Data,
    /// Frame sequence for the payload, emitted front to back.
    plan: Vec<(FrameType, Range<usize>)>,
    next: usize,
    promise: Promise<()>,
}

/// What the next frame looks like, captured under the state lock.
struct FramePlan {
    channel_id: ChannelId,
    encryption: EncryptionType,
    message_type: MessageType,
    frame_type: FrameType,
    chunk: Data,
    total: usize,
    last: bool,
}

impl MessageOutStream {
    pub fn new(
        transport: Arc<dyn Transport>,
        cryptor: Arc<Mutex<dyn Cryptor>>,
        queue: &WorkQueue,
        config: FrameConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OutStreamInner {
                strand: Strand::new(queue),
                transport,
                cryptor,
                config,
                state: Mutex::new(OutStreamState::default()),
            }),
        }
    }

    /// Write one message as a frame sequence. The promise resolves once
    /// the last frame is handed to the transport successfully. Only one
    /// message streams at a time; a second call while busy rejects with
    /// [`Error::OperationInProgress`].
    pub fn stream(&self, message: Message, promise: Promise<()>) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            {
                let mut state = inner.state.lock();
                if state.stopped {
                    drop(state);
                    promise.reject(Error::OperationAborted);
                    return;
                }
                if state.current.is_some() {
                    drop(state);
                    promise.reject(Error::OperationInProgress);
                    return;
                }
                let channel_id = message.channel_id();
                let encryption = message.encryption();
                let message_type = message.message_type();
                let payload = message.into_payload();
                let plan = split_payload(payload.len(), inner.config.payload_limit.max(1));
                state.current = Some(OutMessage {
                    channel_id,
                    encryption,
                    message_type,
                    payload,
                    plan,
                    next: 0,
                    promise,
                });
            }
            OutStreamInner::send_next(&inner);
        });
    }

    /// Reject the in-flight message. The stream is not reusable
    /// afterwards.
    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let current = {
                let mut state = inner.state.lock();
                state.stopped = true;
                state.current.take()
            };
            if let Some(current) = current {
                current.promise.reject(Error::OperationAborted);
            }
        });
    }
}

impl OutStreamInner {
    /// Emit the next frame of the current message. Runs on the strand.
    fn send_next(inner: &Arc<Self>) {
        let plan = {
            let mut state = inner.state.lock();
            let Some(current) = state.current.as_mut() else {
                return;
            };
            let Some((frame_type, range)) = current.plan.get(current.next).cloned() else {
                return;
            };
            current.next += 1;
            FramePlan {
                channel_id: current.channel_id,
                encryption: current.encryption,
                message_type: current.message_type,
                frame_type,
                chunk: current.payload[range].to_vec(),
                total: current.payload.len(),
                last: current.next == current.plan.len(),
            }
        };

        let payload = if plan.encryption == EncryptionType::Encrypted {
            let mut ciphertext = Data::new();
            if let Err(err) = inner.cryptor.lock().encrypt(&plan.chunk, &mut ciphertext) {
                Self::fail(inner, err);
                return;
            }
            ciphertext
        } else {
            plan.chunk
        };

        let mut frame = BytesMut::with_capacity(
            FRAME_HEADER_SIZE + TOTAL_SIZE_FIELD_SIZE + payload.len(),
        );
        FrameHeader {
            channel_id: plan.channel_id,
            frame_type: plan.frame_type,
            encryption: plan.encryption,
            message_type: plan.message_type,
        }
        .encode(payload.len() as u16, &mut frame);
        if plan.frame_type.is_first() {
            frame.put_u32(plan.total as u32);
        }
        frame.extend_from_slice(&payload);
        trace!(
            channel = %plan.channel_id,
            frame_type = ?plan.frame_type,
            bytes = payload.len(),
            "frame out"
        );

        let last = plan.last;
        let sent = Promise::<()>::defer(&inner.strand);
        let on_sent = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        sent.then(
            move |_| {
                if last {
                    Self::finish(&on_sent);
                } else {
                    Self::send_next(&on_sent);
                }
            },
            move |err| Self::fail(&on_err, err),
        );
        inner.transport.send(frame.to_vec(), sent);
    }

    fn finish(inner: &Arc<Self>) {
        let current = inner.state.lock().current.take();
        if let Some(current) = current {
            current.promise.resolve(());
        }
    }

    fn fail(inner: &Arc<Self>, error: Error) {
        let current = inner.state.lock().current.take();
        if let Some(current) = current {
            current.promise.reject(error);
        }
    }
}

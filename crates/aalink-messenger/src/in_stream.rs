//! Frame-to-message reassembly.

use std::collections::HashMap;
use std::sync::Arc;

use aalink_frame::{ChannelId, EncryptionType, FrameHeader, Message, FRAME_HEADER_SIZE, TOTAL_SIZE_FIELD_SIZE};
use aalink_io::{Data, Error, Promise, Strand, WorkQueue};
use aalink_transport::Transport;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::cryptor::Cryptor;

/// Pulls frames off the transport, decrypts encrypted payloads and
/// reassembles multi-frame messages into complete [`Message`]s.
///
/// One receive cycle delivers one complete message, whatever channel it
/// ends on; frames of other channels arriving in between are parked in
/// a per-channel partial map that survives across cycles. The caller
/// (the messenger) demultiplexes by channel and re-arms with
/// [`start_receive`](Self::start_receive) while it wants more.
pub struct MessageInStream {
    inner: Arc<InStreamInner>,
}

struct InStreamInner {
    strand: Strand,
    transport: Arc<dyn Transport>,
    cryptor: Arc<Mutex<dyn Cryptor>>,
    state: Mutex<InStreamState>,
}

#[derive(Default)]
struct InStreamState {
    partial: HashMap<ChannelId, Message>,
    promise: Option<Promise<Message>>,
    /// Header of the frame currently being read, with its payload size.
    current: Option<(FrameHeader, u16)>,
    stopped: bool,
}

impl MessageInStream {
    pub fn new(
        transport: Arc<dyn Transport>,
        cryptor: Arc<Mutex<dyn Cryptor>>,
        queue: &WorkQueue,
    ) -> Self {
        Self {
            inner: Arc::new(InStreamInner {
                strand: Strand::new(queue),
                transport,
                cryptor,
                state: Mutex::new(InStreamState::default()),
            }),
        }
    }

    /// Begin one receive cycle. Rejects with
    /// [`Error::OperationInProgress`] when a cycle is already pending.
    pub fn start_receive(&self, promise: Promise<Message>) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            {
                let mut state = inner.state.lock();
                if state.stopped {
                    drop(state);
                    promise.reject(Error::OperationAborted);
                    return;
                }
                if state.promise.is_some() {
                    drop(state);
                    promise.reject(Error::OperationInProgress);
                    return;
                }
                state.promise = Some(promise);
            }
            InStreamInner::read_header(&inner);
        });
    }

    /// Reject the pending receive and drop all partial messages. The
    /// stream is not reusable afterwards.
    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let promise = {
                let mut state = inner.state.lock();
                state.stopped = true;
                state.partial.clear();
                state.current = None;
                state.promise.take()
            };
            if let Some(promise) = promise {
                promise.reject(Error::OperationAborted);
            }
        });
    }
}

impl InStreamInner {
    fn read_header(inner: &Arc<Self>) {
        let promise = Promise::<Data>::defer(&inner.strand);
        let on_data = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        promise.then(
            move |data| Self::header_received(&on_data, data),
            move |err| Self::fail(&on_err, err),
        );
        inner.transport.receive(FRAME_HEADER_SIZE, promise);
    }

    fn header_received(inner: &Arc<Self>, data: Data) {
        match FrameHeader::decode(&data) {
            Ok((header, payload_len)) => {
                trace!(
                    channel = %header.channel_id,
                    frame_type = ?header.frame_type,
                    payload_len,
                    "frame header"
                );
                inner.state.lock().current = Some((header, payload_len));
                if header.frame_type.is_first() {
                    Self::read_total_size(inner);
                } else {
                    Self::read_payload(inner, payload_len);
                }
            }
            Err(err) => Self::fail(inner, err),
        }
    }

    fn read_total_size(inner: &Arc<Self>) {
        let promise = Promise::<Data>::defer(&inner.strand);
        let on_data = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        promise.then(
            move |data| {
                if data.len() >= TOTAL_SIZE_FIELD_SIZE {
                    let total = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    trace!(total, "message opens");
                }
                let payload_len = on_data
                    .state
                    .lock()
                    .current
                    .map(|(_, payload_len)| payload_len);
                if let Some(payload_len) = payload_len {
                    Self::read_payload(&on_data, payload_len);
                }
            },
            move |err| Self::fail(&on_err, err),
        );
        inner.transport.receive(TOTAL_SIZE_FIELD_SIZE, promise);
    }

    fn read_payload(inner: &Arc<Self>, payload_len: u16) {
        let promise = Promise::<Data>::defer(&inner.strand);
        let on_data = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        promise.then(
            move |data| Self::payload_received(&on_data, data),
            move |err| Self::fail(&on_err, err),
        );
        inner.transport.receive(payload_len as usize, promise);
    }

    fn payload_received(inner: &Arc<Self>, bytes: Data) {
        let Some((header, _)) = inner.state.lock().current.take() else {
            return;
        };

        let mut message = {
            let mut state = inner.state.lock();
            if header.frame_type.starts_message() {
                if state.partial.remove(&header.channel_id).is_some() {
                    warn!(channel = %header.channel_id, "new message replaces unfinished one");
                }
                Message::new(header.channel_id, header.encryption, header.message_type)
            } else {
                // A continuation without an opening frame still yields a
                // message; garbage in, best effort out.
                state.partial.remove(&header.channel_id).unwrap_or_else(|| {
                    Message::new(header.channel_id, header.encryption, header.message_type)
                })
            }
        };

        if header.encryption == EncryptionType::Encrypted {
            let mut plaintext = Data::new();
            if let Err(err) = inner.cryptor.lock().decrypt(&bytes, &mut plaintext) {
                Self::fail(inner, err);
                return;
            }
            message.insert_payload(&plaintext);
        } else {
            message.insert_payload(&bytes);
        }

        if header.frame_type.is_final() {
            let promise = inner.state.lock().promise.take();
            if let Some(promise) = promise {
                trace!(channel = %message.channel_id(), bytes = message.payload().len(), "message complete");
                promise.resolve(message);
            }
            // The consumer re-arms with start_receive when it wants the
            // next message.
        } else {
            inner
                .state
                .lock()
                .partial
                .insert(header.channel_id, message);
            Self::read_header(inner);
        }
    }

    fn fail(inner: &Arc<Self>, error: Error) {
        let promise = {
            let mut state = inner.state.lock();
            state.current = None;
            state.promise.take()
        };
        if let Some(promise) = promise {
            promise.reject(error);
        }
    }
}

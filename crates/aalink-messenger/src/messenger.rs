//! Channel demultiplexing and the link-wide send queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aalink_frame::{ChannelId, Message, MAX_CHANNELS};
use aalink_io::{Error, Promise, Strand, WorkQueue};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::in_stream::MessageInStream;
use crate::out_stream::MessageOutStream;

/// Send-side bounds.
#[derive(Debug, Clone, Default)]
pub struct MessengerConfig {
    /// Upper bound on queued sends; `None` means unbounded. Exceeding
    /// it rejects the enqueue with [`Error::SendQueueOverflow`].
    pub max_outstanding_sends: Option<usize>,
}

/// Channel-level message exchange.
///
/// Receivers ask for the next message on one channel; senders push
/// complete messages. The implementation demultiplexes the wire behind
/// this interface, so service channels can be developed and tested
/// against a fake.
pub trait Messenger: Send + Sync {
    /// Deliver the next message on `channel_id` to `promise`. A message
    /// that arrived early is delivered straight from the buffer, with
    /// no wire activity.
    fn enqueue_receive(&self, channel_id: ChannelId, promise: Promise<Message>);

    /// Queue a message for transmission. Sends are FIFO across all
    /// channels; the promise resolves once the message's last frame is
    /// written.
    fn enqueue_send(&self, message: Message, promise: Promise<()>);

    /// Reject everything pending and refuse further work. Idempotent.
    fn stop(&self);
}

/// [`Messenger`] over a [`MessageInStream`]/[`MessageOutStream`] pair.
pub struct StreamMessenger {
    inner: Arc<MessengerInner>,
}

struct MessengerInner {
    receive_strand: Strand,
    send_strand: Strand,
    in_stream: MessageInStream,
    out_stream: MessageOutStream,
    config: MessengerConfig,
    stopped: AtomicBool,
    receive_state: Mutex<ReceiveState>,
    send_state: Mutex<SendState>,
}

struct ReceiveState {
    /// Pending receive promises per channel. A channel never has both
    /// pending promises and buffered messages.
    promises: [VecDeque<Promise<Message>>; MAX_CHANNELS],
    /// Messages that arrived before anyone asked, per channel.
    messages: [VecDeque<Message>; MAX_CHANNELS],
    /// Pending promises across all channels; the in-stream is armed
    /// exactly while this is non-zero.
    pending_total: usize,
}

struct SendEntry {
    /// Taken when the message is handed to the out stream.
    message: Option<Message>,
    promise: Promise<()>,
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<SendEntry>,
}

impl StreamMessenger {
    pub fn new(
        in_stream: MessageInStream,
        out_stream: MessageOutStream,
        queue: &WorkQueue,
        config: MessengerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MessengerInner {
                receive_strand: Strand::new(queue),
                send_strand: Strand::new(queue),
                in_stream,
                out_stream,
                config,
                stopped: AtomicBool::new(false),
                receive_state: Mutex::new(ReceiveState {
                    promises: std::array::from_fn(|_| VecDeque::new()),
                    messages: std::array::from_fn(|_| VecDeque::new()),
                    pending_total: 0,
                }),
                send_state: Mutex::new(SendState::default()),
            }),
        }
    }
}

impl Messenger for StreamMessenger {
    fn enqueue_receive(&self, channel_id: ChannelId, promise: Promise<Message>) {
        if self.inner.is_stopped() {
            promise.reject(Error::OperationAborted);
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.receive_strand.dispatch(move || {
            if inner.is_stopped() {
                promise.reject(Error::OperationAborted);
                return;
            }
            let (buffered, arm) = {
                let mut state = inner.receive_state.lock();
                if let Some(message) = state.messages[channel_id.index()].pop_front() {
                    (Some((promise, message)), false)
                } else {
                    state.promises[channel_id.index()].push_back(promise);
                    state.pending_total += 1;
                    (None, state.pending_total == 1)
                }
            };
            match buffered {
                Some((promise, message)) => {
                    trace!(channel = %channel_id, "buffered message delivered");
                    promise.resolve(message);
                }
                None => {
                    if arm {
                        MessengerInner::arm_in_stream(&inner);
                    }
                }
            }
        });
    }

    fn enqueue_send(&self, message: Message, promise: Promise<()>) {
        if self.inner.is_stopped() {
            promise.reject(Error::OperationAborted);
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.send_strand.dispatch(move || {
            if inner.is_stopped() {
                promise.reject(Error::OperationAborted);
                return;
            }
            let first = {
                let mut state = inner.send_state.lock();
                if let Some(bound) = inner.config.max_outstanding_sends {
                    if state.queue.len() >= bound {
                        drop(state);
                        promise.reject(Error::SendQueueOverflow);
                        return;
                    }
                }
                state.queue.push_back(SendEntry {
                    message: Some(message),
                    promise,
                });
                state.queue.len() == 1
            };
            if first {
                MessengerInner::do_send(&inner);
            }
        });
    }

    fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping messenger");
        self.inner.in_stream.stop();
        self.inner.out_stream.stop();

        let receive_inner = Arc::clone(&self.inner);
        self.inner.receive_strand.dispatch(move || {
            let drained = {
                let mut state = receive_inner.receive_state.lock();
                state.pending_total = 0;
                let mut drained = Vec::new();
                for queue in state.promises.iter_mut() {
                    drained.extend(queue.drain(..));
                }
                for queue in state.messages.iter_mut() {
                    queue.clear();
                }
                drained
            };
            for promise in drained {
                promise.reject(Error::OperationAborted);
            }
        });

        let send_inner = Arc::clone(&self.inner);
        self.inner.send_strand.dispatch(move || {
            MessengerInner::reject_send_queue(&send_inner, Error::OperationAborted);
        });
    }
}

impl MessengerInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Start one in-stream receive cycle. Runs on the receive strand.
    fn arm_in_stream(inner: &Arc<Self>) {
        let cycle = Promise::<Message>::defer(&inner.receive_strand);
        let on_message = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        cycle.then(
            move |message| Self::in_stream_handler(&on_message, message),
            move |err| Self::reject_receive_promises(&on_err, err),
        );
        inner.in_stream.start_receive(cycle);
    }

    /// Route one complete message, then keep the in-stream armed while
    /// any channel still has a pending promise.
    fn in_stream_handler(inner: &Arc<Self>, message: Message) {
        if inner.is_stopped() {
            return;
        }
        let channel_id = message.channel_id();
        let (delivery, rearm) = {
            let mut state = inner.receive_state.lock();
            let delivery = match state.promises[channel_id.index()].pop_front() {
                Some(promise) => {
                    state.pending_total -= 1;
                    Some((promise, message))
                }
                None => {
                    trace!(channel = %channel_id, "no receiver, buffering message");
                    state.messages[channel_id.index()].push_back(message);
                    None
                }
            };
            (delivery, state.pending_total > 0)
        };
        if let Some((promise, message)) = delivery {
            promise.resolve(message);
        }
        if rearm {
            Self::arm_in_stream(inner);
        }
    }

    fn reject_receive_promises(inner: &Arc<Self>, error: Error) {
        let drained = {
            let mut state = inner.receive_state.lock();
            state.pending_total = 0;
            let mut drained = Vec::new();
            for queue in state.promises.iter_mut() {
                drained.extend(queue.drain(..));
            }
            drained
        };
        for promise in drained {
            promise.reject(error.clone());
        }
    }

    /// Hand the head of the send queue to the out stream. Runs on the
    /// send strand.
    fn do_send(inner: &Arc<Self>) {
        let message = {
            let mut state = inner.send_state.lock();
            match state.queue.front_mut() {
                Some(entry) => entry.message.take(),
                None => None,
            }
        };
        let Some(message) = message else {
            return;
        };

        let streamed = Promise::<()>::defer(&inner.send_strand);
        let on_done = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        streamed.then(
            move |_| Self::send_finished(&on_done),
            move |err| Self::reject_send_queue(&on_err, err),
        );
        inner.out_stream.stream(message, streamed);
    }

    fn send_finished(inner: &Arc<Self>) {
        if inner.is_stopped() {
            return;
        }
        let (promise, more) = {
            let mut state = inner.send_state.lock();
            match state.queue.pop_front() {
                Some(entry) => (Some(entry.promise), !state.queue.is_empty()),
                None => (None, false),
            }
        };
        if let Some(promise) = promise {
            promise.resolve(());
        }
        if more {
            Self::do_send(inner);
        }
    }

    fn reject_send_queue(inner: &Arc<Self>, error: Error) {
        let drained: Vec<_> = {
            let mut state = inner.send_state.lock();
            state.queue.drain(..).collect()
        };
        for entry in drained {
            entry.promise.reject(error.clone());
        }
    }
}

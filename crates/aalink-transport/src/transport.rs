//! The transport contract and the queue machinery shared by its USB
//! and TCP implementations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aalink_io::{Data, Error, Promise, Strand, WorkQueue};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::sink::ReceiveSink;

/// Timeouts and transfer sizing shared by the transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for one outgoing transfer.
    pub send_timeout: Duration,
    /// Timeout for one incoming transfer; zero means wait forever.
    pub receive_timeout: Duration,
    /// Upper bound on a single outgoing USB bulk transfer.
    pub max_transfer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(10_000),
            receive_timeout: Duration::ZERO,
            max_transfer_size: 4096,
        }
    }
}

/// Byte broker over one physical link.
///
/// `receive` resolves with exactly `size` bytes once they arrived;
/// requests are served strictly in order. `send` writes the whole
/// buffer; sends are strictly FIFO. `stop` cancels underlying I/O and
/// rejects everything queued with [`Error::OperationAborted`]; the
/// transport is not reusable afterwards.
pub trait Transport: Send + Sync {
    fn receive(&self, size: usize, promise: Promise<Data>);
    fn send(&self, data: Data, promise: Promise<()>);
    fn stop(&self);
}

/// Physical byte mover beneath a [`TransportCore`].
pub(crate) trait TransportIo: Send + Sync + 'static {
    /// Read up to `max` bytes; resolve with whatever arrived.
    fn start_receive(&self, max: usize, promise: Promise<Data>);
    /// Write one chunk; resolve with the byte count actually written.
    fn start_send(&self, chunk: &[u8], promise: Promise<usize>);
    /// Tear down outstanding I/O; in-flight completions reject with
    /// [`Error::OperationAborted`].
    fn cancel(&self);
}

/// Receive-queue distribution and send-queue sequencing, generic over
/// the physical endpoint.
pub(crate) struct TransportCore<I: TransportIo> {
    inner: Arc<CoreInner<I>>,
}

struct CoreInner<I> {
    io: I,
    receive_strand: Strand,
    send_strand: Strand,
    /// Chunk bound for one `start_send`; `usize::MAX` sends the whole
    /// remainder at once.
    max_chunk: usize,
    stopped: AtomicBool,
    receive_state: Mutex<ReceiveState>,
    send_state: Mutex<SendState>,
}

#[derive(Default)]
struct ReceiveState {
    queue: VecDeque<(usize, Promise<Data>)>,
    sink: ReceiveSink,
}

struct SendEntry {
    data: Data,
    offset: usize,
    promise: Promise<()>,
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<SendEntry>,
}

impl<I: TransportIo> TransportCore<I> {
    pub(crate) fn new(io: I, queue: &WorkQueue, max_chunk: usize) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                io,
                receive_strand: Strand::new(queue),
                send_strand: Strand::new(queue),
                max_chunk,
                stopped: AtomicBool::new(false),
                receive_state: Mutex::new(ReceiveState::default()),
                send_state: Mutex::new(SendState::default()),
            }),
        }
    }

    pub(crate) fn receive(&self, size: usize, promise: Promise<Data>) {
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
            let first = {
                let mut state = inner.receive_state.lock();
                state.queue.push_back((size, promise));
                state.queue.len() == 1
            };
            // A non-empty queue already has a refill in flight; its
            // completion re-runs the distribution loop.
            if first {
                CoreInner::distribute(&inner);
            }
        });
    }

    pub(crate) fn send(&self, data: Data, promise: Promise<()>) {
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
                state.queue.push_back(SendEntry {
                    data,
                    offset: 0,
                    promise,
                });
                state.queue.len() == 1
            };
            if first {
                CoreInner::do_send(&inner);
            }
        });
    }

    pub(crate) fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping transport");
        self.inner.io.cancel();

        let receive_inner = Arc::clone(&self.inner);
        self.inner.receive_strand.dispatch(move || {
            CoreInner::reject_receive_queue(&receive_inner, Error::OperationAborted);
        });
        let send_inner = Arc::clone(&self.inner);
        self.inner.send_strand.dispatch(move || {
            CoreInner::reject_send_queue(&send_inner, Error::OperationAborted);
        });
    }
}

enum ReceiveStep {
    Resolve(Promise<Data>, Data),
    Refill(usize),
    Idle,
}

enum SendStep {
    Finished(Promise<()>, bool),
    Partial,
    Idle,
}

impl<I: TransportIo> CoreInner<I> {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Serve receive requests head-first from the sink; ask the
    /// endpoint for more bytes as soon as the head cannot be satisfied.
    /// Runs on the receive strand.
    fn distribute(inner: &Arc<Self>) {
        loop {
            let step = {
                let mut state = inner.receive_state.lock();
                match state.queue.pop_front() {
                    None => ReceiveStep::Idle,
                    Some((wanted, promise)) => {
                        if state.sink.len() >= wanted {
                            let data = state.sink.consume(wanted);
                            ReceiveStep::Resolve(promise, data)
                        } else {
                            let refill = state.sink.refill_size(wanted);
                            state.queue.push_front((wanted, promise));
                            ReceiveStep::Refill(refill)
                        }
                    }
                }
            };
            match step {
                ReceiveStep::Resolve(promise, data) => {
                    trace!(bytes = data.len(), "receive request satisfied");
                    promise.resolve(data);
                }
                ReceiveStep::Refill(refill) => {
                    Self::request_refill(inner, refill);
                    return;
                }
                ReceiveStep::Idle => return,
            }
        }
    }

    fn request_refill(inner: &Arc<Self>, max: usize) {
        let refill = Promise::<Data>::defer(&inner.receive_strand);
        let on_data = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        refill.then(
            move |data| {
                if on_data.is_stopped() {
                    return;
                }
                trace!(bytes = data.len(), "refill arrived");
                on_data.receive_state.lock().sink.commit(data);
                Self::distribute(&on_data);
            },
            move |err| Self::reject_receive_queue(&on_err, err),
        );
        inner.io.start_receive(max, refill);
    }

    /// Push the head of the send queue to the endpoint, one chunk at a
    /// time. Runs on the send strand.
    fn do_send(inner: &Arc<Self>) {
        let io_promise = Promise::<usize>::defer(&inner.send_strand);
        let on_written = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        io_promise.then(
            move |written| Self::send_progress(&on_written, written),
            move |err| Self::reject_send_queue(&on_err, err),
        );

        let chunk = {
            let state = inner.send_state.lock();
            state.queue.front().map(|entry| {
                let end =
                    usize::min(entry.offset.saturating_add(inner.max_chunk), entry.data.len());
                entry.data[entry.offset..end].to_vec()
            })
        };
        if let Some(chunk) = chunk {
            inner.io.start_send(&chunk, io_promise);
        }
        // An empty queue here means stop() already swept it; the
        // dropped promise rejects itself.
    }

    fn send_progress(inner: &Arc<Self>, written: usize) {
        if inner.is_stopped() {
            return;
        }
        let step = {
            let mut state = inner.send_state.lock();
            match state.queue.pop_front() {
                None => SendStep::Idle,
                Some(mut entry) => {
                    entry.offset += written;
                    if entry.offset >= entry.data.len() {
                        SendStep::Finished(entry.promise, !state.queue.is_empty())
                    } else {
                        state.queue.push_front(entry);
                        SendStep::Partial
                    }
                }
            }
        };
        match step {
            SendStep::Finished(promise, more_queued) => {
                promise.resolve(());
                if more_queued {
                    Self::do_send(inner);
                }
            }
            SendStep::Partial => Self::do_send(inner),
            SendStep::Idle => {}
        }
    }

    fn reject_receive_queue(inner: &Arc<Self>, error: Error) {
        let drained: Vec<_> = {
            let mut state = inner.receive_state.lock();
            state.sink.clear();
            state.queue.drain(..).collect()
        };
        for (_, promise) in drained {
            promise.reject(error.clone());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockIoState {
        receives: VecDeque<(usize, Promise<Data>)>,
        sends: VecDeque<(Data, Promise<usize>)>,
        cancelled: bool,
    }

    #[derive(Clone, Default)]
    struct MockIo {
        state: Arc<Mutex<MockIoState>>,
    }

    impl MockIo {
        fn receive_requests(&self) -> usize {
            self.state.lock().receives.len()
        }

        fn complete_receive(&self, data: Data) {
            let (_, promise) = self
                .state
                .lock()
                .receives
                .pop_front()
                .expect("no receive outstanding");
            promise.resolve(data);
        }

        fn fail_receive(&self, error: Error) {
            let (_, promise) = self
                .state
                .lock()
                .receives
                .pop_front()
                .expect("no receive outstanding");
            promise.reject(error);
        }

        fn sent_chunks(&self) -> Vec<Data> {
            self.state
                .lock()
                .sends
                .iter()
                .map(|(chunk, _)| chunk.clone())
                .collect()
        }

        fn complete_send(&self, written: usize) {
            let (_, promise) = self
                .state
                .lock()
                .sends
                .pop_front()
                .expect("no send outstanding");
            promise.resolve(written);
        }

        fn fail_send(&self, error: Error) {
            let (_, promise) = self
                .state
                .lock()
                .sends
                .pop_front()
                .expect("no send outstanding");
            promise.reject(error);
        }
    }

    impl TransportIo for MockIo {
        fn start_receive(&self, max: usize, promise: Promise<Data>) {
            self.state.lock().receives.push_back((max, promise));
        }

        fn start_send(&self, chunk: &[u8], promise: Promise<usize>) {
            self.state.lock().sends.push_back((chunk.to_vec(), promise));
        }

        fn cancel(&self) {
            self.state.lock().cancelled = true;
        }
    }

    fn receive_into(
        core: &TransportCore<MockIo>,
        queue: &WorkQueue,
        size: usize,
    ) -> Arc<Mutex<Option<Result<Data, Error>>>> {
        let slot = Arc::new(Mutex::new(None));
        let promise = Promise::<Data>::defer(queue);
        let on_ok = Arc::clone(&slot);
        let on_err = Arc::clone(&slot);
        promise.then(
            move |data| *on_ok.lock() = Some(Ok(data)),
            move |err| *on_err.lock() = Some(Err(err)),
        );
        core.receive(size, promise);
        slot
    }

    fn send_into(
        core: &TransportCore<MockIo>,
        queue: &WorkQueue,
        data: Data,
    ) -> Arc<Mutex<Option<Result<(), Error>>>> {
        let slot = Arc::new(Mutex::new(None));
        let promise = Promise::<()>::defer(queue);
        let on_ok = Arc::clone(&slot);
        let on_err = Arc::clone(&slot);
        promise.then(
            move |_| *on_ok.lock() = Some(Ok(())),
            move |err| *on_err.lock() = Some(Err(err)),
        );
        core.send(data, promise);
        slot
    }

    #[test]
    fn one_refill_serves_multiple_requests() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let first = receive_into(&core, &queue, 4);
        let second = receive_into(&core, &queue, 6);
        queue.poll();

        // Only the head triggers a refill.
        assert_eq!(io.receive_requests(), 1);
        io.complete_receive((0u8..10).collect());
        queue.poll();

        assert_eq!(first.lock().clone(), Some(Ok(vec![0, 1, 2, 3])));
        assert_eq!(second.lock().clone(), Some(Ok(vec![4, 5, 6, 7, 8, 9])));
    }

    #[test]
    fn short_refills_accumulate_until_satisfied() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let slot = receive_into(&core, &queue, 4);
        queue.poll();

        io.complete_receive(vec![1, 2]);
        queue.poll();
        assert!(slot.lock().is_none());
        assert_eq!(io.receive_requests(), 1);

        io.complete_receive(vec![3, 4]);
        queue.poll();
        assert_eq!(slot.lock().clone(), Some(Ok(vec![1, 2, 3, 4])));
    }

    #[test]
    fn buffered_bytes_resolve_without_wire_activity() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let first = receive_into(&core, &queue, 2);
        queue.poll();
        io.complete_receive(vec![1, 2, 3, 4, 5]);
        queue.poll();
        assert_eq!(first.lock().clone(), Some(Ok(vec![1, 2])));

        // Leftovers serve the next request straight from the sink.
        let second = receive_into(&core, &queue, 3);
        queue.poll();
        assert_eq!(second.lock().clone(), Some(Ok(vec![3, 4, 5])));
        assert_eq!(io.receive_requests(), 0);
    }

    #[test]
    fn send_is_chunked_and_resolves_after_last_chunk() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, 4);

        let slot = send_into(&core, &queue, (0u8..10).collect());
        queue.poll();

        assert_eq!(io.sent_chunks(), vec![vec![0, 1, 2, 3]]);
        io.complete_send(4);
        queue.poll();
        assert_eq!(io.sent_chunks(), vec![vec![4, 5, 6, 7]]);
        assert!(slot.lock().is_none());

        io.complete_send(4);
        queue.poll();
        assert_eq!(io.sent_chunks(), vec![vec![8, 9]]);
        io.complete_send(2);
        queue.poll();

        assert_eq!(slot.lock().clone(), Some(Ok(())));
    }

    #[test]
    fn partial_writes_advance_the_offset() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let slot = send_into(&core, &queue, vec![9, 8, 7, 6]);
        queue.poll();
        assert_eq!(io.sent_chunks(), vec![vec![9, 8, 7, 6]]);

        io.complete_send(1);
        queue.poll();
        // The unwritten tail goes out again.
        assert_eq!(io.sent_chunks(), vec![vec![8, 7, 6]]);
        io.complete_send(3);
        queue.poll();
        assert_eq!(slot.lock().clone(), Some(Ok(())));
    }

    #[test]
    fn queued_sends_run_in_fifo_order() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let first = send_into(&core, &queue, vec![1]);
        let second = send_into(&core, &queue, vec![2]);
        queue.poll();

        // Second transfer waits for the first.
        assert_eq!(io.sent_chunks(), vec![vec![1]]);
        io.complete_send(1);
        queue.poll();
        assert_eq!(first.lock().clone(), Some(Ok(())));
        assert_eq!(io.sent_chunks(), vec![vec![2]]);

        io.complete_send(1);
        queue.poll();
        assert_eq!(second.lock().clone(), Some(Ok(())));
    }

    #[test]
    fn receive_error_rejects_every_queued_request() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let first = receive_into(&core, &queue, 4);
        let second = receive_into(&core, &queue, 8);
        queue.poll();

        io.fail_receive(Error::UsbTransfer(-4));
        queue.poll();

        assert_eq!(first.lock().clone(), Some(Err(Error::UsbTransfer(-4))));
        assert_eq!(second.lock().clone(), Some(Err(Error::UsbTransfer(-4))));
    }

    #[test]
    fn send_error_rejects_every_queued_send() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let first = send_into(&core, &queue, vec![1]);
        let second = send_into(&core, &queue, vec![2]);
        queue.poll();

        io.fail_send(Error::TcpTransfer(32));
        queue.poll();

        assert_eq!(first.lock().clone(), Some(Err(Error::TcpTransfer(32))));
        assert_eq!(second.lock().clone(), Some(Err(Error::TcpTransfer(32))));
    }

    #[test]
    fn stop_rejects_pending_and_later_requests() {
        let queue = WorkQueue::new();
        let io = MockIo::default();
        let core = TransportCore::new(io.clone(), &queue, usize::MAX);

        let pending_receive = receive_into(&core, &queue, 4);
        let pending_send = send_into(&core, &queue, vec![1, 2]);
        queue.poll();

        core.stop();
        queue.poll();
        assert!(io.state.lock().cancelled);
        assert_eq!(
            pending_receive.lock().clone(),
            Some(Err(Error::OperationAborted))
        );
        assert_eq!(
            pending_send.lock().clone(),
            Some(Err(Error::OperationAborted))
        );

        let late_receive = receive_into(&core, &queue, 1);
        let late_send = send_into(&core, &queue, vec![3]);
        queue.poll();
        assert_eq!(
            late_receive.lock().clone(),
            Some(Err(Error::OperationAborted))
        );
        assert_eq!(late_send.lock().clone(), Some(Err(Error::OperationAborted)));

        // Idempotent.
        core.stop();
        queue.poll();
    }
}

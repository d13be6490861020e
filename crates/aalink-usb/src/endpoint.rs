//! Per-endpoint asynchronous transfer queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aalink_io::{Data, Error, Promise, Strand, WorkQueue};
use parking_lot::Mutex;
use tracing::trace;

use crate::wrapper::{ControlSetup, DeviceHandle, TransferId, UsbWrapper};

/// One endpoint of an open device: bulk transfers on a data endpoint,
/// control transfers on endpoint 0.
///
/// Every outstanding transfer is tracked in a map keyed by its transfer
/// id, and the endpoint holds a strong reference to itself while the
/// map is non-empty, so a completion callback owned by the wrapper
/// always finds its state alive. Dropping that reference when the last
/// transfer settles is the teardown condition.
pub struct UsbEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    wrapper: Arc<dyn UsbWrapper>,
    strand: Strand,
    handle: DeviceHandle,
    address: u8,
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    reads: HashMap<TransferId, Promise<Data>>,
    writes: HashMap<TransferId, Promise<usize>>,
    /// Keeps the endpoint alive while the wrapper owns callbacks into it.
    self_ref: Option<Arc<EndpointInner>>,
}

impl EndpointState {
    fn transfer_count(&self) -> usize {
        self.reads.len() + self.writes.len()
    }
}

impl UsbEndpoint {
    pub fn new(
        wrapper: Arc<dyn UsbWrapper>,
        queue: &WorkQueue,
        handle: DeviceHandle,
        address: u8,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                wrapper,
                strand: Strand::new(queue),
                handle,
                address,
                state: Mutex::new(EndpointState::default()),
            }),
        }
    }

    /// Endpoint address, direction bit included.
    pub fn address(&self) -> u8 {
        self.inner.address
    }

    /// Read up to `len` bytes from a bulk IN endpoint. Resolves with
    /// the bytes that arrived.
    pub fn bulk_read(&self, len: usize, timeout: Duration, promise: Promise<Data>) {
        if self.inner.address == 0 {
            promise.reject(Error::UsbInvalidTransferMethod);
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let Some(id) = inner.wrapper.allocate_transfer() else {
                promise.reject(Error::UsbTransferAllocation);
                return;
            };
            inner.track_read(id, promise);
            let completion = Arc::clone(&inner);
            inner.wrapper.submit_bulk_read(
                id,
                &inner.handle,
                inner.address,
                len,
                timeout,
                Box::new(move |result| EndpointInner::complete_read(completion, id, result)),
            );
        });
    }

    /// Write `data` to a bulk OUT endpoint. Resolves with the byte
    /// count actually transferred, which may be short.
    pub fn bulk_write(&self, data: Data, timeout: Duration, promise: Promise<usize>) {
        if self.inner.address == 0 {
            promise.reject(Error::UsbInvalidTransferMethod);
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let Some(id) = inner.wrapper.allocate_transfer() else {
                promise.reject(Error::UsbTransferAllocation);
                return;
            };
            inner.track_write(id, promise);
            let completion = Arc::clone(&inner);
            inner.wrapper.submit_bulk_write(
                id,
                &inner.handle,
                inner.address,
                data,
                timeout,
                Box::new(move |result| EndpointInner::complete_write(completion, id, result)),
            );
        });
    }

    /// IN control transfer on endpoint 0. Resolves with the response
    /// bytes.
    pub fn control_read(
        &self,
        setup: ControlSetup,
        len: usize,
        timeout: Duration,
        promise: Promise<Data>,
    ) {
        if self.inner.address != 0 {
            promise.reject(Error::UsbInvalidTransferMethod);
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let Some(id) = inner.wrapper.allocate_transfer() else {
                promise.reject(Error::UsbTransferAllocation);
                return;
            };
            inner.track_read(id, promise);
            let completion = Arc::clone(&inner);
            inner.wrapper.submit_control_read(
                id,
                &inner.handle,
                setup,
                len,
                timeout,
                Box::new(move |result| EndpointInner::complete_read(completion, id, result)),
            );
        });
    }

    /// OUT control transfer on endpoint 0. Resolves with the byte count
    /// written.
    pub fn control_write(
        &self,
        setup: ControlSetup,
        data: Data,
        timeout: Duration,
        promise: Promise<usize>,
    ) {
        if self.inner.address != 0 {
            promise.reject(Error::UsbInvalidTransferMethod);
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let Some(id) = inner.wrapper.allocate_transfer() else {
                promise.reject(Error::UsbTransferAllocation);
                return;
            };
            inner.track_write(id, promise);
            let completion = Arc::clone(&inner);
            inner.wrapper.submit_control_write(
                id,
                &inner.handle,
                setup,
                data,
                timeout,
                Box::new(move |result| EndpointInner::complete_write(completion, id, result)),
            );
        });
    }

    /// Cancel every outstanding transfer on this endpoint. Each settles
    /// individually through its own callback with
    /// [`Error::OperationAborted`].
    pub fn cancel_transfers(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let ids: Vec<TransferId> = {
                let state = inner.state.lock();
                state
                    .reads
                    .keys()
                    .chain(state.writes.keys())
                    .copied()
                    .collect()
            };
            trace!(
                endpoint = inner.address,
                transfers = ids.len(),
                "cancelling transfers"
            );
            for id in ids {
                inner.wrapper.cancel_transfer(id);
            }
        });
    }
}

impl EndpointInner {
    /// Record an outstanding transfer and pin the endpoint alive. Runs
    /// on the strand before the completion (posted from a wrapper
    /// thread) can.
    fn track_read(self: &Arc<Self>, id: TransferId, promise: Promise<Data>) {
        let mut state = self.state.lock();
        state.reads.insert(id, promise);
        if state.self_ref.is_none() {
            state.self_ref = Some(Arc::clone(self));
        }
    }

    fn track_write(self: &Arc<Self>, id: TransferId, promise: Promise<usize>) {
        let mut state = self.state.lock();
        state.writes.insert(id, promise);
        if state.self_ref.is_none() {
            state.self_ref = Some(Arc::clone(self));
        }
    }

    fn complete_read(inner: Arc<Self>, id: TransferId, result: aalink_io::Result<Data>) {
        let strand = inner.strand.clone();
        strand.dispatch(move || {
            let promise = inner.state.lock().reads.remove(&id);
            if let Some(promise) = promise {
                match result {
                    Ok(data) => promise.resolve(data),
                    Err(err) => promise.reject(err),
                }
            }
            inner.release_if_idle();
        });
    }

    fn complete_write(inner: Arc<Self>, id: TransferId, result: aalink_io::Result<usize>) {
        let strand = inner.strand.clone();
        strand.dispatch(move || {
            let promise = inner.state.lock().writes.remove(&id);
            if let Some(promise) = promise {
                match result {
                    Ok(len) => promise.resolve(len),
                    Err(err) => promise.reject(err),
                }
            }
            inner.release_if_idle();
        });
    }

    fn release_if_idle(&self) {
        let mut state = self.state.lock();
        if state.transfer_count() == 0 {
            state.self_ref = None;
        }
    }
}

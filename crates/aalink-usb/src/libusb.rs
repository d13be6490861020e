//! rusb-backed implementation of the [`UsbWrapper`] facade.
//!
//! rusb's transfer API is blocking, so each (device, endpoint) pair
//! gets a dedicated worker thread executing its submissions in order;
//! completion callbacks fire from those threads and the layers above
//! dispatch onto their own strands. Infinite-timeout transfers are
//! sliced into bounded reads so a cancellation can land at a slice
//! boundary. A separate event thread drives libusb so hotplug
//! callbacks keep flowing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use aalink_io::{Data, Error, Result};
use parking_lot::Mutex;
use rusb::UsbContext;
use tracing::{debug, warn};

use crate::wrapper::{
    ConfigDescriptor, ControlSetup, DeviceDescriptor, DeviceHandle, DeviceRef,
    EndpointDescriptor, HotplugCallback, HotplugRegistration, InterfaceDescriptor, ReadCallback,
    TransferId, UsbWrapper, WriteCallback,
};

/// Slice length used to make "no timeout" transfers cancellable.
const INFINITE_SLICE: Duration = Duration::from_secs(1);

type Job = Box<dyn FnOnce() + Send>;

pub struct LibusbWrapper {
    shared: Arc<Shared>,
    event_thread: Option<JoinHandle<()>>,
}

struct Shared {
    context: rusb::Context,
    next_id: AtomicU64,
    stopped: AtomicBool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    devices: HashMap<u64, rusb::Device<rusb::Context>>,
    handles: HashMap<u64, HandleEntry>,
    /// Transfer ids submitted but not yet completed.
    pending: HashSet<u64>,
    /// Pending transfer ids flagged for cancellation.
    cancelled: HashSet<u64>,
    workers: HashMap<(u64, u8), Worker>,
    hotplug: HashMap<u64, rusb::Registration<rusb::Context>>,
}

struct HandleEntry {
    device: rusb::Device<rusb::Context>,
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
}

struct Worker {
    jobs: mpsc::Sender<Job>,
}

impl Worker {
    fn spawn(name: String) -> std::io::Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        std::thread::Builder::new().name(name).spawn(move || {
            while let Ok(job) = queue.recv() {
                job();
            }
        })?;
        Ok(Self { jobs })
    }
}

impl LibusbWrapper {
    pub fn new() -> Result<Self> {
        let context = rusb::Context::new().map_err(|err| Error::UsbTransfer(native_code(err)))?;
        let shared = Arc::new(Shared {
            context,
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        });

        let events = Arc::clone(&shared);
        let event_thread = std::thread::Builder::new()
            .name("aalink-usb-events".to_string())
            .spawn(move || {
                while !events.stopped.load(Ordering::Acquire) {
                    if let Err(err) = events
                        .context
                        .handle_events(Some(Duration::from_millis(250)))
                    {
                        warn!(%err, "usb event loop error");
                    }
                }
            })
            .map_err(|_| Error::UsbTransferAllocation)?;

        Ok(Self {
            shared,
            event_thread: Some(event_thread),
        })
    }
}

impl Drop for LibusbWrapper {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            state.hotplug.clear();
            state.workers.clear();
        }
        if let Some(thread) = self.event_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Shared {
    fn mint(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_entry(&self, handle: &DeviceHandle) -> Option<Arc<rusb::DeviceHandle<rusb::Context>>> {
        self.state
            .lock()
            .handles
            .get(&handle.0)
            .map(|entry| Arc::clone(&entry.handle))
    }

    fn take_cancelled(&self, id: TransferId) -> bool {
        let mut state = self.state.lock();
        state.cancelled.remove(&id.0)
    }

    fn finish(&self, id: TransferId) -> bool {
        let mut state = self.state.lock();
        state.pending.remove(&id.0);
        state.cancelled.remove(&id.0)
    }

    /// Queue a job on the worker owning (handle, endpoint). Returns
    /// false when the worker thread cannot be created.
    fn enqueue(&self, handle: &DeviceHandle, endpoint: u8, job: Job) -> bool {
        let mut state = self.state.lock();
        let worker = match state.workers.entry((handle.0, endpoint)) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                let name = format!("aalink-usb-{}-{endpoint:02x}", handle.0);
                match Worker::spawn(name) {
                    Ok(worker) => slot.insert(worker),
                    Err(_) => return false,
                }
            }
        };
        worker.jobs.send(job).is_ok()
    }
}

impl UsbWrapper for LibusbWrapper {
    fn device_descriptor(&self, device: DeviceRef) -> Result<DeviceDescriptor> {
        let native = self
            .shared
            .state
            .lock()
            .devices
            .get(&device.0)
            .cloned()
            .ok_or(Error::UsbTransfer(-4))?;
        let descriptor = native
            .device_descriptor()
            .map_err(|err| Error::UsbTransfer(native_code(err)))?;
        Ok(DeviceDescriptor {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        })
    }

    fn open_device(&self, device: DeviceRef) -> Result<DeviceHandle> {
        let native = self
            .shared
            .state
            .lock()
            .devices
            .get(&device.0)
            .cloned()
            .ok_or(Error::UsbTransfer(-4))?;
        let handle = native
            .open()
            .map_err(|err| Error::UsbTransfer(native_code(err)))?;
        let id = self.shared.mint();
        self.shared.state.lock().handles.insert(
            id,
            HandleEntry {
                device: native,
                handle: Arc::new(handle),
            },
        );
        Ok(DeviceHandle(id))
    }

    fn close_device(&self, handle: &DeviceHandle) {
        let mut state = self.shared.state.lock();
        state.handles.remove(&handle.0);
        state.workers.retain(|(owner, _), _| *owner != handle.0);
    }

    fn config_descriptor(&self, handle: &DeviceHandle) -> Result<ConfigDescriptor> {
        let device = {
            let state = self.shared.state.lock();
            let entry = state
                .handles
                .get(&handle.0)
                .ok_or(Error::UsbObtainConfigDescriptor(-4))?;
            entry.device.clone()
        };
        let config = device
            .active_config_descriptor()
            .map_err(|err| Error::UsbObtainConfigDescriptor(native_code(err)))?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            let Some(descriptor) = interface.descriptors().next() else {
                return Err(Error::UsbObtainInterfaceDescriptor);
            };
            let endpoints = descriptor
                .endpoint_descriptors()
                .map(|endpoint| EndpointDescriptor {
                    address: endpoint.address(),
                })
                .collect();
            interfaces.push(InterfaceDescriptor {
                number: descriptor.interface_number(),
                endpoints,
            });
        }
        Ok(ConfigDescriptor { interfaces })
    }

    fn claim_interface(&self, handle: &DeviceHandle, number: u8) -> Result<()> {
        // Claiming needs exclusive access to the native handle; it runs
        // before any transfer has been submitted, so no worker holds a
        // clone yet.
        let mut state = self.shared.state.lock();
        let entry = state
            .handles
            .get_mut(&handle.0)
            .ok_or(Error::UsbClaimInterface(-4))?;
        let native = Arc::get_mut(&mut entry.handle).ok_or(Error::UsbClaimInterface(-6))?;
        native
            .claim_interface(number)
            .map_err(|err| Error::UsbClaimInterface(native_code(err)))
    }

    fn release_interface(&self, handle: &DeviceHandle, number: u8) {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.handles.get_mut(&handle.0) else {
            return;
        };
        match Arc::get_mut(&mut entry.handle) {
            Some(native) => {
                if let Err(err) = native.release_interface(number) {
                    debug!(%err, "release_interface failed");
                }
            }
            // A transfer is still draining; libusb releases the claim
            // when the handle is closed.
            None => warn!(handle = handle.0, "release skipped, transfers still draining"),
        }
    }

    fn allocate_transfer(&self) -> Option<TransferId> {
        Some(TransferId(self.shared.mint()))
    }

    fn submit_bulk_read(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        endpoint: u8,
        len: usize,
        timeout: Duration,
        done: ReadCallback,
    ) {
        let Some(native) = self.shared.handle_entry(handle) else {
            done(Err(Error::UsbTransfer(-4)));
            return;
        };
        self.shared.state.lock().pending.insert(id.0);
        let shared = Arc::clone(&self.shared);
        let done = Arc::new(Mutex::new(Some(done)));
        let done_for_job = Arc::clone(&done);
        let queued = self.shared.enqueue(
            handle,
            endpoint,
            Box::new(move || {
                let mut buffer = vec![0u8; len];
                let result = run_sliced(&shared, id, timeout, |slice| {
                    native.read_bulk(endpoint, &mut buffer, slice)
                });
                if let Some(done) = done_for_job.lock().take() {
                    match result {
                        Ok(count) => {
                            buffer.truncate(count);
                            done(Ok(buffer));
                        }
                        Err(err) => done(Err(err)),
                    }
                }
            }),
        );
        if !queued {
            self.shared.finish(id);
            if let Some(done) = done.lock().take() {
                done(Err(Error::UsbTransferAllocation));
            }
        }
    }

    fn submit_bulk_write(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        endpoint: u8,
        data: Data,
        timeout: Duration,
        done: WriteCallback,
    ) {
        let Some(native) = self.shared.handle_entry(handle) else {
            done(Err(Error::UsbTransfer(-4)));
            return;
        };
        self.shared.state.lock().pending.insert(id.0);
        let shared = Arc::clone(&self.shared);
        let done = Arc::new(Mutex::new(Some(done)));
        let done_for_job = Arc::clone(&done);
        let queued = self.shared.enqueue(
            handle,
            endpoint,
            Box::new(move || {
                let result = run_sliced(&shared, id, timeout, |slice| {
                    native.write_bulk(endpoint, &data, slice)
                });
                if let Some(done) = done_for_job.lock().take() {
                    done(result);
                }
            }),
        );
        if !queued {
            self.shared.finish(id);
            if let Some(done) = done.lock().take() {
                done(Err(Error::UsbTransferAllocation));
            }
        }
    }

    fn submit_control_read(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        setup: ControlSetup,
        len: usize,
        timeout: Duration,
        done: ReadCallback,
    ) {
        let Some(native) = self.shared.handle_entry(handle) else {
            done(Err(Error::UsbTransfer(-4)));
            return;
        };
        self.shared.state.lock().pending.insert(id.0);
        let shared = Arc::clone(&self.shared);
        let done = Arc::new(Mutex::new(Some(done)));
        let done_for_job = Arc::clone(&done);
        let queued = self.shared.enqueue(
            handle,
            0,
            Box::new(move || {
                let mut buffer = vec![0u8; len];
                let result = run_sliced(&shared, id, timeout, |slice| {
                    native.read_control(
                        setup.request_type,
                        setup.request,
                        setup.value,
                        setup.index,
                        &mut buffer,
                        slice,
                    )
                });
                if let Some(done) = done_for_job.lock().take() {
                    match result {
                        Ok(count) => {
                            buffer.truncate(count);
                            done(Ok(buffer));
                        }
                        Err(err) => done(Err(err)),
                    }
                }
            }),
        );
        if !queued {
            self.shared.finish(id);
            if let Some(done) = done.lock().take() {
                done(Err(Error::UsbTransferAllocation));
            }
        }
    }

    fn submit_control_write(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        setup: ControlSetup,
        data: Data,
        timeout: Duration,
        done: WriteCallback,
    ) {
        let Some(native) = self.shared.handle_entry(handle) else {
            done(Err(Error::UsbTransfer(-4)));
            return;
        };
        self.shared.state.lock().pending.insert(id.0);
        let shared = Arc::clone(&self.shared);
        let done = Arc::new(Mutex::new(Some(done)));
        let done_for_job = Arc::clone(&done);
        let queued = self.shared.enqueue(
            handle,
            0,
            Box::new(move || {
                let result = run_sliced(&shared, id, timeout, |slice| {
                    native.write_control(
                        setup.request_type,
                        setup.request,
                        setup.value,
                        setup.index,
                        &data,
                        slice,
                    )
                });
                if let Some(done) = done_for_job.lock().take() {
                    done(result);
                }
            }),
        );
        if !queued {
            self.shared.finish(id);
            if let Some(done) = done.lock().take() {
                done(Err(Error::UsbTransferAllocation));
            }
        }
    }

    fn cancel_transfer(&self, id: TransferId) {
        let mut state = self.shared.state.lock();
        if state.pending.contains(&id.0) {
            state.cancelled.insert(id.0);
        }
    }

    fn register_hotplug(&self, callback: HotplugCallback) -> Result<HotplugRegistration> {
        if !rusb::has_hotplug() {
            return Err(Error::UsbTransfer(-12));
        }

        struct Listener {
            shared: Arc<Shared>,
            callback: HotplugCallback,
        }

        impl rusb::Hotplug<rusb::Context> for Listener {
            fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
                let id = self.shared.mint();
                self.shared.state.lock().devices.insert(id, device);
                (self.callback)(DeviceRef(id));
            }

            fn device_left(&mut self, _device: rusb::Device<rusb::Context>) {}
        }

        let registration = rusb::HotplugBuilder::new()
            .enumerate(true)
            .register(
                self.shared.context.clone(),
                Box::new(Listener {
                    shared: Arc::clone(&self.shared),
                    callback,
                }),
            )
            .map_err(|err| Error::UsbTransfer(native_code(err)))?;

        let key = self.shared.mint();
        self.shared.state.lock().hotplug.insert(key, registration);
        Ok(HotplugRegistration(key))
    }

    fn unregister_hotplug(&self, registration: HotplugRegistration) {
        self.shared.state.lock().hotplug.remove(&registration.0);
    }
}

/// Run one blocking transfer attempt, honouring cancellation. A zero
/// timeout is turned into a loop of [`INFINITE_SLICE`] attempts with a
/// cancellation check between slices; a finite timeout is a single
/// attempt with a cancellation check after it.
fn run_sliced(
    shared: &Arc<Shared>,
    id: TransferId,
    timeout: Duration,
    mut attempt: impl FnMut(Duration) -> rusb::Result<usize>,
) -> Result<usize> {
    let result = if timeout.is_zero() {
        loop {
            if shared.take_cancelled(id) {
                break Err(Error::OperationAborted);
            }
            match attempt(INFINITE_SLICE) {
                Ok(count) => break Ok(count),
                Err(rusb::Error::Timeout) => continue,
                Err(err) => break Err(Error::UsbTransfer(native_code(err))),
            }
        }
    } else {
        attempt(timeout).map_err(|err| Error::UsbTransfer(native_code(err)))
    };

    let was_cancelled = shared.finish(id);
    if was_cancelled {
        return Err(Error::OperationAborted);
    }
    result
}

fn native_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

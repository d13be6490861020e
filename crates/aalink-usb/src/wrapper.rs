//! Capability facade over the native USB library.
//!
//! Devices and open handles are referred to by opaque tokens minted by
//! the wrapper, so fakes need no native state. Transfer completion
//! callbacks fire on wrapper worker threads; callers dispatch onto
//! their own strands before touching state.

use std::time::Duration;

use aalink_io::{Data, Result};

/// Google's USB vendor id.
pub const GOOGLE_VENDOR_ID: u16 = 0x18D1;
/// Product id of a device in accessory mode.
pub const AOAP_PRODUCT_ID: u16 = 0x2D00;
/// Product id of a device in accessory mode with ADB enabled.
pub const AOAP_WITH_ADB_PRODUCT_ID: u16 = 0x2D01;

/// AOAP vendor request: get protocol version (IN, 2-byte response).
pub const ACCESSORY_GET_PROTOCOL: u8 = 51;
/// AOAP vendor request: send identification string (OUT, index in `wIndex`).
pub const ACCESSORY_SEND_STRING: u8 = 52;
/// AOAP vendor request: start accessory mode (OUT, no data).
pub const ACCESSORY_START: u8 = 53;

/// bmRequestType for vendor IN requests to the device.
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;
/// bmRequestType for vendor OUT requests to the device.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// Direction bit of an endpoint address.
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Token for a device enumerated by the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRef(pub u64);

/// Token for an open device. Exclusive ownership belongs to whoever
/// will eventually pass it to [`UsbWrapper::close_device`]; clones are
/// only for addressing transfers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Token for a submitted transfer, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// Token for a hotplug registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HotplugRegistration(pub u64);

/// The identifying fields of a device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceDescriptor {
    /// Whether the descriptor carries the AOAP accessory signature.
    pub fn is_aoap(&self) -> bool {
        self.vendor_id == GOOGLE_VENDOR_ID
            && (self.product_id == AOAP_PRODUCT_ID || self.product_id == AOAP_WITH_ADB_PRODUCT_ID)
    }
}

/// One endpoint of an interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address; bit 7 set means IN (device to host).
    pub address: u8,
}

impl EndpointDescriptor {
    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_IN != 0
    }
}

/// The first alternate setting of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// The active configuration of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDescriptor {
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Setup packet of a control transfer on endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Completion callback for IN transfers; receives the bytes that
/// arrived.
pub type ReadCallback = Box<dyn FnOnce(Result<Data>) + Send>;

/// Completion callback for OUT transfers; receives the byte count
/// written.
pub type WriteCallback = Box<dyn FnOnce(Result<usize>) + Send>;

/// Hotplug callback; invoked for every arriving device, including the
/// initial enumeration pass.
pub type HotplugCallback = Box<dyn Fn(DeviceRef) + Send + Sync>;

/// Thin capability facade over the native USB library.
///
/// Transfers follow the allocate-then-submit shape of the native
/// library: [`allocate_transfer`](Self::allocate_transfer) mints an id
/// (or fails under resource exhaustion), the caller records it, then
/// one `submit_*` starts the transfer. A `timeout` of zero means no
/// timeout. Submitted transfers settle exactly once: with the
/// transferred data/length, with
/// [`aalink_io::Error::OperationAborted`] after
/// [`cancel_transfer`](Self::cancel_transfer), or with
/// [`aalink_io::Error::UsbTransfer`] carrying the native code.
pub trait UsbWrapper: Send + Sync {
    fn device_descriptor(&self, device: DeviceRef) -> Result<DeviceDescriptor>;
    fn open_device(&self, device: DeviceRef) -> Result<DeviceHandle>;
    fn close_device(&self, handle: &DeviceHandle);
    fn config_descriptor(&self, handle: &DeviceHandle) -> Result<ConfigDescriptor>;
    fn claim_interface(&self, handle: &DeviceHandle, number: u8) -> Result<()>;
    fn release_interface(&self, handle: &DeviceHandle, number: u8);

    /// Mint an id for a transfer about to be submitted. `None` means
    /// the native transfer could not be allocated.
    fn allocate_transfer(&self) -> Option<TransferId>;

    fn submit_bulk_read(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        endpoint: u8,
        len: usize,
        timeout: Duration,
        done: ReadCallback,
    );
    fn submit_bulk_write(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        endpoint: u8,
        data: Data,
        timeout: Duration,
        done: WriteCallback,
    );
    fn submit_control_read(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        setup: ControlSetup,
        len: usize,
        timeout: Duration,
        done: ReadCallback,
    );
    fn submit_control_write(
        &self,
        id: TransferId,
        handle: &DeviceHandle,
        setup: ControlSetup,
        data: Data,
        timeout: Duration,
        done: WriteCallback,
    );

    /// Cancel one outstanding transfer; its callback fires with
    /// [`aalink_io::Error::OperationAborted`]. Unknown ids are ignored.
    fn cancel_transfer(&self, id: TransferId);

    fn register_hotplug(&self, callback: HotplugCallback) -> Result<HotplugRegistration>;
    fn unregister_hotplug(&self, registration: HotplugRegistration);
}

#[cfg(test)]
pub(crate) mod tests_support {
    //! A scripted [`UsbWrapper`] shared by the endpoint, query-chain
    //! and hub tests. Submissions queue up until the test completes
    //! them; hotplug arrivals are fired by hand.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};

    use aalink_io::Error;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PendingKind {
        BulkRead { endpoint: u8, len: usize },
        BulkWrite { endpoint: u8, data: Data },
        ControlRead { setup: ControlSetup, len: usize },
        ControlWrite { setup: ControlSetup, data: Data },
    }

    enum PendingCallback {
        Read(ReadCallback),
        Write(WriteCallback),
    }

    struct Pending {
        id: TransferId,
        kind: PendingKind,
        callback: PendingCallback,
    }

    #[derive(Default)]
    struct MockState {
        descriptors: HashMap<DeviceRef, DeviceDescriptor>,
        configs: HashMap<DeviceRef, ConfigDescriptor>,
        open_fails: HashMap<DeviceRef, i32>,
        handles: HashMap<u64, DeviceRef>,
        pending: VecDeque<Pending>,
        hotplug: HashMap<u64, HotplugCallback>,
        pub claimed: Vec<(u64, u8)>,
        pub released: Vec<(u64, u8)>,
        pub closed: Vec<u64>,
        claim_fail: Option<i32>,
        exhausted: bool,
    }

    pub struct MockUsbWrapper {
        state: Mutex<MockState>,
        next_id: AtomicU64,
    }

    impl MockUsbWrapper {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(MockState::default()),
                next_id: AtomicU64::new(1),
            }
        }

        pub fn add_device(
            &self,
            descriptor: DeviceDescriptor,
            config: ConfigDescriptor,
        ) -> DeviceRef {
            let device = DeviceRef(self.next_id.fetch_add(1, Ordering::Relaxed));
            let mut state = self.state.lock();
            state.descriptors.insert(device, descriptor);
            state.configs.insert(device, config);
            device
        }

        pub fn fail_open(&self, device: DeviceRef, code: i32) {
            self.state.lock().open_fails.insert(device, code);
        }

        pub fn fail_claim(&self, code: i32) {
            self.state.lock().claim_fail = Some(code);
        }

        pub fn exhaust_transfers(&self) {
            self.state.lock().exhausted = true;
        }

        pub fn submission_count(&self) -> usize {
            self.state.lock().pending.len()
        }

        pub fn pending_kinds(&self) -> Vec<PendingKind> {
            self.state
                .lock()
                .pending
                .iter()
                .map(|pending| pending.kind.clone())
                .collect()
        }

        pub fn complete_next_read(&self, result: aalink_io::Result<Data>) {
            let pending = self
                .state
                .lock()
                .pending
                .pop_front()
                .expect("no pending transfer");
            match pending.callback {
                PendingCallback::Read(callback) => callback(result),
                PendingCallback::Write(_) => panic!("next pending transfer is a write"),
            }
        }

        pub fn complete_next_write(&self, result: aalink_io::Result<usize>) {
            let pending = self
                .state
                .lock()
                .pending
                .pop_front()
                .expect("no pending transfer");
            match pending.callback {
                PendingCallback::Write(callback) => callback(result),
                PendingCallback::Read(_) => panic!("next pending transfer is a read"),
            }
        }

        pub fn fire_hotplug(&self, device: DeviceRef) {
            let keys: Vec<_> = {
                let state = self.state.lock();
                state.hotplug.keys().copied().collect()
            };
            for key in keys {
                let callback = {
                    let mut state = self.state.lock();
                    state.hotplug.remove(&key)
                };
                if let Some(callback) = callback {
                    callback(device);
                    self.state.lock().hotplug.insert(key, callback);
                }
            }
        }

        pub fn hotplug_count(&self) -> usize {
            self.state.lock().hotplug.len()
        }

        pub fn claimed_interfaces(&self) -> Vec<(u64, u8)> {
            self.state.lock().claimed.clone()
        }

        pub fn released_interfaces(&self) -> Vec<(u64, u8)> {
            self.state.lock().released.clone()
        }

        pub fn closed_handles(&self) -> Vec<u64> {
            self.state.lock().closed.clone()
        }

        fn push(&self, id: TransferId, kind: PendingKind, callback: PendingCallback) {
            self.state.lock().pending.push_back(Pending {
                id,
                kind,
                callback,
            });
        }
    }

    impl UsbWrapper for MockUsbWrapper {
        fn device_descriptor(&self, device: DeviceRef) -> aalink_io::Result<DeviceDescriptor> {
            self.state
                .lock()
                .descriptors
                .get(&device)
                .copied()
                .ok_or(Error::UsbTransfer(-5))
        }

        fn open_device(&self, device: DeviceRef) -> aalink_io::Result<DeviceHandle> {
            let mut state = self.state.lock();
            if let Some(code) = state.open_fails.get(&device) {
                return Err(Error::UsbTransfer(*code));
            }
            if !state.descriptors.contains_key(&device) {
                return Err(Error::UsbTransfer(-5));
            }
            let handle = self.next_id.fetch_add(1, Ordering::Relaxed);
            state.handles.insert(handle, device);
            Ok(DeviceHandle(handle))
        }

        fn close_device(&self, handle: &DeviceHandle) {
            let mut state = self.state.lock();
            state.handles.remove(&handle.0);
            state.closed.push(handle.0);
        }

        fn config_descriptor(&self, handle: &DeviceHandle) -> aalink_io::Result<ConfigDescriptor> {
            let state = self.state.lock();
            let device = state
                .handles
                .get(&handle.0)
                .ok_or(Error::UsbObtainConfigDescriptor(-5))?;
            state
                .configs
                .get(device)
                .cloned()
                .ok_or(Error::UsbObtainConfigDescriptor(-5))
        }

        fn claim_interface(&self, handle: &DeviceHandle, number: u8) -> aalink_io::Result<()> {
            let mut state = self.state.lock();
            if let Some(code) = state.claim_fail {
                return Err(Error::UsbClaimInterface(code));
            }
            state.claimed.push((handle.0, number));
            Ok(())
        }

        fn release_interface(&self, handle: &DeviceHandle, number: u8) {
            self.state.lock().released.push((handle.0, number));
        }

        fn allocate_transfer(&self) -> Option<TransferId> {
            if self.state.lock().exhausted {
                return None;
            }
            Some(TransferId(self.next_id.fetch_add(1, Ordering::Relaxed)))
        }

        fn submit_bulk_read(
            &self,
            id: TransferId,
            _handle: &DeviceHandle,
            endpoint: u8,
            len: usize,
            _timeout: Duration,
            done: ReadCallback,
        ) {
            self.push(
                id,
                PendingKind::BulkRead { endpoint, len },
                PendingCallback::Read(done),
            );
        }

        fn submit_bulk_write(
            &self,
            id: TransferId,
            _handle: &DeviceHandle,
            endpoint: u8,
            data: Data,
            _timeout: Duration,
            done: WriteCallback,
        ) {
            self.push(
                id,
                PendingKind::BulkWrite { endpoint, data },
                PendingCallback::Write(done),
            );
        }

        fn submit_control_read(
            &self,
            id: TransferId,
            _handle: &DeviceHandle,
            setup: ControlSetup,
            len: usize,
            _timeout: Duration,
            done: ReadCallback,
        ) {
            self.push(
                id,
                PendingKind::ControlRead { setup, len },
                PendingCallback::Read(done),
            );
        }

        fn submit_control_write(
            &self,
            id: TransferId,
            _handle: &DeviceHandle,
            setup: ControlSetup,
            data: Data,
            _timeout: Duration,
            done: WriteCallback,
        ) {
            self.push(
                id,
                PendingKind::ControlWrite { setup, data },
                PendingCallback::Write(done),
            );
        }

        fn cancel_transfer(&self, id: TransferId) {
            let pending = {
                let mut state = self.state.lock();
                let position = state.pending.iter().position(|pending| pending.id == id);
                position.and_then(|index| state.pending.remove(index))
            };
            if let Some(pending) = pending {
                match pending.callback {
                    PendingCallback::Read(callback) => callback(Err(Error::OperationAborted)),
                    PendingCallback::Write(callback) => callback(Err(Error::OperationAborted)),
                }
            }
        }

        fn register_hotplug(
            &self,
            callback: HotplugCallback,
        ) -> aalink_io::Result<HotplugRegistration> {
            let key = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.state.lock().hotplug.insert(key, callback);
            Ok(HotplugRegistration(key))
        }

        fn unregister_hotplug(&self, registration: HotplugRegistration) {
            self.state.lock().hotplug.remove(&registration.0);
        }
    }
}

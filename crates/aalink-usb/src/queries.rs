//! Accessory-mode query chain: the ordered control-transfer sequence
//! that reboots an Android device into AOAP mode.
//!
//! One chain serves one device: get-protocol-version, six
//! identification strings, then start. On success the phone drops off
//! the bus and re-enumerates with the AOAP product id; the hub picks it
//! up again on the next hotplug event.

use std::sync::Arc;
use std::time::Duration;

use aalink_io::{Data, Error, Promise, Strand, WorkQueue};
use parking_lot::Mutex;
use tracing::debug;

use crate::endpoint::UsbEndpoint;
use crate::wrapper::{
    ControlSetup, DeviceHandle, UsbWrapper, ACCESSORY_GET_PROTOCOL, ACCESSORY_SEND_STRING,
    ACCESSORY_START, REQUEST_TYPE_VENDOR_IN, REQUEST_TYPE_VENDOR_OUT,
};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Identification strings sent during the AOAP handshake, in `wIndex`
/// order 0..5.
#[derive(Debug, Clone)]
pub struct AccessoryStrings {
    pub manufacturer: String,
    pub model: String,
    pub description: String,
    pub version: String,
    pub uri: String,
    pub serial: String,
}

impl Default for AccessoryStrings {
    fn default() -> Self {
        Self {
            manufacturer: "Android".to_string(),
            model: "Android Auto".to_string(),
            description: "Android Auto head unit".to_string(),
            version: "2.0.1".to_string(),
            uri: "https://github.com/aalink/aalink".to_string(),
            serial: "AALINK-0001".to_string(),
        }
    }
}

impl AccessoryStrings {
    fn by_index(&self, index: u16) -> Option<&str> {
        match index {
            0 => Some(&self.manufacturer),
            1 => Some(&self.model),
            2 => Some(&self.description),
            3 => Some(&self.version),
            4 => Some(&self.uri),
            5 => Some(&self.serial),
            _ => None,
        }
    }
}

/// State machine over control transfers flipping one phone into
/// accessory mode.
pub struct AccessoryModeQueryChain {
    inner: Arc<ChainInner>,
}

struct ChainInner {
    wrapper: Arc<dyn UsbWrapper>,
    queue: WorkQueue,
    strand: Strand,
    strings: AccessoryStrings,
    state: Mutex<ChainState>,
}

#[derive(Default)]
struct ChainState {
    started: bool,
    cancelled: bool,
    endpoint: Option<UsbEndpoint>,
    handle: Option<DeviceHandle>,
    promise: Option<Promise<DeviceHandle>>,
}

impl AccessoryModeQueryChain {
    pub fn new(
        wrapper: Arc<dyn UsbWrapper>,
        queue: &WorkQueue,
        strings: AccessoryStrings,
    ) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                wrapper,
                queue: queue.clone(),
                strand: Strand::new(queue),
                strings,
                state: Mutex::new(ChainState::default()),
            }),
        }
    }

    /// Run the chain against an open device. The promise resolves with
    /// the same handle once the start request is accepted (the caller
    /// discards it and waits for the accessory re-enumeration), or
    /// rejects with a step-classified error.
    pub fn start(&self, handle: DeviceHandle, promise: Promise<DeviceHandle>) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            {
                let mut state = inner.state.lock();
                if state.started {
                    drop(state);
                    promise.reject(Error::OperationInProgress);
                    return;
                }
                if state.cancelled {
                    drop(state);
                    promise.reject(Error::OperationAborted);
                    return;
                }
                state.started = true;
                state.endpoint = Some(UsbEndpoint::new(
                    Arc::clone(&inner.wrapper),
                    &inner.queue,
                    handle.clone(),
                    0,
                ));
                state.handle = Some(handle);
                state.promise = Some(promise);
            }
            ChainInner::query_protocol_version(&inner);
        });
    }

    /// Cancel the chain; the in-flight control transfer rejects and the
    /// chain promise settles with [`Error::OperationAborted`].
    pub fn cancel(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let endpoint = {
                let mut state = inner.state.lock();
                state.cancelled = true;
                state.endpoint.take()
            };
            if let Some(endpoint) = endpoint {
                endpoint.cancel_transfers();
            }
        });
    }
}

impl ChainInner {
    fn query_protocol_version(inner: &Arc<Self>) {
        let promise = Promise::<Data>::defer(&inner.strand);
        let on_ok = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        promise.then(
            move |data| {
                if data.len() < 2 {
                    Self::fail(
                        &on_ok,
                        Error::UsbAoapProtocolVersion("short response".to_string()),
                    );
                    return;
                }
                let version = u16::from_le_bytes([data[0], data[1]]);
                if version == 1 || version == 2 {
                    debug!(version, "aoap protocol version accepted");
                    Self::send_string(&on_ok, 0);
                } else {
                    Self::fail(
                        &on_ok,
                        Error::UsbAoapProtocolVersion(format!("unsupported version {version}")),
                    );
                }
            },
            move |err| {
                let classified = match err {
                    Error::OperationAborted => Error::OperationAborted,
                    other => Error::UsbAoapProtocolVersion(other.to_string()),
                };
                Self::fail(&on_err, classified);
            },
        );
        Self::with_endpoint(inner, |endpoint| {
            endpoint.control_read(
                ControlSetup {
                    request_type: REQUEST_TYPE_VENDOR_IN,
                    request: ACCESSORY_GET_PROTOCOL,
                    value: 0,
                    index: 0,
                },
                2,
                QUERY_TIMEOUT,
                promise,
            );
        });
    }

    fn send_string(inner: &Arc<Self>, index: u16) {
        let Some(value) = inner.strings.by_index(index) else {
            Self::start_accessory(inner);
            return;
        };
        // AOAP wants NUL-terminated UTF-8.
        let mut data = Data::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);

        let promise = Promise::<usize>::defer(&inner.strand);
        let on_ok = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        promise.then(
            move |_| Self::send_string(&on_ok, index + 1),
            move |err| {
                let classified = match err {
                    Error::OperationAborted => Error::OperationAborted,
                    other => Error::UsbSendIdentificationString {
                        index,
                        code: native_code(&other),
                    },
                };
                Self::fail(&on_err, classified);
            },
        );
        Self::with_endpoint(inner, |endpoint| {
            endpoint.control_write(
                ControlSetup {
                    request_type: REQUEST_TYPE_VENDOR_OUT,
                    request: ACCESSORY_SEND_STRING,
                    value: 0,
                    index,
                },
                data,
                QUERY_TIMEOUT,
                promise,
            );
        });
    }

    fn start_accessory(inner: &Arc<Self>) {
        let promise = Promise::<usize>::defer(&inner.strand);
        let on_ok = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        promise.then(
            move |_| {
                debug!("aoap start accepted, awaiting re-enumeration");
                let (handle, chain_promise) = {
                    let mut state = on_ok.state.lock();
                    state.endpoint = None;
                    (state.handle.take(), state.promise.take())
                };
                if let (Some(handle), Some(chain_promise)) = (handle, chain_promise) {
                    chain_promise.resolve(handle);
                }
            },
            move |err| {
                let classified = match err {
                    Error::OperationAborted => Error::OperationAborted,
                    other => Error::UsbAccessoryStart(native_code(&other)),
                };
                Self::fail(&on_err, classified);
            },
        );
        Self::with_endpoint(inner, |endpoint| {
            endpoint.control_write(
                ControlSetup {
                    request_type: REQUEST_TYPE_VENDOR_OUT,
                    request: ACCESSORY_START,
                    value: 0,
                    index: 0,
                },
                Data::new(),
                QUERY_TIMEOUT,
                promise,
            );
        });
    }

    fn with_endpoint(inner: &Arc<Self>, submit: impl FnOnce(&UsbEndpoint)) {
        let state = inner.state.lock();
        if let Some(endpoint) = state.endpoint.as_ref() {
            submit(endpoint);
        }
        // A missing endpoint means the chain was cancelled; the pending
        // step promise is dropped here and rejects itself as aborted.
    }

    fn fail(inner: &Arc<Self>, error: Error) {
        let (promise, endpoint, handle) = {
            let mut state = inner.state.lock();
            (
                state.promise.take(),
                state.endpoint.take(),
                state.handle.take(),
            )
        };
        drop(endpoint);
        if let Some(handle) = handle {
            inner.wrapper.close_device(&handle);
        }
        if let Some(promise) = promise {
            debug!(%error, "query chain failed");
            promise.reject(error);
        }
    }
}

fn native_code(error: &Error) -> i32 {
    match error {
        Error::UsbTransfer(code) => *code,
        _ => 0,
    }
}

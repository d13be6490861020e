//! Hotplug detection and device classification.

use std::sync::Arc;

use aalink_io::{Error, Promise, Strand, WorkQueue};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::queries::{AccessoryModeQueryChain, AccessoryStrings};
use crate::wrapper::{DeviceHandle, DeviceRef, HotplugRegistration, UsbWrapper};

/// Long-lived hotplug watcher that yields ready accessory-mode devices.
///
/// Every arriving device is classified: phones already carrying the
/// AOAP signature resolve the pending [`start`](Self::start) promise;
/// anything else gets a query chain that tries to flip it into
/// accessory mode, after which the re-enumerated device resolves the
/// promise on its second arrival.
pub struct UsbHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    wrapper: Arc<dyn UsbWrapper>,
    queue: WorkQueue,
    strand: Strand,
    strings: AccessoryStrings,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    promise: Option<Promise<DeviceHandle>>,
    registration: Option<HotplugRegistration>,
    chains: Vec<(u64, AccessoryModeQueryChain)>,
    next_chain_id: u64,
}

impl UsbHub {
    pub fn new(wrapper: Arc<dyn UsbWrapper>, queue: &WorkQueue, strings: AccessoryStrings) -> Self {
        Self {
            inner: Arc::new(HubInner {
                wrapper,
                queue: queue.clone(),
                strand: Strand::new(queue),
                strings,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Wait for the next ready accessory device. A promise superseded
    /// by a newer `start` call rejects with [`Error::OperationAborted`].
    ///
    /// The first `start` registers the hotplug callback (with the
    /// initial enumeration pass included), so already-plugged phones
    /// are picked up immediately.
    pub fn start(&self, promise: Promise<DeviceHandle>) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let superseded = inner.state.lock().promise.replace(promise);
            if let Some(old) = superseded {
                old.reject(Error::OperationAborted);
            }

            let registered = inner.state.lock().registration.is_some();
            if !registered {
                // The callback owns a strong reference, keeping the hub
                // alive for as long as the wrapper may invoke it.
                let callback_inner = Arc::clone(&inner);
                let result = inner.wrapper.register_hotplug(Box::new(move |device| {
                    let task_inner = Arc::clone(&callback_inner);
                    callback_inner
                        .strand
                        .post(move || HubInner::handle_device(&task_inner, device));
                }));
                match result {
                    Ok(registration) => {
                        inner.state.lock().registration = Some(registration);
                    }
                    Err(err) => {
                        warn!(%err, "hotplug registration failed");
                        let promise = inner.state.lock().promise.take();
                        if let Some(promise) = promise {
                            promise.reject(err);
                        }
                    }
                }
            }
        });
    }

    /// Reject the pending promise, cancel every in-flight query chain
    /// and deregister the hotplug callback. Idempotent.
    pub fn cancel(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.strand.dispatch(move || {
            let (promise, chains, registration) = {
                let mut state = inner.state.lock();
                (
                    state.promise.take(),
                    std::mem::take(&mut state.chains),
                    state.registration.take(),
                )
            };
            if let Some(promise) = promise {
                promise.reject(Error::OperationAborted);
            }
            for (_, chain) in &chains {
                chain.cancel();
            }
            if let Some(registration) = registration {
                inner.wrapper.unregister_hotplug(registration);
            }
        });
    }
}

impl HubInner {
    /// Classify one arriving device. Runs on the hub strand.
    fn handle_device(inner: &Arc<Self>, device: DeviceRef) {
        if inner.state.lock().promise.is_none() {
            return;
        }

        let Ok(descriptor) = inner.wrapper.device_descriptor(device) else {
            return;
        };
        let Ok(handle) = inner.wrapper.open_device(device) else {
            return;
        };

        if descriptor.is_aoap() {
            debug!(
                vendor = format_args!("{:04x}", descriptor.vendor_id),
                product = format_args!("{:04x}", descriptor.product_id),
                "accessory-mode device arrived"
            );
            let promise = inner.state.lock().promise.take();
            if let Some(promise) = promise {
                promise.resolve(handle);
            }
            return;
        }

        debug!(
            vendor = format_args!("{:04x}", descriptor.vendor_id),
            product = format_args!("{:04x}", descriptor.product_id),
            "device arrived, starting accessory mode query chain"
        );

        let chain = AccessoryModeQueryChain::new(
            Arc::clone(&inner.wrapper),
            &inner.queue,
            inner.strings.clone(),
        );
        let chain_id = {
            let mut state = inner.state.lock();
            let chain_id = state.next_chain_id;
            state.next_chain_id += 1;
            chain_id
        };

        let chain_promise = Promise::<DeviceHandle>::defer(&inner.strand);
        let on_ok = Arc::clone(inner);
        let on_err = Arc::clone(inner);
        chain_promise.then(
            move |handle| {
                // The phone is rebooting into accessory mode; this
                // handle is dead weight now.
                on_ok.wrapper.close_device(&handle);
                Self::drop_chain(&on_ok, chain_id);
            },
            move |err| {
                debug!(%err, "query chain finished with error, skipping device");
                Self::drop_chain(&on_err, chain_id);
            },
        );

        chain.start(handle, chain_promise);
        inner.state.lock().chains.push((chain_id, chain));
    }

    fn drop_chain(inner: &Arc<Self>, chain_id: u64) {
        inner
            .state
            .lock()
            .chains
            .retain(|(id, _)| *id != chain_id);
    }
}

#[cfg(test)]
mod tests {
    use crate::wrapper::tests_support::{MockUsbWrapper, PendingKind};
    use crate::wrapper::{
        ConfigDescriptor, DeviceDescriptor, AOAP_PRODUCT_ID, GOOGLE_VENDOR_ID,
    };

    use super::*;

    fn aoap_descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: GOOGLE_VENDOR_ID,
            product_id: AOAP_PRODUCT_ID,
        }
    }

    fn phone_descriptor() -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x04E8,
            product_id: 0x6860,
        }
    }

    struct Harness {
        queue: WorkQueue,
        wrapper: Arc<MockUsbWrapper>,
        hub: UsbHub,
        outcome: Arc<Mutex<Option<Result<DeviceHandle, Error>>>>,
    }

    fn start_hub() -> Harness {
        let queue = WorkQueue::new();
        let wrapper = Arc::new(MockUsbWrapper::new());
        let hub = UsbHub::new(
            Arc::clone(&wrapper) as Arc<dyn UsbWrapper>,
            &queue,
            AccessoryStrings::default(),
        );
        let outcome = Arc::new(Mutex::new(None));

        let promise = Promise::<DeviceHandle>::defer(&queue);
        let ok_slot = Arc::clone(&outcome);
        let err_slot = Arc::clone(&outcome);
        promise.then(
            move |handle| *ok_slot.lock() = Some(Ok(handle)),
            move |err| *err_slot.lock() = Some(Err(err)),
        );
        hub.start(promise);
        queue.poll();

        Harness {
            queue,
            wrapper,
            hub,
            outcome,
        }
    }

    #[test]
    fn accessory_device_resolves_start_promise() {
        let harness = start_hub();
        assert_eq!(harness.wrapper.hotplug_count(), 1);

        let device = harness
            .wrapper
            .add_device(aoap_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fire_hotplug(device);
        harness.queue.poll();

        assert!(matches!(harness.outcome.lock().clone(), Some(Ok(_))));
    }

    #[test]
    fn ordinary_phone_starts_query_chain() {
        let harness = start_hub();
        let device = harness
            .wrapper
            .add_device(phone_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fire_hotplug(device);
        harness.queue.poll();

        // The hub promise stays pending; the chain's version query is on
        // the wire.
        assert!(harness.outcome.lock().is_none());
        assert!(matches!(
            harness.wrapper.pending_kinds()[..],
            [PendingKind::ControlRead { .. }]
        ));
    }

    #[test]
    fn failed_chain_is_dropped_and_hub_keeps_waiting() {
        let harness = start_hub();
        let device = harness
            .wrapper
            .add_device(phone_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fire_hotplug(device);
        harness.queue.poll();

        harness
            .wrapper
            .complete_next_read(Err(Error::UsbTransfer(-4)));
        harness.queue.poll();

        assert!(harness.outcome.lock().is_none());
        assert!(harness.hub.inner.state.lock().chains.is_empty());
        // The chain closed the handle it was given.
        assert_eq!(harness.wrapper.closed_handles().len(), 1);
    }

    #[test]
    fn newer_start_supersedes_pending_promise() {
        let harness = start_hub();

        let second = Arc::new(Mutex::new(None));
        let promise = Promise::<DeviceHandle>::defer(&harness.queue);
        let slot = Arc::clone(&second);
        promise.then(move |handle| *slot.lock() = Some(handle), |_| {});
        harness.hub.start(promise);
        harness.queue.poll();

        assert_eq!(
            harness.outcome.lock().clone(),
            Some(Err(Error::OperationAborted))
        );

        // The replacement promise still works.
        let device = harness
            .wrapper
            .add_device(aoap_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fire_hotplug(device);
        harness.queue.poll();
        assert!(second.lock().is_some());
    }

    #[test]
    fn arrival_without_pending_promise_is_ignored() {
        let harness = start_hub();
        let device = harness
            .wrapper
            .add_device(aoap_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fire_hotplug(device);
        harness.queue.poll();
        assert!(matches!(harness.outcome.lock().clone(), Some(Ok(_))));

        // Promise consumed; the next arrival must not start anything.
        let other = harness
            .wrapper
            .add_device(phone_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fire_hotplug(other);
        harness.queue.poll();
        assert_eq!(harness.wrapper.submission_count(), 0);
    }

    #[test]
    fn unopenable_device_is_skipped() {
        let harness = start_hub();
        let device = harness
            .wrapper
            .add_device(phone_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fail_open(device, -3);
        harness.wrapper.fire_hotplug(device);
        harness.queue.poll();

        assert!(harness.outcome.lock().is_none());
        assert_eq!(harness.wrapper.submission_count(), 0);
    }

    #[test]
    fn cancel_rejects_promise_and_deregisters() {
        let harness = start_hub();
        harness.hub.cancel();
        harness.queue.poll();

        assert_eq!(
            harness.outcome.lock().clone(),
            Some(Err(Error::OperationAborted))
        );
        assert_eq!(harness.wrapper.hotplug_count(), 0);

        // Idempotent.
        harness.hub.cancel();
        harness.queue.poll();
        assert_eq!(harness.wrapper.hotplug_count(), 0);
    }

    #[test]
    fn cancel_aborts_inflight_chains() {
        let harness = start_hub();
        let device = harness
            .wrapper
            .add_device(phone_descriptor(), ConfigDescriptor::default());
        harness.wrapper.fire_hotplug(device);
        harness.queue.poll();
        assert_eq!(harness.wrapper.submission_count(), 1);

        harness.hub.cancel();
        harness.queue.poll();

        // The version query was cancelled and the chain closed its
        // device handle.
        assert_eq!(harness.wrapper.submission_count(), 0);
        assert_eq!(harness.wrapper.closed_handles().len(), 1);
    }
}

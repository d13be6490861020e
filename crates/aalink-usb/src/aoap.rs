//! Accessory-mode device: claims the AOAP interface and exposes its
//! bulk endpoint pair.

use std::sync::Arc;

use aalink_io::{Error, Result, WorkQueue};
use tracing::debug;

use crate::endpoint::UsbEndpoint;
use crate::wrapper::{DeviceHandle, UsbWrapper};

/// An opened device in accessory mode.
///
/// Owns its device handle exclusively; dropping the device cancels
/// outstanding transfers on both endpoints, releases the claimed
/// interface and closes the handle.
pub struct AoapDevice {
    wrapper: Arc<dyn UsbWrapper>,
    handle: DeviceHandle,
    interface_number: u8,
    in_endpoint: UsbEndpoint,
    out_endpoint: UsbEndpoint,
}

impl std::fmt::Debug for AoapDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AoapDevice")
            .field("handle", &self.handle)
            .field("interface_number", &self.interface_number)
            .finish()
    }
}

impl AoapDevice {
    /// Validate the device's descriptors, claim its first interface and
    /// wire up the bulk endpoint pair. Consumes the handle; on any
    /// failure the handle is closed before the error is returned.
    ///
    /// The descriptor may list the endpoints in either order; direction
    /// comes from the address bit alone.
    pub fn create(
        wrapper: Arc<dyn UsbWrapper>,
        queue: &WorkQueue,
        handle: DeviceHandle,
    ) -> Result<Self> {
        match Self::claim(&wrapper, queue, &handle) {
            Ok(device) => Ok(device),
            Err(err) => {
                wrapper.close_device(&handle);
                Err(err)
            }
        }
    }

    fn claim(
        wrapper: &Arc<dyn UsbWrapper>,
        queue: &WorkQueue,
        handle: &DeviceHandle,
    ) -> Result<AoapDevice> {
        let config = wrapper.config_descriptor(handle)?;
        let interface = config.interfaces.first().ok_or(Error::UsbEmptyInterfaces)?;

        let in_address = interface
            .endpoints
            .iter()
            .find(|endpoint| endpoint.is_in())
            .map(|endpoint| endpoint.address)
            .ok_or(Error::UsbInvalidDeviceEndpoints)?;
        let out_address = interface
            .endpoints
            .iter()
            .find(|endpoint| !endpoint.is_in())
            .map(|endpoint| endpoint.address)
            .ok_or(Error::UsbInvalidDeviceEndpoints)?;

        wrapper.claim_interface(handle, interface.number)?;
        debug!(
            interface = interface.number,
            r#in = format_args!("{in_address:02x}"),
            out = format_args!("{out_address:02x}"),
            "claimed accessory interface"
        );

        Ok(AoapDevice {
            wrapper: Arc::clone(wrapper),
            handle: handle.clone(),
            interface_number: interface.number,
            in_endpoint: UsbEndpoint::new(
                Arc::clone(wrapper),
                queue,
                handle.clone(),
                in_address,
            ),
            out_endpoint: UsbEndpoint::new(
                Arc::clone(wrapper),
                queue,
                handle.clone(),
                out_address,
            ),
        })
    }

    /// Endpoint carrying device-to-host traffic.
    pub fn in_endpoint(&self) -> &UsbEndpoint {
        &self.in_endpoint
    }

    /// Endpoint carrying host-to-device traffic.
    pub fn out_endpoint(&self) -> &UsbEndpoint {
        &self.out_endpoint
    }
}

impl Drop for AoapDevice {
    fn drop(&mut self) {
        self.in_endpoint.cancel_transfers();
        self.out_endpoint.cancel_transfers();
        self.wrapper.release_interface(&self.handle, self.interface_number);
        self.wrapper.close_device(&self.handle);
    }
}

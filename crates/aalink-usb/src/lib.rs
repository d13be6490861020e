//! USB side of aalink: device discovery, AOAP mode switching and bulk
//! endpoint access.
//!
//! The native USB library is reached exclusively through the
//! [`UsbWrapper`] facade so everything above it — endpoints, the
//! accessory-mode query chain, the hub — can be driven against a fake
//! in tests. [`LibusbWrapper`] is the production implementation over
//! rusb.
//!
//! A phone's journey: [`UsbHub`] sees it arrive, reads its descriptor,
//! and either resolves the caller's promise (already an accessory) or
//! runs an [`AccessoryModeQueryChain`] to reboot it into accessory
//! mode, after which it re-enumerates with the AOAP product id and the
//! hub resolves on the second arrival. [`AoapDevice`] then claims the
//! interface and exposes the bulk endpoint pair.

pub mod aoap;
pub mod endpoint;
pub mod hub;
pub mod libusb;
pub mod queries;
pub mod wrapper;

pub use aoap::AoapDevice;
pub use endpoint::UsbEndpoint;
pub use hub::UsbHub;
pub use libusb::LibusbWrapper;
pub use queries::{AccessoryModeQueryChain, AccessoryStrings};
pub use wrapper::{
    ConfigDescriptor, ControlSetup, DeviceDescriptor, DeviceHandle, DeviceRef,
    EndpointDescriptor, HotplugRegistration, InterfaceDescriptor, TransferId, UsbWrapper,
    AOAP_PRODUCT_ID, AOAP_WITH_ADB_PRODUCT_ID, GOOGLE_VENDOR_ID,
};

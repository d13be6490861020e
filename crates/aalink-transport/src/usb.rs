//! Transport over an accessory-mode device's bulk endpoint pair.

use aalink_io::{Data, Promise, WorkQueue};
use aalink_usb::AoapDevice;

use crate::transport::{Transport, TransportConfig, TransportCore, TransportIo};

struct UsbIo {
    device: AoapDevice,
    config: TransportConfig,
}

impl TransportIo for UsbIo {
    fn start_receive(&self, max: usize, promise: Promise<Data>) {
        self.device
            .in_endpoint()
            .bulk_read(max, self.config.receive_timeout, promise);
    }

    fn start_send(&self, chunk: &[u8], promise: Promise<usize>) {
        self.device
            .out_endpoint()
            .bulk_write(chunk.to_vec(), self.config.send_timeout, promise);
    }

    fn cancel(&self) {
        self.device.in_endpoint().cancel_transfers();
        self.device.out_endpoint().cancel_transfers();
    }
}

/// [`Transport`] over AOAP bulk endpoints.
///
/// Outgoing buffers are chunked at
/// [`TransportConfig::max_transfer_size`] and written as sequential
/// bulk transfers; receives use the configured (default infinite)
/// timeout.
pub struct UsbTransport {
    core: TransportCore<UsbIo>,
}

impl UsbTransport {
    /// Take exclusive ownership of an accessory device. Dropping the
    /// transport releases the device's interface and handle.
    pub fn new(device: AoapDevice, queue: &WorkQueue, config: TransportConfig) -> Self {
        let max_chunk = config.max_transfer_size.max(1);
        Self {
            core: TransportCore::new(UsbIo { device, config }, queue, max_chunk),
        }
    }
}

impl Transport for UsbTransport {
    fn receive(&self, size: usize, promise: Promise<Data>) {
        self.core.receive(size, promise);
    }

    fn send(&self, data: Data, promise: Promise<()>) {
        self.core.send(data, promise);
    }

    fn stop(&self) {
        self.core.stop();
    }
}

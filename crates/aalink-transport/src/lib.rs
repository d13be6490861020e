//! Frame-agnostic byte transports.
//!
//! A [`Transport`] is a byte broker between the physical link and the
//! message streams above it: callers ask for exactly-N-byte reads and
//! whole-buffer writes, the transport keeps an ordered receive-request
//! queue fed from a growable sink plus an ordered send queue, and the
//! physical I/O differences (USB bulk chunking versus one contiguous
//! TCP write) stay inside the endpoint implementations.

pub mod sink;
pub mod tcp;
pub mod transport;
pub mod usb;

pub use sink::ReceiveSink;
pub use tcp::{TcpEndpoint, TcpTransport};
pub use transport::{Transport, TransportConfig};
pub use usb::UsbTransport;

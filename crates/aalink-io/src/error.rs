//! The single error domain shared by every aalink layer.
//!
//! Promises carry one error type across the whole stack: a libusb
//! failure deep in an endpoint surfaces unchanged through a messenger
//! promise. Native codes (libusb return values, OS errno) ride along as
//! `i32` so callers can classify disconnects versus protocol faults.

/// Errors surfaced through aalink promises.
///
/// `Clone` because one underlying failure typically rejects a whole
/// queue of pending promises.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Claiming the AOAP interface failed.
    #[error("failed to claim usb interface (libusb code {0})")]
    UsbClaimInterface(i32),

    /// Reading the active configuration descriptor failed.
    #[error("failed to obtain usb config descriptor (libusb code {0})")]
    UsbObtainConfigDescriptor(i32),

    /// The configuration descriptor could not be parsed.
    #[error("usb config descriptor is invalid")]
    UsbInvalidConfigDescriptor,

    /// The device configuration exposes no interfaces.
    #[error("usb device exposes no interfaces")]
    UsbEmptyInterfaces,

    /// The interface has no usable alternate setting.
    #[error("failed to obtain usb interface descriptor")]
    UsbObtainInterfaceDescriptor,

    /// The interface does not expose a bulk IN/OUT endpoint pair.
    #[error("usb interface does not expose a bulk in/out endpoint pair")]
    UsbInvalidDeviceEndpoints,

    /// A transfer kind was requested on the wrong endpoint, e.g. a
    /// control transfer on a bulk endpoint. Programmer error.
    #[error("transfer method not valid for this endpoint")]
    UsbInvalidTransferMethod,

    /// The wrapper could not allocate a transfer.
    #[error("usb transfer allocation failed")]
    UsbTransferAllocation,

    /// A submitted transfer completed with a failure status.
    #[error("usb transfer failed (libusb code {0})")]
    UsbTransfer(i32),

    /// The AOAP protocol version query failed or returned an
    /// unsupported version.
    #[error("aoap protocol version query failed: {0}")]
    UsbAoapProtocolVersion(String),

    /// One of the six AOAP identification strings was rejected.
    #[error("aoap identification string {index} rejected (libusb code {code})")]
    UsbSendIdentificationString { index: u16, code: i32 },

    /// The AOAP start request was rejected.
    #[error("aoap accessory start rejected (libusb code {0})")]
    UsbAccessoryStart(i32),

    /// A TCP read or write failed.
    #[error("tcp transfer failed (os error {0})")]
    TcpTransfer(i32),

    /// The operation was cancelled by `stop`/`cancel`, or its promise
    /// was dropped while pending. Expected during shutdown.
    #[error("operation aborted")]
    OperationAborted,

    /// A second receive was started while one is pending. Programmer
    /// error.
    #[error("operation already in progress")]
    OperationInProgress,

    /// A message payload could not be interpreted by the service layer.
    #[error("malformed message payload: {0}")]
    ParsePayload(String),

    /// The TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    SslHandshake(String),

    /// Decrypting an incoming frame payload failed.
    #[error("tls read failed: {0}")]
    SslRead(String),

    /// Encrypting an outgoing payload failed.
    #[error("tls write failed: {0}")]
    SslWrite(String),

    /// The bounded send queue is full.
    #[error("send queue overflow")]
    SendQueueOverflow,
}

pub type Result<T> = std::result::Result<T, Error>;

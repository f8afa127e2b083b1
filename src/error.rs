use std::fmt;

use thiserror::Error;

/// Result type for this crate.
pub type Result<T> = ::std::result::Result<T, EzpError>;

/// Protocol step at which a USB transfer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CheckChip,
    CheckChipAck,
    SetChipData,
    SetChipDataAck,
    StartTransaction,
    StartTransactionAck,
    /// Pulling a data block starting at `offset`.
    ReadBlock { offset: u32 },
    /// Pushing a data block starting at `offset`.
    WriteBlock { offset: u32 },
    Reset,
    ResetAck,
    /// Processing hot-plug events.
    EventDispatch,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CheckChip => write!(f, "check chip"),
            Step::CheckChipAck => write!(f, "check chip response"),
            Step::SetChipData => write!(f, "set chip data"),
            Step::SetChipDataAck => write!(f, "set chip data ack"),
            Step::StartTransaction => write!(f, "start transaction"),
            Step::StartTransactionAck => write!(f, "start transaction ack"),
            Step::ReadBlock { offset } => write!(f, "read block at {:#x}", offset),
            Step::WriteBlock { offset } => write!(f, "write block at {:#x}", offset),
            Step::Reset => write!(f, "reset"),
            Step::ResetAck => write!(f, "reset ack"),
            Step::EventDispatch => write!(f, "hotplug event dispatch"),
        }
    }
}

/// Error type for this crate.
#[derive(Error, Debug)]
pub enum EzpError {
    /// Flash size is not a multiple of the page size. Raised before any USB traffic.
    #[error("flash size {flash_size} is not a multiple of page size {page_size}")]
    FlashGeometryInvalid { flash_size: u32, page_size: u16 },
    /// Buffer handed to a write does not match the chip's flash size.
    #[error("data is {actual} bytes but the chip holds {expected}")]
    DataSizeMismatch { expected: usize, actual: usize },

    /// USB device not found.
    #[error("usb device not found")]
    UsbDeviceNotFound,
    /// Device found but could not be opened.
    #[error("device found but failed to open: {0}")]
    UsbOpenFailure(rusb::Error),
    /// Failed to create a USB context.
    #[error("failed to create usb context: {0}")]
    UsbContextFailure(rusb::Error),
    /// Failed to detach USB kernel driver.
    #[error("failed to detach usb kernel driver: {0}")]
    UsbDetachKernelDriverFailure(rusb::Error),
    /// Failed to claim USB interface.
    #[error("failed to claim usb interface: {0}")]
    UsbClaimInterfaceFailure(rusb::Error),
    /// A bulk transfer (or event dispatch) returned a non-success status.
    #[error("usb transfer failed during {step}: {source}")]
    UsbTransportFailure { step: Step, source: rusb::Error },

    /// Programmer answered but reported no chip in the socket.
    #[error("flash not detected")]
    FlashNotDetected,
    /// Programmer identity magic is not one we know.
    #[error("invalid response from programmer (magic {magic:#010x})")]
    InvalidDeviceResponse { magic: u32 },

    /// Read stopped early. `data` is the flash-sized buffer and its first
    /// `captured` bytes came from the device.
    #[error("read interrupted after {captured} bytes: {source}")]
    PartialRead {
        data: Vec<u8>,
        captured: usize,
        source: Box<EzpError>,
    },
    /// Caller cancelled the transfer between blocks.
    #[error("transfer cancelled")]
    Cancelled,

    /// libusb on this platform has no hot-plug support.
    #[error("hotplug is not supported on this platform")]
    HotplugUnsupported,
    /// Failed to register the hot-plug callback.
    #[error("failed to register hotplug callback: {0}")]
    HotplugFailure(rusb::Error),
    /// Failed to spawn the status monitor thread.
    #[error("failed to spawn status monitor thread: {0}")]
    StatusThreadFailure(std::io::Error),
    /// Status monitor thread panicked.
    #[error("status monitor thread panicked")]
    StatusMonitorPanicked,

    /// Failed to read or write the chips data file.
    #[error("chips data io error: {0}")]
    ChipsDataIo(#[from] std::io::Error),
    /// Chips data file is empty or not made of whole records.
    #[error("chips data of {len} bytes is not a whole number of records")]
    ChipsDataInvalid { len: usize },
    /// Failed to serialize a chip record.
    #[error("chip record failed to binary serialize: {0}")]
    ChipsDataSerializeFailure(bincode::Error),
    /// Failed to deserialize a chip record.
    #[error("chip record failed to binary deserialize: {0}")]
    ChipsDataDeserializeFailure(bincode::Error),
    /// Unknown chip class code.
    #[error("invalid chip class {0}")]
    InvalidChipClass(u8),
    /// Unknown voltage code.
    #[error("invalid voltage {0}")]
    InvalidVoltage(u8),
}

impl EzpError {
    /// Data captured from the device before a read failed, if any.
    pub fn partial_data(&self) -> Option<&[u8]> {
        match self {
            EzpError::PartialRead { data, captured, .. } => Some(&data[..*captured]),
            _ => None,
        }
    }

    /// Underlying cause for a partial read, `self` otherwise.
    pub fn root(&self) -> &EzpError {
        match self {
            EzpError::PartialRead { source, .. } => source.root(),
            other => other,
        }
    }
}

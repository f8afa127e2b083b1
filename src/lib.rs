//! Identifying, reading and writing memory chips with an EZP2023+ USB programmer.
//!
//! <br>
//!
//! The EZP2023+ is a cheap USB programmer for SPI flash and 24/25/93/95
//! series EEPROMs. It speaks an undocumented protocol of fixed 64 byte
//! command packets over bulk endpoints; this crate implements that protocol
//! on top of [`rusb`], along with a reader/writer for the vendor's chip
//! database and a hot-plug based connectivity monitor.
//!
//! # Example
//!
//! Dump a chip to a file.
//!
//! ```no_run
//! use ezp_rs::{read_chips_data, EzpConnection, Speed, TransferOptions};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let chips = read_chips_data("chips.dat")?;
//!     let chip = chips
//!         .iter()
//!         .find(|c| c.model() == Some("W25Q32"))
//!         .ok_or("chip not in database")?;
//!
//!     let mut conn = EzpConnection::open()?;
//!
//!     // make sure the right chip is in the socket
//!     let detected = conn.test_flash()?;
//!     println!("detected {:?} {:06X}", detected.get_class(), detected.get_chip_id());
//!
//!     let mut progress = |current: u32, total: u32| {
//!         println!("{}/{}", current, total);
//!     };
//!     let data = conn.read_flash(chip, TransferOptions::new(Speed::Mhz12), Some(&mut progress))?;
//!     std::fs::write("dump.bin", data)?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Watch the programmer come and go.
//!
//! ```no_run
//! use ezp_rs::{RusbHotplug, Status, StatusMonitor, StatusMonitorConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = rusb::Context::new()?;
//!     let monitor = StatusMonitor::start(
//!         RusbHotplug::new(ctx),
//!         StatusMonitorConfig::default(),
//!         |status: Status| println!("programmer is {:?}", status),
//!     )?;
//!
//!     std::thread::sleep(std::time::Duration::from_secs(30));
//!     monitor.stop()?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

/// EZP2023+ USB Vendor ID
pub const EZP_VID: u16 = 0x1FC8;
/// EZP2023+ USB Product ID
pub const EZP_PID: u16 = 0x310B;
/// Interface carrying the bulk endpoints
pub const EZP_INTERFACE: u8 = 0;

/// Bulk OUT endpoint for command packets
pub const EZP_CMD_OUT_EP: u8 = 0x02;
/// Bulk OUT endpoint for flash data written to the chip
pub const EZP_DATA_OUT_EP: u8 = 0x01;
/// Bulk IN endpoint for acknowledgements and flash data
pub const EZP_IN_EP: u8 = 0x82;

/// Timeout of a single bulk transfer
pub const EZP_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1000);
/// Size of every command packet and acknowledgement
pub const EZP_PACKET_SIZE: usize = 64;
/// Smallest data block moved per bulk transfer
pub const EZP_MIN_BLOCK_SIZE: usize = 64;

/// Programmer identity magic seen on one hardware revision
pub const EZP_MAGIC_A: u32 = 0x9A7336BD;
/// Programmer identity magic seen on another hardware revision
pub const EZP_MAGIC_B: u32 = 0xD4151DBC;
/// Every programmer identity magic accepted by chip detection
pub const EZP_MAGICS: [u32; 2] = [EZP_MAGIC_A, EZP_MAGIC_B];

/// Chip Profile Module
pub mod chips;
pub use chips::{
    read_chips_data, read_chips_data_from, write_chips_data, write_chips_data_to, ChipClass,
    ChipProfile, Voltage,
};

/// Command Module
pub mod cmd;
pub use cmd::{Command, CommandPacket, Speed};

/// Error Module
pub mod error;
pub use error::{EzpError, Result, Step};

/// Programmer Status Module
pub mod status;
pub use status::{
    CancelToken, HotplugDevice, HotplugEvent, HotplugSource, RusbHotplug, Status, StatusMonitor,
    StatusMonitorConfig, StatusObserver,
};

/// USB Connection Module
pub mod usb;
pub use usb::{
    BulkTransport, DetectedChip, EzpConnection, ProgressObserver, SpeedField, TransferOptions,
    UsbHandle,
};

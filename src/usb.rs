use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};

use crate::chips::{ChipClass, ChipProfile};
use crate::cmd::{CommandPacket, Speed};
use crate::error::{EzpError, Result, Step};
use crate::{
    EZP_CMD_OUT_EP, EZP_DATA_OUT_EP, EZP_IN_EP, EZP_INTERFACE, EZP_MAGICS, EZP_MIN_BLOCK_SIZE,
    EZP_PACKET_SIZE, EZP_PID, EZP_TRANSFER_TIMEOUT, EZP_VID,
};

/// Bulk pipe used by the workflows.
///
/// Implemented for [`UsbHandle`]; tests drive the workflows through a
/// scripted implementation instead.
pub trait BulkTransport {
    /// Writes `buf` to an OUT endpoint, returning the number of bytes moved.
    fn bulk_out(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Reads into `buf` from an IN endpoint, returning the number of bytes moved.
    fn bulk_in(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;
}

/// Opened programmer with its interface claimed. Released on drop.
#[derive(Debug)]
pub struct UsbHandle<T: UsbContext> {
    _context: T,
    handle: DeviceHandle<T>,
    iface: u8,
    has_kernel_driver: bool,
}

impl<T: UsbContext> Drop for UsbHandle<T> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.iface) {
            log::warn!("could not release interface: {}", e);
        }

        if self.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.iface) {
                log::warn!("could not reattach kernel driver: {}", e);
            }
        }
    }
}
impl<T: UsbContext> UsbHandle<T> {
    /// Opens the first attached programmer.
    pub fn open(ctx: T) -> Result<Self> {
        let devices = match ctx.devices() {
            Ok(d) => d,
            Err(e) => {
                log::warn!("could not list usb devices: {}", e);
                return Err(EzpError::UsbDeviceNotFound);
            }
        };

        for device in devices.iter() {
            let device_desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };

            if device_desc.vendor_id() == EZP_VID && device_desc.product_id() == EZP_PID {
                log::info!(
                    "opening programmer at bus {} address {}",
                    device.bus_number(),
                    device.address()
                );
                let handle = device.open().map_err(EzpError::UsbOpenFailure)?;
                return Self::claim(ctx, handle);
            }
        }

        Err(EzpError::UsbDeviceNotFound)
    }

    fn claim(ctx: T, mut handle: DeviceHandle<T>) -> Result<Self> {
        let has_kernel_driver = match handle.kernel_driver_active(EZP_INTERFACE) {
            Ok(true) => {
                handle
                    .detach_kernel_driver(EZP_INTERFACE)
                    .map_err(EzpError::UsbDetachKernelDriverFailure)?;
                true
            }
            _ => false,
        };

        handle
            .claim_interface(EZP_INTERFACE)
            .map_err(EzpError::UsbClaimInterfaceFailure)?;

        Ok(UsbHandle {
            _context: ctx,
            handle,
            iface: EZP_INTERFACE,
            has_kernel_driver,
        })
    }
}

impl<T: UsbContext> BulkTransport for UsbHandle<T> {
    fn bulk_out(&mut self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, buf, timeout)
    }

    fn bulk_in(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }
}

/// What goes into the speed byte of SET_CHIP_DATA.
///
/// The vendor software sends the supply voltage there for 24-series
/// EEPROMs; whether the firmware reads it as a speed for any class other
/// than SPI flash is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedField {
    /// Always the speed code.
    #[default]
    Speed,
    /// Voltage code for [`ChipClass::Eeprom24`], speed code otherwise.
    VoltageForEeprom24,
}

/// Per-transfer settings for [`EzpConnection::read_flash`] and [`EzpConnection::write_flash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOptions {
    pub speed: Speed,
    pub speed_field: SpeedField,
}
impl TransferOptions {
    pub fn new(speed: Speed) -> Self {
        TransferOptions {
            speed,
            ..Default::default()
        }
    }

    /// Speed byte to send for `profile`.
    pub fn speed_byte(&self, profile: &ChipProfile) -> u8 {
        match (self.speed_field, profile.class) {
            (SpeedField::VoltageForEeprom24, ChipClass::Eeprom24) => profile.voltage as u8,
            _ => self.speed as u8,
        }
    }
}

/// Receives progress of a chunked transfer.
pub trait ProgressObserver {
    /// Called once per block with the byte offset of that block and the total size.
    fn on_progress(&mut self, current: u32, total: u32);

    /// Polled before every block; returning true stops the transfer.
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl<F: FnMut(u32, u32)> ProgressObserver for F {
    fn on_progress(&mut self, current: u32, total: u32) {
        self(current, total)
    }
}

/// Bytes moved per bulk call for a chip with `page_size` byte pages.
pub fn effective_block_size(page_size: u16) -> usize {
    usize::from(page_size).max(EZP_MIN_BLOCK_SIZE)
}

/// Number of bulk calls needed for the whole flash.
pub fn block_count(flash_size: u32, page_size: u16) -> usize {
    flash_size as usize / effective_block_size(page_size)
}

struct TransferSession {
    total: u32,
    block_size: usize,
    blocks: usize,
}
impl TransferSession {
    fn new(profile: &ChipProfile) -> Self {
        let blocks = block_count(profile.flash_size, profile.page_size);
        if blocks == 0 {
            log::warn!(
                "flash of {} bytes is smaller than one {} byte block, no data will move",
                profile.flash_size,
                effective_block_size(profile.page_size)
            );
        }
        TransferSession {
            total: profile.flash_size,
            block_size: effective_block_size(profile.page_size),
            blocks,
        }
    }
}

/// Result of a successful chip detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedChip {
    family: u8,
    chip_id: u32,
    magic: u32,
}
impl DetectedChip {
    /// Zero based family index as reported by the programmer.
    pub fn get_family(&self) -> u8 {
        self.family
    }

    /// Family as a [`ChipClass`], if it is one we know.
    pub fn get_class(&self) -> Option<ChipClass> {
        ChipClass::try_from(self.family).ok()
    }

    /// 24-bit chip id; only meaningful for SPI flash.
    pub fn get_chip_id(&self) -> u32 {
        self.chip_id
    }

    /// Identity magic of the programmer hardware.
    pub fn get_programmer_magic(&self) -> u32 {
        self.magic
    }
}

/// Interprets the programmer's answer to CHECK_CHIP.
pub fn parse_detect_response(resp: &[u8; EZP_PACKET_SIZE]) -> Result<DetectedChip> {
    let chip_type = resp[0];
    let chip_id = u32::from_be_bytes([resp[0], resp[1], resp[2], resp[3]]) & 0x00FF_FFFF;
    let magic = u32::from_be_bytes([resp[60], resp[61], resp[62], resp[63]]);

    let family = chip_type
        .checked_sub(1)
        .and_then(|f| ChipClass::try_from(f).ok())
        .map_or("Unknown", |c| c.name());
    log::info!(
        "type: {}, chip id: {:06X}, programmer: {:08X}",
        family,
        chip_id,
        magic
    );

    if !EZP_MAGICS.contains(&magic) {
        return Err(EzpError::InvalidDeviceResponse { magic });
    }
    if chip_type == 0 {
        return Err(EzpError::FlashNotDetected);
    }

    Ok(DetectedChip {
        family: chip_type - 1,
        chip_id,
        magic,
    })
}

fn transport_failure(step: Step, source: rusb::Error) -> EzpError {
    log::error!("usb error during {}: {}", step, source);
    EzpError::UsbTransportFailure { step, source }
}

fn check_len(step: Step, actual: usize, expected: usize) {
    if actual != expected {
        log::warn!(
            "{}: transferred {} bytes, expected {}",
            step,
            actual,
            expected
        );
    }
}

/// Session with one programmer.
///
/// Every method is a blocking, strictly ordered exchange of packets; the
/// caller must not run two of them at once on the same connection.
#[derive(Debug)]
pub struct EzpConnection<H: BulkTransport> {
    handle: H,
}

impl EzpConnection<UsbHandle<Context>> {
    /// Opens the first attached programmer with a fresh libusb context.
    pub fn open() -> Result<Self> {
        let ctx = Context::new().map_err(EzpError::UsbContextFailure)?;
        Self::new(ctx)
    }
}

impl<T: UsbContext> EzpConnection<UsbHandle<T>> {
    /// Opens the first attached programmer in `ctx`.
    pub fn new(ctx: T) -> Result<Self> {
        Ok(Self::with_transport(UsbHandle::open(ctx)?))
    }
}

impl<H: BulkTransport> EzpConnection<H> {
    /// Wraps an already opened transport.
    pub fn with_transport(handle: H) -> Self {
        EzpConnection { handle }
    }

    /// Gives back the transport.
    pub fn into_inner(self) -> H {
        self.handle
    }

    fn send_packet(&mut self, packet: CommandPacket, step: Step) -> Result<()> {
        let buf = packet.encode();
        log::debug!("-> {:04X} ({})", packet.get_command_code(), step);
        let len = self
            .handle
            .bulk_out(EZP_CMD_OUT_EP, &buf, EZP_TRANSFER_TIMEOUT)
            .map_err(|e| transport_failure(step, e))?;
        check_len(step, len, buf.len());
        Ok(())
    }

    fn recv_packet(&mut self, step: Step) -> Result<[u8; EZP_PACKET_SIZE]> {
        let mut buf = [0u8; EZP_PACKET_SIZE];
        let len = self
            .handle
            .bulk_in(EZP_IN_EP, &mut buf, EZP_TRANSFER_TIMEOUT)
            .map_err(|e| transport_failure(step, e))?;
        log::debug!("<- {:02X?} ({})", &buf[..4], step);
        check_len(step, len, buf.len());
        Ok(buf)
    }

    fn set_chip_data(&mut self, profile: &ChipProfile, options: &TransferOptions) -> Result<()> {
        let packet = CommandPacket::set_chip_data(profile, options.speed_byte(profile));
        self.send_packet(packet, Step::SetChipData)?;
        self.recv_packet(Step::SetChipDataAck)?;
        Ok(())
    }

    /// Identifies the chip in the socket.
    ///
    /// Fails with [`EzpError::InvalidDeviceResponse`] when the programmer
    /// identity is unknown and [`EzpError::FlashNotDetected`] when the socket
    /// is empty.
    pub fn test_flash(&mut self) -> Result<DetectedChip> {
        self.send_packet(CommandPacket::check_chip(), Step::CheckChip)?;
        let resp = self.recv_packet(Step::CheckChipAck)?;

        self.send_packet(CommandPacket::reset(), Step::Reset)?;
        self.recv_packet(Step::ResetAck)?;

        parse_detect_response(&resp)
    }

    fn pull_blocks(
        &mut self,
        session: &TransferSession,
        data: &mut [u8],
        progress: &mut Option<&mut dyn ProgressObserver>,
    ) -> std::result::Result<(), (usize, EzpError)> {
        let bs = session.block_size;
        for (i, block) in data.chunks_exact_mut(bs).take(session.blocks).enumerate() {
            let offset = i * bs;
            if let Some(p) = progress.as_mut() {
                if p.is_cancelled() {
                    return Err((offset, EzpError::Cancelled));
                }
                p.on_progress(offset as u32, session.total);
            }

            let step = Step::ReadBlock {
                offset: offset as u32,
            };
            let len = self
                .handle
                .bulk_in(EZP_IN_EP, block, EZP_TRANSFER_TIMEOUT)
                .map_err(|e| (offset, transport_failure(step, e)))?;
            check_len(step, len, bs);
        }
        Ok(())
    }

    fn push_blocks(
        &mut self,
        session: &TransferSession,
        data: &[u8],
        progress: &mut Option<&mut dyn ProgressObserver>,
    ) -> Result<()> {
        let bs = session.block_size;
        for (i, block) in data.chunks_exact(bs).take(session.blocks).enumerate() {
            let offset = i * bs;
            if progress.as_ref().map_or(false, |p| p.is_cancelled()) {
                return Err(EzpError::Cancelled);
            }

            let step = Step::WriteBlock {
                offset: offset as u32,
            };
            let len = self
                .handle
                .bulk_out(EZP_DATA_OUT_EP, block, EZP_TRANSFER_TIMEOUT)
                .map_err(|e| transport_failure(step, e))?;
            check_len(step, len, bs);

            if let Some(p) = progress.as_mut() {
                p.on_progress(offset as u32, session.total);
            }
        }
        Ok(())
    }

    /// Reads the whole flash of the chip described by `profile`.
    ///
    /// Errors before the data phase return no data. Once blocks are flowing
    /// any failure comes back as [`EzpError::PartialRead`] carrying the
    /// buffer: a failure in the trailing reset keeps all of it. A cancelled
    /// read whose closing reset fails reports the reset failure.
    pub fn read_flash(
        &mut self,
        profile: &ChipProfile,
        options: TransferOptions,
        progress: Option<&mut dyn ProgressObserver>,
    ) -> Result<Vec<u8>> {
        profile.check_geometry()?;
        let session = TransferSession::new(profile);
        let mut progress = progress;

        self.set_chip_data(profile, &options)?;
        self.send_packet(CommandPacket::start_transaction(), Step::StartTransaction)?;
        self.recv_packet(Step::StartTransactionAck)?;

        let mut data = vec![0u8; session.total as usize];
        if let Err((captured, mut err)) = self.pull_blocks(&session, &mut data, &mut progress) {
            if let EzpError::Cancelled = err {
                // the transaction still has to be closed
                log::info!("read cancelled after {} bytes", captured);
                if let Err(e) = self.reset_with_ack() {
                    err = e;
                }
            }
            return Err(EzpError::PartialRead {
                data,
                captured,
                source: Box::new(err),
            });
        }

        if let Err(err) = self.reset_with_ack() {
            let captured = data.len();
            return Err(EzpError::PartialRead {
                data,
                captured,
                source: Box::new(err),
            });
        }

        Ok(data)
    }

    fn reset_with_ack(&mut self) -> Result<()> {
        self.send_packet(CommandPacket::reset(), Step::Reset)?;
        self.recv_packet(Step::ResetAck)?;
        Ok(())
    }

    /// Writes `data` over the whole flash of the chip described by `profile`.
    ///
    /// `data` must be exactly the flash size. Any failure aborts the
    /// sequence.
    pub fn write_flash(
        &mut self,
        data: &[u8],
        profile: &ChipProfile,
        options: TransferOptions,
        progress: Option<&mut dyn ProgressObserver>,
    ) -> Result<()> {
        profile.check_geometry()?;
        if data.len() != profile.flash_size as usize {
            return Err(EzpError::DataSizeMismatch {
                expected: profile.flash_size as usize,
                actual: data.len(),
            });
        }
        let session = TransferSession::new(profile);
        let mut progress = progress;

        self.set_chip_data(profile, &options)?;
        // the programmer does not acknowledge this one before taking data
        self.send_packet(CommandPacket::start_transaction(), Step::StartTransaction)?;

        match self.push_blocks(&session, data, &mut progress) {
            Ok(()) => {}
            Err(EzpError::Cancelled) => {
                self.send_packet(CommandPacket::reset(), Step::Reset)?;
                return Err(EzpError::Cancelled);
            }
            Err(e) => return Err(e),
        }

        self.send_packet(CommandPacket::reset(), Step::Reset)
    }
}

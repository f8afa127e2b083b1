use crate::chips::ChipProfile;
use crate::EZP_PACKET_SIZE;

/// Command codes understood by the programmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    StartTransaction = 0x0005,
    SetChipData = 0x0007,
    CheckChip = 0x0009,
    /// Known to the firmware, not used by any workflow yet.
    Erase = 0x000A,
    /// Known to the firmware, not used by any workflow yet.
    StartErasing = 0x0102,
    Reset = 0x0108,
}
impl TryFrom<u16> for Command {
    type Error = ();

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            x if x == Self::StartTransaction as u16 => Ok(Self::StartTransaction),
            x if x == Self::SetChipData as u16 => Ok(Self::SetChipData),
            x if x == Self::CheckChip as u16 => Ok(Self::CheckChip),
            x if x == Self::Erase as u16 => Ok(Self::Erase),
            x if x == Self::StartErasing as u16 => Ok(Self::StartErasing),
            x if x == Self::Reset as u16 => Ok(Self::Reset),
            _ => Err(()),
        }
    }
}

/// SPI clock used for reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Speed {
    #[default]
    Mhz12 = 0,
    Mhz6 = 1,
    Mhz3 = 2,
    Mhz1_5 = 3,
    Khz750 = 4,
    Khz375 = 5,
}
impl TryFrom<u8> for Speed {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            x if x == Self::Mhz12 as u8 => Ok(Self::Mhz12),
            x if x == Self::Mhz6 as u8 => Ok(Self::Mhz6),
            x if x == Self::Mhz3 as u8 => Ok(Self::Mhz3),
            x if x == Self::Mhz1_5 as u8 => Ok(Self::Mhz1_5),
            x if x == Self::Khz750 as u8 => Ok(Self::Khz750),
            x if x == Self::Khz375 as u8 => Ok(Self::Khz375),
            _ => Err(()),
        }
    }
}

// byte offsets inside the 64 byte packet
const OFF_COMMAND: usize = 0;
const OFF_CLASS: usize = 2;
const OFF_ALGORITHM: usize = 3;
const OFF_PAGE_SIZE: usize = 4;
const OFF_DELAY: usize = 6;
const OFF_FLASH_SIZE: usize = 8;
const OFF_CHIP_ID: usize = 12;
const OFF_SPEED: usize = 16;
const OFF_VOLTAGE: usize = 28;

/// Command packet for the programmer.
///
/// Every packet is exactly [`EZP_PACKET_SIZE`] bytes on the wire with all
/// multi-byte fields big-endian; reserved space is always sent as zeros.
/// The shorthand constructors build the only field combinations the
/// workflows send, [`CommandPacket::decode`] accepts anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandPacket {
    /// Raw command code, see [`Command`].
    command: u16,
    /// Chip class, see [`crate::ChipClass`].
    class: u8,
    algorithm: u8,
    /// Flash page size, 1 to 256.
    page_size: u16,
    delay: u16,
    flash_size: u32,
    chip_id: u32,
    /// Speed code, or a class dependent alias of it.
    speed: u8,
    voltage: u8,
}
impl CommandPacket {
    fn new(command: Command) -> Self {
        CommandPacket {
            command: command as u16,
            ..Default::default()
        }
    }

    /// Creates a CHECK_CHIP command
    pub fn check_chip() -> Self {
        CommandPacket::new(Command::CheckChip)
    }

    /// Creates a RESET command
    pub fn reset() -> Self {
        CommandPacket::new(Command::Reset)
    }

    /// Creates a START_TRANSACTION command
    pub fn start_transaction() -> Self {
        CommandPacket::new(Command::StartTransaction)
    }

    /// Creates a SET_CHIP_DATA command carrying every field of `profile`.
    pub fn set_chip_data(profile: &ChipProfile, speed: u8) -> Self {
        CommandPacket {
            command: Command::SetChipData as u16,
            class: profile.class as u8,
            algorithm: profile.algorithm,
            page_size: profile.page_size,
            delay: profile.delay,
            flash_size: profile.flash_size,
            chip_id: profile.chip_id,
            speed,
            voltage: profile.voltage as u8,
        }
    }

    /// Serializes the packet to its wire form.
    pub fn encode(&self) -> [u8; EZP_PACKET_SIZE] {
        let mut buf = [0u8; EZP_PACKET_SIZE];
        buf[OFF_COMMAND..OFF_COMMAND + 2].copy_from_slice(&self.command.to_be_bytes());
        buf[OFF_CLASS] = self.class;
        buf[OFF_ALGORITHM] = self.algorithm;
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 2].copy_from_slice(&self.page_size.to_be_bytes());
        buf[OFF_DELAY..OFF_DELAY + 2].copy_from_slice(&self.delay.to_be_bytes());
        buf[OFF_FLASH_SIZE..OFF_FLASH_SIZE + 4].copy_from_slice(&self.flash_size.to_be_bytes());
        buf[OFF_CHIP_ID..OFF_CHIP_ID + 4].copy_from_slice(&self.chip_id.to_be_bytes());
        buf[OFF_SPEED] = self.speed;
        buf[OFF_VOLTAGE] = self.voltage;
        buf
    }

    /// Parses a packet from its wire form. Reserved bytes are ignored.
    pub fn decode(buf: &[u8; EZP_PACKET_SIZE]) -> Self {
        let be16 = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);
        let be32 =
            |off: usize| u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        CommandPacket {
            command: be16(OFF_COMMAND),
            class: buf[OFF_CLASS],
            algorithm: buf[OFF_ALGORITHM],
            page_size: be16(OFF_PAGE_SIZE),
            delay: be16(OFF_DELAY),
            flash_size: be32(OFF_FLASH_SIZE),
            chip_id: be32(OFF_CHIP_ID),
            speed: buf[OFF_SPEED],
            voltage: buf[OFF_VOLTAGE],
        }
    }

    pub fn get_command(&self) -> Option<Command> {
        self.command.try_into().ok()
    }

    pub fn get_command_code(&self) -> u16 {
        self.command
    }

    pub fn get_class(&self) -> u8 {
        self.class
    }

    pub fn get_algorithm(&self) -> u8 {
        self.algorithm
    }

    pub fn get_page_size(&self) -> u16 {
        self.page_size
    }

    pub fn get_delay(&self) -> u16 {
        self.delay
    }

    pub fn get_flash_size(&self) -> u32 {
        self.flash_size
    }

    pub fn get_chip_id(&self) -> u32 {
        self.chip_id
    }

    pub fn get_speed(&self) -> u8 {
        self.speed
    }

    pub fn get_voltage(&self) -> u8 {
        self.voltage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chips::tests::{at24c02, w25q32};

    fn sample() -> CommandPacket {
        CommandPacket {
            command: 0x0108,
            class: 0xA1,
            algorithm: 0xB2,
            page_size: 0x1234,
            delay: 0xBEEF,
            flash_size: 0x8040_2010,
            chip_id: 0xDEAD_BEEF,
            speed: 0x05,
            voltage: 0x02,
        }
    }

    #[test]
    fn encoded_packet_is_64_bytes() {
        assert_eq!(CommandPacket::reset().encode().len(), 64);
        assert_eq!(std::mem::size_of::<[u8; EZP_PACKET_SIZE]>(), 64);
    }

    #[test]
    fn multi_byte_fields_are_big_endian() {
        let buf = sample().encode();
        assert_eq!(&buf[0..2], &[0x01, 0x08]);
        assert_eq!(buf[2], 0xA1);
        assert_eq!(buf[3], 0xB2);
        assert_eq!(&buf[4..6], &[0x12, 0x34]);
        assert_eq!(&buf[6..8], &[0xBE, 0xEF]);
        assert_eq!(&buf[8..12], &[0x80, 0x40, 0x20, 0x10]);
        assert_eq!(&buf[12..16], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(buf[16], 0x05);
        assert!(buf[17..28].iter().all(|&b| b == 0));
        assert_eq!(buf[28], 0x02);
        assert!(buf[29..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_inverts_encode() {
        let extremes = [
            CommandPacket::default(),
            sample(),
            CommandPacket {
                command: u16::MAX,
                class: u8::MAX,
                algorithm: u8::MAX,
                page_size: u16::MAX,
                delay: u16::MAX,
                flash_size: u32::MAX,
                chip_id: u32::MAX,
                speed: u8::MAX,
                voltage: u8::MAX,
            },
            CommandPacket::set_chip_data(&w25q32(), Speed::Khz375 as u8),
        ];
        for p in extremes {
            assert_eq!(CommandPacket::decode(&p.encode()), p);
        }
    }

    #[test]
    fn decode_ignores_reserved_bytes() {
        let mut buf = CommandPacket::start_transaction().encode();
        buf[20] = 0xFF;
        buf[63] = 0xFF;
        assert_eq!(
            CommandPacket::decode(&buf),
            CommandPacket::start_transaction()
        );
    }

    #[test]
    fn shorthands_carry_only_their_command() {
        for (p, cmd, word) in [
            (CommandPacket::check_chip(), Command::CheckChip, [0x00, 0x09]),
            (CommandPacket::reset(), Command::Reset, [0x01, 0x08]),
            (
                CommandPacket::start_transaction(),
                Command::StartTransaction,
                [0x00, 0x05],
            ),
        ] {
            let buf = p.encode();
            assert_eq!(p.get_command(), Some(cmd));
            assert_eq!(&buf[..2], &word);
            assert!(buf[2..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn set_chip_data_carries_profile() {
        let chip = at24c02();
        let p = CommandPacket::set_chip_data(&chip, Speed::Mhz3 as u8);
        assert_eq!(p.get_command(), Some(Command::SetChipData));
        assert_eq!(p.get_class(), 1);
        assert_eq!(p.get_algorithm(), 0x02);
        assert_eq!(p.get_page_size(), 8);
        assert_eq!(p.get_delay(), 5);
        assert_eq!(p.get_flash_size(), 256);
        assert_eq!(p.get_chip_id(), 0);
        assert_eq!(p.get_speed(), 2);
        assert_eq!(p.get_voltage(), 2);
    }

    #[test]
    fn command_codes() {
        assert_eq!(Command::try_from(0x0102), Ok(Command::StartErasing));
        assert_eq!(Command::try_from(0x000A), Ok(Command::Erase));
        assert_eq!(Command::try_from(0x0001), Err(()));
        assert_eq!(Speed::try_from(4), Ok(Speed::Khz750));
        assert_eq!(Speed::try_from(6), Err(()));
    }
}

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{EzpError, Result};

/// Size in bytes of one record in the chips data file.
pub const CHIP_RECORD_SIZE: usize = 68;
/// Size in bytes of the zero padded name field of a record.
pub const CHIP_NAME_LEN: usize = 48;

/// Flash technology family of a chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChipClass {
    SpiFlash = 0,
    Eeprom24 = 1,
    Eeprom93 = 2,
    /// Untested on hardware.
    Eeprom25 = 3,
    /// Untested on hardware.
    Eeprom95 = 4,
}
impl ChipClass {
    /// Family name as shown by the vendor software.
    pub fn name(&self) -> &'static str {
        match self {
            ChipClass::SpiFlash => "SPI_FLASH",
            ChipClass::Eeprom24 => "EEPROM_24",
            ChipClass::Eeprom93 => "EEPROM_93",
            ChipClass::Eeprom25 => "EEPROM_25",
            ChipClass::Eeprom95 => "EEPROM_95",
        }
    }
}
impl TryFrom<u8> for ChipClass {
    type Error = EzpError;

    fn try_from(x: u8) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == Self::SpiFlash as u8 => Ok(Self::SpiFlash),
            x if x == Self::Eeprom24 as u8 => Ok(Self::Eeprom24),
            x if x == Self::Eeprom93 as u8 => Ok(Self::Eeprom93),
            x if x == Self::Eeprom25 as u8 => Ok(Self::Eeprom25),
            x if x == Self::Eeprom95 as u8 => Ok(Self::Eeprom95),
            _ => Err(EzpError::InvalidChipClass(x)),
        }
    }
}
impl fmt::Display for ChipClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Supply voltage presented to the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Voltage {
    V3_3 = 0,
    V1_8 = 1,
    V5_0 = 2,
}
impl TryFrom<u8> for Voltage {
    type Error = EzpError;

    fn try_from(x: u8) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == Self::V3_3 as u8 => Ok(Self::V3_3),
            x if x == Self::V1_8 as u8 => Ok(Self::V1_8),
            x if x == Self::V5_0 as u8 => Ok(Self::V5_0),
            _ => Err(EzpError::InvalidVoltage(x)),
        }
    }
}

/// Flashing parameters of one chip model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipProfile {
    /// Comma separated "type,manufacturer,model".
    pub name: String,
    /// Vendor chip id, only meaningful for [`ChipClass::SpiFlash`].
    pub chip_id: u32,
    /// Flash size in bytes, a power of two.
    pub flash_size: u32,
    /// Page size in bytes, a power of two in `1..=256`.
    pub page_size: u16,
    pub class: ChipClass,
    /// Vendor timing/voltage program for the class.
    pub algorithm: u8,
    pub delay: u16,
    pub extend: u16,
    pub eeprom_size: u16,
    pub eeprom_page_size: u8,
    pub voltage: Voltage,
}

impl ChipProfile {
    /// Checks that the flash is made of whole pages.
    pub fn check_geometry(&self) -> Result<()> {
        if self.page_size == 0 || self.flash_size % u32::from(self.page_size) != 0 {
            return Err(EzpError::FlashGeometryInvalid {
                flash_size: self.flash_size,
                page_size: self.page_size,
            });
        }
        Ok(())
    }

    fn name_part(&self, n: usize) -> Option<&str> {
        self.name.split(',').nth(n).map(str::trim)
    }

    /// Chip type, the first part of the name.
    pub fn kind(&self) -> Option<&str> {
        self.name_part(0)
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.name_part(1)
    }

    pub fn model(&self) -> Option<&str> {
        self.name_part(2)
    }
}

/// Zero padded fixed width name, serialized as a bare byte tuple.
#[derive(Debug, Clone, Copy)]
struct RecordName([u8; CHIP_NAME_LEN]);

impl Serialize for RecordName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(CHIP_NAME_LEN)?;
        for b in &self.0 {
            tup.serialize_element(b)?;
        }
        tup.end()
    }
}

impl<'de> Deserialize<'de> for RecordName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NameVisitor;

        impl<'de> Visitor<'de> for NameVisitor {
            type Value = RecordName;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} name bytes", CHIP_NAME_LEN)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<RecordName, A::Error> {
                let mut name = [0u8; CHIP_NAME_LEN];
                for (i, b) in name.iter_mut().enumerate() {
                    *b = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(RecordName(name))
            }
        }

        deserializer.deserialize_tuple(CHIP_NAME_LEN, NameVisitor)
    }
}

/// On-disk layout of a chip profile.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct ChipRecord {
    name: RecordName,
    chip_id: u32,
    flash: u32,
    flash_page: u16,
    class: u8,
    algorithm: u8,
    delay: u16,
    extend: u16,
    eeprom: u16,
    eeprom_page: u8,
    voltage: u8,
}
impl ChipRecord {
    fn empty() -> Self {
        ChipRecord {
            name: RecordName([0; CHIP_NAME_LEN]),
            chip_id: 0,
            flash: 0,
            flash_page: 0,
            class: 0,
            algorithm: 0,
            delay: 0,
            extend: 0,
            eeprom: 0,
            eeprom_page: 0,
            voltage: 0,
        }
    }
}

impl From<&ChipProfile> for ChipRecord {
    fn from(p: &ChipProfile) -> Self {
        let mut name = [0u8; CHIP_NAME_LEN];
        let bytes = p.name.as_bytes();
        if bytes.len() > CHIP_NAME_LEN {
            log::warn!("chip name {:?} truncated to {} bytes", p.name, CHIP_NAME_LEN);
        }
        let len = bytes.len().min(CHIP_NAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);

        ChipRecord {
            name: RecordName(name),
            chip_id: p.chip_id,
            flash: p.flash_size,
            flash_page: p.page_size,
            class: p.class as u8,
            algorithm: p.algorithm,
            delay: p.delay,
            extend: p.extend,
            eeprom: p.eeprom_size,
            eeprom_page: p.eeprom_page_size,
            voltage: p.voltage as u8,
        }
    }
}

impl TryFrom<ChipRecord> for ChipProfile {
    type Error = EzpError;

    fn try_from(r: ChipRecord) -> Result<Self> {
        let end = r.name.0.iter().position(|&b| b == 0).unwrap_or(CHIP_NAME_LEN);
        Ok(ChipProfile {
            name: String::from_utf8_lossy(&r.name.0[..end]).into_owned(),
            chip_id: r.chip_id,
            flash_size: r.flash,
            page_size: r.flash_page,
            class: r.class.try_into()?,
            algorithm: r.algorithm,
            delay: r.delay,
            extend: r.extend,
            eeprom_size: r.eeprom,
            eeprom_page_size: r.eeprom_page,
            voltage: r.voltage.try_into()?,
        })
    }
}

/// Reads every chip profile from a chips data stream.
///
/// The stream is a run of fixed size little-endian records closed by one
/// all-zero record, which is not returned.
pub fn read_chips_data_from<R: Read>(mut reader: R) -> Result<Vec<ChipProfile>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;

    if buf.is_empty() || buf.len() % CHIP_RECORD_SIZE != 0 {
        return Err(EzpError::ChipsDataInvalid { len: buf.len() });
    }

    let entries = buf.len() / CHIP_RECORD_SIZE - 1;
    buf.chunks_exact(CHIP_RECORD_SIZE)
        .take(entries)
        .map(|chunk| {
            let record: ChipRecord =
                bincode::deserialize(chunk).map_err(EzpError::ChipsDataDeserializeFailure)?;
            ChipProfile::try_from(record)
        })
        .collect()
}

/// Writes chip profiles followed by the terminating empty record.
pub fn write_chips_data_to<W: Write>(mut writer: W, chips: &[ChipProfile]) -> Result<()> {
    for chip in chips {
        let bytes = bincode::serialize(&ChipRecord::from(chip))
            .map_err(EzpError::ChipsDataSerializeFailure)?;
        writer.write_all(&bytes)?;
    }
    let empty =
        bincode::serialize(&ChipRecord::empty()).map_err(EzpError::ChipsDataSerializeFailure)?;
    writer.write_all(&empty)?;
    writer.flush()?;
    Ok(())
}

/// Reads the chips data file at `path`.
pub fn read_chips_data(path: impl AsRef<Path>) -> Result<Vec<ChipProfile>> {
    read_chips_data_from(File::open(path)?)
}

/// Replaces the chips data file at `path`.
pub fn write_chips_data(path: impl AsRef<Path>, chips: &[ChipProfile]) -> Result<()> {
    write_chips_data_to(File::create(path)?, chips)
}

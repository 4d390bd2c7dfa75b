/*
    navcard
    https://github.com/navcard/navcard

    Copyright 2025 navcard contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

//! USB data card programmers.
//!
//! Two programmer families are supported: the Skybound G2 (bulk opcode
//! protocol) and the Garmin Aviation Card Programmer (control transfer
//! protocol, bootstrapped with a firmware upload on first plug-in). Both
//! expose the same operations through the [`Programmer`] enum: identify the
//! inserted card, then read, erase and write it sector by sector.

pub mod detect;
pub mod firmware;
pub mod garmin;
pub mod skybound;
pub mod transport;

use thiserror::Error;

pub use garmin::GarminCardDevice;
pub use skybound::SkyboundDevice;
pub use transport::{UsbPort, UsbTransport};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found")]
    DeviceNotFound,
    #[error("could not open device: {0}")]
    OpenFailed(String),
    #[error("unexpected response: got {got:02X?}, expected {expected:02X?}")]
    UnexpectedResponse { got: Vec<u8>, expected: Vec<u8> },
    #[error("data card is missing")]
    NoCard,
    #[error("no data card has been identified")]
    CardNotInitialized,
    #[error("unknown data card with chip IIDs {iids:08X?}; please file a bug")]
    UnsupportedCard { iids: Vec<u32> },
    #[error("this card requires the orange G2 firmware ({expected}); the device reports {found}")]
    WrongFirmware { expected: String, found: String },
    #[error("firmware is already up to date")]
    AlreadyUpdated,
    #[error("no suitable endpoints found in the device configuration")]
    NoSuitableEndpoints,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("device disappeared")]
    UsbNoDevice,
    #[error("USB I/O error")]
    UsbIo,
    #[error("USB error: {0}")]
    Usb(String),
    #[error("malformed firmware image")]
    MalformedFirmware,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The two data card geometries the programmers accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    NavData,
    Taws,
}

impl CardType {
    pub fn sector_size(&self) -> usize {
        match self {
            CardType::NavData => 0x10000,
            CardType::Taws => 0x10800,
        }
    }

    /// Size of one bulk read.
    pub fn read_size(&self) -> usize {
        match self {
            CardType::NavData => 0x1000,
            CardType::Taws => 0xF800,
        }
    }

    /// Writes must be padded to a multiple of this.
    pub fn min_write_size(&self) -> usize {
        match self {
            CardType::NavData => 0x1000,
            CardType::Taws => 0x0840,
        }
    }

    /// Largest chunk issued per bulk write.
    pub fn max_write_size(&self) -> usize {
        match self {
            CardType::NavData => 0x1000,
            CardType::Taws => 0xFFC0,
        }
    }
}

/// Chip identification table: (manufacturer id, device id) to card type,
/// sectors per chip, and the label printed for the user.
const IID_MAP: &[((u8, u8), (CardType, u32, &str))] = &[
    // 2/3/4 MB Intel Series 2 (1 MB per chip)
    ((0x89, 0xA2), (CardType::NavData, 0x10, "non-WAAS (white)")),
    // 4/6/8 MB AMD Series C/D (2 MB per chip)
    ((0x01, 0xAD), (CardType::NavData, 0x20, "non-WAAS (green)")),
    // 16 MB AMD Series C/D (4 MB per chip)
    ((0x01, 0x41), (CardType::NavData, 0x40, "WAAS (silver)")),
    ((0x89, 0x7E), (CardType::NavData, 0x40, "WAAS (orange)")),
];

pub(crate) fn lookup_iid(manufacturer: u8, device: u8) -> Option<(CardType, u32, &'static str)> {
    IID_MAP
        .iter()
        .find(|((m, d), _)| *m == manufacturer && *d == device)
        .map(|(_, info)| *info)
}

/// Identification of the inserted card, established by `init_data_card`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub card_type: CardType,
    pub chips: u32,
    pub sectors_per_chip: u32,
    pub label: &'static str,
}

impl CardInfo {
    pub fn name(&self) -> String {
        format!("{}MB {}", self.chips * self.sectors_per_chip / 0x10, self.label)
    }

    pub fn description(&self) -> String {
        format!("{} chips of {}MB", self.chips, self.sectors_per_chip / 0x10)
    }

    pub fn total_sectors(&self) -> u32 {
        self.chips * self.sectors_per_chip
    }

    pub fn total_size(&self) -> u64 {
        self.total_sectors() as u64 * self.card_type.sector_size() as u64
    }
}

/// Session state of a programmer. At most one phase is active at a time and
/// it must be closed with the matching end command before another begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Session {
    #[default]
    Idle,
    Reading,
    Writing,
    Erasing,
}

/// A detected card programmer. The two variants share one operation set;
/// dispatch is by exhaustive match.
pub enum Programmer<P: UsbPort> {
    Skybound(SkyboundDevice<P>),
    Garmin(GarminCardDevice<P>),
}

impl<P: UsbPort> Programmer<P> {
    pub fn init(&mut self) -> Result<(), DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.init(),
            Programmer::Garmin(dev) => dev.init(),
        }
    }

    pub fn close(&mut self) -> Result<(), DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.close(),
            Programmer::Garmin(_) => Ok(()),
        }
    }

    pub fn has_card(&mut self) -> Result<bool, DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.has_card(),
            Programmer::Garmin(dev) => dev.has_card(),
        }
    }

    pub fn check_card(&mut self) -> Result<(), DeviceError> {
        if !self.has_card()? {
            return Err(DeviceError::NoCard);
        }
        Ok(())
    }

    pub fn init_data_card(&mut self) -> Result<(), DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.init_data_card(),
            Programmer::Garmin(dev) => dev.init_data_card(),
        }
    }

    pub fn card(&self) -> Result<&CardInfo, DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.card(),
            Programmer::Garmin(dev) => dev.card(),
        }
        .ok_or(DeviceError::CardNotInitialized)
    }

    pub fn chip_iids(&mut self) -> Result<Vec<u32>, DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.chip_iids(),
            Programmer::Garmin(dev) => Ok(vec![dev.card_id()?]),
        }
    }

    pub fn firmware_version(&mut self) -> Result<String, DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.firmware_version(),
            Programmer::Garmin(dev) => Ok(dev.firmware_version().to_string()),
        }
    }

    pub fn firmware_description(&mut self) -> Result<String, DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.firmware_description(),
            Programmer::Garmin(dev) => Ok(dev.firmware_version().to_string()),
        }
    }

    pub fn total_sectors(&self) -> Result<u32, DeviceError> {
        Ok(self.card()?.total_sectors())
    }

    pub fn total_size(&self) -> Result<u64, DeviceError> {
        Ok(self.card()?.total_size())
    }

    /// Check that the device firmware is able to write the inserted card.
    pub fn check_supports_write(&mut self) -> Result<(), DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.check_supports_write(),
            Programmer::Garmin(_) => Ok(()),
        }
    }

    /// Read `length` bytes starting at `start_sector`, feeding each block to
    /// `sink`.
    pub fn read_blocks(
        &mut self,
        start_sector: u32,
        length: u64,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.read_blocks(start_sector, length, sink),
            Programmer::Garmin(dev) => dev.read_blocks(start_sector, length, sink),
        }
    }

    /// Erase `num_sectors` sectors starting at `start_sector`.
    pub fn erase_sectors(
        &mut self,
        start_sector: u32,
        num_sectors: u32,
        progress: crate::ProgressFn,
    ) -> Result<(), DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.erase_sectors(start_sector, num_sectors, progress),
            Programmer::Garmin(dev) => dev.erase_sectors(start_sector, num_sectors, progress),
        }
    }

    /// Write `length` bytes starting at `start_sector`, pulling data from
    /// `source`, which must return exactly the requested number of bytes.
    pub fn write_blocks(
        &mut self,
        start_sector: u32,
        length: u64,
        source: &mut dyn FnMut(usize) -> Result<Vec<u8>, DeviceError>,
        progress: crate::ProgressFn,
    ) -> Result<(), DeviceError> {
        match self {
            Programmer::Skybound(dev) => dev.write_blocks(start_sector, length, source, progress),
            Programmer::Garmin(dev) => dev.write_blocks(start_sector, length, source, progress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iid_lookup() {
        let (card_type, sectors, label) = lookup_iid(0x01, 0x41).unwrap();
        assert_eq!(card_type, CardType::NavData);
        assert_eq!(sectors, 0x40);
        assert_eq!(label, "WAAS (silver)");

        assert!(lookup_iid(0x12, 0x34).is_none());
    }

    #[test]
    fn test_card_info_sizes() {
        let info = CardInfo {
            card_type: CardType::NavData,
            chips: 4,
            sectors_per_chip: 0x40,
            label: "WAAS (silver)",
        };
        assert_eq!(info.name(), "16MB WAAS (silver)");
        assert_eq!(info.description(), "4 chips of 4MB");
        assert_eq!(info.total_sectors(), 0x100);
        assert_eq!(info.total_size(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_card_type_geometry() {
        assert_eq!(CardType::NavData.sector_size(), 0x10000);
        assert_eq!(CardType::NavData.read_size(), 0x1000);
        assert_eq!(CardType::Taws.sector_size(), 0x10800);
        assert_eq!(CardType::Taws.read_size(), 0xF800);
        assert_eq!(CardType::Taws.min_write_size(), 0x0840);
        assert_eq!(CardType::Taws.max_write_size(), 0xFFC0);
    }
}

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

    src/card/skybound.rs

    Driver for the Skybound G2 programmer. The wire protocol is a simple
    opcode-and-response exchange over the bulk endpoints; chips are addressed
    by selecting one of four physical base offsets, with an extra offset term
    for the 16 MB cards.
*/

use super::{lookup_iid, CardInfo, DeviceError, UsbPort};

pub const READ_ENDPOINT: u8 = 0x81;
pub const WRITE_ENDPOINT: u8 = 0x02;

pub const BLOCK_SIZE: usize = 0x1000;
pub const BLOCKS_PER_SECTOR: u32 = 0x10;

/// Physical base offset of each chip.
const MEMORY_OFFSETS: [u16; 4] = [0x00E0, 0x0160, 0x01A0, 0x01C0];

/// Chip id sentinels reported past the last chip; which one depends on the
/// G2 firmware generation.
const SENTINEL_BLACK: u32 = 0x9000_9000;
const SENTINEL_ORANGE: u32 = 0xFF00_FF00;

const FIRMWARE_ORANGE: &str = "20140530";

const RESPONSE_LEN: usize = 0x40;

pub struct SkyboundDevice<P: UsbPort> {
    port: P,
    card: Option<CardInfo>,
}

impl<P: UsbPort> SkyboundDevice<P> {
    pub fn new(port: P) -> Self {
        SkyboundDevice { port, card: None }
    }

    pub fn init(&mut self) -> Result<(), DeviceError> {
        self.set_led(true)
    }

    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.set_led(false)
    }

    pub fn card(&self) -> Option<&CardInfo> {
        self.card.as_ref()
    }

    pub fn set_led(&mut self, on: bool) -> Result<(), DeviceError> {
        self.port.bulk_write(if on { b"\x12" } else { b"\x13" })
    }

    pub fn has_card(&mut self) -> Result<bool, DeviceError> {
        self.port.bulk_write(b"\x18")?;
        let buf = self.port.bulk_read(RESPONSE_LEN)?;
        match buf.as_slice() {
            [0x00] => Ok(true),
            [0x01] => Ok(false),
            _ => Err(DeviceError::UnexpectedResponse {
                got: buf,
                expected: vec![0x00],
            }),
        }
    }

    pub fn check_card(&mut self) -> Result<(), DeviceError> {
        if !self.has_card()? {
            return Err(DeviceError::NoCard);
        }
        Ok(())
    }

    /// Probe the four chip slots, stopping at the firmware's past-the-end
    /// sentinel.
    pub fn chip_iids(&mut self) -> Result<Vec<u32>, DeviceError> {
        let mut iids = Vec::new();
        for offset in MEMORY_OFFSETS {
            self.select_physical_sector(offset)?;
            self.before_read()?;
            let iid = self.read_iid()?;
            if iid == SENTINEL_BLACK || iid == SENTINEL_ORANGE {
                break;
            }
            iids.push(iid);
        }
        Ok(iids)
    }

    pub fn init_data_card(&mut self) -> Result<(), DeviceError> {
        if !self.has_card()? {
            return Err(DeviceError::NoCard);
        }

        let iids = self.chip_iids()?;
        if iids.is_empty() {
            // Possibly a Terrain/Obstacles card, which this programmer
            // cannot identify.
            return Err(DeviceError::UnsupportedCard { iids });
        }

        // None of the known cards have a single chip or mixed chip types.
        if iids.len() == 1 || iids.iter().any(|&iid| iid != iids[0]) {
            return Err(DeviceError::UnsupportedCard { iids });
        }

        let iid = iids[0];
        let manufacturer = (iid >> 24) as u8;
        let device = (iid >> 8) as u8;

        let Some((card_type, sectors_per_chip, label)) = lookup_iid(manufacturer, device) else {
            return Err(DeviceError::UnsupportedCard { iids });
        };

        self.card = Some(CardInfo {
            card_type,
            chips: iids.len() as u32,
            sectors_per_chip,
            label,
        });
        Ok(())
    }

    pub fn firmware_version(&mut self) -> Result<String, DeviceError> {
        self.port.bulk_write(b"\x60")?;
        let buf = self.port.bulk_read(RESPONSE_LEN)?;
        Ok(String::from_utf8_lossy(&buf).trim_end_matches('\0').to_string())
    }

    pub fn firmware_description(&mut self) -> Result<String, DeviceError> {
        let version = self.firmware_version()?;
        let name = match version.as_str() {
            "20071203" => "G2 Black",
            FIRMWARE_ORANGE => "G2 Orange",
            _ => "unknown",
        };
        Ok(format!("{} ({})", version, name))
    }

    /// Orange-label cards can only be written by the orange G2 firmware.
    pub fn check_supports_write(&mut self) -> Result<(), DeviceError> {
        let card = self.card.as_ref().ok_or(DeviceError::CardNotInitialized)?;
        if card.label == "WAAS (orange)" {
            let version = self.firmware_version()?;
            if version != FIRMWARE_ORANGE {
                return Err(DeviceError::WrongFirmware {
                    expected: FIRMWARE_ORANGE.to_string(),
                    found: version,
                });
            }
        }
        Ok(())
    }

    pub fn chip_1m_version(&mut self) -> Result<u32, DeviceError> {
        self.port.bulk_write(b"\x50\x03")?;
        let buf = self.port.bulk_read(RESPONSE_LEN)?;
        Ok(read_le_u32(&buf))
    }

    fn read_iid(&mut self) -> Result<u32, DeviceError> {
        self.port.bulk_write(b"\x50\x04")?;
        let buf = self.port.bulk_read(RESPONSE_LEN)?;
        Ok(read_le_u32(&buf))
    }

    fn read_block(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.port.bulk_write(b"\x28")?;
        self.port.bulk_read(BLOCK_SIZE)
    }

    fn write_block(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        let card = self.card.as_ref().ok_or(DeviceError::CardNotInitialized)?;

        let expected_byte = if card.sectors_per_chip == 0x10 {
            // 1 MB chips
            self.port.bulk_write(b"\x2A\x03")?;
            0x80
        } else {
            self.port.bulk_write(b"\x2A\x04")?;
            data[data.len() - 1]
        };

        self.port.bulk_write(data)?;
        let buf = self.port.bulk_read(RESPONSE_LEN)?;
        if buf.len() != 4 || buf[0] != expected_byte || buf[1..] != [0, 0, 0] {
            return Err(DeviceError::UnexpectedResponse {
                got: buf,
                expected: vec![expected_byte, 0, 0, 0],
            });
        }
        Ok(())
    }

    fn select_physical_sector(&mut self, sector: u16) -> Result<(), DeviceError> {
        let mut cmd = vec![0x30, 0x00, 0x00];
        cmd.extend_from_slice(&sector.to_le_bytes());
        self.port.bulk_write(&cmd)
    }

    /// Logical to physical sector arithmetic. Each chip sits at one of the
    /// four base offsets; 4 MB chips additionally alternate a 0x200 term at
    /// the half-chip boundary.
    pub fn translate_sector(&self, sector: u32) -> Result<u16, DeviceError> {
        let card = self.card.as_ref().ok_or(DeviceError::CardNotInitialized)?;
        let spc = card.sectors_per_chip;
        let offset = *MEMORY_OFFSETS
            .get((sector / spc) as usize)
            .ok_or(DeviceError::Protocol("sector is past the end of the card"))? as u32;
        let physical = if spc > 0x20 {
            let offset_for_16mb = 0x200 * (sector / 0x20 % 2);
            offset + sector % 0x20 + offset_for_16mb
        } else {
            offset + sector % spc
        };
        Ok(physical as u16)
    }

    fn select_sector(&mut self, sector: u32) -> Result<(), DeviceError> {
        let physical = self.translate_sector(sector)?;
        self.select_physical_sector(physical)
    }

    fn erase_sector(&mut self) -> Result<(), DeviceError> {
        let card = self.card.as_ref().ok_or(DeviceError::CardNotInitialized)?;
        let key = if card.sectors_per_chip == 0x10 {
            // 1 MB chips take a preamble before the erase opcode.
            self.port.bulk_write(b"\x16")?;
            self.port.bulk_write(b"\x52\x03")?;
            0x03
        } else {
            self.port.bulk_write(b"\x52\x04")?;
            0x04
        };
        let buf = self.port.bulk_read(RESPONSE_LEN)?;
        if buf != [key] {
            return Err(DeviceError::UnexpectedResponse {
                got: buf,
                expected: vec![key],
            });
        }
        Ok(())
    }

    /// The distribution tool sends this before reads; its effect is unknown
    /// but it is reproduced faithfully.
    fn before_read(&mut self) -> Result<(), DeviceError> {
        self.port.bulk_write(b"\x40")
    }

    /// Same as above, for writes and erases.
    fn before_write(&mut self) -> Result<(), DeviceError> {
        self.port.bulk_write(b"\x42")
    }

    fn loop_helper(&mut self, i: u32) -> Result<(), DeviceError> {
        self.set_led(i % 2 == 0)?;
        self.check_card()
    }

    pub fn read_blocks(
        &mut self,
        start_sector: u32,
        length: u64,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        self.before_read()?;
        let mut remaining = length;
        let mut sector = start_sector;
        while remaining > 0 {
            self.select_sector(sector)?;
            for i in 0..BLOCKS_PER_SECTOR {
                if remaining == 0 {
                    break;
                }
                self.loop_helper(i)?;
                let block = self.read_block()?;
                let take = (remaining as usize).min(block.len());
                sink(&block[..take])?;
                remaining -= take as u64;
            }
            sector += 1;
        }
        Ok(())
    }

    pub fn erase_sectors(
        &mut self,
        start_sector: u32,
        num_sectors: u32,
        progress: crate::ProgressFn,
    ) -> Result<(), DeviceError> {
        let sector_size = {
            let card = self.card.as_ref().ok_or(DeviceError::CardNotInitialized)?;
            card.card_type.sector_size() as u64
        };
        self.before_write()?;
        for sector in start_sector..start_sector + num_sectors {
            self.loop_helper(sector)?;
            self.select_sector(sector)?;
            self.erase_sector()?;
            progress(sector_size);
        }
        Ok(())
    }

    pub fn write_blocks(
        &mut self,
        start_sector: u32,
        length: u64,
        source: &mut dyn FnMut(usize) -> Result<Vec<u8>, DeviceError>,
        progress: crate::ProgressFn,
    ) -> Result<(), DeviceError> {
        self.before_write()?;
        let mut remaining = length;
        let mut sector = start_sector;
        while remaining > 0 {
            self.select_sector(sector)?;
            for i in 0..BLOCKS_PER_SECTOR {
                if remaining == 0 {
                    break;
                }
                self.loop_helper(i)?;
                let take = (remaining as usize).min(BLOCK_SIZE);
                let mut block = source(take)?;
                if block.len() != take {
                    return Err(DeviceError::Protocol("data source returned a short block"));
                }
                // The card only clears bits, so unused space stays erased.
                block.resize(BLOCK_SIZE, 0xFF);
                self.write_block(&block)?;
                remaining -= take as u64;
                progress(take as u64);
            }
            sector += 1;
        }
        Ok(())
    }
}

impl<P: UsbPort> Drop for SkyboundDevice<P> {
    fn drop(&mut self) {
        // Best effort only; the device may already be gone.
        let _ = self.set_led(false);
    }
}

fn read_le_u32(buf: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let n = buf.len().min(4);
    word[..n].copy_from_slice(&buf[..n]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_sector_16mb() {
        let mut dev = SkyboundDevice::new(NullPort);
        dev.card = Some(CardInfo {
            card_type: super::super::CardType::NavData,
            chips: 4,
            sectors_per_chip: 0x40,
            label: "WAAS (silver)",
        });

        // First chip, first half.
        assert_eq!(dev.translate_sector(0).unwrap(), 0x00E0);
        assert_eq!(dev.translate_sector(0x1F).unwrap(), 0x00FF);
        // First chip, second half picks up the extra 0x200 term.
        assert_eq!(dev.translate_sector(0x20).unwrap(), 0x02E0);
        assert_eq!(dev.translate_sector(0x3F).unwrap(), 0x02FF);
        // Second chip.
        assert_eq!(dev.translate_sector(0x40).unwrap(), 0x0160);
        assert_eq!(dev.translate_sector(0x60).unwrap(), 0x0360);
    }

    #[test]
    fn test_translate_sector_2mb_chips() {
        let mut dev = SkyboundDevice::new(NullPort);
        dev.card = Some(CardInfo {
            card_type: super::super::CardType::NavData,
            chips: 4,
            sectors_per_chip: 0x20,
            label: "non-WAAS (green)",
        });

        assert_eq!(dev.translate_sector(0).unwrap(), 0x00E0);
        assert_eq!(dev.translate_sector(0x1F).unwrap(), 0x00FF);
        assert_eq!(dev.translate_sector(0x20).unwrap(), 0x0160);
        assert_eq!(dev.translate_sector(0x7F).unwrap(), 0x01DF);
    }

    /// Port that panics on use; only arithmetic is exercised here.
    struct NullPort;

    impl UsbPort for NullPort {
        fn bulk_read(&mut self, _length: usize) -> Result<Vec<u8>, DeviceError> {
            unreachable!()
        }
        fn bulk_write(&mut self, _data: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }
        fn control_read(
            &mut self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            _length: usize,
        ) -> Result<Vec<u8>, DeviceError> {
            unreachable!()
        }
        fn control_write(
            &mut self,
            _request_type: u8,
            _request: u8,
            _value: u16,
            _index: u16,
            _data: &[u8],
        ) -> Result<(), DeviceError> {
            Ok(())
        }
    }
}

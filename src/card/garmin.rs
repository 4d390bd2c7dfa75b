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

    src/card/garmin.rs

    Driver for the Garmin Aviation Card Programmer. Everything is a vendor
    control transfer: a begin command opens a read, write or erase phase,
    data moves over the bulk endpoints, and an end command closes the phase.
    The session field tracks the open phase; mixing phases without the end
    command is a protocol violation.
*/

use super::{lookup_iid, CardInfo, CardType, DeviceError, Session, UsbPort};

const REQUEST_TYPE_OUT: u8 = 0x40;
const REQUEST_TYPE_IN: u8 = 0xC0;

const REQ_BEGIN_READ: u8 = 0x81;
const REQ_CARD_ID: u8 = 0x82;
const REQ_END_READ: u8 = 0x83;
const REQ_BEGIN_ERASE: u8 = 0x85;
const REQ_BEGIN_WRITE: u8 = 0x86;
const REQ_END_WRITE: u8 = 0x87;
const REQ_FIRMWARE_VERSION: u8 = 0x8A;

/// Card id values reported when no card is inserted, one per reader
/// hardware revision.
const NO_CARD_IDS: [u32; 2] = [0x0069_7641, 0x0009_0304];

/// Per-sector erase acknowledgement prefix.
const ERASE_ACK_PREFIX: [u8; 10] = [0x42, 0x6C, 0x4B, 0x65, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

pub struct GarminCardDevice<P: UsbPort> {
    port: P,
    card: Option<CardInfo>,
    firmware: String,
    session: Session,
}

impl<P: UsbPort> GarminCardDevice<P> {
    pub fn new(port: P) -> Self {
        GarminCardDevice {
            port,
            card: None,
            firmware: String::new(),
            session: Session::Idle,
        }
    }

    /// Read and cache the firmware identification string.
    pub fn init(&mut self) -> Result<(), DeviceError> {
        let buf = self
            .port
            .control_read(REQUEST_TYPE_IN, REQ_FIRMWARE_VERSION, 0, 0, 512)?;
        self.firmware = String::from_utf8_lossy(&buf).trim_end_matches('\0').to_string();
        Ok(())
    }

    pub fn card(&self) -> Option<&CardInfo> {
        self.card.as_ref()
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware
    }

    pub fn card_id(&mut self) -> Result<u32, DeviceError> {
        let buf = self.port.control_read(REQUEST_TYPE_IN, REQ_CARD_ID, 0, 0, 4)?;
        if buf.len() != 4 {
            return Err(DeviceError::UnexpectedResponse {
                got: buf,
                expected: vec![0; 4],
            });
        }
        Ok(u32::from_le_bytes(buf.try_into().unwrap()))
    }

    pub fn has_card(&mut self) -> Result<bool, DeviceError> {
        Ok(!NO_CARD_IDS.contains(&self.card_id()?))
    }

    pub fn check_card(&mut self) -> Result<(), DeviceError> {
        if !self.has_card()? {
            return Err(DeviceError::NoCard);
        }
        Ok(())
    }

    pub fn init_data_card(&mut self) -> Result<(), DeviceError> {
        let card_id = self.card_id()?;
        if NO_CARD_IDS.contains(&card_id) {
            return Err(DeviceError::NoCard);
        }

        let chips = (card_id >> 16) as u8 as u32;
        let manufacturer = card_id as u8;
        let device = (card_id >> 8) as u8;

        let Some((card_type, sectors_per_chip, label)) = lookup_iid(manufacturer, device) else {
            return Err(DeviceError::UnsupportedCard { iids: vec![card_id] });
        };

        self.card = Some(CardInfo {
            card_type,
            chips,
            sectors_per_chip,
            label,
        });

        // Close any phase a previous session may have left open.
        self.end_read()?;
        self.end_write()?;
        self.session = Session::Idle;
        Ok(())
    }

    fn card_type(&self) -> Result<CardType, DeviceError> {
        Ok(self.card.as_ref().ok_or(DeviceError::CardNotInitialized)?.card_type)
    }

    fn begin_read(&mut self, start_sector: u16) -> Result<(), DeviceError> {
        if self.session != Session::Idle {
            return Err(DeviceError::Protocol("begin read inside an open session"));
        }
        self.check_card()?;

        // The leading field mirrors the vendor tool; no functional effect
        // has been observed.
        let unknown: u16 = match self.card_type()? {
            CardType::Taws => 0,
            CardType::NavData => 4,
        };

        // Reads from the middle of a sector are possible in principle, but
        // the offset is scaled oddly on TAWS cards; only offset 0 is used.
        let mut buf = Vec::with_capacity(10);
        buf.extend_from_slice(&unknown.to_be_bytes());
        buf.extend_from_slice(&start_sector.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        self.port
            .control_write(REQUEST_TYPE_OUT, REQ_BEGIN_READ, 0, 0, &buf)?;
        self.session = Session::Reading;
        Ok(())
    }

    fn end_read(&mut self) -> Result<(), DeviceError> {
        self.port.control_write(REQUEST_TYPE_OUT, REQ_END_READ, 0, 0, &[])?;
        self.session = Session::Idle;
        Ok(())
    }

    fn begin_erase(&mut self, start_sector: u16, sector_count: u16) -> Result<(), DeviceError> {
        if self.session != Session::Idle {
            return Err(DeviceError::Protocol("begin erase inside an open session"));
        }
        self.check_card()?;

        let (unknown1, unknown2): (u16, u16) = match self.card_type()? {
            CardType::Taws => (3, 2),
            CardType::NavData => (0, 1),
        };

        let mut buf = Vec::with_capacity(14);
        buf.extend_from_slice(&unknown1.to_be_bytes());
        buf.extend_from_slice(&start_sector.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.extend_from_slice(&sector_count.to_be_bytes());
        buf.extend_from_slice(&unknown2.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        self.port
            .control_write(REQUEST_TYPE_OUT, REQ_BEGIN_ERASE, 0, 0, &buf)?;
        self.session = Session::Erasing;
        Ok(())
    }

    fn begin_write(&mut self, start_sector: u16) -> Result<(), DeviceError> {
        if self.session != Session::Idle {
            return Err(DeviceError::Protocol("begin write inside an open session"));
        }
        self.check_card()?;

        let (unknown1, unknown2): (u16, u16) = match self.card_type()? {
            CardType::Taws => (5, 8),
            CardType::NavData => (4, 0),
        };

        let mut buf = Vec::with_capacity(10);
        buf.extend_from_slice(&unknown1.to_be_bytes());
        buf.extend_from_slice(&start_sector.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&unknown2.to_be_bytes());
        self.port
            .control_write(REQUEST_TYPE_OUT, REQ_BEGIN_WRITE, 0, 0, &buf)?;
        self.session = Session::Writing;
        Ok(())
    }

    fn end_write(&mut self) -> Result<(), DeviceError> {
        self.port.control_write(REQUEST_TYPE_OUT, REQ_END_WRITE, 0, 0, &[])?;
        self.session = Session::Idle;
        Ok(())
    }

    pub fn read_blocks(
        &mut self,
        start_sector: u32,
        length: u64,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        let block_size = self.card_type()?.read_size();
        self.begin_read(start_sector as u16)?;

        let result = (|| {
            let mut remaining = length;
            while remaining > 0 {
                let block = self.port.bulk_read(block_size)?;
                let take = (remaining as usize).min(block.len());
                sink(&block[..take])?;
                remaining = remaining.saturating_sub(block_size as u64);
            }
            Ok(())
        })();

        // The read must be closed even on failure, or the card is left in a
        // state that rejects further commands.
        let end_result = self.end_read();
        result.and(end_result)
    }

    pub fn erase_sectors(
        &mut self,
        start_sector: u32,
        num_sectors: u32,
        progress: crate::ProgressFn,
    ) -> Result<(), DeviceError> {
        let sector_size = self.card_type()?.sector_size() as u64;
        self.begin_erase(start_sector as u16, num_sectors as u16)?;

        let result = (|| {
            for idx in 0..num_sectors {
                let buf = self.port.bulk_read(0x0C)?;
                if buf.len() != 12 || buf[..10] != ERASE_ACK_PREFIX {
                    return Err(DeviceError::UnexpectedResponse {
                        got: buf,
                        expected: ERASE_ACK_PREFIX.to_vec(),
                    });
                }
                let ack_idx = u16::from_be_bytes([buf[10], buf[11]]) as u32;
                if ack_idx != idx {
                    return Err(DeviceError::UnexpectedResponse {
                        got: buf,
                        expected: (idx as u16).to_be_bytes().to_vec(),
                    });
                }
                progress(sector_size);
            }
            Ok(())
        })();

        let end_result = self.end_write();
        result.and(end_result)
    }

    pub fn write_blocks(
        &mut self,
        start_sector: u32,
        length: u64,
        source: &mut dyn FnMut(usize) -> Result<Vec<u8>, DeviceError>,
        progress: crate::ProgressFn,
    ) -> Result<(), DeviceError> {
        let card_type = self.card_type()?;
        let max_write = card_type.max_write_size();
        let min_write = card_type.min_write_size();

        self.begin_write(start_sector as u16)?;

        let result = (|| {
            let mut remaining = length;
            while remaining > 0 {
                let take = (remaining as usize).min(max_write);
                let block = source(take)?;
                if block.len() != take {
                    return Err(DeviceError::Protocol("data source returned a short block"));
                }
                self.port.bulk_write(&pad_for_write(block, min_write))?;
                remaining -= take as u64;
                progress(take as u64);
            }
            Ok(())
        })();

        let end_result = self.end_write();
        result.and(end_result)
    }
}

impl<P: UsbPort> Drop for GarminCardDevice<P> {
    fn drop(&mut self) {
        // Close any phase still open so the next session starts clean.
        match self.session {
            Session::Reading => {
                let _ = self.end_read();
            }
            Session::Writing | Session::Erasing => {
                let _ = self.end_write();
            }
            Session::Idle => {}
        }
    }
}

/// Pad a write up to the card's minimum write granularity.
fn pad_for_write(mut block: Vec<u8>, min_write: usize) -> Vec<u8> {
    let rem = block.len() % min_write;
    if rem != 0 {
        block.resize(block.len() + min_write - rem, 0xFF);
    }
    block
}

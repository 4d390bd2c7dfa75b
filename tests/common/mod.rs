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

    tests/common/mod.rs

    Simulated card programmer hardware for driver tests. The mocks model the
    flash behavior the drivers depend on: sector addressing, erase-to-0xFF,
    sequential block reads after a select, and the wire responses of both
    programmer families.
*/
#![allow(dead_code)]

use std::collections::HashMap;

use navcard::card::{DeviceError, UsbPort};

pub const MEMORY_OFFSETS: [u16; 4] = [0x00E0, 0x0160, 0x01A0, 0x01C0];
pub const SECTOR_SIZE: usize = 0x10000;
pub const BLOCK_SIZE: usize = 0x1000;

pub fn init() {
    match env_logger::builder().is_test(true).try_init() {
        Ok(_) => {
            log::debug!("Logger initialized.");
        }
        Err(e) => eprintln!("Failed to initialize logger: {}", e),
    }
}

/// Simulated Skybound G2 with a pluggable chip configuration.
pub struct SkyboundSim {
    pub iid: u32,
    pub n_chips: usize,
    pub sectors_per_chip: u32,
    pub orange_firmware: bool,
    pub has_card: bool,
    pub firmware: String,
    memory: HashMap<u16, Vec<u8>>,
    page: u16,
    block_idx: usize,
    pending: Option<Vec<u8>>,
    expect_data: Option<u8>,
    pub led: bool,
}

impl SkyboundSim {
    pub fn new(iid: u32, n_chips: usize, sectors_per_chip: u32, orange_firmware: bool) -> Self {
        SkyboundSim {
            iid,
            n_chips,
            sectors_per_chip,
            orange_firmware,
            has_card: true,
            firmware: if orange_firmware {
                "20140530".to_string()
            } else {
                "20071203".to_string()
            },
            memory: HashMap::new(),
            page: 0,
            block_idx: 0,
            pending: None,
            expect_data: None,
            led: false,
        }
    }

    pub fn without_card(mut self) -> Self {
        self.has_card = false;
        self
    }

    /// Which chip slot the currently selected page belongs to, if any.
    fn chip_index(&self) -> Option<usize> {
        let base = if MEMORY_OFFSETS.contains(&self.page) {
            self.page
        } else if MEMORY_OFFSETS.contains(&(self.page.wrapping_sub(0x200))) {
            self.page - 0x200
        } else {
            return None;
        };
        MEMORY_OFFSETS.iter().position(|&o| o == base)
    }

    fn page_data(&mut self) -> &mut Vec<u8> {
        self.memory
            .entry(self.page)
            .or_insert_with(|| vec![0xFF; SECTOR_SIZE])
    }

    fn respond(&mut self, data: Vec<u8>) {
        assert!(self.pending.is_none(), "unread response pending");
        self.pending = Some(data);
    }
}

impl UsbPort for SkyboundSim {
    fn bulk_read(&mut self, length: usize) -> Result<Vec<u8>, DeviceError> {
        let response = self.pending.take().expect("bulk read with nothing pending");
        assert!(response.len() <= length);
        Ok(response)
    }

    fn bulk_write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if let Some(expected_byte) = self.expect_data.take() {
            assert_eq!(data.len(), BLOCK_SIZE, "write block must be 4096 bytes");
            let block_idx = self.block_idx;
            let offset = block_idx * BLOCK_SIZE;
            let page = self.page_data();
            // Flash writes only clear bits.
            for (dst, &src) in page[offset..offset + BLOCK_SIZE].iter_mut().zip(data) {
                *dst &= src;
            }
            self.block_idx += 1;
            let status = vec![
                if expected_byte == 0x80 { 0x80 } else { data[BLOCK_SIZE - 1] },
                0,
                0,
                0,
            ];
            self.respond(status);
            return Ok(());
        }

        match data {
            [0x12] => self.led = true,
            [0x13] => self.led = false,
            [0x18] => {
                let response = vec![if self.has_card { 0x00 } else { 0x01 }];
                self.respond(response);
            }
            [0x30, 0x00, 0x00, lo, hi] => {
                self.page = u16::from_le_bytes([*lo, *hi]);
                self.block_idx = 0;
            }
            [0x28] => {
                let offset = self.block_idx * BLOCK_SIZE;
                let page = self.page_data();
                let block = page[offset..offset + BLOCK_SIZE].to_vec();
                self.block_idx += 1;
                self.respond(block);
            }
            [0x2A, 0x03] => self.expect_data = Some(0x80),
            [0x2A, 0x04] => self.expect_data = Some(0x00),
            [0x16] => {}
            [0x52, key] => {
                let key = *key;
                self.page_data().fill(0xFF);
                self.respond(vec![key]);
            }
            [0x40] | [0x42] => {}
            [0x50, 0x03] => {
                let response = 0u32.to_le_bytes().to_vec();
                self.respond(response);
            }
            [0x50, 0x04] => {
                let iid = match self.chip_index() {
                    Some(idx) if idx < self.n_chips => self.iid,
                    _ => {
                        if self.orange_firmware {
                            0xFF00_FF00
                        } else {
                            0x9000_9000
                        }
                    }
                };
                self.respond(iid.to_le_bytes().to_vec());
            }
            [0x60] => {
                let response = self.firmware.as_bytes().to_vec();
                self.respond(response);
            }
            other => panic!("unexpected command: {:02x?}", other),
        }
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
        unreachable!("control transfers are not part of this protocol")
    }

    fn control_write(
        &mut self,
        _request_type: u8,
        _request: u8,
        _value: u16,
        _index: u16,
        _data: &[u8],
    ) -> Result<(), DeviceError> {
        unreachable!("control transfers are not part of this protocol")
    }
}

/// Simulated Garmin Aviation Card Programmer with a NavData card.
pub struct GarminSim {
    pub card_id: u32,
    pub firmware: String,
    pub memory: Vec<u8>,
    sector_size: usize,
    read_size: usize,
    cursor: usize,
    mode: GarminMode,
    erase_acks: Vec<Vec<u8>>,
}

#[derive(Debug, PartialEq)]
enum GarminMode {
    Idle,
    Reading,
    Writing,
    Erasing,
}

impl GarminSim {
    pub fn new_navdata_16mb() -> Self {
        // 4 chips of silver AMD flash.
        GarminSim {
            card_id: 0x0004_4101,
            firmware: "Aviation Card Programmer Ver 3.03".to_string(),
            memory: vec![0xFF; 16 * 1024 * 1024],
            sector_size: 0x10000,
            read_size: 0x1000,
            cursor: 0,
            mode: GarminMode::Idle,
            erase_acks: Vec::new(),
        }
    }

    pub fn without_card(mut self) -> Self {
        self.card_id = 0x0069_7641;
        self
    }
}

impl UsbPort for GarminSim {
    fn bulk_read(&mut self, length: usize) -> Result<Vec<u8>, DeviceError> {
        match self.mode {
            GarminMode::Erasing => Ok(self.erase_acks.remove(0)),
            GarminMode::Reading => {
                let take = length.min(self.memory.len() - self.cursor);
                let data = self.memory[self.cursor..self.cursor + take].to_vec();
                self.cursor += take;
                Ok(data)
            }
            _ => panic!("bulk read outside a read or erase phase"),
        }
    }

    fn bulk_write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        assert!(self.mode == GarminMode::Writing, "bulk write outside a write phase");
        for (dst, &src) in self.memory[self.cursor..self.cursor + data.len()]
            .iter_mut()
            .zip(data)
        {
            *dst &= src;
        }
        self.cursor += data.len();
        Ok(())
    }

    fn control_read(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        length: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        assert_eq!(request_type, 0xC0);
        match request {
            0x82 => Ok(self.card_id.to_le_bytes().to_vec()),
            0x8A => {
                let mut buf = self.firmware.as_bytes().to_vec();
                buf.resize(length.min(512), 0);
                Ok(buf)
            }
            other => panic!("unexpected control read: {:02x}", other),
        }
    }

    fn control_write(
        &mut self,
        request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        assert_eq!(request_type, 0x40);
        match request {
            0x81 => {
                assert_eq!(self.mode, GarminMode::Idle);
                let start = u16::from_be_bytes([data[2], data[3]]) as usize;
                self.cursor = start * self.sector_size;
                self.mode = GarminMode::Reading;
            }
            0x83 => self.mode = GarminMode::Idle,
            0x85 => {
                assert_eq!(self.mode, GarminMode::Idle);
                let start = u16::from_be_bytes([data[2], data[3]]) as usize;
                let count = u16::from_be_bytes([data[8], data[9]]) as usize;
                for sector in start..start + count {
                    let begin = sector * self.sector_size;
                    self.memory[begin..begin + self.sector_size].fill(0xFF);
                }
                self.erase_acks = (0..count as u16)
                    .map(|idx| {
                        let mut ack = vec![0x42, 0x6C, 0x4B, 0x65, 0, 0, 0, 0, 0, 0];
                        ack.extend_from_slice(&idx.to_be_bytes());
                        ack
                    })
                    .collect();
                self.mode = GarminMode::Erasing;
            }
            0x86 => {
                assert_eq!(self.mode, GarminMode::Idle);
                let start = u16::from_be_bytes([data[2], data[3]]) as usize;
                self.cursor = start * self.sector_size;
                self.mode = GarminMode::Writing;
            }
            0x87 => self.mode = GarminMode::Idle,
            other => panic!("unexpected control write: {:02x}", other),
        }
        Ok(())
    }
}

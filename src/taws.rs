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

    src/taws.rs

    Physical block layout of TAWS data cards. A physical image is a stream of
    (data block, footer) records grouped into 0x10800-byte sectors, with a
    bad-block table in the second block and per-block footer checksums. This
    module converts between the physical layout and the flat logical image
    the card content is distributed as.
*/

use std::io::{Read, Seek, SeekFrom, Write};

use thiserror::Error;

use crate::checksum::{crc16_mcrf4xx, datablock_checksum_2048, datablock_checksum_512};

pub const SECTOR_SIZE: usize = 0x10800;

/// Byte offset of the card serial number within the first block.
pub const OFFSET_SERIAL: usize = 0x01F6;

const BLOCK_SIZE_SMALL: usize = 0x200;
const FOOTER_SIZE_SMALL: usize = 0x10;
const BLOCK_SIZE_LARGE: usize = 0x800;
const FOOTER_SIZE_LARGE: usize = 0x40;

#[derive(Debug, Error)]
pub enum TawsError {
    #[error("unexpected number of sectors: {0}")]
    UnexpectedSectorCount(u64),
    #[error("bad block {index}: checksum mismatch, expected {expected:08x}, got {got:08x}")]
    BadBlock { index: u32, expected: u32, got: u32 },
    #[error("block {index} failed the crc16 checksum")]
    BadBlockCrc16 { index: u32 },
    #[error("unexpected block index: {got:08x}, expected {expected:08x}")]
    UnexpectedIndex { expected: u32, got: u32 },
    #[error("malformed bad-block table: {0}")]
    MalformedBadBlockTable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Geometry of a physical card image, derived from the sector count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub footer_size: usize,
}

impl Geometry {
    /// Derive the block and footer sizes from the number of physical sectors.
    pub fn from_sector_count(sector_count: u64) -> Result<Self, TawsError> {
        match sector_count {
            0x1000 => Ok(Geometry {
                block_size: BLOCK_SIZE_LARGE,
                footer_size: FOOTER_SIZE_LARGE,
            }),
            0x7C1 => Ok(Geometry {
                block_size: BLOCK_SIZE_SMALL,
                footer_size: FOOTER_SIZE_SMALL,
            }),
            other => Err(TawsError::UnexpectedSectorCount(other)),
        }
    }

    pub fn blocks_per_sector(&self) -> usize {
        SECTOR_SIZE / (self.block_size + self.footer_size)
    }
}

/// Parse the bad-block table held in the second block of the image.
/// Large-page block ids mark two sectors each; small-page ids are multiples
/// of four marking one sector.
pub fn parse_bad_sectors(xblk: &[u8], geometry: Geometry) -> Result<Vec<u32>, TawsError> {
    if xblk.len() < 8 {
        return Err(TawsError::MalformedBadBlockTable("table block is too short".into()));
    }
    let count = u16::from_le_bytes([xblk[6], xblk[7]]) as usize;
    if xblk.len() < 8 + count * 2 {
        return Err(TawsError::MalformedBadBlockTable(format!(
            "table declares {} entries but the block is too short",
            count
        )));
    }

    let mut bad_sectors = Vec::new();
    for i in 0..count {
        let blk_id = u16::from_le_bytes([xblk[8 + i * 2], xblk[9 + i * 2]]) as u32;
        if geometry.block_size == BLOCK_SIZE_LARGE {
            bad_sectors.push(blk_id * 2);
            bad_sectors.push(blk_id * 2 + 1);
        } else {
            if blk_id % 4 != 0 {
                return Err(TawsError::MalformedBadBlockTable(format!(
                    "unaligned bad block id {}",
                    blk_id
                )));
            }
            bad_sectors.push(blk_id / 4);
        }
    }
    Ok(bad_sectors)
}

/// Map a logical sector to its physical sector, skipping bad sectors.
/// `bad_sectors` must be sorted ascending.
pub fn translate_sector(bad_sectors: &[u32], sector: u32) -> u32 {
    let mut sector = sector;
    for &bad in bad_sectors {
        if bad > sector {
            break;
        }
        sector += 1;
    }
    sector
}

pub fn parse_serial(header: &[u8]) -> u32 {
    u32::from_le_bytes(header[OFFSET_SERIAL..OFFSET_SERIAL + 4].try_into().unwrap())
}

pub fn write_serial(header: &mut [u8], serial: u32) {
    header[OFFSET_SERIAL..OFFSET_SERIAL + 4].copy_from_slice(&serial.to_le_bytes());
}

/// Build the footer for one data block: little-endian block index, zero
/// padding, then the page checksums. Small pages embed an mcrf4xx CRC16 over
/// (data, footer prefix) ahead of the 16-bit data block checksum; large pages
/// carry a 32-bit data block checksum only.
pub fn create_footer(data: &[u8], index: u32, geometry: Geometry) -> Vec<u8> {
    let mut footer = index.to_le_bytes().to_vec();

    if geometry.footer_size == FOOTER_SIZE_SMALL {
        footer.resize(geometry.footer_size - 4, 0);
        let mut stream = data.to_vec();
        stream.extend_from_slice(&footer);
        let crc16 = crc16_mcrf4xx(&stream, 0xFFFF);
        footer.extend_from_slice(&crc16.to_le_bytes());
        let block_crc = datablock_checksum_512(data, &footer);
        footer.extend_from_slice(&block_crc.to_le_bytes());
    } else {
        footer.resize(geometry.footer_size - 4, 0);
        let block_crc = datablock_checksum_2048(data, &footer);
        footer.extend_from_slice(&block_crc.to_le_bytes());
    }

    debug_assert_eq!(footer.len(), geometry.footer_size);
    footer
}

/// Verify the checksums of one (data block, footer) record.
pub fn verify_block(data: &[u8], footer: &[u8], index: u32) -> Result<(), TawsError> {
    if data.len() == BLOCK_SIZE_LARGE {
        let expected = u32::from_le_bytes(footer[footer.len() - 4..].try_into().unwrap());
        let got = datablock_checksum_2048(data, &footer[..footer.len() - 4]);
        if got != expected {
            return Err(TawsError::BadBlock { index, expected, got });
        }
    } else {
        let expected = u16::from_le_bytes(footer[footer.len() - 2..].try_into().unwrap()) as u32;
        let got = datablock_checksum_512(data, &footer[..footer.len() - 2]) as u32;
        if got != expected {
            return Err(TawsError::BadBlock { index, expected, got });
        }
        let mut stream = data.to_vec();
        stream.extend_from_slice(&footer[..footer.len() - 2]);
        if crc16_mcrf4xx(&stream, 0xFFFF) != 0 {
            return Err(TawsError::BadBlockCrc16 { index });
        }
    }
    Ok(())
}

/// Extract the flat logical image from a physical card image, walking the
/// good sectors in logical order and checking the recorded block indexes.
pub fn extract_logical<R, W>(
    physical: &mut R,
    physical_len: u64,
    out: &mut W,
    progress: crate::ProgressFn,
) -> Result<(), TawsError>
where
    R: Read + Seek,
    W: Write,
{
    let sector_count = physical_len / SECTOR_SIZE as u64;
    let geometry = Geometry::from_sector_count(sector_count)?;
    let blocks_per_sector = geometry.blocks_per_sector();

    physical.seek(SeekFrom::Start((geometry.block_size + geometry.footer_size) as u64))?;
    let mut xblk = vec![0u8; geometry.block_size];
    physical.read_exact(&mut xblk)?;
    let bad_sectors = parse_bad_sectors(&xblk, geometry)?;
    log::debug!("bad sectors: {:?}", bad_sectors);

    let good_sector_count = sector_count as u32 - bad_sectors.len() as u32;
    let mut data = vec![0u8; geometry.block_size];
    let mut footer = vec![0u8; geometry.footer_size];

    for logical_sector in 0..good_sector_count {
        let physical_sector = translate_sector(&bad_sectors, logical_sector);
        physical.seek(SeekFrom::Start(physical_sector as u64 * SECTOR_SIZE as u64))?;

        for block_idx in 0..blocks_per_sector {
            let current = physical_sector * blocks_per_sector as u32 + block_idx as u32;
            physical.read_exact(&mut data)?;
            physical.read_exact(&mut footer)?;
            out.write_all(&data)?;
            progress(data.len() as u64);

            let index = u32::from_le_bytes(footer[0..4].try_into().unwrap());
            if index == 0xFFFF_FFFF {
                // Blank block; nothing to check.
                continue;
            }
            if index & 0x00FF_FFFF != current {
                return Err(TawsError::UnexpectedIndex {
                    expected: current,
                    got: index,
                });
            }
        }
    }
    Ok(())
}

/// Rewrite a physical card image in place from a flat logical image,
/// preserving the card's bad-block table and regenerating every footer.
pub fn build_physical<R, RW>(
    logical: &mut R,
    physical: &mut RW,
    physical_len: u64,
    progress: crate::ProgressFn,
) -> Result<(), TawsError>
where
    R: Read,
    RW: Read + Write + Seek,
{
    let sector_count = physical_len / SECTOR_SIZE as u64;
    let geometry = Geometry::from_sector_count(sector_count)?;
    let blocks_per_sector = geometry.blocks_per_sector();

    // The first block carries the header (with the serial number); write it
    // before consulting the bad-block table, which always lives in the
    // second physical block.
    let mut header = vec![0u8; geometry.block_size];
    read_padded(logical, &mut header)?;
    physical.seek(SeekFrom::Start(0))?;
    physical.write_all(&header)?;
    physical.write_all(&create_footer(&header, 0, geometry))?;
    progress(header.len() as u64);

    physical.seek(SeekFrom::Start((geometry.block_size + geometry.footer_size) as u64))?;
    let mut xblk = vec![0u8; geometry.block_size];
    physical.read_exact(&mut xblk)?;
    let bad_sectors = parse_bad_sectors(&xblk, geometry)?;
    log::debug!("bad sectors: {:?}", bad_sectors);

    let good_sector_count = sector_count as u32 - bad_sectors.len() as u32;

    // The rest of the first logical sector was already consumed from the
    // header block's sector; skip over it in the input.
    let mut skip = vec![0u8; geometry.block_size];
    for _ in 1..blocks_per_sector {
        read_padded(logical, &mut skip)?;
    }

    let mut data = vec![0u8; geometry.block_size];
    for logical_sector in 1..good_sector_count {
        let physical_sector = translate_sector(&bad_sectors, logical_sector);
        physical.seek(SeekFrom::Start(physical_sector as u64 * SECTOR_SIZE as u64))?;

        for block_idx in 0..blocks_per_sector {
            let current = physical_sector * blocks_per_sector as u32 + block_idx as u32;
            read_padded(logical, &mut data)?;
            physical.write_all(&data)?;
            physical.write_all(&create_footer(&data, current, geometry))?;
            progress(data.len() as u64);
        }
    }
    Ok(())
}

/// Fill `buf` from the reader, padding a short tail with 0xFF.
fn read_padded<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf[filled..].fill(0xFF);
    Ok(())
}

/// Read the serial number of a physical image.
pub fn read_image_serial<R: Read>(physical: &mut R) -> Result<u32, TawsError> {
    let mut header = vec![0u8; OFFSET_SERIAL + 4];
    physical.read_exact(&mut header)?;
    Ok(parse_serial(&header))
}

/// Overwrite the serial number of a physical image, regenerating the header
/// block footer.
pub fn set_image_serial<RW>(physical: &mut RW, physical_len: u64, serial: u32) -> Result<(), TawsError>
where
    RW: Read + Write + Seek,
{
    let sector_count = physical_len / SECTOR_SIZE as u64;
    let geometry = Geometry::from_sector_count(sector_count)?;

    physical.seek(SeekFrom::Start(0))?;
    let mut header = vec![0u8; geometry.block_size];
    physical.read_exact(&mut header)?;
    write_serial(&mut header, serial);

    physical.seek(SeekFrom::Start(0))?;
    physical.write_all(&header)?;
    physical.write_all(&create_footer(&header, 0, geometry))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let small = Geometry::from_sector_count(0x7C1).unwrap();
        assert_eq!((small.block_size, small.footer_size), (0x200, 0x10));
        assert_eq!(small.blocks_per_sector(), 0x80);

        let large = Geometry::from_sector_count(0x1000).unwrap();
        assert_eq!((large.block_size, large.footer_size), (0x800, 0x40));
        assert_eq!(large.blocks_per_sector(), 0x20);

        assert!(Geometry::from_sector_count(100).is_err());
    }

    #[test]
    fn test_parse_bad_sectors() {
        let small = Geometry::from_sector_count(0x7C1).unwrap();
        let mut xblk = vec![0u8; 0x200];
        xblk[6..8].copy_from_slice(&2u16.to_le_bytes());
        xblk[8..10].copy_from_slice(&8u16.to_le_bytes());
        xblk[10..12].copy_from_slice(&100u16.to_le_bytes());
        assert_eq!(parse_bad_sectors(&xblk, small).unwrap(), vec![2, 25]);

        let large = Geometry::from_sector_count(0x1000).unwrap();
        let mut xblk = vec![0u8; 0x800];
        xblk[6..8].copy_from_slice(&1u16.to_le_bytes());
        xblk[8..10].copy_from_slice(&5u16.to_le_bytes());
        assert_eq!(parse_bad_sectors(&xblk, large).unwrap(), vec![10, 11]);
    }

    #[test]
    fn test_translate_sector_monotonic_and_unique() {
        let bad = vec![3, 4, 10];
        let total = 32u32;
        let mut seen = Vec::new();
        let mut last = None;
        for logical in 0..total - bad.len() as u32 {
            let physical = translate_sector(&bad, logical);
            assert!(physical < total);
            assert!(!bad.contains(&physical));
            if let Some(prev) = last {
                assert!(physical > prev);
            }
            last = Some(physical);
            seen.push(physical);
        }
        seen.dedup();
        assert_eq!(seen.len(), (total - bad.len() as u32) as usize);
    }

    #[test]
    fn test_footer_verifies() {
        let small = Geometry::from_sector_count(0x7C1).unwrap();
        let data: Vec<u8> = (0..0x200u32).map(|i| (i % 253) as u8).collect();
        let footer = create_footer(&data, 17, small);
        assert_eq!(footer.len(), 0x10);
        verify_block(&data, &footer, 17).unwrap();

        let large = Geometry::from_sector_count(0x1000).unwrap();
        let data: Vec<u8> = (0..0x800u32).map(|i| (i % 249) as u8).collect();
        let footer = create_footer(&data, 33, large);
        assert_eq!(footer.len(), 0x40);
        verify_block(&data, &footer, 33).unwrap();
    }

    #[test]
    fn test_footer_detects_corruption() {
        let small = Geometry::from_sector_count(0x7C1).unwrap();
        let mut data: Vec<u8> = (0..0x200u32).map(|i| (i % 253) as u8).collect();
        let footer = create_footer(&data, 3, small);
        data[100] ^= 0xFF;
        assert!(verify_block(&data, &footer, 3).is_err());
    }

    #[test]
    fn test_serial_round_trip() {
        let mut header = vec![0u8; 0x200];
        write_serial(&mut header, 0xDEAD_BEEF);
        assert_eq!(parse_serial(&header), 0xDEAD_BEEF);
    }
}

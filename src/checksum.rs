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

    src/checksum.rs

    The checksum engines used by the vendor file formats: CRC32Q for chart
    databases and the catalog integrity check, the Avidyne archive checksum,
    the Garmin feature-unlock checksum, and the TAWS data block checksums.
*/

use std::sync::OnceLock;

/// Polynomial for CRC32Q (chart databases, crcfiles.txt, download integrity).
pub const CRC32Q_POLY: u32 = 0x814141AB;

/// Polynomial for the Avidyne self-extracting archive checksum.
pub const SFX_POLY: u32 = 0x04C11DB7;

/// The feature-unlock lookup table is built from two generated tables.
pub const FEAT_UNLK_POLY_OUTER: u32 = 0x076DC419;
pub const FEAT_UNLK_POLY_INNER: u32 = 0x77073096;

/// Seed for the feature-unlock checksum over a fresh stream.
pub const FEAT_UNLK_SEED: u32 = 0xFFFF_FFFF;

/// Generate an MSB-first, unreflected lookup table of `n` entries.
fn generate_table(n: usize, poly: u32) -> Vec<u32> {
    let mut table = Vec::with_capacity(n);
    for i in 0..n {
        let mut value = (i as u32) << 24;
        for _ in 0..8 {
            let carry = value & 0x8000_0000 != 0;
            value <<= 1;
            if carry {
                value ^= poly;
            }
        }
        table.push(value);
    }
    table
}

fn crc32q_table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| generate_table(256, CRC32Q_POLY).try_into().unwrap())
}

fn sfx_table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| generate_table(256, SFX_POLY).try_into().unwrap())
}

fn feat_unlk_table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        // 64 outer entries crossed with 4 inner entries give the 256 final
        // entries; the split reproduces the table hard-coded in GrmNavdata.dll.
        let outer = generate_table(64, FEAT_UNLK_POLY_OUTER);
        let inner = generate_table(4, FEAT_UNLK_POLY_INNER);
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = outer[i >> 2] ^ inner[i & 3];
        }
        table
    })
}

/// CRC32Q over `data`, continuing from `value` (0 for a fresh stream).
///
/// Appending the final CRC in big-endian order makes the checksum of the
/// whole stream zero.
pub fn crc32q(data: &[u8], value: u32) -> u32 {
    let table = crc32q_table();
    let mut value = value;
    for &b in data {
        value = table[(b ^ (value >> 24) as u8) as usize] ^ ((value & 0x00FF_FFFF) << 8);
    }
    value
}

/// The Avidyne archive checksum over `data`, continuing from `value`.
pub fn sfx_checksum(data: &[u8], value: u32) -> u32 {
    let table = sfx_table();
    let mut value = value;
    for &b in data {
        let x = (value & 0x00FF_FFFF) << 8;
        value = b as u32 ^ x ^ table[(value >> 24) as usize];
    }
    value
}

/// The Garmin feature-unlock checksum over `data`, continuing from `value`
/// ([`FEAT_UNLK_SEED`] for a fresh stream).
///
/// Appending the final CRC in little-endian order makes the checksum of the
/// whole stream zero.
pub fn feat_unlk_checksum(data: &[u8], value: u32) -> u32 {
    let table = feat_unlk_table();
    let mut value = value;
    for &b in data {
        value = table[(b ^ value as u8) as usize] ^ (value >> 8);
    }
    value
}

/// Nibble lookup table shared by the TAWS data block checksums.
#[rustfmt::skip]
const DATABLOCK_TABLE: [u8; 256] = [
    0x0, 0x1, 0x3, 0x2, 0x5, 0x4, 0x6, 0x7, 0x7, 0x6, 0x4, 0x5, 0x2, 0x3, 0x1, 0x0,
    0x9, 0x8, 0xA, 0xB, 0xC, 0xD, 0xF, 0xE, 0xE, 0xF, 0xD, 0xC, 0xB, 0xA, 0x8, 0x9,
    0xB, 0xA, 0x8, 0x9, 0xE, 0xF, 0xD, 0xC, 0xC, 0xD, 0xF, 0xE, 0x9, 0x8, 0xA, 0xB,
    0x2, 0x3, 0x1, 0x0, 0x7, 0x6, 0x4, 0x5, 0x5, 0x4, 0x6, 0x7, 0x0, 0x1, 0x3, 0x2,
    0xD, 0xC, 0xE, 0xF, 0x8, 0x9, 0xB, 0xA, 0xA, 0xB, 0x9, 0x8, 0xF, 0xE, 0xC, 0xD,
    0x4, 0x5, 0x7, 0x6, 0x1, 0x0, 0x2, 0x3, 0x3, 0x2, 0x0, 0x1, 0x6, 0x7, 0x5, 0x4,
    0x6, 0x7, 0x5, 0x4, 0x3, 0x2, 0x0, 0x1, 0x1, 0x0, 0x2, 0x3, 0x4, 0x5, 0x7, 0x6,
    0xF, 0xE, 0xC, 0xD, 0xA, 0xB, 0x9, 0x8, 0x8, 0x9, 0xB, 0xA, 0xD, 0xC, 0xE, 0xF,
    0xF, 0xE, 0xC, 0xD, 0xA, 0xB, 0x9, 0x8, 0x8, 0x9, 0xB, 0xA, 0xD, 0xC, 0xE, 0xF,
    0x6, 0x7, 0x5, 0x4, 0x3, 0x2, 0x0, 0x1, 0x1, 0x0, 0x2, 0x3, 0x4, 0x5, 0x7, 0x6,
    0x4, 0x5, 0x7, 0x6, 0x1, 0x0, 0x2, 0x3, 0x3, 0x2, 0x0, 0x1, 0x6, 0x7, 0x5, 0x4,
    0xD, 0xC, 0xE, 0xF, 0x8, 0x9, 0xB, 0xA, 0xA, 0xB, 0x9, 0x8, 0xF, 0xE, 0xC, 0xD,
    0x2, 0x3, 0x1, 0x0, 0x7, 0x6, 0x4, 0x5, 0x5, 0x4, 0x6, 0x7, 0x0, 0x1, 0x3, 0x2,
    0xB, 0xA, 0x8, 0x9, 0xE, 0xF, 0xD, 0xC, 0xC, 0xD, 0xF, 0xE, 0x9, 0x8, 0xA, 0xB,
    0x9, 0x8, 0xA, 0xB, 0xC, 0xD, 0xF, 0xE, 0xE, 0xF, 0xD, 0xC, 0xB, 0xA, 0x8, 0x9,
    0x0, 0x1, 0x3, 0x2, 0x5, 0x4, 0x6, 0x7, 0x7, 0x6, 0x4, 0x5, 0x2, 0x3, 0x1, 0x0,
];

/// 16-bit data block checksum for cards with 512-byte pages.
///
/// The footer passed here excludes its final two CRC bytes.
pub fn datablock_checksum_512(datablock: &[u8], footer: &[u8]) -> u16 {
    let table = &DATABLOCK_TABLE;
    let mut value: u64 = 0;
    let mut index: u64 = 0x600;
    for &d in footer {
        let t = table[d as usize] as u64;
        value ^= t << 0x1C;
        if t & 1 != 0 {
            value ^= index;
        }
        index += 1;
    }
    index = 0xC00;
    for &d in datablock {
        let t = table[d as usize] as u64;
        value ^= t << 0x1C;
        if t & 1 != 0 {
            value ^= index;
        }
        index += 1;
    }
    index = value << 4;
    value = index | value >> 0x1C;

    index = ((index >> 8 << 24) | table[((index >> 8 ^ value) >> 1 & 0xFF) as usize] as u64) & 0xFFFF_FF01;
    ((index | (index ^ value)) & 0xFFFF) as u16
}

/// 32-bit data block checksum for cards with 2048-byte pages.
///
/// The footer passed here excludes its final four CRC bytes.
pub fn datablock_checksum_2048(datablock: &[u8], footer: &[u8]) -> u32 {
    let table = &DATABLOCK_TABLE;
    let mut crc: u64 = 0;
    let mut index: u64 = 0x600_0000;
    for &d in footer {
        let t = table[d as usize] as u64;
        crc ^= t;
        if t & 1 != 0 {
            crc ^= index << 4;
        }
        index += 1;
    }
    index = 0xC00_0000;
    for &d in datablock {
        let t = table[d as usize] as u64;
        crc ^= t;
        if t & 1 != 0 {
            crc ^= index << 4;
        }
        index += 1;
    }
    index = crc >> 0x10 ^ crc;
    ((table[((index >> 9 ^ index >> 1) & 0xFF) as usize] as u64 & 1 ^ crc) & 0xFFFF_FFFF) as u32
}

/// CRC-16/MCRF4XX over `data`, continuing from `value` (0xFFFF for a fresh
/// stream). Used to finalize small-page TAWS footers to zero.
pub fn crc16_mcrf4xx(data: &[u8], value: u16) -> u16 {
    let mut crc = value;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

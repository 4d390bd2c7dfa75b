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

    src/featunlk.rs

    The G1000 feature entitlement file. feat_unlk.dat holds one 913-byte
    slot per feature at a fixed offset, binding the card volume id and the
    avionics system id to the database file's checksum. Every slot region is
    self-checksummed so that the whole region hashes to zero.
*/

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use strum::{EnumIter, IntoEnumIterator};
use thiserror::Error;

use crate::checksum::{feat_unlk_checksum, FEAT_UNLK_SEED};

pub const FEAT_UNLK: &str = "feat_unlk.dat";

const CONTENT1_LEN: usize = 0x55; // 85
const CONTENT2_LEN: usize = 0x338; // 824

/// Slot stride: content1 + content2 + the overall CRC.
pub const SLOT_LEN: usize = CONTENT1_LEN + CONTENT2_LEN + 4;

const SEC_ID_OFFSET: u16 = 191;

const MAGIC1: u16 = 0x1;
// Hard-coded in GrmNavdata.dll
const MAGIC2: u32 = 0x7648_329A;
const MAGIC3: u16 = 0x6501;

const PREVIEW_START: usize = 129;
const PREVIEW_END: usize = 146;
pub const PREVIEW_LEN: usize = PREVIEW_END - PREVIEW_START;

const CHUNK_SIZE: usize = 0x8000;

#[derive(Debug, Error)]
pub enum FeatUnlkError {
    #[error("unsupported filename: {0}")]
    UnsupportedFilename(String),
    #[error("{0} failed the checksum")]
    FileChecksum(String),
    #[error("feature slot failed the checksum")]
    SlotChecksum,
    #[error("feature slot is empty")]
    EmptySlot,
    #[error("unexpected magic number: {0:#x}")]
    BadMagic(u32),
    #[error("feature slot does not match the file: {0}")]
    Mismatch(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The twenty feature slots, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Feature {
    Navigation,
    ConfigEnable,
    Terrain,
    Obstacle,
    AptTerrain,
    ChartView,
    SafeTaxi,
    FliteCharts,
    Basemap,
    AirportDir,
    AirSport,
    Navigation2,
    Sectionals,
    Obstacle2,
    NavDb2,
    NavDb2Stby,
    SystemCopy,
    ConfigEnableNoSerno,
    SafeTaxi2,
    Basemap2,
}

impl Feature {
    /// Byte offset of this feature's slot within feat_unlk.dat.
    pub fn offset(self) -> u64 {
        match self {
            Feature::Navigation => 0,
            Feature::ConfigEnable => 913,
            Feature::Terrain => 1826,
            Feature::Obstacle => 2739,
            Feature::AptTerrain => 3652,
            Feature::ChartView => 4565,
            Feature::SafeTaxi => 5478,
            Feature::FliteCharts => 6391,
            Feature::Basemap => 7304,
            Feature::AirportDir => 8217,
            Feature::AirSport => 9130,
            Feature::Navigation2 => 10043,
            Feature::Sectionals => 10956,
            Feature::Obstacle2 => 11869,
            Feature::NavDb2 => 12782,
            Feature::NavDb2Stby => 13695,
            Feature::SystemCopy => 14608,
            Feature::ConfigEnableNoSerno => 15521,
            Feature::SafeTaxi2 => 16434,
            Feature::Basemap2 => 17347,
        }
    }

    /// Bit position within the slot's feature mask.
    pub fn bit(self) -> u32 {
        match self {
            Feature::Navigation => 0,
            Feature::ConfigEnable | Feature::ConfigEnableNoSerno => 2,
            Feature::Terrain => 3,
            Feature::Obstacle => 4,
            Feature::AptTerrain => 5,
            Feature::ChartView => 6,
            Feature::SafeTaxi => 7,
            Feature::FliteCharts => 8,
            Feature::SystemCopy => 11,
            _ => 10,
        }
    }

    /// Filenames that unlock through this feature. The same database goes by
    /// different names across unit generations and card layouts.
    pub fn filenames(self) -> &'static [&'static str] {
        match self {
            Feature::Navigation => &["ldr_sys/avtn_db.bin", "avtn_db.bin", ".System/AVTN/avtn_db.bin"],
            Feature::ConfigEnable => &[],
            Feature::Terrain => &["terrain_9as.tdb", "trn.dat", ".System/AVTN/terrain.tdb"],
            Feature::Obstacle => &["terrain.odb", ".System/AVTN/obstacle.odb"],
            Feature::AptTerrain => &["terrain.adb"],
            Feature::ChartView => &["Charts/crcfiles.txt", "crcfiles.txt"],
            Feature::SafeTaxi => &["safetaxi.bin", ".System/AVTN/safetaxi.img"],
            Feature::FliteCharts => &["fc_tpc/fc_tpc.dat", "fc_tpc.dat", ".System/AVTN/FliteCharts/fc_tpc.dat"],
            Feature::Basemap => &["bmap.bin"],
            Feature::AirportDir => &["apt_dir.gca", "fbo.gpi"],
            Feature::AirSport => &["air_sport.gpi", "Poi/air_sport.gpi"],
            Feature::Navigation2 => &[],
            Feature::Sectionals => &["rasters/rasters.xml", "rasters.xml"],
            Feature::Obstacle2 => &["standard.odb"],
            Feature::NavDb2 => &["ldr_sys/nav_db2.bin", "nav_db2.bin"],
            Feature::NavDb2Stby => &[],
            Feature::SystemCopy => &[],
            Feature::ConfigEnableNoSerno => &[],
            Feature::SafeTaxi2 => &["safetaxi2.gca"],
            Feature::Basemap2 => &["bmap2.bin"],
        }
    }

    /// Look up the feature unlocking `filename` (full path first, then the
    /// bare name).
    pub fn for_filename(filename: &str) -> Option<Feature> {
        let bare = filename.rsplit('/').next().unwrap_or(filename);
        Feature::iter().find(|f| {
            f.filenames()
                .iter()
                .any(|name| *name == filename || *name == bare)
        })
    }
}

pub fn encode_volume_id(vol_id: u32) -> u32 {
    !(vol_id << 31 | vol_id >> 1)
}

pub fn decode_volume_id(encoded: u32) -> u32 {
    !(encoded << 1 | encoded >> 31)
}

/// Fold a 64-bit system id into the 32-bit value stored in the slot.
pub fn truncate_system_id(system_id: u64) -> u32 {
    ((system_id & 0xFFFF_FFFF) as u32).wrapping_add((system_id >> 32) as u32)
}

/// Copy a database stream into `dest_dir/filename`, checking its embedded
/// checksum on the way through, then record its entitlement slot.
pub fn copy_with_feat_unlk(
    dest_dir: &Path,
    src: &mut dyn Read,
    filename: &str,
    vol_id: u32,
    security_id: u16,
    system_id: u64,
    progress: crate::ProgressFn,
) -> Result<(), FeatUnlkError> {
    let feature = Feature::for_filename(filename)
        .ok_or_else(|| FeatUnlkError::UnsupportedFilename(filename.to_string()))?;

    let dest_path = dest_dir.join(filename);
    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut dest = std::fs::File::create(&dest_path)?;

    let mut chk = FEAT_UNLK_SEED;
    let mut preview = None;
    let mut last_tail = [0u8; 4];
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut first = true;

    loop {
        let n = read_chunk(src, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];

        if first {
            first = false;
            if feature == Feature::Navigation && n >= PREVIEW_END {
                let mut p = [0u8; PREVIEW_LEN];
                p.copy_from_slice(&block[PREVIEW_START..PREVIEW_END]);
                preview = Some(p);
            }
        }

        dest.write_all(block)?;
        chk = feat_unlk_checksum(block, chk);
        save_tail(&mut last_tail, block);
        progress(n as u64);
    }

    // The file ends with its own little-endian checksum, which brings the
    // running value to zero.
    if chk != 0 {
        return Err(FeatUnlkError::FileChecksum(filename.to_string()));
    }
    let checksum = u32::from_le_bytes(last_tail);

    update_feat_unlk(dest_dir, feature, vol_id, security_id, system_id, checksum, preview)
}

fn read_chunk(src: &mut dyn Read, buf: &mut [u8]) -> Result<usize, std::io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn save_tail(tail: &mut [u8; 4], block: &[u8]) {
    if block.len() >= 4 {
        tail.copy_from_slice(&block[block.len() - 4..]);
    } else {
        let keep = 4 - block.len();
        tail.copy_within(4 - keep.., 0);
        tail[keep..].copy_from_slice(block);
    }
}

/// Compose and write the feature's slot. The file is created on first use
/// and grows to cover the slot being written.
pub fn update_feat_unlk(
    dest_dir: &Path,
    feature: Feature,
    vol_id: u32,
    security_id: u16,
    system_id: u64,
    checksum: u32,
    preview: Option<[u8; PREVIEW_LEN]>,
) -> Result<(), FeatUnlkError> {
    let mut content1 = Vec::with_capacity(CONTENT1_LEN);
    content1.extend_from_slice(&MAGIC1.to_le_bytes());
    content1.extend_from_slice(&security_id.wrapping_sub(SEC_ID_OFFSET).to_le_bytes());
    content1.extend_from_slice(&MAGIC2.to_le_bytes());
    content1.extend_from_slice(&(1u32 << feature.bit()).to_le_bytes());
    content1.extend_from_slice(&0u32.to_le_bytes());
    content1.extend_from_slice(&encode_volume_id(vol_id).to_le_bytes());

    if feature == Feature::Navigation {
        content1.extend_from_slice(&MAGIC3.to_le_bytes());
    }

    content1.extend_from_slice(&checksum.to_le_bytes());

    match preview {
        Some(preview) if feature == Feature::Navigation => {
            content1.extend_from_slice(&preview);
        }
        _ => content1.extend_from_slice(&[0u8; PREVIEW_LEN]),
    }

    content1.resize(CONTENT1_LEN - 4, 0);
    let chk1 = feat_unlk_checksum(&content1, FEAT_UNLK_SEED);
    content1.extend_from_slice(&chk1.to_le_bytes());
    debug_assert_eq!(content1.len(), CONTENT1_LEN);

    let mut content2 = Vec::with_capacity(CONTENT2_LEN);
    content2.extend_from_slice(&0u32.to_le_bytes());
    content2.extend_from_slice(&truncate_system_id(system_id).to_le_bytes());
    content2.resize(CONTENT2_LEN - 4, 0);
    let chk2 = feat_unlk_checksum(&content2, FEAT_UNLK_SEED);
    content2.extend_from_slice(&chk2.to_le_bytes());
    debug_assert_eq!(content2.len(), CONTENT2_LEN);

    let mut both = content1.clone();
    both.extend_from_slice(&content2);
    let chk3 = feat_unlk_checksum(&both, FEAT_UNLK_SEED);

    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dest_dir.join(FEAT_UNLK))?;
    out.seek(SeekFrom::Start(feature.offset()))?;
    out.write_all(&content1)?;
    out.write_all(&content2)?;
    out.write_all(&chk3.to_le_bytes())?;
    Ok(())
}

/// What a populated slot says about its database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub security_id: u16,
    pub volume_id: u32,
    pub file_crc: u32,
    pub truncated_system_id: u32,
    pub unit_count: u16,
    pub preview: [u8; PREVIEW_LEN],
}

/// Read and verify one feature slot: each region must hash to zero, and the
/// trailer must close the checksum over content2.
pub fn read_slot(featunlk: &Path, feature: Feature) -> Result<SlotInfo, FeatUnlkError> {
    let mut fd = std::fs::File::open(featunlk)?;
    fd.seek(SeekFrom::Start(feature.offset()))?;

    let mut content1 = [0u8; CONTENT1_LEN];
    fd.read_exact(&mut content1)?;
    if content1.iter().all(|&b| b == 0) {
        return Err(FeatUnlkError::EmptySlot);
    }
    if feat_unlk_checksum(&content1, FEAT_UNLK_SEED) != 0 {
        return Err(FeatUnlkError::SlotChecksum);
    }

    let mut content2 = [0u8; CONTENT2_LEN];
    fd.read_exact(&mut content2)?;
    if feat_unlk_checksum(&content2, FEAT_UNLK_SEED) != 0 {
        return Err(FeatUnlkError::SlotChecksum);
    }

    let mut overall = [0u8; 4];
    fd.read_exact(&mut overall)?;
    let mut tail = content2.to_vec();
    tail.extend_from_slice(&overall);
    if feat_unlk_checksum(&tail, 0) != 0 {
        return Err(FeatUnlkError::SlotChecksum);
    }

    let magic1 = u16::from_le_bytes([content1[0], content1[1]]);
    if magic1 != MAGIC1 {
        return Err(FeatUnlkError::BadMagic(magic1 as u32));
    }
    let security_id =
        u16::from_le_bytes([content1[2], content1[3]]).wrapping_add(SEC_ID_OFFSET);
    let magic2 = u32::from_le_bytes(content1[4..8].try_into().unwrap());
    if magic2 != MAGIC2 {
        return Err(FeatUnlkError::BadMagic(magic2));
    }
    let mask = u32::from_le_bytes(content1[8..12].try_into().unwrap());
    if mask != 1 << feature.bit() {
        return Err(FeatUnlkError::Mismatch(format!(
            "feature mask {:#x}, expected {:#x}",
            mask,
            1u32 << feature.bit()
        )));
    }

    let volume_id = decode_volume_id(u32::from_le_bytes(content1[16..20].try_into().unwrap()));

    let crc_offset = if feature == Feature::Navigation {
        let magic3 = u16::from_le_bytes([content1[20], content1[21]]);
        if magic3 != MAGIC3 {
            return Err(FeatUnlkError::BadMagic(magic3 as u32));
        }
        22
    } else {
        20
    };
    let file_crc = u32::from_le_bytes(content1[crc_offset..crc_offset + 4].try_into().unwrap());
    let mut preview = [0u8; PREVIEW_LEN];
    preview.copy_from_slice(&content1[crc_offset + 4..crc_offset + 4 + PREVIEW_LEN]);

    let unit_count = u16::from_le_bytes([content2[0], content2[1]]);
    let truncated_system_id = u32::from_le_bytes(content2[4..8].try_into().unwrap());

    Ok(SlotInfo {
        security_id,
        volume_id,
        file_crc,
        truncated_system_id,
        unit_count,
        preview,
    })
}

/// Verify a database file against its slot: recompute the stream checksum
/// and compare the declared CRC (and preview, for the navigation database).
pub fn verify_feat_unlk(featunlk: &Path, file: &Path) -> Result<SlotInfo, FeatUnlkError> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FeatUnlkError::UnsupportedFilename(file.display().to_string()))?;
    let feature = Feature::for_filename(filename)
        .ok_or_else(|| FeatUnlkError::UnsupportedFilename(filename.to_string()))?;

    let slot = read_slot(featunlk, feature)?;

    let mut fd = std::fs::File::open(file)?;
    let mut chk = FEAT_UNLK_SEED;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut last_tail = [0u8; 4];
    let mut first_block = Vec::new();

    loop {
        let n = read_chunk(&mut fd, &mut buf)?;
        if n == 0 {
            break;
        }
        if first_block.is_empty() {
            first_block = buf[..n].to_vec();
        }
        chk = feat_unlk_checksum(&buf[..n], chk);
        save_tail(&mut last_tail, &buf[..n]);
    }

    // crcfiles.txt has no embedded trailer; its slot carries the raw stream
    // checksum instead.
    let file_crc = if feature == Feature::ChartView {
        chk
    } else {
        if chk != 0 {
            return Err(FeatUnlkError::FileChecksum(filename.to_string()));
        }
        u32::from_le_bytes(last_tail)
    };

    if file_crc != slot.file_crc {
        return Err(FeatUnlkError::Mismatch(format!(
            "file checksum {:08x}, slot has {:08x}",
            file_crc, slot.file_crc
        )));
    }

    if feature == Feature::Navigation {
        if first_block.len() < PREVIEW_END || slot.preview != first_block[PREVIEW_START..PREVIEW_END]
        {
            return Err(FeatUnlkError::Mismatch("preview data mismatch".into()));
        }
    }

    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_offsets_are_913_apart() {
        let mut offsets: Vec<u64> = Feature::iter().map(|f| f.offset()).collect();
        offsets.sort_unstable();
        assert_eq!(offsets.len(), 20);
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= SLOT_LEN as u64);
        }
    }

    #[test]
    fn test_filename_lookup() {
        assert_eq!(Feature::for_filename("ldr_sys/avtn_db.bin"), Some(Feature::Navigation));
        assert_eq!(Feature::for_filename("avtn_db.bin"), Some(Feature::Navigation));
        assert_eq!(Feature::for_filename("crcfiles.txt"), Some(Feature::ChartView));
        assert_eq!(Feature::for_filename("Charts/crcfiles.txt"), Some(Feature::ChartView));
        assert_eq!(Feature::for_filename("bmap2.bin"), Some(Feature::Basemap2));
        assert_eq!(Feature::for_filename("nonsense.dat"), None);
    }

    #[test]
    fn test_volume_id_round_trip() {
        for vol_id in [0u32, 1, 0x1234_5678, 0xFFFF_FFFF, 0x8000_0001] {
            assert_eq!(decode_volume_id(encode_volume_id(vol_id)), vol_id);
        }
    }

    #[test]
    fn test_truncate_system_id() {
        assert_eq!(truncate_system_id(0x1_2345_6789), 0x2345_678A);
        assert_eq!(truncate_system_id(0xABCD_EF01), 0xABCD_EF01);
    }

    #[test]
    fn test_save_tail() {
        let mut tail = [0u8; 4];
        save_tail(&mut tail, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(tail, [3, 4, 5, 6]);
        save_tail(&mut tail, &[7]);
        assert_eq!(tail, [4, 5, 6, 7]);
        save_tail(&mut tail, &[8, 9]);
        assert_eq!(tail, [6, 7, 8, 9]);
    }
}

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

    src/transfer.rs

    The transfer orchestrator: picks the codec for a subscription from its
    media type and vendor flags, runs it against the destination, and keeps
    the sidecar manifest current. Data card transfers go through the
    programmer drivers with a blank check, selective erase, chunked write,
    and a full read-back compare.
*/

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::avidyne::{SecurityContext, SfxFile};
use crate::card::{Programmer, UsbPort};
use crate::catalog::{ServiceHandle, CARD_TYPE_DATA_CARD, CARD_TYPE_SD};
use crate::catalog::OemFlags;
use crate::chartview::ChartView;
use crate::checksum::{feat_unlk_checksum, FEAT_UNLK_SEED};
use crate::featunlk::{self, Feature, FEAT_UNLK};
use crate::jdm::{self, JdmFile, OemKind, ServiceSnapshot, JDM_FILE};
use crate::{NavCardError, ProgressFn};

const LDR_SYS: &str = "ldr_sys";
const GRM_FEAT_KEY: &str = "grm_feat_key.zip";

/// Where a transfer lands: a mounted directory or a card programmer.
pub enum TransferTarget<'a, P: UsbPort> {
    Directory(&'a Path),
    Programmer(&'a mut Programmer<P>),
}

#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Volume id of the destination media; required for vendor paths that
    /// bind the media identity into the output.
    pub vol_id: Option<u32>,
    /// Erase the whole card instead of only the non-blank sectors.
    pub full_erase: bool,
}

/// Parse a user-supplied volume id, either as 8 hex digits or in the
/// `1234-ABCD` form volume labels are usually printed in.
pub fn parse_volume_id(s: &str) -> Result<u32, NavCardError> {
    let cleaned: String = s.chars().filter(|c| *c != '-').collect();
    if cleaned.len() != 8 {
        return Err(NavCardError::Unsupported(format!(
            "volume id must be 8 hex digits: {:?}",
            s
        )));
    }
    u32::from_str_radix(&cleaned, 16)
        .map_err(|_| NavCardError::Unsupported(format!("volume id must be 8 hex digits: {:?}", s)))
}

/// Move one subscription onto the target.
///
/// `downloads_dir` holds the already-downloaded payload archives named in
/// the catalog; `sff_dir` holds any sidecar `.sff` files; `keychain` is the
/// downloaded feature keychain archive.
pub fn transfer_service<P: UsbPort>(
    service: &ServiceHandle,
    downloads_dir: &Path,
    sff_dir: Option<&Path>,
    keychain: Option<&Path>,
    target: TransferTarget<'_, P>,
    options: &TransferOptions,
    progress: ProgressFn,
) -> Result<(), NavCardError> {
    let media = service.primary().media();
    let card_type = media
        .first()
        .map(|m| m.card_type())
        .transpose()?
        .unwrap_or(CARD_TYPE_SD);

    match (card_type, target) {
        (CARD_TYPE_SD, TransferTarget::Directory(dest)) => {
            transfer_directory(service, downloads_dir, sff_dir, keychain, dest, options, progress)
        }
        (CARD_TYPE_DATA_CARD, TransferTarget::Programmer(programmer)) => {
            transfer_data_card(service, downloads_dir, programmer, options, progress)
        }
        (CARD_TYPE_SD, TransferTarget::Programmer(_)) => Err(NavCardError::Unsupported(
            "this subscription needs a path to a mounted card, not a programmer".into(),
        )),
        (CARD_TYPE_DATA_CARD, TransferTarget::Directory(_)) => Err(NavCardError::Unsupported(
            "this subscription needs a card programmer, not a directory".into(),
        )),
        (other, _) => Err(NavCardError::Unsupported(format!(
            "unsupported media type: {}",
            other
        ))),
    }
}

fn transfer_directory(
    service: &ServiceHandle,
    downloads_dir: &Path,
    sff_dir: Option<&Path>,
    keychain: Option<&Path>,
    dest: &Path,
    options: &TransferOptions,
    progress: ProgressFn,
) -> Result<(), NavCardError> {
    let flags = service.primary().oem_flags();

    let mut written = if flags.contains(OemFlags::AVIDYNE_E2) {
        transfer_avidyne_sfx(service, downloads_dir, dest, options, progress)?
    } else if flags.contains(OemFlags::AVIDYNE) {
        transfer_raw_archive(service, downloads_dir, dest, progress)?
    } else if flags.contains(OemFlags::GARMIN) && service.is_chartview() {
        transfer_garmin_chartview(service, downloads_dir, dest, options, progress)?
    } else if flags.contains(OemFlags::GARMIN) {
        transfer_garmin_simple(service, downloads_dir, dest, options, progress)?
    } else {
        // No vendor wrapper; the archive content is the card content.
        transfer_raw_archive(service, downloads_dir, dest, progress)?
    };

    // Sidecar .sff files ride along unmodified.
    if let Some(sff_dir) = sff_dir {
        for name in service.primary().sff_filenames()? {
            let source = sff_dir.join(&name);
            if source.exists() {
                std::fs::copy(&source, dest.join(&name))?;
                written.push(name);
            }
        }
    }

    // Entitled media also carries the vendor keychain.
    if flags.contains(OemFlags::GARMIN) && needs_feature_key(service) {
        if let Some(keychain) = keychain {
            let target_dir = dest.join(LDR_SYS);
            std::fs::create_dir_all(&target_dir)?;
            std::fs::copy(keychain, target_dir.join(GRM_FEAT_KEY))?;
            written.push(format!("{}/{}", LDR_SYS, GRM_FEAT_KEY));
        }
    }

    update_sidecar(service, dest, &written, flags)?;
    Ok(())
}

fn needs_feature_key(service: &ServiceHandle) -> bool {
    service
        .primary()
        .media()
        .iter()
        .any(|m| m.filename() == Some(FEAT_UNLK))
}

fn transfer_avidyne_sfx(
    service: &ServiceHandle,
    downloads_dir: &Path,
    dest: &Path,
    options: &TransferOptions,
    progress: ProgressFn,
) -> Result<Vec<String>, NavCardError> {
    let vol_id = options.vol_id.ok_or_else(|| {
        NavCardError::Unsupported("this transfer needs the destination volume id".into())
    })?;

    let filename = service.primary().database_filename()?.to_string();
    let archive_path = downloads_dir.join(&filename);
    let mut archive = ZipArchive::new(File::open(&archive_path)?)?;

    let script_entry = archive
        .file_names()
        .find(|name| name.to_lowercase().ends_with("dsf.txt"))
        .map(str::to_string)
        .ok_or_else(|| NavCardError::Unsupported("archive has no installer script".into()))?;

    let script = {
        let mut entry = archive.by_name(&script_entry)?;
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        text
    };

    let sfx = SfxFile::parse_script(&script).map_err(NavCardError::Sfx)?;

    let security = SecurityContext {
        cycle: service.property("version")?,
        volume_id: vol_id,
        remaining_transfers: service
            .optional_property("remaining_transfers")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1),
    };
    let fleet_ids = service.primary().fleet_ids();

    let out_name = PathBuf::from(&filename)
        .with_extension("dsf")
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database.dsf".to_string());

    let mut out = std::io::BufWriter::new(File::create(dest.join(&out_name))?);
    sfx.emit(&mut out, &mut archive, &security, &fleet_ids, progress)
        .map_err(NavCardError::Sfx)?;
    out.flush()?;

    Ok(vec![out_name])
}

fn transfer_raw_archive(
    service: &ServiceHandle,
    downloads_dir: &Path,
    dest: &Path,
    progress: ProgressFn,
) -> Result<Vec<String>, NavCardError> {
    let mut written = Vec::new();
    for filename in service.database_filenames()? {
        let mut archive = ZipArchive::new(File::open(downloads_dir.join(&filename))?)?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            // Some archives carry Windows separators in entry names.
            let name = entry.name().replace('\\', "/");
            let target = dest.join(&name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            let copied = std::io::copy(&mut entry, &mut out)?;
            progress(copied);
            written.push(name);
        }
    }
    Ok(written)
}

fn transfer_garmin_simple(
    service: &ServiceHandle,
    downloads_dir: &Path,
    dest: &Path,
    options: &TransferOptions,
    progress: ProgressFn,
) -> Result<Vec<String>, NavCardError> {
    let vol_id = options.vol_id.ok_or_else(|| {
        NavCardError::Unsupported("this transfer needs the destination volume id".into())
    })?;
    let security_id = service.primary().garmin_sec_id()?;
    let system_id = service.primary().avionics_id()?;

    let filename = service.primary().database_filename()?.to_string();
    let mut archive = ZipArchive::new(File::open(downloads_dir.join(&filename))?)?;

    let mut written = Vec::new();
    let mut used_feat_unlk = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().replace('\\', "/");

        if Feature::for_filename(&name).is_some() {
            featunlk::copy_with_feat_unlk(
                dest,
                &mut entry,
                &name,
                vol_id,
                security_id,
                system_id,
                progress,
            )?;
            used_feat_unlk = true;
        } else {
            let target = dest.join(&name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            let copied = std::io::copy(&mut entry, &mut out)?;
            progress(copied);
        }
        written.push(name);
    }

    if used_feat_unlk {
        written.push(FEAT_UNLK.to_string());
    }
    Ok(written)
}

fn transfer_garmin_chartview(
    service: &ServiceHandle,
    downloads_dir: &Path,
    dest: &Path,
    options: &TransferOptions,
    progress: ProgressFn,
) -> Result<Vec<String>, NavCardError> {
    let paths: Vec<PathBuf> = service
        .database_filenames()?
        .into_iter()
        .map(|name| downloads_dir.join(name))
        .collect();

    let mut chartview = ChartView::open(&paths)?;
    let mut written = chartview.transfer(dest, progress)?;

    // The chart entitlement slot carries the running checksum of the file
    // listing, since crcfiles.txt has no embedded trailer of its own.
    if needs_feature_key(service) {
        let vol_id = options.vol_id.ok_or_else(|| {
            NavCardError::Unsupported("this transfer needs the destination volume id".into())
        })?;
        let crcfiles = std::fs::read(dest.join("crcfiles.txt"))?;
        let crc = feat_unlk_checksum(&crcfiles, FEAT_UNLK_SEED);
        featunlk::update_feat_unlk(
            dest,
            Feature::ChartView,
            vol_id,
            service.primary().garmin_sec_id()?,
            service.primary().avionics_id()?,
            crc,
            None,
        )?;
        written.push(FEAT_UNLK.to_string());
    }

    Ok(written)
}

fn update_sidecar(
    service: &ServiceHandle,
    dest: &Path,
    written: &[String],
    flags: OemFlags,
) -> Result<(), NavCardError> {
    let kind = if flags.intersects(OemFlags::AVIDYNE | OemFlags::AVIDYNE_E2) {
        OemKind::Avidyne
    } else {
        OemKind::Garmin
    };

    let mut files = Vec::with_capacity(written.len());
    for rel in written {
        files.push(jdm::file_entry(dest, rel, kind)?);
    }

    let snapshot = ServiceSnapshot {
        sid: service.property("unique_service_id")?,
        sc: service.optional_property("service_code").unwrap_or_default(),
        v: service.property("version")?,
        vs: service.optional_property("version_start_date").unwrap_or_default(),
        ve: service.optional_property("version_end_date").unwrap_or_default(),
        f: files,
    };

    let sidecar = dest.join(JDM_FILE);
    let mut jdm = JdmFile::load(&sidecar)?;
    jdm.upsert(snapshot);
    jdm.save(&sidecar)?;
    Ok(())
}

fn transfer_data_card<P: UsbPort>(
    service: &ServiceHandle,
    downloads_dir: &Path,
    programmer: &mut Programmer<P>,
    options: &TransferOptions,
    progress: ProgressFn,
) -> Result<(), NavCardError> {
    programmer.init_data_card()?;
    programmer.check_supports_write()?;

    let card = programmer.card()?.clone();

    // The catalog bounds which cards this database may land on.
    let media = service.primary().media().first().cloned();
    if let Some(media) = media {
        let min = media.card_size_min().unwrap_or(0);
        let max = media.card_size_max().unwrap_or(u64::MAX);
        if card.total_size() < min || card.total_size() > max {
            return Err(NavCardError::CardSizeMismatch {
                card: card.total_size(),
                min,
                max,
            });
        }
    }

    let filename = service.primary().database_filename()?.to_string();
    let path = downloads_dir.join(&filename);

    write_card_image(programmer, &path, options.full_erase, progress)?;

    log::info!("transfer complete");
    Ok(())
}

/// Write an image file onto the card: blank check, erase what needs it,
/// write in the card's chunk size, then read back and compare. A compare
/// failure leaves the card partially written; the flash is re-programmable,
/// so a retry starts from a known erased state.
pub fn write_card_image<P: UsbPort>(
    programmer: &mut Programmer<P>,
    path: &Path,
    full_erase: bool,
    progress: ProgressFn,
) -> Result<(), NavCardError> {
    let card = programmer.card()?.clone();
    let sector_size = card.card_type.sector_size() as u64;
    let length = std::fs::metadata(path)?.len();
    if length > card.total_size() {
        return Err(NavCardError::CardSizeMismatch {
            card: card.total_size(),
            min: length,
            max: card.total_size(),
        });
    }
    let sectors_needed = length.div_ceil(sector_size) as u32;

    // Blank check: only sectors with any cleared bit need an erase pass.
    log::info!("checking {} sectors", sectors_needed);
    let mut blank = vec![true; sectors_needed as usize];
    {
        let mut offset: u64 = 0;
        programmer.read_blocks(0, sectors_needed as u64 * sector_size, &mut |block| {
            for (i, &b) in block.iter().enumerate() {
                if b != 0xFF {
                    blank[((offset + i as u64) / sector_size) as usize] = false;
                }
            }
            offset += block.len() as u64;
            Ok(())
        })?;
    }

    if full_erase {
        log::info!("erasing the whole card");
        programmer.erase_sectors(0, card.total_sectors(), progress)?;
    } else {
        let mut sector = 0u32;
        while sector < sectors_needed {
            if blank[sector as usize] {
                sector += 1;
                continue;
            }
            let start = sector;
            while sector < sectors_needed && !blank[sector as usize] {
                sector += 1;
            }
            log::info!("erasing sectors {}..{}", start, sector);
            programmer.erase_sectors(start, sector - start, progress)?;
        }
    }

    // Write pass.
    log::info!("writing {} bytes", length);
    {
        let mut file = BufReader::new(File::open(path)?);
        programmer.write_blocks(
            0,
            length,
            &mut |len| {
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)
                    .map_err(crate::card::DeviceError::Io)?;
                Ok(buf)
            },
            progress,
        )?;
    }

    // Read back and compare.
    log::info!("verifying");
    let mut file = BufReader::new(File::open(path)?);
    let mut offset: u64 = 0;
    let mut mismatch: Option<u64> = None;
    let read_result = programmer.read_blocks(0, length, &mut |block| {
        let mut expected = vec![0u8; block.len()];
        file.read_exact(&mut expected)
            .map_err(crate::card::DeviceError::Io)?;
        if let Some(i) = block.iter().zip(&expected).position(|(a, b)| a != b) {
            mismatch = Some(offset + i as u64);
            return Err(crate::card::DeviceError::Protocol("verification mismatch"));
        }
        offset += block.len() as u64;
        progress(block.len() as u64);
        Ok(())
    });

    if let Some(at) = mismatch {
        return Err(NavCardError::VerifyFailed {
            sector: (at / sector_size) as u32,
            block: ((at % sector_size) / card.card_type.read_size() as u64) as u32,
        });
    }
    read_result?;
    Ok(())
}

/// Dump the whole card to a file.
pub fn read_card_image<P: UsbPort>(
    programmer: &mut Programmer<P>,
    path: &Path,
    progress: ProgressFn,
) -> Result<(), NavCardError> {
    let total = programmer.total_size()?;
    let mut out = std::io::BufWriter::new(File::create(path)?);
    let mut write_err: Option<std::io::Error> = None;
    let result = programmer.read_blocks(0, total, &mut |block| {
        if let Err(err) = out.write_all(block) {
            write_err = Some(err);
            return Err(crate::card::DeviceError::Protocol("output write failed"));
        }
        progress(block.len() as u64);
        Ok(())
    });
    if let Some(err) = write_err {
        return Err(err.into());
    }
    result?;
    out.flush()?;
    Ok(())
}

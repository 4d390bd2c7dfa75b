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

    src/avidyne.rs

    The Avidyne self-extracting archive (.dsf) codec. A distribution ships a
    human-readable script describing the archive sections; this module parses
    that script, then emits the binary archive with the subscription's
    security block, deflated file payloads, and per-file checksums. The
    binary form can be parsed back for verification.
*/

use std::io::{Read, Seek, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use regex::Regex;
use thiserror::Error;
use zip::ZipArchive;

use crate::checksum::sfx_checksum;

pub const MAGIC_HEADER: &[u8; 13] = b"!AVIDYNE_SFX!";
pub const MAGIC_FOOTER: u32 = 0x0304_0506;

const SECTION_RE: &str = r"^(\d{1,2})\s+(.+?)( ~Conditional.*)?$";
const CONDITIONAL_NEW_RE: &str = r"^Mask:0x([0-9a-fA-F]{1,8})(\t(.*))?$";
const CONDITIONAL_OLD_RE: &str = r"^(\d):(\d):(\d)\t(.+\t.+\t.+\t.+)$";

/// Security block padding unit: one 32-byte run of 0xAA per remaining
/// transfer.
const SECURITY_PAD_UNIT: usize = 32;

#[derive(Debug, Error)]
pub enum SfxError {
    #[error("malformed archive: {0}")]
    MalformedSfx(String),
    #[error("malformed script: {0}")]
    MalformedScript(String),
    #[error("checksum mismatch: expected {expected:08x}, got {got:08x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("unsupported section type: {0}")]
    UnsupportedSection(u8),
    #[error("unexpected version: {0:?}")]
    UnexpectedVersion(String),
    #[error("file is not in the archive: {0}")]
    MissingFile(String),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SfxVersion {
    V1_05,
    V3_09,
}

impl SfxVersion {
    fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            SfxVersion::V1_05 => b"1.05",
            SfxVersion::V3_09 => b"3.09",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, SfxError> {
        match bytes {
            b"1.05" => Ok(SfxVersion::V1_05),
            b"3.09" => Ok(SfxVersion::V3_09),
            other => Err(SfxError::UnexpectedVersion(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// Fields shared by every section regardless of its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionContext {
    pub header: String,
    pub bitmask: u32,
    pub conditional_info: Option<String>,
    pub param: String,
}

/// Subscription identity baked into the emitted archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    pub cycle: String,
    pub volume_id: u32,
    pub remaining_transfers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionKind {
    Script {
        start_message: String,
        security: bool,
    },
    Copy {
        mode: u32,
        files: Vec<String>,
    },
    Execute {
        command: String,
        flag: u8,
    },
    Persist {
        path: String,
        key: String,
        value: String,
        count: u32,
        data_type: String,
    },
    MessageBox {
        has_proceed: bool,
        has_cancel: bool,
        message: String,
    },
}

impl SectionKind {
    pub fn id(&self) -> u8 {
        match self {
            SectionKind::Script { .. } => 0,
            SectionKind::Copy { .. } => 1,
            SectionKind::Execute { .. } => 3,
            SectionKind::Persist { .. } => 6,
            SectionKind::MessageBox { .. } => 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfxSection {
    pub ctx: SectionContext,
    pub kind: SectionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfxFile {
    pub version: SfxVersion,
    pub sections: Vec<SfxSection>,
}

fn next_line<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Result<&'a str, SfxError> {
    lines
        .next()
        .ok_or_else(|| SfxError::MalformedScript("unexpected end of script".into()))
}

impl SfxFile {
    /// Parse the human-readable script form. Blank lines and `;` comments
    /// between sections are skipped; the presence of any conditional section
    /// upgrades the archive to the 3.x format.
    pub fn parse_script(text: &str) -> Result<SfxFile, SfxError> {
        let section_re = Regex::new(SECTION_RE).expect("Invalid regex");
        let cond_new_re = Regex::new(CONDITIONAL_NEW_RE).expect("Invalid regex");
        let cond_old_re = Regex::new(CONDITIONAL_OLD_RE).expect("Invalid regex");

        let mut version = SfxVersion::V1_05;
        let mut sections = Vec::new();
        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let caps = section_re
                .captures(line)
                .ok_or_else(|| SfxError::MalformedScript(format!("could not parse line: {:?}", line)))?;

            let section_type: u8 = caps[1]
                .parse()
                .map_err(|_| SfxError::MalformedScript(format!("bad section type in {:?}", line)))?;
            let header = caps[2].to_string();
            let conditional = caps.get(3).is_some();

            let mut bitmask = 7;
            let mut conditional_info = None;

            if conditional {
                version = SfxVersion::V3_09;
                let cond_line = next_line(&mut lines)?.trim();
                if let Some(m) = cond_new_re.captures(cond_line) {
                    bitmask = u32::from_str_radix(&m[1], 16)
                        .map_err(|_| SfxError::MalformedScript(format!("bad mask: {:?}", cond_line)))?;
                    conditional_info = m.get(3).map(|info| info.as_str().to_string());
                } else if let Some(m) = cond_old_re.captures(cond_line) {
                    // The three legacy flags land on mask bits 0, 2 and 1,
                    // in that order.
                    bitmask = u32::from(&m[1] != "0")
                        | u32::from(&m[2] != "0") << 2
                        | u32::from(&m[3] != "0") << 1;
                    conditional_info = Some(m[4].to_string());
                } else {
                    return Err(SfxError::MalformedScript(format!(
                        "could not parse conditional line: {:?}",
                        cond_line
                    )));
                }
            }

            let param = next_line(&mut lines)?.trim().to_string();
            let ctx = SectionContext {
                header,
                bitmask,
                conditional_info,
                param,
            };

            let kind = match section_type {
                0 => {
                    let blank = next_line(&mut lines)?.trim();
                    if !blank.is_empty() {
                        return Err(SfxError::MalformedScript(format!(
                            "unexpected content: {:?}",
                            blank
                        )));
                    }
                    let start_message = next_line(&mut lines)?.trim().to_string();
                    let security = !next_line(&mut lines)?.trim().starts_with('0');
                    SectionKind::Script {
                        start_message,
                        security,
                    }
                }
                1 => {
                    let mode_str = next_line(&mut lines)?.trim();
                    let mode = u32::from_str_radix(mode_str, 8).map_err(|_| {
                        SfxError::MalformedScript(format!("bad copy mode: {:?}", mode_str))
                    })?;
                    let mut files = Vec::new();
                    for line in lines.by_ref() {
                        let line = line.trim();
                        if line.is_empty() {
                            break;
                        }
                        files.push(line.to_string());
                    }
                    SectionKind::Copy { mode, files }
                }
                3 => {
                    let command = next_line(&mut lines)?.trim().to_string();
                    let flag_str = next_line(&mut lines)?.trim();
                    let flag = flag_str.parse().map_err(|_| {
                        SfxError::MalformedScript(format!("bad execute flag: {:?}", flag_str))
                    })?;
                    SectionKind::Execute { command, flag }
                }
                6 => {
                    let path = next_line(&mut lines)?.trim().to_string();
                    let key = next_line(&mut lines)?.trim().to_string();
                    let value = next_line(&mut lines)?.trim().to_string();
                    let count_str = next_line(&mut lines)?.trim();
                    let count = count_str.parse().map_err(|_| {
                        SfxError::MalformedScript(format!("bad persist count: {:?}", count_str))
                    })?;
                    let data_type = next_line(&mut lines)?.trim().to_string();
                    SectionKind::Persist {
                        path,
                        key,
                        value,
                        count,
                        data_type,
                    }
                }
                14 => {
                    let has_proceed = !next_line(&mut lines)?.trim().starts_with('0');
                    let has_cancel = !next_line(&mut lines)?.trim().starts_with('0');
                    let mut message_parts = Vec::new();
                    for line in lines.by_ref() {
                        let line = line.trim_end_matches('\r');
                        if line == "~MsgEnd~" {
                            break;
                        }
                        message_parts.push(line);
                    }
                    SectionKind::MessageBox {
                        has_proceed,
                        has_cancel,
                        message: message_parts.concat(),
                    }
                }
                other => return Err(SfxError::UnsupportedSection(other)),
            };

            sections.push(SfxSection { ctx, kind });
        }

        Ok(SfxFile { version, sections })
    }

    /// Total number of payload bytes the Copy sections will read, for
    /// progress reporting.
    pub fn total_progress<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
    ) -> Result<u64, SfxError> {
        let mut total = 0;
        for section in &self.sections {
            if let SectionKind::Copy { files, .. } = &section.kind {
                for file in files {
                    let entry = archive.by_name(archive_path(file).as_ref()).map_err(|_| {
                        SfxError::MissingFile(file.clone())
                    })?;
                    total += entry.size();
                }
            }
        }
        Ok(total)
    }

    /// Emit the binary archive. Tail-number conditional sections consume
    /// `fleet_ids` in the order the sections appear.
    pub fn emit<W: Write, R: Read + Seek>(
        &self,
        out: &mut W,
        archive: &mut ZipArchive<R>,
        security: &SecurityContext,
        fleet_ids: &[String],
        progress: crate::ProgressFn,
    ) -> Result<(), SfxError> {
        out.write_all(MAGIC_HEADER)?;
        out.write_all(self.version.as_bytes())?;
        write_u32(out, self.sections.len() as u32)?;

        let mut fleet_ids = fleet_ids.iter();

        for (idx, section) in self.sections.iter().enumerate() {
            write_u32(out, 0)?;
            if idx == 0 {
                write_string(out, &format!("{} {}", security.cycle, section.ctx.header))?;
            } else {
                write_string(out, &section.ctx.header)?;
            }

            if self.version == SfxVersion::V3_09 {
                write_u32(out, section.ctx.bitmask)?;
                write_u32(out, section.ctx.conditional_info.is_some() as u32)?;
                if let Some(info) = &section.ctx.conditional_info {
                    write_string(out, &substitute_tail_number(info, &mut fleet_ids))?;
                }
            }

            write_string(out, &section.ctx.param)?;
            out.write_all(&[section.kind.id()])?;

            match &section.kind {
                SectionKind::Script {
                    start_message,
                    security: has_security,
                } => {
                    write_string(out, start_message)?;
                    out.write_all(&[*has_security as u8])?;
                    if *has_security {
                        out.write_all(&[0x03])?;
                        write_string(out, &security.cycle)?;
                        write_u32(out, security.volume_id)?;
                        write_u32(out, security.remaining_transfers)?;
                        let pad = vec![0xAA; SECURITY_PAD_UNIT * security.remaining_transfers as usize];
                        out.write_all(&pad)?;
                    }
                }
                SectionKind::Copy { mode, files } => {
                    write_u32(out, files.len() as u32)?;
                    write_u32(out, *mode)?;
                    for file in files {
                        let contents = {
                            let mut entry =
                                archive.by_name(archive_path(file).as_ref()).map_err(|_| {
                                    SfxError::MissingFile(file.clone())
                                })?;
                            let mut contents = Vec::with_capacity(entry.size() as usize);
                            entry.read_to_end(&mut contents)?;
                            contents
                        };

                        write_string(out, basename(file))?;
                        write_u32(out, 3)?;
                        write_u32(out, contents.len() as u32)?;

                        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                        encoder.write_all(&contents)?;
                        let compressed = encoder.finish()?;
                        write_u32(out, compressed.len() as u32)?;
                        out.write_all(&compressed)?;

                        write_u32(out, sfx_checksum(&contents, 0))?;
                        progress(contents.len() as u64);
                    }
                }
                SectionKind::Execute { command, flag } => {
                    write_string(out, command)?;
                    out.write_all(&[*flag])?;
                }
                SectionKind::Persist {
                    path,
                    key,
                    value,
                    count,
                    data_type,
                } => {
                    write_string(out, path)?;
                    write_string(out, key)?;
                    write_string(out, value)?;
                    write_u32(out, *count)?;
                    write_string(out, data_type)?;
                }
                SectionKind::MessageBox {
                    has_proceed,
                    has_cancel,
                    message,
                } => {
                    out.write_all(&[*has_proceed as u8, *has_cancel as u8])?;
                    write_string(out, message)?;
                }
            }
        }

        write_u32(out, MAGIC_FOOTER)?;
        Ok(())
    }

    /// Parse the binary archive, verifying payload checksums and the
    /// security block padding. The recovered security context (if the
    /// archive carries a security block) is returned alongside; the cycle
    /// prefix is stripped back off the first section header so that
    /// emitting the result with the same context reproduces the input.
    pub fn parse_binary<R: Read>(r: &mut R) -> Result<(SfxFile, Option<SecurityContext>), SfxError> {
        let mut magic = [0u8; 13];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC_HEADER {
            return Err(SfxError::MalformedSfx("incorrect magic number".into()));
        }

        let mut version_bytes = [0u8; 4];
        r.read_exact(&mut version_bytes)?;
        let version = SfxVersion::from_bytes(&version_bytes)?;

        let num_sections = read_u32(r)?;
        let mut sections = Vec::with_capacity(num_sections as usize);
        let mut recovered: Option<SecurityContext> = None;

        for _ in 0..num_sections {
            // Leading word is always zero in observed archives; preserved
            // but not interpreted.
            let _leading = read_u32(r)?;
            let header = read_string(r)?;

            let (mut bitmask, mut conditional_info) = (7, None);
            if version == SfxVersion::V3_09 {
                bitmask = read_u32(r)?;
                let conditional = read_u32(r)?;
                if conditional != 0 {
                    conditional_info = Some(read_string(r)?);
                }
            }

            let param = read_string(r)?;

            let mut section_type = [0u8; 1];
            r.read_exact(&mut section_type)?;

            let kind = match section_type[0] {
                0 => {
                    let start_message = read_string(r)?;
                    let mut flag = [0u8; 1];
                    r.read_exact(&mut flag)?;
                    let security = flag[0] != 0;
                    if security {
                        let mut unknown = [0u8; 1];
                        r.read_exact(&mut unknown)?;
                        let cycle = read_string(r)?;
                        let volume_id = read_u32(r)?;
                        let remaining_transfers = read_u32(r)?;
                        let mut padding =
                            vec![0u8; SECURITY_PAD_UNIT * remaining_transfers as usize];
                        r.read_exact(&mut padding)?;
                        if padding.iter().any(|&b| b != 0xAA) {
                            return Err(SfxError::MalformedSfx(
                                "unexpected security block padding".into(),
                            ));
                        }
                        recovered = Some(SecurityContext {
                            cycle,
                            volume_id,
                            remaining_transfers,
                        });
                    }
                    SectionKind::Script {
                        start_message,
                        security,
                    }
                }
                1 => {
                    let file_count = read_u32(r)?;
                    let mode = read_u32(r)?;
                    let mut files = Vec::with_capacity(file_count as usize);
                    for _ in 0..file_count {
                        let filename = read_string(r)?;
                        let _unknown = read_u32(r)?;
                        let size = read_u32(r)?;
                        let compressed = read_bytes(r)?;

                        let mut decoder = ZlibDecoder::new(compressed.as_slice());
                        let mut contents = Vec::with_capacity(size as usize);
                        decoder.read_to_end(&mut contents)?;
                        if contents.len() != size as usize {
                            return Err(SfxError::MalformedSfx(format!(
                                "unexpected size for {:?}: {} instead of {}",
                                filename,
                                contents.len(),
                                size
                            )));
                        }

                        let expected = read_u32(r)?;
                        let got = sfx_checksum(&contents, 0);
                        if got != expected {
                            return Err(SfxError::ChecksumMismatch { expected, got });
                        }
                        files.push(filename);
                    }
                    SectionKind::Copy { mode, files }
                }
                3 => {
                    let command = read_string(r)?;
                    let mut flag = [0u8; 1];
                    r.read_exact(&mut flag)?;
                    SectionKind::Execute {
                        command,
                        flag: flag[0],
                    }
                }
                6 => {
                    let path = read_string(r)?;
                    let key = read_string(r)?;
                    let value = read_string(r)?;
                    let count = read_u32(r)?;
                    let data_type = read_string(r)?;
                    SectionKind::Persist {
                        path,
                        key,
                        value,
                        count,
                        data_type,
                    }
                }
                14 => {
                    let mut flags = [0u8; 2];
                    r.read_exact(&mut flags)?;
                    let message = read_string(r)?;
                    SectionKind::MessageBox {
                        has_proceed: flags[0] != 0,
                        has_cancel: flags[1] != 0,
                        message,
                    }
                }
                other => return Err(SfxError::UnsupportedSection(other)),
            };

            sections.push(SfxSection {
                ctx: SectionContext {
                    header,
                    bitmask,
                    conditional_info,
                    param,
                },
                kind,
            });
        }

        let footer = read_u32(r)?;
        if footer != MAGIC_FOOTER {
            return Err(SfxError::MalformedSfx(format!(
                "unexpected footer: {:08x}",
                footer
            )));
        }

        if let Some(ctx) = &recovered {
            if let Some(first) = sections.first_mut() {
                let prefix = format!("{} ", ctx.cycle);
                if let Some(stripped) = first.ctx.header.strip_prefix(&prefix) {
                    first.ctx.header = stripped.to_string();
                }
            }
        }

        Ok((SfxFile { version, sections }, recovered))
    }
}

/// Replace the tail-number field of a conditional info string with the next
/// fleet id, when the info is tail-number keyed.
fn substitute_tail_number<'a>(
    info: &str,
    fleet_ids: &mut impl Iterator<Item = &'a String>,
) -> String {
    let mut fields: Vec<&str> = info.split('\t').collect();
    if fields.len() >= 4 && fields[1] == "TAIL_NUM" {
        if let Some(id) = fleet_ids.next() {
            fields[3] = id;
            return fields.join("\t");
        }
    }
    info.to_string()
}

/// Resolve a script file path inside the distribution archive. Leading
/// `..` components climb out of the script's directory, which for archive
/// lookups just means dropping them.
fn archive_path(path: &str) -> std::borrow::Cow<'_, str> {
    let mut rest = path;
    while let Some(stripped) = rest.strip_prefix("../") {
        rest = stripped;
    }
    std::borrow::Cow::Borrowed(rest)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<(), SfxError> {
    w.write_all(&value.to_be_bytes())?;
    Ok(())
}

fn write_string<W: Write>(w: &mut W, value: &str) -> Result<(), SfxError> {
    let bytes = value.as_bytes();
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, SfxError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, SfxError> {
    let len = read_u32(r)?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_string<R: Read>(r: &mut R) -> Result<String, SfxError> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes).map_err(|_| SfxError::MalformedSfx("string is not UTF-8".into()))
}

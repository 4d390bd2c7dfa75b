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

    src/jdm.rs

    The .jdm sidecar written next to transferred databases. It records one
    snapshot per service with per-file hashes, and seals the document with a
    CRC32Q computed over its own serialization (sorted keys, compact
    separators, and a fixed placeholder standing in for the seal).
*/

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checksum::crc32q;
use crate::NavCardError;

pub const JDM_FILE: &str = ".jdm";
pub const JDM_VERSION: &str = "1.1";

const Z_PLACEHOLDER: &str = "DEADBEEF";

/// Short-hash prefix length differs per vendor path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OemKind {
    Avidyne,
    Garmin,
}

impl OemKind {
    fn short_hash_len(self) -> usize {
        match self {
            OemKind::Avidyne => 0x8000,
            OemKind::Garmin => 0x2000,
        }
    }
}

/// Whole-file hashes are skipped past this size.
const FULL_HASH_LIMIT: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the media root.
    pub fp: String,
    /// File size in bytes.
    pub fs: u64,
    /// CRC32Q of the leading bytes.
    pub sh: String,
    /// CRC32Q of the whole file; empty for very large files.
    pub fh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSnapshot {
    /// Unique service id.
    pub sid: String,
    /// Service code.
    pub sc: String,
    /// Version (cycle).
    pub v: String,
    /// Version start and end dates.
    pub vs: String,
    pub ve: String,
    /// Files written for this service.
    pub f: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JdmFile {
    pub ss: Vec<ServiceSnapshot>,
    pub ver: String,
    pub z: String,
}

impl JdmFile {
    /// Load an existing sidecar; a missing file yields an empty document.
    pub fn load(path: &Path) -> Result<JdmFile, NavCardError> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|err| {
                NavCardError::Unsupported(format!("malformed sidecar {}: {}", path.display(), err))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(JdmFile {
                ver: JDM_VERSION.to_string(),
                ..JdmFile::default()
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the snapshot with the same service id, or append.
    pub fn upsert(&mut self, snapshot: ServiceSnapshot) {
        match self.ss.iter_mut().find(|s| s.sid == snapshot.sid) {
            Some(existing) => *existing = snapshot,
            None => self.ss.push(snapshot),
        }
    }

    /// Serialize with the seal computed over the placeholder form.
    pub fn render(&self) -> Result<String, NavCardError> {
        let mut sealed = self.clone();
        sealed.ver = JDM_VERSION.to_string();
        sealed.z = Z_PLACEHOLDER.to_string();

        // Round-tripping through a Value sorts the object keys.
        let value = serde_json::to_value(&sealed)
            .map_err(|err| NavCardError::Unsupported(err.to_string()))?;
        let text = serde_json::to_string(&value)
            .map_err(|err| NavCardError::Unsupported(err.to_string()))?;

        let crc = crc32q(text.as_bytes(), 0);
        Ok(text.replace(Z_PLACEHOLDER, &format!("{:08x}", crc)))
    }

    pub fn save(&self, path: &Path) -> Result<(), NavCardError> {
        std::fs::write(path, self.render()?)?;
        Ok(())
    }

    /// Recompute the seal of a serialized sidecar and compare.
    pub fn verify(text: &str) -> Result<bool, NavCardError> {
        let parsed: JdmFile = serde_json::from_str(text)
            .map_err(|err| NavCardError::Unsupported(err.to_string()))?;
        let declared = parsed.z.clone();
        Ok(parsed.render()?.contains(&format!("\"z\":\"{}\"", declared)))
    }
}

/// Hash one written file into its sidecar entry. `rel` is the path recorded
/// in the sidecar; the file is read from `root/rel`.
pub fn file_entry(root: &Path, rel: &str, kind: OemKind) -> Result<FileEntry, NavCardError> {
    let path = root.join(rel);
    let size = std::fs::metadata(&path)?.len();

    let mut fd = std::fs::File::open(&path)?;
    let mut short = vec![0u8; kind.short_hash_len()];
    let mut filled = 0;
    while filled < short.len() {
        let n = fd.read(&mut short[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let sh = crc32q(&short[..filled], 0);

    let fh = if size <= FULL_HASH_LIMIT {
        let mut crc = crc32q(&short[..filled], 0);
        let mut buf = vec![0u8; 0x10000];
        loop {
            let n = fd.read(&mut buf)?;
            if n == 0 {
                break;
            }
            crc = crc32q(&buf[..n], crc);
        }
        format!("{:08x}", crc)
    } else {
        String::new()
    };

    Ok(FileEntry {
        fp: rel.to_string(),
        fs: size,
        sh: format!("{:08x}", sh),
        fh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JdmFile {
        JdmFile {
            ss: vec![ServiceSnapshot {
                sid: "12345678".into(),
                sc: "DGRW72".into(),
                v: "2501".into(),
                vs: "2025-01-23 00:00:00".into(),
                ve: "2025-02-20 00:00:00".into(),
                f: vec![FileEntry {
                    fp: "service.dsf".into(),
                    fs: 123,
                    sh: "00000000".into(),
                    fh: "00000000".into(),
                }],
            }],
            ver: JDM_VERSION.into(),
            z: String::new(),
        }
    }

    #[test]
    fn test_render_seals_document() {
        let text = sample().render().unwrap();
        assert!(text.contains("\"ver\":\"1.1\""));
        assert!(!text.contains(Z_PLACEHOLDER));

        // Recomputing over the placeholder form reproduces the seal.
        let parsed: JdmFile = serde_json::from_str(&text).unwrap();
        let declared = parsed.z.clone();
        let rerendered = parsed.render().unwrap();
        assert!(rerendered.contains(&format!("\"z\":\"{}\"", declared)));
    }

    #[test]
    fn test_keys_are_sorted() {
        let text = sample().render().unwrap();
        let f_pos = text.find("\"f\":").unwrap();
        let sid_pos = text.find("\"sid\":").unwrap();
        let v_pos = text.find("\"v\":").unwrap();
        assert!(f_pos < sid_pos && sid_pos < v_pos);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut jdm = sample();
        let mut replacement = jdm.ss[0].clone();
        replacement.v = "2502".into();
        jdm.upsert(replacement);
        assert_eq!(jdm.ss.len(), 1);
        assert_eq!(jdm.ss[0].v, "2502");
    }

    #[test]
    fn test_verify() {
        let text = sample().render().unwrap();
        assert!(JdmFile::verify(&text).unwrap());
        assert!(!JdmFile::verify(&text.replace("2501", "9999")).unwrap());
    }
}

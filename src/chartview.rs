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

    src/chartview.rs

    Merging of ChartView coverage regions. A subscription arrives as one ZIP
    per coverage; the unit wants a single charts.bin with a sorted index,
    the DBF tables cut down to the covered airports with their cross
    reference numbers rewritten, a regenerated notams memo file, and a
    crcfiles.txt listing the checksum of everything. Several quirks of the
    vendor tool are load-bearing for the avionics and are reproduced here
    on purpose.
*/

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use binrw::{binrw, BinRead, BinWrite};
use regex::Regex;
use thiserror::Error;
use zip::ZipArchive;

use crate::checksum::crc32q;
use crate::dbf::{DbfError, DbfField, DbfFile, DbfHeader, DbtReader, DbtWriter, Value};

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("invalid chart file: {0}")]
    InvalidChart(String),
    #[error("chart record {name:?} has a bad size: {size}")]
    BadRecordSize { name: String, size: u32 },
    #[error("missing entry in the coverage archive: {0}")]
    MissingEntry(String),
    #[error("checksum mismatch: expected {expected:08x}, got {got:08x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error(transparent)]
    Dbf(#[from] DbfError),
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<binrw::Error> for ChartError {
    fn from(err: binrw::Error) -> Self {
        ChartError::InvalidChart(err.to_string())
    }
}

pub const CHART_HEADER_SIZE: usize = 27;
pub const CHART_RECORD_SIZE: usize = 40;
const CHART_MAGIC: u32 = 0x0100_0000 + 27;

/// Chart payload sizes outside this range mean a corrupt index.
const MAX_RECORD_SIZE: u32 = 0x0100_0000;

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct ChartHeader {
    pub checksum: u32,
    magic: u32,
    pub num_files: u32,
    pub index_offset: u32,
    begin_date: [u8; 11],
}

impl ChartHeader {
    pub fn new(num_files: u32, index_offset: u32, begin_date: &str) -> Self {
        let mut date = [0u8; 11];
        let bytes = begin_date.as_bytes();
        date[..bytes.len().min(11)].copy_from_slice(&bytes[..bytes.len().min(11)]);
        ChartHeader {
            checksum: 0,
            magic: CHART_MAGIC,
            num_files,
            index_offset,
            begin_date: date,
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, ChartError> {
        let mut buf = [0u8; CHART_HEADER_SIZE];
        r.read_exact(&mut buf)?;
        let header = ChartHeader::read(&mut Cursor::new(&buf))?;
        if header.magic != CHART_MAGIC {
            return Err(ChartError::InvalidChart(format!(
                "bad magic {:08x}",
                header.magic
            )));
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::with_capacity(CHART_HEADER_SIZE));
        self.write(&mut buf).expect("header serialization");
        buf.into_inner()
    }

    pub fn begin_date(&self) -> String {
        let end = self.begin_date.iter().position(|&b| b == 0).unwrap_or(11);
        String::from_utf8_lossy(&self.begin_date[..end]).into_owned()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct ChartRecord {
    name: [u8; 26],
    pub offset: u32,
    pub size: u32,
    pub metadata: [u8; 6],
}

impl ChartRecord {
    pub fn new(name: &str, offset: u32, size: u32, metadata: [u8; 6]) -> Self {
        let mut name_buf = [0u8; 26];
        let bytes = name.as_bytes();
        name_buf[..bytes.len().min(26)].copy_from_slice(&bytes[..bytes.len().min(26)]);
        ChartRecord {
            name: name_buf,
            offset,
            size,
            metadata,
        }
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, ChartError> {
        let mut buf = [0u8; CHART_RECORD_SIZE];
        r.read_exact(&mut buf)?;
        Ok(ChartRecord::read(&mut Cursor::new(&buf))?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::with_capacity(CHART_RECORD_SIZE));
        self.write(&mut buf).expect("record serialization");
        buf.into_inner()
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(26);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Record name without its extension, uppercased; the form chart tables
    /// key on.
    pub fn chart_key(&self) -> String {
        let name = self.name();
        let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&name);
        stem.to_uppercase()
    }
}

/// A named airport set a subscription can cover.
#[derive(Debug, Clone)]
pub struct CoverageSet {
    pub key: String,
    pub airports: BTreeSet<String>,
}

/// Pick the smallest coverage whose airport set contains everything
/// observed.
pub fn guess_subscription<'a>(
    observed: &BTreeSet<String>,
    coverages: &'a [CoverageSet],
) -> Option<&'a CoverageSet> {
    coverages
        .iter()
        .filter(|c| observed.is_subset(&c.airports))
        .min_by_key(|c| c.airports.len())
}

/// Writer wrapper folding everything written into a running CRC32Q.
struct CrcWriter<W> {
    inner: W,
    crc: u32,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        CrcWriter { inner, crc: 0 }
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32q(&buf[..n], self.crc);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct ChartSource {
    path: PathBuf,
    archive: ZipArchive<File>,
    /// Coverage code from the chart file name.
    code: String,
    is_vfr: bool,
    chart_entry: String,
}

impl ChartSource {
    fn open(path: &Path) -> Result<Self, ChartError> {
        let file = File::open(path)?;
        let archive = ZipArchive::new(file)?;

        let mut chart_entry = None;
        for name in archive.file_names() {
            if name.to_lowercase().ends_with(".bin") {
                chart_entry = Some(name.to_string());
                break;
            }
        }
        let chart_entry =
            chart_entry.ok_or_else(|| ChartError::MissingEntry("*charts.bin".into()))?;

        let stem = chart_entry
            .rsplit('/')
            .next()
            .unwrap_or(&chart_entry)
            .to_lowercase();
        let (code, is_vfr) = if let Some(code) = stem.strip_suffix("_vfrcharts.bin") {
            (code.to_string(), true)
        } else if let Some(code) = stem.strip_suffix("_charts.bin") {
            (code.to_string(), false)
        } else {
            (stem.trim_end_matches(".bin").to_string(), false)
        };

        Ok(ChartSource {
            path: path.to_path_buf(),
            archive,
            code,
            is_vfr,
            chart_entry,
        })
    }

    fn entry_name(&self, want: &str) -> Option<String> {
        let want_lower = want.to_lowercase();
        self.archive
            .file_names()
            .find(|name| name.to_lowercase() == want_lower)
            .map(str::to_string)
    }

    fn has_entry(&self, want: &str) -> bool {
        self.entry_name(want).is_some()
    }

    fn read_entry(&mut self, want: &str) -> Result<Vec<u8>, ChartError> {
        let name = self
            .entry_name(want)
            .ok_or_else(|| ChartError::MissingEntry(want.to_string()))?;
        let mut entry = self.archive.by_name(&name)?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Spill an entry into a seekable scratch file. The streaming ZIP
    /// decoder cannot seek, and chart payloads are visited out of order.
    fn spill_entry(&mut self, name: &str) -> Result<File, ChartError> {
        let mut entry = self.archive.by_name(name)?;
        let mut spill = tempfile::tempfile()?;
        std::io::copy(&mut entry, &mut spill)?;
        spill.seek(SeekFrom::Start(0))?;
        Ok(spill)
    }
}

/// Filtered DBF tables ready to be written out.
struct FilteredTables {
    airports: (DbfHeader, Vec<DbfField>, Vec<Vec<Value>>),
    charts: (DbfHeader, Vec<DbfField>, Vec<Vec<Value>>),
    chrtlink: (DbfHeader, Vec<DbfField>, Vec<Vec<Value>>),
}

pub struct ChartView {
    sources: Vec<ChartSource>,
    coverages: Vec<CoverageSet>,
}

impl ChartView {
    pub fn open(paths: &[PathBuf]) -> Result<Self, ChartError> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let source = ChartSource::open(path)?;
            log::debug!(
                "coverage {} ({}) from {}",
                source.code,
                if source.is_vfr { "VFR" } else { "IFR" },
                source.path.display()
            );
            sources.push(source);
        }
        Ok(ChartView {
            sources,
            coverages: Vec::new(),
        })
    }

    /// Provide named coverage airport sets for the subscription guess.
    pub fn with_coverages(mut self, coverages: Vec<CoverageSet>) -> Self {
        self.coverages = coverages;
        self
    }

    /// Produce the merged output in `dest`. Returns the relative paths of
    /// every file written, in the order written.
    pub fn transfer(
        &mut self,
        dest: &Path,
        progress: crate::ProgressFn,
    ) -> Result<Vec<String>, ChartError> {
        let ini = self.sources[0].read_entry("charts.ini")?;
        std::fs::write(dest.join("charts.ini"), &ini)?;
        let begin_date = extract_begin_date(&ini)?;
        log::debug!("database begin date: {}", begin_date);

        self.merge_charts_bin(dest, &begin_date, progress)?;

        let (ifr_airports, vfr_airports) = self.guess_airports()?;
        let airports: BTreeSet<String> = ifr_airports.union(&vfr_airports).cloned().collect();
        log::info!(
            "covering {} airports ({} IFR, {} VFR)",
            airports.len(),
            ifr_airports.len(),
            vfr_airports.len()
        );

        let tables = self.filter_tables(&ifr_airports, &vfr_airports)?;
        let countries = country_set(&tables.airports);

        write_table(dest, "airports.dbf", &tables.airports)?;
        write_table(dest, "charts.dbf", &tables.charts)?;
        write_table(dest, "chrtlink.dbf", &tables.chrtlink)?;

        self.write_notams(dest, &airports, &countries)?;

        self.write_crcfiles(dest)?;

        Ok(vec![
            "charts.ini".into(),
            "charts.bin".into(),
            "airports.dbf".into(),
            "charts.dbf".into(),
            "chrtlink.dbf".into(),
            "notams.dbf".into(),
            "notams.dbt".into(),
            "crcfiles.txt".into(),
        ])
    }

    fn merge_charts_bin(
        &mut self,
        dest: &Path,
        begin_date: &str,
        progress: crate::ProgressFn,
    ) -> Result<(), ChartError> {
        let mut spills = Vec::with_capacity(self.sources.len());
        let mut headers = Vec::with_capacity(self.sources.len());

        let mut total_size: u64 = 0;
        let mut total_files: u32 = 0;

        for source in &mut self.sources {
            let entry = source.chart_entry.clone();
            let mut spill = source.spill_entry(&entry)?;
            let header = ChartHeader::read_from(&mut spill)?;
            total_size += header.index_offset as u64 - CHART_HEADER_SIZE as u64;
            total_files += header.num_files;
            spills.push(spill);
            headers.push(header);
        }

        let out = File::create(dest.join("charts.bin"))?;
        let mut out = BufWriter::new(out);

        let new_header = ChartHeader::new(
            total_files,
            total_size as u32 + CHART_HEADER_SIZE as u32,
            begin_date,
        );
        let header_bytes = new_header.to_bytes();

        // The leading checksum word is excluded from its own computation;
        // it is patched in at the end.
        out.write_all(&header_bytes[..4])?;
        let mut crc_out = CrcWriter::new(out);
        crc_out.write_all(&header_bytes[4..])?;

        let mut all_records: Vec<ChartRecord> = Vec::with_capacity(total_files as usize);
        let mut total_offset = CHART_HEADER_SIZE as u32;

        for (spill, header) in spills.iter_mut().zip(&headers) {
            spill.seek(SeekFrom::Start(header.index_offset as u64))?;
            let mut records = Vec::with_capacity(header.num_files as usize);
            for _ in 0..header.num_files {
                records.push(ChartRecord::read_from(spill)?);
            }

            for mut record in records {
                if record.size == 0 || record.size >= MAX_RECORD_SIZE {
                    return Err(ChartError::BadRecordSize {
                        name: record.name(),
                        size: record.size,
                    });
                }
                spill.seek(SeekFrom::Start(record.offset as u64))?;
                let mut remaining = record.size as u64;
                let mut buf = vec![0u8; 0x10000];
                while remaining > 0 {
                    let take = remaining.min(buf.len() as u64) as usize;
                    spill.read_exact(&mut buf[..take])?;
                    crc_out.write_all(&buf[..take])?;
                    remaining -= take as u64;
                }
                record.offset = total_offset;
                total_offset += record.size;
                progress(record.size as u64);
                all_records.push(record);
            }
        }

        all_records.sort_by_key(|record| record.name());

        for record in &all_records {
            crc_out.write_all(&record.to_bytes())?;
        }

        let crc = crc_out.crc;
        let mut out = crc_out.inner;
        out.flush()?;
        let mut file = out.into_inner().map_err(|e| ChartError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    /// Work out which airports each coverage actually ships charts for, and
    /// fold in the subscription guess when coverage sets are available.
    fn guess_airports(&mut self) -> Result<(BTreeSet<String>, BTreeSet<String>), ChartError> {
        let mut ifr = BTreeSet::new();
        let mut vfr = BTreeSet::new();

        for i in 0..self.sources.len() {
            let code = self.sources[i].code.clone();
            let is_vfr = self.sources[i].is_vfr;

            let entry = self.sources[i].chart_entry.clone();
            let mut spill = self.sources[i].spill_entry(&entry)?;
            let header = ChartHeader::read_from(&mut spill)?;
            spill.seek(SeekFrom::Start(header.index_offset as u64))?;
            let mut chart_keys = BTreeSet::new();
            for _ in 0..header.num_files {
                chart_keys.insert(ChartRecord::read_from(&mut spill)?.chart_key());
            }

            let charts = self.sources[i].read_entry("charts.dbf")?;
            let mut cursor = Cursor::new(charts.as_slice());
            let (chart_header, fields) = DbfFile::read_header(&mut cursor)?;
            let name_idx = find_field(&fields, &["CHT_NAME", "CHART_NAME", "NAME"])
                .ok_or_else(|| ChartError::MissingEntry("charts.dbf chart name field".into()))?;
            let airport_idx = find_field(&fields, &["ICAO_ID", "APT_ICAO", "ICAO"])
                .ok_or_else(|| ChartError::MissingEntry("charts.dbf airport field".into()))?;

            let mut observed = BTreeSet::new();
            for _ in 0..chart_header.num_records {
                let values = DbfFile::read_record(&mut cursor, &fields)?;
                let name = values[name_idx].as_text().unwrap_or_default().to_uppercase();
                if chart_keys.contains(&name) {
                    if let Some(airport) = values[airport_idx].as_text() {
                        observed.insert(airport.to_string());
                    }
                }
            }

            let covered = match guess_subscription(&observed, &self.coverages) {
                Some(coverage) => {
                    log::info!("coverage {} matches subscription {}", code, coverage.key);
                    coverage.airports.clone()
                }
                None => observed,
            };

            if is_vfr {
                vfr.extend(covered);
            } else {
                ifr.extend(covered);
            }
        }

        Ok((ifr, vfr))
    }

    fn filter_tables(
        &mut self,
        ifr_airports: &BTreeSet<String>,
        vfr_airports: &BTreeSet<String>,
    ) -> Result<FilteredTables, ChartError> {
        // Airports: IFR entries win over VFR entries for the same airport,
        // so IFR sources are visited first.
        let mut airports_out: Option<(DbfHeader, Vec<DbfField>, Vec<Vec<Value>>)> = None;
        let mut seen_airports = BTreeSet::new();

        let order: Vec<usize> = {
            let mut ifr_idx: Vec<usize> = (0..self.sources.len())
                .filter(|&i| !self.sources[i].is_vfr)
                .collect();
            let vfr_idx: Vec<usize> = (0..self.sources.len())
                .filter(|&i| self.sources[i].is_vfr)
                .collect();
            ifr_idx.extend(vfr_idx);
            ifr_idx
        };

        for &i in &order {
            let is_vfr = self.sources[i].is_vfr;
            let airports = if is_vfr { vfr_airports } else { ifr_airports };
            let data = self.sources[i].read_entry("airports.dbf")?;
            let mut cursor = Cursor::new(data.as_slice());
            let (header, fields) = DbfFile::read_header(&mut cursor)?;
            let idx = find_field(&fields, &["ICAO_ID", "APT_ICAO", "ICAO"])
                .ok_or_else(|| ChartError::MissingEntry("airports.dbf airport field".into()))?;

            let out =
                airports_out.get_or_insert_with(|| (header.clone(), fields.clone(), Vec::new()));
            for _ in 0..header.num_records {
                let values = DbfFile::read_record(&mut cursor, &fields)?;
                let code = values[idx].as_text().unwrap_or_default().to_string();
                if airports.contains(&code) && seen_airports.insert(code) {
                    out.2.push(values);
                }
            }
        }

        // Charts and chart links: filter by airport and renumber the chart
        // cross reference 1-based in output order.
        let mut charts_out: Option<(DbfHeader, Vec<DbfField>, Vec<Vec<Value>>)> = None;
        let mut chrtlink_out: Option<(DbfHeader, Vec<DbfField>, Vec<Vec<Value>>)> = None;
        let mut renumber: BTreeMap<(usize, i64), i64> = BTreeMap::new();
        let mut next_chart_no: i64 = 1;

        for &i in &order {
            let is_vfr = self.sources[i].is_vfr;
            let airports = if is_vfr { vfr_airports } else { ifr_airports };
            let data = self.sources[i].read_entry("charts.dbf")?;
            let mut cursor = Cursor::new(data.as_slice());
            let (header, fields) = DbfFile::read_header(&mut cursor)?;
            let airport_idx = find_field(&fields, &["ICAO_ID", "APT_ICAO", "ICAO"])
                .ok_or_else(|| ChartError::MissingEntry("charts.dbf airport field".into()))?;
            let no_idx = find_field(&fields, &["CHT_NO", "CHART_NO"]);

            let out =
                charts_out.get_or_insert_with(|| (header.clone(), fields.clone(), Vec::new()));
            for _ in 0..header.num_records {
                let mut values = DbfFile::read_record(&mut cursor, &fields)?;
                let airport = values[airport_idx].as_text().unwrap_or_default();
                if !airports.contains(airport) {
                    continue;
                }
                if let Some(no_idx) = no_idx {
                    if let Some(old) = values[no_idx].as_number() {
                        renumber.insert((i, old), next_chart_no);
                    }
                    values[no_idx] = Value::Number(Some(next_chart_no));
                }
                next_chart_no += 1;
                out.2.push(values);
            }
        }

        for &i in &order {
            let is_vfr = self.sources[i].is_vfr;
            let airports = if is_vfr { vfr_airports } else { ifr_airports };
            let data = self.sources[i].read_entry("chrtlink.dbf")?;
            let mut cursor = Cursor::new(data.as_slice());
            let (header, fields) = DbfFile::read_header(&mut cursor)?;
            let airport_idx = find_field(&fields, &["ICAO_ID", "APT_ICAO", "ICAO"])
                .ok_or_else(|| ChartError::MissingEntry("chrtlink.dbf airport field".into()))?;
            let no_idx = find_field(&fields, &["CHT_NO", "CHART_NO"]);

            let out =
                chrtlink_out.get_or_insert_with(|| (header.clone(), fields.clone(), Vec::new()));
            for _ in 0..header.num_records {
                let mut values = DbfFile::read_record(&mut cursor, &fields)?;
                let airport = values[airport_idx].as_text().unwrap_or_default();
                if !airports.contains(airport) {
                    continue;
                }
                if let Some(no_idx) = no_idx {
                    if let Some(old) = values[no_idx].as_number() {
                        if let Some(&new) = renumber.get(&(i, old)) {
                            values[no_idx] = Value::Number(Some(new));
                        }
                    }
                }
                out.2.push(values);
            }
        }

        Ok(FilteredTables {
            airports: airports_out
                .ok_or_else(|| ChartError::MissingEntry("airports.dbf".into()))?,
            charts: charts_out.ok_or_else(|| ChartError::MissingEntry("charts.dbf".into()))?,
            chrtlink: chrtlink_out
                .ok_or_else(|| ChartError::MissingEntry("chrtlink.dbf".into()))?,
        })
    }

    fn write_notams(
        &mut self,
        dest: &Path,
        airports: &BTreeSet<String>,
        countries: &BTreeSet<String>,
    ) -> Result<(), ChartError> {
        let dbt_file = File::create(dest.join("notams.dbt"))?;
        let mut dbt = DbtWriter::new(BufWriter::new(dbt_file), "notams", 0)?;

        let mut out_header: Option<DbfHeader> = None;
        let mut out_fields: Option<Vec<DbfField>> = None;
        let mut out_records: Vec<Vec<Value>> = Vec::new();

        // The pairs stream one at a time: a DBF fully, then its memo file.
        // Holding two members of one archive open at once corrupts the
        // payload, so the order here matters.
        for i in 0..self.sources.len() {
            if !self.sources[i].has_entry("notams.dbf") {
                continue;
            }

            let data = self.sources[i].read_entry("notams.dbf")?;
            let mut cursor = Cursor::new(data.as_slice());
            let (header, fields) = DbfFile::read_header(&mut cursor)?;
            let airport_idx = find_field(&fields, &["ICAO_ID", "APT_ICAO", "ICAO"]);
            let country_idx = find_field(&fields, &["CNTRY_ID", "COUNTRY", "CTRY_ID"]);
            let memo_idx = fields.iter().position(|f| f.field_type() == 'M');

            let mut records = Vec::new();
            for _ in 0..header.num_records {
                let values = DbfFile::read_record(&mut cursor, &fields)?;
                let airport = airport_idx
                    .and_then(|idx| values[idx].as_text())
                    .unwrap_or_default();
                let include = if !airport.is_empty() {
                    airports.contains(airport)
                } else {
                    let country = country_idx
                        .and_then(|idx| values[idx].as_text())
                        .unwrap_or_default();
                    countries.contains(country)
                };
                if include {
                    records.push(values);
                }
            }

            // Now that the DBF member is fully consumed, the memo file can
            // be opened and the kept records renumbered into the new one.
            if let Some(memo_idx) = memo_idx {
                let dbt_name = self.sources[i]
                    .entry_name("notams.dbt")
                    .ok_or_else(|| ChartError::MissingEntry("notams.dbt".into()))?;
                let spill = self.sources[i].spill_entry(&dbt_name)?;
                let mut reader = DbtReader::new(spill)?;
                for values in &mut records {
                    if let Some(old) = values[memo_idx].as_number() {
                        let text = reader.read_record(old as u32)?;
                        let new = dbt.append(&text)?;
                        values[memo_idx] = Value::Number(Some(new as i64));
                    }
                }
            }

            out_header.get_or_insert_with(|| header.clone());
            out_fields.get_or_insert_with(|| fields.clone());
            out_records.extend(records);
        }

        let mut inner = dbt.finish()?;
        // The vendor tool leaves a stray end-of-file byte after the memo
        // data; the unit expects it.
        inner.write_all(&[0x1A])?;
        inner.flush()?;

        let header = out_header.ok_or_else(|| ChartError::MissingEntry("notams.dbf".into()))?;
        let fields = out_fields.unwrap_or_default();
        // The info byte stays 0x03 even though the table has a memo file;
        // this misdeclaration is what the unit was built against.
        write_table(dest, "notams.dbf", &(header, fields, out_records))?;
        Ok(())
    }

    fn write_crcfiles(&mut self, dest: &Path) -> Result<(), ChartError> {
        // Files in the fixed listing order. Processed entries are reread
        // from the destination; the rest come from the source archive.
        const LISTING: &[(&str, bool)] = &[
            ("charts.ini", false),
            ("charts.bin", true),
            ("airports.dbf", true),
            ("charts.dbf", true),
            ("chrtlink.dbf", true),
            ("notams.dbf", true),
            ("notams.dbt", true),
        ];

        let mut out = String::new();
        for &(name, processed) in LISTING {
            let data = if processed {
                std::fs::read(dest.join(name))?
            } else {
                self.sources[0].read_entry(name)?
            };
            let crc = crc32q(&data, 0);
            out.push_str(&format!("{},0x{:08X}\r\n", name, crc));
        }
        std::fs::write(dest.join("crcfiles.txt"), out)?;
        Ok(())
    }
}

fn extract_begin_date(ini: &[u8]) -> Result<String, ChartError> {
    let text = String::from_utf8_lossy(ini);
    let re = Regex::new(r"(?m)^\s*Database_Begin_Date\s*=\s*(.+?)\s*$").expect("Invalid regex");
    re.captures(&text)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| ChartError::InvalidChart("charts.ini has no begin date".into()))
}

fn find_field(fields: &[DbfField], candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|name| fields.iter().position(|f| f.name() == *name))
}

fn country_set(airports: &(DbfHeader, Vec<DbfField>, Vec<Vec<Value>>)) -> BTreeSet<String> {
    let (_, fields, records) = airports;
    let Some(idx) = find_field(fields, &["CNTRY_ID", "COUNTRY", "CTRY_ID"]) else {
        return BTreeSet::new();
    };
    records
        .iter()
        .filter_map(|values| values[idx].as_text())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn write_table(
    dest: &Path,
    name: &str,
    table: &(DbfHeader, Vec<DbfField>, Vec<Vec<Value>>),
) -> Result<(), ChartError> {
    let (header, fields, records) = table;
    let mut header = header.clone();
    header.num_records = records.len() as u32;
    let (year, month, day) = today_utc();
    header.year = (year - 1900) as u8;
    header.month = month;
    header.day = day;

    let file = File::create(dest.join(name))?;
    let mut out = BufWriter::new(file);
    DbfFile::write_header(&mut out, &header, fields)?;
    for values in records {
        DbfFile::write_record(&mut out, fields, values)?;
    }
    out.flush()?;
    Ok(())
}

/// Current UTC date, derived from the system clock.
fn today_utc() -> (u16, u8, u8) {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    civil_from_days((secs / 86400) as i64)
}

/// Days-since-epoch to calendar date.
fn civil_from_days(z: i64) -> (u16, u8, u8) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    let year = if month <= 2 { year + 1 } else { year };
    (year as u16, month, day)
}

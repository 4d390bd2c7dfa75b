mod common;

use std::collections::BTreeSet;
use std::io::{Cursor, Seek, Write};
use std::path::PathBuf;

use navcard::chartview::{ChartHeader, ChartRecord, ChartView, CHART_HEADER_SIZE, CHART_RECORD_SIZE};
use navcard::checksum::crc32q;
use navcard::dbf::{DbfField, DbfFile, DbfHeader, DbtReader, DbtWriter, Value};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use common::init;

fn build_charts_bin(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut records = Vec::new();
    let mut offset = CHART_HEADER_SIZE as u32;
    for (name, contents) in files {
        records.push(ChartRecord::new(name, offset, contents.len() as u32, [0; 6]));
        payload.extend_from_slice(contents);
        offset += contents.len() as u32;
    }

    let header = ChartHeader::new(files.len() as u32, offset, "23-JAN-2025");
    let mut out = header.to_bytes();
    out.extend_from_slice(&payload);
    for record in &records {
        out.extend_from_slice(&record.to_bytes());
    }

    let crc = crc32q(&out[4..], 0);
    out[0..4].copy_from_slice(&crc.to_le_bytes());
    out
}

fn build_dbf(fields: &[DbfField], records: &[Vec<Value>]) -> Vec<u8> {
    let mut header = DbfHeader::new(2025, 1, 23);
    header.num_records = records.len() as u32;
    header.record_bytes = 1 + fields.iter().map(|f| f.length as u16).sum::<u16>();

    let mut out = Vec::new();
    DbfFile::write_header(&mut out, &header, fields).unwrap();
    for values in records {
        DbfFile::write_record(&mut out, fields, values).unwrap();
    }
    out
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn charts_fields() -> Vec<DbfField> {
    vec![
        DbfField::new("CHT_NAME", 'C', 12),
        DbfField::new("ICAO_ID", 'C', 4),
        DbfField::new("CHT_NO", 'N', 6),
    ]
}

fn chrtlink_fields() -> Vec<DbfField> {
    vec![
        DbfField::new("ICAO_ID", 'C', 4),
        DbfField::new("CHT_NO", 'N', 6),
    ]
}

fn airports_fields() -> Vec<DbfField> {
    vec![
        DbfField::new("ICAO_ID", 'C', 4),
        DbfField::new("CNTRY_ID", 'C', 2),
    ]
}

fn notams_fields() -> Vec<DbfField> {
    vec![
        DbfField::new("ICAO_ID", 'C', 4),
        DbfField::new("CNTRY_ID", 'C', 2),
        DbfField::new("NOTAM", 'M', 6),
    ]
}

struct SourceSpec<'a> {
    bin_name: &'a str,
    bin_files: &'a [(&'a str, &'a [u8])],
    charts: Vec<Vec<Value>>,
    chrtlink: Vec<Vec<Value>>,
    airports: Vec<Vec<Value>>,
    notams: Vec<(Vec<Value>, &'a [u8])>,
}

fn build_source_zip(path: &std::path::Path, spec: &SourceSpec) {
    let mut dbt = Cursor::new(Vec::new());
    let mut writer = DbtWriter::new(&mut dbt, "notams", 0).unwrap();
    let mut notam_records = Vec::new();
    for (values, memo) in &spec.notams {
        let idx = writer.append(memo).unwrap();
        let mut values = values.clone();
        let memo_pos = values.len() - 1;
        values[memo_pos] = Value::Number(Some(idx as i64));
        notam_records.push(values);
    }
    writer.finish().unwrap();

    let file = std::fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    zip.start_file("charts.ini", options).unwrap();
    zip.write_all(b"[CHARTS]\r\nDatabase_Begin_Date=23-JAN-2025\r\n")
        .unwrap();

    zip.start_file(spec.bin_name, options).unwrap();
    zip.write_all(&build_charts_bin(spec.bin_files)).unwrap();

    zip.start_file("charts.dbf", options).unwrap();
    zip.write_all(&build_dbf(&charts_fields(), &spec.charts)).unwrap();

    zip.start_file("chrtlink.dbf", options).unwrap();
    zip.write_all(&build_dbf(&chrtlink_fields(), &spec.chrtlink))
        .unwrap();

    zip.start_file("airports.dbf", options).unwrap();
    zip.write_all(&build_dbf(&airports_fields(), &spec.airports))
        .unwrap();

    zip.start_file("notams.dbf", options).unwrap();
    zip.write_all(&build_dbf(&notams_fields(), &notam_records)).unwrap();

    zip.start_file("notams.dbt", options).unwrap();
    zip.write_all(dbt.get_ref()).unwrap();

    zip.finish().unwrap();
}

fn number(n: i64) -> Value {
    Value::Number(Some(n))
}

fn build_inputs(dir: &std::path::Path) -> Vec<PathBuf> {
    let ifr = dir.join("eur_charts.zip");
    build_source_zip(
        &ifr,
        &SourceSpec {
            bin_name: "eur_charts.bin",
            bin_files: &[
                ("KJFK1.PNG", b"jfk approach one"),
                ("EGLL1.PNG", b"heathrow chart"),
                ("LFPG9.PNG", b"paris chart kept in the bin"),
            ],
            charts: vec![
                vec![text("KJFK1"), text("KJFK"), number(10)],
                vec![text("EGLL1"), text("EGLL"), number(11)],
            ],
            chrtlink: vec![
                vec![text("KJFK"), number(10)],
                vec![text("EGLL"), number(11)],
                vec![text("LFPG"), number(12)],
            ],
            airports: vec![
                vec![text("KJFK"), text("US")],
                vec![text("EGLL"), text("UK")],
                vec![text("LFPG"), text("FR")],
            ],
            notams: vec![
                (vec![text("KJFK"), text("US"), number(0)], b"JFK NOTAM"),
                (vec![text("LFPG"), text("FR"), number(0)], b"PARIS NOTAM"),
                (vec![text(""), text("US"), number(0)], b"US WIDE NOTAM"),
                (vec![text(""), text("FR"), number(0)], b"FR WIDE NOTAM"),
            ],
        },
    );

    let vfr = dir.join("eur_vfrcharts.zip");
    build_source_zip(
        &vfr,
        &SourceSpec {
            bin_name: "eur_vfrcharts.bin",
            bin_files: &[("KJFKV1.PNG", b"jfk vfr chart")],
            charts: vec![vec![text("KJFKV1"), text("KJFK"), number(3)]],
            chrtlink: vec![vec![text("KJFK"), number(3)]],
            airports: vec![vec![text("KJFK"), text("XX")]],
            notams: vec![(vec![text("KJFK"), text("US"), number(0)], b"JFK VFR NOTAM")],
        },
    );

    vec![ifr, vfr]
}

#[test]
fn test_merge_totality_and_checksum() {
    init();
    let work = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let inputs = build_inputs(work.path());

    let mut chartview = ChartView::open(&inputs).unwrap();
    let written = chartview.transfer(dest.path(), &mut |_| {}).unwrap();
    assert!(written.contains(&"charts.bin".to_string()));

    let merged = std::fs::read(dest.path().join("charts.bin")).unwrap();

    // The seal covers everything after the checksum word itself.
    let declared = u32::from_le_bytes(merged[0..4].try_into().unwrap());
    assert_eq!(crc32q(&merged[4..], 0), declared);

    let mut cursor = Cursor::new(&merged);
    let header = ChartHeader::read_from(&mut cursor).unwrap();
    assert_eq!(header.num_files, 4);
    assert_eq!(header.begin_date(), "23-JAN-2025");

    cursor
        .seek(std::io::SeekFrom::Start(header.index_offset as u64))
        .unwrap();
    let mut records = Vec::new();
    for _ in 0..header.num_files {
        records.push(ChartRecord::read_from(&mut cursor).unwrap());
    }

    // Sorted by name; offsets partition [27, index_offset).
    let names: Vec<String> = records.iter().map(|r| r.name()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    let payload_total: u32 = records.iter().map(|r| r.size).sum();
    assert_eq!(header.index_offset, CHART_HEADER_SIZE as u32 + payload_total);
    assert_eq!(
        merged.len(),
        CHART_HEADER_SIZE + payload_total as usize + CHART_RECORD_SIZE * records.len()
    );

    let mut offsets: Vec<(u32, u32)> = records.iter().map(|r| (r.offset, r.size)).collect();
    offsets.sort();
    let mut expected_offset = CHART_HEADER_SIZE as u32;
    for (offset, size) in offsets {
        assert_eq!(offset, expected_offset);
        expected_offset += size;
    }
    assert_eq!(expected_offset, header.index_offset);

    // Payload content survives at its new offset.
    let jfk = records.iter().find(|r| r.name() == "KJFK1.PNG").unwrap();
    let start = jfk.offset as usize;
    assert_eq!(&merged[start..start + jfk.size as usize], b"jfk approach one");
}

#[test]
fn test_filtered_tables_and_renumbering() {
    init();
    let work = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let inputs = build_inputs(work.path());

    let mut chartview = ChartView::open(&inputs).unwrap();
    chartview.transfer(dest.path(), &mut |_| {}).unwrap();

    // charts.dbf: IFR rows first, renumbered 1-based.
    let data = std::fs::read(dest.path().join("charts.dbf")).unwrap();
    let mut cursor = Cursor::new(data.as_slice());
    let (header, fields) = DbfFile::read_header(&mut cursor).unwrap();
    assert_eq!(header.num_records, 3);
    let mut rows = Vec::new();
    for _ in 0..header.num_records {
        rows.push(DbfFile::read_record(&mut cursor, &fields).unwrap());
    }
    assert_eq!(rows[0][0], text("KJFK1"));
    assert_eq!(rows[0][2], number(1));
    assert_eq!(rows[1][0], text("EGLL1"));
    assert_eq!(rows[1][2], number(2));
    assert_eq!(rows[2][0], text("KJFKV1"));
    assert_eq!(rows[2][2], number(3));

    // chrtlink.dbf: the Paris row is filtered out and the chart numbers
    // follow the renumbering.
    let data = std::fs::read(dest.path().join("chrtlink.dbf")).unwrap();
    let mut cursor = Cursor::new(data.as_slice());
    let (header, fields) = DbfFile::read_header(&mut cursor).unwrap();
    assert_eq!(header.num_records, 3);
    let mut rows = Vec::new();
    for _ in 0..header.num_records {
        rows.push(DbfFile::read_record(&mut cursor, &fields).unwrap());
    }
    assert_eq!(rows[0][0], text("KJFK"));
    assert_eq!(rows[0][1], number(1));
    assert_eq!(rows[1][0], text("EGLL"));
    assert_eq!(rows[1][1], number(2));
    assert_eq!(rows[2][0], text("KJFK"));
    assert_eq!(rows[2][1], number(3));

    // airports.dbf: deduplicated, and the IFR row wins for KJFK.
    let data = std::fs::read(dest.path().join("airports.dbf")).unwrap();
    let mut cursor = Cursor::new(data.as_slice());
    let (header, fields) = DbfFile::read_header(&mut cursor).unwrap();
    assert_eq!(header.num_records, 2);
    let mut rows = Vec::new();
    for _ in 0..header.num_records {
        rows.push(DbfFile::read_record(&mut cursor, &fields).unwrap());
    }
    let jfk = rows.iter().find(|r| r[0] == text("KJFK")).unwrap();
    assert_eq!(jfk[1], text("US"));
    assert!(rows.iter().any(|r| r[0] == text("EGLL")));
}

#[test]
fn test_notams_quirks_and_renumbering() {
    init();
    let work = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let inputs = build_inputs(work.path());

    let mut chartview = ChartView::open(&inputs).unwrap();
    chartview.transfer(dest.path(), &mut |_| {}).unwrap();

    let dbf = std::fs::read(dest.path().join("notams.dbf")).unwrap();
    // The info byte misdeclares a plain table even though a memo file is
    // present; the avionics expects exactly that.
    assert_eq!(dbf[0], 0x03);

    let dbt = std::fs::read(dest.path().join("notams.dbt")).unwrap();
    assert_eq!(*dbt.last().unwrap(), 0x1A);

    let mut cursor = Cursor::new(dbf.as_slice());
    let (header, fields) = DbfFile::read_header(&mut cursor).unwrap();
    // JFK, US-wide, and the VFR JFK notam survive; both French entries and
    // the Paris airport entry are gone.
    assert_eq!(header.num_records, 3);

    let mut reader = DbtReader::new(Cursor::new(dbt)).unwrap();
    let mut texts = BTreeSet::new();
    for _ in 0..header.num_records {
        let values = DbfFile::read_record(&mut cursor, &fields).unwrap();
        let memo = values[2].as_number().unwrap();
        texts.insert(reader.read_record(memo as u32).unwrap());
    }
    let expected: BTreeSet<Vec<u8>> = [
        b"JFK NOTAM".to_vec(),
        b"US WIDE NOTAM".to_vec(),
        b"JFK VFR NOTAM".to_vec(),
    ]
    .into_iter()
    .collect();
    assert_eq!(texts, expected);
}

#[test]
fn test_crcfiles_listing() {
    init();
    let work = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let inputs = build_inputs(work.path());

    let mut chartview = ChartView::open(&inputs).unwrap();
    chartview.transfer(dest.path(), &mut |_| {}).unwrap();

    let listing = std::fs::read_to_string(dest.path().join("crcfiles.txt")).unwrap();
    let lines: Vec<&str> = listing.split("\r\n").filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 7);
    assert!(lines[0].starts_with("charts.ini,0x"));

    for line in &lines {
        let (name, crc) = line.split_once(",0x").unwrap();
        let declared = u32::from_str_radix(crc, 16).unwrap();
        let data = std::fs::read(dest.path().join(name)).unwrap();
        assert_eq!(crc32q(&data, 0), declared, "checksum of {}", name);
    }
}

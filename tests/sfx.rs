mod common;

use std::io::{Cursor, Write};

use navcard::avidyne::{SecurityContext, SectionKind, SfxFile, SfxVersion};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use common::init;

const SCRIPT: &str = "\
; IFD database installer
0 Database Update
(Script)

Loading databases, please wait...
1

1 Copy database files
(Copy)
755
nav.db
chk.dat

14 Coverage notice ~Conditional~
Mask:0x5\tACTYPE\tTAIL_NUM\tIFD440\tN00000
(Notice)
1
1
This database is licensed to a single airframe.
~MsgEnd~
";

fn build_archive() -> Cursor<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    zip.start_file("nav.db", options).unwrap();
    zip.write_all(b"NAVIGATION DATA CONTENTS").unwrap();
    zip.start_file("chk.dat", options).unwrap();
    zip.write_all(&[0x55; 300]).unwrap();
    let mut cursor = zip.finish().unwrap();
    cursor.set_position(0);
    cursor
}

fn security() -> SecurityContext {
    SecurityContext {
        cycle: "2501".to_string(),
        volume_id: 0x1234_5678,
        remaining_transfers: 2,
    }
}

#[test]
fn test_emit_and_reparse() {
    init();
    let sfx = SfxFile::parse_script(SCRIPT).unwrap();
    assert_eq!(sfx.version, SfxVersion::V3_09);
    assert_eq!(sfx.sections.len(), 3);

    let mut archive = zip::ZipArchive::new(build_archive()).unwrap();
    assert_eq!(sfx.total_progress(&mut archive).unwrap(), 24 + 300);

    let mut out = Vec::new();
    let fleet = vec!["N12345".to_string()];
    sfx.emit(&mut out, &mut archive, &security(), &fleet, &mut |_| {})
        .unwrap();

    // Header magic, ASCII version, and the little-endian footer.
    assert!(out.starts_with(b"!AVIDYNE_SFX!3.09"));
    assert_eq!(&out[out.len() - 4..], &[0x03, 0x04, 0x05, 0x06]);

    let (parsed, recovered) = SfxFile::parse_binary(&mut Cursor::new(&out)).unwrap();
    let recovered = recovered.unwrap();
    assert_eq!(recovered, security());

    // The cycle prefix is stripped back off the first header, and the fleet
    // id has been substituted into the conditional info.
    assert_eq!(parsed.sections[0].ctx.header, "Database Update");
    assert_eq!(
        parsed.sections[2].ctx.conditional_info.as_deref(),
        Some("ACTYPE\tTAIL_NUM\tIFD440\tN12345")
    );

    match &parsed.sections[1].kind {
        SectionKind::Copy { mode, files } => {
            assert_eq!(*mode, 0o755);
            assert_eq!(files, &["nav.db", "chk.dat"]);
        }
        other => panic!("unexpected section: {:?}", other),
    }
}

/// Parsing an emitted archive and emitting it again with the same security
/// context reproduces the byte stream exactly.
#[test]
fn test_emit_is_idempotent() {
    init();
    let sfx = SfxFile::parse_script(SCRIPT).unwrap();
    let mut archive = zip::ZipArchive::new(build_archive()).unwrap();

    let mut first = Vec::new();
    let fleet = vec!["N12345".to_string()];
    sfx.emit(&mut first, &mut archive, &security(), &fleet, &mut |_| {})
        .unwrap();

    let (parsed, recovered) = SfxFile::parse_binary(&mut Cursor::new(&first)).unwrap();
    let mut second = Vec::new();
    // The fleet id is already substituted in the parsed form.
    parsed
        .emit(&mut second, &mut archive, &recovered.unwrap(), &[], &mut |_| {})
        .unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_security_block_layout() {
    init();
    let script = "\
0 Update
(Script)

Loading...
1
";
    let sfx = SfxFile::parse_script(script).unwrap();
    assert_eq!(sfx.version, SfxVersion::V1_05);

    let mut archive = zip::ZipArchive::new(build_archive()).unwrap();
    let mut out = Vec::new();
    sfx.emit(&mut out, &mut archive, &security(), &[], &mut |_| {})
        .unwrap();

    // The security block ends with one 32-byte 0xAA run per remaining
    // transfer, just before the footer.
    let pad = &out[out.len() - 4 - 64..out.len() - 4];
    assert!(pad.iter().all(|&b| b == 0xAA));

    // A corrupted pad byte must be rejected on re-parse.
    let mut bad = out.clone();
    let at = bad.len() - 10;
    bad[at] = 0x00;
    assert!(SfxFile::parse_binary(&mut Cursor::new(&bad)).is_err());
}

#[test]
fn test_corrupt_payload_checksum_is_rejected() {
    init();
    let script = "\
1 Copy database files
(Copy)
644
nav.db

";
    let sfx = SfxFile::parse_script(script).unwrap();
    let mut archive = zip::ZipArchive::new(build_archive()).unwrap();
    let mut out = Vec::new();
    sfx.emit(&mut out, &mut archive, &security(), &[], &mut |_| {})
        .unwrap();

    // Flip a bit inside the trailing per-file checksum.
    let at = out.len() - 6;
    out[at] ^= 0x01;
    assert!(SfxFile::parse_binary(&mut Cursor::new(&out)).is_err());
}

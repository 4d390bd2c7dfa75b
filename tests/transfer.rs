mod common;

use std::io::{Cursor, Write};

use navcard::card::UsbTransport;
use navcard::catalog::Catalog;
use navcard::checksum::{feat_unlk_checksum, FEAT_UNLK_SEED};
use navcard::featunlk::{read_slot, Feature, FEAT_UNLK};
use navcard::jdm::JdmFile;
use navcard::transfer::{transfer_service, TransferOptions, TransferTarget};
use navcard::avidyne::{SectionKind, SfxFile};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use common::init;

const AVIDYNE_CATALOG: &str = r#"<?xml version="1.0"?>
<jdm_services>
  <service>
    <category>1</category>
    <avionics>IFD440</avionics>
    <service_type>NavData</service_type>
    <unique_service_id>12345678</unique_service_id>
    <service_code>AVD001</service_code>
    <version>2501</version>
    <version_start_date>2025-01-23 00:00:00</version_start_date>
    <version_end_date>2025-02-20 00:00:00</version_end_date>
    <filename>service.zip</filename>
    <file_size>1024</file_size>
    <oem_avidyne_e2>1</oem_avidyne_e2>
    <media>
      <card_type>2</card_type>
    </media>
  </service>
</jdm_services>
"#;

const SCRIPT: &str = "\
0 Database Update
(Script)

Loading databases, please wait...
1

1 Copy database files
(Copy)
755
nav.db

";

fn write_avidyne_payload(path: &std::path::Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    zip.start_file("service.dsf.txt", options).unwrap();
    zip.write_all(SCRIPT.as_bytes()).unwrap();
    zip.start_file("nav.db", options).unwrap();
    zip.write_all(b"NAVIGATION DATABASE PAYLOAD").unwrap();
    zip.finish().unwrap();
}

#[test]
fn test_avidyne_directory_transfer() {
    init();
    let downloads = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    write_avidyne_payload(&downloads.path().join("service.zip"));

    let catalog = Catalog::parse(AVIDYNE_CATALOG).unwrap();
    let service = &catalog.services[0];

    let options = TransferOptions {
        vol_id: Some(0x1234_5678),
        full_erase: false,
    };

    transfer_service::<UsbTransport>(
        service,
        downloads.path(),
        None,
        None,
        TransferTarget::Directory(dest.path()),
        &options,
        &mut |_| {},
    )
    .unwrap();

    // The emitted archive re-parses with the subscription's identity.
    let dsf = std::fs::read(dest.path().join("service.dsf")).unwrap();
    let (parsed, security) = SfxFile::parse_binary(&mut Cursor::new(&dsf)).unwrap();
    let security = security.unwrap();
    assert_eq!(security.cycle, "2501");
    assert_eq!(security.volume_id, 0x1234_5678);
    assert_eq!(security.remaining_transfers, 1);
    assert_eq!(parsed.sections.len(), 2);
    assert!(matches!(
        &parsed.sections[1].kind,
        SectionKind::Copy { files, .. } if files == &["nav.db"]
    ));

    // The sidecar lists the archive and seals itself.
    let sidecar = std::fs::read_to_string(dest.path().join(".jdm")).unwrap();
    assert!(JdmFile::verify(&sidecar).unwrap());
    let jdm: JdmFile = serde_json::from_str(&sidecar).unwrap();
    assert_eq!(jdm.ver, "1.1");
    assert_eq!(jdm.ss.len(), 1);
    assert_eq!(jdm.ss[0].sid, "12345678");
    assert_eq!(jdm.ss[0].v, "2501");
    assert_eq!(jdm.ss[0].f.len(), 1);
    assert_eq!(jdm.ss[0].f[0].fp, "service.dsf");
    assert_eq!(jdm.ss[0].f[0].fs, dsf.len() as u64);
    assert!(!jdm.ss[0].f[0].sh.is_empty());
    assert!(!jdm.ss[0].f[0].fh.is_empty());
}

const GARMIN_CATALOG: &str = r#"<?xml version="1.0"?>
<jdm_services>
  <service>
    <category>1</category>
    <avionics>G1000</avionics>
    <service_type>Basemap</service_type>
    <unique_service_id>87654321</unique_service_id>
    <service_code>GRM001</service_code>
    <version>2501</version>
    <version_start_date>2025-01-23 00:00:00</version_start_date>
    <version_end_date>2025-02-20 00:00:00</version_end_date>
    <filename>basemap.zip</filename>
    <file_size>1024</file_size>
    <oem_garmin>1</oem_garmin>
    <garmin_sec_id>703</garmin_sec_id>
    <avionics_id>1A2B3C4D</avionics_id>
    <media>
      <card_type>2</card_type>
      <filename>feat_unlk.dat</filename>
    </media>
  </service>
</jdm_services>
"#;

#[test]
fn test_garmin_directory_transfer() {
    init();
    let downloads = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    // A database whose trailing word closes its own checksum, plus a file
    // with no entitlement mapping.
    let mut database: Vec<u8> = (0..0x2000).map(|i| (i % 199) as u8).collect();
    let crc = feat_unlk_checksum(&database, FEAT_UNLK_SEED);
    database.extend_from_slice(&crc.to_le_bytes());

    let file = std::fs::File::create(downloads.path().join("basemap.zip")).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    zip.start_file("bmap.bin", options).unwrap();
    zip.write_all(&database).unwrap();
    zip.start_file("readme.txt", options).unwrap();
    zip.write_all(b"plain file").unwrap();
    zip.finish().unwrap();

    // The keychain archive rides into ldr_sys/ untouched.
    let keychain = downloads.path().join("grm_feat_key.zip");
    std::fs::write(&keychain, b"PK\x05\x06keychain").unwrap();

    let catalog = Catalog::parse(GARMIN_CATALOG).unwrap();
    let service = &catalog.services[0];

    let options = TransferOptions {
        vol_id: Some(0xCAFE_F00D),
        full_erase: false,
    };

    transfer_service::<UsbTransport>(
        service,
        downloads.path(),
        None,
        Some(&keychain),
        TransferTarget::Directory(dest.path()),
        &options,
        &mut |_| {},
    )
    .unwrap();

    assert_eq!(
        std::fs::read(dest.path().join("bmap.bin")).unwrap(),
        database
    );
    assert_eq!(
        std::fs::read(dest.path().join("readme.txt")).unwrap(),
        b"plain file"
    );
    assert_eq!(
        std::fs::read(dest.path().join("ldr_sys/grm_feat_key.zip")).unwrap(),
        b"PK\x05\x06keychain"
    );

    let slot = read_slot(&dest.path().join(FEAT_UNLK), Feature::Basemap).unwrap();
    assert_eq!(slot.security_id, 703);
    assert_eq!(slot.volume_id, 0xCAFE_F00D);
    assert_eq!(slot.truncated_system_id, 0x1A2B_3C4D);

    let sidecar = std::fs::read_to_string(dest.path().join(".jdm")).unwrap();
    assert!(JdmFile::verify(&sidecar).unwrap());
}

#[test]
fn test_missing_volume_id_is_rejected() {
    init();
    let downloads = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    write_avidyne_payload(&downloads.path().join("service.zip"));

    let catalog = Catalog::parse(AVIDYNE_CATALOG).unwrap();
    let result = transfer_service::<UsbTransport>(
        &catalog.services[0],
        downloads.path(),
        None,
        None,
        TransferTarget::Directory(dest.path()),
        &TransferOptions::default(),
        &mut |_| {},
    );
    assert!(result.is_err());
}

mod common;

use common::*;
use navcard::card::{CardType, DeviceError, Programmer, SkyboundDevice};

#[test]
fn test_no_card() {
    init();
    for orange in [false, true] {
        let sim = SkyboundSim::new(0, 0, 0, orange).without_card();
        let mut dev = SkyboundDevice::new(sim);
        assert!(matches!(dev.init_data_card(), Err(DeviceError::NoCard)));
    }
}

#[test]
fn test_2mb_card() {
    init();
    for orange in [false, true] {
        let sim = SkyboundSim::new(0x8900_A200, 2, 0x10, orange);
        let mut dev = SkyboundDevice::new(sim);
        dev.init_data_card().unwrap();
        let card = dev.card().unwrap();
        assert_eq!(card.card_type, CardType::NavData);
        assert_eq!(card.sectors_per_chip, 0x10);
        assert_eq!(card.name(), "2MB non-WAAS (white)");
    }
}

#[test]
fn test_4mb_card() {
    init();
    let sim = SkyboundSim::new(0x0100_AD00, 2, 0x20, false);
    let mut dev = SkyboundDevice::new(sim);
    dev.init_data_card().unwrap();
    assert_eq!(dev.card().unwrap().name(), "4MB non-WAAS (green)");
}

#[test]
fn test_6mb_card() {
    init();
    let sim = SkyboundSim::new(0x0100_AD00, 3, 0x20, false);
    let mut dev = SkyboundDevice::new(sim);
    dev.init_data_card().unwrap();
    let card = dev.card().unwrap();
    assert_eq!(card.name(), "6MB non-WAAS (green)");
    assert_eq!(card.total_sectors(), 0x60);
}

#[test]
fn test_8mb_card() {
    init();
    let sim = SkyboundSim::new(0x0100_AD00, 4, 0x20, false);
    let mut dev = SkyboundDevice::new(sim);
    dev.init_data_card().unwrap();
    assert_eq!(dev.card().unwrap().name(), "8MB non-WAAS (green)");
}

#[test]
fn test_16mb_cards() {
    init();
    for orange in [false, true] {
        let sim = SkyboundSim::new(0x0100_4100, 4, 0x40, orange);
        let mut dev = SkyboundDevice::new(sim);
        dev.init_data_card().unwrap();
        assert_eq!(dev.card().unwrap().name(), "16MB WAAS (silver)");

        let sim = SkyboundSim::new(0x8900_7E00, 4, 0x40, orange);
        let mut dev = SkyboundDevice::new(sim);
        dev.init_data_card().unwrap();
        assert_eq!(dev.card().unwrap().name(), "16MB WAAS (orange)");
    }
}

#[test]
fn test_single_chip_is_unsupported() {
    init();
    let sim = SkyboundSim::new(0x0100_AD00, 1, 0x20, false);
    let mut dev = SkyboundDevice::new(sim);
    assert!(matches!(
        dev.init_data_card(),
        Err(DeviceError::UnsupportedCard { .. })
    ));
}

#[test]
fn test_zero_chips_is_unsupported() {
    init();
    let sim = SkyboundSim::new(0, 0, 0, false);
    let mut dev = SkyboundDevice::new(sim);
    assert!(matches!(
        dev.init_data_card(),
        Err(DeviceError::UnsupportedCard { .. })
    ));
}

#[test]
fn test_unknown_iid_is_unsupported() {
    init();
    let sim = SkyboundSim::new(0x1234_5678, 4, 0x20, false);
    let mut dev = SkyboundDevice::new(sim);
    let err = dev.init_data_card().unwrap_err();
    match err {
        DeviceError::UnsupportedCard { iids } => {
            assert_eq!(iids, vec![0x1234_5678; 4]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_orange_card_needs_orange_firmware() {
    init();
    let sim = SkyboundSim::new(0x8900_7E00, 4, 0x40, false);
    let mut dev = SkyboundDevice::new(sim);
    dev.init_data_card().unwrap();
    assert!(matches!(
        dev.check_supports_write(),
        Err(DeviceError::WrongFirmware { .. })
    ));

    let sim = SkyboundSim::new(0x8900_7E00, 4, 0x40, true);
    let mut dev = SkyboundDevice::new(sim);
    dev.init_data_card().unwrap();
    dev.check_supports_write().unwrap();

    // Silver cards write under either firmware.
    let sim = SkyboundSim::new(0x0100_4100, 4, 0x40, false);
    let mut dev = SkyboundDevice::new(sim);
    dev.init_data_card().unwrap();
    dev.check_supports_write().unwrap();
}

#[test]
fn test_firmware_description() {
    init();
    let sim = SkyboundSim::new(0x0100_4100, 4, 0x40, false);
    let mut dev = SkyboundDevice::new(sim);
    assert_eq!(dev.firmware_description().unwrap(), "20071203 (G2 Black)");
}

/// Full-card write and read-back over the simulated 16 MB card: every block
/// carries a distinct fill byte, and the read pass must reproduce them all.
#[test]
fn test_16mb_write_read_back() {
    init();
    let sim = SkyboundSim::new(0x0100_4100, 4, 0x40, false);
    let mut programmer = Programmer::Skybound(SkyboundDevice::new(sim));
    programmer.init_data_card().unwrap();

    let total_sectors = programmer.total_sectors().unwrap();
    assert_eq!(total_sectors, 0x100);
    let total_size = programmer.total_size().unwrap();
    assert_eq!(total_size, 16 * 1024 * 1024);

    programmer
        .erase_sectors(0, total_sectors, &mut |_| {})
        .unwrap();

    let mut block_idx = 0u64;
    programmer
        .write_blocks(
            0,
            total_size,
            &mut |len| {
                assert_eq!(len, 0x1000);
                let fill = (block_idx % 19) as u8;
                block_idx += 1;
                Ok(vec![fill; len])
            },
            &mut |_| {},
        )
        .unwrap();
    assert_eq!(block_idx, 4096);

    let mut read_idx = 0u64;
    programmer
        .read_blocks(0, total_size, &mut |block| {
            assert_eq!(block.len(), 0x1000);
            let fill = (read_idx % 19) as u8;
            assert!(block.iter().all(|&b| b == fill), "block {} mismatch", read_idx);
            read_idx += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(read_idx, 4096);
}

/// Writing without erasing can only clear bits; the erase pass is what
/// returns a sector to all-ones.
#[test]
fn test_write_is_bitwise_and() {
    init();
    let sim = SkyboundSim::new(0x0100_4100, 4, 0x40, false);
    let mut programmer = Programmer::Skybound(SkyboundDevice::new(sim));
    programmer.init_data_card().unwrap();

    programmer
        .write_blocks(0, 0x1000, &mut |len| Ok(vec![0xF0; len]), &mut |_| {})
        .unwrap();
    programmer
        .write_blocks(0, 0x1000, &mut |len| Ok(vec![0x0F; len]), &mut |_| {})
        .unwrap();

    programmer
        .read_blocks(0, 0x1000, &mut |block| {
            assert!(block.iter().all(|&b| b == 0x00));
            Ok(())
        })
        .unwrap();

    programmer.erase_sectors(0, 1, &mut |_| {}).unwrap();
    programmer
        .read_blocks(0, 0x1000, &mut |block| {
            assert!(block.iter().all(|&b| b == 0xFF));
            Ok(())
        })
        .unwrap();
}

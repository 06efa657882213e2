//! End-to-end scenarios over small in-memory and file-backed
//! namespaces: lazy layout creation, read-after-write, block recycling,
//! and the per-block zero/error flags.

mod common;

use btt::{ArenaInfo, Btt, FileNamespace, Lane, MapEntry};
use common::{block, open_mem, reopen, small_opts, LBASIZE, NFREE, RAWSIZE};
use std::sync::Arc;

const LANE0: Lane = Lane(0);

#[test]
fn fresh_namespace_reads_zeros() {
    let (_ns, btt) = open_mem(RAWSIZE);

    assert!(!btt.laidout());
    assert!(btt.nlba() > 0);
    assert_eq!(btt.nlane(), NFREE);

    let mut buf = block(0xFF);
    btt.read(LANE0, 0, &mut buf).unwrap();
    assert_eq!(buf, block(0x00));
}

#[test]
fn first_write_creates_valid_layout() {
    let (ns, btt) = open_mem(RAWSIZE);

    btt.write(LANE0, 0, &block(0xAA)).unwrap();
    assert!(btt.laidout());

    let mut buf = block(0x00);
    btt.read(LANE0, 0, &mut buf).unwrap();
    assert_eq!(buf, block(0xAA));

    // Both info blocks validate and are byte-identical.
    let media = ns.contents();
    let info = ArenaInfo::decode(&media[..4096]).unwrap();
    assert_eq!(info.external_lbasize, LBASIZE);
    assert_eq!(info.nfree, NFREE);
    let backup_start = info.infooff as usize;
    assert_eq!(&media[..4096], &media[backup_start..backup_start + 4096]);

    // And the data survives a reopen.
    let (_ns2, btt2) = reopen(media);
    assert!(btt2.laidout());
    btt2.read(LANE0, 0, &mut buf).unwrap();
    assert_eq!(buf, block(0xAA));
}

fn map_entry_for(media: &[u8], premap_lba: u32) -> MapEntry {
    let info = ArenaInfo::decode(&media[..4096]).unwrap();
    let off = info.mapoff as usize + premap_lba as usize * 4;
    MapEntry::decode([media[off], media[off + 1], media[off + 2], media[off + 3]])
}

#[test]
fn overwrite_cycles_through_free_blocks() {
    let (ns, btt) = open_mem(RAWSIZE);
    let lba = 5;

    let mut seen_blocks = std::collections::BTreeSet::new();
    for i in 1..=NFREE + 2 {
        let lane = Lane((i - 1) % btt.nlane());
        btt.write(lane, lba, &block(i as u8)).unwrap();

        let mut buf = block(0x00);
        btt.read(lane, lba, &mut buf).unwrap();
        assert_eq!(buf, block(i as u8), "read after write {i}");

        seen_blocks.insert(map_entry_for(&ns.contents(), lba as u32).postmap_lba());
    }

    // Rotating lanes walks the whole free pool plus the original block.
    assert_eq!(seen_blocks.len() as u32, NFREE + 1);
}

#[test]
fn set_zero_clears_a_written_block() {
    let (ns, btt) = open_mem(RAWSIZE);

    btt.write(LANE0, 7, &block(0xFF)).unwrap();
    btt.set_zero(LANE0, 7).unwrap();

    let mut buf = block(0xFF);
    btt.read(LANE0, 7, &mut buf).unwrap();
    assert_eq!(buf, block(0x00));

    // The flag is on media, not just in memory.
    let (_ns2, mut btt2) = reopen(ns.contents());
    btt2.read(LANE0, 7, &mut buf).unwrap();
    assert_eq!(buf, block(0x00));
    assert!(btt2.check().unwrap());
}

#[test]
fn set_zero_before_layout_is_a_noop() {
    let (_ns, btt) = open_mem(RAWSIZE);
    btt.set_zero(LANE0, 3).unwrap();
    assert!(!btt.laidout());
}

#[test]
fn set_error_fails_reads_until_rewritten() {
    let (_ns, btt) = open_mem(RAWSIZE);

    // Forces layout creation: the flag has to be persisted somewhere.
    btt.set_error(LANE0, 9).unwrap();
    assert!(btt.laidout());

    let mut buf = block(0x00);
    let err = btt.read(LANE0, 9, &mut buf).unwrap_err();
    assert!(matches!(err, btt::BttError::BadBlock { lba: 9 }));

    // A fresh write replaces the map entry, clearing the error.
    btt.write(LANE0, 9, &block(0x42)).unwrap();
    btt.read(LANE0, 9, &mut buf).unwrap();
    assert_eq!(buf, block(0x42));
}

#[test]
fn out_of_range_lba_is_rejected() {
    let (_ns, btt) = open_mem(RAWSIZE);
    let nlba = btt.nlba();

    let mut buf = block(0x00);
    assert!(matches!(
        btt.read(LANE0, nlba, &mut buf),
        Err(btt::BttError::LbaOutOfRange { .. })
    ));
    assert!(matches!(
        btt.write(LANE0, u64::MAX, &buf),
        Err(btt::BttError::LbaOutOfRange { .. })
    ));
    assert!(matches!(
        btt.set_zero(LANE0, nlba),
        Err(btt::BttError::LbaOutOfRange { .. })
    ));
}

#[test]
fn wrong_buffer_length_is_rejected() {
    let (_ns, btt) = open_mem(RAWSIZE);
    let mut short = vec![0_u8; 100];
    assert!(matches!(
        btt.read(LANE0, 0, &mut short),
        Err(btt::BttError::BadBufferLength { .. })
    ));
    assert!(matches!(
        btt.write(LANE0, 0, &short),
        Err(btt::BttError::BadBufferLength { .. })
    ));
}

#[test]
fn out_of_range_lane_is_rejected() {
    let (_ns, btt) = open_mem(RAWSIZE);
    let mut buf = block(0x00);
    assert!(matches!(
        btt.read(Lane(btt.nlane()), 0, &mut buf),
        Err(btt::BttError::LaneOutOfRange { .. })
    ));
}

#[test]
fn too_small_namespace_is_rejected() {
    let ns = Arc::new(btt::MemNamespace::new(64 * 1024));
    let err = Btt::init(ns, small_opts(64 * 1024)).unwrap_err();
    assert!(matches!(err, btt::BttError::NamespaceTooSmall { .. }));
}

#[test]
fn file_backed_namespace_roundtrip() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let ns = Arc::new(FileNamespace::create(tmp.path(), RAWSIZE).unwrap());
    let btt = Btt::init(ns, small_opts(RAWSIZE)).unwrap();

    btt.write(LANE0, 11, &block(0x77)).unwrap();
    drop(btt);

    let ns = Arc::new(FileNamespace::open(tmp.path()).unwrap());
    let mut btt = Btt::init(ns, small_opts(RAWSIZE)).unwrap();
    let mut buf = block(0x00);
    btt.read(LANE0, 11, &mut buf).unwrap();
    assert_eq!(buf, block(0x77));
    assert!(btt.check().unwrap());
}

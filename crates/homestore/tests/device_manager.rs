//! End-to-end device layout scenarios: format, vdev creation, cold restart,
//! corruption and mismatch handling.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use homestore::device::device_manager::VdevCreateCb;
use homestore::device::virtual_dev::{BlkAllocatorType, ChunkSelectorType};
use homestore::superblk::{hs_super_blk, FirstBlock, FIRST_BLOCK_REGION};
use homestore::{
    DevInfo, DeviceManager, HsConfig, HsDevType, HsError, MultiPdevOpts, VdevParams, VirtualDev,
};
use tempfile::TempDir;

const GIB: u64 = 1 << 30;
const MIB: u64 = 1 << 20;

fn test_config() -> HsConfig {
    HsConfig::default()
}

fn make_dev_file(dir: &TempDir, name: &str, size: u64) -> PathBuf {
    let path = dir.path().join(name);
    let file = File::create(&path).expect("create dev file");
    file.set_len(size).expect("size dev file");
    path
}

fn vdev_cb() -> VdevCreateCb {
    Box::new(|info, _load_existing| VirtualDev::new(info.clone()))
}

fn striped_params(name: &str, vdev_size: u64, num_chunks: u32) -> VdevParams {
    VdevParams {
        vdev_name: name.to_string(),
        vdev_size,
        num_chunks,
        blk_size: 4096,
        dev_type: HsDevType::Data,
        multi_pdev_opts: MultiPdevOpts::AllPdevStriped,
        alloc_type: BlkAllocatorType::FixedBlk,
        chunk_sel_type: ChunkSelectorType::RoundRobin,
        context_data: Vec::new(),
    }
}

fn two_dev_manager(dir: &TempDir) -> DeviceManager {
    let a = make_dev_file(dir, "pdev_a", GIB);
    let b = make_dev_file(dir, "pdev_b", GIB);
    DeviceManager::new(
        vec![
            DevInfo::new(a, HsDevType::Data),
            DevInfo::new(b, HsDevType::Data),
        ],
        vdev_cb(),
        test_config(),
    )
    .expect("device manager")
}

#[test]
fn fresh_devices_are_first_time_boot() {
    let dir = TempDir::new().unwrap();
    let dm = two_dev_manager(&dir);
    assert!(dm.is_first_time_boot());
}

#[test]
fn format_then_striped_vdev_places_chunks_evenly() {
    let dir = TempDir::new().unwrap();
    let mut dm = two_dev_manager(&dir);
    dm.format_devices().expect("format");

    let vdev = dm
        .create_vdev(striped_params("data_vdev", 256 * MIB, 4))
        .expect("create vdev");

    // 256 MiB over 4 chunks: 64 MiB each, two per pdev.
    let chunks = vdev.primary_chunks();
    assert_eq!(chunks.len(), 4);
    for chunk in &chunks {
        assert_eq!(chunk.size(), 64 * MIB);
    }
    let on_first = chunks.iter().filter(|c| c.pdev_id() == 0).count();
    let on_second = chunks.iter().filter(|c| c.pdev_id() == 1).count();
    assert_eq!(on_first, 2);
    assert_eq!(on_second, 2);
    assert_eq!(vdev.size(), 256 * MIB);
}

#[test]
fn format_then_load_round_trip_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let (paths, vdev_id, chunk_ids) = {
        let mut dm = two_dev_manager(&dir);
        dm.format_devices().expect("format");
        let vdev = dm
            .create_vdev(striped_params("data_vdev", 256 * MIB, 4))
            .expect("create vdev");
        let chunk_ids: Vec<u32> = vdev
            .primary_chunks()
            .iter()
            .map(|c| c.chunk_id())
            .collect();
        let paths: Vec<PathBuf> = dm
            .get_pdevs()
            .iter()
            .map(|p| p.dev_name().to_path_buf())
            .collect();
        (paths, vdev.vdev_id(), chunk_ids)
    };

    let cfg = test_config();
    let max_chunks = hs_super_blk::max_chunks_in_pdev(GIB, cfg.min_chunk_size);
    let sb_region = hs_super_blk::total_size(max_chunks) as usize;
    let snapshot: Vec<Vec<u8>> = paths
        .iter()
        .map(|p| read_region(p, 0, sb_region))
        .collect();

    // Cold restart.
    let mut dm = DeviceManager::new(
        paths
            .iter()
            .map(|p| DevInfo::new(p.clone(), HsDevType::Data))
            .collect(),
        vdev_cb(),
        cfg,
    )
    .expect("device manager");
    assert!(!dm.is_first_time_boot());
    dm.load_devices().expect("load");

    let vdev = dm.get_vdev(vdev_id).expect("vdev reloaded");
    let mut reloaded: Vec<u32> = vdev.primary_chunks().iter().map(|c| c.chunk_id()).collect();
    let mut expected = chunk_ids.clone();
    reloaded.sort_unstable();
    expected.sort_unstable();
    assert_eq!(reloaded, expected);

    // Loading must not have rewritten a single metadata byte.
    for (path, before) in paths.iter().zip(&snapshot) {
        let after = read_region(path, 0, sb_region);
        assert_eq!(&after, before, "superblock region changed on {path:?}");
    }
}

#[test]
fn corrupt_vdev_slot_fails_load() {
    let dir = TempDir::new().unwrap();
    let paths = {
        let mut dm = two_dev_manager(&dir);
        dm.format_devices().expect("format");
        dm.create_vdev(striped_params("data_vdev", 64 * MIB, 2))
            .expect("create vdev");
        dm.get_pdevs()
            .iter()
            .map(|p| p.dev_name().to_path_buf())
            .collect::<Vec<_>>()
    };

    // Flip one bit inside vdev slot 0 on the first device.
    let victim = &paths[0];
    let file = File::options().write(true).read(true).open(victim).unwrap();
    let offset = hs_super_blk::vdev_sb_offset() + 20;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset).unwrap();
    byte[0] ^= 0x04;
    file.write_all_at(&byte, offset).unwrap();

    let mut dm = DeviceManager::new(
        paths
            .iter()
            .map(|p| DevInfo::new(p.clone(), HsDevType::Data))
            .collect(),
        vdev_cb(),
        test_config(),
    )
    .expect("device manager");
    assert!(matches!(
        dm.load_devices(),
        Err(HsError::CorruptSuperblock(_))
    ));
}

#[test]
fn device_count_change_fails_load() {
    let dir = TempDir::new().unwrap();
    let paths = {
        let mut dm = two_dev_manager(&dir);
        dm.format_devices().expect("format");
        dm.get_pdevs()
            .iter()
            .map(|p| p.dev_name().to_path_buf())
            .collect::<Vec<_>>()
    };

    let extra = make_dev_file(&dir, "pdev_c", GIB);
    let mut devs: Vec<DevInfo> = paths
        .iter()
        .map(|p| DevInfo::new(p.clone(), HsDevType::Data))
        .collect();
    devs.push(DevInfo::new(extra, HsDevType::Data));

    let mut dm = DeviceManager::new(devs, vdev_cb(), test_config()).expect("device manager");
    assert!(!dm.is_first_time_boot());
    assert!(matches!(
        dm.load_devices(),
        Err(HsError::NumDevicesMismatch {
            formatted: 2,
            given: 3
        })
    ));
}

#[test]
fn foreign_device_fails_with_uuid_mismatch() {
    let dir = TempDir::new().unwrap();

    // Two independently formatted single-device systems.
    let a = make_dev_file(&dir, "sys1_dev", GIB);
    let b = make_dev_file(&dir, "sys2_dev", GIB);
    for path in [&a, &b] {
        let mut dm = DeviceManager::new(
            vec![DevInfo::new(path.clone(), HsDevType::Data)],
            vdev_cb(),
            test_config(),
        )
        .unwrap();
        dm.format_devices().expect("format");
    }

    // Mixing them must trip the uuid check (via the count check first if the
    // formatted num_pdevs differs; here both recorded one device, so the
    // count matches and the uuid is the discriminator).
    let mut dm = DeviceManager::new(
        vec![
            DevInfo::new(a, HsDevType::Data),
            DevInfo::new(b, HsDevType::Data),
        ],
        vdev_cb(),
        test_config(),
    )
    .unwrap();
    let err = dm.load_devices().expect_err("mixed systems must not load");
    assert!(matches!(
        err,
        HsError::SystemUuidMismatch { .. } | HsError::NumDevicesMismatch { .. }
    ));
}

#[test]
fn reformat_bumps_generation_number() {
    let dir = TempDir::new().unwrap();
    let path = make_dev_file(&dir, "pdev", GIB);

    for expected_gen in 1..=3u64 {
        let mut dm = DeviceManager::new(
            vec![DevInfo::new(path.clone(), HsDevType::Data)],
            vdev_cb(),
            test_config(),
        )
        .unwrap();
        dm.format_devices().expect("format");
        drop(dm);

        let raw = read_region(&path, 0, FIRST_BLOCK_REGION);
        let fb = FirstBlock::decode_from(&raw).expect("decode");
        assert!(fb.is_valid());
        assert_eq!(fb.hdr.gen_number, expected_gen);
    }
}

#[test]
fn mirrored_vdev_pairs_chunks_across_pdevs() {
    let dir = TempDir::new().unwrap();
    let mut dm = two_dev_manager(&dir);
    dm.format_devices().expect("format");

    let mut params = striped_params("mirror_vdev", 64 * MIB, 2);
    params.multi_pdev_opts = MultiPdevOpts::AllPdevMirrored;
    let vdev = dm.create_vdev(params).expect("create vdev");

    // 2 chunks round up to streams(pdev0)=2, times 2 pdevs: 4 chunks total,
    // 2 primaries mirrored 1:1 on the other device.
    assert_eq!(vdev.num_chunks(), 4);
    let primaries = vdev.primary_chunks();
    assert_eq!(primaries.len(), 2);
    assert!(primaries.iter().all(|c| c.pdev_id() == 0));
    assert_eq!(vdev.info().num_mirrors, 2);
}

#[test]
fn single_pdev_vdev_stays_on_one_device() {
    let dir = TempDir::new().unwrap();
    let mut dm = two_dev_manager(&dir);
    dm.format_devices().expect("format");

    let mut params = striped_params("single_vdev", 64 * MIB, 2);
    params.multi_pdev_opts = MultiPdevOpts::SingleFirstPdev;
    let vdev = dm.create_vdev(params).expect("create vdev");

    let chunks = vdev.primary_chunks();
    assert_eq!(chunks.len(), 2);
    let pdev_id = chunks[0].pdev_id();
    assert!(chunks.iter().all(|c| c.pdev_id() == pdev_id));
}

#[test]
fn vdev_id_space_exhaustion_is_out_of_room() {
    let dir = TempDir::new().unwrap();
    let mut dm = two_dev_manager(&dir);
    dm.format_devices().expect("format");

    for i in 0..16 {
        let mut params = striped_params(&format!("vdev_{i}"), 16 * MIB, 1);
        params.multi_pdev_opts = MultiPdevOpts::SingleFirstPdev;
        dm.create_vdev(params).expect("create vdev");
    }
    let mut params = striped_params("one_too_many", 16 * MIB, 1);
    params.multi_pdev_opts = MultiPdevOpts::SingleFirstPdev;
    assert!(matches!(
        dm.create_vdev(params),
        Err(HsError::OutOfRoom(_))
    ));
}

#[test]
fn vdev_size_is_rounded_to_chunk_multiple() {
    let dir = TempDir::new().unwrap();
    let mut dm = two_dev_manager(&dir);
    dm.format_devices().expect("format");

    // 100 MiB does not divide into 4 chunks of whole blocks x chunk count;
    // the size must round up to the next num_chunks * blk_size multiple.
    let vdev = dm
        .create_vdev(striped_params("rounded_vdev", 100 * MIB + 5, 4))
        .expect("create vdev");
    assert_eq!(vdev.size() % (4 * 4096), 0);
    assert!(vdev.size() > 100 * MIB);
}

#[test]
fn failed_vdev_create_rolls_back_cleanly() {
    let dir = TempDir::new().unwrap();
    // A large and a small device: the striped create succeeds on the first
    // pdev and runs out of space on the second.
    let a = make_dev_file(&dir, "pdev_big", GIB);
    let b = make_dev_file(&dir, "pdev_small", 64 * MIB);
    let mut dm = DeviceManager::new(
        vec![
            DevInfo::new(a, HsDevType::Data),
            DevInfo::new(b, HsDevType::Data),
        ],
        vdev_cb(),
        test_config(),
    )
    .expect("device manager");
    dm.format_devices().expect("format");

    let err = dm
        .create_vdev(striped_params("too_big", 512 * MIB, 2))
        .expect_err("small pdev cannot hold 128 MiB chunks");
    assert!(matches!(err, HsError::NoSpace(_)));

    // The chunks created on the big pdev were handed back: its list is one
    // free chunk again, and no vdev is registered.
    let big = dm
        .get_pdevs()
        .into_iter()
        .find(|p| p.pdev_id() == 0)
        .expect("big pdev");
    let list = big.chunk_list_snapshot();
    assert_eq!(list.len(), 1);
    assert!(!list[0].3, "rolled-back space must be free");
    assert!(dm.get_vdev(0).is_none());

    // A retry that fits gets a clean id space back.
    let vdev = dm
        .create_vdev(striped_params("retry_fits", 64 * MIB, 2))
        .expect("retry");
    assert_eq!(vdev.vdev_id(), 0);
    assert_eq!(vdev.primary_chunks().len(), 4);
}

fn read_region(path: &PathBuf, offset: u64, len: usize) -> Vec<u8> {
    let file = File::open(path).expect("open");
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset).expect("read");
    buf
}

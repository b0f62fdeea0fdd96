//! Memory mapping through the device surface
//!
//! Page-table geometry, rollback on every failure path, identifier reuse,
//! and scatter-gather splitting, all against the simulated platform.

use gna_chip::descriptor::{
    mmu, page_number, required_pt_entries, required_pt_segments, MAX_MAP_SIZE, MAX_PT_SEGMENTS,
    MMU_CONFIG_OFFSET, PAGE_SIZE, PT_ENTRIES_PER_SEGMENT,
};
use gna_driver::platform::SgElement;
use gna_driver::sim::SimulatedDevice;
use gna_driver::{DriverConfig, GnaError, PlatformError, PollPolicy, RegistryScope};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const BASE: u64 = 0x100_0000;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> DriverConfig {
    init_logging();
    DriverConfig::default().with_poll(PollPolicy::new(16, Duration::ZERO))
}

fn started(config: DriverConfig) -> SimulatedDevice {
    SimulatedDevice::started(config).expect("simulated device starts")
}

fn le32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

#[test]
fn page_table_geometry_follows_length() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 8 << 20);
    let session = sim.device.open_session();

    for length in [1, PAGE_SIZE, 3 * PAGE_SIZE + 5, 1 << 20, (4 << 20) + PAGE_SIZE, 8 << 20] {
        let id = sim.device.map(&session, BASE, length).unwrap();
        let context = session.memory(id).unwrap();

        let entries = required_pt_entries(length);
        assert_eq!(context.segment_count(), required_pt_segments(entries));
        assert_eq!(
            context.segment_count(),
            entries.div_ceil(PT_ENTRIES_PER_SEGMENT),
            "length {length}"
        );
        assert!(context.page_table_entries().len() >= entries);
        assert_eq!(context.mmu_config().page_directory.len(), context.segment_count());
        assert_eq!(context.mmu_config().vamaxaddr as usize, length - 1);

        sim.device.unmap(&session, id).unwrap();
    }
    assert_eq!(sim.platform.live_pins(), 0);
    assert_eq!(sim.platform.live_allocations(), 0);
}

#[test]
fn largest_mapping_fills_the_page_directory() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, MAX_MAP_SIZE);
    let session = sim.device.open_session();

    let id = sim.device.map(&session, BASE, MAX_MAP_SIZE).unwrap();
    let context = session.memory(id).unwrap();
    assert_eq!(context.segment_count(), MAX_PT_SEGMENTS);
    // segments plus the descriptor page
    assert_eq!(sim.platform.live_allocations(), MAX_PT_SEGMENTS + 1);
}

#[test]
fn rejected_requests_leave_nothing_allocated() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    let session = sim.device.open_session();

    assert_eq!(
        sim.device.map(&session, BASE, 0),
        Err(GnaError::InvalidSize {
            size: 0,
            max: MAX_MAP_SIZE
        })
    );
    assert!(matches!(
        sim.device.map(&session, BASE, MAX_MAP_SIZE + PAGE_SIZE),
        Err(GnaError::InvalidSize { .. })
    ));
    assert!(matches!(
        sim.device.map(&session, 0, PAGE_SIZE),
        Err(GnaError::NullArgument { .. })
    ));
    assert_eq!(
        sim.device.map(&session, BASE + 8, PAGE_SIZE),
        Err(GnaError::BadAlignment { address: BASE + 8 })
    );
    // outside every user region: pinning fails
    assert!(matches!(
        sim.device.map(&session, BASE + 0x100_0000, PAGE_SIZE),
        Err(GnaError::MappingFailure { .. })
    ));

    assert_eq!(sim.platform.live_pins(), 0);
    assert_eq!(sim.platform.live_allocations(), 0);
    assert_eq!(session.mapped_count(), 0);
}

#[test]
fn allocation_failure_rolls_back_the_pin() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    let session = sim.device.open_session();

    // the page-table segment succeeds, the descriptor page does not
    sim.platform.fail_allocation_after(1);
    assert!(matches!(
        sim.device.map(&session, BASE, 4 * PAGE_SIZE),
        Err(GnaError::MappingFailure { .. })
    ));
    assert_eq!(sim.platform.live_pins(), 0);
    assert_eq!(sim.platform.live_allocations(), 0);

    sim.platform.fail_allocation_after(usize::MAX);
    assert_eq!(sim.device.map(&session, BASE, 4 * PAGE_SIZE), Ok(1));
}

#[test]
fn map_unmap_map_reuses_the_identifier() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    let session = sim.device.open_session();

    let first = sim.device.map(&session, BASE, 2 * PAGE_SIZE).unwrap();
    let context = session.memory(first).unwrap();

    sim.device.unmap(&session, first).unwrap();
    assert!(context.is_released());
    assert!(context.descriptor_bytes().is_empty());
    sim.device.unmap(&session, first).unwrap();

    let second = sim.device.map(&session, BASE, 2 * PAGE_SIZE).unwrap();
    assert_eq!(first, second);
    assert_eq!(session.mapped_count(), 1);
    assert_eq!(sim.platform.live_pins(), 1);
    assert!(!session.memory(second).unwrap().is_released());
}

#[test]
fn unmapping_an_unknown_identifier_is_a_no_op() {
    let sim = started(config());
    let session = sim.device.open_session();
    assert_eq!(sim.device.unmap(&session, 42), Ok(()));
}

#[test]
fn legacy_registry_holds_one_model() {
    let sim = started(config().with_registry_scope(RegistryScope::Single));
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    let session = sim.device.open_session();

    sim.device.map(&session, BASE, PAGE_SIZE).unwrap();
    assert_eq!(
        sim.device.map(&session, BASE + PAGE_SIZE as u64, PAGE_SIZE),
        Err(GnaError::RegistryFull { capacity: 1 })
    );
    assert_eq!(sim.platform.live_pins(), 1);
}

#[test]
fn sessions_have_independent_identifiers() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    let a = sim.device.open_session();
    let b = sim.device.open_session();

    assert_eq!(sim.device.map(&a, BASE, PAGE_SIZE), Ok(1));
    assert_eq!(sim.device.map(&b, BASE + PAGE_SIZE as u64, PAGE_SIZE), Ok(1));
    assert!(b.memory(2).is_none());
}

#[test]
fn scatter_gather_runs_split_into_page_entries() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 6 * PAGE_SIZE);
    sim.platform.set_scatter_gather(vec![
        SgElement::new(0x2000_0000, 3 * PAGE_SIZE),
        SgElement::new(0x1000_0000, PAGE_SIZE),
        SgElement::new(0x3000_0000, 2 * PAGE_SIZE),
    ]);
    let session = sim.device.open_session();

    let id = sim.device.map(&session, BASE, 6 * PAGE_SIZE).unwrap();
    let entries = session.memory(id).unwrap().page_table_entries();

    let hi = page_number(0x2000_0000);
    let lo = page_number(0x1000_0000);
    let top = page_number(0x3000_0000);
    assert_eq!(&entries[..6], &[hi, hi + 1, hi + 2, lo, top, top + 1]);
    assert_eq!(entries.len(), PT_ENTRIES_PER_SEGMENT);
    assert!(entries[6..].iter().all(|&entry| entry == top + 1));
}

#[test]
fn short_scatter_gather_list_fails_cleanly() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    sim.platform
        .set_scatter_gather(vec![SgElement::new(0x2000_0000, 2 * PAGE_SIZE)]);
    let session = sim.device.open_session();

    assert!(matches!(
        sim.device.map(&session, BASE, 4 * PAGE_SIZE),
        Err(GnaError::MappingFailure { .. })
    ));
    assert_eq!(sim.platform.live_pins(), 0);
    assert_eq!(sim.platform.live_allocations(), 0);
}

#[test]
fn descriptor_carries_the_mmu_configuration() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    let session = sim.device.open_session();

    let id = sim.device.map(&session, BASE, 3 * PAGE_SIZE).unwrap();
    let context = session.memory(id).unwrap();
    let descriptor = context.descriptor_bytes();
    let mmu_block = &descriptor[MMU_CONFIG_OFFSET..];

    assert_eq!(le32(mmu_block, mmu::VAMAXADDR) as usize, 3 * PAGE_SIZE - 1);
    let directory = context.mmu_config().page_directory;
    for (slot, number) in directory.iter().enumerate() {
        assert_eq!(le32(mmu_block, mmu::PAGE_DIR + slot * 4), *number);
    }
    assert_eq!(context.descriptor_address() % PAGE_SIZE as u64, 0);
}

#[test]
fn unlock_access_violation_is_tolerated() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, PAGE_SIZE);
    sim.platform.fail_unlock_with(PlatformError::AccessViolation);
    let session = sim.device.open_session();

    let id = sim.device.map(&session, BASE, PAGE_SIZE).unwrap();
    assert_eq!(sim.device.unmap(&session, id), Ok(()));
    assert_eq!(sim.platform.live_pins(), 0);
    assert_eq!(sim.platform.live_allocations(), 0);
}

#[test]
fn closing_a_session_releases_every_mapping() {
    let sim = started(config());
    sim.platform.add_user_region(BASE, 4 * PAGE_SIZE);
    let session = sim.device.open_session();
    for slot in 0..3u64 {
        sim.device
            .map(&session, BASE + slot * PAGE_SIZE as u64, PAGE_SIZE)
            .unwrap();
    }
    assert_eq!(sim.platform.live_pins(), 3);

    sim.device.close_session(&session);
    assert_eq!(session.mapped_count(), 0);
    assert_eq!(sim.platform.live_pins(), 0);
    assert_eq!(sim.platform.live_allocations(), 0);
    assert!(matches!(
        sim.device.map(&session, BASE, PAGE_SIZE),
        Err(GnaError::InvalidParameter { .. })
    ));
}

//! Coordinator protocol: command lifecycle, generation invariants and cell
//! ownership.

use fields::{BufferKey, GridDecomposition};
use orchestrator::{
    Command, CommandFlags, CommandType, DeviceMap, GenerationTable, GlobalData, GlobalDeviceId,
    Phase, StateError, Topology, WorkerReport,
};
use proptest::prelude::*;

fn grid() -> GridDecomposition {
    GridDecomposition::from_cells([0.0; 3], [1.0; 3], [4, 4, 4]).unwrap()
}

/// Coordinator with two devices and a slab map across x
fn two_device_state() -> GlobalData {
    let mut gdata = GlobalData::new(Topology::new(2, 1, 0).unwrap(), grid(), 1e-3);
    let map = DeviceMap::slabs(gdata.grid(), 0, 2);
    gdata.record_device_map(map).unwrap();
    gdata
}

fn reports(devices: usize) -> Vec<WorkerReport> {
    (0..devices).map(WorkerReport::new).collect()
}

#[test]
fn quit_after_dump_is_terminal() {
    let mut gdata = two_device_state();

    let dump = Command::new(CommandType::Dump)
        .with_buffers(BufferKey::POS_VEL_INFO)
        .with_flags(CommandFlags::DBLBUFFER_READ);
    gdata.issue_command(dump).unwrap();

    // QUIT cannot overtake the pending dump
    assert!(matches!(
        gdata.issue_command(Command::new(CommandType::Quit)),
        Err(StateError::CommandInFlight { .. })
    ));
    gdata.complete_command(&reports(2)).unwrap();
    assert_eq!(gdata.phase(), Phase::Idle);

    gdata.issue_command(Command::new(CommandType::Quit)).unwrap();
    gdata.complete_command(&reports(2)).unwrap();
    assert_eq!(gdata.phase(), Phase::Quit);
    assert!(gdata.is_terminated());

    for kind in [CommandType::Idle, CommandType::CalcHash, CommandType::Quit] {
        assert_eq!(
            gdata.issue_command(Command::new(kind)).unwrap_err(),
            StateError::Terminated
        );
    }
    assert_eq!(
        gdata.swap_generation(BufferKey::POS),
        Err(StateError::Terminated)
    );
    assert_eq!(gdata.last_command().kind, CommandType::Quit);
}

#[test]
fn context_carries_published_state() {
    let mut gdata = two_device_state();
    gdata.swap_generation(BufferKey::VEL).unwrap();
    gdata.advance_clock();

    let ctx = gdata
        .issue_command(Command::new(CommandType::Euler).with_arg(5e-4))
        .unwrap();
    assert_eq!(ctx.command.extra_arg, Some(5e-4));
    assert_eq!(ctx.generations.read_index(BufferKey::VEL), 1);
    assert_eq!(ctx.generations.read_index(BufferKey::POS), 0);
    assert_eq!(ctx.iteration, 1);
    assert!(ctx.device_map.is_some());
    assert_eq!(ctx.grid.grid_size(), [4, 4, 4]);
}

#[test]
fn stop_request_is_observable_through_shared_flag() {
    let gdata = two_device_state();
    let flag = gdata.stop_flag();
    assert!(!gdata.is_stop_requested());
    std::thread::spawn(move || flag.request()).join().unwrap();
    assert!(gdata.is_stop_requested());
}

#[test]
fn counts_and_dt_flow_through_reports() {
    let mut gdata = two_device_state();
    gdata.issue_command(Command::new(CommandType::Reorder)).unwrap();
    let mut r = reports(2);
    r[0].particles = Some(100);
    r[1].particles = Some(60);
    gdata.complete_command(&r).unwrap();
    assert_eq!(gdata.start_per_device(), &[0, 100]);
    assert_eq!(gdata.total_particles(), 160);

    gdata.issue_command(Command::new(CommandType::Forces)).unwrap();
    let mut r = reports(2);
    r[0].dt = Some(3e-4);
    r[1].dt = Some(2e-4);
    gdata.complete_command(&r).unwrap();
    assert_eq!(gdata.take_min_dt(), Some(2e-4));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any sequence of swaps keeps read != write for every quantity
    #[test]
    fn generations_never_alias(swaps in prop::collection::vec(any::<u64>(), 0..40)) {
        let mut table = GenerationTable::new();
        for bits in swaps {
            table.swap(BufferKey::from_bits_truncate(bits));
            prop_assert!(table.is_consistent());
        }
        for (_, generation) in table.iter() {
            prop_assert!(generation.read() < 2 && generation.write() < 2);
            prop_assert_ne!(generation.read(), generation.write());
        }
    }

    /// Owner of an inside position is the map value of its cell
    #[test]
    fn device_owning_matches_map(
        x in 0.0f32..4.0,
        y in 0.0f32..4.0,
        z in 0.0f32..4.0,
    ) {
        let gdata = two_device_state();
        let grid = gdata.grid();
        let hash = grid.linear_hash(grid.cell_of([x, y, z]));
        let expected = gdata.device_map().unwrap().owner(hash);
        prop_assert_eq!(gdata.device_owning([x, y, z]), expected);
        let device = if x < 2.0 { 0 } else { 1 };
        prop_assert_eq!(expected, Some(GlobalDeviceId::new(0, device)));
    }

    /// A single-device run owns every position, even outside the world
    #[test]
    fn single_device_shortcut(x in -10.0f32..10.0, y in -10.0f32..10.0, z in -10.0f32..10.0) {
        let gdata = GlobalData::new(Topology::single(), grid(), 1e-3);
        prop_assert_eq!(gdata.device_owning([x, y, z]), Some(GlobalDeviceId::default()));
    }
}

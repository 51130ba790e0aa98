//! Partitioning of device selections into per-platform contexts.

use std::collections::HashSet;

use clpool::prelude::*;
use clpool::{ContextHandle, SimulatedDriver};

fn runtime(topology: SimulatedTopology) -> Runtime<SimulatedDriver> {
    Runtime::new(SimulatedDriver::new(topology), RuntimeConfig::default()).unwrap()
}

fn two_platforms() -> Runtime<SimulatedDriver> {
    runtime(
        SimulatedTopology::new()
            .platform("Sim A", &["A0", "A1", "A2"])
            .platform("Sim B", &["B0", "B1"]),
    )
}

#[test]
fn selection_across_two_platforms_yields_two_contexts() {
    let rt = two_platforms();
    let session = rt.init_session();
    let devices = rt.device_handles();

    let report = rt
        .create_contexts(session, &[devices[1], devices[3]])
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.created.len(), 2);

    let records = rt.session_contexts(session).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].devices, vec![devices[1]]);
    assert_eq!(records[1].devices, vec![devices[3]]);
    assert_ne!(records[0].platform, records[1].platform);
}

#[test]
fn non_overlapping_selections_map_each_device_once() {
    let rt = two_platforms();
    let session = rt.init_session();
    let devices = rt.device_handles();

    rt.create_contexts(session, &[devices[0], devices[3]]).unwrap();
    rt.create_contexts(session, &[devices[1], devices[4]]).unwrap();

    let records = rt.session_contexts(session).unwrap();
    assert_eq!(records.len(), 4);

    let selected = [devices[0], devices[1], devices[3], devices[4]];
    let catalog = rt.discover();
    for device in selected {
        let context = rt.resolve_context(device, session).unwrap();
        let owners: Vec<_> = records
            .iter()
            .filter(|r| r.devices.contains(&device))
            .collect();
        assert_eq!(owners.len(), 1, "device {device} placed more than once");
        assert_eq!(owners[0].context, context);

        // Every member of the owning context shares one platform.
        let platforms: HashSet<_> = owners[0]
            .devices
            .iter()
            .map(|d| catalog.device(*d).unwrap().platform())
            .collect();
        assert_eq!(platforms.len(), 1);
    }

    assert!(matches!(
        rt.resolve_context(devices[2], session),
        Err(ComputeError::NoContextForDevice(_))
    ));
}

#[test]
fn repartitioning_a_mapped_device_is_rejected() {
    let rt = runtime(SimulatedTopology::new().platform("Sim", &["D1", "D2"]));
    let session = rt.init_session();
    let devices = rt.device_handles();

    let first = rt.create_contexts(session, &devices).unwrap();
    assert_eq!(first.created.len(), 1);
    let owner = rt.resolve_context(devices[0], session).unwrap();

    let second = rt.create_contexts(session, &devices[..1]).unwrap();
    assert!(second.created.is_empty());
    assert_eq!(second.already_mapped, vec![devices[0]]);

    assert_eq!(rt.session_contexts(session).unwrap().len(), 1);
    assert_eq!(rt.resolve_context(devices[0], session).unwrap(), owner);
    assert_eq!(rt.driver().stats().contexts_created, 1);
}

#[test]
fn sessions_do_not_share_mappings() {
    let rt = two_platforms();
    let devices = rt.device_handles();
    let first = rt.init_session();
    let second = rt.init_session();

    rt.create_contexts(first, &devices[..1]).unwrap();
    assert!(rt.resolve_context(devices[0], second).is_err());

    let report = rt.create_contexts(second, &devices[..1]).unwrap();
    assert_eq!(report.created.len(), 1);
    assert_ne!(
        rt.resolve_context(devices[0], first).unwrap(),
        rt.resolve_context(devices[0], second).unwrap()
    );
}

#[test]
fn unknown_devices_are_reported_and_skipped() {
    let rt = two_platforms();
    let session = rt.init_session();
    let devices = rt.device_handles();
    let bogus = DeviceHandle::from_index(42);

    let report = rt.create_contexts(session, &[bogus, devices[0]]).unwrap();
    assert_eq!(report.unknown, vec![bogus]);
    assert_eq!(report.created.len(), 1);
}

#[test]
fn failure_on_one_platform_does_not_abort_others() {
    let rt = runtime(
        SimulatedTopology::new()
            .platform("Broken", &["X0"])
            .platform("Sim B", &["B0"])
            .failing_context(0),
    );
    let session = rt.init_session();
    let devices = rt.device_handles();

    let report = rt.create_contexts(session, &devices).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.created.len(), 1);
    assert!(rt.resolve_context(devices[0], session).is_err());
    assert!(rt.resolve_context(devices[1], session).is_ok());
}

#[test]
fn empty_catalog_yields_empty_results() {
    let rt = runtime(SimulatedTopology::new());
    assert_eq!(rt.find_platforms(), 0);
    assert!(rt.device_handles().is_empty());

    let session = rt.init_session();
    let report = rt.create_contexts(session, &[]).unwrap();
    assert!(report.created.is_empty());
    assert!(rt.build_program(session, "kernel void f() {}").unwrap().is_empty());
}

#[test]
fn context_handles_are_distinct_across_calls() {
    let rt = two_platforms();
    let session = rt.init_session();
    let devices = rt.device_handles();

    let a = rt.create_contexts(session, &devices[..2]).unwrap();
    let b = rt.create_contexts(session, &devices[2..]).unwrap();
    let all: HashSet<ContextHandle> = a.created.iter().chain(&b.created).copied().collect();
    assert_eq!(all.len(), 3);
}

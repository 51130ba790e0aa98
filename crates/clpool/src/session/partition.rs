//! Context partitioning.
//!
//! A device selection may span several platforms, but a context can only
//! hold devices of one platform. Partitioning splits the selection into one
//! group per platform, keeping each group in catalog order, and sets aside
//! devices that cannot be placed.

use std::collections::HashSet;

use crate::error::ComputeError;
use crate::handle::{ContextHandle, DeviceHandle, PlatformHandle};

use super::DeviceContextMap;

/// Devices of one platform that go into a single new context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformGroup {
    /// Platform shared by every device of the group.
    pub platform: PlatformHandle,
    /// Member devices in catalog order.
    pub devices: Vec<DeviceHandle>,
}

/// Grouping of a selection, computed before any context is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Non-empty groups in platform order.
    pub groups: Vec<PlatformGroup>,
    /// Selected devices the catalog does not know.
    pub unknown: Vec<DeviceHandle>,
    /// Selected devices that already have an owning context.
    pub already_mapped: Vec<DeviceHandle>,
}

/// Split `selection` into per-platform groups.
///
/// `layout` lists every platform with its devices, both in catalog order.
/// Repeated entries in the selection are placed once.
pub fn plan_partition<'a, I>(
    layout: I,
    selection: &[DeviceHandle],
    mapping: &DeviceContextMap,
) -> PartitionPlan
where
    I: IntoIterator<Item = (PlatformHandle, &'a [DeviceHandle])>,
{
    let layout: Vec<_> = layout.into_iter().collect();
    let known: HashSet<DeviceHandle> = layout
        .iter()
        .flat_map(|(_, devices)| devices.iter().copied())
        .collect();

    let mut plan = PartitionPlan::default();
    let mut seen = HashSet::new();
    let mut wanted = HashSet::new();

    for &device in selection {
        if !seen.insert(device) {
            continue;
        }
        if !known.contains(&device) {
            plan.unknown.push(device);
        } else if mapping.contains(device) {
            plan.already_mapped.push(device);
        } else {
            wanted.insert(device);
        }
    }

    for (platform, devices) in layout {
        let members: Vec<DeviceHandle> = devices
            .iter()
            .copied()
            .filter(|d| wanted.contains(d))
            .collect();
        if !members.is_empty() {
            plan.groups.push(PlatformGroup {
                platform,
                devices: members,
            });
        }
    }
    plan
}

/// Outcome of partitioning a selection into contexts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionReport {
    /// Contexts created, in platform order.
    pub created: Vec<ContextHandle>,
    /// Platforms whose context creation failed, with the failure.
    pub failed: Vec<(PlatformHandle, ComputeError)>,
    /// Selected devices the catalog does not know.
    pub unknown: Vec<DeviceHandle>,
    /// Selected devices rejected because they already have a context.
    pub already_mapped: Vec<DeviceHandle>,
}

impl PartitionReport {
    /// Whether every selected device was placed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.unknown.is_empty() && self.already_mapped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;

    fn dev(i: usize) -> DeviceHandle {
        DeviceHandle::from_index(i)
    }

    fn layout() -> Vec<(PlatformHandle, Vec<DeviceHandle>)> {
        vec![
            (PlatformHandle::from_index(0), vec![dev(0), dev(1)]),
            (PlatformHandle::from_index(1), vec![dev(2), dev(3), dev(4)]),
        ]
    }

    fn plan(selection: &[DeviceHandle], mapping: &DeviceContextMap) -> PartitionPlan {
        let layout = layout();
        plan_partition(
            layout.iter().map(|(p, d)| (*p, d.as_slice())),
            selection,
            mapping,
        )
    }

    #[test]
    fn test_groups_follow_catalog_order() {
        let plan = plan(&[dev(4), dev(1), dev(2)], &DeviceContextMap::new());
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.groups[0].devices, vec![dev(1)]);
        assert_eq!(plan.groups[1].devices, vec![dev(2), dev(4)]);
    }

    #[test]
    fn test_empty_platforms_are_skipped() {
        let plan = plan(&[dev(3)], &DeviceContextMap::new());
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].platform, PlatformHandle::from_index(1));
    }

    #[test]
    fn test_unknown_and_repeated() {
        let plan = plan(&[dev(0), dev(0), dev(9)], &DeviceContextMap::new());
        assert_eq!(plan.groups[0].devices, vec![dev(0)]);
        assert_eq!(plan.unknown, vec![dev(9)]);
    }

    #[test]
    fn test_mapped_devices_are_rejected() {
        let mut mapping = DeviceContextMap::new();
        mapping.insert(dev(0), ContextHandle::from_index(0));

        let plan = plan(&[dev(0), dev(1)], &mapping);
        assert_eq!(plan.already_mapped, vec![dev(0)]);
        assert_eq!(plan.groups[0].devices, vec![dev(1)]);
    }

    #[test]
    fn test_empty_selection() {
        let plan = plan(&[], &DeviceContextMap::new());
        assert!(plan.groups.is_empty());
        assert!(plan.unknown.is_empty());
    }
}

//! Caller sessions.
//!
//! A [`Session`] is the per-caller state of the runtime: the contexts it
//! created, in creation order, and the mapping from each placed device to
//! its owning context. Sessions share the process-wide catalog but never
//! each other's contexts.

mod mapping;
mod partition;

pub use mapping::DeviceContextMap;
pub use partition::{plan_partition, PartitionPlan, PartitionReport, PlatformGroup};

use crate::error::ComputeResult;
use crate::handle::{ContextHandle, DeviceHandle, PlatformHandle};

/// One context created for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRecord {
    /// The context.
    pub context: ContextHandle,
    /// Platform shared by every member device.
    pub platform: PlatformHandle,
    /// Member devices in catalog order.
    pub devices: Vec<DeviceHandle>,
}

impl ContextRecord {
    /// Number of member devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// Contexts and device mapping owned by one caller.
#[derive(Debug, Clone, Default)]
pub struct Session {
    records: Vec<ContextRecord>,
    mapping: DeviceContextMap,
}

impl Session {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new context and map its devices to it.
    ///
    /// Devices must not already be mapped; partitioning guarantees this.
    pub fn add_record(&mut self, record: ContextRecord) {
        for &device in &record.devices {
            let placed = self.mapping.insert(device, record.context);
            debug_assert!(placed, "device {} mapped twice", device);
        }
        self.records.push(record);
    }

    /// Context records in creation order.
    pub fn records(&self) -> &[ContextRecord] {
        &self.records
    }

    /// Contexts in creation order.
    pub fn contexts(&self) -> impl Iterator<Item = ContextHandle> + '_ {
        self.records.iter().map(|r| r.context)
    }

    /// Device mapping of this session.
    pub fn mapping(&self) -> &DeviceContextMap {
        &self.mapping
    }

    /// Owning context of a device.
    pub fn resolve(&self, device: DeviceHandle) -> ComputeResult<ContextHandle> {
        self.mapping.resolve(device)
    }

    /// Whether the session owns no context.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Handle;

    #[test]
    fn test_records_and_mapping_stay_in_step() {
        let mut session = Session::new();
        let ctx = ContextHandle::from_index(0);
        let d0 = DeviceHandle::from_index(0);
        let d1 = DeviceHandle::from_index(1);

        session.add_record(ContextRecord {
            context: ctx,
            platform: PlatformHandle::from_index(0),
            devices: vec![d0, d1],
        });

        assert_eq!(session.records().len(), 1);
        assert_eq!(session.records()[0].device_count(), 2);
        assert_eq!(session.resolve(d1).unwrap(), ctx);
        assert_eq!(session.mapping().len(), 2);
        assert_eq!(session.records()[0].devices, vec![d0, d1]);
    }
}

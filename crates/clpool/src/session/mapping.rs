//! Device to context mapping table.

use std::collections::HashMap;

use crate::error::{ComputeError, ComputeResult};
use crate::handle::{ContextHandle, DeviceHandle, Handle};

/// Which context owns each placed device of a session.
///
/// A device is placed at most once per session; [`insert`](Self::insert)
/// refuses to remap a device that already has an owner.
#[derive(Debug, Clone, Default)]
pub struct DeviceContextMap {
    entries: HashMap<DeviceHandle, ContextHandle>,
}

impl DeviceContextMap {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `context` owns `device`.
    ///
    /// Returns `false` and leaves the mapping untouched if the device is
    /// already owned by some context.
    pub fn insert(&mut self, device: DeviceHandle, context: ContextHandle) -> bool {
        match self.entries.entry(device) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(context);
                true
            }
        }
    }

    /// Owning context of a device.
    pub fn resolve(&self, device: DeviceHandle) -> ComputeResult<ContextHandle> {
        self.entries
            .get(&device)
            .copied()
            .ok_or(ComputeError::NoContextForDevice(device.raw()))
    }

    /// Check whether a device has an owner.
    pub fn contains(&self, device: DeviceHandle) -> bool {
        self.entries.contains_key(&device)
    }

    /// Number of mapped devices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no device is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(device, context)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceHandle, ContextHandle)> + '_ {
        self.entries.iter().map(|(d, c)| (*d, *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_resolve() {
        let mut map = DeviceContextMap::new();
        let d0 = DeviceHandle::from_index(0);
        let d1 = DeviceHandle::from_index(1);
        let ctx = ContextHandle::from_index(0);

        assert!(map.insert(d0, ctx));
        assert_eq!(map.resolve(d0).unwrap(), ctx);
        assert_eq!(
            map.resolve(d1),
            Err(ComputeError::NoContextForDevice(d1.raw()))
        );
    }

    #[test]
    fn test_no_remap() {
        let mut map = DeviceContextMap::new();
        let d0 = DeviceHandle::from_index(0);
        let first = ContextHandle::from_index(0);
        let second = ContextHandle::from_index(1);

        assert!(map.insert(d0, first));
        assert!(!map.insert(d0, second));
        assert_eq!(map.resolve(d0).unwrap(), first);
        assert_eq!(map.len(), 1);
    }
}

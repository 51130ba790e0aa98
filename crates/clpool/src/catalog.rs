//! Platform and device catalog.
//!
//! The catalog is the ordered inventory of platforms and their devices,
//! built once by [`Catalog::discover`]. Devices are stored flattened in
//! platform-major, device-minor order, and every device remembers the
//! platform it belongs to. That relation is what the partitioning engine
//! uses to group a device selection into single-platform contexts.
//!
//! Discovery fails open: a platform whose device query fails is kept with
//! zero devices, and a failed platform query yields an empty catalog.

use std::time::{Duration, Instant};

use crate::backend::Driver;
use crate::config::RuntimeConfig;
use crate::error::{ComputeError, ComputeResult};
use crate::handle::{DeviceHandle, Handle, PlatformHandle};

/// Name reported for a device whose name query fails.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

/// Name reported for a platform whose name query fails.
pub const UNKNOWN_PLATFORM_NAME: &str = "Unknown platform";

/// A discovered platform.
pub struct PlatformEntry<P> {
    handle: PlatformHandle,
    native: P,
    first_device: usize,
    device_count: usize,
}

impl<P> PlatformEntry<P> {
    /// Handle of this platform.
    pub fn handle(&self) -> PlatformHandle {
        self.handle
    }

    /// Ordinal index in discovery order.
    pub fn ordinal(&self) -> usize {
        self.handle.index()
    }

    /// Native platform object.
    pub fn native(&self) -> &P {
        &self.native
    }

    /// Number of devices discovered on this platform.
    pub fn device_count(&self) -> usize {
        self.device_count
    }
}

/// A discovered device.
pub struct DeviceEntry<Dv> {
    handle: DeviceHandle,
    native: Dv,
    platform: PlatformHandle,
    ordinal: usize,
}

impl<Dv> DeviceEntry<Dv> {
    /// Handle of this device.
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Native device object.
    pub fn native(&self) -> &Dv {
        &self.native
    }

    /// Platform the device belongs to.
    pub fn platform(&self) -> PlatformHandle {
        self.platform
    }

    /// Ordinal index within its platform.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

/// Ordered inventory of platforms and devices.
pub struct Catalog<D: Driver> {
    platforms: Vec<PlatformEntry<D::Platform>>,
    devices: Vec<DeviceEntry<D::Device>>,
    discovery_time: Duration,
}

impl<D: Driver> Catalog<D> {
    /// Query the driver for platforms and devices.
    ///
    /// Never fails: enumeration errors are logged and leave the affected
    /// platform (or the whole catalog) empty.
    pub fn discover(driver: &D, config: &RuntimeConfig) -> Self {
        let start = Instant::now();

        let natives = match driver.platforms(config.max_platforms) {
            Ok(platforms) => platforms,
            Err(e) => {
                tracing::warn!(backend = %driver.kind(), "Platform discovery failed: {}", e);
                Vec::new()
            }
        };

        let mut platforms = Vec::with_capacity(natives.len());
        let mut devices = Vec::new();

        for (index, native) in natives.into_iter().enumerate() {
            let handle = PlatformHandle::from_index(index);
            let found = match driver.devices(
                &native,
                config.device_type,
                config.max_devices_per_platform,
            ) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(platform = index, "Device discovery failed: {}", e);
                    Vec::new()
                }
            };

            let first_device = devices.len();
            let device_count = found.len();
            for (ordinal, device) in found.into_iter().enumerate() {
                devices.push(DeviceEntry {
                    handle: DeviceHandle::from_index(devices.len()),
                    native: device,
                    platform: handle,
                    ordinal,
                });
            }

            tracing::debug!(platform = index, devices = device_count, "Discovered platform");
            platforms.push(PlatformEntry {
                handle,
                native,
                first_device,
                device_count,
            });
        }

        let discovery_time = start.elapsed();
        tracing::info!(
            "Discovered {} platform(s) with {} device(s) in {:?}",
            platforms.len(),
            devices.len(),
            discovery_time
        );

        Self {
            platforms,
            devices,
            discovery_time,
        }
    }

    /// Number of platforms.
    pub fn platform_count(&self) -> usize {
        self.platforms.len()
    }

    /// Total number of devices across all platforms.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Whether discovery found no devices at all.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Time spent in discovery.
    pub fn discovery_time(&self) -> Duration {
        self.discovery_time
    }

    /// Platforms in discovery order.
    pub fn platforms(&self) -> &[PlatformEntry<D::Platform>] {
        &self.platforms
    }

    /// Platform handles in discovery order.
    pub fn platform_handles(&self) -> Vec<PlatformHandle> {
        self.platforms.iter().map(|p| p.handle).collect()
    }

    /// Device count per platform, in platform order.
    pub fn device_counts(&self) -> Vec<usize> {
        self.platforms.iter().map(|p| p.device_count).collect()
    }

    /// Flattened device handles, platform-major.
    pub fn device_handles(&self) -> Vec<DeviceHandle> {
        self.devices.iter().map(|d| d.handle).collect()
    }

    /// Devices of one platform, in ordinal order.
    pub fn devices_of(&self, platform: PlatformHandle) -> ComputeResult<&[DeviceEntry<D::Device>]> {
        let entry = self.platform(platform)?;
        Ok(&self.devices[entry.first_device..entry.first_device + entry.device_count])
    }

    /// Look up a platform.
    pub fn platform(&self, handle: PlatformHandle) -> ComputeResult<&PlatformEntry<D::Platform>> {
        self.platforms
            .get(handle.index())
            .ok_or(ComputeError::UnknownHandle {
                kind: PlatformHandle::KIND,
                raw: handle.raw(),
            })
    }

    /// Look up a device.
    pub fn device(&self, handle: DeviceHandle) -> ComputeResult<&DeviceEntry<D::Device>> {
        self.devices
            .get(handle.index())
            .ok_or(ComputeError::DeviceNotFound(handle.raw()))
    }

    /// Check whether the catalog contains a device.
    pub fn contains(&self, handle: DeviceHandle) -> bool {
        handle.index() < self.devices.len()
    }

    /// Query the name of one device.
    pub fn device_name(&self, driver: &D, handle: DeviceHandle) -> ComputeResult<String> {
        driver.device_name(&self.device(handle)?.native)
    }

    /// Query every device name, flattened in catalog order.
    ///
    /// Costs one driver round trip per device. Names that cannot be queried
    /// are reported as [`UNKNOWN_DEVICE_NAME`].
    pub fn device_names(&self, driver: &D) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| {
                driver.device_name(&d.native).unwrap_or_else(|e| {
                    tracing::warn!(device = %d.handle, "Device name query failed: {}", e);
                    UNKNOWN_DEVICE_NAME.to_string()
                })
            })
            .collect()
    }

    /// Query every platform name in platform order.
    pub fn platform_names(&self, driver: &D) -> Vec<String> {
        self.platforms
            .iter()
            .map(|p| {
                driver.platform_name(&p.native).unwrap_or_else(|e| {
                    tracing::warn!(platform = %p.handle, "Platform name query failed: {}", e);
                    UNKNOWN_PLATFORM_NAME.to_string()
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::{SimulatedDriver, SimulatedTopology};
    use crate::config::DeviceTypeFilter;

    fn driver() -> SimulatedDriver {
        SimulatedDriver::new(
            SimulatedTopology::new()
                .platform("Sim A", &["A0", "A1"])
                .platform("Sim B", &["B0", "B1", "B2"]),
        )
    }

    #[test]
    fn test_flattened_order() {
        let driver = driver();
        let catalog = Catalog::discover(&driver, &RuntimeConfig::default());

        assert_eq!(catalog.platform_count(), 2);
        assert_eq!(catalog.device_counts(), vec![2, 3]);
        assert_eq!(catalog.device_count(), 5);
        assert_eq!(
            catalog.device_names(&driver),
            vec!["A0", "A1", "B0", "B1", "B2"]
        );
        assert_eq!(catalog.platform_names(&driver), vec!["Sim A", "Sim B"]);

        let handles = catalog.device_handles();
        let third = catalog.device(handles[2]).unwrap();
        assert_eq!(third.platform(), catalog.platform_handles()[1]);
        assert_eq!(third.ordinal(), 0);
    }

    #[test]
    fn test_devices_of_platform() {
        let driver = driver();
        let catalog = Catalog::discover(&driver, &RuntimeConfig::default());
        let b = catalog.platform_handles()[1];
        let devices = catalog.devices_of(b).unwrap();
        assert_eq!(devices.len(), 3);
        assert!(devices.iter().all(|d| d.platform() == b));
    }

    #[test]
    fn test_failed_platform_is_kept_empty() {
        let driver = SimulatedDriver::new(
            SimulatedTopology::new()
                .platform("Broken", &["X0"])
                .platform("Sim B", &["B0"])
                .failing_device_query(0),
        );
        let catalog = Catalog::discover(&driver, &RuntimeConfig::default());
        assert_eq!(catalog.platform_count(), 2);
        assert_eq!(catalog.device_counts(), vec![0, 1]);
    }

    #[test]
    fn test_failed_platform_query_yields_empty_catalog() {
        let mut topology = SimulatedTopology::new().platform("Sim A", &["A0"]);
        topology.fail_platform_query = true;
        let driver = SimulatedDriver::new(topology);

        let catalog = Catalog::discover(&driver, &RuntimeConfig::default());
        assert!(catalog.is_empty());
        assert_eq!(catalog.platform_count(), 0);
    }

    #[test]
    fn test_limits_and_filter() {
        let driver = driver();
        let config = RuntimeConfig {
            max_platforms: 1,
            max_devices_per_platform: 1,
            ..Default::default()
        };
        let catalog = Catalog::discover(&driver, &config);
        assert_eq!(catalog.device_counts(), vec![1]);

        let config = RuntimeConfig::default().with_device_type(DeviceTypeFilter::Cpu);
        let catalog = Catalog::discover(&driver, &config);
        assert_eq!(catalog.device_counts(), vec![0, 0]);
    }

    #[test]
    fn test_unknown_device() {
        let driver = driver();
        let catalog = Catalog::discover(&driver, &RuntimeConfig::default());
        let bogus = DeviceHandle::from_index(99);
        assert!(!catalog.contains(bogus));
        assert!(matches!(
            catalog.device(bogus),
            Err(ComputeError::DeviceNotFound(_))
        ));
    }
}

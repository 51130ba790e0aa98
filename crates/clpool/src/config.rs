//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, ComputeResult};

/// Default upper bound on platforms queried during discovery.
pub const DEFAULT_MAX_PLATFORMS: usize = 100;

/// Default upper bound on devices queried per platform.
pub const DEFAULT_MAX_DEVICES_PER_PLATFORM: usize = 100;

/// Class of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Host CPU exposed as a compute device.
    Cpu,
    /// Graphics processor.
    Gpu,
    /// Dedicated accelerator.
    Accelerator,
}

/// Which device classes discovery enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTypeFilter {
    /// Every device class.
    #[default]
    All,
    /// CPU devices only.
    Cpu,
    /// GPU devices only.
    Gpu,
    /// Accelerators only.
    Accelerator,
}

impl DeviceTypeFilter {
    /// Check whether a device class passes the filter.
    pub fn admits(self, class: DeviceClass) -> bool {
        match self {
            DeviceTypeFilter::All => true,
            DeviceTypeFilter::Cpu => class == DeviceClass::Cpu,
            DeviceTypeFilter::Gpu => class == DeviceClass::Gpu,
            DeviceTypeFilter::Accelerator => class == DeviceClass::Accelerator,
        }
    }
}

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of platforms queried during discovery.
    pub max_platforms: usize,
    /// Maximum number of devices queried per platform.
    pub max_devices_per_platform: usize,
    /// Device classes included in the catalog.
    pub device_type: DeviceTypeFilter,
    /// Options passed to every program build.
    pub build_options: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_platforms: DEFAULT_MAX_PLATFORMS,
            max_devices_per_platform: DEFAULT_MAX_DEVICES_PER_PLATFORM,
            device_type: DeviceTypeFilter::All,
            build_options: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Check that the limits are usable.
    pub fn validate(&self) -> ComputeResult<()> {
        if self.max_platforms == 0 {
            return Err(ComputeError::InvalidConfig(
                "max_platforms must be at least 1".to_string(),
            ));
        }
        if self.max_devices_per_platform == 0 {
            return Err(ComputeError::InvalidConfig(
                "max_devices_per_platform must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the device class filter.
    pub fn with_device_type(mut self, device_type: DeviceTypeFilter) -> Self {
        self.device_type = device_type;
        self
    }

    /// Set the program build options.
    pub fn with_build_options(mut self, options: impl Into<String>) -> Self {
        self.build_options = options.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_platforms, 100);
        assert_eq!(config.max_devices_per_platform, 100);
        assert_eq!(config.device_type, DeviceTypeFilter::All);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "device_type": "gpu", "build_options": "-Werror" }"#)
                .unwrap();
        assert_eq!(config.device_type, DeviceTypeFilter::Gpu);
        assert_eq!(config.build_options, "-Werror");
        assert_eq!(config.max_platforms, DEFAULT_MAX_PLATFORMS);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = RuntimeConfig {
            max_platforms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ComputeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_filter() {
        assert!(DeviceTypeFilter::All.admits(DeviceClass::Cpu));
        assert!(DeviceTypeFilter::Gpu.admits(DeviceClass::Gpu));
        assert!(!DeviceTypeFilter::Gpu.admits(DeviceClass::Accelerator));
    }
}

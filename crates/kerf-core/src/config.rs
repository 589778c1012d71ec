//! Configuration
//!
//! Tunables for validation and allocation, loadable from JSON. Every field
//! has a default, so `{}` is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{CpuAffinity, InstanceId, MAX_INSTANCE_ID, PAGE_SIZE};

/// Validator and allocator tunables
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Memory region granularity
    pub page_size: u64,
    /// Treat a misaligned memory base as an error instead of a warning
    pub strict_alignment: bool,
    /// Highest instance id
    pub max_instance_id: InstanceId,
    /// Affinity used for count-based requests that name none
    pub default_cpu_affinity: CpuAffinity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            strict_alignment: false,
            max_instance_id: MAX_INSTANCE_ID,
            default_cpu_affinity: CpuAffinity::Compact,
        }
    }
}

impl Config {
    /// Parse and check a JSON configuration
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Reject values the validator cannot work with
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page-size {:#x} is not a power of two",
                self.page_size
            )));
        }
        if self.max_instance_id == 0 {
            return Err(ConfigError::Invalid(
                "max-instance-id must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

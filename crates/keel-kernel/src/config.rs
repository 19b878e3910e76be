//! Kernel configuration
//!
//! Boot-time parameters. Every field has a default, so a JSON document only
//! needs to name what it overrides:
//!
//! ```json
//! { "cpus": 2, "super_period_us": 1500, "fill_us": 100 }
//! ```

use alloc::string::{String, ToString};

use keel_hal::Irq;
use serde::{Deserialize, Serialize};

use crate::domain::RECEIVE_WINDOW_BASE;

/// Configuration errors
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// JSON could not be parsed
    #[error("invalid config: {0}")]
    Parse(String),
    /// A value is outside its valid range
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Boot-time kernel parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of cores, one scheduler each
    pub cpus: usize,
    /// Scheduling period in microseconds
    pub super_period_us: u64,
    /// Fill-rotation slice in microseconds
    pub fill_us: u64,
    /// Capability indices per domain
    pub cap_slots: usize,
    /// Kernel-owned indices at the bottom of every space
    pub static_cap_slots: usize,
    /// Initial kernel capability-table metadata per domain
    pub metadata_slots: usize,
    /// Metadata slots added per upgrade
    pub metadata_upgrade: usize,
    /// Total metadata slots a domain may obtain through upgrades
    pub metadata_budget: usize,
    /// Upgrades attempted before a call fails with out-of-metadata
    pub upgrade_attempts: u32,
    /// Timer interrupt vector
    pub timer_irq: Irq,
    /// Inter-processor interrupt vector
    pub ipi_irq: Irq,
    /// Virtualization maintenance interrupt vector
    pub vm_maintenance_irq: Irq,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            super_period_us: 1_000_000,
            fill_us: 10_000,
            cap_slots: 4096,
            static_cap_slots: 8,
            metadata_slots: 64,
            metadata_upgrade: 32,
            metadata_budget: 1024,
            upgrade_attempts: 3,
            timer_irq: 32,
            ipi_irq: 33,
            vm_maintenance_irq: 34,
        }
    }
}

impl KernelConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the kernel cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 {
            return Err(ConfigError::Invalid {
                field: "cpus",
                reason: "at least one core required",
            });
        }
        if self.super_period_us == 0 {
            return Err(ConfigError::Invalid {
                field: "super_period_us",
                reason: "must be non-zero",
            });
        }
        if self.fill_us == 0 || self.fill_us > self.super_period_us {
            return Err(ConfigError::Invalid {
                field: "fill_us",
                reason: "must be non-zero and fit into the period",
            });
        }
        if self.cap_slots > RECEIVE_WINDOW_BASE as usize {
            return Err(ConfigError::Invalid {
                field: "cap_slots",
                reason: "selectors would overlap the receive windows",
            });
        }
        if self.static_cap_slots >= self.cap_slots {
            return Err(ConfigError::Invalid {
                field: "static_cap_slots",
                reason: "must leave dynamic slots",
            });
        }
        let local = [self.timer_irq, self.ipi_irq, self.vm_maintenance_irq];
        if local[0] == local[1] || local[0] == local[2] || local[1] == local[2] {
            return Err(ConfigError::Invalid {
                field: "timer_irq",
                reason: "cpu-local vectors must differ",
            });
        }
        Ok(())
    }

    /// Whether `irq` is handled by the core itself.
    pub fn is_cpu_local(&self, irq: Irq) -> bool {
        irq == self.timer_irq || irq == self.ipi_irq || irq == self.vm_maintenance_irq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_partial_json_overrides_defaults() {
        let config =
            KernelConfig::from_json(r#"{ "cpus": 2, "super_period_us": 1500, "fill_us": 100 }"#)
                .unwrap();
        assert_eq!(config.cpus, 2);
        assert_eq!(config.super_period_us, 1500);
        assert_eq!(config.cap_slots, KernelConfig::default().cap_slots);
    }

    #[test]
    fn test_rejects_fill_larger_than_period() {
        let err = KernelConfig::from_json(r#"{ "super_period_us": 100, "fill_us": 200 }"#);
        assert!(matches!(
            err,
            Err(ConfigError::Invalid { field: "fill_us", .. })
        ));
    }

    #[test]
    fn test_rejects_cap_slots_reaching_receive_windows() {
        let mut config = KernelConfig::default();
        config.cap_slots = RECEIVE_WINDOW_BASE as usize;
        assert_eq!(config.validate(), Ok(()));

        config.cap_slots += 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "cap_slots", .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            KernelConfig::from_json("{ cpus: "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_cpu_local_vectors() {
        let config = KernelConfig::default();
        assert!(config.is_cpu_local(32));
        assert!(!config.is_cpu_local(40));
    }
}

//! MDS configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fault::{FaultInjector, FAIL_ONCE};
use crate::types::MdsError;

/// Backing filesystem to mount at setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem type; `ext3` or `ext2`.
    pub fstype: String,
    /// Device or path to mount.
    pub device: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fstype: "ext3".to_string(),
            device: "/dev/mds0".to_string(),
        }
    }
}

/// RPC service and worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name the service registers under.
    pub name: String,
    /// Worker tasks.
    pub workers: usize,
    /// TCP listen address.
    pub listen_addr: String,
    /// Requests queued before intake applies backpressure.
    pub queue_depth: usize,
    /// Bulk transfers not acknowledged within this are interrupted.
    pub bulk_timeout_ms: u64,
    /// Page buffers available to READPAGE.
    pub page_buffers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "metafs_mds".to_string(),
            workers: 2,
            listen_addr: "127.0.0.1:9888".to_string(),
            queue_depth: 1024,
            bulk_timeout_ms: 5000,
            page_buffers: 64,
        }
    }
}

/// Fail point armed at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Fail point id; 0 disarms.
    pub fail_loc: u32,
    /// Status to force instead of the point's default.
    pub fail_status: Option<i32>,
    /// Disarm after the first hit.
    pub once: bool,
}

impl FaultConfig {
    /// Arms `injector` according to this section.
    pub fn apply(&self, injector: &FaultInjector) {
        if self.fail_loc == 0 {
            injector.clear();
            return;
        }
        let loc = if self.once {
            self.fail_loc | FAIL_ONCE
        } else {
            self.fail_loc
        };
        injector.set(loc, self.fail_status);
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdsConfig {
    /// Backing filesystem.
    pub mount: MountConfig,
    /// Service settings.
    pub service: ServiceConfig,
    /// Fault injection.
    pub fault: FaultConfig,
}

impl MdsConfig {
    /// Parses TOML.
    pub fn from_toml_str(s: &str) -> Result<Self, MdsError> {
        toml::from_str(s).map_err(|e| MdsError::Config(e.to_string()))
    }

    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, MdsError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MdsError::Config(format!("{}: {}", path.display(), e)))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&contents),
            "json" => serde_json::from_str(&contents).map_err(|e| MdsError::Config(e.to_string())),
            _ => Err(MdsError::Config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<(), MdsError> {
        if self.mount.device.is_empty() {
            return Err(MdsError::Config("mount.device is empty".to_string()));
        }
        if self.service.name.is_empty() {
            return Err(MdsError::Config("service.name is empty".to_string()));
        }
        if self.service.workers == 0 {
            return Err(MdsError::Config("service.workers must be > 0".to_string()));
        }
        if self.service.queue_depth == 0 {
            return Err(MdsError::Config("service.queue_depth must be > 0".to_string()));
        }
        if self.service.page_buffers == 0 {
            return Err(MdsError::Config("service.page_buffers must be > 0".to_string()));
        }
        if self.service.bulk_timeout_ms == 0 {
            return Err(MdsError::Config(
                "service.bulk_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Bulk timeout as a duration.
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.service.bulk_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FailPoint;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults() {
        let config = MdsConfig::default();
        assert_eq!(config.service.workers, 2);
        assert_eq!(config.service.queue_depth, 1024);
        assert_eq!(config.service.bulk_timeout_ms, 5000);
        assert_eq!(config.service.page_buffers, 64);
        assert_eq!(config.service.name, "metafs_mds");
        assert_eq!(config.service.listen_addr, "127.0.0.1:9888");
        assert_eq!(config.mount.fstype, "ext3");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = MdsConfig::from_toml_str(
            r#"
            [mount]
            fstype = "ext2"
            device = "/dev/sdb1"

            [service]
            workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.mount.fstype, "ext2");
        assert_eq!(config.mount.device, "/dev/sdb1");
        assert_eq!(config.service.workers, 8);
        assert_eq!(config.service.page_buffers, 64);
        assert_eq!(config.fault, FaultConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = MdsConfig::default();
        config.service.workers = 0;
        assert!(config.validate().is_err());

        let mut config = MdsConfig::default();
        config.service.queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = MdsConfig::default();
        config.service.page_buffers = 0;
        assert!(config.validate().is_err());

        let mut config = MdsConfig::default();
        config.mount.device.clear();
        assert!(matches!(config.validate(), Err(MdsError::Config(_))));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[service]\nname = \"mds-test\"\nbulk_timeout_ms = 250\n\n[fault]\nfail_loc = 0x106\nonce = true"
        )
        .unwrap();
        let config = MdsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service.name, "mds-test");
        assert_eq!(config.bulk_timeout(), Duration::from_millis(250));
        assert_eq!(config.fault.fail_loc, 0x106);
        assert!(config.fault.once);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"service": {{"workers": 3}}}}"#).unwrap();
        let config = MdsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.service.workers, 3);
    }

    #[test]
    fn test_unknown_extension() {
        let file = Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(MdsConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_fault_section_arms_injector() {
        let injector = FaultInjector::new();
        let fault = FaultConfig {
            fail_loc: FailPoint::CloseNet.id(),
            fail_status: Some(-7),
            once: true,
        };
        fault.apply(&injector);
        assert_eq!(injector.checkpoint(FailPoint::CloseNet), Some(-7));
        assert_eq!(injector.checkpoint(FailPoint::CloseNet), None);
    }
}

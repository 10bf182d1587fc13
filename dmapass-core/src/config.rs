//! Configuration management.

use crate::error::{DmaPassError, Result};
use crate::memory::{page_size, MemoryStrategy};
use crate::pci::{is_valid_pci_address, PciDevice, PCI_DEVICES_PATH};
use crate::vfio::IommuModel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Path to VFIO device nodes.
pub const VFIO_DEV_PATH: &str = "/dev/vfio";

/// Fixed address used both as the user-space target and as the device IOVA.
pub const DEFAULT_TARGET_ADDR: u64 = 0x9_0000_0000;

/// Default DMA buffer size (2 MiB).
pub const DEFAULT_MAP_SIZE: usize = 2 * 1024 * 1024;

/// Settings for one passthrough session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthroughConfig {
    /// VFIO container entry point.
    pub container_path: PathBuf,
    /// VFIO group node. Derived from the device's IOMMU group when unset.
    pub group_path: Option<PathBuf>,
    /// PCI address of the passthrough device (e.g. "0000:11:00.0").
    pub device: String,
    pub strategy: MemoryStrategy,
    pub map_size: usize,
    /// User-space address the memory source maps at.
    pub target_addr: u64,
    /// Device-visible address of the DMA mapping.
    pub iova: u64,
    pub iommu_model: IommuModel,
    /// Buffer provider special file.
    pub dummymap_path: PathBuf,
    /// Persistent-memory character device.
    pub devdax_path: PathBuf,
    /// Root of the PCI device tree in sysfs.
    pub sysfs_pci_root: PathBuf,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        Self {
            container_path: PathBuf::from(VFIO_DEV_PATH).join("vfio"),
            group_path: None,
            device: "0000:11:00.0".to_string(),
            strategy: MemoryStrategy::Anonymous,
            map_size: DEFAULT_MAP_SIZE,
            target_addr: DEFAULT_TARGET_ADDR,
            iova: DEFAULT_TARGET_ADDR,
            iommu_model: IommuModel::Type1,
            dummymap_path: PathBuf::from("/dev/dummymap"),
            devdax_path: PathBuf::from("/dev/dax0.0"),
            sysfs_pci_root: PathBuf::from(PCI_DEVICES_PATH),
        }
    }
}

impl PassthroughConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DmaPassError::IoError { path: path.to_path_buf(), source: e })?;
        serde_json::from_str(&content).map_err(|e| DmaPassError::InvalidConfig {
            reason: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    /// Check the settings before any resource is touched.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_pci_address(&self.device) {
            return Err(DmaPassError::InvalidConfig {
                reason: format!(
                    "Invalid PCI address format: {} (expected: 0000:01:00.0)",
                    self.device
                ),
            });
        }

        let page = page_size() as u64;
        if self.map_size == 0 || self.map_size as u64 % page != 0 {
            return Err(DmaPassError::InvalidConfig {
                reason: format!(
                    "map_size {:#x} must be a non-zero multiple of {:#x}",
                    self.map_size, page
                ),
            });
        }
        if self.target_addr == 0 || self.target_addr % page != 0 {
            return Err(DmaPassError::InvalidConfig {
                reason: format!(
                    "target_addr {:#x} must be non-null and page aligned",
                    self.target_addr
                ),
            });
        }
        if self.iova % page != 0 {
            return Err(DmaPassError::InvalidConfig {
                reason: format!("iova {:#x} must be page aligned", self.iova),
            });
        }

        Ok(())
    }

    /// The VFIO group node for the configured device.
    ///
    /// Uses `group_path` when set, otherwise follows the device's
    /// `iommu_group` link in sysfs.
    pub fn resolve_group_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.group_path {
            return Ok(path.clone());
        }

        let device = PciDevice::from_sysfs(&self.sysfs_pci_root, &self.device)?;
        let group_id = device.iommu_group.ok_or_else(|| DmaPassError::InvalidConfig {
            reason: format!(
                "Device {} has no IOMMU group. Enable VT-d/AMD-Vi or pass --group explicitly.",
                self.device
            ),
        })?;

        let path = PathBuf::from(VFIO_DEV_PATH).join(&group_id);
        debug!(device = %self.device, group = %path.display(), "Resolved VFIO group");
        Ok(path)
    }
}

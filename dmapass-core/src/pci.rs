//! PCI device discovery through sysfs.

use crate::error::{DmaPassError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sysfs path for PCI devices.
pub const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";

/// Driver a device must be bound to before its group becomes viable.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// PCI device information.
#[derive(Debug, Clone)]
pub struct PciDevice {
    /// PCI address (e.g., "0000:11:00.0")
    pub address: String,
    /// Vendor ID (e.g., "8086")
    pub vendor_id: String,
    /// Device ID
    pub device_id: String,
    /// Current driver (None if unbound)
    pub driver: Option<String>,
    /// IOMMU group ID
    pub iommu_group: Option<String>,
    pub sysfs_path: PathBuf,
}

impl PciDevice {
    /// Read device information from a sysfs PCI device tree.
    pub fn from_sysfs(root: &Path, address: &str) -> Result<Self> {
        if !is_valid_pci_address(address) {
            return Err(DmaPassError::InvalidConfig {
                reason: format!(
                    "Invalid PCI address format: {} (expected: 0000:01:00.0)",
                    address
                ),
            });
        }

        let sysfs_path = root.join(address);
        if !sysfs_path.exists() {
            return Err(DmaPassError::DeviceFailure {
                device: address.to_string(),
                reason: format!("not found under {}", root.display()),
            });
        }

        let vendor_id = read_sysfs_value(&sysfs_path.join("vendor"))?
            .trim_start_matches("0x")
            .to_lowercase();
        let device_id = read_sysfs_value(&sysfs_path.join("device"))?
            .trim_start_matches("0x")
            .to_lowercase();

        let driver = read_link_name(&sysfs_path.join("driver"));
        let iommu_group = read_link_name(&sysfs_path.join("iommu_group"));

        debug!(
            address = %address,
            vendor = %vendor_id,
            device = %device_id,
            driver = ?driver,
            iommu_group = ?iommu_group,
            "Read PCI device info"
        );

        Ok(Self {
            address: address.to_string(),
            vendor_id,
            device_id,
            driver,
            iommu_group,
            sysfs_path,
        })
    }

    /// Check if device is currently bound to vfio-pci.
    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some(VFIO_PCI_DRIVER)
    }
}

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

fn read_sysfs_value(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| DmaPassError::IoError { path: path.to_path_buf(), source: e })
}

/// Resolve a sysfs symlink (driver, iommu_group) to its final path component.
fn read_link_name(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

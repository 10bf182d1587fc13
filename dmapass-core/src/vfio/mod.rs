//! VFIO (Virtual Function I/O) container, group and device protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     VFIO Protocol                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  VfioBackend                                                │
//! │  ├── open_container() - /dev/vfio/vfio                      │
//! │  └── open_group()     - /dev/vfio/<group>                   │
//! │                                                             │
//! │  Container                                                  │
//! │  └── API version, extensions, IOMMU model, DMA map/unmap    │
//! │                                                             │
//! │  Group                                                      │
//! │  └── viability, container attach, device handles           │
//! │                                                             │
//! │  Device                                                     │
//! │  └── info, region/IRQ descriptors, reset                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `SystemBackend` talks to the kernel through `ioctl(2)`; tests supply their
//! own implementations of the traits.

pub mod device;
pub mod dma;
pub mod sys;
mod system;

pub use device::{introspect, reset, DeviceSnapshot, ResetOutcome};
pub use dma::DmaRegistry;
pub use system::SystemBackend;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::Path;

/// IOMMU backend model selected on the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IommuModel {
    Type1,
    Type1v2,
}

impl IommuModel {
    /// Extension / model identifier passed to the kernel.
    pub fn raw(self) -> u32 {
        match self {
            Self::Type1 => sys::VFIO_TYPE1_IOMMU,
            Self::Type1v2 => sys::VFIO_TYPE1V2_IOMMU,
        }
    }
}

impl fmt::Display for IommuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type1 => write!(f, "VFIO_TYPE1_IOMMU"),
            Self::Type1v2 => write!(f, "VFIO_TYPE1v2_IOMMU"),
        }
    }
}

/// Result of `VFIO_GROUP_GET_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStatus {
    pub flags: u32,
}

impl GroupStatus {
    /// All devices in the group are bound to a VFIO driver.
    pub fn is_viable(&self) -> bool {
        self.flags & sys::VFIO_GROUP_FLAGS_VIABLE != 0
    }

    pub fn container_set(&self) -> bool {
        self.flags & sys::VFIO_GROUP_FLAGS_CONTAINER_SET != 0
    }
}

/// Result of `VFIO_IOMMU_GET_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IommuInfo {
    pub flags: u32,
    /// Bitmap of supported IOVA page sizes.
    pub iova_pgsizes: u64,
}

impl IommuInfo {
    /// Smallest IOVA page size, if the kernel reported any.
    pub fn min_page_size(&self) -> Option<u64> {
        if self.flags & sys::VFIO_IOMMU_INFO_PGSIZES == 0 || self.iova_pgsizes == 0 {
            return None;
        }
        Some(1u64 << self.iova_pgsizes.trailing_zeros())
    }
}

/// A user-space range registered with the container for device access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DmaMapping {
    pub vaddr: u64,
    pub iova: u64,
    pub size: u64,
    pub flags: u32,
}

impl DmaMapping {
    /// Read/write mapping, the only access mode the harness registers.
    pub fn read_write(vaddr: u64, iova: u64, size: u64) -> Self {
        Self {
            vaddr,
            iova,
            size,
            flags: sys::VFIO_DMA_MAP_FLAG_READ | sys::VFIO_DMA_MAP_FLAG_WRITE,
        }
    }

    pub fn iova_end(&self) -> u64 {
        self.iova.saturating_add(self.size)
    }

    pub fn vaddr_end(&self) -> u64 {
        self.vaddr.saturating_add(self.size)
    }

    /// True if the two mappings share any IOVA or any virtual address.
    pub fn overlaps(&self, other: &DmaMapping) -> bool {
        let iova = self.iova < other.iova_end() && other.iova < self.iova_end();
        let vaddr = self.vaddr < other.vaddr_end() && other.vaddr < self.vaddr_end();
        iova || vaddr
    }
}

/// Result of `VFIO_DEVICE_GET_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceInfo {
    pub flags: u32,
    pub num_regions: u32,
    pub num_irqs: u32,
}

impl DeviceInfo {
    pub fn supports_reset(&self) -> bool {
        self.flags & sys::VFIO_DEVICE_FLAGS_RESET != 0
    }

    pub fn is_pci(&self) -> bool {
        self.flags & sys::VFIO_DEVICE_FLAGS_PCI != 0
    }
}

/// Result of `VFIO_DEVICE_GET_REGION_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegionInfo {
    pub index: u32,
    pub flags: u32,
    pub size: u64,
    pub offset: u64,
}

impl RegionInfo {
    pub fn is_mappable(&self) -> bool {
        self.flags & sys::VFIO_REGION_INFO_FLAG_MMAP != 0
    }
}

/// Result of `VFIO_DEVICE_GET_IRQ_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IrqInfo {
    pub index: u32,
    pub flags: u32,
    pub count: u32,
}

/// IOMMU context.
pub trait Container {
    /// `VFIO_GET_API_VERSION`.
    fn api_version(&self) -> Result<i32>;

    /// `VFIO_CHECK_EXTENSION`.
    fn check_extension(&self, model: IommuModel) -> Result<bool>;

    /// `VFIO_SET_IOMMU`.
    fn set_iommu(&self, model: IommuModel) -> Result<()>;

    /// `VFIO_IOMMU_GET_INFO`.
    fn iommu_info(&self) -> Result<IommuInfo>;

    /// `VFIO_IOMMU_MAP_DMA`.
    fn map_dma(&self, mapping: &DmaMapping) -> Result<()>;

    /// `VFIO_IOMMU_UNMAP_DMA`. Returns the number of bytes unmapped.
    fn unmap_dma(&self, iova: u64, size: u64) -> Result<u64>;

    /// Handle passed to `VFIO_GROUP_SET_CONTAINER`.
    fn as_raw_fd(&self) -> RawFd;
}

/// IOMMU isolation unit.
pub trait Group {
    /// `VFIO_GROUP_GET_STATUS`.
    fn status(&self) -> Result<GroupStatus>;

    /// `VFIO_GROUP_SET_CONTAINER`.
    fn set_container(&self, container: &dyn Container) -> Result<()>;

    /// `VFIO_GROUP_UNSET_CONTAINER`.
    fn unset_container(&self) -> Result<()>;

    /// `VFIO_GROUP_GET_DEVICE_FD`.
    fn open_device(&self, name: &str) -> Result<Box<dyn Device>>;
}

/// Passthrough device handle.
pub trait Device {
    /// Identifier the handle was requested with.
    fn name(&self) -> &str;

    /// `VFIO_DEVICE_GET_INFO`.
    fn info(&self) -> Result<DeviceInfo>;

    /// `VFIO_DEVICE_GET_REGION_INFO`.
    fn region_info(&self, index: u32) -> Result<RegionInfo>;

    /// `VFIO_DEVICE_GET_IRQ_INFO`.
    fn irq_info(&self, index: u32) -> Result<IrqInfo>;

    /// `VFIO_DEVICE_RESET`.
    fn reset(&self) -> Result<()>;
}

/// Opens the VFIO entry points.
pub trait VfioBackend {
    fn open_container(&self, path: &Path) -> Result<Box<dyn Container>>;

    fn open_group(&self, path: &Path) -> Result<Box<dyn Group>>;
}

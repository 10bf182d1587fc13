//! `ioctl(2)` implementation of the VFIO traits.

use super::sys::{self, argsz};
use super::{
    Container, Device, DeviceInfo, DmaMapping, Group, GroupStatus, IommuInfo, IommuModel,
    IrqInfo, RegionInfo, VfioBackend,
};
use crate::error::{DmaPassError, Result};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Backend that opens the real `/dev/vfio` nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl SystemBackend {
    pub fn new() -> Self {
        Self
    }
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| DmaPassError::OpenFailure { path: path.to_path_buf(), source: e })
}

impl VfioBackend for SystemBackend {
    fn open_container(&self, path: &Path) -> Result<Box<dyn Container>> {
        let file = open_rw(path)?;
        debug!(path = %path.display(), "Opened VFIO container");
        Ok(Box::new(SysContainer { file }))
    }

    fn open_group(&self, path: &Path) -> Result<Box<dyn Group>> {
        let file = open_rw(path)?;
        debug!(path = %path.display(), "Opened VFIO group");
        Ok(Box::new(SysGroup { file, path: path.to_path_buf() }))
    }
}

struct SysContainer {
    file: File,
}

impl Container for SysContainer {
    fn api_version(&self) -> Result<i32> {
        sys::ioctl(&self.file, sys::VFIO_GET_API_VERSION).map_err(|e| {
            DmaPassError::ProtocolMismatch { reason: format!("VFIO_GET_API_VERSION failed: {}", e) }
        })
    }

    fn check_extension(&self, model: IommuModel) -> Result<bool> {
        let ret = sys::ioctl_with_val(&self.file, sys::VFIO_CHECK_EXTENSION, model.raw().into())
            .map_err(|e| DmaPassError::ProtocolMismatch {
                reason: format!("VFIO_CHECK_EXTENSION({}) failed: {}", model, e),
            })?;
        Ok(ret > 0)
    }

    fn set_iommu(&self, model: IommuModel) -> Result<()> {
        sys::ioctl_with_val(&self.file, sys::VFIO_SET_IOMMU, model.raw().into())
            .map(|_| ())
            .map_err(|e| DmaPassError::IommuFailure {
                reason: format!("VFIO_SET_IOMMU({}) failed: {}", model, e),
            })
    }

    fn iommu_info(&self) -> Result<IommuInfo> {
        let mut info = sys::vfio_iommu_type1_info {
            argsz: argsz::<sys::vfio_iommu_type1_info>(),
            ..Default::default()
        };
        sys::ioctl_with_mut_ref(&self.file, sys::VFIO_IOMMU_GET_INFO, &mut info).map_err(|e| {
            DmaPassError::IommuFailure { reason: format!("VFIO_IOMMU_GET_INFO failed: {}", e) }
        })?;
        Ok(IommuInfo { flags: info.flags, iova_pgsizes: info.iova_pgsizes })
    }

    fn map_dma(&self, mapping: &DmaMapping) -> Result<()> {
        let dma_map = sys::vfio_iommu_type1_dma_map {
            argsz: argsz::<sys::vfio_iommu_type1_dma_map>(),
            flags: mapping.flags,
            vaddr: mapping.vaddr,
            iova: mapping.iova,
            size: mapping.size,
        };
        sys::ioctl_with_ref(&self.file, sys::VFIO_IOMMU_MAP_DMA, &dma_map)
            .map(|_| ())
            .map_err(|e| DmaPassError::DmaMapFailure {
                iova: mapping.iova,
                size: mapping.size,
                reason: e.to_string(),
            })
    }

    fn unmap_dma(&self, iova: u64, size: u64) -> Result<u64> {
        let mut dma_unmap = sys::vfio_iommu_type1_dma_unmap {
            argsz: argsz::<sys::vfio_iommu_type1_dma_unmap>(),
            flags: 0,
            iova,
            size,
        };
        sys::ioctl_with_mut_ref(&self.file, sys::VFIO_IOMMU_UNMAP_DMA, &mut dma_unmap).map_err(
            |e| DmaPassError::DmaMapFailure { iova, size, reason: format!("unmap: {}", e) },
        )?;
        Ok(dma_unmap.size)
    }

    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

struct SysGroup {
    file: File,
    path: PathBuf,
}

impl Group for SysGroup {
    fn status(&self) -> Result<GroupStatus> {
        let mut status =
            sys::vfio_group_status { argsz: argsz::<sys::vfio_group_status>(), flags: 0 };
        sys::ioctl_with_mut_ref(&self.file, sys::VFIO_GROUP_GET_STATUS, &mut status).map_err(
            |e| DmaPassError::ProtocolMismatch {
                reason: format!("VFIO_GROUP_GET_STATUS on {} failed: {}", self.path.display(), e),
            },
        )?;
        Ok(GroupStatus { flags: status.flags })
    }

    fn set_container(&self, container: &dyn Container) -> Result<()> {
        let fd: libc::c_int = container.as_raw_fd();
        sys::ioctl_with_ref(&self.file, sys::VFIO_GROUP_SET_CONTAINER, &fd).map(|_| ()).map_err(
            |e| DmaPassError::AttachFailure { group: self.path.clone(), reason: e.to_string() },
        )
    }

    fn unset_container(&self) -> Result<()> {
        sys::ioctl(&self.file, sys::VFIO_GROUP_UNSET_CONTAINER).map(|_| ()).map_err(|e| {
            DmaPassError::AttachFailure {
                group: self.path.clone(),
                reason: format!("unset container: {}", e),
            }
        })
    }

    fn open_device(&self, name: &str) -> Result<Box<dyn Device>> {
        let c_name = CString::new(name)
            .map_err(|e| DmaPassError::device(name, format!("invalid identifier: {}", e)))?;
        let fd = sys::ioctl_with_cstr(&self.file, sys::VFIO_GROUP_GET_DEVICE_FD, &c_name)
            .map_err(|e| DmaPassError::device(name, format!("VFIO_GROUP_GET_DEVICE_FD: {}", e)))?;

        // SAFETY: the ioctl returned a fresh descriptor that nothing else owns.
        let file = unsafe { File::from_raw_fd(fd) };
        debug!(device = %name, fd, "Acquired VFIO device handle");
        Ok(Box::new(SysDevice { file, name: name.to_string() }))
    }
}

struct SysDevice {
    file: File,
    name: String,
}

impl Device for SysDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> Result<DeviceInfo> {
        let mut info =
            sys::vfio_device_info { argsz: argsz::<sys::vfio_device_info>(), ..Default::default() };
        sys::ioctl_with_mut_ref(&self.file, sys::VFIO_DEVICE_GET_INFO, &mut info)
            .map_err(|e| DmaPassError::device(&self.name, format!("VFIO_DEVICE_GET_INFO: {}", e)))?;
        Ok(DeviceInfo { flags: info.flags, num_regions: info.num_regions, num_irqs: info.num_irqs })
    }

    fn region_info(&self, index: u32) -> Result<RegionInfo> {
        let mut region = sys::vfio_region_info {
            argsz: argsz::<sys::vfio_region_info>(),
            index,
            ..Default::default()
        };
        sys::ioctl_with_mut_ref(&self.file, sys::VFIO_DEVICE_GET_REGION_INFO, &mut region)
            .map_err(|e| {
                let reason = format!("VFIO_DEVICE_GET_REGION_INFO({}): {}", index, e);
                DmaPassError::device(&self.name, reason)
            })?;
        Ok(RegionInfo { index, flags: region.flags, size: region.size, offset: region.offset })
    }

    fn irq_info(&self, index: u32) -> Result<IrqInfo> {
        let size = argsz::<sys::vfio_irq_info>();
        let mut irq = sys::vfio_irq_info { argsz: size, index, ..Default::default() };
        sys::ioctl_with_mut_ref(&self.file, sys::VFIO_DEVICE_GET_IRQ_INFO, &mut irq).map_err(|e| {
            DmaPassError::device(&self.name, format!("VFIO_DEVICE_GET_IRQ_INFO({}): {}", index, e))
        })?;
        Ok(IrqInfo { index, flags: irq.flags, count: irq.count })
    }

    fn reset(&self) -> Result<()> {
        sys::ioctl(&self.file, sys::VFIO_DEVICE_RESET)
            .map(|_| ())
            .map_err(|e| DmaPassError::device(&self.name, format!("VFIO_DEVICE_RESET: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_container() {
        let backend = SystemBackend::new();
        let err = backend.open_container(Path::new("/nonexistent/vfio/vfio")).err().unwrap();
        assert!(matches!(err, DmaPassError::OpenFailure { .. }));
    }

    #[test]
    fn test_regular_file_is_not_a_container() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let container = SystemBackend::new().open_container(file.path()).unwrap();
        assert!(matches!(container.api_version(), Err(DmaPassError::ProtocolMismatch { .. })));
    }
}

//! Bookkeeping for DMA mappings registered with a container.

use super::{Container, DmaMapping, IommuInfo};
use crate::error::{DmaPassError, Result};
use crate::observability::metrics;
use tracing::{debug, info, warn};

/// Live DMA mappings of one container.
///
/// Enforces that no two live mappings overlap in IOVA or virtual-address
/// space before the request reaches the kernel. A rejected mapping leaves the
/// registry untouched.
#[derive(Debug, Default)]
pub struct DmaRegistry {
    mappings: Vec<DmaMapping>,
}

impl DmaRegistry {
    pub fn new() -> Self {
        Self { mappings: Vec::new() }
    }

    pub fn mappings(&self) -> &[DmaMapping] {
        &self.mappings
    }

    /// Register `mapping` with `container`.
    pub fn map(
        &mut self,
        container: &dyn Container,
        mapping: DmaMapping,
        iommu: Option<&IommuInfo>,
    ) -> Result<()> {
        let reject = |reason: String| DmaPassError::DmaMapFailure {
            iova: mapping.iova,
            size: mapping.size,
            reason,
        };

        if mapping.size == 0 {
            return Err(reject("zero-length mapping".to_string()));
        }
        if mapping.iova.checked_add(mapping.size).is_none()
            || mapping.vaddr.checked_add(mapping.size).is_none()
        {
            return Err(reject("range wraps the address space".to_string()));
        }
        if let Some(page) = iommu.and_then(IommuInfo::min_page_size) {
            if mapping.size % page != 0 || mapping.iova % page != 0 {
                return Err(reject(format!("not aligned to IOMMU page size {:#x}", page)));
            }
        }
        if let Some(existing) = self.mappings.iter().find(|m| m.overlaps(&mapping)) {
            return Err(reject(format!(
                "overlaps live mapping iova={:#x} vaddr={:#x} size={:#x}",
                existing.iova, existing.vaddr, existing.size
            )));
        }

        container.map_dma(&mapping)?;
        metrics::record_dma_map(mapping.size);

        info!(
            vaddr = %format!("{:#x}", mapping.vaddr),
            iova = %format!("{:#x}", mapping.iova),
            size = mapping.size,
            "DMA mapping registered"
        );
        self.mappings.push(mapping);
        Ok(())
    }

    /// Remove every live mapping, newest first.
    ///
    /// Errors are logged and the remaining mappings are still attempted.
    pub fn unmap_all(&mut self, container: &dyn Container) {
        while let Some(mapping) = self.mappings.pop() {
            match container.unmap_dma(mapping.iova, mapping.size) {
                Ok(unmapped) if unmapped != mapping.size => warn!(
                    iova = %format!("{:#x}", mapping.iova),
                    expected = mapping.size,
                    unmapped,
                    "Partial DMA unmap"
                ),
                Ok(_) => debug!(iova = %format!("{:#x}", mapping.iova), "DMA mapping removed"),
                Err(e) => warn!(error = %e, "DMA unmap failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfio::{sys, IommuModel};
    use std::cell::RefCell;
    use std::os::unix::io::RawFd;

    /// Container that records map/unmap calls.
    #[derive(Default)]
    struct RecordingContainer {
        mapped: RefCell<Vec<DmaMapping>>,
        unmapped: RefCell<Vec<u64>>,
        reject: bool,
    }

    impl Container for RecordingContainer {
        fn api_version(&self) -> Result<i32> {
            Ok(sys::VFIO_API_VERSION)
        }
        fn check_extension(&self, _model: IommuModel) -> Result<bool> {
            Ok(true)
        }
        fn set_iommu(&self, _model: IommuModel) -> Result<()> {
            Ok(())
        }
        fn iommu_info(&self) -> Result<IommuInfo> {
            Ok(IommuInfo::default())
        }
        fn map_dma(&self, mapping: &DmaMapping) -> Result<()> {
            if self.reject {
                return Err(DmaPassError::DmaMapFailure {
                    iova: mapping.iova,
                    size: mapping.size,
                    reason: "EINVAL".to_string(),
                });
            }
            self.mapped.borrow_mut().push(*mapping);
            Ok(())
        }
        fn unmap_dma(&self, iova: u64, size: u64) -> Result<u64> {
            self.unmapped.borrow_mut().push(iova);
            Ok(size)
        }
        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    const BASE: u64 = 0x9_0000_0000;
    const SIZE: u64 = 0x20_0000;

    #[test]
    fn test_overlapping_mapping_rejected() {
        let container = RecordingContainer::default();
        let mut registry = DmaRegistry::new();
        registry.map(&container, DmaMapping::read_write(BASE, BASE, SIZE), None).unwrap();

        let overlapping = DmaMapping::read_write(BASE + 0x1000_0000, BASE + 0x1000, SIZE);
        let err = registry.map(&container, overlapping, None).unwrap_err();
        assert!(matches!(err, DmaPassError::DmaMapFailure { .. }));

        // Prior mapping unchanged, kernel never saw the second request
        assert_eq!(registry.mappings(), &[DmaMapping::read_write(BASE, BASE, SIZE)]);
        assert_eq!(container.mapped.borrow().len(), 1);
    }

    #[test]
    fn test_adjacent_mappings_allowed() {
        let container = RecordingContainer::default();
        let mut registry = DmaRegistry::new();
        registry.map(&container, DmaMapping::read_write(BASE, BASE, SIZE), None).unwrap();
        registry
            .map(&container, DmaMapping::read_write(BASE + SIZE, BASE + SIZE, SIZE), None)
            .unwrap();
        assert_eq!(registry.mappings().len(), 2);
    }

    #[test]
    fn test_kernel_rejection_not_recorded() {
        let container = RecordingContainer { reject: true, ..Default::default() };
        let mut registry = DmaRegistry::new();
        let err = registry.map(&container, DmaMapping::read_write(BASE, BASE, SIZE), None);
        assert!(matches!(err, Err(DmaPassError::DmaMapFailure { .. })));
        assert!(registry.mappings().is_empty());
    }

    #[test]
    fn test_iommu_page_size_enforced() {
        let container = RecordingContainer::default();
        let mut registry = DmaRegistry::new();
        let info = IommuInfo { flags: sys::VFIO_IOMMU_INFO_PGSIZES, iova_pgsizes: 0x20_0000 };

        let err = registry.map(&container, DmaMapping::read_write(BASE, BASE, 0x1000), Some(&info));
        assert!(err.is_err());
        registry.map(&container, DmaMapping::read_write(BASE, BASE, SIZE), Some(&info)).unwrap();
    }

    #[test]
    fn test_unmap_all_newest_first() {
        let container = RecordingContainer::default();
        let mut registry = DmaRegistry::new();
        registry.map(&container, DmaMapping::read_write(BASE, BASE, SIZE), None).unwrap();
        registry
            .map(&container, DmaMapping::read_write(BASE + SIZE, BASE + SIZE, SIZE), None)
            .unwrap();

        registry.unmap_all(&container);
        assert!(registry.mappings().is_empty());
        assert_eq!(*container.unmapped.borrow(), vec![BASE + SIZE, BASE]);
    }
}

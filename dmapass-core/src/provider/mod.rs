//! Buffer provider: exposes DMA-coherent memory through a mapping entry point.
//!
//! Every mapping request gets its own freshly allocated coherent buffer,
//! installed non-cached into the caller's address space. The buffer lives
//! exactly as long as the mapping: it is freed when the mapping closes, and
//! also when page installation fails after allocation.
//!
//! # Lifecycle
//!
//! ```text
//! register() ──► acquire_mapping() ──► opened ──► close_mapping() ──► closed
//!                      │                                 ▲
//!                      └──── teardown() / drop ──────────┘
//! ```

pub mod backend;
pub mod lifecycle;

pub use backend::{DmaBackend, HostDmaBackend};
pub use lifecycle::{
    LifecycleTracker, RecordingObserver, TracingObserver, VmaEvent, VmaInfo, VmaObserver,
};

use crate::error::{DmaPassError, Result};
use crate::memory::{MappingEntryPoint, VirtRange};
use crate::observability::metrics;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Access mode of the entry point (world read/write).
pub const DEVICE_MODE: u32 = 0o666;

/// Caching attribute of an installed mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageProtection {
    /// CPU accesses bypass the cache, matching what a DMA master observes.
    NonCached,
}

/// A coherent buffer owned by the provider.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    /// Provider-side CPU address.
    pub cpu_addr: u64,
    /// Address a device uses to reach the buffer without an IOMMU.
    pub dma_addr: u64,
    pub len: usize,
    /// Backend allocation handle.
    pub handle: u64,
}

/// Handle to a live mapping returned by `acquire_mapping`.
#[must_use = "a mapping must be handed back to close_mapping"]
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping {
    id: u64,
    range: VirtRange,
    prot: PageProtection,
}

impl Mapping {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn range(&self) -> VirtRange {
        self.range
    }

    pub fn protection(&self) -> PageProtection {
        self.prot
    }
}

struct LiveMapping {
    range: VirtRange,
    buffer: DmaBuffer,
}

impl LiveMapping {
    fn vma(&self, id: u64) -> VmaInfo {
        VmaInfo { id, start: self.range.start, len: self.range.len }
    }
}

/// Registered instance of the mapping entry point.
///
/// Created once per process with `register` and passed by reference; its
/// teardown closes whatever is still mapped.
pub struct MappingDevice<B: DmaBackend> {
    name: String,
    backend: B,
    tracker: LifecycleTracker,
    live: BTreeMap<u64, LiveMapping>,
    next_id: u64,
    registered: bool,
}

impl<B: DmaBackend> MappingDevice<B> {
    /// Register the entry point.
    pub fn register(name: &str, backend: B, observer: Box<dyn VmaObserver>) -> Self {
        info!(name = %name, mode = %format!("{:o}", DEVICE_MODE), "Mapping device registered");
        Self {
            name: name.to_string(),
            backend,
            tracker: LifecycleTracker::new(observer),
            live: BTreeMap::new(),
            next_id: 1,
            registered: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn live_mappings(&self) -> usize {
        self.live.len()
    }

    /// Buffer backing a live mapping.
    pub fn buffer(&self, mapping: &Mapping) -> Option<&DmaBuffer> {
        self.live.get(&mapping.id).map(|m| &m.buffer)
    }

    /// Allocate a coherent buffer of `len` bytes and map it non-cached at
    /// `requested` (or wherever the backend chooses).
    pub fn acquire_mapping(&mut self, requested: Option<u64>, len: usize) -> Result<Mapping> {
        if len == 0 {
            metrics::record_buffer_failure("allocation");
            return Err(DmaPassError::AllocationFailure {
                len,
                reason: "zero-length request".to_string(),
            });
        }

        let buffer = self.backend.alloc_coherent(len).map_err(|e| {
            metrics::record_buffer_failure("allocation");
            e
        })?;

        let range = match self.backend.remap_range(requested, &buffer, PageProtection::NonCached) {
            Ok(range) => range,
            Err(e) => {
                metrics::record_buffer_failure("map");
                warn!(
                    handle = buffer.handle,
                    error = %e,
                    "Page installation failed, releasing buffer"
                );
                self.backend.free_coherent(buffer);
                return Err(e);
            }
        };
        metrics::record_buffer_allocation(buffer.len);

        let id = self.next_id;
        self.next_id += 1;
        let live = LiveMapping { range, buffer };
        self.tracker.open(&live.vma(id));
        self.live.insert(id, live);

        debug!(
            device = %self.name,
            id,
            start = %format!("{:#x}", range.start),
            len = range.len,
            "Mapping acquired"
        );
        Ok(Mapping { id, range, prot: PageProtection::NonCached })
    }

    /// Tear down a mapping and free its buffer.
    pub fn close_mapping(&mut self, mapping: Mapping) -> Result<()> {
        self.close_id(mapping.id)
    }

    fn close_id(&mut self, id: u64) -> Result<()> {
        let live = self.live.remove(&id).ok_or_else(|| DmaPassError::MapFailure {
            reason: format!("mapping {} is not live on {}", id, self.name),
        })?;

        let unmapped = self.backend.unmap_range(live.range);
        self.tracker.close(&live.vma(id));
        self.backend.free_coherent(live.buffer);
        unmapped
    }

    /// Unregister the entry point, closing every live mapping.
    pub fn teardown(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.registered {
            return;
        }
        let ids: Vec<u64> = self.live.keys().rev().copied().collect();
        for id in ids {
            if let Err(e) = self.close_id(id) {
                warn!(device = %self.name, id, error = %e, "Failed to close mapping at teardown");
            }
        }
        self.registered = false;
        info!(name = %self.name, "Mapping device unregistered");
    }
}

impl<B: DmaBackend> Drop for MappingDevice<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<B: DmaBackend> MappingEntryPoint for MappingDevice<B> {
    fn granularity(&self) -> usize {
        self.backend.granularity()
    }

    fn map_shared(&mut self, at: u64, len: usize) -> Result<VirtRange> {
        self.acquire_mapping(Some(at), len).map(|mapping| mapping.range())
    }

    fn unmap(&mut self, range: VirtRange) -> Result<()> {
        let id = self
            .live
            .iter()
            .find(|(_, live)| live.range == range)
            .map(|(id, _)| *id)
            .ok_or_else(|| DmaPassError::MapFailure {
                reason: format!("no live mapping at {:#x}", range.start),
            })?;
        self.close_id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_size;

    /// Backend whose allocation or installation can be made to fail.
    #[derive(Default)]
    struct FaultyBackend {
        fail_alloc: bool,
        fail_remap: bool,
        allocated: u32,
        freed: u32,
    }

    impl DmaBackend for FaultyBackend {
        fn alloc_coherent(&mut self, len: usize) -> Result<DmaBuffer> {
            if self.fail_alloc {
                return Err(DmaPassError::AllocationFailure { len, reason: "ENOMEM".to_string() });
            }
            self.allocated += 1;
            Ok(DmaBuffer { cpu_addr: 0x1000, dma_addr: 0x1000, len, handle: self.allocated as u64 })
        }
        fn free_coherent(&mut self, _buffer: DmaBuffer) {
            self.freed += 1;
        }
        fn remap_range(
            &mut self,
            at: Option<u64>,
            buffer: &DmaBuffer,
            _prot: PageProtection,
        ) -> Result<VirtRange> {
            if self.fail_remap {
                return Err(DmaPassError::MapFailure { reason: "EAGAIN".to_string() });
            }
            Ok(VirtRange { start: at.unwrap_or(0x7000_0000), len: buffer.len })
        }
        fn unmap_range(&mut self, _range: VirtRange) -> Result<()> {
            Ok(())
        }
    }

    fn host_device(observer: &RecordingObserver) -> MappingDevice<HostDmaBackend> {
        MappingDevice::register("dummymap", HostDmaBackend::new(), Box::new(observer.clone()))
    }

    #[test]
    fn test_acquire_and_close_fire_one_event_each() {
        let observer = RecordingObserver::new();
        let mut device = host_device(&observer);

        let len = 4 * page_size();
        let mapping = device.acquire_mapping(None, len).unwrap();
        assert_eq!(mapping.range().len, len);
        assert_eq!(mapping.protection(), PageProtection::NonCached);
        let vma = VmaInfo { id: mapping.id(), start: mapping.range().start, len };

        device.close_mapping(mapping).unwrap();
        device.teardown();

        assert_eq!(observer.events(), vec![VmaEvent::Opened(vma), VmaEvent::Closed(vma)]);
    }

    #[test]
    fn test_sequential_acquisitions_do_not_alias() {
        let observer = RecordingObserver::new();
        let mut device = host_device(&observer);
        let len = page_size();

        let first = device.acquire_mapping(None, len).unwrap();
        let second = device.acquire_mapping(None, len).unwrap();

        let a = device.buffer(&first).unwrap();
        let b = device.buffer(&second).unwrap();
        assert_ne!(a.handle, b.handle);
        assert!(a.cpu_addr + a.len as u64 <= b.cpu_addr || b.cpu_addr + b.len as u64 <= a.cpu_addr);

        // SAFETY: both ranges are live mappings of `len` bytes.
        unsafe {
            *(first.range().start as *mut u8) = 0x11;
            *(second.range().start as *mut u8) = 0x22;
            assert_eq!(*(a.cpu_addr as *const u8), 0x11);
            assert_eq!(*(b.cpu_addr as *const u8), 0x22);
        }

        device.close_mapping(first).unwrap();
        device.close_mapping(second).unwrap();
        assert_eq!(device.backend().outstanding(), 0);
    }

    #[test]
    fn test_map_failure_releases_buffer() {
        let observer = RecordingObserver::new();
        let backend = FaultyBackend { fail_remap: true, ..Default::default() };
        let mut device = MappingDevice::register("dummymap", backend, Box::new(observer.clone()));

        let err = device.acquire_mapping(Some(0x9_0000_0000), 0x20_0000).unwrap_err();
        assert!(matches!(err, DmaPassError::MapFailure { .. }));
        assert_eq!(device.backend().allocated, 1);
        assert_eq!(device.backend().freed, 1);
        assert_eq!(device.live_mappings(), 0);
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_allocation_failure() {
        let observer = RecordingObserver::new();
        let backend = FaultyBackend { fail_alloc: true, ..Default::default() };
        let mut device = MappingDevice::register("dummymap", backend, Box::new(observer.clone()));

        let err = device.acquire_mapping(None, 0x20_0000).unwrap_err();
        assert!(matches!(err, DmaPassError::AllocationFailure { .. }));
        assert!(matches!(
            device.acquire_mapping(None, 0),
            Err(DmaPassError::AllocationFailure { len: 0, .. })
        ));
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_teardown_closes_live_mappings() {
        let observer = RecordingObserver::new();
        let backend = FaultyBackend::default();
        let mut device = MappingDevice::register("dummymap", backend, Box::new(observer.clone()));

        let _first = device.acquire_mapping(Some(0x9_0000_0000), 0x1000).unwrap();
        let _second = device.acquire_mapping(Some(0x9_1000_0000), 0x1000).unwrap();
        drop(device);

        let events = observer.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[2], VmaEvent::Closed(VmaInfo { id: 2, .. })));
        assert!(matches!(events[3], VmaEvent::Closed(VmaInfo { id: 1, .. })));
    }

    #[test]
    fn test_entry_point_unmap_by_range() {
        let observer = RecordingObserver::new();
        let backend = FaultyBackend::default();
        let mut device = MappingDevice::register("dummymap", backend, Box::new(observer.clone()));

        let range = device.map_shared(0x9_0000_0000, 0x20_0000).unwrap();
        assert_eq!(range, VirtRange { start: 0x9_0000_0000, len: 0x20_0000 });
        device.unmap(range).unwrap();
        assert!(device.unmap(range).is_err());
        assert_eq!(device.backend().freed, 1);
    }
}

//! Coherent allocation and page remapping behind the buffer provider.

use super::{DmaBuffer, PageProtection, VirtRange};
use crate::error::{DmaPassError, Result};
use crate::memory::mmap::{self, page_size, round_up};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use tracing::{debug, warn};

/// Allocator and page installer used by `MappingDevice`.
///
/// In a kernel this is `dma_alloc_coherent` plus `remap_pfn_range`.
pub trait DmaBackend {
    /// Allocate `len` bytes of DMA-capable memory.
    fn alloc_coherent(&mut self, len: usize) -> Result<DmaBuffer>;

    /// Return a buffer obtained from `alloc_coherent`.
    fn free_coherent(&mut self, buffer: DmaBuffer);

    /// Install the buffer's pages into the caller's address space.
    fn remap_range(
        &mut self,
        at: Option<u64>,
        buffer: &DmaBuffer,
        prot: PageProtection,
    ) -> Result<VirtRange>;

    /// Remove pages installed by `remap_range`.
    fn unmap_range(&mut self, range: VirtRange) -> Result<()>;

    /// Mapping granularity in bytes.
    fn granularity(&self) -> usize {
        page_size()
    }
}

struct HostBuffer {
    memfd: File,
    kernel_view: u64,
    len: usize,
}

/// In-process backend built on `memfd_create(2)`.
///
/// Each buffer is a memfd mapped once as the provider's own view; caller
/// mappings map the same memfd, so both views share pages. There is no
/// bus-address translation in user space, so the DMA address equals the
/// provider's view.
#[derive(Default)]
pub struct HostDmaBackend {
    buffers: HashMap<u64, HostBuffer>,
    next_handle: u64,
}

impl HostDmaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers currently allocated.
    pub fn outstanding(&self) -> usize {
        self.buffers.len()
    }
}

impl DmaBackend for HostDmaBackend {
    fn alloc_coherent(&mut self, len: usize) -> Result<DmaBuffer> {
        let fail = |reason: String| DmaPassError::AllocationFailure { len, reason };
        let len = round_up(len, page_size());

        // SAFETY: the name is a NUL-terminated literal.
        let fd = unsafe {
            libc::memfd_create(b"dmapass-coherent\0".as_ptr().cast(), libc::MFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(fail(format!("memfd_create: {}", std::io::Error::last_os_error())));
        }
        // SAFETY: memfd_create returned a new descriptor we now own.
        let memfd = unsafe { File::from_raw_fd(fd) };
        memfd.set_len(len as u64).map_err(|e| fail(format!("ftruncate: {}", e)))?;

        let kernel_view = mmap::map(
            None,
            len,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            memfd.as_raw_fd(),
        )
        .map_err(|e| fail(format!("mmap: {}", e)))?;

        let handle = self.next_handle;
        self.next_handle += 1;
        self.buffers.insert(handle, HostBuffer { memfd, kernel_view, len });

        debug!(handle, len, addr = %format!("{:#x}", kernel_view), "Allocated coherent buffer");
        Ok(DmaBuffer { cpu_addr: kernel_view, dma_addr: kernel_view, len, handle })
    }

    fn free_coherent(&mut self, buffer: DmaBuffer) {
        match self.buffers.remove(&buffer.handle) {
            Some(host) => {
                if let Err(e) = mmap::unmap(host.kernel_view, host.len) {
                    warn!(handle = buffer.handle, error = %e, "Failed to unmap buffer view");
                }
                debug!(handle = buffer.handle, "Freed coherent buffer");
            }
            None => warn!(handle = buffer.handle, "Free of unknown buffer"),
        }
    }

    fn remap_range(
        &mut self,
        at: Option<u64>,
        buffer: &DmaBuffer,
        prot: PageProtection,
    ) -> Result<VirtRange> {
        let host = self.buffers.get(&buffer.handle).ok_or_else(|| DmaPassError::MapFailure {
            reason: format!("unknown buffer handle {}", buffer.handle),
        })?;

        // User space cannot change caching attributes; the protection is
        // recorded on the mapping only.
        let start = mmap::map(at, host.len, libc::MAP_SHARED, host.memfd.as_raw_fd()).map_err(
            |e| DmaPassError::MapFailure {
                reason: match at {
                    Some(addr) => format!("mmap at {:#x}: {}", addr, e),
                    None => format!("mmap: {}", e),
                },
            },
        )?;

        debug!(handle = buffer.handle, start = %format!("{:#x}", start), ?prot, "Installed pages");
        Ok(VirtRange { start, len: host.len })
    }

    fn unmap_range(&mut self, range: VirtRange) -> Result<()> {
        mmap::unmap(range.start, range.len).map_err(|e| DmaPassError::MapFailure {
            reason: format!("munmap {:#x}: {}", range.start, e),
        })
    }
}

impl Drop for HostDmaBackend {
    fn drop(&mut self) {
        for (handle, host) in self.buffers.drain() {
            warn!(handle, "Coherent buffer still allocated at backend drop");
            let _ = mmap::unmap(host.kernel_view, host.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_share_pages() {
        let mut backend = HostDmaBackend::new();
        let buffer = backend.alloc_coherent(8192).unwrap();
        let range = backend.remap_range(None, &buffer, PageProtection::NonCached).unwrap();
        assert_ne!(range.start, buffer.cpu_addr);

        // SAFETY: both ranges are live mappings of `buffer.len` bytes.
        unsafe {
            *(range.start as *mut u8).add(100) = 0xa5;
            assert_eq!(*(buffer.cpu_addr as *const u8).add(100), 0xa5);
        }

        backend.unmap_range(range).unwrap();
        backend.free_coherent(buffer);
        assert_eq!(backend.outstanding(), 0);
    }

    #[test]
    fn test_allocation_rounds_to_pages() {
        let mut backend = HostDmaBackend::new();
        let buffer = backend.alloc_coherent(1).unwrap();
        assert_eq!(buffer.len, page_size());
        backend.free_coherent(buffer);
    }
}

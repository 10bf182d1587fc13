//! Memory sources for the DMA target range.
//!
//! Three interchangeable strategies produce a mapped virtual range:
//!
//! | selector | strategy            | backing                                   |
//! |----------|---------------------|-------------------------------------------|
//! | 0        | `Anonymous`         | private zero-filled pages at a fixed address |
//! | 1        | `ProviderBacked`    | buffer provider entry point, fixed address |
//! | 2        | `PersistentMemory`  | device-DAX character device               |
//!
//! Every failure surfaces as `AcquisitionFailure`.

pub mod mmap;

pub use mmap::{is_page_aligned, page_size, round_up};

use crate::config::PassthroughConfig;
use crate::error::{DmaPassError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A mapped range of the process address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VirtRange {
    pub start: u64,
    pub len: usize,
}

impl VirtRange {
    /// View the range as bytes.
    ///
    /// # Safety
    ///
    /// The range must be a live read/write mapping that nothing else aliases
    /// mutably for the lifetime of the slice.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.start as *mut u8, self.len)
    }
}

/// Memory source selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryStrategy {
    #[default]
    Anonymous,
    ProviderBacked,
    PersistentMemory,
}

impl MemoryStrategy {
    /// Parse the numeric selector of the command surface.
    pub fn from_selector(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Anonymous),
            1 => Ok(Self::ProviderBacked),
            2 => Ok(Self::PersistentMemory),
            other => Err(DmaPassError::InvalidConfig {
                reason: format!(
                    "invalid memory type {} (0: anonymous mmap, 1: dummymap, 2: devdax map)",
                    other
                ),
            }),
        }
    }

    pub fn selector(self) -> u8 {
        match self {
            Self::Anonymous => 0,
            Self::ProviderBacked => 1,
            Self::PersistentMemory => 2,
        }
    }
}

impl fmt::Display for MemoryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "anonymous"),
            Self::ProviderBacked => write!(f, "provider-backed"),
            Self::PersistentMemory => write!(f, "persistent-memory"),
        }
    }
}

/// Uniform acquire/release contract over the strategies.
pub trait MemorySource {
    fn strategy(&self) -> MemoryStrategy;

    /// Map `len` bytes. The returned range is exactly `len` bytes and page aligned.
    fn acquire(&mut self, len: usize) -> Result<VirtRange>;

    /// Unmap a range returned by `acquire`.
    fn release(&mut self, range: VirtRange) -> Result<()>;
}

/// Shared-mapping entry point of a buffer provider.
pub trait MappingEntryPoint {
    /// Lengths are rounded up to this many bytes.
    fn granularity(&self) -> usize;

    /// Map `len` bytes shared at exactly `at`.
    fn map_shared(&mut self, at: u64, len: usize) -> Result<VirtRange>;

    fn unmap(&mut self, range: VirtRange) -> Result<()>;
}

impl<E: MappingEntryPoint + ?Sized> MappingEntryPoint for &mut E {
    fn granularity(&self) -> usize {
        (**self).granularity()
    }

    fn map_shared(&mut self, at: u64, len: usize) -> Result<VirtRange> {
        (**self).map_shared(at, len)
    }

    fn unmap(&mut self, range: VirtRange) -> Result<()> {
        (**self).unmap(range)
    }
}

fn check_len(strategy: MemoryStrategy, len: usize) -> Result<()> {
    if len == 0 {
        return Err(DmaPassError::acquisition(strategy, "zero-length request"));
    }
    Ok(())
}

/// Private anonymous memory at a fixed address.
#[derive(Debug)]
pub struct AnonymousSource {
    target: u64,
}

impl AnonymousSource {
    pub fn new(target: u64) -> Self {
        Self { target }
    }
}

impl MemorySource for AnonymousSource {
    fn strategy(&self) -> MemoryStrategy {
        MemoryStrategy::Anonymous
    }

    fn acquire(&mut self, len: usize) -> Result<VirtRange> {
        check_len(self.strategy(), len)?;
        let mapped = round_up(len, page_size());
        let start = mmap::map(
            Some(self.target),
            mapped,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
        )
        .map_err(|e| {
            DmaPassError::acquisition(self.strategy(), format!("mmap at {:#x}: {}", self.target, e))
        })?;

        info!(start = %format!("{:#x}", start), len, "Anonymous memory mapped");
        Ok(VirtRange { start, len })
    }

    fn release(&mut self, range: VirtRange) -> Result<()> {
        mmap::unmap(range.start, round_up(range.len, page_size()))
            .map_err(|e| DmaPassError::acquisition(self.strategy(), format!("munmap: {}", e)))
    }
}

/// Memory from a buffer provider, mapped at a fixed address.
pub struct ProviderSource<E: MappingEntryPoint> {
    entry: E,
    target: u64,
}

impl<E: MappingEntryPoint> ProviderSource<E> {
    pub fn new(entry: E, target: u64) -> Self {
        Self { entry, target }
    }

    pub fn entry(&self) -> &E {
        &self.entry
    }
}

impl<E: MappingEntryPoint> MemorySource for ProviderSource<E> {
    fn strategy(&self) -> MemoryStrategy {
        MemoryStrategy::ProviderBacked
    }

    fn acquire(&mut self, len: usize) -> Result<VirtRange> {
        check_len(self.strategy(), len)?;
        let mapped = round_up(len, self.entry.granularity());
        let range = self
            .entry
            .map_shared(self.target, mapped)
            .map_err(|e| DmaPassError::acquisition(self.strategy(), e))?;

        if range.start != self.target {
            if let Err(e) = self.entry.unmap(range) {
                warn!(
                    start = %format!("{:#x}", range.start),
                    error = %e,
                    "Failed to unmap misplaced provider mapping"
                );
            }
            return Err(DmaPassError::acquisition(
                self.strategy(),
                format!("mapped at {:#x} instead of {:#x}", range.start, self.target),
            ));
        }

        info!(start = %format!("{:#x}", range.start), len, mapped, "Provider memory mapped");
        Ok(VirtRange { start: range.start, len })
    }

    fn release(&mut self, range: VirtRange) -> Result<()> {
        let len = round_up(range.len, self.entry.granularity());
        self.entry
            .unmap(VirtRange { start: range.start, len })
            .map_err(|e| DmaPassError::acquisition(self.strategy(), e))
    }
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| DmaPassError::OpenFailure { path: path.to_path_buf(), source: e })
}

/// The provider's special file (e.g. `/dev/dummymap`).
///
/// The handle stays open while any mapping made through it is live; closing
/// it lets the provider release the buffers.
#[derive(Debug)]
pub struct DevNodeEntryPoint {
    path: PathBuf,
    file: Option<File>,
    live: usize,
}

impl DevNodeEntryPoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: None, live: 0 }
    }
}

impl MappingEntryPoint for DevNodeEntryPoint {
    fn granularity(&self) -> usize {
        page_size()
    }

    fn map_shared(&mut self, at: u64, len: usize) -> Result<VirtRange> {
        if self.file.is_none() {
            self.file = Some(open_rw(&self.path)?);
            debug!(path = %self.path.display(), "Opened mapping entry point");
        }
        let fd = self.file.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1);

        let start = mmap::map(Some(at), len, libc::MAP_SHARED, fd).map_err(|e| {
            let reason = format!("mmap {} at {:#x}: {}", self.path.display(), at, e);
            DmaPassError::MapFailure { reason }
        })?;
        self.live += 1;
        Ok(VirtRange { start, len })
    }

    fn unmap(&mut self, range: VirtRange) -> Result<()> {
        mmap::unmap(range.start, range.len)
            .map_err(|e| DmaPassError::MapFailure { reason: format!("munmap: {}", e) })?;
        self.live = self.live.saturating_sub(1);
        if self.live == 0 {
            self.file = None;
        }
        Ok(())
    }
}

/// Shared mapping of a persistent-memory character device (`/dev/daxX.Y`).
#[derive(Debug)]
pub struct PersistentMemorySource {
    path: PathBuf,
    file: Option<File>,
}

impl PersistentMemorySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), file: None }
    }
}

impl MemorySource for PersistentMemorySource {
    fn strategy(&self) -> MemoryStrategy {
        MemoryStrategy::PersistentMemory
    }

    fn acquire(&mut self, len: usize) -> Result<VirtRange> {
        check_len(self.strategy(), len)?;
        let file = open_rw(&self.path).map_err(|e| DmaPassError::acquisition(self.strategy(), e))?;

        let start = mmap::map(None, round_up(len, page_size()), libc::MAP_SHARED, file.as_raw_fd())
            .map_err(|e| {
                let reason = format!("mmap {}: {}", self.path.display(), e);
                DmaPassError::acquisition(self.strategy(), reason)
            })?;
        self.file = Some(file);

        info!(
            path = %self.path.display(),
            start = %format!("{:#x}", start),
            len,
            "Persistent memory mapped"
        );
        Ok(VirtRange { start, len })
    }

    fn release(&mut self, range: VirtRange) -> Result<()> {
        let unmapped = mmap::unmap(range.start, round_up(range.len, page_size()))
            .map_err(|e| DmaPassError::acquisition(self.strategy(), format!("munmap: {}", e)));
        self.file = None;
        unmapped
    }
}

/// Build the memory source selected in `config`, talking to the real devices.
pub fn source_for(config: &PassthroughConfig) -> Box<dyn MemorySource> {
    match config.strategy {
        MemoryStrategy::Anonymous => Box::new(AnonymousSource::new(config.target_addr)),
        MemoryStrategy::ProviderBacked => Box::new(ProviderSource::new(
            DevNodeEntryPoint::new(&config.dummymap_path),
            config.target_addr,
        )),
        MemoryStrategy::PersistentMemory => {
            Box::new(PersistentMemorySource::new(&config.devdax_path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const MIB2: usize = 2 * 1024 * 1024;

    fn backing_file(len: usize) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(len as u64).unwrap();
        file
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!(MemoryStrategy::from_selector(0).unwrap(), MemoryStrategy::Anonymous);
        assert_eq!(MemoryStrategy::from_selector(1).unwrap(), MemoryStrategy::ProviderBacked);
        assert_eq!(MemoryStrategy::from_selector(2).unwrap(), MemoryStrategy::PersistentMemory);
        assert!(MemoryStrategy::from_selector(5).is_err());
        assert!(MemoryStrategy::from_selector(-1).is_err());
        assert_eq!(MemoryStrategy::PersistentMemory.selector(), 2);
    }

    #[test]
    fn test_anonymous_fixed_zero_filled() {
        let target = 0x9_4000_0000;
        let mut source = AnonymousSource::new(target);
        let range = source.acquire(MIB2).unwrap();

        assert_eq!(range, VirtRange { start: target, len: MIB2 });
        assert!(is_page_aligned(range.start));
        // SAFETY: freshly mapped private range owned by this test.
        let bytes = unsafe { range.as_mut_slice() };
        assert!(bytes.iter().all(|b| *b == 0));
        bytes[MIB2 - 1] = 0xff;

        source.release(range).unwrap();
    }

    #[test]
    fn test_anonymous_refuses_occupied_address() {
        let target = 0x9_5000_0000;
        let mut first = AnonymousSource::new(target);
        let mut second = AnonymousSource::new(target);

        let range = first.acquire(MIB2).unwrap();
        let err = second.acquire(MIB2).unwrap_err();
        assert!(matches!(err, DmaPassError::AcquisitionFailure { .. }));

        first.release(range).unwrap();
    }

    #[test]
    fn test_provider_source_through_dev_node() {
        let backing = backing_file(MIB2);
        let target = 0x9_6000_0000;
        let mut source = ProviderSource::new(DevNodeEntryPoint::new(backing.path()), target);

        let range = source.acquire(MIB2).unwrap();
        assert_eq!(range, VirtRange { start: target, len: MIB2 });
        // SAFETY: shared mapping of the backing file, owned by this test.
        unsafe { range.as_mut_slice()[0] = 0x5a };
        source.release(range).unwrap();
        assert!(source.entry().file.is_none());
    }

    #[test]
    fn test_provider_source_rounds_to_granularity() {
        let backing = backing_file(2 * page_size());
        let target = 0x9_7000_0000;
        let mut source = ProviderSource::new(DevNodeEntryPoint::new(backing.path()), target);

        let range = source.acquire(page_size() + 1).unwrap();
        assert_eq!(range.len, page_size() + 1);
        source.release(range).unwrap();
    }

    /// Entry point that ignores the requested address and fails to unmap.
    #[derive(Default)]
    struct MisplacingEntryPoint {
        unmap_attempts: usize,
    }

    impl MappingEntryPoint for MisplacingEntryPoint {
        fn granularity(&self) -> usize {
            page_size()
        }

        fn map_shared(&mut self, at: u64, len: usize) -> Result<VirtRange> {
            Ok(VirtRange { start: at + page_size() as u64, len })
        }

        fn unmap(&mut self, _range: VirtRange) -> Result<()> {
            self.unmap_attempts += 1;
            Err(DmaPassError::MapFailure { reason: "EINVAL".to_string() })
        }
    }

    #[test]
    fn test_provider_source_rejects_misplaced_mapping() {
        let mut source = ProviderSource::new(MisplacingEntryPoint::default(), 0x9_a000_0000);

        let err = source.acquire(MIB2).unwrap_err();
        assert!(matches!(err, DmaPassError::AcquisitionFailure { .. }));
        assert!(err.to_string().contains("instead of 0x9a0000000"));
        // Cleanup was attempted even though it failed
        assert_eq!(source.entry().unmap_attempts, 1);
    }

    #[test]
    fn test_missing_entry_points_normalize_to_acquisition_failure() {
        let entry = DevNodeEntryPoint::new("/nonexistent/dummymap");
        let mut provider = ProviderSource::new(entry, 0x9_8000_0000);
        assert!(matches!(provider.acquire(MIB2), Err(DmaPassError::AcquisitionFailure { .. })));

        let mut dax = PersistentMemorySource::new("/nonexistent/dax0.0");
        assert!(matches!(dax.acquire(MIB2), Err(DmaPassError::AcquisitionFailure { .. })));

        let mut anon = AnonymousSource::new(0x9_9000_0000);
        assert!(matches!(anon.acquire(0), Err(DmaPassError::AcquisitionFailure { .. })));
    }

    #[test]
    fn test_persistent_memory_source() {
        let backing = backing_file(MIB2);
        let mut source = PersistentMemorySource::new(backing.path());

        let range = source.acquire(MIB2).unwrap();
        assert_eq!(range.len, MIB2);
        assert!(is_page_aligned(range.start));
        source.release(range).unwrap();
    }

    #[test]
    fn test_source_for_config() {
        let config =
            PassthroughConfig { strategy: MemoryStrategy::PersistentMemory, ..Default::default() };
        assert_eq!(source_for(&config).strategy(), MemoryStrategy::PersistentMemory);
        let config = PassthroughConfig::default();
        assert_eq!(source_for(&config).strategy(), MemoryStrategy::Anonymous);
    }
}

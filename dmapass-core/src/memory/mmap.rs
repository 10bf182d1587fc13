//! Thin wrappers over `mmap(2)` / `munmap(2)`.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Round `len` up to a multiple of `granularity` (a power of two).
pub fn round_up(len: usize, granularity: usize) -> usize {
    debug_assert!(granularity.is_power_of_two());
    (len + granularity - 1) & !(granularity - 1)
}

pub fn is_page_aligned(addr: u64) -> bool {
    addr % page_size() as u64 == 0
}

pub(crate) const PROT_RW: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;

/// Map `len` bytes. With `at` set, the mapping is placed exactly there or the
/// call fails; existing mappings are never replaced.
pub(crate) fn map(
    at: Option<u64>,
    len: usize,
    flags: libc::c_int,
    fd: RawFd,
) -> io::Result<u64> {
    let (hint, flags) = match at {
        Some(addr) => (addr as *mut libc::c_void, flags | libc::MAP_FIXED_NOREPLACE),
        None => (ptr::null_mut(), flags),
    };

    // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping, and a
    // null hint lets the kernel choose a free range.
    let ret = unsafe { libc::mmap(hint, len, PROT_RW, flags, fd, 0) };
    if ret == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    let addr = ret as u64;
    if let Some(wanted) = at {
        // Kernels before 4.17 treat MAP_FIXED_NOREPLACE as a plain hint.
        if addr != wanted {
            let _ = unmap(addr, len);
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
    }
    Ok(addr)
}

pub(crate) fn unmap(addr: u64, len: usize) -> io::Result<()> {
    // SAFETY: callers only pass ranges they obtained from `map`.
    let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

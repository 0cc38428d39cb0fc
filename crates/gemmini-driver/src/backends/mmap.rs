//! Physical-memory mappings through `/dev/mem`
//!
//! Under gem5 the accelerator's registers sit at a fixed physical address
//! with no bus to enumerate, so the window is mapped straight out of
//! `/dev/mem` (opened `O_SYNC`, which makes the kernel map it uncached).
//! [`MmioWindow`] wraps that mapping as a [`RegisterBlock`] with volatile,
//! bounds-checked 64-bit accesses.

use crate::error::{GemminiError, Result};
use crate::mmio::RegisterBlock;
use gemmini_chip::platform::PAGE_SIZE;
use gemmini_chip::regs;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Physical memory device node
pub const DEV_MEM: &str = "/dev/mem";

/// A shared, writable mapping of `size` bytes at physical offset `base`
#[derive(Debug)]
pub(crate) struct PhysMapping {
    ptr: NonNull<u8>,
    size: usize,
    base: u64,
    path: PathBuf,
    _file: File,
}

impl PhysMapping {
    pub(crate) fn open(path: &Path, base: u64, size: u64) -> Result<Self> {
        if base % PAGE_SIZE as u64 != 0 {
            return Err(GemminiError::config(format!(
                "physical base {base:#x} is not page aligned"
            )));
        }
        let size = usize::try_from(size)
            .ok()
            .filter(|&s| s > 0)
            .ok_or_else(|| GemminiError::config(format!("cannot map {size:#x} bytes")))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => GemminiError::device_not_found(path),
                _ => GemminiError::Io { source: e },
            })?;

        tracing::debug!("Mapping {size:#x} bytes at {base:#x} from {}", path.display());

        // SAFETY: Invariants: (1) the fd was just opened read/write and stays open in
        // `_file` for the mapping's lifetime; (2) size is non-zero and base is page
        // aligned (checked above); (3) MAP_SHARED so device writes are visible;
        // (4) the result is only used through this struct and unmapped in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                base,
            )
        }
        .map_err(|e| GemminiError::map_failed(format!("mmap {}@{base:#x}: {e}", path.display())))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| GemminiError::map_failed("mmap returned null"))?;

        tracing::info!(
            "Mapped {} [{base:#x}, {:#x}) at {ptr:p}",
            path.display(),
            base + size as u64
        );

        Ok(Self {
            ptr,
            size,
            base,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) const fn size(&self) -> usize {
        self.size
    }

    pub(crate) const fn base(&self) -> u64 {
        self.base
    }
}

impl Drop for PhysMapping {
    fn drop(&mut self) {
        tracing::debug!("Unmapping {} at {:#x}", self.path.display(), self.base);
        // SAFETY: ptr and size are exactly what mmap returned and was given; nothing
        // borrows the mapping once its owner is being dropped.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: Send - the mapping is owned exclusively by this struct and stays valid
// while the fd is held; moving it between threads does not affect the mapping.
unsafe impl Send for PhysMapping {}

// SAFETY: Sync - the struct's fields are immutable after construction. Concurrent
// access to the mapped bytes is mediated by the owners (volatile register accesses
// in MmioWindow, disjoint allocator-owned ranges in CarveoutAllocator).
unsafe impl Sync for PhysMapping {}

/// The GemminiDevA register window
#[derive(Debug)]
pub struct MmioWindow {
    map: PhysMapping,
}

impl MmioWindow {
    /// Map `size` bytes of registers at physical `base` from `/dev/mem`
    ///
    /// # Errors
    ///
    /// - `DeviceNotFound` if `/dev/mem` does not exist
    /// - `Io` if it cannot be opened (usually permissions)
    /// - `Config` for an unaligned base or a window smaller than the register block
    /// - `MapFailed` if the kernel refuses the mapping
    pub fn open(base: u64, size: u64) -> Result<Self> {
        Self::open_path(Path::new(DEV_MEM), base, size)
    }

    /// Map a register window from an arbitrary file
    ///
    /// # Errors
    ///
    /// See [`MmioWindow::open`].
    pub fn open_path(path: &Path, base: u64, size: u64) -> Result<Self> {
        if size < regs::BLOCK_SIZE as u64 {
            return Err(GemminiError::config(format!(
                "MMIO window of {size:#x} bytes cannot hold the {:#x}-byte register block",
                regs::BLOCK_SIZE
            )));
        }
        Ok(Self {
            map: PhysMapping::open(path, base, size)?,
        })
    }

    /// Physical base address
    pub const fn base(&self) -> u64 {
        self.map.base()
    }

    /// Mapped size in bytes
    pub const fn size(&self) -> usize {
        self.map.size()
    }

    fn check(&self, offset: usize) {
        assert!(
            offset % regs::REGISTER_WIDTH == 0
                && offset.checked_add(regs::REGISTER_WIDTH).is_some_and(|end| end <= self.map.size()),
            "Register offset {offset:#x} out of bounds (window {:#x})",
            self.map.size()
        );
    }
}

impl RegisterBlock for MmioWindow {
    fn read64(&self, offset: usize) -> u64 {
        self.check(offset);
        // SAFETY: Invariants: (1) offset + 8 <= size (checked); (2) offset is 8-byte
        // aligned and the mapping is page aligned, so the u64 access is aligned;
        // (3) volatile, so the compiler neither elides nor reorders the access.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.map.as_ptr().add(offset).cast::<u64>().read_volatile() };
        tracing::trace!("Read64 @ {offset:#x} = {value:#x}");
        value
    }

    fn write64(&self, offset: usize, value: u64) {
        self.check(offset);
        tracing::trace!("Write64 @ {offset:#x} = {value:#x}");
        // SAFETY: same invariants as read64.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.map.as_ptr().add(offset).cast::<u64>().write_volatile(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn backing(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn register_writes_reach_the_backing_file() {
        let f = backing(PAGE_SIZE);
        let win = MmioWindow::open_path(f.path(), 0, PAGE_SIZE as u64).unwrap();
        win.write64(regs::SIZE_M, 0x1122_3344_5566_7788);
        assert_eq!(win.read64(regs::SIZE_M), 0x1122_3344_5566_7788);
        drop(win);

        let mut file = f.reopen().unwrap();
        file.seek(SeekFrom::Start(regs::SIZE_M as u64)).unwrap();
        let mut raw = [0u8; 8];
        file.read_exact(&mut raw).unwrap();
        assert_eq!(u64::from_ne_bytes(raw), 0x1122_3344_5566_7788);
    }

    #[test]
    fn rejects_bad_windows() {
        let f = backing(PAGE_SIZE);
        assert!(matches!(
            MmioWindow::open_path(f.path(), 0x10, PAGE_SIZE as u64),
            Err(GemminiError::Config { .. })
        ));
        assert!(matches!(
            MmioWindow::open_path(f.path(), 0, 0x20),
            Err(GemminiError::Config { .. })
        ));
        assert!(matches!(
            MmioWindow::open_path(Path::new("/nonexistent/gemmini"), 0, PAGE_SIZE as u64),
            Err(GemminiError::DeviceNotFound { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn access_past_window_panics() {
        let f = backing(PAGE_SIZE);
        let win = MmioWindow::open_path(f.path(), 0, PAGE_SIZE as u64).unwrap();
        win.read64(PAGE_SIZE);
    }

    #[test]
    #[ignore = "requires /dev/mem access and a GemminiDevA at the default base"]
    fn read_status_from_hardware() {
        use gemmini_chip::platform;
        let win = match MmioWindow::open(platform::DEFAULT_MMIO_BASE, platform::DEFAULT_MMIO_SIZE) {
            Ok(w) => w,
            Err(e) => {
                println!("ℹ️  Skipping test: {e}");
                return;
            }
        };
        println!("STATUS = {:#x}", win.read64(regs::STATUS));
    }
}

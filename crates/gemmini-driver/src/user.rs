//! Caller memory access
//!
//! The submission never dereferences caller addresses directly. It goes
//! through [`UserMemory`], which reports an unreadable or unwritable range as
//! [`GemminiError::Fault`] instead of crashing.

use crate::error::{GemminiError, Result};
use std::fmt::Debug;

/// Bulk copy between caller memory and driver-owned buffers
pub trait UserMemory: Debug + Send + Sync {
    /// Fill `dst` from caller memory starting at `src`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if any byte of the source range is inaccessible.
    fn copy_from_user(&self, src: u64, dst: &mut [u8]) -> Result<()>;

    /// Write `src` to caller memory starting at `dst`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if any byte of the destination range is inaccessible.
    fn copy_to_user(&self, dst: u64, src: &[u8]) -> Result<()>;
}

/// The calling process's own address space
///
/// Uses `process_vm_readv` / `process_vm_writev` against the current pid so
/// the kernel validates the range: a bad pointer becomes `EFAULT` rather
/// than a segfault.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    /// Handle on the current process
    pub const fn new() -> Self {
        Self
    }
}

impl UserMemory for ProcessMemory {
    fn copy_from_user(&self, src: u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: dst.as_mut_ptr().cast(),
            iov_len: dst.len(),
        };
        let remote = libc::iovec {
            iov_base: usize::try_from(src).map_err(|_| GemminiError::fault(src, dst.len()))?
                as *mut libc::c_void,
            iov_len: dst.len(),
        };

        // SAFETY: process_vm_readv on our own pid. Invariants: (1) `local` describes
        // `dst`, which we hold exclusively for its full length; (2) `remote` is never
        // dereferenced by us, the kernel validates it and returns EFAULT if unmapped;
        // (3) both iovec arrays have exactly one element, matching the counts passed.
        let copied = unsafe {
            libc::process_vm_readv(libc::getpid(), &raw const local, 1, &raw const remote, 1, 0)
        };

        if usize::try_from(copied).ok() != Some(dst.len()) {
            tracing::debug!(
                "copy_from_user {src:#x}+{} failed: {}",
                dst.len(),
                std::io::Error::last_os_error()
            );
            return Err(GemminiError::fault(src, dst.len()));
        }
        Ok(())
    }

    fn copy_to_user(&self, dst: u64, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: src.as_ptr().cast_mut().cast(),
            iov_len: src.len(),
        };
        let remote = libc::iovec {
            iov_base: usize::try_from(dst).map_err(|_| GemminiError::fault(dst, src.len()))?
                as *mut libc::c_void,
            iov_len: src.len(),
        };

        // SAFETY: process_vm_writev on our own pid. Invariants: (1) `local` describes
        // `src`, only read by the kernel despite the *mut in iovec; (2) `remote` is
        // validated by the kernel, unmapped or read-only pages yield EFAULT;
        // (3) one iovec on each side, matching the counts passed.
        let copied = unsafe {
            libc::process_vm_writev(libc::getpid(), &raw const local, 1, &raw const remote, 1, 0)
        };

        if usize::try_from(copied).ok() != Some(src.len()) {
            tracing::debug!(
                "copy_to_user {dst:#x}+{} failed: {}",
                src.len(),
                std::io::Error::last_os_error()
            );
            return Err(GemminiError::fault(dst, src.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_address_faults() {
        let mem = ProcessMemory::new();
        let mut buf = [0u8; 16];
        let err = mem.copy_from_user(0, &mut buf).unwrap_err();
        assert!(matches!(err, GemminiError::Fault { addr: 0, len: 16 }));
        let err = mem.copy_to_user(0, &buf).unwrap_err();
        assert!(matches!(err, GemminiError::Fault { addr: 0, len: 16 }));
    }

    #[test]
    fn own_memory_roundtrip() {
        let mem = ProcessMemory::new();
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 8];
        if mem.copy_from_user(src.as_ptr() as u64, &mut dst).is_err() {
            println!("ℹ️  Skipping test (process_vm_readv not permitted here)");
            return;
        }
        assert_eq!(dst, src);

        let mut out = [0u8; 8];
        mem.copy_to_user(out.as_mut_ptr() as u64, &[9; 8]).unwrap();
        assert_eq!(out, [9; 8]);
    }

    #[test]
    fn empty_copy_is_noop() {
        let mem = ProcessMemory::new();
        assert!(mem.copy_from_user(0, &mut []).is_ok());
        assert!(mem.copy_to_user(0, &[]).is_ok());
    }
}

//! Device-visible buffers for one submission
//!
//! A [`DmaAllocator`] hands out physically contiguous regions the accelerator
//! can address. [`DeviceBuffer`] owns one region and returns it to the
//! allocator on `Drop`, so every exit path of a submission frees what it
//! allocated. [`OperandBuffers`] groups the M, K and O buffers of a request
//! and moves caller data in and results out.

use crate::error::{GemminiError, Result};
use crate::request::Request;
use crate::sizing::SizePlan;
use crate::user::UserMemory;
use std::fmt::Debug;
use std::ptr::NonNull;
use tracing::{debug, trace, warn};

/// Raw allocation returned by a [`DmaAllocator`]
#[derive(Debug)]
pub struct DmaRegion {
    cpu: NonNull<u8>,
    bus: u64,
    len: usize,
}

// SAFETY: Send - a DmaRegion is the unique handle to its memory (from_raw_parts
// contract). Moving it between threads moves that ownership; no thread-local state.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// Wrap an allocation
    ///
    /// # Safety
    ///
    /// `cpu` must be valid for reads and writes of `len` bytes until the region
    /// is handed back to the allocator that produced it, no other reference to
    /// that memory may exist while this region is alive, and `bus` must be the
    /// address the device uses for the same bytes.
    pub const unsafe fn from_raw_parts(cpu: NonNull<u8>, bus: u64, len: usize) -> Self {
        Self { cpu, bus, len }
    }

    /// Host-side address
    pub const fn cpu_ptr(&self) -> NonNull<u8> {
        self.cpu
    }

    /// Device-side address
    pub const fn bus_addr(&self) -> u64 {
        self.bus
    }

    /// Length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Source of device-visible memory
pub trait DmaAllocator: Debug + Send + Sync {
    /// Allocate `len` bytes of coherent, physically contiguous memory
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when the request cannot be satisfied.
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion>;

    /// Return a region obtained from [`DmaAllocator::alloc_coherent`]
    fn free_coherent(&self, region: DmaRegion);
}

/// A region owned by one submission, freed when dropped
#[derive(Debug)]
pub struct DeviceBuffer<'a> {
    region: Option<DmaRegion>,
    allocator: &'a dyn DmaAllocator,
}

impl<'a> DeviceBuffer<'a> {
    /// Allocate `len` bytes from `allocator`
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the allocator fails.
    pub fn allocate(allocator: &'a dyn DmaAllocator, len: usize) -> Result<Self> {
        let region = allocator.alloc_coherent(len)?;
        if region.len() < len {
            let short = region.len();
            allocator.free_coherent(region);
            warn!("DMA allocator returned {short} bytes for a {len}-byte request");
            return Err(GemminiError::out_of_memory(len));
        }
        trace!("DMA alloc {len} bytes @ bus {:#x}", region.bus_addr());
        Ok(Self {
            region: Some(region),
            allocator,
        })
    }

    fn region(&self) -> &DmaRegion {
        // `region` is only taken in Drop.
        self.region.as_ref().unwrap_or_else(|| unreachable!("buffer used after free"))
    }

    /// Device-side address
    pub fn bus_addr(&self) -> u64 {
        self.region().bus_addr()
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.region().len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host view of the buffer
    pub fn as_slice(&self) -> &[u8] {
        let r = self.region();
        // SAFETY: (1) ptr valid for len bytes per DmaRegion::from_raw_parts; (2) the
        // region is exclusively owned by this buffer; (3) &self prevents concurrent
        // host mutation through this handle.
        unsafe { std::slice::from_raw_parts(r.cpu_ptr().as_ptr(), r.len()) }
    }

    /// Mutable host view of the buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let r = self.region();
        let (ptr, len) = (r.cpu_ptr().as_ptr(), r.len());
        // SAFETY: (1) ptr valid for len bytes; (2) &mut self gives exclusive access
        // to the only handle on this memory; (3) no other slice is alive.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    /// Fill the buffer from caller memory at `src`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if the caller range is inaccessible.
    pub fn fill_from_user(&mut self, user: &dyn UserMemory, src: u64) -> Result<()> {
        user.copy_from_user(src, self.as_mut_slice())
    }

    /// Copy the buffer out to caller memory at `dst`
    ///
    /// # Errors
    ///
    /// Returns `Fault` if the caller range is inaccessible.
    pub fn copy_to_user(&self, user: &dyn UserMemory, dst: u64) -> Result<()> {
        user.copy_to_user(dst, self.as_slice())
    }
}

impl Drop for DeviceBuffer<'_> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            trace!("DMA free {} bytes @ bus {:#x}", region.len(), region.bus_addr());
            self.allocator.free_coherent(region);
        }
    }
}

/// The M, K and O buffers of one submission
///
/// Fields drop in declaration order: output first, then K, then M, the
/// reverse of allocation.
#[derive(Debug)]
pub struct OperandBuffers<'a> {
    o: DeviceBuffer<'a>,
    k: Option<DeviceBuffer<'a>>,
    m: DeviceBuffer<'a>,
}

impl<'a> OperandBuffers<'a> {
    /// Allocate M, then K when the plan has one, then O
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if any allocation fails. Buffers allocated before
    /// the failure are freed before this returns.
    pub fn allocate(allocator: &'a dyn DmaAllocator, plan: &SizePlan) -> Result<Self> {
        let m = DeviceBuffer::allocate(allocator, plan.m_bytes())?;
        let k = if plan.has_k() {
            Some(DeviceBuffer::allocate(allocator, plan.k_bytes())?)
        } else {
            None
        };
        let o = DeviceBuffer::allocate(allocator, plan.o_bytes())?;
        debug!(
            "Allocated operands: m={}B k={}B o={}B",
            plan.m_bytes(),
            plan.k_bytes(),
            plan.o_bytes()
        );
        Ok(Self { o, k, m })
    }

    /// Copy caller inputs in and clear the output
    ///
    /// # Errors
    ///
    /// Returns `Fault` if reading operand M or K from the caller fails.
    pub fn stage(&mut self, user: &dyn UserMemory, request: &Request) -> Result<()> {
        self.m.fill_from_user(user, request.m_user())?;
        if let Some(k) = self.k.as_mut() {
            k.fill_from_user(user, request.k_user())?;
        }
        self.o.as_mut_slice().fill(0);
        Ok(())
    }

    /// Copy the output back to the caller
    ///
    /// # Errors
    ///
    /// Returns `Fault` if the caller's output range is inaccessible.
    pub fn retrieve(&self, user: &dyn UserMemory, o_user: u64) -> Result<()> {
        self.o.copy_to_user(user, o_user)
    }

    /// Bus addresses of M, K (0 when absent) and O
    pub fn bus_addrs(&self) -> (u64, u64, u64) {
        (
            self.m.bus_addr(),
            self.k.as_ref().map_or(0, DeviceBuffer::bus_addr),
            self.o.bus_addr(),
        )
    }

    /// Output buffer
    pub const fn output(&self) -> &DeviceBuffer<'a> {
        &self.o
    }
}

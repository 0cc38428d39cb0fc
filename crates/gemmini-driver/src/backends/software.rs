// SPDX-License-Identifier: AGPL-3.0-only

//! Software (simulated) backend
//!
//! Everything a [`DeviceSession`] needs, without hardware:
//!
//! - [`SoftwareDma`]: page-aligned host memory handed out as DMA regions,
//!   with bus addresses assigned from a linear window under the DMA mask.
//!   Counts every allocation and free, and can be told to fail.
//! - [`HostMemory`]: a simulated caller address space. Regions can be
//!   revoked or made read-only to provoke faults on copy-in or copy-out.
//! - [`SoftwareAccelerator`]: a register block that records every write,
//!   acknowledges the start pulse according to a [`CompletionMode`], and
//!   optionally hands the operand buffers to a caller-supplied kernel.
//!
//! The accelerator does not compute anything by itself. Tests that need
//! data to flow through the device install a kernel closure.

use crate::config::DriverConfig;
use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::{GemminiError, Result};
use crate::mmio::{RegisterBlock, RegisterImage};
use crate::session::DeviceSession;
use crate::user::UserMemory;
use gemmini_chip::platform::{self, PAGE_SIZE};
use gemmini_chip::regs;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

/// First bus address handed out by [`SoftwareDma`].
pub const DEFAULT_BUS_BASE: u64 = 0x8000_0000;

// ── DMA pool ─────────────────────────────────────────────────────────────────

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    /// Successful allocations
    pub allocations: u64,
    /// Regions returned
    pub frees: u64,
    /// Allocations refused
    pub failed: u64,
    /// Bytes currently allocated
    pub bytes_in_use: usize,
    /// High-water mark of `bytes_in_use`
    pub peak_bytes: usize,
}

impl DmaStats {
    /// Regions allocated and not yet freed
    pub const fn live(&self) -> u64 {
        self.allocations - self.frees
    }
}

#[derive(Debug)]
struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: Send - the pool is the sole owner of each allocation; the pointer is only
// dereferenced while the pool mutex is held or through the DmaRegion handed out for it.
unsafe impl Send for Allocation {}

#[derive(Debug)]
struct PoolState {
    next_bus: u64,
    live: BTreeMap<u64, Allocation>,
    stats: DmaStats,
    fail_in: Option<u64>,
}

/// Host-memory DMA allocator for simulation and tests
#[derive(Debug)]
pub struct SoftwareDma {
    state: Mutex<PoolState>,
    mask: u64,
    capacity: Option<usize>,
}

impl Default for SoftwareDma {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDma {
    /// Pool with the default bus window and a 48-bit mask
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                next_bus: DEFAULT_BUS_BASE,
                live: BTreeMap::new(),
                stats: DmaStats::default(),
                fail_in: None,
            }),
            mask: platform::dma_mask(platform::DMA_MASK_BITS),
            capacity: None,
        }
    }

    /// Restrict bus addresses to `bits` bits
    #[must_use]
    pub const fn with_mask_bits(mut self, bits: u32) -> Self {
        self.mask = platform::dma_mask(bits);
        self
    }

    /// Start assigning bus addresses at `base`
    #[must_use]
    pub fn with_bus_base(self, base: u64) -> Self {
        self.state.lock().next_bus = base;
        self
    }

    /// Refuse allocations once `bytes` are in use
    #[must_use]
    pub const fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Make the allocation `skip` requests from now fail (0 = the next one)
    pub fn fail_allocation(&self, skip: u64) {
        self.state.lock().fail_in = Some(skip);
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> DmaStats {
        self.state.lock().stats
    }

    /// Copy of the bytes of the live region at `bus`
    pub fn read_bus(&self, bus: u64) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let a = state.live.get(&bus)?;
        // SAFETY: (1) ptr valid for len bytes while the allocation is in `live`;
        // (2) the pool lock is held, so it cannot be freed concurrently.
        Some(unsafe { std::slice::from_raw_parts(a.ptr.as_ptr(), a.len) }.to_vec())
    }

    /// Run `f` over the M, K and O regions at the given bus addresses
    ///
    /// Returns `None` if any address is not a live region or if the output
    /// aliases an input.
    pub fn with_operands<R>(
        &self,
        addr_m: u64,
        addr_k: Option<u64>,
        addr_o: u64,
        f: impl FnOnce(&[u8], Option<&[u8]>, &mut [u8]) -> R,
    ) -> Option<R> {
        if addr_o == addr_m || Some(addr_o) == addr_k {
            return None;
        }
        let state = self.state.lock();
        let m = state.live.get(&addr_m)?;
        let k = match addr_k {
            Some(addr) => Some(state.live.get(&addr)?),
            None => None,
        };
        let o = state.live.get(&addr_o)?;

        // SAFETY: (1) each pointer is valid for its len while the pool lock is held;
        // (2) O is a different allocation from M and K (checked above), so the mutable
        // slice does not alias the shared ones; (3) M and K are only read.
        let (m, k, o) = unsafe {
            (
                std::slice::from_raw_parts(m.ptr.as_ptr(), m.len),
                k.map(|k| std::slice::from_raw_parts(k.ptr.as_ptr(), k.len)),
                std::slice::from_raw_parts_mut(o.ptr.as_ptr(), o.len),
            )
        };
        Some(f(m, k, o))
    }
}

impl DmaAllocator for SoftwareDma {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion> {
        let mut state = self.state.lock();

        match state.fail_in {
            Some(0) => {
                state.fail_in = None;
                state.stats.failed += 1;
                debug!("SoftwareDma: injected failure for {len} bytes");
                return Err(GemminiError::out_of_memory(len));
            }
            Some(n) => state.fail_in = Some(n - 1),
            None => {}
        }

        if let Some(cap) = self.capacity {
            if state.stats.bytes_in_use.saturating_add(len) > cap {
                state.stats.failed += 1;
                return Err(GemminiError::out_of_memory(len));
            }
        }

        let span = len.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let bus = state.next_bus;
        let fits = u64::try_from(span)
            .ok()
            .and_then(|s| bus.checked_add(s - 1))
            .is_some_and(|end| end <= self.mask);
        if !fits {
            state.stats.failed += 1;
            debug!("SoftwareDma: {len} bytes at {bus:#x} would exceed mask {:#x}", self.mask);
            return Err(GemminiError::out_of_memory(len));
        }

        let layout = Layout::from_size_align(len.max(1), PAGE_SIZE)
            .map_err(|_| GemminiError::out_of_memory(len))?;
        // SAFETY: layout has non-zero size and a power-of-two alignment; the pointer
        // is released with the same layout in free_coherent or Drop.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
            .ok_or(GemminiError::out_of_memory(len))?;

        state.next_bus = bus + span as u64;
        state.live.insert(bus, Allocation { ptr, layout, len });
        state.stats.allocations += 1;
        state.stats.bytes_in_use += len;
        state.stats.peak_bytes = state.stats.peak_bytes.max(state.stats.bytes_in_use);

        // SAFETY: ptr is a fresh allocation of at least len bytes, owned by the pool
        // and not otherwise referenced until free_coherent; bus is its device address.
        Ok(unsafe { DmaRegion::from_raw_parts(ptr, bus, len) })
    }

    fn free_coherent(&self, region: DmaRegion) {
        let mut state = self.state.lock();
        let bus = region.bus_addr();
        match state.live.remove(&bus) {
            Some(a) if a.ptr == region.cpu_ptr() => {
                // SAFETY: ptr was allocated with exactly this layout and is no longer
                // in `live`; the region handle is consumed by this call.
                unsafe { std::alloc::dealloc(a.ptr.as_ptr(), a.layout) };
                state.stats.frees += 1;
                state.stats.bytes_in_use -= a.len;
            }
            Some(a) => {
                warn!("SoftwareDma: region at {bus:#x} does not match its allocation");
                state.live.insert(bus, a);
            }
            None => warn!("SoftwareDma: free of unknown region at {bus:#x}"),
        }
    }
}

impl Drop for SoftwareDma {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.live.is_empty() {
            warn!("SoftwareDma dropped with {} live regions", state.live.len());
        }
        for (_, a) in std::mem::take(&mut state.live) {
            // SAFETY: allocated with this layout; the pool is being destroyed.
            unsafe { std::alloc::dealloc(a.ptr.as_ptr(), a.layout) };
        }
    }
}

// ── Caller address space ─────────────────────────────────────────────────────

#[derive(Debug)]
struct HostState {
    next: u64,
    regions: BTreeMap<u64, Vec<u8>>,
    read_only: BTreeSet<u64>,
}

/// Simulated caller memory
#[derive(Debug)]
pub struct HostMemory {
    state: Mutex<HostState>,
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemory {
    /// Empty address space; the first region starts at `0x10_0000`
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next: 0x10_0000,
                regions: BTreeMap::new(),
                read_only: BTreeSet::new(),
            }),
        }
    }

    /// Map `len` zeroed bytes and return their address
    pub fn alloc(&self, len: usize) -> u64 {
        self.map(vec![0; len])
    }

    /// Map a copy of `values` and return its address
    pub fn alloc_f32(&self, values: &[f32]) -> u64 {
        self.map(bytemuck::cast_slice::<f32, u8>(values).to_vec())
    }

    fn map(&self, bytes: Vec<u8>) -> u64 {
        let mut state = self.state.lock();
        let addr = state.next;
        // Leave an unmapped guard page between regions.
        let span = bytes.len().max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE + PAGE_SIZE;
        state.next += span as u64;
        state.regions.insert(addr, bytes);
        addr
    }

    /// Unmap the region starting at `addr`
    pub fn revoke(&self, addr: u64) {
        let mut state = self.state.lock();
        state.regions.remove(&addr);
        state.read_only.remove(&addr);
    }

    /// Make writes into the region starting at `addr` fault
    pub fn protect(&self, addr: u64) {
        self.state.lock().read_only.insert(addr);
    }

    /// Copy of `len` bytes at `addr`
    pub fn read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let (start, bytes) = Self::locate(&state, addr, len)?;
        let off = usize::try_from(addr - start).ok()?;
        Some(bytes[off..off + len].to_vec())
    }

    /// `count` floats at `addr`
    pub fn read_f32(&self, addr: u64, count: usize) -> Option<Vec<f32>> {
        let bytes = self.read(addr, count.checked_mul(4)?)?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    fn locate(state: &HostState, addr: u64, len: usize) -> Option<(u64, &Vec<u8>)> {
        let (&start, bytes) = state.regions.range(..=addr).next_back()?;
        let end = start.checked_add(bytes.len() as u64)?;
        let want_end = addr.checked_add(len as u64)?;
        (want_end <= end).then_some((start, bytes))
    }
}

impl UserMemory for HostMemory {
    fn copy_from_user(&self, src: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self
            .read(src, dst.len())
            .ok_or(GemminiError::fault(src, dst.len()))?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    fn copy_to_user(&self, dst: u64, src: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let start = match Self::locate(&state, dst, src.len()) {
            Some((start, _)) if !state.read_only.contains(&start) => start,
            _ => return Err(GemminiError::fault(dst, src.len())),
        };
        let off = usize::try_from(dst - start).map_err(|_| GemminiError::fault(dst, src.len()))?;
        let region = state
            .regions
            .get_mut(&start)
            .ok_or(GemminiError::fault(dst, src.len()))?;
        region[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }
}

// ── Simulated register block ─────────────────────────────────────────────────

/// How the simulated device answers a start pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Status is set as soon as START is written
    Immediate,
    /// Status reads return 0 this many times, then 1
    AfterReads(u32),
    /// Status never becomes non-zero
    Never,
}

/// One recorded register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Register offset
    pub offset: usize,
    /// Value written
    pub value: u64,
}

/// Operand kernel: image, M bytes, K bytes, output bytes
pub type Kernel = dyn Fn(&RegisterImage, &[u8], Option<&[u8]>, &mut [u8]) + Send + Sync;

#[derive(Debug, Default)]
struct AccelState {
    regs: [u64; regs::REGISTER_COUNT],
    trace: Vec<RegisterWrite>,
    pending: Option<u32>,
    launches: u64,
    status_reads: u64,
}

/// Simulated GemminiDevA register block
pub struct SoftwareAccelerator {
    state: Mutex<AccelState>,
    mode: CompletionMode,
    kernel: Option<(Arc<SoftwareDma>, Box<Kernel>)>,
}

impl std::fmt::Debug for SoftwareAccelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareAccelerator")
            .field("mode", &self.mode)
            .field("kernel", &self.kernel.is_some())
            .finish_non_exhaustive()
    }
}

impl SoftwareAccelerator {
    /// Register block answering start pulses per `mode`
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            state: Mutex::new(AccelState::default()),
            mode,
            kernel: None,
        }
    }

    /// Run `kernel` over the operand buffers found in `dma` on every launch
    #[must_use]
    pub fn with_kernel(
        mut self,
        dma: Arc<SoftwareDma>,
        kernel: impl Fn(&RegisterImage, &[u8], Option<&[u8]>, &mut [u8]) + Send + Sync + 'static,
    ) -> Self {
        let kernel: Box<Kernel> = Box::new(kernel);
        self.kernel = Some((dma, kernel));
        self
    }

    /// Every register write so far, in order
    pub fn trace(&self) -> Vec<RegisterWrite> {
        self.state.lock().trace.clone()
    }

    /// Forget recorded writes
    pub fn clear_trace(&self) {
        self.state.lock().trace.clear();
    }

    /// Number of start pulses received
    pub fn launches(&self) -> u64 {
        self.state.lock().launches
    }

    /// Number of status reads
    pub fn status_reads(&self) -> u64 {
        self.state.lock().status_reads
    }

    /// Current value of a register, without read side effects
    pub fn peek(&self, offset: usize) -> u64 {
        self.state.lock().regs[Self::index(offset)]
    }

    /// Operand image currently programmed
    pub fn image(&self) -> RegisterImage {
        Self::image_of(&self.state.lock().regs)
    }

    fn image_of(r: &[u64; regs::REGISTER_COUNT]) -> RegisterImage {
        let at = |off: usize| r[off / regs::REGISTER_WIDTH];
        RegisterImage {
            addr_m: at(regs::ADDR_M),
            addr_k: at(regs::ADDR_K),
            addr_o: at(regs::ADDR_O),
            size_m: at(regs::SIZE_M),
            size_k: at(regs::SIZE_K),
            opcode: at(regs::OPCODE),
        }
    }

    fn index(offset: usize) -> usize {
        assert!(
            offset % regs::REGISTER_WIDTH == 0 && offset < regs::BLOCK_SIZE,
            "Register offset {offset:#x} out of bounds"
        );
        offset / regs::REGISTER_WIDTH
    }

    fn launch(&self, state: &mut AccelState) {
        let status = Self::index(regs::STATUS);
        state.regs[status] = 0;
        state.launches += 1;

        if let Some((dma, kernel)) = &self.kernel {
            let image = Self::image_of(&state.regs);
            let addr_k = (image.addr_k != 0).then_some(image.addr_k);
            let ran = dma.with_operands(image.addr_m, addr_k, image.addr_o, |m, k, o| {
                kernel(&image, m, k, o);
            });
            if ran.is_none() {
                warn!("SoftwareAccelerator: operands not found for {image:?}");
            }
        }

        match self.mode {
            CompletionMode::Immediate => state.regs[status] = 1,
            CompletionMode::AfterReads(n) => state.pending = Some(n),
            CompletionMode::Never => {}
        }
    }
}

impl RegisterBlock for SoftwareAccelerator {
    fn read64(&self, offset: usize) -> u64 {
        let idx = Self::index(offset);
        let mut state = self.state.lock();
        if offset == regs::STATUS {
            state.status_reads += 1;
            match state.pending {
                Some(0) => {
                    state.pending = None;
                    state.regs[idx] = 1;
                }
                Some(n) => state.pending = Some(n - 1),
                None => {}
            }
        }
        state.regs[idx]
    }

    fn write64(&self, offset: usize, value: u64) {
        let idx = Self::index(offset);
        let mut state = self.state.lock();
        state.trace.push(RegisterWrite { offset, value });
        match offset {
            regs::STATUS => warn!("SoftwareAccelerator: ignoring write to read-only STATUS"),
            regs::START if value == regs::START_TRIGGER => self.launch(&mut state),
            _ => state.regs[idx] = value,
        }
    }
}

/// Simulated accelerator and its DMA pool, wired together
#[derive(Debug, Clone)]
pub struct SoftwareDevice {
    /// Register block
    pub accelerator: Arc<SoftwareAccelerator>,
    /// DMA pool
    pub dma: Arc<SoftwareDma>,
}

impl SoftwareDevice {
    /// Device that acknowledges launches per `mode` without touching operands
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            accelerator: Arc::new(SoftwareAccelerator::new(mode)),
            dma: Arc::new(SoftwareDma::new()),
        }
    }

    /// Device that runs `kernel` over the operands on every launch
    pub fn with_kernel(
        mode: CompletionMode,
        dma: SoftwareDma,
        kernel: impl Fn(&RegisterImage, &[u8], Option<&[u8]>, &mut [u8]) + Send + Sync + 'static,
    ) -> Self {
        let dma = Arc::new(dma);
        let accelerator =
            Arc::new(SoftwareAccelerator::new(mode).with_kernel(Arc::clone(&dma), kernel));
        Self { accelerator, dma }
    }

    /// Session over this device
    pub fn session(&self, config: DriverConfig) -> DeviceSession {
        DeviceSession::new(self.accelerator.clone(), self.dma.clone(), config)
    }
}

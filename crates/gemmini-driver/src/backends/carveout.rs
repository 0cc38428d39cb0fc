//! Reserved-memory DMA allocator
//!
//! Coherent DMA from user space needs memory whose physical address is known
//! and stable. On the gem5 platform a range is reserved at boot for that
//! purpose; [`CarveoutAllocator`] maps it through `/dev/mem` and hands out
//! page-granular pieces of it, first fit. Bus address equals physical
//! address, so the whole window must sit under the device's DMA mask.

use super::mmap::{PhysMapping, DEV_MEM};
use crate::config::DriverConfig;
use crate::dma::{DmaAllocator, DmaRegion};
use crate::error::{GemminiError, Result};
use gemmini_chip::platform::{self, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, info, warn};

/// First-fit page allocator over `[0, size)`
#[derive(Debug)]
pub(crate) struct FreeList {
    /// offset → length of each free extent, coalesced
    free: BTreeMap<usize, usize>,
    /// offset → length of each handed-out extent
    used: BTreeMap<usize, usize>,
}

impl FreeList {
    pub(crate) fn new(size: usize) -> Self {
        let size = size - size % PAGE_SIZE;
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self {
            free,
            used: BTreeMap::new(),
        }
    }

    /// Reserve `len` bytes (rounded up to pages), returning the offset
    pub(crate) fn alloc(&mut self, len: usize) -> Option<usize> {
        let span = len.max(1).checked_next_multiple_of(PAGE_SIZE)?;
        let (&off, &avail) = self.free.iter().find(|&(_, &avail)| avail >= span)?;
        self.free.remove(&off);
        if avail > span {
            self.free.insert(off + span, avail - span);
        }
        self.used.insert(off, span);
        Some(off)
    }

    /// Return the extent starting at `off`; `false` if none is outstanding
    pub(crate) fn release(&mut self, off: usize) -> bool {
        let Some(len) = self.used.remove(&off) else {
            return false;
        };
        let mut start = off;
        let mut end = off + len;
        if let Some((&prev, &prev_len)) = self.free.range(..off).next_back() {
            if prev + prev_len == off {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }
        self.free.insert(start, end - start);
        true
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.used.len()
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }
}

/// [`DmaAllocator`] over a reserved physical window
#[derive(Debug)]
pub struct CarveoutAllocator {
    map: PhysMapping,
    list: Mutex<FreeList>,
}

impl CarveoutAllocator {
    /// Map the DMA window described by `config` from `/dev/mem`
    ///
    /// # Errors
    ///
    /// - `Config` if the window does not fit under the configured DMA mask
    /// - anything mapping the window can return (`DeviceNotFound`, `Io`, `MapFailed`)
    pub fn open(config: &DriverConfig) -> Result<Self> {
        Self::open_path(
            Path::new(DEV_MEM),
            config.dma_base,
            config.dma_size,
            config.dma_mask_bits,
        )
    }

    /// Map a DMA window from an arbitrary file
    ///
    /// # Errors
    ///
    /// See [`CarveoutAllocator::open`].
    pub fn open_path(path: &Path, base: u64, size: u64, mask_bits: u32) -> Result<Self> {
        let mask = platform::dma_mask(mask_bits);
        let last = size
            .checked_sub(1)
            .and_then(|s| base.checked_add(s))
            .ok_or_else(|| GemminiError::config(format!("empty or wrapping DMA window at {base:#x}")))?;
        if last > mask {
            return Err(GemminiError::config(format!(
                "DMA window [{base:#x}, {last:#x}] exceeds the {mask_bits}-bit mask"
            )));
        }

        let map = PhysMapping::open(path, base, size)?;
        let list = Mutex::new(FreeList::new(map.size()));
        info!("DMA carve-out: {size:#x} bytes at {base:#x} ({mask_bits}-bit mask)");
        Ok(Self { map, list })
    }

    /// Bytes not currently allocated
    pub fn free_bytes(&self) -> usize {
        self.list.lock().free_bytes()
    }

    /// Regions handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.list.lock().outstanding()
    }
}

impl DmaAllocator for CarveoutAllocator {
    fn alloc_coherent(&self, len: usize) -> Result<DmaRegion> {
        let off = self
            .list
            .lock()
            .alloc(len)
            .ok_or(GemminiError::out_of_memory(len))?;
        let bus = self.map.base() + off as u64;

        // SAFETY: off + len <= map.size() because the free list only covers the
        // mapped range, so the pointer stays inside the mapping.
        let cpu = unsafe { self.map.as_ptr().add(off) };
        // SAFETY: [cpu, cpu+len) is inside the mapping and now owned by this
        // allocation only.
        unsafe { std::ptr::write_bytes(cpu, 0, len) };
        let cpu = NonNull::new(cpu).ok_or(GemminiError::out_of_memory(len))?;

        debug!("Carve-out alloc {len} bytes @ {bus:#x}");
        // SAFETY: the extent is reserved in the free list until free_coherent, the
        // mapping outlives every region (regions borrow the allocator through
        // DeviceBuffer), and bus is the physical address of the same bytes.
        Ok(unsafe { DmaRegion::from_raw_parts(cpu, bus, len) })
    }

    fn free_coherent(&self, region: DmaRegion) {
        let bus = region.bus_addr();
        let released = bus
            .checked_sub(self.map.base())
            .and_then(|off| usize::try_from(off).ok())
            .is_some_and(|off| self.list.lock().release(off));
        if !released {
            warn!("Carve-out: free of unknown region at {bus:#x}");
        }
    }
}

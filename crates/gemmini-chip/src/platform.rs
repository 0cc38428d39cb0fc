//! Platform defaults for GemminiDevA under gem5.
//!
//! The simulated device sits at a fixed physical window unless a device tree
//! node says otherwise. DMA addressing prefers 48 bits and falls back to 32.

/// Default physical base of the register window.
pub const DEFAULT_MMIO_BASE: u64 = 0x4000_0000;
/// Default size of the register window.
pub const DEFAULT_MMIO_SIZE: u64 = 0x1000;

/// Device-tree `compatible` string.
pub const DT_COMPATIBLE: &str = "gem5,gemmini-dev-a";
/// Character-device node name (`/dev/gemmini_dev_a`).
pub const DEVICE_NAME: &str = "gemmini_dev_a";

/// Preferred DMA addressing width.
pub const DMA_MASK_BITS: u32 = 48;
/// Fallback DMA addressing width.
pub const DMA_MASK_FALLBACK_BITS: u32 = 32;

/// Page granularity used for DMA buffers.
pub const PAGE_SIZE: usize = 4096;

/// `DMA_BIT_MASK(bits)`: highest bus address reachable with `bits` bits.
#[must_use]
pub const fn dma_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(dma_mask(32), 0xFFFF_FFFF);
        assert_eq!(dma_mask(48), 0xFFFF_FFFF_FFFF);
        assert_eq!(dma_mask(64), u64::MAX);
    }

    #[test]
    fn default_window_holds_register_block() {
        assert!(DEFAULT_MMIO_SIZE as usize >= crate::regs::BLOCK_SIZE);
    }
}

//! Driver configuration
//!
//! Defaults reproduce the platform the gem5 device is built for; every value
//! can be overridden from the environment or by the caller.

use crate::error::{GemminiError, Result};
use gemmini_chip::platform;
use gemmini_chip::regs;
use std::time::{Duration, Instant};
use tracing::debug;

/// Completion bound used when nothing else is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Longest completion bound [`DriverConfig::validate`] accepts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Physical base of the default DMA carve-out.
pub const DEFAULT_DMA_BASE: u64 = 0x8000_0000;
/// Size of the default DMA carve-out.
pub const DEFAULT_DMA_SIZE: u64 = 16 * 1024 * 1024;

/// Runtime configuration for one device instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Physical base of the register window
    pub mmio_base: u64,
    /// Size of the register window in bytes
    pub mmio_size: u64,
    /// Physical base of the reserved DMA window
    pub dma_base: u64,
    /// Size of the reserved DMA window in bytes
    pub dma_size: u64,
    /// Device addressing width
    pub dma_mask_bits: u32,
    /// How long to wait for the status register
    pub timeout: Duration,
    /// Pause between status reads; zero means yield only
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mmio_base: platform::DEFAULT_MMIO_BASE,
            mmio_size: platform::DEFAULT_MMIO_SIZE,
            dma_base: DEFAULT_DMA_BASE,
            dma_size: DEFAULT_DMA_SIZE,
            dma_mask_bits: platform::DMA_MASK_BITS,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::ZERO,
        }
    }
}

impl DriverConfig {
    /// Defaults overlaid with `GEMMINI_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is set but cannot be parsed, or if the
    /// resulting configuration fails [`DriverConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`DriverConfig::from_env`] with an explicit variable source
    ///
    /// # Errors
    ///
    /// Returns `Config` on malformed or inconsistent values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("GEMMINI_MMIO_BASE") {
            cfg.mmio_base = parse_u64("GEMMINI_MMIO_BASE", &v)?;
        }
        if let Some(v) = lookup("GEMMINI_MMIO_SIZE") {
            cfg.mmio_size = parse_u64("GEMMINI_MMIO_SIZE", &v)?;
        }
        if let Some(v) = lookup("GEMMINI_DMA_BASE") {
            cfg.dma_base = parse_u64("GEMMINI_DMA_BASE", &v)?;
        }
        if let Some(v) = lookup("GEMMINI_DMA_SIZE") {
            cfg.dma_size = parse_u64("GEMMINI_DMA_SIZE", &v)?;
        }
        if let Some(v) = lookup("GEMMINI_DMA_MASK_BITS") {
            let bits = parse_u64("GEMMINI_DMA_MASK_BITS", &v)?;
            cfg.dma_mask_bits = u32::try_from(bits)
                .map_err(|_| GemminiError::config(format!("GEMMINI_DMA_MASK_BITS={v}")))?;
        }
        if let Some(v) = lookup("GEMMINI_TIMEOUT_MS") {
            cfg.timeout = Duration::from_millis(parse_u64("GEMMINI_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("GEMMINI_POLL_INTERVAL_US") {
            cfg.poll_interval = Duration::from_micros(parse_u64("GEMMINI_POLL_INTERVAL_US", &v)?);
        }

        cfg.validate()?;
        debug!("Driver config: {cfg:?}");
        Ok(cfg)
    }

    /// Override the register window
    #[must_use]
    pub const fn with_mmio(mut self, base: u64, size: u64) -> Self {
        self.mmio_base = base;
        self.mmio_size = size;
        self
    }

    /// Override the DMA carve-out
    #[must_use]
    pub const fn with_dma_window(mut self, base: u64, size: u64) -> Self {
        self.dma_base = base;
        self.dma_size = size;
        self
    }

    /// Override the DMA addressing width
    #[must_use]
    pub const fn with_dma_mask_bits(mut self, bits: u32) -> Self {
        self.dma_mask_bits = bits;
        self
    }

    /// Override the completion timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the pause between status reads
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Completion deadline for a device started at `start`
    ///
    /// The timeout is clamped to [`MAX_TIMEOUT`], so an unvalidated
    /// configuration still yields a finite deadline.
    pub fn deadline_from(&self, start: Instant) -> Instant {
        start
            .checked_add(self.timeout.min(MAX_TIMEOUT))
            .unwrap_or(start)
    }

    /// Highest bus address the device can reach
    pub const fn dma_mask(&self) -> u64 {
        platform::dma_mask(self.dma_mask_bits)
    }

    /// Check the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns `Config` if the register window cannot hold the register block,
    /// the timeout is zero or above [`MAX_TIMEOUT`], or the DMA mask width is
    /// outside 32..=64.
    pub fn validate(&self) -> Result<()> {
        if self.mmio_size < regs::BLOCK_SIZE as u64 {
            return Err(GemminiError::config(format!(
                "MMIO window of {:#x} bytes cannot hold the {:#x}-byte register block",
                self.mmio_size,
                regs::BLOCK_SIZE
            )));
        }
        if self.timeout.is_zero() {
            return Err(GemminiError::config("timeout must be non-zero"));
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(GemminiError::config(format!(
                "timeout {:?} exceeds {MAX_TIMEOUT:?}",
                self.timeout
            )));
        }
        if !(platform::DMA_MASK_FALLBACK_BITS..=64).contains(&self.dma_mask_bits) {
            return Err(GemminiError::config(format!(
                "DMA mask of {} bits outside {}..=64",
                self.dma_mask_bits,
                platform::DMA_MASK_FALLBACK_BITS
            )));
        }
        Ok(())
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal value
fn parse_u64(key: &str, value: &str) -> Result<u64> {
    let v = value.trim().replace('_', "");
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => v.parse::<u64>(),
    };
    parsed.map_err(|e| GemminiError::config(format!("{key}={value}: {e}")))
}

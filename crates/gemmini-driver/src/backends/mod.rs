//! Register-block and DMA backends
//!
//! - **software**: simulated device and host-memory DMA (tests, development)
//! - **mmap**: `/dev/mem` register window (gem5 full-system guest)
//! - **carveout**: DMA from a reserved physical range (gem5 full-system guest)

pub mod carveout;
pub mod mmap;
pub mod software;

pub use carveout::CarveoutAllocator;
pub use mmap::MmioWindow;
pub use software::{CompletionMode, HostMemory, SoftwareAccelerator, SoftwareDevice, SoftwareDma};

use crate::config::DriverConfig;
use crate::error::Result;
use crate::session::DeviceSession;
use std::sync::Arc;

/// Session over the physical device described by `config`
///
/// Maps the register window and the DMA carve-out from `/dev/mem`.
///
/// # Errors
///
/// Returns `Config` if `config` fails validation, otherwise whatever mapping
/// either window returns.
pub fn open_physical(config: DriverConfig) -> Result<DeviceSession> {
    config.validate()?;
    let window = MmioWindow::open(config.mmio_base, config.mmio_size)?;
    let dma = CarveoutAllocator::open(&config)?;
    Ok(DeviceSession::new(Arc::new(window), Arc::new(dma), config))
}

//! Command submission for the GemminiDevA accelerator.
//!
//! The accelerator is a memory-mapped device with a tiny register block:
//! three operand addresses, two size parameters, an opcode, a start trigger
//! and a status register. One request runs at a time. This crate takes a
//! request from a caller, sizes its buffers, stages the inputs into DMA
//! memory, programs and starts the device, waits for it, and copies the
//! result back.
//!
//! # Layers
//!
//! ```text
//! ControlHandle::ioctl(RUN, &req)        (character-device view)
//!        │
//! DeviceSession::submit                  (one in flight; lock = register ownership)
//!        │
//!  sizing::plan ─► OperandBuffers ─► Registers::program/start ─► poll ─► retrieve
//!                      │                    │
//!                DmaAllocator         RegisterBlock
//!        SoftwareDma | CarveoutAllocator    SoftwareAccelerator | MmioWindow
//! ```
//!
//! # Quick start (simulated device)
//!
//! ```
//! use gemmini_driver::backends::{CompletionMode, HostMemory, SoftwareDevice};
//! use gemmini_driver::{DriverConfig, Opcode, Request};
//!
//! # fn main() -> gemmini_driver::Result<()> {
//! let device = SoftwareDevice::new(CompletionMode::Immediate);
//! let session = device.session(DriverConfig::default());
//!
//! let mem = HostMemory::new();
//! let m = mem.alloc_f32(&[1.0, 2.0, 3.0, 4.0]);
//! let k = mem.alloc_f32(&[1.0, 2.0, 3.0, 4.0]);
//! let o = mem.alloc(16);
//! let req = Request::new(Opcode::Mm, 2, 0).with_operands(m, k, o);
//!
//! let done = session.submit(&req, &mem)?;
//! assert_eq!(done.plan.o_bytes(), 16);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
mod config;
mod control;
pub mod dma;
mod error;
pub mod mmio;
pub mod poll;
mod request;
mod session;
pub mod sizing;
mod user;

pub use gemmini_chip::{ioctl, platform, regs, Opcode, UnknownOpcode};

pub use config::{DriverConfig, DEFAULT_DMA_BASE, DEFAULT_DMA_SIZE, DEFAULT_TIMEOUT, MAX_TIMEOUT};
pub use control::ControlHandle;
pub use dma::{DeviceBuffer, DmaAllocator, DmaRegion, OperandBuffers};
pub use error::{GemminiError, Result};
pub use mmio::{RegisterBlock, RegisterImage, Registers};
pub use request::{RawRequest, Request};
pub use session::{Completion, DeviceSession, SessionState};
pub use sizing::{plan, SizePlan};
pub use user::{ProcessMemory, UserMemory};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ControlHandle, DeviceSession, DriverConfig, GemminiError, Opcode, ProcessMemory, Request,
        Result, SizePlan, UserMemory,
    };
}

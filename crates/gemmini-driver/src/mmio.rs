//! Register protocol for GemminiDevA
//!
//! [`RegisterBlock`] is the raw capability: 64-bit reads and writes at byte
//! offsets into the device's register window. [`Registers`] layers the
//! fixed register layout and the programming sequence on top of it, so no
//! caller ever computes an offset.

use crate::dma::OperandBuffers;
use crate::request::Request;
use crate::sizing::SizePlan;
use gemmini_chip::regs;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressable 64-bit register window
pub trait RegisterBlock: Debug + Send + Sync {
    /// Read the register at `offset`
    fn read64(&self, offset: usize) -> u64;

    /// Write `value` to the register at `offset`
    fn write64(&self, offset: usize, value: u64);
}

/// Values programmed for one submission, before the start pulse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterImage {
    /// Operand M bus address
    pub addr_m: u64,
    /// Operand K bus address, 0 when absent
    pub addr_k: u64,
    /// Output bus address
    pub addr_o: u64,
    /// M size parameter
    pub size_m: u64,
    /// K size parameter, 0 when the plan has no K operand
    pub size_k: u64,
    /// Opcode ordinal
    pub opcode: u64,
}

impl RegisterImage {
    /// Image for `request` with its staged buffers
    pub fn new(request: &Request, plan: &SizePlan, buffers: &OperandBuffers<'_>) -> Self {
        let (addr_m, addr_k, addr_o) = buffers.bus_addrs();
        Self {
            addr_m,
            addr_k: if plan.has_k() { addr_k } else { 0 },
            addr_o,
            size_m: u64::from(request.m_size()),
            size_k: if plan.has_k() {
                u64::from(request.k_size())
            } else {
                0
            },
            opcode: u64::from(request.opcode().ordinal()),
        }
    }

    /// `(offset, value)` pairs in programming order
    pub const fn writes(&self) -> [(usize, u64); 6] {
        [
            (regs::ADDR_M, self.addr_m),
            (regs::ADDR_K, self.addr_k),
            (regs::ADDR_O, self.addr_o),
            (regs::SIZE_M, self.size_m),
            (regs::SIZE_K, self.size_k),
            (regs::OPCODE, self.opcode),
        ]
    }
}

/// Typed access to the register block
#[derive(Debug, Clone)]
pub struct Registers {
    block: Arc<dyn RegisterBlock>,
}

impl Registers {
    /// Wrap a register window
    pub fn new(block: Arc<dyn RegisterBlock>) -> Self {
        Self { block }
    }

    /// Write the operand image in protocol order
    pub fn program(&self, image: &RegisterImage) {
        for (offset, value) in image.writes() {
            trace!("Write {} = {value:#x}", regs::name(offset).unwrap_or("?"));
            self.block.write64(offset, value);
        }
    }

    /// Launch the programmed operation
    pub fn start(&self) {
        trace!("Write START = {:#x}", regs::START_TRIGGER);
        self.block.write64(regs::START, regs::START_TRIGGER);
    }

    /// Current completion status; non-zero means done
    pub fn status(&self) -> u64 {
        self.block.read64(regs::STATUS)
    }
}

//! Register block for GemminiDevA.
//!
//! Every register is 64 bits wide and 8-byte aligned. All slots except
//! `STATUS` are write-only from the host; `STATUS` is owned by the device.
//!
//! ```text
//! 0x00  ADDR_M   operand M bus address
//! 0x08  ADDR_K   operand K bus address (0 when the opcode has no K operand)
//! 0x10  ADDR_O   output bus address
//! 0x18  SIZE_M   M dimension parameter
//! 0x20  SIZE_K   K dimension parameter
//! 0x28  OPCODE   operation ordinal
//! 0x30  START    write 1 to launch
//! 0x38  STATUS   non-zero once the operation has completed
//! ```

// ── Operand programming ──────────────────────────────────────────────────────

/// Operand M bus address.
pub const ADDR_M: usize = 0x00;
/// Operand K bus address.
pub const ADDR_K: usize = 0x08;
/// Output operand bus address.
pub const ADDR_O: usize = 0x10;
/// M size parameter.
pub const SIZE_M: usize = 0x18;
/// K size parameter.
pub const SIZE_K: usize = 0x20;
/// Operation ordinal, see [`crate::Opcode`].
pub const OPCODE: usize = 0x28;

// ── Launch and completion ────────────────────────────────────────────────────

/// Launch trigger.
pub const START: usize = 0x30;
/// Completion flag.
pub const STATUS: usize = 0x38;

/// Value written to [`START`] to launch an operation.
pub const START_TRIGGER: u64 = 1;

/// Width of every register in bytes.
pub const REGISTER_WIDTH: usize = 8;
/// Number of registers in the block.
pub const REGISTER_COUNT: usize = 8;
/// Span of the register block in bytes.
pub const BLOCK_SIZE: usize = REGISTER_WIDTH * REGISTER_COUNT;

/// Human-readable register names, indexed by `offset / REGISTER_WIDTH`.
pub const NAMES: [&str; REGISTER_COUNT] = [
    "ADDR_M", "ADDR_K", "ADDR_O", "SIZE_M", "SIZE_K", "OPCODE", "START", "STATUS",
];

/// Name of the register at `offset`, if `offset` is a register boundary.
#[must_use]
pub fn name(offset: usize) -> Option<&'static str> {
    if offset % REGISTER_WIDTH != 0 {
        return None;
    }
    NAMES.get(offset / REGISTER_WIDTH).copied()
}

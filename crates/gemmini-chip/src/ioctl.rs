//! Control-channel ABI.
//!
//! The caller hands the driver a 40-byte request struct through a single
//! `_IOWR('G', 0, ...)` command:
//!
//! ```text
//! offset  size  field
//!  0x00    8    m_user    caller address of operand M
//!  0x08    8    k_user    caller address of operand K (0 if unused)
//!  0x10    8    o_user    caller address of the output
//!  0x18    4    m_size
//!  0x1c    4    k_size
//!  0x20    4    opcode
//!  0x24    4    reserved
//! ```

/// ioctl type byte.
pub const IOC_MAGIC: u8 = b'G';

/// Size of the request struct in bytes.
pub const REQUEST_SIZE: usize = 40;

/// Field offsets inside the request struct.
pub mod field {
    /// Operand M caller address.
    pub const M_USER: usize = 0x00;
    /// Operand K caller address.
    pub const K_USER: usize = 0x08;
    /// Output caller address.
    pub const O_USER: usize = 0x10;
    /// M size parameter.
    pub const M_SIZE: usize = 0x18;
    /// K size parameter.
    pub const K_SIZE: usize = 0x1C;
    /// Opcode ordinal.
    pub const OPCODE: usize = 0x20;
    /// Reserved, ignored by the driver.
    pub const RESERVED: usize = 0x24;
}

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// Linux `_IOWR(ty, nr, size)`.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub const fn iowr(ty: u8, nr: u8, size: usize) -> u32 {
    ((IOC_READ | IOC_WRITE) << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
}

/// The only supported command: run one request to completion.
pub const RUN: u32 = iowr(IOC_MAGIC, 0, REQUEST_SIZE);

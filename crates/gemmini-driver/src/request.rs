//! Submission requests
//!
//! [`RawRequest`] is the fixed 40-byte struct a caller passes across the
//! control channel. [`Request`] is the validated, typed form the session
//! consumes. Conversion checks the opcode; sizes and caller addresses are
//! checked against the [`SizePlan`] inside the submission.

use crate::error::{GemminiError, Result};
use crate::sizing::{self, SizePlan};
use bytemuck::{Pod, Zeroable};
use gemmini_chip::{ioctl, Opcode};

/// Wire layout of a request (little-endian fields)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RawRequest {
    /// Caller address of operand M
    pub m_user: u64,
    /// Caller address of operand K
    pub k_user: u64,
    /// Caller address of the output
    pub o_user: u64,
    /// M size parameter
    pub m_size: u32,
    /// K size parameter
    pub k_size: u32,
    /// Opcode ordinal
    pub opcode: u32,
    /// Ignored
    pub reserved: u32,
}

const _: () = assert!(std::mem::size_of::<RawRequest>() == ioctl::REQUEST_SIZE);

impl RawRequest {
    /// Decode a request from its wire bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `bytes` is not exactly
    /// [`ioctl::REQUEST_SIZE`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ioctl::REQUEST_SIZE {
            return Err(GemminiError::invalid_argument(format!(
                "request is {} bytes, expected {}",
                bytes.len(),
                ioctl::REQUEST_SIZE
            )));
        }
        let raw: Self = bytemuck::pod_read_unaligned(bytes);
        Ok(Self {
            m_user: u64::from_le(raw.m_user),
            k_user: u64::from_le(raw.k_user),
            o_user: u64::from_le(raw.o_user),
            m_size: u32::from_le(raw.m_size),
            k_size: u32::from_le(raw.k_size),
            opcode: u32::from_le(raw.opcode),
            reserved: u32::from_le(raw.reserved),
        })
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> [u8; ioctl::REQUEST_SIZE] {
        let le = Self {
            m_user: self.m_user.to_le(),
            k_user: self.k_user.to_le(),
            o_user: self.o_user.to_le(),
            m_size: self.m_size.to_le(),
            k_size: self.k_size.to_le(),
            opcode: self.opcode.to_le(),
            reserved: self.reserved.to_le(),
        };
        let mut out = [0u8; ioctl::REQUEST_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(&le));
        out
    }
}

/// A validated operation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    opcode: Opcode,
    m_size: u32,
    k_size: u32,
    m_user: u64,
    k_user: u64,
    o_user: u64,
}

impl Request {
    /// Request with no caller buffers attached yet
    pub const fn new(opcode: Opcode, m_size: u32, k_size: u32) -> Self {
        Self {
            opcode,
            m_size,
            k_size,
            m_user: 0,
            k_user: 0,
            o_user: 0,
        }
    }

    /// Attach caller buffer addresses
    #[must_use]
    pub const fn with_operands(mut self, m_user: u64, k_user: u64, o_user: u64) -> Self {
        self.m_user = m_user;
        self.k_user = k_user;
        self.o_user = o_user;
        self
    }

    /// Operation kind
    pub const fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// M size parameter
    pub const fn m_size(&self) -> u32 {
        self.m_size
    }

    /// K size parameter
    pub const fn k_size(&self) -> u32 {
        self.k_size
    }

    /// Caller address of operand M
    pub const fn m_user(&self) -> u64 {
        self.m_user
    }

    /// Caller address of operand K
    pub const fn k_user(&self) -> u64 {
        self.k_user
    }

    /// Caller address of the output
    pub const fn o_user(&self) -> u64 {
        self.o_user
    }

    /// Buffer sizes for this request
    ///
    /// # Errors
    ///
    /// See [`sizing::plan`].
    pub fn plan(&self) -> Result<SizePlan> {
        sizing::plan(self.opcode, self.m_size, self.k_size)
    }

    /// Check that every operand the plan uses has a caller address
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `m_user` or `o_user` is null, or if
    /// `k_user` is null while the plan has a K operand.
    pub fn check_operands(&self, plan: &SizePlan) -> Result<()> {
        if self.m_user == 0 || self.o_user == 0 {
            return Err(GemminiError::invalid_argument(format!(
                "{}: m and o buffers are required",
                self.opcode
            )));
        }
        if plan.has_k() && self.k_user == 0 {
            return Err(GemminiError::invalid_argument(format!(
                "{}: k buffer is required ({} bytes)",
                self.opcode,
                plan.k_bytes()
            )));
        }
        Ok(())
    }

    /// Wire form of this request
    pub const fn to_raw(&self) -> RawRequest {
        RawRequest {
            m_user: self.m_user,
            k_user: self.k_user,
            o_user: self.o_user,
            m_size: self.m_size,
            k_size: self.k_size,
            opcode: self.opcode.ordinal(),
            reserved: 0,
        }
    }
}

impl TryFrom<RawRequest> for Request {
    type Error = GemminiError;

    fn try_from(raw: RawRequest) -> Result<Self> {
        let opcode = Opcode::try_from(raw.opcode)
            .map_err(|e| GemminiError::invalid_argument(e.to_string()))?;
        Ok(Self::new(opcode, raw.m_size, raw.k_size).with_operands(
            raw.m_user,
            raw.k_user,
            raw.o_user,
        ))
    }
}

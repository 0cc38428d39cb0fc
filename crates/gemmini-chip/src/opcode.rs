//! Operation kinds understood by GemminiDevA.
//!
//! The ordinals are part of the hardware contract: they are written verbatim
//! to the `OPCODE` register and carried in the request struct.

use std::fmt;
use std::str::FromStr;

/// Operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// 2-D convolution.
    Conv2d = 0,
    /// 2-D convolution lowered to GEMM (im2col).
    Conv2dGemm = 1,
    /// 3-D convolution.
    Conv3d = 2,
    /// 3-D convolution lowered to GEMM.
    Conv3dGemm = 3,
    /// Max pooling.
    MaxPool = 4,
    /// Max pooling lowered to GEMM.
    MaxPoolGemm = 5,
    /// Rectified linear unit.
    Relu = 6,
    /// Square matrix multiply.
    Mm = 7,
    /// Square matrix multiply through the GEMM path.
    MmGemm = 8,
}

impl Opcode {
    /// Every opcode in ordinal order.
    pub const ALL: [Self; 9] = [
        Self::Conv2d,
        Self::Conv2dGemm,
        Self::Conv3d,
        Self::Conv3dGemm,
        Self::MaxPool,
        Self::MaxPoolGemm,
        Self::Relu,
        Self::Mm,
        Self::MmGemm,
    ];

    /// Stable ordinal written to the `OPCODE` register.
    #[must_use]
    pub const fn ordinal(self) -> u32 {
        self as u32
    }

    /// Command-line name (`conv2d-gemm`, `mm`, ...).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Conv2d => "conv2d",
            Self::Conv2dGemm => "conv2d-gemm",
            Self::Conv3d => "conv3d",
            Self::Conv3dGemm => "conv3d-gemm",
            Self::MaxPool => "maxpool",
            Self::MaxPoolGemm => "maxpool-gemm",
            Self::Relu => "relu",
            Self::Mm => "mm",
            Self::MmGemm => "mm-gemm",
        }
    }

    /// Whether the operation needs a non-zero `k_size`.
    #[must_use]
    pub const fn requires_k_size(self) -> bool {
        !matches!(self, Self::Relu | Self::Mm | Self::MmGemm)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> Self {
        op.ordinal()
    }
}

/// Raised when an ordinal or name does not match any [`Opcode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnknownOpcode {
    /// Ordinal outside `0..=8`.
    Ordinal(u32),
    /// Name not in the opcode table.
    Name(String),
}

impl fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ordinal(v) => write!(f, "unknown opcode ordinal {v}"),
            Self::Name(s) => write!(f, "unknown opcode name {s:?}"),
        }
    }
}

impl std::error::Error for UnknownOpcode {}

impl TryFrom<u32> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(UnknownOpcode::Ordinal(value))
    }
}

impl FromStr for Opcode {
    type Err = UnknownOpcode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|op| op.name() == wanted)
            .ok_or_else(|| UnknownOpcode::Name(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        assert_eq!(Opcode::Conv2d.ordinal(), 0);
        assert_eq!(Opcode::Conv3dGemm.ordinal(), 3);
        assert_eq!(Opcode::Relu.ordinal(), 6);
        assert_eq!(Opcode::MmGemm.ordinal(), 8);
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.ordinal() as usize, i);
            assert_eq!(Opcode::try_from(op.ordinal()), Ok(*op));
        }
    }

    #[test]
    fn out_of_range_ordinal_rejected() {
        assert_eq!(Opcode::try_from(9), Err(UnknownOpcode::Ordinal(9)));
        assert!(Opcode::try_from(u32::MAX).is_err());
    }

    #[test]
    fn names_parse_back() {
        for op in Opcode::ALL {
            assert_eq!(op.name().parse::<Opcode>(), Ok(op));
        }
        assert_eq!("MAXPOOL_GEMM".parse::<Opcode>(), Ok(Opcode::MaxPoolGemm));
        assert!("gemm".parse::<Opcode>().is_err());
    }

    #[test]
    fn k_size_requirement() {
        assert!(Opcode::Conv2d.requires_k_size());
        assert!(Opcode::MaxPool.requires_k_size());
        assert!(!Opcode::Relu.requires_k_size());
        assert!(!Opcode::Mm.requires_k_size());
    }
}

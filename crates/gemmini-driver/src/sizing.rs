//! Buffer sizing for each operation kind
//!
//! Turns `(opcode, m_size, k_size)` into the three byte counts the submission
//! needs. Every element-count product is computed with checked 64-bit
//! multiplication, left to right; any overflow rejects the request instead of
//! wrapping. Nothing here allocates or touches the device.
//!
//! | Opcode | needs k | m elems | k elems | o elems |
//! |--------|---------|---------|---------|---------|
//! | CONV2D | yes | m·m | k·k | m elems |
//! | CONV2D_GEMM | yes | m·m·k·k | k·k | m·m |
//! | CONV3D | yes | m·m·m | k·k·k | m elems |
//! | CONV3D_GEMM | yes | (m·m·m)·(k·k·k) | k·k·k | m·m·m |
//! | MAXPOOL(_GEMM) | yes, k divides m | m·m | 0 | (m/k)·(m/k) |
//! | RELU | no | m·m | 0 | m elems |
//! | MM(_GEMM) | no | m·m | m elems | m elems |

use crate::error::{GemminiError, Result};
use gemmini_chip::Opcode;

/// Bytes per tensor element (single-precision float).
#[allow(clippy::cast_possible_truncation)]
pub const ELEMENT_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Largest single allocation the host can describe.
#[allow(clippy::cast_sign_loss)]
pub const MAX_ALLOCATION: u64 = isize::MAX as u64;

/// Element counts per operand, before conversion to bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementCounts {
    /// Operand M elements
    pub m: u64,
    /// Operand K elements, zero when the opcode has no K operand
    pub k: u64,
    /// Output elements
    pub o: u64,
}

/// Byte counts for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePlan {
    m_bytes: usize,
    k_bytes: usize,
    o_bytes: usize,
}

impl SizePlan {
    /// Operand M size in bytes (always non-zero)
    pub const fn m_bytes(&self) -> usize {
        self.m_bytes
    }

    /// Operand K size in bytes (zero when absent)
    pub const fn k_bytes(&self) -> usize {
        self.k_bytes
    }

    /// Output size in bytes (always non-zero)
    pub const fn o_bytes(&self) -> usize {
        self.o_bytes
    }

    /// Whether the operation has a K operand
    pub const fn has_k(&self) -> bool {
        self.k_bytes != 0
    }

    /// Sum of all three buffers
    pub const fn total_bytes(&self) -> usize {
        // Each term is bounded by MAX_ALLOCATION; three of them fit in usize on 64-bit.
        self.m_bytes
            .saturating_add(self.k_bytes)
            .saturating_add(self.o_bytes)
    }
}

/// Product of `factors`, or `None` as soon as an intermediate overflows
pub fn mul_chain(factors: &[u64]) -> Option<u64> {
    factors
        .iter()
        .try_fold(1u64, |acc, &f| acc.checked_mul(f))
}

fn elems(opcode: Opcode, operand: &str, factors: &[u64]) -> Result<u64> {
    mul_chain(factors).ok_or_else(|| {
        GemminiError::invalid_argument(format!(
            "{opcode}: {operand} element count overflows 64 bits"
        ))
    })
}

fn to_bytes(opcode: Opcode, operand: &str, elems: u64) -> Result<usize> {
    let bytes = elems
        .checked_mul(ELEMENT_BYTES)
        .filter(|&b| b <= MAX_ALLOCATION)
        .ok_or_else(|| {
            GemminiError::invalid_argument(format!(
                "{opcode}: {operand} buffer of {elems} elements exceeds the allocation limit"
            ))
        })?;
    usize::try_from(bytes).map_err(|_| {
        GemminiError::invalid_argument(format!(
            "{opcode}: {operand} buffer of {bytes} bytes does not fit in usize"
        ))
    })
}

/// Element counts for `opcode` with the given size parameters
///
/// # Errors
///
/// Returns `InvalidArgument` if `m_size` is zero, `k_size` is zero for an
/// opcode that needs it, `k_size` does not divide `m_size` for pooling, or any
/// product overflows.
pub fn element_counts(opcode: Opcode, m_size: u32, k_size: u32) -> Result<ElementCounts> {
    let m = u64::from(m_size);
    let k = u64::from(k_size);

    if m == 0 {
        return Err(GemminiError::invalid_argument(format!(
            "{opcode}: m_size must be non-zero"
        )));
    }
    if opcode.requires_k_size() && k == 0 {
        return Err(GemminiError::invalid_argument(format!(
            "{opcode}: k_size must be non-zero"
        )));
    }

    let counts = match opcode {
        Opcode::Conv2d => {
            let m_elems = elems(opcode, "m", &[m, m])?;
            ElementCounts {
                m: m_elems,
                k: elems(opcode, "k", &[k, k])?,
                o: m_elems,
            }
        }
        Opcode::Conv2dGemm => ElementCounts {
            m: elems(opcode, "m", &[m, m, k, k])?,
            k: elems(opcode, "k", &[k, k])?,
            o: elems(opcode, "o", &[m, m])?,
        },
        Opcode::Conv3d => {
            let m_elems = elems(opcode, "m", &[m, m, m])?;
            ElementCounts {
                m: m_elems,
                k: elems(opcode, "k", &[k, k, k])?,
                o: m_elems,
            }
        }
        Opcode::Conv3dGemm => {
            // The output is sized by the m³ volume, not by the unrolled m operand.
            let volume = elems(opcode, "m", &[m, m, m])?;
            let kernel = elems(opcode, "k", &[k, k, k])?;
            ElementCounts {
                m: elems(opcode, "m", &[volume, kernel])?,
                k: kernel,
                o: volume,
            }
        }
        Opcode::MaxPool | Opcode::MaxPoolGemm => {
            if m % k != 0 {
                return Err(GemminiError::invalid_argument(format!(
                    "{opcode}: k_size {k} does not divide m_size {m}"
                )));
            }
            let side = m / k;
            ElementCounts {
                m: elems(opcode, "m", &[m, m])?,
                k: 0,
                o: elems(opcode, "o", &[side, side])?,
            }
        }
        Opcode::Relu => {
            let m_elems = elems(opcode, "m", &[m, m])?;
            ElementCounts {
                m: m_elems,
                k: 0,
                o: m_elems,
            }
        }
        Opcode::Mm | Opcode::MmGemm => {
            let m_elems = elems(opcode, "m", &[m, m])?;
            ElementCounts {
                m: m_elems,
                k: m_elems,
                o: m_elems,
            }
        }
    };

    Ok(counts)
}

/// Byte counts for `opcode` with the given size parameters
///
/// # Errors
///
/// Returns `InvalidArgument` for every condition [`element_counts`] rejects,
/// and when a byte count overflows or exceeds [`MAX_ALLOCATION`].
pub fn plan(opcode: Opcode, m_size: u32, k_size: u32) -> Result<SizePlan> {
    let counts = element_counts(opcode, m_size, k_size)?;

    let m_bytes = to_bytes(opcode, "m", counts.m)?;
    let k_bytes = if counts.k == 0 {
        0
    } else {
        to_bytes(opcode, "k", counts.k)?
    };
    let o_bytes = to_bytes(opcode, "o", counts.o)?;

    Ok(SizePlan {
        m_bytes,
        k_bytes,
        o_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(elems: u64) -> usize {
        usize::try_from(elems * ELEMENT_BYTES).unwrap()
    }

    fn assert_plan(op: Opcode, m: u32, k: u32, m_elems: u64, k_elems: u64, o_elems: u64) {
        let p = plan(op, m, k).unwrap();
        assert_eq!(p.m_bytes(), bytes(m_elems), "{op} m_bytes");
        assert_eq!(p.k_bytes(), bytes(k_elems), "{op} k_bytes");
        assert_eq!(p.o_bytes(), bytes(o_elems), "{op} o_bytes");
    }

    #[test]
    fn per_opcode_table() {
        assert_plan(Opcode::Conv2d, 8, 3, 64, 9, 64);
        assert_plan(Opcode::Conv2dGemm, 8, 3, 576, 9, 64);
        assert_plan(Opcode::Conv3d, 4, 2, 64, 8, 64);
        assert_plan(Opcode::MaxPool, 8, 2, 64, 0, 16);
        assert_plan(Opcode::MaxPoolGemm, 9, 3, 81, 0, 9);
        assert_plan(Opcode::Relu, 5, 0, 25, 0, 25);
        assert_plan(Opcode::Mm, 2, 0, 4, 4, 4);
        assert_plan(Opcode::MmGemm, 3, 7, 9, 9, 9);
    }

    #[test]
    fn conv3d_gemm_output_is_the_volume_intermediate() {
        // Output holds m³ elements while M holds the unrolled m³·k³.
        let c = element_counts(Opcode::Conv3dGemm, 4, 2).unwrap();
        assert_eq!(c.m, 64 * 8);
        assert_eq!(c.k, 8);
        assert_eq!(c.o, 64);
        assert_plan(Opcode::Conv3dGemm, 4, 2, 512, 8, 64);
    }

    #[test]
    fn mm_two_by_two() {
        let p = plan(Opcode::Mm, 2, 0).unwrap();
        assert_eq!(p.m_bytes(), 16);
        assert_eq!(p.k_bytes(), 16);
        assert_eq!(p.o_bytes(), 16);
        assert!(p.has_k());
        assert_eq!(p.total_bytes(), 48);
    }

    #[test]
    fn zero_m_size_always_rejected() {
        for op in Opcode::ALL {
            for k in [0, 1, 4] {
                let err = plan(op, 0, k).unwrap_err();
                assert!(
                    matches!(err, GemminiError::InvalidArgument { .. }),
                    "{op} accepted m_size=0"
                );
            }
        }
    }

    #[test]
    fn missing_k_size_rejected() {
        for op in Opcode::ALL.into_iter().filter(|op| op.requires_k_size()) {
            assert!(plan(op, 4, 0).is_err(), "{op} accepted k_size=0");
        }
        assert!(plan(Opcode::Conv2d, 4, 0).is_err());
        assert!(plan(Opcode::Relu, 4, 0).is_ok());
    }

    #[test]
    fn pooling_requires_divisibility() {
        assert!(plan(Opcode::MaxPool, 7, 2).is_err());
        assert!(plan(Opcode::MaxPoolGemm, 10, 4).is_err());
        assert!(plan(Opcode::MaxPool, 2, 4).is_err());
        assert!(plan(Opcode::MaxPool, 12, 4).is_ok());
    }

    #[test]
    fn square_overflow_in_bytes() {
        // (2^31)² · 4 = 2^64
        let err = plan(Opcode::Mm, 1 << 31, 0).unwrap_err();
        assert!(matches!(err, GemminiError::InvalidArgument { .. }));
        assert!(plan(Opcode::Relu, u32::MAX, 0).is_err());
    }

    #[test]
    fn allocation_limit_enforced_without_u64_overflow() {
        // (2^31 - 1)² · 4 < 2^64 but above isize::MAX.
        let m = (1u32 << 31) - 1;
        let c = element_counts(Opcode::Mm, m, 0).unwrap();
        assert!(c.m.checked_mul(ELEMENT_BYTES).is_some());
        assert!(plan(Opcode::Mm, m, 0).is_err());
    }

    #[test]
    fn cube_overflow_in_elements() {
        let big = u32::MAX;
        for op in [Opcode::Conv3d, Opcode::Conv3dGemm] {
            let err = element_counts(op, big, 1).unwrap_err();
            assert!(matches!(err, GemminiError::InvalidArgument { .. }));
        }
        // m³ fits, m³·k³ does not.
        assert!(element_counts(Opcode::Conv3dGemm, 1 << 16, 1 << 10).is_err());
        // m²·k·k overflows only at the last step.
        assert!(element_counts(Opcode::Conv2dGemm, 1 << 20, 1 << 12).is_err());
        assert!(element_counts(Opcode::Conv2dGemm, 1 << 20, 1 << 11).is_ok());
    }

    #[test]
    fn byte_counts_are_element_counts_times_width() {
        for op in Opcode::ALL {
            for m in 1..=12u32 {
                for k in 0..=4u32 {
                    let Ok(c) = element_counts(op, m, k) else {
                        assert!(plan(op, m, k).is_err());
                        continue;
                    };
                    let p = plan(op, m, k).unwrap();
                    assert_eq!(p.m_bytes() as u64, c.m * ELEMENT_BYTES);
                    assert_eq!(p.k_bytes() as u64, c.k * ELEMENT_BYTES);
                    assert_eq!(p.o_bytes() as u64, c.o * ELEMENT_BYTES);
                    assert!(p.m_bytes() > 0 && p.o_bytes() > 0);
                    assert_eq!(p, plan(op, m, k).unwrap());
                }
            }
        }
    }

    #[test]
    fn chain_helper() {
        assert_eq!(mul_chain(&[]), Some(1));
        assert_eq!(mul_chain(&[3, 4, 5]), Some(60));
        assert_eq!(mul_chain(&[u64::MAX, 2]), None);
        assert_eq!(mul_chain(&[u64::MAX, 0]), Some(0));
    }
}

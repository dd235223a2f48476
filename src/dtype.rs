//! Element types understood by the compute unit.
//!
//! The compute unit consumes operands in 32-byte blocks, so the block factor
//! along the contraction axis depends on the element width: 16 elements for
//! `float16`, 32 for `int8`. Products are accumulated into a wider type.

use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;

use half::f16;
use num::traits::{NumCast, WrappingAdd, WrappingMul, Zero};

use crate::error::{Result, TilemmError};

/// Width in bytes of one operand block as the compute unit reads it.
pub const BLOCK_BYTES: usize = 32;

/// Numeric types that can live in a memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    I8,
    F32,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_bytes(self) -> usize {
        match self {
            DType::I8 => 1,
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
        }
    }

    /// Canonical lower-case name, as accepted by [`FromStr`].
    pub const fn name(self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::I8 => "int8",
            DType::F32 => "float32",
            DType::I32 => "int32",
        }
    }

    /// Whether the compute unit accepts this type as a matmul operand.
    pub const fn is_input(self) -> bool {
        matches!(self, DType::F16 | DType::I8)
    }

    /// The type products of this input type are accumulated into.
    pub fn accumulator(self) -> Result<DType> {
        match self {
            DType::F16 => Ok(DType::F32),
            DType::I8 => Ok(DType::I32),
            other => Err(not_an_input(other)),
        }
    }

    /// Number of elements grouped along the blocked axis (K0).
    pub fn block_factor(self) -> Result<usize> {
        if !self.is_input() {
            return Err(not_an_input(self));
        }
        Ok(BLOCK_BYTES / self.size_bytes())
    }
}

fn not_an_input(dtype: DType) -> TilemmError {
    TilemmError::InvalidElementType {
        name: dtype.name().to_string(),
        message: "only float16 and int8 are accepted as matmul operands".to_string(),
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TilemmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float16" | "f16" => Ok(DType::F16),
            "int8" | "i8" => Ok(DType::I8),
            "float32" | "f32" => Ok(DType::F32),
            "int32" | "i32" => Ok(DType::I32),
            other => Err(TilemmError::InvalidElementType {
                name: other.to_string(),
                message: "unknown element type".to_string(),
            }),
        }
    }
}

/// Accumulation-tier element: the widened type partial sums are kept in.
///
/// The arithmetic hooks carry the accumulator's overflow semantics: integer
/// accumulators wrap like the int32 hardware accumulator instead of
/// trapping.
pub trait Accumulator: Copy + Send + Sync + Debug + PartialEq + Zero + NumCast + 'static {
    const DTYPE: DType;

    fn acc_add(self, rhs: Self) -> Self;

    fn acc_mul(self, rhs: Self) -> Self;
}

impl Accumulator for f32 {
    const DTYPE: DType = DType::F32;

    #[inline(always)]
    fn acc_add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline(always)]
    fn acc_mul(self, rhs: Self) -> Self {
        self * rhs
    }
}

impl Accumulator for i32 {
    const DTYPE: DType = DType::I32;

    #[inline(always)]
    fn acc_add(self, rhs: Self) -> Self {
        WrappingAdd::wrapping_add(&self, &rhs)
    }

    #[inline(always)]
    fn acc_mul(self, rhs: Self) -> Self {
        WrappingMul::wrapping_mul(&self, &rhs)
    }
}

/// Operand element accepted by the compute unit.
pub trait Element: Copy + Send + Sync + Debug + PartialEq + Zero + NumCast + 'static {
    /// Widened type products are accumulated into.
    type Acc: Accumulator + From<Self>;

    const DTYPE: DType;
}

impl Element for f16 {
    type Acc = f32;
    const DTYPE: DType = DType::F16;
}

impl Element for i8 {
    type Acc = i32;
    const DTYPE: DType = DType::I8;
}

//! Error types for tilemm operations.
//!
//! Every failure is detected while a kernel is being built or while a stage
//! is being issued, never half way through a partition's output. Errors carry
//! the offending values so callers can report which dimension or divisor was
//! violated.

use thiserror::Error;

use crate::memory::MemoryTier;
use crate::schedule::LoopAxis;

/// Errors that can occur while building or running a tiled matmul kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TilemmError {
    /// A dimension is not an exact multiple of a required divisor.
    #[error("{dimension} ({value}) is not divisible by {divisor_name} ({divisor})")]
    NotDivisible {
        /// The dimension that was checked.
        dimension: &'static str,
        /// Its configured value.
        value: usize,
        /// What the divisor is (block factor, tile size, partition count, ...).
        divisor_name: &'static str,
        /// The divisor value.
        divisor: usize,
    },

    /// A matrix dimension or tile size was zero.
    #[error("{dimension} must be non-zero")]
    EmptyDimension {
        /// The dimension that was zero.
        dimension: &'static str,
    },

    /// The element type is unknown or cannot be used as a matmul input.
    #[error("invalid element type `{name}`: {message}")]
    InvalidElementType {
        /// The rejected type name.
        name: String,
        /// Human-readable reason.
        message: String,
    },

    /// A loop was configured with a pipelining degree of zero.
    #[error("pipelining degree for the {axis} loop must be at least 1, got {degree}")]
    InvalidPipelineDepth {
        /// The loop that was misconfigured.
        axis: LoopAxis,
        /// The rejected degree.
        degree: usize,
    },

    /// The platform was configured without any compute partitions.
    #[error("partition count must be at least 1")]
    InvalidPartitionCount,

    /// A buffer does not fit in its memory tier.
    #[error(
        "{tier} tier capacity exceeded: requested {requested} bytes with {reserved} bytes \
         already reserved, capacity is {capacity} bytes"
    )]
    Capacity {
        /// The tier that ran out of room.
        tier: MemoryTier,
        /// Size of the rejected allocation in bytes.
        requested: usize,
        /// Bytes already reserved in the tier.
        reserved: usize,
        /// Physical capacity of the tier in bytes.
        capacity: usize,
    },

    /// A single strided transfer would exceed the engine's addressable span.
    #[error("transfer gap of {gap} rows exceeds the span limit of {limit} rows")]
    TransferSpan {
        /// The requested gap between bursts.
        gap: usize,
        /// The engine's span limit.
        limit: usize,
    },

    /// A transfer was malformed (bad route, row width or bounds).
    #[error("invalid transfer: {message}")]
    Transfer {
        /// Human-readable reason.
        message: String,
    },

    /// An input matrix does not have the shape the kernel was built for.
    #[error("shape mismatch for {operand}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Which operand was rejected.
        operand: &'static str,
        /// Expected `(rows, cols)`.
        expected: (usize, usize),
        /// Provided `(rows, cols)`.
        actual: (usize, usize),
    },

    /// An accumulation block was driven through an illegal state transition.
    #[error("accumulator state violation: {message}")]
    TileState {
        /// Human-readable reason.
        message: String,
    },
}

/// Result type alias for tilemm operations.
pub type Result<T> = std::result::Result<T, TilemmError>;

/// Creates a divisibility error.
pub fn not_divisible(
    dimension: &'static str,
    value: usize,
    divisor_name: &'static str,
    divisor: usize,
) -> TilemmError {
    TilemmError::NotDivisible {
        dimension,
        value,
        divisor_name,
        divisor,
    }
}

/// Creates a transfer error.
pub fn transfer_error(message: impl Into<String>) -> TilemmError {
    TilemmError::Transfer {
        message: message.into(),
    }
}

/// Creates an accumulator state error.
pub fn tile_state_error(message: impl Into<String>) -> TilemmError {
    TilemmError::TileState {
        message: message.into(),
    }
}

/// Checks that `value` is non-zero and a multiple of `divisor`.
pub(crate) fn ensure_divisible(
    dimension: &'static str,
    value: usize,
    divisor_name: &'static str,
    divisor: usize,
) -> Result<()> {
    if divisor == 0 || value % divisor != 0 {
        return Err(not_divisible(dimension, value, divisor_name, divisor));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_divisible_display() {
        let error = not_divisible("K", 40, "block factor", 16);
        let display = format!("{}", error);
        assert!(display.contains("K (40)"));
        assert!(display.contains("block factor (16)"));
    }

    #[test]
    fn test_capacity_display() {
        let error = TilemmError::Capacity {
            tier: MemoryTier::Accumulation,
            requested: 4096,
            reserved: 1024,
            capacity: 2048,
        };
        let display = format!("{}", error);
        assert!(display.contains("accumulation tier"));
        assert!(display.contains("4096 bytes"));
        assert!(display.contains("capacity is 2048 bytes"));
    }

    #[test]
    fn test_pipeline_depth_display() {
        let error = TilemmError::InvalidPipelineDepth {
            axis: LoopAxis::K,
            degree: 0,
        };
        assert_eq!(
            error.to_string(),
            "pipelining degree for the K loop must be at least 1, got 0"
        );
    }

    #[test]
    fn test_ensure_divisible() {
        assert!(ensure_divisible("N", 1024, "N tile", 64).is_ok());
        assert_eq!(
            ensure_divisible("N", 1000, "N tile", 64),
            Err(not_divisible("N", 1000, "N tile", 64))
        );
        assert!(ensure_divisible("N", 1024, "N tile", 0).is_err());
    }

    #[test]
    fn test_error_trait_implementation() {
        let error = transfer_error("rows out of bounds");
        let _: &dyn std::error::Error = &error;
        assert!(std::error::Error::source(&error).is_none());
    }
}

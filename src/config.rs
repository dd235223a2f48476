//! Kernel and platform configuration.
//!
//! A [`KernelConfig`] describes one matmul problem and how it is tiled and
//! pipelined. A [`PlatformConfig`] carries the target's physical constants
//! (partition count, tier capacities, transfer span). Both are plain values:
//! each kernel build receives its own copies and nothing is global.

use crate::dtype::DType;
use crate::error::{ensure_divisible, Result, TilemmError};
use crate::schedule::LoopAxis;

/// Default M tile size.
pub const DEFAULT_M_TILE: usize = 16;
/// Default N tile size.
pub const DEFAULT_N_TILE: usize = 64;
/// Default K tile size.
pub const DEFAULT_K_TILE: usize = 32;

/// Number of independent compute units on the baseline platform.
pub const DEFAULT_PARTITIONS: usize = 2;

/// Largest gap, in rows, a single strided transfer can skip between bursts.
pub const DEFAULT_MAX_TRANSFER_SPAN: usize = 65535;

/// Staging tier capacity of the baseline platform (1 MiB).
pub const DEFAULT_STAGING_CAPACITY: usize = 1 << 20;

/// Accumulation tier capacity of the baseline platform (256 KiB).
pub const DEFAULT_ACCUMULATION_CAPACITY: usize = 256 << 10;

/// Block factor of the accumulation tier along N.
pub const FRACTAL_SIZE: usize = 16;

/// Tile sizes along each problem dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl Default for TileShape {
    fn default() -> Self {
        Self {
            m: DEFAULT_M_TILE,
            n: DEFAULT_N_TILE,
            k: DEFAULT_K_TILE,
        }
    }
}

/// Number of rotating buffer slots per loop. `1` means no overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineDegrees {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl PipelineDegrees {
    pub fn get(&self, axis: LoopAxis) -> usize {
        match axis {
            LoopAxis::M => self.m,
            LoopAxis::N => self.n,
            LoopAxis::K => self.k,
        }
    }
}

impl Default for PipelineDegrees {
    fn default() -> Self {
        Self { m: 1, n: 1, k: 1 }
    }
}

/// Problem shape, element type and schedule parameters of one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Rows of A and C.
    pub m: usize,
    /// Columns of A, rows of B.
    pub k: usize,
    /// Columns of B and C.
    pub n: usize,
    pub dtype: DType,
    pub tiles: TileShape,
    pub pipeline: PipelineDegrees,
}

impl KernelConfig {
    /// Creates a configuration with default tiles and no pipelining.
    pub fn new(m: usize, k: usize, n: usize, dtype: DType) -> Self {
        Self {
            m,
            k,
            n,
            dtype,
            tiles: TileShape::default(),
            pipeline: PipelineDegrees::default(),
        }
    }

    /// Sets the M, N and K tile sizes.
    pub fn with_tiles(mut self, m_tile: usize, n_tile: usize, k_tile: usize) -> Self {
        self.tiles = TileShape {
            m: m_tile,
            n: n_tile,
            k: k_tile,
        };
        self
    }

    /// Sets the M, N and K pipelining degrees.
    pub fn with_pipeline(mut self, m_degree: usize, n_degree: usize, k_degree: usize) -> Self {
        self.pipeline = PipelineDegrees {
            m: m_degree,
            n: n_degree,
            k: k_degree,
        };
        self
    }

    /// Block factor (K0) of the configured element type.
    pub fn block_factor(&self) -> Result<usize> {
        self.dtype.block_factor()
    }

    /// Checks every build-time constraint, returning the first violation.
    pub fn validate(&self, platform: &PlatformConfig) -> Result<()> {
        let k0 = self.block_factor()?;

        for (dimension, value) in [
            ("M", self.m),
            ("K", self.k),
            ("N", self.n),
            ("M tile", self.tiles.m),
            ("N tile", self.tiles.n),
            ("K tile", self.tiles.k),
        ] {
            if value == 0 {
                return Err(TilemmError::EmptyDimension { dimension });
            }
        }

        for axis in [LoopAxis::M, LoopAxis::N, LoopAxis::K] {
            let degree = self.pipeline.get(axis);
            if degree == 0 {
                return Err(TilemmError::InvalidPipelineDepth { axis, degree });
            }
        }

        platform.validate()?;

        ensure_divisible("K", self.k, "block factor", k0)?;
        ensure_divisible("N", self.n, "block factor", k0)?;
        ensure_divisible("N", self.n, "fractal size", platform.fractal_size)?;

        ensure_divisible("M", self.m, "M tile", self.tiles.m)?;
        ensure_divisible("N", self.n, "N tile", self.tiles.n)?;
        ensure_divisible("K", self.k, "K tile", self.tiles.k)?;

        ensure_divisible("K tile", self.tiles.k, "block factor", k0)?;
        ensure_divisible("N tile", self.tiles.n, "fractal size", platform.fractal_size)?;

        ensure_divisible(
            "N tile count",
            self.n / self.tiles.n,
            "partition count",
            platform.partitions,
        )?;

        Ok(())
    }
}

/// Physical constants of the target accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Independent compute units; N is split evenly across them.
    pub partitions: usize,
    /// Largest gap (in rows) one strided transfer may skip between bursts.
    pub max_transfer_span: usize,
    /// Staging tier capacity in bytes, per compute unit.
    pub staging_capacity: usize,
    /// Accumulation tier capacity in bytes, per compute unit.
    pub accumulation_capacity: usize,
    /// Block factor of accumulation blocks along N.
    pub fractal_size: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            max_transfer_span: DEFAULT_MAX_TRANSFER_SPAN,
            staging_capacity: DEFAULT_STAGING_CAPACITY,
            accumulation_capacity: DEFAULT_ACCUMULATION_CAPACITY,
            fractal_size: FRACTAL_SIZE,
        }
    }
}

impl PlatformConfig {
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_max_transfer_span(mut self, span: usize) -> Self {
        self.max_transfer_span = span;
        self
    }

    pub fn with_staging_capacity(mut self, bytes: usize) -> Self {
        self.staging_capacity = bytes;
        self
    }

    pub fn with_accumulation_capacity(mut self, bytes: usize) -> Self {
        self.accumulation_capacity = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(TilemmError::InvalidPartitionCount);
        }
        if self.fractal_size == 0 {
            return Err(TilemmError::EmptyDimension {
                dimension: "fractal size",
            });
        }
        Ok(())
    }
}

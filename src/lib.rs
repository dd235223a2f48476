//! Tiled matrix multiplication for accelerators with blocked operand layouts.
//!
//! `C = A x B` is computed by streaming tiles of the blocked operands from
//! global memory into a small staging tier, multiply-accumulating them into
//! blocks of a dedicated accumulation tier and draining finished blocks back
//! to global memory. The N dimension is split across independent partitions
//! that run in parallel.
//!
//! ```
//! use tilemm::{build_kernel, DType, KernelConfig};
//! use ndarray::Array2;
//!
//! let kernel = build_kernel::<i8>(KernelConfig::new(16, 64, 128, DType::I8)).unwrap();
//! let a = Array2::<i8>::ones((16, 64));
//! let b = Array2::<i8>::ones((64, 128));
//! let c = kernel.run(a.view(), b.view()).unwrap();
//! assert_eq!(c[[0, 0]], 64);
//! ```

pub mod config;
pub mod dtype;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod mmad;
pub mod pipeline;
pub mod schedule;
pub mod writer;

pub use config::{KernelConfig, PipelineDegrees, PlatformConfig, TileShape, FRACTAL_SIZE};
pub use dtype::{Accumulator, DType, Element};
pub use error::{Result, TilemmError};
pub use kernel::{build_kernel, matmul, KernelStats, MatmulKernel};
pub use memory::{MemoryTier, StageBufferManager, TransferDescriptor, TransferStats};
pub use mmad::{MatrixUnit, MmadShape, ScalarUnit, TileState};
pub use schedule::{LoopAxis, TileCoord, TilePlan};

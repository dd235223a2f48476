//! Kernel entry point.
//!
//! [`MatmulKernel`] validates a configuration once, then runs any number of
//! multiplications with it. Each run blocks the operands, splits the blocked
//! output workspace into one contiguous slice per partition and runs the
//! partitions concurrently on the rayon pool.

use std::marker::PhantomData;

use ndarray::{Array2, ArrayView2};
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};
use tracing::info;

use crate::config::{KernelConfig, PlatformConfig};
use crate::dtype::Element;
use crate::error::{Result, TilemmError};
use crate::layout::{to_blocked, to_blocked_b};
use crate::memory::TransferStats;
use crate::mmad::{MatrixUnit, ScalarUnit};
use crate::schedule::{reserve_workspaces, run_partition, TilePlan};
use crate::writer::{finalize, output_workspace};

/// Counters collected while running a kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub partitions: usize,
    pub transfers: TransferStats,
    pub mmad_calls: usize,
    pub drained_tiles: usize,
    /// Largest staging reservation of any single partition, in bytes.
    pub peak_staging_bytes: usize,
    /// Largest accumulation reservation of any single partition, in bytes.
    pub peak_accumulation_bytes: usize,
}

impl KernelStats {
    /// Folds the counters of another partition into `self`.
    pub fn merge(&mut self, other: &KernelStats) {
        self.partitions += other.partitions;
        self.transfers.merge(&other.transfers);
        self.mmad_calls += other.mmad_calls;
        self.drained_tiles += other.drained_tiles;
        self.peak_staging_bytes = self.peak_staging_bytes.max(other.peak_staging_bytes);
        self.peak_accumulation_bytes = self
            .peak_accumulation_bytes
            .max(other.peak_accumulation_bytes);
    }
}

/// A validated tiled matmul for element type `E`.
///
/// # Example
///
/// ```
/// use half::f16;
/// use ndarray::Array2;
/// use tilemm::{DType, KernelConfig, MatmulKernel, PlatformConfig};
///
/// let config = KernelConfig::new(16, 64, 128, DType::F16).with_pipeline(1, 1, 2);
/// let kernel = MatmulKernel::<f16>::build(config, PlatformConfig::default()).unwrap();
///
/// let a = Array2::from_elem((16, 64), f16::from_f32(1.0));
/// let b = Array2::from_elem((64, 128), f16::from_f32(0.5));
/// let c = kernel.run(a.view(), b.view()).unwrap();
/// assert!(c.iter().all(|&v| v == 32.0));
/// ```
#[derive(Debug, Clone)]
pub struct MatmulKernel<E: Element, U: MatrixUnit = ScalarUnit> {
    config: KernelConfig,
    platform: PlatformConfig,
    plan: TilePlan,
    unit: U,
    _element: PhantomData<E>,
}

impl<E: Element> MatmulKernel<E, ScalarUnit> {
    /// Builds a kernel that computes on the portable [`ScalarUnit`].
    pub fn build(config: KernelConfig, platform: PlatformConfig) -> Result<Self> {
        Self::with_unit(config, platform, ScalarUnit)
    }
}

impl<E: Element, U: MatrixUnit> MatmulKernel<E, U> {
    /// Builds a kernel that issues its multiply-accumulates to `unit`.
    ///
    /// All configuration errors, including tier capacity, are reported here.
    pub fn with_unit(config: KernelConfig, platform: PlatformConfig, unit: U) -> Result<Self> {
        if config.dtype != E::DTYPE {
            return Err(TilemmError::InvalidElementType {
                name: config.dtype.name().to_string(),
                message: format!("kernel is instantiated for {}", E::DTYPE),
            });
        }

        let plan = TilePlan::new(&config, &platform)?;
        reserve_workspaces::<E>(&plan, &platform)?;

        info!(
            m = plan.m,
            k = plan.k,
            n = plan.n,
            dtype = %config.dtype,
            m_tile = plan.tiles.m,
            n_tile = plan.tiles.n,
            k_tile = plan.tiles.k,
            partitions = plan.partitions,
            "built matmul kernel"
        );

        Ok(Self {
            config,
            platform,
            plan,
            unit,
            _element: PhantomData,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    pub fn plan(&self) -> &TilePlan {
        &self.plan
    }

    /// Computes `C = A x B` for row-major `A` (`M x K`) and `B` (`K x N`).
    pub fn run(&self, a: ArrayView2<'_, E>, b: ArrayView2<'_, E>) -> Result<Array2<E::Acc>> {
        self.run_with_stats(a, b).map(|(c, _)| c)
    }

    /// Like [`run`](Self::run), also returning the merged partition counters.
    pub fn run_with_stats(
        &self,
        a: ArrayView2<'_, E>,
        b: ArrayView2<'_, E>,
    ) -> Result<(Array2<E::Acc>, KernelStats)> {
        let plan = &self.plan;
        check_shape("A", (plan.m, plan.k), a.dim())?;
        check_shape("B", (plan.k, plan.n), b.dim())?;

        let a_workspace = to_blocked(a, plan.k0)?;
        let b_workspace = to_blocked_b(b, plan.k0)?;
        let mut output = output_workspace::<E::Acc>(plan);

        let partials = output
            .as_mut_slice()
            .par_chunks_mut(plan.partition_output_len())
            .enumerate()
            .map(|(partition, slice)| {
                run_partition(
                    plan,
                    &self.unit,
                    &self.platform,
                    &a_workspace,
                    &b_workspace,
                    partition,
                    slice,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stats = KernelStats::default();
        for partial in &partials {
            stats.merge(partial);
        }
        info!(
            mmad_calls = stats.mmad_calls,
            drained_tiles = stats.drained_tiles,
            transfers = stats.transfers.transfers,
            split_stages = stats.transfers.split_stages,
            "kernel finished"
        );

        Ok((finalize(plan, &output)?, stats))
    }
}

fn check_shape(
    operand: &'static str,
    expected: (usize, usize),
    actual: (usize, usize),
) -> Result<()> {
    if expected != actual {
        return Err(TilemmError::ShapeMismatch {
            operand,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Builds a kernel for `config` on the default platform.
pub fn build_kernel<E: Element>(config: KernelConfig) -> Result<MatmulKernel<E>> {
    MatmulKernel::build(config, PlatformConfig::default())
}

/// Multiplies `a` by `b` with default tiles and platform.
pub fn matmul<E: Element>(a: ArrayView2<'_, E>, b: ArrayView2<'_, E>) -> Result<Array2<E::Acc>> {
    let (m, k) = a.dim();
    let n = b.ncols();
    build_kernel::<E>(KernelConfig::new(m, k, n, E::DTYPE))?.run(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use half::f16;

    #[test]
    fn stats_merge_sums_counts_and_keeps_peaks() {
        let mut total = KernelStats {
            partitions: 1,
            mmad_calls: 4,
            drained_tiles: 2,
            peak_staging_bytes: 100,
            peak_accumulation_bytes: 50,
            ..Default::default()
        };
        total.merge(&KernelStats {
            partitions: 1,
            mmad_calls: 6,
            drained_tiles: 3,
            peak_staging_bytes: 80,
            peak_accumulation_bytes: 70,
            ..Default::default()
        });
        assert_eq!(total.partitions, 2);
        assert_eq!(total.mmad_calls, 10);
        assert_eq!(total.drained_tiles, 5);
        assert_eq!(total.peak_staging_bytes, 100);
        assert_eq!(total.peak_accumulation_bytes, 70);
    }

    #[test]
    fn element_type_must_match_config() {
        let config = KernelConfig::new(16, 64, 128, DType::I8).with_tiles(16, 64, 32);
        let result = MatmulKernel::<f16>::build(config, PlatformConfig::default());
        assert!(matches!(
            result,
            Err(TilemmError::InvalidElementType { .. })
        ));
    }

    #[test]
    fn wrong_operand_shape_is_rejected() {
        let kernel = build_kernel::<i8>(KernelConfig::new(16, 64, 128, DType::I8)).unwrap();
        let a = Array2::<i8>::zeros((16, 64));
        let b = Array2::<i8>::zeros((32, 128));
        assert_eq!(
            kernel.run(a.view(), b.view()),
            Err(TilemmError::ShapeMismatch {
                operand: "B",
                expected: (64, 128),
                actual: (32, 128),
            })
        );
    }

    #[test]
    fn stats_count_every_tile() {
        let config = KernelConfig::new(32, 64, 256, DType::I8)
            .with_tiles(16, 64, 32)
            .with_pipeline(2, 2, 2);
        let kernel = build_kernel::<i8>(config).unwrap();
        let a = Array2::<i8>::ones((32, 64));
        let b = Array2::<i8>::ones((64, 256));
        let (c, stats) = kernel.run_with_stats(a.view(), b.view()).unwrap();

        let plan = kernel.plan();
        assert!(c.iter().all(|&v| v == 64));
        assert_eq!(stats.partitions, 2);
        assert_eq!(stats.drained_tiles, plan.m_tiles * plan.n_tiles);
        assert_eq!(stats.mmad_calls, plan.m_tiles * plan.n_tiles * plan.k_tiles);
        // Two stages per MMAD plus one drain per tile.
        assert_eq!(stats.transfers.transfers, 2 * stats.mmad_calls + stats.drained_tiles);
        assert_eq!(stats.peak_staging_bytes, plan.staging_bytes::<i8>());
        assert_eq!(stats.peak_accumulation_bytes, plan.accumulation_bytes::<i8>());
    }
}

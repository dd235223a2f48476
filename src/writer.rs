//! Output path: accumulation tier to blocked workspace to row-major result.

use ndarray::Array2;
use num::traits::Zero;
use tracing::debug;

use crate::dtype::Accumulator;
use crate::error::Result;
use crate::layout::to_row_major;
use crate::memory::{Buffer, MemoryTier, StageBufferManager, TileMut};
use crate::mmad::AccumulatorBlock;
use crate::schedule::{stage_strided, TileCoord, TilePlan};

/// Zero-filled blocked output workspace `(N/N0, M, N0)` in global memory.
pub fn output_workspace<A: Copy + Zero>(plan: &TilePlan) -> Buffer<A> {
    Buffer::zeroed(MemoryTier::Global, plan.output_shape())
}

/// Copies a finished accumulation block into the partition's output slice.
///
/// `coord` is the last K step of the tile; the block must have completed all
/// `plan.k_tiles` steps.
pub fn drain<A: Accumulator>(
    manager: &mut StageBufferManager,
    plan: &TilePlan,
    block: &mut AccumulatorBlock<A>,
    output: TileMut<'_, A>,
    coord: TileCoord,
) -> Result<()> {
    let desc = plan.drain(coord);
    let buffer = block.begin_drain(plan.k_tiles)?;
    stage_strided(manager, output, buffer.view(), &desc)?;

    debug!(
        partition = coord.partition,
        n_tile = plan.global_n_tile(coord.partition, coord.n),
        m_tile = coord.m,
        "drained output tile"
    );
    Ok(())
}

/// Reassembles the row-major `M x N` result from the blocked workspace.
pub fn finalize<A: Copy>(plan: &TilePlan, output: &Buffer<A>) -> Result<Array2<A>> {
    to_row_major(output, plan.n0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, PlatformConfig};
    use crate::dtype::DType;
    use crate::error::TilemmError;
    use crate::layout::{to_blocked, to_blocked_b};
    use crate::mmad::{accumulate, ScalarUnit};

    fn small_plan() -> TilePlan {
        TilePlan::new(
            &KernelConfig::new(32, 32, 64, DType::I8).with_tiles(16, 32, 32),
            &PlatformConfig::default().with_partitions(1),
        )
        .unwrap()
    }

    #[test]
    fn drain_places_tile_at_its_offset() {
        let plan = small_plan();
        let platform = PlatformConfig::default().with_partitions(1);
        let mut manager = StageBufferManager::new(&platform);
        let shape = plan.mmad_shape();

        let a = ndarray::Array2::<i8>::ones((16, 32));
        let b = ndarray::Array2::<i8>::ones((32, 32));
        let a_tile = to_blocked(a.view(), plan.k0).unwrap();
        let b_tile = to_blocked_b(b.view(), plan.k0).unwrap();

        let coord = TileCoord {
            partition: 0,
            n: 1,
            m: 1,
            k: 0,
        };
        let mut block = AccumulatorBlock::<i32>::allocate(&mut manager, shape.acc_shape()).unwrap();
        accumulate(&ScalarUnit, &mut block, &a_tile, &b_tile, &shape, coord).unwrap();

        let mut out = output_workspace::<i32>(&plan);
        let row_len = out.shape().inner;
        drain(
            &mut manager,
            &plan,
            &mut block,
            TileMut::new(MemoryTier::Global, out.as_mut_slice(), row_len),
            coord,
        )
        .unwrap();

        let c = finalize(&plan, &out).unwrap();
        for ((r, col), &v) in c.indexed_iter() {
            let inside = r >= 16 && col >= 32;
            assert_eq!(v, if inside { 32 } else { 0 }, "at ({r}, {col})");
        }
    }

    #[test]
    fn drain_before_all_k_steps_is_refused() {
        let plan = TilePlan::new(
            &KernelConfig::new(16, 64, 32, DType::I8).with_tiles(16, 32, 32),
            &PlatformConfig::default().with_partitions(1),
        )
        .unwrap();
        let platform = PlatformConfig::default();
        let mut manager = StageBufferManager::new(&platform);
        let shape = plan.mmad_shape();

        let a_tile = to_blocked(ndarray::Array2::<i8>::ones((16, 32)).view(), 32).unwrap();
        let b_tile = to_blocked_b(ndarray::Array2::<i8>::ones((32, 32)).view(), 32).unwrap();
        let coord = TileCoord {
            partition: 0,
            n: 0,
            m: 0,
            k: 0,
        };
        let mut block = AccumulatorBlock::<i32>::allocate(&mut manager, shape.acc_shape()).unwrap();
        accumulate(&ScalarUnit, &mut block, &a_tile, &b_tile, &shape, coord).unwrap();

        let mut out = output_workspace::<i32>(&plan);
        let result = drain(
            &mut manager,
            &plan,
            &mut block,
            TileMut::new(MemoryTier::Global, out.as_mut_slice(), 16),
            coord,
        );
        assert!(matches!(result, Err(TilemmError::TileState { .. })));
        assert!(out.as_slice().iter().all(|&v| v == 0));
    }
}

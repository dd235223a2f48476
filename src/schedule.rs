//! Static tile schedule.
//!
//! For every partition, for every N tile it owns, for every M tile:
//! initialize one accumulation block, stream the K tiles of A and B through
//! the staging tier and multiply-accumulate them in increasing K order, then
//! drain the block into the blocked output workspace.
//!
//! Each of the three loops runs through a [`Pipeline`] whose ring size is the
//! loop's pipelining degree:
//!
//! - K loop: slots are staging pairs; `load` stages A and B, `compute`
//!   multiply-accumulates.
//! - M loop: slots are accumulation blocks; `compute` runs the K loop,
//!   `store` drains the block.
//! - N loop: slots are whole tile workspaces (accumulation ring + staging ring).
//!
//! Every transfer address is a pure function of the tile coordinate, so
//! partitions write disjoint slices of the output and need no locking.

use std::fmt;

use tracing::debug;

use crate::config::{KernelConfig, PipelineDegrees, PlatformConfig, TileShape};
use crate::dtype::Element;
use crate::error::Result;
use crate::kernel::KernelStats;
use crate::memory::{
    BlockShape, Buffer, MemoryTier, StageBufferManager, Tile, TileMut, TransferDescriptor,
};
use crate::mmad::{accumulate, AccumulatorBlock, MatrixUnit, MmadShape};
use crate::pipeline::{Pipeline, PipelineBody, Ring};
use crate::writer;

/// One of the three tiled loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopAxis {
    M,
    N,
    K,
}

impl fmt::Display for LoopAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopAxis::M => "M",
            LoopAxis::N => "N",
            LoopAxis::K => "K",
        };
        f.write_str(name)
    }
}

/// Position of one unit of scheduled work.
///
/// `n` is local to the partition; see [`TilePlan::global_n_tile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub partition: usize,
    pub n: usize,
    pub m: usize,
    pub k: usize,
}

impl TileCoord {
    /// The output tile this coordinate contributes to.
    pub fn output_tile(&self) -> (usize, usize, usize) {
        (self.partition, self.n, self.m)
    }

    pub fn with_k(self, k: usize) -> Self {
        Self { k, ..self }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(partition {}, n {}, m {}, k {})",
            self.partition, self.n, self.m, self.k
        )
    }
}

/// Tile counts and address arithmetic for a validated configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    /// Block factor of the operands.
    pub k0: usize,
    /// Block factor of the output.
    pub n0: usize,
    pub tiles: TileShape,
    pub pipeline: PipelineDegrees,
    pub partitions: usize,
    pub m_tiles: usize,
    pub n_tiles: usize,
    pub k_tiles: usize,
    pub n_tiles_per_partition: usize,
}

impl TilePlan {
    pub fn new(config: &KernelConfig, platform: &PlatformConfig) -> Result<Self> {
        config.validate(platform)?;
        let k0 = config.block_factor()?;
        let n_tiles = config.n / config.tiles.n;

        Ok(Self {
            m: config.m,
            k: config.k,
            n: config.n,
            k0,
            n0: platform.fractal_size,
            tiles: config.tiles,
            pipeline: config.pipeline,
            partitions: platform.partitions,
            m_tiles: config.m / config.tiles.m,
            n_tiles,
            k_tiles: config.k / config.tiles.k,
            n_tiles_per_partition: n_tiles / platform.partitions,
        })
    }

    pub fn mmad_shape(&self) -> MmadShape {
        MmadShape {
            m: self.tiles.m,
            k: self.tiles.k,
            n: self.tiles.n,
            k0: self.k0,
            n0: self.n0,
        }
    }

    /// Blocked A workspace, `(K/K0, M, K0)`.
    pub fn a_workspace_shape(&self) -> BlockShape {
        BlockShape::new(self.k / self.k0, self.m, self.k0)
    }

    /// Blocked B workspace, `(K/K0, N, K0)`.
    pub fn b_workspace_shape(&self) -> BlockShape {
        BlockShape::new(self.k / self.k0, self.n, self.k0)
    }

    /// Blocked output workspace, `(N/N0, M, N0)`.
    pub fn output_shape(&self) -> BlockShape {
        BlockShape::new(self.n / self.n0, self.m, self.n0)
    }

    /// Elements of the output workspace owned by one partition.
    pub fn partition_output_len(&self) -> usize {
        (self.n / self.partitions) * self.m
    }

    pub fn global_n_tile(&self, partition: usize, n: usize) -> usize {
        partition * self.n_tiles_per_partition + n
    }

    /// Stages the A tile of `coord` from the blocked A workspace.
    pub fn a_stage(&self, coord: TileCoord) -> TransferDescriptor {
        let k_blocks = self.tiles.k / self.k0;
        TransferDescriptor {
            src_row: coord.k * k_blocks * self.m + coord.m * self.tiles.m,
            dst_row: 0,
            burst_count: k_blocks,
            burst_len: self.tiles.m,
            src_gap: self.m - self.tiles.m,
            dst_gap: 0,
        }
    }

    /// Stages the B tile of `coord` from the blocked B workspace.
    pub fn b_stage(&self, coord: TileCoord) -> TransferDescriptor {
        let k_blocks = self.tiles.k / self.k0;
        let n_tile = self.global_n_tile(coord.partition, coord.n);
        TransferDescriptor {
            src_row: coord.k * k_blocks * self.n + n_tile * self.tiles.n,
            dst_row: 0,
            burst_count: k_blocks,
            burst_len: self.tiles.n,
            src_gap: self.n - self.tiles.n,
            dst_gap: 0,
        }
    }

    /// Drains the accumulation block of `coord` into its partition's slice
    /// of the output workspace.
    pub fn drain(&self, coord: TileCoord) -> TransferDescriptor {
        let n_blocks = self.tiles.n / self.n0;
        TransferDescriptor {
            src_row: 0,
            dst_row: coord.n * n_blocks * self.m + coord.m * self.tiles.m,
            burst_count: n_blocks,
            burst_len: self.tiles.m,
            src_gap: 0,
            dst_gap: self.m - self.tiles.m,
        }
    }

    /// Every coordinate of `partition` in issue order.
    pub fn tile_order(&self, partition: usize) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.n_tiles_per_partition).flat_map(move |n| {
            (0..self.m_tiles).flat_map(move |m| {
                (0..self.k_tiles).map(move |k| TileCoord {
                    partition,
                    n,
                    m,
                    k,
                })
            })
        })
    }

    /// Staging bytes one partition reserves for element type `E`.
    pub fn staging_bytes<E: Element>(&self) -> usize {
        let shape = self.mmad_shape();
        let pair = (shape.a_shape().len() + shape.b_shape().len()) * std::mem::size_of::<E>();
        self.pipeline.n * self.pipeline.k * pair
    }

    /// Accumulation bytes one partition reserves for element type `E`.
    pub fn accumulation_bytes<E: Element>(&self) -> usize {
        let block = self.mmad_shape().acc_shape().len() * std::mem::size_of::<E::Acc>();
        self.pipeline.n * self.pipeline.m * block
    }
}

/// Issues `desc`, splitting it into one transfer per burst when its gap
/// exceeds what the engine can address in one operation.
pub(crate) fn stage_strided<T: Copy>(
    manager: &mut StageBufferManager,
    mut dst: TileMut<'_, T>,
    src: Tile<'_, T>,
    desc: &TransferDescriptor,
) -> Result<()> {
    let limit = manager.max_transfer_span();
    if desc.max_gap() <= limit {
        return manager.transfer(dst, src, desc);
    }

    debug!(
        gap = desc.max_gap(),
        limit,
        bursts = desc.burst_count,
        "gap exceeds transfer span, staging one burst at a time"
    );
    manager.record_split_stage();
    for b in 0..desc.burst_count {
        manager.transfer(dst.reborrow(), src, &desc.burst(b))?;
    }
    Ok(())
}

/// Staging-tier copies of one A tile and one B tile.
#[derive(Debug)]
pub struct StagingPair<E> {
    pub a: Buffer<E>,
    pub b: Buffer<E>,
}

impl<E: Element> StagingPair<E> {
    fn allocate(manager: &mut StageBufferManager, shape: &MmadShape) -> Result<Self> {
        Ok(Self {
            a: manager.allocate(MemoryTier::Staging, shape.a_shape())?,
            b: manager.allocate(MemoryTier::Staging, shape.b_shape())?,
        })
    }
}

/// Everything one N iteration needs resident on the compute unit.
#[derive(Debug)]
pub struct TileWorkspace<E: Element> {
    acc: Ring<AccumulatorBlock<E::Acc>>,
    staging: Ring<StagingPair<E>>,
}

impl<E: Element> TileWorkspace<E> {
    fn allocate(manager: &mut StageBufferManager, plan: &TilePlan) -> Result<Self> {
        let shape = plan.mmad_shape();
        let acc = Ring::try_from_fn(plan.pipeline.m, |_| {
            AccumulatorBlock::allocate(manager, shape.acc_shape())
        })?;
        let staging = Ring::try_from_fn(plan.pipeline.k, |_| {
            StagingPair::allocate(manager, &shape)
        })?;
        Ok(Self { acc, staging })
    }
}

fn allocate_workspaces<E: Element>(
    manager: &mut StageBufferManager,
    plan: &TilePlan,
) -> Result<Ring<TileWorkspace<E>>> {
    Ring::try_from_fn(plan.pipeline.n, |_| TileWorkspace::allocate(manager, plan))
}

/// Reserves one partition's working set without running anything, so
/// capacity errors surface while the kernel is built.
pub fn reserve_workspaces<E: Element>(plan: &TilePlan, platform: &PlatformConfig) -> Result<()> {
    let mut manager = StageBufferManager::new(platform);
    allocate_workspaces::<E>(&mut manager, plan)?;
    debug!(
        staging_bytes = manager.reserved(MemoryTier::Staging),
        accumulation_bytes = manager.reserved(MemoryTier::Accumulation),
        "reserved partition working set"
    );
    Ok(())
}

/// State shared by the loops of one partition.
struct PartitionRun<'a, E, U> {
    plan: &'a TilePlan,
    unit: &'a U,
    a_workspace: &'a Buffer<E>,
    b_workspace: &'a Buffer<E>,
    manager: StageBufferManager,
    mmad_calls: usize,
    drained_tiles: usize,
}

struct KLoop<'r, 'a, E: Element, U> {
    run: &'r mut PartitionRun<'a, E, U>,
    acc: &'r mut AccumulatorBlock<E::Acc>,
    tile: TileCoord,
}

impl<E: Element, U: MatrixUnit> PipelineBody<StagingPair<E>> for KLoop<'_, '_, E, U> {
    fn load(&mut self, k: usize, slot: &mut StagingPair<E>) -> Result<()> {
        let coord = self.tile.with_k(k);
        let plan = self.run.plan;
        stage_strided(
            &mut self.run.manager,
            slot.a.view_mut(),
            self.run.a_workspace.view(),
            &plan.a_stage(coord),
        )?;
        stage_strided(
            &mut self.run.manager,
            slot.b.view_mut(),
            self.run.b_workspace.view(),
            &plan.b_stage(coord),
        )
    }

    fn compute(&mut self, k: usize, slot: &mut StagingPair<E>) -> Result<()> {
        let shape = self.run.plan.mmad_shape();
        accumulate(
            self.run.unit,
            self.acc,
            &slot.a,
            &slot.b,
            &shape,
            self.tile.with_k(k),
        )?;
        self.run.mmad_calls += 1;
        Ok(())
    }
}

struct MLoop<'r, 'a, E: Element, U> {
    run: &'r mut PartitionRun<'a, E, U>,
    staging: &'r mut Ring<StagingPair<E>>,
    output: &'r mut [E::Acc],
    partition: usize,
    n: usize,
}

impl<E: Element, U: MatrixUnit> PipelineBody<AccumulatorBlock<E::Acc>> for MLoop<'_, '_, E, U> {
    fn compute(&mut self, m: usize, acc: &mut AccumulatorBlock<E::Acc>) -> Result<()> {
        let k_tiles = self.run.plan.k_tiles;
        let mut body = KLoop {
            run: &mut *self.run,
            acc,
            tile: TileCoord {
                partition: self.partition,
                n: self.n,
                m,
                k: 0,
            },
        };
        Pipeline::new(&mut *self.staging, "k").run(k_tiles, &mut body)
    }

    fn store(&mut self, m: usize, acc: &mut AccumulatorBlock<E::Acc>) -> Result<()> {
        let coord = TileCoord {
            partition: self.partition,
            n: self.n,
            m,
            k: self.run.plan.k_tiles - 1,
        };
        let output = TileMut::new(MemoryTier::Global, &mut *self.output, self.run.plan.n0);
        writer::drain(&mut self.run.manager, self.run.plan, acc, output, coord)?;
        self.run.drained_tiles += 1;
        Ok(())
    }
}

struct NLoop<'r, 'a, E: Element, U> {
    run: &'r mut PartitionRun<'a, E, U>,
    output: &'r mut [E::Acc],
    partition: usize,
}

impl<E: Element, U: MatrixUnit> PipelineBody<TileWorkspace<E>> for NLoop<'_, '_, E, U> {
    fn compute(&mut self, n: usize, workspace: &mut TileWorkspace<E>) -> Result<()> {
        let m_tiles = self.run.plan.m_tiles;
        let TileWorkspace { acc, staging } = workspace;
        let mut body = MLoop {
            run: &mut *self.run,
            staging,
            output: &mut *self.output,
            partition: self.partition,
            n,
        };
        Pipeline::new(acc, "m").run(m_tiles, &mut body)
    }
}

/// Runs the full loop nest of one partition.
///
/// `output` is the partition's slice of the blocked output workspace: N
/// tiles `[p * n_tiles_per_partition, (p + 1) * n_tiles_per_partition)`.
pub fn run_partition<E: Element, U: MatrixUnit>(
    plan: &TilePlan,
    unit: &U,
    platform: &PlatformConfig,
    a_workspace: &Buffer<E>,
    b_workspace: &Buffer<E>,
    partition: usize,
    output: &mut [E::Acc],
) -> Result<KernelStats> {
    debug_assert_eq!(output.len(), plan.partition_output_len());

    let mut run = PartitionRun {
        plan,
        unit,
        a_workspace,
        b_workspace,
        manager: StageBufferManager::new(platform),
        mmad_calls: 0,
        drained_tiles: 0,
    };
    let mut workspaces = allocate_workspaces::<E>(&mut run.manager, plan)?;

    debug!(
        partition,
        first_n_tile = plan.global_n_tile(partition, 0),
        n_tiles = plan.n_tiles_per_partition,
        m_tiles = plan.m_tiles,
        k_tiles = plan.k_tiles,
        "running partition"
    );

    let mut body = NLoop {
        run: &mut run,
        output,
        partition,
    };
    Pipeline::new(&mut workspaces, "n").run(plan.n_tiles_per_partition, &mut body)?;

    Ok(KernelStats {
        partitions: 1,
        transfers: *run.manager.stats(),
        mmad_calls: run.mmad_calls,
        drained_tiles: run.drained_tiles,
        peak_staging_bytes: run.manager.peak(MemoryTier::Staging),
        peak_accumulation_bytes: run.manager.peak(MemoryTier::Accumulation),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use std::collections::HashSet;

    fn plan(config: KernelConfig, platform: PlatformConfig) -> TilePlan {
        TilePlan::new(&config, &platform).unwrap()
    }

    fn baseline() -> TilePlan {
        plan(
            KernelConfig::new(16, 64, 1024, DType::F16)
                .with_tiles(16, 64, 32)
                .with_pipeline(1, 1, 2),
            PlatformConfig::default(),
        )
    }

    #[test]
    fn baseline_tile_counts() {
        let plan = baseline();
        assert_eq!(plan.k0, 16);
        assert_eq!(plan.m_tiles, 1);
        assert_eq!(plan.n_tiles, 16);
        assert_eq!(plan.k_tiles, 2);
        assert_eq!(plan.n_tiles_per_partition, 8);
        assert_eq!(plan.partition_output_len(), 512 * 16);
        assert_eq!(plan.tile_order(1).count(), 16);
    }

    #[test]
    fn b_stage_addresses_partition_half() {
        let plan = baseline();
        let coord = TileCoord {
            partition: 1,
            n: 3,
            m: 0,
            k: 1,
        };
        let desc = plan.b_stage(coord);
        // K tile 1 starts at K block 2; global N tile 11 starts at column 704.
        assert_eq!(desc.src_row, 2 * 1024 + 11 * 64);
        assert_eq!(desc.burst_count, 2);
        assert_eq!(desc.burst_len, 64);
        assert_eq!(desc.src_gap, 1024 - 64);
    }

    #[test]
    fn a_stage_walks_k_blocks() {
        let plan = plan(
            KernelConfig::new(64, 128, 64, DType::F16).with_tiles(16, 32, 32),
            PlatformConfig::default(),
        );
        let desc = plan.a_stage(TileCoord {
            partition: 0,
            n: 0,
            m: 2,
            k: 3,
        });
        assert_eq!(desc.src_row, 3 * 2 * 64 + 2 * 16);
        assert_eq!(desc.burst_count, 2);
        assert_eq!(desc.burst_len, 16);
        assert_eq!(desc.src_gap, 48);
    }

    #[test]
    fn drains_cover_output_exactly_once() {
        let plan = plan(
            KernelConfig::new(32, 64, 256, DType::I8).with_tiles(16, 32, 32),
            PlatformConfig::default().with_partitions(4),
        );
        let len = plan.partition_output_len();
        let row_len = plan.n0;
        let mut seen = HashSet::new();
        for p in 0..plan.partitions {
            for coord in plan.tile_order(p).filter(|c| c.k == 0) {
                let d = plan.drain(coord);
                for b in 0..d.burst_count {
                    let burst = d.burst(b);
                    for row in burst.dst_row..burst.dst_row + burst.burst_len {
                        assert!((row + 1) * row_len <= len);
                        assert!(seen.insert((p, row)), "row {row} of partition {p} drained twice");
                    }
                }
            }
        }
        assert_eq!(seen.len(), plan.partitions * len / row_len);
    }

    #[test]
    fn working_set_sizes() {
        let plan = plan(
            KernelConfig::new(16, 64, 1024, DType::F16)
                .with_tiles(16, 64, 32)
                .with_pipeline(2, 1, 2),
            PlatformConfig::default(),
        );
        // A tile 2x16x16, B tile 2x64x16 halves, two K slots.
        assert_eq!(plan.staging_bytes::<half::f16>(), 2 * (512 + 2048) * 2);
        // 4x16x16 f32 block, two M slots.
        assert_eq!(plan.accumulation_bytes::<half::f16>(), 2 * 1024 * 4);
    }

    #[test]
    fn reservation_matches_plan() {
        let plan = baseline();
        let platform = PlatformConfig::default();
        let mut manager = StageBufferManager::new(&platform);
        allocate_workspaces::<half::f16>(&mut manager, &plan).unwrap();
        assert_eq!(
            manager.reserved(MemoryTier::Staging),
            plan.staging_bytes::<half::f16>()
        );
        assert_eq!(
            manager.reserved(MemoryTier::Accumulation),
            plan.accumulation_bytes::<half::f16>()
        );
    }

    #[test]
    fn oversized_working_set_is_rejected() {
        let plan = baseline();
        let platform = PlatformConfig::default().with_staging_capacity(1024);
        assert!(matches!(
            reserve_workspaces::<half::f16>(&plan, &platform),
            Err(crate::error::TilemmError::Capacity {
                tier: MemoryTier::Staging,
                ..
            })
        ));
    }

    #[test]
    fn split_stage_matches_single_transfer() {
        let plan = baseline();
        let source: Vec<i32> = (0..plan.b_workspace_shape().len() as i32).collect();
        let src = Buffer::from_vec(MemoryTier::Global, plan.b_workspace_shape(), source).unwrap();
        let coord = TileCoord {
            partition: 1,
            n: 2,
            m: 0,
            k: 1,
        };
        let desc = plan.b_stage(coord);
        let tile_shape = plan.mmad_shape().b_shape();

        let mut direct = StageBufferManager::new(&PlatformConfig::default());
        let mut one = direct.allocate::<i32>(MemoryTier::Staging, tile_shape).unwrap();
        stage_strided(&mut direct, one.view_mut(), src.view(), &desc).unwrap();
        assert_eq!(direct.stats().transfers, 1);
        assert_eq!(direct.stats().split_stages, 0);

        let narrow = PlatformConfig::default().with_max_transfer_span(16);
        let mut split = StageBufferManager::new(&narrow);
        let mut many = split.allocate::<i32>(MemoryTier::Staging, tile_shape).unwrap();
        stage_strided(&mut split, many.view_mut(), src.view(), &desc).unwrap();
        assert_eq!(split.stats().transfers, desc.burst_count);
        assert_eq!(split.stats().split_stages, 1);

        assert_eq!(one, many);
    }
}

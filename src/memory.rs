//! Memory tiers, tier-tagged buffers and the transfer engine.
//!
//! The accelerator exposes three tiers: bulk global memory, a staging tier
//! next to the compute unit, and an accumulation tier holding partial sums.
//! Every buffer is a blocked 3D array `(outer, rows, inner)` and the unit of
//! data movement is a *row* of `inner` contiguous elements. All tier-to-tier
//! moves go through [`StageBufferManager::transfer`].

use std::fmt;
use std::mem::size_of;

use num::traits::Zero;
use tracing::trace;

use crate::config::PlatformConfig;
use crate::error::{transfer_error, Result, TilemmError};

/// A level of the accelerator's memory hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryTier {
    Global,
    Staging,
    Accumulation,
}

impl MemoryTier {
    const fn index(self) -> usize {
        match self {
            MemoryTier::Global => 0,
            MemoryTier::Staging => 1,
            MemoryTier::Accumulation => 2,
        }
    }

    /// Whether the transfer engine can move data from `self` into `dst`.
    pub fn can_move_to(self, dst: MemoryTier) -> bool {
        matches!(
            (self, dst),
            (MemoryTier::Global, MemoryTier::Staging)
                | (MemoryTier::Staging, MemoryTier::Global)
                | (MemoryTier::Accumulation, MemoryTier::Global)
        )
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryTier::Global => "global",
            MemoryTier::Staging => "staging",
            MemoryTier::Accumulation => "accumulation",
        };
        f.write_str(name)
    }
}

/// Shape of a blocked buffer: `outer` blocks of `rows` rows of `inner` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    pub outer: usize,
    pub rows: usize,
    pub inner: usize,
}

impl BlockShape {
    pub const fn new(outer: usize, rows: usize, inner: usize) -> Self {
        Self { outer, rows, inner }
    }

    /// Total number of elements.
    pub const fn len(&self) -> usize {
        self.outer * self.rows * self.inner
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `inner`-wide rows across all outer blocks.
    pub const fn total_rows(&self) -> usize {
        self.outer * self.rows
    }

    /// Flat index of element `[outer][row][inner]`.
    #[inline(always)]
    pub const fn index(&self, outer: usize, row: usize, inner: usize) -> usize {
        (outer * self.rows + row) * self.inner + inner
    }
}

/// A tier-tagged, owned blocked buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer<T> {
    tier: MemoryTier,
    shape: BlockShape,
    data: Vec<T>,
}

impl<T: Copy + Zero> Buffer<T> {
    /// Allocates a zero-filled buffer without reserving tier capacity.
    ///
    /// Staging and accumulation buffers should come from
    /// [`StageBufferManager::allocate`] instead.
    pub fn zeroed(tier: MemoryTier, shape: BlockShape) -> Self {
        Self {
            tier,
            shape,
            data: vec![T::zero(); shape.len()],
        }
    }
}

impl<T> Buffer<T> {
    /// Wraps existing data, checking that it matches `shape`.
    pub fn from_vec(tier: MemoryTier, shape: BlockShape, data: Vec<T>) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(transfer_error(format!(
                "buffer data holds {} elements but shape {:?} needs {}",
                data.len(),
                shape,
                shape.len()
            )));
        }
        Ok(Self { tier, shape, data })
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Read-only transfer endpoint over the whole buffer.
    pub fn view(&self) -> Tile<'_, T> {
        Tile {
            tier: self.tier,
            data: &self.data,
            row_len: self.shape.inner,
        }
    }

    /// Writable transfer endpoint over the whole buffer.
    pub fn view_mut(&mut self) -> TileMut<'_, T> {
        TileMut {
            tier: self.tier,
            data: &mut self.data,
            row_len: self.shape.inner,
        }
    }
}

/// Borrowed source of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct Tile<'a, T> {
    pub tier: MemoryTier,
    pub data: &'a [T],
    pub row_len: usize,
}

/// Borrowed destination of a transfer.
#[derive(Debug)]
pub struct TileMut<'a, T> {
    pub tier: MemoryTier,
    pub data: &'a mut [T],
    pub row_len: usize,
}

impl<'a, T> TileMut<'a, T> {
    pub fn new(tier: MemoryTier, data: &'a mut [T], row_len: usize) -> Self {
        Self {
            tier,
            data,
            row_len,
        }
    }

    /// Reborrows this endpoint for one transfer.
    pub fn reborrow(&mut self) -> TileMut<'_, T> {
        TileMut {
            tier: self.tier,
            data: &mut *self.data,
            row_len: self.row_len,
        }
    }
}

/// Strided copy descriptor, all quantities in rows.
///
/// Copies `burst_count` bursts of `burst_len` contiguous rows. After each
/// burst the source skips `src_gap` rows and the destination `dst_gap` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub src_row: usize,
    pub dst_row: usize,
    pub burst_count: usize,
    pub burst_len: usize,
    pub src_gap: usize,
    pub dst_gap: usize,
}

impl TransferDescriptor {
    /// Largest gap the descriptor asks the engine to skip.
    pub fn max_gap(&self) -> usize {
        if self.burst_count > 1 {
            self.src_gap.max(self.dst_gap)
        } else {
            0
        }
    }

    /// Single-burst descriptor covering burst `index` of `self`.
    pub fn burst(&self, index: usize) -> Self {
        Self {
            src_row: self.src_row + index * (self.burst_len + self.src_gap),
            dst_row: self.dst_row + index * (self.burst_len + self.dst_gap),
            burst_count: 1,
            burst_len: self.burst_len,
            src_gap: 0,
            dst_gap: 0,
        }
    }

    fn end_rows(&self) -> (usize, usize) {
        if self.burst_count == 0 {
            return (self.src_row, self.dst_row);
        }
        let last = self.burst(self.burst_count - 1);
        (last.src_row + self.burst_len, last.dst_row + self.burst_len)
    }
}

/// Counters describing the data movement of one partition or kernel run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Transfer operations issued to the engine.
    pub transfers: usize,
    /// Bursts across all transfers.
    pub bursts: usize,
    /// Rows moved.
    pub rows: usize,
    /// Bytes moved.
    pub bytes: usize,
    /// Stages that were split into one transfer per burst.
    pub split_stages: usize,
}

impl TransferStats {
    pub fn merge(&mut self, other: &TransferStats) {
        self.transfers += other.transfers;
        self.bursts += other.bursts;
        self.rows += other.rows;
        self.bytes += other.bytes;
        self.split_stages += other.split_stages;
    }
}

/// Owns tier capacity for one compute unit and executes its transfers.
#[derive(Debug)]
pub struct StageBufferManager {
    max_transfer_span: usize,
    capacity: [usize; 3],
    reserved: [usize; 3],
    peak: [usize; 3],
    stats: TransferStats,
}

impl StageBufferManager {
    pub fn new(platform: &PlatformConfig) -> Self {
        Self {
            max_transfer_span: platform.max_transfer_span,
            capacity: [
                usize::MAX,
                platform.staging_capacity,
                platform.accumulation_capacity,
            ],
            reserved: [0; 3],
            peak: [0; 3],
            stats: TransferStats::default(),
        }
    }

    pub fn max_transfer_span(&self) -> usize {
        self.max_transfer_span
    }

    /// Bytes currently reserved in `tier`.
    pub fn reserved(&self, tier: MemoryTier) -> usize {
        self.reserved[tier.index()]
    }

    /// Highest reservation seen in `tier`.
    pub fn peak(&self, tier: MemoryTier) -> usize {
        self.peak[tier.index()]
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub(crate) fn record_split_stage(&mut self) {
        self.stats.split_stages += 1;
    }

    /// Reserves room for a zero-filled buffer in `tier`.
    ///
    /// Reservations are static: they last for the lifetime of the manager,
    /// which is one partition's run.
    pub fn allocate<T: Copy + Zero>(
        &mut self,
        tier: MemoryTier,
        shape: BlockShape,
    ) -> Result<Buffer<T>> {
        let idx = tier.index();
        let requested = shape.len() * size_of::<T>();
        let reserved = self.reserved[idx];
        let capacity = self.capacity[idx];

        if requested > capacity.saturating_sub(reserved) {
            return Err(TilemmError::Capacity {
                tier,
                requested,
                reserved,
                capacity,
            });
        }

        self.reserved[idx] += requested;
        self.peak[idx] = self.peak[idx].max(self.reserved[idx]);
        Ok(Buffer::zeroed(tier, shape))
    }

    /// Issues one strided transfer from `src` into `dst`.
    pub fn transfer<T: Copy>(
        &mut self,
        dst: TileMut<'_, T>,
        src: Tile<'_, T>,
        desc: &TransferDescriptor,
    ) -> Result<()> {
        if !src.tier.can_move_to(dst.tier) {
            return Err(transfer_error(format!(
                "no route from {} to {} memory",
                src.tier, dst.tier
            )));
        }
        if src.row_len != dst.row_len || src.row_len == 0 {
            return Err(transfer_error(format!(
                "row width mismatch: source rows hold {} elements, destination rows hold {}",
                src.row_len, dst.row_len
            )));
        }

        let gap = desc.max_gap();
        if gap > self.max_transfer_span {
            return Err(TilemmError::TransferSpan {
                gap,
                limit: self.max_transfer_span,
            });
        }

        let row_len = src.row_len;
        let (src_end, dst_end) = desc.end_rows();
        if src_end * row_len > src.data.len() || dst_end * row_len > dst.data.len() {
            return Err(transfer_error(format!(
                "{:?} reaches rows {}/{} but the buffers hold {}/{} rows",
                desc,
                src_end,
                dst_end,
                src.data.len() / row_len,
                dst.data.len() / row_len
            )));
        }

        let burst_elems = desc.burst_len * row_len;
        for b in 0..desc.burst_count {
            let burst = desc.burst(b);
            let s = burst.src_row * row_len;
            let d = burst.dst_row * row_len;
            dst.data[d..d + burst_elems].copy_from_slice(&src.data[s..s + burst_elems]);
        }

        let rows = desc.burst_count * desc.burst_len;
        self.stats.transfers += 1;
        self.stats.bursts += desc.burst_count;
        self.stats.rows += rows;
        self.stats.bytes += rows * row_len * size_of::<T>();

        trace!(
            src = %src.tier,
            dst = %dst.tier,
            src_row = desc.src_row,
            dst_row = desc.dst_row,
            bursts = desc.burst_count,
            burst_len = desc.burst_len,
            "transfer"
        );
        Ok(())
    }
}

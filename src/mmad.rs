//! Blocked multiply-accumulate on the compute unit.
//!
//! The primitive itself is supplied by the platform through [`MatrixUnit`];
//! [`ScalarUnit`] is a portable reference implementation. This module also
//! owns the accumulation blocks and the state machine each output tile goes
//! through: `Empty -> Initializing -> Accumulating -> Drained`.

use std::collections::HashSet;
use std::fmt;

use crate::dtype::{Accumulator, Element};
use crate::error::{tile_state_error, Result};
use crate::memory::{BlockShape, Buffer, MemoryTier, StageBufferManager};
use crate::schedule::TileCoord;

/// Dimensions of one multiply-accumulate call.
///
/// Operand tiles are `(k / k0, m, k0)` for A and `(k / k0, n, k0)` for B; the
/// accumulation block is `(n / n0, m, n0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmadShape {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub k0: usize,
    pub n0: usize,
}

impl MmadShape {
    pub fn a_shape(&self) -> BlockShape {
        BlockShape::new(self.k / self.k0, self.m, self.k0)
    }

    pub fn b_shape(&self) -> BlockShape {
        BlockShape::new(self.k / self.k0, self.n, self.k0)
    }

    pub fn acc_shape(&self) -> BlockShape {
        BlockShape::new(self.n / self.n0, self.m, self.n0)
    }
}

/// The compute unit's matrix multiply-accumulate instruction.
pub trait MatrixUnit: Send + Sync {
    /// Computes `acc (=|+=) a x b` on blocked tiles.
    ///
    /// With `initialize` set the block is overwritten, otherwise the product
    /// is added to what it already holds.
    fn mmad<E: Element>(
        &self,
        acc: &mut [E::Acc],
        a: &[E],
        b: &[E],
        shape: &MmadShape,
        initialize: bool,
    );
}

/// Straightforward scalar implementation of [`MatrixUnit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarUnit;

impl MatrixUnit for ScalarUnit {
    fn mmad<E: Element>(
        &self,
        acc: &mut [E::Acc],
        a: &[E],
        b: &[E],
        shape: &MmadShape,
        initialize: bool,
    ) {
        let a_shape = shape.a_shape();
        let b_shape = shape.b_shape();
        let acc_shape = shape.acc_shape();
        debug_assert_eq!(a.len(), a_shape.len());
        debug_assert_eq!(b.len(), b_shape.len());
        debug_assert_eq!(acc.len(), acc_shape.len());

        if initialize {
            acc.fill(<E::Acc as num::Zero>::zero());
        }

        let k0 = shape.k0;
        for k1 in 0..shape.k / k0 {
            for m in 0..shape.m {
                let a_start = a_shape.index(k1, m, 0);
                let a_row = &a[a_start..a_start + k0];
                for n in 0..shape.n {
                    let b_start = b_shape.index(k1, n, 0);
                    let b_row = &b[b_start..b_start + k0];

                    let mut sum = <E::Acc as num::Zero>::zero();
                    for (&x, &y) in a_row.iter().zip(b_row) {
                        let product = <E::Acc as From<E>>::from(x)
                            .acc_mul(<E::Acc as From<E>>::from(y));
                        sum = sum.acc_add(product);
                    }
                    let idx = acc_shape.index(n / shape.n0, m, n % shape.n0);
                    acc[idx] = acc[idx].acc_add(sum);
                }
            }
        }
    }
}

/// Lifecycle of one output tile in an accumulation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Empty,
    Initializing,
    Accumulating,
    Drained,
}

impl fmt::Display for TileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An accumulation-tier block plus the bookkeeping for the tile it holds.
#[derive(Debug)]
pub struct AccumulatorBlock<A> {
    buffer: Buffer<A>,
    state: TileState,
    tile: Option<TileCoord>,
    k_steps: usize,
    /// Output tiles this block has already drained.
    drained: HashSet<(usize, usize, usize)>,
}

impl<A: Accumulator> AccumulatorBlock<A> {
    /// Reserves an accumulation block of `shape` in the accumulation tier.
    pub fn allocate(manager: &mut StageBufferManager, shape: BlockShape) -> Result<Self> {
        let buffer = manager.allocate(MemoryTier::Accumulation, shape)?;
        Ok(Self {
            buffer,
            state: TileState::Empty,
            tile: None,
            k_steps: 0,
            drained: HashSet::new(),
        })
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn tile(&self) -> Option<TileCoord> {
        self.tile
    }

    /// Completed K steps of the current tile.
    pub fn k_steps(&self) -> usize {
        self.k_steps
    }

    pub fn buffer(&self) -> &Buffer<A> {
        &self.buffer
    }

    /// Moves to the next K step of `coord`, returning whether it initializes.
    fn advance(&mut self, coord: TileCoord) -> Result<bool> {
        let same_tile = self.tile.map(|t| t.output_tile()) == Some(coord.output_tile());

        match self.state {
            TileState::Empty | TileState::Drained => {
                if coord.k != 0 {
                    return Err(tile_state_error(format!(
                        "tile {coord} must start at K step 0 from the {} state",
                        self.state
                    )));
                }
                if self.drained.contains(&coord.output_tile()) {
                    return Err(tile_state_error(format!(
                        "tile {coord} was already drained"
                    )));
                }
                self.tile = Some(coord);
                self.k_steps = 1;
                self.state = TileState::Initializing;
                Ok(true)
            }
            TileState::Initializing | TileState::Accumulating => {
                if !same_tile {
                    return Err(tile_state_error(format!(
                        "tile {coord} entered a block still holding {:?}",
                        self.tile
                    )));
                }
                if coord.k != self.k_steps {
                    return Err(tile_state_error(format!(
                        "tile {coord} expected K step {}",
                        self.k_steps
                    )));
                }
                self.tile = Some(coord);
                self.k_steps += 1;
                self.state = TileState::Accumulating;
                Ok(false)
            }
        }
    }

    /// Marks the block drained once all `k_total` steps are done.
    pub(crate) fn begin_drain(&mut self, k_total: usize) -> Result<&Buffer<A>> {
        match self.state {
            TileState::Initializing | TileState::Accumulating if self.k_steps == k_total => {
                self.state = TileState::Drained;
                if let Some(tile) = self.tile {
                    self.drained.insert(tile.output_tile());
                }
                Ok(&self.buffer)
            }
            state => Err(tile_state_error(format!(
                "cannot drain {:?} in the {state} state after {} of {k_total} K steps",
                self.tile, self.k_steps
            ))),
        }
    }
}

/// Runs one K step of `coord` into `block`.
///
/// K step 0 initializes the block, every later step accumulates into it.
pub fn accumulate<E: Element, U: MatrixUnit>(
    unit: &U,
    block: &mut AccumulatorBlock<E::Acc>,
    a: &Buffer<E>,
    b: &Buffer<E>,
    shape: &MmadShape,
    coord: TileCoord,
) -> Result<()> {
    let initialize = block.advance(coord)?;
    unit.mmad::<E>(
        block.buffer.as_mut_slice(),
        a.as_slice(),
        b.as_slice(),
        shape,
        initialize,
    );
    Ok(())
}

//! Multi-buffered loop driver.
//!
//! A loop with pipelining degree `N` owns a [`Ring`] of `N` slots. Iteration
//! `i` lives in slot `i % N` from the moment its data is loaded until its
//! result is stored. The driver issues loads up to `N - 1` iterations ahead
//! of the compute step, so the data movement for upcoming tiles is in flight
//! while the current tile is computed.
//!
//! Dependencies honoured by [`Pipeline::run`]:
//! - `compute(i)` is issued after `load(i)`;
//! - `load(j)` is issued after `store(j - N)`, the previous owner of its slot;
//! - `store(i)` is issued after `compute(i)`, and stores retire in order.

use tracing::trace;

use crate::error::{Result, TilemmError};

/// Fixed set of rotating buffer slots.
#[derive(Debug)]
pub struct Ring<S> {
    slots: Vec<S>,
}

impl<S> Ring<S> {
    pub fn new(slots: Vec<S>) -> Result<Self> {
        if slots.is_empty() {
            return Err(TilemmError::EmptyDimension {
                dimension: "ring slots",
            });
        }
        Ok(Self { slots })
    }

    /// Builds a ring of `degree` slots, stopping at the first failure.
    pub fn try_from_fn<F>(degree: usize, mut make: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<S>,
    {
        let slots = (0..degree.max(1))
            .map(&mut make)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots })
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Slot index used by `iteration`.
    #[inline(always)]
    pub fn slot_index(&self, iteration: usize) -> usize {
        iteration % self.slots.len()
    }

    pub fn slot_mut(&mut self, iteration: usize) -> &mut S {
        let idx = self.slot_index(iteration);
        &mut self.slots[idx]
    }

    pub fn slots(&self) -> &[S] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [S] {
        &mut self.slots
    }
}

/// The three phases of one pipelined loop iteration.
pub trait PipelineBody<S> {
    /// Moves the inputs of `iteration` into `slot`.
    fn load(&mut self, _iteration: usize, _slot: &mut S) -> Result<()> {
        Ok(())
    }

    /// Runs the work of `iteration` on the data held in `slot`.
    fn compute(&mut self, iteration: usize, slot: &mut S) -> Result<()>;

    /// Moves the results of `iteration` out of `slot`.
    fn store(&mut self, _iteration: usize, _slot: &mut S) -> Result<()> {
        Ok(())
    }
}

/// Drives a [`PipelineBody`] over a [`Ring`].
pub struct Pipeline<'r, S> {
    ring: &'r mut Ring<S>,
    label: &'static str,
}

impl<'r, S> Pipeline<'r, S> {
    pub fn new(ring: &'r mut Ring<S>, label: &'static str) -> Self {
        Self { ring, label }
    }

    /// Runs `iterations` iterations of `body`.
    pub fn run<B: PipelineBody<S>>(&mut self, iterations: usize, body: &mut B) -> Result<()> {
        let depth = self.ring.depth();
        let mut loaded = 0;
        let mut stored = 0;

        for i in 0..iterations {
            while loaded < iterations && loaded < i + depth {
                if loaded - stored == depth {
                    self.store(stored, body)?;
                    stored += 1;
                }
                trace!(pipeline = self.label, iteration = loaded, "load");
                body.load(loaded, self.ring.slot_mut(loaded))?;
                loaded += 1;
            }

            trace!(pipeline = self.label, iteration = i, "compute");
            body.compute(i, self.ring.slot_mut(i))?;
        }

        while stored < iterations {
            self.store(stored, body)?;
            stored += 1;
        }
        Ok(())
    }

    fn store<B: PipelineBody<S>>(&mut self, iteration: usize, body: &mut B) -> Result<()> {
        trace!(pipeline = self.label, iteration, "store");
        body.store(iteration, self.ring.slot_mut(iteration))
    }
}

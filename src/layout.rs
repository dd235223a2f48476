//! Conversions between row-major matrices and the blocked operand layout.
//!
//! The compute unit reads operands as `(outer, rows, inner)` blocks where
//! `inner` is the block factor. For a row-major `R x C` matrix:
//!
//! ```text
//! blocked[c1][r][c0] = matrix[r][c1 * bf + c0]      (to_blocked / to_row_major)
//! ```
//!
//! Operand A (`M x K`) uses this form directly, giving `(K/K0, M, K0)`. Operand
//! B (`K x N`) is blocked along its rows instead, giving `(K/K0, N, K0)` with
//!
//! ```text
//! blocked[k1][n][k0] = matrix[k1 * K0 + k0][n]
//! ```
//!
//! which needs an explicit transpose of every `K0 x K0` square of each slab.
//! The blocked result `(N/16, M, 16)` is turned back into `M x N` by
//! [`to_row_major`].
//!
//! Every transform is a pure reshuffle: element values and counts are kept and
//! the output buffer is only returned once it is complete.

use ndarray::{s, Array2, ArrayView2};
use num::traits::Zero;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};

use crate::error::{ensure_divisible, Result, TilemmError};
use crate::memory::{BlockShape, Buffer, MemoryTier};

fn check_block_factor(block_factor: usize) -> Result<()> {
    if block_factor == 0 {
        return Err(TilemmError::EmptyDimension {
            dimension: "block factor",
        });
    }
    Ok(())
}

/// Groups the columns of `matrix` into blocks of `block_factor` elements.
///
/// Returns a global-tier buffer of shape `(cols / bf, rows, bf)`.
pub fn to_blocked<T>(matrix: ArrayView2<'_, T>, block_factor: usize) -> Result<Buffer<T>>
where
    T: Copy + Zero + Send + Sync,
{
    check_block_factor(block_factor)?;
    let (rows, cols) = matrix.dim();
    ensure_divisible("columns", cols, "block factor", block_factor)?;

    let shape = BlockShape::new(cols / block_factor, rows, block_factor);
    let mut blocked = Buffer::zeroed(MemoryTier::Global, shape);

    if !shape.is_empty() {
        blocked
            .as_mut_slice()
            .par_chunks_mut(rows * block_factor)
            .enumerate()
            .for_each(|(c1, block)| {
                let columns = matrix.slice(s![.., c1 * block_factor..(c1 + 1) * block_factor]);
                for (dst, &value) in block.iter_mut().zip(columns.iter()) {
                    *dst = value;
                }
            });
    }

    Ok(blocked)
}

/// Reassembles a row-major matrix from a buffer produced by [`to_blocked`].
///
/// Also used to turn the blocked matmul result back into `M x N`.
pub fn to_row_major<T>(blocked: &Buffer<T>, block_factor: usize) -> Result<Array2<T>>
where
    T: Copy,
{
    check_block_factor(block_factor)?;
    let shape = blocked.shape();
    if shape.inner != block_factor {
        return Err(TilemmError::NotDivisible {
            dimension: "blocked inner dimension",
            value: shape.inner,
            divisor_name: "block factor",
            divisor: block_factor,
        });
    }

    let data = blocked.as_slice();
    let cols = shape.outer * block_factor;
    Ok(Array2::from_shape_fn((shape.rows, cols), |(r, c)| {
        data[shape.index(c / block_factor, r, c % block_factor)]
    }))
}

/// Blocks operand B along its rows: `(K x N)` becomes `(K/bf, N, bf)`.
///
/// Each `bf x N` slab of rows is gathered and then transposed square by
/// square into `N x bf`.
pub fn to_blocked_b<T>(matrix: ArrayView2<'_, T>, block_factor: usize) -> Result<Buffer<T>>
where
    T: Copy + Zero + Send + Sync,
{
    check_block_factor(block_factor)?;
    let (rows, cols) = matrix.dim();
    ensure_divisible("rows", rows, "block factor", block_factor)?;
    ensure_divisible("columns", cols, "block factor", block_factor)?;

    let shape = BlockShape::new(rows / block_factor, cols, block_factor);
    let mut blocked = Buffer::zeroed(MemoryTier::Global, shape);

    if !shape.is_empty() {
        blocked
            .as_mut_slice()
            .par_chunks_mut(cols * block_factor)
            .enumerate()
            .for_each(|(k1, block)| {
                let slab: Vec<T> = matrix
                    .slice(s![k1 * block_factor..(k1 + 1) * block_factor, ..])
                    .iter()
                    .copied()
                    .collect();
                transpose_scatter(&slab, block, block_factor, cols);
            });
    }

    Ok(blocked)
}

/// Inverse of [`to_blocked_b`].
pub fn from_blocked_b<T>(blocked: &Buffer<T>, block_factor: usize) -> Result<Array2<T>>
where
    T: Copy,
{
    check_block_factor(block_factor)?;
    let shape = blocked.shape();
    if shape.inner != block_factor {
        return Err(TilemmError::NotDivisible {
            dimension: "blocked inner dimension",
            value: shape.inner,
            divisor_name: "block factor",
            divisor: block_factor,
        });
    }

    let data = blocked.as_slice();
    let rows = shape.outer * block_factor;
    Ok(Array2::from_shape_fn((rows, shape.rows), |(k, n)| {
        data[shape.index(k / block_factor, n, k % block_factor)]
    }))
}

/// Transposes a row-major `bf x n` slab into a row-major `n x bf` block.
///
/// Works on `bf x bf` squares, `n / bf` repeats per slab.
pub(crate) fn transpose_scatter<T: Copy>(src: &[T], dst: &mut [T], bf: usize, n: usize) {
    debug_assert_eq!(src.len(), bf * n);
    debug_assert_eq!(dst.len(), bf * n);
    debug_assert_eq!(n % bf, 0);

    for rep in 0..n / bf {
        let base = rep * bf;
        for i in 0..bf {
            let src_row = &src[i * n + base..i * n + base + bf];
            for (j, &value) in src_row.iter().enumerate() {
                dst[(base + j) * bf + i] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn iota(rows: usize, cols: usize) -> Array2<i32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| (r * cols + c) as i32)
    }

    #[test]
    fn blocked_a_groups_columns() {
        let m = iota(2, 4);
        let blocked = to_blocked(m.view(), 2).unwrap();
        assert_eq!(blocked.shape(), BlockShape::new(2, 2, 2));
        // Block 0 holds columns 0..2, block 1 columns 2..4.
        assert_eq!(blocked.as_slice(), &[0, 1, 4, 5, 2, 3, 6, 7]);
        assert_eq!(blocked.tier(), MemoryTier::Global);
    }

    #[test]
    fn blocked_a_roundtrip() {
        let m = iota(5, 12);
        let blocked = to_blocked(m.view(), 4).unwrap();
        assert_eq!(to_row_major(&blocked, 4).unwrap(), m);
    }

    #[test]
    fn blocked_b_transposes_slabs() {
        // K = 2, N = 4, K0 = 2.
        let b = iota(2, 4);
        let blocked = to_blocked_b(b.view(), 2).unwrap();
        assert_eq!(blocked.shape(), BlockShape::new(1, 4, 2));
        // blocked[0][n][k0] = b[k0][n]
        assert_eq!(blocked.as_slice(), &[0, 4, 1, 5, 2, 6, 3, 7]);
        assert_eq!(from_blocked_b(&blocked, 2).unwrap(), b);
    }

    #[test]
    fn blocked_b_equals_blocked_transpose() {
        let b = iota(8, 12);
        let via_b = to_blocked_b(b.view(), 4).unwrap();
        let via_t = to_blocked(b.t(), 4).unwrap();
        assert_eq!(via_b, via_t);
    }

    #[test]
    fn non_standard_layout_input() {
        let m = iota(6, 4);
        let t = m.t();
        let blocked = to_blocked(t, 2).unwrap();
        assert_eq!(to_row_major(&blocked, 2).unwrap(), t.to_owned());
    }

    #[test]
    fn rejects_indivisible_columns() {
        let m = iota(4, 6);
        assert!(matches!(
            to_blocked(m.view(), 4),
            Err(TilemmError::NotDivisible { value: 6, divisor: 4, .. })
        ));
        assert!(to_blocked_b(m.view(), 4).is_err());
        assert!(to_blocked(m.view(), 0).is_err());
    }

    #[test]
    fn row_major_rejects_wrong_factor() {
        let blocked = to_blocked(iota(2, 8).view(), 4).unwrap();
        assert!(to_row_major(&blocked, 8).is_err());
    }

    #[test]
    fn transpose_scatter_squares() {
        let src: Vec<i32> = (0..8).collect(); // 2 x 4
        let mut dst = vec![0; 8];
        transpose_scatter(&src, &mut dst, 2, 4);
        assert_eq!(dst, vec![0, 4, 1, 5, 2, 6, 3, 7]);
    }
}

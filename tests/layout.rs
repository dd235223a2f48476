use ndarray::Array2;
use proptest::prelude::*;
use tilemm::layout::{from_blocked_b, to_blocked, to_blocked_b, to_row_major};

fn matrix(rows: usize, cols: usize, seed: i32) -> Array2<i32> {
    Array2::from_shape_fn((rows, cols), |(r, c)| seed.wrapping_mul(31) ^ (r * cols + c) as i32)
}

proptest! {
    #[test]
    fn prop_blocked_a_roundtrip(
        rows in 1usize..24,
        blocks in 1usize..5,
        bf in 1usize..9,
        seed in any::<i32>(),
    ) {
        let m = matrix(rows, blocks * bf, seed);
        let blocked = to_blocked(m.view(), bf).unwrap();
        prop_assert_eq!(blocked.shape().outer, blocks);
        prop_assert_eq!(blocked.as_slice().len(), m.len());
        prop_assert_eq!(to_row_major(&blocked, bf).unwrap(), m);
    }

    #[test]
    fn prop_blocked_b_roundtrip(
        k_blocks in 1usize..4,
        n_blocks in 1usize..5,
        bf in 1usize..9,
        seed in any::<i32>(),
    ) {
        let b = matrix(k_blocks * bf, n_blocks * bf, seed);
        let blocked = to_blocked_b(b.view(), bf).unwrap();
        prop_assert_eq!(from_blocked_b(&blocked, bf).unwrap(), b.clone());
        // The B layout is the A layout of the transpose.
        prop_assert_eq!(blocked, to_blocked(b.t(), bf).unwrap());
    }

    #[test]
    fn prop_blocking_preserves_multiset(
        rows in 1usize..12,
        cols_blocks in 1usize..4,
        seed in any::<i32>(),
    ) {
        let m = matrix(rows, cols_blocks * 16, seed);
        let mut before: Vec<i32> = m.iter().copied().collect();
        let mut after = to_blocked(m.view(), 16).unwrap().into_vec();
        before.sort_unstable();
        after.sort_unstable();
        prop_assert_eq!(before, after);
    }
}

#[test]
fn test_indivisible_layout_is_rejected() {
    let m = matrix(4, 20, 1);
    assert!(to_blocked(m.view(), 16).is_err());
    assert!(to_blocked_b(m.view(), 4).is_ok());
    assert!(to_blocked_b(matrix(6, 8, 1).view(), 4).is_err());
}

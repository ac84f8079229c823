//! Property tests for geometry, dropout thresholds and generator offsets.

use fmha::ops::geometry::{self, BLOCK_SPARSE_KEY_TILE, Direction, QUERY_TILE};
use fmha::ops::params::keep_thresholds;
use fmha::ops::rng;
use fmha::{ComputeCapability, PhiloxGenerator, RandomGenerator};
use proptest::prelude::*;

fn capability() -> impl Strategy<Value = ComputeCapability> {
    prop_oneof![
        Just(ComputeCapability::SM75),
        Just(ComputeCapability::SM80),
        Just(ComputeCapability::SM86),
        Just(ComputeCapability::SM90),
    ]
}

fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Forward), Just(Direction::Backward)]
}

fn head_dim() -> impl Strategy<Value = usize> {
    (1usize..=16).prop_map(|n| n * 8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_padded_k_is_minimal_tile_multiple(
        max_q in 1usize..4096,
        max_k in 1usize..8192,
        d in head_dim(),
        cap in capability(),
        dir in direction(),
    ) {
        let g = geometry::resolve(max_q, max_k, d, cap, dir);
        prop_assert!(g.padded_k >= max_k);
        prop_assert_eq!(g.padded_k % g.key_tile.min(128), 0);
        if max_k > 256 {
            prop_assert_eq!(g.padded_k % g.key_tile, 0);
            prop_assert!(g.padded_k - max_k < g.key_tile);
        } else {
            prop_assert!(g.padded_k == 128 || g.padded_k == 256);
            prop_assert_eq!(g.padded_k == 128, max_k <= 128);
        }
        prop_assert_eq!(g.needs_split_accumulation, g.padded_k > g.key_tile);
    }

    #[test]
    fn prop_padded_q_is_minimal(
        max_q in 1usize..4096,
        d in head_dim(),
        cap in capability(),
        dir in direction(),
    ) {
        let g = geometry::resolve(max_q, 64, d, cap, dir);
        prop_assert_eq!(g.padded_q % QUERY_TILE, 0);
        prop_assert!(g.padded_q >= max_q);
        prop_assert!(g.padded_q - max_q < QUERY_TILE);
    }

    #[test]
    fn prop_resolve_is_pure(
        max_q in 1usize..2048,
        max_k in 1usize..2048,
        d in head_dim(),
        cap in capability(),
        dir in direction(),
    ) {
        prop_assert_eq!(
            geometry::resolve(max_q, max_k, d, cap, dir),
            geometry::resolve(max_q, max_k, d, cap, dir)
        );
    }

    #[test]
    fn prop_block_sparse_geometry(max_q in 1usize..4096, max_k in 1usize..8192) {
        let g = geometry::resolve_block_sparse(max_q, max_k);
        prop_assert_eq!(g.key_tile, BLOCK_SPARSE_KEY_TILE);
        prop_assert!(g.padded_k >= max_k.max(BLOCK_SPARSE_KEY_TILE));
        prop_assert!(g.padded_k - max_k < BLOCK_SPARSE_KEY_TILE);
        let [rows, cols] = g.block_mask_shape();
        prop_assert_eq!(rows * BLOCK_SPARSE_KEY_TILE, g.padded_k);
        prop_assert_eq!(cols * QUERY_TILE, g.padded_q);
        prop_assert_eq!(g.needs_split_accumulation, rows > 1);
    }

    #[test]
    fn prop_keep_thresholds_are_monotone(a in 0.0f32..=1.0, b in 0.0f32..=1.0) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let (lo32, lo16) = keep_thresholds(lo);
        let (hi32, hi16) = keep_thresholds(hi);
        prop_assert!(lo32 <= hi32);
        prop_assert!(lo16 <= hi16);
        // floored: never keeps more often than asked
        prop_assert!(f64::from(hi32) <= f64::from(hi) * f64::from(u32::MAX));
    }

    #[test]
    fn prop_generator_offsets_never_overlap(
        increments in prop::collection::vec(0u64..1000, 1..20),
    ) {
        let generator = PhiloxGenerator::new(1);
        let mut expected = 0u64;
        for inc in increments {
            let state = generator.philox_state(inc).unwrap();
            prop_assert_eq!(state.offset, expected);
            prop_assert_eq!(state.offset % 4, 0);
            expected += inc.div_ceil(4) * 4;
        }
    }

    #[test]
    fn prop_forward_and_backward_consume_the_same_offset(
        b in 1usize..64,
        h in 1usize..64,
        per_head in 1u64..128,
    ) {
        let fwd = PhiloxGenerator::new(9);
        let bwd = PhiloxGenerator::new(9);
        let offset = rng::dense_counter_offset(b, h, per_head);
        let s1 = rng::acquire(&fwd, true, offset).unwrap();
        let s2 = rng::acquire(&bwd, true, offset).unwrap();
        prop_assert_eq!(s1, s2);
        prop_assert_eq!(fwd.snapshot().unwrap(), bwd.snapshot().unwrap());
        prop_assert!(rng::acquire(&fwd, false, offset).unwrap().is_none());
    }
}

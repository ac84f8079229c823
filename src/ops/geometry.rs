//! Batch geometry: padded sequence lengths and the split-accumulation decision
//!
//! The kernels are compiled for a small fixed set of key-tile sizes. Given the
//! caller's (not necessarily tight) maximum sequence lengths, this module
//! derives the padded lengths every buffer and record is sized from.

use crate::device::ComputeCapability;

/// Query lengths are padded to this many rows.
pub const QUERY_TILE: usize = 16;

/// Key tile of the block-sparse kernels; also the key granularity of the block mask.
pub const BLOCK_SPARSE_KEY_TILE: usize = 256;

const NARROW_KEY_TILE: usize = 128;
const WIDE_KEY_TILE: usize = 256;

/// Pass of the fused computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

/// Derived tiling geometry for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Key tile processed per inner iteration
    pub key_tile: usize,
    /// Maximum key length rounded to the kernel specialization
    pub padded_k: usize,
    /// Maximum query length rounded up to [`QUERY_TILE`]
    pub padded_q: usize,
    /// Keys span more than one tile, so per-row accumulators must live in a
    /// global f32 scratch buffer between tiles
    pub needs_split_accumulation: bool,
}

impl Geometry {
    /// Shape a block-sparse mask must have: `(padded_k / 256, padded_q / 16)`.
    pub fn block_mask_shape(&self) -> [usize; 2] {
        [
            self.padded_k / BLOCK_SPARSE_KEY_TILE,
            self.padded_q / QUERY_TILE,
        ]
    }
}

/// Key tile for the dense/causal kernels.
///
/// Wide heads (> 64) use 128-wide key tiles. The sm75 backward kernels only
/// fit 256-wide tiles for heads up to 32.
pub fn key_tile(head_dim: usize, capability: ComputeCapability, direction: Direction) -> usize {
    let narrow = match direction {
        Direction::Forward => head_dim > 64,
        Direction::Backward => head_dim > 64 || (capability.is_sm75() && head_dim > 32),
    };
    if narrow { NARROW_KEY_TILE } else { WIDE_KEY_TILE }
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Resolve geometry for the dense/causal kernels.
///
/// The entry points only pass lengths up to
/// [`MAX_SEQLEN`](super::validate::MAX_SEQLEN), which keeps every padded
/// length inside the records' i32 fields.
pub fn resolve(
    max_seqlen_q: usize,
    max_seqlen_k: usize,
    head_dim: usize,
    capability: ComputeCapability,
    direction: Direction,
) -> Geometry {
    let key_tile = key_tile(head_dim, capability, direction);
    let padded_k = if max_seqlen_k <= NARROW_KEY_TILE {
        NARROW_KEY_TILE
    } else if max_seqlen_k <= WIDE_KEY_TILE {
        WIDE_KEY_TILE
    } else {
        round_up(max_seqlen_k, key_tile)
    };
    let padded_q = round_up(max_seqlen_q, QUERY_TILE);

    Geometry {
        key_tile,
        padded_k,
        padded_q,
        needs_split_accumulation: padded_k > key_tile,
    }
}

/// Resolve geometry for the block-sparse kernels, which always tile keys by 256.
pub fn resolve_block_sparse(max_seqlen_q: usize, max_seqlen_k: usize) -> Geometry {
    let padded_k = round_up(max_seqlen_k, BLOCK_SPARSE_KEY_TILE).max(BLOCK_SPARSE_KEY_TILE);
    let padded_q = round_up(max_seqlen_q, QUERY_TILE);

    Geometry {
        key_tile: BLOCK_SPARSE_KEY_TILE,
        padded_k,
        padded_q,
        needs_split_accumulation: padded_k > BLOCK_SPARSE_KEY_TILE,
    }
}

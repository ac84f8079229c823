//! Dropout random state
//!
//! Forward and backward never exchange dropout masks. Both derive the same
//! counter-based Philox stream from a shared `(seed, offset)` pair, so the
//! backward call only has to see the generator in the same state the forward
//! call saw it in.
//!
//! The generator is shared process state. Reading and advancing its counter is
//! the only critical section in the orchestration layer.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// Per-(batch, head) counter budget consumed by one fused dense call.
pub const DEFAULT_OFFSET_PER_HEAD: u64 = 32;

/// Counter offset used by the block-sparse backward pass. The caller restores
/// the generator state afterwards, so the value is arbitrary.
pub const BLOCK_SPARSE_BWD_COUNTER_OFFSET: u64 = 4;

/// Seed and starting counter of a Philox stream, as handed to the kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PhiloxState {
    pub seed: u64,
    pub offset: u64,
}

/// Source of dropout random state.
///
/// Implementations must make `philox_state` atomic with respect to concurrent
/// callers: the returned state is the counter before advancing, and no two
/// callers may observe overlapping ranges.
pub trait RandomGenerator: Send + Sync {
    /// Return the current state and advance the counter by `increment`.
    fn philox_state(&self, increment: u64) -> Result<PhiloxState>;
}

/// Mutex-guarded Philox generator.
#[derive(Debug)]
pub struct PhiloxGenerator {
    state: Mutex<PhiloxState>,
}

impl PhiloxGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(PhiloxState { seed, offset: 0 }),
        }
    }

    /// Copy of the current state, for restoring after a pass that must not
    /// consume random numbers.
    pub fn snapshot(&self) -> Result<PhiloxState> {
        Ok(*self.lock()?)
    }

    pub fn restore(&self, state: PhiloxState) -> Result<()> {
        *self.lock()? = state;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PhiloxState>> {
        self.state.lock().map_err(|e| Error::GeneratorError {
            reason: format!("generator mutex poisoned: {e}"),
        })
    }
}

impl RandomGenerator for PhiloxGenerator {
    fn philox_state(&self, increment: u64) -> Result<PhiloxState> {
        // One Philox call yields four 32-bit values; keep offsets aligned to that.
        let increment = increment.div_ceil(4) * 4;
        let mut guard = self.lock()?;
        let state = *guard;
        guard.offset = guard.offset.wrapping_add(increment);
        Ok(state)
    }
}

/// Counter offset for the dense forward and backward passes.
pub fn dense_counter_offset(batch_size: usize, num_heads: usize, per_head: u64) -> u64 {
    batch_size as u64 * num_heads as u64 * per_head
}

/// Acquire state from `generator` only when dropout is active.
pub fn acquire(
    generator: &dyn RandomGenerator,
    is_dropout: bool,
    counter_offset: u64,
) -> Result<Option<PhiloxState>> {
    if !is_dropout {
        return Ok(None);
    }
    let state = generator.philox_state(counter_offset)?;
    tracing::trace!(
        seed = state.seed,
        offset = state.offset,
        counter_offset,
        "acquired philox state"
    );
    Ok(Some(state))
}

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;

/// Philox4x32-10 block function.
pub fn philox4x32(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut ctr = counter;
    let mut key = key;
    for round in 0..10 {
        if round > 0 {
            key = [key[0].wrapping_add(PHILOX_W0), key[1].wrapping_add(PHILOX_W1)];
        }
        let p0 = u64::from(PHILOX_M0) * u64::from(ctr[0]);
        let p1 = u64::from(PHILOX_M1) * u64::from(ctr[2]);
        ctr = [
            (p1 >> 32) as u32 ^ ctr[1] ^ key[0],
            p1 as u32,
            (p0 >> 32) as u32 ^ ctr[3] ^ key[1],
            p0 as u32,
        ];
    }
    ctr
}

/// Uniform 32-bit sample `index` of subsequence `subsequence` of `state`'s stream.
pub fn sample_u32(state: PhiloxState, subsequence: u64, index: u64) -> u32 {
    let position = state.offset.wrapping_add(index);
    let block = position / 4;
    let lane = (position % 4) as usize;
    let counter = [
        block as u32,
        (block >> 32) as u32,
        subsequence as u32,
        (subsequence >> 32) as u32,
    ];
    let key = [state.seed as u32, (state.seed >> 32) as u32];
    philox4x32(counter, key)[lane]
}

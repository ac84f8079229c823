//! Fused attention orchestration
//!
//! Bottom-up: [`validate`] and [`geometry`] are pure, [`params`] builds the
//! kernel records, [`scratch`] plans buffers, [`rng`] hands out dropout
//! state, [`dispatch`] picks a kernel, and [`fmha`] wires them into the four
//! entry points. [`reference`] executes records on host memory.

pub mod dispatch;
pub mod fmha;
pub mod geometry;
pub mod params;
pub mod reference;
pub mod rng;
pub mod scratch;
pub mod validate;

pub use dispatch::{
    FmhaKernels, HeadDimTier, KernelEntry, KernelKey, KernelTable, LaunchParams, LaunchPhase,
    Variant,
};
pub use fmha::{
    BlockBwdArgs, BlockFwdArgs, BlockFwdOutput, BwdArgs, BwdOutput, Fmha, FwdArgs, FwdOutput,
};
pub use geometry::{Direction, Geometry};
pub use params::{BackwardParams, ForwardParams};
pub use reference::{LaunchRecord, ReferenceKernels};
pub use rng::{PhiloxGenerator, PhiloxState, RandomGenerator};

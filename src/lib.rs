//! # fmha
//!
//! **Host-side orchestration for fused multi-head attention over packed,
//! variable-length batches.**
//!
//! fmha sits between a framework's call surface and a family of fused
//! attention kernels. It checks the caller's tensors, derives the tile
//! geometry, fills the kernel's execution record, allocates scratch and
//! statistics buffers, attaches reproducible dropout state and picks the
//! kernel specialization.
//!
//! ## Relationship to the kernels
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  framework call surface                  │
//! └──────────────────────────┬──────────────────────────────┘
//! ┌──────────────────────────▼──────────────────────────────┐
//! │                    fmha ◄── YOU ARE HERE                 │
//! │   (validation, geometry, records, scratch, RNG, routing) │
//! └──────────────────────────┬──────────────────────────────┘
//! ┌──────────────────────────▼──────────────────────────────┐
//! │           FmhaKernels (device or reference host)         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Traits at the seams**: tensors ([`DeviceTensor`]), the allocator
//!   ([`DeviceAllocator`]), the kernels ([`FmhaKernels`]) and the random
//!   generator ([`RandomGenerator`]) are all external
//! - **Explicit records**: separate `#[repr(C)]` forward and backward records,
//!   rebuilt from zero for every call
//! - **Total dispatch table**: every (head-dim tier, variant, direction) is
//!   checked to have a kernel when the context is built
//! - **Reference kernels**: [`ReferenceKernels`] runs records against host
//!   memory, so the whole path is testable without a GPU

pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod tensor;

pub use config::FmhaConfig;
pub use device::{ComputeCapability, Location};
pub use dtype::DType;
pub use error::{Error, Result};
pub use ops::{
    BlockBwdArgs, BlockFwdArgs, BlockFwdOutput, BwdArgs, BwdOutput, Fmha, FmhaKernels, FwdArgs,
    FwdOutput, PhiloxGenerator, PhiloxState, RandomGenerator, ReferenceKernels,
};
pub use tensor::{DeviceAllocator, DeviceTensor, HostAllocator, HostTensor};

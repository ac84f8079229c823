//! Tensor and allocator interfaces consumed by the orchestration layer
//!
//! Device memory is owned by an external allocator. The layer only needs to
//! read a tensor's layout and address, and to ask the allocator for a few
//! scratch buffers per call.

pub mod host;

pub use host::{HostAllocator, HostTensor};

use crate::device::Location;
use crate::dtype::DType;
use crate::error::Result;

/// Raw device address. `0` is the null pointer.
pub type DevicePtr = u64;

/// Read-only view of an externally owned tensor.
///
/// `Clone` must be a cheap handle copy that aliases the same storage.
pub trait DeviceTensor: Clone {
    fn shape(&self) -> &[usize];

    /// Per-dimension strides in elements.
    fn strides(&self) -> &[usize];

    fn dtype(&self) -> DType;

    fn location(&self) -> Location;

    /// Address of the first element.
    fn ptr(&self) -> DevicePtr;

    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    fn stride(&self, dim: usize) -> usize {
        self.strides()[dim]
    }

    /// Row-major contiguity. Size-1 dimensions place no constraint on their stride.
    fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(self.shape());
        self.shape()
            .iter()
            .zip(self.strides().iter().zip(expected.iter()))
            .all(|(&dim, (&actual, &want))| dim == 1 || actual == want)
    }
}

/// Row-major strides for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// External device allocator.
///
/// All buffers it returns are row-major and contiguous. Fill and copy are
/// stream-ordered device operations in a real backend.
pub trait DeviceAllocator {
    type Tensor: DeviceTensor;

    /// Uninitialized buffer.
    fn empty(&self, shape: &[usize], dtype: DType) -> Result<Self::Tensor>;

    /// Set every element of `tensor` to `value` (cast to its dtype).
    fn fill(&self, tensor: &Self::Tensor, value: f32) -> Result<()>;

    /// Element-wise copy with dtype cast. Shapes must match.
    fn copy(&self, dst: &Self::Tensor, src: &Self::Tensor) -> Result<()>;

    /// Contiguous copy of `tensor` restricted to the first `len` entries of `dim`.
    fn narrow(&self, tensor: &Self::Tensor, dim: usize, len: usize) -> Result<Self::Tensor>;

    /// Synchronous host read of an i32 tensor.
    fn read_i32(&self, tensor: &Self::Tensor) -> Result<Vec<i32>>;

    fn zeros(&self, shape: &[usize], dtype: DType) -> Result<Self::Tensor> {
        self.full(shape, dtype, 0.0)
    }

    fn full(&self, shape: &[usize], dtype: DType, value: f32) -> Result<Self::Tensor> {
        let tensor = self.empty(shape, dtype)?;
        self.fill(&tensor, value)?;
        Ok(tensor)
    }
}

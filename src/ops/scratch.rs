//! Scratch, statistics and output allocation planning
//!
//! Planning is separated from allocation so the decisions can be checked
//! without touching an allocator. Every planned buffer is row-major and
//! contiguous.

use super::geometry::Geometry;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::DeviceAllocator;

/// Initial contents of a planned buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BufferInit {
    Uninit,
    Zeros,
    Fill(f32),
}

/// Shape, dtype and initial contents of one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSpec {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub init: BufferInit,
}

impl BufferSpec {
    fn new(shape: &[usize], dtype: DType, init: BufferInit) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
            init,
        }
    }

    pub fn allocate<A: DeviceAllocator>(&self, allocator: &A) -> Result<A::Tensor> {
        match self.init {
            BufferInit::Uninit => allocator.empty(&self.shape, self.dtype),
            BufferInit::Zeros => allocator.zeros(&self.shape, self.dtype),
            BufferInit::Fill(value) => allocator.full(&self.shape, self.dtype, value),
        }
    }

    /// Byte size, or `InvalidArgument` when it does not fit in `usize`.
    pub fn size_in_bytes(&self) -> Result<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                Error::invalid(
                    "shape",
                    format!("{} buffer {:?} overflows usize", self.dtype, self.shape),
                )
            })
    }
}

fn total_bytes<'a>(specs: impl IntoIterator<Item = &'a BufferSpec>) -> Result<usize> {
    specs.into_iter().try_fold(0usize, |acc, spec| {
        acc.checked_add(spec.size_in_bytes()?)
            .ok_or_else(|| Error::invalid("shape", "planned buffers overflow usize"))
    })
}

/// Sizes the planner needs besides the geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedDims {
    pub batch_size: usize,
    pub total_q: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl PackedDims {
    fn rows_q(&self) -> [usize; 3] {
        [self.total_q, self.num_heads, self.head_dim]
    }
}

/// Buffers for one forward call.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardPlan {
    /// Output buffer; only planned when the layer owns the output (block-sparse)
    pub out: Option<BufferSpec>,
    /// f32 split-accumulation scratch
    pub o_tmp: Option<BufferSpec>,
    pub softmax_lse: BufferSpec,
    pub softmax: Option<BufferSpec>,
    /// Caller-provided output must be zero-filled before launch
    pub zero_out: bool,
}

impl ForwardPlan {
    /// Total bytes of every planned buffer. Checked before anything is allocated.
    pub fn size_in_bytes(&self) -> Result<usize> {
        total_bytes(
            self.out
                .iter()
                .chain(&self.o_tmp)
                .chain([&self.softmax_lse])
                .chain(&self.softmax),
        )
    }
}

/// Buffers for one backward call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardPlan {
    /// f32 query-gradient scratch
    pub dq_tmp: Option<BufferSpec>,
    pub softmax_d: BufferSpec,
    /// Caller-provided dq/dk/dv must be zero-filled before launch
    pub zero_grads: bool,
}

impl BackwardPlan {
    pub fn size_in_bytes(&self) -> Result<usize> {
        total_bytes(self.dq_tmp.iter().chain([&self.softmax_d]))
    }
}

/// Plan the dense/causal forward pass.
///
/// With `zero_tensors` the statistics start at `-inf`, the identity of the
/// running max inside log-sum-exp.
pub fn plan_forward(
    dims: PackedDims,
    geometry: &Geometry,
    dtype: DType,
    return_softmax: bool,
    zero_tensors: bool,
) -> ForwardPlan {
    let lse_shape = [dims.batch_size, dims.num_heads, geometry.padded_q];
    let softmax_shape = [
        dims.batch_size,
        dims.num_heads,
        geometry.padded_q,
        geometry.padded_k,
    ];
    let (lse_init, softmax_init) = if zero_tensors {
        (BufferInit::Fill(f32::NEG_INFINITY), BufferInit::Zeros)
    } else {
        (BufferInit::Uninit, BufferInit::Uninit)
    };

    ForwardPlan {
        out: None,
        o_tmp: geometry
            .needs_split_accumulation
            .then(|| BufferSpec::new(&dims.rows_q(), DType::F32, BufferInit::Uninit)),
        softmax_lse: BufferSpec::new(&lse_shape, DType::F32, lse_init),
        softmax: return_softmax.then(|| BufferSpec::new(&softmax_shape, dtype, softmax_init)),
        zero_out: zero_tensors,
    }
}

/// Plan the block-sparse forward pass. The layer allocates a zeroed output
/// and a zeroed softmax dump; statistics are left uninitialized.
pub fn plan_block_forward(
    dims: PackedDims,
    geometry: &Geometry,
    dtype: DType,
    return_softmax: bool,
) -> ForwardPlan {
    let softmax_shape = [
        dims.batch_size,
        dims.num_heads,
        geometry.padded_q,
        geometry.padded_k,
    ];
    ForwardPlan {
        out: Some(BufferSpec::new(&dims.rows_q(), dtype, BufferInit::Zeros)),
        o_tmp: geometry
            .needs_split_accumulation
            .then(|| BufferSpec::new(&dims.rows_q(), DType::F32, BufferInit::Uninit)),
        softmax_lse: BufferSpec::new(
            &[dims.batch_size, dims.num_heads, geometry.padded_q],
            DType::F32,
            BufferInit::Uninit,
        ),
        softmax: return_softmax
            .then(|| BufferSpec::new(&softmax_shape, dtype, BufferInit::Zeros)),
        zero_out: false,
    }
}

/// Plan the backward pass (dense, causal or block-sparse).
pub fn plan_backward(dims: PackedDims, geometry: &Geometry, zero_tensors: bool) -> BackwardPlan {
    let softmax_d_init = if zero_tensors {
        BufferInit::Zeros
    } else {
        BufferInit::Uninit
    };
    BackwardPlan {
        dq_tmp: geometry
            .needs_split_accumulation
            .then(|| BufferSpec::new(&dims.rows_q(), DType::F32, BufferInit::Uninit)),
        softmax_d: BufferSpec::new(
            &[dims.batch_size, dims.num_heads, geometry.padded_q],
            DType::F32,
            softmax_d_init,
        ),
        zero_grads: zero_tensors,
    }
}

/// Query-gradient scratch required after the kernel chose `num_splits > 1`
/// in its configure phase.
pub fn split_dq_scratch(dims: PackedDims) -> BufferSpec {
    BufferSpec::new(&dims.rows_q(), DType::F32, BufferInit::Zeros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ComputeCapability;
    use crate::ops::geometry::{self, Direction};
    use crate::tensor::{DeviceTensor, HostAllocator};

    fn dims() -> PackedDims {
        PackedDims {
            batch_size: 2,
            total_q: 8,
            num_heads: 3,
            head_dim: 64,
        }
    }

    #[test]
    fn test_short_forward_needs_no_scratch() {
        let g = geometry::resolve(8, 8, 64, ComputeCapability::SM80, Direction::Forward);
        let plan = plan_forward(dims(), &g, DType::F16, false, false);
        assert!(plan.o_tmp.is_none());
        assert!(plan.softmax.is_none());
        assert!(plan.out.is_none());
        assert_eq!(plan.softmax_lse.shape, vec![2, 3, 16]);
        assert_eq!(plan.softmax_lse.dtype, DType::F32);
        assert_eq!(plan.softmax_lse.init, BufferInit::Uninit);
    }

    #[test]
    fn test_split_forward_plans_f32_scratch() {
        let g = geometry::resolve(8, 600, 128, ComputeCapability::SM80, Direction::Forward);
        let plan = plan_forward(dims(), &g, DType::BF16, true, false);
        let o_tmp = plan.o_tmp.unwrap();
        assert_eq!(o_tmp.shape, vec![8, 3, 64]);
        assert_eq!(o_tmp.dtype, DType::F32);

        let softmax = plan.softmax.unwrap();
        assert_eq!(softmax.shape, vec![2, 3, 16, 640]);
        assert_eq!(softmax.dtype, DType::BF16);
        assert_eq!(softmax.size_in_bytes().unwrap(), 2 * 3 * 16 * 640 * 2);
    }

    #[test]
    fn test_zero_tensors_fills_lse_with_neg_inf() {
        let g = geometry::resolve(8, 8, 64, ComputeCapability::SM80, Direction::Forward);
        let plan = plan_forward(dims(), &g, DType::F16, true, true);
        assert!(plan.zero_out);
        assert_eq!(plan.softmax_lse.init, BufferInit::Fill(f32::NEG_INFINITY));
        assert_eq!(plan.softmax.as_ref().unwrap().init, BufferInit::Zeros);

        let alloc = HostAllocator::new(0);
        let lse = plan.softmax_lse.allocate(&alloc).unwrap();
        let values = lse.to_f32_vec();
        assert_eq!(values.len(), lse.numel());
        assert!(values.iter().all(|v| v.is_infinite() && v.is_sign_negative()));
    }

    #[test]
    fn test_block_forward_owns_zeroed_output() {
        let g = geometry::resolve_block_sparse(8, 8);
        let plan = plan_block_forward(dims(), &g, DType::F16, true);
        let out = plan.out.unwrap();
        assert_eq!(out.shape, vec![8, 3, 64]);
        assert_eq!(out.init, BufferInit::Zeros);
        assert_eq!(plan.softmax.unwrap().shape, vec![2, 3, 16, 256]);
    }

    #[test]
    fn test_plan_size_overflow_is_invalid_argument() {
        let g = Geometry {
            key_tile: 256,
            padded_k: 1 << 31,
            padded_q: 1 << 31,
            needs_split_accumulation: true,
        };
        let plan = plan_forward(dims(), &g, DType::F16, true, false);
        let err = plan.size_in_bytes().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: "shape", .. }));

        let plan = plan_forward(dims(), &g, DType::F16, false, false);
        let expected = 8 * 3 * 64 * 4 + 2 * 3 * (1 << 31) * 4;
        assert_eq!(plan.size_in_bytes().unwrap(), expected);
    }

    #[test]
    fn test_backward_plan() {
        let g = geometry::resolve(8, 300, 64, ComputeCapability::SM75, Direction::Backward);
        let plan = plan_backward(dims(), &g, true);
        assert!(plan.zero_grads);
        assert_eq!(plan.dq_tmp.unwrap().dtype, DType::F32);
        assert_eq!(plan.softmax_d.init, BufferInit::Zeros);

        let scratch = split_dq_scratch(dims());
        assert_eq!(scratch.init, BufferInit::Zeros);
        assert_eq!(scratch.shape, vec![8, 3, 64]);
    }
}

//! Input validation
//!
//! Everything here runs before any allocation or record building and has no
//! side effects. Device-generation checks raise `UnsupportedConfiguration`;
//! everything else about the caller's tensors raises `InvalidArgument` naming
//! the offending tensor.

use super::dispatch::Variant;
use super::fmha::{BlockBwdArgs, BlockFwdArgs, BwdArgs, FwdArgs};
use super::geometry::{BLOCK_SPARSE_KEY_TILE, Direction, Geometry};
use super::params::check_dropout;
use crate::device::ComputeCapability;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::{DeviceAllocator, DeviceTensor};

/// Largest `max_seqlen_*` whose padded length still fits the records' i32 fields.
pub const MAX_SEQLEN: usize = (i32::MAX as usize) & !(BLOCK_SPARSE_KEY_TILE - 1);

/// Sizes read off validated tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    pub batch_size: usize,
    pub total_q: usize,
    pub total_k: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

/// Which packed row count a feature tensor is indexed by.
#[derive(Debug, Clone, Copy)]
enum Rows {
    Query,
    Key,
}

struct Inputs<'a, T> {
    /// `q` must come first, `k` second
    features: Vec<(&'static str, &'a T, Rows)>,
    /// Feature tensors that must be fully contiguous, not just unit inner stride
    contiguous: Vec<(&'static str, &'a T)>,
    /// Other tensors that only need to be resident on the same device
    resident: Vec<(&'static str, &'a T)>,
    cu_seqlens_q: &'a T,
    cu_seqlens_k: &'a T,
    max_seqlen_q: usize,
    max_seqlen_k: usize,
}

pub fn check_capability(
    capability: ComputeCapability,
    variant: Variant,
    direction: Direction,
) -> Result<()> {
    let supported = match variant {
        Variant::Dense | Variant::Causal => capability.supports_dense(),
        Variant::BlockSparse => capability.supports_block_sparse(),
    };
    if !supported {
        return Err(Error::unsupported(format!(
            "{variant:?} {direction:?} kernels are not built for {capability}"
        )));
    }
    Ok(())
}

/// Element type of Q/K/V/O for the variant and device generation.
pub fn check_feature_dtype(
    capability: ComputeCapability,
    variant: Variant,
    dtype: DType,
) -> Result<()> {
    match (variant, dtype) {
        (_, DType::F16) => Ok(()),
        (Variant::Dense | Variant::Causal, DType::BF16) if capability.supports_bf16() => Ok(()),
        (Variant::Dense | Variant::Causal, DType::BF16) => Err(Error::unsupported(format!(
            "bf16 inputs need sm8x or sm90, device is {capability}"
        ))),
        (Variant::BlockSparse, _) => Err(Error::invalid(
            "q",
            format!("block-sparse attention expects f16, got {dtype}"),
        )),
        _ => Err(Error::invalid(
            "q",
            format!("expected f16 or bf16, got {dtype}"),
        )),
    }
}

/// Dense kernels take any multiple of 8 up to 128; block-sparse kernels
/// are only built for the tier widths.
pub fn check_head_dim(variant: Variant, head_dim: usize) -> Result<()> {
    let ok = match variant {
        Variant::Dense | Variant::Causal => head_dim > 0 && head_dim % 8 == 0 && head_dim <= 128,
        Variant::BlockSparse => matches!(head_dim, 16 | 32 | 64 | 128),
    };
    if !ok {
        let expected = match variant {
            Variant::BlockSparse => "one of 16, 32, 64, 128",
            _ => "a multiple of 8 in 8..=128",
        };
        return Err(Error::invalid(
            "head_dim",
            format!("head_dim must be {expected}, got {head_dim}"),
        ));
    }
    Ok(())
}

fn check_backward_head_dim(
    capability: ComputeCapability,
    variant: Variant,
    head_dim: usize,
) -> Result<()> {
    let wide = match variant {
        Variant::Dense | Variant::Causal => head_dim > 64,
        Variant::BlockSparse => head_dim == 128,
    };
    if wide && !capability.supports_wide_head_backward() {
        return Err(Error::unsupported(format!(
            "backward with head_dim={head_dim} needs sm80 or sm90, device is {capability}"
        )));
    }
    Ok(())
}

fn check_shape<T: DeviceTensor>(arg: &'static str, t: &T, expected: &[usize]) -> Result<()> {
    if t.shape() != expected {
        return Err(Error::invalid(
            arg,
            format!("expected shape {expected:?}, got {:?}", t.shape()),
        ));
    }
    Ok(())
}

fn check_max_seqlen(arg: &'static str, value: usize) -> Result<()> {
    if value > MAX_SEQLEN {
        return Err(Error::invalid(
            arg,
            format!("{value} exceeds the kernels' limit of {MAX_SEQLEN}"),
        ));
    }
    Ok(())
}

fn check_i32_offsets<T: DeviceTensor>(arg: &'static str, t: &T) -> Result<()> {
    if t.dtype() != DType::I32 {
        return Err(Error::invalid(
            arg,
            format!("expected i32 offsets, got {}", t.dtype()),
        ));
    }
    if t.shape().len() != 1 {
        return Err(Error::invalid(
            arg,
            format!("expected a 1D offsets tensor, got shape {:?}", t.shape()),
        ));
    }
    if !t.is_contiguous() {
        return Err(Error::invalid(arg, "offsets must be contiguous"));
    }
    Ok(())
}

fn validate<T: DeviceTensor>(
    capability: ComputeCapability,
    variant: Variant,
    direction: Direction,
    inputs: &Inputs<'_, T>,
    p_dropout: f32,
    softmax_scale: f32,
) -> Result<ProblemShape> {
    check_capability(capability, variant, direction)?;

    let (_, q, _) = inputs.features[0];
    let (_, k, _) = inputs.features[1];
    let dtype = q.dtype();
    check_feature_dtype(capability, variant, dtype)?;
    for &(arg, t, _) in &inputs.features {
        if t.dtype() != dtype {
            return Err(Error::invalid(
                arg,
                format!("expected dtype {dtype} to match q, got {}", t.dtype()),
            ));
        }
    }
    check_i32_offsets("cu_seqlens_q", inputs.cu_seqlens_q)?;
    check_i32_offsets("cu_seqlens_k", inputs.cu_seqlens_k)?;

    let location = q.location();
    if !location.is_device() {
        return Err(Error::invalid("q", format!("expected a device tensor, got {location}")));
    }
    let resident = inputs
        .features
        .iter()
        .map(|&(arg, t, _)| (arg, t))
        .chain([
            ("cu_seqlens_q", inputs.cu_seqlens_q),
            ("cu_seqlens_k", inputs.cu_seqlens_k),
        ])
        .chain(inputs.resident.iter().copied());
    for (arg, t) in resident {
        if t.location() != location {
            return Err(Error::invalid(
                arg,
                format!("expected a tensor on {location}, got {}", t.location()),
            ));
        }
    }

    for &(arg, t, _) in &inputs.features {
        if t.shape().len() != 3 {
            return Err(Error::invalid(
                arg,
                format!(
                    "expected 3D [total_rows, num_heads, head_dim], got shape {:?}",
                    t.shape()
                ),
            ));
        }
        if t.stride(2) != 1 {
            return Err(Error::invalid(
                arg,
                format!("innermost stride must be 1, got {}", t.stride(2)),
            ));
        }
    }
    for &(arg, t) in &inputs.contiguous {
        if !t.is_contiguous() {
            return Err(Error::invalid(arg, "expected a contiguous tensor"));
        }
    }

    let batch_size = inputs.cu_seqlens_q.numel().saturating_sub(1);
    if batch_size == 0 {
        return Err(Error::invalid(
            "cu_seqlens_q",
            "batch_size must be positive (offsets need at least 2 entries)",
        ));
    }
    let (total_q, num_heads, head_dim) = (q.shape()[0], q.shape()[1], q.shape()[2]);
    let total_k = k.shape()[0];
    check_head_dim(variant, head_dim)?;
    if direction == Direction::Backward {
        check_backward_head_dim(capability, variant, head_dim)?;
    }

    for &(arg, t, rows) in &inputs.features {
        let rows = match rows {
            Rows::Query => total_q,
            Rows::Key => total_k,
        };
        check_shape(arg, t, &[rows, num_heads, head_dim])?;
    }
    check_shape("cu_seqlens_q", inputs.cu_seqlens_q, &[batch_size + 1])?;
    check_shape("cu_seqlens_k", inputs.cu_seqlens_k, &[batch_size + 1])?;
    check_max_seqlen("max_seqlen_q", inputs.max_seqlen_q)?;
    check_max_seqlen("max_seqlen_k", inputs.max_seqlen_k)?;

    check_dropout(p_dropout)?;
    if !softmax_scale.is_finite() {
        return Err(Error::invalid(
            "softmax_scale",
            format!("softmax scale must be finite, got {softmax_scale}"),
        ));
    }

    Ok(ProblemShape {
        batch_size,
        total_q,
        total_k,
        num_heads,
        head_dim,
    })
}

pub(crate) fn dense_variant(is_causal: bool) -> Variant {
    if is_causal {
        Variant::Causal
    } else {
        Variant::Dense
    }
}

pub fn validate_forward<T: DeviceTensor>(
    capability: ComputeCapability,
    args: &FwdArgs<'_, T>,
) -> Result<ProblemShape> {
    let inputs = Inputs {
        features: vec![
            ("q", args.q, Rows::Query),
            ("k", args.k, Rows::Key),
            ("v", args.v, Rows::Key),
            ("out", args.out, Rows::Query),
        ],
        contiguous: vec![],
        resident: vec![],
        cu_seqlens_q: args.cu_seqlens_q,
        cu_seqlens_k: args.cu_seqlens_k,
        max_seqlen_q: args.max_seqlen_q,
        max_seqlen_k: args.max_seqlen_k,
    };
    validate(
        capability,
        dense_variant(args.is_causal),
        Direction::Forward,
        &inputs,
        args.p_dropout,
        args.softmax_scale,
    )
}

pub fn validate_backward<T: DeviceTensor>(
    capability: ComputeCapability,
    args: &BwdArgs<'_, T>,
) -> Result<ProblemShape> {
    let inputs = Inputs {
        features: vec![
            ("q", args.q, Rows::Query),
            ("k", args.k, Rows::Key),
            ("v", args.v, Rows::Key),
            ("out", args.out, Rows::Query),
            ("dout", args.dout, Rows::Query),
            ("dq", args.dq, Rows::Query),
            ("dk", args.dk, Rows::Key),
            ("dv", args.dv, Rows::Key),
        ],
        contiguous: vec![("out", args.out), ("dout", args.dout)],
        resident: vec![("softmax_lse", args.softmax_lse)],
        cu_seqlens_q: args.cu_seqlens_q,
        cu_seqlens_k: args.cu_seqlens_k,
        max_seqlen_q: args.max_seqlen_q,
        max_seqlen_k: args.max_seqlen_k,
    };
    validate(
        capability,
        dense_variant(args.is_causal),
        Direction::Backward,
        &inputs,
        args.p_dropout,
        args.softmax_scale,
    )
}

pub fn validate_block_forward<T: DeviceTensor>(
    capability: ComputeCapability,
    args: &BlockFwdArgs<'_, T>,
) -> Result<ProblemShape> {
    let inputs = Inputs {
        features: vec![
            ("q", args.q, Rows::Query),
            ("k", args.k, Rows::Key),
            ("v", args.v, Rows::Key),
        ],
        contiguous: vec![],
        resident: vec![("blockmask", args.blockmask)],
        cu_seqlens_q: args.cu_seqlens_q,
        cu_seqlens_k: args.cu_seqlens_k,
        max_seqlen_q: args.max_seqlen_q,
        max_seqlen_k: args.max_seqlen_k,
    };
    validate(
        capability,
        Variant::BlockSparse,
        Direction::Forward,
        &inputs,
        args.p_dropout,
        args.softmax_scale,
    )
}

pub fn validate_block_backward<T: DeviceTensor>(
    capability: ComputeCapability,
    args: &BlockBwdArgs<'_, T>,
) -> Result<ProblemShape> {
    let inputs = Inputs {
        features: vec![
            ("q", args.q, Rows::Query),
            ("k", args.k, Rows::Key),
            ("v", args.v, Rows::Key),
            ("out", args.out, Rows::Query),
            ("dout", args.dout, Rows::Query),
            ("dq", args.dq, Rows::Query),
            ("dk", args.dk, Rows::Key),
            ("dv", args.dv, Rows::Key),
        ],
        contiguous: vec![("out", args.out), ("dout", args.dout)],
        resident: vec![("softmax_lse", args.softmax_lse), ("blockmask", args.blockmask)],
        cu_seqlens_q: args.cu_seqlens_q,
        cu_seqlens_k: args.cu_seqlens_k,
        max_seqlen_q: args.max_seqlen_q,
        max_seqlen_k: args.max_seqlen_k,
    };
    validate(
        capability,
        Variant::BlockSparse,
        Direction::Backward,
        &inputs,
        args.p_dropout,
        args.softmax_scale,
    )
}

/// Block mask layout, and its shape against the derived geometry.
pub fn check_block_mask<T: DeviceTensor>(mask: &T, geometry: &Geometry) -> Result<()> {
    if mask.dtype() != DType::I32 {
        return Err(Error::invalid(
            "blockmask",
            format!("expected i32, got {}", mask.dtype()),
        ));
    }
    if !mask.is_contiguous() {
        return Err(Error::invalid("blockmask", "expected a contiguous tensor"));
    }
    let expected = geometry.block_mask_shape();
    if mask.shape() != expected {
        return Err(Error::ConfigurationConflict {
            arg: "blockmask",
            reason: format!(
                "shape {:?} does not match (padded_k / 256, padded_q / 16) = {expected:?} \
                 for padded_k={}, padded_q={}",
                mask.shape(),
                geometry.padded_k,
                geometry.padded_q
            ),
        });
    }
    Ok(())
}

/// Forward statistics handed back to backward: f32 `[b, h, >= padded_q]`.
pub fn check_softmax_lse<T: DeviceTensor>(
    lse: &T,
    shape: &ProblemShape,
    geometry: &Geometry,
) -> Result<()> {
    if lse.dtype() != DType::F32 {
        return Err(Error::invalid(
            "softmax_lse",
            format!("expected f32, got {}", lse.dtype()),
        ));
    }
    let dims = lse.shape();
    if dims.len() != 3 || dims[0] != shape.batch_size || dims[1] != shape.num_heads {
        return Err(Error::invalid(
            "softmax_lse",
            format!(
                "expected shape [{}, {}, seqlen], got {dims:?}",
                shape.batch_size, shape.num_heads
            ),
        ));
    }
    if dims[2] < geometry.padded_q {
        return Err(Error::ConfigurationConflict {
            arg: "softmax_lse",
            reason: format!(
                "statistics cover {} query rows but backward needs padded_q={}",
                dims[2], geometry.padded_q
            ),
        });
    }
    Ok(())
}

/// Host-side check of offset contents. Needs a synchronous device read.
pub fn check_offsets<A: DeviceAllocator>(
    allocator: &A,
    arg: &'static str,
    offsets: &A::Tensor,
    total_rows: usize,
    max_seqlen: usize,
) -> Result<()> {
    let values = allocator.read_i32(offsets)?;
    if values.first() != Some(&0) {
        return Err(Error::invalid(arg, format!("offsets must start at 0, got {values:?}")));
    }
    for (i, pair) in values.windows(2).enumerate() {
        let len = i64::from(pair[1]) - i64::from(pair[0]);
        if len < 0 {
            return Err(Error::invalid(
                arg,
                format!("offsets decrease at sequence {i}: {} -> {}", pair[0], pair[1]),
            ));
        }
        if len as usize > max_seqlen {
            return Err(Error::invalid(
                arg,
                format!("sequence {i} has length {len}, above max_seqlen={max_seqlen}"),
            ));
        }
    }
    let last = values.last().copied().unwrap_or_default();
    if usize::try_from(last).ok() != Some(total_rows) {
        return Err(Error::invalid(
            arg,
            format!("last offset {last} does not match {total_rows} packed rows"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_head_dims() {
        for d in [8, 16, 40, 64, 96, 128] {
            check_head_dim(Variant::Dense, d).unwrap();
        }
        for d in [0, 12, 136, 256] {
            assert!(check_head_dim(Variant::Dense, d).is_err(), "head_dim {d}");
        }
    }

    #[test]
    fn test_block_sparse_head_dims() {
        for d in [16, 32, 64, 128] {
            check_head_dim(Variant::BlockSparse, d).unwrap();
        }
        for d in [8, 24, 48, 96] {
            assert!(check_head_dim(Variant::BlockSparse, d).is_err(), "head_dim {d}");
        }
    }

    #[test]
    fn test_bf16_needs_ampere() {
        check_feature_dtype(ComputeCapability::SM80, Variant::Dense, DType::BF16).unwrap();
        let err = check_feature_dtype(ComputeCapability::SM75, Variant::Dense, DType::BF16)
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration { .. }));
        let err = check_feature_dtype(ComputeCapability::SM80, Variant::BlockSparse, DType::BF16)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        let err = check_feature_dtype(ComputeCapability::SM80, Variant::Dense, DType::F32)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_capability_gate() {
        check_capability(ComputeCapability::SM75, Variant::Dense, Direction::Forward).unwrap();
        let err = check_capability(
            ComputeCapability::SM75,
            Variant::BlockSparse,
            Direction::Forward,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration { .. }));
        assert!(
            check_capability(ComputeCapability::new(6, 1), Variant::Dense, Direction::Forward)
                .is_err()
        );
    }

    #[test]
    fn test_max_seqlen_limit() {
        check_max_seqlen("max_seqlen_k", MAX_SEQLEN).unwrap();
        assert_eq!(MAX_SEQLEN % BLOCK_SPARSE_KEY_TILE, 0);
        assert!(i32::try_from(MAX_SEQLEN).is_ok());
        let err = check_max_seqlen("max_seqlen_k", MAX_SEQLEN + 1).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: "max_seqlen_k", .. }));
    }

    #[test]
    fn test_wide_head_backward_gate() {
        check_backward_head_dim(ComputeCapability::SM80, Variant::Dense, 128).unwrap();
        check_backward_head_dim(ComputeCapability::SM86, Variant::Dense, 64).unwrap();
        assert!(check_backward_head_dim(ComputeCapability::SM86, Variant::Dense, 72).is_err());
        check_backward_head_dim(ComputeCapability::SM86, Variant::BlockSparse, 64).unwrap();
        assert!(
            check_backward_head_dim(ComputeCapability::SM86, Variant::BlockSparse, 128).is_err()
        );
    }
}

//! Execution parameter records handed to the fused kernels
//!
//! Records are plain `#[repr(C)]` values built fresh for every call. Pointers
//! inside them are borrowed from the caller's tensors and from scratch buffers
//! that outlive the kernel submission.
//!
//! Forward and backward use two distinct records. The backward record embeds
//! the forward one (backward reads everything forward reads) and carries its
//! query-gradient scratch in a dedicated field; the forward scratch slot stays
//! null in backward records.

use half::{bf16, f16};

use super::rng::PhiloxState;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::{DevicePtr, DeviceTensor};

/// Batch, head and padded length scalars shared by both records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemSizes {
    pub batch_size: usize,
    /// Padded maximum query length
    pub seqlen_q: usize,
    /// Padded maximum key length
    pub seqlen_k: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

/// Caller-controlled scalars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionScalars {
    /// Probability of dropping an attention weight, in `[0, 1)`
    pub p_dropout: f32,
    pub softmax_scale: f32,
    pub is_causal: bool,
    /// Accumulation splits; `0` lets the kernel choose during its configure phase
    pub num_splits: u32,
}

/// Buffers the forward record points at besides Q/K/V/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardBuffers {
    pub cu_seqlens_q: DevicePtr,
    pub cu_seqlens_k: DevicePtr,
    /// f32 split-accumulation scratch, null unless keys span several tiles
    pub o_tmp: DevicePtr,
    /// Softmax dump, null unless requested
    pub softmax: DevicePtr,
    pub softmax_lse: DevicePtr,
    /// Block-sparse mask, null for dense/causal
    pub block_mask: DevicePtr,
}

/// Buffers the backward record points at besides the tensors it is built from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardBuffers {
    pub cu_seqlens_q: DevicePtr,
    pub cu_seqlens_k: DevicePtr,
    /// f32 query-gradient scratch
    pub dq_tmp: DevicePtr,
    pub dout: DevicePtr,
    pub softmax_lse: DevicePtr,
    pub dsoftmax_sum: DevicePtr,
    pub block_mask: DevicePtr,
}

/// Forward execution record.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardParams {
    pub q_ptr: DevicePtr,
    pub k_ptr: DevicePtr,
    pub v_ptr: DevicePtr,
    pub q_row_stride: u64,
    pub k_row_stride: u64,
    pub v_row_stride: u64,
    pub q_head_stride: u64,
    pub k_head_stride: u64,
    pub v_head_stride: u64,

    pub o_ptr: DevicePtr,
    pub o_row_stride: u64,
    pub o_head_stride: u64,

    pub o_tmp_ptr: DevicePtr,
    pub o_tmp_row_stride: u64,
    pub o_tmp_head_stride: u64,

    pub cu_seqlens_q: DevicePtr,
    pub cu_seqlens_k: DevicePtr,

    pub softmax_ptr: DevicePtr,
    pub softmax_stride_in_bytes: u64,
    pub softmax_lse_ptr: DevicePtr,
    pub block_mask_ptr: DevicePtr,

    pub b: i32,
    pub h: i32,
    pub seqlen_q: i32,
    pub seqlen_k: i32,
    pub d: i32,

    /// Softmax scale in f32 and as a packed pair of the input dtype
    pub scale_softmax: f32,
    pub scale_softmax_packed: u32,

    /// Probability of keeping an element
    pub keep_prob: f32,
    pub keep_threshold_u32: u32,
    pub keep_threshold_u16: u16,
    /// `1 / keep_prob`
    pub rp_dropout: f32,
    pub scale_softmax_rp_dropout: f32,
    pub scale_dropout_packed: u32,

    pub is_causal: bool,
    pub is_bf16: bool,
    pub num_splits: i32,

    pub philox: PhiloxState,
}

/// Backward execution record.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackwardParams {
    pub fwd: ForwardParams,

    /// f32 query-gradient scratch; null unless split accumulation or num_splits > 1
    pub dq_tmp_ptr: DevicePtr,

    pub dq_ptr: DevicePtr,
    pub dk_ptr: DevicePtr,
    pub dv_ptr: DevicePtr,
    pub dq_row_stride: u64,
    pub dk_row_stride: u64,
    pub dv_row_stride: u64,
    pub dq_head_stride: u64,
    pub dk_head_stride: u64,
    pub dv_head_stride: u64,

    pub do_ptr: DevicePtr,
    pub dsoftmax_sum_ptr: DevicePtr,
}

/// Integer thresholds for an inclusive `sample <= threshold` keep test.
///
/// Flooring keeps the effective keep probability at or below `keep_prob`.
pub fn keep_thresholds(keep_prob: f32) -> (u32, u16) {
    let keep = f64::from(keep_prob);
    let t32 = (keep * f64::from(u32::MAX)).floor() as u32;
    let t16 = (keep * f64::from(u16::MAX)).floor() as u16;
    (t32, t16)
}

/// Pack `value` the way reduced-precision kernels read scalar multipliers:
/// two copies of the narrowed value for half types, raw bits for f32.
pub fn pack_scalar(value: f32, dtype: DType) -> u32 {
    match dtype {
        DType::F16 => {
            let bits = u32::from(f16::from_f32(value).to_bits());
            bits | (bits << 16)
        }
        DType::BF16 => {
            let bits = u32::from(bf16::from_f32(value).to_bits());
            bits | (bits << 16)
        }
        DType::F32 | DType::I32 => value.to_bits(),
    }
}

pub(crate) fn check_dropout(p_dropout: f32) -> Result<()> {
    if !(0.0..1.0).contains(&p_dropout) {
        return Err(Error::invalid(
            "p_dropout",
            format!("dropout probability must be in [0, 1), got {p_dropout}"),
        ));
    }
    Ok(())
}

fn to_i32(arg: &'static str, value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::invalid(arg, format!("{value} does not fit the kernel's i32 field")))
}

fn row_head_strides<T: DeviceTensor>(t: &T) -> (u64, u64) {
    (t.stride(0) as u64, t.stride(1) as u64)
}

impl ForwardParams {
    /// Build a fresh forward record.
    pub fn new<T: DeviceTensor>(
        sizes: ProblemSizes,
        qkvo: [&T; 4],
        buffers: ForwardBuffers,
        scalars: AttentionScalars,
    ) -> Result<Self> {
        let mut params = Self::default();
        params.populate(sizes, qkvo, buffers, scalars)?;
        Ok(params)
    }

    /// Reset the record and fill it from `q`, `k`, `v`, `out` (in that order).
    ///
    /// Every field not assigned here ends up zero, whatever the record held before.
    pub fn populate<T: DeviceTensor>(
        &mut self,
        sizes: ProblemSizes,
        [q, k, v, out]: [&T; 4],
        buffers: ForwardBuffers,
        scalars: AttentionScalars,
    ) -> Result<()> {
        check_dropout(scalars.p_dropout)?;
        let dtype = q.dtype();

        let (q_row_stride, q_head_stride) = row_head_strides(q);
        let (k_row_stride, k_head_stride) = row_head_strides(k);
        let (v_row_stride, v_head_stride) = row_head_strides(v);
        let (o_row_stride, o_head_stride) = row_head_strides(out);

        let keep_prob = 1.0 - scalars.p_dropout;
        let (keep_threshold_u32, keep_threshold_u16) = keep_thresholds(keep_prob);
        let rp_dropout = 1.0 / keep_prob;

        let softmax_stride_in_bytes = [sizes.batch_size, sizes.num_heads, sizes.seqlen_k]
            .into_iter()
            .try_fold(dtype.size_in_bytes() as u64, |acc, n| acc.checked_mul(n as u64))
            .ok_or_else(|| {
                Error::invalid(
                    "max_seqlen_k",
                    format!(
                        "softmax stride of {} x {} x {} {dtype} overflows u64",
                        sizes.batch_size, sizes.num_heads, sizes.seqlen_k
                    ),
                )
            })?;

        *self = Self {
            q_ptr: q.ptr(),
            k_ptr: k.ptr(),
            v_ptr: v.ptr(),
            q_row_stride,
            k_row_stride,
            v_row_stride,
            q_head_stride,
            k_head_stride,
            v_head_stride,

            o_ptr: out.ptr(),
            o_row_stride,
            o_head_stride,

            o_tmp_ptr: buffers.o_tmp,
            o_tmp_row_stride: (sizes.num_heads * sizes.head_dim) as u64,
            o_tmp_head_stride: sizes.head_dim as u64,

            cu_seqlens_q: buffers.cu_seqlens_q,
            cu_seqlens_k: buffers.cu_seqlens_k,

            softmax_ptr: buffers.softmax,
            softmax_stride_in_bytes,
            softmax_lse_ptr: buffers.softmax_lse,
            block_mask_ptr: buffers.block_mask,

            b: to_i32("batch_size", sizes.batch_size)?,
            h: to_i32("num_heads", sizes.num_heads)?,
            seqlen_q: to_i32("max_seqlen_q", sizes.seqlen_q)?,
            seqlen_k: to_i32("max_seqlen_k", sizes.seqlen_k)?,
            d: to_i32("head_dim", sizes.head_dim)?,

            scale_softmax: scalars.softmax_scale,
            scale_softmax_packed: pack_scalar(scalars.softmax_scale, dtype),

            keep_prob,
            keep_threshold_u32,
            keep_threshold_u16,
            rp_dropout,
            scale_softmax_rp_dropout: rp_dropout * scalars.softmax_scale,
            scale_dropout_packed: pack_scalar(rp_dropout, dtype),

            is_causal: scalars.is_causal,
            is_bf16: dtype == DType::BF16,
            num_splits: to_i32("num_splits", scalars.num_splits as usize)?,

            philox: PhiloxState::default(),
        };
        Ok(())
    }

    pub fn is_dropout(&self) -> bool {
        self.keep_prob < 1.0
    }
}

impl BackwardParams {
    /// Build a fresh backward record.
    ///
    /// `tensors` is `[q, k, v, out, dq, dk, dv]`.
    pub fn new<T: DeviceTensor>(
        sizes: ProblemSizes,
        tensors: [&T; 7],
        buffers: BackwardBuffers,
        scalars: AttentionScalars,
    ) -> Result<Self> {
        let mut params = Self::default();
        params.populate(sizes, tensors, buffers, scalars)?;
        Ok(params)
    }

    /// Reset the record and fill it. The embedded forward record is built with
    /// a null forward scratch and no softmax dump.
    pub fn populate<T: DeviceTensor>(
        &mut self,
        sizes: ProblemSizes,
        [q, k, v, out, dq, dk, dv]: [&T; 7],
        buffers: BackwardBuffers,
        scalars: AttentionScalars,
    ) -> Result<()> {
        let fwd = ForwardParams::new(
            sizes,
            [q, k, v, out],
            ForwardBuffers {
                cu_seqlens_q: buffers.cu_seqlens_q,
                cu_seqlens_k: buffers.cu_seqlens_k,
                o_tmp: 0,
                softmax: 0,
                softmax_lse: buffers.softmax_lse,
                block_mask: buffers.block_mask,
            },
            scalars,
        )?;

        let (dq_row_stride, dq_head_stride) = row_head_strides(dq);
        let (dk_row_stride, dk_head_stride) = row_head_strides(dk);
        let (dv_row_stride, dv_head_stride) = row_head_strides(dv);

        *self = Self {
            fwd,
            dq_tmp_ptr: buffers.dq_tmp,
            dq_ptr: dq.ptr(),
            dk_ptr: dk.ptr(),
            dv_ptr: dv.ptr(),
            dq_row_stride,
            dk_row_stride,
            dv_row_stride,
            dq_head_stride,
            dk_head_stride,
            dv_head_stride,
            do_ptr: buffers.dout,
            dsoftmax_sum_ptr: buffers.dsoftmax_sum,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DeviceAllocator, HostAllocator, HostTensor};

    fn sizes() -> ProblemSizes {
        ProblemSizes {
            batch_size: 2,
            seqlen_q: 16,
            seqlen_k: 128,
            num_heads: 4,
            head_dim: 64,
        }
    }

    fn scalars(p_dropout: f32) -> AttentionScalars {
        AttentionScalars {
            p_dropout,
            softmax_scale: 0.125,
            is_causal: false,
            num_splits: 0,
        }
    }

    fn features(alloc: &HostAllocator, dtype: DType) -> HostTensor {
        alloc.empty(&[8, 4, 64], dtype).unwrap()
    }

    #[test]
    fn test_thresholds_floor() {
        assert_eq!(keep_thresholds(1.0), (u32::MAX, u16::MAX));
        assert_eq!(keep_thresholds(0.0), (0, 0));
        assert_eq!(keep_thresholds(0.5), (2_147_483_647, 32_767));
    }

    #[test]
    fn test_pack_scalar() {
        let packed = pack_scalar(1.0, DType::F16);
        assert_eq!(packed, 0x3C00_3C00);
        let packed = pack_scalar(1.0, DType::BF16);
        assert_eq!(packed, 0x3F80_3F80);
        assert_eq!(pack_scalar(0.5, DType::F32), 0.5f32.to_bits());
    }

    #[test]
    fn test_forward_scalars() {
        let alloc = HostAllocator::new(0);
        let t = features(&alloc, DType::BF16);
        let p = ForwardParams::new(
            sizes(),
            [&t, &t, &t, &t],
            ForwardBuffers::default(),
            scalars(0.2),
        )
        .unwrap();

        assert!((p.keep_prob - 0.8).abs() < 1e-7);
        assert!((p.rp_dropout - 1.25).abs() < 1e-6);
        assert!((p.scale_softmax_rp_dropout - 0.125 * 1.25).abs() < 1e-6);
        assert!(p.is_bf16);
        assert!(p.is_dropout());
        assert_eq!(p.q_row_stride, 256);
        assert_eq!(p.q_head_stride, 64);
        assert_eq!(p.o_tmp_row_stride, 256);
        assert_eq!(p.o_tmp_head_stride, 64);
        assert_eq!(p.softmax_stride_in_bytes, (2 * 4 * 128 * 2) as u64);
    }

    #[test]
    fn test_rejects_certain_dropout() {
        let alloc = HostAllocator::new(0);
        let t = features(&alloc, DType::F16);
        for p in [1.0, 1.5, -0.1, f32::NAN] {
            let err = ForwardParams::new(
                sizes(),
                [&t, &t, &t, &t],
                ForwardBuffers::default(),
                scalars(p),
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { arg: "p_dropout", .. }));
        }
    }

    #[test]
    fn test_softmax_stride_overflow() {
        let alloc = HostAllocator::new(0);
        let t = features(&alloc, DType::F16);
        let huge = ProblemSizes {
            batch_size: 1 << 40,
            seqlen_k: 1 << 30,
            ..sizes()
        };
        let err = ForwardParams::new(huge, [&t, &t, &t, &t], ForwardBuffers::default(), scalars(0.0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: "max_seqlen_k", .. }));
    }

    #[test]
    fn test_populate_clears_stale_fields() {
        let alloc = HostAllocator::new(0);
        let t = features(&alloc, DType::F16);
        let mut p = ForwardParams::new(
            sizes(),
            [&t, &t, &t, &t],
            ForwardBuffers {
                o_tmp: 0x1000,
                softmax: 0x2000,
                block_mask: 0x3000,
                ..Default::default()
            },
            scalars(0.1),
        )
        .unwrap();
        p.philox = PhiloxState { seed: 9, offset: 64 };

        p.populate(sizes(), [&t, &t, &t, &t], ForwardBuffers::default(), scalars(0.0))
            .unwrap();
        assert_eq!(p.o_tmp_ptr, 0);
        assert_eq!(p.softmax_ptr, 0);
        assert_eq!(p.block_mask_ptr, 0);
        assert_eq!(p.philox, PhiloxState::default());
        assert!(!p.is_dropout());
    }

    #[test]
    fn test_backward_scratch_in_named_field() {
        let alloc = HostAllocator::new(0);
        let t = features(&alloc, DType::F16);
        let p = BackwardParams::new(
            sizes(),
            [&t; 7],
            BackwardBuffers {
                dq_tmp: 0xABC0,
                dout: 0xD000,
                dsoftmax_sum: 0xE000,
                ..Default::default()
            },
            scalars(0.0),
        )
        .unwrap();

        assert_eq!(p.dq_tmp_ptr, 0xABC0);
        assert_eq!(p.fwd.o_tmp_ptr, 0);
        assert_eq!(p.fwd.softmax_ptr, 0);
        assert_eq!(p.do_ptr, 0xD000);
        assert_eq!(p.dsoftmax_sum_ptr, 0xE000);
        assert_eq!(p.dq_row_stride, 256);
    }
}

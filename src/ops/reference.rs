//! Host reference kernels
//!
//! A numerical implementation of [`FmhaKernels`] over [`HostTensor`](crate::tensor::HostTensor)
//! memory. It reads nothing but the execution record, so it checks that the
//! record alone describes the problem: pointers, strides, padded lengths,
//! scales, dropout thresholds and the Philox state.
//!
//! Attention is computed per (sequence, head, query row) without tiling.
//! Dropout draws one Philox sample per (row, key) pair from subsequence
//! `(b * h + head) * seqlen_q + row`, so forward and backward reproduce the
//! same mask from the same state.
//!
//! Execution holds the host device lock, so a launch never overlaps another
//! launch or an allocator operation.

use std::sync::Mutex;

use super::dispatch::{FmhaKernels, KernelEntry, LaunchParams, LaunchPhase, Variant};
use super::geometry::{BLOCK_SPARSE_KEY_TILE, Direction, QUERY_TILE};
use super::params::{BackwardParams, ForwardParams};
use super::rng::{PhiloxState, sample_u32};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::tensor::DevicePtr;
use crate::tensor::host::{device_lock, load_f32, store_f32};

/// Threads per CTA the block-sparse configure phase budgets random draws for.
const BLOCK_SPARSE_THREADS_PER_CTA: u64 = 128;

/// One kernel submission seen by [`ReferenceKernels`].
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub kernel: String,
    pub phase: LaunchPhase,
    pub num_splits: i32,
    pub philox: PhiloxState,
}

/// Reference implementation of the fused kernels. Submissions run to
/// completion before returning.
#[derive(Debug, Default)]
pub struct ReferenceKernels {
    bwd_splits: Option<u32>,
    launches: Mutex<Vec<LaunchRecord>>,
}

impl ReferenceKernels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split count the backward configure phase picks when the caller left
    /// `num_splits` at 0. Without it the configure phase picks 1.
    pub fn with_bwd_splits(mut self, splits: u32) -> Self {
        self.bwd_splits = Some(splits);
        self
    }

    /// Every submission so far, configure phases included.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn record(
        &self,
        kernel: &KernelEntry,
        phase: LaunchPhase,
        params: &ForwardParams,
    ) -> Result<()> {
        let mut log = self.launches.lock().map_err(|e| Error::KernelError {
            reason: format!("launch log poisoned: {e}"),
        })?;
        log.push(LaunchRecord {
            kernel: kernel.name.clone(),
            phase,
            num_splits: params.num_splits,
            philox: params.philox,
        });
        Ok(())
    }
}

impl FmhaKernels for ReferenceKernels {
    type Stream = ();

    fn reads_record_on_host(&self) -> bool {
        true
    }

    unsafe fn run_fwd(
        &self,
        kernel: &KernelEntry,
        launch: &mut LaunchParams<'_, ()>,
    ) -> Result<()> {
        check_kernel(kernel, &launch.params, Direction::Forward, false)?;
        self.record(kernel, LaunchPhase::Execute, &launch.params)?;
        let _device = device_lock();
        // SAFETY: forwarded from the caller.
        unsafe { forward(&launch.params) }
    }

    unsafe fn run_bwd(
        &self,
        kernel: &KernelEntry,
        params: &mut BackwardParams,
        _stream: &(),
        phase: LaunchPhase,
    ) -> Result<()> {
        check_kernel(kernel, &params.fwd, Direction::Backward, false)?;
        if phase == LaunchPhase::Configure && params.fwd.num_splits == 0 {
            params.fwd.num_splits = self.bwd_splits.unwrap_or(1) as i32;
        }
        self.record(kernel, phase, &params.fwd)?;
        match phase {
            LaunchPhase::Configure => Ok(()),
            LaunchPhase::Execute => {
                let _device = device_lock();
                // SAFETY: forwarded from the caller.
                unsafe { backward(params) }
            }
        }
    }

    unsafe fn run_fwd_block(
        &self,
        kernel: &KernelEntry,
        launch: &mut LaunchParams<'_, ()>,
        phase: LaunchPhase,
    ) -> Result<()> {
        check_kernel(kernel, &launch.params, Direction::Forward, true)?;
        if phase == LaunchPhase::Configure {
            let rows = launch.params.seqlen_q as u64;
            launch.elts_per_thread =
                (rows * BLOCK_SPARSE_KEY_TILE as u64).div_ceil(BLOCK_SPARSE_THREADS_PER_CTA);
        }
        self.record(kernel, phase, &launch.params)?;
        match phase {
            LaunchPhase::Configure => Ok(()),
            LaunchPhase::Execute => {
                let _device = device_lock();
                // SAFETY: forwarded from the caller.
                unsafe { forward(&launch.params) }
            }
        }
    }

    unsafe fn run_bwd_block(
        &self,
        kernel: &KernelEntry,
        params: &mut BackwardParams,
        _stream: &(),
    ) -> Result<()> {
        check_kernel(kernel, &params.fwd, Direction::Backward, true)?;
        self.record(kernel, LaunchPhase::Execute, &params.fwd)?;
        let _device = device_lock();
        // SAFETY: forwarded from the caller.
        unsafe { backward(params) }
    }
}

fn check_kernel(
    kernel: &KernelEntry,
    params: &ForwardParams,
    direction: Direction,
    block_sparse: bool,
) -> Result<()> {
    let is_block = kernel.key.variant == Variant::BlockSparse;
    if kernel.key.direction != direction || is_block != block_sparse {
        return Err(Error::KernelError {
            reason: format!("{kernel} cannot serve a {direction:?} launch"),
        });
    }
    if params.d as usize > kernel.key.tier.max_head_dim() {
        return Err(Error::KernelError {
            reason: format!(
                "{kernel} is compiled for head_dim <= {}, record has {}",
                kernel.key.tier.max_head_dim(),
                params.d
            ),
        });
    }
    if block_sparse && params.block_mask_ptr == 0 {
        return Err(Error::KernelError {
            reason: format!("{kernel} launched without a block mask"),
        });
    }
    Ok(())
}

/// Strided `[rows, heads, head_dim]` view of record memory.
#[derive(Clone, Copy)]
struct Rows {
    base: *mut u8,
    dtype: DType,
    row_stride: usize,
    head_stride: usize,
}

impl Rows {
    fn new(
        ptr: DevicePtr,
        dtype: DType,
        row_stride: u64,
        head_stride: u64,
        name: &str,
    ) -> Result<Self> {
        Ok(Self {
            base: non_null(ptr, name)?,
            dtype,
            row_stride: row_stride as usize,
            head_stride: head_stride as usize,
        })
    }

    fn index(&self, row: usize, head: usize, col: usize) -> usize {
        row * self.row_stride + head * self.head_stride + col
    }

    /// # Safety
    /// The record must describe live memory covering `(row, head, col)`.
    unsafe fn load(&self, row: usize, head: usize, col: usize) -> f32 {
        unsafe { load_f32(self.base, self.dtype, self.index(row, head, col)) }
    }

    unsafe fn store(&self, row: usize, head: usize, col: usize, value: f32) {
        unsafe { store_f32(self.base, self.dtype, self.index(row, head, col), value) }
    }

    unsafe fn row(&self, row: usize, head: usize, dim: usize) -> Vec<f32> {
        (0..dim).map(|c| unsafe { self.load(row, head, c) }).collect()
    }
}

fn non_null(ptr: DevicePtr, name: &str) -> Result<*mut u8> {
    if ptr == 0 {
        return Err(Error::KernelError {
            reason: format!("record has a null {name} pointer"),
        });
    }
    Ok(ptr as *mut u8)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Problem description decoded from a forward record.
struct Problem {
    batch_size: usize,
    num_heads: usize,
    head_dim: usize,
    seqlen_q: usize,
    seqlen_k: usize,
    cu_q: Vec<usize>,
    cu_k: Vec<usize>,
    scale: f32,
    is_causal: bool,
    block_mask: Option<Vec<i32>>,
    dropout: Option<(PhiloxState, u32, f32)>,
    dtype: DType,
}

impl Problem {
    /// # Safety
    /// Offsets and block mask in the record must be live and sized by it.
    unsafe fn from_record(params: &ForwardParams) -> Result<Self> {
        let batch_size = params.b as usize;
        let seqlen_q = params.seqlen_q as usize;
        let seqlen_k = params.seqlen_k as usize;
        // SAFETY: offsets hold batch_size + 1 entries.
        let (cu_q, cu_k) = unsafe {
            (
                read_offsets(params.cu_seqlens_q, batch_size, seqlen_q, "cu_seqlens_q")?,
                read_offsets(params.cu_seqlens_k, batch_size, seqlen_k, "cu_seqlens_k")?,
            )
        };
        let block_mask = if params.block_mask_ptr == 0 {
            None
        } else {
            let len = (seqlen_k / BLOCK_SPARSE_KEY_TILE) * (seqlen_q / QUERY_TILE);
            let base = params.block_mask_ptr as *const i32;
            // SAFETY: the mask was validated against the padded lengths in the record.
            Some((0..len).map(|i| unsafe { base.add(i).read() }).collect())
        };
        Ok(Self {
            batch_size,
            num_heads: params.h as usize,
            head_dim: params.d as usize,
            seqlen_q,
            seqlen_k,
            cu_q,
            cu_k,
            scale: params.scale_softmax,
            is_causal: params.is_causal,
            block_mask,
            dropout: params.is_dropout().then_some((
                params.philox,
                params.keep_threshold_u32,
                params.rp_dropout,
            )),
            dtype: if params.is_bf16 { DType::BF16 } else { DType::F16 },
        })
    }

    /// `(q_start, q_len, k_start, k_len)` of sequence `b`.
    fn sequence(&self, b: usize) -> (usize, usize, usize, usize) {
        (
            self.cu_q[b],
            self.cu_q[b + 1] - self.cu_q[b],
            self.cu_k[b],
            self.cu_k[b + 1] - self.cu_k[b],
        )
    }

    fn visible(&self, qi: usize, kj: usize) -> bool {
        if self.is_causal && kj > qi {
            return false;
        }
        match &self.block_mask {
            Some(mask) => {
                let tiles_q = self.seqlen_q / QUERY_TILE;
                mask[(kj / BLOCK_SPARSE_KEY_TILE) * tiles_q + qi / QUERY_TILE] != 0
            }
            None => true,
        }
    }

    /// Per-(batch, head, row) statistics slot.
    fn stat_index(&self, b: usize, h: usize, qi: usize) -> usize {
        (b * self.num_heads + h) * self.seqlen_q + qi
    }

    /// Dropout multiplier: `0` when dropped, `1 / keep_prob` when kept.
    fn keep_multiplier(&self, b: usize, h: usize, qi: usize, kj: usize) -> f32 {
        match self.dropout {
            Some((state, threshold, rp)) => {
                let subsequence = self.stat_index(b, h, qi) as u64;
                if sample_u32(state, subsequence, kj as u64) <= threshold {
                    rp
                } else {
                    0.0
                }
            }
            None => 1.0,
        }
    }

    fn scores(
        &self,
        q_row: &[f32],
        k: &Rows,
        k_start: usize,
        k_len: usize,
        h: usize,
        qi: usize,
    ) -> Vec<Option<f32>> {
        (0..k_len)
            .map(|kj| {
                self.visible(qi, kj).then(|| {
                    // SAFETY: k rows are inside the packed key range.
                    let k_row = unsafe { k.row(k_start + kj, h, self.head_dim) };
                    dot(q_row, &k_row) * self.scale
                })
            })
            .collect()
    }
}

/// # Safety
/// `ptr` must address at least `batch_size + 1` i32 values.
unsafe fn read_offsets(
    ptr: DevicePtr,
    batch_size: usize,
    max_len: usize,
    name: &str,
) -> Result<Vec<usize>> {
    let base = non_null(ptr, name)? as *const i32;
    // SAFETY: guaranteed by the caller.
    let raw: Vec<i32> = (0..=batch_size).map(|i| unsafe { base.add(i).read() }).collect();
    let mut offsets = Vec::with_capacity(raw.len());
    for (i, &value) in raw.iter().enumerate() {
        let value = usize::try_from(value).map_err(|_| Error::KernelError {
            reason: format!("{name}[{i}] = {value} is negative"),
        })?;
        if let Some(&prev) = offsets.last()
            && (value < prev || value - prev > max_len)
        {
            return Err(Error::KernelError {
                reason: format!(
                    "{name}: sequence {} does not fit padded length {max_len}",
                    i - 1
                ),
            });
        }
        offsets.push(value);
    }
    Ok(offsets)
}

/// # Safety
/// Same contract as [`FmhaKernels::run_fwd`], with the device lock held.
unsafe fn forward(params: &ForwardParams) -> Result<()> {
    // SAFETY: guaranteed by the caller.
    let p = unsafe { Problem::from_record(params)? };
    let q = Rows::new(params.q_ptr, p.dtype, params.q_row_stride, params.q_head_stride, "q")?;
    let k = Rows::new(params.k_ptr, p.dtype, params.k_row_stride, params.k_head_stride, "k")?;
    let v = Rows::new(params.v_ptr, p.dtype, params.v_row_stride, params.v_head_stride, "v")?;
    let o = Rows::new(params.o_ptr, p.dtype, params.o_row_stride, params.o_head_stride, "o")?;
    let o_tmp = match params.o_tmp_ptr {
        0 => None,
        ptr => Some(Rows::new(
            ptr,
            DType::F32,
            params.o_tmp_row_stride,
            params.o_tmp_head_stride,
            "o_tmp",
        )?),
    };
    let lse = non_null(params.softmax_lse_ptr, "softmax_lse")?;
    let softmax = (params.softmax_ptr != 0).then_some(params.softmax_ptr as *mut u8);

    for b in 0..p.batch_size {
        let (q_start, q_len, k_start, k_len) = p.sequence(b);
        for h in 0..p.num_heads {
            for qi in 0..q_len {
                // SAFETY: rows come from validated offsets into validated tensors.
                let q_row = unsafe { q.row(q_start + qi, h, p.head_dim) };
                let scores = p.scores(&q_row, &k, k_start, k_len, h, qi);

                let max_score = scores
                    .iter()
                    .flatten()
                    .fold(f32::NEG_INFINITY, |m, &s| m.max(s));
                let sum_exp: f32 = scores
                    .iter()
                    .flatten()
                    .map(|&s| (s - max_score).exp())
                    .sum();
                let row_lse = if sum_exp > 0.0 {
                    max_score + sum_exp.ln()
                } else {
                    f32::NEG_INFINITY
                };

                let mut acc = vec![0.0f32; p.head_dim];
                for (kj, score) in scores.iter().enumerate() {
                    let prob = score.map_or(0.0, |s| (s - row_lse).exp());
                    let keep = if score.is_some() {
                        p.keep_multiplier(b, h, qi, kj)
                    } else {
                        0.0
                    };
                    if let Some(dump) = softmax {
                        // Dropped entries are stored negated.
                        let value = if keep == 0.0 { -prob } else { prob };
                        let index = p.stat_index(b, h, qi) * p.seqlen_k + kj;
                        // SAFETY: the dump covers [b, h, seqlen_q, seqlen_k].
                        unsafe { store_f32(dump, p.dtype, index, value) };
                    }
                    if prob * keep == 0.0 {
                        continue;
                    }
                    // SAFETY: as above.
                    let v_row = unsafe { v.row(k_start + kj, h, p.head_dim) };
                    for (a, x) in acc.iter_mut().zip(&v_row) {
                        *a += prob * keep * x;
                    }
                }

                for (c, &value) in acc.iter().enumerate() {
                    // SAFETY: as above.
                    unsafe {
                        o.store(q_start + qi, h, c, value);
                        if let Some(tmp) = &o_tmp {
                            tmp.store(q_start + qi, h, c, value);
                        }
                    }
                }
                // SAFETY: statistics are [b, h, seqlen_q] f32.
                unsafe { store_f32(lse, DType::F32, p.stat_index(b, h, qi), row_lse) };
            }
        }
    }
    Ok(())
}

/// # Safety
/// Same contract as [`FmhaKernels::run_bwd`], with the device lock held.
unsafe fn backward(params: &BackwardParams) -> Result<()> {
    let fwd = &params.fwd;
    // SAFETY: guaranteed by the caller.
    let p = unsafe { Problem::from_record(fwd)? };
    let row_stride = (p.num_heads * p.head_dim) as u64;
    let head_stride = p.head_dim as u64;

    let q = Rows::new(fwd.q_ptr, p.dtype, fwd.q_row_stride, fwd.q_head_stride, "q")?;
    let k = Rows::new(fwd.k_ptr, p.dtype, fwd.k_row_stride, fwd.k_head_stride, "k")?;
    let v = Rows::new(fwd.v_ptr, p.dtype, fwd.v_row_stride, fwd.v_head_stride, "v")?;
    let o = Rows::new(fwd.o_ptr, p.dtype, fwd.o_row_stride, fwd.o_head_stride, "o")?;
    // dout is contiguous
    let d_o = Rows::new(params.do_ptr, p.dtype, row_stride, head_stride, "do")?;
    let dq = Rows::new(
        params.dq_ptr,
        p.dtype,
        params.dq_row_stride,
        params.dq_head_stride,
        "dq",
    )?;
    let dk = Rows::new(
        params.dk_ptr,
        p.dtype,
        params.dk_row_stride,
        params.dk_head_stride,
        "dk",
    )?;
    let dv = Rows::new(
        params.dv_ptr,
        p.dtype,
        params.dv_row_stride,
        params.dv_head_stride,
        "dv",
    )?;
    let dq_tmp = if fwd.num_splits > 1 {
        Some(Rows::new(
            params.dq_tmp_ptr,
            DType::F32,
            row_stride,
            head_stride,
            "dq_tmp",
        )?)
    } else {
        None
    };
    let lse = non_null(fwd.softmax_lse_ptr, "softmax_lse")?;
    let dsoftmax_sum = non_null(params.dsoftmax_sum_ptr, "dsoftmax_sum")?;

    for b in 0..p.batch_size {
        let (q_start, q_len, k_start, k_len) = p.sequence(b);
        for h in 0..p.num_heads {
            let mut dk_acc = vec![vec![0.0f32; p.head_dim]; k_len];
            let mut dv_acc = vec![vec![0.0f32; p.head_dim]; k_len];

            for qi in 0..q_len {
                let stat = p.stat_index(b, h, qi);
                // SAFETY: rows come from validated offsets into validated tensors;
                // statistics are [b, h, seqlen_q] f32.
                let (q_row, o_row, do_row, row_lse) = unsafe {
                    (
                        q.row(q_start + qi, h, p.head_dim),
                        o.row(q_start + qi, h, p.head_dim),
                        d_o.row(q_start + qi, h, p.head_dim),
                        load_f32(lse, DType::F32, stat),
                    )
                };
                let d_sum = dot(&do_row, &o_row);
                // SAFETY: as above.
                unsafe { store_f32(dsoftmax_sum, DType::F32, stat, d_sum) };

                let scores = p.scores(&q_row, &k, k_start, k_len, h, qi);
                let mut dq_acc = vec![0.0f32; p.head_dim];
                for (kj, score) in scores.iter().enumerate() {
                    let Some(score) = score else { continue };
                    let prob = (score - row_lse).exp();
                    let keep = p.keep_multiplier(b, h, qi, kj);
                    // SAFETY: as above.
                    let (k_row, v_row) = unsafe {
                        (
                            k.row(k_start + kj, h, p.head_dim),
                            v.row(k_start + kj, h, p.head_dim),
                        )
                    };

                    let grad_prob = keep * dot(&do_row, &v_row);
                    let grad_score = prob * (grad_prob - d_sum);
                    for c in 0..p.head_dim {
                        dv_acc[kj][c] += prob * keep * do_row[c];
                        dq_acc[c] += p.scale * grad_score * k_row[c];
                        dk_acc[kj][c] += p.scale * grad_score * q_row[c];
                    }
                }

                for (c, &value) in dq_acc.iter().enumerate() {
                    // SAFETY: as above.
                    unsafe {
                        match &dq_tmp {
                            Some(tmp) => {
                                let prev = tmp.load(q_start + qi, h, c);
                                tmp.store(q_start + qi, h, c, prev + value);
                            }
                            None => dq.store(q_start + qi, h, c, value),
                        }
                    }
                }
            }

            for kj in 0..k_len {
                for c in 0..p.head_dim {
                    // SAFETY: as above.
                    unsafe {
                        dk.store(k_start + kj, h, c, dk_acc[kj][c]);
                        dv.store(k_start + kj, h, c, dv_acc[kj][c]);
                    }
                }
            }
        }
    }
    Ok(())
}

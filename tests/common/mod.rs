//! Shared helpers for fmha integration tests.
#![allow(dead_code)]

use fmha::{
    BwdArgs, ComputeCapability, DType, DeviceTensor, Fmha, FmhaConfig, FwdArgs,
    HostAllocator, HostTensor, ReferenceKernels,
};

pub type TestFmha = Fmha<HostAllocator, ReferenceKernels>;

pub fn setup(capability: ComputeCapability) -> TestFmha {
    setup_with(
        HostAllocator::new(0),
        ReferenceKernels::new(),
        capability,
        FmhaConfig::default(),
    )
}

pub fn setup_with(
    allocator: HostAllocator,
    kernels: ReferenceKernels,
    capability: ComputeCapability,
    config: FmhaConfig,
) -> TestFmha {
    Fmha::new(allocator, kernels, (), capability, config).unwrap()
}

/// Deterministic pseudo-random values using sin-based pattern.
pub fn det_data(n: usize, phase: f32) -> Vec<f32> {
    (0..n)
        .map(|i| ((i as f32 + phase) * 0.1).sin() * 0.5)
        .collect()
}

pub fn offsets(lens: &[usize]) -> Vec<i32> {
    let mut out = vec![0i32];
    for &len in lens {
        out.push(out[out.len() - 1] + len as i32);
    }
    out
}

/// Packed batch of Q/K/V/O plus offsets, resident on the emulated device.
pub struct Batch {
    pub q: HostTensor,
    pub k: HostTensor,
    pub v: HostTensor,
    pub out: HostTensor,
    pub cu_seqlens_q: HostTensor,
    pub cu_seqlens_k: HostTensor,
    pub seqlens_q: Vec<usize>,
    pub seqlens_k: Vec<usize>,
    pub num_heads: usize,
    pub head_dim: usize,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub dtype: DType,
}

impl Batch {
    pub fn new(
        alloc: &HostAllocator,
        seqlens_q: &[usize],
        seqlens_k: &[usize],
        num_heads: usize,
        head_dim: usize,
        dtype: DType,
    ) -> Self {
        let total_q: usize = seqlens_q.iter().sum();
        let total_k: usize = seqlens_k.iter().sum();
        let row = num_heads * head_dim;
        let cu_q = offsets(seqlens_q);
        let cu_k = offsets(seqlens_k);
        let q_shape = [total_q, num_heads, head_dim];
        let k_shape = [total_k, num_heads, head_dim];
        Self {
            q: alloc.upload_f32(&det_data(total_q * row, 0.0), &q_shape, dtype),
            k: alloc.upload_f32(&det_data(total_k * row, 3.0), &k_shape, dtype),
            v: alloc.upload_f32(&det_data(total_k * row, 7.0), &k_shape, dtype),
            out: alloc.upload_f32(&vec![0.0; total_q * row], &q_shape, dtype),
            cu_seqlens_q: alloc.upload_i32(&cu_q, &[cu_q.len()]),
            cu_seqlens_k: alloc.upload_i32(&cu_k, &[cu_k.len()]),
            seqlens_q: seqlens_q.to_vec(),
            seqlens_k: seqlens_k.to_vec(),
            num_heads,
            head_dim,
            max_seqlen_q: seqlens_q.iter().copied().max().unwrap_or(0),
            max_seqlen_k: seqlens_k.iter().copied().max().unwrap_or(0),
            dtype,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.seqlens_q.len()
    }

    pub fn total_q(&self) -> usize {
        self.seqlens_q.iter().sum()
    }

    pub fn total_k(&self) -> usize {
        self.seqlens_k.iter().sum()
    }

    pub fn scale(&self) -> f32 {
        (self.head_dim as f32).sqrt().recip()
    }

    pub fn fwd_args(&self) -> FwdArgs<'_, HostTensor> {
        FwdArgs {
            q: &self.q,
            k: &self.k,
            v: &self.v,
            out: &self.out,
            cu_seqlens_q: &self.cu_seqlens_q,
            cu_seqlens_k: &self.cu_seqlens_k,
            max_seqlen_q: self.max_seqlen_q,
            max_seqlen_k: self.max_seqlen_k,
            p_dropout: 0.0,
            softmax_scale: self.scale(),
            zero_tensors: false,
            is_causal: false,
            return_softmax: false,
            num_splits: 0,
            generator: None,
        }
    }

    pub fn dout(&self, alloc: &HostAllocator) -> HostTensor {
        let n = self.total_q() * self.num_heads * self.head_dim;
        alloc.upload_f32(
            &det_data(n, 11.0),
            &[self.total_q(), self.num_heads, self.head_dim],
            self.dtype,
        )
    }

    /// Gradient buffers pre-filled with `value`.
    pub fn grads(&self, alloc: &HostAllocator, value: f32) -> Grads {
        let q_shape = [self.total_q(), self.num_heads, self.head_dim];
        let k_shape = [self.total_k(), self.num_heads, self.head_dim];
        let fill = |shape: &[usize]| {
            alloc.upload_f32(&vec![value; shape.iter().product()], shape, self.dtype)
        };
        Grads {
            dq: fill(&q_shape),
            dk: fill(&k_shape),
            dv: fill(&k_shape),
        }
    }

    pub fn bwd_args<'a>(
        &'a self,
        dout: &'a HostTensor,
        softmax_lse: &'a HostTensor,
        grads: &'a Grads,
    ) -> BwdArgs<'a, HostTensor> {
        BwdArgs {
            dout,
            q: &self.q,
            k: &self.k,
            v: &self.v,
            out: &self.out,
            softmax_lse,
            dq: &grads.dq,
            dk: &grads.dk,
            dv: &grads.dv,
            cu_seqlens_q: &self.cu_seqlens_q,
            cu_seqlens_k: &self.cu_seqlens_k,
            max_seqlen_q: self.max_seqlen_q,
            max_seqlen_k: self.max_seqlen_k,
            p_dropout: 0.0,
            softmax_scale: self.scale(),
            zero_tensors: false,
            is_causal: false,
            num_splits: 0,
            generator: None,
        }
    }

    /// Per-row statistics of `[b, h, padded_q]` in (batch, head, row) order,
    /// padding rows dropped.
    pub fn valid_rows(&self, stats: &HostTensor) -> Vec<f32> {
        let padded = stats.shape()[2];
        let values = stats.to_f32_vec();
        let mut out = Vec::new();
        for (b, &len) in self.seqlens_q.iter().enumerate() {
            for h in 0..self.num_heads {
                let base = (b * self.num_heads + h) * padded;
                out.extend_from_slice(&values[base..base + len]);
            }
        }
        out
    }

    /// Statistics entries past each sequence's true length.
    pub fn padding_rows(&self, stats: &HostTensor) -> Vec<f32> {
        let padded = stats.shape()[2];
        let values = stats.to_f32_vec();
        let mut out = Vec::new();
        for (b, &len) in self.seqlens_q.iter().enumerate() {
            for h in 0..self.num_heads {
                let base = (b * self.num_heads + h) * padded;
                out.extend_from_slice(&values[base + len..base + padded]);
            }
        }
        out
    }
}

pub struct Grads {
    pub dq: HostTensor,
    pub dk: HostTensor,
    pub dv: HostTensor,
}

pub fn dense(_qi: usize, _kj: usize) -> bool {
    true
}

pub fn causal(qi: usize, kj: usize) -> bool {
    kj <= qi
}

/// Naive f64 attention results on a packed batch.
pub struct Reference {
    /// `[total_q, h, d]`
    pub out: Vec<f32>,
    /// (batch, head, row) order, as [`Batch::valid_rows`]
    pub lse: Vec<f32>,
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
    /// Row sums of `dout * out`, (batch, head, row) order
    pub softmax_d: Vec<f32>,
}

/// Reference softmax(scale Q K^T) V and its gradients for `dout`, computed
/// per (sequence, head) in matrix form. `visible(qi, kj)` masks scores.
pub fn reference_attention(
    batch: &Batch,
    dout: &[f32],
    visible: &dyn Fn(usize, usize) -> bool,
) -> Reference {
    let (h_n, d_n) = (batch.num_heads, batch.head_dim);
    let q = batch.q.to_f32_vec();
    let k = batch.k.to_f32_vec();
    let v = batch.v.to_f32_vec();
    let scale = f64::from(batch.scale());
    let at = |data: &[f32], row: usize, h: usize, c: usize| {
        f64::from(data[(row * h_n + h) * d_n + c])
    };

    let mut out = vec![0.0f32; batch.total_q() * h_n * d_n];
    let mut dq = vec![0.0f32; out.len()];
    let mut dk = vec![0.0f32; batch.total_k() * h_n * d_n];
    let mut dv = vec![0.0f32; dk.len()];
    let mut lse = Vec::new();
    let mut softmax_d = Vec::new();

    let cu_q = offsets(&batch.seqlens_q);
    let cu_k = offsets(&batch.seqlens_k);
    for b in 0..batch.batch_size() {
        let (q0, lq) = (cu_q[b] as usize, batch.seqlens_q[b]);
        let (k0, lk) = (cu_k[b] as usize, batch.seqlens_k[b]);
        for h in 0..h_n {
            // P = softmax(S)
            let mut p = vec![vec![0.0f64; lk]; lq];
            for i in 0..lq {
                let s: Vec<Option<f64>> = (0..lk)
                    .map(|j| {
                        visible(i, j).then(|| {
                            let dot: f64 = (0..d_n)
                                .map(|c| at(&q, q0 + i, h, c) * at(&k, k0 + j, h, c))
                                .sum();
                            dot * scale
                        })
                    })
                    .collect();
                let m = s.iter().flatten().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
                let z: f64 = s.iter().flatten().map(|x| (x - m).exp()).sum();
                lse.push((m + z.ln()) as f32);
                for j in 0..lk {
                    p[i][j] = s[j].map_or(0.0, |x| (x - m).exp() / z);
                }
            }

            // O = P V, D = rowsum(dO * O)
            let mut o = vec![vec![0.0f64; d_n]; lq];
            for i in 0..lq {
                for c in 0..d_n {
                    o[i][c] = (0..lk).map(|j| p[i][j] * at(&v, k0 + j, h, c)).sum();
                    out[((q0 + i) * h_n + h) * d_n + c] = o[i][c] as f32;
                }
            }
            let d_sum: Vec<f64> = (0..lq)
                .map(|i| (0..d_n).map(|c| at(dout, q0 + i, h, c) * o[i][c]).sum())
                .collect();
            softmax_d.extend(d_sum.iter().map(|&x| x as f32));

            // dS = P * (dO V^T - D)
            let mut ds = vec![vec![0.0f64; lk]; lq];
            for i in 0..lq {
                for j in 0..lk {
                    let dp: f64 = (0..d_n)
                        .map(|c| at(dout, q0 + i, h, c) * at(&v, k0 + j, h, c))
                        .sum();
                    ds[i][j] = p[i][j] * (dp - d_sum[i]);
                }
            }

            for c in 0..d_n {
                for i in 0..lq {
                    let g: f64 = (0..lk).map(|j| ds[i][j] * at(&k, k0 + j, h, c)).sum();
                    dq[((q0 + i) * h_n + h) * d_n + c] = (scale * g) as f32;
                }
                for j in 0..lk {
                    let gk: f64 = (0..lq).map(|i| ds[i][j] * at(&q, q0 + i, h, c)).sum();
                    let gv: f64 = (0..lq).map(|i| p[i][j] * at(dout, q0 + i, h, c)).sum();
                    dk[((k0 + j) * h_n + h) * d_n + c] = (scale * gk) as f32;
                    dv[((k0 + j) * h_n + h) * d_n + c] = gv as f32;
                }
            }
        }
    }

    Reference {
        out,
        lse,
        dq,
        dk,
        dv,
        softmax_d,
    }
}

pub fn assert_close(a: &[f32], b: &[f32], op: &str, rtol: f32, atol: f32) {
    assert_eq!(
        a.len(),
        b.len(),
        "{}: length mismatch: {} vs {}",
        op,
        a.len(),
        b.len()
    );
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        if diff > tol || diff.is_nan() {
            panic!(
                "{} at index {}: {} vs {} (diff={}, tol={})",
                op, i, x, y, diff, tol
            );
        }
    }
}

/// Tolerance for half-precision storage of f32-accumulated results.
pub fn assert_close_half(a: &[f32], b: &[f32], op: &str) {
    assert_close(a, b, op, 1e-2, 2e-3);
}

//! Fused attention call surface
//!
//! [`Fmha`] wires validation, geometry, record building, scratch allocation,
//! dropout state and dispatch together behind four entry points.
//!
//! # Layout contract
//!
//! - Feature tensors: `[total_rows, num_heads, head_dim]`, innermost stride 1
//! - Offsets: i32 `[batch_size + 1]`, contiguous, `offsets[0] == 0`
//! - `max_seqlen_*` are upper bounds of the per-sequence lengths, not
//!   necessarily tight
//! - Log-sum-exp: f32 `[batch_size, num_heads, padded_q]`

use std::sync::Arc;

use super::dispatch::{FmhaKernels, KernelTable, LaunchParams, LaunchPhase, Variant};
use super::geometry::{self, Direction, Geometry};
use super::params::{
    AttentionScalars, BackwardBuffers, BackwardParams, ForwardBuffers, ForwardParams, ProblemSizes,
};
use super::rng::{self, PhiloxGenerator, RandomGenerator};
use super::scratch::{self, BufferSpec, PackedDims};
use super::validate::{self, ProblemShape};
use crate::config::FmhaConfig;
use crate::device::ComputeCapability;
use crate::error::{Error, Result};
use crate::tensor::{DeviceAllocator, DevicePtr, DeviceTensor};

/// Arguments of [`Fmha::mha_fwd`]. `out` is written in place.
pub struct FwdArgs<'a, T> {
    pub q: &'a T,
    pub k: &'a T,
    pub v: &'a T,
    pub out: &'a T,
    pub cu_seqlens_q: &'a T,
    pub cu_seqlens_k: &'a T,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub p_dropout: f32,
    pub softmax_scale: f32,
    pub zero_tensors: bool,
    pub is_causal: bool,
    /// Dump the (dropped-out) attention matrix. Debug only, expensive.
    pub return_softmax: bool,
    /// `0` lets the kernel decide
    pub num_splits: u32,
    /// Overrides the context's default generator
    pub generator: Option<&'a dyn RandomGenerator>,
}

/// Arguments of [`Fmha::mha_bwd`]. `dq`, `dk`, `dv` are written in place.
pub struct BwdArgs<'a, T> {
    pub dout: &'a T,
    pub q: &'a T,
    pub k: &'a T,
    pub v: &'a T,
    pub out: &'a T,
    /// Statistics returned by the matching forward call
    pub softmax_lse: &'a T,
    pub dq: &'a T,
    pub dk: &'a T,
    pub dv: &'a T,
    pub cu_seqlens_q: &'a T,
    pub cu_seqlens_k: &'a T,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub p_dropout: f32,
    pub softmax_scale: f32,
    pub zero_tensors: bool,
    pub is_causal: bool,
    pub num_splits: u32,
    pub generator: Option<&'a dyn RandomGenerator>,
}

/// Arguments of [`Fmha::mha_fwd_block`]. The output is allocated.
pub struct BlockFwdArgs<'a, T> {
    pub q: &'a T,
    pub k: &'a T,
    pub v: &'a T,
    pub cu_seqlens_q: &'a T,
    pub cu_seqlens_k: &'a T,
    /// i32 `[padded_k / 256, padded_q / 16]`; non-zero tiles are computed
    pub blockmask: &'a T,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub p_dropout: f32,
    pub softmax_scale: f32,
    pub is_causal: bool,
    pub return_softmax: bool,
    pub generator: Option<&'a dyn RandomGenerator>,
}

/// Arguments of [`Fmha::mha_bwd_block`].
pub struct BlockBwdArgs<'a, T> {
    pub dout: &'a T,
    pub q: &'a T,
    pub k: &'a T,
    pub v: &'a T,
    pub out: &'a T,
    pub softmax_lse: &'a T,
    pub dq: &'a T,
    pub dk: &'a T,
    pub dv: &'a T,
    pub cu_seqlens_q: &'a T,
    pub cu_seqlens_k: &'a T,
    pub blockmask: &'a T,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub p_dropout: f32,
    pub softmax_scale: f32,
    pub is_causal: bool,
    /// The caller is expected to restore the generator state afterwards
    pub generator: Option<&'a dyn RandomGenerator>,
}

#[derive(Debug, Clone)]
pub struct FwdOutput<T> {
    /// f32 `[batch_size, num_heads, padded_q]`
    pub softmax_lse: T,
    /// `[batch_size, num_heads, padded_q, padded_k]` in the input dtype
    pub softmax: Option<T>,
}

#[derive(Debug, Clone)]
pub struct BlockFwdOutput<T> {
    pub out: T,
    pub softmax_lse: T,
    pub softmax: Option<T>,
}

#[derive(Debug, Clone)]
pub struct BwdOutput<T> {
    pub dq: T,
    pub dk: T,
    pub dv: T,
    /// f32 row sums of `dout * out`, `[batch_size, num_heads, padded_q]`
    pub softmax_d: T,
}

/// Fused multi-head attention context.
///
/// Holds the allocator, the kernel backend with the stream it submits to, the
/// device generation and the default dropout generator. Entry points take
/// `&self`; the generator is the only state shared between calls.
pub struct Fmha<A: DeviceAllocator, K: FmhaKernels> {
    allocator: A,
    kernels: K,
    stream: K::Stream,
    capability: ComputeCapability,
    table: KernelTable,
    generator: Arc<dyn RandomGenerator>,
    config: FmhaConfig,
}

impl<A: DeviceAllocator, K: FmhaKernels> Fmha<A, K> {
    pub fn new(
        allocator: A,
        kernels: K,
        stream: K::Stream,
        capability: ComputeCapability,
        config: FmhaConfig,
    ) -> Result<Self> {
        config.validate()?;
        let table = KernelTable::builtin();
        table.check_total()?;
        tracing::debug!(
            %capability,
            kernels = table.len(),
            seed = config.seed,
            "fmha context ready"
        );
        Ok(Self {
            allocator,
            kernels,
            stream,
            capability,
            table,
            generator: Arc::new(PhiloxGenerator::new(config.seed)),
            config,
        })
    }

    /// Replace the default dropout generator.
    pub fn with_generator(mut self, generator: Arc<dyn RandomGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn kernels(&self) -> &K {
        &self.kernels
    }

    pub fn capability(&self) -> ComputeCapability {
        self.capability
    }

    pub fn config(&self) -> &FmhaConfig {
        &self.config
    }

    pub fn generator(&self) -> &Arc<dyn RandomGenerator> {
        &self.generator
    }

    /// Dense or causal forward pass.
    pub fn mha_fwd(&self, args: &FwdArgs<'_, A::Tensor>) -> Result<FwdOutput<A::Tensor>> {
        let shape = validate::validate_forward(self.capability, args)?;
        let geometry = geometry::resolve(
            args.max_seqlen_q,
            args.max_seqlen_k,
            shape.head_dim,
            self.capability,
            Direction::Forward,
        );
        self.check_offsets(
            args.cu_seqlens_q,
            args.cu_seqlens_k,
            &shape,
            args.max_seqlen_q,
            args.max_seqlen_k,
        )?;
        let variant = validate::dense_variant(args.is_causal);
        let kernel = self.table.route(shape.head_dim, variant, Direction::Forward)?;

        let dtype = args.q.dtype();
        let plan = scratch::plan_forward(
            packed_dims(&shape),
            &geometry,
            dtype,
            args.return_softmax,
            args.zero_tensors,
        );
        plan.size_in_bytes()?;
        if let Some(softmax) = &plan.softmax {
            tracing::warn!(
                bytes = softmax.size_in_bytes()?,
                "softmax dump requested; debug path"
            );
        }

        let o_tmp = self.allocate_opt(plan.o_tmp.as_ref())?;
        let softmax_lse = plan.softmax_lse.allocate(&self.allocator)?;
        let softmax = self.allocate_opt(plan.softmax.as_ref())?;
        if plan.zero_out {
            self.allocator.fill(args.out, 0.0)?;
        }

        let params = ForwardParams::new(
            problem_sizes(&shape, &geometry),
            [args.q, args.k, args.v, args.out],
            ForwardBuffers {
                cu_seqlens_q: args.cu_seqlens_q.ptr(),
                cu_seqlens_k: args.cu_seqlens_k.ptr(),
                o_tmp: ptr_or_null(o_tmp.as_ref()),
                softmax: ptr_or_null(softmax.as_ref()),
                softmax_lse: softmax_lse.ptr(),
                block_mask: 0,
            },
            AttentionScalars {
                p_dropout: args.p_dropout,
                softmax_scale: args.softmax_scale,
                is_causal: args.is_causal,
                num_splits: args.num_splits,
            },
        )?;
        let mut launch = LaunchParams {
            is_dropout: params.is_dropout(),
            params,
            stream: &self.stream,
            return_softmax: args.return_softmax,
            elts_per_thread: 0,
        };

        let counter_offset = self.dense_counter_offset(&shape);
        if let Some(state) = rng::acquire(
            self.generator_for(args.generator),
            launch.is_dropout,
            counter_offset,
        )? {
            launch.params.philox = state;
        }

        // SAFETY: the record points at validated tensors and at scratch sized
        // from the same geometry; offsets are checked when the kernels read
        // them on the host.
        unsafe { self.kernels.run_fwd(kernel, &mut launch)? };
        Ok(FwdOutput {
            softmax_lse,
            softmax,
        })
    }

    /// Dense or causal backward pass.
    pub fn mha_bwd(&self, args: &BwdArgs<'_, A::Tensor>) -> Result<BwdOutput<A::Tensor>> {
        let shape = validate::validate_backward(self.capability, args)?;
        let geometry = geometry::resolve(
            args.max_seqlen_q,
            args.max_seqlen_k,
            shape.head_dim,
            self.capability,
            Direction::Backward,
        );
        validate::check_softmax_lse(args.softmax_lse, &shape, &geometry)?;
        self.check_offsets(
            args.cu_seqlens_q,
            args.cu_seqlens_k,
            &shape,
            args.max_seqlen_q,
            args.max_seqlen_k,
        )?;
        let variant = validate::dense_variant(args.is_causal);
        let kernel = self.table.route(shape.head_dim, variant, Direction::Backward)?;

        // Forward may have used a different key tile, hence a different padded length.
        let softmax_lse = self.allocator.narrow(args.softmax_lse, 2, geometry.padded_q)?;

        let dims = packed_dims(&shape);
        let plan = scratch::plan_backward(dims, &geometry, args.zero_tensors);
        plan.size_in_bytes()?;
        let mut dq_tmp = self.allocate_opt(plan.dq_tmp.as_ref())?;
        let softmax_d = plan.softmax_d.allocate(&self.allocator)?;
        if plan.zero_grads {
            for grad in [args.dq, args.dk, args.dv] {
                self.allocator.fill(grad, 0.0)?;
            }
        }

        let mut params = BackwardParams::new(
            problem_sizes(&shape, &geometry),
            [args.q, args.k, args.v, args.out, args.dq, args.dk, args.dv],
            BackwardBuffers {
                cu_seqlens_q: args.cu_seqlens_q.ptr(),
                cu_seqlens_k: args.cu_seqlens_k.ptr(),
                dq_tmp: ptr_or_null(dq_tmp.as_ref()),
                dout: args.dout.ptr(),
                softmax_lse: softmax_lse.ptr(),
                dsoftmax_sum: softmax_d.ptr(),
                block_mask: 0,
            },
            AttentionScalars {
                p_dropout: args.p_dropout,
                softmax_scale: args.softmax_scale,
                is_causal: args.is_causal,
                num_splits: args.num_splits,
            },
        )?;

        // SAFETY: as in `mha_fwd`.
        unsafe {
            self.kernels
                .run_bwd(kernel, &mut params, &self.stream, LaunchPhase::Configure)?
        };

        let split = params.fwd.num_splits > 1;
        if split {
            match &dq_tmp {
                Some(existing) => self.allocator.fill(existing, 0.0)?,
                None => {
                    let fresh = scratch::split_dq_scratch(dims).allocate(&self.allocator)?;
                    params.dq_tmp_ptr = fresh.ptr();
                    dq_tmp = Some(fresh);
                }
            }
            tracing::debug!(
                num_splits = params.fwd.num_splits,
                "backward accumulates dq in f32 scratch"
            );
        }

        let counter_offset = self.dense_counter_offset(&shape);
        if let Some(state) = rng::acquire(
            self.generator_for(args.generator),
            params.fwd.is_dropout(),
            counter_offset,
        )? {
            params.fwd.philox = state;
        }

        // SAFETY: as above; split scratch is allocated when num_splits > 1.
        unsafe {
            self.kernels
                .run_bwd(kernel, &mut params, &self.stream, LaunchPhase::Execute)?
        };

        if split && let Some(scratch) = &dq_tmp {
            self.allocator.copy(args.dq, scratch)?;
        }

        Ok(BwdOutput {
            dq: args.dq.clone(),
            dk: args.dk.clone(),
            dv: args.dv.clone(),
            softmax_d,
        })
    }

    /// Block-sparse forward pass.
    pub fn mha_fwd_block(
        &self,
        args: &BlockFwdArgs<'_, A::Tensor>,
    ) -> Result<BlockFwdOutput<A::Tensor>> {
        let shape = validate::validate_block_forward(self.capability, args)?;
        let geometry = geometry::resolve_block_sparse(args.max_seqlen_q, args.max_seqlen_k);
        validate::check_block_mask(args.blockmask, &geometry)?;
        self.check_offsets(
            args.cu_seqlens_q,
            args.cu_seqlens_k,
            &shape,
            args.max_seqlen_q,
            args.max_seqlen_k,
        )?;
        let kernel = self
            .table
            .route(shape.head_dim, Variant::BlockSparse, Direction::Forward)?;

        let plan = scratch::plan_block_forward(
            packed_dims(&shape),
            &geometry,
            args.q.dtype(),
            args.return_softmax,
        );
        plan.size_in_bytes()?;
        if let Some(softmax) = &plan.softmax {
            tracing::warn!(
                bytes = softmax.size_in_bytes()?,
                "softmax dump requested; debug path"
            );
        }

        let out = self
            .allocate_opt(plan.out.as_ref())?
            .ok_or_else(|| Error::AllocationError {
                reason: "block-sparse forward plan has no output buffer".into(),
            })?;
        let o_tmp = self.allocate_opt(plan.o_tmp.as_ref())?;
        let softmax_lse = plan.softmax_lse.allocate(&self.allocator)?;
        let softmax = self.allocate_opt(plan.softmax.as_ref())?;

        let params = ForwardParams::new(
            problem_sizes(&shape, &geometry),
            [args.q, args.k, args.v, &out],
            ForwardBuffers {
                cu_seqlens_q: args.cu_seqlens_q.ptr(),
                cu_seqlens_k: args.cu_seqlens_k.ptr(),
                o_tmp: ptr_or_null(o_tmp.as_ref()),
                softmax: ptr_or_null(softmax.as_ref()),
                softmax_lse: softmax_lse.ptr(),
                block_mask: args.blockmask.ptr(),
            },
            AttentionScalars {
                p_dropout: args.p_dropout,
                softmax_scale: args.softmax_scale,
                is_causal: args.is_causal,
                num_splits: 1,
            },
        )?;
        let mut launch = LaunchParams {
            is_dropout: params.is_dropout(),
            params,
            stream: &self.stream,
            return_softmax: args.return_softmax,
            elts_per_thread: 0,
        };

        // SAFETY: as in `mha_fwd`; the block mask shape matches the geometry.
        unsafe {
            self.kernels
                .run_fwd_block(kernel, &mut launch, LaunchPhase::Configure)?
        };
        let counter_offset = match launch.elts_per_thread {
            0 => self.dense_counter_offset(&shape),
            reported => reported,
        };
        if let Some(state) = rng::acquire(
            self.generator_for(args.generator),
            launch.is_dropout,
            counter_offset,
        )? {
            launch.params.philox = state;
        }
        // SAFETY: as above.
        unsafe {
            self.kernels
                .run_fwd_block(kernel, &mut launch, LaunchPhase::Execute)?
        };

        Ok(BlockFwdOutput {
            out,
            softmax_lse,
            softmax,
        })
    }

    /// Block-sparse backward pass.
    pub fn mha_bwd_block(
        &self,
        args: &BlockBwdArgs<'_, A::Tensor>,
    ) -> Result<BwdOutput<A::Tensor>> {
        let shape = validate::validate_block_backward(self.capability, args)?;
        let geometry = geometry::resolve_block_sparse(args.max_seqlen_q, args.max_seqlen_k);
        validate::check_block_mask(args.blockmask, &geometry)?;
        validate::check_softmax_lse(args.softmax_lse, &shape, &geometry)?;
        self.check_offsets(
            args.cu_seqlens_q,
            args.cu_seqlens_k,
            &shape,
            args.max_seqlen_q,
            args.max_seqlen_k,
        )?;
        let kernel = self
            .table
            .route(shape.head_dim, Variant::BlockSparse, Direction::Backward)?;

        let softmax_lse = self.allocator.narrow(args.softmax_lse, 2, geometry.padded_q)?;
        let plan = scratch::plan_backward(packed_dims(&shape), &geometry, false);
        plan.size_in_bytes()?;
        let dq_tmp = self.allocate_opt(plan.dq_tmp.as_ref())?;
        let softmax_d = plan.softmax_d.allocate(&self.allocator)?;

        let mut params = BackwardParams::new(
            problem_sizes(&shape, &geometry),
            [args.q, args.k, args.v, args.out, args.dq, args.dk, args.dv],
            BackwardBuffers {
                cu_seqlens_q: args.cu_seqlens_q.ptr(),
                cu_seqlens_k: args.cu_seqlens_k.ptr(),
                dq_tmp: ptr_or_null(dq_tmp.as_ref()),
                dout: args.dout.ptr(),
                softmax_lse: softmax_lse.ptr(),
                dsoftmax_sum: softmax_d.ptr(),
                block_mask: args.blockmask.ptr(),
            },
            AttentionScalars {
                p_dropout: args.p_dropout,
                softmax_scale: args.softmax_scale,
                is_causal: args.is_causal,
                num_splits: 1,
            },
        )?;

        if let Some(state) = rng::acquire(
            self.generator_for(args.generator),
            params.fwd.is_dropout(),
            self.config.block_sparse_bwd_counter_offset,
        )? {
            params.fwd.philox = state;
        }

        // SAFETY: as in `mha_fwd_block`.
        unsafe { self.kernels.run_bwd_block(kernel, &mut params, &self.stream)? };

        Ok(BwdOutput {
            dq: args.dq.clone(),
            dk: args.dk.clone(),
            dv: args.dv.clone(),
            softmax_d,
        })
    }

    fn generator_for<'g>(
        &'g self,
        generator: Option<&'g dyn RandomGenerator>,
    ) -> &'g dyn RandomGenerator {
        generator.unwrap_or(self.generator.as_ref())
    }

    fn dense_counter_offset(&self, shape: &ProblemShape) -> u64 {
        rng::dense_counter_offset(
            shape.batch_size,
            shape.num_heads,
            self.config.dropout_offset_per_head,
        )
    }

    fn allocate_opt(&self, spec: Option<&BufferSpec>) -> Result<Option<A::Tensor>> {
        spec.map(|spec| spec.allocate(&self.allocator)).transpose()
    }

    fn check_offsets(
        &self,
        cu_seqlens_q: &A::Tensor,
        cu_seqlens_k: &A::Tensor,
        shape: &ProblemShape,
        max_seqlen_q: usize,
        max_seqlen_k: usize,
    ) -> Result<()> {
        if !self.config.validate_offsets && !self.kernels.reads_record_on_host() {
            return Ok(());
        }
        validate::check_offsets(
            &self.allocator,
            "cu_seqlens_q",
            cu_seqlens_q,
            shape.total_q,
            max_seqlen_q,
        )?;
        validate::check_offsets(
            &self.allocator,
            "cu_seqlens_k",
            cu_seqlens_k,
            shape.total_k,
            max_seqlen_k,
        )
    }
}

fn packed_dims(shape: &ProblemShape) -> PackedDims {
    PackedDims {
        batch_size: shape.batch_size,
        total_q: shape.total_q,
        num_heads: shape.num_heads,
        head_dim: shape.head_dim,
    }
}

fn problem_sizes(shape: &ProblemShape, geometry: &Geometry) -> ProblemSizes {
    ProblemSizes {
        batch_size: shape.batch_size,
        seqlen_q: geometry.padded_q,
        seqlen_k: geometry.padded_k,
        num_heads: shape.num_heads,
        head_dim: shape.head_dim,
    }
}

fn ptr_or_null<T: DeviceTensor>(tensor: Option<&T>) -> DevicePtr {
    tensor.map_or(0, DeviceTensor::ptr)
}

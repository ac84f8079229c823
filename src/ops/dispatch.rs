//! Kernel dispatch
//!
//! Pure selection logic. The kernels themselves are external: a backend
//! implements [`FmhaKernels`] and receives the populated record together with
//! the [`KernelEntry`] the table selected for it.

use std::collections::HashMap;
use std::fmt;

use super::geometry::Direction;
use super::params::{BackwardParams, ForwardParams};
use crate::error::{Error, Result};

/// Head dimension tier a kernel specialization is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeadDimTier {
    D32,
    D64,
    D128,
}

impl HeadDimTier {
    pub const ALL: [HeadDimTier; 3] = [HeadDimTier::D32, HeadDimTier::D64, HeadDimTier::D128];

    /// Smallest tier that fits `head_dim`, if any.
    pub fn for_head_dim(head_dim: usize) -> Option<Self> {
        match head_dim {
            0 => None,
            1..=32 => Some(HeadDimTier::D32),
            33..=64 => Some(HeadDimTier::D64),
            65..=128 => Some(HeadDimTier::D128),
            _ => None,
        }
    }

    pub fn max_head_dim(self) -> usize {
        match self {
            HeadDimTier::D32 => 32,
            HeadDimTier::D64 => 64,
            HeadDimTier::D128 => 128,
        }
    }
}

/// Attention masking variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variant {
    Dense,
    Causal,
    BlockSparse,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Dense, Variant::Causal, Variant::BlockSparse];
}

/// Table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub tier: HeadDimTier,
    pub variant: Variant,
    pub direction: Direction,
}

/// A compiled kernel specialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelEntry {
    pub key: KernelKey,
    /// Symbol name of the kernel entry point
    pub name: String,
}

impl fmt::Display for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Lookup table from `(tier, variant, direction)` to kernel.
#[derive(Debug, Clone)]
pub struct KernelTable {
    entries: HashMap<KernelKey, KernelEntry>,
}

impl KernelTable {
    /// Build a table and check that it covers every supported key.
    pub fn new(entries: impl IntoIterator<Item = KernelEntry>) -> Result<Self> {
        let entries: HashMap<_, _> = entries.into_iter().map(|e| (e.key, e)).collect();
        let table = Self { entries };
        table.check_total()?;
        Ok(table)
    }

    /// The fused kernel family: one dense kernel per tier and direction
    /// (causality is a record flag) and one block-sparse kernel per direction
    /// covering every tier.
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        for tier in HeadDimTier::ALL {
            for direction in [Direction::Forward, Direction::Backward] {
                for variant in Variant::ALL {
                    let name = builtin_kernel_name(tier, variant, direction);
                    let key = KernelKey {
                        tier,
                        variant,
                        direction,
                    };
                    entries.insert(key, KernelEntry { key, name });
                }
            }
        }
        Self { entries }
    }

    /// Fail unless every `(tier, variant, direction)` has a kernel.
    pub fn check_total(&self) -> Result<()> {
        let missing: Vec<String> = all_keys()
            .filter(|key| !self.entries.contains_key(key))
            .map(|key| format!("{:?}/{:?}/{:?}", key.tier, key.variant, key.direction))
            .collect();
        if !missing.is_empty() {
            return Err(Error::KernelError {
                reason: format!("kernel table is missing {}", missing.join(", ")),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select the kernel for an already validated problem.
    pub fn route(
        &self,
        head_dim: usize,
        variant: Variant,
        direction: Direction,
    ) -> Result<&KernelEntry> {
        let tier = HeadDimTier::for_head_dim(head_dim).ok_or_else(|| Error::KernelError {
            reason: format!("no kernel tier for head_dim={head_dim}; input was not validated"),
        })?;
        let key = KernelKey {
            tier,
            variant,
            direction,
        };
        let entry = self.entries.get(&key).ok_or_else(|| Error::KernelError {
            reason: format!("no kernel registered for {key:?}"),
        })?;
        tracing::debug!(kernel = %entry, head_dim, ?variant, ?direction, "dispatching");
        Ok(entry)
    }
}

fn all_keys() -> impl Iterator<Item = KernelKey> {
    HeadDimTier::ALL.into_iter().flat_map(|tier| {
        Variant::ALL.into_iter().flat_map(move |variant| {
            [Direction::Forward, Direction::Backward]
                .into_iter()
                .map(move |direction| KernelKey {
                    tier,
                    variant,
                    direction,
                })
        })
    })
}

fn builtin_kernel_name(tier: HeadDimTier, variant: Variant, direction: Direction) -> String {
    let pass = match direction {
        Direction::Forward => "fwd",
        Direction::Backward => "bwd",
    };
    match variant {
        Variant::Dense | Variant::Causal => format!("fmha_{pass}_hdim{}", tier.max_head_dim()),
        Variant::BlockSparse => format!("fmha_block_{pass}_fp16_sm80"),
    }
}

/// Two-phase launch. `Configure` may inspect and adjust the record (for
/// example choose `num_splits` or report the per-thread random budget) but
/// must not write outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    Configure,
    Execute,
}

/// Forward record plus launch-time facts the kernel may need.
#[derive(Debug)]
pub struct LaunchParams<'s, S> {
    pub params: ForwardParams,
    pub stream: &'s S,
    pub is_dropout: bool,
    pub return_softmax: bool,
    /// Random values each thread draws; reported by the block-sparse configure phase
    pub elts_per_thread: u64,
}

/// Execution kernels, one entry point per call surface.
///
/// Implementations submit work on `stream` and return without waiting for
/// completion. They must not retain record pointers after returning.
///
/// # Safety
///
/// Every `run_*` method executes whatever the record points at. Callers must
/// pass a record whose pointers address live buffers covering every extent
/// the record describes (rows, heads, padded lengths, mask and statistics).
/// When [`reads_record_on_host`](Self::reads_record_on_host) is true, the
/// offsets must also have been checked on the host: they start at 0, never
/// decrease, and end at the packed row count (see
/// [`check_offsets`](super::validate::check_offsets)).
/// [`Fmha`](super::Fmha) upholds both for the records it builds.
pub trait FmhaKernels {
    type Stream;

    /// Whether the kernels dereference record pointers on the host. The
    /// offset contents of every call are then checked before launch,
    /// whatever the configuration says.
    fn reads_record_on_host(&self) -> bool {
        false
    }

    /// Dense or causal forward.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn run_fwd(
        &self,
        kernel: &KernelEntry,
        launch: &mut LaunchParams<'_, Self::Stream>,
    ) -> Result<()>;

    /// Dense or causal backward.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn run_bwd(
        &self,
        kernel: &KernelEntry,
        params: &mut BackwardParams,
        stream: &Self::Stream,
        phase: LaunchPhase,
    ) -> Result<()>;

    /// Block-sparse forward.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn run_fwd_block(
        &self,
        kernel: &KernelEntry,
        launch: &mut LaunchParams<'_, Self::Stream>,
        phase: LaunchPhase,
    ) -> Result<()>;

    /// Block-sparse backward.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn run_bwd_block(
        &self,
        kernel: &KernelEntry,
        params: &mut BackwardParams,
        stream: &Self::Stream,
    ) -> Result<()>;
}

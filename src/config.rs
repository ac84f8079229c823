//! Context configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ops::rng::{BLOCK_SPARSE_BWD_COUNTER_OFFSET, DEFAULT_OFFSET_PER_HEAD};

/// Settings for an [`Fmha`](crate::Fmha) context.
///
/// ```yaml
/// seed: 1234
/// dropout_offset_per_head: 32
/// validate_offsets: true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FmhaConfig {
    /// Seed of the context's default dropout generator
    #[serde(default)]
    pub seed: u64,

    /// Philox counter budget per (batch, head) for the dense passes.
    ///
    /// The dense kernels draw up to 32 counters per (batch, head), so smaller
    /// budgets would let consecutive calls reuse random streams; `validate`
    /// rejects them.
    #[serde(default = "default_offset_per_head")]
    pub dropout_offset_per_head: u64,

    /// Counter offset consumed by the block-sparse backward pass
    #[serde(default = "default_block_sparse_bwd_offset")]
    pub block_sparse_bwd_counter_offset: u64,

    /// Read offsets back to the host and check their contents on every call
    #[serde(default)]
    pub validate_offsets: bool,
}

fn default_offset_per_head() -> u64 {
    DEFAULT_OFFSET_PER_HEAD
}

fn default_block_sparse_bwd_offset() -> u64 {
    BLOCK_SPARSE_BWD_COUNTER_OFFSET
}

impl Default for FmhaConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            dropout_offset_per_head: default_offset_per_head(),
            block_sparse_bwd_counter_offset: default_block_sparse_bwd_offset(),
            validate_offsets: false,
        }
    }
}

impl FmhaConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_dropout_offset_per_head(mut self, offset: u64) -> Self {
        self.dropout_offset_per_head = offset;
        self
    }

    pub fn with_block_sparse_bwd_counter_offset(mut self, offset: u64) -> Self {
        self.block_sparse_bwd_counter_offset = offset;
        self
    }

    pub fn with_validate_offsets(mut self, validate: bool) -> Self {
        self.validate_offsets = validate;
        self
    }

    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        if self.dropout_offset_per_head < DEFAULT_OFFSET_PER_HEAD {
            return Err(Error::ConfigError {
                reason: format!(
                    "dropout_offset_per_head must be >= {DEFAULT_OFFSET_PER_HEAD}, got {}",
                    self.dropout_offset_per_head
                ),
            });
        }
        if self.block_sparse_bwd_counter_offset == 0 {
            return Err(Error::ConfigError {
                reason: "block_sparse_bwd_counter_offset must be > 0".into(),
            });
        }
        Ok(())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| Error::ConfigError {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::ConfigError {
            reason: format!("IO error: {e}"),
        })?;
        Self::from_yaml_str(&content)
    }
}

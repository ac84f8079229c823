//! Element types understood by the orchestration layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a device tensor.
///
/// Only the types that can appear at the fused attention boundary are
/// modelled: half-precision feature tensors, f32 statistics and scratch, and
/// i32 offsets / block masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    BF16,
    F32,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::I32 => "i32",
        };
        f.write_str(name)
    }
}

//! fmha error types

/// fmha result type
pub type Result<T> = std::result::Result<T, Error>;

/// fmha errors
///
/// Every failure is synchronous and terminates the call. Nothing is retried
/// and nothing is downgraded to a default inside the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape, dtype, stride, device or scalar argument violates a contract
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Valid tensors, but the current device generation cannot execute them
    #[error("unsupported configuration: {reason}")]
    UnsupportedConfiguration {
        /// Description of the unsupported combination
        reason: String,
    },

    /// Caller input disagrees with geometry derived from the other arguments
    #[error("configuration conflict on '{arg}': {reason}")]
    ConfigurationConflict {
        /// Argument name
        arg: &'static str,
        /// What disagreed
        reason: String,
    },

    /// Kernel lookup or launch failure
    #[error("kernel error: {reason}")]
    KernelError {
        /// Description of what went wrong
        reason: String,
    },

    /// Device allocator failure
    #[error("allocation error: {reason}")]
    AllocationError {
        /// Description of what went wrong
        reason: String,
    },

    /// Random generator state could not be acquired
    #[error("generator error: {reason}")]
    GeneratorError {
        /// Description of what went wrong
        reason: String,
    },

    /// Configuration parse or validation failure
    #[error("config error: {reason}")]
    ConfigError {
        /// Description of what went wrong
        reason: String,
    },
}

impl Error {
    pub(crate) fn invalid(arg: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Error::UnsupportedConfiguration {
            reason: reason.into(),
        }
    }
}

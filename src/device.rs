//! Device identity and the capability checks needed to pick a kernel family

use std::fmt;

#[cfg(feature = "cuda")]
use crate::error::{Error, Result};

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    /// Accelerator memory on the device with this ordinal
    Device(usize),
}

impl Location {
    pub fn is_device(self) -> bool {
        matches!(self, Location::Device(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => f.write_str("host"),
            Location::Device(ordinal) => write!(f, "device:{ordinal}"),
        }
    }
}

/// Device generation as a (major, minor) compute capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub const SM75: Self = Self::new(7, 5);
    pub const SM80: Self = Self::new(8, 0);
    pub const SM86: Self = Self::new(8, 6);
    pub const SM90: Self = Self::new(9, 0);

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_sm75(self) -> bool {
        self.major == 7 && self.minor == 5
    }

    pub fn is_sm80(self) -> bool {
        self.major == 8 && self.minor == 0
    }

    pub fn is_sm8x(self) -> bool {
        self.major == 8
    }

    pub fn is_sm90(self) -> bool {
        self.major == 9 && self.minor == 0
    }

    /// Generations the dense fused kernels are built for.
    pub fn supports_dense(self) -> bool {
        self.is_sm75() || self.is_sm8x() || self.is_sm90()
    }

    /// Block-sparse kernels and bf16 inputs need Ampere or Hopper.
    pub fn supports_block_sparse(self) -> bool {
        self.is_sm8x() || self.is_sm90()
    }

    pub fn supports_bf16(self) -> bool {
        self.is_sm8x() || self.is_sm90()
    }

    /// Backward kernels with wide heads only fit the sm80/sm90 shared memory budget.
    pub fn supports_wide_head_backward(self) -> bool {
        self.is_sm80() || self.is_sm90()
    }

    /// Query the capability of the device bound to the current CUDA context.
    #[cfg(feature = "cuda")]
    pub fn current() -> Result<Self> {
        use cudarc::driver::sys;

        let query = |attr: sys::CUdevice_attribute, device: sys::CUdevice| -> Result<i32> {
            let mut value: i32 = 0;
            let status = unsafe { sys::cuDeviceGetAttribute(&mut value, attr, device) };
            if status != sys::CUresult::CUDA_SUCCESS {
                return Err(Error::UnsupportedConfiguration {
                    reason: format!("cuDeviceGetAttribute({attr:?}) failed: {status:?}"),
                });
            }
            Ok(value)
        };

        let mut device: sys::CUdevice = 0;
        let status = unsafe { sys::cuCtxGetDevice(&mut device) };
        if status != sys::CUresult::CUDA_SUCCESS {
            return Err(Error::UnsupportedConfiguration {
                reason: format!("no current CUDA context: {status:?}"),
            });
        }

        let major = query(
            sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
            device,
        )?;
        let minor = query(
            sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
            device,
        )?;
        Ok(Self::new(major as u32, minor as u32))
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm{}{}", self.major, self.minor)
    }
}

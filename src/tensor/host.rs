//! Host-memory emulation of device tensors
//!
//! Buffers live in ordinary host memory but report a device location, so the
//! whole orchestration path (validation, allocation, record building,
//! dispatch) can run against the reference kernels without an accelerator.
//! Pointers handed out by [`HostTensor::ptr`] are real host addresses.
//!
//! The emulated device has a single in-order stream: every read or write of
//! buffer contents happens while holding [`device_lock`], whether it comes
//! from the allocator, a tensor readback or a reference kernel.

use half::{bf16, f16};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{DeviceAllocator, DevicePtr, DeviceTensor, contiguous_strides};
use crate::device::Location;
use crate::dtype::DType;
use crate::error::{Error, Result};

static HOST_DEVICE: Mutex<()> = Mutex::new(());

/// Exclusive access to the contents of every host buffer.
///
/// A poisoned lock still grants exclusive access, so poisoning is ignored.
pub(crate) fn device_lock() -> MutexGuard<'static, ()> {
    HOST_DEVICE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Word-aligned backing store. Mutated only through raw pointers, the same
/// way kernels mutate device memory.
struct HostStorage {
    words: Box<[UnsafeCell<u32>]>,
}

// SAFETY: the storage is a fixed-size allocation that is never resized, and
// its contents are only read or written while holding `device_lock`, except
// while a tensor is being initialized and is not yet shared.
unsafe impl Send for HostStorage {}
unsafe impl Sync for HostStorage {}

impl HostStorage {
    fn zeroed(bytes: usize) -> Result<Self> {
        let len = bytes.div_ceil(4).max(1);
        let mut words: Vec<UnsafeCell<u32>> = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|e| Error::AllocationError {
                reason: format!("cannot reserve {bytes} bytes of host memory: {e}"),
            })?;
        words.resize_with(len, || UnsafeCell::new(0));
        Ok(Self {
            words: words.into_boxed_slice(),
        })
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.words.as_ptr()).cast::<u8>()
    }
}

/// Load element `index` of a buffer starting at `base` as f32.
///
/// # Safety
/// `base` must point to a live buffer of `dtype` with more than `index`
/// elements, and the caller must hold [`device_lock`] if the buffer is shared.
pub(crate) unsafe fn load_f32(base: *const u8, dtype: DType, index: usize) -> f32 {
    unsafe {
        match dtype {
            DType::F16 => f16::from_bits(base.cast::<u16>().add(index).read()).to_f32(),
            DType::BF16 => bf16::from_bits(base.cast::<u16>().add(index).read()).to_f32(),
            DType::F32 => base.cast::<f32>().add(index).read(),
            DType::I32 => base.cast::<i32>().add(index).read() as f32,
        }
    }
}

/// Store `value` (rounded to `dtype`) at element `index`.
///
/// # Safety
/// Same contract as [`load_f32`], and the buffer must be writable.
pub(crate) unsafe fn store_f32(base: *mut u8, dtype: DType, index: usize, value: f32) {
    unsafe {
        match dtype {
            DType::F16 => base
                .cast::<u16>()
                .add(index)
                .write(f16::from_f32(value).to_bits()),
            DType::BF16 => base
                .cast::<u16>()
                .add(index)
                .write(bf16::from_f32(value).to_bits()),
            DType::F32 => base.cast::<f32>().add(index).write(value),
            DType::I32 => base.cast::<i32>().add(index).write(value as i32),
        }
    }
}

/// Tensor handle over host storage.
#[derive(Clone)]
pub struct HostTensor {
    storage: Arc<HostStorage>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
    location: Location,
}

impl std::fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTensor")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("dtype", &self.dtype)
            .field("location", &self.location)
            .finish()
    }
}

impl HostTensor {
    fn with_layout(
        shape: &[usize],
        strides: &[usize],
        dtype: DType,
        location: Location,
    ) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(Error::invalid(
                "strides",
                format!("rank {} does not match shape {shape:?}", strides.len()),
            ));
        }
        let overflow = || {
            Error::invalid(
                "shape",
                format!("{shape:?} with strides {strides:?} overflows the address space"),
            )
        };
        let span = if shape.iter().any(|&d| d == 0) {
            0
        } else {
            shape
                .iter()
                .zip(strides)
                .try_fold(1usize, |acc, (&d, &s)| {
                    (d - 1).checked_mul(s).and_then(|extent| acc.checked_add(extent))
                })
                .ok_or_else(overflow)?
        };
        let bytes = span.checked_mul(dtype.size_in_bytes()).ok_or_else(overflow)?;
        Ok(Self {
            storage: Arc::new(HostStorage::zeroed(bytes)?),
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            dtype,
            location,
        })
    }

    /// Contiguous tensor holding `data` converted to `dtype`.
    ///
    /// # Panics
    /// If `data.len()` does not match `shape`, or host memory runs out.
    pub fn from_f32(data: &[f32], shape: &[usize], dtype: DType, location: Location) -> Self {
        Self::from_f32_strided(data, shape, &contiguous_strides(shape), dtype, location)
    }

    /// Tensor with explicit element strides. `data` is given in logical row-major order.
    ///
    /// # Panics
    /// If the layout is malformed, `data.len()` does not match `shape`, or
    /// host memory runs out.
    pub fn from_f32_strided(
        data: &[f32],
        shape: &[usize],
        strides: &[usize],
        dtype: DType,
        location: Location,
    ) -> Self {
        let tensor = match Self::with_layout(shape, strides, dtype, location) {
            Ok(tensor) => tensor,
            Err(e) => panic!("cannot build host tensor: {e}"),
        };
        assert_eq!(data.len(), tensor.numel(), "data length does not match shape");
        let base = tensor.storage.base();
        for (linear, &value) in data.iter().enumerate() {
            // SAFETY: offset_of stays within the span allocated by with_layout,
            // and the storage is not shared yet.
            unsafe { store_f32(base, dtype, tensor.offset_of(linear), value) };
        }
        tensor
    }

    /// # Panics
    /// If `data.len()` does not match `shape`, or host memory runs out.
    pub fn from_i32(data: &[i32], shape: &[usize], location: Location) -> Self {
        let strides = contiguous_strides(shape);
        let tensor = match Self::with_layout(shape, &strides, DType::I32, location) {
            Ok(tensor) => tensor,
            Err(e) => panic!("cannot build host tensor: {e}"),
        };
        assert_eq!(data.len(), tensor.numel(), "data length does not match shape");
        let base = tensor.storage.base().cast::<i32>();
        for (i, &value) in data.iter().enumerate() {
            // SAFETY: contiguous layout with exactly numel elements, not shared yet.
            unsafe { base.add(i).write(value) };
        }
        tensor
    }

    /// Same storage, reported at a different location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    /// Logical row-major contents as f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let _device = device_lock();
        let base = self.storage.base();
        (0..self.numel())
            // SAFETY: offsets are within the allocated span.
            .map(|linear| unsafe { load_f32(base, self.dtype, self.offset_of(linear)) })
            .collect()
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        let _device = device_lock();
        let base = self.storage.base().cast::<i32>();
        (0..self.numel())
            // SAFETY: offsets are within the allocated span.
            .map(|linear| unsafe { base.add(self.offset_of(linear)).read() })
            .collect()
    }

    /// Element offset of the `linear`-th element in logical row-major order.
    fn offset_of(&self, linear: usize) -> usize {
        let mut rem = linear;
        let mut offset = 0;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides).rev() {
            offset += (rem % dim) * stride;
            rem /= dim;
        }
        offset
    }

    fn base(&self) -> *mut u8 {
        self.storage.base()
    }
}

impl DeviceTensor for HostTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn strides(&self) -> &[usize] {
        &self.strides
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn location(&self) -> Location {
        self.location
    }

    fn ptr(&self) -> DevicePtr {
        self.base() as DevicePtr
    }
}

/// Allocator handing out [`HostTensor`]s that report `Location::Device(ordinal)`.
#[derive(Debug, Default)]
pub struct HostAllocator {
    ordinal: usize,
    allocations: AtomicUsize,
    /// Value written into "uninitialized" buffers
    poison: Option<f32>,
}

impl HostAllocator {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            allocations: AtomicUsize::new(0),
            poison: None,
        }
    }

    /// Fill every buffer from [`DeviceAllocator::empty`] with `value`, so
    /// reads of memory nobody initialized show up in results.
    pub fn with_poison(mut self, value: f32) -> Self {
        self.poison = Some(value);
        self
    }

    pub fn location(&self) -> Location {
        Location::Device(self.ordinal)
    }

    /// Number of buffers allocated through [`DeviceAllocator`] so far.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Place caller data on the emulated device. Not counted as an allocation.
    pub fn upload_f32(&self, data: &[f32], shape: &[usize], dtype: DType) -> HostTensor {
        HostTensor::from_f32(data, shape, dtype, self.location())
    }

    pub fn upload_i32(&self, data: &[i32], shape: &[usize]) -> HostTensor {
        HostTensor::from_i32(data, shape, self.location())
    }
}

impl DeviceAllocator for HostAllocator {
    type Tensor = HostTensor;

    fn empty(&self, shape: &[usize], dtype: DType) -> Result<HostTensor> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let tensor =
            HostTensor::with_layout(shape, &contiguous_strides(shape), dtype, self.location())?;
        if let Some(value) = self.poison {
            self.fill(&tensor, value)?;
        }
        Ok(tensor)
    }

    fn fill(&self, tensor: &HostTensor, value: f32) -> Result<()> {
        let _device = device_lock();
        let base = tensor.base();
        for linear in 0..tensor.numel() {
            // SAFETY: offsets are within the allocated span, and the device lock is held.
            unsafe { store_f32(base, tensor.dtype, tensor.offset_of(linear), value) };
        }
        Ok(())
    }

    fn copy(&self, dst: &HostTensor, src: &HostTensor) -> Result<()> {
        if dst.shape != src.shape {
            return Err(Error::invalid(
                "dst",
                format!("copy shape mismatch: {:?} vs {:?}", dst.shape, src.shape),
            ));
        }
        let _device = device_lock();
        let (dst_base, src_base) = (dst.base(), src.base());
        for linear in 0..dst.numel() {
            // SAFETY: both tensors have the same logical shape and valid spans,
            // and the device lock is held.
            unsafe {
                let value = load_f32(src_base, src.dtype, src.offset_of(linear));
                store_f32(dst_base, dst.dtype, dst.offset_of(linear), value);
            }
        }
        Ok(())
    }

    fn narrow(&self, tensor: &HostTensor, dim: usize, len: usize) -> Result<HostTensor> {
        if dim >= tensor.shape.len() || len > tensor.shape[dim] {
            return Err(Error::invalid(
                "narrow",
                format!(
                    "cannot take {len} entries of dim {dim} from shape {:?}",
                    tensor.shape
                ),
            ));
        }
        let mut shape = tensor.shape.clone();
        shape[dim] = len;
        let out = self.empty(&shape, tensor.dtype)?;
        // A view of the source with the narrowed shape shares offsets with it.
        let view = HostTensor {
            shape: shape.clone(),
            ..tensor.clone()
        };
        self.copy(&out, &view)?;
        Ok(out)
    }

    fn read_i32(&self, tensor: &HostTensor) -> Result<Vec<i32>> {
        if tensor.dtype != DType::I32 {
            return Err(Error::invalid(
                "tensor",
                format!("read_i32 needs an i32 tensor, got {}", tensor.dtype),
            ));
        }
        Ok(tensor.to_i32_vec())
    }
}

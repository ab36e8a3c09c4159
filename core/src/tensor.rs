//! Owned and session-borrowed tensors.
//!
//! [`Tensor`] owns its native object and destroys it on release.
//! [`TensorRef`] is a view of a tensor that belongs to a session (or is
//! handed to an operator callback) and is never destroyed by the caller.
//! Both read and copy through [`TensorAccess`].

use std::marker::PhantomData;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use tracing::debug;

use crate::buffer::{read_dimensions, Dimension, HalideType};
use crate::error::{BridgeError, ErrorCode, Result};
use crate::ffi::{self, MnnTensor, RawHalideType};
use crate::handle::Handle;
use crate::marshal::{ForeignIntArray, NativeIntArray};
use crate::native::NativeApi;

/// Memory layout of a tensor (`MNN_DimensionType`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DimensionType {
    /// NHWC
    Tensorflow = 0,
    /// NCHW
    #[default]
    Caffe = 1,
    /// NC4HW4
    CaffeC4 = 2,
}

impl DimensionType {
    pub fn from_raw(raw: c_int) -> Result<Self> {
        match raw {
            0 => Ok(Self::Tensorflow),
            1 => Ok(Self::Caffe),
            2 => Ok(Self::CaffeC4),
            other => Err(BridgeError::argument(format!("unknown dimension type {}", other))),
        }
    }
}

/// Direction of a host mapping, used when waiting on a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Write = 0,
    Read = 1,
}

fn check_shape(shape: &[i32]) -> Result<usize> {
    if let Some(bad) = shape.iter().find(|&&d| d < 0) {
        return Err(BridgeError::argument(format!(
            "negative extent {} in shape {:?}",
            bad, shape
        )));
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
        .ok_or_else(|| BridgeError::argument(format!("shape {:?} overflows", shape)))
}

/// Read and copy operations shared by owned and borrowed tensors.
pub trait TensorAccess {
    fn api(&self) -> &Arc<NativeApi>;

    /// The live native pointer.
    fn raw(&self) -> Result<*mut MnnTensor>;

    fn shape(&self) -> Result<Vec<i32>> {
        let t = self.raw()?;
        let api = self.api();
        let mut len: c_int = 0;
        // SAFETY: t is live; the block is released through the paired free.
        let shape = unsafe {
            let data = (api.tensor_shape)(t, &mut len);
            ForeignIntArray::from_raw(data, len.max(0) as usize, api.tensor_free_shape)
        };
        Ok(shape.as_slice().to_vec())
    }

    fn dimensions(&self) -> Result<usize> {
        let t = self.raw()?;
        Ok(unsafe { (self.api().tensor_dimensions)(t) }.max(0) as usize)
    }

    fn element_count(&self) -> Result<usize> {
        let t = self.raw()?;
        Ok(unsafe { (self.api().tensor_element_size)(t) }.max(0) as usize)
    }

    fn byte_size(&self) -> Result<usize> {
        let t = self.raw()?;
        Ok(unsafe { (self.api().tensor_size)(t) }.max(0) as usize)
    }

    fn halide_type(&self) -> Result<HalideType> {
        let t = self.raw()?;
        let mut raw = RawHalideType {
            code: 0,
            bits: 0,
            lanes: 0,
        };
        unsafe { (self.api().tensor_halide_type)(t, &mut raw) };
        HalideType::try_from(raw)
    }

    fn dimension_type(&self) -> Result<DimensionType> {
        let t = self.raw()?;
        DimensionType::from_raw(unsafe { (self.api().tensor_dimension_type)(t) })
    }

    /// Per-axis layout as described by the tensor's buffer.
    fn buffer_dims(&self) -> Result<Vec<Dimension>> {
        let t = self.raw()?;
        // SAFETY: the buffer lives as long as the tensor.
        Ok(unsafe { read_dimensions((self.api().tensor_buffer)(t)) })
    }

    /// Raw element bytes, copied through a host tensor when the data is
    /// device resident.
    fn read_bytes(&self) -> Result<Vec<u8>> {
        let t = self.raw()?;
        let api = self.api();
        let size = self.byte_size()?;
        let host = unsafe { (api.tensor_host)(t) } as *const u8;
        if !host.is_null() {
            if size == 0 {
                return Ok(Vec::new());
            }
            // SAFETY: a host tensor owns `size` bytes at `host`.
            return Ok(unsafe { std::slice::from_raw_parts(host, size) }.to_vec());
        }
        let staging = Tensor::host_from_device(self, true)?;
        let host = unsafe { (api.tensor_host)(staging.raw()?) } as *const u8;
        if host.is_null() || size == 0 {
            return Ok(Vec::new());
        }
        Ok(unsafe { std::slice::from_raw_parts(host, size) }.to_vec())
    }

    fn read_f32(&self) -> Result<Vec<f32>> {
        let ty = self.halide_type()?;
        if ty != HalideType::f32() {
            return Err(BridgeError::argument(format!("tensor holds {}, not f32", ty)));
        }
        Ok(self
            .read_bytes()?
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn to_array(&self) -> Result<ArrayD<f32>> {
        let shape: Vec<usize> = self.shape()?.iter().map(|&d| d.max(0) as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&shape), self.read_f32()?)
            .map_err(|e| BridgeError::argument(format!("Array shape error: {}", e)))
    }

    /// Copy `host` into this tensor. Types and sizes must match.
    fn copy_from_host(&self, host: &Tensor) -> Result<()> {
        let (dst, src) = (self.raw()?, host.raw()?);
        if unsafe { (self.api().tensor_copy_from_host)(dst, src) } == ffi::MNN_FALSE {
            return Err(BridgeError::argument("host tensor does not match the target"));
        }
        Ok(())
    }

    fn copy_to_host(&self, host: &mut Tensor) -> Result<()> {
        let (src, dst) = (self.raw()?, host.raw()?);
        if unsafe { (self.api().tensor_copy_to_host)(src, dst) } == ffi::MNN_FALSE {
            return Err(BridgeError::argument("host tensor does not match the source"));
        }
        Ok(())
    }

    /// Wait for pending work on the tensor. With `finish` false this only
    /// polls, failing with [`ErrorCode::NoExecution`] while work is queued.
    fn wait(&self, map: MapType, finish: bool) -> Result<()> {
        let t = self.raw()?;
        let finish = if finish { ffi::MNN_TRUE } else { ffi::MNN_FALSE };
        ErrorCode::check(unsafe { (self.api().tensor_wait)(t, map as c_int, finish) }, "Tensor wait")
    }

    fn is_ready(&self) -> Result<bool> {
        match self.wait(MapType::Read, false) {
            Ok(()) => Ok(true),
            Err(BridgeError::EngineRun {
                code: ErrorCode::NoExecution,
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A tensor owned by the caller.
#[derive(Debug)]
pub struct Tensor {
    api: Arc<NativeApi>,
    handle: Handle<MnnTensor>,
}

impl Tensor {
    fn wrap(api: &Arc<NativeApi>, ptr: *mut MnnTensor, what: &str) -> Result<Self> {
        let handle = Handle::from_raw(ptr, what)?;
        debug!(what, "tensor created");
        Ok(Self {
            api: Arc::clone(api),
            handle,
        })
    }

    /// Zeroed host tensor.
    pub fn host(
        api: &Arc<NativeApi>,
        shape: &[i32],
        ty: HalideType,
        dim_type: DimensionType,
    ) -> Result<Self> {
        check_shape(shape)?;
        let dims = NativeIntArray::new(shape);
        let raw = dims.as_raw();
        let ptr = unsafe {
            (api.tensor_create_host)(
                raw.data,
                raw.size as c_int,
                ty.into(),
                ptr::null_mut(),
                dim_type as c_int,
            )
        };
        Self::wrap(api, ptr, "host tensor")
    }

    /// Host tensor initialised from `data`, which must hold exactly one
    /// value per element.
    pub fn host_from_f32(
        api: &Arc<NativeApi>,
        shape: &[i32],
        data: &[f32],
        dim_type: DimensionType,
    ) -> Result<Self> {
        let count = check_shape(shape)?;
        if data.len() != count {
            return Err(BridgeError::argument(format!(
                "{} values for shape {:?} ({} elements)",
                data.len(),
                shape,
                count
            )));
        }
        let dims = NativeIntArray::new(shape);
        let raw = dims.as_raw();
        // A non-null pointer would be aliased, not copied, so let the native
        // side allocate and fill it afterwards.
        let ptr = unsafe {
            (api.tensor_create_host)(
                raw.data,
                raw.size as c_int,
                HalideType::f32().into(),
                ptr::null_mut(),
                dim_type as c_int,
            )
        };
        let mut tensor = Self::wrap(api, ptr, "host tensor")?;
        tensor.write_f32(data)?;
        Ok(tensor)
    }

    /// NCHW host tensor holding a copy of `array`.
    pub fn from_array(api: &Arc<NativeApi>, array: &ArrayD<f32>) -> Result<Self> {
        let shape = array
            .shape()
            .iter()
            .map(|&d| i32::try_from(d))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| BridgeError::argument("array extent exceeds i32"))?;
        let contiguous = array.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| BridgeError::argument("array is not contiguous"))?;
        Self::host_from_f32(api, &shape, data, DimensionType::Caffe)
    }

    pub fn device(
        api: &Arc<NativeApi>,
        shape: &[i32],
        ty: HalideType,
        dim_type: DimensionType,
    ) -> Result<Self> {
        check_shape(shape)?;
        let dims = NativeIntArray::new(shape);
        let raw = dims.as_raw();
        let ptr = unsafe {
            (api.tensor_create_device)(raw.data, raw.size as c_int, ty.into(), dim_type as c_int)
        };
        Self::wrap(api, ptr, "device tensor")
    }

    /// Host tensor with the shape and type of `other`.
    pub fn like(other: &(impl TensorAccess + ?Sized), dim_type: DimensionType, alloc: bool) -> Result<Self> {
        let src = other.raw()?;
        let api = other.api();
        let alloc = if alloc { ffi::MNN_TRUE } else { ffi::MNN_FALSE };
        let ptr = unsafe { (api.tensor_create_from_existing)(src, dim_type as c_int, alloc) };
        Self::wrap(api, ptr, "tensor from existing")
    }

    /// Host copy of a (possibly device resident) tensor.
    pub fn host_from_device(device: &(impl TensorAccess + ?Sized), copy: bool) -> Result<Self> {
        let src = device.raw()?;
        let api = device.api();
        let copy = if copy { ffi::MNN_TRUE } else { ffi::MNN_FALSE };
        let ptr = unsafe { (api.tensor_create_host_from_device)(src, copy) };
        Self::wrap(api, ptr, "host tensor from device")
    }

    pub fn write_f32(&mut self, data: &[f32]) -> Result<()> {
        let ty = self.halide_type()?;
        if ty != HalideType::f32() {
            return Err(BridgeError::argument(format!("tensor holds {}, not f32", ty)));
        }
        let count = self.element_count()?;
        if data.len() != count {
            return Err(BridgeError::argument(format!(
                "{} values for {} elements",
                data.len(),
                count
            )));
        }
        let host = unsafe { (self.api.tensor_host)(self.handle.get()?) } as *mut f32;
        if host.is_null() {
            return Err(BridgeError::argument("tensor has no host memory"));
        }
        // SAFETY: host holds `count` f32 values owned by this tensor.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), host, count) };
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Destroy the native tensor. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(ptr) = self.handle.take() {
            unsafe { (self.api.tensor_destroy)(ptr) };
            debug!("tensor released");
        }
    }
}

impl TensorAccess for Tensor {
    fn api(&self) -> &Arc<NativeApi> {
        &self.api
    }

    fn raw(&self) -> Result<*mut MnnTensor> {
        self.handle.get()
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.release();
    }
}

/// A tensor owned by someone else for the lifetime `'a`.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef<'a> {
    api: &'a Arc<NativeApi>,
    ptr: NonNull<MnnTensor>,
    _owner: PhantomData<&'a MnnTensor>,
}

impl<'a> TensorRef<'a> {
    /// # Safety
    ///
    /// `ptr` must stay a live tensor for `'a` and must not be destroyed
    /// through this view.
    pub(crate) unsafe fn from_raw(api: &'a Arc<NativeApi>, ptr: *mut MnnTensor, what: &str) -> Result<Self> {
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| BridgeError::native_creation(format!("tensor ({})", what)))?;
        Ok(Self {
            api,
            ptr,
            _owner: PhantomData,
        })
    }

    pub fn as_ptr(&self) -> *mut MnnTensor {
        self.ptr.as_ptr()
    }
}

impl TensorAccess for TensorRef<'_> {
    fn api(&self) -> &Arc<NativeApi> {
        self.api
    }

    fn raw(&self) -> Result<*mut MnnTensor> {
        Ok(self.ptr.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    fn api() -> Arc<NativeApi> {
        Arc::new(NativeApi::reference())
    }

    #[test]
    fn host_tensor_reports_shape_and_sizes() {
        let api = api();
        let t = Tensor::host(&api, &[2, 3, 4], HalideType::f32(), DimensionType::Caffe).unwrap();
        assert_eq!(t.shape().unwrap(), vec![2, 3, 4]);
        assert_eq!(t.dimensions().unwrap(), 3);
        assert_eq!(t.element_count().unwrap(), 24);
        assert_eq!(t.byte_size().unwrap(), 96);
        assert_eq!(t.halide_type().unwrap(), HalideType::f32());
        assert_eq!(t.dimension_type().unwrap(), DimensionType::Caffe);
        assert_eq!(t.buffer_dims().unwrap()[0].stride, 12);
        assert!(t.read_f32().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn write_then_read_back() {
        let api = api();
        let mut t = Tensor::host(&api, &[2, 2], HalideType::f32(), DimensionType::Tensorflow).unwrap();
        t.write_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let array = t.to_array().unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_abs_diff_eq!(array[[1, 0]], 3.0);
        assert!(t.write_f32(&[1.0]).is_err());
    }

    #[test]
    fn from_array_copies_values() {
        let api = api();
        let array = Array::from_shape_vec(IxDyn(&[1, 2, 3]), (0..6).map(|v| v as f32).collect()).unwrap();
        let t = Tensor::from_array(&api, &array).unwrap();
        assert_eq!(t.to_array().unwrap(), array);
    }

    #[test]
    fn host_tensor_owns_its_values() {
        let api = api();
        let mut source = vec![1.0, 2.0, 3.0];
        let t = Tensor::host_from_f32(&api, &[3], &source, DimensionType::Caffe).unwrap();
        source.fill(-1.0);
        drop(source);
        assert_eq!(t.read_f32().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn from_array_handles_transposed_views() {
        let api = api();
        let array = Array::from_shape_vec(IxDyn(&[2, 3]), (0..6).map(|v| v as f32).collect()).unwrap();
        let transposed = array.t().to_owned();
        assert!(!transposed.is_standard_layout());
        let t = Tensor::from_array(&api, &transposed).unwrap();
        assert_eq!(t.shape().unwrap(), vec![3, 2]);
        assert_eq!(t.read_f32().unwrap(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn device_tensor_reads_through_host_copy() {
        let api = api();
        let host = Tensor::host_from_f32(&api, &[4], &[0.5; 4], DimensionType::Caffe).unwrap();
        let device = Tensor::device(&api, &[4], HalideType::f32(), DimensionType::Caffe).unwrap();
        device.copy_from_host(&host).unwrap();
        assert_eq!(device.read_f32().unwrap(), vec![0.5; 4]);

        let mut back = Tensor::like(&device, DimensionType::Caffe, true).unwrap();
        device.copy_to_host(&mut back).unwrap();
        assert_eq!(back.read_f32().unwrap(), vec![0.5; 4]);
    }

    #[test]
    fn mismatched_copy_is_rejected() {
        let api = api();
        let host = Tensor::host(&api, &[3], HalideType::f32(), DimensionType::Caffe).unwrap();
        let device = Tensor::device(&api, &[4], HalideType::f32(), DimensionType::Caffe).unwrap();
        assert!(matches!(
            device.copy_from_host(&host),
            Err(BridgeError::ArgumentMismatch(_))
        ));
    }

    #[test]
    fn invalid_shapes_fail_before_native_call() {
        let api = api();
        assert!(Tensor::host(&api, &[2, -1], HalideType::f32(), DimensionType::Caffe).is_err());
        assert!(Tensor::host_from_f32(&api, &[2, 2], &[1.0; 3], DimensionType::Caffe).is_err());
    }

    #[test]
    fn released_tensor_is_invalid() {
        let api = api();
        let mut t = Tensor::host(&api, &[1], HalideType::i32(), DimensionType::Caffe).unwrap();
        t.release();
        t.release();
        assert!(!t.is_valid());
        assert!(matches!(t.shape(), Err(BridgeError::InvalidHandle("tensor"))));
        assert!(t.read_f32().is_err());
    }

    #[test]
    fn host_tensor_is_ready() {
        let api = api();
        let t = Tensor::host(&api, &[1], HalideType::f32(), DimensionType::Caffe).unwrap();
        assert!(t.is_ready().unwrap());
        t.wait(MapType::Read, true).unwrap();
    }
}

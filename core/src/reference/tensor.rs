//! Reference tensors and the `MNN_Tensor_*` entry points.
//!
//! Every tensor is an `Arc<RefTensor>`; the pointer handed to C is
//! `Arc::as_ptr` (session-owned) or `Arc::into_raw` (caller-owned, undone by
//! `MNN_Tensor_Destroy`). Session tensors are device resident: their host
//! pointer is null and data moves through the copy entry points.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::ffi::{self, MnnBool, MnnTensor, RawHalideBuffer, RawHalideDimension, RawHalideType};

use super::{status, truthy};

pub const DIMENSION_TENSORFLOW: c_int = 0;

/// Tensor storage: `u64` words so any element type is aligned, or memory
/// lent by the creator of a host tensor, which is used in place.
#[derive(Debug, Default)]
pub(crate) struct AlignedBytes {
    words: Vec<u64>,
    borrowed: Option<ptr::NonNull<u8>>,
    len: usize,
}

impl AlignedBytes {
    pub fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            borrowed: None,
            len,
        }
    }

    /// Use `len` bytes at `data` without copying them.
    ///
    /// # Safety
    ///
    /// `data` must stay valid for reads and writes of `len` bytes for as
    /// long as the storage is used.
    pub unsafe fn aliased(data: ptr::NonNull<u8>, len: usize) -> Self {
        Self {
            words: Vec::new(),
            borrowed: Some(data),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn base(&self) -> *mut u8 {
        match self.borrowed {
            Some(p) => p.as_ptr(),
            None => self.words.as_ptr() as *mut u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: the base covers at least len bytes.
        unsafe { std::slice::from_raw_parts(self.base(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: as above, uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.base(), self.len) }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        if self.len == 0 {
            ptr::null_mut()
        } else {
            self.base()
        }
    }

    pub fn read_f32(&self) -> Vec<f32> {
        self.as_bytes()
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn fill_f32(&mut self, value: f32) {
        for chunk in self.as_bytes_mut().chunks_exact_mut(4) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
    }
}

pub(crate) struct TensorState {
    pub shape: Vec<i32>,
    pub ty: RawHalideType,
    pub dim_type: c_int,
    pub device: bool,
    pub data: AlignedBytes,
    dims: Vec<RawHalideDimension>,
    buffer: RawHalideBuffer,
}

// SAFETY: the raw pointers in `buffer` only ever point into this state,
// or into host memory whose creator promised it outlives the tensor.
unsafe impl Send for TensorState {}

impl TensorState {
    pub fn element_count(&self) -> usize {
        self.shape.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn element_bytes(&self) -> usize {
        (self.ty.bits as usize).div_ceil(8)
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.element_bytes()
    }

    pub fn is_f32(&self) -> bool {
        self.ty.code == 2 && self.ty.bits == 32
    }

    /// Change the shape, reallocating zeroed storage.
    pub fn reshape(&mut self, shape: Vec<i32>) {
        self.shape = shape;
        self.data = AlignedBytes::zeroed(self.byte_size());
    }
}

pub(crate) struct RefTensor {
    state: Mutex<TensorState>,
    /// `None` while a run is writing the tensor, then that run's status.
    settled: Mutex<Option<c_int>>,
    settled_cv: Condvar,
}

impl RefTensor {
    pub fn new(shape: &[i32], ty: RawHalideType, dim_type: c_int, device: bool, alloc: bool) -> Self {
        let mut state = TensorState {
            shape: shape.to_vec(),
            ty,
            dim_type,
            device,
            data: AlignedBytes::default(),
            dims: Vec::new(),
            buffer: RawHalideBuffer {
                device: 0,
                device_interface: ptr::null(),
                host: ptr::null_mut(),
                flags: 0,
                type_: ty,
                dimensions: 0,
                dim: ptr::null_mut(),
                padding: ptr::null_mut(),
            },
        };
        if alloc {
            state.data = AlignedBytes::zeroed(state.byte_size());
        }
        Self {
            state: Mutex::new(state),
            settled: Mutex::new(Some(status::NO_ERROR)),
            settled_cv: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TensorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_pending(&self) {
        *self.settled.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn settle(&self, code: c_int) {
        *self.settled.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
        self.settled_cv.notify_all();
    }

    pub fn poll(&self) -> Option<c_int> {
        *self.settled.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait_settled(&self) -> c_int {
        let mut settled = self.settled.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(code) = *settled {
                return code;
            }
            settled = self.settled_cv.wait(settled).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn as_raw(self: &Arc<Self>) -> *mut MnnTensor {
        Arc::as_ptr(self) as *mut MnnTensor
    }
}

/// # Safety
///
/// `ptr` must be null or come from a live reference tensor.
pub(crate) unsafe fn tensor<'a>(ptr: *const MnnTensor) -> Option<&'a RefTensor> {
    (ptr as *const RefTensor).as_ref()
}

fn publish(tensor: RefTensor) -> *mut MnnTensor {
    Arc::into_raw(Arc::new(tensor)) as *mut MnnTensor
}

unsafe fn read_shape(shape: *const c_int, count: c_int) -> Option<Vec<i32>> {
    if count < 0 || (count > 0 && shape.is_null()) {
        return None;
    }
    if count == 0 {
        return Some(Vec::new());
    }
    let dims = std::slice::from_raw_parts(shape, count as usize).to_vec();
    if dims.iter().any(|&d| d < 0) {
        return None;
    }
    Some(dims)
}

pub unsafe extern "C" fn tensor_create_device(
    shape: *const c_int,
    shape_size: c_int,
    ty: RawHalideType,
    dim_type: c_int,
) -> *mut MnnTensor {
    match read_shape(shape, shape_size) {
        Some(dims) => publish(RefTensor::new(&dims, ty, dim_type, true, true)),
        None => ptr::null_mut(),
    }
}

pub unsafe extern "C" fn tensor_create_host(
    shape: *const c_int,
    shape_size: c_int,
    ty: RawHalideType,
    data: *mut c_void,
    dim_type: c_int,
) -> *mut MnnTensor {
    let Some(dims) = read_shape(shape, shape_size) else {
        return ptr::null_mut();
    };
    // Like MNN, caller memory becomes the tensor's host buffer as is.
    let Some(data) = ptr::NonNull::new(data as *mut u8) else {
        return publish(RefTensor::new(&dims, ty, dim_type, false, true));
    };
    let tensor = RefTensor::new(&dims, ty, dim_type, false, false);
    {
        let mut state = tensor.lock();
        let len = state.byte_size();
        state.data = AlignedBytes::aliased(data, len);
    }
    publish(tensor)
}

pub unsafe extern "C" fn tensor_create_from_existing(
    existing: *const MnnTensor,
    dim_type: c_int,
    alloc: MnnBool,
) -> *mut MnnTensor {
    let Some(src) = tensor(existing) else {
        return ptr::null_mut();
    };
    let (shape, ty) = {
        let state = src.lock();
        (state.shape.clone(), state.ty)
    };
    publish(RefTensor::new(&shape, ty, dim_type, false, truthy(alloc)))
}

pub unsafe extern "C" fn tensor_create_host_from_device(
    device: *const MnnTensor,
    copy: MnnBool,
) -> *mut MnnTensor {
    let Some(src) = tensor(device) else {
        return ptr::null_mut();
    };
    let state = src.lock();
    let host = RefTensor::new(&state.shape, state.ty, state.dim_type, false, true);
    if truthy(copy) {
        let mut target = host.lock();
        if target.data.len() == state.data.len() {
            target.data.as_bytes_mut().copy_from_slice(state.data.as_bytes());
        }
    }
    drop(state);
    publish(host)
}

pub unsafe extern "C" fn tensor_destroy(t: *mut MnnTensor) {
    if !t.is_null() {
        drop(Arc::from_raw(t as *const RefTensor));
    }
}

fn copy_between(dst: &RefTensor, src: &RefTensor) -> MnnBool {
    if ptr::eq(dst, src) {
        return ffi::MNN_TRUE;
    }
    let src_state = src.lock();
    let mut dst_state = dst.lock();
    if src_state.ty != dst_state.ty || src_state.data.len() != dst_state.data.len() {
        return ffi::MNN_FALSE;
    }
    dst_state
        .data
        .as_bytes_mut()
        .copy_from_slice(src_state.data.as_bytes());
    ffi::MNN_TRUE
}

pub unsafe extern "C" fn tensor_copy_from_host(t: *mut MnnTensor, host: *const MnnTensor) -> MnnBool {
    match (tensor(t), tensor(host)) {
        (Some(dst), Some(src)) if !src.lock().device => copy_between(dst, src),
        _ => ffi::MNN_FALSE,
    }
}

pub unsafe extern "C" fn tensor_copy_to_host(t: *const MnnTensor, host: *mut MnnTensor) -> MnnBool {
    match (tensor(t), tensor(host)) {
        (Some(src), Some(dst)) if !dst.lock().device => copy_between(dst, src),
        _ => ffi::MNN_FALSE,
    }
}

pub unsafe extern "C" fn tensor_buffer(t: *const MnnTensor) -> *const RawHalideBuffer {
    let Some(t) = tensor(t) else {
        return ptr::null();
    };
    let mut guard = t.lock();
    let state = &mut *guard;
    let mut stride = 1;
    state.dims = state
        .shape
        .iter()
        .rev()
        .map(|&extent| {
            let dim = RawHalideDimension {
                min: 0,
                extent,
                stride,
                flags: 0,
            };
            stride *= extent.max(1);
            dim
        })
        .collect();
    state.dims.reverse();
    state.buffer.type_ = state.ty;
    state.buffer.dimensions = state.dims.len() as i32;
    state.buffer.dim = if state.dims.is_empty() {
        ptr::null_mut()
    } else {
        state.dims.as_mut_ptr()
    };
    state.buffer.host = if state.device {
        ptr::null_mut()
    } else {
        state.data.as_mut_ptr()
    };
    state.buffer.device = u64::from(state.device);
    &state.buffer as *const RawHalideBuffer
}

pub unsafe extern "C" fn tensor_dimension_type(t: *const MnnTensor) -> c_int {
    tensor(t).map_or(DIMENSION_TENSORFLOW, |t| t.lock().dim_type)
}

pub unsafe extern "C" fn tensor_halide_type(t: *const MnnTensor, out: *mut RawHalideType) {
    if let (Some(t), false) = (tensor(t), out.is_null()) {
        *out = t.lock().ty;
    }
}

pub unsafe extern "C" fn tensor_host(t: *const MnnTensor) -> *mut c_void {
    match tensor(t) {
        Some(t) => {
            let mut state = t.lock();
            if state.device {
                ptr::null_mut()
            } else {
                state.data.as_mut_ptr() as *mut c_void
            }
        }
        None => ptr::null_mut(),
    }
}

pub unsafe extern "C" fn tensor_dimensions(t: *const MnnTensor) -> c_int {
    tensor(t).map_or(0, |t| t.lock().shape.len() as c_int)
}

/// Returned block carries its length one slot before the data.
pub unsafe extern "C" fn tensor_shape(t: *const MnnTensor, shape_size: *mut c_int) -> *mut c_int {
    let Some(t) = tensor(t) else {
        if !shape_size.is_null() {
            *shape_size = 0;
        }
        return ptr::null_mut();
    };
    let shape = t.lock().shape.clone();
    if !shape_size.is_null() {
        *shape_size = shape.len() as c_int;
    }
    let mut block = Vec::with_capacity(shape.len() + 1);
    block.push(shape.len() as c_int);
    block.extend(shape);
    let block = Box::into_raw(block.into_boxed_slice()) as *mut c_int;
    block.add(1)
}

pub unsafe extern "C" fn tensor_free_shape(shape: *mut c_int) {
    if shape.is_null() {
        return;
    }
    let base = shape.sub(1);
    let len = *base as usize + 1;
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)));
}

pub unsafe extern "C" fn tensor_size(t: *const MnnTensor) -> c_int {
    tensor(t).map_or(0, |t| t.lock().byte_size() as c_int)
}

pub unsafe extern "C" fn tensor_element_size(t: *const MnnTensor) -> c_int {
    tensor(t).map_or(0, |t| t.lock().element_count() as c_int)
}

/// `finish` blocks until pending work lands; otherwise polls. Either way
/// the status of the run that last wrote the tensor is returned.
pub unsafe extern "C" fn tensor_wait(t: *mut MnnTensor, _map: c_int, finish: MnnBool) -> c_int {
    let Some(t) = tensor(t) else {
        return status::INVALID_VALUE;
    };
    if truthy(finish) {
        t.wait_settled()
    } else {
        t.poll().unwrap_or(status::NO_EXECUTION)
    }
}

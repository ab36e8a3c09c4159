//! Raw C-layout declarations for the MNN C API.
//!
//! Everything in here mirrors the C headers field for field. Use the safe
//! wrappers in [`crate::engine`], [`crate::session`] and [`crate::tensor`]
//! instead of touching these types directly.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};

/// `MNN_BOOL`: `bool` under C++, `unsigned char` under C. Both are one byte.
pub type MnnBool = u8;

pub const MNN_TRUE: MnnBool = 1;
pub const MNN_FALSE: MnnBool = 0;

macro_rules! opaque {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[repr(C)]
            pub struct $name {
                _private: [u8; 0],
            }
        )*
    };
}

opaque! {
    /// `MNN_Interpreter`
    MnnInterpreter;
    /// `MNN_Session`
    MnnSession;
    /// `MNN_Tensor`
    MnnTensor;
    /// `MNN_OperatorInfo`
    MnnOperatorInfo;
    /// `MNN_Matrix`
    MnnMatrix;
    /// `MNN_ImageProcess`
    MnnImageProcess;
    /// `MNN_Express_Module`
    MnnExpressModule;
    /// `MNN_Express_VARP`
    MnnExpressVar;
    /// `MNN_Express_RuntimeManager`
    MnnRuntimeManager;
}

/// `halide_type_t`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHalideType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

/// `halide_dimension_t`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawHalideDimension {
    pub min: i32,
    pub extent: i32,
    pub stride: i32,
    pub flags: u32,
}

/// `halide_buffer_t`
#[repr(C)]
#[derive(Debug)]
pub struct RawHalideBuffer {
    pub device: u64,
    pub device_interface: *const c_void,
    pub host: *mut u8,
    pub flags: u64,
    pub type_: RawHalideType,
    pub dimensions: i32,
    pub dim: *mut RawHalideDimension,
    pub padding: *mut c_void,
}

/// `StringArray`: `std::vector<std::string>` flattened for C.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StringArray {
    pub data: *const *const c_char,
    pub size: usize,
}

/// Pointer/count pair for scalar lists handed to the native side.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IntArray {
    pub data: *mut c_int,
    pub size: usize,
}

/// `MNN_BackendConfig`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBackendConfig {
    pub memory: c_int,
    pub power: c_int,
    pub precision: c_int,
    pub flags: usize,
}

/// `MNN_ScheduleConfig_Path`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSchedulePath {
    pub inputs: StringArray,
    pub outputs: StringArray,
    pub mode: c_int,
}

/// `MNN_ScheduleConfig`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawScheduleConfig {
    pub save_tensors: StringArray,
    pub forward_type: c_int,
    pub num_thread: c_int,
    pub path: RawSchedulePath,
    pub backup_type: c_int,
    pub backend_config: *mut RawBackendConfig,
}

/// `MNN_NamedTensor`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NamedTensor {
    pub name: *const c_char,
    pub tensor: *mut MnnTensor,
}

/// `MNN_NamedTensorList`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NamedTensorList {
    pub count: c_int,
    pub tensors: *mut NamedTensor,
}

/// `MNN_ImageProcess_Config`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawImageProcessConfig {
    pub filter_type: c_int,
    pub source_format: c_int,
    pub dest_format: c_int,
    pub mean: [f32; 4],
    pub normal: [f32; 4],
    pub wrap: c_int,
}

/// `MNN_Rect`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// `MNN_Express_Config`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawExpressConfig {
    pub dynamic: MnnBool,
    pub shape_mutable: MnnBool,
    pub rearrange: MnnBool,
    pub base: *const MnnExpressModule,
}

/// `MNN_TensorCallBack`: non-zero return means "continue".
pub type TensorCallBack = unsafe extern "C" fn(
    tensors: *const *const MnnTensor,
    tensor_count: usize,
    op_name: *const c_char,
    user_data: *mut c_void,
) -> c_int;

/// `MNN_TensorCallBackWithInfo`
pub type TensorCallBackWithInfo = unsafe extern "C" fn(
    tensors: *const *const MnnTensor,
    tensor_count: usize,
    info: *const MnnOperatorInfo,
    user_data: *mut c_void,
) -> c_int;

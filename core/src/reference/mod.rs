//! An in-process engine behind the MNN C ABI.
//!
//! It speaks the same entry points as the real library (raw pointers, C
//! strings, callbacks with `userData`) but only models shapes: a run fills
//! every `f32` output element with the mean of all input elements. Models
//! are produced with [`ModelBuilder`].

pub mod model;

mod cv;
mod express;
mod interpreter;
mod tensor;

pub use model::ModelBuilder;

use crate::ffi::MnnBool;

/// `ErrorCode` values as the C API reports them.
pub(crate) mod status {
    use std::os::raw::c_int;

    pub const NO_ERROR: c_int = 0;
    pub const NOT_SUPPORT: c_int = 2;
    pub const COMPUTE_SIZE_ERROR: c_int = 3;
    pub const NO_EXECUTION: c_int = 4;
    pub const INVALID_VALUE: c_int = 5;
    pub const INPUT_DATA_ERROR: c_int = 10;
    pub const CALL_BACK_STOP: c_int = 11;
    pub const FILE_CREATE_FAILED: c_int = 30;
}

pub(crate) fn truthy(b: MnnBool) -> bool {
    b != 0
}

/// Every entry point, named after its `NativeApi` field.
pub(crate) mod exports {
    pub(crate) use super::cv::*;
    pub(crate) use super::express::*;
    pub(crate) use super::interpreter::*;
    pub(crate) use super::tensor::*;
}

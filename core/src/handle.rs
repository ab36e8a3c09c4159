//! Exclusively owned native object pointers.
//!
//! A [`Handle`] is a raw pointer plus a validity flag. It is not `Clone`,
//! so only one owner can ever hand the pointer back to its destroy
//! function. Wrappers call [`Handle::take`] on release and [`Handle::get`]
//! before every other native call.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{BridgeError, Result};
use crate::ffi;

/// Native object kinds that can sit behind a [`Handle`].
pub trait NativeObject {
    /// Human readable kind, used in error messages and logs.
    const KIND: &'static str;
}

macro_rules! native_object {
    ($($ty:ty => $kind:literal),* $(,)?) => {
        $(impl NativeObject for $ty {
            const KIND: &'static str = $kind;
        })*
    };
}

native_object! {
    ffi::MnnInterpreter => "interpreter",
    ffi::MnnSession => "session",
    ffi::MnnTensor => "tensor",
    ffi::MnnMatrix => "matrix",
    ffi::MnnImageProcess => "image processor",
    ffi::MnnExpressModule => "graph module",
    ffi::MnnExpressVar => "variable",
    ffi::MnnRuntimeManager => "runtime manager",
}

pub struct Handle<T: NativeObject> {
    ptr: *mut T,
    valid: bool,
    _owns: PhantomData<T>,
}

impl<T: NativeObject> Handle<T> {
    /// Wrap the result of a native constructor. Null means the constructor
    /// failed and no handle is produced.
    pub fn from_raw(ptr: *mut T, context: impl fmt::Display) -> Result<Self> {
        if ptr.is_null() {
            return Err(BridgeError::native_creation(format!(
                "{} ({})",
                T::KIND,
                context
            )));
        }
        Ok(Self {
            ptr,
            valid: true,
            _owns: PhantomData,
        })
    }

    /// The live pointer, or [`BridgeError::InvalidHandle`] once released.
    pub fn get(&self) -> Result<*mut T> {
        if self.valid {
            Ok(self.ptr)
        } else {
            Err(BridgeError::InvalidHandle(T::KIND))
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Invalidate the handle and yield the pointer for destruction.
    ///
    /// Returns `None` on every call after the first.
    pub fn take(&mut self) -> Option<*mut T> {
        if !self.valid {
            return None;
        }
        self.valid = false;
        Some(std::mem::replace(&mut self.ptr, std::ptr::null_mut()))
    }
}

impl<T: NativeObject> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({:p}, valid={})", T::KIND, self.ptr, self.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_constructor_result_is_a_creation_failure() {
        let err = Handle::<ffi::MnnTensor>::from_raw(std::ptr::null_mut(), "host tensor")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Native creation failed: tensor (host tensor)"
        );
    }

    #[test]
    fn take_yields_pointer_once() {
        let mut slot = 0u8;
        let ptr = &mut slot as *mut u8 as *mut ffi::MnnMatrix;
        let mut handle = Handle::from_raw(ptr, "test").unwrap();
        assert_eq!(handle.get().unwrap(), ptr);
        assert_eq!(handle.take(), Some(ptr));
        assert_eq!(handle.take(), None);
        assert!(!handle.is_valid());
        assert!(matches!(
            handle.get(),
            Err(BridgeError::InvalidHandle("matrix"))
        ));
    }
}

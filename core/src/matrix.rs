//! 3x3 transforms for image processing.

use std::sync::Arc;

use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::ffi::{MnnMatrix, RawRect};
use crate::handle::Handle;
use crate::native::NativeApi;

/// Index of each coefficient in [`Matrix::values`].
pub mod index {
    pub const SCALE_X: usize = 0;
    pub const SKEW_X: usize = 1;
    pub const TRANS_X: usize = 2;
    pub const SKEW_Y: usize = 3;
    pub const SCALE_Y: usize = 4;
    pub const TRANS_Y: usize = 5;
    pub const PERSP_0: usize = 6;
    pub const PERSP_1: usize = 7;
    pub const PERSP_2: usize = 8;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn from_ltrb(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

impl From<Rect> for RawRect {
    fn from(r: Rect) -> Self {
        Self {
            left: r.left,
            top: r.top,
            right: r.right,
            bottom: r.bottom,
        }
    }
}

impl From<RawRect> for Rect {
    fn from(r: RawRect) -> Self {
        Self::from_ltrb(r.left, r.top, r.right, r.bottom)
    }
}

fn check_index(index: usize) -> Result<i32> {
    if index < 9 {
        Ok(index as i32)
    } else {
        Err(BridgeError::argument(format!("matrix index {} out of range", index)))
    }
}

#[derive(Debug)]
pub struct Matrix {
    api: Arc<NativeApi>,
    handle: Handle<MnnMatrix>,
}

impl Matrix {
    fn wrap(api: &Arc<NativeApi>, ptr: *mut MnnMatrix, what: &str) -> Result<Self> {
        let handle = Handle::from_raw(ptr, what)?;
        debug!(what, "matrix created");
        Ok(Self {
            api: Arc::clone(api),
            handle,
        })
    }

    pub fn identity(api: &Arc<NativeApi>) -> Result<Self> {
        Self::wrap(api, unsafe { (api.matrix_create)() }, "identity")
    }

    pub fn scale(api: &Arc<NativeApi>, sx: f32, sy: f32) -> Result<Self> {
        Self::wrap(api, unsafe { (api.matrix_make_scale)(sx, sy) }, "scale")
    }

    pub fn translate(api: &Arc<NativeApi>, dx: f32, dy: f32) -> Result<Self> {
        Self::wrap(api, unsafe { (api.matrix_make_trans)(dx, dy) }, "translate")
    }

    pub fn from_values(api: &Arc<NativeApi>, values: &[f32; 9]) -> Result<Self> {
        let mut m = Self::identity(api)?;
        m.set_values(values)?;
        Ok(m)
    }

    pub(crate) fn raw(&self) -> Result<*mut MnnMatrix> {
        self.handle.get()
    }

    pub fn get(&self, index: usize) -> Result<f32> {
        let i = check_index(index)?;
        Ok(unsafe { (self.api.matrix_get)(self.handle.get()?, i) })
    }

    pub fn set(&mut self, index: usize, value: f32) -> Result<()> {
        let i = check_index(index)?;
        unsafe { (self.api.matrix_set)(self.handle.get()?, i, value) };
        Ok(())
    }

    pub fn values(&self) -> Result<[f32; 9]> {
        let mut out = [0f32; 9];
        unsafe { (self.api.matrix_get9)(self.handle.get()?, out.as_mut_ptr()) };
        Ok(out)
    }

    pub fn set_values(&mut self, values: &[f32; 9]) -> Result<()> {
        unsafe { (self.api.matrix_set9)(self.handle.get()?, values.as_ptr()) };
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        unsafe { (self.api.matrix_reset)(self.handle.get()?) };
        Ok(())
    }

    pub fn set_scale(&mut self, sx: f32, sy: f32) -> Result<()> {
        unsafe { (self.api.matrix_set_scale)(self.handle.get()?, sx, sy) };
        Ok(())
    }

    pub fn set_translate(&mut self, dx: f32, dy: f32) -> Result<()> {
        unsafe { (self.api.matrix_set_translate)(self.handle.get()?, dx, dy) };
        Ok(())
    }

    /// Rotation about the origin, in degrees.
    pub fn set_rotate(&mut self, degrees: f32) -> Result<()> {
        unsafe { (self.api.matrix_set_rotate)(self.handle.get()?, degrees) };
        Ok(())
    }

    /// `self = self * other`
    pub fn pre_concat(&mut self, other: &Matrix) -> Result<()> {
        let (m, o) = (self.handle.get()?, other.handle.get()?);
        unsafe { (self.api.matrix_pre_concat)(m, o) };
        Ok(())
    }

    /// `self = other * self`
    pub fn post_concat(&mut self, other: &Matrix) -> Result<()> {
        let (m, o) = (self.handle.get()?, other.handle.get()?);
        unsafe { (self.api.matrix_post_concat)(m, o) };
        Ok(())
    }

    pub fn is_identity(&self) -> Result<bool> {
        Ok(unsafe { (self.api.matrix_is_identity)(self.handle.get()?) })
    }

    /// Bounding box of `rect` after the transform.
    pub fn map_rect(&self, rect: Rect) -> Result<Rect> {
        let src = RawRect::from(rect);
        let mut dst = RawRect::default();
        unsafe { (self.api.matrix_map_rect)(self.handle.get()?, &mut dst, &src) };
        Ok(dst.into())
    }

    /// A new matrix holding the inverse. `self` is left untouched.
    pub fn invert(&self) -> Result<Matrix> {
        let inverse = Self::identity(&self.api)?;
        let ok = unsafe { (self.api.matrix_invert)(self.handle.get()?, inverse.handle.get()?) };
        if ok {
            Ok(inverse)
        } else {
            Err(BridgeError::NotInvertible)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn release(&mut self) {
        if let Some(m) = self.handle.take() {
            unsafe { (self.api.matrix_destroy)(m) };
        }
    }
}

impl Drop for Matrix {
    fn drop(&mut self) {
        self.release();
    }
}

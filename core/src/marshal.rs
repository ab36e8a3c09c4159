//! Managed sequences to natively addressable arrays and back.
//!
//! Every array built here owns its native memory and releases it on drop.
//! An empty input never allocates; it becomes `{null, 0}` on the C side.

use std::cell::Cell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::ffi;

thread_local! {
    static LIVE: Cell<isize> = const { Cell::new(0) };
}

fn track(delta: isize) {
    LIVE.with(|live| live.set(live.get() + delta));
}

/// Blocks and element copies allocated minus released on this thread.
pub fn live_allocations() -> isize {
    LIVE.with(Cell::get)
}

/// A list of NUL-terminated strings laid out as `const char**` plus a count.
#[derive(Debug)]
pub struct NativeStringArray {
    block: *mut *const c_char,
    len: usize,
}

impl NativeStringArray {
    /// Copy `items` into native memory.
    ///
    /// Interior NUL bytes are rejected before anything is allocated.
    pub fn new<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let mut array = Self::empty();
        array.replace(items)?;
        Ok(array)
    }

    pub fn empty() -> Self {
        Self {
            block: ptr::null_mut(),
            len: 0,
        }
    }

    /// Swap in new contents, releasing the previous native copy first.
    pub fn replace<S: AsRef<str>>(&mut self, items: &[S]) -> Result<()> {
        let owned = items
            .iter()
            .map(|s| {
                CString::new(s.as_ref()).map_err(|_| {
                    BridgeError::argument(format!("string contains a NUL byte: {:?}", s.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.free();
        if owned.is_empty() {
            return Ok(());
        }

        let pointers: Box<[*const c_char]> = owned
            .into_iter()
            .map(|s| {
                track(1);
                s.into_raw() as *const c_char
            })
            .collect();
        self.len = pointers.len();
        self.block = Box::into_raw(pointers) as *mut *const c_char;
        track(1);
        trace!(len = self.len, "string array marshalled");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The C view. Valid until `self` is dropped or replaced.
    pub fn as_raw(&self) -> ffi::StringArray {
        ffi::StringArray {
            data: self.block as *const *const c_char,
            size: self.len,
        }
    }

    pub fn to_vec(&self) -> Vec<String> {
        // SAFETY: the block and its strings are owned by self and live.
        unsafe { read_strings(self.as_raw()) }.unwrap_or_default()
    }

    fn free(&mut self) {
        if self.block.is_null() {
            return;
        }
        // SAFETY: block came from Box<[*const c_char]> of length len, each
        // element from CString::into_raw.
        unsafe {
            let pointers = Box::from_raw(ptr::slice_from_raw_parts_mut(self.block, self.len));
            for &p in pointers.iter() {
                drop(CString::from_raw(p as *mut c_char));
                track(-1);
            }
        }
        track(-1);
        self.block = ptr::null_mut();
        self.len = 0;
    }
}

impl Drop for NativeStringArray {
    fn drop(&mut self) {
        self.free();
    }
}

/// Read a native string array back into managed strings.
///
/// # Safety
///
/// `raw.data` must be null or point to `raw.size` valid C strings.
pub unsafe fn read_strings(raw: ffi::StringArray) -> Result<Vec<String>> {
    if raw.data.is_null() || raw.size == 0 {
        return Ok(Vec::new());
    }
    std::slice::from_raw_parts(raw.data, raw.size)
        .iter()
        .map(|&p| {
            if p.is_null() {
                return Err(BridgeError::argument("null entry in string array"));
            }
            CStr::from_ptr(p)
                .to_str()
                .map(str::to_owned)
                .map_err(|_| BridgeError::argument("string array entry is not UTF-8"))
        })
        .collect()
}

/// A list of C ints laid out as `int*` plus a count.
#[derive(Debug)]
pub struct NativeIntArray {
    data: *mut c_int,
    len: usize,
}

impl NativeIntArray {
    pub fn new(items: &[i32]) -> Self {
        let mut array = Self {
            data: ptr::null_mut(),
            len: 0,
        };
        array.replace(items);
        array
    }

    /// Swap in new contents, releasing the previous native copy first.
    pub fn replace(&mut self, items: &[i32]) {
        self.free();
        if items.is_empty() {
            return;
        }
        let block: Box<[c_int]> = items.iter().map(|&v| v as c_int).collect();
        self.len = block.len();
        self.data = Box::into_raw(block) as *mut c_int;
        track(1);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_raw(&self) -> ffi::IntArray {
        ffi::IntArray {
            data: self.data,
            size: self.len,
        }
    }

    pub fn to_vec(&self) -> Vec<i32> {
        if self.data.is_null() {
            return Vec::new();
        }
        // SAFETY: data points to len ints owned by self.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }.to_vec()
    }

    fn free(&mut self) {
        if self.data.is_null() {
            return;
        }
        // SAFETY: data came from Box<[c_int]> of length len.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.data, self.len)));
        }
        track(-1);
        self.data = ptr::null_mut();
        self.len = 0;
    }
}

impl Drop for NativeIntArray {
    fn drop(&mut self) {
        self.free();
    }
}

/// An int array allocated by the native side, handed back through its own
/// free function exactly once.
pub struct ForeignIntArray {
    data: *mut c_int,
    len: usize,
    release: unsafe extern "C" fn(*mut c_int),
}

impl ForeignIntArray {
    /// # Safety
    ///
    /// `data` must be null or point to `len` ints that `release` frees.
    pub unsafe fn from_raw(
        data: *mut c_int,
        len: usize,
        release: unsafe extern "C" fn(*mut c_int),
    ) -> Self {
        Self { data, len, release }
    }

    pub fn as_slice(&self) -> &[i32] {
        if self.data.is_null() || self.len == 0 {
            return &[];
        }
        // SAFETY: guaranteed by from_raw.
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }
}

impl Drop for ForeignIntArray {
    fn drop(&mut self) {
        if !self.data.is_null() {
            // SAFETY: guaranteed by from_raw; data is nulled so this runs once.
            unsafe { (self.release)(self.data) };
            self.data = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_maps_to_null() {
        let before = live_allocations();
        let names: [&str; 0] = [];
        let array = NativeStringArray::new(&names).unwrap();
        let raw = array.as_raw();
        assert!(raw.data.is_null());
        assert_eq!(raw.size, 0);
        assert_eq!(live_allocations(), before);

        let ints = NativeIntArray::new(&[]);
        assert!(ints.as_raw().data.is_null());
        assert_eq!(ints.as_raw().size, 0);
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn strings_round_trip_and_free() {
        let before = live_allocations();
        {
            let array = NativeStringArray::new(&["input", "output", "prob"]).unwrap();
            assert_eq!(array.len(), 3);
            assert_eq!(live_allocations(), before + 4);
            assert_eq!(array.to_vec(), vec!["input", "output", "prob"]);
        }
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn replace_releases_previous_contents() {
        let before = live_allocations();
        let mut array = NativeStringArray::new(&["a", "b"]).unwrap();
        array.replace(&["c"]).unwrap();
        assert_eq!(live_allocations(), before + 2);
        assert_eq!(array.to_vec(), vec!["c"]);
        array.replace::<&str>(&[]).unwrap();
        assert!(array.as_raw().data.is_null());
        assert_eq!(live_allocations(), before);

        let mut ints = NativeIntArray::new(&[1, 2, 3]);
        ints.replace(&[4]);
        assert_eq!(ints.to_vec(), vec![4]);
        drop(ints);
        assert_eq!(live_allocations(), before);
    }

    #[test]
    fn interior_nul_rejected_without_allocating() {
        let before = live_allocations();
        let mut array = NativeStringArray::new(&["keep"]).unwrap();
        let err = array.replace(&["bad\0name"]).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentMismatch(_)));
        assert_eq!(array.to_vec(), vec!["keep"]);
        drop(array);
        assert_eq!(live_allocations(), before);
    }
}

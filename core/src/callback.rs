//! Per-operator callbacks during a session run.
//!
//! Native code calls one of four fixed `extern "C"` trampolines and passes
//! back the `userData` pointer it was given. That pointer is the
//! [`CallbackContext`] of the run in flight, so concurrent runs never share
//! callback state. A null `userData` means no run is armed and the
//! trampoline answers "continue".

use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::ffi::{MnnOperatorInfo, MnnTensor, TensorCallBack, TensorCallBackWithInfo};
use crate::native::{c_string, NativeApi};
use crate::tensor::TensorRef;

/// Hook receiving the operator's tensors and name. Returning `false` before
/// an operator skips it; returning `false` after one stops the run.
pub type NamedHook<'f> = Box<dyn FnMut(&[TensorRef<'_>], &str) -> bool + 'f>;

/// Like [`NamedHook`], with full operator information.
pub type InfoHook<'f> = Box<dyn FnMut(&[TensorRef<'_>], &OperatorInfo<'_>) -> bool + 'f>;

/// Borrowed view of the operator a callback fires for.
#[derive(Debug, Clone, Copy)]
pub struct OperatorInfo<'a> {
    api: &'a NativeApi,
    ptr: *const MnnOperatorInfo,
}

impl OperatorInfo<'_> {
    pub fn name(&self) -> String {
        unsafe { c_string((self.api.operator_info_name)(self.ptr)) }.unwrap_or_default()
    }

    pub fn type_name(&self) -> String {
        unsafe { c_string((self.api.operator_info_type)(self.ptr)) }.unwrap_or_default()
    }

    /// Floating point operations, in millions.
    pub fn flops(&self) -> f32 {
        unsafe { (self.api.operator_info_flops)(self.ptr) }
    }
}

/// Callbacks armed for one run.
pub(crate) struct CallbackContext<H> {
    api: Arc<NativeApi>,
    before: H,
    after: H,
    panicked: bool,
}

/// Hook state kept alive by an in-flight background run.
pub(crate) trait RunContext {
    fn panicked(&self) -> bool;
}

impl<H> RunContext for CallbackContext<H> {
    fn panicked(&self) -> bool {
        self.panicked
    }
}

impl<H: 'static> CallbackContext<H> {
    /// Erase the hook type, keeping the panic flag readable.
    pub(crate) fn into_run_context(self: Box<Self>) -> Box<dyn RunContext> {
        self
    }
}

impl<H> CallbackContext<H> {
    pub(crate) fn new(api: Arc<NativeApi>, before: H, after: H) -> Box<Self> {
        Box::new(Self {
            api,
            before,
            after,
            panicked: false,
        })
    }

    pub(crate) fn as_user_data(self: &mut Box<Self>) -> *mut c_void {
        &mut **self as *mut Self as *mut c_void
    }

    /// Whether a hook panicked during the run.
    pub(crate) fn panicked(&self) -> bool {
        self.panicked
    }
}

impl<'f> CallbackContext<NamedHook<'f>> {
    pub(crate) fn trampolines() -> (Option<TensorCallBack>, Option<TensorCallBack>) {
        (Some(named_before), Some(named_after))
    }
}

impl<'f> CallbackContext<InfoHook<'f>> {
    pub(crate) fn trampolines() -> (Option<TensorCallBackWithInfo>, Option<TensorCallBackWithInfo>) {
        (Some(info_before), Some(info_after))
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Before,
    After,
}

/// Collect borrowed views of the native tensor list.
unsafe fn views<'a>(
    api: &'a Arc<NativeApi>,
    tensors: *const *const MnnTensor,
    count: usize,
) -> Vec<TensorRef<'a>> {
    if tensors.is_null() || count == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(tensors, count)
        .iter()
        .filter_map(|&t| TensorRef::from_raw(api, t as *mut MnnTensor, "callback tensor").ok())
        .collect()
}

/// Run `hook` at the boundary. A panic is logged, remembered and reported
/// to native code as "stop".
fn guarded(panicked: &mut bool, op: &str, hook: impl FnOnce() -> bool) -> c_int {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(verdict) => c_int::from(verdict),
        Err(_) => {
            error!(op, "operator callback panicked, stopping run");
            *panicked = true;
            0
        }
    }
}

unsafe fn dispatch_named(
    tensors: *const *const MnnTensor,
    count: usize,
    op_name: *const c_char,
    user_data: *mut c_void,
    phase: Phase,
) -> c_int {
    if user_data.is_null() {
        return 1;
    }
    // SAFETY: user_data is the context of the run in flight; its real
    // lifetime outlives the run, and the reference does not escape it.
    let ctx = &mut *(user_data as *mut CallbackContext<NamedHook<'static>>);
    let name = c_string(op_name).unwrap_or_default();
    trace!(op = %name, ?phase, "callback");
    let views = views(&ctx.api, tensors, count);
    let hook = match phase {
        Phase::Before => &mut ctx.before,
        Phase::After => &mut ctx.after,
    };
    guarded(&mut ctx.panicked, &name, || hook(views.as_slice(), name.as_str()))
}

unsafe fn dispatch_info(
    tensors: *const *const MnnTensor,
    count: usize,
    info: *const MnnOperatorInfo,
    user_data: *mut c_void,
    phase: Phase,
) -> c_int {
    if user_data.is_null() {
        return 1;
    }
    // SAFETY: as in dispatch_named.
    let ctx = &mut *(user_data as *mut CallbackContext<InfoHook<'static>>);
    let info = OperatorInfo {
        api: &ctx.api,
        ptr: info,
    };
    let name = info.name();
    trace!(op = %name, ?phase, "callback with info");
    let views = views(&ctx.api, tensors, count);
    let hook = match phase {
        Phase::Before => &mut ctx.before,
        Phase::After => &mut ctx.after,
    };
    guarded(&mut ctx.panicked, &name, || hook(views.as_slice(), &info))
}

unsafe extern "C" fn named_before(
    tensors: *const *const MnnTensor,
    count: usize,
    op_name: *const c_char,
    user_data: *mut c_void,
) -> c_int {
    dispatch_named(tensors, count, op_name, user_data, Phase::Before)
}

unsafe extern "C" fn named_after(
    tensors: *const *const MnnTensor,
    count: usize,
    op_name: *const c_char,
    user_data: *mut c_void,
) -> c_int {
    dispatch_named(tensors, count, op_name, user_data, Phase::After)
}

unsafe extern "C" fn info_before(
    tensors: *const *const MnnTensor,
    count: usize,
    info: *const MnnOperatorInfo,
    user_data: *mut c_void,
) -> c_int {
    dispatch_info(tensors, count, info, user_data, Phase::Before)
}

unsafe extern "C" fn info_after(
    tensors: *const *const MnnTensor,
    count: usize,
    info: *const MnnOperatorInfo,
    user_data: *mut c_void,
) -> c_int {
    dispatch_info(tensors, count, info, user_data, Phase::After)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::ffi::CString;
    use std::ptr;

    #[test]
    fn idle_trampolines_continue() {
        let name = CString::new("conv").unwrap();
        let (before, after) = CallbackContext::<NamedHook<'_>>::trampolines();
        for cb in [before.unwrap(), after.unwrap()] {
            assert_eq!(unsafe { cb(ptr::null(), 0, name.as_ptr(), ptr::null_mut()) }, 1);
        }
        let (before, _) = CallbackContext::<InfoHook<'_>>::trampolines();
        assert_eq!(
            unsafe { before.unwrap()(ptr::null(), 0, ptr::null(), ptr::null_mut()) },
            1
        );
    }

    #[test]
    fn armed_context_routes_to_its_hooks() {
        let seen = RefCell::new(Vec::new());
        let mut ctx = CallbackContext::new(
            Arc::new(NativeApi::reference()),
            Box::new(|_: &[TensorRef<'_>], op: &str| {
                seen.borrow_mut().push(format!("before {}", op));
                op != "skip"
            }) as NamedHook<'_>,
            Box::new(|_: &[TensorRef<'_>], op: &str| {
                seen.borrow_mut().push(format!("after {}", op));
                false
            }) as NamedHook<'_>,
        );
        let user_data = ctx.as_user_data();
        let (before, after) = CallbackContext::<NamedHook<'_>>::trampolines();
        let (before, after) = (before.unwrap(), after.unwrap());
        let conv = CString::new("conv").unwrap();
        let skip = CString::new("skip").unwrap();
        unsafe {
            assert_eq!(before(ptr::null(), 0, conv.as_ptr(), user_data), 1);
            assert_eq!(before(ptr::null(), 0, skip.as_ptr(), user_data), 0);
            assert_eq!(after(ptr::null(), 0, conv.as_ptr(), user_data), 0);
        }
        drop(ctx);
        assert_eq!(
            seen.into_inner(),
            vec!["before conv", "before skip", "after conv"]
        );
    }

    #[test]
    fn panicking_hook_reports_stop() {
        let mut ctx = CallbackContext::new(
            Arc::new(NativeApi::reference()),
            Box::new(|_: &[TensorRef<'_>], _: &str| -> bool { panic!("hook failed") }) as NamedHook<'_>,
            Box::new(|_: &[TensorRef<'_>], _: &str| true) as NamedHook<'_>,
        );
        let user_data = ctx.as_user_data();
        let (before, _) = CallbackContext::<NamedHook<'_>>::trampolines();
        let name = CString::new("relu").unwrap();
        let verdict = unsafe { before.unwrap()(ptr::null(), 0, name.as_ptr(), user_data) };
        assert_eq!(verdict, 0);
        assert!(ctx.panicked());
    }
}

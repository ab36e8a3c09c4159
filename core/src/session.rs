//! Inference sessions.
//!
//! A [`Session`] moves through `Built -> InputBound -> Ran -> OutputRead`
//! and back to `InputBound` for the next cycle. Tensors it hands out are
//! [`TensorRef`]s borrowed from the session.

use std::ffi::{c_void, CString};
use std::os::raw::c_int;
use std::ptr;

use tracing::{debug, warn};

use crate::callback::{CallbackContext, InfoHook, NamedHook, OperatorInfo, RunContext};
use crate::engine::Engine;
use crate::error::{BridgeError, ErrorCode, Result};
use crate::ffi::{self, MnnSession, MnnTensor, NamedTensorList};
use crate::handle::Handle;
use crate::marshal::NativeIntArray;
use crate::native::c_string;
use crate::schedule::ForwardType;
use crate::tensor::{MapType, Tensor, TensorAccess, TensorRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Built,
    InputBound,
    Ran,
    OutputRead,
}

/// Queries answered by [`Session::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInfoCode {
    Memory = 0,
    Flops = 1,
    Backends = 2,
    ResizeStatus = 3,
    ThreadNumber = 4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionInfo {
    /// Memory held by the session, in MB.
    Memory(f32),
    /// Work per run, in MFLOPs.
    Flops(f32),
    Backends {
        forward: Option<ForwardType>,
        backup: Option<ForwardType>,
    },
    /// `true` once every pending resize has been applied.
    ResizeReady(bool),
    ThreadNumber(i32),
}

fn c_name(name: Option<&str>) -> Result<Option<CString>> {
    name.map(|n| {
        CString::new(n).map_err(|_| BridgeError::argument(format!("tensor name contains NUL: {:?}", n)))
    })
    .transpose()
}

/// A runnable session of an [`Engine`].
#[derive(Debug)]
pub struct Session<'e> {
    engine: &'e Engine,
    handle: Handle<MnnSession>,
    phase: Phase,
    pending_resize: bool,
}

impl<'e> Session<'e> {
    pub(crate) fn new(engine: &'e Engine, handle: Handle<MnnSession>) -> Self {
        Self {
            engine,
            handle,
            phase: Phase::Built,
            pending_resize: false,
        }
    }

    pub(crate) fn raw(&self) -> Result<*mut MnnSession> {
        self.handle.get()
    }

    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn lookup(&self, name: Option<&str>, output: bool) -> Result<TensorRef<'_>> {
        let net = self.engine.raw()?;
        let s = self.handle.get()?;
        let api = self.engine.api();
        let c = c_name(name)?;
        let c_ptr = c.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        let t = unsafe {
            if output {
                (api.interpreter_get_session_output)(net, s, c_ptr)
            } else {
                (api.interpreter_get_session_input)(net, s, c_ptr)
            }
        };
        let what = match (output, name) {
            (true, Some(n)) => format!("output {}", n),
            (true, None) => "default output".to_string(),
            (false, Some(n)) => format!("input {}", n),
            (false, None) => "default input".to_string(),
        };
        // SAFETY: session tensors live as long as the session.
        unsafe { TensorRef::from_raw(api, t, &what) }
    }

    /// Input tensor by name; `None` picks the first input.
    pub fn input(&self, name: Option<&str>) -> Result<TensorRef<'_>> {
        self.lookup(name, false)
    }

    /// Output tensor by name; `None` picks the first output.
    pub fn output(&self, name: Option<&str>) -> Result<TensorRef<'_>> {
        self.lookup(name, true)
    }

    fn named_list(&self, list: NamedTensorList) -> Vec<(String, TensorRef<'_>)> {
        let api = self.engine.api();
        let mut out = Vec::new();
        if !list.tensors.is_null() {
            // SAFETY: the list holds `count` entries until freed below.
            let entries = unsafe { std::slice::from_raw_parts(list.tensors, list.count.max(0) as usize) };
            for entry in entries {
                let name = unsafe { c_string(entry.name) }.unwrap_or_default();
                if let Ok(t) = unsafe { TensorRef::from_raw(api, entry.tensor, &name) } {
                    out.push((name, t));
                }
            }
        }
        unsafe { (api.named_tensor_list_free)(list) };
        out
    }

    pub fn inputs(&self) -> Result<Vec<(String, TensorRef<'_>)>> {
        let (net, s) = (self.engine.raw()?, self.handle.get()?);
        let list = unsafe { (self.engine.api().interpreter_get_session_input_all)(net, s) };
        Ok(self.named_list(list))
    }

    pub fn outputs(&self) -> Result<Vec<(String, TensorRef<'_>)>> {
        let (net, s) = (self.engine.raw()?, self.handle.get()?);
        let list = unsafe { (self.engine.api().interpreter_get_session_output_all)(net, s) };
        Ok(self.named_list(list))
    }

    /// Change the shape of one of this session's tensors. The session is
    /// resized before the next run. Empty `dims` is a no-op.
    pub fn resize_tensor(&mut self, name: Option<&str>, dims: &[i32]) -> Result<()> {
        if dims.is_empty() {
            return Ok(());
        }
        if dims.iter().any(|&d| d < 0) {
            return Err(BridgeError::argument(format!("negative extent in {:?}", dims)));
        }
        let t = self.input(name)?.as_ptr();
        let net = self.engine.raw()?;
        let array = NativeIntArray::new(dims);
        let raw = array.as_raw();
        unsafe { (self.engine.api().interpreter_resize_tensor)(net, t, raw.data, raw.size as c_int) };
        self.pending_resize = true;
        if self.phase != Phase::Built {
            self.phase = Phase::Built;
        }
        Ok(())
    }

    /// Apply pending tensor resizes.
    pub fn resize(&mut self) -> Result<()> {
        let (net, s) = (self.engine.raw()?, self.handle.get()?);
        unsafe { (self.engine.api().interpreter_resize_session)(net, s) };
        self.pending_resize = false;
        Ok(())
    }

    pub fn resize_ex(&mut self, need_realloc: bool) -> Result<()> {
        let (net, s) = (self.engine.raw()?, self.handle.get()?);
        unsafe { (self.engine.api().interpreter_resize_session_ex)(net, s, c_int::from(need_realloc)) };
        self.pending_resize = false;
        Ok(())
    }

    /// Copy `host` into the named input.
    pub fn bind_input(&mut self, name: Option<&str>, host: &Tensor) -> Result<()> {
        self.input(name)?.copy_from_host(host)?;
        self.phase = Phase::InputBound;
        Ok(())
    }

    fn output_ptrs(&self) -> Result<Vec<*mut MnnTensor>> {
        Ok(self.outputs()?.into_iter().map(|(_, t)| t.as_ptr()).collect())
    }

    fn before_run(&mut self) -> Result<(*mut ffi::MnnInterpreter, *mut MnnSession)> {
        if self.pending_resize {
            debug!("applying pending resize before run");
            self.resize()?;
        }
        Ok((self.engine.raw()?, self.handle.get()?))
    }

    fn finish_run(&mut self, code: c_int, op: &'static str) -> Result<()> {
        ErrorCode::check(code, op)?;
        self.phase = Phase::Ran;
        Ok(())
    }

    /// Run synchronously.
    pub fn run(&mut self) -> Result<()> {
        let (net, s) = self.before_run()?;
        let code = unsafe { (self.engine.api().interpreter_run_session)(net, s) };
        self.finish_run(code, "Session run")
    }

    /// Run synchronously, calling `before` and `after` around every
    /// operator with its tensors and name.
    pub fn run_with_callbacks<B, A>(&mut self, before: B, after: A) -> Result<()>
    where
        B: FnMut(&[TensorRef<'_>], &str) -> bool,
        A: FnMut(&[TensorRef<'_>], &str) -> bool,
    {
        let (net, s) = self.before_run()?;
        let api = self.engine.api();
        let mut ctx = CallbackContext::new(
            api.clone(),
            Box::new(before) as NamedHook<'_>,
            Box::new(after) as NamedHook<'_>,
        );
        let (b, a) = CallbackContext::<NamedHook<'_>>::trampolines();
        let code = unsafe {
            (api.interpreter_run_session_with_callback)(net, s, b, a, ffi::MNN_TRUE, ctx.as_user_data())
        };
        if ctx.panicked() {
            warn!("run stopped by a panicking callback");
        }
        drop(ctx);
        self.finish_run(code, "Session run with callbacks")
    }

    /// Like [`run_with_callbacks`](Self::run_with_callbacks), with full
    /// operator information.
    pub fn run_with_callbacks_info<B, A>(&mut self, before: B, after: A) -> Result<()>
    where
        B: FnMut(&[TensorRef<'_>], &OperatorInfo<'_>) -> bool,
        A: FnMut(&[TensorRef<'_>], &OperatorInfo<'_>) -> bool,
    {
        let (net, s) = self.before_run()?;
        let api = self.engine.api();
        let mut ctx = CallbackContext::new(
            api.clone(),
            Box::new(before) as InfoHook<'_>,
            Box::new(after) as InfoHook<'_>,
        );
        let (b, a) = CallbackContext::<InfoHook<'_>>::trampolines();
        let code = unsafe {
            (api.interpreter_run_session_with_callback_info)(net, s, b, a, ffi::MNN_TRUE, ctx.as_user_data())
        };
        if ctx.panicked() {
            warn!("run stopped by a panicking callback");
        }
        drop(ctx);
        self.finish_run(code, "Session run with callbacks")
    }

    /// Start a run and return immediately. The callbacks may fire on
    /// another thread; the returned [`PendingRun`] keeps them alive and
    /// waits for the run when dropped.
    pub fn run_with_callbacks_async<B, A>(&mut self, before: B, after: A) -> Result<PendingRun<'_, 'e>>
    where
        B: FnMut(&[TensorRef<'_>], &str) -> bool + Send + 'static,
        A: FnMut(&[TensorRef<'_>], &str) -> bool + Send + 'static,
    {
        let (net, s) = self.before_run()?;
        let outputs = self.output_ptrs()?;
        let api = self.engine.api();
        let mut ctx = CallbackContext::new(
            api.clone(),
            Box::new(before) as NamedHook<'static>,
            Box::new(after) as NamedHook<'static>,
        );
        let (b, a) = CallbackContext::<NamedHook<'static>>::trampolines();
        let code = unsafe {
            (api.interpreter_run_session_with_callback)(net, s, b, a, ffi::MNN_FALSE, ctx.as_user_data())
        };
        ErrorCode::check(code, "Async session run")?;
        Ok(PendingRun::new(self, outputs, ctx.into_run_context()))
    }

    pub fn run_with_callbacks_info_async<B, A>(
        &mut self,
        before: B,
        after: A,
    ) -> Result<PendingRun<'_, 'e>>
    where
        B: FnMut(&[TensorRef<'_>], &OperatorInfo<'_>) -> bool + Send + 'static,
        A: FnMut(&[TensorRef<'_>], &OperatorInfo<'_>) -> bool + Send + 'static,
    {
        let (net, s) = self.before_run()?;
        let outputs = self.output_ptrs()?;
        let api = self.engine.api();
        let mut ctx = CallbackContext::new(
            api.clone(),
            Box::new(before) as InfoHook<'static>,
            Box::new(after) as InfoHook<'static>,
        );
        let (b, a) = CallbackContext::<InfoHook<'static>>::trampolines();
        let code = unsafe {
            (api.interpreter_run_session_with_callback_info)(net, s, b, a, ffi::MNN_FALSE, ctx.as_user_data())
        };
        ErrorCode::check(code, "Async session run")?;
        Ok(PendingRun::new(self, outputs, ctx.into_run_context()))
    }

    /// Host copy of an output tensor.
    pub fn read_output(&mut self, name: Option<&str>) -> Result<Tensor> {
        let output = self.output(name)?;
        output.wait(MapType::Read, true)?;
        let host = Tensor::host_from_device(&output, true)?;
        self.phase = Phase::OutputRead;
        Ok(host)
    }

    pub fn info(&self, code: SessionInfoCode) -> Result<SessionInfo> {
        let (net, s) = (self.engine.raw()?, self.handle.get()?);
        let api = self.engine.api();
        let mut words = [0i32; 2];
        let ok = unsafe {
            (api.interpreter_get_session_info)(net, s, code as c_int, words.as_mut_ptr() as *mut c_void)
        };
        if ok == ffi::MNN_FALSE {
            return Err(BridgeError::EngineRun {
                op: "Session info",
                code: ErrorCode::NotSupport,
            });
        }
        let float = f32::from_bits(words[0] as u32);
        Ok(match code {
            SessionInfoCode::Memory => SessionInfo::Memory(float),
            SessionInfoCode::Flops => SessionInfo::Flops(float),
            SessionInfoCode::Backends => SessionInfo::Backends {
                forward: ForwardType::from_raw(words[0]),
                backup: ForwardType::from_raw(words[1]),
            },
            SessionInfoCode::ResizeStatus => SessionInfo::ResizeReady(words[0] == 0),
            SessionInfoCode::ThreadNumber => SessionInfo::ThreadNumber(words[0]),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Release the native session. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(s) = self.handle.take() else {
            return;
        };
        match self.engine.raw() {
            Ok(net) => {
                let released = unsafe { (self.engine.api().interpreter_release_session)(net, s) };
                if released == ffi::MNN_FALSE {
                    warn!("engine did not recognise the session being released");
                }
                debug!("session released");
            }
            Err(_) => warn!("engine released before its session"),
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A run started by one of the `_async` methods.
///
/// Holds the session exclusively and keeps the callbacks alive until the
/// run finishes. Dropping it waits.
pub struct PendingRun<'s, 'e> {
    session: &'s mut Session<'e>,
    outputs: Vec<*mut MnnTensor>,
    context: Box<dyn RunContext>,
    done: bool,
}

impl<'s, 'e> PendingRun<'s, 'e> {
    fn new(session: &'s mut Session<'e>, outputs: Vec<*mut MnnTensor>, context: Box<dyn RunContext>) -> Self {
        Self {
            session,
            outputs,
            context,
            done: false,
        }
    }

    /// Wait on every output, keeping the first failure.
    fn wait_outputs(&self, finish: bool) -> Result<()> {
        let api = self.session.engine.api();
        let flag = if finish { ffi::MNN_TRUE } else { ffi::MNN_FALSE };
        let mut status = Ok(());
        for &t in &self.outputs {
            let code = unsafe { (api.tensor_wait)(t, MapType::Read as c_int, flag) };
            if status.is_ok() {
                status = ErrorCode::check(code, "Async session run");
            }
            if !finish && status.is_err() {
                break;
            }
        }
        status
    }

    /// Poll without blocking. A run that ended with an error is complete;
    /// [`wait`](Self::wait) reports the error.
    pub fn is_complete(&self) -> Result<bool> {
        if self.done {
            return Ok(true);
        }
        match self.wait_outputs(false) {
            Ok(()) => Ok(true),
            Err(BridgeError::EngineRun {
                code: ErrorCode::NoExecution,
                ..
            }) => Ok(false),
            Err(BridgeError::EngineRun { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Block until the run has finished, failing with its status when a
    /// callback stopped it.
    pub fn wait(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let status = self.wait_outputs(true);
        self.done = true;
        if self.context.panicked() {
            warn!("async run stopped by a panicking callback");
        }
        status?;
        self.session.phase = Phase::Ran;
        Ok(())
    }
}

impl Drop for PendingRun<'_, '_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(error = %e, "waiting for pending run failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeApi;
    use crate::reference::ModelBuilder;
    use crate::schedule::ScheduleConfig;
    use crate::tensor::DimensionType;
    use std::sync::Arc;

    fn engine() -> Engine {
        let model = ModelBuilder::new()
            .input("data", &[1, 2])
            .output("prob", &[1, 3])
            .op("fc", "InnerProduct", 0.5)
            .build();
        Engine::from_buffer(Arc::new(NativeApi::reference()), &model).unwrap()
    }

    #[test]
    fn phases_follow_the_cycle() {
        let engine = engine();
        let mut session = engine.create_session(&ScheduleConfig::default()).unwrap();
        assert_eq!(session.phase(), Phase::Built);
        let host = Tensor::host_from_f32(engine.api(), &[1, 2], &[1.0, 3.0], DimensionType::Caffe).unwrap();
        session.bind_input(Some("data"), &host).unwrap();
        assert_eq!(session.phase(), Phase::InputBound);
        session.run().unwrap();
        assert_eq!(session.phase(), Phase::Ran);
        let out = session.read_output(None).unwrap();
        assert_eq!(session.phase(), Phase::OutputRead);
        assert_eq!(out.read_f32().unwrap(), vec![2.0; 3]);
    }

    #[test]
    fn unknown_tensor_name_fails() {
        let engine = engine();
        let session = engine.create_session(&ScheduleConfig::default()).unwrap();
        assert!(matches!(
            session.input(Some("missing")),
            Err(BridgeError::NativeCreation(_))
        ));
        assert!(session.input(Some("bad\0name")).is_err());
    }

    #[test]
    fn info_reports_threads_and_backends() {
        let engine = engine();
        let session = engine
            .create_session(&ScheduleConfig::default().with_threads(2))
            .unwrap();
        assert_eq!(
            session.info(SessionInfoCode::ThreadNumber).unwrap(),
            SessionInfo::ThreadNumber(2)
        );
        assert_eq!(
            session.info(SessionInfoCode::Backends).unwrap(),
            SessionInfo::Backends {
                forward: Some(ForwardType::Cpu),
                backup: Some(ForwardType::Cpu),
            }
        );
        assert_eq!(
            session.info(SessionInfoCode::Flops).unwrap(),
            SessionInfo::Flops(0.5)
        );
    }

    #[test]
    fn release_is_idempotent() {
        let engine = engine();
        let mut session = engine.create_session(&ScheduleConfig::default()).unwrap();
        session.release();
        session.release();
        assert!(!session.is_valid());
        assert!(matches!(session.run(), Err(BridgeError::InvalidHandle("session"))));
    }
}

//! Model interpreters.
//!
//! An [`Engine`] owns one native interpreter. Sessions borrow it, so an
//! engine can only be released once every session created from it is gone.

use std::ffi::CString;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{BridgeError, ErrorCode, Result};
use crate::ffi::{MnnInterpreter, MnnSession};
use crate::handle::Handle;
use crate::marshal::NativeIntArray;
use crate::native::{c_string, NativeApi};
use crate::schedule::ScheduleConfig;
use crate::session::Session;

/// Interpreter-wide behaviour switches (`MNN_SessionMode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Debug = 0,
    Release = 1,
    InputInside = 2,
    InputUser = 3,
    OutputInside = 4,
    OutputUser = 5,
    ResizeDirect = 6,
    ResizeDefer = 7,
    BackendFix = 8,
    BackendAuto = 9,
    MemoryCollect = 10,
    MemoryCache = 11,
    CodegenDisable = 12,
    CodegenEnable = 13,
    ResizeCheck = 14,
    ResizeFix = 15,
    ModuleForwardSeparate = 16,
    ModuleForwardCombine = 17,
}

/// Tuning hints applied to sessions created afterwards (`MNN_HintMode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintMode {
    MaxTuningNumber = 0,
    StrictCheckModel = 1,
    MemAllocatorType = 2,
    WinogradMemoryLevel = 3,
    GeometryComputeMask = 4,
    DynamicQuantOptions = 5,
    CpuLittleCoreDecreaseRate = 6,
    QkvQuantOptions = 7,
    KvCacheSizeLimit = 8,
    OpEncoderNumberForCommit = 9,
    KvCacheInfo = 10,
    MmapFileSize = 11,
    UseCachedMmap = 12,
    InitThreadNumber = 13,
    CpuCoreIds = 14,
    CpuSme2Instructions = 15,
    CpuEnableKleidiAi = 16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Created,
    Configured,
}

fn path_string(path: &Path) -> Result<CString> {
    CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| BridgeError::argument(format!("path contains NUL: {}", path.display())))
}

/// A loaded model.
#[derive(Debug)]
pub struct Engine {
    api: Arc<NativeApi>,
    handle: Handle<MnnInterpreter>,
    state: EngineState,
}

impl Engine {
    /// Load a model file.
    pub fn from_file(api: Arc<NativeApi>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BridgeError::FileNotFound(path.to_path_buf()));
        }
        let file = path_string(path)?;
        let ptr = unsafe { (api.interpreter_create_from_file)(file.as_ptr()) };
        let handle = Handle::from_raw(ptr, format_args!("interpreter from {}", path.display()))?;
        debug!(path = %path.display(), "engine created");
        Ok(Self {
            api,
            handle,
            state: EngineState::Created,
        })
    }

    /// Load a model from memory. The native side copies the buffer.
    pub fn from_buffer(api: Arc<NativeApi>, buffer: &[u8]) -> Result<Self> {
        if buffer.is_empty() {
            return Err(BridgeError::native_creation("interpreter from empty buffer"));
        }
        let ptr = unsafe { (api.interpreter_create_from_buffer)(buffer.as_ptr().cast(), buffer.len()) };
        let handle = Handle::from_raw(ptr, "interpreter from buffer")?;
        debug!(bytes = buffer.len(), "engine created");
        Ok(Self {
            api,
            handle,
            state: EngineState::Created,
        })
    }

    pub fn api(&self) -> &Arc<NativeApi> {
        &self.api
    }

    pub(crate) fn raw(&self) -> Result<*mut MnnInterpreter> {
        self.handle.get()
    }

    pub fn is_configured(&self) -> bool {
        self.state == EngineState::Configured
    }

    fn configure(&mut self) -> Result<*mut MnnInterpreter> {
        let net = self.handle.get()?;
        self.state = EngineState::Configured;
        Ok(net)
    }

    pub fn set_session_mode(&mut self, mode: SessionMode) -> Result<()> {
        let net = self.configure()?;
        unsafe { (self.api.interpreter_set_session_mode)(net, mode as c_int) };
        Ok(())
    }

    /// Persist tuning results in `path`, keyed by the first `key_size`
    /// bytes of the model.
    pub fn set_cache_file(&mut self, path: impl AsRef<Path>, key_size: usize) -> Result<()> {
        let file = path_string(path.as_ref())?;
        let net = self.configure()?;
        unsafe { (self.api.interpreter_set_cache_file)(net, file.as_ptr(), key_size) };
        Ok(())
    }

    pub fn set_external_file(&mut self, path: impl AsRef<Path>, flag: usize) -> Result<()> {
        let file = path_string(path.as_ref())?;
        let net = self.configure()?;
        unsafe { (self.api.interpreter_set_external_file)(net, file.as_ptr(), flag) };
        Ok(())
    }

    pub fn set_session_hint(&mut self, mode: HintMode, value: i32) -> Result<()> {
        let net = self.configure()?;
        unsafe { (self.api.interpreter_set_session_hint)(net, mode as c_int, value) };
        Ok(())
    }

    /// An empty `values` leaves the hint untouched.
    pub fn set_session_hint_array(&mut self, mode: HintMode, values: &[i32]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let net = self.configure()?;
        let array = NativeIntArray::new(values);
        let raw = array.as_raw();
        unsafe { (self.api.interpreter_set_session_hint_array)(net, mode as c_int, raw.data, raw.size) };
        Ok(())
    }

    /// Write tuning results of `session` to the cache file.
    pub fn update_cache_file(&self, session: &Session<'_>, flag: i32) -> Result<()> {
        let net = self.handle.get()?;
        let s: *mut MnnSession = session.raw()?;
        ErrorCode::check(
            unsafe { (self.api.interpreter_update_cache_file)(net, s, flag) },
            "Cache update",
        )
    }

    /// Create a session. The schedule config is pinned only for the
    /// duration of the native call.
    pub fn create_session(&self, config: &ScheduleConfig) -> Result<Session<'_>> {
        let net = self.handle.get()?;
        let ptr = config.with_native(|raw| unsafe { (self.api.interpreter_create_session)(net, raw) })?;
        let handle = Handle::from_raw(ptr, format_args!("session on {}", config.forward))?;
        debug!(forward = %config.forward, threads = config.num_threads, "session created");
        Ok(Session::new(self, handle))
    }

    /// Drop the model weights kept for creating sessions. Existing
    /// sessions keep working; creating new ones fails.
    pub fn release_model(&self) -> Result<()> {
        let net = self.handle.get()?;
        unsafe { (self.api.interpreter_release_model)(net) };
        Ok(())
    }

    /// Version of the engine library.
    pub fn version(&self) -> String {
        self.api.version()
    }

    pub fn model_version(&self) -> Result<String> {
        let net = self.handle.get()?;
        Ok(unsafe { c_string((self.api.interpreter_get_model_version)(net)) }.unwrap_or_default())
    }

    pub fn biz_code(&self) -> Result<String> {
        let net = self.handle.get()?;
        Ok(unsafe { c_string((self.api.interpreter_biz_code)(net)) }.unwrap_or_default())
    }

    pub fn uuid(&self) -> Result<String> {
        let net = self.handle.get()?;
        Ok(unsafe { c_string((self.api.interpreter_uuid)(net)) }.unwrap_or_default())
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    /// Destroy the interpreter. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(net) = self.handle.take() {
            unsafe { (self.api.interpreter_destroy)(net) };
            debug!("engine released");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ModelBuilder;

    fn api() -> Arc<NativeApi> {
        Arc::new(NativeApi::reference())
    }

    #[test]
    fn loads_metadata_from_buffer() {
        let model = ModelBuilder::new()
            .biz_code("detect")
            .uuid("1234")
            .input("x", &[1, 4])
            .output("y", &[1, 2])
            .build();
        let engine = Engine::from_buffer(api(), &model).unwrap();
        assert_eq!(engine.biz_code().unwrap(), "detect");
        assert_eq!(engine.uuid().unwrap(), "1234");
        assert_eq!(engine.model_version().unwrap(), "1");
        assert!(engine.version().starts_with("reference-"));
        assert!(!engine.is_configured());
    }

    #[test]
    fn empty_and_garbage_buffers_fail() {
        assert!(matches!(
            Engine::from_buffer(api(), &[]),
            Err(BridgeError::NativeCreation(_))
        ));
        assert!(matches!(
            Engine::from_buffer(api(), b"not a model"),
            Err(BridgeError::NativeCreation(_))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Engine::from_file(api(), "/nonexistent/model.mnn").unwrap_err();
        assert!(matches!(err, BridgeError::FileNotFound(_)));
    }

    #[test]
    fn configuration_moves_to_configured() {
        let model = ModelBuilder::new().input("x", &[1]).output("y", &[1]).build();
        let mut engine = Engine::from_buffer(api(), &model).unwrap();
        engine.set_session_hint_array(HintMode::CpuCoreIds, &[]).unwrap();
        assert!(!engine.is_configured());
        engine.set_session_mode(SessionMode::Release).unwrap();
        engine.set_session_hint(HintMode::MaxTuningNumber, 20).unwrap();
        engine.set_session_hint_array(HintMode::CpuCoreIds, &[0, 1]).unwrap();
        assert!(engine.is_configured());
    }

    #[test]
    fn release_is_idempotent() {
        let model = ModelBuilder::new().input("x", &[1]).output("y", &[1]).build();
        let mut engine = Engine::from_buffer(api(), &model).unwrap();
        engine.release();
        engine.release();
        assert!(!engine.is_valid());
        assert!(matches!(
            engine.biz_code(),
            Err(BridgeError::InvalidHandle("interpreter"))
        ));
    }
}

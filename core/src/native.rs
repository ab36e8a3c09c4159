//! The table of C entry points every wrapper calls through.
//!
//! [`NativeApi::reference`] binds the in-process reference engine.
//! With the `dynamic` feature, [`NativeApi::load`] resolves the same
//! symbols from a shared MNN C library. The library stays loaded for as
//! long as the table lives.

use std::ffi::{c_void, CStr};
use std::fmt;
use std::os::raw::{c_char, c_int};

use crate::ffi::*;

macro_rules! native_api {
    ($(
        $field:ident = $symbol:literal : fn($($arg:ty),*) $(-> $ret:ty)?;
    )*) => {
        /// Function pointers for the MNN C API.
        pub struct NativeApi {
            $(pub $field: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
            provider: Provider,
            #[cfg(feature = "dynamic")]
            _lib: Option<libloading::Library>,
        }

        impl NativeApi {
            /// Bind the in-process reference engine.
            pub fn reference() -> Self {
                use crate::reference::exports;
                Self {
                    $($field: exports::$field,)*
                    provider: Provider::Reference,
                    #[cfg(feature = "dynamic")]
                    _lib: None,
                }
            }

            /// Load a shared library exposing the MNN C API.
            #[cfg(feature = "dynamic")]
            pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
                use crate::error::BridgeError;

                let path = path.as_ref();
                let lib = unsafe {
                    libloading::Library::new(path)
                        .map_err(|_| BridgeError::LibraryNotFound(path.display().to_string()))?
                };
                let api = unsafe {
                    Self {
                        $($field: *lib
                            .get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                                concat!($symbol, "\0").as_bytes(),
                            )
                            .map_err(|_| BridgeError::SymbolNotFound($symbol.into()))?,)*
                        provider: Provider::Library(path.display().to_string()),
                        _lib: None,
                    }
                };
                tracing::debug!(path = %path.display(), "MNN C library loaded");
                Ok(Self { _lib: Some(lib), ..api })
            }
        }
    };
}

native_api! {
    get_version = "MNN_getVersion": fn() -> *const c_char;

    interpreter_create_from_file = "MNN_Interpreter_createFromFile":
        fn(*const c_char) -> *mut MnnInterpreter;
    interpreter_create_from_buffer = "MNN_Interpreter_createFromBuffer":
        fn(*const c_void, usize) -> *mut MnnInterpreter;
    interpreter_destroy = "MNN_Interpreter_destroy": fn(*mut MnnInterpreter);
    interpreter_set_session_mode = "MNN_Interpreter_setSessionMode":
        fn(*mut MnnInterpreter, c_int);
    interpreter_set_cache_file = "MNN_Interpreter_setCacheFile":
        fn(*mut MnnInterpreter, *const c_char, usize);
    interpreter_set_external_file = "MNN_Interpreter_setExternalFile":
        fn(*mut MnnInterpreter, *const c_char, usize);
    interpreter_update_cache_file = "MNN_Interpreter_updateCacheFile":
        fn(*mut MnnInterpreter, *mut MnnSession, c_int) -> c_int;
    interpreter_set_session_hint = "MNN_Interpreter_setSessionHint":
        fn(*mut MnnInterpreter, c_int, c_int);
    interpreter_set_session_hint_array = "MNN_Interpreter_setSessionHintArray":
        fn(*mut MnnInterpreter, c_int, *mut c_int, usize);
    interpreter_create_session = "MNN_Interpreter_createSession":
        fn(*mut MnnInterpreter, *const RawScheduleConfig) -> *mut MnnSession;
    interpreter_release_session = "MNN_Interpreter_releaseSession":
        fn(*mut MnnInterpreter, *mut MnnSession) -> MnnBool;
    interpreter_resize_session = "MNN_Interpreter_resizeSession":
        fn(*mut MnnInterpreter, *mut MnnSession);
    interpreter_resize_session_ex = "MNN_Interpreter_resizeSessionEx":
        fn(*mut MnnInterpreter, *mut MnnSession, c_int);
    interpreter_release_model = "MNN_Interpreter_releaseModel": fn(*mut MnnInterpreter);
    interpreter_get_model_version = "MNN_Interpreter_getModelVersion":
        fn(*const MnnInterpreter) -> *const c_char;
    interpreter_run_session = "MNN_Interpreter_runSession":
        fn(*const MnnInterpreter, *mut MnnSession) -> c_int;
    interpreter_run_session_with_callback = "MNN_Interpreter_runSessionWithCallBack":
        fn(
            *const MnnInterpreter,
            *const MnnSession,
            Option<TensorCallBack>,
            Option<TensorCallBack>,
            MnnBool,
            *mut c_void
        ) -> c_int;
    interpreter_run_session_with_callback_info = "MNN_Interpreter_runSessionWithCallBackInfo":
        fn(
            *const MnnInterpreter,
            *const MnnSession,
            Option<TensorCallBackWithInfo>,
            Option<TensorCallBackWithInfo>,
            MnnBool,
            *mut c_void
        ) -> c_int;
    interpreter_get_session_input = "MNN_Interpreter_getSessionInput":
        fn(*mut MnnInterpreter, *const MnnSession, *const c_char) -> *mut MnnTensor;
    interpreter_get_session_output = "MNN_Interpreter_getSessionOutput":
        fn(*mut MnnInterpreter, *const MnnSession, *const c_char) -> *mut MnnTensor;
    interpreter_get_session_input_all = "MNN_Interpreter_GetSessionInputAll":
        fn(*mut MnnInterpreter, *mut MnnSession) -> NamedTensorList;
    interpreter_get_session_output_all = "MNN_Interpreter_GetSessionOutputAll":
        fn(*mut MnnInterpreter, *mut MnnSession) -> NamedTensorList;
    named_tensor_list_free = "MNN_NamedTensorList_Free": fn(NamedTensorList);
    interpreter_get_session_info = "MNN_Interpreter_getSessionInfo":
        fn(*mut MnnInterpreter, *const MnnSession, c_int, *mut c_void) -> MnnBool;
    interpreter_resize_tensor = "MNN_Interpreter_resizeTensor":
        fn(*mut MnnInterpreter, *mut MnnTensor, *const c_int, c_int);
    interpreter_biz_code = "MNN_Interpreter_bizCode": fn(*const MnnInterpreter) -> *const c_char;
    interpreter_uuid = "MNN_Interpreter_uuid": fn(*const MnnInterpreter) -> *const c_char;

    operator_info_name = "MNN_OperatorInfo_name": fn(*const MnnOperatorInfo) -> *const c_char;
    operator_info_type = "MNN_OperatorInfo_type": fn(*const MnnOperatorInfo) -> *const c_char;
    operator_info_flops = "MNN_OperatorInfo_flops": fn(*const MnnOperatorInfo) -> f32;

    tensor_create_device = "MNN_Tensor_CreateDevice":
        fn(*const c_int, c_int, RawHalideType, c_int) -> *mut MnnTensor;
    tensor_create_host = "MNN_Tensor_CreateHost":
        fn(*const c_int, c_int, RawHalideType, *mut c_void, c_int) -> *mut MnnTensor;
    tensor_create_from_existing = "MNN_Tensor_CreateFromExisting":
        fn(*const MnnTensor, c_int, MnnBool) -> *mut MnnTensor;
    tensor_create_host_from_device = "MNN_Tensor_CreateHostTensorFromDevice":
        fn(*const MnnTensor, MnnBool) -> *mut MnnTensor;
    tensor_destroy = "MNN_Tensor_Destroy": fn(*mut MnnTensor);
    tensor_copy_from_host = "MNN_Tensor_CopyFromHostTensor":
        fn(*mut MnnTensor, *const MnnTensor) -> MnnBool;
    tensor_copy_to_host = "MNN_Tensor_CopyToHostTensor":
        fn(*const MnnTensor, *mut MnnTensor) -> MnnBool;
    tensor_buffer = "MNN_Tensor_Buffer": fn(*const MnnTensor) -> *const RawHalideBuffer;
    tensor_dimension_type = "MNN_Tensor_GetDimensionType": fn(*const MnnTensor) -> c_int;
    tensor_halide_type = "MNN_Tensor_GetHalideType": fn(*const MnnTensor, *mut RawHalideType);
    tensor_host = "MNN_Tensor_Host": fn(*const MnnTensor) -> *mut c_void;
    tensor_dimensions = "MNN_Tensor_Dimensions": fn(*const MnnTensor) -> c_int;
    tensor_shape = "MNN_Tensor_Shape": fn(*const MnnTensor, *mut c_int) -> *mut c_int;
    tensor_free_shape = "MNN_Tensor_FreeShape": fn(*mut c_int);
    tensor_size = "MNN_Tensor_Size": fn(*const MnnTensor) -> c_int;
    tensor_element_size = "MNN_Tensor_ElementSize": fn(*const MnnTensor) -> c_int;
    tensor_wait = "MNN_Tensor_Wait": fn(*mut MnnTensor, c_int, MnnBool) -> c_int;

    matrix_create = "MNN_Matrix_Create": fn() -> *mut MnnMatrix;
    matrix_make_scale = "MNN_Matrix_MakeScale": fn(f32, f32) -> *mut MnnMatrix;
    matrix_make_trans = "MNN_Matrix_MakeTrans": fn(f32, f32) -> *mut MnnMatrix;
    matrix_destroy = "MNN_Matrix_Destroy": fn(*mut MnnMatrix);
    matrix_is_identity = "MNN_Matrix_isIdentity": fn(*const MnnMatrix) -> bool;
    matrix_get = "MNN_Matrix_get": fn(*const MnnMatrix, c_int) -> f32;
    matrix_set = "MNN_Matrix_set": fn(*mut MnnMatrix, c_int, f32);
    matrix_get9 = "MNN_Matrix_get9": fn(*const MnnMatrix, *mut f32);
    matrix_set9 = "MNN_Matrix_set9": fn(*mut MnnMatrix, *const f32);
    matrix_reset = "MNN_Matrix_reset": fn(*mut MnnMatrix);
    matrix_set_translate = "MNN_Matrix_setTranslate": fn(*mut MnnMatrix, f32, f32);
    matrix_set_scale = "MNN_Matrix_setScale": fn(*mut MnnMatrix, f32, f32);
    matrix_set_rotate = "MNN_Matrix_setRotate": fn(*mut MnnMatrix, f32);
    matrix_pre_concat = "MNN_Matrix_preConcat": fn(*mut MnnMatrix, *const MnnMatrix);
    matrix_post_concat = "MNN_Matrix_postConcat": fn(*mut MnnMatrix, *const MnnMatrix);
    matrix_invert = "MNN_Matrix_invert": fn(*const MnnMatrix, *mut MnnMatrix) -> bool;
    matrix_map_rect = "MNN_Matrix_mapRect":
        fn(*const MnnMatrix, *mut RawRect, *const RawRect) -> bool;

    image_process_create = "MNN_ImageProcess_create":
        fn(*const RawImageProcessConfig, *const MnnTensor) -> *mut MnnImageProcess;
    image_process_destroy = "MNN_ImageProcess_destroy": fn(*mut MnnImageProcess);
    image_process_set_matrix = "MNN_ImageProcess_setMatrix":
        fn(*mut MnnImageProcess, *const MnnMatrix);
    image_process_convert = "MNN_ImageProcess_convert":
        fn(*const MnnImageProcess, *const u8, c_int, c_int, c_int, *mut MnnTensor) -> c_int;
    image_process_set_padding = "MNN_ImageProcess_setPadding": fn(*mut MnnImageProcess, u8);

    express_var_create_const_float = "MNN_Express_VARP_createConstFloat":
        fn(*const f32, *const c_int, c_int) -> *mut MnnExpressVar;
    express_var_create_const_int = "MNN_Express_VARP_createConstInt":
        fn(*const c_int, *const c_int, c_int) -> *mut MnnExpressVar;
    express_var_destroy = "MNN_Express_VARP_destroy": fn(*mut MnnExpressVar);
    express_var_get_float_data = "MNN_Express_VARP_getFloatData":
        fn(*mut MnnExpressVar) -> *mut f32;
    express_var_element_size = "MNN_Express_VARP_elementSize": fn(*mut MnnExpressVar) -> c_int;
    express_var_get_shape = "MNN_Express_VARP_getShape":
        fn(*mut MnnExpressVar, *mut c_int, c_int);
    express_module_load_from_file = "MNN_Express_Module_loadFromFile":
        fn(
            *const *const c_char,
            c_int,
            *const *const c_char,
            c_int,
            *const c_char,
            *mut MnnRuntimeManager,
            *const RawExpressConfig
        ) -> *mut MnnExpressModule;
    express_module_destroy = "MNN_Express_Module_destroy": fn(*mut MnnExpressModule);
    express_module_forward = "MNN_Express_Module_onForward":
        fn(*mut MnnExpressModule, *mut *mut MnnExpressVar, c_int, *mut c_int)
            -> *mut *mut MnnExpressVar;
    express_free_var_array = "MNN_Express_freeVARPArray": fn(*mut *mut MnnExpressVar, c_int);
    express_runtime_manager_create = "MNN_Express_RuntimeManager_create":
        fn(c_int, c_int) -> *mut MnnRuntimeManager;
    express_runtime_manager_destroy = "MNN_Express_RuntimeManager_destroy":
        fn(*mut MnnRuntimeManager);
    express_runtime_manager_set_hint = "MNN_Express_RuntimeManager_setHint":
        fn(*mut MnnRuntimeManager, c_int, c_int);
}

/// Where a [`NativeApi`] got its entry points from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Reference,
    Library(String),
}

impl NativeApi {
    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Version string reported by the engine library.
    pub fn version(&self) -> String {
        // SAFETY: MNN_getVersion returns a static C string or null.
        unsafe { c_string((self.get_version)()) }.unwrap_or_default()
    }
}

impl fmt::Debug for NativeApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeApi")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Copy a C string owned by the native side.
///
/// # Safety
///
/// `ptr` must be null or a valid NUL-terminated string.
pub(crate) unsafe fn c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

//! Express API: graph modules, their runtime and variables.

use std::ffi::CString;
use std::os::raw::c_int;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use tracing::debug;

use crate::engine::HintMode;
use crate::error::{BridgeError, Result};
use crate::ffi::{self, MnnExpressModule, MnnExpressVar, MnnRuntimeManager, RawExpressConfig};
use crate::handle::Handle;
use crate::marshal::{NativeIntArray, NativeStringArray};
use crate::native::NativeApi;
use crate::pin;
use crate::schedule::ForwardType;

/// Backend and thread pool shared by the modules loaded with it.
#[derive(Debug)]
pub struct RuntimeManager {
    api: Arc<NativeApi>,
    handle: Handle<MnnRuntimeManager>,
}

impl RuntimeManager {
    pub fn new(api: &Arc<NativeApi>, forward: ForwardType, num_threads: i32) -> Result<Self> {
        let ptr = unsafe { (api.express_runtime_manager_create)(forward.as_raw(), num_threads) };
        let handle = Handle::from_raw(ptr, format_args!("{} with {} threads", forward, num_threads))?;
        debug!(%forward, num_threads, "runtime manager created");
        Ok(Self {
            api: Arc::clone(api),
            handle,
        })
    }

    pub fn set_hint(&mut self, mode: HintMode, value: i32) -> Result<()> {
        unsafe { (self.api.express_runtime_manager_set_hint)(self.handle.get()?, mode as c_int, value) };
        Ok(())
    }

    pub fn release(&mut self) {
        if let Some(rt) = self.handle.take() {
            unsafe { (self.api.express_runtime_manager_destroy)(rt) };
        }
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        self.release();
    }
}

/// Options for [`GraphModule::load`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleConfig<'a> {
    /// Shapes may change between forwards.
    pub dynamic: bool,
    pub shape_mutable: bool,
    pub rearrange: bool,
    /// Share weights with an already loaded module.
    pub base: Option<&'a GraphModule>,
}

fn mnn_bool(b: bool) -> ffi::MnnBool {
    if b {
        ffi::MNN_TRUE
    } else {
        ffi::MNN_FALSE
    }
}

#[derive(Debug)]
pub struct GraphModule {
    api: Arc<NativeApi>,
    handle: Handle<MnnExpressModule>,
    inputs: usize,
}

impl GraphModule {
    /// Load the sub-graph between `inputs` and `outputs` of a model file.
    pub fn load<S: AsRef<str>>(
        api: &Arc<NativeApi>,
        inputs: &[S],
        outputs: &[S],
        file: impl AsRef<Path>,
        runtime: Option<&RuntimeManager>,
        config: &ModuleConfig<'_>,
    ) -> Result<Self> {
        let file = file.as_ref();
        if inputs.is_empty() || outputs.is_empty() {
            return Err(BridgeError::argument("module needs input and output names"));
        }
        if file.as_os_str().is_empty() {
            return Err(BridgeError::argument("module file path is empty"));
        }
        if !file.exists() {
            return Err(BridgeError::FileNotFound(file.to_path_buf()));
        }
        let path = CString::new(file.to_string_lossy().as_bytes())
            .map_err(|_| BridgeError::argument("module path contains NUL"))?;
        let input_names = NativeStringArray::new(inputs)?;
        let output_names = NativeStringArray::new(outputs)?;
        let runtime = match runtime {
            Some(rt) => rt.handle.get()?,
            None => ptr::null_mut(),
        };
        let base = match config.base {
            Some(m) => m.handle.get()? as *const MnnExpressModule,
            None => ptr::null(),
        };
        let raw = RawExpressConfig {
            dynamic: mnn_bool(config.dynamic),
            shape_mutable: mnn_bool(config.shape_mutable),
            rearrange: mnn_bool(config.rearrange),
            base,
        };
        let (ins, outs) = (input_names.as_raw(), output_names.as_raw());
        let ptr = pin::scoped(raw, |cfg| unsafe {
            (api.express_module_load_from_file)(
                ins.data,
                ins.size as c_int,
                outs.data,
                outs.size as c_int,
                path.as_ptr(),
                runtime,
                cfg,
            )
        });
        let handle = Handle::from_raw(ptr, format_args!("module from {}", file.display()))?;
        debug!(path = %file.display(), inputs = inputs.len(), outputs = outputs.len(), "module loaded");
        Ok(Self {
            api: Arc::clone(api),
            handle,
            inputs: inputs.len(),
        })
    }

    /// Run the module. Returned variables are owned by the caller.
    pub fn forward(&mut self, inputs: &[&Var]) -> Result<Vec<Var>> {
        let m = self.handle.get()?;
        if inputs.len() != self.inputs {
            return Err(BridgeError::argument(format!(
                "module takes {} inputs, got {}",
                self.inputs,
                inputs.len()
            )));
        }
        let mut raw_inputs = inputs
            .iter()
            .map(|v| v.handle.get())
            .collect::<Result<Vec<_>>>()?;
        let mut count: c_int = 0;
        let outputs = unsafe {
            (self.api.express_module_forward)(m, raw_inputs.as_mut_ptr(), raw_inputs.len() as c_int, &mut count)
        };
        if outputs.is_null() {
            return Err(BridgeError::native_creation("variable (module outputs)"));
        }

        // Take every entry out of the array first, so freeing the array
        // only releases the block itself.
        let mut vars = Vec::with_capacity(count.max(0) as usize);
        for i in 0..count.max(0) as usize {
            let slot = unsafe { outputs.add(i) };
            let var = unsafe { std::mem::replace(&mut *slot, ptr::null_mut()) };
            vars.push(Var::wrap(&self.api, var, "module output"));
        }
        unsafe { (self.api.express_free_var_array)(outputs, count) };
        vars.into_iter().collect()
    }

    pub fn release(&mut self) {
        if let Some(m) = self.handle.take() {
            unsafe { (self.api.express_module_destroy)(m) };
            debug!("module released");
        }
    }
}

impl Drop for GraphModule {
    fn drop(&mut self) {
        self.release();
    }
}

/// A constant or computed value of the Express API.
#[derive(Debug)]
pub struct Var {
    api: Arc<NativeApi>,
    handle: Handle<MnnExpressVar>,
}

fn element_total(shape: &[i32]) -> Result<usize> {
    if shape.iter().any(|&d| d < 0) {
        return Err(BridgeError::argument(format!("negative extent in {:?}", shape)));
    }
    Ok(shape.iter().map(|&d| d as usize).product())
}

impl Var {
    fn wrap(api: &Arc<NativeApi>, ptr: *mut MnnExpressVar, what: &str) -> Result<Self> {
        Ok(Self {
            api: Arc::clone(api),
            handle: Handle::from_raw(ptr, what)?,
        })
    }

    pub fn from_f32(api: &Arc<NativeApi>, shape: &[i32], data: &[f32]) -> Result<Self> {
        let total = element_total(shape)?;
        if data.len() != total {
            return Err(BridgeError::argument(format!(
                "{} values for shape {:?}",
                data.len(),
                shape
            )));
        }
        let dims = NativeIntArray::new(shape);
        let raw = dims.as_raw();
        let ptr = unsafe { (api.express_var_create_const_float)(data.as_ptr(), raw.data, raw.size as c_int) };
        Self::wrap(api, ptr, "float constant")
    }

    pub fn from_i32(api: &Arc<NativeApi>, shape: &[i32], data: &[i32]) -> Result<Self> {
        let total = element_total(shape)?;
        if data.len() != total {
            return Err(BridgeError::argument(format!(
                "{} values for shape {:?}",
                data.len(),
                shape
            )));
        }
        let dims = NativeIntArray::new(shape);
        let raw = dims.as_raw();
        let ptr = unsafe { (api.express_var_create_const_int)(data.as_ptr(), raw.data, raw.size as c_int) };
        Self::wrap(api, ptr, "int constant")
    }

    /// The native call fills at most the slots it is given, so the buffer
    /// grows until an unwritten slot is left over.
    pub fn shape(&self) -> Result<Vec<i32>> {
        let v = self.handle.get()?;
        let mut capacity = 8usize;
        loop {
            let mut buf = vec![-1; capacity];
            unsafe { (self.api.express_var_get_shape)(v, buf.as_mut_ptr(), capacity as c_int) };
            if let Some(rank) = buf.iter().position(|&d| d < 0) {
                buf.truncate(rank);
                return Ok(buf);
            }
            capacity *= 2;
        }
    }

    pub fn element_count(&self) -> Result<usize> {
        Ok(unsafe { (self.api.express_var_element_size)(self.handle.get()?) }.max(0) as usize)
    }

    pub fn read_f32(&self) -> Result<Vec<f32>> {
        let v = self.handle.get()?;
        let count = self.element_count()?;
        let data = unsafe { (self.api.express_var_get_float_data)(v) };
        if data.is_null() || count == 0 {
            return Ok(Vec::new());
        }
        // SAFETY: the variable holds `count` floats while alive.
        Ok(unsafe { std::slice::from_raw_parts(data, count) }.to_vec())
    }

    pub fn release(&mut self) {
        if let Some(v) = self.handle.take() {
            unsafe { (self.api.express_var_destroy)(v) };
        }
    }
}

impl Drop for Var {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> Arc<NativeApi> {
        Arc::new(NativeApi::reference())
    }

    #[test]
    fn constants_report_shape_and_data() {
        let api = api();
        let v = Var::from_f32(&api, &[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(v.shape().unwrap(), vec![2, 3]);
        assert_eq!(v.element_count().unwrap(), 6);
        assert_eq!(v.read_f32().unwrap()[5], 6.0);

        let i = Var::from_i32(&api, &[3], &[7, 8, 9]).unwrap();
        assert_eq!(i.read_f32().unwrap(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn high_rank_shape_is_read_completely() {
        let api = api();
        let shape = [1; 11];
        let v = Var::from_f32(&api, &shape, &[0.5]).unwrap();
        assert_eq!(v.shape().unwrap(), shape.to_vec());
    }

    #[test]
    fn bad_constants_are_rejected() {
        let api = api();
        assert!(Var::from_f32(&api, &[2, 2], &[1.0]).is_err());
        assert!(Var::from_i32(&api, &[-1], &[]).is_err());
    }

    #[test]
    fn runtime_manager_validates_threads() {
        let api = api();
        let mut rt = RuntimeManager::new(&api, ForwardType::Cpu, 2).unwrap();
        rt.set_hint(HintMode::MaxTuningNumber, 5).unwrap();
        assert!(RuntimeManager::new(&api, ForwardType::Cpu, -1).is_err());
    }

    #[test]
    fn load_requires_names_and_file() {
        let api = api();
        let none: [&str; 0] = [];
        let cfg = ModuleConfig::default();
        assert!(matches!(
            GraphModule::load(&api, &none, &["y"], "m.mnn", None, &cfg),
            Err(BridgeError::ArgumentMismatch(_))
        ));
        assert!(matches!(
            GraphModule::load(&api, &["x"], &["y"], "", None, &cfg),
            Err(BridgeError::ArgumentMismatch(_))
        ));
        assert!(matches!(
            GraphModule::load(&api, &["x"], &["y"], "/nonexistent/m.mnn", None, &cfg),
            Err(BridgeError::FileNotFound(_))
        ));
    }
}

//! Reference `MNN_Express_*` entry points: variables, modules and runtime
//! managers.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

use tracing::debug;

use crate::ffi::{MnnExpressModule, MnnExpressVar, MnnRuntimeManager, RawExpressConfig};

use super::model::{IoSpec, Model};

const MAX_FORWARD_TYPE: c_int = 13;

struct RefVar {
    shape: Vec<i32>,
    data: Vec<f32>,
}

struct RefModule {
    inputs: Vec<IoSpec>,
    outputs: Vec<IoSpec>,
}

struct RefRuntime {
    forward: c_int,
    threads: c_int,
    hints: Vec<(c_int, c_int)>,
}

unsafe fn var<'a>(v: *mut MnnExpressVar) -> Option<&'a mut RefVar> {
    (v as *mut RefVar).as_mut()
}

fn publish_var(shape: Vec<i32>, data: Vec<f32>) -> *mut MnnExpressVar {
    Box::into_raw(Box::new(RefVar { shape, data })) as *mut MnnExpressVar
}

unsafe fn read_dims(shape: *const c_int, size: c_int) -> Option<Vec<i32>> {
    if size < 0 || (size > 0 && shape.is_null()) {
        return None;
    }
    let dims = if size == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(shape, size as usize).to_vec()
    };
    dims.iter().all(|&d| d >= 0).then_some(dims)
}

fn count(dims: &[i32]) -> usize {
    dims.iter().map(|&d| d as usize).product()
}

pub unsafe extern "C" fn express_var_create_const_float(
    data: *const f32,
    shape: *const c_int,
    shape_size: c_int,
) -> *mut MnnExpressVar {
    let Some(dims) = read_dims(shape, shape_size) else {
        return ptr::null_mut();
    };
    let n = count(&dims);
    if n > 0 && data.is_null() {
        return ptr::null_mut();
    }
    let values = if n == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data, n).to_vec()
    };
    publish_var(dims, values)
}

pub unsafe extern "C" fn express_var_create_const_int(
    data: *const c_int,
    shape: *const c_int,
    shape_size: c_int,
) -> *mut MnnExpressVar {
    let Some(dims) = read_dims(shape, shape_size) else {
        return ptr::null_mut();
    };
    let n = count(&dims);
    if n > 0 && data.is_null() {
        return ptr::null_mut();
    }
    let values = if n == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(data, n)
            .iter()
            .map(|&v| v as f32)
            .collect()
    };
    publish_var(dims, values)
}

pub unsafe extern "C" fn express_var_destroy(v: *mut MnnExpressVar) {
    if !v.is_null() {
        drop(Box::from_raw(v as *mut RefVar));
    }
}

pub unsafe extern "C" fn express_var_get_float_data(v: *mut MnnExpressVar) -> *mut f32 {
    match var(v) {
        Some(v) if !v.data.is_empty() => v.data.as_mut_ptr(),
        _ => ptr::null_mut(),
    }
}

pub unsafe extern "C" fn express_var_element_size(v: *mut MnnExpressVar) -> c_int {
    var(v).map_or(0, |v| v.data.len() as c_int)
}

/// Writes at most `shape_size` extents into `shape`.
pub unsafe extern "C" fn express_var_get_shape(
    v: *mut MnnExpressVar,
    shape: *mut c_int,
    shape_size: c_int,
) {
    let (Some(v), false) = (var(v), shape.is_null()) else {
        return;
    };
    let n = v.shape.len().min(shape_size.max(0) as usize);
    ptr::copy_nonoverlapping(v.shape.as_ptr(), shape, n);
}

unsafe fn names(data: *const *const c_char, size: c_int) -> Option<Vec<String>> {
    if size < 0 || (size > 0 && data.is_null()) {
        return None;
    }
    (0..size as usize)
        .map(|i| {
            let p = *data.add(i);
            if p.is_null() {
                None
            } else {
                CStr::from_ptr(p).to_str().ok().map(str::to_owned)
            }
        })
        .collect()
}

fn select(specs: &[IoSpec], wanted: &[String]) -> Option<Vec<IoSpec>> {
    wanted
        .iter()
        .map(|name| specs.iter().find(|s| &s.name == name).cloned())
        .collect()
}

pub unsafe extern "C" fn express_module_load_from_file(
    inputs: *const *const c_char,
    input_count: c_int,
    outputs: *const *const c_char,
    output_count: c_int,
    file: *const c_char,
    runtime: *mut MnnRuntimeManager,
    config: *const RawExpressConfig,
) -> *mut MnnExpressModule {
    let (Some(inputs), Some(outputs), false) = (
        names(inputs, input_count),
        names(outputs, output_count),
        file.is_null(),
    ) else {
        return ptr::null_mut();
    };
    let Ok(path) = CStr::from_ptr(file).to_str() else {
        return ptr::null_mut();
    };
    let model = match std::fs::read(path).map_err(|e| e.to_string()).and_then(|b| Model::decode(&b)) {
        Ok(model) => model,
        Err(reason) => {
            debug!(path, %reason, "cannot load module");
            return ptr::null_mut();
        }
    };
    let (Some(inputs), Some(outputs)) = (select(&model.inputs, &inputs), select(&model.outputs, &outputs))
    else {
        debug!(path, "module names do not match the model");
        return ptr::null_mut();
    };
    if let Some(config) = config.as_ref() {
        debug!(
            dynamic = config.dynamic,
            shape_mutable = config.shape_mutable,
            has_base = !config.base.is_null(),
            "module config"
        );
    }
    if let Some(rt) = (runtime as *const RefRuntime).as_ref() {
        debug!(forward = rt.forward, threads = rt.threads, hints = rt.hints.len(), "module runtime");
    }
    Box::into_raw(Box::new(RefModule { inputs, outputs })) as *mut MnnExpressModule
}

pub unsafe extern "C" fn express_module_destroy(m: *mut MnnExpressModule) {
    if !m.is_null() {
        drop(Box::from_raw(m as *mut RefModule));
    }
}

/// Outputs take the first input's leading extent and hold the mean of
/// every input element.
pub unsafe extern "C" fn express_module_forward(
    m: *mut MnnExpressModule,
    inputs: *mut *mut MnnExpressVar,
    input_count: c_int,
    output_count: *mut c_int,
) -> *mut *mut MnnExpressVar {
    if !output_count.is_null() {
        *output_count = 0;
    }
    let Some(module) = (m as *const RefModule).as_ref() else {
        return ptr::null_mut();
    };
    if input_count < 0
        || input_count as usize != module.inputs.len()
        || output_count.is_null()
        || (input_count > 0 && inputs.is_null())
    {
        return ptr::null_mut();
    }
    let mut vars = Vec::with_capacity(module.inputs.len());
    for i in 0..module.inputs.len() {
        match (*inputs.add(i) as *const RefVar).as_ref() {
            Some(v) => vars.push(v),
            None => return ptr::null_mut(),
        }
    }
    let total: usize = vars.iter().map(|v| v.data.len()).sum();
    let sum: f64 = vars.iter().flat_map(|v| &v.data).map(|&x| f64::from(x)).sum();
    let mean = if total == 0 { 0.0 } else { (sum / total as f64) as f32 };
    let batch = vars.first().and_then(|v| v.shape.first().copied());

    let outputs: Box<[*mut MnnExpressVar]> = module
        .outputs
        .iter()
        .map(|spec| {
            let mut dims = spec.dims.clone();
            if let (Some(first), Some(batch)) = (dims.first_mut(), batch) {
                *first = batch;
            }
            let n = count(&dims);
            publish_var(dims, vec![mean; n])
        })
        .collect();
    *output_count = outputs.len() as c_int;
    Box::into_raw(outputs) as *mut *mut MnnExpressVar
}

/// Destroys every non-null entry, then the array itself.
pub unsafe extern "C" fn express_free_var_array(vars: *mut *mut MnnExpressVar, count: c_int) {
    if vars.is_null() || count <= 0 {
        return;
    }
    let block = Box::from_raw(ptr::slice_from_raw_parts_mut(vars, count as usize));
    for &v in block.iter() {
        express_var_destroy(v);
    }
}

pub unsafe extern "C" fn express_runtime_manager_create(
    forward: c_int,
    threads: c_int,
) -> *mut MnnRuntimeManager {
    if threads < 0 || !(0..=MAX_FORWARD_TYPE).contains(&forward) {
        return ptr::null_mut();
    }
    Box::into_raw(Box::new(RefRuntime {
        forward,
        threads,
        hints: Vec::new(),
    })) as *mut MnnRuntimeManager
}

pub unsafe extern "C" fn express_runtime_manager_destroy(rt: *mut MnnRuntimeManager) {
    if !rt.is_null() {
        drop(Box::from_raw(rt as *mut RefRuntime));
    }
}

pub unsafe extern "C" fn express_runtime_manager_set_hint(
    rt: *mut MnnRuntimeManager,
    mode: c_int,
    value: c_int,
) {
    if let Some(rt) = (rt as *mut RefRuntime).as_mut() {
        rt.hints.push((mode, value));
    }
}

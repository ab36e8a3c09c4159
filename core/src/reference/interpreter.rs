//! Reference interpreters, sessions and operator info.

use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::ffi::{
    self, MnnBool, MnnInterpreter, MnnOperatorInfo, MnnSession, MnnTensor, NamedTensor,
    NamedTensorList, RawHalideType, RawScheduleConfig, TensorCallBack, TensorCallBackWithInfo,
};
use crate::marshal::read_strings;

use super::model::Model;
use super::tensor::{tensor, RefTensor};
use super::{status, truthy};

const DIMENSION_CAFFE: c_int = 1;
const FLOAT32: RawHalideType = RawHalideType {
    code: 2,
    bits: 32,
    lanes: 1,
};
const MAX_FORWARD_TYPE: c_int = 13;
const RESIZE_READY: c_int = 0;
const RESIZE_PENDING: c_int = 2;

static VERSION: &str = concat!("reference-", env!("CARGO_PKG_VERSION"), "\0");

pub(crate) struct RefOp {
    name: CString,
    op_type: CString,
    flops: f32,
}

pub(crate) struct RefInterpreter {
    model: Option<Model>,
    version: CString,
    biz_code: CString,
    uuid: CString,
    session_modes: Vec<c_int>,
    cache: Option<(PathBuf, usize)>,
    external: Option<(PathBuf, usize)>,
    hints: HashMap<c_int, Vec<c_int>>,
    sessions: Vec<*mut RefSession>,
}

type NamedTensors = Vec<(CString, Arc<RefTensor>)>;

pub(crate) struct RefSession {
    inputs: NamedTensors,
    outputs: NamedTensors,
    output_dims: Vec<Vec<i32>>,
    ops: Arc<Vec<RefOp>>,
    forward: c_int,
    backup: c_int,
    threads: c_int,
    latency: Duration,
    needs_resize: bool,
    worker: Option<JoinHandle<()>>,
}

impl RefSession {
    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("reference worker panicked");
            }
        }
    }

    fn tensors(&self) -> impl Iterator<Item = &Arc<RefTensor>> {
        self.inputs.iter().chain(self.outputs.iter()).map(|(_, t)| t)
    }

    fn resize(&mut self) {
        self.join_worker();
        let batch = self
            .inputs
            .first()
            .and_then(|(_, t)| t.lock().shape.first().copied());
        for ((_, output), spec) in self.outputs.iter().zip(&self.output_dims) {
            let mut dims = spec.clone();
            if let (Some(first), Some(batch)) = (dims.first_mut(), batch) {
                *first = batch;
            }
            let mut state = output.lock();
            if state.shape != dims {
                state.reshape(dims);
            }
        }
        self.needs_resize = false;
    }

    fn job(&self, hooks: Hooks, user_data: *mut c_void) -> Job {
        Job {
            inputs: self.inputs.iter().map(|(_, t)| Arc::clone(t)).collect(),
            outputs: self.outputs.iter().map(|(_, t)| Arc::clone(t)).collect(),
            ops: Arc::clone(&self.ops),
            hooks,
            user_data,
            latency: self.latency,
        }
    }

    fn launch(&mut self, job: Job, sync: bool) -> c_int {
        self.join_worker();
        if sync {
            return job.execute(false);
        }
        for output in &job.outputs {
            output.mark_pending();
        }
        self.worker = Some(thread::spawn(move || {
            let code = job.execute(true);
            if code != status::NO_ERROR {
                debug!(code, "background run failed");
            }
        }));
        status::NO_ERROR
    }
}

impl Drop for RefSession {
    fn drop(&mut self) {
        self.join_worker();
    }
}

#[derive(Clone, Copy)]
enum Hooks {
    Plain,
    Named(Option<TensorCallBack>, Option<TensorCallBack>),
    Info(Option<TensorCallBackWithInfo>, Option<TensorCallBackWithInfo>),
}

struct Job {
    inputs: Vec<Arc<RefTensor>>,
    outputs: Vec<Arc<RefTensor>>,
    ops: Arc<Vec<RefOp>>,
    hooks: Hooks,
    user_data: *mut c_void,
    latency: Duration,
}

// SAFETY: user_data belongs to the caller, which keeps it alive and
// untouched until the outputs report ready.
unsafe impl Send for Job {}

/// Settles the outputs when a run ends, even by unwinding.
struct Settle<'a> {
    outputs: &'a [Arc<RefTensor>],
    code: c_int,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        for tensor in self.outputs {
            tensor.settle(self.code);
        }
    }
}

fn raw_list(tensors: &[Arc<RefTensor>]) -> Vec<*const MnnTensor> {
    tensors
        .iter()
        .map(|t| Arc::as_ptr(t) as *const MnnTensor)
        .collect()
}

impl Job {
    /// Invoke the before or after hook for `op`; `true` means continue.
    unsafe fn notify(&self, op: &RefOp, tensors: &[*const MnnTensor], before: bool) -> bool {
        let info = op as *const RefOp as *const MnnOperatorInfo;
        let verdict = match self.hooks {
            Hooks::Plain => return true,
            Hooks::Named(b, a) => {
                let Some(cb) = (if before { b } else { a }) else {
                    return true;
                };
                cb(tensors.as_ptr(), tensors.len(), op.name.as_ptr(), self.user_data)
            }
            Hooks::Info(b, a) => {
                let Some(cb) = (if before { b } else { a }) else {
                    return true;
                };
                cb(tensors.as_ptr(), tensors.len(), info, self.user_data)
            }
        };
        verdict != 0
    }

    /// Run the ops. A synchronous caller gets the status back directly, so
    /// only a background run (`report`) leaves it on the outputs.
    fn execute(self, report: bool) -> c_int {
        let mut settle = Settle {
            outputs: &self.outputs,
            code: status::INVALID_VALUE,
        };
        let code = self.compute();
        settle.code = if report { code } else { status::NO_ERROR };
        code
    }

    fn compute(&self) -> c_int {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let inputs = raw_list(&self.inputs);
        let outputs = raw_list(&self.outputs);

        for op in self.ops.iter() {
            // SAFETY: callbacks and user_data were supplied for this run.
            if !unsafe { self.notify(op, &inputs, true) } {
                continue;
            }
            if !unsafe { self.notify(op, &outputs, false) } {
                return status::CALL_BACK_STOP;
            }
        }

        let mut sum = 0f64;
        let mut count = 0usize;
        for input in &self.inputs {
            let state = input.lock();
            if state.is_f32() {
                for v in state.data.read_f32() {
                    sum += f64::from(v);
                    count += 1;
                }
            }
        }
        let mean = if count == 0 { 0.0 } else { (sum / count as f64) as f32 };
        for output in &self.outputs {
            let mut state = output.lock();
            if state.is_f32() {
                state.data.fill_f32(mean);
            }
        }
        status::NO_ERROR
    }
}

unsafe fn interp<'a>(net: *const MnnInterpreter) -> Option<&'a mut RefInterpreter> {
    (net as *mut RefInterpreter).as_mut()
}

unsafe fn session<'a>(s: *const MnnSession) -> Option<&'a mut RefSession> {
    (s as *mut RefSession).as_mut()
}

fn build_interpreter(bytes: &[u8]) -> *mut MnnInterpreter {
    let model = match Model::decode(bytes) {
        Ok(model) => model,
        Err(reason) => {
            debug!(%reason, "rejecting model buffer");
            return ptr::null_mut();
        }
    };
    let (Ok(version), Ok(biz_code), Ok(uuid)) = (
        CString::new(model.version.to_string()),
        CString::new(model.biz_code.clone()),
        CString::new(model.uuid.clone()),
    ) else {
        return ptr::null_mut();
    };
    let net = Box::new(RefInterpreter {
        model: Some(model),
        version,
        biz_code,
        uuid,
        session_modes: Vec::new(),
        cache: None,
        external: None,
        hints: HashMap::new(),
        sessions: Vec::new(),
    });
    Box::into_raw(net) as *mut MnnInterpreter
}

unsafe fn path_arg(file: *const c_char) -> Option<PathBuf> {
    if file.is_null() {
        return None;
    }
    CStr::from_ptr(file).to_str().ok().map(PathBuf::from)
}

pub unsafe extern "C" fn get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

pub unsafe extern "C" fn interpreter_create_from_file(file: *const c_char) -> *mut MnnInterpreter {
    let Some(path) = path_arg(file) else {
        return ptr::null_mut();
    };
    match std::fs::read(&path) {
        Ok(bytes) => build_interpreter(&bytes),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "cannot read model file");
            ptr::null_mut()
        }
    }
}

pub unsafe extern "C" fn interpreter_create_from_buffer(
    buffer: *const c_void,
    size: usize,
) -> *mut MnnInterpreter {
    if buffer.is_null() || size == 0 {
        return ptr::null_mut();
    }
    build_interpreter(std::slice::from_raw_parts(buffer as *const u8, size))
}

pub unsafe extern "C" fn interpreter_destroy(net: *mut MnnInterpreter) {
    if net.is_null() {
        return;
    }
    let net = Box::from_raw(net as *mut RefInterpreter);
    for s in &net.sessions {
        drop(Box::from_raw(*s));
    }
}

pub unsafe extern "C" fn interpreter_set_session_mode(net: *mut MnnInterpreter, mode: c_int) {
    if let Some(net) = interp(net) {
        net.session_modes.push(mode);
    }
}

pub unsafe extern "C" fn interpreter_set_cache_file(
    net: *mut MnnInterpreter,
    file: *const c_char,
    key_size: usize,
) {
    if let (Some(net), Some(path)) = (interp(net), path_arg(file)) {
        net.cache = Some((path, key_size));
    }
}

pub unsafe extern "C" fn interpreter_set_external_file(
    net: *mut MnnInterpreter,
    file: *const c_char,
    flag: usize,
) {
    if let (Some(net), Some(path)) = (interp(net), path_arg(file)) {
        net.external = Some((path, flag));
    }
}

pub unsafe extern "C" fn interpreter_update_cache_file(
    net: *mut MnnInterpreter,
    s: *mut MnnSession,
    flag: c_int,
) -> c_int {
    let (Some(net), Some(_)) = (interp(net), session(s)) else {
        return status::INVALID_VALUE;
    };
    let Some((path, key_size)) = net.cache.clone() else {
        return status::INVALID_VALUE;
    };
    let key: Vec<u8> = net.uuid.as_bytes().iter().copied().take(key_size).collect();
    let mut contents = key;
    contents.extend_from_slice(format!("\nflag={}\n", flag).as_bytes());
    match std::fs::write(&path, contents) {
        Ok(()) => status::NO_ERROR,
        Err(_) => status::FILE_CREATE_FAILED,
    }
}

pub unsafe extern "C" fn interpreter_set_session_hint(net: *mut MnnInterpreter, mode: c_int, value: c_int) {
    if let Some(net) = interp(net) {
        net.hints.insert(mode, vec![value]);
    }
}

pub unsafe extern "C" fn interpreter_set_session_hint_array(
    net: *mut MnnInterpreter,
    mode: c_int,
    values: *mut c_int,
    size: usize,
) {
    if let (Some(net), false) = (interp(net), values.is_null()) {
        net.hints
            .insert(mode, std::slice::from_raw_parts(values, size).to_vec());
    }
}

fn forward_in_range(forward: c_int) -> bool {
    (0..=MAX_FORWARD_TYPE).contains(&forward)
}

fn named_tensors(specs: &[super::model::IoSpec], device: bool) -> Option<NamedTensors> {
    specs
        .iter()
        .map(|spec| {
            let name = CString::new(spec.name.as_str()).ok()?;
            let tensor = RefTensor::new(&spec.dims, FLOAT32, DIMENSION_CAFFE, device, true);
            Some((name, Arc::new(tensor)))
        })
        .collect()
}

pub unsafe extern "C" fn interpreter_create_session(
    net: *mut MnnInterpreter,
    config: *const RawScheduleConfig,
) -> *mut MnnSession {
    let (Some(net), Some(config)) = (interp(net), config.as_ref()) else {
        return ptr::null_mut();
    };
    let Some(model) = net.model.as_ref() else {
        debug!("model already released, no new sessions");
        return ptr::null_mut();
    };
    if let Some((path, _)) = &net.external {
        if !path.exists() {
            debug!(path = %path.display(), "external file missing");
            return ptr::null_mut();
        }
    }
    if config.num_thread < 0
        || !forward_in_range(config.forward_type)
        || !forward_in_range(config.backup_type)
        || !(0..=1).contains(&config.path.mode)
    {
        debug!(
            threads = config.num_thread,
            forward = config.forward_type,
            "rejecting schedule config"
        );
        return ptr::null_mut();
    }
    if let Some(backend) = config.backend_config.as_ref() {
        if !(0..=2).contains(&backend.memory)
            || !(0..=2).contains(&backend.power)
            || !(0..=3).contains(&backend.precision)
        {
            return ptr::null_mut();
        }
    }
    let (Ok(saved), Ok(_), Ok(_)) = (
        read_strings(config.save_tensors),
        read_strings(config.path.inputs),
        read_strings(config.path.outputs),
    ) else {
        return ptr::null_mut();
    };

    let (Some(inputs), Some(outputs)) = (
        named_tensors(&model.inputs, true),
        named_tensors(&model.outputs, true),
    ) else {
        return ptr::null_mut();
    };
    let Some(ops) = model
        .ops
        .iter()
        .map(|op| {
            Some(RefOp {
                name: CString::new(op.name.as_str()).ok()?,
                op_type: CString::new(op.op_type.as_str()).ok()?,
                flops: op.flops,
            })
        })
        .collect::<Option<Vec<_>>>()
    else {
        return ptr::null_mut();
    };

    let session = Box::into_raw(Box::new(RefSession {
        inputs,
        outputs,
        output_dims: model.outputs.iter().map(|o| o.dims.clone()).collect(),
        ops: Arc::new(ops),
        forward: config.forward_type,
        backup: config.backup_type,
        threads: config.num_thread.max(1),
        latency: model.latency,
        needs_resize: false,
        worker: None,
    }));
    debug!(
        saved = saved.len(),
        modes = ?net.session_modes,
        hints = net.hints.len(),
        "reference session created"
    );
    net.sessions.push(session);
    session as *mut MnnSession
}

pub unsafe extern "C" fn interpreter_release_session(
    net: *mut MnnInterpreter,
    s: *mut MnnSession,
) -> MnnBool {
    let Some(net) = interp(net) else {
        return ffi::MNN_FALSE;
    };
    let target = s as *mut RefSession;
    match net.sessions.iter().position(|&p| p == target) {
        Some(index) => {
            net.sessions.swap_remove(index);
            drop(Box::from_raw(target));
            ffi::MNN_TRUE
        }
        None => ffi::MNN_FALSE,
    }
}

pub unsafe extern "C" fn interpreter_resize_session(_net: *mut MnnInterpreter, s: *mut MnnSession) {
    if let Some(s) = session(s) {
        s.resize();
    }
}

pub unsafe extern "C" fn interpreter_resize_session_ex(
    net: *mut MnnInterpreter,
    s: *mut MnnSession,
    _need_realloc: c_int,
) {
    interpreter_resize_session(net, s);
}

pub unsafe extern "C" fn interpreter_release_model(net: *mut MnnInterpreter) {
    if let Some(net) = interp(net) {
        net.model = None;
    }
}

pub unsafe extern "C" fn interpreter_get_model_version(net: *const MnnInterpreter) -> *const c_char {
    interp(net).map_or(ptr::null(), |net| net.version.as_ptr())
}

pub unsafe extern "C" fn interpreter_biz_code(net: *const MnnInterpreter) -> *const c_char {
    interp(net).map_or(ptr::null(), |net| net.biz_code.as_ptr())
}

pub unsafe extern "C" fn interpreter_uuid(net: *const MnnInterpreter) -> *const c_char {
    interp(net).map_or(ptr::null(), |net| net.uuid.as_ptr())
}

unsafe fn run(s: *const MnnSession, hooks: Hooks, sync: bool, user_data: *mut c_void) -> c_int {
    let Some(s) = session(s) else {
        return status::INVALID_VALUE;
    };
    if s.needs_resize {
        return status::COMPUTE_SIZE_ERROR;
    }
    let job = s.job(hooks, user_data);
    s.launch(job, sync)
}

pub unsafe extern "C" fn interpreter_run_session(_net: *const MnnInterpreter, s: *mut MnnSession) -> c_int {
    run(s, Hooks::Plain, true, ptr::null_mut())
}

pub unsafe extern "C" fn interpreter_run_session_with_callback(
    _net: *const MnnInterpreter,
    s: *const MnnSession,
    before: Option<TensorCallBack>,
    after: Option<TensorCallBack>,
    sync: MnnBool,
    user_data: *mut c_void,
) -> c_int {
    run(s, Hooks::Named(before, after), truthy(sync), user_data)
}

pub unsafe extern "C" fn interpreter_run_session_with_callback_info(
    _net: *const MnnInterpreter,
    s: *const MnnSession,
    before: Option<TensorCallBackWithInfo>,
    after: Option<TensorCallBackWithInfo>,
    sync: MnnBool,
    user_data: *mut c_void,
) -> c_int {
    run(s, Hooks::Info(before, after), truthy(sync), user_data)
}

unsafe fn lookup(tensors: &NamedTensors, name: *const c_char) -> *mut MnnTensor {
    let found = if name.is_null() {
        tensors.first()
    } else {
        let name = CStr::from_ptr(name);
        tensors.iter().find(|(n, _)| n.as_c_str() == name)
    };
    found.map_or(ptr::null_mut(), |(_, t)| t.as_raw())
}

pub unsafe extern "C" fn interpreter_get_session_input(
    _net: *mut MnnInterpreter,
    s: *const MnnSession,
    name: *const c_char,
) -> *mut MnnTensor {
    session(s).map_or(ptr::null_mut(), |s| lookup(&s.inputs, name))
}

pub unsafe extern "C" fn interpreter_get_session_output(
    _net: *mut MnnInterpreter,
    s: *const MnnSession,
    name: *const c_char,
) -> *mut MnnTensor {
    session(s).map_or(ptr::null_mut(), |s| lookup(&s.outputs, name))
}

fn named_list(tensors: &NamedTensors) -> NamedTensorList {
    if tensors.is_empty() {
        return NamedTensorList {
            count: 0,
            tensors: ptr::null_mut(),
        };
    }
    let entries: Box<[NamedTensor]> = tensors
        .iter()
        .map(|(name, t)| NamedTensor {
            name: name.as_ptr(),
            tensor: t.as_raw(),
        })
        .collect();
    NamedTensorList {
        count: entries.len() as c_int,
        tensors: Box::into_raw(entries) as *mut NamedTensor,
    }
}

pub unsafe extern "C" fn interpreter_get_session_input_all(
    _net: *mut MnnInterpreter,
    s: *mut MnnSession,
) -> NamedTensorList {
    match session(s) {
        Some(s) => named_list(&s.inputs),
        None => named_list(&Vec::new()),
    }
}

pub unsafe extern "C" fn interpreter_get_session_output_all(
    _net: *mut MnnInterpreter,
    s: *mut MnnSession,
) -> NamedTensorList {
    match session(s) {
        Some(s) => named_list(&s.outputs),
        None => named_list(&Vec::new()),
    }
}

pub unsafe extern "C" fn named_tensor_list_free(list: NamedTensorList) {
    if !list.tensors.is_null() && list.count > 0 {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            list.tensors,
            list.count as usize,
        )));
    }
}

pub unsafe extern "C" fn interpreter_get_session_info(
    _net: *mut MnnInterpreter,
    s: *const MnnSession,
    code: c_int,
    out: *mut c_void,
) -> MnnBool {
    let (Some(s), false) = (session(s), out.is_null()) else {
        return ffi::MNN_FALSE;
    };
    match code {
        0 => {
            let bytes: usize = s.tensors().map(|t| t.lock().data.len()).sum();
            *(out as *mut f32) = bytes as f32 / (1024.0 * 1024.0);
        }
        1 => *(out as *mut f32) = s.ops.iter().map(|op| op.flops).sum(),
        2 => {
            let backends = out as *mut c_int;
            *backends = s.forward;
            *backends.add(1) = s.backup;
        }
        3 => {
            *(out as *mut c_int) = if s.needs_resize {
                RESIZE_PENDING
            } else {
                RESIZE_READY
            }
        }
        4 => *(out as *mut c_int) = s.threads,
        _ => return ffi::MNN_FALSE,
    }
    ffi::MNN_TRUE
}

pub unsafe extern "C" fn interpreter_resize_tensor(
    net: *mut MnnInterpreter,
    t: *mut MnnTensor,
    dims: *const c_int,
    dims_count: c_int,
) {
    let Some(target) = tensor(t) else {
        return;
    };
    if dims.is_null() || dims_count <= 0 {
        return;
    }
    let shape = std::slice::from_raw_parts(dims, dims_count as usize).to_vec();
    if shape.iter().any(|&d| d < 0) {
        return;
    }
    target.lock().reshape(shape);
    if let Some(net) = interp(net) {
        for &s in &net.sessions {
            let s = &mut *s;
            if s.inputs.iter().any(|(_, i)| i.as_raw() == t) {
                s.needs_resize = true;
            }
        }
    }
}

pub unsafe extern "C" fn operator_info_name(info: *const MnnOperatorInfo) -> *const c_char {
    (info as *const RefOp)
        .as_ref()
        .map_or(ptr::null(), |op| op.name.as_ptr())
}

pub unsafe extern "C" fn operator_info_type(info: *const MnnOperatorInfo) -> *const c_char {
    (info as *const RefOp)
        .as_ref()
        .map_or(ptr::null(), |op| op.op_type.as_ptr())
}

pub unsafe extern "C" fn operator_info_flops(info: *const MnnOperatorInfo) -> f32 {
    (info as *const RefOp).as_ref().map_or(0.0, |op| op.flops)
}

//! Session scheduling options and their lowering to `MNN_ScheduleConfig`.

use std::fmt;
use std::os::raw::c_int;
use std::ptr;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::ffi::{RawBackendConfig, RawScheduleConfig, RawSchedulePath};
use crate::marshal::NativeStringArray;
use crate::pin::{self, Pinned};

/// Backend an engine session executes on (`MNNForwardType`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum ForwardType {
    #[default]
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "metal")]
    Metal,
    #[serde(rename = "cuda")]
    Cuda,
    #[serde(rename = "opencl")]
    OpenCl,
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "nn")]
    Nn,
    #[serde(rename = "opengl")]
    OpenGl,
    #[serde(rename = "vulkan")]
    Vulkan,
    #[serde(rename = "user0")]
    User0,
    #[serde(rename = "user1")]
    User1,
    #[serde(rename = "user2")]
    User2,
    #[serde(rename = "user3")]
    User3,
    #[serde(rename = "all")]
    All,
    #[serde(rename = "cpu-extension")]
    CpuExtension,
}

const FORWARD_NAMES: [(ForwardType, &str); 14] = [
    (ForwardType::Cpu, "cpu"),
    (ForwardType::Metal, "metal"),
    (ForwardType::Cuda, "cuda"),
    (ForwardType::OpenCl, "opencl"),
    (ForwardType::Auto, "auto"),
    (ForwardType::Nn, "nn"),
    (ForwardType::OpenGl, "opengl"),
    (ForwardType::Vulkan, "vulkan"),
    (ForwardType::User0, "user0"),
    (ForwardType::User1, "user1"),
    (ForwardType::User2, "user2"),
    (ForwardType::User3, "user3"),
    (ForwardType::All, "all"),
    (ForwardType::CpuExtension, "cpu-extension"),
];

impl ForwardType {
    pub fn as_raw(self) -> c_int {
        self as c_int
    }

    pub fn from_raw(raw: c_int) -> Option<Self> {
        FORWARD_NAMES
            .iter()
            .map(|&(ty, _)| ty)
            .find(|ty| ty.as_raw() == raw)
    }

    fn name(self) -> &'static str {
        FORWARD_NAMES
            .iter()
            .find(|&&(ty, _)| ty == self)
            .map_or("unknown", |&(_, name)| name)
    }
}

impl FromStr for ForwardType {
    type Err = BridgeError;

    /// Parse a backend name like "cpu", "opencl" or "cpu-extension".
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        FORWARD_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|&(ty, _)| ty)
            .ok_or_else(|| BridgeError::config(format!("Invalid forward type: {}", s)))
    }
}

impl fmt::Display for ForwardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryMode {
    #[default]
    Normal = 0,
    High = 1,
    Low = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerMode {
    #[default]
    Normal = 0,
    High = 1,
    Low = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrecisionMode {
    #[default]
    Normal = 0,
    High = 1,
    Low = 2,
    LowBf16 = 3,
}

/// Whether a schedule path names operators or tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathMode {
    #[default]
    Op = 0,
    Tensor = 1,
}

/// `MNN_BackendConfig`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub memory: MemoryMode,
    pub power: PowerMode,
    pub precision: PrecisionMode,
    pub flags: usize,
}

impl From<BackendConfig> for RawBackendConfig {
    fn from(config: BackendConfig) -> Self {
        Self {
            memory: config.memory as c_int,
            power: config.power as c_int,
            precision: config.precision as c_int,
            flags: config.flags,
        }
    }
}

/// Restricts a session to the part of the graph between `inputs` and
/// `outputs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulePath {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub mode: PathMode,
}

/// Everything `createSession` needs to know about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Intermediate tensors kept alive for inspection after a run.
    pub save_tensors: Vec<String>,
    pub forward: ForwardType,
    pub num_threads: i32,
    pub path: SchedulePath,
    /// Used when `forward` cannot run an operator.
    pub backup: ForwardType,
    pub backend: Option<BackendConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            save_tensors: Vec::new(),
            forward: ForwardType::Cpu,
            num_threads: 4,
            path: SchedulePath::default(),
            backup: ForwardType::Cpu,
            backend: None,
        }
    }
}

impl ScheduleConfig {
    pub fn with_forward(mut self, forward: ForwardType) -> Self {
        self.forward = forward;
        self
    }

    pub fn with_threads(mut self, num_threads: i32) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Lower to the native layout and hand its address to `call`.
    ///
    /// The struct, its backend config and every string array stay pinned
    /// until `call` returns, and are released on every exit path.
    pub(crate) fn with_native<R>(&self, call: impl FnOnce(*const RawScheduleConfig) -> R) -> Result<R> {
        let save_tensors = NativeStringArray::new(&self.save_tensors)?;
        let inputs = NativeStringArray::new(&self.path.inputs)?;
        let outputs = NativeStringArray::new(&self.path.outputs)?;
        let mut backend = self.backend.map(|b| Pinned::new(RawBackendConfig::from(b)));

        let raw = RawScheduleConfig {
            save_tensors: save_tensors.as_raw(),
            forward_type: self.forward.as_raw(),
            num_thread: self.num_threads,
            path: RawSchedulePath {
                inputs: inputs.as_raw(),
                outputs: outputs.as_raw(),
                mode: self.path.mode as c_int,
            },
            backup_type: self.backup.as_raw(),
            backend_config: backend
                .as_mut()
                .map_or(ptr::null_mut(), |b| b.as_mut_ptr()),
        };
        Ok(pin::scoped(raw, |ptr| call(ptr as *const RawScheduleConfig)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::read_strings;

    #[test]
    fn forward_type_parses_names_and_raw_values() {
        assert_eq!("OpenCL".parse::<ForwardType>().unwrap(), ForwardType::OpenCl);
        assert_eq!(ForwardType::from_raw(13), Some(ForwardType::CpuExtension));
        assert_eq!(ForwardType::Vulkan.as_raw(), 7);
        assert_eq!(ForwardType::User2.to_string(), "user2");
        assert!("tpu".parse::<ForwardType>().is_err());
        assert_eq!(ForwardType::from_raw(14), None);
    }

    #[test]
    fn lowering_keeps_nested_pointers_valid_during_call() {
        let config = ScheduleConfig {
            save_tensors: vec!["conv1".into(), "fc".into()],
            path: SchedulePath {
                inputs: vec!["data".into()],
                outputs: vec!["prob".into()],
                mode: PathMode::Tensor,
            },
            ..ScheduleConfig::default()
        }
        .with_backend(BackendConfig {
            precision: PrecisionMode::LowBf16,
            ..BackendConfig::default()
        });

        let before = pin::active_pins();
        let seen = config
            .with_native(|raw| unsafe {
                let raw = &*raw;
                assert!(pin::active_pins() >= before + 2);
                let backend = &*raw.backend_config;
                (
                    read_strings(raw.save_tensors).unwrap(),
                    read_strings(raw.path.outputs).unwrap(),
                    raw.path.mode,
                    backend.precision,
                    raw.num_thread,
                )
            })
            .unwrap();
        assert_eq!(seen.0, vec!["conv1", "fc"]);
        assert_eq!(seen.1, vec!["prob"]);
        assert_eq!((seen.2, seen.3, seen.4), (1, 3, 4));
        assert_eq!(pin::active_pins(), before);
    }

    #[test]
    fn missing_backend_lowers_to_null() {
        let null = ScheduleConfig::default()
            .with_native(|raw| unsafe { (*raw).backend_config.is_null() })
            .unwrap();
        assert!(null);
    }

    #[test]
    fn interior_nul_fails_before_native_call() {
        let config = ScheduleConfig {
            save_tensors: vec!["bad\0name".into()],
            ..ScheduleConfig::default()
        };
        let mut called = false;
        assert!(config.with_native(|_| called = true).is_err());
        assert!(!called);
    }
}

//! Configuration types for mnn-bridge.

use std::path::PathBuf;

use serde::Deserialize;

use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::schedule::{BackendConfig, ForwardType, ScheduleConfig, SchedulePath};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Model configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Session scheduling.
    #[serde(default)]
    pub schedule: ScheduleSection,
}

/// Model configuration.
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    /// Path to the model file.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Where tuning results are persisted.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,

    /// Bytes of the model used as the cache key.
    #[serde(default = "default_cache_key_size")]
    pub cache_key_size: usize,

    /// External weights file.
    #[serde(default)]
    pub external_file: Option<PathBuf>,

    #[serde(default)]
    pub external_flag: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_file: None,
            cache_key_size: default_cache_key_size(),
            external_file: None,
            external_flag: 0,
        }
    }
}

/// Session scheduling configuration.
#[derive(Debug, Deserialize)]
pub struct ScheduleSection {
    /// Backend to run on.
    #[serde(default)]
    pub forward: ForwardType,

    /// Worker threads for CPU backends.
    #[serde(default = "default_num_threads")]
    pub num_threads: i32,

    /// Fallback backend.
    #[serde(default)]
    pub backup: ForwardType,

    #[serde(default)]
    pub save_tensors: Vec<String>,

    #[serde(default)]
    pub path: SchedulePath,

    #[serde(default)]
    pub backend: Option<BackendConfig>,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            forward: ForwardType::Cpu,
            num_threads: default_num_threads(),
            backup: ForwardType::Cpu,
            save_tensors: Vec::new(),
            path: SchedulePath::default(),
            backend: None,
        }
    }
}

fn default_cache_key_size() -> usize {
    128
}

fn default_num_threads() -> i32 {
    4
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.schedule.num_threads < 0 {
            return Err(BridgeError::config(format!(
                "num_threads must not be negative, got {}",
                self.schedule.num_threads
            )));
        }
        if self.model.cache_file.is_some() && self.model.cache_key_size == 0 {
            return Err(BridgeError::config("cache_key_size must be positive"));
        }
        Ok(())
    }

    /// The schedule section as a session config.
    pub fn schedule_config(&self) -> ScheduleConfig {
        let s = &self.schedule;
        ScheduleConfig {
            save_tensors: s.save_tensors.clone(),
            forward: s.forward,
            num_threads: s.num_threads,
            path: s.path.clone(),
            backup: s.backup,
            backend: s.backend,
        }
    }

    /// Apply the cache and external file settings to `engine`.
    pub fn apply(&self, engine: &mut Engine) -> Result<()> {
        if let Some(cache) = &self.model.cache_file {
            engine.set_cache_file(cache, self.model.cache_key_size)?;
        }
        if let Some(external) = &self.model.external_file {
            engine.set_external_file(external, self.model.external_flag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{MemoryMode, PathMode, PrecisionMode};

    #[test]
    fn defaults_apply_to_empty_document() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert!(config.model.path.is_none());
        assert_eq!(config.model.cache_key_size, 128);
        assert_eq!(config.schedule_config(), ScheduleConfig::default());
    }

    #[test]
    fn full_document_parses() {
        let yaml = r#"
model:
  path: model.mnn
  cache_file: tune.cache
  cache_key_size: 64
schedule:
  forward: opencl
  num_threads: 2
  backup: cpu
  save_tensors: [conv1]
  path: { inputs: [data], outputs: [prob], mode: tensor }
  backend: { memory: low, precision: low-bf16, flags: 3 }
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        let schedule = config.schedule_config();
        assert_eq!(schedule.forward, ForwardType::OpenCl);
        assert_eq!(schedule.num_threads, 2);
        assert_eq!(schedule.save_tensors, vec!["conv1"]);
        assert_eq!(schedule.path.mode, PathMode::Tensor);
        let backend = schedule.backend.unwrap();
        assert_eq!(backend.memory, MemoryMode::Low);
        assert_eq!(backend.precision, PrecisionMode::LowBf16);
        assert_eq!(backend.flags, 3);
        assert_eq!(config.model.cache_key_size, 64);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        assert!(Config::from_yaml_str("schedule: { forward: tpu }").is_err());
        assert!(matches!(
            Config::from_yaml_str("schedule: { num_threads: -2 }"),
            Err(BridgeError::Config(_))
        ));
    }
}

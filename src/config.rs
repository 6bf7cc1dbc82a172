//! Runtime configuration types.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::jit::JitCompiler;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile hot functions)
    On,
    /// Automatic: JIT enabled if supported on this platform
    #[default]
    Auto,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Calls before a function is compiled (values below 1 act as 1)
    pub jit_threshold: u32,
    pub trace_jit: bool,
    /// Record every interpreted step in the run trace
    pub trace_execution: bool,
    /// Whether GC is enabled (default: true)
    pub gc_enabled: bool,
    pub gc_stats: bool,
    /// Hard limit on heap size in bytes (None = unlimited)
    pub heap_limit: Option<usize>,
    /// Seed for the `random` native (None = from entropy)
    pub random_seed: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 1000,
            trace_jit: false,
            trace_execution: false,
            gc_enabled: true,
            gc_stats: false,
            heap_limit: None,
            random_seed: None,
        }
    }
}

impl RuntimeConfig {
    /// Interpreter-only configuration.
    pub fn interpreter() -> Self {
        Self { jit_mode: JitMode::Off, ..Default::default() }
    }

    /// Configuration that compiles every function on its first call.
    pub fn eager_jit() -> Self {
        Self { jit_mode: JitMode::On, jit_threshold: 1, ..Default::default() }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("invalid config: {}", e))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }

    /// Whether hot functions get compiled under this configuration.
    pub fn jit_enabled(&self) -> bool {
        match self.jit_mode {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => JitCompiler::is_supported(),
        }
    }
}

//! Playground configuration.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration for the preview sandbox
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum time for a single materialization or render in milliseconds (None = unlimited)
    pub timeout_ms: Option<u64>,
    /// Origins scripts may be fetched from (dependencies, compiler runtime)
    pub allowed_origins: Vec<String>,
    /// Directory `file://` script URLs must resolve into (None = file URLs rejected)
    pub local_script_dir: Option<PathBuf>,
    /// Where the worker loads the compiler runtime from
    pub compiler_runtime_url: String,
    /// Quiescence window applied to edits before they are compiled
    pub debounce_ms: u64,
    /// Module name sent with every compilation job
    pub module_name: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            timeout_ms: Some(5_000),
            allowed_origins: vec![String::from("https://unpkg.com")],
            local_script_dir: None,
            compiler_runtime_url: String::from(
                "https://unpkg.com/@babel/standalone@7.22.4/babel.min.js",
            ),
            debounce_ms: 500,
            module_name: String::from("index"),
        }
    }
}

impl SandboxConfig {
    /// Load a JSON config file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config '{}': {}", path.display(), e))?;
        serde_json::from_str(&text)
            .map_err(|e| anyhow!("Invalid config '{}': {}", path.display(), e))
    }
}

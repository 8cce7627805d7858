//! Configuration for the WASM sandbox and the guests it runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Namespace the bridged host modules export their functions under.
pub const DEFAULT_NAMESPACE: &str = "tandem";

/// Reactor-style initialization export.
pub const DEFAULT_INIT_EXPORT: &str = "_initialize";

/// Command-style entry export driven by the run-loop supervisor.
pub const DEFAULT_ENTRY_EXPORT: &str = "_start";

/// WASI capability grants for the sandbox.
///
/// Following the deny-by-default security model, all capabilities
/// start disabled and must be explicitly enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Allow access to stdin
    pub stdin: bool,

    /// Allow access to stdout
    pub stdout: bool,

    /// Allow access to stderr
    pub stderr: bool,

    /// Directories to pre-open for filesystem access (read-only)
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// Create capabilities with nothing allowed (maximum isolation)
    pub fn none() -> Self {
        Self::default()
    }

    /// Capabilities for guests that print diagnostics: stdout and stderr only
    pub fn guest() -> Self {
        Self {
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: enable stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: enable stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add read-only directory
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for the WASM sandbox runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// WASI capability configuration
    pub capabilities: WasiCapabilities,

    /// Maximum memory in bytes (default = 64MB)
    pub max_memory: usize,

    /// Enable fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Enable epoch-based interruption.
    ///
    /// Required to force a guest out of a computation when its instance is
    /// closed; without it a spinning guest can only be abandoned.
    pub epoch_interruption: bool,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Cache compiled modules to disk
    pub cache_path: Option<PathBuf>,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            capabilities: WasiCapabilities::guest(),
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_limit: None,
            epoch_interruption: true,
            optimization_level: 2,
            enable_simd: true,
            cache_path: None,
        }
    }
}

impl WasmConfig {
    /// Create a minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            max_memory: 16 * 1024 * 1024, // 16 MB
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            ..Default::default()
        }
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: WasiCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: toggle epoch interruption
    pub fn epoch_interruption(mut self, enable: bool) -> Self {
        self.epoch_interruption = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }
}

/// Where a guest lives and how its lifecycle exports are named.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Path to the `.wasm` (or `.wat`) guest module
    pub module_path: PathBuf,

    /// Import namespace of the host module the guest links against
    pub namespace: String,

    /// Export called exactly once before anything else (None = no init call)
    pub init_export: Option<String>,

    /// Export the run-loop supervisor starts for imported-style guests
    pub entry_export: String,

    /// Deadline for one bridged call in milliseconds (None = wait forever)
    pub submit_timeout_ms: Option<u64>,

    /// How long closing waits for the guest thread in milliseconds
    pub close_timeout_ms: u64,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            module_path: PathBuf::from("module.wasm"),
            namespace: DEFAULT_NAMESPACE.to_string(),
            init_export: None,
            entry_export: DEFAULT_ENTRY_EXPORT.to_string(),
            submit_timeout_ms: None,
            close_timeout_ms: 5_000,
        }
    }
}

impl GuestConfig {
    /// Config for a reactor guest whose exports are called directly.
    pub fn exported(path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: path.into(),
            init_export: Some(DEFAULT_INIT_EXPORT.to_string()),
            ..Default::default()
        }
    }

    /// Config for a command guest that services requests from `_start`.
    pub fn imported(path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: path.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Builder: set the import namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Builder: set or clear the initialization export
    pub fn init_export(mut self, export: Option<&str>) -> Self {
        self.init_export = export.map(str::to_string);
        self
    }

    /// Builder: set the entry export
    pub fn entry_export(mut self, export: impl Into<String>) -> Self {
        self.entry_export = export.into();
        self
    }

    /// Builder: set the bridged call deadline
    pub fn submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout_ms = Some(whole_millis(timeout));
        self
    }

    /// Builder: set the close deadline
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = whole_millis(timeout);
        self
    }

    /// Bridged call deadline, if any.
    pub fn submit_deadline(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }

    /// Close deadline.
    pub fn close_deadline(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

// Rounds up so a sub-millisecond deadline stays a deadline.
fn whole_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

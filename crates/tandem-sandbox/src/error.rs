//! Error types for the sandbox crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Sandbox error type
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Engine-level failure (engine creation, store setup, WASI linking)
    #[error("WASM sandbox error: {0}")]
    WasmError(String),

    /// Guest module file could not be read
    #[error("failed to read guest module {path:?}: {source}")]
    ReadModule {
        /// Path that was read
        path: PathBuf,
        /// Underlying IO failure
        source: std::io::Error,
    },

    /// Guest module failed to compile
    #[error("module compilation failed: {0}")]
    Compile(String),

    /// Linking or instantiating the guest module failed
    #[error("instantiation failed: {0}")]
    Instantiate(String),

    /// The initialization export trapped or exited
    #[error("initialization export '{export}' failed: {message}")]
    Initialize {
        /// Export that was called
        export: String,
        /// Engine error text
        message: String,
    },

    /// A required export is missing or has the wrong type
    #[error("export '{name}' not found: {message}")]
    ExportNotFound {
        /// Export name
        name: String,
        /// Engine error text
        message: String,
    },

    /// A direct export call trapped
    #[error("call to '{export}' failed: {message}")]
    Call {
        /// Export that was called
        export: String,
        /// Engine error text
        message: String,
    },

    /// The guest terminated through `proc_exit` during a direct call
    #[error("guest exited with code {0}")]
    Exit(i32),

    /// A linear-memory access fell outside the current memory
    #[error("memory access out of bounds: {len} bytes at {addr:#x} (memory size {size})")]
    OutOfBounds {
        /// Guest address
        addr: u64,
        /// Access length in bytes
        len: usize,
        /// Memory size in bytes at the time of the access
        size: usize,
    },

    /// The engine handed an adapter fewer stack slots than its signature needs
    #[error("stack slot mismatch: expected {expected}, got {actual}")]
    SlotCount {
        /// Slots the signature needs
        expected: usize,
        /// Slots provided
        actual: usize,
    },

    /// A value that cannot travel through a 64-bit stack slot
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// Two host functions registered under the same name
    #[error("host function {namespace}::{name} registered twice")]
    DuplicateFunction {
        /// Host module namespace
        namespace: String,
        /// Function name
        name: String,
    },

    /// Instantiation option not declared by the host module
    #[error("unrecognized option '{option}' for host module '{namespace}'")]
    UnrecognizedOption {
        /// Host module namespace
        namespace: String,
        /// Option name
        option: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The other end of a bridge is gone
    #[error("bridge closed")]
    BridgeClosed,

    /// The guest run loop has already terminated
    #[error("guest run loop stopped: {0}")]
    RunLoopStopped(String),

    /// The instance was interrupted by a host-requested close
    #[error("guest interrupted")]
    Interrupted,

    /// A blocking operation exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Config file parse error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

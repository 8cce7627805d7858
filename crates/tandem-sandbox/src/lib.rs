//! # Tandem Sandbox
//!
//! Typed function calls in both directions between a native host and
//! sandboxed WebAssembly guests, built on wasmtime.
//!
//! ## Call Styles
//!
//! | Style | Guest shape | Host drives it with |
//! |-------|-------------|---------------------|
//! | Exported | reactor: `_initialize`, `add`, `cube` exports | direct export calls |
//! | Imported | command: endless `_start` loop over `*_request` / `*_response` imports | a blocking [`wasm::HostBridge`] |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tandem_sandbox::guests::{CubeModule, ExportedModule};
//! use tandem_sandbox::{GuestConfig, WasmConfig, WasmSandbox};
//!
//! let sandbox = WasmSandbox::new(WasmConfig::default())?;
//!
//! // Direct calls into a reactor guest
//! let mut exported = ExportedModule::new(&sandbox, &GuestConfig::exported("exported.wasm"))?;
//! assert_eq!(exported.cube(5)?, 125);
//!
//! // Bridged calls into a guest that owns its control flow
//! let cube = CubeModule::new(&sandbox, &GuestConfig::imported("cube.wasm"))?;
//! assert_eq!(cube.cube(5)?, 125);
//! cube.close()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod guests;
pub mod wasm;

// Re-export main types
pub use error::{Result, SandboxError};
pub use wasm::{
    GuestConfig, HostModule, RunOutcome, WasiCapabilities, WasmBenchmark, WasmCallResult,
    WasmConfig, WasmInstance, WasmModule, WasmSandbox,
};

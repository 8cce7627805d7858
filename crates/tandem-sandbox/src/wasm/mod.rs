//! Typed host/guest calls over the WebAssembly calling convention.
//!
//! Two directions are covered:
//!
//! - **Host → guest**: typed calls into guest exports ([`WasmInstance::call`],
//!   [`WasmInstance::call_export`]).
//! - **Guest → host**: native functions adapted to the slot calling convention
//!   ([`HostFunction`]), grouped under a namespace ([`HostModule`]) and
//!   compiled into the guest's import table ([`ImportTable`]).
//!
//! A guest that owns its control flow (an endless `_start` loop) is driven
//! through a [`bridge`]: the host blocks in `submit` while the guest picks the
//! request up from an import, computes, and hands the response back through
//! another import. The loop itself runs under a [`RunLoop`].
//!
//! ## Calling Convention
//!
//! Every argument and result occupies 64-bit stack slots. Scalars take one
//! slot; a pointer parameter takes one slot (its address) and its pointee is
//! read eagerly; a byte string takes two (address, length). Pointer results
//! write the guest's memory and occupy no result slot.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tandem_sandbox::wasm::{HostModule, Ptr, WasmConfig, WasmSandbox};
//!
//! let sandbox = WasmSandbox::new(WasmConfig::default())?;
//! let module = sandbox.load_module("cube.wasm")?;
//!
//! let mut host = HostModule::<CubeState>::new("tandem");
//! host.register("cube_request", cube_request)?;
//! let imports = host.compile(sandbox.engine())?;
//!
//! let state = imports.instantiate(vec![bridge_option])?;
//! let instance = sandbox.instantiate_with(&module, &imports, state)?;
//! ```

mod adapter;
mod bench;
mod bridge;
mod codec;
mod config;
mod registry;
mod runtime;
mod supervisor;

pub use adapter::{HostFunction, IntoHostFunction, Signature};
pub use bench::WasmBenchmark;
pub use bridge::{bridge, GuestBridge, HostBridge};
pub use codec::{
    decode, encode, Bytes, GuestMemory, Param, Ptr, ResultValue, Results, Scalar, ScalarKind,
    Slot, ValueKind,
};
pub use config::{
    GuestConfig, WasiCapabilities, WasmConfig, DEFAULT_ENTRY_EXPORT, DEFAULT_INIT_EXPORT,
    DEFAULT_NAMESPACE,
};
pub use registry::{HostModule, ImportTable, ModuleOption};
pub use runtime::{
    HostState, InterruptHandle, WasmCallResult, WasmInstance, WasmModule, WasmSandbox,
};
pub use supervisor::{RunLoop, RunOutcome, RunStatus};

#[cfg(test)]
mod tests;

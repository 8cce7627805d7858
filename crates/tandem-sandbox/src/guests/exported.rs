//! Direct calls into a reactor guest.

use wasmtime::TypedFunc;

use crate::error::Result;
use crate::wasm::{GuestConfig, WasmInstance, WasmSandbox};

/// A guest exporting `add(i32, i32) -> i32` and `cube(i32) -> i32`.
///
/// The initialization export runs once in [`ExportedModule::new`]; both
/// exports are resolved up front so a guest missing either fails there.
pub struct ExportedModule {
    instance: WasmInstance<()>,
    add: TypedFunc<(i32, i32), i32>,
    cube: TypedFunc<i32, i32>,
}

impl ExportedModule {
    /// Load, instantiate and initialize the guest at `config.module_path`.
    pub fn new(sandbox: &WasmSandbox, config: &GuestConfig) -> Result<Self> {
        let module = sandbox.load_module(&config.module_path)?;
        let mut instance = sandbox.instantiate(&module)?;

        if let Some(export) = &config.init_export {
            instance.initialize(export)?;
        }

        let add = instance.typed_func("add")?;
        let cube = instance.typed_func("cube")?;
        Ok(Self {
            instance,
            add,
            cube,
        })
    }

    /// `i + j`, wrapping.
    pub fn add(&mut self, i: i32, j: i32) -> Result<i32> {
        self.instance.call_typed(&self.add, "add", (i, j))
    }

    /// `i * i * i`, wrapping.
    pub fn cube(&mut self, i: i32) -> Result<i32> {
        self.instance.call_typed(&self.cube, "cube", i)
    }

    /// Underlying instance, for memory access or untyped calls.
    pub fn instance_mut(&mut self) -> &mut WasmInstance<()> {
        &mut self.instance
    }
}

//! WASM runtime implementation using wasmtime.
//!
//! Uses wasmtime-wasi preview1 so guests built for `wasm32-wasip1` link
//! unchanged. Host modules compiled into an [`ImportTable`] are defined in
//! the same linker, with their per-instance state stored next to the WASI
//! context.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use wasmtime::*;
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::I32Exit;

use super::codec::{slot_to_val, val_to_slot, GuestMemory, Slot};
use super::config::{WasiCapabilities, WasmConfig};
use super::registry::ImportTable;
use crate::error::{Result, SandboxError};

/// Store data: WASI preview1 context, resource limits and host module state.
pub struct HostState<S> {
    preview1: WasiP1Ctx,
    limits: StoreLimits,
    instance: S,
}

impl<S> HostState<S> {
    fn preview1(&mut self) -> &mut WasiP1Ctx {
        &mut self.preview1
    }

    /// Host module state for this instance.
    pub fn instance(&self) -> &S {
        &self.instance
    }

    /// Mutable host module state for this instance.
    pub fn instance_mut(&mut self) -> &mut S {
        &mut self.instance
    }
}

/// A WebAssembly sandbox: one engine shared by every guest it instantiates.
pub struct WasmSandbox {
    engine: Engine,
    config: WasmConfig,
}

/// A compiled WebAssembly module.
pub struct WasmModule {
    module: Module,
    name: String,
}

/// An instantiated WebAssembly module ready for execution.
pub struct WasmInstance<S = ()> {
    name: String,
    store: Store<HostState<S>>,
    instance: Instance,
    interrupt: InterruptHandle,
}

/// Result of a WASM function call with timing information.
#[derive(Debug, Clone)]
pub struct WasmCallResult<T> {
    /// The return value
    pub value: T,
    /// Execution time in microseconds
    pub execution_time_us: u64,
    /// Fuel consumed (if fuel metering enabled)
    pub fuel_consumed: Option<u64>,
}

/// Stops a running instance from another thread.
///
/// With epoch interruption enabled the guest traps at its next epoch check;
/// without it only the flag is set.
#[derive(Clone)]
pub struct InterruptHandle {
    requested: Arc<AtomicBool>,
    engine: Option<Engine>,
}

impl InterruptHandle {
    fn new(engine: Option<Engine>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            engine,
        }
    }

    /// Request the interrupt.
    pub fn interrupt(&self) {
        self.requested.store(true, Ordering::Release);
        if let Some(engine) = &self.engine {
            engine.increment_epoch();
        }
    }

    /// True once [`interrupt`](Self::interrupt) has been called.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl WasmSandbox {
    /// Create a new WASM sandbox with the given configuration.
    pub fn new(config: WasmConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });
        engine_config.wasm_simd(config.enable_simd);

        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }
        if config.epoch_interruption {
            engine_config.epoch_interruption(true);
        }

        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                tracing::warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| SandboxError::WasmError(format!("engine creation failed: {}", e)))?;

        Ok(Self { engine, config })
    }

    /// Read and compile a guest module. Accepts binary or text format.
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<WasmModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("guest")
            .to_string();

        let bytes = std::fs::read(path).map_err(|source| SandboxError::ReadModule {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_module_bytes(&name, &bytes)
    }

    /// Compile a guest module from bytes.
    pub fn load_module_bytes(&self, name: &str, bytes: &[u8]) -> Result<WasmModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| SandboxError::Compile(format!("{}: {}", name, e)))?;
        tracing::debug!(module = name, "compiled guest module");

        Ok(WasmModule {
            module,
            name: name.to_string(),
        })
    }

    /// Instantiate a module that imports nothing beyond WASI.
    pub fn instantiate(&self, module: &WasmModule) -> Result<WasmInstance<()>> {
        self.link(module, (), |_| Ok(()))
    }

    /// Instantiate a module against a host module's import table.
    ///
    /// `state` is the value returned by [`ImportTable::instantiate`]; it lives
    /// in the store for as long as the instance does.
    pub fn instantiate_with<S: Default + Send + 'static>(
        &self,
        module: &WasmModule,
        imports: &ImportTable<S>,
        state: S,
    ) -> Result<WasmInstance<S>> {
        self.link(module, state, |linker| imports.define(linker))
    }

    fn link<S: Send + 'static>(
        &self,
        module: &WasmModule,
        state: S,
        define: impl FnOnce(&mut Linker<HostState<S>>) -> Result<()>,
    ) -> Result<WasmInstance<S>> {
        let host_state = self.build_host_state(&self.config.capabilities, state)?;
        let mut store = Store::new(&self.engine, host_state);

        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| SandboxError::WasmError(format!("fuel setup failed: {}", e)))?;
        }

        let interrupt = if self.config.epoch_interruption {
            let interrupt = InterruptHandle::new(Some(self.engine.clone()));
            let requested = Arc::clone(&interrupt.requested);
            store.set_epoch_deadline(1);
            store.epoch_deadline_callback(move |_| {
                if requested.load(Ordering::Acquire) {
                    Err(SandboxError::Interrupted.into())
                } else {
                    // Another instance on this engine was interrupted
                    Ok(UpdateDeadline::Continue(1))
                }
            });
            interrupt
        } else {
            InterruptHandle::new(None)
        };

        let mut linker: Linker<HostState<S>> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
            .map_err(|e| SandboxError::WasmError(format!("WASI link failed: {}", e)))?;
        define(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| SandboxError::Instantiate(format!("{}: {:#}", module.name, e)))?;
        tracing::info!(module = %module.name, "instantiated guest module");

        Ok(WasmInstance {
            name: module.name.clone(),
            store,
            instance,
            interrupt,
        })
    }

    /// Build host state from capabilities.
    fn build_host_state<S>(&self, caps: &WasiCapabilities, instance: S) -> Result<HostState<S>> {
        let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

        if caps.stdin {
            builder.inherit_stdin();
        }
        if caps.stdout {
            builder.inherit_stdout();
        }
        if caps.stderr {
            builder.inherit_stderr();
        }
        for (key, value) in &caps.env_vars {
            builder.env(key, value);
        }
        builder.args(&caps.args);

        for dir in &caps.preopened_dirs_ro {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::READ,
                    wasmtime_wasi::FilePerms::READ,
                )
                .map_err(|e| {
                    SandboxError::WasmError(format!("failed to open dir {:?}: {}", dir, e))
                })?;
        }

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory)
            .build();

        Ok(HostState {
            preview1: builder.build_p1(),
            limits,
            instance,
        })
    }

    /// Engine shared by every instance of this sandbox.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the configuration.
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }
}

impl WasmModule {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module
            .exports()
            .filter(|e| matches!(e.ty(), ExternType::Func(_)))
            .map(|e| e.name())
    }

    /// Imports as `(namespace, name)` pairs.
    pub fn imports(&self) -> impl Iterator<Item = (&str, &str)> {
        self.module.imports().map(|i| (i.module(), i.name()))
    }
}

impl<S: Send + 'static> WasmInstance<S> {
    /// Module name this instance was created from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call a nullary initialization export once.
    pub fn initialize(&mut self, export: &str) -> Result<()> {
        let func = self.typed_func::<(), ()>(export)?;
        func.call(&mut self.store, ())
            .map_err(|e| SandboxError::Initialize {
                export: export.to_string(),
                message: format!("{:#}", e),
            })?;
        tracing::info!(module = %self.name, export, "guest initialized");
        Ok(())
    }

    /// Call a typed export, measuring time and fuel.
    pub fn call<P, R>(&mut self, name: &str, args: P) -> Result<WasmCallResult<R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self.typed_func::<P, R>(name)?;
        let start = Instant::now();
        let fuel_before = self.store.get_fuel().ok();

        let value = self.call_typed(&func, name, args)?;

        let fuel_after = self.store.get_fuel().ok();
        let fuel_consumed = fuel_before.zip(fuel_after).map(|(b, a)| b - a);

        Ok(WasmCallResult {
            value,
            execution_time_us: start.elapsed().as_micros() as u64,
            fuel_consumed,
        })
    }

    /// Call a previously resolved export.
    pub fn call_typed<P, R>(&mut self, func: &TypedFunc<P, R>, name: &str, args: P) -> Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        func.call(&mut self.store, args)
            .map_err(|e| call_error(name, e))
    }

    /// Call an export with raw stack slots, one per engine parameter.
    pub fn call_export(&mut self, name: &str, args: &[Slot]) -> Result<Vec<Slot>> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| SandboxError::ExportNotFound {
                name: name.to_string(),
                message: "no function with this name".to_string(),
            })?;
        let ty = func.ty(&self.store);

        let param_types: Vec<ValType> = ty.params().collect();
        if param_types.len() != args.len() {
            return Err(SandboxError::SlotCount {
                expected: param_types.len(),
                actual: args.len(),
            });
        }
        let params = param_types
            .iter()
            .zip(args)
            .map(|(ty, slot)| slot_to_val(ty, *slot))
            .collect::<Result<Vec<_>>>()?;
        let mut results = vec![Val::I32(0); ty.results().len()];

        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| call_error(name, e))?;

        results.iter().map(val_to_slot).collect()
    }

    /// Resolve a typed export.
    pub fn typed_func<P, R>(&mut self, name: &str) -> Result<TypedFunc<P, R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| SandboxError::ExportNotFound {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Write bytes to WASM memory at the given offset.
    pub fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let memory = self.get_memory()?;
        GuestMemory::new(memory.data_mut(&mut self.store)).write(offset, data)
    }

    /// Read bytes from WASM memory at the given offset.
    pub fn read_memory(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let memory = self.get_memory()?;
        let bytes = memory.data_mut(&mut self.store);
        Ok(GuestMemory::new(bytes).read(offset, len)?.to_vec())
    }

    fn get_memory(&mut self) -> Result<Memory> {
        self.instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| SandboxError::ExportNotFound {
                name: "memory".to_string(),
                message: "module exports no memory".to_string(),
            })
    }

    /// Get remaining fuel (if fuel metering enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    /// Get list of exported function names.
    pub fn exported_functions(&mut self) -> Vec<String> {
        let names: Vec<_> = self
            .instance
            .exports(&mut self.store)
            .map(|e| e.name().to_string())
            .collect();
        names
            .into_iter()
            .filter(|name| self.instance.get_func(&mut self.store, name).is_some())
            .collect()
    }

    /// Host module state.
    pub fn state(&self) -> &S {
        self.store.data().instance()
    }

    /// Mutable host module state.
    pub fn state_mut(&mut self) -> &mut S {
        self.store.data_mut().instance_mut()
    }

    /// Handle that interrupts this instance from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store<HostState<S>> {
        &mut self.store
    }
}

fn call_error(export: &str, err: wasmtime::Error) -> SandboxError {
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return SandboxError::Exit(exit.0);
    }
    SandboxError::Call {
        export: export.to_string(),
        message: format!("{:#}", err),
    }
}

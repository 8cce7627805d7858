//! Host modules: named collections of host functions with per-instance state.
//!
//! A [`HostModule`] is declared once, compiled once per engine into an
//! [`ImportTable`], and instantiated once per guest. Each instantiation builds
//! a fresh state value, so guests never share the channels stored in it.
//!
//! ## Import Module
//!
//! Functions are imported under the module's namespace:
//! ```wat
//! (import "tandem" "cube_request" (func $cube_request (result i32)))
//! (import "tandem" "cube_response" (func $cube_response (param i32)))
//! ```

use std::collections::{BTreeMap, BTreeSet};

use wasmtime::{Caller, Engine, Extern, FuncType, Linker, Val};

use super::adapter::{HostFunction, IntoHostFunction};
use super::codec::{slot_to_val, val_to_slot, GuestMemory};
use super::runtime::HostState;
use crate::error::{Result, SandboxError};

/// A named instantiation option that configures fresh instance state.
pub struct ModuleOption<S> {
    name: String,
    apply: Box<dyn FnOnce(&mut S) + Send>,
}

impl<S> ModuleOption<S> {
    /// Create an option; `apply` runs against the default state.
    pub fn new(name: impl Into<String>, apply: impl FnOnce(&mut S) + Send + 'static) -> Self {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }

    /// Option name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Host functions registered under one import namespace.
pub struct HostModule<S> {
    namespace: String,
    functions: BTreeMap<String, HostFunction<S>>,
    options: BTreeSet<String>,
}

impl<S: Default + Send + 'static> HostModule<S> {
    /// Create an empty host module.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            functions: BTreeMap::new(),
            options: BTreeSet::new(),
        }
    }

    /// Import namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Register a typed native function under `name`.
    pub fn register<Args, R, F>(&mut self, name: &str, func: F) -> Result<&mut Self>
    where
        F: IntoHostFunction<S, Args, R>,
    {
        self.register_function(name, HostFunction::new(func))
    }

    /// Register an adapted function under `name`.
    pub fn register_function(&mut self, name: &str, function: HostFunction<S>) -> Result<&mut Self> {
        if self.functions.contains_key(name) {
            return Err(SandboxError::DuplicateFunction {
                namespace: self.namespace.clone(),
                name: name.to_string(),
            });
        }
        tracing::debug!(
            namespace = %self.namespace,
            name,
            params = function.signature().param_slots(),
            results = function.signature().result_slots(),
            "registered host function"
        );
        self.functions.insert(name.to_string(), function);
        Ok(self)
    }

    /// Declare an option name that [`ImportTable::instantiate`] accepts.
    pub fn accept_option(&mut self, name: &str) -> &mut Self {
        self.options.insert(name.to_string());
        self
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Build engine function types for every registered function.
    pub fn compile(&self, engine: &Engine) -> Result<ImportTable<S>> {
        if self.namespace.is_empty() {
            return Err(SandboxError::ConfigError(
                "host module namespace is empty".to_string(),
            ));
        }
        let imports = self
            .functions
            .iter()
            .map(|(name, function)| Import {
                name: name.clone(),
                ty: function.signature().func_type(engine),
                function: function.clone(),
            })
            .collect();

        Ok(ImportTable {
            namespace: self.namespace.clone(),
            imports,
            options: self.options.clone(),
        })
    }
}

struct Import<S> {
    name: String,
    ty: FuncType,
    function: HostFunction<S>,
}

/// A host module compiled for one engine: the guest's import table.
pub struct ImportTable<S> {
    namespace: String,
    imports: Vec<Import<S>>,
    options: BTreeSet<String>,
}

impl<S: Default + Send + 'static> ImportTable<S> {
    /// Import namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of imports.
    pub fn len(&self) -> usize {
        self.imports.len()
    }

    /// True if no functions were registered.
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }

    /// Build fresh instance state from `options`.
    ///
    /// Every option is validated before any is applied, so a bad option
    /// leaves nothing half-configured.
    pub fn instantiate(&self, options: Vec<ModuleOption<S>>) -> Result<S> {
        if let Some(unknown) = options.iter().find(|opt| !self.options.contains(opt.name())) {
            return Err(SandboxError::UnrecognizedOption {
                namespace: self.namespace.clone(),
                option: unknown.name().to_string(),
            });
        }
        let mut state = S::default();
        for option in options {
            (option.apply)(&mut state);
        }
        Ok(state)
    }

    /// Define every import in `linker`.
    pub(crate) fn define(&self, linker: &mut Linker<HostState<S>>) -> Result<()> {
        for import in &self.imports {
            let function = import.function.clone();
            let result_types = function.signature().result_types();
            let stack_len = function.signature().stack_len();

            linker
                .func_new(
                    &self.namespace,
                    &import.name,
                    import.ty.clone(),
                    move |mut caller: Caller<'_, HostState<S>>, params: &[Val], results: &mut [Val]| {
                        let mut stack = vec![0u64; stack_len];
                        for (slot, val) in stack.iter_mut().zip(params) {
                            *slot = val_to_slot(val)?;
                        }
                        with_guest_memory(&mut caller, |state, memory| {
                            function.invoke(state, memory, &mut stack)
                        })?;
                        for ((out, ty), slot) in results.iter_mut().zip(&result_types).zip(&stack) {
                            *out = slot_to_val(ty, *slot)?;
                        }
                        Ok(())
                    },
                )
                .map_err(|e| {
                    SandboxError::WasmError(format!(
                        "failed to register {}::{}: {}",
                        self.namespace, import.name, e
                    ))
                })?;
        }
        Ok(())
    }
}

/// Run `f` with the instance state and the caller's exported memory.
fn with_guest_memory<S, T>(
    caller: &mut Caller<'_, HostState<S>>,
    f: impl FnOnce(&mut S, &mut GuestMemory<'_>) -> Result<T>,
) -> Result<T> {
    match caller.get_export("memory").and_then(Extern::into_memory) {
        Some(memory) => {
            let (bytes, host) = memory.data_and_store_mut(&mut *caller);
            f(host.instance_mut(), &mut GuestMemory::new(bytes))
        }
        None => f(caller.data_mut().instance_mut(), &mut GuestMemory::empty()),
    }
}

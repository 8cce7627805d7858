//! Bridged calls into command guests that own their control flow.

use std::time::Duration;

use super::guest_log;
use crate::error::{Result, SandboxError};
use crate::wasm::{
    bridge, GuestBridge, GuestConfig, HostBridge, HostModule, ModuleOption, Ptr, RunLoop,
    RunOutcome, RunStatus, WasmSandbox,
};

/// Instantiation option that hands the guest end of a bridge to the state.
pub const BRIDGE_OPTION: &str = "bridge";

/// Per-instance state of the add host module.
#[derive(Default)]
pub struct AddState {
    bridge: Option<GuestBridge<(i32, i32), i32>>,
}

/// Per-instance state of the cube host module.
#[derive(Default)]
pub struct CubeState {
    bridge: Option<GuestBridge<i32, i32>>,
}

fn unbridged(namespace: &str) -> SandboxError {
    SandboxError::ConfigError(format!(
        "{} module instantiated without the '{}' option",
        namespace, BRIDGE_OPTION
    ))
}

impl AddState {
    fn bridge(&self) -> Result<&GuestBridge<(i32, i32), i32>> {
        self.bridge.as_ref().ok_or_else(|| unbridged("add"))
    }
}

impl CubeState {
    fn bridge(&self) -> Result<&GuestBridge<i32, i32>> {
        self.bridge.as_ref().ok_or_else(|| unbridged("cube"))
    }
}

// The guest passes two addresses; the operands are written through them.
fn add_request(state: &mut AddState, i: Ptr<i32>, j: Ptr<i32>) -> Result<(Ptr<i32>, Ptr<i32>)> {
    let (a, b) = state.bridge()?.await_request()?;
    Ok((i.with(a), j.with(b)))
}

fn add_response(state: &mut AddState, sum: i32) -> Result<()> {
    state.bridge()?.publish_response(sum)
}

fn cube_request(state: &mut CubeState) -> Result<i32> {
    state.bridge()?.await_request()
}

fn cube_response(state: &mut CubeState, cubed: i32) -> Result<()> {
    state.bridge()?.publish_response(cubed)
}

/// Host module serving `add_request`, `add_response` and `log`.
pub fn add_host_module(namespace: &str) -> Result<HostModule<AddState>> {
    let mut module = HostModule::new(namespace);
    module
        .register("add_request", add_request)?
        .register("add_response", add_response)?
        .register("log", guest_log::<AddState>)?
        .accept_option(BRIDGE_OPTION);
    Ok(module)
}

/// Host module serving `cube_request`, `cube_response` and `log`.
pub fn cube_host_module(namespace: &str) -> Result<HostModule<CubeState>> {
    let mut module = HostModule::new(namespace);
    module
        .register("cube_request", cube_request)?
        .register("cube_response", cube_response)?
        .register("log", guest_log::<CubeState>)?
        .accept_option(BRIDGE_OPTION);
    Ok(module)
}

/// A guest run loop plus the host end of the bridge feeding it.
struct Bridged<Req, Res> {
    // Declared first so it drops first: the guest then sees the bridge
    // disconnect as a requested close.
    run_loop: RunLoop,
    bridge: HostBridge<Req, Res>,
    close_timeout: Duration,
}

impl<Req: Send + 'static, Res: Send + 'static> Bridged<Req, Res> {
    fn start<S: Default + Send + 'static>(
        sandbox: &WasmSandbox,
        config: &GuestConfig,
        host: HostModule<S>,
        attach: fn(&mut S, GuestBridge<Req, Res>),
    ) -> Result<Self> {
        let module = sandbox.load_module(&config.module_path)?;
        let imports = host.compile(sandbox.engine())?;

        let status = RunStatus::new();
        let (host_end, guest_end) = bridge(status.clone(), config.submit_deadline());
        let state = imports.instantiate(vec![ModuleOption::new(BRIDGE_OPTION, move |s: &mut S| {
            attach(s, guest_end)
        })])?;

        let mut instance = sandbox.instantiate_with(&module, &imports, state)?;
        if let Some(export) = &config.init_export {
            instance.initialize(export)?;
        }
        let run_loop = RunLoop::start(instance, &config.entry_export, status)?;

        Ok(Self {
            run_loop,
            bridge: host_end,
            close_timeout: config.close_deadline(),
        })
    }

    fn close(&self) -> Result<RunOutcome> {
        self.run_loop.request_stop();
        self.bridge.close();
        self.run_loop.close(self.close_timeout)
    }
}

/// Bridged `add`: each call is one round trip through the guest's loop.
pub struct AddModule {
    inner: Bridged<(i32, i32), i32>,
}

impl AddModule {
    /// Load the guest, wire its bridge and start `config.entry_export`.
    pub fn new(sandbox: &WasmSandbox, config: &GuestConfig) -> Result<Self> {
        let host = add_host_module(&config.namespace)?;
        let inner = Bridged::start(sandbox, config, host, |state: &mut AddState, guest| {
            state.bridge = Some(guest)
        })?;
        Ok(Self { inner })
    }

    /// `i + j` computed by the guest. Blocks until the guest answers.
    pub fn add(&self, i: i32, j: i32) -> Result<i32> {
        self.inner.bridge.submit((i, j))
    }

    /// Run-loop outcome so far.
    pub fn status(&self) -> RunOutcome {
        self.inner.run_loop.status().outcome()
    }

    /// Wait up to `timeout` for the run loop to end on its own.
    pub fn wait(&self, timeout: Duration) -> Option<RunOutcome> {
        self.inner.run_loop.status().wait(timeout)
    }

    /// Stop the guest and wait for its run loop to end.
    pub fn close(&self) -> Result<RunOutcome> {
        self.inner.close()
    }
}

/// Bridged `cube`: each call is one round trip through the guest's loop.
pub struct CubeModule {
    inner: Bridged<i32, i32>,
}

impl CubeModule {
    /// Load the guest, wire its bridge and start `config.entry_export`.
    pub fn new(sandbox: &WasmSandbox, config: &GuestConfig) -> Result<Self> {
        let host = cube_host_module(&config.namespace)?;
        let inner = Bridged::start(sandbox, config, host, |state: &mut CubeState, guest| {
            state.bridge = Some(guest)
        })?;
        Ok(Self { inner })
    }

    /// `i * i * i` computed by the guest. Blocks until the guest answers.
    pub fn cube(&self, i: i32) -> Result<i32> {
        self.inner.bridge.submit(i)
    }

    /// Run-loop outcome so far.
    pub fn status(&self) -> RunOutcome {
        self.inner.run_loop.status().outcome()
    }

    /// Wait up to `timeout` for the run loop to end on its own.
    pub fn wait(&self, timeout: Duration) -> Option<RunOutcome> {
        self.inner.run_loop.status().wait(timeout)
    }

    /// Stop the guest and wait for its run loop to end.
    pub fn close(&self) -> Result<RunOutcome> {
        self.inner.close()
    }
}

//! Guest run-loop supervision.
//!
//! Imported-style guests never return from their entry export: they loop,
//! servicing bridged requests. [`RunLoop::start`] runs that export on a
//! dedicated thread, closes the instance the moment it returns, and records
//! how it ended in a [`RunStatus`] that bridges and callers can observe.
//!
//! Outcome classification:
//!
//! | Termination                                   | Outcome            |
//! |-----------------------------------------------|--------------------|
//! | `proc_exit(0)`                                | `ExitedCleanly`    |
//! | `proc_exit(n)`, n != 0                        | `ExitedWithError`  |
//! | trap                                          | `ExitedWithError`  |
//! | entry returned on its own                     | `ExitedWithError`  |
//! | bridge closed / interrupted after `close()`   | `ExitedCleanly`    |

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use wasmtime::Trap;
use wasmtime_wasi::I32Exit;

use super::runtime::{InterruptHandle, WasmInstance};
use crate::error::{Result, SandboxError};

/// How a guest run loop ended, or that it has not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Entry export still executing
    Running,
    /// Exit code 0, or stopped by a host-requested close
    ExitedCleanly,
    /// Non-zero exit, trap, or unexpected return
    ExitedWithError(String),
}

impl RunOutcome {
    /// True while the entry export is executing.
    pub fn is_running(&self) -> bool {
        matches!(self, RunOutcome::Running)
    }

    /// True for a clean exit.
    pub fn is_clean(&self) -> bool {
        matches!(self, RunOutcome::ExitedCleanly)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Running => write!(f, "running"),
            RunOutcome::ExitedCleanly => write!(f, "exited cleanly"),
            RunOutcome::ExitedWithError(detail) => write!(f, "exited with error: {}", detail),
        }
    }
}

/// Shared, write-once view of a run loop's outcome.
#[derive(Clone)]
pub struct RunStatus {
    inner: Arc<(Mutex<RunOutcome>, Condvar)>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RunStatus").field(&self.outcome()).finish()
    }
}

impl RunStatus {
    /// A status in the `Running` state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(RunOutcome::Running), Condvar::new())),
        }
    }

    /// Current outcome.
    pub fn outcome(&self) -> RunOutcome {
        self.inner
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The final outcome, if the loop has ended.
    pub fn finished(&self) -> Option<RunOutcome> {
        Some(self.outcome()).filter(|outcome| !outcome.is_running())
    }

    /// Record the final outcome. Only the first call takes effect.
    pub(crate) fn finish(&self, outcome: RunOutcome) -> bool {
        let (lock, changed) = &*self.inner;
        let mut current = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.is_running() || outcome.is_running() {
            return false;
        }
        *current = outcome;
        changed.notify_all();
        true
    }

    /// Block until the loop ends or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<RunOutcome> {
        let (lock, changed) = &*self.inner;
        let current = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (current, _) = changed
            .wait_timeout_while(current, timeout, |outcome| outcome.is_running())
            .unwrap_or_else(PoisonError::into_inner);
        Some(current.clone()).filter(|outcome| !outcome.is_running())
    }
}

/// A guest entry export running on its own thread.
pub struct RunLoop {
    name: String,
    status: RunStatus,
    interrupt: InterruptHandle,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RunLoop {
    /// Resolve `entry` and run it on a dedicated thread.
    ///
    /// The instance moves to that thread and is dropped (closed) as soon as
    /// the entry returns, which disconnects every bridge whose guest end
    /// lives in its state.
    pub fn start<S: Send + 'static>(
        mut instance: WasmInstance<S>,
        entry: &str,
        status: RunStatus,
    ) -> Result<Self> {
        let func = instance.typed_func::<(), ()>(entry)?;
        let interrupt = instance.interrupt_handle();
        let name = format!("{}:{}", instance.name(), entry);

        let handle = {
            let status = status.clone();
            let interrupt = interrupt.clone();
            let name = name.clone();
            thread::Builder::new()
                .name(format!("guest-{}", instance.name()))
                .spawn(move || {
                    tracing::info!(guest = %name, "guest run loop started");
                    let result = func.call(instance.store_mut(), ());

                    // Entry returned: release the sandbox before anything else.
                    drop(instance);

                    let outcome = classify(result, interrupt.is_requested());
                    match &outcome {
                        RunOutcome::ExitedWithError(detail) => {
                            tracing::error!(guest = %name, %detail, "guest run loop stopped with error")
                        }
                        _ => tracing::info!(guest = %name, "guest run loop stopped"),
                    }
                    status.finish(outcome);
                })?
        };

        Ok(Self {
            name,
            status,
            interrupt,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// `module:entry` label used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared status.
    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// True while the entry export is executing.
    pub fn is_running(&self) -> bool {
        self.status.outcome().is_running()
    }

    /// Mark the loop as closing and interrupt guest code at its next epoch
    /// check. Termination after this point counts as clean.
    pub fn request_stop(&self) {
        self.interrupt.interrupt();
    }

    /// Request shutdown and wait up to `timeout` for the guest to stop.
    ///
    /// A guest blocked inside a host call only stops once that call returns;
    /// callers should close the bridges feeding it first.
    pub fn close(&self, timeout: Duration) -> Result<RunOutcome> {
        self.request_stop();
        match self.status.wait(timeout) {
            Some(_) => Ok(self.join()),
            None => {
                tracing::warn!(guest = %self.name, ?timeout, "guest did not stop in time");
                Err(SandboxError::Timeout(timeout))
            }
        }
    }

    /// Wait for the guest thread to finish and return the outcome.
    pub fn join(&self) -> RunOutcome {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                self.status
                    .finish(RunOutcome::ExitedWithError("guest thread panicked".to_string()));
            }
        }
        self.status.outcome()
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        // Never block here; a guest stuck in a host call would hang the drop.
        if self.is_running() {
            self.interrupt.interrupt();
        }
    }
}

fn classify(result: wasmtime::Result<()>, closing: bool) -> RunOutcome {
    let err = match result {
        Ok(()) if closing => return RunOutcome::ExitedCleanly,
        Ok(()) => return RunOutcome::ExitedWithError("entry export returned".to_string()),
        Err(err) => err,
    };

    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return match exit.0 {
            0 => RunOutcome::ExitedCleanly,
            code => RunOutcome::ExitedWithError(format!("exit code {}", code)),
        };
    }

    let requested_stop = matches!(
        err.downcast_ref::<SandboxError>(),
        Some(SandboxError::BridgeClosed | SandboxError::Interrupted)
    ) || matches!(err.downcast_ref::<Trap>(), Some(Trap::Interrupt));
    if closing && requested_stop {
        return RunOutcome::ExitedCleanly;
    }

    RunOutcome::ExitedWithError(format!("{:#}", err))
}

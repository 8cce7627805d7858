//! Drivers for the reference guests.
//!
//! - [`ExportedModule`]: a reactor guest exporting `add` and `cube`, called
//!   directly on the caller's thread.
//! - [`AddModule`] / [`CubeModule`]: command guests whose `_start` loops
//!   forever, pulling requests through `add_request` / `cube_request` and
//!   pushing results through `add_response` / `cube_response`.
//!
//! ## Imports
//!
//! ```wat
//! (import "tandem" "add_request"  (func (param i32 i32)))   ;; writes *i, *j
//! (import "tandem" "add_response" (func (param i32)))
//! (import "tandem" "cube_request" (func (result i32)))
//! (import "tandem" "cube_response" (func (param i32)))
//! (import "tandem" "log"          (func (param i32 i32)))   ;; ptr, len
//! ```

mod exported;
mod imported;

pub use exported::ExportedModule;
pub use imported::{
    add_host_module, cube_host_module, AddModule, AddState, CubeModule, CubeState, BRIDGE_OPTION,
};

use crate::error::Result;
use crate::wasm::Bytes;

/// `log(ptr, len)`: forward guest text to the host's logger.
pub(crate) fn guest_log<S>(_state: &mut S, text: Bytes) -> Result<()> {
    tracing::info!(target: "tandem::guest", "{}", text.to_string_lossy());
    Ok(())
}

//! Host imports shared by the `add` and `cube` command guests.
//!
//! Build with: cargo build --target wasm32-wasip1 --release
//!
//! Each binary's `main` loops forever: it blocks in a `*_request` import
//! until the host submits a call, computes, and returns the value through
//! the matching `*_response` import.

#[link(wasm_import_module = "tandem")]
extern "C" {
    fn add_request(i: *mut i32, j: *mut i32);
    fn add_response(sum: i32);
    fn cube_request() -> i32;
    fn cube_response(cubed: i32);
    fn log(ptr: *const u8, len: usize);
}

/// Forward a message to the host's logger.
pub fn host_log(message: &str) {
    unsafe { log(message.as_ptr(), message.len()) }
}

/// Block until the host submits an add; returns the operands.
pub fn next_add() -> (i32, i32) {
    let (mut i, mut j) = (0, 0);
    unsafe { add_request(&mut i, &mut j) };
    (i, j)
}

/// Hand an add result back to the waiting host caller.
pub fn answer_add(sum: i32) {
    unsafe { add_response(sum) }
}

/// Block until the host submits a cube; returns the operand.
pub fn next_cube() -> i32 {
    unsafe { cube_request() }
}

/// Hand a cube result back to the waiting host caller.
pub fn answer_cube(cubed: i32) {
    unsafe { cube_response(cubed) }
}

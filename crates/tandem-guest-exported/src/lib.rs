//! Reactor guest: the host calls `add` and `cube` directly.
//!
//! Build with: cargo build --target wasm32-wasip1 --release
//!
//! A `cdylib` for `wasm32-wasip1` is linked without the reactor start file,
//! so `_initialize` is exported here by hand. The host runs it once before
//! any other call.

use std::sync::atomic::{AtomicBool, Ordering};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Reactor initialization export.
#[no_mangle]
pub extern "C" fn _initialize() {
    INITIALIZED.store(true, Ordering::Release);
}

/// Whether `_initialize` has run.
pub fn initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// `i + j`, wrapping on overflow.
#[no_mangle]
pub extern "C" fn add(i: i32, j: i32) -> i32 {
    i.wrapping_add(j)
}

/// `i * i * i`, wrapping on overflow.
#[no_mangle]
pub extern "C" fn cube(i: i32) -> i32 {
    i.wrapping_mul(i).wrapping_mul(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_marks_module() {
        _initialize();
        assert!(initialized());
    }

    #[test]
    fn test_add() {
        assert_eq!(add(1, 2), 3);
        assert_eq!(add(i32::MAX, 1), i32::MIN);
    }

    #[test]
    fn test_cube() {
        assert_eq!(cube(5), 125);
        assert_eq!(cube(125), 1_953_125);
        assert_eq!(cube(-2), -8);
    }
}

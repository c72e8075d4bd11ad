//! Console output entry points.

use crate::builtins::expect_payload;
use crate::builtins::str::{TYPE_STR, payload_bytes, payload_len};

/// Print a signed integer and a newline.
#[unsafe(no_mangle)]
pub extern "C" fn rt_println_i64(value: i64) {
    println!("{value}");
}

/// Print an unsigned integer and a newline.
#[unsafe(no_mangle)]
pub extern "C" fn rt_println_u64(value: u64) {
    println!("{value}");
}

/// Print a byte as a number and a newline.
#[unsafe(no_mangle)]
pub extern "C" fn rt_println_u8(value: u8) {
    println!("{value}");
}

/// Print `true` or `false` and a newline.
#[unsafe(no_mangle)]
pub extern "C" fn rt_println_bool(value: bool) {
    println!("{value}");
}

/// Print a double and a newline.
#[unsafe(no_mangle)]
pub extern "C" fn rt_println_double(value: f64) {
    println!("{value}");
}

/// Print a `Str`'s bytes (lossily, for non-UTF-8 content) and a newline.
///
/// # Safety
/// `s` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_println_str(s: *mut u8) {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(s, &TYPE_STR, "rt_println_str") };
    // SAFETY: validated Str payload.
    let bytes = unsafe {
        std::slice::from_raw_parts(payload_bytes(payload), payload_len(payload) as usize)
    };
    println!("{}", String::from_utf8_lossy(bytes));
}

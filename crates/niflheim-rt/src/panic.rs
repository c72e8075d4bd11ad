//! Terminal failure reporting.
//!
//! Every in-language error routes through this module: the message goes to
//! stderr as `panic: <message>`, followed by a `location:` line and a
//! `stacktrace:` block when the diagnostic trace-frame stack is non-empty,
//! then the process aborts. Nothing here returns.

use std::ffi::CStr;
use std::io::Write;
use std::os::raw::c_char;

use crate::context;
use crate::object::TypeDesc;
use crate::roots::TraceFrame;

/// Print `panic: <msg>` plus the diagnostic stack and abort.
pub fn fatal(msg: &str) -> ! {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "panic: {msg}");
    write_trace(&mut out);
    drop(out);
    std::process::abort();
}

/// `panic: bad cast (From -> To)`.
pub fn bad_cast(from: &TypeDesc, to: &TypeDesc) -> ! {
    fatal(&format!(
        "bad cast ({} -> {})",
        from.debug_name(),
        to.debug_name()
    ));
}

/// `panic: out of memory`.
pub fn oom() -> ! {
    fatal("out of memory");
}

fn write_trace(out: &mut impl Write) {
    let ts = context::published_thread_state();
    if ts.is_null() {
        return;
    }
    // SAFETY: the published pointer stays valid until rt_shutdown, and the
    // runtime is single-threaded, so nobody mutates the stack under us.
    let mut frame: *mut TraceFrame = unsafe { (*ts).trace_top };
    if frame.is_null() {
        return;
    }
    // SAFETY: trace frames live on the native stack of still-active
    // activations; the chain is intact whenever a panic fires.
    unsafe {
        let top = &*frame;
        if !top.file.is_null() {
            let _ = writeln!(
                out,
                "location: {}:{}:{}",
                cstr_or(top.file, "?"),
                top.line,
                top.col
            );
        }
        let _ = writeln!(out, "stacktrace:");
        while !frame.is_null() {
            let f = &*frame;
            let _ = writeln!(
                out,
                "  at {} ({}:{}:{})",
                cstr_or(f.func, "?"),
                cstr_or(f.file, "?"),
                f.line,
                f.col
            );
            frame = f.prev;
        }
    }
}

unsafe fn cstr_or<'a>(ptr: *const u8, fallback: &'a str) -> &'a str {
    if ptr.is_null() {
        return fallback;
    }
    // SAFETY: trace-frame strings are NUL-terminated literals emitted into
    // the program's rodata.
    unsafe { CStr::from_ptr(ptr.cast()) }
        .to_str()
        .unwrap_or(fallback)
}

/// Explicit panic with a caller-supplied NUL-terminated message.
///
/// # Safety
/// `msg` must be null or point at a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_panic(msg: *const c_char) -> ! {
    if msg.is_null() {
        fatal("(null message)");
    }
    // SAFETY: msg is NUL-terminated per the caller contract.
    let text = unsafe { CStr::from_ptr(msg) }.to_string_lossy();
    fatal(&text)
}

/// Null field/method access.
#[unsafe(no_mangle)]
pub extern "C" fn rt_panic_null_deref() -> ! {
    fatal("null dereference");
}

/// Failed downcast.
///
/// # Safety
/// Both descriptor pointers must be valid or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_panic_bad_cast(from: *const TypeDesc, to: *const TypeDesc) -> ! {
    if from.is_null() || to.is_null() {
        fatal("bad cast");
    }
    // SAFETY: both descriptors are valid per the caller contract.
    unsafe { bad_cast(&*from, &*to) }
}

/// Allocation failed after a forced collection.
#[unsafe(no_mangle)]
pub extern "C" fn rt_panic_oom() -> ! {
    oom();
}

/// Walk guard used by tests: formats the trace block into a string instead
/// of stderr.
#[cfg(test)]
pub(crate) fn render_trace_for_test(top: *mut TraceFrame) -> String {
    let mut out = Vec::new();
    let mut frame = top;
    // SAFETY: test frames are stack-allocated by the caller.
    unsafe {
        while !frame.is_null() {
            let f = &*frame;
            let _ = writeln!(
                out,
                "  at {} ({}:{}:{})",
                cstr_or(f.func, "?"),
                cstr_or(f.file, "?"),
                f.line,
                f.col
            );
            frame = f.prev;
        }
    }
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn trace_renders_reverse_chronological() {
        let mut outer = TraceFrame {
            prev: ptr::null_mut(),
            func: c"main".as_ptr().cast(),
            file: c"demo.nfl".as_ptr().cast(),
            line: 3,
            col: 1,
        };
        let mut inner = TraceFrame {
            prev: &raw mut outer,
            func: c"fail".as_ptr().cast(),
            file: c"demo.nfl".as_ptr().cast(),
            line: 9,
            col: 5,
        };
        let text = render_trace_for_test(&raw mut inner);
        let fail_at = text.find("at fail").expect("inner frame missing");
        let main_at = text.find("at main").expect("outer frame missing");
        assert!(fail_at < main_at, "innermost frame must print first");
    }
}

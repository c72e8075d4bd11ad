//! `Str` — immutable byte string.

use niflheim_abi::ABI_SCHEMA_VERSION;
use niflheim_abi::typedesc::{TYPE_FLAG_LEAF, TYPE_FLAG_VARIABLE_SIZE, type_ids};

use crate::alloc::alloc_obj;
use crate::builtins::expect_payload;
use crate::context::{self, RtContext};
use crate::object::TypeDesc;
use crate::panic;
use crate::roots::ThreadState;

/// Descriptor for `Str`.
#[unsafe(export_name = "rt_type_str")]
pub static TYPE_STR: TypeDesc = TypeDesc {
    type_id: type_ids::STR,
    flags: TYPE_FLAG_LEAF | TYPE_FLAG_VARIABLE_SIZE,
    schema_version: ABI_SCHEMA_VERSION,
    align: 8,
    size_bytes: 0,
    name: c"Str".as_ptr().cast(),
    trace_fn: None,
    ref_offsets: std::ptr::null(),
    ref_offsets_len: 0,
};

/// Allocate a `Str` of `len` bytes and copy `bytes` into it.
///
/// # Safety
/// `bytes` must cover `len` readable bytes that stay valid across a
/// collection (they are copied after the allocation returns).
pub(crate) unsafe fn new_str(
    ctx: &mut RtContext,
    ts: *mut ThreadState,
    bytes: *const u8,
    len: u64,
) -> *mut u8 {
    let payload_bytes = match 8u64.checked_add(len) {
        Some(total) => total,
        None => panic::oom(),
    };
    // SAFETY: the descriptor is valid; ts is forwarded from the entry point.
    let obj = unsafe { alloc_obj(ctx, ts, &TYPE_STR, payload_bytes) };
    // SAFETY: the payload covers 8 + len zeroed bytes.
    unsafe {
        let payload = crate::object::payload(obj);
        *payload.cast::<u64>() = len;
        if len > 0 {
            std::ptr::copy_nonoverlapping(bytes, payload.add(8), len as usize);
        }
    }
    obj
}

/// Length of a validated `Str` payload.
#[inline]
pub(crate) unsafe fn payload_len(payload: *const u8) -> u64 {
    // SAFETY: every Str payload starts with its length.
    unsafe { *payload.cast::<u64>() }
}

/// Byte base of a validated `Str` payload.
#[inline]
pub(crate) unsafe fn payload_bytes(payload: *mut u8) -> *mut u8 {
    // SAFETY: the bytes follow the length word.
    unsafe { payload.add(8) }
}

/// Build a `Str` from a caller-supplied byte buffer.
///
/// # Safety
/// `ts` must be the current thread state; `bytes` must cover `len` readable
/// bytes (may be null only when `len == 0`).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_str_from_bytes(
    ts: *mut ThreadState,
    bytes: *const u8,
    len: u64,
) -> *mut u8 {
    if ts.is_null() {
        panic::fatal("rt_str_from_bytes: null thread state");
    }
    if len > 0 && bytes.is_null() {
        panic::fatal("rt_str_from_bytes: null byte pointer");
    }
    context::with("rt_str_from_bytes", |ctx| {
        // SAFETY: forwarded caller contract.
        unsafe { new_str(ctx, ts, bytes, len) }
    })
}

/// Byte length.
///
/// # Safety
/// `s` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_str_len(s: *mut u8) -> u64 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(s, &TYPE_STR, "rt_str_len") };
    // SAFETY: validated Str payload.
    unsafe { payload_len(payload) }
}

/// Bounds-checked byte read.
///
/// # Safety
/// `s` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_str_get_u8(s: *mut u8, i: u64) -> u8 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(s, &TYPE_STR, "rt_str_get_u8") };
    // SAFETY: validated Str payload.
    unsafe {
        if i >= payload_len(payload) {
            panic::fatal("rt_str_get_u8: index out of bounds");
        }
        *payload_bytes(payload).add(i as usize)
    }
}

/// Copy `[start, end)` into a fresh `Str`.
///
/// # Safety
/// `ts` must be the current thread state; `s` must be rooted by the caller
/// (this entry allocates).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_str_slice(
    ts: *mut ThreadState,
    s: *mut u8,
    start: u64,
    end: u64,
) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(s, &TYPE_STR, "rt_str_slice") };
    // SAFETY: validated Str payload.
    let len = unsafe { payload_len(payload) };
    if start > end || end > len {
        panic::fatal("rt_str_slice: invalid slice range");
    }
    context::with("rt_str_slice", |ctx| {
        // SAFETY: s stays alive across the allocation because the caller
        // roots it, and the range check above bounds the copy.
        unsafe { new_str(ctx, ts, payload_bytes(payload).add(start as usize), end - start) }
    })
}

/// Concatenate two strings into a fresh `Str`.
///
/// # Safety
/// `ts` must be the current thread state; `a` and `b` must be rooted by the
/// caller (this entry allocates).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_str_concat(ts: *mut ThreadState, a: *mut u8, b: *mut u8) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    let (pa, pb) = unsafe {
        (
            expect_payload(a, &TYPE_STR, "rt_str_concat"),
            expect_payload(b, &TYPE_STR, "rt_str_concat"),
        )
    };
    context::with("rt_str_concat", |ctx| {
        // SAFETY: validated payloads; both operands are caller-rooted, so
        // their bytes survive any collection the allocation triggers.
        unsafe {
            let (la, lb) = (payload_len(pa), payload_len(pb));
            let len = match la.checked_add(lb) {
                Some(len) => len,
                None => panic::oom(),
            };
            let payload_bytes_total = match len.checked_add(8) {
                Some(total) => total,
                None => panic::oom(),
            };
            let out = alloc_obj(ctx, ts, &TYPE_STR, payload_bytes_total);
            let out_payload = crate::object::payload(out);
            *out_payload.cast::<u64>() = len;
            std::ptr::copy_nonoverlapping(payload_bytes(pa), out_payload.add(8), la as usize);
            std::ptr::copy_nonoverlapping(
                payload_bytes(pb),
                out_payload.add(8).add(la as usize),
                lb as usize,
            );
            out
        }
    })
}

/// Byte-wise equality.
///
/// # Safety
/// `a` and `b` must be null or live managed objects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_str_eq(a: *mut u8, b: *mut u8) -> bool {
    // SAFETY: forwarded caller contract.
    let (pa, pb) = unsafe {
        (
            expect_payload(a, &TYPE_STR, "rt_str_eq"),
            expect_payload(b, &TYPE_STR, "rt_str_eq"),
        )
    };
    // SAFETY: validated payloads.
    unsafe {
        let (la, lb) = (payload_len(pa), payload_len(pb));
        if la != lb {
            return false;
        }
        let (ba, bb) = (payload_bytes(pa), payload_bytes(pb));
        std::slice::from_raw_parts(ba, la as usize) == std::slice::from_raw_parts(bb, lb as usize)
    }
}

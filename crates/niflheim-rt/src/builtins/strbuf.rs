//! `StrBuf` — growable string builder, backed by a separate
//! `StrBufStorage` object. Structurally parallel to `Vec`/`VecStorage`,
//! except the storage holds raw bytes and is therefore a leaf.

use niflheim_abi::ABI_SCHEMA_VERSION;
use niflheim_abi::header::HEADER_SIZE;
use niflheim_abi::typedesc::{
    TYPE_FLAG_HAS_REFS, TYPE_FLAG_LEAF, TYPE_FLAG_VARIABLE_SIZE, type_ids,
};

use crate::alloc::alloc_obj;
use crate::builtins::expect_payload;
use crate::builtins::str::{TYPE_STR, new_str, payload_bytes, payload_len};
use crate::context::{self, RtContext};
use crate::object::{PAYLOAD_OFFSET, TypeDesc};
use crate::panic;
use crate::roots::ThreadState;

/// StrBuf payload: `[len: u64][storage: ref]`.
const STRBUF_PAYLOAD: u64 = 16;
/// Capacity of the first storage allocation.
const INITIAL_CAPACITY: u64 = 16;

/// Offset of the storage reference from the object base.
static STRBUF_REF_OFFSETS: [u64; 1] = [PAYLOAD_OFFSET as u64 + 8];

/// Descriptor for `StrBuf`.
#[unsafe(export_name = "rt_type_strbuf")]
pub static TYPE_STRBUF: TypeDesc = TypeDesc {
    type_id: type_ids::STRBUF,
    flags: TYPE_FLAG_HAS_REFS,
    schema_version: ABI_SCHEMA_VERSION,
    align: 8,
    size_bytes: HEADER_SIZE + STRBUF_PAYLOAD,
    name: c"StrBuf".as_ptr().cast(),
    trace_fn: None,
    ref_offsets: STRBUF_REF_OFFSETS.as_ptr(),
    ref_offsets_len: 1,
};

/// Descriptor for `StrBufStorage`.
#[unsafe(export_name = "rt_type_strbuf_storage")]
pub static TYPE_STRBUF_STORAGE: TypeDesc = TypeDesc {
    type_id: type_ids::STRBUF_STORAGE,
    flags: TYPE_FLAG_LEAF | TYPE_FLAG_VARIABLE_SIZE,
    schema_version: ABI_SCHEMA_VERSION,
    align: 8,
    size_bytes: 0,
    name: c"StrBufStorage".as_ptr().cast(),
    trace_fn: None,
    ref_offsets: std::ptr::null(),
    ref_offsets_len: 0,
};

#[inline]
unsafe fn buf_len(payload: *const u8) -> u64 {
    // SAFETY: every StrBuf payload starts with its length.
    unsafe { *payload.cast::<u64>() }
}

#[inline]
unsafe fn buf_storage(payload: *const u8) -> *mut u8 {
    // SAFETY: the storage reference follows the length word.
    unsafe { *payload.add(8).cast::<*mut u8>() }
}

#[inline]
unsafe fn storage_capacity(storage: *mut u8) -> u64 {
    // SAFETY: every StrBufStorage payload starts with its capacity.
    unsafe { *crate::object::payload(storage).cast::<u64>() }
}

#[inline]
unsafe fn storage_bytes(storage: *mut u8) -> *mut u8 {
    // SAFETY: the bytes follow the capacity word.
    unsafe { crate::object::payload(storage).add(8) }
}

/// Grow the buffer's storage so at least `needed` bytes fit, copying the
/// existing contents. No-op when the current capacity suffices.
unsafe fn ensure_capacity(
    ctx: &mut RtContext,
    ts: *mut ThreadState,
    payload: *mut u8,
    needed: u64,
) {
    // SAFETY: validated StrBuf payload; the buffer is caller-rooted, so the
    // old storage stays reachable through it across the allocation.
    unsafe {
        let storage = buf_storage(payload);
        let capacity = if storage.is_null() {
            0
        } else {
            storage_capacity(storage)
        };
        if needed <= capacity {
            return;
        }
        let mut new_capacity = capacity.saturating_mul(2).max(INITIAL_CAPACITY);
        while new_capacity < needed {
            new_capacity = match new_capacity.checked_mul(2) {
                Some(doubled) => doubled,
                None => panic::oom(),
            };
        }
        let bytes = match new_capacity.checked_add(8) {
            Some(total) => total,
            None => panic::oom(),
        };
        let new_storage = alloc_obj(ctx, ts, &TYPE_STRBUF_STORAGE, bytes);
        *crate::object::payload(new_storage).cast::<u64>() = new_capacity;
        if !storage.is_null() {
            std::ptr::copy_nonoverlapping(
                storage_bytes(storage),
                storage_bytes(new_storage),
                buf_len(payload) as usize,
            );
        }
        *payload.add(8).cast::<*mut u8>() = new_storage;
    }
}

/// Allocate an empty `StrBuf` (no storage until the first push).
///
/// # Safety
/// `ts` must be the current thread state.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_strbuf_new(ts: *mut ThreadState) -> *mut u8 {
    if ts.is_null() {
        panic::fatal("rt_strbuf_new: null thread state");
    }
    context::with("rt_strbuf_new", |ctx| {
        // SAFETY: the zeroed payload is already a valid empty buffer.
        unsafe { alloc_obj(ctx, ts, &TYPE_STRBUF, STRBUF_PAYLOAD) }
    })
}

/// Byte length.
///
/// # Safety
/// `sb` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_strbuf_len(sb: *mut u8) -> u64 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(sb, &TYPE_STRBUF, "rt_strbuf_len") };
    // SAFETY: validated StrBuf payload.
    unsafe { buf_len(payload) }
}

/// Append one byte.
///
/// # Safety
/// `ts` must be the current thread state; `sb` must be rooted by the caller
/// (this entry may allocate).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_strbuf_push_u8(ts: *mut ThreadState, sb: *mut u8, value: u8) {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(sb, &TYPE_STRBUF, "rt_strbuf_push_u8") };
    context::with("rt_strbuf_push_u8", |ctx| {
        // SAFETY: validated StrBuf payload; capacity is ensured before the
        // write.
        unsafe {
            let len = buf_len(payload);
            let needed = match len.checked_add(1) {
                Some(needed) => needed,
                None => panic::oom(),
            };
            ensure_capacity(ctx, ts, payload, needed);
            *storage_bytes(buf_storage(payload)).add(len as usize) = value;
            *payload.cast::<u64>() = len + 1;
        }
    });
}

/// Append the contents of a `Str`.
///
/// # Safety
/// `ts` must be the current thread state; `sb` and `s` must be rooted by
/// the caller (this entry may allocate).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_strbuf_push_str(ts: *mut ThreadState, sb: *mut u8, s: *mut u8) {
    // SAFETY: forwarded caller contract.
    let (payload, s_payload) = unsafe {
        (
            expect_payload(sb, &TYPE_STRBUF, "rt_strbuf_push_str"),
            expect_payload(s, &TYPE_STR, "rt_strbuf_push_str"),
        )
    };
    context::with("rt_strbuf_push_str", |ctx| {
        // SAFETY: validated payloads; both objects are caller-rooted, so
        // the source bytes survive the growth allocation.
        unsafe {
            let len = buf_len(payload);
            let extra = payload_len(s_payload);
            let needed = match len.checked_add(extra) {
                Some(needed) => needed,
                None => panic::oom(),
            };
            ensure_capacity(ctx, ts, payload, needed);
            std::ptr::copy_nonoverlapping(
                payload_bytes(s_payload),
                storage_bytes(buf_storage(payload)).add(len as usize),
                extra as usize,
            );
            *payload.cast::<u64>() = needed;
        }
    });
}

/// Freeze the current contents into a fresh `Str`.
///
/// # Safety
/// `ts` must be the current thread state; `sb` must be rooted by the caller
/// (this entry allocates).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_strbuf_to_str(ts: *mut ThreadState, sb: *mut u8) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(sb, &TYPE_STRBUF, "rt_strbuf_to_str") };
    context::with("rt_strbuf_to_str", |ctx| {
        // SAFETY: validated StrBuf payload; the buffer is caller-rooted, so
        // its storage survives the Str allocation.
        unsafe {
            let len = buf_len(payload);
            let storage = buf_storage(payload);
            let bytes = if storage.is_null() {
                std::ptr::null()
            } else {
                storage_bytes(storage).cast_const()
            };
            new_str(ctx, ts, bytes, len)
        }
    })
}

//! `Vec` — growable vector of references, backed by a separate
//! `VecStorage` object.
//!
//! The pair forms a two-object cycle-free chain: `Vec` holds `len` and a
//! reference to its storage; `VecStorage` holds `capacity` and the slots.
//! The `Vec` descriptor traces the storage reference through an offset
//! table; the storage descriptor traces every slot in `[0, capacity)` with
//! a trace function, so slots beyond `len` must stay null.

use std::os::raw::c_void;

use niflheim_abi::ABI_SCHEMA_VERSION;
use niflheim_abi::header::HEADER_SIZE;
use niflheim_abi::typedesc::{TYPE_FLAG_HAS_REFS, TYPE_FLAG_VARIABLE_SIZE, type_ids};

use crate::alloc::alloc_obj;
use crate::builtins::expect_payload;
use crate::context::{self, RtContext};
use crate::object::{MarkFn, PAYLOAD_OFFSET, TypeDesc};
use crate::panic;
use crate::roots::ThreadState;

/// Vec payload: `[len: u64][storage: ref]`.
const VEC_PAYLOAD: u64 = 16;
/// Capacity of the first storage allocation.
const INITIAL_CAPACITY: u64 = 8;

/// Offset of the storage reference from the object base, for the offset
/// table.
static VEC_REF_OFFSETS: [u64; 1] = [PAYLOAD_OFFSET as u64 + 8];

/// Descriptor for `Vec`.
#[unsafe(export_name = "rt_type_vec")]
pub static TYPE_VEC: TypeDesc = TypeDesc {
    type_id: type_ids::VEC,
    flags: TYPE_FLAG_HAS_REFS,
    schema_version: ABI_SCHEMA_VERSION,
    align: 8,
    size_bytes: HEADER_SIZE + VEC_PAYLOAD,
    name: c"Vec".as_ptr().cast(),
    trace_fn: None,
    ref_offsets: VEC_REF_OFFSETS.as_ptr(),
    ref_offsets_len: 1,
};

/// Trace every slot in `[0, capacity)`.
///
/// # Safety
/// Called by the collector on validated `VecStorage` objects only.
unsafe extern "C" fn trace_vec_storage(obj: *mut u8, mark: MarkFn, marker: *mut c_void) {
    // SAFETY: the collector only calls this on live VecStorage objects.
    unsafe {
        let payload = crate::object::payload(obj);
        let capacity = *payload.cast::<u64>();
        let slots = payload.add(8).cast::<*mut u8>();
        for i in 0..capacity as usize {
            mark(slots.add(i), marker);
        }
    }
}

/// Descriptor for `VecStorage`.
#[unsafe(export_name = "rt_type_vec_storage")]
pub static TYPE_VEC_STORAGE: TypeDesc = TypeDesc {
    type_id: type_ids::VEC_STORAGE,
    flags: TYPE_FLAG_HAS_REFS | TYPE_FLAG_VARIABLE_SIZE,
    schema_version: ABI_SCHEMA_VERSION,
    align: 8,
    size_bytes: 0,
    name: c"VecStorage".as_ptr().cast(),
    trace_fn: Some(trace_vec_storage),
    ref_offsets: std::ptr::null(),
    ref_offsets_len: 0,
};

#[inline]
unsafe fn vec_len(payload: *const u8) -> u64 {
    // SAFETY: every Vec payload starts with its length.
    unsafe { *payload.cast::<u64>() }
}

#[inline]
unsafe fn vec_storage(payload: *const u8) -> *mut u8 {
    // SAFETY: the storage reference follows the length word.
    unsafe { *payload.add(8).cast::<*mut u8>() }
}

#[inline]
unsafe fn storage_capacity(storage: *mut u8) -> u64 {
    // SAFETY: every VecStorage payload starts with its capacity.
    unsafe { *crate::object::payload(storage).cast::<u64>() }
}

#[inline]
unsafe fn storage_slots(storage: *mut u8) -> *mut *mut u8 {
    // SAFETY: the slots follow the capacity word.
    unsafe { crate::object::payload(storage).add(8).cast::<*mut u8>() }
}

/// Allocate a storage object of `capacity` null slots.
unsafe fn new_storage(ctx: &mut RtContext, ts: *mut ThreadState, capacity: u64) -> *mut u8 {
    let payload_bytes = match capacity
        .checked_mul(8)
        .and_then(|bytes| bytes.checked_add(8))
    {
        Some(total) => total,
        None => panic::oom(),
    };
    // SAFETY: the descriptor is valid; ts is forwarded from the entry point.
    let storage = unsafe { alloc_obj(ctx, ts, &TYPE_VEC_STORAGE, payload_bytes) };
    // SAFETY: the payload is zeroed; slots start null, which the trace
    // function tolerates.
    unsafe {
        *crate::object::payload(storage).cast::<u64>() = capacity;
    }
    storage
}

/// Allocate an empty `Vec` (no storage until the first push).
///
/// # Safety
/// `ts` must be the current thread state.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_vec_new(ts: *mut ThreadState) -> *mut u8 {
    if ts.is_null() {
        panic::fatal("rt_vec_new: null thread state");
    }
    context::with("rt_vec_new", |ctx| {
        // SAFETY: the descriptor is valid; the zeroed payload is already a
        // valid empty vector (len 0, null storage).
        unsafe { alloc_obj(ctx, ts, &TYPE_VEC, VEC_PAYLOAD) }
    })
}

/// Element count.
///
/// # Safety
/// `v` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_vec_len(v: *mut u8) -> u64 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(v, &TYPE_VEC, "rt_vec_len") };
    // SAFETY: validated Vec payload.
    unsafe { vec_len(payload) }
}

/// Append a reference, growing the storage when full.
///
/// # Safety
/// `ts` must be the current thread state; `v` and `value` must be rooted by
/// the caller (this entry may allocate).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_vec_push(ts: *mut ThreadState, v: *mut u8, value: *mut u8) {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(v, &TYPE_VEC, "rt_vec_push") };
    context::with("rt_vec_push", |ctx| {
        // SAFETY: validated Vec payload. The caller roots v and value, so
        // both survive a collection triggered by the storage allocation;
        // the old storage stays reachable through v until replaced.
        unsafe {
            let len = vec_len(payload);
            let mut storage = vec_storage(payload);
            let capacity = if storage.is_null() {
                0
            } else {
                storage_capacity(storage)
            };
            if len == capacity {
                let new_capacity = capacity.saturating_mul(2).max(INITIAL_CAPACITY);
                let new_storage = new_storage(ctx, ts, new_capacity);
                if !storage.is_null() {
                    std::ptr::copy_nonoverlapping(
                        storage_slots(storage),
                        storage_slots(new_storage),
                        len as usize,
                    );
                }
                *payload.add(8).cast::<*mut u8>() = new_storage;
                storage = new_storage;
            }
            *storage_slots(storage).add(len as usize) = value;
            *payload.cast::<u64>() = len + 1;
        }
    });
}

/// Bounds-checked element read; may return null.
///
/// # Safety
/// `v` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_vec_get(v: *mut u8, i: u64) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(v, &TYPE_VEC, "rt_vec_get") };
    // SAFETY: validated Vec payload; the index check bounds the read and
    // implies non-null storage.
    unsafe {
        if i >= vec_len(payload) {
            panic::fatal("rt_vec_get: index out of bounds");
        }
        *storage_slots(vec_storage(payload)).add(i as usize)
    }
}

/// Bounds-checked element write; `value` may be null.
///
/// # Safety
/// `v` must be null or a live managed object; `value` must be null or a
/// tracked object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_vec_set(v: *mut u8, i: u64, value: *mut u8) {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(v, &TYPE_VEC, "rt_vec_set") };
    // SAFETY: validated Vec payload; the index check bounds the write and
    // implies non-null storage.
    unsafe {
        if i >= vec_len(payload) {
            panic::fatal("rt_vec_set: index out of bounds");
        }
        *storage_slots(vec_storage(payload)).add(i as usize) = value;
    }
}

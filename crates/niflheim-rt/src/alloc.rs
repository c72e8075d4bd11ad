//! Object allocation.
//!
//! Objects come from the host allocator pre-zeroed, get their header written
//! before anything else can observe them, and are registered with the
//! collector before the pointer escapes. The pre-allocation threshold check
//! means every allocation is a potential collection; callers are bound by
//! the safepoint discipline to have spilled live references first.

use std::alloc::Layout;

use niflheim_abi::header::{HEADER_SIZE, MIN_ALIGN};

use crate::collect;
use crate::context::{self, RtContext};
use crate::object::{ObjHeader, TypeDesc};
use crate::panic;
use crate::roots::ThreadState;

/// Allocate a zero-initialized object of `HEADER_SIZE + payload_bytes`
/// bytes, register it, and return its base.
///
/// # Safety
/// `ty` must be a valid descriptor; `ts` must be the current thread state
/// (its root stack is consulted if a collection triggers).
pub unsafe fn alloc_obj(
    ctx: &mut RtContext,
    ts: *mut ThreadState,
    ty: *const TypeDesc,
    payload_bytes: u64,
) -> *mut u8 {
    if ty.is_null() {
        panic::fatal("rt_alloc_obj: null type descriptor");
    }
    let total = match (HEADER_SIZE as usize).checked_add(payload_bytes as usize) {
        Some(total) => total,
        None => panic::oom(),
    };

    collect::maybe_collect(ctx, ts, total);

    // SAFETY: ty is valid per the caller contract.
    let align = unsafe { ((*ty).align as usize).max(MIN_ALIGN as usize) };
    let layout = match Layout::from_size_align(total, align) {
        Ok(layout) => layout,
        Err(_) => panic::oom(),
    };

    // SAFETY: layout has non-zero size (it includes the header).
    let mut ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        // Host allocator refused; force a collection and retry exactly once.
        collect::collect(ctx, ts);
        // SAFETY: same layout as above.
        ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            panic::oom();
        }
    }

    // SAFETY: ptr covers `total` zeroed bytes; the header fits at the base.
    unsafe {
        let header = ptr.cast::<ObjHeader>();
        (*header).type_desc = ty;
        (*header).size_bytes = total as u64;
        (*header).flags = 0;
        (*header).reserved = 0;
    }

    ctx.tracked.insert(ptr as usize);
    ctx.allocated_bytes = ctx.allocated_bytes.saturating_add(total);
    ptr
}

/// Allocate a zero-initialized object. See [`alloc_obj`].
///
/// # Safety
/// `ts` must be the pointer returned by `rt_thread_state`; `ty` must be a
/// valid descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_alloc_obj(
    ts: *mut ThreadState,
    ty: *const TypeDesc,
    payload_bytes: u64,
) -> *mut u8 {
    if ts.is_null() {
        panic::fatal("rt_alloc_obj: null thread state");
    }
    context::with("rt_alloc_obj", |ctx| {
        // SAFETY: forwarded caller contract.
        unsafe { alloc_obj(ctx, ts, ty, payload_bytes) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use niflheim_abi::ABI_SCHEMA_VERSION;
    use niflheim_abi::typedesc::TYPE_FLAG_LEAF;
    use std::ptr;

    static LEAF: TypeDesc = TypeDesc {
        type_id: 0x7002,
        flags: TYPE_FLAG_LEAF,
        schema_version: ABI_SCHEMA_VERSION,
        align: 8,
        size_bytes: 32,
        name: c"Leaf".as_ptr().cast(),
        trace_fn: None,
        ref_offsets: ptr::null(),
        ref_offsets_len: 0,
    };

    #[test]
    fn fresh_object_header_is_canonical() {
        let mut ctx = RtContext::new();
        let mut ts = ThreadState {
            roots_top: ptr::null_mut(),
            trace_top: ptr::null_mut(),
        };
        // SAFETY: descriptor and thread state are valid.
        let obj = unsafe { alloc_obj(&mut ctx, &raw mut ts, &LEAF, 8) };
        // SAFETY: obj is a fresh allocation.
        let header = unsafe { &*obj.cast::<ObjHeader>() };
        assert_eq!(header.type_desc, &raw const LEAF);
        assert_eq!(header.size_bytes, HEADER_SIZE + 8);
        assert_eq!(header.flags, 0);
        assert_eq!(header.reserved, 0);
    }

    #[test]
    fn payload_is_zeroed() {
        let mut ctx = RtContext::new();
        let mut ts = ThreadState {
            roots_top: ptr::null_mut(),
            trace_top: ptr::null_mut(),
        };
        // SAFETY: descriptor and thread state are valid.
        let obj = unsafe { alloc_obj(&mut ctx, &raw mut ts, &LEAF, 64) };
        // SAFETY: the payload covers 64 bytes.
        let bytes = unsafe { std::slice::from_raw_parts(obj.add(HEADER_SIZE as usize), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn accounting_tracks_total_size() {
        let mut ctx = RtContext::new();
        let mut ts = ThreadState {
            roots_top: ptr::null_mut(),
            trace_top: ptr::null_mut(),
        };
        // SAFETY: descriptor and thread state are valid.
        unsafe { alloc_obj(&mut ctx, &raw mut ts, &LEAF, 16) };
        let stats = ctx.stats();
        assert_eq!(stats.allocated_bytes, HEADER_SIZE + 16);
        assert_eq!(stats.tracked_object_count, 1);
    }
}

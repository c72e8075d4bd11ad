//! Stop-the-world mark-sweep collector.
//!
//! One full cycle:
//!
//! 1. **Clear**: unset `MARKED` on every tracked object.
//! 2. **Mark**: push every root (global slots, then every slot of every
//!    frame on the thread's root stack) and drain the worklist, following
//!    each descriptor's trace function or pointer-offset table.
//! 3. **Sweep**: retain marked/pinned objects, free the rest.
//! 4. **Retune**: `allocated := live`, threshold grows from live bytes.
//!
//! Slot reads are defensive: a pointer that is not a member of the
//! tracked-object set is ignored, so stale bit patterns in a slot can never
//! corrupt the traversal. With the hash-backed tracked set the check is
//! exact and O(1).

use std::os::raw::c_void;

use rustc_hash::FxHashSet;

use niflheim_abi::ABI_SCHEMA_VERSION;
use niflheim_abi::header::{FLAG_MARKED, FLAG_PINNED};

use crate::context::{self, RtContext, free_object};
use crate::object::{MarkFn, ObjHeader};
use crate::panic;
use crate::roots::ThreadState;

/// Run a full collection: mark from every root reachable through `ts` and
/// the global registry, sweep, retune.
pub fn collect(ctx: &mut RtContext, ts: *mut ThreadState) {
    #[cfg(feature = "gc_logging")]
    tracing::debug!(
        allocated = ctx.allocated_bytes,
        tracked = ctx.tracked.len(),
        "gc: collection start"
    );

    // Phase 1: clear. Pinned survivors from earlier cycles may still carry
    // a stale mark; start every cycle from zero.
    for &addr in &ctx.tracked {
        // SAFETY: tracked addresses are live object bases.
        unsafe {
            (*(addr as *mut ObjHeader)).flags &= !FLAG_MARKED;
        }
    }

    // Phase 2+3: mark from roots, then drain.
    let mut marker = Marker {
        tracked: &ctx.tracked,
        worklist: Vec::new(),
    };
    for &slot in &ctx.global_roots {
        // SAFETY: registered slots stay valid until unregistered.
        unsafe { marker.mark_slot(slot as *mut *mut u8) };
    }
    if !ts.is_null() {
        // SAFETY: the root-frame chain is intact at every safepoint; each
        // frame's slot array covers slot_count entries.
        unsafe {
            let mut frame = (*ts).roots_top;
            while !frame.is_null() {
                let f = &*frame;
                for i in 0..f.slot_count as usize {
                    marker.mark_slot(f.slots.add(i));
                }
                frame = f.prev;
            }
        }
    }
    // SAFETY: every worklist entry is a tracked, marked object.
    unsafe { marker.drain() };

    // Phase 4: sweep.
    let mut live_bytes = 0usize;
    ctx.tracked.retain(|&addr| {
        // SAFETY: tracked addresses are live object bases; unreachable ones
        // are freed exactly once, here.
        unsafe {
            let header = addr as *mut ObjHeader;
            if (*header).flags & (FLAG_MARKED | FLAG_PINNED) != 0 {
                (*header).flags &= !FLAG_MARKED;
                live_bytes += (*header).size_bytes as usize;
                true
            } else {
                free_object(addr);
                false
            }
        }
    });

    // Phase 5: retune.
    ctx.live_bytes = live_bytes;
    ctx.allocated_bytes = live_bytes;
    ctx.next_threshold = ctx
        .config
        .min_threshold
        .max(live_bytes.saturating_mul(ctx.config.growth_num) / ctx.config.growth_den.max(1));
    ctx.collections += 1;

    #[cfg(feature = "gc_logging")]
    tracing::debug!(
        live = live_bytes,
        tracked = ctx.tracked.len(),
        next_threshold = ctx.next_threshold,
        "gc: collection end"
    );
}

/// Pre-allocation threshold check: collect when the upcoming allocation
/// would cross the trigger.
pub fn maybe_collect(ctx: &mut RtContext, ts: *mut ThreadState, upcoming_bytes: usize) {
    if ctx.allocated_bytes.saturating_add(upcoming_bytes) >= ctx.next_threshold {
        collect(ctx, ts);
    }
}

/// Marking state: the tracked set for membership checks plus the gray
/// worklist. Handed to trace functions as an opaque pointer.
struct Marker<'a> {
    tracked: &'a FxHashSet<usize>,
    worklist: Vec<*mut u8>,
}

impl Marker<'_> {
    /// Read a reference slot and mark its target. Null and untracked bit
    /// patterns are ignored.
    ///
    /// # Safety
    /// `slot` must be readable.
    unsafe fn mark_slot(&mut self, slot: *mut *mut u8) {
        // SAFETY: slot is readable per the caller contract.
        let obj = unsafe { *slot };
        if obj.is_null() {
            return;
        }
        if !self.tracked.contains(&(obj as usize)) {
            return;
        }
        // SAFETY: membership in the tracked set guarantees a live header.
        unsafe {
            let header = obj.cast::<ObjHeader>();
            if (*header).flags & FLAG_MARKED != 0 {
                return;
            }
            (*header).flags |= FLAG_MARKED;
        }
        self.worklist.push(obj);
    }

    /// Drain the worklist, tracing each object's outgoing references.
    ///
    /// # Safety
    /// Every worklist entry must be a tracked object.
    unsafe fn drain(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            // SAFETY: obj was validated by mark_slot.
            unsafe { self.trace(obj) };
        }
    }

    /// # Safety
    /// `obj` must be a tracked object.
    unsafe fn trace(&mut self, obj: *mut u8) {
        // SAFETY: tracked objects have intact headers.
        let desc = unsafe { (*obj.cast::<ObjHeader>()).type_desc };
        if desc.is_null() {
            panic::fatal("gc: tracked object has no type descriptor");
        }
        // SAFETY: descriptor pointers are valid for the process lifetime.
        let desc = unsafe { &*desc };
        if desc.schema_version != ABI_SCHEMA_VERSION {
            panic::fatal(&format!(
                "gc: descriptor '{}' has schema version {} (runtime speaks {})",
                desc.debug_name(),
                desc.schema_version,
                ABI_SCHEMA_VERSION
            ));
        }
        if desc.is_leaf() || !desc.has_refs() {
            return;
        }
        if let Some(trace_fn) = desc.trace_fn {
            // SAFETY: the descriptor's trace function matches the object's
            // layout by construction.
            unsafe { trace_fn(obj, mark_slot_cb, (self as *mut Self).cast::<c_void>()) };
        } else if !desc.ref_offsets.is_null() {
            for k in 0..desc.ref_offsets_len as usize {
                // SAFETY: the offset table covers ref_offsets_len entries,
                // each a slot offset within the object.
                unsafe {
                    let offset = *desc.ref_offsets.add(k) as usize;
                    self.mark_slot(obj.add(offset).cast::<*mut u8>());
                }
            }
        } else {
            panic::fatal(&format!(
                "gc: descriptor '{}' has refs but neither trace function nor offset table",
                desc.debug_name()
            ));
        }
    }
}

/// The [`MarkFn`] trampoline handed to trace functions.
///
/// # Safety
/// `marker` must be the `Marker` the collector passed alongside this
/// callback; `slot` must be readable.
pub(crate) unsafe extern "C" fn mark_slot_cb(slot: *mut *mut u8, marker: *mut c_void) {
    // SAFETY: the collector passes its own Marker as the opaque pointer.
    let marker = unsafe { &mut *marker.cast::<Marker<'_>>() };
    // SAFETY: slot is readable per the trace-function contract.
    unsafe { marker.mark_slot(slot) };
}

const _: () = {
    // The trampoline must match the ABI's MarkFn exactly.
    let _: MarkFn = mark_slot_cb;
};

/// Run a full collection.
///
/// # Safety
/// `ts` must be the pointer returned by `rt_thread_state`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_gc_collect(ts: *mut ThreadState) {
    if ts.is_null() {
        panic::fatal("rt_gc_collect: null thread state");
    }
    context::with("rt_gc_collect", |ctx| collect(ctx, ts));
}

/// Pre-allocation threshold check.
///
/// # Safety
/// `ts` must be the pointer returned by `rt_thread_state`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_gc_maybe_collect(ts: *mut ThreadState, upcoming_bytes: u64) {
    if ts.is_null() {
        panic::fatal("rt_gc_maybe_collect: null thread state");
    }
    context::with("rt_gc_maybe_collect", |ctx| {
        maybe_collect(ctx, ts, upcoming_bytes as usize);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::alloc_obj;
    use crate::object::TypeDesc;
    use crate::roots::RootFrame;
    use std::ptr;

    static LEAF: TypeDesc = TypeDesc {
        type_id: 0x7001,
        flags: niflheim_abi::typedesc::TYPE_FLAG_LEAF,
        schema_version: ABI_SCHEMA_VERSION,
        align: 8,
        size_bytes: 32,
        name: c"Leaf".as_ptr().cast(),
        trace_fn: None,
        ref_offsets: ptr::null(),
        ref_offsets_len: 0,
    };

    fn empty_thread() -> ThreadState {
        ThreadState {
            roots_top: ptr::null_mut(),
            trace_top: ptr::null_mut(),
        }
    }

    #[test]
    fn unrooted_objects_are_swept() {
        let mut ctx = RtContext::new();
        let mut ts = empty_thread();
        for _ in 0..10 {
            // SAFETY: descriptor and thread state are valid.
            unsafe { alloc_obj(&mut ctx, &raw mut ts, &LEAF, 8) };
        }
        assert_eq!(ctx.stats().tracked_object_count, 10);
        collect(&mut ctx, &raw mut ts);
        assert_eq!(ctx.stats().tracked_object_count, 0);
        assert_eq!(ctx.stats().live_bytes, 0);
    }

    #[test]
    fn rooted_object_survives() {
        let mut ctx = RtContext::new();
        let mut ts = empty_thread();
        let mut slots: [*mut u8; 1] = [ptr::null_mut()];
        let mut frame = RootFrame {
            prev: ptr::null_mut(),
            slot_count: 1,
            slots: slots.as_mut_ptr(),
        };
        ts.roots_top = &raw mut frame;

        // SAFETY: descriptor and thread state are valid.
        let obj = unsafe { alloc_obj(&mut ctx, &raw mut ts, &LEAF, 8) };
        slots[0] = obj;
        collect(&mut ctx, &raw mut ts);
        assert_eq!(ctx.stats().tracked_object_count, 1);
        assert_eq!(ctx.stats().allocated_bytes, ctx.stats().live_bytes);

        slots[0] = ptr::null_mut();
        collect(&mut ctx, &raw mut ts);
        assert_eq!(ctx.stats().tracked_object_count, 0);
    }

    #[test]
    fn untracked_slot_pattern_is_ignored() {
        let mut ctx = RtContext::new();
        let mut ts = empty_thread();
        let mut garbage = 0xdeadbeefu64;
        let mut slots: [*mut u8; 1] = [(&raw mut garbage).cast()];
        let mut frame = RootFrame {
            prev: ptr::null_mut(),
            slot_count: 1,
            slots: slots.as_mut_ptr(),
        };
        ts.roots_top = &raw mut frame;
        // Must not crash or mark anything.
        collect(&mut ctx, &raw mut ts);
        assert_eq!(ctx.stats().tracked_object_count, 0);
    }

    #[test]
    fn threshold_never_drops_below_min() {
        let mut ctx = RtContext::new();
        let mut ts = empty_thread();
        collect(&mut ctx, &raw mut ts);
        assert_eq!(ctx.stats().next_gc_threshold, 64 * 1024);
    }
}

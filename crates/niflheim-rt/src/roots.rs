//! Shadow-stack root protocol.
//!
//! Generated code maintains a singly-linked stack of root frames parallel to
//! the native call stack. Each frame points at a slot array reserved on the
//! activation frame; every live reference is spilled into a slot before any
//! safepoint, so the union of all slots (plus the registered global roots)
//! is a superset of the live references at every point the collector can
//! run.
//!
//! Frame and slot operations are pure pointer manipulation on caller-owned
//! memory and take no lock; only the global-root registry lives behind the
//! collector context.

use niflheim_abi::header::root_frame;

use crate::context;
use crate::panic;

/// One root frame, owned by an active function. `slots` points at a
/// caller-supplied array of `slot_count` reference slots, each holding a
/// tracked-object pointer or null.
#[repr(C)]
pub struct RootFrame {
    /// Previous frame in the shadow stack.
    pub prev: *mut RootFrame,
    /// Number of reference slots.
    pub slot_count: u64,
    /// Slot array; may be null only when `slot_count == 0`.
    pub slots: *mut *mut u8,
}

const _: () = {
    assert!(std::mem::size_of::<RootFrame>() == root_frame::SIZE as usize);
    assert!(std::mem::offset_of!(RootFrame, prev) == root_frame::PREV_OFFSET as usize);
    assert!(std::mem::offset_of!(RootFrame, slot_count) == root_frame::SLOT_COUNT_OFFSET as usize);
    assert!(std::mem::offset_of!(RootFrame, slots) == root_frame::SLOTS_OFFSET as usize);
};

/// One diagnostic trace frame. Optional; only emitted when the compiler is
/// asked for source locations in panics.
#[repr(C)]
pub struct TraceFrame {
    /// Previous frame in the diagnostic stack.
    pub prev: *mut TraceFrame,
    /// NUL-terminated function name.
    pub func: *const u8,
    /// NUL-terminated source file, may be null.
    pub file: *const u8,
    /// 1-based source line.
    pub line: u32,
    /// 1-based source column.
    pub col: u32,
}

/// Per-thread mutator state. v0.1 is single-threaded: one instance exists,
/// created by `rt_init` and handed to generated code via
/// `rt_thread_state`.
#[repr(C)]
pub struct ThreadState {
    /// Top of the root-frame stack.
    pub roots_top: *mut RootFrame,
    /// Top of the diagnostic trace-frame stack.
    pub trace_top: *mut TraceFrame,
}

/// Attach a slot array to a frame descriptor and null every slot.
///
/// # Safety
/// `frame` must be valid; `slots` must point at `n` writable slots. A null
/// `slots` is permitted only when `n == 0`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_root_frame_init(frame: *mut RootFrame, slots: *mut *mut u8, n: u64) {
    if frame.is_null() {
        panic::fatal("rt_root_frame_init: null frame");
    }
    if n > 0 && slots.is_null() {
        panic::fatal("rt_root_frame_init: null slot array");
    }
    // SAFETY: slots covers n entries per the caller contract. Nulling them
    // up front means the collector never sees stale stack garbage.
    unsafe {
        for i in 0..n as usize {
            *slots.add(i) = std::ptr::null_mut();
        }
        (*frame).prev = std::ptr::null_mut();
        (*frame).slot_count = n;
        (*frame).slots = slots;
    }
}

/// Link `frame` onto the thread's root stack.
///
/// # Safety
/// Both pointers must be valid; the frame must have been initialized.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_push_roots(ts: *mut ThreadState, frame: *mut RootFrame) {
    if ts.is_null() {
        panic::fatal("rt_push_roots: null thread state");
    }
    if frame.is_null() {
        panic::fatal("rt_push_roots: null frame");
    }
    // SAFETY: both pointers are valid per the caller contract.
    unsafe {
        if (*frame).slot_count > 0 && (*frame).slots.is_null() {
            panic::fatal("rt_push_roots: frame has slots but no slot array");
        }
        (*frame).prev = (*ts).roots_top;
        (*ts).roots_top = frame;
    }
}

/// Unlink and return the top root frame. Underflow is fatal.
///
/// # Safety
/// `ts` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_pop_roots(ts: *mut ThreadState) -> *mut RootFrame {
    if ts.is_null() {
        panic::fatal("rt_pop_roots: null thread state");
    }
    // SAFETY: ts is valid per the caller contract.
    unsafe {
        let top = (*ts).roots_top;
        if top.is_null() {
            panic::fatal("rt_pop_roots: root stack underflow");
        }
        (*ts).roots_top = (*top).prev;
        (*top).prev = std::ptr::null_mut();
        top
    }
}

/// Bounds-checked slot store.
///
/// # Safety
/// `frame` must be a valid, initialized frame.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_root_slot_store(frame: *mut RootFrame, i: u64, obj: *mut u8) {
    if frame.is_null() {
        panic::fatal("rt_root_slot_store: null frame");
    }
    // SAFETY: frame is valid per the caller contract.
    unsafe {
        if i >= (*frame).slot_count {
            panic::fatal("rt_root_slot_store: slot index out of bounds");
        }
        *(*frame).slots.add(i as usize) = obj;
    }
}

/// Bounds-checked slot load.
///
/// # Safety
/// `frame` must be a valid, initialized frame.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_root_slot_load(frame: *mut RootFrame, i: u64) -> *mut u8 {
    if frame.is_null() {
        panic::fatal("rt_root_slot_load: null frame");
    }
    // SAFETY: frame is valid per the caller contract.
    unsafe {
        if i >= (*frame).slot_count {
            panic::fatal("rt_root_slot_load: slot index out of bounds");
        }
        *(*frame).slots.add(i as usize)
    }
}

/// Register a global root slot. Idempotent.
///
/// # Safety
/// `slot` must point at a reference slot that stays valid until
/// unregistration.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_gc_register_global_root(slot: *mut *mut u8) {
    if slot.is_null() {
        panic::fatal("rt_gc_register_global_root: null slot");
    }
    context::with("rt_gc_register_global_root", |ctx| {
        ctx.global_roots.insert(slot as usize);
    });
}

/// Remove a global root slot. Unregistering a slot that was never
/// registered is a silent no-op.
///
/// # Safety
/// `slot` must be the pointer previously registered.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_gc_unregister_global_root(slot: *mut *mut u8) {
    if slot.is_null() {
        panic::fatal("rt_gc_unregister_global_root: null slot");
    }
    context::with("rt_gc_unregister_global_root", |ctx| {
        ctx.global_roots.remove(&(slot as usize));
    });
}

/// Push a diagnostic trace frame.
///
/// # Safety
/// Both pointers must be valid; the frame's strings must be NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_trace_push(ts: *mut ThreadState, frame: *mut TraceFrame) {
    if ts.is_null() || frame.is_null() {
        panic::fatal("rt_trace_push: null argument");
    }
    // SAFETY: both pointers are valid per the caller contract.
    unsafe {
        (*frame).prev = (*ts).trace_top;
        (*ts).trace_top = frame;
    }
}

/// Pop the top diagnostic trace frame. Underflow is fatal.
///
/// # Safety
/// `ts` must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_trace_pop(ts: *mut ThreadState) {
    if ts.is_null() {
        panic::fatal("rt_trace_pop: null thread state");
    }
    // SAFETY: ts is valid per the caller contract.
    unsafe {
        let top = (*ts).trace_top;
        if top.is_null() {
            panic::fatal("rt_trace_pop: trace stack underflow");
        }
        (*ts).trace_top = (*top).prev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn frame_init_nulls_slots() {
        let mut slots: [*mut u8; 3] = [ptr::dangling_mut(); 3];
        let mut frame = RootFrame {
            prev: ptr::null_mut(),
            slot_count: 0,
            slots: ptr::null_mut(),
        };
        // SAFETY: frame and slots are live locals.
        unsafe { rt_root_frame_init(&raw mut frame, slots.as_mut_ptr(), 3) };
        assert_eq!(frame.slot_count, 3);
        assert!(slots.iter().all(|s| s.is_null()));
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut ts = ThreadState {
            roots_top: ptr::null_mut(),
            trace_top: ptr::null_mut(),
        };
        let mut a = RootFrame {
            prev: ptr::null_mut(),
            slot_count: 0,
            slots: ptr::null_mut(),
        };
        let mut b = RootFrame {
            prev: ptr::null_mut(),
            slot_count: 0,
            slots: ptr::null_mut(),
        };
        // SAFETY: all pointers reference live locals.
        unsafe {
            rt_push_roots(&raw mut ts, &raw mut a);
            rt_push_roots(&raw mut ts, &raw mut b);
            assert_eq!(rt_pop_roots(&raw mut ts), &raw mut b);
            assert_eq!(rt_pop_roots(&raw mut ts), &raw mut a);
        }
        assert!(ts.roots_top.is_null());
    }

    #[test]
    fn slot_store_load_round_trip() {
        let mut slots: [*mut u8; 2] = [ptr::null_mut(); 2];
        let mut frame = RootFrame {
            prev: ptr::null_mut(),
            slot_count: 0,
            slots: ptr::null_mut(),
        };
        let mut value = 7u8;
        // SAFETY: frame and slots are live locals.
        unsafe {
            rt_root_frame_init(&raw mut frame, slots.as_mut_ptr(), 2);
            rt_root_slot_store(&raw mut frame, 1, &raw mut value);
            assert_eq!(rt_root_slot_load(&raw mut frame, 1), &raw mut value);
            assert!(rt_root_slot_load(&raw mut frame, 0).is_null());
        }
    }
}

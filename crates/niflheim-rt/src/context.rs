//! Process-wide collector context.
//!
//! All mutable collector state (the tracked-object set, the global-root
//! registry, and the accounting counters) lives in one `RtContext` created
//! by `rt_init` and torn down by `rt_shutdown`. Entry points lock it once
//! and pass `&mut RtContext` down; internal code never re-locks.
//!
//! The `ThreadState` handed to generated code is allocated separately and
//! published through an atomic so the panic path (and `rt_thread_state`
//! itself) can read it without touching the lock.

use std::alloc::Layout;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use niflheim_abi::header::{FLAG_PINNED, MIN_ALIGN};

use crate::object::ObjHeader;
use crate::panic;
use crate::roots::ThreadState;

/// GC tuning knobs.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Floor for the next-collection threshold (default: 64 KiB).
    pub min_threshold: usize,
    /// Numerator of the post-collection growth ratio (default: 2).
    pub growth_num: usize,
    /// Denominator of the post-collection growth ratio (default: 1).
    pub growth_den: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_threshold: 64 * 1024,
            growth_num: 2,
            growth_den: 1,
        }
    }
}

/// Snapshot of the GC accounting counters, `repr(C)` for the entry-point
/// surface.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtGcStats {
    /// Bytes allocated since the last collection finished (live bytes plus
    /// everything newer).
    pub allocated_bytes: u64,
    /// Live bytes as of the last collection.
    pub live_bytes: u64,
    /// Allocation level at which the next collection triggers.
    pub next_gc_threshold: u64,
    /// Number of currently tracked objects.
    pub tracked_object_count: u64,
}

/// The collector context. One per process behind [`with`]; tests may build
/// standalone instances via [`RtContext::with_config`].
pub struct RtContext {
    pub(crate) config: GcConfig,
    /// Every tracked object, keyed by base address. Exact and non-moving;
    /// membership answers "is this bit pattern a managed object" during
    /// marking.
    pub(crate) tracked: FxHashSet<usize>,
    /// Registered global root slots, keyed by slot address.
    pub(crate) global_roots: FxHashSet<usize>,
    pub(crate) allocated_bytes: usize,
    pub(crate) live_bytes: usize,
    pub(crate) next_threshold: usize,
    /// Completed collection cycles, for logging.
    pub(crate) collections: u64,
}

impl RtContext {
    /// Context with default tuning.
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Context with caller-supplied tuning.
    pub fn with_config(config: GcConfig) -> Self {
        let next_threshold = config.min_threshold;
        Self {
            config,
            tracked: FxHashSet::default(),
            global_roots: FxHashSet::default(),
            allocated_bytes: 0,
            live_bytes: 0,
            next_threshold,
            collections: 0,
        }
    }

    /// Current accounting snapshot.
    pub fn stats(&self) -> RtGcStats {
        RtGcStats {
            allocated_bytes: self.allocated_bytes as u64,
            live_bytes: self.live_bytes as u64,
            next_gc_threshold: self.next_threshold as u64,
            tracked_object_count: self.tracked.len() as u64,
        }
    }

    /// Free every tracked object and zero the accounting. Global roots stay
    /// registered; their slots simply dangle into nothing until the program
    /// stores fresh references.
    pub(crate) fn free_all_objects(&mut self) {
        for &addr in &self.tracked {
            // SAFETY: every address in the set came from a successful
            // allocation and has not been freed since.
            unsafe { free_object(addr) };
        }
        self.tracked.clear();
        self.allocated_bytes = 0;
        self.live_bytes = 0;
        self.next_threshold = self.config.min_threshold;
    }
}

impl Default for RtContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RtContext {
    fn drop(&mut self) {
        self.free_all_objects();
    }
}

/// Release one tracked object's backing memory.
///
/// # Safety
/// `addr` must be the base of a live tracked object; the object must not be
/// reachable afterwards.
pub(crate) unsafe fn free_object(addr: usize) {
    // SAFETY: the header is intact until the storage is released.
    unsafe {
        let header = addr as *mut ObjHeader;
        let size = (*header).size_bytes as usize;
        let align = if (*header).type_desc.is_null() {
            MIN_ALIGN as usize
        } else {
            ((*(*header).type_desc).align as usize).max(MIN_ALIGN as usize)
        };
        let layout = Layout::from_size_align_unchecked(size.max(1), align);
        std::alloc::dealloc(addr as *mut u8, layout);
    }
}

static CONTEXT: Mutex<Option<RtContext>> = Mutex::new(None);
static THREAD: AtomicPtr<ThreadState> = AtomicPtr::new(ptr::null_mut());

/// Run `f` with the process context locked. Fatal when the runtime was
/// never initialized (or already shut down).
pub(crate) fn with<R>(entry: &str, f: impl FnOnce(&mut RtContext) -> R) -> R {
    let mut guard = CONTEXT.lock();
    match guard.as_mut() {
        Some(ctx) => f(ctx),
        None => panic::fatal(&format!("{entry}: runtime not initialized")),
    }
}

/// The published thread-state pointer, null before `rt_init`.
pub(crate) fn published_thread_state() -> *mut ThreadState {
    THREAD.load(Ordering::Acquire)
}

/// Create the process-wide collector context and the mutator thread state.
/// Calling `rt_init` on an already-initialized runtime is a no-op.
#[unsafe(no_mangle)]
pub extern "C" fn rt_init() {
    let mut guard = CONTEXT.lock();
    if guard.is_some() {
        return;
    }
    *guard = Some(RtContext::new());
    let ts = Box::into_raw(Box::new(ThreadState {
        roots_top: ptr::null_mut(),
        trace_top: ptr::null_mut(),
    }));
    THREAD.store(ts, Ordering::Release);
}

/// Free every tracked object and tear the context down. Idempotent.
#[unsafe(no_mangle)]
pub extern "C" fn rt_shutdown() {
    let mut guard = CONTEXT.lock();
    // Dropping the context frees all remaining objects.
    guard.take();
    let ts = THREAD.swap(ptr::null_mut(), Ordering::AcqRel);
    if !ts.is_null() {
        // SAFETY: the pointer came from Box::into_raw in rt_init and is
        // retired exactly once here.
        drop(unsafe { Box::from_raw(ts) });
    }
}

/// The mutator's thread state. Fatal before `rt_init`.
#[unsafe(no_mangle)]
pub extern "C" fn rt_thread_state() -> *mut ThreadState {
    let ts = published_thread_state();
    if ts.is_null() {
        panic::fatal("rt_thread_state: runtime not initialized");
    }
    ts
}

/// Accounting snapshot.
#[unsafe(no_mangle)]
pub extern "C" fn rt_gc_get_stats() -> RtGcStats {
    with("rt_gc_get_stats", |ctx| ctx.stats())
}

/// Free every tracked object, clear the global-root registry, reset all
/// counters to their initial values, and null the thread's root and trace
/// stacks. Intended for test harnesses between scenarios.
#[unsafe(no_mangle)]
pub extern "C" fn rt_gc_reset_state() {
    with("rt_gc_reset_state", |ctx| {
        ctx.free_all_objects();
        ctx.global_roots.clear();
        ctx.collections = 0;
    });
    let ts = published_thread_state();
    if !ts.is_null() {
        // SAFETY: single-threaded runtime; nobody else touches the stacks.
        unsafe {
            (*ts).roots_top = ptr::null_mut();
            (*ts).trace_top = ptr::null_mut();
        }
    }
}

/// Record an externally produced object in the tracked set. The header must
/// already be fully written.
///
/// # Safety
/// `obj` must point at a well-formed object whose storage was obtained from
/// the global allocator with the header's size and the descriptor's
/// alignment.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_gc_track_allocation(obj: *mut u8) {
    if obj.is_null() {
        panic::fatal("rt_gc_track_allocation: null object");
    }
    // SAFETY: obj points at a well-formed header per the caller contract.
    let size = unsafe {
        let header = &*obj.cast::<ObjHeader>();
        if header.type_desc.is_null() {
            panic::fatal("rt_gc_track_allocation: object has no type descriptor");
        }
        header.size_bytes as usize
    };
    with("rt_gc_track_allocation", |ctx| {
        if ctx.tracked.insert(obj as usize) {
            ctx.allocated_bytes = ctx.allocated_bytes.saturating_add(size);
        }
    });
}

/// Set the `PINNED` bit: the object survives sweep even when unreachable.
///
/// # Safety
/// `obj` must point at a tracked object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_gc_pin(obj: *mut u8) {
    set_pinned("rt_gc_pin", obj, true);
}

/// Clear the `PINNED` bit.
///
/// # Safety
/// `obj` must point at a tracked object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_gc_unpin(obj: *mut u8) {
    set_pinned("rt_gc_unpin", obj, false);
}

fn set_pinned(entry: &str, obj: *mut u8, pinned: bool) {
    if obj.is_null() {
        panic::fatal(&format!("{entry}: null object"));
    }
    with(entry, |ctx| {
        if !ctx.tracked.contains(&(obj as usize)) {
            panic::fatal(&format!("{entry}: object is not tracked"));
        }
        // SAFETY: membership in the tracked set guarantees a live header.
        unsafe {
            let header = obj.cast::<ObjHeader>();
            if pinned {
                (*header).flags |= FLAG_PINNED;
            } else {
                (*header).flags &= !FLAG_PINNED;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_tuning() {
        let config = GcConfig::default();
        assert_eq!(config.min_threshold, 64 * 1024);
        assert_eq!(config.growth_num, 2);
        assert_eq!(config.growth_den, 1);
    }

    #[test]
    fn fresh_context_counters() {
        let ctx = RtContext::new();
        let stats = ctx.stats();
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.next_gc_threshold, 64 * 1024);
        assert_eq!(stats.tracked_object_count, 0);
    }
}

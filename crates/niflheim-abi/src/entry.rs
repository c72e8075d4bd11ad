//! Runtime entry-point table.
//!
//! The code generator calls into the runtime exclusively through the symbols
//! listed here; the runtime exports exactly these names with `extern "C"`
//! linkage. Keeping the table in one place means a renamed entry point is a
//! compile error on both sides instead of a link error at program build time.

use crate::prim::PrimKind;

/// Fixed-name runtime entry points.
///
/// Per-element-kind families (`rt_array_*_*`, `rt_box_*_*`, `rt_println_*`)
/// have their symbols derived by [`array_symbol`], [`box_symbol`] and
/// [`println_symbol`] instead of one variant each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    /// `rt_init()` — create the process-wide collector context.
    Init,
    /// `rt_shutdown()` — free every tracked object and tear the context down.
    Shutdown,
    /// `rt_thread_state() -> *ThreadState`.
    ThreadState,

    /// `rt_root_frame_init(frame, slots, n)`.
    RootFrameInit,
    /// `rt_root_slot_store(frame, i, ref)`.
    RootSlotStore,
    /// `rt_root_slot_load(frame, i) -> ref`.
    RootSlotLoad,
    /// `rt_push_roots(ts, frame)`.
    PushRoots,
    /// `rt_pop_roots(ts) -> frame`.
    PopRoots,
    /// `rt_gc_register_global_root(slot)`.
    RegisterGlobalRoot,
    /// `rt_gc_unregister_global_root(slot)`.
    UnregisterGlobalRoot,

    /// `rt_gc_collect(ts)`.
    GcCollect,
    /// `rt_gc_maybe_collect(ts, upcoming_bytes)`.
    GcMaybeCollect,
    /// `rt_gc_track_allocation(obj)`.
    GcTrackAllocation,
    /// `rt_gc_get_stats() -> {allocated, live, next_threshold, tracked}`.
    GcGetStats,
    /// `rt_gc_reset_state()`.
    GcResetState,
    /// `rt_gc_pin(obj)`.
    GcPin,
    /// `rt_gc_unpin(obj)`.
    GcUnpin,

    /// `rt_alloc_obj(ts, type, payload_bytes) -> obj`.
    AllocObj,
    /// `rt_checked_cast(obj, expected_type) -> obj`.
    CheckedCast,

    /// `rt_panic(msg)` — noreturn.
    Panic,
    /// `rt_panic_null_deref()` — noreturn.
    PanicNullDeref,
    /// `rt_panic_bad_cast(from, to)` — noreturn.
    PanicBadCast,
    /// `rt_panic_oom()` — noreturn.
    PanicOom,

    /// `rt_trace_push(ts, frame)` — diagnostic trace-frame stack.
    TracePush,
    /// `rt_trace_pop(ts)`.
    TracePop,

    /// `rt_str_from_bytes(ts, ptr, len) -> Str`.
    StrFromBytes,
    /// `rt_str_len(s) -> u64`.
    StrLen,
    /// `rt_str_get_u8(s, i) -> u8`.
    StrGetU8,
    /// `rt_str_slice(ts, s, start, end) -> Str`.
    StrSlice,
    /// `rt_str_concat(ts, a, b) -> Str`.
    StrConcat,
    /// `rt_str_eq(a, b) -> bool`.
    StrEq,

    /// `rt_strbuf_new(ts) -> StrBuf`.
    StrBufNew,
    /// `rt_strbuf_len(sb) -> u64`.
    StrBufLen,
    /// `rt_strbuf_push_u8(ts, sb, v)`.
    StrBufPushU8,
    /// `rt_strbuf_push_str(ts, sb, s)`.
    StrBufPushStr,
    /// `rt_strbuf_to_str(ts, sb) -> Str`.
    StrBufToStr,

    /// `rt_vec_new(ts) -> Vec`.
    VecNew,
    /// `rt_vec_len(v) -> u64`.
    VecLen,
    /// `rt_vec_push(ts, v, obj)`.
    VecPush,
    /// `rt_vec_get(v, i) -> obj`.
    VecGet,
    /// `rt_vec_set(v, i, obj)`.
    VecSet,

    /// `rt_println_str(s)`.
    PrintlnStr,
}

impl RuntimeFn {
    /// Linker symbol of this entry point.
    pub const fn symbol(self) -> &'static str {
        match self {
            RuntimeFn::Init => "rt_init",
            RuntimeFn::Shutdown => "rt_shutdown",
            RuntimeFn::ThreadState => "rt_thread_state",
            RuntimeFn::RootFrameInit => "rt_root_frame_init",
            RuntimeFn::RootSlotStore => "rt_root_slot_store",
            RuntimeFn::RootSlotLoad => "rt_root_slot_load",
            RuntimeFn::PushRoots => "rt_push_roots",
            RuntimeFn::PopRoots => "rt_pop_roots",
            RuntimeFn::RegisterGlobalRoot => "rt_gc_register_global_root",
            RuntimeFn::UnregisterGlobalRoot => "rt_gc_unregister_global_root",
            RuntimeFn::GcCollect => "rt_gc_collect",
            RuntimeFn::GcMaybeCollect => "rt_gc_maybe_collect",
            RuntimeFn::GcTrackAllocation => "rt_gc_track_allocation",
            RuntimeFn::GcGetStats => "rt_gc_get_stats",
            RuntimeFn::GcResetState => "rt_gc_reset_state",
            RuntimeFn::GcPin => "rt_gc_pin",
            RuntimeFn::GcUnpin => "rt_gc_unpin",
            RuntimeFn::AllocObj => "rt_alloc_obj",
            RuntimeFn::CheckedCast => "rt_checked_cast",
            RuntimeFn::Panic => "rt_panic",
            RuntimeFn::PanicNullDeref => "rt_panic_null_deref",
            RuntimeFn::PanicBadCast => "rt_panic_bad_cast",
            RuntimeFn::PanicOom => "rt_panic_oom",
            RuntimeFn::TracePush => "rt_trace_push",
            RuntimeFn::TracePop => "rt_trace_pop",
            RuntimeFn::StrFromBytes => "rt_str_from_bytes",
            RuntimeFn::StrLen => "rt_str_len",
            RuntimeFn::StrGetU8 => "rt_str_get_u8",
            RuntimeFn::StrSlice => "rt_str_slice",
            RuntimeFn::StrConcat => "rt_str_concat",
            RuntimeFn::StrEq => "rt_str_eq",
            RuntimeFn::StrBufNew => "rt_strbuf_new",
            RuntimeFn::StrBufLen => "rt_strbuf_len",
            RuntimeFn::StrBufPushU8 => "rt_strbuf_push_u8",
            RuntimeFn::StrBufPushStr => "rt_strbuf_push_str",
            RuntimeFn::StrBufToStr => "rt_strbuf_to_str",
            RuntimeFn::VecNew => "rt_vec_new",
            RuntimeFn::VecLen => "rt_vec_len",
            RuntimeFn::VecPush => "rt_vec_push",
            RuntimeFn::VecGet => "rt_vec_get",
            RuntimeFn::VecSet => "rt_vec_set",
            RuntimeFn::PrintlnStr => "rt_println_str",
        }
    }

    /// True when the entry point can allocate, and therefore run a
    /// collection, during the call. Non-allocating entries are still
    /// safepoints under the v0.1 discipline; this distinction exists for a
    /// later spill-elision pass.
    pub const fn may_allocate(self) -> bool {
        matches!(
            self,
            RuntimeFn::AllocObj
                | RuntimeFn::GcCollect
                | RuntimeFn::GcMaybeCollect
                | RuntimeFn::StrFromBytes
                | RuntimeFn::StrSlice
                | RuntimeFn::StrConcat
                | RuntimeFn::StrBufNew
                | RuntimeFn::StrBufPushU8
                | RuntimeFn::StrBufPushStr
                | RuntimeFn::StrBufToStr
                | RuntimeFn::VecNew
                | RuntimeFn::VecPush
        )
    }
}

/// Element categories an array entry point is specialized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemKind {
    /// Array of inline primitive elements.
    Prim(PrimKind),
    /// Array of reference slots.
    Ref,
}

impl ElemKind {
    /// Storage width of one element, in bytes.
    #[inline]
    pub const fn byte_width(self) -> u64 {
        match self {
            ElemKind::Prim(k) => k.byte_width(),
            ElemKind::Ref => 8,
        }
    }

    /// Suffix used in `rt_array_*` symbols.
    pub const fn suffix(self) -> &'static str {
        match self {
            ElemKind::Prim(k) => k.suffix(),
            ElemKind::Ref => "ref",
        }
    }
}

/// Operations available on every array flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayOp {
    /// `rt_array_new_K(ts, len) -> arr`.
    New,
    /// `rt_array_len_K(arr) -> u64`.
    Len,
    /// `rt_array_get_K(arr, i) -> elem`.
    Get,
    /// `rt_array_set_K(arr, i, elem)`.
    Set,
    /// `rt_array_slice_K(ts, arr, start, end) -> arr`.
    Slice,
}

impl ArrayOp {
    const fn name(self) -> &'static str {
        match self {
            ArrayOp::New => "new",
            ArrayOp::Len => "len",
            ArrayOp::Get => "get",
            ArrayOp::Set => "set",
            ArrayOp::Slice => "slice",
        }
    }

    /// True when the operation allocates.
    pub const fn may_allocate(self) -> bool {
        matches!(self, ArrayOp::New | ArrayOp::Slice)
    }
}

/// Symbol of an array entry point, e.g. `rt_array_get_i64`.
pub fn array_symbol(op: ArrayOp, elem: ElemKind) -> String {
    format!("rt_array_{}_{}", op.name(), elem.suffix())
}

/// Symbol of a box entry point, e.g. `rt_box_double_new`.
pub fn box_symbol(kind: PrimKind, op: &str) -> String {
    format!("rt_box_{}_{}", kind.suffix(), op)
}

/// Symbol of a primitive println entry point, e.g. `rt_println_bool`.
pub fn println_symbol(kind: PrimKind) -> String {
    format!("rt_println_{}", kind.suffix())
}

/// Symbol of a built-in type descriptor exported by the runtime, e.g.
/// `rt_type_str`, `rt_type_box_i64`, `rt_type_array_ref`.
pub fn type_symbol(name: &str) -> String {
    format!("rt_type_{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_symbols() {
        assert_eq!(
            array_symbol(ArrayOp::Get, ElemKind::Prim(PrimKind::I64)),
            "rt_array_get_i64"
        );
        assert_eq!(array_symbol(ArrayOp::Slice, ElemKind::Ref), "rt_array_slice_ref");
    }

    #[test]
    fn box_and_println_symbols() {
        assert_eq!(box_symbol(PrimKind::Bool, "new"), "rt_box_bool_new");
        assert_eq!(println_symbol(PrimKind::Double), "rt_println_double");
    }

    #[test]
    fn allocating_entries_are_flagged() {
        assert!(RuntimeFn::AllocObj.may_allocate());
        assert!(!RuntimeFn::PopRoots.may_allocate());
        assert!(ArrayOp::Slice.may_allocate());
        assert!(!ArrayOp::Len.may_allocate());
    }
}

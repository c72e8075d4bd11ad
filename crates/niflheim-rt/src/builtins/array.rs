//! Fixed-length arrays: one leaf flavor per primitive kind plus the
//! reference array.
//!
//! All flavors share the `[len: u64][elements...]` payload; only the element
//! width and the descriptor's reference topology differ. Slices copy; the
//! result is independent of later mutation of the source.

use std::os::raw::c_void;

use niflheim_abi::ABI_SCHEMA_VERSION;
use niflheim_abi::typedesc::{
    TYPE_FLAG_HAS_REFS, TYPE_FLAG_LEAF, TYPE_FLAG_VARIABLE_SIZE, type_ids,
};

use crate::alloc::alloc_obj;
use crate::builtins::expect_payload;
use crate::context::{self, RtContext};
use crate::object::{MarkFn, TypeDesc};
use crate::panic;
use crate::roots::ThreadState;

/// Element count of a validated array payload.
#[inline]
pub(crate) unsafe fn array_len(payload: *const u8) -> u64 {
    // SAFETY: every array payload starts with its length.
    unsafe { *payload.cast::<u64>() }
}

/// Element base of a validated array payload.
#[inline]
pub(crate) unsafe fn array_elems(payload: *mut u8) -> *mut u8 {
    // SAFETY: the elements follow the length word.
    unsafe { payload.add(8) }
}

/// Allocate an array object with `len` elements of `elem_width` bytes.
unsafe fn new_array(
    ctx: &mut RtContext,
    ts: *mut ThreadState,
    desc: &'static TypeDesc,
    len: u64,
    elem_width: u64,
    api: &str,
) -> *mut u8 {
    let payload_bytes = match len
        .checked_mul(elem_width)
        .and_then(|bytes| bytes.checked_add(8))
    {
        Some(total) => total,
        None => panic::fatal(&format!("{api}: array length overflow")),
    };
    // SAFETY: the descriptor is valid; ts is forwarded from the entry point.
    let obj = unsafe { alloc_obj(ctx, ts, desc, payload_bytes) };
    // SAFETY: the payload is zeroed and covers the length word.
    unsafe {
        *crate::object::payload(obj).cast::<u64>() = len;
    }
    obj
}

macro_rules! define_prim_array {
    (
        $ty:ty,
        $width:expr,
        $id:expr,
        $cname:expr,
        $type_sym:literal,
        $desc:ident,
        $new:ident,
        $len_fn:ident,
        $get:ident,
        $set:ident,
        $slice:ident,
        $api:literal
    ) => {
        /// Descriptor for this array flavor.
        #[unsafe(export_name = $type_sym)]
        pub static $desc: TypeDesc = TypeDesc {
            type_id: $id,
            flags: TYPE_FLAG_LEAF | TYPE_FLAG_VARIABLE_SIZE,
            schema_version: ABI_SCHEMA_VERSION,
            align: 8,
            size_bytes: 0,
            name: $cname.as_ptr().cast(),
            trace_fn: None,
            ref_offsets: std::ptr::null(),
            ref_offsets_len: 0,
        };

        /// Allocate a zero-filled array of `len` elements.
        ///
        /// # Safety
        /// `ts` must be the current thread state.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $new(ts: *mut ThreadState, len: u64) -> *mut u8 {
            if ts.is_null() {
                panic::fatal(concat!("rt_array_new_", $api, ": null thread state"));
            }
            context::with(concat!("rt_array_new_", $api), |ctx| {
                // SAFETY: forwarded caller contract.
                unsafe {
                    new_array(ctx, ts, &$desc, len, $width, concat!("rt_array_new_", $api))
                }
            })
        }

        /// Element count.
        ///
        /// # Safety
        /// `arr` must be null or a live managed object.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $len_fn(arr: *mut u8) -> u64 {
            // SAFETY: forwarded caller contract.
            let payload =
                unsafe { expect_payload(arr, &$desc, concat!("rt_array_len_", $api)) };
            // SAFETY: validated array payload.
            unsafe { array_len(payload) }
        }

        /// Bounds-checked element read.
        ///
        /// # Safety
        /// `arr` must be null or a live managed object.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $get(arr: *mut u8, i: u64) -> $ty {
            // SAFETY: forwarded caller contract.
            let payload =
                unsafe { expect_payload(arr, &$desc, concat!("rt_array_get_", $api)) };
            // SAFETY: validated array payload; the index check bounds the read.
            unsafe {
                if i >= array_len(payload) {
                    panic::fatal(concat!("rt_array_get_", $api, ": index out of bounds"));
                }
                *array_elems(payload).cast::<$ty>().add(i as usize)
            }
        }

        /// Bounds-checked element write.
        ///
        /// # Safety
        /// `arr` must be null or a live managed object.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $set(arr: *mut u8, i: u64, value: $ty) {
            // SAFETY: forwarded caller contract.
            let payload =
                unsafe { expect_payload(arr, &$desc, concat!("rt_array_set_", $api)) };
            // SAFETY: validated array payload; the index check bounds the write.
            unsafe {
                if i >= array_len(payload) {
                    panic::fatal(concat!("rt_array_set_", $api, ": index out of bounds"));
                }
                *array_elems(payload).cast::<$ty>().add(i as usize) = value;
            }
        }

        /// Copy `[start, end)` into a fresh, independent array.
        ///
        /// # Safety
        /// `ts` must be the current thread state; `arr` must be rooted by
        /// the caller (this entry allocates).
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $slice(
            ts: *mut ThreadState,
            arr: *mut u8,
            start: u64,
            end: u64,
        ) -> *mut u8 {
            // SAFETY: forwarded caller contract.
            let payload =
                unsafe { expect_payload(arr, &$desc, concat!("rt_array_slice_", $api)) };
            // SAFETY: validated array payload.
            let len = unsafe { array_len(payload) };
            if start > end || end > len {
                panic::fatal(concat!("rt_array_slice_", $api, ": invalid slice range"));
            }
            let n = end - start;
            context::with(concat!("rt_array_slice_", $api), |ctx| {
                // SAFETY: arr is caller-rooted, so the source survives the
                // allocation; the range check above bounds the copy.
                unsafe {
                    let out = new_array(
                        ctx,
                        ts,
                        &$desc,
                        n,
                        $width,
                        concat!("rt_array_slice_", $api),
                    );
                    let src = array_elems(payload).cast::<$ty>().add(start as usize);
                    let dst = array_elems(crate::object::payload(out)).cast::<$ty>();
                    std::ptr::copy_nonoverlapping(src, dst, n as usize);
                    out
                }
            })
        }
    };
}

define_prim_array!(
    i64, 8, type_ids::ARRAY_I64, c"ArrayI64", "rt_type_array_i64", TYPE_ARRAY_I64,
    rt_array_new_i64, rt_array_len_i64, rt_array_get_i64, rt_array_set_i64,
    rt_array_slice_i64, "i64"
);
define_prim_array!(
    u64, 8, type_ids::ARRAY_U64, c"ArrayU64", "rt_type_array_u64", TYPE_ARRAY_U64,
    rt_array_new_u64, rt_array_len_u64, rt_array_get_u64, rt_array_set_u64,
    rt_array_slice_u64, "u64"
);
define_prim_array!(
    u8, 1, type_ids::ARRAY_U8, c"ArrayU8", "rt_type_array_u8", TYPE_ARRAY_U8,
    rt_array_new_u8, rt_array_len_u8, rt_array_get_u8, rt_array_set_u8,
    rt_array_slice_u8, "u8"
);
define_prim_array!(
    bool, 1, type_ids::ARRAY_BOOL, c"ArrayBool", "rt_type_array_bool", TYPE_ARRAY_BOOL,
    rt_array_new_bool, rt_array_len_bool, rt_array_get_bool, rt_array_set_bool,
    rt_array_slice_bool, "bool"
);
define_prim_array!(
    f64, 8, type_ids::ARRAY_DOUBLE, c"ArrayDouble", "rt_type_array_double",
    TYPE_ARRAY_DOUBLE, rt_array_new_double, rt_array_len_double, rt_array_get_double,
    rt_array_set_double, rt_array_slice_double, "double"
);

/// Trace every reference slot in `[0, len)`.
///
/// # Safety
/// Called by the collector on validated `Obj[]` objects only.
unsafe extern "C" fn trace_ref_array(obj: *mut u8, mark: MarkFn, marker: *mut c_void) {
    // SAFETY: the collector only calls this on live Obj[] objects.
    unsafe {
        let payload = crate::object::payload(obj);
        let len = array_len(payload);
        let slots = array_elems(payload).cast::<*mut u8>();
        for i in 0..len as usize {
            mark(slots.add(i), marker);
        }
    }
}

/// Descriptor for `Obj[]`.
#[unsafe(export_name = "rt_type_array_ref")]
pub static TYPE_ARRAY_REF: TypeDesc = TypeDesc {
    type_id: type_ids::ARRAY_REF,
    flags: TYPE_FLAG_HAS_REFS | TYPE_FLAG_VARIABLE_SIZE,
    schema_version: ABI_SCHEMA_VERSION,
    align: 8,
    size_bytes: 0,
    name: c"ArrayRef".as_ptr().cast(),
    trace_fn: Some(trace_ref_array),
    ref_offsets: std::ptr::null(),
    ref_offsets_len: 0,
};

/// Allocate a null-filled reference array of `len` slots.
///
/// # Safety
/// `ts` must be the current thread state.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_array_new_ref(ts: *mut ThreadState, len: u64) -> *mut u8 {
    if ts.is_null() {
        panic::fatal("rt_array_new_ref: null thread state");
    }
    context::with("rt_array_new_ref", |ctx| {
        // SAFETY: forwarded caller contract.
        unsafe { new_array(ctx, ts, &TYPE_ARRAY_REF, len, 8, "rt_array_new_ref") }
    })
}

/// Slot count.
///
/// # Safety
/// `arr` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_array_len_ref(arr: *mut u8) -> u64 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(arr, &TYPE_ARRAY_REF, "rt_array_len_ref") };
    // SAFETY: validated array payload.
    unsafe { array_len(payload) }
}

/// Bounds-checked slot read; may return null.
///
/// # Safety
/// `arr` must be null or a live managed object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_array_get_ref(arr: *mut u8, i: u64) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(arr, &TYPE_ARRAY_REF, "rt_array_get_ref") };
    // SAFETY: validated array payload; the index check bounds the read.
    unsafe {
        if i >= array_len(payload) {
            panic::fatal("rt_array_get_ref: index out of bounds");
        }
        *array_elems(payload).cast::<*mut u8>().add(i as usize)
    }
}

/// Bounds-checked slot write; `value` may be null.
///
/// # Safety
/// `arr` must be null or a live managed object; `value` must be null or a
/// tracked object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_array_set_ref(arr: *mut u8, i: u64, value: *mut u8) {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(arr, &TYPE_ARRAY_REF, "rt_array_set_ref") };
    // SAFETY: validated array payload; the index check bounds the write.
    unsafe {
        if i >= array_len(payload) {
            panic::fatal("rt_array_set_ref: index out of bounds");
        }
        *array_elems(payload).cast::<*mut u8>().add(i as usize) = value;
    }
}

/// Copy `[start, end)` slots into a fresh reference array.
///
/// # Safety
/// `ts` must be the current thread state; `arr` must be rooted by the
/// caller (this entry allocates).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_array_slice_ref(
    ts: *mut ThreadState,
    arr: *mut u8,
    start: u64,
    end: u64,
) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    let payload = unsafe { expect_payload(arr, &TYPE_ARRAY_REF, "rt_array_slice_ref") };
    // SAFETY: validated array payload.
    let len = unsafe { array_len(payload) };
    if start > end || end > len {
        panic::fatal("rt_array_slice_ref: invalid slice range");
    }
    let n = end - start;
    context::with("rt_array_slice_ref", |ctx| {
        // SAFETY: arr is caller-rooted, so the source survives the
        // allocation; the range check above bounds the copy.
        unsafe {
            let out = new_array(ctx, ts, &TYPE_ARRAY_REF, n, 8, "rt_array_slice_ref");
            let src = array_elems(payload).cast::<*mut u8>().add(start as usize);
            let dst = array_elems(crate::object::payload(out)).cast::<*mut u8>();
            std::ptr::copy_nonoverlapping(src, dst, n as usize);
            out
        }
    })
}

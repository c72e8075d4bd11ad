//! `Box[K]` — a single boxed primitive. One leaf descriptor per kind.

use niflheim_abi::ABI_SCHEMA_VERSION;
use niflheim_abi::header::HEADER_SIZE;
use niflheim_abi::typedesc::{TYPE_FLAG_LEAF, type_ids};

use crate::alloc::alloc_obj;
use crate::builtins::expect_payload;
use crate::context;
use crate::object::TypeDesc;
use crate::panic;
use crate::roots::ThreadState;

/// Payload of every box: one 8-byte value slot.
const BOX_PAYLOAD: u64 = 8;

macro_rules! define_box {
    (
        $ty:ty,
        $id:expr,
        $cname:expr,
        $type_sym:literal,
        $desc:ident,
        $new:ident,
        $get:ident,
        $api:literal
    ) => {
        /// Descriptor for this box kind.
        #[unsafe(export_name = $type_sym)]
        pub static $desc: TypeDesc = TypeDesc {
            type_id: $id,
            flags: TYPE_FLAG_LEAF,
            schema_version: ABI_SCHEMA_VERSION,
            align: 8,
            size_bytes: HEADER_SIZE + BOX_PAYLOAD,
            name: $cname.as_ptr().cast(),
            trace_fn: None,
            ref_offsets: std::ptr::null(),
            ref_offsets_len: 0,
        };

        /// Allocate a box holding `value`.
        ///
        /// # Safety
        /// `ts` must be the current thread state.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $new(ts: *mut ThreadState, value: $ty) -> *mut u8 {
            if ts.is_null() {
                panic::fatal(concat!($api, "_new: null thread state"));
            }
            context::with(concat!($api, "_new"), |ctx| {
                // SAFETY: the descriptor is valid; ts is forwarded.
                let obj = unsafe { alloc_obj(ctx, ts, &$desc, BOX_PAYLOAD) };
                // SAFETY: the payload covers 8 zeroed bytes.
                unsafe {
                    *crate::object::payload(obj).cast::<$ty>() = value;
                }
                obj
            })
        }

        /// Read the boxed value.
        ///
        /// # Safety
        /// `obj` must be null or a live managed object.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $get(obj: *mut u8) -> $ty {
            // SAFETY: forwarded caller contract.
            let payload = unsafe { expect_payload(obj, &$desc, concat!($api, "_get")) };
            // SAFETY: validated box payload.
            unsafe { *payload.cast::<$ty>() }
        }
    };
}

define_box!(
    i64,
    type_ids::BOX_I64,
    c"BoxI64",
    "rt_type_box_i64",
    TYPE_BOX_I64,
    rt_box_i64_new,
    rt_box_i64_get,
    "rt_box_i64"
);
define_box!(
    u64,
    type_ids::BOX_U64,
    c"BoxU64",
    "rt_type_box_u64",
    TYPE_BOX_U64,
    rt_box_u64_new,
    rt_box_u64_get,
    "rt_box_u64"
);
define_box!(
    u8,
    type_ids::BOX_U8,
    c"BoxU8",
    "rt_type_box_u8",
    TYPE_BOX_U8,
    rt_box_u8_new,
    rt_box_u8_get,
    "rt_box_u8"
);
define_box!(
    bool,
    type_ids::BOX_BOOL,
    c"BoxBool",
    "rt_type_box_bool",
    TYPE_BOX_BOOL,
    rt_box_bool_new,
    rt_box_bool_get,
    "rt_box_bool"
);
define_box!(
    f64,
    type_ids::BOX_DOUBLE,
    c"BoxDouble",
    "rt_type_box_double",
    TYPE_BOX_DOUBLE,
    rt_box_double_new,
    rt_box_double_get,
    "rt_box_double"
);

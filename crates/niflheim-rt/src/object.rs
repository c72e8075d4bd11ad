//! Object header and type-descriptor layout.
//!
//! Both structs are `repr(C)` and asserted, field by field, against the
//! byte offsets in `niflheim-abi`; generated code accesses them by offset
//! with no knowledge of these Rust types.

use std::ffi::CStr;
use std::os::raw::c_void;

use niflheim_abi::header::{
    FLAG_MARKED, FLAG_PINNED, HEADER_FLAGS_OFFSET, HEADER_SIZE, HEADER_SIZE_OFFSET,
    HEADER_TYPE_OFFSET,
};
use niflheim_abi::typedesc::{
    TYPE_FLAG_HAS_REFS, TYPE_FLAG_LEAF, TYPE_FLAG_VARIABLE_SIZE, TYPEDESC_SIZE,
};

use crate::panic;

/// Mark callback handed to trace functions. `slot` is the address of a
/// reference slot inside the object being traced; the callback reads the
/// slot and treats its target like any other root.
pub type MarkFn = unsafe extern "C" fn(slot: *mut *mut u8, marker: *mut c_void);

/// Per-type trace function: calls `mark` on every outgoing reference slot
/// inside the object rooted at `obj`.
pub type TraceFn = unsafe extern "C" fn(obj: *mut u8, mark: MarkFn, marker: *mut c_void);

/// Header present at the base of every managed object.
#[repr(C)]
pub struct ObjHeader {
    /// Type descriptor. Never null for a tracked object, and never mutated
    /// after allocation.
    pub type_desc: *const TypeDesc,
    /// Total size in bytes, header included. For variable-size objects this
    /// is the sole source of truth for the footprint.
    pub size_bytes: u64,
    /// GC flag bits. `MARKED` belongs to the collector; all undefined bits
    /// must stay zero.
    pub flags: u32,
    /// Reserved, must be zero.
    pub reserved: u32,
}

const _: () = {
    assert!(std::mem::size_of::<ObjHeader>() == HEADER_SIZE as usize);
    assert!(std::mem::offset_of!(ObjHeader, type_desc) == HEADER_TYPE_OFFSET as usize);
    assert!(std::mem::offset_of!(ObjHeader, size_bytes) == HEADER_SIZE_OFFSET as usize);
    assert!(std::mem::offset_of!(ObjHeader, flags) == HEADER_FLAGS_OFFSET as usize);
};

impl ObjHeader {
    /// True when the collector reached this object in the current cycle.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags & FLAG_MARKED != 0
    }

    /// True when the object survives sweep regardless of reachability.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.flags & FLAG_PINNED != 0
    }
}

/// Immutable metadata describing an object's size, alignment, reference
/// topology, and debug identity. Usually lives in static storage; the
/// runtime exports one descriptor per built-in type, and the compiler emits
/// one per user class.
#[repr(C)]
pub struct TypeDesc {
    /// Unique per concrete type; equality is identity.
    pub type_id: u32,
    /// `HAS_REFS` / `VARIABLE_SIZE` / `LEAF` bits.
    pub flags: u32,
    /// ABI schema version the descriptor was built against.
    pub schema_version: u32,
    /// Required alignment, at least 8.
    pub align: u32,
    /// Fixed total size in bytes; 0 when `VARIABLE_SIZE`.
    pub size_bytes: u64,
    /// Optional NUL-terminated debug name.
    pub name: *const u8,
    /// Optional trace function. Wins over the offset table when both are
    /// present.
    pub trace_fn: Option<TraceFn>,
    /// Optional table of reference-slot offsets from the object base.
    pub ref_offsets: *const u64,
    /// Entry count of `ref_offsets`.
    pub ref_offsets_len: u64,
}

const _: () = assert!(std::mem::size_of::<TypeDesc>() == TYPEDESC_SIZE as usize);

// SAFETY: descriptors are immutable after construction; the raw pointers in
// them reference static data. The runtime is single-threaded, but statics
// require Sync regardless.
unsafe impl Sync for TypeDesc {}

impl TypeDesc {
    /// True when instances contain outgoing reference slots.
    #[inline]
    pub fn has_refs(&self) -> bool {
        self.flags & TYPE_FLAG_HAS_REFS != 0
    }

    /// True when tracing an instance is a no-op.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags & TYPE_FLAG_LEAF != 0
    }

    /// True when per-object size lives in the header.
    #[inline]
    pub fn is_variable_size(&self) -> bool {
        self.flags & TYPE_FLAG_VARIABLE_SIZE != 0
    }

    /// Debug name, or `"?"` when the descriptor carries none.
    pub fn debug_name(&self) -> &str {
        if self.name.is_null() {
            return "?";
        }
        // SAFETY: descriptors store NUL-terminated static strings.
        unsafe { CStr::from_ptr(self.name.cast()) }
            .to_str()
            .unwrap_or("?")
    }
}

/// Byte offset from an object base to its payload.
pub const PAYLOAD_OFFSET: usize = HEADER_SIZE as usize;

/// Payload pointer of an object.
///
/// # Safety
/// `obj` must point at a live managed object.
#[inline]
pub unsafe fn payload(obj: *mut u8) -> *mut u8 {
    // SAFETY: the payload begins immediately after the header.
    unsafe { obj.add(PAYLOAD_OFFSET) }
}

/// Checked downcast: null flows through unchanged, an exact type match
/// returns the object, anything else panics.
///
/// # Safety
/// `obj` must be null or point at a live managed object; `expected` must be
/// null or point at a valid descriptor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn rt_checked_cast(obj: *mut u8, expected: *const TypeDesc) -> *mut u8 {
    if obj.is_null() {
        return obj;
    }
    if expected.is_null() {
        panic::fatal("rt_checked_cast: null type descriptor");
    }
    // SAFETY: obj points at a live object per the caller contract.
    let header = unsafe { &*obj.cast::<ObjHeader>() };
    if header.type_desc.is_null() {
        panic::fatal("rt_checked_cast: object has no type descriptor");
    }
    // SAFETY: descriptors are valid for the life of the process.
    let (actual, wanted) = unsafe { (&*header.type_desc, &*expected) };
    if actual.type_id == wanted.type_id {
        obj
    } else {
        panic::bad_cast(actual, wanted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use niflheim_abi::ABI_SCHEMA_VERSION;
    use niflheim_abi::typedesc::TYPE_FLAG_LEAF;

    static LEAF_DESC: TypeDesc = TypeDesc {
        type_id: 0x9999,
        flags: TYPE_FLAG_LEAF,
        schema_version: ABI_SCHEMA_VERSION,
        align: 8,
        size_bytes: 32,
        name: c"TestLeaf".as_ptr().cast(),
        trace_fn: None,
        ref_offsets: std::ptr::null(),
        ref_offsets_len: 0,
    };

    #[test]
    fn debug_name_reads_nul_terminated() {
        assert_eq!(LEAF_DESC.debug_name(), "TestLeaf");
    }

    #[test]
    fn flag_accessors() {
        assert!(LEAF_DESC.is_leaf());
        assert!(!LEAF_DESC.has_refs());
        assert!(!LEAF_DESC.is_variable_size());
    }

    #[test]
    fn cast_of_null_is_null() {
        // SAFETY: null obj never dereferences anything.
        let out = unsafe { rt_checked_cast(std::ptr::null_mut(), &LEAF_DESC) };
        assert!(out.is_null());
    }

    #[test]
    fn cast_to_own_type_is_identity() {
        let mut header = ObjHeader {
            type_desc: &LEAF_DESC,
            size_bytes: 32,
            flags: 0,
            reserved: 0,
        };
        let obj = (&raw mut header).cast::<u8>();
        // SAFETY: obj points at a valid header for the duration of the call.
        let out = unsafe { rt_checked_cast(obj, &LEAF_DESC) };
        assert_eq!(out, obj);
    }
}

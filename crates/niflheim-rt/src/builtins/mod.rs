//! Built-in heap types.
//!
//! Each module keeps one layout family self-consistent: the payload layout,
//! the exported descriptor, and the accessors all agree, and the descriptor
//! is the only thing the collector ever consults.
//!
//! Payload layouts (offsets relative to the payload, which starts 24 bytes
//! past the object base):
//!
//! ```text
//! Str            [len: u64][bytes...]                      leaf, variable
//! i64[] etc.     [len: u64][elements...]                   leaf, variable
//! Obj[]          [len: u64][reference slots...]            has-refs, variable
//! Box[K]         [value: 8 bytes]                          leaf, fixed
//! Vec            [len: u64][storage: ref]                  has-refs, fixed
//! VecStorage     [capacity: u64][reference slots...]       has-refs, variable
//! StrBuf         [len: u64][storage: ref]                  has-refs, fixed
//! StrBufStorage  [capacity: u64][bytes...]                 leaf, variable
//! ```

pub mod array;
pub mod boxes;
pub mod io;
pub mod str;
pub mod strbuf;
pub mod vec;

use crate::object::{ObjHeader, TypeDesc, payload};
use crate::panic;

/// Validate a receiver and return its payload pointer.
///
/// Null receivers are a null dereference; a type-id mismatch is a
/// `<api>: object is not <Type>` panic.
///
/// # Safety
/// `obj` must be null or point at a live managed object.
pub(crate) unsafe fn expect_payload(obj: *mut u8, desc: &TypeDesc, api: &str) -> *mut u8 {
    if obj.is_null() {
        panic::fatal("null dereference");
    }
    // SAFETY: obj points at a live object per the caller contract.
    let header = unsafe { &*obj.cast::<ObjHeader>() };
    let matches = !header.type_desc.is_null()
        // SAFETY: descriptor pointers are valid for the process lifetime.
        && unsafe { (*header.type_desc).type_id } == desc.type_id;
    if !matches {
        panic::fatal(&format!("{api}: object is not {}", desc.debug_name()));
    }
    // SAFETY: obj is a live object.
    unsafe { payload(obj) }
}

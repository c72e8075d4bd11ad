//! Type-descriptor layout and well-known type ids.
//!
//! A type descriptor is an immutable 56-byte record, usually static:
//!
//! ```text
//! offset  size  field
//!      0     4  type id (unique per concrete type; equality = identity)
//!      4     4  flag bits (HAS_REFS / VARIABLE_SIZE / LEAF)
//!      8     4  ABI schema version
//!     12     4  required alignment (>= 8)
//!     16     8  fixed size in bytes (0 if VARIABLE_SIZE)
//!     24     8  debug name pointer (nullable, NUL-terminated)
//!     32     8  trace function pointer (nullable)
//!     40     8  pointer-offset table pointer (nullable, u64 entries)
//!     48     8  pointer-offset table length
//! ```
//!
//! Exactly one of the trace function or the offset table should drive
//! tracing; when both are present the trace function wins.

/// Total size of a type descriptor record.
pub const TYPEDESC_SIZE: u64 = 56;

/// Byte offset of the type id.
pub const TYPEDESC_ID_OFFSET: u64 = 0;
/// Byte offset of the flag word.
pub const TYPEDESC_FLAGS_OFFSET: u64 = 4;
/// Byte offset of the schema version.
pub const TYPEDESC_SCHEMA_OFFSET: u64 = 8;
/// Byte offset of the required alignment.
pub const TYPEDESC_ALIGN_OFFSET: u64 = 12;
/// Byte offset of the fixed size.
pub const TYPEDESC_SIZE_OFFSET: u64 = 16;
/// Byte offset of the debug-name pointer.
pub const TYPEDESC_NAME_OFFSET: u64 = 24;
/// Byte offset of the trace-function pointer.
pub const TYPEDESC_TRACE_OFFSET: u64 = 32;
/// Byte offset of the pointer-offset table pointer.
pub const TYPEDESC_OFFSETS_OFFSET: u64 = 40;
/// Byte offset of the pointer-offset table length.
pub const TYPEDESC_OFFSETS_LEN_OFFSET: u64 = 48;

/// Descriptor flag: the object contains outgoing reference slots.
pub const TYPE_FLAG_HAS_REFS: u32 = 1 << 0;

/// Descriptor flag: per-object size lives in the header, not the descriptor.
pub const TYPE_FLAG_VARIABLE_SIZE: u32 = 1 << 1;

/// Descriptor flag: the object holds no references; tracing is a no-op.
pub const TYPE_FLAG_LEAF: u32 = 1 << 2;

/// Well-known type ids for the built-in descriptors the runtime ships.
///
/// The front end numbers user classes from [`USER_TYPE_ID_BASE`]; ids below
/// that are reserved for the runtime.
pub mod type_ids {
    /// `Str` — immutable byte string.
    pub const STR: u32 = 1;
    /// `StrBuf` — growable string builder.
    pub const STRBUF: u32 = 2;
    /// Backing storage of a `StrBuf`.
    pub const STRBUF_STORAGE: u32 = 3;
    /// `Vec` — growable vector of references.
    pub const VEC: u32 = 4;
    /// Backing storage of a `Vec`.
    pub const VEC_STORAGE: u32 = 5;

    /// `Box[i64]`.
    pub const BOX_I64: u32 = 16;
    /// `Box[u64]`.
    pub const BOX_U64: u32 = 17;
    /// `Box[u8]`.
    pub const BOX_U8: u32 = 18;
    /// `Box[bool]`.
    pub const BOX_BOOL: u32 = 19;
    /// `Box[double]`.
    pub const BOX_DOUBLE: u32 = 20;

    /// `i64[]`.
    pub const ARRAY_I64: u32 = 32;
    /// `u64[]`.
    pub const ARRAY_U64: u32 = 33;
    /// `u8[]`.
    pub const ARRAY_U8: u32 = 34;
    /// `bool[]`.
    pub const ARRAY_BOOL: u32 = 35;
    /// `double[]`.
    pub const ARRAY_DOUBLE: u32 = 36;
    /// `Obj[]` — array of references.
    pub const ARRAY_REF: u32 = 37;
}

/// First type id available to compiler-synthesized user-class descriptors.
pub const USER_TYPE_ID_BASE: u32 = 0x1000;

//! # Niflheim ABI
//!
//! The compiler↔runtime contract for the Niflheim language, expressed as
//! data. Generated x86-64 code and the managed runtime never share Rust
//! types: they agree on byte offsets, flag bits, and linker symbols, and
//! this crate is the single source of truth for all three.
//!
//! ## Consumers
//!
//! ```text
//! niflheim-codegen (emits .quad/.long records and [reg+offset] accesses)
//!        ↓ offsets, symbols
//!   niflheim-abi
//!        ↑ compile-time layout assertions
//! niflheim-rt (repr(C) structs, extern "C" entry points)
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod entry;
pub mod header;
pub mod prim;
pub mod typedesc;

pub use entry::RuntimeFn;
pub use prim::PrimKind;

/// Version of the object/descriptor ABI described by this crate.
///
/// Stamped into every type descriptor's `schema_version` field. The runtime
/// refuses to trace a descriptor carrying a different version.
pub const ABI_SCHEMA_VERSION: u32 = 1;

//! # Niflheim Runtime
//!
//! The managed runtime linked into every compiled Niflheim program:
//! allocation, a stop-the-world mark-sweep collector, the shadow-stack root
//! protocol, and the built-in heap types.
//!
//! ## Design
//!
//! - **Exact roots**: generated code maintains a linked stack of root frames
//!   parallel to the native call stack; the collector consumes those frames
//!   plus a registry of global root slots. No conservative scanning.
//! - **Non-moving**: objects never move; the tracked-object set is a hash
//!   set keyed by object address, so slot validation during marking is exact
//!   and O(1).
//! - **Safepoints**: the collector only runs inside runtime entry points, on
//!   the one mutator thread. No locks are needed around root-frame slots.
//! - **Terminal failures**: every in-language error routes through the
//!   `rt_panic` family, which prints a diagnostic and aborts. There is no
//!   unwinding.
//!
//! The `extern "C"` surface lives next to the code it exposes; the symbol
//! names are defined once in `niflheim-abi` and consumed by the code
//! generator.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod alloc;
pub mod builtins;
pub mod collect;
pub mod context;
pub mod object;
pub mod panic;
pub mod roots;

pub use context::{GcConfig, RtContext, RtGcStats};
pub use object::{MarkFn, ObjHeader, TraceFn, TypeDesc};
pub use roots::{RootFrame, ThreadState, TraceFrame};

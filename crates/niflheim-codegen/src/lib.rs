//! # Niflheim Codegen
//!
//! Lowers the typed program representation handed over by the type checker
//! into SysV x86-64 Intel-syntax assembly that cooperates with the managed
//! runtime: a shadow-stack root frame per activation, every live reference
//! spilled to a root slot before every safepoint, and every in-language
//! failure routed through the runtime panic family.
//!
//! ## Pipeline
//!
//! ```text
//! typed IR (ir)
//!     │  index/slice sugar → get/set/slice method calls (lower)
//!     ▼
//! frame layout (frame)  ──  root slots, prim slots, staging depth
//!     ▼
//! emission (emit)  ──  prologue/epilogue, spills, runtime calls (asm, abi)
//! ```
//!
//! The emitter is deliberately conservative: every runtime call is treated
//! as a safepoint and every reference temporary lives in a root slot across
//! it. A later pass may prove callees non-allocating and elide spills; the
//! discipline here is the correctness baseline.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod abi;
pub mod asm;
pub mod emit;
pub mod error;
pub mod frame;
pub mod ir;
pub mod lower;

pub use emit::{CodegenOptions, emit_program};
pub use error::CodegenError;

//! Emitter errors.
//!
//! The type checker runs before codegen, so most of these indicate a broken
//! front end rather than a user mistake; they are still structured errors so
//! the driver can report them instead of emitting garbage assembly.

/// Errors produced while lowering a program to assembly.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// SysV register passing is the only supported convention; stack
    /// arguments are out of scope for the stage-0 emitter.
    #[error("function '{func}': call passes {count} integer/pointer arguments (max {max})")]
    TooManyIntArgs {
        /// Function containing the call.
        func: String,
        /// Integer/pointer arguments requested.
        count: usize,
        /// Hard limit.
        max: usize,
    },

    /// Float-register overflow, same scope limit as integer arguments.
    #[error("function '{func}': call passes {count} float arguments (max {max})")]
    TooManyFloatArgs {
        /// Function containing the call.
        func: String,
        /// Float arguments requested.
        count: usize,
        /// Hard limit.
        max: usize,
    },

    /// Method routing found no runtime entry for the receiver/method pair.
    #[error("no method '{method}' on receiver type {recv}")]
    UnknownMethod {
        /// Receiver type name.
        recv: String,
        /// Requested method.
        method: String,
    },

    /// Method called with the wrong number of arguments.
    #[error("method '{method}' on {recv} takes {expected} arguments, got {got}")]
    MethodArity {
        /// Receiver type name.
        recv: String,
        /// Requested method.
        method: String,
        /// Arity of the runtime entry.
        expected: usize,
        /// Arguments supplied.
        got: usize,
    },

    /// An id in the IR points outside the program's tables.
    #[error("{kind} id {id} out of range in function '{func}'")]
    BadId {
        /// What table the id indexes (local, class, func, global, field).
        kind: &'static str,
        /// The offending id.
        id: usize,
        /// Function containing the reference.
        func: String,
    },

    /// Constructor initializer count does not match the class field count.
    #[error("class '{class}' has {fields} fields but constructor supplies {inits} initializers")]
    BadInitCount {
        /// Class name.
        class: String,
        /// Declared fields.
        fields: usize,
        /// Supplied initializers.
        inits: usize,
    },

    /// An operation was asked of a type that cannot perform it (e.g. a
    /// binary op on references).
    #[error("function '{func}': {what}")]
    Unsupported {
        /// Function containing the construct.
        func: String,
        /// Description of the rejected construct.
        what: String,
    },
}

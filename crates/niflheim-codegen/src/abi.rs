//! SysV x86-64 calling convention.
//!
//! Integer/pointer arguments in `{RDI, RSI, RDX, RCX, R8, R9}`, floats in
//! `{XMM0..XMM7}`, integer/pointer return in `RAX`, float return in `XMM0`,
//! callee-saved `{RBX, RBP, R12..R15}`, and the stack 16-byte aligned at
//! every `call`. The stage-0 emitter passes everything in registers; calls
//! needing stack arguments are rejected up front.

use crate::asm::Reg;
use crate::error::CodegenError;
use crate::ir::Ty;

/// Integer/pointer argument registers, in order.
pub const INT_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Maximum register-passed integer/pointer arguments.
pub const MAX_INT_ARGS: usize = INT_ARG_REGS.len();

/// Maximum register-passed float arguments (`xmm0..xmm7`).
pub const MAX_FLOAT_ARGS: usize = 8;

/// Callee-saved registers the emitter must preserve when it uses them.
pub const CALLEE_SAVED: [Reg; 6] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Where one argument travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSlot {
    /// `INT_ARG_REGS[n]`.
    Int(usize),
    /// `xmm<n>`.
    Float(usize),
}

/// Assign argument slots in declaration order. `leading_int` reserves the
/// first integer registers (the thread-state argument of runtime entries).
pub fn classify_args(
    func_name: &str,
    leading_int: usize,
    args: &[Ty],
) -> Result<Vec<ArgSlot>, CodegenError> {
    let mut int_idx = leading_int;
    let mut float_idx = 0usize;
    let mut slots = Vec::with_capacity(args.len());
    for ty in args {
        if ty.is_float() {
            slots.push(ArgSlot::Float(float_idx));
            float_idx += 1;
        } else {
            slots.push(ArgSlot::Int(int_idx));
            int_idx += 1;
        }
    }
    if int_idx > MAX_INT_ARGS {
        return Err(CodegenError::TooManyIntArgs {
            func: func_name.to_owned(),
            count: int_idx,
            max: MAX_INT_ARGS,
        });
    }
    if float_idx > MAX_FLOAT_ARGS {
        return Err(CodegenError::TooManyFloatArgs {
            func: func_name.to_owned(),
            count: float_idx,
            max: MAX_FLOAT_ARGS,
        });
    }
    Ok(slots)
}

/// Round a raw frame size up so `sub rsp, N` keeps 16-byte alignment
/// (entry sequence: return address + pushed `rbp` leave `rsp` 16-aligned).
pub const fn align_frame(raw: u64) -> u64 {
    raw.div_ceil(16) * 16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RefTy;
    use niflheim_abi::PrimKind;

    #[test]
    fn ints_and_floats_use_separate_queues() {
        let args = [
            Ty::Prim(PrimKind::I64),
            Ty::Prim(PrimKind::Double),
            Ty::Ref(RefTy::Str),
            Ty::Prim(PrimKind::Double),
        ];
        let slots = classify_args("f", 0, &args).unwrap();
        assert_eq!(
            slots,
            vec![
                ArgSlot::Int(0),
                ArgSlot::Float(0),
                ArgSlot::Int(1),
                ArgSlot::Float(1)
            ]
        );
    }

    #[test]
    fn thread_state_reserves_rdi() {
        let args = [Ty::Ref(RefTy::Vec), Ty::Ref(RefTy::Obj)];
        let slots = classify_args("f", 1, &args).unwrap();
        assert_eq!(slots, vec![ArgSlot::Int(1), ArgSlot::Int(2)]);
    }

    #[test]
    fn seventh_integer_argument_is_rejected() {
        let args = vec![Ty::Prim(PrimKind::I64); 7];
        let err = classify_args("f", 0, &args).unwrap_err();
        assert!(matches!(err, CodegenError::TooManyIntArgs { count: 7, .. }));
    }

    #[test]
    fn frame_alignment() {
        assert_eq!(align_frame(0), 0);
        assert_eq!(align_frame(1), 16);
        assert_eq!(align_frame(40), 48);
        assert_eq!(align_frame(64), 64);
    }
}

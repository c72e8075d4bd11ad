//! Activation-frame layout.
//!
//! Every function gets an `rbp`-anchored frame holding, from shallow to
//! deep:
//!
//! ```text
//! [rbp- 8]   saved rbx (thread-state register)
//! [rbp-16]   return-value scratch (survives rt_pop_roots)
//! [rbp-40]   root-frame descriptor (prev / slot_count / slots, 24 bytes)
//! [rbp-40-8n]  root slot array: n = named ref locals + staging positions
//! ...        prim local slots, 8 bytes each
//! ...        prim staging slots, 8 bytes each
//! ...        diagnostic trace frame (32 bytes, optional)
//! ```
//!
//! Reference locals and staged reference temporaries live in root slots;
//! primitives live in the prim areas and never enter the collector's view.
//! The total is rounded to 16 so `sub rsp, N` preserves call alignment.

use crate::abi::align_frame;
use crate::error::CodegenError;
use crate::ir::{Expr, FuncDef, Stmt};

/// Where a local lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalHome {
    /// Root slot index within the frame's slot array.
    RootSlot(usize),
    /// `rbp`-relative displacement of an 8-byte primitive slot.
    PrimSlot(u64),
}

/// Computed frame layout for one function.
#[derive(Debug)]
pub struct FrameLayout {
    /// Home of every local, parallel to `FuncDef::locals`.
    pub local_home: Vec<LocalHome>,
    /// Root slots holding named reference locals (indices `0..named`).
    pub named_ref_slots: usize,
    /// Maximum simultaneous staging positions in the body.
    pub stage_depth: usize,
    /// Total root slots: named reference locals plus staging positions.
    pub root_slot_count: usize,
    /// Whether the function needs the thread-state register at all.
    pub needs_ts: bool,
    /// `sub rsp, N` amount, 16-byte aligned.
    pub frame_size: u64,
}

/// Displacement of the saved-rbx slot.
pub const RBX_SAVE_DISP: u64 = 8;
/// Displacement of the return-value scratch slot.
pub const SCRATCH_DISP: u64 = 16;
/// Displacement of the root-frame descriptor base.
pub const DESC_DISP: u64 = 40;

impl FrameLayout {
    /// Displacement of root slot `i`'s storage.
    pub fn root_slot_disp(&self, slot: usize) -> u64 {
        debug_assert!(slot < self.root_slot_count);
        DESC_DISP + 8 * (self.root_slot_count - slot) as u64
    }

    /// Displacement of the root slot array base (slot 0), for `lea`.
    pub fn slots_array_disp(&self) -> u64 {
        DESC_DISP + 8 * self.root_slot_count as u64
    }

    /// Root slot index of staging position `pos`.
    pub fn stage_root_slot(&self, pos: usize) -> usize {
        debug_assert!(pos < self.stage_depth);
        self.named_ref_slots + pos
    }

    /// Displacement of primitive staging position `pos`.
    pub fn prim_stage_disp(&self, pos: usize) -> u64 {
        debug_assert!(pos < self.stage_depth);
        self.prim_base() + 8 * (self.local_home.len() + pos) as u64
    }

    /// Displacement of local `k`'s 8-byte mirror slot. Primitive locals
    /// live here; reference locals only park here during the prologue,
    /// before the root frame exists.
    pub fn local_mirror_disp(&self, local: usize) -> u64 {
        debug_assert!(local < self.local_home.len());
        self.prim_base() + 8 * local as u64
    }

    /// Displacement of the trace frame base (32 bytes), shared by all
    /// functions that emit one.
    pub fn trace_frame_disp(&self) -> u64 {
        self.prim_base() + 8 * (self.local_home.len() + self.stage_depth) as u64 + 24
    }

    fn prim_base(&self) -> u64 {
        // First 8-byte slot below the root slot array.
        DESC_DISP + 8 * self.root_slot_count as u64 + 8
    }

    /// Compute the layout for `func`. `with_trace_frame` reserves space for
    /// the diagnostic trace frame.
    pub fn compute(func: &FuncDef, with_trace_frame: bool) -> Result<Self, CodegenError> {
        let stage_depth = body_stage_depth(&func.body);

        let named_ref_slots = func.locals.iter().filter(|l| l.ty.is_ref()).count();
        let root_slot_count = named_ref_slots + stage_depth;

        // rbx save + scratch + descriptor + root slots + one mirror slot
        // per local + prim staging (+ trace frame).
        let mut raw = 16 + 24 + 8 * (root_slot_count + func.locals.len() + stage_depth) as u64;
        if with_trace_frame {
            raw += 32;
        }

        let mut layout = FrameLayout {
            local_home: Vec::with_capacity(func.locals.len()),
            named_ref_slots,
            stage_depth,
            root_slot_count,
            needs_ts: root_slot_count > 0 || with_trace_frame || body_uses_ts(&func.body),
            frame_size: align_frame(raw),
        };

        let prim_base = DESC_DISP + 8 * root_slot_count as u64 + 8;
        let mut next_ref = 0usize;
        for (k, local) in func.locals.iter().enumerate() {
            if local.ty.is_ref() {
                layout.local_home.push(LocalHome::RootSlot(next_ref));
                next_ref += 1;
            } else {
                layout.local_home.push(LocalHome::PrimSlot(prim_base + 8 * k as u64));
            }
        }
        Ok(layout)
    }
}

/// Maximum simultaneous staging positions needed by a statement list.
fn body_stage_depth(body: &[Stmt]) -> usize {
    body.iter().map(stmt_stage_depth).max().unwrap_or(0)
}

fn stmt_stage_depth(stmt: &Stmt) -> usize {
    match stmt {
        Stmt::Assign(_, expr)
        | Stmt::AssignGlobal(_, expr)
        | Stmt::Expr(expr)
        | Stmt::Println(expr) => expr_stage_depth(expr),
        Stmt::Return(expr) => expr.as_ref().map(expr_stage_depth).unwrap_or(0),
        Stmt::SetField { obj, value, .. } => expr_stage_depth(obj)
            .max(1 + expr_stage_depth(value))
            .max(1),
        Stmt::IndexAssign {
            recv,
            index,
            value,
            ..
        } => call_stage_depth([recv, index, value].into_iter()),
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => expr_stage_depth(cond)
            .max(body_stage_depth(then_body))
            .max(body_stage_depth(else_body)),
        Stmt::While { cond, body } => expr_stage_depth(cond).max(body_stage_depth(body)),
    }
}

/// Staging depth of a call-shaped node: operands are evaluated left to
/// right, each staged before the next starts, so position `i` sees `i`
/// already-staged values plus whatever operand `i` needs internally.
fn call_stage_depth<'a>(operands: impl Iterator<Item = &'a Expr>) -> usize {
    let mut depth = 0usize;
    let mut staged = 0usize;
    for operand in operands {
        depth = depth.max(staged + expr_stage_depth(operand));
        staged += 1;
    }
    depth.max(staged)
}

fn expr_stage_depth(expr: &Expr) -> usize {
    match expr {
        Expr::I64(_)
        | Expr::U64(_)
        | Expr::U8(_)
        | Expr::Bool(_)
        | Expr::Double(_)
        | Expr::StrLit(_)
        | Expr::NullRef
        | Expr::Local(_)
        | Expr::Global(_)
        | Expr::NewVec
        | Expr::NewStrBuf => 0,
        Expr::Unary(_, inner) => expr_stage_depth(inner),
        Expr::Binary(_, lhs, rhs) => expr_stage_depth(lhs).max(1 + expr_stage_depth(rhs)),
        Expr::GetField { obj, .. } => expr_stage_depth(obj),
        Expr::Cast { obj, .. } => expr_stage_depth(obj),
        Expr::NewBox { value, .. } => expr_stage_depth(value).max(1),
        Expr::NewArray { len, .. } => expr_stage_depth(len).max(1),
        // The fresh object is rooted at position 0 while each initializer
        // evaluates.
        Expr::New { inits, .. } => {
            let per_init = inits
                .iter()
                .map(|init| 1 + expr_stage_depth(init))
                .max()
                .unwrap_or(1);
            per_init.max(1)
        }
        Expr::Call { args, .. } => call_stage_depth(args.iter()),
        Expr::MethodCall { recv, args, .. } => {
            call_stage_depth(std::iter::once(recv.as_ref()).chain(args.iter()))
        }
        Expr::Index { recv, index, .. } => {
            call_stage_depth([recv.as_ref(), index.as_ref()].into_iter())
        }
        Expr::Slice {
            recv, start, end, ..
        } => call_stage_depth([recv.as_ref(), start.as_ref(), end.as_ref()].into_iter()),
    }
}

fn body_uses_ts(body: &[Stmt]) -> bool {
    fn expr_uses_ts(expr: &Expr) -> bool {
        match expr {
            Expr::StrLit(_)
            | Expr::New { .. }
            | Expr::NewBox { .. }
            | Expr::NewArray { .. }
            | Expr::NewVec
            | Expr::NewStrBuf
            | Expr::Slice { .. } => true,
            Expr::MethodCall { recv, args, .. } => {
                // Conservative: some methods (push, slice, concat) take the
                // thread state; checking the routed signature here would
                // need the program, so any method call claims it.
                let _ = (recv, args);
                true
            }
            Expr::Index { recv, index, .. } => expr_uses_ts(recv) || expr_uses_ts(index),
            Expr::Unary(_, inner) => expr_uses_ts(inner),
            Expr::Binary(_, lhs, rhs) => expr_uses_ts(lhs) || expr_uses_ts(rhs),
            Expr::GetField { obj, .. } => expr_uses_ts(obj),
            Expr::Cast { obj, .. } => expr_uses_ts(obj),
            Expr::Call { args, .. } => args.iter().any(expr_uses_ts),
            Expr::I64(_)
            | Expr::U64(_)
            | Expr::U8(_)
            | Expr::Bool(_)
            | Expr::Double(_)
            | Expr::NullRef
            | Expr::Local(_)
            | Expr::Global(_) => false,
        }
    }
    fn stmt_uses_ts(stmt: &Stmt) -> bool {
        match stmt {
            Stmt::Assign(_, e) | Stmt::AssignGlobal(_, e) | Stmt::Expr(e) | Stmt::Println(e) => {
                expr_uses_ts(e)
            }
            Stmt::Return(e) => e.as_ref().is_some_and(expr_uses_ts),
            Stmt::SetField { obj, value, .. } => expr_uses_ts(obj) || expr_uses_ts(value),
            Stmt::IndexAssign {
                recv,
                index,
                value,
                ..
            } => expr_uses_ts(recv) || expr_uses_ts(index) || expr_uses_ts(value),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => expr_uses_ts(cond) || then_body.iter().any(stmt_uses_ts) || else_body.iter().any(stmt_uses_ts),
            Stmt::While { cond, body } => expr_uses_ts(cond) || body.iter().any(stmt_uses_ts),
        }
    }
    body.iter().any(stmt_uses_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{LocalDef, RefTy, Ty};
    use niflheim_abi::PrimKind;

    fn func_with(locals: Vec<LocalDef>, body: Vec<Stmt>) -> FuncDef {
        FuncDef {
            name: "f".into(),
            locals,
            param_count: 0,
            ret: Ty::Unit,
            body,
            src: None,
        }
    }

    #[test]
    fn ref_locals_get_root_slots_prims_get_stack() {
        let func = func_with(
            vec![
                LocalDef {
                    name: "n".into(),
                    ty: Ty::Prim(PrimKind::I64),
                },
                LocalDef {
                    name: "s".into(),
                    ty: Ty::Ref(RefTy::Str),
                },
            ],
            vec![],
        );
        let layout = FrameLayout::compute(&func, false).unwrap();
        assert_eq!(layout.local_home[1], LocalHome::RootSlot(0));
        assert!(matches!(layout.local_home[0], LocalHome::PrimSlot(_)));
        assert_eq!(layout.root_slot_count, 1);
    }

    #[test]
    fn frame_size_is_16_aligned() {
        let func = func_with(
            vec![LocalDef {
                name: "s".into(),
                ty: Ty::Ref(RefTy::Str),
            }],
            vec![Stmt::Assign(0, Expr::StrLit("x".into()))],
        );
        let layout = FrameLayout::compute(&func, false).unwrap();
        assert_eq!(layout.frame_size % 16, 0);
        assert!(layout.needs_ts);
    }

    #[test]
    fn call_arguments_stage_left_to_right() {
        // f(g(a), b) needs one staged value while the second argument
        // evaluates, two once both are staged.
        let inner = Expr::Call {
            func: 0,
            args: vec![Expr::I64(1)],
        };
        let expr = Expr::Call {
            func: 0,
            args: vec![inner, Expr::I64(2)],
        };
        assert_eq!(expr_stage_depth(&expr), 2);
    }

    #[test]
    fn nested_call_inside_second_arg_stacks_depth() {
        // f(a, g(h(x))) → arg 1 staged while g(h(x)) runs, and g's own
        // argument stages below it.
        let h = Expr::Call {
            func: 0,
            args: vec![Expr::I64(1)],
        };
        let g = Expr::Call {
            func: 0,
            args: vec![h],
        };
        let f = Expr::Call {
            func: 0,
            args: vec![Expr::I64(0), g],
        };
        assert_eq!(expr_stage_depth(&f), 2);
    }

    #[test]
    fn constructor_roots_the_fresh_object() {
        let expr = Expr::New {
            class: 0,
            inits: vec![Expr::I64(1)],
        };
        assert_eq!(expr_stage_depth(&expr), 1);
    }

    #[test]
    fn root_slot_displacements_do_not_collide() {
        let func = func_with(
            vec![
                LocalDef {
                    name: "a".into(),
                    ty: Ty::Ref(RefTy::Str),
                },
                LocalDef {
                    name: "b".into(),
                    ty: Ty::Ref(RefTy::Str),
                },
            ],
            vec![],
        );
        let layout = FrameLayout::compute(&func, false).unwrap();
        let d0 = layout.root_slot_disp(0);
        let d1 = layout.root_slot_disp(1);
        assert_ne!(d0, d1);
        assert!(d0 > DESC_DISP && d1 > DESC_DISP);
        assert!(layout.frame_size >= layout.slots_array_disp());
    }
}

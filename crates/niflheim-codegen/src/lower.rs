//! Method-canonical routing.
//!
//! Index and slice sugar on a typed receiver canonicalizes to `get` /
//! `set` / `slice` method calls with `i64` parameters; this module routes
//! every built-in method call to its runtime entry point by receiver
//! category and method signature, never by hard-coded source type names.

use niflheim_abi::PrimKind;
use niflheim_abi::entry::{ArrayOp, ElemKind, RuntimeFn, array_symbol};

use crate::error::CodegenError;
use crate::ir::{Program, RefTy, Ty};

/// A routed built-in call: the symbol to emit and enough signature
/// information to marshal it.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinCall {
    /// Linker symbol of the runtime entry.
    pub symbol: String,
    /// Whether the entry takes the thread state as its first argument.
    pub takes_ts: bool,
    /// Whether the entry can allocate (and therefore collect).
    pub may_allocate: bool,
    /// Argument count, receiver and thread state excluded.
    pub arity: usize,
    /// Result type.
    pub ret: Ty,
}

impl BuiltinCall {
    fn fixed(f: RuntimeFn, arity: usize, ret: Ty) -> Self {
        Self {
            symbol: f.symbol().to_owned(),
            takes_ts: matches!(
                f,
                RuntimeFn::StrSlice
                    | RuntimeFn::StrConcat
                    | RuntimeFn::StrBufPushU8
                    | RuntimeFn::StrBufPushStr
                    | RuntimeFn::StrBufToStr
                    | RuntimeFn::VecPush
            ),
            may_allocate: f.may_allocate(),
            arity,
            ret,
        }
    }

    fn array(op: ArrayOp, elem: ElemKind, arity: usize, ret: Ty) -> Self {
        Self {
            symbol: array_symbol(op, elem),
            takes_ts: matches!(op, ArrayOp::New | ArrayOp::Slice),
            may_allocate: op.may_allocate(),
            arity,
            ret,
        }
    }
}

/// Element type as seen by the language: primitive arrays yield their
/// primitive, reference arrays yield `Obj`.
fn elem_value_ty(elem: ElemKind) -> Ty {
    match elem {
        ElemKind::Prim(kind) => Ty::Prim(kind),
        ElemKind::Ref => Ty::Ref(RefTy::Obj),
    }
}

/// Route a method on a built-in receiver to its runtime entry.
pub fn route_method(
    program: &Program,
    recv: &RefTy,
    method: &str,
) -> Result<BuiltinCall, CodegenError> {
    let unknown = || CodegenError::UnknownMethod {
        recv: recv.display_name(program),
        method: method.to_owned(),
    };
    Ok(match (recv, method) {
        (RefTy::Array(elem), "get") => {
            BuiltinCall::array(ArrayOp::Get, *elem, 1, elem_value_ty(*elem))
        }
        (RefTy::Array(elem), "set") => BuiltinCall::array(ArrayOp::Set, *elem, 2, Ty::Unit),
        (RefTy::Array(elem), "slice") => {
            BuiltinCall::array(ArrayOp::Slice, *elem, 2, Ty::Ref(RefTy::Array(*elem)))
        }
        (RefTy::Array(elem), "len") => {
            BuiltinCall::array(ArrayOp::Len, *elem, 0, Ty::Prim(PrimKind::I64))
        }

        (RefTy::Str, "len") => {
            BuiltinCall::fixed(RuntimeFn::StrLen, 0, Ty::Prim(PrimKind::I64))
        }
        (RefTy::Str, "get") => {
            BuiltinCall::fixed(RuntimeFn::StrGetU8, 1, Ty::Prim(PrimKind::U8))
        }
        (RefTy::Str, "slice") => BuiltinCall::fixed(RuntimeFn::StrSlice, 2, Ty::Ref(RefTy::Str)),
        (RefTy::Str, "concat") => {
            BuiltinCall::fixed(RuntimeFn::StrConcat, 1, Ty::Ref(RefTy::Str))
        }
        (RefTy::Str, "eq") => BuiltinCall::fixed(RuntimeFn::StrEq, 1, Ty::Prim(PrimKind::Bool)),

        (RefTy::StrBuf, "len") => {
            BuiltinCall::fixed(RuntimeFn::StrBufLen, 0, Ty::Prim(PrimKind::I64))
        }
        (RefTy::StrBuf, "push_u8") => BuiltinCall::fixed(RuntimeFn::StrBufPushU8, 1, Ty::Unit),
        (RefTy::StrBuf, "push_str") => BuiltinCall::fixed(RuntimeFn::StrBufPushStr, 1, Ty::Unit),
        (RefTy::StrBuf, "to_str") => {
            BuiltinCall::fixed(RuntimeFn::StrBufToStr, 0, Ty::Ref(RefTy::Str))
        }

        (RefTy::Vec, "len") => BuiltinCall::fixed(RuntimeFn::VecLen, 0, Ty::Prim(PrimKind::I64)),
        (RefTy::Vec, "push") => BuiltinCall::fixed(RuntimeFn::VecPush, 1, Ty::Unit),
        (RefTy::Vec, "get") => BuiltinCall::fixed(RuntimeFn::VecGet, 1, Ty::Ref(RefTy::Obj)),
        (RefTy::Vec, "set") => BuiltinCall::fixed(RuntimeFn::VecSet, 2, Ty::Unit),

        (RefTy::Box(kind), "get") => BuiltinCall {
            symbol: niflheim_abi::entry::box_symbol(*kind, "get"),
            takes_ts: false,
            may_allocate: false,
            arity: 0,
            ret: Ty::Prim(*kind),
        },

        _ => return Err(unknown()),
    })
}

/// Descriptor symbol a cast target resolves to: runtime-exported for
/// built-ins, compiler-emitted for user classes. `Obj` has no descriptor;
/// upcasts are identity and emit no check.
pub fn type_descriptor_symbol(program: &Program, ty: &RefTy) -> Option<String> {
    match ty {
        RefTy::Str => Some("rt_type_str".into()),
        RefTy::StrBuf => Some("rt_type_strbuf".into()),
        RefTy::Vec => Some("rt_type_vec".into()),
        RefTy::Box(kind) => Some(format!("rt_type_box_{}", kind.suffix())),
        RefTy::Array(elem) => Some(format!("rt_type_array_{}", elem.suffix())),
        RefTy::Class(id) => program
            .classes
            .get(*id)
            .map(|class| format!("nfl_type_{}", class.name)),
        RefTy::Obj => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Program;

    #[test]
    fn index_sugar_routes_by_element_category() {
        let program = Program::default();
        let get_i64 = route_method(&program, &RefTy::Array(ElemKind::Prim(PrimKind::I64)), "get")
            .unwrap();
        assert_eq!(get_i64.symbol, "rt_array_get_i64");
        assert!(!get_i64.takes_ts);
        assert_eq!(get_i64.ret, Ty::Prim(PrimKind::I64));

        let get_ref = route_method(&program, &RefTy::Array(ElemKind::Ref), "get").unwrap();
        assert_eq!(get_ref.symbol, "rt_array_get_ref");
        assert_eq!(get_ref.ret, Ty::Ref(RefTy::Obj));
    }

    #[test]
    fn slice_allocates_and_takes_thread_state() {
        let program = Program::default();
        let slice = route_method(&program, &RefTy::Array(ElemKind::Prim(PrimKind::U8)), "slice")
            .unwrap();
        assert_eq!(slice.symbol, "rt_array_slice_u8");
        assert!(slice.takes_ts);
        assert!(slice.may_allocate);
        assert_eq!(slice.arity, 2);
    }

    #[test]
    fn vec_methods_route_to_runtime_builtin() {
        let program = Program::default();
        assert_eq!(
            route_method(&program, &RefTy::Vec, "push").unwrap().symbol,
            "rt_vec_push"
        );
        assert_eq!(
            route_method(&program, &RefTy::Vec, "get").unwrap().symbol,
            "rt_vec_get"
        );
    }

    #[test]
    fn unknown_method_is_an_error() {
        let program = Program::default();
        let err = route_method(&program, &RefTy::Str, "frobnicate").unwrap_err();
        assert!(matches!(err, CodegenError::UnknownMethod { .. }));
    }

    #[test]
    fn cast_targets_resolve_to_descriptor_symbols() {
        let program = Program::default();
        assert_eq!(
            type_descriptor_symbol(&program, &RefTy::Str).as_deref(),
            Some("rt_type_str")
        );
        assert_eq!(
            type_descriptor_symbol(&program, &RefTy::Box(PrimKind::I64)).as_deref(),
            Some("rt_type_box_i64")
        );
        assert_eq!(type_descriptor_symbol(&program, &RefTy::Obj), None);
    }
}

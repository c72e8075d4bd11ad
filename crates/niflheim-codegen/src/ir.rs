//! Typed program representation.
//!
//! This is the hand-off boundary from the (external) type checker: every
//! expression carries enough type information for the emitter to pick
//! register classes, root slots, and runtime entry points without re-running
//! inference. Index and slice sugar arrives uncanonicalized and is rewritten
//! into method calls by `lower`.

use niflheim_abi::PrimKind;
use niflheim_abi::entry::ElemKind;
use niflheim_abi::header::HEADER_SIZE;

use crate::error::CodegenError;

/// Index into [`Program::classes`].
pub type ClassId = usize;
/// Index into [`Program::funcs`].
pub type FuncId = usize;
/// Index into [`FuncDef::locals`].
pub type LocalId = usize;
/// Index into [`Program::globals`].
pub type GlobalId = usize;

/// A value type.
#[derive(Debug, Clone, PartialEq)]
pub enum Ty {
    /// No value.
    Unit,
    /// Register primitive; never occupies a root slot.
    Prim(PrimKind),
    /// Managed reference; lives in root slots across safepoints.
    Ref(RefTy),
}

impl Ty {
    /// True for managed references.
    #[inline]
    pub fn is_ref(&self) -> bool {
        matches!(self, Ty::Ref(_))
    }

    /// True for values passed in XMM registers.
    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Ty::Prim(PrimKind::Double))
    }
}

/// A reference type.
#[derive(Debug, Clone, PartialEq)]
pub enum RefTy {
    /// Immutable byte string.
    Str,
    /// Growable string builder.
    StrBuf,
    /// Growable vector of references.
    Vec,
    /// Boxed primitive.
    Box(PrimKind),
    /// Array with the given element category.
    Array(ElemKind),
    /// User class.
    Class(ClassId),
    /// The top reference type; any reference upcasts to it.
    Obj,
}

impl RefTy {
    /// Human-readable name for diagnostics.
    pub fn display_name(&self, program: &Program) -> String {
        match self {
            RefTy::Str => "Str".into(),
            RefTy::StrBuf => "StrBuf".into(),
            RefTy::Vec => "Vec".into(),
            RefTy::Box(kind) => format!("Box[{kind}]"),
            RefTy::Array(elem) => format!("{}[]", elem.suffix()),
            RefTy::Class(id) => program
                .classes
                .get(*id)
                .map_or_else(|| format!("<class {id}>"), |c| c.name.clone()),
            RefTy::Obj => "Obj".into(),
        }
    }
}

/// A complete, type-checked program.
#[derive(Debug, Default)]
pub struct Program {
    /// User classes, indexed by [`ClassId`].
    pub classes: Vec<ClassDef>,
    /// Module globals, indexed by [`GlobalId`].
    pub globals: Vec<GlobalDef>,
    /// Functions, indexed by [`FuncId`].
    pub funcs: Vec<FuncDef>,
    /// The user entry point `main` calls after runtime startup.
    pub entry: FuncId,
}

/// A user class: named fields, every field slot 8 bytes wide.
#[derive(Debug)]
pub struct ClassDef {
    /// Class name (also the emitted descriptor's debug name).
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
}

impl ClassDef {
    /// Payload size: one 8-byte slot per field.
    pub fn payload_size(&self) -> u64 {
        self.fields.len() as u64 * 8
    }

    /// Byte offset of a field from the object base.
    pub fn field_offset(&self, field: usize) -> u64 {
        HEADER_SIZE + field as u64 * 8
    }

    /// Offsets (from the object base) of every reference field, for the
    /// emitted descriptor's pointer-offset table.
    pub fn ref_field_offsets(&self) -> Vec<u64> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.ty.is_ref())
            .map(|(i, _)| self.field_offset(i))
            .collect()
    }
}

/// One class field.
#[derive(Debug)]
pub struct FieldDef {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: Ty,
}

/// One module global. Reference-typed globals are emitted as registered
/// global roots.
#[derive(Debug)]
pub struct GlobalDef {
    /// Global name.
    pub name: String,
    /// Global type.
    pub ty: Ty,
}

/// Source position carried for diagnostic trace frames.
#[derive(Debug, Clone)]
pub struct SrcLoc {
    /// Source file.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
}

/// One function. The first `param_count` locals are the parameters, in
/// order; the checker guarantees every local is declared here.
#[derive(Debug)]
pub struct FuncDef {
    /// Function name (mangled with the `nfl_` prefix on emission).
    pub name: String,
    /// All locals, parameters first.
    pub locals: Vec<LocalDef>,
    /// How many leading locals are parameters.
    pub param_count: usize,
    /// Return type.
    pub ret: Ty,
    /// Body statements.
    pub body: Vec<Stmt>,
    /// Optional source location for trace frames.
    pub src: Option<SrcLoc>,
}

/// One local variable.
#[derive(Debug)]
pub struct LocalDef {
    /// Local name, for assembly comments.
    pub name: String,
    /// Local type.
    pub ty: Ty,
}

/// Statements.
#[derive(Debug)]
pub enum Stmt {
    /// `x = e` (also local initialization).
    Assign(LocalId, Expr),
    /// `g = e` for a module global.
    AssignGlobal(GlobalId, Expr),
    /// `obj.field = e`.
    SetField {
        /// Receiver expression.
        obj: Expr,
        /// Receiver class.
        class: ClassId,
        /// Field index within the class.
        field: usize,
        /// Value to store.
        value: Expr,
    },
    /// `x[i] = v` sugar; canonicalized to a `set` method call.
    IndexAssign {
        /// Receiver expression.
        recv: Expr,
        /// Receiver type, from the checker.
        recv_ty: RefTy,
        /// Index expression (`i64` at the language level).
        index: Expr,
        /// Value to store.
        value: Expr,
    },
    /// Evaluate for effect, discard the value.
    Expr(Expr),
    /// Two-armed conditional.
    If {
        /// Boolean condition.
        cond: Expr,
        /// Then branch.
        then_body: Vec<Stmt>,
        /// Else branch (possibly empty).
        else_body: Vec<Stmt>,
    },
    /// Pre-tested loop.
    While {
        /// Boolean condition.
        cond: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// Return, with a value unless the function returns unit.
    Return(Option<Expr>),
    /// Print a value and a newline.
    Println(Expr),
}

/// Binary operators. Arithmetic requires both operands of the same
/// primitive kind; comparisons yield `bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder (integers only).
    Rem,
    /// Equality.
    Eq,
    /// Inequality.
    Ne,
    /// Less-than.
    Lt,
    /// Less-or-equal.
    Le,
    /// Greater-than.
    Gt,
    /// Greater-or-equal.
    Ge,
    /// Boolean and (non-short-circuit).
    And,
    /// Boolean or (non-short-circuit).
    Or,
}

impl BinOp {
    /// True when the result is `bool` regardless of operand kind.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Boolean not.
    Not,
}

/// Typed expressions.
#[derive(Debug)]
pub enum Expr {
    /// `i64` literal.
    I64(i64),
    /// `u64` literal.
    U64(u64),
    /// `u8` literal.
    U8(u8),
    /// `bool` literal.
    Bool(bool),
    /// `double` literal.
    Double(f64),
    /// String literal; constructs a fresh `Str` at evaluation.
    StrLit(String),
    /// The null reference, typed by context.
    NullRef,
    /// Local read.
    Local(LocalId),
    /// Global read.
    Global(GlobalId),
    /// Unary operation.
    Unary(UnOp, Box<Expr>),
    /// Binary operation.
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Call of a user function.
    Call {
        /// Callee.
        func: FuncId,
        /// Arguments in order.
        args: Vec<Expr>,
    },
    /// User-class construction: allocate, then store one initializer per
    /// field in declaration order.
    New {
        /// Class to construct.
        class: ClassId,
        /// Field initializers, one per field.
        inits: Vec<Expr>,
    },
    /// Built-in box construction.
    NewBox {
        /// Boxed kind.
        kind: PrimKind,
        /// Value to box.
        value: Box<Expr>,
    },
    /// Built-in array construction (zero/null filled).
    NewArray {
        /// Element category.
        elem: ElemKind,
        /// Length (`i64` at the language level).
        len: Box<Expr>,
    },
    /// Built-in empty `Vec` construction.
    NewVec,
    /// Built-in empty `StrBuf` construction.
    NewStrBuf,
    /// Typed field load.
    GetField {
        /// Receiver expression.
        obj: Box<Expr>,
        /// Receiver class.
        class: ClassId,
        /// Field index within the class.
        field: usize,
    },
    /// Built-in method call, dispatched by receiver category.
    MethodCall {
        /// Receiver expression.
        recv: Box<Expr>,
        /// Receiver type, from the checker.
        recv_ty: RefTy,
        /// Method name (`get`, `set`, `slice`, `len`, `push`, ...).
        method: String,
        /// Arguments, receiver excluded.
        args: Vec<Expr>,
    },
    /// `x[i]` sugar; canonicalized to a `get` method call.
    Index {
        /// Receiver expression.
        recv: Box<Expr>,
        /// Receiver type, from the checker.
        recv_ty: RefTy,
        /// Index expression.
        index: Box<Expr>,
    },
    /// `x[a:b]` sugar; canonicalized to a `slice` method call.
    Slice {
        /// Receiver expression.
        recv: Box<Expr>,
        /// Receiver type, from the checker.
        recv_ty: RefTy,
        /// Range start.
        start: Box<Expr>,
        /// Range end.
        end: Box<Expr>,
    },
    /// Checked downcast; null flows through, mismatch panics at runtime.
    Cast {
        /// Value to cast.
        obj: Box<Expr>,
        /// Target reference type.
        to: RefTy,
    },
}

impl Program {
    /// Static type of an expression inside `func`.
    pub fn expr_ty(&self, func: &FuncDef, expr: &Expr) -> Result<Ty, CodegenError> {
        let bad_id = |kind: &'static str, id: usize| CodegenError::BadId {
            kind,
            id,
            func: func.name.clone(),
        };
        Ok(match expr {
            Expr::I64(_) => Ty::Prim(PrimKind::I64),
            Expr::U64(_) => Ty::Prim(PrimKind::U64),
            Expr::U8(_) => Ty::Prim(PrimKind::U8),
            Expr::Bool(_) => Ty::Prim(PrimKind::Bool),
            Expr::Double(_) => Ty::Prim(PrimKind::Double),
            Expr::StrLit(_) => Ty::Ref(RefTy::Str),
            Expr::NullRef => Ty::Ref(RefTy::Obj),
            Expr::Local(id) => func.locals.get(*id).ok_or_else(|| bad_id("local", *id))?.ty.clone(),
            Expr::Global(id) => self
                .globals
                .get(*id)
                .ok_or_else(|| bad_id("global", *id))?
                .ty
                .clone(),
            Expr::Unary(_, inner) => self.expr_ty(func, inner)?,
            Expr::Binary(op, lhs, _) => {
                if op.is_comparison() {
                    Ty::Prim(PrimKind::Bool)
                } else {
                    self.expr_ty(func, lhs)?
                }
            }
            Expr::Call { func: callee, .. } => self
                .funcs
                .get(*callee)
                .ok_or_else(|| bad_id("func", *callee))?
                .ret
                .clone(),
            Expr::New { class, .. } => {
                if *class >= self.classes.len() {
                    return Err(bad_id("class", *class));
                }
                Ty::Ref(RefTy::Class(*class))
            }
            Expr::NewBox { kind, .. } => Ty::Ref(RefTy::Box(*kind)),
            Expr::NewArray { elem, .. } => Ty::Ref(RefTy::Array(*elem)),
            Expr::NewVec => Ty::Ref(RefTy::Vec),
            Expr::NewStrBuf => Ty::Ref(RefTy::StrBuf),
            Expr::GetField { class, field, .. } => {
                let class_def = self.classes.get(*class).ok_or_else(|| bad_id("class", *class))?;
                class_def
                    .fields
                    .get(*field)
                    .ok_or_else(|| bad_id("field", *field))?
                    .ty
                    .clone()
            }
            Expr::MethodCall { recv_ty, method, .. } => {
                crate::lower::route_method(self, recv_ty, method)?.ret
            }
            Expr::Index { recv_ty, .. } => {
                crate::lower::route_method(self, recv_ty, "get")?.ret
            }
            Expr::Slice { recv_ty, .. } => {
                crate::lower::route_method(self, recv_ty, "slice")?.ret
            }
            Expr::Cast { to, .. } => Ty::Ref(to.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_func() -> FuncDef {
        FuncDef {
            name: "f".into(),
            locals: vec![LocalDef {
                name: "s".into(),
                ty: Ty::Ref(RefTy::Str),
            }],
            param_count: 0,
            ret: Ty::Unit,
            body: vec![],
            src: None,
        }
    }

    #[test]
    fn literal_types() {
        let program = Program::default();
        let func = leaf_func();
        assert_eq!(
            program.expr_ty(&func, &Expr::I64(1)).unwrap(),
            Ty::Prim(PrimKind::I64)
        );
        assert_eq!(
            program.expr_ty(&func, &Expr::StrLit("x".into())).unwrap(),
            Ty::Ref(RefTy::Str)
        );
    }

    #[test]
    fn comparison_yields_bool() {
        let program = Program::default();
        let func = leaf_func();
        let expr = Expr::Binary(BinOp::Lt, Box::new(Expr::I64(1)), Box::new(Expr::I64(2)));
        assert_eq!(program.expr_ty(&func, &expr).unwrap(), Ty::Prim(PrimKind::Bool));
    }

    #[test]
    fn class_layout_is_one_slot_per_field() {
        let class = ClassDef {
            name: "Pair".into(),
            fields: vec![
                FieldDef {
                    name: "a".into(),
                    ty: Ty::Prim(PrimKind::I64),
                },
                FieldDef {
                    name: "b".into(),
                    ty: Ty::Ref(RefTy::Str),
                },
            ],
        };
        assert_eq!(class.payload_size(), 16);
        assert_eq!(class.field_offset(0), HEADER_SIZE);
        assert_eq!(class.field_offset(1), HEADER_SIZE + 8);
        assert_eq!(class.ref_field_offsets(), vec![HEADER_SIZE + 8]);
    }
}

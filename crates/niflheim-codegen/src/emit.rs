//! Program emission.
//!
//! One translation unit per program: `.rodata` string literals and debug
//! names, `.data` user-class type descriptors, `.bss` globals, `.text`
//! functions, and a `main` wrapper that brings the runtime up and down.
//!
//! ## Per-activation protocol
//!
//! ```text
//! prologue: reserve slots, rt_root_frame_init, rt_push_roots
//! body:     before each call: spill live refs to root slots
//!           after each call:  reload refs from slots
//! epilogue: rt_pop_roots exactly once, on every exit path
//! ```
//!
//! Every exit path funnels through one epilogue label, so push/pop balance
//! is a structural property of the emitted code rather than a per-path
//! obligation. Reference values are kept in root slots at all times; a
//! register copy never outlives the expression that loaded it.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use niflheim_abi::ABI_SCHEMA_VERSION;
use niflheim_abi::PrimKind;
use niflheim_abi::entry::{RuntimeFn, array_symbol, box_symbol, println_symbol};
use niflheim_abi::typedesc::{
    TYPE_FLAG_HAS_REFS, TYPE_FLAG_LEAF, USER_TYPE_ID_BASE,
};

use crate::abi::{ArgSlot, INT_ARG_REGS, classify_args};
use crate::asm::{
    AsmBuf, Reg, escape_ascii, field_qword, frame_addr, frame_qword, rip_addr, rip_qword,
};
use crate::error::CodegenError;
use crate::frame::{DESC_DISP, FrameLayout, LocalHome, RBX_SAVE_DISP, SCRATCH_DISP};
use crate::ir::{BinOp, ClassId, Expr, FuncDef, GlobalId, Program, RefTy, Stmt, Ty, UnOp};
use crate::lower::{BuiltinCall, route_method, type_descriptor_symbol};

/// Emission options.
#[derive(Debug, Clone, Default)]
pub struct CodegenOptions {
    /// Emit `#` comments naming locals and statements.
    pub emit_comments: bool,
    /// Bracket each function with `rt_trace_push`/`rt_trace_pop` so panics
    /// print source locations.
    pub emit_trace_frames: bool,
}

/// Interned `.rodata` entries: string literals and debug-name strings.
#[derive(Default)]
struct Rodata {
    strings: Vec<(String, Vec<u8>)>,
    interned: FxHashMap<Vec<u8>, String>,
    asciz: Vec<(String, String)>,
}

impl Rodata {
    /// Label of a byte-string literal, interned.
    fn literal(&mut self, bytes: &[u8]) -> String {
        if let Some(label) = self.interned.get(bytes) {
            return label.clone();
        }
        let label = format!(".Lstr{}", self.strings.len());
        self.interned.insert(bytes.to_vec(), label.clone());
        self.strings.push((label.clone(), bytes.to_vec()));
        label
    }

    /// A named NUL-terminated string (descriptor names, trace-frame text).
    fn asciz(&mut self, label: String, text: String) {
        if self.asciz.iter().any(|(l, _)| *l == label) {
            return;
        }
        self.asciz.push((label, text));
    }
}

/// Emit a complete program as one Intel-syntax `.s` translation unit.
pub fn emit_program(program: &Program, opts: &CodegenOptions) -> Result<String, CodegenError> {
    if program.entry >= program.funcs.len() {
        return Err(CodegenError::BadId {
            kind: "func",
            id: program.entry,
            func: "<entry>".into(),
        });
    }

    let mut rodata = Rodata::default();
    let mut text = AsmBuf::new(opts.emit_comments);

    for func in &program.funcs {
        let mut emitter = FuncEmitter::new(program, func, opts, &mut text, &mut rodata)?;
        emitter.emit()?;
    }
    emit_main_wrapper(program, &mut text);

    let mut out = AsmBuf::new(opts.emit_comments);
    out.directive(".intel_syntax noprefix");
    out.blank();

    // String literals and debug names.
    out.directive(".section .rodata");
    for (label, bytes) in &rodata.strings {
        out.label(label);
        if bytes.is_empty() {
            out.directive(".byte 0");
        } else {
            out.directive(format!(".ascii \"{}\"", escape_ascii(bytes)));
        }
    }
    for (label, name) in &rodata.asciz {
        out.label(label);
        out.directive(format!(".asciz \"{name}\""));
    }
    out.blank();

    // User-class type descriptors, laid out byte-for-byte per the ABI.
    if !program.classes.is_empty() {
        out.directive(".section .data");
        for (id, class) in program.classes.iter().enumerate() {
            emit_class_descriptor(&mut out, class, id);
        }
        out.blank();
    }

    // Globals: one 8-byte cell each; reference cells double as root slots.
    if !program.globals.is_empty() {
        out.directive(".section .bss");
        out.directive(".balign 8");
        for global in &program.globals {
            out.label(&format!("nfl_g_{}", global.name));
            out.directive(".zero 8");
        }
        out.blank();
    }

    out.directive(".section .text");
    let mut result = out.finish();
    result.push_str(&text.finish());
    Ok(result)
}

fn emit_class_descriptor(out: &mut AsmBuf, class: &crate::ir::ClassDef, id: ClassId) {
    let ref_offsets = class.ref_field_offsets();
    let flags = if ref_offsets.is_empty() {
        TYPE_FLAG_LEAF
    } else {
        TYPE_FLAG_HAS_REFS
    };
    let name_label = format!(".Lnfl_name_{}", class.name);
    let offsets_label = format!(".Lnfl_offs_{}", class.name);

    out.directive(".balign 8");
    out.label(&format!("nfl_type_{}", class.name));
    out.directive(format!(".long {}", USER_TYPE_ID_BASE + id as u32));
    out.directive(format!(".long {flags}"));
    out.directive(format!(".long {ABI_SCHEMA_VERSION}"));
    out.directive(".long 8");
    out.directive(format!(
        ".quad {}",
        niflheim_abi::header::HEADER_SIZE + class.payload_size()
    ));
    out.directive(format!(".quad {name_label}"));
    out.directive(".quad 0");
    if ref_offsets.is_empty() {
        out.directive(".quad 0");
        out.directive(".quad 0");
    } else {
        out.directive(format!(".quad {offsets_label}"));
        out.directive(format!(".quad {}", ref_offsets.len()));
        out.label(&offsets_label);
        for offset in &ref_offsets {
            out.directive(format!(".quad {offset}"));
        }
    }
    out.directive(".section .rodata");
    out.label(&name_label);
    out.directive(format!(".asciz \"{}\"", class.name));
    out.directive(".section .data");
}

/// `main`: bring the runtime up, register reference globals as roots, run
/// the user entry point, unwind in reverse order.
fn emit_main_wrapper(program: &Program, text: &mut AsmBuf) {
    let entry = &program.funcs[program.entry];
    text.blank();
    text.directive(".globl main");
    text.label("main");
    text.ins("push rbp");
    text.ins("mov rbp, rsp");
    text.ins(format!("call {}", RuntimeFn::Init.symbol()));
    for global in &program.globals {
        if global.ty.is_ref() {
            text.ins(format!("lea rdi, {}", rip_addr(&format!("nfl_g_{}", global.name))));
            text.ins(format!("call {}", RuntimeFn::RegisterGlobalRoot.symbol()));
        }
    }
    text.ins(format!("call nfl_{}", entry.name));
    for global in &program.globals {
        if global.ty.is_ref() {
            text.ins(format!("lea rdi, {}", rip_addr(&format!("nfl_g_{}", global.name))));
            text.ins(format!("call {}", RuntimeFn::UnregisterGlobalRoot.symbol()));
        }
    }
    text.ins(format!("call {}", RuntimeFn::Shutdown.symbol()));
    text.ins("xor eax, eax");
    text.ins("pop rbp");
    text.ins("ret");
}

struct FuncEmitter<'a> {
    program: &'a Program,
    func: &'a FuncDef,
    layout: FrameLayout,
    opts: &'a CodegenOptions,
    buf: &'a mut AsmBuf,
    rodata: &'a mut Rodata,
    /// Staged operand count; nested calls stage above the current level.
    stage: usize,
    epilogue: String,
    null_panic: String,
    needs_null_panic: bool,
}

impl<'a> FuncEmitter<'a> {
    fn new(
        program: &'a Program,
        func: &'a FuncDef,
        opts: &'a CodegenOptions,
        buf: &'a mut AsmBuf,
        rodata: &'a mut Rodata,
    ) -> Result<Self, CodegenError> {
        let layout = FrameLayout::compute(func, opts.emit_trace_frames)?;
        let epilogue = format!(".Lepilogue_{}", func.name);
        let null_panic = format!(".Lnull_{}", func.name);
        Ok(Self {
            program,
            func,
            layout,
            opts,
            buf,
            rodata,
            stage: 0,
            epilogue,
            null_panic,
            needs_null_panic: false,
        })
    }

    fn emit(&mut self) -> Result<(), CodegenError> {
        self.buf.blank();
        self.buf.directive(format!(".globl nfl_{}", self.func.name));
        self.buf.label(&format!("nfl_{}", self.func.name));
        self.emit_prologue()?;
        let body = &self.func.body;
        for stmt in body {
            self.emit_stmt(stmt)?;
        }
        self.emit_epilogue();
        if self.needs_null_panic {
            self.buf.label(&self.null_panic.clone());
            self.buf
                .ins(format!("call {}", RuntimeFn::PanicNullDeref.symbol()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Prologue / epilogue
    // ------------------------------------------------------------------

    fn emit_prologue(&mut self) -> Result<(), CodegenError> {
        self.buf.ins("push rbp");
        self.buf.ins("mov rbp, rsp");
        if self.layout.frame_size > 0 {
            self.buf.ins(format!("sub rsp, {}", self.layout.frame_size));
        }

        // Park incoming parameters before the first call clobbers the
        // argument registers. Reference parameters wait in their prim-area
        // staging mirror until the root frame exists.
        let param_tys: Vec<Ty> = self.func.locals[..self.func.param_count]
            .iter()
            .map(|local| local.ty.clone())
            .collect();
        let slots = classify_args(&self.func.name, 0, &param_tys)?;
        let mut parked: SmallVec<[(usize, u64); 8]> = SmallVec::new();
        for (i, slot) in slots.iter().enumerate() {
            // Every local has a mirror slot; reference parameters park
            // there until the root frame exists.
            let disp = self.layout.local_mirror_disp(i);
            match slot {
                ArgSlot::Int(n) => {
                    self.buf
                        .ins(format!("mov {}, {}", frame_qword(disp), INT_ARG_REGS[*n]));
                }
                ArgSlot::Float(n) => {
                    self.buf
                        .ins(format!("movsd {}, xmm{n}", frame_qword(disp)));
                }
            }
            if matches!(self.layout.local_home[i], LocalHome::RootSlot(_)) {
                parked.push((i, disp));
            }
        }

        if self.layout.needs_ts {
            self.buf
                .ins(format!("mov {}, rbx", frame_qword(RBX_SAVE_DISP)));
            self.buf
                .ins(format!("call {}", RuntimeFn::ThreadState.symbol()));
            self.buf.ins("mov rbx, rax");
        }

        if self.layout.root_slot_count > 0 {
            self.buf
                .ins(format!("lea rdi, {}", frame_addr(DESC_DISP)));
            self.buf
                .ins(format!("lea rsi, {}", frame_addr(self.layout.slots_array_disp())));
            self.buf
                .ins(format!("mov edx, {}", self.layout.root_slot_count));
            self.buf
                .ins(format!("call {}", RuntimeFn::RootFrameInit.symbol()));
            self.buf.ins("mov rdi, rbx");
            self.buf
                .ins(format!("lea rsi, {}", frame_addr(DESC_DISP)));
            self.buf
                .ins(format!("call {}", RuntimeFn::PushRoots.symbol()));

            // Move parked reference parameters into their root slots.
            for (local, disp) in parked {
                if let LocalHome::RootSlot(slot) = self.layout.local_home[local] {
                    self.buf.ins(format!("mov rdx, {}", frame_qword(disp)));
                    self.emit_root_slot_store(slot);
                }
            }
        }

        if self.opts.emit_trace_frames {
            self.emit_trace_push();
        }
        Ok(())
    }

    fn emit_epilogue(&mut self) {
        self.buf.label(&self.epilogue.clone());
        if self.opts.emit_trace_frames {
            self.buf.ins("mov rdi, rbx");
            self.buf
                .ins(format!("call {}", RuntimeFn::TracePop.symbol()));
        }
        if self.layout.root_slot_count > 0 {
            self.buf.ins("mov rdi, rbx");
            self.buf
                .ins(format!("call {}", RuntimeFn::PopRoots.symbol()));
        }
        match &self.func.ret {
            Ty::Unit => {}
            ty if ty.is_float() => {
                self.buf
                    .ins(format!("movsd xmm0, {}", frame_qword(SCRATCH_DISP)));
            }
            _ => {
                self.buf
                    .ins(format!("mov rax, {}", frame_qword(SCRATCH_DISP)));
            }
        }
        if self.layout.needs_ts {
            self.buf
                .ins(format!("mov rbx, {}", frame_qword(RBX_SAVE_DISP)));
        }
        self.buf.ins("leave");
        self.buf.ins("ret");
    }

    fn emit_trace_push(&mut self) {
        let disp = self.layout.trace_frame_disp();
        let func_label = format!(".Lnfl_fn_{}", self.func.name);
        self.rodata
            .asciz(func_label.clone(), self.func.name.clone());
        let file_operand = if let Some(src) = &self.func.src {
            let file_label = format!(".Lnfl_file_{}", self.func.name);
            self.rodata.asciz(file_label.clone(), src.file.clone());
            Some((file_label, src.line, src.col))
        } else {
            None
        };

        // TraceFrame { prev, func, file, line, col } at rbp-disp.
        self.buf
            .ins(format!("lea rax, {}", rip_addr(&func_label)));
        self.buf
            .ins(format!("mov {}, rax", frame_qword(disp - 8)));
        match file_operand {
            Some((file_label, line, col)) => {
                self.buf
                    .ins(format!("lea rax, {}", rip_addr(&file_label)));
                self.buf
                    .ins(format!("mov {}, rax", frame_qword(disp - 16)));
                self.buf
                    .ins(format!("mov dword ptr [rbp-{}], {line}", disp - 24));
                self.buf
                    .ins(format!("mov dword ptr [rbp-{}], {col}", disp - 28));
            }
            None => {
                self.buf
                    .ins(format!("mov {}, 0", frame_qword(disp - 16)));
                self.buf
                    .ins(format!("mov dword ptr [rbp-{}], 0", disp - 24));
                self.buf
                    .ins(format!("mov dword ptr [rbp-{}], 0", disp - 28));
            }
        }
        self.buf.ins("mov rdi, rbx");
        self.buf.ins(format!("lea rsi, {}", frame_addr(disp)));
        self.buf
            .ins(format!("call {}", RuntimeFn::TracePush.symbol()));
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), CodegenError> {
        match stmt {
            Stmt::Assign(local, expr) => {
                if self.opts.emit_comments {
                    let name = &self.func.locals[*local].name;
                    self.buf.comment(format!("{name} = ..."));
                }
                let ty = self.program.expr_ty(self.func, expr)?;
                self.emit_expr(expr)?;
                self.store_local(*local, &ty)
            }
            Stmt::AssignGlobal(global, expr) => {
                let ty = self.program.expr_ty(self.func, expr)?;
                self.emit_expr(expr)?;
                self.store_global(*global, &ty)
            }
            Stmt::SetField {
                obj,
                class,
                field,
                value,
            } => self.emit_set_field(obj, *class, *field, value),
            Stmt::IndexAssign {
                recv,
                recv_ty,
                index,
                value,
            } => {
                // x[i] = v canonicalizes to x.set(i, v).
                self.emit_builtin_call(recv, recv_ty, "set", &[index, value])?;
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.emit_expr(expr)?;
                Ok(())
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let else_label = self.buf.fresh_label("else");
                let end_label = self.buf.fresh_label("endif");
                self.emit_expr(cond)?;
                self.buf.ins("test rax, rax");
                self.buf.ins(format!("je {else_label}"));
                for stmt in then_body {
                    self.emit_stmt(stmt)?;
                }
                self.buf.ins(format!("jmp {end_label}"));
                self.buf.label(&else_label);
                for stmt in else_body {
                    self.emit_stmt(stmt)?;
                }
                self.buf.label(&end_label);
                Ok(())
            }
            Stmt::While { cond, body } => {
                let head_label = self.buf.fresh_label("loop");
                let end_label = self.buf.fresh_label("endloop");
                self.buf.label(&head_label);
                self.emit_expr(cond)?;
                self.buf.ins("test rax, rax");
                self.buf.ins(format!("je {end_label}"));
                for stmt in body {
                    self.emit_stmt(stmt)?;
                }
                self.buf.ins(format!("jmp {head_label}"));
                self.buf.label(&end_label);
                Ok(())
            }
            Stmt::Return(expr) => {
                if let Some(expr) = expr {
                    let ty = self.program.expr_ty(self.func, expr)?;
                    self.emit_expr(expr)?;
                    if ty.is_float() {
                        self.buf
                            .ins(format!("movsd {}, xmm0", frame_qword(SCRATCH_DISP)));
                    } else if !matches!(ty, Ty::Unit) {
                        self.buf
                            .ins(format!("mov {}, rax", frame_qword(SCRATCH_DISP)));
                    }
                }
                self.buf.ins(format!("jmp {}", self.epilogue));
                Ok(())
            }
            Stmt::Println(expr) => {
                let ty = self.program.expr_ty(self.func, expr)?;
                self.emit_expr(expr)?;
                let symbol = match &ty {
                    Ty::Prim(PrimKind::Double) => println_symbol(PrimKind::Double),
                    Ty::Prim(kind) => {
                        self.buf.ins("mov rdi, rax");
                        println_symbol(*kind)
                    }
                    Ty::Ref(RefTy::Str) => {
                        self.buf.ins("mov rdi, rax");
                        RuntimeFn::PrintlnStr.symbol().to_owned()
                    }
                    other => {
                        return Err(CodegenError::Unsupported {
                            func: self.func.name.clone(),
                            what: format!("println of {other:?}"),
                        });
                    }
                };
                self.buf.ins(format!("call {symbol}"));
                Ok(())
            }
        }
    }

    fn emit_set_field(
        &mut self,
        obj: &Expr,
        class: ClassId,
        field: usize,
        value: &Expr,
    ) -> Result<(), CodegenError> {
        let class_def = self
            .program
            .classes
            .get(class)
            .ok_or_else(|| self.bad_id("class", class))?;
        if field >= class_def.fields.len() {
            return Err(self.bad_id("field", field));
        }
        let offset = class_def.field_offset(field);
        let value_ty = self.program.expr_ty(self.func, value)?;

        self.emit_expr(obj)?;
        self.emit_null_check(Reg::Rax);
        let pos = self.stage;
        self.stage += 1;
        self.stage_store(&Ty::Ref(RefTy::Class(class)), pos);

        self.emit_expr(value)?;
        self.stage_load_int(&Ty::Ref(RefTy::Class(class)), pos, Reg::Rcx);
        if value_ty.is_float() {
            self.buf
                .ins(format!("movsd {}, xmm0", field_qword(Reg::Rcx, offset)));
        } else {
            self.buf
                .ins(format!("mov {}, rax", field_qword(Reg::Rcx, offset)));
        }
        self.stage -= 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions: result in RAX (int/ref) or XMM0 (double)
    // ------------------------------------------------------------------

    fn emit_expr(&mut self, expr: &Expr) -> Result<(), CodegenError> {
        match expr {
            Expr::I64(v) => {
                self.emit_int_literal(*v);
                Ok(())
            }
            Expr::U64(v) => {
                if *v <= u32::MAX as u64 {
                    self.buf.ins(format!("mov eax, {v}"));
                } else {
                    self.buf.ins(format!("movabs rax, {v}"));
                }
                Ok(())
            }
            Expr::U8(v) => {
                self.buf.ins(format!("mov eax, {v}"));
                Ok(())
            }
            Expr::Bool(v) => {
                self.buf.ins(format!("mov eax, {}", u8::from(*v)));
                Ok(())
            }
            Expr::Double(v) => {
                self.buf
                    .ins(format!("movabs rax, {:#x}", v.to_bits()));
                self.buf.ins("movq xmm0, rax");
                Ok(())
            }
            Expr::StrLit(text) => {
                let label = self.rodata.literal(text.as_bytes());
                self.buf.ins("mov rdi, rbx");
                self.buf.ins(format!("lea rsi, {}", rip_addr(&label)));
                self.buf.ins(format!("mov rdx, {}", text.len()));
                self.buf
                    .ins(format!("call {}", RuntimeFn::StrFromBytes.symbol()));
                Ok(())
            }
            Expr::NullRef => {
                self.buf.ins("xor eax, eax");
                Ok(())
            }
            Expr::Local(id) => {
                let home = *self
                    .layout
                    .local_home
                    .get(*id)
                    .ok_or_else(|| self.bad_id("local", *id))?;
                let ty = &self.func.locals[*id].ty;
                match home {
                    LocalHome::PrimSlot(disp) if ty.is_float() => {
                        self.buf
                            .ins(format!("movsd xmm0, {}", frame_qword(disp)));
                    }
                    LocalHome::PrimSlot(disp) => {
                        self.buf.ins(format!("mov rax, {}", frame_qword(disp)));
                    }
                    LocalHome::RootSlot(slot) => {
                        // Reload from the authoritative slot; register
                        // copies do not survive safepoints.
                        self.buf.ins(format!(
                            "mov rax, {}",
                            frame_qword(self.layout.root_slot_disp(slot))
                        ));
                    }
                }
                Ok(())
            }
            Expr::Global(id) => {
                let global = self
                    .program
                    .globals
                    .get(*id)
                    .ok_or_else(|| self.bad_id("global", *id))?;
                let operand = rip_qword(&format!("nfl_g_{}", global.name));
                if global.ty.is_float() {
                    self.buf.ins(format!("movsd xmm0, {operand}"));
                } else {
                    self.buf.ins(format!("mov rax, {operand}"));
                }
                Ok(())
            }
            Expr::Unary(op, inner) => self.emit_unary(*op, inner),
            Expr::Binary(op, lhs, rhs) => self.emit_binary(*op, lhs, rhs),
            Expr::Call { func, args } => self.emit_user_call(*func, args),
            Expr::New { class, inits } => self.emit_new(*class, inits),
            Expr::NewBox { kind, value } => {
                self.emit_expr(value)?;
                if !kind.is_float() {
                    self.buf.ins("mov rsi, rax");
                }
                self.buf.ins("mov rdi, rbx");
                self.buf
                    .ins(format!("call {}", box_symbol(*kind, "new")));
                Ok(())
            }
            Expr::NewArray { elem, len } => {
                self.emit_expr(len)?;
                self.buf.ins("mov rsi, rax");
                self.buf.ins("mov rdi, rbx");
                self.buf.ins(format!(
                    "call {}",
                    array_symbol(niflheim_abi::entry::ArrayOp::New, *elem)
                ));
                Ok(())
            }
            Expr::NewVec => {
                self.buf.ins("mov rdi, rbx");
                self.buf
                    .ins(format!("call {}", RuntimeFn::VecNew.symbol()));
                Ok(())
            }
            Expr::NewStrBuf => {
                self.buf.ins("mov rdi, rbx");
                self.buf
                    .ins(format!("call {}", RuntimeFn::StrBufNew.symbol()));
                Ok(())
            }
            Expr::GetField { obj, class, field } => {
                let class_def = self
                    .program
                    .classes
                    .get(*class)
                    .ok_or_else(|| self.bad_id("class", *class))?;
                let field_def = class_def
                    .fields
                    .get(*field)
                    .ok_or_else(|| self.bad_id("field", *field))?;
                let offset = class_def.field_offset(*field);
                self.emit_expr(obj)?;
                self.emit_null_check(Reg::Rax);
                if field_def.ty.is_float() {
                    self.buf
                        .ins(format!("movsd xmm0, {}", field_qword(Reg::Rax, offset)));
                } else {
                    self.buf
                        .ins(format!("mov rax, {}", field_qword(Reg::Rax, offset)));
                }
                Ok(())
            }
            Expr::MethodCall {
                recv,
                recv_ty,
                method,
                args,
            } => {
                let arg_refs: Vec<&Expr> = args.iter().collect();
                self.emit_builtin_call(recv, recv_ty, method, &arg_refs)?;
                Ok(())
            }
            Expr::Index {
                recv,
                recv_ty,
                index,
            } => {
                // x[i] canonicalizes to x.get(i).
                self.emit_builtin_call(recv, recv_ty, "get", &[index.as_ref()])?;
                Ok(())
            }
            Expr::Slice {
                recv,
                recv_ty,
                start,
                end,
            } => {
                // x[a:b] canonicalizes to x.slice(a, b).
                self.emit_builtin_call(recv, recv_ty, "slice", &[start.as_ref(), end.as_ref()])?;
                Ok(())
            }
            Expr::Cast { obj, to } => {
                self.emit_expr(obj)?;
                let Some(symbol) = type_descriptor_symbol(self.program, to) else {
                    // Upcast to Obj carries no check.
                    return Ok(());
                };
                self.buf.ins("mov rdi, rax");
                self.buf.ins(format!("lea rsi, {}", rip_addr(&symbol)));
                self.buf
                    .ins(format!("call {}", RuntimeFn::CheckedCast.symbol()));
                Ok(())
            }
        }
    }

    fn emit_int_literal(&mut self, v: i64) {
        if i32::try_from(v).is_ok() {
            self.buf.ins(format!("mov rax, {v}"));
        } else {
            self.buf.ins(format!("movabs rax, {v}"));
        }
    }

    fn emit_unary(&mut self, op: UnOp, inner: &Expr) -> Result<(), CodegenError> {
        let ty = self.program.expr_ty(self.func, inner)?;
        self.emit_expr(inner)?;
        match (op, &ty) {
            (UnOp::Neg, ty) if ty.is_float() => {
                self.buf.ins("xorpd xmm1, xmm1");
                self.buf.ins("subsd xmm1, xmm0");
                self.buf.ins("movapd xmm0, xmm1");
            }
            (UnOp::Neg, Ty::Prim(_)) => {
                self.buf.ins("neg rax");
            }
            (UnOp::Not, Ty::Prim(PrimKind::Bool)) => {
                self.buf.ins("xor rax, 1");
            }
            _ => {
                return Err(CodegenError::Unsupported {
                    func: self.func.name.clone(),
                    what: format!("unary {op:?} on {ty:?}"),
                });
            }
        }
        Ok(())
    }

    fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<(), CodegenError> {
        let ty = self.program.expr_ty(self.func, lhs)?;
        if ty.is_ref() && !matches!(op, BinOp::Eq | BinOp::Ne) {
            return Err(CodegenError::Unsupported {
                func: self.func.name.clone(),
                what: format!("binary {op:?} on reference operands"),
            });
        }
        if ty.is_float() {
            return self.emit_binary_double(op, lhs, rhs);
        }

        self.emit_expr(lhs)?;
        let pos = self.stage;
        self.stage += 1;
        self.stage_store(&ty, pos);
        self.emit_expr(rhs)?;
        self.buf.ins("mov rcx, rax");
        self.stage_load_int(&ty, pos, Reg::Rax);
        self.stage -= 1;

        let signed = matches!(ty, Ty::Prim(PrimKind::I64));
        match op {
            BinOp::Add => self.buf.ins("add rax, rcx"),
            BinOp::Sub => self.buf.ins("sub rax, rcx"),
            BinOp::Mul => self.buf.ins("imul rax, rcx"),
            BinOp::Div | BinOp::Rem => {
                if signed {
                    self.buf.ins("cqo");
                    self.buf.ins("idiv rcx");
                } else {
                    self.buf.ins("xor edx, edx");
                    self.buf.ins("div rcx");
                }
                if op == BinOp::Rem {
                    self.buf.ins("mov rax, rdx");
                }
            }
            BinOp::And => self.buf.ins("and rax, rcx"),
            BinOp::Or => self.buf.ins("or rax, rcx"),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.buf.ins("cmp rax, rcx");
                let setcc = match (op, signed) {
                    (BinOp::Eq, _) => "sete",
                    (BinOp::Ne, _) => "setne",
                    (BinOp::Lt, true) => "setl",
                    (BinOp::Le, true) => "setle",
                    (BinOp::Gt, true) => "setg",
                    (BinOp::Ge, true) => "setge",
                    (BinOp::Lt, false) => "setb",
                    (BinOp::Le, false) => "setbe",
                    (BinOp::Gt, false) => "seta",
                    (BinOp::Ge, false) => "setae",
                    _ => unreachable!(),
                };
                self.buf.ins(format!("{setcc} al"));
                self.buf.ins("movzx eax, al");
            }
        }
        Ok(())
    }

    fn emit_binary_double(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CodegenError> {
        self.emit_expr(lhs)?;
        let pos = self.stage;
        self.stage += 1;
        self.buf.ins(format!(
            "movsd {}, xmm0",
            frame_qword(self.layout.prim_stage_disp(pos))
        ));
        self.emit_expr(rhs)?;
        self.buf.ins("movapd xmm1, xmm0");
        self.buf.ins(format!(
            "movsd xmm0, {}",
            frame_qword(self.layout.prim_stage_disp(pos))
        ));
        self.stage -= 1;

        match op {
            BinOp::Add => self.buf.ins("addsd xmm0, xmm1"),
            BinOp::Sub => self.buf.ins("subsd xmm0, xmm1"),
            BinOp::Mul => self.buf.ins("mulsd xmm0, xmm1"),
            BinOp::Div => self.buf.ins("divsd xmm0, xmm1"),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                self.buf.ins("ucomisd xmm0, xmm1");
                let setcc = match op {
                    BinOp::Eq => "sete",
                    BinOp::Ne => "setne",
                    BinOp::Lt => "setb",
                    BinOp::Le => "setbe",
                    BinOp::Gt => "seta",
                    BinOp::Ge => "setae",
                    _ => unreachable!(),
                };
                self.buf.ins(format!("{setcc} al"));
                self.buf.ins("movzx eax, al");
            }
            BinOp::Rem | BinOp::And | BinOp::Or => {
                return Err(CodegenError::Unsupported {
                    func: self.func.name.clone(),
                    what: format!("binary {op:?} on double operands"),
                });
            }
        }
        Ok(())
    }

    fn emit_user_call(&mut self, callee: crate::ir::FuncId, args: &[Expr]) -> Result<(), CodegenError> {
        let callee_def = self
            .program
            .funcs
            .get(callee)
            .ok_or_else(|| self.bad_id("func", callee))?;

        // Stage every argument; refs land in root slots, so everything
        // live is rooted before the call (an ordinary call may allocate
        // transitively).
        let mut arg_tys = Vec::with_capacity(args.len());
        let base = self.stage;
        for arg in args {
            let ty = self.program.expr_ty(self.func, arg)?;
            self.emit_expr(arg)?;
            let pos = self.stage;
            self.stage += 1;
            self.stage_store(&ty, pos);
            arg_tys.push(ty);
        }

        let slots = classify_args(&self.func.name, 0, &arg_tys)?;
        self.marshal_staged(base, &arg_tys, &slots);
        self.buf.ins(format!("call nfl_{}", callee_def.name));
        self.stage = base;
        Ok(())
    }

    fn emit_new(&mut self, class: ClassId, inits: &[Expr]) -> Result<(), CodegenError> {
        let class_def = self
            .program
            .classes
            .get(class)
            .ok_or_else(|| self.bad_id("class", class))?;
        if inits.len() != class_def.fields.len() {
            return Err(CodegenError::BadInitCount {
                class: class_def.name.clone(),
                fields: class_def.fields.len(),
                inits: inits.len(),
            });
        }

        self.buf.ins("mov rdi, rbx");
        self.buf.ins(format!(
            "lea rsi, {}",
            rip_addr(&format!("nfl_type_{}", class_def.name))
        ));
        self.buf
            .ins(format!("mov rdx, {}", class_def.payload_size()));
        self.buf
            .ins(format!("call {}", RuntimeFn::AllocObj.symbol()));

        // Root the fresh object before any initializer can reach a
        // safepoint.
        let pos = self.stage;
        self.stage += 1;
        let obj_ty = Ty::Ref(RefTy::Class(class));
        self.stage_store(&obj_ty, pos);

        for (field, init) in inits.iter().enumerate() {
            let init_ty = self.program.expr_ty(self.func, init)?;
            self.emit_expr(init)?;
            self.stage_load_int(&obj_ty, pos, Reg::Rcx);
            let offset = class_def.field_offset(field);
            if init_ty.is_float() {
                self.buf
                    .ins(format!("movsd {}, xmm0", field_qword(Reg::Rcx, offset)));
            } else {
                self.buf
                    .ins(format!("mov {}, rax", field_qword(Reg::Rcx, offset)));
            }
        }

        self.stage_load_int(&obj_ty, pos, Reg::Rax);
        self.stage -= 1;
        Ok(())
    }

    /// Shared path for built-in method calls and canonicalized index/slice
    /// sugar: stage receiver and arguments, marshal, call.
    fn emit_builtin_call(
        &mut self,
        recv: &Expr,
        recv_ty: &RefTy,
        method: &str,
        args: &[&Expr],
    ) -> Result<BuiltinCall, CodegenError> {
        let call = route_method(self.program, recv_ty, method)?;
        if call.arity != args.len() {
            return Err(CodegenError::MethodArity {
                recv: recv_ty.display_name(self.program),
                method: method.to_owned(),
                expected: call.arity,
                got: args.len(),
            });
        }

        let base = self.stage;
        let recv_value_ty = Ty::Ref(recv_ty.clone());
        self.emit_expr(recv)?;
        self.emit_null_check(Reg::Rax);
        let pos = self.stage;
        self.stage += 1;
        self.stage_store(&recv_value_ty, pos);

        let mut operand_tys = vec![recv_value_ty];
        for arg in args {
            let ty = self.program.expr_ty(self.func, arg)?;
            self.emit_expr(arg)?;
            let pos = self.stage;
            self.stage += 1;
            self.stage_store(&ty, pos);
            operand_tys.push(ty);
        }

        let leading = usize::from(call.takes_ts);
        let slots = classify_args(&self.func.name, leading, &operand_tys)?;
        if call.takes_ts {
            self.buf.ins("mov rdi, rbx");
        }
        self.marshal_staged(base, &operand_tys, &slots);
        self.buf.ins(format!("call {}", call.symbol));
        self.stage = base;
        Ok(call)
    }

    /// Reload staged operands `base..base+n` into their argument
    /// registers. Reference reloads read the root slots directly; the slot
    /// is the authoritative home after any safepoint.
    fn marshal_staged(&mut self, base: usize, tys: &[Ty], slots: &[ArgSlot]) {
        for (i, (ty, slot)) in tys.iter().zip(slots).enumerate() {
            let pos = base + i;
            match slot {
                ArgSlot::Float(n) => {
                    self.buf.ins(format!(
                        "movsd xmm{n}, {}",
                        frame_qword(self.layout.prim_stage_disp(pos))
                    ));
                }
                ArgSlot::Int(n) => {
                    let disp = if ty.is_ref() {
                        self.layout
                            .root_slot_disp(self.layout.stage_root_slot(pos))
                    } else {
                        self.layout.prim_stage_disp(pos)
                    };
                    self.buf
                        .ins(format!("mov {}, {}", INT_ARG_REGS[*n], frame_qword(disp)));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Staging and slot plumbing
    // ------------------------------------------------------------------

    /// Store the just-computed value (RAX/XMM0) into staging position
    /// `pos`: root slot for references, prim slot otherwise.
    fn stage_store(&mut self, ty: &Ty, pos: usize) {
        if ty.is_ref() {
            self.buf.ins("mov rdx, rax");
            self.emit_root_slot_store(self.layout.stage_root_slot(pos));
        } else if ty.is_float() {
            self.buf.ins(format!(
                "movsd {}, xmm0",
                frame_qword(self.layout.prim_stage_disp(pos))
            ));
        } else {
            self.buf.ins(format!(
                "mov {}, rax",
                frame_qword(self.layout.prim_stage_disp(pos))
            ));
        }
    }

    /// Load staging position `pos` into `dst` (non-float values).
    fn stage_load_int(&mut self, ty: &Ty, pos: usize, dst: Reg) {
        let disp = if ty.is_ref() {
            self.layout.root_slot_disp(self.layout.stage_root_slot(pos))
        } else {
            self.layout.prim_stage_disp(pos)
        };
        self.buf.ins(format!("mov {dst}, {}", frame_qword(disp)));
    }

    /// `rt_root_slot_store(frame, slot, rdx)` — the spill mandated at
    /// every safepoint. The value must already be in RDX.
    fn emit_root_slot_store(&mut self, slot: usize) {
        self.buf
            .ins(format!("lea rdi, {}", frame_addr(DESC_DISP)));
        self.buf.ins(format!("mov esi, {slot}"));
        self.buf
            .ins(format!("call {}", RuntimeFn::RootSlotStore.symbol()));
    }

    /// Store RAX/XMM0 into a named local's home.
    fn store_local(&mut self, local: crate::ir::LocalId, ty: &Ty) -> Result<(), CodegenError> {
        let home = *self
            .layout
            .local_home
            .get(local)
            .ok_or_else(|| self.bad_id("local", local))?;
        match home {
            LocalHome::PrimSlot(disp) if ty.is_float() => {
                self.buf
                    .ins(format!("movsd {}, xmm0", frame_qword(disp)));
            }
            LocalHome::PrimSlot(disp) => {
                self.buf.ins(format!("mov {}, rax", frame_qword(disp)));
            }
            LocalHome::RootSlot(slot) => {
                self.buf.ins("mov rdx, rax");
                self.emit_root_slot_store(slot);
            }
        }
        Ok(())
    }

    fn store_global(&mut self, global: GlobalId, ty: &Ty) -> Result<(), CodegenError> {
        let def = self
            .program
            .globals
            .get(global)
            .ok_or_else(|| self.bad_id("global", global))?;
        let operand = rip_qword(&format!("nfl_g_{}", def.name));
        if ty.is_float() {
            self.buf.ins(format!("movsd {operand}, xmm0"));
        } else {
            self.buf.ins(format!("mov {operand}, rax"));
        }
        Ok(())
    }

    /// `test reg, reg; je <panic stub>` — the per-site null check.
    fn emit_null_check(&mut self, reg: Reg) {
        self.needs_null_panic = true;
        self.buf.ins(format!("test {reg}, {reg}"));
        self.buf.ins(format!("je {}", self.null_panic));
    }

    fn bad_id(&self, kind: &'static str, id: usize) -> CodegenError {
        CodegenError::BadId {
            kind,
            id,
            func: self.func.name.clone(),
        }
    }
}

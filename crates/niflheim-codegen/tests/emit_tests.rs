//! Emitter scenario tests.
//!
//! These assert textual properties of the emitted assembly: the root-frame
//! protocol around every activation, spill-before-call ordering at
//! safepoints, descriptor records matching the ABI layout, and the
//! method-canonical routing of index sugar.

use niflheim_abi::PrimKind;
use niflheim_abi::entry::ElemKind;
use niflheim_codegen::emit::{CodegenOptions, emit_program};
use niflheim_codegen::error::CodegenError;
use niflheim_codegen::ir::{
    ClassDef, Expr, FieldDef, FuncDef, GlobalDef, LocalDef, Program, RefTy, Stmt, Ty,
};

fn func(name: &str, locals: Vec<LocalDef>, param_count: usize, ret: Ty, body: Vec<Stmt>) -> FuncDef {
    FuncDef {
        name: name.into(),
        locals,
        param_count,
        ret,
        body,
        src: None,
    }
}

fn local(name: &str, ty: Ty) -> LocalDef {
    LocalDef {
        name: name.into(),
        ty,
    }
}

fn one_func_program(f: FuncDef) -> Program {
    Program {
        classes: vec![],
        globals: vec![],
        funcs: vec![f],
        entry: 0,
    }
}

fn emit(program: &Program) -> String {
    emit_program(program, &CodegenOptions::default()).expect("emission should succeed")
}

/// First byte index of `needle`, with a readable failure.
fn idx(asm: &str, needle: &str) -> usize {
    asm.find(needle)
        .unwrap_or_else(|| panic!("expected `{needle}` in emitted assembly:\n{asm}"))
}

fn count(asm: &str, needle: &str) -> usize {
    asm.matches(needle).count()
}

#[test]
fn allocation_site_follows_the_safepoint_protocol() {
    let program = one_func_program(func(
        "greet",
        vec![local("s", Ty::Ref(RefTy::Str))],
        0,
        Ty::Unit,
        vec![Stmt::Assign(0, Expr::StrLit("hi".into()))],
    ));
    let asm = emit(&program);

    // Prologue order: frame init, push, then the allocating call, then the
    // result lands in a root slot, then the single pop.
    let init = idx(&asm, "call rt_root_frame_init");
    let push = idx(&asm, "call rt_push_roots");
    let alloc = idx(&asm, "call rt_str_from_bytes");
    let spill = asm[alloc..]
        .find("call rt_root_slot_store")
        .map(|i| i + alloc)
        .expect("result must be stored to a root slot after the allocating call");
    let pop = idx(&asm, "call rt_pop_roots");

    assert!(init < push && push < alloc && alloc < spill && spill < pop);
    assert_eq!(count(&asm, "call rt_push_roots"), 1);
    assert_eq!(count(&asm, "call rt_pop_roots"), 1);
}

#[test]
fn every_exit_path_funnels_through_one_pop() {
    let program = one_func_program(func(
        "pick",
        vec![local("s", Ty::Ref(RefTy::Str))],
        0,
        Ty::Prim(PrimKind::I64),
        vec![
            Stmt::Assign(0, Expr::StrLit("x".into())),
            Stmt::If {
                cond: Expr::Bool(true),
                then_body: vec![Stmt::Return(Some(Expr::I64(1)))],
                else_body: vec![],
            },
            Stmt::Return(Some(Expr::I64(2))),
        ],
    ));
    let asm = emit(&program);

    assert_eq!(count(&asm, "call rt_push_roots"), 1);
    assert_eq!(count(&asm, "call rt_pop_roots"), 1);
    // Both returns jump to the shared epilogue instead of popping inline.
    assert_eq!(count(&asm, "jmp .Lepilogue_pick"), 2);
}

#[test]
fn frames_keep_sixteen_byte_call_alignment() {
    let program = one_func_program(func(
        "busy",
        vec![
            local("a", Ty::Ref(RefTy::Str)),
            local("n", Ty::Prim(PrimKind::I64)),
            local("d", Ty::Prim(PrimKind::Double)),
        ],
        0,
        Ty::Unit,
        vec![Stmt::Assign(0, Expr::StrLit("pad".into()))],
    ));
    let asm = emit(&program);

    let sub = idx(&asm, "sub rsp, ");
    let rest = &asm[sub + "sub rsp, ".len()..];
    let amount: u64 = rest
        .split_whitespace()
        .next()
        .unwrap()
        .parse()
        .expect("sub rsp amount should be a literal");
    assert_eq!(amount % 16, 0, "frame size {amount} breaks call alignment");
}

#[test]
fn class_descriptors_match_the_abi_record_layout() {
    let program = Program {
        classes: vec![ClassDef {
            name: "Point".into(),
            fields: vec![
                FieldDef {
                    name: "x".into(),
                    ty: Ty::Prim(PrimKind::I64),
                },
                FieldDef {
                    name: "label".into(),
                    ty: Ty::Ref(RefTy::Str),
                },
                FieldDef {
                    name: "next".into(),
                    ty: Ty::Ref(RefTy::Class(0)),
                },
            ],
        }],
        globals: vec![],
        funcs: vec![func("noop", vec![], 0, Ty::Unit, vec![])],
        entry: 0,
    };
    let asm = emit(&program);

    let desc = idx(&asm, "nfl_type_Point:");
    let tail = &asm[desc..];
    // type id = USER_TYPE_ID_BASE, flags = HAS_REFS, schema 1, align 8,
    // size = 24 + 3*8.
    assert!(tail.contains(".long 4096"));
    assert!(tail.contains(".long 1"));
    assert!(tail.contains(".long 8"));
    assert!(tail.contains(".quad 48"));
    // Reference fields 1 and 2 sit at 24+8 and 24+16.
    let offs = idx(tail, ".Lnfl_offs_Point:");
    let offsets_tail = &tail[offs..];
    assert!(offsets_tail.contains(".quad 32"));
    assert!(offsets_tail.contains(".quad 40"));
    assert!(tail.contains(".asciz \"Point\""));
}

#[test]
fn index_sugar_routes_by_element_category() {
    let program = one_func_program(func(
        "poke",
        vec![
            local("bytes", Ty::Ref(RefTy::Array(ElemKind::Prim(PrimKind::U8)))),
            local("objs", Ty::Ref(RefTy::Vec)),
        ],
        2,
        Ty::Unit,
        vec![
            // bytes[1] = 7  →  bytes.set(1, 7)
            Stmt::IndexAssign {
                recv: Expr::Local(0),
                recv_ty: RefTy::Array(ElemKind::Prim(PrimKind::U8)),
                index: Expr::I64(1),
                value: Expr::U8(7),
            },
            // objs[0]  →  objs.get(0)
            Stmt::Expr(Expr::Index {
                recv: Box::new(Expr::Local(1)),
                recv_ty: RefTy::Vec,
                index: Box::new(Expr::I64(0)),
            }),
            // bytes[0:1]  →  bytes.slice(0, 1)
            Stmt::Expr(Expr::Slice {
                recv: Box::new(Expr::Local(0)),
                recv_ty: RefTy::Array(ElemKind::Prim(PrimKind::U8)),
                start: Box::new(Expr::I64(0)),
                end: Box::new(Expr::I64(1)),
            }),
        ],
    ));
    let asm = emit(&program);

    assert!(asm.contains("call rt_array_set_u8"));
    assert!(asm.contains("call rt_vec_get"));
    assert!(asm.contains("call rt_array_slice_u8"));
}

#[test]
fn field_access_emits_a_null_check() {
    let program = Program {
        classes: vec![ClassDef {
            name: "Cell".into(),
            fields: vec![FieldDef {
                name: "v".into(),
                ty: Ty::Prim(PrimKind::I64),
            }],
        }],
        globals: vec![],
        funcs: vec![func(
            "read",
            vec![local("c", Ty::Ref(RefTy::Class(0)))],
            1,
            Ty::Prim(PrimKind::I64),
            vec![Stmt::Return(Some(Expr::GetField {
                obj: Box::new(Expr::Local(0)),
                class: 0,
                field: 0,
            }))],
        )],
        entry: 0,
    };
    let asm = emit(&program);

    let check = idx(&asm, "test rax, rax");
    let jump = idx(&asm, "je .Lnull_read");
    let stub = idx(&asm, "call rt_panic_null_deref");
    assert!(check < jump && jump < stub);
    // The typed load uses the payload offset.
    assert!(asm.contains("mov rax, qword ptr [rax+24]"));
}

#[test]
fn downcast_emits_checked_cast_against_the_descriptor() {
    let program = one_func_program(func(
        "narrow",
        vec![
            local("o", Ty::Ref(RefTy::Obj)),
            local("s", Ty::Ref(RefTy::Str)),
        ],
        1,
        Ty::Unit,
        vec![Stmt::Assign(
            1,
            Expr::Cast {
                obj: Box::new(Expr::Local(0)),
                to: RefTy::Str,
            },
        )],
    ));
    let asm = emit(&program);

    assert!(asm.contains("lea rsi, [rip+rt_type_str]"));
    assert!(asm.contains("call rt_checked_cast"));
}

#[test]
fn reference_globals_are_registered_roots() {
    let program = Program {
        classes: vec![],
        globals: vec![
            GlobalDef {
                name: "cache".into(),
                ty: Ty::Ref(RefTy::Vec),
            },
            GlobalDef {
                name: "counter".into(),
                ty: Ty::Prim(PrimKind::I64),
            },
        ],
        funcs: vec![func("start", vec![], 0, Ty::Unit, vec![])],
        entry: 0,
    };
    let asm = emit(&program);

    let init = idx(&asm, "call rt_init");
    let register = idx(&asm, "call rt_gc_register_global_root");
    let entry = idx(&asm, "call nfl_start");
    let unregister = idx(&asm, "call rt_gc_unregister_global_root");
    let shutdown = idx(&asm, "call rt_shutdown");
    assert!(init < register && register < entry);
    assert!(entry < unregister && unregister < shutdown);

    // Only the reference global becomes a root; both get .bss cells.
    assert_eq!(count(&asm, "call rt_gc_register_global_root"), 1);
    assert!(asm.contains("nfl_g_cache:"));
    assert!(asm.contains("nfl_g_counter:"));
}

#[test]
fn builtin_call_spills_receiver_and_arguments_first() {
    let program = one_func_program(func(
        "feed",
        vec![
            local("v", Ty::Ref(RefTy::Vec)),
            local("x", Ty::Ref(RefTy::Obj)),
        ],
        2,
        Ty::Unit,
        vec![Stmt::Expr(Expr::MethodCall {
            recv: Box::new(Expr::Local(0)),
            recv_ty: RefTy::Vec,
            method: "push".into(),
            args: vec![Expr::Local(1)],
        })],
    ));
    let asm = emit(&program);

    let push_call = idx(&asm, "call rt_vec_push");
    // Receiver and argument are both spilled to root slots before the
    // safepoint (besides the two parameter spills in the prologue).
    let spills_before = asm[..push_call].matches("call rt_root_slot_store").count();
    assert!(
        spills_before >= 4,
        "expected parameter + staging spills before rt_vec_push, found {spills_before}"
    );
    // The entry takes the thread state first.
    let window = &asm[push_call.saturating_sub(400)..push_call];
    assert!(window.contains("mov rdi, rbx"));
}

#[test]
fn seven_integer_arguments_are_rejected() {
    let callee = func(
        "wide",
        (0..7)
            .map(|i| local(&format!("a{i}"), Ty::Prim(PrimKind::I64)))
            .collect(),
        7,
        Ty::Unit,
        vec![],
    );
    let caller = func(
        "caller",
        vec![],
        0,
        Ty::Unit,
        vec![Stmt::Expr(Expr::Call {
            func: 0,
            args: (0..7).map(Expr::I64).collect(),
        })],
    );
    let program = Program {
        classes: vec![],
        globals: vec![],
        funcs: vec![callee, caller],
        entry: 1,
    };
    let err = emit_program(&program, &CodegenOptions::default()).unwrap_err();
    assert!(matches!(err, CodegenError::TooManyIntArgs { count: 7, .. }));
}

#[test]
fn trace_frames_bracket_the_body_when_enabled() {
    let mut f = func(
        "traced",
        vec![local("s", Ty::Ref(RefTy::Str))],
        0,
        Ty::Unit,
        vec![Stmt::Assign(0, Expr::StrLit("x".into()))],
    );
    f.src = Some(niflheim_codegen::ir::SrcLoc {
        file: "demo.nfl".into(),
        line: 4,
        col: 1,
    });
    let program = one_func_program(f);
    let asm = emit_program(
        &program,
        &CodegenOptions {
            emit_comments: false,
            emit_trace_frames: true,
        },
    )
    .expect("emission should succeed");

    let push = idx(&asm, "call rt_trace_push");
    let body = idx(&asm, "call rt_str_from_bytes");
    let pop = idx(&asm, "call rt_trace_pop");
    assert!(push < body && body < pop);
    assert!(asm.contains(".asciz \"demo.nfl\""));
}

#[test]
fn user_constructor_roots_the_fresh_object_before_initializers() {
    let program = Program {
        classes: vec![ClassDef {
            name: "Pair".into(),
            fields: vec![
                FieldDef {
                    name: "a".into(),
                    ty: Ty::Ref(RefTy::Str),
                },
                FieldDef {
                    name: "b".into(),
                    ty: Ty::Prim(PrimKind::I64),
                },
            ],
        }],
        globals: vec![],
        funcs: vec![func(
            "build",
            vec![local("p", Ty::Ref(RefTy::Class(0)))],
            0,
            Ty::Unit,
            vec![Stmt::Assign(
                0,
                Expr::New {
                    class: 0,
                    inits: vec![Expr::StrLit("name".into()), Expr::I64(3)],
                },
            )],
        )],
        entry: 0,
    };
    let asm = emit(&program);

    let alloc = idx(&asm, "call rt_alloc_obj");
    // The object is spilled to a root slot before the first initializer's
    // own allocating call runs.
    let spill = asm[alloc..]
        .find("call rt_root_slot_store")
        .map(|i| i + alloc)
        .expect("fresh object must be rooted");
    let init_alloc = asm[alloc..]
        .find("call rt_str_from_bytes")
        .map(|i| i + alloc)
        .expect("initializer must run after allocation");
    assert!(spill < init_alloc);
    assert!(asm.contains("lea rsi, [rip+nfl_type_Pair]"));
}

//! End-to-end generator scenarios over the text back end.

mod common;

use common::*;
use obx_cil::ast::*;

#[test]
fn empty_module_yields_cctor_and_ping_only() {
    let md = Module::new("M", "M.obx");
    let il = render_module(&md);

    assert!(il.contains(".class public sealed 'M' extends [mscorlib]System.Object {"));
    assert!(il
        .contains(".method assembly specialname rtspecialname static void .cctor() cil managed {"));
    assert!(il.contains(".method public static void 'ping#'() cil managed {"));
    assert!(!il.contains(".class nested"), "no other classes expected");
    assert!(il.contains(".assembly extern 'mscorlib' {}"));
    assert!(il.contains(".assembly extern 'OBX.Runtime' {}"));
}

#[test]
fn module_variables_are_zero_initialized_in_the_cctor() {
    let mut md = Module::new("M", "M.obx");
    module_var(&mut md, "x", int_ty());
    let il = render_module(&md);

    assert!(il.contains(".field assembly static int32 'x'"));
    assert!(il.contains("stsfld int32 'M'::'x'"));
}

#[test]
fn derived_record_copy_chains_to_its_base() {
    let mut md = Module::new("M", "M.obx");
    let (base, _) = named_record(&mut md, "Base", None, &[("x", int_ty())]);
    let (_derived, _) = named_record(&mut md, "Derived", Some(base), &[("y", int_ty())]);
    let il = render_module(&md);

    assert!(il.contains(".class nested public 'Base' extends [mscorlib]System.Object {"));
    assert!(il.contains(".class nested public 'Derived' extends class 'M'/'Base' {"));
    // constructor chains to the base constructor
    assert!(il.contains("call void class 'M'/'Base'::.ctor()"));
    // the copy method calls the base copy first, then copies own fields
    let copy_call = "call void class 'M'/'Base'::'#copy'(class 'M'/'Base')";
    assert!(il.contains(copy_call));
    let y_load = "ldfld int32 'M'/'Derived'::'y'";
    let y_store = "stfld int32 'M'/'Derived'::'y'";
    assert!(il.contains(y_load));
    assert!(il.contains(y_store));
    // the constructor also stores `y`; the copy-method store is the last
    assert!(
        il.find(copy_call).unwrap() < il.rfind(y_store).unwrap(),
        "base copy precedes field copies"
    );
}

#[test]
fn open_array_value_parameter_is_copied_in_the_prologue() {
    let mut md = Module::new("M", "M.obx");
    let chars = md.add_type(Type::new(TypeDesc::Array {
        elem: char_ty(),
        len: None,
    }));
    let s = value_param(&mut md, "s", chars, 0);
    procedure(&mut md, "P", &[s], None, vec![]);
    let il = render_module(&md);

    // prologue: read the actual's length, allocate, copy, rebind
    assert!(il.contains(".method public static void 'P'(char[] 's') cil managed {"));
    assert!(il.contains("ldlen"));
    assert!(il.contains("newarr char"));
    assert!(il.contains("call void 'M'::'#copy'(char[], char[])"));
    assert!(il.contains("starg 0"));
    // the one-dimensional copier is generated on demand
    assert!(il.contains(".method public static void '#copy'(char[] lhs, char[] rhs) cil managed {"));
}

#[test]
fn set_literals_and_intersection_lower_to_runtime_masks() {
    let mut md = Module::new("M", "M.obx");
    let s = module_var(&mut md, "s", set_ty());

    let first = Expr::new(
        ExprKind::Set {
            parts: vec![
                SetPart::Elem(int_lit(0)),
                SetPart::Range(int_lit(2), int_lit(4)),
            ],
        },
        set_ty(),
        loc(5, 8),
    );
    let second = Expr::new(
        ExprKind::Set {
            parts: vec![SetPart::Elem(int_lit(3))],
        },
        set_ty(),
        loc(5, 20),
    );
    let product = binary(BinOp::Mul, BaseKind::Set, set_ty(), first, second);
    let lhs = ident(&md, s);
    md.body.push(assign(lhs, product));
    let il = render_module(&md);

    let elem = "call int32 [OBX.Runtime]OBX.Runtime::addElemToSet(int32, int32)";
    let range = "call int32 [OBX.Runtime]OBX.Runtime::addRangeToSet(int32, int32, int32)";
    assert_eq!(il.matches(elem).count(), 2);
    assert_eq!(il.matches(range).count(), 1);
    let and_pos = il.find("\n        and\n").expect("intersection lowers to and");
    assert!(il.rfind(elem).unwrap() < and_pos, "sets are built before the and");
}

#[test]
fn bound_procedure_value_materializes_a_delegate() {
    let mut md = Module::new("M", "M.obx");
    let (rid, _) = named_record(&mut md, "R", None, &[]);

    // type-bound procedure Mth on R
    let bound_pt = md.add_type(Type::new(TypeDesc::Proc(ProcSig {
        formals: vec![],
        ret: None,
        type_bound: true,
    })));
    let recv = md.add_decl(Decl {
        name: "self".to_string(),
        kind: DeclKind::Param {
            slot: 0,
            var: false,
            is_const: false,
        },
        ty: rid,
        visibility: Visibility::Private,
        loc: loc(4, 1),
        module: None,
        scope: None,
    });
    let mth = md.add_decl(Decl {
        name: "Mth".to_string(),
        kind: DeclKind::Proc(Box::new(ProcDecl {
            receiver: Some(recv),
            receiver_rec: Some(rid),
            super_proc: None,
            order: vec![],
            body: vec![],
            end_loc: loc(6, 1),
            var_count: 0,
        })),
        ty: bound_pt,
        visibility: Visibility::ReadWrite,
        loc: loc(4, 1),
        module: None,
        scope: None,
    });
    if let TypeDesc::Record(r) = &mut md.types[rid.0 as usize].desc {
        r.methods.push(mth);
    }

    // a procedure-type variable and a record instance
    let var_pt = md.add_type(Type::new(TypeDesc::Proc(ProcSig {
        formals: vec![],
        ret: None,
        type_bound: true,
    })));
    let v = module_var(&mut md, "v", var_pt);
    let obj = module_var(&mut md, "obj", rid);

    let rhs = Expr::new(
        ExprKind::Select {
            sub: Box::new(ident(&md, obj)),
            decl: mth,
        },
        bound_pt,
        loc(7, 6),
    );
    let lhs = ident(&md, v);
    md.body.push(assign(lhs, rhs));
    let il = render_module(&md);

    assert!(il.contains("ldsfld class 'M'/'R' 'M'::'obj'"));
    assert!(il.contains("\n        dup\n"));
    assert!(il.contains("ldvirtftn void 'M'/'R'::'Mth'()"));
    assert!(il.contains("::.ctor(object, native unsigned int)"));
    assert!(il.contains("stind.ref"));
    assert!(il.contains("extends [mscorlib]System.MulticastDelegate"));
    // the bound method itself dispatches virtually
    assert!(il.contains(".method public virtual instance void 'Mth'() cil managed {"));
}

#[test]
fn integer_division_goes_through_the_euclidean_helper() {
    let mut md = Module::new("M", "M.obx");
    let q = module_var(&mut md, "q", int_ty());
    let a = module_var(&mut md, "a", int_ty());
    let b = module_var(&mut md, "b", int_ty());

    let quotient = binary(
        BinOp::Div,
        BaseKind::Integer,
        int_ty(),
        ident(&md, a),
        ident(&md, b),
    );
    let lhs = ident(&md, q);
    md.body.push(assign(lhs, quotient));
    let il = render_module(&md);

    assert!(il.contains("call int32 [OBX.Runtime]OBX.Runtime::DIV(int32,int32)"));
    assert!(!il.contains("\n        div\n"), "DIV must not use the raw opcode");
}

#[test]
fn nested_loops_exit_to_their_own_labels() {
    let mut md = Module::new("M", "M.obx");
    let inner = Stmt::new(
        StmtKind::If(IfStmt {
            kind: IfKind::Loop,
            conds: vec![],
            blocks: vec![vec![Stmt::new(StmtKind::Exit, loc(3, 3))]],
            else_block: vec![],
        }),
        loc(2, 3),
    );
    let outer = Stmt::new(
        StmtKind::If(IfStmt {
            kind: IfKind::Loop,
            conds: vec![],
            blocks: vec![vec![inner, Stmt::new(StmtKind::Exit, loc(4, 3))]],
            else_block: vec![],
        }),
        loc(2, 1),
    );
    md.body.push(outer);
    let il = render_module(&md);

    // outer loop allocates labels 0/1, inner 2/3; each EXIT branches to
    // the exit label of its own loop
    assert!(il.contains("br '#3'"), "inner EXIT targets the inner label");
    assert!(il.contains("br '#1'"), "outer EXIT targets the outer label");
}

#[test]
fn structured_returns_copy_into_a_fresh_instance() {
    let mut md = Module::new("M", "M.obx");
    let (rid, _) = named_record(&mut md, "R", None, &[("x", int_ty())]);
    let r0 = module_var(&mut md, "r0", rid);
    let ret_expr = ident(&md, r0);
    procedure(
        &mut md,
        "F",
        &[],
        Some(rid),
        vec![Stmt::new(StmtKind::Return(Some(ret_expr)), loc(8, 3))],
    );
    let il = render_module(&md);

    let ctor = "newobj void class 'M'/'R'::.ctor()";
    let copy = "callvirt void class 'M'/'R'::'#copy'(class 'M'/'R')";
    assert!(il.contains(ctor));
    assert!(il.contains(copy));
    assert!(il.contains(".method public static class 'M'/'R' 'F'() cil managed {"));
}

#[test]
fn while_loops_lower_to_guarded_exits() {
    let mut md = Module::new("M", "M.obx");
    let i = module_var(&mut md, "i", int_ty());
    let cond = binary(
        BinOp::Lt,
        BaseKind::Integer,
        bool_ty(),
        ident(&md, i),
        int_lit(10),
    );
    let bump = binary(
        BinOp::Add,
        BaseKind::Integer,
        int_ty(),
        ident(&md, i),
        int_lit(1),
    );
    let lhs = ident(&md, i);
    let body = vec![assign(lhs, bump)];
    md.body.push(Stmt::new(
        StmtKind::If(IfStmt {
            kind: IfKind::While,
            conds: vec![cond],
            blocks: vec![body],
            else_block: vec![],
        }),
        loc(3, 1),
    ));
    let il = render_module(&md);

    assert!(il.contains("clt"));
    assert!(il.contains("brfalse"));
    // the rewritten loop jumps back to its start label
    assert!(il.contains("br '#0'"));
}

#[test]
fn output_is_deterministic_across_runs() {
    let build = || {
        let mut md = Module::new("M", "M.obx");
        let (base, _) = named_record(&mut md, "Base", None, &[("x", int_ty())]);
        named_record(&mut md, "Derived", Some(base), &[("y", int_ty())]);
        module_var(&mut md, "s", set_ty());
        md
    };
    let one = render_module(&build());
    let two = render_module(&build());
    assert_eq!(one, two);
}

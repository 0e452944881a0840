//! Shared helpers for the integration tests: compact construction of
//! validated module ASTs and rendering through the text back end.

#![allow(dead_code)]

use obx_cil::ast::*;
use obx_cil::diagnostics::Errors;
use obx_cil::il::{IlAsmRenderer, IlEmitter};

pub fn loc(row: u32, col: u32) -> RowCol {
    RowCol::new(row, col)
}

/// Renders a module through the ILASM text back end, asserting a clean
/// translation.
pub fn render_module(md: &Module) -> String {
    let _quiet = obx_cil::diagnostics::suppress();
    let mut renderer = IlAsmRenderer::new(Vec::new());
    let errs = Errors::silent();
    let had_errors = {
        let mut emitter = IlEmitter::new(&mut renderer);
        obx_cil::translate(md, &mut emitter, &errs)
    };
    assert!(!had_errors, "translation reported errors");
    String::from_utf8(renderer.into_inner()).expect("renderer output is UTF-8")
}

pub fn int_ty() -> TypeId {
    Module::base(BaseKind::Integer)
}

pub fn bool_ty() -> TypeId {
    Module::base(BaseKind::Bool)
}

pub fn set_ty() -> TypeId {
    Module::base(BaseKind::Set)
}

pub fn char_ty() -> TypeId {
    Module::base(BaseKind::Char)
}

/// Adds a module-level variable and registers it in declaration order.
pub fn module_var(md: &mut Module, name: &str, ty: TypeId) -> DeclId {
    let d = md.add_decl(Decl {
        name: name.to_string(),
        kind: DeclKind::Variable,
        ty,
        visibility: Visibility::Private,
        loc: loc(2, 1),
        module: None,
        scope: None,
    });
    md.order.push(d);
    d
}

/// Adds a named record type with the given own fields; returns the record
/// type and its field declarations.
pub fn named_record(
    md: &mut Module,
    name: &str,
    base: Option<TypeId>,
    fields: &[(&str, TypeId)],
) -> (TypeId, Vec<DeclId>) {
    let rid = md.add_type(Type::new(TypeDesc::Record(RecordDesc {
        base,
        fields: Vec::new(),
        methods: Vec::new(),
        by_value: false,
        decl: None,
    })));
    let mut field_ids = Vec::new();
    for (fname, fty) in fields {
        let f = md.add_decl(Decl {
            name: fname.to_string(),
            kind: DeclKind::Field { owner: rid },
            ty: *fty,
            visibility: Visibility::ReadWrite,
            loc: loc(3, 1),
            module: None,
            scope: None,
        });
        field_ids.push(f);
    }
    let decl = md.add_decl(Decl {
        name: name.to_string(),
        kind: DeclKind::NamedType,
        ty: rid,
        visibility: Visibility::ReadWrite,
        loc: loc(3, 1),
        module: None,
        scope: None,
    });
    md.order.push(decl);
    if let TypeDesc::Record(r) = &mut md.types[rid.0 as usize].desc {
        r.fields = field_ids.clone();
        r.decl = Some(decl);
    }
    (rid, field_ids)
}

/// Adds a module-level procedure with the given formals and body.
pub fn procedure(
    md: &mut Module,
    name: &str,
    formals: &[DeclId],
    ret: Option<TypeId>,
    body: Vec<Stmt>,
) -> DeclId {
    let pt = md.add_type(Type::new(TypeDesc::Proc(ProcSig {
        formals: formals.to_vec(),
        ret,
        type_bound: false,
    })));
    let locals: Vec<DeclId> = Vec::new();
    let d = md.add_decl(Decl {
        name: name.to_string(),
        kind: DeclKind::Proc(Box::new(ProcDecl {
            receiver: None,
            receiver_rec: None,
            super_proc: None,
            order: formals.iter().chain(locals.iter()).copied().collect(),
            body,
            end_loc: loc(9, 1),
            var_count: 0,
        })),
        ty: pt,
        visibility: Visibility::ReadWrite,
        loc: loc(4, 1),
        module: None,
        scope: None,
    });
    md.order.push(d);
    d
}

/// Adds a value parameter declaration (slot preassigned by validation).
pub fn value_param(md: &mut Module, name: &str, ty: TypeId, slot: u16) -> DeclId {
    md.add_decl(Decl {
        name: name.to_string(),
        kind: DeclKind::Param {
            slot,
            var: false,
            is_const: false,
        },
        ty,
        visibility: Visibility::Private,
        loc: loc(4, 10),
        module: None,
        scope: None,
    })
}

pub fn ident(md: &Module, d: DeclId) -> Expr {
    Expr::new(ExprKind::Ident(d), md.decl(d).ty, loc(5, 1))
}

pub fn int_lit(v: i64) -> Expr {
    Expr::new(ExprKind::Literal(Value::Int(v)), int_ty(), loc(5, 5))
}

pub fn assign(lhs: Expr, rhs: Expr) -> Stmt {
    Stmt::new(StmtKind::Assign { lhs, rhs }, loc(6, 1))
}

pub fn binary(op: BinOp, base: BaseKind, ty: TypeId, lhs: Expr, rhs: Expr) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            base,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        ty,
        loc(5, 3),
    )
}

//! Expression lowering. Emission order is the depth-first post-order of
//! the expression tree; every helper leaves exactly its result value on
//! the stack.

use crate::ast::{
    BaseKind, BinOp, Builtin, DeclKind, Expr, ExprKind, RowCol, SetPart, TypeDesc, TypeId, UnOp,
    Value,
};
use crate::diagnostics::Diagnostic;
use crate::il::ConvKind;
use crate::il::IndKind;

use super::CodeGen;

impl<'a, 'e> CodeGen<'a, 'e> {
    pub(crate) fn lower_expr(&mut self, e: &Expr) -> Result<(), Diagnostic> {
        let md = self.md;
        match &e.kind {
            ExprKind::Literal(v) => {
                let kind = md
                    .base_kind(e.ty)
                    .expect("literal with non-basic type");
                self.emit_const(kind, v, e.loc);
                Ok(())
            }
            ExprKind::Ident(d) => {
                match &md.decl(*d).kind {
                    DeclKind::Const { value } => {
                        let kind = md
                            .base_kind(e.ty)
                            .expect("constant with non-basic type");
                        let value = value.clone();
                        self.emit_const(kind, &value, e.loc);
                    }
                    DeclKind::Variable | DeclKind::LocalVar { .. } => {
                        self.emit_var_to_stack(*d, e.loc);
                    }
                    DeclKind::Param { .. } => {
                        self.emit_var_to_stack(*d, e.loc);
                        if self.pass_by_ref(*d) {
                            // the slot holds an address; fetch the value
                            self.emit_byref_fetch(md.decl(*d).ty, e.loc);
                        }
                    }
                    // imports, type names, procedures and built-ins leave
                    // nothing on the stack by themselves
                    DeclKind::Import
                    | DeclKind::NamedType
                    | DeclKind::Builtin(_)
                    | DeclKind::Proc(_) => {}
                    other => panic!("identifier names {:?}", other),
                }
                Ok(())
            }
            ExprKind::Select { sub, decl } => {
                self.lower_expr(sub)?;
                match &md.decl(*decl).kind {
                    DeclKind::Proc(_) | DeclKind::NamedType | DeclKind::Builtin(_) => {}
                    DeclKind::Field { .. } | DeclKind::Variable => {
                        self.emit_var_to_stack(*decl, e.loc);
                    }
                    DeclKind::Const { value } => {
                        let kind = md
                            .base_kind(e.ty)
                            .expect("constant with non-basic type");
                        let value = value.clone();
                        self.emit_const(kind, &value, e.loc);
                    }
                    other => panic!("selection names {:?}", other),
                }
                Ok(())
            }
            ExprKind::Unary { op, sub } => {
                self.lower_expr(sub)?;
                match op {
                    UnOp::Neg => {
                        if md.is_set(sub.ty) {
                            self.line(e.loc).not();
                        } else {
                            self.line(e.loc).neg();
                        }
                    }
                    UnOp::Not => {
                        self.line(e.loc).ldc_i4(0);
                        self.line(e.loc).ceq();
                    }
                    // pointer deref and address-of change the view, not
                    // the value; super-calls are handled at the call site
                    UnOp::Deref | UnOp::AddrOf => {}
                }
                Ok(())
            }
            ExprKind::Binary { op, base, lhs, rhs } => self.lower_binary(e, *op, *base, lhs, rhs),
            ExprKind::Set { parts } => {
                self.line(e.loc).ldc_i4(0);
                for part in parts {
                    match part {
                        SetPart::Range(lo, hi) => {
                            self.lower_expr(lo)?;
                            self.lower_expr(hi)?;
                            self.line(e.loc).call(
                                "int32 [OBX.Runtime]OBX.Runtime::addRangeToSet(int32, int32, int32)",
                                3,
                                true,
                                false,
                            );
                        }
                        SetPart::Elem(el) => {
                            self.lower_expr(el)?;
                            self.line(e.loc).call(
                                "int32 [OBX.Runtime]OBX.Runtime::addElemToSet(int32, int32)",
                                2,
                                true,
                                false,
                            );
                        }
                    }
                }
                Ok(())
            }
            ExprKind::Index { sub, index } => {
                self.lower_expr(sub)?;
                self.lower_expr(index)?;
                let elem = match &md.ty(md.derefed(sub.ty)).desc {
                    TypeDesc::Array { elem, .. } => *elem,
                    other => panic!("index into {:?}", other),
                };
                let spelling = self.format_type(Some(md.derefed(elem)));
                self.line(e.loc).ldelem(&spelling);
                Ok(())
            }
            ExprKind::Call { .. } => self.emit_call(e),
            ExprKind::Cast { sub } => self.lower_expr(sub),
        }
    }

    /// Pushes the address of a designator. With `omit_params`, by-ref
    /// parameters already hold an address in their slot and are loaded
    /// plainly.
    pub(crate) fn emit_fetch_desig_addr(
        &mut self,
        desig: &Expr,
        omit_params: bool,
    ) -> Result<(), Diagnostic> {
        let md = self.md;
        match &desig.kind {
            ExprKind::Select { sub, decl } => {
                self.lower_expr(sub)?;
                match &md.decl(*decl).kind {
                    DeclKind::Variable => {
                        let r = self.member_ref(*decl);
                        self.line(desig.loc).ldsflda(&r);
                    }
                    DeclKind::Field { .. } => {
                        let r = self.member_ref(*decl);
                        self.line(desig.loc).ldflda(&r);
                    }
                    other => panic!("address of selected {:?}", other),
                }
                Ok(())
            }
            ExprKind::Index { sub, index } => {
                self.lower_expr(sub)?;
                self.lower_expr(index)?;
                let spelling = self.format_type(Some(md.derefed(desig.ty)));
                self.line(desig.loc).ldelema(&spelling);
                Ok(())
            }
            ExprKind::Cast { sub } => self.emit_fetch_desig_addr(sub, omit_params),
            ExprKind::Unary {
                op: UnOp::Deref,
                sub,
            } => self.emit_fetch_desig_addr(sub, omit_params),
            ExprKind::Ident(d) => {
                match md.decl(*d).kind {
                    DeclKind::Variable => {
                        let r = self.member_ref(*d);
                        self.line(desig.loc).ldsflda(&r);
                    }
                    DeclKind::Param { slot, .. } => {
                        if omit_params && self.pass_by_ref(*d) {
                            // the argument slot already holds the address
                            self.line(desig.loc).ldarg(slot);
                        } else {
                            self.line(desig.loc).ldarga(slot);
                        }
                    }
                    DeclKind::LocalVar { slot } => {
                        self.line(desig.loc).ldloca(slot);
                    }
                    ref other => panic!("address of {:?}", other),
                }
                Ok(())
            }
            ExprKind::Literal(Value::Nil) => {
                // interop idiom: NIL stands in for an absent VAR actual
                self.line(desig.loc).ldnull();
                Ok(())
            }
            ExprKind::Call { sub, args } => {
                // only VAL(T, x) reaches here as a designator
                let is_val = sub
                    .ident()
                    .map(|d| matches!(md.decl(d).kind, DeclKind::Builtin(Builtin::Val)))
                    .unwrap_or(false);
                assert!(is_val && args.len() == 2, "address of call expression");
                self.emit_fetch_desig_addr(&args[1], omit_params)
            }
            other => panic!("address of non-designator {:?}", other),
        }
    }

    /// Implicit conversions applied to a value about to be bound to a
    /// formal or stored into a location of type `tf`.
    pub(crate) fn prepare_rhs(&mut self, tf: TypeId, ea: &Expr, loc: RowCol) -> Result<(), Diagnostic> {
        let md = self.md;
        let tf = md.derefed(tf);
        let ta = md.derefed(ea.ty);

        if md.is_char(tf) && !md.is_char(ta) {
            // a length-one string collapses to its first character
            self.line(loc).ldc_i4(0);
            self.line(loc).ldelem("char");
        } else if md.is_text(tf) && !md.is_char(tf) && md.is_char(ta) {
            self.line(loc)
                .call("char[] [OBX.Runtime]OBX.Runtime::toString(char)", 1, true, false);
        } else if md.is_proc_type(tf) {
            let named_proc = ea
                .ident()
                .filter(|d| matches!(md.decl(*d).kind, DeclKind::Proc(_)));
            if let Some(n) = named_proc {
                // materialize a delegate around the procedure value
                let bound = md.proc_sig(ta).type_bound;
                let deleg = self.delegate_ref(tf);
                let ctor = format!(
                    "void class {}::.ctor(object, native unsigned int)",
                    deleg
                );
                if bound {
                    self.line(loc).dup();
                    let mref = self.member_ref(n);
                    self.line(loc).ldvirtftn(&mref);
                    self.line(loc).newobj(&ctor, 2);
                } else {
                    self.line(loc).ldnull();
                    let mref = self.member_ref(n);
                    self.line(loc).ldftn(&mref);
                    self.line(loc).newobj(&ctor, 2);
                }
            }
            // otherwise a delegate value is being copied as-is
        }
        Ok(())
    }

    pub(crate) fn emit_call(&mut self, e: &Expr) -> Result<(), Diagnostic> {
        let md = self.md;
        let (sub, args) = match &e.kind {
            ExprKind::Call { sub, args } => (sub.as_ref(), args.as_slice()),
            other => panic!("emit_call on {:?}", other),
        };
        self.lower_expr(sub)?;

        // a call through a super-deref designator targets the overridden
        // procedure and bypasses virtual dispatch
        let mut super_call = false;
        let mut func = sub.ident();
        if let ExprKind::Unary {
            op: UnOp::Deref,
            sub: inner,
        } = &sub.kind
        {
            if let Some(d) = inner.ident() {
                if let DeclKind::Proc(p) = &md.decl(d).kind {
                    if let Some(sup) = p.super_proc {
                        func = Some(sup);
                        super_call = true;
                    }
                }
            }
        }

        if let Some(f) = func {
            if let DeclKind::Builtin(b) = md.decl(f).kind {
                return self.emit_builtin(b, args, e);
            }
            if !matches!(md.decl(f).kind, DeclKind::Proc(_)) {
                func = None; // a procedure-typed value, called indirectly
            }
        }

        let pt = md.derefed(sub.ty);
        let sig = md.proc_sig(pt).clone();
        assert!(sig.formals.len() <= args.len());

        for (i, p) in sig.formals.iter().enumerate() {
            let tf = md.derefed(md.decl(*p).ty);
            if self.pass_by_ref(*p) {
                self.emit_fetch_desig_addr(&args[i], true)?;
            } else {
                if let TypeDesc::Array { elem, .. } = &md.ty(tf).desc {
                    // the legacy VAR ARRAY OF BYTE trick cannot be
                    // expressed against the managed heap
                    let formal_elem = md.base_kind(*elem) == Some(BaseKind::Byte);
                    let actual_elem = match &md.ty(md.derefed(args[i].ty)).desc {
                        TypeDesc::Array { elem, .. } => {
                            md.base_kind(*elem) == Some(BaseKind::Byte)
                        }
                        _ => false,
                    };
                    if formal_elem && !actual_elem {
                        self.generator_error(
                            "cannot generate code for VAR ARRAY OF BYTE over a non-byte actual",
                            args[i].loc,
                        );
                        continue;
                    }
                }
                self.lower_expr(&args[i])?;
                self.prepare_rhs(tf, &args[i], args[i].loc)?;
            }
        }

        let has_ret = sig.ret.is_some();
        let argc = sig.formals.len() as u16;
        match func {
            Some(f) => {
                let mref = self.member_ref(f);
                if sig.type_bound && !super_call {
                    self.line(e.loc).callvirt(&mref, argc, has_ret);
                } else {
                    let total = argc + sig.type_bound as u16;
                    self.line(e.loc).call(&mref, total, has_ret, sig.type_bound);
                }
            }
            None => {
                let ret = self.format_type(sig.ret);
                let deleg = self.delegate_ref(pt);
                let formals = self.format_formals(&sig.formals, false);
                let what = format!("{} class {}::Invoke{}", ret, deleg, formals);
                self.line(e.loc).callvirt(&what, argc, has_ret);
            }
        }
        Ok(())
    }

    fn lower_binary(
        &mut self,
        e: &Expr,
        op: BinOp,
        base: BaseKind,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), Diagnostic> {
        let md = self.md;
        let arith_rel = base != BaseKind::None
            && matches!(
                op,
                BinOp::Add
                    | BinOp::Sub
                    | BinOp::Mul
                    | BinOp::FDiv
                    | BinOp::Div
                    | BinOp::Mod
                    | BinOp::Eq
                    | BinOp::Neq
                    | BinOp::Lt
                    | BinOp::Leq
                    | BinOp::Gt
                    | BinOp::Geq
            );

        self.lower_expr(lhs)?;
        if arith_rel {
            self.convert_to(base, lhs.ty, lhs.loc);
        }
        // AND and OR evaluate their right side lazily
        if op != BinOp::And && op != BinOp::Or {
            self.lower_expr(rhs)?;
            if arith_rel {
                self.convert_to(base, rhs.ty, rhs.loc);
            }
        }

        let num = md.is_numeric(lhs.ty) && md.is_numeric(rhs.ty);
        let enums = matches!(
            (
                &md.ty(md.derefed(lhs.ty)).desc,
                &md.ty(md.derefed(rhs.ty)).desc
            ),
            (TypeDesc::Enumeration { .. }, TypeDesc::Enumeration { .. })
        );
        let sets = md.is_set(lhs.ty) && md.is_set(rhs.ty);
        let chars = md.is_char(lhs.ty) && md.is_char(rhs.ty);
        let texts = md.is_text(lhs.ty) && md.is_text(rhs.ty);
        let bools = md.base_kind(lhs.ty) == Some(BaseKind::Bool)
            && md.base_kind(rhs.ty) == Some(BaseKind::Bool);
        let nilish = |t: TypeId| {
            md.base_kind(t) == Some(BaseKind::Nil) || md.is_pointer(t) || md.is_proc_type(t)
        };
        let refs = nilish(lhs.ty) && nilish(rhs.ty);
        let loc = e.loc;

        match op {
            BinOp::In => {
                assert!(md.is_integer(lhs.ty) && md.is_set(rhs.ty));
                self.line(loc)
                    .call("bool [OBX.Runtime]OBX.Runtime::IN(int32, int32)", 2, true, false);
            }
            BinOp::Is => {
                let spelling = self.format_type(Some(rhs.ty));
                self.line(loc).isinst(&spelling); // object or null
                self.line(loc).ldnull();
                self.line(loc).ceq();
                self.line(loc).ldc_i4(0);
                self.line(loc).ceq();
            }
            BinOp::Add => {
                if num || enums {
                    self.line(loc).add();
                } else if sets {
                    self.line(loc).or();
                } else if texts {
                    let what = match (md.is_char(lhs.ty), md.is_char(rhs.ty)) {
                        (true, true) => "char[] [OBX.Runtime]OBX.Runtime::join(char,char)",
                        (true, false) => "char[] [OBX.Runtime]OBX.Runtime::join(char,char[])",
                        (false, true) => "char[] [OBX.Runtime]OBX.Runtime::join(char[],char)",
                        (false, false) => "char[] [OBX.Runtime]OBX.Runtime::join(char[],char[])",
                    };
                    self.line(loc).call(what, 2, true, false);
                } else {
                    panic!("ADD over non-addable operands");
                }
            }
            BinOp::Sub => {
                if num || enums {
                    self.line(loc).sub();
                } else if sets {
                    // difference is intersection with the complement
                    self.line(loc).not();
                    self.line(loc).and();
                } else {
                    panic!("SUB over non-subtractable operands");
                }
            }
            BinOp::FDiv => {
                if num {
                    self.line(loc).div();
                } else if sets {
                    // symmetric difference: (a AND b) complemented,
                    // intersected with (a OR b)
                    let rhs_t = self.temps.buy();
                    self.line(loc).stloc(rhs_t);
                    let lhs_t = self.temps.buy();
                    self.line(loc).stloc(lhs_t);
                    self.line(loc).ldloc(lhs_t);
                    self.line(loc).ldloc(rhs_t);
                    self.line(loc).and();
                    self.line(loc).not();
                    self.line(loc).ldloc(lhs_t);
                    self.line(loc).ldloc(rhs_t);
                    self.line(loc).or();
                    self.line(loc).and();
                    self.temps.sell(rhs_t);
                    self.temps.sell(lhs_t);
                }
            }
            BinOp::Mul => {
                if num {
                    self.line(loc).mul();
                } else if sets {
                    self.line(loc).and();
                } else {
                    panic!("MUL over non-multiplicable operands");
                }
            }
            BinOp::Div | BinOp::Mod => {
                assert!(md.is_integer(lhs.ty) && md.is_integer(rhs.ty));
                let narrow = md.base_kind(lhs.ty).map(|k| k <= BaseKind::Integer) == Some(true)
                    && md.base_kind(rhs.ty).map(|k| k <= BaseKind::Integer) == Some(true);
                // Euclidean semantics live in the runtime helpers
                let what = if op == BinOp::Div {
                    if narrow {
                        "int32 [OBX.Runtime]OBX.Runtime::DIV(int32,int32)"
                    } else {
                        "int64 [OBX.Runtime]OBX.Runtime::DIV(int64,int64)"
                    }
                } else if narrow {
                    "int32 [OBX.Runtime]OBX.Runtime::MOD(int32,int32)"
                } else {
                    "int64 [OBX.Runtime]OBX.Runtime::MOD(int64,int64)"
                };
                self.line(loc).call(what, 2, true, false);
            }
            BinOp::And => {
                assert!(bools);
                let after_end = self.em.new_label();
                let set_false = self.em.new_label();
                self.line(loc).brfalse(set_false);
                self.lower_expr(rhs)?;
                self.line(loc).br(after_end);
                self.line(loc).label(set_false);
                self.line(loc).ldc_i4(0);
                self.line(loc).label(after_end);
            }
            BinOp::Or => {
                assert!(bools);
                let after_end = self.em.new_label();
                let set_true = self.em.new_label();
                self.line(loc).brtrue(set_true);
                self.lower_expr(rhs)?;
                self.line(loc).br(after_end);
                self.line(loc).label(set_true);
                self.line(loc).ldc_i4(1);
                self.line(loc).label(after_end);
            }
            BinOp::Eq => {
                if num || bools || sets || chars || enums || refs {
                    self.line(loc).ceq();
                } else if texts {
                    self.string_op(md.is_char(lhs.ty), md.is_char(rhs.ty), 1, loc);
                } else {
                    panic!("EQ over incomparable operands");
                }
            }
            BinOp::Neq => {
                if num || bools || sets || chars || enums || refs {
                    self.line(loc).ceq();
                    self.line(loc).ldc_i4(0);
                    self.line(loc).ceq();
                } else if texts {
                    self.string_op(md.is_char(lhs.ty), md.is_char(rhs.ty), 2, loc);
                } else {
                    panic!("NEQ over incomparable operands");
                }
            }
            BinOp::Lt => {
                if num || enums || chars {
                    self.line(loc).clt();
                } else if texts {
                    self.string_op(md.is_char(lhs.ty), md.is_char(rhs.ty), 3, loc);
                } else {
                    panic!("LT over unordered operands");
                }
            }
            BinOp::Leq => {
                if num || enums || chars {
                    self.line(loc).cgt();
                    self.line(loc).ldc_i4(0);
                    self.line(loc).ceq();
                } else if texts {
                    self.string_op(md.is_char(lhs.ty), md.is_char(rhs.ty), 4, loc);
                } else {
                    panic!("LEQ over unordered operands");
                }
            }
            BinOp::Gt => {
                if num || enums || chars {
                    self.line(loc).cgt();
                } else if texts {
                    self.string_op(md.is_char(lhs.ty), md.is_char(rhs.ty), 5, loc);
                } else {
                    panic!("GT over unordered operands");
                }
            }
            BinOp::Geq => {
                if num || enums || chars {
                    self.line(loc).clt();
                    self.line(loc).ldc_i4(0);
                    self.line(loc).ceq();
                } else if texts {
                    self.string_op(md.is_char(lhs.ty), md.is_char(rhs.ty), 6, loc);
                } else {
                    panic!("GEQ over unordered operands");
                }
            }
            BinOp::Range => panic!("range outside set constructor or case label"),
        }
        Ok(())
    }

    fn emit_builtin(&mut self, b: Builtin, args: &[Expr], e: &Expr) -> Result<(), Diagnostic> {
        let md = self.md;
        let loc = e.loc;
        match b {
            Builtin::Println => {
                let arg = &args[0];
                self.lower_expr(arg)?;
                let t = md.derefed(arg.ty);
                let what = if md.is_text(t) {
                    if md.is_char(t) {
                        "void [mscorlib]System.Console::WriteLine(char)"
                    } else {
                        "void [mscorlib]System.Console::WriteLine(char[])"
                    }
                } else if md.is_integer(t) {
                    if md.base_kind(t).map(|k| k <= BaseKind::Integer) == Some(true) {
                        "void [mscorlib]System.Console::WriteLine(int32)"
                    } else {
                        "void [mscorlib]System.Console::WriteLine(int64)"
                    }
                } else if md.is_real(t) {
                    "void [mscorlib]System.Console::WriteLine(float64)"
                } else if md.is_set(t) {
                    "void [mscorlib]System.Console::WriteLine(uint32)"
                } else if md.base_kind(t) == Some(BaseKind::Bool) {
                    "void [mscorlib]System.Console::WriteLine(bool)"
                } else if matches!(md.ty(t).desc, TypeDesc::Enumeration { .. }) {
                    "void [mscorlib]System.Console::WriteLine(uint32)"
                } else {
                    "void [mscorlib]System.Console::WriteLine(object)"
                };
                self.line(loc).call(what, 1, false, false);
            }
            Builtin::Inc | Builtin::Dec => {
                // INC(x, n) rewrites to x := x + n and recurses
                let target = args[0].clone();
                let step = if args.len() == 1 {
                    Expr::new(ExprKind::Literal(Value::Int(1)), target.ty, target.loc)
                } else {
                    args[1].clone()
                };
                let op = if b == Builtin::Inc {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                let base = md.base_kind(target.ty).unwrap_or(BaseKind::None);
                let sum = Expr::new(
                    ExprKind::Binary {
                        op,
                        base,
                        lhs: Box::new(target.clone()),
                        rhs: Box::new(step),
                    },
                    target.ty,
                    target.loc,
                );
                self.lower_assign(&target, &sum, loc)?;
            }
            Builtin::Trap => self.line(loc).break_(),
            Builtin::TrapIf => {
                self.lower_expr(&args[0])?;
                let at_end = self.em.new_label();
                self.line(loc).brfalse(at_end);
                self.line(loc).break_();
                self.line(loc).label(at_end);
            }
            Builtin::Max | Builtin::Min => self.emit_min_max(b, args, loc)?,
            Builtin::Default => {
                if !self.emit_initializer(args[0].ty, false, args[0].loc, &[])? {
                    self.line(loc).ldnull();
                }
            }
            Builtin::Len => {
                if args.len() > 1 {
                    // the grammar admits LEN(a, dim); the generator only
                    // lowers the one-dimensional form
                    self.generator_error("LEN with a dimension argument is not supported", loc);
                }
                let arg = &args[0];
                let mut t = md.derefed(arg.ty);
                if let TypeDesc::Pointer { to } = &md.ty(t).desc {
                    t = md.derefed(*to);
                }
                if md.is_string(t) {
                    self.lower_expr(arg)?;
                    self.line(loc).call(
                        "int32 [OBX.Runtime]OBX.Runtime::strlen(char[])",
                        1,
                        true,
                        false,
                    );
                } else {
                    let len = match &md.ty(t).desc {
                        TypeDesc::Array { len, .. } => *len,
                        other => panic!("LEN of {:?}", other),
                    };
                    match len {
                        Some(n) if n > 0 => self.line(loc).ldc_i4(n as i32),
                        _ => {
                            self.lower_expr(arg)?;
                            self.line(loc).ldlen();
                        }
                    }
                }
            }
            Builtin::New => {
                let target = &args[0];
                let mut lengths = Vec::new();
                for extra in &args[1..] {
                    self.lower_expr(extra)?;
                    let len = self.temps.buy();
                    lengths.push(len);
                    self.line(loc).stloc(len);
                }
                // a var parameter actual already holds the address
                self.emit_fetch_desig_addr(target, true)?;
                // initialize through the pointer type as written, so a
                // named pointer from another module keeps its home
                self.emit_initializer(target.ty, true, loc, &lengths)?;
                self.line(loc).stind(IndKind::Ref);
                for slot in lengths {
                    self.temps.sell(slot);
                }
            }
            Builtin::Incl | Builtin::Excl => {
                self.emit_fetch_desig_addr(&args[0], true)?;
                self.line(loc).dup();
                self.line(loc).ldind(IndKind::U4);
                self.lower_expr(&args[1])?;
                let what = if b == Builtin::Incl {
                    "int32 [OBX.Runtime]OBX.Runtime::addElemToSet(int32,int32)"
                } else {
                    "int32 [OBX.Runtime]OBX.Runtime::removeElemFromSet(int32,int32)"
                };
                self.line(loc).call(what, 2, true, false);
                self.line(loc).stind(IndKind::I4);
            }
            Builtin::Pack => {
                self.emit_fetch_desig_addr(&args[0], true)?;
                self.lower_expr(&args[1])?;
                self.line(loc).call(
                    "void [OBX.Runtime]OBX.Runtime::PACK(float32&, int32)",
                    2,
                    false,
                    false,
                );
            }
            Builtin::Unpk => {
                self.emit_fetch_desig_addr(&args[0], true)?;
                self.emit_fetch_desig_addr(&args[1], true)?;
                self.line(loc).call(
                    "void [OBX.Runtime]OBX.Runtime::UNPACK(float32&, int32&)",
                    2,
                    false,
                    false,
                );
            }
            Builtin::Ord => {
                self.lower_expr(&args[0])?;
                let t = md.derefed(args[0].ty);
                if md.is_string(t) || md.is_structured(t) {
                    self.line(loc).ldc_i4(0);
                    self.line(loc).ldelem("char");
                }
            }
            Builtin::Chr | Builtin::Adr => {
                self.lower_expr(&args[0])?;
            }
            Builtin::Val => {
                self.lower_expr(&args[1])?;
            }
            Builtin::Flt => {
                self.lower_expr(&args[0])?;
                let bt = md.base_kind(args[0].ty);
                if bt != Some(BaseKind::Real) && bt != Some(BaseKind::LongReal) {
                    if bt == Some(BaseKind::LongInt) {
                        self.line(loc).conv(ConvKind::ToR8);
                    } else {
                        self.line(loc).conv(ConvKind::ToR4);
                    }
                }
            }
            Builtin::Odd => {
                self.lower_expr(&args[0])?;
                self.line(loc)
                    .call("bool [OBX.Runtime]OBX.Runtime::ODD(int32)", 1, true, false);
            }
            Builtin::Abs => {
                self.lower_expr(&args[0])?;
                let what = match md.base_kind(args[0].ty) {
                    Some(BaseKind::LongReal) => "float64 [mscorlib]System.Math::Abs(float64)",
                    Some(BaseKind::Real) => "float32 [mscorlib]System.Math::Abs(float32)",
                    Some(BaseKind::LongInt) => "int64 [mscorlib]System.Math::Abs(int64)",
                    Some(BaseKind::Integer) => "int32 [mscorlib]System.Math::Abs(int32)",
                    Some(BaseKind::ShortInt) | Some(BaseKind::Byte) => {
                        "int16 [mscorlib]System.Math::Abs(int16)"
                    }
                    other => panic!("ABS of {:?}", other),
                };
                self.line(loc).call(what, 1, true, false);
            }
            Builtin::Floor => {
                self.lower_expr(&args[0])?;
                self.line(loc).call(
                    "float64 [mscorlib]System.Math::Floor(float64)",
                    1,
                    true,
                    false,
                );
                self.line(loc).conv(ConvKind::ToI4);
            }
            Builtin::Lsl => {
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.line(loc).shl();
            }
            Builtin::Asr => {
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.line(loc).shr(false);
            }
            Builtin::Ror => {
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.line(loc).shr(true);
            }
            Builtin::BitAnd => {
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.line(loc).and();
            }
            Builtin::BitOr => {
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.line(loc).or();
            }
            Builtin::BitXor => {
                self.lower_expr(&args[0])?;
                self.lower_expr(&args[1])?;
                self.line(loc).xor();
            }
            Builtin::BitNot => {
                self.lower_expr(&args[0])?;
                self.line(loc).not();
            }
            Builtin::Short => {
                self.lower_expr(&args[0])?;
                let conv = match md.base_kind(args[0].ty) {
                    Some(BaseKind::LongInt) => ConvKind::ToI4,
                    Some(BaseKind::Integer) => ConvKind::ToI2,
                    Some(BaseKind::ShortInt) => ConvKind::ToU1,
                    Some(BaseKind::LongReal) => ConvKind::ToR4,
                    other => panic!("SHORT of {:?}", other),
                };
                self.line(loc).conv(conv);
            }
            Builtin::Long => {
                self.lower_expr(&args[0])?;
                let conv = match md.base_kind(args[0].ty) {
                    Some(BaseKind::Integer) => ConvKind::ToI8,
                    Some(BaseKind::ShortInt) => ConvKind::ToI4,
                    Some(BaseKind::Byte) => ConvKind::ToI2,
                    Some(BaseKind::Real) => ConvKind::ToR8,
                    other => panic!("LONG of {:?}", other),
                };
                self.line(loc).conv(conv);
            }
            Builtin::Assert => {
                self.lower_expr(&args[0])?;
                let after = self.em.new_label();
                self.line(loc).brtrue(after);
                let msg = format!("\"assertion failed at line {}\\0\"", loc.row);
                self.line(loc).ldstr(&msg);
                self.line(loc)
                    .newobj("void [mscorlib]System.Exception::.ctor(string)", 1);
                self.line(loc).throw();
                self.line(loc).label(after);
            }
            Builtin::ByteSize => {
                let t = md.derefed(args[0].ty);
                let size = match md.base_kind(t) {
                    Some(BaseKind::Bool) | Some(BaseKind::Char) | Some(BaseKind::Byte) => 1,
                    Some(BaseKind::WChar) | Some(BaseKind::ShortInt) => 2,
                    Some(BaseKind::Integer) | Some(BaseKind::Real) | Some(BaseKind::Set) => 4,
                    Some(BaseKind::LongInt) | Some(BaseKind::LongReal) => 8,
                    _ => match &md.ty(t).desc {
                        // TODO compute real layout sizes for reference types
                        TypeDesc::Pointer { .. } => 4,
                        TypeDesc::Record(_) | TypeDesc::Array { .. } => 1,
                        other => panic!("BYTESIZE of {:?}", other),
                    },
                };
                self.line(loc).ldc_i4(size);
            }
        }
        Ok(())
    }

    fn emit_min_max(&mut self, b: Builtin, args: &[Expr], loc: RowCol) -> Result<(), Diagnostic> {
        let md = self.md;
        let is_max = b == Builtin::Max;
        if args.len() == 1 {
            let t = md.derefed(args[0].ty);
            match &md.ty(t).desc {
                TypeDesc::Base(k) => match k {
                    BaseKind::LongInt => {
                        let v = if is_max { i64::MAX } else { i64::MIN };
                        self.line(loc).ldc_i8(v);
                    }
                    BaseKind::LongReal => {
                        let v = if is_max { f64::MAX } else { f64::MIN };
                        self.line(loc).ldc_r8(v);
                    }
                    BaseKind::Real => {
                        let v = if is_max { f32::MAX as f64 } else { f32::MIN as f64 };
                        self.line(loc).ldc_r8(v);
                    }
                    _ => {
                        let (max, min) = match k {
                            BaseKind::Bool => (1, 0),
                            BaseKind::Char => (0xff, 0),
                            BaseKind::WChar => (0xffff, 0),
                            BaseKind::Byte => (255, 0),
                            BaseKind::ShortInt => (i16::MAX as i32, i16::MIN as i32),
                            BaseKind::Integer => (i32::MAX, i32::MIN),
                            BaseKind::Set => (31, 0),
                            other => panic!("MIN/MAX of {:?}", other),
                        };
                        self.line(loc).ldc_i4(if is_max { max } else { min });
                    }
                },
                TypeDesc::Enumeration { items } => {
                    let v = if is_max {
                        items.last().map(|i| i.value).unwrap_or(0)
                    } else {
                        items.first().map(|i| i.value).unwrap_or(0)
                    };
                    self.line(loc).ldc_i4(v as i32);
                }
                other => panic!("MIN/MAX of {:?}", other),
            }
        } else {
            self.lower_expr(&args[0])?;
            self.lower_expr(&args[1])?;
            let pos_case = self.em.new_label();
            if is_max {
                self.line(loc).bge(pos_case);
            } else {
                self.line(loc).ble(pos_case);
            }
            self.lower_expr(&args[1])?;
            let to_end = self.em.new_label();
            self.line(loc).br(to_end);
            self.line(loc).label(pos_case);
            self.lower_expr(&args[0])?;
            self.line(loc).label(to_end);
        }
        Ok(())
    }
}

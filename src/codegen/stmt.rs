//! Statement lowering and control flow.
//!
//! The structured statements reduce to a small core: WHILE rewrites to
//! LOOP around a guarded EXIT, FOR rewrites to an initial assignment plus
//! a WHILE with a step test, and both CASE forms rewrite to IF chains
//! before lowering. LOOP pushes a fresh exit label so EXIT always targets
//! the innermost loop.

use crate::ast::{
    BaseKind, BinOp, CaseArm, Expr, ExprKind, IfKind, IfStmt, Module, RowCol, Stmt, StmtKind,
    TypeDesc, TypeId,
};
use crate::diagnostics::Diagnostic;
use crate::il::{ConvKind, IndKind};

use super::CodeGen;

impl<'a, 'e> CodeGen<'a, 'e> {
    pub(crate) fn lower_stmt(&mut self, s: &Stmt) -> Result<(), Diagnostic> {
        let md = self.md;
        match &s.kind {
            StmtKind::Assign { lhs, rhs } => self.lower_assign(lhs, rhs, s.loc),
            StmtKind::Call(e) => {
                self.lower_expr(e)?;
                // discard an ignored basic result; structured returns stay
                // referenced by the callee's copy-out
                if let TypeDesc::Base(k) = &md.ty(md.derefed(e.ty)).desc {
                    if *k != BaseKind::None {
                        self.line(s.loc).pop();
                    }
                }
                Ok(())
            }
            StmtKind::If(ifs) => self.lower_if(ifs, s.loc),
            StmtKind::For {
                var,
                from,
                to,
                by,
                by_value,
                body,
            } => self.lower_for(var, from, to, by, *by_value, body, s.loc),
            StmtKind::Case {
                expr,
                type_case,
                arms,
                else_block,
            } => self.lower_case(expr, *type_case, arms, else_block, s.loc),
            StmtKind::Exit => {
                match self.exit_labels.last() {
                    Some(label) => {
                        let label = *label;
                        self.line(s.loc).br(label);
                    }
                    None => self.generator_error("EXIT outside of LOOP", s.loc),
                }
                Ok(())
            }
            StmtKind::Return(what) => {
                let scope = self.scope.expect("RETURN outside of procedure");
                let ret = md.proc_sig(md.decl(scope).ty).ret;
                self.emit_return(ret, what.as_ref(), s.loc)
            }
        }
    }

    pub(crate) fn lower_assign(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        loc: RowCol,
    ) -> Result<(), Diagnostic> {
        let md = self.md;
        let lhs_t = md.derefed(lhs.ty);

        if md.is_structured(lhs_t) {
            self.lower_expr(lhs)?;
            self.lower_expr(rhs)?;
            self.prepare_rhs(lhs_t, rhs, loc)?;
            match &md.ty(lhs_t).desc {
                TypeDesc::Record(_) => {
                    let what = self.record_copy_ref(lhs_t);
                    self.line(loc).callvirt(&what, 1, false);
                }
                TypeDesc::Array { .. } => {
                    let copier = self.array_copier_ref(lhs_t);
                    self.line(loc).call(&copier, 2, false, false);
                }
                other => panic!("structured assignment to {:?}", other),
            }
            return Ok(());
        }

        self.emit_fetch_desig_addr(lhs, true)?;
        self.lower_expr(rhs)?;
        self.prepare_rhs(lhs_t, rhs, loc)?;
        match &md.ty(lhs_t).desc {
            TypeDesc::Pointer { .. } | TypeDesc::Proc(_) => {
                self.line(loc).stind(IndKind::Ref);
            }
            TypeDesc::Enumeration { .. } => {
                self.line(loc).stind(IndKind::I4);
            }
            TypeDesc::Base(k) => {
                // convert before the typed store, the address below the
                // value fixes the destination width
                match k {
                    BaseKind::LongReal => {
                        self.line(loc).conv(ConvKind::ToR8);
                        self.line(loc).stind(IndKind::R8);
                    }
                    BaseKind::Real => {
                        self.line(loc).conv(ConvKind::ToR4);
                        self.line(loc).stind(IndKind::R4);
                    }
                    BaseKind::LongInt => {
                        self.line(loc).conv(ConvKind::ToI8);
                        self.line(loc).stind(IndKind::I8);
                    }
                    BaseKind::Integer | BaseKind::Set => {
                        self.line(loc).conv(ConvKind::ToI4);
                        self.line(loc).stind(IndKind::I4);
                    }
                    BaseKind::ShortInt | BaseKind::Char | BaseKind::WChar => {
                        self.line(loc).conv(ConvKind::ToI2);
                        self.line(loc).stind(IndKind::I2);
                    }
                    BaseKind::Byte | BaseKind::Bool => {
                        self.line(loc).conv(ConvKind::ToU1);
                        self.line(loc).stind(IndKind::I1);
                    }
                    other => panic!("assignment to base type {:?}", other),
                }
            }
            other => panic!("assignment to {:?}", other),
        }
        Ok(())
    }

    fn lower_if(&mut self, ifs: &IfStmt, loc: RowCol) -> Result<(), Diagnostic> {
        match ifs.kind {
            IfKind::If | IfKind::With => self.emit_if(ifs, loc),
            IfKind::While => {
                // WHILE c DO body END becomes
                // LOOP IF c THEN body ELSE EXIT END END
                let conds = IfStmt {
                    kind: IfKind::If,
                    conds: ifs.conds.clone(),
                    blocks: ifs.blocks.clone(),
                    else_block: vec![Stmt::new(StmtKind::Exit, loc)],
                };
                let rewritten = IfStmt {
                    kind: IfKind::Loop,
                    conds: Vec::new(),
                    blocks: vec![vec![Stmt::new(StmtKind::If(conds), loc)]],
                    else_block: Vec::new(),
                };
                self.lower_if(&rewritten, loc)
            }
            IfKind::Repeat => {
                let loop_start = self.em.new_label();
                self.line(loc).label(loop_start);
                for s in &ifs.blocks[0] {
                    self.lower_stmt(s)?;
                }
                self.lower_expr(&ifs.conds[0])?;
                let after_end = self.em.new_label();
                self.line(loc).brtrue(after_end);
                self.line(loc).br(loop_start);
                self.line(loc).label(after_end);
                Ok(())
            }
            IfKind::Loop => {
                let loop_start = self.em.new_label();
                let exit = self.em.new_label();
                self.exit_labels.push(exit);
                self.line(loc).label(loop_start);
                for s in &ifs.blocks[0] {
                    self.lower_stmt(s)?;
                }
                self.line(loc).br(loop_start);
                self.line(loc).label(exit);
                self.exit_labels.pop();
                Ok(())
            }
        }
    }

    fn emit_if(&mut self, ifs: &IfStmt, loc: RowCol) -> Result<(), Diagnostic> {
        self.lower_expr(&ifs.conds[0])?;
        let after_first = self.em.new_label();
        self.line(loc).brfalse(after_first);
        for s in &ifs.blocks[0] {
            self.lower_stmt(s)?;
        }
        let after_end = self.em.new_label();
        self.line(loc).br(after_end);
        self.line(loc).label(after_first);
        for i in 1..ifs.conds.len() {
            self.lower_expr(&ifs.conds[i])?;
            let after_next = self.em.new_label();
            self.line(loc).brfalse(after_next);
            for s in &ifs.blocks[i] {
                self.lower_stmt(s)?;
            }
            self.line(loc).br(after_end);
            self.line(loc).label(after_next);
        }
        for s in &ifs.else_block {
            self.lower_stmt(s)?;
        }
        self.line(loc).label(after_end);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_for(
        &mut self,
        var: &Expr,
        from: &Expr,
        to: &Expr,
        by: &Expr,
        by_value: i64,
        body: &[Stmt],
        loc: RowCol,
    ) -> Result<(), Diagnostic> {
        // i := from; WHILE i <= to DO body; i := i + by END
        // (>= for a negative step)
        let md = self.md;
        self.lower_assign(var, from, loc)?;

        let cond_op = if by_value > 0 { BinOp::Leq } else { BinOp::Geq };
        let base = md.base_kind(var.ty).unwrap_or(BaseKind::None);
        let cond = Expr::new(
            ExprKind::Binary {
                op: cond_op,
                base,
                lhs: Box::new(var.clone()),
                rhs: Box::new(to.clone()),
            },
            Module::base(BaseKind::Bool),
            loc,
        );
        let step = Expr::new(
            ExprKind::Binary {
                op: BinOp::Add,
                base: md.base_kind(by.ty).unwrap_or(base),
                lhs: Box::new(var.clone()),
                rhs: Box::new(by.clone()),
            },
            by.ty,
            loc,
        );
        let mut block = body.to_vec();
        block.push(Stmt::new(
            StmtKind::Assign {
                lhs: var.clone(),
                rhs: step,
            },
            loc,
        ));
        let whl = IfStmt {
            kind: IfKind::While,
            conds: vec![cond],
            blocks: vec![block],
            else_block: Vec::new(),
        };
        self.lower_if(&whl, loc)
    }

    fn lower_case(
        &mut self,
        expr: &Expr,
        type_case: bool,
        arms: &[CaseArm],
        else_block: &[Stmt],
        loc: RowCol,
    ) -> Result<(), Diagnostic> {
        if arms.is_empty() {
            for s in else_block {
                self.lower_stmt(s)?;
            }
            return Ok(());
        }
        let boolean = Module::base(BaseKind::Bool);
        let mut conds = Vec::new();
        let mut blocks = Vec::new();

        for arm in arms {
            let cond = if type_case {
                // a type arm has exactly one label; the guard is an IS test
                assert_eq!(arm.labels.len(), 1);
                Expr::new(
                    ExprKind::Binary {
                        op: BinOp::Is,
                        base: BaseKind::None,
                        lhs: Box::new(expr.clone()),
                        rhs: Box::new(arm.labels[0].clone()),
                    },
                    boolean,
                    arm.labels[0].loc,
                )
            } else {
                let mut ors: Vec<Expr> = Vec::new();
                for label in &arm.labels {
                    let test = match &label.kind {
                        ExprKind::Binary {
                            op: BinOp::Range,
                            lhs,
                            rhs,
                            ..
                        } => {
                            let base = self.md.base_kind(expr.ty).unwrap_or(BaseKind::None);
                            let geq = Expr::new(
                                ExprKind::Binary {
                                    op: BinOp::Geq,
                                    base,
                                    lhs: Box::new(expr.clone()),
                                    rhs: lhs.clone(),
                                },
                                boolean,
                                label.loc,
                            );
                            let leq = Expr::new(
                                ExprKind::Binary {
                                    op: BinOp::Leq,
                                    base,
                                    lhs: Box::new(expr.clone()),
                                    rhs: rhs.clone(),
                                },
                                boolean,
                                label.loc,
                            );
                            Expr::new(
                                ExprKind::Binary {
                                    op: BinOp::And,
                                    base: BaseKind::None,
                                    lhs: Box::new(geq),
                                    rhs: Box::new(leq),
                                },
                                boolean,
                                label.loc,
                            )
                        }
                        _ => {
                            let base = self.md.base_kind(expr.ty).unwrap_or(BaseKind::None);
                            Expr::new(
                                ExprKind::Binary {
                                    op: BinOp::Eq,
                                    base,
                                    lhs: Box::new(expr.clone()),
                                    rhs: Box::new(label.clone()),
                                },
                                boolean,
                                label.loc,
                            )
                        }
                    };
                    ors.push(test);
                }
                let mut cond = ors.remove(0);
                for next in ors {
                    let nloc = next.loc;
                    cond = Expr::new(
                        ExprKind::Binary {
                            op: BinOp::Or,
                            base: BaseKind::None,
                            lhs: Box::new(cond),
                            rhs: Box::new(next),
                        },
                        boolean,
                        nloc,
                    );
                }
                cond
            };
            conds.push(cond);
            blocks.push(arm.block.clone());
        }

        let rewritten = IfStmt {
            kind: IfKind::If,
            conds,
            blocks,
            else_block: else_block.to_vec(),
        };
        self.emit_if(&rewritten, loc)
    }

    /// Emits a return; structured values are copied into a fresh instance
    /// so the caller never aliases callee state.
    pub(crate) fn emit_return(
        &mut self,
        ret: Option<TypeId>,
        what: Option<&Expr>,
        loc: RowCol,
    ) -> Result<(), Diagnostic> {
        let md = self.md;
        match what {
            Some(what) => {
                let ltd = ret.map(|t| md.derefed(t));
                if let Some(ltd) = ltd.filter(|t| md.is_structured(*t)) {
                    self.emit_initializer(ret.expect("structured return type"), false, loc, &[])?;
                    self.line(loc).dup();
                    self.lower_expr(what)?;
                    match &md.ty(ltd).desc {
                        TypeDesc::Record(_) => {
                            let copy = self.record_copy_ref(ltd);
                            self.line(loc).callvirt(&copy, 1, false);
                        }
                        TypeDesc::Array { .. } => {
                            let copier = self.array_copier_ref(ltd);
                            self.line(loc).call(&copier, 2, false, false);
                        }
                        other => panic!("structured return of {:?}", other),
                    }
                } else {
                    self.lower_expr(what)?;
                    if let Some(ltd) = ltd {
                        self.prepare_rhs(ltd, what, loc)?;
                    }
                }
                self.line(loc).ret(true);
            }
            None => {
                if let Some(ret) = ret {
                    // function procedure falling off its end: produce the
                    // type's default value
                    if !self.emit_initializer(ret, false, loc, &[])? {
                        self.line(loc).ldnull();
                    }
                    self.line(loc).ret(true);
                } else {
                    self.line(loc).ret(false);
                }
            }
        }
        Ok(())
    }
}

//! The translator: walks a validated module AST and drives the IL emitter.
//!
//! Per-module state (anonymous record slots, the delegate table, the array
//! copier worklist, the temp-local pool) lives on the [`CodeGen`] instance;
//! a fresh instance per module keeps translations independent. Emission
//! order is fixed so output is deterministic: delegates are registered
//! first, record classes emitted in collection order, then module fields,
//! procedures, the module initializer `.cctor`, the `ping#` wake-up method,
//! array copiers (worklist drained in signature order) and delegate
//! classes (hash order).

pub mod expr;
pub mod helpers;
pub mod stmt;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::ast::{Decl, DeclKind, Module, RowCol, TypeDesc, TypeId};
use crate::ast::DeclId;
use crate::diagnostics::{Category, Diagnostic, Errors};
use crate::il::{IlEmitter, MethodKind, ModuleKind};

/// Capacity of the per-method temp-local pool.
const MAX_TEMP: usize = 32;

/// Fixed-capacity pool of temporary local slots with buy/sell discipline.
/// Resets at each method prologue; the high-water mark tells the emitter
/// how many temp locals to declare.
pub(crate) struct TempPool {
    slots: [bool; MAX_TEMP],
    start: u16,
    pub max: i32,
}

impl TempPool {
    fn new() -> Self {
        TempPool {
            slots: [false; MAX_TEMP],
            start: 0,
            max: -1,
        }
    }

    pub fn reset(&mut self, start: u16) {
        self.slots = [false; MAX_TEMP];
        self.start = start;
        self.max = -1;
    }

    pub fn buy(&mut self) -> u16 {
        for i in 0..MAX_TEMP {
            if !self.slots[i] {
                self.slots[i] = true;
                if i as i32 > self.max {
                    self.max = i as i32;
                }
                return i as u16 + self.start;
            }
        }
        panic!("temp pool exhausted");
    }

    pub fn sell(&mut self, slot: u16) {
        assert!(slot >= self.start, "temp slot below pool base");
        self.slots[(slot - self.start) as usize] = false;
    }
}

/// Declaration pre-pass: gathers everything the module-level emission
/// phases need before any method body is generated.
#[derive(Default)]
struct Collector {
    procs: Vec<DeclId>,
    records: Vec<TypeId>,
    proc_types: Vec<TypeId>,
    imports: BTreeSet<String>,
    seen: HashSet<TypeId>,
}

impl Collector {
    fn collect_type(&mut self, md: &Module, t: TypeId) {
        match &md.ty(t).desc {
            TypeDesc::Array { elem, .. } => self.collect_type(md, *elem),
            TypeDesc::Record(r) => {
                if !self.seen.insert(t) {
                    return;
                }
                self.records.push(t);
                let fields = r.fields.clone();
                for f in fields {
                    self.collect_type(md, md.decl(f).ty);
                }
                if let Some(base) = r.base {
                    self.collect_type(md, base);
                }
            }
            TypeDesc::Pointer { to } => self.collect_type(md, *to),
            TypeDesc::Proc(sig) => {
                if !self.seen.insert(t) {
                    return;
                }
                self.proc_types.push(t);
                for p in sig.formals.clone() {
                    self.collect_type(md, md.decl(p).ty);
                }
                if let Some(ret) = sig.ret {
                    self.collect_type(md, ret);
                }
            }
            TypeDesc::Quali { .. } => {
                // qualified record references pull in their home module;
                // delegates are only created for proc types declared here
                if let Some(r) = md.to_record(t) {
                    if let Some(decl) = md.record(r).decl {
                        if let Some(home) = &md.decl(decl).module {
                            self.imports.insert(home.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn collect_decl(&mut self, md: &Module, d: DeclId) {
        match &md.decl(d).kind {
            DeclKind::Proc(p) => {
                if p.receiver.is_none() {
                    self.procs.push(d);
                }
                for n in p.order.clone() {
                    self.collect_decl(md, n);
                }
            }
            DeclKind::NamedType
            | DeclKind::Variable
            | DeclKind::LocalVar { .. }
            | DeclKind::Param { .. } => self.collect_type(md, md.decl(d).ty),
            _ => {}
        }
    }

    fn collect_module(&mut self, md: &Module) {
        for d in &md.order {
            self.collect_decl(md, *d);
        }
    }
}

pub struct CodeGen<'a, 'e> {
    pub(crate) md: &'a Module,
    pub(crate) em: &'a mut IlEmitter<'e>,
    pub(crate) errs: &'a Errors,
    /// Anonymous record slots; one is an invalid slot, numbering starts
    /// at one and grows monotonically per module.
    next_anon: u32,
    anon_slots: HashMap<TypeId, u32>,
    emitted_records: HashSet<TypeId>,
    pub(crate) temps: TempPool,
    /// Array copier worklist: type signature to array type.
    pub(crate) copiers: BTreeMap<String, TypeId>,
    /// Delegate table: signature hash to proc type.
    pub(crate) delegates: BTreeMap<String, TypeId>,
    /// Innermost LOOP exit label on top.
    pub(crate) exit_labels: Vec<u32>,
    pub(crate) last_line: RowCol,
    pub(crate) scope: Option<DeclId>,
    pub(crate) force_assembly_prefix: bool,
}

/// Translates one module into one emitter. Returns `true` when the module
/// produced errors (in which case its output must be discarded).
pub fn translate(module: &Module, emitter: &mut IlEmitter, errs: &Errors) -> bool {
    if module.had_errors || !module.validated {
        return true;
    }
    if module.definition_only {
        return false;
    }
    let before = errs.count();
    let mut gen = CodeGen::new(module, emitter, errs);
    if let Err(d) = gen.run() {
        errs.error(&d);
    }
    errs.count() != before
}

impl<'a, 'e> CodeGen<'a, 'e> {
    pub fn new(md: &'a Module, em: &'a mut IlEmitter<'e>, errs: &'a Errors) -> Self {
        CodeGen {
            md,
            em,
            errs,
            next_anon: 1,
            anon_slots: HashMap::new(),
            emitted_records: HashSet::new(),
            temps: TempPool::new(),
            copiers: BTreeMap::new(),
            delegates: BTreeMap::new(),
            exit_labels: Vec::new(),
            last_line: RowCol::default(),
            scope: None,
            force_assembly_prefix: false,
        }
    }

    /// Emits a `.line` marker when the location changed, then hands out
    /// the emitter for chaining.
    pub(crate) fn line(&mut self, loc: RowCol) -> &mut IlEmitter<'e> {
        if loc != self.last_line && loc != RowCol::default() {
            self.em.line(loc);
            self.last_line = loc;
        }
        &mut *self.em
    }

    pub(crate) fn begin_body(&mut self, start: u16) {
        self.last_line = RowCol::default();
        self.temps.reset(start);
    }

    pub(crate) fn emit_local_vars(&mut self) {
        for i in 0..=self.temps.max {
            self.em.add_local("int32", &format!("'#temp{}'", i));
        }
    }

    pub(crate) fn generator_error(&self, message: impl Into<String>, loc: RowCol) {
        let d = Diagnostic::at(Category::Generator, message, loc).with_file(self.md.file.clone());
        self.errs.error(&d);
    }

    /// The anonymous-record class slot, assigned monotonically on first
    /// sight.
    pub(crate) fn anon_slot(&mut self, r: TypeId) -> u32 {
        if let Some(slot) = self.anon_slots.get(&r) {
            return *slot;
        }
        let slot = self.next_anon;
        self.next_anon += 1;
        self.anon_slots.insert(r, slot);
        slot
    }

    fn alloc_record_slot(&mut self, r: TypeId) {
        let md = self.md;
        let named = md
            .record(r)
            .decl
            .map(|d| matches!(md.decl(d).kind, DeclKind::NamedType))
            .unwrap_or(false);
        if !named {
            self.anon_slot(r);
        }
    }

    pub fn run(&mut self) -> Result<(), Diagnostic> {
        let md = self.md;
        let mut co = Collector::default();
        co.collect_module(md);
        for imp in &md.imports {
            let name = &md.decl(*imp).name;
            co.imports.insert(name.clone());
        }

        let mut imports = vec![
            Self::escape("mscorlib"),
            Self::escape("OBX.Runtime"),
        ];
        for name in &co.imports {
            if *name != md.name {
                imports.push(Self::escape(name));
            }
        }

        self.em
            .begin_module(
                &Self::escape(&md.name),
                &imports,
                &md.file,
                ModuleKind::Library,
            )
            .map_err(Self::backend_err)?;

        // register the delegate for every proc type declared here, so the
        // table is complete before any reference is formatted
        for pt in &co.proc_types {
            self.delegate_ref(*pt);
        }

        for r in &co.records {
            self.alloc_record_slot(*r);
        }
        for r in &co.records {
            self.emit_record_decl(*r)?;
        }

        for d in &md.order {
            if matches!(md.decl(*d).kind, DeclKind::Variable) {
                self.emit_var(*d, true)?;
            }
        }

        for p in co.procs.clone() {
            self.emit_procedure(p)?;
        }

        // module initializer
        self.em.begin_method(".cctor", false, MethodKind::Static, false);
        self.begin_body(0);
        for d in &md.order {
            if matches!(md.decl(*d).kind, DeclKind::Variable) {
                self.emit_named_initializer(*d)?;
            }
        }
        for s in &md.body {
            self.lower_stmt(s)?;
        }
        self.line(md.begin_loc).ret(false);
        self.emit_local_vars();
        self.em.end_method().map_err(Self::backend_err)?;

        // wake-up method used to force static initialization order
        self.em
            .begin_method("'ping#'", true, MethodKind::Static, false);
        self.begin_body(0);
        self.line(md.end_loc).ret(false);
        self.em.end_method().map_err(Self::backend_err)?;

        // drain the copier worklist; copiers can demand sub-copiers for
        // nested array types, so iterate until empty
        let mut done: HashSet<String> = HashSet::new();
        while let Some((sig, arr)) = self.copiers.pop_first() {
            if !done.insert(sig) {
                continue;
            }
            self.emit_array_copier(arr, md.end_loc)?;
        }

        let delegates = self.delegates.clone();
        for (name, pt) in delegates {
            self.emit_delegate_decl(pt, &name)?;
        }

        self.em.end_module().map_err(Self::backend_err)?;
        Ok(())
    }

    fn emit_var(&mut self, d: DeclId, is_static: bool) -> Result<(), Diagnostic> {
        let md = self.md;
        let decl = md.decl(d);
        let exported = Self::exported(decl.visibility);
        let ty = self.format_type(Some(decl.ty));
        self.em
            .add_field(&Self::escape(&decl.name), &ty, exported, is_static)
            .map_err(Self::backend_err)
    }

    fn emit_record_decl(&mut self, r: TypeId) -> Result<(), Diagnostic> {
        if !self.emitted_records.insert(r) {
            return Ok(());
        }
        let md = self.md;
        let rec = md.record(r);
        let named_decl: Option<&Decl> = rec
            .decl
            .map(|d| md.decl(d))
            .filter(|d| matches!(d.kind, DeclKind::NamedType));

        let mut is_public = false;
        let class_name;
        let mut super_ref = None;
        match named_decl {
            Some(decl) => {
                is_public = decl.scope.is_none()
                    && decl.module.is_none()
                    && decl.visibility == crate::ast::Visibility::ReadWrite;
                class_name = self.dotted_name(rec.decl.unwrap());
                if let Some(base) = rec.base {
                    super_ref = Some(self.format_type(Some(base)));
                }
            }
            None => {
                let slot = self.anon_slot(r);
                class_name = format!("'#{}'", slot);
            }
        }
        self.em
            .begin_class(&class_name, is_public, super_ref.as_deref())
            .map_err(Self::backend_err)?;

        let fields = rec.fields.clone();
        let methods = rec.methods.clone();
        let by_value = rec.by_value;
        let base = rec.base;
        let loc = named_decl.map(|d| d.loc).unwrap_or(md.begin_loc);

        for f in &fields {
            self.emit_var(*f, false)?;
        }
        for m in &methods {
            self.emit_procedure(*m)?;
        }

        // default constructor: chain to the parent, then zero-initialize
        // every field (the language guarantees initialized variables)
        self.em.begin_method(".ctor", true, MethodKind::Instance, false);
        self.begin_body(0);
        self.line(loc).ldarg(0);
        let what = if let Some(base) = base {
            let base_rec = md.derefed(base);
            format!("void class {}::.ctor()", self.class_ref(base_rec))
        } else if by_value {
            "void [mscorlib]System.ValueType::.ctor()".to_string()
        } else {
            "void [mscorlib]System.Object::.ctor()".to_string()
        };
        self.line(loc).call(&what, 1, false, true);
        for f in &fields {
            let floc = md.decl(*f).loc;
            let fty = md.decl(*f).ty;
            self.line(floc).ldarg(0);
            if self.emit_initializer(fty, false, floc, &[])? {
                self.emit_stack_to_var(*f, floc);
            } else {
                self.line(floc).pop();
            }
        }
        self.line(loc).ret(false);
        self.emit_local_vars();
        self.em.end_method().map_err(Self::backend_err)?;

        // the synthesized copy method realizing value assignment
        self.em
            .begin_method("'#copy'", true, MethodKind::Virtual, false);
        let mut arg_ty = self.format_type(Some(r));
        if by_value {
            arg_ty.push('&');
        }
        self.em.add_argument(&arg_ty, "rhs");
        self.begin_body(0);
        if let Some(base) = base {
            let base_rec = md.derefed(base);
            self.line(loc).ldarg(0);
            self.line(loc).ldarg(1);
            let what = self.record_copy_ref(base_rec);
            self.line(loc).call(&what, 2, false, true);
        }
        for f in &fields {
            let fty = md.derefed(md.decl(*f).ty);
            match &md.ty(fty).desc {
                TypeDesc::Record(_) => {
                    self.line(loc).ldarg(0);
                    let fref = self.member_ref(*f);
                    self.line(loc).ldfld(&fref);
                    self.line(loc).ldarg(1);
                    self.line(loc).ldfld(&fref);
                    let what = self.record_copy_ref(fty);
                    self.line(loc).callvirt(&what, 1, false);
                }
                TypeDesc::Array { .. } => {
                    self.line(loc).ldarg(0);
                    let fref = self.member_ref(*f);
                    self.line(loc).ldfld(&fref);
                    self.line(loc).ldarg(1);
                    self.line(loc).ldfld(&fref);
                    let copier = self.array_copier_ref(fty);
                    self.line(loc).call(&copier, 2, false, false);
                }
                _ => {
                    let fref = self.member_ref(*f);
                    self.line(loc).ldarg(0);
                    self.line(loc).ldarg(1);
                    self.line(loc).ldfld(&fref);
                    self.line(loc).stfld(&fref);
                }
            }
        }
        self.line(loc).ret(false);
        self.emit_local_vars();
        self.em.end_method().map_err(Self::backend_err)?;

        self.em.end_class().map_err(Self::backend_err)?;
        Ok(())
    }

    /// One static `#copy(lhs, rhs)` per distinct array type. The copier
    /// walks `min(len(lhs), len(rhs))` elements and dispatches per element
    /// kind; element arrays recurse through their own copier, which the
    /// worklist then materializes.
    fn emit_array_copier(&mut self, a: TypeId, loc: RowCol) -> Result<(), Diagnostic> {
        let md = self.md;
        let (elem, _) = match &md.ty(md.derefed(a)).desc {
            TypeDesc::Array { elem, len } => (*elem, *len),
            other => panic!("array copier for non-array {:?}", other),
        };
        let et = md.derefed(elem);

        self.em
            .begin_method("'#copy'", true, MethodKind::Static, false);
        let ty = self.format_type(Some(a));
        self.em.add_argument(&ty, "lhs");
        self.em.add_argument(&ty, "rhs");
        self.begin_body(0);

        self.line(loc);
        let len = self.temps.buy();
        self.em.ldarg(0);
        self.em.ldlen();
        self.em.ldarg(1);
        self.em.ldlen();
        let lhs_is_len = self.em.new_label();
        let store_len = self.em.new_label();
        self.em.ble(lhs_is_len);
        self.em.ldarg(1);
        self.em.ldlen();
        self.em.br(store_len);
        self.em.label(lhs_is_len);
        self.em.ldarg(0);
        self.em.ldlen();
        self.em.label(store_len);
        self.em.stloc(len);

        let idx = self.temps.buy();
        self.em.ldc_i4(0);
        self.em.stloc(idx);

        let check_len = self.em.new_label();
        let add_lbl = self.em.new_label();
        self.em.label(check_len);
        self.em.ldloc(idx);
        self.em.ldloc(len);
        let after_loop = self.em.new_label();
        self.em.bge(after_loop);

        let elem_ty = self.format_type(Some(et));
        match &md.ty(et).desc {
            TypeDesc::Array { .. } => {
                self.em.ldarg(0);
                self.em.ldloc(idx);
                self.em.ldelem(&elem_ty);
                self.em.ldarg(1);
                self.em.ldloc(idx);
                self.em.ldelem(&elem_ty);
                let copier = self.array_copier_ref(et);
                self.em.call(&copier, 2, false, false);
                self.em.br(add_lbl);
            }
            TypeDesc::Record(_) => {
                self.em.ldarg(0);
                self.em.ldloc(idx);
                self.em.ldelem(&elem_ty);
                self.em.ldarg(1);
                self.em.ldloc(idx);
                self.em.ldelem(&elem_ty);
                let what = self.record_copy_ref(et);
                self.em.callvirt(&what, 1, false);
            }
            _ => {
                self.em.ldarg(0);
                self.em.ldloc(idx);
                self.em.ldarg(1);
                self.em.ldloc(idx);
                self.em.ldelem(&elem_ty);
                self.em.stelem(&elem_ty);
            }
        }

        self.em.label(add_lbl);
        self.em.ldloc(idx);
        self.em.ldc_i4(1);
        self.em.add();
        self.em.stloc(idx);
        self.em.br(check_len);
        self.em.label(after_loop);
        self.temps.sell(idx);
        self.temps.sell(len);

        self.em.ret(false);
        self.emit_local_vars();
        self.em.end_method().map_err(Self::backend_err)
    }

    /// A delegate class per procedure type: `MulticastDelegate` subclass
    /// with the runtime-provided `.ctor` and `Invoke` pair.
    fn emit_delegate_decl(&mut self, pt: TypeId, name: &str) -> Result<(), Diagnostic> {
        let md = self.md;
        self.em
            .begin_class(
                &Self::escape(name),
                true,
                Some("[mscorlib]System.MulticastDelegate"),
            )
            .map_err(Self::backend_err)?;
        self.em.begin_method(".ctor", true, MethodKind::Instance, true);
        self.em.add_argument("object", "MethodsClass");
        self.em.add_argument("native unsigned int", "MethodPtr");
        self.em.end_method().map_err(Self::backend_err)?;

        self.em
            .begin_method("Invoke", true, MethodKind::Instance, true);
        let sig = md.proc_sig(pt).clone();
        if sig.ret.is_some() {
            let ret = self.format_type(sig.ret);
            self.em.set_return_type(&ret);
        }
        for p in &sig.formals {
            let mut ty = self.format_type(Some(md.decl(*p).ty));
            if self.pass_by_ref(*p) {
                ty.push('&');
            }
            let name = Self::escape(&md.decl(*p).name);
            self.em.add_argument(&ty, &name);
        }
        self.em.end_method().map_err(Self::backend_err)?;
        self.em.end_class().map_err(Self::backend_err)
    }

    fn emit_procedure(&mut self, p: DeclId) -> Result<(), Diagnostic> {
        let md = self.md;
        let prev_scope = self.scope.replace(p);
        let decl = md.decl(p);
        let proc = match &decl.kind {
            DeclKind::Proc(proc) => proc.as_ref(),
            other => panic!("expected procedure declaration, found {:?}", other),
        };

        let name = if proc.receiver_rec.is_some() {
            Self::escape(&decl.name)
        } else {
            self.dotted_name(p)
        };
        let kind = if proc.receiver.is_none() {
            MethodKind::Static
        } else if proc
            .receiver_rec
            .map(|r| !md.record(r).by_value)
            .unwrap_or(false)
        {
            MethodKind::Virtual
        } else {
            MethodKind::Instance
        };
        self.em.begin_method(
            &name,
            decl.visibility != crate::ast::Visibility::Private,
            kind,
            false,
        );

        let sig = md.proc_sig(decl.ty).clone();
        if sig.ret.is_some() {
            let ret = self.format_type(sig.ret);
            self.em.set_return_type(&ret);
        }
        for f in &sig.formals {
            let mut ty = self.format_type(Some(md.decl(*f).ty));
            if self.pass_by_ref(*f) {
                ty.push('&');
            }
            let pname = Self::escape(&md.decl(*f).name);
            self.em.add_argument(&ty, &pname);
        }
        for n in &proc.order {
            if matches!(md.decl(*n).kind, DeclKind::LocalVar { .. }) {
                let ty = self.format_type(Some(md.decl(*n).ty));
                let lname = Self::escape(&md.decl(*n).name);
                self.em.add_local(&ty, &lname);
            }
        }

        self.begin_body(proc.var_count);

        for n in &proc.order {
            if matches!(
                md.decl(*n).kind,
                DeclKind::LocalVar { .. } | DeclKind::Param { .. }
            ) {
                self.emit_named_initializer(*n)?;
            }
        }
        for s in &proc.body {
            self.lower_stmt(s)?;
        }
        let needs_ret = proc
            .body
            .last()
            .map(|s| !matches!(s.kind, crate::ast::StmtKind::Return(_)))
            .unwrap_or(true);
        if needs_ret {
            self.emit_return(sig.ret, None, proc.end_loc)?;
        }

        self.emit_local_vars();
        self.em.end_method().map_err(Self::backend_err)?;
        self.scope = prev_scope;
        Ok(())
    }
}

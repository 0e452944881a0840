//! Reference formatting and shared lowering helpers: escaped names,
//! module/class/member references, type spellings, the delegate and array
//! copier tables, default initializers, and the designator load/store
//! primitives.

use md5::{Digest, Md5};

use crate::ast::{
    BaseKind, DeclId, DeclKind, RowCol, TypeDesc, TypeId, Value, Visibility,
};
use crate::diagnostics::{Category, Diagnostic};
use crate::il::{BackendError, ConvKind, IndKind};

use super::CodeGen;

impl<'a, 'e> CodeGen<'a, 'e> {
    pub(crate) fn backend_err(e: BackendError) -> Diagnostic {
        Diagnostic::new(Category::Backend, e.message)
    }

    /// User-level names are always quoted in the IL stream.
    pub(crate) fn escape(name: &str) -> String {
        format!("'{}'", name)
    }

    /// Names of declarations nested in procedures concatenate the scope
    /// chain up to (but not including) the module.
    pub(crate) fn dotted_name(&self, d: DeclId) -> String {
        let decl = self.md.decl(d);
        let name = Self::escape(&decl.name);
        match decl.scope {
            Some(outer) => format!("{}.{}", self.dotted_name(outer), name),
            None => name,
        }
    }

    /// Module references carry the assembly prefix for foreign modules;
    /// delegate references force it for the own module too.
    pub(crate) fn module_ref(&self, module: &str) -> String {
        let m = Self::escape(module);
        if !self.force_assembly_prefix && module == self.md.name {
            m
        } else {
            format!("[{}]{}", m, m)
        }
    }

    fn decl_module(&self, d: DeclId) -> String {
        self.md
            .decl(d)
            .module
            .clone()
            .unwrap_or_else(|| self.md.name.clone())
    }

    /// The class path of a record: its declared (possibly dotted) name, or
    /// the `#<slot>` anonymous class.
    pub(crate) fn class_ref(&mut self, r: TypeId) -> String {
        let md = self.md;
        let rec = md.record(r);
        match rec.decl {
            Some(d) if matches!(md.decl(d).kind, DeclKind::NamedType) => {
                format!("{}/{}", self.module_ref(&self.decl_module(d)), self.dotted_name(d))
            }
            _ => {
                let slot = self.anon_slot(md.derefed(r));
                format!("{}/'#{}'", self.module_ref(&self.md.name), slot)
            }
        }
    }

    /// The `#copy` member of a record class, with the by-value `&` suffix
    /// when the record ever becomes a value type.
    pub(crate) fn record_copy_ref(&mut self, r: TypeId) -> String {
        let by_value = self.md.record(r).by_value;
        let cls = self.class_ref(r);
        let mut ty = self.format_type(Some(r));
        if by_value {
            ty.push('&');
        }
        format!("void class {}::'#copy'({})", cls, ty)
    }

    /// A full member reference: return/field type, owner path, name and
    /// formals for procedures.
    pub(crate) fn member_ref(&mut self, member: DeclId) -> String {
        let md = self.md;
        let decl = md.decl(member);
        let mut record: Option<TypeId> = None;
        let mut sig: Option<TypeId> = None;
        match &decl.kind {
            DeclKind::Field { owner } => record = Some(*owner),
            DeclKind::Variable => {}
            DeclKind::Proc(p) => {
                record = p.receiver_rec;
                sig = Some(decl.ty);
            }
            other => panic!("member reference to {:?}", other),
        }
        let mut res = match sig {
            Some(pt) => self.format_type(md.proc_sig(pt).ret),
            None => self.format_type(Some(decl.ty)),
        };
        res.push(' ');
        match record {
            Some(r) => {
                res.push_str(&self.class_ref(md.derefed(r)));
                res.push_str("::");
                res.push_str(&Self::escape(&decl.name));
            }
            None => {
                res.push_str(&self.module_ref(&self.decl_module(member)));
                res.push_str("::");
                res.push_str(&self.dotted_name(member));
            }
        }
        if let Some(pt) = sig {
            let formals = md.proc_sig(pt).formals.clone();
            res.push_str(&self.format_formals(&formals, false));
        }
        res
    }

    pub(crate) fn format_formals(&mut self, formals: &[DeclId], with_names: bool) -> String {
        let md = self.md;
        let mut res = String::from("(");
        for (i, f) in formals.iter().enumerate() {
            if i != 0 {
                res.push_str(", ");
            }
            res.push_str(&self.format_type(Some(md.decl(*f).ty)));
            if self.pass_by_ref(*f) {
                res.push('&');
            }
            if with_names {
                res.push(' ');
                res.push_str(&Self::escape(&md.decl(*f).name));
            }
        }
        res.push(')');
        res
    }

    /// The normalized signature a delegate is identified by.
    pub(crate) fn proc_type_signature(&mut self, pt: TypeId) -> String {
        let sig = self.md.proc_sig(pt).clone();
        let mut s = self.format_type(sig.ret);
        s.push('*');
        s.push_str(&self.format_formals(&sig.formals, false));
        s
    }

    pub(crate) fn delegate_name(sig: &str) -> String {
        let mut hash = Md5::new();
        hash.update(sig.as_bytes());
        let mut hex = String::with_capacity(32);
        for byte in hash.finalize() {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }

    /// The class path of the delegate for a procedure type, registering it
    /// in the module's delegate table when it is declared here.
    pub(crate) fn delegate_ref(&mut self, pt: TypeId) -> String {
        self.force_assembly_prefix = true;
        let sig = self.proc_type_signature(pt);
        let name = Self::delegate_name(&sig);
        let declared_in = self.md.ty(self.md.derefed(pt)).declared_in.clone();
        if declared_in.is_none() {
            self.delegates.insert(name.clone(), pt);
        }
        let module = declared_in.unwrap_or_else(|| self.md.name.clone());
        let res = format!("{}/'{}'", self.module_ref(&module), name);
        self.force_assembly_prefix = false;
        res
    }

    /// The static copier for an array type; requesting the reference puts
    /// the type on the generation worklist.
    pub(crate) fn array_copier_ref(&mut self, a: TypeId) -> String {
        let sig = self.format_type(Some(a));
        self.copiers.entry(sig.clone()).or_insert(a);
        format!(
            "void {}::'#copy'({}, {})",
            self.module_ref(&self.md.name),
            sig,
            sig
        )
    }

    pub(crate) fn format_base_type(kind: BaseKind) -> &'static str {
        match kind {
            BaseKind::Bool => "bool",
            BaseKind::Char | BaseKind::WChar => "char",
            BaseKind::Byte => "uint8",
            BaseKind::ShortInt => "int16",
            BaseKind::Integer => "int32",
            BaseKind::LongInt => "int64",
            BaseKind::Real => "float32",
            BaseKind::LongReal => "float64",
            BaseKind::Set => "int32",
            _ => "?",
        }
    }

    /// The IL spelling of a type; `None` is `void`.
    pub(crate) fn format_type(&mut self, t: Option<TypeId>) -> String {
        let t = match t {
            Some(t) => t,
            None => return "void".to_string(),
        };
        let md = self.md;
        match &md.ty(t).desc {
            TypeDesc::Array { elem, .. } => {
                // multi-dimensional arrays are vectors of vectors; the
                // element keeps its qualified spelling
                format!("{}[]", self.format_type(Some(*elem)))
            }
            TypeDesc::Base(k) => Self::format_base_type(*k).to_string(),
            TypeDesc::Enumeration { .. } => "uint16".to_string(),
            TypeDesc::Pointer { to } => self.format_type(Some(*to)),
            TypeDesc::Proc(_) => format!("class {}", self.delegate_ref(t)),
            TypeDesc::Quali { resolved, self_ref } => {
                if *self_ref {
                    match md.to_record(t) {
                        Some(r) => format!("class {}", self.class_ref(r)),
                        None => "[mscorlib]System.Object".to_string(),
                    }
                } else {
                    self.format_type(Some(*resolved))
                }
            }
            TypeDesc::Record(_) => format!("class {}", self.class_ref(t)),
        }
    }

    /// A formal is passed by reference iff it is `VAR` and its type is not
    /// structured; structured values are heap objects already.
    pub(crate) fn pass_by_ref(&self, p: DeclId) -> bool {
        match &self.md.decl(p).kind {
            DeclKind::Param { var, is_const, .. } => {
                *var && !*is_const && !self.md.is_structured(self.md.decl(p).ty)
            }
            _ => false,
        }
    }

    /// Converts the value on the stack to the given base type.
    pub(crate) fn convert_to(&mut self, to: BaseKind, from: TypeId, loc: RowCol) {
        if self.md.base_kind(from) == Some(to) {
            return;
        }
        let conv = match to {
            BaseKind::LongReal => ConvKind::ToR8,
            BaseKind::Real => ConvKind::ToR4,
            BaseKind::LongInt => ConvKind::ToI8,
            BaseKind::Integer | BaseKind::Set => ConvKind::ToI4,
            BaseKind::ShortInt | BaseKind::Char | BaseKind::WChar => ConvKind::ToI2,
            BaseKind::Byte | BaseKind::Bool => ConvKind::ToU1,
            _ => return,
        };
        self.line(loc).conv(conv);
    }

    /// Loads a named storage location onto the stack.
    pub(crate) fn emit_var_to_stack(&mut self, d: DeclId, loc: RowCol) {
        match self.md.decl(d).kind {
            DeclKind::Field { .. } => {
                let r = self.member_ref(d);
                self.line(loc).ldfld(&r);
            }
            DeclKind::Variable => {
                let r = self.member_ref(d);
                self.line(loc).ldsfld(&r);
            }
            DeclKind::LocalVar { slot } => {
                self.line(loc).ldloc(slot);
            }
            DeclKind::Param { slot, .. } => {
                self.line(loc).ldarg(slot);
            }
            ref other => panic!("load of non-storage declaration {:?}", other),
        }
    }

    /// Stores the stack top into a named storage location.
    pub(crate) fn emit_stack_to_var(&mut self, d: DeclId, loc: RowCol) {
        match self.md.decl(d).kind {
            DeclKind::Field { .. } => {
                let r = self.member_ref(d);
                self.line(loc).stfld(&r);
            }
            DeclKind::Variable => {
                let r = self.member_ref(d);
                self.line(loc).stsfld(&r);
            }
            DeclKind::LocalVar { slot } => {
                self.line(loc).stloc(slot);
            }
            DeclKind::Param { slot, .. } => {
                self.line(loc).starg(slot);
            }
            ref other => panic!("store into non-storage declaration {:?}", other),
        }
    }

    /// Pushes the default value of a type; structured types materialize a
    /// fresh instance. Returns `false` when no default is pushed (pointers
    /// and procedure types default to null at the caller's discretion).
    ///
    /// `lengths` carries temp-local slots holding open-array lengths, one
    /// per open dimension.
    pub(crate) fn emit_initializer(
        &mut self,
        t: TypeId,
        resolve_ptr: bool,
        loc: RowCol,
        lengths: &[u16],
    ) -> Result<bool, Diagnostic> {
        let md = self.md;
        let mut td = md.derefed(t);
        if resolve_ptr {
            if let TypeDesc::Pointer { to } = &md.ty(td).desc {
                td = md.derefed(*to);
            }
        }
        match &md.ty(td).desc {
            TypeDesc::Base(k) => {
                match k {
                    BaseKind::Bool
                    | BaseKind::Char
                    | BaseKind::WChar
                    | BaseKind::Byte
                    | BaseKind::ShortInt
                    | BaseKind::Integer
                    | BaseKind::Set => self.line(loc).ldc_i4(0),
                    BaseKind::LongInt => self.line(loc).ldc_i8(0),
                    BaseKind::Real => self.line(loc).ldc_r4(0.0),
                    BaseKind::LongReal => self.line(loc).ldc_r8(0.0),
                    other => panic!("no initializer for base type {:?}", other),
                }
                Ok(true)
            }
            TypeDesc::Enumeration { .. } => {
                self.line(loc).ldc_i4(0);
                Ok(true)
            }
            TypeDesc::Proc(_) | TypeDesc::Pointer { .. } => Ok(false),
            TypeDesc::Record(_) => {
                // the constructor initializes fields and superclasses
                let what = format!("void class {}::.ctor()", self.class_ref(td));
                self.line(loc).newobj(&what, 0);
                Ok(true)
            }
            TypeDesc::Array { elem, len } => {
                let elem = *elem;
                let et = md.derefed(elem);
                let structured = md.is_structured(et);
                let mut len_slot: Option<u16> = None;
                let mut owned_len = false;
                if let Some(first) = lengths.first() {
                    self.line(loc).ldloc(*first);
                    len_slot = Some(*first);
                } else {
                    self.line(loc).ldc_i4(len.unwrap_or(0) as i32);
                    if structured {
                        let slot = self.temps.buy();
                        self.line(loc).dup();
                        self.line(loc).stloc(slot);
                        len_slot = Some(slot);
                        owned_len = true;
                    }
                }
                // the element spelling must keep its qualified form
                let elem_spelling = self.format_type(Some(elem));
                self.line(loc).newarr(&elem_spelling);

                if structured {
                    let i = self.temps.buy();
                    self.line(loc).ldc_i4(0);
                    self.line(loc).stloc(i);
                    let check_len = self.em.new_label();
                    self.line(loc).label(check_len);
                    self.line(loc).ldloc(i);
                    let ls = len_slot.expect("structured array without length");
                    self.line(loc).ldloc(ls);
                    let after_loop = self.em.new_label();
                    self.line(loc).bge(after_loop);

                    self.line(loc).dup();
                    self.line(loc).ldloc(i);
                    let rest: &[u16] = if lengths.len() > 1 { &lengths[1..] } else { &[] };
                    self.emit_initializer(elem, false, loc, rest)?;
                    self.line(loc).stelem(&elem_spelling);

                    self.line(loc).ldloc(i);
                    self.line(loc).ldc_i4(1);
                    self.line(loc).add();
                    self.line(loc).stloc(i);
                    self.line(loc).br(check_len);
                    self.line(loc).label(after_loop);
                    self.temps.sell(i);
                }
                if owned_len {
                    self.temps.sell(len_slot.expect("owned length slot"));
                }
                Ok(true)
            }
            TypeDesc::Quali { .. } => unreachable!("derefed type"),
        }
    }

    /// Reads the length of every open dimension from the array on the
    /// stack into fresh temp locals. Consumes the array.
    pub(crate) fn emit_calc_lengths(
        &mut self,
        t: TypeId,
        lengths: &mut Vec<u16>,
        loc: RowCol,
    ) {
        let md = self.md;
        let mut cur = md.derefed(t);
        while let TypeDesc::Array { elem, len: None } = &md.ty(cur).desc {
            let elem = *elem;
            self.line(loc).dup();
            self.line(loc).ldlen();
            let len = self.temps.buy();
            lengths.push(len);
            self.line(loc).stloc(len);
            self.line(loc).ldc_i4(0);
            let spelling = self.format_type(Some(elem));
            self.line(loc).ldelem(&spelling);
            cur = md.derefed(elem);
        }
        self.line(loc).pop();
    }

    /// Default-initializes a variable or local; for by-value structured
    /// parameters, materializes the callee's private copy.
    pub(crate) fn emit_named_initializer(&mut self, d: DeclId) -> Result<(), Diagnostic> {
        let md = self.md;
        let decl = md.decl(d);
        let loc = decl.loc;
        match &decl.kind {
            DeclKind::Variable | DeclKind::LocalVar { .. } => {
                if self.emit_initializer(decl.ty, false, loc, &[])? {
                    self.emit_stack_to_var(d, loc);
                }
                Ok(())
            }
            DeclKind::Param { var, .. } => {
                let t = md.derefed(decl.ty);
                if !*var && md.is_structured(t) {
                    let mut lengths = Vec::new();
                    let open_array =
                        matches!(&md.ty(t).desc, TypeDesc::Array { len: None, .. });
                    if open_array {
                        // open arrays read their lengths from the actual
                        self.emit_var_to_stack(d, loc);
                        self.emit_calc_lengths(t, &mut lengths, loc);
                    }
                    self.emit_initializer(decl.ty, false, loc, &lengths)?;
                    self.line(loc).dup();
                    self.emit_var_to_stack(d, loc);
                    if md.is_record(t) {
                        let what = self.record_copy_ref(t);
                        self.line(loc).callvirt(&what, 1, false);
                    } else {
                        let copier = self.array_copier_ref(t);
                        self.line(loc).call(&copier, 2, false, false);
                    }
                    self.emit_stack_to_var(d, loc);
                    for slot in lengths {
                        self.temps.sell(slot);
                    }
                }
                Ok(())
            }
            other => panic!("initializer for {:?}", other),
        }
    }

    /// Dereference through a by-ref parameter slot according to the
    /// formal's type.
    pub(crate) fn emit_byref_fetch(&mut self, ty: TypeId, loc: RowCol) {
        let md = self.md;
        let td = md.derefed(ty);
        match &md.ty(td).desc {
            TypeDesc::Pointer { .. } | TypeDesc::Proc(_) => self.line(loc).ldind(IndKind::Ref),
            TypeDesc::Enumeration { .. } => self.line(loc).ldind(IndKind::U4),
            TypeDesc::Base(k) => {
                let kind = match k {
                    BaseKind::LongReal => IndKind::R8,
                    BaseKind::Real => IndKind::R4,
                    BaseKind::LongInt => IndKind::I8,
                    BaseKind::Integer => IndKind::I4,
                    BaseKind::Set => IndKind::U4,
                    BaseKind::ShortInt => IndKind::I2,
                    BaseKind::Char | BaseKind::WChar => IndKind::U2,
                    // bool is one byte in memory, four on the stack
                    BaseKind::Byte | BaseKind::Bool => IndKind::U1,
                    other => panic!("by-ref fetch of {:?}", other),
                };
                self.line(loc).ldind(kind)
            }
            other => panic!("by-ref fetch of structured type {:?}", other),
        }
    }

    /// The relational runtime trampoline over chars and char arrays; `op`
    /// encodes the relation (EQ=1 .. GEQ=6).
    pub(crate) fn string_op(&mut self, lhs_char: bool, rhs_char: bool, op: i32, loc: RowCol) {
        self.line(loc).ldc_i4(op);
        let what = match (lhs_char, rhs_char) {
            (true, true) => "bool [OBX.Runtime]OBX.Runtime::relOp(char,char,int32)",
            (true, false) => "bool [OBX.Runtime]OBX.Runtime::relOp(char,char[],int32)",
            (false, true) => "bool [OBX.Runtime]OBX.Runtime::relOp(char[],char,int32)",
            (false, false) => "bool [OBX.Runtime]OBX.Runtime::relOp(char[],char[],int32)",
        };
        self.line(loc).call(what, 3, true, false);
    }

    /// Pushes a typed constant.
    pub(crate) fn emit_const(&mut self, kind: BaseKind, val: &Value, loc: RowCol) {
        match kind {
            BaseKind::Bool => {
                let v = matches!(val, Value::Bool(true));
                self.line(loc).ldc_i4(v as i32);
            }
            BaseKind::ShortInt | BaseKind::Integer | BaseKind::Byte | BaseKind::EnumInt => {
                let v = match val {
                    Value::Int(i) => *i as i32,
                    Value::Enum(i) => *i as i32,
                    Value::Char(c) => *c as i32,
                    other => panic!("integer constant holds {:?}", other),
                };
                self.line(loc).ldc_i4(v);
            }
            BaseKind::LongInt => {
                let v = match val {
                    Value::Int(i) => *i,
                    other => panic!("int64 constant holds {:?}", other),
                };
                self.line(loc).ldc_i8(v);
            }
            // both real widths load as r8: the stack is F anyway and r4
            // literals cause round-off on later widening
            BaseKind::Real | BaseKind::LongReal => {
                let v = match val {
                    Value::Real(r) => *r,
                    Value::Int(i) => *i as f64,
                    other => panic!("real constant holds {:?}", other),
                };
                self.line(loc).ldc_r8(v);
            }
            BaseKind::Nil => self.line(loc).ldnull(),
            BaseKind::Str | BaseKind::WStr => {
                let s = match val {
                    Value::Str(s) => s.clone(),
                    other => panic!("string constant holds {:?}", other),
                };
                let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
                // without the explicit terminator the char array has no
                // trailing zero and strlen disagrees with the source
                let lit = format!("\"{}\\0\"", escaped);
                self.line(loc).ldstr(&lit);
                self.line(loc)
                    .callvirt("char[] [mscorlib]System.String::ToCharArray()", 0, true);
            }
            BaseKind::ByteArray => {
                let bytes = match val {
                    Value::Bytes(b) => b.clone(),
                    other => panic!("byte-array constant holds {:?}", other),
                };
                self.line(loc).ldc_i4(bytes.len() as i32);
                self.line(loc).newarr("uint8");
                for (i, b) in bytes.iter().enumerate() {
                    self.line(loc).dup();
                    self.line(loc).ldc_i4(i as i32);
                    self.line(loc).ldc_i4(*b as i32);
                    self.line(loc).stelem("uint8");
                }
            }
            BaseKind::Char | BaseKind::WChar => {
                let v = match val {
                    Value::Char(c) => *c as i32,
                    Value::Int(i) => *i as i32,
                    other => panic!("char constant holds {:?}", other),
                };
                self.line(loc).ldc_i4(v);
            }
            BaseKind::Set => {
                let v = match val {
                    Value::Set(s) => *s as i32,
                    Value::Int(i) => *i as i32,
                    other => panic!("set constant holds {:?}", other),
                };
                self.line(loc).ldc_i4(v);
            }
            other => panic!("constant of base type {:?}", other),
        }
    }

    pub(crate) fn exported(vis: Visibility) -> bool {
        matches!(vis, Visibility::ReadWrite | Visibility::ReadOnly)
    }
}

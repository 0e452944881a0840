//! Managed-module object model and binary back end.
//!
//! Receives the IL stream through the [`IlBackend`] trait, resolves every
//! textual type and member reference through the signature parser into a
//! shared symbol tree, optimizes each finished method (short-form
//! instruction selection), and dumps the whole module either as textual
//! assembly or as the binary module container.
//!
//! Ownership follows the arena discipline used across the crate: nodes,
//! classes, types, fields and methods live in flat tables on
//! [`ObjectModel`]; tree edges are ids, parent links are back-references
//! only.

pub mod bytecode;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::il::{BackendError, IlBackend, IlMethod, IlOp, MethodKind, ModuleKind};
use crate::sig::{self, SigError};

/// Index of a [`Node`] in the symbol tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// What a tree node stands for. Nodes are created by name first and get
/// their item when the reference context makes the kind known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Item {
    None,
    Assembly(usize),
    Namespace,
    Class(usize),
    Type(usize),
    Field(usize),
    Method(usize),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    /// Children by name; a vector per name because methods overload.
    pub subs: BTreeMap<String, Vec<NodeId>>,
    pub item: Item,
}

/// Member-resolution hints carried by the IL stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberHint {
    TypeRef,
    Instance,
    Static,
    Virtual,
}

#[derive(Clone, Debug)]
pub struct AssemblyDef {
    pub name: String,
    pub external: bool,
}

#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: String,
    pub is_public: bool,
    pub extends: Option<usize>,
    pub fields: Vec<usize>,
    pub methods: Vec<usize>,
    pub nested: Vec<usize>,
    pub node: NodeId,
}

/// Primitive types of the target machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Prim {
    Void,
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    R32,
    R64,
    INative,
    UNative,
    Str,
    Object,
}

impl Prim {
    pub fn spelling(self) -> &'static str {
        match self {
            Prim::Void => "void",
            Prim::Bool => "bool",
            Prim::Char => "char",
            Prim::I8 => "int8",
            Prim::U8 => "uint8",
            Prim::I16 => "int16",
            Prim::U16 => "uint16",
            Prim::I32 => "int32",
            Prim::U32 => "uint32",
            Prim::I64 => "int64",
            Prim::U64 => "uint64",
            Prim::R32 => "float32",
            Prim::R64 => "float64",
            Prim::INative => "native int",
            Prim::UNative => "native unsigned int",
            Prim::Str => "string",
            Prim::Object => "object",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Prim(Prim),
    Class(usize),
}

/// A deduplicated type instance: primitive or class, with array and by-ref
/// decoration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeEntry {
    pub kind: TypeKind,
    pub array_level: u8,
    pub by_ref: bool,
}

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub ty: usize,
    pub is_static: bool,
    pub is_public: bool,
    pub owner: Option<usize>,
    pub node: NodeId,
}

#[derive(Clone, Debug)]
pub struct ParamDef {
    pub name: String,
    pub ty: usize,
    /// Whitespace-normalized source text of the type, the overload key.
    pub type_str: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PeOperand {
    None,
    Label(String),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Type(usize),
    Field(usize),
    Method(usize),
    Local(u16),
    Arg(u16),
    LineMark(u32, u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PeInstr {
    pub op: IlOp,
    pub operand: PeOperand,
}

#[derive(Clone, Debug)]
pub struct MethodDef {
    pub name: String,
    pub kind: MethodKind,
    pub is_runtime: bool,
    pub entry_point: bool,
    pub max_stack: u16,
    pub ret: usize,
    pub params: Vec<ParamDef>,
    pub locals: Vec<(String, usize)>,
    pub body: Vec<PeInstr>,
    pub owner: Option<usize>,
    pub node: NodeId,
}

/// The symbol tree plus the flat definition tables it indexes into.
#[derive(Debug, Default)]
pub struct ObjectModel {
    pub nodes: Vec<Node>,
    pub assemblies: Vec<AssemblyDef>,
    pub classes: Vec<ClassDef>,
    pub types: Vec<TypeEntry>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    /// Classes directly under the working assembly, in emission order.
    pub top_classes: Vec<usize>,
}

pub const ROOT: NodeId = NodeId(0);

impl ObjectModel {
    /// A model rooted at the working assembly `name`, with the well-known
    /// `mscorlib` classes pre-seeded so superclass references resolve
    /// without special cases.
    pub fn new(name: &str) -> Self {
        let mut m = ObjectModel::default();
        m.assemblies.push(AssemblyDef {
            name: name.to_string(),
            external: false,
        });
        m.nodes.push(Node {
            name: name.to_string(),
            parent: None,
            subs: BTreeMap::new(),
            item: Item::Assembly(0),
        });
        let mscorlib = m.fetch_assembly("mscorlib");
        let system = m.add_node(mscorlib, "System", Item::Namespace);
        for well_known in ["Object", "ValueType", "Enum", "MulticastDelegate"] {
            let node = m.add_node(system, well_known, Item::None);
            m.create_class_for(node).expect("well-known class");
        }
        m
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn add_node(&mut self, parent: NodeId, name: &str, item: Item) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: name.to_string(),
            parent: Some(parent),
            subs: BTreeMap::new(),
            item,
        });
        self.nodes[parent.0 as usize]
            .subs
            .entry(name.to_string())
            .or_default()
            .push(id);
        id
    }

    /// First child with the given name.
    pub fn sub(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)
            .subs
            .get(name)
            .and_then(|v| v.first())
            .copied()
    }

    pub fn fetch_assembly(&mut self, name: &str) -> NodeId {
        if self.node(ROOT).name == name {
            return ROOT;
        }
        if let Some(id) = self.sub(ROOT, name) {
            return id;
        }
        let idx = self.assemblies.len();
        self.assemblies.push(AssemblyDef {
            name: name.to_string(),
            external: true,
        });
        self.add_node(ROOT, name, Item::Assembly(idx))
    }

    /// The sentinel child of the root holding one node per primitive
    /// spelling.
    fn primitives_node(&mut self) -> NodeId {
        if let Some(id) = self.sub(ROOT, "") {
            return id;
        }
        self.add_node(ROOT, "", Item::Namespace)
    }

    pub fn fetch_primitive(&mut self, name: &str) -> Result<NodeId, SigError> {
        let p = self.primitives_node();
        if let Some(id) = self.sub(p, name) {
            return Ok(id);
        }
        let prim = match name {
            "bool" => Prim::Bool,
            "char" => Prim::Char,
            "int8" => Prim::I8,
            "unsigned int8" | "uint8" => Prim::U8,
            "int16" => Prim::I16,
            "unsigned int16" | "uint16" => Prim::U16,
            "int32" => Prim::I32,
            "unsigned int32" | "uint32" => Prim::U32,
            "int64" => Prim::I64,
            "unsigned int64" | "uint64" => Prim::U64,
            "float32" => Prim::R32,
            "float64" => Prim::R64,
            "native int" | "int" => Prim::INative,
            "native unsigned int" | "native uint" | "uint" => Prim::UNative,
            "string" => Prim::Str,
            "object" => Prim::Object,
            "void" => Prim::Void,
            _ => {
                return Err(SigError::new("invalid primitive type", name));
            }
        };
        let ty = self.intern_type(TypeEntry {
            kind: TypeKind::Prim(prim),
            array_level: 0,
            by_ref: false,
        });
        Ok(self.add_node(p, name, Item::Type(ty)))
    }

    fn intern_type(&mut self, entry: TypeEntry) -> usize {
        self.types.push(entry);
        self.types.len() - 1
    }

    /// Materializes a class for a node that was first seen as a bare name.
    pub fn create_class_for(&mut self, node: NodeId) -> Result<usize, SigError> {
        if let Item::Class(c) = self.node(node).item {
            return Ok(c);
        }
        if self.node(node).item != Item::None {
            return Err(SigError::new(
                "reference does not name a class",
                &self.node(node).name,
            ));
        }
        let idx = self.classes.len();
        self.classes.push(ClassDef {
            name: self.node(node).name.clone(),
            is_public: true,
            extends: None,
            fields: Vec::new(),
            methods: Vec::new(),
            nested: Vec::new(),
            node,
        });
        self.nodes[node.0 as usize].item = Item::Class(idx);
        let parent = self.node(node).parent;
        if let Some(p) = parent {
            if let Item::Class(pc) = self.node(p).item {
                self.classes[pc].nested.push(idx);
            } else if p == ROOT || matches!(self.node(p).item, Item::Assembly(0)) {
                self.top_classes.push(idx);
            }
        }
        Ok(idx)
    }

    /// The type instance standing for a node with optional `[]`/`&`
    /// decoration; creating the suffix node is idempotent.
    pub fn suffix_type(
        &mut self,
        base: NodeId,
        array_level: u8,
        by_ref: bool,
    ) -> Result<NodeId, SigError> {
        let mut suffix = String::new();
        for _ in 0..array_level {
            suffix.push_str("[]");
        }
        if by_ref {
            suffix.push('&');
        }
        match self.node(base).item {
            Item::Type(t) => {
                // a primitive: the undecorated node is itself the type
                if suffix.is_empty() {
                    return Ok(base);
                }
                if let Some(id) = self.sub(base, &suffix) {
                    return Ok(id);
                }
                let entry = TypeEntry {
                    kind: self.types[t].kind,
                    array_level,
                    by_ref,
                };
                let ty = self.intern_type(entry);
                Ok(self.add_node(base, &suffix, Item::Type(ty)))
            }
            _ => {
                let cls = self.create_class_for(base)?;
                if let Some(id) = self.sub(base, &suffix) {
                    return Ok(id);
                }
                let ty = self.intern_type(TypeEntry {
                    kind: TypeKind::Class(cls),
                    array_level,
                    by_ref,
                });
                Ok(self.add_node(base, &suffix, Item::Type(ty)))
            }
        }
    }

    /// The `TypeEntry` index behind a resolved type node.
    pub fn type_of(&self, node: NodeId) -> Result<usize, SigError> {
        match self.node(node).item {
            Item::Type(t) => Ok(t),
            _ => Err(SigError::new(
                "reference does not name a type",
                &self.node(node).name,
            )),
        }
    }

    fn params_equal(&self, method: usize, pars: &[ParamDef]) -> bool {
        let m = &self.methods[method];
        m.params.len() == pars.len()
            && m.params
                .iter()
                .zip(pars.iter())
                .all(|(a, b)| a.type_str == b.type_str)
    }

    /// Methods are keyed by name plus normalized parameter-type list; a
    /// matching signature returns the existing node.
    pub fn find_or_create_method(
        &mut self,
        cls_node: NodeId,
        name: &str,
        pars: Vec<ParamDef>,
        ret: usize,
        hint: MemberHint,
    ) -> Result<NodeId, SigError> {
        let cls = self.create_class_for(cls_node)?;
        if let Some(members) = self.node(cls_node).subs.get(name) {
            let members = members.clone();
            for node in members {
                match self.node(node).item {
                    Item::Method(m) => {
                        if self.params_equal(m, &pars) {
                            return Ok(node);
                        }
                    }
                    Item::Field(_) => {
                        return Err(SigError::new("member is not a method", name));
                    }
                    _ => {}
                }
            }
        }
        let kind = match hint {
            MemberHint::Static => MethodKind::Static,
            MemberHint::Virtual => MethodKind::Virtual,
            _ => MethodKind::Instance,
        };
        let idx = self.methods.len();
        self.methods.push(MethodDef {
            name: name.to_string(),
            kind,
            is_runtime: false,
            entry_point: false,
            max_stack: 0,
            ret,
            params: pars,
            locals: Vec::new(),
            body: Vec::new(),
            owner: Some(cls),
            node: ROOT,
        });
        self.classes[cls].methods.push(idx);
        let node = self.add_node(cls_node, name, Item::Method(idx));
        self.methods[idx].node = node;
        Ok(node)
    }

    pub fn find_or_create_field(
        &mut self,
        cls_node: NodeId,
        name: &str,
        ty: usize,
        is_static: bool,
        is_public: bool,
    ) -> Result<NodeId, SigError> {
        let cls = self.create_class_for(cls_node)?;
        if let Some(id) = self.sub(cls_node, name) {
            return match self.node(id).item {
                Item::Field(_) => Ok(id),
                _ => Err(SigError::new("member is not a field", name)),
            };
        }
        let idx = self.fields.len();
        self.fields.push(FieldDef {
            name: name.to_string(),
            ty,
            is_static,
            is_public,
            owner: Some(cls),
            node: ROOT,
        });
        self.classes[cls].fields.push(idx);
        let node = self.add_node(cls_node, name, Item::Field(idx));
        self.fields[idx].node = node;
        Ok(node)
    }

    // canonical re-serialization

    /// The scope prefix a node contributes when children are printed.
    fn prefix(&self, id: NodeId) -> String {
        let n = self.node(id);
        match n.item {
            Item::Assembly(a) => {
                if self.assemblies[a].external {
                    format!("[{}]", n.name)
                } else {
                    String::new()
                }
            }
            Item::Namespace => {
                if n.name.is_empty() {
                    String::new() // primitive sentinel
                } else {
                    let p = n.parent.map(|p| self.prefix(p)).unwrap_or_default();
                    format!("{}{}.", p, n.name)
                }
            }
            Item::Class(_) => {
                let p = n.parent.map(|p| self.prefix(p)).unwrap_or_default();
                format!("{}{}/", p, n.name)
            }
            _ => String::new(),
        }
    }

    /// Canonical spelling of a type node (class path or primitive, with
    /// suffixes).
    pub fn canonical_type_name(&self, id: NodeId) -> String {
        let n = self.node(id);
        let is_suffix = n.name.is_empty() || n.name.starts_with("[]") || n.name.starts_with('&');
        if is_suffix {
            let parent = n.parent.expect("suffix node without parent");
            return format!("{}{}", self.canonical_type_name(parent), n.name);
        }
        let p = n.parent.map(|p| self.prefix(p)).unwrap_or_default();
        format!("{}{}", p, n.name)
    }

    /// Canonical spelling of a resolved member node.
    pub fn canonical_member_name(&self, id: NodeId) -> String {
        let n = self.node(id);
        let owner = n
            .parent
            .map(|p| self.canonical_type_name(p))
            .unwrap_or_default();
        match n.item {
            Item::Method(m) => {
                let m = &self.methods[m];
                let pars = m
                    .params
                    .iter()
                    .map(|p| p.type_str.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "{} {}::{}({})",
                    self.type_name(m.ret),
                    owner,
                    m.name,
                    pars
                )
            }
            Item::Field(f) => {
                let f = &self.fields[f];
                format!("{} {}::{}", self.type_name(f.ty), owner, f.name)
            }
            _ => owner,
        }
    }

    /// Spelling of a type-table entry.
    pub fn type_name(&self, ty: usize) -> String {
        let t = &self.types[ty];
        let mut s = match t.kind {
            TypeKind::Prim(p) => p.spelling().to_string(),
            TypeKind::Class(c) => self.canonical_type_name(self.classes[c].node),
        };
        for _ in 0..t.array_level {
            s.push_str("[]");
        }
        if t.by_ref {
            s.push('&');
        }
        s
    }
}

/// Output formats of [`PeBuilder::dump_output_file`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Dll,
    Exe,
}

/// The binary back end: an [`IlBackend`] that accumulates an
/// [`ObjectModel`].
pub struct PeBuilder {
    pub model: ObjectModel,
    module_name: String,
    module_kind: ModuleKind,
    /// Class nesting stack during emission.
    level: Vec<NodeId>,
    /// Current `.line` marker, for signature error reports.
    line: String,
    entry_point: Option<usize>,
}

impl Default for PeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PeBuilder {
    pub fn new() -> Self {
        PeBuilder {
            model: ObjectModel::new(""),
            module_name: String::new(),
            module_kind: ModuleKind::Library,
            level: Vec::new(),
            line: String::new(),
            entry_point: None,
        }
    }

    fn sig_err(&self, e: SigError) -> BackendError {
        BackendError::new(format!(
            "{} (module {}, line {})",
            e, self.module_name, self.line
        ))
    }

    fn find_type(&mut self, reference: &str) -> Result<NodeId, BackendError> {
        sig::parse_type_ref(&mut self.model, reference).map_err(|e| self.sig_err(e))
    }

    fn find_member(&mut self, reference: &str, hint: MemberHint) -> Result<NodeId, BackendError> {
        sig::parse_member_ref(&mut self.model, reference, hint).map_err(|e| self.sig_err(e))
    }

    fn type_operand(&mut self, arg: &str) -> Result<PeOperand, BackendError> {
        let node = self.find_type(arg)?;
        let ty = self.model.type_of(node).map_err(|e| self.sig_err(e))?;
        Ok(PeOperand::Type(ty))
    }

    fn method_operand(&mut self, arg: &str, hint: MemberHint) -> Result<PeOperand, BackendError> {
        let node = self.find_member(arg, hint)?;
        match self.model.node(node).item {
            Item::Method(m) => Ok(PeOperand::Method(m)),
            _ => Err(self.sig_err(SigError::new("expected a method reference", arg))),
        }
    }

    fn field_operand(&mut self, arg: &str, hint: MemberHint) -> Result<PeOperand, BackendError> {
        let node = self.find_member(arg, hint)?;
        match self.model.node(node).item {
            Item::Field(f) => Ok(PeOperand::Field(f)),
            _ => Err(self.sig_err(SigError::new("expected a field reference", arg))),
        }
    }

    /// Writes the finished module as textual assembly.
    pub fn write_assembler<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        for a in &self.model.assemblies {
            if a.external {
                writeln!(w, ".assembly extern '{}' {{}}", a.name)?;
            }
        }
        writeln!(w, ".assembly '{}' {{}}", self.module_name)?;
        let ext = match self.module_kind {
            ModuleKind::Library => "dll",
            _ => "exe",
        };
        writeln!(w, ".module '{}.{}'", self.module_name, ext)?;
        for cls in &self.model.top_classes {
            self.write_class(&mut w, *cls, 0)?;
        }
        w.flush()
    }

    fn write_class<W: Write>(&self, w: &mut W, cls: usize, level: usize) -> std::io::Result<()> {
        let m = &self.model;
        let c = &m.classes[cls];
        let ws = "    ".repeat(level);
        let nested = if level > 0 { "nested " } else { "" };
        let vis = if c.is_public { "public" } else { "assembly" };
        let extends = match c.extends {
            Some(sup) => m.canonical_type_name(m.classes[sup].node),
            None => "[mscorlib]System.Object".to_string(),
        };
        writeln!(
            w,
            "{}.class {}{} '{}' extends {} {{",
            ws, nested, vis, c.name, extends
        )?;
        let inner = "    ".repeat(level + 1);
        for f in &c.fields {
            let f = &m.fields[*f];
            let stat = if f.is_static { "static " } else { "" };
            let vis = if f.is_public { "public" } else { "assembly" };
            writeln!(
                w,
                "{}.field {} {}{} '{}'",
                inner,
                vis,
                stat,
                m.type_name(f.ty),
                f.name
            )?;
        }
        for nested_cls in &c.nested {
            self.write_class(w, *nested_cls, level + 1)?;
        }
        for meth in &c.methods {
            self.write_method(w, *meth, level + 1)?;
        }
        writeln!(w, "{}}}", ws)?;
        Ok(())
    }

    fn write_method<W: Write>(&self, w: &mut W, meth: usize, level: usize) -> std::io::Result<()> {
        let m = &self.model;
        let md = &m.methods[meth];
        let ws = "    ".repeat(level);
        let inner = "    ".repeat(level + 1);
        let mut attrs = String::from("public");
        if md.name == ".ctor" || md.name == ".cctor" {
            attrs.push_str(" specialname rtspecialname");
        }
        match md.kind {
            MethodKind::Static | MethodKind::Primary => attrs.push_str(" static"),
            MethodKind::Virtual => attrs.push_str(" virtual instance"),
            MethodKind::Instance => attrs.push_str(" instance"),
        }
        let pars = md
            .params
            .iter()
            .map(|p| format!("{} '{}'", m.type_name(p.ty), p.name))
            .collect::<Vec<_>>()
            .join(", ");
        let body_kind = if md.is_runtime { "runtime" } else { "cil" };
        writeln!(
            w,
            "{}.method {} {} '{}'({}) {} managed {{",
            ws,
            attrs,
            m.type_name(md.ret),
            md.name,
            pars,
            body_kind
        )?;
        if md.entry_point {
            writeln!(w, "{}.entrypoint", inner)?;
        }
        if !md.is_runtime {
            writeln!(w, "{}.maxstack {}", inner, md.max_stack)?;
        }
        if !md.locals.is_empty() {
            let locals = md
                .locals
                .iter()
                .map(|(n, t)| format!("{} '{}'", m.type_name(*t), n))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(w, "{}.locals init ({})", inner, locals)?;
        }
        for instr in &md.body {
            match (&instr.op, &instr.operand) {
                (IlOp::Label, PeOperand::Label(l)) => writeln!(w, "{}'#{}':", inner, l)?,
                (IlOp::Line, PeOperand::LineMark(r, c)) => {
                    writeln!(w, "{}.line {}:{}", inner, r, c)?
                }
                (op, PeOperand::Label(l)) => {
                    writeln!(w, "{}{} '#{}'", inner, op.mnemonic(), l)?
                }
                (op, PeOperand::None) => writeln!(w, "{}{}", inner, op.mnemonic())?,
                (op, PeOperand::I32(v)) => writeln!(w, "{}{} {}", inner, op.mnemonic(), v)?,
                (op, PeOperand::I64(v)) => writeln!(w, "{}{} {}", inner, op.mnemonic(), v)?,
                (op, PeOperand::F64(v)) => writeln!(w, "{}{} {}", inner, op.mnemonic(), v)?,
                (op, PeOperand::Str(s)) => {
                    writeln!(w, "{}{} \"{}\"", inner, op.mnemonic(), s)?
                }
                (op, PeOperand::Type(t)) => {
                    writeln!(w, "{}{} {}", inner, op.mnemonic(), m.type_name(*t))?
                }
                (op, PeOperand::Method(meth)) => {
                    let name = m.canonical_member_name(m.methods[*meth].node);
                    writeln!(w, "{}{} {}", inner, op.mnemonic(), name)?
                }
                (op, PeOperand::Field(f)) => {
                    let name = m.canonical_member_name(m.fields[*f].node);
                    writeln!(w, "{}{} {}", inner, op.mnemonic(), name)?
                }
                (op, PeOperand::Local(n)) => writeln!(w, "{}{} {}", inner, op.mnemonic(), n)?,
                (op, PeOperand::Arg(n)) => writeln!(w, "{}{} {}", inner, op.mnemonic(), n)?,
                (op, _) => writeln!(w, "{}{}", inner, op.mnemonic())?,
            }
        }
        writeln!(w, "{}}}", ws)?;
        Ok(())
    }

    /// Writes the module in the chosen format; `gui` toggles the subsystem
    /// flag of binary outputs.
    pub fn dump_output_file(
        &self,
        path: &Path,
        format: OutputFormat,
        gui: bool,
    ) -> Result<(), BackendError> {
        let file = std::fs::File::create(path)?;
        match format {
            OutputFormat::Text => {
                self.write_assembler(std::io::BufWriter::new(file))?;
            }
            OutputFormat::Dll | OutputFormat::Exe => {
                let bytes = bytecode::encode(
                    &self.model,
                    &self.module_name,
                    format == OutputFormat::Exe,
                    gui,
                    self.entry_point,
                )?;
                let mut w = std::io::BufWriter::new(file);
                w.write_all(&bytes)?;
                w.flush()?;
            }
        }
        Ok(())
    }
}

fn unescape(name: &str) -> &str {
    name.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(name)
}

/// Whitespace-normalizes a type spelling for signature comparison.
pub fn simplify_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl IlBackend for PeBuilder {
    fn begin_module(
        &mut self,
        name: &str,
        imports: &[String],
        _source_file: &str,
        kind: ModuleKind,
    ) -> Result<(), BackendError> {
        let name = unescape(name).to_string();
        self.model = ObjectModel::new(&name);
        self.module_name = name.clone();
        self.module_kind = kind;
        self.level.clear();
        self.entry_point = None;
        for imp in imports {
            self.model.fetch_assembly(unescape(imp));
        }
        let module_node = self.model.add_node(ROOT, &name, Item::None);
        self.model
            .create_class_for(module_node)
            .map_err(|e| self.sig_err(e))?;
        self.level.push(module_node);
        Ok(())
    }

    fn end_module(&mut self) -> Result<(), BackendError> {
        assert!(!self.level.is_empty(), "end_module without begin_module");
        self.level.pop();
        Ok(())
    }

    fn begin_class(
        &mut self,
        name: &str,
        is_public: bool,
        super_ref: Option<&str>,
    ) -> Result<(), BackendError> {
        let parent = *self.level.last().expect("begin_class outside a module");
        let name = unescape(name).to_string();
        let node = match self.model.sub(parent, &name) {
            Some(n) => n,
            None => self.model.add_node(parent, &name, Item::None),
        };
        let cls = self.model.create_class_for(node).map_err(|e| self.sig_err(e))?;
        self.model.classes[cls].is_public = is_public;
        if let Some(sup) = super_ref {
            if self.model.classes[cls].extends.is_none() {
                let sup_node = self.find_type(sup)?;
                let sup_ty = self.model.type_of(sup_node).map_err(|e| self.sig_err(e))?;
                match self.model.types[sup_ty].kind {
                    TypeKind::Class(sc) => self.model.classes[cls].extends = Some(sc),
                    TypeKind::Prim(_) => {
                        return Err(
                            self.sig_err(SigError::new("superclass is not a class", sup))
                        );
                    }
                }
            }
        }
        self.level.push(node);
        Ok(())
    }

    fn end_class(&mut self) -> Result<(), BackendError> {
        assert!(self.level.len() > 1, "end_class without begin_class");
        self.level.pop();
        Ok(())
    }

    fn add_field(
        &mut self,
        name: &str,
        type_ref: &str,
        is_public: bool,
        is_static: bool,
    ) -> Result<(), BackendError> {
        let owner = *self.level.last().expect("add_field outside a module");
        let ty_node = self.find_type(type_ref)?;
        let ty = self.model.type_of(ty_node).map_err(|e| self.sig_err(e))?;
        self.model
            .find_or_create_field(owner, unescape(name), ty, is_static, is_public)
            .map_err(|e| self.sig_err(e))?;
        Ok(())
    }

    fn add_method(&mut self, method: &IlMethod) -> Result<(), BackendError> {
        let owner = *self.level.last().expect("add_method outside a module");
        let ret_ref = method.ret_type.as_deref().unwrap_or("void");
        let ret_node = self.find_type(ret_ref)?;
        let ret = self.model.type_of(ret_node).map_err(|e| self.sig_err(e))?;

        let mut pars = Vec::new();
        for (ty_ref, name) in &method.args {
            let node = self.find_type(ty_ref)?;
            let ty = self.model.type_of(node).map_err(|e| self.sig_err(e))?;
            pars.push(ParamDef {
                name: unescape(name).to_string(),
                ty,
                type_str: simplify_ws(ty_ref),
            });
        }
        let hint = match method.kind {
            MethodKind::Static | MethodKind::Primary => MemberHint::Static,
            MethodKind::Virtual => MemberHint::Virtual,
            MethodKind::Instance => MemberHint::Instance,
        };
        let node = self
            .model
            .find_or_create_method(owner, unescape(&method.name), pars, ret, hint)
            .map_err(|e| self.sig_err(e))?;
        let idx = match self.model.node(node).item {
            Item::Method(m) => m,
            _ => unreachable!("find_or_create_method yields a method node"),
        };

        let mut locals = Vec::new();
        for (ty_ref, name) in &method.locals {
            let n = self.find_type(ty_ref)?;
            let ty = self.model.type_of(n).map_err(|e| self.sig_err(e))?;
            locals.push((unescape(name).to_string(), ty));
        }

        let mut body = Vec::with_capacity(method.body.len());
        for instr in &method.body {
            let operand = match instr.op {
                IlOp::Label => PeOperand::Label(instr.arg.clone()),
                IlOp::Line => {
                    self.line = instr.arg.clone();
                    let (r, c) = instr
                        .arg
                        .split_once(':')
                        .and_then(|(r, c)| Some((r.parse().ok()?, c.parse().ok()?)))
                        .unwrap_or((0, 0));
                    PeOperand::LineMark(r, c)
                }
                IlOp::Br
                | IlOp::Brtrue
                | IlOp::Brfalse
                | IlOp::Beq
                | IlOp::Bge
                | IlOp::Bgt
                | IlOp::Ble
                | IlOp::Blt
                | IlOp::BneUn => PeOperand::Label(instr.arg.clone()),
                IlOp::Call => {
                    let hint = if instr.instance {
                        MemberHint::Instance
                    } else {
                        MemberHint::Static
                    };
                    self.method_operand(&instr.arg, hint)?
                }
                IlOp::Callvirt | IlOp::Ldvirtftn => {
                    self.method_operand(&instr.arg, MemberHint::Virtual)?
                }
                IlOp::Newobj => self.method_operand(&instr.arg, MemberHint::Instance)?,
                IlOp::Ldftn => self.method_operand(&instr.arg, MemberHint::Static)?,
                IlOp::Box
                | IlOp::Castclass
                | IlOp::Initobj
                | IlOp::Isinst
                | IlOp::Ldelem
                | IlOp::Ldelema
                | IlOp::Ldobj
                | IlOp::Newarr
                | IlOp::Stelem
                | IlOp::Stobj
                | IlOp::Unbox => self.type_operand(&instr.arg)?,
                IlOp::Ldfld | IlOp::Ldflda | IlOp::Stfld => {
                    self.field_operand(&instr.arg, MemberHint::Instance)?
                }
                IlOp::Ldsfld | IlOp::Ldsflda | IlOp::Stsfld => {
                    self.field_operand(&instr.arg, MemberHint::Static)?
                }
                IlOp::Ldstr => {
                    // strip the surrounding quotes and the explicit
                    // trailing `\0` the generator appends
                    let inner = instr
                        .arg
                        .strip_prefix('"')
                        .and_then(|s| s.strip_suffix('"'))
                        .unwrap_or(&instr.arg);
                    let inner = inner.strip_suffix("\\0").unwrap_or(inner);
                    PeOperand::Str(inner.to_string())
                }
                IlOp::LdcR4 | IlOp::LdcR8 => {
                    let v = instr.arg.parse::<f64>().map_err(|_| {
                        BackendError::new(format!("bad real operand `{}`", instr.arg))
                    })?;
                    PeOperand::F64(v)
                }
                IlOp::LdcI8 => {
                    let v = instr.arg.parse::<i64>().map_err(|_| {
                        BackendError::new(format!("bad int64 operand `{}`", instr.arg))
                    })?;
                    PeOperand::I64(v)
                }
                IlOp::LdcI4 | IlOp::LdcI4S => {
                    let v = instr.arg.parse::<i32>().map_err(|_| {
                        BackendError::new(format!("bad int32 operand `{}`", instr.arg))
                    })?;
                    PeOperand::I32(v)
                }
                IlOp::Stloc | IlOp::StlocS | IlOp::Ldloc | IlOp::LdlocS | IlOp::Ldloca
                | IlOp::LdlocaS => {
                    let v = instr.arg.parse::<u16>().map_err(|_| {
                        BackendError::new(format!("bad local operand `{}`", instr.arg))
                    })?;
                    PeOperand::Local(v)
                }
                IlOp::Starg | IlOp::StargS | IlOp::Ldarg | IlOp::LdargS | IlOp::Ldarga
                | IlOp::LdargaS => {
                    let v = instr.arg.parse::<u16>().map_err(|_| {
                        BackendError::new(format!("bad argument operand `{}`", instr.arg))
                    })?;
                    PeOperand::Arg(v)
                }
                _ => PeOperand::None,
            };
            body.push(PeInstr {
                op: instr.op,
                operand,
            });
        }
        optimize(&mut body);

        let md = &mut self.model.methods[idx];
        md.kind = method.kind;
        md.is_runtime = method.is_runtime;
        md.entry_point = method.kind == MethodKind::Primary;
        md.max_stack = method.max_stack;
        md.locals = locals;
        md.body = body;
        if method.kind == MethodKind::Primary {
            self.entry_point = Some(idx);
        }
        Ok(())
    }
}

/// Trivial per-method peephole: select short instruction forms where the
/// operand fits.
pub fn optimize(body: &mut [PeInstr]) {
    for instr in body.iter_mut() {
        let (op, operand) = (instr.op, instr.operand.clone());
        match (op, operand) {
            (IlOp::Ldarg, PeOperand::Arg(n)) => match n {
                0 => *instr = PeInstr { op: IlOp::Ldarg0, operand: PeOperand::None },
                1 => *instr = PeInstr { op: IlOp::Ldarg1, operand: PeOperand::None },
                2 => *instr = PeInstr { op: IlOp::Ldarg2, operand: PeOperand::None },
                3 => *instr = PeInstr { op: IlOp::Ldarg3, operand: PeOperand::None },
                n if n < 256 => instr.op = IlOp::LdargS,
                _ => {}
            },
            (IlOp::Ldloc, PeOperand::Local(n)) => match n {
                0 => *instr = PeInstr { op: IlOp::Ldloc0, operand: PeOperand::None },
                1 => *instr = PeInstr { op: IlOp::Ldloc1, operand: PeOperand::None },
                2 => *instr = PeInstr { op: IlOp::Ldloc2, operand: PeOperand::None },
                3 => *instr = PeInstr { op: IlOp::Ldloc3, operand: PeOperand::None },
                n if n < 256 => instr.op = IlOp::LdlocS,
                _ => {}
            },
            (IlOp::Stloc, PeOperand::Local(n)) => match n {
                0 => *instr = PeInstr { op: IlOp::Stloc0, operand: PeOperand::None },
                1 => *instr = PeInstr { op: IlOp::Stloc1, operand: PeOperand::None },
                2 => *instr = PeInstr { op: IlOp::Stloc2, operand: PeOperand::None },
                3 => *instr = PeInstr { op: IlOp::Stloc3, operand: PeOperand::None },
                n if n < 256 => instr.op = IlOp::StlocS,
                _ => {}
            },
            (IlOp::Ldloca, PeOperand::Local(n)) if n < 256 => instr.op = IlOp::LdlocaS,
            (IlOp::Ldarga, PeOperand::Arg(n)) if n < 256 => instr.op = IlOp::LdargaS,
            (IlOp::Starg, PeOperand::Arg(n)) if n < 256 => instr.op = IlOp::StargS,
            (IlOp::LdcI4, PeOperand::I32(v)) => match v {
                -1 => *instr = PeInstr { op: IlOp::LdcI4M1, operand: PeOperand::None },
                0 => *instr = PeInstr { op: IlOp::LdcI40, operand: PeOperand::None },
                1 => *instr = PeInstr { op: IlOp::LdcI41, operand: PeOperand::None },
                2 => *instr = PeInstr { op: IlOp::LdcI42, operand: PeOperand::None },
                3 => *instr = PeInstr { op: IlOp::LdcI43, operand: PeOperand::None },
                4 => *instr = PeInstr { op: IlOp::LdcI44, operand: PeOperand::None },
                5 => *instr = PeInstr { op: IlOp::LdcI45, operand: PeOperand::None },
                6 => *instr = PeInstr { op: IlOp::LdcI46, operand: PeOperand::None },
                7 => *instr = PeInstr { op: IlOp::LdcI47, operand: PeOperand::None },
                8 => *instr = PeInstr { op: IlOp::LdcI48, operand: PeOperand::None },
                v if (-128..=127).contains(&v) => instr.op = IlOp::LdcI4S,
                _ => {}
            },
            _ => {}
        }
    }
}

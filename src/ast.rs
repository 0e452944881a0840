//! Validated module AST, the input side of the code generator.
//!
//! Every node is owned by its [`Module`]: types and declarations live in
//! flat arenas and cross-reference each other through [`TypeId`] /
//! [`DeclId`] indices, which keeps the cyclic shapes of the language
//! (record base/extension, method override chains, field ownership) out of
//! the ownership graph. Expressions and statements are plain trees since
//! they never form cycles.
//!
//! The generator assumes the tree has been validated: every expression
//! carries its resolved type, parameters and locals carry their final slot
//! numbers, and mixed-type operations carry the common base type the
//! operands convert to.

/// Source position carried on every node (1-based row and column).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RowCol {
    pub row: u32,
    pub col: u32,
}

impl RowCol {
    pub fn new(row: u32, col: u32) -> Self {
        RowCol { row, col }
    }
}

/// Index of a [`Type`] in its module's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

/// Index of a [`Decl`] in its module's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeclId(pub u32);

/// Primitive type tags. The numeric order matters: integer widths grow from
/// `Byte` to `LongInt`, so "fits in 32 bits" is `<= Integer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BaseKind {
    Bool,
    Char,
    WChar,
    Byte,
    ShortInt,
    Integer,
    LongInt,
    Real,
    LongReal,
    Set,
    Nil,
    Str,
    WStr,
    ByteArray,
    EnumInt,
    Any,
    None,
}

impl BaseKind {
    pub const ALL: &'static [BaseKind] = &[
        BaseKind::Bool,
        BaseKind::Char,
        BaseKind::WChar,
        BaseKind::Byte,
        BaseKind::ShortInt,
        BaseKind::Integer,
        BaseKind::LongInt,
        BaseKind::Real,
        BaseKind::LongReal,
        BaseKind::Set,
        BaseKind::Nil,
        BaseKind::Str,
        BaseKind::WStr,
        BaseKind::ByteArray,
        BaseKind::EnumInt,
        BaseKind::Any,
        BaseKind::None,
    ];

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            BaseKind::Byte | BaseKind::ShortInt | BaseKind::Integer | BaseKind::LongInt
        )
    }

    pub fn is_real(self) -> bool {
        matches!(self, BaseKind::Real | BaseKind::LongReal)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_real()
    }
}

/// Export status of a declaration (`*` exports read-write, `-` read-only).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Private,
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumItem {
    pub name: String,
    pub value: i64,
}

/// A record body. `decl` points at the named-type declaration introducing
/// the record, if any; anonymous records get a numeric slot from the
/// generator instead. `by_value` is the value-record eligibility flag; the
/// validator currently always clears it.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordDesc {
    pub base: Option<TypeId>,
    pub fields: Vec<DeclId>,
    pub methods: Vec<DeclId>,
    pub by_value: bool,
    pub decl: Option<DeclId>,
}

/// A procedure signature. Formals are `Param` declarations so the `VAR` /
/// `IN` flags and slot numbers live with the declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcSig {
    pub formals: Vec<DeclId>,
    pub ret: Option<TypeId>,
    pub type_bound: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeDesc {
    Base(BaseKind),
    Enumeration { items: Vec<EnumItem> },
    /// `len` is the static length; `None` marks an open array.
    Array { elem: TypeId, len: Option<u32> },
    Record(RecordDesc),
    Pointer { to: TypeId },
    Proc(ProcSig),
    /// Cross-module (or forward) reference, already resolved by validation.
    Quali { resolved: TypeId, self_ref: bool },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Type {
    pub desc: TypeDesc,
    /// Home module of the declaration, `None` for the module being
    /// generated. Drives assembly-qualified references.
    pub declared_in: Option<String>,
}

impl Type {
    pub fn new(desc: TypeDesc) -> Self {
        Type {
            desc,
            declared_in: None,
        }
    }
}

/// A literal or folded constant value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    Bytes(Vec<u8>),
    Char(u32),
    Set(u32),
    Enum(i64),
    Nil,
}

/// Built-in procedures with bespoke lowerings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    New,
    Len,
    Inc,
    Dec,
    Incl,
    Excl,
    Ord,
    Chr,
    Flt,
    Floor,
    Abs,
    Odd,
    Min,
    Max,
    Short,
    Long,
    Lsl,
    Asr,
    Ror,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Pack,
    Unpk,
    Assert,
    Trap,
    TrapIf,
    ByteSize,
    Default,
    Val,
    Adr,
    Println,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcDecl {
    pub receiver: Option<DeclId>,
    pub receiver_rec: Option<TypeId>,
    /// The overridden super procedure, for super-calls.
    pub super_proc: Option<DeclId>,
    /// Parameters, locals and nested declarations in source order.
    pub order: Vec<DeclId>,
    pub body: Vec<Stmt>,
    pub end_loc: RowCol,
    /// Number of declared locals; temp slots are allocated above this.
    pub var_count: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeclKind {
    Variable,
    LocalVar { slot: u16 },
    Param { slot: u16, var: bool, is_const: bool },
    Field { owner: TypeId },
    Proc(Box<ProcDecl>),
    NamedType,
    Const { value: Value },
    Import,
    Builtin(Builtin),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decl {
    pub name: String,
    pub kind: DeclKind,
    pub ty: TypeId,
    pub visibility: Visibility,
    pub loc: RowCol,
    /// Home module name, `None` for the module being generated.
    pub module: Option<String>,
    /// Enclosing procedure for nested declarations, `None` at module level.
    pub scope: Option<DeclId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UnOp {
    Neg,
    Not,
    Deref,
    AddrOf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    FDiv,
    Div,
    Mod,
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    In,
    Is,
    Range,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SetPart {
    Elem(Expr),
    Range(Expr, Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Literal(Value),
    /// Leaf designator: variable, local, parameter, constant, procedure,
    /// import or built-in.
    Ident(DeclId),
    /// Dotted selection; `decl` is the selected member.
    Select { sub: Box<Expr>, decl: DeclId },
    Unary { op: UnOp, sub: Box<Expr> },
    /// `base` is the common numeric base type both operands convert to for
    /// arithmetic and relations; `BaseKind::None` where irrelevant.
    Binary {
        op: BinOp,
        base: BaseKind,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Set { parts: Vec<SetPart> },
    Index { sub: Box<Expr>, index: Box<Expr> },
    Call { sub: Box<Expr>, args: Vec<Expr> },
    /// Type guard `v(T)`; a value-preserving view, no code of its own.
    Cast { sub: Box<Expr> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TypeId,
    pub loc: RowCol,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: TypeId, loc: RowCol) -> Self {
        Expr { kind, ty, loc }
    }

    /// The declaration a designator ultimately names, if any.
    pub fn ident(&self) -> Option<DeclId> {
        match &self.kind {
            ExprKind::Ident(d) => Some(*d),
            ExprKind::Select { decl, .. } => Some(*decl),
            ExprKind::Unary {
                op: UnOp::Deref, sub, ..
            } => sub.ident(),
            ExprKind::Cast { sub } => sub.ident(),
            _ => None,
        }
    }
}

/// The structured-statement family sharing the condition/block layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IfKind {
    If,
    While,
    Repeat,
    Loop,
    With,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStmt {
    pub kind: IfKind,
    /// IF/ELSIF (or WITH guard, or the single REPEAT/WHILE) conditions.
    pub conds: Vec<Expr>,
    /// One block per condition; LOOP uses a single unconditioned block.
    pub blocks: Vec<Vec<Stmt>>,
    pub else_block: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaseArm {
    /// Single values, `Range` expressions, or type labels for type CASE.
    pub labels: Vec<Expr>,
    pub block: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Assign { lhs: Expr, rhs: Expr },
    Call(Expr),
    If(IfStmt),
    For {
        var: Expr,
        from: Expr,
        to: Expr,
        by: Expr,
        by_value: i64,
        body: Vec<Stmt>,
    },
    Case {
        expr: Expr,
        type_case: bool,
        arms: Vec<CaseArm>,
        else_block: Vec<Stmt>,
    },
    Exit,
    Return(Option<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: RowCol,
}

impl Stmt {
    pub fn new(kind: StmtKind, loc: RowCol) -> Self {
        Stmt { kind, loc }
    }
}

/// A validated module: the arena plus ordered declaration and body lists.
#[derive(Clone, Debug)]
pub struct Module {
    pub name: String,
    pub file: String,
    pub types: Vec<Type>,
    pub decls: Vec<Decl>,
    /// Module-level declarations in source order.
    pub order: Vec<DeclId>,
    /// Import declarations (subset of `order`).
    pub imports: Vec<DeclId>,
    pub body: Vec<Stmt>,
    pub begin_loc: RowCol,
    pub end_loc: RowCol,
    pub meta_params: Vec<String>,
    pub meta_actuals: Vec<TypeId>,
    pub synthetic: bool,
    pub definition_only: bool,
    pub validated: bool,
    pub had_errors: bool,
}

impl Module {
    /// Creates an empty module with the base types pre-seeded at fixed
    /// arena slots, so `base()` is index arithmetic and generator rewrites
    /// can reference BOOLEAN/INTEGER without touching the arena.
    pub fn new(name: &str, file: &str) -> Self {
        let types = BaseKind::ALL
            .iter()
            .map(|k| Type::new(TypeDesc::Base(*k)))
            .collect();
        Module {
            name: name.to_string(),
            file: file.to_string(),
            types,
            decls: Vec::new(),
            order: Vec::new(),
            imports: Vec::new(),
            body: Vec::new(),
            begin_loc: RowCol::new(1, 1),
            end_loc: RowCol::new(1, 1),
            meta_params: Vec::new(),
            meta_actuals: Vec::new(),
            synthetic: false,
            definition_only: false,
            validated: true,
            had_errors: false,
        }
    }

    /// The pre-seeded arena slot of a base type.
    pub fn base(kind: BaseKind) -> TypeId {
        let idx = BaseKind::ALL.iter().position(|k| *k == kind);
        TypeId(idx.unwrap_or(0) as u32)
    }

    pub fn add_type(&mut self, t: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(t);
        id
    }

    pub fn add_decl(&mut self, d: Decl) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(d);
        id
    }

    pub fn ty(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.0 as usize]
    }

    /// Follows qualified references to the underlying type.
    pub fn derefed(&self, id: TypeId) -> TypeId {
        let mut cur = id;
        loop {
            match &self.ty(cur).desc {
                TypeDesc::Quali { resolved, .. } => cur = *resolved,
                _ => return cur,
            }
        }
    }

    /// Base-type tag after dereferencing; enumerations read as `EnumInt`.
    pub fn base_kind(&self, id: TypeId) -> Option<BaseKind> {
        match &self.ty(self.derefed(id)).desc {
            TypeDesc::Base(k) => Some(*k),
            TypeDesc::Enumeration { .. } => Some(BaseKind::EnumInt),
            _ => None,
        }
    }

    pub fn is_record(&self, id: TypeId) -> bool {
        matches!(self.ty(self.derefed(id)).desc, TypeDesc::Record(_))
    }

    pub fn is_array(&self, id: TypeId) -> bool {
        matches!(self.ty(self.derefed(id)).desc, TypeDesc::Array { .. })
    }

    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.ty(self.derefed(id)).desc, TypeDesc::Pointer { .. })
    }

    pub fn is_proc_type(&self, id: TypeId) -> bool {
        matches!(self.ty(self.derefed(id)).desc, TypeDesc::Proc(_))
    }

    /// Records and arrays: heap objects with copy assignment semantics.
    pub fn is_structured(&self, id: TypeId) -> bool {
        self.is_record(id) || self.is_array(id)
    }

    pub fn is_integer(&self, id: TypeId) -> bool {
        self.base_kind(id).is_some_and(BaseKind::is_integer)
    }

    pub fn is_real(&self, id: TypeId) -> bool {
        self.base_kind(id).is_some_and(BaseKind::is_real)
    }

    pub fn is_numeric(&self, id: TypeId) -> bool {
        self.base_kind(id).is_some_and(BaseKind::is_numeric)
    }

    pub fn is_set(&self, id: TypeId) -> bool {
        self.base_kind(id) == Some(BaseKind::Set)
    }

    pub fn is_char(&self, id: TypeId) -> bool {
        matches!(self.base_kind(id), Some(BaseKind::Char | BaseKind::WChar))
    }

    /// Literal string types (not yet materialized as char arrays).
    pub fn is_string(&self, id: TypeId) -> bool {
        matches!(self.base_kind(id), Some(BaseKind::Str | BaseKind::WStr))
    }

    /// Anything the relational string machinery accepts: chars, string
    /// literals and character arrays.
    pub fn is_text(&self, id: TypeId) -> bool {
        if self.is_char(id) || self.is_string(id) {
            return true;
        }
        match &self.ty(self.derefed(id)).desc {
            TypeDesc::Array { elem, .. } => self.is_char(*elem),
            _ => false,
        }
    }

    /// Resolves pointers and qualified references down to a record type.
    pub fn to_record(&self, id: TypeId) -> Option<TypeId> {
        let d = self.derefed(id);
        match &self.ty(d).desc {
            TypeDesc::Record(_) => Some(d),
            TypeDesc::Pointer { to } => {
                let t = self.derefed(*to);
                match &self.ty(t).desc {
                    TypeDesc::Record(_) => Some(t),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Panics when `id` is not a record; generation-phase callers hold
    /// validated trees where the tag is known.
    pub fn record(&self, id: TypeId) -> &RecordDesc {
        match &self.ty(self.derefed(id)).desc {
            TypeDesc::Record(r) => r,
            other => panic!("expected record type, found {:?}", other),
        }
    }

    pub fn proc_sig(&self, id: TypeId) -> &ProcSig {
        match &self.ty(self.derefed(id)).desc {
            TypeDesc::Proc(sig) => sig,
            other => panic!("expected procedure type, found {:?}", other),
        }
    }

    /// True for generic templates, which the driver skips: instantiation
    /// happens upstream and arrives as ordinary modules.
    pub fn is_generic_template(&self) -> bool {
        !self.meta_params.is_empty() && self.meta_actuals.is_empty()
    }
}

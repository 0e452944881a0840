//! Signature resolver: the textual reference language shared by the
//! emitter and the binary builder.
//!
//! Grammar:
//!
//! ```text
//! ref      ::= typeRef | membRef
//! typeRef  ::= [ 'class' | 'valuetype' ] [ assembly ] path { '[]' } | primType { '[]' }
//! primType ::= [ 'native' ] [ 'unsigned' ] ID
//! membRef  ::= typeRef [ 'class' | 'valuetype' ] [ assembly ] path '::' dottedNm [ params ]
//! assembly ::= '[' dottedNm ']'
//! path     ::= dottedNm { '/' dottedNm }
//! params   ::= '(' [ param { ',' param } ] ')'
//! param    ::= ref [ '&' ] [ name ]
//! dottedNm ::= name { '.' name }
//! name     ::= ID | QSTRING
//! ```
//!
//! Resolution is lookup-or-create against the symbol tree of the
//! [`ObjectModel`]: a reference may name a class before it is declared and
//! the node is materialized on first sight. Primitives dedup under a
//! sentinel node, `[]`/`&` suffixes are idempotent child nodes, methods
//! are keyed by name plus whitespace-normalized parameter-type list.

use crate::pe::{simplify_ws, MemberHint, NodeId, ObjectModel, ParamDef, ROOT};

/// A reference string the resolver could not parse or that names the wrong
/// kind of member. Always indicates a generator bug.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigError {
    pub message: String,
    pub reference: String,
}

impl SigError {
    pub fn new(message: impl Into<String>, reference: impl Into<String>) -> Self {
        SigError {
            message: message.into(),
            reference: reference.into(),
        }
    }
}

impl std::fmt::Display for SigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid signature: {} in `{}`", self.message, self.reference)
    }
}

impl std::error::Error for SigError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tok {
    Invalid,
    Done,
    Id,
    QString,
    Class,
    Valuetype,
    LBrack,
    RBrack,
    /// The two-character `[]` suffix.
    Arr,
    DblColon,
    Slash,
    LPar,
    RPar,
    Ampers,
    Comma,
    Dot,
}

#[derive(Clone, Debug)]
struct Token {
    tt: Tok,
    pos: usize,
    val: String,
}

impl Token {
    fn is_name(&self) -> bool {
        self.tt == Tok::Id || self.tt == Tok::QString
    }
}

struct Lexer<'s> {
    input: &'s [u8],
    off: usize,
    ahead: Option<Token>,
}

impl<'s> Lexer<'s> {
    fn new(input: &'s str) -> Self {
        Lexer {
            input: input.as_bytes(),
            off: 0,
            ahead: None,
        }
    }

    fn text(&self) -> &'s str {
        std::str::from_utf8(self.input).unwrap_or("")
    }

    fn peek(&mut self) -> Token {
        if self.ahead.is_none() {
            self.ahead = Some(self.next_imp());
        }
        self.ahead.clone().unwrap()
    }

    fn next(&mut self) -> Token {
        match self.ahead.take() {
            Some(t) => t,
            None => self.next_imp(),
        }
    }

    fn get(&mut self) -> Option<u8> {
        if self.off < self.input.len() {
            let ch = self.input[self.off];
            self.off += 1;
            Some(ch)
        } else {
            None
        }
    }

    fn peek_ch(&self) -> Option<u8> {
        self.input.get(self.off).copied()
    }

    fn next_imp(&mut self) -> Token {
        while let Some(ch) = self.get() {
            if ch.is_ascii_whitespace() {
                continue;
            }
            if ch.is_ascii_alphabetic() || ch == b'_' {
                return self.ident(ch);
            }
            let pos = self.off - 1;
            return match ch {
                b'\'' => self.qstring(pos),
                b'[' => {
                    if self.peek_ch() == Some(b']') {
                        self.get();
                        Token { tt: Tok::Arr, pos, val: String::new() }
                    } else {
                        Token { tt: Tok::LBrack, pos, val: String::new() }
                    }
                }
                b']' => Token { tt: Tok::RBrack, pos, val: String::new() },
                b':' => {
                    if self.get() == Some(b':') {
                        Token { tt: Tok::DblColon, pos, val: String::new() }
                    } else {
                        Token { tt: Tok::Invalid, pos, val: String::new() }
                    }
                }
                b'/' => Token { tt: Tok::Slash, pos, val: String::new() },
                b'(' => Token { tt: Tok::LPar, pos, val: String::new() },
                b')' => Token { tt: Tok::RPar, pos, val: String::new() },
                b'&' => Token { tt: Tok::Ampers, pos, val: String::new() },
                b',' => Token { tt: Tok::Comma, pos, val: String::new() },
                b'.' => {
                    // `.ctor` / `.cctor` read as a single name
                    if self.peek_ch() == Some(b'c') {
                        self.ident(ch)
                    } else {
                        Token { tt: Tok::Dot, pos, val: String::new() }
                    }
                }
                _ => Token { tt: Tok::Invalid, pos, val: String::new() },
            };
        }
        Token {
            tt: Tok::Done,
            pos: self.off,
            val: String::new(),
        }
    }

    fn qstring(&mut self, pos: usize) -> Token {
        let mut s = String::new();
        while let Some(ch) = self.get() {
            if ch == b'\'' {
                break;
            }
            s.push(ch as char);
        }
        Token {
            tt: Tok::QString,
            pos,
            val: s,
        }
    }

    fn ident(&mut self, first: u8) -> Token {
        let pos = self.off - 1;
        let mut s = String::new();
        s.push(first as char);
        while let Some(ch) = self.peek_ch() {
            if !ch.is_ascii_alphanumeric() && ch != b'_' {
                break;
            }
            self.get();
            s.push(ch as char);
        }
        match s.as_str() {
            "class" => Token { tt: Tok::Class, pos, val: String::new() },
            "valuetype" => Token { tt: Tok::Valuetype, pos, val: String::new() },
            _ => Token { tt: Tok::Id, pos, val: s },
        }
    }
}

const PRIMITIVES: &[&str] = &[
    "void",
    "bool",
    "char",
    "int8",
    "unsigned int8",
    "uint8",
    "int16",
    "unsigned int16",
    "uint16",
    "int32",
    "unsigned int32",
    "uint32",
    "int64",
    "unsigned int64",
    "uint64",
    "float32",
    "float64",
    "native int",
    "native unsigned int",
    "native uint",
    "int",
    "uint",
    "string",
    "object",
];

fn is_primitive(name: &str) -> bool {
    PRIMITIVES.contains(&name)
}

struct Parser<'m, 's> {
    model: &'m mut ObjectModel,
    lex: Lexer<'s>,
}

/// Resolves a type reference, creating tree nodes as needed.
pub fn parse_type_ref(model: &mut ObjectModel, reference: &str) -> Result<NodeId, SigError> {
    let mut p = Parser {
        model,
        lex: Lexer::new(reference),
    };
    p.type_ref().map_err(|e| e.into_error(reference))
}

/// Resolves a member reference (method or field) with the given hint.
pub fn parse_member_ref(
    model: &mut ObjectModel,
    reference: &str,
    hint: MemberHint,
) -> Result<NodeId, SigError> {
    let mut p = Parser {
        model,
        lex: Lexer::new(reference),
    };
    if hint == MemberHint::TypeRef {
        return p.type_ref().map_err(|e| e.into_error(reference));
    }
    p.member_ref(hint).map_err(|e| e.into_error(reference))
}

/// Internal error carrying only the message; the reference text is filled
/// in at the entry points.
struct ParseFail(&'static str);

impl ParseFail {
    fn into_error(self, reference: &str) -> SigError {
        SigError::new(self.0, reference)
    }
}

impl<'m, 's> Parser<'m, 's> {
    fn type_ref(&mut self) -> Result<NodeId, ParseFail> {
        let mut t = self.lex.peek();
        if t.tt == Tok::Class || t.tt == Tok::Valuetype {
            self.lex.next();
            t = self.lex.peek();
        }
        let node;
        if t.is_name() && (t.val == "native" || t.val == "unsigned") {
            node = self.primitive_type()?;
        } else if t.tt == Tok::LBrack {
            let ass = self.assembly()?;
            node = self.path(ass)?;
        } else {
            node = self.path(ROOT)?;
        }

        let mut level = 0u8;
        while self.lex.peek().tt == Tok::Arr {
            self.lex.next();
            level += 1;
        }
        self.model
            .suffix_type(node, level, false)
            .map_err(|_| ParseFail("cannot decorate reference"))
    }

    fn primitive_type(&mut self) -> Result<NodeId, ParseFail> {
        let mut words = vec![self.lex.next().val];
        let t = self.lex.peek();
        if t.is_name() && t.val == "unsigned" {
            words.push(self.lex.next().val);
        }
        let t = self.lex.next();
        if !t.is_name() {
            return Err(ParseFail("expecting ID in primitive type"));
        }
        words.push(t.val);
        let name = words.join(" ");
        if !is_primitive(&name) {
            return Err(ParseFail("expecting primitive type"));
        }
        self.model
            .fetch_primitive(&name)
            .map_err(|_| ParseFail("invalid primitive type"))
    }

    fn member_ref(&mut self, hint: MemberHint) -> Result<NodeId, ParseFail> {
        let ret = self.type_ref()?;
        let mut t = self.lex.peek();
        if t.tt == Tok::Class || t.tt == Tok::Valuetype {
            self.lex.next();
            t = self.lex.peek();
        }
        let scope = if t.tt == Tok::LBrack {
            self.assembly()?
        } else {
            ROOT
        };
        let node = self.path(scope)?;
        if self.lex.next().tt != Tok::DblColon {
            return Err(ParseFail("member ref without ::"));
        }
        self.model
            .create_class_for(node)
            .map_err(|_| ParseFail("member ref must point to a class"))?;

        let t = self.lex.next();
        if !t.is_name() {
            return Err(ParseFail("expecting name after '::'"));
        }
        let mut name = t.val;
        while self.lex.peek().tt == Tok::Dot {
            self.lex.next();
            let t = self.lex.next();
            if !t.is_name() {
                return Err(ParseFail("expecting a name after '.'"));
            }
            name.push('.');
            name.push_str(&t.val);
        }

        if self.lex.peek().tt == Tok::LPar {
            let ret_ty = self
                .model
                .type_of(ret)
                .map_err(|_| ParseFail("method ref without return type"))?;
            let pars = self.params()?;
            self.model
                .find_or_create_method(node, &name, pars, ret_ty, hint)
                .map_err(|_| ParseFail("field-ref shape used for a method name"))
        } else {
            let ty = self
                .model
                .type_of(ret)
                .map_err(|_| ParseFail("field ref without type"))?;
            self.model
                .find_or_create_field(node, &name, ty, hint == MemberHint::Static, true)
                .map_err(|_| ParseFail("method-ref shape used for a field name"))
        }
    }

    fn assembly(&mut self) -> Result<NodeId, ParseFail> {
        if self.lex.next().tt != Tok::LBrack {
            return Err(ParseFail("expecting '['"));
        }
        let t = self.lex.next();
        if !t.is_name() {
            return Err(ParseFail("expecting name"));
        }
        let mut name = t.val;
        while self.lex.peek().tt == Tok::Dot {
            self.lex.next();
            let t = self.lex.next();
            if !t.is_name() {
                return Err(ParseFail("expecting a name after '.'"));
            }
            name.push('.');
            name.push_str(&t.val);
        }
        if self.lex.next().tt != Tok::RBrack {
            return Err(ParseFail("expecting ']'"));
        }
        Ok(self.model.fetch_assembly(&name))
    }

    fn path(&mut self, scope: NodeId) -> Result<NodeId, ParseFail> {
        let t = self.lex.next();
        if !t.is_name() {
            return Err(ParseFail("expecting a path to start with a name"));
        }
        let mut segments = vec![t.val];
        while self.lex.peek().tt == Tok::Dot {
            self.lex.next();
            let t = self.lex.next();
            if !t.is_name() {
                return Err(ParseFail("expecting a name after '.'"));
            }
            segments.push(t.val);
        }

        if segments.len() == 1 && scope == ROOT && is_primitive(&segments[0]) {
            return self
                .model
                .fetch_primitive(&segments[0])
                .map_err(|_| ParseFail("invalid primitive type"));
        }

        // intermediate segments are namespaces, the last names the type
        let mut scope = scope;
        for seg in &segments[..segments.len() - 1] {
            scope = match self.model.sub(scope, seg) {
                Some(n) => n,
                None => self
                    .model
                    .add_node(scope, seg, crate::pe::Item::Namespace),
            };
        }
        let last = segments.last().expect("non-empty path");
        let mut node = match self.model.sub(scope, last) {
            Some(n) => n,
            None => self.model.add_node(scope, last, crate::pe::Item::None),
        };

        // nested classes after '/'
        while self.lex.peek().tt == Tok::Slash {
            self.lex.next();
            let t = self.lex.next();
            if !t.is_name() {
                return Err(ParseFail("expecting a name after '/'"));
            }
            let mut dotted = t.val;
            while self.lex.peek().tt == Tok::Dot {
                self.lex.next();
                let t = self.lex.next();
                if !t.is_name() {
                    return Err(ParseFail("invalid dotted name after '/'"));
                }
                dotted.push('.');
                dotted.push_str(&t.val);
            }
            self.model
                .create_class_for(node)
                .map_err(|_| ParseFail("cannot nest class in given scope"))?;
            node = match self.model.sub(node, &dotted) {
                Some(n) => n,
                None => {
                    let n = self.model.add_node(node, &dotted, crate::pe::Item::None);
                    self.model
                        .create_class_for(n)
                        .map_err(|_| ParseFail("cannot nest class in given scope"))?;
                    n
                }
            };
        }
        Ok(node)
    }

    fn param(&mut self) -> Result<ParamDef, ParseFail> {
        let start = self.lex.peek().pos;
        let mut ty_node = self.type_ref()?;
        if self.lex.peek().tt == Tok::Ampers {
            self.lex.next();
            // re-derive the decorated type from the undecorated node
            let (base, level) = self.undecorate(ty_node);
            ty_node = self
                .model
                .suffix_type(base, level, true)
                .map_err(|_| ParseFail("cannot take reference of type"))?;
        }
        let end = self.lex.peek().pos;
        let type_str = simplify_ws(self.lex.text()[start..end].trim());
        let name = if self.lex.peek().is_name() {
            self.lex.next().val
        } else {
            String::new()
        };
        let ty = self
            .model
            .type_of(ty_node)
            .map_err(|_| ParseFail("parameter is not a type"))?;
        Ok(ParamDef { name, ty, type_str })
    }

    /// Splits a resolved type node back into its base node and array
    /// level, so `&` can be folded into one decorated instance.
    fn undecorate(&self, node: NodeId) -> (NodeId, u8) {
        let n = self.model.node(node);
        if n.name.is_empty() || n.name.starts_with("[]") {
            let level = (n.name.len() / 2) as u8;
            (n.parent.unwrap_or(ROOT), level)
        } else {
            (node, 0)
        }
    }

    fn params(&mut self) -> Result<Vec<ParamDef>, ParseFail> {
        if self.lex.peek().tt == Tok::LPar {
            self.lex.next();
        } else {
            return Err(ParseFail("invalid params, expecting '('"));
        }
        let mut res = Vec::new();
        if self.lex.peek().tt != Tok::RPar {
            res.push(self.param()?);
            while self.lex.peek().tt == Tok::Comma {
                self.lex.next();
                res.push(self.param()?);
            }
        }
        if self.lex.next().tt != Tok::RPar {
            return Err(ParseFail("unbalanced parameter list"));
        }
        Ok(res)
    }
}

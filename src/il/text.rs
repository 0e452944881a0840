//! ILASM text renderer.
//!
//! Stateless beyond the output sink and the current indentation: classes
//! open and close braces, methods print their header, locals and body one
//! instruction per line, labels as bare quoted identifiers. User-level
//! names arrive pre-quoted from the generator and pass through verbatim.

use std::io::Write;

use super::{BackendError, IlBackend, IlMethod, IlOp, MethodKind, ModuleKind};

pub struct IlAsmRenderer<W: Write> {
    out: W,
    level: usize,
}

impl<W: Write> IlAsmRenderer<W> {
    pub fn new(out: W) -> Self {
        IlAsmRenderer { out, level: 0 }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn ws(&self) -> String {
        "    ".repeat(self.level)
    }
}

fn method_attrs(m: &IlMethod) -> String {
    let mut s = String::new();
    s.push_str(if m.is_public { "public" } else { "assembly" });
    if m.name == ".ctor" || m.name == ".cctor" {
        s.push_str(" specialname rtspecialname");
    }
    match m.kind {
        MethodKind::Static | MethodKind::Primary => s.push_str(" static"),
        MethodKind::Virtual => s.push_str(" virtual instance"),
        MethodKind::Instance => s.push_str(" instance"),
    }
    s
}

impl<W: Write> IlBackend for IlAsmRenderer<W> {
    fn begin_module(
        &mut self,
        name: &str,
        imports: &[String],
        source_file: &str,
        kind: ModuleKind,
    ) -> Result<(), BackendError> {
        if !source_file.is_empty() {
            writeln!(self.out, "// generated from {}", source_file)?;
        }
        for imp in imports {
            writeln!(self.out, ".assembly extern {} {{}}", imp)?;
        }
        writeln!(self.out, ".assembly {} {{}}", name)?;
        let ext = match kind {
            ModuleKind::Library => "dll",
            ModuleKind::ConsoleApp | ModuleKind::GuiApp => "exe",
        };
        let bare = name.trim_matches('\'');
        writeln!(self.out, ".module '{}.{}'", bare, ext)?;
        writeln!(self.out)?;
        writeln!(
            self.out,
            ".class public sealed {} extends [mscorlib]System.Object {{",
            name
        )?;
        self.level = 1;
        Ok(())
    }

    fn end_module(&mut self) -> Result<(), BackendError> {
        self.level = 0;
        writeln!(self.out, "}}")?;
        self.out.flush()?;
        Ok(())
    }

    fn begin_class(
        &mut self,
        name: &str,
        is_public: bool,
        super_ref: Option<&str>,
    ) -> Result<(), BackendError> {
        let vis = if is_public { "public" } else { "assembly" };
        let sup = super_ref.unwrap_or("[mscorlib]System.Object");
        writeln!(
            self.out,
            "{}.class nested {} {} extends {} {{",
            self.ws(),
            vis,
            name,
            sup
        )?;
        self.level += 1;
        Ok(())
    }

    fn end_class(&mut self) -> Result<(), BackendError> {
        self.level -= 1;
        writeln!(self.out, "{}}}", self.ws())?;
        Ok(())
    }

    fn add_field(
        &mut self,
        name: &str,
        type_ref: &str,
        is_public: bool,
        is_static: bool,
    ) -> Result<(), BackendError> {
        let vis = if is_public { "public" } else { "assembly" };
        let stat = if is_static { "static " } else { "" };
        writeln!(
            self.out,
            "{}.field {} {}{} {}",
            self.ws(),
            vis,
            stat,
            type_ref,
            name
        )?;
        Ok(())
    }

    fn add_method(&mut self, m: &IlMethod) -> Result<(), BackendError> {
        let ret = m.ret_type.as_deref().unwrap_or("void");
        let args = m
            .args
            .iter()
            .map(|(t, n)| {
                if n.is_empty() {
                    t.clone()
                } else {
                    format!("{} {}", t, n)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        let body_kind = if m.is_runtime { "runtime" } else { "cil" };
        writeln!(
            self.out,
            "{}.method {} {} {}({}) {} managed {{",
            self.ws(),
            method_attrs(m),
            ret,
            m.name,
            args,
            body_kind
        )?;
        self.level += 1;
        if m.kind == MethodKind::Primary {
            writeln!(self.out, "{}.entrypoint", self.ws())?;
        }
        if !m.is_runtime {
            writeln!(self.out, "{}.maxstack {}", self.ws(), m.max_stack)?;
        }
        if !m.locals.is_empty() {
            let locals = m
                .locals
                .iter()
                .map(|(t, n)| format!("{} {}", t, n))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(self.out, "{}.locals init ({})", self.ws(), locals)?;
        }
        for instr in &m.body {
            match instr.op {
                IlOp::Label => {
                    writeln!(self.out, "{}'#{}':", self.ws(), instr.arg)?;
                }
                IlOp::Line => {
                    writeln!(self.out, "{}.line {}", self.ws(), instr.arg)?;
                }
                IlOp::Br
                | IlOp::Brtrue
                | IlOp::Brfalse
                | IlOp::Beq
                | IlOp::Bge
                | IlOp::Bgt
                | IlOp::Ble
                | IlOp::Blt
                | IlOp::BneUn => {
                    writeln!(
                        self.out,
                        "{}{} '#{}'",
                        self.ws(),
                        instr.op.mnemonic(),
                        instr.arg
                    )?;
                }
                _ if instr.arg.is_empty() => {
                    writeln!(self.out, "{}{}", self.ws(), instr.op.mnemonic())?;
                }
                _ => {
                    writeln!(
                        self.out,
                        "{}{} {}",
                        self.ws(),
                        instr.op.mnemonic(),
                        instr.arg
                    )?;
                }
            }
        }
        self.level -= 1;
        writeln!(self.out, "{}}}", self.ws())?;
        Ok(())
    }
}

//! Deterministic binary serialization of the managed-module object model.
//!
//! Layout goals: portable little-endian fixed-width encoding, no
//! format-library dependence, canonical output so encoding the same model
//! twice is byte-identical. The container mirrors the object model:
//! header, assembly references, type pool, class tree, fields, methods
//! with resolved branch targets and a source-line table.

use crate::il::{BackendError, IlOp, MethodKind};

use super::{ObjectModel, PeInstr, PeOperand, Prim, TypeKind};

pub const MAGIC: &[u8; 8] = b"OBXPE\0\0\0";
pub const VERSION: u16 = 1;

/// Header flag: the module is an executable (entry point present).
pub const FLAG_EXE: u8 = 0x01;
/// Header flag: GUI subsystem requested.
pub const FLAG_GUI: u8 = 0x02;

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Encoder { buf: Vec::new() }
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }

    fn opt(&mut self, v: Option<usize>) {
        self.u32(v.map(|i| i as u32).unwrap_or(u32::MAX));
    }
}

/// Encodes the model as a managed-module container.
pub fn encode(
    model: &ObjectModel,
    module_name: &str,
    exe: bool,
    gui: bool,
    entry_point: Option<usize>,
) -> Result<Vec<u8>, BackendError> {
    let mut e = Encoder::new();
    e.bytes(MAGIC);
    e.u16(VERSION);
    let mut flags = 0u8;
    if exe {
        flags |= FLAG_EXE;
    }
    if gui {
        flags |= FLAG_GUI;
    }
    e.u8(flags);
    e.str(module_name);

    e.u32(model.assemblies.len() as u32);
    for a in &model.assemblies {
        e.str(&a.name);
        e.u8(a.external as u8);
    }

    e.u32(model.types.len() as u32);
    for t in &model.types {
        match t.kind {
            TypeKind::Prim(p) => {
                e.u8(0);
                e.u8(prim_code(p));
            }
            TypeKind::Class(c) => {
                e.u8(1);
                e.u32(c as u32);
            }
        }
        e.u8(t.array_level);
        e.u8(t.by_ref as u8);
    }

    e.u32(model.classes.len() as u32);
    for c in &model.classes {
        e.str(&c.name);
        e.u8(c.is_public as u8);
        e.opt(c.extends);
        e.u32(c.fields.len() as u32);
        for f in &c.fields {
            e.u32(*f as u32);
        }
        e.u32(c.methods.len() as u32);
        for m in &c.methods {
            e.u32(*m as u32);
        }
        e.u32(c.nested.len() as u32);
        for n in &c.nested {
            e.u32(*n as u32);
        }
    }
    e.u32(model.top_classes.len() as u32);
    for c in &model.top_classes {
        e.u32(*c as u32);
    }

    e.u32(model.fields.len() as u32);
    for f in &model.fields {
        e.str(&f.name);
        e.u32(f.ty as u32);
        e.u8(f.is_static as u8);
        e.u8(f.is_public as u8);
        e.opt(f.owner);
    }

    e.u32(model.methods.len() as u32);
    for m in &model.methods {
        e.str(&m.name);
        e.u8(match m.kind {
            MethodKind::Static => 0,
            MethodKind::Instance => 1,
            MethodKind::Virtual => 2,
            MethodKind::Primary => 3,
        });
        e.u8(m.is_runtime as u8);
        e.u16(m.max_stack);
        e.u32(m.ret as u32);
        e.u32(m.params.len() as u32);
        for p in &m.params {
            e.str(&p.name);
            e.u32(p.ty as u32);
        }
        e.u32(m.locals.len() as u32);
        for (name, ty) in &m.locals {
            e.str(name);
            e.u32(*ty as u32);
        }
        encode_body(&mut e, &m.body)?;
    }

    e.opt(entry_point);
    Ok(e.buf)
}

fn prim_code(p: Prim) -> u8 {
    p as u8
}

/// Lowers the instruction list: labels become program counters, line
/// pseudo-ops move to a side table, every real instruction encodes as
/// opcode byte plus a fixed-width operand.
fn encode_body(e: &mut Encoder, body: &[PeInstr]) -> Result<(), BackendError> {
    use std::collections::BTreeMap;

    let mut label_pc: BTreeMap<&str, u32> = BTreeMap::new();
    let mut pc = 0u32;
    for instr in body {
        match instr.op {
            IlOp::Label => {
                if let PeOperand::Label(l) = &instr.operand {
                    label_pc.insert(l, pc);
                }
            }
            IlOp::Line => {}
            _ => pc += 1,
        }
    }

    let mut lines: Vec<(u32, u32, u32)> = Vec::new();
    let count = pc;
    e.u32(count);
    pc = 0;
    for instr in body {
        match (&instr.op, &instr.operand) {
            (IlOp::Label, _) => {}
            (IlOp::Line, PeOperand::LineMark(r, c)) => lines.push((pc, *r, *c)),
            (op, operand) => {
                e.u8(*op as u8);
                match operand {
                    PeOperand::None => {}
                    PeOperand::Label(l) => {
                        let target = label_pc.get(l.as_str()).copied().ok_or_else(|| {
                            BackendError::new(format!("branch to undefined label '#{}'", l))
                        })?;
                        e.u32(target);
                    }
                    PeOperand::I32(v) => e.i32(*v),
                    PeOperand::I64(v) => e.i64(*v),
                    PeOperand::F64(v) => e.f64(*v),
                    PeOperand::Str(s) => e.str(s),
                    PeOperand::Type(t) => e.u32(*t as u32),
                    PeOperand::Field(f) => e.u32(*f as u32),
                    PeOperand::Method(m) => e.u32(*m as u32),
                    PeOperand::Local(n) => e.u16(*n),
                    PeOperand::Arg(n) => e.u16(*n),
                    PeOperand::LineMark(..) => {}
                }
                pc += 1;
            }
        }
    }

    e.u32(lines.len() as u32);
    for (pc, row, col) in lines {
        e.u32(pc);
        e.u32(row);
        e.u32(col);
    }
    Ok(())
}

//! The stateful IL emitter.
//!
//! Accumulates the opcode stream of the current method, issues fresh
//! labels, threads a running stack-effect counter so `max_stack` is exact,
//! and forwards finished methods, fields and classes to the back end.
//!
//! Bracketing is strict: `begin_method`/`end_method` must nest inside
//! `begin_class`/`end_class` which nest inside `begin_module`/`end_module`,
//! and method bodies never interleave. Violations are generator bugs and
//! abort via assertions rather than flowing into diagnostics.

use crate::ast::RowCol;

use super::{
    BackendError, ConvKind, IlBackend, IlInstr, IlMethod, IlOp, IndKind, MethodKind, ModuleKind,
};

pub struct IlEmitter<'a> {
    backend: &'a mut dyn IlBackend,
    method: Option<IlMethod>,
    next_label: u32,
    stack: i32,
    max_stack: i32,
    in_module: bool,
    class_depth: u32,
}

impl<'a> IlEmitter<'a> {
    pub fn new(backend: &'a mut dyn IlBackend) -> Self {
        IlEmitter {
            backend,
            method: None,
            next_label: 0,
            stack: 0,
            max_stack: 0,
            in_module: false,
            class_depth: 0,
        }
    }

    // module / class / field

    pub fn begin_module(
        &mut self,
        name: &str,
        imports: &[String],
        source_file: &str,
        kind: ModuleKind,
    ) -> Result<(), BackendError> {
        assert!(!self.in_module, "begin_module inside an open module");
        self.in_module = true;
        self.backend.begin_module(name, imports, source_file, kind)
    }

    pub fn end_module(&mut self) -> Result<(), BackendError> {
        assert!(self.in_module, "end_module without begin_module");
        assert!(self.method.is_none(), "end_module inside an open method");
        assert_eq!(self.class_depth, 0, "end_module inside an open class");
        self.in_module = false;
        self.backend.end_module()
    }

    pub fn begin_class(
        &mut self,
        name: &str,
        is_public: bool,
        super_ref: Option<&str>,
    ) -> Result<(), BackendError> {
        assert!(self.in_module, "begin_class outside a module");
        assert!(self.method.is_none(), "begin_class inside an open method");
        self.class_depth += 1;
        self.backend.begin_class(name, is_public, super_ref)
    }

    pub fn end_class(&mut self) -> Result<(), BackendError> {
        assert!(self.class_depth > 0, "end_class without begin_class");
        assert!(self.method.is_none(), "end_class inside an open method");
        self.class_depth -= 1;
        self.backend.end_class()
    }

    pub fn add_field(
        &mut self,
        name: &str,
        type_ref: &str,
        is_public: bool,
        is_static: bool,
    ) -> Result<(), BackendError> {
        assert!(self.in_module, "add_field outside a module");
        self.backend.add_field(name, type_ref, is_public, is_static)
    }

    // method bracket

    pub fn begin_method(&mut self, name: &str, is_public: bool, kind: MethodKind, runtime: bool) {
        assert!(self.in_module, "begin_method outside a module");
        assert!(self.method.is_none(), "method bodies must not interleave");
        self.method = Some(IlMethod {
            name: name.to_string(),
            kind,
            is_public,
            is_runtime: runtime,
            ret_type: None,
            args: Vec::new(),
            locals: Vec::new(),
            body: Vec::new(),
            max_stack: 0,
        });
        self.next_label = 0;
        self.stack = 0;
        self.max_stack = 0;
    }

    pub fn add_argument(&mut self, type_ref: &str, name: &str) {
        self.cur().args.push((type_ref.to_string(), name.to_string()));
    }

    pub fn set_return_type(&mut self, type_ref: &str) {
        self.cur().ret_type = Some(type_ref.to_string());
    }

    pub fn add_local(&mut self, type_ref: &str, name: &str) {
        self.cur()
            .locals
            .push((type_ref.to_string(), name.to_string()));
    }

    pub fn new_label(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label = l + 1;
        l
    }

    pub fn end_method(&mut self) -> Result<(), BackendError> {
        let mut m = self.method.take().expect("end_method without begin_method");
        m.max_stack = self.max_stack.max(0) as u16;
        self.backend.add_method(&m)
    }

    /// The exact maximum net stack depth observed so far in the current
    /// method.
    pub fn stack_depth(&self) -> i32 {
        self.max_stack
    }

    fn cur(&mut self) -> &mut IlMethod {
        self.method.as_mut().expect("no open method")
    }

    fn op(&mut self, op: IlOp, arg: impl Into<String>, delta: i32) {
        self.stack += delta;
        if self.stack > self.max_stack {
            self.max_stack = self.stack;
        }
        self.cur().body.push(IlInstr::new(op, arg));
    }

    // pseudo ops

    pub fn label(&mut self, label: u32) {
        self.op(IlOp::Label, label.to_string(), 0);
    }

    pub fn line(&mut self, loc: RowCol) {
        self.op(IlOp::Line, format!("{}:{}", loc.row, loc.col), 0);
    }

    // loads

    pub fn ldarg(&mut self, slot: u16) {
        self.op(IlOp::Ldarg, slot.to_string(), 1);
    }

    pub fn ldarga(&mut self, slot: u16) {
        self.op(IlOp::Ldarga, slot.to_string(), 1);
    }

    pub fn ldloc(&mut self, slot: u16) {
        self.op(IlOp::Ldloc, slot.to_string(), 1);
    }

    pub fn ldloca(&mut self, slot: u16) {
        self.op(IlOp::Ldloca, slot.to_string(), 1);
    }

    pub fn ldc_i4(&mut self, v: i32) {
        self.op(IlOp::LdcI4, v.to_string(), 1);
    }

    pub fn ldc_i8(&mut self, v: i64) {
        self.op(IlOp::LdcI8, v.to_string(), 1);
    }

    pub fn ldc_r4(&mut self, v: f64) {
        self.op(IlOp::LdcR4, format_real(v), 1);
    }

    pub fn ldc_r8(&mut self, v: f64) {
        self.op(IlOp::LdcR8, format_real(v), 1);
    }

    pub fn ldnull(&mut self) {
        self.op(IlOp::Ldnull, "", 1);
    }

    /// `literal` arrives fully quoted and escaped, trailing `\0` included.
    pub fn ldstr(&mut self, literal: &str) {
        self.op(IlOp::Ldstr, literal, 1);
    }

    pub fn ldlen(&mut self) {
        self.op(IlOp::Ldlen, "", 0);
    }

    pub fn ldelem(&mut self, type_ref: &str) {
        self.op(IlOp::Ldelem, type_ref, -1);
    }

    pub fn ldelema(&mut self, type_ref: &str) {
        self.op(IlOp::Ldelema, type_ref, -1);
    }

    pub fn ldfld(&mut self, field_ref: &str) {
        self.op(IlOp::Ldfld, field_ref, 0);
    }

    pub fn ldflda(&mut self, field_ref: &str) {
        self.op(IlOp::Ldflda, field_ref, 0);
    }

    pub fn ldsfld(&mut self, field_ref: &str) {
        self.op(IlOp::Ldsfld, field_ref, 1);
    }

    pub fn ldsflda(&mut self, field_ref: &str) {
        self.op(IlOp::Ldsflda, field_ref, 1);
    }

    pub fn ldftn(&mut self, method_ref: &str) {
        self.op(IlOp::Ldftn, method_ref, 1);
    }

    pub fn ldvirtftn(&mut self, method_ref: &str) {
        self.op(IlOp::Ldvirtftn, method_ref, 0);
    }

    pub fn ldind(&mut self, kind: IndKind) {
        let op = match kind {
            IndKind::I1 => IlOp::LdindI1,
            IndKind::I2 => IlOp::LdindI2,
            IndKind::I4 => IlOp::LdindI4,
            IndKind::I8 => IlOp::LdindI8,
            IndKind::R4 => IlOp::LdindR4,
            IndKind::R8 => IlOp::LdindR8,
            IndKind::Ref => IlOp::LdindRef,
            IndKind::U1 => IlOp::LdindU1,
            IndKind::U2 => IlOp::LdindU2,
            IndKind::U4 => IlOp::LdindU4,
        };
        self.op(op, "", 0);
    }

    pub fn ldobj(&mut self, type_ref: &str) {
        self.op(IlOp::Ldobj, type_ref, 0);
    }

    // stores

    pub fn starg(&mut self, slot: u16) {
        self.op(IlOp::Starg, slot.to_string(), -1);
    }

    pub fn stloc(&mut self, slot: u16) {
        self.op(IlOp::Stloc, slot.to_string(), -1);
    }

    pub fn stfld(&mut self, field_ref: &str) {
        self.op(IlOp::Stfld, field_ref, -2);
    }

    pub fn stsfld(&mut self, field_ref: &str) {
        self.op(IlOp::Stsfld, field_ref, -1);
    }

    pub fn stelem(&mut self, type_ref: &str) {
        self.op(IlOp::Stelem, type_ref, -3);
    }

    pub fn stind(&mut self, kind: IndKind) {
        let op = match kind {
            IndKind::I1 | IndKind::U1 => IlOp::StindI1,
            IndKind::I2 | IndKind::U2 => IlOp::StindI2,
            IndKind::I4 | IndKind::U4 => IlOp::StindI4,
            IndKind::I8 => IlOp::StindI8,
            IndKind::R4 => IlOp::StindR4,
            IndKind::R8 => IlOp::StindR8,
            IndKind::Ref => IlOp::StindRef,
        };
        self.op(op, "", -2);
    }

    pub fn stobj(&mut self, type_ref: &str) {
        self.op(IlOp::Stobj, type_ref, -2);
    }

    // arithmetic and logic

    pub fn add(&mut self) {
        self.op(IlOp::Add, "", -1);
    }

    pub fn sub(&mut self) {
        self.op(IlOp::Sub, "", -1);
    }

    pub fn mul(&mut self) {
        self.op(IlOp::Mul, "", -1);
    }

    pub fn div(&mut self) {
        self.op(IlOp::Div, "", -1);
    }

    pub fn neg(&mut self) {
        self.op(IlOp::Neg, "", 0);
    }

    pub fn not(&mut self) {
        self.op(IlOp::Not, "", 0);
    }

    pub fn and(&mut self) {
        self.op(IlOp::And, "", -1);
    }

    pub fn or(&mut self) {
        self.op(IlOp::Or, "", -1);
    }

    pub fn xor(&mut self) {
        self.op(IlOp::Xor, "", -1);
    }

    pub fn shl(&mut self) {
        self.op(IlOp::Shl, "", -1);
    }

    pub fn shr(&mut self, unsigned: bool) {
        let op = if unsigned { IlOp::ShrUn } else { IlOp::Shr };
        self.op(op, "", -1);
    }

    // comparison

    pub fn ceq(&mut self) {
        self.op(IlOp::Ceq, "", -1);
    }

    pub fn clt(&mut self) {
        self.op(IlOp::Clt, "", -1);
    }

    pub fn cgt(&mut self) {
        self.op(IlOp::Cgt, "", -1);
    }

    // branches

    pub fn br(&mut self, label: u32) {
        self.op(IlOp::Br, label.to_string(), 0);
    }

    pub fn brtrue(&mut self, label: u32) {
        self.op(IlOp::Brtrue, label.to_string(), -1);
    }

    pub fn brfalse(&mut self, label: u32) {
        self.op(IlOp::Brfalse, label.to_string(), -1);
    }

    pub fn beq(&mut self, label: u32) {
        self.op(IlOp::Beq, label.to_string(), -2);
    }

    pub fn bge(&mut self, label: u32) {
        self.op(IlOp::Bge, label.to_string(), -2);
    }

    pub fn bgt(&mut self, label: u32) {
        self.op(IlOp::Bgt, label.to_string(), -2);
    }

    pub fn ble(&mut self, label: u32) {
        self.op(IlOp::Ble, label.to_string(), -2);
    }

    pub fn blt(&mut self, label: u32) {
        self.op(IlOp::Blt, label.to_string(), -2);
    }

    // calls and object operations

    /// `args` is the total number of values the call pops, receiver
    /// included; `instance` only hints member resolution in the binary
    /// back end.
    pub fn call(&mut self, method_ref: &str, args: u16, has_ret: bool, instance: bool) {
        let delta = -(args as i32) + has_ret as i32;
        self.stack += delta;
        if self.stack > self.max_stack {
            self.max_stack = self.stack;
        }
        let mut instr = IlInstr::new(IlOp::Call, method_ref);
        instr.instance = instance;
        self.cur().body.push(instr);
    }

    /// `args` excludes the receiver, matching the signature's arity.
    pub fn callvirt(&mut self, method_ref: &str, args: u16, has_ret: bool) {
        let delta = -(args as i32) - 1 + has_ret as i32;
        self.op(IlOp::Callvirt, method_ref, delta);
    }

    pub fn newobj(&mut self, ctor_ref: &str, args: u16) {
        let delta = -(args as i32) + 1;
        self.op(IlOp::Newobj, ctor_ref, delta);
    }

    pub fn newarr(&mut self, elem_type_ref: &str) {
        self.op(IlOp::Newarr, elem_type_ref, 0);
    }

    pub fn isinst(&mut self, type_ref: &str) {
        self.op(IlOp::Isinst, type_ref, 0);
    }

    pub fn castclass(&mut self, type_ref: &str) {
        self.op(IlOp::Castclass, type_ref, 0);
    }

    pub fn initobj(&mut self, type_ref: &str) {
        self.op(IlOp::Initobj, type_ref, -1);
    }

    pub fn conv(&mut self, kind: ConvKind) {
        let op = match kind {
            ConvKind::ToI1 => IlOp::ConvI1,
            ConvKind::ToI2 => IlOp::ConvI2,
            ConvKind::ToI4 => IlOp::ConvI4,
            ConvKind::ToI8 => IlOp::ConvI8,
            ConvKind::ToR4 => IlOp::ConvR4,
            ConvKind::ToR8 => IlOp::ConvR8,
            ConvKind::ToU1 => IlOp::ConvU1,
            ConvKind::ToU2 => IlOp::ConvU2,
            ConvKind::ToU4 => IlOp::ConvU4,
            ConvKind::ToU8 => IlOp::ConvU8,
        };
        self.op(op, "", 0);
    }

    // misc

    pub fn ret(&mut self, has_value: bool) {
        let delta = if has_value { -1 } else { 0 };
        self.op(IlOp::Ret, "", delta);
    }

    pub fn dup(&mut self) {
        self.op(IlOp::Dup, "", 1);
    }

    pub fn pop(&mut self) {
        self.op(IlOp::Pop, "", -1);
    }

    pub fn nop(&mut self) {
        self.op(IlOp::Nop, "", 0);
    }

    pub fn break_(&mut self) {
        self.op(IlOp::Break, "", 0);
    }

    pub fn throw(&mut self) {
        self.op(IlOp::Throw, "", -1);
    }
}

/// Formats a floating constant so the text form round-trips exactly.
fn format_real(v: f64) -> String {
    if v == v.trunc() && v.is_finite() && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        format!("{:e}", v)
    }
}

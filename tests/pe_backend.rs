//! Binary back end: reference resolution through the object model,
//! peephole short-form selection, and the module container layout.

mod common;

use common::*;
use obx_cil::ast::*;
use obx_cil::diagnostics::Errors;
use obx_cil::il::{IlEmitter, IlOp};
use obx_cil::pe::{bytecode, optimize, OutputFormat, PeBuilder, PeInstr, PeOperand};

fn build_module() -> Module {
    let mut md = Module::new("M", "M.obx");
    let (base, _) = named_record(&mut md, "Base", None, &[("x", int_ty())]);
    named_record(&mut md, "Derived", Some(base), &[("y", int_ty())]);
    module_var(&mut md, "v", int_ty());
    md
}

fn translate_binary(md: &Module) -> PeBuilder {
    let _quiet = obx_cil::diagnostics::suppress();
    let mut builder = PeBuilder::new();
    let errs = Errors::silent();
    let had_errors = {
        let mut emitter = IlEmitter::new(&mut builder);
        obx_cil::translate(md, &mut emitter, &errs)
    };
    assert!(!had_errors, "translation reported errors");
    builder
}

#[test]
fn object_model_resolves_generated_references() {
    let md = build_module();
    let builder = translate_binary(&md);

    let mut text = Vec::new();
    builder.write_assembler(&mut text).unwrap();
    let text = String::from_utf8(text).unwrap();

    assert!(text.contains(".assembly extern 'mscorlib' {}"));
    assert!(text.contains(".assembly 'M' {}"));
    assert!(text.contains(".class public 'M' extends [mscorlib]System.Object {"));
    assert!(text.contains(".class nested public 'Base' extends [mscorlib]System.Object {"));
    assert!(text.contains(".class nested public 'Derived' extends M/Base {"));
    assert!(text.contains(".field assembly static int32 'v'"));
    assert!(text.contains("'#copy'"));
}

#[test]
fn methods_get_short_instruction_forms() {
    let md = build_module();
    let builder = translate_binary(&md);

    let mut has_short_ldarg = false;
    let mut has_short_ldc = false;
    for m in &builder.model.methods {
        for i in &m.body {
            match i.op {
                IlOp::Ldarg0 | IlOp::Ldarg1 => has_short_ldarg = true,
                IlOp::LdcI40 => has_short_ldc = true,
                IlOp::Ldarg | IlOp::LdcI4 => {
                    // long forms must only survive for operands outside
                    // the short ranges
                    match &i.operand {
                        PeOperand::Arg(n) => assert!(*n >= 256),
                        PeOperand::I32(v) => assert!(*v < -128 || *v > 127),
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }
    assert!(has_short_ldarg, "ldarg.0/1 expected in record methods");
    assert!(has_short_ldc, "ldc.i4.0 expected in initializers");
}

#[test]
fn peephole_rewrites_each_short_range() {
    let mut body = vec![
        PeInstr {
            op: IlOp::Ldarg,
            operand: PeOperand::Arg(2),
        },
        PeInstr {
            op: IlOp::Ldarg,
            operand: PeOperand::Arg(9),
        },
        PeInstr {
            op: IlOp::Stloc,
            operand: PeOperand::Local(0),
        },
        PeInstr {
            op: IlOp::LdcI4,
            operand: PeOperand::I32(-1),
        },
        PeInstr {
            op: IlOp::LdcI4,
            operand: PeOperand::I32(100),
        },
        PeInstr {
            op: IlOp::LdcI4,
            operand: PeOperand::I32(70000),
        },
    ];
    optimize(&mut body);
    assert_eq!(body[0].op, IlOp::Ldarg2);
    assert_eq!(body[0].operand, PeOperand::None);
    assert_eq!(body[1].op, IlOp::LdargS);
    assert_eq!(body[2].op, IlOp::Stloc0);
    assert_eq!(body[3].op, IlOp::LdcI4M1);
    assert_eq!(body[4].op, IlOp::LdcI4S);
    assert_eq!(body[5].op, IlOp::LdcI4);
    assert_eq!(body[5].operand, PeOperand::I32(70000));
}

#[test]
fn bytecode_container_carries_magic_and_flags() {
    let md = build_module();
    let builder = translate_binary(&md);
    let dir = tempfile::tempdir().unwrap();

    let dll = dir.path().join("M.dll");
    builder.dump_output_file(&dll, OutputFormat::Dll, false).unwrap();
    let bytes = std::fs::read(&dll).unwrap();
    assert_eq!(&bytes[..8], bytecode::MAGIC);
    let flags = bytes[10];
    assert_eq!(flags & bytecode::FLAG_EXE, 0);

    let exe = dir.path().join("M.exe");
    builder.dump_output_file(&exe, OutputFormat::Exe, true).unwrap();
    let bytes = std::fs::read(&exe).unwrap();
    let flags = bytes[10];
    assert_ne!(flags & bytecode::FLAG_EXE, 0);
    assert_ne!(flags & bytecode::FLAG_GUI, 0);
}

#[test]
fn binary_and_text_backends_accept_the_same_stream() {
    let md = build_module();
    let il = render_module(&md);
    let builder = translate_binary(&md);
    // both backends saw the same classes
    assert!(il.contains("'Derived'"));
    assert!(builder
        .model
        .classes
        .iter()
        .any(|c| c.name == "Derived" && c.extends.is_some()));
}

//! Emitter properties: bracket discipline, exact max-stack accounting,
//! label allocation and the ILASM text shape.

use obx_cil::ast::RowCol;
use obx_cil::il::{
    BackendError, IlAsmRenderer, IlBackend, IlEmitter, IlMethod, MethodKind, ModuleKind,
};

/// A backend that records finished methods for inspection.
#[derive(Default)]
struct Capture {
    methods: Vec<IlMethod>,
}

impl IlBackend for Capture {
    fn begin_module(
        &mut self,
        _name: &str,
        _imports: &[String],
        _source_file: &str,
        _kind: ModuleKind,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn end_module(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn begin_class(
        &mut self,
        _name: &str,
        _is_public: bool,
        _super_ref: Option<&str>,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn end_class(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn add_field(
        &mut self,
        _name: &str,
        _type_ref: &str,
        _is_public: bool,
        _is_static: bool,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn add_method(&mut self, method: &IlMethod) -> Result<(), BackendError> {
        self.methods.push(method.clone());
        Ok(())
    }
}

#[test]
fn max_stack_tracks_the_running_net_effect() {
    let mut capture = Capture::default();
    {
        let mut e = IlEmitter::new(&mut capture);
        e.begin_module("'M'", &[], "", ModuleKind::Library).unwrap();
        e.begin_method("'sum3'", true, MethodKind::Static, false);
        e.set_return_type("int32");
        e.ldc_i4(1);
        e.ldc_i4(2);
        e.ldc_i4(3);
        e.add();
        e.add();
        e.ret(true);
        e.end_method().unwrap();
        e.end_module().unwrap();
    }
    assert_eq!(capture.methods.len(), 1);
    assert_eq!(capture.methods[0].max_stack, 3);
}

#[test]
fn calls_pop_their_arguments_and_push_results() {
    let mut capture = Capture::default();
    {
        let mut e = IlEmitter::new(&mut capture);
        e.begin_module("'M'", &[], "", ModuleKind::Library).unwrap();
        e.begin_method("'f'", true, MethodKind::Static, false);
        e.ldc_i4(7);
        e.ldc_i4(2);
        e.call("int32 [OBX.Runtime]OBX.Runtime::DIV(int32,int32)", 2, true, false);
        e.pop();
        e.ret(false);
        e.end_method().unwrap();
        e.end_module().unwrap();
    }
    assert_eq!(capture.methods[0].max_stack, 2);
}

#[test]
fn labels_are_fresh_per_method() {
    let mut capture = Capture::default();
    {
        let mut e = IlEmitter::new(&mut capture);
        e.begin_module("'M'", &[], "", ModuleKind::Library).unwrap();
        e.begin_method("'a'", true, MethodKind::Static, false);
        assert_eq!(e.new_label(), 0);
        assert_eq!(e.new_label(), 1);
        e.ret(false);
        e.end_method().unwrap();
        e.begin_method("'b'", true, MethodKind::Static, false);
        assert_eq!(e.new_label(), 0);
        e.ret(false);
        e.end_method().unwrap();
        e.end_module().unwrap();
    }
}

#[test]
#[should_panic(expected = "method bodies must not interleave")]
fn interleaved_method_bodies_are_rejected() {
    let mut capture = Capture::default();
    let mut e = IlEmitter::new(&mut capture);
    e.begin_module("'M'", &[], "", ModuleKind::Library).unwrap();
    e.begin_method("'a'", true, MethodKind::Static, false);
    e.begin_method("'b'", true, MethodKind::Static, false);
}

#[test]
#[should_panic(expected = "end_module inside an open class")]
fn unbalanced_class_brackets_are_rejected() {
    let mut capture = Capture::default();
    let mut e = IlEmitter::new(&mut capture);
    e.begin_module("'M'", &[], "", ModuleKind::Library).unwrap();
    e.begin_class("'C'", true, None).unwrap();
    let _ = e.end_module();
}

#[test]
fn text_renderer_produces_ilasm_shape() {
    let mut renderer = IlAsmRenderer::new(Vec::new());
    {
        let mut e = IlEmitter::new(&mut renderer);
        e.begin_module(
            "'M'",
            &["'mscorlib'".to_string(), "'OBX.Runtime'".to_string()],
            "M.obx",
            ModuleKind::Library,
        )
        .unwrap();
        e.add_field("'x'", "int32", true, true).unwrap();
        e.begin_method("'p'", true, MethodKind::Static, false);
        e.add_argument("int32", "'a'");
        e.add_local("int32", "'i'");
        e.line(RowCol::new(5, 3));
        let l = e.new_label();
        e.ldc_i4(0);
        e.brfalse(l);
        e.label(l);
        e.ret(false);
        e.end_method().unwrap();
        e.end_module().unwrap();
    }
    let text = String::from_utf8(renderer.into_inner()).unwrap();
    assert!(text.contains(".assembly extern 'mscorlib' {}"));
    assert!(text.contains(".assembly extern 'OBX.Runtime' {}"));
    assert!(text.contains(".assembly 'M' {}"));
    assert!(text.contains(".module 'M.dll'"));
    assert!(text.contains(".class public sealed 'M' extends [mscorlib]System.Object {"));
    assert!(text.contains(".field public static int32 'x'"));
    assert!(text.contains(".method public static void 'p'(int32 'a') cil managed {"));
    assert!(text.contains(".maxstack 1"));
    assert!(text.contains(".locals init (int32 'i')"));
    assert!(text.contains(".line 5:3"));
    assert!(text.contains("brfalse '#0'"));
    assert!(text.contains("'#0':"));
}

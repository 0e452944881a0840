//! Driver surface: per-module outputs, the entry-point module and the
//! companion files.

mod common;

use common::*;
use obx_cil::ast::Module;
use obx_cil::pe::bytecode;
use obx_cil::{translate_all, Project};

fn project() -> Project {
    let mut md = Module::new("M", "M.obx");
    module_var(&mut md, "x", int_ty());
    Project {
        modules: vec![md],
        ..Project::default()
    }
}

#[test]
fn text_backend_writes_il_scripts_and_sidecar() {
    let _quiet = obx_cil::diagnostics::suppress();
    let dir = tempfile::tempdir().unwrap();
    let had_errors = translate_all(&project(), true, dir.path()).unwrap();
    assert!(!had_errors);

    for file in ["M.il", "Main#.il", "Main#.runtimeconfig.json", "run.sh", "build.sh", "clear.sh"] {
        assert!(dir.path().join(file).is_file(), "missing {}", file);
    }

    let main_il = std::fs::read_to_string(dir.path().join("Main#.il")).unwrap();
    assert!(main_il.contains(".entrypoint"));
    assert!(main_il.contains("call void ['M']'M'::'ping#'()"));

    let config = std::fs::read_to_string(dir.path().join("Main#.runtimeconfig.json")).unwrap();
    assert!(config.contains("Microsoft.NETCore.App"));
    assert!(config.contains("3.1.0"));

    let build = std::fs::read_to_string(dir.path().join("build.sh")).unwrap();
    assert!(build.contains("./ilasm /dll \"M.il\""));
    assert!(build.contains("./ilasm /exe \"Main#.il\""));

    let run = std::fs::read_to_string(dir.path().join("run.sh")).unwrap();
    assert!(run.contains("./mono Main#.exe"));

    let clear = std::fs::read_to_string(dir.path().join("clear.sh")).unwrap();
    assert!(clear.contains("rm \"M.il\""));
    assert!(clear.contains("rm \"Main#.runtimeconfig.json\""));
}

#[test]
fn binary_backend_writes_managed_modules() {
    let _quiet = obx_cil::diagnostics::suppress();
    let dir = tempfile::tempdir().unwrap();
    let had_errors = translate_all(&project(), false, dir.path()).unwrap();
    assert!(!had_errors);

    assert!(dir.path().join("M.il").is_file());
    let dll = std::fs::read(dir.path().join("M.dll")).unwrap();
    assert_eq!(&dll[..8], bytecode::MAGIC);
    assert_eq!(dll[10] & bytecode::FLAG_EXE, 0);

    let exe = std::fs::read(dir.path().join("Main#.exe")).unwrap();
    assert_ne!(exe[10] & bytecode::FLAG_EXE, 0);
    assert_eq!(exe[10] & bytecode::FLAG_GUI, 0);
    assert!(!dir.path().join("build.sh").exists(), "build.sh is text-only");
}

#[test]
fn chosen_entry_procedure_replaces_the_ping_chain() {
    let _quiet = obx_cil::diagnostics::suppress();
    let dir = tempfile::tempdir().unwrap();
    let mut pro = project();
    pro.main = Some(("M".to_string(), "Start".to_string()));
    translate_all(&pro, true, dir.path()).unwrap();

    let main_il = std::fs::read_to_string(dir.path().join("Main#.il")).unwrap();
    assert!(main_il.contains("call void ['M']'M'::'Start'()"));
    assert!(!main_il.contains("'ping#'"));
}

#[test]
fn missing_output_directory_is_a_driver_error() {
    let _quiet = obx_cil::diagnostics::suppress();
    let result = translate_all(&project(), true, std::path::Path::new("/nonexistent/out"));
    assert!(result.is_err());
}

#[test]
fn module_with_errors_terminates_the_run() {
    let _quiet = obx_cil::diagnostics::suppress();
    let dir = tempfile::tempdir().unwrap();
    let mut pro = project();
    pro.modules[0].had_errors = true;
    let had_errors = translate_all(&pro, true, dir.path()).unwrap();
    assert!(had_errors);
    assert!(!dir.path().join("M.il").exists(), "no partial output is kept");
}

#[test]
fn missing_library_artifact_is_a_driver_error() {
    let _quiet = obx_cil::diagnostics::suppress();
    let dir = tempfile::tempdir().unwrap();
    let lib_dir = tempfile::tempdir().unwrap();
    let mut pro = project();
    pro.lib_dir = Some(lib_dir.path().to_path_buf());
    // OBX.Runtime.dll is not present in lib_dir
    assert!(translate_all(&pro, true, dir.path()).is_err());

    std::fs::write(lib_dir.path().join("OBX.Runtime.dll"), b"stub").unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    assert!(translate_all(&pro, true, dir2.path()).is_ok());
    assert!(dir2.path().join("OBX.Runtime.dll").is_file());
}

//! Per-project translation driver.
//!
//! Drives code generation for every module of a validated project, writes
//! the chosen back end's output files, synthesizes the `Main#` entry
//! module, and produces the companion shell scripts and the runtime
//! configuration sidecar. A module that produced errors leaves no output
//! file behind.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::ast::Module;
use crate::codegen::translate;
use crate::diagnostics::{Category, Diagnostic, Errors};
use crate::il::{IlAsmRenderer, IlEmitter, MethodKind, ModuleKind};
use crate::pe::{OutputFormat, PeBuilder};

/// A validated project: modules in dependency order plus the run
/// configuration.
#[derive(Debug, Default)]
pub struct Project {
    pub modules: Vec<Module>,
    /// Explicit entry `(module, procedure)`; when absent the entry module
    /// pings every root module instead.
    pub main: Option<(String, String)>,
    /// Ship the bundled Oakwood library modules alongside the output.
    pub use_oakwood: bool,
    /// Directory holding the prebuilt library artifacts to copy.
    pub lib_dir: Option<PathBuf>,
}

const OAKWOOD_LIBS: &[&str] = &["In", "Out", "Input", "Math", "MathL"];

#[derive(Serialize)]
struct RuntimeConfig {
    #[serde(rename = "runtimeOptions")]
    runtime_options: RuntimeOptions,
}

#[derive(Serialize)]
struct RuntimeOptions {
    framework: Framework,
}

#[derive(Serialize)]
struct Framework {
    name: String,
    version: String,
}

/// Emits the synthetic entry module: a `main` that either calls the
/// chosen procedure or pings every root module to force initialization in
/// dependency order.
pub fn generate_main(
    emitter: &mut IlEmitter,
    name: &str,
    roots: &[String],
    target: Option<&(String, String)>,
) -> Result<(), Diagnostic> {
    let be = |e: crate::il::BackendError| Diagnostic::new(Category::Backend, e.message);
    let imports: Vec<String> = match target {
        Some((module, _)) => vec![format!("'{}'", module)],
        None => roots.iter().map(|m| format!("'{}'", m)).collect(),
    };
    emitter
        .begin_module(&format!("'{}'", name), &imports, "", ModuleKind::ConsoleApp)
        .map_err(be)?;
    emitter.begin_method("main", false, MethodKind::Primary, false);
    match target {
        Some((module, procedure)) => {
            let what = format!("void ['{0}']'{0}'::'{1}'()", module, procedure);
            emitter.call(&what, 0, false, false);
        }
        None => {
            for module in roots {
                let what = format!("void ['{0}']'{0}'::'ping#'()", module);
                emitter.call(&what, 0, false, false);
            }
        }
    }
    emitter.ret(false);
    emitter.end_method().map_err(be)?;
    emitter.end_module().map_err(be)
}

fn driver_error(errs: &Errors, message: String) -> anyhow::Error {
    let d = Diagnostic::new(Category::Driver, message.clone());
    errs.error(&d);
    anyhow::anyhow!(message)
}

fn copy_lib(lib_dir: &Path, out_dir: &Path, name: &str, clear: &mut String, errs: &Errors) -> Result<()> {
    let file = format!("{}.dll", name);
    let src = lib_dir.join(&file);
    if std::fs::copy(&src, out_dir.join(&file)).is_err() {
        return Err(driver_error(
            errs,
            format!("unreadable library artifact {}", src.display()),
        ));
    }
    clear.push_str(&format!("rm \"{}\"\n", file));
    Ok(())
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut f = std::fs::File::create(path)
        .with_context(|| format!("could not open for writing {}", path.display()))?;
    f.write_all(contents)?;
    Ok(())
}

/// Translates every module of the project into `out_dir`, using the text
/// renderer when `ilasm` is set and the binary builder otherwise. Returns
/// `Ok(true)` when any module produced errors; `Err` only for
/// project-level failures.
pub fn translate_all(pro: &Project, ilasm: bool, out_dir: &Path) -> Result<bool> {
    let errs = Errors::new();
    if !out_dir.is_dir() {
        return Err(driver_error(
            &errs,
            format!("output directory {} does not exist", out_dir.display()),
        ));
    }

    let mut build = String::new();
    let mut clear = String::new();

    let mut generated: Vec<&Module> = Vec::new();
    for m in &pro.modules {
        if m.synthetic || m.definition_only || m.is_generic_template() {
            continue;
        }
        if m.had_errors {
            let d = Diagnostic::new(
                Category::Generator,
                format!("terminating because of errors in {}", m.name),
            );
            errs.error(&d);
            return Ok(true);
        }
        generated.push(m);
    }

    for m in &generated {
        if ilasm {
            let mut renderer = IlAsmRenderer::new(Vec::new());
            let had_errors = {
                let mut emitter = IlEmitter::new(&mut renderer);
                translate(m, &mut emitter, &errs)
            };
            if had_errors {
                continue;
            }
            let il_path = out_dir.join(format!("{}.il", m.name));
            write_file(&il_path, &renderer.into_inner())?;
            build.push_str(&format!("./ilasm /dll \"{}.il\"\n", m.name));
            clear.push_str(&format!("rm \"{}.il\"\n", m.name));
            clear.push_str(&format!("rm \"{}.dll\"\n", m.name));
        } else {
            let mut builder = PeBuilder::new();
            let had_errors = {
                let mut emitter = IlEmitter::new(&mut builder);
                translate(m, &mut emitter, &errs)
            };
            if had_errors {
                continue;
            }
            let il_path = out_dir.join(format!("{}.il", m.name));
            let dll_path = out_dir.join(format!("{}.dll", m.name));
            if let Err(e) = builder
                .dump_output_file(&il_path, OutputFormat::Text, false)
                .and_then(|_| builder.dump_output_file(&dll_path, OutputFormat::Dll, false))
            {
                errs.error(&Diagnostic::new(Category::Backend, e.message));
                let _ = std::fs::remove_file(&il_path);
                let _ = std::fs::remove_file(&dll_path);
                continue;
            }
            clear.push_str(&format!("rm \"{}.il\"\n", m.name));
            clear.push_str(&format!("rm \"{}.dll\"\n", m.name));
        }
    }

    if !generated.is_empty() {
        let name = "Main#";
        let imported: BTreeSet<&str> = generated
            .iter()
            .flat_map(|m| m.imports.iter().map(|i| m.decl(*i).name.as_str()))
            .collect();
        let mut roots: Vec<String> = Vec::new();
        for m in generated.iter().rev() {
            if !imported.contains(m.name.as_str()) {
                roots.push(m.name.clone());
            }
        }
        if roots.is_empty() {
            roots.push(generated.last().expect("non-empty module list").name.clone());
        }

        let entry_result = if ilasm {
            let mut renderer = IlAsmRenderer::new(Vec::new());
            let res = {
                let mut emitter = IlEmitter::new(&mut renderer);
                generate_main(&mut emitter, name, &roots, pro.main.as_ref())
            };
            match res {
                Ok(()) => {
                    write_file(
                        &out_dir.join(format!("{}.il", name)),
                        &renderer.into_inner(),
                    )?;
                    build.push_str(&format!("./ilasm /exe \"{}.il\"\n", name));
                    clear.push_str(&format!("rm \"{}.il\"\n", name));
                    clear.push_str(&format!("rm \"{}.exe\"\n", name));
                    Ok(())
                }
                Err(d) => Err(d),
            }
        } else {
            let mut builder = PeBuilder::new();
            let res = {
                let mut emitter = IlEmitter::new(&mut builder);
                generate_main(&mut emitter, name, &roots, pro.main.as_ref())
            };
            match res {
                Ok(()) => {
                    let dumped = builder
                        .dump_output_file(
                            &out_dir.join(format!("{}.il", name)),
                            OutputFormat::Text,
                            false,
                        )
                        .and_then(|_| {
                            builder.dump_output_file(
                                &out_dir.join(format!("{}.exe", name)),
                                OutputFormat::Exe,
                                false,
                            )
                        });
                    match dumped {
                        Ok(()) => {
                            clear.push_str(&format!("rm \"{}.il\"\n", name));
                            clear.push_str(&format!("rm \"{}.exe\"\n", name));
                            Ok(())
                        }
                        Err(e) => Err(Diagnostic::new(Category::Backend, e.message)),
                    }
                }
                Err(d) => Err(d),
            }
        };
        if let Err(d) = entry_result {
            errs.error(&d);
        }

        // the host runtime needs the framework stub to load the module
        let config = RuntimeConfig {
            runtime_options: RuntimeOptions {
                framework: Framework {
                    name: "Microsoft.NETCore.App".to_string(),
                    version: "3.1.0".to_string(),
                },
            },
        };
        let json = serde_json::to_string_pretty(&config)?;
        write_file(
            &out_dir.join(format!("{}.runtimeconfig.json", name)),
            json.as_bytes(),
        )?;
        clear.push_str(&format!("rm \"{}.runtimeconfig.json\"\n", name));
    }

    write_file(
        &out_dir.join("run.sh"),
        b"export MONO_PATH=.\n./mono Main#.exe\n",
    )?;

    if let Some(lib_dir) = &pro.lib_dir {
        if pro.use_oakwood {
            for lib in OAKWOOD_LIBS {
                copy_lib(lib_dir, out_dir, lib, &mut clear, &errs)?;
            }
        }
        copy_lib(lib_dir, out_dir, "OBX.Runtime", &mut clear, &errs)?;
    }

    if ilasm {
        write_file(&out_dir.join("build.sh"), build.as_bytes())?;
    }
    write_file(&out_dir.join("clear.sh"), clear.as_bytes())?;

    Ok(errs.count() != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_prefer_unimported_modules() {
        let mut a = Module::new("A", "A.obx");
        let b = Module::new("B", "B.obx");
        // A imports B
        let imp = a.add_decl(crate::ast::Decl {
            name: "B".to_string(),
            kind: crate::ast::DeclKind::Import,
            ty: Module::base(crate::ast::BaseKind::None),
            visibility: crate::ast::Visibility::Private,
            loc: crate::ast::RowCol::new(1, 1),
            module: None,
            scope: None,
        });
        a.imports.push(imp);
        let pro = Project {
            modules: vec![b, a],
            ..Project::default()
        };
        let imported: BTreeSet<&str> = pro
            .modules
            .iter()
            .flat_map(|m| m.imports.iter().map(|i| m.decl(*i).name.as_str()))
            .collect();
        assert!(imported.contains("B"));
        assert!(!imported.contains("A"));
    }
}

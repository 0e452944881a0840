//! Code generation back end for an Oberon-family language targeting a
//! CIL-like managed virtual machine.
//!
//! The crate consumes a module AST that has already been parsed and
//! semantically validated (types resolved, slots assigned, visibility
//! checked) and produces either textual IL assembly or a binary managed
//! module. The pieces, front to back:
//!
//! 1. [`token`]: the terminal-symbol catalog shared with the front end.
//! 2. [`il`]: the IL operation model, the stateful emitter and the ILASM
//!    text renderer.
//! 3. [`sig`]: the textual type/member reference language that connects
//!    the generator to the binary back end.
//! 4. [`pe`]: the managed-module object model with signature-resolved
//!    classes, fields and methods, peephole optimization and file output.
//! 5. [`codegen`]: the translator proper, from AST walking and record and
//!    delegate synthesis down to expression/statement lowering.
//! 6. [`driver`]: per-project orchestration, entry-point synthesis and
//!    companion file output.

pub mod ast;
pub mod codegen;
pub mod diagnostics;
pub mod driver;
pub mod il;
pub mod pe;
pub mod sig;
pub mod token;

pub use codegen::translate;
pub use driver::{translate_all, Project};

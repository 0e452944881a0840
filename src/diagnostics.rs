//! Diagnostic reporting for the code generation back end.
//!
//! This module provides lightweight error reporting shared by the
//! generator, the signature resolver, the back ends and the driver. Errors
//! are collected into a common [`Errors`] sink so one translation run can
//! accumulate diagnostics across modules and the driver can decide from the
//! final count whether any output may be kept.
//!
//! # Error taxonomy
//!
//! - [`Category::Generator`]: the AST was valid but a construct cannot be
//!   lowered; reported with its source location, generation continues with
//!   the site skipped.
//! - [`Category::InvalidSignature`]: the signature resolver rejected a
//!   reference string synthesized by the generator; always a generator bug,
//!   reported with the offending string, halts the module.
//! - [`Category::Backend`]: I/O failure in a renderer or builder; the
//!   module's output is abandoned.
//! - [`Category::Driver`]: project-level failures (missing output
//!   directory, unreadable library artifact); halts the whole run.
//!
//! Messages print as single rustc-style lines with a `row:col` prefix when
//! a location is known. No stack traces, no multi-line context.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ast::RowCol;

/// Error categories, in escalation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Generator,
    InvalidSignature,
    Backend,
    Driver,
}

impl Category {
    fn label(self) -> &'static str {
        match self {
            Category::Generator => "generator",
            Category::InvalidSignature => "invalid signature",
            Category::Backend => "backend",
            Category::Driver => "driver",
        }
    }
}

/// A single diagnostic record.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub category: Category,
    pub message: String,
    /// Source file of the module being generated, when known.
    pub file: Option<String>,
    pub loc: Option<RowCol>,
    /// Extra context, e.g. the offending reference string.
    pub note: Option<String>,
}

impl Diagnostic {
    pub fn new(category: Category, message: impl Into<String>) -> Self {
        Diagnostic {
            category,
            message: message.into(),
            file: None,
            loc: None,
            note: None,
        }
    }

    pub fn at(category: Category, message: impl Into<String>, loc: RowCol) -> Self {
        Diagnostic {
            category,
            message: message.into(),
            file: None,
            loc: Some(loc),
            note: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(loc) = self.loc {
            write!(f, "{}:{}: ", loc.row, loc.col)?;
        }
        write!(f, "{} error: {}", self.category.label(), self.message)?;
        if let Some(file) = &self.file {
            write!(f, " [{}]", file)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Prints a compact one-line diagnostic to stderr, honoring the global
/// suppression switch.
pub fn emit_diagnostic(d: &Diagnostic) {
    if !DIAGNOSTICS_ENABLED.load(Ordering::SeqCst) {
        return;
    }
    let red = "\x1b[31m";
    let reset = "\x1b[0m";
    eprintln!("{}error{}: {}", red, reset, d);
    if let Some(note) = &d.note {
        let blue = "\x1b[34m";
        eprintln!("{}note{}: {}", blue, reset, note);
    }
}

/// Shared error collector. Holds only the running count plus console
/// reporting; callers keep the diagnostics they need for assertions.
#[derive(Debug, Default)]
pub struct Errors {
    count: Cell<u32>,
    silent: bool,
}

impl Errors {
    pub fn new() -> Self {
        Errors {
            count: Cell::new(0),
            silent: false,
        }
    }

    /// A collector that never prints; used by tests that assert counts.
    pub fn silent() -> Self {
        Errors {
            count: Cell::new(0),
            silent: true,
        }
    }

    pub fn error(&self, d: &Diagnostic) {
        self.count.set(self.count.get() + 1);
        if !self.silent {
            emit_diagnostic(d);
        }
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }
}

/// Temporarily suppresses diagnostic printing; the previous state is
/// restored when the guard drops.
pub fn suppress() -> SuppressGuard {
    let prev = DIAGNOSTICS_ENABLED.swap(false, Ordering::SeqCst);
    SuppressGuard { prev }
}

pub struct SuppressGuard {
    prev: bool,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        DIAGNOSTICS_ENABLED.store(self.prev, Ordering::SeqCst);
    }
}

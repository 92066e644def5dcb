//! A compiler for a small line-oriented language, targeting the vasm
//! register bytecode, together with an assembler, a linker and a virtual
//! machine to run the result.
//!
//! The pipeline is
//!
//! ```text
//! source -> frontend (AST) -> middle (IR, optimizations)
//!        -> backend (instructions, object file) -> link -> vm
//! ```

use colored::Colorize;
use log::debug;

use crate::{
    backend::{
        BackendError, CompileOptions,
        assembler::{AsmItem, AsmParseError, AssembleError, assemble},
        emit_object,
        object::{Executable, FormatError, LinkError, ObjectFile, link},
    },
    frontend::{SourceFile, diagnostic::CompileError, parser::Parser},
    middle::{
        ir::{Function, builder::build_module},
        optimization::optimize_function,
    },
    vm::VmError,
};

pub mod backend;
pub mod frontend;
pub mod index;
pub mod middle;
pub mod vm;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    AsmParse(#[from] AsmParseError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Formats the error for the terminal. Errors that point into source
    /// text show the offending line.
    pub fn render(&self, source: Option<&SourceFile>) -> String {
        match (self, source) {
            (Error::Compile(error), Some(source)) => error.render(source),
            _ => format!("{}: {}", "error".red().bold(), self.to_string().bold()),
        }
    }
}

/// The output of every stage for one source file
#[derive(Debug)]
pub struct CompiledModule {
    /// Optimized IR
    pub functions: Vec<Function>,
    pub items: Vec<AsmItem>,
    pub object: ObjectFile,
}

/// Compiles one source file into an object. Every function is built even if
/// an earlier one fails, and all errors found are returned in source order.
pub fn compile_module(
    source: &SourceFile,
    options: &CompileOptions,
) -> Result<CompiledModule, Vec<Error>> {
    let module = Parser::parse_module(source).map_err(|e| vec![e.into()])?;

    let ir = build_module(&module, source);
    if !ir.errors.is_empty() {
        return Err(ir.errors.into_iter().map(Error::from).collect());
    }

    let mut functions = ir.functions;
    for function in &mut functions {
        optimize_function(function, options.flags);
    }

    let (items, object) = emit_object(&functions, options).map_err(|e| vec![e.into()])?;
    debug!("compiled {}: {} bytes of code", source.origin, object.code.len());

    Ok(CompiledModule {
        functions,
        items,
        object,
    })
}

pub fn compile_source(text: &str, options: &CompileOptions) -> Result<CompiledModule, Vec<Error>> {
    compile_module(&SourceFile::from_memory(text), options)
}

/// Combines several modules into one object
pub fn assemble_modules(modules: &[CompiledModule]) -> Result<ObjectFile, Error> {
    let items = modules
        .iter()
        .flat_map(|module| module.items.iter().copied())
        .collect::<Vec<_>>();

    Ok(assemble(&items)?)
}

/// Compiles and links one program. Stops at the first error.
pub fn build_source(text: &str, options: &CompileOptions) -> Result<Executable, Error> {
    let module = compile_source(text, options).map_err(first_error)?;
    Ok(link(&[module.object], false)?)
}

/// First error wins
fn first_error(mut errors: Vec<Error>) -> Error {
    errors.swap_remove(0)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::vm::{CaptureHost, VmConfig, VmExit, run_executable};

    #[test]
    fn every_broken_function_is_reported() {
        let source = indoc! {"
            func a() -> long
                return x
            end

            func b() -> long
                return y
            end
        "};

        let errors = compile_source(source, &CompileOptions::default()).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, Error::Compile(_))));
    }

    #[test]
    fn modules_link_together() {
        let main = compile_source(
            indoc! {"
                extern func seven() -> long

                func main() -> long
                    return seven() * 6
                end
            "},
            &CompileOptions::default(),
        )
        .unwrap();
        let library = compile_source(
            indoc! {"
                func seven() -> long
                    return 7
                end
            "},
            &CompileOptions::default(),
        )
        .unwrap();

        let executable = link(&[main.object, library.object], false).unwrap();
        let (exit, _) =
            run_executable(&executable, VmConfig::default(), CaptureHost::default()).unwrap();
        assert_eq!(exit, VmExit::Exited(42));
    }

    #[test]
    fn errors_without_source_still_render() {
        let error = Error::from(VmError::DivisionByZero);
        let rendered = strip_ansi_escapes::strip_str(error.render(None));
        assert_eq!(rendered, "error: division by zero");
    }
}

//! The backend turns optimized IR into vasm bytecode. Variables are given
//! registers, each IR line is expanded into instructions, the instruction
//! stream is cleaned up and finally encoded into an object file that the
//! linker combines into an executable.

use log::debug;

use crate::{
    backend::{
        assembler::{AsmItem, AssembleError, assemble},
        lowering::{LoweringError, entry_stub, lower_function},
        object::ObjectFile,
    },
    middle::{
        ir::Function,
        optimization::{OptimizationKind, OptimizerFlags},
    },
};

pub mod assembler;
pub mod isa;
pub mod lowering;
pub mod object;
pub mod peephole;
pub mod regalloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub flags: OptimizerFlags,
    /// Emit `_start` when the module defines `main`
    pub entry_stub: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            flags: OptimizerFlags::default(),
            entry_stub: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Lowering(#[from] LoweringError),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
}

/// Lowers every function and assembles the result into one object
pub fn emit_object(
    functions: &[Function],
    options: &CompileOptions,
) -> Result<(Vec<AsmItem>, ObjectFile), BackendError> {
    let mut items = Vec::new();

    if options.entry_stub && functions.iter().any(|f| f.name.value() == "main") {
        items.extend(entry_stub());
    }

    for function in functions {
        let mut lowered = lower_function(function)?;

        if options.flags.contains(OptimizationKind::BytecodePeephole) {
            peephole::optimize_bytecode(&mut lowered);
        }

        items.extend(lowered);
    }

    let object = assemble(&items)?;
    debug!(
        "emitted {} function(s) into {} bytes",
        functions.len(),
        object.code.len()
    );

    Ok((items, object))
}

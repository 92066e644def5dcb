//! IR optimizations. The line pass and the CFG pass are interleaved until
//! neither finds anything left to do.

use log::{debug, warn};
use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::middle::ir::Function;

pub mod cfg;
pub mod dependency;
pub mod peephole;

/// Rounds of the line pass per round of the driver
const LINE_ROUNDS: usize = 5;
/// Driver rounds before giving up on reaching a fixpoint
const MAX_ROUNDS: usize = 32;

/// A single, independently togglable rewrite
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, IntoStaticStr, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum OptimizationKind {
    UnusedAssign,
    ConstIf,
    ConstFold,
    NoopMath,
    FastDiv,
    VarSubstitute,
    InvertIf,
    SelfInvert,
    SubstituteTempIf,
    /// Deletes writes to variables no external effect depends on
    EliminateNodepends,
    FoldGoto,
    InlineBlock,
    DeadBlock,
    UnrollLoop,
    JumpToNext,
    UnusedLabel,
    /// Cleanup of the emitted instruction stream
    BytecodePeephole,
}

/// A set of [`OptimizationKind`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptimizerFlags(u32);

impl OptimizerFlags {
    pub const fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        OptimizationKind::iter().collect()
    }

    pub fn contains(self, kind: OptimizationKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn insert(&mut self, kind: OptimizationKind) {
        self.0 |= Self::bit(kind);
    }

    pub fn remove(&mut self, kind: OptimizationKind) {
        self.0 &= !Self::bit(kind);
    }

    pub fn with(mut self, kind: OptimizationKind) -> Self {
        self.insert(kind);
        self
    }

    pub fn without(mut self, kind: OptimizationKind) -> Self {
        self.remove(kind);
        self
    }

    pub fn iter(self) -> impl Iterator<Item = OptimizationKind> {
        OptimizationKind::iter().filter(move |kind| self.contains(*kind))
    }

    fn bit(kind: OptimizationKind) -> u32 {
        1 << kind as u32
    }
}

/// Everything except dependency-based elimination, which relies on an
/// approximate analysis
impl Default for OptimizerFlags {
    fn default() -> Self {
        Self::all().without(OptimizationKind::EliminateNodepends)
    }
}

impl FromIterator<OptimizationKind> for OptimizerFlags {
    fn from_iter<T: IntoIterator<Item = OptimizationKind>>(iter: T) -> Self {
        let mut flags = Self::none();
        for kind in iter {
            flags.insert(kind);
        }
        flags
    }
}

/// Runs the optimizers on a function until nothing changes. Returns whether
/// anything did.
pub fn optimize_function(function: &mut Function, flags: OptimizerFlags) -> bool {
    let before = function.lines.len();
    let mut changed_any = false;

    for round in 0..MAX_ROUNDS {
        let mut changed = false;

        for _ in 0..LINE_ROUNDS {
            if !peephole::optimize_lines(function, flags) {
                break;
            }
            changed = true;
        }

        changed |= cfg::optimize_cfg(function, flags);

        if flags.contains(OptimizationKind::EliminateNodepends) {
            changed |= dependency::eliminate_nodepends(function);
        }

        if !changed {
            debug!(
                "optimized `{}` in {round} round(s): {before} -> {} lines",
                function.name,
                function.lines.len()
            );
            return changed_any;
        }

        changed_any = true;
    }

    warn!(
        "optimizer gave up on `{}` after {MAX_ROUNDS} rounds",
        function.name
    );
    changed_any
}

//! Block-level rewrites. The flat IR is cut into basic blocks, one rewrite
//! is applied, and the graph is rebuilt from the result before the next.

use hashbrown::HashSet;
use log::debug;

use crate::{
    frontend::intern::{Symbol, SymbolTable},
    index::{Index, IndexVec, simple_index},
    middle::{
        ir::{Function, Line},
        optimization::{OptimizationKind, OptimizerFlags},
    },
};

/// Loops with at most this many statements are unrolled once
const UNROLL_LIMIT: usize = 6;
/// Prefix of the header label of a loop that was already unrolled
const UNROLLED_PREFIX: &str = "_unrolled";
/// Rewrites per call before giving up
const MAX_REWRITES: usize = 1000;

simple_index! {
    pub struct BlockId;
}

#[derive(Debug, Clone)]
pub struct Block {
    pub lines: Vec<Line>,
    /// Explicit jump target
    pub branch0: Option<BlockId>,
    /// Fall-through successor
    pub branch1: Option<BlockId>,
    /// Incoming edges, plus one for the entry block
    pub refcount: usize,
}

impl Block {
    pub fn label(&self) -> Option<Symbol> {
        match self.lines.first() {
            Some(Line::Label { name }) => Some(*name),
            _ => None,
        }
    }

    /// Index of the line that ends the block: the last line that isn't
    /// bookkeeping
    fn terminator_index(&self) -> Option<usize> {
        self.lines.iter().rposition(|line| !line.is_bookkeeping())
    }

    pub fn terminator(&self) -> Option<&Line> {
        self.terminator_index().map(|index| &self.lines[index])
    }

    /// Lines that do something: no labels, declarations or destructions
    fn statements(&self) -> impl Iterator<Item = &Line> {
        self.lines
            .iter()
            .filter(|line| !line.is_bookkeeping() && !matches!(line, Line::Label { .. }))
    }
}

/// Blocks in layout order
#[derive(Debug)]
pub struct ControlFlowGraph {
    pub blocks: IndexVec<BlockId, Block>,
    labels: SymbolTable<BlockId>,
}

impl ControlFlowGraph {
    pub fn build(lines: &[Line]) -> Self {
        let mut blocks: IndexVec<BlockId, Block> = IndexVec::new();
        let mut current = Vec::new();
        let mut lines = lines.iter().peekable();

        let mut close = |current: &mut Vec<Line>| {
            if !current.is_empty() {
                blocks.push(Block {
                    lines: std::mem::take(current),
                    branch0: None,
                    branch1: None,
                    refcount: 0,
                });
            }
        };

        while let Some(line) = lines.next() {
            if matches!(line, Line::Label { .. }) {
                close(&mut current);
            }

            current.push(line.clone());

            if matches!(
                line,
                Line::Goto { .. } | Line::If { .. } | Line::Return { .. }
            ) {
                while let Some(destroy) = lines.next_if(|l| matches!(l, Line::Destroy { .. })) {
                    current.push(destroy.clone());
                }
                close(&mut current);
            }
        }
        close(&mut current);

        let labels: SymbolTable<BlockId> = blocks
            .indices()
            .filter_map(|id| blocks[id].label().map(|label| (label, id)))
            .collect();

        let count = blocks.len();
        for id in blocks.indices() {
            let next = (id.index() + 1 < count).then(|| BlockId::new(id.index() + 1));
            let block = &mut blocks[id];

            let (branch0, branch1) = match block.terminator() {
                Some(Line::Goto { label }) => (labels.get(label).copied(), None),
                Some(Line::If { label, .. }) => (labels.get(label).copied(), next),
                Some(Line::Return { .. }) => (None, None),
                _ => (None, next),
            };

            block.branch0 = branch0;
            block.branch1 = branch1;
        }

        if let Some(entry) = blocks.raw.first_mut() {
            entry.refcount = 1;
        }
        for id in blocks.indices() {
            let (branch0, branch1) = (blocks[id].branch0, blocks[id].branch1);
            for target in branch0.into_iter().chain(branch1) {
                blocks[target].refcount += 1;
            }
        }

        Self { blocks, labels }
    }

    pub fn into_lines(self) -> Vec<Line> {
        self.blocks
            .raw
            .into_iter()
            .flat_map(|block| block.lines)
            .collect()
    }

    fn block_of(&self, label: Symbol) -> Option<BlockId> {
        self.labels.get(&label).copied()
    }

    fn is_referenced(&self, label: Symbol) -> bool {
        self.blocks
            .raw
            .iter()
            .flat_map(|block| &block.lines)
            .any(|line| line.jump_target() == Some(label))
    }

    fn retarget(&mut self, id: BlockId, label: Symbol) {
        if let Some(index) = self.blocks[id].terminator_index() {
            if let Line::Goto { label: target } | Line::If { label: target, .. } =
                &mut self.blocks[id].lines[index]
            {
                *target = label;
            }
        }
    }

    /// Applies the first rewrite that fires anywhere in the graph
    fn rewrite(&mut self, function: &mut Function, flags: OptimizerFlags) -> Option<OptimizationKind> {
        let rules: [(OptimizationKind, fn(&mut Self, BlockId, &mut Function) -> bool); 6] = [
            (OptimizationKind::FoldGoto, Self::fold_goto),
            (OptimizationKind::InlineBlock, Self::inline_block),
            (OptimizationKind::DeadBlock, Self::remove_dead_block),
            (OptimizationKind::UnrollLoop, Self::unroll_loop),
            (OptimizationKind::JumpToNext, Self::remove_jump_to_next),
            (OptimizationKind::UnusedLabel, Self::remove_unused_label),
        ];

        for id in self.blocks.indices() {
            for (kind, rule) in rules {
                if flags.contains(kind) && rule(self, id, function) {
                    return Some(kind);
                }
            }
        }

        None
    }

    /// A jump to a block that only jumps on goes straight to the final
    /// destination
    fn fold_goto(&mut self, id: BlockId, _: &mut Function) -> bool {
        let Some(first) = self.blocks[id].terminator().and_then(Line::jump_target) else {
            return false;
        };

        let mut target = first;
        let mut visited = HashSet::new();
        visited.insert(target);

        while let Some(relay) = self.block_of(target) {
            let mut statements = self.blocks[relay].statements();
            let (Some(Line::Goto { label }), None) = (statements.next(), statements.next()) else {
                break;
            };

            if !visited.insert(*label) {
                // A cycle of relays never gets anywhere
                return false;
            }
            target = *label;
        }

        if target == first {
            return false;
        }

        self.retarget(id, target);
        true
    }

    /// A block reached only through one `goto` is moved behind it
    fn inline_block(&mut self, id: BlockId, _: &mut Function) -> bool {
        let Some(Line::Goto { label }) = self.blocks[id].terminator() else {
            return false;
        };
        let Some(target) = self.block_of(*label) else {
            return false;
        };

        let moves = target != id
            && target.index() != id.index() + 1
            && target.index() != 0
            && self.blocks[target].refcount == 1
            && matches!(
                self.blocks[target].terminator(),
                Some(Line::Goto { .. } | Line::Return { .. })
            );

        if !moves {
            return false;
        }

        if let Some(index) = self.blocks[id].terminator_index() {
            self.blocks[id].lines.remove(index);
        }

        let block = self.blocks.raw.remove(target.index());
        let position = if target.index() < id.index() {
            id.index()
        } else {
            id.index() + 1
        };
        self.blocks.raw.insert(position, block);
        true
    }

    fn remove_dead_block(&mut self, id: BlockId, _: &mut Function) -> bool {
        if self.blocks[id].refcount != 0 || self.blocks[id].lines.is_empty() {
            return false;
        }

        self.blocks[id].lines.clear();
        true
    }

    /// Duplicates the body of a small loop, so every back edge runs two
    /// iterations
    fn unroll_loop(&mut self, id: BlockId, function: &mut Function) -> bool {
        let Some(Line::Goto { label }) = self.blocks[id].terminator() else {
            return false;
        };
        let label = *label;

        if label.value().starts_with(UNROLLED_PREFIX) {
            return false;
        }

        let Some(header) = self.block_of(label).filter(|header| *header <= id) else {
            return false;
        };

        let region = header.index()..=id.index();
        let blocks = &self.blocks.raw[region.clone()];

        let has_inner_labels = blocks[1..].iter().any(|block| block.label().is_some());
        let has_asm = blocks
            .iter()
            .flat_map(|block| &block.lines)
            .any(|line| matches!(line, Line::InlineAsm { .. }));
        // The back edge itself doesn't count
        let statements = blocks
            .iter()
            .map(|block| block.statements().count())
            .sum::<usize>()
            - 1;

        if has_inner_labels || has_asm || statements == 0 || statements > UNROLL_LIMIT {
            return false;
        }

        let mut lines: Vec<Line> = blocks.iter().flat_map(|block| block.lines.clone()).collect();
        let Some(back_edge) = lines.iter().rposition(|line| !line.is_bookkeeping()) else {
            return false;
        };
        let trailing = lines.split_off(back_edge + 1);
        lines.pop();

        // Without the header label
        let body = lines.split_off(1);

        let unrolled = function.new_label(UNROLLED_PREFIX.trim_start_matches('_'));
        debug!("unrolling `{label}` of `{}` as `{unrolled}`", function.name);

        let mut replacement = vec![Line::Label { name: unrolled }];
        replacement.extend(body.iter().cloned());
        replacement.extend(body);
        replacement.push(Line::Goto { label: unrolled });
        replacement.extend(trailing);

        for block in &mut self.blocks.raw[region.clone()] {
            block.lines.clear();
        }
        self.blocks.raw[header.index()].lines = replacement;

        for line in self.blocks.raw.iter_mut().flat_map(|block| &mut block.lines) {
            if let Line::Goto { label: target } | Line::If { label: target, .. } = line {
                if *target == label {
                    *target = unrolled;
                }
            }
        }

        true
    }

    /// A jump to the block right after is the same as falling through
    fn remove_jump_to_next(&mut self, id: BlockId, _: &mut Function) -> bool {
        let Some(label) = self.blocks[id].terminator().and_then(Line::jump_target) else {
            return false;
        };

        let next = self.blocks.raw[id.index() + 1..]
            .iter()
            .find(|block| !block.lines.is_empty());
        if next.and_then(Block::label) != Some(label) {
            return false;
        }

        if let Some(index) = self.blocks[id].terminator_index() {
            self.blocks[id].lines.remove(index);
        }
        true
    }

    fn remove_unused_label(&mut self, id: BlockId, _: &mut Function) -> bool {
        let Some(label) = self.blocks[id].label() else {
            return false;
        };

        if self.is_referenced(label) {
            return false;
        }

        self.blocks[id].lines.remove(0);
        true
    }
}

/// Runs block-level rewrites until none applies. Returns whether anything
/// changed.
pub fn optimize_cfg(function: &mut Function, flags: OptimizerFlags) -> bool {
    let mut changed = false;

    for _ in 0..MAX_REWRITES {
        let mut graph = ControlFlowGraph::build(&function.lines);

        let Some(kind) = graph.rewrite(function, flags) else {
            return changed;
        };

        debug!("{kind} rewrote `{}`", function.name);
        function.lines = graph.into_lines();
        changed = true;
    }

    changed
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        frontend::{SourceFile, parser::Parser},
        middle::ir::{Operand, builder::build_module},
    };

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    fn build(source: &str) -> Function {
        let source = SourceFile::from_memory(source);
        let module = Parser::parse_module(&source).unwrap();
        let mut module = build_module(&module, &source);
        assert_eq!(module.errors, vec![]);
        module.functions.remove(0)
    }

    fn labels(function: &Function) -> Vec<Symbol> {
        function
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Label { name } => Some(*name),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn blocks_and_edges() {
        let function = build(indoc! {"
            func f(long a) -> long
                if a
                    a = 1
                else
                    a = 2
                end
                return a
            end
        "});

        let graph = ControlFlowGraph::build(&function.lines);
        let blocks = &graph.blocks.raw;

        // test, then, else, end
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].branch0, Some(BlockId::new(2)));
        assert_eq!(blocks[0].branch1, Some(BlockId::new(1)));
        assert_eq!(blocks[1].branch0, Some(BlockId::new(3)));
        assert_eq!(blocks[1].branch1, None);
        assert_eq!(blocks[3].refcount, 2);
        assert_eq!(blocks[0].refcount, 1);
        assert_eq!(graph.into_lines(), function.lines);
    }

    #[test]
    fn dead_blocks_and_labels_go_away() {
        let a = sym("a");
        let mut function = build(indoc! {"
            func f(long a) -> long
                return a
            end
        "});
        function.lines = vec![
            Line::Goto { label: sym("_end1") },
            Line::Label { name: sym("_else0") },
            Line::Return {
                value: Some(Operand::Literal(0)),
            },
            Line::Label { name: sym("_end1") },
            Line::Return {
                value: Some(Operand::Variable(a)),
            },
        ];

        assert!(optimize_cfg(&mut function, OptimizerFlags::default()));
        assert_eq!(
            function.lines,
            vec![Line::Return {
                value: Some(Operand::Variable(a)),
            }]
        );
    }

    #[test]
    fn relay_jumps_are_folded() {
        let mut function = build(indoc! {"
            func f(long a) -> long
                return a
            end
        "});
        function.lines = vec![
            Line::If {
                condition: sym("a"),
                label: sym("_relay"),
                invert: false,
            },
            Line::Return {
                value: Some(Operand::Literal(1)),
            },
            Line::Label { name: sym("_relay") },
            Line::Goto {
                label: sym("_out"),
            },
            Line::Label { name: sym("_out") },
            Line::Return {
                value: Some(Operand::Literal(2)),
            },
        ];

        let flags = OptimizerFlags::none()
            .with(OptimizationKind::FoldGoto)
            .with(OptimizationKind::DeadBlock)
            .with(OptimizationKind::UnusedLabel);
        assert!(optimize_cfg(&mut function, flags));
        assert_eq!(
            function.lines[0],
            Line::If {
                condition: sym("a"),
                label: sym("_out"),
                invert: false,
            }
        );
        assert_eq!(labels(&function), vec![sym("_out")]);
    }

    #[test]
    fn small_loops_are_unrolled_once() {
        let mut function = build(indoc! {"
            func f() -> long
                long total = 0
                for i in 0 to 4
                    total += i
                end
                return total
            end
        "});

        let flags = OptimizerFlags::none().with(OptimizationKind::UnrollLoop);
        assert!(optimize_cfg(&mut function, flags));

        let increments = function
            .lines
            .iter()
            .filter(|line| {
                matches!(line, Line::Math { dest, .. } if *dest == sym("total"))
            })
            .count();
        assert_eq!(increments, 2);
        assert!(labels(&function)[0].value().starts_with("_unrolled"));

        assert!(!optimize_cfg(&mut function, flags));
    }
}

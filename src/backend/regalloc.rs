//! Register assignment over live intervals.
//!
//! An interval runs from the first to the last line mentioning a variable.
//! Where an interval overlaps a loop formed by a backward jump it is widened
//! to cover the whole loop, so a value carried around the back edge keeps
//! its register. Registers are then handed out first-free in order of
//! interval start. Parameters keep `r0..argc` for the whole function.

use hashbrown::HashMap;
use itertools::Itertools;
use log::debug;

use crate::{
    backend::isa::Register,
    frontend::intern::{Symbol, SymbolTable},
    middle::ir::{Function, Line, Operand},
};

/// `r0..=r28`; r29 and r30 are scratch and r31 is the stack pointer
pub const ALLOCATABLE: usize = 29;
/// Most distinct constants kept in registers
pub const MAX_HOISTED_CONSTANTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("`{function}` needs more than {ALLOCATABLE} registers")]
    OutOfRegisters { function: Symbol },
    #[error("`{function}` takes more than {ALLOCATABLE} arguments")]
    TooManyArguments { function: Symbol },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub variable: Symbol,
    /// Line index of the first mention
    pub start: usize,
    /// Line index of the last mention, inclusive
    pub end: usize,
}

impl Interval {
    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start <= end && start <= self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub registers: SymbolTable<Register>,
    pub intervals: Vec<Interval>,
    /// Literals loaded once in the prologue
    pub constants: HashMap<i64, Register>,
}

impl Allocation {
    pub fn register(&self, variable: Symbol) -> Option<Register> {
        self.registers.get(&variable).copied()
    }

    pub fn constant(&self, value: i64) -> Option<Register> {
        self.constants.get(&value).copied()
    }

    /// Registers holding a value that is still needed after line `index`
    pub fn live_across(&self, index: usize) -> Vec<Register> {
        self.intervals
            .iter()
            .filter(|interval| interval.start < index && index < interval.end)
            .filter_map(|interval| self.register(interval.variable))
            .chain(self.constants.values().copied())
            .sorted()
            .dedup()
            .collect()
    }

    /// Every register this function touches
    pub fn used_registers(&self) -> Vec<Register> {
        self.registers
            .values()
            .chain(self.constants.values())
            .copied()
            .sorted()
            .dedup()
            .collect()
    }
}

/// Finds the live interval of every variable in `function`
pub fn live_intervals(function: &Function) -> Vec<Interval> {
    let mut order: Vec<Symbol> = function.arguments.iter().map(|a| a.name).collect();
    let mut spans: SymbolTable<(usize, usize)> = function
        .arguments
        .iter()
        .map(|a| (a.name, (0, function.lines.len())))
        .collect();

    for (index, line) in function.lines.iter().enumerate() {
        for variable in mentioned(line) {
            spans
                .entry(variable)
                .and_modify(|(_, end)| *end = (*end).max(index))
                .or_insert_with(|| {
                    order.push(variable);
                    (index, index)
                });
        }
    }

    let mut intervals: Vec<Interval> = order
        .into_iter()
        .map(|variable| {
            let (start, end) = spans[&variable];
            Interval {
                variable,
                start,
                end,
            }
        })
        .collect();

    let loops = backward_jumps(function);
    loop {
        let mut changed = false;

        for interval in &mut intervals {
            for &(head, jump) in &loops {
                if !interval.overlaps(head, jump) {
                    continue;
                }

                let inside = head <= interval.start && interval.end <= jump;
                if inside && !reads_before_write(function, interval) {
                    continue;
                }

                let widened = (interval.start.min(head), interval.end.max(jump));
                if widened != (interval.start, interval.end) {
                    (interval.start, interval.end) = widened;
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }

    intervals
}

fn mentioned(line: &Line) -> Vec<Symbol> {
    match line {
        Line::Declare { name, .. } | Line::Destroy { name } => vec![*name],
        other => other.reads().into_iter().chain(other.writes()).collect(),
    }
}

/// (label index, jump index) of every jump to an earlier label
fn backward_jumps(function: &Function) -> Vec<(usize, usize)> {
    let labels: SymbolTable<usize> = function
        .lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| match line {
            Line::Label { name } => Some((*name, index)),
            _ => None,
        })
        .collect();

    function
        .lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| {
            let head = *labels.get(&line.jump_target()?)?;
            (head <= index).then_some((head, index))
        })
        .collect()
}

/// Whether the first real use of a variable inside its interval is a read,
/// which means a value from the previous iteration is observed
fn reads_before_write(function: &Function, interval: &Interval) -> bool {
    function.lines[interval.start..=interval.end]
        .iter()
        .find(|line| !line.is_bookkeeping() && line.mentions(interval.variable))
        .is_some_and(|line| line.reads_variable(interval.variable))
}

/// Assigns a register to every variable of `function` and hoists repeated
/// literals into the registers left over
pub fn allocate(function: &Function) -> Result<Allocation, AllocationError> {
    if function.arguments.len() > ALLOCATABLE {
        return Err(AllocationError::TooManyArguments {
            function: function.name,
        });
    }

    let intervals = live_intervals(function);
    let mut registers = SymbolTable::new();
    let mut busy_until: [Option<usize>; ALLOCATABLE] = [None; ALLOCATABLE];

    for (index, argument) in function.arguments.iter().enumerate() {
        busy_until[index] = Some(usize::MAX);
        registers.insert(argument.name, register(index));
    }

    for interval in intervals
        .iter()
        .filter(|i| !function.is_argument(i.variable))
        .sorted_by_key(|i| i.start)
    {
        let slot = busy_until
            .iter()
            .position(|end| end.is_none_or(|end| end < interval.start))
            .ok_or(AllocationError::OutOfRegisters {
                function: function.name,
            })?;

        busy_until[slot] = Some(interval.end);
        registers.insert(interval.variable, register(slot));
    }

    let free: Vec<usize> = (0..ALLOCATABLE)
        .filter(|&slot| !registers.values().any(|r| r.index() == slot))
        .collect();
    let constants = hoist_constants(function, &free);

    debug!(
        "allocated {} variable(s) and {} constant(s) in `{}`",
        registers.len(),
        constants.len(),
        function.name
    );

    Ok(Allocation {
        registers,
        intervals,
        constants,
    })
}

fn register(slot: usize) -> Register {
    Register::new(slot as u8).unwrap_or(Register::RETURN)
}

/// Literals used by at least two assignments or operations. Either all of
/// them get a register or none do.
fn hoist_constants(function: &Function, free: &[usize]) -> HashMap<i64, Register> {
    let counts = function
        .lines
        .iter()
        .flat_map(|line| match line {
            Line::Assign { value, .. } => vec![*value],
            Line::Math { lhs, rhs, .. } => [Some(*lhs), *rhs].into_iter().flatten().collect(),
            _ => vec![],
        })
        .filter_map(Operand::literal)
        .counts();

    let candidates: Vec<i64> = counts
        .into_iter()
        .filter(|&(_, count)| count >= 2)
        .map(|(value, _)| value)
        .sorted()
        .collect();

    if candidates.len() > MAX_HOISTED_CONSTANTS || candidates.len() > free.len() {
        return HashMap::new();
    }

    candidates
        .into_iter()
        .zip(free.iter().rev())
        .map(|(value, &slot)| (value, register(slot)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        ir::{Argument, FunctionSignature, MathOp},
        ty::Type,
    };

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    fn function(arguments: &[&str], lines: Vec<Line>) -> Function {
        let mut function = Function::new(FunctionSignature {
            name: sym("f"),
            arguments: arguments
                .iter()
                .map(|name| Argument {
                    name: sym(name),
                    ty: Type::LONG,
                })
                .collect(),
            return_type: Type::LONG,
        });
        function.lines = lines;
        function
    }

    fn declare(name: &str) -> Line {
        Line::Declare {
            name: sym(name),
            ty: Type::LONG,
        }
    }

    fn destroy(name: &str) -> Line {
        Line::Destroy { name: sym(name) }
    }

    fn add(dest: &str, lhs: &str, rhs: i64) -> Line {
        Line::Math {
            op: MathOp::Add,
            dest: sym(dest),
            lhs: Operand::Variable(sym(lhs)),
            rhs: Some(Operand::Literal(rhs)),
        }
    }

    #[test]
    fn disjoint_intervals_share_registers() {
        let function = function(
            &["a"],
            vec![
                declare("x"),
                add("x", "a", 1),
                destroy("x"),
                declare("y"),
                add("y", "a", 2),
                destroy("y"),
                Line::Return {
                    value: Some(Operand::Variable(sym("a"))),
                },
            ],
        );

        let allocation = allocate(&function).unwrap();
        assert_eq!(allocation.register(sym("a")), Register::new(0));
        assert_eq!(allocation.register(sym("x")), Register::new(1));
        assert_eq!(allocation.register(sym("y")), Register::new(1));
    }

    #[test]
    fn loops_widen_carried_values() {
        // `n` is only mentioned before and at the top of the loop, but the
        // back edge reads it again
        let function = function(
            &[],
            vec![
                declare("n"),
                Line::Assign {
                    var: sym("n"),
                    value: Operand::Literal(3),
                    is_const: false,
                },
                Line::Label { name: sym("_loop0") },
                add("n", "n", -1),
                Line::If {
                    condition: sym("n"),
                    label: sym("_end1"),
                    invert: true,
                },
                declare("t"),
                add("t", "n", 0),
                destroy("t"),
                Line::Goto { label: sym("_loop0") },
                Line::Label { name: sym("_end1") },
                destroy("n"),
                Line::Return { value: None },
            ],
        );

        let intervals = live_intervals(&function);
        let t = intervals.iter().find(|i| i.variable == sym("t")).unwrap();
        assert_eq!((t.start, t.end), (5, 7));

        let allocation = allocate(&function).unwrap();
        assert_ne!(allocation.register(sym("n")), allocation.register(sym("t")));

        // A value read at the top of the loop before it's written there is
        // carried around, so it spans the loop
        let mut carried = function.clone();
        carried.lines[5] = Line::Declare {
            name: sym("t"),
            ty: Type::LONG,
        };
        carried.lines[6] = add("t", "t", 1);
        let intervals = live_intervals(&carried);
        let t = intervals.iter().find(|i| i.variable == sym("t")).unwrap();
        assert_eq!((t.start, t.end), (2, 8));
    }

    #[test]
    fn repeated_literals_are_hoisted() {
        let function = function(
            &["a"],
            vec![
                declare("x"),
                add("x", "a", 1000),
                add("x", "x", 1000),
                add("x", "x", 7),
                Line::Return {
                    value: Some(Operand::Variable(sym("x"))),
                },
            ],
        );

        let allocation = allocate(&function).unwrap();
        assert_eq!(allocation.constants.len(), 1);
        assert_eq!(allocation.constant(1000), Register::new(28));
        assert_eq!(allocation.constant(7), None);
    }

    #[test]
    fn too_many_live_values() {
        let mut lines: Vec<Line> = (0..30).map(|i| declare(&format!("v{i}"))).collect();
        lines.extend((0..30).map(|i| destroy(&format!("v{i}"))));

        assert_eq!(
            allocate(&function(&[], lines)).unwrap_err(),
            AllocationError::OutOfRegisters { function: sym("f") }
        );
    }
}

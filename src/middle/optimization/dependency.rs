//! Finds the variables no externally visible effect depends on.
//!
//! A variable *depends* when its value can reach a call argument, a return
//! value or an inline assembly input. A variable is *deref-depends* when
//! memory reachable through it can be observed outside the function, which
//! makes every store through it an effect of its own. Both sets are grown
//! backwards to a fixpoint.
//!
//! Conditions are handled positionally: an `If` depends when any line
//! between it and its target could have an effect, or jumps somewhere
//! outside that span. For backward jumps the span runs from the target to
//! the jump. This ignores which of those lines are actually reachable
//! through the branch.

use hashbrown::HashSet;
use log::debug;

use crate::{
    frontend::intern::{Symbol, SymbolTable},
    middle::ir::{Function, Line, Operand},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyReport {
    pub depends: HashSet<Symbol>,
    pub deref_depends: HashSet<Symbol>,
    /// Declared variables outside `depends`, in order of declaration
    pub nodepends: Vec<Symbol>,
}

#[derive(Debug, Default)]
struct Analysis {
    depends: HashSet<Symbol>,
    deref_depends: HashSet<Symbol>,
    /// Variables that can hold an address
    indexable: HashSet<Symbol>,
    changed: bool,
}

impl Analysis {
    fn depend(&mut self, name: Symbol) {
        if self.depends.insert(name) {
            self.changed = true;
        }

        if self.indexable.contains(&name) {
            self.deref_depend(name);
        }
    }

    fn deref_depend(&mut self, name: Symbol) {
        if self.deref_depends.insert(name) {
            self.changed = true;
        }
        if self.depends.insert(name) {
            self.changed = true;
        }
    }

    fn depend_on(&mut self, operand: Operand) {
        if let Operand::Variable(name) = operand {
            self.depend(name);
        }
    }

    /// Whether executing `line` can be observed from outside
    fn has_effect(&self, line: &Line) -> bool {
        match line {
            Line::Store { array, .. } => self.deref_depends.contains(array),
            line if line.has_external_effect() => true,
            line => line.writes().iter().any(|name| self.depends.contains(name)),
        }
    }
}

pub fn analyze_dependencies(function: &Function) -> DependencyReport {
    let mut analysis = Analysis {
        indexable: function
            .arguments
            .iter()
            .map(|a| (a.name, &a.ty))
            .chain(function.lines.iter().filter_map(|line| match line {
                Line::Declare { name, ty } => Some((*name, ty)),
                _ => None,
            }))
            .filter(|(_, ty)| ty.is_indexable())
            .map(|(name, _)| name)
            .collect(),
        ..Default::default()
    };

    // Memory behind reference parameters belongs to the caller
    for argument in &function.arguments {
        if argument.ty.is_indexable() {
            analysis.deref_depend(argument.name);
        }
    }

    for line in &function.lines {
        match line {
            Line::Call { args, .. } => args.iter().for_each(|a| analysis.depend_on(*a)),
            Line::Return { value: Some(value) } => analysis.depend_on(*value),
            Line::InlineAsm { inputs, .. } => {
                inputs.iter().for_each(|b| analysis.depend(b.variable));
            }
            _ => {}
        }
    }

    let labels: SymbolTable<usize> = function
        .lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| match line {
            Line::Label { name } => Some((*name, index)),
            _ => None,
        })
        .collect();

    let mut rounds = 0;
    loop {
        analysis.changed = false;
        rounds += 1;

        for (index, line) in function.lines.iter().enumerate() {
            match line {
                Line::Assign {
                    var,
                    value: Operand::Variable(value),
                    ..
                } => {
                    if analysis.depends.contains(var) {
                        analysis.depend(*value);
                    }
                    // Copies of an address alias the same memory
                    if analysis.deref_depends.contains(var) {
                        analysis.deref_depend(*value);
                    }
                    if analysis.deref_depends.contains(value)
                        && analysis.indexable.contains(var)
                    {
                        analysis.deref_depend(*var);
                    }
                }
                Line::Math { dest, lhs, rhs, .. } => {
                    if analysis.depends.contains(dest) {
                        analysis.depend_on(*lhs);
                        if let Some(rhs) = rhs {
                            analysis.depend_on(*rhs);
                        }
                    }
                }
                Line::Store {
                    array,
                    index: offset,
                    value,
                } => {
                    if analysis.deref_depends.contains(array) {
                        analysis.depend_on(*offset);
                        analysis.depend_on(*value);
                    }
                }
                Line::If {
                    condition, label, ..
                } => {
                    if analysis.depends.contains(condition) {
                        continue;
                    }

                    let Some(&target) = labels.get(label) else {
                        continue;
                    };

                    let (start, end) = if target > index {
                        (index + 1, target)
                    } else {
                        (target, index)
                    };

                    // A jump out of the span decides which lines run next
                    let escapes = |l: &Line| {
                        l.jump_target()
                            .and_then(|t| labels.get(&t))
                            .is_none_or(|&position| position < start || position > end)
                    };

                    if function.lines[start..end]
                        .iter()
                        .any(|l| analysis.has_effect(l) || (l.is_jump() && escapes(l)))
                    {
                        analysis.depend(*condition);
                    }
                }
                _ => {}
            }
        }

        if !analysis.changed {
            break;
        }
    }

    let mut seen = HashSet::new();
    let nodepends = function
        .lines
        .iter()
        .filter_map(|line| match line {
            Line::Declare { name, .. } if !analysis.depends.contains(name) => Some(*name),
            _ => None,
        })
        .filter(|name| seen.insert(*name))
        .collect();

    debug!(
        "dependencies of `{}` settled after {rounds} round(s)",
        function.name
    );

    DependencyReport {
        depends: analysis.depends,
        deref_depends: analysis.deref_depends,
        nodepends,
    }
}

/// Deletes writes to variables in `nodepends`. Calls stay, only their
/// result is dropped.
pub fn eliminate_nodepends(function: &mut Function) -> bool {
    let report = analyze_dependencies(function);
    if report.nodepends.is_empty() {
        return false;
    }

    let dead: HashSet<Symbol> = report.nodepends.into_iter().collect();
    let before = function.lines.len();
    let mut changed = false;

    function.lines.retain_mut(|line| match line {
        Line::Assign { var, .. } | Line::Math { dest: var, .. } => !dead.contains(var),
        Line::Call { result, .. } => {
            if result.is_some_and(|r| dead.contains(&r)) {
                *result = None;
                changed = true;
            }
            true
        }
        _ => true,
    });

    changed || function.lines.len() != before
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::frontend::{SourceFile, parser::Parser};
    use crate::middle::ir::builder::build_module;

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

    #[test]
    fn unused_computation_is_reported() {
        let function = build(indoc! {"
            func f(long a) -> long
                long wasted = a * 3
                long kept = a + 1
                return kept
            end
        "});

        let report = analyze_dependencies(&function);
        assert_eq!(report.nodepends, vec![sym("wasted")]);
        assert!(report.depends.contains(&sym("a")));
        assert!(report.depends.contains(&sym("kept")));
    }

    #[test]
    fn stores_through_parameters_are_effects() {
        let function = build(indoc! {"
            func f(long[] out, long a)
                long local = a << 1
                long scratch = a
                out[0] = local
            end
        "});

        let report = analyze_dependencies(&function);
        assert!(report.deref_depends.contains(&sym("out")));
        assert_eq!(report.nodepends, vec![sym("scratch")]);
    }

    #[test]
    fn conditions_guarding_effects_depend() {
        let function = build(indoc! {"
            func f(long a) -> long
                long flag = a & 1
                long other = a & 2
                if flag
                    g(a)
                end
                if other
                    long unused = 1
                end
                return 0
            end

            extern func g(long a)
        "});

        let report = analyze_dependencies(&function);
        assert!(report.depends.contains(&sym("flag")));
        assert!(report.nodepends.contains(&sym("other")));
        assert!(report.nodepends.contains(&sym("unused")));
    }

    #[test]
    fn breaking_out_of_a_loop_depends_on_its_condition() {
        let mut function = build(indoc! {"
            func f(long n) -> long
                long s = 0
                long i = 0
                long j = 0
                while i < n
                    j = 0
                    while j < n
                        if j == 3
                            break
                        end
                        s += j
                        j += 1
                    end
                    i += 1
                end
                return s
            end
        "});

        let report = analyze_dependencies(&function);
        assert_eq!(report.nodepends, vec![]);

        let lines = function.lines.clone();
        assert!(!eliminate_nodepends(&mut function));
        assert_eq!(function.lines, lines);
    }

    #[test]
    fn elimination_keeps_calls() {
        let mut function = build(indoc! {"
            func f(long a) -> long
                long ignored = g(a)
                long wasted = a * 3
                return a
            end

            extern func g(long a) -> long
        "});

        assert!(eliminate_nodepends(&mut function));
        assert!(function.lines.contains(&Line::Call {
            result: None,
            function: sym("g"),
            args: vec![Operand::Variable(sym("a"))],
        }));
        assert!(!function.lines.iter().any(|line| line.writes_variable(sym("wasted"))));
    }
}

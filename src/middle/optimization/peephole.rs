//! Local rewrites on the flat IR. Each rule looks at a short window of
//! lines starting at one index and either rewrites it or leaves everything
//! alone. After a rule fires, the same index is examined again from the
//! first rule.

use log::trace;

use crate::{
    frontend::intern::{Symbol, SymbolTable},
    middle::{
        ir::{Function, Line, MathOp, Operand},
        optimization::{OptimizationKind, OptimizerFlags},
        ty::Type,
    },
};

/// Known values of variables assigned a literal exactly once
type Constants = SymbolTable<i64>;

type Rule = fn(&mut Function, usize, &Constants) -> bool;

const RULES: &[(OptimizationKind, Rule)] = &[
    (OptimizationKind::UnusedAssign, remove_unused_assign),
    (OptimizationKind::ConstIf, fold_constant_if),
    (OptimizationKind::ConstFold, fold_constants),
    (OptimizationKind::NoopMath, remove_noop_math),
    (OptimizationKind::FastDiv, reduce_strength),
    (OptimizationKind::VarSubstitute, substitute_variable),
    (OptimizationKind::InvertIf, fold_inverted_if),
    (OptimizationKind::SelfInvert, fold_self_inversion),
    (OptimizationKind::SubstituteTempIf, substitute_temporary_condition),
];

/// One pass over the function. Returns whether any rule fired.
pub fn optimize_lines(function: &mut Function, flags: OptimizerFlags) -> bool {
    let rules: Vec<_> = RULES
        .iter()
        .filter(|(kind, _)| flags.contains(*kind))
        .collect();

    if rules.is_empty() {
        return false;
    }

    let mut constants = collect_constants(function);
    let mut changed = false;
    let mut index = 0;

    while index < function.lines.len() {
        match rules
            .iter()
            .find(|(_, rule)| rule(function, index, &constants))
        {
            Some((kind, _)) => {
                trace!("{kind} fired at line {index} of `{}`", function.name);
                changed = true;
                constants = collect_constants(function);
            }
            None => index += 1,
        }
    }

    changed
}

fn collect_constants(function: &mut Function) -> Constants {
    function.mark_constants();

    function
        .lines
        .iter()
        .filter_map(|line| match line {
            Line::Assign {
                var,
                value: Operand::Literal(value),
                is_const: true,
            } => Some((*var, *value)),
            _ => None,
        })
        .collect()
}

/// Whether the value written to `variable` at `index` can never be read.
/// Any jump ends the scan, since the value may be read at its target.
fn is_dead_after(lines: &[Line], index: usize, variable: Symbol) -> bool {
    for line in &lines[index + 1..] {
        if line.reads_variable(variable) {
            return false;
        }

        match line {
            Line::Goto { .. } | Line::If { .. } => return false,
            Line::Return { .. } => return true,
            Line::Destroy { name } if *name == variable => return true,
            _ => {}
        }

        if line.writes_variable(variable) {
            return true;
        }
    }

    true
}

fn remove_unused_assign(function: &mut Function, index: usize, _: &Constants) -> bool {
    let written = match &function.lines[index] {
        Line::Declare { name, .. } => {
            let name = *name;
            let used = function
                .lines
                .iter()
                .any(|line| !line.is_bookkeeping() && line.mentions(name));

            if used {
                return false;
            }

            function
                .lines
                .retain(|line| !(line.is_bookkeeping() && line.mentions(name)));
            return true;
        }
        Line::Assign { var, .. } | Line::Math { dest: var, .. } => *var,
        Line::Call {
            result: Some(var), ..
        } => *var,
        _ => return false,
    };

    if !is_dead_after(&function.lines, index, written) {
        return false;
    }

    match &mut function.lines[index] {
        // The call itself still has to happen
        Line::Call { result, .. } => *result = None,
        _ => {
            function.lines.remove(index);
        }
    }

    true
}

fn fold_constant_if(function: &mut Function, index: usize, constants: &Constants) -> bool {
    let Line::If {
        condition,
        label,
        invert,
    } = function.lines[index]
    else {
        return false;
    };

    let Some(&value) = constants.get(&condition) else {
        return false;
    };

    if (value != 0) != invert {
        function.lines[index] = Line::Goto { label };
    } else {
        function.lines.remove(index);
    }

    true
}

/// Propagates constants into operands and evaluates math on literals
fn fold_constants(function: &mut Function, index: usize, constants: &Constants) -> bool {
    let substitute = |operand: &mut Operand| match *operand {
        Operand::Variable(name) => match constants.get(&name) {
            Some(&value) => {
                *operand = Operand::Literal(value);
                true
            }
            None => false,
        },
        Operand::Literal(_) => false,
    };

    let mut changed = false;

    match &mut function.lines[index] {
        Line::Assign { value, .. } => changed |= substitute(value),
        // The base of a load keeps its name, its type gives the width
        Line::Math {
            op: MathOp::LoadAt,
            rhs: Some(rhs),
            ..
        } => changed |= substitute(rhs),
        Line::Math { lhs, rhs, .. } => {
            changed |= substitute(lhs);
            if let Some(rhs) = rhs {
                changed |= substitute(rhs);
            }
        }
        Line::Call { args, .. } => {
            for arg in args {
                changed |= substitute(arg);
            }
        }
        Line::Return { value: Some(value) } => changed |= substitute(value),
        Line::Store { index, value, .. } => {
            changed |= substitute(index);
            changed |= substitute(value);
        }
        _ => {}
    }

    if let Line::Math {
        op,
        dest,
        lhs: Operand::Literal(lhs),
        rhs,
    } = function.lines[index]
    {
        let rhs = match rhs {
            None => None,
            Some(Operand::Literal(rhs)) => Some(rhs),
            Some(Operand::Variable(_)) => return changed,
        };

        if let Some(result) = op.evaluate(lhs, rhs) {
            function.lines[index] = Line::Assign {
                var: dest,
                value: Operand::Literal(result),
                is_const: false,
            };
            changed = true;
        }
    }

    changed
}

fn remove_noop_math(function: &mut Function, index: usize, _: &Constants) -> bool {
    use Operand::Literal;

    let (dest, result) = match function.lines[index] {
        Line::Assign {
            var,
            value: Operand::Variable(value),
            ..
        } if var == value => {
            function.lines.remove(index);
            return true;
        }
        Line::Math {
            op,
            dest,
            lhs,
            rhs: Some(rhs),
        } => {
            let result = match (op, lhs, rhs) {
                (
                    MathOp::Add
                    | MathOp::Sub
                    | MathOp::Or
                    | MathOp::Xor
                    | MathOp::LeftShift
                    | MathOp::RightShift,
                    x,
                    Literal(0),
                ) => x,
                (MathOp::Mul | MathOp::Div, x, Literal(1)) => x,
                (MathOp::Mul | MathOp::And, _, Literal(0)) | (MathOp::Rem, _, Literal(1)) => {
                    Literal(0)
                }
                (MathOp::Add | MathOp::Or | MathOp::Xor, Literal(0), x) => x,
                (MathOp::Mul, Literal(1), x) => x,
                (MathOp::Mul | MathOp::And, Literal(0), _) => Literal(0),
                _ => return false,
            };

            (dest, result)
        }
        _ => return false,
    };

    function.lines[index] = Line::Assign {
        var: dest,
        value: result,
        is_const: false,
    };
    true
}

/// Multiplication, division and remainder by a power of two. Division
/// truncates toward zero, so negative dividends are biased by `divisor - 1`
/// before shifting.
fn reduce_strength(function: &mut Function, index: usize, _: &Constants) -> bool {
    let Line::Math {
        op: op @ (MathOp::Mul | MathOp::Div | MathOp::Rem),
        dest,
        lhs: Operand::Variable(value),
        rhs: Some(Operand::Literal(divisor)),
    } = function.lines[index]
    else {
        return false;
    };

    if divisor < 2 || divisor.count_ones() != 1 {
        return false;
    }

    let shift = i64::from(divisor.trailing_zeros());
    let mask = divisor - 1;

    if op == MathOp::Mul {
        function.lines[index] = Line::Math {
            op: MathOp::LeftShift,
            dest,
            lhs: Operand::Variable(value),
            rhs: Some(Operand::Literal(shift)),
        };
        return true;
    }

    // bias = value < 0 ? divisor - 1 : 0
    let bias = function.new_temporary();
    let mut lines = vec![
        Line::Declare {
            name: bias,
            ty: Type::LONG,
        },
        Line::Math {
            op: MathOp::RightShift,
            dest: bias,
            lhs: Operand::Variable(value),
            rhs: Some(Operand::Literal(63)),
        },
        Line::Math {
            op: MathOp::And,
            dest: bias,
            lhs: Operand::Variable(bias),
            rhs: Some(Operand::Literal(mask)),
        },
    ];

    if op == MathOp::Div {
        lines.extend([
            Line::Math {
                op: MathOp::Add,
                dest: bias,
                lhs: Operand::Variable(value),
                rhs: Some(Operand::Variable(bias)),
            },
            Line::Math {
                op: MathOp::RightShift,
                dest,
                lhs: Operand::Variable(bias),
                rhs: Some(Operand::Literal(shift)),
            },
            Line::Destroy { name: bias },
        ]);
    } else {
        // ((value + bias) & mask) - bias
        let rounded = function.new_temporary();
        lines.extend([
            Line::Declare {
                name: rounded,
                ty: Type::LONG,
            },
            Line::Math {
                op: MathOp::Add,
                dest: rounded,
                lhs: Operand::Variable(value),
                rhs: Some(Operand::Variable(bias)),
            },
            Line::Math {
                op: MathOp::And,
                dest: rounded,
                lhs: Operand::Variable(rounded),
                rhs: Some(Operand::Literal(mask)),
            },
            Line::Math {
                op: MathOp::Sub,
                dest,
                lhs: Operand::Variable(rounded),
                rhs: Some(Operand::Variable(bias)),
            },
            Line::Destroy { name: rounded },
            Line::Destroy { name: bias },
        ]);
    }

    function.lines.splice(index..=index, lines);
    true
}

/// `declare x; x = y; destroy y` hands `y` over to `x`, so `y` can be used
/// in its place until `x` is destroyed
fn substitute_variable(function: &mut Function, index: usize, _: &Constants) -> bool {
    let lines = &function.lines;

    let (
        Some(Line::Declare { name: copy, ty }),
        Some(Line::Assign {
            var,
            value: Operand::Variable(source),
            ..
        }),
        Some(Line::Destroy { name: destroyed }),
    ) = (lines.get(index), lines.get(index + 1), lines.get(index + 2))
    else {
        return false;
    };

    let (copy, source) = (*copy, *source);

    if *var != copy || *destroyed != source || copy == source {
        return false;
    }

    if function.variable_type_at(source, index) != Some(ty) {
        return false;
    }

    let Some(end) = lines[index + 3..]
        .iter()
        .position(|line| matches!(line, Line::Destroy { name } if *name == copy))
        .map(|position| position + index + 3)
    else {
        return false;
    };

    if lines[index + 3..=end].iter().any(|line| line.mentions(source)) {
        return false;
    }

    for line in &mut function.lines[index + 3..=end] {
        line.rename(copy, source);
    }
    function.lines.drain(index..index + 3);

    true
}

/// `x = inv y; [destroy y]; if x; destroy x` tests `y` with the opposite
/// polarity instead
fn fold_inverted_if(function: &mut Function, index: usize, _: &Constants) -> bool {
    let lines = &function.lines;

    let Some(&Line::Math {
        op: MathOp::Inv,
        dest: inverted,
        lhs: Operand::Variable(source),
        rhs: None,
    }) = lines.get(index)
    else {
        return false;
    };

    if inverted == source {
        return false;
    }

    let destroys_source =
        matches!(lines.get(index + 1), Some(Line::Destroy { name }) if *name == source);
    let jump = index + 1 + usize::from(destroys_source);

    let Some(&Line::If {
        condition,
        label,
        invert,
    }) = lines.get(jump)
    else {
        return false;
    };

    if condition != inverted
        || !matches!(lines.get(jump + 1), Some(Line::Destroy { name }) if *name == inverted)
    {
        return false;
    }

    let mut replacement = vec![
        Line::If {
            condition: source,
            label,
            invert: !invert,
        },
        Line::Destroy { name: inverted },
    ];
    if destroys_source {
        replacement.push(Line::Destroy { name: source });
    }

    function.lines.splice(index..=jump + 1, replacement);
    true
}

/// `x = inv x; if x; destroy x` flips the test instead
fn fold_self_inversion(function: &mut Function, index: usize, _: &Constants) -> bool {
    let lines = &function.lines;

    let Some(&Line::Math {
        op: MathOp::Inv,
        dest,
        lhs: Operand::Variable(source),
        rhs: None,
    }) = lines.get(index)
    else {
        return false;
    };

    let guarded = dest == source
        && matches!(lines.get(index + 1), Some(Line::If { condition, .. }) if *condition == dest)
        && matches!(lines.get(index + 2), Some(Line::Destroy { name }) if *name == dest);

    if !guarded {
        return false;
    }

    if let Some(Line::If { invert, .. }) = function.lines.get_mut(index + 1) {
        *invert = !*invert;
    }
    function.lines.remove(index);
    true
}

/// `declare t; t = v; if t; destroy t` tests `v` directly
fn substitute_temporary_condition(function: &mut Function, index: usize, _: &Constants) -> bool {
    let lines = &function.lines;

    let (
        Some(&Line::Declare { name: temporary, .. }),
        Some(&Line::Assign {
            var,
            value: Operand::Variable(value),
            ..
        }),
        Some(&Line::If {
            condition,
            label,
            invert,
        }),
        Some(&Line::Destroy { name: destroyed }),
    ) = (
        lines.get(index),
        lines.get(index + 1),
        lines.get(index + 2),
        lines.get(index + 3),
    )
    else {
        return false;
    };

    if var != temporary || condition != temporary || destroyed != temporary || value == temporary
    {
        return false;
    }

    function.lines.splice(
        index..index + 4,
        [Line::If {
            condition: value,
            label,
            invert,
        }],
    );
    true
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::middle::ir::{Argument, FunctionSignature};

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    fn var(name: &str) -> Operand {
        Operand::Variable(sym(name))
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

    fn only(kind: OptimizationKind) -> OptimizerFlags {
        OptimizerFlags::none().with(kind)
    }

    /// Repeats the pass until it settles
    fn run(function: &mut Function, flags: OptimizerFlags) -> bool {
        let changed = optimize_lines(function, flags);
        while optimize_lines(function, flags) {}
        changed
    }

    fn math(op: MathOp, dest: &str, lhs: Operand, rhs: Option<Operand>) -> Line {
        Line::Math {
            op,
            dest: sym(dest),
            lhs,
            rhs,
        }
    }

    /// Straight-line evaluation of arithmetic IR
    fn evaluate(function: &Function, inputs: &[(&str, i64)]) -> SymbolTable<i64> {
        let mut values: SymbolTable<i64> = inputs.iter().map(|&(n, v)| (sym(n), v)).collect();
        let read = |values: &SymbolTable<i64>, operand: Operand| match operand {
            Operand::Literal(value) => value,
            Operand::Variable(name) => values[&name],
        };

        for line in &function.lines {
            match *line {
                Line::Assign { var, value, .. } => {
                    let value = read(&values, value);
                    values.insert(var, value);
                }
                Line::Math { op, dest, lhs, rhs } => {
                    let lhs = read(&values, lhs);
                    let rhs = rhs.map(|rhs| read(&values, rhs));
                    values.insert(dest, op.evaluate(lhs, rhs).unwrap());
                }
                _ => {}
            }
        }

        values
    }

    #[test]
    fn dead_writes_are_removed() {
        let mut f = function(
            &["a"],
            vec![
                Line::Declare {
                    name: sym("x"),
                    ty: Type::LONG,
                },
                Line::Assign {
                    var: sym("x"),
                    value: var("a"),
                    is_const: false,
                },
                Line::Call {
                    result: Some(sym("x")),
                    function: sym("g"),
                    args: vec![],
                },
                Line::Return { value: None },
                Line::Destroy { name: sym("x") },
            ],
        );

        assert!(run(&mut f, only(OptimizationKind::UnusedAssign)));
        assert_eq!(
            f.lines,
            vec![
                Line::Call {
                    result: None,
                    function: sym("g"),
                    args: vec![],
                },
                Line::Return { value: None },
            ]
        );
    }

    #[test]
    fn writes_before_a_jump_are_kept() {
        let lines = vec![
            Line::Label { name: sym("_loop0") },
            Line::Math {
                op: MathOp::Add,
                dest: sym("a"),
                lhs: var("a"),
                rhs: Some(Operand::Literal(1)),
            },
            Line::Goto {
                label: sym("_loop0"),
            },
        ];
        let mut f = function(&["a"], lines.clone());

        assert!(!optimize_lines(&mut f, only(OptimizationKind::UnusedAssign)));
        assert_eq!(f.lines, lines);
    }

    #[test]
    fn constant_conditions_fold() {
        let mut f = function(
            &[],
            vec![
                Line::Declare {
                    name: sym("c"),
                    ty: Type::LONG,
                },
                Line::Assign {
                    var: sym("c"),
                    value: Operand::Literal(0),
                    is_const: false,
                },
                Line::If {
                    condition: sym("c"),
                    label: sym("_else0"),
                    invert: true,
                },
                Line::If {
                    condition: sym("c"),
                    label: sym("_end1"),
                    invert: false,
                },
            ],
        );

        assert!(optimize_lines(&mut f, only(OptimizationKind::ConstIf)));
        assert_eq!(
            &f.lines[2..],
            &[Line::Goto {
                label: sym("_else0")
            }]
        );
    }

    #[test]
    fn literal_math_is_evaluated() {
        let mut f = function(
            &[],
            vec![
                Line::Assign {
                    var: sym("x"),
                    value: Operand::Literal(6),
                    is_const: false,
                },
                math(MathOp::Mul, "y", var("x"), Some(Operand::Literal(7))),
                Line::Return {
                    value: Some(var("y")),
                },
            ],
        );

        assert!(optimize_lines(&mut f, only(OptimizationKind::ConstFold)));
        assert_eq!(
            f.lines[2],
            Line::Return {
                value: Some(Operand::Literal(42))
            }
        );
    }

    #[test]
    fn noop_math_becomes_assign() {
        let mut f = function(
            &["a"],
            vec![
                math(MathOp::Add, "x", var("a"), Some(Operand::Literal(0))),
                math(MathOp::Mul, "y", var("a"), Some(Operand::Literal(0))),
                math(MathOp::Rem, "z", var("a"), Some(Operand::Literal(1))),
            ],
        );

        assert!(optimize_lines(&mut f, only(OptimizationKind::NoopMath)));
        assert_eq!(
            f.lines,
            vec![
                Line::Assign {
                    var: sym("x"),
                    value: var("a"),
                    is_const: false
                },
                Line::Assign {
                    var: sym("y"),
                    value: Operand::Literal(0),
                    is_const: true
                },
                Line::Assign {
                    var: sym("z"),
                    value: Operand::Literal(0),
                    is_const: true
                },
            ]
        );
    }

    #[test]
    fn division_becomes_shifts() {
        let mut f = function(
            &["y"],
            vec![math(MathOp::Div, "x", var("y"), Some(Operand::Literal(4)))],
        );

        assert!(optimize_lines(&mut f, only(OptimizationKind::FastDiv)));
        assert!(!f.lines.iter().any(|line| matches!(
            line,
            Line::Math {
                op: MathOp::Div,
                ..
            }
        )));
        assert!(f.lines.contains(&math(
            MathOp::RightShift,
            "x",
            var("$t0"),
            Some(Operand::Literal(2))
        )));
    }

    #[test]
    fn inverted_condition_folds_into_if() {
        let mut f = function(
            &["a"],
            vec![
                Line::Declare {
                    name: sym("$t0"),
                    ty: Type::LONG,
                },
                math(MathOp::Sub, "$t0", var("a"), Some(Operand::Literal(3))),
                Line::Declare {
                    name: sym("$t1"),
                    ty: Type::LONG,
                },
                math(MathOp::Inv, "$t1", var("$t0"), None),
                Line::Destroy { name: sym("$t0") },
                Line::If {
                    condition: sym("$t1"),
                    label: sym("_else0"),
                    invert: true,
                },
                Line::Destroy { name: sym("$t1") },
            ],
        );

        let flags = only(OptimizationKind::InvertIf).with(OptimizationKind::UnusedAssign);
        assert!(run(&mut f, flags));
        assert_eq!(
            f.lines,
            vec![
                Line::Declare {
                    name: sym("$t0"),
                    ty: Type::LONG,
                },
                math(MathOp::Sub, "$t0", var("a"), Some(Operand::Literal(3))),
                Line::If {
                    condition: sym("$t0"),
                    label: sym("_else0"),
                    invert: false,
                },
                Line::Destroy { name: sym("$t0") },
            ]
        );
    }

    #[test]
    fn copies_are_substituted() {
        let mut f = function(
            &["a"],
            vec![
                Line::Declare {
                    name: sym("$t0"),
                    ty: Type::LONG,
                },
                math(MathOp::Add, "$t0", var("a"), Some(Operand::Literal(1))),
                Line::Declare {
                    name: sym("x"),
                    ty: Type::LONG,
                },
                Line::Assign {
                    var: sym("x"),
                    value: var("$t0"),
                    is_const: false,
                },
                Line::Destroy { name: sym("$t0") },
                Line::Return {
                    value: Some(var("x")),
                },
                Line::Destroy { name: sym("x") },
            ],
        );

        assert!(optimize_lines(&mut f, only(OptimizationKind::VarSubstitute)));
        assert_eq!(
            &f.lines[2..],
            &[
                Line::Return {
                    value: Some(var("$t0"))
                },
                Line::Destroy { name: sym("$t0") },
            ]
        );
    }

    #[test]
    fn temporary_conditions_are_tested_directly() {
        let mut f = function(
            &["a"],
            vec![
                Line::Declare {
                    name: sym("$t0"),
                    ty: Type::LONG,
                },
                Line::Assign {
                    var: sym("$t0"),
                    value: var("a"),
                    is_const: false,
                },
                Line::If {
                    condition: sym("$t0"),
                    label: sym("_end0"),
                    invert: true,
                },
                Line::Destroy { name: sym("$t0") },
            ],
        );

        assert!(optimize_lines(
            &mut f,
            only(OptimizationKind::SubstituteTempIf)
        ));
        assert_eq!(
            f.lines,
            vec![Line::If {
                condition: sym("a"),
                label: sym("_end0"),
                invert: true,
            }]
        );
    }

    proptest! {
        #[test]
        fn strength_reduction_is_exact(value in any::<i64>(), shift in 1u32..63) {
            let divisor = 1i64 << shift;
            let mut f = function(
                &["v"],
                vec![
                    math(MathOp::Div, "q", var("v"), Some(Operand::Literal(divisor))),
                    math(MathOp::Rem, "r", var("v"), Some(Operand::Literal(divisor))),
                    math(MathOp::Mul, "m", var("v"), Some(Operand::Literal(divisor))),
                ],
            );

            prop_assert!(optimize_lines(&mut f, only(OptimizationKind::FastDiv)));
            prop_assert!(!f.lines.iter().any(|line| matches!(
                line,
                Line::Math { op: MathOp::Div | MathOp::Rem | MathOp::Mul, .. }
            )), "FastDiv left a div, rem or mul behind");

            let values = evaluate(&f, &[("v", value)]);
            prop_assert_eq!(values[&sym("q")], value / divisor);
            prop_assert_eq!(values[&sym("r")], value % divisor);
            prop_assert_eq!(values[&sym("m")], value.wrapping_mul(divisor));
        }
    }
}

use colored::Colorize;
use itertools::Itertools;

use crate::middle::ir::{Function, Line, Operand};

/// Renders a function as text, one line per IR line, labels outdented
pub fn pretty_print_ir(function: &Function) -> String {
    let mut out = format!(
        "{} {}{}{}",
        "func".magenta(),
        function.name.value().blue(),
        "(".white(),
        function
            .arguments
            .iter()
            .map(|arg| format!("{} {}", arg.ty.colored(), arg.name))
            .join(", ")
    );

    out.push_str(&")".white().to_string());
    if !function.return_type.is_void() {
        out.push_str(&format!(" -> {}", function.return_type.colored()));
    }
    out.push('\n');

    for line in &function.lines {
        match line {
            Line::Label { .. } => out.push_str(&format!("{line}\n")),
            _ => out.push_str(&format!("    {line}\n")),
        }
    }

    out.push_str(&"end".magenta().to_string());
    out.push('\n');
    out
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Variable(name) => write!(f, "{name}"),
            Operand::Literal(value) => write!(f, "{}", value.to_string().purple()),
        }
    }
}

impl core::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Line::Assign {
                var,
                value,
                is_const,
            } => {
                write!(f, "{var} {} {value}", "=".white())?;
                if *is_const {
                    write!(f, " {}", "const".dimmed())?;
                }
                Ok(())
            }
            Line::Declare { name, ty } => {
                write!(f, "{} {} {name}", "declare".cyan(), ty.colored())
            }
            Line::Destroy { name } => write!(f, "{} {name}", "destroy".cyan()),
            Line::Call {
                result,
                function,
                args,
            } => {
                if let Some(result) = result {
                    write!(f, "{result} {} ", "=".white())?;
                }
                write!(
                    f,
                    "{} {}({})",
                    "call".cyan(),
                    function.value().blue(),
                    args.iter().join(", ")
                )
            }
            Line::Goto { label } => write!(f, "{} {}", "goto".cyan(), label.value().bright_red()),
            Line::If {
                condition,
                label,
                invert,
            } => write!(
                f,
                "{} {}{condition} {} {}",
                "if".cyan(),
                if *invert { "!" } else { "" },
                "goto".cyan(),
                label.value().bright_red()
            ),
            Line::Label { name } => write!(f, "{}", format!("{name}:").bright_red()),
            Line::Math {
                op,
                dest,
                lhs,
                rhs: Some(rhs),
            } => write!(
                f,
                "{dest} {} {} {lhs}, {rhs}",
                "=".white(),
                op.to_string().cyan()
            ),
            Line::Math {
                op,
                dest,
                lhs,
                rhs: None,
            } => write!(f, "{dest} {} {} {lhs}", "=".white(), op.to_string().cyan()),
            Line::Return { value: Some(value) } => write!(f, "{} {value}", "return".cyan()),
            Line::Return { value: None } => write!(f, "{}", "return".cyan()),
            Line::Store {
                array,
                index,
                value,
            } => write!(f, "{array}[{index}] {} {value}", "=".white()),
            Line::InlineAsm {
                inputs,
                outputs,
                items,
            } => write!(
                f,
                "{} [{}] -> [{}] \"{}\"",
                "asm".cyan(),
                inputs
                    .iter()
                    .map(|b| format!("{}:{}", b.variable, b.register))
                    .join(", "),
                outputs
                    .iter()
                    .map(|b| format!("{}:{}", b.variable, b.register))
                    .join(", "),
                items.iter().join("; ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frontend::intern::Symbol,
        middle::{
            ir::{Argument, FunctionSignature, MathOp},
            ty::Type,
        },
    };

    #[test]
    fn prints_lines() {
        let mut function = Function::new(FunctionSignature {
            name: Symbol::new("f"),
            arguments: vec![Argument {
                name: Symbol::new("a"),
                ty: Type::LONG,
            }],
            return_type: Type::LONG,
        });
        function.lines = vec![
            Line::Label {
                name: Symbol::new("_loop0"),
            },
            Line::Math {
                op: MathOp::LeftShift,
                dest: Symbol::new("a"),
                lhs: Operand::Variable(Symbol::new("a")),
                rhs: Some(Operand::Literal(2)),
            },
            Line::If {
                condition: Symbol::new("a"),
                label: Symbol::new("_loop0"),
                invert: true,
            },
            Line::Return {
                value: Some(Operand::Variable(Symbol::new("a"))),
            },
        ];

        let text = strip_ansi_escapes::strip_str(pretty_print_ir(&function));

        assert_eq!(
            text,
            "func f(long a) -> long\n_loop0:\n    a = shl a, 2\n    if !a goto _loop0\n    return a\nend\n"
        );
    }
}

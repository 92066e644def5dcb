//! The IR: a flat list of lines per function. Loops and conditionals are
//! already labels and jumps, and every expression is broken down into one
//! operation per line on named variables and temporaries.

use hashbrown::HashSet;

use crate::{
    backend::{
        assembler::AsmItem,
        isa::{BinaryOperator, Register, UnaryOperator},
    },
    frontend::intern::{Symbol, SymbolTable},
    middle::ty::{Type, TypeRegistry},
};

pub mod builder;
pub mod expr;
pub mod pretty_print;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Variable(Symbol),
    Literal(i64),
}

impl Operand {
    pub fn variable(self) -> Option<Symbol> {
        match self {
            Operand::Variable(name) => Some(name),
            Operand::Literal(_) => None,
        }
    }

    pub fn literal(self) -> Option<i64> {
        match self {
            Operand::Literal(value) => Some(value),
            Operand::Variable(_) => None,
        }
    }

    pub fn is_variable(self, name: Symbol) -> bool {
        self == Operand::Variable(name)
    }

    fn rename(&mut self, from: Symbol, to: Symbol) {
        if self.is_variable(from) {
            *self = Operand::Variable(to);
        }
    }
}

impl From<Symbol> for Operand {
    fn from(name: Symbol) -> Self {
        Operand::Variable(name)
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Literal(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    #[strum(serialize = "shl")]
    LeftShift,
    #[strum(serialize = "shr")]
    RightShift,
    And,
    Or,
    Xor,
    /// Bitwise complement
    Not,
    /// Logical not
    Inv,
    #[strum(serialize = "lt")]
    Less,
    #[strum(serialize = "le")]
    LessOrEqual,
    /// `dest = lhs[rhs]`
    #[strum(serialize = "loadat")]
    LoadAt,
}

impl MathOp {
    pub fn is_unary(self) -> bool {
        matches!(self, MathOp::Not | MathOp::Inv)
    }

    pub fn binary_operator(self) -> Option<BinaryOperator> {
        Some(match self {
            MathOp::Add => BinaryOperator::Add,
            MathOp::Sub => BinaryOperator::Sub,
            MathOp::Mul => BinaryOperator::Mul,
            MathOp::Div => BinaryOperator::Div,
            MathOp::Rem => BinaryOperator::Rem,
            MathOp::LeftShift => BinaryOperator::LeftShift,
            MathOp::RightShift => BinaryOperator::RightShift,
            MathOp::And => BinaryOperator::And,
            MathOp::Or => BinaryOperator::Or,
            MathOp::Xor => BinaryOperator::Xor,
            MathOp::Less => BinaryOperator::Less,
            MathOp::LessOrEqual => BinaryOperator::LessOrEqual,
            MathOp::Not | MathOp::Inv | MathOp::LoadAt => return None,
        })
    }

    pub fn unary_operator(self) -> Option<UnaryOperator> {
        match self {
            MathOp::Not => Some(UnaryOperator::Not),
            MathOp::Inv => Some(UnaryOperator::Inv),
            _ => None,
        }
    }

    /// Folds the operation on constants, the same way the machine computes
    /// it. `None` for memory reads and division by zero.
    pub fn evaluate(self, lhs: i64, rhs: Option<i64>) -> Option<i64> {
        if let Some(operator) = self.unary_operator() {
            return Some(operator.evaluate(lhs));
        }

        self.binary_operator()?.evaluate(lhs, rhs?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmBinding {
    pub variable: Symbol,
    pub register: Register,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Assign {
        var: Symbol,
        value: Operand,
        /// The variable is written exactly once, here
        is_const: bool,
    },
    Declare {
        name: Symbol,
        ty: Type,
    },
    Destroy {
        name: Symbol,
    },
    Call {
        result: Option<Symbol>,
        function: Symbol,
        args: Vec<Operand>,
    },
    Goto {
        label: Symbol,
    },
    /// Jumps when `condition != 0`, or when `condition == 0` if inverted
    If {
        condition: Symbol,
        label: Symbol,
        invert: bool,
    },
    Label {
        name: Symbol,
    },
    Math {
        op: MathOp,
        dest: Symbol,
        lhs: Operand,
        /// Absent for unary operations
        rhs: Option<Operand>,
    },
    Return {
        value: Option<Operand>,
    },
    /// `array[index] = value`
    Store {
        array: Symbol,
        index: Operand,
        value: Operand,
    },
    InlineAsm {
        inputs: Vec<AsmBinding>,
        outputs: Vec<AsmBinding>,
        items: Vec<AsmItem>,
    },
}

impl Line {
    /// Variables whose value this line reads
    pub fn reads(&self) -> Vec<Symbol> {
        match self {
            Line::Assign { value, .. } => value.variable().into_iter().collect(),
            Line::Call { args, .. } => args.iter().filter_map(|a| a.variable()).collect(),
            Line::If { condition, .. } => vec![*condition],
            Line::Math { lhs, rhs, .. } => lhs
                .variable()
                .into_iter()
                .chain(rhs.and_then(Operand::variable))
                .collect(),
            Line::Return { value } => value.and_then(Operand::variable).into_iter().collect(),
            Line::Store {
                array,
                index,
                value,
            } => [Some(*array), index.variable(), value.variable()]
                .into_iter()
                .flatten()
                .collect(),
            Line::InlineAsm { inputs, .. } => inputs.iter().map(|b| b.variable).collect(),
            Line::Declare { .. } | Line::Destroy { .. } | Line::Goto { .. } | Line::Label { .. } => {
                vec![]
            }
        }
    }

    /// Variables this line assigns a new value to
    pub fn writes(&self) -> Vec<Symbol> {
        match self {
            Line::Assign { var, .. } => vec![*var],
            Line::Call { result, .. } => result.iter().copied().collect(),
            Line::Math { dest, .. } => vec![*dest],
            Line::InlineAsm { outputs, .. } => outputs.iter().map(|b| b.variable).collect(),
            _ => vec![],
        }
    }

    pub fn reads_variable(&self, name: Symbol) -> bool {
        self.reads().contains(&name)
    }

    pub fn writes_variable(&self, name: Symbol) -> bool {
        self.writes().contains(&name)
    }

    /// Any reference at all, including declarations
    pub fn mentions(&self, name: Symbol) -> bool {
        match self {
            Line::Declare { name: declared, .. } | Line::Destroy { name: declared } => {
                *declared == name
            }
            other => other.reads_variable(name) || other.writes_variable(name),
        }
    }

    /// Renames every reference to a variable
    pub fn rename(&mut self, from: Symbol, to: Symbol) {
        let swap = |name: &mut Symbol| {
            if *name == from {
                *name = to;
            }
        };

        match self {
            Line::Assign { var, value, .. } => {
                swap(var);
                value.rename(from, to);
            }
            Line::Declare { name, .. } | Line::Destroy { name } => swap(name),
            Line::Call { result, args, .. } => {
                result.iter_mut().for_each(swap);
                args.iter_mut().for_each(|a| a.rename(from, to));
            }
            Line::If { condition, .. } => swap(condition),
            Line::Math { dest, lhs, rhs, .. } => {
                swap(dest);
                lhs.rename(from, to);
                rhs.iter_mut().for_each(|r| r.rename(from, to));
            }
            Line::Return { value } => value.iter_mut().for_each(|v| v.rename(from, to)),
            Line::Store {
                array,
                index,
                value,
            } => {
                swap(array);
                index.rename(from, to);
                value.rename(from, to);
            }
            Line::InlineAsm {
                inputs, outputs, ..
            } => inputs
                .iter_mut()
                .chain(outputs.iter_mut())
                .for_each(|b| swap(&mut b.variable)),
            Line::Goto { .. } | Line::Label { .. } => {}
        }
    }

    /// Replaces reads of a variable with another operand, leaving writes
    pub fn substitute_reads(&mut self, from: Symbol, to: Operand) {
        let replace = |operand: &mut Operand| {
            if operand.is_variable(from) {
                *operand = to;
            }
        };

        match self {
            Line::Assign { value, .. } => replace(value),
            Line::Call { args, .. } => args.iter_mut().for_each(replace),
            Line::Math { lhs, rhs, .. } => {
                replace(lhs);
                rhs.iter_mut().for_each(replace);
            }
            Line::Return { value } => value.iter_mut().for_each(replace),
            Line::Store { index, value, .. } => {
                replace(index);
                replace(value);
            }
            _ => {}
        }
    }

    /// The label a `Goto` or `If` jumps to
    pub fn jump_target(&self) -> Option<Symbol> {
        match self {
            Line::Goto { label } | Line::If { label, .. } => Some(*label),
            _ => None,
        }
    }

    pub fn is_jump(&self) -> bool {
        self.jump_target().is_some()
    }

    /// Control never falls through to the next line
    pub fn is_terminator(&self) -> bool {
        matches!(self, Line::Goto { .. } | Line::Return { .. })
    }

    fn declared_type(&self, name: Symbol) -> Option<&Type> {
        match self {
            Line::Declare { name: declared, ty } if *declared == name => Some(ty),
            _ => None,
        }
    }

    /// Declarations and destructions only bracket lifetimes and emit no code
    /// of their own
    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, Line::Declare { .. } | Line::Destroy { .. })
    }

    /// Lines whose effect is visible outside the function
    pub fn has_external_effect(&self) -> bool {
        matches!(
            self,
            Line::Call { .. } | Line::Store { .. } | Line::Return { .. } | Line::InlineAsm { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: Symbol,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: Symbol,
    pub arguments: Vec<Argument>,
    pub return_type: Type,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: Symbol,
    pub return_type: Type,
    pub arguments: Vec<Argument>,
    pub lines: Vec<Line>,
    pub next_temporary: u32,
    pub next_label: u32,
}

impl Function {
    pub fn new(signature: FunctionSignature) -> Self {
        Self {
            name: signature.name,
            return_type: signature.return_type,
            arguments: signature.arguments,
            lines: Vec::new(),
            next_temporary: 0,
            next_label: 0,
        }
    }

    pub fn signature(&self) -> FunctionSignature {
        FunctionSignature {
            name: self.name,
            arguments: self.arguments.clone(),
            return_type: self.return_type.clone(),
        }
    }

    pub fn new_temporary(&mut self) -> Symbol {
        let name = Symbol::new(&format!("$t{}", self.next_temporary));
        self.next_temporary += 1;
        name
    }

    /// A fresh label such as `_loop3`
    pub fn new_label(&mut self, prefix: &str) -> Symbol {
        let name = Symbol::new(&format!("_{prefix}{}", self.next_label));
        self.next_label += 1;
        name
    }

    pub fn push(&mut self, line: Line) {
        self.lines.push(line);
    }

    pub fn is_argument(&self, name: Symbol) -> bool {
        self.arguments.iter().any(|a| a.name == name)
    }

    /// The type `name` has at line `index`: its closest declaration above,
    /// or the argument it names. A name can be declared again once the
    /// previous declaration was destroyed, possibly with another type.
    pub fn variable_type_at(&self, name: Symbol, index: usize) -> Option<&Type> {
        self.lines[..index.min(self.lines.len())]
            .iter()
            .rev()
            .find_map(|line| line.declared_type(name))
            .or_else(|| {
                self.arguments
                    .iter()
                    .find(|a| a.name == name)
                    .map(|a| &a.ty)
            })
            // blocks can be laid out before the one declaring the variable
            .or_else(|| self.lines.iter().find_map(|line| line.declared_type(name)))
    }

    /// Every variable that is declared or passed in
    pub fn variables(&self) -> HashSet<Symbol> {
        self.arguments
            .iter()
            .map(|a| a.name)
            .chain(self.lines.iter().filter_map(|line| match line {
                Line::Declare { name, .. } => Some(*name),
                _ => None,
            }))
            .collect()
    }

    /// Recomputes which literal assignments are constants: the variable is
    /// written exactly once in the function and is not an argument
    pub fn mark_constants(&mut self) {
        let mut writes: HashSet<Symbol> = HashSet::new();
        let mut written_twice: HashSet<Symbol> = HashSet::new();

        for line in &self.lines {
            for var in line.writes() {
                if !writes.insert(var) {
                    written_twice.insert(var);
                }
            }
        }

        let arguments: HashSet<Symbol> = self.arguments.iter().map(|a| a.name).collect();

        for line in &mut self.lines {
            if let Line::Assign {
                var,
                value,
                is_const,
            } = line
            {
                *is_const = matches!(value, Operand::Literal(_))
                    && !written_twice.contains(var)
                    && !arguments.contains(var);
            }
        }
    }
}

/// Everything the builder needs to know about the rest of the module
#[derive(Debug, Clone, Default)]
pub struct CompilationContext {
    pub functions: SymbolTable<FunctionSignature>,
    pub types: TypeRegistry,
}

impl CompilationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_function(&mut self, signature: FunctionSignature) -> Option<FunctionSignature> {
        self.functions.insert(signature.name, signature)
    }

    pub fn get_function(&self, name: Symbol) -> Option<&FunctionSignature> {
        self.functions.get(&name)
    }
}

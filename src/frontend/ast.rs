//! The parsed form of a module. Statements are kept flat, one per source
//! line, with block structure expressed through `If`/`Else`/`End` markers.
//! Expressions are kept as token runs; operator precedence is resolved when
//! they are lowered to IR.

use crate::frontend::{
    intern::Symbol,
    lexer::{Span, Token},
};

#[derive(Debug)]
pub struct Module {
    pub items: Vec<Item>,
}

#[derive(Debug)]
pub enum Item {
    Function(FunctionDefinition),
    Extern(FunctionSignature),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identifier {
    pub symbol: Symbol,
    pub span: Span,
}

/// A type as written in the source, e.g. `long[4]` or `byte*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeExpression {
    pub text: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub ty: TypeExpression,
    pub name: Identifier,
}

#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: Identifier,
    pub parameters: Vec<FunctionParameter>,
    pub return_type: Option<TypeExpression>,
    pub span: Span,
}

#[derive(Debug)]
pub struct FunctionDefinition {
    pub signature: FunctionSignature,
    pub body: Vec<Statement>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub tokens: Vec<Token>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOperator {
    Assign,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftLeft,
    ShiftRight,
}

#[derive(Debug, Clone)]
pub struct AsmBinding {
    pub variable: Identifier,
    pub register: Identifier,
}

#[derive(Debug, Clone)]
pub enum StatementKind {
    /// `long x = 1`
    Declaration {
        ty: TypeExpression,
        name: Identifier,
        value: Option<Expression>,
    },
    /// `x = 1`, `x[i] += 2`
    Assignment {
        target: Identifier,
        index: Option<Expression>,
        operator: AssignmentOperator,
        value: Expression,
    },
    /// A call evaluated for its side effects
    Expression(Expression),
    If {
        condition: Expression,
    },
    Else,
    End,
    While {
        condition: Expression,
    },
    ForRange {
        variable: Identifier,
        start: Expression,
        end: Expression,
    },
    ForEach {
        variable: Identifier,
        array: Identifier,
    },
    Break,
    Return(Option<Expression>),
    InlineAsm {
        inputs: Vec<AsmBinding>,
        outputs: Vec<AsmBinding>,
        text: String,
        text_span: Span,
    },
}

impl StatementKind {
    /// Whether this statement opens a block closed by `end`
    pub fn opens_block(&self) -> bool {
        matches!(
            self,
            StatementKind::If { .. }
                | StatementKind::While { .. }
                | StatementKind::ForRange { .. }
                | StatementKind::ForEach { .. }
        )
    }
}

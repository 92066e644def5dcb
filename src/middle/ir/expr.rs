//! Expression lowering. An expression arrives as a run of tokens and is
//! split at its loosest binary operator, recursing into both halves. Every
//! intermediate result gets its own temporary, which is destroyed as soon as
//! the operation consuming it has been emitted.

use crate::{
    backend::assembler::parse_integer,
    frontend::{
        ast::Expression,
        diagnostic::CompileError,
        intern::Symbol,
        lexer::{Span, Token, TokenKind},
    },
    middle::{
        ir::{
            Line, MathOp, Operand,
            builder::{FunctionBuilder, SYSCALL_BUILTIN},
        },
        ty::{PrimitiveKind, Type},
    },
};

/// A lowered expression. Temporaries must be handed back to
/// [`FunctionBuilder::release`] once the value has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub operand: Operand,
    pub temporary: bool,
}

impl Value {
    fn plain(operand: Operand) -> Self {
        Self {
            operand,
            temporary: false,
        }
    }
}

/// Loosest binding last. `None` for tokens that aren't binary operators.
fn binary_precedence(kind: TokenKind) -> Option<u8> {
    Some(match kind {
        TokenKind::Asterisk | TokenKind::Divide | TokenKind::Modulus => 1,
        TokenKind::Plus | TokenKind::Minus => 2,
        TokenKind::ShiftLeft | TokenKind::ShiftRight => 3,
        TokenKind::LessThan
        | TokenKind::LessThanOrEqualTo
        | TokenKind::GreaterThan
        | TokenKind::GreaterThanOrEqualTo => 4,
        TokenKind::DoubleEquals | TokenKind::NotEquals => 5,
        TokenKind::BitwiseAnd => 6,
        TokenKind::BitwiseXor => 7,
        TokenKind::BitwiseOr => 8,
        _ => return None,
    })
}

fn span_of(tokens: &[Token]) -> Span {
    match (tokens.first(), tokens.last()) {
        (Some(first), Some(last)) => first.span.to(last.span),
        _ => Span::default(),
    }
}

/// Index of the bracket closing the one at `open`
pub(super) fn matching_close(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;

    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::OpenParen | TokenKind::OpenBracket => depth += 1,
            TokenKind::CloseParen | TokenKind::CloseBracket => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Position of the operator to split at: the loosest binding one at
/// bracket depth zero, rightmost among equals so evaluation is left
/// associative
fn find_split(tokens: &[Token]) -> Option<usize> {
    let mut depth = 0usize;
    let mut best: Option<(usize, u8)> = None;

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::OpenParen | TokenKind::OpenBracket => depth += 1,
            TokenKind::CloseParen | TokenKind::CloseBracket => depth = depth.saturating_sub(1),
            kind if depth == 0 && i > 0 && tokens[i - 1].kind.ends_operand() => {
                if let Some(precedence) = binary_precedence(kind) {
                    if best.is_none_or(|(_, p)| precedence >= p) {
                        best = Some((i, precedence));
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(i, _)| i)
}

/// Splits call arguments at top level commas
fn split_arguments(tokens: &[Token]) -> Vec<&[Token]> {
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut arguments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::OpenParen | TokenKind::OpenBracket => depth += 1,
            TokenKind::CloseParen | TokenKind::CloseBracket => depth = depth.saturating_sub(1),
            TokenKind::Comma if depth == 0 => {
                arguments.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    arguments.push(&tokens[start..]);
    arguments
}

impl FunctionBuilder<'_> {
    pub(super) fn lower_expression(
        &mut self,
        expression: &Expression,
        ty: &Type,
        destination: Option<Symbol>,
    ) -> Result<Value, CompileError> {
        self.lower_tokens(&expression.tokens, ty, destination)
    }

    /// Emits the `Destroy` of a temporary
    pub(super) fn release(&mut self, value: Value) {
        if let (true, Operand::Variable(name)) = (value.temporary, value.operand) {
            self.function.push(Line::Destroy { name });
        }
    }

    /// The variable a computed value is written to: the destination if
    /// there is one, else a fresh temporary
    fn result_variable(&mut self, ty: &Type, destination: Option<Symbol>) -> (Symbol, bool) {
        match destination {
            Some(destination) => (destination, false),
            None => {
                let name = self.function.new_temporary();
                self.function.push(Line::Declare {
                    name,
                    ty: ty.clone(),
                });
                (name, true)
            }
        }
    }

    /// Hands a ready operand to the destination, if any
    fn deliver(&mut self, operand: Operand, destination: Option<Symbol>) -> Value {
        match destination {
            Some(var) => {
                self.function.push(Line::Assign {
                    var,
                    value: operand,
                    is_const: false,
                });
                Value::plain(Operand::Variable(var))
            }
            None => Value::plain(operand),
        }
    }

    fn malformed(&self, tokens: &[Token]) -> CompileError {
        let span = span_of(tokens);
        CompileError::parse(
            format!("Malformed expression `{}`", self.source.value_of_span(span)),
            span,
        )
    }

    fn lower_tokens(
        &mut self,
        tokens: &[Token],
        ty: &Type,
        destination: Option<Symbol>,
    ) -> Result<Value, CompileError> {
        let Some(first) = tokens.first().copied() else {
            return Err(CompileError::parse("Expected expression", Span::default()));
        };

        // Redundant parentheses
        if first.kind == TokenKind::OpenParen && matching_close(tokens, 0) == Some(tokens.len() - 1)
        {
            return self.lower_tokens(&tokens[1..tokens.len() - 1], ty, destination);
        }

        if let Some(split) = find_split(tokens) {
            return self.lower_binary(tokens, split, ty, destination);
        }

        match first.kind {
            TokenKind::Minus | TokenKind::Bang | TokenKind::Tilde => {
                self.lower_unary(first.kind, &tokens[1..], ty, destination)
            }
            TokenKind::IntegerLiteral | TokenKind::CharLiteral if tokens.len() == 1 => {
                let value = parse_integer(self.source.value_of_span(first.span)).ok_or_else(
                    || {
                        CompileError::parse(
                            format!(
                                "Invalid integer literal `{}`",
                                self.source.value_of_span(first.span)
                            ),
                            first.span,
                        )
                    },
                )?;

                Ok(self.deliver(Operand::Literal(value), destination))
            }
            TokenKind::Identifier => self.lower_access(tokens, destination),
            _ => Err(self.malformed(tokens)),
        }
    }

    fn lower_binary(
        &mut self,
        tokens: &[Token],
        split: usize,
        ty: &Type,
        destination: Option<Symbol>,
    ) -> Result<Value, CompileError> {
        let operator = tokens[split].kind;
        let (left, right) = (&tokens[..split], &tokens[split + 1..]);

        if left.is_empty() || right.is_empty() {
            return Err(self.malformed(tokens));
        }

        let is_comparison = binary_precedence(operator).is_some_and(|p| p == 4 || p == 5);
        let operand_type = if is_comparison { Type::LONG } else { ty.clone() };

        let lhs = self.lower_tokens(left, &operand_type, None)?;
        let rhs = self.lower_tokens(right, &operand_type, None)?;

        let (op, lhs_operand, rhs_operand) = match operator {
            TokenKind::Asterisk => (MathOp::Mul, lhs.operand, rhs.operand),
            TokenKind::Divide => (MathOp::Div, lhs.operand, rhs.operand),
            TokenKind::Modulus => (MathOp::Rem, lhs.operand, rhs.operand),
            TokenKind::Plus => (MathOp::Add, lhs.operand, rhs.operand),
            TokenKind::Minus => (MathOp::Sub, lhs.operand, rhs.operand),
            TokenKind::ShiftLeft => (MathOp::LeftShift, lhs.operand, rhs.operand),
            TokenKind::ShiftRight => (MathOp::RightShift, lhs.operand, rhs.operand),
            TokenKind::LessThan => (MathOp::Less, lhs.operand, rhs.operand),
            TokenKind::LessThanOrEqualTo => (MathOp::LessOrEqual, lhs.operand, rhs.operand),
            // Mirrored forms swap operands
            TokenKind::GreaterThan => (MathOp::Less, rhs.operand, lhs.operand),
            TokenKind::GreaterThanOrEqualTo => (MathOp::LessOrEqual, rhs.operand, lhs.operand),
            TokenKind::BitwiseAnd => (MathOp::And, lhs.operand, rhs.operand),
            TokenKind::BitwiseXor => (MathOp::Xor, lhs.operand, rhs.operand),
            TokenKind::BitwiseOr => (MathOp::Or, lhs.operand, rhs.operand),
            // A difference is non-zero exactly when the operands differ
            TokenKind::NotEquals => (MathOp::Sub, lhs.operand, rhs.operand),
            TokenKind::DoubleEquals => {
                let difference = self.function.new_temporary();
                self.function.push(Line::Declare {
                    name: difference,
                    ty: Type::LONG,
                });
                self.function.push(Line::Math {
                    op: MathOp::Sub,
                    dest: difference,
                    lhs: lhs.operand,
                    rhs: Some(rhs.operand),
                });
                self.release(rhs);
                self.release(lhs);

                let (dest, temporary) = self.result_variable(ty, destination);
                self.function.push(Line::Math {
                    op: MathOp::Inv,
                    dest,
                    lhs: Operand::Variable(difference),
                    rhs: None,
                });
                self.function.push(Line::Destroy { name: difference });

                return Ok(Value {
                    operand: Operand::Variable(dest),
                    temporary,
                });
            }
            _ => return Err(self.malformed(tokens)),
        };

        let (dest, temporary) = self.result_variable(ty, destination);
        self.function.push(Line::Math {
            op,
            dest,
            lhs: lhs_operand,
            rhs: Some(rhs_operand),
        });
        self.release(rhs);
        self.release(lhs);

        Ok(Value {
            operand: Operand::Variable(dest),
            temporary,
        })
    }

    fn lower_unary(
        &mut self,
        operator: TokenKind,
        operand_tokens: &[Token],
        ty: &Type,
        destination: Option<Symbol>,
    ) -> Result<Value, CompileError> {
        if operand_tokens.is_empty() {
            return Err(CompileError::parse(
                "Expected operand after unary operator",
                Span::default(),
            ));
        }

        let operand = self.lower_tokens(operand_tokens, ty, None)?;

        if let Operand::Literal(value) = operand.operand {
            let folded = match operator {
                TokenKind::Minus => value.wrapping_neg(),
                TokenKind::Bang => i64::from(value == 0),
                _ => !value,
            };

            return Ok(self.deliver(Operand::Literal(folded), destination));
        }

        let (dest, temporary) = self.result_variable(ty, destination);
        let line = match operator {
            TokenKind::Minus => Line::Math {
                op: MathOp::Sub,
                dest,
                lhs: Operand::Literal(0),
                rhs: Some(operand.operand),
            },
            TokenKind::Bang => Line::Math {
                op: MathOp::Inv,
                dest,
                lhs: operand.operand,
                rhs: None,
            },
            _ => Line::Math {
                op: MathOp::Not,
                dest,
                lhs: operand.operand,
                rhs: None,
            },
        };

        self.function.push(line);
        self.release(operand);

        Ok(Value {
            operand: Operand::Variable(dest),
            temporary,
        })
    }

    /// Names, calls, indexing and member access
    fn lower_access(
        &mut self,
        tokens: &[Token],
        destination: Option<Symbol>,
    ) -> Result<Value, CompileError> {
        let name = tokens[0];

        match tokens.get(1).map(|t| t.kind) {
            None => {
                let (variable, _) = self.lookup(name)?;
                Ok(self.deliver(Operand::Variable(variable), destination))
            }
            Some(TokenKind::OpenParen) if matching_close(tokens, 1) == Some(tokens.len() - 1) => {
                self.lower_call(tokens, destination, true)
            }
            Some(TokenKind::OpenBracket) if matching_close(tokens, 1) == Some(tokens.len() - 1) => {
                let (array, array_type) = self.lookup(name)?;
                let Some(element) = array_type.element().cloned() else {
                    return Err(CompileError::NotIndexable {
                        variable: array,
                        span: name.span,
                    });
                };

                let index = self.lower_tokens(&tokens[2..tokens.len() - 1], &Type::LONG, None)?;
                let (dest, temporary) = self.result_variable(&element, destination);

                self.function.push(Line::Math {
                    op: MathOp::LoadAt,
                    dest,
                    lhs: Operand::Variable(array),
                    rhs: Some(index.operand),
                });
                self.release(index);

                Ok(Value {
                    operand: Operand::Variable(dest),
                    temporary,
                })
            }
            Some(TokenKind::Dot) if tokens.len() == 3 && tokens[2].kind == TokenKind::Identifier => {
                self.lower_member(name, tokens[2], destination)
            }
            _ => Err(self.malformed(tokens)),
        }
    }

    fn lower_member(
        &mut self,
        name: Token,
        member: Token,
        destination: Option<Symbol>,
    ) -> Result<Value, CompileError> {
        let (variable, ty) = self.lookup(name)?;
        let member_name = self.source.value_of_span(member.span);

        let invalid = || CompileError::InvalidMember {
            variable,
            member: member_name.to_owned(),
            span: name.span.to(member.span),
        };

        match (member_name, &ty) {
            ("ptr", ty) if ty.is_indexable() => {
                Ok(self.deliver(Operand::Variable(variable), destination))
            }
            ("length", Type::FixedArray { length, .. }) => {
                Ok(self.deliver(Operand::Literal(*length as i64), destination))
            }
            ("length", Type::DynamicArray(_)) => {
                // The count is the long stored just before the first element
                let header = self.function.new_temporary();
                self.function.push(Line::Declare {
                    name: header,
                    ty: Type::DynamicArray(Box::new(Type::Primitive(PrimitiveKind::Long))),
                });
                self.function.push(Line::Assign {
                    var: header,
                    value: Operand::Variable(variable),
                    is_const: false,
                });

                let (dest, temporary) = self.result_variable(&Type::LONG, destination);
                self.function.push(Line::Math {
                    op: MathOp::LoadAt,
                    dest,
                    lhs: Operand::Variable(header),
                    rhs: Some(Operand::Literal(-1)),
                });
                self.function.push(Line::Destroy { name: header });

                Ok(Value {
                    operand: Operand::Variable(dest),
                    temporary,
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Lowers `name(args)`. With `as_value` unset the result is discarded.
    pub(super) fn lower_call(
        &mut self,
        tokens: &[Token],
        destination: Option<Symbol>,
        as_value: bool,
    ) -> Result<Value, CompileError> {
        let name_token = tokens[0];
        let function = Symbol::new(self.source.value_of_span(name_token.span));
        let arguments = split_arguments(&tokens[2..tokens.len() - 1]);
        let span = span_of(tokens);

        let (parameter_types, return_type) = if function.value() == SYSCALL_BUILTIN {
            if arguments.is_empty() || arguments.len() > 4 {
                return Err(CompileError::ArgumentCount {
                    function,
                    expected: 4,
                    found: arguments.len(),
                    span,
                });
            }

            (vec![Type::LONG; arguments.len()], Type::LONG)
        } else {
            let signature = self.context.get_function(function).ok_or(
                CompileError::UnresolvedFunction {
                    name: function,
                    span: name_token.span,
                },
            )?;

            if signature.arguments.len() != arguments.len() {
                return Err(CompileError::ArgumentCount {
                    function,
                    expected: signature.arguments.len(),
                    found: arguments.len(),
                    span,
                });
            }

            (
                signature.arguments.iter().map(|a| a.ty.clone()).collect(),
                signature.return_type.clone(),
            )
        };

        if as_value && return_type.is_void() {
            return Err(CompileError::VoidValue { function, span });
        }

        let mut values = Vec::new();
        for (argument, parameter_type) in arguments.iter().zip(&parameter_types) {
            if argument.is_empty() {
                return Err(CompileError::parse("Empty argument", span));
            }
            values.push(self.lower_tokens(argument, parameter_type, None)?);
        }

        let (result, temporary) = if as_value {
            let (dest, temporary) = self.result_variable(&return_type, destination);
            (Some(dest), temporary)
        } else {
            (None, false)
        };

        self.function.push(Line::Call {
            result,
            function,
            args: values.iter().map(|v| v.operand).collect(),
        });

        for value in values.into_iter().rev() {
            self.release(value);
        }

        Ok(Value {
            operand: result.map_or(Operand::Literal(0), Operand::Variable),
            temporary,
        })
    }
}

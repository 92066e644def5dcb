use crate::frontend::{
    SourceFile,
    ast::{
        AsmBinding, AssignmentOperator, Expression, FunctionDefinition, FunctionParameter,
        FunctionSignature, Identifier, Item, Module, Statement, StatementKind, TypeExpression,
    },
    diagnostic::CompileError,
    intern::Symbol,
    lexer::{Keyword, Lexer, Span, Token, TokenKind},
};

#[derive(Debug)]
pub struct Parser<'source> {
    source: &'source SourceFile,
    tokens: Vec<Token>,
    position: usize,
}

impl<'source> Parser<'source> {
    pub fn parse_module(source: &'source SourceFile) -> Result<Module, CompileError> {
        let mut parser = Self {
            source,
            tokens: Lexer::tokenize(source)?,
            position: 0,
        };

        let mut module = Module { items: Vec::new() };

        while parser.skip_newlines() {
            module.items.push(parser.parse_module_item()?);
        }

        Ok(module)
    }

    fn value(&self, token: Token) -> &'source str {
        self.source.value_of_span(token.span)
    }

    fn eof_span(&self) -> Span {
        let end = self.source.contents.len();
        Span::new(end, end)
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn peek_nth(&self, n: usize) -> Option<Token> {
        self.tokens.get(self.position + n).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek()?;
        self.position += 1;
        Some(token)
    }

    /// Skips blank lines, returning whether anything is left
    fn skip_newlines(&mut self) -> bool {
        while self.peek().is_some_and(|t| t.kind == TokenKind::Newline) {
            self.position += 1;
        }

        self.peek().is_some()
    }

    fn expect_next(&mut self, expecting: &str) -> Result<Token, CompileError> {
        match self.next() {
            Some(token) => Ok(token),
            None => Err(CompileError::parse(
                format!("Expected {expecting} but reached end of file"),
                self.eof_span(),
            )),
        }
    }

    fn expect_next_to_be(&mut self, kind: TokenKind, expecting: &str) -> Result<Token, CompileError> {
        let token = self.expect_next(expecting)?;

        if token.kind != kind {
            return Err(CompileError::parse(
                format!("Expected {expecting} but found `{}`", self.value(token).escape_debug()),
                token.span,
            ));
        }

        Ok(token)
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<Token, CompileError> {
        self.expect_next_to_be(TokenKind::Keyword(keyword), &format!("`{keyword}`"))
    }

    fn expect_identifier(&mut self, expecting: &str) -> Result<Identifier, CompileError> {
        let token = self.expect_next_to_be(TokenKind::Identifier, expecting)?;

        Ok(Identifier {
            symbol: Symbol::new(self.value(token)),
            span: token.span,
        })
    }

    fn expect_end_of_line(&mut self) -> Result<(), CompileError> {
        self.expect_next_to_be(TokenKind::Newline, "end of line")?;
        Ok(())
    }

    fn parse_module_item(&mut self) -> Result<Item, CompileError> {
        let peeked = self.expect_next("function definition")?;

        match peeked.kind {
            TokenKind::Keyword(Keyword::Func) => {
                let signature = self.parse_function_signature(peeked.span)?;
                let (body, end_span) = self.parse_function_body(&signature)?;

                Ok(Item::Function(FunctionDefinition {
                    span: signature.span.to(end_span),
                    signature,
                    body,
                }))
            }
            TokenKind::Keyword(Keyword::Extern) => {
                self.expect_keyword(Keyword::Func)?;
                let signature = self.parse_function_signature(peeked.span)?;

                Ok(Item::Extern(signature))
            }
            _ => Err(CompileError::parse(
                format!(
                    "Expected function definition in module but found `{}`",
                    self.value(peeked)
                ),
                peeked.span,
            )),
        }
    }

    /// name(type a, type b) -> type
    fn parse_function_signature(&mut self, start: Span) -> Result<FunctionSignature, CompileError> {
        let name = self.expect_identifier("function name")?;
        self.expect_next_to_be(TokenKind::OpenParen, "`(`")?;

        let mut parameters = Vec::new();

        if self.peek().is_some_and(|t| t.kind == TokenKind::CloseParen) {
            self.next();
        } else {
            loop {
                let ty = self.parse_type()?;
                let name = self.expect_identifier("parameter name")?;
                parameters.push(FunctionParameter { ty, name });

                let separator = self.expect_next("`,` or `)`")?;
                match separator.kind {
                    TokenKind::Comma => continue,
                    TokenKind::CloseParen => break,
                    _ => {
                        return Err(CompileError::parse(
                            format!("Expected `,` or `)` but found `{}`", self.value(separator)),
                            separator.span,
                        ));
                    }
                }
            }
        }

        let return_type = if self.peek().is_some_and(|t| t.kind == TokenKind::Arrow) {
            self.next();
            Some(self.parse_type()?)
        } else {
            None
        };

        let end = self.peek().map(|t| t.span).unwrap_or(start);
        self.expect_end_of_line()?;

        Ok(FunctionSignature {
            name,
            parameters,
            return_type,
            span: Span::new(start.start, end.start),
        })
    }

    /// A base type name followed by any number of `*`, `[]` or `[N]`
    fn parse_type(&mut self) -> Result<TypeExpression, CompileError> {
        let base = self.expect_next_to_be(TokenKind::Identifier, "type name")?;
        let mut text = self.value(base).to_owned();
        let mut span = base.span;

        loop {
            match self.peek().map(|t| t.kind) {
                Some(TokenKind::Asterisk) => {
                    let star = self.expect_next("`*`")?;
                    text.push('*');
                    span = span.to(star.span);
                }
                Some(TokenKind::OpenBracket) => {
                    self.next();
                    let mut token = self.expect_next("`]` or array length")?;

                    text.push('[');
                    if token.kind == TokenKind::IntegerLiteral {
                        text.push_str(self.value(token));
                        token = self.expect_next("`]`")?;
                    }

                    if token.kind != TokenKind::CloseBracket {
                        return Err(CompileError::parse(
                            format!("Expected `]` but found `{}`", self.value(token)),
                            token.span,
                        ));
                    }

                    text.push(']');
                    span = span.to(token.span);
                }
                _ => break,
            }
        }

        Ok(TypeExpression { text, span })
    }

    fn parse_function_body(
        &mut self,
        signature: &FunctionSignature,
    ) -> Result<(Vec<Statement>, Span), CompileError> {
        let mut body = Vec::new();
        let mut depth = 0usize;

        loop {
            if !self.skip_newlines() {
                return Err(CompileError::UnbalancedBlock {
                    message: "missing `end` for function",
                    span: signature.name.span,
                });
            }

            let statement = self.parse_statement()?;

            match statement.kind {
                StatementKind::End if depth == 0 => return Ok((body, statement.span)),
                StatementKind::End => depth -= 1,
                ref kind if kind.opens_block() => depth += 1,
                _ => {}
            }

            body.push(statement);
        }
    }

    /// Collects the tokens up to (not including) the end of the line or a
    /// stop keyword
    fn collect_expression(
        &mut self,
        expecting: &str,
        stop: Option<Keyword>,
    ) -> Result<Expression, CompileError> {
        let start = self.position;

        while let Some(token) = self.peek() {
            if token.kind == TokenKind::Newline
                || stop.is_some_and(|k| token.kind == TokenKind::Keyword(k))
            {
                break;
            }

            self.position += 1;
        }

        let tokens = self.tokens[start..self.position].to_vec();

        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            let span = self.peek().map(|t| t.span).unwrap_or(self.eof_span());
            return Err(CompileError::parse(format!("Expected {expecting}"), span));
        };

        Ok(Expression {
            span: first.span.to(last.span),
            tokens,
        })
    }

    /// Collects the tokens between an already consumed `[` and its matching
    /// `]`
    fn collect_bracketed(&mut self, open: Token) -> Result<Expression, CompileError> {
        let start = self.position;
        let mut depth = 0usize;

        loop {
            let token = self.peek().filter(|t| t.kind != TokenKind::Newline).ok_or_else(|| {
                CompileError::parse("Unclosed `[`", open.span)
            })?;
            self.position += 1;

            match token.kind {
                TokenKind::OpenBracket => depth += 1,
                TokenKind::CloseBracket if depth == 0 => break,
                TokenKind::CloseBracket => depth -= 1,
                _ => {}
            }
        }

        let tokens = self.tokens[start..self.position - 1].to_vec();
        let (Some(first), Some(last)) = (tokens.first(), tokens.last()) else {
            return Err(CompileError::parse("Expected index expression", open.span));
        };

        Ok(Expression {
            span: first.span.to(last.span),
            tokens,
        })
    }

    /// Whether the line starting at the cursor is `TYPE name ...`
    fn looks_like_declaration(&self) -> bool {
        let mut i = 1;

        loop {
            match self.peek_nth(i).map(|t| t.kind) {
                Some(TokenKind::Asterisk) => i += 1,
                Some(TokenKind::OpenBracket) => {
                    let mut depth = 0usize;
                    loop {
                        i += 1;
                        match self.peek_nth(i).map(|t| t.kind) {
                            Some(TokenKind::OpenBracket) => depth += 1,
                            Some(TokenKind::CloseBracket) if depth == 0 => break,
                            Some(TokenKind::CloseBracket) => depth -= 1,
                            Some(TokenKind::Newline) | None => return false,
                            _ => {}
                        }
                    }
                    i += 1;
                }
                Some(TokenKind::Identifier) => return true,
                _ => return false,
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Statement, CompileError> {
        let first = self.expect_next("statement")?;
        let start = first.span;

        let kind = match first.kind {
            TokenKind::Keyword(Keyword::If) => StatementKind::If {
                condition: self.collect_expression("condition after `if`", None)?,
            },
            TokenKind::Keyword(Keyword::While) => StatementKind::While {
                condition: self.collect_expression("condition after `while`", None)?,
            },
            TokenKind::Keyword(Keyword::Else) => StatementKind::Else,
            TokenKind::Keyword(Keyword::End) => StatementKind::End,
            TokenKind::Keyword(Keyword::Break) => StatementKind::Break,
            TokenKind::Keyword(Keyword::For) => self.parse_for()?,
            TokenKind::Keyword(Keyword::Return) => {
                if self.peek().is_some_and(|t| t.kind == TokenKind::Newline) {
                    StatementKind::Return(None)
                } else {
                    StatementKind::Return(Some(self.collect_expression("return value", None)?))
                }
            }
            TokenKind::Keyword(Keyword::Asm) => self.parse_inline_asm()?,
            TokenKind::Identifier => {
                // Put the identifier back so every form sees the whole line
                self.position -= 1;
                self.parse_identifier_statement()?
            }
            _ => {
                return Err(CompileError::parse(
                    format!("Unexpected `{}` at start of statement", self.value(first)),
                    first.span,
                ));
            }
        };

        let end = self.peek().map(|t| t.span).unwrap_or(self.eof_span());
        self.expect_end_of_line()?;

        Ok(Statement {
            kind,
            span: Span::new(start.start, end.start.max(start.end)),
        })
    }

    fn parse_for(&mut self) -> Result<StatementKind, CompileError> {
        let variable = self.expect_identifier("loop variable")?;
        self.expect_keyword(Keyword::In)?;

        let start = self.collect_expression("loop range or array", Some(Keyword::To))?;

        if self
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Keyword(Keyword::To))
        {
            self.next();
            let end = self.collect_expression("loop bound after `to`", None)?;

            return Ok(StatementKind::ForRange {
                variable,
                start,
                end,
            });
        }

        match start.tokens.as_slice() {
            [token] if token.kind == TokenKind::Identifier => Ok(StatementKind::ForEach {
                variable,
                array: Identifier {
                    symbol: Symbol::new(self.value(*token)),
                    span: token.span,
                },
            }),
            _ => Err(CompileError::parse(
                "Expected `to` or a single array name in `for`",
                start.span,
            )),
        }
    }

    /// [a:r1, b:r2]
    fn parse_asm_bindings(&mut self) -> Result<Vec<AsmBinding>, CompileError> {
        self.expect_next_to_be(TokenKind::OpenBracket, "`[`")?;
        let mut bindings = Vec::new();

        if self.peek().is_some_and(|t| t.kind == TokenKind::CloseBracket) {
            self.next();
            return Ok(bindings);
        }

        loop {
            let variable = self.expect_identifier("bound variable")?;
            self.expect_next_to_be(TokenKind::Colon, "`:`")?;
            let register = self.expect_identifier("register")?;
            bindings.push(AsmBinding { variable, register });

            let separator = self.expect_next("`,` or `]`")?;
            match separator.kind {
                TokenKind::Comma => continue,
                TokenKind::CloseBracket => return Ok(bindings),
                _ => {
                    return Err(CompileError::parse(
                        format!("Expected `,` or `]` but found `{}`", self.value(separator)),
                        separator.span,
                    ));
                }
            }
        }
    }

    /// asm [in:r1] -> [out:r0] "instructions"
    fn parse_inline_asm(&mut self) -> Result<StatementKind, CompileError> {
        let inputs = if self.peek().is_some_and(|t| t.kind == TokenKind::OpenBracket) {
            self.parse_asm_bindings()?
        } else {
            Vec::new()
        };

        let outputs = if self.peek().is_some_and(|t| t.kind == TokenKind::Arrow) {
            self.next();
            self.parse_asm_bindings()?
        } else {
            Vec::new()
        };

        let text = self.expect_next_to_be(TokenKind::StringLiteral, "assembly string")?;
        let raw = self.value(text);

        Ok(StatementKind::InlineAsm {
            inputs,
            outputs,
            text: raw[1..raw.len() - 1].replace("\\\"", "\""),
            text_span: text.span,
        })
    }

    fn parse_identifier_statement(&mut self) -> Result<StatementKind, CompileError> {
        if self.looks_like_declaration() {
            let ty = self.parse_type()?;
            let name = self.expect_identifier("variable name")?;

            let value = if self.peek().is_some_and(|t| t.kind == TokenKind::Equals) {
                self.next();
                Some(self.collect_expression("initial value", None)?)
            } else {
                None
            };

            return Ok(StatementKind::Declaration { ty, name, value });
        }

        let target_token = self.peek().ok_or_else(|| {
            CompileError::parse("Expected statement but reached end of file", self.eof_span())
        })?;

        let index = match self.peek_nth(1) {
            Some(open) if open.kind == TokenKind::OpenBracket => {
                let saved = self.position;
                self.position += 2;
                let index = self.collect_bracketed(open)?;

                if self.peek().is_some_and(|t| t.kind.is_assignment_operator()) {
                    Some(index)
                } else {
                    // An indexing expression used as a statement, not a store
                    self.position = saved;
                    None
                }
            }
            _ => None,
        };

        let operator_position = if index.is_some() {
            self.position
        } else {
            self.position + 1
        };

        let operator = self
            .tokens
            .get(operator_position)
            .and_then(|t| assignment_operator(t.kind));

        match operator {
            Some(operator) => {
                self.position = operator_position + 1;

                Ok(StatementKind::Assignment {
                    target: Identifier {
                        symbol: Symbol::new(self.value(target_token)),
                        span: target_token.span,
                    },
                    index,
                    operator,
                    value: self.collect_expression("value after assignment", None)?,
                })
            }
            None => Ok(StatementKind::Expression(
                self.collect_expression("expression", None)?,
            )),
        }
    }
}

fn assignment_operator(kind: TokenKind) -> Option<AssignmentOperator> {
    Some(match kind {
        TokenKind::Equals => AssignmentOperator::Assign,
        TokenKind::PlusEquals => AssignmentOperator::Add,
        TokenKind::MinusEquals => AssignmentOperator::Subtract,
        TokenKind::MultiplyEquals => AssignmentOperator::Multiply,
        TokenKind::DivideEquals => AssignmentOperator::Divide,
        TokenKind::ModulusEquals => AssignmentOperator::Modulus,
        TokenKind::BitwiseAndEquals => AssignmentOperator::BitwiseAnd,
        TokenKind::BitwiseOrEquals => AssignmentOperator::BitwiseOr,
        TokenKind::BitwiseXorEquals => AssignmentOperator::BitwiseXor,
        TokenKind::ShiftLeftEquals => AssignmentOperator::ShiftLeft,
        TokenKind::ShiftRightEquals => AssignmentOperator::ShiftRight,
        _ => return None,
    })
}

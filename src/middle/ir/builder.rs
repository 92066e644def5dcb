//! Builds IR from the parsed module. Control structures are desugared into
//! labels and jumps here, and every variable gets a `Declare` when it comes
//! into scope and a `Destroy` when its block closes.

use log::debug;

use crate::{
    backend::{assembler::parse_assembly, isa::Register},
    frontend::{
        SourceFile,
        ast::{
            self, AsmBinding as AstAsmBinding, AssignmentOperator, Expression, Identifier,
            StatementKind, TypeExpression,
        },
        diagnostic::CompileError,
        intern::{Symbol, SymbolTable},
        lexer::{Span, Token, TokenKind},
    },
    middle::{
        ir::{
            Argument, AsmBinding, CompilationContext, Function, FunctionSignature, Line, MathOp,
            Operand,
            expr::{Value, matching_close},
        },
        ty::Type,
    },
};

/// Calls to this name issue the `syscall` instruction
pub const SYSCALL_BUILTIN: &str = "syscall";

#[derive(Debug)]
pub struct ModuleIr {
    pub context: CompilationContext,
    /// Functions with a body, in source order
    pub functions: Vec<Function>,
    /// One entry per function that failed to build, plus signature errors
    pub errors: Vec<CompileError>,
}

/// Registers every signature, then builds each function body. A function
/// that fails to build is reported and skipped without affecting the
/// others.
pub fn build_module(module: &ast::Module, source: &SourceFile) -> ModuleIr {
    let mut context = CompilationContext::new();
    let mut errors = Vec::new();
    let mut bodies = Vec::new();

    for item in &module.items {
        let (signature, body) = match item {
            ast::Item::Function(definition) => (&definition.signature, Some(definition)),
            ast::Item::Extern(signature) => (signature, None),
        };

        match resolve_signature(&context, signature) {
            Ok(resolved) => {
                if context.declare_function(resolved).is_some() {
                    errors.push(CompileError::DuplicateFunction {
                        name: signature.name.symbol,
                        span: signature.name.span,
                    });
                    continue;
                }

                if let Some(definition) = body {
                    bodies.push(definition);
                }
            }
            Err(error) => errors.push(error),
        }
    }

    let mut functions = Vec::new();

    for definition in bodies {
        match FunctionBuilder::build(&context, source, definition) {
            Ok(function) => {
                debug!(
                    "built `{}`: {} lines, {} temporaries",
                    function.name,
                    function.lines.len(),
                    function.next_temporary
                );
                functions.push(function);
            }
            Err(error) => errors.push(error),
        }
    }

    ModuleIr {
        context,
        functions,
        errors,
    }
}

fn resolve_type(context: &CompilationContext, ty: &TypeExpression) -> Result<Type, CompileError> {
    context
        .types
        .get_type(&ty.text)
        .ok_or_else(|| CompileError::UnknownType {
            name: ty.text.clone(),
            span: ty.span,
        })
}

fn resolve_signature(
    context: &CompilationContext,
    signature: &ast::FunctionSignature,
) -> Result<FunctionSignature, CompileError> {
    let mut arguments: Vec<Argument> = Vec::new();

    for parameter in &signature.parameters {
        let ty = resolve_type(context, &parameter.ty)?;

        if ty.is_void() {
            return Err(CompileError::UnknownType {
                name: parameter.ty.text.clone(),
                span: parameter.ty.span,
            });
        }

        if arguments.iter().any(|a| a.name == parameter.name.symbol) {
            return Err(CompileError::DuplicateDeclaration {
                name: parameter.name.symbol,
                span: parameter.name.span,
            });
        }

        arguments.push(Argument {
            name: parameter.name.symbol,
            ty,
        });
    }

    let return_type = match &signature.return_type {
        Some(ty) => resolve_type(context, ty)?,
        None => Type::VOID,
    };

    Ok(FunctionSignature {
        name: signature.name.symbol,
        arguments,
        return_type,
    })
}

#[derive(Debug)]
enum OpenBlock {
    If {
        /// Index of the conditional jump, patched to `end` when there is no
        /// else part
        jump: usize,
        else_label: Symbol,
        end_label: Symbol,
        in_else: bool,
    },
    Loop {
        head: Symbol,
        jump: usize,
        else_label: Symbol,
        end_label: Symbol,
        in_else: bool,
        /// Counter incremented before every back-edge
        counter: Option<Symbol>,
    },
}

#[derive(Debug)]
pub struct FunctionBuilder<'a> {
    pub(super) context: &'a CompilationContext,
    pub(super) source: &'a SourceFile,
    pub(super) function: Function,
    /// Types of the variables currently in scope
    variables: SymbolTable<Type>,
    /// Names declared in each open scope, innermost last
    scopes: Vec<Vec<Symbol>>,
    blocks: Vec<OpenBlock>,
}

impl<'a> FunctionBuilder<'a> {
    pub fn build(
        context: &'a CompilationContext,
        source: &'a SourceFile,
        definition: &ast::FunctionDefinition,
    ) -> Result<Function, CompileError> {
        let signature = context
            .get_function(definition.signature.name.symbol)
            .cloned()
            .ok_or(CompileError::UnresolvedFunction {
                name: definition.signature.name.symbol,
                span: definition.signature.name.span,
            })?;

        let variables = signature
            .arguments
            .iter()
            .map(|a| (a.name, a.ty.clone()))
            .collect();

        let mut builder = Self {
            context,
            source,
            function: Function::new(signature),
            variables,
            scopes: vec![Vec::new()],
            blocks: Vec::new(),
        };

        for statement in &definition.body {
            builder.build_statement(statement)?;
        }

        if !builder.blocks.is_empty() {
            return Err(CompileError::UnbalancedBlock {
                message: "missing `end`",
                span: definition.span,
            });
        }

        builder.pop_scope();

        if !builder
            .function
            .lines
            .iter()
            .rev()
            .find(|line| !line.is_bookkeeping())
            .is_some_and(Line::is_terminator)
        {
            builder.function.push(Line::Return { value: None });
        }

        let mut function = builder.function;
        function.mark_constants();
        Ok(function)
    }

    /// The variable a name token refers to
    pub(super) fn lookup(&self, token: Token) -> Result<(Symbol, Type), CompileError> {
        let name = Symbol::new(self.source.value_of_span(token.span));

        self.variables
            .get(&name)
            .map(|ty| (name, ty.clone()))
            .ok_or(CompileError::UndeclaredVariable {
                name,
                span: token.span,
            })
    }

    fn lookup_identifier(&self, identifier: Identifier) -> Result<Type, CompileError> {
        self.variables
            .get(&identifier.symbol)
            .cloned()
            .ok_or(CompileError::UndeclaredVariable {
                name: identifier.symbol,
                span: identifier.span,
            })
    }

    fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Closes the innermost scope, destroying its variables newest first
    fn pop_scope(&mut self) {
        for name in self.scopes.pop().unwrap_or_default().into_iter().rev() {
            self.variables.remove(&name);
            self.function.push(Line::Destroy { name });
        }
    }

    fn declare(&mut self, name: Symbol, ty: Type, span: Span) -> Result<(), CompileError> {
        if self.variables.contains_key(&name) {
            return Err(CompileError::DuplicateDeclaration { name, span });
        }

        self.function.push(Line::Declare {
            name,
            ty: ty.clone(),
        });
        self.variables.insert(name, ty);

        if let Some(scope) = self.scopes.last_mut() {
            scope.push(name);
        }

        Ok(())
    }

    /// A compiler generated variable living in the current scope
    fn declare_hidden(&mut self, ty: Type) -> Symbol {
        let name = self.function.new_temporary();
        self.function.push(Line::Declare {
            name,
            ty: ty.clone(),
        });
        self.variables.insert(name, ty);

        if let Some(scope) = self.scopes.last_mut() {
            scope.push(name);
        }

        name
    }

    fn build_statement(&mut self, statement: &ast::Statement) -> Result<(), CompileError> {
        match &statement.kind {
            StatementKind::Declaration { ty, name, value } => {
                let resolved = resolve_type(self.context, ty)?;

                if resolved.is_void() {
                    return Err(CompileError::UnknownType {
                        name: ty.text.clone(),
                        span: ty.span,
                    });
                }

                if value.is_some() && resolved.fixed_length().is_some() {
                    return Err(CompileError::parse(
                        "Fixed-size arrays can't have an initializer",
                        statement.span,
                    ));
                }

                self.declare(name.symbol, resolved.clone(), name.span)?;

                if let Some(value) = value {
                    self.lower_expression(value, &resolved, Some(name.symbol))?;
                }
            }
            StatementKind::Assignment {
                target,
                index: None,
                operator,
                value,
            } => {
                let ty = self.lookup_identifier(*target)?;

                match math_for(*operator) {
                    None => {
                        self.lower_expression(value, &ty, Some(target.symbol))?;
                    }
                    Some(op) => {
                        let value = self.lower_expression(value, &ty, None)?;
                        self.function.push(Line::Math {
                            op,
                            dest: target.symbol,
                            lhs: Operand::Variable(target.symbol),
                            rhs: Some(value.operand),
                        });
                        self.release(value);
                    }
                }
            }
            StatementKind::Assignment {
                target,
                index: Some(index),
                operator,
                value,
            } => self.build_store(*target, index, *operator, value)?,
            StatementKind::Expression(expression) => {
                let tokens = &expression.tokens;
                let is_call = tokens.len() >= 3
                    && tokens[0].kind == TokenKind::Identifier
                    && tokens[1].kind == TokenKind::OpenParen
                    && matching_close(tokens, 1) == Some(tokens.len() - 1);

                if !is_call {
                    return Err(CompileError::parse(
                        "Only calls can be used as statements",
                        expression.span,
                    ));
                }

                self.lower_call(tokens, None, false)?;
            }
            StatementKind::If { condition } => {
                let else_label = self.function.new_label("else");
                let end_label = self.function.new_label("end");
                let jump = self.build_exit_test(condition, else_label)?;

                self.blocks.push(OpenBlock::If {
                    jump,
                    else_label,
                    end_label,
                    in_else: false,
                });
                self.push_scope();
            }
            StatementKind::While { condition } => {
                let head = self.function.new_label("loop");
                let else_label = self.function.new_label("else");
                let end_label = self.function.new_label("end");

                // Holds loop counters, nothing for `while`
                self.push_scope();
                self.function.push(Line::Label { name: head });
                let jump = self.build_exit_test(condition, end_label)?;

                self.blocks.push(OpenBlock::Loop {
                    head,
                    jump,
                    else_label,
                    end_label,
                    in_else: false,
                    counter: None,
                });
                self.push_scope();
            }
            StatementKind::ForRange {
                variable,
                start,
                end,
            } => self.build_for_range(*variable, start, end)?,
            StatementKind::ForEach { variable, array } => self.build_for_each(*variable, *array)?,
            StatementKind::Else => self.build_else(statement.span)?,
            StatementKind::End => self.build_end(statement.span)?,
            StatementKind::Break => {
                let target = self
                    .blocks
                    .iter()
                    .rev()
                    .find_map(|block| match block {
                        OpenBlock::Loop {
                            end_label,
                            in_else: false,
                            ..
                        } => Some(*end_label),
                        _ => None,
                    })
                    .ok_or(CompileError::BreakOutsideLoop {
                        span: statement.span,
                    })?;

                self.function.push(Line::Goto { label: target });
            }
            StatementKind::Return(value) => {
                let return_type = self.function.return_type.clone();

                match value {
                    Some(value) if return_type.is_void() => {
                        return Err(CompileError::parse(
                            format!("`{}` returns void", self.function.name),
                            value.span,
                        ));
                    }
                    Some(value) => {
                        let value = self.lower_expression(value, &return_type, None)?;
                        self.function.push(Line::Return {
                            value: Some(value.operand),
                        });
                        self.release(value);
                    }
                    None => self.function.push(Line::Return { value: None }),
                }
            }
            StatementKind::InlineAsm {
                inputs,
                outputs,
                text,
                text_span,
            } => {
                let items = parse_assembly(text).map_err(|error| {
                    CompileError::InlineAssembly {
                        message: error.to_string(),
                        span: *text_span,
                    }
                })?;

                let inputs = self.resolve_bindings(inputs)?;
                let outputs = self.resolve_bindings(outputs)?;

                self.function.push(Line::InlineAsm {
                    inputs,
                    outputs,
                    items,
                });
            }
        }

        Ok(())
    }

    /// Evaluates a condition and emits a jump to `label` taken when it is
    /// zero. Returns the index of the jump.
    fn build_exit_test(
        &mut self,
        condition: &Expression,
        label: Symbol,
    ) -> Result<usize, CompileError> {
        let mut value = self.lower_expression(condition, &Type::LONG, None)?;

        if let Operand::Literal(literal) = value.operand {
            let name = self.function.new_temporary();
            self.function.push(Line::Declare {
                name,
                ty: Type::LONG,
            });
            self.function.push(Line::Assign {
                var: name,
                value: Operand::Literal(literal),
                is_const: false,
            });
            value = Value {
                operand: Operand::Variable(name),
                temporary: true,
            };
        }

        let Operand::Variable(condition) = value.operand else {
            unreachable!("literal conditions are materialized above");
        };

        let jump = self.function.lines.len();
        self.function.push(Line::If {
            condition,
            label,
            invert: true,
        });
        self.release(value);

        Ok(jump)
    }

    fn build_store(
        &mut self,
        target: Identifier,
        index: &Expression,
        operator: AssignmentOperator,
        value: &Expression,
    ) -> Result<(), CompileError> {
        let ty = self.lookup_identifier(target)?;
        let Some(element) = ty.element().cloned() else {
            return Err(CompileError::NotIndexable {
                variable: target.symbol,
                span: target.span,
            });
        };

        let index = self.lower_expression(index, &Type::LONG, None)?;
        let value = self.lower_expression(value, &element, None)?;

        match math_for(operator) {
            None => {
                self.function.push(Line::Store {
                    array: target.symbol,
                    index: index.operand,
                    value: value.operand,
                });
            }
            Some(op) => {
                let current = self.function.new_temporary();
                self.function.push(Line::Declare {
                    name: current,
                    ty: element,
                });
                self.function.push(Line::Math {
                    op: MathOp::LoadAt,
                    dest: current,
                    lhs: Operand::Variable(target.symbol),
                    rhs: Some(index.operand),
                });
                self.function.push(Line::Math {
                    op,
                    dest: current,
                    lhs: Operand::Variable(current),
                    rhs: Some(value.operand),
                });
                self.function.push(Line::Store {
                    array: target.symbol,
                    index: index.operand,
                    value: Operand::Variable(current),
                });
                self.function.push(Line::Destroy { name: current });
            }
        }

        self.release(value);
        self.release(index);
        Ok(())
    }

    fn build_for_range(
        &mut self,
        variable: Identifier,
        start: &Expression,
        end: &Expression,
    ) -> Result<(), CompileError> {
        let head = self.function.new_label("loop");
        let else_label = self.function.new_label("else");
        let end_label = self.function.new_label("end");

        self.push_scope();
        self.declare(variable.symbol, Type::LONG, variable.span)?;
        self.lower_expression(start, &Type::LONG, Some(variable.symbol))?;

        // The bound is evaluated once
        let bound = match self.lower_expression(end, &Type::LONG, None)? {
            Value {
                operand: Operand::Literal(value),
                ..
            } => Operand::Literal(value),
            value => {
                let hidden = self.declare_hidden(Type::LONG);
                self.function.push(Line::Assign {
                    var: hidden,
                    value: value.operand,
                    is_const: false,
                });
                self.release(value);
                Operand::Variable(hidden)
            }
        };

        self.function.push(Line::Label { name: head });
        let jump = self.build_equality_exit(Operand::Variable(variable.symbol), bound, end_label);

        self.blocks.push(OpenBlock::Loop {
            head,
            jump,
            else_label,
            end_label,
            in_else: false,
            counter: Some(variable.symbol),
        });
        self.push_scope();

        Ok(())
    }

    fn build_for_each(&mut self, variable: Identifier, array: Identifier) -> Result<(), CompileError> {
        let array_type = self.lookup_identifier(array)?;
        let Some(element) = array_type.element().cloned().filter(|_| array_type.is_array()) else {
            return Err(CompileError::NotIndexable {
                variable: array.symbol,
                span: array.span,
            });
        };

        let head = self.function.new_label("loop");
        let else_label = self.function.new_label("else");
        let end_label = self.function.new_label("end");

        self.push_scope();
        let index = self.declare_hidden(Type::LONG);
        self.function.push(Line::Assign {
            var: index,
            value: Operand::Literal(0),
            is_const: false,
        });

        let length = match array_type.fixed_length() {
            Some(length) => Operand::Literal(length as i64),
            None => {
                let length = self.declare_hidden(Type::LONG);
                let header = self.function.new_temporary();
                self.function.push(Line::Declare {
                    name: header,
                    ty: Type::DynamicArray(Box::new(Type::LONG)),
                });
                self.function.push(Line::Assign {
                    var: header,
                    value: Operand::Variable(array.symbol),
                    is_const: false,
                });
                self.function.push(Line::Math {
                    op: MathOp::LoadAt,
                    dest: length,
                    lhs: Operand::Variable(header),
                    rhs: Some(Operand::Literal(-1)),
                });
                self.function.push(Line::Destroy { name: header });
                Operand::Variable(length)
            }
        };

        self.function.push(Line::Label { name: head });
        let jump = self.build_equality_exit(Operand::Variable(index), length, end_label);

        self.blocks.push(OpenBlock::Loop {
            head,
            jump,
            else_label,
            end_label,
            in_else: false,
            counter: Some(index),
        });
        self.push_scope();

        self.declare(variable.symbol, element, variable.span)?;
        self.function.push(Line::Math {
            op: MathOp::LoadAt,
            dest: variable.symbol,
            lhs: Operand::Variable(array.symbol),
            rhs: Some(Operand::Variable(index)),
        });

        Ok(())
    }

    /// `if lhs == rhs goto label`, as a subtraction tested for zero
    fn build_equality_exit(&mut self, lhs: Operand, rhs: Operand, label: Symbol) -> usize {
        let difference = self.function.new_temporary();
        self.function.push(Line::Declare {
            name: difference,
            ty: Type::LONG,
        });
        self.function.push(Line::Math {
            op: MathOp::Sub,
            dest: difference,
            lhs,
            rhs: Some(rhs),
        });

        let jump = self.function.lines.len();
        self.function.push(Line::If {
            condition: difference,
            label,
            invert: true,
        });
        self.function.push(Line::Destroy { name: difference });

        jump
    }

    /// Increments the counter, if any, and jumps back to the loop head
    fn build_back_edge(&mut self, head: Symbol, counter: Option<Symbol>) {
        if let Some(counter) = counter {
            self.function.push(Line::Math {
                op: MathOp::Add,
                dest: counter,
                lhs: Operand::Variable(counter),
                rhs: Some(Operand::Literal(1)),
            });
        }

        self.function.push(Line::Goto { label: head });
    }

    fn patch_jump(&mut self, index: usize, target: Symbol) {
        if let Some(Line::If { label, .. }) = self.function.lines.get_mut(index) {
            *label = target;
        }
    }

    fn build_else(&mut self, span: Span) -> Result<(), CompileError> {
        let Some(block) = self.blocks.last() else {
            return Err(CompileError::UnbalancedBlock {
                message: "`else` without an open `if` or loop",
                span,
            });
        };

        match *block {
            OpenBlock::If { in_else: true, .. } | OpenBlock::Loop { in_else: true, .. } => {
                Err(CompileError::UnbalancedBlock {
                    message: "a block can only have one `else`",
                    span,
                })
            }
            OpenBlock::If {
                else_label,
                end_label,
                ..
            } => {
                self.pop_scope();
                self.function.push(Line::Goto { label: end_label });
                self.function.push(Line::Label { name: else_label });
                self.set_in_else();
                self.push_scope();
                Ok(())
            }
            OpenBlock::Loop {
                head,
                jump,
                else_label,
                counter,
                ..
            } => {
                // The loop exits into the else part when it finishes normally
                self.pop_scope();
                self.build_back_edge(head, counter);
                self.patch_jump(jump, else_label);
                self.function.push(Line::Label { name: else_label });
                self.set_in_else();
                self.push_scope();
                Ok(())
            }
        }
    }

    fn set_in_else(&mut self) {
        if let Some(OpenBlock::If { in_else, .. } | OpenBlock::Loop { in_else, .. }) =
            self.blocks.last_mut()
        {
            *in_else = true;
        }
    }

    fn build_end(&mut self, span: Span) -> Result<(), CompileError> {
        let Some(block) = self.blocks.pop() else {
            return Err(CompileError::UnbalancedBlock {
                message: "`end` without an open block",
                span,
            });
        };

        self.pop_scope();

        match block {
            OpenBlock::If {
                jump,
                end_label,
                in_else,
                ..
            } => {
                if !in_else {
                    self.patch_jump(jump, end_label);
                }
                self.function.push(Line::Label { name: end_label });
            }
            OpenBlock::Loop {
                head,
                end_label,
                in_else,
                counter,
                ..
            } => {
                if !in_else {
                    self.build_back_edge(head, counter);
                }
                self.function.push(Line::Label { name: end_label });
                // Loop counters
                self.pop_scope();
            }
        }

        Ok(())
    }

    fn resolve_bindings(
        &self,
        bindings: &[AstAsmBinding],
    ) -> Result<Vec<AsmBinding>, CompileError> {
        bindings
            .iter()
            .map(|binding| {
                self.lookup_identifier(binding.variable)?;

                let register: Register = binding
                    .register
                    .symbol
                    .value()
                    .parse()
                    .ok()
                    .filter(|r| *r != Register::STACK_POINTER)
                    .ok_or_else(|| CompileError::InlineAssembly {
                        message: format!("`{}` can't be bound", binding.register.symbol),
                        span: binding.register.span,
                    })?;

                Ok(AsmBinding {
                    variable: binding.variable.symbol,
                    register,
                })
            })
            .collect()
    }
}

fn math_for(operator: AssignmentOperator) -> Option<MathOp> {
    Some(match operator {
        AssignmentOperator::Assign => return None,
        AssignmentOperator::Add => MathOp::Add,
        AssignmentOperator::Subtract => MathOp::Sub,
        AssignmentOperator::Multiply => MathOp::Mul,
        AssignmentOperator::Divide => MathOp::Div,
        AssignmentOperator::Modulus => MathOp::Rem,
        AssignmentOperator::BitwiseAnd => MathOp::And,
        AssignmentOperator::BitwiseOr => MathOp::Or,
        AssignmentOperator::BitwiseXor => MathOp::Xor,
        AssignmentOperator::ShiftLeft => MathOp::LeftShift,
        AssignmentOperator::ShiftRight => MathOp::RightShift,
    })
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::frontend::parser::Parser;

    fn build(source: &str) -> ModuleIr {
        let source = SourceFile::from_memory(source);
        let module = Parser::parse_module(&source).unwrap();
        build_module(&module, &source)
    }

    fn build_one(source: &str) -> Function {
        let mut module = build(source);
        assert_eq!(module.errors, vec![]);
        module.functions.remove(0)
    }

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    #[test]
    fn for_range_desugars_into_test_and_back_edge() {
        let function = build_one(indoc! {"
            func count() -> long
                long total = 0
                for i in 0 to 5
                    total += i
                end
                return total
            end
        "});

        let i = sym("i");
        let total = sym("total");

        assert_eq!(
            function.lines,
            vec![
                Line::Declare {
                    name: total,
                    ty: Type::LONG
                },
                Line::Assign {
                    var: total,
                    value: Operand::Literal(0),
                    is_const: false
                },
                Line::Declare { name: i, ty: Type::LONG },
                Line::Assign {
                    var: i,
                    value: Operand::Literal(0),
                    is_const: false
                },
                Line::Label { name: sym("_loop0") },
                Line::Declare {
                    name: sym("$t0"),
                    ty: Type::LONG
                },
                Line::Math {
                    op: MathOp::Sub,
                    dest: sym("$t0"),
                    lhs: Operand::Variable(i),
                    rhs: Some(Operand::Literal(5)),
                },
                Line::If {
                    condition: sym("$t0"),
                    label: sym("_end2"),
                    invert: true
                },
                Line::Destroy { name: sym("$t0") },
                Line::Math {
                    op: MathOp::Add,
                    dest: total,
                    lhs: Operand::Variable(total),
                    rhs: Some(Operand::Variable(i)),
                },
                Line::Math {
                    op: MathOp::Add,
                    dest: i,
                    lhs: Operand::Variable(i),
                    rhs: Some(Operand::Literal(1)),
                },
                Line::Goto { label: sym("_loop0") },
                Line::Label { name: sym("_end2") },
                Line::Destroy { name: i },
                Line::Return {
                    value: Some(Operand::Variable(total))
                },
                Line::Destroy { name: total },
            ]
        );
    }

    #[test]
    fn if_without_else_jumps_to_end() {
        let function = build_one(indoc! {"
            func f(long a) -> long
                if a == 3
                    return 1
                end
                return 0
            end
        "});

        let jump = function
            .lines
            .iter()
            .find_map(|line| match line {
                Line::If { label, invert, .. } => Some((*label, *invert)),
                _ => None,
            })
            .unwrap();

        assert_eq!(jump, (sym("_end1"), true));
        assert!(function.lines.contains(&Line::Math {
            op: MathOp::Inv,
            dest: sym("$t1"),
            lhs: Operand::Variable(sym("$t0")),
            rhs: None,
        }));
    }

    #[test]
    fn precedence_and_associativity() {
        let function = build_one(indoc! {"
            func f(long a, long b) -> long
                long x = a - b - 1 * 2
                return x
            end
        "});

        let ops: Vec<(MathOp, Operand, Option<Operand>)> = function
            .lines
            .iter()
            .filter_map(|line| match line {
                Line::Math { op, lhs, rhs, .. } => Some((*op, *lhs, *rhs)),
                _ => None,
            })
            .collect();

        // (a - b) - (1 * 2)
        assert_eq!(
            ops,
            vec![
                (
                    MathOp::Sub,
                    Operand::Variable(sym("a")),
                    Some(Operand::Variable(sym("b")))
                ),
                (
                    MathOp::Mul,
                    Operand::Literal(1),
                    Some(Operand::Literal(2))
                ),
                (
                    MathOp::Sub,
                    Operand::Variable(sym("$t0")),
                    Some(Operand::Variable(sym("$t1")))
                ),
            ]
        );
    }

    #[test]
    fn greater_than_swaps_operands() {
        let function = build_one(indoc! {"
            func f(long a, long b) -> long
                return a > b
            end
        "});

        assert!(function.lines.contains(&Line::Math {
            op: MathOp::Less,
            dest: sym("$t0"),
            lhs: Operand::Variable(sym("b")),
            rhs: Some(Operand::Variable(sym("a"))),
        }));
    }

    #[test]
    fn member_access() {
        let function = build_one(indoc! {"
            func f(byte[] text) -> long
                long[3] fixed
                long a = fixed.length
                long b = text.length
                byte* p = text.ptr
                return a + b
            end
        "});

        assert!(function.lines.contains(&Line::Assign {
            var: sym("a"),
            value: Operand::Literal(3),
            is_const: true,
        }));
        assert!(function.lines.contains(&Line::Math {
            op: MathOp::LoadAt,
            dest: sym("b"),
            lhs: Operand::Variable(sym("$t0")),
            rhs: Some(Operand::Literal(-1)),
        }));
        assert!(function.lines.contains(&Line::Assign {
            var: sym("p"),
            value: Operand::Variable(sym("text")),
            is_const: false,
        }));
    }

    #[test]
    fn semantic_errors() {
        let cases = [
            ("func f()\n x = 1\nend\n", "undeclared"),
            ("func f()\n g()\nend\n", "unresolved"),
            ("func f()\n break\nend\n", "break"),
            ("func f()\n long x\n long x\nend\n", "duplicate"),
            ("func f(long a)\n long b = a.length\nend\n", "member"),
            ("func f()\n while 1\n if 1\n else\n break\n end\n else\n break\n end\nend\n", "break"),
            ("func g()\nend\nfunc f()\n long x = g()\nend\n", "void"),
            ("func g(long a)\nend\nfunc f()\n g(1, 2)\nend\n", "arguments"),
        ];

        for (source, kind) in cases {
            let module = build(source);
            let error = module.errors.first().unwrap_or_else(|| panic!("{source}"));

            let matches = match kind {
                "undeclared" => matches!(error, CompileError::UndeclaredVariable { .. }),
                "unresolved" => matches!(error, CompileError::UnresolvedFunction { .. }),
                "break" => matches!(error, CompileError::BreakOutsideLoop { .. }),
                "duplicate" => matches!(error, CompileError::DuplicateDeclaration { .. }),
                "member" => matches!(error, CompileError::InvalidMember { .. }),
                "void" => matches!(error, CompileError::VoidValue { .. }),
                "arguments" => matches!(error, CompileError::ArgumentCount { .. }),
                _ => false,
            };

            assert!(matches, "{source}: {error:?}");
        }
    }

    #[test]
    fn one_bad_function_does_not_stop_the_others() {
        let module = build(indoc! {"
            func bad()
                y = 1
            end

            func good() -> long
                return 1
            end
        "});

        assert_eq!(module.errors.len(), 1);
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.functions[0].name, sym("good"));
    }

    #[test]
    fn break_in_loop_else_targets_outer_loop() {
        let function = build_one(indoc! {"
            func f()
                while 1
                    while 0
                    else
                        break
                    end
                end
            end
        "});

        // The outer loop is allocated labels 0-2, the inner 3-5
        assert!(function.lines.contains(&Line::Goto { label: sym("_end2") }));
        assert!(function.lines.contains(&Line::Label { name: sym("_else4") }));
    }
}

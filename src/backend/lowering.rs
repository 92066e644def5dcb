//! Instruction selection. Each IR line becomes a short, fixed sequence of
//! instructions over the registers picked by [`regalloc`](super::regalloc).
//!
//! Calls follow a caller-saves convention: every register still needed
//! after the call is pushed before it and popped after. Arguments go in
//! `r0..argc` and the result comes back in `r0`. Operand registers are bound
//! by pushing every source and then popping into the targets, so no move can
//! clobber a value another move still needs.

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::debug;

use crate::{
    backend::{
        assembler::{AsmItem, parse_integer},
        isa::{
            BinaryOperator, Condition, Instruction, Register, Target, Width, set_immediate,
        },
        object::ENTRY_LABEL,
        regalloc::{self, Allocation, AllocationError},
    },
    frontend::intern::Symbol,
    middle::{
        ir::{AsmBinding, Function, Line, MathOp, Operand, builder::SYSCALL_BUILTIN},
        ty::Type,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoweringError {
    #[error("`{variable}` is used in `{function}` but never declared")]
    UndeclaredVariable { function: Symbol, variable: Symbol },
    #[error("`{function}` assigns to the literal `{variable}`")]
    AssignToLiteral { function: Symbol, variable: Symbol },
    #[error("inline assembly in `{function}`: {message}")]
    InlineAssembly { function: Symbol, message: String },
    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

/// Where fixed-size arrays live relative to the stack pointer after the
/// prologue. Each array is preceded by a long holding its length.
#[derive(Debug, Default)]
struct Frame {
    /// line of the `Declare` -> offset of its length header and length
    slots: HashMap<usize, (u64, u64)>,
    size: u64,
}

impl Frame {
    fn new(function: &Function) -> Self {
        let mut frame = Frame::default();

        for (index, line) in function.lines.iter().enumerate() {
            let Line::Declare {
                ty: ty @ Type::FixedArray { length, .. },
                ..
            } = line
            else {
                continue;
            };

            let bytes = length * ty.element_size().unwrap_or(8);
            frame.slots.insert(index, (frame.size, *length));
            frame.size += 8 + bytes.next_multiple_of(8);
        }

        frame
    }
}

/// The label of an IR label inside `function`
pub fn local_label(function: Symbol, label: Symbol) -> Symbol {
    Symbol::new(&format!("{function}.{label}"))
}

/// `_start`: calls `main` and exits with its return value
pub fn entry_stub() -> Vec<AsmItem> {
    let mut items = vec![AsmItem::Label(Symbol::new(ENTRY_LABEL))];
    items.extend(
        [
            Instruction::Call {
                target: Target::Label(Symbol::new("main")),
            },
            Instruction::Move {
                destination: register(1),
                source: Register::RETURN,
            },
            set_immediate(Register::RETURN, 0),
            Instruction::Syscall,
        ]
        .map(AsmItem::Instruction),
    );
    items
}

fn register(index: u8) -> Register {
    Register::new(index).unwrap_or(Register::RETURN)
}

struct LoweringContext<'f> {
    function: &'f Function,
    allocation: Allocation,
    declared: HashSet<Symbol>,
    frame: Frame,
    items: Vec<AsmItem>,
    asm_blocks: usize,
}

impl<'f> LoweringContext<'f> {
    fn push_instruction(&mut self, instruction: Instruction) {
        self.items.push(AsmItem::Instruction(instruction));
    }

    fn push_label(&mut self, label: Symbol) {
        self.items.push(AsmItem::Label(label));
    }

    fn register_of(&self, variable: Symbol) -> Result<Register, LoweringError> {
        if !self.declared.contains(&variable) {
            return Err(LoweringError::UndeclaredVariable {
                function: self.function.name,
                variable,
            });
        }

        self.allocation
            .register(variable)
            .ok_or(LoweringError::UndeclaredVariable {
                function: self.function.name,
                variable,
            })
    }

    fn destination(&self, variable: Symbol) -> Result<Register, LoweringError> {
        if parse_integer(variable.value()).is_some() {
            return Err(LoweringError::AssignToLiteral {
                function: self.function.name,
                variable,
            });
        }

        self.register_of(variable)
    }

    /// The register holding `operand`, loading literals into `scratch`
    /// unless they were hoisted
    fn operand(&mut self, operand: Operand, scratch: Register) -> Result<Register, LoweringError> {
        match operand {
            Operand::Variable(name) => self.register_of(name),
            Operand::Literal(value) => Ok(match self.allocation.constant(value) {
                Some(register) => register,
                None => {
                    self.push_instruction(set_immediate(scratch, value));
                    scratch
                }
            }),
        }
    }

    /// Element width of `array` as declared where line `index` sees it
    fn width_of(&self, array: Operand, index: usize) -> Width {
        array
            .variable()
            .and_then(|name| self.function.variable_type_at(name, index))
            .and_then(Type::element_size)
            .and_then(Width::from_size)
            .unwrap_or(Width::Long)
    }

    fn label(&self, label: Symbol) -> Target {
        Target::Label(local_label(self.function.name, label))
    }

    fn prologue(&mut self) {
        self.push_label(self.function.name);

        if self.frame.size > 0 {
            self.push_instruction(set_immediate(Register::SCRATCH_0, self.frame.size as i64));
            self.push_instruction(Instruction::Binary {
                operator: BinaryOperator::Sub,
                destination: Register::STACK_POINTER,
                lhs: Register::STACK_POINTER,
                rhs: Register::SCRATCH_0,
            });
        }

        let constants: Vec<(i64, Register)> = self
            .allocation
            .constants
            .iter()
            .map(|(&value, &register)| (value, register))
            .sorted_by_key(|&(_, register)| register)
            .collect();

        for (value, register) in constants {
            self.push_instruction(set_immediate(register, value));
        }
    }

    fn epilogue(&mut self) {
        if self.frame.size > 0 {
            self.push_instruction(set_immediate(Register::SCRATCH_0, self.frame.size as i64));
            self.push_instruction(Instruction::Binary {
                operator: BinaryOperator::Add,
                destination: Register::STACK_POINTER,
                lhs: Register::STACK_POINTER,
                rhs: Register::SCRATCH_0,
            });
        }

        self.push_instruction(Instruction::Return);
    }

    /// Moves every `(source, target)` pair at once
    fn bind(&mut self, moves: &[(Register, Register)]) {
        let moves: Vec<_> = moves.iter().filter(|(s, t)| s != t).copied().collect();

        for &(source, _) in &moves {
            self.push_instruction(Instruction::Push(source));
        }
        for &(_, target) in moves.iter().rev() {
            self.push_instruction(Instruction::Pop(target));
        }
    }

    fn lower_line(&mut self, index: usize, line: &Line) -> Result<(), LoweringError> {
        match line {
            Line::Assign { var, value, .. } => {
                let destination = self.destination(*var)?;

                match value {
                    Operand::Variable(source) => {
                        let source = self.register_of(*source)?;
                        self.push_instruction(Instruction::Move {
                            destination,
                            source,
                        });
                    }
                    Operand::Literal(value) => match self.allocation.constant(*value) {
                        Some(source) => self.push_instruction(Instruction::Move {
                            destination,
                            source,
                        }),
                        None => self.push_instruction(set_immediate(destination, *value)),
                    },
                }
            }
            Line::Declare { name, .. } => {
                if let Some(&(offset, length)) = self.frame.slots.get(&index) {
                    let array = self.destination(*name)?;

                    self.push_instruction(Instruction::Move {
                        destination: array,
                        source: Register::STACK_POINTER,
                    });
                    self.push_instruction(set_immediate(Register::SCRATCH_0, offset as i64 + 8));
                    self.push_instruction(Instruction::Binary {
                        operator: BinaryOperator::Add,
                        destination: array,
                        lhs: array,
                        rhs: Register::SCRATCH_0,
                    });
                    self.push_instruction(set_immediate(Register::SCRATCH_0, length as i64));
                    self.push_instruction(set_immediate(Register::SCRATCH_1, -1));
                    self.push_instruction(Instruction::StoreAt {
                        width: Width::Long,
                        base: array,
                        index: Register::SCRATCH_1,
                        source: Register::SCRATCH_0,
                    });
                }
            }
            Line::Destroy { .. } => {}
            Line::Call {
                result,
                function,
                args,
            } => self.lower_call(index, *result, *function, args)?,
            Line::Goto { label } => {
                let target = self.label(*label);
                self.push_instruction(Instruction::Jump {
                    condition: Condition::Always,
                    target,
                });
            }
            Line::If {
                condition,
                label,
                invert,
            } => {
                let register = self.register_of(*condition)?;
                let target = self.label(*label);

                self.push_instruction(Instruction::Jump {
                    condition: if *invert {
                        Condition::Zero(register)
                    } else {
                        Condition::NotZero(register)
                    },
                    target,
                });
            }
            Line::Label { name } => {
                let label = local_label(self.function.name, *name);
                self.push_label(label);
            }
            Line::Math { op, dest, lhs, rhs } => self.lower_math(index, *op, *dest, *lhs, *rhs)?,
            Line::Return { value } => {
                match value {
                    Some(Operand::Variable(name)) => {
                        let source = self.register_of(*name)?;
                        self.push_instruction(Instruction::Move {
                            destination: Register::RETURN,
                            source,
                        });
                    }
                    Some(Operand::Literal(value)) => {
                        self.push_instruction(set_immediate(Register::RETURN, *value));
                    }
                    None => {}
                }

                self.epilogue();
            }
            Line::Store {
                array,
                index: offset,
                value,
            } => {
                let width = self.width_of(Operand::Variable(*array), index);
                let base = self.register_of(*array)?;
                let offset = self.operand(*offset, Register::SCRATCH_0)?;
                let source = self.operand(*value, Register::SCRATCH_1)?;

                self.push_instruction(Instruction::StoreAt {
                    width,
                    base,
                    index: offset,
                    source,
                });
            }
            Line::InlineAsm {
                inputs,
                outputs,
                items,
            } => self.lower_inline_asm(index, inputs, outputs, items)?,
        }

        Ok(())
    }

    fn lower_math(
        &mut self,
        index: usize,
        op: MathOp,
        dest: Symbol,
        lhs: Operand,
        rhs: Option<Operand>,
    ) -> Result<(), LoweringError> {
        let destination = self.destination(dest)?;

        if let Some(operator) = op.unary_operator() {
            let source = self.operand(lhs, Register::SCRATCH_0)?;
            self.push_instruction(Instruction::Unary {
                operator,
                destination,
                source,
            });
            return Ok(());
        }

        let rhs = rhs.unwrap_or(Operand::Literal(0));

        if op == MathOp::LoadAt {
            let width = self.width_of(lhs, index);
            let base = self.operand(lhs, Register::SCRATCH_0)?;
            let offset = self.operand(rhs, Register::SCRATCH_1)?;

            self.push_instruction(Instruction::LoadAt {
                width,
                destination,
                base,
                index: offset,
            });
            return Ok(());
        }

        let lhs = self.operand(lhs, Register::SCRATCH_0)?;
        let rhs = self.operand(rhs, Register::SCRATCH_1)?;

        if let Some(operator) = op.binary_operator() {
            self.push_instruction(Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            });
        }

        Ok(())
    }

    fn lower_call(
        &mut self,
        index: usize,
        result: Option<Symbol>,
        function: Symbol,
        args: &[Operand],
    ) -> Result<(), LoweringError> {
        let destination = result.map(|r| self.destination(r)).transpose()?;
        let saved: Vec<Register> = self
            .allocation
            .live_across(index)
            .into_iter()
            .filter(|r| Some(*r) != destination)
            .collect();

        for &register in &saved {
            self.push_instruction(Instruction::Push(register));
        }

        let mut moves = Vec::new();
        let mut literals = Vec::new();
        for (slot, arg) in args.iter().enumerate() {
            let target = register(slot as u8);
            match arg {
                Operand::Variable(name) => moves.push((self.register_of(*name)?, target)),
                Operand::Literal(value) => literals.push((target, *value)),
            }
        }

        self.bind(&moves);
        for (target, value) in literals {
            self.push_instruction(set_immediate(target, value));
        }

        if function.value() == SYSCALL_BUILTIN {
            self.push_instruction(Instruction::Syscall);
        } else {
            self.push_instruction(Instruction::Call {
                target: Target::Label(function),
            });
        }

        if destination.is_some() && !saved.is_empty() {
            self.push_instruction(Instruction::Move {
                destination: Register::SCRATCH_0,
                source: Register::RETURN,
            });
        }

        for &register in saved.iter().rev() {
            self.push_instruction(Instruction::Pop(register));
        }

        if let Some(destination) = destination {
            let source = if saved.is_empty() {
                Register::RETURN
            } else {
                Register::SCRATCH_0
            };
            self.push_instruction(Instruction::Move {
                destination,
                source,
            });
        }

        Ok(())
    }

    fn lower_inline_asm(
        &mut self,
        index: usize,
        inputs: &[AsmBinding],
        outputs: &[AsmBinding],
        items: &[AsmItem],
    ) -> Result<(), LoweringError> {
        let block = self.asm_blocks;
        self.asm_blocks += 1;

        let defined: HashSet<Symbol> = items
            .iter()
            .filter_map(|item| match item {
                AsmItem::Label(label) => Some(*label),
                AsmItem::Instruction(_) => None,
            })
            .collect();

        let qualify = |label: Symbol| {
            if defined.contains(&label) {
                Symbol::new(&format!("{}.asm{block}.{label}", self.function.name))
            } else {
                label
            }
        };

        let items: Vec<AsmItem> = items
            .iter()
            .map(|item| match *item {
                AsmItem::Label(label) => AsmItem::Label(qualify(label)),
                AsmItem::Instruction(instruction) => {
                    AsmItem::Instruction(retarget(instruction, &qualify))
                }
            })
            .collect();

        let instructions = || {
            items.iter().filter_map(|item| match item {
                AsmItem::Instruction(instruction) => Some(instruction),
                AsmItem::Label(_) => None,
            })
        };

        let moves_stack = instructions().any(|i| {
            i.writes().contains(&Register::STACK_POINTER)
                && !matches!(
                    i,
                    Instruction::Push(_) | Instruction::Pop(_) | Instruction::Call { .. }
                )
        });
        if moves_stack {
            return Err(LoweringError::InlineAssembly {
                function: self.function.name,
                message: "the stack pointer can't be written".to_owned(),
            });
        }

        let clobbers_everything = instructions().any(|i| matches!(i, Instruction::Call { .. }));
        let clobbered: HashSet<Register> = instructions()
            .flat_map(Instruction::writes)
            .chain(inputs.iter().chain(outputs).map(|b| b.register))
            .collect();

        let output_registers = outputs
            .iter()
            .map(|b| self.destination(b.variable))
            .collect::<Result<Vec<_>, _>>()?;

        let saved: Vec<Register> = self
            .allocation
            .live_across(index)
            .into_iter()
            .filter(|r| clobbers_everything || clobbered.contains(r))
            .filter(|r| !output_registers.contains(r))
            .collect();

        for &register in &saved {
            self.push_instruction(Instruction::Push(register));
        }

        let moves = inputs
            .iter()
            .map(|b| Ok((self.register_of(b.variable)?, b.register)))
            .collect::<Result<Vec<_>, LoweringError>>()?;
        self.bind(&moves);

        self.items.extend(items.iter().copied());

        let moves: Vec<_> = outputs
            .iter()
            .zip(&output_registers)
            .map(|(b, &variable)| (b.register, variable))
            .collect();
        self.bind(&moves);

        for &register in saved.iter().rev() {
            self.push_instruction(Instruction::Pop(register));
        }

        Ok(())
    }
}

fn retarget(instruction: Instruction, qualify: impl Fn(Symbol) -> Symbol) -> Instruction {
    let relabel = |target: Target| match target {
        Target::Label(label) => Target::Label(qualify(label)),
        address => address,
    };

    match instruction {
        Instruction::Jump { condition, target } => Instruction::Jump {
            condition,
            target: relabel(target),
        },
        Instruction::ShortJump { condition, target } => Instruction::ShortJump {
            condition,
            target: relabel(target),
        },
        Instruction::Call { target } => Instruction::Call {
            target: relabel(target),
        },
        Instruction::Load {
            width,
            destination,
            address,
        } => Instruction::Load {
            width,
            destination,
            address: relabel(address),
        },
        Instruction::Store {
            width,
            address,
            source,
        } => Instruction::Store {
            width,
            address: relabel(address),
            source,
        },
        other => other,
    }
}

/// Lowers one optimized function to labelled instructions
pub fn lower_function(function: &Function) -> Result<Vec<AsmItem>, LoweringError> {
    let allocation = regalloc::allocate(function)?;

    let mut context = LoweringContext {
        function,
        allocation,
        declared: function.variables(),
        frame: Frame::new(function),
        items: Vec::new(),
        asm_blocks: 0,
    };

    context.prologue();

    for (index, line) in function.lines.iter().enumerate() {
        context.lower_line(index, line)?;
    }

    let falls_off_end = !function
        .lines
        .iter()
        .rev()
        .find(|line| !line.is_bookkeeping())
        .is_some_and(Line::is_terminator);
    if falls_off_end {
        context.epilogue();
    }

    debug!(
        "lowered `{}`: {} IR lines -> {} instructions, registers {}",
        function.name,
        function.lines.len(),
        context
            .items
            .iter()
            .filter(|item| matches!(item, AsmItem::Instruction(_)))
            .count(),
        context.allocation.used_registers().iter().join(" ")
    );

    Ok(context.items)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::{
        backend::isa::Opcode,
        frontend::{SourceFile, parser::Parser},
        middle::{
            ir::builder::build_module,
            optimization::{OptimizerFlags, optimize_function},
        },
    };

    fn lower(source: &str, flags: OptimizerFlags) -> Vec<AsmItem> {
        let source = SourceFile::from_memory(source);
        let module = Parser::parse_module(&source).unwrap();
        let mut module = build_module(&module, &source);
        assert_eq!(module.errors, vec![]);

        let mut function = module.functions.remove(0);
        optimize_function(&mut function, flags);
        lower_function(&function).unwrap()
    }

    fn opcodes(items: &[AsmItem]) -> Vec<Opcode> {
        items
            .iter()
            .filter_map(|item| match item {
                AsmItem::Instruction(instruction) => Some(instruction.opcode()),
                AsmItem::Label(_) => None,
            })
            .collect()
    }

    #[test]
    fn division_by_four_is_a_shift() {
        let items = lower(
            indoc! {"
                func f(long y) -> long
                    long x = y / 4
                    return x
                end
            "},
            OptimizerFlags::default(),
        );

        let opcodes = opcodes(&items);
        assert!(opcodes.contains(&Opcode::RightShift));
        assert!(!opcodes.contains(&Opcode::Div));
    }

    #[test]
    fn calls_save_live_registers() {
        let items = lower(
            indoc! {"
                func f(long a) -> long
                    long b = g(1)
                    return a + b
                end

                extern func g(long x) -> long
            "},
            OptimizerFlags::none(),
        );

        let text: Vec<String> = items
            .iter()
            .map(|item| strip_ansi_escapes::strip_str(item.to_string()).trim().to_owned())
            .collect();

        let call = text.iter().position(|t| t == "call @g").unwrap();
        assert_eq!(text[call - 2], "push r0");
        assert_eq!(text[call - 1], "setb r0, 1");
        assert_eq!(text[call + 1], "mov r29, r0");
        assert_eq!(text[call + 2], "pop r0");
    }

    #[test]
    fn labels_are_local_to_the_function() {
        let items = lower(
            indoc! {"
                func f(long a) -> long
                    while a
                        a -= 1
                    end
                    return a
                end
            "},
            OptimizerFlags::none(),
        );

        assert_eq!(items[0], AsmItem::Label(Symbol::new("f")));
        assert!(items.contains(&AsmItem::Label(Symbol::new("f._loop0"))));
    }

    #[test]
    fn fixed_arrays_get_frame_space() {
        let items = lower(
            indoc! {"
                func f() -> long
                    long[3] xs
                    xs[1] = 5
                    return xs.length
                end
            "},
            OptimizerFlags::none(),
        );

        let opcodes = opcodes(&items);
        assert_eq!(opcodes[..2], [Opcode::SetByte, Opcode::Sub]);
        assert!(opcodes.contains(&Opcode::StoreLongAt));
        assert_eq!(opcodes[opcodes.len() - 3..], [Opcode::SetByte, Opcode::Add, Opcode::Return]);
    }

    #[test]
    fn redeclared_arrays_keep_their_own_width() {
        let items = lower(
            indoc! {"
                func f(long c) -> long
                    long total = 0
                    if c
                        byte[2] buf
                        buf[0] = 1
                        total += buf[0]
                    end
                    if c
                        long[2] buf
                        buf[0] = 1000
                        total += buf[0]
                    end
                    return total
                end
            "},
            OptimizerFlags::none(),
        );

        let opcodes = opcodes(&items);
        let count = |opcode| opcodes.iter().filter(|&&op| op == opcode).count();
        // two length headers and the element of the long array
        assert_eq!(count(Opcode::StoreLongAt), 3);
        assert_eq!(count(Opcode::StoreByteAt), 1);
        assert!(opcodes.contains(&Opcode::LoadByteAt));
        assert!(opcodes.contains(&Opcode::LoadLongAt));
    }

    #[test]
    fn inline_assembly_labels_are_qualified() {
        let items = lower(
            indoc! {r#"
                func f(long a) -> long
                    long out
                    asm [a:r1] -> [out:r2] "top: sub r1, r1, r1; jnz r1, @top; mov r2, r1"
                    return out
                end
            "#},
            OptimizerFlags::none(),
        );

        let label = Symbol::new("f.asm0.top");
        assert!(items.contains(&AsmItem::Label(label)));
        assert!(items.iter().any(|item| matches!(
            item,
            AsmItem::Instruction(Instruction::Jump {
                target: Target::Label(l),
                ..
            }) if *l == label
        )));
    }
}

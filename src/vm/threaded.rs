//! Threaded execution. Before running, the code reachable from the entry
//! point is translated into a stream of 32-bit words:
//!
//! ```text
//!  31            16 15 14    10 9      5 4      0
//! +----------------+--+--------+--------+--------+
//! | handler index  |  |   a    |   b    |   c    |
//! +----------------+--+--------+--------+--------+
//! ```
//!
//! followed by two words (high, low) for every 8-byte immediate. Jump
//! targets are rewritten to word indices, so short and long jumps end up
//! the same. Each word is then executed by looking its handler up in a
//! table of function pointers.
//!
//! Return addresses on the stack stay byte addresses so memory looks the
//! same as under direct execution. A return to an address that wasn't
//! translated yet translates the code reachable from there on the spot.
//! Code that rewrites itself is not picked up after translation.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use log::{debug, trace};
use paste::paste;
use strum::{FromRepr, IntoStaticStr};

use crate::backend::isa::{BinaryOperator, Condition, Instruction, Register, UnaryOperator, Width};

use super::{Machine, SyscallHost, VmError, VmExit, decode_at, target_address};

type Handler<H> = fn(&mut Machine<H>, &mut Cursor<'_>, u32) -> Result<Option<VmExit>, VmError>;

fn a(word: u32) -> usize {
    ((word >> 10) & 31) as usize
}

fn b(word: u32) -> usize {
    ((word >> 5) & 31) as usize
}

fn c(word: u32) -> usize {
    (word & 31) as usize
}

fn handler_index(word: u32) -> u16 {
    (word >> 16) as u16
}

macro_rules! handlers {
    ($($name:ident),* $(,)?) => {
        paste! {
            #[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
            #[repr(u16)]
            enum Op {
                $([<$name:camel>]),*
            }

            fn dispatch_table<H: SyscallHost>() -> Vec<Handler<H>> {
                vec![$([<op_ $name>]::<H> as Handler<H>),*]
            }
        }
    };
}

handlers! {
    jump, jump_if_zero, jump_if_not_zero, jump_if_positive, jump_if_non_negative,
    fallthrough, call, ret,
    load_long, load_int, load_short, load_byte,
    load_long_at, load_int_at, load_short_at, load_byte_at,
    store_long, store_int, store_short, store_byte,
    store_long_at, store_int_at, store_short_at, store_byte_at,
    push, pop, mov, set,
    add, sub, mul, div, mod, rem, left_shift, right_shift, left_rotate, right_rotate,
    and, or, xor, less, less_or_equal,
    not, inv, syscall, trap,
}

macro_rules! jump_handlers {
    ($($name:ident => |$value:ident| $taken:expr),* $(,)?) => {
        paste! {
            $(
                fn [<op_ $name>]<H: SyscallHost>(
                    machine: &mut Machine<H>,
                    cursor: &mut Cursor<'_>,
                    word: u32,
                ) -> Result<Option<VmExit>, VmError> {
                    let target = cursor.immediate();
                    let $value = machine.registers[a(word)];
                    if $taken {
                        cursor.pc = target as usize;
                    }
                    Ok(None)
                }
            )*
        }
    };
}

jump_handlers! {
    jump => |_value| true,
    fallthrough => |_value| true,
    jump_if_zero => |value| value == 0,
    jump_if_not_zero => |value| value != 0,
    jump_if_positive => |value| value > 0,
    jump_if_non_negative => |value| value >= 0,
}

macro_rules! memory_handlers {
    ($($width:ident),* $(,)?) => {
        paste! {
            $(
                fn [<op_load_ $width:lower>]<H: SyscallHost>(
                    machine: &mut Machine<H>,
                    cursor: &mut Cursor<'_>,
                    word: u32,
                ) -> Result<Option<VmExit>, VmError> {
                    let address = cursor.immediate() as u64;
                    machine.registers[a(word)] = machine.read(address, Width::$width)?;
                    Ok(None)
                }

                fn [<op_load_ $width:lower _at>]<H: SyscallHost>(
                    machine: &mut Machine<H>,
                    _: &mut Cursor<'_>,
                    word: u32,
                ) -> Result<Option<VmExit>, VmError> {
                    let address = indexed(machine, b(word), c(word), Width::$width);
                    machine.registers[a(word)] = machine.read(address, Width::$width)?;
                    Ok(None)
                }

                fn [<op_store_ $width:lower>]<H: SyscallHost>(
                    machine: &mut Machine<H>,
                    cursor: &mut Cursor<'_>,
                    word: u32,
                ) -> Result<Option<VmExit>, VmError> {
                    let address = cursor.immediate() as u64;
                    machine.write(address, Width::$width, machine.registers[a(word)])?;
                    Ok(None)
                }

                fn [<op_store_ $width:lower _at>]<H: SyscallHost>(
                    machine: &mut Machine<H>,
                    _: &mut Cursor<'_>,
                    word: u32,
                ) -> Result<Option<VmExit>, VmError> {
                    let address = indexed(machine, a(word), b(word), Width::$width);
                    machine.write(address, Width::$width, machine.registers[c(word)])?;
                    Ok(None)
                }
            )*

            fn load_op(width: Width) -> Op {
                match width {
                    $(Width::$width => Op::[<Load $width>],)*
                }
            }

            fn load_at_op(width: Width) -> Op {
                match width {
                    $(Width::$width => Op::[<Load $width At>],)*
                }
            }

            fn store_op(width: Width) -> Op {
                match width {
                    $(Width::$width => Op::[<Store $width>],)*
                }
            }

            fn store_at_op(width: Width) -> Op {
                match width {
                    $(Width::$width => Op::[<Store $width At>],)*
                }
            }
        }
    };
}

memory_handlers!(Long, Int, Short, Byte);

macro_rules! binary_handlers {
    ($($operator:ident),* $(,)?) => {
        paste! {
            $(
                fn [<op_ $operator:snake>]<H: SyscallHost>(
                    machine: &mut Machine<H>,
                    _: &mut Cursor<'_>,
                    word: u32,
                ) -> Result<Option<VmExit>, VmError> {
                    machine.registers[a(word)] = BinaryOperator::$operator
                        .evaluate(machine.registers[b(word)], machine.registers[c(word)])
                        .ok_or(VmError::DivisionByZero)?;
                    Ok(None)
                }
            )*

            fn binary_op(operator: BinaryOperator) -> Op {
                match operator {
                    $(BinaryOperator::$operator => Op::$operator,)*
                }
            }
        }
    };
}

binary_handlers!(
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Rem,
    LeftShift,
    RightShift,
    LeftRotate,
    RightRotate,
    And,
    Or,
    Xor,
    Less,
    LessOrEqual,
);

fn indexed<H>(machine: &Machine<H>, base: usize, index: usize, width: Width) -> u64 {
    machine.registers[base]
        .wrapping_add(machine.registers[index].wrapping_mul(width.bytes() as i64)) as u64
}

fn op_call<H: SyscallHost>(
    machine: &mut Machine<H>,
    cursor: &mut Cursor<'_>,
    _: u32,
) -> Result<Option<VmExit>, VmError> {
    let target = cursor.immediate();
    let return_address = cursor.immediate();
    machine.push_value(return_address)?;
    cursor.pc = target as usize;
    Ok(None)
}

fn op_ret<H: SyscallHost>(
    machine: &mut Machine<H>,
    cursor: &mut Cursor<'_>,
    _: u32,
) -> Result<Option<VmExit>, VmError> {
    let address = machine.pop_value()? as u64;
    cursor.pc = match cursor.program.entries.get(&address) {
        Some(&index) => index,
        None => cursor.program.extend(&machine.memory, address),
    } as usize;
    Ok(None)
}

fn op_push<H: SyscallHost>(
    machine: &mut Machine<H>,
    _: &mut Cursor<'_>,
    word: u32,
) -> Result<Option<VmExit>, VmError> {
    machine.push_value(machine.registers[a(word)])?;
    Ok(None)
}

fn op_pop<H: SyscallHost>(
    machine: &mut Machine<H>,
    _: &mut Cursor<'_>,
    word: u32,
) -> Result<Option<VmExit>, VmError> {
    let value = machine.pop_value()?;
    machine.registers[a(word)] = value;
    Ok(None)
}

fn op_mov<H: SyscallHost>(
    machine: &mut Machine<H>,
    _: &mut Cursor<'_>,
    word: u32,
) -> Result<Option<VmExit>, VmError> {
    machine.registers[a(word)] = machine.registers[b(word)];
    Ok(None)
}

fn op_set<H: SyscallHost>(
    machine: &mut Machine<H>,
    cursor: &mut Cursor<'_>,
    word: u32,
) -> Result<Option<VmExit>, VmError> {
    machine.registers[a(word)] = cursor.immediate();
    Ok(None)
}

fn op_not<H: SyscallHost>(
    machine: &mut Machine<H>,
    _: &mut Cursor<'_>,
    word: u32,
) -> Result<Option<VmExit>, VmError> {
    machine.registers[a(word)] = UnaryOperator::Not.evaluate(machine.registers[b(word)]);
    Ok(None)
}

fn op_inv<H: SyscallHost>(
    machine: &mut Machine<H>,
    _: &mut Cursor<'_>,
    word: u32,
) -> Result<Option<VmExit>, VmError> {
    machine.registers[a(word)] = UnaryOperator::Inv.evaluate(machine.registers[b(word)]);
    Ok(None)
}

fn op_syscall<H: SyscallHost>(
    machine: &mut Machine<H>,
    _: &mut Cursor<'_>,
    _: u32,
) -> Result<Option<VmExit>, VmError> {
    machine.syscall()
}

/// Raises the fault recorded for code that didn't translate
fn op_trap<H: SyscallHost>(
    _: &mut Machine<H>,
    cursor: &mut Cursor<'_>,
    _: u32,
) -> Result<Option<VmExit>, VmError> {
    let index = cursor.immediate() as usize;
    Err(cursor.program.traps[index].clone())
}

struct Cursor<'a> {
    program: &'a mut Program,
    pc: usize,
}

impl Cursor<'_> {
    fn next_word(&mut self) -> u32 {
        let word = self.program.words[self.pc];
        self.pc += 1;
        word
    }

    fn immediate(&mut self) -> i64 {
        let high = u64::from(self.next_word());
        let low = u64::from(self.next_word());
        ((high << 32) | low) as i64
    }
}

#[derive(Debug, Default)]
struct Program {
    words: Vec<u32>,
    /// Word index of every translated byte address
    entries: HashMap<u64, u32>,
    traps: Vec<VmError>,
}

/// A jump immediate that still holds a byte address
struct Patch {
    slot: usize,
    target: u64,
}

impl Program {
    fn translate(memory: &[u8], entry: u64) -> Self {
        let mut program = Program::default();
        program.extend(memory, entry);
        program
    }

    /// Appends the code reachable from `entry` that isn't translated yet and
    /// returns the word index of `entry`
    fn extend(&mut self, memory: &[u8], entry: u64) -> u32 {
        let mut decoded = BTreeMap::new();
        let mut worklist = vec![entry];

        while let Some(address) = worklist.pop() {
            if self.entries.contains_key(&address) || decoded.contains_key(&address) {
                continue;
            }

            let result = decode_at(memory, address);
            if let Ok((instruction, len)) = &result {
                if !instruction.is_terminator() {
                    worklist.push(address + *len as u64);
                }
                if let Some(target) = instruction.target() {
                    worklist.push(target_address(target));
                }
            }
            decoded.insert(address, result);
        }

        let mut patches = Vec::new();
        let mut falls_to = None;
        let translated = decoded.len();

        for (address, result) in decoded {
            if let Some(next) = falls_to.take().filter(|next| *next != address) {
                self.jump(Op::Fallthrough, &[], next, &mut patches);
            }
            self.entries.insert(address, self.words.len() as u32);

            match result {
                Ok((instruction, len)) => {
                    let next = address + len as u64;
                    self.emit(instruction, next, &mut patches);
                    falls_to = (!instruction.is_terminator()).then_some(next);
                }
                Err(error) => {
                    self.word(Op::Trap, &[]);
                    self.immediate(self.traps.len() as i64);
                    self.traps.push(error);
                }
            }
        }

        // the last instruction can fall into code translated earlier
        if let Some(next) = falls_to {
            self.jump(Op::Fallthrough, &[], next, &mut patches);
        }

        for Patch { slot, target } in patches {
            let index = self.entries[&target];
            self.words[slot] = 0;
            self.words[slot + 1] = index;
        }

        debug!(
            "translated {translated} instructions from {entry:#x}, {} words in total",
            self.words.len()
        );
        self.entries[&entry]
    }

    fn word(&mut self, op: Op, registers: &[Register]) {
        let mut word = (op as u32) << 16;
        for (register, shift) in registers.iter().zip([10, 5, 0]) {
            word |= (register.as_u8() as u32) << shift;
        }
        self.words.push(word);
    }

    fn immediate(&mut self, value: i64) {
        let value = value as u64;
        self.words.push((value >> 32) as u32);
        self.words.push(value as u32);
    }

    fn jump(&mut self, op: Op, registers: &[Register], target: u64, patches: &mut Vec<Patch>) {
        self.word(op, registers);
        patches.push(Patch {
            slot: self.words.len(),
            target,
        });
        self.immediate(0);
    }

    fn conditional_jump(&mut self, condition: Condition, target: u64, patches: &mut Vec<Patch>) {
        let (op, register) = match condition {
            Condition::Always => (Op::Jump, None),
            Condition::Zero(r) => (Op::JumpIfZero, Some(r)),
            Condition::NotZero(r) => (Op::JumpIfNotZero, Some(r)),
            Condition::Positive(r) => (Op::JumpIfPositive, Some(r)),
            Condition::NonNegative(r) => (Op::JumpIfNonNegative, Some(r)),
        };

        self.jump(op, register.as_slice(), target, patches);
    }

    fn emit(&mut self, instruction: Instruction, next: u64, patches: &mut Vec<Patch>) {
        match instruction {
            Instruction::Jump { condition, target } => {
                self.conditional_jump(condition, target_address(target), patches)
            }
            Instruction::ShortJump { condition, target } => {
                self.conditional_jump(condition.into(), target_address(target), patches)
            }
            Instruction::Call { target } => {
                self.jump(Op::Call, &[], target_address(target), patches);
                self.immediate(next as i64);
            }
            Instruction::Return => self.word(Op::Ret, &[]),
            Instruction::Load {
                width,
                destination,
                address,
            } => {
                self.word(load_op(width), &[destination]);
                self.immediate(target_address(address) as i64);
            }
            Instruction::LoadAt {
                width,
                destination,
                base,
                index,
            } => self.word(load_at_op(width), &[destination, base, index]),
            Instruction::Store {
                width,
                address,
                source,
            } => {
                self.word(store_op(width), &[source]);
                self.immediate(target_address(address) as i64);
            }
            Instruction::StoreAt {
                width,
                base,
                index,
                source,
            } => self.word(store_at_op(width), &[base, index, source]),
            Instruction::Push(register) => self.word(Op::Push, &[register]),
            Instruction::Pop(register) => self.word(Op::Pop, &[register]),
            Instruction::Move {
                destination,
                source,
            } => self.word(Op::Mov, &[destination, source]),
            Instruction::SetImmediate {
                destination, value, ..
            } => {
                self.word(Op::Set, &[destination]);
                self.immediate(value);
            }
            Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => self.word(binary_op(operator), &[destination, lhs, rhs]),
            Instruction::Unary {
                operator,
                destination,
                source,
            } => {
                let op = match operator {
                    UnaryOperator::Not => Op::Not,
                    UnaryOperator::Inv => Op::Inv,
                };
                self.word(op, &[destination, source]);
            }
            Instruction::Syscall => self.word(Op::Syscall, &[]),
        }
    }
}

impl<H: SyscallHost> Machine<H> {
    pub(super) fn run_threaded(&mut self) -> Result<VmExit, VmError> {
        let mut program = Program::translate(&self.memory, self.ip);
        let table = dispatch_table::<H>();

        let pc = program.entries[&self.ip] as usize;
        let mut cursor = Cursor {
            program: &mut program,
            pc,
        };

        loop {
            let pc = cursor.pc;
            let word = cursor.next_word();
            let index = handler_index(word);

            if index != Op::Fallthrough as u16 {
                self.count_step()?;
            }
            trace!(
                "{pc:#06x}: {}",
                Op::from_repr(index).map_or("?", <&str>::from)
            );

            if let Some(exit) = table[usize::from(index)](self, &mut cursor, word)? {
                return Ok(exit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::{formatdoc, indoc};

    use super::*;
    use crate::{
        frontend::intern::Symbol,
        vm::{CaptureHost, Strategy, VmConfig, run_executable, tests::executable},
    };

    fn run_both(text: &str) -> [(Result<VmExit, VmError>, u64, [i64; Register::COUNT]); 2] {
        [Strategy::Direct, Strategy::Threaded].map(|strategy| {
            let config = VmConfig {
                strategy,
                max_steps: Some(100_000),
                ..VmConfig::default()
            };
            let mut machine = Machine::new(config, CaptureHost::default());
            machine.load(&executable(text)).unwrap();
            let result = machine.run();
            (result, machine.steps(), machine.registers)
        })
    }

    #[test]
    fn table_covers_every_op() {
        let table = dispatch_table::<CaptureHost>();
        assert_eq!(table.len(), Op::Trap as usize + 1);
        assert_eq!(Op::from_repr(Op::Fallthrough as u16), Some(Op::Fallthrough));
    }

    #[test]
    fn same_steps_and_registers_as_direct() {
        let program = indoc! {"
            _start:
                setb r1, 10
                setb r2, 0
                setb r3, 1
            top:
                jzs r1, @out
                call @accumulate
                sub r1, r1, r3
                jmp @top
            out:
                sets r4, 0x3000
                storel 0x3000, r2
                loadiat r5, r4, r3
                loads r6, 0x3006
                not r7, r2
                inv r8, r2
                mov r1, r2
                setb r0, 0
                syscall
            accumulate:
                push r1
                mul r1, r1, r1
                add r2, r2, r1
                pop r1
                ret
        "};

        let [direct, threaded] = run_both(program);
        assert_eq!(direct.0, Ok(VmExit::Exited(385)));
        assert_eq!(direct, threaded);
    }

    #[test]
    fn unreachable_garbage_is_not_translated() {
        let mut executable = executable("_start:\n setb r1, 3; setb r0, 0; syscall");
        executable.code.extend([0xEE, 0xFF]);

        let config = VmConfig {
            strategy: Strategy::Threaded,
            ..VmConfig::default()
        };
        let (exit, _) = run_executable(&executable, config, CaptureHost::default()).unwrap();
        assert_eq!(exit, VmExit::Exited(3));
    }

    #[test]
    fn returning_into_an_instruction() {
        // the linker's `jmp @_start` occupies bytes 0..9
        let program = "_start:\n setb r1, 3; push r1; ret";

        let [direct, threaded] = run_both(program);
        assert!(matches!(direct.0, Err(VmError::InvalidOpcode { address: 3, .. })));
        assert_eq!(direct, threaded);
    }

    #[test]
    fn returning_to_untranslated_code() {
        // `ret` lands on `done`, which no jump or call leads to
        let program = |done: u64| {
            formatdoc! {"
                _start:
                    setl r2, {done}
                    push r2
                    ret
                    setb r1, 1
                done:
                    setb r1, 7
                    setb r0, 0
                    syscall
            "}
        };

        let done = executable(&program(0))
            .labels()
            .iter()
            .find(|(label, _)| *label == Symbol::new("done"))
            .map(|&(_, position)| position)
            .unwrap();

        let [direct, threaded] = run_both(&program(done));
        assert_eq!(direct.0, Ok(VmExit::Exited(7)));
        assert_eq!(direct, threaded);
    }

    #[test]
    fn words_pack_registers() {
        let mut program = Program::default();
        let r = |n| Register::new(n).unwrap();
        program.word(Op::Add, &[r(1), r(2), r(31)]);

        let word = program.words[0];
        assert_eq!(handler_index(word), Op::Add as u16);
        assert_eq!((a(word), b(word), c(word)), (1, 2, 31));
    }
}

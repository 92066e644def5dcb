use log::trace;

use crate::backend::isa::{Condition, Instruction};

use super::{Machine, SyscallHost, VmError, VmExit, decode_at, target_address as address};

impl<H: SyscallHost> Machine<H> {
    /// Decodes and executes one instruction at a time straight from memory
    pub(super) fn run_direct(&mut self) -> Result<VmExit, VmError> {
        loop {
            self.count_step()?;

            let ip = self.ip;
            let (instruction, len) = decode_at(&self.memory, ip)?;
            trace!("{ip:#08x}: {instruction}");

            self.ip = ip + len as u64;
            if let Some(exit) = self.execute(instruction)? {
                return Ok(exit);
            }
        }
    }

    fn execute(&mut self, instruction: Instruction) -> Result<Option<VmExit>, VmError> {
        match instruction {
            Instruction::Jump { condition, target } => {
                if condition.holds(&self.registers) {
                    self.ip = address(target);
                }
            }
            Instruction::ShortJump { condition, target } => {
                if Condition::from(condition).holds(&self.registers) {
                    self.ip = address(target);
                }
            }
            Instruction::Call { target } => {
                self.push_value(self.ip as i64)?;
                self.ip = address(target);
            }
            Instruction::Return => self.ip = self.pop_value()? as u64,
            Instruction::Load {
                width,
                destination,
                address: target,
            } => self.registers[destination.index()] = self.read(address(target), width)?,
            Instruction::LoadAt {
                width,
                destination,
                base,
                index,
            } => {
                let address = self.indexed(base, index, width);
                self.registers[destination.index()] = self.read(address, width)?;
            }
            Instruction::Store {
                width,
                address: target,
                source,
            } => self.write(address(target), width, self.register(source))?,
            Instruction::StoreAt {
                width,
                base,
                index,
                source,
            } => {
                let address = self.indexed(base, index, width);
                self.write(address, width, self.register(source))?;
            }
            Instruction::Push(register) => self.push_value(self.register(register))?,
            Instruction::Pop(register) => {
                let value = self.pop_value()?;
                self.registers[register.index()] = value;
            }
            Instruction::Move {
                destination,
                source,
            } => self.registers[destination.index()] = self.register(source),
            Instruction::SetImmediate {
                destination, value, ..
            } => self.registers[destination.index()] = value,
            Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => self.binary(operator, destination, lhs, rhs)?,
            Instruction::Unary {
                operator,
                destination,
                source,
            } => self.registers[destination.index()] = operator.evaluate(self.register(source)),
            Instruction::Syscall => return self.syscall(),
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::{
        backend::isa::Register,
        vm::{Strategy, VmExit, tests::run},
    };

    #[test]
    fn calls_return_past_the_call() {
        let program = indoc! {"
            _start:
                setb r1, 1
                call @double
                call @double
                setb r0, 0
                syscall
            double:
                add r1, r1, r1
                ret
        "};

        let (result, machine) = run(program, Strategy::Direct);
        assert_eq!(result, Ok(VmExit::Exited(4)));
        assert_eq!(machine.register(Register::STACK_POINTER), 0x10_0000);
    }

    #[test]
    fn short_jumps_and_loads() {
        let program = indoc! {"
            _start:
                setb r1, 0
                setb r2, 5
                setb r3, -1
            loop:
                jzs r2, @done
                add r1, r1, r2
                add r2, r2, r3
                jmps @loop
            done:
                sets r4, 0x2000
                setb r5, 0
                setl r6, -2
                storebat r4, r5, r6
                loadbat r7, r4, r5
                add r1, r1, r7
                setb r0, 0
                syscall
        "};

        // 5 + 4 + 3 + 2 + 1, plus 0xfe from the zero extended byte load
        let (result, _) = run(program, Strategy::Direct);
        assert_eq!(result, Ok(VmExit::Exited(15 + 0xfe)));
    }
}

//! The vasm virtual machine.
//!
//! A machine is a flat, byte-addressed memory with the program loaded at
//! address 0, 32 registers and an instruction pointer. `r31` is the stack
//! pointer; it starts at the top of the stack and the stack grows down.
//! Multi-byte values in memory are big-endian.
//!
//! Programs can be run in two ways that behave identically:
//! [`Strategy::Direct`] decodes every instruction from memory as it is
//! executed, [`Strategy::Threaded`] first translates the reachable code into
//! fixed-width words and runs those through a table of handlers.

use log::debug;
use strum::{EnumString, IntoStaticStr};

use crate::backend::{
    isa::{BinaryOperator, DecodeError, Instruction, Register, Target, Width},
    object::{Executable, FormatError},
};

pub use self::syscall::{CaptureHost, OsHost, SyscallHost};

mod interpreter;
pub mod syscall;
mod threaded;

pub const DEFAULT_MEMORY_SIZE: usize = 1 << 20;
pub const DEFAULT_STACK_TOP: u64 = 0x10_0000;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, EnumString, IntoStaticStr, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Strategy {
    #[default]
    Direct,
    Threaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub memory_size: usize,
    pub stack_top: u64,
    pub strategy: Strategy,
    /// Fault after this many instructions
    pub max_steps: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            stack_top: DEFAULT_STACK_TOP,
            strategy: Strategy::Direct,
            max_steps: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// `exit` was called with this code
    Exited(i64),
    /// Killed by signal 9
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("invalid opcode {opcode:#04x} at {address:#x}")]
    InvalidOpcode { address: u64, opcode: u8 },
    #[error("invalid register {register} in instruction at {address:#x}")]
    InvalidRegister { address: u64, register: u8 },
    #[error("memory access at {address:#x} is out of bounds")]
    MemoryFault { address: u64 },
    #[error("division by zero")]
    DivisionByZero,
    #[error("step limit of {limit} instructions exceeded")]
    StepLimit { limit: u64 },
    #[error("program of {size} bytes doesn't fit in memory")]
    ProgramTooLarge { size: usize },
    #[error("malformed executable: {0}")]
    Format(#[from] FormatError),
}

impl VmError {
    /// The fault raised for an instruction at `address` that doesn't decode
    fn from_decode(address: u64, error: DecodeError) -> Self {
        match error {
            DecodeError::InvalidOpcode(opcode) => VmError::InvalidOpcode { address, opcode },
            DecodeError::InvalidRegister(register) => VmError::InvalidRegister { address, register },
            DecodeError::Truncated => VmError::MemoryFault { address },
        }
    }
}

/// Absolute address of a decoded jump or call target
fn target_address(target: Target) -> u64 {
    match target {
        Target::Address(address) => address,
        // the linker resolves every label, a leftover one can't be reached
        Target::Label(_) => u64::MAX,
    }
}

/// Decodes the instruction at `address` of `memory`
fn decode_at(memory: &[u8], address: u64) -> Result<(Instruction, usize), VmError> {
    let bytes = usize::try_from(address)
        .ok()
        .and_then(|start| memory.get(start..))
        .filter(|bytes| !bytes.is_empty())
        .ok_or(VmError::MemoryFault { address })?;

    Instruction::decode(bytes, address).map_err(|e| VmError::from_decode(address, e))
}

#[derive(Debug)]
pub struct Machine<H> {
    pub registers: [i64; Register::COUNT],
    pub memory: Vec<u8>,
    pub ip: u64,
    pub host: H,
    config: VmConfig,
    steps: u64,
}

impl<H: SyscallHost> Machine<H> {
    pub fn new(config: VmConfig, host: H) -> Self {
        let mut machine = Self {
            registers: [0; Register::COUNT],
            memory: vec![0; config.memory_size],
            ip: 0,
            host,
            config,
            steps: 0,
        };
        machine.reset();
        machine
    }

    fn reset(&mut self) {
        self.registers = [0; Register::COUNT];
        self.registers[Register::STACK_POINTER.index()] = self.config.stack_top as i64;
        self.ip = 0;
        self.steps = 0;
    }

    /// Copies raw code to address 0 and resets the machine
    pub fn load_code(&mut self, code: &[u8]) -> Result<(), VmError> {
        let slot = self
            .memory
            .get_mut(..code.len())
            .ok_or(VmError::ProgramTooLarge { size: code.len() })?;
        slot.copy_from_slice(code);
        self.reset();

        debug!("loaded {} bytes of code", code.len());
        Ok(())
    }

    pub fn load(&mut self, executable: &Executable) -> Result<(), VmError> {
        self.load_code(&executable.code)
    }

    pub fn run(&mut self) -> Result<VmExit, VmError> {
        let exit = match self.config.strategy {
            Strategy::Direct => self.run_direct(),
            Strategy::Threaded => self.run_threaded(),
        }?;

        debug!("{exit:?} after {} instructions", self.steps);
        Ok(exit)
    }

    pub fn register(&self, register: Register) -> i64 {
        self.registers[register.index()]
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn into_host(self) -> H {
        self.host
    }

    fn count_step(&mut self) -> Result<(), VmError> {
        self.steps += 1;

        match self.config.max_steps {
            Some(limit) if self.steps > limit => Err(VmError::StepLimit { limit }),
            _ => Ok(()),
        }
    }

    fn range(&self, address: u64, len: usize) -> Result<core::ops::Range<usize>, VmError> {
        let start = usize::try_from(address).map_err(|_| VmError::MemoryFault { address })?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.memory.len())
            .ok_or(VmError::MemoryFault { address })?;

        Ok(start..end)
    }

    fn read(&self, address: u64, width: Width) -> Result<i64, VmError> {
        let range = self.range(address, width.bytes())?;
        Ok(width.read(&self.memory[range]))
    }

    fn write(&mut self, address: u64, width: Width, value: i64) -> Result<(), VmError> {
        let range = self.range(address, width.bytes())?;
        width.write(value, &mut self.memory[range]);
        Ok(())
    }

    /// `base + index * width`
    fn indexed(&self, base: Register, index: Register, width: Width) -> u64 {
        self.register(base)
            .wrapping_add(self.register(index).wrapping_mul(width.bytes() as i64)) as u64
    }

    fn push_value(&mut self, value: i64) -> Result<(), VmError> {
        let sp = self.register(Register::STACK_POINTER).wrapping_sub(8);
        self.write(sp as u64, Width::Long, value)?;
        self.registers[Register::STACK_POINTER.index()] = sp;
        Ok(())
    }

    fn pop_value(&mut self) -> Result<i64, VmError> {
        let sp = self.register(Register::STACK_POINTER);
        let value = self.read(sp as u64, Width::Long)?;
        self.registers[Register::STACK_POINTER.index()] = sp.wrapping_add(8);
        Ok(value)
    }

    fn binary(
        &mut self,
        operator: BinaryOperator,
        destination: Register,
        lhs: Register,
        rhs: Register,
    ) -> Result<(), VmError> {
        let value = operator
            .evaluate(self.register(lhs), self.register(rhs))
            .ok_or(VmError::DivisionByZero)?;
        self.registers[destination.index()] = value;
        Ok(())
    }
}

/// Loads an executable into a fresh machine and runs it to completion
pub fn run_executable<H: SyscallHost>(
    executable: &Executable,
    config: VmConfig,
    host: H,
) -> Result<(VmExit, Machine<H>), VmError> {
    let mut machine = Machine::new(config, host);
    machine.load(executable)?;
    let exit = machine.run()?;
    Ok((exit, machine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        assembler::{assemble, parse_assembly},
        object::link,
    };

    pub(super) fn executable(text: &str) -> Executable {
        let object = assemble(&parse_assembly(text).unwrap()).unwrap();
        link(&[object], false).unwrap()
    }

    pub(super) fn run(
        text: &str,
        strategy: Strategy,
    ) -> (Result<VmExit, VmError>, Machine<CaptureHost>) {
        let config = VmConfig {
            strategy,
            max_steps: Some(10_000),
            ..VmConfig::default()
        };
        let mut machine = Machine::new(config, CaptureHost::default());
        machine.load(&executable(text)).unwrap();
        (machine.run(), machine)
    }

    fn both(text: &str) -> Vec<(Result<VmExit, VmError>, Machine<CaptureHost>)> {
        [Strategy::Direct, Strategy::Threaded]
            .into_iter()
            .map(|strategy| run(text, strategy))
            .collect()
    }

    #[test]
    fn exit_code_comes_from_r1() {
        for (result, machine) in both("_start:\n setb r1, 42; setb r0, 0; syscall") {
            assert_eq!(result, Ok(VmExit::Exited(42)));
            // including the linker's jump to `_start`
            assert_eq!(machine.steps(), 4);
        }
    }

    #[test]
    fn stack_starts_at_the_top() {
        let program = "_start:\n setb r1, 7; push r1; pop r2; mov r1, sp; setb r0, 0; syscall";

        for (result, machine) in both(program) {
            assert_eq!(result, Ok(VmExit::Exited(DEFAULT_STACK_TOP as i64)));
            assert_eq!(machine.register(Register::new(2).unwrap()), 7);
            assert_eq!(
                &machine.memory[DEFAULT_STACK_TOP as usize - 8..],
                &[0, 0, 0, 0, 0, 0, 0, 7]
            );
        }
    }

    #[test]
    fn faults_are_reported() {
        for (result, _) in both("_start:\n setb r1, 0; div r2, r1, r1") {
            assert_eq!(result, Err(VmError::DivisionByZero));
        }

        for (result, _) in both("_start:\n setl r1, 0x7fffffff; loadlat r2, r1, r1") {
            assert!(matches!(result, Err(VmError::MemoryFault { .. })));
        }

        for (result, _) in both("_start:\n top:\n jmp @top") {
            assert_eq!(result, Err(VmError::StepLimit { limit: 10_000 }));
        }
    }

    #[test]
    fn running_into_garbage_is_an_invalid_opcode() {
        let mut executable = executable("_start:\n setb r0, 1");
        executable.code.push(0xEE);
        let address = executable.code.len() as u64 - 1;

        for strategy in [Strategy::Direct, Strategy::Threaded] {
            let config = VmConfig {
                strategy,
                ..VmConfig::default()
            };
            let result = run_executable(&executable, config, CaptureHost::default())
                .map(|(exit, _)| exit);
            assert_eq!(
                result,
                Err(VmError::InvalidOpcode {
                    address,
                    opcode: 0xEE
                })
            );
        }
    }
}

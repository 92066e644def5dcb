//! The vasm instruction set. An instruction is one opcode byte followed by
//! its register bytes and then its immediate, if any. Immediates and
//! addresses are big-endian.

use colored::Colorize;
use strum::{EnumIter, EnumString, FromRepr};

use crate::frontend::intern::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register(u8);

impl Register {
    pub const COUNT: usize = 32;
    /// Return values and the first argument
    pub const RETURN: Register = Register(0);
    pub const SCRATCH_0: Register = Register(29);
    pub const SCRATCH_1: Register = Register(30);
    pub const STACK_POINTER: Register = Register(31);

    pub fn new(index: u8) -> Option<Self> {
        (usize::from(index) < Self::COUNT).then_some(Self(index))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl core::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::STACK_POINTER {
            write!(f, "sp")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

impl core::str::FromStr for Register {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "sp" {
            return Ok(Self::STACK_POINTER);
        }

        s.strip_prefix('r')
            .filter(|n| !n.starts_with('+'))
            .and_then(|n| n.parse().ok())
            .and_then(Register::new)
            .ok_or(())
    }
}

/// Width of a memory access or immediate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Long,
    Int,
    Short,
    Byte,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::Long => 8,
            Width::Int => 4,
            Width::Short => 2,
            Width::Byte => 1,
        }
    }

    pub fn from_size(size: u64) -> Option<Self> {
        Some(match size {
            8 => Width::Long,
            4 => Width::Int,
            2 => Width::Short,
            1 => Width::Byte,
            _ => return None,
        })
    }

    /// Smallest width whose sign extension reproduces `value`
    pub fn fitting(value: i64) -> Self {
        if i8::try_from(value).is_ok() {
            Width::Byte
        } else if i16::try_from(value).is_ok() {
            Width::Short
        } else if i32::try_from(value).is_ok() {
            Width::Int
        } else {
            Width::Long
        }
    }

    /// Reads a value of this width. Byte loads zero extend, the wider ones
    /// sign extend.
    pub fn read(self, bytes: &[u8]) -> i64 {
        match self {
            Width::Long => i64::from_be_bytes(bytes[..8].try_into().unwrap_or_default()),
            Width::Int => i64::from(i32::from_be_bytes(bytes[..4].try_into().unwrap_or_default())),
            Width::Short => i64::from(i16::from_be_bytes(bytes[..2].try_into().unwrap_or_default())),
            Width::Byte => i64::from(bytes[0]),
        }
    }

    /// Immediates are always sign extended
    pub fn read_immediate(self, bytes: &[u8]) -> i64 {
        match self {
            Width::Byte => i64::from(bytes[0] as i8),
            other => other.read(bytes),
        }
    }

    /// Writes the low bytes of `value`, big-endian
    pub fn write(self, value: i64, out: &mut [u8]) {
        let bytes = value.to_be_bytes();
        out[..self.bytes()].copy_from_slice(&bytes[8 - self.bytes()..]);
    }

    fn index(self) -> u8 {
        match self {
            Width::Long => 0,
            Width::Int => 1,
            Width::Short => 2,
            Width::Byte => 3,
        }
    }

    fn from_index(index: u8) -> Self {
        match index & 3 {
            0 => Width::Long,
            1 => Width::Int,
            2 => Width::Short,
            _ => Width::Byte,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumIter, EnumString, strum::Display,
)]
#[repr(u8)]
pub enum Opcode {
    #[strum(serialize = "jmp")]
    Jump = 0x01,
    #[strum(serialize = "jz")]
    JumpIfZero = 0x02,
    #[strum(serialize = "jnz")]
    JumpIfNotZero = 0x03,
    #[strum(serialize = "jpos")]
    JumpIfPositive = 0x04,
    #[strum(serialize = "jnneg")]
    JumpIfNonNegative = 0x05,
    #[strum(serialize = "jmps")]
    ShortJump = 0x06,
    #[strum(serialize = "jzs")]
    ShortJumpIfZero = 0x07,
    #[strum(serialize = "jnzs")]
    ShortJumpIfNotZero = 0x08,
    #[strum(serialize = "call")]
    Call = 0x09,
    #[strum(serialize = "ret")]
    Return = 0x0A,

    #[strum(serialize = "loadl")]
    LoadLong = 0x10,
    #[strum(serialize = "loadi")]
    LoadInt = 0x11,
    #[strum(serialize = "loads")]
    LoadShort = 0x12,
    #[strum(serialize = "loadb")]
    LoadByte = 0x13,
    #[strum(serialize = "loadlat")]
    LoadLongAt = 0x14,
    #[strum(serialize = "loadiat")]
    LoadIntAt = 0x15,
    #[strum(serialize = "loadsat")]
    LoadShortAt = 0x16,
    #[strum(serialize = "loadbat")]
    LoadByteAt = 0x17,
    #[strum(serialize = "storel")]
    StoreLong = 0x18,
    #[strum(serialize = "storei")]
    StoreInt = 0x19,
    #[strum(serialize = "stores")]
    StoreShort = 0x1A,
    #[strum(serialize = "storeb")]
    StoreByte = 0x1B,
    #[strum(serialize = "storelat")]
    StoreLongAt = 0x1C,
    #[strum(serialize = "storeiat")]
    StoreIntAt = 0x1D,
    #[strum(serialize = "storesat")]
    StoreShortAt = 0x1E,
    #[strum(serialize = "storebat")]
    StoreByteAt = 0x1F,

    #[strum(serialize = "push")]
    Push = 0x20,
    #[strum(serialize = "pop")]
    Pop = 0x21,
    #[strum(serialize = "mov")]
    Move = 0x22,
    #[strum(serialize = "setl")]
    SetLong = 0x24,
    #[strum(serialize = "seti")]
    SetInt = 0x25,
    #[strum(serialize = "sets")]
    SetShort = 0x26,
    #[strum(serialize = "setb")]
    SetByte = 0x27,

    #[strum(serialize = "add")]
    Add = 0x30,
    #[strum(serialize = "sub")]
    Sub = 0x31,
    #[strum(serialize = "mul")]
    Mul = 0x32,
    #[strum(serialize = "div")]
    Div = 0x33,
    #[strum(serialize = "mod")]
    Mod = 0x34,
    #[strum(serialize = "rem")]
    Rem = 0x35,
    #[strum(serialize = "shl")]
    LeftShift = 0x36,
    #[strum(serialize = "shr")]
    RightShift = 0x37,
    #[strum(serialize = "rol")]
    LeftRotate = 0x38,
    #[strum(serialize = "ror")]
    RightRotate = 0x39,
    #[strum(serialize = "and")]
    And = 0x3A,
    #[strum(serialize = "or")]
    Or = 0x3B,
    #[strum(serialize = "xor")]
    Xor = 0x3C,
    #[strum(serialize = "lt")]
    Less = 0x3D,
    #[strum(serialize = "le")]
    LessOrEqual = 0x3E,

    #[strum(serialize = "not")]
    Not = 0x40,
    #[strum(serialize = "inv")]
    Inv = 0x41,

    #[strum(serialize = "syscall")]
    Syscall = 0x50,
}

/// The operand layout following an opcode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Nothing,
    Address,
    Register,
    RegisterAddress,
    ShortOffset,
    RegisterShortOffset,
    TwoRegisters,
    ThreeRegisters,
    RegisterImmediate(Width),
}

impl Shape {
    pub fn registers(self) -> usize {
        match self {
            Shape::Nothing | Shape::Address | Shape::ShortOffset => 0,
            Shape::Register
            | Shape::RegisterAddress
            | Shape::RegisterShortOffset
            | Shape::RegisterImmediate(_) => 1,
            Shape::TwoRegisters => 2,
            Shape::ThreeRegisters => 3,
        }
    }

    pub fn immediate_bytes(self) -> usize {
        match self {
            Shape::Address | Shape::RegisterAddress => 8,
            Shape::ShortOffset | Shape::RegisterShortOffset => 2,
            Shape::RegisterImmediate(width) => width.bytes(),
            Shape::Nothing | Shape::Register | Shape::TwoRegisters | Shape::ThreeRegisters => 0,
        }
    }

    /// Encoded length including the opcode byte
    pub fn len(self) -> usize {
        1 + self.registers() + self.immediate_bytes()
    }
}

impl Opcode {
    pub fn shape(self) -> Shape {
        match self {
            Opcode::Jump | Opcode::Call => Shape::Address,
            Opcode::JumpIfZero
            | Opcode::JumpIfNotZero
            | Opcode::JumpIfPositive
            | Opcode::JumpIfNonNegative
            | Opcode::LoadLong
            | Opcode::LoadInt
            | Opcode::LoadShort
            | Opcode::LoadByte
            | Opcode::StoreLong
            | Opcode::StoreInt
            | Opcode::StoreShort
            | Opcode::StoreByte => Shape::RegisterAddress,
            Opcode::ShortJump => Shape::ShortOffset,
            Opcode::ShortJumpIfZero | Opcode::ShortJumpIfNotZero => Shape::RegisterShortOffset,
            Opcode::Return | Opcode::Syscall => Shape::Nothing,
            Opcode::Push | Opcode::Pop => Shape::Register,
            Opcode::Move | Opcode::Not | Opcode::Inv => Shape::TwoRegisters,
            Opcode::SetLong => Shape::RegisterImmediate(Width::Long),
            Opcode::SetInt => Shape::RegisterImmediate(Width::Int),
            Opcode::SetShort => Shape::RegisterImmediate(Width::Short),
            Opcode::SetByte => Shape::RegisterImmediate(Width::Byte),
            Opcode::LoadLongAt
            | Opcode::LoadIntAt
            | Opcode::LoadShortAt
            | Opcode::LoadByteAt
            | Opcode::StoreLongAt
            | Opcode::StoreIntAt
            | Opcode::StoreShortAt
            | Opcode::StoreByteAt
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Rem
            | Opcode::LeftShift
            | Opcode::RightShift
            | Opcode::LeftRotate
            | Opcode::RightRotate
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Less
            | Opcode::LessOrEqual => Shape::ThreeRegisters,
        }
    }

    fn with_width(base: Opcode, width: Width) -> Opcode {
        Opcode::from_repr(base as u8 + width.index()).unwrap_or(base)
    }

    fn width(self, base: Opcode) -> Width {
        Width::from_index(self as u8 - base as u8)
    }

    /// Width of a load, store or immediate
    pub fn access_width(self) -> Option<Width> {
        let base = match self {
            Opcode::LoadLong | Opcode::LoadInt | Opcode::LoadShort | Opcode::LoadByte => {
                Opcode::LoadLong
            }
            Opcode::LoadLongAt | Opcode::LoadIntAt | Opcode::LoadShortAt | Opcode::LoadByteAt => {
                Opcode::LoadLongAt
            }
            Opcode::StoreLong | Opcode::StoreInt | Opcode::StoreShort | Opcode::StoreByte => {
                Opcode::StoreLong
            }
            Opcode::StoreLongAt
            | Opcode::StoreIntAt
            | Opcode::StoreShortAt
            | Opcode::StoreByteAt => Opcode::StoreLongAt,
            Opcode::SetLong | Opcode::SetInt | Opcode::SetShort | Opcode::SetByte => {
                Opcode::SetLong
            }
            _ => return None,
        };

        Some(self.width(base))
    }

    pub fn binary_operator(self) -> Option<BinaryOperator> {
        BinaryOperator::from_opcode(self)
    }
}

/// The address operand of a jump, call, load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Resolved by the linker
    Label(Symbol),
    Address(u64),
}

impl core::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Label(label) => write!(f, "@{label}"),
            Target::Address(address) => write!(f, "{address:#x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Always,
    Zero(Register),
    NotZero(Register),
    Positive(Register),
    NonNegative(Register),
}

impl Condition {
    pub fn register(self) -> Option<Register> {
        match self {
            Condition::Always => None,
            Condition::Zero(r)
            | Condition::NotZero(r)
            | Condition::Positive(r)
            | Condition::NonNegative(r) => Some(r),
        }
    }

    pub fn holds(self, registers: &[i64; Register::COUNT]) -> bool {
        match self {
            Condition::Always => true,
            Condition::Zero(r) => registers[r.index()] == 0,
            Condition::NotZero(r) => registers[r.index()] != 0,
            Condition::Positive(r) => registers[r.index()] > 0,
            Condition::NonNegative(r) => registers[r.index()] >= 0,
        }
    }

    /// The condition that holds exactly when this one doesn't, if there is
    /// an instruction for it
    pub fn inverted(self) -> Option<Condition> {
        match self {
            Condition::Zero(r) => Some(Condition::NotZero(r)),
            Condition::NotZero(r) => Some(Condition::Zero(r)),
            Condition::Always | Condition::Positive(_) | Condition::NonNegative(_) => None,
        }
    }

    fn long_opcode(self) -> Opcode {
        match self {
            Condition::Always => Opcode::Jump,
            Condition::Zero(_) => Opcode::JumpIfZero,
            Condition::NotZero(_) => Opcode::JumpIfNotZero,
            Condition::Positive(_) => Opcode::JumpIfPositive,
            Condition::NonNegative(_) => Opcode::JumpIfNonNegative,
        }
    }
}

/// Conditions with a short, relative jump encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShortCondition {
    Always,
    Zero(Register),
    NotZero(Register),
}

impl From<ShortCondition> for Condition {
    fn from(condition: ShortCondition) -> Self {
        match condition {
            ShortCondition::Always => Condition::Always,
            ShortCondition::Zero(r) => Condition::Zero(r),
            ShortCondition::NotZero(r) => Condition::NotZero(r),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    /// Truncating division
    Div,
    /// Euclidean modulo, never negative
    Mod,
    /// Truncated remainder, takes the sign of the dividend
    Rem,
    LeftShift,
    /// Arithmetic shift
    RightShift,
    LeftRotate,
    RightRotate,
    And,
    Or,
    Xor,
    Less,
    LessOrEqual,
}

impl BinaryOperator {
    /// `None` when dividing by zero
    pub fn evaluate(self, lhs: i64, rhs: i64) -> Option<i64> {
        let amount = (rhs & 63) as u32;

        Some(match self {
            BinaryOperator::Add => lhs.wrapping_add(rhs),
            BinaryOperator::Sub => lhs.wrapping_sub(rhs),
            BinaryOperator::Mul => lhs.wrapping_mul(rhs),
            BinaryOperator::Div => lhs.checked_div(rhs).or_else(|| (rhs == -1).then_some(lhs))?,
            BinaryOperator::Rem => lhs.checked_rem(rhs).or_else(|| (rhs == -1).then_some(0))?,
            BinaryOperator::Mod => {
                if rhs == 0 {
                    return None;
                }
                lhs.wrapping_rem_euclid(rhs)
            }
            BinaryOperator::LeftShift => lhs << amount,
            BinaryOperator::RightShift => lhs >> amount,
            BinaryOperator::LeftRotate => (lhs as u64).rotate_left(amount) as i64,
            BinaryOperator::RightRotate => (lhs as u64).rotate_right(amount) as i64,
            BinaryOperator::And => lhs & rhs,
            BinaryOperator::Or => lhs | rhs,
            BinaryOperator::Xor => lhs ^ rhs,
            BinaryOperator::Less => i64::from(lhs < rhs),
            BinaryOperator::LessOrEqual => i64::from(lhs <= rhs),
        })
    }

    fn opcode(self) -> Opcode {
        match self {
            BinaryOperator::Add => Opcode::Add,
            BinaryOperator::Sub => Opcode::Sub,
            BinaryOperator::Mul => Opcode::Mul,
            BinaryOperator::Div => Opcode::Div,
            BinaryOperator::Mod => Opcode::Mod,
            BinaryOperator::Rem => Opcode::Rem,
            BinaryOperator::LeftShift => Opcode::LeftShift,
            BinaryOperator::RightShift => Opcode::RightShift,
            BinaryOperator::LeftRotate => Opcode::LeftRotate,
            BinaryOperator::RightRotate => Opcode::RightRotate,
            BinaryOperator::And => Opcode::And,
            BinaryOperator::Or => Opcode::Or,
            BinaryOperator::Xor => Opcode::Xor,
            BinaryOperator::Less => Opcode::Less,
            BinaryOperator::LessOrEqual => Opcode::LessOrEqual,
        }
    }

    fn from_opcode(opcode: Opcode) -> Option<Self> {
        Some(match opcode {
            Opcode::Add => BinaryOperator::Add,
            Opcode::Sub => BinaryOperator::Sub,
            Opcode::Mul => BinaryOperator::Mul,
            Opcode::Div => BinaryOperator::Div,
            Opcode::Mod => BinaryOperator::Mod,
            Opcode::Rem => BinaryOperator::Rem,
            Opcode::LeftShift => BinaryOperator::LeftShift,
            Opcode::RightShift => BinaryOperator::RightShift,
            Opcode::LeftRotate => BinaryOperator::LeftRotate,
            Opcode::RightRotate => BinaryOperator::RightRotate,
            Opcode::And => BinaryOperator::And,
            Opcode::Or => BinaryOperator::Or,
            Opcode::Xor => BinaryOperator::Xor,
            Opcode::Less => BinaryOperator::Less,
            Opcode::LessOrEqual => BinaryOperator::LessOrEqual,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    /// Bitwise complement
    Not,
    /// Logical not, 1 if zero else 0
    Inv,
}

impl UnaryOperator {
    pub fn evaluate(self, value: i64) -> i64 {
        match self {
            UnaryOperator::Not => !value,
            UnaryOperator::Inv => i64::from(value == 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    Jump {
        condition: Condition,
        target: Target,
    },
    /// Encoded as an `i16` offset from the start of the jump. After
    /// decoding, `target` holds the absolute address.
    ShortJump {
        condition: ShortCondition,
        target: Target,
    },
    Call {
        target: Target,
    },
    Return,
    Load {
        width: Width,
        destination: Register,
        address: Target,
    },
    /// destination = memory[base + index * width]
    LoadAt {
        width: Width,
        destination: Register,
        base: Register,
        index: Register,
    },
    Store {
        width: Width,
        address: Target,
        source: Register,
    },
    StoreAt {
        width: Width,
        base: Register,
        index: Register,
        source: Register,
    },
    Push(Register),
    Pop(Register),
    Move {
        destination: Register,
        source: Register,
    },
    SetImmediate {
        width: Width,
        destination: Register,
        value: i64,
    },
    Binary {
        operator: BinaryOperator,
        destination: Register,
        lhs: Register,
        rhs: Register,
    },
    Unary {
        operator: UnaryOperator,
        destination: Register,
        source: Register,
    },
    Syscall,
}

/// A label reference left in the encoded bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// Offset of the slot from the start of the instruction
    pub offset: usize,
    pub label: Symbol,
    pub kind: FixupKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// 8-byte absolute address, patched by the linker
    Absolute,
    /// 2-byte offset relative to the start of the instruction
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("short jump target {target:#x} is out of range of {position:#x}")]
    ShortJumpOutOfRange { position: u64, target: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("invalid register {0}")]
    InvalidRegister(u8),
    #[error("instruction runs past the end of memory")]
    Truncated,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match *self {
            Instruction::Jump { condition, .. } => condition.long_opcode(),
            Instruction::ShortJump { condition, .. } => match condition {
                ShortCondition::Always => Opcode::ShortJump,
                ShortCondition::Zero(_) => Opcode::ShortJumpIfZero,
                ShortCondition::NotZero(_) => Opcode::ShortJumpIfNotZero,
            },
            Instruction::Call { .. } => Opcode::Call,
            Instruction::Return => Opcode::Return,
            Instruction::Load { width, .. } => Opcode::with_width(Opcode::LoadLong, width),
            Instruction::LoadAt { width, .. } => Opcode::with_width(Opcode::LoadLongAt, width),
            Instruction::Store { width, .. } => Opcode::with_width(Opcode::StoreLong, width),
            Instruction::StoreAt { width, .. } => Opcode::with_width(Opcode::StoreLongAt, width),
            Instruction::Push(_) => Opcode::Push,
            Instruction::Pop(_) => Opcode::Pop,
            Instruction::Move { .. } => Opcode::Move,
            Instruction::SetImmediate { width, .. } => Opcode::with_width(Opcode::SetLong, width),
            Instruction::Binary { operator, .. } => operator.opcode(),
            Instruction::Unary { operator, .. } => match operator {
                UnaryOperator::Not => Opcode::Not,
                UnaryOperator::Inv => Opcode::Inv,
            },
            Instruction::Syscall => Opcode::Syscall,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.opcode().shape().len()
    }

    /// Registers in encoding order
    fn encoded_registers(&self) -> Vec<Register> {
        match *self {
            Instruction::Jump { condition, .. } => condition.register().into_iter().collect(),
            Instruction::ShortJump { condition, .. } => {
                Condition::from(condition).register().into_iter().collect()
            }
            Instruction::Call { .. } | Instruction::Return | Instruction::Syscall => vec![],
            Instruction::Load { destination, .. } => vec![destination],
            Instruction::LoadAt {
                destination,
                base,
                index,
                ..
            } => vec![destination, base, index],
            Instruction::Store { source, .. } => vec![source],
            Instruction::StoreAt {
                base,
                index,
                source,
                ..
            } => vec![base, index, source],
            Instruction::Push(r) | Instruction::Pop(r) => vec![r],
            Instruction::Move {
                destination,
                source,
            }
            | Instruction::Unary {
                destination,
                source,
                ..
            } => vec![destination, source],
            Instruction::SetImmediate { destination, .. } => vec![destination],
            Instruction::Binary {
                destination,
                lhs,
                rhs,
                ..
            } => vec![destination, lhs, rhs],
        }
    }

    /// Appends the encoding of this instruction, which starts at `position`.
    /// Label operands are encoded as zero and returned as a fixup.
    pub fn encode(&self, position: u64, out: &mut Vec<u8>) -> Result<Option<Fixup>, EncodeError> {
        let opcode = self.opcode();
        out.push(opcode as u8);

        let registers = self.encoded_registers();
        out.extend(registers.iter().map(|r| r.as_u8()));
        let offset = 1 + registers.len();

        let address = match *self {
            Instruction::Jump { target, .. }
            | Instruction::Call { target }
            | Instruction::Load {
                address: target, ..
            }
            | Instruction::Store {
                address: target, ..
            } => Some(target),
            _ => None,
        };

        if let Some(target) = address {
            return Ok(match target {
                Target::Address(address) => {
                    out.extend(address.to_be_bytes());
                    None
                }
                Target::Label(label) => {
                    out.extend([0; 8]);
                    Some(Fixup {
                        offset,
                        label,
                        kind: FixupKind::Absolute,
                    })
                }
            });
        }

        match *self {
            Instruction::ShortJump { target, .. } => match target {
                Target::Address(target) => {
                    let relative = i16::try_from(target.wrapping_sub(position) as i64)
                        .map_err(|_| EncodeError::ShortJumpOutOfRange { position, target })?;
                    out.extend(relative.to_be_bytes());
                }
                Target::Label(label) => {
                    out.extend([0; 2]);
                    return Ok(Some(Fixup {
                        offset,
                        label,
                        kind: FixupKind::Relative,
                    }));
                }
            },
            Instruction::SetImmediate { width, value, .. } => {
                let start = out.len();
                out.resize(start + width.bytes(), 0);
                width.write(value, &mut out[start..]);
            }
            _ => {}
        }

        Ok(None)
    }

    /// Decodes the instruction at the start of `bytes`, which sits at
    /// `position` in memory. Returns the instruction and its length.
    pub fn decode(bytes: &[u8], position: u64) -> Result<(Instruction, usize), DecodeError> {
        let &first = bytes.first().ok_or(DecodeError::Truncated)?;
        let opcode = Opcode::from_repr(first).ok_or(DecodeError::InvalidOpcode(first))?;
        let shape = opcode.shape();

        if bytes.len() < shape.len() {
            return Err(DecodeError::Truncated);
        }

        let mut registers = [Register::RETURN; 3];
        for (i, register) in registers.iter_mut().take(shape.registers()).enumerate() {
            let byte = bytes[1 + i];
            *register = Register::new(byte).ok_or(DecodeError::InvalidRegister(byte))?;
        }
        let [a, b, c] = registers;

        let immediate = &bytes[1 + shape.registers()..shape.len()];
        let address = || Target::Address(Width::Long.read(immediate) as u64);
        let relative = || {
            let offset = i16::from_be_bytes([immediate[0], immediate[1]]);
            Target::Address(position.wrapping_add_signed(i64::from(offset)))
        };

        let instruction = match opcode {
            Opcode::Jump => Instruction::Jump {
                condition: Condition::Always,
                target: address(),
            },
            Opcode::JumpIfZero => Instruction::Jump {
                condition: Condition::Zero(a),
                target: address(),
            },
            Opcode::JumpIfNotZero => Instruction::Jump {
                condition: Condition::NotZero(a),
                target: address(),
            },
            Opcode::JumpIfPositive => Instruction::Jump {
                condition: Condition::Positive(a),
                target: address(),
            },
            Opcode::JumpIfNonNegative => Instruction::Jump {
                condition: Condition::NonNegative(a),
                target: address(),
            },
            Opcode::ShortJump => Instruction::ShortJump {
                condition: ShortCondition::Always,
                target: relative(),
            },
            Opcode::ShortJumpIfZero => Instruction::ShortJump {
                condition: ShortCondition::Zero(a),
                target: relative(),
            },
            Opcode::ShortJumpIfNotZero => Instruction::ShortJump {
                condition: ShortCondition::NotZero(a),
                target: relative(),
            },
            Opcode::Call => Instruction::Call { target: address() },
            Opcode::Return => Instruction::Return,
            Opcode::Syscall => Instruction::Syscall,
            Opcode::LoadLong | Opcode::LoadInt | Opcode::LoadShort | Opcode::LoadByte => {
                Instruction::Load {
                    width: opcode.width(Opcode::LoadLong),
                    destination: a,
                    address: address(),
                }
            }
            Opcode::LoadLongAt | Opcode::LoadIntAt | Opcode::LoadShortAt | Opcode::LoadByteAt => {
                Instruction::LoadAt {
                    width: opcode.width(Opcode::LoadLongAt),
                    destination: a,
                    base: b,
                    index: c,
                }
            }
            Opcode::StoreLong | Opcode::StoreInt | Opcode::StoreShort | Opcode::StoreByte => {
                Instruction::Store {
                    width: opcode.width(Opcode::StoreLong),
                    address: address(),
                    source: a,
                }
            }
            Opcode::StoreLongAt
            | Opcode::StoreIntAt
            | Opcode::StoreShortAt
            | Opcode::StoreByteAt => Instruction::StoreAt {
                width: opcode.width(Opcode::StoreLongAt),
                base: a,
                index: b,
                source: c,
            },
            Opcode::Push => Instruction::Push(a),
            Opcode::Pop => Instruction::Pop(a),
            Opcode::Move => Instruction::Move {
                destination: a,
                source: b,
            },
            Opcode::SetLong | Opcode::SetInt | Opcode::SetShort | Opcode::SetByte => {
                let width = opcode.width(Opcode::SetLong);
                Instruction::SetImmediate {
                    width,
                    destination: a,
                    value: width.read_immediate(immediate),
                }
            }
            Opcode::Not => Instruction::Unary {
                operator: UnaryOperator::Not,
                destination: a,
                source: b,
            },
            Opcode::Inv => Instruction::Unary {
                operator: UnaryOperator::Inv,
                destination: a,
                source: b,
            },
            other => Instruction::Binary {
                operator: BinaryOperator::from_opcode(other)
                    .ok_or(DecodeError::InvalidOpcode(first))?,
                destination: a,
                lhs: b,
                rhs: c,
            },
        };

        Ok((instruction, shape.len()))
    }

    /// Registers whose value this instruction reads
    pub fn reads(&self) -> Vec<Register> {
        match *self {
            Instruction::Jump { condition, .. } => condition.register().into_iter().collect(),
            Instruction::ShortJump { condition, .. } => {
                Condition::from(condition).register().into_iter().collect()
            }
            Instruction::Call { .. } | Instruction::Return => vec![Register::STACK_POINTER],
            Instruction::Load { .. } | Instruction::SetImmediate { .. } => vec![],
            Instruction::LoadAt { base, index, .. } => vec![base, index],
            Instruction::Store { source, .. } => vec![source],
            Instruction::StoreAt {
                base,
                index,
                source,
                ..
            } => vec![base, index, source],
            Instruction::Push(r) => vec![r, Register::STACK_POINTER],
            Instruction::Pop(_) => vec![Register::STACK_POINTER],
            Instruction::Move { source, .. } | Instruction::Unary { source, .. } => vec![source],
            Instruction::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Instruction::Syscall => (0..4).filter_map(Register::new).collect(),
        }
    }

    /// Registers this instruction overwrites
    pub fn writes(&self) -> Vec<Register> {
        match *self {
            Instruction::Load { destination, .. }
            | Instruction::LoadAt { destination, .. }
            | Instruction::Move { destination, .. }
            | Instruction::SetImmediate { destination, .. }
            | Instruction::Binary { destination, .. }
            | Instruction::Unary { destination, .. } => vec![destination],
            Instruction::Pop(r) => vec![r, Register::STACK_POINTER],
            Instruction::Push(_) | Instruction::Call { .. } | Instruction::Return => {
                vec![Register::STACK_POINTER]
            }
            Instruction::Syscall => vec![Register::RETURN],
            Instruction::Jump { .. }
            | Instruction::ShortJump { .. }
            | Instruction::Store { .. }
            | Instruction::StoreAt { .. } => vec![],
        }
    }

    /// Whether control may continue somewhere other than the next
    /// instruction
    pub fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Instruction::Jump { .. }
                | Instruction::ShortJump { .. }
                | Instruction::Call { .. }
                | Instruction::Return
                | Instruction::Syscall
        )
    }

    /// Whether control never reaches the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jump {
                condition: Condition::Always,
                ..
            } | Instruction::ShortJump {
                condition: ShortCondition::Always,
                ..
            } | Instruction::Return
        )
    }

    pub fn target(&self) -> Option<Target> {
        match *self {
            Instruction::Jump { target, .. }
            | Instruction::ShortJump { target, .. }
            | Instruction::Call { target } => Some(target),
            _ => None,
        }
    }
}

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.opcode().to_string().cyan())?;

        match *self {
            Instruction::Jump { condition, target } => match condition.register() {
                Some(r) => write!(f, " {r}, {}", target.to_string().blue()),
                None => write!(f, " {}", target.to_string().blue()),
            },
            Instruction::ShortJump { condition, target } => {
                match Condition::from(condition).register() {
                    Some(r) => write!(f, " {r}, {}", target.to_string().blue()),
                    None => write!(f, " {}", target.to_string().blue()),
                }
            }
            Instruction::Call { target } => write!(f, " {}", target.to_string().blue()),
            Instruction::Return | Instruction::Syscall => Ok(()),
            Instruction::Load {
                destination,
                address,
                ..
            } => write!(f, " {destination}, {address}"),
            Instruction::LoadAt {
                destination,
                base,
                index,
                ..
            } => write!(f, " {destination}, {base}, {index}"),
            Instruction::Store {
                address, source, ..
            } => write!(f, " {address}, {source}"),
            Instruction::StoreAt {
                base,
                index,
                source,
                ..
            } => write!(f, " {base}, {index}, {source}"),
            Instruction::Push(r) | Instruction::Pop(r) => write!(f, " {r}"),
            Instruction::Move {
                destination,
                source,
            }
            | Instruction::Unary {
                destination,
                source,
                ..
            } => write!(f, " {destination}, {source}"),
            Instruction::SetImmediate {
                destination, value, ..
            } => write!(f, " {destination}, {}", value.to_string().purple()),
            Instruction::Binary {
                destination,
                lhs,
                rhs,
                ..
            } => write!(f, " {destination}, {lhs}, {rhs}"),
        }
    }
}

/// Picks the narrowest `set` for a constant
pub fn set_immediate(destination: Register, value: i64) -> Instruction {
    Instruction::SetImmediate {
        width: Width::fitting(value),
        destination,
        value,
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn r(index: u8) -> Register {
        Register::new(index).unwrap()
    }

    #[test]
    fn encodes_big_endian_operands() {
        let mut out = Vec::new();
        let instruction = Instruction::Jump {
            condition: Condition::NotZero(r(3)),
            target: Target::Address(0x0102),
        };
        assert_eq!(instruction.encode(0, &mut out), Ok(None));
        assert_eq!(out, vec![0x03, 3, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);

        out.clear();
        set_immediate(r(1), -2).encode(0, &mut out).unwrap();
        assert_eq!(out, vec![0x27, 1, 0xFE]);
    }

    #[test]
    fn decode_inverts_encode() {
        let instructions = [
            Instruction::LoadAt {
                width: Width::Short,
                destination: r(1),
                base: r(2),
                index: r(3),
            },
            Instruction::Store {
                width: Width::Int,
                address: Target::Address(0x40),
                source: r(9),
            },
            Instruction::ShortJump {
                condition: ShortCondition::Zero(r(4)),
                target: Target::Address(0x10),
            },
            set_immediate(r(5), 0x1234_5678),
            Instruction::Unary {
                operator: UnaryOperator::Inv,
                destination: r(0),
                source: Register::STACK_POINTER,
            },
        ];

        for instruction in instructions {
            let mut out = Vec::new();
            instruction.encode(0x20, &mut out).unwrap();
            assert_eq!(out.len(), instruction.encoded_len());
            assert_eq!(Instruction::decode(&out, 0x20), Ok((instruction, out.len())));
        }
    }

    #[test]
    fn every_opcode_decodes_to_itself() {
        for opcode in Opcode::iter() {
            let mut bytes = vec![opcode as u8];
            bytes.resize(opcode.shape().len(), 0);

            let (instruction, len) = Instruction::decode(&bytes, 0).unwrap();
            assert_eq!(instruction.opcode(), opcode);
            assert_eq!(len, bytes.len());
        }
    }

    #[test]
    fn rejects_bad_bytes() {
        assert_eq!(
            Instruction::decode(&[0xFF], 0),
            Err(DecodeError::InvalidOpcode(0xFF))
        );
        assert_eq!(
            Instruction::decode(&[0x20, 40], 0),
            Err(DecodeError::InvalidRegister(40))
        );
        assert_eq!(Instruction::decode(&[0x01, 0], 0), Err(DecodeError::Truncated));
    }

    #[test]
    fn division_semantics() {
        assert_eq!(BinaryOperator::Div.evaluate(-7, 2), Some(-3));
        assert_eq!(BinaryOperator::Rem.evaluate(-7, 2), Some(-1));
        assert_eq!(BinaryOperator::Mod.evaluate(-7, 2), Some(1));
        assert_eq!(BinaryOperator::Div.evaluate(i64::MIN, -1), Some(i64::MIN));
        assert_eq!(BinaryOperator::Div.evaluate(1, 0), None);
        assert_eq!(BinaryOperator::RightShift.evaluate(-8, 65), Some(-4));
    }

    #[test]
    fn byte_loads_zero_extend() {
        assert_eq!(Width::Byte.read(&[0xFF]), 255);
        assert_eq!(Width::Short.read(&[0xFF, 0xFE]), -2);
        assert_eq!(Width::Byte.read_immediate(&[0xFF]), -1);
    }
}

//! Turns instructions and labels into object code, parses the textual
//! assembly syntax and disassembles bytes back into text.
//!
//! ```text
//! loop:
//!     add r0, r0, r1; jnz r2, @loop   # comment
//! ```

use colored::Colorize;
use hashbrown::HashMap;

use crate::{
    backend::{
        isa::{
            Condition, EncodeError, FixupKind, Instruction, Opcode, Register, Shape,
            ShortCondition, Target, UnaryOperator, Width,
        },
        object::ObjectFile,
    },
    frontend::intern::{Symbol, SymbolTable},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsmItem {
    Label(Symbol),
    Instruction(Instruction),
}

impl core::fmt::Display for AsmItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsmItem::Label(label) => write!(f, "{}", format!("{label}:").bright_red()),
            AsmItem::Instruction(instruction) => write!(f, "    {instruction}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssembleError {
    #[error("label `{0}` is defined more than once")]
    DuplicateLabel(Symbol),
    #[error("short jump to `{0}`, which is not defined in the same object")]
    UnresolvedShortTarget(Symbol),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct AsmParseError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<(Symbol, u64)>,
    positions: SymbolTable<u64>,
    relocations: Vec<(u64, Symbol)>,
    /// (instruction start, slot, label) of short jumps to labels
    relative_fixups: Vec<(u64, u64, Symbol)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u64 {
        self.code.len() as u64
    }

    pub fn label(&mut self, name: Symbol) -> Result<(), AssembleError> {
        let position = self.position();

        if self.positions.insert(name, position).is_some() {
            return Err(AssembleError::DuplicateLabel(name));
        }

        self.labels.push((name, position));
        Ok(())
    }

    pub fn emit(&mut self, instruction: &Instruction) -> Result<(), AssembleError> {
        let start = self.position();

        if let Some(fixup) = instruction.encode(start, &mut self.code)? {
            let slot = start + fixup.offset as u64;

            match fixup.kind {
                FixupKind::Absolute => self.relocations.push((slot, fixup.label)),
                FixupKind::Relative => self.relative_fixups.push((start, slot, fixup.label)),
            }
        }

        Ok(())
    }

    pub fn emit_items(&mut self, items: &[AsmItem]) -> Result<(), AssembleError> {
        for item in items {
            match item {
                AsmItem::Label(label) => self.label(*label)?,
                AsmItem::Instruction(instruction) => self.emit(instruction)?,
            }
        }

        Ok(())
    }

    /// Resolves short jumps, which never leave the object
    pub fn finish(mut self) -> Result<ObjectFile, AssembleError> {
        for &(start, slot, label) in &self.relative_fixups {
            let target = *self
                .positions
                .get(&label)
                .ok_or(AssembleError::UnresolvedShortTarget(label))?;

            let offset = i16::try_from(target as i64 - start as i64).map_err(|_| {
                EncodeError::ShortJumpOutOfRange {
                    position: start,
                    target,
                }
            })?;

            let slot = slot as usize;
            self.code[slot..slot + 2].copy_from_slice(&offset.to_be_bytes());
        }

        Ok(ObjectFile {
            labels: self.labels,
            relocations: self.relocations,
            code: self.code,
        })
    }
}

/// Assembles a whole item list into an object
pub fn assemble(items: &[AsmItem]) -> Result<ObjectFile, AssembleError> {
    let mut assembler = Assembler::new();
    assembler.emit_items(items)?;
    assembler.finish()
}

/// Parses assembly text. Statements are separated by newlines or `;`, and
/// `#` starts a comment.
pub fn parse_assembly(text: &str) -> Result<Vec<AsmItem>, AsmParseError> {
    let mut items = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = line.split('#').next().unwrap_or_default();

        for statement in line.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let error = |message: String| AsmParseError {
                line: line_number,
                message,
            };

            if let Some(label) = statement.strip_suffix(':') {
                if !is_label_name(label) {
                    return Err(error(format!("invalid label name `{label}`")));
                }

                items.push(AsmItem::Label(Symbol::new(label)));
                continue;
            }

            items.push(AsmItem::Instruction(
                parse_instruction(statement).map_err(error)?,
            ));
        }
    }

    Ok(items)
}

fn is_label_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'))
}

fn parse_instruction(statement: &str) -> Result<Instruction, String> {
    let (mnemonic, rest) = statement
        .split_once(char::is_whitespace)
        .unwrap_or((statement, ""));

    let opcode: Opcode = mnemonic
        .parse()
        .map_err(|_| format!("unknown mnemonic `{mnemonic}`"))?;

    let operands: Vec<&str> = if rest.trim().is_empty() {
        Vec::new()
    } else {
        rest.split(',').map(str::trim).collect()
    };

    let expected = match opcode.shape() {
        Shape::Nothing => 0,
        Shape::Address | Shape::ShortOffset | Shape::Register => 1,
        Shape::RegisterAddress
        | Shape::RegisterShortOffset
        | Shape::TwoRegisters
        | Shape::RegisterImmediate(_) => 2,
        Shape::ThreeRegisters => 3,
    };

    if operands.len() != expected {
        return Err(format!(
            "`{mnemonic}` takes {expected} operand(s) but {} were given",
            operands.len()
        ));
    }

    let register = |i: usize| -> Result<Register, String> {
        operands[i]
            .parse()
            .map_err(|_| format!("expected register but found `{}`", operands[i]))
    };
    let target = |i: usize| -> Result<Target, String> { parse_target(operands[i]) };
    let width = opcode.access_width().unwrap_or(Width::Long);

    Ok(match opcode {
        Opcode::Jump => Instruction::Jump {
            condition: Condition::Always,
            target: target(0)?,
        },
        Opcode::JumpIfZero => Instruction::Jump {
            condition: Condition::Zero(register(0)?),
            target: target(1)?,
        },
        Opcode::JumpIfNotZero => Instruction::Jump {
            condition: Condition::NotZero(register(0)?),
            target: target(1)?,
        },
        Opcode::JumpIfPositive => Instruction::Jump {
            condition: Condition::Positive(register(0)?),
            target: target(1)?,
        },
        Opcode::JumpIfNonNegative => Instruction::Jump {
            condition: Condition::NonNegative(register(0)?),
            target: target(1)?,
        },
        Opcode::ShortJump => Instruction::ShortJump {
            condition: ShortCondition::Always,
            target: target(0)?,
        },
        Opcode::ShortJumpIfZero => Instruction::ShortJump {
            condition: ShortCondition::Zero(register(0)?),
            target: target(1)?,
        },
        Opcode::ShortJumpIfNotZero => Instruction::ShortJump {
            condition: ShortCondition::NotZero(register(0)?),
            target: target(1)?,
        },
        Opcode::Call => Instruction::Call { target: target(0)? },
        Opcode::Return => Instruction::Return,
        Opcode::Syscall => Instruction::Syscall,
        Opcode::LoadLong | Opcode::LoadInt | Opcode::LoadShort | Opcode::LoadByte => {
            Instruction::Load {
                width,
                destination: register(0)?,
                address: target(1)?,
            }
        }
        Opcode::LoadLongAt | Opcode::LoadIntAt | Opcode::LoadShortAt | Opcode::LoadByteAt => {
            Instruction::LoadAt {
                width,
                destination: register(0)?,
                base: register(1)?,
                index: register(2)?,
            }
        }
        Opcode::StoreLong | Opcode::StoreInt | Opcode::StoreShort | Opcode::StoreByte => {
            Instruction::Store {
                width,
                address: target(0)?,
                source: register(1)?,
            }
        }
        Opcode::StoreLongAt | Opcode::StoreIntAt | Opcode::StoreShortAt | Opcode::StoreByteAt => {
            Instruction::StoreAt {
                width,
                base: register(0)?,
                index: register(1)?,
                source: register(2)?,
            }
        }
        Opcode::Push => Instruction::Push(register(0)?),
        Opcode::Pop => Instruction::Pop(register(0)?),
        Opcode::Move => Instruction::Move {
            destination: register(0)?,
            source: register(1)?,
        },
        Opcode::Not | Opcode::Inv => Instruction::Unary {
            operator: if opcode == Opcode::Not {
                UnaryOperator::Not
            } else {
                UnaryOperator::Inv
            },
            destination: register(0)?,
            source: register(1)?,
        },
        Opcode::SetLong | Opcode::SetInt | Opcode::SetShort | Opcode::SetByte => {
            let value = parse_integer(operands[1])
                .ok_or_else(|| format!("expected integer but found `{}`", operands[1]))?;

            let bytes = width.bytes() as u32 * 8;
            let fits = bytes == 64 || (value >> (bytes - 1) == 0 || value >> (bytes - 1) == -1);
            if !fits {
                return Err(format!("{value} does not fit in `{mnemonic}`"));
            }

            Instruction::SetImmediate {
                width,
                destination: register(0)?,
                value,
            }
        }
        binary => Instruction::Binary {
            operator: binary
                .binary_operator()
                .ok_or_else(|| format!("unknown mnemonic `{mnemonic}`"))?,
            destination: register(0)?,
            lhs: register(1)?,
            rhs: register(2)?,
        },
    })
}

fn parse_target(text: &str) -> Result<Target, String> {
    if let Some(label) = text.strip_prefix('@') {
        if !is_label_name(label) {
            return Err(format!("invalid label name `{label}`"));
        }

        return Ok(Target::Label(Symbol::new(label)));
    }

    parse_integer(text)
        .map(|address| Target::Address(address as u64))
        .ok_or_else(|| format!("expected address or `@label` but found `{text}`"))
}

/// Decimal, `0x` hex or a `'c'` character, optionally negated
pub fn parse_integer(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(&hex.replace('_', ""), 16).ok()? as i64
    } else if let Some(inner) = digits.strip_prefix('\'').and_then(|d| d.strip_suffix('\'')) {
        parse_char(inner)?
    } else {
        let digits = digits.replace('_', "");
        if !digits.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        // Allows i64::MIN, whose magnitude doesn't fit an i64
        digits.parse::<u64>().ok()? as i64
    };

    Some(if negative {
        magnitude.wrapping_neg()
    } else {
        magnitude
    })
}

/// The body of a character literal, with the common escapes
pub fn parse_char(inner: &str) -> Option<i64> {
    let value = match inner {
        "\\n" => b'\n',
        "\\t" => b'\t',
        "\\r" => b'\r',
        "\\0" => 0,
        "\\\\" => b'\\',
        "\\'" => b'\'',
        other => {
            let mut chars = other.chars();
            let c = chars.next()?;
            if chars.next().is_some() || !c.is_ascii() {
                return None;
            }
            c as u8
        }
    };

    Some(i64::from(value))
}

/// Renders code as one instruction per line, with labels from `labels`
/// interleaved. Bytes that don't decode are shown as `.byte`.
pub fn disassemble(code: &[u8], labels: &[(Symbol, u64)]) -> String {
    let mut by_position: HashMap<u64, Vec<Symbol>> = HashMap::new();
    for &(label, position) in labels {
        by_position.entry(position).or_default().push(label);
    }

    let mut out = String::new();
    let mut position = 0;

    while position < code.len() {
        for label in by_position.get(&(position as u64)).into_iter().flatten() {
            out.push_str(&format!("{}\n", format!("{label}:").bright_red()));
        }

        match Instruction::decode(&code[position..], position as u64) {
            Ok((instruction, length)) => {
                out.push_str(&format!("{position:08x}    {instruction}\n"));
                position += length;
            }
            Err(_) => {
                out.push_str(&format!(
                    "{position:08x}    {} {:#04x}\n",
                    ".byte".dimmed(),
                    code[position]
                ));
                position += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::backend::isa::BinaryOperator;

    fn r(index: u8) -> Register {
        Register::new(index).unwrap()
    }

    #[test]
    fn parses_labels_and_separators() {
        let items = parse_assembly(indoc! {"
            top:
                add r0, r1, r2; jnz r0, @top   # loop
                setb r3, -1
                storelat sp, r1, r2
        "})
        .unwrap();

        assert_eq!(
            items,
            vec![
                AsmItem::Label(Symbol::new("top")),
                AsmItem::Instruction(Instruction::Binary {
                    operator: BinaryOperator::Add,
                    destination: r(0),
                    lhs: r(1),
                    rhs: r(2),
                }),
                AsmItem::Instruction(Instruction::Jump {
                    condition: Condition::NotZero(r(0)),
                    target: Target::Label(Symbol::new("top")),
                }),
                AsmItem::Instruction(Instruction::SetImmediate {
                    width: Width::Byte,
                    destination: r(3),
                    value: -1,
                }),
                AsmItem::Instruction(Instruction::StoreAt {
                    width: Width::Long,
                    base: Register::STACK_POINTER,
                    index: r(1),
                    source: r(2),
                }),
            ]
        );
    }

    #[test]
    fn reports_bad_statements_with_line_numbers() {
        let error = parse_assembly("ret\nfoo r1").unwrap_err();
        assert_eq!(error.line, 2);
        assert!(error.message.contains("unknown mnemonic"));

        assert!(parse_assembly("setb r1, 300").is_err());
        assert!(parse_assembly("mov r1").is_err());
        assert!(parse_assembly("push r32").is_err());
    }

    #[test]
    fn short_jumps_resolve_within_the_object() {
        let items = parse_assembly("back:\n jzs r1, @back\n jmps @next\nnext:\n ret").unwrap();
        let object = assemble(&items).unwrap();

        // jzs r1, -0 ; jmps +3
        assert_eq!(object.code, vec![0x07, 1, 0, 0, 0x06, 0, 3, 0x0A]);
        assert!(object.relocations.is_empty());

        let missing = parse_assembly("jmps @nowhere").unwrap();
        assert_eq!(
            assemble(&missing),
            Err(AssembleError::UnresolvedShortTarget(Symbol::new("nowhere")))
        );
    }

    #[test]
    fn long_targets_become_relocations() {
        let items = parse_assembly("f:\n call @g\n ret").unwrap();
        let object = assemble(&items).unwrap();

        assert_eq!(object.labels, vec![(Symbol::new("f"), 0)]);
        assert_eq!(object.relocations, vec![(1, Symbol::new("g"))]);
        assert!(matches!(
            assemble(&parse_assembly("a:\na:").unwrap()),
            Err(AssembleError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn disassembly_shows_labels_and_data() {
        let object = assemble(&parse_assembly("main:\n setb r0, 7\n ret").unwrap()).unwrap();
        let mut code = object.code.clone();
        code.push(0xEE);

        let text = strip_ansi_escapes::strip_str(disassemble(&code, &object.labels));
        assert_eq!(
            text,
            "main:\n00000000    setb r0, 7\n00000003    ret\n00000004    .byte 0xee\n"
        );
    }

    #[test]
    fn integers_in_every_spelling() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("-0x10"), Some(-16));
        assert_eq!(parse_integer("'A'"), Some(65));
        assert_eq!(parse_integer("'\\n'"), Some(10));
        assert_eq!(parse_integer("-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_integer("x1"), None);
    }
}

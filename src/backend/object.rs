//! Object files, executables and the linker.
//!
//! Both file kinds share one table layout: a big-endian `u32` entry count
//! followed by entries of `u8` name length, the name bytes and a big-endian
//! `u64` position. Objects carry positions relative to their own code.
//! Executables carry absolute positions, or no tables at all in the raw
//! form.

use log::debug;

use crate::{
    backend::isa::{Condition, Instruction, Target},
    frontend::intern::{Symbol, SymbolTable},
};

pub const OBJECT_MAGIC: u32 = 0x5501_2019;
pub const EXECUTABLE_MAGIC: u32 = 0x5510_2019;
pub const RAW_EXECUTABLE_MAGIC: u32 = 0x5500_2019;

/// Label every executable starts by jumping to
pub const ENTRY_LABEL: &str = "_start";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("bad magic number {found:#010x}")]
    BadMagic { found: u32 },
    #[error("file ends in the middle of a table")]
    Truncated,
    #[error("label name is not valid UTF-8")]
    InvalidLabel,
    #[error("label `{0}` is longer than 255 bytes")]
    LabelTooLong(Symbol),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("unresolved symbol `{0}`")]
    UnresolvedSymbol(Symbol),
    #[error("symbol `{0}` is defined more than once")]
    DuplicateSymbol(Symbol),
    #[error("malformed object: {0}")]
    MalformedObject(#[from] FormatError),
}

/// label -> position
pub type LabelTable = Vec<(Symbol, u64)>;
/// position of an address slot -> label whose address goes there
pub type RelocationTable = Vec<(u64, Symbol)>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectFile {
    pub labels: LabelTable,
    pub relocations: RelocationTable,
    pub code: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    /// Absent for raw executables
    pub maps: Option<(LabelTable, RelocationTable)>,
    pub code: Vec<u8>,
}

impl ObjectFile {
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = OBJECT_MAGIC.to_be_bytes().to_vec();
        write_labels(&mut out, &self.labels)?;
        write_relocations(&mut out, &self.relocations)?;
        out.extend(&self.code);

        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut reader = Reader { bytes, position: 0 };

        let magic = reader.u32()?;
        if magic != OBJECT_MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }

        let labels = reader.labels()?;
        let relocations = reader
            .labels()?
            .into_iter()
            .map(|(label, position)| (position, label))
            .collect();

        Ok(Self {
            labels,
            relocations,
            code: reader.rest().to_vec(),
        })
    }
}

impl Executable {
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::new();

        match &self.maps {
            Some((labels, relocations)) => {
                out.extend(EXECUTABLE_MAGIC.to_be_bytes());
                write_labels(&mut out, labels)?;
                write_relocations(&mut out, relocations)?;
            }
            None => out.extend(RAW_EXECUTABLE_MAGIC.to_be_bytes()),
        }

        out.extend(&self.code);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut reader = Reader { bytes, position: 0 };

        let maps = match reader.u32()? {
            EXECUTABLE_MAGIC => {
                let labels = reader.labels()?;
                let relocations = reader
                    .labels()?
                    .into_iter()
                    .map(|(label, position)| (position, label))
                    .collect();
                Some((labels, relocations))
            }
            RAW_EXECUTABLE_MAGIC => None,
            found => return Err(FormatError::BadMagic { found }),
        };

        Ok(Self {
            maps,
            code: reader.rest().to_vec(),
        })
    }

    pub fn labels(&self) -> &[(Symbol, u64)] {
        self.maps.as_ref().map_or(&[], |(labels, _)| labels.as_slice())
    }
}

fn write_entry(out: &mut Vec<u8>, label: Symbol, position: u64) -> Result<(), FormatError> {
    let name = label.value().as_bytes();
    let length = u8::try_from(name.len()).map_err(|_| FormatError::LabelTooLong(label))?;

    out.push(length);
    out.extend(name);
    out.extend(position.to_be_bytes());
    Ok(())
}

fn write_labels(out: &mut Vec<u8>, labels: &[(Symbol, u64)]) -> Result<(), FormatError> {
    out.extend((labels.len() as u32).to_be_bytes());
    labels
        .iter()
        .try_for_each(|&(label, position)| write_entry(out, label, position))
}

fn write_relocations(out: &mut Vec<u8>, relocations: &[(u64, Symbol)]) -> Result<(), FormatError> {
    out.extend((relocations.len() as u32).to_be_bytes());
    relocations
        .iter()
        .try_for_each(|&(position, label)| write_entry(out, label, position))
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], FormatError> {
        let slice = self
            .bytes
            .get(self.position..self.position + count)
            .ok_or(FormatError::Truncated)?;
        self.position += count;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, FormatError> {
        let mut buffer = [0; 8];
        buffer.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buffer))
    }

    fn labels(&mut self) -> Result<Vec<(Symbol, u64)>, FormatError> {
        let count = self.u32()?;
        let mut labels = Vec::new();

        for _ in 0..count {
            let length = self.take(1)?[0];
            let name = core::str::from_utf8(self.take(usize::from(length))?)
                .map_err(|_| FormatError::InvalidLabel)?;
            labels.push((Symbol::new(name), self.u64()?));
        }

        Ok(labels)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.position..]
    }
}

/// Concatenates objects behind a jump to `_start` and patches every
/// relocation slot with the absolute address of its label
pub fn link(objects: &[ObjectFile], raw: bool) -> Result<Executable, LinkError> {
    let entry = Symbol::new(ENTRY_LABEL);

    let mut code = Vec::new();
    let mut labels = LabelTable::new();
    let mut relocations = RelocationTable::new();
    let mut positions = SymbolTable::new();

    let jump = Instruction::Jump {
        condition: Condition::Always,
        target: Target::Label(entry),
    };
    // Encoding a label target can't fail, the slot is left as zero
    if let Ok(Some(fixup)) = jump.encode(0, &mut code) {
        relocations.push((fixup.offset as u64, fixup.label));
    }

    for object in objects {
        let base = code.len() as u64;

        for &(label, position) in &object.labels {
            let position = base.checked_add(position).ok_or(FormatError::Truncated)?;
            if positions.insert(label, position).is_some() {
                return Err(LinkError::DuplicateSymbol(label));
            }
            labels.push((label, position));
        }

        for &(position, label) in &object.relocations {
            let position = base.checked_add(position).ok_or(FormatError::Truncated)?;
            relocations.push((position, label));
        }

        code.extend(&object.code);
    }

    for &(slot, label) in &relocations {
        let address = *positions
            .get(&label)
            .ok_or(LinkError::UnresolvedSymbol(label))?;

        let bytes = usize::try_from(slot)
            .ok()
            .and_then(|slot| code.get_mut(slot..slot.checked_add(8)?))
            .ok_or(FormatError::Truncated)?;
        bytes.copy_from_slice(&address.to_be_bytes());
    }

    debug!(
        "linked {} object(s): {} bytes, {} labels, {} relocations",
        objects.len(),
        code.len(),
        labels.len(),
        relocations.len()
    );

    Ok(Executable {
        maps: (!raw).then_some((labels, relocations)),
        code,
    })
}

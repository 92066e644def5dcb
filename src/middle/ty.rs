//! The type registry. Types only matter in a few places: element widths of
//! memory accesses, `.length` of fixed arrays and which variables can be
//! indexed. Every scalar lives in a 64-bit register regardless of its type.

use colored::Colorize;
use hashbrown::HashMap;
use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, IntoStaticStr, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum PrimitiveKind {
    Long,
    Int,
    Short,
    Byte,
    Void,
}

impl PrimitiveKind {
    pub fn size(self) -> u64 {
        match self {
            PrimitiveKind::Long => 8,
            PrimitiveKind::Int => 4,
            PrimitiveKind::Short => 2,
            PrimitiveKind::Byte => 1,
            PrimitiveKind::Void => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// long, int, short, byte, void
    Primitive(PrimitiveKind),
    /// T*
    Pointer(Box<Type>),
    /// T[]
    ///
    /// A pointer to the first element, with the element count stored as a
    /// long directly before it
    DynamicArray(Box<Type>),
    /// T[N]
    FixedArray { element: Box<Type>, length: u64 },
}

impl Type {
    pub const LONG: Type = Type::Primitive(PrimitiveKind::Long);
    pub const VOID: Type = Type::Primitive(PrimitiveKind::Void);

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Primitive(PrimitiveKind::Void))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::DynamicArray(_) | Type::FixedArray { .. })
    }

    /// Arrays and pointers, i.e. anything that can alias memory
    pub fn is_indexable(&self) -> bool {
        matches!(
            self,
            Type::Pointer(_) | Type::DynamicArray(_) | Type::FixedArray { .. }
        )
    }

    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Pointer(element)
            | Type::DynamicArray(element)
            | Type::FixedArray { element, .. } => Some(element),
            Type::Primitive(_) => None,
        }
    }

    pub fn fixed_length(&self) -> Option<u64> {
        match self {
            Type::FixedArray { length, .. } => Some(*length),
            _ => None,
        }
    }

    /// The width in bytes of one element when this is indexed
    pub fn element_size(&self) -> Option<u64> {
        self.element().map(TypeRegistry::get_type_size)
    }

    /// Type of a value read out of this one by `a[i]`
    pub fn element_or_long(&self) -> Type {
        self.element().cloned().unwrap_or(Type::LONG)
    }

    pub fn colored(&self) -> colored::ColoredString {
        self.to_string().yellow()
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Primitive(kind) => write!(f, "{kind}"),
            Type::Pointer(element) => write!(f, "{element}*"),
            Type::DynamicArray(element) => write!(f, "{element}[]"),
            Type::FixedArray { element, length } => write!(f, "{element}[{length}]"),
        }
    }
}

/// Lookup service from type names to types
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    base_types: HashMap<&'static str, Type>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        let base_types = PrimitiveKind::iter()
            .map(|kind| (<&'static str>::from(kind), Type::Primitive(kind)))
            .collect();

        Self { base_types }
    }
}

impl TypeRegistry {
    /// Resolves a spelled type such as `byte*` or `long[4]`
    pub fn get_type(&self, name: &str) -> Option<Type> {
        let split = name.find(['*', '[']).unwrap_or(name.len());
        let (base, mut suffixes) = name.split_at(split);

        let mut ty = self.base_types.get(base.trim())?.clone();

        while !suffixes.is_empty() {
            if let Some(rest) = suffixes.strip_prefix('*') {
                ty = Type::Pointer(Box::new(ty));
                suffixes = rest;
            } else if let Some(rest) = suffixes.strip_prefix("[]") {
                ty = Type::DynamicArray(Box::new(ty));
                suffixes = rest;
            } else {
                let rest = suffixes.strip_prefix('[')?;
                let close = rest.find(']')?;
                let length = parse_length(&rest[..close])?;

                ty = Type::FixedArray {
                    element: Box::new(ty),
                    length,
                };
                suffixes = &rest[close + 1..];
            }

            if ty.element().is_some_and(Type::is_void) {
                return None;
            }
        }

        Some(ty)
    }

    /// Size in bytes of a value of this type in memory. Pointers and dynamic
    /// arrays are a single address.
    pub fn get_type_size(ty: &Type) -> u64 {
        match ty {
            Type::Primitive(kind) => kind.size(),
            Type::Pointer(_) | Type::DynamicArray(_) => 8,
            Type::FixedArray { element, length } => Self::get_type_size(element) * length,
        }
    }

    pub fn is_type_name(&self, name: &str) -> bool {
        self.base_types.contains_key(name)
    }
}

fn parse_length(text: &str) -> Option<u64> {
    let text = text.trim();

    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_composite_types() {
        let registry = TypeRegistry::default();

        let ty = registry.get_type("byte[16]").unwrap();
        assert_eq!(ty.fixed_length(), Some(16));
        assert_eq!(ty.element_size(), Some(1));
        assert_eq!(TypeRegistry::get_type_size(&ty), 16);

        let ty = registry.get_type("int*[]").unwrap();
        assert_eq!(ty.to_string(), "int*[]");
        assert_eq!(ty.element_size(), Some(8));

        assert_eq!(registry.get_type("long"), Some(Type::LONG));
    }

    #[test]
    fn rejects_unknown_and_void_elements() {
        let registry = TypeRegistry::default();

        assert_eq!(registry.get_type("float"), None);
        assert_eq!(registry.get_type("void[]"), None);
        assert_eq!(registry.get_type("long[x]"), None);
        assert_eq!(registry.get_type("long[4"), None);
    }
}

//! String interning. Every identifier, label and function name in the
//! pipeline is a [`Symbol`], so symbol tables hash a `u32` instead of a
//! string.

use std::sync::RwLock;

use hashbrown::HashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Default)]
pub struct InterningTable {
    inner: RwLock<InterningTableInner>,
}

#[derive(Debug, Default)]
struct InterningTableInner {
    strings: Vec<&'static str>,
    indices: HashMap<&'static str, u32>,
}

pub static INTERNING_TABLE: Lazy<InterningTable> = Lazy::new(Default::default);

impl InterningTable {
    pub fn get(&self, index: u32) -> Option<&'static str> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        inner.strings.get(index as usize).copied()
    }

    pub fn insert_if_absent(&self, string: &str) -> u32 {
        if let Some(index) = self.index_of(string) {
            return index;
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        // Someone may have raced us between the read and write lock
        if let Some(index) = inner.indices.get(string) {
            return *index;
        }

        let leaked: &'static str = Box::leak(string.to_owned().into_boxed_str());
        let index = inner.strings.len() as u32;
        inner.strings.push(leaked);
        inner.indices.insert(leaked, index);
        index
    }

    pub fn index_of(&self, string: &str) -> Option<u32> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        inner.indices.get(string).copied()
    }
}

/// An index into the string interning table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
    pub fn new(value: &str) -> Self {
        Self(INTERNING_TABLE.insert_if_absent(value))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn value(self) -> &'static str {
        // Strings are leaked on insertion and never removed, so any symbol
        // that exists has a backing string
        INTERNING_TABLE.get(self.0).unwrap_or("")
    }

    /// Literals are told apart from names by their first character
    pub fn starts_with_digit(self) -> bool {
        self.value().starts_with(|c: char| c.is_ascii_digit())
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl core::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Symbol").field(&self.value()).finish()
    }
}

impl core::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

/// String-keyed associative map used for every symbol table in the pipeline
pub type SymbolTable<V> = HashMap<Symbol, V>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = Symbol::new("interning_is_stable");
        let b = Symbol::new("interning_is_stable");
        let c = Symbol::new("interning_is_stable_other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.value(), "interning_is_stable");
    }

    #[test]
    fn symbol_table_lookup() {
        let mut table = SymbolTable::new();
        table.insert(Symbol::new("x"), 1);
        table.insert(Symbol::new("y"), 2);

        assert_eq!(table.get(&Symbol::new("x")), Some(&1));
        assert_eq!(table.get(&Symbol::new("z")), None);
    }
}

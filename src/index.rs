use std::{fmt::Debug, hash::Hash, marker::PhantomData};

/// Ids of things stored in an [`IndexVec`], such as the basic blocks of a
/// control flow graph
pub trait Index: Copy + 'static + Eq + Debug + Hash {
    fn new(position: usize) -> Self;

    fn index(self) -> usize;
}

/// Declares a `u32` id type usable as an [`Index`]
macro_rules! simple_index {
    ($(#[$attr:meta])* $vis:vis struct $name:ident;) => {
        $(#[$attr])*
        #[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
        $vis struct $name(u32);

        impl $crate::index::Index for $name {
            fn new(position: usize) -> Self {
                Self(position as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

pub(crate) use simple_index;

/// Blocks of a graph, addressed by their id.
///
/// Ids are positions, so rewrites that reorder `raw` must be followed by
/// rebuilding whatever holds ids into it.
pub struct IndexVec<I: Index, T> {
    pub raw: Vec<T>,
    _marker: PhantomData<fn(&I)>,
}

impl<I: Index, T> IndexVec<I, T> {
    pub const fn new() -> Self {
        IndexVec {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Appends `value` and returns its id
    pub fn push(&mut self, value: T) -> I {
        let id = I::new(self.raw.len());
        self.raw.push(value);
        id
    }

    /// Every id in layout order
    pub fn indices(&self) -> impl Iterator<Item = I> + use<I, T> {
        (0..self.raw.len()).map(I::new)
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl<I: Index, T: Debug> Debug for IndexVec<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.indices().zip(self.raw.iter()))
            .finish()
    }
}

impl<I: Index, T> core::ops::Index<I> for IndexVec<I, T> {
    type Output = T;

    fn index(&self, id: I) -> &T {
        &self.raw[id.index()]
    }
}

impl<I: Index, T> core::ops::IndexMut<I> for IndexVec<I, T> {
    fn index_mut(&mut self, id: I) -> &mut T {
        &mut self.raw[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    simple_index! {
        struct NodeId;
    }

    #[test]
    fn ids_follow_push_order() {
        let mut nodes: IndexVec<NodeId, &str> = IndexVec::new();
        let entry = nodes.push("entry");
        let exit = nodes.push("exit");

        assert_eq!((entry.index(), exit.index()), (0, 1));
        assert_eq!(nodes[exit], "exit");
        assert_eq!(nodes.indices().collect::<Vec<_>>(), [entry, exit]);

        nodes[entry] = "start";
        assert_eq!(format!("{nodes:?}"), r#"{NodeId(0): "start", NodeId(1): "exit"}"#);
    }
}

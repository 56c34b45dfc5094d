//! Result shapes and shape-indexed trees.
//!
//! Programs return a possibly nested tuple of arrays. A [`ShapeIndex`] is the path
//! of tuple positions from the root to one element; the empty path is the root.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::fmt;

use smallvec::SmallVec;

/// Path into a nested tuple shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeIndex(SmallVec<[usize; 4]>);

impl ShapeIndex {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(path: &[usize]) -> Self {
        Self(SmallVec::from_slice(path))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the `position`-th element of the tuple at `self`.
    pub fn child(&self, position: usize) -> Self {
        let mut path = self.0.clone();
        path.push(position);
        Self(path)
    }
}

impl From<&[usize]> for ShapeIndex {
    fn from(path: &[usize]) -> Self {
        Self::new(path)
    }
}

impl<const N: usize> From<[usize; N]> for ShapeIndex {
    fn from(path: [usize; N]) -> Self {
        Self::new(&path)
    }
}

impl fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, position) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{position}")?;
        }
        write!(f, "}}")
    }
}

/// Shape of a program result: arrays of a fixed byte size, possibly nested in tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Array { byte_size: usize },
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(byte_size: usize) -> Self {
        Self::Array { byte_size }
    }

    pub fn tuple(elements: impl IntoIterator<Item = Shape>) -> Self {
        Self::Tuple(elements.into_iter().collect())
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    /// Byte size of an array shape; `None` for tuples.
    pub fn byte_size(&self) -> Option<usize> {
        match self {
            Self::Array { byte_size } => Some(*byte_size),
            Self::Tuple(_) => None,
        }
    }

    pub fn subshape(&self, index: &ShapeIndex) -> Option<&Shape> {
        index.as_slice().iter().try_fold(self, |shape, &position| match shape {
            Self::Tuple(elements) => elements.get(position),
            Self::Array { .. } => None,
        })
    }

    /// Indices of every array leaf, in depth-first order.
    pub fn leaf_indices(&self) -> Vec<ShapeIndex> {
        let mut leaves = Vec::new();
        self.collect_leaves(ShapeIndex::root(), &mut leaves);
        leaves
    }

    fn collect_leaves(&self, at: ShapeIndex, leaves: &mut Vec<ShapeIndex>) {
        match self {
            Self::Array { .. } => leaves.push(at),
            Self::Tuple(elements) => {
                for (position, element) in elements.iter().enumerate() {
                    element.collect_leaves(at.child(position), leaves);
                }
            }
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array { byte_size } => write!(f, "u8[{byte_size}]"),
            Self::Tuple(elements) => {
                write!(f, "(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{element}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Values attached to the leaves of a [`Shape`].
#[derive(Debug)]
pub struct ShapeTree<T> {
    shape: Shape,
    leaves: BTreeMap<ShapeIndex, T>,
}

impl<T> ShapeTree<T> {
    pub fn new(shape: Shape) -> Self {
        Self { shape, leaves: BTreeMap::new() }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Attach `value` to the leaf at `index`, returning the previous value.
    pub fn insert(&mut self, index: ShapeIndex, value: T) -> Option<T> {
        self.leaves.insert(index, value)
    }

    pub fn get(&self, index: &ShapeIndex) -> Option<&T> {
        self.leaves.get(index)
    }

    pub fn take(&mut self, index: &ShapeIndex) -> Option<T> {
        self.leaves.remove(index)
    }

    /// Value at the root; only present for array-shaped results.
    pub fn root(&self) -> Option<&T> {
        self.leaves.get(&ShapeIndex::root())
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ShapeIndex, T> {
        self.leaves.iter()
    }
}

impl<T> IntoIterator for ShapeTree<T> {
    type Item = (ShapeIndex, T);
    type IntoIter = btree_map::IntoIter<ShapeIndex, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.leaves.into_iter()
    }
}

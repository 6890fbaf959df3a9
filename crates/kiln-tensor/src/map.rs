//! Ordered parameter-name to tensor mappings.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::tensor::Tensor;

/// A mapping from unique parameter paths to tensors.
///
/// Keys iterate in lexicographic order, so anything written from a
/// `TensorMap` comes out in the same order every time.
///
/// # Examples
///
/// ```
/// use kiln_tensor::{DType, Tensor, TensorMap};
///
/// let mut map = TensorMap::new();
/// map.insert("b.weight", Tensor::zeros(DType::F32, &[2]));
/// map.insert("a.weight", Tensor::zeros(DType::F32, &[3]));
///
/// let keys: Vec<_> = map.keys().collect();
/// assert_eq!(keys, vec!["a.weight", "b.weight"]);
/// assert_eq!(map.total_bytes(), 20);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorMap {
    entries: BTreeMap<String, Tensor>,
}

impl TensorMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor, returning the previous tensor under that name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.entries.insert(name.into(), tensor)
    }

    /// Returns the tensor stored under `name`.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.get(name)
    }

    /// Returns a mutable reference to the tensor stored under `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.entries.get_mut(name)
    }

    /// Removes and returns the tensor stored under `name`.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.entries.remove(name)
    }

    /// Returns whether `name` is present.
    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the map holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parameter names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `(name, tensor)` pairs in order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.entries.iter()
    }

    /// Sum of the payload sizes of all tensors.
    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(Tensor::nbytes).sum()
    }

    /// Sum of the element counts of all tensors.
    pub fn total_elements(&self) -> usize {
        self.entries.values().map(Tensor::numel).sum()
    }
}

impl Index<&str> for TensorMap {
    type Output = Tensor;

    /// Panics if `name` is not present, like `BTreeMap` indexing.
    fn index(&self, name: &str) -> &Tensor {
        &self.entries[name]
    }
}

impl FromIterator<(String, Tensor)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Extend<(String, Tensor)> for TensorMap {
    fn extend<I: IntoIterator<Item = (String, Tensor)>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl IntoIterator for TensorMap {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a TensorMap {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

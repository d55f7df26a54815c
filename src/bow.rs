use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap};
use std::iter::Peekable;

use crate::{NodeId, WordId, WordValue};

/// Norm used to rescale a bag-of-words vector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LNorm {
    L1,
    L2,
}

/// Bag-of-Words representation of an image or descriptor set.
///
/// Sparse map from word id to weight, iterated in ascending word id order.
/// Zero entries are never stored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BowVector(BTreeMap<WordId, WordValue>);

impl BowVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to the weight of `word`, inserting it if absent.
    pub fn add_weight(&mut self, word: WordId, value: WordValue) {
        if value != 0. {
            *self.0.entry(word).or_insert(0.) += value;
        }
    }

    /// Set the weight of `word` to `value` unless the word is already present.
    pub fn add_if_absent(&mut self, word: WordId, value: WordValue) {
        if value != 0. {
            self.0.entry(word).or_insert(value);
        }
    }

    pub fn get(&self, word: WordId) -> Option<WordValue> {
        self.0.get(&word).copied()
    }

    /// Number of nonzero words.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in ascending word id order.
    pub fn iter(&self) -> impl Iterator<Item = (WordId, WordValue)> + '_ {
        self.0.iter().map(|(&w, &v)| (w, v))
    }

    /// Rescale so that the vector has unit norm. A vector with zero norm is
    /// cleared rather than divided.
    pub fn normalize(&mut self, norm: LNorm) {
        let n = match norm {
            LNorm::L1 => self.0.values().map(|v| v.abs()).sum::<WordValue>(),
            LNorm::L2 => self.0.values().map(|v| v * v).sum::<WordValue>().sqrt(),
        };
        if n > 0. {
            let inv = 1. / n;
            for v in self.0.values_mut() {
                *v *= inv;
            }
        } else {
            self.0.clear();
        }
    }

    /// Pairs of weights for the words present in both vectors, merge-joined in
    /// ascending word id order.
    pub(crate) fn common<'a>(&'a self, other: &'a Self) -> Common<'a, WordId, WordValue> {
        Common::new(self.0.iter(), other.0.iter())
    }
}

impl FromIterator<(WordId, WordValue)> for BowVector {
    fn from_iter<I: IntoIterator<Item = (WordId, WordValue)>>(iter: I) -> Self {
        Self(iter.into_iter().filter(|&(_, v)| v != 0.).collect())
    }
}

/// This type represents a map from nodes of the vocabulary tree, at a fixed
/// level, to the local indices of the features that went through them.
///
/// Intersecting two feature vectors gives candidate correspondences between
/// the features of two images.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FeatureVector(BTreeMap<NodeId, Vec<usize>>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that local feature `feature` routed through `node`.
    pub fn add_feature(&mut self, node: NodeId, feature: usize) {
        self.0.entry(node).or_default().push(feature);
    }

    pub fn get(&self, node: NodeId) -> Option<&[usize]> {
        self.0.get(&node).map(Vec::as_slice)
    }

    /// Number of distinct nodes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in ascending node id order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &[usize])> + '_ {
        self.0.iter().map(|(&n, f)| (n, f.as_slice()))
    }

    /// Nodes shared with `other`, with the local features of each side.
    pub fn correspondences<'a>(&'a self, other: &'a Self) -> Vec<(NodeId, &'a [usize], &'a [usize])> {
        let mut out = Vec::new();
        let mut a = self.0.iter().peekable();
        let mut b = other.0.iter().peekable();
        while let (Some(&(na, fa)), Some(&(nb, fb))) = (a.peek(), b.peek()) {
            if na < nb {
                a.next();
            } else if nb < na {
                b.next();
            } else {
                out.push((*na, fa.as_slice(), fb.as_slice()));
                a.next();
                b.next();
            }
        }
        out
    }
}

impl FromIterator<(NodeId, Vec<usize>)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (NodeId, Vec<usize>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Merge-join over two sorted maps, yielding the values of shared keys.
pub(crate) struct Common<'a, K, V> {
    a: Peekable<btree_map::Iter<'a, K, V>>,
    b: Peekable<btree_map::Iter<'a, K, V>>,
}

impl<'a, K, V> Common<'a, K, V> {
    fn new(a: btree_map::Iter<'a, K, V>, b: btree_map::Iter<'a, K, V>) -> Self {
        Self {
            a: a.peekable(),
            b: b.peekable(),
        }
    }
}

impl<'a, K: Ord, V: Copy> Iterator for Common<'a, K, V> {
    type Item = (V, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (ka, kb) = match (self.a.peek(), self.b.peek()) {
                (Some((ka, _)), Some((kb, _))) => (*ka, *kb),
                _ => return None,
            };
            match ka.cmp(kb) {
                std::cmp::Ordering::Less => {
                    self.a.next();
                }
                std::cmp::Ordering::Greater => {
                    self.b.next();
                }
                std::cmp::Ordering::Equal => {
                    let (_, va) = self.a.next()?;
                    let (_, vb) = self.b.next()?;
                    return Some((*va, *vb));
                }
            }
        }
    }
}

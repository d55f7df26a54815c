use bitvec::prelude::*;

use crate::{BowErr, BowResult};

/// The most commonly used keypoint descriptor data type: a 256-bit binary array.
/// It is used by ORB and BRIEF, for example.
pub type Desc = [u8; 32];

/// Operations the vocabulary needs from a binary descriptor.
///
/// Bits are read most-significant first within each byte, so bit `i` of a
/// descriptor is bit `7 - i % 8` of byte `i / 8`.
///
/// Implemented for fixed-size byte arrays (`[u8; N]`) and for `Vec<u8>`, whose
/// length is only known at runtime.
pub trait Descriptor: Clone + PartialEq + Send + Sync {
    /// Packed descriptor bytes.
    fn as_bytes(&self) -> &[u8];

    /// Rebuild a descriptor from its token sequence (the packed bytes).
    fn from_tokens(tokens: &[u8]) -> BowResult<Self>;

    /// Length of the descriptor in bits.
    fn bit_len(&self) -> usize {
        self.as_bytes().len() * 8
    }

    /// Hamming distance. Symmetric, and zero iff both descriptors are equal.
    ///
    /// Both descriptors must have the same length; extra bytes of the longer
    /// one are ignored. [`Descriptor::try_distance`] checks the lengths.
    fn distance(&self, other: &Self) -> u32 {
        hamming(self.as_bytes(), other.as_bytes())
    }

    /// Hamming distance, failing with [`BowErr::DimensionMismatch`] when the
    /// descriptors differ in length.
    fn try_distance(&self, other: &Self) -> BowResult<u32> {
        if self.bit_len() != other.bit_len() {
            return Err(BowErr::DimensionMismatch {
                expected: self.bit_len(),
                found: other.bit_len(),
            });
        }
        Ok(self.distance(other))
    }

    /// Ordered token sequence that [`Descriptor::from_tokens`] inverts exactly.
    fn to_tokens(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// Bitwise majority vote: bit `i` of the result is set iff strictly more
    /// than half of `descriptors` have bit `i` set.
    ///
    /// Returns `None` for an empty set, and [`BowErr::DimensionMismatch`]
    /// when the descriptors differ in length.
    fn mean(descriptors: &[&Self]) -> BowResult<Option<Self>> {
        let first = match descriptors.first() {
            Some(d) => *d,
            None => return Ok(None),
        };
        let bits = first.bit_len();
        if let Some(d) = descriptors.iter().find(|d| d.bit_len() != bits) {
            return Err(BowErr::DimensionMismatch {
                expected: bits,
                found: d.bit_len(),
            });
        }
        if descriptors.len() == 1 {
            return Ok(Some(first.clone()));
        }

        let n2 = descriptors.len() / 2;
        let n_bytes = first.as_bytes().len();
        let mut counts = vec![0usize; n_bytes * 8];
        for d in descriptors {
            let bits = d.as_bytes().view_bits::<Msb0>().iter().by_vals();
            for (c, b) in counts.iter_mut().zip(bits) {
                if b {
                    *c += 1;
                }
            }
        }

        let mut result = vec![0u8; n_bytes];
        let result_bits = result.view_bits_mut::<Msb0>();
        for (i, &c) in counts.iter().enumerate() {
            if c > n2 {
                result_bits.set(i, true);
            }
        }
        Self::from_tokens(&result).map(Some)
    }

    /// One row per descriptor with one 0/1 column per bit.
    fn to_dense_matrix(descriptors: &[Self]) -> Vec<Vec<f32>> {
        descriptors
            .iter()
            .map(|d| {
                d.as_bytes()
                    .view_bits::<Msb0>()
                    .iter()
                    .by_vals()
                    .map(|b| if b { 1. } else { 0. })
                    .collect()
            })
            .collect()
    }
}

impl<const N: usize> Descriptor for [u8; N] {
    fn as_bytes(&self) -> &[u8] {
        self
    }

    fn from_tokens(tokens: &[u8]) -> BowResult<Self> {
        tokens.try_into().map_err(|_| BowErr::DimensionMismatch {
            expected: N * 8,
            found: tokens.len() * 8,
        })
    }

    fn bit_len(&self) -> usize {
        N * 8
    }
}

impl Descriptor for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }

    fn from_tokens(tokens: &[u8]) -> BowResult<Self> {
        Ok(tokens.to_vec())
    }
}

#[inline]
/// Hamming distance between two binary arrays (descriptors).
pub(crate) fn hamming(x: &[u8], y: &[u8]) -> u32 {
    x.iter()
        .zip(y)
        .fold(0, |a, (b, c)| a + (*b ^ *c).count_ones())
}

/// Check that every descriptor in `set` has `expected` bits.
pub(crate) fn check_dims<D: Descriptor>(set: &[D], expected: usize) -> BowResult<()> {
    match set.iter().find(|d| d.bit_len() != expected) {
        Some(d) => Err(BowErr::DimensionMismatch {
            expected,
            found: d.bit_len(),
        }),
        None => Ok(()),
    }
}

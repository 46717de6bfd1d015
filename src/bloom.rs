//! Scalable bloom filter: a stack of fixed-size layers.
//!
//! Each layer uses double hashing `h1 + i * h2` over two seeded XxHash64 values.
//! When the newest layer reaches its capacity a larger one is stacked on top, so a
//! bloom never has to be sized up front. Membership is the OR over all layers.
//!
//! Wire format: `varint layer_count`, then per layer `u8 num_hashes`, `varint capacity`,
//! `varint count`, `varint word_count`, `word_count x u64 LE`.

use crate::encoding::{read_u64, read_u8, read_var_u32, read_var_u64, write_u64, write_var_u64};
use crate::error::{BloomError, Result};

use std::f64::consts::LN_2;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Capacity of the first layer allocated by [`Bloom::insert`] on an empty bloom.
pub const DEFAULT_CAPACITY: u32 = 1024;
/// Target false-positive rate of the first layer.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

const MAX_HASHES: u32 = 16;
const SEED_1: u64 = 0x9E37_79B9_7F4A_7C15;
const SEED_2: u64 = 0xC2B2_AE3D_27D4_EB4F;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BloomLayer {
    words: Vec<u64>,
    num_hashes: u8,
    capacity: u32,
    count: u32,
}

impl BloomLayer {
    fn with_capacity(capacity: u32, false_positive_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let p = false_positive_rate.clamp(1e-9, 0.5);
        // m = -n * ln(p) / (ln 2)^2, at least one word.
        let bits = (-(capacity as f64) * p.ln() / (LN_2 * LN_2)).ceil() as usize;
        let words = bits.max(64).div_ceil(64);
        let num_bits = (words * 64) as f64;
        // k = (m / n) * ln 2
        let k = ((num_bits / capacity as f64) * LN_2).round() as u32;
        Self {
            words: vec![0u64; words],
            num_hashes: k.clamp(1, MAX_HASHES) as u8,
            capacity,
            count: 0,
        }
    }

    /// Next layer in the stack: twice the capacity and bits, same hash count.
    fn grown(&self) -> Self {
        Self {
            words: vec![0u64; self.words.len().saturating_mul(2)],
            num_hashes: self.num_hashes,
            capacity: self.capacity.saturating_mul(2),
            count: 0,
        }
    }

    #[inline]
    fn num_bits(&self) -> u64 {
        self.words.len() as u64 * 64
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    fn same_shape(&self, other: &BloomLayer) -> bool {
        self.words.len() == other.words.len()
            && self.num_hashes == other.num_hashes
            && self.capacity == other.capacity
    }

    #[inline]
    fn position(&self, h1: u64, h2: u64, i: u32) -> (usize, u64) {
        let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits();
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn insert(&mut self, h1: u64, h2: u64) {
        let mut changed = false;
        for i in 0..self.num_hashes as u32 {
            let (word, mask) = self.position(h1, h2, i);
            if self.words[word] & mask == 0 {
                self.words[word] |= mask;
                changed = true;
            }
        }
        if changed {
            self.count = self.count.saturating_add(1);
        }
    }

    fn test(&self, h1: u64, h2: u64) -> bool {
        (0..self.num_hashes as u32).all(|i| {
            let (word, mask) = self.position(h1, h2, i);
            self.words[word] & mask != 0
        })
    }

    fn union(&mut self, other: &BloomLayer) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= *b;
        }
        self.count = self.count.saturating_add(other.count);
    }
}

/// Probabilistic set of byte-string tokens. No false negatives.
///
/// An empty bloom allocates nothing until the first insert, so series without any
/// chunk content cost a single byte on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bloom {
    layers: Vec<BloomLayer>,
}

impl Bloom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocates the first layer for `capacity` keys at the given false-positive rate.
    pub fn with_capacity(capacity: u32, false_positive_rate: f64) -> Self {
        Self {
            layers: vec![BloomLayer::with_capacity(capacity, false_positive_rate)],
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        if self.layers.iter().any(|l| l.test(h1, h2)) {
            return;
        }
        let next = match self.layers.last() {
            None => Some(BloomLayer::with_capacity(
                DEFAULT_CAPACITY,
                DEFAULT_FALSE_POSITIVE_RATE,
            )),
            Some(last) if last.is_full() => Some(last.grown()),
            Some(_) => None,
        };
        if let Some(layer) = next {
            self.layers.push(layer);
        }
        if let Some(last) = self.layers.last_mut() {
            last.insert(h1, h2);
        }
    }

    /// `false` means the key was definitely never inserted.
    pub fn test(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        self.layers.iter().any(|l| l.test(h1, h2))
    }

    /// Adds every member of `other` to `self`.
    ///
    /// Layers at the same depth with the same shape are OR-ed together; anything
    /// else is stacked as an extra layer.
    pub fn union(&mut self, other: &Bloom) {
        for (depth, layer) in other.layers.iter().enumerate() {
            match self.layers.get_mut(depth) {
                Some(mine) if mine.same_shape(layer) => mine.union(layer),
                _ => self.layers.push(layer.clone()),
            }
        }
    }

    /// True when nothing was ever inserted.
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.count == 0)
    }

    /// Approximate number of distinct keys inserted.
    pub fn count(&self) -> u64 {
        self.layers.iter().map(|l| l.count as u64).sum()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Size of the bit arrays in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.words.len() * 8).sum()
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        write_var_u64(buf, self.layers.len() as u64);
        for layer in &self.layers {
            buf.push(layer.num_hashes);
            write_var_u64(buf, layer.capacity as u64);
            write_var_u64(buf, layer.count as u64);
            write_var_u64(buf, layer.words.len() as u64);
            for w in &layer.words {
                write_u64(buf, *w);
            }
        }
    }

    pub(crate) fn decode_from(r: &mut &[u8]) -> Result<Self> {
        let layer_count = read_var_u64(r)? as usize;
        if layer_count > r.len() {
            return Err(BloomError::corruption(format!(
                "Bloom claims {} layers in {} bytes",
                layer_count,
                r.len()
            )));
        }
        let mut layers = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            let num_hashes = read_u8(r)?;
            if num_hashes == 0 || num_hashes as u32 > MAX_HASHES {
                return Err(BloomError::corruption(format!(
                    "Invalid bloom hash count {}",
                    num_hashes
                )));
            }
            let capacity = read_var_u32(r)?;
            let count = read_var_u32(r)?;
            let word_count = read_var_u64(r)? as usize;
            if word_count == 0 || word_count > r.len() / 8 {
                return Err(BloomError::corruption(format!(
                    "Invalid bloom layer word count {}",
                    word_count
                )));
            }
            let mut words = Vec::with_capacity(word_count);
            for _ in 0..word_count {
                words.push(read_u64(r)?);
            }
            layers.push(BloomLayer {
                words,
                num_hashes,
                capacity,
                count,
            });
        }
        Ok(Self { layers })
    }
}

#[inline]
fn hash_pair(key: &[u8]) -> (u64, u64) {
    let mut a = XxHash64::with_seed(SEED_1);
    a.write(key);
    let mut b = XxHash64::with_seed(SEED_2);
    b.write(key);
    // An odd step visits distinct bits for every i.
    (a.finish(), b.finish() | 1)
}

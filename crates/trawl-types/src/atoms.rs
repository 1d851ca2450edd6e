//! Interned atom tables.
//!
//! Every atom (symbol, string, instance name, integer, float, bitmap) is
//! stored once and assigned a dense `bucket` index in insertion order. The
//! bucket is the hash ingredient the RETE memory folds use, and it doubles
//! as the dense reference index written into a binary image, so insertion
//! order is part of the engine's observable behavior.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Lexeme sub-kind. Symbols, strings, and instance names with equal text
/// intern to distinct atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LexemeKind {
    Symbol,
    Str,
    InstanceName,
}

#[derive(Debug)]
struct Interner<K: std::hash::Hash + Eq + Clone> {
    index: AHashMap<K, u64>,
    entries: Vec<K>,
}

impl<K: std::hash::Hash + Eq + Clone> Default for Interner<K> {
    fn default() -> Self {
        Self {
            index: AHashMap::default(),
            entries: Vec::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone> Interner<K> {
    fn intern(&mut self, key: K) -> u64 {
        if let Some(&bucket) = self.index.get(&key) {
            return bucket;
        }
        let bucket = self.entries.len() as u64;
        self.entries.push(key.clone());
        self.index.insert(key, bucket);
        bucket
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Process-wide atom tables for one engine environment.
///
/// Single-threaded by design; the engine owns exactly one table and all
/// interning happens on the calling thread.
#[derive(Debug, Default)]
pub struct AtomTable {
    lexemes: Interner<(LexemeKind, String)>,
    integers: Interner<i64>,
    floats: Interner<u64>,
    bitmaps: Interner<Vec<u8>>,
}

impl AtomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a lexeme and return its bucket.
    pub fn intern_lexeme(&mut self, kind: LexemeKind, text: &str) -> u64 {
        self.lexemes.intern((kind, text.to_string()))
    }

    /// Intern an integer atom and return its bucket.
    pub fn intern_integer(&mut self, value: i64) -> u64 {
        self.integers.intern(value)
    }

    /// Intern a float atom and return its bucket. NaN payloads are
    /// distinguished by bit pattern, matching the image payload encoding.
    pub fn intern_float(&mut self, value: f64) -> u64 {
        self.floats.intern(value.to_bits())
    }

    /// Intern a bitmap atom and return its bucket.
    pub fn intern_bitmap(&mut self, bytes: &[u8]) -> u64 {
        self.bitmaps.intern(bytes.to_vec())
    }

    /// Bucket value a hash fold should contribute for `value`.
    ///
    /// Multifields contribute zero, as the right-hash fold of the original
    /// engine did for types its switch did not name.
    pub fn bucket_of(&mut self, value: &Value) -> u64 {
        match value {
            Value::Symbol(s) => self.intern_lexeme(LexemeKind::Symbol, s),
            Value::Str(s) => self.intern_lexeme(LexemeKind::Str, s),
            Value::InstanceName(s) => self.intern_lexeme(LexemeKind::InstanceName, s),
            Value::Integer(i) => self.intern_integer(*i),
            Value::Float(f) => self.intern_float(*f),
            Value::Boolean(b) => {
                self.intern_lexeme(LexemeKind::Symbol, if *b { "TRUE" } else { "FALSE" })
            }
            Value::Multifield(_) => 0,
        }
    }

    /// Bucket of an already-interned lexeme.
    pub fn lookup_lexeme(&self, kind: LexemeKind, text: &str) -> Option<u64> {
        self.lexemes.index.get(&(kind, text.to_string())).copied()
    }

    /// Bucket of an already-interned integer.
    pub fn lookup_integer(&self, value: i64) -> Option<u64> {
        self.integers.index.get(&value).copied()
    }

    /// Bucket of an already-interned float bit pattern.
    pub fn lookup_float_bits(&self, bits: u64) -> Option<u64> {
        self.floats.index.get(&bits).copied()
    }

    /// Lexemes in bucket order, for image writing.
    pub fn lexemes(&self) -> impl Iterator<Item = (LexemeKind, &str)> {
        self.lexemes.entries.iter().map(|(k, s)| (*k, s.as_str()))
    }

    /// Integers in bucket order.
    pub fn integers(&self) -> impl Iterator<Item = i64> + '_ {
        self.integers.entries.iter().copied()
    }

    /// Float bit patterns in bucket order.
    pub fn float_bits(&self) -> impl Iterator<Item = u64> + '_ {
        self.floats.entries.iter().copied()
    }

    /// Bitmaps in bucket order.
    pub fn bitmaps(&self) -> impl Iterator<Item = &[u8]> {
        self.bitmaps.entries.iter().map(|b| b.as_slice())
    }

    /// Per-section entry counts.
    pub fn counts(&self) -> AtomTableCounts {
        AtomTableCounts {
            lexemes: self.lexemes.len(),
            integers: self.integers.len(),
            floats: self.floats.len(),
            bitmaps: self.bitmaps.len(),
        }
    }
}

/// Entry counts per atom section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomTableCounts {
    pub lexemes: usize,
    pub integers: usize,
    pub floats: usize,
    pub bitmaps: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_are_dense_and_stable() {
        let mut table = AtomTable::new();
        let a = table.intern_lexeme(LexemeKind::Symbol, "alpha");
        let b = table.intern_lexeme(LexemeKind::Symbol, "beta");
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(table.intern_lexeme(LexemeKind::Symbol, "alpha"), 0);
    }

    #[test]
    fn test_lexeme_kinds_do_not_collide() {
        let mut table = AtomTable::new();
        let sym = table.intern_lexeme(LexemeKind::Symbol, "x");
        let s = table.intern_lexeme(LexemeKind::Str, "x");
        let inst = table.intern_lexeme(LexemeKind::InstanceName, "x");
        assert_ne!(sym, s);
        assert_ne!(s, inst);
    }

    #[test]
    fn test_bucket_of_booleans_share_symbol_table() {
        let mut table = AtomTable::new();
        let t = table.bucket_of(&Value::Boolean(true));
        let sym = table.intern_lexeme(LexemeKind::Symbol, "TRUE");
        assert_eq!(t, sym);
    }

    #[test]
    fn test_multifield_contributes_zero() {
        let mut table = AtomTable::new();
        assert_eq!(table.bucket_of(&Value::Multifield(vec![Value::Integer(1)])), 0);
        assert_eq!(table.counts().integers, 0);
    }

    #[test]
    fn test_float_bits_distinguish_nan_payloads() {
        let mut table = AtomTable::new();
        let a = table.intern_float(f64::NAN);
        let b = table.intern_float(f64::from_bits(f64::NAN.to_bits() | 1));
        assert_ne!(a, b);
    }
}

//! String interner
//!
//! A hash-keyed set of string objects: identical text always yields the same
//! object reference, so symbol comparison anywhere else is pointer equality.
//! The GC asks the interner to drop entries for strings nothing else
//! reached.

use crate::heap::{Heap, Mark, ObjData, ObjRef};

const FNV64_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 64-bit FNV-1a
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV64_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV64_PRIME);
    }
    hash
}

/// 32-bit FNV-1a
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// The hash used for interned strings (build-selected width)
#[cfg(feature = "hash32")]
pub fn string_hash(text: &str) -> u64 {
    fnv1a_32(text.as_bytes()) as u64
}

/// The hash used for interned strings (build-selected width)
#[cfg(not(feature = "hash32"))]
pub fn string_hash(text: &str) -> u64 {
    fnv1a_64(text.as_bytes())
}

/// The interner table
#[derive(Debug, Default)]
pub struct Interner {
    entries: Vec<(u64, ObjRef)>,
}

impl Interner {
    /// Create an empty interner
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the interned object for some text, if it exists
    pub fn lookup(&self, heap: &Heap, text: &str) -> Option<ObjRef> {
        let hash = string_hash(text);
        self.entries
            .iter()
            .filter(|&&(h, _)| h == hash)
            .map(|&(_, r)| r)
            .find(|&r| heap.as_str(r) == Some(text))
    }

    /// Intern text, allocating a string object on first sight
    pub fn intern(&mut self, heap: &mut Heap, text: &str) -> ObjRef {
        if let Some(existing) = self.lookup(heap, text) {
            return existing;
        }
        let hash = string_hash(text);
        let r = heap.alloc(ObjData::Str {
            text: text.to_string(),
            hash,
        });
        self.entries.push((hash, r));
        r
    }

    /// Drop entries whose strings were not reached in the current mark
    /// phase. Runs before the sweeper frees them.
    pub fn sweep(&mut self, heap: &Heap) {
        self.entries
            .retain(|&(_, r)| heap.header(r).mark == Mark::Grey);
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the interner is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let a = interner.intern(&mut heap, "hello");
        let b = interner.intern(&mut heap, "hello");
        let c = interner.intern(&mut heap, "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_text_equality_implies_pointer_equality() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let owned = String::from("he") + "llo";
        let a = interner.intern(&mut heap, "hello");
        let b = interner.intern(&mut heap, &owned);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sweep_drops_unmarked() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let keep = interner.intern(&mut heap, "keep");
        let _drop = interner.intern(&mut heap, "drop");
        heap.header_mut(keep).mark = Mark::Grey;
        interner.sweep(&heap);
        assert_eq!(interner.len(), 1);
        assert_eq!(interner.lookup(&heap, "keep"), Some(keep));
        assert_eq!(interner.lookup(&heap, "drop"), None);
    }
}

//! Dense id bitmap for coroutine id allocation
//!
//! Allocation returns the smallest free id, with one refinement: the id
//! most recently freed is skipped while any other id is free. Rapidly
//! churning coroutines would otherwise keep receiving the same id and
//! alias each other in debug output.
//!
//! One u64 word covers 64 ids, so every operation is O(capacity/64) with
//! a low-water hint that keeps the common case close to O(1).

use crate::id::CoroId;

const BITS_PER_WORD: usize = 64;

/// Bitmap of allocated coroutine ids.
pub struct IdBitmap {
    /// One bit per id; set = allocated
    words: Vec<u64>,

    /// Logical ceiling on ids
    capacity: u32,

    /// Lowest word index that may contain a free bit
    hint: usize,

    /// Most recently freed id, skipped by the next allocation if possible
    last_freed: Option<u32>,

    /// Number of allocated ids
    live: usize,
}

impl IdBitmap {
    /// Create a bitmap admitting ids in `0..capacity`.
    pub fn new(capacity: u32) -> Self {
        let num_words = (capacity as usize + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let mut words = vec![0u64; num_words];

        // Mark the bits past the ceiling as permanently taken so scans
        // can never hand them out.
        let tail = capacity as usize % BITS_PER_WORD;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }

        Self {
            words,
            capacity,
            hint: 0,
            last_freed: None,
            live: 0,
        }
    }

    /// Allocate the smallest free id, preferring the next-smallest over
    /// the id just freed. Returns None when the id space is exhausted.
    pub fn allocate(&mut self) -> Option<CoroId> {
        let first = self.find_free(None)?;
        let id = match self.last_freed {
            Some(lf) if lf == first => self.find_free(Some(first)).unwrap_or(first),
            _ => first,
        };

        let w = id as usize / BITS_PER_WORD;
        self.words[w] |= 1u64 << (id as usize % BITS_PER_WORD);
        self.live += 1;

        // Advance the low-water hint past fully occupied words.
        while self.hint < self.words.len() && self.words[self.hint] == !0u64 {
            self.hint += 1;
        }

        Some(CoroId::new(id))
    }

    /// Return an id to the free pool.
    pub fn free(&mut self, id: CoroId) {
        if !self.contains(id) {
            return;
        }
        let idx = id.as_usize();
        let w = idx / BITS_PER_WORD;
        self.words[w] &= !(1u64 << (idx % BITS_PER_WORD));
        self.hint = self.hint.min(w);
        self.last_freed = Some(id.as_u32());
        self.live -= 1;
    }

    /// Check whether an id is currently allocated.
    #[inline]
    pub fn contains(&self, id: CoroId) -> bool {
        let idx = id.as_usize();
        if idx >= self.capacity as usize {
            return false;
        }
        (self.words[idx / BITS_PER_WORD] >> (idx % BITS_PER_WORD)) & 1 != 0
    }

    /// Number of allocated ids
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// True when no ids are allocated
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Logical id ceiling
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Find the smallest free id, optionally skipping one candidate.
    fn find_free(&self, skip: Option<u32>) -> Option<u32> {
        for w in self.hint..self.words.len() {
            let mut word = self.words[w];
            if let Some(s) = skip {
                if s as usize / BITS_PER_WORD == w {
                    word |= 1u64 << (s as usize % BITS_PER_WORD);
                }
            }
            if word != !0u64 {
                let bit = (!word).trailing_zeros() as usize;
                return Some((w * BITS_PER_WORD + bit) as u32);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_smallest_free() {
        let mut map = IdBitmap::new(256);
        assert_eq!(map.allocate(), Some(CoroId::new(0)));
        assert_eq!(map.allocate(), Some(CoroId::new(1)));
        assert_eq!(map.allocate(), Some(CoroId::new(2)));
        assert_eq!(map.len(), 3);
        assert!(map.contains(CoroId::new(1)));
        assert!(!map.contains(CoroId::new(3)));
    }

    #[test]
    fn test_skips_last_freed() {
        let mut map = IdBitmap::new(256);
        for _ in 0..4 {
            map.allocate().unwrap();
        }
        map.free(CoroId::new(1));
        // 1 is the smallest free id but was just freed; 4 is next.
        assert_eq!(map.allocate(), Some(CoroId::new(4)));
        // Still avoided while something else is free.
        assert_eq!(map.allocate(), Some(CoroId::new(5)));
    }

    #[test]
    fn test_last_freed_used_when_only_option() {
        let mut map = IdBitmap::new(3);
        map.allocate().unwrap();
        map.allocate().unwrap();
        map.allocate().unwrap();
        map.free(CoroId::new(2));
        // 2 was just freed but nothing else is left.
        assert_eq!(map.allocate(), Some(CoroId::new(2)));
    }

    #[test]
    fn test_exhaustion() {
        let mut map = IdBitmap::new(2);
        assert!(map.allocate().is_some());
        assert!(map.allocate().is_some());
        assert_eq!(map.allocate(), None);
        map.free(CoroId::new(0));
        assert_eq!(map.allocate(), Some(CoroId::new(0)));
    }

    #[test]
    fn test_free_then_lower_reuse() {
        let mut map = IdBitmap::new(256);
        for _ in 0..10 {
            map.allocate().unwrap();
        }
        map.free(CoroId::new(3));
        map.free(CoroId::new(7));
        // 3 is smallest free; 7 was freed last so 3 is handed out.
        assert_eq!(map.allocate(), Some(CoroId::new(3)));
        assert_eq!(map.allocate(), Some(CoroId::new(10)));
        assert_eq!(map.allocate(), Some(CoroId::new(7)));
    }

    #[test]
    fn test_crosses_word_boundary() {
        let mut map = IdBitmap::new(200);
        for i in 0..130u32 {
            assert_eq!(map.allocate(), Some(CoroId::new(i)));
        }
        map.free(CoroId::new(64));
        map.free(CoroId::new(129));
        assert_eq!(map.allocate(), Some(CoroId::new(64)));
        assert!(map.contains(CoroId::new(64)));
    }

    #[test]
    fn test_free_untracked_is_noop() {
        let mut map = IdBitmap::new(64);
        map.free(CoroId::new(10));
        assert!(map.is_empty());
        assert_eq!(map.allocate(), Some(CoroId::new(0)));
    }
}

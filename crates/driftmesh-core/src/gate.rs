//! Credit-based dedup gate.
//!
//! A key marked with `n` credits stays marked for `n` ticks. The node uses
//! one gate for packet ids (so a gossiped packet is processed once) and one
//! for introduction pairs (so a connector does not introduce the same two
//! peers every time either of them re-joins).

use std::collections::HashMap;
use std::hash::Hash;

/// Dedup gate keyed by `K`
#[derive(Debug, Clone)]
pub struct Gate<K> {
    credits: HashMap<K, u32>,
}

impl<K: Eq + Hash> Default for Gate<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Gate<K> {
    /// Empty gate
    #[must_use]
    pub fn new() -> Self {
        Self {
            credits: HashMap::new(),
        }
    }

    /// Mark `key` for `credits` ticks. Zero credits clears the mark.
    pub fn mark(&mut self, key: K, credits: u32) {
        if credits == 0 {
            self.credits.remove(&key);
        } else {
            self.credits.insert(key, credits);
        }
    }

    /// Returns true while `key` has credit left
    #[must_use]
    pub fn has_mark(&self, key: &K) -> bool {
        self.credits.contains_key(key)
    }

    /// Credit remaining on `key`
    #[must_use]
    pub fn remaining(&self, key: &K) -> Option<u32> {
        self.credits.get(key).copied()
    }

    /// Spend one credit on every key, dropping keys that run out
    pub fn tick(&mut self) {
        self.credits.retain(|_, credit| {
            *credit -= 1;
            *credit > 0
        });
    }

    /// Number of marked keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.credits.len()
    }

    /// Returns true if nothing is marked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credits.is_empty()
    }
}

//! Verdict memoization.
//!
//! The oracle is a pure function of the candidate under a fixed predicate
//! and input, so verdicts are cached for the lifetime of a run and never
//! invalidated. Keys are md5 digests of the normalized chunk bounds: two
//! candidates naming the same bytes share an entry regardless of how their
//! ranges are partitioned.

use std::collections::HashMap;

use crate::chunkset::ChunkSet;
use crate::oracle::Verdict;

/// Digest identity of a normalized chunk set.
pub fn cache_key(chunks: &ChunkSet) -> [u8; 16] {
    let normalized = chunks.normalize();
    let mut bounds = Vec::with_capacity(normalized.len() * 16);
    for chunk in normalized.chunks() {
        bounds.extend_from_slice(&chunk.start.to_le_bytes());
        bounds.extend_from_slice(&chunk.end.to_le_bytes());
    }
    md5::compute(&bounds).0
}

/// Maps candidate identity to the oracle's verdict for one run.
#[derive(Debug, Default)]
pub struct QueryCache {
    verdicts: HashMap<[u8; 16], Verdict>,
    hits: u64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, chunks: &ChunkSet) -> Option<Verdict> {
        let verdict = self.verdicts.get(&cache_key(chunks)).copied();
        if verdict.is_some() {
            self.hits += 1;
        }
        verdict
    }

    pub fn insert(&mut self, chunks: &ChunkSet, verdict: Verdict) {
        self.verdicts.insert(cache_key(chunks), verdict);
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Number of distinct candidates stored.
    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}

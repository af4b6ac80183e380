//! Candidate representation: ordered, disjoint byte ranges over the original
//! input.
//!
//! The minimizer never copies the original bytes while searching; a candidate
//! is a `ChunkSet` naming which ranges of the input survive. All operations
//! are pure and return new sets.

/// A half-open byte range `[start, end)` into the original input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end, "chunk must be non-empty: [{start}, {end})");
        Self { start, end }
    }

    /// Number of bytes the chunk covers.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// An ordered sequence of disjoint, sorted, non-empty chunks.
///
/// The materialization of a `ChunkSet` is the concatenation of the byte
/// slices it names, in order. Two sets are equivalent iff they normalize to
/// the same sequence; [`ChunkSet::normalize`] is the canonical (cache-key)
/// form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSet {
    chunks: Vec<Chunk>,
}

impl ChunkSet {
    /// The whole input `[0, len)` as a single chunk. Empty input yields the
    /// empty set.
    pub fn whole(len: u64) -> Self {
        if len == 0 {
            Self { chunks: Vec::new() }
        } else {
            Self {
                chunks: vec![Chunk::new(0, len)],
            }
        }
    }

    /// Builds a set from chunks that must already be disjoint and sorted.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        debug_assert!(
            chunks.windows(2).all(|w| w[0].end <= w[1].start),
            "chunks must be disjoint and sorted"
        );
        debug_assert!(chunks.iter().all(|c| c.start < c.end));
        Self { chunks }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of chunks (not bytes).
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total number of bytes covered.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Canonical form: adjacent chunks (`a.end == b.start`) merged.
    pub fn normalize(&self) -> ChunkSet {
        let mut merged: Vec<Chunk> = Vec::with_capacity(self.chunks.len());
        for &chunk in &self.chunks {
            match merged.last_mut() {
                Some(prev) if prev.end == chunk.start => prev.end = chunk.end,
                _ => merged.push(chunk),
            }
        }
        ChunkSet { chunks: merged }
    }

    /// The set with chunk `i` removed.
    pub fn remove_index(&self, i: usize) -> ChunkSet {
        let mut chunks = self.chunks.clone();
        chunks.remove(i);
        ChunkSet { chunks }
    }

    /// The set containing only chunk `i`.
    pub fn singleton(&self, i: usize) -> ChunkSet {
        ChunkSet {
            chunks: vec![self.chunks[i]],
        }
    }

    /// The granularity-increase step: every chunk of size `s` splits into
    /// halves of `s / 2` and `s - s / 2` bytes. A leading half of size zero
    /// (chunks of one byte) is dropped, so the result never contains an
    /// empty chunk.
    pub fn split_all_halves(&self) -> ChunkSet {
        let mut chunks = Vec::with_capacity(self.chunks.len() * 2);
        for &chunk in &self.chunks {
            let mid = chunk.start + chunk.len() / 2;
            if mid > chunk.start {
                chunks.push(Chunk::new(chunk.start, mid));
            }
            chunks.push(Chunk::new(mid, chunk.end));
        }
        ChunkSet { chunks }
    }

    /// In-memory materialization against a byte slice of the original input.
    pub fn extract(&self, source: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size() as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(&source[chunk.start as usize..chunk.end as usize]);
        }
        out
    }
}

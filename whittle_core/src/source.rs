//! The original failing input: a fixed, seekable, read-only byte source.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

use crate::chunkset::{Chunk, ChunkSet};

/// Bounded buffer used for all range copies out of the source.
pub(crate) const COPY_BUF_LEN: usize = 4096;

/// Errors opening or reading the original input.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The input path could not be opened.
    #[error("failed to open input {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The input does not support seeking (e.g. a pipe). The minimizer
    /// re-reads ranges of the original for every candidate, so the source
    /// must be a regular file or equivalent.
    #[error("input is not seekable; pass --input or redirect a regular file")]
    NotSeekable(#[source] io::Error),
    /// Any other read failure.
    #[error("I/O error reading input: {0}")]
    Io(#[from] io::Error),
}

/// A seekable handle on the original input plus its length `N`.
///
/// Read-only for the lifetime of a run; every candidate names byte ranges
/// into this source.
#[derive(Debug)]
pub struct Source {
    file: File,
    len: u64,
}

impl Source {
    /// Opens a regular file as the source.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_file(file)
    }

    /// Uses the process stdin as the source. Stdin must have been redirected
    /// from something seekable.
    pub fn from_stdin() -> Result<Self, SourceError> {
        let file = File::open("/dev/stdin").map_err(|source| SourceError::Open {
            path: "<stdin>".to_owned(),
            source,
        })?;
        Self::from_file(file)
    }

    /// Wraps an already-open file, verifying seekability and measuring `N`.
    pub fn from_file(mut file: File) -> Result<Self, SourceError> {
        let len = file.seek(SeekFrom::End(0)).map_err(SourceError::NotSeekable)?;
        file.seek(SeekFrom::Start(0)).map_err(SourceError::NotSeekable)?;
        Ok(Self { file, len })
    }

    /// Length of the original input in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies one chunk's bytes into `out` through a bounded buffer.
    pub fn copy_range(&mut self, chunk: Chunk, out: &mut dyn Write) -> io::Result<()> {
        debug_assert!(chunk.end <= self.len);
        self.file.seek(SeekFrom::Start(chunk.start))?;
        let mut buf = [0u8; COPY_BUF_LEN];
        let mut remaining = chunk.len();
        while remaining > 0 {
            let want = remaining.min(COPY_BUF_LEN as u64) as usize;
            let got = self.file.read(&mut buf[..want])?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "input shrank while minimizing",
                ));
            }
            out.write_all(&buf[..got])?;
            remaining -= got as u64;
        }
        Ok(())
    }

    /// Materializes a whole chunk set into memory.
    pub fn extract(&mut self, chunks: &ChunkSet) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(chunks.size() as usize);
        for &chunk in chunks.chunks() {
            self.copy_range(chunk, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn file_with(bytes: &[u8]) -> File {
        let mut tmp = tempfile::tempfile().expect("failed to create temp file");
        tmp.write_all(bytes).expect("failed to seed temp file");
        tmp
    }

    #[test]
    fn from_file_measures_length_and_rewinds() {
        let source = Source::from_file(file_with(b"hello world")).expect("seekable");
        assert_eq!(source.len(), 11);
        assert!(!source.is_empty());
    }

    #[test]
    fn copy_range_reads_the_named_bytes() {
        let mut source = Source::from_file(file_with(b"abcdefgh")).expect("seekable");
        let mut out = Vec::new();
        source
            .copy_range(Chunk::new(2, 6), &mut out)
            .expect("copy_range failed");
        assert_eq!(out, b"cdef");
    }

    #[test]
    fn copy_range_handles_ranges_larger_than_the_buffer() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut source = Source::from_file(file_with(&data)).expect("seekable");
        let mut out = Vec::new();
        source
            .copy_range(Chunk::new(100, 18_000), &mut out)
            .expect("copy_range failed");
        assert_eq!(out, &data[100..18_000]);
    }

    #[test]
    fn extract_round_trips_chunk_concatenation() {
        let data = b"0123456789";
        let mut source = Source::from_file(file_with(data)).expect("seekable");
        let cs = ChunkSet::from_chunks(vec![Chunk::new(0, 3), Chunk::new(7, 10)]);
        let bytes = source.extract(&cs).expect("extract failed");
        assert_eq!(bytes, cs.extract(data));
        assert_eq!(bytes, b"012789");
    }
}

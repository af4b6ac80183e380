//! Writing candidates to disk for the subject command to consume.

use std::io;

use tempfile::{Builder, TempDir, TempPath};

use crate::chunkset::ChunkSet;
use crate::source::Source;

/// Writes chunk sets to fresh temp files and owns the original input.
///
/// All candidate files live in one process-local temporary directory and
/// carry a `ddmin-` prefix. [`Materializer::write`] returns a
/// [`TempPath`]: the file is unlinked when the path is dropped, so cleanup
/// happens on every exit path, including early returns and panics in the
/// supervisor. The directory itself is removed when the materializer drops.
#[derive(Debug)]
pub struct Materializer {
    dir: TempDir,
    source: Source,
}

impl Materializer {
    pub fn new(source: Source) -> io::Result<Self> {
        let dir = Builder::new().prefix("whittle-").tempdir()?;
        Ok(Self { dir, source })
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut Source {
        &mut self.source
    }

    /// Writes the materialization of `chunks` to a fresh temp file and
    /// returns its self-deleting path.
    ///
    /// Copies go through the source's bounded buffer; I/O errors propagate
    /// and the partial file is unlinked by the dropped handle.
    pub fn write(&mut self, chunks: &ChunkSet) -> io::Result<TempPath> {
        let mut file = Builder::new()
            .prefix("ddmin-")
            .tempfile_in(self.dir.path())?;
        for &chunk in chunks.chunks() {
            self.source.copy_range(chunk, file.as_file_mut())?;
        }
        Ok(file.into_temp_path())
    }

    /// Materializes `chunks` into memory (used for `@@` contents expansion
    /// and for writing the final result).
    pub fn extract(&mut self, chunks: &ChunkSet) -> io::Result<Vec<u8>> {
        self.source.extract(chunks)
    }
}

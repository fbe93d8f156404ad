//! Chunk paging across feature streams.
//!
//! Residency is tracked by each chunk's frame matrix (empty means paged out).
//! All streams of a randomized chunk are paged in and out together; partial
//! residency would misalign reads across streams and is treated as a bug.

use crate::source::MinibatchSource;
use crate::util::attempt;
use crate::Result;

/// Read attempts per stream before a chunk load is abandoned; reads may come
/// over an unreliable network.
const READ_ATTEMPTS: usize = 5;

impl MinibatchSource {
    /// Page out randomized chunk `k` on every stream. No-op when not
    /// resident.
    pub(crate) fn release_randomized_chunk(&mut self, k: usize) {
        let source = self.rand.chunk(k).source;
        let num_streams = self.chunks.len();
        let mut released = 0;
        for m in 0..num_streams {
            if self.chunks[m][source].is_in_ram() {
                self.chunks[m][source].release_data();
                released += 1;
            }
        }
        if released > 0 && released < num_streams {
            panic!("release_randomized_chunk: some streams had chunk {k} in RAM, some not");
        }
        if released == num_streams {
            self.chunks_in_ram -= 1;
            if self.verbosity > 1 {
                log::trace!(
                    "release_randomized_chunk: paged out chunk {k}, {} resident in RAM",
                    self.chunks_in_ram
                );
            }
        }
    }

    /// Page in randomized chunk `k` on every stream. The window range is
    /// passed in for checking only. Returns true if anything was read.
    pub(crate) fn require_randomized_chunk(
        &mut self,
        k: usize,
        window_begin: usize,
        window_end: usize,
    ) -> Result<bool> {
        if k < window_begin || k >= window_end {
            panic!(
                "require_randomized_chunk: chunk {k} outside the in-memory window [{window_begin}, {window_end})"
            );
        }
        let source = self.rand.chunk(k).source;
        let num_streams = self.chunks.len();
        let resident =
            (0..num_streams).filter(|&m| self.chunks[m][source].is_in_ram()).count();
        if resident == num_streams {
            return Ok(false);
        }
        if resident != 0 {
            panic!(
                "require_randomized_chunk: {resident} of {num_streams} streams have chunk {k} in RAM"
            );
        }
        if self.verbosity > 0 {
            let rc = self.rand.chunk(k);
            log::debug!(
                "require_randomized_chunk: paging in chunk {k} (frame range [{}..{})), {} resident in RAM",
                rc.global_ts,
                rc.global_te(),
                self.chunks_in_ram + 1
            );
        }
        for m in 0..num_streams {
            // Lattices ride along with stream 0; the other streams cover the
            // same utterances.
            let lattices = if m == 0 { self.lattices.as_deref() } else { None };
            let verbosity = self.verbosity;
            let res = attempt(READ_ATTEMPTS, || {
                self.chunks[m][source].require_data(
                    &mut self.streams[m].info,
                    &*self.reader,
                    lattices,
                    verbosity,
                )
            });
            if let Err(e) = res {
                log::error!(
                    "require_randomized_chunk: giving up on chunk {k} stream {m} after {READ_ATTEMPTS} attempts"
                );
                for n in 0..m {
                    self.chunks[n][source].release_data();
                }
                return Err(e);
            }
        }
        self.chunks_in_ram += 1;
        Ok(true)
    }
}

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::corpus::ChunkData;
use crate::util::seeded_shuffle;

/// A chunk as placed in the randomized processing order of one sweep.
///
/// `source` indexes the catalog's chunk sequence (every stream shares the
/// permutation, so one annotated sequence serves them all); utterance counts
/// and frame counts are cached here so queries never touch the chunk store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RandomizedChunk {
    pub source: usize,
    pub num_utterances: usize,
    pub num_frames: usize,
    /// First utterance position covered by this chunk.
    pub utterance_pos_begin: usize,
    /// Start frame on the global timeline.
    pub global_ts: usize,
    /// Chunks this chunk's sequences may be randomized with: indices into the
    /// randomized chunk sequence, `[window_begin, window_end)`.
    pub window_begin: usize,
    pub window_end: usize,
}

impl RandomizedChunk {
    pub fn utterance_pos_end(&self) -> usize {
        self.utterance_pos_begin + self.num_utterances
    }
    pub fn global_te(&self) -> usize {
        self.global_ts + self.num_frames
    }
}

/// A sequence to be randomized: a full utterance, or a single frame of one in
/// frame mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SequenceRef {
    /// Index into the randomized chunk sequence.
    pub chunk_index: usize,
    /// Utterance index within that chunk.
    pub utterance_index: usize,
    /// 0 for utterances; the frame offset in frame mode.
    pub frame_index: usize,
    /// Start frame on the global timeline, set once positions are final.
    pub global_ts: usize,
    pub num_frames: usize,
}

impl SequenceRef {
    pub fn global_te(&self) -> usize {
        self.global_ts + self.num_frames
    }
}

/// Two-level randomization state for one sweep.
///
/// Chunks are brought into a random order first; sequences (utterances or
/// frames) are then shuffled under the constraint that each position only
/// references chunks within a rolling window around it, so that paging can
/// proceed chunk-sequentially with a bounded resident set. Everything is
/// rebuilt deterministically from the sweep index.
pub(crate) struct Randomizer {
    verbosity: i32,
    frame_mode: bool,
    total_frames: usize,
    num_utterances: usize,
    /// Full randomization window in frames; half of it reaches either way.
    randomization_range: usize,

    current_sweep: Option<usize>,
    chunks: Vec<RandomizedChunk>,
    sequences: Vec<SequenceRef>,
    /// Position -> index of the randomized chunk that defined it.
    position_windows: Vec<usize>,
    /// global_ts -> position, for boundary lookups.
    pos_map: HashMap<usize, usize>,
}

impl Randomizer {
    pub fn new(
        verbosity: i32,
        frame_mode: bool,
        total_frames: usize,
        num_utterances: usize,
        randomization_range: usize,
    ) -> Self {
        Randomizer {
            verbosity,
            frame_mode,
            total_frames,
            num_utterances,
            randomization_range,
            current_sweep: None,
            chunks: Vec::new(),
            sequences: Vec::new(),
            position_windows: Vec::new(),
            pos_map: HashMap::new(),
        }
    }

    pub fn set_verbosity(&mut self, verbosity: i32) {
        self.verbosity = verbosity;
    }

    /// Rebuild all randomization state for the sweep containing `global_ts`,
    /// unless it is already current. Returns the sweep index.
    pub fn ensure_sweep(&mut self, global_ts: usize, catalog: &[ChunkData]) -> usize {
        let sweep = global_ts / self.total_frames;
        if self.current_sweep == Some(sweep) {
            return sweep;
        }
        self.current_sweep = Some(sweep);
        if self.verbosity > 0 {
            log::debug!(
                "ensure_sweep: re-randomizing for sweep {sweep} in {} mode",
                if self.frame_mode { "frame" } else { "utterance" }
            );
        }
        let sweep_ts = sweep * self.total_frames;

        // Bring chunks into random order and place them on the global
        // timeline. The seed depends only on the sweep, so every stream (and
        // every rerun) sees the same permutation.
        let mut order: Vec<usize> = (0..catalog.len()).collect();
        seeded_shuffle(&mut order, sweep as u64);

        self.chunks.clear();
        self.chunks.reserve(order.len());
        for &source in &order {
            let cd = &catalog[source];
            let (pos, ts) = self
                .chunks
                .last()
                .map_or((0, sweep_ts), |c| (c.utterance_pos_end(), c.global_te()));
            self.chunks.push(RandomizedChunk {
                source,
                num_utterances: cd.num_utterances(),
                num_frames: cd.total_frames(),
                utterance_pos_begin: pos,
                global_ts: ts,
                window_begin: 0,
                window_end: 0,
            });
        }
        debug_assert!(self.chunks.last().map_or(true, |c| {
            c.utterance_pos_end() == self.num_utterances
                && c.global_te() == sweep_ts + self.total_frames
        }));

        // Rolling randomization window per chunk: the maximal contiguous
        // chunk range within half the randomization range on either side.
        let half = self.randomization_range / 2;
        let mut wb = 0usize;
        let mut we = 1usize;
        for k in 0..self.chunks.len() {
            while self.chunks[k].global_ts - self.chunks[wb].global_ts > half {
                wb += 1;
            }
            while we < self.chunks.len()
                && self.chunks[we].global_te() - self.chunks[k].global_ts < half
            {
                we += 1;
            }
            self.chunks[k].window_begin = wb;
            self.chunks[k].window_end = we;
        }

        // Each sequence position is defined by the chunk it came from; the
        // initial assignment is the catalog order within the randomized chunk
        // sequence.
        let num_sequences = if self.frame_mode {
            self.total_frames
        } else {
            self.num_utterances
        };
        self.position_windows.clear();
        self.position_windows.reserve(num_sequences);
        self.sequences.clear();
        self.sequences.reserve(num_sequences);
        for k in 0..self.chunks.len() {
            let cd = &catalog[self.chunks[k].source];
            for i in 0..cd.num_utterances() {
                let m_count = if self.frame_mode { cd.num_frames_of(i) } else { 1 };
                for m in 0..m_count {
                    self.position_windows.push(k);
                    self.sequences.push(SequenceRef {
                        chunk_index: k,
                        utterance_index: i,
                        frame_index: m,
                        global_ts: usize::MAX,
                        num_frames: 0,
                    });
                }
            }
        }
        assert_eq!(self.sequences.len(), num_sequences);
        assert_eq!(self.position_windows.len(), num_sequences);
        for i in 0..num_sequences {
            debug_assert!(self.window_contains(i, &self.sequences[i]));
        }

        // Shuffle sequences by random swaps, but only when both end up inside
        // the other position's chunk window.
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(sweep as u64 + 1);
        for i in 0..num_sequences {
            let k = self.position_windows[i];
            let (cb, ce) = (self.chunks[k].window_begin, self.chunks[k].window_end);
            let (pos_begin, pos_end) = if self.frame_mode {
                (
                    self.chunks[cb].global_ts - sweep_ts,
                    self.chunks[ce - 1].global_te() - sweep_ts,
                )
            } else {
                (
                    self.chunks[cb].utterance_pos_begin,
                    self.chunks[ce - 1].utterance_pos_end(),
                )
            };
            loop {
                let j = rng.gen_range(pos_begin..pos_end);
                if j == i {
                    break;
                }
                if !self.window_contains(i, &self.sequences[j]) {
                    continue;
                }
                if !self.window_contains(j, &self.sequences[i]) {
                    continue;
                }
                self.sequences.swap(i, j);
                break;
            }
        }

        // Lay the shuffled sequences back onto the global timeline.
        let mut t = sweep_ts;
        for pos in 0..num_sequences {
            let num_frames = if self.frame_mode {
                1
            } else {
                let s = &self.sequences[pos];
                catalog[self.chunks[s.chunk_index].source].num_frames_of(s.utterance_index)
            };
            let s = &mut self.sequences[pos];
            s.global_ts = t;
            s.num_frames = num_frames;
            t += num_frames;
        }
        assert_eq!(t, sweep_ts + self.total_frames);

        for i in 0..num_sequences {
            if !self.window_contains(i, &self.sequences[i]) {
                panic!("ensure_sweep: randomized sequence escaped its chunk window");
            }
        }
        // Walk positions in chunk order once more; every position defined by
        // chunk k must still draw from k's window.
        let mut pos = 0usize;
        for k in 0..self.chunks.len() {
            let cd = &catalog[self.chunks[k].source];
            for i in 0..cd.num_utterances() {
                let m_count = if self.frame_mode { cd.num_frames_of(i) } else { 1 };
                for _ in 0..m_count {
                    let ci = self.sequences[pos].chunk_index;
                    if ci < self.chunks[k].window_begin || ci >= self.chunks[k].window_end {
                        panic!("ensure_sweep: sequence randomization mangled the chunk windows");
                    }
                    pos += 1;
                }
            }
        }
        assert_eq!(pos, num_sequences);

        self.pos_map = self
            .sequences
            .iter()
            .enumerate()
            .map(|(p, s)| (s.global_ts, p))
            .collect();

        sweep
    }

    fn window_contains(&self, pos: usize, seq: &SequenceRef) -> bool {
        let w = &self.chunks[self.position_windows[pos]];
        seq.chunk_index >= w.window_begin && seq.chunk_index < w.window_end
    }

    /// Chunk covering global frame position `t` (binary search by end frame).
    pub fn chunk_for_frame_pos(&self, t: usize) -> usize {
        let k = self.chunks.partition_point(|c| c.global_te() <= t);
        if k == self.chunks.len() || t < self.chunks[k].global_ts {
            panic!("chunk_for_frame_pos: frame {t} is outside the randomized timeline");
        }
        k
    }

    pub fn chunk(&self, k: usize) -> &RandomizedChunk {
        &self.chunks[k]
    }
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
    pub fn sequence(&self, pos: usize) -> &SequenceRef {
        &self.sequences[pos]
    }
    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }
    /// Window of the chunk that defined position `pos`.
    pub fn window_of_position(&self, pos: usize) -> (usize, usize) {
        let w = &self.chunks[self.position_windows[pos]];
        (w.window_begin, w.window_end)
    }
    pub fn position_of_ts(&self, global_ts: usize) -> Option<usize> {
        self.pos_map.get(&global_ts).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{build_catalog, Catalog};
    use crate::testutil::archive_list;

    fn catalog(lens: &[usize], chunk_frames: usize) -> Catalog {
        build_catalog(&[archive_list(lens)], &[], &[], None, chunk_frames).unwrap()
    }

    fn randomizer(cat: &Catalog, frame_mode: bool, range: usize) -> Randomizer {
        Randomizer::new(0, frame_mode, cat.total_frames, cat.num_utterances, range)
    }

    // eight 25-frame utterances in four 50-frame chunks
    fn four_chunk_catalog() -> Catalog {
        catalog(&[25; 8], 49)
    }

    #[test]
    fn sweep_determinism() {
        let cat = four_chunk_catalog();
        for frame_mode in [false, true] {
            let mut a = randomizer(&cat, frame_mode, 120);
            let mut b = randomizer(&cat, frame_mode, 120);
            for sweep in [0usize, 3] {
                a.ensure_sweep(sweep * cat.total_frames + 1, &cat.chunks[0]);
                b.ensure_sweep(sweep * cat.total_frames + 1, &cat.chunks[0]);
                assert_eq!(a.chunks, b.chunks);
                assert_eq!(a.sequences, b.sequences);
            }
        }
    }

    #[test]
    fn resweep_is_a_noop_within_the_sweep() {
        let cat = four_chunk_catalog();
        let mut r = randomizer(&cat, true, 120);
        r.ensure_sweep(0, &cat.chunks[0]);
        let snapshot = r.sequences.clone();
        r.ensure_sweep(cat.total_frames - 1, &cat.chunks[0]);
        assert_eq!(r.sequences, snapshot);
        r.ensure_sweep(cat.total_frames, &cat.chunks[0]);
        assert_eq!(r.sequences[0].global_ts, cat.total_frames);
    }

    #[test]
    fn different_sweeps_differ() {
        let cat = four_chunk_catalog();
        let mut r = randomizer(&cat, true, 400);
        r.ensure_sweep(0, &cat.chunks[0]);
        let s0: Vec<(usize, usize, usize)> = r
            .sequences
            .iter()
            .map(|s| (s.chunk_index, s.utterance_index, s.frame_index))
            .collect();
        r.ensure_sweep(cat.total_frames, &cat.chunks[0]);
        let s1: Vec<(usize, usize, usize)> = r
            .sequences
            .iter()
            .map(|s| (s.chunk_index, s.utterance_index, s.frame_index))
            .collect();
        assert_ne!(s0, s1);
    }

    #[test]
    fn window_containment_and_timeline() {
        let cat = four_chunk_catalog();
        for frame_mode in [false, true] {
            for range in [120, 400] {
                let mut r = randomizer(&cat, frame_mode, range);
                let sweep = r.ensure_sweep(0, &cat.chunks[0]);
                assert_eq!(sweep, 0);
                let mut t = 0usize;
                for p in 0..r.num_sequences() {
                    let s = r.sequence(p);
                    let (wb, we) = r.window_of_position(p);
                    assert!(s.chunk_index >= wb && s.chunk_index < we);
                    assert_eq!(s.global_ts, t);
                    t += s.num_frames;
                }
                assert_eq!(t, cat.total_frames);
            }
        }
    }

    #[test]
    fn sequences_are_a_permutation() {
        let cat = four_chunk_catalog();
        for frame_mode in [false, true] {
            let mut r = randomizer(&cat, frame_mode, 400);
            r.ensure_sweep(0, &cat.chunks[0]);
            let mut got: Vec<(usize, usize, usize)> = r
                .sequences
                .iter()
                .map(|s| (s.chunk_index, s.utterance_index, s.frame_index))
                .collect();
            got.sort_unstable();
            let mut expected = Vec::new();
            for k in 0..r.num_chunks() {
                let cd = &cat.chunks[0][r.chunk(k).source];
                for i in 0..cd.num_utterances() {
                    let m_count = if frame_mode { cd.num_frames_of(i) } else { 1 };
                    for m in 0..m_count {
                        expected.push((k, i, m));
                    }
                }
            }
            expected.sort_unstable();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn chunk_lookup_by_frame_position() {
        let cat = four_chunk_catalog();
        let mut r = randomizer(&cat, true, 400);
        r.ensure_sweep(0, &cat.chunks[0]);
        for t in 0..cat.total_frames {
            let k = r.chunk_for_frame_pos(t);
            assert!(r.chunk(k).global_ts <= t && t < r.chunk(k).global_te());
        }
    }

    #[test]
    #[should_panic(expected = "outside the randomized timeline")]
    fn chunk_lookup_past_the_sweep_panics() {
        let cat = four_chunk_catalog();
        let mut r = randomizer(&cat, true, 400);
        r.ensure_sweep(0, &cat.chunks[0]);
        r.chunk_for_frame_pos(cat.total_frames);
    }

    #[test]
    fn position_map_inverts_global_ts() {
        let cat = four_chunk_catalog();
        let mut r = randomizer(&cat, false, 400);
        r.ensure_sweep(0, &cat.chunks[0]);
        for p in 0..r.num_sequences() {
            assert_eq!(r.position_of_ts(r.sequence(p).global_ts), Some(p));
        }
        assert_eq!(r.position_of_ts(cat.total_frames + 1), None);
    }

    #[test]
    fn narrow_window_limits_displacement() {
        // 120-frame range over 50-frame chunks: a position's chunk can stray
        // at most one chunk from its defining chunk.
        let cat = four_chunk_catalog();
        let mut r = randomizer(&cat, true, 120);
        r.ensure_sweep(0, &cat.chunks[0]);
        for p in 0..r.num_sequences() {
            let defining = r.position_windows[p];
            let actual = r.sequence(p).chunk_index;
            assert!(actual.abs_diff(defining) <= 1);
        }
    }
}

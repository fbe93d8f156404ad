use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use itertools::izip;
use ndarray::prelude::*;

use crate::config::{SourceConfigJson, StreamSpec};
use crate::corpus::{build_catalog, ChunkData, CHUNK_FRAMES};
use crate::io::{
    augmentation_extent, ContextAugmenter, FeatureInfo, FeatureReader, FrameSplicer, LatticePair,
    LatticeSource, WordSequence,
};
use crate::labels::{LabelSegment, LabelStore};
use crate::randomizer::Randomizer;
use crate::{Result, SourceError};

/// Default randomization window: 48 hours of frames at 100 frames/s.
pub const DEFAULT_RANDOMIZATION_RANGE: usize = 48 * 3600 * 100;

/// Per-stream static configuration plus the feature info discovered on the
/// first read.
pub(crate) struct StreamInfo {
    pub vdim: usize,
    pub left_context: usize,
    pub right_context: usize,
    pub info: FeatureInfo,
}

/// One assembled minibatch.
///
/// `frames_advanced` is the logical batch width, by which the caller moves
/// its global time index; with data-parallel subsetting the returned frame
/// count is smaller but `frames_advanced` stays identical across subsets.
pub struct Minibatch {
    pub frames_advanced: usize,
    /// True when assembling this batch paged anything in from disk.
    pub read_from_disk: bool,
    /// Per feature stream, an output-dimension x frames matrix.
    pub feat: Vec<Array2<f32>>,
    /// Per label stream, one class id per returned frame. Empty when
    /// unsupervised.
    pub uids: Vec<Vec<i32>>,
    /// Per label stream, phone-boundary markers (utterance mode only).
    pub phone_boundaries: Vec<Vec<i32>>,
    /// Per feature stream, cumulative utterance end offsets (utterance mode
    /// only).
    pub sent_end_marks: Vec<Vec<usize>>,
    /// Per returned utterance, its lattice record (utterance mode only).
    pub lattices: Vec<Arc<LatticePair>>,
    /// Word transcripts matching `lattices` where available.
    pub transcripts: Vec<WordSequence>,
}

impl Minibatch {
    /// Number of frames actually returned (after subset filtering).
    pub fn num_frames(&self) -> usize {
        self.feat.first().map_or(0, |m| m.ncols())
    }
}

impl fmt::Debug for Minibatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Minibatch with {} frames ({} advanced), {} feature streams, {} label streams, read_from_disk: {}",
            self.num_frames(),
            self.frames_advanced,
            self.feat.len(),
            self.uids.len(),
            self.read_from_disk
        ))
    }
}

/// Capability surface of a randomizing batch source, for callers that only
/// need to pull batches and steer the global time index.
pub trait BatchSource {
    fn get_batch_subset(
        &mut self,
        global_ts: usize,
        frames_requested: usize,
        subset_num: usize,
        num_subsets: usize,
    ) -> Result<Minibatch>;
    fn get_batch(&mut self, global_ts: usize, frames_requested: usize) -> Result<Minibatch> {
        self.get_batch_subset(global_ts, frames_requested, 0, 1)
    }
    fn total_frames(&self) -> usize;
    fn first_valid_global_ts(&mut self, global_ts: usize) -> usize;
    fn supports_batch_subsetting(&self) -> bool {
        false
    }
    fn unit_counts(&self, label_stream: usize) -> &[usize];
}

pub struct MinibatchSourceBuilder {
    reader: Box<dyn FeatureReader>,
    streams: Vec<StreamSpec>,
    labels: Vec<HashMap<String, Vec<LabelSegment>>>,
    udim: Vec<usize>,
    randomization_range: usize,
    chunk_frames: usize,
    frame_mode: bool,
    verbosity: i32,
    augmenter: Box<dyn ContextAugmenter>,
    lattice_source: Option<Box<dyn LatticeSource>>,
    transcripts: HashMap<String, WordSequence>,
}

impl MinibatchSourceBuilder {
    pub fn new(reader: Box<dyn FeatureReader>) -> Self {
        MinibatchSourceBuilder {
            reader,
            streams: Vec::new(),
            labels: Vec::new(),
            udim: Vec::new(),
            randomization_range: DEFAULT_RANDOMIZATION_RANGE,
            chunk_frames: CHUNK_FRAMES,
            frame_mode: true,
            verbosity: 0,
            augmenter: Box::new(FrameSplicer),
            lattice_source: None,
            transcripts: HashMap::new(),
        }
    }

    pub fn from_config(reader: Box<dyn FeatureReader>, cfg: SourceConfigJson) -> Self {
        let mut builder = Self::new(reader);
        for spec in cfg.streams {
            builder = builder.stream(spec);
        }
        if let Some(range) = cfg.randomization_range {
            builder = builder.randomization_range(range);
        }
        if cfg.frame_mode == Some(false) {
            builder = builder.utterance_mode();
        }
        builder
    }

    /// Append a feature stream. All streams must list the same utterances in
    /// the same order.
    pub fn stream(mut self, spec: StreamSpec) -> Self {
        self.streams.push(spec);
        self
    }

    /// Append a label stream: utterance key -> ordered label segments, plus
    /// the class-id cardinality bound. Supply none for unsupervised training.
    pub fn label_stream(
        mut self,
        labels: HashMap<String, Vec<LabelSegment>>,
        udim: usize,
    ) -> Self {
        self.labels.push(labels);
        self.udim.push(udim);
        self
    }

    /// Full randomization window in frames (half of it reaches either way
    /// from a position).
    pub fn randomization_range(mut self, frames: usize) -> Self {
        self.randomization_range = frames;
        self
    }

    /// Target chunk size in frames. The default packs roughly 15 minutes of
    /// audio per chunk.
    pub fn chunk_frames(mut self, frames: usize) -> Self {
        self.chunk_frames = frames;
        self
    }

    /// Return whole utterances per batch instead of single randomized
    /// frames. Required for lattice training.
    pub fn utterance_mode(mut self) -> Self {
        self.frame_mode = false;
        self
    }

    pub fn verbosity(mut self, verbosity: i32) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn augmenter(mut self, augmenter: Box<dyn ContextAugmenter>) -> Self {
        self.augmenter = augmenter;
        self
    }

    pub fn lattice_source(mut self, lattices: Box<dyn LatticeSource>) -> Self {
        self.lattice_source = Some(lattices);
        self
    }

    /// Word-level reference transcripts, attached to batches alongside
    /// lattices.
    pub fn word_transcripts(mut self, transcripts: HashMap<String, WordSequence>) -> Self {
        self.transcripts = transcripts;
        self
    }

    pub fn build(self) -> Result<MinibatchSource> {
        if self.streams.is_empty() {
            return Err(SourceError::Config(
                "at least one feature stream is required".to_string(),
            ));
        }
        if self.frame_mode && self.lattice_source.is_some() {
            return Err(SourceError::Config(
                "lattice training requires utterance mode".to_string(),
            ));
        }
        let infiles: Vec<Vec<String>> =
            self.streams.iter().map(|s| s.archives.clone()).collect();
        let catalog = build_catalog(
            &infiles,
            &self.labels,
            &self.udim,
            self.lattice_source.as_deref(),
            self.chunk_frames,
        )?;
        if catalog.chunks[0].len() > 1 {
            let max_chunk =
                catalog.chunks[0].iter().map(|c| c.total_frames()).max().unwrap_or(0);
            if self.randomization_range / 2 <= max_chunk {
                log::warn!(
                    "randomization range {} is not larger than twice the biggest chunk ({} frames); chunk windows will degenerate",
                    self.randomization_range,
                    max_chunk
                );
            }
        }
        let rand = Randomizer::new(
            self.verbosity,
            self.frame_mode,
            catalog.total_frames,
            catalog.num_utterances,
            self.randomization_range,
        );
        let streams = self
            .streams
            .into_iter()
            .map(|s| StreamInfo {
                vdim: s.vdim,
                left_context: s.left_context,
                right_context: s.right_context,
                info: FeatureInfo::default(),
            })
            .collect();
        Ok(MinibatchSource {
            streams,
            chunks: catalog.chunks,
            labels: catalog.labels,
            rand,
            reader: self.reader,
            augmenter: self.augmenter,
            lattices: self.lattice_source,
            transcripts: self.transcripts,
            frame_mode: self.frame_mode,
            verbosity: self.verbosity,
            chunks_in_ram: 0,
            time_get_batch: 0.0,
            total_frames: catalog.total_frames,
            num_utterances: catalog.num_utterances,
        })
    }
}

/// Minibatch source with two-level randomization and on-demand chunk paging.
///
/// Batches are requested by global time index into an infinitely repeated
/// corpus; entering a new sweep rebuilds the randomization. The source is
/// single-threaded cooperative: all mutation happens inside a `get_batch`
/// call, and returned matrices are owned copies.
pub struct MinibatchSource {
    pub(crate) streams: Vec<StreamInfo>,
    /// Per-stream chunk sequences with identical partitioning.
    pub(crate) chunks: Vec<Vec<ChunkData>>,
    pub(crate) labels: LabelStore,
    pub(crate) rand: Randomizer,
    pub(crate) reader: Box<dyn FeatureReader>,
    pub(crate) augmenter: Box<dyn ContextAugmenter>,
    pub(crate) lattices: Option<Box<dyn LatticeSource>>,
    pub(crate) transcripts: HashMap<String, WordSequence>,
    frame_mode: bool,
    pub(crate) verbosity: i32,
    pub(crate) chunks_in_ram: usize,
    time_get_batch: f64,
    total_frames: usize,
    num_utterances: usize,
}

impl fmt::Debug for MinibatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinibatchSource")
            .field("num_utterances", &self.num_utterances)
            .field("total_frames", &self.total_frames)
            .finish()
    }
}

fn context_extents(info: &StreamInfo, raw_dim: usize) -> Result<(usize, usize)> {
    if info.left_context == 0 && info.right_context == 0 {
        let extent = augmentation_extent(raw_dim, info.vdim)?;
        Ok((extent, extent))
    } else {
        Ok((info.left_context, info.right_context))
    }
}

impl MinibatchSource {
    pub fn builder(reader: Box<dyn FeatureReader>) -> MinibatchSourceBuilder {
        MinibatchSourceBuilder::new(reader)
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn num_utterances(&self) -> usize {
        self.num_utterances
    }

    pub fn is_supervised(&self) -> bool {
        self.labels.num_streams() > 0
    }

    pub fn num_label_streams(&self) -> usize {
        self.labels.num_streams()
    }

    /// Frame occurrence counts per class, for prior computation.
    pub fn unit_counts(&self, label_stream: usize) -> &[usize] {
        self.labels.counts(label_stream)
    }

    pub fn num_classes(&self, label_stream: usize) -> usize {
        self.labels.num_classes(label_stream)
    }

    pub fn set_verbosity(&mut self, verbosity: i32) {
        self.verbosity = verbosity;
        self.rand.set_verbosity(verbosity);
    }

    /// Number of chunks currently fully resident in RAM.
    pub fn chunks_in_ram(&self) -> usize {
        self.chunks_in_ram
    }

    /// Accumulated wall-clock seconds spent assembling batches.
    pub fn time_get_batch(&self) -> f64 {
        self.time_get_batch
    }

    pub fn supports_batch_subsetting(&self) -> bool {
        true
    }

    /// First global time at or after `global_ts` that `get_batch` accepts.
    /// In frame mode every time is valid; in utterance mode the requested
    /// time snaps forward to the next utterance boundary (which for a time
    /// inside the sweep's last utterance is the end of the sweep).
    pub fn first_valid_global_ts(&mut self, global_ts: usize) -> usize {
        let sweep = self.rand.ensure_sweep(global_ts, &self.chunks[0]);
        if self.frame_mode {
            return global_ts;
        }
        debug_assert!(
            global_ts >= sweep * self.total_frames && global_ts < (sweep + 1) * self.total_frames
        );
        for pos in 0..self.rand.num_sequences() {
            let s = self.rand.sequence(pos);
            if s.global_ts >= global_ts {
                return s.global_ts;
            }
        }
        self.rand.sequence(self.rand.num_sequences() - 1).global_te()
    }

    pub fn get_batch(&mut self, global_ts: usize, frames_requested: usize) -> Result<Minibatch> {
        self.get_batch_subset(global_ts, frames_requested, 0, 1)
    }

    /// Assemble the minibatch starting at `global_ts`, restricted to chunks
    /// with `chunk_index % num_subsets == subset_num` for data-parallel
    /// training. Callers should advance `global_ts` monotonically within a
    /// sweep; paging locality collapses otherwise.
    pub fn get_batch_subset(
        &mut self,
        global_ts: usize,
        frames_requested: usize,
        subset_num: usize,
        num_subsets: usize,
    ) -> Result<Minibatch> {
        assert!(
            num_subsets > 0 && subset_num < num_subsets,
            "get_batch: subset {subset_num} of {num_subsets} is not a valid partition"
        );
        assert!(frames_requested > 0, "get_batch: empty request");
        let timer = Instant::now();
        let sweep = self.rand.ensure_sweep(global_ts, &self.chunks[0]);
        let batch = if self.frame_mode {
            self.frame_batch(sweep, global_ts, frames_requested, subset_num, num_subsets)?
        } else {
            self.utterance_batch(sweep, global_ts, frames_requested, subset_num, num_subsets)?
        };
        self.time_get_batch += timer.elapsed().as_secs_f64();
        Ok(batch)
    }

    fn frame_batch(
        &mut self,
        sweep: usize,
        global_ts: usize,
        frames_requested: usize,
        subset_num: usize,
        num_subsets: usize,
    ) -> Result<Minibatch> {
        let total = self.total_frames;
        let sweep_te = (sweep + 1) * total;
        // return as much as requested, but never across the sweep end
        let global_te = (global_ts + frames_requested).min(sweep_te);
        let mb_frames = global_te - global_ts;

        let first_chunk = self.rand.chunk_for_frame_pos(global_ts);
        let last_chunk = self.rand.chunk_for_frame_pos(global_te - 1);
        // clamped to the sweep, a batch spans at most two consecutive chunks
        debug_assert!(last_chunk <= first_chunk + 1);
        let window_begin = self.rand.chunk(first_chunk).window_begin;
        let window_end = self.rand.chunk(last_chunk).window_end;
        if self.verbosity > 0 {
            log::debug!(
                "get_batch: getting randomized frames [{global_ts}..{global_te}) ({mb_frames} frames out of {frames_requested} requested) in sweep {sweep}; chunks [{first_chunk}..{last_chunk}] -> chunk window [{window_begin}..{window_end})"
            );
        }

        let mut read_from_disk = false;
        for k in 0..window_begin {
            self.release_randomized_chunk(k);
        }
        for k in window_begin..window_end {
            if k % num_subsets == subset_num {
                read_from_disk |= self.require_randomized_chunk(k, window_begin, window_end)?;
            }
        }
        for k in window_end..self.rand.num_chunks() {
            self.release_randomized_chunk(k);
        }

        // first pass: how many of the batch's frames belong to this subset
        let mut subset_frames = 0usize;
        for j in 0..mb_frames {
            let pos = (global_ts + j) % total;
            if self.rand.sequence(pos).chunk_index % num_subsets == subset_num {
                subset_frames += 1;
            }
        }

        let mut feat: Vec<Array2<f32>> = self
            .streams
            .iter()
            .map(|s| Array2::zeros((s.vdim, subset_frames)))
            .collect();
        let num_label_streams = self.labels.num_streams();
        let mut uids: Vec<Vec<i32>> = vec![vec![0; subset_frames]; num_label_streams];

        let mut cur = 0usize;
        for j in 0..mb_frames {
            // mod maps times past the sweep end back into the sequence array
            let pos = (global_ts + j) % total;
            let fref = *self.rand.sequence(pos);
            if fref.chunk_index % num_subsets != subset_num {
                continue;
            }
            // a check only; everything in the window is already resident
            read_from_disk |=
                self.require_randomized_chunk(fref.chunk_index, window_begin, window_end)?;
            let source = self.rand.chunk(fref.chunk_index).source;
            for (info, stream_chunks, feat_m) in
                izip!(&self.streams, &self.chunks, feat.iter_mut())
            {
                let utt = stream_chunks[source].utterance_frames(fref.utterance_index);
                let (left, right) = context_extents(info, utt.nrows())?;
                self.augmenter.augment(utt, fref.frame_index, left, right, feat_m, cur);
            }
            if num_label_streams > 0 {
                let cd = &self.chunks[0][source];
                let begin = cd.class_ids_begin(fref.utterance_index);
                let n = cd.num_frames_of(fref.utterance_index);
                for (k, out) in uids.iter_mut().enumerate() {
                    out[cur] = self.labels.class_ids(k, begin, n)[fref.frame_index];
                }
            }
            cur += 1;
        }
        debug_assert_eq!(cur, subset_frames);

        Ok(Minibatch {
            frames_advanced: mb_frames,
            read_from_disk,
            feat,
            uids,
            phone_boundaries: vec![Vec::new(); num_label_streams],
            sent_end_marks: vec![Vec::new(); self.streams.len()],
            lattices: Vec::new(),
            transcripts: Vec::new(),
        })
    }

    fn utterance_batch(
        &mut self,
        sweep: usize,
        global_ts: usize,
        frames_requested: usize,
        subset_num: usize,
        num_subsets: usize,
    ) -> Result<Minibatch> {
        // the requested time must name an utterance boundary exactly
        let spos = match self.rand.position_of_ts(global_ts) {
            Some(pos) => pos,
            None => panic!(
                "get_batch: global time {global_ts} does not fall on an utterance boundary; use first_valid_global_ts()"
            ),
        };

        // greedy packing: at least one utterance, then as many as fit
        let num_sequences = self.rand.num_sequences();
        let mut mb_frames = self.rand.sequence(spos).num_frames;
        let mut epos = spos + 1;
        while epos < num_sequences
            && mb_frames + self.rand.sequence(epos).num_frames < frames_requested
        {
            mb_frames += self.rand.sequence(epos).num_frames;
            epos += 1;
        }

        let (window_begin, _) = self.rand.window_of_position(spos);
        let (_, window_end) = self.rand.window_of_position(epos - 1);
        if self.verbosity > 0 {
            log::debug!(
                "get_batch: getting utterances {spos}..{} ({mb_frames} frames out of {frames_requested} requested) in sweep {sweep}; chunk window [{window_begin}..{window_end})",
                epos - 1
            );
        }

        let mut read_from_disk = false;
        for k in 0..window_begin {
            self.release_randomized_chunk(k);
        }
        for k in window_end..self.rand.num_chunks() {
            self.release_randomized_chunk(k);
        }
        for pos in spos..epos {
            let chunk_index = self.rand.sequence(pos).chunk_index;
            if chunk_index % num_subsets == subset_num {
                read_from_disk |=
                    self.require_randomized_chunk(chunk_index, window_begin, window_end)?;
            }
        }

        // frames actually returned for this subset
        let subset_frames: usize = (spos..epos)
            .map(|pos| self.rand.sequence(pos))
            .filter(|s| s.chunk_index % num_subsets == subset_num)
            .map(|s| s.num_frames)
            .sum();

        let mut feat: Vec<Array2<f32>> = self
            .streams
            .iter()
            .map(|s| Array2::zeros((s.vdim, subset_frames)))
            .collect();
        let num_label_streams = self.labels.num_streams();
        let mut uids: Vec<Vec<i32>> = vec![vec![0; subset_frames]; num_label_streams];
        let mut phone_boundaries: Vec<Vec<i32>> =
            vec![vec![0; subset_frames]; num_label_streams];
        let mut sent_end_marks: Vec<Vec<usize>> = vec![Vec::new(); self.streams.len()];
        let mut lattices = Vec::new();
        let mut transcripts = Vec::new();

        let mut cur = 0usize;
        for pos in spos..epos {
            let uref = *self.rand.sequence(pos);
            if uref.chunk_index % num_subsets != subset_num {
                continue;
            }
            let n = uref.num_frames;
            debug_assert!(num_subsets > 1 || uref.global_ts == global_ts + cur);
            let source = self.rand.chunk(uref.chunk_index).source;
            for (info, stream_chunks, feat_m, marks) in izip!(
                &self.streams,
                &self.chunks,
                feat.iter_mut(),
                sent_end_marks.iter_mut()
            ) {
                let utt = stream_chunks[source].utterance_frames(uref.utterance_index);
                debug_assert_eq!(utt.ncols(), n);
                marks.push(n + cur);
                let (left, right) = context_extents(info, utt.nrows())?;
                for t in 0..n {
                    self.augmenter.augment(
                        utt,
                        uref.frame_index + t,
                        left,
                        right,
                        feat_m,
                        cur + t,
                    );
                }
            }
            if num_label_streams > 0 {
                let begin = self.chunks[0][source].class_ids_begin(uref.utterance_index);
                for j in 0..num_label_streams {
                    uids[j][cur..cur + n].copy_from_slice(self.labels.class_ids(j, begin, n));
                    phone_boundaries[j][cur..cur + n]
                        .copy_from_slice(self.labels.phone_bounds(j, begin, n));
                }
            }
            if self.lattices.is_some() {
                let pair = self.chunks[0][source].utterance_lattice(uref.utterance_index).clone();
                if let Some(words) = self.transcripts.get(&pair.key) {
                    transcripts.push(words.clone());
                }
                lattices.push(pair);
            }
            cur += n;
        }
        debug_assert_eq!(cur, subset_frames);

        Ok(Minibatch {
            frames_advanced: mb_frames,
            read_from_disk,
            feat,
            uids,
            phone_boundaries,
            sent_end_marks,
            lattices,
            transcripts,
        })
    }
}

impl BatchSource for MinibatchSource {
    fn get_batch_subset(
        &mut self,
        global_ts: usize,
        frames_requested: usize,
        subset_num: usize,
        num_subsets: usize,
    ) -> Result<Minibatch> {
        MinibatchSource::get_batch_subset(
            self,
            global_ts,
            frames_requested,
            subset_num,
            num_subsets,
        )
    }
    fn total_frames(&self) -> usize {
        MinibatchSource::total_frames(self)
    }
    fn first_valid_global_ts(&mut self, global_ts: usize) -> usize {
        MinibatchSource::first_valid_global_ts(self, global_ts)
    }
    fn supports_batch_subsetting(&self) -> bool {
        true
    }
    fn unit_counts(&self, label_stream: usize) -> &[usize] {
        MinibatchSource::unit_counts(self, label_stream)
    }
}

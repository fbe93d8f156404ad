use std::collections::HashMap;
use std::sync::Arc;

use ndarray::prelude::*;
use rayon::prelude::*;

use crate::io::{ArchivePath, FeatureInfo, FeatureReader, LatticePair, LatticeSource};
use crate::labels::{LabelSegment, LabelStore};
use crate::{Result, SourceError};

/// Target chunk size in frames (15 minutes at 100 frames/s). Chunks run a
/// little over before being sealed, on average by half an utterance.
pub(crate) const CHUNK_FRAMES: usize = 15 * 60 * 100;
/// Utterance count at which a chunk is sealed regardless of frames.
pub(crate) const MAX_UTTERANCES_PER_CHUNK: usize = 65_535;
/// Utterances shorter than this cannot carry boundary markers; longer ones
/// exceed the frame-index representation. Both are skipped.
pub(crate) const MIN_UTTERANCE_FRAMES: usize = 2;
pub(crate) const MAX_UTTERANCE_FRAMES: usize = 65_535;

/// Descriptor of one utterance within one stream's archive.
#[derive(Debug, Clone)]
pub(crate) struct UtteranceDesc {
    pub path: ArchivePath,
    /// Offset of this utterance's first label in the flat label vectors.
    pub class_ids_begin: usize,
}

/// A contiguous group of utterances paged in and out of RAM as one unit.
///
/// The frame matrix is a cache: it is either empty (paged out) or holds
/// exactly `feat_dim x total_frames` values (paged in); no partial state
/// exists. Lattice records follow the same residency.
#[derive(Debug, Default)]
pub(crate) struct ChunkData {
    utterances: Vec<UtteranceDesc>,
    /// Prefix sums of utterance frame counts; `first_frames[i]` is the column
    /// at which utterance `i` starts in `frames`.
    first_frames: Vec<usize>,
    total_frames: usize,
    frames: Array2<f32>,
    lattices: Vec<Arc<LatticePair>>,
}

impl ChunkData {
    pub(crate) fn new() -> Self {
        ChunkData::default()
    }

    pub(crate) fn push(&mut self, utt: UtteranceDesc) {
        if self.is_in_ram() {
            panic!("push: frames already paged into RAM, too late to add utterances");
        }
        self.first_frames.push(self.total_frames);
        self.total_frames += utt.path.num_frames();
        self.utterances.push(utt);
    }

    pub(crate) fn num_utterances(&self) -> usize {
        self.utterances.len()
    }
    pub(crate) fn total_frames(&self) -> usize {
        self.total_frames
    }
    pub(crate) fn num_frames_of(&self, i: usize) -> usize {
        self.utterances[i].path.num_frames()
    }
    pub(crate) fn class_ids_begin(&self, i: usize) -> usize {
        self.utterances[i].class_ids_begin
    }
    pub(crate) fn key_of(&self, i: usize) -> &str {
        self.utterances[i].path.key()
    }

    pub(crate) fn is_in_ram(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Frame stripe of utterance `i` (dim x num_frames).
    pub(crate) fn utterance_frames(&self, i: usize) -> ArrayView2<f32> {
        if !self.is_in_ram() {
            panic!("utterance_frames: chunk data has not been paged in");
        }
        let ts = self.first_frames[i];
        let n = self.num_frames_of(i);
        self.frames.slice(s![.., ts..ts + n])
    }

    pub(crate) fn utterance_lattice(&self, i: usize) -> &Arc<LatticePair> {
        if !self.is_in_ram() {
            panic!("utterance_lattice: chunk data has not been paged in");
        }
        &self.lattices[i]
    }

    /// Page this chunk's frames (and lattices, when a source is attached)
    /// into RAM. On the first read ever, `info` is filled from the archive.
    /// Any failure leaves the chunk paged out.
    pub(crate) fn require_data(
        &mut self,
        info: &mut FeatureInfo,
        reader: &dyn FeatureReader,
        lattices: Option<&dyn LatticeSource>,
        verbosity: i32,
    ) -> Result<()> {
        if self.num_utterances() == 0 {
            panic!("require_data: cannot page in an empty chunk");
        }
        if self.is_in_ram() {
            panic!("require_data: chunk data is already in memory");
        }
        match self.fill(info, reader, lattices, verbosity) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.is_in_ram() {
                    self.release_data();
                }
                Err(e)
            }
        }
    }

    fn fill(
        &mut self,
        info: &mut FeatureInfo,
        reader: &dyn FeatureReader,
        lattices: Option<&dyn LatticeSource>,
        verbosity: i32,
    ) -> Result<()> {
        if info.dim == 0 {
            *info = reader.get_info(&self.utterances[0].path)?;
            if info.dim == 0 {
                return Err(SourceError::Config(
                    "feature reader reported a zero-dimensional stream".to_string(),
                ));
            }
            log::info!(
                "require_data: determined feature kind as {}-dimensional '{}' with frame shift {:.1} ms",
                info.dim,
                info.kind,
                info.samp_period as f64 / 1e4
            );
        }
        self.frames = Array2::zeros((info.dim, self.total_frames));
        for i in 0..self.utterances.len() {
            let ts = self.first_frames[i];
            let n = self.utterances[i].path.num_frames();
            reader.read(
                &self.utterances[i].path,
                &info.kind,
                info.samp_period,
                self.frames.slice_mut(s![.., ts..ts + n]),
            )?;
            if let Some(src) = lattices {
                let lat = src.get_lattice(self.key_of(i), n)?;
                self.lattices.push(lat);
            }
        }
        if verbosity > 0 {
            log::debug!("require_data: {} utterances read", self.utterances.len());
        }
        Ok(())
    }

    pub(crate) fn release_data(&mut self) {
        if self.num_utterances() == 0 {
            panic!("release_data: cannot page out an empty chunk");
        }
        if !self.is_in_ram() {
            panic!("release_data: chunk data is not in memory");
        }
        self.frames = Array2::zeros((0, 0));
        self.lattices.clear();
    }
}

#[derive(Debug)]
pub(crate) struct Catalog {
    /// Per-stream chunk sequences with identical partitioning.
    pub chunks: Vec<Vec<ChunkData>>,
    pub labels: LabelStore,
    pub num_utterances: usize,
    pub total_frames: usize,
}

/// Build the immutable utterance catalog: probe durations, validate across
/// streams and label/lattice sets, flatten labels, and pack utterances into
/// chunks (identically for every stream).
pub(crate) fn build_catalog(
    infiles: &[Vec<String>],
    labels: &[HashMap<String, Vec<LabelSegment>>],
    udim: &[usize],
    lattices: Option<&dyn LatticeSource>,
    chunk_frames: usize,
) -> Result<Catalog> {
    let num_streams = infiles.len();
    let num_inputs = infiles[0].len();
    if num_inputs == 0 {
        return Err(SourceError::Config("stream 0 lists no utterances".to_string()));
    }

    // Archive lists can run into the millions of entries; parse in parallel.
    let mut paths: Vec<Vec<ArchivePath>> = Vec::with_capacity(num_streams);
    for (m, files) in infiles.iter().enumerate() {
        if files.len() != num_inputs {
            return Err(SourceError::StreamCountMismatch {
                stream: m,
                expected: num_inputs,
                got: files.len(),
            });
        }
        paths.push(files.par_iter().map(|f| ArchivePath::parse(f)).collect::<Result<_>>()?);
    }

    // Stream 0 defines the canonical duration of each utterance.
    let mut valid = vec![true; num_inputs];
    let mut duration = vec![0usize; num_inputs];
    for i in 0..num_inputs {
        let n = paths[0][i].num_frames();
        if !(MIN_UTTERANCE_FRAMES..=MAX_UTTERANCE_FRAMES).contains(&n) {
            log::warn!(
                "build_catalog: skipping {} ({n} frames outside [{MIN_UTTERANCE_FRAMES}, {MAX_UTTERANCE_FRAMES}])",
                paths[0][i].logical()
            );
            valid[i] = false;
        } else {
            duration[i] = n;
        }
    }
    for (m, stream_paths) in paths.iter().enumerate().skip(1) {
        for (i, p) in stream_paths.iter().enumerate() {
            if valid[i] && p.num_frames() != duration[i] {
                log::warn!(
                    "build_catalog: skipping {} (stream {m} has {} frames, stream 0 has {})",
                    p.logical(),
                    p.num_frames(),
                    duration[i]
                );
                valid[i] = false;
            }
        }
    }

    // Labels: require every key in every label stream, with matching duration.
    // Non-contiguous segments and out-of-range class ids are configuration
    // errors rather than per-utterance skips.
    let mut no_label = 0usize;
    let mut no_lattice = 0usize;
    let mut bad_duration = 0usize;
    for i in 0..num_inputs {
        if !valid[i] {
            continue;
        }
        let key = paths[0][i].key();
        for (j, label_map) in labels.iter().enumerate() {
            let segs = match label_map.get(key) {
                Some(segs) => segs,
                None => {
                    if no_label < 5 {
                        log::warn!("build_catalog: no labels for {key} in label stream {j}");
                    }
                    no_label += 1;
                    valid[i] = false;
                    break;
                }
            };
            let mut expected = 0usize;
            for seg in segs {
                if seg.first_frame != expected {
                    return Err(SourceError::NonContiguousLabels {
                        stream: j,
                        key: key.to_string(),
                    });
                }
                if seg.class_id as usize >= udim[j] {
                    return Err(SourceError::ClassIdExceedsDim {
                        stream: j,
                        class_id: seg.class_id,
                        udim: udim[j],
                        key: key.to_string(),
                    });
                }
                expected += seg.num_frames;
            }
            if expected != duration[i] {
                log::warn!(
                    "build_catalog: skipping {key} ({expected} frames in label stream {j} vs {} in features)",
                    duration[i]
                );
                bad_duration += 1;
                valid[i] = false;
                break;
            }
        }
        if valid[i] {
            if let Some(src) = lattices {
                if !src.has_lattice(key) {
                    if no_lattice < 5 {
                        log::warn!("build_catalog: no lattice for {key}");
                    }
                    no_lattice += 1;
                    valid[i] = false;
                }
            }
        }
    }

    let invalid = valid.iter().filter(|v| !**v).count();
    if invalid * 2 > num_inputs {
        return Err(SourceError::TooManyInvalidUtterances {
            invalid,
            total: num_inputs,
        });
    }
    if invalid > 0 {
        log::warn!(
            "build_catalog: skipping {invalid} of {num_inputs} utterances ({no_label} without labels, {no_lattice} without lattices, {bad_duration} with label duration mismatches)"
        );
    }

    // Second pass: flatten labels and distribute utterances over chunks.
    // Stream 0 decides chunk boundaries; the other streams mirror them, which
    // keeps the partitioning identical everywhere.
    let mut store = LabelStore::new(labels.len());
    let mut chunks: Vec<Vec<ChunkData>> = (0..num_streams).map(|_| Vec::new()).collect();
    let mut total_frames = 0usize;
    let mut num_utterances = 0usize;
    for i in 0..num_inputs {
        if !valid[i] {
            continue;
        }
        let class_ids_begin = store.next_begin();
        for (j, label_map) in labels.iter().enumerate() {
            let segs = label_map
                .get(paths[0][i].key())
                .expect("validated label key disappeared");
            for seg in segs {
                store.append_segment(j, seg);
            }
            store.seal_utterance(j);
        }
        let seal = chunks[0].last().map_or(true, |c| {
            c.total_frames() > chunk_frames || c.num_utterances() >= MAX_UTTERANCES_PER_CHUNK
        });
        for (m, stream_chunks) in chunks.iter_mut().enumerate() {
            if seal {
                stream_chunks.push(ChunkData::new());
            }
            stream_chunks.last_mut().unwrap().push(UtteranceDesc {
                path: paths[m][i].clone(),
                class_ids_begin,
            });
        }
        total_frames += duration[i];
        num_utterances += 1;
    }
    store.verify_layout(total_frames, num_utterances);

    for m in 0..num_streams {
        log::info!(
            "feature set {m}: {total_frames} frames in {num_utterances} out of {num_inputs} utterances"
        );
    }
    log::info!(
        "build_catalog: {num_utterances} utterances grouped into {} chunks, av. chunk size: {:.1} utterances, {:.1} frames",
        chunks[0].len(),
        num_utterances as f64 / chunks[0].len() as f64,
        total_frames as f64 / chunks[0].len() as f64
    );
    for j in 0..labels.len() {
        log::info!("label set {j}: {} classes", store.num_classes(j));
    }

    Ok(Catalog {
        chunks,
        labels: store,
        num_utterances,
        total_frames,
    })
}

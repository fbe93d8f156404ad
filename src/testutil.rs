//! Synthetic corpora and in-memory collaborators for unit tests.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use ndarray::prelude::*;

use crate::io::{ArchivePath, FeatureInfo, FeatureReader, LatticePair, LatticeSource};
use crate::labels::LabelSegment;

/// Archive list for utterances of the given lengths: `utt{i}.mfc[0,len-1]`.
pub(crate) fn archive_list(lens: &[usize]) -> Vec<String> {
    lens.iter()
        .enumerate()
        .map(|(i, n)| format!("utt{i}.mfc[0,{}]", n.saturating_sub(1)))
        .collect()
}

/// Per-frame label segments with class id `t % 2` and a phone start on the
/// first frame, keyed by `utt{i}`.
pub(crate) fn frame_alternating_labels(lens: &[usize]) -> HashMap<String, Vec<LabelSegment>> {
    lens.iter()
        .enumerate()
        .map(|(i, &n)| {
            let segs = (0..n)
                .map(|t| LabelSegment {
                    first_frame: t,
                    num_frames: 1,
                    class_id: (t % 2) as u32,
                    phone_start: u32::from(t == 0),
                })
                .collect();
            (format!("utt{i}"), segs)
        })
        .collect()
}

/// Identifier baked into every synthetic frame, recoverable from row 0 of a
/// returned feature column.
pub(crate) fn frame_id(utt: usize, t: usize) -> usize {
    utt * 1000 + t
}

/// Feature reader serving deterministic frames from the archive path alone:
/// row `r` of frame `t` of utterance `u` holds `frame_id(u, t) + r`.
/// Optionally fails the first `n` reads to exercise the retry path
/// (`usize::MAX` fails forever).
pub(crate) struct MemReader {
    dim: usize,
    fail_reads: Cell<usize>,
}

impl MemReader {
    pub fn new(dim: usize) -> Self {
        MemReader {
            dim,
            fail_reads: Cell::new(0),
        }
    }

    pub fn with_failures(self, n: usize) -> Self {
        self.fail_reads.set(n);
        self
    }

    fn utt_index(path: &ArchivePath) -> usize {
        path.key()
            .strip_prefix("utt")
            .and_then(|s| s.parse().ok())
            .expect("synthetic archive paths are utt{i}.mfc")
    }
}

impl FeatureReader for MemReader {
    fn get_info(&self, _path: &ArchivePath) -> anyhow::Result<FeatureInfo> {
        Ok(FeatureInfo {
            kind: "USER".to_string(),
            dim: self.dim,
            samp_period: 100_000,
        })
    }

    fn read(
        &self,
        path: &ArchivePath,
        _kind: &str,
        _samp_period: u32,
        mut out: ArrayViewMut2<f32>,
    ) -> anyhow::Result<()> {
        let left = self.fail_reads.get();
        if left > 0 {
            if left != usize::MAX {
                self.fail_reads.set(left - 1);
            }
            anyhow::bail!("simulated transient read failure");
        }
        let utt = Self::utt_index(path);
        assert_eq!(out.ncols(), path.num_frames());
        for c in 0..path.num_frames() {
            let t = path.first_frame() + c;
            for r in 0..out.nrows() {
                out[[r, c]] = (frame_id(utt, t) + r) as f32;
            }
        }
        Ok(())
    }
}

/// Lattice source that has a lattice for every key.
pub(crate) struct MemLattices;

impl LatticeSource for MemLattices {
    fn has_lattice(&self, _key: &str) -> bool {
        true
    }

    fn get_lattice(&self, key: &str, num_frames: usize) -> anyhow::Result<Arc<LatticePair>> {
        Ok(Arc::new(LatticePair {
            key: key.to_string(),
            num_frames,
        }))
    }
}

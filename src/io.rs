use std::sync::Arc;

use ndarray::prelude::*;

use crate::{Result, SourceError};

/// Derive the utterance key from a logical archive path by stripping the
/// final extension. Keys join features with labels, lattices and word
/// transcripts. Paths without an extension are returned unchanged.
pub fn utterance_key(logical: &str) -> &str {
    match logical.rfind('.') {
        Some(i) if !logical[i + 1..].contains(['/', '\\', ':']) => &logical[..i],
        _ => logical,
    }
}

/// Parsed reference to an utterance inside a feature archive:
/// `logical=physical[first,last]` with an inclusive frame range. The
/// `logical=` alias is optional; the frame range is not, since catalog
/// construction probes utterance durations from the path alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePath {
    logical: String,
    physical: String,
    first_frame: usize,
    last_frame: usize,
}

impl ArchivePath {
    pub fn parse(path: &str) -> Result<Self> {
        let bad = |msg: &str| SourceError::ArchivePath {
            path: path.to_string(),
            msg: msg.to_string(),
        };
        let inner = path.strip_suffix(']').ok_or_else(|| {
            bad("missing frame range, expected a trailing `[first,last]` suffix")
        })?;
        let open = inner.rfind('[').ok_or_else(|| bad("unbalanced frame range brackets"))?;
        let (spec, range) = inner.split_at(open);
        let (first, last) = range[1..]
            .split_once(',')
            .ok_or_else(|| bad("frame range must be `[first,last]`"))?;
        let first_frame: usize =
            first.trim().parse().map_err(|_| bad("frame range bounds must be integers"))?;
        let last_frame: usize =
            last.trim().parse().map_err(|_| bad("frame range bounds must be integers"))?;
        if last_frame < first_frame {
            return Err(bad("empty frame range"));
        }
        let (logical, physical) = match spec.split_once('=') {
            Some((l, p)) => (l.to_string(), p.to_string()),
            None => (spec.to_string(), spec.to_string()),
        };
        if logical.is_empty() || physical.is_empty() {
            return Err(bad("empty archive path"));
        }
        Ok(ArchivePath {
            logical,
            physical,
            first_frame,
            last_frame,
        })
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }
    pub fn physical(&self) -> &str {
        &self.physical
    }
    pub fn first_frame(&self) -> usize {
        self.first_frame
    }
    pub fn num_frames(&self) -> usize {
        self.last_frame - self.first_frame + 1
    }
    /// Key used for looking up labels, lattices and transcripts.
    pub fn key(&self) -> &str {
        utterance_key(&self.logical)
    }
}

/// Feature kind, dimension and sample period of an archive, as reported by
/// the reader on first contact. The dimension stays 0 until then.
#[derive(Debug, Clone, Default)]
pub struct FeatureInfo {
    pub kind: String,
    pub dim: usize,
    /// Frame shift in 100 ns units (HTK convention; 100_000 = 10 ms).
    pub samp_period: u32,
}

/// Reads feature frames out of utterance archives. Implementations own file
/// handling, caching and format parsing; this crate only ever asks for whole
/// utterance stripes.
pub trait FeatureReader: Send {
    /// Probe kind, dimension and sample period without reading frame data.
    fn get_info(&self, path: &ArchivePath) -> anyhow::Result<FeatureInfo>;
    /// Fill `out` (dim x num_frames) with the utterance's frames. `kind` and
    /// `samp_period` are the values established for the stream and are to be
    /// checked against the archive.
    fn read(
        &self,
        path: &ArchivePath,
        kind: &str,
        samp_period: u32,
        out: ArrayViewMut2<f32>,
    ) -> anyhow::Result<()>;
}

/// Per-utterance lattice record paged in alongside feature chunks. The graph
/// payload itself lives with the lattice reader; batches carry these records
/// by shared reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatticePair {
    pub key: String,
    pub num_frames: usize,
}

pub trait LatticeSource: Send {
    fn has_lattice(&self, key: &str) -> bool;
    fn get_lattice(&self, key: &str, num_frames: usize) -> anyhow::Result<Arc<LatticePair>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word {
    pub word_id: u32,
    pub first_frame: u32,
}

/// Word-level reference transcript of one utterance.
pub type WordSequence = Vec<Word>;

/// Symmetric context extent implied by an augmented output dimension:
/// `vdim` must stack an odd number of raw frames.
pub fn augmentation_extent(raw_dim: usize, vdim: usize) -> Result<usize> {
    if raw_dim == 0 || vdim % raw_dim != 0 {
        return Err(SourceError::Config(format!(
            "output dimension {vdim} is not a multiple of the feature dimension {raw_dim}"
        )));
    }
    let window = vdim / raw_dim;
    if window % 2 == 0 {
        return Err(SourceError::Config(format!(
            "output dimension {vdim} stacks an even number of {raw_dim}-dimensional frames"
        )));
    }
    Ok(window / 2)
}

/// Fills one output column from a source frame and its neighbors.
pub trait ContextAugmenter: Send {
    /// Write the augmented representation of `src[:, frame]` into column
    /// `out_col` of `out`. `left` and `right` are context extents in frames.
    fn augment(
        &self,
        src: ArrayView2<f32>,
        frame: usize,
        left: usize,
        right: usize,
        out: &mut Array2<f32>,
        out_col: usize,
    );
}

/// Default augmenter: stacks `left..=right` neighbor frames into the output
/// column, repeating the first/last frame at utterance boundaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameSplicer;

impl ContextAugmenter for FrameSplicer {
    fn augment(
        &self,
        src: ArrayView2<f32>,
        frame: usize,
        left: usize,
        right: usize,
        out: &mut Array2<f32>,
        out_col: usize,
    ) {
        let dim = src.nrows();
        let n = src.ncols();
        debug_assert!(frame < n);
        debug_assert_eq!(out.nrows(), (left + right + 1) * dim);
        let mut row = 0;
        for off in -(left as isize)..=(right as isize) {
            let t = (frame as isize + off).clamp(0, n as isize - 1) as usize;
            out.slice_mut(s![row..row + dim, out_col]).assign(&src.column(t));
            row += dim;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_path() {
        let p = ArchivePath::parse("data/an4/cen1.mfc[0,119]").unwrap();
        assert_eq!(p.logical(), "data/an4/cen1.mfc");
        assert_eq!(p.physical(), "data/an4/cen1.mfc");
        assert_eq!(p.first_frame(), 0);
        assert_eq!(p.num_frames(), 120);
        assert_eq!(p.key(), "data/an4/cen1");
    }

    #[test]
    fn parse_aliased_path() {
        let p = ArchivePath::parse("cen1.feat=archives/block0.chunk[300,419]").unwrap();
        assert_eq!(p.logical(), "cen1.feat");
        assert_eq!(p.physical(), "archives/block0.chunk");
        assert_eq!(p.first_frame(), 300);
        assert_eq!(p.num_frames(), 120);
        assert_eq!(p.key(), "cen1");
    }

    #[test]
    fn parse_requires_frame_range() {
        assert!(ArchivePath::parse("cen1.mfc").is_err());
        assert!(ArchivePath::parse("cen1.mfc[5,4]").is_err());
        assert!(ArchivePath::parse("cen1.mfc[a,b]").is_err());
    }

    #[test]
    fn key_strips_only_a_final_extension() {
        assert_eq!(utterance_key("a/b/cen1.mfc"), "a/b/cen1");
        assert_eq!(utterance_key("a/b/cen1"), "a/b/cen1");
        assert_eq!(utterance_key("a.dir/cen1"), "a.dir/cen1");
        assert_eq!(utterance_key("a.dir/cen1.mfc"), "a.dir/cen1");
    }

    #[test]
    fn extent_from_dimensions() {
        assert_eq!(augmentation_extent(13, 13).unwrap(), 0);
        assert_eq!(augmentation_extent(13, 39).unwrap(), 1);
        assert_eq!(augmentation_extent(13, 13 * 11).unwrap(), 5);
        assert!(augmentation_extent(13, 26).is_err());
        assert!(augmentation_extent(13, 40).is_err());
    }

    #[test]
    fn splicer_clamps_at_boundaries() {
        let src = Array2::from_shape_fn((2, 4), |(r, c)| (10 * c + r) as f32);
        let mut out = Array2::zeros((6, 4));
        let sp = FrameSplicer;
        for t in 0..4 {
            sp.augment(src.view(), t, 1, 1, &mut out, t);
        }
        // middle column stacks t-1, t, t+1
        assert_eq!(out.column(1).to_vec(), vec![0., 1., 10., 11., 20., 21.]);
        // first column repeats frame 0 on the left
        assert_eq!(out.column(0).to_vec(), vec![0., 1., 0., 1., 10., 11.]);
        // last column repeats frame 3 on the right
        assert_eq!(out.column(3).to_vec(), vec![20., 21., 30., 31., 30., 31.]);
    }
}

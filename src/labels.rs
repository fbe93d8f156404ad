/// One run of identically-labeled frames inside an utterance, as produced by
/// an MLF-style label reader: `[first_frame, first_frame + num_frames)` maps
/// to `class_id`, with `phone_start` nonzero when the run opens a phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelSegment {
    pub first_frame: usize,
    pub num_frames: usize,
    pub class_id: u32,
    pub phone_start: u32,
}

const SENTINEL: i32 = -1;

#[derive(Debug, Default)]
struct LabelStream {
    class_ids: Vec<i32>,
    phone_bounds: Vec<i32>,
}

/// Flat per-frame label storage for all label streams.
///
/// Layout per stream: for each utterance in catalog order, one class id per
/// frame followed by a `-1` terminator; a parallel phone-boundary vector has
/// the identical layout. Utterances address their labels by a single shared
/// offset (`class_ids_begin`), valid for every stream.
#[derive(Debug, Default)]
pub struct LabelStore {
    streams: Vec<LabelStream>,
    num_classes: Vec<usize>,
    counts: Vec<Vec<usize>>,
}

impl LabelStore {
    pub(crate) fn new(num_streams: usize) -> Self {
        LabelStore {
            streams: (0..num_streams).map(|_| LabelStream::default()).collect(),
            num_classes: vec![0; num_streams],
            counts: vec![Vec::new(); num_streams],
        }
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    /// Offset at which the next appended utterance's labels will start.
    pub(crate) fn next_begin(&self) -> usize {
        self.streams.first().map_or(0, |s| s.class_ids.len())
    }

    pub(crate) fn append_segment(&mut self, stream: usize, seg: &LabelSegment) {
        let s = &mut self.streams[stream];
        for t in 0..seg.num_frames {
            s.class_ids.push(seg.class_id as i32);
            s.phone_bounds.push(if t == 0 { seg.phone_start as i32 } else { 0 });
        }
        let nc = &mut self.num_classes[stream];
        *nc = (*nc).max(seg.class_id as usize + 1);
        self.counts[stream].resize(*nc, 0);
        self.counts[stream][seg.class_id as usize] += seg.num_frames;
    }

    pub(crate) fn seal_utterance(&mut self, stream: usize) {
        let s = &mut self.streams[stream];
        s.class_ids.push(SENTINEL);
        s.phone_bounds.push(SENTINEL);
    }

    /// View of the `n` class ids starting at `begin`. The terminator at
    /// `begin + n` must be intact or the store has been corrupted.
    pub fn class_ids(&self, stream: usize, begin: usize, n: usize) -> &[i32] {
        let v = &self.streams[stream].class_ids;
        if v[begin + n] != SENTINEL {
            panic!("class_ids: expected terminator at offset {}, label store out of sync", begin + n);
        }
        &v[begin..begin + n]
    }

    pub fn phone_bounds(&self, stream: usize, begin: usize, n: usize) -> &[i32] {
        let v = &self.streams[stream].phone_bounds;
        if v[begin + n] != SENTINEL {
            panic!("phone_bounds: expected terminator at offset {}, label store out of sync", begin + n);
        }
        &v[begin..begin + n]
    }

    /// Highest class id seen plus one.
    pub fn num_classes(&self, stream: usize) -> usize {
        self.num_classes[stream]
    }

    /// Frame occurrence count per class, for prior computation.
    pub fn counts(&self, stream: usize) -> &[usize] {
        &self.counts[stream]
    }

    pub(crate) fn verify_layout(&self, total_frames: usize, num_utterances: usize) {
        for (j, s) in self.streams.iter().enumerate() {
            if s.class_ids.len() != total_frames + num_utterances
                || s.phone_bounds.len() != total_frames + num_utterances
            {
                panic!(
                    "label stream {j} holds {} entries for {total_frames} frames in {num_utterances} utterances, label store out of sync",
                    s.class_ids.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_two_utterances() -> LabelStore {
        let mut store = LabelStore::new(1);
        // utterance 0: 3 frames of class 2 (phone start), then 2 frames of class 0
        store.append_segment(0, &LabelSegment { first_frame: 0, num_frames: 3, class_id: 2, phone_start: 1 });
        store.append_segment(0, &LabelSegment { first_frame: 3, num_frames: 2, class_id: 0, phone_start: 0 });
        store.seal_utterance(0);
        // utterance 1: 4 frames of class 1
        store.append_segment(0, &LabelSegment { first_frame: 0, num_frames: 4, class_id: 1, phone_start: 2 });
        store.seal_utterance(0);
        store
    }

    #[test]
    fn layout_and_views() {
        let store = store_with_two_utterances();
        store.verify_layout(9, 2);
        assert_eq!(store.class_ids(0, 0, 5), &[2, 2, 2, 0, 0]);
        assert_eq!(store.phone_bounds(0, 0, 5), &[1, 0, 0, 0, 0]);
        assert_eq!(store.class_ids(0, 6, 4), &[1, 1, 1, 1]);
        assert_eq!(store.phone_bounds(0, 6, 4), &[2, 0, 0, 0]);
    }

    #[test]
    fn classes_and_counts() {
        let store = store_with_two_utterances();
        assert_eq!(store.num_classes(0), 3);
        assert_eq!(store.counts(0), &[2, 4, 3]);
    }

    #[test]
    #[should_panic(expected = "label store out of sync")]
    fn sentinel_mismatch_panics() {
        let store = store_with_two_utterances();
        // wrong length: position 4 holds a class id, not the terminator
        store.class_ids(0, 0, 4);
    }
}

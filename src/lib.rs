//! Randomized minibatch source for speech recognition training.
//!
//! Given a corpus of acoustic utterances organized across one or more parallel
//! feature streams (plus optional per-frame label streams and per-utterance
//! lattices), this crate produces minibatches of frames in a pseudo-random
//! order that approximates a global shuffle while keeping the working set
//! bounded: utterances are packed into chunks, chunks are shuffled per sweep,
//! and sequences are shuffled within a rolling window of chunks that is paged
//! in and out of RAM on demand.

use thiserror::Error;

pub mod config;
pub mod io;
pub mod labels;
pub mod logging;
pub mod util;

mod corpus;
mod paging;
mod randomizer;
mod source;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{SourceConfigJson, StreamSpec};
pub use io::{
    augmentation_extent, utterance_key, ArchivePath, ContextAugmenter, FeatureInfo, FeatureReader,
    FrameSplicer, LatticePair, LatticeSource, Word, WordSequence,
};
pub use labels::{LabelSegment, LabelStore};
pub use source::{
    BatchSource, Minibatch, MinibatchSource, MinibatchSourceBuilder, DEFAULT_RANDOMIZATION_RANGE,
};

pub type Result<T> = std::result::Result<T, SourceError>;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("archive path {path:?}: {msg}")]
    ArchivePath { path: String, msg: String },
    #[error("feature stream {stream} has {got} utterances, expected {expected}")]
    StreamCountMismatch {
        stream: usize,
        expected: usize,
        got: usize,
    },
    #[error("{invalid} of {total} utterances are invalid, assuming broken configuration")]
    TooManyInvalidUtterances { invalid: usize, total: usize },
    #[error("label segments for {key:?} are not contiguous in label stream {stream}")]
    NonContiguousLabels { stream: usize, key: String },
    #[error("class id {class_id} exceeds dimension {udim} of label stream {stream} in {key:?}")]
    ClassIdExceedsDim {
        stream: usize,
        class_id: u32,
        udim: usize,
        key: String,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("Io Error")]
    Io(#[from] std::io::Error),
    #[error("Json Decoding Error")]
    JsonDecode(#[from] serde_json::Error),
    #[error("Ndarray Shape Error")]
    NdarrayShape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

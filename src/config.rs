use std::fs;
use std::io::Read;

use serde::Deserialize;

use crate::{Result, SourceError};

/// One feature stream of the corpus: its utterance archive list, the output
/// dimension after context augmentation, and optional explicit context
/// extents (zero means "derive from the dimensions").
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSpec {
    pub archives: Vec<String>,
    pub vdim: usize,
    #[serde(default)]
    pub left_context: usize,
    #[serde(default)]
    pub right_context: usize,
}

impl StreamSpec {
    pub fn new(archives: Vec<String>, vdim: usize) -> Self {
        StreamSpec {
            archives,
            vdim,
            left_context: 0,
            right_context: 0,
        }
    }

    pub fn with_context(mut self, left: usize, right: usize) -> Self {
        self.left_context = left;
        self.right_context = right;
        self
    }
}

/// JSON corpus description for constructing a source without assembling the
/// stream lists in code.
#[derive(Debug, Deserialize)]
pub struct SourceConfigJson {
    pub streams: Vec<StreamSpec>,
    #[serde(default)]
    pub randomization_range: Option<usize>,
    #[serde(default)]
    pub frame_mode: Option<bool>,
}

impl SourceConfigJson {
    /// Parse a corpus description and reject shapes the source can never
    /// accept: no streams at all, or streams listing different numbers of
    /// utterances. Catching the latter here names the offending stream
    /// before any archive is probed.
    pub fn read(reader: impl Read) -> Result<Self> {
        let cfg: SourceConfigJson = serde_json::from_reader(reader)?;
        let expected = match cfg.streams.first() {
            Some(first) => first.archives.len(),
            None => {
                return Err(SourceError::Config(
                    "corpus config lists no feature streams".to_string(),
                ))
            }
        };
        for (m, stream) in cfg.streams.iter().enumerate().skip(1) {
            if stream.archives.len() != expected {
                return Err(SourceError::StreamCountMismatch {
                    stream: m,
                    expected,
                    got: stream.archives.len(),
                });
            }
        }
        Ok(cfg)
    }

    pub fn open(cfg_path: &str) -> Result<Self> {
        Self::read(fs::File::open(cfg_path)?)
    }
}

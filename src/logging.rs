//! Diagnostics channel for the batching engine.
//!
//! The source reports paging, randomization and catalog diagnostics through
//! the `log` facade. Training hosts usually own the terminal (progress bars,
//! a Python logger), so instead of writing to stderr this logger forwards
//! records over a channel for the host to drain between batches. Filtering
//! follows the same `verbosity` knob that gates the source's per-batch
//! messages, so one number controls both what is emitted and what is
//! forwarded.

use std::sync::Once;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{Level, LevelFilter, Metadata, Record};

/// One diagnostic record from the source.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub module: Option<String>,
    pub line: Option<u32>,
}

pub type SourceLogReceiver = Receiver<LogRecord>;

/// Maps the source's verbosity onto log levels: 0 keeps warnings and the
/// construction summary, 1 adds per-batch paging diagnostics, 2 and up adds
/// per-chunk tracing.
fn verbosity_filter(verbosity: i32) -> LevelFilter {
    match verbosity {
        i32::MIN..=0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub struct SourceLogger {
    sender: Sender<LogRecord>,
    filter: LevelFilter,
}

static LOGGER_INIT: Once = Once::new();

impl SourceLogger {
    /// Build a logger for the given source verbosity (the same value handed
    /// to `MinibatchSourceBuilder::verbosity`).
    pub fn build(verbosity: i32) -> (SourceLogger, SourceLogReceiver) {
        let (sender, receiver) = unbounded();
        let logger = SourceLogger {
            sender,
            filter: verbosity_filter(verbosity),
        };
        (logger, receiver)
    }
}

impl log::Log for SourceLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter && metadata.target().starts_with("uttsource")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let rec = LogRecord {
            level: record.level(),
            message: record.args().to_string(),
            module: record.module_path().map(str::to_string),
            line: record.line(),
        };
        // a host that dropped its receiver still gets the diagnostics
        if let Err(e) = self.sender.send(rec) {
            eprintln!("uttsource | {} | {}", record.level(), e.0.message);
        }
    }

    fn flush(&self) {}
}

pub fn init_logger(logger: SourceLogger) {
    LOGGER_INIT.call_once(|| {
        let filter = logger.filter;
        log::set_boxed_logger(Box::new(logger)).expect("Could not set logger");
        log::set_max_level(filter);
    });
}

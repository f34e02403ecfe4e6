use std::path::PathBuf;
use log::LevelFilter;
use thiserror::Error;
use crate::cli::Arguments;

// Logging
pub const PIPELINE_LOG_TARGET: &str = "pipeqc::pipeline";

// Report markers and schemas
pub const METRICS_CLASS_MARKER: &str = "## METRICS CLASS";
pub const COMPLEXITY_HEADERS: [&str; 7] = [
    "TotalReadPairs",
    "DistinctReadPairs",
    "OneReadPair",
    "TwoReadPairs",
    "NRF",
    "PBC1",
    "PBC2",
];

// Keys read from the Picard duplication report
pub const DUP_READ_PAIRS_EXAMINED: &str = "read_pairs_examined";
pub const DUP_UNPAIRED_READS_EXAMINED: &str = "unpaired_reads_examined";
pub const DUP_READ_PAIR_DUPLICATES: &str = "read_pair_duplicates";
pub const DUP_UNPAIRED_READ_DUPLICATES: &str = "unpaired_read_duplicates";
pub const DUP_PERCENT_DUPLICATION: &str = "percent_duplication";

// Static filenames
pub const QC_JSON_SUFFIX: &str = "qc.json";
pub const DEFAULT_OUT_PREFIX: &str = "pipeqc";

// Signal a producer gets when its reader exits first
pub const SIGPIPE: i32 = 13;


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Stage {stage}: cannot tokenize command `{command}`")]
    CommandParse { stage: usize, command: String },

    #[error("Stage {stage}: failed to launch {program}: {error}")]
    ProcessLaunch {
        stage: usize,
        program: String,
        error: String,
    },

    #[error("Stage {stage} failed with {status}{}", stderr_suffix(.stderr))]
    StageFailure {
        stage: usize,
        status: String,
        stderr: Option<String>,
    },

    #[error("Malformed metrics: {0}")]
    MalformedMetrics(String),

    #[error("Missing metric: {0}")]
    MissingMetric(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(text) if !text.trim().is_empty() => format!(": {}", text.trim()),
        _ => String::new(),
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub log_level: LevelFilter,
}

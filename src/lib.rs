// src/lib.rs
pub mod config;
pub mod utils;
pub mod pipelines;
pub mod cli;
pub use cli::Arguments;
pub use config::defs::PipelineError;
pub use utils::command::{Pipeline, PipelineStage};
pub use utils::pipeline::{run_pipe, PipelineExecutor, PipelineResult, StageStatus};

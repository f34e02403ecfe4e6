use std::path::PathBuf;
use std::sync::Arc;
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use crate::config::defs::{PipelineError, RunConfig};
use crate::utils::command::Pipeline;
use crate::utils::file::resolve_path;
use crate::utils::pipeline::PipelineExecutor;


/// Builds the pipeline described on the command line, relative sink paths landing in the cwd.
pub fn pipeline_from_config(config: &RunConfig) -> Result<Pipeline, PipelineError> {
    let pipeline = Pipeline::from_commands(&config.args.stages)?;
    Ok(match &config.args.sink {
        Some(sink) => pipeline.with_sink(resolve_path(&PathBuf::from(sink), &config.cwd)),
        None => pipeline,
    })
}


pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    println!("\n-------------\n Run Pipe\n-------------\n");

    let pipeline = pipeline_from_config(&config)?;
    let executor = PipelineExecutor::new();
    let result = executor.execute(&pipeline).await?;

    if let Some(last) = pipeline.last_stage() {
        if !result.stderr.is_empty() {
            warn!("{} stderr: {}", last.program(), result.stderr_text().trim_end());
        }
    }

    match pipeline.sink() {
        Some(sink) => info!("Output written to {}", sink.display()),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&result.stdout).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

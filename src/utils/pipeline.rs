// src/utils/pipeline.rs: runs a Pipeline as a chain of OS processes joined by pipes
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use futures::future::join_all;
use log::{Level, Log, Metadata, Record};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;

use crate::config::defs::{PipelineError, PIPELINE_LOG_TARGET, SIGPIPE};
use crate::utils::command::Pipeline;
use crate::utils::file::remove_partial_file;


/// How one stage finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: usize,
    pub program: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl StageStatus {
    fn from_exit(stage: usize, program: &str, status: ExitStatus) -> Self {
        StageStatus {
            stage,
            program: program.to_string(),
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Killed because its reader went away, e.g. upstream of `head`.
    pub fn broken_pipe(&self) -> bool {
        self.signal == Some(SIGPIPE)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}


#[derive(Debug, Clone, Default)]
pub struct PipelineResult {
    /// Final stage stdout; empty when it went to a sink file.
    pub stdout: Vec<u8>,
    /// Final stage stderr.
    pub stderr: Vec<u8>,
    /// One entry per stage, in pipe order.
    pub statuses: Vec<StageStatus>,
}

impl PipelineResult {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}


/// Forwards to whatever logger the process installed.
struct GlobalLogger;

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        log::logger().log(record)
    }

    fn flush(&self) {
        log::logger().flush()
    }
}


struct RunningStage {
    stage: usize,
    program: String,
    child: Child,
    stderr_task: Option<JoinHandle<(Vec<u8>, Option<std::io::Error>)>>,
    terminated: bool,
}


/// Executes pipelines. Holds only the logging sink, so one executor can run any number of
/// pipelines, each call owning its own processes and descriptors.
pub struct PipelineExecutor {
    logger: Arc<dyn Log>,
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineExecutor {
    pub fn new() -> Self {
        PipelineExecutor {
            logger: Arc::new(GlobalLogger),
        }
    }

    pub fn with_logger(logger: Arc<dyn Log>) -> Self {
        PipelineExecutor { logger }
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        let record = Record::builder()
            .level(level)
            .target(PIPELINE_LOG_TARGET)
            .module_path_static(Some(module_path!()))
            .file_static(Some(file!()))
            .args(args)
            .build();
        if self.logger.enabled(record.metadata()) {
            self.logger.log(&record);
        }
    }

    /// Runs every stage of `pipeline` concurrently, stage i's stdout feeding stage i+1's stdin.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - Stages in pipe order plus an optional sink file.
    ///
    /// # Returns
    /// The final stage's stdout (unless sunk to a file) and stderr, plus every stage's status.
    /// Any stage exiting non-zero fails the whole call, and a sink file is removed on failure.
    pub async fn execute(&self, pipeline: &Pipeline) -> Result<PipelineResult, PipelineError> {
        let stages = pipeline.stages();
        if stages.is_empty() {
            return Err(PipelineError::InvalidPipeline("pipeline has no stages".to_string()));
        }
        if let Some(sink) = pipeline.sink() {
            if sink.as_os_str().is_empty() {
                return Err(PipelineError::InvalidPipeline("sink path is empty".to_string()));
            }
            if sink.is_dir() {
                return Err(PipelineError::InvalidPipeline(format!("sink {} is a directory", sink.display())));
            }
        }

        self.emit(Level::Info, format_args!("Running pipeline: {}", pipeline));

        let last = stages.len();
        let mut running: Vec<RunningStage> = Vec::with_capacity(last);
        let mut upstream: Option<ChildStdout> = None;
        // Only a sink this call created may be removed on failure.
        let mut created_sink: Option<&Path> = None;

        for (i, stage) in stages.iter().enumerate() {
            let n = i + 1;
            let is_last = n == last;
            let mut cmd = stage.command();
            cmd.kill_on_drop(true);
            self.emit(Level::Info, format_args!("step {}: {}", n, stage));

            if let Some(prev_stdout) = upstream.take() {
                let stdin: Stdio = match prev_stdout.try_into() {
                    Ok(stdio) => stdio,
                    Err(e) => {
                        self.abort(running, created_sink).await;
                        return Err(PipelineError::IOError(format!("stage {}: cannot hand over pipe: {}", n, e)));
                    }
                };
                cmd.stdin(stdin);
            }

            match (is_last, pipeline.sink()) {
                (true, Some(sink)) => {
                    let file = match create_sink(sink).await {
                        Ok(file) => file,
                        Err(e) => {
                            self.abort(running, None).await;
                            return Err(PipelineError::IOError(format!("cannot create sink {}: {}", sink.display(), e)));
                        }
                    };
                    created_sink = Some(sink);
                    cmd.stdout(Stdio::from(file));
                }
                _ => {
                    cmd.stdout(Stdio::piped());
                }
            }
            cmd.stderr(Stdio::piped());

            let spawned = cmd.spawn();
            // The Command still owns the parent's copies of the previous read end and the sink
            // file; they must close now or the downstream reader never sees EOF.
            drop(cmd);

            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    self.emit(Level::Warn, format_args!("step {}: failed to launch {}: {}", n, stage.program(), e));
                    self.abort(running, created_sink).await;
                    return Err(PipelineError::ProcessLaunch {
                        stage: n,
                        program: stage.program().to_string(),
                        error: e.to_string(),
                    });
                }
            };

            let mut stderr_task = None;
            if !is_last {
                upstream = child.stdout.take();
                stderr_task = child.stderr.take().map(drain_stderr);
            }
            running.push(RunningStage {
                stage: n,
                program: stage.program().to_string(),
                child,
                stderr_task,
                terminated: false,
            });
        }

        // Only the final stage's streams are still attached to its Child.
        let final_stage = match running.pop() {
            Some(stage) => stage,
            None => return Err(PipelineError::InvalidPipeline("pipeline has no stages".to_string())),
        };
        let output = match final_stage.child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                self.abort(running, created_sink).await;
                return Err(PipelineError::IOError(format!("waiting on stage {}: {}", final_stage.stage, e)));
            }
        };

        // A failed final stage will never drain its input again; stop whatever is still upstream.
        if !output.status.success() {
            for stage in running.iter_mut() {
                if let Ok(Some(_)) = stage.child.try_wait() {
                    continue;
                }
                match stage.child.start_kill() {
                    Ok(()) => stage.terminated = true,
                    Err(e) => self.emit(Level::Debug, format_args!("step {}: kill failed: {}", stage.stage, e)),
                }
            }
        }

        let mut statuses = Vec::with_capacity(last);
        let mut terminated = Vec::with_capacity(last);
        let mut stderr_tasks = Vec::with_capacity(last - 1);
        let mut wait_error = None;
        for mut stage in running {
            match stage.child.wait().await {
                Ok(status) => statuses.push(StageStatus::from_exit(stage.stage, &stage.program, status)),
                Err(e) => {
                    wait_error.get_or_insert_with(|| format!("waiting on stage {}: {}", stage.stage, e));
                    statuses.push(StageStatus {
                        stage: stage.stage,
                        program: stage.program.clone(),
                        code: None,
                        signal: None,
                    });
                }
            }
            terminated.push(stage.terminated);
            stderr_tasks.push(stage.stderr_task.take());
        }
        terminated.push(false);
        let drained = join_all(stderr_tasks.into_iter().map(|task| async move {
            match task {
                Some(task) => task.await.unwrap_or_default(),
                None => (Vec::new(), None),
            }
        }))
        .await;
        let mut upstream_stderr: Vec<Vec<u8>> = Vec::with_capacity(drained.len());
        for (i, (stderr, read_error)) in drained.into_iter().enumerate() {
            if let Some(e) = read_error {
                self.emit(Level::Debug, format_args!("step {}: reading stderr failed: {}", i + 1, e));
            }
            if !stderr.is_empty() {
                self.emit(Level::Debug, format_args!(
                    "step {} stderr: {}",
                    i + 1,
                    String::from_utf8_lossy(&stderr).trim_end()
                ));
            }
            upstream_stderr.push(stderr);
        }
        statuses.push(StageStatus::from_exit(final_stage.stage, &final_stage.program, output.status));

        if let Some(error) = wait_error {
            self.remove_sink(created_sink).await;
            return Err(PipelineError::IOError(error));
        }

        let failed = statuses
            .iter()
            .find(|s| !s.success() && !(s.stage < last && (s.broken_pipe() || terminated[s.stage - 1])));
        if let Some(failed) = failed {
            let stderr_bytes = if failed.stage == last {
                &output.stderr
            } else {
                &upstream_stderr[failed.stage - 1]
            };
            let stderr = if stderr_bytes.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(stderr_bytes).into_owned())
            };
            self.emit(Level::Warn, format_args!(
                "step {} ({}) failed with {}",
                failed.stage, failed.program, failed
            ));
            self.remove_sink(created_sink).await;
            return Err(PipelineError::StageFailure {
                stage: failed.stage,
                status: failed.to_string(),
                stderr,
            });
        }

        for status in &statuses {
            self.emit(Level::Debug, format_args!("step {} ({}) finished with {}", status.stage, status.program, status));
        }

        Ok(PipelineResult {
            stdout: output.stdout,
            stderr: output.stderr,
            statuses,
        })
    }

    /// Kills and reaps stages already started, then drops a partially written sink.
    async fn abort(&self, running: Vec<RunningStage>, sink: Option<&Path>) {
        for mut stage in running {
            if let Err(e) = stage.child.start_kill() {
                self.emit(Level::Debug, format_args!("step {}: kill failed: {}", stage.stage, e));
            }
            let _ = stage.child.wait().await;
            if let Some(task) = stage.stderr_task.take() {
                task.abort();
            }
        }
        self.remove_sink(sink).await;
    }

    async fn remove_sink(&self, sink: Option<&Path>) {
        if let Some(path) = sink {
            if let Err(e) = remove_partial_file(path).await {
                self.emit(Level::Warn, format_args!("could not remove partial sink {}: {}", path.display(), e));
            }
        }
    }
}


async fn create_sink(path: &Path) -> std::io::Result<std::fs::File> {
    let file = tokio::fs::File::create(path).await?;
    Ok(file.into_std().await)
}


/// Reads a stage's stderr to EOF. A read error comes back with whatever was read before it.
fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<(Vec<u8>, Option<std::io::Error>)> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let error = stderr.read_to_end(&mut buf).await.err();
        (buf, error)
    })
}


/// Runs `steps` as `step1 | step2 | ...`, optionally sending the last step's stdout to `outfile`.
///
/// # Returns
/// (captured stdout, captured stderr) of the final step.
pub async fn run_pipe<S: AsRef<str>>(steps: &[S], outfile: Option<&Path>) -> Result<(Vec<u8>, Vec<u8>), PipelineError> {
    let mut pipeline = Pipeline::from_commands(steps)?;
    if let Some(path) = outfile {
        pipeline = pipeline.with_sink(path);
    }
    let result = PipelineExecutor::new().execute(&pipeline).await?;
    Ok((result.stdout, result.stderr))
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::utils::command::PipelineStage;

    #[derive(Default)]
    struct CaptureLogger {
        lines: Mutex<Vec<String>>,
    }

    impl Log for CaptureLogger {
        fn enabled(&self, _metadata: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            self.lines.lock().unwrap().push(format!("{} {}", record.level(), record.args()));
        }

        fn flush(&self) {}
    }

    #[tokio::test]
    async fn test_two_stage_capture() -> anyhow::Result<()> {
        let (out, err) = run_pipe(&["printf 'a\\nb\\nc\\n'", "grep b"], None).await?;
        assert_eq!(out, b"b\n");
        assert!(err.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_single_stage_capture() -> anyhow::Result<()> {
        let pipeline = Pipeline::new(vec![PipelineStage::new("printf").arg("%s-%s").args(["x", "y"])])?;
        let result = PipelineExecutor::new().execute(&pipeline).await?;
        assert_eq!(result.stdout_text(), "x-y");
        assert_eq!(result.statuses.len(), 1);
        assert!(result.statuses[0].success());
        Ok(())
    }

    #[tokio::test]
    async fn test_final_stderr_captured() -> anyhow::Result<()> {
        let (out, err) = run_pipe(&["printf 'q\\n'", "sh -c 'cat; echo warned >&2'"], None).await?;
        assert_eq!(out, b"q\n");
        assert_eq!(err, b"warned\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_pipe_upstream_is_not_failure() -> anyhow::Result<()> {
        let (out, _) = run_pipe(&["yes", "head -n 2"], None).await?;
        assert_eq!(out, b"y\ny\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_intermediate_failure_reported() -> anyhow::Result<()> {
        let result = run_pipe(&["printf 'a\\n'", "sh -c 'cat >/dev/null; echo boom >&2; exit 3'", "cat"], None).await;
        match result {
            Err(PipelineError::StageFailure { stage, status, stderr }) => {
                assert_eq!(stage, 2);
                assert_eq!(status, "exit status 3");
                assert_eq!(stderr.as_deref(), Some("boom\n"));
            }
            other => panic!("Expected StageFailure, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_program() -> anyhow::Result<()> {
        let result = run_pipe(&["printf 'a\\n'", "pipeqc-no-such-program-xyz"], None).await;
        match result {
            Err(PipelineError::ProcessLaunch { stage, program, .. }) => {
                assert_eq!(stage, 2);
                assert_eq!(program, "pipeqc-no-such-program-xyz");
            }
            other => panic!("Expected ProcessLaunch, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_sink_must_not_be_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pipeline = Pipeline::from_commands(["printf x"])?.with_sink(dir.path());
        let result = PipelineExecutor::new().execute(&pipeline).await;
        assert!(matches!(result, Err(PipelineError::InvalidPipeline(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_stderr_collects_output() -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo one >&2; echo two >&2")
            .stderr(Stdio::piped())
            .spawn()?;
        let task = drain_stderr(child.stderr.take().ok_or_else(|| anyhow::anyhow!("no stderr"))?);
        child.wait().await?;
        let (buf, error) = task.await?;
        assert_eq!(buf, b"one\ntwo\n");
        assert!(error.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_killed_upstream_not_reported() -> anyhow::Result<()> {
        let logger = Arc::new(CaptureLogger::default());
        let executor = PipelineExecutor::with_logger(logger.clone());
        let pipeline = Pipeline::from_commands(["sleep 30", "cat", "sh -c 'exit 5'"])?;

        match executor.execute(&pipeline).await {
            Err(PipelineError::StageFailure { stage, status, .. }) => {
                assert_eq!(stage, 3);
                assert_eq!(status, "exit status 5");
            }
            other => panic!("Expected StageFailure, got {:?}", other),
        }
        let lines = logger.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l == "WARN step 3 (sh) failed with exit status 5"), "{:?}", lines);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_logger_sees_stages() -> anyhow::Result<()> {
        let logger = Arc::new(CaptureLogger::default());
        let executor = PipelineExecutor::with_logger(logger.clone());
        let pipeline = Pipeline::from_commands(["printf z", "cat"])?;
        executor.execute(&pipeline).await?;

        let lines = logger.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l == "INFO Running pipeline: printf z | cat"), "{:?}", lines);
        assert!(lines.iter().any(|l| l == "INFO step 1: printf z"), "{:?}", lines);
        assert!(lines.iter().any(|l| l == "INFO step 2: cat"), "{:?}", lines);
        assert!(lines.iter().any(|l| l.starts_with("DEBUG step 2 (cat) finished with exit status 0")));
        Ok(())
    }
}

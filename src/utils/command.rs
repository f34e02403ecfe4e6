/// Functions and structs for describing the commands chained into a pipeline.
///
/// A stage is always held as a program plus an explicit argument vector. Free-form
/// shell strings are tokenized once, here, and never re-joined for execution.

use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use crate::config::defs::PipelineError;


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStage {
    program: String,
    args: Vec<String>,
}

impl PipelineStage {
    pub fn new(program: impl Into<String>) -> Self {
        PipelineStage {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Tokenizes a shell command string with shell-word rules.
    ///
    /// # Arguments
    ///
    /// * `command` - e.g. `awk 'BEGIN{OFS="\t"}{print $1}'`
    ///
    /// # Returns
    /// The stage, or `CommandParse` for unbalanced quoting or an empty command.
    pub fn parse(command: &str) -> Result<Self, PipelineError> {
        Self::parse_at(1, command)
    }

    fn parse_at(stage: usize, command: &str) -> Result<Self, PipelineError> {
        let parse_error = || PipelineError::CommandParse {
            stage,
            command: command.to_string(),
        };
        let mut words = shlex::split(command).ok_or_else(parse_error)?.into_iter();
        let program = words.next().ok_or_else(parse_error)?;
        Ok(PipelineStage {
            program,
            args: words.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// A fresh, unconfigured command for this stage. Stdio wiring is the executor's job.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        match shlex::try_join(words.clone()) {
            Ok(joined) => write!(f, "{}", joined),
            Err(_) => write!(f, "{}", words.collect::<Vec<_>>().join(" ")),
        }
    }
}


/// An ordered chain of stages, optionally ending in a sink file.
/// Always holds at least one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
    sink: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::InvalidPipeline("pipeline has no stages".to_string()));
        }
        Ok(Pipeline { stages, sink: None })
    }

    /// Builds a pipeline from shell command strings, one per stage, in pipe order.
    pub fn from_commands<I, S>(commands: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let commands: Vec<S> = commands.into_iter().collect();
        if commands.is_empty() {
            return Err(PipelineError::InvalidPipeline("pipeline has no stages".to_string()));
        }
        let stages = commands
            .iter()
            .enumerate()
            .map(|(i, command)| PipelineStage::parse_at(i + 1, command.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stages)
    }

    /// Redirects the final stage's stdout to `path` (created or truncated) instead of capturing it.
    pub fn with_sink(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink = Some(path.into());
        self
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn sink(&self) -> Option<&Path> {
        self.sink.as_deref()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// The stage whose output is captured or sunk.
    pub fn last_stage(&self) -> Option<&PipelineStage> {
        self.stages.last()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: Vec<String> = self.stages.iter().map(ToString::to_string).collect();
        write!(f, "{}", chain.join(" | "))?;
        if let Some(sink) = &self.sink {
            write!(f, " > {}", sink.display())?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_quoted_words() -> anyhow::Result<()> {
        let stage = PipelineStage::parse(r#"awk 'BEGIN{OFS="\t"}{print $1,$2}'"#)?;
        assert_eq!(stage.program(), "awk");
        assert_eq!(stage.argv(), &[r#"BEGIN{OFS="\t"}{print $1,$2}"#.to_string()]);

        let stage = PipelineStage::parse("grep -v 'chrM'")?;
        assert_eq!(stage.argv(), &["-v".to_string(), "chrM".to_string()]);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_bad_quoting() {
        match PipelineStage::parse("grep 'unterminated") {
            Err(PipelineError::CommandParse { stage, command }) => {
                assert_eq!(stage, 1);
                assert_eq!(command, "grep 'unterminated");
            }
            other => panic!("Expected CommandParse, got {:?}", other),
        }
        assert!(matches!(PipelineStage::parse("   "), Err(PipelineError::CommandParse { .. })));
    }

    #[test]
    fn test_from_commands_reports_stage_index() {
        let result = Pipeline::from_commands(["sort", "uniq -c", "awk '{print $1"]);
        assert!(matches!(result, Err(PipelineError::CommandParse { stage: 3, .. })));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let empty: Vec<&str> = Vec::new();
        assert!(matches!(Pipeline::from_commands(empty), Err(PipelineError::InvalidPipeline(_))));
        assert!(matches!(Pipeline::new(Vec::new()), Err(PipelineError::InvalidPipeline(_))));
    }

    #[test]
    fn test_structured_stage_display() -> anyhow::Result<()> {
        let stage = PipelineStage::new("samtools")
            .arg("sort")
            .args(["-n", "-o", "out.bam"]);
        assert_eq!(stage.to_string(), "samtools sort -n -o out.bam");

        let pipeline = Pipeline::new(vec![stage, PipelineStage::new("gzip").arg("-cn")])?
            .with_sink("reads.gz");
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.last_stage().map(|s| s.program()), Some("gzip"));
        assert_eq!(pipeline.to_string(), "samtools sort -n -o out.bam | gzip -cn > reads.gz");

        // Rendered form tokenizes back to the same argv
        let spaced = PipelineStage::new("printf").arg("%s\n").arg("two words");
        assert_eq!(PipelineStage::parse(&spaced.to_string())?, spaced);
        Ok(())
    }
}

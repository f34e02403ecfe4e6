use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pipeqc", version = "0.1", about = "Runs external-tool pipe chains and parses their QC reports")]
pub struct Arguments {

    #[arg(short, long, help = "Module to run: run_pipe or filter_qc")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named 'pipeqc_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    // run_pipe
    #[arg(short = 's', long = "stage", help = "One pipeline stage as a shell command string; repeat in pipe order")]
    pub stages: Vec<String>,

    #[arg(long, help = "File receiving the final stage's stdout instead of it being captured")]
    pub sink: Option<String>,

    // filter_qc
    #[arg(long, help = "Directory report ids are resolved against; defaults to the current directory")]
    pub store: Option<String>,

    #[arg(long = "dup", help = "Id of the duplicate-marking metrics report")]
    pub dup_report: Option<String>,

    #[arg(long = "pbc", help = "Id of the library complexity report")]
    pub pbc_report: Option<String>,

    #[arg(long = "flagstat", help = "Id of the alignment summary of the final filtered alignments")]
    pub flagstat_report: Option<String>,

    #[arg(long = "initial-flagstat", help = "Id of the alignment summary of the raw input alignments")]
    pub initial_flagstat_report: Option<String>,

    #[arg(long, default_value_t = false)]
    pub paired_end: bool,

    #[arg(long, help = "Prefix for the QC summary file name; defaults to the flagstat id stem")]
    pub prefix: Option<String>,
}

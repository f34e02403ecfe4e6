pub mod filter_qc;
pub mod run_pipe;

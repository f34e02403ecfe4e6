pub mod command;
pub mod file;
pub mod metrics;
pub mod pipeline;
pub mod storage;

// src/utils/storage.rs: staging of input and output files around a run
use std::path::{Path, PathBuf};
use log::debug;
use serde::Serialize;
use crate::config::defs::PipelineError;


/// Handle to an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileLink {
    pub id: String,
    pub path: PathBuf,
}


/// Where pipeline inputs come from and outputs go to.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    /// Makes the object `id` available locally and returns its path.
    async fn fetch(&self, id: &str) -> Result<PathBuf, PipelineError>;

    /// Publishes a local file and returns a link to it.
    async fn upload(&self, path: &Path) -> Result<FileLink, PipelineError>;
}


/// Object store backed by two local directories: ids resolve under `root`,
/// uploads are copied into `out_dir`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    out_dir: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        LocalStore {
            root: root.into(),
            out_dir: out_dir.into(),
        }
    }
}

impl ObjectStore for LocalStore {
    async fn fetch(&self, id: &str) -> Result<PathBuf, PipelineError> {
        let path = self.root.join(id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(PipelineError::IOError(format!("{} is not a file", path.display()))),
            Err(e) => Err(PipelineError::IOError(format!("cannot fetch {}: {}", path.display(), e))),
        }
    }

    async fn upload(&self, path: &Path) -> Result<FileLink, PipelineError> {
        let file_name = path
            .file_name()
            .ok_or_else(|| PipelineError::IOError(format!("{} has no file name", path.display())))?;
        let id = file_name.to_string_lossy().into_owned();
        let target = self.out_dir.join(file_name);

        let same_file = match (tokio::fs::canonicalize(path).await, tokio::fs::canonicalize(&target).await) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if !same_file {
            tokio::fs::create_dir_all(&self.out_dir).await?;
            tokio::fs::copy(path, &target).await?;
        }
        debug!("Uploaded {} as {}", path.display(), id);
        Ok(FileLink { id, path: target })
    }
}

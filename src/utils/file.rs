use std::io;
use std::path::{Path, PathBuf};


/// Resolves a user-supplied path against a base directory.
///
/// # Arguments
///
/// * `path` - Absolute or relative path.
/// * `base` - Directory relative paths hang off (usually the cwd).
///
/// # Returns
/// An absolute path when `base` is absolute.
pub fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}


/// Strips known report/alignment suffixes from a file name, e.g.
/// `sample.filt.nodup.flagstat.qc` -> `sample.filt.nodup`.
pub fn report_prefix(file_name: &str) -> String {
    let mut prefix = file_name;
    for suffix in [".qc", ".flagstat", ".dup", ".pbc", ".bam"] {
        if let Some(stripped) = prefix.strip_suffix(suffix) {
            prefix = stripped;
        }
    }
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        prefix.to_string()
    }
}


/// Deletes a file left behind by a failed write. A file that was never created is fine.
pub async fn remove_partial_file(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/work");
        assert_eq!(resolve_path(Path::new("out.txt"), base), PathBuf::from("/work/out.txt"));
        assert_eq!(resolve_path(Path::new("/tmp/out.txt"), base), PathBuf::from("/tmp/out.txt"));
    }

    #[test]
    fn test_report_prefix() {
        assert_eq!(report_prefix("sample.filt.nodup.flagstat.qc"), "sample.filt.nodup");
        assert_eq!(report_prefix("sample.dup.qc"), "sample");
        assert_eq!(report_prefix("sample.pbc.qc"), "sample");
        assert_eq!(report_prefix("notes.txt"), "notes.txt");
        assert_eq!(report_prefix(".qc"), ".qc");
    }

    #[tokio::test]
    async fn test_remove_partial_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partial.out");
        tokio::fs::write(&path, b"half").await?;
        remove_partial_file(&path).await?;
        assert!(!path.exists());
        // Second removal is a no-op
        remove_partial_file(&path).await?;
        Ok(())
    }
}

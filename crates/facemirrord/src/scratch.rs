//! Request-scoped temporary files.

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A probe image staged on disk for the matcher. The file is removed when
/// the value is dropped, on every exit path of the request.
pub struct ScratchFile {
    file: NamedTempFile,
}

impl ScratchFile {
    /// Write `bytes` to a fresh file in `dir` named `probe-<random>.<extension>`.
    pub fn create(dir: &Path, bytes: &[u8], extension: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let suffix = format!(".{extension}");
        let mut file = tempfile::Builder::new()
            .prefix("probe-")
            .suffix(&suffix)
            .tempfile_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn path_buf(&self) -> PathBuf {
        self.path().to_path_buf()
    }
}

//! Per-session source file on disk.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::ExecError;

/// A uniquely named source file that lives exactly as long as its session.
///
/// The file is removed by [`SourceArtifact::release`] or on drop, whichever
/// comes first. Removal happens at most once.
#[derive(Debug)]
pub struct SourceArtifact {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl SourceArtifact {
    /// Write `code` to a fresh file under `dir` with the given suffix.
    pub fn materialize(dir: &Path, suffix: &str, code: &str) -> Result<Self, ExecError> {
        let mut file = tempfile::Builder::new()
            .prefix("coderefine-")
            .suffix(suffix)
            .tempfile_in(dir)
            .map_err(|e| ExecError::runtime(format!("create source file: {e}")))?;
        file.write_all(code.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| ExecError::runtime(format!("write source file: {e}")))?;

        let path = file.path().to_path_buf();
        debug!(path = %path.display(), bytes = code.len(), "Source file written");
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Returns `true` only for the call that removed it.
    pub fn release(&mut self) -> bool {
        let Some(file) = self.file.take() else {
            return false;
        };
        match file.close() {
            Ok(()) => debug!(path = %self.path.display(), "Source file removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Source file removal failed"),
        }
        true
    }
}

impl Drop for SourceArtifact {
    fn drop(&mut self) {
        self.release();
    }
}

//! Per-archive directory layout
//!
//! ```text
//! <work_dir>/<base>/
//!   source/             extracted tree
//!   failed/             intermediates kept after a failed run
//!   run_summary.json
//! <output_dir>/<base>/
//!   <base>.apk          intermediate (recompiled, aligned)
//!   fixed/              signer output
//!   <new-id>.apk        final artifact
//!   obb/                renamed expansion files
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::summary::RUN_SUMMARY_FILE;

/// Directory the extracted tree lives in
pub const SOURCE_DIR: &str = "source";

/// Directory failed-run intermediates are moved to
pub const FAILED_DIR: &str = "failed";

/// Directory the signer writes into
pub const SIGNER_DIR: &str = "fixed";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("archive path has no file name: {}", .0.display())]
    NoBaseName(PathBuf),

    #[error("archive not found: {}", .0.display())]
    ArchiveMissing(PathBuf),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The input archive; never modified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    path: PathBuf,
    base_name: String,
    folder: PathBuf,
}

impl SourceArchive {
    pub fn new(path: &Path) -> Result<Self, WorkspaceError> {
        let base_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WorkspaceError::NoBaseName(path.to_path_buf()))?
            .to_string();
        if !path.is_file() {
            return Err(WorkspaceError::ArchiveMissing(path.to_path_buf()));
        }
        let folder = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            path: path.to_path_buf(),
            base_name,
            folder,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem, used to key the workspace
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Containing directory, searched for a companion `obb/` folder
    pub fn folder(&self) -> &Path {
        &self.folder
    }
}

/// Workspace and output directories for one base name
#[derive(Debug, Clone)]
pub struct Workspace {
    base_name: String,
    root: PathBuf,
    output: PathBuf,
}

impl Workspace {
    pub fn new(work_dir: &Path, output_dir: &Path, base_name: &str) -> Self {
        Self {
            base_name: base_name.to_string(),
            root: work_dir.join(base_name),
            output: output_dir.join(base_name),
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// `<work_dir>/<base>`
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extracted tree
    pub fn source(&self) -> PathBuf {
        self.root.join(SOURCE_DIR)
    }

    pub fn failed(&self) -> PathBuf {
        self.root.join(FAILED_DIR)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(RUN_SUMMARY_FILE)
    }

    /// `<output_dir>/<base>`
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Recompiled archive before signing
    pub fn intermediate(&self) -> PathBuf {
        self.output.join(format!("{}.apk", self.base_name))
    }

    pub fn signer_dir(&self) -> PathBuf {
        self.output.join(SIGNER_DIR)
    }

    /// Final archive named after the new identifier
    pub fn final_archive(&self, identifier: &str) -> PathBuf {
        self.output.join(format!("{}.apk", identifier))
    }

    /// Delete leftovers from an earlier run and create the workspace root.
    pub fn reset(&self) -> Result<(), WorkspaceError> {
        for dir in [&self.root, &self.output] {
            if dir.exists() {
                debug!(path = %dir.display(), "removing leftover directory");
                fs::remove_dir_all(dir).map_err(|e| WorkspaceError::io(dir, e))?;
            }
        }
        fs::create_dir_all(&self.root).map_err(|e| WorkspaceError::io(&self.root, e))
    }

    pub fn create_output(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.output).map_err(|e| WorkspaceError::io(&self.output, e))
    }

    /// Keep the intermediate archive under `failed/` and remove the output
    /// directory. Best effort; problems are logged.
    pub fn discard_output(&self) {
        let intermediate = self.intermediate();
        if intermediate.is_file() {
            let failed = self.failed();
            let kept = fs::create_dir_all(&failed).and_then(|_| {
                let dest = failed.join(intermediate.file_name().unwrap_or_default());
                move_file(&intermediate, &dest)
            });
            if let Err(e) = kept {
                warn!(path = %intermediate.display(), error = %e, "could not keep intermediate archive");
            }
        }
        if self.output.exists() {
            if let Err(e) = fs::remove_dir_all(&self.output) {
                warn!(path = %self.output.display(), error = %e, "could not remove output directory");
            }
        }
    }
}

/// Rename, falling back to copy-and-delete across file systems.
pub(crate) fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_source_archive() {
        let temp = TempDir::new().unwrap();
        let apk = temp.path().join("demo.apk");
        fs::write(&apk, b"PK").unwrap();

        let archive = SourceArchive::new(&apk).unwrap();
        assert_eq!(archive.base_name(), "demo");
        assert_eq!(archive.folder(), temp.path());
        assert_eq!(archive.path(), apk);
    }

    #[test]
    fn test_source_archive_missing() {
        let temp = TempDir::new().unwrap();
        let err = SourceArchive::new(&temp.path().join("gone.apk")).unwrap_err();
        assert!(matches!(err, WorkspaceError::ArchiveMissing(_)));

        let err = SourceArchive::new(Path::new("/")).unwrap_err();
        assert!(matches!(err, WorkspaceError::NoBaseName(_)));
    }

    #[test]
    fn test_layout() {
        let ws = Workspace::new(Path::new("/r/tmp"), Path::new("/r/output"), "demo");
        assert_eq!(ws.source(), PathBuf::from("/r/tmp/demo/source"));
        assert_eq!(ws.summary_path(), PathBuf::from("/r/tmp/demo/run_summary.json"));
        assert_eq!(ws.intermediate(), PathBuf::from("/r/output/demo/demo.apk"));
        assert_eq!(ws.signer_dir(), PathBuf::from("/r/output/demo/fixed"));
        assert_eq!(
            ws.final_archive("com.mrf.acme.demo"),
            PathBuf::from("/r/output/demo/com.mrf.acme.demo.apk")
        );
    }

    #[test]
    fn test_reset_removes_leftovers() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(&temp.path().join("tmp"), &temp.path().join("output"), "demo");
        fs::create_dir_all(ws.source().join("smali")).unwrap();
        fs::write(ws.source().join("stale.txt"), b"old").unwrap();
        ws.create_output().unwrap();
        fs::write(ws.output().join("old.apk"), b"old").unwrap();

        ws.reset().unwrap();
        assert!(ws.root().is_dir());
        assert!(!ws.source().exists());
        assert!(!ws.output().exists());
    }

    #[test]
    fn test_discard_output_keeps_intermediate() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(&temp.path().join("tmp"), &temp.path().join("output"), "demo");
        ws.reset().unwrap();
        ws.create_output().unwrap();
        fs::write(ws.intermediate(), b"unsigned").unwrap();
        fs::create_dir_all(ws.signer_dir()).unwrap();

        ws.discard_output();
        assert!(!ws.output().exists());
        assert_eq!(fs::read(ws.failed().join("demo.apk")).unwrap(), b"unsigned");
    }
}

//! Companion OBB copy.
//!
//! Expansion files are named after the package (`main.12.com.acme.demo.obb`)
//! and often sit in a directory named after it. They are copied next to the
//! rebuilt archive with every path component renamed to the new identifier.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{RewriteError, RewriteResult};
use crate::identifier::PackageIdentifier;

/// Name of the companion resource folder, next to the archive and in the output.
pub const OBB_DIR: &str = "obb";

/// Copy `<archive_dir>/obb` into `<output_dir>/obb`, renaming old → new.
///
/// Returns the copied destination paths; empty if there is no obb folder.
pub fn copy_companion_obb(
    archive_dir: &Path,
    output_dir: &Path,
    old: &PackageIdentifier,
    new: &PackageIdentifier,
) -> RewriteResult<Vec<PathBuf>> {
    let source_root = archive_dir.join(OBB_DIR);
    if !source_root.is_dir() {
        return Ok(Vec::new());
    }
    let dest_root = output_dir.join(OBB_DIR);
    fs::create_dir_all(&dest_root).map_err(|e| RewriteError::io(&dest_root, e))?;

    let old_dotted = old.dotted();
    let new_dotted = new.dotted();
    let mut copied = Vec::new();

    for entry in WalkDir::new(&source_root)
        .follow_links(true)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| source_root.clone());
            RewriteError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&source_root)
            .map_err(|_| RewriteError::Relocation {
                from: entry.path().to_path_buf(),
                to: dest_root.clone(),
                reason: "path outside obb folder".to_string(),
            })?;

        let mut dest = dest_root.clone();
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy();
            dest.push(name.replace(&old_dotted, &new_dotted));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RewriteError::io(parent, e))?;
        }
        fs::copy(entry.path(), &dest).map_err(|e| RewriteError::io(entry.path(), e))?;
        debug!(from = %entry.path().display(), to = %dest.display(), "copied obb");
        copied.push(dest);
    }

    info!(count = copied.len(), "companion obb files copied");
    Ok(copied)
}

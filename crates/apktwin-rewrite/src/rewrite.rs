//! Tree rewrite: identifier substitution and smali layout relocation.
//!
//! The rewrite runs in two phases. Planning reads the manifest, computes the
//! new identifier, reads every candidate file and performs the substitutions
//! in memory, and checks every relocation. Only then does the commit phase
//! touch the disk, so a manifest or precondition failure leaves the tree as
//! it was.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{RewriteError, RewriteResult};
use crate::identifier::{PackageIdentifier, DEFAULT_SEGMENT};
use crate::manifest::{read_manifest_package, MANIFEST_FILE};

/// Extension of smali code-source files (both encodings rewritten).
pub const SMALI_EXTENSION: &str = "smali";

/// Extension of resource files (dotted encoding rewritten).
pub const XML_EXTENSION: &str = "xml";

/// Name of the primary smali code root.
pub const PRIMARY_CODE_ROOT: &str = "smali";

const STAGING_PREFIX: &str = ".apktwin-relocate-";

/// Options for [`rewrite_tree`].
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Literal segment inserted at index 1.
    pub segment: String,
    /// Insert the segment even if the identifier already has it at index 1.
    pub allow_reinsert: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            segment: DEFAULT_SEGMENT.to_string(),
            allow_reinsert: false,
        }
    }
}

/// A directory moved to match the new identifier layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// What a rewrite changed.
#[derive(Debug, Clone, Serialize)]
pub struct RewriteReport {
    pub old_identifier: PackageIdentifier,
    pub new_identifier: PackageIdentifier,
    /// Files whose content changed, relative to the tree root.
    pub rewritten_files: Vec<PathBuf>,
    pub relocations: Vec<Relocation>,
}

/// Which encodings a file gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileClass {
    Smali,
    Resource,
    Other,
}

fn classify(path: &Path) -> FileClass {
    match path.extension().and_then(|e| e.to_str()) {
        Some(SMALI_EXTENSION) => FileClass::Smali,
        Some(XML_EXTENSION) => FileClass::Resource,
        _ => FileClass::Other,
    }
}

/// Compute the old and new identifiers for a tree without modifying it.
pub fn plan_identifiers(
    tree: &Path,
    options: &RewriteOptions,
) -> RewriteResult<(PackageIdentifier, PackageIdentifier)> {
    let old = read_manifest_package(&tree.join(MANIFEST_FILE))?;
    if old.has_segment_at_one(&options.segment) && !options.allow_reinsert {
        return Err(RewriteError::AlreadyRewritten {
            identifier: old.dotted(),
            segment: options.segment.clone(),
        });
    }
    let new = old.with_inserted_segment(&options.segment)?;
    Ok((old, new))
}

/// Rewrite the package identifier throughout an extracted tree.
pub fn rewrite_tree(tree: &Path, options: &RewriteOptions) -> RewriteResult<RewriteReport> {
    let (old, new) = plan_identifiers(tree, options)?;
    info!(old = %old, new = %new, tree = %tree.display(), "rewriting package identifier");

    let edits = plan_text_edits(tree, &old, &new)?;
    let relocations = plan_relocations(tree, &old, &options.segment)?;

    let mut rewritten_files = Vec::with_capacity(edits.len());
    for (path, content) in edits {
        debug!(file = %path.display(), "replacing package name");
        fs::write(&path, content).map_err(|e| RewriteError::io(&path, e))?;
        let relative = path.strip_prefix(tree).unwrap_or(&path).to_path_buf();
        rewritten_files.push(relative);
    }

    for relocation in &relocations {
        relocate(relocation, &options.segment)?;
        debug!(from = %relocation.from.display(), to = %relocation.to.display(), "relocated");
    }

    info!(
        files = rewritten_files.len(),
        relocations = relocations.len(),
        "package identifier rewritten"
    );

    Ok(RewriteReport {
        old_identifier: old,
        new_identifier: new,
        rewritten_files,
        relocations,
    })
}

/// Read and substitute every candidate file; return only the changed ones.
fn plan_text_edits(
    tree: &Path,
    old: &PackageIdentifier,
    new: &PackageIdentifier,
) -> RewriteResult<Vec<(PathBuf, Vec<u8>)>> {
    let old_dotted = old.dotted();
    let new_dotted = new.dotted();
    let old_slashed = old.slashed();
    let new_slashed = new.slashed();

    let mut edits = Vec::new();
    for entry in WalkDir::new(tree)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| tree.to_path_buf());
            RewriteError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let class = classify(path);
        if class == FileClass::Other {
            continue;
        }

        let original = fs::read(path).map_err(|e| RewriteError::io(path, e))?;
        let mut content = None;
        if class == FileClass::Smali {
            content = replace_bytes(&original, old_slashed.as_bytes(), new_slashed.as_bytes());
        }
        let current = content.as_deref().unwrap_or(&original);
        if let Some(replaced) = replace_bytes(current, old_dotted.as_bytes(), new_dotted.as_bytes())
        {
            content = Some(replaced);
        }

        if let Some(content) = content {
            edits.push((path.to_path_buf(), content));
        }
    }
    Ok(edits)
}

/// Code roots are `smali/` plus the multi-dex `smali_*` siblings.
fn code_roots(tree: &Path) -> RewriteResult<Vec<PathBuf>> {
    let mut roots = Vec::new();
    let entries = fs::read_dir(tree).map_err(|e| RewriteError::io(tree, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| RewriteError::io(tree, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_dir = entry
            .file_type()
            .map_err(|e| RewriteError::io(entry.path(), e))?
            .is_dir();
        if is_dir && (name == PRIMARY_CODE_ROOT || name.starts_with("smali_")) {
            roots.push(entry.path());
        }
    }
    roots.sort();
    Ok(roots)
}

/// Plan `<root>/<seg0>/<seg1>` → `<root>/<seg0>/<segment>/<seg1>` for each code root.
fn plan_relocations(
    tree: &Path,
    old: &PackageIdentifier,
    segment: &str,
) -> RewriteResult<Vec<Relocation>> {
    let top = &old.segments()[0];
    let second = &old.segments()[1];

    let mut relocations = Vec::new();
    for root in code_roots(tree)? {
        let from = root.join(top).join(second);
        if !from.is_dir() {
            continue;
        }
        let to = root.join(top).join(segment).join(second);
        // When the moved directory is itself named `segment`, the destination
        // lives inside the source and is freed by the staging move.
        if second != segment && to.exists() {
            return Err(RewriteError::Relocation {
                from,
                to,
                reason: "destination already exists".to_string(),
            });
        }
        relocations.push(Relocation { from, to });
    }

    if relocations.is_empty() {
        let from = tree.join(PRIMARY_CODE_ROOT).join(top).join(second);
        let to = tree
            .join(PRIMARY_CODE_ROOT)
            .join(top)
            .join(segment)
            .join(second);
        return Err(RewriteError::Relocation {
            from,
            to,
            reason: "source directory missing in every smali root".to_string(),
        });
    }
    Ok(relocations)
}

fn relocate(relocation: &Relocation, segment: &str) -> RewriteResult<()> {
    let parent = relocation
        .from
        .parent()
        .ok_or_else(|| RewriteError::Relocation {
            from: relocation.from.clone(),
            to: relocation.to.clone(),
            reason: "source has no parent".to_string(),
        })?;
    let name = relocation
        .from
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!("{STAGING_PREFIX}{name}"));
    let fail = |reason: String| RewriteError::Relocation {
        from: relocation.from.clone(),
        to: relocation.to.clone(),
        reason,
    };

    fs::rename(&relocation.from, &staging).map_err(|e| fail(e.to_string()))?;
    fs::create_dir_all(parent.join(segment)).map_err(|e| fail(e.to_string()))?;
    fs::rename(&staging, &relocation.to).map_err(|e| fail(e.to_string()))?;
    Ok(())
}

/// Replace every occurrence of `from` in `haystack`.
///
/// Returns `None` when there is no occurrence.
pub fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    if from.is_empty() || haystack.len() < from.len() {
        return None;
    }
    let mut out: Option<Vec<u8>> = None;
    let mut last = 0;
    let mut i = 0;
    while i + from.len() <= haystack.len() {
        if &haystack[i..i + from.len()] == from {
            let buf = out.get_or_insert_with(|| Vec::with_capacity(haystack.len()));
            buf.extend_from_slice(&haystack[last..i]);
            buf.extend_from_slice(to);
            i += from.len();
            last = i;
        } else {
            i += 1;
        }
    }
    let mut out = out?;
    out.extend_from_slice(&haystack[last..]);
    Some(out)
}

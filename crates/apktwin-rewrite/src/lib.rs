//! Package identifier rewriting for decompiled APK trees.
//!
//! Given a tree produced by the decompiler, reads the declared package,
//! derives the side-by-side identifier by inserting a literal segment at
//! index 1, substitutes both encodings in smali and XML files, and moves the
//! smali directories to match.

mod error;
mod identifier;
mod manifest;
mod obb;
mod rewrite;

pub use error::{RewriteError, RewriteErrorKind, RewriteResult};
pub use identifier::{validate_segment, PackageIdentifier, DEFAULT_SEGMENT};
pub use manifest::{parse_manifest_package, read_manifest_package, MANIFEST_FILE};
pub use obb::{copy_companion_obb, OBB_DIR};
pub use rewrite::{
    plan_identifiers, replace_bytes, rewrite_tree, Relocation, RewriteOptions, RewriteReport,
    PRIMARY_CODE_ROOT, SMALI_EXTENSION, XML_EXTENSION,
};

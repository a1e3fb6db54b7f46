//! Package identifier model.
//!
//! An identifier such as `com.vrgame.title` has two textual encodings:
//! dotted (manifest and resource XML) and slashed (smali contents and the
//! smali directory layout).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RewriteError, RewriteResult};

/// Segment inserted at index 1 unless configured otherwise.
pub const DEFAULT_SEGMENT: &str = "mrf";

/// A dot-separated application package identifier with at least two segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageIdentifier {
    segments: Vec<String>,
}

impl PackageIdentifier {
    /// Parse a dotted identifier.
    pub fn parse(value: &str) -> RewriteResult<Self> {
        let segments: Vec<String> = value.split('.').map(str::to_string).collect();
        if segments.len() < 2 {
            return Err(RewriteError::InvalidIdentifier {
                value: value.to_string(),
                reason: "expected at least two segments".to_string(),
            });
        }
        for segment in &segments {
            validate_segment(segment).map_err(|reason| RewriteError::InvalidIdentifier {
                value: value.to_string(),
                reason,
            })?;
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Always false; identifiers have at least two segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Dotted encoding, e.g. `com.vrgame.title`.
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }

    /// Slashed encoding, e.g. `com/vrgame/title`.
    pub fn slashed(&self) -> String {
        self.segments.join("/")
    }

    /// Return a new identifier with `segment` inserted at `index`.
    ///
    /// `index` is clamped to the identifier length.
    pub fn insert_segment(&self, segment: &str, index: usize) -> RewriteResult<Self> {
        validate_segment(segment).map_err(|reason| RewriteError::InvalidIdentifier {
            value: segment.to_string(),
            reason,
        })?;
        let mut segments = self.segments.clone();
        let index = index.min(segments.len());
        segments.insert(index, segment.to_string());
        Ok(Self { segments })
    }

    /// The identifier used for the side-by-side install: `segment` at index 1.
    pub fn with_inserted_segment(&self, segment: &str) -> RewriteResult<Self> {
        self.insert_segment(segment, 1)
    }

    /// True if segment 1 already equals `segment`.
    pub fn has_segment_at_one(&self, segment: &str) -> bool {
        self.segments.get(1).map(String::as_str) == Some(segment)
    }
}

/// Check that a single identifier segment is usable in both encodings.
pub fn validate_segment(segment: &str) -> Result<(), String> {
    if segment.is_empty() {
        return Err("empty segment".to_string());
    }
    if let Some(c) = segment
        .chars()
        .find(|c| matches!(c, '.' | '/' | '\\' | '"' | '\'') || c.is_whitespace())
    {
        return Err(format!("segment {segment:?} contains {c:?}"));
    }
    Ok(())
}

impl fmt::Display for PackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

impl TryFrom<String> for PackageIdentifier {
    type Error = RewriteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PackageIdentifier> for String {
    fn from(value: PackageIdentifier) -> Self {
        value.dotted()
    }
}

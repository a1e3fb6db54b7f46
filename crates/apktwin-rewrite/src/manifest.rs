//! Manifest package extraction.
//!
//! The `package` attribute of the root `<manifest>` element is read with an
//! XML tokenizer, so any quoting style or attribute order is accepted.

use std::fs;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{RewriteError, RewriteResult};
use crate::identifier::PackageIdentifier;

/// File name of the decoded manifest at the root of an extracted tree.
pub const MANIFEST_FILE: &str = "AndroidManifest.xml";

/// Read the package identifier declared by the manifest at `path`.
pub fn read_manifest_package(path: &Path) -> RewriteResult<PackageIdentifier> {
    let content = fs::read_to_string(path).map_err(|e| RewriteError::ManifestParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let package = parse_manifest_package(&content).map_err(|reason| RewriteError::ManifestParse {
        path: path.to_path_buf(),
        reason,
    })?;
    PackageIdentifier::parse(&package).map_err(|e| RewriteError::ManifestParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Extract the raw `package` attribute value from manifest XML text.
pub fn parse_manifest_package(content: &str) -> Result<String, String> {
    let mut reader = Reader::from_str(content);

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() != b"manifest" {
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    return Err(format!("root element is <{name}>, expected <manifest>"));
                }
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| format!("malformed attribute: {e}"))?;
                    if attr.key.as_ref() == b"package" {
                        let value = attr
                            .unescape_value()
                            .map_err(|e| format!("malformed package attribute: {e}"))?;
                        let value = value.trim();
                        if value.is_empty() {
                            return Err("package attribute is empty".to_string());
                        }
                        return Ok(value.to_string());
                    }
                }
                return Err("<manifest> has no package attribute".to_string());
            }
            Ok(Event::Eof) => return Err("no <manifest> element".to_string()),
            Ok(_) => {}
            Err(e) => {
                return Err(format!(
                    "XML error at byte {}: {e}",
                    reader.buffer_position()
                ))
            }
        }
    }
}

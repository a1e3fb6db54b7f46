//! Built-in defaults (layer 1) and typed settings
//!
//! Everything lives under a single root directory, `~/VRSLAM` by default:
//! `tools/` holds the jars and an optional bundled JDK, `tmp/` the workspaces
//! and `output/` the results.

use std::path::{Path, PathBuf};

use apktwin_align::{AlignOptions, DEFAULT_ALIGNMENT, DEFAULT_PAGE_SIZE};
use apktwin_rewrite::{validate_segment, RewriteOptions, DEFAULT_SEGMENT};
use serde::{Deserialize, Serialize};

use super::effective::ConfigError;
use crate::timeout::TimeoutConfig;

/// Name of the default root directory under `$HOME`
pub const DEFAULT_ROOT_DIR: &str = "VRSLAM";

/// Java launcher inside the bundled JDK, relative to `tools/`
pub const BUNDLED_JAVA: &str = "jdk/bin/java";

/// `$HOME/VRSLAM`, or `./VRSLAM` when `$HOME` is unset
pub fn default_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_ROOT_DIR)
}

/// Directory locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSettings {
    /// Parent of per-archive workspaces
    pub work_dir: PathBuf,
    /// Parent of per-archive output directories
    pub output_dir: PathBuf,
}

/// External tool locations and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Java launcher used for every jar; the bundled JDK when present,
    /// otherwise `java` from `PATH`
    pub java: PathBuf,
    /// apktool jar (decompile and recompile)
    pub apktool_jar: PathBuf,
    /// uber-apk-signer jar
    pub signer_jar: PathBuf,
    /// Maximum wall-clock time per tool invocation
    pub timeout_seconds: u64,
    /// Time between SIGTERM and kill when a tool is stopped
    pub termination_grace_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteSettings {
    /// Literal inserted at index 1 of the package identifier
    pub segment: String,
    /// Insert again when the identifier already carries the literal
    pub allow_reinsert: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignSettings {
    /// Align the recompiled archive before signing
    pub enabled: bool,
    pub alignment: u16,
    /// Page-align stored native libraries
    pub page_align_libs: bool,
}

/// Signer options; without a keystore the signer uses its debug key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_password: Option<String>,
    /// Suffix of the signed file the signer writes; derived from the signer
    /// flags when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_suffix: Option<String>,
}

/// Typed view of the merged configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub paths: PathSettings,
    pub tools: ToolSettings,
    pub rewrite: RewriteSettings,
    pub align: AlignSettings,
    pub signing: SigningSettings,
}

fn bundled_java(tools: &Path) -> Option<PathBuf> {
    let java = tools.join(BUNDLED_JAVA);
    java.is_file().then_some(java)
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_root(&default_root())
    }
}

impl Settings {
    /// Defaults laid out under `root`
    pub fn with_root(root: &Path) -> Self {
        let tools = root.join("tools");
        let timeouts = TimeoutConfig::default();
        Self {
            paths: PathSettings {
                work_dir: root.join("tmp"),
                output_dir: root.join("output"),
            },
            tools: ToolSettings {
                java: bundled_java(&tools).unwrap_or_else(|| PathBuf::from("java")),
                apktool_jar: tools.join("apktool.jar"),
                signer_jar: tools.join("uber-apk-signer.jar"),
                timeout_seconds: timeouts.timeout_seconds,
                termination_grace_seconds: timeouts.termination_grace_seconds,
            },
            rewrite: RewriteSettings {
                segment: DEFAULT_SEGMENT.to_string(),
                allow_reinsert: false,
            },
            align: AlignSettings {
                enabled: true,
                alignment: DEFAULT_ALIGNMENT,
                page_align_libs: false,
            },
            signing: SigningSettings {
                keystore: None,
                alias: None,
                store_password: None,
                key_password: None,
                output_suffix: None,
            },
        }
    }

    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> Result<serde_json::Value, ConfigError> {
        serde_json::to_value(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Check value bounds and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts()
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("tools.{}", e)))?;
        self.align_options()
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("align.alignment: {}", e)))?;
        validate_segment(&self.rewrite.segment)
            .map_err(|e| ConfigError::ValidationError(format!("rewrite.segment: {}", e)))?;
        if self.signing.keystore.is_some() && self.signing.alias.is_none() {
            return Err(ConfigError::ValidationError(
                "signing.alias is required when signing.keystore is set".to_string(),
            ));
        }
        if self.signing.output_suffix.as_deref() == Some("") {
            return Err(ConfigError::ValidationError(
                "signing.output_suffix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig {
            timeout_seconds: self.tools.timeout_seconds,
            termination_grace_seconds: self.tools.termination_grace_seconds,
        }
    }

    pub fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions {
            segment: self.rewrite.segment.clone(),
            allow_reinsert: self.rewrite.allow_reinsert,
        }
    }

    pub fn align_options(&self) -> AlignOptions {
        AlignOptions {
            alignment: self.align.alignment,
            page_align_libs: self.align.page_align_libs,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

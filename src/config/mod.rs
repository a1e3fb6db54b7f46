//! Configuration merge system
//!
//! Implements the 4-layer configuration merge:
//! 1. Built-in defaults
//! 2. User config (~/.config/apktwin/config.toml)
//! 3. Explicit config file (--config)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::{
    default_root, AlignSettings, PathSettings, RewriteSettings, Settings, SigningSettings,
    ToolSettings, BUNDLED_JAVA, DEFAULT_ROOT_DIR,
};
pub use effective::{user_config_path, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, merge_layers, set_path};

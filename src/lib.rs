//! apktwin - side-by-side APK repackaging
//!
//! Decompiles an Android archive, inserts a segment into its package
//! identifier, recompiles, aligns and signs it, so the result installs next
//! to the original.

pub mod config;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod runner;
pub mod signal;
pub mod state;
pub mod summary;
pub mod timeout;
pub mod toolchain;
pub mod workspace;

pub use apktwin_align as align;
pub use apktwin_rewrite as rewrite;

pub use config::{EffectiveConfig, Settings};
pub use pipeline::{Pipeline, StageError};
pub use progress::{ProgressEvent, ProgressSink};
pub use runner::{ProcessRunner, ToolCommand, ToolOutput, ToolRunner};
pub use signal::CancellationToken;
pub use state::Stage;
pub use summary::{ExitCode, FailureKind, RunOutcome};

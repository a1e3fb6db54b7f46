//! Outcomes, failure taxonomy and run summaries
//!
//! Every run ends in exactly one [`RunOutcome`]; [`RunSummary`] is its
//! persisted form.

mod failure;
mod outcome;
mod run_summary;

pub use failure::{ExitCode, FailureKind, Status};
pub use outcome::{BuildArtifact, RunOutcome, StageFailure};
pub use run_summary::{
    RunSummary, StageTiming, RUN_SUMMARY_FILE, RUN_SUMMARY_SCHEMA_ID, RUN_SUMMARY_SCHEMA_VERSION,
};

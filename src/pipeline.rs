//! Pipeline orchestration
//!
//! One run takes an archive through unpack → rewrite → repack → sign:
//! - Unpack: claim the base name, clear leftovers, decompile
//! - Rewrite: insert the segment into the package identifier, copy OBB files
//! - Repack: recompile and align the intermediate archive in place
//! - Sign: sign, then move the result to `<new-id>.apk`
//!
//! Stages run strictly in order and the first failure ends the run. Every
//! failure is folded into the returned [`RunOutcome`]; a failed run leaves
//! no output directory behind.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use apktwin_align::{align_file, AlignError};
use apktwin_rewrite::{copy_companion_obb, rewrite_tree, RewriteError, RewriteErrorKind, RewriteReport};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Settings;
use crate::progress::{LogSink, ProgressEvent, ProgressSink};
use crate::registry::InFlightRegistry;
use crate::runner::{RunLimits, RunnerError, ToolCommand, ToolOutput, ToolRunner};
use crate::signal::CancellationToken;
use crate::state::{PipelineStateData, PipelineStateError, Stage};
use crate::summary::{BuildArtifact, FailureKind, RunOutcome, RunSummary, StageFailure, StageTiming};
use crate::toolchain::Toolchain;
use crate::workspace::{move_file, SourceArchive, Workspace, WorkspaceError};

/// Tool output lines quoted in failure messages
const FAILURE_TAIL_LINES: usize = 5;

/// Why a stage stopped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageError {
    pub kind: FailureKind,
    pub message: String,
    /// Exit status of the tool that failed, if it exited
    pub exit_code: Option<i32>,
}

impl StageError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }

    fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "run cancelled")
    }

    /// A tool ran to completion but did not succeed
    fn tool_exit(command: &ToolCommand, output: &ToolOutput) -> Self {
        let status = match output.exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "was terminated by a signal".to_string(),
        };
        let tail = output.tail(FAILURE_TAIL_LINES);
        let message = if tail.is_empty() {
            format!("{} {}", command.label, status)
        } else {
            format!("{} {}: {}", command.label, status, tail)
        };
        Self {
            kind: FailureKind::ExternalTool,
            message,
            exit_code: output.exit_code,
        }
    }

    fn into_failure(self, stage: Stage) -> StageFailure {
        StageFailure {
            stage,
            kind: self.kind,
            message: self.message,
            exit_code: self.exit_code,
        }
    }
}

impl From<RunnerError> for StageError {
    fn from(err: RunnerError) -> Self {
        let kind = match &err {
            RunnerError::Timeout { .. } => FailureKind::Timeout,
            RunnerError::Cancelled => FailureKind::Cancelled,
            RunnerError::Spawn { .. } | RunnerError::Io(_) => FailureKind::ExternalTool,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<RewriteError> for StageError {
    fn from(err: RewriteError) -> Self {
        let kind = match err.kind() {
            RewriteErrorKind::ManifestParse => FailureKind::ManifestParse,
            RewriteErrorKind::AlreadyRewritten => FailureKind::AlreadyRewritten,
            RewriteErrorKind::FileSystem => FailureKind::FileSystem,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<AlignError> for StageError {
    fn from(err: AlignError) -> Self {
        Self::new(FailureKind::ArchiveFormat, format!("alignment failed: {}", err))
    }
}

impl From<WorkspaceError> for StageError {
    fn from(err: WorkspaceError) -> Self {
        Self::new(FailureKind::FileSystem, err.to_string())
    }
}

impl From<io::Error> for StageError {
    fn from(err: io::Error) -> Self {
        Self::new(FailureKind::FileSystem, err.to_string())
    }
}

impl From<PipelineStateError> for StageError {
    fn from(err: PipelineStateError) -> Self {
        Self::new(FailureKind::Internal, err.to_string())
    }
}

/// Per-run data; nothing here outlives the run
struct RunContext {
    run_id: String,
    archive: SourceArchive,
    workspace: Workspace,
    state: PipelineStateData,
    timings: Vec<StageTiming>,
    report: Option<RewriteReport>,
    obb_files: Vec<PathBuf>,
    artifact: Option<BuildArtifact>,
}

/// Runs archives through the stages
pub struct Pipeline {
    settings: Settings,
    toolchain: Toolchain,
    runner: Arc<dyn ToolRunner>,
    registry: Arc<InFlightRegistry>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(settings: Settings, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            toolchain: Toolchain::from_settings(&settings),
            settings,
            runner,
            registry: InFlightRegistry::new(),
            sink: Arc::new(LogSink),
            cancel: CancellationToken::new(),
        }
    }

    /// Share an in-flight registry with other pipelines
    pub fn with_registry(mut self, registry: Arc<InFlightRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run the pipeline for one archive.
    pub fn run(&self, archive_path: &Path) -> RunOutcome {
        let run_id = Ulid::new().to_string();
        let started = Instant::now();
        info!(run_id = %run_id, archive = %archive_path.display(), "starting run");

        let archive = match SourceArchive::new(archive_path) {
            Ok(archive) => archive,
            Err(e) => {
                let outcome = RunOutcome::failure(Stage::Unpack, FailureKind::FileSystem, e.to_string());
                return self.finished(&run_id, outcome);
            }
        };

        // Held until the run returns; released on drop.
        let _guard = match self.registry.try_acquire(archive.base_name()) {
            Some(guard) => guard,
            None => {
                let outcome = RunOutcome::failure(
                    Stage::Unpack,
                    FailureKind::Busy,
                    format!("a run for {} is already in progress", archive.base_name()),
                );
                return self.finished(&run_id, outcome);
            }
        };

        let workspace = Workspace::new(
            &self.settings.paths.work_dir,
            &self.settings.paths.output_dir,
            archive.base_name(),
        );
        let mut ctx = RunContext {
            run_id,
            archive,
            workspace,
            state: PipelineStateData::new(),
            timings: Vec::new(),
            report: None,
            obb_files: Vec::new(),
            artifact: None,
        };

        let outcome = self.execute(&mut ctx);
        if !outcome.is_success() {
            ctx.workspace.discard_output();
        }
        self.write_summary(&ctx, &outcome, started);
        self.finished(&ctx.run_id, outcome)
    }

    fn execute(&self, ctx: &mut RunContext) -> RunOutcome {
        for stage in Stage::ALL {
            if let Err(err) = self.run_stage(ctx, stage) {
                if let Err(e) = ctx.state.fail() {
                    warn!(run_id = %ctx.run_id, error = %e, "could not record failure");
                }
                warn!(run_id = %ctx.run_id, stage = %stage, kind = ?err.kind, "{}", err.message);
                return RunOutcome::Failure(err.into_failure(stage));
            }
        }

        if let Err(e) = ctx.state.finish() {
            return RunOutcome::Failure(StageError::from(e).into_failure(Stage::Sign));
        }
        match ctx.artifact.take() {
            Some(artifact) => {
                info!(run_id = %ctx.run_id, artifact = %artifact.path.display(), "run succeeded");
                RunOutcome::Success { artifact }
            }
            None => RunOutcome::failure(Stage::Sign, FailureKind::Internal, "no artifact recorded"),
        }
    }

    fn run_stage(&self, ctx: &mut RunContext, stage: Stage) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::cancelled());
        }
        ctx.state.begin(stage)?;

        let (start_pct, end_pct) = stage.progress_span();
        self.emit_stage(ctx, stage, start_pct, format!("{} started", stage));

        let started = Instant::now();
        let result = match stage {
            Stage::Unpack => self.unpack(ctx),
            Stage::Rewrite => self.rewrite(ctx),
            Stage::Repack => self.repack(ctx),
            Stage::Sign => self.sign(ctx),
        };
        ctx.timings.push(StageTiming {
            stage,
            duration_ms: started.elapsed().as_millis() as u64,
            succeeded: result.is_ok(),
        });

        if result.is_ok() {
            self.emit_stage(ctx, stage, end_pct, format!("{} finished", stage));
        }
        result
    }

    fn unpack(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        ctx.workspace.reset()?;
        let command = self
            .toolchain
            .decompile(ctx.archive.path(), &ctx.workspace.source());
        self.invoke(Stage::Unpack, &command)?;
        if !ctx.workspace.source().is_dir() {
            return Err(StageError::new(
                FailureKind::FileSystem,
                format!(
                    "decompiler produced no tree at {}",
                    ctx.workspace.source().display()
                ),
            ));
        }
        Ok(())
    }

    fn rewrite(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        let report = rewrite_tree(&ctx.workspace.source(), &self.settings.rewrite_options())?;
        info!(
            run_id = %ctx.run_id,
            old = %report.old_identifier,
            new = %report.new_identifier,
            files = report.rewritten_files.len(),
            "package identifier rewritten"
        );

        ctx.obb_files = copy_companion_obb(
            ctx.archive.folder(),
            ctx.workspace.output(),
            &report.old_identifier,
            &report.new_identifier,
        )?;
        if !ctx.obb_files.is_empty() {
            info!(run_id = %ctx.run_id, count = ctx.obb_files.len(), "copied obb files");
        }
        ctx.report = Some(report);
        Ok(())
    }

    fn repack(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        ctx.workspace.create_output()?;
        let intermediate = ctx.workspace.intermediate();
        let command = self
            .toolchain
            .recompile(&ctx.workspace.source(), &intermediate);
        self.invoke(Stage::Repack, &command)?;
        if !intermediate.is_file() {
            return Err(StageError::new(
                FailureKind::FileSystem,
                format!("recompiler produced no archive at {}", intermediate.display()),
            ));
        }

        if self.settings.align.enabled {
            let report = align_file(&intermediate, &intermediate, &self.settings.align_options())?;
            info!(
                run_id = %ctx.run_id,
                stored = report.stored_count(),
                padded = report.padded_count(),
                padding = report.total_padding(),
                "archive aligned"
            );
        } else {
            debug!(run_id = %ctx.run_id, "alignment disabled");
        }
        Ok(())
    }

    fn sign(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        let identifier = match &ctx.report {
            Some(report) => report.new_identifier.dotted(),
            None => return Err(StageError::new(FailureKind::Internal, "sign before rewrite")),
        };
        let intermediate = ctx.workspace.intermediate();
        let signer_dir = ctx.workspace.signer_dir();
        fs::create_dir_all(&signer_dir)?;

        let command = self.toolchain.sign(&intermediate, &signer_dir);
        self.invoke(Stage::Sign, &command)?;

        let signed = self
            .toolchain
            .locate_signed(&signer_dir, ctx.workspace.base_name())
            .ok_or_else(|| {
                StageError::new(
                    FailureKind::FileSystem,
                    format!("signed archive not found in {}", signer_dir.display()),
                )
            })?;

        let final_path = ctx.workspace.final_archive(&identifier);
        move_file(&signed, &final_path)?;
        fs::remove_file(&intermediate)?;
        fs::remove_dir_all(&signer_dir)?;

        let (sha256, size) = digest_file(&final_path)?;
        ctx.artifact = Some(BuildArtifact {
            path: final_path,
            identifier,
            sha256,
            size,
            obb_files: std::mem::take(&mut ctx.obb_files),
        });
        Ok(())
    }

    /// Run a tool and treat a nonzero exit as a stage failure.
    fn invoke(&self, stage: Stage, command: &ToolCommand) -> Result<ToolOutput, StageError> {
        info!(stage = %stage, tool = %command.label, "running {}", command);
        let limits = RunLimits::new(&self.settings.timeouts(), self.cancel.clone());
        let output = self.runner.run(command, &limits)?;
        if !output.success {
            return Err(StageError::tool_exit(command, &output));
        }
        Ok(output)
    }

    fn emit_stage(&self, ctx: &RunContext, stage: Stage, percent: u8, message: String) {
        self.sink.emit(&ProgressEvent::Stage {
            run_id: ctx.run_id.clone(),
            stage,
            percent,
            message,
        });
    }

    fn write_summary(&self, ctx: &RunContext, outcome: &RunOutcome, started: Instant) {
        if !ctx.workspace.root().is_dir() {
            return;
        }
        let summary = RunSummary::from_outcome(
            ctx.run_id.clone(),
            ctx.archive.path().to_path_buf(),
            outcome,
            ctx.timings.clone(),
            started.elapsed().as_millis() as u64,
        )
        .with_identifiers(
            ctx.report.as_ref().map(|r| r.old_identifier.dotted()),
            ctx.report.as_ref().map(|r| r.new_identifier.dotted()),
        );
        if let Err(e) = summary.write_to_file(&ctx.workspace.summary_path()) {
            warn!(run_id = %ctx.run_id, error = %e, "could not write run summary");
        }
    }

    fn finished(&self, run_id: &str, outcome: RunOutcome) -> RunOutcome {
        self.sink.emit(&ProgressEvent::Finished {
            run_id: run_id.to_string(),
            outcome: outcome.clone(),
        });
        outcome
    }
}

/// SHA-256 (hex) and size of a file
fn digest_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

//! End-to-end pipeline runs against an in-process fake toolchain.
//!
//! The fake decompiler writes a small smali/XML tree, the fake recompiler
//! zips the tree and the fake signer copies the archive under the signer's
//! naming convention.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apktwin::align::{verify_alignment, AlignOptions};
use apktwin::config::Settings;
use apktwin::progress::ChannelSink;
use apktwin::registry::InFlightRegistry;
use apktwin::runner::{RunLimits, RunnerError};
use apktwin::summary::{RunSummary, Status, RUN_SUMMARY_FILE};
use apktwin::toolchain::{APKTOOL, SIGNER};
use apktwin::{
    ExitCode, FailureKind, Pipeline, ProgressEvent, RunOutcome, Stage, ToolCommand, ToolOutput,
    ToolRunner,
};
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.acme.demo">
    <application android:label="Demo">
        <activity android:name="com.acme.demo.MainActivity"/>
    </application>
</manifest>
"#;

const MANIFEST_NO_PACKAGE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android">
    <application android:label="Demo"/>
</manifest>
"#;

const SMALI: &str = ".class public Lcom/acme/demo/MainActivity;\n\
.super Landroid/app/Activity;\n\
.field private static final TAG:Ljava/lang/String; = \"com.acme.demo\"\n";

const STRINGS: &str = r#"<resources><string name="provider">com.acme.demo.files</string></resources>"#;

/// What the fake tool does for one invocation
#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Work,
    Exit(i32),
    Timeout,
    Cancel,
}

struct FakeToolchain {
    manifest: &'static str,
    decompile: Behavior,
    recompile: Behavior,
    sign: Behavior,
    calls: Mutex<Vec<String>>,
    sign_args: Mutex<Vec<String>>,
}

impl FakeToolchain {
    fn new() -> Self {
        Self {
            manifest: MANIFEST,
            decompile: Behavior::Work,
            recompile: Behavior::Work,
            sign: Behavior::Work,
            calls: Mutex::new(Vec::new()),
            sign_args: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn sign_args(&self) -> Vec<String> {
        self.sign_args.lock().unwrap().clone()
    }
}

fn arg_after(args: &[String], flag: &str) -> PathBuf {
    let pos = args.iter().position(|a| a == flag).unwrap();
    PathBuf::from(&args[pos + 1])
}

impl ToolRunner for FakeToolchain {
    fn run(&self, command: &ToolCommand, limits: &RunLimits) -> Result<ToolOutput, RunnerError> {
        let args = command.args_lossy();
        let (name, behavior) = match (command.label.as_str(), args[2].as_str()) {
            (APKTOOL, "d") => ("decompile", self.decompile),
            (APKTOOL, "b") => ("recompile", self.recompile),
            (SIGNER, _) => ("sign", self.sign),
            other => panic!("unexpected command {:?}", other),
        };
        self.calls.lock().unwrap().push(name.to_string());

        match behavior {
            Behavior::Work => {}
            Behavior::Exit(code) => {
                return Ok(ToolOutput {
                    stderr: vec![format!("{} failed", name)],
                    ..ToolOutput::exited(code)
                })
            }
            Behavior::Timeout => {
                return Err(RunnerError::Timeout {
                    after: Duration::from_secs(1),
                })
            }
            Behavior::Cancel => {
                limits.cancel.cancel();
                return Err(RunnerError::Cancelled);
            }
        }

        match name {
            "decompile" => write_tree(&arg_after(&args, "-o"), self.manifest),
            "recompile" => zip_tree(Path::new(&args[4]), &arg_after(&args, "-o")),
            _ => {
                *self.sign_args.lock().unwrap() = args.clone();
                let input = arg_after(&args, "-a");
                let out_dir = arg_after(&args, "-o");
                let stem = input.file_stem().unwrap().to_string_lossy().into_owned();
                // uber-apk-signer tags its output when it ran zipalign itself.
                let suffix = if args.iter().any(|a| a == "--skipZipAlign") {
                    "-debugSigned.apk"
                } else {
                    "-aligned-debugSigned.apk"
                };
                fs::create_dir_all(&out_dir).unwrap();
                fs::copy(&input, out_dir.join(format!("{}{}", stem, suffix))).unwrap();
                fs::write(out_dir.join(format!("{}.apk.idsig", stem)), b"sig").unwrap();
            }
        }
        Ok(ToolOutput::succeeded())
    }
}

fn write_tree(dest: &Path, manifest: &str) {
    fs::create_dir_all(dest.join("smali/com/acme/demo")).unwrap();
    fs::create_dir_all(dest.join("res/values")).unwrap();
    fs::write(dest.join("AndroidManifest.xml"), manifest).unwrap();
    fs::write(dest.join("smali/com/acme/demo/MainActivity.smali"), SMALI).unwrap();
    fs::write(dest.join("res/values/strings.xml"), STRINGS).unwrap();
    fs::write(dest.join("apktool.yml"), "version: 2.9.3\n").unwrap();
}

/// Zip the tree; smali is deflated, everything else stored.
fn zip_tree(source: &Path, archive: &Path) {
    let mut zip = ZipWriter::new(File::create(archive).unwrap());
    // An odd-length first entry pushes later stored data off the 4-byte grid.
    zip.start_file("a", FileOptions::default().compression_method(CompressionMethod::Stored))
        .unwrap();
    zip.write_all(b"x").unwrap();

    let mut files: Vec<PathBuf> = WalkDir::new(source)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    for path in files {
        let name = path
            .strip_prefix(source)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/");
        let method = if name.ends_with(".smali") {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        zip.start_file(name, FileOptions::default().compression_method(method))
            .unwrap();
        zip.write_all(&fs::read(&path).unwrap()).unwrap();
    }
    zip.finish().unwrap();
}

struct Fixture {
    temp: TempDir,
    apk: PathBuf,
    settings: Settings,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let inputs = temp.path().join("inputs");
        fs::create_dir_all(&inputs).unwrap();
        let apk = inputs.join("demo.apk");
        fs::write(&apk, b"PK\x05\x06original").unwrap();
        let settings = Settings::with_root(&temp.path().join("VRSLAM"));
        Self {
            temp,
            apk,
            settings,
        }
    }

    fn work(&self) -> PathBuf {
        self.settings.paths.work_dir.join("demo")
    }

    fn output(&self) -> PathBuf {
        self.settings.paths.output_dir.join("demo")
    }

    fn pipeline(&self, runner: Arc<FakeToolchain>) -> Pipeline {
        Pipeline::new(self.settings.clone(), runner)
    }
}

fn read_entry(archive: &Path, name: &str) -> String {
    let mut zip = ZipArchive::new(File::open(archive).unwrap()).unwrap();
    let mut entry = zip.by_name(name).unwrap();
    let mut out = String::new();
    entry.read_to_string(&mut out).unwrap();
    out
}

fn failure(outcome: &RunOutcome) -> (Stage, FailureKind, Option<i32>) {
    let f = outcome.failure_detail().expect("run should fail");
    (f.stage, f.kind, f.exit_code)
}

#[test]
fn test_end_to_end_success() {
    let fx = Fixture::new();
    let runner = Arc::new(FakeToolchain::new());
    let outcome = fx.pipeline(Arc::clone(&runner)).run(&fx.apk);

    let artifact = outcome.artifact().expect("run should succeed").clone();
    assert_eq!(outcome.exit_code(), ExitCode::Success);
    assert_eq!(artifact.identifier, "com.mrf.acme.demo");
    assert_eq!(artifact.path, fx.output().join("com.mrf.acme.demo.apk"));
    assert_eq!(runner.calls(), vec!["decompile", "recompile", "sign"]);

    let smali = read_entry(&artifact.path, "smali/com/mrf/acme/demo/MainActivity.smali");
    assert!(smali.contains("Lcom/mrf/acme/demo/MainActivity;"));
    assert!(smali.contains("\"com.mrf.acme.demo\""));
    let strings = read_entry(&artifact.path, "res/values/strings.xml");
    assert!(strings.contains("com.mrf.acme.demo.files"));
    let manifest = read_entry(&artifact.path, "AndroidManifest.xml");
    assert!(manifest.contains("package=\"com.mrf.acme.demo\""));

    // Aligned before signing, and the signer is told not to realign.
    assert!(runner.sign_args().contains(&"--skipZipAlign".to_string()));
    assert!(verify_alignment(&artifact.path, &AlignOptions::default())
        .unwrap()
        .is_empty());

    let bytes = fs::read(&artifact.path).unwrap();
    assert_eq!(artifact.size, bytes.len() as u64);
    assert_eq!(artifact.sha256.len(), 64);

    // Intermediates are gone; only the final archive remains.
    assert!(!fx.output().join("demo.apk").exists());
    assert!(!fx.output().join("fixed").exists());
    assert!(!fx.work().join("failed").exists());
    assert!(!fx.apk.with_file_name("com.mrf.acme.demo.apk").exists());

    let summary = RunSummary::from_file(&fx.work().join(RUN_SUMMARY_FILE)).unwrap();
    assert_eq!(summary.status, Status::Success);
    assert_eq!(summary.old_identifier.as_deref(), Some("com.acme.demo"));
    assert_eq!(summary.new_identifier.as_deref(), Some("com.mrf.acme.demo"));
    assert_eq!(summary.artifact_sha256.as_deref(), Some(artifact.sha256.as_str()));
    assert_eq!(summary.stages.len(), 4);
    assert!(summary.stages.iter().all(|s| s.succeeded));
    assert!(!fx.output().join(RUN_SUMMARY_FILE).exists());
}

#[test]
fn test_source_archive_untouched() {
    let fx = Fixture::new();
    let before = fs::read(&fx.apk).unwrap();
    let outcome = fx.pipeline(Arc::new(FakeToolchain::new())).run(&fx.apk);
    assert!(outcome.is_success());
    assert_eq!(fs::read(&fx.apk).unwrap(), before);
}

#[test]
fn test_unpack_failure_leaves_no_output() {
    let fx = Fixture::new();
    let mut runner = FakeToolchain::new();
    runner.decompile = Behavior::Exit(1);
    let runner = Arc::new(runner);
    let outcome = fx.pipeline(Arc::clone(&runner)).run(&fx.apk);

    assert_eq!(failure(&outcome), (Stage::Unpack, FailureKind::ExternalTool, Some(1)));
    assert_eq!(outcome.exit_code(), ExitCode::UnpackFailed);
    assert_eq!(runner.calls(), vec!["decompile"]);
    assert!(!fx.output().exists());

    let summary = RunSummary::from_file(&fx.work().join(RUN_SUMMARY_FILE)).unwrap();
    assert_eq!(summary.failed_stage, Some(Stage::Unpack));
    assert_eq!(summary.exit_code, 10);
}

#[test]
fn test_manifest_without_package() {
    let fx = Fixture::new();
    let mut runner = FakeToolchain::new();
    runner.manifest = MANIFEST_NO_PACKAGE;
    let runner = Arc::new(runner);
    let outcome = fx.pipeline(Arc::clone(&runner)).run(&fx.apk);

    assert_eq!(failure(&outcome), (Stage::Rewrite, FailureKind::ManifestParse, None));
    assert_eq!(outcome.exit_code(), ExitCode::RewriteFailed);
    assert_eq!(runner.calls(), vec!["decompile"]);

    // Tree is left exactly as extracted.
    let source = fx.work().join("source");
    assert_eq!(
        fs::read_to_string(source.join("smali/com/acme/demo/MainActivity.smali")).unwrap(),
        SMALI
    );
    assert_eq!(
        fs::read_to_string(source.join("res/values/strings.xml")).unwrap(),
        STRINGS
    );
    assert!(!source.join("smali/com/mrf").exists());
    assert!(!fx.output().exists());
}

#[test]
fn test_leftovers_removed_before_unpack() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.work().join("source/smali/com/mrf/acme")).unwrap();
    fs::write(fx.work().join("source/stale.txt"), b"old").unwrap();
    fs::create_dir_all(fx.output()).unwrap();
    fs::write(fx.output().join("com.mrf.acme.demo.apk"), b"old build").unwrap();

    let outcome = fx.pipeline(Arc::new(FakeToolchain::new())).run(&fx.apk);
    let artifact = outcome.artifact().expect("run should succeed");

    assert!(!fx.work().join("source/stale.txt").exists());
    assert_ne!(fs::read(&artifact.path).unwrap(), b"old build");
    assert!(fx
        .work()
        .join("source/smali/com/mrf/acme/demo/MainActivity.smali")
        .is_file());
}

#[test]
fn test_recompile_timeout() {
    let fx = Fixture::new();
    let mut runner = FakeToolchain::new();
    runner.recompile = Behavior::Timeout;
    let outcome = fx.pipeline(Arc::new(runner)).run(&fx.apk);

    assert_eq!(failure(&outcome), (Stage::Repack, FailureKind::Timeout, None));
    assert_eq!(outcome.exit_code(), ExitCode::Timeout);
    assert!(!fx.output().exists());
}

#[test]
fn test_busy_when_base_name_in_flight() {
    let fx = Fixture::new();
    let registry = InFlightRegistry::new();
    let _held = registry.try_acquire("demo").unwrap();

    let runner = Arc::new(FakeToolchain::new());
    let outcome = fx
        .pipeline(Arc::clone(&runner))
        .with_registry(Arc::clone(&registry))
        .run(&fx.apk);

    assert_eq!(failure(&outcome).1, FailureKind::Busy);
    assert_eq!(outcome.exit_code(), ExitCode::Busy);
    assert!(runner.calls().is_empty());
    assert!(!fx.work().exists());
    assert!(!fx.output().exists());
}

#[test]
fn test_slot_released_after_run() {
    let fx = Fixture::new();
    let registry = InFlightRegistry::new();
    let pipeline = fx
        .pipeline(Arc::new(FakeToolchain::new()))
        .with_registry(Arc::clone(&registry));

    assert!(pipeline.run(&fx.apk).is_success());
    assert!(!registry.is_in_flight("demo"));
    assert!(pipeline.run(&fx.apk).is_success());
}

#[test]
fn test_cancel_during_repack() {
    let fx = Fixture::new();
    let mut runner = FakeToolchain::new();
    runner.recompile = Behavior::Cancel;
    let runner = Arc::new(runner);
    let pipeline = fx.pipeline(Arc::clone(&runner));
    let outcome = pipeline.run(&fx.apk);

    assert_eq!(failure(&outcome), (Stage::Repack, FailureKind::Cancelled, None));
    assert_eq!(outcome.status(), Status::Cancelled);
    assert_eq!(outcome.exit_code(), ExitCode::Cancelled);
    assert!(pipeline.cancellation().is_cancelled());
    assert_eq!(runner.calls(), vec!["decompile", "recompile"]);
}

#[test]
fn test_cancelled_before_start() {
    let fx = Fixture::new();
    let runner = Arc::new(FakeToolchain::new());
    let pipeline = fx.pipeline(Arc::clone(&runner));
    pipeline.cancellation().cancel();

    let outcome = pipeline.run(&fx.apk);
    assert_eq!(failure(&outcome), (Stage::Unpack, FailureKind::Cancelled, None));
    assert!(runner.calls().is_empty());
}

#[test]
fn test_sign_failure_keeps_intermediate() {
    let fx = Fixture::new();
    let mut runner = FakeToolchain::new();
    runner.sign = Behavior::Exit(2);
    let outcome = fx.pipeline(Arc::new(runner)).run(&fx.apk);

    assert_eq!(failure(&outcome), (Stage::Sign, FailureKind::ExternalTool, Some(2)));
    assert_eq!(outcome.exit_code(), ExitCode::SignFailed);
    assert!(!fx.output().exists());

    let kept = fx.work().join("failed/demo.apk");
    assert!(kept.is_file());
    assert!(verify_alignment(&kept, &AlignOptions::default())
        .unwrap()
        .is_empty());
}

#[test]
fn test_missing_archive() {
    let fx = Fixture::new();
    let runner = Arc::new(FakeToolchain::new());
    let outcome = fx
        .pipeline(Arc::clone(&runner))
        .run(&fx.temp.path().join("missing.apk"));

    assert_eq!(failure(&outcome).1, FailureKind::FileSystem);
    assert!(runner.calls().is_empty());
    assert!(!fx.settings.paths.work_dir.exists());
}

#[test]
fn test_companion_obb_renamed() {
    let fx = Fixture::new();
    let obb = fx.apk.parent().unwrap().join("obb");
    fs::create_dir_all(&obb).unwrap();
    fs::write(obb.join("main.3.com.acme.demo.obb"), b"expansion").unwrap();

    let outcome = fx.pipeline(Arc::new(FakeToolchain::new())).run(&fx.apk);
    let artifact = outcome.artifact().expect("run should succeed");

    let renamed = fx.output().join("obb/main.3.com.mrf.acme.demo.obb");
    assert_eq!(artifact.obb_files, vec![renamed.clone()]);
    assert_eq!(fs::read(renamed).unwrap(), b"expansion");
    assert!(obb.join("main.3.com.acme.demo.obb").is_file());
}

#[test]
fn test_already_rewritten_refused() {
    let fx = Fixture::new();
    let mut runner = FakeToolchain::new();
    runner.manifest = r#"<manifest package="com.mrf.acme.demo"/>"#;
    let outcome = fx.pipeline(Arc::new(runner)).run(&fx.apk);
    assert_eq!(failure(&outcome), (Stage::Rewrite, FailureKind::AlreadyRewritten, None));
}

#[test]
fn test_progress_events() {
    let fx = Fixture::new();
    let (tx, rx) = mpsc::channel();
    let outcome = fx
        .pipeline(Arc::new(FakeToolchain::new()))
        .with_sink(Arc::new(ChannelSink::new(tx)))
        .run(&fx.apk);
    assert!(outcome.is_success());

    let events: Vec<ProgressEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 9);
    let run_id = events[0].run_id().to_string();
    assert!(events.iter().all(|e| e.run_id() == run_id));

    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Stage { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![0, 25, 25, 50, 50, 75, 75, 100]);

    match events.last() {
        Some(ProgressEvent::Finished { outcome: finished, .. }) => assert_eq!(finished, &outcome),
        other => panic!("expected finished event, got {:?}", other),
    }
}

#[test]
fn test_alignment_disabled() {
    let mut fx = Fixture::new();
    fx.settings.align.enabled = false;
    let runner = Arc::new(FakeToolchain::new());
    let outcome = fx.pipeline(Arc::clone(&runner)).run(&fx.apk);
    let artifact = outcome.artifact().expect("run should succeed");
    // The signer's own zipalign step is left on.
    assert!(!runner.sign_args().contains(&"--skipZipAlign".to_string()));
    assert!(!verify_alignment(&artifact.path, &AlignOptions::default())
        .unwrap()
        .is_empty());
}

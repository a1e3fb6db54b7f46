//! Identifier rewrite over realistic decompiled trees.

use std::fs;
use std::path::Path;

use apktwin::rewrite::{
    copy_companion_obb, read_manifest_package, rewrite_tree, RewriteError, RewriteOptions,
};
use tempfile::TempDir;

fn options() -> RewriteOptions {
    RewriteOptions {
        segment: "mrf".to_string(),
        allow_reinsert: false,
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Multi-dex tree for `com.vrgame.title`
fn game_tree(root: &Path) {
    write(
        &root.join("AndroidManifest.xml"),
        "<?xml version='1.0' encoding='utf-8'?>\n\
         <manifest xmlns:android='http://schemas.android.com/apk/res/android'\n\
         \x20   package='com.vrgame.title' platformBuildVersionCode='29'>\n\
         <application android:name='com.vrgame.title.App'/>\n\
         </manifest>\n",
    );
    write(
        &root.join("smali/com/vrgame/title/App.smali"),
        ".class public Lcom/vrgame/title/App;\n\
         .method public onCreate()V\n\
         \x20   const-string v0, \"com.vrgame.title\"\n\
         \x20   invoke-static {}, Lcom/vrgame/title/util/Log;->init()V\n\
         .end method\n",
    );
    write(
        &root.join("smali_classes2/com/vrgame/title/util/Log.smali"),
        ".class public Lcom/vrgame/title/util/Log;\n",
    );
    write(
        &root.join("smali_classes2/com/unity3d/player/UnityPlayer.smali"),
        ".class public Lcom/unity3d/player/UnityPlayer;\n",
    );
    write(
        &root.join("res/xml/file_paths.xml"),
        "<paths><files-path name='com.vrgame.title' path='com/vrgame/title/'/></paths>",
    );
    write(&root.join("assets/config.json"), "{\"package\":\"com.vrgame.title\"}");
}

#[test]
fn test_game_tree_rewritten() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("source");
    game_tree(&tree);

    let report = rewrite_tree(&tree, &options()).unwrap();
    assert_eq!(report.old_identifier.dotted(), "com.vrgame.title");
    assert_eq!(report.new_identifier.dotted(), "com.mrf.vrgame.title");
    assert_eq!(report.relocations.len(), 2);

    assert_eq!(
        read_manifest_package(&tree.join("AndroidManifest.xml"))
            .unwrap()
            .dotted(),
        "com.mrf.vrgame.title"
    );

    let app = fs::read_to_string(tree.join("smali/com/mrf/vrgame/title/App.smali")).unwrap();
    assert!(app.contains(".class public Lcom/mrf/vrgame/title/App;"));
    assert!(app.contains("\"com.mrf.vrgame.title\""));
    assert!(app.contains("Lcom/mrf/vrgame/title/util/Log;"));
    assert!(!tree.join("smali/com/vrgame").exists());

    let log = tree.join("smali_classes2/com/mrf/vrgame/title/util/Log.smali");
    assert!(fs::read_to_string(log).unwrap().contains("Lcom/mrf/vrgame/title/util/Log;"));
    assert!(tree
        .join("smali_classes2/com/unity3d/player/UnityPlayer.smali")
        .is_file());

    // XML gets the dotted form only; the slash form is left alone.
    let paths = fs::read_to_string(tree.join("res/xml/file_paths.xml")).unwrap();
    assert!(paths.contains("name='com.mrf.vrgame.title'"));
    assert!(paths.contains("path='com/vrgame/title/'"));

    // Non-code, non-XML files are untouched.
    assert_eq!(
        fs::read_to_string(tree.join("assets/config.json")).unwrap(),
        "{\"package\":\"com.vrgame.title\"}"
    );
}

#[test]
fn test_second_pass_needs_reinsert() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("source");
    game_tree(&tree);
    rewrite_tree(&tree, &options()).unwrap();

    let err = rewrite_tree(&tree, &options()).unwrap_err();
    assert!(matches!(err, RewriteError::AlreadyRewritten { .. }));
    assert!(tree.join("smali/com/mrf/vrgame/title/App.smali").is_file());

    let again = RewriteOptions {
        allow_reinsert: true,
        ..options()
    };
    let report = rewrite_tree(&tree, &again).unwrap();
    assert_eq!(report.new_identifier.dotted(), "com.mrf.mrf.vrgame.title");
    assert!(tree
        .join("smali/com/mrf/mrf/vrgame/title/App.smali")
        .is_file());
}

#[test]
fn test_custom_segment() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("source");
    game_tree(&tree);

    let report = rewrite_tree(
        &tree,
        &RewriteOptions {
            segment: "twin".to_string(),
            allow_reinsert: false,
        },
    )
    .unwrap();
    assert_eq!(report.new_identifier.dotted(), "com.twin.vrgame.title");
    assert!(tree.join("smali/com/twin/vrgame/title/App.smali").is_file());
}

#[test]
fn test_obb_follows_rewrite() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("work/source");
    let archive_dir = temp.path().join("downloads");
    let output = temp.path().join("output/title");
    game_tree(&tree);
    write(&archive_dir.join("obb/main.12.com.vrgame.title.obb"), "main");
    write(&archive_dir.join("obb/patch.12.com.vrgame.title.obb"), "patch");

    let report = rewrite_tree(&tree, &options()).unwrap();
    let mut copied = copy_companion_obb(
        &archive_dir,
        &output,
        &report.old_identifier,
        &report.new_identifier,
    )
    .unwrap();
    copied.sort();

    assert_eq!(
        copied,
        vec![
            output.join("obb/main.12.com.mrf.vrgame.title.obb"),
            output.join("obb/patch.12.com.mrf.vrgame.title.obb"),
        ]
    );
    assert_eq!(fs::read_to_string(&copied[1]).unwrap(), "patch");
    assert!(archive_dir.join("obb/main.12.com.vrgame.title.obb").is_file());
}

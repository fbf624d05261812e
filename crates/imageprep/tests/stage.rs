mod common;

use std::sync::Arc;

use common::{RecordingHost, RecordingSink};
use imageprep::modules::util;
use imageprep::pipeline::{RunOptions, run_build};

fn stage_doc(root: &std::path::Path, extra: &str) -> imageprep::config::ConfigDoc {
    common::doc(
        root,
        &format!(
            r#"
[stage]
image_root = "img"
source_root = "src"
{extra}
"#
        ),
    )
}

#[test]
fn default_layout_stages_the_image_tree() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let src = root.join("src");
    common::write_file(&src.join("scripts/build/install-git.sh"), b"#!/bin/bash\n", 0o644);
    common::write_file(&src.join("scripts/build/README.md"), b"docs\n", 0o644);
    common::write_file(&src.join("toolsets/toolset-ubuntu24.json"), b"{}\n", 0o644);
    common::write_file(&src.join("assets/post-gen/cleanup-logs.sh"), b"#!/bin/sh\n", 0o644);

    let doc = stage_doc(root, "");
    let sink = Arc::new(RecordingSink::default());
    let state = run_build(
        &doc,
        &RunOptions::default(),
        Arc::new(RecordingHost::default()),
        sink.clone(),
    )
    .expect("stage");

    let img = root.join("img");
    assert!(img.join("installers/install-git.sh").is_file());
    assert!(!img.join("installers/README.md").exists());
    assert!(img.join("installers/toolset.json").is_file());
    assert!(img.join("post-generation/cleanup-logs.sh").is_file());
    assert!(util::is_executable(&img.join("installers/toolset.json")));
    assert_eq!(state.staged_files.len(), 3);

    // No helpers and no patches in the source tree: logged, not fatal.
    let logs = sink.logs();
    assert!(
        logs.iter().any(|l| l.ends_with("scripts/helpers/* not found")),
        "logs: {logs:?}"
    );
    assert!(logs.iter().any(|l| l.ends_with("patches/*.patch not found")));

    let manifest = root.join("out/pwsh-s390x/imageprep/modules/stage/manifest.json");
    let raw = std::fs::read_to_string(manifest).expect("manifest");
    assert!(raw.contains("install-git.sh"), "unexpected manifest: {raw}");
}

#[test]
fn zero_pattern_matches_still_succeed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    std::fs::create_dir_all(root.join("src/scripts")).expect("mkdir");

    let doc = stage_doc(
        root,
        r#"
[[stage.copy]]
src = "scripts"
dst = "installers"
pattern = "*.ps1"
"#,
    );
    let sink = Arc::new(RecordingSink::default());
    let state = run_build(
        &doc,
        &RunOptions::default(),
        Arc::new(RecordingHost::default()),
        sink.clone(),
    )
    .expect("stage");

    assert!(state.staged_files.is_empty());
    assert!(sink.errors().is_empty());
    assert!(sink.logs().iter().any(|l| l.ends_with("*.ps1 not found")));
}

#[test]
fn missing_required_file_fails() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    std::fs::create_dir_all(root.join("src")).expect("mkdir");

    let doc = stage_doc(
        root,
        r#"
[[stage.copy]]
src = "toolsets/toolset-{image_os}.json"
dst = "installers/toolset.json"
kind = "file"
"#,
    );
    let err = run_build(
        &doc,
        &RunOptions::default(),
        Arc::new(RecordingHost::default()),
        Arc::new(RecordingSink::default()),
    )
    .unwrap_err()
    .to_string();
    assert!(err.contains("toolset-ubuntu24.json"), "unexpected err: {err}");
}

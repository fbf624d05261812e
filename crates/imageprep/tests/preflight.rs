mod common;

use std::fs;
use std::sync::Arc;

use common::{Call, RecordingHost, RecordingSink};
use imageprep::pipeline::{RunOptions, run_build};

#[test]
fn missing_native_patch_fails_before_any_build_command() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let ctx_dir = common::write_context(root);
    let native_patch = ctx_dir.join("patches/powershell-native-v7.4.6.patch");
    fs::remove_file(&native_patch).expect("remove patch");

    let doc = common::doc(root, "[pwsh]\nwork_dir = \"work\"\n");
    let host = Arc::new(RecordingHost::default());
    let sink = Arc::new(RecordingSink::default());

    let err = run_build(&doc, &RunOptions::default(), host.clone(), sink.clone())
        .unwrap_err()
        .to_string();
    assert!(err.contains("preflight.verify"), "unexpected err: {err}");
    assert!(err.contains("1 required file(s) missing"), "unexpected err: {err}");

    assert_eq!(
        sink.errors(),
        vec![format!("missing required file: {}", native_patch.display())]
    );
    let calls = host.calls();
    assert!(
        !calls
            .iter()
            .any(|c| c.is_build() || matches!(c, Call::Clone { .. } | Call::Install(_))),
        "unexpected host calls: {calls:?}"
    );
    assert!(!sink.started().iter().any(|id| id.starts_with("pwsh.")));
}

#[test]
fn complete_context_passes_verification() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    common::write_context(root);

    let doc = common::doc(root, "[preflight]\n");
    let host = Arc::new(RecordingHost::default());
    let sink = Arc::new(RecordingSink::default());
    let opts = RunOptions {
        only: Some(vec!["preflight".into()]),
        ..Default::default()
    };

    run_build(&doc, &opts, host.clone(), sink.clone()).expect("verify");
    assert!(sink.errors().is_empty());
    assert_eq!(sink.started(), vec!["core.init", "preflight.verify"]);
    assert!(host.calls().is_empty());
}

#[test]
fn every_missing_file_gets_its_own_error_line() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    fs::create_dir_all(root.join("context")).expect("mkdir");

    let doc = common::doc(root, "[preflight]\n");
    let host = Arc::new(RecordingHost::default());
    let sink = Arc::new(RecordingSink::default());

    let err = run_build(&doc, &RunOptions::default(), host, sink.clone())
        .unwrap_err()
        .to_string();
    assert!(err.contains("5 required file(s) missing"), "unexpected err: {err}");
    let errors = sink.errors();
    assert_eq!(errors.len(), 5);
    assert!(errors.iter().all(|l| l.starts_with("missing required file: ")));
}

#[test]
fn missing_patch_stops_the_sdk_install_when_packages_are_disabled() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let ctx_dir = common::write_context(root);
    fs::remove_file(ctx_dir.join("patches/powershell-native-v7.4.6.patch")).expect("remove patch");

    let doc = common::doc(
        root,
        "[packages]\nenabled = false\n[dotnet]\ninstall_dir = \"dotnet\"\n[pwsh]\nwork_dir = \"work\"\n",
    );
    let host = Arc::new(RecordingHost::default());
    let sink = Arc::new(RecordingSink::default());

    let err = run_build(&doc, &RunOptions::default(), host.clone(), sink.clone())
        .unwrap_err()
        .to_string();
    assert!(err.contains("preflight.verify"), "unexpected err: {err}");
    assert!(!sink.started().iter().any(|id| id == "dotnet.install"));
    assert!(!root.join("dotnet/dotnet").exists());
    assert_eq!(host.calls(), Vec::<Call>::new());
}

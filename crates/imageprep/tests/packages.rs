mod common;

use std::sync::Arc;

use common::{Call, RecordingHost, RecordingSink};
use imageprep::executor::ExecCtx;
use imageprep::pipeline::{RunOptions, run_build};
use imageprep::state::{Installed, PackageLedger};

fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn already_installed_packages_are_skipped_and_not_recorded() {
    let host = Arc::new(RecordingHost::with_installed(&["git", "patch"]));
    let ctx = ExecCtx::new(false, Arc::new(RecordingSink::default()), host.clone());

    let mut ledger = PackageLedger::default();
    let out = ledger
        .ensure_all(
            host.as_ref(),
            &ctx,
            &names(&["cmake", "git", "libicu-dev", "cmake", "patch"]),
            true,
        )
        .expect("ensure");

    assert_eq!(
        out,
        vec![
            ("cmake".to_string(), Installed::Now),
            ("git".to_string(), Installed::Already),
            ("libicu-dev".to_string(), Installed::Now),
            ("patch".to_string(), Installed::Already),
        ]
    );
    assert_eq!(ledger.names(), &["cmake", "libicu-dev"]);

    let calls = host.calls();
    let installs: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Install(n) => Some(n.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(installs, vec!["cmake", "libicu-dev"]);
    assert_eq!(calls.iter().filter(|c| **c == Call::Refresh).count(), 1);
    let first_install = calls
        .iter()
        .position(|c| matches!(c, Call::Install(_)))
        .expect("an install");
    let refresh = calls.iter().position(|c| *c == Call::Refresh).expect("refresh");
    assert!(refresh < first_install);
}

#[test]
fn dependency_pulled_in_by_an_earlier_install_is_not_recorded() {
    let host = Arc::new(RecordingHost {
        pulls_in: vec![("build-essential".into(), "patch".into())],
        ..RecordingHost::default()
    });
    let ctx = ExecCtx::new(false, Arc::new(RecordingSink::default()), host.clone());

    let mut ledger = PackageLedger::default();
    let out = ledger
        .ensure_all(host.as_ref(), &ctx, &names(&["build-essential", "patch"]), true)
        .expect("ensure");

    assert_eq!(
        out,
        vec![
            ("build-essential".to_string(), Installed::Now),
            ("patch".to_string(), Installed::Already),
        ]
    );
    assert_eq!(ledger.names(), &["build-essential"]);

    let calls = host.calls();
    let installs: Vec<_> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Install(n) => Some(n.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(installs, vec!["build-essential"]);
    assert_eq!(calls.iter().filter(|c| **c == Call::Refresh).count(), 1);
}

#[test]
fn nothing_missing_means_no_index_refresh() {
    let host = Arc::new(RecordingHost::with_installed(&["git"]));
    let ctx = ExecCtx::new(false, Arc::new(RecordingSink::default()), host.clone());

    let mut ledger = PackageLedger::default();
    ledger
        .ensure_all(host.as_ref(), &ctx, &names(&["git"]), true)
        .expect("ensure");
    assert!(ledger.is_empty());
    assert!(!host.calls().contains(&Call::Refresh));
}

#[test]
fn single_ensure_installs_once() {
    let host = Arc::new(RecordingHost::default());
    let ctx = ExecCtx::new(false, Arc::new(RecordingSink::default()), host.clone());

    let mut ledger = PackageLedger::default();
    assert_eq!(
        ledger.ensure(host.as_ref(), &ctx, "cmake").expect("first"),
        Installed::Now
    );
    assert_eq!(
        ledger.ensure(host.as_ref(), &ctx, "cmake").expect("second"),
        Installed::Already
    );
    assert!(ledger.ensure(host.as_ref(), &ctx, "  ").is_err());
    assert_eq!(ledger.names(), &["cmake"]);
}

#[test]
fn cleanup_purges_each_recorded_package_then_runs_generic_cleanup() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let lists = root.join("apt-lists");
    common::write_file(&lists.join("archive_InRelease"), b"x", 0o644);

    let doc = common::doc(
        root,
        r#"
[packages]
install = ["cmake", "git", "libicu-dev"]

[cleanup]
user_caches = false
apt_lists = "apt-lists"
"#,
    );
    let host = Arc::new(RecordingHost::with_installed(&["git"]));
    let sink = Arc::new(RecordingSink::default());

    let state = run_build(&doc, &RunOptions::default(), host.clone(), sink.clone()).expect("run");
    assert_eq!(state.packages.names(), &["cmake", "libicu-dev"]);
    assert_eq!(sink.started(), vec!["core.init", "packages.install", "cleanup.run"]);

    let tail: Vec<Call> = host
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Remove(_) | Call::Run { .. }))
        .collect();
    assert_eq!(
        tail,
        vec![
            Call::Remove("cmake".into()),
            Call::Remove("libicu-dev".into()),
            Call::Run {
                program: "apt-get".into(),
                args: names(&["autoremove", "-y"]),
            },
            Call::Run {
                program: "apt-get".into(),
                args: names(&["clean"]),
            },
        ]
    );
    assert!(lists.is_dir());
    assert_eq!(std::fs::read_dir(&lists).expect("lists").count(), 0);
}

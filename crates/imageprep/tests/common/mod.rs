#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use imageprep::Result;
use imageprep::config::ConfigDoc;
use imageprep::executor::{ExecCtx, ExecEvent, ExecSink};
use imageprep::host::{Host, Invocation, Probe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Clone { url: String, tag: String, dest: PathBuf },
    Patch { repo: PathBuf, patch: PathBuf },
    Build { program: String, args: Vec<String>, cwd: Option<PathBuf> },
    Query(String),
    Refresh,
    Install(String),
    Remove(String),
    InstallDeb(PathBuf),
    Run { program: String, args: Vec<String> },
    Capture { program: String, args: Vec<String> },
}

impl Call {
    pub fn is_build(&self) -> bool {
        matches!(self, Call::Build { .. })
    }
}

/// Records every host call and fakes the artifacts real tools would leave behind.
#[derive(Default)]
pub struct RecordingHost {
    pub calls: Mutex<Vec<Call>>,
    pub installed: Mutex<BTreeSet<String>>,
    /// File name the packaging script "produces" in the PowerShell tree.
    pub deb_name: Option<String>,
    /// Output of `pwsh --version`.
    pub pwsh_version_output: String,
    /// Runner tarball name `dev.sh package` "produces" under `_package`.
    pub runner_package: Option<String>,
    /// Programs whose builds fail.
    pub failing_programs: Vec<String>,
    /// `(a, b)`: installing `a` also installs `b` as a dependency.
    pub pulls_in: Vec<(String, String)>,
}

impl RecordingHost {
    pub fn with_installed(names: &[&str]) -> Self {
        let host = Self::default();
        if let Ok(mut g) = host.installed.lock() {
            g.extend(names.iter().map(|s| s.to_string()));
        }
        host
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn record(&self, call: Call) {
        if let Ok(mut g) = self.calls.lock() {
            g.push(call);
        }
    }

    fn fake_build_outputs(&self, inv: &Invocation) {
        let Some(cwd) = inv.cwd.as_deref() else {
            return;
        };
        let program = Path::new(&inv.program)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        match program {
            "make" => {
                let lib = cwd.join("../powershell-unix/libpsl-native.so");
                write_file(&lib, b"\x7fELF", 0o755);
            }
            "dotnet" if inv.args.first().is_some_and(|a| a == "publish") => {
                if let Some(i) = inv.args.iter().position(|a| a == "--output") {
                    let out = PathBuf::from(&inv.args[i + 1]);
                    write_file(&out.join("pwsh"), b"#!/bin/sh\n", 0o755);
                }
            }
            "pwsh" => {
                if let Some(name) = &self.deb_name {
                    write_file(&cwd.join(name), b"!<arch>\n", 0o644);
                }
            }
            "dev.sh" if inv.args.first().is_some_and(|a| a == "package") => {
                if let Some(name) = &self.runner_package {
                    let path = cwd.join("../_package").join(name);
                    write_tar_gz(&path, &[("bin/Runner.Listener", &b"#!/bin/sh\n"[..])]);
                }
            }
            _ => {}
        }
    }
}

impl Host for RecordingHost {
    fn run(&self, _ctx: &ExecCtx, inv: &Invocation) -> Result<()> {
        self.record(Call::Run {
            program: inv.program.clone(),
            args: inv.args.clone(),
        });
        Ok(())
    }

    fn capture(&self, _ctx: &ExecCtx, inv: &Invocation) -> Result<String> {
        self.record(Call::Capture {
            program: inv.program.clone(),
            args: inv.args.clone(),
        });
        if inv.program == "pwsh" {
            return Ok(self.pwsh_version_output.clone());
        }
        Ok(String::new())
    }

    fn probe(&self, _ctx: &ExecCtx, _inv: &Invocation) -> Result<Probe> {
        Ok(Probe::default())
    }

    fn git_clone(
        &self,
        _ctx: &ExecCtx,
        url: &str,
        tag: &str,
        dest: &Path,
        _recurse_submodules: bool,
    ) -> Result<()> {
        self.record(Call::Clone {
            url: url.into(),
            tag: tag.into(),
            dest: dest.to_path_buf(),
        });
        fs::create_dir_all(dest.join("src"))?;
        if dest.ends_with("PowerShell-Native") {
            fs::create_dir_all(dest.join("src/libpsl-native"))?;
        }
        Ok(())
    }

    fn apply_patch(&self, _ctx: &ExecCtx, repo: &Path, patch: &Path) -> Result<()> {
        self.record(Call::Patch {
            repo: repo.to_path_buf(),
            patch: patch.to_path_buf(),
        });
        if !patch.is_file() {
            return Err(imageprep::Error::msg(format!(
                "patch {} does not exist",
                patch.display()
            )));
        }
        Ok(())
    }

    fn build(&self, _ctx: &ExecCtx, inv: &Invocation) -> Result<()> {
        self.record(Call::Build {
            program: inv.program.clone(),
            args: inv.args.clone(),
            cwd: inv.cwd.clone(),
        });
        if self.failing_programs.iter().any(|p| p == &inv.program) {
            return Err(imageprep::Error::msg(format!("{} exited with 1", inv.program)));
        }
        self.fake_build_outputs(inv);
        Ok(())
    }

    fn package_installed(&self, _ctx: &ExecCtx, name: &str) -> Result<bool> {
        self.record(Call::Query(name.into()));
        Ok(self
            .installed
            .lock()
            .map(|g| g.contains(name))
            .unwrap_or(false))
    }

    fn refresh_packages(&self, _ctx: &ExecCtx) -> Result<()> {
        self.record(Call::Refresh);
        Ok(())
    }

    fn install_package(&self, _ctx: &ExecCtx, name: &str) -> Result<()> {
        self.record(Call::Install(name.into()));
        if let Ok(mut g) = self.installed.lock() {
            g.insert(name.into());
            for (a, b) in &self.pulls_in {
                if a == name {
                    g.insert(b.clone());
                }
            }
        }
        Ok(())
    }

    fn remove_package(&self, _ctx: &ExecCtx, name: &str) -> Result<()> {
        self.record(Call::Remove(name.into()));
        if let Ok(mut g) = self.installed.lock() {
            g.remove(name);
        }
        Ok(())
    }

    fn install_deb(&self, _ctx: &ExecCtx, path: &Path) -> Result<()> {
        self.record(Call::InstallDeb(path.to_path_buf()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ExecEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskError { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskLog { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TaskStarted { id } => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl ExecSink for RecordingSink {
    fn emit(&self, ev: ExecEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(ev);
        }
    }
}

pub fn write_file(path: &Path, data: &[u8], mode: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, data).expect("write");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("chmod");
    }
}

pub fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    let f = fs::File::create(path).expect("create");
    let enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
    let mut b = tar::Builder::new(enc);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        b.append_data(&mut header, name, *data).expect("append");
    }
    b.into_inner().expect("tar").finish().expect("gz");
}

/// Context tree for s390x / v7.4.6 / .NET 8.0.404 with every required input.
pub fn write_context(root: &Path) -> PathBuf {
    let dir = root.join("context/s390x/v7.4.6");
    let patches = dir.join("patches");
    write_file(&patches.join("powershell-native-v7.4.6.patch"), b"--- a\n+++ b\n", 0o644);
    write_file(&patches.join("powershell-v7.4.6.patch"), b"--- a\n+++ b\n", 0o644);
    write_tar_gz(
        &patches.join("dotnet-sdk-8.0.404-linux-s390x.tar.gz"),
        &[("dotnet", &b"#!/bin/sh\n"[..])],
    );
    write_file(&dir.join("helpers/install.sh"), b"#!/bin/sh\n", 0o755);
    write_file(&dir.join("helpers/etc-environment.sh"), b"#!/bin/sh\n", 0o755);
    dir
}

/// Build definition rooted at `root`; `body` is appended after `[vars]` and `[workspace]`.
pub fn doc(root: &Path, body: &str) -> ConfigDoc {
    let raw = format!(
        r#"
[vars]
arch = "s390x"
pwsh_version = "v7.4.6"
dotnet_version = "8.0.404"
context_root = "context"

[workspace]
root_dir = "{}"

{body}
"#,
        root.display()
    );
    ConfigDoc::from_toml_str(root.join("pwsh-s390x.toml"), &raw).expect("parse")
}

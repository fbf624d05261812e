//! PowerShell from source: clone and patch both upstream trees, build the
//! native library, publish the managed app, package a `.deb`, install it.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::{Module, util};
use crate::planner::{Plan, Task};

pub mod build;
pub mod package;
pub mod source;

pub const DEFAULT_WORK_DIR: &str = "/tmp/powershell-build";
pub const DEFAULT_DEB_PATH: &str = "/tmp/powershell.deb";

fn default_true() -> bool {
    true
}

fn default_work_dir() -> String {
    DEFAULT_WORK_DIR.into()
}

fn default_repo() -> String {
    "https://github.com/PowerShell/PowerShell.git".into()
}

fn default_native_repo() -> String {
    "https://github.com/PowerShell/PowerShell-Native.git".into()
}

fn default_deb_path() -> String {
    DEFAULT_DEB_PATH.into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// Sibling trees; patches are staged under `<work>/patches` before cloning.
    #[default]
    Flat,
    /// Native tree inside `PowerShell/src`; patches are copied into each repo.
    Nested,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PwshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub layout: Layout,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_native_repo")]
    pub native_repo: String,
    /// Tag of the native repository; defaults to `pwsh_version`.
    pub native_tag: Option<String>,
    pub recurse_submodules: bool,
    /// Run the native unit tests; a failing run is logged and tolerated.
    pub native_tests: bool,
    /// Parallel make jobs (0 = CPU count).
    pub jobs: usize,
    #[serde(default = "default_deb_path")]
    pub deb_path: String,
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for PwshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            layout: Layout::Flat,
            work_dir: default_work_dir(),
            repo: default_repo(),
            native_repo: default_native_repo(),
            native_tag: None,
            recurse_submodules: false,
            native_tests: false,
            jobs: 0,
            deb_path: default_deb_path(),
            verify: true,
        }
    }
}

impl PwshConfig {
    pub fn jobs(&self) -> usize {
        if self.jobs == 0 {
            num_cpus::get().max(1)
        } else {
            self.jobs
        }
    }
}

pub fn load_config(doc: &ConfigDoc) -> Result<PwshConfig> {
    Ok(doc.deserialize_path("pwsh")?.unwrap_or_default())
}

/// Where the two trees and their patches live for a given layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    pub kind: Layout,
    pub work: PathBuf,
    pub pwsh_tree: PathBuf,
    pub native_tree: PathBuf,
}

impl WorkLayout {
    pub fn new(kind: Layout, work: &Path) -> Self {
        let pwsh_tree = work.join("PowerShell");
        let native_tree = match kind {
            Layout::Flat => work.join("PowerShell-Native"),
            Layout::Nested => pwsh_tree.join("src").join("PowerShell-Native"),
        };
        Self {
            kind,
            work: work.to_path_buf(),
            pwsh_tree,
            native_tree,
        }
    }

    /// Directory a patch is applied from.
    pub fn patch_dir_for(&self, repo: &Path) -> PathBuf {
        match self.kind {
            Layout::Flat => self.work.join("patches"),
            Layout::Nested => repo.to_path_buf(),
        }
    }

    pub fn native_build_dir(&self) -> PathBuf {
        self.native_tree.join("src").join("libpsl-native")
    }

    /// Where the native build writes the library.
    pub fn declared_native_lib(&self) -> PathBuf {
        self.native_tree
            .join("src")
            .join("powershell-unix")
            .join("libpsl-native.so")
    }

    pub fn pwsh_unix_dir(&self) -> PathBuf {
        self.pwsh_tree.join("src").join("powershell-unix")
    }

    pub fn publish_dir(&self) -> PathBuf {
        self.pwsh_tree.join("publish")
    }
}

pub fn work_layout(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &PwshConfig) -> Result<WorkLayout> {
    let work = util::resolve_path(doc, ctx, &cfg.work_dir)?;
    Ok(WorkLayout::new(cfg.layout, &work))
}

/// `powershell_<semver>-1.deb_<deb_arch>.deb`
pub fn deb_file_name(vars: &crate::config::ProvisionVars) -> String {
    format!(
        "powershell_{}-1.deb_{}.deb",
        vars.pwsh_semver(),
        vars.arch.deb_arch()
    )
}

pub struct PwshModule;

const TASKS: &[(&str, &str, &str, &[&str], &str)] = &[
    (
        "pwsh.source",
        "Clone and patch sources",
        "source",
        &["pwsh:verified", "packages:installed?"],
        "pwsh:source",
    ),
    (
        "pwsh.native",
        "Build native library",
        "build",
        &["pwsh:source"],
        "pwsh:native",
    ),
    (
        "pwsh.publish",
        "Publish managed app",
        "build",
        &["pwsh:native", "dotnet:installed?"],
        "pwsh:publish",
    ),
    (
        "pwsh.package",
        "Build .deb package",
        "package",
        &["pwsh:publish"],
        "pwsh:package",
    ),
    (
        "pwsh.install",
        "Install and verify package",
        "install",
        &["pwsh:package"],
        "pwsh:installed",
    ),
];

impl Module for PwshModule {
    fn id(&self) -> &'static str {
        "pwsh"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table(self.id())
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg = load_config(doc)?;
        if !cfg.enabled {
            return Ok(());
        }
        for (key, v) in [
            ("work_dir", &cfg.work_dir),
            ("repo", &cfg.repo),
            ("native_repo", &cfg.native_repo),
            ("deb_path", &cfg.deb_path),
        ] {
            if v.trim().is_empty() {
                return Err(Error::msg(format!("pwsh.{key} is empty")));
            }
        }

        for (id, label, phase, after, provides) in TASKS {
            plan.add(Task {
                id: (*id).into(),
                label: (*label).into(),
                module: self.id().into(),
                phase: (*phase).into(),
                after: after.iter().map(|s| s.to_string()).collect(),
                provides: vec![(*provides).into()],
            })?;
        }
        Ok(())
    }
}

impl ModuleExec for PwshModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add("pwsh.source", source::exec)?;
        reg.add("pwsh.native", build::exec_native)?;
        reg.add("pwsh.publish", build::exec_publish)?;
        reg.add("pwsh.package", package::exec_package)?;
        reg.add("pwsh.install", package::exec_install)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_layout_keeps_trees_side_by_side() {
        let l = WorkLayout::new(Layout::Flat, Path::new("/tmp/powershell-build"));
        assert_eq!(l.native_tree, PathBuf::from("/tmp/powershell-build/PowerShell-Native"));
        assert_eq!(
            l.patch_dir_for(&l.native_tree),
            PathBuf::from("/tmp/powershell-build/patches")
        );
        assert_eq!(
            l.declared_native_lib(),
            PathBuf::from("/tmp/powershell-build/PowerShell-Native/src/powershell-unix/libpsl-native.so")
        );
    }

    #[test]
    fn nested_layout_puts_native_inside_powershell() {
        let l = WorkLayout::new(Layout::Nested, Path::new("/w"));
        assert_eq!(l.native_tree, PathBuf::from("/w/PowerShell/src/PowerShell-Native"));
        assert_eq!(l.patch_dir_for(&l.pwsh_tree), PathBuf::from("/w/PowerShell"));
        assert_eq!(l.native_build_dir(), PathBuf::from("/w/PowerShell/src/PowerShell-Native/src/libpsl-native"));
    }

    #[test]
    fn layout_parses_from_config() {
        let doc = ConfigDoc::from_toml_str("<mem>", "[pwsh]\nlayout = \"nested\"\njobs = 3\n")
            .expect("parse");
        let cfg = load_config(&doc).expect("cfg");
        assert_eq!(cfg.layout, Layout::Nested);
        assert_eq!(cfg.jobs(), 3);
        assert_eq!(cfg.deb_path, DEFAULT_DEB_PATH);
    }
}

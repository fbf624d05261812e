//! Self-hosted CI runner agent built from a patched source checkout.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{ConfigDoc, ProvisionVars};
use crate::config::vars::strip_v;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::host::Invocation;
use crate::modules::{Module, dotnet, util};
use crate::planner::{Plan, Task};

fn default_true() -> bool {
    true
}

fn default_repo() -> String {
    "https://github.com/actions/runner".into()
}

fn default_tag() -> String {
    "v2.321.0".into()
}

fn default_work_dir() -> String {
    "/tmp/runner-build".into()
}

fn default_install_dir() -> String {
    "/opt/runner".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Patch path template; `{tag}` expands to the runner tag.
    pub patch: Option<String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_install_dir")]
    pub install_dir: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repo: default_repo(),
            tag: default_tag(),
            patch: None,
            work_dir: default_work_dir(),
            install_dir: default_install_dir(),
        }
    }
}

impl RunnerConfig {
    pub fn version(&self) -> &str {
        strip_v(&self.tag)
    }

    /// `actions-runner-<rid>-<version>.tar.gz`
    pub fn package_name(&self, vars: &ProvisionVars) -> String {
        format!(
            "actions-runner-{}-{}.tar.gz",
            vars.arch.dotnet_rid(),
            self.version()
        )
    }
}

pub fn load_config(doc: &ConfigDoc) -> Result<RunnerConfig> {
    Ok(doc.deserialize_path("runner")?.unwrap_or_default())
}

fn patch_path(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &RunnerConfig) -> Result<PathBuf> {
    match cfg.patch.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => util::resolve_path(doc, ctx, &raw.replace("{tag}", &cfg.tag)),
        None => Ok(util::context_dirs(doc, ctx)?
            .patches
            .join(format!("runner-{}.patch", cfg.tag))),
    }
}

pub struct RunnerModule;

impl Module for RunnerModule {
    fn id(&self) -> &'static str {
        "runner"
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
            ("repo", &cfg.repo),
            ("tag", &cfg.tag),
            ("work_dir", &cfg.work_dir),
            ("install_dir", &cfg.install_dir),
        ] {
            if v.trim().is_empty() {
                return Err(Error::msg(format!("runner.{key} is empty")));
            }
        }

        plan.add(Task {
            id: "runner.source".into(),
            label: "Clone and patch runner".into(),
            module: self.id().into(),
            phase: "source".into(),
            after: vec!["core.init".into(), "packages:installed?".into()],
            provides: vec!["runner:source".into()],
        })?;
        plan.add(Task {
            id: "runner.build".into(),
            label: "Build runner package".into(),
            module: self.id().into(),
            phase: "build".into(),
            after: vec!["runner:source".into(), "dotnet:installed?".into()],
            provides: vec!["runner:build".into()],
        })?;
        plan.add(Task {
            id: "runner.install".into(),
            label: "Install runner".into(),
            module: self.id().into(),
            phase: "install".into(),
            after: vec!["runner:build".into()],
            provides: vec!["runner:installed".into()],
        })
    }
}

impl ModuleExec for RunnerModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add("runner.source", exec_source)?;
        reg.add("runner.build", exec_build)?;
        reg.add("runner.install", exec_install)?;
        Ok(())
    }
}

fn exec_source(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("runner.source");
    let cfg = load_config(doc)?;
    let work = util::resolve_path(doc, ctx, &cfg.work_dir)?;
    let patch = patch_path(doc, ctx, &cfg)?;
    if !patch.is_file() {
        ctx.error(&format!("missing required file: {}", patch.display()));
        return Err(Error::msg(format!(
            "runner patch not found: {}",
            patch.display()
        )));
    }
    ctx.update_state(|s| s.register_temp_dir(&work));

    if util::remove_path_if_exists(&work)? {
        ctx.log(&format!("removed stale {}", work.display()));
    }
    let host = ctx.host();
    host.git_clone(ctx, &cfg.repo, &cfg.tag, &work, false)?;
    host.apply_patch(ctx, &work, &patch)?;
    ctx.log(&format!(
        "{} at {} patched with {}",
        work.display(),
        cfg.tag,
        util::file_name_str(&patch)
    ));
    Ok(())
}

fn exec_build(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("runner.build");
    let cfg = load_config(doc)?;
    let vars = ctx.vars()?;
    let work = util::resolve_path(doc, ctx, &cfg.work_dir)?;
    let src = work.join("src");
    let rid = vars.arch.dotnet_rid();

    let mut base = Invocation::new("./dev.sh").cwd(&src);
    if let Some(root) = ctx.state().dotnet_root {
        let dn = dotnet::dotnet_invocation(&root);
        base.env = dn.env;
    }
    let host = ctx.host();
    for step in ["layout", "package"] {
        let inv = base.clone().args([step, "Release", rid]);
        host.build(ctx, &inv)
            .map_err(|e| e.context(format!("runner {step} failed")))?;
    }
    Ok(())
}

/// Declared `_package/<name>` first, then any file of that name in the tree.
pub fn locate_package(work: &Path, name: &str) -> Option<PathBuf> {
    let declared = work.join("_package").join(name);
    if declared.is_file() {
        return Some(declared);
    }
    util::find_file(work, |p| util::file_name_str(p) == name)
}

fn exec_install(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("runner.install");
    let cfg = load_config(doc)?;
    let vars = ctx.vars()?;
    let work = util::resolve_path(doc, ctx, &cfg.work_dir)?;
    let install_dir = util::resolve_path(doc, ctx, &cfg.install_dir)?;

    let name = cfg.package_name(&vars);
    let tarball = locate_package(&work, &name).ok_or_else(|| {
        Error::msg(format!("runner package {name} not found under {}", work.display()))
    })?;
    ctx.log(&format!(
        "extracting {} -> {}",
        tarball.display(),
        install_dir.display()
    ));
    util::extract_tar_gz(&tarball, &install_dir)?;
    ctx.update_state(|s| s.runner_dir = Some(install_dir.clone()));

    let manifest = serde_json::json!({
        "repo": cfg.repo,
        "tag": cfg.tag,
        "package": name,
        "sha256": util::sha256_file_hex(&tarball)?,
        "install_dir": install_dir.display().to_string(),
    });
    let dir = util::module_dir(doc, ctx, "runner")?;
    util::write_json_pretty(&dir.join("install.json"), &manifest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VarOverrides;

    #[test]
    fn package_name_uses_rid_and_bare_version() {
        let doc = ConfigDoc::from_toml_str("<mem>", "[vars]\narch = \"s390x\"\n[runner]\n")
            .expect("parse");
        let vars = ProvisionVars::resolve(&doc, &VarOverrides::default(), |_| None).expect("vars");
        let cfg = load_config(&doc).expect("cfg");
        assert_eq!(
            cfg.package_name(&vars),
            "actions-runner-linux-s390x-2.321.0.tar.gz"
        );
    }

    #[test]
    fn package_lookup_prefers_the_declared_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path();
        let name = "actions-runner-linux-s390x-2.321.0.tar.gz";
        std::fs::create_dir_all(work.join("_layout")).expect("mkdir");
        std::fs::write(work.join("_layout").join(name), b"x").expect("write");
        assert_eq!(locate_package(work, name), Some(work.join("_layout").join(name)));

        std::fs::create_dir_all(work.join("_package")).expect("mkdir");
        std::fs::write(work.join("_package").join(name), b"x").expect("write");
        assert_eq!(locate_package(work, name), Some(work.join("_package").join(name)));
        assert!(locate_package(work, "other.tar.gz").is_none());
    }
}

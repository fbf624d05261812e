use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::host::invocations;
use crate::modules::{Module, dotnet, pwsh, runner, util};
use crate::planner::{CLEANUP_PHASE, Plan, Task};

const TASK_ID: &str = "cleanup.run";

fn default_true() -> bool {
    true
}

fn default_apt_lists() -> String {
    "/var/lib/apt/lists".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub extra_dirs: Vec<String>,
    /// Remove the per-user .NET and NuGet caches under `$HOME`.
    #[serde(default = "default_true")]
    pub user_caches: bool,
    /// Purge every package recorded as installed by this run.
    #[serde(default = "default_true")]
    pub remove_packages: bool,
    #[serde(default = "default_apt_lists")]
    pub apt_lists: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            extra_dirs: Vec::new(),
            user_caches: true,
            remove_packages: true,
            apt_lists: default_apt_lists(),
        }
    }
}

pub struct CleanupModule;

impl Module for CleanupModule {
    fn id(&self) -> &'static str {
        "cleanup"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table(self.id()) || doc.section_enabled("pwsh") || doc.section_enabled("runner")
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: CleanupConfig = doc.deserialize_path(self.id())?.unwrap_or_default();
        if !cfg.enabled {
            return Ok(());
        }
        plan.add(Task {
            id: TASK_ID.into(),
            label: "Remove build leftovers".into(),
            module: self.id().into(),
            phase: CLEANUP_PHASE.into(),
            after: vec!["core.init".into()],
            provides: vec!["cleanup:done".into()],
        })
    }
}

impl ModuleExec for CleanupModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(TASK_ID, exec)
    }
}

/// Work and install directories of the enabled modules, then registered temp
/// dirs, user caches and extra dirs; duplicates are dropped.
pub fn directories(doc: &ConfigDoc, ctx: &ExecCtx, cfg: &CleanupConfig) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut push = |p: PathBuf| {
        if !out.contains(&p) {
            out.push(p);
        }
    };

    if doc.section_enabled("pwsh") {
        push(util::resolve_path(doc, ctx, &pwsh::load_config(doc)?.work_dir)?);
    }
    if doc.section_enabled("runner") {
        push(util::resolve_path(doc, ctx, &runner::load_config(doc)?.work_dir)?);
    }
    let dn = dotnet::load_config(doc)?;
    if dn.enabled && (doc.has_table("dotnet") || doc.section_enabled("pwsh")) {
        push(util::resolve_path(doc, ctx, &dn.install_dir)?);
    }
    for d in ctx.state().temp_dirs {
        push(d);
    }
    if cfg.user_caches {
        let home = util::home_dir()?;
        for rel in [".dotnet", ".nuget", ".local/share/NuGet"] {
            push(home.join(rel));
        }
    }
    for raw in &cfg.extra_dirs {
        push(util::resolve_path(doc, ctx, raw)?);
    }
    Ok(out)
}

pub fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(TASK_ID);
    let cfg: CleanupConfig = doc.deserialize_path("cleanup")?.unwrap_or_default();

    for dir in directories(doc, ctx, &cfg)? {
        if util::remove_path_if_exists(&dir)? {
            ctx.log(&format!("removed {}", dir.display()));
        }
    }
    // The profile script exports the SDK dir removed above.
    if let Some(script) = ctx.state().profile_script
        && util::remove_path_if_exists(&script)?
    {
        ctx.log(&format!("removed {}", script.display()));
    }

    let host = ctx.host();
    if cfg.remove_packages {
        let ledger = ctx.state().packages;
        for name in ledger.names() {
            host.remove_package(ctx, name)
                .map_err(|e| e.context(format!("failed to remove package '{name}'")))?;
            ctx.log(&format!("removed package {name}"));
        }
    }

    host.run(ctx, &invocations::apt(&["autoremove", "-y"]))?;
    host.run(ctx, &invocations::apt(&["clean"]))?;

    let lists = util::resolve_path(doc, ctx, &cfg.apt_lists)?;
    let n = clear_dir_contents(&lists)?;
    ctx.log(&format!("cleared {n} entr(ies) from {}", lists.display()));
    Ok(())
}

/// Removes everything inside `dir` but keeps `dir` itself.
pub fn clear_dir_contents(dir: &Path) -> Result<usize> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(Error::msg(format!(
                "failed to read {}: {e}",
                dir.display()
            )));
        }
    };
    let mut n = 0;
    for entry in rd {
        let entry = entry.map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?;
        if util::remove_path_if_exists(&entry.path())? {
            n += 1;
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_dir_contents_keeps_the_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let lists = tmp.path().join("lists");
        fs::create_dir_all(lists.join("partial")).expect("mkdir");
        fs::write(lists.join("archive_InRelease"), b"x").expect("write");

        assert_eq!(clear_dir_contents(&lists).expect("clear"), 2);
        assert!(lists.is_dir());
        assert_eq!(fs::read_dir(&lists).expect("read").count(), 0);
        assert_eq!(clear_dir_contents(&tmp.path().join("missing")).expect("missing"), 0);
    }

    #[test]
    fn cleanup_task_sits_in_the_cleanup_phase() {
        let doc = ConfigDoc::from_toml_str("<mem>", "[cleanup]\n").expect("parse");
        let mut plan = Plan::default();
        CleanupModule.plan(&doc, &mut plan).expect("plan");
        assert_eq!(
            plan.get(TASK_ID).map(|t| t.phase.as_str()),
            Some(CLEANUP_PHASE)
        );
    }
}

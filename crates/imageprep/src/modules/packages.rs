use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::Module;
use crate::planner::{Plan, Task};
use crate::state::Installed;

const TASK_ID: &str = "packages.install";

fn default_true() -> bool {
    true
}

fn default_packages() -> Vec<String> {
    ["build-essential", "cmake", "git", "libicu-dev", "patch"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Refresh the package index before the first install.
    #[serde(default = "default_true")]
    pub update: bool,
    #[serde(default = "default_packages")]
    pub install: Vec<String>,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update: true,
            install: default_packages(),
        }
    }
}

pub struct PackagesModule;

impl Module for PackagesModule {
    fn id(&self) -> &'static str {
        "packages"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table(self.id()) || doc.section_enabled("pwsh") || doc.section_enabled("runner")
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: PackagesConfig = doc.deserialize_path(self.id())?.unwrap_or_default();
        if !cfg.enabled {
            return Ok(());
        }
        if cfg.install.iter().any(|n| n.trim().is_empty()) {
            return Err(Error::msg("packages.install contains an empty name"));
        }

        plan.add(Task {
            id: TASK_ID.into(),
            label: "Install build prerequisites".into(),
            module: self.id().into(),
            phase: "prepare".into(),
            after: vec!["core.init".into(), "pwsh:verified?".into()],
            provides: vec!["packages:installed".into()],
        })
    }
}

impl ModuleExec for PackagesModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(TASK_ID, exec)
    }
}

fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(TASK_ID);
    let cfg: PackagesConfig = doc.deserialize_path("packages")?.unwrap_or_default();

    let host = ctx.host();
    let mut ledger = ctx.state().packages;
    let res = ledger.ensure_all(host.as_ref(), ctx, &cfg.install, cfg.update);
    // Keep whatever got installed before a failure so cleanup can undo it.
    ctx.update_state(|s| s.packages = ledger.clone());

    for (name, state) in res? {
        match state {
            Installed::Already => ctx.log(&format!("{name}: already installed")),
            Installed::Now => ctx.log(&format!("{name}: installed")),
        }
    }
    ctx.log(&format!(
        "removal list: [{}]",
        ledger.names().join(", ")
    ));
    Ok(())
}

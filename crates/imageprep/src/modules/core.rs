use crate::config::{ConfigDoc, ProvisionVars, VarOverrides};
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::Module;
use crate::planner::{Plan, Task};
use crate::workspace::WorkspaceConfig;

const SUPPORTED_TABLES: &[&str] = &[
    "vars",
    "workspace",
    "preflight",
    "packages",
    "dotnet",
    "pwsh",
    "runner",
    "stage",
    "cleanup",
];

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        for key in doc.top_level_keys() {
            if !SUPPORTED_TABLES.contains(&key) {
                return Err(Error::msg(format!(
                    "config table '{}' is not supported; use {}",
                    key,
                    SUPPORTED_TABLES.join(", ")
                )));
            }
        }

        plan.add(Task {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}

impl ModuleExec for CoreModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add("core.init", core_init)
    }
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("core.init");

    // Variables normally arrive from the command line; fall back to file + env.
    if ctx.state().vars.is_none() {
        let vars = ProvisionVars::resolve(doc, &VarOverrides::default(), |k| {
            std::env::var(k).ok()
        })?;
        ctx.update_state(|s| s.vars = Some(vars));
    }
    let vars = ctx.vars()?;
    ctx.log(&format!("arch = {}", vars.arch));
    ctx.log(&format!("pwsh_version = {}", vars.pwsh_version));
    ctx.log(&format!("dotnet_version = {}", vars.dotnet_version));
    ctx.log(&format!("context_root = {}", vars.context_root));
    ctx.log(&format!("image_os = {}", vars.image_os));

    let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    if !ws.enabled {
        return Ok(());
    }
    ctx.log(&format!("workspace.root_dir = {}", ws.root_dir));
    ctx.log(&format!("workspace.build_dir = {}", ws.build_dir));
    ctx.log(&format!("workspace.out_dir = {}", ws.out_dir));
    ctx.log(&format!("workspace.clean = {}", ws.clean.as_str()));

    let paths = crate::workspace::init_dirs(&ws)?;
    ctx.set_workspace_paths(paths.clone());
    for (name, path) in &paths.named_dirs {
        ctx.log(&format!("workspace.paths.{} = {}", name, path.display()));
    }
    Ok(())
}

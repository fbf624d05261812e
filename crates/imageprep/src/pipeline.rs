//! Plan and run a build definition end to end.

use std::sync::Arc;

use crate::config::{ConfigDoc, ProvisionVars, VarOverrides};
use crate::error::Result;
use crate::executor::{self, ExecCtx, ExecSink};
use crate::host::Host;
use crate::modules;
use crate::planner::Plan;
use crate::state::RunState;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub vars: VarOverrides,
    /// Restrict planning to these module ids (`core` is always kept).
    pub only: Option<Vec<String>>,
}

pub fn build_plan(doc: &ConfigDoc, only: Option<&[String]>) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in modules::builtin_modules() {
        let selected = m.id() == "core" || only.is_none_or(|ids| ids.iter().any(|id| id == m.id()));
        if selected && m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}

/// Resolves run variables, executes the plan and returns the final run state.
pub fn run_build(
    doc: &ConfigDoc,
    opts: &RunOptions,
    host: Arc<dyn Host>,
    sink: Arc<dyn ExecSink>,
) -> Result<RunState> {
    let vars = ProvisionVars::resolve(doc, &opts.vars, |k| std::env::var(k).ok())?;
    tracing::info!(build = %vars.build, arch = %vars.arch, pwsh = %vars.pwsh_version, "resolved run variables");

    let plan = build_plan(doc, opts.only.as_deref())?;
    let reg = executor::builtin_registry()?;
    let mut ctx = ExecCtx::new(opts.dry_run, sink, host);
    ctx.update_state(|s| s.vars = Some(vars));

    executor::execute_plan(doc, &plan, &reg, &mut ctx)?;
    Ok(ctx.state())
}

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::planner::Plan;

pub mod cleanup;
pub mod core;
pub mod dotnet;
pub mod packages;
pub mod preflight;
pub mod pwsh;
pub mod runner;
pub mod stage;
pub mod util;

pub trait Module {
    fn id(&self) -> &'static str;
    fn detect(&self, doc: &ConfigDoc) -> bool;
    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()>;
}

pub fn builtin_modules() -> Vec<Box<dyn Module>> {
    vec![
        Box::new(core::CoreModule),
        Box::new(preflight::PreflightModule),
        Box::new(packages::PackagesModule),
        Box::new(dotnet::DotnetModule),
        Box::new(pwsh::PwshModule),
        Box::new(runner::RunnerModule),
        Box::new(stage::StageModule),
        Box::new(cleanup::CleanupModule),
    ]
}

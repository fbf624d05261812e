use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::config::{ConfigDoc, ContextDirs, ProvisionVars};
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::{Module, util};
use crate::planner::{Plan, Task};

const TASK_ID: &str = "preflight.verify";

fn default_true() -> bool {
    true
}

fn default_tools() -> Vec<String> {
    ["git", "cmake", "make", "patch", "dpkg-query", "apt-get"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub check_tools: bool,
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_tools: false,
            tools: default_tools(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    NativePatch,
    PwshPatch,
    SdkTarball,
    Helper,
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileRole::NativePatch => "native patch",
            FileRole::PwshPatch => "pwsh patch",
            FileRole::SdkTarball => "sdk tarball",
            FileRole::Helper => "helper",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredFile {
    pub role: FileRole,
    pub path: PathBuf,
}

/// The fixed input set a source build needs from its context directory.
pub fn required_files(dirs: &ContextDirs, vars: &ProvisionVars) -> Vec<RequiredFile> {
    vec![
        RequiredFile {
            role: FileRole::NativePatch,
            path: dirs.patches.join(native_patch_name(vars)),
        },
        RequiredFile {
            role: FileRole::PwshPatch,
            path: dirs.patches.join(pwsh_patch_name(vars)),
        },
        RequiredFile {
            role: FileRole::SdkTarball,
            path: dirs.patches.join(sdk_tarball_name(vars)),
        },
        RequiredFile {
            role: FileRole::Helper,
            path: dirs.helpers.join("install.sh"),
        },
        RequiredFile {
            role: FileRole::Helper,
            path: dirs.helpers.join("etc-environment.sh"),
        },
    ]
}

pub fn native_patch_name(vars: &ProvisionVars) -> String {
    format!("powershell-native-{}.patch", vars.pwsh_version)
}

pub fn pwsh_patch_name(vars: &ProvisionVars) -> String {
    format!("powershell-{}.patch", vars.pwsh_version)
}

pub fn sdk_tarball_name(vars: &ProvisionVars) -> String {
    format!(
        "dotnet-sdk-{}-{}.tar.gz",
        vars.dotnet_version,
        vars.arch.dotnet_rid()
    )
}

pub fn missing_files(files: &[RequiredFile]) -> Vec<&RequiredFile> {
    files.iter().filter(|f| !f.path.is_file()).collect()
}

pub struct PreflightModule;

impl Module for PreflightModule {
    fn id(&self) -> &'static str {
        "preflight"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table(self.id()) || doc.section_enabled("pwsh")
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: PreflightConfig = doc.deserialize_path(self.id())?.unwrap_or_default();
        if !cfg.enabled {
            if doc.section_enabled("pwsh") {
                return Err(Error::msg(
                    "preflight.enabled = false is not allowed while [pwsh] is enabled",
                ));
            }
            return Ok(());
        }

        plan.add(Task {
            id: TASK_ID.into(),
            label: "Verify build inputs".into(),
            module: self.id().into(),
            phase: "verify".into(),
            after: vec!["core.init".into()],
            provides: vec!["pwsh:verified".into()],
        })
    }
}

impl ModuleExec for PreflightModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(TASK_ID, exec)
    }
}

fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(TASK_ID);
    let cfg: PreflightConfig = doc.deserialize_path("preflight")?.unwrap_or_default();

    let vars = ctx.vars()?;
    let dirs = util::context_dirs(doc, ctx)?;
    ctx.log(&format!("context dir = {}", dirs.dir.display()));

    let files = required_files(&dirs, &vars);
    let missing = missing_files(&files);
    for f in &files {
        if !missing.contains(&f) {
            ctx.log(&format!("found {}: {}", f.role, f.path.display()));
        }
    }
    for f in &missing {
        ctx.error(&format!("missing required file: {}", f.path.display()));
    }

    let mut missing_tools = Vec::new();
    if cfg.check_tools {
        for tool in &cfg.tools {
            match which::which(tool) {
                Ok(p) => ctx.log(&format!("found tool {tool}: {}", p.display())),
                Err(_) => {
                    ctx.error(&format!("missing required tool: {tool}"));
                    missing_tools.push(tool.as_str());
                }
            }
        }
    }

    if !missing.is_empty() {
        return Err(Error::msg(format!(
            "{} required file(s) missing under {}",
            missing.len(),
            dirs.dir.display()
        )));
    }
    if !missing_tools.is_empty() {
        return Err(Error::msg(format!(
            "required tools not found: {}",
            missing_tools.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::config::VarOverrides;

    fn vars() -> ProvisionVars {
        let doc = ConfigDoc::from_toml_str(
            "<mem>",
            "[vars]\narch = \"s390x\"\npwsh_version = \"v7.4.6\"\ndotnet_version = \"8.0.100\"\n",
        )
        .expect("parse");
        ProvisionVars::resolve(&doc, &VarOverrides::default(), |_| None).expect("vars")
    }

    #[test]
    fn required_set_follows_versions_and_arch() {
        let v = vars();
        let dirs = ContextDirs::new(Path::new("/ctx"), &v);
        let paths: Vec<_> = required_files(&dirs, &v)
            .into_iter()
            .map(|f| f.path.display().to_string())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/ctx/s390x/v7.4.6/patches/powershell-native-v7.4.6.patch",
                "/ctx/s390x/v7.4.6/patches/powershell-v7.4.6.patch",
                "/ctx/s390x/v7.4.6/patches/dotnet-sdk-8.0.100-linux-s390x.tar.gz",
                "/ctx/s390x/v7.4.6/helpers/install.sh",
                "/ctx/s390x/v7.4.6/helpers/etc-environment.sh",
            ]
        );
    }

    #[test]
    fn reports_every_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let v = vars();
        let dirs = ContextDirs::new(tmp.path(), &v);
        fs::create_dir_all(&dirs.helpers).expect("mkdir");
        fs::write(dirs.helpers.join("install.sh"), "#!/bin/sh\n").expect("write");

        let files = required_files(&dirs, &v);
        let missing = missing_files(&files);
        assert_eq!(missing.len(), 4);
        assert_eq!(missing[0].role, FileRole::NativePatch);
    }
}

//! Explicit run state threaded through every stage: resolved variables, the
//! packages this run installed, and the artifacts stages located.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ProvisionVars;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// Present before the run; never recorded, never removed.
    Already,
    /// Installed by this run and recorded for removal.
    Now,
}

/// Append-only list of packages installed by this run, in install order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageLedger {
    installed: Vec<String>,
}

impl PackageLedger {
    pub fn names(&self) -> &[String] {
        &self.installed
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.installed.iter().any(|n| n == name)
    }

    fn record(&mut self, name: &str) {
        if !self.contains(name) {
            self.installed.push(name.to_string());
        }
    }

    /// Install `name` unless the host already has it.
    pub fn ensure(&mut self, host: &dyn Host, ctx: &ExecCtx, name: &str) -> Result<Installed> {
        let name = checked_name(name)?;
        if self.is_present(host, ctx, name)? {
            return Ok(Installed::Already);
        }
        self.install(host, ctx, name)?;
        Ok(Installed::Now)
    }

    /// Queries each name right before it would be installed, so packages
    /// pulled in by an earlier install count as already present. The package
    /// index is refreshed once, before the first real install.
    pub fn ensure_all(
        &mut self,
        host: &dyn Host,
        ctx: &ExecCtx,
        names: &[String],
        refresh: bool,
    ) -> Result<Vec<(String, Installed)>> {
        let mut out: Vec<(String, Installed)> = Vec::new();
        let mut refreshed = !refresh;
        for raw in names {
            let name = checked_name(raw)?;
            if out.iter().any(|(n, _)| n == name) {
                continue;
            }
            if self.is_present(host, ctx, name)? {
                out.push((name.to_string(), Installed::Already));
                continue;
            }
            if !refreshed {
                host.refresh_packages(ctx)?;
                refreshed = true;
            }
            self.install(host, ctx, name)?;
            out.push((name.to_string(), Installed::Now));
        }
        Ok(out)
    }

    fn is_present(&self, host: &dyn Host, ctx: &ExecCtx, name: &str) -> Result<bool> {
        Ok(self.contains(name) || host.package_installed(ctx, name)?)
    }

    fn install(&mut self, host: &dyn Host, ctx: &ExecCtx, name: &str) -> Result<()> {
        host.install_package(ctx, name)
            .map_err(|e| e.context(format!("failed to install package '{name}'")))?;
        self.record(name);
        Ok(())
    }
}

fn checked_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::msg("package name is empty"));
    }
    Ok(name)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub vars: Option<ProvisionVars>,
    pub packages: PackageLedger,
    /// Temporary directories to remove at cleanup, in registration order.
    pub temp_dirs: Vec<PathBuf>,
    pub dotnet_root: Option<PathBuf>,
    /// Shell profile written for a release SDK install; removed with the SDK.
    pub profile_script: Option<PathBuf>,
    pub native_lib: Option<PathBuf>,
    pub pwsh_binary: Option<PathBuf>,
    pub deb_path: Option<PathBuf>,
    pub deb_sha256: Option<String>,
    pub pwsh_installed_version: Option<String>,
    pub runner_dir: Option<PathBuf>,
    pub staged_files: Vec<PathBuf>,
    pub updated_at: Option<String>,
}

impl RunState {
    pub fn register_temp_dir(&mut self, dir: &Path) {
        if !self.temp_dirs.iter().any(|d| d == dir) {
            self.temp_dirs.push(dir.to_path_buf());
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let mut snapshot = self.clone();
        snapshot.updated_at = Some(chrono::Utc::now().to_rfc3339());
        let body = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path, body)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::msg(format!("invalid run state {}: {e}", path.display())))
    }
}

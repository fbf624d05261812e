use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{Arch, ConfigDoc};
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::host::Invocation;
use crate::modules::{Module, preflight, util};
use crate::planner::{Plan, Task};

pub mod release;
pub mod version;

use release::{GithubReleases, ReleaseSource};

const TASK_ID: &str = "dotnet.install";
pub const DEFAULT_INSTALL_DIR: &str = "/tmp/dotnet";
const DEFAULT_PROFILE_SCRIPT: &str = "/etc/profile.d/dotnet.sh";

fn default_true() -> bool {
    true
}

fn default_install_dir() -> String {
    DEFAULT_INSTALL_DIR.into()
}

fn default_repo() -> String {
    release::DEFAULT_REPO.into()
}

fn default_nuget_package() -> String {
    release::DEFAULT_NUGET_PACKAGE.into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SdkSource {
    /// The SDK tarball shipped in the context directory.
    #[default]
    Tarball,
    /// An IBM GitHub release cross-checked against NuGet.
    Release,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DotnetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SdkSource,
    /// Tarball path template; defaults to the context SDK tarball.
    pub tarball: Option<String>,
    pub sha256: Option<String>,
    #[serde(default = "default_install_dir")]
    pub install_dir: String,
    /// Release tag to resolve; defaults to `v<dotnet_version>`. `latest` skips resolution.
    pub release_tag: Option<String>,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_nuget_package")]
    pub nuget_package: String,
    pub profile_script: Option<String>,
    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for DotnetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: SdkSource::Tarball,
            tarball: None,
            sha256: None,
            install_dir: default_install_dir(),
            release_tag: None,
            repo: default_repo(),
            nuget_package: default_nuget_package(),
            profile_script: None,
            verify: true,
        }
    }
}

pub fn load_config(doc: &ConfigDoc) -> Result<DotnetConfig> {
    Ok(doc.deserialize_path("dotnet")?.unwrap_or_default())
}

/// Runs `dotnet` out of `root` with `DOTNET_ROOT` and `PATH` pointing at it.
pub fn dotnet_invocation(root: &Path) -> Invocation {
    let path = std::env::var("PATH").unwrap_or_default();
    let root_s = root.to_string_lossy().into_owned();
    Invocation::new(root.join("dotnet").to_string_lossy().into_owned())
        .env("DOTNET_ROOT", root_s.clone())
        .env("PATH", format!("{root_s}:{path}"))
}

pub struct DotnetModule;

impl Module for DotnetModule {
    fn id(&self) -> &'static str {
        "dotnet"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table(self.id()) || doc.section_enabled("pwsh")
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg = load_config(doc)?;
        if !cfg.enabled {
            return Ok(());
        }
        if cfg.install_dir.trim().is_empty() {
            return Err(Error::msg("dotnet.install_dir is empty"));
        }

        plan.add(Task {
            id: TASK_ID.into(),
            label: "Install .NET SDK".into(),
            module: self.id().into(),
            phase: "prepare".into(),
            after: vec![
                "core.init".into(),
                "pwsh:verified?".into(),
                "packages:installed?".into(),
            ],
            provides: vec!["dotnet:installed".into()],
        })
    }
}

impl ModuleExec for DotnetModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(TASK_ID, exec)
    }
}

fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let cfg = load_config(doc)?;
    match cfg.source {
        SdkSource::Tarball => install(doc, ctx, &cfg, None),
        SdkSource::Release => {
            let src = GithubReleases::new(&cfg.repo)?;
            install(doc, ctx, &cfg, Some(&src))
        }
    }
}

pub fn install(
    doc: &ConfigDoc,
    ctx: &mut ExecCtx,
    cfg: &DotnetConfig,
    src: Option<&dyn ReleaseSource>,
) -> Result<()> {
    ctx.set_task(TASK_ID);
    let vars = ctx.vars()?;
    let install_dir = util::resolve_path(doc, ctx, &cfg.install_dir)?;
    ctx.update_state(|s| s.register_temp_dir(&install_dir));

    let record = match (cfg.source, src) {
        (SdkSource::Tarball, _) => {
            let tarball = match cfg.tarball.as_deref() {
                Some(raw) => util::resolve_path(doc, ctx, raw)?,
                None => util::context_dirs(doc, ctx)?
                    .patches
                    .join(preflight::sdk_tarball_name(&vars)),
            };
            if !tarball.is_file() {
                return Err(Error::msg(format!(
                    "SDK tarball not found: {}",
                    tarball.display()
                )));
            }
            let digest = util::sha256_file_hex(&tarball)?;
            if let Some(want) = cfg.sha256.as_deref().map(str::trim).filter(|s| !s.is_empty())
                && !want.eq_ignore_ascii_case(&digest)
            {
                return Err(Error::msg(format!(
                    "sha256 mismatch for {}: expected {want}, got {digest}",
                    tarball.display()
                )));
            }
            ctx.log(&format!(
                "extracting {} -> {}",
                tarball.display(),
                install_dir.display()
            ));
            util::extract_tar_gz(&tarball, &install_dir)?;
            serde_json::json!({
                "source": "tarball",
                "tarball": tarball.display().to_string(),
                "sha256": digest,
            })
        }
        (SdkSource::Release, None) => {
            return Err(Error::msg("dotnet.source = release needs a release source"));
        }
        (SdkSource::Release, Some(src)) => {
            let profile = util::resolve_path(
                doc,
                ctx,
                cfg.profile_script
                    .as_deref()
                    .unwrap_or(DEFAULT_PROFILE_SCRIPT),
            )?;
            install_release(
                ctx,
                cfg,
                src,
                vars.arch,
                &vars.dotnet_version,
                &install_dir,
                &profile,
            )?
        }
    };

    if cfg.verify {
        let host = ctx.host();
        let info = host.capture(ctx, &dotnet_invocation(&install_dir).arg("--info"))?;
        for line in info.lines().filter(|l| !l.trim().is_empty()) {
            ctx.log(line);
        }
    }

    ctx.update_state(|s| s.dotnet_root = Some(install_dir.clone()));
    let manifest = serde_json::json!({
        "install_dir": install_dir.display().to_string(),
        "install": record,
    });
    let dir = util::module_dir(doc, ctx, "dotnet")?;
    util::write_json_pretty(&dir.join("install.json"), &manifest)?;
    Ok(())
}

fn install_release(
    ctx: &ExecCtx,
    cfg: &DotnetConfig,
    src: &dyn ReleaseSource,
    arch: Arch,
    dotnet_version: &str,
    install_dir: &Path,
    profile: &Path,
) -> Result<serde_json::Value> {
    if !arch.is_ibm() {
        return Err(Error::msg(format!(
            "dotnet.source = release only serves s390x and ppc64le, not {arch}"
        )));
    }

    let requested = cfg
        .release_tag
        .clone()
        .unwrap_or_else(|| format!("v{}", crate::config::vars::strip_v(dotnet_version)));
    let tag = if requested == "latest" {
        requested.clone()
    } else {
        ctx.log(&format!("fetching releases of {}", cfg.repo));
        let releases = src.releases()?;
        let nuget = src.nuget_versions(&cfg.nuget_package)?;
        let res = release::resolve_release(&requested, &releases, &nuget)?;
        if !res.exact {
            ctx.log(&format!("using nearest release: {}", res.tag));
        }
        res.tag
    };
    ctx.log(&format!("selected release {tag}"));

    let rel = src.release(&tag)?;
    let asset = release::select_sdk_asset(&rel, arch.as_str()).ok_or_else(|| {
        Error::msg(format!("release {tag} has no SDK tarball for {arch}"))
    })?;

    let tmp = tempfile::tempdir()
        .map_err(|e| Error::msg(format!("failed to create temp dir: {e}")))?;
    let download: PathBuf = tmp.path().join(&asset.name);
    ctx.log(&format!("downloading {}", asset.name));
    src.download(&asset.browser_download_url, &download)?;
    let digest = util::sha256_file_hex(&download)?;
    ctx.log(&format!(
        "extracting {} -> {}",
        asset.name,
        install_dir.display()
    ));
    util::extract_tar_gz(&download, install_dir)?;

    write_profile_script(profile, install_dir)?;
    ctx.update_state(|s| s.profile_script = Some(profile.to_path_buf()));
    ctx.log(&format!("wrote {}", profile.display()));

    Ok(serde_json::json!({
        "source": "release",
        "repo": cfg.repo,
        "requested": requested,
        "tag": tag,
        "asset": asset.name,
        "sha256": digest,
        "profile_script": profile.display().to_string(),
    }))
}

pub fn write_profile_script(path: &Path, install_dir: &Path) -> Result<()> {
    let body = format!(
        "export DOTNET_ROOT=\"{}\"\nexport PATH=\"$DOTNET_ROOT:$PATH\"\n",
        install_dir.display()
    );
    util::write_text(path, &body)?;
    util::set_mode(path, 0o755)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_script_exports_root_and_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("profile.d/dotnet.sh");
        write_profile_script(&p, Path::new("/usr/share/dotnet")).expect("write");
        let body = std::fs::read_to_string(&p).expect("read");
        assert_eq!(
            body,
            "export DOTNET_ROOT=\"/usr/share/dotnet\"\nexport PATH=\"$DOTNET_ROOT:$PATH\"\n"
        );
        assert!(util::is_executable(&p));
    }

    #[test]
    fn dotnet_invocation_points_at_the_install_dir() {
        let inv = dotnet_invocation(Path::new("/tmp/dotnet")).arg("--info");
        assert_eq!(inv.program, "/tmp/dotnet/dotnet");
        assert_eq!(
            inv.env.get("DOTNET_ROOT").map(String::as_str),
            Some("/tmp/dotnet")
        );
        assert!(
            inv.env
                .get("PATH")
                .is_some_and(|p| p.starts_with("/tmp/dotnet:"))
        );
    }

    #[test]
    fn source_defaults_to_tarball() {
        let doc = ConfigDoc::from_toml_str("<mem>", "[dotnet]\n").expect("parse");
        let cfg = load_config(&doc).expect("cfg");
        assert_eq!(cfg.source, SdkSource::Tarball);
        assert_eq!(cfg.install_dir, DEFAULT_INSTALL_DIR);
        assert!(cfg.verify);
    }
}

use std::path::PathBuf;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::host::Invocation;
use crate::modules::pwsh::{deb_file_name, load_config, work_layout};
use crate::modules::util;

pub fn packaging_script(rid: &str) -> String {
    format!(
        "Import-Module ./build.psm1; Start-PSBootstrap -Scenario Package; \
         Start-PSBuild -Clean -Runtime {rid} -Configuration Release; \
         Start-PSPackage -Type deb"
    )
}

pub fn exec_package(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("pwsh.package");
    let cfg = load_config(doc)?;
    let vars = ctx.vars()?;
    let layout = work_layout(doc, ctx, &cfg)?;
    let pwsh_bin = ctx
        .state()
        .pwsh_binary
        .unwrap_or_else(|| layout.publish_dir().join("pwsh"));

    let inv = Invocation::new(pwsh_bin.to_string_lossy().into_owned())
        .args(["-NoProfile", "-NonInteractive", "-Command"])
        .arg(packaging_script(vars.arch.dotnet_rid()))
        .cwd(&layout.pwsh_tree);
    ctx.host().build(ctx, &inv)?;

    let name = deb_file_name(&vars);
    let built: PathBuf = {
        let top = layout.pwsh_tree.join(&name);
        if top.is_file() {
            top
        } else {
            util::find_file(&layout.pwsh_tree, |p| util::file_name_str(p) == name).ok_or_else(
                || {
                    Error::msg(format!(
                        "package {name} not found under {}",
                        layout.pwsh_tree.display()
                    ))
                },
            )?
        }
    };

    let dst = util::resolve_path(doc, ctx, &cfg.deb_path)?;
    util::copy_file(&built, &dst)?;
    let digest = util::sha256_file_hex(&dst)?;
    ctx.log(&format!("{} -> {} sha256={digest}", built.display(), dst.display()));
    ctx.update_state(|s| {
        s.deb_path = Some(dst.clone());
        s.deb_sha256 = Some(digest.clone());
    });

    let manifest = serde_json::json!({
        "package": name,
        "built": built.display().to_string(),
        "path": dst.display().to_string(),
        "sha256": digest,
        "arch": vars.arch.deb_arch(),
        "version": vars.pwsh_semver(),
    });
    let dir = util::module_dir(doc, ctx, "pwsh")?;
    util::write_json_pretty(&dir.join("package.json"), &manifest)?;
    Ok(())
}

pub fn exec_install(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("pwsh.install");
    let cfg = load_config(doc)?;
    let vars = ctx.vars()?;
    let deb = match ctx.state().deb_path {
        Some(p) => p,
        None => util::resolve_path(doc, ctx, &cfg.deb_path)?,
    };
    if !deb.is_file() {
        return Err(Error::msg(format!("package not found: {}", deb.display())));
    }

    let host = ctx.host();
    host.install_deb(ctx, &deb)?;

    if !cfg.verify {
        return Ok(());
    }
    let out = host.capture(ctx, &Invocation::new("pwsh").arg("--version"))?;
    let reported = out.trim().to_string();
    if !reported.contains(vars.pwsh_semver()) {
        return Err(Error::msg(format!(
            "installed pwsh reports '{reported}', expected {}",
            vars.pwsh_semver()
        )));
    }
    ctx.log(&format!("installed {reported}"));
    ctx.update_state(|s| s.pwsh_installed_version = Some(reported.clone()));
    Ok(())
}

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::host::Invocation;
use crate::log_sanitize::sanitize_lines;
use crate::modules::pwsh::{WorkLayout, load_config, work_layout};
use crate::modules::{dotnet, util};

const NATIVE_LIB_PREFIX: &str = "libpsl-native.so";

pub fn exec_native(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("pwsh.native");
    let cfg = load_config(doc)?;
    let layout = work_layout(doc, ctx, &cfg)?;
    let dir = layout.native_build_dir();
    if !dir.is_dir() {
        return Err(Error::msg(format!(
            "native source dir not found: {}",
            dir.display()
        )));
    }

    let host = ctx.host();
    host.build(
        ctx,
        &Invocation::new("cmake")
            .arg("-DCMAKE_BUILD_TYPE=Release")
            .arg(".")
            .cwd(&dir),
    )?;
    host.build(
        ctx,
        &Invocation::new("make")
            .arg(format!("-j{}", cfg.jobs()))
            .cwd(&dir),
    )?;

    if cfg.native_tests {
        let tests = Invocation::new("ctest").arg("--output-on-failure").cwd(&dir);
        if let Err(e) = host.build(ctx, &tests) {
            ctx.log(&format!("native tests failed, continuing: {e}"));
            dump_test_log(ctx, &dir.join("Testing/Temporary/LastTest.log"));
        }
    }

    let lib = locate_native_lib(ctx, &layout)?;
    let dst_dir = layout.pwsh_unix_dir();
    let dst = dst_dir.join(util::file_name_str(&lib));
    util::copy_file(&lib, &dst)?;
    ctx.log(&format!("copied {} -> {}", lib.display(), dst.display()));
    ctx.update_state(|s| s.native_lib = Some(dst.clone()));
    Ok(())
}

fn dump_test_log(ctx: &ExecCtx, path: &Path) {
    match fs::read_to_string(path) {
        Ok(raw) => {
            ctx.log(&format!("--- {} ---", path.display()));
            for line in sanitize_lines(&raw) {
                ctx.log(&line);
            }
        }
        Err(e) => ctx.log(&format!("no test log at {}: {e}", path.display())),
    }
}

/// Declared output path first; a search of the native tree only as fallback.
pub fn locate_native_lib(ctx: &ExecCtx, layout: &WorkLayout) -> Result<PathBuf> {
    let declared = layout.declared_native_lib();
    if declared.is_file() {
        return Ok(declared);
    }
    let found = util::find_file(&layout.native_tree, |p| {
        util::file_name_str(p).starts_with(NATIVE_LIB_PREFIX)
    })
    .ok_or_else(|| {
        Error::msg(format!(
            "native library {NATIVE_LIB_PREFIX}* not found under {}",
            layout.native_tree.display()
        ))
    })?;
    ctx.log(&format!(
        "native library not at {}, using {}",
        declared.display(),
        found.display()
    ));
    Ok(found)
}

pub fn exec_publish(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("pwsh.publish");
    let cfg = load_config(doc)?;
    let vars = ctx.vars()?;
    let layout = work_layout(doc, ctx, &cfg)?;
    let dotnet_root = match ctx.state().dotnet_root {
        Some(p) => p,
        None => util::resolve_path(doc, ctx, &dotnet::load_config(doc)?.install_dir)?,
    };

    let publish_dir = layout.publish_dir();
    let inv = dotnet::dotnet_invocation(&dotnet_root)
        .args(["publish", "src/powershell-unix", "--configuration", "Release"])
        .args(["--runtime", vars.arch.dotnet_rid()])
        .arg("--self-contained")
        .arg("-p:PublishReadyToRun=false")
        .arg("-p:ErrorOnDuplicatePublishOutputFiles=false")
        .arg("--output")
        .arg_path(&publish_dir)
        .cwd(&layout.pwsh_tree);
    ctx.host().build(ctx, &inv)?;

    let bin = locate_pwsh_binary(ctx, &layout)?;
    if !util::is_executable(&bin) {
        return Err(Error::msg(format!(
            "published pwsh is not executable: {}",
            bin.display()
        )));
    }
    ctx.log(&format!("published {}", bin.display()));
    ctx.update_state(|s| s.pwsh_binary = Some(bin.clone()));
    Ok(())
}

pub fn locate_pwsh_binary(ctx: &ExecCtx, layout: &WorkLayout) -> Result<PathBuf> {
    let declared = layout.publish_dir().join("pwsh");
    if declared.is_file() {
        return Ok(declared);
    }
    let found = util::find_file(&layout.pwsh_tree, |p| {
        util::file_name_str(p) == "pwsh"
            && p.components()
                .any(|c| matches!(c, Component::Normal(s) if s == "publish"))
    })
    .ok_or_else(|| {
        Error::msg(format!(
            "published pwsh not found under {}",
            layout.pwsh_tree.display()
        ))
    })?;
    ctx.log(&format!(
        "pwsh not at {}, using {}",
        declared.display(),
        found.display()
    ));
    Ok(found)
}

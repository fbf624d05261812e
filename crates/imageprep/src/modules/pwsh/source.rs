use std::path::{Path, PathBuf};

use crate::config::ConfigDoc;
use crate::error::Result;
use crate::executor::ExecCtx;
use crate::modules::pwsh::{Layout, PwshConfig, WorkLayout, load_config, work_layout};
use crate::modules::{preflight, util};

struct Checkout<'a> {
    url: &'a str,
    tag: &'a str,
    dest: &'a Path,
    patch: PathBuf,
}

pub fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task("pwsh.source");
    let cfg = load_config(doc)?;
    let vars = ctx.vars()?;
    let dirs = util::context_dirs(doc, ctx)?;
    let layout = work_layout(doc, ctx, &cfg)?;
    ctx.update_state(|s| s.register_temp_dir(&layout.work));

    let native_tag = cfg
        .native_tag
        .as_deref()
        .map(|t| vars.expand(t))
        .unwrap_or_else(|| vars.pwsh_version.clone());
    let native = Checkout {
        url: &cfg.native_repo,
        tag: &native_tag,
        dest: &layout.native_tree,
        patch: dirs.patches.join(preflight::native_patch_name(&vars)),
    };
    let pwsh = Checkout {
        url: &cfg.repo,
        tag: &vars.pwsh_version,
        dest: &layout.pwsh_tree,
        patch: dirs.patches.join(preflight::pwsh_patch_name(&vars)),
    };

    util::ensure_dir(&layout.work)?;
    match layout.kind {
        Layout::Flat => {
            let staged = layout.patch_dir_for(&layout.work);
            util::ensure_dir(&staged)?;
            for c in [&native, &pwsh] {
                stage_patch(ctx, &c.patch, &staged)?;
            }
            checkout(ctx, &cfg, &layout, &native)?;
            checkout(ctx, &cfg, &layout, &pwsh)?;
        }
        // The native tree is cloned into the PowerShell tree, so PowerShell goes first.
        Layout::Nested => {
            checkout(ctx, &cfg, &layout, &pwsh)?;
            checkout(ctx, &cfg, &layout, &native)?;
        }
    }
    Ok(())
}

fn stage_patch(ctx: &ExecCtx, patch: &Path, dir: &Path) -> Result<PathBuf> {
    let dst = dir.join(util::file_name_str(patch));
    util::copy_file(patch, &dst)?;
    ctx.log(&format!("staged {} -> {}", patch.display(), dst.display()));
    Ok(dst)
}

fn checkout(ctx: &ExecCtx, cfg: &PwshConfig, layout: &WorkLayout, c: &Checkout<'_>) -> Result<()> {
    if util::remove_path_if_exists(c.dest)? {
        ctx.log(&format!("removed stale {}", c.dest.display()));
    }
    let host = ctx.host();
    host.git_clone(ctx, c.url, c.tag, c.dest, cfg.recurse_submodules)?;

    let patch_dir = layout.patch_dir_for(c.dest);
    let staged = match layout.kind {
        Layout::Flat => patch_dir.join(util::file_name_str(&c.patch)),
        Layout::Nested => stage_patch(ctx, &c.patch, &patch_dir)?,
    };
    host.apply_patch(ctx, c.dest, &staged)?;
    ctx.log(&format!(
        "{} at {} patched with {}",
        c.dest.display(),
        c.tag,
        util::file_name_str(&staged)
    ));
    Ok(())
}

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::config::{ConfigDoc, ContextDirs};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub fn run_dir(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<PathBuf> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    Ok(ws.run_dir(&doc.build_name()))
}

pub fn module_dir(doc: &ConfigDoc, ctx: &ExecCtx, module_id: &str) -> Result<PathBuf> {
    let mut out = run_dir(doc, ctx)?.join("modules");
    for seg in module_id.split('.').filter(|s| !s.is_empty()) {
        out = out.join(seg);
    }
    Ok(out)
}

/// Expands `{..}` run variables, then resolves the result against the workspace.
pub fn resolve_path(doc: &ConfigDoc, ctx: &ExecCtx, raw: &str) -> Result<PathBuf> {
    let vars = ctx.vars()?;
    let ws = ctx.workspace_paths_or_init(doc)?;
    ws.resolve_config_path(&vars.expand(raw))
}

pub fn context_dirs(doc: &ConfigDoc, ctx: &ExecCtx) -> Result<ContextDirs> {
    let vars = ctx.vars()?;
    let root = resolve_path(doc, ctx, &vars.context_root)?;
    Ok(ContextDirs::new(&root, &vars))
}

pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| Error::msg("cannot determine the home directory"))
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

pub fn remove_path_if_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_dir() {
                fs::remove_dir_all(path).map_err(|e| {
                    Error::msg(format!(
                        "failed to remove directory {}: {e}",
                        path.display()
                    ))
                })?;
            } else {
                fs::remove_file(path).map_err(|e| {
                    Error::msg(format!("failed to remove file {}: {e}", path.display()))
                })?;
            }
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::msg(format!(
            "failed to inspect {} before removal: {e}",
            path.display()
        ))),
    }
}

pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .map_err(|e| Error::msg(format!("failed to stat {}: {e}", src.display())))?;
    if meta.file_type().is_symlink() {
        copy_symlink(src, dst)
    } else if meta.is_dir() {
        copy_dir_all(src, dst)
    } else {
        copy_file(src, dst)
    }
}

pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::msg(format!(
            "source is not a directory: {}",
            src.display()
        )));
    }

    ensure_dir(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&out)?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(p, &out)?;
        } else {
            copy_file(p, &out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs as unix_fs;

    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dst.display())))?;
    }
    let target = fs::read_link(src)
        .map_err(|e| Error::msg(format!("failed to read symlink {}: {e}", src.display())))?;
    unix_fs::symlink(&target, dst).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            dst.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    copy_file(src, dst)
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::msg(format!("failed to set mode on {}: {e}", path.display())))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Applies `mode` to `root` and everything below it; symlinks are left alone.
pub fn set_mode_recursive(root: &Path, mode: u32) -> Result<usize> {
    let mut n = 0;
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        set_mode(entry.path(), mode)?;
        n += 1;
    }
    Ok(n)
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// First regular file under `root` accepted by `pred`, in sorted walk order.
pub fn find_file<F>(root: &Path, pred: F) -> Option<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .find(|p| pred(p))
}

pub fn file_name_str(p: &Path) -> &str {
    p.file_name().and_then(|s| s.to_str()).unwrap_or_default()
}

/// Shell-style file name glob (`*`, `?`) as an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::msg(format!("invalid pattern '{pattern}': {e}")))
}

pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    let file = fs::File::open(archive)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", archive.display())))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest).map_err(|e| {
        Error::msg(format!(
            "failed to extract {} into {}: {e}",
            archive.display(),
            dest.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_file_names_only() {
        let re = glob_to_regex("*.sh").expect("regex");
        assert!(re.is_match("install-git.sh"));
        assert!(!re.is_match("install.sh.bak"));
        assert!(!re.is_match("dir/x.sh"));

        let re = glob_to_regex("toolset-?.json").expect("regex");
        assert!(re.is_match("toolset-2.json"));
        assert!(!re.is_match("toolset-22.json"));

        let re = glob_to_regex("a+b(1).patch").expect("regex");
        assert!(re.is_match("a+b(1).patch"));
    }

    #[test]
    fn find_file_walks_in_sorted_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("b/deep")).expect("mkdir");
        fs::create_dir_all(root.join("a")).expect("mkdir");
        fs::write(root.join("b/deep/libpsl-native.so.1"), b"x").expect("write");
        fs::write(root.join("a/libpsl-native.so"), b"x").expect("write");

        let hit = find_file(root, |p| file_name_str(p).starts_with("libpsl-native.so"))
            .expect("found");
        assert_eq!(hit, root.join("a/libpsl-native.so"));
        assert!(find_file(root, |p| file_name_str(p) == "pwsh").is_none());
    }

    #[test]
    fn remove_path_reports_whether_something_was_removed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("work");
        fs::create_dir_all(dir.join("x")).expect("mkdir");
        assert!(remove_path_if_exists(&dir).expect("remove"));
        assert!(!remove_path_if_exists(&dir).expect("remove again"));
    }

    #[test]
    fn extracts_gzipped_tarballs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = tmp.path().join("sdk.tar.gz");
        {
            let f = fs::File::create(&archive).expect("create");
            let enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
            let mut b = tar::Builder::new(enc);
            let data = b"#!/bin/sh\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            b.append_data(&mut header, "dotnet", &data[..]).expect("append");
            b.into_inner()
                .expect("tar finish")
                .finish()
                .expect("gz finish");
        }

        let dest = tmp.path().join("out");
        extract_tar_gz(&archive, &dest).expect("extract");
        assert!(is_executable(&dest.join("dotnet")));
        assert_eq!(sha256_file_hex(&dest.join("dotnet")).expect("hash").len(), 64);
    }
}

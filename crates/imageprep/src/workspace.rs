use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_true() -> bool {
    true
}

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

fn default_root_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    Build,
    Out,
    All,
}

impl CleanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanMode::None => "none",
            CleanMode::Build => "build",
            CleanMode::Out => "out",
            CleanMode::All => "all",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    #[serde(default)]
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            paths: BTreeMap::new(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    // `@alias/rest` expands from `[workspace.paths]`; absolute paths are kept;
    // anything else is rooted at the workspace root.
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::msg("empty path"));
        }

        let Some(after_at) = raw.strip_prefix('@') else {
            let pb = PathBuf::from(raw);
            return Ok(if pb.is_absolute() { pb } else { self.root.join(pb) });
        };

        let (alias, rest) = match after_at.split_once('/') {
            Some((a, r)) => (a.trim(), r),
            None => (after_at.trim(), ""),
        };
        if alias.is_empty() {
            return Err(Error::msg(format!("invalid alias path '{}'", raw)));
        }
        let base = self.named_dirs.get(alias).ok_or_else(|| {
            let known = self.named_dirs.keys().cloned().collect::<Vec<_>>().join(", ");
            Error::msg(format!(
                "unknown workspace path alias '{}' in '{}' (known: {})",
                alias, raw, known
            ))
        })?;
        Ok(if rest.is_empty() {
            base.clone()
        } else {
            base.join(rest)
        })
    }

    /// Per-build bookkeeping folder: `<out>/<build>/imageprep`.
    pub fn run_dir(&self, build: &str) -> PathBuf {
        self.out_dir.join(build).join("imageprep")
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = join_user_path(&cwd, &cfg.root_dir, false)?;
    let build_dir = join_user_path(&root, &cfg.build_dir, true)?;
    let out_dir = join_user_path(&root, &cfg.out_dir, true)?;

    let mut named_dirs = BTreeMap::<String, PathBuf>::new();
    named_dirs.insert("root".into(), root.clone());
    named_dirs.insert("build".into(), build_dir.clone());
    named_dirs.insert("out".into(), out_dir.clone());
    for (name, raw) in &cfg.paths {
        let key = name.trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::msg(format!(
                "workspace.paths key '{}' is invalid (allowed: a-zA-Z0-9_-)",
                key
            )));
        }
        if named_dirs.contains_key(key) {
            return Err(Error::msg(format!(
                "workspace.paths key '{}' is reserved",
                key
            )));
        }
        named_dirs.insert(key.to_string(), join_user_path(&root, raw, false)?);
    }

    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
        named_dirs,
    })
}

pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;

    if matches!(cfg.clean, CleanMode::Build | CleanMode::All) {
        safe_remove_dir_all(&paths.root, &paths.build_dir)?;
    }
    if matches!(cfg.clean, CleanMode::Out | CleanMode::All) {
        safe_remove_dir_all(&paths.root, &paths.out_dir)?;
    }

    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn join_user_path(base: &Path, p: &str, forbid_parent: bool) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::msg("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    if forbid_parent && pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::msg(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_aliases_and_relative_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        let mut cfg = WorkspaceConfig {
            root_dir: root.display().to_string(),
            ..Default::default()
        };
        cfg.paths.insert("ctx".into(), "inputs/context".into());

        let ws = load_paths(&cfg).expect("paths");
        assert_eq!(
            ws.resolve_config_path("scripts/build").expect("relative"),
            root.join("scripts/build")
        );
        assert_eq!(
            ws.resolve_config_path("@ctx/s390x").expect("alias"),
            root.join("inputs/context/s390x")
        );
        assert_eq!(
            ws.resolve_config_path("/opt/x").expect("absolute"),
            PathBuf::from("/opt/x")
        );
        assert!(ws.resolve_config_path("@nope/x").is_err());
        assert_eq!(ws.run_dir("pwsh"), root.join("out/pwsh/imageprep"));
    }

    #[test]
    fn reserved_and_invalid_aliases_are_rejected() {
        let mut cfg = WorkspaceConfig::default();
        cfg.paths.insert("out".into(), "x".into());
        assert!(load_paths(&cfg).is_err());

        let mut cfg = WorkspaceConfig::default();
        cfg.paths.insert("a b".into(), "x".into());
        assert!(load_paths(&cfg).is_err());
    }

    #[test]
    fn clean_build_removes_only_build_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = WorkspaceConfig {
            root_dir: tmp.path().display().to_string(),
            clean: CleanMode::Build,
            ..Default::default()
        };
        fs::create_dir_all(tmp.path().join("build/stale")).expect("mkdir build");
        fs::create_dir_all(tmp.path().join("out/keep")).expect("mkdir out");

        init_dirs(&cfg).expect("init");
        assert!(!tmp.path().join("build/stale").exists());
        assert!(tmp.path().join("build").is_dir());
        assert!(tmp.path().join("out/keep").is_dir());
    }
}

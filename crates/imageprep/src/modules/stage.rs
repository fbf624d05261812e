use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{ConfigDoc, ProvisionVars};
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::{Module, util};
use crate::planner::{Plan, Task};

const TASK_ID: &str = "stage.render";

fn default_true() -> bool {
    true
}

fn default_image_root() -> String {
    "/imagegeneration".into()
}

fn default_source_root() -> String {
    ".".into()
}

fn default_mode() -> u32 {
    0o755
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_image_root")]
    pub image_root: String,
    #[serde(default = "default_source_root")]
    pub source_root: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
    /// Empty means the default image-generation layout.
    pub copy: Vec<CopyEntry>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image_root: default_image_root(),
            source_root: default_source_root(),
            mode: default_mode(),
            copy: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CopyKind {
    /// Files in `src` whose names match `pattern`; no match is not an error.
    #[default]
    Pattern,
    File,
    Dir,
}

impl CopyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CopyKind::Pattern => "pattern",
            CopyKind::File => "file",
            CopyKind::Dir => "dir",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CopyEntry {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub kind: CopyKind,
}

impl CopyEntry {
    fn new(kind: CopyKind, src: &str, dst: &str, pattern: Option<&str>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            pattern: pattern.map(String::from),
            kind,
        }
    }
}

/// Scripts, helpers, toolset, post-generation assets and patches.
pub fn default_layout(vars: &ProvisionVars) -> Vec<CopyEntry> {
    vec![
        CopyEntry::new(CopyKind::Pattern, "scripts/build", "installers", Some("*.sh")),
        CopyEntry::new(CopyKind::Pattern, "scripts/helpers", "helpers", Some("*")),
        CopyEntry::new(
            CopyKind::File,
            &format!("toolsets/toolset-{}.json", vars.image_os),
            "installers/toolset.json",
            None,
        ),
        CopyEntry::new(CopyKind::Dir, "assets/post-gen", "post-generation", None),
        CopyEntry::new(CopyKind::Pattern, "patches", "patches", Some("*.patch")),
    ]
}

pub struct StageModule;

impl Module for StageModule {
    fn id(&self) -> &'static str {
        "stage"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table(self.id())
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: StageConfig = doc.deserialize_path(self.id())?.unwrap_or_default();
        if !cfg.enabled {
            return Ok(());
        }
        if cfg.image_root.trim().is_empty() {
            return Err(Error::msg("stage.image_root is empty"));
        }
        for (i, e) in cfg.copy.iter().enumerate() {
            if e.src.trim().is_empty() {
                return Err(Error::msg(format!("stage.copy[{i}].src is empty")));
            }
            if e.kind == CopyKind::Pattern && e.pattern.is_none() {
                return Err(Error::msg(format!(
                    "stage.copy[{i}] has kind = \"pattern\" but no pattern"
                )));
            }
        }

        plan.add(Task {
            id: TASK_ID.into(),
            label: "Stage image-generation tree".into(),
            module: self.id().into(),
            phase: "render".into(),
            after: vec![
                "core.init".into(),
                "pwsh:installed?".into(),
                "runner:installed?".into(),
            ],
            provides: vec!["stage:content".into()],
        })
    }
}

impl ModuleExec for StageModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(TASK_ID, exec)
    }
}

fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_task(TASK_ID);
    let cfg: StageConfig = doc.deserialize_path("stage")?.unwrap_or_default();
    let vars = ctx.vars()?;
    let image_root = util::resolve_path(doc, ctx, &cfg.image_root)?;
    let source_root = util::resolve_path(doc, ctx, &cfg.source_root)?;
    util::ensure_dir(&image_root)?;

    let entries = if cfg.copy.is_empty() {
        default_layout(&vars)
    } else {
        cfg.copy.clone()
    };

    let mut copied: Vec<PathBuf> = Vec::new();
    let mut entries_manifest = Vec::new();
    for e in &entries {
        let src = source_root.join(vars.expand(e.src.trim()));
        let dst = image_root.join(vars.expand(e.dst.trim()).trim_start_matches('/'));
        let files = stage_entry(ctx, e, &src, &dst)?;
        entries_manifest.push(serde_json::json!({
            "kind": e.kind.as_str(),
            "src": src.display().to_string(),
            "dst": dst.display().to_string(),
            "pattern": e.pattern,
            "files": files.len(),
        }));
        copied.extend(files);
    }

    let n = util::set_mode_recursive(&image_root, cfg.mode)?;
    ctx.log(&format!(
        "staged {} file(s); mode {:o} applied to {n} path(s)",
        copied.len(),
        cfg.mode
    ));

    let dir = util::module_dir(doc, ctx, "stage")?;
    let manifest = serde_json::json!({
        "image_root": image_root.display().to_string(),
        "entries": entries_manifest,
        "files": copied.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
    });
    util::write_json_pretty(&dir.join("manifest.json"), &manifest)?;
    ctx.log(&format!("wrote {}", dir.join("manifest.json").display()));
    ctx.update_state(|s| s.staged_files = copied);
    Ok(())
}

/// Copies one entry and returns the destination files it produced.
pub fn stage_entry(ctx: &ExecCtx, e: &CopyEntry, src: &Path, dst: &Path) -> Result<Vec<PathBuf>> {
    match e.kind {
        CopyKind::Pattern => {
            let pattern = e.pattern.as_deref().unwrap_or("*");
            let re = util::glob_to_regex(pattern)?;
            let mut names: Vec<String> = match fs::read_dir(src) {
                Ok(rd) => rd
                    .filter_map(|ent| ent.ok())
                    .filter(|ent| ent.file_type().is_ok_and(|t| t.is_file()))
                    .filter_map(|ent| ent.file_name().into_string().ok())
                    .filter(|n| re.is_match(n))
                    .collect(),
                Err(_) => Vec::new(),
            };
            if names.is_empty() {
                ctx.log(&format!("{}/{pattern} not found", src.display()));
                return Ok(Vec::new());
            }
            names.sort();
            util::ensure_dir(dst)?;
            let mut out = Vec::with_capacity(names.len());
            for name in names {
                let to = dst.join(&name);
                util::copy_file(&src.join(&name), &to)?;
                out.push(to);
            }
            Ok(out)
        }
        CopyKind::File => {
            if !src.is_file() {
                return Err(Error::msg(format!(
                    "required file not found: {}",
                    src.display()
                )));
            }
            util::copy_file(src, dst)?;
            Ok(vec![dst.to_path_buf()])
        }
        CopyKind::Dir => {
            if !src.is_dir() {
                return Err(Error::msg(format!(
                    "required directory not found: {}",
                    src.display()
                )));
            }
            util::copy_dir_all(src, dst)?;
            Ok(walkdir::WalkDir::new(dst)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|ent| ent.ok())
                .filter(|ent| !ent.file_type().is_dir())
                .map(|ent| ent.into_path())
                .collect())
        }
    }
}

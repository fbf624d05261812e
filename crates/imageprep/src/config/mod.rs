use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

pub mod vars;

pub use vars::{Arch, ContextDirs, ProvisionVars, VarOverrides};

/// A fully resolved build definition (after `extends` and `imports`).
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn from_toml_str(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    /// Build name used for per-run output folders: the definition's file stem.
    pub fn build_name(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty() && !s.starts_with('<'))
            .unwrap_or("build")
            .to_string()
    }

    pub fn table(&self, key: &str) -> Option<&toml::value::Table> {
        self.value.as_table().and_then(|t| t.get(key)?.as_table())
    }

    pub fn has_table(&self, key: &str) -> bool {
        self.table(key).is_some()
    }

    pub fn top_level_keys(&self) -> Vec<&str> {
        self.value
            .as_table()
            .map(|t| t.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let owned = v.clone();
        let parsed = owned
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    /// Section is present and not switched off with `enabled = false`.
    pub fn section_enabled(&self, key: &str) -> bool {
        let Some(tbl) = self.table(key) else {
            return false;
        };
        tbl.get("enabled").and_then(Value::as_bool).unwrap_or(true)
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

pub fn merge(base: &mut Value, overlay: Value) {
    merge_values(base, overlay);
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(arr) = table.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

// Imports may appear at any table level; imported values are merged first and
// the local table wins.
fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = parse_imports(file_path, tbl)?;
    tbl.remove("imports");
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value_inner(&resolve_ref_path(file_path, &imp), stack)?;
            merge_values(&mut acc, loaded);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    inline_imports(path, &mut value, stack)?;
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    tracing::debug!(path = %path.display(), "loading build definition");
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_with_local_precedence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::write(
            root.join("base.toml"),
            "[vars]\narch = \"s390x\"\npwsh_version = \"v7.4.0\"\n",
        )
        .expect("write base");
        fs::write(
            root.join("packages.toml"),
            "install = [\"cmake\", \"git\"]\nupdate = false\n",
        )
        .expect("write packages");
        fs::write(
            root.join("pwsh.toml"),
            r#"
extends = "base.toml"

[vars]
pwsh_version = "v7.4.6"

[packages]
imports = ["packages.toml"]
update = true
"#,
        )
        .expect("write child");

        let doc = load(&root.join("pwsh.toml")).expect("load");
        assert_eq!(doc.build_name(), "pwsh");
        assert_eq!(
            doc.value_path("vars.arch").and_then(Value::as_str),
            Some("s390x")
        );
        assert_eq!(
            doc.value_path("vars.pwsh_version").and_then(Value::as_str),
            Some("v7.4.6")
        );
        assert_eq!(
            doc.value_path("packages.update").and_then(Value::as_bool),
            Some(true)
        );
        assert!(doc.value_path("packages.imports").is_none());
        assert_eq!(
            doc.value_path("packages.install")
                .and_then(Value::as_array)
                .map(|a| a.len()),
            Some(2)
        );
    }

    #[test]
    fn import_cycles_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::write(root.join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(root.join("b.toml"), "extends = \"a.toml\"\n").expect("write b");

        let err = load(&root.join("a.toml")).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn section_enabled_defaults_to_true() {
        let doc = ConfigDoc::from_toml_str(
            "<mem>",
            "[pwsh]\n[runner]\nenabled = false\n",
        )
        .expect("parse");
        assert!(doc.section_enabled("pwsh"));
        assert!(!doc.section_enabled("runner"));
        assert!(!doc.section_enabled("stage"));
        assert_eq!(doc.build_name(), "build");
    }
}

//! Run variables: target architecture, version identifiers and the context
//! root, layered from defaults, the `[vars]` table, the environment and the
//! command line (later layers win).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

pub const DEFAULT_PWSH_VERSION: &str = "v7.4.6";
pub const DEFAULT_DOTNET_VERSION: &str = "8.0.404";
pub const DEFAULT_CONTEXT_ROOT: &str = "context";
pub const DEFAULT_IMAGE_OS: &str = "ubuntu24";

pub const ENV_ARCH: &str = "IMAGEPREP_ARCH";
pub const ENV_PWSH_VERSION: &str = "IMAGEPREP_PWSH_VERSION";
pub const ENV_DOTNET_VERSION: &str = "IMAGEPREP_DOTNET_VERSION";
pub const ENV_CONTEXT_ROOT: &str = "IMAGEPREP_CONTEXT_ROOT";
pub const ENV_IMAGE_OS: &str = "IMAGEPREP_IMAGE_OS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Arch {
    X64,
    Arm64,
    S390x,
    Ppc64le,
}

impl Arch {
    pub fn host() -> Result<Self> {
        std::env::consts::ARCH.parse()
    }

    /// `uname -m` spelling, used for context directories.
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X64 => "x86_64",
            Arch::Arm64 => "aarch64",
            Arch::S390x => "s390x",
            Arch::Ppc64le => "ppc64le",
        }
    }

    pub fn deb_arch(self) -> &'static str {
        match self {
            Arch::X64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::S390x => "s390x",
            Arch::Ppc64le => "ppc64el",
        }
    }

    pub fn dotnet_rid(self) -> &'static str {
        match self {
            Arch::X64 => "linux-x64",
            Arch::Arm64 => "linux-arm64",
            Arch::S390x => "linux-s390x",
            Arch::Ppc64le => "linux-ppc64le",
        }
    }

    /// Architectures served by the IBM .NET SDK builds.
    pub fn is_ibm(self) -> bool {
        matches!(self, Arch::S390x | Arch::Ppc64le)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Arch::X64),
            "aarch64" | "arm64" => Ok(Arch::Arm64),
            "s390x" => Ok(Arch::S390x),
            "ppc64le" | "ppc64el" => Ok(Arch::Ppc64le),
            other => Err(Error::msg(format!("unsupported architecture '{other}'"))),
        }
    }
}

impl From<Arch> for String {
    fn from(a: Arch) -> Self {
        a.as_str().to_string()
    }
}

impl TryFrom<String> for Arch {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct VarsConfig {
    arch: Option<String>,
    pwsh_version: Option<String>,
    dotnet_version: Option<String>,
    context_root: Option<String>,
    image_os: Option<String>,
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct VarOverrides {
    pub arch: Option<String>,
    pub pwsh_version: Option<String>,
    pub dotnet_version: Option<String>,
    pub context_root: Option<String>,
    pub image_os: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionVars {
    pub build: String,
    pub arch: Arch,
    pub pwsh_version: String,
    pub dotnet_version: String,
    pub context_root: String,
    pub image_os: String,
}

impl ProvisionVars {
    pub fn resolve(
        doc: &ConfigDoc,
        cli: &VarOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let file: VarsConfig = doc.deserialize_path("vars")?.unwrap_or_default();
        let env_val = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let pick = |cli: &Option<String>, key: &str, file: &Option<String>| -> Option<String> {
            cli.clone()
                .or_else(|| env_val(key))
                .or_else(|| file.clone())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let arch = match pick(&cli.arch, ENV_ARCH, &file.arch) {
            Some(raw) => raw.parse()?,
            None => Arch::host()?,
        };
        let pwsh_version = pick(&cli.pwsh_version, ENV_PWSH_VERSION, &file.pwsh_version)
            .unwrap_or_else(|| DEFAULT_PWSH_VERSION.into());
        let dotnet_version = pick(&cli.dotnet_version, ENV_DOTNET_VERSION, &file.dotnet_version)
            .unwrap_or_else(|| DEFAULT_DOTNET_VERSION.into());
        let context_root = pick(&cli.context_root, ENV_CONTEXT_ROOT, &file.context_root)
            .unwrap_or_else(|| DEFAULT_CONTEXT_ROOT.into());
        let image_os = pick(&cli.image_os, ENV_IMAGE_OS, &file.image_os)
            .unwrap_or_else(|| DEFAULT_IMAGE_OS.into());

        for (name, v) in [
            ("pwsh_version", &pwsh_version),
            ("dotnet_version", &dotnet_version),
            ("image_os", &image_os),
        ] {
            validate_path_segment(name, v)?;
        }

        Ok(Self {
            build: doc.build_name(),
            arch,
            pwsh_version,
            dotnet_version,
            context_root,
            image_os,
        })
    }

    /// Version without the leading `v` (package file names use this form).
    pub fn pwsh_semver(&self) -> &str {
        strip_v(&self.pwsh_version)
    }

    pub fn expand(&self, raw: &str) -> String {
        raw.replace("{build}", &self.build)
            .replace("{arch}", self.arch.as_str())
            .replace("{deb_arch}", self.arch.deb_arch())
            .replace("{rid}", self.arch.dotnet_rid())
            .replace("{pwsh_version}", &self.pwsh_version)
            .replace("{pwsh_semver}", self.pwsh_semver())
            .replace("{dotnet_version}", &self.dotnet_version)
            .replace("{image_os}", &self.image_os)
    }
}

pub fn strip_v(version: &str) -> &str {
    version.strip_prefix('v').unwrap_or(version)
}

fn validate_path_segment(name: &str, v: &str) -> Result<()> {
    if v == "." || v == ".." || v.contains('/') || v.contains('\\') {
        return Err(Error::msg(format!(
            "{name} '{v}' is not usable as a path segment"
        )));
    }
    Ok(())
}

/// `<root>/<arch>/<version>` with its `patches` and `helpers` folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDirs {
    pub dir: PathBuf,
    pub patches: PathBuf,
    pub helpers: PathBuf,
}

impl ContextDirs {
    pub fn new(root: &Path, vars: &ProvisionVars) -> Self {
        let dir = root.join(vars.arch.as_str()).join(&vars.pwsh_version);
        Self {
            patches: dir.join("patches"),
            helpers: dir.join("helpers"),
            dir,
        }
    }
}
